//! Transport collaborator contract and an in-memory hub.
//!
//! The core never talks to a relay directly: it publishes envelopes and
//! consumes subscription channels. Delivery is at-least-once, unordered,
//! and possibly duplicated; everything downstream is guarded accordingly.

use crate::envelope::Envelope;
use crate::error::{ProtocolError, Result};
use crate::model::MessageKind;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::warn;

const SUBSCRIPTION_BUFFER: usize = 64;

/// Selects envelopes by kind and tag predicates. Empty fields match
/// everything.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    pub kinds: Vec<u16>,
    pub message_types: Vec<MessageKind>,
    pub references: Vec<String>,
    pub targets: Vec<String>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kind(mut self, kind: u16) -> Self {
        self.kinds.push(kind);
        self
    }

    pub fn message_type(mut self, message_type: MessageKind) -> Self {
        self.message_types.push(message_type);
        self
    }

    pub fn reference(mut self, event_id: impl Into<String>) -> Self {
        self.references.push(event_id.into());
        self
    }

    pub fn target(mut self, identity: impl Into<String>) -> Self {
        self.targets.push(identity.into());
        self
    }

    pub fn matches(&self, envelope: &Envelope) -> bool {
        if !self.kinds.is_empty() && !self.kinds.contains(&envelope.kind) {
            return false;
        }
        if !self.message_types.is_empty() {
            match envelope.message_kind() {
                Some(kind) if self.message_types.contains(&kind) => {}
                _ => return false,
            }
        }
        if !self.references.is_empty() {
            match envelope.reference() {
                Some(r) if self.references.iter().any(|want| want == r) => {}
                _ => return false,
            }
        }
        if !self.targets.is_empty() && !self.targets.iter().any(|t| envelope.targets_identity(t)) {
            return false;
        }
        true
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn publish(&self, envelope: &Envelope) -> Result<()>;

    /// Open a subscription; matching envelopes arrive on the returned
    /// channel, one per delivery.
    async fn subscribe(&self, filter: Filter) -> Result<mpsc::Receiver<Envelope>>;
}

/// Process-local hub: every published envelope is delivered to every
/// matching subscription. Backs the dev harness and the test suite.
#[derive(Default)]
pub struct LocalHub {
    subscriptions: Mutex<Vec<(Filter, mpsc::Sender<Envelope>)>>,
}

impl LocalHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl Transport for LocalHub {
    async fn publish(&self, envelope: &Envelope) -> Result<()> {
        let matching: Vec<mpsc::Sender<Envelope>> = {
            let mut subscriptions = self
                .subscriptions
                .lock()
                .map_err(|_| ProtocolError::Transport("hub lock poisoned".to_string()))?;
            subscriptions.retain(|(_, tx)| !tx.is_closed());
            subscriptions
                .iter()
                .filter(|(filter, _)| filter.matches(envelope))
                .map(|(_, tx)| tx.clone())
                .collect()
        };
        for tx in matching {
            if tx.send(envelope.clone()).await.is_err() {
                warn!(envelope_id = %envelope.id, "subscriber dropped before delivery");
            }
        }
        Ok(())
    }

    async fn subscribe(&self, filter: Filter) -> Result<mpsc::Receiver<Envelope>> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        self.subscriptions
            .lock()
            .map_err(|_| ProtocolError::Transport("hub lock poisoned".to_string()))?
            .push((filter, tx));
        Ok(rx)
    }
}

/// Fan-out over several relay endpoints: publish succeeds if any endpoint
/// accepted the envelope, and subscriptions merge deliveries from all of
/// them into one channel.
pub struct RelayPool {
    relays: Vec<Arc<dyn Transport>>,
}

impl RelayPool {
    pub fn new(relays: Vec<Arc<dyn Transport>>) -> Self {
        Self { relays }
    }
}

#[async_trait]
impl Transport for RelayPool {
    async fn publish(&self, envelope: &Envelope) -> Result<()> {
        let mut accepted = false;
        for relay in &self.relays {
            match relay.publish(envelope).await {
                Ok(()) => accepted = true,
                Err(e) => warn!(error = %e, "relay rejected publish"),
            }
        }
        if accepted {
            Ok(())
        } else {
            Err(ProtocolError::Transport("no relay accepted the envelope".to_string()))
        }
    }

    async fn subscribe(&self, filter: Filter) -> Result<mpsc::Receiver<Envelope>> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        for relay in &self.relays {
            let mut relay_rx = relay.subscribe(filter.clone()).await?;
            let tx = tx.clone();
            tokio::spawn(async move {
                while let Some(envelope) = relay_rx.recv().await {
                    if tx.send(envelope).await.is_err() {
                        break;
                    }
                }
            });
        }
        Ok(rx)
    }
}
