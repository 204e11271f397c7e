//! Rider negotiation state machine.
//!
//! One record per outstanding request: collect bids for a fixed window,
//! select a winner, commit to it, then follow the ride through to the
//! signed settlement receipt. All inbound validation failures are silent
//! drops; only a local signing failure at settlement aborts the agent.

use crate::config::AppConfig;
use crate::crypto::{self, Keypair};
use crate::envelope::{
    tag_message_type, tag_reference, tag_target, tag_version, unix_now, Envelope,
};
use crate::error::Result;
use crate::model::{
    InvoiceRequest, InvoiceResponse, MessageKind, Payload, PaymentMode, RideAccept, RideBid,
    RideRequest, RideStage, RideStatus,
};
use crate::receipt;
use crate::selection::{select_winner, BidCandidate, CandidateTable};
use crate::timer::TimerRegistry;
use crate::transport::{Filter, Transport};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RiderPhase {
    Requested,
    Collecting,
    Selected,
    Accepted,
    InvoiceExchanged,
    AwaitingCompletion,
    Settled,
    Abandoned,
}

/// The winning bid the rider committed to at acceptance time.
#[derive(Debug, Clone)]
pub struct CommittedBid {
    pub bid_id: String,
    pub driver_pubkey: String,
    pub total_sats: u64,
    pub envelope_id: String,
}

pub struct RiderNegotiation {
    pub request: RideRequest,
    pub request_event_id: String,
    pub phase: RiderPhase,
    pub candidates: CandidateTable,
    pub committed: Option<CommittedBid>,
    pub statuses: HashSet<RideStage>,
    pub invoice: Option<InvoiceResponse>,
}

#[derive(Debug, Clone)]
pub enum RiderEvent {
    Inbound(Envelope),
    WindowClosed { request_id: String },
}

pub struct RiderAgent {
    keys: Keypair,
    transport: Arc<dyn Transport>,
    timers: TimerRegistry<RiderEvent>,
    bid_window: Duration,
    negotiations: HashMap<String, RiderNegotiation>,
}

impl RiderAgent {
    pub fn new(
        keys: Keypair,
        transport: Arc<dyn Transport>,
        config: &AppConfig,
        events_tx: mpsc::Sender<RiderEvent>,
    ) -> Self {
        Self {
            keys,
            transport,
            timers: TimerRegistry::new(events_tx),
            bid_window: Duration::from_secs(config.negotiation.bid_window_secs),
            negotiations: HashMap::new(),
        }
    }

    pub fn identity(&self) -> &str {
        self.keys.public_hex()
    }

    /// Everything addressed to this rider. Requests go out, never in.
    pub fn inbound_filter(&self) -> Filter {
        Filter::new()
            .message_type(MessageKind::RideBid)
            .message_type(MessageKind::InvoiceResponse)
            .message_type(MessageKind::RideStatus)
            .target(self.keys.public_hex())
    }

    pub fn negotiation(&self, request_id: &str) -> Option<&RiderNegotiation> {
        self.negotiations.get(request_id)
    }

    /// Publish a new ride request and start collecting bids for it.
    pub async fn open_request(&mut self, request: RideRequest) -> Result<String> {
        request.validate()?;
        let request_id = request.id.clone();
        let tags = vec![tag_message_type(MessageKind::RideRequest), tag_version()];
        let envelope = self.keys.seal(tags, serde_json::to_string(&request)?, unix_now())?;

        let mut record = RiderNegotiation {
            request,
            request_event_id: envelope.id.clone(),
            phase: RiderPhase::Requested,
            candidates: CandidateTable::new(),
            committed: None,
            statuses: HashSet::new(),
            invoice: None,
        };

        self.transport.publish(&envelope).await?;
        record.phase = RiderPhase::Collecting;
        self.timers.schedule(
            &format!("window:{}", request_id),
            self.bid_window,
            RiderEvent::WindowClosed { request_id: request_id.clone() },
        );
        info!(request_id = %request_id, window_secs = self.bid_window.as_secs(), "ride request published, collecting bids");

        self.negotiations.insert(request_id, record);
        Ok(envelope.id)
    }

    pub async fn handle_event(&mut self, event: RiderEvent) -> Result<()> {
        match event {
            RiderEvent::Inbound(envelope) => self.on_envelope(envelope).await,
            RiderEvent::WindowClosed { request_id } => self.close_window(&request_id).await,
        }
    }

    /// Cancel every pending timer. Must run before the transport is
    /// released so nothing is emitted after teardown begins.
    pub fn shutdown(&mut self) {
        self.timers.cancel_all();
        debug!("rider timers cancelled");
    }

    async fn on_envelope(&mut self, envelope: Envelope) -> Result<()> {
        if !crypto::authenticate(&envelope) {
            warn!(envelope_id = %envelope.id, "dropping unauthenticated envelope");
            return Ok(());
        }
        let Some(kind) = envelope.message_kind() else {
            debug!(envelope_id = %envelope.id, "dropping envelope without a known message type");
            return Ok(());
        };
        let payload = match Payload::parse(kind, &envelope.content) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(envelope_id = %envelope.id, error = %e, "dropping malformed payload");
                return Ok(());
            }
        };

        match payload {
            Payload::RideBid(bid) => {
                self.on_bid(&envelope, bid);
                Ok(())
            }
            Payload::InvoiceResponse(response) => {
                self.on_invoice_response(&envelope, response);
                Ok(())
            }
            Payload::RideStatus(status) => self.on_status(&envelope, status).await,
            other => {
                debug!(kind = ?other.kind(), "rider ignores this message kind");
                Ok(())
            }
        }
    }

    fn on_bid(&mut self, envelope: &Envelope, bid: RideBid) {
        let Some(record) = self.negotiations.get_mut(&bid.request_id) else {
            debug!(request_id = %bid.request_id, "bid for unknown request");
            return;
        };
        if record.phase != RiderPhase::Collecting {
            debug!(bid_id = %bid.bid_id, "bid outside the collection window");
            return;
        }
        if let Some(reference) = envelope.reference() {
            if reference != record.request_event_id {
                warn!(bid_id = %bid.bid_id, "bid references a different request event");
                return;
            }
        }

        info!(bid_id = %bid.bid_id, total_sats = bid.total_sats, eta_mins = bid.eta_mins, "bid received");
        let key = bid.bid_id.clone();
        record.candidates.insert(
            key,
            BidCandidate {
                bid,
                envelope_id: envelope.id.clone(),
                driver_pubkey: envelope.origin.clone(),
            },
        );
    }

    async fn close_window(&mut self, request_id: &str) -> Result<()> {
        let Some(record) = self.negotiations.get_mut(request_id) else {
            return Ok(());
        };
        if record.phase != RiderPhase::Collecting {
            debug!(request_id, "window timer fired outside collection");
            return Ok(());
        }

        let Some(winner) = select_winner(&record.candidates).cloned() else {
            record.phase = RiderPhase::Abandoned;
            warn!(request_id, "window closed with no valid bids, negotiation abandoned");
            return Ok(());
        };
        record.phase = RiderPhase::Selected;
        info!(
            request_id,
            bid_id = %winner.bid.bid_id,
            total_sats = winner.bid.total_sats,
            "winning bid selected"
        );

        let accept = RideAccept {
            request_id: request_id.to_string(),
            bid_id: winner.bid.bid_id.clone(),
            rider_pubkey: self.keys.public_hex().to_string(),
            driver_pubkey: winner.driver_pubkey.clone(),
        };
        let tags = vec![
            tag_message_type(MessageKind::RideAccept),
            tag_version(),
            tag_reference(&winner.envelope_id),
            tag_target(&winner.driver_pubkey),
        ];
        let envelope = self.keys.seal(tags, serde_json::to_string(&accept)?, unix_now())?;
        self.transport.publish(&envelope).await?;

        record.committed = Some(CommittedBid {
            bid_id: winner.bid.bid_id.clone(),
            driver_pubkey: winner.driver_pubkey.clone(),
            total_sats: winner.bid.total_sats,
            envelope_id: winner.envelope_id.clone(),
        });
        record.phase = RiderPhase::Accepted;
        info!(bid_id = %winner.bid.bid_id, "acceptance published");

        // Ask for payment instructions right away, preferring Lightning.
        let payment_mode = if winner.bid.payment_modes_supported.contains(&PaymentMode::Ln) {
            PaymentMode::Ln
        } else {
            winner.bid.payment_modes_supported[0]
        };
        let invoice_request = InvoiceRequest {
            request_id: request_id.to_string(),
            bid_id: winner.bid.bid_id.clone(),
            amount_sats: winner.bid.total_sats,
            payment_mode,
        };
        let tags = vec![
            tag_message_type(MessageKind::InvoiceRequest),
            tag_version(),
            tag_reference(&winner.envelope_id),
            tag_target(&winner.driver_pubkey),
        ];
        let envelope = self.keys.seal(tags, serde_json::to_string(&invoice_request)?, unix_now())?;
        self.transport.publish(&envelope).await?;
        info!(bid_id = %winner.bid.bid_id, mode = ?payment_mode, "invoice requested");

        Ok(())
    }

    fn on_invoice_response(&mut self, envelope: &Envelope, response: InvoiceResponse) {
        let Some(record) = self.negotiations.get_mut(&response.request_id) else {
            debug!(request_id = %response.request_id, "invoice response for unknown request");
            return;
        };
        let Some(committed) = record.committed.clone() else {
            debug!("invoice response before acceptance");
            return;
        };
        if response.bid_id != committed.bid_id {
            warn!(bid_id = %response.bid_id, "invoice response for a bid we did not accept");
            return;
        }
        if envelope.origin != committed.driver_pubkey {
            warn!("invoice response from wrong counterpart");
            return;
        }
        if response.amount_sats != committed.total_sats {
            warn!(
                expected = committed.total_sats,
                got = response.amount_sats,
                "invoice amount differs from committed total"
            );
            return;
        }

        if record.invoice.is_none() {
            info!(bid_id = %response.bid_id, "payment instruction received");
            record.invoice = Some(response);
        } else {
            debug!("duplicate invoice response ignored");
        }
        if record.phase == RiderPhase::Accepted {
            record.phase = RiderPhase::InvoiceExchanged;
        }
    }

    async fn on_status(&mut self, envelope: &Envelope, status: RideStatus) -> Result<()> {
        let Some(record) = self.negotiations.get_mut(&status.request_id) else {
            debug!(request_id = %status.request_id, "status for unknown request");
            return Ok(());
        };
        let Some(committed) = record.committed.clone() else {
            debug!("status before acceptance");
            return Ok(());
        };
        if status.bid_id != committed.bid_id {
            warn!(bid_id = %status.bid_id, "status for a bid we did not accept");
            return Ok(());
        }
        if envelope.origin != committed.driver_pubkey {
            warn!("status from wrong counterpart");
            return Ok(());
        }
        if status.rider_pubkey != self.keys.public_hex()
            || status.driver_pubkey != committed.driver_pubkey
        {
            warn!("status identities do not match the negotiation");
            return Ok(());
        }
        if record.phase == RiderPhase::Settled {
            debug!(stage = ?status.status, "status after settlement ignored");
            return Ok(());
        }

        if record.statuses.insert(status.status) {
            info!(stage = ?status.status, bid_id = %status.bid_id, "ride status update");
        } else {
            debug!(stage = ?status.status, "duplicate status ignored");
        }

        match status.status {
            RideStage::EnRoute | RideStage::Arrived => {
                if matches!(record.phase, RiderPhase::Accepted | RiderPhase::InvoiceExchanged) {
                    record.phase = RiderPhase::AwaitingCompletion;
                }
                Ok(())
            }
            RideStage::Completed => {
                let timestamp = unix_now();
                // A signing failure here is fatal and must surface.
                let receipt = receipt::build_signed(
                    &status.request_id,
                    &committed.bid_id,
                    committed.total_sats,
                    timestamp,
                    &self.keys,
                    &committed.driver_pubkey,
                )?;
                let tags = vec![
                    tag_message_type(MessageKind::RideReceipt),
                    tag_version(),
                    tag_reference(&envelope.id),
                    tag_target(&committed.driver_pubkey),
                    tag_target(self.keys.public_hex()),
                ];
                let envelope =
                    self.keys.seal(tags, serde_json::to_string(&receipt)?, timestamp)?;
                self.transport.publish(&envelope).await?;
                record.phase = RiderPhase::Settled;
                info!(bid_id = %committed.bid_id, total_sats = committed.total_sats, "receipt published, negotiation settled");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LocalHub;

    fn sample_request() -> RideRequest {
        RideRequest::new(
            "dp3w".to_string(),
            "dp3x".to_string(),
            20,
            25000,
            12,
            vec![PaymentMode::Ln, PaymentMode::Onchain],
        )
    }

    fn sealed_bid(
        driver: &Keypair,
        rider: &str,
        request_event_id: &str,
        bid: &RideBid,
    ) -> Envelope {
        driver
            .seal(
                vec![
                    tag_message_type(MessageKind::RideBid),
                    tag_version(),
                    tag_reference(request_event_id),
                    tag_target(rider),
                ],
                serde_json::to_string(bid).unwrap(),
                unix_now(),
            )
            .unwrap()
    }

    fn bid(request_id: &str, bid_id: &str, total_sats: u64, eta_mins: u64) -> RideBid {
        RideBid {
            request_id: request_id.to_string(),
            bid_id: bid_id.to_string(),
            total_sats,
            deposit_sats: 500,
            eta_mins,
            payment_modes_supported: vec![PaymentMode::Ln],
        }
    }

    #[tokio::test]
    async fn test_bids_collect_and_upsert() {
        let (tx, _rx) = mpsc::channel(8);
        let hub = LocalHub::new();
        let mut rider =
            RiderAgent::new(Keypair::generate(), hub.clone(), &AppConfig::default(), tx);
        let driver = Keypair::generate();

        let request = sample_request();
        let request_id = request.id.clone();
        let request_event_id = rider.open_request(request).await.unwrap();

        let first = bid(&request_id, "b1", 9000, 8);
        let env = sealed_bid(&driver, rider.identity(), &request_event_id, &first);
        rider.handle_event(RiderEvent::Inbound(env)).await.unwrap();

        // Same bid id again overwrites rather than duplicating.
        let revised = bid(&request_id, "b1", 7000, 8);
        let env = sealed_bid(&driver, rider.identity(), &request_event_id, &revised);
        rider.handle_event(RiderEvent::Inbound(env)).await.unwrap();

        let record = rider.negotiation(&request_id).unwrap();
        assert_eq!(record.phase, RiderPhase::Collecting);
        assert_eq!(record.candidates.len(), 1);
        assert_eq!(record.candidates["b1"].bid.total_sats, 7000);
    }

    #[tokio::test]
    async fn test_empty_window_abandons() {
        let (tx, _rx) = mpsc::channel(8);
        let hub = LocalHub::new();
        let mut rider =
            RiderAgent::new(Keypair::generate(), hub.clone(), &AppConfig::default(), tx);

        let request = sample_request();
        let request_id = request.id.clone();
        rider.open_request(request).await.unwrap();

        rider
            .handle_event(RiderEvent::WindowClosed { request_id: request_id.clone() })
            .await
            .unwrap();

        let record = rider.negotiation(&request_id).unwrap();
        assert_eq!(record.phase, RiderPhase::Abandoned);

        // A late window firing must not resurrect the negotiation.
        rider
            .handle_event(RiderEvent::WindowClosed { request_id: request_id.clone() })
            .await
            .unwrap();
        assert_eq!(rider.negotiation(&request_id).unwrap().phase, RiderPhase::Abandoned);
    }

    #[tokio::test]
    async fn test_late_bid_after_acceptance_is_dropped() {
        let (tx, _rx) = mpsc::channel(8);
        let hub = LocalHub::new();
        let mut rider =
            RiderAgent::new(Keypair::generate(), hub.clone(), &AppConfig::default(), tx);
        let driver = Keypair::generate();

        let request = sample_request();
        let request_id = request.id.clone();
        let request_event_id = rider.open_request(request).await.unwrap();

        let env = sealed_bid(
            &driver,
            rider.identity(),
            &request_event_id,
            &bid(&request_id, "b1", 9000, 8),
        );
        rider.handle_event(RiderEvent::Inbound(env)).await.unwrap();
        rider
            .handle_event(RiderEvent::WindowClosed { request_id: request_id.clone() })
            .await
            .unwrap();
        assert_eq!(rider.negotiation(&request_id).unwrap().phase, RiderPhase::Accepted);

        let late = sealed_bid(
            &driver,
            rider.identity(),
            &request_event_id,
            &bid(&request_id, "b2", 1000, 2),
        );
        rider.handle_event(RiderEvent::Inbound(late)).await.unwrap();

        let record = rider.negotiation(&request_id).unwrap();
        assert_eq!(record.committed.as_ref().unwrap().bid_id, "b1");
        assert!(!record.candidates.contains_key("b2"));
    }
}
