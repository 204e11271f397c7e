//! Driver negotiation state machine.
//!
//! One record per bid placed, keyed by bid id; a driver runs many
//! concurrently. The progress sequence after acceptance is driven by
//! cancellable timers, so a duplicate acceptance can never start it
//! twice.

use crate::config::{AppConfig, FareConfig};
use crate::crypto::{self, Keypair};
use crate::envelope::{
    tag_message_type, tag_reference, tag_target, tag_version, unix_now, Envelope,
};
use crate::error::Result;
use crate::model::{
    InvoiceRequest, InvoiceResponse, MessageKind, Payload, PaymentMode, RideAccept, RideBid,
    RideReceipt, RideRequest, RideStage, RideStatus,
};
use crate::payment::PaymentProvider;
use crate::receipt;
use crate::timer::TimerRegistry;
use crate::transport::{Filter, Transport};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverPhase {
    BidSent,
    Accepted,
    Settled,
}

/// What the driver remembers about a bid it placed.
#[derive(Debug, Clone)]
pub struct DriverNegotiation {
    pub request_id: String,
    pub request_event_id: String,
    pub rider_pubkey: String,
    pub bid_event_id: String,
    pub total_sats: u64,
    pub phase: DriverPhase,
}

#[derive(Debug, Clone)]
pub enum DriverEvent {
    Inbound(Envelope),
    ProgressDue { bid_id: String, stage: RideStage },
}

pub struct DriverAgent {
    keys: Keypair,
    transport: Arc<dyn Transport>,
    timers: TimerRegistry<DriverEvent>,
    payment: Arc<dyn PaymentProvider>,
    fare: FareConfig,
    payment_modes: Vec<PaymentMode>,
    arrived_delay: Duration,
    completed_delay: Duration,
    bids: HashMap<String, DriverNegotiation>,
}

impl DriverAgent {
    pub fn new(
        keys: Keypair,
        transport: Arc<dyn Transport>,
        payment: Arc<dyn PaymentProvider>,
        config: &AppConfig,
        events_tx: mpsc::Sender<DriverEvent>,
    ) -> Self {
        Self {
            keys,
            transport,
            timers: TimerRegistry::new(events_tx),
            payment,
            fare: config.fare.clone(),
            payment_modes: config.payment.modes.clone(),
            arrived_delay: Duration::from_secs(config.negotiation.arrived_delay_secs),
            completed_delay: Duration::from_secs(config.negotiation.completed_delay_secs),
            bids: HashMap::new(),
        }
    }

    pub fn identity(&self) -> &str {
        self.keys.public_hex()
    }

    /// Ride requests are broadcast, everything else must target us.
    pub fn broadcast_filter(&self) -> Filter {
        Filter::new().message_type(MessageKind::RideRequest)
    }

    pub fn directed_filter(&self) -> Filter {
        Filter::new()
            .message_type(MessageKind::RideAccept)
            .message_type(MessageKind::InvoiceRequest)
            .message_type(MessageKind::RideReceipt)
            .target(self.keys.public_hex())
    }

    pub fn negotiation(&self, bid_id: &str) -> Option<&DriverNegotiation> {
        self.bids.get(bid_id)
    }

    pub fn negotiation_for_request(&self, request_id: &str) -> Option<&DriverNegotiation> {
        self.bids.values().find(|b| b.request_id == request_id)
    }

    pub async fn handle_event(&mut self, event: DriverEvent) -> Result<()> {
        match event {
            DriverEvent::Inbound(envelope) => self.on_envelope(envelope).await,
            DriverEvent::ProgressDue { bid_id, stage } => self.on_progress_due(&bid_id, stage).await,
        }
    }

    /// Cancel every pending progress timer before transport teardown.
    pub fn shutdown(&mut self) {
        self.timers.cancel_all();
        debug!("driver timers cancelled");
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
            Payload::RideRequest(request) => self.on_request(&envelope, request).await,
            Payload::RideAccept(accept) => self.on_accept(&envelope, accept).await,
            Payload::InvoiceRequest(request) => self.on_invoice_request(&envelope, request).await,
            Payload::RideReceipt(receipt) => {
                self.on_receipt(&envelope, receipt);
                Ok(())
            }
            other => {
                debug!(kind = ?other.kind(), "driver ignores this message kind");
                Ok(())
            }
        }
    }

    async fn on_request(&mut self, envelope: &Envelope, request: RideRequest) -> Result<()> {
        // Redelivered request events must not produce a second bid.
        if self.bids.values().any(|b| b.request_event_id == envelope.id) {
            debug!(request_id = %request.id, "already bid on this request event");
            return Ok(());
        }

        // Placeholder trip estimate until a real estimator is wired in.
        let total_sats = self.fare.quote_total(self.fare.estimated_miles, self.fare.estimated_minutes);
        let deposit_sats = self.fare.deposit_for(total_sats);

        let bid = RideBid {
            request_id: request.id.clone(),
            bid_id: Uuid::new_v4().to_string(),
            total_sats,
            deposit_sats,
            eta_mins: self.fare.eta_mins,
            payment_modes_supported: self.payment_modes.clone(),
        };
        let tags = vec![
            tag_message_type(MessageKind::RideBid),
            tag_version(),
            tag_reference(&envelope.id),
            tag_target(&envelope.origin),
        ];
        let sealed = self.keys.seal(tags, serde_json::to_string(&bid)?, unix_now())?;
        self.transport.publish(&sealed).await?;

        info!(request_id = %request.id, bid_id = %bid.bid_id, total_sats, "bid published");
        self.bids.insert(
            bid.bid_id.clone(),
            DriverNegotiation {
                request_id: request.id,
                request_event_id: envelope.id.clone(),
                rider_pubkey: envelope.origin.clone(),
                bid_event_id: sealed.id,
                total_sats,
                phase: DriverPhase::BidSent,
            },
        );
        Ok(())
    }

    async fn on_accept(&mut self, envelope: &Envelope, accept: RideAccept) -> Result<()> {
        let Some(record) = self.bids.get(&accept.bid_id) else {
            warn!(bid_id = %accept.bid_id, "acceptance for unknown bid");
            return Ok(());
        };
        if accept.driver_pubkey != self.keys.public_hex() {
            warn!(bid_id = %accept.bid_id, "acceptance names a different driver");
            return Ok(());
        }
        if envelope.origin != record.rider_pubkey {
            warn!(bid_id = %accept.bid_id, "acceptance not signed by the bidding rider");
            return Ok(());
        }
        if accept.rider_pubkey != record.rider_pubkey {
            warn!(bid_id = %accept.bid_id, "acceptance rider identity mismatch");
            return Ok(());
        }
        if let Some(reference) = envelope.reference() {
            if reference != record.bid_event_id {
                warn!(bid_id = %accept.bid_id, "acceptance references a different bid event");
                return Ok(());
            }
        }
        if record.phase != DriverPhase::BidSent {
            debug!(bid_id = %accept.bid_id, "duplicate acceptance ignored");
            return Ok(());
        }

        let snapshot = record.clone();
        if let Some(record) = self.bids.get_mut(&accept.bid_id) {
            record.phase = DriverPhase::Accepted;
        }
        info!(bid_id = %accept.bid_id, request_id = %snapshot.request_id, "bid accepted");

        self.publish_status(&accept.bid_id, &snapshot, RideStage::EnRoute).await?;
        self.timers.schedule(
            &format!("progress:{}", accept.bid_id),
            self.arrived_delay,
            DriverEvent::ProgressDue { bid_id: accept.bid_id.clone(), stage: RideStage::Arrived },
        );
        Ok(())
    }

    async fn on_progress_due(&mut self, bid_id: &str, stage: RideStage) -> Result<()> {
        let Some(record) = self.bids.get(bid_id) else {
            return Ok(());
        };
        if record.phase != DriverPhase::Accepted {
            debug!(bid_id, stage = ?stage, "progress timer fired outside an active ride");
            return Ok(());
        }
        let snapshot = record.clone();
        self.publish_status(bid_id, &snapshot, stage).await?;
        if stage == RideStage::Arrived {
            self.timers.schedule(
                &format!("progress:{}", bid_id),
                self.completed_delay,
                DriverEvent::ProgressDue { bid_id: bid_id.to_string(), stage: RideStage::Completed },
            );
        }
        Ok(())
    }

    async fn publish_status(
        &self,
        bid_id: &str,
        record: &DriverNegotiation,
        stage: RideStage,
    ) -> Result<()> {
        let status = RideStatus {
            request_id: record.request_id.clone(),
            bid_id: bid_id.to_string(),
            status: stage,
            rider_pubkey: record.rider_pubkey.clone(),
            driver_pubkey: self.keys.public_hex().to_string(),
        };
        let tags = vec![
            tag_message_type(MessageKind::RideStatus),
            tag_version(),
            tag_reference(&record.bid_event_id),
            tag_target(&record.rider_pubkey),
        ];
        let envelope = self.keys.seal(tags, serde_json::to_string(&status)?, unix_now())?;
        self.transport.publish(&envelope).await?;
        info!(bid_id, stage = ?stage, "ride status published");
        Ok(())
    }

    async fn on_invoice_request(
        &mut self,
        envelope: &Envelope,
        request: InvoiceRequest,
    ) -> Result<()> {
        let Some(record) = self.bids.get(&request.bid_id) else {
            warn!(bid_id = %request.bid_id, "invoice request for unknown bid");
            return Ok(());
        };
        if envelope.origin != record.rider_pubkey {
            warn!(bid_id = %request.bid_id, "invoice request from wrong counterpart");
            return Ok(());
        }
        if request.amount_sats != record.total_sats {
            warn!(
                expected = record.total_sats,
                got = request.amount_sats,
                "invoice request amount differs from the bid total"
            );
            return Ok(());
        }
        if !self.payment_modes.contains(&request.payment_mode) {
            warn!(mode = ?request.payment_mode, "unsupported payment mode requested");
            return Ok(());
        }
        let rider_pubkey = record.rider_pubkey.clone();

        let instruction = match self
            .payment
            .generate_instruction(
                request.amount_sats,
                &request.request_id,
                &request.bid_id,
                request.payment_mode,
            )
            .await
        {
            Ok(instruction) => instruction,
            Err(e) => {
                warn!(bid_id = %request.bid_id, error = %e, "payment provider failed, no response sent");
                return Ok(());
            }
        };

        let response = InvoiceResponse {
            request_id: request.request_id,
            bid_id: request.bid_id,
            amount_sats: request.amount_sats,
            payment_mode: request.payment_mode,
            invoice: instruction.invoice,
            address: instruction.address,
        };
        let tags = vec![
            tag_message_type(MessageKind::InvoiceResponse),
            tag_version(),
            tag_reference(&envelope.id),
            tag_target(&rider_pubkey),
        ];
        let sealed = self.keys.seal(tags, serde_json::to_string(&response)?, unix_now())?;
        self.transport.publish(&sealed).await?;
        info!(bid_id = %response.bid_id, mode = ?response.payment_mode, "invoice response published");
        Ok(())
    }

    fn on_receipt(&mut self, envelope: &Envelope, incoming: RideReceipt) {
        let Some(record) = self.bids.get_mut(&incoming.bid_id) else {
            warn!(bid_id = %incoming.bid_id, "receipt for unknown bid");
            return;
        };
        if incoming.driver_pubkey != self.keys.public_hex() {
            warn!(bid_id = %incoming.bid_id, "receipt names a different driver");
            return;
        }
        if envelope.origin != record.rider_pubkey || incoming.rider_pubkey != record.rider_pubkey {
            warn!(bid_id = %incoming.bid_id, "receipt from wrong counterpart");
            return;
        }
        if record.phase == DriverPhase::Settled {
            debug!(bid_id = %incoming.bid_id, "receipt after settlement ignored");
            return;
        }
        if incoming.total_sats != record.total_sats {
            warn!(
                expected = record.total_sats,
                got = incoming.total_sats,
                "receipt total differs from committed total"
            );
            return;
        }
        // The detached signature is checked on a re-derived body; a valid
        // envelope wrapping a substituted body fails here.
        if !receipt::verify(&incoming) {
            warn!(bid_id = %incoming.bid_id, "receipt detached signature invalid");
            return;
        }

        record.phase = DriverPhase::Settled;
        info!(bid_id = %incoming.bid_id, total_sats = incoming.total_sats, "ride settled");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payment::StaticProvider;
    use crate::transport::LocalHub;

    fn agent(hub: Arc<LocalHub>) -> (DriverAgent, mpsc::Receiver<DriverEvent>) {
        let (tx, rx) = mpsc::channel(16);
        let mut config = AppConfig::default();
        config.negotiation.arrived_delay_secs = 0;
        config.negotiation.completed_delay_secs = 0;
        let driver = DriverAgent::new(
            Keypair::generate(),
            hub,
            Arc::new(StaticProvider::new("bc1qexample")),
            &config,
            tx,
        );
        (driver, rx)
    }

    fn sealed_request(rider: &Keypair) -> (RideRequest, Envelope) {
        let request = RideRequest::new(
            "dp3w".to_string(),
            "dp3x".to_string(),
            20,
            25000,
            12,
            vec![PaymentMode::Ln],
        );
        let envelope = rider
            .seal(
                vec![tag_message_type(MessageKind::RideRequest), tag_version()],
                serde_json::to_string(&request).unwrap(),
                unix_now(),
            )
            .unwrap();
        (request, envelope)
    }

    fn sealed_accept(
        rider: &Keypair,
        record: &DriverNegotiation,
        bid_id: &str,
        driver_pubkey: &str,
    ) -> Envelope {
        let accept = RideAccept {
            request_id: record.request_id.clone(),
            bid_id: bid_id.to_string(),
            rider_pubkey: rider.public_hex().to_string(),
            driver_pubkey: driver_pubkey.to_string(),
        };
        rider
            .seal(
                vec![
                    tag_message_type(MessageKind::RideAccept),
                    tag_version(),
                    tag_reference(&record.bid_event_id),
                    tag_target(driver_pubkey),
                ],
                serde_json::to_string(&accept).unwrap(),
                unix_now(),
            )
            .unwrap()
    }

    #[tokio::test]
    async fn test_request_produces_one_bid() {
        let hub = LocalHub::new();
        let (mut driver, _rx) = agent(hub.clone());
        let rider = Keypair::generate();

        let (request, envelope) = sealed_request(&rider);
        driver.handle_event(DriverEvent::Inbound(envelope.clone())).await.unwrap();

        let record = driver.negotiation_for_request(&request.id).unwrap();
        assert_eq!(record.phase, DriverPhase::BidSent);
        assert_eq!(record.rider_pubkey, rider.public_hex());

        // Redelivery of the same request event is a no-op.
        driver.handle_event(DriverEvent::Inbound(envelope)).await.unwrap();
        assert_eq!(
            driver.bids.values().filter(|b| b.request_id == request.id).count(),
            1
        );
    }

    #[tokio::test]
    async fn test_duplicate_acceptance_starts_one_sequence() {
        let hub = LocalHub::new();
        let (mut driver, _rx) = agent(hub.clone());
        let rider = Keypair::generate();

        let mut statuses = hub
            .subscribe(Filter::new().message_type(MessageKind::RideStatus))
            .await
            .unwrap();

        let (request, envelope) = sealed_request(&rider);
        driver.handle_event(DriverEvent::Inbound(envelope)).await.unwrap();
        let record = driver.negotiation_for_request(&request.id).unwrap().clone();
        let bid_id = driver
            .bids
            .iter()
            .find(|(_, b)| b.request_id == request.id)
            .map(|(id, _)| id.clone())
            .unwrap();

        let accept = sealed_accept(&rider, &record, &bid_id, driver.identity());
        driver.handle_event(DriverEvent::Inbound(accept.clone())).await.unwrap();
        driver.handle_event(DriverEvent::Inbound(accept)).await.unwrap();

        // Exactly one en_route despite the duplicate acceptance.
        assert!(statuses.recv().await.is_some());
        assert!(statuses.try_recv().is_err());
        assert_eq!(driver.negotiation(&bid_id).unwrap().phase, DriverPhase::Accepted);
    }

    #[tokio::test]
    async fn test_acceptance_for_other_driver_ignored() {
        let hub = LocalHub::new();
        let (mut driver, _rx) = agent(hub.clone());
        let rider = Keypair::generate();

        let (request, envelope) = sealed_request(&rider);
        driver.handle_event(DriverEvent::Inbound(envelope)).await.unwrap();
        let record = driver.negotiation_for_request(&request.id).unwrap().clone();
        let bid_id = driver
            .bids
            .iter()
            .find(|(_, b)| b.request_id == request.id)
            .map(|(id, _)| id.clone())
            .unwrap();

        let other_driver = Keypair::generate();
        let accept = sealed_accept(&rider, &record, &bid_id, other_driver.public_hex());
        driver.handle_event(DriverEvent::Inbound(accept)).await.unwrap();

        let record = driver.negotiation(&bid_id).unwrap();
        assert_eq!(record.phase, DriverPhase::BidSent);
        assert!(!driver.timers.is_scheduled(&format!("progress:{}", bid_id)));
    }

    #[tokio::test]
    async fn test_receipt_total_mismatch_rejected() {
        let hub = LocalHub::new();
        let (mut driver, _rx) = agent(hub.clone());
        let rider = Keypair::generate();

        let (request, envelope) = sealed_request(&rider);
        driver.handle_event(DriverEvent::Inbound(envelope)).await.unwrap();
        let record = driver.negotiation_for_request(&request.id).unwrap().clone();
        let bid_id = driver
            .bids
            .iter()
            .find(|(_, b)| b.request_id == request.id)
            .map(|(id, _)| id.clone())
            .unwrap();

        let bad = receipt::build_signed(
            &record.request_id,
            &bid_id,
            record.total_sats + 1,
            unix_now(),
            &rider,
            driver.identity(),
        )
        .unwrap();
        let sealed = rider
            .seal(
                vec![
                    tag_message_type(MessageKind::RideReceipt),
                    tag_version(),
                    tag_target(driver.identity()),
                ],
                serde_json::to_string(&bad).unwrap(),
                unix_now(),
            )
            .unwrap();
        driver.handle_event(DriverEvent::Inbound(sealed)).await.unwrap();

        assert_eq!(driver.negotiation(&bid_id).unwrap().phase, DriverPhase::BidSent);
    }

    #[tokio::test]
    async fn test_receipt_with_forged_body_rejected() {
        let hub = LocalHub::new();
        let (mut driver, _rx) = agent(hub.clone());
        let rider = Keypair::generate();

        let (request, envelope) = sealed_request(&rider);
        driver.handle_event(DriverEvent::Inbound(envelope)).await.unwrap();
        let record = driver.negotiation_for_request(&request.id).unwrap().clone();
        let bid_id = driver
            .bids
            .iter()
            .find(|(_, b)| b.request_id == request.id)
            .map(|(id, _)| id.clone())
            .unwrap();

        // The detached signature covers a different total; setting the
        // field back makes the total check pass but not the signature.
        let mut forged = receipt::build_signed(
            &record.request_id,
            &bid_id,
            record.total_sats + 1000,
            unix_now(),
            &rider,
            driver.identity(),
        )
        .unwrap();
        forged.total_sats = record.total_sats;
        let sealed = rider
            .seal(
                vec![
                    tag_message_type(MessageKind::RideReceipt),
                    tag_version(),
                    tag_target(driver.identity()),
                ],
                serde_json::to_string(&forged).unwrap(),
                unix_now(),
            )
            .unwrap();
        driver.handle_event(DriverEvent::Inbound(sealed)).await.unwrap();

        assert_eq!(driver.negotiation(&bid_id).unwrap().phase, DriverPhase::BidSent);
    }
}
