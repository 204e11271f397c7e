use crate::error::{ProtocolError, Result};
use crate::validation::{is_geohash, is_hex64, is_non_empty, is_positive};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Closed set of message kinds, carried on the wire as the message-type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    RideRequest,
    RideBid,
    RideAccept,
    InvoiceRequest,
    InvoiceResponse,
    RideStatus,
    RideReceipt,
}

impl MessageKind {
    pub fn as_tag(&self) -> &'static str {
        match self {
            MessageKind::RideRequest => "ride_request",
            MessageKind::RideBid => "ride_bid",
            MessageKind::RideAccept => "ride_accept",
            MessageKind::InvoiceRequest => "invoice_request",
            MessageKind::InvoiceResponse => "invoice_response",
            MessageKind::RideStatus => "ride_status",
            MessageKind::RideReceipt => "ride_receipt",
        }
    }

    pub fn from_tag(value: &str) -> Option<Self> {
        match value {
            "ride_request" => Some(MessageKind::RideRequest),
            "ride_bid" => Some(MessageKind::RideBid),
            "ride_accept" => Some(MessageKind::RideAccept),
            "invoice_request" => Some(MessageKind::InvoiceRequest),
            "invoice_response" => Some(MessageKind::InvoiceResponse),
            "ride_status" => Some(MessageKind::RideStatus),
            "ride_receipt" => Some(MessageKind::RideReceipt),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PaymentMode {
    Ln,
    Onchain,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RideStage {
    EnRoute,
    Arrived,
    Completed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RideRequest {
    pub id: String,
    pub pickup_geohash: String,
    pub dropoff_geohash: String,
    pub time_window_mins: u64,
    pub max_total_sats: u64,
    pub max_eta_mins: u64,
    pub payment_modes: Vec<PaymentMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RideBid {
    pub request_id: String,
    pub bid_id: String,
    pub total_sats: u64,
    pub deposit_sats: u64,
    pub eta_mins: u64,
    pub payment_modes_supported: Vec<PaymentMode>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RideAccept {
    pub request_id: String,
    pub bid_id: String,
    pub rider_pubkey: String,
    pub driver_pubkey: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoiceRequest {
    pub request_id: String,
    pub bid_id: String,
    pub amount_sats: u64,
    pub payment_mode: PaymentMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoiceResponse {
    pub request_id: String,
    pub bid_id: String,
    pub amount_sats: u64,
    pub payment_mode: PaymentMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invoice: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RideStatus {
    pub request_id: String,
    pub bid_id: String,
    pub status: RideStage,
    pub rider_pubkey: String,
    pub driver_pubkey: String,
}

/// Settlement receipt. `signature` is detached: it covers the canonical
/// receipt body, not the envelope, so a valid envelope cannot smuggle a
/// substituted body past the driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RideReceipt {
    pub request_id: String,
    pub bid_id: String,
    pub total_sats: u64,
    pub timestamp: u64,
    pub rider_pubkey: String,
    pub driver_pubkey: String,
    pub signature: String,
}

impl RideRequest {
    pub fn new(
        pickup_geohash: String,
        dropoff_geohash: String,
        time_window_mins: u64,
        max_total_sats: u64,
        max_eta_mins: u64,
        payment_modes: Vec<PaymentMode>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            pickup_geohash,
            dropoff_geohash,
            time_window_mins,
            max_total_sats,
            max_eta_mins,
            payment_modes,
            note: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !is_non_empty(&self.id) {
            return Err(ProtocolError::Schema("request id must be non-empty".to_string()));
        }
        if !is_geohash(&self.pickup_geohash) || !is_geohash(&self.dropoff_geohash) {
            return Err(ProtocolError::Schema("invalid location geohash".to_string()));
        }
        if !is_positive(self.time_window_mins) {
            return Err(ProtocolError::Schema("time window must be positive".to_string()));
        }
        if !is_positive(self.max_total_sats) {
            return Err(ProtocolError::Schema("max total must be positive".to_string()));
        }
        if !is_positive(self.max_eta_mins) {
            return Err(ProtocolError::Schema("max eta must be positive".to_string()));
        }
        if self.payment_modes.is_empty() {
            return Err(ProtocolError::Schema("at least one payment mode required".to_string()));
        }
        Ok(())
    }
}

impl RideBid {
    pub fn validate(&self) -> Result<()> {
        if !is_non_empty(&self.request_id) || !is_non_empty(&self.bid_id) {
            return Err(ProtocolError::Schema("bid ids must be non-empty".to_string()));
        }
        if !is_positive(self.total_sats) {
            return Err(ProtocolError::Schema("bid total must be positive".to_string()));
        }
        if !is_positive(self.eta_mins) {
            return Err(ProtocolError::Schema("bid eta must be positive".to_string()));
        }
        if self.payment_modes_supported.is_empty() {
            return Err(ProtocolError::Schema("bid must support a payment mode".to_string()));
        }
        Ok(())
    }
}

impl RideAccept {
    pub fn validate(&self) -> Result<()> {
        if !is_non_empty(&self.request_id) || !is_non_empty(&self.bid_id) {
            return Err(ProtocolError::Schema("acceptance ids must be non-empty".to_string()));
        }
        if !is_hex64(&self.rider_pubkey) || !is_hex64(&self.driver_pubkey) {
            return Err(ProtocolError::Schema("acceptance identities must be 64-hex".to_string()));
        }
        Ok(())
    }
}

impl InvoiceRequest {
    pub fn validate(&self) -> Result<()> {
        if !is_non_empty(&self.request_id) || !is_non_empty(&self.bid_id) {
            return Err(ProtocolError::Schema("invoice request ids must be non-empty".to_string()));
        }
        if !is_positive(self.amount_sats) {
            return Err(ProtocolError::Schema("invoice amount must be positive".to_string()));
        }
        Ok(())
    }
}

impl InvoiceResponse {
    pub fn validate(&self) -> Result<()> {
        if !is_non_empty(&self.request_id) || !is_non_empty(&self.bid_id) {
            return Err(ProtocolError::Schema("invoice response ids must be non-empty".to_string()));
        }
        if !is_positive(self.amount_sats) {
            return Err(ProtocolError::Schema("invoice amount must be positive".to_string()));
        }
        // The instruction must match the declared mode, and only one may be set.
        match self.payment_mode {
            PaymentMode::Ln => {
                if self.address.is_some() || !self.invoice.as_deref().is_some_and(is_non_empty) {
                    return Err(ProtocolError::Schema("LN response requires an invoice".to_string()));
                }
            }
            PaymentMode::Onchain => {
                if self.invoice.is_some() || !self.address.as_deref().is_some_and(is_non_empty) {
                    return Err(ProtocolError::Schema("on-chain response requires an address".to_string()));
                }
            }
        }
        Ok(())
    }
}

impl RideStatus {
    pub fn validate(&self) -> Result<()> {
        if !is_non_empty(&self.request_id) || !is_non_empty(&self.bid_id) {
            return Err(ProtocolError::Schema("status ids must be non-empty".to_string()));
        }
        if !is_hex64(&self.rider_pubkey) || !is_hex64(&self.driver_pubkey) {
            return Err(ProtocolError::Schema("status identities must be 64-hex".to_string()));
        }
        Ok(())
    }
}

impl RideReceipt {
    pub fn validate(&self) -> Result<()> {
        if !is_non_empty(&self.request_id) || !is_non_empty(&self.bid_id) {
            return Err(ProtocolError::Schema("receipt ids must be non-empty".to_string()));
        }
        if !is_positive(self.total_sats) {
            return Err(ProtocolError::Schema("receipt total must be positive".to_string()));
        }
        if !is_positive(self.timestamp) {
            return Err(ProtocolError::Schema("receipt timestamp must be positive".to_string()));
        }
        if !is_hex64(&self.rider_pubkey) || !is_hex64(&self.driver_pubkey) {
            return Err(ProtocolError::Schema("receipt identities must be 64-hex".to_string()));
        }
        if !is_non_empty(&self.signature) {
            return Err(ProtocolError::Schema("receipt signature must be non-empty".to_string()));
        }
        Ok(())
    }
}

/// One payload per message kind, only constructible through [`Payload::parse`].
#[derive(Debug, Clone)]
pub enum Payload {
    RideRequest(RideRequest),
    RideBid(RideBid),
    RideAccept(RideAccept),
    InvoiceRequest(InvoiceRequest),
    InvoiceResponse(InvoiceResponse),
    RideStatus(RideStatus),
    RideReceipt(RideReceipt),
}

impl Payload {
    /// Decode and validate `content` as the payload for `kind`. This is the
    /// only way to obtain a typed payload from wire data.
    pub fn parse(kind: MessageKind, content: &str) -> Result<Self> {
        let payload = match kind {
            MessageKind::RideRequest => {
                let p: RideRequest = serde_json::from_str(content)?;
                p.validate()?;
                Payload::RideRequest(p)
            }
            MessageKind::RideBid => {
                let p: RideBid = serde_json::from_str(content)?;
                p.validate()?;
                Payload::RideBid(p)
            }
            MessageKind::RideAccept => {
                let p: RideAccept = serde_json::from_str(content)?;
                p.validate()?;
                Payload::RideAccept(p)
            }
            MessageKind::InvoiceRequest => {
                let p: InvoiceRequest = serde_json::from_str(content)?;
                p.validate()?;
                Payload::InvoiceRequest(p)
            }
            MessageKind::InvoiceResponse => {
                let p: InvoiceResponse = serde_json::from_str(content)?;
                p.validate()?;
                Payload::InvoiceResponse(p)
            }
            MessageKind::RideStatus => {
                let p: RideStatus = serde_json::from_str(content)?;
                p.validate()?;
                Payload::RideStatus(p)
            }
            MessageKind::RideReceipt => {
                let p: RideReceipt = serde_json::from_str(content)?;
                p.validate()?;
                Payload::RideReceipt(p)
            }
        };
        Ok(payload)
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Payload::RideRequest(_) => MessageKind::RideRequest,
            Payload::RideBid(_) => MessageKind::RideBid,
            Payload::RideAccept(_) => MessageKind::RideAccept,
            Payload::InvoiceRequest(_) => MessageKind::InvoiceRequest,
            Payload::InvoiceResponse(_) => MessageKind::InvoiceResponse,
            Payload::RideStatus(_) => MessageKind::RideStatus,
            Payload::RideReceipt(_) => MessageKind::RideReceipt,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex64() -> String {
        "a".repeat(64)
    }

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

    #[test]
    fn test_request_round_trip() {
        let request = sample_request();
        let json = serde_json::to_string(&request).unwrap();
        let parsed = Payload::parse(MessageKind::RideRequest, &json).unwrap();
        match parsed {
            Payload::RideRequest(p) => {
                assert_eq!(p.id, request.id);
                assert_eq!(p.max_total_sats, 25000);
                assert_eq!(p.payment_modes, vec![PaymentMode::Ln, PaymentMode::Onchain]);
            }
            other => panic!("wrong payload kind: {:?}", other.kind()),
        }
    }

    #[test]
    fn test_request_rejects_bad_geohash() {
        let mut request = sample_request();
        request.pickup_geohash = "bad!".to_string();
        assert!(request.validate().is_err());
    }

    #[test]
    fn test_bid_rejects_zero_total() {
        let bid = RideBid {
            request_id: "req-1".to_string(),
            bid_id: "bid-1".to_string(),
            total_sats: 0,
            deposit_sats: 100,
            eta_mins: 5,
            payment_modes_supported: vec![PaymentMode::Ln],
        };
        assert!(bid.validate().is_err());
    }

    #[test]
    fn test_accept_rejects_short_identity() {
        let accept = RideAccept {
            request_id: "req-1".to_string(),
            bid_id: "bid-1".to_string(),
            rider_pubkey: "abc".to_string(),
            driver_pubkey: hex64(),
        };
        assert!(accept.validate().is_err());
    }

    #[test]
    fn test_invoice_response_mode_instruction_pairing() {
        let mut response = InvoiceResponse {
            request_id: "req-1".to_string(),
            bid_id: "bid-1".to_string(),
            amount_sats: 1200,
            payment_mode: PaymentMode::Ln,
            invoice: Some("lnbc1invoice".to_string()),
            address: None,
        };
        assert!(response.validate().is_ok());

        response.invoice = None;
        assert!(response.validate().is_err());

        response.payment_mode = PaymentMode::Onchain;
        response.address = Some("bc1qexample".to_string());
        assert!(response.validate().is_ok());

        response.invoice = Some("lnbc1invoice".to_string());
        assert!(response.validate().is_err());
    }

    #[test]
    fn test_status_parse_rejects_unknown_stage() {
        let json = serde_json::json!({
            "request_id": "req-1",
            "bid_id": "bid-1",
            "status": "lost",
            "rider_pubkey": hex64(),
            "driver_pubkey": hex64(),
        })
        .to_string();
        assert!(Payload::parse(MessageKind::RideStatus, &json).is_err());
    }

    #[test]
    fn test_receipt_rejects_zero_timestamp() {
        let receipt = RideReceipt {
            request_id: "req-1".to_string(),
            bid_id: "bid-1".to_string(),
            total_sats: 5000,
            timestamp: 0,
            rider_pubkey: hex64(),
            driver_pubkey: hex64(),
            signature: "sig".to_string(),
        };
        assert!(receipt.validate().is_err());
    }

    #[test]
    fn test_payment_mode_wire_names() {
        assert_eq!(serde_json::to_string(&PaymentMode::Ln).unwrap(), "\"LN\"");
        assert_eq!(serde_json::to_string(&PaymentMode::Onchain).unwrap(), "\"ONCHAIN\"");
        assert_eq!(serde_json::to_string(&RideStage::EnRoute).unwrap(), "\"en_route\"");
    }

    #[test]
    fn test_kind_tags_round_trip() {
        for kind in [
            MessageKind::RideRequest,
            MessageKind::RideBid,
            MessageKind::RideAccept,
            MessageKind::InvoiceRequest,
            MessageKind::InvoiceResponse,
            MessageKind::RideStatus,
            MessageKind::RideReceipt,
        ] {
            assert_eq!(MessageKind::from_tag(kind.as_tag()), Some(kind));
        }
        assert_eq!(MessageKind::from_tag("ride_cancel"), None);
    }
}
