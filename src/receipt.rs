//! Settlement receipt: canonical body, detached signing, verification.
//!
//! The receipt signature is independent of the envelope signature. Both
//! sides derive the body bytes from the same field order, so the driver
//! can re-derive and check the digest without trusting the wrapping
//! envelope.

use crate::crypto::{self, Keypair};
use crate::error::{ProtocolError, Result};
use crate::model::RideReceipt;
use serde::Serialize;
use sha2::{Digest, Sha256};

/// Canonical receipt body. Field order is part of the protocol.
#[derive(Serialize)]
struct ReceiptBody<'a> {
    request_id: &'a str,
    bid_id: &'a str,
    total_sats: u64,
    timestamp: u64,
    rider_pubkey: &'a str,
    driver_pubkey: &'a str,
}

fn body_digest(
    request_id: &str,
    bid_id: &str,
    total_sats: u64,
    timestamp: u64,
    rider_pubkey: &str,
    driver_pubkey: &str,
) -> Result<[u8; 32]> {
    let body = ReceiptBody {
        request_id,
        bid_id,
        total_sats,
        timestamp,
        rider_pubkey,
        driver_pubkey,
    };
    let bytes = serde_json::to_vec(&body)?;
    Ok(Sha256::digest(&bytes).into())
}

/// Compose and sign a receipt for a completed ride. A failure to produce
/// the detached signature surfaces as [`ProtocolError::Signing`].
pub fn build_signed(
    request_id: &str,
    bid_id: &str,
    total_sats: u64,
    timestamp: u64,
    rider: &Keypair,
    driver_pubkey: &str,
) -> Result<RideReceipt> {
    let digest = body_digest(
        request_id,
        bid_id,
        total_sats,
        timestamp,
        rider.public_hex(),
        driver_pubkey,
    )
    .map_err(|e| ProtocolError::Signing(format!("cannot derive receipt body: {}", e)))?;
    let signature = rider.sign_digest(&digest);
    Ok(RideReceipt {
        request_id: request_id.to_string(),
        bid_id: bid_id.to_string(),
        total_sats,
        timestamp,
        rider_pubkey: rider.public_hex().to_string(),
        driver_pubkey: driver_pubkey.to_string(),
        signature,
    })
}

/// Re-derive the canonical body from the receipt's own fields and verify
/// the detached signature against the rider identity it names.
pub fn verify(receipt: &RideReceipt) -> bool {
    let Ok(digest) = body_digest(
        &receipt.request_id,
        &receipt.bid_id,
        receipt.total_sats,
        receipt.timestamp,
        &receipt.rider_pubkey,
        &receipt.driver_pubkey,
    ) else {
        return false;
    };
    crypto::verify_detached(&receipt.signature, &digest, &receipt.rider_pubkey)
}
