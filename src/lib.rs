//! # Farebid - peer ride negotiation over untrusted pub/sub
//!
//! Two autonomous agents negotiate a ride entirely through signed
//! messages on public relays: the rider broadcasts a request, drivers
//! bid, the rider commits to exactly one winning bid, the parties
//! exchange payment instructions, the driver reports progress, and the
//! rider settles with a detached-signature receipt the driver verifies
//! independently of the envelope.
//!
//! ## Architecture
//!
//! - **Rider agent**: collects bids for a fixed window, selects the
//!   cheapest (ties by ETA), accepts, settles on completion
//! - **Driver agent**: one negotiation record per bid placed, progress
//!   sequence driven by cancellable timers
//! - **Envelope layer**: content-derived ids, Ed25519 signatures, tag
//!   routing, single supported protocol version
//! - **Transport**: pub/sub collaborator trait with an in-memory hub for
//!   the harness and tests
//! - **Payment**: instruction generation trait with a Bitcoin Core
//!   JSON-RPC provider for the on-chain mode

pub mod config;
pub mod crypto;
pub mod driver;
pub mod envelope;
pub mod error;
pub mod model;
pub mod payment;
pub mod receipt;
pub mod rider;
pub mod selection;
pub mod timer;
pub mod transport;
pub mod validation;

pub use config::AppConfig;
pub use crypto::Keypair;
pub use driver::{DriverAgent, DriverEvent, DriverPhase};
pub use envelope::Envelope;
pub use error::{ProtocolError, Result};
pub use model::{MessageKind, Payload, PaymentMode, RideStage};
pub use payment::{BitcoinRpc, PaymentProvider, StaticProvider};
pub use rider::{RiderAgent, RiderEvent, RiderPhase};
pub use transport::{Filter, LocalHub, RelayPool, Transport};

/// 64-hex public key identifying an agent on the wire.
pub type Identity = String;

/// Content-derived envelope identifier.
pub type EventId = String;
