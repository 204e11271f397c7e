use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProtocolError>;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Malformed, missing, or out-of-range payload field. Inbound messages
    /// failing this are dropped without touching negotiation state.
    #[error("Schema violation: {0}")]
    Schema(String),

    /// Bad envelope signature or unsupported protocol version.
    #[error("Authenticity check failed: {0}")]
    Authenticity(String),

    /// Message is well-formed and authentic but refers to state we do not
    /// hold (unknown bid, wrong counterpart, mismatched committed total).
    #[error("Protocol violation: {0}")]
    Violation(String),

    /// Local failure to produce a required outbound signature. The only
    /// error class that propagates out of an agent event loop.
    #[error("Signing failed: {0}")]
    Signing(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Payment provider error: {0}")]
    Payment(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        ProtocolError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for ProtocolError {
    fn from(err: std::io::Error) -> Self {
        ProtocolError::Io(err.to_string())
    }
}

impl ProtocolError {
    /// Whether this error must abort the agent instead of being logged and
    /// dropped. Everything except a local signing failure is survivable.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ProtocolError::Signing(_))
    }
}
