//! SMF Error Types
//!
//! Error taxonomy of the session core. Only `Config` is fatal; every other
//! variant is recovered into an FSM outcome or an error response.

use thiserror::Error;

/// SMF error type
#[derive(Debug, Error)]
pub enum SmfError {
    /// Malformed topology, pool or file configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// No path or anchor matches the selection criteria
    #[error("No user plane path found: {0}")]
    NotFound(String),

    /// UE address pool or id space exhausted
    #[error("Resource exhausted: {0}")]
    Exhausted(String),

    /// Event received in an unexpected FSM state
    #[error("Protocol anomaly: {0}")]
    ProtocolAnomaly(String),

    /// Forwarding node answered with a non-accepting cause
    #[error("Request rejected by {node} (cause={cause})")]
    RemoteRejected { node: String, cause: u8 },

    /// Response correlates to no session or transaction
    #[error("Unmatched response: {0}")]
    Unmatched(String),

    /// Outcome wait deadline or retry timer exhausted
    #[error("Timeout: {0}")]
    Timeout(String),

    /// PFCP encode/decode failure
    #[error("Codec error: {0}")]
    Codec(String),

    /// Transport failure when sending to a node
    #[error("Transport error: {0}")]
    Transport(String),

    /// Failure reported by an external collaborator (PCF, UDM, AMF, ...)
    #[error("Collaborator error: {0}")]
    Collaborator(String),
}

impl SmfError {
    /// Errors surfaced as an insufficient-resources rejection
    pub fn is_insufficient_resources(&self) -> bool {
        matches!(self, SmfError::NotFound(_) | SmfError::Exhausted(_))
    }
}

impl From<std::io::Error> for SmfError {
    fn from(e: std::io::Error) -> Self {
        SmfError::Transport(e.to_string())
    }
}

/// SMF Result type
pub type SmfResult<T> = Result<T, SmfError>;
