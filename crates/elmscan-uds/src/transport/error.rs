//! Transport layer errors

use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum TransportError {
    /// The serial link failed or the adapter went away. Fatal to the session.
    #[error("Serial I/O failure: {0}")]
    IoFailure(String),

    #[error("Timeout after {timeout_ms} ms waiting for reply to '{command}'")]
    Timeout { command: String, timeout_ms: u64 },

    #[error("Adapter did not acknowledge '{command}': {reply}")]
    NotAcknowledged { command: String, reply: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl TransportError {
    /// Only an I/O failure ends the session; everything else is per-exchange.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::IoFailure(_))
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        Self::IoFailure(err.to_string())
    }
}
