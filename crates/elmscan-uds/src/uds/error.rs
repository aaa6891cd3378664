//! UDS decoding errors

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UdsError {
    #[error("Response to service 0x{got:02X} where 0x{expected:02X} was expected")]
    UnexpectedService { expected: u8, got: u8 },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}
