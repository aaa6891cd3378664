//! ISO-TP channel errors

use std::fmt;

use thiserror::Error;

use crate::transport::{AdapterCondition, FrameParseError, TransportError};

/// Which ISO-TP timer expired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// N_Bs: waiting for Flow Control after a First Frame or a completed block
    FlowControl,
    /// N_Cr: waiting for the next Consecutive Frame
    ConsecutiveFrame,
    /// Waiting for the first frame of a response
    Response,
}

impl fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FlowControl => write!(f, "flow control (N_Bs)"),
            Self::ConsecutiveFrame => write!(f, "consecutive frame (N_Cr)"),
            Self::Response => write!(f, "response"),
        }
    }
}

#[derive(Debug, Error, Clone)]
pub enum ChannelError {
    #[error("Sequence error: expected consecutive frame {expected:X}, got {got:X}")]
    SequenceError { expected: u8, got: u8 },

    #[error("Timed out waiting for {0}")]
    Timeout(TimeoutKind),

    #[error("Flow control violation: {0}")]
    FlowControlViolation(String),

    #[error("Length mismatch: declared {declared} bytes, received {received}")]
    LengthMismatch { declared: usize, received: usize },

    #[error("Payload of {0} bytes exceeds the 4095 byte ISO-TP limit")]
    PayloadTooLarge(usize),

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Adapter reported {0}")]
    Adapter(AdapterCondition),

    #[error("Frame parse error: {0}")]
    Parse(#[from] FrameParseError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

impl ChannelError {
    /// True when the underlying serial link is gone
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Transport(e) if e.is_fatal())
    }
}
