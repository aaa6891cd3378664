//! Diagnostic session handling
//!
//! [`UdsSession`] owns the ISO-TP channel, sends typed requests, classifies
//! the answers and tracks the ECU's session and security state, including
//! the TesterPresent cadence that keeps a non-default session alive.

mod manager;
mod retry;

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;

use crate::transport::TransportError;
use crate::uds::NegativeResponseCode;

pub use manager::UdsSession;
pub use retry::RetryPolicy;

/// Diagnostic session levels (DiagnosticSessionControl sub-functions)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionLevel {
    Default,
    Programming,
    Extended,
}

impl SessionLevel {
    pub fn sub_function(&self) -> u8 {
        match self {
            Self::Default => 0x01,
            Self::Programming => 0x02,
            Self::Extended => 0x03,
        }
    }

    pub fn from_sub_function(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::Default),
            0x02 => Some(Self::Programming),
            0x03 => Some(Self::Extended),
            _ => None,
        }
    }
}

impl fmt::Display for SessionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Default => write!(f, "default"),
            Self::Programming => write!(f, "programming"),
            Self::Extended => write!(f, "extended"),
        }
    }
}

/// Two-step SecurityAccess progress
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecurityState {
    Locked,
    SeedIssued { level: u8, seed: Vec<u8> },
    Unlocked { level: u8 },
}

/// What the client believes about the targeted ECU
#[derive(Debug, Clone)]
pub struct SessionState {
    level: SessionLevel,
    last_activity: Instant,
    security: SecurityState,
}

impl SessionState {
    pub fn new() -> Self {
        Self {
            level: SessionLevel::Default,
            last_activity: Instant::now(),
            security: SecurityState::Locked,
        }
    }

    pub fn level(&self) -> SessionLevel {
        self.level
    }

    pub fn security(&self) -> &SecurityState {
        &self.security
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    pub fn idle(&self) -> Duration {
        self.last_activity.elapsed()
    }

    pub fn is_unlocked(&self) -> bool {
        matches!(self.security, SecurityState::Unlocked { .. })
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Every session transition re-locks security (ISO 14229)
    fn enter(&mut self, level: SessionLevel) {
        self.level = level;
        self.security = SecurityState::Locked;
        self.touch();
    }

    fn reset(&mut self) {
        self.enter(SessionLevel::Default);
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

/// Session management errors
#[derive(Debug, Error)]
pub enum SessionError {
    /// The adapter link failed; nothing more can be sent
    #[error("Adapter link lost: {0}")]
    LinkLost(#[source] TransportError),

    #[error("{module} does not offer the {level} session")]
    ExtendedSessionUnavailable { module: String, level: SessionLevel },

    #[error("Service 0x{service:02X} rejected: {nrc} (0x{nrc:02X})")]
    Rejected {
        service: u8,
        nrc: NegativeResponseCode,
    },

    #[error("No response to service 0x{service:02X}")]
    NoResponse { service: u8 },

    #[error("Malformed response: {0}")]
    Malformed(String),

    #[error("Security access failed: {0}")]
    SecurityAccessFailed(String),

    #[error("No module selected")]
    NoTarget,

    /// Adapter initialization was refused (not a lost link)
    #[error("Adapter error: {0}")]
    Adapter(#[source] TransportError),
}

impl SessionError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::LinkLost(_))
    }
}
