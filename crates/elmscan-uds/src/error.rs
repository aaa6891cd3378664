//! Scan-level errors

use std::path::PathBuf;

use thiserror::Error;
use uuid::Uuid;

use crate::scanner::ScanRun;
use crate::session::SessionError;
use crate::transport::TransportError;

/// Errors that end a scan
#[derive(Debug, Error)]
pub enum ScanError {
    /// The adapter went away. `run` is the state as checkpointed just before returning.
    #[error("Adapter link lost during scan {}: {source}", .run.id)]
    LinkLost {
        run: Box<ScanRun>,
        #[source]
        source: TransportError,
    },

    /// A module confirmed in an earlier run no longer answers TesterPresent
    #[error("Module {module} no longer responds")]
    ModuleUnresponsive { module: String },

    /// A final checkpoint (cancel or completion) could not be written; `run` is what was lost
    #[error("Could not checkpoint scan {}: {source}", .run.id)]
    CheckpointFailed {
        run: Box<ScanRun>,
        #[source]
        source: CheckpointError,
    },

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),
}

impl ScanError {
    /// The run carried by the error, if any
    pub fn run(&self) -> Option<&ScanRun> {
        match self {
            Self::LinkLost { run, .. } | Self::CheckpointFailed { run, .. } => Some(run),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Snapshot encoding failed: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("No checkpoint found for run {0}")]
    NotFound(Uuid),

    /// Snapshots are never overwritten
    #[error("Snapshot {} already exists", .0.display())]
    AlreadyExists(PathBuf),
}
