//! Scan snapshots
//!
//! Every checkpoint is a new immutable snapshot. [`JsonFileStore`] lays them
//! out as `<dir>/<run-id>/<seq>.json`, writing a temporary file first and
//! renaming it into place so a crash never leaves a torn snapshot behind.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::debug;
use uuid::Uuid;

use super::ScanRun;
use crate::error::CheckpointError;

pub trait CheckpointStore: Send + Sync {
    /// Persist a snapshot under the run's current `checkpoint_seq`
    fn save(&self, run: &ScanRun) -> Result<(), CheckpointError>;

    /// The snapshot with the highest sequence number
    fn load_latest(&self, run_id: Uuid) -> Result<ScanRun, CheckpointError>;

    fn list_runs(&self) -> Result<Vec<Uuid>, CheckpointError>;
}

pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn run_dir(&self, run_id: Uuid) -> PathBuf {
        self.dir.join(run_id.to_string())
    }

    /// Path of a given snapshot
    pub fn snapshot_path(&self, run_id: Uuid, seq: u32) -> PathBuf {
        self.run_dir(run_id).join(format!("{:06}.json", seq))
    }

    /// Sequence numbers present for a run, ascending
    pub fn sequences(&self, run_id: Uuid) -> Result<Vec<u32>, CheckpointError> {
        let run_dir = self.run_dir(run_id);
        let entries = match fs::read_dir(&run_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(CheckpointError::NotFound(run_id))
            }
            Err(source) => return Err(io_error(&run_dir, source)),
        };

        let mut sequences: Vec<u32> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let path = entry.path();
                if path.extension()? != "json" {
                    return None;
                }
                path.file_stem()?.to_str()?.parse().ok()
            })
            .collect();
        sequences.sort_unstable();
        Ok(sequences)
    }
}

fn io_error(path: &Path, source: std::io::Error) -> CheckpointError {
    CheckpointError::Io {
        path: path.to_path_buf(),
        source,
    }
}

impl CheckpointStore for JsonFileStore {
    fn save(&self, run: &ScanRun) -> Result<(), CheckpointError> {
        let run_dir = self.run_dir(run.id);
        fs::create_dir_all(&run_dir).map_err(|e| io_error(&run_dir, e))?;

        let path = self.snapshot_path(run.id, run.checkpoint_seq);
        if path.exists() {
            return Err(CheckpointError::AlreadyExists(path));
        }

        let json = serde_json::to_vec_pretty(run)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json).map_err(|e| io_error(&tmp, e))?;
        fs::rename(&tmp, &path).map_err(|e| io_error(&path, e))?;

        debug!(run_id = %run.id, seq = run.checkpoint_seq, path = %path.display(), "Checkpoint written");
        Ok(())
    }

    fn load_latest(&self, run_id: Uuid) -> Result<ScanRun, CheckpointError> {
        let seq = self
            .sequences(run_id)?
            .last()
            .copied()
            .ok_or(CheckpointError::NotFound(run_id))?;
        let path = self.snapshot_path(run_id, seq);
        let json = fs::read(&path).map_err(|e| io_error(&path, e))?;
        Ok(serde_json::from_slice(&json)?)
    }

    fn list_runs(&self) -> Result<Vec<Uuid>, CheckpointError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(io_error(&self.dir, source)),
        };
        let mut runs: Vec<Uuid> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_dir())
            .filter_map(|entry| entry.file_name().to_str()?.parse().ok())
            .collect();
        runs.sort();
        Ok(runs)
    }
}

/// Keeps every snapshot in memory
#[derive(Default)]
pub struct MemoryStore {
    snapshots: Mutex<BTreeMap<Uuid, Vec<ScanRun>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All snapshots of a run in save order
    pub fn snapshots(&self, run_id: Uuid) -> Vec<ScanRun> {
        self.snapshots
            .lock()
            .get(&run_id)
            .cloned()
            .unwrap_or_default()
    }
}

impl CheckpointStore for MemoryStore {
    fn save(&self, run: &ScanRun) -> Result<(), CheckpointError> {
        self.snapshots
            .lock()
            .entry(run.id)
            .or_default()
            .push(run.clone());
        Ok(())
    }

    fn load_latest(&self, run_id: Uuid) -> Result<ScanRun, CheckpointError> {
        self.snapshots
            .lock()
            .get(&run_id)
            .and_then(|snapshots| snapshots.last().cloned())
            .ok_or(CheckpointError::NotFound(run_id))
    }

    fn list_runs(&self) -> Result<Vec<Uuid>, CheckpointError> {
        Ok(self.snapshots.lock().keys().copied().collect())
    }
}

impl<S: CheckpointStore + ?Sized> CheckpointStore for std::sync::Arc<S> {
    fn save(&self, run: &ScanRun) -> Result<(), CheckpointError> {
        (**self).save(run)
    }

    fn load_latest(&self, run_id: Uuid) -> Result<ScanRun, CheckpointError> {
        (**self).load_latest(run_id)
    }

    fn list_runs(&self) -> Result<Vec<Uuid>, CheckpointError> {
        (**self).list_runs()
    }
}
