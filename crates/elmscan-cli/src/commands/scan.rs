//! Scan and resume commands - identifier discovery

use anyhow::{Context, Result};
use elmscan_uds::config::DiagConfig;
use elmscan_uds::scanner::{DiscoveryPass, IdentifierRange, ScanMode, ScanRun};
use elmscan_uds::ScanError;
use tracing::warn;
use uuid::Uuid;

use super::{cancel_on_ctrl_c, connect, resolve};
use crate::output::{self, ScanReport};

/// Start a new scan
pub async fn scan(
    config: &DiagConfig,
    module: &str,
    mode: ScanMode,
    range: IdentifierRange,
    pass: DiscoveryPass,
) -> Result<()> {
    let scanner = connect(config).await?;
    let mut scanner = scanner.with_pass(pass);
    let endpoint = resolve(scanner.address_book(), module)?;
    cancel_on_ctrl_c(scanner.control());

    let result = scanner.run(&endpoint, range, mode).await;
    report(config, result)
}

/// Continue a checkpointed scan
pub async fn resume(config: &DiagConfig, run_id: Uuid) -> Result<()> {
    let mut scanner = connect(config).await?;
    cancel_on_ctrl_c(scanner.control());

    let result = scanner.resume_latest(run_id).await;
    report(config, result)
}

fn report(config: &DiagConfig, result: Result<ScanRun, ScanError>) -> Result<()> {
    let dir = &config.scan.checkpoint_dir;
    match result {
        Ok(run) => output::print(&ScanReport::new(&run, dir)),
        Err(err) => {
            if let Some(run) = err.run() {
                if matches!(err, ScanError::CheckpointFailed { .. }) {
                    warn!(run_id = %run.id, "Final checkpoint failed; these results are not saved");
                } else {
                    warn!(run_id = %run.id, "Scan aborted; resume it once the adapter is back");
                }
                output::print(&ScanReport::new(run, dir))?;
            }
            Err(err).context("Scan failed")
        }
    }
}
