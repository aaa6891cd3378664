//! JSON output for elmscan
//!
//! Everything printed on stdout is JSON so it can be piped into other
//! tooling; logs go to stderr.

use std::path::Path;

use anyhow::{Context, Result};
use elmscan_uds::address::{Bus, ModuleEndpoint};
use elmscan_uds::scanner::{ScanRun, ScanStatus, ScanSummary};
use serde::Serialize;
use uuid::Uuid;

/// Print a value as pretty JSON
pub fn print<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("Failed to encode output")?;
    println!("{}", json);
    Ok(())
}

#[derive(Debug, Serialize)]
pub struct PortRow {
    pub name: String,
    pub kind: String,
}

#[derive(Debug, Serialize)]
pub struct ModuleRow {
    pub name: String,
    pub request_id: String,
    pub response_id: String,
    pub bus: Bus,
    pub believed_present: bool,
}

impl From<&ModuleEndpoint> for ModuleRow {
    fn from(endpoint: &ModuleEndpoint) -> Self {
        Self {
            name: endpoint.name.clone(),
            request_id: format!("0x{:03X}", endpoint.request_id),
            response_id: format!("0x{:03X}", endpoint.response_id),
            bus: endpoint.bus,
            believed_present: endpoint.believed_present,
        }
    }
}

/// One identifier read
#[derive(Debug, Serialize)]
pub struct ReadRow {
    pub did: String,
    pub outcome: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ascii: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nrc: Option<String>,
}

/// What a scan or resume prints: the run identity and where to find it
#[derive(Debug, Serialize)]
pub struct ScanReport<'a> {
    pub run_id: Uuid,
    pub module: &'a str,
    pub status: ScanStatus,
    pub cursor: Option<String>,
    pub summary: ScanSummary,
    pub checkpoint_dir: String,
    pub run: &'a ScanRun,
}

impl<'a> ScanReport<'a> {
    pub fn new(run: &'a ScanRun, checkpoint_dir: &Path) -> Self {
        Self {
            run_id: run.id,
            module: &run.module.name,
            status: run.status,
            cursor: run.cursor.map(|c| format!("0x{:04X}", c)),
            summary: run.summary(),
            checkpoint_dir: checkpoint_dir.display().to_string(),
            run,
        }
    }
}

/// Printable text when every byte is printable ASCII
pub fn ascii(data: &[u8]) -> Option<String> {
    (!data.is_empty() && data.iter().all(|b| b.is_ascii_graphic() || *b == b' '))
        .then(|| String::from_utf8_lossy(data).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ascii() {
        assert_eq!(ascii(b"GX73-12A650-AB").as_deref(), Some("GX73-12A650-AB"));
        assert_eq!(ascii(&[0x0C]), None);
        assert_eq!(ascii(&[]), None);
    }

    #[test]
    fn test_module_row() {
        let row = ModuleRow::from(&ModuleEndpoint::new("PCM", 0x7E0, 0x7E8, Bus::Hs));
        assert_eq!(row.request_id, "0x7E0");
        assert_eq!(row.response_id, "0x7E8");
    }
}
