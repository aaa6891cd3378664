//! Read command - ReadDataByIdentifier

use anyhow::Result;
use elmscan_uds::config::DiagConfig;
use elmscan_uds::uds::{UdsOutcome, UdsRequest};

use super::{connect, resolve};
use crate::output::{self, ReadRow};

/// Read one or more data identifiers from a module
pub async fn read(config: &DiagConfig, module: &str, dids: &[u16]) -> Result<()> {
    let mut scanner = connect(config).await?;
    let endpoint = resolve(scanner.address_book(), module)?;

    let mut rows = Vec::with_capacity(dids.len());
    for &did in dids {
        let response = scanner
            .session_mut()
            .request(&UdsRequest::read_data_by_identifier(did), &endpoint)
            .await?;

        let did = format!("0x{:04X}", did);
        let row = match &response.outcome {
            UdsOutcome::Positive(positive) => ReadRow {
                did,
                outcome: "positive",
                data: Some(hex::encode_upper(positive.record())),
                ascii: output::ascii(positive.record()),
                nrc: None,
            },
            UdsOutcome::Negative { nrc, .. } => ReadRow {
                did,
                outcome: "negative",
                data: None,
                ascii: None,
                nrc: Some(format!("{} (0x{:02X})", nrc, u8::from(*nrc))),
            },
            UdsOutcome::NoResponse => ReadRow {
                did,
                outcome: "no_response",
                data: None,
                ascii: None,
                nrc: None,
            },
            UdsOutcome::MalformedFrame { reason } => ReadRow {
                did,
                outcome: "malformed",
                data: Some(hex::encode_upper(&response.raw)),
                ascii: Some(reason.clone()),
                nrc: None,
            },
        };
        rows.push(row);
    }

    output::print(&rows)
}
