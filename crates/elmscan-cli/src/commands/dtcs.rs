//! DTCs command - ReadDTCInformation by status mask

use anyhow::{bail, Context, Result};
use elmscan_uds::config::DiagConfig;
use elmscan_uds::uds::{parse_dtc_by_status_mask, UdsOutcome, UdsRequest};

use super::{connect, resolve};
use crate::output;

pub async fn dtcs(config: &DiagConfig, module: &str, status_mask: u8) -> Result<()> {
    let mut scanner = connect(config).await?;
    let endpoint = resolve(scanner.address_book(), module)?;

    let response = scanner
        .session_mut()
        .request(&UdsRequest::read_dtc_by_status_mask(status_mask), &endpoint)
        .await?;

    match &response.outcome {
        UdsOutcome::Positive(positive) => {
            let report = parse_dtc_by_status_mask(positive).context("Failed to decode DTC list")?;
            output::print(&report)
        }
        UdsOutcome::Negative { nrc, .. } => {
            bail!("{} refused ReadDTCInformation: {} (0x{:02X})", endpoint.name, nrc, u8::from(*nrc))
        }
        UdsOutcome::NoResponse => bail!("{} did not respond", endpoint.name),
        UdsOutcome::MalformedFrame { reason } => bail!("Malformed response: {}", reason),
    }
}
