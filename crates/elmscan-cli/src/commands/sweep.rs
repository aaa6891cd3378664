//! Sweep command - find modules on a bus

use std::ops::RangeInclusive;

use anyhow::{Context, Result};
use elmscan_uds::address::Bus;
use elmscan_uds::config::DiagConfig;

use super::{cancel_on_ctrl_c, connect};
use crate::output;

pub async fn sweep(config: &DiagConfig, bus: Bus, request_ids: RangeInclusive<u16>) -> Result<()> {
    let mut scanner = connect(config).await?;
    cancel_on_ctrl_c(scanner.control());

    let found = scanner
        .sweep_modules(bus, request_ids)
        .await
        .context("Module sweep failed")?;
    output::print(&found)
}
