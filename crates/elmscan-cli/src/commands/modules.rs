//! Modules command - show the address book

use anyhow::Result;
use elmscan_uds::config::DiagConfig;

use super::address_book;
use crate::output::{self, ModuleRow};

pub fn modules(config: &DiagConfig) -> Result<()> {
    let rows: Vec<ModuleRow> = address_book(config).list().iter().map(ModuleRow::from).collect();
    output::print(&rows)
}
