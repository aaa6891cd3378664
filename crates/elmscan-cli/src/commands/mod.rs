//! Command implementations for elmscan

pub mod dtcs;
pub mod modules;
pub mod ports;
pub mod read;
pub mod scan;
pub mod sweep;

pub use dtcs::dtcs;
pub use modules::modules;
pub use ports::ports;
pub use read::read;
pub use scan::{resume, scan};
pub use sweep::sweep;

use anyhow::{anyhow, Context, Result};
use elmscan_uds::address::{ModuleAddressBook, ModuleEndpoint};
use elmscan_uds::config::DiagConfig;
use elmscan_uds::isotp::IsoTpChannel;
use elmscan_uds::scanner::{DiscoveryScanner, JsonFileStore, ScanControl};
use elmscan_uds::session::UdsSession;
use elmscan_uds::transport::{create_transport, AdapterTransport};
use tracing::info;

pub type Scanner = DiscoveryScanner<Box<dyn AdapterTransport>>;

/// Module table from the built-ins plus config entries
pub fn address_book(config: &DiagConfig) -> ModuleAddressBook {
    let mut book = ModuleAddressBook::well_known();
    book.extend_from_config(&config.modules);
    book
}

/// Open and initialize the adapter, and wrap it in a scanner
pub async fn connect(config: &DiagConfig) -> Result<Scanner> {
    let transport = create_transport(&config.adapter).context("Failed to open adapter")?;
    let channel = IsoTpChannel::new(transport, config.isotp.clone());
    let mut session = UdsSession::new(channel, config.session.clone());
    session
        .reset_adapter(&config.elm)
        .await
        .context("Adapter initialization failed")?;

    let store = JsonFileStore::new(&config.scan.checkpoint_dir);
    Ok(DiscoveryScanner::new(
        session,
        store,
        config.scan.clone(),
        address_book(config),
    ))
}

/// Look a module up by name
pub fn resolve(book: &ModuleAddressBook, name: &str) -> Result<ModuleEndpoint> {
    book.resolve(name).ok_or_else(|| {
        let known: Vec<String> = book.list().into_iter().map(|m| m.name).collect();
        anyhow!("Unknown module '{}'. Known modules: {}", name, known.join(", "))
    })
}

/// Cancel `control` on Ctrl-C; the scan stops before its next probe
pub fn cancel_on_ctrl_c(control: ScanControl) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, stopping after the current probe");
            control.cancel();
        }
    });
}

/// Parse "F190", "0xF190" or "0XF190"
pub fn parse_hex_u16(text: &str) -> Result<u16, String> {
    let digits = text
        .trim()
        .trim_start_matches("0x")
        .trim_start_matches("0X");
    u16::from_str_radix(digits, 16).map_err(|e| format!("invalid hex identifier '{}': {}", text, e))
}
