//! elmscan - UDS diagnostics and identifier discovery over ELM327 adapters
//!
//! Reads identifiers, sweeps a bus for modules, and runs resumable discovery
//! scans. Output is JSON on stdout; logs go to stderr.

mod commands;
mod config;
mod output;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use elmscan_uds::address::Bus;
use elmscan_uds::scanner::{DiscoveryPass, IdentifierRange, ScanMode};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use uuid::Uuid;

use crate::commands::parse_hex_u16;
use crate::config::Overrides;

#[derive(Parser)]
#[command(name = "elmscan")]
#[command(author, version, about = "UDS diagnostics over ELM327 adapters")]
#[command(propagate_version = true)]
struct Cli {
    /// Serial port of the adapter
    #[arg(short, long, env = "ELMSCAN_PORT", global = true)]
    port: Option<String>,

    /// Serial baud rate
    #[arg(short, long, global = true)]
    baud: Option<u32>,

    /// Configuration file path
    #[arg(short, long, env = "ELMSCAN_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Use the simulated vehicle instead of an adapter
    #[arg(long, global = true)]
    mock: bool,

    /// Where scan checkpoints are written
    #[arg(long, global = true)]
    checkpoint_dir: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List serial ports
    Ports,

    /// List known modules
    Modules,

    /// Probe request IDs on a bus for modules
    Sweep {
        #[arg(long, value_enum, default_value = "hs")]
        bus: BusArg,

        /// First request ID (hex)
        #[arg(long, default_value = "700", value_parser = parse_hex_u16)]
        from: u16,

        /// Last request ID (hex)
        #[arg(long, default_value = "7F7", value_parser = parse_hex_u16)]
        to: u16,
    },

    /// Read data identifiers
    Read {
        /// Module name (e.g. PCM)
        module: String,

        /// Data identifiers (hex)
        #[arg(required = true, value_parser = parse_hex_u16)]
        dids: Vec<u16>,
    },

    /// Discover which identifiers a module supports
    Scan {
        /// Module name (e.g. PCM)
        module: String,

        #[arg(long, value_enum, default_value = "quick")]
        mode: ModeArg,

        /// Service probed per identifier
        #[arg(long, value_enum, default_value = "data")]
        pass: PassArg,

        /// First identifier (hex)
        #[arg(long, default_value = "0000", value_parser = parse_hex_u16)]
        start: u16,

        /// Last identifier (hex)
        #[arg(long, default_value = "FFFF", value_parser = parse_hex_u16)]
        end: u16,
    },

    /// Continue a cancelled or aborted scan
    Resume {
        /// Run ID printed by the scan
        run_id: Uuid,
    },

    /// Read stored DTCs
    Dtcs {
        /// Module name (e.g. PCM)
        module: String,

        /// DTC status mask (hex)
        #[arg(long, default_value = "FF", value_parser = parse_hex_u8)]
        mask: u8,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum BusArg {
    /// High-speed CAN (500 kbit/s)
    Hs,
    /// Medium-speed CAN (125 kbit/s)
    Ms,
}

impl From<BusArg> for Bus {
    fn from(bus: BusArg) -> Self {
        match bus {
            BusArg::Hs => Bus::Hs,
            BusArg::Ms => Bus::Ms,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ModeArg {
    /// Curated sub-ranges only
    Quick,
    /// Every identifier
    Full,
    /// Exactly --start..=--end
    Custom,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PassArg {
    /// ReadDataByIdentifier
    Data,
    /// RoutineControl requestResults
    Routines,
    /// InputOutputControl returnControlToECU
    Outputs,
}

impl From<PassArg> for DiscoveryPass {
    fn from(pass: PassArg) -> Self {
        match pass {
            PassArg::Data => DiscoveryPass::DataIdentifiers,
            PassArg::Routines => DiscoveryPass::Routines,
            PassArg::Outputs => DiscoveryPass::Outputs,
        }
    }
}

fn parse_hex_u8(text: &str) -> Result<u8, String> {
    let value = parse_hex_u16(text)?;
    u8::try_from(value).map_err(|_| format!("'{}' does not fit in one byte", text))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let default_filter = if cli.verbose {
        "elmscan=debug,elmscan_uds=debug"
    } else {
        "elmscan=info,elmscan_uds=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .init();

    // Load config file
    let file_config = match &cli.config {
        Some(path) => config::load_from(path)?,
        None => config::load()?,
    };

    // Merge CLI args with config
    let config = config::merge_with_args(
        file_config,
        &Overrides {
            port: cli.port.clone(),
            baud: cli.baud,
            mock: cli.mock,
            checkpoint_dir: cli.checkpoint_dir.clone(),
        },
    );

    // Execute command
    match cli.command {
        Commands::Ports => commands::ports()?,

        Commands::Modules => commands::modules(&config)?,

        Commands::Sweep { bus, from, to } => {
            commands::sweep(&config, bus.into(), from.min(to)..=from.max(to)).await?;
        }

        Commands::Read { module, dids } => {
            commands::read(&config, &module, &dids).await?;
        }

        Commands::Scan {
            module,
            mode,
            pass,
            start,
            end,
        } => {
            let range = IdentifierRange::new(start, end);
            let mode = match mode {
                ModeArg::Quick => ScanMode::Quick,
                ModeArg::Full => ScanMode::Full,
                ModeArg::Custom => ScanMode::Custom {
                    start: range.start,
                    end: range.end,
                },
            };
            commands::scan(&config, &module, mode, range, pass.into()).await?;
        }

        Commands::Resume { run_id } => {
            commands::resume(&config, run_id).await?;
        }

        Commands::Dtcs { module, mask } => {
            commands::dtcs(&config, &module, mask).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_scan_arguments() {
        let cli = Cli::parse_from([
            "elmscan", "--mock", "scan", "PCM", "--mode", "custom", "--start", "0xF180", "--end",
            "F19F",
        ]);
        assert!(cli.mock);
        let Commands::Scan {
            module, start, end, ..
        } = cli.command
        else {
            panic!("expected scan");
        };
        assert_eq!(module, "PCM");
        assert_eq!((start, end), (0xF180, 0xF19F));
    }

    #[test]
    fn test_parse_hex_u8() {
        assert_eq!(parse_hex_u8("0x2F"), Ok(0x2F));
        assert!(parse_hex_u8("100").is_err());
    }
}
