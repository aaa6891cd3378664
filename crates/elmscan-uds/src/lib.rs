//! elmscan-uds - UDS diagnostics through ELM327 serial adapters
//!
//! This crate talks UDS (ISO 14229) to vehicle modules over ISO-TP
//! (ISO 15765-2) framing, with an ELM327-class adapter doing the CAN work,
//! and discovers which identifiers a module supports with resumable scans.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    DiscoveryScanner                         │
//! │  plan → probe → classify → checkpoint (CheckpointStore)     │
//! │                          │                                  │
//! │                    ┌─────┴─────┐   ┌──────────────────┐     │
//! │                    │UdsSession │   │ModuleAddressBook │     │
//! │                    │(state,    │   │(names → CAN IDs) │     │
//! │                    │ retries)  │   └──────────────────┘     │
//! │                    └─────┬─────┘                            │
//! │                    ┌─────┴─────┐                            │
//! │                    │IsoTpChannel│                           │
//! │                    │(SF/FF/CF/FC)│                          │
//! │                    └─────┬─────┘                            │
//! │                 ┌────────┴────────┐                         │
//! │                 │AdapterTransport │                         │
//! │                 │(ELM327 / mock)  │                         │
//! │                 └─────────────────┘                         │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Each layer exclusively owns the one below it, so at most one exchange is
//! ever in flight.

pub mod address;
pub mod config;
pub mod error;
pub mod isotp;
pub mod scanner;
pub mod session;
pub mod transport;
pub mod uds;

mod serde_hex;

pub use address::{Bus, ModuleAddressBook, ModuleEndpoint};
pub use config::{DiagConfig, ScanConfig};
pub use error::{CheckpointError, ScanError};
pub use isotp::{ChannelError, IsoTpChannel};
pub use scanner::{
    DiscoveryPass, DiscoveryScanner, IdentifierRange, JsonFileStore, MemoryStore, ProbeClass,
    ScanControl, ScanMode, ScanRun, ScanStatus,
};
pub use session::{SessionError, SessionLevel, UdsSession};
pub use transport::{create_transport, AdapterTransport, ElmTransport, MockAdapter, TransportError};
pub use uds::{NegativeResponseCode, NrcClass, UdsRequest, UdsResponse};
