//! Adapter transport for ELM327-class serial CAN interfaces
//!
//! This module provides:
//! - the [`AdapterTransport`] trait: AT configuration and raw command exchange
//! - [`ElmTransport`], the implementation over a serial port (or any async stream)
//! - [`MockAdapter`], an in-process ELM327 with simulated ECUs for tests and demos
//! - the ELM327 text protocol: AT command builders, reply tokenizing, status lines
//!
//! # Example
//!
//! ```ignore
//! use elmscan_uds::transport::{AdapterTransport, ElmTransport};
//! use elmscan_uds::config::AdapterOptions;
//!
//! let mut transport = ElmTransport::open("/dev/ttyUSB0", 38400)?;
//! transport.configure(&AdapterOptions::default()).await?;
//! let reply = transport.exchange("0322F190", Duration::from_millis(1000)).await?;
//! ```

mod adapter;
pub mod elm;
pub mod error;
pub mod mock;
mod serial;

pub use adapter::{AdapterTransport, WireRecord};
pub use elm::{at, AdapterCondition, FrameParseError, RawResponse};
pub use error::TransportError;
pub use mock::{MockAdapter, MockHandle, SimulatedEcu};
pub use serial::ElmTransport;

use crate::config::AdapterConfig;

/// Build the transport selected by configuration
pub fn create_transport(config: &AdapterConfig) -> Result<Box<dyn AdapterTransport>, TransportError> {
    match config {
        AdapterConfig::Serial(serial) => {
            let transport = ElmTransport::open(&serial.port, serial.baud_rate)?;
            Ok(Box::new(transport))
        }
        AdapterConfig::Mock(mock) => Ok(Box::new(MockAdapter::demo_vehicle(mock))),
    }
}

