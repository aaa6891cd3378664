//! Module sweep
//!
//! Sends a physically addressed TesterPresent to every candidate 11-bit
//! request ID on one bus. Anything that answers (positively or not) is a
//! module; each one found gets the standard identification DIDs read so the
//! address book entry carries something a human can recognise.

use std::ops::RangeInclusive;

use serde::Serialize;
use tracing::{debug, info};

use super::DiscoveryScanner;
use crate::address::{Bus, ModuleEndpoint};
use crate::error::ScanError;
use crate::session::SessionError;
use crate::transport::AdapterTransport;
use crate::uds::{standard_did, UdsRequest};

/// Highest 11-bit identifier
const MAX_STANDARD_ID: u16 = 0x7FF;
/// Physical response ID offset
const RESPONSE_OFFSET: u16 = 8;

/// Identification strings read from a module
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ModuleIdentity {
    /// VIN (DID 0xF190)
    pub vin: Option<String>,
    /// Spare part number (DID 0xF187)
    pub part_number: Option<String>,
    /// ECU serial number (DID 0xF18C)
    pub serial_number: Option<String>,
    /// Supplier software version (DID 0xF195)
    pub software_version: Option<String>,
}

/// A module that answered during a sweep
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveredModule {
    pub endpoint: ModuleEndpoint,
    pub identity: ModuleIdentity,
}

impl<T: AdapterTransport> DiscoveryScanner<T> {
    /// Probe each request ID in `request_ids` on `bus` and record responders.
    ///
    /// IDs whose response ID would leave the 11-bit space are skipped. Known
    /// addresses keep their address book name; others are named by request ID.
    pub async fn sweep_modules(
        &mut self,
        bus: Bus,
        request_ids: RangeInclusive<u16>,
    ) -> Result<Vec<DiscoveredModule>, ScanError> {
        info!(
            %bus,
            from = format!("0x{:03X}", request_ids.start()),
            to = format!("0x{:03X}", request_ids.end()),
            "Starting module sweep"
        );

        let mut found = Vec::new();
        for request_id in request_ids {
            if self.control.is_cancelled() {
                info!("Module sweep cancelled");
                break;
            }
            if request_id > MAX_STANDARD_ID - RESPONSE_OFFSET {
                continue;
            }

            let endpoint = self
                .address_book
                .find_by_request_id(bus, request_id)
                .unwrap_or_else(|| {
                    ModuleEndpoint::conventional(format!("0x{:03X}", request_id), request_id, bus)
                });

            self.pace().await;
            let response = self
                .session
                .request(&UdsRequest::tester_present(false), &endpoint)
                .await?;
            if !response.confirms_presence() {
                continue;
            }

            debug!(module = %endpoint.name, outcome = ?response.outcome, "Module answered");
            let identity = self.read_identity(&endpoint).await?;
            info!(
                module = %endpoint.name,
                request_id = format!("0x{:03X}", endpoint.request_id),
                vin = ?identity.vin,
                part_number = ?identity.part_number,
                sw_version = ?identity.software_version,
                "Identified module"
            );

            self.address_book.record_discovered(endpoint.clone());
            found.push(DiscoveredModule {
                endpoint: ModuleEndpoint {
                    believed_present: true,
                    ..endpoint
                },
                identity,
            });
        }

        info!(%bus, discovered = found.len(), "Module sweep complete");
        Ok(found)
    }

    async fn read_identity(
        &mut self,
        endpoint: &ModuleEndpoint,
    ) -> Result<ModuleIdentity, SessionError> {
        let mut identity = ModuleIdentity::default();
        for &(did, _) in standard_did::IDENTIFICATION_DIDS {
            self.pace().await;
            let response = self
                .session
                .request(&UdsRequest::read_data_by_identifier(did), endpoint)
                .await?;
            let Some(value) = response.positive().and_then(|p| did_string(p.record())) else {
                continue;
            };
            let slot = match did {
                standard_did::VIN => &mut identity.vin,
                standard_did::SPARE_PART_NUMBER => &mut identity.part_number,
                standard_did::ECU_SERIAL_NUMBER => &mut identity.serial_number,
                standard_did::SUPPLIER_SW_VERSION => &mut identity.software_version,
                _ => continue,
            };
            *slot = Some(value);
        }
        Ok(identity)
    }
}

/// Printable ASCII with padding stripped; `None` when nothing is left
fn did_string(record: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(record);
    let trimmed = text.trim_matches(|c: char| c.is_whitespace() || c.is_control() || c == '\u{FFFD}');
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_did_string() {
        assert_eq!(did_string(b"PCM00042"), Some("PCM00042".to_string()));
        assert_eq!(did_string(b"GX73 \0\0"), Some("GX73".to_string()));
        assert_eq!(did_string(&[0x00, 0xFF]), None);
        assert_eq!(did_string(&[]), None);
    }
}
