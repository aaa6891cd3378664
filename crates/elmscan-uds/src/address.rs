//! Module address book
//!
//! Maps logical module names to their 11-bit request/response identifiers and
//! the CAN bus they live on. Seeded from the well-known physical addresses
//! used on HS-CAN (500 kbit/s) and MS-CAN (125 kbit/s); entries found by a
//! sweep or listed in the config are added on top.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::ModuleConfig;

/// Physical bus behind the OBD connector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Bus {
    /// High-speed CAN, pins 6/14
    Hs,
    /// Medium-speed CAN, pins 3/11
    Ms,
}

impl fmt::Display for Bus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hs => write!(f, "HS-CAN"),
            Self::Ms => write!(f, "MS-CAN"),
        }
    }
}

/// Where to send a request and where its answer comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleEndpoint {
    pub name: String,
    pub request_id: u16,
    pub response_id: u16,
    pub bus: Bus,
    /// Set once a module answered anything at all
    #[serde(default)]
    pub believed_present: bool,
}

impl ModuleEndpoint {
    pub fn new(name: impl Into<String>, request_id: u16, response_id: u16, bus: Bus) -> Self {
        Self {
            name: name.into(),
            request_id,
            response_id,
            bus,
            believed_present: false,
        }
    }

    /// Physical addressing convention: response ID is request ID + 8
    pub fn conventional(name: impl Into<String>, request_id: u16, bus: Bus) -> Self {
        Self::new(name, request_id, request_id + 8, bus)
    }

    /// Same wire addressing, ignoring name and presence
    pub fn same_address(&self, other: &ModuleEndpoint) -> bool {
        self.request_id == other.request_id
            && self.response_id == other.response_id
            && self.bus == other.bus
    }
}

impl fmt::Display for ModuleEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (0x{:03X}/0x{:03X} on {})",
            self.name, self.request_id, self.response_id, self.bus
        )
    }
}

const WELL_KNOWN_MODULES: &[(&str, u16, u16, Bus)] = &[
    ("PCM", 0x7E0, 0x7E8, Bus::Hs),
    ("TCM", 0x7E1, 0x7E9, Bus::Hs),
    ("ABS", 0x760, 0x768, Bus::Hs),
    ("RCM", 0x737, 0x73F, Bus::Hs),
    ("PSCM", 0x730, 0x738, Bus::Hs),
    ("GWM", 0x716, 0x71E, Bus::Hs),
    ("PAM", 0x736, 0x73E, Bus::Hs),
    ("IPC", 0x720, 0x728, Bus::Ms),
    ("BCM", 0x726, 0x72E, Bus::Ms),
    ("ACM", 0x727, 0x72F, Bus::Ms),
    ("HVAC", 0x733, 0x73B, Bus::Ms),
    ("DDM", 0x740, 0x748, Bus::Ms),
    ("PDM", 0x741, 0x749, Bus::Ms),
    ("APIM", 0x7D0, 0x7D8, Bus::Ms),
];

/// Name-indexed module table
#[derive(Debug, Clone)]
pub struct ModuleAddressBook {
    modules: BTreeMap<String, ModuleEndpoint>,
}

impl Default for ModuleAddressBook {
    fn default() -> Self {
        Self::well_known()
    }
}

impl ModuleAddressBook {
    /// An empty book
    pub fn new() -> Self {
        Self {
            modules: BTreeMap::new(),
        }
    }

    /// A book seeded with the well-known module addresses
    pub fn well_known() -> Self {
        let mut book = Self::new();
        for (name, request_id, response_id, bus) in WELL_KNOWN_MODULES {
            book.insert(ModuleEndpoint::new(*name, *request_id, *response_id, *bus));
        }
        book
    }

    fn key(name: &str) -> String {
        name.trim().to_ascii_uppercase()
    }

    fn insert(&mut self, endpoint: ModuleEndpoint) {
        self.modules.insert(Self::key(&endpoint.name), endpoint);
    }

    /// Case-insensitive lookup
    pub fn resolve(&self, name: &str) -> Option<ModuleEndpoint> {
        self.modules.get(&Self::key(name)).cloned()
    }

    /// First entry at the given request ID on the given bus
    pub fn find_by_request_id(&self, bus: Bus, request_id: u16) -> Option<ModuleEndpoint> {
        self.modules
            .values()
            .find(|m| m.bus == bus && m.request_id == request_id)
            .cloned()
    }

    /// Add or replace a module that was seen answering on the bus
    pub fn record_discovered(&mut self, mut endpoint: ModuleEndpoint) {
        endpoint.believed_present = true;
        info!(
            module = %endpoint.name,
            request_id = format!("0x{:03X}", endpoint.request_id),
            bus = %endpoint.bus,
            "Recorded discovered module"
        );
        self.insert(endpoint);
    }

    /// Update the believed-present flag. Returns false for unknown names.
    pub fn set_presence(&mut self, name: &str, present: bool) -> bool {
        match self.modules.get_mut(&Self::key(name)) {
            Some(endpoint) => {
                if endpoint.believed_present != present {
                    debug!(module = %endpoint.name, present, "Module presence changed");
                }
                endpoint.believed_present = present;
                true
            }
            None => false,
        }
    }

    /// Merge modules from configuration; config entries win over built-ins
    pub fn extend_from_config(&mut self, modules: &[ModuleConfig]) {
        for module in modules {
            let response_id = module.response_id.unwrap_or(module.request_id + 8);
            self.insert(ModuleEndpoint::new(
                module.name.clone(),
                module.request_id,
                response_id,
                module.bus,
            ));
        }
    }

    /// All modules ordered by name
    pub fn list(&self) -> Vec<ModuleEndpoint> {
        self.modules.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_is_case_insensitive() {
        let book = ModuleAddressBook::well_known();
        let pcm = book.resolve("pcm").unwrap();
        assert_eq!(pcm.request_id, 0x7E0);
        assert_eq!(pcm.response_id, 0x7E8);
        assert_eq!(pcm.bus, Bus::Hs);
        assert!(!pcm.believed_present);

        assert_eq!(book.resolve(" Bcm ").unwrap().bus, Bus::Ms);
        assert!(book.resolve("XYZ").is_none());
    }

    #[test]
    fn test_record_discovered_marks_present() {
        let mut book = ModuleAddressBook::new();
        book.record_discovered(ModuleEndpoint::conventional("ECU_7A0", 0x7A0, Bus::Hs));

        let found = book.find_by_request_id(Bus::Hs, 0x7A0).unwrap();
        assert_eq!(found.response_id, 0x7A8);
        assert!(found.believed_present);
        assert!(book.find_by_request_id(Bus::Ms, 0x7A0).is_none());
    }

    #[test]
    fn test_set_presence() {
        let mut book = ModuleAddressBook::well_known();
        assert!(book.set_presence("abs", true));
        assert!(book.resolve("ABS").unwrap().believed_present);
        assert!(book.set_presence("ABS", false));
        assert!(!book.resolve("ABS").unwrap().believed_present);
        assert!(!book.set_presence("nothing", true));
    }

    #[test]
    fn test_extend_from_config() {
        let mut book = ModuleAddressBook::new();
        book.extend_from_config(&[
            ModuleConfig {
                name: "Custom".to_string(),
                request_id: 0x7A4,
                response_id: None,
                bus: Bus::Ms,
            },
            ModuleConfig {
                name: "Odd".to_string(),
                request_id: 0x701,
                response_id: Some(0x781),
                bus: Bus::Hs,
            },
        ]);

        assert_eq!(book.resolve("custom").unwrap().response_id, 0x7AC);
        assert_eq!(book.resolve("ODD").unwrap().response_id, 0x781);
        assert_eq!(
            book.list().iter().map(|m| m.name.as_str()).collect::<Vec<_>>(),
            vec!["Custom", "Odd"]
        );
    }
}
