//! What a scan probes, and in which session

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::uds::{service_id, UdsRequest};

/// Inclusive 16-bit identifier range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdentifierRange {
    pub start: u16,
    pub end: u16,
}

impl IdentifierRange {
    /// Bounds in either order
    pub fn new(a: u16, b: u16) -> Self {
        Self {
            start: a.min(b),
            end: a.max(b),
        }
    }

    pub fn full() -> Self {
        Self::new(0x0000, 0xFFFF)
    }

    pub fn contains(&self, id: u16) -> bool {
        (self.start..=self.end).contains(&id)
    }

    /// Number of identifiers covered
    pub fn count(&self) -> u32 {
        u32::from(self.end) - u32::from(self.start) + 1
    }

    pub fn intersect(&self, other: &IdentifierRange) -> Option<IdentifierRange> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        (start <= end).then_some(IdentifierRange { start, end })
    }
}

impl fmt::Display for IdentifierRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04X}-0x{:04X}", self.start, self.end)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ScanMode {
    /// Curated sub-ranges where identifiers usually live
    Quick,
    /// Every identifier
    Full,
    Custom { start: u16, end: u16 },
}

/// Which kind of identifier is being discovered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryPass {
    /// ReadDataByIdentifier (0x22)
    #[default]
    DataIdentifiers,
    /// RoutineControl requestRoutineResults (0x31 03)
    Routines,
    /// InputOutputControl returnControlToECU (0x2F .. 00)
    Outputs,
}

impl DiscoveryPass {
    /// A probe that reads or releases, never starts or drives anything
    pub fn request_for(&self, identifier: u16) -> UdsRequest {
        match self {
            Self::DataIdentifiers => UdsRequest::read_data_by_identifier(identifier),
            Self::Routines => UdsRequest::routine_results(identifier),
            Self::Outputs => UdsRequest::io_return_control(identifier),
        }
    }

    pub fn service(&self) -> u8 {
        match self {
            Self::DataIdentifiers => service_id::READ_DATA_BY_ID,
            Self::Routines => service_id::ROUTINE_CONTROL,
            Self::Outputs => service_id::IO_CONTROL_BY_ID,
        }
    }

    pub fn requires_extended(&self) -> bool {
        !matches!(self, Self::DataIdentifiers)
    }
}

/// One contiguous run of identifiers and the session it needs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedSegment {
    pub range: IdentifierRange,
    pub requires_extended: bool,
}

// (start, end, extended session only)
const QUICK_DATA_IDENTIFIERS: &[(u16, u16, bool)] = &[
    (0x0100, 0x01FF, false),
    (0xD100, 0xD1FF, false),
    (0xDD00, 0xDDFF, true),
    (0xF180, 0xF19F, false),
    (0xF400, 0xF4FF, false),
];

const QUICK_ROUTINES: &[(u16, u16, bool)] = &[
    (0x0200, 0x02FF, true),
    (0x0300, 0x03FF, true),
    (0xFF00, 0xFF01, true),
];

const QUICK_OUTPUTS: &[(u16, u16, bool)] = &[(0x4000, 0x40FF, true)];

/// Mode segments intersected with `range`, ascending and non-overlapping
pub fn plan(mode: ScanMode, range: IdentifierRange, pass: DiscoveryPass) -> Vec<PlannedSegment> {
    let candidates: Vec<(IdentifierRange, bool)> = match mode {
        ScanMode::Quick => {
            let curated = match pass {
                DiscoveryPass::DataIdentifiers => QUICK_DATA_IDENTIFIERS,
                DiscoveryPass::Routines => QUICK_ROUTINES,
                DiscoveryPass::Outputs => QUICK_OUTPUTS,
            };
            curated
                .iter()
                .map(|&(start, end, extended)| (IdentifierRange::new(start, end), extended))
                .collect()
        }
        ScanMode::Full => vec![(IdentifierRange::full(), false)],
        ScanMode::Custom { start, end } => vec![(IdentifierRange::new(start, end), false)],
    };

    let mut segments: Vec<PlannedSegment> = candidates
        .into_iter()
        .filter_map(|(candidate, extended)| {
            candidate.intersect(&range).map(|range| PlannedSegment {
                range,
                requires_extended: extended || pass.requires_extended(),
            })
        })
        .collect();
    segments.sort_by_key(|segment| segment.range.start);

    let mut planned: Vec<PlannedSegment> = Vec::with_capacity(segments.len());
    for mut segment in segments {
        if let Some(previous) = planned.last() {
            if segment.range.end <= previous.range.end {
                continue;
            }
            segment.range.start = segment.range.start.max(previous.range.end + 1);
        }
        planned.push(segment);
    }
    planned
}
