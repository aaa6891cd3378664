//! Scan results and the resumable run record

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::plan::{plan, DiscoveryPass, IdentifierRange, PlannedSegment, ScanMode};
use crate::address::ModuleEndpoint;
use crate::uds::{NegativeResponseCode, NrcClass, UdsOutcome, UdsResponse};

/// Why an identifier got no answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbsenceReason {
    /// The module answers other requests, just not this one
    IdentifierAbsent,
    /// Nothing from the module has been seen yet
    PresenceUnconfirmed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProbeClass {
    Available {
        #[serde(with = "crate::serde_hex")]
        data: Vec<u8>,
    },
    SecurityLocked,
    NotSupported,
    NoResponse {
        reason: AbsenceReason,
    },
    BusError {
        reason: String,
    },
    /// Negative responses outside the classes above
    Refused {
        nrc: NegativeResponseCode,
    },
}

impl ProbeClass {
    pub fn classify(response: &UdsResponse, module_confirmed: bool) -> Self {
        match &response.outcome {
            UdsOutcome::Positive(positive) => Self::Available {
                data: positive.record().to_vec(),
            },
            UdsOutcome::Negative { nrc, .. } => match nrc.class() {
                NrcClass::NotSupported => Self::NotSupported,
                NrcClass::SecurityLocked => Self::SecurityLocked,
                _ => Self::Refused { nrc: *nrc },
            },
            UdsOutcome::NoResponse => Self::NoResponse {
                reason: if module_confirmed {
                    AbsenceReason::IdentifierAbsent
                } else {
                    AbsenceReason::PresenceUnconfirmed
                },
            },
            UdsOutcome::MalformedFrame { reason } => Self::BusError {
                reason: reason.clone(),
            },
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, Self::Available { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeResult {
    pub identifier: u16,
    pub class: ProbeClass,
    #[serde(with = "crate::serde_hex")]
    pub raw: Vec<u8>,
    pub timestamp: DateTime<Utc>,
    pub attempts: u32,
}

impl ProbeResult {
    /// A positive or negative answer proves the module is on the bus
    pub fn confirms_presence(&self) -> bool {
        !matches!(
            self.class,
            ProbeClass::NoResponse { .. } | ProbeClass::BusError { .. }
        )
    }
}

/// TesterPresent sent before a resumed run continued
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeCheck {
    pub timestamp: DateTime<Utc>,
    pub answered: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanStatus {
    Running,
    Completed,
    Cancelled,
    /// Stopped by a lost adapter link
    Aborted,
}

/// Counts per class
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanSummary {
    pub planned: u32,
    pub probed: usize,
    pub available: usize,
    pub security_locked: usize,
    pub not_supported: usize,
    pub no_response: usize,
    pub bus_errors: usize,
    pub refused: usize,
    pub pruned: u32,
}

/// One discovery scan of one module, serialized at every checkpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanRun {
    pub id: Uuid,
    pub module: ModuleEndpoint,
    pub range: IdentifierRange,
    pub mode: ScanMode,
    pub pass: DiscoveryPass,
    pub segments: Vec<PlannedSegment>,
    pub pruned: Vec<PlannedSegment>,
    pub results: Vec<ProbeResult>,
    /// Next identifier to probe; `None` once every segment is done
    pub cursor: Option<u16>,
    pub module_confirmed: bool,
    /// One entry per resume, oldest first
    #[serde(default)]
    pub resume_checks: Vec<ResumeCheck>,
    pub status: ScanStatus,
    pub checkpoint_seq: u32,
    pub resume_count: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ScanRun {
    pub fn new(
        module: ModuleEndpoint,
        range: IdentifierRange,
        mode: ScanMode,
        pass: DiscoveryPass,
    ) -> Self {
        let segments = plan(mode, range, pass);
        let cursor = segments.first().map(|s| s.range.start);
        Self {
            id: Uuid::new_v4(),
            module,
            range,
            mode,
            pass,
            segments,
            pruned: Vec::new(),
            results: Vec::new(),
            cursor,
            module_confirmed: false,
            resume_checks: Vec::new(),
            status: ScanStatus::Running,
            checkpoint_seq: 0,
            resume_count: 0,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// A fresh in-memory run continuing from this snapshot
    pub fn resumed(&self) -> Self {
        let mut run = self.clone();
        run.resume_count += 1;
        run.status = ScanStatus::Running;
        run.finished_at = None;
        run
    }

    pub fn first_at_or_after(&self, id: u16) -> Option<u16> {
        self.segments
            .iter()
            .find(|segment| segment.range.end >= id)
            .map(|segment| segment.range.start.max(id))
    }

    pub fn next_after(&self, id: u16) -> Option<u16> {
        self.first_at_or_after(id.checked_add(1)?)
    }

    pub fn segment_for(&self, id: u16) -> Option<&PlannedSegment> {
        self.segments.iter().find(|segment| segment.range.contains(id))
    }

    /// Move every extended-only segment not yet finished to `pruned`
    pub fn prune_extended(&mut self) -> usize {
        let cursor = self.cursor;
        let (pruned, kept): (Vec<_>, Vec<_>) = self.segments.iter().copied().partition(|segment| {
            segment.requires_extended && cursor.is_some_and(|c| segment.range.end >= c)
        });
        let count = pruned.len();
        self.pruned.extend(pruned);
        self.segments = kept;
        self.cursor = cursor.and_then(|c| self.first_at_or_after(c));
        count
    }

    /// Whether any remaining segment needs the extended session
    pub fn needs_extended(&self) -> bool {
        let Some(cursor) = self.cursor else {
            return false;
        };
        self.segments
            .iter()
            .any(|segment| segment.requires_extended && segment.range.end >= cursor)
    }

    /// Append a result and advance the cursor past it
    pub fn record(&mut self, result: ProbeResult) {
        self.cursor = self.next_after(result.identifier);
        self.results.push(result);
    }

    /// Mark the module present and re-label earlier unconfirmed silences.
    /// Returns how many results were re-labelled.
    pub fn confirm_presence(&mut self) -> usize {
        self.module_confirmed = true;
        let mut relabelled = 0;
        for result in &mut self.results {
            if let ProbeClass::NoResponse { reason } = &mut result.class {
                if *reason == AbsenceReason::PresenceUnconfirmed {
                    *reason = AbsenceReason::IdentifierAbsent;
                    relabelled += 1;
                }
            }
        }
        relabelled
    }

    pub fn record_resume_check(&mut self, answered: bool) {
        self.resume_checks.push(ResumeCheck {
            timestamp: Utc::now(),
            answered,
        });
    }

    pub fn finish(&mut self, status: ScanStatus) {
        self.status = status;
        self.finished_at = Some(Utc::now());
    }

    pub fn planned_total(&self) -> u32 {
        self.segments.iter().map(|s| s.range.count()).sum()
    }

    pub fn available(&self) -> impl Iterator<Item = &ProbeResult> {
        self.results.iter().filter(|r| r.class.is_available())
    }

    pub fn summary(&self) -> ScanSummary {
        let mut summary = ScanSummary {
            planned: self.planned_total(),
            probed: self.results.len(),
            pruned: self.pruned.iter().map(|s| s.range.count()).sum(),
            ..ScanSummary::default()
        };
        for result in &self.results {
            match result.class {
                ProbeClass::Available { .. } => summary.available += 1,
                ProbeClass::SecurityLocked => summary.security_locked += 1,
                ProbeClass::NotSupported => summary.not_supported += 1,
                ProbeClass::NoResponse { .. } => summary.no_response += 1,
                ProbeClass::BusError { .. } => summary.bus_errors += 1,
                ProbeClass::Refused { .. } => summary.refused += 1,
            }
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Bus;
    use crate::uds::UdsRequest;
    use pretty_assertions::assert_eq;

    fn quick_run(range: IdentifierRange) -> ScanRun {
        ScanRun::new(
            ModuleEndpoint::new("PCM", 0x7E0, 0x7E8, Bus::Hs),
            range,
            ScanMode::Quick,
            DiscoveryPass::DataIdentifiers,
        )
    }

    fn silent(identifier: u16, confirmed: bool) -> ProbeResult {
        ProbeResult {
            identifier,
            class: ProbeClass::classify(&UdsResponse::no_response(), confirmed),
            raw: Vec::new(),
            timestamp: Utc::now(),
            attempts: 2,
        }
    }

    #[test]
    fn test_cursor_walks_segments() {
        let mut run = quick_run(IdentifierRange::new(0x01FE, 0xD101));
        assert_eq!(run.cursor, Some(0x01FE));
        run.record(silent(0x01FE, false));
        run.record(silent(0x01FF, false));
        assert_eq!(run.cursor, Some(0xD100));
        run.record(silent(0xD100, false));
        run.record(silent(0xD101, false));
        assert_eq!(run.cursor, None);
    }

    #[test]
    fn test_cursor_at_top_of_range() {
        let mut run = ScanRun::new(
            ModuleEndpoint::new("PCM", 0x7E0, 0x7E8, Bus::Hs),
            IdentifierRange::new(0xFFFE, 0xFFFF),
            ScanMode::Full,
            DiscoveryPass::DataIdentifiers,
        );
        run.record(silent(0xFFFE, false));
        run.record(silent(0xFFFF, false));
        assert_eq!(run.cursor, None);
    }

    #[test]
    fn test_prune_extended_moves_cursor() {
        let mut run = quick_run(IdentifierRange::new(0xD1FF, 0xF180));
        run.record(silent(0xD1FF, false));
        assert_eq!(run.cursor, Some(0xDD00));
        assert!(run.needs_extended());

        assert_eq!(run.prune_extended(), 1);
        assert_eq!(run.cursor, Some(0xF180));
        assert_eq!(run.pruned[0].range, IdentifierRange::new(0xDD00, 0xDDFF));
        assert!(!run.needs_extended());
    }

    #[test]
    fn test_confirm_presence_relabels() {
        let mut run = quick_run(IdentifierRange::new(0x0100, 0x0103));
        run.record(silent(0x0100, false));
        run.record(silent(0x0101, false));
        let request = UdsRequest::read_data_by_identifier(0x0102);
        run.record(ProbeResult {
            identifier: 0x0102,
            class: ProbeClass::classify(
                &UdsResponse::classify(&request, &[0x7F, 0x22, 0x31]),
                false,
            ),
            raw: vec![0x7F, 0x22, 0x31],
            timestamp: Utc::now(),
            attempts: 1,
        });
        assert!(run.results[2].confirms_presence());

        assert_eq!(run.confirm_presence(), 2);
        assert!(run.results[..2].iter().all(|r| r.class
            == ProbeClass::NoResponse {
                reason: AbsenceReason::IdentifierAbsent
            }));
        let summary = run.summary();
        assert_eq!(summary.no_response, 2);
        assert_eq!(summary.not_supported, 1);
        assert_eq!(summary.planned, 4);
    }

    #[test]
    fn test_classification() {
        let request = UdsRequest::read_data_by_identifier(0xD100);
        let classify = |bytes: &[u8]| {
            ProbeClass::classify(&UdsResponse::classify(&request, bytes), true)
        };
        assert_eq!(
            classify(&[0x62, 0xD1, 0x00, 0xA5]),
            ProbeClass::Available { data: vec![0xA5] }
        );
        assert_eq!(classify(&[0x7F, 0x22, 0x33]), ProbeClass::SecurityLocked);
        assert_eq!(classify(&[0x7F, 0x22, 0x31]), ProbeClass::NotSupported);
        assert_eq!(
            classify(&[0x7F, 0x22, 0x22]),
            ProbeClass::Refused {
                nrc: NegativeResponseCode::ConditionsNotCorrect
            }
        );
        assert!(matches!(classify(&[0x62, 0xD1]), ProbeClass::BusError { .. }));
    }

    #[test]
    fn test_serialized_run() {
        let mut run = quick_run(IdentifierRange::new(0x0100, 0x0100));
        run.record(ProbeResult {
            identifier: 0x0100,
            class: ProbeClass::Available { data: vec![0x0C] },
            raw: vec![0x62, 0x01, 0x00, 0x0C],
            timestamp: Utc::now(),
            attempts: 1,
        });
        let json = serde_json::to_value(&run).unwrap();
        assert_eq!(json["results"][0]["raw"], "6201000C");
        assert_eq!(json["results"][0]["class"]["kind"], "available");
        assert_eq!(json["results"][0]["class"]["data"], "0C");
        assert_eq!(json["mode"]["mode"], "quick");

        let back: ScanRun = serde_json::from_value(json).unwrap();
        assert_eq!(back, run);
    }
}
