//! Identifier discovery
//!
//! [`DiscoveryScanner`] walks a planned identifier range against one module,
//! one probe at a time, classifying every answer and checkpointing as it goes
//! so an interrupted scan can pick up exactly where it stopped.
//!
//! ```text
//! plan(mode, range, pass) ──► ScanRun.segments
//!                                  │ cursor
//!                                  ▼
//!          ┌── keep-alive ── pace ── probe ── classify ── record ──┐
//!          │                                                      │
//!          └───────────── checkpoint every N probes ◄─────────────┘
//! ```

mod checkpoint;
mod modules;
mod plan;
mod run;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use checkpoint::{CheckpointStore, JsonFileStore, MemoryStore};
pub use modules::{DiscoveredModule, ModuleIdentity};
pub use plan::{plan, DiscoveryPass, IdentifierRange, PlannedSegment, ScanMode};
pub use run::{
    AbsenceReason, ProbeClass, ProbeResult, ResumeCheck, ScanRun, ScanStatus, ScanSummary,
};

use crate::address::{ModuleAddressBook, ModuleEndpoint};
use crate::config::ScanConfig;
use crate::error::{CheckpointError, ScanError};
use crate::session::{SessionError, SessionLevel, UdsSession};
use crate::transport::AdapterTransport;
use crate::uds::{NrcClass, UdsRequest};

/// Cancellation flag shared with whoever may stop a scan.
///
/// Checked between probes only; an exchange in flight always completes.
#[derive(Debug, Clone, Default)]
pub struct ScanControl {
    cancelled: Arc<AtomicBool>,
}

impl ScanControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Clear a previous cancellation
    pub fn reset(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
    }
}

/// How entering the extended session for the next identifier went
enum SessionEntry {
    Entered,
    /// The module does not offer it; extended segments were pruned
    Unavailable,
    /// Still failing after the retries, recorded against the identifier
    Failed(ProbeResult),
}

/// Drives scans over an exclusively owned UDS session
pub struct DiscoveryScanner<T> {
    session: UdsSession<T>,
    store: Box<dyn CheckpointStore>,
    config: ScanConfig,
    address_book: ModuleAddressBook,
    control: ScanControl,
    pass: DiscoveryPass,
    last_probe: Option<Instant>,
}

impl<T: AdapterTransport> DiscoveryScanner<T> {
    pub fn new(
        session: UdsSession<T>,
        store: impl CheckpointStore + 'static,
        config: ScanConfig,
        address_book: ModuleAddressBook,
    ) -> Self {
        Self {
            session,
            store: Box::new(store),
            config,
            address_book,
            control: ScanControl::new(),
            pass: DiscoveryPass::default(),
            last_probe: None,
        }
    }

    /// Service probed by new runs
    pub fn with_pass(mut self, pass: DiscoveryPass) -> Self {
        self.pass = pass;
        self
    }

    /// A handle that cancels the scan in progress
    pub fn control(&self) -> ScanControl {
        self.control.clone()
    }

    pub fn session(&self) -> &UdsSession<T> {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut UdsSession<T> {
        &mut self.session
    }

    pub fn address_book(&self) -> &ModuleAddressBook {
        &self.address_book
    }

    pub fn address_book_mut(&mut self) -> &mut ModuleAddressBook {
        &mut self.address_book
    }

    pub fn store(&self) -> &dyn CheckpointStore {
        self.store.as_ref()
    }

    /// Start a new scan of `module`
    pub async fn run(
        &mut self,
        module: &ModuleEndpoint,
        range: IdentifierRange,
        mode: ScanMode,
    ) -> Result<ScanRun, ScanError> {
        let run = ScanRun::new(module.clone(), range, mode, self.pass);
        info!(
            run_id = %run.id,
            module = %module.name,
            pass = ?run.pass,
            %range,
            planned = run.planned_total(),
            "Starting scan"
        );
        self.session.select(module);
        self.execute(run).await
    }

    /// Continue from a snapshot. A finished run is returned as is.
    pub async fn resume(&mut self, checkpoint: &ScanRun) -> Result<ScanRun, ScanError> {
        if checkpoint.status == ScanStatus::Completed {
            info!(run_id = %checkpoint.id, "Run already complete, nothing to resume");
            return Ok(checkpoint.clone());
        }

        let mut run = checkpoint.resumed();
        // Resuming an older snapshot must not collide with newer ones
        if let Ok(latest) = self.store.load_latest(run.id) {
            run.checkpoint_seq = run.checkpoint_seq.max(latest.checkpoint_seq);
        }
        info!(
            run_id = %run.id,
            module = %run.module.name,
            cursor = ?run.cursor.map(|c| format!("0x{:04X}", c)),
            probed = run.results.len(),
            resume_count = run.resume_count,
            "Resuming scan"
        );
        self.session.select(&run.module);

        self.pace().await;
        let answered = match self
            .session
            .request(&UdsRequest::tester_present(false), &run.module)
            .await
        {
            Ok(response) => response.confirms_presence(),
            Err(err) => return Err(self.abort(run, err)),
        };
        run.record_resume_check(answered);
        if answered {
            self.mark_present(&mut run);
        } else if run.module_confirmed {
            warn!(module = %run.module.name, "Previously confirmed module is silent");
            self.address_book.set_presence(&run.module.name, false);
            return Err(ScanError::ModuleUnresponsive {
                module: run.module.name,
            });
        } else {
            warn!(
                run_id = %run.id,
                module = %run.module.name,
                "Module still silent, resuming without confirmed presence"
            );
        }

        self.execute(run).await
    }

    /// Resume the newest snapshot of `run_id` in the store
    pub async fn resume_latest(&mut self, run_id: Uuid) -> Result<ScanRun, ScanError> {
        let checkpoint = self.store.load_latest(run_id)?;
        self.resume(&checkpoint).await
    }

    async fn execute(&mut self, mut run: ScanRun) -> Result<ScanRun, ScanError> {
        self.control.reset();
        let mut since_checkpoint = 0usize;

        while let Some(identifier) = run.cursor {
            if self.control.is_cancelled() {
                info!(run_id = %run.id, cursor = format!("0x{:04X}", identifier), "Scan cancelled");
                run.finish(ScanStatus::Cancelled);
                return self.finish_checkpoint(run);
            }

            if let Err(err) = self.session.keep_alive().await {
                return Err(self.abort(run, err));
            }

            let needs_extended = run
                .segment_for(identifier)
                .is_some_and(|segment| segment.requires_extended);
            let mut entry_failure = None;
            if needs_extended && self.session.state().level() == SessionLevel::Default {
                match self.enter_extended(&mut run, identifier).await {
                    Ok(SessionEntry::Entered) => {}
                    Ok(SessionEntry::Unavailable) => continue,
                    Ok(SessionEntry::Failed(result)) => entry_failure = Some(result),
                    Err(err) => return Err(self.abort(run, err)),
                }
            }

            let result = match entry_failure {
                Some(result) => result,
                None => match self.probe(&run, identifier).await {
                    Ok(result) => result,
                    Err(err) => return Err(self.abort(run, err)),
                },
            };
            let confirms = result.confirms_presence();
            run.record(result);
            if confirms {
                self.mark_present(&mut run);
            }

            since_checkpoint += 1;
            if since_checkpoint >= self.config.checkpoint_every.max(1) {
                // the next checkpoint carries everything this one would have
                if let Err(err) = self.checkpoint(&mut run) {
                    warn!(run_id = %run.id, error = %err, "Checkpoint failed, scan continues");
                }
                since_checkpoint = 0;
            }
        }

        run.finish(ScanStatus::Completed);
        let run = self.finish_checkpoint(run)?;
        let summary = run.summary();
        info!(
            run_id = %run.id,
            module = %run.module.name,
            probed = summary.probed,
            available = summary.available,
            pruned = summary.pruned,
            "Scan complete"
        );
        Ok(run)
    }

    /// Enter the extended session, retrying failures that may be transient.
    ///
    /// Only a module that says it does not offer the session loses its
    /// extended segments; anything else is charged to `identifier` and entry
    /// is tried again before the next extended identifier.
    async fn enter_extended(
        &mut self,
        run: &mut ScanRun,
        identifier: u16,
    ) -> Result<SessionEntry, SessionError> {
        let allowed = 1 + self.config.no_response_retries;
        let mut attempts = 0;

        loop {
            attempts += 1;
            self.pace().await;
            let err = match self.session.enter_session(SessionLevel::Extended).await {
                Ok(()) => {
                    self.mark_present(run);
                    return Ok(SessionEntry::Entered);
                }
                Err(err @ SessionError::LinkLost(_)) => return Err(err),
                Err(err @ SessionError::ExtendedSessionUnavailable { .. }) => {
                    self.mark_present(run);
                    let pruned = run.prune_extended();
                    warn!(
                        run_id = %run.id,
                        module = %run.module.name,
                        error = %err,
                        pruned,
                        "Extended session unavailable, pruning segments"
                    );
                    return Ok(SessionEntry::Unavailable);
                }
                Err(err) => err,
            };

            let (class, raw, transient) = match &err {
                SessionError::Rejected { service, nrc } => {
                    self.mark_present(run);
                    (
                        ProbeClass::Refused { nrc: *nrc },
                        vec![0x7F, *service, u8::from(*nrc)],
                        nrc.class() == NrcClass::RetryableConditional,
                    )
                }
                SessionError::NoResponse { .. } => (
                    ProbeClass::NoResponse {
                        reason: if run.module_confirmed {
                            AbsenceReason::IdentifierAbsent
                        } else {
                            AbsenceReason::PresenceUnconfirmed
                        },
                    },
                    Vec::new(),
                    true,
                ),
                other => (
                    ProbeClass::BusError {
                        reason: other.to_string(),
                    },
                    Vec::new(),
                    matches!(other, SessionError::Malformed(_)),
                ),
            };

            if transient && attempts < allowed {
                debug!(
                    module = %run.module.name,
                    error = %err,
                    attempts,
                    "Extended session not entered, trying again"
                );
                continue;
            }

            warn!(
                run_id = %run.id,
                module = %run.module.name,
                identifier = format!("0x{:04X}", identifier),
                error = %err,
                attempts,
                "Extended session not entered, retrying at the next identifier"
            );
            return Ok(SessionEntry::Failed(ProbeResult {
                identifier,
                class,
                raw,
                timestamp: Utc::now(),
                attempts,
            }));
        }
    }

    /// Probe one identifier, retrying silence up to the configured count
    async fn probe(&mut self, run: &ScanRun, identifier: u16) -> Result<ProbeResult, SessionError> {
        let request = run.pass.request_for(identifier);
        let allowed = 1 + self.config.no_response_retries;
        let mut attempts = 0;

        loop {
            attempts += 1;
            self.pace().await;
            let response = self.session.request(&request, &run.module).await?;
            if response.is_no_response() && attempts < allowed {
                debug!(
                    identifier = format!("0x{:04X}", identifier),
                    attempts, "No response, probing again"
                );
                continue;
            }

            let class = ProbeClass::classify(&response, run.module_confirmed);
            debug!(identifier = format!("0x{:04X}", identifier), class = ?class, "Probed");
            return Ok(ProbeResult {
                identifier,
                class,
                raw: response.raw,
                timestamp: response.received_at,
                attempts,
            });
        }
    }

    /// Hold probes at least the configured delay apart
    async fn pace(&mut self) {
        if let Some(last) = self.last_probe {
            tokio::time::sleep_until(last + self.config.inter_probe_delay()).await;
        }
        self.last_probe = Some(Instant::now());
    }

    fn mark_present(&mut self, run: &mut ScanRun) {
        if run.module_confirmed {
            return;
        }
        let relabelled = run.confirm_presence();
        info!(module = %run.module.name, relabelled, "Module presence confirmed");
        if !self.address_book.set_presence(&run.module.name, true) {
            self.address_book.record_discovered(run.module.clone());
        }
    }

    /// Save the next snapshot; a failed save leaves the sequence number unused
    fn checkpoint(&self, run: &mut ScanRun) -> Result<(), CheckpointError> {
        run.checkpoint_seq += 1;
        let saved = self.store.save(run);
        if saved.is_err() {
            run.checkpoint_seq -= 1;
        }
        saved
    }

    /// Checkpoint a run that stops here, handing it back even if the save fails
    fn finish_checkpoint(&self, mut run: ScanRun) -> Result<ScanRun, ScanError> {
        match self.checkpoint(&mut run) {
            Ok(()) => Ok(run),
            Err(source) => {
                warn!(run_id = %run.id, error = %source, "Final checkpoint failed");
                Err(ScanError::CheckpointFailed {
                    run: Box::new(run),
                    source,
                })
            }
        }
    }

    /// Checkpoint a run that cannot continue and build the error to return
    fn abort(&self, mut run: ScanRun, err: SessionError) -> ScanError {
        run.finish(ScanStatus::Aborted);
        if let Err(checkpoint_err) = self.checkpoint(&mut run) {
            warn!(run_id = %run.id, error = %checkpoint_err, "Could not checkpoint aborted run");
        }
        match err {
            SessionError::LinkLost(source) => {
                warn!(run_id = %run.id, error = %source, "Adapter link lost, scan aborted");
                ScanError::LinkLost {
                    run: Box::new(run),
                    source,
                }
            }
            other => ScanError::Session(other),
        }
    }
}
