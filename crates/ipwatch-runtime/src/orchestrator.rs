//! Collection orchestrator: per-source run lifecycle, backoff and
//! auto-disable.
//!
//! Each source moves `Disabled -> Idle -> Running -> {Idle | Backoff}`. At
//! most one run per source is in flight; different sources run in parallel
//! on the blocking pool. Persisted source state is only ever written here,
//! and every read-modify-write of it happens under `state_lock`.

use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use ipwatch_collectors::SourceCollector;
use ipwatch_core::clock::to_chrono;
use ipwatch_core::{Clock, CollectionSettings, Error, ErrorKind, IndicatorRecord, Result};
use ipwatch_store::{
    CollectionRun, IngestReport, RecordStore, RunOutcome, RunQuery, SourceState, TriggerReason,
};

use crate::service::{IndicatorService, TAG_STATS};
use crate::types::{Phase, SourceStatus, TriggerParams};

struct SourceSlot {
    collector: Arc<dyn SourceCollector>,
    initially_enabled: bool,
    /// Id of the in-flight run, if any.
    running: Mutex<Option<String>>,
}

/// Clears the running slot when the worker finishes, panics included.
struct RunningGuard<'a>(&'a SourceSlot);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        *self.0.running.lock() = None;
    }
}

pub struct CollectionOrchestrator {
    store: Arc<RecordStore>,
    service: Arc<IndicatorService>,
    clock: Arc<dyn Clock>,
    settings: CollectionSettings,
    record_ttl: Duration,
    sources: BTreeMap<String, Arc<SourceSlot>>,
    state_lock: Mutex<()>,
}

impl CollectionOrchestrator {
    /// Create an orchestrator with no sources.
    ///
    /// Construction never touches run history: one-shot commands build an
    /// orchestrator while the daemon may have runs in flight.
    pub fn new(
        service: Arc<IndicatorService>,
        clock: Arc<dyn Clock>,
        settings: CollectionSettings,
        record_ttl: Duration,
    ) -> Result<Self> {
        let store = Arc::clone(service.store());
        info!(
            "Orchestrator initialized: interval={}s, auto_disable_after={}, record_ttl={}s",
            settings.interval.as_secs(),
            settings.auto_disable_after,
            record_ttl.as_secs()
        );
        Ok(Self {
            store,
            service,
            clock,
            settings,
            record_ttl,
            sources: BTreeMap::new(),
            state_lock: Mutex::new(()),
        })
    }

    /// Register a collector. A source seen for the first time starts with
    /// `enabled = initially_enabled`; a known source keeps its stored state.
    pub fn add_source(
        &mut self,
        collector: Arc<dyn SourceCollector>,
        initially_enabled: bool,
    ) -> Result<()> {
        let source = collector.source().to_string();
        if self.store.get_source_state(&source)?.is_none() {
            let state = SourceState::new(&source, initially_enabled, self.clock.now());
            self.store.put_source_state(&state)?;
        }
        debug!("Registered source {} (enabled={})", source, initially_enabled);
        self.sources.insert(
            source,
            Arc::new(SourceSlot {
                collector,
                initially_enabled,
                running: Mutex::new(None),
            }),
        );
        Ok(())
    }

    /// Close runs a crashed process left `running` as failed ("interrupted").
    ///
    /// Only the daemon calls this, once at startup and before its scheduler
    /// triggers anything.
    pub fn recover_interrupted(&self) -> Result<usize> {
        let in_flight = self.sources.values().any(|slot| slot.running.lock().is_some());
        if in_flight {
            return Err(Error::Internal(
                "interrupted-run recovery requested while runs are in flight".into(),
            ));
        }
        self.store.fail_interrupted_runs()
    }

    pub fn sources(&self) -> impl Iterator<Item = &str> {
        self.sources.keys().map(String::as_str)
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn settings(&self) -> &CollectionSettings {
        &self.settings
    }

    fn slot(&self, source: &str) -> Result<&Arc<SourceSlot>> {
        self.sources
            .get(source)
            .ok_or_else(|| Error::UnknownSource(source.to_string()))
    }

    fn load_state(&self, source: &str, slot: &SourceSlot) -> Result<SourceState> {
        Ok(self
            .store
            .get_source_state(source)?
            .unwrap_or_else(|| SourceState::new(source, slot.initially_enabled, self.clock.now())))
    }

    // ---------------------------------------------------------------
    // Control plane
    // ---------------------------------------------------------------

    /// Allow future triggers. Enabling an auto-disabled source also clears
    /// its failure count.
    pub fn enable(&self, source: &str) -> Result<SourceState> {
        let slot = self.slot(source)?;
        let _guard = self.state_lock.lock();
        let mut state = self.load_state(source, slot)?;
        if state.enabled {
            return Ok(state);
        }
        state.enabled = true;
        if state.auto_disabled {
            state.auto_disabled = false;
            state.consecutive_failures = 0;
        }
        state.updated_at = self.clock.now();
        self.store.put_source_state(&state)?;
        info!("Enabled collection for {}", source);
        Ok(state)
    }

    /// Reject future triggers. A run already in flight completes normally.
    pub fn disable(&self, source: &str) -> Result<SourceState> {
        let slot = self.slot(source)?;
        let _guard = self.state_lock.lock();
        let mut state = self.load_state(source, slot)?;
        if !state.enabled {
            return Ok(state);
        }
        state.enabled = false;
        state.auto_disabled = false;
        state.updated_at = self.clock.now();
        self.store.put_source_state(&state)?;
        info!("Disabled collection for {}", source);
        Ok(state)
    }

    /// Start a collection run and return its id without waiting for it.
    ///
    /// Must be called from within a tokio runtime; the run executes on the
    /// blocking pool.
    pub fn trigger(self: &Arc<Self>, source: &str, params: TriggerParams) -> Result<String> {
        let (run_id, _handle) = self.start(source, params)?;
        Ok(run_id)
    }

    /// Start a collection run and wait for it to close.
    pub async fn trigger_and_wait(
        self: &Arc<Self>,
        source: &str,
        params: TriggerParams,
    ) -> Result<CollectionRun> {
        let (run_id, handle) = self.start(source, params)?;
        handle
            .await
            .map_err(|e| Error::Internal(format!("collection worker failed: {}", e)))?;
        self.store
            .get_run(&run_id)?
            .ok_or_else(|| Error::NotFound(format!("run {}", run_id)))
    }

    fn start(
        self: &Arc<Self>,
        source: &str,
        params: TriggerParams,
    ) -> Result<(String, JoinHandle<()>)> {
        let slot = Arc::clone(self.slot(source)?);
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::Internal(format!("no async runtime for collection: {}", e)))?;

        let run = {
            let _guard = self.state_lock.lock();
            let mut running = slot.running.lock();
            if let Some(run_id) = running.as_ref() {
                return Err(Error::CollectionInProgress {
                    source_name: source.to_string(),
                    run_id: run_id.clone(),
                });
            }

            let now = self.clock.now();
            let mut state = self.load_state(source, &slot)?;
            if !state.enabled {
                return Err(Error::CollectionDisabled(source.to_string()));
            }
            if params.reason == TriggerReason::Scheduled {
                if halted(&state) {
                    return Err(Error::CollectionHalted(source.to_string()));
                }
                let last_run = self.store.latest_run(source)?;
                if let Some(retry_at) = self.backoff_until(&state, last_run.as_ref()) {
                    if now < retry_at {
                        return Err(Error::CollectionBackoff {
                            source_name: source.to_string(),
                            retry_at,
                        });
                    }
                }
            }

            let run = CollectionRun::start(source, params.reason, now);
            state.last_run = Some(now);
            state.updated_at = now;
            self.store.open_run(&run, &state)?;
            *running = Some(run.id.clone());
            run
        };

        info!(
            "Collection run {} started for {} ({})",
            run.id,
            source,
            params.reason.as_str()
        );
        let run_id = run.id.clone();
        let this = Arc::clone(self);
        let handle = runtime.spawn_blocking(move || this.execute(&slot, run));
        Ok((run_id, handle))
    }

    /// Worker body: collect, ingest, then close the run and update state.
    fn execute(&self, slot: &SourceSlot, run: CollectionRun) {
        let _release = RunningGuard(slot);
        let source = run.source.as_str();
        let result = self.collect_and_ingest(source, slot.collector.as_ref());

        let finished_at = self.clock.now();
        let guard = self.state_lock.lock();
        let state = match self.load_state(source, slot) {
            Ok(mut state) => {
                state.updated_at = finished_at;
                Some(state)
            }
            Err(e) => {
                error!("Run {}: failed to load state for {}: {}", run.id, source, e);
                None
            }
        };
        let (outcome, state) = self.settle(&run, &result, finished_at, state);

        let closed = match self.store.close_run(&run.id, &outcome, finished_at, state.as_ref()) {
            Err(e) if state.is_some() => {
                error!("Run {}: failed to store state for {}: {}", run.id, source, e);
                self.store.close_run(&run.id, &outcome, finished_at, None)
            }
            other => other,
        };
        match closed {
            Ok(true) => {}
            Ok(false) => warn!("Run {} was already closed", run.id),
            Err(e) => error!(
                "Failed to close run {}: {} (left running until the next daemon start)",
                run.id, e
            ),
        }
        drop(guard);
        self.service.invalidate(&[TAG_STATS]);
    }

    /// Outcome of a finished run, and the source state it leads to.
    fn settle(
        &self,
        run: &CollectionRun,
        result: &Result<(usize, IngestReport)>,
        finished_at: DateTime<Utc>,
        mut state: Option<SourceState>,
    ) -> (RunOutcome, Option<SourceState>) {
        let source = run.source.as_str();
        let outcome = match result {
            Ok((record_count, report)) => {
                if let Some(state) = state.as_mut() {
                    state.consecutive_failures = 0;
                    state.last_success = Some(finished_at);
                    state.last_error_kind = None;
                    state.last_error = None;
                }
                info!(
                    "Collection run {} for {} succeeded: {} records ({} new, {} refreshed)",
                    run.id, source, record_count, report.inserted, report.refreshed
                );
                RunOutcome::Success {
                    record_count: *record_count,
                    report: *report,
                }
            }
            Err(e) => {
                if let Some(state) = state.as_mut() {
                    state.consecutive_failures = state.consecutive_failures.saturating_add(1);
                    state.last_error_kind = Some(e.kind());
                    state.last_error = Some(e.to_string());
                    warn!(
                        "Collection run {} for {} failed ({} consecutive): {}",
                        run.id, source, state.consecutive_failures, e
                    );
                    if state.enabled
                        && self.settings.auto_disable_after > 0
                        && state.consecutive_failures >= self.settings.auto_disable_after
                    {
                        state.enabled = false;
                        state.auto_disabled = true;
                        warn!(
                            "Auto-disabled {} after {} consecutive failures",
                            source, state.consecutive_failures
                        );
                    }
                } else {
                    warn!("Collection run {} for {} failed: {}", run.id, source, e);
                }
                RunOutcome::Failed {
                    kind: e.kind(),
                    error: e.to_string(),
                }
            }
        };
        (outcome, state)
    }

    fn collect_and_ingest(
        &self,
        source: &str,
        collector: &dyn SourceCollector,
    ) -> Result<(usize, IngestReport)> {
        let batch = match panic::catch_unwind(AssertUnwindSafe(|| collector.collect())) {
            Ok(batch) => batch?,
            Err(_) => return Err(Error::Internal(format!("collector for {} panicked", source))),
        };
        let ingested_at = self.clock.now();
        let records: Vec<IndicatorRecord> = batch
            .into_iter()
            .map(|item| IndicatorRecord::from_collected(source, item, ingested_at, self.record_ttl))
            .collect();
        let report = self.service.ingest(source, &records)?;
        Ok((records.len(), report))
    }

    // ---------------------------------------------------------------
    // Status and history
    // ---------------------------------------------------------------

    /// End of the cooldown after the latest failure, if the source has any
    /// consecutive failures.
    fn backoff_until(
        &self,
        state: &SourceState,
        last_run: Option<&CollectionRun>,
    ) -> Option<DateTime<Utc>> {
        if state.consecutive_failures == 0 {
            return None;
        }
        let failed_at = last_run
            .and_then(|r| r.finished_at)
            .or(state.last_run)?;
        Some(failed_at + to_chrono(backoff_delay(&self.settings, state.consecutive_failures)))
    }

    fn status_of(&self, source: &str, slot: &SourceSlot, now: DateTime<Utc>) -> Result<SourceStatus> {
        let state = self.load_state(source, slot)?;
        let running_run = slot.running.lock().clone();
        let last_run = self.store.latest_run(source)?;
        let retry_at = self.backoff_until(&state, last_run.as_ref());
        let backoff_until = retry_at.filter(|t| *t > now);

        let phase = if running_run.is_some() {
            Phase::Running
        } else if !state.enabled {
            Phase::Disabled
        } else if backoff_until.is_some() {
            Phase::Backoff
        } else {
            Phase::Idle
        };

        let next_scheduled = if !state.enabled || halted(&state) {
            None
        } else if let Some(retry_at) = retry_at {
            Some(retry_at)
        } else {
            Some(match &last_run {
                Some(run) => run.started_at + to_chrono(self.settings.interval),
                None => now,
            })
        };

        Ok(SourceStatus {
            source: source.to_string(),
            phase,
            state,
            running_run,
            last_run,
            backoff_until,
            next_scheduled,
        })
    }

    /// Per-source phase, state and schedule.
    pub fn get_status(&self) -> Result<Vec<SourceStatus>> {
        let now = self.clock.now();
        self.sources
            .iter()
            .map(|(source, slot)| self.status_of(source, slot, now))
            .collect()
    }

    pub fn get_source_status(&self, source: &str) -> Result<SourceStatus> {
        let slot = self.slot(source)?;
        self.status_of(source, slot, self.clock.now())
    }

    /// Sources the scheduler should trigger at `now`.
    pub fn due_sources(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        let mut due = Vec::new();
        for (source, slot) in &self.sources {
            let status = self.status_of(source, slot, now)?;
            if status.phase != Phase::Running
                && status.next_scheduled.is_some_and(|at| at <= now)
            {
                due.push(source.clone());
            }
        }
        Ok(due)
    }

    /// Run history, newest first.
    pub fn list_runs(
        &self,
        source: Option<&str>,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> Result<Vec<CollectionRun>> {
        if let Some(source) = source {
            self.slot(source)?;
        }
        self.store.list_runs(&RunQuery {
            source: source.map(str::to_string),
            from,
            to,
            limit,
        })
    }
}

/// The last failure was a parse error: the portal layout changed and only
/// a manual run may try again.
fn halted(state: &SourceState) -> bool {
    state.consecutive_failures > 0 && state.last_error_kind == Some(ErrorKind::Parse)
}

/// Cooldown after `failures` consecutive failures: `base * 2^(failures-1)`,
/// capped at `backoff_max`.
pub fn backoff_delay(settings: &CollectionSettings, failures: u32) -> Duration {
    if failures == 0 {
        return Duration::ZERO;
    }
    let factor = 1u32.checked_shl(failures - 1).unwrap_or(u32::MAX);
    settings
        .backoff_base
        .checked_mul(factor)
        .unwrap_or(settings.backoff_max)
        .min(settings.backoff_max)
}
