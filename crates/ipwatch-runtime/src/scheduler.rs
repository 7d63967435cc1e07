//! Background loops: scheduled collection and the expiry sweep.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use ipwatch_core::Error;

use crate::orchestrator::CollectionOrchestrator;
use crate::service::{IndicatorService, TAG_STATS};
use crate::types::TriggerParams;

/// How often the scheduler looks for due sources.
pub const DEFAULT_TICK: Duration = Duration::from_secs(60);

/// Handles to the running background loops.
pub struct Scheduler {
    handles: Vec<JoinHandle<()>>,
}

impl Scheduler {
    /// Spawn the collection and sweep loops on the current runtime.
    pub fn start(
        orchestrator: Arc<CollectionOrchestrator>,
        service: Arc<IndicatorService>,
        tick: Duration,
        sweep_interval: Duration,
    ) -> Self {
        // interval() rejects a zero period.
        let tick = tick.max(Duration::from_secs(1));
        let sweep_interval = sweep_interval.max(Duration::from_secs(1));
        let collect = tokio::spawn(collection_loop(orchestrator, tick));
        let sweep = tokio::spawn(sweep_loop(service, sweep_interval));
        info!(
            "Scheduler started: tick={}s, sweep_interval={}s",
            tick.as_secs(),
            sweep_interval.as_secs()
        );
        Self {
            handles: vec![collect, sweep],
        }
    }

    /// Stop both loops. Runs already on the blocking pool finish on their own.
    pub fn shutdown(self) {
        for handle in self.handles {
            handle.abort();
        }
        info!("Scheduler stopped");
    }
}

async fn collection_loop(orchestrator: Arc<CollectionOrchestrator>, tick: Duration) {
    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        run_due(&orchestrator);
    }
}

/// Trigger every source that is due now. Returns the started run ids.
pub fn run_due(orchestrator: &Arc<CollectionOrchestrator>) -> Vec<String> {
    let now = orchestrator.now();
    let due = match orchestrator.due_sources(now) {
        Ok(due) => due,
        Err(e) => {
            error!("Failed to compute due sources: {}", e);
            return Vec::new();
        }
    };

    let mut started = Vec::new();
    for source in due {
        match orchestrator.trigger(&source, TriggerParams::scheduled()) {
            Ok(run_id) => started.push(run_id),
            Err(
                e @ (Error::CollectionInProgress { .. }
                | Error::CollectionBackoff { .. }
                | Error::CollectionHalted(_)
                | Error::CollectionDisabled(_)),
            ) => debug!("Skipping scheduled run: {}", e),
            Err(e) => warn!("Scheduled trigger for {} failed: {}", source, e),
        }
    }
    started
}

async fn sweep_loop(service: Arc<IndicatorService>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        sweep_once(&service).await;
    }
}

/// Physically remove records past their grace window.
pub async fn sweep_once(service: &Arc<IndicatorService>) -> usize {
    let store = Arc::clone(service.store());
    match tokio::task::spawn_blocking(move || store.expire_sweep()).await {
        Ok(Ok(report)) => {
            if report.removed > 0 {
                service.invalidate(&[TAG_STATS]);
            }
            report.removed
        }
        Ok(Err(e)) => {
            warn!("Expire sweep failed: {}", e);
            0
        }
        Err(e) => {
            error!("Expire sweep task failed: {}", e);
            0
        }
    }
}
