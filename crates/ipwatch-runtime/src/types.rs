//! Runtime types.

use chrono::{DateTime, Utc};
use serde::Serialize;

use ipwatch_store::{CollectionRun, SourceState, TriggerReason};

/// Parameters for a collection trigger.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TriggerParams {
    pub reason: TriggerReason,
}

impl TriggerParams {
    /// Operator-issued run. Bypasses backoff.
    pub fn manual() -> Self {
        Self {
            reason: TriggerReason::Manual,
        }
    }

    pub fn scheduled() -> Self {
        Self {
            reason: TriggerReason::Scheduled,
        }
    }
}

/// Where a source sits in its collection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Disabled,
    Idle,
    Running,
    /// Last run failed and the cooldown has not elapsed.
    Backoff,
}

/// Control-plane view of one source.
#[derive(Debug, Clone, Serialize)]
pub struct SourceStatus {
    pub source: String,
    pub phase: Phase,
    pub state: SourceState,
    #[serde(rename = "runningRun")]
    pub running_run: Option<String>,
    #[serde(rename = "lastRun")]
    pub last_run: Option<CollectionRun>,
    #[serde(rename = "backoffUntil")]
    pub backoff_until: Option<DateTime<Utc>>,
    /// When the scheduler will next collect this source. `None` while the
    /// source is disabled or halted on a parse failure.
    #[serde(rename = "nextScheduled")]
    pub next_scheduled: Option<DateTime<Utc>>,
}
