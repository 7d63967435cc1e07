//! Store-level types: read-side aggregates, run history and source state.

use chrono::{DateTime, Utc};
use ipwatch_core::ErrorKind;
use serde::{Deserialize, Serialize};

/// One source's report of an ip, as exposed on the read side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    pub source: String,
    pub detected_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub confidence: f64,
    #[serde(skip_serializing_if = "serde_json::Value::is_null", default)]
    pub metadata: serde_json::Value,
}

/// A unique active ip with every source that currently reports it.
///
/// Confidence is deliberately kept per source in `provenance`; there is no
/// combined value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveIndicator {
    pub ip: String,
    pub sources: Vec<String>,
    pub last_detected_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub provenance: Vec<Provenance>,
}

/// Filter for active-set reads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActiveFilter {
    /// Only ips currently reported by this source.
    pub source: Option<String>,
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: usize,
}

impl ActiveFilter {
    pub fn source(source: impl Into<String>) -> Self {
        Self {
            source: Some(source.into()),
            ..Default::default()
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Result of a successful ingest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestReport {
    pub inserted: usize,
    pub refreshed: usize,
}

impl IngestReport {
    pub fn total(&self) -> usize {
        self.inserted + self.refreshed
    }
}

/// Result of an expire sweep.
#[derive(Debug, Clone, Serialize)]
pub struct SweepReport {
    pub removed: usize,
    /// Records that expired before this instant were removed.
    pub cutoff: DateTime<Utc>,
}

/// Statistics window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatsPeriod {
    Day,
    Week,
    Month,
    All,
}

impl StatsPeriod {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "day" | "1d" | "24h" => Some(Self::Day),
            "week" | "7d" => Some(Self::Week),
            "month" | "30d" => Some(Self::Month),
            "all" => Some(Self::All),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Day => "day",
            Self::Week => "week",
            Self::Month => "month",
            Self::All => "all",
        }
    }

    /// Start of the window ending at `now`, or `None` for all time.
    pub fn since(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Day => Some(now - chrono::Duration::days(1)),
            Self::Week => Some(now - chrono::Duration::days(7)),
            Self::Month => Some(now - chrono::Duration::days(30)),
            Self::All => None,
        }
    }
}

/// Per-source aggregate counts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceStatistics {
    pub active: i64,
    pub expired_retained: i64,
    pub detected_in_period: i64,
    pub last_detected_at: Option<DateTime<Utc>>,
    pub successful_runs: i64,
    pub failed_runs: i64,
}

/// Aggregate statistics computed from one snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Statistics {
    pub period: StatsPeriod,
    pub generated_at: DateTime<Utc>,
    /// Unique active ips.
    pub active_indicators: i64,
    /// Active provenance rows.
    pub active_records: i64,
    pub expired_retained: i64,
    /// Unique ips detected inside the period.
    pub detected_in_period: i64,
    pub sources: std::collections::BTreeMap<String, SourceStatistics>,
}

/// Terminal state of a collection run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Success,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "success" => Self::Success,
            "failed" => Self::Failed,
            _ => Self::Running,
        }
    }
}

/// What started a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerReason {
    #[default]
    Manual,
    Scheduled,
}

impl TriggerReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Scheduled => "scheduled",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "scheduled" => Self::Scheduled,
            _ => Self::Manual,
        }
    }
}

/// One collection attempt. Append-only; closed exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionRun {
    pub id: String,
    pub source: String,
    pub trigger: TriggerReason,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub record_count: usize,
    pub inserted: usize,
    pub refreshed: usize,
    pub error_kind: Option<ErrorKind>,
    pub error: Option<String>,
}

impl CollectionRun {
    pub fn start(source: &str, trigger: TriggerReason, started_at: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            source: source.to_string(),
            trigger,
            status: RunStatus::Running,
            started_at,
            finished_at: None,
            record_count: 0,
            inserted: 0,
            refreshed: 0,
            error_kind: None,
            error: None,
        }
    }
}

/// How a run ended.
#[derive(Debug, Clone)]
pub enum RunOutcome {
    Success {
        record_count: usize,
        report: IngestReport,
    },
    Failed {
        kind: ErrorKind,
        error: String,
    },
}

/// History query.
#[derive(Debug, Clone, Default)]
pub struct RunQuery {
    pub source: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

/// Persisted per-source control state. Written only by the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceState {
    pub source: String,
    pub enabled: bool,
    /// `enabled` was cleared by the failure threshold rather than an operator.
    pub auto_disabled: bool,
    pub last_run: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub last_error_kind: Option<ErrorKind>,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl SourceState {
    pub fn new(source: &str, enabled: bool, now: DateTime<Utc>) -> Self {
        Self {
            source: source.to_string(),
            enabled,
            auto_disabled: false,
            last_run: None,
            last_success: None,
            consecutive_failures: 0,
            last_error_kind: None,
            last_error: None,
            updated_at: now,
        }
    }
}

/// Row counts and file size, for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub indicator_rows: i64,
    pub collection_runs: i64,
    pub sources: i64,
    pub db_path: String,
    pub db_size_mb: f64,
}
