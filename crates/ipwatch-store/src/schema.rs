//! Database schema SQL.

/// Provenance rows, keyed by (ip, source). Timestamps are epoch millis.
pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS indicators (
    ip TEXT NOT NULL,
    source TEXT NOT NULL,
    detected_at INTEGER NOT NULL,
    expires_at INTEGER NOT NULL,
    confidence REAL NOT NULL,
    metadata_json TEXT,
    first_seen_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (ip, source)
);

CREATE INDEX IF NOT EXISTS idx_indicators_expires ON indicators(expires_at);
CREATE INDEX IF NOT EXISTS idx_indicators_source ON indicators(source, expires_at);
CREATE INDEX IF NOT EXISTS idx_indicators_detected ON indicators(detected_at);
"#;

/// Append-only collection history.
pub const RUNS_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS collection_runs (
    id TEXT PRIMARY KEY,
    source TEXT NOT NULL,
    trigger_reason TEXT NOT NULL,
    status TEXT NOT NULL,
    started_at INTEGER NOT NULL,
    finished_at INTEGER,
    record_count INTEGER NOT NULL DEFAULT 0,
    inserted_count INTEGER NOT NULL DEFAULT 0,
    refreshed_count INTEGER NOT NULL DEFAULT 0,
    error_kind TEXT,
    error TEXT
);

CREATE INDEX IF NOT EXISTS idx_runs_source_started ON collection_runs(source, started_at);
CREATE INDEX IF NOT EXISTS idx_runs_status ON collection_runs(status);
"#;

/// One control-state row per source.
pub const SOURCE_STATE_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS source_state (
    source TEXT PRIMARY KEY,
    enabled INTEGER NOT NULL,
    auto_disabled INTEGER NOT NULL DEFAULT 0,
    last_run INTEGER,
    last_success INTEGER,
    consecutive_failures INTEGER NOT NULL DEFAULT 0,
    last_error_kind TEXT,
    last_error TEXT,
    updated_at INTEGER NOT NULL
);
"#;
