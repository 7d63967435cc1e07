//! SQLite-backed unified record store.
//!
//! Every source writes its provenance rows into one `indicators` table keyed
//! by (ip, source). Writes go through a single connection inside an
//! IMMEDIATE transaction, so a batch is committed whole or not at all. Reads
//! run inside a deferred transaction on pooled reader connections; with WAL
//! each read sees exactly one committed generation and never waits for a
//! writer.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use tracing::{debug, info};

use crate::schema::{RUNS_SCHEMA_SQL, SCHEMA_SQL, SOURCE_STATE_SCHEMA_SQL};
use crate::types::*;
use ipwatch_core::clock::{from_millis, to_chrono, to_millis};
use ipwatch_core::{normalize_ip, Clock, Error, ErrorKind, IndicatorRecord, Result};

const DB_FILE: &str = "ipwatch.db";
const MAX_IDLE_READERS: usize = 8;

const UPSERT_SQL: &str = "INSERT INTO indicators \
     (ip, source, detected_at, expires_at, confidence, metadata_json, first_seen_at, updated_at) \
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7) \
     ON CONFLICT(ip, source) DO UPDATE SET \
     detected_at = excluded.detected_at, \
     expires_at = excluded.expires_at, \
     confidence = excluded.confidence, \
     metadata_json = excluded.metadata_json, \
     updated_at = excluded.updated_at";

/// The single writable source of truth for indicators, runs and source state.
pub struct RecordStore {
    writer: Mutex<Connection>,
    readers: Mutex<Vec<Connection>>,
    db_path: PathBuf,
    clock: Arc<dyn Clock>,
    grace: chrono::Duration,
}

/// A validated row ready for the upsert.
struct PreparedRow {
    ip: String,
    detected_at: i64,
    expires_at: i64,
    confidence: f64,
    metadata_json: Option<String>,
}

impl RecordStore {
    /// Open or create the store in `db_dir` (file `ipwatch.db`).
    ///
    /// Expired records are kept for `grace` before `expire_sweep` removes them.
    pub fn open(db_dir: impl AsRef<Path>, clock: Arc<dyn Clock>, grace: Duration) -> Result<Self> {
        let db_dir = db_dir.as_ref();
        std::fs::create_dir_all(db_dir)?;
        let db_path = db_dir.join(DB_FILE);

        let conn = Self::create_connection(&db_path)?;
        Self::init_schema(&conn)?;

        let store = Self {
            writer: Mutex::new(conn),
            readers: Mutex::new(Vec::new()),
            db_path,
            clock,
            grace: to_chrono(grace),
        };

        let stats = store.get_stats()?;
        info!(
            "RecordStore initialized: {} indicator rows, {} runs, {} sources, path={}",
            stats.indicator_rows,
            stats.collection_runs,
            stats.sources,
            store.db_path.display()
        );

        Ok(store)
    }

    fn create_connection(db_path: &Path) -> Result<Connection> {
        let conn = Connection::open(db_path).map_err(db_err)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;",
        )
        .map_err(db_err)?;
        Ok(conn)
    }

    fn create_reader(db_path: &Path) -> Result<Connection> {
        let conn = Connection::open(db_path).map_err(db_err)?;
        conn.execute_batch(
            "PRAGMA busy_timeout = 5000;
             PRAGMA query_only = ON;",
        )
        .map_err(db_err)?;
        Ok(conn)
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        let full_schema = format!("{}\n{}\n{}", SCHEMA_SQL, RUNS_SCHEMA_SQL, SOURCE_STATE_SCHEMA_SQL);
        conn.execute_batch(&full_schema)
            .map_err(|e| Error::Database(format!("Schema init failed: {}", e)))?;
        Ok(())
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Run `f` in a read transaction on a pooled reader connection.
    fn read<T>(&self, f: impl FnOnce(&Transaction<'_>) -> rusqlite::Result<T>) -> Result<T> {
        let pooled = self.readers.lock().pop();
        let mut conn = match pooled {
            Some(conn) => conn,
            None => Self::create_reader(&self.db_path)?,
        };

        let result = read_snapshot(&mut conn, f);
        if result.is_ok() {
            let mut readers = self.readers.lock();
            if readers.len() < MAX_IDLE_READERS {
                readers.push(conn);
            }
        }
        result.map_err(db_err)
    }

    /// Run `f` in an IMMEDIATE write transaction. Any error rolls back.
    fn write<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.writer.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;
        let value = f(&tx)?;
        tx.commit().map_err(db_err)?;
        Ok(value)
    }

    // ---------------------------------------------------------------
    // Ingest
    // ---------------------------------------------------------------

    /// Upsert a batch of records for `source`.
    ///
    /// New (ip, source) pairs are inserted; existing ones get detection time,
    /// expiry, confidence and metadata refreshed. The whole batch is rejected
    /// with `Error::Ingest` if any record is invalid or any write fails.
    pub fn ingest(&self, source: &str, records: &[IndicatorRecord]) -> Result<IngestReport> {
        if records.is_empty() {
            debug!("Empty batch for {}, nothing to ingest", source);
            return Ok(IngestReport::default());
        }

        let total = records.len();
        let mut rows = Vec::with_capacity(total);
        for (i, record) in records.iter().enumerate() {
            let ip = record
                .validate(source)
                .map_err(|e| Error::Ingest(format!("record {} of {}: {}", i + 1, total, inner(e))))?;
            let metadata_json = if record.metadata.is_null() {
                None
            } else {
                Some(serde_json::to_string(&record.metadata).map_err(|e| {
                    Error::Ingest(format!("record {} of {}: metadata: {}", i + 1, total, e))
                })?)
            };
            rows.push(PreparedRow {
                ip,
                detected_at: to_millis(record.detected_at),
                expires_at: to_millis(record.expires_at),
                confidence: record.confidence,
                metadata_json,
            });
        }

        let now = to_millis(self.clock.now());
        let report = self.write(|tx| {
            let mut report = IngestReport::default();
            let mut exists = tx
                .prepare_cached("SELECT 1 FROM indicators WHERE ip = ?1 AND source = ?2")
                .map_err(ingest_err)?;
            let mut upsert = tx.prepare_cached(UPSERT_SQL).map_err(ingest_err)?;
            for row in &rows {
                let existed = exists.exists(params![row.ip, source]).map_err(ingest_err)?;
                upsert
                    .execute(params![
                        row.ip,
                        source,
                        row.detected_at,
                        row.expires_at,
                        row.confidence,
                        row.metadata_json,
                        now,
                    ])
                    .map_err(ingest_err)?;
                if existed {
                    report.refreshed += 1;
                } else {
                    report.inserted += 1;
                }
            }
            Ok(report)
        })?;

        info!(
            "Ingested {} records for {}: {} new, {} refreshed",
            total, source, report.inserted, report.refreshed
        );
        Ok(report)
    }

    // ---------------------------------------------------------------
    // Active view
    // ---------------------------------------------------------------

    /// Unique active ips, most recently detected first, ties by ip.
    ///
    /// With a source filter, returns the ips that source currently reports,
    /// each with its full active provenance.
    pub fn get_active(&self, filter: &ActiveFilter) -> Result<Vec<ActiveIndicator>> {
        let now = to_millis(self.clock.now());
        let limit = filter.limit.map(|l| l as i64).unwrap_or(-1);
        let offset = filter.offset as i64;
        let source = filter.source.clone();

        let rows = self.read(|tx| {
            let mut stmt = tx.prepare_cached(
                "WITH page AS (
                    SELECT ip, MAX(detected_at) AS last_detected
                    FROM indicators
                    WHERE expires_at > ?1
                      AND (?2 IS NULL OR ip IN (
                          SELECT ip FROM indicators WHERE source = ?2 AND expires_at > ?1
                      ))
                    GROUP BY ip
                    ORDER BY last_detected DESC, ip ASC
                    LIMIT ?3 OFFSET ?4
                )
                SELECT i.ip, i.source, i.detected_at, i.expires_at, i.confidence,
                       i.metadata_json, page.last_detected
                FROM indicators i JOIN page ON page.ip = i.ip
                WHERE i.expires_at > ?1
                ORDER BY page.last_detected DESC, i.ip ASC, i.source ASC",
            )?;
            let rows = stmt.query_map(params![now, source, limit, offset], |row| {
                Ok((
                    Self::row_to_record(row)?,
                    row.get::<_, i64>("last_detected")?,
                ))
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })?;

        let mut out: Vec<ActiveIndicator> = Vec::new();
        for (record, last_detected) in rows {
            let provenance = Provenance {
                source: record.source.clone(),
                detected_at: record.detected_at,
                expires_at: record.expires_at,
                confidence: record.confidence,
                metadata: record.metadata,
            };
            match out.last_mut() {
                Some(entry) if entry.ip == record.ip => {
                    entry.sources.push(record.source);
                    entry.expires_at = entry.expires_at.max(record.expires_at);
                    entry.provenance.push(provenance);
                }
                _ => out.push(ActiveIndicator {
                    ip: record.ip,
                    sources: vec![record.source],
                    last_detected_at: from_millis(last_detected),
                    expires_at: record.expires_at,
                    provenance: vec![provenance],
                }),
            }
        }
        Ok(out)
    }

    /// Number of unique active ips, optionally limited to one source.
    pub fn count_active(&self, source: Option<&str>) -> Result<i64> {
        let now = to_millis(self.clock.now());
        self.read(|tx| {
            tx.query_row(
                "SELECT COUNT(DISTINCT ip) FROM indicators
                 WHERE expires_at > ?1 AND (?2 IS NULL OR source = ?2)",
                params![now, source],
                |row| row.get(0),
            )
        })
    }

    // ---------------------------------------------------------------
    // Statistics
    // ---------------------------------------------------------------

    /// Aggregate counts, all taken from one snapshot.
    pub fn get_statistics(&self, period: StatsPeriod) -> Result<Statistics> {
        let generated_at = self.clock.now();
        let now = to_millis(generated_at);
        let since = period.since(generated_at).map(to_millis).unwrap_or(i64::MIN);

        let (active_indicators, detected_in_period, sources) = self.read(|tx| {
            let active_indicators: i64 = tx.query_row(
                "SELECT COUNT(DISTINCT ip) FROM indicators WHERE expires_at > ?1",
                params![now],
                |row| row.get(0),
            )?;
            let detected_in_period: i64 = tx.query_row(
                "SELECT COUNT(DISTINCT ip) FROM indicators WHERE detected_at >= ?1",
                params![since],
                |row| row.get(0),
            )?;

            let mut sources: BTreeMap<String, SourceStatistics> = BTreeMap::new();
            let mut stmt = tx.prepare_cached(
                "SELECT source,
                        SUM(CASE WHEN expires_at > ?1 THEN 1 ELSE 0 END),
                        SUM(CASE WHEN expires_at <= ?1 THEN 1 ELSE 0 END),
                        SUM(CASE WHEN detected_at >= ?2 THEN 1 ELSE 0 END),
                        MAX(detected_at)
                 FROM indicators GROUP BY source",
            )?;
            let rows = stmt.query_map(params![now, since], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    SourceStatistics {
                        active: row.get(1)?,
                        expired_retained: row.get(2)?,
                        detected_in_period: row.get(3)?,
                        last_detected_at: row.get::<_, Option<i64>>(4)?.map(from_millis),
                        successful_runs: 0,
                        failed_runs: 0,
                    },
                ))
            })?;
            for row in rows {
                let (source, stats) = row?;
                sources.insert(source, stats);
            }

            let mut stmt = tx.prepare_cached(
                "SELECT source,
                        SUM(CASE WHEN status = 'success' THEN 1 ELSE 0 END),
                        SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END)
                 FROM collection_runs WHERE started_at >= ?1 GROUP BY source",
            )?;
            let rows = stmt.query_map(params![since], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })?;
            for row in rows {
                let (source, ok, failed) = row?;
                let entry = sources.entry(source).or_default();
                entry.successful_runs = ok;
                entry.failed_runs = failed;
            }

            Ok((active_indicators, detected_in_period, sources))
        })?;

        Ok(Statistics {
            period,
            generated_at,
            active_indicators,
            active_records: sources.values().map(|s| s.active).sum(),
            expired_retained: sources.values().map(|s| s.expired_retained).sum(),
            detected_in_period,
            sources,
        })
    }

    // ---------------------------------------------------------------
    // Expiry and audit
    // ---------------------------------------------------------------

    /// Physically remove records whose expiry is older than the grace window.
    ///
    /// Called from the background sweeper only.
    pub fn expire_sweep(&self) -> Result<SweepReport> {
        let cutoff = self.clock.now() - self.grace;
        let removed = self.write(|tx| {
            tx.execute(
                "DELETE FROM indicators WHERE expires_at < ?1",
                params![to_millis(cutoff)],
            )
            .map_err(db_err)
        })?;
        if removed > 0 {
            info!("Expire sweep removed {} records (cutoff {})", removed, cutoff.to_rfc3339());
        } else {
            debug!("Expire sweep: nothing older than {}", cutoff.to_rfc3339());
        }
        Ok(SweepReport { removed, cutoff })
    }

    /// Every retained provenance row for an ip, expired or not.
    pub fn get_history(&self, ip: &str) -> Result<Vec<IndicatorRecord>> {
        let ip = normalize_ip(ip)?;
        self.read(|tx| {
            let mut stmt = tx.prepare_cached(
                "SELECT * FROM indicators WHERE ip = ?1 ORDER BY source",
            )?;
            let rows = stmt.query_map(params![ip], Self::row_to_record)?;
            rows.collect()
        })
    }

    /// Expired rows still inside the grace window, newest expiry first.
    pub fn get_expired(&self, source: Option<&str>) -> Result<Vec<IndicatorRecord>> {
        let now = to_millis(self.clock.now());
        self.read(|tx| {
            let mut stmt = tx.prepare_cached(
                "SELECT * FROM indicators
                 WHERE expires_at <= ?1 AND (?2 IS NULL OR source = ?2)
                 ORDER BY expires_at DESC, ip ASC, source ASC",
            )?;
            let rows = stmt.query_map(params![now, source], Self::row_to_record)?;
            rows.collect()
        })
    }

    /// All retained rows of one source, ordered by ip.
    pub fn records_for_source(&self, source: &str) -> Result<Vec<IndicatorRecord>> {
        self.read(|tx| {
            let mut stmt =
                tx.prepare_cached("SELECT * FROM indicators WHERE source = ?1 ORDER BY ip")?;
            let rows = stmt.query_map(params![source], Self::row_to_record)?;
            rows.collect()
        })
    }

    // ---------------------------------------------------------------
    // Collection runs
    // ---------------------------------------------------------------

    /// Persist a new running run and the source state that records it.
    pub fn open_run(&self, run: &CollectionRun, state: &SourceState) -> Result<()> {
        self.write(|tx| {
            tx.execute(
                "INSERT INTO collection_runs
                 (id, source, trigger_reason, status, started_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    run.id,
                    run.source,
                    run.trigger.as_str(),
                    run.status.as_str(),
                    to_millis(run.started_at),
                ],
            )
            .map_err(db_err)?;
            Self::upsert_state(tx, state)
        })
    }

    /// Close a running run and store the resulting source state together.
    ///
    /// Returns false if the run was already closed; the state is then left
    /// untouched. With `state = None` only the run row is written.
    pub fn close_run(
        &self,
        run_id: &str,
        outcome: &RunOutcome,
        finished_at: DateTime<Utc>,
        state: Option<&SourceState>,
    ) -> Result<bool> {
        self.write(|tx| {
            let updated = match outcome {
                RunOutcome::Success {
                    record_count,
                    report,
                } => tx.execute(
                    "UPDATE collection_runs
                     SET status = 'success', finished_at = ?2, record_count = ?3,
                         inserted_count = ?4, refreshed_count = ?5
                     WHERE id = ?1 AND status = 'running'",
                    params![
                        run_id,
                        to_millis(finished_at),
                        *record_count as i64,
                        report.inserted as i64,
                        report.refreshed as i64,
                    ],
                ),
                RunOutcome::Failed { kind, error } => tx.execute(
                    "UPDATE collection_runs
                     SET status = 'failed', finished_at = ?2, error_kind = ?3, error = ?4
                     WHERE id = ?1 AND status = 'running'",
                    params![run_id, to_millis(finished_at), kind.as_str(), error],
                ),
            }
            .map_err(db_err)?;

            if updated == 0 {
                return Ok(false);
            }
            if let Some(state) = state {
                Self::upsert_state(tx, state)?;
            }
            Ok(true)
        })
    }

    /// Close every run left `running` by a previous process.
    pub fn fail_interrupted_runs(&self) -> Result<usize> {
        let now = to_millis(self.clock.now());
        let count = self.write(|tx| {
            tx.execute(
                "UPDATE collection_runs
                 SET status = 'failed', finished_at = ?1, error_kind = 'internal',
                     error = 'interrupted'
                 WHERE status = 'running'",
                params![now],
            )
            .map_err(db_err)
        })?;
        if count > 0 {
            info!("Closed {} interrupted collection runs", count);
        }
        Ok(count)
    }

    pub fn get_run(&self, run_id: &str) -> Result<Option<CollectionRun>> {
        self.read(|tx| {
            tx.prepare_cached("SELECT * FROM collection_runs WHERE id = ?1")?
                .query_row(params![run_id], Self::row_to_run)
                .optional()
        })
    }

    /// Run history, newest first.
    pub fn list_runs(&self, query: &RunQuery) -> Result<Vec<CollectionRun>> {
        let limit = query.limit.map(|l| l as i64).unwrap_or(-1);
        self.read(|tx| {
            let mut stmt = tx.prepare_cached(
                "SELECT * FROM collection_runs
                 WHERE (?1 IS NULL OR source = ?1)
                   AND (?2 IS NULL OR started_at >= ?2)
                   AND (?3 IS NULL OR started_at < ?3)
                 ORDER BY started_at DESC, rowid DESC
                 LIMIT ?4",
            )?;
            let rows = stmt.query_map(
                params![
                    query.source,
                    query.from.map(to_millis),
                    query.to.map(to_millis),
                    limit,
                ],
                Self::row_to_run,
            )?;
            rows.collect()
        })
    }

    pub fn latest_run(&self, source: &str) -> Result<Option<CollectionRun>> {
        let runs = self.list_runs(&RunQuery {
            source: Some(source.to_string()),
            limit: Some(1),
            ..Default::default()
        })?;
        Ok(runs.into_iter().next())
    }

    // ---------------------------------------------------------------
    // Source state
    // ---------------------------------------------------------------

    pub fn get_source_state(&self, source: &str) -> Result<Option<SourceState>> {
        self.read(|tx| {
            tx.prepare_cached("SELECT * FROM source_state WHERE source = ?1")?
                .query_row(params![source], Self::row_to_state)
                .optional()
        })
    }

    pub fn list_source_states(&self) -> Result<Vec<SourceState>> {
        self.read(|tx| {
            let mut stmt = tx.prepare_cached("SELECT * FROM source_state ORDER BY source")?;
            let rows = stmt.query_map([], Self::row_to_state)?;
            rows.collect()
        })
    }

    pub fn put_source_state(&self, state: &SourceState) -> Result<()> {
        self.write(|tx| Self::upsert_state(tx, state))
    }

    fn upsert_state(tx: &Transaction<'_>, state: &SourceState) -> Result<()> {
        tx.execute(
            "INSERT INTO source_state
             (source, enabled, auto_disabled, last_run, last_success, consecutive_failures,
              last_error_kind, last_error, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(source) DO UPDATE SET
             enabled = excluded.enabled,
             auto_disabled = excluded.auto_disabled,
             last_run = excluded.last_run,
             last_success = excluded.last_success,
             consecutive_failures = excluded.consecutive_failures,
             last_error_kind = excluded.last_error_kind,
             last_error = excluded.last_error,
             updated_at = excluded.updated_at",
            params![
                state.source,
                state.enabled,
                state.auto_disabled,
                state.last_run.map(to_millis),
                state.last_success.map(to_millis),
                state.consecutive_failures,
                state.last_error_kind.map(|k| k.as_str()),
                state.last_error,
                to_millis(state.updated_at),
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    // ---------------------------------------------------------------
    // Stats
    // ---------------------------------------------------------------

    /// Row counts and database size.
    pub fn get_stats(&self) -> Result<StoreStats> {
        let (indicator_rows, collection_runs, sources) = self.read(|tx| {
            let indicators: i64 =
                tx.query_row("SELECT COUNT(*) FROM indicators", [], |row| row.get(0))?;
            let runs: i64 =
                tx.query_row("SELECT COUNT(*) FROM collection_runs", [], |row| row.get(0))?;
            let sources: i64 =
                tx.query_row("SELECT COUNT(*) FROM source_state", [], |row| row.get(0))?;
            Ok((indicators, runs, sources))
        })?;

        let db_size = std::fs::metadata(&self.db_path)
            .map(|m| m.len())
            .unwrap_or(0);

        Ok(StoreStats {
            indicator_rows,
            collection_runs,
            sources,
            db_path: self.db_path.to_string_lossy().to_string(),
            db_size_mb: db_size as f64 / (1024.0 * 1024.0),
        })
    }

    // ---------------------------------------------------------------
    // Row Mapping Helpers
    // ---------------------------------------------------------------

    fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<IndicatorRecord> {
        Ok(IndicatorRecord {
            ip: row.get("ip")?,
            source: row.get("source")?,
            detected_at: from_millis(row.get("detected_at")?),
            expires_at: from_millis(row.get("expires_at")?),
            confidence: row.get("confidence")?,
            metadata: row
                .get::<_, Option<String>>("metadata_json")?
                .and_then(|s| serde_json::from_str(&s).ok())
                .unwrap_or(serde_json::Value::Null),
        })
    }

    fn row_to_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<CollectionRun> {
        Ok(CollectionRun {
            id: row.get("id")?,
            source: row.get("source")?,
            trigger: TriggerReason::parse(&row.get::<_, String>("trigger_reason")?),
            status: RunStatus::parse(&row.get::<_, String>("status")?),
            started_at: from_millis(row.get("started_at")?),
            finished_at: row.get::<_, Option<i64>>("finished_at")?.map(from_millis),
            record_count: row.get::<_, i64>("record_count")? as usize,
            inserted: row.get::<_, i64>("inserted_count")? as usize,
            refreshed: row.get::<_, i64>("refreshed_count")? as usize,
            error_kind: row
                .get::<_, Option<String>>("error_kind")?
                .and_then(|k| ErrorKind::parse(&k)),
            error: row.get("error")?,
        })
    }

    fn row_to_state(row: &rusqlite::Row<'_>) -> rusqlite::Result<SourceState> {
        Ok(SourceState {
            source: row.get("source")?,
            enabled: row.get("enabled")?,
            auto_disabled: row.get("auto_disabled")?,
            last_run: row.get::<_, Option<i64>>("last_run")?.map(from_millis),
            last_success: row.get::<_, Option<i64>>("last_success")?.map(from_millis),
            consecutive_failures: row.get("consecutive_failures")?,
            last_error_kind: row
                .get::<_, Option<String>>("last_error_kind")?
                .and_then(|k| ErrorKind::parse(&k)),
            last_error: row.get("last_error")?,
            updated_at: from_millis(row.get("updated_at")?),
        })
    }
}

fn read_snapshot<T>(
    conn: &mut Connection,
    f: impl FnOnce(&Transaction<'_>) -> rusqlite::Result<T>,
) -> rusqlite::Result<T> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Deferred)?;
    let value = f(&tx)?;
    tx.commit()?;
    Ok(value)
}

fn db_err(e: rusqlite::Error) -> Error {
    Error::Database(e.to_string())
}

fn ingest_err(e: rusqlite::Error) -> Error {
    Error::Ingest(e.to_string())
}

fn inner(e: Error) -> String {
    match e {
        Error::Ingest(msg) => msg,
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ipwatch_core::ManualClock;
    use tempfile::TempDir;

    const HOUR: Duration = Duration::from_secs(3600);

    fn t0() -> DateTime<Utc> {
        from_millis(1_700_000_000_000)
    }

    fn test_store() -> (RecordStore, Arc<ManualClock>, TempDir) {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(t0()));
        let store = RecordStore::open(dir.path(), clock.clone(), 2 * HOUR).unwrap();
        (store, clock, dir)
    }

    fn record(ip: &str, source: &str, detected: DateTime<Utc>, ttl_hours: i64) -> IndicatorRecord {
        IndicatorRecord {
            ip: ip.into(),
            source: source.into(),
            detected_at: detected,
            expires_at: detected + chrono::Duration::hours(ttl_hours),
            confidence: 0.9,
            metadata: serde_json::json!({"reason": "scanner"}),
        }
    }

    #[test]
    fn test_ingest_and_get_active() {
        let (store, _clock, _dir) = test_store();
        let batch = vec![
            record("192.0.2.1", "regtech", t0(), 24),
            record("192.0.2.2", "regtech", t0(), 24),
            record("192.0.2.3", "regtech", t0(), 24),
        ];

        let report = store.ingest("regtech", &batch).unwrap();
        assert_eq!(report, IngestReport { inserted: 3, refreshed: 0 });

        let active = store.get_active(&ActiveFilter::source("regtech")).unwrap();
        assert_eq!(active.len(), 3);
        assert!(active.iter().all(|a| a.sources == vec!["regtech".to_string()]));
        assert_eq!(active[0].provenance[0].metadata["reason"], "scanner");
    }

    #[test]
    fn test_empty_batch_is_noop() {
        let (store, _clock, _dir) = test_store();
        let report = store.ingest("regtech", &[]).unwrap();
        assert_eq!(report.total(), 0);
        assert_eq!(store.get_stats().unwrap().indicator_rows, 0);
    }

    #[test]
    fn test_reingest_is_idempotent_and_refreshes() {
        let (store, clock, _dir) = test_store();
        let batch = vec![
            record("192.0.2.1", "regtech", t0(), 24),
            record("192.0.2.2", "regtech", t0(), 24),
        ];
        store.ingest("regtech", &batch).unwrap();

        clock.advance(HOUR);
        let later = t0() + chrono::Duration::hours(1);
        let refreshed = vec![
            record("192.0.2.1", "regtech", later, 48),
            record("192.0.2.2", "regtech", later, 48),
        ];
        let report = store.ingest("regtech", &refreshed).unwrap();
        assert_eq!(report, IngestReport { inserted: 0, refreshed: 2 });

        let rows = store.records_for_source("regtech").unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.expires_at == later + chrono::Duration::hours(48)));
        assert!(rows.iter().all(|r| r.detected_at == later));
    }

    #[test]
    fn test_invalid_record_rejects_whole_batch() {
        let (store, _clock, _dir) = test_store();
        store
            .ingest("regtech", &[record("192.0.2.1", "regtech", t0(), 24)])
            .unwrap();
        let before = store.records_for_source("regtech").unwrap();

        let later = t0() + chrono::Duration::minutes(5);
        let batch = vec![
            record("192.0.2.1", "regtech", later, 72),
            record("192.0.2.9", "regtech", later, 72),
            record("not-an-ip", "regtech", later, 72),
            record("192.0.2.10", "regtech", later, 72),
        ];
        let err = store.ingest("regtech", &batch).unwrap_err();
        match err {
            Error::Ingest(msg) => assert!(msg.contains("record 3 of 4"), "{}", msg),
            other => panic!("unexpected error: {}", other),
        }

        assert_eq!(store.records_for_source("regtech").unwrap(), before);
    }

    #[test]
    fn test_same_ip_from_two_sources_is_one_entry() {
        let (store, _clock, _dir) = test_store();
        store
            .ingest("regtech", &[record("203.0.113.5", "regtech", t0(), 24)])
            .unwrap();
        store
            .ingest("secudium", &[record("203.0.113.5", "secudium", t0(), 24)])
            .unwrap();

        let active = store.get_active(&ActiveFilter::default()).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].sources, vec!["regtech", "secudium"]);
        assert_eq!(active[0].provenance.len(), 2);
        assert_eq!(store.get_stats().unwrap().indicator_rows, 2);

        // A source filter still returns the full provenance.
        let filtered = store.get_active(&ActiveFilter::source("secudium")).unwrap();
        assert_eq!(filtered[0].sources, vec!["regtech", "secudium"]);
    }

    #[test]
    fn test_ordering_and_pagination() {
        let (store, _clock, _dir) = test_store();
        let batch = vec![
            record("10.0.0.3", "regtech", t0(), 24),
            record("10.0.0.1", "regtech", t0(), 24),
            record("10.0.0.2", "regtech", t0() + chrono::Duration::minutes(1), 24),
        ];
        store.ingest("regtech", &batch).unwrap();

        let all: Vec<String> = store
            .get_active(&ActiveFilter::default())
            .unwrap()
            .into_iter()
            .map(|a| a.ip)
            .collect();
        assert_eq!(all, vec!["10.0.0.2", "10.0.0.1", "10.0.0.3"]);

        let page = store
            .get_active(&ActiveFilter {
                source: None,
                limit: Some(2),
                offset: 1,
            })
            .unwrap();
        let ips: Vec<&str> = page.iter().map(|a| a.ip.as_str()).collect();
        assert_eq!(ips, vec!["10.0.0.1", "10.0.0.3"]);
    }

    #[test]
    fn test_expiry_and_grace_window() {
        let (store, clock, _dir) = test_store();
        store
            .ingest("regtech", &[record("198.51.100.1", "regtech", t0(), 1)])
            .unwrap();

        clock.advance(2 * HOUR);
        assert!(store.get_active(&ActiveFilter::default()).unwrap().is_empty());
        assert_eq!(store.get_history("198.51.100.1").unwrap().len(), 1);
        assert_eq!(store.get_expired(Some("regtech")).unwrap().len(), 1);

        // Still inside the 2h grace window: the sweep keeps it.
        assert_eq!(store.expire_sweep().unwrap().removed, 0);

        clock.advance(2 * HOUR);
        assert_eq!(store.expire_sweep().unwrap().removed, 1);
        assert!(store.get_history("198.51.100.1").unwrap().is_empty());
    }

    #[test]
    fn test_statistics() {
        let (store, clock, _dir) = test_store();
        store
            .ingest(
                "regtech",
                &[
                    record("192.0.2.1", "regtech", t0(), 24),
                    record("192.0.2.2", "regtech", t0(), 1),
                ],
            )
            .unwrap();
        store
            .ingest("secudium", &[record("192.0.2.1", "secudium", t0(), 24)])
            .unwrap();

        clock.advance(2 * HOUR);
        let stats = store.get_statistics(StatsPeriod::Day).unwrap();
        assert_eq!(stats.active_indicators, 1);
        assert_eq!(stats.active_records, 2);
        assert_eq!(stats.expired_retained, 1);
        assert_eq!(stats.detected_in_period, 2);
        assert_eq!(stats.sources["regtech"].active, 1);
        assert_eq!(stats.sources["regtech"].expired_retained, 1);
        assert_eq!(stats.sources["secudium"].active, 1);
    }

    #[test]
    fn test_run_lifecycle_closes_once() {
        let (store, clock, _dir) = test_store();
        let mut state = SourceState::new("regtech", true, clock.now());
        let run = CollectionRun::start("regtech", TriggerReason::Manual, clock.now());
        state.last_run = Some(run.started_at);
        store.open_run(&run, &state).unwrap();

        let loaded = store.get_run(&run.id).unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::Running);

        state.last_success = Some(clock.now());
        let outcome = RunOutcome::Success {
            record_count: 3,
            report: IngestReport { inserted: 2, refreshed: 1 },
        };
        assert!(store.close_run(&run.id, &outcome, clock.now(), Some(&state)).unwrap());

        let failed = RunOutcome::Failed {
            kind: ErrorKind::Transport,
            error: "late".into(),
        };
        assert!(!store.close_run(&run.id, &failed, clock.now(), Some(&state)).unwrap());

        let closed = store.get_run(&run.id).unwrap().unwrap();
        assert_eq!(closed.status, RunStatus::Success);
        assert_eq!(closed.record_count, 3);
        assert_eq!(closed.inserted, 2);
        assert!(closed.error.is_none());
    }

    #[test]
    fn test_close_run_without_state_keeps_stored_state() {
        let (store, clock, _dir) = test_store();
        let state = SourceState::new("secudium", true, clock.now());
        let run = CollectionRun::start("secudium", TriggerReason::Scheduled, clock.now());
        store.open_run(&run, &state).unwrap();

        let failed = RunOutcome::Failed {
            kind: ErrorKind::Parse,
            error: "header row not found".into(),
        };
        assert!(store.close_run(&run.id, &failed, clock.now(), None).unwrap());

        let closed = store.get_run(&run.id).unwrap().unwrap();
        assert_eq!(closed.status, RunStatus::Failed);
        assert_eq!(closed.error_kind, Some(ErrorKind::Parse));
        let stored = store.get_source_state("secudium").unwrap().unwrap();
        assert_eq!(stored.consecutive_failures, 0);
        assert!(stored.last_error.is_none());
    }

    #[test]
    fn test_list_runs_by_source_and_time() {
        let (store, clock, _dir) = test_store();
        let state = SourceState::new("regtech", true, clock.now());
        for _ in 0..3 {
            let run = CollectionRun::start("regtech", TriggerReason::Scheduled, clock.now());
            store.open_run(&run, &state).unwrap();
            clock.advance(HOUR);
        }
        let other = CollectionRun::start("secudium", TriggerReason::Manual, clock.now());
        store
            .open_run(&other, &SourceState::new("secudium", true, clock.now()))
            .unwrap();

        let regtech = store
            .list_runs(&RunQuery {
                source: Some("regtech".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(regtech.len(), 3);
        assert!(regtech[0].started_at > regtech[2].started_at);

        let window = store
            .list_runs(&RunQuery {
                from: Some(t0() + chrono::Duration::hours(1)),
                to: Some(t0() + chrono::Duration::hours(3)),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(window.len(), 2);

        assert_eq!(store.fail_interrupted_runs().unwrap(), 4);
        let latest = store.latest_run("secudium").unwrap().unwrap();
        assert_eq!(latest.status, RunStatus::Failed);
        assert_eq!(latest.error.as_deref(), Some("interrupted"));
    }

    #[test]
    fn test_source_state_round_trip() {
        let (store, clock, _dir) = test_store();
        assert!(store.get_source_state("regtech").unwrap().is_none());

        let mut state = SourceState::new("regtech", true, clock.now());
        state.consecutive_failures = 2;
        state.last_error_kind = Some(ErrorKind::Authentication);
        state.last_error = Some("login rejected".into());
        store.put_source_state(&state).unwrap();

        assert_eq!(store.get_source_state("regtech").unwrap().unwrap(), state);
        assert_eq!(store.list_source_states().unwrap().len(), 1);
    }

    #[test]
    fn test_readers_see_whole_batches_only() {
        let (store, _clock, _dir) = test_store();
        let store = Arc::new(store);
        let batch: Vec<IndicatorRecord> = (0..2000u32)
            .map(|i| {
                let ip = std::net::Ipv4Addr::from(0x0A00_0000 + i).to_string();
                record(&ip, "regtech", t0(), 24)
            })
            .collect();

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || {
                    let mut seen = Vec::new();
                    for _ in 0..50 {
                        let n = store.get_active(&ActiveFilter::source("regtech")).unwrap().len();
                        seen.push(n);
                    }
                    seen
                })
            })
            .collect();

        store.ingest("regtech", &batch).unwrap();

        for reader in readers {
            for n in reader.join().unwrap() {
                assert!(n == 0 || n == 2000, "torn read: {}", n);
            }
        }
        assert_eq!(store.count_active(Some("regtech")).unwrap(), 2000);
    }
}
