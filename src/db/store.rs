//! SQLite database store implementation.
//!
//! The store is the single source of truth for downtime history. Every write
//! runs in its own transaction and is committed with `synchronous=FULL`
//! before the call returns.

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult, Row};
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

use super::models::*;

const DB_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.9f";

const EVENT_COLUMNS: &str = "id, start_time, end_time, clock_skew, link_name";

const DEFAULT_LINK_NAME: &str = "Internet";

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("downtime event {0} not found")]
    NotFound(i64),
    #[error("downtime event {0} is already closed")]
    AlreadyClosed(i64),
    #[error("database connection lock poisoned")]
    Poisoned,
}

/// Thread-safe database store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
    link_name: String,
}

impl Store {
    /// Create a new store with the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            link_name: DEFAULT_LINK_NAME.to_string(),
        };
        store.init()?;
        Ok(store)
    }

    /// Tag intervals opened from now on with `name`.
    pub fn with_link_name(mut self, name: &str) -> Self {
        self.link_name = name.to_string();
        self
    }

    /// Initialize durability settings and run migrations.
    fn init(&self) -> Result<(), DbError> {
        let conn = self.conn()?;

        let mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |r| r.get(0))?;
        tracing::debug!("SQLite journal mode: {}", mode);
        conn.execute_batch("PRAGMA synchronous=FULL; PRAGMA busy_timeout=5000;")?;

        // Run migrations inline (embedded SQL), all idempotent
        conn.execute_batch(include_str!("../../migrations/000001_downtime.up.sql"))
            .map_err(|e| DbError::Migration(format!("Migration 1 failed: {}", e)))?;
        conn.execute_batch(include_str!("../../migrations/000002_notifications.up.sql"))
            .map_err(|e| DbError::Migration(format!("Migration 2 failed: {}", e)))?;

        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, DbError> {
        self.conn.lock().map_err(|_| DbError::Poisoned)
    }

    // --- Downtime intervals ---

    /// Open a downtime interval starting at `start` and return its ID.
    ///
    /// If an interval is already open it stays authoritative and its ID is
    /// returned. A start earlier than the previous interval's end is moved
    /// forward to that end so intervals never overlap.
    pub fn open_interval(&self, start: DateTime<Utc>) -> Result<i64, DbError> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;

        if let Some(existing) = query_open_event(&tx)? {
            tracing::warn!(
                "Anomaly: downtime interval {} (since {}) is already open, reusing it instead of opening at {}",
                existing.id,
                existing.start(),
                start
            );
            return Ok(existing.id);
        }

        let last_end: Option<String> =
            tx.query_row("SELECT MAX(end_time) FROM downtime", [], |r| r.get(0))?;
        let mut start = start;
        if let Some(prev_end) = last_end.as_deref().and_then(parse_db_time) {
            if start < prev_end {
                tracing::warn!(
                    "Anomaly: downtime start {} precedes previous end {}, clamping",
                    start,
                    prev_end
                );
                start = prev_end;
            }
        }

        tx.execute(
            "INSERT INTO downtime (link_name, start_time) VALUES (?1, ?2)",
            params![self.link_name, format_db_time(start)],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;

        Ok(id)
    }

    /// Close the open interval `id` at `end`.
    ///
    /// An `end` before the start (clock skew) closes the interval with zero
    /// duration and flags it rather than failing.
    pub fn close_interval(&self, id: i64, end: DateTime<Utc>) -> Result<DowntimeEvent, DbError> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;

        let event = tx
            .query_row(
                &format!("SELECT {} FROM downtime WHERE id = ?1", EVENT_COLUMNS),
                params![id],
                event_from_row,
            )
            .optional()?
            .ok_or(DbError::NotFound(id))?;

        let start = match event.interval {
            Interval::Open { start } => start,
            Interval::Closed { .. } => return Err(DbError::AlreadyClosed(id)),
        };

        let (end, clock_skew) = if end < start {
            tracing::warn!(
                "Anomaly: downtime {} closes at {} before it started at {}, recording zero duration",
                id,
                end,
                start
            );
            (start, true)
        } else {
            (end, false)
        };

        let duration = (end - start).num_seconds();
        tx.execute(
            "UPDATE downtime SET end_time = ?1, duration_seconds = ?2, clock_skew = ?3
             WHERE id = ?4 AND end_time IS NULL",
            params![format_db_time(end), duration, clock_skew, id],
        )?;
        tx.commit()?;

        Ok(DowntimeEvent {
            id,
            link_name: event.link_name,
            interval: Interval::Closed { start, end },
            clock_skew,
        })
    }

    /// The currently open interval, if any.
    pub fn open_event(&self) -> Result<Option<DowntimeEvent>, DbError> {
        let conn = self.conn()?;
        query_open_event(&conn)
    }

    /// Intervals overlapping `[range.start, range.end)`, ordered by start.
    pub fn query_intervals(&self, range: TimeRange) -> Result<Vec<DowntimeEvent>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM downtime
             WHERE start_time < ?1 AND (end_time IS NULL OR end_time > ?2)
             ORDER BY start_time ASC, id ASC",
            EVENT_COLUMNS
        ))?;

        let events = stmt
            .query_map(
                params![format_db_time(range.end), format_db_time(range.start)],
                event_from_row,
            )?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(events)
    }

    /// Most recent intervals, newest first.
    pub fn recent_events(&self, limit: u32) -> Result<Vec<DowntimeEvent>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM downtime ORDER BY start_time DESC, id DESC LIMIT ?1",
            EVENT_COLUMNS
        ))?;

        let events = stmt
            .query_map(params![limit], event_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(events)
    }

    /// Delete closed intervals that ended before `cutoff`. Open intervals are
    /// never touched.
    pub fn prune_closed_before(&self, cutoff: DateTime<Utc>) -> Result<usize, DbError> {
        let conn = self.conn()?;
        let deleted = conn.execute(
            "DELETE FROM downtime WHERE end_time IS NOT NULL AND end_time < ?1",
            params![format_db_time(cutoff)],
        )?;
        Ok(deleted)
    }

    // --- Notification log ---

    /// Record the outcome of a notification.
    pub fn record_notification(&self, record: &NotificationRecord) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO notifications (kind, event_time, event_id, delivered, attempts, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.kind.as_str(),
                format_db_time(record.event_time),
                record.event_id,
                record.delivered,
                record.attempts,
                format_db_time(Utc::now()),
            ],
        )?;
        Ok(())
    }

    /// Latest delivered notification time for each kind.
    pub fn last_delivered_notifications(
        &self,
    ) -> Result<Vec<(NotificationKind, DateTime<Utc>)>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT kind, MAX(event_time) FROM notifications WHERE delivered = 1 GROUP BY kind",
        )?;

        let rows = stmt
            .query_map([], |row| {
                let kind: String = row.get(0)?;
                let kind = NotificationKind::from_str(&kind).map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(0, Type::Text, e.into())
                })?;
                Ok((kind, time_column(row, 1)?))
            })?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(rows)
    }

    // --- Status Page Stats ---

    /// Get database size in bytes.
    pub fn get_db_size_bytes(&self) -> Result<i64, DbError> {
        let conn = self.conn()?;
        let page_count: i64 = conn.query_row("PRAGMA page_count", [], |r| r.get(0))?;
        let page_size: i64 = conn.query_row("PRAGMA page_size", [], |r| r.get(0))?;
        Ok(page_count * page_size)
    }

    /// Total number of recorded intervals.
    pub fn count_events(&self) -> Result<i64, DbError> {
        let conn = self.conn()?;
        Ok(conn.query_row("SELECT COUNT(*) FROM downtime", [], |r| r.get(0))?)
    }
}

fn query_open_event(conn: &Connection) -> Result<Option<DowntimeEvent>, DbError> {
    let event = conn
        .query_row(
            &format!(
                "SELECT {} FROM downtime WHERE end_time IS NULL ORDER BY id DESC LIMIT 1",
                EVENT_COLUMNS
            ),
            [],
            event_from_row,
        )
        .optional()?;
    Ok(event)
}

fn event_from_row(row: &Row<'_>) -> SqlResult<DowntimeEvent> {
    let start = time_column(row, 1)?;
    let end: Option<String> = row.get(2)?;

    let interval = match end {
        None => Interval::Open { start },
        Some(s) => Interval::Closed {
            start,
            end: parse_db_time(&s).ok_or_else(|| bad_time(2, &s))?,
        },
    };

    Ok(DowntimeEvent {
        id: row.get(0)?,
        link_name: row.get(4)?,
        interval,
        clock_skew: row.get(3)?,
    })
}

fn time_column(row: &Row<'_>, idx: usize) -> SqlResult<DateTime<Utc>> {
    let s: String = row.get(idx)?;
    parse_db_time(&s).ok_or_else(|| bad_time(idx, &s))
}

fn bad_time(idx: usize, s: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, format!("invalid timestamp: {}", s).into())
}

/// Format a timestamp for storage. Fixed width, so text order is time order.
fn format_db_time(dt: DateTime<Utc>) -> String {
    dt.format(DB_TIME_FORMAT).to_string()
}

/// Parse a datetime string from the database.
fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = [DB_TIME_FORMAT, "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    // Try ISO 8601
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    None
}
