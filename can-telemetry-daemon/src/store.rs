//! Durable record storage in SQLite
//!
//! Records land in a single append-only table, one row per channel value,
//! timestamped on the batch grid. A consumer drains the store oldest batch
//! first through [`Store::take_oldest`], which removes what it returns, so
//! everything still in the table is pending upload by definition.
//!
//! Writes retry indefinitely while the database is busy: the writer thread
//! has nowhere to put a batch it cannot persist, and the contention (an
//! external consumer draining the table) always clears.

use anyhow::{Context, Result};
use can_telemetry_core::types::Batch;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS can_record (
    key INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp TEXT NOT NULL,
    channel INTEGER NOT NULL,
    value REAL NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_can_record_timestamp ON can_record (timestamp);
";

const BUSY_RETRY_DELAY: Duration = Duration::from_millis(10);

/// All records sharing the oldest timestamp in the store, keyed by channel
#[derive(Debug, Serialize)]
pub struct PendingBatch {
    pub timestamp: DateTime<Utc>,
    pub values: BTreeMap<u16, f64>,
}

/// SQLite-backed record store, shared between the writer thread and the
/// drain path
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (creating if needed) the store at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database {:?}", path))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .context("Failed to configure database")?;
        conn.execute_batch(SCHEMA)
            .context("Failed to create record schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store for tests
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Persist a batch atomically, retrying while the database is busy.
    pub fn insert_batch(&self, batch: &Batch) -> Result<()> {
        let mut conn = self.conn();
        loop {
            match insert_all(&mut conn, batch) {
                Ok(()) => return Ok(()),
                Err(e) if is_busy(&e) => {
                    log::warn!("database busy, retrying insert of {} records", batch.len());
                    thread::sleep(BUSY_RETRY_DELAY);
                }
                Err(e) => return Err(e).context("Failed to persist record batch"),
            }
        }
    }

    /// Remove and return the records of the oldest stored timestamp.
    ///
    /// Returns `Ok(None)` when the store is empty. Selection and deletion
    /// run in one transaction, so a crash between them loses nothing.
    pub fn take_oldest(&self) -> Result<Option<PendingBatch>> {
        let mut conn = self.conn();
        let taken = loop {
            match take_oldest_tx(&mut conn) {
                Ok(taken) => break taken,
                Err(e) if is_busy(&e) => {
                    log::warn!("database busy, retrying batch drain");
                    thread::sleep(BUSY_RETRY_DELAY);
                }
                Err(e) => return Err(e).context("Failed to drain pending batch"),
            }
        };

        let Some((raw_timestamp, values)) = taken else {
            return Ok(None);
        };
        let timestamp = DateTime::parse_from_rfc3339(&raw_timestamp)
            .with_context(|| format!("Malformed timestamp in store: {}", raw_timestamp))?
            .with_timezone(&Utc);
        Ok(Some(PendingBatch { timestamp, values }))
    }

    /// Number of stored records
    pub fn record_count(&self) -> Result<u64> {
        let conn = self.conn();
        let count = conn.query_row("SELECT COUNT(*) FROM can_record", [], |row| row.get(0))?;
        Ok(count)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // A poisoned lock only means another thread panicked mid-call; the
        // connection itself stays usable.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
impl Store {
    /// Drop the record table so the next insert fails with a non-busy error
    pub fn drop_schema(&self) {
        self.conn().execute_batch("DROP TABLE can_record").unwrap();
    }
}

fn insert_all(conn: &mut Connection, batch: &Batch) -> rusqlite::Result<()> {
    let tx = conn.transaction()?;
    {
        let mut stmt = tx.prepare_cached(
            "INSERT INTO can_record (timestamp, channel, value) VALUES (?1, ?2, ?3)",
        )?;
        for record in batch {
            stmt.execute(rusqlite::params![
                encode_timestamp(record.timestamp),
                record.channel.0,
                record.value
            ])?;
        }
    }
    tx.commit()
}

fn take_oldest_tx(
    conn: &mut Connection,
) -> rusqlite::Result<Option<(String, BTreeMap<u16, f64>)>> {
    let tx = conn.transaction()?;

    let oldest: Option<String> =
        tx.query_row("SELECT MIN(timestamp) FROM can_record", [], |row| row.get(0))?;
    let Some(timestamp) = oldest else {
        return Ok(None);
    };

    let mut values = BTreeMap::new();
    {
        let mut stmt =
            tx.prepare("SELECT channel, value FROM can_record WHERE timestamp = ?1")?;
        let rows = stmt.query_map([&timestamp], |row| {
            Ok((row.get::<_, u16>(0)?, row.get::<_, f64>(1)?))
        })?;
        for row in rows {
            let (channel, value) = row?;
            values.insert(channel, value);
        }
    }

    tx.execute("DELETE FROM can_record WHERE timestamp = ?1", [&timestamp])?;
    tx.commit()?;
    Ok(Some((timestamp, values)))
}

/// RFC 3339 with fixed millisecond precision, so lexicographic order on the
/// column matches chronological order
fn encode_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use can_telemetry_core::types::{ChannelKey, Record};
    use chrono::TimeZone;

    fn record(ts: DateTime<Utc>, channel: u16, value: f64) -> Record {
        Record {
            timestamp: ts,
            channel: ChannelKey(channel),
            value,
        }
    }

    #[test]
    fn test_insert_and_count() {
        let store = Store::open_in_memory().unwrap();
        let ts = Utc.with_ymd_and_hms(2020, 6, 5, 12, 0, 0).unwrap();

        store
            .insert_batch(&vec![record(ts, 442, 55.0), record(ts, 30, 350.0)])
            .unwrap();
        assert_eq!(store.record_count().unwrap(), 2);
    }

    #[test]
    fn test_take_oldest_drains_in_order() {
        let store = Store::open_in_memory().unwrap();
        let first = Utc.with_ymd_and_hms(2020, 6, 5, 12, 0, 0).unwrap();
        let second = first + chrono::Duration::seconds(5);

        store
            .insert_batch(&vec![
                record(first, 442, 55.0),
                record(first, 30, 350.0),
                record(second, 442, 60.0),
            ])
            .unwrap();

        let batch = store.take_oldest().unwrap().unwrap();
        assert_eq!(batch.timestamp, first);
        assert_eq!(batch.values.len(), 2);
        assert_eq!(batch.values[&442], 55.0);
        assert_eq!(batch.values[&30], 350.0);
        assert_eq!(store.record_count().unwrap(), 1);

        let batch = store.take_oldest().unwrap().unwrap();
        assert_eq!(batch.timestamp, second);
        assert_eq!(batch.values[&442], 60.0);

        assert!(store.take_oldest().unwrap().is_none());
        assert_eq!(store.record_count().unwrap(), 0);
    }

    #[test]
    fn test_busy_classification() {
        let busy = rusqlite::Error::SqliteFailure(rusqlite::ffi::Error::new(5), None);
        assert!(is_busy(&busy));
        let locked = rusqlite::Error::SqliteFailure(rusqlite::ffi::Error::new(6), None);
        assert!(is_busy(&locked));
        // Constraint violations are fatal, not retried
        let constraint = rusqlite::Error::SqliteFailure(rusqlite::ffi::Error::new(19), None);
        assert!(!is_busy(&constraint));
    }

    #[test]
    fn test_pending_batch_serializes_to_json() {
        let store = Store::open_in_memory().unwrap();
        let ts = Utc.with_ymd_and_hms(2020, 6, 5, 12, 0, 0).unwrap();
        store.insert_batch(&vec![record(ts, 442, 55.0)]).unwrap();

        let batch = store.take_oldest().unwrap().unwrap();
        let json = serde_json::to_string(&batch).unwrap();
        assert!(json.contains("\"442\":55.0"));
        assert!(json.contains("2020-06-05T12:00:00Z"));
    }
}
