//! Durable per-device outbox.
//!
//! A device that cannot reach the broker appends its messages here and
//! replays them in insertion order after reconnecting. The store is a local
//! SQLite database, one file per device, with a bounded record count:
//! appending at capacity evicts the oldest record first (drop-oldest).
//!
//! # Schema
//!
//! ```sql
//! CREATE TABLE messages (
//!     id INTEGER PRIMARY KEY AUTOINCREMENT,
//!     topic TEXT NOT NULL,
//!     payload BLOB NOT NULL,
//!     qos INTEGER NOT NULL,
//!     timestamp REAL NOT NULL,
//!     created_at TEXT NOT NULL
//! );
//! ```
//!
//! The outbox is single-writer: exactly one device process owns the file.
//! `size()` may be read from other threads of the same process (the harness
//! samples queue depth this way).

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Errors surfaced by outbox operations.
///
/// All variants mean the persistent medium failed; callers are expected to
/// log and continue (the device keeps publishing on a best-effort basis).
#[derive(Debug, Error)]
pub enum OutboxError {
    /// The backing database reported an I/O or constraint failure.
    #[error("outbox storage failure: {0}")]
    Storage(#[from] rusqlite::Error),

    /// The queue directory could not be created.
    #[error("failed to create queue directory {dir}: {source}")]
    QueueDir {
        dir: PathBuf,
        source: std::io::Error,
    },
}

/// A pending record awaiting replay.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxRecord {
    /// Monotonically increasing insertion id. Strictly ordered, never reused.
    pub id: u64,
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
    /// Seconds since epoch at enqueue time.
    pub enqueue_time: f64,
}

/// Bounded durable FIFO of un-handed-off messages.
pub struct Outbox {
    conn: Mutex<Connection>,
    max_capacity: usize,
    evicted: AtomicU64,
}

impl Outbox {
    /// Opens (or creates) the outbox for `device_id` under `queue_dir`.
    ///
    /// The database file is `{queue_dir}/{device_id}_queue.db`.
    pub fn open(
        queue_dir: impl AsRef<Path>,
        device_id: &str,
        max_capacity: usize,
    ) -> Result<Self, OutboxError> {
        let dir = queue_dir.as_ref();
        std::fs::create_dir_all(dir).map_err(|source| OutboxError::QueueDir {
            dir: dir.to_path_buf(),
            source,
        })?;
        let path = dir.join(format!("{device_id}_queue.db"));
        let conn = Connection::open(path)?;
        Self::with_connection(conn, max_capacity)
    }

    /// Creates an in-memory outbox (for testing).
    pub fn in_memory(max_capacity: usize) -> Result<Self, OutboxError> {
        let conn = Connection::open_in_memory()?;
        Self::with_connection(conn, max_capacity)
    }

    fn with_connection(conn: Connection, max_capacity: usize) -> Result<Self, OutboxError> {
        assert!(max_capacity > 0, "outbox capacity must be non-zero");
        let outbox = Self {
            conn: Mutex::new(conn),
            max_capacity,
            evicted: AtomicU64::new(0),
        };
        outbox.init_schema()?;
        Ok(outbox)
    }

    fn init_schema(&self) -> Result<(), OutboxError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                topic TEXT NOT NULL,
                payload BLOB NOT NULL,
                qos INTEGER NOT NULL,
                timestamp REAL NOT NULL,
                created_at TEXT NOT NULL
            )",
            [],
        )?;
        Ok(())
    }

    /// Returns the configured capacity bound.
    pub fn max_capacity(&self) -> usize {
        self.max_capacity
    }

    /// Appends a record, evicting the oldest one first if at capacity.
    ///
    /// Returns the id assigned to the new record. The check-evict-insert
    /// sequence runs in a single transaction, so `size() <= max_capacity`
    /// holds at every commit point.
    pub fn append(&self, topic: &str, payload: &[u8], qos: u8) -> Result<u64, OutboxError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let count: i64 = tx.query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))?;
        if count as usize >= self.max_capacity {
            tx.execute(
                "DELETE FROM messages WHERE id = (SELECT MIN(id) FROM messages)",
                [],
            )?;
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64();
        tx.execute(
            "INSERT INTO messages (topic, payload, qos, timestamp, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![topic, payload, qos, now, Utc::now().to_rfc3339()],
        )?;
        let id = tx.last_insert_rowid() as u64;
        tx.commit()?;
        Ok(id)
    }

    /// Returns up to `n` oldest records in id order without removing them.
    pub fn peek_batch(&self, n: usize) -> Result<Vec<OutboxRecord>, OutboxError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, topic, payload, qos, timestamp FROM messages
             ORDER BY id ASC LIMIT ?1",
        )?;
        let records = stmt
            .query_map([n as i64], |row| {
                Ok(OutboxRecord {
                    id: row.get::<_, i64>(0)? as u64,
                    topic: row.get(1)?,
                    payload: row.get(2)?,
                    qos: row.get::<_, i64>(3)? as u8,
                    enqueue_time: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Removes every record with `id <= up_to_id`.
    ///
    /// Callers ack only after successful broker handoff; because replay is
    /// in id order, acking a prefix can never remove an un-handed-off record.
    pub fn ack(&self, up_to_id: u64) -> Result<usize, OutboxError> {
        let conn = self.conn.lock().unwrap();
        let removed = conn.execute(
            "DELETE FROM messages WHERE id <= ?1",
            [up_to_id as i64],
        )?;
        Ok(removed)
    }

    /// Current number of pending records.
    pub fn size(&self) -> Result<usize, OutboxError> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Removes all records.
    pub fn clear(&self) -> Result<(), OutboxError> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM messages", [])?;
        Ok(())
    }

    /// The id of the oldest pending record, if any.
    pub fn oldest_id(&self) -> Result<Option<u64>, OutboxError> {
        let conn = self.conn.lock().unwrap();
        let id: Option<i64> = conn
            .query_row("SELECT MIN(id) FROM messages", [], |row| row.get(0))
            .optional()?
            .flatten();
        Ok(id.map(|v| v as u64))
    }

    /// Number of records lost to drop-oldest eviction since open.
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}
