//! Log-structured store: a durable, totally-ordered event log over SQLite.
//!
//! Two roles, split the way the engine consumes them:
//!
//! - [`SqliteWriter`] is the single exclusive appender. It owns the
//!   `order_id` counter and a write connection; the coordinator owns the
//!   writer, which enforces the single-writer discipline externally.
//! - [`SqliteReader`] serves shared reads over its own read-only
//!   connection: the full-log scan used by recovery and the
//!   partition-ordered reads used by query layers.
//!
//! The durable record shape is
//! `lss(order_id int64, partition_id text, type text, data json, metadata json)`
//! with unique indices on `order_id` and `(partition_id, order_id)`. On
//! first initialization of an empty store the writer seeds a bootstrap
//! record `(0, "system", "LSS.Initialized", {}, {})`.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rusqlite::{Connection, OpenFlags, params};
use serde_json::Value;

use crate::error::StorageError;
use crate::event::{BOOTSTRAP_EVENT, Event, EventDraft, MAX_TAG_LEN, SYSTEM_PARTITION};

/// Rows fetched per page by [`SqliteReader::physical_read`].
const PAGE_SIZE: usize = 256;

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS lss (
    order_id     INTEGER PRIMARY KEY,
    partition_id TEXT NOT NULL,
    type         TEXT NOT NULL,
    data         TEXT NOT NULL,
    metadata     TEXT NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS lss_partition_order
    ON lss(partition_id, order_id);
";

/// Exclusive append access to a log.
///
/// A trait rather than a concrete type so that the coordinator can be
/// exercised against injected failures without touching a real database.
pub trait LogWriter: Send {
    /// Atomically append a batch of drafts to the log.
    ///
    /// Assigns consecutive `order_id`s in the order supplied, stamps each
    /// draft's metadata with a single shared `appendTime` (epoch
    /// milliseconds), and persists the batch all-or-nothing.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] on any I/O or constraint failure. On
    /// failure nothing is persisted and the `order_id` counter does not
    /// advance.
    fn physical_append(&mut self, drafts: Vec<EventDraft>) -> Result<Vec<Event>, StorageError>;
}

/// Direction of a partition-ordered read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOrder {
    /// Oldest first (`order_id` ascending).
    Ascending,
    /// Newest first (`order_id` descending).
    Descending,
}

/// Raw row tuple before JSON decoding.
/// Fields: (order_id, partition_id, type, data, metadata).
type EventRowTuple = (i64, String, String, String, String);

/// Factory for the writer/reader pair of one SQLite-backed log.
pub struct SqliteStore;

impl SqliteStore {
    /// Open (or create) the store at `database_url` and return its
    /// writer/reader pair.
    ///
    /// Creates the schema if missing, seeds the bootstrap record into an
    /// empty store, and initializes the writer's `order_id` counter to
    /// one past the maximum persisted `order_id`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the database cannot be opened or the
    /// schema cannot be created.
    pub fn open(database_url: &str) -> Result<(SqliteWriter, SqliteReader), StorageError> {
        let path = PathBuf::from(database_url);
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(&path)?;
        conn.execute_batch(SCHEMA)?;

        let max: Option<i64> =
            conn.query_row("SELECT MAX(order_id) FROM lss", [], |row| row.get(0))?;
        let next_order_id = match max {
            Some(max) => max + 1,
            None => {
                conn.execute(
                    "INSERT INTO lss (order_id, partition_id, type, data, metadata)
                       VALUES (0, ?1, ?2, '{}', '{}')",
                    params![SYSTEM_PARTITION, BOOTSTRAP_EVENT],
                )?;
                tracing::info!(path = %path.display(), "seeded empty log with bootstrap record");
                1
            }
        };

        let reader = SqliteReader::open(&path)?;
        Ok((
            SqliteWriter {
                conn,
                next_order_id,
            },
            reader,
        ))
    }
}

/// The single exclusive appender of one log.
pub struct SqliteWriter {
    conn: Connection,
    next_order_id: i64,
}

impl SqliteWriter {
    /// The `order_id` the next appended event will receive.
    pub fn next_order_id(&self) -> i64 {
        self.next_order_id
    }
}

impl LogWriter for SqliteWriter {
    fn physical_append(&mut self, drafts: Vec<EventDraft>) -> Result<Vec<Event>, StorageError> {
        for draft in &drafts {
            if draft.partition_id.len() > MAX_TAG_LEN {
                return Err(StorageError::OversizedField {
                    field: "partitionId",
                    limit: MAX_TAG_LEN,
                });
            }
            if draft.event_type.len() > MAX_TAG_LEN {
                return Err(StorageError::OversizedField {
                    field: "type",
                    limit: MAX_TAG_LEN,
                });
            }
        }

        let append_time = chrono::Utc::now().timestamp_millis();
        let tx = self.conn.unchecked_transaction()?;
        let mut appended = Vec::with_capacity(drafts.len());
        let mut order_id = self.next_order_id;

        for draft in drafts {
            let mut metadata = draft.metadata;
            match &mut metadata {
                Value::Object(map) => {
                    map.insert("appendTime".to_string(), Value::from(append_time));
                }
                _ => metadata = serde_json::json!({ "appendTime": append_time }),
            }

            tx.execute(
                "INSERT INTO lss (order_id, partition_id, type, data, metadata)
                   VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    order_id,
                    &draft.partition_id,
                    &draft.event_type,
                    serde_json::to_string(&draft.data)?,
                    serde_json::to_string(&metadata)?,
                ],
            )?;

            appended.push(Event {
                order_id,
                partition_id: draft.partition_id,
                event_type: draft.event_type,
                data: draft.data,
                metadata,
            });
            order_id += 1;
        }

        tx.commit()?;
        // Only advance the counter once the batch is durable.
        self.next_order_id = order_id;

        tracing::debug!(count = appended.len(), "events appended");
        Ok(appended)
    }
}

/// Shared read access to one log.
///
/// Holds a read-only connection behind a mutex; reads may be issued from
/// any thread and observe a consistent snapshot through SQLite's own
/// isolation.
pub struct SqliteReader {
    conn: Mutex<Connection>,
}

impl SqliteReader {
    fn open(path: &Path) -> Result<Self, StorageError> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Scan the full log in ascending `order_id` order.
    ///
    /// The scan is finite and restartable: it pages through the table and
    /// stops at whatever the log held when the last page was fetched.
    /// Used by recovery.
    pub fn physical_read(&self) -> PhysicalScan<'_> {
        PhysicalScan {
            reader: self,
            cursor: -1,
            page: VecDeque::new(),
            done: false,
        }
    }

    /// Read one partition ordered by `order_id`, paginated.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the query fails or a persisted record
    /// cannot be decoded.
    pub fn logical_read(
        &self,
        partition_id: &str,
        order: ReadOrder,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Event>, StorageError> {
        let query = match order {
            ReadOrder::Ascending => {
                "SELECT order_id, partition_id, type, data, metadata FROM lss
                   WHERE partition_id = ?1 ORDER BY order_id ASC LIMIT ?2 OFFSET ?3"
            }
            ReadOrder::Descending => {
                "SELECT order_id, partition_id, type, data, metadata FROM lss
                   WHERE partition_id = ?1 ORDER BY order_id DESC LIMIT ?2 OFFSET ?3"
            }
        };

        let conn = self.lock();
        let mut stmt = conn.prepare_cached(query)?;
        let rows = stmt.query_map(params![partition_id, limit, offset], Self::map_row)?;

        let mut events = Vec::new();
        for row in rows {
            events.push(decode_row(row?)?);
        }
        Ok(events)
    }

    /// The oldest event of a partition.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::EmptyPartition`] when the partition holds
    /// no events.
    pub fn logical_read_first(&self, partition_id: &str) -> Result<Event, StorageError> {
        self.logical_read(partition_id, ReadOrder::Ascending, 1, 0)?
            .into_iter()
            .next()
            .ok_or_else(|| StorageError::EmptyPartition {
                partition_id: partition_id.to_string(),
            })
    }

    /// The newest event of a partition.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::EmptyPartition`] when the partition holds
    /// no events.
    pub fn logical_read_last(&self, partition_id: &str) -> Result<Event, StorageError> {
        self.logical_read(partition_id, ReadOrder::Descending, 1, 0)?
            .into_iter()
            .next()
            .ok_or_else(|| StorageError::EmptyPartition {
                partition_id: partition_id.to_string(),
            })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        // A poisoned lock means a reader panicked mid-query; the
        // connection itself is still usable for subsequent reads.
        self.conn
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn page_after(&self, cursor: i64) -> Result<Vec<Event>, StorageError> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT order_id, partition_id, type, data, metadata FROM lss
               WHERE order_id > ?1 ORDER BY order_id ASC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![cursor, PAGE_SIZE as i64], Self::map_row)?;

        let mut events = Vec::new();
        for row in rows {
            events.push(decode_row(row?)?);
        }
        Ok(events)
    }

    fn map_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<EventRowTuple> {
        Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
        ))
    }
}

fn decode_row(tuple: EventRowTuple) -> Result<Event, StorageError> {
    let (order_id, partition_id, event_type, data, metadata) = tuple;
    Ok(Event {
        order_id,
        partition_id,
        event_type,
        data: serde_json::from_str(&data)?,
        metadata: serde_json::from_str(&metadata)?,
    })
}

/// Paged iterator over the full log in ascending `order_id` order.
///
/// Yields `Result` items so a decode failure mid-scan surfaces to the
/// caller instead of silently truncating recovery.
pub struct PhysicalScan<'a> {
    reader: &'a SqliteReader,
    cursor: i64,
    page: VecDeque<Event>,
    done: bool,
}

impl Iterator for PhysicalScan<'_> {
    type Item = Result<Event, StorageError>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(event) = self.page.pop_front() {
            self.cursor = event.order_id;
            return Some(Ok(event));
        }
        if self.done {
            return None;
        }
        match self.reader.page_after(self.cursor) {
            Ok(events) => {
                if events.len() < PAGE_SIZE {
                    self.done = true;
                }
                self.page.extend(events);
                let event = self.page.pop_front()?;
                self.cursor = event.order_id;
                Some(Ok(event))
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
