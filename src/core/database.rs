// SQLite catalog: datasets, signals, chunk records, rewrite journal
//
// Row tables for sparse signals live in the same database; see row_store.rs.

use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::debug;
use uuid::Uuid;

use crate::core::correction::TimeTransform;
use crate::core::error::{Result, StoreError};
use crate::core::format::{to_datetime, ChunkRecord, Dataset, NewSignal, Signal};
use crate::core::status::IngestionStatus;

const BUSY_TIMEOUT_MS: u64 = 5_000;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS datasets (
    id TEXT PRIMARY KEY,
    title TEXT NOT NULL,
    status TEXT NOT NULL,
    source TEXT
);
CREATE TABLE IF NOT EXISTS signals (
    id TEXT PRIMARY KEY,
    dataset_id TEXT NOT NULL REFERENCES datasets(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    type TEXT NOT NULL,
    unit TEXT,
    frequency REAL,
    raw_file TEXT,
    first_ts INTEGER,
    last_ts INTEGER,
    y_min REAL,
    y_max REAL,
    reference_ts INTEGER
);
CREATE INDEX IF NOT EXISTS idx_signals_dataset ON signals (dataset_id);
CREATE TABLE IF NOT EXISTS raw_files (
    dataset_id TEXT NOT NULL REFERENCES datasets(id) ON DELETE CASCADE,
    position INTEGER NOT NULL,
    path TEXT NOT NULL,
    PRIMARY KEY (dataset_id, position)
);
CREATE TABLE IF NOT EXISTS signal_chunks (
    id TEXT PRIMARY KEY,
    signal_id TEXT NOT NULL REFERENCES signals(id) ON DELETE CASCADE,
    path TEXT NOT NULL,
    first_ts INTEGER NOT NULL,
    last_ts INTEGER NOT NULL,
    rewritten INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_signal_chunks_range ON signal_chunks (signal_id, first_ts);
CREATE TABLE IF NOT EXISTS samples (
    signal_id TEXT NOT NULL REFERENCES signals(id) ON DELETE CASCADE,
    timestamp INTEGER NOT NULL,
    value REAL NOT NULL,
    PRIMARY KEY (signal_id, timestamp)
);
CREATE TABLE IF NOT EXISTS tags (
    signal_id TEXT NOT NULL REFERENCES signals(id) ON DELETE CASCADE,
    timestamp INTEGER NOT NULL,
    value TEXT NOT NULL,
    PRIMARY KEY (signal_id, timestamp)
);
CREATE TABLE IF NOT EXISTS chunk_rewrites (
    signal_id TEXT PRIMARY KEY REFERENCES signals(id) ON DELETE CASCADE,
    timeshift_us INTEGER NOT NULL,
    stretch REAL NOT NULL,
    reference_us INTEGER NOT NULL
);
";

const SIGNAL_COLUMNS: &str = "id, dataset_id, name, type, unit, frequency, raw_file, \
                              first_ts, last_ts, y_min, y_max, reference_ts";

/// Shared handle to the catalog database.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX;
        let conn = Connection::open_with_flags(path, flags)?;
        conn.execute_batch("PRAGMA journal_mode = wal;")?;
        conn.execute_batch("PRAGMA synchronous = normal;")?;
        debug!("Opened catalog database {}", path.display());
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.busy_timeout(std::time::Duration::from_millis(BUSY_TIMEOUT_MS))?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn ping(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
            Ok(())
        })
    }

    /// Runs `f` with exclusive access to the connection.
    pub(crate) fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut guard = self
            .conn
            .lock()
            .map_err(|_| StoreError::Io(std::io::Error::other("database mutex poisoned")))?;
        f(&mut guard)
    }

    // ---------------------------------------------------------------- datasets

    pub fn create_dataset(&self, title: &str, source: Option<&str>) -> Result<Dataset> {
        let dataset = Dataset {
            id: Uuid::new_v4(),
            title: title.to_string(),
            status: IngestionStatus::Queued,
            source: source.map(str::to_string),
        };
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO datasets (id, title, status, source) VALUES (?1, ?2, ?3, ?4)",
                params![
                    dataset.id.to_string(),
                    dataset.title,
                    dataset.status.code(),
                    dataset.source
                ],
            )?;
            Ok(())
        })?;
        Ok(dataset)
    }

    /// Creates a dataset together with its uploaded raw files in one
    /// transaction, so a job enqueued afterwards always sees both.
    pub fn create_upload(&self, title: &str, source: &str, files: &[PathBuf]) -> Result<Dataset> {
        let dataset = Dataset {
            id: Uuid::new_v4(),
            title: title.to_string(),
            status: IngestionStatus::Queued,
            source: Some(source.to_string()),
        };
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO datasets (id, title, status, source) VALUES (?1, ?2, ?3, ?4)",
                params![
                    dataset.id.to_string(),
                    dataset.title,
                    dataset.status.code(),
                    dataset.source
                ],
            )?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO raw_files (dataset_id, position, path) VALUES (?1, ?2, ?3)",
                )?;
                for (position, file) in files.iter().enumerate() {
                    stmt.execute(params![
                        dataset.id.to_string(),
                        position as i64,
                        file.to_string_lossy().into_owned()
                    ])?;
                }
            }
            tx.commit()?;
            Ok(())
        })?;
        Ok(dataset)
    }

    pub fn raw_files(&self, dataset_id: Uuid) -> Result<Vec<PathBuf>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT path FROM raw_files WHERE dataset_id = ?1 ORDER BY position",
            )?;
            let paths = stmt
                .query_map(params![dataset_id.to_string()], |row| row.get::<_, String>(0))?
                .map(|path| path.map(PathBuf::from))
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(paths)
        })
    }

    pub fn get_dataset(&self, id: Uuid) -> Result<Dataset> {
        let row = self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT title, status, source FROM datasets WHERE id = ?1",
                    params![id.to_string()],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, Option<String>>(2)?,
                        ))
                    },
                )
                .optional()?)
        })?;
        let (title, status, source) =
            row.ok_or_else(|| StoreError::DatasetNotFound(id.to_string()))?;
        Ok(Dataset {
            id,
            title,
            status: status.parse()?,
            source,
        })
    }

    pub fn list_datasets(&self) -> Result<Vec<Dataset>> {
        let rows = self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT id, title, status, source FROM datasets ORDER BY title, id")?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;
        rows.into_iter()
            .map(|(id, title, status, source)| {
                Ok(Dataset {
                    id: parse_uuid(&id)?,
                    title,
                    status: status.parse()?,
                    source,
                })
            })
            .collect()
    }

    /// Moves a dataset along the ingestion state machine.
    pub fn transition_dataset(&self, id: Uuid, next: IngestionStatus) -> Result<Dataset> {
        self.update_status(id, |current| current.transition(next))
    }

    /// Puts a dataset back to `Queued` ahead of a re-ingestion.
    pub fn reset_dataset(&self, id: Uuid) -> Result<Dataset> {
        self.update_status(id, |current| current.reset())
    }

    fn update_status(
        &self,
        id: Uuid,
        step: impl FnOnce(IngestionStatus) -> Result<IngestionStatus>,
    ) -> Result<Dataset> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let current: Option<String> = tx
                .query_row(
                    "SELECT status FROM datasets WHERE id = ?1",
                    params![id.to_string()],
                    |row| row.get(0),
                )
                .optional()?;
            let current: IngestionStatus = current
                .ok_or_else(|| StoreError::DatasetNotFound(id.to_string()))?
                .parse()?;
            let next = step(current)?;
            tx.execute(
                "UPDATE datasets SET status = ?1 WHERE id = ?2",
                params![next.code(), id.to_string()],
            )?;
            tx.commit()?;
            debug!("Dataset {} status {} -> {}", id, current, next);
            Ok(())
        })?;
        self.get_dataset(id)
    }

    // ---------------------------------------------------------------- signals

    pub fn create_signal(&self, dataset_id: Uuid, new: &NewSignal) -> Result<Signal> {
        let signal = Signal {
            id: Uuid::new_v4(),
            dataset_id,
            name: new.name.clone(),
            signal_type: new.signal_type,
            unit: new.unit.clone(),
            frequency: new.frequency,
            raw_file: new.raw_file.clone(),
            first_timestamp: None,
            last_timestamp: None,
            y_min: None,
            y_max: None,
            reference_time: None,
        };
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO signals (id, dataset_id, name, type, unit, frequency, raw_file) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    signal.id.to_string(),
                    dataset_id.to_string(),
                    signal.name,
                    signal.signal_type.code(),
                    signal.unit,
                    signal.frequency,
                    signal.raw_file
                ],
            )
            .map_err(|e| match e {
                rusqlite::Error::SqliteFailure(err, _)
                    if err.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    StoreError::DatasetNotFound(dataset_id.to_string())
                }
                other => other.into(),
            })?;
            Ok(())
        })?;
        Ok(signal)
    }

    pub fn get_signal(&self, id: Uuid) -> Result<Signal> {
        let row = self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {SIGNAL_COLUMNS} FROM signals WHERE id = ?1"),
                    params![id.to_string()],
                    SignalRow::from_row,
                )
                .optional()?)
        })?;
        row.ok_or_else(|| StoreError::SignalNotFound(id.to_string()))?
            .into_signal()
    }

    pub fn list_signals(&self, dataset_id: Uuid) -> Result<Vec<Signal>> {
        let rows = self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SIGNAL_COLUMNS} FROM signals WHERE dataset_id = ?1 ORDER BY name, id"
            ))?;
            let rows = stmt
                .query_map(params![dataset_id.to_string()], SignalRow::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;
        rows.into_iter().map(SignalRow::into_signal).collect()
    }

    /// Persists derived first/last timestamp and, when given, the value range.
    pub fn update_signal_bounds(
        &self,
        id: Uuid,
        bounds: Option<(i64, i64)>,
        value_range: Option<(f64, f64)>,
    ) -> Result<()> {
        let (first, last) = bounds.unzip();
        let changed = self.with_conn(|conn| {
            let changed = match value_range {
                Some((y_min, y_max)) => conn.execute(
                    "UPDATE signals SET first_ts = ?1, last_ts = ?2, y_min = ?3, y_max = ?4 \
                     WHERE id = ?5",
                    params![first, last, y_min, y_max, id.to_string()],
                )?,
                None => conn.execute(
                    "UPDATE signals SET first_ts = ?1, last_ts = ?2 WHERE id = ?3",
                    params![first, last, id.to_string()],
                )?,
            };
            Ok(changed)
        })?;
        if changed == 0 {
            return Err(StoreError::SignalNotFound(id.to_string()));
        }
        Ok(())
    }

    pub fn set_reference_time(&self, id: Uuid, reference_us: i64) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE signals SET reference_ts = ?1 WHERE id = ?2",
                params![reference_us, id.to_string()],
            )?;
            Ok(())
        })
    }

    /// Drops the signal record; its rows and chunk records cascade.
    pub(crate) fn delete_signal_record(&self, id: Uuid) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM signals WHERE id = ?1", params![id.to_string()])?;
            Ok(())
        })
    }

    // ---------------------------------------------------------------- chunks

    pub(crate) fn insert_chunks(&self, records: &[ChunkRecord]) -> Result<()> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO signal_chunks (id, signal_id, path, first_ts, last_ts) \
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                )?;
                for record in records {
                    stmt.execute(params![
                        record.id.to_string(),
                        record.signal_id.to_string(),
                        record.path,
                        record.first_timestamp,
                        record.last_timestamp
                    ])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
    }

    /// Chunks whose `[first, last]` intersects `[start, end]`, ascending.
    pub fn chunks_in_range(&self, signal_id: Uuid, start: i64, end: i64) -> Result<Vec<ChunkRecord>> {
        self.query_chunks(
            signal_id,
            "SELECT id, path, first_ts, last_ts FROM signal_chunks \
             WHERE signal_id = ?1 AND first_ts <= ?3 AND last_ts >= ?2 \
             ORDER BY first_ts, last_ts",
            params![signal_id.to_string(), start, end],
        )
    }

    fn query_chunks<P: rusqlite::Params>(
        &self,
        signal_id: Uuid,
        sql: &str,
        query_params: P,
    ) -> Result<Vec<ChunkRecord>> {
        let rows = self.with_conn(|conn| {
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt
                .query_map(query_params, |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;
        rows.into_iter()
            .map(|(id, path, first, last)| {
                Ok(ChunkRecord {
                    id: parse_uuid(&id)?,
                    signal_id,
                    path,
                    first_timestamp: first,
                    last_timestamp: last,
                })
            })
            .collect()
    }

    pub fn chunks(&self, signal_id: Uuid) -> Result<Vec<ChunkRecord>> {
        self.chunks_in_range(signal_id, i64::MIN, i64::MAX)
    }

    pub fn chunk_count(&self, signal_id: Uuid) -> Result<usize> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM signal_chunks WHERE signal_id = ?1",
                params![signal_id.to_string()],
                |row| row.get(0),
            )?;
            Ok(count as usize)
        })
    }

    /// Min of all chunk starts and max of all chunk ends.
    pub fn chunk_extent(&self, signal_id: Uuid) -> Result<Option<(i64, i64)>> {
        self.with_conn(|conn| {
            let extent: (Option<i64>, Option<i64>) = conn.query_row(
                "SELECT MIN(first_ts), MAX(last_ts) FROM signal_chunks WHERE signal_id = ?1",
                params![signal_id.to_string()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            Ok(match extent {
                (Some(first), Some(last)) => Some((first, last)),
                _ => None,
            })
        })
    }

    /// Stores a rewritten chunk's bounds and flags it done for the running rewrite.
    pub(crate) fn mark_chunk_rewritten(&self, chunk_id: Uuid, first: i64, last: i64) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE signal_chunks SET first_ts = ?1, last_ts = ?2, rewritten = 1 WHERE id = ?3",
                params![first, last, chunk_id.to_string()],
            )?;
            Ok(())
        })
    }

    /// Chunks not yet rewritten by the journaled rewrite, ascending.
    pub(crate) fn chunks_pending_rewrite(&self, signal_id: Uuid) -> Result<Vec<ChunkRecord>> {
        self.query_chunks(
            signal_id,
            "SELECT id, path, first_ts, last_ts FROM signal_chunks \
             WHERE signal_id = ?1 AND rewritten = 0 ORDER BY first_ts, last_ts, id",
            params![signal_id.to_string()],
        )
    }

    /// True when the signal has any chunk or row stored, in either tier.
    pub fn has_stored_data(&self, signal_id: Uuid) -> Result<bool> {
        self.with_conn(|conn| stored_data_exists(conn, signal_id))
    }

    pub(crate) fn delete_chunk_records(&self, signal_id: Uuid) -> Result<usize> {
        self.with_conn(|conn| {
            Ok(conn.execute(
                "DELETE FROM signal_chunks WHERE signal_id = ?1",
                params![signal_id.to_string()],
            )?)
        })
    }

    // ---------------------------------------------------------------- rewrite journal

    pub(crate) fn journal_rewrite(&self, signal_id: Uuid, transform: &TimeTransform) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO chunk_rewrites (signal_id, timeshift_us, stretch, reference_us) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    signal_id.to_string(),
                    transform.timeshift_us,
                    transform.stretch_factor,
                    transform.reference_us
                ],
            )
            .map_err(|e| match e {
                rusqlite::Error::SqliteFailure(err, _)
                    if err.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    StoreError::RewriteInProgress(signal_id.to_string())
                }
                other => other.into(),
            })?;
            Ok(())
        })
    }

    pub fn pending_rewrite(&self, signal_id: Uuid) -> Result<Option<TimeTransform>> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT timeshift_us, stretch, reference_us FROM chunk_rewrites \
                     WHERE signal_id = ?1",
                    params![signal_id.to_string()],
                    |row| {
                        Ok(TimeTransform {
                            timeshift_us: row.get(0)?,
                            stretch_factor: row.get(1)?,
                            reference_us: row.get(2)?,
                        })
                    },
                )
                .optional()?)
        })
    }

    /// Clears the journal and stores the recomputed signal bounds in one transaction.
    pub(crate) fn finish_rewrite(&self, signal_id: Uuid, bounds: Option<(i64, i64)>) -> Result<()> {
        let (first, last) = bounds.unzip();
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "UPDATE signals SET first_ts = ?1, last_ts = ?2 WHERE id = ?3",
                params![first, last, signal_id.to_string()],
            )?;
            tx.execute(
                "UPDATE signal_chunks SET rewritten = 0 WHERE signal_id = ?1",
                params![signal_id.to_string()],
            )?;
            tx.execute(
                "DELETE FROM chunk_rewrites WHERE signal_id = ?1",
                params![signal_id.to_string()],
            )?;
            tx.commit()?;
            Ok(())
        })
    }
}

pub(crate) fn stored_data_exists(conn: &Connection, signal_id: Uuid) -> Result<bool> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS (SELECT 1 FROM signal_chunks WHERE signal_id = ?1) \
             OR EXISTS (SELECT 1 FROM samples WHERE signal_id = ?1) \
             OR EXISTS (SELECT 1 FROM tags WHERE signal_id = ?1)",
        params![signal_id.to_string()],
        |row| row.get(0),
    )?;
    Ok(exists)
}

pub(crate) fn parse_uuid(value: &str) -> Result<Uuid> {
    Uuid::parse_str(value).map_err(|e| StoreError::Parse(format!("invalid id {value}: {e}")))
}

struct SignalRow {
    id: String,
    dataset_id: String,
    name: String,
    signal_type: String,
    unit: Option<String>,
    frequency: Option<f64>,
    raw_file: Option<String>,
    first_ts: Option<i64>,
    last_ts: Option<i64>,
    y_min: Option<f64>,
    y_max: Option<f64>,
    reference_ts: Option<i64>,
}

impl SignalRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            dataset_id: row.get(1)?,
            name: row.get(2)?,
            signal_type: row.get(3)?,
            unit: row.get(4)?,
            frequency: row.get(5)?,
            raw_file: row.get(6)?,
            first_ts: row.get(7)?,
            last_ts: row.get(8)?,
            y_min: row.get(9)?,
            y_max: row.get(10)?,
            reference_ts: row.get(11)?,
        })
    }

    fn into_signal(self) -> Result<Signal> {
        Ok(Signal {
            id: parse_uuid(&self.id)?,
            dataset_id: parse_uuid(&self.dataset_id)?,
            name: self.name,
            signal_type: self.signal_type.parse()?,
            unit: self.unit,
            frequency: self.frequency,
            raw_file: self.raw_file,
            first_timestamp: self.first_ts.and_then(to_datetime),
            last_timestamp: self.last_ts.and_then(to_datetime),
            y_min: self.y_min,
            y_max: self.y_max,
            reference_time: self.reference_ts.and_then(to_datetime),
        })
    }
}
