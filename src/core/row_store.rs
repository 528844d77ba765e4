// Row store for sparse and event signals
//
// Numeric samples (RR/NN intervals) go to `samples`, text tags to `tags`.
// Both tables are keyed on (signal_id, timestamp).

use rusqlite::{params, Connection, ErrorCode, Transaction};
use tracing::{debug, info};
use uuid::Uuid;

use crate::core::correction::TimeTransform;
use crate::core::database::{stored_data_exists, Database};
use crate::core::error::{Result, StoreError};
use crate::core::format::{NumericSeries, Series, Signal, SignalData, SignalType, TagSeries};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowTable {
    Samples,
    Tags,
}

impl RowTable {
    pub fn for_type(signal_type: SignalType) -> Self {
        if signal_type.is_event() {
            RowTable::Tags
        } else {
            RowTable::Samples
        }
    }

    fn name(&self) -> &'static str {
        match self {
            RowTable::Samples => "samples",
            RowTable::Tags => "tags",
        }
    }
}

#[derive(Clone)]
pub struct RowStore {
    db: Database,
}

impl RowStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Inserts every sample in one transaction; nothing is stored on failure.
    pub fn create(&self, signal: &Signal, data: &SignalData) -> Result<usize> {
        let table = RowTable::for_type(signal.signal_type);
        match (table, data) {
            (RowTable::Samples, SignalData::Numeric(_)) | (RowTable::Tags, SignalData::Text(_)) => {}
            _ => {
                return Err(StoreError::config(format!(
                    "{} signal {} cannot store this kind of values",
                    signal.signal_type, signal.name
                )))
            }
        }

        let count = self.db.with_conn(|conn| {
            let tx = conn.transaction()?;
            if stored_data_exists(&tx, signal.id)? {
                return Err(StoreError::NonEmptySignal(signal.id.to_string()));
            }
            let count = match data {
                SignalData::Numeric(series) => insert_rows(&tx, table, signal.id, series)?,
                SignalData::Text(series) => insert_rows(&tx, table, signal.id, series)?,
            };
            tx.commit()?;
            Ok(count)
        })?;
        info!(
            "Stored signal {} ({}) as {} rows in {}",
            signal.name,
            signal.id,
            count,
            table.name()
        );
        Ok(count)
    }

    /// Rows with `start <= timestamp <= end`, ordered by timestamp.
    pub fn read_range(&self, signal: &Signal, start: i64, end: i64) -> Result<SignalData> {
        let table = RowTable::for_type(signal.signal_type);
        let sql = format!(
            "SELECT timestamp, value FROM {} WHERE signal_id = ?1 \
             AND timestamp >= ?2 AND timestamp <= ?3 ORDER BY timestamp",
            table.name()
        );
        debug!("Row query {} for signal {}", table.name(), signal.id);
        let id = signal.id.to_string();
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let data = match table {
                RowTable::Samples => {
                    let mut series = NumericSeries::new();
                    let mut rows = stmt.query(params![id, start, end])?;
                    while let Some(row) = rows.next()? {
                        series.push(row.get(0)?, row.get(1)?);
                    }
                    SignalData::Numeric(series)
                }
                RowTable::Tags => {
                    let mut series = TagSeries::new();
                    let mut rows = stmt.query(params![id, start, end])?;
                    while let Some(row) = rows.next()? {
                        series.push(row.get(0)?, row.get(1)?);
                    }
                    SignalData::Text(series)
                }
            };
            Ok(data)
        })
    }

    /// Moves every row of the signal through `transform` in one transaction
    /// and returns the re-queried bounds.
    ///
    /// SQLite checks the primary key row by row during an UPDATE, so a plain
    /// in-place shift can collide with rows not yet moved. Rows are staged
    /// through a temp table instead; the statement set is still set-based.
    pub fn rewrite(&self, signal: &Signal, transform: &TimeTransform) -> Result<Option<(i64, i64)>> {
        let table = RowTable::for_type(signal.signal_type).name();
        let id = signal.id.to_string();
        let bounds = self.db.with_conn(|conn| {
            let tx = conn.transaction()?;
            tx.execute_batch(
                "CREATE TEMP TABLE IF NOT EXISTS rewrite_buffer (timestamp INTEGER NOT NULL, value);
                 DELETE FROM temp.rewrite_buffer;",
            )?;
            tx.execute(
                &format!(
                    "INSERT INTO temp.rewrite_buffer (timestamp, value) \
                     SELECT CAST(ROUND((timestamp - ?2) * ?3) AS INTEGER) + ?2 + ?4, value \
                     FROM {table} WHERE signal_id = ?1"
                ),
                params![
                    id,
                    transform.reference_us,
                    transform.stretch_factor,
                    transform.timeshift_us
                ],
            )?;
            tx.execute(&format!("DELETE FROM {table} WHERE signal_id = ?1"), params![id])?;
            tx.execute(
                &format!(
                    "INSERT INTO {table} (signal_id, timestamp, value) \
                     SELECT ?1, timestamp, value FROM temp.rewrite_buffer"
                ),
                params![id],
            )
            .map_err(|e| map_collision(e, signal))?;
            tx.execute("DELETE FROM temp.rewrite_buffer", [])?;

            let bounds = row_extent(&tx, table, &id)?;
            let (first, last) = bounds.unzip();
            tx.execute(
                "UPDATE signals SET first_ts = ?1, last_ts = ?2 WHERE id = ?3",
                params![first, last, id],
            )?;
            tx.commit()?;
            Ok(bounds)
        })?;
        debug!("Rewrote rows of signal {} -> {:?}", signal.id, bounds);
        Ok(bounds)
    }

    pub fn delete(&self, signal: &Signal) -> Result<usize> {
        let table = RowTable::for_type(signal.signal_type).name();
        self.db.with_conn(|conn| {
            Ok(conn.execute(
                &format!("DELETE FROM {table} WHERE signal_id = ?1"),
                params![signal.id.to_string()],
            )?)
        })
    }

    pub fn extent(&self, signal: &Signal) -> Result<Option<(i64, i64)>> {
        let table = RowTable::for_type(signal.signal_type).name();
        let id = signal.id.to_string();
        self.db.with_conn(|conn| row_extent(conn, table, &id))
    }
}

fn insert_rows<V: rusqlite::ToSql>(
    tx: &Transaction<'_>,
    table: RowTable,
    signal_id: Uuid,
    series: &Series<V>,
) -> Result<usize> {
    let mut stmt = tx.prepare(&format!(
        "INSERT INTO {} (signal_id, timestamp, value) VALUES (?1, ?2, ?3)",
        table.name()
    ))?;
    let id = signal_id.to_string();
    for (ts, value) in series.iter() {
        stmt.execute(params![id, ts, value]).map_err(|e| match e {
            rusqlite::Error::SqliteFailure(err, _) if err.code == ErrorCode::ConstraintViolation => {
                StoreError::config(format!("duplicate timestamp {ts} in signal {signal_id}"))
            }
            other => other.into(),
        })?;
    }
    Ok(series.len())
}

fn row_extent(conn: &Connection, table: &str, signal_id: &str) -> Result<Option<(i64, i64)>> {
    let extent: (Option<i64>, Option<i64>) = conn.query_row(
        &format!("SELECT MIN(timestamp), MAX(timestamp) FROM {table} WHERE signal_id = ?1"),
        params![signal_id],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    Ok(match extent {
        (Some(first), Some(last)) => Some((first, last)),
        _ => None,
    })
}

fn map_collision(e: rusqlite::Error, signal: &Signal) -> StoreError {
    match e {
        rusqlite::Error::SqliteFailure(err, _) if err.code == ErrorCode::ConstraintViolation => {
            StoreError::config(format!(
                "correction maps two samples of signal {} onto the same instant",
                signal.id
            ))
        }
        other => other.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::format::NewSignal;

    const SEC: i64 = 1_000_000;

    fn setup(signal_type: SignalType) -> (RowStore, Signal) {
        let db = Database::open_in_memory().unwrap();
        let dataset = db.create_dataset("d", None).unwrap();
        let signal = db
            .create_signal(dataset.id, &NewSignal::new("rr", signal_type))
            .unwrap();
        (RowStore::new(db), signal)
    }

    fn intervals(n: i64) -> SignalData {
        SignalData::Numeric(NumericSeries::from_pairs(
            (0..n).map(|i| (i * SEC, 800.0 + i as f64)),
        ))
    }

    #[test]
    fn test_round_trip_and_range() {
        let (store, signal) = setup(SignalType::RrInterval);
        let data = intervals(10);
        assert_eq!(store.create(&signal, &data).unwrap(), 10);
        assert_eq!(store.read_range(&signal, i64::MIN, i64::MAX).unwrap(), data);

        let SignalData::Numeric(part) = store.read_range(&signal, 2 * SEC, 4 * SEC).unwrap() else {
            panic!("expected numeric rows");
        };
        assert_eq!(part.timestamps, vec![2 * SEC, 3 * SEC, 4 * SEC]);
    }

    #[test]
    fn test_tags() {
        let (store, signal) = setup(SignalType::Tags);
        let data = SignalData::Text(TagSeries::from_pairs(vec![
            (5 * SEC, "start".to_string()),
            (9 * SEC, "stop".to_string()),
        ]));
        store.create(&signal, &data).unwrap();
        assert_eq!(store.read_range(&signal, i64::MIN, i64::MAX).unwrap(), data);
        assert!(store.create(&signal, &data).is_err());

        let wrong = intervals(2);
        let (store, signal) = setup(SignalType::Tags);
        assert!(matches!(
            store.create(&signal, &wrong),
            Err(StoreError::Configuration(_))
        ));
    }

    #[test]
    fn test_write_once() {
        let (store, signal) = setup(SignalType::NnInterval);
        store.create(&signal, &intervals(3)).unwrap();
        let err = store.create(&signal, &intervals(5)).unwrap_err();
        assert!(matches!(err, StoreError::NonEmptySignal(_)));
        assert_eq!(store.read_range(&signal, i64::MIN, i64::MAX).unwrap().len(), 3);
    }

    #[test]
    fn test_duplicate_timestamp_rolls_back() {
        let (store, signal) = setup(SignalType::RrInterval);
        let data = SignalData::Numeric(NumericSeries::from_pairs(vec![(0, 1.0), (SEC, 2.0), (SEC, 3.0)]));
        assert!(store.create(&signal, &data).is_err());
        assert!(store.read_range(&signal, i64::MIN, i64::MAX).unwrap().is_empty());
    }

    #[test]
    fn test_rewrite_shift_into_occupied_instants() {
        let (store, signal) = setup(SignalType::RrInterval);
        store.create(&signal, &intervals(5)).unwrap();
        // every row lands on an instant still held by another row
        let transform = TimeTransform::new(SEC, 1.0, 0).unwrap();
        let bounds = store.rewrite(&signal, &transform).unwrap();
        assert_eq!(bounds, Some((SEC, 5 * SEC)));

        let SignalData::Numeric(back) = store.read_range(&signal, i64::MIN, i64::MAX).unwrap() else {
            panic!("expected numeric rows");
        };
        assert_eq!(back.timestamps, vec![SEC, 2 * SEC, 3 * SEC, 4 * SEC, 5 * SEC]);
        assert_eq!(back.values, vec![800.0, 801.0, 802.0, 803.0, 804.0]);
    }

    #[test]
    fn test_rewrite_concrete_stretch() {
        let (store, signal) = setup(SignalType::RrInterval);
        let data = SignalData::Numeric(NumericSeries::from_pairs(vec![
            (0, 1.0),
            (SEC, 2.0),
            (2 * SEC, 3.0),
        ]));
        store.create(&signal, &data).unwrap();
        let transform = TimeTransform::new(10 * SEC, 2.0, SEC).unwrap();
        assert_eq!(store.rewrite(&signal, &transform).unwrap(), Some((9 * SEC, 13 * SEC)));
        assert_eq!(store.extent(&signal).unwrap(), Some((9 * SEC, 13 * SEC)));
    }

    #[test]
    fn test_rewrite_collision_is_atomic() {
        let (store, signal) = setup(SignalType::RrInterval);
        store.create(&signal, &intervals(4)).unwrap();
        // squeezes all rows into the same microsecond
        let transform = TimeTransform::new(0, 1e-9, 0).unwrap();
        assert!(store.rewrite(&signal, &transform).is_err());
        assert_eq!(store.read_range(&signal, i64::MIN, i64::MAX).unwrap(), intervals(4));
    }

    #[test]
    fn test_delete() {
        let (store, signal) = setup(SignalType::RrInterval);
        store.create(&signal, &intervals(4)).unwrap();
        assert_eq!(store.delete(&signal).unwrap(), 4);
        assert!(store.extent(&signal).unwrap().is_none());
        store.create(&signal, &intervals(2)).unwrap();
    }
}
