// Storage tier selection
//
// Dense signals live in chunk files, sparse and event signals in rows.
// The tier is a pure function of the signal type.

use std::fs;
use tracing::{debug, info};
use uuid::Uuid;

use crate::core::chunk_store::ChunkedFileStore;
use crate::core::config::StoreConfig;
use crate::core::correction::TimeTransform;
use crate::core::database::Database;
use crate::core::error::{Result, StoreError};
use crate::core::format::{Signal, SignalData, SignalType};
use crate::core::row_store::RowStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageTier {
    Dense,
    Sparse,
}

impl StorageTier {
    pub fn for_type(signal_type: SignalType) -> Self {
        match signal_type {
            SignalType::RrInterval | SignalType::NnInterval | SignalType::Tags => StorageTier::Sparse,
            SignalType::Ecg | SignalType::Ppg | SignalType::Other => StorageTier::Dense,
        }
    }
}

/// Read/write contract shared by both tiers.
pub trait SeriesStore {
    /// Write-once: fails with `NonEmptySignal` if anything is stored already.
    fn create(&self, signal: &Signal, data: &SignalData) -> Result<usize>;

    /// Samples with `start <= ts <= end`, ascending and unique.
    fn read_range(&self, signal: &Signal, start: i64, end: i64) -> Result<SignalData>;

    /// Applies `transform` to every stored timestamp; returns the new bounds.
    fn rewrite(&self, signal: &Signal, transform: &TimeTransform) -> Result<Option<(i64, i64)>>;

    fn delete(&self, signal: &Signal) -> Result<usize>;
}

impl SeriesStore for ChunkedFileStore {
    fn create(&self, signal: &Signal, data: &SignalData) -> Result<usize> {
        match data {
            SignalData::Numeric(series) => ChunkedFileStore::create(self, signal, series),
            SignalData::Text(_) => Err(StoreError::config(format!(
                "{} signal {} only stores numeric values",
                signal.signal_type, signal.name
            ))),
        }
    }

    fn read_range(&self, signal: &Signal, start: i64, end: i64) -> Result<SignalData> {
        ChunkedFileStore::read_range(self, signal.id, start, end).map(SignalData::Numeric)
    }

    fn rewrite(&self, signal: &Signal, transform: &TimeTransform) -> Result<Option<(i64, i64)>> {
        ChunkedFileStore::rewrite(self, signal.id, transform)
    }

    fn delete(&self, signal: &Signal) -> Result<usize> {
        ChunkedFileStore::delete(self, signal.id)
    }
}

impl SeriesStore for RowStore {
    fn create(&self, signal: &Signal, data: &SignalData) -> Result<usize> {
        RowStore::create(self, signal, data)
    }

    fn read_range(&self, signal: &Signal, start: i64, end: i64) -> Result<SignalData> {
        RowStore::read_range(self, signal, start, end)
    }

    fn rewrite(&self, signal: &Signal, transform: &TimeTransform) -> Result<Option<(i64, i64)>> {
        RowStore::rewrite(self, signal, transform)
    }

    fn delete(&self, signal: &Signal) -> Result<usize> {
        RowStore::delete(self, signal)
    }
}

/// Entry point to both tiers and the catalog.
pub struct Storage {
    db: Database,
    dense: ChunkedFileStore,
    sparse: RowStore,
    config: StoreConfig,
}

impl Storage {
    /// Opens the catalog at `config.database_path` and the chunk root.
    pub fn open(config: &StoreConfig) -> Result<Self> {
        config.validate()?;
        let db = Database::open(&config.database_path)?;
        Self::new(db, config)
    }

    pub fn new(db: Database, config: &StoreConfig) -> Result<Self> {
        config.validate()?;
        fs::create_dir_all(&config.data_root)?;
        info!(
            "Storage ready: chunks under {}, span {}s, {:?} compression",
            config.data_root.display(),
            config.chunk_span_secs,
            config.compression
        );
        Ok(Self {
            dense: ChunkedFileStore::new(db.clone(), config)?,
            sparse: RowStore::new(db.clone()),
            db,
            config: config.clone(),
        })
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn tier(&self, signal: &Signal) -> StorageTier {
        StorageTier::for_type(signal.signal_type)
    }

    pub(crate) fn backend(&self, signal: &Signal) -> &dyn SeriesStore {
        match self.tier(signal) {
            StorageTier::Dense => &self.dense,
            StorageTier::Sparse => &self.sparse,
        }
    }

    pub(crate) fn chunk_store(&self) -> &ChunkedFileStore {
        &self.dense
    }

    /// Writes the signal's data through its tier and records first/last
    /// timestamp and the value range. Returns the refreshed signal.
    pub fn store(&self, signal: &Signal, data: &SignalData) -> Result<Signal> {
        let count = self.backend(signal).create(signal, data)?;
        let timestamps = data.timestamps();
        let bounds = timestamps
            .iter()
            .min()
            .zip(timestamps.iter().max())
            .map(|(first, last)| (*first, *last));
        self.db
            .update_signal_bounds(signal.id, bounds, data.value_range())?;
        debug!(
            "Signal {} stored {} samples in the {:?} tier",
            signal.id,
            count,
            self.tier(signal)
        );
        self.db.get_signal(signal.id)
    }

    /// Deletes the signal's stored data and then the signal itself.
    pub fn delete_signal(&self, signal_id: Uuid) -> Result<()> {
        let signal = self.db.get_signal(signal_id)?;
        let removed = self.backend(&signal).delete(&signal)?;
        self.db.delete_signal_record(signal_id)?;
        info!("Deleted signal {} ({} stored units)", signal.name, removed);
        Ok(())
    }

    pub fn delete_dataset_signals(&self, dataset_id: Uuid) -> Result<usize> {
        let signals = self.db.list_signals(dataset_id)?;
        for signal in &signals {
            self.delete_signal(signal.id)?;
        }
        Ok(signals.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::format::{NewSignal, NumericSeries, TagSeries};
    use tempfile::TempDir;

    fn setup() -> (TempDir, Storage, Uuid) {
        let dir = TempDir::new().unwrap();
        let config = StoreConfig {
            data_root: dir.path().join("chunks"),
            database_path: dir.path().join("catalog.sqlite3"),
            chunk_span_secs: 10,
            ..StoreConfig::default()
        };
        let storage = Storage::open(&config).unwrap();
        let dataset = storage.database().create_dataset("d", None).unwrap();
        (dir, storage, dataset.id)
    }

    #[test]
    fn test_routing_by_type() {
        assert_eq!(StorageTier::for_type(SignalType::Ecg), StorageTier::Dense);
        assert_eq!(StorageTier::for_type(SignalType::Ppg), StorageTier::Dense);
        assert_eq!(StorageTier::for_type(SignalType::Other), StorageTier::Dense);
        assert_eq!(StorageTier::for_type(SignalType::RrInterval), StorageTier::Sparse);
        assert_eq!(StorageTier::for_type(SignalType::NnInterval), StorageTier::Sparse);
        assert_eq!(StorageTier::for_type(SignalType::Tags), StorageTier::Sparse);
    }

    #[test]
    fn test_store_updates_metadata() {
        let (_dir, storage, dataset_id) = setup();
        let db = storage.database();
        let ecg = db
            .create_signal(dataset_id, &NewSignal::new("ecg", SignalType::Ecg))
            .unwrap();
        let data = SignalData::Numeric(NumericSeries::from_pairs(
            (0..50).map(|i| (i * 1_000_000, (i as f64 - 10.0) / 4.0)),
        ));
        let stored = storage.store(&ecg, &data).unwrap();
        assert_eq!(stored.first_micros(), Some(0));
        assert_eq!(stored.last_micros(), Some(49_000_000));
        assert_eq!(stored.y_min, Some(-2.5));
        assert_eq!(stored.y_max, Some(9.75));
        assert_eq!(db.chunk_count(ecg.id).unwrap(), 5);

        let err = storage.store(&ecg, &data).unwrap_err();
        assert!(matches!(err, StoreError::NonEmptySignal(_)));
    }

    #[test]
    fn test_write_once_across_tiers() {
        let (_dir, storage, dataset_id) = setup();
        let db = storage.database();
        let rr = db
            .create_signal(dataset_id, &NewSignal::new("rr", SignalType::RrInterval))
            .unwrap();
        let data = SignalData::Numeric(NumericSeries::from_pairs(vec![(0, 812.0), (812_000, 790.0)]));
        storage.store(&rr, &data).unwrap();
        assert_eq!(db.chunk_count(rr.id).unwrap(), 0);
        assert!(db.has_stored_data(rr.id).unwrap());
        // the dense store must refuse too, even though it holds no chunks
        assert!(matches!(
            storage.chunk_store().create(&rr, &NumericSeries::from_pairs(vec![(5, 1.0)])),
            Err(StoreError::NonEmptySignal(_))
        ));
    }

    #[test]
    fn test_tags_stay_text() {
        let (_dir, storage, dataset_id) = setup();
        let tags = storage
            .database()
            .create_signal(dataset_id, &NewSignal::new("events", SignalType::Tags))
            .unwrap();
        let data = SignalData::Text(TagSeries::from_pairs(vec![(1, "on".to_string())]));
        let stored = storage.store(&tags, &data).unwrap();
        assert!(stored.y_min.is_none());
        assert_eq!(stored.first_micros(), Some(1));

        let ecg = storage
            .database()
            .create_signal(dataset_id, &NewSignal::new("ecg", SignalType::Ecg))
            .unwrap();
        assert!(matches!(
            storage.store(&ecg, &data),
            Err(StoreError::Configuration(_))
        ));
    }

    #[test]
    fn test_delete_dataset_signals() {
        let (_dir, storage, dataset_id) = setup();
        let db = storage.database();
        let ecg = db
            .create_signal(dataset_id, &NewSignal::new("ecg", SignalType::Ecg))
            .unwrap();
        let rr = db
            .create_signal(dataset_id, &NewSignal::new("rr", SignalType::RrInterval))
            .unwrap();
        let dense = SignalData::Numeric(NumericSeries::from_pairs((0..30).map(|i| (i * 1_000_000, 1.0))));
        storage.store(&ecg, &dense).unwrap();
        storage.store(&rr, &dense).unwrap();

        assert_eq!(storage.delete_dataset_signals(dataset_id).unwrap(), 2);
        assert!(db.list_signals(dataset_id).unwrap().is_empty());
        assert!(!db.has_stored_data(ecg.id).unwrap());
        assert!(!db.has_stored_data(rr.id).unwrap());
        assert!(matches!(
            storage.delete_signal(ecg.id),
            Err(StoreError::SignalNotFound(_))
        ));
    }
}
