// Ingestion pipeline: source parsers, their registry and the status-gated
// store of parsed signals

use chrono::DateTime;
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::core::error::{Result, StoreError};
use crate::core::format::{NewSignal, NumericSeries, Signal, SignalData, SignalType};
use crate::core::status::IngestionStatus;
use crate::core::tier::Storage;

/// One series produced by a source parser.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedSignal {
    pub signal: NewSignal,
    pub data: SignalData,
}

/// Device-specific reader of raw upload files.
pub trait SourceParser: Send + Sync {
    /// Stable registry key.
    fn key(&self) -> &str;

    /// Cheap checks run before the files are accepted.
    fn validate_files(&self, files: &[PathBuf]) -> Result<()>;

    fn parse(&self, files: &[PathBuf]) -> Result<Vec<ParsedSignal>>;
}

/// Parsers by key, built once at start-up.
#[derive(Clone, Default)]
pub struct SourceRegistry {
    parsers: BTreeMap<String, Arc<dyn SourceParser>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every parser shipped with the crate.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.parsers.insert(CsvSource.key().to_string(), Arc::new(CsvSource));
        registry
    }

    pub fn register(&mut self, parser: Arc<dyn SourceParser>) -> Result<()> {
        let key = parser.key().to_string();
        if self.parsers.contains_key(&key) {
            return Err(StoreError::config(format!("source {key} is already registered")));
        }
        debug!("Registered source parser {}", key);
        self.parsers.insert(key, parser);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Result<Arc<dyn SourceParser>> {
        self.parsers
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::SourceNotFound(key.to_string()))
    }

    pub fn keys(&self) -> Vec<String> {
        self.parsers.keys().cloned().collect()
    }
}

/// Comma separated files: a header row, the timestamp in the first column
/// (RFC 3339 or epoch seconds) and one numeric signal per further column.
pub struct CsvSource;

impl CsvSource {
    fn parse_file(path: &Path) -> Result<Vec<(String, NumericSeries)>> {
        let text = fs::read_to_string(path)?;
        let mut lines = text.lines().enumerate().filter(|(_, l)| !l.trim().is_empty());

        let (_, header) = lines
            .next()
            .ok_or_else(|| StoreError::Parse(format!("{} is empty", path.display())))?;
        let names: Vec<String> = header.split(',').skip(1).map(|h| h.trim().to_string()).collect();
        if names.is_empty() {
            return Err(StoreError::Parse(format!(
                "{} has no value columns",
                path.display()
            )));
        }
        let mut columns: Vec<Vec<(i64, f64)>> = vec![Vec::new(); names.len()];

        for (number, line) in lines {
            let mut cells = line.split(',').map(str::trim);
            let stamp = cells.next().unwrap_or_default();
            let ts = parse_timestamp(stamp).ok_or_else(|| {
                StoreError::Parse(format!(
                    "{}:{}: invalid timestamp {stamp:?}",
                    path.display(),
                    number + 1
                ))
            })?;
            for (column, cell) in columns.iter_mut().zip(cells) {
                if cell.is_empty() {
                    continue;
                }
                let value: f64 = cell.parse().map_err(|_| {
                    StoreError::Parse(format!(
                        "{}:{}: invalid number {cell:?}",
                        path.display(),
                        number + 1
                    ))
                })?;
                column.push((ts, value));
            }
        }

        names
            .into_iter()
            .zip(columns)
            .map(|(name, mut pairs)| {
                pairs.sort_by_key(|(ts, _)| *ts);
                if let Some(w) = pairs.windows(2).find(|w| w[0].0 == w[1].0) {
                    return Err(StoreError::Parse(format!(
                        "{}: duplicate timestamp {} in column {name}",
                        path.display(),
                        w[0].0
                    )));
                }
                Ok((name, NumericSeries::from_pairs(pairs)))
            })
            .collect()
    }
}

impl SourceParser for CsvSource {
    fn key(&self) -> &str {
        "csv"
    }

    fn validate_files(&self, files: &[PathBuf]) -> Result<()> {
        if files.is_empty() {
            return Err(StoreError::config("no files given"));
        }
        for file in files {
            let is_csv = file
                .extension()
                .map(|ext| ext.eq_ignore_ascii_case("csv"))
                .unwrap_or(false);
            if !is_csv {
                return Err(StoreError::config(format!(
                    "{} is not a .csv file",
                    file.display()
                )));
            }
            if !file.is_file() {
                return Err(StoreError::config(format!("{} does not exist", file.display())));
            }
        }
        Ok(())
    }

    fn parse(&self, files: &[PathBuf]) -> Result<Vec<ParsedSignal>> {
        let mut taken = HashSet::new();
        let mut parsed = Vec::new();
        for file in files {
            let raw_file = file.file_name().map(|n| n.to_string_lossy().into_owned());
            for (base_name, series) in Self::parse_file(file)? {
                // names stay unique across files
                let mut name = base_name.clone();
                let mut i = 1;
                while taken.contains(&name) {
                    name = format!("{base_name}_{i}");
                    i += 1;
                }
                taken.insert(name.clone());

                let mut signal = NewSignal::new(name, SignalType::Other);
                signal.raw_file = raw_file.clone();
                parsed.push(ParsedSignal {
                    signal,
                    data: SignalData::Numeric(series),
                });
            }
        }
        Ok(parsed)
    }
}

fn parse_timestamp(value: &str) -> Option<i64> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Some(ts.timestamp_micros());
    }
    let secs: f64 = value.parse().ok()?;
    let micros = (secs * 1e6).round();
    (micros.is_finite() && micros.abs() < i64::MAX as f64).then_some(micros as i64)
}

/// Runs source parsers and stores their output, driving the dataset through
/// `Queued -> Processing -> Processed | Error`.
#[derive(Clone)]
pub struct Ingestor {
    storage: Arc<Storage>,
    registry: Arc<SourceRegistry>,
}

impl Ingestor {
    pub fn new(storage: Arc<Storage>, registry: Arc<SourceRegistry>) -> Self {
        Self { storage, registry }
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    /// Parses `files` and stores every non-empty series. The dataset becomes
    /// `Processed` only once all of them are stored; on failure the signals
    /// created by this run are removed and the dataset ends in `Error`.
    pub fn ingest(&self, dataset_id: Uuid, source: &str, files: &[PathBuf]) -> Result<Vec<Signal>> {
        let db = self.storage.database();
        db.transition_dataset(dataset_id, IngestionStatus::Processing)?;
        info!("Ingesting dataset {} with source {}", dataset_id, source);

        let mut created = Vec::new();
        match self.run(dataset_id, source, files, &mut created) {
            Ok(signals) => {
                db.transition_dataset(dataset_id, IngestionStatus::Processed)?;
                info!("Dataset {} processed: {} signals", dataset_id, signals.len());
                Ok(signals)
            }
            Err(e) => {
                error!("Ingestion of dataset {} failed: {}", dataset_id, e);
                for signal_id in created {
                    if let Err(cleanup) = self.storage.delete_signal(signal_id) {
                        warn!("Could not remove partial signal {}: {}", signal_id, cleanup);
                    }
                }
                db.transition_dataset(dataset_id, IngestionStatus::Error)?;
                Err(e)
            }
        }
    }

    fn run(
        &self,
        dataset_id: Uuid,
        source: &str,
        files: &[PathBuf],
        created: &mut Vec<Uuid>,
    ) -> Result<Vec<Signal>> {
        let parser = self.registry.get(source)?;
        parser.validate_files(files)?;
        let parsed = parser.parse(files)?;

        let db = self.storage.database();
        let mut stored = Vec::with_capacity(parsed.len());
        for ParsedSignal { signal, mut data } in parsed {
            if let SignalData::Numeric(series) = &mut data {
                series.drop_nan();
            }
            if data.is_empty() {
                debug!("Skipping empty series {}", signal.name);
                continue;
            }
            let record = db.create_signal(dataset_id, &signal)?;
            created.push(record.id);
            stored.push(self.storage.store(&record, &data)?);
        }
        Ok(stored)
    }

    /// Deletes every signal of the dataset, resets it to `Queued` and runs
    /// the dataset's source over its stored raw files again.
    pub fn reingest(&self, dataset_id: Uuid) -> Result<Vec<Signal>> {
        let db = self.storage.database();
        let dataset = db.get_dataset(dataset_id)?;
        dataset.status.reset()?;
        let source = dataset
            .source
            .ok_or_else(|| StoreError::SourceNotFound(format!("dataset {dataset_id} has no source")))?;

        let removed = self.storage.delete_dataset_signals(dataset_id)?;
        db.reset_dataset(dataset_id)?;
        info!("Re-ingesting dataset {} ({} signals removed)", dataset_id, removed);

        let files = db.raw_files(dataset_id)?;
        self.ingest(dataset_id, &source, &files)
    }

    /// Marks every dataset a killed run left in `Processing` as `Error` and
    /// drops its partially stored signals, so it can be re-ingested.
    /// Call before any job is enqueued.
    pub fn recover_interrupted(&self) -> Result<usize> {
        let db = self.storage.database();
        let mut recovered = 0;
        for dataset in db.list_datasets()? {
            if dataset.status != IngestionStatus::Processing {
                continue;
            }
            warn!("Dataset {} was left processing, marking it failed", dataset.id);
            db.transition_dataset(dataset.id, IngestionStatus::Error)?;
            let removed = self.storage.delete_dataset_signals(dataset.id)?;
            info!("Removed {} partial signals of dataset {}", removed, dataset.id);
            recovered += 1;
        }
        Ok(recovered)
    }
}
