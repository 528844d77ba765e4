// Chunked file store for dense signals
//
// Each signal owns a directory of chunk files, one per non-empty
// `chunk_span` window. Chunk records (path + bounds) live in the catalog.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::core::codec;
use crate::core::config::StoreConfig;
use crate::core::constants::*;
use crate::core::correction::TimeTransform;
use crate::core::database::Database;
use crate::core::error::{Result, StoreError};
use crate::core::format::{ChunkRecord, NumericSeries, Signal};

pub struct ChunkedFileStore {
    root: PathBuf,
    db: Database,
    chunk_span_us: i64,
    compression: CompressionType,
    cleanup_depth: usize,
}

impl ChunkedFileStore {
    pub fn new(db: Database, config: &StoreConfig) -> Result<Self> {
        if config.chunk_span_secs == 0 {
            return Err(StoreError::config("chunk_span_secs must be positive"));
        }
        let chunk_span_us = i64::try_from(config.chunk_span_secs)
            .ok()
            .and_then(|secs| secs.checked_mul(MICROS_PER_SECOND))
            .ok_or_else(|| StoreError::config("chunk_span_secs is too large"))?;
        Ok(Self {
            root: config.data_root.clone(),
            db,
            chunk_span_us,
            compression: config.compression,
            cleanup_depth: config.cleanup_depth,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Splits `series` into whole-second aligned, half-open `chunk_span`
    /// windows and writes one chunk per non-empty window.
    ///
    /// Chunk records become visible only after every file is on disk.
    pub fn create(&self, signal: &Signal, series: &NumericSeries) -> Result<usize> {
        if self.db.has_stored_data(signal.id)? {
            return Err(StoreError::NonEmptySignal(signal.id.to_string()));
        }
        if !series.is_sorted_strict() {
            return Err(StoreError::config(
                "series timestamps must be strictly ascending",
            ));
        }
        let Some(first) = series.first_timestamp() else {
            return Ok(0);
        };

        let origin = first.div_euclid(MICROS_PER_SECOND) * MICROS_PER_SECOND;
        let mut records = Vec::new();
        let mut start = 0;
        while start < series.len() {
            let window = (series.timestamps[start] - origin) / self.chunk_span_us;
            let window_end = origin + (window + 1) * self.chunk_span_us;
            let end = start + series.timestamps[start..].partition_point(|ts| *ts < window_end);

            let part = NumericSeries {
                timestamps: series.timestamps[start..end].to_vec(),
                values: series.values[start..end].to_vec(),
            };
            match self.write_new_chunk(signal, &part) {
                Ok(record) => records.push(record),
                Err(e) => {
                    self.discard_files(&records);
                    return Err(e);
                }
            }
            start = end;
        }

        if let Err(e) = self.db.insert_chunks(&records) {
            self.discard_files(&records);
            return Err(e);
        }
        info!(
            "Stored signal {} ({}) in {} chunk files",
            signal.name,
            signal.id,
            records.len()
        );
        Ok(records.len())
    }

    fn write_new_chunk(&self, signal: &Signal, part: &NumericSeries) -> Result<ChunkRecord> {
        let id = Uuid::new_v4();
        let path = chunk_path(signal, id);
        let bytes = codec::encode(part, self.compression)?;
        write_atomic(&self.root.join(&path), &bytes)?;
        Ok(ChunkRecord {
            id,
            signal_id: signal.id,
            path,
            first_timestamp: part.first_timestamp().unwrap_or_default(),
            last_timestamp: part.last_timestamp().unwrap_or_default(),
        })
    }

    fn discard_files(&self, records: &[ChunkRecord]) {
        for record in records {
            if let Err(e) = fs::remove_file(self.root.join(&record.path)) {
                warn!("Could not discard chunk {}: {}", record.path, e);
            }
        }
    }

    /// Samples with `start <= ts <= end`, ascending, without duplicates.
    pub fn read_range(&self, signal_id: Uuid, start: i64, end: i64) -> Result<NumericSeries> {
        let mut result = NumericSeries::new();
        for chunk in self.db.chunks_in_range(signal_id, start, end)? {
            debug!("Reading chunk {} of signal {}", chunk.path, signal_id);
            let mut data = self.read_chunk(&chunk)?;
            if chunk.first_timestamp < start || chunk.last_timestamp > end {
                debug!("Truncating chunk {} to [{}, {}]", chunk.path, start, end);
                data = data.truncate_to(start, end);
            }
            result.extend(data);
        }
        Ok(sort_by_time(result))
    }

    fn read_chunk(&self, chunk: &ChunkRecord) -> Result<NumericSeries> {
        let bytes = fs::read(self.root.join(&chunk.path)).map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                StoreError::format(format!("chunk file {} is missing", chunk.path))
            } else {
                e.into()
            }
        })?;
        codec::decode(&bytes)
            .map_err(|e| StoreError::format(format!("chunk {}: {}", chunk.path, e)))
    }

    /// Applies `transform` to every stored timestamp, chunk by chunk in
    /// ascending order, and returns the signal's new bounds.
    ///
    /// Fails with a configuration error, before any file is touched, when
    /// the transform would map two samples onto the same instant.
    pub fn rewrite(&self, signal_id: Uuid, transform: &TimeTransform) -> Result<Option<(i64, i64)>> {
        if self.db.pending_rewrite(signal_id)?.is_some() {
            return Err(StoreError::RewriteInProgress(signal_id.to_string()));
        }
        self.check_rewrite(signal_id, transform)?;
        self.db.journal_rewrite(signal_id, transform)?;
        self.run_rewrite(signal_id, transform)
    }

    // Transformed timestamps must stay strictly ascending, within each
    // chunk and across chunk boundaries.
    fn check_rewrite(&self, signal_id: Uuid, transform: &TimeTransform) -> Result<()> {
        let mut previous: Option<i64> = None;
        for chunk in self.db.chunks(signal_id)? {
            let data = self.read_chunk(&chunk)?;
            for (ts, _) in data.iter() {
                let moved = transform.apply(ts);
                if previous.is_some_and(|p| moved <= p) {
                    return Err(collision(signal_id));
                }
                previous = Some(moved);
            }
        }
        Ok(())
    }

    /// Finishes a rewrite interrupted by a crash. Returns `None` when no
    /// rewrite is journaled for the signal.
    pub fn resume_rewrite(&self, signal_id: Uuid) -> Result<Option<Option<(i64, i64)>>> {
        match self.db.pending_rewrite(signal_id)? {
            Some(transform) => {
                info!("Resuming journaled rewrite of signal {}", signal_id);
                self.run_rewrite(signal_id, &transform).map(Some)
            }
            None => Ok(None),
        }
    }

    fn run_rewrite(&self, signal_id: Uuid, transform: &TimeTransform) -> Result<Option<(i64, i64)>> {
        let pending = self.db.chunks_pending_rewrite(signal_id)?;
        debug!("Rewriting {} chunks of signal {}", pending.len(), signal_id);

        for chunk in pending {
            let path = self.root.join(&chunk.path);
            let bytes = fs::read(&path)?;
            let header = codec::read_header(&bytes)?;
            let expected = (
                transform.apply(chunk.first_timestamp),
                transform.apply(chunk.last_timestamp),
            );
            let on_disk = (header.first_timestamp, header.last_timestamp);
            let recorded = (chunk.first_timestamp, chunk.last_timestamp);

            // File already replaced before the crash; only the record lags behind.
            if on_disk == expected && on_disk != recorded {
                self.db.mark_chunk_rewritten(chunk.id, expected.0, expected.1)?;
                continue;
            }

            let mut data = codec::decode(&bytes)?;
            data.map_timestamps(|ts| transform.apply(ts));
            if !data.is_sorted_strict() {
                return Err(collision(signal_id));
            }
            let encoded = codec::encode(&data, header.compression)?;
            write_atomic(&path, &encoded)?;
            self.db.mark_chunk_rewritten(
                chunk.id,
                data.first_timestamp().unwrap_or(expected.0),
                data.last_timestamp().unwrap_or(expected.1),
            )?;
        }

        let bounds = self.db.chunk_extent(signal_id)?;
        self.db.finish_rewrite(signal_id, bounds)?;
        Ok(bounds)
    }

    /// Removes every chunk file and record of the signal.
    pub fn delete(&self, signal_id: Uuid) -> Result<usize> {
        let chunks = self.db.chunks(signal_id)?;
        for chunk in &chunks {
            let path = self.root.join(&chunk.path);
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    warn!("Chunk file {} already gone", chunk.path);
                }
                Err(e) => return Err(e.into()),
            }
            if let Some(parent) = path.parent() {
                delete_empty_folders(parent, &self.root, self.cleanup_depth);
            }
        }
        self.db.delete_chunk_records(signal_id)?;
        debug!("Deleted {} chunks of signal {}", chunks.len(), signal_id);
        Ok(chunks.len())
    }
}

/// `<dataset>/<signal[..8]>/<chunk[..8]>.chnk`, relative to the data root.
fn chunk_path(signal: &Signal, chunk_id: Uuid) -> String {
    let signal_part = signal.id.simple().to_string();
    let chunk_part = chunk_id.simple().to_string();
    format!(
        "{}/{}/{}.{}",
        signal.dataset_id,
        &signal_part[..PATH_ID_LEN],
        &chunk_part[..PATH_ID_LEN],
        CHUNK_EXTENSION
    )
}

/// Writes to a sibling temp file, syncs it and renames it over `path`.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Removes `path` and then its parents while they are empty, at most `depth`
/// levels, never touching `root` itself.
fn delete_empty_folders(path: &Path, root: &Path, depth: usize) {
    let mut current = path.to_path_buf();
    for _ in 0..depth {
        if current == root || !current.starts_with(root) {
            break;
        }
        if fs::remove_dir(&current).is_err() {
            break;
        }
        match current.parent() {
            Some(parent) => current = parent.to_path_buf(),
            None => break,
        }
    }
}

/// Chunk order can differ from time order after a stretch.
fn sort_by_time(series: NumericSeries) -> NumericSeries {
    if series.is_sorted_strict() {
        return series;
    }
    let mut pairs: Vec<(i64, f64)> = series.iter().map(|(ts, v)| (ts, *v)).collect();
    pairs.sort_by_key(|(ts, _)| *ts);
    NumericSeries::from_pairs(pairs)
}

fn collision(signal_id: Uuid) -> StoreError {
    StoreError::config(format!(
        "correction maps two samples of signal {signal_id} onto the same instant"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::format::{NewSignal, SignalType};
    use tempfile::TempDir;

    const SEC: i64 = MICROS_PER_SECOND;

    fn setup(span_secs: u64) -> (TempDir, ChunkedFileStore, Signal) {
        let dir = TempDir::new().unwrap();
        let config = StoreConfig {
            data_root: dir.path().join("data"),
            chunk_span_secs: span_secs,
            ..StoreConfig::default()
        };
        let db = Database::open_in_memory().unwrap();
        let dataset = db.create_dataset("d", None).unwrap();
        let signal = db
            .create_signal(dataset.id, &NewSignal::new("ecg", SignalType::Ecg))
            .unwrap();
        let store = ChunkedFileStore::new(db, &config).unwrap();
        (dir, store, signal)
    }

    fn ramp(n: i64, step_us: i64, start_us: i64) -> NumericSeries {
        NumericSeries::from_pairs((0..n).map(|i| (start_us + i * step_us, i as f64)))
    }

    #[test]
    fn test_round_trip() {
        let (_dir, store, signal) = setup(10);
        let series = ramp(95, SEC / 4, 1_700_000_000 * SEC + 123_456);
        store.create(&signal, &series).unwrap();
        let back = store.read_range(signal.id, i64::MIN, i64::MAX).unwrap();
        assert_eq!(back, series);
    }

    #[test]
    fn test_windows_are_second_aligned_and_half_open() {
        let (_dir, store, signal) = setup(2);
        // origin floors to 10s; windows [10,12) [12,14) [14,16)
        let series = NumericSeries::from_pairs(vec![
            (10 * SEC + 500_000, 1.0),
            (12 * SEC, 2.0),
            (13 * SEC + 999_999, 3.0),
            (14 * SEC, 4.0),
        ]);
        assert_eq!(store.create(&signal, &series).unwrap(), 3);
        let chunks = store.db.chunks(signal.id).unwrap();
        let bounds: Vec<_> = chunks
            .iter()
            .map(|c| (c.first_timestamp, c.last_timestamp))
            .collect();
        assert_eq!(
            bounds,
            vec![
                (10 * SEC + 500_000, 10 * SEC + 500_000),
                (12 * SEC, 13 * SEC + 999_999),
                (14 * SEC, 14 * SEC),
            ]
        );
    }

    #[test]
    fn test_gaps_skip_empty_windows() {
        let (_dir, store, signal) = setup(10);
        let mut series = ramp(5, SEC, 0);
        series.extend(ramp(5, SEC, 100 * SEC));
        assert_eq!(store.create(&signal, &series).unwrap(), 2);
        let back = store.read_range(signal.id, i64::MIN, i64::MAX).unwrap();
        assert_eq!(back, series);
    }

    #[test]
    fn test_write_once() {
        let (_dir, store, signal) = setup(10);
        store.create(&signal, &ramp(20, SEC, 0)).unwrap();
        let err = store.create(&signal, &ramp(3, SEC, 1000 * SEC)).unwrap_err();
        assert!(matches!(err, StoreError::NonEmptySignal(_)));
        let back = store.read_range(signal.id, i64::MIN, i64::MAX).unwrap();
        assert_eq!(back.len(), 20);
    }

    #[test]
    fn test_unsorted_series_rejected() {
        let (_dir, store, signal) = setup(10);
        let series = NumericSeries::from_pairs(vec![(2, 1.0), (1, 2.0)]);
        assert!(matches!(
            store.create(&signal, &series),
            Err(StoreError::Configuration(_))
        ));
        assert_eq!(store.db.chunk_count(signal.id).unwrap(), 0);
    }

    #[test]
    fn test_range_truncation_and_adjacent_ranges() {
        let (_dir, store, signal) = setup(10);
        let series = ramp(60, SEC, 0);
        store.create(&signal, &series).unwrap();

        let mid = store.read_range(signal.id, 15 * SEC, 34 * SEC).unwrap();
        assert_eq!(mid.first_timestamp(), Some(15 * SEC));
        assert_eq!(mid.last_timestamp(), Some(34 * SEC));
        assert_eq!(mid.len(), 20);

        let left = store.read_range(signal.id, 0, 25 * SEC - 1).unwrap();
        let right = store.read_range(signal.id, 25 * SEC, 59 * SEC).unwrap();
        let mut joined = left.clone();
        joined.extend(right);
        assert_eq!(joined, series);

        assert!(store.read_range(signal.id, 100 * SEC, 200 * SEC).unwrap().is_empty());
    }

    #[test]
    fn test_corrupt_chunk_fails_whole_query() {
        let (_dir, store, signal) = setup(10);
        store.create(&signal, &ramp(30, SEC, 0)).unwrap();
        let chunks = store.db.chunks(signal.id).unwrap();
        let victim = store.root().join(&chunks[1].path);
        let bytes = fs::read(&victim).unwrap();
        fs::write(&victim, &bytes[..bytes.len() / 2]).unwrap();

        let err = store.read_range(signal.id, i64::MIN, i64::MAX).unwrap_err();
        assert!(matches!(err, StoreError::Format(_)));
        // ranges that avoid the corrupt chunk still work
        assert_eq!(store.read_range(signal.id, 0, 9 * SEC).unwrap().len(), 10);
    }

    #[test]
    fn test_rewrite_transforms_and_rederives_bounds() {
        let (_dir, store, signal) = setup(1);
        let series = NumericSeries::from_pairs(vec![(0, 1.0), (SEC, 2.0), (2 * SEC, 3.0)]);
        store.create(&signal, &series).unwrap();

        let transform = TimeTransform::new(10 * SEC, 2.0, SEC).unwrap();
        let bounds = store.rewrite(signal.id, &transform).unwrap();
        assert_eq!(bounds, Some((9 * SEC, 13 * SEC)));

        let back = store.read_range(signal.id, i64::MIN, i64::MAX).unwrap();
        assert_eq!(back.timestamps, vec![9 * SEC, 11 * SEC, 13 * SEC]);
        assert_eq!(back.values, vec![1.0, 2.0, 3.0]);
        assert!(store.db.pending_rewrite(signal.id).unwrap().is_none());

        let signal = store.db.get_signal(signal.id).unwrap();
        assert_eq!(signal.first_micros(), Some(9 * SEC));
        assert_eq!(signal.last_micros(), Some(13 * SEC));
    }

    #[test]
    fn test_rewrite_collision_keeps_every_sample() {
        let (_dir, store, signal) = setup(1);
        let series = ramp(10, 1, 0);
        store.create(&signal, &series).unwrap();
        let before = store.db.chunks(signal.id).unwrap();

        // 0..9us squeezed by 0.3 folds neighbours onto one microsecond
        let transform = TimeTransform::new(0, 0.3, 0).unwrap();
        let err = store.rewrite(signal.id, &transform).unwrap_err();
        assert!(matches!(err, StoreError::Configuration(_)));

        assert!(store.db.pending_rewrite(signal.id).unwrap().is_none());
        assert_eq!(store.db.chunks(signal.id).unwrap(), before);
        let back = store.read_range(signal.id, i64::MIN, i64::MAX).unwrap();
        assert_eq!(back, series);
    }

    #[test]
    fn test_rewrite_collision_across_chunks() {
        let (_dir, store, signal) = setup(1);
        // last sample of one chunk and first of the next both land on 0.5s
        let series = NumericSeries::from_pairs(vec![(SEC - 1, 1.0), (SEC, 2.0)]);
        store.create(&signal, &series).unwrap();
        assert_eq!(store.db.chunk_count(signal.id).unwrap(), 2);

        let transform = TimeTransform::new(0, 0.5, 0).unwrap();
        assert!(matches!(
            store.rewrite(signal.id, &transform),
            Err(StoreError::Configuration(_))
        ));
        let back = store.read_range(signal.id, i64::MIN, i64::MAX).unwrap();
        assert_eq!(back, series);
    }

    #[test]
    fn test_resume_after_crash_between_rename_and_record_update() {
        let (_dir, store, signal) = setup(10);
        let series = ramp(30, SEC, 0);
        store.create(&signal, &series).unwrap();
        let transform = TimeTransform::new(5 * SEC, 1.0, 0).unwrap();

        // simulate: journal written, first chunk file replaced, record not updated
        store.db.journal_rewrite(signal.id, &transform).unwrap();
        let first = store.db.chunks(signal.id).unwrap().remove(0);
        let path = store.root().join(&first.path);
        let mut data = codec::decode(&fs::read(&path).unwrap()).unwrap();
        data.map_timestamps(|ts| transform.apply(ts));
        write_atomic(&path, &codec::encode(&data, CompressionType::Zlib).unwrap()).unwrap();

        assert!(matches!(
            store.rewrite(signal.id, &transform),
            Err(StoreError::RewriteInProgress(_))
        ));
        let bounds = store.resume_rewrite(signal.id).unwrap();
        assert_eq!(bounds, Some(Some((5 * SEC, 34 * SEC))));

        let back = store.read_range(signal.id, i64::MIN, i64::MAX).unwrap();
        let expected: Vec<i64> = series.timestamps.iter().map(|t| t + 5 * SEC).collect();
        assert_eq!(back.timestamps, expected);
        assert!(store.resume_rewrite(signal.id).unwrap().is_none());
    }

    #[test]
    fn test_delete_removes_files_and_empty_dirs() {
        let (_dir, store, signal) = setup(10);
        store.create(&signal, &ramp(25, SEC, 0)).unwrap();
        let chunk = store.db.chunks(signal.id).unwrap().remove(0);
        let signal_dir = store.root().join(&chunk.path).parent().unwrap().to_path_buf();
        assert!(signal_dir.exists());

        assert_eq!(store.delete(signal.id).unwrap(), 3);
        assert_eq!(store.db.chunk_count(signal.id).unwrap(), 0);
        assert!(!signal_dir.exists());
        assert!(store.root().exists());
        assert!(store.read_range(signal.id, i64::MIN, i64::MAX).unwrap().is_empty());
    }
}
