// Range queries and the visualization sample view

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::core::constants::{MAX_TIMESTAMP_US, MIN_TIMESTAMP_US};
use crate::core::correction::{CorrectionParams, TimeTransform};
use crate::core::downsample::{downsample, DownsampleMode, PointValue};
use crate::core::error::{Result, StoreError};
use crate::core::format::{to_micros, Signal, SignalData};
use crate::core::tier::Storage;

impl Storage {
    /// Ordered, duplicate-free samples with `start <= ts <= end`. Missing
    /// bounds are unbounded. An empty signal yields an empty series.
    pub fn query(
        &self,
        signal_id: Uuid,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<SignalData> {
        let signal = self.database().get_signal(signal_id)?;
        let start = start.map(to_micros).unwrap_or(MIN_TIMESTAMP_US);
        let end = end.map(to_micros).unwrap_or(MAX_TIMESTAMP_US);
        self.query_signal(&signal, start, end)
    }

    pub fn query_signal(&self, signal: &Signal, start: i64, end: i64) -> Result<SignalData> {
        if start > end {
            return Err(StoreError::config(format!(
                "query start {start} lies after end {end}"
            )));
        }
        debug!("Query {} [{}, {}]", signal.name, start, end);
        self.backend(signal).read_range(signal, start, end)
    }

    /// Range query followed by optional normalization, an on-the-fly
    /// correction preview and downsampling.
    pub fn samples(&self, signal_id: Uuid, query: &SampleQuery) -> Result<SamplePayload> {
        let signal = self.database().get_signal(signal_id)?;
        let max_points = query.max_points.unwrap_or(self.config().default_max_points);
        if max_points <= 1 {
            return Err(StoreError::config(format!(
                "max_points must be at least 2, got {max_points}"
            )));
        }

        let preview = query.preview()?;
        let bound = |ts: Option<DateTime<Utc>>, open: i64| match (ts, preview) {
            (Some(ts), Some(transform)) => transform.invert(to_micros(ts)),
            (Some(ts), None) => to_micros(ts),
            (None, _) => open,
        };
        let start = bound(query.start, MIN_TIMESTAMP_US);
        let end = bound(query.end, MAX_TIMESTAMP_US);

        let mut data = self.query_signal(&signal, start, end)?;
        if data.is_empty() {
            return Ok(SamplePayload::empty());
        }

        if query.normalize {
            if let SignalData::Numeric(series) = &mut data {
                let scale = signal
                    .y_min
                    .unwrap_or(0.0)
                    .abs()
                    .max(signal.y_max.unwrap_or(0.0).abs());
                if scale > 0.0 {
                    series.values.iter_mut().for_each(|v| *v /= scale);
                }
            }
        }

        if let Some(transform) = preview {
            data.map_timestamps(|ts| transform.apply(ts));
        }

        let result = downsample(&data, max_points, self.config().oversampling_threshold)?;
        debug!(
            "Samples of {}: {} -> {} points ({:?})",
            signal.name,
            data.len(),
            result.points.len(),
            result.mode
        );
        Ok(SamplePayload {
            downsampled: result.is_downsampled(),
            mode: result.mode,
            window: result
                .window_us
                .map(|w| w as f64 / 1e6)
                .unwrap_or(-1.0),
            data: result
                .points
                .into_iter()
                .map(|p| SamplePoint {
                    x: micros_to_millis(p.x),
                    y: p.y,
                })
                .collect(),
        })
    }
}

// Microsecond input keeps at most three decimals.
fn micros_to_millis(micros: i64) -> f64 {
    micros as f64 / 1_000.0
}

/// Parameters of a sample view request.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SampleQuery {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub max_points: Option<usize>,
    pub normalize: bool,
    /// Seconds.
    pub timeshift: f64,
    pub stretch_factor: f64,
    pub reference_time: Option<DateTime<Utc>>,
}

impl Default for SampleQuery {
    fn default() -> Self {
        Self {
            start: None,
            end: None,
            max_points: None,
            normalize: false,
            timeshift: 0.0,
            stretch_factor: 1.0,
            reference_time: None,
        }
    }
}

impl SampleQuery {
    fn preview(&self) -> Result<Option<TimeTransform>> {
        let params = CorrectionParams {
            timeshift: self.timeshift,
            stretch_factor: self.stretch_factor,
            reference_time: self.reference_time,
        };
        if params.is_identity() {
            return Ok(None);
        }
        if params.reference_time.is_none() {
            return Err(StoreError::config(
                "reference_time is required when timeshift or stretch_factor are set",
            ));
        }
        params.transform(0).map(Some)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SamplePoint {
    /// Milliseconds since the Unix epoch.
    pub x: f64,
    pub y: PointValue,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SamplePayload {
    pub downsampled: bool,
    pub mode: DownsampleMode,
    /// Bucket width in seconds, -1 when not downsampled.
    pub window: f64,
    pub data: Vec<SamplePoint>,
}

impl SamplePayload {
    fn empty() -> Self {
        Self {
            downsampled: false,
            mode: DownsampleMode::None,
            window: -1.0,
            data: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::StoreConfig;
    use crate::core::format::{to_datetime, NewSignal, NumericSeries, SignalType, TagSeries};
    use tempfile::TempDir;

    const SEC: i64 = 1_000_000;

    fn setup(span_secs: u64) -> (TempDir, Storage, Uuid) {
        let dir = TempDir::new().unwrap();
        let config = StoreConfig {
            data_root: dir.path().join("chunks"),
            database_path: dir.path().join("catalog.sqlite3"),
            chunk_span_secs: span_secs,
            ..StoreConfig::default()
        };
        let storage = Storage::open(&config).unwrap();
        let dataset = storage.database().create_dataset("d", None).unwrap();
        (dir, storage, dataset.id)
    }

    fn store(storage: &Storage, dataset_id: Uuid, ty: SignalType, data: &SignalData) -> Signal {
        let signal = storage
            .database()
            .create_signal(dataset_id, &NewSignal::new("s", ty))
            .unwrap();
        storage.store(&signal, data).unwrap()
    }

    #[test]
    fn test_ten_hour_ecg() {
        let (_dir, storage, dataset_id) = setup(3600);
        let start = 1_600_000_000 * SEC;
        let series = NumericSeries::from_pairs((0..36_000).map(|i| (start + i * SEC, (i % 100) as f64)));
        let data = SignalData::Numeric(series);
        let signal = store(&storage, dataset_id, SignalType::Ecg, &data);

        let chunks = storage.database().chunks(signal.id).unwrap();
        assert_eq!(chunks.len(), 10);
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.first_timestamp, start + i as i64 * 3600 * SEC);
            assert_eq!(chunk.last_timestamp, start + (i as i64 + 1) * 3600 * SEC - SEC);
        }
        assert!(chunks.windows(2).all(|w| w[0].last_timestamp < w[1].first_timestamp));
        assert_eq!(storage.query(signal.id, None, None).unwrap(), data);

        let payload = storage
            .samples(
                signal.id,
                &SampleQuery {
                    max_points: Some(100),
                    ..SampleQuery::default()
                },
            )
            .unwrap();
        assert!(payload.downsampled);
        assert_eq!(payload.mode, DownsampleMode::MinMax);
        assert!(payload.data.len() <= 200);
        // ceil(35999s / 99) in microseconds
        assert_eq!(payload.window, 363.626263);
        assert_eq!(payload.data[0].x, (start / 1_000) as f64);
    }

    #[test]
    fn test_query_bounds() {
        let (_dir, storage, dataset_id) = setup(10);
        let data = SignalData::Numeric(NumericSeries::from_pairs((0..40).map(|i| (i * SEC, i as f64))));
        let signal = store(&storage, dataset_id, SignalType::Ppg, &data);

        let part = storage
            .query(signal.id, to_datetime(5 * SEC), to_datetime(25 * SEC))
            .unwrap();
        assert_eq!(part.first_timestamp(), Some(5 * SEC));
        assert_eq!(part.last_timestamp(), Some(25 * SEC));
        assert_eq!(part.len(), 21);

        let open_end = storage.query(signal.id, to_datetime(30 * SEC), None).unwrap();
        assert_eq!(open_end.len(), 10);

        assert!(matches!(
            storage.query(signal.id, to_datetime(9 * SEC), to_datetime(SEC)),
            Err(StoreError::Configuration(_))
        ));
        assert!(matches!(
            storage.query(Uuid::new_v4(), None, None),
            Err(StoreError::SignalNotFound(_))
        ));
    }

    #[test]
    fn test_empty_signal() {
        let (_dir, storage, dataset_id) = setup(10);
        for ty in [SignalType::Ecg, SignalType::RrInterval, SignalType::Tags] {
            let signal = storage
                .database()
                .create_signal(dataset_id, &NewSignal::new("empty", ty))
                .unwrap();
            assert!(storage.query(signal.id, None, None).unwrap().is_empty());
            let payload = storage.samples(signal.id, &SampleQuery::default()).unwrap();
            assert_eq!(payload, SamplePayload::empty());
        }
    }

    #[test]
    fn test_normalize() {
        let (_dir, storage, dataset_id) = setup(10);
        let data = SignalData::Numeric(NumericSeries::from_pairs(vec![(0, -4.0), (SEC, 2.0), (2 * SEC, 1.0)]));
        let signal = store(&storage, dataset_id, SignalType::Ecg, &data);
        let payload = storage
            .samples(
                signal.id,
                &SampleQuery {
                    normalize: true,
                    ..SampleQuery::default()
                },
            )
            .unwrap();
        let ys: Vec<PointValue> = payload.data.into_iter().map(|p| p.y).collect();
        assert_eq!(
            ys,
            vec![
                PointValue::Number(-1.0),
                PointValue::Number(0.5),
                PointValue::Number(0.25)
            ]
        );
    }

    #[test]
    fn test_preview_correction_leaves_storage_untouched() {
        let (_dir, storage, dataset_id) = setup(10);
        let data = SignalData::Numeric(NumericSeries::from_pairs(vec![(0, 1.0), (SEC, 2.0), (2 * SEC, 3.0)]));
        let signal = store(&storage, dataset_id, SignalType::Ecg, &data);

        let missing_reference = SampleQuery {
            timeshift: 10.0,
            ..SampleQuery::default()
        };
        assert!(matches!(
            storage.samples(signal.id, &missing_reference),
            Err(StoreError::Configuration(_))
        ));

        let preview = SampleQuery {
            timeshift: 10.0,
            stretch_factor: 2.0,
            reference_time: to_datetime(SEC),
            // corrected view of [9s, 11s] maps back to stored [0s, 1s]
            start: to_datetime(9 * SEC),
            end: to_datetime(11 * SEC),
            ..SampleQuery::default()
        };
        let payload = storage.samples(signal.id, &preview).unwrap();
        let xs: Vec<f64> = payload.data.iter().map(|p| p.x).collect();
        assert_eq!(xs, vec![9_000.0, 11_000.0]);
        assert_eq!(storage.query(signal.id, None, None).unwrap(), data);
    }

    #[test]
    fn test_tags_payload() {
        let (_dir, storage, dataset_id) = setup(10);
        let tags = SignalData::Text(TagSeries::from_pairs((0..50).map(|i| (i * 1_500, format!("t{i}")))));
        let signal = store(&storage, dataset_id, SignalType::Tags, &tags);
        let payload = storage
            .samples(
                signal.id,
                &SampleQuery {
                    max_points: Some(5),
                    normalize: true,
                    ..SampleQuery::default()
                },
            )
            .unwrap();
        assert!(!payload.downsampled);
        assert_eq!(payload.window, -1.0);
        assert_eq!(payload.data.len(), 50);
        assert_eq!(payload.data[1].x, 1.5);

        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["data"][1]["y"], "t1");
        assert_eq!(json["mode"], "none");
    }
}
