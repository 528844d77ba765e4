// Adaptive downsampling for visualization
//
// ratio R = len / max_points
//   R <= 1          passthrough
//   1 < R <= limit  one mean point per bucket
//   R > limit       min and max per bucket, both at the bucket start
//
// Buckets are `ceil(span / (max_points - 1))` wide and anchored at the first
// sample. Empty buckets produce nothing.

use serde::Serialize;

use crate::core::error::{Result, StoreError};
use crate::core::format::{NumericSeries, SignalData};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DownsampleMode {
    None,
    Mean,
    MinMax,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum PointValue {
    Number(f64),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Point {
    /// Microseconds since the Unix epoch.
    pub x: i64,
    pub y: PointValue,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Downsampled {
    pub mode: DownsampleMode,
    /// Bucket width, absent when the data passed through unchanged.
    pub window_us: Option<i64>,
    pub points: Vec<Point>,
}

impl Downsampled {
    pub fn is_downsampled(&self) -> bool {
        self.mode != DownsampleMode::None
    }

    fn passthrough(data: &SignalData) -> Self {
        let points = match data {
            SignalData::Numeric(series) => series
                .iter()
                .map(|(x, y)| Point { x, y: PointValue::Number(*y) })
                .collect(),
            SignalData::Text(series) => series
                .iter()
                .map(|(x, y)| Point { x, y: PointValue::Text(y.clone()) })
                .collect(),
        };
        Self {
            mode: DownsampleMode::None,
            window_us: None,
            points,
        }
    }
}

pub fn downsample(data: &SignalData, max_points: usize, oversampling_threshold: f64) -> Result<Downsampled> {
    if max_points <= 1 {
        return Err(StoreError::config(format!(
            "max_points must be at least 2, got {max_points}"
        )));
    }
    match data {
        // event markers keep their identity
        SignalData::Text(_) => Ok(Downsampled::passthrough(data)),
        SignalData::Numeric(series) if series.len() <= max_points => {
            Ok(Downsampled::passthrough(data))
        }
        SignalData::Numeric(series) => {
            let ratio = series.len() as f64 / max_points as f64;
            let mode = if ratio > oversampling_threshold {
                DownsampleMode::MinMax
            } else {
                DownsampleMode::Mean
            };
            Ok(bucketize(series, max_points, mode))
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Bucket {
    index: i128,
    sum: f64,
    count: usize,
    min: f64,
    max: f64,
}

impl Bucket {
    fn new(index: i128, value: f64) -> Self {
        Self {
            index,
            sum: value,
            count: 1,
            min: value,
            max: value,
        }
    }

    fn add(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }
}

// `series` is ascending with at least two samples.
fn bucketize(series: &NumericSeries, max_points: usize, mode: DownsampleMode) -> Downsampled {
    let first = series.timestamps[0] as i128;
    let last = series.timestamps[series.len() - 1] as i128;
    let span = (last - first).max(0);
    let divisor = (max_points - 1) as i128;
    let window = ((span + divisor - 1) / divisor).max(1);

    let capacity = match mode {
        DownsampleMode::MinMax => 2 * max_points,
        _ => max_points,
    };
    let mut points = Vec::with_capacity(capacity);
    let mut emit = |bucket: Bucket| {
        let x = clamp_i64(first + bucket.index * window);
        match mode {
            DownsampleMode::MinMax => {
                points.push(Point { x, y: PointValue::Number(bucket.min) });
                points.push(Point { x, y: PointValue::Number(bucket.max) });
            }
            _ => points.push(Point {
                x,
                y: PointValue::Number(bucket.sum / bucket.count as f64),
            }),
        }
    };

    let mut current: Option<Bucket> = None;
    for (ts, value) in series.iter() {
        let index = (ts as i128 - first) / window;
        if let Some(bucket) = current.as_mut() {
            if bucket.index == index {
                bucket.add(*value);
                continue;
            }
        }
        if let Some(done) = current.replace(Bucket::new(index, *value)) {
            emit(done);
        }
    }
    if let Some(done) = current {
        emit(done);
    }

    Downsampled {
        mode,
        window_us: Some(clamp_i64(window)),
        points,
    }
}

fn clamp_i64(value: i128) -> i64 {
    value.clamp(i64::MIN as i128, i64::MAX as i128) as i64
}
