// Data structures shared by the storage tiers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::core::constants::MICROS_PER_SECOND;
use crate::core::error::{Result, StoreError};
use crate::core::status::IngestionStatus;

/// Converts microseconds since the Unix epoch into a UTC timestamp.
pub fn to_datetime(micros: i64) -> Option<DateTime<Utc>> {
    let secs = micros.div_euclid(MICROS_PER_SECOND);
    let nanos = (micros.rem_euclid(MICROS_PER_SECOND) * 1_000) as u32;
    DateTime::from_timestamp(secs, nanos)
}

pub fn to_micros(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum SignalType {
    #[serde(rename = "ECG")]
    Ecg,
    #[serde(rename = "PPG")]
    Ppg,
    #[serde(rename = "RRI")]
    RrInterval,
    #[serde(rename = "NNI")]
    NnInterval,
    #[serde(rename = "TAG")]
    Tags,
    #[serde(rename = "OTH")]
    #[default]
    Other,
}

impl SignalType {
    pub fn code(&self) -> &'static str {
        match self {
            SignalType::Ecg => "ECG",
            SignalType::Ppg => "PPG",
            SignalType::RrInterval => "RRI",
            SignalType::NnInterval => "NNI",
            SignalType::Tags => "TAG",
            SignalType::Other => "OTH",
        }
    }

    pub fn is_event(&self) -> bool {
        matches!(self, SignalType::Tags)
    }
}

impl fmt::Display for SignalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for SignalType {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ECG" => Ok(SignalType::Ecg),
            "PPG" => Ok(SignalType::Ppg),
            "RRI" => Ok(SignalType::RrInterval),
            "NNI" => Ok(SignalType::NnInterval),
            "TAG" => Ok(SignalType::Tags),
            "OTH" => Ok(SignalType::Other),
            other => Err(StoreError::Parse(format!("unknown signal type: {other}"))),
        }
    }
}

/// Ordered (timestamp, value) pairs. Timestamps are microseconds since the
/// Unix epoch, UTC.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Series<V = f64> {
    pub timestamps: Vec<i64>,
    pub values: Vec<V>,
}

pub type NumericSeries = Series<f64>;
pub type TagSeries = Series<String>;

impl<V> Series<V> {
    pub fn new() -> Self {
        Self {
            timestamps: Vec::new(),
            values: Vec::new(),
        }
    }

    pub fn with_capacity(cap: usize) -> Self {
        Self {
            timestamps: Vec::with_capacity(cap),
            values: Vec::with_capacity(cap),
        }
    }

    pub fn from_pairs<I: IntoIterator<Item = (i64, V)>>(pairs: I) -> Self {
        let mut series = Self::new();
        for (ts, value) in pairs {
            series.push(ts, value);
        }
        series
    }

    pub fn push(&mut self, timestamp: i64, value: V) {
        self.timestamps.push(timestamp);
        self.values.push(value);
    }

    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    pub fn first_timestamp(&self) -> Option<i64> {
        self.timestamps.first().copied()
    }

    pub fn last_timestamp(&self) -> Option<i64> {
        self.timestamps.last().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (i64, &V)> + '_ {
        self.timestamps.iter().copied().zip(self.values.iter())
    }

    pub fn extend(&mut self, other: Series<V>) {
        self.timestamps.extend(other.timestamps);
        self.values.extend(other.values);
    }

    /// Keeps only samples with `start <= ts <= end`. Assumes ascending order.
    pub fn truncate_to(self, start: i64, end: i64) -> Self {
        let lo = self.timestamps.partition_point(|ts| *ts < start);
        let hi = self.timestamps.partition_point(|ts| *ts <= end);
        if lo == 0 && hi == self.len() {
            return self;
        }
        let Series {
            mut timestamps,
            mut values,
        } = self;
        let hi = hi.max(lo);
        timestamps.truncate(hi);
        values.truncate(hi);
        timestamps.drain(..lo);
        values.drain(..lo);
        Series { timestamps, values }
    }

    pub fn map_timestamps<F: Fn(i64) -> i64>(&mut self, f: F) {
        for ts in self.timestamps.iter_mut() {
            *ts = f(*ts);
        }
    }

    pub fn is_sorted_strict(&self) -> bool {
        self.timestamps.windows(2).all(|w| w[0] < w[1])
    }
}

impl Series<f64> {
    /// Returns (min, max) of the values, ignoring NaN.
    pub fn value_range(&self) -> Option<(f64, f64)> {
        self.values
            .iter()
            .filter(|v| !v.is_nan())
            .fold(None, |acc, &v| match acc {
                None => Some((v, v)),
                Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
            })
    }

    pub fn drop_nan(&mut self) {
        if !self.values.iter().any(|v| v.is_nan()) {
            return;
        }
        let mut kept = Series::with_capacity(self.len());
        for (ts, v) in self.iter() {
            if !v.is_nan() {
                kept.push(ts, *v);
            }
        }
        *self = kept;
    }
}

/// Series as returned from either tier: numeric samples or text tags.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalData {
    Numeric(NumericSeries),
    Text(TagSeries),
}

impl SignalData {
    pub fn len(&self) -> usize {
        match self {
            SignalData::Numeric(s) => s.len(),
            SignalData::Text(s) => s.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn timestamps(&self) -> &[i64] {
        match self {
            SignalData::Numeric(s) => &s.timestamps,
            SignalData::Text(s) => &s.timestamps,
        }
    }

    pub fn first_timestamp(&self) -> Option<i64> {
        self.timestamps().first().copied()
    }

    pub fn last_timestamp(&self) -> Option<i64> {
        self.timestamps().last().copied()
    }

    pub fn map_timestamps<F: Fn(i64) -> i64>(&mut self, f: F) {
        match self {
            SignalData::Numeric(s) => s.map_timestamps(f),
            SignalData::Text(s) => s.map_timestamps(f),
        }
    }

    pub fn value_range(&self) -> Option<(f64, f64)> {
        match self {
            SignalData::Numeric(s) => s.value_range(),
            SignalData::Text(_) => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Dataset {
    pub id: Uuid,
    pub title: String,
    pub status: IngestionStatus,
    pub source: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Signal {
    pub id: Uuid,
    pub dataset_id: Uuid,
    pub name: String,
    #[serde(rename = "type")]
    pub signal_type: SignalType,
    pub unit: Option<String>,
    pub frequency: Option<f64>,
    pub raw_file: Option<String>,
    pub first_timestamp: Option<DateTime<Utc>>,
    pub last_timestamp: Option<DateTime<Utc>>,
    pub y_min: Option<f64>,
    pub y_max: Option<f64>,
    /// Reference time established by the last individual correction.
    pub reference_time: Option<DateTime<Utc>>,
}

impl Signal {
    pub fn first_micros(&self) -> Option<i64> {
        self.first_timestamp.map(to_micros)
    }

    pub fn last_micros(&self) -> Option<i64> {
        self.last_timestamp.map(to_micros)
    }
}

/// Fields needed to register a new, still empty signal.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewSignal {
    pub name: String,
    pub signal_type: SignalType,
    pub unit: Option<String>,
    pub frequency: Option<f64>,
    pub raw_file: Option<String>,
}

impl NewSignal {
    pub fn new(name: impl Into<String>, signal_type: SignalType) -> Self {
        Self {
            name: name.into(),
            signal_type,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChunkRecord {
    pub id: Uuid,
    pub signal_id: Uuid,
    /// Path relative to the data root.
    pub path: String,
    pub first_timestamp: i64,
    pub last_timestamp: i64,
}
