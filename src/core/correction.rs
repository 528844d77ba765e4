// Timestamp correction: t' = (t - reference) * stretch + reference + shift

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::core::constants::MICROS_PER_SECOND;
use crate::core::error::{Result, StoreError};
use crate::core::format::{to_micros, Signal};
use crate::core::tier::{Storage, StorageTier};

/// Linear clock correction in microseconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeTransform {
    pub timeshift_us: i64,
    pub stretch_factor: f64,
    pub reference_us: i64,
}

impl TimeTransform {
    pub fn new(timeshift_us: i64, stretch_factor: f64, reference_us: i64) -> Result<Self> {
        if !stretch_factor.is_finite() || stretch_factor <= 0.0 {
            return Err(StoreError::config(format!(
                "stretch_factor must be positive and finite, got {stretch_factor}"
            )));
        }
        Ok(Self {
            timeshift_us,
            stretch_factor,
            reference_us,
        })
    }

    pub fn identity() -> Self {
        Self {
            timeshift_us: 0,
            stretch_factor: 1.0,
            reference_us: 0,
        }
    }

    pub fn is_identity(&self) -> bool {
        self.timeshift_us == 0 && self.stretch_factor == 1.0
    }

    pub fn apply(&self, ts: i64) -> i64 {
        let offset = (ts as i128 - self.reference_us as i128) as f64 * self.stretch_factor;
        let moved = offset.round() as i128 + self.reference_us as i128 + self.timeshift_us as i128;
        clamp_i64(moved)
    }

    /// Maps a corrected instant back onto the stored clock.
    pub fn invert(&self, ts: i64) -> i64 {
        let shifted = ts as i128 - self.timeshift_us as i128 - self.reference_us as i128;
        let moved = (shifted as f64 / self.stretch_factor).round() as i128 + self.reference_us as i128;
        clamp_i64(moved)
    }
}

fn clamp_i64(value: i128) -> i64 {
    value.clamp(i64::MIN as i128, i64::MAX as i128) as i64
}

/// Correction request as issued by callers: shift in seconds, optional
/// reference time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrectionParams {
    pub timeshift: f64,
    pub stretch_factor: f64,
    pub reference_time: Option<DateTime<Utc>>,
}

impl Default for CorrectionParams {
    fn default() -> Self {
        Self {
            timeshift: 0.0,
            stretch_factor: 1.0,
            reference_time: None,
        }
    }
}

impl CorrectionParams {
    pub fn timeshift_us(&self) -> Result<i64> {
        let micros = (self.timeshift * MICROS_PER_SECOND as f64).round();
        if !micros.is_finite() || micros.abs() >= i64::MAX as f64 {
            return Err(StoreError::config(format!(
                "timeshift out of range: {}",
                self.timeshift
            )));
        }
        Ok(micros as i64)
    }

    pub fn is_identity(&self) -> bool {
        self.timeshift == 0.0 && self.stretch_factor == 1.0
    }

    /// Builds the transform, taking `fallback_reference` when no reference
    /// time was supplied.
    pub fn transform(&self, fallback_reference: i64) -> Result<TimeTransform> {
        let reference = self.reference_time.map(to_micros).unwrap_or(fallback_reference);
        TimeTransform::new(self.timeshift_us()?, self.stretch_factor, reference)
    }
}

impl Storage {
    /// Rewrites every stored timestamp of the signal and persists the new
    /// bounds. The reference defaults to the signal's first timestamp.
    ///
    /// Corrections stack: calling this twice applies the transform twice.
    pub fn correct(&self, signal_id: Uuid, params: &CorrectionParams) -> Result<Signal> {
        let signal = self.database().get_signal(signal_id)?;
        let Some(first) = signal.first_micros() else {
            // still reject invalid parameters
            params.transform(0)?;
            info!("Signal {} holds no data, nothing to correct", signal.id);
            return Ok(signal);
        };
        let transform = params.transform(first)?;
        self.apply_transform(&signal, &transform)
    }

    fn apply_transform(&self, signal: &Signal, transform: &TimeTransform) -> Result<Signal> {
        let bounds = self.backend(signal).rewrite(signal, transform)?;
        self.database()
            .update_signal_bounds(signal.id, bounds, None)?;
        self.database()
            .set_reference_time(signal.id, transform.reference_us)?;
        info!(
            "Corrected signal {} (shift {}us, stretch {}, reference {}us) -> {:?}",
            signal.id,
            transform.timeshift_us,
            transform.stretch_factor,
            transform.reference_us,
            bounds
        );
        self.database().get_signal(signal.id)
    }

    /// Corrects every signal of the dataset independently. A signal keeps
    /// its own reference time when one was established before; otherwise
    /// the shared reference in `params` applies.
    pub fn correct_dataset(&self, dataset_id: Uuid, params: &CorrectionParams) -> Result<Vec<Signal>> {
        self.database().get_dataset(dataset_id)?;
        let mut corrected = Vec::new();
        for signal in self.database().list_signals(dataset_id)? {
            let per_signal = CorrectionParams {
                reference_time: signal.reference_time.or(params.reference_time),
                ..*params
            };
            corrected.push(self.correct(signal.id, &per_signal)?);
        }
        Ok(corrected)
    }

    /// Completes chunk rewrites interrupted by a crash, for every signal of
    /// the dataset. Returns the number of signals resumed.
    pub fn resume_rewrites(&self, dataset_id: Uuid) -> Result<usize> {
        let mut resumed = 0;
        for signal in self.database().list_signals(dataset_id)? {
            if self.tier(&signal) != StorageTier::Dense {
                continue;
            }
            if let Some(transform) = self.database().pending_rewrite(signal.id)? {
                warn!("Found interrupted rewrite of signal {}", signal.id);
                if let Some(bounds) = self.chunk_store().resume_rewrite(signal.id)? {
                    self.database()
                        .set_reference_time(signal.id, transform.reference_us)?;
                    info!("Resumed rewrite of signal {} -> {:?}", signal.id, bounds);
                    resumed += 1;
                }
            }
        }
        Ok(resumed)
    }
}
