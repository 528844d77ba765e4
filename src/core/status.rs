// Ingestion lifecycle of a dataset

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::core::error::{Result, StoreError};

/// `Queued -> Processing -> {Processed, Error}`.
///
/// `Processed` and `Error` are terminal for a single ingestion run; only a
/// re-ingestion (which deletes every stored signal first) moves a dataset
/// back to `Queued`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum IngestionStatus {
    #[default]
    Queued,
    Processing,
    Processed,
    Error,
}

impl IngestionStatus {
    pub fn code(&self) -> &'static str {
        match self {
            IngestionStatus::Queued => "UP",
            IngestionStatus::Processing => "PR",
            IngestionStatus::Processed => "PD",
            IngestionStatus::Error => "ER",
        }
    }

    pub fn can_transition_to(&self, next: IngestionStatus) -> bool {
        use IngestionStatus::*;
        matches!(
            (self, next),
            (Queued, Processing) | (Processing, Processed) | (Processing, Error)
        )
    }

    /// Validates `self -> next` and returns `next`.
    pub fn transition(self, next: IngestionStatus) -> Result<IngestionStatus> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(StoreError::InvalidTransition {
                from: self.to_string(),
                to: next.to_string(),
            })
        }
    }

    /// Re-ingestion resets any state except an active run.
    pub fn reset(self) -> Result<IngestionStatus> {
        if self == IngestionStatus::Processing {
            return Err(StoreError::InvalidTransition {
                from: self.to_string(),
                to: IngestionStatus::Queued.to_string(),
            });
        }
        Ok(IngestionStatus::Queued)
    }
}

impl fmt::Display for IngestionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IngestionStatus::Queued => "queued",
            IngestionStatus::Processing => "processing",
            IngestionStatus::Processed => "processed",
            IngestionStatus::Error => "error",
        };
        f.write_str(name)
    }
}

impl FromStr for IngestionStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "UP" => Ok(IngestionStatus::Queued),
            "PR" => Ok(IngestionStatus::Processing),
            "PD" => Ok(IngestionStatus::Processed),
            "ER" => Ok(IngestionStatus::Error),
            other => Err(StoreError::Parse(format!("unknown status code: {other}"))),
        }
    }
}
