// Physiological signal store
// Main library entry point

pub mod core;

// Re-export main types
pub use core::config::StoreConfig;
pub use core::correction::{CorrectionParams, TimeTransform};
pub use core::database::Database;
pub use core::downsample::{downsample, DownsampleMode, Downsampled, Point, PointValue};
pub use core::error::{Result, StoreError};
pub use core::format::{Dataset, NewSignal, NumericSeries, Signal, SignalData, SignalType, TagSeries};
pub use core::ingest::{CsvSource, Ingestor, ParsedSignal, SourceParser, SourceRegistry};
pub use core::query::{SamplePayload, SampleQuery};
pub use core::status::IngestionStatus;
pub use core::tier::{Storage, StorageTier};
pub use core::worker::{Job, JobQueue};

#[cfg(test)]
mod tests {
    #[test]
    fn test_constants() {
        use crate::core::constants::*;
        assert_eq!(CHUNK_MAGIC, b"CHNK");
        assert_eq!(CHUNK_HEADER_SIZE, 34);
        assert_eq!(RECORD_SIZE, 16);
    }
}
