// Format and storage constants

use serde::{Deserialize, Serialize};

pub const CHUNK_MAGIC: &[u8; 4] = b"CHNK";
pub const CHUNK_VERSION: u8 = 1;
pub const CHUNK_EXTENSION: &str = "chnk";

// Compression codes
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CompressionType {
    None = 0,
    #[default]
    Zlib = 1,
    Lz4 = 2,
    Zstd = 3,
}

impl CompressionType {
    pub fn from_u8(val: u8) -> Option<Self> {
        match val {
            0 => Some(CompressionType::None),
            1 => Some(CompressionType::Zlib),
            2 => Some(CompressionType::Lz4),
            3 => Some(CompressionType::Zstd),
            _ => None,
        }
    }
}

// Record format: timestamp column (i64 micros) + value column (f64)
pub const RECORD_SIZE: usize = 16; // 8 + 8 bytes

// Chunk header: MAGIC(4) version(u8) comp(u8) n(u32) raw_len(u32) comp_len(u32) first_ts(i64) last_ts(i64)
pub const CHUNK_HEADER_SIZE: usize = 4 + 1 + 1 + 4 + 4 + 4 + 8 + 8; // 34 bytes

pub const MICROS_PER_SECOND: i64 = 1_000_000;

// Unbounded query limits
pub const MIN_TIMESTAMP_US: i64 = i64::MIN;
pub const MAX_TIMESTAMP_US: i64 = i64::MAX;

// Defaults
pub const DEFAULT_CHUNK_SPAN_SECS: u64 = 3600;
pub const DEFAULT_OVERSAMPLING_THRESHOLD: f64 = 20.0;
pub const DEFAULT_MAX_POINTS: usize = 2000;
pub const DEFAULT_WORKERS: usize = 2;
pub const DEFAULT_CLEANUP_DEPTH: usize = 2;

// Leading characters of an id used in chunk paths
pub const PATH_ID_LEN: usize = 8;
