// Chunk codec: one bounded window of a dense signal as a columnar blob
//
// Layout (little-endian):
//   header  MAGIC(4) version(u8) comp(u8) n(u32) raw_len(u32) comp_len(u32) first_ts(i64) last_ts(i64)
//   payload compressed [ts column: n x i64][value column: n x f64]

use crate::core::compression::{compress, decompress};
use crate::core::constants::*;
use crate::core::error::{Result, StoreError};
use crate::core::format::NumericSeries;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub version: u8,
    pub compression: CompressionType,
    pub record_count: u32,
    pub raw_length: u32,
    pub compressed_length: u32,
    pub first_timestamp: i64,
    pub last_timestamp: i64,
}

pub fn encode(series: &NumericSeries, compression: CompressionType) -> Result<Vec<u8>> {
    if series.timestamps.len() != series.values.len() {
        return Err(StoreError::format("timestamp and value columns differ in length"));
    }
    let record_count = u32::try_from(series.len())
        .map_err(|_| StoreError::format("too many records for one chunk"))?;

    let mut raw = Vec::with_capacity(series.len() * RECORD_SIZE);
    for ts in &series.timestamps {
        raw.extend_from_slice(&ts.to_le_bytes());
    }
    for value in &series.values {
        raw.extend_from_slice(&value.to_le_bytes());
    }
    let packed = compress(&raw, compression)?;

    let raw_length =
        u32::try_from(raw.len()).map_err(|_| StoreError::format("chunk payload too large"))?;
    let compressed_length =
        u32::try_from(packed.len()).map_err(|_| StoreError::format("chunk payload too large"))?;

    let mut out = Vec::with_capacity(CHUNK_HEADER_SIZE + packed.len());
    out.extend_from_slice(CHUNK_MAGIC);
    out.push(CHUNK_VERSION);
    out.push(compression as u8);
    out.extend_from_slice(&record_count.to_le_bytes());
    out.extend_from_slice(&raw_length.to_le_bytes());
    out.extend_from_slice(&compressed_length.to_le_bytes());
    out.extend_from_slice(&series.first_timestamp().unwrap_or(0).to_le_bytes());
    out.extend_from_slice(&series.last_timestamp().unwrap_or(0).to_le_bytes());
    out.extend_from_slice(&packed);
    Ok(out)
}

pub fn read_header(bytes: &[u8]) -> Result<ChunkHeader> {
    if bytes.len() < CHUNK_HEADER_SIZE {
        return Err(StoreError::format(format!(
            "truncated chunk header: {} of {} bytes",
            bytes.len(),
            CHUNK_HEADER_SIZE
        )));
    }
    if &bytes[0..4] != CHUNK_MAGIC {
        return Err(StoreError::format(format!(
            "invalid chunk magic: {:?}",
            &bytes[0..4]
        )));
    }
    let version = bytes[4];
    if version != CHUNK_VERSION {
        return Err(StoreError::format(format!("unsupported chunk version {version}")));
    }
    let compression = CompressionType::from_u8(bytes[5])
        .ok_or_else(|| StoreError::format(format!("unknown compression code {}", bytes[5])))?;

    Ok(ChunkHeader {
        version,
        compression,
        record_count: read_u32(bytes, 6),
        raw_length: read_u32(bytes, 10),
        compressed_length: read_u32(bytes, 14),
        first_timestamp: read_i64(bytes, 18),
        last_timestamp: read_i64(bytes, 26),
    })
}

pub fn decode(bytes: &[u8]) -> Result<NumericSeries> {
    let header = read_header(bytes)?;
    let n = header.record_count as usize;

    let expected_raw = n * RECORD_SIZE;
    if header.raw_length as usize != expected_raw {
        return Err(StoreError::format(format!(
            "header declares {} raw bytes for {} records",
            header.raw_length, n
        )));
    }

    let end = CHUNK_HEADER_SIZE + header.compressed_length as usize;
    if bytes.len() < end {
        return Err(StoreError::format(format!(
            "truncated chunk payload: expected {} bytes, got {}",
            end,
            bytes.len()
        )));
    }

    let raw = decompress(&bytes[CHUNK_HEADER_SIZE..end], header.compression, expected_raw)
        .map_err(|e| StoreError::format(e.to_string()))?;
    if raw.len() != expected_raw {
        return Err(StoreError::format(format!(
            "Expected {} bytes, got {}",
            expected_raw,
            raw.len()
        )));
    }

    let mut series = NumericSeries::with_capacity(n);
    let values_offset = n * 8;
    for i in 0..n {
        series.timestamps.push(read_i64(&raw, i * 8));
        series
            .values
            .push(f64::from_bits(read_i64(&raw, values_offset + i * 8) as u64));
    }

    if n > 0
        && (series.first_timestamp() != Some(header.first_timestamp)
            || series.last_timestamp() != Some(header.last_timestamp))
    {
        return Err(StoreError::format("chunk bounds do not match its timestamp column"));
    }

    Ok(series)
}

// Callers guarantee `offset + N <= bytes.len()`.
fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_le_bytes(buf)
}

fn read_i64(bytes: &[u8], offset: usize) -> i64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[offset..offset + 8]);
    i64::from_le_bytes(buf)
}
