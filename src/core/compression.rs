// Compression backend implementations

use crate::core::constants::CompressionType;
use crate::core::error::{Result, StoreError};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use std::io::{Read, Write};

pub fn compress(data: &[u8], compression: CompressionType) -> Result<Vec<u8>> {
    match compression {
        CompressionType::None => Ok(data.to_vec()),

        CompressionType::Zlib => {
            let mut encoder = ZlibEncoder::new(Vec::new(), flate2::Compression::default());
            encoder.write_all(data)?;
            Ok(encoder.finish()?)
        }

        #[cfg(feature = "lz4")]
        CompressionType::Lz4 => Ok(lz4::block::compress(data, None, false)?),

        #[cfg(not(feature = "lz4"))]
        CompressionType::Lz4 => Err(StoreError::UnsupportedCompression(2)),

        #[cfg(feature = "zstd")]
        CompressionType::Zstd => Ok(zstd::encode_all(data, 0)?),

        #[cfg(not(feature = "zstd"))]
        CompressionType::Zstd => Err(StoreError::UnsupportedCompression(3)),
    }
}

/// `raw_len` is the expected decompressed size; lz4 blocks need it up front.
pub fn decompress(data: &[u8], compression: CompressionType, raw_len: usize) -> Result<Vec<u8>> {
    match compression {
        CompressionType::None => Ok(data.to_vec()),

        CompressionType::Zlib => {
            let mut decoder = ZlibDecoder::new(data);
            let mut decompressed = Vec::with_capacity(raw_len);
            decoder
                .read_to_end(&mut decompressed)
                .map_err(|e| StoreError::DecompressionFailed(format!("Zlib: {}", e)))?;
            Ok(decompressed)
        }

        #[cfg(feature = "lz4")]
        CompressionType::Lz4 => {
            let size = i32::try_from(raw_len)
                .map_err(|_| StoreError::DecompressionFailed("LZ4: block too large".into()))?;
            lz4::block::decompress(data, Some(size))
                .map_err(|e| StoreError::DecompressionFailed(format!("LZ4: {}", e)))
        }

        #[cfg(not(feature = "lz4"))]
        CompressionType::Lz4 => Err(StoreError::UnsupportedCompression(2)),

        #[cfg(feature = "zstd")]
        CompressionType::Zstd => zstd::decode_all(data)
            .map_err(|e| StoreError::DecompressionFailed(format!("Zstd: {}", e))),

        #[cfg(not(feature = "zstd"))]
        CompressionType::Zstd => Err(StoreError::UnsupportedCompression(3)),
    }
}
