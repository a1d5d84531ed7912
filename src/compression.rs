//! Zstd compression for archive entry payloads.
//!
//! Each archive entry is compressed on its own so a reader can inflate a
//! single key without touching the rest of the file.

use std::io::{Read, Write};

use crate::error::{Error, Result};

/// Compression level presets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionLevel {
    Fast = 1,
    Default = 3,
    Best = 19,
}

impl From<CompressionLevel> for i32 {
    fn from(level: CompressionLevel) -> Self {
        level as i32
    }
}

/// Valid zstd levels accepted by the archive writer.
pub const LEVEL_RANGE: std::ops::RangeInclusive<i32> = 1..=22;

/// Compress data using zstd.
pub fn compress_zstd(data: &[u8], level: i32) -> Result<Vec<u8>> {
    if !LEVEL_RANGE.contains(&level) {
        return Err(Error::Serialization(format!(
            "zstd level {} outside {:?}",
            level, LEVEL_RANGE
        )));
    }

    let mut encoder = zstd::Encoder::new(Vec::new(), level)?;
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

/// Upper bound on how far one stored byte can inflate. A zstd block of up to
/// 128 KiB costs at least a 3-byte header plus one byte of content.
pub const MAX_INFLATION: u64 = 1 << 17;

const PREALLOC_LIMIT: usize = 64 << 20;

/// Decompress zstd data, expecting exactly `expected_len` bytes.
pub fn decompress_zstd(data: &[u8], expected_len: usize) -> Result<Vec<u8>> {
    let plausible = (data.len() as u64).saturating_mul(MAX_INFLATION);
    if expected_len as u64 > plausible {
        return Err(Error::corrupted(format!(
            "{} stored bytes cannot inflate to {} bytes",
            data.len(),
            expected_len
        )));
    }

    let decoder = zstd::Decoder::new(data)
        .map_err(|e| Error::corrupted(format!("zstd decode init failed: {}", e)))?;

    // One byte past the expected length is enough to detect an oversized frame.
    let mut decompressed = Vec::with_capacity(expected_len.min(PREALLOC_LIMIT));
    decoder
        .take(expected_len as u64 + 1)
        .read_to_end(&mut decompressed)
        .map_err(|e| Error::corrupted(format!("zstd decompress failed: {}", e)))?;

    if decompressed.len() != expected_len {
        return Err(Error::corrupted(format!(
            "payload does not inflate to the expected {} bytes",
            expected_len
        )));
    }

    Ok(decompressed)
}

/// Get compression ratio
pub fn compression_ratio(original_size: usize, compressed_size: usize) -> f64 {
    if compressed_size == 0 {
        return f64::INFINITY;
    }
    original_size as f64 / compressed_size as f64
}
