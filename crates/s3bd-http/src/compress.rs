//! Block compression
//!
//! Deflate (zlib framing) with a configurable level. Tiny payloads and
//! payloads that do not shrink are stored raw; the caller records whether
//! compression was applied in the object metadata.

use std::io::Write;

use flate2::write::{ZlibDecoder, ZlibEncoder};
use flate2::Compression;

use s3bd_common::{Error, Result};

/// Payloads shorter than this are never worth compressing.
pub const MIN_COMPRESS_LEN: usize = 256;

/// Compress `data` at `level` (1-9). Returns `None` when compression is
/// not worthwhile (payload too small, or output not smaller).
pub fn compress(data: &[u8], level: u32) -> Option<Vec<u8>> {
    if data.len() < MIN_COMPRESS_LEN {
        return None;
    }
    let mut encoder = ZlibEncoder::new(
        Vec::with_capacity(data.len() / 2),
        Compression::new(level.clamp(1, 9)),
    );
    encoder.write_all(data).ok()?;
    let out = encoder.finish().ok()?;
    if out.len() < data.len() {
        Some(out)
    } else {
        None
    }
}

/// Decompress a stored payload. `expected_len` is the original length
/// recorded in the object metadata; any mismatch is an integrity failure.
pub fn decompress(data: &[u8], expected_len: usize) -> Result<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(Vec::with_capacity(expected_len));
    decoder
        .write_all(data)
        .map_err(|e| Error::integrity(format!("corrupt compressed block: {e}")))?;
    let out = decoder
        .finish()
        .map_err(|e| Error::integrity(format!("corrupt compressed block: {e}")))?;
    if out.len() != expected_len {
        return Err(Error::integrity(format!(
            "decompressed to {} bytes, expected {expected_len}",
            out.len()
        )));
    }
    Ok(out)
}
