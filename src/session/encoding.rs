use std::io::{Read, Write};

use bytes::Bytes;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::error::ExtProcError;
use crate::headers::HeaderSnapshot;

/// Whether the body is gzip-encoded.
#[must_use]
pub fn is_gzip(headers: &HeaderSnapshot) -> bool {
    headers
        .get("content-encoding")
        .is_some_and(|v| v.trim().eq_ignore_ascii_case("gzip"))
}

/// # Errors
///
/// Returns [`ExtProcError::Decompression`] for a corrupt stream.
pub fn decompress_gzip(body: &[u8]) -> Result<Bytes, ExtProcError> {
    let mut decoder = GzDecoder::new(body);
    let mut decompressed = Vec::new();
    decoder
        .read_to_end(&mut decompressed)
        .map_err(|e| ExtProcError::Decompression(format!("gzip decompression failed: {e}")))?;
    Ok(Bytes::from(decompressed))
}

/// # Errors
///
/// Returns [`ExtProcError::Internal`] if the encoder fails.
pub fn compress_gzip(body: &[u8]) -> Result<Bytes, ExtProcError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
    encoder
        .write_all(body)
        .and_then(|()| encoder.finish())
        .map(Bytes::from)
        .map_err(|e| ExtProcError::Internal(format!("gzip compression failed: {e}")))
}
