//! Snappy compression policy for mutation payloads.

use crate::error::{CoreError, Result};

/// Default minimum payload size before compression is attempted.
pub const DEFAULT_MIN_SIZE: usize = 32;

/// Default maximum compressed/original ratio for the compressed form to be used.
pub const DEFAULT_MIN_RATIO: f64 = 0.83;

/// Compression policy applied to compressible mutation requests.
#[derive(Debug, Clone)]
pub struct CompressionConfig {
    enabled: bool,
    min_size: usize,
    min_ratio: f64,
}

impl CompressionConfig {
    /// Creates a new compression configuration.
    pub fn new(enabled: bool, min_size: usize, min_ratio: f64) -> Self {
        Self {
            enabled,
            min_size,
            min_ratio,
        }
    }

    /// Creates a configuration with compression disabled.
    pub fn disabled() -> Self {
        Self::new(false, DEFAULT_MIN_SIZE, DEFAULT_MIN_RATIO)
    }

    /// Returns true if compression is enabled.
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Returns the minimum payload size for compression to be attempted.
    pub fn min_size(&self) -> usize {
        self.min_size
    }

    /// Returns the maximum accepted compressed/original size ratio.
    pub fn min_ratio(&self) -> f64 {
        self.min_ratio
    }
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self::new(true, DEFAULT_MIN_SIZE, DEFAULT_MIN_RATIO)
    }
}

/// Attempts to compress the payload under the given policy.
///
/// Returns `Some(compressed)` only when the policy allows compression for
/// this payload and the compressed form is small enough to be worth sending.
/// Callers set the SNAPPY datatype bit iff this returns `Some`.
pub fn maybe_compress(payload: &[u8], config: &CompressionConfig) -> Option<Vec<u8>> {
    if !config.enabled || payload.len() < config.min_size {
        return None;
    }

    let compressed = snap::raw::Encoder::new().compress_vec(payload).ok()?;
    let ratio = compressed.len() as f64 / payload.len() as f64;
    if ratio <= config.min_ratio {
        Some(compressed)
    } else {
        None
    }
}

/// Decompresses a Snappy-compressed response body.
pub fn decompress(body: &[u8]) -> Result<Vec<u8>> {
    snap::raw::Decoder::new()
        .decompress_vec(body)
        .map_err(|e| CoreError::Protocol(format!("snappy decompression failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compresses_redundant_payload() {
        let config = CompressionConfig::new(true, 32, 0.83);
        let payload = vec![0u8; 64];

        let compressed = maybe_compress(&payload, &config).expect("should compress");
        assert!(compressed.len() < 64);
    }

    #[test]
    fn test_below_min_size_not_compressed() {
        let config = CompressionConfig::new(true, 32, 0.83);
        let payload = vec![0u8; 20];

        assert!(maybe_compress(&payload, &config).is_none());
    }

    #[test]
    fn test_poor_ratio_not_compressed() {
        let config = CompressionConfig::new(true, 32, 0.83);
        // Snappy cannot squeeze an incompressible sequence below 83%.
        let payload: Vec<u8> = (0..64u32)
            .map(|i| (i.wrapping_mul(2654435761) >> 13) as u8)
            .collect();

        assert!(maybe_compress(&payload, &config).is_none());
    }

    #[test]
    fn test_disabled_never_compresses() {
        let config = CompressionConfig::disabled();
        let payload = vec![0u8; 4096];

        assert!(maybe_compress(&payload, &config).is_none());
    }

    #[test]
    fn test_roundtrip() {
        let config = CompressionConfig::default();
        let payload = b"abcabcabcabcabcabcabcabcabcabcabcabc".repeat(4);

        let compressed = maybe_compress(&payload, &config).expect("should compress");
        let restored = decompress(&compressed).unwrap();
        assert_eq!(restored, payload);
    }

    #[test]
    fn test_decompress_garbage_fails() {
        assert!(decompress(&[0xff, 0xff, 0xff, 0xff]).is_err());
    }
}
