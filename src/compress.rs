//! Pluggable value compression for large cache payloads.
//!
//! The hook is only invoked for values above the cache's configured
//! threshold. Compressed values are self-describing via the gzip magic
//! bytes, so compressed and uncompressed entries can coexist in the store
//! during a rollout and the read path never needs to know which hook
//! wrote a value.

use std::io::{Read, Write};

use anyhow::Context;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::error::DncResult;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// A reversible transform applied to serialized cache values.
pub trait Compressor: Send + Sync {
    fn compress(&self, data: &[u8]) -> DncResult<Vec<u8>>;
}

/// Pass-through hook. The default.
pub struct IdentityCompressor;

impl Compressor for IdentityCompressor {
    fn compress(&self, data: &[u8]) -> DncResult<Vec<u8>> {
        Ok(data.to_vec())
    }
}

/// Gzip hook backed by flate2.
pub struct GzipCompressor;

impl Compressor for GzipCompressor {
    fn compress(&self, data: &[u8]) -> DncResult<Vec<u8>> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).context("gzip write")?;
        Ok(encoder.finish().context("gzip finish")?)
    }
}

/// Undo whatever hook wrote the value: gzip payloads are recognized by
/// their magic bytes, anything else is returned as-is.
pub fn decode(data: &[u8]) -> DncResult<Vec<u8>> {
    if data.len() >= 2 && data[..2] == GZIP_MAGIC {
        let mut decoder = GzDecoder::new(data);
        let mut out = Vec::new();
        decoder.read_to_end(&mut out).context("gzip decode")?;
        Ok(out)
    } else {
        Ok(data.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_round_trip() {
        let data = br#"{"phone_number":"+14155551234"}"#;
        let out = IdentityCompressor.compress(data).unwrap();
        assert_eq!(out, data);
        assert_eq!(decode(&out).unwrap(), data);
    }

    #[test]
    fn test_gzip_round_trip() {
        let data = vec![b'a'; 4096];
        let compressed = GzipCompressor.compress(&data).unwrap();
        assert!(compressed.len() < data.len());
        assert_eq!(compressed[..2], GZIP_MAGIC);
        assert_eq!(decode(&compressed).unwrap(), data);
    }

    #[test]
    fn test_mixed_entries_coexist() {
        // A raw JSON value must pass through decode untouched even when a
        // gzip hook is installed for writes.
        let raw = br#"{"k":"v"}"#;
        assert_eq!(decode(raw).unwrap(), raw);
    }
}
