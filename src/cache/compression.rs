//! Gzip Compression Helper
//!
//! Byte-level gzip plus file-to-file codecs used by both storage backends.
//! Bodies are compressed in-process; anything larger than [`INLINE_LIMIT`] is
//! moved to the blocking pool so the runtime workers stay responsive.
//!
//! # Example
//!
//! ```
//! use webcache::cache::compression::GzipCompressor;
//!
//! let gzip = GzipCompressor::new();
//!
//! let data = b"Hello, this is test data that should compress well!";
//! let compressed = gzip.compress(data).unwrap();
//!
//! let decompressed = gzip.decompress(&compressed).unwrap();
//! assert_eq!(decompressed.as_ref(), data);
//! ```

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

use bytes::Bytes;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::error::{Error, Result};

/// Encoding token used in `content-encoding` headers
pub const GZIP: &str = "gzip";

/// Payloads up to this size are (de)compressed on the calling task
pub const INLINE_LIMIT: usize = 16 * 1024;

/// Gzip compressor with a fixed compression level
#[derive(Debug, Clone, Copy)]
pub struct GzipCompressor {
    level: u32,
}

impl GzipCompressor {
    /// Create a compressor with the default level (6)
    pub fn new() -> Self {
        Self { level: 6 }
    }

    /// Create with a custom compression level (0-9)
    pub fn with_level(level: u32) -> Self {
        Self {
            level: level.min(9),
        }
    }

    /// Compression level in use
    pub fn level(&self) -> u32 {
        self.level
    }

    /// Compress a buffer
    pub fn compress(&self, data: &[u8]) -> Result<Bytes> {
        let mut encoder = GzEncoder::new(
            Vec::with_capacity(data.len() / 2 + 32),
            Compression::new(self.level),
        );
        encoder.write_all(data).map_err(compress_error)?;
        encoder.finish().map(Bytes::from).map_err(compress_error)
    }

    /// Decompress a gzip buffer
    pub fn decompress(&self, data: &[u8]) -> Result<Bytes> {
        let mut decoder = GzDecoder::new(data);
        let mut out = Vec::with_capacity(data.len() * 2);
        decoder
            .read_to_end(&mut out)
            .map_err(decompress_error)?;
        Ok(Bytes::from(out))
    }

    /// Decompress at most `limit` bytes. Returns `None` when the decoded
    /// payload would be larger, without expanding the rest of it.
    pub fn decompress_limited(&self, data: &[u8], limit: u64) -> Result<Option<Bytes>> {
        let mut decoder = GzDecoder::new(data).take(limit.saturating_add(1));
        let mut out = Vec::new();
        decoder.read_to_end(&mut out).map_err(decompress_error)?;
        if out.len() as u64 > limit {
            return Ok(None);
        }
        Ok(Some(Bytes::from(out)))
    }

    /// Compress a buffer, offloading large payloads to the blocking pool
    pub async fn compress_async(&self, data: Bytes) -> Result<Bytes> {
        if data.len() <= INLINE_LIMIT {
            return self.compress(&data);
        }
        let this = *self;
        tokio::task::spawn_blocking(move || this.compress(&data)).await?
    }

    /// Decompress a buffer, offloading large payloads to the blocking pool
    pub async fn decompress_async(&self, data: Bytes) -> Result<Bytes> {
        if data.len() <= INLINE_LIMIT {
            return self.decompress(&data);
        }
        let this = *self;
        tokio::task::spawn_blocking(move || this.decompress(&data)).await?
    }

    /// [`Self::decompress_limited`], offloading large payloads to the blocking pool
    pub async fn decompress_limited_async(&self, data: Bytes, limit: u64) -> Result<Option<Bytes>> {
        if data.len() <= INLINE_LIMIT {
            return self.decompress_limited(&data, limit);
        }
        let this = *self;
        tokio::task::spawn_blocking(move || this.decompress_limited(&data, limit)).await?
    }

    /// Gzip `src` into `dst` on the blocking pool. Returns the bytes written.
    pub async fn compress_file(&self, src: &Path, dst: &Path) -> Result<u64> {
        let (src, dst) = (src.to_path_buf(), dst.to_path_buf());
        let level = Compression::new(self.level);
        tokio::task::spawn_blocking(move || -> Result<u64> {
            let mut reader = BufReader::new(File::open(&src)?);
            let mut encoder = GzEncoder::new(BufWriter::new(File::create(&dst)?), level);
            io::copy(&mut reader, &mut encoder).map_err(compress_error)?;
            let mut writer = encoder.finish().map_err(compress_error)?;
            writer.flush()?;
            Ok(writer.get_ref().metadata()?.len())
        })
        .await?
    }

    /// Gunzip `src` into `dst` on the blocking pool. Returns the bytes written.
    pub async fn decompress_file_into(&self, src: &Path, dst: &Path) -> Result<u64> {
        let (src, dst) = (src.to_path_buf(), dst.to_path_buf());
        tokio::task::spawn_blocking(move || -> Result<u64> {
            let mut decoder = GzDecoder::new(BufReader::new(File::open(&src)?));
            let mut writer = BufWriter::new(File::create(&dst)?);
            let written = io::copy(&mut decoder, &mut writer).map_err(decompress_error)?;
            writer.flush()?;
            Ok(written)
        })
        .await?
    }

    /// Read and decompress a gzip file into memory
    pub async fn decompress_file(&self, src: &Path) -> Result<Bytes> {
        let src = src.to_path_buf();
        tokio::task::spawn_blocking(move || -> Result<Bytes> {
            let mut decoder = GzDecoder::new(BufReader::new(File::open(&src)?));
            let mut out = Vec::new();
            decoder.read_to_end(&mut out).map_err(decompress_error)?;
            Ok(Bytes::from(out))
        })
        .await?
    }
}

impl Default for GzipCompressor {
    fn default() -> Self {
        Self::new()
    }
}

fn compress_error(e: io::Error) -> Error {
    Error::CompressionFailed {
        algorithm: GZIP.into(),
        reason: e.to_string(),
    }
}

fn decompress_error(e: io::Error) -> Error {
    Error::DecompressionFailed {
        algorithm: GZIP.into(),
        reason: e.to_string(),
    }
}
