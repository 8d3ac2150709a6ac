// SPDX-License-Identifier: Apache-2.0

//! Wire-message compression.
//!
//! Compressors are process-wide singletons held by the
//! [`registry::CompressorRegistry`]; each session negotiates a subset
//! through its [`manager::CompressionManager`]. Post-negotiation, each
//! compressible message is wrapped in a compressed frame carrying the
//! original op code, the uncompressed size, and the compressor id.

pub mod manager;
pub mod noop;
pub mod registry;
pub mod snappy;
pub mod zlib;

pub use manager::CompressionManager;
pub use registry::CompressorRegistry;

use crate::error::Error;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Wire identifiers for message compressors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum CompressorId {
    /// Identity "compression".
    Noop = 0,
    /// Snappy.
    Snappy = 1,
    /// Zlib (deflate).
    Zlib = 2,
    /// Reserved for future extension.
    Extended = 255,
}

/// Byte counters every compressor maintains, split by direction.
#[derive(Debug, Default)]
pub struct CompressorCounters {
    compressor_bytes_in: AtomicU64,
    compressor_bytes_out: AtomicU64,
    decompressor_bytes_in: AtomicU64,
    decompressor_bytes_out: AtomicU64,
}

/// One direction of a compressor's counters, as serialized into the
/// stats document.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectionStats {
    /// Bytes fed in.
    pub bytes_in: u64,
    /// Bytes produced.
    pub bytes_out: u64,
}

/// Snapshot of a compressor's counters.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct CompressorStats {
    /// Compression direction.
    pub compressor: DirectionStats,
    /// Decompression direction.
    pub decompressor: DirectionStats,
}

impl CompressorCounters {
    /// Bumps the compression-direction counters.
    pub fn hit_compress(&self, bytes_in: usize, bytes_out: usize) {
        let _ = self
            .compressor_bytes_in
            .fetch_add(bytes_in as u64, Ordering::Relaxed);
        let _ = self
            .compressor_bytes_out
            .fetch_add(bytes_out as u64, Ordering::Relaxed);
    }

    /// Bumps the decompression-direction counters.
    pub fn hit_decompress(&self, bytes_in: usize, bytes_out: usize) {
        let _ = self
            .decompressor_bytes_in
            .fetch_add(bytes_in as u64, Ordering::Relaxed);
        let _ = self
            .decompressor_bytes_out
            .fetch_add(bytes_out as u64, Ordering::Relaxed);
    }

    /// Takes a relaxed snapshot for the stats document.
    #[must_use]
    pub fn snapshot(&self) -> CompressorStats {
        CompressorStats {
            compressor: DirectionStats {
                bytes_in: self.compressor_bytes_in.load(Ordering::Relaxed),
                bytes_out: self.compressor_bytes_out.load(Ordering::Relaxed),
            },
            decompressor: DirectionStats {
                bytes_in: self.decompressor_bytes_in.load(Ordering::Relaxed),
                bytes_out: self.decompressor_bytes_out.load(Ordering::Relaxed),
            },
        }
    }
}

/// A message compressor implementation.
///
/// `compress`/`decompress` operate on caller-provided output slices and
/// return the number of bytes produced. `max_compressed_size` tells the
/// caller how big an output buffer to allocate.
pub trait MessageCompressor: Send + Sync {
    /// The compressor's wire id.
    fn id(&self) -> CompressorId;

    /// The compressor's negotiation name (`"noop"`, `"snappy"`, `"zlib"`).
    fn name(&self) -> &'static str;

    /// Upper bound on the compressed size of `input_len` bytes.
    fn max_compressed_size(&self, input_len: usize) -> usize;

    /// Compresses `input` into `output`, returning the bytes written.
    fn compress(&self, input: &[u8], output: &mut [u8]) -> Result<usize, Error>;

    /// Decompresses `input` into `output`, which must be exactly the
    /// advertised uncompressed size. Returns the bytes written and fails
    /// with [`Error::InvalidCompressedMessage`] on any mismatch.
    fn decompress(&self, input: &[u8], output: &mut [u8]) -> Result<usize, Error>;

    /// The compressor's byte counters.
    fn counters(&self) -> &CompressorCounters;
}
