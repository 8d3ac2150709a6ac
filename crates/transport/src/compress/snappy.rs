// SPDX-License-Identifier: Apache-2.0

//! Snappy message compression.

use super::{CompressorCounters, CompressorId, MessageCompressor};
use crate::error::Error;

/// Snappy raw-format compressor (wire id 1).
#[derive(Debug, Default)]
pub struct SnappyMessageCompressor {
    counters: CompressorCounters,
}

impl SnappyMessageCompressor {
    /// Creates the compressor.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl MessageCompressor for SnappyMessageCompressor {
    fn id(&self) -> CompressorId {
        CompressorId::Snappy
    }

    fn name(&self) -> &'static str {
        "snappy"
    }

    fn max_compressed_size(&self, input_len: usize) -> usize {
        snap::raw::max_compress_len(input_len)
    }

    fn compress(&self, input: &[u8], output: &mut [u8]) -> Result<usize, Error> {
        if output.len() < self.max_compressed_size(input.len()) {
            return Err(Error::InternalError {
                message: "output too small for max size of compressed input".to_string(),
            });
        }
        let written = snap::raw::Encoder::new()
            .compress(input, output)
            .map_err(|e| Error::InternalError {
                message: format!("snappy compression failed: {e}"),
            })?;
        self.counters.hit_compress(input.len(), written);
        Ok(written)
    }

    fn decompress(&self, input: &[u8], output: &mut [u8]) -> Result<usize, Error> {
        let expected = snap::raw::decompress_len(input).map_err(|e| {
            Error::InvalidCompressedMessage {
                reason: format!("snappy length probe failed: {e}"),
            }
        })?;
        if expected != output.len() {
            return Err(Error::InvalidCompressedMessage {
                reason: format!(
                    "snappy frame decodes to {expected} bytes but advertises {}",
                    output.len()
                ),
            });
        }
        let written = snap::raw::Decoder::new()
            .decompress(input, output)
            .map_err(|e| Error::InvalidCompressedMessage {
                reason: format!("snappy decompression failed: {e}"),
            })?;
        self.counters.hit_decompress(input.len(), written);
        Ok(written)
    }

    fn counters(&self) -> &CompressorCounters {
        &self.counters
    }
}
