// SPDX-License-Identifier: Apache-2.0

//! The identity compressor.

use super::{CompressorCounters, CompressorId, MessageCompressor};
use crate::error::Error;

/// Copies its input unchanged. Useful for testing the compression plumbing
/// without paying for a codec.
#[derive(Debug, Default)]
pub struct NoopMessageCompressor {
    counters: CompressorCounters,
}

impl NoopMessageCompressor {
    /// Creates the compressor.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl MessageCompressor for NoopMessageCompressor {
    fn id(&self) -> CompressorId {
        CompressorId::Noop
    }

    fn name(&self) -> &'static str {
        "noop"
    }

    fn max_compressed_size(&self, input_len: usize) -> usize {
        input_len
    }

    fn compress(&self, input: &[u8], output: &mut [u8]) -> Result<usize, Error> {
        if output.len() < input.len() {
            return Err(Error::InternalError {
                message: "output too small for noop compression".to_string(),
            });
        }
        output[..input.len()].copy_from_slice(input);
        self.counters.hit_compress(input.len(), input.len());
        Ok(input.len())
    }

    fn decompress(&self, input: &[u8], output: &mut [u8]) -> Result<usize, Error> {
        if output.len() != input.len() {
            return Err(Error::InvalidCompressedMessage {
                reason: format!(
                    "noop frame carries {} bytes but advertises {}",
                    input.len(),
                    output.len()
                ),
            });
        }
        output.copy_from_slice(input);
        self.counters.hit_decompress(input.len(), input.len());
        Ok(input.len())
    }

    fn counters(&self) -> &CompressorCounters {
        &self.counters
    }
}
