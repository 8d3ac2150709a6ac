// SPDX-License-Identifier: Apache-2.0

//! Zlib message compression.

use super::{CompressorCounters, CompressorId, MessageCompressor};
use crate::error::Error;
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

/// Zlib (deflate) compressor (wire id 2), default compression level.
#[derive(Debug, Default)]
pub struct ZlibMessageCompressor {
    counters: CompressorCounters,
}

impl ZlibMessageCompressor {
    /// Creates the compressor.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl MessageCompressor for ZlibMessageCompressor {
    fn id(&self) -> CompressorId {
        CompressorId::Zlib
    }

    fn name(&self) -> &'static str {
        "zlib"
    }

    fn max_compressed_size(&self, input_len: usize) -> usize {
        // deflateBound: worst case is stored blocks plus the zlib wrapper.
        input_len + input_len / 1_000 + 64
    }

    fn compress(&self, input: &[u8], output: &mut [u8]) -> Result<usize, Error> {
        let mut state = Compress::new(Compression::default(), true);
        let status = state
            .compress(input, output, FlushCompress::Finish)
            .map_err(|e| Error::InternalError {
                message: format!("zlib compression failed: {e}"),
            })?;
        if status != Status::StreamEnd {
            return Err(Error::InternalError {
                message: "output too small for max size of compressed input".to_string(),
            });
        }
        let written = usize::try_from(state.total_out()).unwrap_or(usize::MAX);
        self.counters.hit_compress(input.len(), written);
        Ok(written)
    }

    fn decompress(&self, input: &[u8], output: &mut [u8]) -> Result<usize, Error> {
        let mut state = Decompress::new(true);
        let status = state
            .decompress(input, output, FlushDecompress::Finish)
            .map_err(|e| Error::InvalidCompressedMessage {
                reason: format!("zlib decompression failed: {e}"),
            })?;
        let written = usize::try_from(state.total_out()).unwrap_or(usize::MAX);
        if status != Status::StreamEnd || written != output.len() {
            return Err(Error::InvalidCompressedMessage {
                reason: format!(
                    "zlib frame decodes to {written} bytes but advertises {}",
                    output.len()
                ),
            });
        }
        self.counters.hit_decompress(input.len(), written);
        Ok(written)
    }

    fn counters(&self) -> &CompressorCounters {
        &self.counters
    }
}
