// SPDX-License-Identifier: Apache-2.0

//! Errors for the transport layer.

/// All errors that can occur in the transport layer.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// An I/O failure on a session. Fatal to that session only.
    #[error("socket error: {message}: {source}")]
    Socket {
        /// What the session was doing when the socket failed.
        message: String,

        /// The underlying OS error.
        source: std::io::Error,
    },

    /// The remote side closed the connection.
    #[error("session closed by remote")]
    SessionClosed,

    /// A frame violated the message format.
    #[error("invalid message: {reason}")]
    InvalidMessage {
        /// Why the frame was rejected.
        reason: String,
    },

    /// A frame exceeded the maximum message size.
    #[error("message of {size} bytes exceeds maximum of {max}")]
    MessageTooLarge {
        /// The advertised frame length.
        size: usize,
        /// The compile-time maximum.
        max: usize,
    },

    /// A compressed message failed to decompress cleanly. Fatal to the
    /// session.
    #[error("compressed message was invalid or corrupted: {reason}")]
    InvalidCompressedMessage {
        /// Why decompression failed.
        reason: String,
    },

    /// A compressor name that is not known or not enabled.
    #[error("unknown or disabled network message compressor: {name}")]
    UnknownCompressorName {
        /// The offending name.
        name: String,
    },

    /// A compressor id that is not known or not enabled.
    #[error("unknown network message compressor id: {id}")]
    UnknownCompressorId {
        /// The offending wire id.
        id: u8,
    },

    /// An asynchronous operation was cancelled by a session close, a
    /// timer cancellation, or shutdown.
    #[error("callback was cancelled")]
    CallbackCancelled,

    /// A request handler failed; the session ends.
    #[error("request handler error: {message}")]
    Handler {
        /// The handler's description of the failure.
        message: String,
    },

    /// A wrapper for executor errors.
    #[error("executor error: {0}")]
    Executor(#[from] finchdb_executor::Error),

    /// An internal error in the transport layer.
    #[error("internal error: {message}")]
    InternalError {
        /// An internal error message.
        message: String,
    },
}

impl Error {
    /// Builds a [`Error::Socket`] with context.
    pub fn socket(message: impl Into<String>, source: std::io::Error) -> Self {
        Error::Socket {
            message: message.into(),
            source,
        }
    }
}
