// SPDX-License-Identifier: Apache-2.0

//! Errors for the admin HTTP server.

/// All errors that can occur while serving the admin endpoints.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The configured bind address could not be parsed.
    #[error("invalid admin bind address `{bind_address}`: {details}")]
    InvalidBindAddress {
        /// The configured address.
        bind_address: String,

        /// Parser detail.
        details: String,
    },

    /// The listener could not bind.
    #[error("failed to bind admin endpoint on `{addr}`: {details}")]
    BindFailed {
        /// The resolved address.
        addr: String,

        /// OS detail.
        details: String,
    },

    /// The server failed while serving requests.
    #[error("admin server error on `{addr}`: {details}")]
    ServerError {
        /// The resolved address.
        addr: String,

        /// Server detail.
        details: String,
    },
}
