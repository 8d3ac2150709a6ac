// SPDX-License-Identifier: Apache-2.0

//! Configuration errors.

/// All errors that can occur while loading or validating configuration.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The configuration file could not be read.
    #[error("failed to read config file `{path}`: {source}")]
    Io {
        /// The offending path.
        path: String,

        /// The underlying OS error.
        source: std::io::Error,
    },

    /// The configuration document could not be parsed.
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// A field carries a value outside its accepted range.
    #[error("invalid config value for `{field}`: {reason}")]
    Invalid {
        /// The offending field, dotted-path style.
        field: &'static str,

        /// Why the value was rejected.
        reason: String,
    },
}
