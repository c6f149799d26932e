//! Error types for configuration loading, merging, and trust sealing.

use std::path::PathBuf;
use thiserror::Error;

/// Errors produced by the configuration subsystem.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A configuration layer exists but could not be read or parsed.
    ///
    /// Surfaced as a warning during merge unless the failed layer was the
    /// only available source, in which case startup fails.
    #[error("failed to parse {path}: {detail}")]
    Parse { path: PathBuf, detail: String },

    /// A URL failed the secure-URL policy.
    #[error("insecure URL in {field}: {url} ({reason})")]
    InsecureUrl {
        field: String,
        url: String,
        reason: String,
    },

    /// A raw server entry could not be narrowed into a [`ServerSpec`].
    ///
    /// [`ServerSpec`]: crate::spec::ServerSpec
    #[error("invalid server spec '{name}': {detail}")]
    InvalidSpec { name: String, detail: String },

    /// The home scope is required for this operation but `ICA_HOME` is not
    /// set or does not point at a directory.
    #[error("home scope unavailable: {0}")]
    HomeUnavailable(String),

    /// Reading or writing the trust file failed.
    #[error("trust store I/O failed for {path}: {source}")]
    TrustIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, ConfigError>;
