//! Error types for the lease monitor.
//!
//! All fallible operations in this crate return [`Result<T>`], which uses
//! the [`Error`] enum for error variants. Only some variants abort a scan;
//! see [`Error::is_scan_fatal`].

use std::path::PathBuf;

/// Errors that can occur while reading dnsmasq state.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The root dnsmasq configuration file is missing or unreadable.
    ///
    /// Fatal to a scan. The previously published snapshot stays in place.
    #[error("dnsmasq configuration {} not readable: {source}", path.display())]
    ConfigNotFound {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A required directive is missing from the configuration tree.
    ///
    /// Recoverable: the scan continues with whatever data is available
    /// (for example, pools without leases when no lease file is declared).
    #[error("dnsmasq configuration incomplete: {0}")]
    ConfigIncomplete(String),

    /// One fragment file or fragment directory could not be read.
    ///
    /// That source is skipped; the scan continues.
    #[error("configuration fragment {} not readable: {source}", path.display())]
    FragmentUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// One malformed line or directive was skipped.
    #[error("{origin}:{line}: skipped: {reason}")]
    ParseSkipped {
        origin: String,
        line: usize,
        reason: String,
    },

    /// The lease file could not be read.
    ///
    /// Fatal to that scan only; queries keep serving the last good snapshot.
    #[error("lease file {} not readable: {source}", path.display())]
    LeaseFileUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Invalid service configuration.
    ///
    /// Returned by [`Config::validate`](crate::Config::validate).
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// File system I/O error outside of the scan pipeline.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A blocking scan task panicked or was cancelled.
    #[error("scan task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl Error {
    /// Returns true if this error aborts a whole scan rather than one entry.
    pub fn is_scan_fatal(&self) -> bool {
        matches!(
            self,
            Error::ConfigNotFound { .. } | Error::LeaseFileUnreadable { .. } | Error::Task(_)
        )
    }
}

/// A specialized Result type for lease monitor operations.
pub type Result<T> = std::result::Result<T, Error>;
