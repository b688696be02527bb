//! Error taxonomy.
//!
//! Pure data errors ([`FormatError`]) surface to the direct caller.
//! Infrastructure errors ([`LookupError`], [`PersistenceError`]) are recovered
//! locally wherever the check pipeline can fail open without security impact;
//! [`MigrationError`] is fatal at startup.

use thiserror::Error;

/// Malformed CIDR or address text. Rejected at the boundary, never coerced.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormatError {
    #[error("malformed address or CIDR text {0:?}")]
    Malformed(String),

    #[error("prefix length /{0} is out of range for IPv4")]
    PrefixOutOfRange(u8),

    #[error("{text:?} has host bits set beyond the /{prefix} prefix")]
    HostBitsSet { text: String, prefix: u8 },
}

/// Failure talking to the external reputation API.
///
/// The pipeline degrades these to a non-blocking `LookupFailed` outcome; they
/// are never retried automatically.
#[derive(Debug, Error)]
pub enum LookupError {
    #[error("HTTP error: {0}")]
    Http(reqwest::Error),

    #[error("request timed out")]
    Timeout,

    #[error("rate limited by the reputation API")]
    RateLimited,

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl From<reqwest::Error> for LookupError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            LookupError::Timeout
        } else {
            LookupError::Http(e)
        }
    }
}

/// Backend read/write failure.
///
/// Reads degrade to the next-cheapest data source; exemption mutations surface
/// this to the caller since exemption state is security relevant.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("mysql error: {0}")]
    MySql(#[from] mysql::Error),

    #[error("mongodb error: {0}")]
    Mongo(#[from] mongodb::error::Error),

    #[error("backend connection is closed")]
    Closed,

    #[error("{0}")]
    Other(String),
}

/// A schema migration step failed. Aborts initialization of that backend.
#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("migration v{version} failed: {source}")]
    StepFailed {
        version: u32,
        #[source]
        source: PersistenceError,
    },

    #[error("migration v{version} failed and rollback also failed: {rollback}")]
    RollbackFailed {
        version: u32,
        rollback: PersistenceError,
    },

    #[error("stored range {0:?} could not be parsed")]
    CorruptRange(String),
}
