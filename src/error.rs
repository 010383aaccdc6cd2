//! Error types shared by every layer of the store: the raw byte [`crate::storage::engine::Engine`],
//! the MVCC layer built on top of it, and the lease/watch/transaction subsystems.

use std::fmt;

/// The result type returned by (almost) every fallible operation in this crate.
pub type CResult<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    /// Wraps an underlying I/O failure from a backend (file locking, reads, writes).
    Io(std::io::Error),

    /// Malformed or unexpected internal state; usually points at a bug rather than bad input.
    Internal(String),

    /// A stored row failed to decode.
    Parse(String),

    /// Value-level inconsistency surfaced by a backend (e.g. a rename during compaction).
    Value(String),

    /// `put` referenced a lease id that does not exist, or has expired and been swept.
    LeaseNotFound(String),

    /// `grant_lease` was asked for a ttl of zero, a negative ttl, or one above the policy cap.
    InvalidTtl(String),

    /// A historical read targeted a revision at or below `compacted_revision` whose
    /// backing record no longer exists.
    CompactedOutOfRange { requested: u64, compacted: u64 },

    /// `compact` was asked to advance past `current_revision`.
    FutureRevision { requested: u64, current: u64 },

    /// The storage backend failed to persist a write; the caller's operation is
    /// considered to have not happened.
    Backend(String),

    /// A malformed argument reached the API boundary (empty key, bad compare op, ...).
    InvalidArgument(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {e}"),
            Error::Internal(s) => write!(f, "internal error: {s}"),
            Error::Parse(s) => write!(f, "parse error: {s}"),
            Error::Value(s) => write!(f, "value error: {s}"),
            Error::LeaseNotFound(id) => write!(f, "lease not found: {id}"),
            Error::InvalidTtl(s) => write!(f, "invalid ttl: {s}"),
            Error::CompactedOutOfRange { requested, compacted } => write!(
                f,
                "requested revision {requested} has been compacted (compacted_revision={compacted})"
            ),
            Error::FutureRevision { requested, current } => write!(
                f,
                "cannot compact at revision {requested}, which is ahead of current revision {current}"
            ),
            Error::Backend(s) => write!(f, "backend error: {s}"),
            Error::InvalidArgument(s) => write!(f, "invalid argument: {s}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Parse(e.to_string())
    }
}
