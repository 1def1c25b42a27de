//! Error types for the core.
//!
//! Every fallible operation in the library returns [`Error`]. The binary maps the variants to
//! exit codes (see [`Error::exit_code`]), keeping `Corrupt` distinct from `NotFound` since one
//! means on-disk damage and the other plain absence.

use camino::Utf8PathBuf;
use thiserror::Error;

use crate::digest::Digest;
use crate::object::ObjectKind;
use crate::refs::RefName;
use crate::txlog::Lsn;

#[derive(Debug, Error)]
pub enum Error {
    /// No object with this digest is stored.
    #[error("object not found: {0:x}")]
    NotFound(Digest),

    /// The object exists, but is not of the requested kind.
    #[error("object {digest:x} is a {actual}, expected a {expected}")]
    KindMismatch {
        digest: Digest,
        expected: ObjectKind,
        actual: ObjectKind,
    },

    /// The stored bytes fail the integrity check.
    #[error("object {digest:x} is corrupt: {reason}")]
    Corrupt { digest: Digest, reason: String },

    /// A compare-and-swap lost against another writer, or its expected value was stale.
    #[error("conflicting update of {name}: expected {}, found {}", show(.expected), show(.actual))]
    Conflict {
        name: RefName,
        expected: Option<Digest>,
        actual: Option<Digest>,
    },

    #[error("reference already exists: {0}")]
    AlreadyExists(RefName),

    /// A history query hit a missing or damaged commit.
    #[error("incomplete history at {digest:x}: {source}")]
    IncompleteHistory {
        digest: Digest,
        #[source]
        source: Box<Error>,
    },

    /// Compaction would drop a log entry that has not been confirmed as applied.
    #[error("unsafe to truncate: entry {0} is not confirmed as applied")]
    Unsafe(Lsn),

    #[error("traversal cancelled")]
    Cancelled,

    #[error("cannot fast-forward {name} from {from:x} to {to:x}")]
    NotFastForward {
        name: RefName,
        from: Digest,
        to: Digest,
    },

    /// A reference file holds something other than a digest.
    #[error("reference {name} is corrupt: {reason}")]
    CorruptRef { name: RefName, reason: String },

    #[error("invalid ref name: {0:?}")]
    InvalidRefName(String),

    #[error("invalid revision: {0:?}")]
    InvalidRevision(String),

    #[error("ambiguous revision {prefix:?}: matches {} objects", .candidates.len())]
    AmbiguousRevision {
        prefix: String,
        candidates: Vec<Digest>,
    },

    #[error("invalid tree entry: {0}")]
    InvalidTreeEntry(String),

    #[error("transaction log is corrupt at line {line}: {reason}")]
    CorruptLog { line: usize, reason: String },

    #[error("not a rift repository: {0}")]
    NotARepository(Utf8PathBuf),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

fn show(digest: &Option<Digest>) -> String {
    match digest {
        Some(digest) => digest.to_hex(),
        None => "nothing".to_owned(),
    }
}

impl Error {
    pub(crate) fn corrupt(digest: &Digest, reason: impl Into<String>) -> Self {
        Self::Corrupt {
            digest: digest.clone(),
            reason: reason.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict { .. } | Error::AlreadyExists(_))
    }

    /// Whether re-reading the current state and trying again can succeed.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Error::Conflict { .. })
    }

    /// Process exit code used by the command-line front end.
    pub fn exit_code(&self) -> u8 {
        match self {
            Error::NotFound(_) => 2,
            Error::KindMismatch { .. } => 3,
            Error::Corrupt { .. } | Error::CorruptRef { .. } | Error::CorruptLog { .. } => 4,
            Error::Conflict { .. } | Error::NotFastForward { .. } => 5,
            Error::AlreadyExists(_) => 6,
            Error::IncompleteHistory { .. } => 7,
            Error::Unsafe(_) => 8,
            _ => 1,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
