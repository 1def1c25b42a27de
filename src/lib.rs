//! The core of the rift version-control system: a content-addressed object store, a reference
//! table updated by compare-and-swap, the transaction log that journals it, and a read-side view
//! of the commit graph.

#[cfg(test)]
mod test;

pub mod digest;
pub mod error;
pub mod filemode;
pub mod history;
pub mod lock;
pub mod object;
pub mod options;
pub mod refs;
pub mod repo;
pub mod revision;
pub mod store;
pub mod timestamp;
pub mod txlog;
mod util;

pub use crate::digest::Digest;
pub use crate::error::{Error, Result};
pub use crate::history::{Cancel, HistoryGraph};
pub use crate::object::{Blob, Commit, Object, ObjectKind, Signature, Storable, Tree};
pub use crate::options::Options;
pub use crate::refs::{RefName, RefTable};
pub use crate::repo::Repo;
pub use crate::revision::Rev;
pub use crate::store::ObjectStore;
pub use crate::txlog::{Lsn, RefUpdate, TransactionLog};
