//! The three immutable object kinds and their canonical serialization.
//!
//! Every object is framed as `"{kind} {len}\0{payload}"` before hashing, e.g. a blob
//! `"hello\n"` becomes `"blob 6\0hello\n"`. The digest of the framed bytes is the object's
//! identity, so the kind tag is part of it.

pub mod blob;
pub mod commit;
pub mod tree;

use std::fmt::Display;
use std::str::FromStr;

pub use blob::Blob;
pub use commit::{Commit, Signature};
pub use tree::{Tree, TreeEntry};

use crate::digest::Digest;
use crate::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Blob,
    Tree,
    Commit,
}

impl ObjectKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ObjectKind::Blob => "blob",
            ObjectKind::Tree => "tree",
            ObjectKind::Commit => "commit",
        }
    }

    fn from_bytes(bytes: &[u8]) -> Option<Self> {
        match bytes {
            b"blob" => Some(ObjectKind::Blob),
            b"tree" => Some(ObjectKind::Tree),
            b"commit" => Some(ObjectKind::Commit),
            _ => None,
        }
    }
}

impl Display for ObjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ObjectKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::from_bytes(s.as_bytes()).ok_or_else(|| format!("unknown object kind: {s}"))
    }
}

pub trait Storable: Sized {
    const KIND: ObjectKind;

    /// The serialized payload, without the framing header.
    fn payload(&self) -> Vec<u8>;

    /// Parse a payload read back from the store. `digest` is only used for error context.
    fn parse(payload: &[u8], digest: &Digest) -> Result<Self>;

    /// The framed bytes, `"{type} {len}\0{payload}"`.
    fn formatted(&self) -> Vec<u8> {
        frame(Self::KIND, &self.payload())
    }

    fn digest(&self) -> Digest {
        Digest::new(&self.formatted())
    }
}

/// The canonical serialized form of an object, `"{kind} {len}\0{payload}"`. Its hash is the
/// object's digest.
pub fn frame(kind: ObjectKind, payload: &[u8]) -> Vec<u8> {
    let mut formatted = Vec::with_capacity(payload.len() + 16);
    formatted.extend_from_slice(kind.as_str().as_bytes());
    formatted.push(b' ');
    formatted.extend_from_slice(payload.len().to_string().as_bytes());
    formatted.push(b'\0');
    formatted.extend_from_slice(payload);
    formatted
}

/// Split framed bytes into their kind and payload, checking the declared length.
pub(crate) fn unframe<'a>(bytes: &'a [u8], digest: &Digest) -> Result<(ObjectKind, &'a [u8])> {
    let space_idx =
        memchr::memchr(b' ', bytes).ok_or_else(|| Error::corrupt(digest, "missing header"))?;
    let nul_idx =
        memchr::memchr(b'\0', bytes).ok_or_else(|| Error::corrupt(digest, "missing header"))?;
    if nul_idx < space_idx {
        return Err(Error::corrupt(digest, "malformed header"));
    }

    let kind = ObjectKind::from_bytes(&bytes[..space_idx])
        .ok_or_else(|| Error::corrupt(digest, "unknown object kind"))?;

    let len = std::str::from_utf8(&bytes[space_idx + 1..nul_idx])
        .ok()
        .and_then(|len| len.parse::<usize>().ok())
        .ok_or_else(|| Error::corrupt(digest, "malformed length"))?;

    let payload = &bytes[nul_idx + 1..];
    if payload.len() != len {
        return Err(Error::corrupt(
            digest,
            format!("declared length {len}, found {}", payload.len()),
        ));
    }

    Ok((kind, payload))
}

/// An object read back from the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Object {
    Blob(Blob),
    Tree(Tree),
    Commit(Commit),
}

impl Object {
    pub(crate) fn parse(kind: ObjectKind, payload: &[u8], digest: &Digest) -> Result<Self> {
        Ok(match kind {
            ObjectKind::Blob => Object::Blob(Blob::parse(payload, digest)?),
            ObjectKind::Tree => Object::Tree(Tree::parse(payload, digest)?),
            ObjectKind::Commit => Object::Commit(Commit::parse(payload, digest)?),
        })
    }

    pub fn kind(&self) -> ObjectKind {
        match self {
            Object::Blob(_) => ObjectKind::Blob,
            Object::Tree(_) => ObjectKind::Tree,
            Object::Commit(_) => ObjectKind::Commit,
        }
    }

    pub fn payload(&self) -> Vec<u8> {
        match self {
            Object::Blob(blob) => blob.payload(),
            Object::Tree(tree) => tree.payload(),
            Object::Commit(commit) => commit.payload(),
        }
    }

    pub fn into_commit(self) -> Option<Commit> {
        if let Self::Commit(v) = self {
            Some(v)
        } else {
            None
        }
    }

    pub fn into_tree(self) -> Option<Tree> {
        if let Self::Tree(v) = self {
            Some(v)
        } else {
            None
        }
    }

    pub fn into_blob(self) -> Option<Blob> {
        if let Self::Blob(v) = self {
            Some(v)
        } else {
            None
        }
    }
}
