use std::collections::BTreeMap;
use std::io::Write;

use crate::digest::{Digest, DIGEST_LEN};
use crate::filemode::FileMode;
use crate::{Error, Result};

use super::{ObjectKind, Storable};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    mode: FileMode,
    digest: Digest,
}

impl TreeEntry {
    pub fn new(mode: FileMode, digest: Digest) -> Self {
        Self { mode, digest }
    }

    pub fn mode(&self) -> FileMode {
        self.mode
    }

    pub fn kind(&self) -> ObjectKind {
        self.mode.kind()
    }

    pub fn digest(&self) -> &Digest {
        &self.digest
    }
}

/// A directory snapshot. Entries are kept sorted by name, so the serialized form (and with it
/// the digest) does not depend on insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tree {
    entries: BTreeMap<String, TreeEntry>,
}

fn check_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\0']) {
        return Err(Error::InvalidTreeEntry(format!("bad entry name {name:?}")));
    }
    Ok(())
}

impl Tree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace an entry.
    pub fn insert(&mut self, name: impl Into<String>, mode: FileMode, digest: Digest) -> Result<()> {
        let name = name.into();
        check_name(&name)?;
        self.entries.insert(name, TreeEntry::new(mode, digest));
        Ok(())
    }

    pub fn entries(&self) -> &BTreeMap<String, TreeEntry> {
        &self.entries
    }

    pub fn get(&self, name: &str) -> Option<&TreeEntry> {
        self.entries.get(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// One line per entry, `<mode> <kind> <digest>\t<name>`.
    pub fn pretty_print(&self, mut out: impl Write) -> std::io::Result<()> {
        for (name, entry) in &self.entries {
            writeln!(
                out,
                "{:06o} {} {:x}\t{}",
                entry.mode.0,
                entry.kind(),
                entry.digest,
                name
            )?;
        }
        Ok(())
    }
}

impl Storable for Tree {
    const KIND: ObjectKind = ObjectKind::Tree;

    fn payload(&self) -> Vec<u8> {
        let mut data = Vec::new();
        for (name, entry) in self.entries.iter() {
            data.extend_from_slice(format!("{:o}", entry.mode).as_bytes());
            data.push(b' ');
            data.extend_from_slice(name.as_bytes());
            data.push(b'\0');
            data.extend_from_slice(&*entry.digest);
        }
        data
    }

    /// Entries are of the form `<mode> <name>\0<digest>`, with the digest as raw bytes.
    fn parse(mut bytes: &[u8], digest: &Digest) -> Result<Self> {
        let mut entries = BTreeMap::new();
        let mut previous: Option<String> = None;

        while !bytes.is_empty() {
            let space_idx = memchr::memchr(b' ', bytes)
                .ok_or_else(|| Error::corrupt(digest, "tree entry without mode"))?;
            let nul_idx = memchr::memchr(b'\0', bytes)
                .filter(|&idx| idx > space_idx)
                .ok_or_else(|| Error::corrupt(digest, "tree entry without name"))?;

            let mode = std::str::from_utf8(&bytes[..space_idx])
                .ok()
                .and_then(FileMode::from_octal)
                .ok_or_else(|| Error::corrupt(digest, "invalid mode in tree entry"))?;

            let name = std::str::from_utf8(&bytes[space_idx + 1..nul_idx])
                .map_err(|_| Error::corrupt(digest, "invalid utf-8 in tree entry name"))?
                .to_owned();
            check_name(&name).map_err(|e| Error::corrupt(digest, e.to_string()))?;

            let rest = &bytes[nul_idx + 1..];
            if rest.len() < DIGEST_LEN {
                return Err(Error::corrupt(digest, "truncated tree entry"));
            }
            let (oid, rest) = rest.split_at(DIGEST_LEN);
            let oid = Digest::from_slice(oid)
                .ok_or_else(|| Error::corrupt(digest, "truncated tree entry"))?;

            if previous.as_deref().map_or(false, |prev| prev >= name.as_str()) {
                return Err(Error::corrupt(digest, "tree entries out of order"));
            }
            previous = Some(name.clone());

            entries.insert(name, TreeEntry::new(mode, oid));
            bytes = rest;
        }

        Ok(Self { entries })
    }
}
