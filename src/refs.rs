//! The reference table: mutable names pointing at commits.
//!
//! Each reference is one file under `.rift/refs/` holding a hex digest. Updates are
//! compare-and-swap: the writer claims `<ref>.lock`, checks the current value against the
//! expected one, journals the update in the [`TransactionLog`], and only then renames the lock
//! file over the reference. A writer that finds the lock taken, or a stale expected value, gets
//! [`Error::Conflict`] and is expected to re-read and retry on its own terms.

use std::collections::{HashMap, HashSet};
use std::fmt::Display;
use std::io::{ErrorKind, Write};
use std::str::FromStr;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::*;
use walkdir::WalkDir;

use crate::digest::Digest;
use crate::lock::{self, LockedFile};
use crate::txlog::{LogEntry, Lsn, RefUpdate, Record, TransactionLog};
use crate::util;
use crate::{Error, Result};

/// Contains all characters that cannot appear in a ref name.
///
/// In git, the character `'*'` is allowed in ref names if the environment variable
/// `REFNAME_REFSPEC_PATTERN` is set. This feature is unsupported, and such `'*'` is a
/// disallowed character.
///
/// See: <https://github.com/git/git/blob/795ea8776befc95ea2becd8020c7a284677b4161/refs.c#L48-L57>
const DISALLOWED_CHARACTERS: [char; 41] = [
    '\0', '\x01', '\x02', '\x03', '\x04', '\x05', '\x06', '\x07', '\x08', '\t', '\n', '\x0b',
    '\x0c', '\r', '\x0e', '\x0f', '\x10', '\x11', '\x12', '\x13', '\x14', '\x15', '\x16', '\x17',
    '\x18', '\x19', '\x1a', '\x1b', '\x1c', '\x1d', '\x1e', '\x1f', ' ', '*', ':', '?', '[', '\\',
    '^', '~', '\x7f',
];

/// Check whether a string is a valid ref name.
///
/// Disallowed paths are any path where:
/// - it (or any path component) begins with `'.'`
/// - it contains double dots `".."` or an empty component
/// - it contains ASCII control characters
/// - it contains `':'`, `'?'`, `'['`, `'\\'`, `'^'`, `'~'`, `' '`, `'\t'` or `'*'`
/// - it ends with `'/'`
/// - it ends with `".lock"`
/// - it contains `"@{"`
///
/// See: <https://github.com/git/git/blob/795ea8776befc95ea2becd8020c7a284677b4161/refs.c#L59-L77>
pub fn is_valid_ref_name(name: &str) -> bool {
    !(name.is_empty()
        || (name.chars().any(|c| DISALLOWED_CHARACTERS.contains(&c)))
        || name.starts_with('.')
        || name.contains("/.")
        || name.contains("..")
        || name.contains("//")
        || name.ends_with('/')
        || name.ends_with(".lock")
        || name.contains("@{"))
}

/// A full reference name such as `refs/heads/main`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RefName(String);

impl RefName {
    pub const HEADS: &'static str = "refs/heads/";
    pub const TAGS: &'static str = "refs/tags/";

    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if !name.starts_with("refs/") || !is_valid_ref_name(&name) {
            return Err(Error::InvalidRefName(name));
        }
        Ok(Self(name))
    }

    pub fn branch(name: &str) -> Result<Self> {
        Self::new(format!("{}{name}", Self::HEADS))
    }

    pub fn tag(name: &str) -> Result<Self> {
        Self::new(format!("{}{name}", Self::TAGS))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The name without its `refs/heads/` or `refs/tags/` prefix.
    pub fn short(&self) -> &str {
        self.0
            .strip_prefix(Self::HEADS)
            .or_else(|| self.0.strip_prefix(Self::TAGS))
            .unwrap_or(&self.0)
    }
}

impl Display for RefName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for RefName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl AsRef<str> for RefName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// What `.rift/HEAD` points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Head {
    Symbolic(RefName),
    Detached(Digest),
}

/// Outcome of [`RefTable::recover`].
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Recovery {
    /// Updates that had been logged but not published, and were published now.
    pub replayed: Vec<Lsn>,
    /// Updates that had been published, but whose confirmation was missing.
    pub confirmed: Vec<Lsn>,
    /// Updates whose reference has since moved to an unrelated value; left alone.
    pub superseded: Vec<Lsn>,
}

impl Recovery {
    pub fn is_empty(&self) -> bool {
        self.replayed.is_empty() && self.confirmed.is_empty() && self.superseded.is_empty()
    }
}

pub struct RefTable {
    dir: Utf8PathBuf,
    head_path: Utf8PathBuf,
    log: TransactionLog,
    fsync: bool,
}

impl RefTable {
    /// `dir` is the repository directory, the one holding `refs/` and `HEAD`.
    pub fn new(dir: impl AsRef<Utf8Path>, log: TransactionLog, fsync: bool) -> Self {
        let dir = dir.as_ref().to_owned();
        let head_path = dir.join("HEAD");
        Self {
            dir,
            head_path,
            log,
            fsync,
        }
    }

    pub fn log(&self) -> &TransactionLog {
        &self.log
    }

    fn ref_path(&self, name: &RefName) -> Utf8PathBuf {
        self.dir.join(name.as_str())
    }

    fn read_file(path: &Utf8Path, name: &RefName) -> Result<Option<Digest>> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Digest::from_str(contents.trim())
            .map(Some)
            .map_err(|_| Error::CorruptRef {
                name: name.clone(),
                reason: format!("unexpected contents {:?}", contents.trim()),
            })
    }

    /// The current value of `name`, or `None` if it is unbound.
    pub fn read(&self, name: &RefName) -> Result<Option<Digest>> {
        Self::read_file(&self.ref_path(name), name)
    }

    /// Bind `name`, which must currently be unbound.
    pub fn create(&self, name: &RefName, digest: &Digest) -> Result<Lsn> {
        self.swap(
            &RefUpdate {
                name: name.clone(),
                old: None,
                new: Some(digest.clone()),
                message: String::new(),
            },
            true,
        )
    }

    /// Set `name` to `new` if it currently holds `expected` (`None` meaning unbound).
    pub fn compare_and_swap(
        &self,
        name: &RefName,
        expected: Option<&Digest>,
        new: &Digest,
    ) -> Result<Lsn> {
        self.apply(&RefUpdate {
            name: name.clone(),
            old: expected.cloned(),
            new: Some(new.clone()),
            message: String::new(),
        })
    }

    /// Unbind `name` if it currently holds `expected`.
    pub fn delete(&self, name: &RefName, expected: &Digest) -> Result<Lsn> {
        self.apply(&RefUpdate {
            name: name.clone(),
            old: Some(expected.clone()),
            new: None,
            message: String::new(),
        })
    }

    /// Compare-and-swap carrying a message for the log.
    pub fn apply(&self, update: &RefUpdate) -> Result<Lsn> {
        self.swap(update, false)
    }

    fn swap(&self, update: &RefUpdate, creating: bool) -> Result<Lsn> {
        let name = &update.name;
        let path = self.ref_path(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let Some(lock) = LockedFile::try_acquire(&path)? else {
            debug!(%name, "Reference is locked by another writer");
            let actual = self.read(name)?;
            return Err(if creating && actual.is_some() {
                Error::AlreadyExists(name.clone())
            } else {
                Error::Conflict {
                    name: name.clone(),
                    expected: update.old.clone(),
                    actual,
                }
            });
        };

        let current = Self::read_file(&path, name)?;
        if current != update.old {
            return Err(if creating && current.is_some() {
                Error::AlreadyExists(name.clone())
            } else {
                Error::Conflict {
                    name: name.clone(),
                    expected: update.old.clone(),
                    actual: current,
                }
            });
        }

        let lsn = self.log.append(update)?;
        self.publish_logged(lock, update, lsn)?;
        Ok(lsn)
    }

    /// Publish an update already logged as `lsn`, then confirm it.
    ///
    /// If either step fails the reference stays locked, and only recovery decides whether the
    /// update happened.
    fn publish_logged(&self, lock: LockedFile, update: &RefUpdate, lsn: Lsn) -> Result<()> {
        let name = &update.name;
        let path = lock.guarded_path().to_owned();

        if let Err(error) = self.publish(lock, update.new.as_ref()) {
            warn!(%name, %lsn, %error, "Could not publish reference update");
            self.fence(&path, lsn);
            return Err(error);
        }

        if let Err(error) = self.log.mark_applied(lsn) {
            warn!(%name, %lsn, %error, "Could not confirm reference update");
            self.fence(&path, lsn);
        }

        debug!(%name, %lsn, new = ?update.new.as_ref().map(Digest::short), "Updated reference");
        Ok(())
    }

    /// Replace the guarded reference with `new`, or remove it.
    fn publish(&self, mut lock: LockedFile, new: Option<&Digest>) -> Result<()> {
        match new {
            Some(new) => {
                writeln!(&mut *lock, "{new:x}")?;
                lock.commit(self.fsync)
            }
            None => {
                let path = lock.guarded_path().to_owned();
                match std::fs::remove_file(&path) {
                    Err(e) if e.kind() != ErrorKind::NotFound => return Err(e.into()),
                    _ => {}
                }
                if self.fsync {
                    if let Some(parent) = path.parent() {
                        util::sync_dir(parent)?;
                    }
                }
                drop(lock);
                Ok(())
            }
        }
    }

    /// Lock `path` until [`RefTable::recover`] settles the unconfirmed update `lsn`.
    ///
    /// If another writer got the lock first, its update is logged after `lsn`, and recovery
    /// treats `lsn` as superseded once that update is confirmed.
    fn fence(&self, path: &Utf8Path, lsn: Lsn) {
        match LockedFile::try_acquire(path) {
            Ok(Some(lock)) => {
                warn!(path = %lock.guarded_path(), %lsn, "Reference fenced until recovery");
                lock.keep();
            }
            Ok(None) => debug!(%path, %lsn, "Reference already locked by another writer"),
            Err(error) => error!(%path, %lsn, %error, "Could not fence reference"),
        }
    }

    /// All bound references whose name starts with `prefix`, sorted by name.
    pub fn list(&self, prefix: &str) -> Result<Vec<(RefName, Digest)>> {
        let mut refs = Vec::new();
        let root = self.dir.join("refs");
        if !root.is_dir() {
            return Ok(refs);
        }

        for entry in WalkDir::new(&root).sort_by_file_name() {
            let entry = entry.map_err(std::io::Error::from)?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(relative) = entry
                .path()
                .strip_prefix(&self.dir)
                .ok()
                .and_then(|p| p.to_str())
            else {
                continue;
            };
            // Lock files are not valid names; temp files are in-flight writes.
            if entry.file_name().to_str().map_or(true, |n| n.starts_with("tmp_obj_")) {
                continue;
            }
            let Ok(name) = RefName::new(relative.replace(std::path::MAIN_SEPARATOR, "/")) else {
                continue;
            };
            if !name.as_str().starts_with(prefix) {
                continue;
            }
            if let Some(digest) = self.read(&name)? {
                refs.push((name, digest));
            }
        }

        refs.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(refs)
    }

    /// The logged updates of `name`, oldest first.
    pub fn history(&self, name: &RefName) -> Result<Vec<LogEntry>> {
        self.log.entries_for(name)
    }

    pub fn head_target(&self) -> Result<Option<Head>> {
        let contents = match std::fs::read_to_string(&self.head_path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let contents = contents.trim();
        if let Some(target) = contents.strip_prefix("ref: ") {
            Ok(Some(Head::Symbolic(RefName::new(target)?)))
        } else {
            Digest::from_str(contents)
                .map(|digest| Some(Head::Detached(digest)))
                .map_err(|_| Error::InvalidRefName(format!("HEAD: {contents}")))
        }
    }

    /// Resolve HEAD to a commit digest. An unborn branch resolves to `None`.
    pub fn head(&self) -> Result<Option<Digest>> {
        match self.head_target()? {
            None => Ok(None),
            Some(Head::Detached(digest)) => Ok(Some(digest)),
            Some(Head::Symbolic(name)) => self.read(&name),
        }
    }

    /// Point HEAD at `target`.
    pub fn set_head(&self, target: &Head) -> Result<()> {
        let mut head = LockedFile::try_acquire(&self.head_path)?.ok_or_else(|| Error::Io(
            std::io::Error::new(ErrorKind::WouldBlock, "HEAD is locked by another writer"),
        ))?;
        match target {
            Head::Symbolic(name) => writeln!(&mut *head, "ref: {name}")?,
            Head::Detached(digest) => writeln!(&mut *head, "{digest:x}")?,
        }
        head.commit(self.fsync)
    }

    /// Reconcile the table with every update that was logged but never confirmed.
    ///
    /// An update is superseded if a later update of the same reference was confirmed, or if the
    /// reference holds neither its old nor its new value. Otherwise it is published, unless it
    /// already was.
    ///
    /// This removes lock files left behind by crashed writers or failed publishes, so it must not
    /// run while another writer is active.
    pub fn recover(&self) -> Result<Recovery> {
        let mut recovery = Recovery::default();

        let mut intents = Vec::new();
        let mut applied = HashSet::new();
        for record in self.log.replay(Lsn(0))? {
            match record? {
                Record::Intent(entry) => intents.push(entry),
                Record::Applied(lsn) => {
                    applied.insert(lsn);
                }
                Record::Base(_) => {}
            }
        }

        // The newest confirmed update of each reference.
        let mut last_applied = HashMap::new();
        for entry in intents.iter().filter(|e| applied.contains(&e.lsn)) {
            let last = last_applied.entry(entry.update.name.clone()).or_insert(entry.lsn);
            *last = (*last).max(entry.lsn);
        }

        for entry in intents.iter().filter(|e| !applied.contains(&e.lsn)) {
            let update = &entry.update;
            let path = self.ref_path(&update.name);

            let stale = lock::lock_path(&path);
            if stale.exists() {
                warn!(name = %update.name, lsn = %entry.lsn, "Removing stale lock file");
                std::fs::remove_file(&stale)?;
            }

            if last_applied
                .get(&update.name)
                .map_or(false, |&last| last > entry.lsn)
            {
                warn!(
                    name = %update.name,
                    lsn = %entry.lsn,
                    "A later update of the reference was confirmed, leaving it alone"
                );
                recovery.superseded.push(entry.lsn);
                self.log.mark_applied(entry.lsn)?;
                continue;
            }

            let current = self.read(&update.name)?;
            if current == update.new {
                recovery.confirmed.push(entry.lsn);
            } else if current == update.old {
                warn!(name = %update.name, lsn = %entry.lsn, "Replaying unpublished update");
                match &update.new {
                    Some(new) => {
                        if let Some(parent) = path.parent() {
                            std::fs::create_dir_all(parent)?;
                        }
                        util::write_atomic(&path, format!("{new:x}\n").as_bytes(), self.fsync)?;
                    }
                    None => std::fs::remove_file(&path)?,
                }
                recovery.replayed.push(entry.lsn);
            } else {
                warn!(
                    name = %update.name,
                    lsn = %entry.lsn,
                    "Reference moved on since the update was logged, leaving it alone"
                );
                recovery.superseded.push(entry.lsn);
            }

            self.log.mark_applied(entry.lsn)?;
        }

        if !recovery.is_empty() {
            info!(
                replayed = recovery.replayed.len(),
                confirmed = recovery.confirmed.len(),
                superseded = recovery.superseded.len(),
                "Recovered reference table from transaction log"
            );
        }
        Ok(recovery)
    }
}
