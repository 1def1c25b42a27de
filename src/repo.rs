//! The repository handle.
//!
//! A [`Repo`] ties together the object store, the reference table and the transaction log that
//! live under one `.rift` directory. Every operation goes through a handle; there is no global
//! state, and several handles on the same directory (in one process or many) may coexist.

use camino::{Utf8Path, Utf8PathBuf};
use tracing::*;

use crate::digest::Digest;
use crate::history::{Ancestors, HistoryGraph};
use crate::object::{Commit, Signature};
use crate::options::Options;
use crate::refs::{Head, RefName, RefTable, Recovery};
use crate::store::ObjectStore;
use crate::txlog::{Lsn, RefUpdate, TransactionLog};
use crate::{Error, Result};

pub const RIFT_DIR: &str = ".rift";
pub const DEFAULT_BRANCH: &str = "main";

pub struct Repo {
    dir: Utf8PathBuf,
    store: ObjectStore,
    refs: RefTable,
    options: Options,
}

impl Repo {
    fn new(dir: Utf8PathBuf, options: Options) -> Self {
        let store = ObjectStore::new(dir.join("objects"), options);
        let log = TransactionLog::new(dir.join("txlog"), options.fsync);
        let refs = RefTable::new(&dir, log, options.fsync);
        Self {
            dir,
            store,
            refs,
            options,
        }
    }

    /// Create a repository in `path`, or do nothing if one exists there already.
    pub fn init(path: impl AsRef<Utf8Path>) -> Result<Self> {
        Self::init_with(path, Options::from_env())
    }

    pub fn init_with(path: impl AsRef<Utf8Path>, options: Options) -> Result<Self> {
        let dir = path.as_ref().join(RIFT_DIR);
        trace!(path = %dir, "Initialising repo");

        if dir.join("HEAD").exists() {
            warn!(path = %dir, "Repo already exists, init will do nothing");
            return Self::open_with(path, options);
        }

        for d in ["objects", "refs/heads", "refs/tags"] {
            let d = dir.join(d);
            trace!(path = %d, "Creating directory");
            std::fs::create_dir_all(d)?;
        }

        let repo = Self::new(dir, options);
        repo.refs.log().create()?;
        repo.refs
            .set_head(&Head::Symbolic(RefName::branch(DEFAULT_BRANCH)?))?;

        info!(path = %repo.dir, "Initialised empty repository");
        Ok(repo)
    }

    pub fn open(path: impl AsRef<Utf8Path>) -> Result<Self> {
        Self::open_with(path, Options::from_env())
    }

    /// Open the repository in `path`.
    ///
    /// Updates that were logged but never confirmed are reported, not replayed: replaying is only
    /// safe without concurrent writers, so it is left to an explicit [`Repo::recover`].
    pub fn open_with(path: impl AsRef<Utf8Path>, options: Options) -> Result<Self> {
        let dir = path.as_ref().join(RIFT_DIR);
        if !dir.join("objects").is_dir() || !dir.join("txlog").is_file() {
            return Err(Error::NotARepository(path.as_ref().to_owned()));
        }

        let repo = Self::new(dir, options);
        let pending = repo.refs.log().pending(Lsn(0))?;
        if !pending.is_empty() {
            warn!(
                count = pending.len(),
                "Transaction log has unconfirmed reference updates; run recovery"
            );
        }

        trace!(path = %repo.dir, "Opened repo");
        Ok(repo)
    }

    /// Close the handle. All writes are durable by the time they return, so this only releases
    /// resources.
    pub fn close(self) {
        trace!(path = %self.dir, "Closed repo");
    }

    /// The `.rift` directory.
    pub fn dir(&self) -> &Utf8Path {
        &self.dir
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn store(&self) -> &ObjectStore {
        &self.store
    }

    pub fn refs(&self) -> &RefTable {
        &self.refs
    }

    pub fn log_file(&self) -> &TransactionLog {
        self.refs.log()
    }

    pub fn history(&self) -> HistoryGraph<'_> {
        HistoryGraph::new(&self.store)
    }

    pub fn head(&self) -> Result<Option<Digest>> {
        self.refs.head()
    }

    /// Store a commit of `tree` on top of `parents`, authored and committed by `author` now.
    pub fn write_commit(
        &self,
        tree: &Digest,
        parents: &[Digest],
        author: &Signature,
        message: &str,
    ) -> Result<Digest> {
        self.store.get_tree(tree)?;
        for parent in parents {
            self.store.get_commit(parent)?;
        }

        let committer = Signature::now(author.name(), author.email());
        let commit = Commit::new(
            tree.clone(),
            parents.to_vec(),
            author.clone(),
            committer,
            message,
        );
        let digest = self.store.put(&commit)?;
        debug!(commit = %digest.short(), parents = parents.len(), "Wrote commit");
        Ok(digest)
    }

    /// Move `name` forward to `new`, which must descend from its current value. An unbound
    /// reference is created.
    pub fn fast_forward(&self, name: &RefName, new: &Digest) -> Result<Lsn> {
        let current = self.refs.read(name)?;

        if let Some(current) = &current {
            if !self.history().is_ancestor(current, new)? {
                return Err(Error::NotFastForward {
                    name: name.clone(),
                    from: current.clone(),
                    to: new.clone(),
                });
            }
        }

        let summary = self.store.get_commit(new)?.summary().to_owned();
        self.refs.apply(&RefUpdate {
            name: name.clone(),
            old: current,
            new: Some(new.clone()),
            message: format!("fast-forward: {summary}"),
        })
    }

    /// Walk history from `start`, newest first.
    pub fn log(&self, start: &Digest) -> Ancestors<'_> {
        self.history().ancestors(start)
    }

    /// Replay reference updates left unconfirmed by a crash. No other writer may be active.
    pub fn recover(&self) -> Result<Recovery> {
        self.refs.recover()
    }
}
