mod object_store;
mod refs;

use camino::Utf8Path;
use tempdir::TempDir;

use crate::object::{Commit, Signature, Tree};
use crate::timestamp::Timestamp;
use crate::*;

pub const COMMIT_NAME: &str = "A U Thor";
pub const COMMIT_EMAIL: &str = "author@example.com";

/// A fresh repository in a temporary directory, with fsync off.
pub fn temp_repo() -> Result<(TempDir, Repo)> {
    let dir = TempDir::new("rift")?;
    let path = Utf8Path::from_path(dir.path())
        .expect("temp dirs are utf-8")
        .to_owned();
    let repo = Repo::init_with(
        path,
        Options {
            fsync: false,
            ..Options::default()
        },
    )?;
    Ok((dir, repo))
}

pub fn signature_at(unix: i64) -> Signature {
    Signature::new(
        COMMIT_NAME,
        COMMIT_EMAIL,
        Timestamp::from_unix(unix, 0).expect("valid timestamp"),
    )
}

/// Store a commit of the empty tree, authored and committed at `unix`.
pub fn commit_at(repo: &Repo, parents: &[Digest], unix: i64, message: &str) -> Result<Digest> {
    let tree = repo.store().put(&Tree::new())?;
    let commit = Commit::new(
        tree,
        parents.to_vec(),
        signature_at(unix),
        signature_at(unix),
        message,
    );
    repo.store().put(&commit)
}

#[macro_export]
macro_rules! digests {
    ($($digest:expr),* $(,)?) => {
        vec![$($digest.clone()),*]
    };
}
