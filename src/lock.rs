use crate::util;
use crate::Result;

use std::{
    fs::File,
    io::{ErrorKind, Write},
    ops::{Deref, DerefMut},
};

use camino::{Utf8Path, Utf8PathBuf};

/// Exclusive claim on a file, held as `<file>.lock`.
///
/// The lock file doubles as the staging area for the new contents: [`LockedFile::commit`] renames
/// it over the guarded file in one step. Dropping an uncommitted lock removes it and leaves the
/// guarded file untouched.
pub struct LockedFile {
    guarded_path: Utf8PathBuf,
    lock_path: Utf8PathBuf,
    lockfile: Option<File>,
}

impl Deref for LockedFile {
    type Target = File;

    fn deref(&self) -> &Self::Target {
        self.lockfile.as_ref().expect("lock file is open until commit")
    }
}

impl DerefMut for LockedFile {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.lockfile.as_mut().expect("lock file is open until commit")
    }
}

/// The path of the lock file guarding `path`.
pub fn lock_path(path: &Utf8Path) -> Utf8PathBuf {
    let mut lock = path.as_str().to_owned();
    lock.push_str(".lock");
    Utf8PathBuf::from(lock)
}

impl LockedFile {
    /// Returns `None` if somebody else holds the lock.
    pub fn try_acquire(path: impl AsRef<Utf8Path>) -> Result<Option<Self>> {
        let guarded_path = path.as_ref().to_owned();
        let lock_path = lock_path(&guarded_path);

        match File::options()
            .write(true)
            .create_new(true)
            .open(&lock_path)
        {
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(None),
            Err(e) => Err(e.into()),
            Ok(lockfile) => Ok(Some(Self {
                guarded_path,
                lock_path,
                lockfile: Some(lockfile),
            })),
        }
    }

    pub fn guarded_path(&self) -> &Utf8Path {
        &self.guarded_path
    }

    /// Release the handle but leave the lock file in place, so the guarded file stays locked until
    /// someone removes it.
    pub fn keep(mut self) {
        self.lockfile.take();
    }

    /// Publish the lock file's contents as the guarded file.
    pub fn commit(mut self, fsync: bool) -> Result<()> {
        if let Some(mut file) = self.lockfile.take() {
            let published = file
                .flush()
                .and_then(|_| if fsync { file.sync_all() } else { Ok(()) })
                .and_then(|_| std::fs::rename(&self.lock_path, &self.guarded_path));
            if let Err(e) = published {
                let _ = std::fs::remove_file(&self.lock_path);
                return Err(e.into());
            }
        }
        if fsync {
            if let Some(dir) = self.guarded_path.parent() {
                util::sync_dir(dir)?;
            }
        }
        Ok(())
    }
}

impl Drop for LockedFile {
    fn drop(&mut self) {
        // Still open means not committed.
        if self.lockfile.take().is_some() {
            let _ = std::fs::remove_file(&self.lock_path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempdir::TempDir;

    #[test]
    fn test_lock_is_exclusive() -> Result<()> {
        let dir = TempDir::new("")?;
        let path = Utf8Path::from_path(dir.path()).unwrap().join("HEAD");

        let first = LockedFile::try_acquire(&path)?;
        assert!(first.is_some());
        assert!(LockedFile::try_acquire(&path)?.is_none());

        drop(first);
        assert!(!lock_path(&path).exists());
        assert!(!path.exists());
        assert!(LockedFile::try_acquire(&path)?.is_some());
        Ok(())
    }

    #[test]
    fn test_kept_lock_outlives_handle() -> Result<()> {
        let dir = TempDir::new("")?;
        let path = Utf8Path::from_path(dir.path()).unwrap().join("HEAD");

        LockedFile::try_acquire(&path)?.unwrap().keep();
        assert!(lock_path(&path).exists());
        assert!(LockedFile::try_acquire(&path)?.is_none());
        Ok(())
    }

    #[test]
    fn test_commit_replaces_file() -> Result<()> {
        let dir = TempDir::new("")?;
        let path = Utf8Path::from_path(dir.path()).unwrap().join("HEAD");
        std::fs::write(&path, "old\n")?;

        let mut lock = LockedFile::try_acquire(&path)?.unwrap();
        writeln!(&mut *lock, "new")?;
        lock.commit(true)?;

        assert_eq!(std::fs::read_to_string(&path)?, "new\n");
        assert!(!lock_path(&path).exists());
        Ok(())
    }
}
