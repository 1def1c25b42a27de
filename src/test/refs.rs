use std::sync::Barrier;

use pretty_assertions::assert_eq;

use crate::filemode::FileMode;
use crate::lock::LockedFile;
use crate::refs::Head;
use crate::test::{commit_at, signature_at, temp_repo};
use crate::*;

fn tree_with(repo: &Repo, name: &str, contents: &[u8]) -> Result<Digest> {
    let blob = repo.store().put(&Blob::new(contents.to_vec()))?;
    let mut tree = Tree::new();
    tree.insert(name, FileMode::REGULAR, blob)?;
    repo.store().put(&tree)
}

#[test]
fn stale_expected_value_conflicts() -> Result<()> {
    let (_dir, repo) = temp_repo()?;
    let author = signature_at(1658312219);

    let t1 = tree_with(&repo, "file", b"one\n")?;
    let t2 = tree_with(&repo, "file", b"two\n")?;
    let r1 = repo.write_commit(&t1, &[], &author, "first")?;
    let r2 = repo.write_commit(&t2, &[r1.clone()], &author, "second")?;

    let main = RefName::branch("main")?;
    repo.refs().create(&main, &r2)?;
    assert_eq!(repo.refs().read(&main)?, Some(r2.clone()));
    assert_eq!(repo.head()?, Some(r2.clone()));

    let err = repo
        .refs()
        .compare_and_swap(&main, Some(&r1), &r2)
        .unwrap_err();
    assert!(err.is_retriable());
    assert!(matches!(
        err,
        Error::Conflict { expected: Some(e), actual: Some(a), .. } if e == r1 && a == r2
    ));

    assert!(repo.history().is_ancestor(&r1, &r2)?);
    assert!(!repo.history().is_ancestor(&r2, &r1)?);
    Ok(())
}

#[test]
fn create_update_delete() -> Result<()> {
    let (_dir, repo) = temp_repo()?;
    let refs = repo.refs();
    let a = commit_at(&repo, &[], 1, "a")?;
    let b = commit_at(&repo, &[a.clone()], 2, "b")?;
    let name = RefName::new("refs/heads/feature/x")?;

    assert_eq!(refs.read(&name)?, None);
    refs.create(&name, &a)?;
    assert!(matches!(
        refs.create(&name, &b),
        Err(Error::AlreadyExists(n)) if n == name
    ));

    refs.compare_and_swap(&name, Some(&a), &b)?;
    assert_eq!(refs.read(&name)?, Some(b.clone()));

    // Binding an already bound name through compare-and-swap needs its current value.
    assert!(matches!(
        refs.compare_and_swap(&name, None, &a),
        Err(Error::Conflict { .. })
    ));

    assert!(matches!(
        refs.delete(&name, &a),
        Err(Error::Conflict { .. })
    ));
    refs.delete(&name, &b)?;
    assert_eq!(refs.read(&name)?, None);

    // Deleting leaves nothing to recover.
    assert!(repo.log_file().pending(Lsn(0))?.is_empty());
    Ok(())
}

#[test]
fn held_lock_conflicts() -> Result<()> {
    let (_dir, repo) = temp_repo()?;
    let a = commit_at(&repo, &[], 1, "a")?;
    let main = RefName::branch("main")?;

    let lock = LockedFile::try_acquire(repo.dir().join("refs/heads/main"))?;
    assert!(lock.is_some());
    assert!(matches!(
        repo.refs().create(&main, &a),
        Err(Error::Conflict { actual: None, .. })
    ));

    drop(lock);
    repo.refs().create(&main, &a)?;

    // A bound name is reported as such even while another writer holds it.
    let lock = LockedFile::try_acquire(repo.dir().join("refs/heads/main"))?;
    assert!(lock.is_some());
    assert!(matches!(
        repo.refs().create(&main, &a),
        Err(Error::AlreadyExists(name)) if name == main
    ));
    assert!(matches!(
        repo.refs().compare_and_swap(&main, Some(&a), &a),
        Err(Error::Conflict { actual: Some(_), .. })
    ));
    Ok(())
}

#[test]
fn list_and_history() -> Result<()> {
    let (_dir, repo) = temp_repo()?;
    let refs = repo.refs();
    let a = commit_at(&repo, &[], 1, "a")?;
    let b = commit_at(&repo, &[a.clone()], 2, "b")?;

    let main = RefName::branch("main")?;
    let topic = RefName::branch("topic")?;
    let tag = RefName::tag("v1")?;
    refs.create(&topic, &a)?;
    refs.create(&main, &a)?;
    refs.create(&tag, &a)?;
    let lsn = repo.fast_forward(&main, &b)?;

    assert_eq!(
        refs.list("refs/")?,
        vec![
            (main.clone(), b.clone()),
            (topic.clone(), a.clone()),
            (tag.clone(), a.clone()),
        ]
    );
    assert_eq!(refs.list(RefName::TAGS)?, vec![(tag, a.clone())]);

    let history = refs.history(&main)?;
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].update.old, None);
    assert_eq!(history[1].lsn, lsn);
    assert_eq!(history[1].update.old, Some(a.clone()));
    assert_eq!(history[1].update.new, Some(b.clone()));
    assert_eq!(history[1].update.message, "fast-forward: b");

    repo.fast_forward(&topic, &a)?;
    assert!(matches!(
        repo.fast_forward(&main, &a),
        Err(Error::NotFastForward { .. })
    ));
    Ok(())
}

#[test]
fn detached_head() -> Result<()> {
    let (_dir, repo) = temp_repo()?;
    let a = commit_at(&repo, &[], 1, "a")?;

    assert_eq!(
        repo.refs().head_target()?,
        Some(Head::Symbolic(RefName::branch("main")?))
    );
    repo.refs().set_head(&Head::Detached(a.clone()))?;
    assert_eq!(repo.head()?, Some(a));
    Ok(())
}

#[test]
fn racing_swaps_have_one_winner() -> Result<()> {
    let (dir, repo) = temp_repo()?;
    let path = camino::Utf8Path::from_path(dir.path()).unwrap();
    let main = RefName::branch("main")?;

    let mut current = commit_at(&repo, &[], 0, "base")?;
    repo.refs().create(&main, &current)?;

    for round in 1..=20 {
        let candidates = [
            commit_at(&repo, &[current.clone()], round, "left")?,
            commit_at(&repo, &[current.clone()], round, "right")?,
        ];
        let handles = [
            Repo::open_with(path, *repo.options())?,
            Repo::open_with(path, *repo.options())?,
        ];
        let barrier = Barrier::new(2);

        let results = std::thread::scope(|s| {
            let workers = handles
                .iter()
                .zip(&candidates)
                .map(|(handle, new)| {
                    let (barrier, main, old) = (&barrier, &main, &current);
                    s.spawn(move || {
                        barrier.wait();
                        handle.refs().compare_and_swap(main, Some(old), new)
                    })
                })
                .collect::<Vec<_>>();
            workers
                .into_iter()
                .map(|w| w.join().unwrap())
                .collect::<Vec<_>>()
        });

        let winners = results
            .iter()
            .zip(&candidates)
            .filter(|(result, _)| result.is_ok())
            .map(|(_, new)| new.clone())
            .collect::<Vec<_>>();
        assert_eq!(winners.len(), 1, "round {round}: {results:?}");
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(Error::Conflict { .. }))));

        assert_eq!(repo.refs().read(&main)?, Some(winners[0].clone()));
        current = winners[0].clone();
    }

    assert!(repo.log_file().pending(Lsn(0))?.is_empty());
    Ok(())
}
