use std::io::Write;

use camino::Utf8PathBuf;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use pretty_assertions::assert_eq;
use proptest::prelude::*;

use crate::filemode::FileMode;
use crate::test::{commit_at, signature_at, temp_repo};
use crate::*;

fn object_file(repo: &Repo, digest: &Digest) -> Utf8PathBuf {
    let hex = digest.to_hex();
    repo.store().root().join(&hex[..2]).join(&hex[2..])
}

#[test]
fn round_trip_every_kind() -> Result<()> {
    let (_dir, repo) = temp_repo()?;
    let store = repo.store();

    let blob = Blob::new(b"a/b/c.txt-contents\n".to_vec());
    let blob_id = store.put(&blob)?;

    let mut tree = Tree::new();
    tree.insert("c.txt", FileMode::REGULAR, blob_id.clone())?;
    tree.insert("run.sh", FileMode::EXECUTABLE, blob_id.clone())?;
    let tree_id = store.put(&tree)?;

    let commit = Commit::new(
        tree_id.clone(),
        vec![],
        signature_at(1658312219),
        signature_at(1658312219),
        "initial\n\nwith a body\n",
    );
    let commit_id = store.put(&commit)?;

    assert_eq!(store.get_blob(&blob_id)?, blob);
    assert_eq!(store.get_tree(&tree_id)?, tree);
    assert_eq!(store.get_commit(&commit_id)?, commit);

    assert_eq!(
        store.get(&tree_id, ObjectKind::Tree)?.payload(),
        tree.payload()
    );
    Ok(())
}

#[test]
fn put_twice_stores_one_copy() -> Result<()> {
    let (_dir, repo) = temp_repo()?;
    let store = repo.store();

    let first = store.put(&Blob::new(b"same".to_vec()))?;
    let second = store.put(&Blob::new(b"same".to_vec()))?;
    let raw = store.put_raw(ObjectKind::Blob, b"same")?;
    assert_eq!(first, second);
    assert_eq!(first, raw);

    assert_eq!(store.digests()?, vec![first.clone()]);
    let dir = object_file(&repo, &first)
        .parent()
        .map(ToOwned::to_owned)
        .unwrap();
    assert_eq!(std::fs::read_dir(dir)?.count(), 1);
    Ok(())
}

#[test]
fn kind_is_part_of_identity() -> Result<()> {
    let (_dir, repo) = temp_repo()?;
    let store = repo.store();

    let tree_id = store.put(&Tree::new())?;
    let blob_id = store.put_raw(ObjectKind::Blob, b"")?;
    assert_ne!(tree_id, blob_id);

    assert!(matches!(
        store.get(&tree_id, ObjectKind::Blob),
        Err(Error::KindMismatch {
            expected: ObjectKind::Blob,
            actual: ObjectKind::Tree,
            ..
        })
    ));
    assert!(matches!(
        store.get_commit(&blob_id),
        Err(Error::KindMismatch { .. })
    ));
    assert_eq!(store.read_kind(&tree_id)?, ObjectKind::Tree);
    Ok(())
}

#[test]
fn corruption_is_detected() -> Result<()> {
    let (_dir, repo) = temp_repo()?;
    let store = repo.store();

    // Not zlib at all.
    let garbled = store.put(&Blob::new(b"one".to_vec()))?;
    std::fs::write(object_file(&repo, &garbled), b"\x00\x01\x02 garbage")?;

    // Well-formed, but the content of another object.
    let swapped = store.put(&Blob::new(b"two".to_vec()))?;
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::fast());
    encoder.write_all(&Blob::new(b"three".to_vec()).formatted())?;
    std::fs::write(object_file(&repo, &swapped), encoder.finish()?)?;

    let intact = store.put(&Blob::new(b"four".to_vec()))?;

    for digest in [&garbled, &swapped] {
        assert!(store.contains(digest));
        assert!(matches!(
            store.get(digest, ObjectKind::Blob),
            Err(Error::Corrupt { digest: d, .. }) if d == *digest
        ));
        assert_eq!(store.load(digest).unwrap_err().exit_code(), 4);
    }
    assert_eq!(store.get_blob(&intact)?.data(), b"four");

    let mut expected = vec![garbled, swapped];
    expected.sort();
    let broken = store
        .verify_all()?
        .into_iter()
        .map(|(digest, _)| digest)
        .collect::<Vec<_>>();
    assert_eq!(broken, expected);
    Ok(())
}

#[test]
fn commit_graph_objects_are_stable() -> Result<()> {
    let (_dir, repo) = temp_repo()?;
    let root = commit_at(&repo, &[], 1_000, "root")?;
    let again = commit_at(&repo, &[], 1_000, "root")?;
    let later = commit_at(&repo, &[], 1_001, "root")?;
    assert_eq!(root, again);
    assert_ne!(root, later);
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn put_get_is_deterministic(data in proptest::collection::vec(any::<u8>(), 0..2048)) {
        let (_dir, repo) = temp_repo().unwrap();
        let store = repo.store();

        let digest = store.put(&Blob::new(data.clone())).unwrap();
        prop_assert_eq!(&digest, &Blob::new(data.clone()).digest());
        prop_assert_eq!(&store.put_raw(ObjectKind::Blob, &data).unwrap(), &digest);
        prop_assert_eq!(store.get_blob(&digest).unwrap().into_data(), data);
    }
}
