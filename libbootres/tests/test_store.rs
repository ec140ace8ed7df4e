use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use libbootres::{BootResourceStore, CommitOutcome, Digest, GenerationId, StoreError};
use rand::Rng;
use tempfile::tempdir;

mod support;

use crate::support::{commit_files, image_files};

#[tokio::test]
async fn test_commit_three_files_then_corrupt_generation() {
    let dir = tempdir().unwrap();
    let store = BootResourceStore::open(dir.path()).await.unwrap();
    assert_eq!(store.current_generation(), None);

    let g1 = commit_files(&store, &image_files("focal")).await;
    let g1 = match g1 {
        CommitOutcome::Verified(id) => id,
        CommitOutcome::Failed(reason) => panic!("commit failed: {reason}"),
    };
    assert_eq!(store.current_generation(), Some(g1));
    let manifest = store.manifest(g1).await.unwrap();
    assert_eq!(manifest.files.len(), 3);
    assert!(dir.path().join("current").join("boot-kernel").exists());

    // A generation whose bytes do not match the published digest.
    let g2 = store.begin_generation().await.unwrap();
    store
        .write_file(g2, "boot-kernel", b"kernel", &Digest::of(b"kernel"))
        .await
        .unwrap();
    let res = store
        .write_file(g2, "squashfs", b"truncated", &Digest::of(b"full squashfs"))
        .await;
    assert!(matches!(res, Err(StoreError::DigestMismatch { .. })));
    let outcome = store.commit(g2).await.unwrap();
    assert!(matches!(outcome, CommitOutcome::Failed(_)));

    assert_eq!(store.current_generation(), Some(g1));
    assert_eq!(store.list_generations().await.unwrap(), vec![g1]);
    assert!(!dir.path().join("staging").join(g2.dir_name()).exists());
}

#[tokio::test]
async fn test_file_corrupted_on_disk_before_commit() {
    let dir = tempdir().unwrap();
    let store = BootResourceStore::open(dir.path()).await.unwrap();
    let id = store.begin_generation().await.unwrap();
    store
        .write_file(id, "boot-initrd", b"initrd", &Digest::of(b"initrd"))
        .await
        .unwrap();

    let on_disk = dir
        .path()
        .join("staging")
        .join(id.dir_name())
        .join("boot-initrd");
    std::fs::write(&on_disk, b"bit rot").unwrap();

    let outcome = store.commit(id).await.unwrap();
    assert!(matches!(outcome, CommitOutcome::Failed(_)));
    assert_eq!(store.current_generation(), None);
    assert!(store.list_generations().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_empty_generation_is_not_promoted() {
    let dir = tempdir().unwrap();
    let store = BootResourceStore::open(dir.path()).await.unwrap();
    let id = store.begin_generation().await.unwrap();
    assert!(matches!(
        store.commit(id).await.unwrap(),
        CommitOutcome::Failed(_)
    ));
    assert_eq!(store.current_generation(), None);
}

#[tokio::test]
async fn test_random_corruption_never_becomes_current() {
    let dir = tempdir().unwrap();
    let store = BootResourceStore::open(dir.path()).await.unwrap();
    let mut rng = rand::rng();
    let mut last_good = None;

    for round in 0..40 {
        let id = store.begin_generation().await.unwrap();
        let n_files = rng.random_range(1..5);
        let corrupt_index = if rng.random_bool(0.5) {
            Some(rng.random_range(0..n_files))
        } else {
            None
        };

        for i in 0..n_files {
            let len = rng.random_range(1..256);
            let bytes: Vec<u8> = (0..len).map(|_| rng.random()).collect();
            let expected = Digest::of(&bytes);
            let written = if corrupt_index == Some(i) {
                let mut bad = bytes.clone();
                let pos = rng.random_range(0..bad.len());
                bad[pos] ^= rng.random_range(1..=255u8);
                bad
            } else {
                bytes
            };
            let _ = store
                .write_file(id, &format!("round-{round}/file-{i}"), &written, &expected)
                .await;
        }

        let outcome = store.commit(id).await.unwrap();
        match corrupt_index {
            Some(_) => {
                assert!(!outcome.is_verified(), "corrupt generation {id} was promoted");
                assert_eq!(store.current_generation(), last_good);
            }
            None => {
                assert_eq!(outcome, CommitOutcome::Verified(id));
                last_good = Some(id);
                assert_eq!(store.current_generation(), Some(id));
            }
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_readers_never_see_transitional_pointer() {
    let dir = tempdir().unwrap();
    let store = Arc::new(BootResourceStore::open(dir.path()).await.unwrap());
    let first = match commit_files(&store, &image_files("jammy")).await {
        CommitOutcome::Verified(id) => id,
        other => panic!("{other:?}"),
    };

    let done = Arc::new(AtomicBool::new(false));
    let mut readers = Vec::new();
    for _ in 0..4 {
        let store = store.clone();
        let done = done.clone();
        readers.push(tokio::spawn(async move {
            let mut seen = Vec::new();
            let mut last = 0u64;
            while !done.load(Ordering::Relaxed) {
                let ptr = store.current();
                assert!(ptr.version >= last, "pointer version went backwards");
                last = ptr.version;
                seen.push(ptr.generation.expect("current vanished during swap"));
                tokio::task::yield_now().await;
            }
            seen
        }));
    }

    let mut committed = HashSet::from([first]);
    for i in 0..20 {
        let files = image_files(&format!("series-{i}"));
        if let CommitOutcome::Verified(id) = commit_files(&store, &files).await {
            committed.insert(id);
        }
    }
    done.store(true, Ordering::Relaxed);

    for reader in readers {
        let seen = reader.await.unwrap();
        for id in seen {
            assert!(committed.contains(&id), "reader saw uncommitted {id}");
        }
    }

    // The on-disk pointer agrees with the published one.
    let target = std::fs::read_link(dir.path().join("current")).unwrap();
    let on_disk: GenerationId = target
        .file_name()
        .unwrap()
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert_eq!(Some(on_disk), store.current_generation());
}

#[tokio::test]
async fn test_reopen_cleans_abandoned_generation() {
    let dir = tempdir().unwrap();
    let committed = {
        let store = BootResourceStore::open(dir.path()).await.unwrap();
        let g = match commit_files(&store, &image_files("noble")).await {
            CommitOutcome::Verified(id) => id,
            other => panic!("{other:?}"),
        };
        let partial = store.begin_generation().await.unwrap();
        store
            .write_file(partial, "boot-kernel", b"half", &Digest::of(b"half"))
            .await
            .unwrap();
        assert!(dir.path().join("staging").join(partial.dir_name()).exists());
        g
        // Dropped without commit, like a crashed sync.
    };

    let store = BootResourceStore::open(dir.path()).await.unwrap();
    assert_eq!(store.current_generation(), Some(committed));
    let staging: Vec<_> = std::fs::read_dir(dir.path().join("staging"))
        .unwrap()
        .collect();
    assert!(staging.is_empty());

    let next = store.begin_generation().await.unwrap();
    assert!(next > committed.next(), "ids are never reused");
}

#[tokio::test]
async fn test_gc_keeps_current_and_held() {
    let dir = tempdir().unwrap();
    let store = BootResourceStore::open(dir.path()).await.unwrap();
    let mut ids = Vec::new();
    for name in ["a", "b", "c"] {
        match commit_files(&store, &image_files(name)).await {
            CommitOutcome::Verified(id) => ids.push(id),
            other => panic!("{other:?}"),
        }
    }
    // The target daemon still serves the second generation.
    store.hold(ids[1]);

    let removed = store.collect_garbage().await.unwrap();
    assert_eq!(removed, vec![ids[0]]);
    assert_eq!(store.list_generations().await.unwrap(), vec![ids[1], ids[2]]);

    store.release(ids[1]);
    let removed = store.collect_garbage().await.unwrap();
    assert_eq!(removed, vec![ids[1]]);
    assert_eq!(store.list_generations().await.unwrap(), vec![ids[2]]);
    assert_eq!(store.current_generation(), Some(ids[2]));
}

#[tokio::test]
async fn test_refresh_picks_up_external_commit() {
    let dir = tempdir().unwrap();
    let daemon_view = BootResourceStore::open(dir.path()).await.unwrap();
    let mut rx = daemon_view.subscribe();

    let importer = BootResourceStore::open(dir.path()).await.unwrap();
    let id = match commit_files(&importer, &image_files("bionic")).await {
        CommitOutcome::Verified(id) => id,
        other => panic!("{other:?}"),
    };
    drop(importer);

    assert_eq!(daemon_view.current_generation(), None);
    assert_eq!(daemon_view.refresh().await.unwrap(), Some(id));
    assert!(rx.has_changed().unwrap());
    assert_eq!(rx.borrow_and_update().generation, Some(id));

    // Nothing moved, nothing published.
    daemon_view.refresh().await.unwrap();
    assert!(!rx.has_changed().unwrap());
}

#[tokio::test]
async fn test_gc_keeps_generation_committed_by_another_process() {
    let dir = tempdir().unwrap();
    let daemon_view = BootResourceStore::open(dir.path()).await.unwrap();
    let importer = BootResourceStore::open(dir.path()).await.unwrap();

    let first = match commit_files(&importer, &image_files("focal")).await {
        CommitOutcome::Verified(id) => id,
        other => panic!("{other:?}"),
    };
    let second = match commit_files(&importer, &image_files("jammy")).await {
        CommitOutcome::Verified(id) => id,
        other => panic!("{other:?}"),
    };

    // The daemon has not refreshed yet and believes nothing is current.
    assert_eq!(daemon_view.current_generation(), None);
    let removed = daemon_view.collect_garbage().await.unwrap();
    assert_eq!(removed, vec![first]);
    assert_eq!(daemon_view.current_generation(), Some(second));
    assert!(dir.path().join("current").join("manifest.json").exists());
    assert_eq!(daemon_view.list_generations().await.unwrap(), vec![second]);
}

#[tokio::test]
async fn test_gc_waits_for_active_writer() {
    let dir = tempdir().unwrap();
    let daemon_view = BootResourceStore::open(dir.path()).await.unwrap();
    let importer = BootResourceStore::open(dir.path()).await.unwrap();
    for series in ["focal", "jammy"] {
        assert!(commit_files(&importer, &image_files(series)).await.is_verified());
    }

    let pending = importer.begin_generation().await.unwrap();
    assert!(daemon_view.collect_garbage().await.unwrap().is_empty());
    assert_eq!(daemon_view.list_generations().await.unwrap().len(), 2);

    importer.abandon(pending).await.unwrap();
    assert_eq!(daemon_view.collect_garbage().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_long_lived_store_does_not_reuse_external_ids() {
    let dir = tempdir().unwrap();
    let daemon_view = BootResourceStore::open(dir.path()).await.unwrap();
    let importer = BootResourceStore::open(dir.path()).await.unwrap();
    let external = match commit_files(&importer, &image_files("focal")).await {
        CommitOutcome::Verified(id) => id,
        other => panic!("{other:?}"),
    };

    match commit_files(&daemon_view, &image_files("jammy")).await {
        CommitOutcome::Verified(id) => assert!(id > external),
        other => panic!("{other:?}"),
    }
    assert_eq!(daemon_view.list_generations().await.unwrap().len(), 2);
}
