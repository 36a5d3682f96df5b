//! End-to-end scenarios (spec §8's enumerated list) exercised against the
//! public API: `PagedDb` + `FilePageManager`, the way an embedder would
//! actually use this crate.

use std::sync::Arc;

use paprika_store::{
    CommitOptions, DbOptions, FilePageManager, Key, MultiHeadChain, NibblePath, PageManager, PagedDb,
};

fn open_db(dir: &std::path::Path, history_depth: usize) -> PagedDb {
    let manager: Arc<dyn PageManager> = Arc::new(FilePageManager::open(dir.join("db.paprika"), 1 << 16).unwrap());
    PagedDb::open(manager, DbOptions { history_depth, ..Default::default() }, 1 << 16).unwrap()
}

fn state_key(bytes: &[u8]) -> Key<'_> {
    Key::State(NibblePath::from_bytes(bytes))
}

/// Scenario 1: set then commit then get.
#[test]
fn scenario_1_set_commit_get() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(dir.path(), 4);

    let mut batch = db.begin_next_batch().unwrap();
    let key = [0xA, 0xB, 0xC, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];
    batch.set(&state_key(&key), &[0x01]).unwrap();
    db.commit(batch, None).unwrap();

    let mut reader = db.begin_read_only_batch();
    assert_eq!(reader.get(&state_key(&key)).unwrap(), Some(vec![0x01]));
}

/// Scenario 2: set then set-empty (delete) then commit then get == None.
#[test]
fn scenario_2_set_then_delete_is_absent() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(dir.path(), 4);

    let key = [0x77u8; 32];
    let mut batch = db.begin_next_batch().unwrap();
    batch.set(&state_key(&key), &[0x01]).unwrap();
    batch.set(&state_key(&key), &[]).unwrap();
    db.commit(batch, None).unwrap();

    let mut reader = db.begin_read_only_batch();
    assert_eq!(reader.get(&state_key(&key)).unwrap(), None);
}

/// Scenario 3 (reduced scale): enough keys sharing a first nibble to force
/// a Leaf DataPage through Fanout promotion and into child subtrees, every
/// key still answering `get` afterward.
#[test]
fn scenario_3_many_keys_force_fanout_and_remain_readable() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(dir.path(), 4);

    const N: u32 = 3000;
    let mut batch = db.begin_next_batch().unwrap();
    for i in 0..N {
        let mut key = [0u8; 32];
        key[0] = (i / 256) as u8;
        key[1] = (i % 256) as u8;
        batch.set(&state_key(&key), &[(i % 251) as u8]).unwrap();
    }
    db.commit(batch, None).unwrap();

    let mut reader = db.begin_read_only_batch();
    for i in 0..N {
        let mut key = [0u8; 32];
        key[0] = (i / 256) as u8;
        key[1] = (i % 256) as u8;
        assert_eq!(reader.get(&state_key(&key)).unwrap(), Some(vec![(i % 251) as u8]), "key {i} missing after fanout");
    }
}

/// Scenario 4 (reduced scale): storage for many distinct accounts, several
/// keys each, surviving a reopen of the same file.
#[test]
fn scenario_4_storage_fanout_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db.paprika");

    const ACCOUNTS: u32 = 50;
    const KEYS_PER_ACCOUNT: u32 = 20;

    {
        let manager: Arc<dyn PageManager> = Arc::new(FilePageManager::open(&path, 1 << 16).unwrap());
        let db = PagedDb::open(manager, DbOptions::default(), 1 << 16).unwrap();
        let mut batch = db.begin_next_batch().unwrap();
        for a in 0..ACCOUNTS {
            let mut account = [0u8; 32];
            account[0..4].copy_from_slice(&a.to_be_bytes());
            for k in 0..KEYS_PER_ACCOUNT {
                let mut storage_key = [0u8; 8];
                storage_key[0..4].copy_from_slice(&k.to_be_bytes());
                let key = Key::Storage {
                    account: &account,
                    storage_path: NibblePath::from_bytes(&storage_key),
                };
                batch.set(&key, &[(a as u8).wrapping_add(k as u8)]).unwrap();
            }
        }
        db.commit(batch, Some(CommitOptions::FlushDataAndRoot)).unwrap();
    }

    // Reopen against the same file.
    let manager: Arc<dyn PageManager> = Arc::new(FilePageManager::open(&path, 1 << 16).unwrap());
    let db = PagedDb::open(manager, DbOptions::default(), 1 << 16).unwrap();
    let mut reader = db.begin_read_only_batch();
    for a in 0..ACCOUNTS {
        let mut account = [0u8; 32];
        account[0..4].copy_from_slice(&a.to_be_bytes());
        for k in 0..KEYS_PER_ACCOUNT {
            let mut storage_key = [0u8; 8];
            storage_key[0..4].copy_from_slice(&k.to_be_bytes());
            let key = Key::Storage {
                account: &account,
                storage_path: NibblePath::from_bytes(&storage_key),
            };
            assert_eq!(reader.get(&key).unwrap(), Some(vec![(a as u8).wrapping_add(k as u8)]));
        }
    }
}

/// Scenario 5: two readers pinned to an old root keep working correctly
/// while the writer commits several more batches, including ones that
/// trigger abandoned-page reuse; once the readers close, a later batch can
/// reuse the pages they were protecting.
#[test]
fn scenario_5_old_readers_survive_reuse_around_them() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(dir.path(), 3);

    let key = [0x10u8; 32];
    let mut batch = db.begin_next_batch().unwrap();
    batch.set(&state_key(&key), &[1]).unwrap();
    db.commit(batch, None).unwrap(); // batch 1

    let mut reader_a = db.begin_read_only_batch();
    let mut reader_b = db.begin_read_only_batch();
    assert_eq!(reader_a.get(&state_key(&key)).unwrap(), Some(vec![1]));

    let mut batch = db.begin_next_batch().unwrap();
    batch.set(&state_key(&key), &[2]).unwrap();
    db.commit(batch, None).unwrap(); // batch 2

    let mut batch = db.begin_next_batch().unwrap();
    batch.set(&state_key(&key), &[3]).unwrap();
    db.commit(batch, None).unwrap(); // batch 3: may start reclaiming pages abandoned at batch 1,
                                      // but reader_a/reader_b still pin batch 1 alive.

    assert_eq!(reader_a.get(&state_key(&key)).unwrap(), Some(vec![1]));
    assert_eq!(reader_b.get(&state_key(&key)).unwrap(), Some(vec![1]));

    drop(reader_a);
    drop(reader_b);

    let mut batch = db.begin_next_batch().unwrap();
    batch.set(&state_key(&key), &[4]).unwrap();
    db.commit(batch, None).unwrap(); // batch 4: pages abandoned at batch 1 are now fair game.

    let mut reader = db.begin_read_only_batch();
    assert_eq!(reader.get(&state_key(&key)).unwrap(), Some(vec![4]));
}

/// Scenario 6 (multi-head): two heads branch from a common root; each
/// commits a speculative batch; finalizing one does not disturb the
/// other's own (still-pending) view of its own writes.
#[test]
fn scenario_6_multi_head_branches_stay_isolated() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(dir.path(), 8);
    let chain = MultiHeadChain::new(100); // large threshold: we finalize explicitly.

    let key_a = [0xAAu8; 32];
    let key_b = [0xBBu8; 32];

    let mut head_1 = chain.new_head(&db, [0u8; 32]).unwrap();
    head_1.set(&state_key(&key_a), &[1]).unwrap();
    head_1.set_metadata(1, [0x01u8; 32]).unwrap();
    let proposed_1 = head_1.commit().unwrap();
    let hash_1 = chain.register(proposed_1);

    let mut head_2 = chain.new_head(&db, [0u8; 32]).unwrap();
    head_2.set(&state_key(&key_b), &[2]).unwrap();
    head_2.set_metadata(1, [0x02u8; 32]).unwrap();
    let proposed_2 = head_2.commit().unwrap();
    let _hash_2 = chain.register(proposed_2);

    // Each branch only sees its own write.
    let mut descendant_of_1 = chain.new_head(&db, hash_1).unwrap();
    assert_eq!(descendant_of_1.get(&state_key(&key_a)).unwrap(), Some(vec![1]));
    assert_eq!(descendant_of_1.get(&state_key(&key_b)).unwrap(), None);

    // Finalizing branch 1 persists it into the real database.
    chain.finalize_next(&db).unwrap().expect("branch 1 was pending");
    let mut reader = db.begin_read_only_batch();
    assert_eq!(reader.get(&state_key(&key_a)).unwrap(), Some(vec![1]));
    assert_eq!(reader.get(&state_key(&key_b)).unwrap(), None);
}

/// Delete-by-prefix law: after `delete_by_prefix(p)`, every key starting
/// with `p` reads back as absent, while a sibling key is untouched.
#[test]
fn delete_by_prefix_clears_only_the_matching_subtree() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(dir.path(), 4);

    let mut batch = db.begin_next_batch().unwrap();
    let mut under_prefix = [0u8; 32];
    under_prefix[0] = 0x5A;
    under_prefix[1] = 0x01;
    let mut sibling = [0u8; 32];
    sibling[0] = 0x60;

    batch.set(&state_key(&under_prefix), &[9]).unwrap();
    batch.set(&state_key(&sibling), &[8]).unwrap();
    db.commit(batch, None).unwrap();

    let mut batch = db.begin_next_batch().unwrap();
    let prefix = NibblePath::from_bytes(&[0x5A]).slice_to(2);
    batch.delete_by_prefix(prefix).unwrap();
    db.commit(batch, None).unwrap();

    let mut reader = db.begin_read_only_batch();
    assert_eq!(reader.get(&state_key(&under_prefix)).unwrap(), None);
    assert_eq!(reader.get(&state_key(&sibling)).unwrap(), Some(vec![8]));
}

/// Round-trip across commit: reopening the file yields the same values for
/// every key set before the previous process's last commit.
#[test]
fn round_trip_across_a_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db.paprika");
    let keys: Vec<[u8; 32]> = (0u8..40).map(|i| [i; 32]).collect();

    {
        let manager: Arc<dyn PageManager> = Arc::new(FilePageManager::open(&path, 4096).unwrap());
        let db = PagedDb::open(manager, DbOptions::default(), 4096).unwrap();
        let mut batch = db.begin_next_batch().unwrap();
        for (i, key) in keys.iter().enumerate() {
            batch.set(&state_key(key), &[i as u8]).unwrap();
        }
        db.commit(batch, Some(CommitOptions::FlushDataAndRoot)).unwrap();
    }

    let manager: Arc<dyn PageManager> = Arc::new(FilePageManager::open(&path, 4096).unwrap());
    let db = PagedDb::open(manager, DbOptions::default(), 4096).unwrap();
    let mut reader = db.begin_read_only_batch();
    for (i, key) in keys.iter().enumerate() {
        assert_eq!(reader.get(&state_key(key)).unwrap(), Some(vec![i as u8]));
    }
}

/// History wrap-around: after `HistoryDepth + k` commits, the oldest root
/// slot has been physically reused, but a reader opened before the wrap
/// that is still alive keeps its batch protected from reclaim.
#[test]
fn history_wrap_around_reuses_the_oldest_ring_slot() {
    let dir = tempfile::tempdir().unwrap();
    let history_depth = 3;
    let db = open_db(dir.path(), history_depth);

    let key = [0x99u8; 32];
    for v in 0..(history_depth as u8 + 4) {
        let mut batch = db.begin_next_batch().unwrap();
        batch.set(&state_key(&key), &[v]).unwrap();
        db.commit(batch, None).unwrap();
    }

    let mut reader = db.begin_read_only_batch();
    assert_eq!(reader.get(&state_key(&key)).unwrap(), Some(vec![history_depth as u8 + 3]));
}

/// Set is idempotent in terms of observable state.
#[test]
fn set_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(dir.path(), 4);

    let key = [0x5Eu8; 32];
    let mut batch = db.begin_next_batch().unwrap();
    batch.set(&state_key(&key), &[42]).unwrap();
    batch.set(&state_key(&key), &[42]).unwrap();
    db.commit(batch, None).unwrap();

    let mut reader = db.begin_read_only_batch();
    assert_eq!(reader.get(&state_key(&key)).unwrap(), Some(vec![42]));
}

/// One writer, several concurrent readers: each reader observes a
/// consistent snapshot even while the writer keeps committing.
#[test]
fn one_writer_many_concurrent_readers() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db.paprika");
    let manager: Arc<dyn PageManager> = Arc::new(FilePageManager::open(&path, 1 << 16).unwrap());
    let db = Arc::new(PagedDb::open(manager, DbOptions { history_depth: 6, ..Default::default() }, 1 << 16).unwrap());

    let key = [0x31u8; 32];
    let mut batch = db.begin_next_batch().unwrap();
    batch.set(&state_key(&key), &[0]).unwrap();
    db.commit(batch, None).unwrap();

    crossbeam::scope(|scope| {
        for _ in 0..4 {
            let db = db.clone();
            scope.spawn(move |_| {
                let mut reader = db.begin_read_only_batch();
                let seen = reader.get(&state_key(&[0x31u8; 32])).unwrap();
                assert!(seen.is_some());
            });
        }
        for v in 1..20u8 {
            let mut batch = db.begin_next_batch().unwrap();
            batch.set(&state_key(&key), &[v]).unwrap();
            db.commit(batch, None).unwrap();
        }
    })
    .unwrap();
}
