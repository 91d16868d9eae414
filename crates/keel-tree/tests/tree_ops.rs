//! End-to-end tree operation tests over a real page database.

use keel_common::config::DbConfig;
use keel_common::error::KeelError;
use keel_tree::tree::{TreeStats, VerifyObserver};
use keel_tree::Database;
use keel_txn::{IsolationLevel, Txn};
use tempfile::tempdir;

fn small_config() -> DbConfig {
    DbConfig {
        // Small pages force splits early.
        page_size: 512,
        max_cached_nodes: 256,
        ..DbConfig::default()
    }
}

fn open_db(dir: &std::path::Path) -> Database {
    Database::open(dir, small_config()).unwrap()
}

#[test]
fn test_store_load_delete() {
    let dir = tempdir().unwrap();
    let db = open_db(dir.path());
    let tree = db.open_tree(b"kv").unwrap();

    tree.store(None, b"hello", Some(b"world")).unwrap();
    assert_eq!(tree.load(None, b"hello").unwrap(), Some(b"world".to_vec()));

    // Storing null deletes.
    tree.store(None, b"hello", None).unwrap();
    assert_eq!(tree.load(None, b"hello").unwrap(), None);
    assert!(!tree.exists(None, b"hello").unwrap());
}

#[test]
fn test_empty_key_rejected() {
    let dir = tempdir().unwrap();
    let db = open_db(dir.path());
    let tree = db.open_tree(b"kv").unwrap();

    let err = tree.store(None, b"", Some(b"v")).unwrap_err();
    assert!(matches!(err, KeelError::InvalidArgument { .. }));
    let err = tree.load(None, b"").unwrap_err();
    assert!(matches!(err, KeelError::InvalidArgument { .. }));
}

#[test]
fn test_insert_replace_update_semantics() {
    let dir = tempdir().unwrap();
    let db = open_db(dir.path());
    let tree = db.open_tree(b"kv").unwrap();

    assert!(tree.insert(None, b"k", b"v1").unwrap());
    // Insert is refused when the key exists.
    assert!(!tree.insert(None, b"k", b"v2").unwrap());
    assert_eq!(tree.load(None, b"k").unwrap(), Some(b"v1".to_vec()));

    assert!(tree.replace(None, b"k", b"v2").unwrap());
    // Replace is a no-op when absent.
    assert!(!tree.replace(None, b"missing", b"v").unwrap());

    // Update reports whether anything changed.
    assert!(!tree.update(None, b"k", Some(b"v2")).unwrap());
    assert!(tree.update(None, b"k", Some(b"v3")).unwrap());

    let old = tree.exchange(None, b"k", Some(b"v4")).unwrap();
    assert_eq!(old, Some(b"v3".to_vec()));
}

#[test]
fn test_many_keys_split_and_stay_sorted() {
    let dir = tempdir().unwrap();
    let db = open_db(dir.path());
    let tree = db.open_tree(b"big").unwrap();

    let mut keys: Vec<Vec<u8>> = (0..500u32)
        .map(|i| format!("key-{:08}", i * 7919 % 500).into_bytes())
        .collect();
    for key in &keys {
        tree.store(None, key, Some(key)).unwrap();
    }

    keys.sort();
    keys.dedup();

    // Forward iteration yields every key in unsigned order.
    let mut cursor = tree.new_cursor(None);
    let mut seen = Vec::new();
    let mut positioned = cursor.first().unwrap();
    while positioned {
        seen.push(cursor.key().unwrap().to_vec());
        positioned = cursor.next().unwrap();
    }
    assert_eq!(seen, keys);

    // Backward iteration is the mirror image.
    let mut reversed = Vec::new();
    let mut positioned = cursor.last().unwrap();
    while positioned {
        reversed.push(cursor.key().unwrap().to_vec());
        positioned = cursor.previous().unwrap();
    }
    reversed.reverse();
    assert_eq!(reversed, keys);

    assert_eq!(tree.count(None, None).unwrap(), keys.len() as u64);
}

#[test]
fn test_structure_verifies_after_churn() {
    struct Collector {
        nodes: usize,
        failures: Vec<String>,
    }
    impl VerifyObserver for Collector {
        fn node(&mut self, _id: keel_common::types::PageId, _depth: usize, _entries: usize) -> bool {
            self.nodes += 1;
            true
        }
        fn fail(&mut self, _id: keel_common::types::PageId, message: &str) {
            self.failures.push(message.to_string());
        }
    }

    let dir = tempdir().unwrap();
    let db = open_db(dir.path());
    let tree = db.open_tree(b"churn").unwrap();

    for i in 0..400u32 {
        let key = format!("{:08}", i).into_bytes();
        tree.store(None, &key, Some(&key)).unwrap();
    }
    for i in (0..400u32).step_by(3) {
        let key = format!("{:08}", i).into_bytes();
        tree.delete(None, &key).unwrap();
    }

    let mut observer = Collector {
        nodes: 0,
        failures: Vec::new(),
    };
    assert!(tree.verify(&mut observer).unwrap(), "{:?}", observer.failures);
    assert!(observer.nodes > 1);
}

#[test]
fn test_find_ge_le_bounds() {
    let dir = tempdir().unwrap();
    let db = open_db(dir.path());
    let tree = db.open_tree(b"bounds").unwrap();

    for key in [b"b".as_ref(), b"d", b"f"] {
        tree.store(None, key, Some(b"x")).unwrap();
    }

    let mut cursor = tree.new_cursor(None);
    assert!(cursor.find_ge(b"c").unwrap());
    assert_eq!(cursor.key().unwrap(), b"d");
    assert!(cursor.find_ge(b"d").unwrap());
    assert_eq!(cursor.key().unwrap(), b"d");
    assert!(cursor.find_gt(b"d").unwrap());
    assert_eq!(cursor.key().unwrap(), b"f");
    assert!(!cursor.find_gt(b"f").unwrap());

    assert!(cursor.find_le(b"c").unwrap());
    assert_eq!(cursor.key().unwrap(), b"b");
    assert!(cursor.find_lt(b"b").unwrap() == false);
    assert!(cursor.find_le(b"f").unwrap());
    assert_eq!(cursor.key().unwrap(), b"f");
}

#[test]
fn test_find_nearby_within_leaf() {
    let dir = tempdir().unwrap();
    let db = open_db(dir.path());
    let tree = db.open_tree(b"nearby").unwrap();

    for i in 0..10u8 {
        tree.store(None, &[b'a' + i], Some(&[i])).unwrap();
    }

    let mut cursor = tree.new_cursor(None);
    cursor.find(b"c").unwrap();
    cursor.find_nearby(b"e").unwrap();
    assert_eq!(cursor.load().unwrap(), Some(vec![4]));
}

#[test]
fn test_large_values_fragment() {
    let dir = tempdir().unwrap();
    let db = open_db(dir.path());
    let tree = db.open_tree(b"frag").unwrap();

    // Far larger than a 512-byte page.
    let value: Vec<u8> = (0..10_000).map(|i| (i % 251) as u8).collect();
    tree.store(None, b"big", Some(&value)).unwrap();
    assert_eq!(tree.load(None, b"big").unwrap(), Some(value.clone()));

    let mut cursor = tree.new_cursor(None);
    cursor.find(b"big").unwrap();
    assert_eq!(cursor.value_length().unwrap(), Some(10_000));

    let mut buf = [0u8; 64];
    let n = cursor.value_read(5000, &mut buf).unwrap().unwrap();
    assert_eq!(n, 64);
    assert_eq!(&buf[..], &value[5000..5064]);

    cursor.value_write(5000, b"patched").unwrap();
    let loaded = tree.load(None, b"big").unwrap().unwrap();
    assert_eq!(&loaded[5000..5007], b"patched");
    assert_eq!(loaded.len(), 10_000);

    cursor.find(b"big").unwrap();
    cursor.value_clear().unwrap();
    assert_eq!(tree.load(None, b"big").unwrap(), Some(Vec::new()));

    // A replace over a fragmented value frees and rebuilds the chain.
    tree.store(None, b"big", Some(&value)).unwrap();
    tree.store(None, b"big", Some(b"small")).unwrap();
    assert_eq!(tree.load(None, b"big").unwrap(), Some(b"small".to_vec()));
}

#[test]
fn test_reopen_preserves_contents() {
    let dir = tempdir().unwrap();
    let keys: Vec<Vec<u8>> = (0..200u32).map(|i| format!("{:06}", i).into_bytes()).collect();

    {
        let db = open_db(dir.path());
        let tree = db.open_tree(b"persist").unwrap();
        for key in &keys {
            tree.store(None, key, Some(key)).unwrap();
        }
        db.checkpoint().unwrap();
    }

    let db = open_db(dir.path());
    let tree = db.open_tree(b"persist").unwrap();
    let mut cursor = tree.new_cursor(None);
    let mut seen = Vec::new();
    let mut positioned = cursor.first().unwrap();
    while positioned {
        seen.push(cursor.key().unwrap().to_vec());
        positioned = cursor.next().unwrap();
    }
    assert_eq!(seen, keys);
}

#[test]
fn test_uncheckpointed_changes_roll_back() {
    let dir = tempdir().unwrap();
    {
        let db = open_db(dir.path());
        let tree = db.open_tree(b"wal").unwrap();
        tree.store(None, b"durable", Some(b"yes")).unwrap();
        db.checkpoint().unwrap();
        tree.store(None, b"volatile", Some(b"no")).unwrap();
        // No checkpoint for the second store.
    }

    let db = open_db(dir.path());
    let tree = db.open_tree(b"wal").unwrap();
    assert_eq!(tree.load(None, b"durable").unwrap(), Some(b"yes".to_vec()));
    assert_eq!(tree.load(None, b"volatile").unwrap(), None);
}

#[test]
fn test_snapshot_restore_tree_contents() {
    let source_dir = tempdir().unwrap();
    let restored_dir = tempdir().unwrap();

    let keys: Vec<Vec<u8>> = (0..300u32)
        .map(|i| format!("snap-{:06}", i).into_bytes())
        .collect();
    {
        let db = open_db(source_dir.path());
        let tree = db.open_tree(b"snap").unwrap();
        for (i, key) in keys.iter().enumerate() {
            let value = vec![(i % 250) as u8; 1 + i % 100];
            tree.store(None, key, Some(&value)).unwrap();
        }
        db.checkpoint().unwrap();

        let mut stream = Vec::new();
        db.page_db().write_snapshot(&mut stream).unwrap();

        keel_store::restore_from_snapshot(
            &mut stream.as_slice(),
            restored_dir.path().join("keel.db"),
            &small_config(),
        )
        .unwrap();
    }

    let db = open_db(restored_dir.path());
    let tree = db.open_tree(b"snap").unwrap();
    let mut cursor = tree.new_cursor(None);
    let mut seen = Vec::new();
    let mut positioned = cursor.first().unwrap();
    while positioned {
        seen.push(cursor.key().unwrap().to_vec());
        positioned = cursor.next().unwrap();
    }
    assert_eq!(seen, keys);
    for (i, key) in keys.iter().enumerate() {
        let value = vec![(i % 250) as u8; 1 + i % 100];
        assert_eq!(tree.load(None, key).unwrap(), Some(value));
    }
}

#[test]
fn test_views_enforce_range() {
    let dir = tempdir().unwrap();
    let db = open_db(dir.path());
    let tree = db.open_tree(b"views").unwrap();

    for key in [b"apple".as_ref(), b"banana", b"cherry", b"date"] {
        tree.store(None, key, Some(b"x")).unwrap();
    }

    let view = tree.view_ge(b"banana");
    assert_eq!(view.load(None, b"apple").unwrap(), None);
    assert!(view.load(None, b"banana").unwrap().is_some());

    let err = view.store(None, b"apple", Some(b"y")).unwrap_err();
    assert!(matches!(err, KeelError::ViewConstraint { .. }));
    view.store(None, b"coconut", Some(b"y")).unwrap();

    let prefix = tree.view_prefix(b"ba");
    let mut cursor = prefix.new_cursor(None);
    assert!(cursor.first().unwrap());
    assert_eq!(cursor.key().unwrap(), b"banana");
    assert!(!cursor.next().unwrap());

    let lt = tree.view_lt(b"cherry");
    assert_eq!(lt.count().unwrap(), 2);
}

#[test]
fn test_triggers_fire_after_mutations() {
    use keel_tree::trigger::Trigger;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Recorder {
        stores: AtomicUsize,
        deletes: AtomicUsize,
        last_old: Mutex<Option<Vec<u8>>>,
    }
    impl Trigger for Recorder {
        fn on_store(&self, _key: &[u8], old: Option<&[u8]>, new: Option<&[u8]>) {
            if new.is_some() {
                self.stores.fetch_add(1, Ordering::SeqCst);
            } else {
                self.deletes.fetch_add(1, Ordering::SeqCst);
            }
            *self.last_old.lock().unwrap() = old.map(<[u8]>::to_vec);
        }
    }

    let dir = tempdir().unwrap();
    let db = open_db(dir.path());
    let tree = db.open_tree(b"triggers").unwrap();

    let recorder = Arc::new(Recorder::default());
    tree.add_trigger(recorder.clone());

    tree.store(None, b"k", Some(b"v1")).unwrap();
    tree.store(None, b"k", Some(b"v2")).unwrap();
    tree.delete(None, b"k").unwrap();

    assert_eq!(recorder.stores.load(Ordering::SeqCst), 2);
    assert_eq!(recorder.deletes.load(Ordering::SeqCst), 1);
    assert_eq!(
        recorder.last_old.lock().unwrap().as_deref(),
        Some(b"v2".as_ref())
    );

    let as_trigger: Arc<dyn Trigger> = recorder.clone();
    assert!(tree.remove_trigger(&as_trigger));
    tree.store(None, b"k", Some(b"v3")).unwrap();
    assert_eq!(recorder.stores.load(Ordering::SeqCst), 2);
}

#[test]
fn test_transactions_lock_rows() {
    let dir = tempdir().unwrap();
    let db = open_db(dir.path());
    let tree = db.open_tree(b"txn").unwrap();

    let writer = Txn::begin(IsolationLevel::RepeatableRead);
    tree.store(Some(&writer), b"contested", Some(b"w")).unwrap();

    // Another transaction cannot read the locked row in time.
    let mut reader = Txn::begin(IsolationLevel::RepeatableRead);
    reader.set_lock_timeout_nanos(10_000_000);
    let err = tree.load(Some(&reader), b"contested").unwrap_err();
    assert!(matches!(err, KeelError::LockFailed { .. }));

    // Releasing the writer's locks unblocks the reader.
    db.lock_manager().release_all(writer.id());
    assert_eq!(
        tree.load(Some(&reader), b"contested").unwrap(),
        Some(b"w".to_vec())
    );
    db.lock_manager().release_all(reader.id());
}

#[test]
fn test_read_uncommitted_skips_locks() {
    let dir = tempdir().unwrap();
    let db = open_db(dir.path());
    let tree = db.open_tree(b"dirty-read").unwrap();

    let writer = Txn::begin(IsolationLevel::RepeatableRead);
    tree.store(Some(&writer), b"k", Some(b"v")).unwrap();

    let mut reader = Txn::begin(IsolationLevel::ReadUncommitted);
    reader.set_lock_timeout_nanos(1);
    assert_eq!(tree.load(Some(&reader), b"k").unwrap(), Some(b"v".to_vec()));
    db.lock_manager().release_all(writer.id());
}

#[test]
fn test_drop_tree_requires_empty() {
    let dir = tempdir().unwrap();
    let db = open_db(dir.path());
    let tree = db.open_tree(b"droppable").unwrap();

    tree.store(None, b"k", Some(b"v")).unwrap();
    let err = tree.clone().drop_tree().unwrap_err();
    assert!(matches!(err, KeelError::IllegalState { .. }));

    tree.delete(None, b"k").unwrap();
    tree.drop_tree().unwrap();

    // The name is free for a fresh tree.
    let again = db.open_tree(b"droppable").unwrap();
    assert_eq!(again.load(None, b"k").unwrap(), None);
}

#[test]
fn test_analyze_estimates() {
    let dir = tempdir().unwrap();
    let db = open_db(dir.path());
    let tree = db.open_tree(b"stats").unwrap();

    for i in 0..300u32 {
        let key = format!("{:08}", i).into_bytes();
        tree.store(None, &key, Some(b"v")).unwrap();
    }

    let stats: TreeStats = tree.analyze(8).unwrap();
    assert!(stats.height >= 2);
    assert!(stats.entry_count > 0);
}

#[test]
fn test_skip_and_random() {
    let dir = tempdir().unwrap();
    let db = open_db(dir.path());
    let tree = db.open_tree(b"skip").unwrap();

    for i in 0..50u8 {
        tree.store(None, &[i], Some(&[i])).unwrap();
    }

    let mut cursor = tree.new_cursor(None);
    assert!(cursor.first().unwrap());
    assert!(cursor.skip(10).unwrap());
    assert_eq!(cursor.key().unwrap(), &[10]);
    assert!(cursor.skip(-5).unwrap());
    assert_eq!(cursor.key().unwrap(), &[5]);

    assert!(cursor.random().unwrap());
    assert!(cursor.key().is_some());
}

#[test]
fn test_compact_keeps_contents() {
    let dir = tempdir().unwrap();
    let db = open_db(dir.path());
    let tree = db.open_tree(b"compact").unwrap();

    for i in 0..200u32 {
        let key = format!("{:08}", i).into_bytes();
        tree.store(None, &key, Some(&vec![b'x'; 40])).unwrap();
    }
    for i in (0..200u32).step_by(2) {
        let key = format!("{:08}", i).into_bytes();
        tree.delete(None, &key).unwrap();
    }

    tree.compact().unwrap();
    assert_eq!(tree.count(None, None).unwrap(), 100);
    assert_eq!(
        tree.load(None, b"00000001").unwrap(),
        Some(vec![b'x'; 40])
    );
}
