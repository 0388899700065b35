#![cfg(feature = "fjall")]

use std::collections::HashSet;

use blockd_storage::fjall::{FjallOptions, FjallStore};
use blockd_storage::{Column, KeyValueStore, WriteBatch};

#[test]
fn fjall_smoke_roundtrip() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = FjallStore::open(dir.path()).expect("open fjall");
    store.put(Column::Meta, b"key", b"value").expect("put");
    assert_eq!(
        store.get(Column::Meta, b"key").expect("get"),
        Some(b"value".to_vec())
    );

    store.put(Column::Meta, b"prefix:1", b"a").expect("put prefix");
    store.put(Column::Meta, b"prefix:2", b"b").expect("put prefix");
    let keys: HashSet<_> = store
        .scan_prefix(Column::Meta, b"prefix:")
        .expect("scan")
        .into_iter()
        .collect();
    assert_eq!(
        keys,
        HashSet::from([
            (b"prefix:1".to_vec(), b"a".to_vec()),
            (b"prefix:2".to_vec(), b"b".to_vec()),
        ])
    );

    let mut batch = WriteBatch::new();
    batch.put(Column::Meta, b"batch", b"ok");
    batch.delete(Column::Meta, b"key");
    store.write_batch(&batch).expect("batch commit");
    store.sync().expect("sync");

    assert!(store.get(Column::Meta, b"key").expect("get").is_none());
    assert_eq!(
        store.get(Column::Meta, b"batch").expect("get"),
        Some(b"ok".to_vec())
    );
}

#[test]
fn fjall_clear_column() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = FjallStore::open(dir.path()).expect("open fjall");
    for i in 0u32..50 {
        store
            .put(Column::Coins, &i.to_le_bytes(), b"coin")
            .expect("put");
    }
    store.put(Column::Meta, b"keep", b"1").expect("put");
    store.clear_column(Column::Coins).expect("clear");
    assert!(store.scan_prefix(Column::Coins, b"").expect("scan").is_empty());
    assert!(store.get(Column::Meta, b"keep").expect("get").is_some());
}

#[test]
fn fjall_store_rejects_columns_it_did_not_open() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = FjallStore::open_columns(dir.path(), &Column::COINS, FjallOptions::default())
        .expect("open coins columns");
    assert!(store.column_is_empty(Column::CoinsMeta).expect("empty"));
    store.put(Column::CoinsMeta, b"best", &[1u8; 32]).expect("put");
    assert!(!store.column_is_empty(Column::CoinsMeta).expect("not empty"));
    assert!(store.get(Column::BlockIndex, b"missing").is_err());
    let mut batch = WriteBatch::new();
    batch.put(Column::Meta, b"k", b"v");
    assert!(store.write_batch(&batch).is_err());
}
