// =============================================================================
// Conflux Matrix Sync Engine - Storage Abstraction
// =============================================================================
//
// Project: Conflux - Matrix Sync Read Path Engine
// License: Apache 2.0 / MIT
//
// Description:
//   Key-value engine, tree and snapshot traits. This is the dialect
//   boundary: the in-memory engine ships here, SQL engines implement the
//   same traits with a read transaction backing the snapshot.
//
// =============================================================================

use std::{future::Future, pin::Pin, sync::Arc};

use crate::{utils, Config, Result};

pub mod memory;
pub mod watchers;

pub trait KeyValueDatabaseEngine: Send + Sync {
    fn open(config: &Config) -> Result<Self>
    where
        Self: Sized;

    fn open_tree(&self, name: &'static str) -> Result<Arc<dyn KvTree>>;

    /// Opens a point-in-time, read-only view that is consistent across
    /// every tree of this engine. Repeated reads through the returned
    /// snapshot observe the same committed set regardless of concurrent
    /// writers.
    fn snapshot(&self) -> Result<Box<dyn KvSnapshot>>;

    fn flush(&self) -> Result<()>;

    fn cleanup(&self) -> Result<()> {
        Ok(())
    }

    fn memory_usage(&self) -> Result<String> {
        Ok("Current database engine does not support memory usage reporting.".to_owned())
    }
}

pub trait KvTree: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    fn insert(&self, key: &[u8], value: &[u8]) -> Result<()>;

    fn insert_batch(&self, iter: &mut dyn Iterator<Item = (Vec<u8>, Vec<u8>)>) -> Result<()>;

    fn remove(&self, key: &[u8]) -> Result<()>;

    fn iter<'a>(&'a self) -> Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + 'a>;

    fn iter_from<'a>(
        &'a self,
        from: &[u8],
        backwards: bool,
    ) -> Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + 'a>;

    /// Increments the big-endian u64 counter stored at `key` and returns
    /// the new value. Counters start at 1; zero means "before anything".
    fn increment(&self, key: &[u8]) -> Result<Vec<u8>>;

    fn scan_prefix<'a>(
        &'a self,
        prefix: Vec<u8>,
    ) -> Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + 'a>;

    /// Resolves once any key starting with `prefix` is written.
    fn watch_prefix<'a>(&'a self, prefix: &[u8]) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

    fn clear(&self) -> Result<()> {
        for (key, _) in self.iter() {
            self.remove(&key)?;
        }

        Ok(())
    }
}

/// A frozen, read-only view over every tree of an engine. Trees are
/// addressed by name; a tree that was never written reads as empty.
pub trait KvSnapshot: Send + Sync {
    fn get(&self, tree: &str, key: &[u8]) -> Result<Option<Vec<u8>>>;

    fn iter<'a>(&'a self, tree: &str) -> Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + 'a>;

    fn iter_from<'a>(
        &'a self,
        tree: &str,
        from: &[u8],
        backwards: bool,
    ) -> Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + 'a>;

    fn scan_prefix<'a>(
        &'a self,
        tree: &str,
        prefix: Vec<u8>,
    ) -> Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + 'a>;

    /// Reads the big-endian u64 counter stored at `key`, zero when unset.
    fn counter(&self, tree: &str, key: &[u8]) -> Result<u64> {
        Ok(match self.get(tree, key)? {
            Some(bytes) => utils::u64_from_bytes(&bytes)
                .map_err(|_| crate::Error::bad_database("Invalid counter bytes in snapshot."))?,
            None => 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{memory::Engine, KeyValueDatabaseEngine, KvTree};
    use crate::Config;

    fn open_engine() -> Engine {
        Engine::open(&Config::default()).unwrap()
    }

    #[test]
    fn tree_insert_get_remove() {
        let engine = open_engine();
        let tree = engine.open_tree("test").unwrap();

        tree.insert(b"alpha", b"1").unwrap();
        assert_eq!(tree.get(b"alpha").unwrap(), Some(b"1".to_vec()));

        tree.remove(b"alpha").unwrap();
        assert_eq!(tree.get(b"alpha").unwrap(), None);
    }

    #[test]
    fn iter_from_respects_direction() {
        let engine = open_engine();
        let tree = engine.open_tree("test").unwrap();
        for i in 1u64..=5 {
            tree.insert(&i.to_be_bytes(), b"x").unwrap();
        }

        let forward: Vec<_> = tree
            .iter_from(&3u64.to_be_bytes(), false)
            .map(|(k, _)| k)
            .collect();
        assert_eq!(forward.len(), 3);
        assert_eq!(forward[0], 3u64.to_be_bytes().to_vec());

        let backward: Vec<_> = tree
            .iter_from(&3u64.to_be_bytes(), true)
            .map(|(k, _)| k)
            .collect();
        assert_eq!(backward.len(), 3);
        assert_eq!(backward[0], 3u64.to_be_bytes().to_vec());
        assert_eq!(backward[2], 1u64.to_be_bytes().to_vec());
    }

    #[test]
    fn increment_is_monotonic() {
        let engine = open_engine();
        let tree = engine.open_tree("counters").unwrap();

        let first = tree.increment(b"pdu").unwrap();
        let second = tree.increment(b"pdu").unwrap();
        assert_eq!(crate::utils::u64_from_bytes(&first).unwrap(), 1);
        assert_eq!(crate::utils::u64_from_bytes(&second).unwrap(), 2);
    }

    #[test]
    fn snapshot_is_frozen_against_later_writes() {
        let engine = open_engine();
        let tree = engine.open_tree("test").unwrap();
        tree.insert(b"key", b"before").unwrap();

        let snapshot = engine.snapshot().unwrap();
        tree.insert(b"key", b"after").unwrap();
        tree.insert(b"other", b"new").unwrap();

        assert_eq!(
            snapshot.get("test", b"key").unwrap(),
            Some(b"before".to_vec())
        );
        assert_eq!(snapshot.get("test", b"other").unwrap(), None);
        // A fresh snapshot observes the writes.
        let later = engine.snapshot().unwrap();
        assert_eq!(later.get("test", b"key").unwrap(), Some(b"after".to_vec()));
    }

    #[test]
    fn scan_prefix_stops_at_prefix_end() {
        let engine = open_engine();
        let tree = engine.open_tree("test").unwrap();
        tree.insert(b"room1\xffa", b"1").unwrap();
        tree.insert(b"room1\xffb", b"2").unwrap();
        tree.insert(b"room2\xffa", b"3").unwrap();

        let hits: Vec<_> = tree.scan_prefix(b"room1\xff".to_vec()).collect();
        assert_eq!(hits.len(), 2);
    }

    #[tokio::test]
    async fn watch_prefix_wakes_on_write() {
        let engine = open_engine();
        let tree = engine.open_tree("test").unwrap();

        let watcher = tree.watch_prefix(b"user\xff");
        tree.insert(b"user\xffdevice", b"ping").unwrap();
        watcher.await;
    }
}
