// =============================================================================
// Conflux Matrix Sync Engine - In-Memory Storage Engine
// =============================================================================
//
// Project: Conflux - Matrix Sync Read Path Engine
// License: Apache 2.0 / MIT
//
// Description:
//   BTreeMap-backed engine. Every tree lives behind one lock, so a
//   snapshot is one read acquisition: the atomic multi-stream view the
//   sync session is built on.
//
// =============================================================================

use std::{
    collections::{BTreeMap, HashMap},
    future::Future,
    ops::Bound,
    pin::Pin,
    sync::{Arc, Mutex, RwLock},
};

use super::{watchers::Watchers, KeyValueDatabaseEngine, KvSnapshot, KvTree};
use crate::{utils, Config, Result};

type Tree = BTreeMap<Vec<u8>, Vec<u8>>;

pub struct Engine {
    inner: Arc<Inner>,
}

struct Inner {
    trees: RwLock<BTreeMap<String, Tree>>,
    opened: Mutex<HashMap<&'static str, Arc<MemoryTree>>>,
}

struct MemoryTree {
    name: &'static str,
    inner: Arc<Inner>,
    watchers: Watchers,
}

pub struct Snapshot {
    trees: BTreeMap<String, Tree>,
}

impl KeyValueDatabaseEngine for Engine {
    fn open(_config: &Config) -> Result<Self> {
        Ok(Self {
            inner: Arc::new(Inner {
                trees: RwLock::new(BTreeMap::new()),
                opened: Mutex::new(HashMap::new()),
            }),
        })
    }

    fn open_tree(&self, name: &'static str) -> Result<Arc<dyn KvTree>> {
        let mut opened = self.inner.opened.lock().unwrap();
        let tree = opened
            .entry(name)
            .or_insert_with(|| {
                self.inner
                    .trees
                    .write()
                    .unwrap()
                    .entry(name.to_owned())
                    .or_default();

                Arc::new(MemoryTree {
                    name,
                    inner: Arc::clone(&self.inner),
                    watchers: Watchers::default(),
                })
            })
            .clone();

        Ok(tree)
    }

    fn snapshot(&self) -> Result<Box<dyn KvSnapshot>> {
        let trees = self.inner.trees.read().unwrap().clone();
        Ok(Box::new(Snapshot { trees }))
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn memory_usage(&self) -> Result<String> {
        let trees = self.inner.trees.read().unwrap();
        let entries: usize = trees.values().map(BTreeMap::len).sum();
        let bytes: usize = trees
            .values()
            .flat_map(|tree| tree.iter())
            .map(|(key, value)| key.len() + value.len())
            .sum();

        Ok(format!(
            "{} trees, {entries} entries, approx {bytes} bytes",
            trees.len()
        ))
    }
}

impl MemoryTree {
    fn with_tree<T>(&self, f: impl FnOnce(&Tree) -> T) -> T {
        let trees = self.inner.trees.read().unwrap();
        f(trees.get(self.name).expect("tree was created on open"))
    }

    fn with_tree_mut<T>(&self, f: impl FnOnce(&mut Tree) -> T) -> T {
        let mut trees = self.inner.trees.write().unwrap();
        f(trees.get_mut(self.name).expect("tree was created on open"))
    }
}

impl KvTree for MemoryTree {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.with_tree(|tree| tree.get(key).cloned()))
    }

    fn insert(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.with_tree_mut(|tree| {
            tree.insert(key.to_vec(), value.to_vec());
        });
        self.watchers.wake(key);

        Ok(())
    }

    fn insert_batch(&self, iter: &mut dyn Iterator<Item = (Vec<u8>, Vec<u8>)>) -> Result<()> {
        let mut keys = Vec::new();
        self.with_tree_mut(|tree| {
            for (key, value) in iter {
                keys.push(key.clone());
                tree.insert(key, value);
            }
        });
        for key in keys {
            self.watchers.wake(&key);
        }

        Ok(())
    }

    fn remove(&self, key: &[u8]) -> Result<()> {
        self.with_tree_mut(|tree| {
            tree.remove(key);
        });

        Ok(())
    }

    fn iter<'a>(&'a self) -> Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + 'a> {
        let pairs: Vec<_> = self.with_tree(|tree| {
            tree.iter()
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect()
        });

        Box::new(pairs.into_iter())
    }

    fn iter_from<'a>(
        &'a self,
        from: &[u8],
        backwards: bool,
    ) -> Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + 'a> {
        let pairs: Vec<_> = self.with_tree(|tree| range_from(tree, from, backwards));

        Box::new(pairs.into_iter())
    }

    fn increment(&self, key: &[u8]) -> Result<Vec<u8>> {
        Ok(self.with_tree_mut(|tree| {
            let new = utils::increment(tree.get(key).map(Vec::as_slice));
            tree.insert(key.to_vec(), new.clone());
            new
        }))
    }

    fn scan_prefix<'a>(
        &'a self,
        prefix: Vec<u8>,
    ) -> Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + 'a> {
        let pairs: Vec<_> = self.with_tree(|tree| prefix_scan(tree, &prefix));

        Box::new(pairs.into_iter())
    }

    fn watch_prefix<'a>(&'a self, prefix: &[u8]) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        self.watchers.watch(prefix)
    }
}

impl KvSnapshot for Snapshot {
    fn get(&self, tree: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.trees.get(tree).and_then(|tree| tree.get(key).cloned()))
    }

    fn iter<'a>(&'a self, tree: &str) -> Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + 'a> {
        match self.trees.get(tree) {
            Some(tree) => Box::new(
                tree.iter()
                    .map(|(key, value)| (key.clone(), value.clone())),
            ),
            None => Box::new(std::iter::empty()),
        }
    }

    fn iter_from<'a>(
        &'a self,
        tree: &str,
        from: &[u8],
        backwards: bool,
    ) -> Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + 'a> {
        match self.trees.get(tree) {
            Some(tree) => Box::new(range_from(tree, from, backwards).into_iter()),
            None => Box::new(std::iter::empty()),
        }
    }

    fn scan_prefix<'a>(
        &'a self,
        tree: &str,
        prefix: Vec<u8>,
    ) -> Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + 'a> {
        match self.trees.get(tree) {
            Some(tree) => Box::new(prefix_scan(tree, &prefix).into_iter()),
            None => Box::new(std::iter::empty()),
        }
    }
}

fn range_from(tree: &Tree, from: &[u8], backwards: bool) -> Vec<(Vec<u8>, Vec<u8>)> {
    if backwards {
        tree.range::<[u8], _>((Bound::Unbounded, Bound::Included(from)))
            .rev()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    } else {
        tree.range::<[u8], _>((Bound::Included(from), Bound::Unbounded))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }
}

fn prefix_scan(tree: &Tree, prefix: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
    tree.range::<[u8], _>((Bound::Included(prefix), Bound::Unbounded))
        .take_while(|(key, _)| key.starts_with(prefix))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}
