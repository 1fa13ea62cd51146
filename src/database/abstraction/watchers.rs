use std::{
    collections::{hash_map, HashMap},
    future::Future,
    pin::Pin,
    sync::RwLock,
};
use tokio::sync::watch;

/// Registry of prefix watchers for one tree. `watch` hands out a future
/// resolving on the next write under the prefix; `wake` fires and clears
/// every watcher whose prefix covers the written key.
#[derive(Default)]
pub(super) struct Watchers {
    watchers: RwLock<HashMap<Vec<u8>, (watch::Sender<()>, watch::Receiver<()>)>>,
}

impl Watchers {
    pub(super) fn watch<'a>(
        &'a self,
        prefix: &[u8],
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        let mut rx = match self
            .watchers
            .write()
            .unwrap()
            .entry(prefix.to_vec())
        {
            hash_map::Entry::Occupied(o) => o.get().1.clone(),
            hash_map::Entry::Vacant(v) => {
                let (tx, rx) = watch::channel(());
                v.insert((tx, rx.clone()));
                rx
            }
        };

        Box::pin(async move {
            // Error means the sender was dropped, which also counts as a wake.
            let _ = rx.changed().await;
        })
    }

    pub(super) fn wake(&self, key: &[u8]) {
        let watchers = self.watchers.read().unwrap();
        let mut triggered = Vec::new();

        for length in 0..=key.len() {
            if watchers.contains_key(&key[..length]) {
                triggered.push(key[..length].to_vec());
            }
        }

        drop(watchers);

        if !triggered.is_empty() {
            let mut watchers = self.watchers.write().unwrap();
            for prefix in triggered {
                if let Some(tx) = watchers.remove(&prefix) {
                    let _ = tx.0.send(());
                }
            }
        }
    }
}
