//! Watch-backed local caches and their event plumbing.
//!
//! Each watched kind gets a [`Store`] fed by a `kube` watcher stream. The
//! driver translates the stream into [`RawEvent`]s and hands them to a
//! router closure, which only enqueues work keys; it must never block.
use std::{
    collections::HashMap,
    fmt::Debug,
    sync::{Arc, RwLock},
};

use anyhow::anyhow;
use futures::{StreamExt, TryStreamExt};
use kube::{
    runtime::{watcher, WatchStreamExt},
    Api, Resource,
};
use serde::de::DeserializeOwned;
use tokio::{sync::watch, task::JoinHandle};
use tracing::warn;

use crate::loadtest::work_key;

/// A change notification from the watch cache.
#[derive(Debug, Clone)]
pub enum RawEvent<K> {
    /// Object was created (or first observed).
    Added(K),
    /// Object changed; both the previously cached and the new state.
    Updated {
        /// Previously cached state.
        old: K,
        /// New state.
        new: K,
    },
    /// Object was deleted.
    Deleted(Tombstone<K>),
}

/// Final state delivered with a deletion.
///
/// When a re-list reveals that an object disappeared during a watch gap, the
/// watch missed the final state and only the last cached copy is available.
#[derive(Debug, Clone)]
pub enum Tombstone<K> {
    /// The deletion was observed directly.
    Actual(K),
    /// The deletion happened during a watch gap; this is the last known state.
    FinalStateUnknown(K),
}

impl<K> Tombstone<K> {
    /// Unwrap to the last known object state.
    pub fn into_inner(self) -> K {
        match self {
            Tombstone::Actual(obj) | Tombstone::FinalStateUnknown(obj) => obj,
        }
    }
}

/// Read-only local mirror of one watched kind.
///
/// Objects handed out are clones; the cache itself is never mutated by
/// consumers.
pub struct Store<K> {
    objects: RwLock<HashMap<String, K>>,
    synced: watch::Sender<bool>,
}

impl<K> Default for Store<K> {
    fn default() -> Self {
        Self {
            objects: RwLock::new(HashMap::new()),
            synced: watch::channel(false).0,
        }
    }
}

impl<K> Store<K>
where
    K: Resource + Clone,
{
    /// Fetch a cached object by work key.
    pub fn get(&self, key: &str) -> Option<K> {
        self.read().get(key).cloned()
    }

    /// True once the initial list completed.
    pub fn has_synced(&self) -> bool {
        *self.synced.borrow()
    }

    /// Subscribe to the synced flag.
    pub fn synced(&self) -> watch::Receiver<bool> {
        self.synced.subscribe()
    }

    /// Number of cached objects.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// True when the cache holds no objects.
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Fold one watcher event into the cache, returning the change
    /// notifications it implies.
    pub(crate) fn apply_watcher_event(&self, event: watcher::Event<K>) -> Vec<RawEvent<K>> {
        match event {
            watcher::Event::Applied(obj) => {
                let key = store_key(&obj);
                let old = self.write().insert(key, obj.clone());
                vec![match old {
                    Some(old) => RawEvent::Updated { old, new: obj },
                    None => RawEvent::Added(obj),
                }]
            }
            watcher::Event::Deleted(obj) => {
                let key = store_key(&obj);
                self.write().remove(&key);
                vec![RawEvent::Deleted(Tombstone::Actual(obj))]
            }
            watcher::Event::Restarted(objs) => {
                let mut events = Vec::with_capacity(objs.len());
                {
                    let mut current = self.write();
                    let mut old = std::mem::take(&mut *current);
                    for new in objs {
                        let key = store_key(&new);
                        match old.remove(&key) {
                            Some(old) => events.push(RawEvent::Updated {
                                old,
                                new: new.clone(),
                            }),
                            None => events.push(RawEvent::Added(new.clone())),
                        }
                        current.insert(key, new);
                    }
                    // Whatever remains vanished during the watch gap.
                    for (_, gone) in old {
                        events.push(RawEvent::Deleted(Tombstone::FinalStateUnknown(gone)));
                    }
                }
                self.synced.send_replace(true);
                events
            }
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, K>> {
        self.objects.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, K>> {
        self.objects.write().unwrap_or_else(|e| e.into_inner())
    }
}

/// Work key of a cached object: `"<ns>/<name>"`, bare name when cluster scoped.
pub(crate) fn store_key<K: Resource>(obj: &K) -> String {
    let meta = obj.meta();
    work_key(
        meta.namespace.as_deref(),
        meta.name.as_deref().unwrap_or_default(),
    )
}

/// Drive a watcher stream into the store, forwarding change notifications to
/// the handler. The handler runs on the watch task and must not block.
pub(crate) fn spawn_informer<K>(
    api: Api<K>,
    config: watcher::Config,
    store: Arc<Store<K>>,
    handler: impl Fn(RawEvent<K>) + Send + Sync + 'static,
) -> JoinHandle<()>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    tokio::spawn(async move {
        let mut stream = watcher(api, config).default_backoff().boxed();
        loop {
            match stream.try_next().await {
                Ok(Some(event)) => {
                    for raw in store.apply_watcher_event(event) {
                        handler(raw);
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    warn!(?err, "watch stream error");
                }
            }
        }
    })
}

/// Block until every store reports its initial list complete.
///
/// Errors when an informer stops before syncing.
pub(crate) async fn wait_for_cache_sync(
    mut receivers: Vec<watch::Receiver<bool>>,
) -> anyhow::Result<()> {
    for rx in receivers.iter_mut() {
        while !*rx.borrow() {
            rx.changed()
                .await
                .map_err(|_| anyhow!("informer stopped before cache sync"))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loadtest::LoadTest;
    use kube::ResourceExt;

    fn named(name: &str, rv: &str) -> LoadTest {
        let mut lt = LoadTest::test(name);
        lt.meta_mut().resource_version = Some(rv.to_owned());
        lt
    }

    #[test]
    fn applied_is_added_then_updated() {
        let store = Store::default();
        let events = store.apply_watcher_event(watcher::Event::Applied(named("t1", "1")));
        assert!(matches!(events.as_slice(), [RawEvent::Added(_)]));

        let events = store.apply_watcher_event(watcher::Event::Applied(named("t1", "2")));
        match events.as_slice() {
            [RawEvent::Updated { old, new }] => {
                assert_eq!(old.resource_version().as_deref(), Some("1"));
                assert_eq!(new.resource_version().as_deref(), Some("2"));
            }
            other => panic!("unexpected events: {other:?}"),
        }
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn deleted_removes_from_cache() {
        let store = Store::default();
        store.apply_watcher_event(watcher::Event::Applied(named("t1", "1")));
        let events = store.apply_watcher_event(watcher::Event::Deleted(named("t1", "2")));
        assert!(matches!(
            events.as_slice(),
            [RawEvent::Deleted(Tombstone::Actual(_))]
        ));
        assert!(store.is_empty());
    }

    #[test]
    fn restart_synthesizes_tombstones_for_watch_gaps() {
        let store = Store::default();
        store.apply_watcher_event(watcher::Event::Applied(named("gone", "1")));
        store.apply_watcher_event(watcher::Event::Applied(named("kept", "1")));

        let events = store.apply_watcher_event(watcher::Event::Restarted(vec![
            named("kept", "2"),
            named("new", "1"),
        ]));

        let mut added = 0;
        let mut updated = 0;
        let mut unknown_final_state = Vec::new();
        for ev in events {
            match ev {
                RawEvent::Added(obj) => {
                    added += 1;
                    assert_eq!(obj.name_any(), "new");
                }
                RawEvent::Updated { new, .. } => {
                    updated += 1;
                    assert_eq!(new.name_any(), "kept");
                }
                RawEvent::Deleted(tombstone) => {
                    assert!(matches!(tombstone, Tombstone::FinalStateUnknown(_)));
                    unknown_final_state.push(tombstone.into_inner().name_any());
                }
            }
        }
        assert_eq!((added, updated), (1, 1));
        assert_eq!(unknown_final_state, vec!["gone".to_owned()]);
        assert_eq!(store.len(), 2);
        assert!(store.get("kept").is_some());
        assert!(store.get("gone").is_none());
    }

    #[test]
    fn restart_marks_store_synced() {
        let store = Store::<LoadTest>::default();
        assert!(!store.has_synced());
        store.apply_watcher_event(watcher::Event::Restarted(vec![]));
        assert!(store.has_synced());
    }

    #[tokio::test]
    async fn cache_sync_barrier_waits_for_all_stores() {
        let a = Store::<LoadTest>::default();
        let b = Store::<LoadTest>::default();
        let wait = wait_for_cache_sync(vec![a.synced(), b.synced()]);
        tokio::pin!(wait);

        // Not synced yet.
        assert!(
            tokio::time::timeout(std::time::Duration::from_millis(10), wait.as_mut())
                .await
                .is_err()
        );

        a.apply_watcher_event(watcher::Event::Restarted(vec![]));
        b.apply_watcher_event(watcher::Event::Restarted(vec![]));
        wait.await.unwrap();
    }
}
