use std::future::Future;
use std::sync::{Arc, RwLock};

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{oneshot, Mutex};

use crate::db::codec::{decode_feed_states, decode_sources, encode_feed_states, encode_sources};
use crate::db::{Storage, StorageArea, StorageChange, StorageKey};
use crate::error::Result;
use crate::feed::throttle::{apply_outcome, should_skip};
use crate::feed::{ItemEvent, PageNode};
use crate::models::{
    merge_sources, reconcile_feed_states, update_feed_state, FeedState, FeedStateChanges,
    Identity, Source, StateSnapshot,
};

use super::handle::StopHandle;
use super::messaging::ContextKind;

/// One context's view of the shared state.
///
/// The cache is only ever replaced wholesale, so readers holding an older
/// snapshot keep a consistent pair of collections.
pub struct SyncContext {
    kind: ContextKind,
    storage: Arc<dyn Storage>,
    area: StorageArea,
    cache: RwLock<Arc<StateSnapshot>>,
    write_lock: Mutex<()>,
}

impl SyncContext {
    pub fn new(kind: ContextKind, storage: Arc<dyn Storage>, area: StorageArea) -> Arc<Self> {
        Arc::new(Self {
            kind,
            storage,
            area,
            cache: RwLock::new(Arc::new(StateSnapshot::default())),
            write_lock: Mutex::new(()),
        })
    }

    pub fn snapshot(&self) -> Arc<StateSnapshot> {
        let cache = self.cache.read().unwrap_or_else(|p| p.into_inner());
        Arc::clone(&cache)
    }

    /// First read of the persisted state.
    pub async fn load(&self) -> Result<Arc<StateSnapshot>> {
        let snapshot = self.refresh().await?;
        tracing::info!(
            "{} loaded {} sources and {} feeds",
            self.kind,
            snapshot.sources.len(),
            snapshot.feeds.len()
        );
        Ok(snapshot)
    }

    /// Rebuild the cache from storage. On a decode failure the previous
    /// snapshot stays in place.
    pub async fn refresh(&self) -> Result<Arc<StateSnapshot>> {
        let values = self.storage.get(&StorageKey::ALL).await?;
        let raw = |key: StorageKey| values.get(&key).map(String::as_str).unwrap_or("");

        let decoded = decode_sources(raw(StorageKey::Sources))
            .and_then(|sources| Ok((sources, decode_feed_states(raw(StorageKey::FeedStates))?)));
        match decoded {
            Ok((sources, feeds)) => {
                let snapshot = StateSnapshot::new(sources, feeds);
                *self.cache.write().unwrap_or_else(|p| p.into_inner()) = Arc::clone(&snapshot);
                Ok(snapshot)
            }
            Err(e) => {
                tracing::warn!("{} kept its previous state: {}", self.kind, e);
                Err(e)
            }
        }
    }

    /// Fold one storage notification into the cache. Returns whether the
    /// change was for this context's area.
    pub fn apply_change(&self, change: &StorageChange) -> Result<bool> {
        if change.area != self.area {
            return Ok(false);
        }

        let data = change.new_value.as_deref().unwrap_or("");
        match change.key {
            StorageKey::Sources => self.replace_sources(decode_sources(data)?),
            StorageKey::FeedStates => self.replace_feeds(decode_feed_states(data)?),
        }
        tracing::debug!("{} applied change to {}", self.kind, change.key);
        Ok(true)
    }

    pub fn watch_changes(self: &Arc<Self>) -> StopHandle {
        self.watch_changes_with(|_| async {})
    }

    /// Keep the cache in step with storage, calling `on_change` after every
    /// applied change. A lagging subscriber reloads everything.
    pub fn watch_changes_with<F, Fut>(self: &Arc<Self>, on_change: F) -> StopHandle
    where
        F: Fn(StorageKey) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut changes = self.storage.subscribe();
        let context = Arc::downgrade(self);
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

        tokio::spawn(async move {
            loop {
                let received = tokio::select! {
                    biased;
                    _ = &mut stop_rx => break,
                    received = changes.recv() => received,
                };
                let Some(context) = context.upgrade() else {
                    break;
                };

                match received {
                    Ok(change) => match context.apply_change(&change) {
                        Ok(true) => on_change(change.key).await,
                        Ok(false) => {}
                        Err(e) => {
                            tracing::warn!("{} ignored malformed {}: {}", context.kind, change.key, e)
                        }
                    },
                    Err(RecvError::Lagged(missed)) => {
                        tracing::warn!("{} missed {} changes, reloading", context.kind, missed);
                        if context.refresh().await.is_ok() {
                            for key in StorageKey::ALL {
                                on_change(key).await;
                            }
                        }
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        StopHandle::new(move || {
            let _ = stop_tx.send(());
        })
    }

    /// Read-modify-write the feed collection. `f` sees the current snapshot and
    /// returns the new collection; nothing is written when it is unchanged.
    pub async fn update_feeds<R>(
        &self,
        f: impl FnOnce(&StateSnapshot) -> (Vec<FeedState>, R),
    ) -> Result<R> {
        let _guard = self.write_lock.lock().await;
        let current = self.snapshot();
        let (feeds, result) = f(&current);
        if feeds != current.feeds {
            self.write_feeds(feeds).await?;
        }
        Ok(result)
    }

    /// Count one more item of `internal_id`, hidden or shown.
    pub async fn record_outcome(
        &self,
        internal_id: &str,
        was_skipped: bool,
    ) -> Result<Option<FeedState>> {
        self.update_feeds(|snapshot| match snapshot.feed(internal_id) {
            Some(feed) => {
                let next = apply_outcome(feed, was_skipped);
                (
                    update_feed_state(&snapshot.feeds, internal_id, &stat_changes(&next)),
                    Some(next),
                )
            }
            None => (snapshot.feeds.clone(), None),
        })
        .await
    }

    /// Decide whether to hide the item in `event` and record the outcome.
    ///
    /// The decision uses the freshest cached state of the feed; the state
    /// carried by the event only stands in when the cache no longer has it.
    pub async fn record_item<N: PageNode>(&self, event: &ItemEvent<N>) -> Result<bool> {
        let internal_id = event.feed.internal_id.as_str();
        let skip = self
            .update_feeds(|snapshot| {
                let feed = snapshot.feed(internal_id).unwrap_or(&event.feed);
                let skip = should_skip(feed);
                let next = apply_outcome(feed, skip);
                (
                    update_feed_state(&snapshot.feeds, internal_id, &stat_changes(&next)),
                    skip,
                )
            })
            .await?;

        if skip {
            event.outer_node().remove();
        }
        tracing::debug!(
            "{} item from {}",
            if skip { "Skipped" } else { "Showed" },
            event.source.identity.display_name
        );
        Ok(skip)
    }

    pub async fn set_frequency(
        &self,
        internal_id: &str,
        frequency: f64,
    ) -> Result<Option<FeedState>> {
        let changes = FeedStateChanges {
            frequency: Some(frequency),
            ..Default::default()
        };
        self.update_feeds(|snapshot| {
            let feeds = update_feed_state(&snapshot.feeds, internal_id, &changes);
            let updated = feeds.iter().find(|f| f.internal_id == internal_id).cloned();
            (feeds, updated)
        })
        .await
    }

    /// Merge freshly discovered identities into the persisted sources.
    pub async fn merge_discovered(&self, discovered: &[Identity]) -> Result<Vec<Source>> {
        let _guard = self.write_lock.lock().await;
        let existing = decode_sources(&self.read(StorageKey::Sources).await?)?;
        let merged = merge_sources(discovered, &existing);

        if merged == existing {
            self.replace_sources(merged.clone());
        } else {
            tracing::info!(
                "Merged {} discovered sources into {} known",
                discovered.len(),
                existing.len()
            );
            self.write_sources(merged.clone()).await?;
        }
        Ok(merged)
    }

    /// Give every persisted source a feed state.
    pub async fn reconcile_feeds(&self) -> Result<Vec<FeedState>> {
        let _guard = self.write_lock.lock().await;
        let sources = decode_sources(&self.read(StorageKey::Sources).await?)?;
        let existing = decode_feed_states(&self.read(StorageKey::FeedStates).await?)?;
        let reconciled = reconcile_feed_states(&existing, &sources);

        if reconciled == existing {
            self.replace_feeds(reconciled.clone());
        } else {
            tracing::info!(
                "Reconciled feeds: {} -> {}",
                existing.len(),
                reconciled.len()
            );
            self.write_feeds(reconciled.clone()).await?;
        }
        Ok(reconciled)
    }

    async fn read(&self, key: StorageKey) -> Result<String> {
        let mut values = self.storage.get(&[key]).await?;
        Ok(values.remove(&key).unwrap_or_default())
    }

    async fn write_sources(&self, sources: Vec<Source>) -> Result<()> {
        self.storage
            .set(StorageKey::Sources, encode_sources(&sources))
            .await?;
        self.replace_sources(sources);
        Ok(())
    }

    async fn write_feeds(&self, feeds: Vec<FeedState>) -> Result<()> {
        self.storage
            .set(StorageKey::FeedStates, encode_feed_states(&feeds))
            .await?;
        self.replace_feeds(feeds);
        Ok(())
    }

    fn replace_sources(&self, sources: Vec<Source>) {
        let mut cache = self.cache.write().unwrap_or_else(|p| p.into_inner());
        *cache = StateSnapshot::new(sources, cache.feeds.clone());
    }

    fn replace_feeds(&self, feeds: Vec<FeedState>) {
        let mut cache = self.cache.write().unwrap_or_else(|p| p.into_inner());
        *cache = StateSnapshot::new(cache.sources.clone(), feeds);
    }
}

fn stat_changes(next: &FeedState) -> FeedStateChanges {
    FeedStateChanges {
        skips: Some(next.stats.skips),
        total: Some(next.stats.total),
        ..Default::default()
    }
}
