//! The three roles a running extension is made of. Each owns its own
//! [`SyncContext`]; they only meet through storage and the message hub.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::db::{Storage, StorageArea, StorageKey};
use crate::error::Result;
use crate::feed::{
    discover_sources, DiscoveryOptions, FeedContainer, FeedWatcher, ItemEvent, MutationBatch,
    PageNode, SnapshotAccessor, SourceListProbe, WatchContext,
};
use crate::models::{resolve_from_input, resolve_from_url, FeedState, Identity, Source};

use super::handle::StopHandle;
use super::messaging::{
    ContextKind, Endpoint, Message, MessageHub, MessageListeners, MessageType, ReceiveOptions,
};
use super::sync::SyncContext;

/// Owns the persisted collections: merges discoveries and keeps every source
/// paired with a feed state.
pub struct BackgroundContext {
    _sync: Arc<SyncContext>,
    badge: Arc<AtomicUsize>,
    _endpoint: Endpoint,
    _changes: StopHandle,
    _messages: StopHandle,
}

impl BackgroundContext {
    pub async fn start(
        storage: Arc<dyn Storage>,
        hub: &Arc<MessageHub>,
        area: StorageArea,
    ) -> Result<Self> {
        let sync = SyncContext::new(ContextKind::Background, storage, area);
        sync.load().await?;
        // A previous run may have stopped between the two writes.
        sync.reconcile_feeds().await?;

        let badge = Arc::new(AtomicUsize::new(sync.snapshot().feeds.len()));

        let hook_sync = Arc::clone(&sync);
        let hook_badge = Arc::clone(&badge);
        let changes = sync.watch_changes_with(move |key| {
            let sync = Arc::clone(&hook_sync);
            let badge = Arc::clone(&hook_badge);
            async move {
                match key {
                    StorageKey::Sources => {
                        if let Err(e) = sync.reconcile_feeds().await {
                            tracing::error!("Reconciliation failed: {}", e);
                        }
                    }
                    StorageKey::FeedStates => {
                        let count = sync.snapshot().feeds.len();
                        badge.store(count, Ordering::SeqCst);
                        tracing::debug!("Badge now {}", count);
                    }
                }
            }
        });

        let endpoint = hub.endpoint(ContextKind::Background);
        let listener_sync = Arc::clone(&sync);
        let listener_badge = Arc::clone(&badge);
        let listeners =
            MessageListeners::new().on(MessageType::DidObtainSources, move |message| {
                let sync = Arc::clone(&listener_sync);
                let badge = Arc::clone(&listener_badge);
                async move {
                    let Message::DidObtainSources { sources } = message;
                    let merged = sync.merge_discovered(&sources).await?;
                    let feeds = sync.reconcile_feeds().await?;
                    // The sender reads the badge as soon as this returns.
                    badge.store(feeds.len(), Ordering::SeqCst);
                    Ok(Some(serde_json::json!({
                        "sources": merged.len(),
                        "feeds": feeds.len(),
                    })))
                }
            });
        let messages = endpoint.receive(
            listeners,
            ReceiveOptions {
                broadcast_unhandled: true,
            },
        );

        Ok(Self {
            _sync: sync,
            badge,
            _endpoint: endpoint,
            _changes: changes,
            _messages: messages,
        })
    }

    /// Number of feeds being tracked.
    pub fn badge_count(&self) -> usize {
        self.badge.load(Ordering::SeqCst)
    }
}

/// Runs inside the feed page: discovers subscriptions and throttles items.
pub struct PageContext {
    sync: Arc<SyncContext>,
    endpoint: Endpoint,
    _changes: StopHandle,
}

impl PageContext {
    pub async fn start(
        storage: Arc<dyn Storage>,
        hub: &Arc<MessageHub>,
        area: StorageArea,
    ) -> Result<Self> {
        let sync = SyncContext::new(ContextKind::Page, storage, area);
        sync.load().await?;
        let changes = sync.watch_changes();
        Ok(Self {
            sync,
            endpoint: hub.endpoint(ContextKind::Page),
            _changes: changes,
        })
    }

    /// Read the subscriptions off the page and hand them to the background.
    pub async fn discover<P: SourceListProbe + ?Sized>(
        &self,
        probe: &P,
        options: &DiscoveryOptions,
    ) -> Result<Vec<Identity>> {
        let sources = discover_sources(probe, options).await?;
        let responses = self
            .endpoint
            .send(Message::DidObtainSources {
                sources: sources.clone(),
            })
            .await?;
        tracing::debug!("Discovery answered by {} contexts", responses.len());
        Ok(sources)
    }

    /// Start watching `container`. `page_url` is the page location; a page
    /// that belongs to a single source is left alone.
    pub fn watch<C: FeedContainer>(
        &self,
        container: &C,
        batches: mpsc::UnboundedReceiver<MutationBatch<C::Node>>,
        page_url: Option<&str>,
    ) -> (StopHandle, mpsc::UnboundedReceiver<ItemEvent<C::Node>>) {
        let current_source = page_url.and_then(resolve_from_url);
        let sync = Arc::clone(&self.sync);
        let accessor: SnapshotAccessor = Arc::new(move || WatchContext {
            snapshot: sync.snapshot(),
            current_source: current_source.clone(),
        });

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let handle = FeedWatcher::start(container, batches, accessor, events_tx);
        (handle, events_rx)
    }

    /// Decide on one item, hiding it if it should be skipped.
    pub async fn handle_item<N: PageNode>(&self, event: &ItemEvent<N>) -> Result<bool> {
        self.sync.record_item(event).await
    }
}

/// A source joined with its feed state, as the settings screen lists it.
#[derive(Debug, Clone, PartialEq)]
pub struct SettingsEntry {
    pub source: Source,
    pub feed: FeedState,
}

pub struct SettingsContext {
    sync: Arc<SyncContext>,
    _endpoint: Endpoint,
    _changes: StopHandle,
}

impl SettingsContext {
    pub async fn start(
        storage: Arc<dyn Storage>,
        hub: &Arc<MessageHub>,
        area: StorageArea,
    ) -> Result<Self> {
        let sync = SyncContext::new(ContextKind::Settings, storage, area);
        sync.load().await?;
        let changes = sync.watch_changes();
        Ok(Self {
            sync,
            _endpoint: hub.endpoint(ContextKind::Settings),
            _changes: changes,
        })
    }

    /// Sources that have a feed state, sorted by display name.
    pub fn entries(&self) -> Vec<SettingsEntry> {
        let snapshot = self.sync.snapshot();
        let mut entries: Vec<SettingsEntry> = snapshot
            .sources
            .iter()
            .filter_map(|source| {
                let feed = snapshot.feed(&source.internal_id)?;
                Some(SettingsEntry {
                    source: source.clone(),
                    feed: feed.clone(),
                })
            })
            .collect();
        entries.sort_by(|a, b| {
            a.source
                .identity
                .display_name
                .cmp(&b.source.identity.display_name)
        });
        entries
    }

    /// Set the target frequency of the source called `name`, with or without
    /// its `r/` prefix. `None` when the source is unknown.
    pub async fn set_frequency(&self, name: &str, frequency: f64) -> Result<Option<FeedState>> {
        let Some(identity) = resolve_from_input(name) else {
            return Ok(None);
        };
        let snapshot = self.sync.snapshot();
        let Some(source) = snapshot.source_by_id(&identity.id) else {
            return Ok(None);
        };
        self.sync.set_frequency(&source.internal_id, frequency).await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::db::MemoryStorage;
    use crate::feed::{MemoryPage, SourceLink};
    use crate::models::resolve_from_name;
    use tokio_test::assert_ok;

    async fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        for _ in 0..100 {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        condition()
    }

    fn menu(page: &MemoryPage, names: &[&str]) {
        page.set_menu_links(
            names
                .iter()
                .filter_map(|n| resolve_from_name(n))
                .map(|identity| SourceLink {
                    href: identity.url,
                    text: identity.display_name,
                    icon_url: None,
                })
                .collect(),
        );
    }

    fn options() -> DiscoveryOptions {
        DiscoveryOptions {
            interval: Duration::from_millis(1),
            timeout: Some(Duration::from_millis(50)),
        }
    }

    #[tokio::test]
    async fn discovery_flows_from_page_to_settings() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let hub = MessageHub::new();
        let background = assert_ok!(
            BackgroundContext::start(Arc::clone(&storage), &hub, StorageArea::Sync).await
        );
        let page_ctx =
            assert_ok!(PageContext::start(Arc::clone(&storage), &hub, StorageArea::Sync).await);
        let settings =
            assert_ok!(SettingsContext::start(Arc::clone(&storage), &hub, StorageArea::Sync).await);

        let page = MemoryPage::new();
        menu(&page, &["r/zig", "r/Rust", "r/all"]);
        let found = assert_ok!(page_ctx.discover(&page, &options()).await);
        assert_eq!(found.len(), 2);

        // The background has merged and reconciled before the send returns.
        assert_eq!(background.badge_count(), 2);
        assert!(wait_for(|| settings.entries().len() == 2).await);

        let names: Vec<String> = settings
            .entries()
            .into_iter()
            .map(|e| e.source.identity.display_name)
            .collect();
        assert_eq!(names, vec!["r/Rust", "r/zig"]);
    }

    #[tokio::test]
    async fn page_falls_back_to_overlay_navigation() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let hub = MessageHub::new();
        let background = assert_ok!(
            BackgroundContext::start(Arc::clone(&storage), &hub, StorageArea::Sync).await
        );
        let page_ctx =
            assert_ok!(PageContext::start(Arc::clone(&storage), &hub, StorageArea::Sync).await);

        let page = MemoryPage::new();
        page.set_overlay_links(vec![
            SourceLink {
                href: "https://www.reddit.com/r/pics".into(),
                text: "r/pics".into(),
                icon_url: None,
            },
            SourceLink {
                href: "https://www.reddit.com/r/news".into(),
                text: "Top news".into(),
                icon_url: None,
            },
        ]);
        let found = assert_ok!(page_ctx.discover(&page, &options()).await);
        let ids: Vec<&str> = found.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["r/pics"]);
        assert_eq!(background.badge_count(), 1);
    }

    #[tokio::test]
    async fn page_throttles_items_with_settings_frequency() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let hub = MessageHub::new();
        let _background = assert_ok!(
            BackgroundContext::start(Arc::clone(&storage), &hub, StorageArea::Sync).await
        );
        let page_ctx =
            assert_ok!(PageContext::start(Arc::clone(&storage), &hub, StorageArea::Sync).await);
        let settings =
            assert_ok!(SettingsContext::start(Arc::clone(&storage), &hub, StorageArea::Sync).await);

        let page = MemoryPage::new();
        menu(&page, &["r/rust"]);
        assert_ok!(page_ctx.discover(&page, &options()).await);
        assert!(wait_for(|| !settings.entries().is_empty()).await);

        let updated = assert_ok!(settings.set_frequency("rust", 0.5).await).unwrap();
        assert_eq!(updated.config.frequency, 0.5);
        assert!(wait_for(|| {
            page_ctx
                .sync
                .snapshot()
                .feeds
                .first()
                .is_some_and(|f| f.config.frequency == 0.5)
        })
        .await);

        let (handle, mut events) = page_ctx.watch(&page, page.observe(), None);
        let nodes: Vec<_> = (0..4)
            .map(|i| page.append_item(&format!("https://www.reddit.com/r/rust/comments/{i}")))
            .collect();

        let mut outcomes = Vec::new();
        for _ in 0..4 {
            let event = events.recv().await.unwrap();
            outcomes.push(assert_ok!(page_ctx.handle_item(&event).await));
        }
        handle.stop();

        assert_eq!(outcomes, vec![false, true, false, true]);
        assert!(nodes[1].is_removed());
        assert!(!nodes[2].is_removed());
        assert!(wait_for(|| settings.entries()[0].feed.stats.total == 4).await);
    }

    #[tokio::test]
    async fn single_source_pages_emit_nothing() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let hub = MessageHub::new();
        let _background = assert_ok!(
            BackgroundContext::start(Arc::clone(&storage), &hub, StorageArea::Sync).await
        );
        let page_ctx =
            assert_ok!(PageContext::start(Arc::clone(&storage), &hub, StorageArea::Sync).await);

        let page = MemoryPage::new();
        menu(&page, &["r/rust"]);
        assert_ok!(page_ctx.discover(&page, &options()).await);

        let (_handle, mut events) =
            page_ctx.watch(&page, page.observe(), Some("https://www.reddit.com/r/rust/"));
        page.append_item("https://www.reddit.com/r/rust/comments/1");
        page.disconnect();
        assert!(events.recv().await.is_none());
    }

    #[tokio::test]
    async fn unknown_sources_cannot_be_configured() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let hub = MessageHub::new();
        let settings =
            assert_ok!(SettingsContext::start(Arc::clone(&storage), &hub, StorageArea::Sync).await);

        assert!(assert_ok!(settings.set_frequency("r/nothing", 0.5).await).is_none());
        assert!(assert_ok!(settings.set_frequency("r/all", 0.5).await).is_none());
    }
}
