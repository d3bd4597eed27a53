use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot};

use crate::models::{resolve_from_url, FeedState, Identity, Source, StateSnapshot};
use crate::services::StopHandle;

use super::page::{FeedContainer, MutationBatch, PageNode};

/// What the watcher needs to know at the moment a batch arrives.
#[derive(Debug, Clone, Default)]
pub struct WatchContext {
    pub snapshot: Arc<StateSnapshot>,
    /// Set when the page only shows one source, in which case nothing is filtered.
    pub current_source: Option<Identity>,
}

/// Called once per batch so the watcher always works on the freshest state.
pub type SnapshotAccessor = Arc<dyn Fn() -> WatchContext + Send + Sync>;

/// A feed item joined with the stored state of its source.
#[derive(Debug, Clone)]
pub struct ItemEvent<N> {
    pub item: N,
    pub wrapper: Option<N>,
    pub source: Source,
    pub feed: FeedState,
}

impl<N: PageNode> ItemEvent<N> {
    /// The outermost node belonging to this item.
    pub fn outer_node(&self) -> &N {
        self.wrapper.as_ref().unwrap_or(&self.item)
    }
}

/// Closing the gate drops the event sender; nothing gets through afterwards.
struct EventGate<N> {
    sender: Mutex<Option<mpsc::UnboundedSender<ItemEvent<N>>>>,
}

impl<N> EventGate<N> {
    fn new(sender: mpsc::UnboundedSender<ItemEvent<N>>) -> Self {
        Self {
            sender: Mutex::new(Some(sender)),
        }
    }

    fn emit(&self, event: ItemEvent<N>) -> bool {
        let guard = self.sender.lock().unwrap_or_else(|p| p.into_inner());
        match guard.as_ref() {
            Some(sender) => sender.send(event).is_ok(),
            None => false,
        }
    }

    fn close(&self) {
        self.sender.lock().unwrap_or_else(|p| p.into_inner()).take();
    }
}

pub struct FeedWatcher;

impl FeedWatcher {
    /// Watch `container` for new feed items.
    ///
    /// Items already in the container are emitted synchronously before this
    /// returns; later additions arrive through `batches`. The watcher ends
    /// when the returned handle is stopped or dropped, or when the host closes
    /// `batches`.
    pub fn start<C: FeedContainer>(
        container: &C,
        mut batches: mpsc::UnboundedReceiver<MutationBatch<C::Node>>,
        accessor: SnapshotAccessor,
        events: mpsc::UnboundedSender<ItemEvent<C::Node>>,
    ) -> StopHandle {
        let gate = Arc::new(EventGate::new(events));

        // Additions are only reported from now on, so catch up on what is there.
        let initial = MutationBatch::new(container.items());
        let emitted = emit_batch(&initial, false, &accessor, &gate);
        tracing::debug!("Initial pass over {} items emitted {}", initial.added.len(), emitted);

        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let task_gate = Arc::clone(&gate);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = &mut stop_rx => break,
                    batch = batches.recv() => match batch {
                        Some(batch) => {
                            emit_batch(&batch, true, &accessor, &task_gate);
                        }
                        None => break,
                    },
                }
            }
            task_gate.close();
            tracing::debug!("Feed watcher stopped");
        });

        StopHandle::new(move || {
            gate.close();
            let _ = stop_tx.send(());
        })
    }
}

/// Emit an event for every resolvable item in `batch`, returning how many went out.
/// Live batches carry wrapper nodes; the initial pass hands over items directly.
fn emit_batch<N: PageNode>(
    batch: &MutationBatch<N>,
    wrapped: bool,
    accessor: &SnapshotAccessor,
    gate: &EventGate<N>,
) -> usize {
    if batch.added.is_empty() {
        return 0;
    }

    let context = accessor();
    if let Some(current) = &context.current_source {
        tracing::debug!("Page shows only {}, leaving items alone", current.display_name);
        return 0;
    }

    let mut emitted = 0;
    for node in &batch.added {
        if !node.is_block() {
            continue;
        }
        let Some(item) = node.find_item() else {
            continue;
        };
        let wrapper = wrapped.then(|| node.clone());

        if let Some(event) = resolve_item(item, wrapper, &context.snapshot) {
            if !gate.emit(event) {
                break;
            }
            emitted += 1;
        }
    }
    emitted
}

fn resolve_item<N: PageNode>(
    item: N,
    wrapper: Option<N>,
    snapshot: &StateSnapshot,
) -> Option<ItemEvent<N>> {
    let href = item.source_href()?;
    let identity = resolve_from_url(&href)?;
    let source = snapshot
        .source_by_id(&identity.id)
        .filter(|s| !s.internal_id.is_empty())?;
    let feed = snapshot.feed(&source.internal_id)?;

    Some(ItemEvent {
        item,
        wrapper,
        source: source.clone(),
        feed: feed.clone(),
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::feed::page::{MemoryNode, MemoryPage};
    use crate::models::{resolve_from_name, FeedState};

    fn snapshot(names: &[(&str, &str)]) -> Arc<StateSnapshot> {
        let sources = names
            .iter()
            .map(|(name, id)| Source {
                identity: resolve_from_name(name).unwrap(),
                internal_id: id.to_string(),
                is_subscribed: true,
            })
            .collect();
        let feeds = names.iter().map(|(_, id)| FeedState::new(*id)).collect();
        StateSnapshot::new(sources, feeds)
    }

    fn shared_accessor(context: WatchContext) -> (Arc<Mutex<WatchContext>>, SnapshotAccessor) {
        let shared = Arc::new(Mutex::new(context));
        let reader = Arc::clone(&shared);
        let accessor: SnapshotAccessor = Arc::new(move || reader.lock().unwrap().clone());
        (shared, accessor)
    }

    async fn next_event(
        rx: &mut mpsc::UnboundedReceiver<ItemEvent<MemoryNode>>,
    ) -> Option<ItemEvent<MemoryNode>> {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .ok()
            .flatten()
    }

    #[tokio::test]
    async fn initial_pass_emits_existing_items_without_wrapper() {
        let page = MemoryPage::new();
        page.append_item("https://www.reddit.com/r/rust/comments/1");
        page.append_item("https://www.reddit.com/r/unknown/comments/2");

        let (_, accessor) = shared_accessor(WatchContext {
            snapshot: snapshot(&[("r/rust", "1")]),
            current_source: None,
        });
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = FeedWatcher::start(&page, page.observe(), accessor, tx);

        // Emitted synchronously, before any await.
        let event = rx.try_recv().unwrap();
        assert_eq!(event.source.internal_id, "1");
        assert!(event.wrapper.is_none());
        assert!(rx.try_recv().is_err());
        handle.stop();
    }

    #[tokio::test]
    async fn live_batches_emit_only_resolvable_items() {
        let page = MemoryPage::new();
        let (_, accessor) = shared_accessor(WatchContext {
            snapshot: snapshot(&[("r/rust", "1")]),
            current_source: None,
        });
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = FeedWatcher::start(&page, page.observe(), accessor, tx);

        let wrapper = MemoryNode::wrapper(Some(MemoryNode::item(Some(
            "https://www.reddit.com/r/Rust/comments/9",
        ))));
        page.append(vec![
            MemoryNode::text(),
            MemoryNode::wrapper(None),
            MemoryNode::wrapper(Some(MemoryNode::item(None))),
            MemoryNode::wrapper(Some(MemoryNode::item(Some("https://www.reddit.com/r/go")))),
            wrapper.clone(),
        ]);
        page.append(Vec::new());

        let event = next_event(&mut rx).await.unwrap();
        assert!(event.wrapper.as_ref().unwrap().ptr_eq(&wrapper));
        assert!(event.outer_node().ptr_eq(&wrapper));
        assert_eq!(event.feed, FeedState::new("1"));

        handle.stop();
        assert!(next_event(&mut rx).await.is_none());
    }

    #[tokio::test]
    async fn reads_fresh_state_for_every_batch() {
        let page = MemoryPage::new();
        let (shared, accessor) = shared_accessor(WatchContext::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = FeedWatcher::start(&page, page.observe(), accessor, tx);

        page.append_item("https://www.reddit.com/r/rust");
        shared.lock().unwrap().snapshot = snapshot(&[("r/rust", "3")]);
        page.append_item("https://www.reddit.com/r/rust");

        // Batches are handled in order, so the first one may or may not see the
        // new state, but the second one must.
        let event = next_event(&mut rx).await.unwrap();
        assert_eq!(event.source.internal_id, "3");
        handle.stop();
    }

    #[tokio::test]
    async fn single_source_pages_are_left_alone() {
        let page = MemoryPage::new();
        page.append_item("https://www.reddit.com/r/rust");
        let (_, accessor) = shared_accessor(WatchContext {
            snapshot: snapshot(&[("r/rust", "1")]),
            current_source: resolve_from_name("r/rust"),
        });
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = FeedWatcher::start(&page, page.observe(), accessor, tx);

        page.append_item("https://www.reddit.com/r/rust");
        page.disconnect();

        assert!(next_event(&mut rx).await.is_none());
        handle.stop();
    }

    #[tokio::test]
    async fn nothing_is_emitted_after_stop() {
        let page = MemoryPage::new();
        let (_, accessor) = shared_accessor(WatchContext {
            snapshot: snapshot(&[("r/rust", "1")]),
            current_source: None,
        });
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = FeedWatcher::start(&page, page.observe(), accessor, tx);

        handle.stop();
        handle.stop();
        assert!(handle.is_stopped());

        page.append_item("https://www.reddit.com/r/rust");
        assert!(next_event(&mut rx).await.is_none());
    }

    #[tokio::test]
    async fn closing_the_batch_channel_ends_the_event_stream() {
        let page = MemoryPage::new();
        let (_, accessor) = shared_accessor(WatchContext {
            snapshot: snapshot(&[("r/rust", "1")]),
            current_source: None,
        });
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _handle = FeedWatcher::start(&page, page.observe(), accessor, tx);

        page.append_item("https://www.reddit.com/r/rust");
        page.append_item("https://www.reddit.com/r/rust");
        page.disconnect();

        let mut count = 0;
        while next_event(&mut rx).await.is_some() {
            count += 1;
        }
        assert_eq!(count, 2);
    }
}
