//! Read-only view of the host page the watcher and discovery work against.
//!
//! The host implements these traits over its real document; `MemoryPage`
//! is a self-contained page used by the CLI and the tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

/// A node added to, or already present in, the feed container.
pub trait PageNode: Clone + Send + Sync + 'static {
    /// Whether this node is a block-level element that can wrap an item.
    fn is_block(&self) -> bool;

    /// The item marker element inside this node (or the node itself).
    fn find_item(&self) -> Option<Self>;

    /// Href of the source anchor inside an item.
    fn source_href(&self) -> Option<String>;

    /// Detach the node from the page.
    fn remove(&self);
}

/// The element that holds the feed items.
pub trait FeedContainer: Send + Sync + 'static {
    type Node: PageNode;

    /// Item marker elements currently in the container.
    fn items(&self) -> Vec<Self::Node>;
}

/// One batch of structural additions, as delivered by the host.
#[derive(Debug, Clone)]
pub struct MutationBatch<N> {
    pub added: Vec<N>,
}

impl<N> MutationBatch<N> {
    pub fn new(added: Vec<N>) -> Self {
        Self { added }
    }
}

/// Link found in the page's list of subscribed sources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLink {
    pub href: String,
    pub text: String,
    pub icon_url: Option<String>,
}

/// Where discovery looks for the user's subscriptions.
pub trait SourceListProbe: Send + Sync {
    /// Links from the subscription menu. Preferred when present.
    fn menu_links(&self) -> Vec<SourceLink>;

    /// Links from the overlay navigation, which mixes sources with other pages.
    fn overlay_links(&self) -> Vec<SourceLink>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeKind {
    Wrapper,
    Item,
    Text,
}

#[derive(Debug)]
struct NodeInner {
    kind: NodeKind,
    href: Option<String>,
    child: Option<MemoryNode>,
    removed: AtomicBool,
}

/// Node of a [`MemoryPage`].
#[derive(Debug, Clone)]
pub struct MemoryNode(Arc<NodeInner>);

impl MemoryNode {
    /// An item whose source anchor points at `href`.
    pub fn item(href: Option<&str>) -> Self {
        Self(Arc::new(NodeInner {
            kind: NodeKind::Item,
            href: href.map(str::to_string),
            child: None,
            removed: AtomicBool::new(false),
        }))
    }

    /// A block wrapper around `child`.
    pub fn wrapper(child: Option<MemoryNode>) -> Self {
        Self(Arc::new(NodeInner {
            kind: NodeKind::Wrapper,
            href: None,
            child,
            removed: AtomicBool::new(false),
        }))
    }

    /// A non-block node, never inspected by the watcher.
    pub fn text() -> Self {
        Self(Arc::new(NodeInner {
            kind: NodeKind::Text,
            href: None,
            child: None,
            removed: AtomicBool::new(false),
        }))
    }

    pub fn is_removed(&self) -> bool {
        self.0.removed.load(Ordering::SeqCst)
    }

    pub fn ptr_eq(&self, other: &MemoryNode) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl PageNode for MemoryNode {
    fn is_block(&self) -> bool {
        matches!(self.0.kind, NodeKind::Wrapper | NodeKind::Item)
    }

    fn find_item(&self) -> Option<Self> {
        match self.0.kind {
            NodeKind::Item => Some(self.clone()),
            NodeKind::Wrapper => self.0.child.as_ref().and_then(|c| c.find_item()),
            NodeKind::Text => None,
        }
    }

    fn source_href(&self) -> Option<String> {
        self.0.href.clone()
    }

    fn remove(&self) {
        self.0.removed.store(true, Ordering::SeqCst);
        if let Some(child) = &self.0.child {
            child.remove();
        }
    }
}

/// In-memory feed page: a container of wrapped items plus a subscription list.
pub struct MemoryPage {
    nodes: Mutex<Vec<MemoryNode>>,
    observer: Mutex<Option<mpsc::UnboundedSender<MutationBatch<MemoryNode>>>>,
    menu: Mutex<Vec<SourceLink>>,
    overlay: Mutex<Vec<SourceLink>>,
}

impl MemoryPage {
    pub fn new() -> Self {
        Self {
            nodes: Mutex::new(Vec::new()),
            observer: Mutex::new(None),
            menu: Mutex::new(Vec::new()),
            overlay: Mutex::new(Vec::new()),
        }
    }

    /// Start delivering additions as mutation batches. Replaces any earlier observer.
    pub fn observe(&self) -> mpsc::UnboundedReceiver<MutationBatch<MemoryNode>> {
        let (tx, rx) = mpsc::unbounded_channel();
        *lock(&self.observer) = Some(tx);
        rx
    }

    /// Stop delivering batches; the observer sees its channel close.
    pub fn disconnect(&self) {
        lock(&self.observer).take();
    }

    /// Append nodes to the container as a single batch.
    pub fn append(&self, added: Vec<MemoryNode>) {
        lock(&self.nodes).extend(added.iter().cloned());
        if let Some(observer) = lock(&self.observer).as_ref() {
            let _ = observer.send(MutationBatch::new(added));
        }
    }

    /// Append a wrapped item pointing at `href`.
    pub fn append_item(&self, href: &str) -> MemoryNode {
        let wrapper = MemoryNode::wrapper(Some(MemoryNode::item(Some(href))));
        self.append(vec![wrapper.clone()]);
        wrapper
    }

    pub fn set_menu_links(&self, links: Vec<SourceLink>) {
        *lock(&self.menu) = links;
    }

    #[cfg(test)]
    pub fn set_overlay_links(&self, links: Vec<SourceLink>) {
        *lock(&self.overlay) = links;
    }
}

impl Default for MemoryPage {
    fn default() -> Self {
        Self::new()
    }
}

impl FeedContainer for MemoryPage {
    type Node = MemoryNode;

    fn items(&self) -> Vec<MemoryNode> {
        lock(&self.nodes)
            .iter()
            .filter(|node| !node.is_removed())
            .filter_map(|node| node.find_item())
            .collect()
    }
}

impl SourceListProbe for MemoryPage {
    fn menu_links(&self) -> Vec<SourceLink> {
        lock(&self.menu).clone()
    }

    fn overlay_links(&self) -> Vec<SourceLink> {
        lock(&self.overlay).clone()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
