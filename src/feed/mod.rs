mod discovery;
mod page;
pub mod throttle;
mod watcher;

pub use discovery::{discover_sources, DiscoveryOptions, DEFAULT_POLL_INTERVAL};
pub use page::{
    FeedContainer, MemoryNode, MemoryPage, MutationBatch, PageNode, SourceLink, SourceListProbe,
};
pub use watcher::{FeedWatcher, ItemEvent, SnapshotAccessor, WatchContext};
