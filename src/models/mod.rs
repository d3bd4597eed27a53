mod feed_state;
mod identity;
mod source;

pub use feed_state::{
    clamp_frequency, reconcile_feed_states, update_feed_state, FeedConfig, FeedState,
    FeedStateChanges, FeedStats, DEFAULT_FREQUENCY,
};
pub use identity::{
    resolve_from_input, resolve_from_name, resolve_from_url, Identity, SOURCE_PREFIX,
};
pub use source::{merge_sources, Source};

use std::sync::Arc;

/// Both stored collections as one context currently knows them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateSnapshot {
    pub sources: Vec<Source>,
    pub feeds: Vec<FeedState>,
}

impl StateSnapshot {
    pub fn new(sources: Vec<Source>, feeds: Vec<FeedState>) -> Arc<Self> {
        Arc::new(Self { sources, feeds })
    }

    pub fn source_by_id(&self, id: &str) -> Option<&Source> {
        self.sources.iter().find(|s| s.identity.id == id)
    }

    pub fn feed(&self, internal_id: &str) -> Option<&FeedState> {
        self.feeds.iter().find(|f| f.internal_id == internal_id)
    }
}
