//! Skip/show decisions for individual feed items.
//!
//! The decision looks at the counters *before* the current item is counted,
//! so the shown ratio trails the target by up to one item. This lag is part
//! of the behaviour, not an error to correct.

use crate::models::{FeedState, FeedStats};

/// Fraction of items shown so far, `None` before the first item.
pub fn shown_ratio(stats: &FeedStats) -> Option<f64> {
    if stats.total == 0 {
        return None;
    }
    Some(1.0 - stats.skips as f64 / stats.total as f64)
}

/// Whether the next item from this feed should be hidden.
pub fn should_skip(feed: &FeedState) -> bool {
    match shown_ratio(&feed.stats) {
        Some(ratio) => ratio > feed.config.frequency,
        None => false,
    }
}

/// Count one more item, skipped or shown.
pub fn apply_outcome(feed: &FeedState, was_skipped: bool) -> FeedState {
    let mut updated = feed.clone();
    updated.stats.total += 1;
    if was_skipped {
        updated.stats.skips += 1;
    }
    updated
}
