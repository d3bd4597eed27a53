use std::cmp::Ordering;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::source::Source;

pub const MIN_FREQUENCY: f64 = 0.01;
pub const MAX_FREQUENCY: f64 = 1.0;
pub const DEFAULT_FREQUENCY: f64 = MAX_FREQUENCY;

/// Bring any frequency into `[MIN_FREQUENCY, MAX_FREQUENCY]`.
pub fn clamp_frequency(frequency: f64) -> f64 {
    if !frequency.is_finite() {
        return DEFAULT_FREQUENCY;
    }
    frequency.clamp(MIN_FREQUENCY, MAX_FREQUENCY)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeedConfig {
    /// Target fraction of items from this source that should be shown.
    pub frequency: f64,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            frequency: DEFAULT_FREQUENCY,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FeedStats {
    /// Items from this source seen so far.
    pub total: u64,
    /// Items from this source that were hidden.
    pub skips: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedState {
    pub internal_id: String,
    pub config: FeedConfig,
    pub stats: FeedStats,
}

impl FeedState {
    pub fn new(internal_id: impl Into<String>) -> Self {
        Self {
            internal_id: internal_id.into(),
            config: FeedConfig::default(),
            stats: FeedStats::default(),
        }
    }

    /// Canonical form of this record: frequency in its domain, `total >= skips`.
    pub fn normalized(&self) -> Self {
        Self {
            internal_id: self.internal_id.clone(),
            config: FeedConfig {
                frequency: clamp_frequency(self.config.frequency),
            },
            stats: FeedStats {
                total: self.stats.total.max(self.stats.skips),
                skips: self.stats.skips,
            },
        }
    }
}

/// Partial update for a single feed state.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FeedStateChanges {
    pub frequency: Option<f64>,
    pub skips: Option<u64>,
    pub total: Option<u64>,
}

/// Numeric ids first in numeric order, then the rest lexically. Ties on the
/// number (`"01"` and `"1"`) fall back to the text so the order stays total.
fn compare_internal_ids(a: &str, b: &str) -> Ordering {
    let key = |id: &str| {
        let number = id.parse::<u64>().ok();
        (number.is_none(), number.unwrap_or(0))
    };
    key(a).cmp(&key(b)).then_with(|| a.cmp(b))
}

/// Make sure every source has a feed state, keeping whatever is already stored.
///
/// Feed states without a matching source are kept as well: the source list may
/// simply be older than the feed list.
pub fn reconcile_feed_states(existing: &[FeedState], sources: &[Source]) -> Vec<FeedState> {
    let mut by_id: HashMap<&str, FeedState> = HashMap::new();

    for feed in existing {
        by_id
            .entry(feed.internal_id.as_str())
            .or_insert_with(|| feed.clone());
    }
    for source in sources {
        by_id
            .entry(source.internal_id.as_str())
            .or_insert_with(|| FeedState::new(source.internal_id.clone()));
    }

    let mut merged: Vec<FeedState> = by_id.into_values().collect();
    merged.sort_by(|a, b| compare_internal_ids(&a.internal_id, &b.internal_id));
    merged
}

/// Apply `changes` to the feed with `internal_id`.
///
/// An unknown id leaves the collection untouched: the source may have been
/// unsubscribed while the update was in flight.
pub fn update_feed_state(
    feeds: &[FeedState],
    internal_id: &str,
    changes: &FeedStateChanges,
) -> Vec<FeedState> {
    if !feeds.iter().any(|f| f.internal_id == internal_id) {
        return feeds.to_vec();
    }

    feeds
        .iter()
        .map(|feed| {
            if feed.internal_id != internal_id {
                return feed.clone();
            }
            let mut updated = feed.clone();
            if let Some(frequency) = changes.frequency {
                updated.config.frequency = clamp_frequency(frequency);
            }
            if let Some(skips) = changes.skips {
                updated.stats.skips = skips;
            }
            if let Some(total) = changes.total {
                updated.stats.total = total;
            }
            updated
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::identity::resolve_from_name;

    fn source(name: &str, internal_id: &str) -> Source {
        Source {
            identity: resolve_from_name(name).unwrap(),
            internal_id: internal_id.to_string(),
            is_subscribed: true,
        }
    }

    fn feed(internal_id: &str, frequency: f64, total: u64, skips: u64) -> FeedState {
        FeedState {
            internal_id: internal_id.to_string(),
            config: FeedConfig { frequency },
            stats: FeedStats { total, skips },
        }
    }

    #[test]
    fn reconcile_adds_defaults_and_keeps_existing() {
        let existing = vec![feed("2", 0.5, 10, 3)];
        let sources = vec![source("r/a", "1"), source("r/b", "2")];

        let reconciled = reconcile_feed_states(&existing, &sources);
        assert_eq!(reconciled, vec![FeedState::new("1"), feed("2", 0.5, 10, 3)]);
    }

    #[test]
    fn reconcile_keeps_orphans_sorted_numerically() {
        let existing = vec![feed("10", 0.2, 1, 0), feed("9", 0.3, 0, 0)];
        let sources = vec![source("r/a", "2")];

        let ids: Vec<String> = reconcile_feed_states(&existing, &sources)
            .into_iter()
            .map(|f| f.internal_id)
            .collect();
        assert_eq!(ids, vec!["2", "9", "10"]);
    }

    #[test]
    fn reconcile_orders_mixed_ids_independently_of_input() {
        let ids = [
            "9", "10", "1a", "7x", "2", "legacy", "100", "01", "1", "b", "33", "3z", "0", "x9",
            "15", "a", "8", "11", "abc", "20", "5", "zz", "4", "99", "6q",
        ];
        let existing: Vec<FeedState> = ids.iter().map(|id| FeedState::new(*id)).collect();
        let mut reversed = existing.clone();
        reversed.reverse();

        let forward: Vec<String> = reconcile_feed_states(&existing, &[])
            .into_iter()
            .map(|f| f.internal_id)
            .collect();
        let backward: Vec<String> = reconcile_feed_states(&reversed, &[])
            .into_iter()
            .map(|f| f.internal_id)
            .collect();

        assert_eq!(forward, backward);
        assert_eq!(
            forward,
            vec![
                "0", "01", "1", "2", "4", "5", "8", "9", "10", "11", "15", "20", "33", "99",
                "100", "1a", "3z", "6q", "7x", "a", "abc", "b", "legacy", "x9", "zz",
            ]
        );
    }

    #[test]
    fn reconcile_deduplicates_existing() {
        let existing = vec![feed("1", 0.4, 2, 1), feed("1", 0.9, 0, 0)];
        let reconciled = reconcile_feed_states(&existing, &[source("r/a", "1")]);
        assert_eq!(reconciled, vec![feed("1", 0.4, 2, 1)]);
    }

    #[test]
    fn update_unknown_id_returns_input() {
        let feeds = vec![feed("1", 0.5, 4, 1), feed("2", 1.0, 0, 0)];
        let changes = FeedStateChanges {
            frequency: Some(0.1),
            skips: Some(9),
            total: Some(9),
        };
        assert_eq!(update_feed_state(&feeds, "3", &changes), feeds);
    }

    #[test]
    fn update_changes_only_given_fields() {
        let feeds = vec![feed("1", 0.5, 4, 1), feed("2", 1.0, 0, 0)];
        let updated = update_feed_state(
            &feeds,
            "1",
            &FeedStateChanges {
                total: Some(5),
                ..Default::default()
            },
        );
        assert_eq!(updated, vec![feed("1", 0.5, 5, 1), feed("2", 1.0, 0, 0)]);
    }

    #[test]
    fn update_clamps_frequency() {
        let feeds = vec![feed("1", 0.5, 0, 0)];
        let low = update_feed_state(
            &feeds,
            "1",
            &FeedStateChanges {
                frequency: Some(0.0),
                ..Default::default()
            },
        );
        assert_eq!(low[0].config.frequency, MIN_FREQUENCY);

        let high = update_feed_state(
            &feeds,
            "1",
            &FeedStateChanges {
                frequency: Some(3.0),
                ..Default::default()
            },
        );
        assert_eq!(high[0].config.frequency, MAX_FREQUENCY);
    }

    #[test]
    fn normalized_raises_total_to_skips() {
        let normalized = feed("1", f64::NAN, 2, 5).normalized();
        assert_eq!(normalized.config.frequency, DEFAULT_FREQUENCY);
        assert_eq!(normalized.stats, FeedStats { total: 5, skips: 5 });
    }
}
