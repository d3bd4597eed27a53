use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use super::identity::Identity;

/// A source the user is (or once was) subscribed to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    #[serde(flatten)]
    pub identity: Identity,
    /// Assigned once by [`merge_sources`], never reused.
    pub internal_id: String,
    pub is_subscribed: bool,
}

impl Source {
    pub fn id(&self) -> &str {
        &self.identity.id
    }
}

/// Numeric value of an internal id; anything non-numeric counts as zero.
fn numeric_internal_id(internal_id: &str) -> u64 {
    internal_id.trim().parse::<u64>().unwrap_or(0)
}

/// Merge a freshly discovered subscription list into the stored one.
///
/// `discovered` is taken as the complete current set of subscriptions: stored
/// sources missing from it are flagged unsubscribed (never removed), and
/// unknown ones are appended with the next free internal ids, in input order.
pub fn merge_sources(discovered: &[Identity], existing: &[Source]) -> Vec<Source> {
    let discovered_ids: HashSet<&str> = discovered.iter().map(|d| d.id.as_str()).collect();
    let existing_ids: HashSet<&str> = existing.iter().map(|s| s.id()).collect();

    let mut merged: Vec<Source> = existing
        .iter()
        .map(|source| Source {
            is_subscribed: discovered_ids.contains(source.id()),
            ..source.clone()
        })
        .collect();

    let highest = existing
        .iter()
        .map(|s| numeric_internal_id(&s.internal_id))
        .max()
        .unwrap_or(0);

    let mut minted: HashSet<&str> = HashSet::new();
    let new_identities = discovered
        .iter()
        .filter(|d| !existing_ids.contains(d.id.as_str()))
        .filter(|d| minted.insert(d.id.as_str()));

    for (index, identity) in new_identities.enumerate() {
        merged.push(Source {
            identity: identity.clone(),
            internal_id: (highest + 1 + index as u64).to_string(),
            is_subscribed: true,
        });
    }

    merged
}
