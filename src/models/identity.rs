use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

/// Prefix every source path and display name starts with.
pub const SOURCE_PREFIX: &str = "r/";

const SOURCE_BASE_URL: &str = "https://www.reddit.com/";

/// Aggregate feeds that look like sources but don't map to one.
const RESERVED_NAMES: [&str; 2] = ["r/all", "r/popular"];

static SOURCE_PATH_RE: OnceLock<Regex> = OnceLock::new();

fn source_path_re() -> &'static Regex {
    SOURCE_PATH_RE.get_or_init(|| Regex::new(r"/r/[^/#?%]+").expect("valid source path pattern"))
}

/// Canonical identity of a feed source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    /// Lowercased display name, the key used for every cross-collection comparison.
    pub id: String,
    pub display_name: String,
    pub url: String,
}

impl Identity {
    /// Display name without the source prefix, as stored on disk.
    pub fn raw_name(&self) -> &str {
        self.display_name
            .strip_prefix(SOURCE_PREFIX)
            .unwrap_or(&self.display_name)
    }

    pub fn is_reserved(&self) -> bool {
        RESERVED_NAMES.contains(&self.display_name.as_str())
    }
}

/// Resolve a source from any URL that contains a `/r/<name>` path segment.
/// The prefix must be lowercase; `/R/name` does not match.
pub fn resolve_from_url(raw: &str) -> Option<Identity> {
    let cleaned: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    let mut url = Url::parse(&cleaned).ok()?;

    // Match against the serialized URL so scheme and host are already normalized.
    let path = source_path_re().find(url.as_str())?.as_str().to_string();
    url.set_path(&path);

    let display_name = url.path().trim_start_matches('/').to_string();
    let identity = Identity {
        id: display_name.to_lowercase(),
        display_name,
        url: url.to_string(),
    };

    if identity.is_reserved() {
        return None;
    }
    Some(identity)
}

/// Resolve a source from a bare name such as `r/rust` or `/r/rust/`.
pub fn resolve_from_name(name: &str) -> Option<Identity> {
    let cleaned: String = name.chars().filter(|c| !c.is_whitespace()).collect();
    let cleaned = cleaned.trim_matches('/');
    resolve_from_url(&format!("{}{}", SOURCE_BASE_URL, cleaned))
}

/// Resolve what a user typed: a full URL, `r/name` or a bare `name`.
pub fn resolve_from_input(input: &str) -> Option<Identity> {
    let trimmed = input.trim();
    if trimmed.contains("://") {
        return resolve_from_url(trimmed);
    }
    let bare = trimmed.trim_start_matches('/');
    if bare.starts_with(SOURCE_PREFIX) {
        resolve_from_name(bare)
    } else {
        resolve_from_name(&format!("{}{}", SOURCE_PREFIX, bare))
    }
}
