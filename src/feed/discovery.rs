use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use tokio::time::MissedTickBehavior;

use crate::error::{AppError, Result};
use crate::models::{resolve_from_url, Identity};

use super::page::{SourceLink, SourceListProbe};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

static SOURCE_TEXT_RE: OnceLock<Regex> = OnceLock::new();

fn source_text_re() -> &'static Regex {
    SOURCE_TEXT_RE.get_or_init(|| Regex::new(r"^/?r/").expect("valid source text pattern"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveryOptions {
    pub interval: Duration,
    /// `None` keeps polling until something turns up.
    pub timeout: Option<Duration>,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            timeout: None,
        }
    }
}

/// Poll `probe` until the user's subscriptions can be read from the page.
///
/// Time is counted in whole intervals: attempt `n` has used `n * interval`
/// of the timeout budget.
pub async fn discover_sources<P: SourceListProbe + ?Sized>(
    probe: &P,
    options: &DiscoveryOptions,
) -> Result<Vec<Identity>> {
    let interval = options.interval.max(Duration::from_millis(1));
    let interval_ms = interval.as_millis() as u64;
    let timeout_ms = options.timeout.map(|t| t.as_millis() as u64);

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; the first sample is one interval in.
    ticker.tick().await;

    let mut attempts: u64 = 0;
    loop {
        ticker.tick().await;
        attempts += 1;

        let found = sample_sources(probe);
        if !found.is_empty() {
            tracing::debug!(
                "Discovered {} sources after {} attempts",
                found.len(),
                attempts
            );
            return Ok(found);
        }

        if let Some(timeout_ms) = timeout_ms {
            if attempts * interval_ms >= timeout_ms {
                return Err(AppError::DiscoveryTimeout {
                    timeout_ms,
                    interval_ms,
                    attempts_made: attempts,
                });
            }
        }
    }
}

/// One look at the page. The subscription menu wins; the overlay navigation
/// is only used when the menu is empty, and only for links that read as sources.
fn sample_sources<P: SourceListProbe + ?Sized>(probe: &P) -> Vec<Identity> {
    let menu = probe.menu_links();
    let links: Vec<SourceLink> = if menu.is_empty() {
        probe
            .overlay_links()
            .into_iter()
            .filter(|link| source_text_re().is_match(link.text.trim()))
            .collect()
    } else {
        menu
    };

    links
        .iter()
        .filter_map(|link| {
            let identity = resolve_from_url(&link.href)?;
            if let Some(icon) = &link.icon_url {
                tracing::debug!("{} has icon {}", identity.display_name, icon);
            }
            Some(identity)
        })
        .collect()
}
