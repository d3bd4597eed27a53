use std::path::Path;
use std::sync::Arc;

use crate::config::Config;
use crate::db::{SqliteStorage, Storage};
use crate::error::Result;
use crate::feed::{MemoryNode, MemoryPage, SourceLink};
use crate::models::{resolve_from_input, FeedState, Identity};
use crate::services::messaging::MessageHub;
use crate::services::{BackgroundContext, PageContext, SettingsContext, SettingsEntry};

/// What happened to one item of a feed file.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedOutcome {
    pub url: String,
    /// Display name of the tracked source, `None` for items left untouched.
    pub source: Option<String>,
    pub skipped: bool,
}

pub struct App {
    config: Config,
    storage: Arc<dyn Storage>,
    hub: Arc<MessageHub>,
    background: BackgroundContext,
}

impl App {
    pub async fn new(config: &Config) -> Result<Self> {
        let storage = SqliteStorage::new(&config.db_path, config.storage_area).await?;
        Self::with_storage(config, Arc::new(storage)).await
    }

    pub async fn with_storage(config: &Config, storage: Arc<dyn Storage>) -> Result<Self> {
        let hub = MessageHub::new();
        let background =
            BackgroundContext::start(Arc::clone(&storage), &hub, config.storage_area).await?;

        Ok(Self {
            config: config.clone(),
            storage,
            hub,
            background,
        })
    }

    pub fn badge_count(&self) -> usize {
        self.background.badge_count()
    }

    /// Discover `names` as if a feed page listed them in its subscription menu.
    pub async fn discover(&self, names: &[String]) -> Result<Vec<Identity>> {
        let links: Vec<SourceLink> = names
            .iter()
            .filter_map(|name| {
                let identity = resolve_from_input(name);
                if identity.is_none() {
                    tracing::warn!("Ignoring unusable source name {:?}", name);
                }
                identity
            })
            .map(|identity| SourceLink {
                href: identity.url,
                text: identity.display_name,
                icon_url: None,
            })
            .collect();
        if links.is_empty() {
            return Ok(Vec::new());
        }

        let page = MemoryPage::new();
        page.set_menu_links(links);
        let context = self.page_context().await?;
        context
            .discover(&page, &self.config.discovery_options())
            .await
    }

    pub async fn list(&self) -> Result<Vec<SettingsEntry>> {
        Ok(self.settings_context().await?.entries())
    }

    pub async fn set_frequency(&self, name: &str, frequency: f64) -> Result<Option<FeedState>> {
        self.settings_context()
            .await?
            .set_frequency(name, frequency)
            .await
    }

    /// Run the item URLs in `path` (one per line, `#` starts a comment line)
    /// through the page watcher.
    pub async fn run_feed(&self, path: &Path, page_url: Option<&str>) -> Result<Vec<FeedOutcome>> {
        let content = std::fs::read_to_string(path)?;
        let urls: Vec<&str> = content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .collect();

        let context = self.page_context().await?;
        let page = MemoryPage::new();
        let (handle, mut events) = context.watch(&page, page.observe(), page_url);

        let wrappers: Vec<MemoryNode> = urls.iter().map(|url| page.append_item(url)).collect();
        page.disconnect();

        let mut decided: Vec<Option<(String, bool)>> = vec![None; wrappers.len()];
        while let Some(event) = events.recv().await {
            let skipped = context.handle_item(&event).await?;
            let index = wrappers
                .iter()
                .position(|w| event.wrapper.as_ref().is_some_and(|e| e.ptr_eq(w)));
            if let Some(index) = index {
                decided[index] = Some((event.source.identity.display_name.clone(), skipped));
            }
        }
        handle.stop();

        Ok(urls
            .into_iter()
            .zip(decided)
            .map(|(url, decision)| match decision {
                Some((source, skipped)) => FeedOutcome {
                    url: url.to_string(),
                    source: Some(source),
                    skipped,
                },
                None => FeedOutcome {
                    url: url.to_string(),
                    source: None,
                    skipped: false,
                },
            })
            .collect())
    }

    async fn page_context(&self) -> Result<PageContext> {
        PageContext::start(Arc::clone(&self.storage), &self.hub, self.config.storage_area).await
    }

    async fn settings_context(&self) -> Result<SettingsContext> {
        SettingsContext::start(Arc::clone(&self.storage), &self.hub, self.config.storage_area).await
    }
}
