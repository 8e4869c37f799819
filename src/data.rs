use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::mastodon::{self, Status, StatusContext};

/// Failures a post source reports. Wrapped in `anyhow::Error` on the way out;
/// callers that care about the kind use `downcast_ref`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SourceError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("source unavailable: {0}")]
    Unavailable(String),
    #[error("rate limited")]
    RateLimited,
}

pub fn is_rate_limited(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<SourceError>(), Some(SourceError::RateLimited))
}

pub fn is_not_found(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<SourceError>(), Some(SourceError::NotFound(_)))
}

pub trait PostSource: Send + Sync {
    /// Host the posts come from. Post ids are only unique within it, so it
    /// doubles as the view-history scope.
    fn instance(&self) -> &str;
    fn fetch_status(&self, id: &str) -> Result<Status>;
    fn fetch_context(&self, id: &str) -> Result<StatusContext>;
    /// An empty page means the feed is exhausted.
    fn fetch_page(&self, timeline: &str, max_id: Option<&str>, limit: u32)
        -> Result<Vec<Status>>;
    fn search_status(&self, query: &str) -> Result<Option<Status>>;
}

pub trait ViewHistory: Send + Sync {
    fn get(&self, instance: &str, post_id: &str) -> Result<Option<DateTime<Utc>>>;
    fn put_batch(&self, instance: &str, views: &HashMap<String, DateTime<Utc>>) -> Result<()>;
}

pub struct MastodonPostSource {
    client: Arc<mastodon::Client>,
}

impl MastodonPostSource {
    pub fn new(client: Arc<mastodon::Client>) -> Self {
        Self { client }
    }
}

impl PostSource for MastodonPostSource {
    fn instance(&self) -> &str {
        self.client.host()
    }

    fn fetch_status(&self, id: &str) -> Result<Status> {
        self.client
            .status(id)
            .with_context(|| format!("fetch status {id}"))
    }

    fn fetch_context(&self, id: &str) -> Result<StatusContext> {
        self.client
            .context(id)
            .with_context(|| format!("fetch context of {id}"))
    }

    fn fetch_page(
        &self,
        timeline: &str,
        max_id: Option<&str>,
        limit: u32,
    ) -> Result<Vec<Status>> {
        // No context here: the feed reader inspects the bare error for rate limiting.
        self.client.timeline(timeline, max_id, limit)
    }

    fn search_status(&self, query: &str) -> Result<Option<Status>> {
        self.client
            .search_status(query)
            .context("search statuses")
    }
}

/// View history kept in process memory; nothing survives the run.
#[derive(Debug, Default)]
pub struct MemoryViewHistory {
    views: RwLock<HashMap<String, HashMap<String, DateTime<Utc>>>>,
}

impl MemoryViewHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self, instance: &str) -> usize {
        self.views
            .read()
            .get(instance)
            .map(|views| views.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.views.read().values().all(|views| views.is_empty())
    }
}

impl ViewHistory for MemoryViewHistory {
    fn get(&self, instance: &str, post_id: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .views
            .read()
            .get(instance)
            .and_then(|views| views.get(post_id))
            .copied())
    }

    fn put_batch(&self, instance: &str, views: &HashMap<String, DateTime<Utc>>) -> Result<()> {
        let mut all = self.views.write();
        let entry = all.entry(instance.to_string()).or_default();
        for (id, at) in views {
            entry.insert(id.clone(), *at);
        }
        Ok(())
    }
}
