use std::collections::VecDeque;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, info};

use crate::data::{is_rate_limited, PostSource};
use crate::mastodon::{Status, DEFAULT_PAGE_SIZE};

pub const DEFAULT_LIMIT: usize = 1000;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone)]
pub struct FeedOptions {
    pub page_size: u32,
    /// Total number of posts to yield before stopping.
    pub limit: usize,
    /// Pause before asking again for a page that was rate limited.
    pub retry_delay: Duration,
}

impl Default for FeedOptions {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            limit: DEFAULT_LIMIT,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }
}

/// Lazily pages through a named timeline, newest first.
///
/// Each page continues from the id of the last post of the previous one. A
/// rate-limited page is asked for again with the same cursor after
/// `retry_delay`, so nothing is skipped. The feed ends on an empty page or
/// once `limit` posts have been yielded. Any other error is yielded once and
/// ends the feed.
pub struct Timeline<'a> {
    source: &'a dyn PostSource,
    name: String,
    options: FeedOptions,
    buffer: VecDeque<Status>,
    cursor: Option<String>,
    yielded: usize,
    done: bool,
    retries: usize,
}

impl<'a> Timeline<'a> {
    pub fn new(source: &'a dyn PostSource, name: impl Into<String>, options: FeedOptions) -> Self {
        Self {
            source,
            name: name.into(),
            options,
            buffer: VecDeque::new(),
            cursor: None,
            yielded: 0,
            done: false,
            retries: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of rate-limited page requests that had to be repeated so far.
    pub fn retries(&self) -> usize {
        self.retries
    }

    fn fetch_next_page(&mut self) -> Result<()> {
        let remaining = self.options.limit - self.yielded;
        let page_size = self.options.page_size.max(1);
        let size = u32::try_from(remaining).unwrap_or(u32::MAX).min(page_size);

        loop {
            match self
                .source
                .fetch_page(&self.name, self.cursor.as_deref(), size)
            {
                Ok(page) => {
                    debug!(timeline = %self.name, cursor = ?self.cursor, len = page.len(), "timeline page");
                    match page.last() {
                        Some(last) => self.cursor = Some(last.id.clone()),
                        None => self.done = true,
                    }
                    self.buffer.extend(page);
                    return Ok(());
                }
                Err(err) if is_rate_limited(&err) => {
                    self.retries += 1;
                    info!(
                        timeline = %self.name,
                        delay = ?self.options.retry_delay,
                        "rate limited, retrying page"
                    );
                    thread::sleep(self.options.retry_delay);
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl Iterator for Timeline<'_> {
    type Item = Result<Status>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.yielded >= self.options.limit {
                return None;
            }
            if let Some(status) = self.buffer.pop_front() {
                self.yielded += 1;
                return Some(Ok(status));
            }
            if self.done {
                return None;
            }
            if let Err(err) = self.fetch_next_page() {
                self.done = true;
                return Some(Err(err.context(format!("fetch timeline {}", self.name))));
            }
        }
    }
}
