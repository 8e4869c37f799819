use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use reqwest::blocking::{Client as HttpClient, Response};
use reqwest::header::{ACCEPT, AUTHORIZATION, USER_AGENT};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use crate::data::SourceError;

pub const DEFAULT_PAGE_SIZE: u32 = 40;

#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    /// Bare host (`mastodon.social`) or a full base URL.
    pub host: String,
    pub access_token: Option<String>,
    pub user_agent: String,
    pub http_client: Option<HttpClient>,
}

pub struct Client {
    http: HttpClient,
    host: String,
    base_url: Url,
    access_token: Option<String>,
    user_agent: String,
}

impl Client {
    pub fn new(config: ClientConfig) -> Result<Self> {
        let host = config.host.trim().trim_end_matches('/');
        if host.is_empty() {
            bail!("mastodon client instance host required");
        }
        if config.user_agent.trim().is_empty() {
            bail!("mastodon client user agent required");
        }

        let base_url = base_url(host)?;
        let host = base_url
            .host_str()
            .map(|h| match base_url.port() {
                Some(port) => format!("{h}:{port}"),
                None => h.to_string(),
            })
            .context("mastodon: base url has no host")?;

        let http = match config.http_client {
            Some(client) => client,
            None => HttpClient::builder()
                .timeout(Duration::from_secs(20))
                .build()?,
        };

        Ok(Client {
            http,
            host,
            base_url,
            access_token: config.access_token.filter(|t| !t.trim().is_empty()),
            user_agent: config.user_agent,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn status(&self, id: &str) -> Result<Status> {
        self.get_json(&format!("api/v1/statuses/{id}"), &[])
    }

    pub fn context(&self, id: &str) -> Result<StatusContext> {
        self.get_json(&format!("api/v1/statuses/{id}/context"), &[])
    }

    /// Resolves a post URL (possibly on another server) into a local status.
    pub fn search_status(&self, query: &str) -> Result<Option<Status>> {
        let params = [
            ("type".to_string(), "statuses".to_string()),
            ("resolve".to_string(), "true".to_string()),
            ("limit".to_string(), "1".to_string()),
            ("q".to_string(), query.to_string()),
        ];
        let results: SearchResults = self.get_json("api/v2/search", &params)?;
        Ok(results.statuses.into_iter().next())
    }

    pub fn timeline(&self, name: &str, max_id: Option<&str>, limit: u32) -> Result<Vec<Status>> {
        let (path, mut params) = timeline_request(name);
        params.push(("limit".into(), limit.to_string()));
        if let Some(max_id) = max_id {
            params.push(("max_id".into(), max_id.to_string()));
        }
        self.get_json(&path, &params)
    }

    fn get_json<T>(&self, path: &str, params: &[(String, String)]) -> Result<T>
    where
        T: DeserializeOwned,
    {
        let resp = self.request(path, params)?;
        resp.json()
            .map_err(|err| SourceError::Unavailable(format!("{path}: decode: {err}")).into())
    }

    fn request(&self, path: &str, params: &[(String, String)]) -> Result<Response> {
        let mut url = self.base_url.join(path)?;
        if !params.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (k, v) in params {
                pairs.append_pair(k, v);
            }
        }

        debug!(%url, "mastodon request");
        let mut req = self
            .http
            .get(url)
            .header(USER_AGENT, self.user_agent.clone())
            .header(ACCEPT, "application/json");
        if let Some(token) = &self.access_token {
            req = req.header(AUTHORIZATION, format!("Bearer {token}"));
        }

        let resp = req
            .send()
            .map_err(|err| SourceError::Unavailable(format!("{path}: {err}")))?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }

        let body = resp.text().unwrap_or_default();
        let message = serde_json::from_str::<ApiError>(&body)
            .map(|e| e.error)
            .unwrap_or(body);
        match status {
            StatusCode::NOT_FOUND => Err(SourceError::NotFound(path.to_string()).into()),
            StatusCode::TOO_MANY_REQUESTS => {
                warn!(path, "mastodon: rate limited");
                Err(SourceError::RateLimited.into())
            }
            _ => Err(SourceError::Unavailable(format!("{path}: {status}: {message}")).into()),
        }
    }
}

fn base_url(host: &str) -> Result<Url> {
    let raw = if host.contains("://") {
        format!("{host}/")
    } else {
        format!("https://{host}/")
    };
    Url::parse(&raw).with_context(|| format!("mastodon: invalid instance {host:?}"))
}

/// Maps a timeline name onto its API path. `local` is the public timeline
/// restricted to the instance; anything else (`home`, `public`, `tag/rust`,
/// `list/42`) is passed through.
pub fn timeline_request(name: &str) -> (String, Vec<(String, String)>) {
    let name = name.trim().trim_matches('/');
    match name {
        "" | "home" => ("api/v1/timelines/home".into(), Vec::new()),
        "local" => (
            "api/v1/timelines/public".into(),
            vec![("local".into(), "true".into())],
        ),
        other => (format!("api/v1/timelines/{other}"), Vec::new()),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Status {
    pub id: String,
    #[serde(default)]
    pub in_reply_to_id: Option<String>,
    #[serde(default)]
    pub replies_count: u64,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub edited_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub reblog: Option<Box<Status>>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub spoiler_text: String,
    #[serde(default)]
    pub visibility: Visibility,
    #[serde(default)]
    pub account: Account,
    #[serde(default)]
    pub favourites_count: u64,
    #[serde(default)]
    pub reblogs_count: u64,
}

impl Status {
    /// The instant a reader has to have seen the post after for it to count as viewed.
    pub fn last_modified(&self) -> DateTime<Utc> {
        self.edited_at.unwrap_or(self.created_at)
    }

    pub fn is_reblog(&self) -> bool {
        self.reblog.is_some()
    }

    /// The post this timeline item is about: the reblogged one, or itself.
    pub fn subject(&self) -> &Status {
        self.reblog.as_deref().unwrap_or(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    #[default]
    Public,
    Unlisted,
    Private,
    Direct,
    /// Anything a server invents beyond the four standard scopes.
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Account {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub acct: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub url: String,
}

/// Ancestors are ordered from the thread root down to the immediate parent.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StatusContext {
    #[serde(default)]
    pub ancestors: Vec<Status>,
    #[serde(default)]
    pub descendants: Vec<Status>,
}

#[derive(Debug, Clone, Deserialize)]
struct SearchResults {
    #[serde(default)]
    statuses: Vec<Status>,
}

#[derive(Debug, Clone, Deserialize)]
struct ApiError {
    error: String,
}
