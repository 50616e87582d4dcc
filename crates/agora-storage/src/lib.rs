//! Topic persistence + markup fetch capabilities for Agora.

use std::collections::BTreeSet;
use std::time::Duration;

use agora_core::{NewTopic, PersistedTopic, SiteKey};
use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::{self, HeaderMap, HeaderValue};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info_span, Instrument};

mod browser;
mod sqlite;

pub use browser::{BrowserFetchConfig, BrowserFetcher};
pub use sqlite::SqliteTopicStore;

pub const CRATE_NAME: &str = "agora-storage";

pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(10);

pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub site_key: SiteKey,
    pub url: String,
    /// CSS selector that must be present before rendered markup is read (browser only).
    pub ready_selector: Option<String>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} timed out")]
    Timeout { url: String },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("browser session failed: {0}")]
    Session(String),
}

/// "Fetch markup for URL" capability, satisfied by a plain HTTP client or a headless browser.
#[async_trait]
pub trait MarkupFetcher: Send + Sync {
    async fn fetch_markup(&self, request: &FetchRequest) -> Result<String, FetchError>;
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_HTTP_TIMEOUT,
            user_agent: Some(DEFAULT_USER_AGENT.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::ACCEPT,
            HeaderValue::from_static("text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8"),
        );
        headers.insert(
            header::ACCEPT_LANGUAGE,
            HeaderValue::from_static("fr-FR,fr;q=0.9,en-US;q=0.8,en;q=0.7"),
        );
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));

        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .default_headers(headers);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    pub async fn fetch_text(&self, url: &str) -> Result<String, FetchError> {
        let resp = self
            .client
            .get(url)
            .header(header::REFERER, url)
            .send()
            .await
            .map_err(|err| classify_request_error(url, err))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: resp.url().to_string(),
            });
        }

        let body = resp.text().await.map_err(|err| classify_request_error(url, err))?;
        debug!(bytes = body.len(), "fetched markup");
        Ok(body)
    }
}

fn classify_request_error(url: &str, err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
        FetchError::Timeout { url: url.to_string() }
    } else {
        FetchError::Request(err)
    }
}

#[async_trait]
impl MarkupFetcher for HttpFetcher {
    async fn fetch_markup(&self, request: &FetchRequest) -> Result<String, FetchError> {
        let span = info_span!("http_fetch", site = %request.site_key, url = %request.url);
        self.fetch_text(&request.url).instrument(span).await
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("topic url already stored: {0}")]
    DuplicateUrl(String),
    #[error("no stored topic with id {0}")]
    NotFound(i64),
    #[error("corrupt topic row: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

/// Keyed topic record store. `topic_url` is unique across every site.
#[async_trait]
pub trait TopicStore: Send + Sync {
    async fn find_by_url(&self, topic_url: &str) -> Result<Option<PersistedTopic>, StoreError>;

    /// Fails with [`StoreError::DuplicateUrl`] when the URL already exists.
    async fn insert(&self, topic: &NewTopic) -> Result<PersistedTopic, StoreError>;

    /// Overwrite a stored topic by id. Returns `false` when the stored row carries a newer
    /// `ingested_at` than `topic` (last writer wins). `site_key` is never rewritten.
    async fn update(&self, topic: &PersistedTopic) -> Result<bool, StoreError>;

    async fn top_by_replies(&self, limit: usize) -> Result<Vec<PersistedTopic>, StoreError>;

    async fn recent_by_site(&self, site_key: SiteKey, limit: usize) -> Result<Vec<PersistedTopic>, StoreError>;

    async fn distinct_site_keys(&self) -> Result<BTreeSet<SiteKey>, StoreError>;

    async fn count(&self) -> Result<usize, StoreError>;
}

/// Process-local store, used for tests and store-less runs.
#[derive(Debug, Default)]
pub struct MemoryTopicStore {
    state: RwLock<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    last_id: i64,
    topics: Vec<PersistedTopic>,
}

impl MemoryTopicStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TopicStore for MemoryTopicStore {
    async fn find_by_url(&self, topic_url: &str) -> Result<Option<PersistedTopic>, StoreError> {
        let state = self.state.read().await;
        Ok(state.topics.iter().find(|t| t.topic_url == topic_url).cloned())
    }

    async fn insert(&self, topic: &NewTopic) -> Result<PersistedTopic, StoreError> {
        let mut state = self.state.write().await;
        if state.topics.iter().any(|t| t.topic_url == topic.topic_url) {
            return Err(StoreError::DuplicateUrl(topic.topic_url.clone()));
        }
        state.last_id += 1;
        let stored = PersistedTopic {
            id: state.last_id,
            site_key: topic.site_key,
            title: topic.title.clone(),
            topic_url: topic.topic_url.clone(),
            username: topic.username.clone(),
            replies: topic.replies,
            last_activity: topic.last_activity,
            ingested_at: topic.ingested_at,
        };
        state.topics.push(stored.clone());
        Ok(stored)
    }

    async fn update(&self, topic: &PersistedTopic) -> Result<bool, StoreError> {
        let mut state = self.state.write().await;
        let stored = state
            .topics
            .iter_mut()
            .find(|t| t.id == topic.id)
            .ok_or(StoreError::NotFound(topic.id))?;
        if stored.ingested_at > topic.ingested_at {
            return Ok(false);
        }
        stored.title = topic.title.clone();
        stored.username = topic.username.clone();
        stored.replies = topic.replies;
        stored.last_activity = topic.last_activity;
        stored.ingested_at = topic.ingested_at;
        Ok(true)
    }

    async fn top_by_replies(&self, limit: usize) -> Result<Vec<PersistedTopic>, StoreError> {
        let state = self.state.read().await;
        let mut topics = state.topics.clone();
        topics.sort_by(|a, b| b.replies.cmp(&a.replies));
        topics.truncate(limit);
        Ok(topics)
    }

    async fn recent_by_site(&self, site_key: SiteKey, limit: usize) -> Result<Vec<PersistedTopic>, StoreError> {
        let state = self.state.read().await;
        let mut topics = state
            .topics
            .iter()
            .filter(|t| t.site_key == site_key)
            .cloned()
            .collect::<Vec<_>>();
        topics.sort_by(|a, b| b.ingested_at.cmp(&a.ingested_at));
        topics.truncate(limit);
        Ok(topics)
    }

    async fn distinct_site_keys(&self) -> Result<BTreeSet<SiteKey>, StoreError> {
        let state = self.state.read().await;
        Ok(state.topics.iter().map(|t| t.site_key).collect())
    }

    async fn count(&self) -> Result<usize, StoreError> {
        Ok(self.state.read().await.topics.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use wiremock::matchers::{header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 4, 17, 12, minute, 0).unwrap()
    }

    fn new_topic(site_key: SiteKey, url: &str, replies: u32, minute: u32) -> NewTopic {
        NewTopic {
            site_key,
            title: format!("topic {url}"),
            topic_url: url.to_string(),
            username: None,
            replies,
            last_activity: 1_744_891_200,
            ingested_at: at(minute),
        }
    }

    #[tokio::test]
    async fn memory_store_rejects_duplicate_urls_across_sites() {
        let store = MemoryTopicStore::new();
        store
            .insert(&new_topic(SiteKey::Onche, "https://x/1", 1, 0))
            .await
            .unwrap();
        let err = store
            .insert(&new_topic(SiteKey::Avenoel, "https://x/1", 1, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateUrl(url) if url == "https://x/1"));
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn memory_store_update_is_last_writer_wins() {
        let store = MemoryTopicStore::new();
        let mut stored = store
            .insert(&new_topic(SiteKey::Onche, "https://x/1", 1, 5))
            .await
            .unwrap();

        stored.replies = 9;
        stored.ingested_at = at(4);
        assert!(!store.update(&stored).await.unwrap());

        stored.ingested_at = at(6);
        stored.site_key = SiteKey::Village;
        assert!(store.update(&stored).await.unwrap());

        let reloaded = store.find_by_url("https://x/1").await.unwrap().unwrap();
        assert_eq!(reloaded.replies, 9);
        assert_eq!(reloaded.site_key, SiteKey::Onche);
    }

    #[tokio::test]
    async fn memory_store_orders_queries() {
        let store = MemoryTopicStore::new();
        store.insert(&new_topic(SiteKey::Onche, "https://x/a", 3, 1)).await.unwrap();
        store.insert(&new_topic(SiteKey::Onche, "https://x/b", 10, 3)).await.unwrap();
        store.insert(&new_topic(SiteKey::Village, "https://x/c", 7, 2)).await.unwrap();

        let top = store.top_by_replies(2).await.unwrap();
        assert_eq!(
            top.iter().map(|t| t.topic_url.as_str()).collect::<Vec<_>>(),
            vec!["https://x/b", "https://x/c"]
        );

        let recent = store.recent_by_site(SiteKey::Onche, 5).await.unwrap();
        assert_eq!(
            recent.iter().map(|t| t.topic_url.as_str()).collect::<Vec<_>>(),
            vec!["https://x/b", "https://x/a"]
        );

        let keys = store.distinct_site_keys().await.unwrap();
        assert_eq!(keys.into_iter().collect::<Vec<_>>(), vec![SiteKey::Onche, SiteKey::Village]);
    }

    #[tokio::test]
    async fn http_fetcher_returns_body_and_sends_browser_headers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/forum"))
            .and(header_exists("accept-language"))
            .and(header_exists("user-agent"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>ok</html>"))
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let request = FetchRequest {
            site_key: SiteKey::Village,
            url: format!("{}/forum", server.uri()),
            ready_selector: None,
        };
        let body = fetcher.fetch_markup(&request).await.unwrap();
        assert_eq!(body, "<html>ok</html>");
    }

    #[tokio::test]
    async fn http_fetcher_reports_non_success_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let err = fetcher.fetch_text(&format!("{}/forum", server.uri())).await.unwrap_err();
        assert!(matches!(err, FetchError::HttpStatus { status: 503, .. }));
    }

    #[tokio::test]
    async fn http_fetcher_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_millis(50),
            user_agent: None,
        })
        .unwrap();
        let err = fetcher.fetch_text(&server.uri()).await.unwrap_err();
        assert!(matches!(err, FetchError::Timeout { .. }));
    }
}
