//! Scrape cycle orchestration: fetch, parse and merge every configured forum, then serve the
//! aggregated feed from the store.

use std::sync::Arc;
use std::time::{Duration, Instant};

use agora_adapters::{adapter_for_site, AdapterContext};
use agora_core::SiteKey;
use agora_storage::{
    BrowserFetcher, FetchError, HttpFetcher, MarkupFetcher, SqliteTopicStore, StoreError, TopicStore,
};
use anyhow::{Context, Result};
use chrono::{DateTime, FixedOffset, Utc};
use futures_util::future::join_all;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

mod config;
mod feed;
mod merge;

pub use config::{FeedConfig, FetchMode, SourceConfig, SourceRegistry, SyncConfig};
pub use feed::select_feed;
pub use merge::{merge_batch, MergeOutcome};

pub const CRATE_NAME: &str = "agora-sync";

#[derive(Debug, Error)]
enum SourceFailure {
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("merge failed: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceReport {
    pub site_key: SiteKey,
    pub parsed: usize,
    pub merge: MergeOutcome,
    pub error: Option<String>,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// The previous cycle was still running, so nothing was attempted.
    pub skipped: bool,
    pub sources: Vec<SourceReport>,
}

impl CycleReport {
    pub fn failed(&self) -> usize {
        self.sources.iter().filter(|s| s.error.is_some()).count()
    }

    pub fn inserted(&self) -> usize {
        self.sources.iter().map(|s| s.merge.inserted).sum()
    }

    pub fn updated(&self) -> usize {
        self.sources.iter().map(|s| s.merge.updated).sum()
    }
}

/// One pass over every enabled source. Sources run concurrently and fail independently.
pub struct ScrapeCycle {
    sources: Vec<SourceConfig>,
    http: Arc<dyn MarkupFetcher>,
    browser: Arc<dyn MarkupFetcher>,
    store: Arc<dyn TopicStore>,
    forum_offset: FixedOffset,
    running: Mutex<()>,
}

impl ScrapeCycle {
    pub fn new(
        sources: Vec<SourceConfig>,
        http: Arc<dyn MarkupFetcher>,
        browser: Arc<dyn MarkupFetcher>,
        store: Arc<dyn TopicStore>,
        forum_offset: FixedOffset,
    ) -> Self {
        Self {
            sources,
            http,
            browser,
            store,
            forum_offset,
            running: Mutex::new(()),
        }
    }

    /// Wire the real fetchers for the enabled sources of `registry`.
    pub fn from_config(config: &SyncConfig, registry: &SourceRegistry, store: Arc<dyn TopicStore>) -> Result<Self> {
        let http = HttpFetcher::new(config.http_client_config()).context("building http client")?;
        let browser = BrowserFetcher::new(config.browser_fetch_config());
        Ok(Self::new(
            registry.enabled().cloned().collect(),
            Arc::new(http),
            Arc::new(browser),
            store,
            config.forum_offset(),
        ))
    }

    pub fn sources(&self) -> &[SourceConfig] {
        &self.sources
    }

    pub async fn run_once(&self) -> CycleReport {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();

        let Ok(_guard) = self.running.try_lock() else {
            warn!(%run_id, "previous scrape cycle still running; skipping");
            return CycleReport {
                run_id,
                started_at,
                finished_at: Utc::now(),
                skipped: true,
                sources: Vec::new(),
            };
        };

        let span = info_span!("scrape_cycle", %run_id);
        let sources = join_all(self.sources.iter().map(|source| self.run_source(source)))
            .instrument(span.clone())
            .await;

        let report = CycleReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            skipped: false,
            sources,
        };
        span.in_scope(|| {
            info!(
                sources = report.sources.len(),
                failed = report.failed(),
                inserted = report.inserted(),
                updated = report.updated(),
                "scrape cycle finished"
            )
        });
        report
    }

    async fn run_source(&self, source: &SourceConfig) -> SourceReport {
        let started = Instant::now();
        let span = info_span!("scrape_source", site = %source.site_key, mode = ?source.fetch_mode);

        let result = self.scrape_source(source).instrument(span.clone()).await;
        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        span.in_scope(|| match result {
            Ok((parsed, merge)) => {
                info!(parsed, inserted = merge.inserted, updated = merge.updated, elapsed_ms, "source merged");
                SourceReport {
                    site_key: source.site_key,
                    parsed,
                    merge,
                    error: None,
                    elapsed_ms,
                }
            }
            Err(err) => {
                warn!(error = %err, elapsed_ms, "source skipped");
                SourceReport {
                    site_key: source.site_key,
                    parsed: 0,
                    merge: MergeOutcome::default(),
                    error: Some(err.to_string()),
                    elapsed_ms,
                }
            }
        })
    }

    async fn scrape_source(&self, source: &SourceConfig) -> Result<(usize, MergeOutcome), SourceFailure> {
        let fetcher = match source.fetch_mode {
            FetchMode::Http => &self.http,
            FetchMode::Browser => &self.browser,
        };
        let markup = fetcher.fetch_markup(&source.fetch_request()).await?;

        let fetched_at = Utc::now();
        let ctx = AdapterContext::new(fetched_at, self.forum_offset);
        let drafts = adapter_for_site(source.site_key, source.exclusions()).parse_listing(&ctx, &markup);
        let parsed = drafts.len();

        let merge = merge_batch(self.store.as_ref(), source.site_key, drafts, fetched_at).await?;
        Ok((parsed, merge))
    }
}

pub async fn open_store(config: &SyncConfig) -> Result<SqliteTopicStore> {
    let path = config.database_path();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    SqliteTopicStore::open(&path)
        .await
        .with_context(|| format!("opening topic store at {}", path.display()))
}

/// Fire `cycle` every `interval`. The scheduler is returned unstarted.
pub async fn build_scheduler(cycle: Arc<ScrapeCycle>, interval: Duration) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_repeated_async(interval, move |_uuid, _lock| {
        let cycle = Arc::clone(&cycle);
        Box::pin(async move {
            cycle.run_once().await;
        })
    })
    .with_context(|| format!("creating scrape job every {}s", interval.as_secs()))?;
    sched.add(job).await.context("adding scrape job")?;
    Ok(sched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use agora_core::{NewTopic, PersistedTopic};
    use agora_storage::{FetchRequest, MemoryTopicStore};
    use async_trait::async_trait;
    use std::collections::{BTreeSet, HashMap};
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Serves canned markup per URL; unknown URLs time out.
    #[derive(Default)]
    struct CannedFetcher {
        pages: HashMap<String, String>,
        calls: AtomicUsize,
    }

    impl CannedFetcher {
        fn with_page(mut self, url: &str, markup: String) -> Self {
            self.pages.insert(url.to_string(), markup);
            self
        }
    }

    #[async_trait]
    impl MarkupFetcher for CannedFetcher {
        async fn fetch_markup(&self, request: &FetchRequest) -> Result<String, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.pages.get(&request.url).cloned().ok_or_else(|| FetchError::Timeout {
                url: request.url.clone(),
            })
        }
    }

    fn fixture(site: SiteKey) -> String {
        let path = Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../../fixtures")
            .join(site.as_str())
            .join("listing.html");
        std::fs::read_to_string(&path).unwrap_or_else(|e| panic!("reading {}: {e}", path.display()))
    }

    fn source(site_key: SiteKey, listing_url: &str, fetch_mode: FetchMode) -> SourceConfig {
        SourceConfig {
            site_key,
            display_name: site_key.to_string(),
            enabled: true,
            listing_url: listing_url.to_string(),
            fetch_mode,
            ready_selector: None,
            excluded_titles: None,
        }
    }

    fn utc() -> FixedOffset {
        FixedOffset::east_opt(0).unwrap()
    }

    #[tokio::test]
    async fn failing_source_does_not_block_the_others() {
        let http = Arc::new(
            CannedFetcher::default()
                .with_page("https://onche.test/listing", fixture(SiteKey::Onche))
                .with_page("https://avenoel.test/listing", fixture(SiteKey::Avenoel)),
        );
        let browser = Arc::new(
            CannedFetcher::default().with_page("https://2sucres.test/listing", fixture(SiteKey::DeuxSucres)),
        );
        let store = Arc::new(MemoryTopicStore::new());
        let cycle = ScrapeCycle::new(
            vec![
                source(SiteKey::Onche, "https://onche.test/listing", FetchMode::Http),
                source(SiteKey::Avenoel, "https://avenoel.test/listing", FetchMode::Http),
                source(SiteKey::Village, "https://village.test/down", FetchMode::Http),
                source(SiteKey::DeuxSucres, "https://2sucres.test/listing", FetchMode::Browser),
            ],
            http.clone(),
            browser.clone(),
            store.clone(),
            utc(),
        );

        let report = cycle.run_once().await;

        assert!(!report.skipped);
        assert_eq!(report.sources.len(), 4);
        assert_eq!(report.failed(), 1);
        let village = report.sources.iter().find(|s| s.site_key == SiteKey::Village).unwrap();
        assert!(village.error.as_deref().unwrap_or_default().contains("fetch failed"));
        assert_eq!(http.calls.load(Ordering::SeqCst), 3);
        assert_eq!(browser.calls.load(Ordering::SeqCst), 1);

        assert_eq!(report.inserted(), 4 + 3 + 3);
        assert_eq!(store.count().await.unwrap(), 10);
        let sites = store.distinct_site_keys().await.unwrap();
        assert!(!sites.contains(&SiteKey::Village));
    }

    /// Memory store whose inserts fail for URLs on one host.
    struct BrokenHostStore {
        inner: MemoryTopicStore,
        host: &'static str,
    }

    #[async_trait]
    impl TopicStore for BrokenHostStore {
        async fn find_by_url(&self, topic_url: &str) -> Result<Option<PersistedTopic>, StoreError> {
            self.inner.find_by_url(topic_url).await
        }

        async fn insert(&self, topic: &NewTopic) -> Result<PersistedTopic, StoreError> {
            if topic.topic_url.contains(self.host) {
                return Err(StoreError::Database(sqlx::Error::PoolClosed));
            }
            self.inner.insert(topic).await
        }

        async fn update(&self, topic: &PersistedTopic) -> Result<bool, StoreError> {
            self.inner.update(topic).await
        }

        async fn top_by_replies(&self, limit: usize) -> Result<Vec<PersistedTopic>, StoreError> {
            self.inner.top_by_replies(limit).await
        }

        async fn recent_by_site(&self, site_key: SiteKey, limit: usize) -> Result<Vec<PersistedTopic>, StoreError> {
            self.inner.recent_by_site(site_key, limit).await
        }

        async fn distinct_site_keys(&self) -> Result<BTreeSet<SiteKey>, StoreError> {
            self.inner.distinct_site_keys().await
        }

        async fn count(&self) -> Result<usize, StoreError> {
            self.inner.count().await
        }
    }

    #[tokio::test]
    async fn store_failure_aborts_only_that_source() {
        let http = Arc::new(
            CannedFetcher::default()
                .with_page("https://onche.test/", fixture(SiteKey::Onche))
                .with_page("https://avenoel.test/", fixture(SiteKey::Avenoel))
                .with_page("https://2sucres.test/", fixture(SiteKey::DeuxSucres))
                .with_page("https://jv.test/", fixture(SiteKey::Jeuxvideo)),
        );
        let store = Arc::new(BrokenHostStore {
            inner: MemoryTopicStore::new(),
            host: "2sucres.org",
        });
        let cycle = ScrapeCycle::new(
            vec![
                source(SiteKey::Onche, "https://onche.test/", FetchMode::Http),
                source(SiteKey::DeuxSucres, "https://2sucres.test/", FetchMode::Http),
                source(SiteKey::Avenoel, "https://avenoel.test/", FetchMode::Http),
                source(SiteKey::Jeuxvideo, "https://jv.test/", FetchMode::Http),
            ],
            http.clone(),
            http,
            store.clone(),
            utc(),
        );

        let report = cycle.run_once().await;

        assert!(!report.skipped);
        assert_eq!(report.sources.len(), 4);
        assert_eq!(report.failed(), 1);
        let sucres = report.sources.iter().find(|s| s.site_key == SiteKey::DeuxSucres).unwrap();
        assert!(sucres.error.as_deref().unwrap_or_default().starts_with("merge failed"));
        assert_eq!(sucres.merge, MergeOutcome::default());

        for site in [SiteKey::Onche, SiteKey::Avenoel, SiteKey::Jeuxvideo] {
            let merged = report.sources.iter().find(|s| s.site_key == site).unwrap();
            assert!(merged.error.is_none(), "{site}: {:?}", merged.error);
            assert_eq!(merged.merge.inserted, merged.parsed);
        }
        assert_eq!(store.count().await.unwrap(), 4 + 3 + 3);
        assert!(!store.distinct_site_keys().await.unwrap().contains(&SiteKey::DeuxSucres));
    }

    #[tokio::test]
    async fn second_cycle_updates_instead_of_duplicating() {
        let http = Arc::new(CannedFetcher::default().with_page("https://jv.test/", fixture(SiteKey::Jeuxvideo)));
        let store = Arc::new(MemoryTopicStore::new());
        let cycle = ScrapeCycle::new(
            vec![source(SiteKey::Jeuxvideo, "https://jv.test/", FetchMode::Http)],
            http.clone(),
            http,
            store.clone(),
            utc(),
        );

        let first = cycle.run_once().await;
        let second = cycle.run_once().await;

        assert_eq!(first.inserted(), 3);
        assert_eq!(second.inserted(), 0);
        assert_eq!(second.updated(), 3);
        assert_eq!(store.count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn overlapping_cycle_is_skipped() {
        let fetcher = Arc::new(CannedFetcher::default());
        let cycle = ScrapeCycle::new(
            vec![source(SiteKey::Onche, "https://onche.test/", FetchMode::Http)],
            fetcher.clone(),
            fetcher.clone(),
            Arc::new(MemoryTopicStore::new()),
            utc(),
        );

        let _busy = cycle.running.try_lock().unwrap();
        let report = cycle.run_once().await;

        assert!(report.skipped);
        assert!(report.sources.is_empty());
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn open_store_creates_the_parent_directory() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = SyncConfig {
            database_url: format!("sqlite://{}", dir.path().join("nested/agora.db").display()),
            ..SyncConfig::default()
        };
        let store = open_store(&config).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 0);
        assert!(dir.path().join("nested/agora.db").exists());
    }
}
