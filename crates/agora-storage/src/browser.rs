//! Headless-browser markup fetcher.
//!
//! Each fetch launches its own Chromium session and tears it down before returning, whatever
//! the outcome. Sessions are scarce, so a semaphore bounds how many run at once.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::Page;
use futures_util::StreamExt;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, info_span, warn, Instrument};

use crate::{FetchError, FetchRequest, MarkupFetcher};

const READY_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub struct BrowserFetchConfig {
    /// Chrome/Chromium executable; auto-detected when `None`.
    pub chrome_path: Option<PathBuf>,
    /// Persistent profile directory, so cookies from a manual login survive between sessions.
    pub profile_dir: Option<PathBuf>,
    pub navigation_timeout: Duration,
    pub ready_timeout: Duration,
    /// Extra wait after navigation so client-side rendering can finish.
    pub settle: Duration,
    pub max_sessions: usize,
}

impl Default for BrowserFetchConfig {
    fn default() -> Self {
        Self {
            chrome_path: None,
            profile_dir: None,
            navigation_timeout: Duration::from_secs(30),
            ready_timeout: Duration::from_secs(30),
            settle: Duration::from_secs(2),
            max_sessions: 1,
        }
    }
}

pub struct BrowserFetcher {
    config: BrowserFetchConfig,
    sessions: Semaphore,
}

impl BrowserFetcher {
    pub fn new(config: BrowserFetchConfig) -> Self {
        let sessions = Semaphore::new(config.max_sessions.max(1));
        Self { config, sessions }
    }

    async fn scrape_once(&self, request: &FetchRequest) -> Result<String, FetchError> {
        let _permit = self
            .sessions
            .acquire()
            .await
            .map_err(|_| FetchError::Session("browser session pool closed".to_string()))?;

        let session = BrowserSession::launch(&self.config).await?;
        let budget = self.config.navigation_timeout + self.config.ready_timeout + self.config.settle;
        let rendered = match tokio::time::timeout(budget, session.render(request, &self.config)).await {
            Ok(result) => result,
            Err(_) => Err(FetchError::Timeout {
                url: request.url.clone(),
            }),
        };
        session.close().await;
        rendered
    }
}

#[async_trait]
impl MarkupFetcher for BrowserFetcher {
    async fn fetch_markup(&self, request: &FetchRequest) -> Result<String, FetchError> {
        let span = info_span!("browser_fetch", site = %request.site_key, url = %request.url);
        self.scrape_once(request).instrument(span).await
    }
}

/// One launched browser plus its CDP event pump. Dropping it kills both.
struct BrowserSession {
    browser: Browser,
    handler: JoinHandle<()>,
}

impl BrowserSession {
    async fn launch(config: &BrowserFetchConfig) -> Result<Self, FetchError> {
        let mut builder = BrowserConfig::builder()
            .request_timeout(config.navigation_timeout)
            .no_sandbox()
            .arg("--headless=new")
            .arg("--disable-gpu")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-popup-blocking")
            .arg("--no-first-run")
            .arg("--no-default-browser-check");

        if let Some(path) = &config.chrome_path {
            builder = builder.chrome_executable(path);
        }
        if let Some(dir) = &config.profile_dir {
            builder = builder.user_data_dir(dir);
        }

        let browser_config = builder.build().map_err(FetchError::Session)?;
        let (browser, mut handler) = Browser::launch(browser_config)
            .await
            .map_err(|e| FetchError::Session(format!("launching browser: {e}")))?;

        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!("browser handler error: {e}");
                }
            }
        });

        Ok(Self { browser, handler })
    }

    async fn render(&self, request: &FetchRequest, config: &BrowserFetchConfig) -> Result<String, FetchError> {
        let page = self
            .browser
            .new_page(request.url.as_str())
            .await
            .map_err(|e| FetchError::Session(format!("opening page: {e}")))?;

        let markup = read_rendered_markup(&page, request, config).await;
        if let Err(e) = page.close().await {
            warn!("failed to close page: {e}");
        }
        markup
    }

    async fn close(mut self) {
        if let Err(e) = self.browser.close().await {
            warn!("failed to close browser: {e}");
        }
        if let Err(e) = self.browser.wait().await {
            debug!("browser process wait failed: {e}");
        }
        self.handler.abort();
    }
}

impl Drop for BrowserSession {
    fn drop(&mut self) {
        self.handler.abort();
    }
}

async fn read_rendered_markup(
    page: &Page,
    request: &FetchRequest,
    config: &BrowserFetchConfig,
) -> Result<String, FetchError> {
    page.wait_for_navigation()
        .await
        .map_err(|e| FetchError::Session(format!("navigation: {e}")))?;

    if let Some(selector) = request.ready_selector.as_deref() {
        wait_for_selector(page, selector, config.ready_timeout).await?;
    }
    tokio::time::sleep(config.settle).await;

    page.content()
        .await
        .map_err(|e| FetchError::Session(format!("reading page content: {e}")))
}

async fn wait_for_selector(page: &Page, selector: &str, timeout: Duration) -> Result<(), FetchError> {
    let started = Instant::now();
    loop {
        if page.find_element(selector).await.is_ok() {
            return Ok(());
        }
        if started.elapsed() >= timeout {
            return Err(FetchError::Session(format!(
                "ready selector `{selector}` not found within {}s",
                timeout.as_secs()
            )));
        }
        tokio::time::sleep(READY_POLL_INTERVAL).await;
    }
}
