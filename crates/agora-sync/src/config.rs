use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use agora_adapters::ExclusionSet;
use agora_core::SiteKey;
use agora_storage::{BrowserFetchConfig, FetchRequest, HttpClientConfig, DEFAULT_USER_AGENT};
use anyhow::{bail, Context, Result};
use chrono::{FixedOffset, Offset, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// SQLite file path; a `sqlite:` / `sqlite://` prefix is accepted.
    pub database_url: String,
    pub scrape_interval_secs: u64,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub chrome_path: Option<PathBuf>,
    pub chrome_profile_dir: Option<PathBuf>,
    pub browser_settle_ms: u64,
    pub browser_ready_timeout_secs: u64,
    pub forum_utc_offset_minutes: i32,
    pub scheduler_enabled: bool,
    pub workspace_root: PathBuf,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; unset or unparseable values take their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let parsed = |key: &str, default: u64| {
            lookup(key)
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(default)
        };
        let path = |key: &str| lookup(key).filter(|v| !v.trim().is_empty()).map(PathBuf::from);

        Self {
            database_url: lookup("DATABASE_URL").unwrap_or_else(|| "./data/agora.db".to_string()),
            scrape_interval_secs: parsed("AGORA_SCRAPE_INTERVAL_SECS", 60),
            http_timeout_secs: parsed("AGORA_HTTP_TIMEOUT_SECS", 10),
            user_agent: lookup("AGORA_USER_AGENT").unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            chrome_path: path("AGORA_CHROME_PATH"),
            chrome_profile_dir: path("AGORA_CHROME_PROFILE_DIR"),
            browser_settle_ms: parsed("AGORA_BROWSER_SETTLE_MS", 2_000),
            browser_ready_timeout_secs: parsed("AGORA_BROWSER_READY_TIMEOUT_SECS", 30),
            forum_utc_offset_minutes: lookup("AGORA_FORUM_UTC_OFFSET_MINUTES")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(0),
            scheduler_enabled: lookup("AGORA_SCHEDULER_ENABLED")
                .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(true),
            workspace_root: path("AGORA_WORKSPACE_ROOT").unwrap_or_else(|| PathBuf::from(".")),
        }
    }

    pub fn database_path(&self) -> PathBuf {
        let raw = self.database_url.trim();
        let raw = raw
            .strip_prefix("sqlite://")
            .or_else(|| raw.strip_prefix("sqlite:"))
            .unwrap_or(raw);
        PathBuf::from(raw)
    }

    pub fn sources_path(&self) -> PathBuf {
        self.workspace_root.join("sources.yaml")
    }

    pub fn scrape_interval(&self) -> Duration {
        Duration::from_secs(self.scrape_interval_secs.max(1))
    }

    /// Offset naive forum timestamps are read in. Out-of-range values fall back to UTC.
    pub fn forum_offset(&self) -> FixedOffset {
        self.forum_utc_offset_minutes
            .checked_mul(60)
            .and_then(FixedOffset::east_opt)
            .unwrap_or_else(|| {
                warn!(
                    minutes = self.forum_utc_offset_minutes,
                    "forum UTC offset out of range; using UTC"
                );
                Utc.fix()
            })
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs.max(1)),
            user_agent: Some(self.user_agent.clone()),
        }
    }

    pub fn browser_fetch_config(&self) -> BrowserFetchConfig {
        BrowserFetchConfig {
            chrome_path: self.chrome_path.clone(),
            profile_dir: self.chrome_profile_dir.clone(),
            ready_timeout: Duration::from_secs(self.browser_ready_timeout_secs),
            settle: Duration::from_millis(self.browser_settle_ms),
            ..Default::default()
        }
    }
}

/// Feed shape: how many rows, and how many of them each forum is guaranteed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedConfig {
    pub page_size: usize,
    pub per_source_floor: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            page_size: 60,
            per_source_floor: 5,
        }
    }
}

impl FeedConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let parsed = |key: &str, default: usize| {
            lookup(key)
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(default)
        };
        Self {
            page_size: parsed("AGORA_PAGE_SIZE", defaults.page_size),
            per_source_floor: parsed("AGORA_PER_SOURCE_FLOOR", defaults.per_source_floor),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchMode {
    #[default]
    Http,
    /// Client-rendered listing; needs a headless browser.
    Browser,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub site_key: SiteKey,
    pub display_name: String,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    pub listing_url: String,
    #[serde(default)]
    pub fetch_mode: FetchMode,
    #[serde(default)]
    pub ready_selector: Option<String>,
    /// Replaces the built-in exclusion list when present.
    #[serde(default)]
    pub excluded_titles: Option<ExclusionSet>,
}

fn enabled_by_default() -> bool {
    true
}

impl SourceConfig {
    pub fn exclusions(&self) -> ExclusionSet {
        self.excluded_titles
            .clone()
            .unwrap_or_else(|| ExclusionSet::defaults_for(self.site_key))
    }

    pub fn fetch_request(&self) -> FetchRequest {
        FetchRequest {
            site_key: self.site_key,
            url: self.listing_url.clone(),
            ready_selector: self.ready_selector.clone(),
        }
    }
}

impl SourceRegistry {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let registry: Self = serde_yaml::from_str(text).context("parsing source registry")?;
        registry.validate()?;
        Ok(registry)
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }

    /// Exclusions a scrape of `site` would apply: the configured list, else the built-in one.
    pub fn exclusions_for(&self, site: SiteKey) -> ExclusionSet {
        self.sources
            .iter()
            .find(|s| s.site_key == site)
            .map(SourceConfig::exclusions)
            .unwrap_or_else(|| ExclusionSet::defaults_for(site))
    }

    fn validate(&self) -> Result<()> {
        let mut seen = BTreeSet::new();
        for source in &self.sources {
            if !seen.insert(source.site_key) {
                bail!("site `{}` is configured more than once", source.site_key);
            }
            if source.listing_url.trim().is_empty() {
                bail!("site `{}` has an empty listing_url", source.site_key);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_the_documented_values() {
        let config = SyncConfig::default();
        assert_eq!(config.database_path(), PathBuf::from("./data/agora.db"));
        assert_eq!(config.scrape_interval(), Duration::from_secs(60));
        assert_eq!(config.http_timeout_secs, 10);
        assert!(config.scheduler_enabled);
        assert_eq!(config.forum_offset().local_minus_utc(), 0);
        assert_eq!(FeedConfig::default(), FeedConfig { page_size: 60, per_source_floor: 5 });
    }

    #[test]
    fn lookup_values_override_defaults() {
        let config = SyncConfig::from_lookup(lookup_from(&[
            ("DATABASE_URL", "sqlite://var/agora.db"),
            ("AGORA_SCRAPE_INTERVAL_SECS", "300"),
            ("AGORA_FORUM_UTC_OFFSET_MINUTES", "120"),
            ("AGORA_SCHEDULER_ENABLED", "false"),
            ("AGORA_HTTP_TIMEOUT_SECS", "soon"),
        ]));
        assert_eq!(config.database_path(), PathBuf::from("var/agora.db"));
        assert_eq!(config.scrape_interval_secs, 300);
        assert_eq!(config.forum_offset().local_minus_utc(), 7_200);
        assert!(!config.scheduler_enabled);
        assert_eq!(config.http_timeout_secs, 10);

        let feed = FeedConfig::from_lookup(lookup_from(&[("AGORA_PAGE_SIZE", "20")]));
        assert_eq!(feed, FeedConfig { page_size: 20, per_source_floor: 5 });
    }

    #[test]
    fn out_of_range_offset_falls_back_to_utc() {
        let config = SyncConfig::from_lookup(lookup_from(&[("AGORA_FORUM_UTC_OFFSET_MINUTES", "100000")]));
        assert_eq!(config.forum_offset().local_minus_utc(), 0);
    }

    #[test]
    fn registry_applies_defaults_and_overrides() {
        let registry = SourceRegistry::from_yaml_str(
            r#"
sources:
  - site_key: onche
    display_name: Onche
    listing_url: https://onche.org/forum/1/blabla-general
  - site_key: 2sucres
    display_name: 2Sucres
    listing_url: https://2sucres.org/forums/1/1
    fetch_mode: browser
    ready_selector: "div.tbody > div > div.tr"
    excluded_titles: ["Annonce"]
  - site_key: village
    display_name: Village
    enabled: false
    listing_url: https://village.cx/village
"#,
        )
        .unwrap();

        let enabled = registry.enabled().collect::<Vec<_>>();
        assert_eq!(enabled.len(), 2);
        assert_eq!(enabled[0].fetch_mode, FetchMode::Http);
        assert_eq!(enabled[0].exclusions(), ExclusionSet::defaults_for(SiteKey::Onche));
        assert_eq!(enabled[1].fetch_mode, FetchMode::Browser);
        assert!(enabled[1].exclusions().contains("Annonce"));
        assert_eq!(
            enabled[1].fetch_request().ready_selector.as_deref(),
            Some("div.tbody > div > div.tr")
        );

        assert_eq!(registry.exclusions_for(SiteKey::DeuxSucres), ExclusionSet::new(["Annonce"]));
        assert_eq!(
            registry.exclusions_for(SiteKey::Jeuxvideo),
            ExclusionSet::defaults_for(SiteKey::Jeuxvideo)
        );
    }

    #[test]
    fn registry_rejects_duplicate_sites() {
        let err = SourceRegistry::from_yaml_str(
            r#"
sources:
  - { site_key: onche, display_name: A, listing_url: "https://onche.org/a" }
  - { site_key: onche, display_name: B, listing_url: "https://onche.org/b" }
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[tokio::test]
    async fn shipped_registry_covers_every_site() {
        let root = Path::new(env!("CARGO_MANIFEST_DIR")).join("../..");
        let registry = SourceRegistry::load(&root.join("sources.yaml")).await.unwrap();
        let sites = registry.enabled().map(|s| s.site_key).collect::<BTreeSet<_>>();
        assert_eq!(sites.len(), SiteKey::ALL.len());
    }
}
