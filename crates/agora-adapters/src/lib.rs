//! Forum listing adapters: rendered markup in, topic drafts out.
//!
//! Parsing is synchronous and deterministic given an [`AdapterContext`]. Fetching lives in
//! `agora-storage`; scheduling and merging live in `agora-sync`.

use std::collections::BTreeSet;

use agora_core::{SiteKey, TopicDraft};
use chrono::{DateTime, FixedOffset, Utc};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, warn};
use url::Url;

mod avenoel;
mod deux_sucres;
mod jeuxvideo;
mod onche;
mod village;

pub use avenoel::AvenoelAdapter;
pub use deux_sucres::DeuxSucresAdapter;
pub use jeuxvideo::JeuxvideoAdapter;
pub use onche::OncheAdapter;
pub use village::VillageAdapter;

pub const CRATE_NAME: &str = "agora-adapters";

/// Parse-time inputs that are not in the markup itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdapterContext {
    pub fetched_at: DateTime<Utc>,
    /// UTC offset the forum prints its naive timestamps in.
    pub forum_offset: FixedOffset,
}

impl AdapterContext {
    pub fn new(fetched_at: DateTime<Utc>, forum_offset: FixedOffset) -> Self {
        Self {
            fetched_at,
            forum_offset,
        }
    }

    /// The fetch instant as seen on the forum's wall clock.
    pub fn local_now(&self) -> DateTime<FixedOffset> {
        self.fetched_at.with_timezone(&self.forum_offset)
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("invalid selector `{selector}`: {message}")]
    Selector { selector: String, message: String },
    #[error("reply count `{0}` has no digits")]
    ReplyCount(String),
    #[error("reply count `{0}` is out of range")]
    ReplyOverflow(String),
}

/// One forum's listing parser.
///
/// Never fails past this boundary: malformed items are logged and skipped, and a page with no
/// recognizable topic container yields an empty vector. Output keeps document order.
pub trait SourceAdapter: Send + Sync {
    fn site_key(&self) -> SiteKey;
    fn parse_listing(&self, ctx: &AdapterContext, markup: &str) -> Vec<TopicDraft>;
}

/// Titles that are never emitted (pinned moderation topics and the like). Matching is exact
/// after trimming.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExclusionSet(BTreeSet<String>);

impl ExclusionSet {
    pub fn new<I, S>(titles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(
            titles
                .into_iter()
                .map(|title| title.into().trim().to_string())
                .filter(|title| !title.is_empty())
                .collect(),
        )
    }

    pub fn defaults_for(site: SiteKey) -> Self {
        match site {
            SiteKey::Onche => Self::new(["Topic de la modération", "[À LIRE] Règles du forum"]),
            SiteKey::Avenoel => Self::new(["Topic de modération", "🟣 Discord d'AVN (nouveau lien)"]),
            SiteKey::Jeuxvideo => Self::new(["Modération ultime= pas nous", "Règles du forum"]),
            SiteKey::DeuxSucres => Self::new([
                "Les bugs / éléments inconvenants sur 2Sucres",
                "[OFFICIEL] Bienvenue aux NOUVEAUX ! + TUTO",
                "Secrétariat de 2S (Modération/Administration)",
                "Feuille de route du développement de 2Sucres",
            ]),
            SiteKey::Village => Self::default(),
        }
    }

    pub fn contains(&self, title: &str) -> bool {
        self.0.contains(title.trim())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

pub fn adapter_for_site(site: SiteKey, exclusions: ExclusionSet) -> Box<dyn SourceAdapter> {
    match site {
        SiteKey::Onche => Box::new(OncheAdapter::new(exclusions)),
        SiteKey::Avenoel => Box::new(AvenoelAdapter::new(exclusions)),
        SiteKey::Village => Box::new(VillageAdapter::new(exclusions)),
        SiteKey::Jeuxvideo => Box::new(JeuxvideoAdapter::new(exclusions)),
        SiteKey::DeuxSucres => Box::new(DeuxSucresAdapter::new(exclusions)),
    }
}

/// Adapter with the built-in exclusion set for `site`.
pub fn default_adapter_for_site(site: SiteKey) -> Box<dyn SourceAdapter> {
    adapter_for_site(site, ExclusionSet::defaults_for(site))
}

/// Scheme and host relative topic links are resolved against.
pub fn forum_origin(site: SiteKey) -> &'static str {
    match site {
        SiteKey::Onche => "https://onche.org",
        SiteKey::Avenoel => "https://avenoel.org",
        SiteKey::Village => "https://village.cx",
        SiteKey::Jeuxvideo => "https://www.jeuxvideo.com",
        SiteKey::DeuxSucres => "https://2sucres.org",
    }
}

/// Resolve `href` against the forum origin; absolute links are kept as they are.
pub fn resolve_topic_url(site: SiteKey, href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty() {
        return None;
    }
    let base = Url::parse(forum_origin(site)).ok()?;
    base.join(href).ok().map(String::from)
}

/// Walk every element matching `container` and keep what `extract` turns into a draft.
///
/// `Ok(None)` from `extract` marks a non-topic row (header, ad) and is dropped quietly;
/// `Err` is a malformed topic and is logged.
pub(crate) fn parse_items<F>(
    site: SiteKey,
    markup: &str,
    container: &str,
    exclusions: &ExclusionSet,
    mut extract: F,
) -> Vec<TopicDraft>
where
    F: FnMut(ElementRef<'_>) -> Result<Option<TopicDraft>, AdapterError>,
{
    let container = match compile(container) {
        Ok(selector) => selector,
        Err(err) => {
            error!(%site, error = %err, "container selector rejected");
            return Vec::new();
        }
    };

    let document = Html::parse_document(markup);
    let mut drafts = Vec::new();
    let mut excluded = 0usize;
    for (index, item) in document.select(&container).enumerate() {
        match extract(item) {
            Ok(Some(draft)) if exclusions.contains(&draft.title) => excluded += 1,
            Ok(Some(draft)) => drafts.push(draft),
            Ok(None) => debug!(%site, index, "row without title or link"),
            Err(err) => warn!(%site, index, error = %err, "skipping malformed topic"),
        }
    }

    debug!(%site, parsed = drafts.len(), excluded, "listing parsed");
    drafts
}

pub(crate) fn compile(selector: &str) -> Result<Selector, AdapterError> {
    Selector::parse(selector).map_err(|e| AdapterError::Selector {
        selector: selector.to_string(),
        message: e.to_string(),
    })
}

/// Build a selector table for one parse, logging and yielding `None` if any entry is invalid.
pub(crate) fn compile_all<const N: usize>(site: SiteKey, selectors: [&str; N]) -> Option<[Selector; N]> {
    let mut compiled = Vec::with_capacity(N);
    for selector in selectors {
        match compile(selector) {
            Ok(sel) => compiled.push(sel),
            Err(err) => {
                error!(%site, error = %err, "item selector rejected");
                return None;
            }
        }
    }
    compiled.try_into().ok()
}

/// Element text with runs of whitespace collapsed to one space; `None` when blank.
pub(crate) fn element_text(element: ElementRef<'_>) -> Option<String> {
    let text = element.text().flat_map(str::split_whitespace).collect::<Vec<_>>().join(" ");
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

pub(crate) fn first_text(scope: ElementRef<'_>, selector: &Selector) -> Option<String> {
    scope.select(selector).next().and_then(element_text)
}

pub(crate) fn href_of(site: SiteKey, element: ElementRef<'_>) -> Option<String> {
    element
        .value()
        .attr("href")
        .and_then(|href| resolve_topic_url(site, href))
}

/// Text with every whitespace character removed (`"5 m"` becomes `"5m"`).
pub(crate) fn compact(text: &str) -> String {
    text.chars().filter(|c| !c.is_whitespace()).collect()
}

/// Missing element means no replies; present but digit-free text is malformed.
pub(crate) fn parse_reply_count(text: Option<&str>) -> Result<u32, AdapterError> {
    let Some(text) = text else {
        return Ok(0);
    };
    let digits = text.chars().filter(char::is_ascii_digit).collect::<String>();
    if digits.is_empty() {
        return Err(AdapterError::ReplyCount(text.to_string()));
    }
    digits
        .parse()
        .map_err(|_| AdapterError::ReplyOverflow(text.to_string()))
}
