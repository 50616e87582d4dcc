use agora_core::time::{absolute_to_epoch, INVALID_EPOCH};
use agora_core::{SiteKey, TopicDraft};

use crate::{
    compile_all, element_text, first_text, href_of, parse_items, parse_reply_count, AdapterContext,
    ExclusionSet, SourceAdapter,
};

const CONTAINER: &str = "tr";
const ITEM_SELECTORS: [&str; 4] = [
    "td.topics-title a",
    "td.topics-author a",
    "td.topics-amount",
    "td.topics-date",
];

/// avenoel.org: a plain table; titles carry a trailing `(n)` reply counter.
#[derive(Debug, Clone, Default)]
pub struct AvenoelAdapter {
    exclusions: ExclusionSet,
}

impl AvenoelAdapter {
    pub fn new(exclusions: ExclusionSet) -> Self {
        Self { exclusions }
    }
}

impl SourceAdapter for AvenoelAdapter {
    fn site_key(&self) -> SiteKey {
        SiteKey::Avenoel
    }

    fn parse_listing(&self, ctx: &AdapterContext, markup: &str) -> Vec<TopicDraft> {
        let site = self.site_key();
        let Some([title_link, author, amount, date]) = compile_all(site, ITEM_SELECTORS) else {
            return Vec::new();
        };
        let now = ctx.local_now();

        parse_items(site, markup, CONTAINER, &self.exclusions, |row| {
            let Some(link) = row.select(&title_link).next() else {
                return Ok(None);
            };
            let title = element_text(link).map(|text| strip_reply_suffix(&text).to_string());
            let (Some(title), Some(topic_url)) = (title.filter(|t| !t.is_empty()), href_of(site, link)) else {
                return Ok(None);
            };
            let replies = parse_reply_count(first_text(row, &amount).as_deref())?;
            let last_activity = first_text(row, &date)
                .map(|text| absolute_to_epoch(&text, now))
                .unwrap_or(INVALID_EPOCH);

            Ok(Some(TopicDraft {
                title,
                topic_url,
                username: first_text(row, &author),
                replies,
                last_activity,
            }))
        })
    }
}

/// Drop a trailing numeric `(n)`; other parentheticals belong to the title.
fn strip_reply_suffix(title: &str) -> &str {
    let trimmed = title.trim_end();
    if let Some(body) = trimmed.strip_suffix(')') {
        if let Some(open) = body.rfind('(') {
            let inner = &body[open + 1..];
            if !inner.is_empty() && inner.bytes().all(|b| b.is_ascii_digit()) {
                return body[..open].trim_end();
            }
        }
    }
    trimmed
}
