use agora_core::time::{absolute_to_epoch, INVALID_EPOCH};
use agora_core::{SiteKey, TopicDraft};

use crate::{
    compile_all, element_text, first_text, href_of, parse_items, parse_reply_count, AdapterContext,
    ExclusionSet, SourceAdapter,
};

const CONTAINER: &str = "div.tbody > div > div.tr";
const ITEM_SELECTORS: [&str; 4] = [
    "div.topicName a",
    "div.topicAuteur a",
    "div.topicNb",
    "div.topicDernier a",
];

/// 2sucres.org: client-rendered div table, so the markup has to come from a browser fetch.
#[derive(Debug, Clone, Default)]
pub struct DeuxSucresAdapter {
    exclusions: ExclusionSet,
}

impl DeuxSucresAdapter {
    pub fn new(exclusions: ExclusionSet) -> Self {
        Self { exclusions }
    }
}

impl SourceAdapter for DeuxSucresAdapter {
    fn site_key(&self) -> SiteKey {
        SiteKey::DeuxSucres
    }

    fn parse_listing(&self, ctx: &AdapterContext, markup: &str) -> Vec<TopicDraft> {
        let site = self.site_key();
        let Some([name_link, author, count, latest]) = compile_all(site, ITEM_SELECTORS) else {
            return Vec::new();
        };
        let now = ctx.local_now();

        parse_items(site, markup, CONTAINER, &self.exclusions, |row| {
            let Some(link) = row.select(&name_link).next() else {
                return Ok(None);
            };
            let (Some(title), Some(topic_url)) = (element_text(link), href_of(site, link)) else {
                return Ok(None);
            };
            let replies = parse_reply_count(first_text(row, &count).as_deref())?;
            let last_activity = first_text(row, &latest)
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
