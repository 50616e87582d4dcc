use agora_core::time::{absolute_to_epoch, INVALID_EPOCH};
use agora_core::{SiteKey, TopicDraft};

use crate::{
    compile_all, element_text, first_text, href_of, parse_items, parse_reply_count, AdapterContext,
    ExclusionSet, SourceAdapter,
};

const CONTAINER: &str = "ul.topic-list > li[data-id]";
const ITEM_SELECTORS: [&str; 4] = ["a.topic-title", "a.topic-author", "span.topic-count", "span.topic-date a"];

/// jeuxvideo.com: `li[data-id]` rows; dates are a time of day for today's topics and
/// `M/D/YYYY` for older ones.
#[derive(Debug, Clone, Default)]
pub struct JeuxvideoAdapter {
    exclusions: ExclusionSet,
}

impl JeuxvideoAdapter {
    pub fn new(exclusions: ExclusionSet) -> Self {
        Self { exclusions }
    }
}

impl SourceAdapter for JeuxvideoAdapter {
    fn site_key(&self) -> SiteKey {
        SiteKey::Jeuxvideo
    }

    fn parse_listing(&self, ctx: &AdapterContext, markup: &str) -> Vec<TopicDraft> {
        let site = self.site_key();
        let Some([title_link, author, count, date]) = compile_all(site, ITEM_SELECTORS) else {
            return Vec::new();
        };
        let now = ctx.local_now();

        parse_items(site, markup, CONTAINER, &self.exclusions, |row| {
            let Some(link) = row.select(&title_link).next() else {
                return Ok(None);
            };
            let (Some(title), Some(topic_url)) = (element_text(link), href_of(site, link)) else {
                return Ok(None);
            };
            let replies = parse_reply_count(first_text(row, &count).as_deref())?;
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
