use agora_core::time::{relative_to_epoch, INVALID_EPOCH};
use agora_core::{SiteKey, TopicDraft};

use crate::{
    compact, compile_all, first_text, href_of, parse_items, parse_reply_count, AdapterContext, ExclusionSet,
    SourceAdapter,
};

const CONTAINER: &str = "div.topic";
const ITEM_SELECTORS: [&str; 5] = [
    "a.topic-subject.link",
    "span",
    "div.topic-username",
    "span.topic-nb",
    "a.right span",
];

/// onche.org: `div.topic` cards with a relative age (`43s`, `5m`, `2h`, `3j`).
#[derive(Debug, Clone, Default)]
pub struct OncheAdapter {
    exclusions: ExclusionSet,
}

impl OncheAdapter {
    pub fn new(exclusions: ExclusionSet) -> Self {
        Self { exclusions }
    }
}

impl SourceAdapter for OncheAdapter {
    fn site_key(&self) -> SiteKey {
        SiteKey::Onche
    }

    fn parse_listing(&self, ctx: &AdapterContext, markup: &str) -> Vec<TopicDraft> {
        let site = self.site_key();
        let Some([subject, subject_text, username, reply_count, age]) = compile_all(site, ITEM_SELECTORS) else {
            return Vec::new();
        };
        let now = ctx.local_now();

        parse_items(site, markup, CONTAINER, &self.exclusions, |item| {
            let Some(link) = item.select(&subject).next() else {
                return Ok(None);
            };
            let (Some(title), Some(topic_url)) = (first_text(link, &subject_text), href_of(site, link)) else {
                return Ok(None);
            };
            let replies = parse_reply_count(first_text(item, &reply_count).as_deref())?;
            let last_activity = first_text(item, &age)
                .map(|text| relative_to_epoch(&compact(&text), now))
                .unwrap_or(INVALID_EPOCH);

            Ok(Some(TopicDraft {
                title,
                topic_url,
                username: first_text(item, &username),
                replies,
                last_activity,
            }))
        })
    }
}
