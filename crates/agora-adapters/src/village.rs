use agora_core::time::{relative_to_epoch, INVALID_EPOCH};
use agora_core::{SiteKey, TopicDraft};
use scraper::ElementRef;

use crate::{
    compact, compile_all, element_text, first_text, href_of, parse_items, parse_reply_count, AdapterContext,
    ExclusionSet, SourceAdapter,
};

const CONTAINER: &str = "div.row-center.bg-base-0";
const ITEM_SELECTORS: [&str; 6] = [
    r#"a[href^="/village/"].row-center"#,
    "div span.font-medium",
    "span.topic-title",
    "i.fa-message-lines",
    "span.row-center.text-sm span",
    "span.ml-auto.mr-2",
];

/// village.cx: server-rendered rows; the age is split across nodes (`5 m`) and the reply count
/// sits next to a speech-bubble icon.
#[derive(Debug, Clone, Default)]
pub struct VillageAdapter {
    exclusions: ExclusionSet,
}

impl VillageAdapter {
    pub fn new(exclusions: ExclusionSet) -> Self {
        Self { exclusions }
    }
}

impl SourceAdapter for VillageAdapter {
    fn site_key(&self) -> SiteKey {
        SiteKey::Village
    }

    fn parse_listing(&self, ctx: &AdapterContext, markup: &str) -> Vec<TopicDraft> {
        let site = self.site_key();
        let Some([topic_link, heading_sel, title_span, reply_icon, author, age]) = compile_all(site, ITEM_SELECTORS)
        else {
            return Vec::new();
        };
        let now = ctx.local_now();

        parse_items(site, markup, CONTAINER, &self.exclusions, |row| {
            let Some(link) = row.select(&topic_link).next() else {
                return Ok(None);
            };
            let heading = link.select(&heading_sel).next();
            let title = heading.and_then(|h| first_text(h, &title_span));
            let (Some(title), Some(topic_url)) = (title, href_of(site, link)) else {
                return Ok(None);
            };

            let reply_text = heading
                .and_then(|h| h.select(&reply_icon).next())
                .and_then(|icon| icon.parent())
                .and_then(ElementRef::wrap)
                .and_then(element_text);
            let replies = parse_reply_count(reply_text.as_deref())?;
            let last_activity = first_text(link, &age)
                .map(|text| relative_to_epoch(&compact(&text), now))
                .unwrap_or(INVALID_EPOCH);

            Ok(Some(TopicDraft {
                title,
                topic_url,
                username: first_text(link, &author),
                replies,
                last_activity,
            }))
        })
    }
}
