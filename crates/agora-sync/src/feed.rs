use std::collections::HashSet;

use agora_core::time::epoch_to_relative;
use agora_core::{PersistedTopic, TopicView};
use agora_storage::{StoreError, TopicStore};
use chrono::{DateTime, FixedOffset};
use tracing::debug;

use crate::FeedConfig;

/// Build the feed page.
///
/// Every site in the store first contributes its `per_source_floor` most recently ingested
/// topics, then the most replied topics fill the page. Rows are deduplicated by id, ordered by
/// last activity (newest first, ties in collection order) and rendered relative to `now`.
/// The page holds `min(page_size, topics in store)` rows.
pub async fn select_feed(
    store: &dyn TopicStore,
    config: &FeedConfig,
    now: DateTime<FixedOffset>,
) -> Result<Vec<TopicView>, StoreError> {
    let mut seen = HashSet::new();
    let mut picked: Vec<PersistedTopic> = Vec::new();

    for site in store.distinct_site_keys().await? {
        for topic in store.recent_by_site(site, config.per_source_floor).await? {
            if seen.insert(topic.id) {
                picked.push(topic);
            }
        }
    }
    let floor_picks = picked.len();

    let remaining = config.page_size.saturating_sub(picked.len());
    if remaining > 0 {
        // Ask for enough rows to cover overlap with the floor picks.
        for topic in store.top_by_replies(remaining + picked.len()).await? {
            if picked.len() >= config.page_size {
                break;
            }
            if seen.insert(topic.id) {
                picked.push(topic);
            }
        }
    }

    picked.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
    picked.truncate(config.page_size);
    debug!(floor_picks, rows = picked.len(), "feed selected");

    Ok(picked.into_iter().map(|topic| render(topic, now)).collect())
}

fn render(topic: PersistedTopic, now: DateTime<FixedOffset>) -> TopicView {
    TopicView {
        site_key: topic.site_key,
        last_activity: epoch_to_relative(topic.last_activity, now),
        title: topic.title,
        topic_url: topic.topic_url,
        username: topic.username,
        replies: topic.replies,
        ingested_at: topic.ingested_at,
    }
}
