use agora_core::{NewTopic, PersistedTopic, SiteKey, TopicDraft};
use agora_storage::{StoreError, TopicStore};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MergeOutcome {
    pub inserted: usize,
    pub updated: usize,
    /// Drafts dropped because the store already held a newer observation.
    pub stale: usize,
}

impl MergeOutcome {
    pub fn total(&self) -> usize {
        self.inserted + self.updated + self.stale
    }
}

/// Upsert one source's drafts keyed by topic URL.
///
/// New URLs are inserted under `site_key`; known URLs get their mutable fields overwritten and
/// keep the site they were first seen on. The first store error stops the batch.
pub async fn merge_batch(
    store: &dyn TopicStore,
    site_key: SiteKey,
    drafts: Vec<TopicDraft>,
    ingested_at: DateTime<Utc>,
) -> Result<MergeOutcome, StoreError> {
    let mut outcome = MergeOutcome::default();

    for draft in drafts {
        if let Some(existing) = store.find_by_url(&draft.topic_url).await? {
            overwrite(store, existing, site_key, draft, ingested_at, &mut outcome).await?;
            continue;
        }

        match store
            .insert(&NewTopic::from_draft(site_key, draft.clone(), ingested_at))
            .await
        {
            Ok(_) => outcome.inserted += 1,
            Err(StoreError::DuplicateUrl(url)) => {
                debug!(%url, "insert lost a race; updating instead");
                let existing = store
                    .find_by_url(&url)
                    .await?
                    .ok_or(StoreError::DuplicateUrl(url))?;
                overwrite(store, existing, site_key, draft, ingested_at, &mut outcome).await?;
            }
            Err(err) => return Err(err),
        }
    }

    Ok(outcome)
}

async fn overwrite(
    store: &dyn TopicStore,
    mut existing: PersistedTopic,
    site_key: SiteKey,
    draft: TopicDraft,
    ingested_at: DateTime<Utc>,
    outcome: &mut MergeOutcome,
) -> Result<(), StoreError> {
    if existing.site_key != site_key {
        debug!(
            url = %existing.topic_url,
            stored = %existing.site_key,
            seen_on = %site_key,
            "topic already owned by another site"
        );
    }
    existing.absorb(draft, ingested_at);
    if store.update(&existing).await? {
        outcome.updated += 1;
    } else {
        outcome.stale += 1;
    }
    Ok(())
}
