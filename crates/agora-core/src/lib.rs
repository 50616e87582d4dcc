//! Core domain model for Agora: site keys, topic drafts, persisted topics and feed views.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod time;

pub const CRATE_NAME: &str = "agora-core";

/// The fixed set of forums Agora knows how to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SiteKey {
    #[serde(rename = "onche")]
    Onche,
    #[serde(rename = "avenoel")]
    Avenoel,
    #[serde(rename = "village")]
    Village,
    #[serde(rename = "jeuxvideo")]
    Jeuxvideo,
    #[serde(rename = "2sucres")]
    DeuxSucres,
}

impl SiteKey {
    pub const ALL: [SiteKey; 5] = [
        SiteKey::Onche,
        SiteKey::Avenoel,
        SiteKey::Village,
        SiteKey::Jeuxvideo,
        SiteKey::DeuxSucres,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SiteKey::Onche => "onche",
            SiteKey::Avenoel => "avenoel",
            SiteKey::Village => "village",
            SiteKey::Jeuxvideo => "jeuxvideo",
            SiteKey::DeuxSucres => "2sucres",
        }
    }
}

impl fmt::Display for SiteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown site key `{0}`")]
pub struct UnknownSiteKey(pub String);

impl FromStr for SiteKey {
    type Err = UnknownSiteKey;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SiteKey::ALL
            .into_iter()
            .find(|key| key.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UnknownSiteKey(s.to_string()))
    }
}

/// Parsed handoff contract from adapters into the merge step.
///
/// `last_activity` is already canonical (epoch seconds, or [`time::INVALID_EPOCH`]).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicDraft {
    pub title: String,
    pub topic_url: String,
    pub username: Option<String>,
    pub replies: u32,
    pub last_activity: i64,
}

/// Insert payload for a topic URL the store has never seen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTopic {
    pub site_key: SiteKey,
    pub title: String,
    pub topic_url: String,
    pub username: Option<String>,
    pub replies: u32,
    pub last_activity: i64,
    pub ingested_at: DateTime<Utc>,
}

impl NewTopic {
    pub fn from_draft(site_key: SiteKey, draft: TopicDraft, ingested_at: DateTime<Utc>) -> Self {
        Self {
            site_key,
            title: draft.title,
            topic_url: draft.topic_url,
            username: draft.username,
            replies: draft.replies,
            last_activity: draft.last_activity,
            ingested_at,
        }
    }
}

/// Canonical persisted topic. `site_key` never changes after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedTopic {
    pub id: i64,
    pub site_key: SiteKey,
    pub title: String,
    pub topic_url: String,
    pub username: Option<String>,
    pub replies: u32,
    pub last_activity: i64,
    pub ingested_at: DateTime<Utc>,
}

impl PersistedTopic {
    /// Overwrite the mutable fields from a fresh draft, keeping identity and `site_key`.
    pub fn absorb(&mut self, draft: TopicDraft, ingested_at: DateTime<Utc>) {
        self.title = draft.title;
        self.username = draft.username;
        self.replies = draft.replies;
        self.last_activity = draft.last_activity;
        self.ingested_at = ingested_at;
    }
}

/// Feed row handed to the presentation layer; `last_activity` is rendered at request time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicView {
    pub site_key: SiteKey,
    pub title: String,
    pub topic_url: String,
    pub username: Option<String>,
    pub replies: u32,
    pub last_activity: String,
    pub ingested_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn draft(title: &str, replies: u32) -> TopicDraft {
        TopicDraft {
            title: title.to_string(),
            topic_url: "https://onche.org/topic/1/x".to_string(),
            username: Some("alice".to_string()),
            replies,
            last_activity: 1_700_000_000,
        }
    }

    #[test]
    fn site_keys_round_trip_through_strings_and_serde() {
        for key in SiteKey::ALL {
            assert_eq!(key.as_str().parse::<SiteKey>().unwrap(), key);
            let json = serde_json::to_string(&key).unwrap();
            assert_eq!(json, format!("\"{}\"", key.as_str()));
        }
        assert_eq!("2SUCRES".parse::<SiteKey>().unwrap(), SiteKey::DeuxSucres);
        assert!("reddit".parse::<SiteKey>().is_err());
    }

    #[test]
    fn absorb_keeps_identity_and_site_key() {
        let t0 = Utc.with_ymd_and_hms(2025, 4, 17, 12, 0, 0).unwrap();
        let t1 = Utc.with_ymd_and_hms(2025, 4, 17, 12, 1, 0).unwrap();
        let created = NewTopic::from_draft(SiteKey::Onche, draft("first", 3), t0);
        let mut stored = PersistedTopic {
            id: 9,
            site_key: created.site_key,
            title: created.title,
            topic_url: created.topic_url,
            username: created.username,
            replies: created.replies,
            last_activity: created.last_activity,
            ingested_at: created.ingested_at,
        };

        stored.absorb(draft("renamed", 7), t1);

        assert_eq!(stored.id, 9);
        assert_eq!(stored.site_key, SiteKey::Onche);
        assert_eq!(stored.title, "renamed");
        assert_eq!(stored.replies, 7);
        assert_eq!(stored.ingested_at, t1);
    }
}
