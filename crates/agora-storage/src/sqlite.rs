use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use agora_core::{NewTopic, PersistedTopic, SiteKey};
use async_trait::async_trait;
use chrono::DateTime;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow, SqliteSynchronous};
use sqlx::Row;
use tracing::info;

use crate::{StoreError, TopicStore};

const TOPIC_COLUMNS: &str =
    "id, site_key, title, topic_url, username, replies, last_activity, ingested_at_ms";

/// SQLite-backed topic store. WAL mode lets feed reads proceed while a scrape batch writes.
#[derive(Debug, Clone)]
pub struct SqliteTopicStore {
    pool: SqlitePool,
}

impl SqliteTopicStore {
    /// Open (creating if missing) the database at `path` and apply pending migrations.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(10));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;
        info!(path = %path.display(), "topic store ready");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn row_to_topic(row: &SqliteRow) -> Result<PersistedTopic, StoreError> {
    let site_key: String = row.try_get("site_key")?;
    let site_key = site_key
        .parse::<SiteKey>()
        .map_err(|e| StoreError::Corrupt(e.to_string()))?;
    let replies: i64 = row.try_get("replies")?;
    let replies = u32::try_from(replies)
        .map_err(|_| StoreError::Corrupt(format!("replies out of range: {replies}")))?;
    let ingested_at_ms: i64 = row.try_get("ingested_at_ms")?;
    let ingested_at = DateTime::from_timestamp_millis(ingested_at_ms)
        .ok_or_else(|| StoreError::Corrupt(format!("ingested_at out of range: {ingested_at_ms}")))?;

    Ok(PersistedTopic {
        id: row.try_get("id")?,
        site_key,
        title: row.try_get("title")?,
        topic_url: row.try_get("topic_url")?,
        username: row.try_get("username")?,
        replies,
        last_activity: row.try_get("last_activity")?,
        ingested_at,
    })
}

fn rows_to_topics(rows: &[SqliteRow]) -> Result<Vec<PersistedTopic>, StoreError> {
    rows.iter().map(row_to_topic).collect()
}

fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

#[async_trait]
impl TopicStore for SqliteTopicStore {
    async fn find_by_url(&self, topic_url: &str) -> Result<Option<PersistedTopic>, StoreError> {
        let row = sqlx::query(&format!("SELECT {TOPIC_COLUMNS} FROM topics WHERE topic_url = ?"))
            .bind(topic_url)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_topic).transpose()
    }

    async fn insert(&self, topic: &NewTopic) -> Result<PersistedTopic, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO topics (site_key, title, topic_url, username, replies, last_activity, ingested_at_ms)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(topic.site_key.as_str())
        .bind(&topic.title)
        .bind(&topic.topic_url)
        .bind(&topic.username)
        .bind(i64::from(topic.replies))
        .bind(topic.last_activity)
        .bind(topic.ingested_at.timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(|err| match err {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                StoreError::DuplicateUrl(topic.topic_url.clone())
            }
            other => StoreError::Database(other),
        })?;

        Ok(PersistedTopic {
            id: result.last_insert_rowid(),
            site_key: topic.site_key,
            title: topic.title.clone(),
            topic_url: topic.topic_url.clone(),
            username: topic.username.clone(),
            replies: topic.replies,
            last_activity: topic.last_activity,
            ingested_at: topic.ingested_at,
        })
    }

    async fn update(&self, topic: &PersistedTopic) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE topics
               SET title = ?,
                   username = ?,
                   replies = ?,
                   last_activity = ?,
                   ingested_at_ms = ?
             WHERE id = ?
               AND ingested_at_ms <= ?
            "#,
        )
        .bind(&topic.title)
        .bind(&topic.username)
        .bind(i64::from(topic.replies))
        .bind(topic.last_activity)
        .bind(topic.ingested_at.timestamp_millis())
        .bind(topic.id)
        .bind(topic.ingested_at.timestamp_millis())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }

        let exists = sqlx::query("SELECT 1 FROM topics WHERE id = ?")
            .bind(topic.id)
            .fetch_optional(&self.pool)
            .await?
            .is_some();
        if exists {
            Ok(false)
        } else {
            Err(StoreError::NotFound(topic.id))
        }
    }

    async fn top_by_replies(&self, limit: usize) -> Result<Vec<PersistedTopic>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {TOPIC_COLUMNS} FROM topics ORDER BY replies DESC, id ASC LIMIT ?"
        ))
        .bind(sql_limit(limit))
        .fetch_all(&self.pool)
        .await?;
        rows_to_topics(&rows)
    }

    async fn recent_by_site(&self, site_key: SiteKey, limit: usize) -> Result<Vec<PersistedTopic>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {TOPIC_COLUMNS} FROM topics WHERE site_key = ? ORDER BY ingested_at_ms DESC, id ASC LIMIT ?"
        ))
        .bind(site_key.as_str())
        .bind(sql_limit(limit))
        .fetch_all(&self.pool)
        .await?;
        rows_to_topics(&rows)
    }

    async fn distinct_site_keys(&self) -> Result<BTreeSet<SiteKey>, StoreError> {
        let rows = sqlx::query("SELECT DISTINCT site_key FROM topics")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                let key: String = row.try_get("site_key")?;
                key.parse::<SiteKey>()
                    .map_err(|e| StoreError::Corrupt(e.to_string()))
            })
            .collect()
    }

    async fn count(&self) -> Result<usize, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM topics")
            .fetch_one(&self.pool)
            .await?;
        Ok(usize::try_from(count).unwrap_or_default())
    }
}
