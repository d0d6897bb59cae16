use sqlx::SqliteConnection;

use super::schema::Database;
use super::transaction::SyncTransaction;
use super::types::{DatabaseError, Feed, FeedMetadata};

async fn select_by_rss_url(
    conn: &mut SqliteConnection,
    rss_url: &str,
) -> Result<Option<Feed>, sqlx::Error> {
    sqlx::query_as("SELECT * FROM feeds WHERE rss_url = ?")
        .bind(rss_url)
        .fetch_optional(conn)
        .await
}

impl Database {
    // ========================================================================
    // Feed Queries
    // ========================================================================

    pub async fn find_feed_by_rss_url(&self, rss_url: &str) -> Result<Option<Feed>, DatabaseError> {
        let mut conn = self.pool.acquire().await?;
        Ok(select_by_rss_url(&mut conn, rss_url).await?)
    }

    pub async fn get_feed(&self, feed_id: i64) -> Result<Option<Feed>, DatabaseError> {
        let feed = sqlx::query_as("SELECT * FROM feeds WHERE id = ?")
            .bind(feed_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(feed)
    }

    /// Feeds with at least one subscription owned by an active user.
    ///
    /// These are the feeds visited by every synchronization pass.
    pub async fn feeds_with_active_subscriptions(&self) -> Result<Vec<Feed>, DatabaseError> {
        let feeds = sqlx::query_as(
            r#"
                SELECT f.* FROM feeds f
                WHERE EXISTS (
                    SELECT 1 FROM feed_subscriptions s
                    JOIN users u ON u.id = s.user_id
                    WHERE s.feed_id = f.id AND u.deleted_at IS NULL
                )
                ORDER BY f.id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(feeds)
    }
}

impl SyncTransaction {
    // ========================================================================
    // Feed Writes
    // ========================================================================

    pub async fn find_feed_by_rss_url(&mut self, rss_url: &str) -> Result<Option<Feed>, DatabaseError> {
        Ok(select_by_rss_url(&mut self.tx, rss_url).await?)
    }

    /// Insert a feed seen for the first time. `now` is both its creation and
    /// first fetch time.
    pub async fn insert_feed(&mut self, meta: &FeedMetadata, now: i64) -> Result<Feed, DatabaseError> {
        let feed = sqlx::query_as(
            r#"
                INSERT INTO feeds (rss_url, url, base_uri, title, description, language, created_at, last_fetched_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                RETURNING *
            "#,
        )
        .bind(&meta.rss_url)
        .bind(&meta.url)
        .bind(&meta.base_uri)
        .bind(&meta.title)
        .bind(&meta.description)
        .bind(&meta.language)
        .bind(now)
        .bind(now)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(feed)
    }

    /// Overwrite the metadata of an existing feed and stamp the fetch time.
    /// `rss_url` is the lookup key and is never rewritten.
    pub async fn update_feed(
        &mut self,
        feed_id: i64,
        meta: &FeedMetadata,
        now: i64,
    ) -> Result<Feed, DatabaseError> {
        let feed = sqlx::query_as(
            r#"
                UPDATE feeds
                SET url = ?, base_uri = ?, title = ?, description = ?, language = ?, last_fetched_at = ?
                WHERE id = ?
                RETURNING *
            "#,
        )
        .bind(&meta.url)
        .bind(&meta.base_uri)
        .bind(&meta.title)
        .bind(&meta.description)
        .bind(&meta.language)
        .bind(now)
        .bind(feed_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        feed.ok_or(DatabaseError::NotFound {
            entity: "feed",
            id: feed_id,
        })
    }
}
