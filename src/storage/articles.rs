use sqlx::QueryBuilder;

use super::schema::Database;
use super::subscriptions::adjust_unread;
use super::transaction::SyncTransaction;
use super::types::{Article, ArticleFields, DatabaseError};

/// Keeps `IN (...)` lists well under SQLite's bound parameter limit.
const IN_CHUNK: usize = 500;

/// Maximum number of articles returned by a listing query (OOM protection)
const MAX_ARTICLES: i64 = 2000;

impl Database {
    // ========================================================================
    // Article Queries
    // ========================================================================

    /// Articles of a feed, newest first.
    pub async fn get_articles_for_feed(&self, feed_id: i64) -> Result<Vec<Article>, DatabaseError> {
        let articles = sqlx::query_as(
            "SELECT * FROM articles WHERE feed_id = ? ORDER BY published_at DESC, id DESC LIMIT ?",
        )
        .bind(feed_id)
        .bind(MAX_ARTICLES)
        .fetch_all(&self.pool)
        .await?;
        Ok(articles)
    }

    pub async fn find_article_by_guid(
        &self,
        feed_id: i64,
        guid: &str,
    ) -> Result<Option<Article>, DatabaseError> {
        let article = sqlx::query_as("SELECT * FROM articles WHERE feed_id = ? AND guid = ?")
            .bind(feed_id)
            .bind(guid)
            .fetch_optional(&self.pool)
            .await?;
        Ok(article)
    }

    /// Articles of a feed published at or after `since` (unix seconds).
    pub async fn articles_published_since(
        &self,
        feed_id: i64,
        since: i64,
    ) -> Result<Vec<Article>, DatabaseError> {
        let articles = sqlx::query_as(
            "SELECT * FROM articles WHERE feed_id = ? AND published_at >= ? ORDER BY published_at DESC",
        )
        .bind(feed_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        Ok(articles)
    }
}

impl SyncTransaction {
    // ========================================================================
    // Article Writes
    // ========================================================================

    /// Persisted articles of `feed_id` whose GUID is in `guids`.
    pub async fn articles_by_guids(
        &mut self,
        feed_id: i64,
        guids: &[&str],
    ) -> Result<Vec<Article>, DatabaseError> {
        let mut found = Vec::new();
        for chunk in guids.chunks(IN_CHUNK) {
            let mut builder: QueryBuilder<sqlx::Sqlite> =
                QueryBuilder::new("SELECT * FROM articles WHERE feed_id = ");
            builder.push_bind(feed_id);
            builder.push(" AND guid IN (");
            let mut separated = builder.separated(", ");
            for guid in chunk {
                separated.push_bind(*guid);
            }
            separated.push_unseparated(")");

            let rows: Vec<Article> = builder
                .build_query_as()
                .fetch_all(&mut *self.tx)
                .await?;
            found.extend(rows);
        }
        Ok(found)
    }

    pub async fn insert_article(
        &mut self,
        feed_id: i64,
        fields: &ArticleFields,
        now: i64,
    ) -> Result<Article, DatabaseError> {
        let article = sqlx::query_as(
            r#"
                INSERT INTO articles (
                    feed_id, guid, url, title, creator, description, comment_url, comment_count,
                    enclosure_url, enclosure_length, enclosure_type, published_at, created_at
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                RETURNING *
            "#,
        )
        .bind(feed_id)
        .bind(&fields.guid)
        .bind(&fields.url)
        .bind(&fields.title)
        .bind(&fields.creator)
        .bind(&fields.description)
        .bind(&fields.comment_url)
        .bind(fields.comment_count)
        .bind(&fields.enclosure_url)
        .bind(fields.enclosure_length)
        .bind(&fields.enclosure_type)
        .bind(fields.published_at)
        .bind(now)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(article)
    }

    /// Rewrite the content columns of an article. GUID, publication and
    /// creation dates are kept.
    pub async fn update_article(
        &mut self,
        article_id: i64,
        fields: &ArticleFields,
    ) -> Result<Article, DatabaseError> {
        let article = sqlx::query_as(
            r#"
                UPDATE articles
                SET url = ?, title = ?, creator = ?, description = ?, comment_url = ?,
                    comment_count = ?, enclosure_url = ?, enclosure_length = ?, enclosure_type = ?
                WHERE id = ?
                RETURNING *
            "#,
        )
        .bind(&fields.url)
        .bind(&fields.title)
        .bind(&fields.creator)
        .bind(&fields.description)
        .bind(&fields.comment_url)
        .bind(fields.comment_count)
        .bind(&fields.enclosure_url)
        .bind(fields.enclosure_length)
        .bind(&fields.enclosure_type)
        .bind(article_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        article.ok_or(DatabaseError::NotFound {
            entity: "article",
            id: article_id,
        })
    }

    /// Delete articles and their per-user state.
    ///
    /// Each unread `user_articles` row of a deleted article decrements the
    /// owning user's subscription counter for the article's feed.
    /// Returns the number of articles deleted.
    pub async fn remove_articles(&mut self, articles: &[Article]) -> Result<u64, DatabaseError> {
        let mut deleted = 0;
        for chunk in articles.chunks(IN_CHUNK) {
            let mut builder: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new(
                "SELECT ua.user_id, a.feed_id, COUNT(*) FROM user_articles ua \
                 JOIN articles a ON a.id = ua.article_id \
                 WHERE ua.read_at IS NULL AND ua.article_id IN (",
            );
            push_ids(&mut builder, chunk);
            builder.push(" GROUP BY ua.user_id, a.feed_id");

            let unread: Vec<(i64, i64, i64)> =
                builder.build_query_as().fetch_all(&mut *self.tx).await?;
            for (user_id, feed_id, count) in unread {
                adjust_unread(&mut self.tx, user_id, feed_id, -count).await?;
            }

            let mut builder: QueryBuilder<sqlx::Sqlite> =
                QueryBuilder::new("DELETE FROM user_articles WHERE article_id IN (");
            push_ids(&mut builder, chunk);
            builder.build().execute(&mut *self.tx).await?;

            let mut builder: QueryBuilder<sqlx::Sqlite> =
                QueryBuilder::new("DELETE FROM articles WHERE id IN (");
            push_ids(&mut builder, chunk);
            deleted += builder.build().execute(&mut *self.tx).await?.rows_affected();
        }
        Ok(deleted)
    }
}

fn push_ids(builder: &mut QueryBuilder<'_, sqlx::Sqlite>, articles: &[Article]) {
    let mut separated = builder.separated(", ");
    for article in articles {
        separated.push_bind(article.id);
    }
    separated.push_unseparated(")");
}
