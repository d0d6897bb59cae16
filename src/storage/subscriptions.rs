use sqlx::{QueryBuilder, SqliteConnection};

use super::schema::Database;
use super::transaction::SyncTransaction;
use super::types::{Category, DatabaseError, FeedSubscription, User, UserArticle};

/// Articles given per-user state when a subscription is created.
pub const INITIAL_USER_ARTICLES: i64 = 10;

/// Add `delta` to the unread counter of `user_id`'s subscription to `feed_id`,
/// clamping at zero. No-op when the user is not subscribed.
pub(crate) async fn adjust_unread(
    conn: &mut SqliteConnection,
    user_id: i64,
    feed_id: i64,
    delta: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE feed_subscriptions SET unread_count = MAX(0, unread_count + ?) WHERE user_id = ? AND feed_id = ?",
    )
    .bind(delta)
    .bind(user_id)
    .bind(feed_id)
    .execute(conn)
    .await?;
    Ok(())
}

async fn article_feed_id(conn: &mut SqliteConnection, article_id: i64) -> Result<i64, DatabaseError> {
    let row: Option<(i64,)> = sqlx::query_as("SELECT feed_id FROM articles WHERE id = ?")
        .bind(article_id)
        .fetch_optional(conn)
        .await?;
    row.map(|(id,)| id).ok_or(DatabaseError::NotFound {
        entity: "article",
        id: article_id,
    })
}

async fn select_user_article(
    conn: &mut SqliteConnection,
    user_id: i64,
    article_id: i64,
) -> Result<Option<UserArticle>, sqlx::Error> {
    sqlx::query_as("SELECT * FROM user_articles WHERE user_id = ? AND article_id = ?")
        .bind(user_id)
        .bind(article_id)
        .fetch_optional(conn)
        .await
}

async fn insert_user_article(
    conn: &mut SqliteConnection,
    user_id: i64,
    article_id: i64,
    read_at: Option<i64>,
    starred_at: Option<i64>,
    now: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO user_articles (user_id, article_id, read_at, starred_at, created_at) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(user_id)
    .bind(article_id)
    .bind(read_at)
    .bind(starred_at)
    .bind(now)
    .execute(conn)
    .await?;
    Ok(())
}

impl Database {
    // ========================================================================
    // Users and Categories
    // ========================================================================

    pub async fn create_user(&self, username: &str) -> Result<User, DatabaseError> {
        let now = chrono::Utc::now().timestamp();
        let user = sqlx::query_as(
            "INSERT INTO users (username, created_at) VALUES (?, ?) RETURNING *",
        )
        .bind(username)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(user)
    }

    pub async fn find_user_by_name(&self, username: &str) -> Result<Option<User>, DatabaseError> {
        let user = sqlx::query_as("SELECT * FROM users WHERE username = ?")
            .bind(username)
            .fetch_optional(&self.pool)
            .await?;
        Ok(user)
    }

    pub async fn find_or_create_user(&self, username: &str) -> Result<User, DatabaseError> {
        match self.find_user_by_name(username).await? {
            Some(user) => Ok(user),
            None => self.create_user(username).await,
        }
    }

    /// Mark a user deleted. Their subscriptions stop counting as active.
    pub async fn deactivate_user(&self, user_id: i64) -> Result<(), DatabaseError> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query("UPDATE users SET deleted_at = ? WHERE id = ? AND deleted_at IS NULL")
            .bind(now)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn find_or_create_category(
        &self,
        user_id: i64,
        name: &str,
    ) -> Result<Category, DatabaseError> {
        sqlx::query("INSERT INTO categories (user_id, name) VALUES (?, ?) ON CONFLICT(user_id, name) DO NOTHING")
            .bind(user_id)
            .bind(name)
            .execute(&self.pool)
            .await?;
        let category = sqlx::query_as("SELECT * FROM categories WHERE user_id = ? AND name = ?")
            .bind(user_id)
            .bind(name)
            .fetch_one(&self.pool)
            .await?;
        Ok(category)
    }

    // ========================================================================
    // Subscriptions
    // ========================================================================

    /// Subscribe a user to a feed and seed their article state.
    ///
    /// The [`INITIAL_USER_ARTICLES`] most recent articles of the feed get a
    /// `user_articles` row, and the counter is set to the number of unread
    /// rows the user has for the feed. Subscribing twice returns the existing
    /// subscription.
    pub async fn create_subscription(
        &self,
        user_id: i64,
        feed_id: i64,
        category_id: Option<i64>,
    ) -> Result<FeedSubscription, DatabaseError> {
        let now = chrono::Utc::now().timestamp();
        let _writes = self.lock_writes().await;
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
                INSERT INTO feed_subscriptions (user_id, feed_id, category_id, display_order, created_at)
                VALUES (?, ?, ?,
                    (SELECT COALESCE(MAX(display_order), -1) + 1 FROM feed_subscriptions WHERE user_id = ?),
                    ?)
                ON CONFLICT(user_id, feed_id) DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(feed_id)
        .bind(category_id)
        .bind(user_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
                INSERT OR IGNORE INTO user_articles (user_id, article_id, created_at)
                SELECT ?, id, ? FROM articles
                WHERE feed_id = ?
                ORDER BY published_at DESC, id DESC
                LIMIT ?
            "#,
        )
        .bind(user_id)
        .bind(now)
        .bind(feed_id)
        .bind(INITIAL_USER_ARTICLES)
        .execute(&mut *tx)
        .await?;

        let subscription = sqlx::query_as(
            r#"
                UPDATE feed_subscriptions
                SET unread_count = (
                    SELECT COUNT(*) FROM user_articles ua
                    JOIN articles a ON a.id = ua.article_id
                    WHERE ua.user_id = ? AND a.feed_id = ? AND ua.read_at IS NULL
                )
                WHERE user_id = ? AND feed_id = ?
                RETURNING *
            "#,
        )
        .bind(user_id)
        .bind(feed_id)
        .bind(user_id)
        .bind(feed_id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(subscription)
    }

    pub async fn get_subscription(
        &self,
        user_id: i64,
        feed_id: i64,
    ) -> Result<Option<FeedSubscription>, DatabaseError> {
        let subscription =
            sqlx::query_as("SELECT * FROM feed_subscriptions WHERE user_id = ? AND feed_id = ?")
                .bind(user_id)
                .bind(feed_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(subscription)
    }

    // ========================================================================
    // Per-user Article State
    // ========================================================================

    pub async fn get_user_article(
        &self,
        user_id: i64,
        article_id: i64,
    ) -> Result<Option<UserArticle>, DatabaseError> {
        let mut conn = self.pool.acquire().await?;
        Ok(select_user_article(&mut conn, user_id, article_id).await?)
    }

    /// Unread `user_articles` rows of a user for a feed.
    ///
    /// This is the value the subscription's cached counter must equal.
    pub async fn count_unread(&self, user_id: i64, feed_id: i64) -> Result<i64, DatabaseError> {
        let (count,): (i64,) = sqlx::query_as(
            r#"
                SELECT COUNT(*) FROM user_articles ua
                JOIN articles a ON a.id = ua.article_id
                WHERE ua.user_id = ? AND a.feed_id = ? AND ua.read_at IS NULL
            "#,
        )
        .bind(user_id)
        .bind(feed_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Mark an article read, creating the user's row on first access.
    ///
    /// Returns `false` if it was already read.
    pub async fn mark_article_read(&self, user_id: i64, article_id: i64) -> Result<bool, DatabaseError> {
        let now = chrono::Utc::now().timestamp();
        let _writes = self.lock_writes().await;
        let mut tx = self.pool.begin().await?;
        let feed_id = article_feed_id(&mut tx, article_id).await?;

        let changed = match select_user_article(&mut tx, user_id, article_id).await? {
            None => {
                insert_user_article(&mut tx, user_id, article_id, Some(now), None, now).await?;
                true
            }
            Some(ua) if ua.read_at.is_none() => {
                sqlx::query("UPDATE user_articles SET read_at = ? WHERE id = ?")
                    .bind(now)
                    .bind(ua.id)
                    .execute(&mut *tx)
                    .await?;
                adjust_unread(&mut tx, user_id, feed_id, -1).await?;
                true
            }
            Some(_) => false,
        };

        tx.commit().await?;
        Ok(changed)
    }

    /// Mark an article unread, creating the user's row on first access.
    ///
    /// Returns `false` if it was already unread.
    pub async fn mark_article_unread(&self, user_id: i64, article_id: i64) -> Result<bool, DatabaseError> {
        let now = chrono::Utc::now().timestamp();
        let _writes = self.lock_writes().await;
        let mut tx = self.pool.begin().await?;
        let feed_id = article_feed_id(&mut tx, article_id).await?;

        let changed = match select_user_article(&mut tx, user_id, article_id).await? {
            None => {
                insert_user_article(&mut tx, user_id, article_id, None, None, now).await?;
                adjust_unread(&mut tx, user_id, feed_id, 1).await?;
                true
            }
            Some(ua) if ua.read_at.is_some() => {
                sqlx::query("UPDATE user_articles SET read_at = NULL WHERE id = ?")
                    .bind(ua.id)
                    .execute(&mut *tx)
                    .await?;
                adjust_unread(&mut tx, user_id, feed_id, 1).await?;
                true
            }
            Some(_) => false,
        };

        tx.commit().await?;
        Ok(changed)
    }

    /// Star or unstar an article. A row created here starts unread.
    pub async fn set_article_starred(
        &self,
        user_id: i64,
        article_id: i64,
        starred: bool,
    ) -> Result<(), DatabaseError> {
        let now = chrono::Utc::now().timestamp();
        let starred_at = starred.then_some(now);
        let _writes = self.lock_writes().await;
        let mut tx = self.pool.begin().await?;
        let feed_id = article_feed_id(&mut tx, article_id).await?;

        match select_user_article(&mut tx, user_id, article_id).await? {
            None => {
                insert_user_article(&mut tx, user_id, article_id, None, starred_at, now).await?;
                adjust_unread(&mut tx, user_id, feed_id, 1).await?;
            }
            Some(ua) => {
                sqlx::query("UPDATE user_articles SET starred_at = ? WHERE id = ?")
                    .bind(starred_at)
                    .bind(ua.id)
                    .execute(&mut *tx)
                    .await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }
}

impl SyncTransaction {
    // ========================================================================
    // Fan-out to Subscribers
    // ========================================================================

    /// Subscriptions to `feed_id` owned by active users.
    pub async fn active_subscriptions(
        &mut self,
        feed_id: i64,
    ) -> Result<Vec<FeedSubscription>, DatabaseError> {
        let subscriptions = sqlx::query_as(
            r#"
                SELECT s.* FROM feed_subscriptions s
                JOIN users u ON u.id = s.user_id
                WHERE s.feed_id = ? AND u.deleted_at IS NULL
                ORDER BY s.id
            "#,
        )
        .bind(feed_id)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(subscriptions)
    }

    /// Create one unread `user_articles` row per user for a new article.
    pub async fn create_user_articles(
        &mut self,
        article_id: i64,
        user_ids: &[i64],
        now: i64,
    ) -> Result<(), DatabaseError> {
        if user_ids.is_empty() {
            return Ok(());
        }

        let mut builder: QueryBuilder<sqlx::Sqlite> =
            QueryBuilder::new("INSERT INTO user_articles (user_id, article_id, created_at) ");
        builder.push_values(user_ids, |mut b, user_id| {
            b.push_bind(*user_id).push_bind(article_id).push_bind(now);
        });
        builder.push(" ON CONFLICT(user_id, article_id) DO NOTHING");
        builder.build().execute(&mut *self.tx).await?;
        Ok(())
    }

    /// Add `delta` to a subscription's unread counter, never going below zero.
    pub async fn add_unread(&mut self, subscription_id: i64, delta: i64) -> Result<(), DatabaseError> {
        sqlx::query("UPDATE feed_subscriptions SET unread_count = MAX(0, unread_count + ?) WHERE id = ?")
            .bind(delta)
            .bind(subscription_id)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{ArticleFields, FeedMetadata};
    use pretty_assertions::assert_eq;

    async fn setup_feed(db: &Database, articles: usize) -> (i64, Vec<i64>) {
        let mut tx = db.begin_sync().await.unwrap();
        let feed = tx
            .insert_feed(
                &FeedMetadata {
                    rss_url: "https://example.com/feed.xml".to_string(),
                    url: None,
                    base_uri: None,
                    title: "Example".to_string(),
                    description: None,
                    language: None,
                },
                0,
            )
            .await
            .unwrap();
        let mut ids = Vec::new();
        for i in 0..articles {
            let article = tx
                .insert_article(
                    feed.id,
                    &ArticleFields {
                        guid: format!("guid-{i}"),
                        url: None,
                        title: format!("Article {i}"),
                        creator: None,
                        description: None,
                        comment_url: None,
                        comment_count: None,
                        enclosure_url: None,
                        enclosure_length: None,
                        enclosure_type: None,
                        published_at: i as i64 * 60,
                    },
                    0,
                )
                .await
                .unwrap();
            ids.push(article.id);
        }
        tx.commit().await.unwrap();
        (feed.id, ids)
    }

    async fn assert_counter_consistent(db: &Database, user_id: i64, feed_id: i64) {
        let sub = db.get_subscription(user_id, feed_id).await.unwrap().unwrap();
        assert_eq!(sub.unread_count, db.count_unread(user_id, feed_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_find_or_create_user_is_stable() {
        let db = Database::open(":memory:").await.unwrap();
        let first = db.find_or_create_user("alice").await.unwrap();
        let second = db.find_or_create_user("alice").await.unwrap();
        assert_eq!(first, second);
        assert!(db.create_user("alice").await.is_err());
    }

    #[tokio::test]
    async fn test_find_or_create_category() {
        let db = Database::open(":memory:").await.unwrap();
        let user = db.create_user("alice").await.unwrap();
        let a = db.find_or_create_category(user.id, "News").await.unwrap();
        let b = db.find_or_create_category(user.id, "News").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.name, "News");
    }

    #[tokio::test]
    async fn test_subscription_seeds_recent_articles() {
        let db = Database::open(":memory:").await.unwrap();
        let (feed_id, ids) = setup_feed(&db, 15).await;
        let user = db.create_user("alice").await.unwrap();

        let sub = db.create_subscription(user.id, feed_id, None).await.unwrap();
        assert_eq!(sub.unread_count, INITIAL_USER_ARTICLES);

        // Newest articles are seeded, oldest are not
        assert!(db.get_user_article(user.id, ids[14]).await.unwrap().is_some());
        assert!(db.get_user_article(user.id, ids[0]).await.unwrap().is_none());
        assert_counter_consistent(&db, user.id, feed_id).await;
    }

    #[tokio::test]
    async fn test_subscribing_twice_keeps_subscription() {
        let db = Database::open(":memory:").await.unwrap();
        let (feed_id, _) = setup_feed(&db, 3).await;
        let user = db.create_user("alice").await.unwrap();

        let first = db.create_subscription(user.id, feed_id, None).await.unwrap();
        let second = db.create_subscription(user.id, feed_id, None).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.unread_count, 3);
    }

    #[tokio::test]
    async fn test_display_order_increments() {
        let db = Database::open(":memory:").await.unwrap();
        let user = db.create_user("alice").await.unwrap();
        let mut tx = db.begin_sync().await.unwrap();
        let mut feed_ids = Vec::new();
        for n in 0..2 {
            let feed = tx
                .insert_feed(
                    &FeedMetadata {
                        rss_url: format!("https://example.com/{n}.xml"),
                        url: None,
                        base_uri: None,
                        title: format!("Feed {n}"),
                        description: None,
                        language: None,
                    },
                    0,
                )
                .await
                .unwrap();
            feed_ids.push(feed.id);
        }
        tx.commit().await.unwrap();

        let a = db.create_subscription(user.id, feed_ids[0], None).await.unwrap();
        let b = db.create_subscription(user.id, feed_ids[1], None).await.unwrap();
        assert_eq!(a.display_order, 0);
        assert_eq!(b.display_order, 1);
    }

    #[tokio::test]
    async fn test_read_unread_keep_counter_consistent() {
        let db = Database::open(":memory:").await.unwrap();
        let (feed_id, ids) = setup_feed(&db, 12).await;
        let user = db.create_user("alice").await.unwrap();
        db.create_subscription(user.id, feed_id, None).await.unwrap();

        // Seeded row
        assert!(db.mark_article_read(user.id, ids[11]).await.unwrap());
        assert!(!db.mark_article_read(user.id, ids[11]).await.unwrap());
        assert_counter_consistent(&db, user.id, feed_id).await;

        // Lazily created row, read on first access
        assert!(db.mark_article_read(user.id, ids[0]).await.unwrap());
        assert_counter_consistent(&db, user.id, feed_id).await;

        // Lazily created row, unread on first access
        assert!(db.mark_article_unread(user.id, ids[1]).await.unwrap());
        assert!(!db.mark_article_unread(user.id, ids[1]).await.unwrap());
        assert_counter_consistent(&db, user.id, feed_id).await;

        assert!(db.mark_article_unread(user.id, ids[11]).await.unwrap());
        let sub = db.get_subscription(user.id, feed_id).await.unwrap().unwrap();
        assert_eq!(sub.unread_count, 11);
        assert_counter_consistent(&db, user.id, feed_id).await;
    }

    #[tokio::test]
    async fn test_star_creates_unread_row() {
        let db = Database::open(":memory:").await.unwrap();
        let (feed_id, ids) = setup_feed(&db, 12).await;
        let user = db.create_user("alice").await.unwrap();
        db.create_subscription(user.id, feed_id, None).await.unwrap();

        db.set_article_starred(user.id, ids[0], true).await.unwrap();
        let ua = db.get_user_article(user.id, ids[0]).await.unwrap().unwrap();
        assert!(ua.starred_at.is_some());
        assert!(ua.read_at.is_none());
        assert_counter_consistent(&db, user.id, feed_id).await;

        db.set_article_starred(user.id, ids[0], false).await.unwrap();
        let ua = db.get_user_article(user.id, ids[0]).await.unwrap().unwrap();
        assert!(ua.starred_at.is_none());
    }

    #[tokio::test]
    async fn test_unknown_article_is_not_found() {
        let db = Database::open(":memory:").await.unwrap();
        let user = db.create_user("alice").await.unwrap();
        let err = db.mark_article_read(user.id, 999).await.unwrap_err();
        assert!(matches!(err, DatabaseError::NotFound { entity: "article", id: 999 }));
    }

    #[tokio::test]
    async fn test_counter_never_negative() {
        let db = Database::open(":memory:").await.unwrap();
        let (feed_id, _) = setup_feed(&db, 0).await;
        let user = db.create_user("alice").await.unwrap();
        let sub = db.create_subscription(user.id, feed_id, None).await.unwrap();

        let mut tx = db.begin_sync().await.unwrap();
        tx.add_unread(sub.id, -5).await.unwrap();
        tx.commit().await.unwrap();

        let sub = db.get_subscription(user.id, feed_id).await.unwrap().unwrap();
        assert_eq!(sub.unread_count, 0);
    }

    #[tokio::test]
    async fn test_active_subscriptions_skip_deleted_users() {
        let db = Database::open(":memory:").await.unwrap();
        let (feed_id, _) = setup_feed(&db, 0).await;
        let alice = db.create_user("alice").await.unwrap();
        let bob = db.create_user("bob").await.unwrap();
        db.create_subscription(alice.id, feed_id, None).await.unwrap();
        db.create_subscription(bob.id, feed_id, None).await.unwrap();
        db.deactivate_user(bob.id).await.unwrap();

        let mut tx = db.begin_sync().await.unwrap();
        let subs = tx.active_subscriptions(feed_id).await.unwrap();
        let users: Vec<i64> = subs.iter().map(|s| s.user_id).collect();
        assert_eq!(users, vec![alice.id]);
    }
}
