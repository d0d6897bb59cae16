use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    SqlitePool,
};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::types::DatabaseError;

// ============================================================================
// Database
// ============================================================================

#[derive(Clone)]
pub struct Database {
    pub(crate) pool: SqlitePool,
    /// Serializes write transactions. Two deferred transactions that both
    /// read before writing can otherwise deadlock on the lock upgrade.
    write_lock: Arc<Mutex<()>>,
}

impl Database {
    /// Open a database connection and run migrations.
    ///
    /// `":memory:"` opens a private in-memory database shared by every
    /// connection of the pool (used by tests).
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError::Locked` if another process holds the database
    /// lock, `DatabaseError::Migration` if the schema could not be created.
    pub async fn open(path: &str) -> Result<Self, DatabaseError> {
        let url = format!("sqlite:{}?mode=rwc", path);

        // busy_timeout: wait up to 5s on writer contention instead of failing
        // immediately with SQLITE_BUSY.
        let options = SqliteConnectOptions::from_str(&url)
            .map_err(DatabaseError::from_sqlx)?
            .foreign_keys(true)
            .pragma("busy_timeout", "5000");
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await
            .map_err(DatabaseError::from_sqlx)?;

        let db = Self {
            pool,
            write_lock: Arc::new(Mutex::new(())),
        };
        db.migrate().await.map_err(|e| match DatabaseError::from_sqlx(e) {
            DatabaseError::Other(e) => DatabaseError::Migration(e.to_string()),
            locked => locked,
        })?;
        Ok(db)
    }

    /// Wait for exclusive use of the write side. Hold the guard until the
    /// transaction commits or rolls back.
    pub(crate) async fn lock_writes(&self) -> OwnedMutexGuard<()> {
        self.write_lock.clone().lock_owned().await
    }

    /// Create every table and index in a single transaction.
    ///
    /// All statements use `IF NOT EXISTS`, so re-running on an existing
    /// database is a no-op.
    async fn migrate(&self) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY,
                username TEXT UNIQUE NOT NULL,
                created_at INTEGER NOT NULL,
                deleted_at INTEGER
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS categories (
                id INTEGER PRIMARY KEY,
                user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                name TEXT NOT NULL,
                UNIQUE(user_id, name)
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS feeds (
                id INTEGER PRIMARY KEY,
                rss_url TEXT UNIQUE NOT NULL,
                url TEXT,
                base_uri TEXT,
                title TEXT NOT NULL,
                description TEXT,
                language TEXT,
                created_at INTEGER NOT NULL,
                last_fetched_at INTEGER
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS articles (
                id INTEGER PRIMARY KEY,
                feed_id INTEGER NOT NULL REFERENCES feeds(id) ON DELETE CASCADE,
                guid TEXT NOT NULL,
                url TEXT,
                title TEXT NOT NULL,
                creator TEXT,
                description TEXT,
                comment_url TEXT,
                comment_count INTEGER,
                enclosure_url TEXT,
                enclosure_length INTEGER,
                enclosure_type TEXT,
                published_at INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                UNIQUE(feed_id, guid)
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        // Removal detection filters by feed and publication time
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_articles_feed_published ON articles(feed_id, published_at DESC)",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS feed_subscriptions (
                id INTEGER PRIMARY KEY,
                user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                feed_id INTEGER NOT NULL REFERENCES feeds(id) ON DELETE CASCADE,
                category_id INTEGER REFERENCES categories(id) ON DELETE SET NULL,
                title TEXT,
                display_order INTEGER NOT NULL DEFAULT 0,
                unread_count INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                UNIQUE(user_id, feed_id)
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_subscriptions_feed ON feed_subscriptions(feed_id)",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS user_articles (
                id INTEGER PRIMARY KEY,
                user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                article_id INTEGER NOT NULL REFERENCES articles(id) ON DELETE CASCADE,
                read_at INTEGER,
                starred_at INTEGER,
                created_at INTEGER NOT NULL,
                UNIQUE(user_id, article_id)
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        // Covers the unread lookups done on article removal
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_user_articles_unread ON user_articles(article_id) WHERE read_at IS NULL",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS feed_synchronizations (
                id INTEGER PRIMARY KEY,
                feed_id INTEGER NOT NULL REFERENCES feeds(id) ON DELETE CASCADE,
                success INTEGER NOT NULL,
                message TEXT,
                duration_ms INTEGER NOT NULL,
                created_at INTEGER NOT NULL
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_feed_synchronizations_feed ON feed_synchronizations(feed_id, created_at DESC)",
        )
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(())
    }
}
