use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Database-specific errors
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Another process holds the database lock
    #[error("Database is locked by another process")]
    Locked,

    /// Migration failed
    #[error("Database migration failed: {0}")]
    Migration(String),

    /// A referenced row does not exist
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    /// Generic database error
    #[error("Database error: {0}")]
    Other(#[from] sqlx::Error),
}

impl DatabaseError {
    /// Check if a sqlx error indicates database locking
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        let error_string = err.to_string().to_lowercase();

        // SQLITE_BUSY (5): database is locked
        // SQLITE_LOCKED (6): database table is locked
        // SQLITE_CANTOPEN (14): unable to open database file
        if error_string.contains("database is locked")
            || error_string.contains("database table is locked")
            || error_string.contains("sqlite_busy")
            || error_string.contains("sqlite_locked")
            || error_string.contains("unable to open database file")
        {
            return DatabaseError::Locked;
        }

        DatabaseError::Other(err)
    }
}

// ============================================================================
// Feeds
// ============================================================================

/// A persisted feed, shared by every subscriber.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct Feed {
    pub id: i64,
    /// Source URL the feed was subscribed with; unique.
    pub rss_url: String,
    /// Website URL advertised by the feed.
    pub url: Option<String>,
    /// Base used to resolve relative links in article content.
    pub base_uri: Option<String>,
    pub title: String,
    pub description: Option<String>,
    pub language: Option<String>,
    pub created_at: i64,
    pub last_fetched_at: Option<i64>,
}

/// Feed metadata as written by a synchronization, already length-limited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedMetadata {
    pub rss_url: String,
    pub url: Option<String>,
    pub base_uri: Option<String>,
    pub title: String,
    pub description: Option<String>,
    pub language: Option<String>,
}

// ============================================================================
// Articles
// ============================================================================

/// A persisted article.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct Article {
    pub id: i64,
    pub feed_id: i64,
    pub guid: String,
    pub url: Option<String>,
    pub title: String,
    pub creator: Option<String>,
    pub description: Option<String>,
    pub comment_url: Option<String>,
    pub comment_count: Option<i64>,
    pub enclosure_url: Option<String>,
    pub enclosure_length: Option<i64>,
    pub enclosure_type: Option<String>,
    pub published_at: i64,
    pub created_at: i64,
}

/// Article columns written by a synchronization.
///
/// `published_at` is only used on insert; updates keep the stored date.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArticleFields {
    pub guid: String,
    pub url: Option<String>,
    pub title: String,
    pub creator: Option<String>,
    pub description: Option<String>,
    pub comment_url: Option<String>,
    pub comment_count: Option<i64>,
    pub enclosure_url: Option<String>,
    pub enclosure_length: Option<i64>,
    pub enclosure_type: Option<String>,
    pub published_at: i64,
}

impl ArticleFields {
    /// True if the title or description differs from the stored article.
    ///
    /// A missing description compares equal to an empty one.
    pub fn content_changed(&self, article: &Article) -> bool {
        self.title != article.title
            || self.description.as_deref().unwrap_or("")
                != article.description.as_deref().unwrap_or("")
    }
}

// ============================================================================
// Users and Subscriptions
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub created_at: i64,
    pub deleted_at: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct Category {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
}

/// A user's subscription to a feed, carrying the cached unread count.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct FeedSubscription {
    pub id: i64,
    pub user_id: i64,
    pub feed_id: i64,
    pub category_id: Option<i64>,
    pub title: Option<String>,
    pub display_order: i64,
    pub unread_count: i64,
    pub created_at: i64,
}

/// Per-user state of an article.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct UserArticle {
    pub id: i64,
    pub user_id: i64,
    pub article_id: i64,
    pub read_at: Option<i64>,
    pub starred_at: Option<i64>,
    pub created_at: i64,
}

// ============================================================================
// Synchronization History
// ============================================================================

/// Outcome of one feed synchronization, as stored.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct FeedSynchronization {
    pub id: i64,
    pub feed_id: i64,
    pub success: bool,
    pub message: Option<String>,
    pub duration_ms: i64,
    pub created_at: i64,
}

/// Outcome of one feed synchronization, before it is written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewFeedSynchronization {
    pub feed_id: i64,
    pub success: bool,
    pub message: Option<String>,
    pub duration_ms: i64,
    pub created_at: i64,
}
