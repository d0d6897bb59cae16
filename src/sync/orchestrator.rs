use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use thiserror::Error;

use super::reconcile::{dedup_by_guid, find_removed, normalize_publication_dates};
use crate::events::{Notifier, SyncEvent};
use crate::feed::{base_uri_of, ParseError, ParsedArticle, ParsedFeed, ParserChain};
use crate::storage::{
    Article, ArticleFields, Database, DatabaseError, Feed, FeedMetadata, FeedSubscription,
};
use crate::util::{abbreviate, abbreviate_opt, fit_or_none, sanitize_html, sanitize_plain};

pub const FEED_TITLE_MAX: usize = 100;
pub const FEED_DESCRIPTION_MAX: usize = 4000;
/// Longer language codes are dropped rather than truncated.
pub const LANGUAGE_MAX: usize = 10;
pub const ARTICLE_TITLE_MAX: usize = 4000;
pub const CREATOR_MAX: usize = 200;

/// Favicons are refreshed on the days a feed's age is a multiple of this.
const FAVICON_REFRESH_DAYS: i64 = 7;

// ============================================================================
// Errors
// ============================================================================

/// How far a synchronization got.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStage {
    Fetching,
    Parsed,
    Reconciling,
    Persisting,
    Notifying,
    Done,
    /// Creating a subscription after the feed was synchronized.
    Subscribing,
}

impl fmt::Display for SyncStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncStage::Fetching => "fetching",
            SyncStage::Parsed => "parsed",
            SyncStage::Reconciling => "reconciling",
            SyncStage::Persisting => "persisting",
            SyncStage::Notifying => "notifying",
            SyncStage::Done => "done",
            SyncStage::Subscribing => "subscribing",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum SyncErrorKind {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("Source returned no feed")]
    EmptySource,

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    /// Synchronization failed and no stored copy of the feed exists.
    #[error("Feed unavailable")]
    Unavailable(#[source] Box<SyncError>),
}

#[derive(Debug, Error)]
#[error("Synchronization failed at {stage} stage")]
pub struct SyncError {
    pub stage: SyncStage,
    #[source]
    pub kind: SyncErrorKind,
}

impl SyncError {
    fn at(stage: SyncStage) -> impl FnOnce(DatabaseError) -> SyncError {
        move |e| SyncError {
            stage,
            kind: SyncErrorKind::Database(e),
        }
    }

    /// True when the source could not be reached at all (unknown host,
    /// missing resource, refused connection).
    pub fn is_network_absence(&self) -> bool {
        match &self.kind {
            SyncErrorKind::Parse(e) => e.is_network_absence(),
            SyncErrorKind::Unavailable(inner) => inner.is_network_absence(),
            _ => false,
        }
    }
}

/// Render an error with all its sources, outermost first.
pub fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

// ============================================================================
// Report
// ============================================================================

#[derive(Debug, Clone)]
pub struct SyncReport {
    pub feed: Feed,
    pub created: usize,
    pub updated: usize,
    pub removed: usize,
    pub duration: Duration,
}

/// Changes of one synchronization, announced once committed.
#[derive(Default)]
struct Outcome {
    created: Vec<Article>,
    updated: Vec<Article>,
    removed: Vec<Article>,
    refresh_favicon: bool,
}

/// True on the first fetch of a day when the feed's age in whole days is a
/// multiple of seven. A feed never fetched counts as fetched another day.
pub fn favicon_refresh_due(feed: &Feed, now: DateTime<Utc>) -> bool {
    let today = now.date_naive();
    let new_day = feed
        .last_fetched_at
        .and_then(|ts| DateTime::from_timestamp(ts, 0))
        .map_or(true, |last| last.date_naive() != today);
    let age_days = (now.timestamp() - feed.created_at).div_euclid(86_400);
    new_day && age_days % FAVICON_REFRESH_DAYS == 0
}

fn feed_metadata(parsed: &ParsedFeed) -> FeedMetadata {
    FeedMetadata {
        rss_url: parsed.rss_url.clone(),
        url: parsed.url.clone(),
        base_uri: parsed.base_uri.clone(),
        title: abbreviate(&parsed.title, FEED_TITLE_MAX).into_owned(),
        description: abbreviate_opt(parsed.description.as_deref(), FEED_DESCRIPTION_MAX),
        language: fit_or_none(parsed.language.as_deref(), LANGUAGE_MAX),
    }
}

/// Sanitize and truncate a parsed article for storage. Relative links in the
/// description resolve against the feed's base URI, or the article's own
/// directory when the feed has none.
fn article_fields(feed: &Feed, article: &ParsedArticle, now: i64) -> ArticleFields {
    let base_uri = feed
        .base_uri
        .clone()
        .or_else(|| article.url.as_deref().and_then(base_uri_of));
    let title = sanitize_plain(&article.title);

    ArticleFields {
        guid: article.guid.clone(),
        url: article.url.clone(),
        title: abbreviate(&title, ARTICLE_TITLE_MAX).into_owned(),
        creator: abbreviate_opt(article.creator.as_deref(), CREATOR_MAX),
        description: article
            .description
            .as_deref()
            .map(|d| sanitize_html(base_uri.as_deref(), d)),
        comment_url: article.comment_url.clone(),
        comment_count: article.comment_count,
        enclosure_url: article.enclosure_url.clone(),
        enclosure_length: article.enclosure_length,
        enclosure_type: article.enclosure_type.clone(),
        published_at: article.published_at.unwrap_or(now),
    }
}

// ============================================================================
// Synchronizer
// ============================================================================

/// Synchronizes one feed at a time against the store.
#[derive(Clone)]
pub struct Synchronizer {
    db: Database,
    parsers: Arc<ParserChain>,
    notifier: Notifier,
}

impl Synchronizer {
    pub fn new(db: Database, parsers: Arc<ParserChain>, notifier: Notifier) -> Self {
        Self {
            db,
            parsers,
            notifier,
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Fetch `url` and reconcile the store with it.
    pub async fn synchronize(&self, url: &str) -> Result<SyncReport, SyncError> {
        self.synchronize_at(url, Utc::now()).await
    }

    /// [`synchronize`](Self::synchronize) with an explicit clock.
    ///
    /// All store changes for the feed happen in one transaction. Events are
    /// only emitted after it commits.
    pub async fn synchronize_at(
        &self,
        url: &str,
        now: DateTime<Utc>,
    ) -> Result<SyncReport, SyncError> {
        let started = Instant::now();
        let ts = now.timestamp();

        let source = self
            .parsers
            .parse_feed_or_page(url, true)
            .await
            .map_err(|e| SyncError {
                stage: SyncStage::Fetching,
                kind: e.into(),
            })?;
        let Some(parsed_feed) = source.feed else {
            return Err(SyncError {
                stage: SyncStage::Parsed,
                kind: SyncErrorKind::EmptySource,
            });
        };

        let mut articles = dedup_by_guid(source.articles);
        normalize_publication_dates(&mut articles, ts);

        // Read before the write transaction opens
        let removed = find_removed(&self.db, &parsed_feed.rss_url, &articles, ts)
            .await
            .map_err(SyncError::at(SyncStage::Reconciling))?;

        let (feed, outcome) = self
            .persist(&parsed_feed, &articles, removed, ts, now)
            .await
            .map_err(SyncError::at(SyncStage::Persisting))?;

        let report = SyncReport {
            feed: feed.clone(),
            created: outcome.created.len(),
            updated: outcome.updated.len(),
            removed: outcome.removed.len(),
            duration: started.elapsed(),
        };

        tracing::debug!(
            feed = %report.feed.rss_url,
            stage = %SyncStage::Notifying,
            "Changes committed, sending notifications"
        );
        self.notifier
            .notify_articles(SyncEvent::ArticlesDeleted, outcome.removed);
        self.notifier
            .notify_articles(SyncEvent::ArticlesUpdated, outcome.updated);
        self.notifier
            .notify_articles(SyncEvent::ArticlesCreated, outcome.created);
        if outcome.refresh_favicon {
            self.notifier.notify(SyncEvent::FaviconRefreshRequested(feed));
        }

        tracing::info!(
            feed = %report.feed.rss_url,
            created = report.created,
            updated = report.updated,
            removed = report.removed,
            duration_ms = report.duration.as_millis() as u64,
            stage = %SyncStage::Done,
            "Feed synchronized"
        );
        Ok(report)
    }

    async fn persist(
        &self,
        parsed_feed: &ParsedFeed,
        articles: &[ParsedArticle],
        removed: Vec<Article>,
        ts: i64,
        now: DateTime<Utc>,
    ) -> Result<(Feed, Outcome), DatabaseError> {
        let mut tx = self.db.begin_sync().await?;
        let mut outcome = Outcome::default();

        tx.remove_articles(&removed).await?;
        outcome.removed = removed;

        let meta = feed_metadata(parsed_feed);
        let feed = match tx.find_feed_by_rss_url(&meta.rss_url).await? {
            None => {
                outcome.refresh_favicon = true;
                tx.insert_feed(&meta, ts).await?
            }
            Some(existing) => {
                outcome.refresh_favicon = favicon_refresh_due(&existing, now);
                tx.update_feed(existing.id, &meta, ts).await?
            }
        };

        let guids: Vec<&str> = articles.iter().map(|a| a.guid.as_str()).collect();
        let mut stored: HashMap<String, Article> = tx
            .articles_by_guids(feed.id, &guids)
            .await?
            .into_iter()
            .map(|a| (a.guid.clone(), a))
            .collect();

        let has_new = articles.iter().any(|a| !stored.contains_key(&a.guid));
        let subscriptions: Vec<FeedSubscription> = if has_new {
            tx.active_subscriptions(feed.id).await?
        } else {
            Vec::new()
        };
        let user_ids: Vec<i64> = subscriptions.iter().map(|s| s.user_id).collect();

        for article in articles {
            let fields = article_fields(&feed, article, ts);
            match stored.remove(&fields.guid) {
                Some(current) => {
                    if fields.content_changed(&current) {
                        outcome.updated.push(tx.update_article(current.id, &fields).await?);
                    }
                }
                None => {
                    let created = tx.insert_article(feed.id, &fields, ts).await?;
                    tx.create_user_articles(created.id, &user_ids, ts).await?;
                    outcome.created.push(created);
                }
            }
        }

        if !outcome.created.is_empty() {
            let delta = outcome.created.len() as i64;
            for subscription in &subscriptions {
                tx.add_unread(subscription.id, delta).await?;
            }
        }

        tx.commit().await?;
        Ok((feed, outcome))
    }

    /// Synchronize `url`, falling back to the stored feed when the source
    /// cannot be synchronized right now.
    ///
    /// # Errors
    ///
    /// [`SyncErrorKind::Unavailable`] wrapping the synchronization error when
    /// no stored feed exists either.
    pub async fn synchronize_or_existing(&self, url: &str) -> Result<Feed, SyncError> {
        let err = match self.synchronize(url).await {
            Ok(report) => return Ok(report.feed),
            Err(e) => e,
        };

        match self.db.find_feed_by_rss_url(url).await {
            Ok(Some(feed)) => {
                tracing::info!(
                    feed = %url,
                    error = %error_chain(&err),
                    "Using stored feed after failed synchronization"
                );
                Ok(feed)
            }
            Ok(None) => Err(Self::unavailable(err)),
            Err(lookup) => {
                tracing::warn!(feed = %url, error = %lookup, "Stored feed lookup failed");
                Err(Self::unavailable(err))
            }
        }
    }

    fn unavailable(err: SyncError) -> SyncError {
        SyncError {
            stage: err.stage,
            kind: SyncErrorKind::Unavailable(Box::new(err)),
        }
    }

    /// Subscribe a user to the feed at `url`, synchronizing it first.
    ///
    /// The new subscription starts with the feed's most recent articles
    /// marked unread.
    pub async fn subscribe(
        &self,
        user_id: i64,
        url: &str,
        category_id: Option<i64>,
    ) -> Result<FeedSubscription, SyncError> {
        let feed = self.synchronize_or_existing(url).await?;
        self.db
            .create_subscription(user_id, feed.id, category_id)
            .await
            .map_err(SyncError::at(SyncStage::Subscribing))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::{FeedOrigin, FeedStrategy, ParsedSource};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    const DAY: i64 = 86_400;

    /// Serves whatever source was last staged.
    #[derive(Default)]
    struct Staged {
        source: Mutex<Option<ParsedSource>>,
    }

    #[async_trait]
    impl FeedStrategy for Staged {
        fn name(&self) -> &'static str {
            "staged"
        }

        async fn parse(&self, _url: &str, _allow: bool) -> Result<ParsedSource, ParseError> {
            self.source
                .lock()
                .unwrap()
                .clone()
                .ok_or(ParseError::MalformedFeed("nothing staged".into()))
        }
    }

    fn feed_row(created_at: i64, last_fetched_at: Option<i64>) -> Feed {
        Feed {
            id: 1,
            rss_url: "https://example.com/feed".into(),
            url: None,
            base_uri: None,
            title: "Example".into(),
            description: None,
            language: None,
            created_at,
            last_fetched_at,
        }
    }

    fn parsed_feed(title: &str) -> ParsedFeed {
        ParsedFeed {
            rss_url: "https://example.com/feed".into(),
            url: Some("https://example.com/".into()),
            base_uri: Some("https://example.com/".into()),
            title: title.into(),
            description: Some("About".into()),
            language: Some("en".into()),
            origin: FeedOrigin::Native,
        }
    }

    fn item(guid: &str, title: &str, published_at: i64) -> ParsedArticle {
        ParsedArticle {
            guid: guid.into(),
            url: Some(format!("https://example.com/{guid}")),
            title: title.into(),
            creator: None,
            description: Some(format!("<p>{title}</p>")),
            comment_url: None,
            comment_count: None,
            enclosure_url: None,
            enclosure_length: None,
            enclosure_type: None,
            published_at: Some(published_at),
        }
    }

    async fn harness() -> (Synchronizer, Arc<Staged>, mpsc::Receiver<SyncEvent>) {
        let db = Database::open(":memory:").await.unwrap();
        let staged = Arc::new(Staged::default());
        let (notifier, rx) = Notifier::channel(64);
        let chain = ParserChain::new(staged.clone());
        (Synchronizer::new(db, Arc::new(chain), notifier), staged, rx)
    }

    fn stage(staged: &Staged, feed: ParsedFeed, articles: Vec<ParsedArticle>) {
        *staged.source.lock().unwrap() = Some(ParsedSource {
            feed: Some(feed),
            articles,
        });
    }

    #[test]
    fn test_favicon_due_weekly_on_new_day() {
        let now = Utc.with_ymd_and_hms(2024, 3, 15, 12, 0, 0).unwrap();
        let ts = now.timestamp();

        assert!(favicon_refresh_due(&feed_row(ts - 7 * DAY, None), now));
        assert!(favicon_refresh_due(&feed_row(ts - 14 * DAY, Some(ts - DAY)), now));
        // Already fetched today
        assert!(!favicon_refresh_due(&feed_row(ts - 7 * DAY, Some(ts - 60)), now));
        // Not a multiple of seven days old
        assert!(!favicon_refresh_due(&feed_row(ts - 3 * DAY, Some(ts - DAY)), now));
    }

    #[test]
    fn test_feed_metadata_limits() {
        let mut parsed = parsed_feed(&"t".repeat(150));
        parsed.language = Some("en-US-x-long".into());
        let meta = feed_metadata(&parsed);
        assert_eq!(meta.title.chars().count(), FEED_TITLE_MAX);
        assert_eq!(meta.language, None);
    }

    #[test]
    fn test_article_fields_sanitized() {
        let feed = feed_row(0, None);
        let mut parsed = item("a", "<b>Bold</b> &amp; more", 10);
        parsed.creator = Some("c".repeat(300));
        parsed.description = Some(r#"<a href="post">x</a><script>alert(1)</script>"#.into());
        let fields = article_fields(&feed, &parsed, 99);

        assert_eq!(fields.title, "Bold & more");
        assert_eq!(fields.creator.as_ref().map(|c| c.chars().count()), Some(CREATOR_MAX));
        let description = fields.description.unwrap();
        assert!(description.contains("https://example.com/post"));
        assert!(!description.contains("script"));
        assert_eq!(fields.published_at, 10);
    }

    #[test]
    fn test_error_chain() {
        let err = SyncError {
            stage: SyncStage::Parsed,
            kind: SyncErrorKind::EmptySource,
        };
        assert_eq!(
            error_chain(&err),
            "Synchronization failed at parsed stage: Source returned no feed"
        );
    }

    #[tokio::test]
    async fn test_first_sync_creates_feed_and_requests_favicon() {
        let (sync, staged, mut rx) = harness().await;
        let now = Utc.with_ymd_and_hms(2024, 3, 15, 12, 0, 0).unwrap();
        let ts = now.timestamp();
        stage(&staged, parsed_feed("Example"), vec![item("a", "A", ts - 60), item("b", "B", ts - 30)]);

        let report = sync.synchronize_at("https://example.com/feed", now).await.unwrap();
        assert_eq!(report.created, 2);
        assert_eq!(report.feed.last_fetched_at, Some(ts));

        assert!(matches!(rx.recv().await, Some(SyncEvent::ArticlesCreated(a)) if a.len() == 2));
        assert!(matches!(rx.recv().await, Some(SyncEvent::FaviconRefreshRequested(_))));
    }

    #[tokio::test]
    async fn test_second_sync_updates_changed_content_only() {
        let (sync, staged, mut rx) = harness().await;
        let now = Utc.with_ymd_and_hms(2024, 3, 15, 12, 0, 0).unwrap();
        let ts = now.timestamp();
        stage(&staged, parsed_feed("Example"), vec![item("a", "A", ts - 60), item("b", "B", ts - 30)]);
        sync.synchronize_at("https://example.com/feed", now).await.unwrap();
        while rx.try_recv().is_ok() {}

        let later = now + chrono::Duration::minutes(10);
        stage(
            &staged,
            parsed_feed("Example"),
            vec![item("a", "A", ts - 60), item("b", "B edited", ts + 100)],
        );
        let report = sync.synchronize_at("https://example.com/feed", later).await.unwrap();
        assert_eq!((report.created, report.updated, report.removed), (0, 1, 0));

        let updated = sync
            .database()
            .find_article_by_guid(report.feed.id, "b")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.title, "B edited");
        // Publication date is kept
        assert_eq!(updated.published_at, ts - 30);

        assert!(matches!(rx.try_recv(), Ok(SyncEvent::ArticlesUpdated(a)) if a.len() == 1));
        // Same day: no favicon refresh
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_empty_source_is_an_error() {
        let (sync, staged, _rx) = harness().await;
        *staged.source.lock().unwrap() = Some(ParsedSource::default());

        let err = sync.synchronize("https://example.com/feed").await.unwrap_err();
        assert_eq!(err.stage, SyncStage::Parsed);
        assert!(matches!(err.kind, SyncErrorKind::EmptySource));
    }

    #[tokio::test]
    async fn test_unavailable_without_stored_feed() {
        let (sync, _staged, _rx) = harness().await;
        let err = sync
            .synchronize_or_existing("https://example.com/feed")
            .await
            .unwrap_err();
        assert!(matches!(err.kind, SyncErrorKind::Unavailable(_)));
        assert!(error_chain(&err).contains("nothing staged"));
    }

    #[tokio::test]
    async fn test_subscription_failure_reports_subscribing_stage() {
        let (sync, staged, _rx) = harness().await;
        let ts = Utc::now().timestamp();
        stage(&staged, parsed_feed("Example"), vec![item("a", "A", ts - 60)]);

        // No such user: the subscription row violates its foreign key
        let err = sync
            .subscribe(4242, "https://example.com/feed", None)
            .await
            .unwrap_err();
        assert_eq!(err.stage, SyncStage::Subscribing);
        assert!(matches!(err.kind, SyncErrorKind::Database(_)));
        assert!(error_chain(&err).starts_with("Synchronization failed at subscribing stage"));
    }
}
