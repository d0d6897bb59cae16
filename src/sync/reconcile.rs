//! Reconciliation of a freshly parsed article batch against stored state.
//!
//! Feeds only carry their most recent items, so an article missing from a
//! fresh batch is usually just old. Removal is limited to the publication
//! window the batch covers (at or after its oldest article) and to articles
//! stored less than [`REMOVAL_GRACE_SECS`] ago.

use std::collections::{HashMap, HashSet};

use crate::feed::ParsedArticle;
use crate::storage::{Article, Database, DatabaseError};

/// Only articles stored within this many seconds can be removed.
pub const REMOVAL_GRACE_SECS: i64 = 24 * 60 * 60;

/// Clamp missing or future publication dates to `now`.
pub fn normalize_publication_dates(articles: &mut [ParsedArticle], now: i64) {
    for article in articles {
        match article.published_at {
            Some(published) if published <= now => {}
            _ => article.published_at = Some(now),
        }
    }
}

/// Collapse articles sharing a GUID; the last occurrence wins and takes the
/// position of the first.
pub fn dedup_by_guid(articles: Vec<ParsedArticle>) -> Vec<ParsedArticle> {
    let mut index: HashMap<String, usize> = HashMap::with_capacity(articles.len());
    let mut unique: Vec<ParsedArticle> = Vec::with_capacity(articles.len());
    for article in articles {
        match index.get(&article.guid) {
            Some(&i) => unique[i] = article,
            None => {
                index.insert(article.guid.clone(), unique.len());
                unique.push(article);
            }
        }
    }
    unique
}

/// The article with the smallest publication date (first one on ties).
pub fn oldest_article(articles: &[ParsedArticle]) -> Option<&ParsedArticle> {
    articles
        .iter()
        .filter(|a| a.published_at.is_some())
        .min_by_key(|a| a.published_at)
}

/// Stored articles of the window that the fresh batch no longer lists.
///
/// `window` holds the stored articles published at or after `since`, the
/// oldest fresh publication date.
pub fn select_removed(
    fresh: &[ParsedArticle],
    since: i64,
    window: Vec<Article>,
    now: i64,
) -> Vec<Article> {
    let fresh_guids: HashSet<&str> = fresh
        .iter()
        .filter(|a| a.published_at.is_some_and(|p| p >= since))
        .map(|a| a.guid.as_str())
        .collect();
    let created_after = now - REMOVAL_GRACE_SECS;

    window
        .into_iter()
        .filter(|a| a.published_at >= since)
        .filter(|a| !fresh_guids.contains(a.guid.as_str()))
        .filter(|a| a.created_at > created_after)
        .collect()
}

/// Find the stored articles of the feed stored under `rss_url` that were
/// dropped from the source.
///
/// Nothing is removed for an unknown feed, or when the oldest fresh article
/// has never been stored (the batch may not overlap what is stored).
/// `fresh` must already have normalized publication dates.
pub async fn find_removed(
    db: &Database,
    rss_url: &str,
    fresh: &[ParsedArticle],
    now: i64,
) -> Result<Vec<Article>, DatabaseError> {
    let Some(oldest) = oldest_article(fresh) else {
        return Ok(Vec::new());
    };
    let Some(since) = oldest.published_at else {
        return Ok(Vec::new());
    };
    let Some(feed) = db.find_feed_by_rss_url(rss_url).await? else {
        return Ok(Vec::new());
    };
    if db.find_article_by_guid(feed.id, &oldest.guid).await?.is_none() {
        return Ok(Vec::new());
    }

    let window = db.articles_published_since(feed.id, since).await?;
    Ok(select_removed(fresh, since, window, now))
}
