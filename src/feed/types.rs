use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use super::fetcher::FetchError;

// ============================================================================
// Parse Results
// ============================================================================

/// Where a parsed feed's metadata came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedOrigin {
    /// The URL itself served RSS, Atom or JSON Feed.
    Native,
    /// The URL served an HTML page advertising the feed.
    Discovered { page_url: String },
    /// No feed exists; the feed was synthesized from search results.
    Synthetic { id: Uuid },
}

/// Feed metadata as parsed, before length limits are applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedFeed {
    /// URL the feed is stored and refreshed under.
    pub rss_url: String,
    pub url: Option<String>,
    pub base_uri: Option<String>,
    pub title: String,
    pub description: Option<String>,
    pub language: Option<String>,
    pub origin: FeedOrigin,
}

/// An article as parsed, with raw (unsanitized) text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedArticle {
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
    /// Unix seconds; `None` when the source gave no usable date.
    pub published_at: Option<i64>,
}

/// What a strategy produced for a URL.
///
/// `feed` is `None` only when the source explicitly had nothing to offer
/// (an external search with zero matches).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedSource {
    pub feed: Option<ParsedFeed>,
    pub articles: Vec<ParsedArticle>,
}

impl ParsedSource {
    pub fn is_empty(&self) -> bool {
        self.feed.is_none() && self.articles.is_empty()
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum ParseError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    /// The body is not a feed any supported format accepts
    #[error("Malformed feed: {0}")]
    MalformedFeed(String),
    /// The page advertises no RSS/Atom alternate link
    #[error("No feed links found in page")]
    NoFeedLinks,
    /// The external search API answered with an error or is unusable
    #[error("External search failed: {0}")]
    ExternalApi(String),
    /// Page discovery was requested while disabled
    #[error("Page discovery disabled")]
    DiscoveryDisabled,
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
}

impl ParseError {
    /// Whether a fallback strategy may still succeed.
    pub fn is_recoverable(&self) -> bool {
        match self {
            ParseError::Fetch(e) => e.is_recoverable(),
            ParseError::InvalidUrl(_) => false,
            _ => true,
        }
    }

    pub fn is_network_absence(&self) -> bool {
        matches!(self, ParseError::Fetch(e) if e.is_network_absence())
    }
}

// ============================================================================
// Strategy Trait
// ============================================================================

/// One way of turning a URL into a feed and its articles.
#[async_trait]
pub trait FeedStrategy: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    async fn parse(&self, url: &str, allow_page_discovery: bool) -> Result<ParsedSource, ParseError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverability_follows_fetch_error() {
        assert!(!ParseError::Fetch(FetchError::HostUnreachable("x".into())).is_recoverable());
        assert!(!ParseError::Fetch(FetchError::NotFound(404)).is_recoverable());
        assert!(ParseError::Fetch(FetchError::Timeout).is_recoverable());
        assert!(ParseError::MalformedFeed("bad".into()).is_recoverable());
        assert!(!ParseError::InvalidUrl("bad".into()).is_recoverable());
    }

    #[test]
    fn test_network_absence() {
        assert!(ParseError::Fetch(FetchError::ConnectionRefused("x".into())).is_network_absence());
        assert!(!ParseError::Fetch(FetchError::Timeout).is_network_absence());
        assert!(!ParseError::NoFeedLinks.is_network_absence());
    }

    #[test]
    fn test_empty_source() {
        assert!(ParsedSource::default().is_empty());
    }
}
