use std::sync::Arc;

use super::discovery::PageLinkParser;
use super::fetcher::Fetcher;
use super::native::NativeFeedParser;
use super::news_api::NewsApiParser;
use super::types::{FeedStrategy, ParseError, ParsedSource};

/// Decides from the primary strategy's error whether a fallback may run.
pub type FallbackPredicate = fn(&ParseError, bool) -> bool;

struct Fallback {
    when: FallbackPredicate,
    strategy: Arc<dyn FeedStrategy>,
}

/// Runs the primary strategy, then ranked fallbacks until one succeeds.
///
/// Fallbacks only see the primary strategy's error: once it is known that
/// the URL is not a feed, each fallback gets its own attempt in order.
pub struct ParserChain {
    primary: Arc<dyn FeedStrategy>,
    fallbacks: Vec<Fallback>,
}

/// The default fallback condition: page discovery allowed and the primary
/// error recoverable.
pub fn recoverable_with_discovery(err: &ParseError, allow_page_discovery: bool) -> bool {
    allow_page_discovery && err.is_recoverable()
}

impl ParserChain {
    pub fn new(primary: Arc<dyn FeedStrategy>) -> Self {
        Self {
            primary,
            fallbacks: Vec::new(),
        }
    }

    /// Append a fallback ranked after the existing ones.
    pub fn with_fallback(mut self, when: FallbackPredicate, strategy: Arc<dyn FeedStrategy>) -> Self {
        self.fallbacks.push(Fallback { when, strategy });
        self
    }

    /// Native feed first, then page link discovery, then external search.
    pub fn standard(fetcher: Fetcher, news_api: NewsApiParser) -> Self {
        Self::new(Arc::new(NativeFeedParser::new(fetcher.clone())))
            .with_fallback(recoverable_with_discovery, Arc::new(PageLinkParser::new(fetcher)))
            .with_fallback(recoverable_with_discovery, Arc::new(news_api))
    }

    /// Parse `url` as a feed, falling back to the page and external search
    /// strategies when allowed.
    ///
    /// # Errors
    ///
    /// When every eligible strategy fails, the primary strategy's error is
    /// returned; fallback errors are only logged.
    pub async fn parse_feed_or_page(
        &self,
        url: &str,
        allow_page_discovery: bool,
    ) -> Result<ParsedSource, ParseError> {
        let primary_err = match self.primary.parse(url, allow_page_discovery).await {
            Ok(source) => return Ok(source),
            Err(e) => e,
        };

        if primary_err.is_network_absence() {
            tracing::info!(
                feed = %url,
                strategy = self.primary.name(),
                error = %primary_err,
                "Source unavailable"
            );
        } else {
            tracing::warn!(
                feed = %url,
                strategy = self.primary.name(),
                error = %primary_err,
                "Source could not be parsed as a feed"
            );
        }

        for fallback in &self.fallbacks {
            if !(fallback.when)(&primary_err, allow_page_discovery) {
                continue;
            }
            match fallback.strategy.parse(url, allow_page_discovery).await {
                Ok(source) => {
                    tracing::info!(
                        feed = %url,
                        strategy = fallback.strategy.name(),
                        articles = source.articles.len(),
                        "Fallback strategy succeeded"
                    );
                    return Ok(source);
                }
                Err(e) => {
                    tracing::debug!(
                        feed = %url,
                        strategy = fallback.strategy.name(),
                        error = %e,
                        "Fallback strategy failed"
                    );
                }
            }
        }

        Err(primary_err)
    }
}
