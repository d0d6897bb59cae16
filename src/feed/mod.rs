//! Source retrieval and parsing.
//!
//! A URL is turned into a feed and its articles by a chain of strategies:
//!
//! - [`NativeFeedParser`] - the URL is an RSS/Atom/JSON feed (`feed-rs`)
//! - [`PageLinkParser`] - the URL is a page advertising a feed
//! - [`NewsApiParser`] - no feed exists; articles come from an external search
//!
//! [`ParserChain`] runs them in that order, stopping early on errors no
//! fallback can fix (unknown host, missing resource).

mod chain;
mod discovery;
mod fetcher;
mod native;
mod news_api;
mod types;

pub use chain::{recoverable_with_discovery, FallbackPredicate, ParserChain};
pub use discovery::{choose_feed, find_feed_links, FeedLink, FeedLinkKind, PageLinkParser};
pub use fetcher::{FetchError, FetchedBody, Fetcher};
pub(crate) use native::base_uri_of;
pub use native::{parse_feed_bytes, NativeFeedParser};
pub use news_api::{domain_filter, NewsApiParser};
pub use types::{FeedOrigin, FeedStrategy, ParseError, ParsedArticle, ParsedFeed, ParsedSource};
