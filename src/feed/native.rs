use async_trait::async_trait;
use feed_rs::model::{Entry, Link};
use sha2::{Digest, Sha256};
use url::Url;

use super::fetcher::Fetcher;
use super::types::{FeedOrigin, FeedStrategy, ParseError, ParsedArticle, ParsedFeed, ParsedSource};

/// Parses the URL as RSS, Atom or JSON Feed.
#[derive(Clone)]
pub struct NativeFeedParser {
    fetcher: Fetcher,
}

impl NativeFeedParser {
    pub fn new(fetcher: Fetcher) -> Self {
        Self { fetcher }
    }
}

#[async_trait]
impl FeedStrategy for NativeFeedParser {
    fn name(&self) -> &'static str {
        "native"
    }

    async fn parse(&self, url: &str, _allow_page_discovery: bool) -> Result<ParsedSource, ParseError> {
        let body = self.fetcher.fetch(url).await?;
        parse_feed_bytes(&body.bytes, url)
    }
}

/// Parse feed bytes fetched from `requested_url`.
///
/// The feed is stamped with `requested_url` rather than any redirect target,
/// so it is found again under the URL it was subscribed with.
pub fn parse_feed_bytes(bytes: &[u8], requested_url: &str) -> Result<ParsedSource, ParseError> {
    let feed = feed_rs::parser::parse(bytes).map_err(|e| ParseError::MalformedFeed(e.to_string()))?;

    // Website link: first non-self link that is not the feed itself
    let url = feed
        .links
        .iter()
        .find(|link| link.rel.as_deref() != Some("self") && link.href != requested_url)
        .map(|link| link.href.clone())
        .unwrap_or_else(|| requested_url.to_owned());

    let parsed_feed = ParsedFeed {
        rss_url: requested_url.to_owned(),
        base_uri: base_uri_of(&url),
        url: Some(url),
        title: feed
            .title
            .map(|t| t.content)
            .unwrap_or_else(|| "Untitled Feed".to_owned()),
        description: feed.description.map(|d| d.content),
        language: feed.language,
        origin: FeedOrigin::Native,
    };

    let articles = feed.entries.into_iter().map(convert_entry).collect();

    Ok(ParsedSource {
        feed: Some(parsed_feed),
        articles,
    })
}

fn convert_entry(entry: Entry) -> ParsedArticle {
    let url = entry
        .links
        .iter()
        .find(|l| matches!(l.rel.as_deref(), None | Some("alternate")))
        .or_else(|| entry.links.first())
        .map(|l| l.href.clone());
    let published_at = entry.published.or(entry.updated).map(|dt| dt.timestamp());
    let title = entry
        .title
        .map(|t| t.content)
        .unwrap_or_else(|| "Untitled".to_string());

    let existing_id = if entry.id.is_empty() {
        None
    } else {
        Some(entry.id.as_str())
    };
    let guid = generate_guid(existing_id, url.as_deref(), &title, published_at);

    let comment_url = find_link(&entry.links, "replies").map(|l| l.href.clone());

    let (enclosure_url, enclosure_length, enclosure_type) =
        match find_link(&entry.links, "enclosure") {
            Some(link) => (
                Some(link.href.clone()),
                link.length.and_then(|n| i64::try_from(n).ok()),
                link.media_type.clone(),
            ),
            None => entry
                .media
                .iter()
                .flat_map(|m| m.content.iter())
                .find_map(|c| {
                    c.url.as_ref().map(|u| {
                        (
                            Some(u.to_string()),
                            c.size.and_then(|n| i64::try_from(n).ok()),
                            c.content_type.as_ref().map(|m| m.to_string()),
                        )
                    })
                })
                .unwrap_or((None, None, None)),
        };

    let description = entry
        .summary
        .map(|s| s.content)
        .or_else(|| entry.content.and_then(|c| c.body));

    ParsedArticle {
        guid,
        url,
        title,
        creator: entry.authors.into_iter().map(|p| p.name).find(|n| !n.trim().is_empty()),
        description,
        comment_url,
        comment_count: None,
        enclosure_url,
        enclosure_length,
        enclosure_type,
        published_at,
    }
}

fn find_link<'a>(links: &'a [Link], rel: &str) -> Option<&'a Link> {
    links.iter().find(|l| l.rel.as_deref() == Some(rel))
}

/// Use the entry's own id when present; otherwise derive a stable id from
/// its url, title and date.
fn generate_guid(
    existing: Option<&str>,
    url: Option<&str>,
    title: &str,
    published: Option<i64>,
) -> String {
    if let Some(guid) = existing {
        let trimmed = guid.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }

    let input = format!(
        "{}|{}|{}",
        url.unwrap_or(""),
        title,
        published.map(|p| p.to_string()).unwrap_or_default()
    );
    let hash = Sha256::digest(input.as_bytes());
    format!("{:x}", hash)
}

/// Directory of a web URL (`scheme://host/path/up/to/last/slash/`), used to
/// resolve relative links in article content.
pub(crate) fn base_uri_of(url: &str) -> Option<String> {
    let mut parsed = Url::parse(url).ok()?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return None;
    }
    parsed.set_query(None);
    parsed.set_fragment(None);
    let path = parsed.path();
    let dir = match path.rfind('/') {
        Some(idx) => path[..=idx].to_owned(),
        None => "/".to_owned(),
    };
    parsed.set_path(&dir);
    Some(parsed.to_string())
}
