use async_trait::async_trait;
use scraper::{ElementRef, Html};
use url::Url;

use super::fetcher::Fetcher;
use super::native::NativeFeedParser;
use super::types::{FeedOrigin, FeedStrategy, ParseError, ParsedSource};

/// Feed format advertised by a `<link rel="alternate">` tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedLinkKind {
    Rss,
    Atom,
}

/// A feed advertised by an HTML page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedLink {
    /// Absolute feed URL
    pub href: String,
    pub kind: FeedLinkKind,
    pub title: Option<String>,
}

/// Treats the URL as a web page and follows the feed it advertises.
pub struct PageLinkParser {
    fetcher: Fetcher,
    native: NativeFeedParser,
}

impl PageLinkParser {
    pub fn new(fetcher: Fetcher) -> Self {
        let native = NativeFeedParser::new(fetcher.clone());
        Self { fetcher, native }
    }
}

#[async_trait]
impl FeedStrategy for PageLinkParser {
    fn name(&self) -> &'static str {
        "page-links"
    }

    async fn parse(&self, url: &str, allow_page_discovery: bool) -> Result<ParsedSource, ParseError> {
        if !allow_page_discovery {
            return Err(ParseError::DiscoveryDisabled);
        }

        let body = self.fetcher.fetch(url).await?;
        let html = String::from_utf8_lossy(&body.bytes);
        let candidates = find_feed_links(&html, &body.final_url);
        let chosen = choose_feed(&candidates).ok_or(ParseError::NoFeedLinks)?;

        tracing::debug!(
            page = %url,
            feed = %chosen.href,
            candidates = candidates.len(),
            "Following advertised feed"
        );

        // The discovered URL must itself be a feed; no second discovery hop
        let mut source = self.native.parse(&chosen.href, false).await?;
        if let Some(feed) = source.feed.as_mut() {
            feed.origin = FeedOrigin::Discovered {
                page_url: url.to_owned(),
            };
        }
        Ok(source)
    }
}

/// Every RSS/Atom `<link rel="alternate">` of a page, in document order.
///
/// Relative hrefs are resolved against `page_url`; duplicates and hrefs that
/// do not resolve are dropped.
pub fn find_feed_links(html: &str, page_url: &str) -> Vec<FeedLink> {
    let base = Url::parse(page_url).ok();
    let document = Html::parse_document(html);

    let mut links: Vec<FeedLink> = Vec::new();
    for element in document.root_element().descendants().filter_map(ElementRef::wrap) {
        let el = element.value();
        if el.name() != "link" {
            continue;
        }

        let is_alternate = el
            .attr("rel")
            .map(|rel| rel.split_whitespace().any(|r| r.eq_ignore_ascii_case("alternate")))
            .unwrap_or(false);
        if !is_alternate {
            continue;
        }

        let kind = match el.attr("type").map(|t| t.trim().to_ascii_lowercase()).as_deref() {
            Some("application/rss+xml") => FeedLinkKind::Rss,
            Some("application/atom+xml") => FeedLinkKind::Atom,
            _ => continue,
        };

        let Some(href) = el.attr("href").and_then(|h| resolve_url(h, base.as_ref())) else {
            continue;
        };
        if links.iter().any(|l| l.href == href) {
            continue;
        }

        links.push(FeedLink {
            href,
            kind,
            title: el.attr("title").map(str::to_owned),
        });
    }
    links
}

/// Pick the feed to follow among the advertised candidates.
///
/// Comment feeds are demoted; RSS and Atom rank equally, so the first
/// remaining candidate in document order wins.
pub fn choose_feed(candidates: &[FeedLink]) -> Option<&FeedLink> {
    candidates
        .iter()
        .find(|c| !is_comment_feed(c))
        .or_else(|| candidates.first())
}

fn is_comment_feed(link: &FeedLink) -> bool {
    link.href.to_lowercase().contains("comment")
        || link
            .title
            .as_deref()
            .is_some_and(|t| t.to_lowercase().contains("comment"))
}

/// Resolves a possibly relative href against the page URL.
fn resolve_url(href: &str, base: Option<&Url>) -> Option<String> {
    let href = href.trim();
    if href.is_empty() {
        return None;
    }
    let resolved = match Url::parse(href) {
        Ok(url) => url,
        Err(url::ParseError::RelativeUrlWithoutBase) => base?.join(href).ok()?,
        Err(_) => return None,
    };
    matches!(resolved.scheme(), "http" | "https").then(|| resolved.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::HostPolicy;
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use wiremock::matchers::path;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const PAGE: &str = "https://example.com/blog/";

    fn link(href: &str, kind: FeedLinkKind, title: Option<&str>) -> FeedLink {
        FeedLink {
            href: href.to_string(),
            kind,
            title: title.map(str::to_string),
        }
    }

    #[test]
    fn test_finds_all_candidates_in_order() {
        let html = r#"<html><head>
            <link rel="stylesheet" href="/style.css">
            <link rel="alternate" type="application/rss+xml" title="Comments" href="/comments/feed">
            <link rel="alternate" type="application/atom+xml" href="atom.xml">
            <link rel="alternate" type="application/rss+xml" href="https://cdn.example.com/rss">
            <link rel="alternate" type="text/html" href="/other">
        </head></html>"#;

        assert_eq!(
            find_feed_links(html, PAGE),
            vec![
                link("https://example.com/comments/feed", FeedLinkKind::Rss, Some("Comments")),
                link("https://example.com/blog/atom.xml", FeedLinkKind::Atom, None),
                link("https://cdn.example.com/rss", FeedLinkKind::Rss, None),
            ]
        );
    }

    #[test]
    fn test_attribute_case_and_duplicates() {
        let html = r#"<link REL="Alternate" TYPE="Application/RSS+XML" HREF="/Feed.XML">
            <link rel="alternate" type="application/rss+xml" href="https://example.com/Feed.XML">"#;
        assert_eq!(
            find_feed_links(html, PAGE),
            vec![link("https://example.com/Feed.XML", FeedLinkKind::Rss, None)]
        );
    }

    #[test]
    fn test_protocol_relative_href() {
        let html = r#"<link rel="alternate" type="application/rss+xml" href="//feeds.example.net/main">"#;
        let links = find_feed_links(html, PAGE);
        assert_eq!(links[0].href, "https://feeds.example.net/main");
    }

    #[test]
    fn test_no_candidates() {
        assert!(find_feed_links("<html><body>nothing</body></html>", PAGE).is_empty());
        assert_eq!(choose_feed(&[]), None);
    }

    #[test]
    fn test_chooser_demotes_comment_feeds() {
        let candidates = vec![
            link("https://example.com/comments/feed", FeedLinkKind::Rss, None),
            link("https://example.com/atom.xml", FeedLinkKind::Atom, None),
            link("https://example.com/rss.xml", FeedLinkKind::Rss, None),
        ];
        assert_eq!(choose_feed(&candidates).map(|c| c.href.as_str()), Some("https://example.com/atom.xml"));
    }

    #[test]
    fn test_chooser_falls_back_to_comment_feed() {
        let candidates = vec![link("https://example.com/comments/feed", FeedLinkKind::Rss, None)];
        assert_eq!(choose_feed(&candidates), candidates.first());
    }

    fn parser() -> PageLinkParser {
        PageLinkParser::new(Fetcher::new(
            reqwest::Client::new(),
            Duration::from_secs(5),
            1024 * 1024,
            HostPolicy::AllowPrivate,
        ))
    }

    #[tokio::test]
    async fn test_disabled_discovery() {
        let err = parser().parse("https://example.com", false).await.unwrap_err();
        assert!(matches!(err, ParseError::DiscoveryDisabled));
    }

    #[tokio::test]
    async fn test_follows_advertised_feed() {
        let server = MockServer::start().await;
        Mock::given(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"<html><head><link rel="alternate" type="application/rss+xml" href="/feed.xml"></head></html>"#,
            ))
            .mount(&server)
            .await;
        Mock::given(path("/feed.xml"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"<?xml version="1.0"?><rss version="2.0"><channel><title>Found</title>
                <item><guid>1</guid><title>One</title></item></channel></rss>"#,
            ))
            .mount(&server)
            .await;

        let page_url = format!("{}/", server.uri());
        let source = parser().parse(&page_url, true).await.unwrap();
        let feed = source.feed.unwrap();
        assert_eq!(feed.title, "Found");
        assert_eq!(feed.rss_url, format!("{}/feed.xml", server.uri()));
        assert_eq!(feed.origin, FeedOrigin::Discovered { page_url });
        assert_eq!(source.articles.len(), 1);
    }

    #[tokio::test]
    async fn test_page_without_links() {
        let server = MockServer::start().await;
        Mock::given(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html></html>"))
            .mount(&server)
            .await;

        let err = parser().parse(&format!("{}/", server.uri()), true).await.unwrap_err();
        assert!(matches!(err, ParseError::NoFeedLinks));
    }
}
