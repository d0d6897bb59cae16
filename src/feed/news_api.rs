//! External search fallback backed by the News API `everything` endpoint.
//!
//! Used for sites that publish no feed at all: articles published under the
//! site's domain are fetched from the search API and wrapped in a synthetic
//! feed.

use async_trait::async_trait;
use chrono::NaiveDateTime;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use url::Url;
use uuid::Uuid;

use super::fetcher::Fetcher;
use super::native::base_uri_of;
use super::types::{FeedOrigin, FeedStrategy, ParseError, ParsedArticle, ParsedFeed, ParsedSource};

const PUBLISHED_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

#[derive(Debug, Deserialize)]
struct SearchResponse {
    status: String,
    message: Option<String>,
    #[serde(default)]
    articles: Vec<SearchArticle>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchArticle {
    title: Option<String>,
    author: Option<String>,
    description: Option<String>,
    url: Option<String>,
    published_at: Option<String>,
    content: Option<String>,
}

pub struct NewsApiParser {
    fetcher: Fetcher,
    base_url: String,
    api_key: Option<SecretString>,
}

impl NewsApiParser {
    pub fn new(fetcher: Fetcher, base_url: impl Into<String>, api_key: Option<SecretString>) -> Self {
        Self {
            fetcher,
            base_url: base_url.into(),
            api_key,
        }
    }

    fn search_url(&self, domain: &str, key: &SecretString) -> Result<Url, ParseError> {
        let mut url = Url::parse(&self.base_url)
            .and_then(|base| base.join("everything"))
            .map_err(|e| ParseError::ExternalApi(format!("invalid base URL: {e}")))?;
        url.query_pairs_mut()
            .append_pair("domains", domain)
            .append_pair("apiKey", key.expose_secret());
        Ok(url)
    }
}

#[async_trait]
impl FeedStrategy for NewsApiParser {
    fn name(&self) -> &'static str {
        "news-api"
    }

    async fn parse(&self, url: &str, _allow_page_discovery: bool) -> Result<ParsedSource, ParseError> {
        let key = self
            .api_key
            .as_ref()
            .ok_or_else(|| ParseError::ExternalApi("not configured".to_owned()))?;

        let domain = domain_filter(url);
        if domain.is_empty() {
            return Err(ParseError::InvalidUrl(url.to_owned()));
        }

        let search_url = self.search_url(&domain, key)?;
        let body = self.fetcher.fetch(search_url.as_str()).await?;
        let response: SearchResponse = serde_json::from_slice(&body.bytes)
            .map_err(|e| ParseError::ExternalApi(format!("invalid response: {e}")))?;

        let source = convert_response(url, response)?;
        tracing::debug!(
            domain = %domain,
            articles = source.articles.len(),
            "External search completed"
        );
        Ok(source)
    }
}

fn convert_response(url: &str, response: SearchResponse) -> Result<ParsedSource, ParseError> {
    if response.status != "ok" {
        return Err(ParseError::ExternalApi(
            response
                .message
                .unwrap_or_else(|| format!("status {}", response.status)),
        ));
    }

    if response.articles.is_empty() {
        return Ok(ParsedSource::default());
    }

    let feed = ParsedFeed {
        rss_url: url.to_owned(),
        url: Some(url.to_owned()),
        base_uri: base_uri_of(url),
        title: format!("News API Feed: {url}"),
        description: Some(format!("Articles from News API for domain: {url}")),
        language: None,
        origin: FeedOrigin::Synthetic { id: Uuid::new_v4() },
    };

    let articles = response
        .articles
        .into_iter()
        // The article URL is its only identity
        .filter_map(|a| {
            let guid = a.url.clone().filter(|u| !u.trim().is_empty())?;
            Some(ParsedArticle {
                guid,
                url: a.url,
                title: a.title.unwrap_or_else(|| "Untitled".to_owned()),
                creator: a.author,
                description: a.content.or(a.description),
                comment_url: None,
                comment_count: None,
                enclosure_url: None,
                enclosure_length: None,
                enclosure_type: None,
                published_at: a.published_at.as_deref().and_then(parse_published),
            })
        })
        .collect();

    Ok(ParsedSource {
        feed: Some(feed),
        articles,
    })
}

/// Domain filter for a site URL: scheme, leading `www.` and trailing slashes
/// removed.
pub fn domain_filter(url: &str) -> String {
    let trimmed = url.trim();
    let without_scheme = trimmed
        .strip_prefix("https://")
        .or_else(|| trimmed.strip_prefix("http://"))
        .unwrap_or(trimmed);
    let without_www = without_scheme.strip_prefix("www.").unwrap_or(without_scheme);
    without_www.trim_end_matches('/').to_owned()
}

/// Parse `publishedAt` as `YYYY-MM-DDTHH:MM:SSZ`, retrying with any
/// fractional seconds cut off. `None` leaves the date to be filled in with
/// the synchronization time.
fn parse_published(raw: &str) -> Option<i64> {
    let parse = |s: &str| {
        NaiveDateTime::parse_from_str(s, PUBLISHED_FORMAT)
            .ok()
            .map(|dt| dt.and_utc().timestamp())
    };

    parse(raw).or_else(|| {
        let (seconds, _) = raw.split_once('.')?;
        parse(&format!("{seconds}Z"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::FetchError;
    use crate::util::HostPolicy;
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use wiremock::matchers::{path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn parser(base: &str, key: Option<&str>) -> NewsApiParser {
        NewsApiParser::new(
            Fetcher::new(
                reqwest::Client::new(),
                Duration::from_secs(5),
                1024 * 1024,
                HostPolicy::AllowPrivate,
            ),
            base,
            key.map(|k| SecretString::from(k.to_string())),
        )
    }

    #[test]
    fn test_domain_filter() {
        assert_eq!(domain_filter("https://www.example.com/"), "example.com");
        assert_eq!(domain_filter("http://news.example.org//"), "news.example.org");
        assert_eq!(domain_filter("example.net"), "example.net");
        assert_eq!(domain_filter("https://example.com/section/"), "example.com/section");
    }

    #[test]
    fn test_parse_published() {
        assert_eq!(parse_published("2024-01-01T00:00:00Z"), Some(1_704_067_200));
        assert_eq!(parse_published("2024-01-01T00:00:00.123Z"), Some(1_704_067_200));
        assert_eq!(parse_published("yesterday"), None);
    }

    #[test]
    fn test_error_status() {
        let response = SearchResponse {
            status: "error".into(),
            message: Some("apiKeyInvalid".into()),
            articles: vec![],
        };
        let err = convert_response("https://example.com", response).unwrap_err();
        assert!(matches!(err, ParseError::ExternalApi(ref m) if m == "apiKeyInvalid"));
    }

    #[tokio::test]
    async fn test_missing_key() {
        let err = parser("https://newsapi.example/v2/", None)
            .parse("https://example.com", true)
            .await
            .unwrap_err();
        assert!(matches!(err, ParseError::ExternalApi(ref m) if m == "not configured"));
    }

    #[tokio::test]
    async fn test_synthesizes_feed() {
        let server = MockServer::start().await;
        Mock::given(path("/v2/everything"))
            .and(query_param("domains", "example.com"))
            .and(query_param("apiKey", "secret"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"status":"ok","totalResults":2,"articles":[
                    {"source":{"id":null,"name":"Example"},"author":"Ann","title":"One",
                     "description":"short","url":"https://example.com/one","urlToImage":null,
                     "publishedAt":"2024-01-01T00:00:00Z","content":"long body"},
                    {"source":{"id":null,"name":"Example"},"author":null,"title":"Two",
                     "description":"only description","url":"https://example.com/two",
                     "publishedAt":"2024-01-02T00:00:00.5Z","content":null}
                ]}"#,
            ))
            .mount(&server)
            .await;

        let source = parser(&format!("{}/v2/", server.uri()), Some("secret"))
            .parse("https://www.example.com/", true)
            .await
            .unwrap();

        let feed = source.feed.unwrap();
        assert_eq!(feed.title, "News API Feed: https://www.example.com/");
        assert_eq!(
            feed.description.as_deref(),
            Some("Articles from News API for domain: https://www.example.com/")
        );
        assert_eq!(feed.rss_url, "https://www.example.com/");
        assert!(matches!(feed.origin, FeedOrigin::Synthetic { .. }));

        assert_eq!(source.articles.len(), 2);
        let one = &source.articles[0];
        assert_eq!(one.guid, "https://example.com/one");
        assert_eq!(one.description.as_deref(), Some("long body"));
        assert_eq!(one.creator.as_deref(), Some("Ann"));
        assert_eq!(one.published_at, Some(1_704_067_200));
        let two = &source.articles[1];
        assert_eq!(two.description.as_deref(), Some("only description"));
        assert_eq!(two.published_at, Some(1_704_153_600));
    }

    #[tokio::test]
    async fn test_zero_matches_is_empty_source() {
        let server = MockServer::start().await;
        Mock::given(path("/v2/everything"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(r#"{"status":"ok","totalResults":0,"articles":[]}"#),
            )
            .mount(&server)
            .await;

        let source = parser(&format!("{}/v2/", server.uri()), Some("k"))
            .parse("https://example.com", true)
            .await
            .unwrap();
        assert!(source.is_empty());
    }

    #[tokio::test]
    async fn test_http_error_surfaces_as_fetch_error() {
        let server = MockServer::start().await;
        Mock::given(path("/v2/everything"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let err = parser(&format!("{}/v2/", server.uri()), Some("bad"))
            .parse("https://example.com", true)
            .await
            .unwrap_err();
        assert!(matches!(err, ParseError::Fetch(FetchError::HttpStatus(401))));
    }
}
