use futures::StreamExt;
use reqwest::redirect::Policy;
use std::error::Error as _;
use std::time::Duration;
use thiserror::Error;

use crate::config::Config;
use crate::util::{validate_url, HostPolicy, UrlValidationError};

const USER_AGENT: &str = concat!("feedsync/", env!("CARGO_PKG_VERSION"));
const MAX_REDIRECTS: usize = 5;

/// Errors that can occur while retrieving a source.
///
/// The first three variants describe an absent network or host and are
/// logged quietly; `HostUnreachable` and `NotFound` also stop the parser
/// fallback chain.
#[derive(Debug, Error)]
pub enum FetchError {
    /// DNS resolution failed for the host
    #[error("Host unreachable: {0}")]
    HostUnreachable(String),
    /// HTTP 404 or 410
    #[error("Not found: HTTP {0}")]
    NotFound(u16),
    /// The host actively refused the TCP connection
    #[error("Connection refused: {0}")]
    ConnectionRefused(String),
    /// Request exceeded the configured timeout
    #[error("Request timed out")]
    Timeout,
    /// Any other non-2xx HTTP response
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// Response body exceeded the size limit
    #[error("Response too large")]
    TooLarge,
    /// Response was incomplete (received fewer bytes than Content-Length)
    #[error("Incomplete response: expected {expected} bytes, received {received}")]
    Incomplete { expected: u64, received: usize },
    /// The URL failed validation (bad scheme, private host, credentials)
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] UrlValidationError),
    /// Other transport error (TLS, protocol, body decoding)
    #[error("Request failed: {0}")]
    Other(#[source] reqwest::Error),
}

impl FetchError {
    /// Classify a transport error by walking its source chain.
    fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return FetchError::Timeout;
        }

        let host = err
            .url()
            .and_then(|u| u.host_str())
            .unwrap_or("unknown host")
            .to_owned();

        let mut source: Option<&(dyn std::error::Error + 'static)> = err.source();
        while let Some(cause) = source {
            if let Some(io) = cause.downcast_ref::<std::io::Error>() {
                match io.kind() {
                    std::io::ErrorKind::ConnectionRefused => {
                        return FetchError::ConnectionRefused(host)
                    }
                    std::io::ErrorKind::TimedOut => return FetchError::Timeout,
                    _ => {}
                }
            }

            let message = cause.to_string().to_lowercase();
            if message.contains("dns error")
                || message.contains("failed to lookup")
                || message.contains("no record found")
                || message.contains("name or service not known")
            {
                return FetchError::HostUnreachable(host);
            }
            if message.contains("connection refused") {
                return FetchError::ConnectionRefused(host);
            }

            source = cause.source();
        }

        FetchError::Other(err)
    }

    /// Whether another parsing strategy may succeed where this fetch failed.
    ///
    /// A host that does not resolve or a resource that does not exist will not
    /// be rescued by a different strategy, and neither will a URL that failed
    /// validation.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            FetchError::HostUnreachable(_) | FetchError::NotFound(_) | FetchError::InvalidUrl(_)
        )
    }

    /// Whether the error means the network or host is simply not there.
    pub fn is_network_absence(&self) -> bool {
        matches!(
            self,
            FetchError::HostUnreachable(_)
                | FetchError::NotFound(_)
                | FetchError::ConnectionRefused(_)
        )
    }
}

/// A successfully retrieved response body.
#[derive(Debug, Clone)]
pub struct FetchedBody {
    pub bytes: Vec<u8>,
    /// Lowercased `Content-Type` header, if any
    pub content_type: Option<String>,
    /// URL after redirects
    pub final_url: String,
}

/// HTTP retrieval with URL validation, a whole-request timeout and a body
/// size limit. Cheap to clone.
#[derive(Clone)]
pub struct Fetcher {
    client: reqwest::Client,
    timeout: Duration,
    max_size: usize,
    policy: HostPolicy,
}

impl Fetcher {
    pub fn new(client: reqwest::Client, timeout: Duration, max_size: usize, policy: HostPolicy) -> Self {
        Self {
            client,
            timeout,
            max_size,
            policy,
        }
    }

    /// Build the HTTP client and fetcher described by `config`.
    pub fn from_config(config: &Config) -> Result<Self, reqwest::Error> {
        let policy = config.host_policy();
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .redirect(create_redirect_policy(policy))
            .pool_max_idle_per_host(4)
            .pool_idle_timeout(Duration::from_secs(30))
            .tcp_keepalive(Duration::from_secs(60))
            .build()?;
        Ok(Self::new(
            client,
            config.request_timeout(),
            config.max_feed_size_bytes,
            policy,
        ))
    }

    pub fn policy(&self) -> HostPolicy {
        self.policy
    }

    /// Retrieve `url`.
    ///
    /// # Errors
    ///
    /// - [`FetchError::InvalidUrl`] - rejected before any request is made
    /// - [`FetchError::NotFound`] - HTTP 404/410
    /// - [`FetchError::HttpStatus`] - any other non-2xx status
    /// - [`FetchError::Timeout`] - request and body together exceeded the timeout
    /// - [`FetchError::TooLarge`] / [`FetchError::Incomplete`] - body problems
    /// - transport failures classified by [`FetchError`]'s variants
    pub async fn fetch(&self, url: &str) -> Result<FetchedBody, FetchError> {
        let validated = validate_url(url, self.policy)?;

        tokio::time::timeout(self.timeout, self.fetch_validated(validated))
            .await
            .map_err(|_| FetchError::Timeout)?
    }

    async fn fetch_validated(&self, url: url::Url) -> Result<FetchedBody, FetchError> {
        let response = self
            .client
            .get(url.as_str())
            .send()
            .await
            .map_err(FetchError::from_reqwest)?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND || status == reqwest::StatusCode::GONE {
            return Err(FetchError::NotFound(status.as_u16()));
        }
        if !status.is_success() {
            return Err(FetchError::HttpStatus(status.as_u16()));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_lowercase());
        let final_url = response.url().to_string();

        let bytes = read_limited_bytes(response, self.max_size).await?;

        Ok(FetchedBody {
            bytes,
            content_type,
            final_url,
        })
    }
}

/// Follow at most [`MAX_REDIRECTS`] hops, never onto a host the policy rejects.
fn create_redirect_policy(policy: HostPolicy) -> Policy {
    Policy::custom(move |attempt| {
        if attempt.previous().len() >= MAX_REDIRECTS {
            return attempt.error(format!("Too many redirects (max {MAX_REDIRECTS})"));
        }

        let url = attempt.url();
        if attempt.previous().iter().any(|prev| prev.as_str() == url.as_str()) {
            return attempt.error("Redirect loop detected");
        }

        if let Err(e) = validate_url(url.as_str(), policy) {
            tracing::warn!(to = %url, error = %e, "Refusing redirect");
            return attempt.stop();
        }

        tracing::debug!(
            to = %url,
            hop = attempt.previous().len() + 1,
            "Following redirect"
        );
        attempt.follow()
    })
}

async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, FetchError> {
    let expected_length = response.content_length();

    // Fast path: check Content-Length header
    if let Some(len) = expected_length {
        if len > limit as u64 {
            return Err(FetchError::TooLarge);
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(FetchError::from_reqwest)?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(FetchError::TooLarge);
        }
        bytes.extend_from_slice(&chunk);
    }

    if let Some(expected) = expected_length {
        if (bytes.len() as u64) < expected {
            return Err(FetchError::Incomplete {
                expected,
                received: bytes.len(),
            });
        }
    }

    Ok(bytes)
}
