use std::net::IpAddr;
use thiserror::Error;
use url::Url;

/// Errors that can occur during URL validation.
///
/// These cover both parsing failures and the SSRF policy applied to every
/// URL the synchronizer is asked to fetch.
#[derive(Error, Debug)]
pub enum UrlValidationError {
    /// The URL string could not be parsed.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    /// The URL uses a scheme other than http or https.
    #[error("Unsupported scheme: {0} (only http/https allowed)")]
    UnsupportedScheme(String),
    /// The URL points to a private/internal IP address.
    #[error("Private IP address not allowed: {0}")]
    PrivateIp(String),
    /// The URL points to localhost.
    #[error("Localhost not allowed")]
    Localhost,
    /// The URL embeds credentials (`user:pass@host`).
    #[error("Credentials in URL not allowed")]
    Credentials,
}

/// Which hosts a fetch may target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HostPolicy {
    /// Public hosts only (production default).
    #[default]
    PublicOnly,
    /// Any host, including loopback and private ranges (local deployments, tests).
    AllowPrivate,
}

/// Validates a URL string for use as a feed source.
///
/// Rejects non-HTTP(S) schemes and embedded credentials. Under
/// [`HostPolicy::PublicOnly`] also rejects localhost and private IP ranges
/// (RFC 1918, link-local, unique local IPv6).
///
/// # Examples
///
/// ```
/// use feedsync::util::{validate_url, HostPolicy};
///
/// let url = validate_url("https://example.com/feed.xml", HostPolicy::PublicOnly).unwrap();
/// assert_eq!(url.host_str(), Some("example.com"));
///
/// assert!(validate_url("http://localhost/feed", HostPolicy::PublicOnly).is_err());
/// assert!(validate_url("http://localhost/feed", HostPolicy::AllowPrivate).is_ok());
/// assert!(validate_url("file:///etc/passwd", HostPolicy::AllowPrivate).is_err());
/// ```
pub fn validate_url(url_str: &str, policy: HostPolicy) -> Result<Url, UrlValidationError> {
    let url = Url::parse(url_str.trim())?;

    match url.scheme() {
        "http" | "https" => {}
        scheme => return Err(UrlValidationError::UnsupportedScheme(scheme.to_owned())),
    }

    if !url.username().is_empty() || url.password().is_some() {
        return Err(UrlValidationError::Credentials);
    }

    if policy == HostPolicy::AllowPrivate {
        return Ok(url);
    }

    if let Some(host) = url.host_str() {
        if host.eq_ignore_ascii_case("localhost") {
            return Err(UrlValidationError::Localhost);
        }

        let host_for_parse = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);

        if let Ok(ip) = host_for_parse.parse::<IpAddr>() {
            if ip.is_loopback() {
                return Err(UrlValidationError::Localhost);
            }
            if is_private_ip(&ip) {
                return Err(UrlValidationError::PrivateIp(ip.to_string()));
            }
        }
    }

    Ok(url)
}

fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(ipv4) => {
            ipv4.is_private() || ipv4.is_link_local() || ipv4.is_unspecified()
        }
        IpAddr::V6(ipv6) => {
            if ipv6.is_unspecified() {
                return true;
            }
            let segments = ipv6.segments();
            // fc00::/7
            let is_unique_local = (segments[0] & 0xfe00) == 0xfc00;
            // fe80::/10
            let is_link_local = (segments[0] & 0xffc0) == 0xfe80;
            is_unique_local || is_link_local
        }
    }
}
