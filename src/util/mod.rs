//! Utility functions shared by the parsers and the synchronizer.
//!
//! - **URL validation**: SSRF policy applied before any fetch
//! - **Text processing**: length limits and control-character stripping
//! - **Sanitization**: ammonia allowlist cleaning and plain-text extraction

mod sanitize;
mod text;
mod url_validator;

pub use sanitize::{sanitize_html, sanitize_plain};
pub use text::{abbreviate, abbreviate_opt, collapse_whitespace, fit_or_none, strip_control_chars};
pub use url_validator::{validate_url, HostPolicy, UrlValidationError};
