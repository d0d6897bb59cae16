//! HTML and plain-text sanitization for feed content.
//!
//! Article descriptions are stored as HTML and rendered by downstream clients,
//! so they go through an `ammonia` allowlist. Titles and creators are stored
//! as plain text.

use std::collections::{HashMap, HashSet};

use ammonia::{Builder, UrlRelative};
use scraper::node::Node;
use scraper::{ElementRef, Html};
use url::Url;

use super::text::{collapse_whitespace, strip_control_chars};

/// Elements kept in descriptions. Anything else is unwrapped.
const ALLOWED_TAGS: &[&str] = &[
    "a", "abbr", "b", "blockquote", "br", "caption", "cite", "code", "dd", "del", "div", "dl",
    "dt", "em", "figcaption", "figure", "h1", "h2", "h3", "h4", "h5", "h6", "hr", "i", "img",
    "ins", "kbd", "li", "mark", "ol", "p", "pre", "q", "s", "small", "span", "strong", "sub",
    "sup", "table", "tbody", "td", "tfoot", "th", "thead", "tr", "u", "ul",
];

/// Elements dropped together with everything inside them.
const DROPPED_TAGS: &[&str] = &[
    "script", "style", "iframe", "object", "embed", "form", "noscript", "template", "svg",
    "math", "head", "title", "meta", "link", "base",
];

/// Elements that separate words when flattened to plain text.
const BLOCK_TAGS: &[&str] = &[
    "address", "blockquote", "br", "dd", "div", "dl", "dt", "h1", "h2", "h3", "h4", "h5", "h6",
    "hr", "li", "ol", "p", "pre", "td", "th", "tr", "ul",
];

const URL_SCHEMES: &[&str] = &["http", "https", "mailto"];

fn description_builder(base: Option<Url>) -> Builder<'static> {
    let tag_attributes: HashMap<&str, HashSet<&str>> = [
        ("a", &["href"][..]),
        ("img", &["src", "alt", "width", "height"][..]),
        ("td", &["colspan", "rowspan"][..]),
        ("th", &["colspan", "rowspan"][..]),
        ("blockquote", &["cite"][..]),
        ("q", &["cite"][..]),
        ("del", &["cite"][..]),
        ("ins", &["cite"][..]),
    ]
    .into_iter()
    .map(|(tag, attrs)| (tag, attrs.iter().copied().collect()))
    .collect();

    let mut builder = Builder::default();
    builder
        .tags(ALLOWED_TAGS.iter().copied().collect())
        .clean_content_tags(DROPPED_TAGS.iter().copied().collect())
        .generic_attributes(HashSet::from(["title"]))
        .tag_attributes(tag_attributes)
        .url_schemes(URL_SCHEMES.iter().copied().collect())
        .link_rel(None)
        .url_relative(match base {
            Some(base) => UrlRelative::RewriteWithBase(base),
            None => UrlRelative::Deny,
        });
    builder
}

/// Sanitize an HTML fragment for storage.
///
/// Unknown elements are unwrapped (their children kept), dangerous elements are
/// removed with their content, and relative `href`/`src`/`cite` values are
/// resolved against `base_uri`. URLs with schemes other than http, https and
/// mailto are dropped.
///
/// # Examples
///
/// ```
/// use feedsync::util::sanitize_html;
///
/// let html = r#"<p onclick="x()">Hi <a href="post">there</a><script>bad()</script></p>"#;
/// assert_eq!(
///     sanitize_html(Some("https://example.com/blog/"), html),
///     r#"<p>Hi <a href="https://example.com/blog/post">there</a></p>"#
/// );
/// ```
pub fn sanitize_html(base_uri: Option<&str>, html: &str) -> String {
    let base = base_uri.and_then(|b| Url::parse(b).ok());
    let cleaned = description_builder(base)
        .clean(&strip_control_chars(html))
        .to_string();
    cleaned.trim().to_owned()
}

/// Reduce text to a single line of plain text.
///
/// Tags are removed, entities decoded, control characters stripped and
/// whitespace collapsed.
pub fn sanitize_plain(text: &str) -> String {
    let fragment = Html::parse_fragment(text);
    let mut raw = String::with_capacity(text.len());
    collect_text(fragment.root_element(), &mut raw);
    collapse_whitespace(&strip_control_chars(&raw))
}

fn collect_text(element: ElementRef<'_>, out: &mut String) {
    for child in element.children() {
        match child.value() {
            Node::Text(text) => out.push_str(text),
            Node::Element(el) => {
                if DROPPED_TAGS.contains(&el.name()) {
                    continue;
                }
                let block = BLOCK_TAGS.contains(&el.name());
                if let Some(child_el) = ElementRef::wrap(child) {
                    if block {
                        out.push(' ');
                    }
                    collect_text(child_el, out);
                    if block {
                        out.push(' ');
                    }
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const BASE: Option<&str> = Some("https://example.com/blog/");

    #[test]
    fn test_keeps_allowed_markup() {
        assert_eq!(
            sanitize_html(BASE, "<p>Hello <strong>world</strong></p>"),
            "<p>Hello <strong>world</strong></p>"
        );
    }

    #[test]
    fn test_drops_script_with_content() {
        assert_eq!(
            sanitize_html(BASE, "<p>a</p><script>alert(1)</script><style>p{}</style>"),
            "<p>a</p>"
        );
    }

    #[test]
    fn test_unwraps_unknown_elements() {
        assert_eq!(
            sanitize_html(BASE, "<section><p>inside</p></section>"),
            "<p>inside</p>"
        );
    }

    #[test]
    fn test_strips_event_handlers_and_styles() {
        assert_eq!(
            sanitize_html(BASE, r#"<p style="color:red" onmouseover="x()">t</p>"#),
            "<p>t</p>"
        );
    }

    #[test]
    fn test_resolves_relative_links() {
        assert_eq!(
            sanitize_html(BASE, r#"<a href="../about">a</a><img src="/img.png">"#),
            r#"<a href="https://example.com/about">a</a><img src="https://example.com/img.png">"#
        );
    }

    #[test]
    fn test_relative_link_without_base_is_dropped() {
        assert_eq!(
            sanitize_html(None, r#"<a href="post">a</a>"#),
            "<a>a</a>"
        );
    }

    #[test]
    fn test_javascript_urls_dropped() {
        assert_eq!(
            sanitize_html(BASE, r#"<a href="javascript:alert(1)">x</a>"#),
            "<a>x</a>"
        );
    }

    #[test]
    fn test_text_is_escaped() {
        assert_eq!(sanitize_html(BASE, "a &lt;b&gt; &amp; c"), "a &lt;b&gt; &amp; c");
    }

    #[test]
    fn test_mailto_kept_and_data_urls_dropped() {
        assert_eq!(
            sanitize_html(
                BASE,
                r#"<a href="mailto:me@example.com">m</a><img src="data:image/png;base64,AA">"#
            ),
            r#"<a href="mailto:me@example.com">m</a><img>"#
        );
    }

    #[test]
    fn test_dropped_attributes_on_allowed_tags() {
        assert_eq!(
            sanitize_html(BASE, r#"<table><tr><td colspan="2" class="x">c</td></tr></table>"#),
            r#"<table><tbody><tr><td colspan="2">c</td></tr></tbody></table>"#
        );
        assert_eq!(
            sanitize_html(BASE, r#"<blockquote cite="/src" class="x">q</blockquote>"#),
            r#"<blockquote cite="https://example.com/src">q</blockquote>"#
        );
    }

    #[test]
    fn test_control_characters_removed_from_html() {
        assert_eq!(sanitize_html(BASE, "<p>bell\x07</p>"), "<p>bell</p>");
    }

    #[test]
    fn test_plain_removes_tags_and_decodes() {
        assert_eq!(sanitize_plain("<b>Rust</b> &amp; <i>friends</i>"), "Rust & friends");
    }

    #[test]
    fn test_plain_drops_script_and_controls() {
        assert_eq!(sanitize_plain("Title\x07<script>x</script>  <p>end</p>"), "Title end");
    }

    #[test]
    fn test_plain_inline_tags_do_not_split_words() {
        assert_eq!(sanitize_plain("un<b>believ</b>able"), "unbelievable");
    }

    #[test]
    fn test_plain_empty() {
        assert_eq!(sanitize_plain(""), "");
    }
}
