//! Removal of active content and HTML sanitizing.

use std::borrow::Cow;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use regex::Regex;
use wm_config::{Config, SecurityConfig};

use super::{ContentFilter, FilterCategory, FilterError};
use crate::context::ParseContext;

pub(crate) const ID: &str = "security";

/// Left in place of every removed construct.
pub const DANGEROUS_CONTENT_MARKER: &str = "<!-- Dangerous content removed by SecurityFilter -->";

/// Whole elements and tags that carry script.
static XSS_BLOCKS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?is)<script\b.*?</script\s*>",
        r"(?is)<iframe\b.*?</iframe\s*>",
        r"(?is)<object\b.*?</object\s*>",
        r"(?i)<embed\b[^>]*>",
        // Any tag carrying an inline event handler.
        r#"(?i)<[a-z][^>]*?\son[a-z]+\s*=[^>]*>"#,
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

/// Inline script vectors that survive tag sanitizing.
static XSS_INLINE: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [r"(?i)javascript\s*:", r"(?i)expression\s*\("]
        .iter()
        .map(|p| Regex::new(p).unwrap())
        .collect()
});

/// Elements that change page behavior without script.
static ACTIVE_BLOCKS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)<meta\b[^>]*>",
        r"(?i)<link\b[^>]*>",
        r"(?is)<style\b.*?</style\s*>",
        r"(?is)<form\b.*?</form\s*>",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

static DATA_URI_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\bdata:[\w.+-]+/[\w.+-]+[;,][^\s"'<>)]*"#).unwrap()
});

/// CSS constructs that load resources or run script from a `style` attribute.
const UNSAFE_STYLE: &[&str] = &[
    "expression(",
    "javascript:",
    "vbscript:",
    "url(",
    "@import",
    "-moz-binding",
    "behavior:",
];

/// Tags whose content is dropped along with the tag.
const CLEAN_CONTENT_TAGS: &[&str] = &["script", "style"];

/// Strips script, frames, embedded objects and similar constructs from the
/// source, then cleans the converted HTML against the configured allow lists.
///
/// HTML comments, including element placeholders, are never touched.
#[derive(Debug, Clone)]
pub struct SecurityFilter {
    config: SecurityConfig,
    allowed_tags: BTreeSet<String>,
    allowed_attributes: BTreeSet<String>,
}

impl SecurityFilter {
    #[must_use]
    pub fn new(config: &SecurityConfig) -> Self {
        Self {
            allowed_tags: config
                .allowed_tags
                .iter()
                .map(|t| t.to_ascii_lowercase())
                .filter(|t| !CLEAN_CONTENT_TAGS.contains(&t.as_str()))
                .collect(),
            allowed_attributes: config
                .allowed_attributes
                .iter()
                .map(|a| a.to_ascii_lowercase())
                .collect(),
            config: config.clone(),
        }
    }

    fn strip(content: &str, patterns: &[Regex]) -> String {
        let mut out = content.to_owned();
        for pattern in patterns {
            if pattern.is_match(&out) {
                out = pattern
                    .replace_all(&out, DANGEROUS_CONTENT_MARKER)
                    .into_owned();
            }
        }
        out
    }

    /// HTML sanitizer for the configured allow lists.
    ///
    /// URLs are checked after entity decoding, so encoded schemes such as
    /// `jav&#x61;script:` are caught. Relative URLs pass.
    fn sanitizer(&self) -> ammonia::Builder<'_> {
        let mut builder = ammonia::Builder::default();
        builder
            .tags(self.allowed_tags.iter().map(String::as_str).collect())
            .clean_content_tags(CLEAN_CONTENT_TAGS.iter().copied().collect())
            .generic_attributes(self.allowed_attributes.iter().map(String::as_str).collect())
            .tag_attributes(HashMap::new())
            .add_tag_attributes("input", &["type", "checked", "disabled"])
            .link_rel(None)
            .strip_comments(false);

        let mut schemes: HashSet<&str> = HashSet::from(["http", "https", "mailto", "ftp"]);
        if self.config.allow_data_uris {
            schemes.insert("data");
        }
        builder.url_schemes(schemes);

        builder.attribute_filter(|_element, attribute, value| {
            if attribute.eq_ignore_ascii_case("style") {
                sanitize_style(value).map(Cow::Owned)
            } else {
                Some(Cow::Borrowed(value))
            }
        });
        builder
    }
}

/// Keeps the declarations of a `style` value that cannot load or run anything.
fn sanitize_style(value: &str) -> Option<String> {
    let kept: Vec<&str> = value
        .split(';')
        .map(str::trim)
        .filter(|decl| !decl.is_empty())
        .filter(|decl| {
            let lower = decl.to_ascii_lowercase();
            !UNSAFE_STYLE.iter().any(|needle| lower.contains(needle))
        })
        .collect();
    (!kept.is_empty()).then(|| kept.join("; "))
}

pub(crate) fn factory(config: &Config) -> Arc<dyn ContentFilter> {
    Arc::new(SecurityFilter::new(&config.filters.security))
}

impl ContentFilter for SecurityFilter {
    fn id(&self) -> &str {
        ID
    }

    fn priority(&self) -> u32 {
        110
    }

    fn category(&self) -> FilterCategory {
        FilterCategory::Security
    }

    fn cache_ttl(&self) -> Option<Duration> {
        Some(Duration::from_secs(600))
    }

    fn process(&self, content: &str, ctx: &ParseContext) -> Result<String, FilterError> {
        if content.len() > self.config.max_content_length {
            return Err(FilterError::Execution(format!(
                "Content exceeds maximum length limit: {} bytes",
                self.config.max_content_length
            )));
        }

        let mut out = content.to_owned();
        if self.config.prevent_xss {
            out = Self::strip(&out, &XSS_BLOCKS);
        }
        if self.config.strip_dangerous_content {
            out = Self::strip(&out, &ACTIVE_BLOCKS);
        }
        if self.config.prevent_xss {
            out = Self::strip(&out, &XSS_INLINE);
        }
        if !self.config.allow_data_uris {
            out = Self::strip(&out, std::slice::from_ref(&*DATA_URI_RE));
        }

        if out != content {
            tracing::warn!(
                page = ctx.page_name(),
                user = ?ctx.user_name(),
                "Removed unsafe content"
            );
        }
        Ok(out)
    }

    fn process_html(&self, html: &str, ctx: &ParseContext) -> Result<String, FilterError> {
        if !self.config.sanitize_html {
            return Ok(html.to_owned());
        }
        let cleaned = self.sanitizer().clean(html).to_string();
        if cleaned != html {
            tracing::debug!(page = ctx.page_name(), "Sanitized converted HTML");
        }
        Ok(cleaned)
    }
}
