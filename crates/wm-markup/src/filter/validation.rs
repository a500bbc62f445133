//! Content validation rules.

use std::collections::VecDeque;
use std::sync::{Arc, LazyLock, Mutex, PoisonError};
use std::time::SystemTime;

use regex::Regex;
use serde::Serialize;
use wm_config::{Config, ValidationConfig};

use super::{ContentFilter, FilterCategory, FilterError};
use crate::context::ParseContext;

pub(crate) const ID: &str = "validation";

/// Reports kept for review.
const MAX_REPORTS: usize = 1000;

static UNCLOSED_PLUGIN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)\[\{[^}\n]*$").unwrap());

static UNCLOSED_LINK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)\]\([^)\n]*$").unwrap());

static MARKDOWN_LINK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(!?)\[[^\]]*\]\(([^)\s]+)[^)]*\)").unwrap());

static HTML_HREF_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)<a\s[^>]*href\s*=\s*["']([^"']+)["']"#).unwrap());

static HTML_SRC_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)<img\s[^>]*src\s*=\s*["']([^"']+)["']"#).unwrap());

const IMAGE_EXTENSIONS: &[&str] = &[".jpg", ".jpeg", ".png", ".gif", ".webp", ".svg", ".bmp"];
const TRUSTED_IMAGE_HOSTS: &[&str] = &[
    "imgur.com",
    "github.com",
    "githubusercontent.com",
    "wikimedia.org",
    "wikipedia.org",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
}

/// One failed rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationIssue {
    pub rule: &'static str,
    pub message: String,
    pub severity: Severity,
}

/// Issues found in one render.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationReport {
    pub page_name: String,
    pub user_name: Option<String>,
    pub issues: Vec<ValidationIssue>,
    pub at: SystemTime,
}

/// Checks length limits, markup syntax and link and image URLs.
///
/// Errors are prepended to the content as comments; warnings only when
/// configured. Every render with issues is kept as a [`ValidationReport`].
#[derive(Debug)]
pub struct ValidationFilter {
    config: ValidationConfig,
    reports: Mutex<VecDeque<ValidationReport>>,
}

impl ValidationFilter {
    #[must_use]
    pub fn new(config: &ValidationConfig) -> Self {
        Self {
            config: config.clone(),
            reports: Mutex::new(VecDeque::new()),
        }
    }

    /// Run every enabled rule over `content`.
    pub fn validate(&self, content: &str) -> Vec<ValidationIssue> {
        let config = &self.config;
        let mut issues = Vec::new();
        let mut fail = |rule, severity, message: String| {
            issues.push(ValidationIssue {
                rule,
                message,
                severity,
            });
        };

        if config.max_content_length > 0 && content.chars().count() > config.max_content_length {
            fail(
                "content_length",
                Severity::Error,
                format!(
                    "Content exceeds maximum length: {} characters",
                    config.max_content_length
                ),
            );
        }
        if config.max_line_length > 0
            && content
                .lines()
                .any(|line| line.chars().count() > config.max_line_length)
        {
            fail(
                "line_length",
                Severity::Warning,
                format!(
                    "Line exceeds maximum length: {} characters",
                    config.max_line_length
                ),
            );
        }
        if config.min_word_count > 0 && content.split_whitespace().count() < config.min_word_count
        {
            fail(
                "word_count",
                Severity::Warning,
                format!(
                    "Content has too few words (minimum: {})",
                    config.min_word_count
                ),
            );
        }
        if config.validate_markup {
            if UNCLOSED_PLUGIN_RE.is_match(content) {
                fail(
                    "markup_syntax",
                    Severity::Error,
                    "Unclosed plugin syntax".to_owned(),
                );
            }
            if UNCLOSED_LINK_RE.is_match(content) {
                fail(
                    "markup_syntax",
                    Severity::Error,
                    "Unclosed markdown link".to_owned(),
                );
            }
        }
        if config.validate_links && !links_valid(content) {
            fail(
                "link_validation",
                Severity::Warning,
                "Invalid or broken links detected".to_owned(),
            );
        }
        if config.validate_images && !images_valid(content) {
            fail(
                "image_validation",
                Severity::Warning,
                "Invalid or inaccessible images detected".to_owned(),
            );
        }

        issues
    }

    /// Recent reports, oldest first.
    pub fn reports(&self) -> Vec<ValidationReport> {
        self.reports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    fn keep_report(&self, report: ValidationReport) {
        let mut reports = self.reports.lock().unwrap_or_else(PoisonError::into_inner);
        if reports.len() == MAX_REPORTS {
            reports.pop_front();
        }
        reports.push_back(report);
    }
}

fn scheme(url: &str) -> Option<String> {
    let colon = url.find(':')?;
    match url.find(['/', '?', '#']) {
        Some(slash) if slash < colon => None,
        _ => Some(url[..colon].to_ascii_lowercase()),
    }
}

/// Relative URLs and `http`, `https`, `mailto` and `ftp` URLs.
fn is_valid_url(url: &str) -> bool {
    let url = url.trim();
    !url.is_empty()
        && scheme(url).is_none_or(|s| matches!(s.as_str(), "http" | "https" | "mailto" | "ftp"))
}

fn is_valid_image_url(url: &str) -> bool {
    if !is_valid_url(url) {
        return false;
    }
    let lower = url.to_ascii_lowercase();
    IMAGE_EXTENSIONS.iter().any(|ext| lower.contains(ext))
        || url.starts_with('/')
        || TRUSTED_IMAGE_HOSTS.iter().any(|host| lower.contains(host))
}

fn links_valid(content: &str) -> bool {
    let markdown = MARKDOWN_LINK_RE
        .captures_iter(content)
        .filter(|caps| caps[1].is_empty())
        .all(|caps| is_valid_url(&caps[2]));
    markdown && HTML_HREF_RE.captures_iter(content).all(|caps| is_valid_url(&caps[1]))
}

fn images_valid(content: &str) -> bool {
    let markdown = MARKDOWN_LINK_RE
        .captures_iter(content)
        .filter(|caps| !caps[1].is_empty())
        .all(|caps| is_valid_image_url(&caps[2]));
    markdown && HTML_SRC_RE.captures_iter(content).all(|caps| is_valid_image_url(&caps[1]))
}

pub(crate) fn factory(config: &Config) -> Arc<dyn ContentFilter> {
    Arc::new(ValidationFilter::new(&config.filters.validation))
}

impl ContentFilter for ValidationFilter {
    fn id(&self) -> &str {
        ID
    }

    fn priority(&self) -> u32 {
        90
    }

    fn category(&self) -> FilterCategory {
        FilterCategory::Validation
    }

    fn process(&self, content: &str, ctx: &ParseContext) -> Result<String, FilterError> {
        if content.trim().is_empty() {
            return Ok(content.to_owned());
        }

        let issues = self.validate(content);
        if issues.is_empty() {
            return Ok(content.to_owned());
        }

        tracing::debug!(page = ctx.page_name(), issues = issues.len(), "Validation issues");
        self.keep_report(ValidationReport {
            page_name: ctx.page_name().to_owned(),
            user_name: ctx.user_name().map(str::to_owned),
            issues: issues.clone(),
            at: SystemTime::now(),
        });

        let errors: Vec<&ValidationIssue> = issues
            .iter()
            .filter(|i| i.severity == Severity::Error)
            .collect();
        if self.config.fail_on_validation_error && !errors.is_empty() {
            let messages: Vec<&str> = errors.iter().map(|i| i.message.as_str()).collect();
            return Err(FilterError::Execution(format!(
                "Validation failed: {}",
                messages.join("; ")
            )));
        }

        let mut comments = Vec::new();
        if self.config.report_errors {
            comments.extend(
                errors
                    .iter()
                    .map(|i| format!("<!-- VALIDATION ERROR [{}]: {} -->", i.rule, i.message)),
            );
        }
        if self.config.report_warnings {
            comments.extend(
                issues
                    .iter()
                    .filter(|i| i.severity == Severity::Warning)
                    .map(|i| format!("<!-- VALIDATION WARNING [{}]: {} -->", i.rule, i.message)),
            );
        }
        if comments.is_empty() {
            return Ok(content.to_owned());
        }
        Ok(format!("{}\n\n{content}", comments.join("\n")))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::context::{RenderContext, Services};

    fn ctx() -> ParseContext {
        ParseContext::new(
            &RenderContext::new("Main").with_user("ada"),
            Arc::new(Services::new()),
            0,
        )
    }

    fn rules(issues: &[ValidationIssue]) -> Vec<&'static str> {
        issues.iter().map(|i| i.rule).collect()
    }

    #[test]
    fn test_clean_content_passes() {
        let filter = ValidationFilter::new(&ValidationConfig::default());
        let text = "A short paragraph with [a link](/wiki/Page) and ![img](/a.png).";
        assert!(filter.validate(text).is_empty());
        assert_eq!(filter.process(text, &ctx()).unwrap(), text);
        assert!(filter.reports().is_empty());
    }

    #[test]
    fn test_unclosed_markup_is_error() {
        let filter = ValidationFilter::new(&ValidationConfig::default());
        let text = "Some words here [{Plugin param\nmore words [x](http://a";
        let out = filter.process(text, &ctx()).unwrap();
        assert_eq!(
            out,
            format!(
                "<!-- VALIDATION ERROR [markup_syntax]: Unclosed plugin syntax -->\n\
                 <!-- VALIDATION ERROR [markup_syntax]: Unclosed markdown link -->\n\n{text}"
            )
        );
        let reports = filter.reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].user_name.as_deref(), Some("ada"));
    }

    #[test]
    fn test_warnings_reported_only_when_enabled() {
        let text = "Too few [x](javascript:void)";
        let quiet = ValidationFilter::new(&ValidationConfig::default());
        assert_eq!(
            rules(&quiet.validate(text)),
            vec!["word_count", "link_validation"]
        );
        assert_eq!(quiet.process(text, &ctx()).unwrap(), text);

        let loud = ValidationFilter::new(&ValidationConfig {
            report_warnings: true,
            ..ValidationConfig::default()
        });
        let out = loud.process(text, &ctx()).unwrap();
        assert!(out.starts_with("<!-- VALIDATION WARNING [word_count]"));
        assert!(out.contains("<!-- VALIDATION WARNING [link_validation]"));
    }

    #[test]
    fn test_limits() {
        let filter = ValidationFilter::new(&ValidationConfig {
            max_content_length: 20,
            max_line_length: 5,
            min_word_count: 0,
            ..ValidationConfig::default()
        });
        assert_eq!(
            rules(&filter.validate("a line that is far too long")),
            vec!["content_length", "line_length"]
        );
    }

    #[test]
    fn test_image_urls() {
        assert!(is_valid_image_url("https://upload.wikimedia.org/x"));
        assert!(is_valid_image_url("https://example.com/cat.PNG"));
        assert!(is_valid_image_url("/local/image"));
        assert!(!is_valid_image_url("https://example.com/page"));
        assert!(!is_valid_image_url("ftp:"));
    }

    #[test]
    fn test_fail_on_validation_error() {
        let filter = ValidationFilter::new(&ValidationConfig {
            fail_on_validation_error: true,
            ..ValidationConfig::default()
        });
        assert_eq!(
            filter.process("Some words and [{Broken plugin", &ctx()),
            Err(FilterError::Execution(
                "Validation failed: Unclosed plugin syntax".to_owned()
            ))
        );
    }
}
