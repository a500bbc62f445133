//! Link and keyword based spam detection.

use std::collections::BTreeSet;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use wm_config::{Config, SpamConfig};

use super::{ContentFilter, FilterCategory, FilterError};
use crate::context::ParseContext;

pub(crate) const ID: &str = "spam";

static MARKDOWN_LINK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(!?)\[[^\]]*\]\([^)\s]+[^)]*\)").unwrap());

static HTML_LINK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<a\s[^>]*href").unwrap());

static HTML_IMAGE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<img\s[^>]*src").unwrap());

static IMAGE_PLUGIN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\[\{Image\s+[^}]+\}\]").unwrap());

static URL_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"https?://([^/\s)\]>]+)").unwrap());

const LINK_SCORE: u32 = 30;
const IMAGE_SCORE: u32 = 20;
const WORD_SCORE: u32 = 25;
const SHORT_SCORE: u32 = 15;
const DOMAIN_SCORE: u32 = 20;

/// Outcome of analyzing one text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpamAnalysis {
    pub score: u32,
    pub links: usize,
    pub images: usize,
    pub reasons: Vec<String>,
    pub is_spam: bool,
}

/// Scores content by link and image counts, blacklisted words, length and
/// link domains.
///
/// Content scoring at or above the threshold, or exceeding the link or image
/// limit, is spam. Spam is replaced by a comment when auto-blocking, otherwise
/// prefixed with a warning comment.
#[derive(Debug, Clone)]
pub struct SpamFilter {
    config: SpamConfig,
    blacklist: BTreeSet<String>,
    whitelist: BTreeSet<String>,
}

impl SpamFilter {
    #[must_use]
    pub fn new(config: &SpamConfig) -> Self {
        let normalize = |items: &[String]| {
            items
                .iter()
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect()
        };
        Self {
            blacklist: normalize(&config.blacklisted_words),
            whitelist: normalize(&config.whitelisted_domains),
            config: config.clone(),
        }
    }

    fn is_whitelisted(&self, domain: &str) -> bool {
        self.whitelist.iter().any(|allowed| {
            domain == allowed
                || domain
                    .strip_suffix(allowed.as_str())
                    .is_some_and(|prefix| prefix.ends_with('.'))
        })
    }

    /// Score `content`. Wiki links already extracted count through the
    /// context.
    pub fn analyze(&self, content: &str, ctx: &ParseContext) -> SpamAnalysis {
        let mut reasons = Vec::new();
        let mut score = 0;

        let mut markdown_links = 0;
        let mut images = 0;
        for caps in MARKDOWN_LINK_RE.captures_iter(content) {
            if caps[1].is_empty() {
                markdown_links += 1;
            } else {
                images += 1;
            }
        }
        let remainder = MARKDOWN_LINK_RE.replace_all(content, "");
        let html_links = HTML_LINK_RE.find_iter(&remainder).count();
        let bare_urls = URL_RE.find_iter(&remainder).count().saturating_sub(html_links);
        let links = markdown_links + html_links + bare_urls + ctx.link_targets().len();
        images += HTML_IMAGE_RE.find_iter(content).count() + IMAGE_PLUGIN_RE.find_iter(content).count();

        let too_many_links = links > self.config.max_links;
        if too_many_links {
            reasons.push(format!("Too many links: {links}/{}", self.config.max_links));
            score += LINK_SCORE;
        }
        let too_many_images = images > self.config.max_images;
        if too_many_images {
            reasons.push(format!("Too many images: {images}/{}", self.config.max_images));
            score += IMAGE_SCORE;
        }

        let lower = content.to_lowercase();
        let words: Vec<&str> = self
            .blacklist
            .iter()
            .filter(|w| lower.contains(w.as_str()))
            .map(String::as_str)
            .collect();
        if !words.is_empty() {
            reasons.push(format!("Blacklisted words: {}", words.join(", ")));
            score += WORD_SCORE * u32::try_from(words.len()).unwrap_or(u32::MAX);
        }

        let length = content.trim().chars().count();
        if length < self.config.min_content_length {
            reasons.push(format!("Content too short: {length} characters"));
            score += SHORT_SCORE;
        }

        let domains: BTreeSet<String> = URL_RE
            .captures_iter(content)
            .map(|caps| caps[1].to_lowercase())
            .filter(|d| !self.is_whitelisted(d))
            .collect();
        if !domains.is_empty() {
            reasons.push(format!(
                "Suspicious domains: {}",
                domains.iter().map(String::as_str).collect::<Vec<_>>().join(", ")
            ));
            score = score.saturating_add(
                DOMAIN_SCORE.saturating_mul(u32::try_from(domains.len()).unwrap_or(u32::MAX)),
            );
        }

        SpamAnalysis {
            is_spam: score >= self.config.score_threshold || too_many_links || too_many_images,
            score,
            links,
            images,
            reasons,
        }
    }
}

pub(crate) fn factory(config: &Config) -> Arc<dyn ContentFilter> {
    Arc::new(SpamFilter::new(&config.filters.spam))
}

impl ContentFilter for SpamFilter {
    fn id(&self) -> &str {
        ID
    }

    fn priority(&self) -> u32 {
        100
    }

    fn category(&self) -> FilterCategory {
        FilterCategory::Spam
    }

    fn process(&self, content: &str, ctx: &ParseContext) -> Result<String, FilterError> {
        if content.trim().is_empty() {
            return Ok(content.to_owned());
        }

        let analysis = self.analyze(content, ctx);
        if !analysis.is_spam {
            return Ok(content.to_owned());
        }

        let reasons = analysis.reasons.join(", ").replace("--", "- -");
        tracing::warn!(
            page = ctx.page_name(),
            user = ?ctx.user_name(),
            score = analysis.score,
            reasons = %reasons,
            "Spam detected"
        );
        if self.config.auto_block {
            Ok(format!("<!-- SPAM BLOCKED: {reasons} -->"))
        } else {
            Ok(format!("<!-- SPAM WARNING: {reasons} -->\n{content}"))
        }
    }
}
