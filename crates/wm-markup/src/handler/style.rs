//! `%%class text /%` style blocks.

use std::sync::{Arc, LazyLock};

use regex::{Captures, Regex};
use wm_config::Config;

use super::{HandlerError, SyntaxHandler};
use crate::context::ParseContext;
use crate::util::escape_html;

pub(crate) const ID: &str = "style";

/// Innermost style block. Content may hold table class markers but no other
/// `%%`, so nested blocks resolve from the inside out.
static STYLE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?s)%%(\([^)%]*\)|[A-Za-z][\w-]*)\s+((?:%%TABLE_CLASSES\{[^}]*\}%%|[^%]|%[^%])*?)\s*/%",
    )
    .unwrap()
});

static TABLE_MARKER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"%%TABLE_CLASSES\{([^}]*)\}%%").unwrap());

static CLASS_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z][\w-]*$").unwrap());

const MAX_PASSES: usize = 20;

/// Classes that belong on the `<table>` element of a wiki table.
const TABLE_CLASSES: &[&str] = &[
    "sortable",
    "table-filter",
    "zebra-table",
    "table-striped",
    "table-hover",
    "table-fit",
    "table-bordered",
    "table-sm",
    "table-responsive",
];

/// Classes that always produce a block element.
const BLOCK_CLASSES: &[&str] = &[
    "information",
    "warning",
    "error",
    "quote",
    "commentbox",
    "center",
    "columns",
    "collapse",
    "collapsebox",
];

const CSS_PROPERTIES: &[&str] = &[
    "color",
    "background-color",
    "font-weight",
    "font-style",
    "text-align",
    "text-decoration",
];

/// Applies CSS classes, and optionally inline styles, to text.
///
/// A block gets a `<div>` when its class is a block class or its content spans
/// several lines, a `<span>` otherwise. Table classes in front of a wiki table
/// become a `%%TABLE_CLASSES{…}%%` marker line for the table handler.
#[derive(Debug, Clone, Default)]
pub struct StyleHandler {
    inline_css: bool,
}

impl StyleHandler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allow `%%(property:value) text /%` inline styles.
    #[must_use]
    pub fn with_inline_css(mut self, enabled: bool) -> Self {
        self.inline_css = enabled;
        self
    }

    fn apply_classes(class: &str, content: &str) -> String {
        if !is_valid_class(class) {
            tracing::warn!(class, "Rejected unsafe style class");
            return content.to_owned();
        }

        let is_table_class = TABLE_CLASSES.contains(&class);
        let has_table = content.contains("||")
            || content.trim_start().starts_with('|')
            || content.contains("<table")
            || TABLE_MARKER_RE.is_match(content);
        if is_table_class && has_table {
            if let Some(existing) = TABLE_MARKER_RE.captures(content) {
                let merged = format!("%%TABLE_CLASSES{{{class} {}}}%%", &existing[1]);
                return TABLE_MARKER_RE.replace(content, merged.as_str()).into_owned();
            }
            return format!("%%TABLE_CLASSES{{{class}}}%%\n{content}");
        }

        if BLOCK_CLASSES.contains(&class) || content.contains('\n') {
            format!("<div class=\"{class}\">\n\n{content}\n\n</div>")
        } else {
            format!("<span class=\"{class}\">{content}</span>")
        }
    }

    fn apply_inline_css(&self, declarations: &str, content: &str) -> String {
        if !self.inline_css {
            return content.to_owned();
        }
        let valid: Vec<String> = declarations
            .split(';')
            .filter_map(|decl| {
                let (property, value) = decl.split_once(':')?;
                let property = property.trim().to_ascii_lowercase();
                let value = value.trim();
                (CSS_PROPERTIES.contains(&property.as_str()) && is_safe_css_value(value))
                    .then(|| format!("{property}: {value}"))
            })
            .collect();
        if valid.is_empty() {
            return content.to_owned();
        }
        format!(
            "<span style=\"{}\">{content}</span>",
            escape_html(&valid.join("; "))
        )
    }
}

/// Class names are plain identifiers, so they cannot carry markup or script.
fn is_valid_class(class: &str) -> bool {
    CLASS_NAME_RE.is_match(class)
}

fn is_safe_css_value(value: &str) -> bool {
    let lower = value.to_ascii_lowercase();
    !value.is_empty()
        && !["url(", "expression(", "javascript:", "<", ">", "\"", "\\"]
            .iter()
            .any(|d| lower.contains(d))
}

pub(crate) fn factory(config: &Config) -> Arc<dyn SyntaxHandler> {
    Arc::new(StyleHandler::new().with_inline_css(config.parser.allow_inline_css))
}

impl SyntaxHandler for StyleHandler {
    fn id(&self) -> &str {
        ID
    }

    fn pattern(&self) -> &Regex {
        &STYLE_RE
    }

    fn priority(&self) -> u32 {
        70
    }

    fn handle(&self, caps: &Captures<'_>, _ctx: &ParseContext) -> Result<String, HandlerError> {
        let style = &caps[1];
        let content = caps[2].trim();
        Ok(match style.strip_prefix('(').and_then(|s| s.strip_suffix(')')) {
            Some(declarations) => self.apply_inline_css(declarations, content),
            None => Self::apply_classes(style, content),
        })
    }

    /// Resolve nested blocks innermost first, one layer per pass.
    fn process(&self, content: &str, ctx: &ParseContext) -> Result<String, HandlerError> {
        let mut current = content.to_owned();
        for _ in 0..MAX_PASSES {
            if !STYLE_RE.is_match(&current) {
                return Ok(current);
            }
            let mut out = String::with_capacity(current.len());
            let mut last = 0;
            for caps in STYLE_RE.captures_iter(&current) {
                let Some(m) = caps.get(0) else {
                    continue;
                };
                out.push_str(&current[last..m.start()]);
                out.push_str(&self.handle(&caps, ctx)?);
                last = m.end();
            }
            out.push_str(&current[last..]);
            current = out;
        }
        tracing::warn!(passes = MAX_PASSES, "Style nesting limit reached");
        Ok(current)
    }
}
