//! External markdown conversion.

use pulldown_cmark::{Options, Parser, html};

/// Converts markdown text to an HTML fragment.
///
/// The pipeline treats the converter as a black box invoked once per render.
/// HTML comments in the input must survive conversion unchanged, since the
/// extraction placeholders are comments.
pub trait MarkdownConverter: Send + Sync {
    /// Convert `markdown` to HTML.
    fn to_html(&self, markdown: &str) -> String;
}

/// `CommonMark` converter backed by `pulldown-cmark`.
#[derive(Debug, Clone, Copy)]
pub struct CommonMarkConverter {
    gfm: bool,
}

impl CommonMarkConverter {
    /// Create a converter with GitHub Flavored Markdown extensions enabled.
    #[must_use]
    pub fn new() -> Self {
        Self { gfm: true }
    }

    /// Enable or disable GitHub Flavored Markdown features.
    ///
    /// GFM is enabled by default. When enabled, the parser supports:
    /// - Tables
    /// - Strikethrough (`~~text~~`)
    /// - Task lists (`- [ ] item`)
    #[must_use]
    pub fn with_gfm(mut self, enabled: bool) -> Self {
        self.gfm = enabled;
        self
    }

    /// Get parser options based on GFM configuration.
    #[must_use]
    pub fn parser_options(&self) -> Options {
        if self.gfm {
            Options::ENABLE_TABLES
                | Options::ENABLE_STRIKETHROUGH
                | Options::ENABLE_TASKLISTS
                | Options::ENABLE_GFM
        } else {
            Options::empty()
        }
    }
}

impl Default for CommonMarkConverter {
    fn default() -> Self {
        Self::new()
    }
}

impl MarkdownConverter for CommonMarkConverter {
    fn to_html(&self, markdown: &str) -> String {
        let parser = Parser::new_ext(markdown, self.parser_options());
        let mut out = String::with_capacity(markdown.len() * 3 / 2);
        html::push_html(&mut out, parser);
        out
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_heading_and_paragraph() {
        let html = CommonMarkConverter::new().to_html("## Title\nHello");
        assert_eq!(html, "<h2>Title</h2>\n<p>Hello</p>\n");
    }

    #[test]
    fn test_inline_comment_survives() {
        let html = CommonMarkConverter::new().to_html("Hello <!--WIKI-0a1b2c3d-0-->");
        assert_eq!(html, "<p>Hello <!--WIKI-0a1b2c3d-0--></p>\n");
    }

    #[test]
    fn test_block_comment_not_wrapped() {
        let html = CommonMarkConverter::new().to_html("<!--WIKI-0a1b2c3d-0-->");
        assert!(!html.contains("<p>"));
        assert!(html.contains("<!--WIKI-0a1b2c3d-0-->"));
    }

    #[test]
    fn test_gfm_toggle() {
        let md = "~~gone~~";
        assert!(CommonMarkConverter::new().to_html(md).contains("<del>"));
        assert!(!CommonMarkConverter::new().with_gfm(false).to_html(md).contains("<del>"));
    }
}
