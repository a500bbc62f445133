//! Placeholder substitution after markdown conversion.

use std::sync::LazyLock;

use regex::Regex;

use crate::util::PLACEHOLDER_RE;

static TABLE_CLASSES_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"%%TABLE_CLASSES\{[^}]*\}%%\n?").unwrap());

static EMPTY_PARAGRAPH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<p>\s*</p>\n?").unwrap());

static LINE_START_PLACEHOLDER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^( {0,3})(<!--WIKI-[0-9a-f]{8}-\d+-->)").unwrap());

/// Put in front of placeholders that open a line. A line starting with a
/// comment is an HTML block to the markdown converter, which would keep the
/// rest of the line from being parsed as markdown.
const LINE_SHIELD: &str = "\u{200B}";

/// Tags whose presence at the start of a node makes it block level.
const BLOCK_TAGS: &[&str] = &[
    "div", "table", "ul", "ol", "pre", "blockquote", "p", "h1", "h2", "h3", "h4", "h5", "h6",
    "hr", "dl",
];

/// Rendered nodes waiting to replace their placeholders.
///
/// Nodes are applied in descending id order, so a node whose HTML still
/// carries the placeholders of constructs nested inside it is substituted
/// before those nested placeholders are resolved.
///
/// # Example
///
/// ```text
/// text:   [Hello <!--WIKI-t-0-->]      (link 1 wraps variable 0)
/// html:   <p><!--WIKI-t-1--></p>
/// node 1: <a href="/wiki/Hello">Hello <!--WIKI-t-0--></a>
/// node 0: Ada
/// apply:  <p><a href="/wiki/Hello">Hello Ada</a></p>
/// ```
#[derive(Debug)]
pub(crate) struct NodeReplacements {
    token: String,
    items: Vec<(usize, String)>,
}

impl NodeReplacements {
    pub(crate) fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            items: Vec::new(),
        }
    }

    pub(crate) fn add(&mut self, id: usize, node: impl Into<String>) {
        self.items.push((id, node.into()));
    }

    /// Substitute every node into `html`.
    ///
    /// Returns the ids whose placeholder was not found.
    pub(crate) fn apply(mut self, html: &mut String) -> Vec<usize> {
        self.items.sort_by(|a, b| b.0.cmp(&a.0));
        let mut missing = Vec::new();

        for (id, node) in self.items {
            let placeholder = element_placeholder(&self.token, id);
            if is_block(&node) {
                let wrapped = format!("<p>{placeholder}</p>");
                if html.contains(&wrapped) {
                    *html = html.replacen(&wrapped, &node, 1);
                    continue;
                }
            }
            if html.contains(&placeholder) {
                *html = html.replacen(&placeholder, &node, 1);
            } else {
                missing.push(id);
            }
        }

        missing
    }
}

/// Placeholder comment for element `id`.
pub(crate) fn element_placeholder(token: &str, id: usize) -> String {
    format!("<!--WIKI-{token}-{id}-->")
}

/// Placeholder comment for protected code span `index`.
pub(crate) fn code_placeholder(token: &str, index: usize) -> String {
    format!("<!--WIKICODE-{token}-{index}-->")
}

fn is_block(node: &str) -> bool {
    let Some(rest) = node.trim_start().strip_prefix('<') else {
        return false;
    };
    let name: String = rest
        .chars()
        .take_while(char::is_ascii_alphanumeric)
        .collect::<String>()
        .to_ascii_lowercase();
    BLOCK_TAGS.contains(&name.as_str())
}

/// Shield element placeholders at the start of a line before conversion.
pub(crate) fn shield_line_starts(text: &str) -> String {
    LINE_START_PLACEHOLDER_RE
        .replace_all(text, format!("${{1}}{LINE_SHIELD}${{2}}").as_str())
        .into_owned()
}

/// Drop the shields added by [`shield_line_starts`] from converted HTML.
pub(crate) fn unshield(html: &str) -> String {
    html.replace(&format!("{LINE_SHIELD}<!--WIKI-"), "<!--WIKI-")
}

/// Remove placeholders and internal markers that survived merging, and the
/// paragraphs left empty by their removal.
pub(crate) fn strip_leftovers(html: &str) -> String {
    let without_markers = TABLE_CLASSES_RE.replace_all(html, "");
    let stripped = PLACEHOLDER_RE.replace_all(&without_markers, "");
    let compacted = EMPTY_PARAGRAPH_RE.replace_all(&stripped, "");
    compacted.trim_end().to_owned()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    const TOKEN: &str = "0a1b2c3d";

    #[test]
    fn test_nested_nodes_resolved_outer_first() {
        let mut html = format!("<p>{}</p>", element_placeholder(TOKEN, 1));
        let mut nodes = NodeReplacements::new(TOKEN);
        nodes.add(0, "Ada");
        nodes.add(
            1,
            format!(r#"<a href="/wiki/Hello">Hello {}</a>"#, element_placeholder(TOKEN, 0)),
        );
        let missing = nodes.apply(&mut html);

        assert!(missing.is_empty());
        assert_eq!(html, r#"<p><a href="/wiki/Hello">Hello Ada</a></p>"#);
    }

    #[test]
    fn test_block_node_replaces_paragraph() {
        let mut html = format!("<p>{}</p>\n", element_placeholder(TOKEN, 0));
        let mut nodes = NodeReplacements::new(TOKEN);
        nodes.add(0, "<div class=\"toc\">x</div>");
        nodes.apply(&mut html);
        assert_eq!(html, "<div class=\"toc\">x</div>\n");
    }

    #[test]
    fn test_inline_node_keeps_paragraph() {
        let mut html = format!("<p>{}</p>", element_placeholder(TOKEN, 0));
        let mut nodes = NodeReplacements::new(TOKEN);
        nodes.add(0, "<span>x</span>");
        nodes.apply(&mut html);
        assert_eq!(html, "<p><span>x</span></p>");
    }

    #[test]
    fn test_missing_placeholder_reported() {
        let mut html = "<p>nothing</p>".to_owned();
        let mut nodes = NodeReplacements::new(TOKEN);
        nodes.add(3, "x");
        assert_eq!(nodes.apply(&mut html), vec![3]);
    }

    #[test]
    fn test_strip_leftovers() {
        let html = format!(
            "%%TABLE_CLASSES{{sortable}}%%\n<p>a{}b{}</p>\n\n",
            element_placeholder(TOKEN, 9),
            code_placeholder(TOKEN, 2)
        );
        assert_eq!(strip_leftovers(&html), "<p>ab</p>");
    }

    #[test]
    fn test_strip_leftovers_drops_emptied_paragraphs() {
        let html = "<p>%%TABLE_CLASSES{sortable}%%</p>\n<p>kept</p>\n";
        assert_eq!(strip_leftovers(html), "<p>kept</p>");
    }

    #[test]
    fn test_shielded_line_stays_a_paragraph() {
        use crate::markdown::{CommonMarkConverter, MarkdownConverter};

        let text = format!("{} is *great*", element_placeholder(TOKEN, 0));
        let shielded = shield_line_starts(&text);
        assert_ne!(shielded, text);

        let html = unshield(&CommonMarkConverter::new().to_html(&shielded));
        assert_eq!(
            html,
            format!("<p>{} is <em>great</em></p>\n", element_placeholder(TOKEN, 0))
        );
    }

    #[test]
    fn test_shield_ignores_placeholders_inside_lines() {
        let text = format!("a {}", element_placeholder(TOKEN, 0));
        assert_eq!(shield_line_starts(&text), text);
    }
}
