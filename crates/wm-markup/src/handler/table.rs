//! `|| header | cell` wiki tables.

use std::sync::{Arc, LazyLock};

use regex::{Captures, Regex};
use wm_config::Config;

use super::{HandlerError, SyntaxHandler};
use crate::context::ParseContext;
use crate::util::escape_preserving_placeholders;

pub(crate) const ID: &str = "table";

static ROW_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)^\s*\|").unwrap());

static MARKER_LINE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^%%TABLE_CLASSES\{([^}]*)\}%%$").unwrap());

/// Delimiter row of a GFM table, which the Markdown converter renders itself.
static DELIMITER_ROW_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\|?\s*:?-+:?\s*(?:\|\s*:?-+:?\s*)*\|?$").unwrap()
});

/// Converts runs of pipe-delimited lines into HTML tables.
///
/// Rows starting with `||` are header rows, other rows are body rows. A
/// `%%TABLE_CLASSES{…}%%` line left by the style handler adds its classes to
/// the next table. Blocks that carry a Markdown delimiter row are left alone.
#[derive(Debug, Clone)]
pub struct TableHandler {
    dependencies: Vec<String>,
}

impl TableHandler {
    #[must_use]
    pub fn new() -> Self {
        Self {
            dependencies: vec![super::style::ID.to_owned()],
        }
    }
}

impl Default for TableHandler {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn factory(_config: &Config) -> Arc<dyn SyntaxHandler> {
    Arc::new(TableHandler::new())
}

struct Row {
    header: bool,
    cells: Vec<String>,
}

fn parse_row(line: &str) -> Row {
    if let Some(rest) = line.strip_prefix("||") {
        let rest = rest.strip_suffix("||").unwrap_or(rest);
        Row {
            header: true,
            cells: rest.split("||").map(|c| c.trim().to_owned()).collect(),
        }
    } else {
        let rest = line.strip_prefix('|').unwrap_or(line);
        let rest = rest.strip_suffix('|').unwrap_or(rest);
        Row {
            header: false,
            cells: rest.split('|').map(|c| c.trim().to_owned()).collect(),
        }
    }
}

fn class_attr(classes: &str) -> String {
    let mut set = vec!["table"];
    for class in classes.split_whitespace() {
        if !set.contains(&class) {
            set.push(class);
        }
    }
    set.join(" ")
}

fn push_rows(html: &mut String, section: &str, rows: &[&Row]) {
    if rows.is_empty() {
        return;
    }
    html.push_str(&format!("<{section}>\n"));
    for row in rows {
        let tag = if row.header { "th" } else { "td" };
        html.push_str("<tr>\n");
        for cell in &row.cells {
            html.push_str(&format!(
                "<{tag}>{}</{tag}>\n",
                escape_preserving_placeholders(cell)
            ));
        }
        html.push_str("</tr>\n");
    }
    html.push_str(&format!("</{section}>\n"));
}

/// Render collected rows. Ends with a newline so joining lines leaves a blank
/// line after the table, closing the HTML block for the Markdown converter.
fn build_table(rows: &[String], classes: &str) -> String {
    if rows.iter().any(|r| DELIMITER_ROW_RE.is_match(r)) {
        return rows.join("\n");
    }

    let parsed: Vec<Row> = rows.iter().map(|r| parse_row(r)).collect();
    let (head, body): (Vec<&Row>, Vec<&Row>) = parsed.iter().partition(|r| r.header);

    let mut html = format!("<table class=\"{}\">\n", class_attr(classes));
    push_rows(&mut html, "thead", &head);
    push_rows(&mut html, "tbody", &body);
    html.push_str("</table>\n");
    html
}

impl SyntaxHandler for TableHandler {
    fn id(&self) -> &str {
        ID
    }

    fn pattern(&self) -> &Regex {
        &ROW_RE
    }

    fn priority(&self) -> u32 {
        60
    }

    fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    fn handle(&self, caps: &Captures<'_>, _ctx: &ParseContext) -> Result<String, HandlerError> {
        Ok(caps[0].to_owned())
    }

    fn process(&self, content: &str, _ctx: &ParseContext) -> Result<String, HandlerError> {
        let mut out: Vec<String> = Vec::new();
        let mut rows: Vec<String> = Vec::new();
        let mut classes = String::new();

        for line in content.split('\n') {
            let trimmed = line.trim();

            if let Some(caps) = MARKER_LINE_RE.captures(trimmed) {
                classes = caps[1].to_owned();
                continue;
            }

            if trimmed.starts_with('|') {
                rows.push(trimmed.to_owned());
                continue;
            }

            if !rows.is_empty() {
                out.push(build_table(&rows, &classes));
                rows.clear();
                classes.clear();
            }
            out.push(line.to_owned());
        }
        if !rows.is_empty() {
            out.push(build_table(&rows, &classes));
        }

        Ok(out.join("\n"))
    }
}
