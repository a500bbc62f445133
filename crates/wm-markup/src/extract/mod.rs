//! Extraction of proprietary syntax into placeholders, and merging back.
//!
//! Wiki constructs and the markdown grammar overlap: `[text]` is a wiki link
//! but also the start of a markdown link, and `[{$x}]` would be mangled by a
//! markdown converter. The engine keeps the two grammars apart:
//!
//! 1. Code spans and fenced blocks are replaced by code placeholders so
//!    nothing inside them is ever treated as wiki syntax.
//! 2. Escapes, variables, plugins and links are extracted, in that order, into
//!    typed [`ExtractedElement`]s. Each match becomes an element placeholder
//!    carrying the render's random token and a sequential id.
//! 3. Code placeholders are restored and the text goes through markdown
//!    conversion; HTML comments pass through untouched.
//! 4. Each element is rendered to a node independently.
//! 5. Nodes replace placeholders in descending id order.
//!
//! Placeholders are HTML comments (`<!--WIKI-{token}-{id}-->`), which carry no
//! markdown meaning.

mod fence;
mod link;
mod merge;
mod nodes;
mod params;

use std::sync::LazyLock;

use rand::RngExt;
use rayon::prelude::*;
use regex::{Captures, Match, Regex};
use serde::{Deserialize, Serialize};

pub(crate) use link::COMPONENT;
pub use link::{LinkKind, LinkResolver};
pub(crate) use merge::{
    NodeReplacements, element_placeholder, shield_line_starts, strip_leftovers, unshield,
};
pub use nodes::ElementError;
pub(crate) use nodes::{NodeBuilder, error_marker};
pub use params::PluginParams;

use crate::cache::RegionHandle;
use crate::context::ParseContext;
use crate::util::hash_parts;
use fence::{FenceLine, FenceState};
use merge::code_placeholder;

/// `[[text]` renders as the literal `[text]`.
static ESCAPED_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\[\[([^\]\n]*)\]").unwrap());

/// `[{$name}]`
static VARIABLE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\[\{\$(\w+)\}\]").unwrap());

/// `[{Name params}]`
static PLUGIN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[\{([A-Za-z]\w*)([^}]*)\}\]").unwrap());

/// `[target]` or `[text|target]`. Footnote references (`[^n]`) never match.
static LINK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[([^\]\[{^\n][^\]\[\n]*)\]").unwrap());

/// The parsed payload of an extracted construct.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Element {
    /// `[{$name}]`
    Variable { name: String },
    /// `[{Name params}]`
    Plugin { name: String, params: PluginParams },
    /// `[text|target]`; `text` equals `target` for `[target]`.
    Link { text: String, target: String },
    /// `[[text]`; `literal` is `[text]`.
    Escaped { literal: String },
}

impl Element {
    /// Short type name for logs and reports.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Variable { .. } => "variable",
            Self::Plugin { .. } => "plugin",
            Self::Link { .. } => "link",
            Self::Escaped { .. } => "escaped",
        }
    }
}

/// A construct pulled out of the text during extraction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedElement {
    /// Sequential id, unique within one render.
    pub id: usize,
    pub element: Element,
    /// The matched source text.
    pub raw: String,
    /// Byte offset of the match in the text of its extraction pass.
    pub offset: usize,
}

/// Text with placeholders plus the elements they stand for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extraction {
    /// Token embedded in the placeholders.
    pub token: String,
    /// Text with every extracted construct replaced by its placeholder.
    pub text: String,
    /// Extracted elements ordered by id.
    pub elements: Vec<ExtractedElement>,
}

impl Extraction {
    /// Rewrite placeholders produced under another token to use `token`.
    fn retokenize(mut self, token: &str) -> Self {
        if self.token == token {
            return self;
        }
        let old = std::mem::replace(&mut self.token, token.to_owned());
        let swap = |s: &str| {
            s.replace(&format!("WIKI-{old}-"), &format!("WIKI-{token}-"))
                .replace(&format!("WIKICODE-{old}-"), &format!("WIKICODE-{token}-"))
        };
        self.text = swap(&self.text);
        for extracted in &mut self.elements {
            extracted.raw = swap(&extracted.raw);
            match &mut extracted.element {
                Element::Link { text, target } => {
                    *text = swap(text);
                    *target = swap(target);
                }
                Element::Escaped { literal } => *literal = swap(literal),
                Element::Plugin { params, .. } => params.map_values(swap),
                Element::Variable { .. } => {}
            }
        }
        self
    }
}

/// Generate a fresh per-render placeholder token.
pub(crate) fn new_token() -> String {
    format!("{:08x}", rand::rng().random::<u32>())
}

/// Replace fenced blocks and inline code spans with code placeholders.
///
/// An unclosed fence protects everything to the end of the text. Returns the
/// protected text and the original spans in placeholder order.
pub(crate) fn protect_code(text: &str, token: &str) -> (String, Vec<String>) {
    let mut out = String::with_capacity(text.len());
    let mut spans = Vec::new();
    let mut fence = FenceState::new();
    let mut block = String::new();

    for line in text.split_inclusive('\n') {
        match fence.feed(line) {
            FenceLine::Open | FenceLine::Inside => block.push_str(line),
            FenceLine::Close => {
                block.push_str(line);
                push_block(&mut out, &mut spans, &mut block, token);
            }
            FenceLine::Outside => protect_inline(line, &mut out, &mut spans, token),
        }
    }
    if fence.in_fence() {
        push_block(&mut out, &mut spans, &mut block, token);
    }

    (out, spans)
}

fn push_block(out: &mut String, spans: &mut Vec<String>, block: &mut String, token: &str) {
    let mut content = std::mem::take(block);
    let newline = content.ends_with('\n');
    if newline {
        content.pop();
    }
    out.push_str(&code_placeholder(token, spans.len()));
    if newline {
        out.push('\n');
    }
    spans.push(content);
}

/// Protect backtick code spans within one line.
fn protect_inline(line: &str, out: &mut String, spans: &mut Vec<String>, token: &str) {
    let bytes = line.as_bytes();
    let mut i = 0;
    let mut last = 0;

    while i < bytes.len() {
        if bytes[i] != b'`' {
            i += 1;
            continue;
        }
        let start = i;
        while i < bytes.len() && bytes[i] == b'`' {
            i += 1;
        }
        let run = i - start;

        let mut j = i;
        let mut end = None;
        while j < bytes.len() {
            if bytes[j] == b'`' {
                let close_start = j;
                while j < bytes.len() && bytes[j] == b'`' {
                    j += 1;
                }
                if j - close_start == run {
                    end = Some(j);
                    break;
                }
            } else {
                j += 1;
            }
        }

        if let Some(end) = end {
            out.push_str(&line[last..start]);
            out.push_str(&code_placeholder(token, spans.len()));
            spans.push(line[start..end].to_owned());
            last = end;
            i = end;
        }
    }

    out.push_str(&line[last..]);
}

/// Put protected code back in place of its placeholders.
pub(crate) fn restore_code(text: &str, token: &str, spans: &[String]) -> String {
    let mut restored = text.to_owned();
    for (index, span) in spans.iter().enumerate().rev() {
        let placeholder = code_placeholder(token, index);
        if restored.contains(&placeholder) {
            restored = restored.replace(&placeholder, span);
        }
    }
    restored
}

/// Extracts wiki constructs into typed elements.
#[derive(Debug, Clone, Default)]
pub struct ExtractionEngine {
    reserved_plugins: Vec<String>,
}

impl ExtractionEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Leave plugin invocations with these names in the text for handlers.
    #[must_use]
    pub fn with_reserved_plugins<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.reserved_plugins.extend(names.into_iter().map(Into::into));
        self.reserved_plugins.sort();
        self.reserved_plugins.dedup();
        self
    }

    /// Extract all constructs from `text`, embedding `token` in placeholders.
    #[must_use]
    pub fn extract(&self, text: &str, token: &str) -> Extraction {
        let mut elements = Vec::new();

        let text = extract_pass(text, token, &ESCAPED_RE, &mut elements, |caps, _, _| {
            Some(Element::Escaped {
                literal: format!("[{}]", &caps[1]),
            })
        });
        let text = extract_pass(&text, token, &VARIABLE_RE, &mut elements, |caps, _, _| {
            Some(Element::Variable {
                name: caps[1].to_owned(),
            })
        });
        let text = extract_pass(&text, token, &PLUGIN_RE, &mut elements, |caps, _, _| {
            let name = &caps[1];
            if self.reserved_plugins.iter().any(|r| r == name) {
                return None;
            }
            Some(Element::Plugin {
                name: name.to_owned(),
                params: PluginParams::parse(&caps[2]),
            })
        });
        let text = extract_pass(&text, token, &LINK_RE, &mut elements, parse_link);

        Extraction {
            token: token.to_owned(),
            text,
            elements,
        }
    }

    /// [`extract`](Self::extract) through the pattern cache.
    ///
    /// Cached extractions are keyed by the text with the token removed and are
    /// rewritten to the caller's token on a hit.
    pub(crate) fn extract_cached(
        &self,
        text: &str,
        token: &str,
        region: &RegionHandle,
    ) -> Extraction {
        if !region.is_enabled() {
            return self.extract(text, token);
        }
        let normalized = text.replace(token, "");
        let key = format!(
            "extract:{}",
            hash_parts(&[&normalized, &self.reserved_plugins.join(",")])
        );
        if let Some(cached) = region.get_json::<Extraction>(&key) {
            tracing::debug!(elements = cached.elements.len(), "Extraction cache hit");
            return cached.retokenize(token);
        }
        let extraction = self.extract(text, token);
        region.set_json(&key, &extraction);
        extraction
    }

    /// Build nodes for every element in parallel.
    pub(crate) fn build_nodes(
        elements: &[ExtractedElement],
        ctx: &ParseContext,
        builder: &NodeBuilder<'_>,
    ) -> Vec<(usize, Result<String, ElementError>)> {
        elements
            .par_iter()
            .map(|element| (element.id, builder.build(element, ctx)))
            .collect()
    }
}

/// Replace every accepted match of `re` with an element placeholder.
///
/// `classify` sees the captures, the whole pass text and the match; returning
/// `None` leaves the match in place.
fn extract_pass<F>(
    text: &str,
    token: &str,
    re: &Regex,
    elements: &mut Vec<ExtractedElement>,
    mut classify: F,
) -> String
where
    F: FnMut(&Captures<'_>, &str, &Match<'_>) -> Option<Element>,
{
    let mut out = String::with_capacity(text.len());
    let mut last = 0;

    for caps in re.captures_iter(text) {
        let Some(m) = caps.get(0) else {
            continue;
        };
        let Some(element) = classify(&caps, text, &m) else {
            continue;
        };
        let id = elements.len();
        out.push_str(&text[last..m.start()]);
        out.push_str(&element_placeholder(token, id));
        elements.push(ExtractedElement {
            id,
            element,
            raw: m.as_str().to_owned(),
            offset: m.start(),
        });
        last = m.end();
    }

    out.push_str(&text[last..]);
    out
}

/// Accept a bracketed link unless it belongs to markdown syntax.
fn parse_link(caps: &Captures<'_>, text: &str, m: &Match<'_>) -> Option<Element> {
    let inner = &caps[1];
    let after = &text[m.end()..];
    let before = &text[..m.start()];

    if after.starts_with(['(', '[', ':']) || before.ends_with([']', '!']) {
        return None;
    }
    if matches!(inner, " " | "x" | "X") {
        return None;
    }

    let (label, target) = match inner.split_once('|') {
        Some((label, target)) => (label.trim(), target.trim()),
        None => (inner.trim(), inner.trim()),
    };
    if target.is_empty() {
        return None;
    }
    Some(Element::Link {
        text: if label.is_empty() { target } else { label }.to_owned(),
        target: target.to_owned(),
    })
}
