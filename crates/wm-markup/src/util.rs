//! Shared helpers for escaping and hashing.

use std::sync::LazyLock;

use regex::Regex;
use sha2::{Digest, Sha256};

/// Matches element and code placeholders inserted by the extraction engine.
pub(crate) static PLACEHOLDER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<!--WIKI(?:CODE)?-[0-9a-f]{8}-\d+-->").unwrap());

/// Escape text for inclusion in HTML element content or attribute values.
///
/// # Example
///
/// ```
/// use wm_markup::escape_html;
///
/// assert_eq!(escape_html(r#"<a href="x">&</a>"#), "&lt;a href=&quot;x&quot;&gt;&amp;&lt;/a&gt;");
/// ```
#[must_use]
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Undo [`escape_html`] and the escaping done by the markdown converter.
pub(crate) fn unescape_html(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

/// HTML comment holding `text`. Any `>` is escaped so the text can never
/// close the comment or pass for a placeholder.
pub(crate) fn html_comment(text: &str) -> String {
    format!("<!-- {} -->", text.replace('>', "&gt;"))
}

/// Escape text while keeping placeholder comments intact.
///
/// Used wherever markup built during a render wraps text that may still hold
/// extracted elements, so the merge step can find them afterwards.
pub(crate) fn escape_preserving_placeholders(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for m in PLACEHOLDER_RE.find_iter(text) {
        out.push_str(&escape_html(&text[last..m.start()]));
        out.push_str(m.as_str());
        last = m.end();
    }
    out.push_str(&escape_html(&text[last..]));
    out
}

/// SHA-256 of `parts` joined with a separator, hex encoded.
pub(crate) fn hash_parts(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            hasher.update([0x1f]);
        }
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Message carried by a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_html() {
        assert_eq!(escape_html("a < b & 'c'"), "a &lt; b &amp; &#39;c&#39;");
    }

    #[test]
    fn test_escape_preserving_placeholders() {
        let text = "<b><!--WIKI-0a1b2c3d-4--></b>";
        assert_eq!(
            escape_preserving_placeholders(text),
            "&lt;b&gt;<!--WIKI-0a1b2c3d-4-->&lt;/b&gt;"
        );
    }

    #[test]
    fn test_escape_preserving_code_placeholders() {
        let text = "x <!--WIKICODE-deadbeef-0--> & y";
        assert_eq!(
            escape_preserving_placeholders(text),
            "x <!--WIKICODE-deadbeef-0--> &amp; y"
        );
    }

    #[test]
    fn test_unescape_html_reverses_escaping() {
        let text = r#"a < b & "c" 'd' &lt;"#;
        assert_eq!(unescape_html(&escape_html(text)), text);
    }

    #[test]
    fn test_html_comment_cannot_be_closed_early() {
        assert_eq!(html_comment("x --> <b>"), "<!-- x --&gt; <b&gt; -->");
    }

    #[test]
    fn test_hash_parts_is_stable_and_separated() {
        assert_eq!(hash_parts(&["ab", "c"]), hash_parts(&["ab", "c"]));
        assert_ne!(hash_parts(&["ab", "c"]), hash_parts(&["a", "bc"]));
        assert_eq!(hash_parts(&["x"]).len(), 64);
    }
}
