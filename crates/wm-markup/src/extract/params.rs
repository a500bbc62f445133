//! Plugin invocation parameter parsing.
//!
//! Parses the argument part of `[{Name key='value' key2=value2 flag}]`.

use serde::{Deserialize, Serialize};

/// Parameters of a plugin invocation, in source order.
///
/// # Example
///
/// ```
/// use wm_markup::PluginParams;
///
/// let params = PluginParams::parse(r#" max='5' title="Recent pages" compact"#);
/// assert_eq!(params.get("max"), Some("5"));
/// assert_eq!(params.get("title"), Some("Recent pages"));
/// assert_eq!(params.positional(), ["compact"]);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginParams {
    named: Vec<(String, String)>,
    positional: Vec<String>,
}

impl PluginParams {
    /// Parse a raw argument string.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        let mut params = Self::default();
        let mut remaining = raw.trim();

        while !remaining.is_empty() {
            if let Some((key, value, rest)) = parse_key_value(remaining) {
                params.named.push((key.to_owned(), value.to_owned()));
                remaining = rest.trim_start();
            } else {
                let end = remaining
                    .find(char::is_whitespace)
                    .unwrap_or(remaining.len());
                params.positional.push(remaining[..end].to_owned());
                remaining = remaining[end..].trim_start();
            }
        }

        params
    }

    /// Value of the first parameter named `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.named
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Named parameters in source order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.named.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Bare words without a value.
    #[must_use]
    pub fn positional(&self) -> &[String] {
        &self.positional
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.named.is_empty() && self.positional.is_empty()
    }

    /// Rewrite every value and bare word with `f`. Keys are left alone.
    pub(crate) fn map_values(&mut self, f: impl Fn(&str) -> String) {
        for (_, value) in &mut self.named {
            *value = f(value);
        }
        for word in &mut self.positional {
            *word = f(word);
        }
    }
}

/// Split a leading `key=value` pair off `s`.
///
/// Supports `key="value"`, `key='value'` and `key=value`. Returns `None` when
/// the first token has no `=`.
fn parse_key_value(s: &str) -> Option<(&str, &str, &str)> {
    let token_end = s.find(char::is_whitespace).unwrap_or(s.len());
    let eq_pos = s[..token_end].find('=')?;
    let key = &s[..eq_pos];
    if key.is_empty() {
        return None;
    }

    let after_eq = &s[eq_pos + 1..];
    for quote in ['"', '\''] {
        if let Some(stripped) = after_eq.strip_prefix(quote) {
            return match stripped.find(quote) {
                Some(end) => Some((key, &stripped[..end], &stripped[end + 1..])),
                None => Some((key, stripped, "")),
            };
        }
    }

    let end = after_eq.find(char::is_whitespace).unwrap_or(after_eq.len());
    Some((key, &after_eq[..end], &after_eq[end..]))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_empty_params() {
        let params = PluginParams::parse("   ");
        assert!(params.is_empty());
    }

    #[test]
    fn test_named_params_keep_order() {
        let params = PluginParams::parse("b=2 a='one two' c=\"3\"");
        let pairs: Vec<_> = params.iter().collect();
        assert_eq!(pairs, vec![("b", "2"), ("a", "one two"), ("c", "3")]);
    }

    #[test]
    fn test_unterminated_quote_takes_rest() {
        let params = PluginParams::parse("title='unfinished value");
        assert_eq!(params.get("title"), Some("unfinished value"));
    }

    #[test]
    fn test_positional_and_named_mix() {
        let params = PluginParams::parse("compact max=3 verbose");
        assert_eq!(params.get("max"), Some("3"));
        assert_eq!(params.positional(), ["compact", "verbose"]);
    }

    #[test]
    fn test_leading_equals_is_positional() {
        let params = PluginParams::parse("=oops");
        assert_eq!(params.positional(), ["=oops"]);
        assert_eq!(params.get(""), None);
    }
}
