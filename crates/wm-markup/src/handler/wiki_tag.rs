//! `<wiki:If>`, `<wiki:UserCheck>` and `<wiki:Include>` tags.

use std::sync::{Arc, LazyLock};

use regex::{Captures, Regex};
use wm_config::Config;

use super::{HandlerError, SyntaxHandler};
use crate::context::ParseContext;
use crate::report::Phase;
use crate::util::html_comment;

pub(crate) const ID: &str = "wiki_tag";

/// Opening, closing or self-closing wiki tag. Attribute values are quoted and
/// may contain `>`.
static TAG_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"<(/?)wiki:(\w+)((?:\s+[\w-]+\s*=\s*(?:"[^"]*"|'[^']*'))*)\s*(/?)>"#).unwrap()
});

static ATTRIBUTE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"([\w-]+)\s*=\s*(?:"([^"]*)"|'([^']*)')"#).unwrap());

static HEADING_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(#{1,6})\s*(.+?)\s*$").unwrap());

/// `$name == 'value'` or `$name != 'value'`.
static COMPARISON_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"^\$(\w+)\s*(==|!=)\s*['"](.*)['"]$"#).unwrap());

/// Permission checked against the policy service before a page is included.
pub const INCLUDE_PERMISSION: &str = "page:read";

/// Render metadata entry listing the user's roles and groups, comma separated.
pub const ROLES_METADATA: &str = "roles";

/// Pages that may be included inside one another.
const MAX_INCLUDE_DEPTH: usize = 10;

struct Tag<'a> {
    name: &'a str,
    attributes: Vec<(String, String)>,
    /// Content between the tags, `None` for a self-closing tag.
    body: Option<&'a str>,
}

impl Tag<'_> {
    fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

fn parse_attributes(text: &str) -> Vec<(String, String)> {
    ATTRIBUTE_RE
        .captures_iter(text)
        .map(|caps| {
            let value = caps.get(2).or_else(|| caps.get(3)).map_or("", |m| m.as_str());
            (caps[1].to_owned(), value.to_owned())
        })
        .collect()
}

/// Byte offsets of the body end and of the end of the tag closing `name`,
/// skipping nested tags of the same name.
fn find_close(text: &str, name: &str) -> Option<(usize, usize)> {
    let mut depth = 0usize;
    for caps in TAG_RE.captures_iter(text) {
        if &caps[2] != name {
            continue;
        }
        let m = caps.get(0)?;
        if !caps[1].is_empty() {
            if depth == 0 {
                return Some((m.start(), m.end()));
            }
            depth -= 1;
        } else if caps[4].is_empty() {
            depth += 1;
        }
    }
    None
}

fn failed(message: impl Into<String>) -> HandlerError {
    HandlerError::Failed(message.into())
}

/// Conditional content and page inclusion.
///
/// Runs before extraction, so kept content and included pages go through
/// every later phase like the rest of the page. Conditions see the user,
/// page and metadata of the render and consult the policy, page index and
/// variable services. Roles come from the [`ROLES_METADATA`] entry.
///
/// A tag that cannot be rendered becomes an HTML comment naming the problem.
#[derive(Debug, Clone, Copy, Default)]
pub struct WikiTagHandler;

impl WikiTagHandler {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Replace every complete tag in `content`. `stack` holds the pages being
    /// included, outermost first.
    fn expand(&self, content: &str, ctx: &ParseContext, stack: &mut Vec<String>) -> String {
        let mut out = String::with_capacity(content.len());
        let mut rest = content;

        while let Some(caps) = TAG_RE.captures(rest) {
            let Some(m) = caps.get(0) else {
                break;
            };
            out.push_str(&rest[..m.start()]);
            let after = &rest[m.end()..];
            let name = caps.get(2).map_or("", |n| n.as_str());

            let (body, consumed) = if !caps[1].is_empty() {
                (None, None)
            } else if caps[4].is_empty() {
                match find_close(after, name) {
                    Some((body_end, close_end)) => (Some(&after[..body_end]), Some(close_end)),
                    None => (None, None),
                }
            } else {
                (None, Some(0))
            };

            // Stray closing tags and unclosed opening tags stay as written.
            let Some(consumed) = consumed else {
                out.push_str(m.as_str());
                rest = after;
                continue;
            };

            let tag = Tag {
                name,
                attributes: parse_attributes(&caps[3]),
                body,
            };
            match self.render(&tag, ctx, stack) {
                Ok(html) => out.push_str(&html),
                Err(e) => {
                    tracing::warn!(tag = name, page = ctx.page_name(), error = %e, "Wiki tag failed");
                    out.push_str(&html_comment(&format!("WikiTag Error: {name} - {e}")));
                }
            }
            rest = &after[consumed..];
        }

        out.push_str(rest);
        out
    }

    fn render(
        &self,
        tag: &Tag<'_>,
        ctx: &ParseContext,
        stack: &mut Vec<String>,
    ) -> Result<String, HandlerError> {
        match tag.name {
            "If" => {
                let Some(body) = tag.body else {
                    return Ok(String::new());
                };
                let test = tag
                    .attribute("test")
                    .ok_or_else(|| failed("wiki:If requires a \"test\" attribute"))?;
                Ok(if evaluate(test, ctx) {
                    self.expand(body, ctx, stack)
                } else {
                    String::new()
                })
            }
            "UserCheck" => {
                let Some(body) = tag.body else {
                    return Ok(String::new());
                };
                Ok(if user_check(tag, ctx) {
                    self.expand(body, ctx, stack)
                } else {
                    String::new()
                })
            }
            "Include" => self.include(tag, ctx, stack),
            other => Err(failed(format!("Unsupported wiki tag: {other}"))),
        }
    }

    fn include(
        &self,
        tag: &Tag<'_>,
        ctx: &ParseContext,
        stack: &mut Vec<String>,
    ) -> Result<String, HandlerError> {
        let page = tag
            .attribute("page")
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .ok_or_else(|| failed("wiki:Include requires a \"page\" attribute"))?;

        if let Some(policy) = ctx.services().policy()
            && !policy.check_permission(ctx.user_name(), INCLUDE_PERMISSION, page)
        {
            return Err(failed(format!("Access denied to include page: {page}")));
        }
        if stack.iter().any(|p| p == page) {
            return Err(failed(format!("Recursive inclusion of page: {page}")));
        }
        if stack.len() > MAX_INCLUDE_DEPTH {
            return Err(failed(format!(
                "Inclusions nested deeper than {MAX_INCLUDE_DEPTH} pages"
            )));
        }

        let Some(source) = ctx.services().pages().and_then(|p| p.content(page)) else {
            return Ok(html_comment(&format!("Page not found: {page}")));
        };
        let source = match tag.attribute("section") {
            Some(section) => match extract_section(&source, section) {
                Some(text) => text,
                None => return Ok(html_comment(&format!("Section not found: {section}"))),
            },
            None => source,
        };

        tracing::debug!(page, into = ctx.page_name(), "Including page");
        stack.push(page.to_owned());
        let expanded = self.expand(&source, ctx, stack);
        stack.pop();
        Ok(expanded)
    }
}

pub(crate) fn factory(_config: &Config) -> Arc<dyn SyntaxHandler> {
    Arc::new(WikiTagHandler::new())
}

/// Evaluate a `wiki:If` test. `||` binds looser than `&&`; unknown conditions
/// are false.
fn evaluate(condition: &str, ctx: &ParseContext) -> bool {
    let condition = condition.trim();
    if condition.contains("||") {
        return condition.split("||").any(|part| evaluate(part, ctx));
    }
    if condition.contains("&&") {
        return condition.split("&&").all(|part| evaluate(part, ctx));
    }

    let authenticated = ctx.user_name().is_some();
    match condition {
        "true" => return true,
        "false" => return false,
        "authenticated" => return authenticated,
        "anonymous" => return !authenticated,
        _ => {}
    }

    if let Some(action) = condition.strip_prefix("hasPermission:") {
        return ctx
            .services()
            .policy()
            .is_none_or(|p| p.check_permission(ctx.user_name(), action.trim(), ctx.page_name()));
    }
    if let Some(page) = condition.strip_prefix("exists:") {
        return ctx.services().pages().is_none_or(|p| p.exists(page.trim()));
    }
    if let Some(caps) = COMPARISON_RE.captures(condition) {
        let equal = variable(&caps[1], ctx) == caps[3];
        return if &caps[2] == "==" { equal } else { !equal };
    }

    tracing::warn!(condition, "Unknown wiki:If condition");
    false
}

fn variable(name: &str, ctx: &ParseContext) -> String {
    match name {
        "user" | "username" => ctx.user_name().unwrap_or("anonymous").to_owned(),
        "page" | "pagename" => ctx.page_name().to_owned(),
        "authenticated" => ctx.user_name().is_some().to_string(),
        _ => ctx
            .services()
            .variables()
            .and_then(|v| v.resolve(name, ctx))
            .unwrap_or_default(),
    }
}

fn has_role(ctx: &ParseContext, role: &str) -> bool {
    ctx.user_name().is_some()
        && ctx
            .metadata()
            .get(ROLES_METADATA)
            .is_some_and(|roles| roles.split(',').any(|r| r.trim() == role))
}

/// Every given attribute must hold; a tag without any never shows its content.
fn user_check(tag: &Tag<'_>, ctx: &ParseContext) -> bool {
    let authenticated = ctx.user_name().is_some();
    let checks = [
        tag.attribute("status").map(|status| match status {
            "authenticated" => authenticated,
            "anonymous" => !authenticated,
            _ => false,
        }),
        tag.attribute("role").map(|role| has_role(ctx, role)),
        tag.attribute("group").map(|group| has_role(ctx, group)),
        tag.attribute("user").map(|user| ctx.user_name() == Some(user)),
    ];
    let mut given = checks.into_iter().flatten().peekable();
    given.peek().is_some() && given.all(|ok| ok)
}

/// Lines from the heading titled `name` (case-insensitive) up to the next
/// heading of the same or a higher level.
fn extract_section(source: &str, name: &str) -> Option<String> {
    let lines: Vec<&str> = source.lines().collect();
    let (start, level) = lines.iter().enumerate().find_map(|(i, line)| {
        let caps = HEADING_RE.captures(line)?;
        caps[2]
            .eq_ignore_ascii_case(name.trim())
            .then(|| (i, caps[1].len()))
    })?;
    let end = lines[start + 1..]
        .iter()
        .position(|line| HEADING_RE.captures(line).is_some_and(|caps| caps[1].len() <= level))
        .map_or(lines.len(), |offset| start + 1 + offset);
    Some(lines[start..end].join("\n"))
}

impl SyntaxHandler for WikiTagHandler {
    fn id(&self) -> &str {
        ID
    }

    fn pattern(&self) -> &Regex {
        &TAG_RE
    }

    fn priority(&self) -> u32 {
        95
    }

    fn phase(&self) -> Phase {
        Phase::Preprocess
    }

    /// Render a single tag without content. Paired tags need the surrounding
    /// text and go through [`process`](Self::process).
    fn handle(&self, caps: &Captures<'_>, ctx: &ParseContext) -> Result<String, HandlerError> {
        if !caps[1].is_empty() {
            return Err(failed(format!("Unexpected closing tag wiki:{}", &caps[2])));
        }
        let tag = Tag {
            name: caps.get(2).map_or("", |n| n.as_str()),
            attributes: parse_attributes(&caps[3]),
            body: None,
        };
        self.render(&tag, ctx, &mut vec![ctx.page_name().to_owned()])
    }

    fn process(&self, content: &str, ctx: &ParseContext) -> Result<String, HandlerError> {
        let mut stack = vec![ctx.page_name().to_owned()];
        Ok(self.expand(content, ctx, &mut stack))
    }
}
