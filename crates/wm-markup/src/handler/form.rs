//! `[{FormOpen}]` … `[{FormClose}]` wiki forms.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Range;
use std::sync::{Arc, LazyLock};

use rand::RngExt;
use regex::{Captures, Regex};
use wm_config::Config;

use super::{HandlerError, SyntaxHandler};
use crate::context::ParseContext;
use crate::report::Phase;
use crate::util::{escape_html, hash_parts, html_comment, unescape_html};

pub(crate) const ID: &str = "form";

static FORM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[\{Form(Open|Input|Select|Textarea|Button|Close)\b([^}]*)\}\]").unwrap()
});

/// Paragraph holding nothing but form elements.
static FORM_PARAGRAPH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<p>((?:\s*\[\{Form(?:Open|Input|Select|Textarea|Button|Close)\b[^}]*\}\])+)\s*</p>")
        .unwrap()
});

static CODE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<(code|pre)\b[^>]*>.*?</(?:code|pre)>").unwrap());

static PARAM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(\w+)=(?:'([^']*)'|"([^"]*)"|(\S+))"#).unwrap());

static SCHEME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*([A-Za-z][A-Za-z0-9+.-]*):").unwrap());

/// Where forms post to unless they name an action.
pub const DEFAULT_ACTION: &str = "/api/forms/submit";

const INPUT_TYPES: &[&str] = &[
    "text", "password", "email", "number", "date", "hidden", "checkbox", "radio", "file",
];

const BUTTON_TYPES: &[&str] = &["button", "submit", "reset"];

/// `key=value` parameters of one form element. Values may be quoted with
/// single or double quotes.
#[derive(Debug, Default)]
struct FormParams(BTreeMap<String, String>);

impl FormParams {
    fn parse(text: &str) -> Self {
        Self(
            PARAM_RE
                .captures_iter(text)
                .map(|caps| {
                    let value = caps
                        .get(2)
                        .or_else(|| caps.get(3))
                        .or_else(|| caps.get(4))
                        .map_or("", |m| m.as_str());
                    (caps[1].to_owned(), value.to_owned())
                })
                .collect(),
        )
    }

    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str).filter(|v| !v.is_empty())
    }

    fn flag(&self, key: &str) -> bool {
        self.get(key) == Some("true")
    }

    /// Required `name` of a field element.
    fn name(&self, element: &str) -> Result<&str, HandlerError> {
        self.get("name")
            .ok_or_else(|| HandlerError::Failed(format!("{element} requires a \"name\" parameter")))
    }

    fn label(&self, name: &str) -> String {
        self.get("label").map_or_else(|| capitalize(name), str::to_owned)
    }
}

fn capitalize(text: &str) -> String {
    let mut chars = text.chars();
    chars.next().map_or_else(String::new, |first| {
        first.to_uppercase().chain(chars).collect()
    })
}

/// ` name="value"` when the parameter is given.
fn optional(params: &FormParams, key: &str) -> String {
    params
        .get(key)
        .map(|value| format!(r#" {key}="{}""#, escape_html(value)))
        .unwrap_or_default()
}

fn required(params: &FormParams) -> &'static str {
    if params.flag("required") { " required" } else { "" }
}

/// Builds HTML forms from wiki form elements.
///
/// Runs after the HTML sanitizing pass, so the generated form markup is kept
/// while forms written as raw HTML are still removed. Every value is escaped
/// and form actions are limited to relative, `http` and `https` URLs.
///
/// `[{FormOpen}]` adds hidden `_formId`, `_pageName` and `_csrfToken` fields.
/// The token is derived from a secret generated when the handler is built,
/// see [`verify_token`](Self::verify_token).
#[derive(Clone)]
pub struct WikiFormHandler {
    secret: String,
}

impl fmt::Debug for WikiFormHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WikiFormHandler").finish_non_exhaustive()
    }
}

impl Default for WikiFormHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl WikiFormHandler {
    #[must_use]
    pub fn new() -> Self {
        Self {
            secret: hex::encode(rand::rng().random::<[u8; 16]>()),
        }
    }

    /// Request token embedded in form `form_id` on `page` for `user`.
    #[must_use]
    pub fn token(&self, user: Option<&str>, page: &str, form_id: &str) -> String {
        let mut token = hash_parts(&[&self.secret, user.unwrap_or(""), page, form_id]);
        token.truncate(32);
        token
    }

    /// Whether `token` was issued by this handler for the submitted form.
    #[must_use]
    pub fn verify_token(&self, token: &str, user: Option<&str>, page: &str, form_id: &str) -> bool {
        self.token(user, page, form_id) == token
    }

    fn element(&self, caps: &Captures<'_>, form: usize, ctx: &ParseContext) -> Result<String, HandlerError> {
        let params = FormParams::parse(&unescape_html(&caps[2]));
        match &caps[1] {
            "Open" => self.open(&params, form, ctx),
            "Input" => input(&params),
            "Select" => select(&params),
            "Textarea" => textarea(&params),
            "Button" => button(&params),
            "Close" => Ok("</form>".to_owned()),
            other => Err(HandlerError::Failed(format!("Unsupported form element: {other}"))),
        }
    }

    fn open(&self, params: &FormParams, form: usize, ctx: &ParseContext) -> Result<String, HandlerError> {
        let id = format!("wikiForm_{form}");
        let action = params.get("action").unwrap_or(DEFAULT_ACTION);
        if let Some(caps) = SCHEME_RE.captures(action)
            && !["http", "https"].contains(&caps[1].to_ascii_lowercase().as_str())
        {
            return Err(HandlerError::Failed(format!("Unsupported form action: {action}")));
        }
        let method = params.get("method").unwrap_or("POST").to_ascii_uppercase();
        if method != "POST" && method != "GET" {
            return Err(HandlerError::Failed(format!("Unsupported form method: {method}")));
        }
        let name = params.get("name").unwrap_or(&id);
        let class = params.get("class").unwrap_or("wiki-form");
        let token = self.token(ctx.user_name(), ctx.page_name(), &id);

        Ok(format!(
            "<form id=\"{id}\" name=\"{}\" action=\"{}\" method=\"{method}\" class=\"{}\">\n\
             <input type=\"hidden\" name=\"_formId\" value=\"{id}\">\n\
             <input type=\"hidden\" name=\"_csrfToken\" value=\"{token}\">\n\
             <input type=\"hidden\" name=\"_pageName\" value=\"{}\">",
            escape_html(name),
            escape_html(action),
            escape_html(class),
            escape_html(ctx.page_name()),
        ))
    }
}

fn input(params: &FormParams) -> Result<String, HandlerError> {
    let name = params.name("FormInput")?;
    let kind = params.get("type").unwrap_or("text");
    if !INPUT_TYPES.contains(&kind) {
        return Err(HandlerError::Failed(format!("Invalid input type: {kind}")));
    }
    let id = params.get("id").map_or_else(|| format!("input_{name}"), str::to_owned);
    let class = params.get("class").unwrap_or("form-control");

    let mut html = String::from("<div class=\"mb-3\">");
    if kind != "hidden" {
        html.push_str(&format!(
            "<label for=\"{}\" class=\"form-label\">{}</label>",
            escape_html(&id),
            escape_html(&params.label(name))
        ));
    }
    html.push_str(&format!(
        "<input type=\"{kind}\" id=\"{}\" name=\"{}\" class=\"{}\"",
        escape_html(&id),
        escape_html(name),
        escape_html(class)
    ));
    html.push_str(&optional(params, "value"));
    html.push_str(&optional(params, "placeholder"));
    html.push_str(required(params));
    match kind {
        "number" => {
            for key in ["min", "max", "step"] {
                html.push_str(&optional(params, key));
            }
        }
        "file" => {
            html.push_str(&optional(params, "accept"));
            if params.flag("multiple") {
                html.push_str(" multiple");
            }
        }
        _ => {}
    }
    html.push('>');
    if kind != "hidden" {
        html.push_str("<div class=\"invalid-feedback\"></div>");
    }
    html.push_str("</div>");
    Ok(html)
}

fn select(params: &FormParams) -> Result<String, HandlerError> {
    let name = params.name("FormSelect")?;
    let id = params.get("id").map_or_else(|| format!("select_{name}"), str::to_owned);
    let class = params.get("class").unwrap_or("form-select");
    let label = params.label(name);
    let selected = params.get("selected");

    let mut html = format!(
        "<div class=\"mb-3\"><label for=\"{id}\" class=\"form-label\">{}</label>\
         <select id=\"{id}\" name=\"{}\" class=\"{}\"{}>",
        escape_html(&label),
        escape_html(name),
        escape_html(class),
        required(params),
        id = escape_html(&id),
    );
    if !params.flag("required") {
        html.push_str(&format!(
            "<option value=\"\">-- Select {} --</option>",
            escape_html(&label)
        ));
    }
    for option in params
        .get("options")
        .unwrap_or("")
        .split(',')
        .map(str::trim)
        .filter(|o| !o.is_empty())
    {
        let marker = if selected == Some(option) { " selected" } else { "" };
        let option = escape_html(option);
        html.push_str(&format!("<option value=\"{option}\"{marker}>{option}</option>"));
    }
    html.push_str("</select><div class=\"invalid-feedback\"></div></div>");
    Ok(html)
}

fn textarea(params: &FormParams) -> Result<String, HandlerError> {
    let name = params.name("FormTextarea")?;
    let id = params.get("id").map_or_else(|| format!("textarea_{name}"), str::to_owned);
    let class = params.get("class").unwrap_or("form-control");
    let rows = params.get("rows").unwrap_or("3");
    if !rows.bytes().all(|b| b.is_ascii_digit()) {
        return Err(HandlerError::Failed(format!("Invalid rows: {rows}")));
    }

    Ok(format!(
        "<div class=\"mb-3\"><label for=\"{id}\" class=\"form-label\">{}</label>\
         <textarea id=\"{id}\" name=\"{}\" class=\"{}\" rows=\"{rows}\"{}{}{}>{}</textarea>\
         <div class=\"invalid-feedback\"></div></div>",
        escape_html(&params.label(name)),
        escape_html(name),
        escape_html(class),
        optional(params, "cols"),
        optional(params, "placeholder"),
        required(params),
        escape_html(params.get("value").unwrap_or("")),
        id = escape_html(&id),
    ))
}

fn button(params: &FormParams) -> Result<String, HandlerError> {
    let kind = params.get("type").unwrap_or("button");
    if !BUTTON_TYPES.contains(&kind) {
        return Err(HandlerError::Failed(format!("Invalid button type: {kind}")));
    }
    let class = params.get("class").map_or_else(
        || {
            let tone = if kind == "submit" { "btn-primary" } else { "btn-secondary" };
            format!("btn {tone}")
        },
        str::to_owned,
    );
    let disabled = if params.flag("disabled") { " disabled" } else { "" };
    Ok(format!(
        "<button type=\"{kind}\"{} class=\"{}\"{disabled}>{}</button>",
        optional(params, "id"),
        escape_html(&class),
        escape_html(params.get("value").unwrap_or("Button"))
    ))
}

fn inside(ranges: &[Range<usize>], at: usize) -> bool {
    ranges.iter().any(|r| r.contains(&at))
}

pub(crate) fn factory(_config: &Config) -> Arc<dyn SyntaxHandler> {
    Arc::new(WikiFormHandler::new())
}

impl SyntaxHandler for WikiFormHandler {
    fn id(&self) -> &str {
        ID
    }

    fn pattern(&self) -> &Regex {
        &FORM_RE
    }

    fn priority(&self) -> u32 {
        85
    }

    fn phase(&self) -> Phase {
        Phase::PostProcess
    }

    fn reserved_plugins(&self) -> &[&'static str] {
        &[
            "FormOpen",
            "FormInput",
            "FormSelect",
            "FormTextarea",
            "FormButton",
            "FormClose",
        ]
    }

    fn handle(&self, caps: &Captures<'_>, ctx: &ParseContext) -> Result<String, HandlerError> {
        self.element(caps, 1, ctx)
    }

    /// Replace every form element outside code. Forms are numbered in order;
    /// an element that cannot be built becomes an HTML comment.
    fn process(&self, content: &str, ctx: &ParseContext) -> Result<String, HandlerError> {
        let content = FORM_PARAGRAPH_RE.replace_all(content, "$1");
        let code: Vec<Range<usize>> = CODE_RE.find_iter(&content).map(|m| m.range()).collect();

        let mut out = String::with_capacity(content.len());
        let mut last = 0;
        let mut forms = 0;
        for caps in FORM_RE.captures_iter(&content) {
            let Some(m) = caps.get(0) else {
                continue;
            };
            if inside(&code, m.start()) {
                continue;
            }
            out.push_str(&content[last..m.start()]);
            if &caps[1] == "Open" {
                forms += 1;
            }
            match self.element(&caps, forms.max(1), ctx) {
                Ok(html) => out.push_str(&html),
                Err(e) => {
                    tracing::warn!(element = &caps[1], page = ctx.page_name(), error = %e, "Form element failed");
                    out.push_str(&html_comment(&format!("Form Error: {} - {e}", &caps[1])));
                }
            }
            last = m.end();
        }
        out.push_str(&content[last..]);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::context::{RenderContext, Services};

    fn ctx(user: Option<&str>) -> ParseContext {
        let mut render = RenderContext::new("Sign Up");
        if let Some(user) = user {
            render = render.with_user(user);
        }
        ParseContext::new(&render, Arc::new(Services::new()), 0)
    }

    fn render(text: &str) -> String {
        WikiFormHandler::new().process(text, &ctx(None)).unwrap()
    }

    #[test]
    fn test_form_open_adds_hidden_fields() {
        let handler = WikiFormHandler::new();
        let html = handler
            .process("[{FormOpen action='/save' method='post'}]", &ctx(Some("Ada")))
            .unwrap();
        let token = handler.token(Some("Ada"), "Sign Up", "wikiForm_1");
        assert_eq!(
            html,
            format!(
                "<form id=\"wikiForm_1\" name=\"wikiForm_1\" action=\"/save\" method=\"POST\" \
                 class=\"wiki-form\">\n\
                 <input type=\"hidden\" name=\"_formId\" value=\"wikiForm_1\">\n\
                 <input type=\"hidden\" name=\"_csrfToken\" value=\"{token}\">\n\
                 <input type=\"hidden\" name=\"_pageName\" value=\"Sign Up\">"
            )
        );
    }

    #[test]
    fn test_form_open_defaults() {
        let html = render("[{FormOpen}]");
        assert!(html.starts_with(
            "<form id=\"wikiForm_1\" name=\"wikiForm_1\" action=\"/api/forms/submit\" method=\"POST\""
        ));
    }

    #[test]
    fn test_forms_numbered_in_order() {
        let html = render("[{FormOpen}][{FormClose}][{FormOpen name=second}][{FormClose}]");
        assert!(html.contains("id=\"wikiForm_1\""));
        assert!(html.contains("<form id=\"wikiForm_2\" name=\"second\""));
    }

    #[test]
    fn test_token_bound_to_user_page_and_form() {
        let handler = WikiFormHandler::new();
        let token = handler.token(Some("Ada"), "Main", "wikiForm_1");
        assert_eq!(token.len(), 32);
        assert!(handler.verify_token(&token, Some("Ada"), "Main", "wikiForm_1"));
        assert!(!handler.verify_token(&token, None, "Main", "wikiForm_1"));
        assert!(!handler.verify_token(&token, Some("Ada"), "Other", "wikiForm_1"));
        assert!(!WikiFormHandler::new().verify_token(&token, Some("Ada"), "Main", "wikiForm_1"));
    }

    #[test]
    fn test_unsafe_action_and_method_rejected() {
        assert_eq!(
            render("[{FormOpen action='javascript:alert(1)'}]"),
            "<!-- Form Error: Open - Unsupported form action: javascript:alert(1) -->"
        );
        assert_eq!(
            render("[{FormOpen method=delete}]"),
            "<!-- Form Error: Open - Unsupported form method: DELETE -->"
        );
        assert!(render("[{FormOpen action='https://example.com/f'}]").contains("action=\"https://example.com/f\""));
    }

    #[test]
    fn test_input_escapes_values() {
        assert_eq!(
            render(r#"[{FormInput name='email' type='email' value='a"<b' required='true'}]"#),
            "<div class=\"mb-3\"><label for=\"input_email\" class=\"form-label\">Email</label>\
             <input type=\"email\" id=\"input_email\" name=\"email\" class=\"form-control\" \
             value=\"a&quot;&lt;b\" required><div class=\"invalid-feedback\"></div></div>"
        );
    }

    #[test]
    fn test_hidden_and_number_inputs() {
        assert_eq!(
            render("[{FormInput name=ref type=hidden value=42}]"),
            "<div class=\"mb-3\"><input type=\"hidden\" id=\"input_ref\" name=\"ref\" \
             class=\"form-control\" value=\"42\"></div>"
        );
        let number = render("[{FormInput name=age type=number min=0 max=120}]");
        assert!(number.contains(" min=\"0\" max=\"120\">"));
    }

    #[test]
    fn test_invalid_inputs_become_comments() {
        assert_eq!(
            render("[{FormInput type=text}]"),
            "<!-- Form Error: Input - FormInput requires a \"name\" parameter -->"
        );
        assert_eq!(
            render("[{FormInput name=x type=script}]"),
            "<!-- Form Error: Input - Invalid input type: script -->"
        );
    }

    #[test]
    fn test_select_options() {
        assert_eq!(
            render("[{FormSelect name=size options='S, M ,L' selected=M label='Shirt size'}]"),
            "<div class=\"mb-3\"><label for=\"select_size\" class=\"form-label\">Shirt size</label>\
             <select id=\"select_size\" name=\"size\" class=\"form-select\">\
             <option value=\"\">-- Select Shirt size --</option>\
             <option value=\"S\">S</option><option value=\"M\" selected>M</option>\
             <option value=\"L\">L</option></select>\
             <div class=\"invalid-feedback\"></div></div>"
        );
        assert!(!render("[{FormSelect name=x options=a required=true}]").contains("-- Select"));
    }

    #[test]
    fn test_textarea_defaults() {
        assert_eq!(
            render("[{FormTextarea name=comment value='<hi>'}]"),
            "<div class=\"mb-3\"><label for=\"textarea_comment\" class=\"form-label\">Comment</label>\
             <textarea id=\"textarea_comment\" name=\"comment\" class=\"form-control\" rows=\"3\">\
             &lt;hi&gt;</textarea><div class=\"invalid-feedback\"></div></div>"
        );
    }

    #[test]
    fn test_buttons() {
        assert_eq!(
            render("[{FormButton type=submit value=Save}]"),
            "<button type=\"submit\" class=\"btn btn-primary\">Save</button>"
        );
        assert_eq!(
            render("[{FormButton disabled=true}]"),
            "<button type=\"button\" class=\"btn btn-secondary\" disabled>Button</button>"
        );
    }

    #[test]
    fn test_converted_paragraph_unwrapped() {
        let html = render("<p>[{FormOpen}]\n[{FormInput name=&quot;title&quot;}]\n[{FormClose}]</p>");
        assert!(html.starts_with("<form id=\"wikiForm_1\""));
        assert!(html.contains("name=\"title\""));
        assert!(html.ends_with("</form>"));
        assert!(!html.contains("<p>"));
    }

    #[test]
    fn test_elements_in_code_left_alone() {
        let text = "<pre><code>[{FormClose}]</code></pre><p>x [{FormClose}]</p>";
        assert_eq!(render(text), "<pre><code>[{FormClose}]</code></pre><p>x </form></p>");
    }

    #[test]
    fn test_reserves_form_plugins() {
        let handler = WikiFormHandler::new();
        assert_eq!(handler.reserved_plugins().len(), 6);
        assert_eq!(handler.phase(), Phase::PostProcess);
        assert_eq!(handler.priority(), 85);
    }
}
