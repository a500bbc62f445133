//! Wiki link classification and rendering.

use std::collections::BTreeMap;

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use wm_config::{InterWikiSite, LinksConfig};

use crate::context::ParseContext;
use crate::util::{escape_html, escape_preserving_placeholders};

/// Characters left unencoded in link targets, matching `encodeURIComponent`.
pub(crate) const COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

/// What a link target points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    /// A wiki page.
    Internal,
    /// An `http`, `https` or `ftp` URL.
    External,
    /// A page on a configured sister wiki (`Prefix:Page`).
    InterWiki,
    /// An email address.
    Email,
    /// An anchor on the current page.
    Anchor,
}

/// Renders `[text|target]` links to anchors.
#[derive(Debug, Clone)]
pub struct LinkResolver {
    page_base: String,
    edit_base: String,
    interwiki: BTreeMap<String, InterWikiSite>,
}

impl LinkResolver {
    #[must_use]
    pub fn new(config: &LinksConfig) -> Self {
        Self {
            page_base: config.page_base.clone(),
            edit_base: config.edit_base.clone(),
            interwiki: config
                .interwiki
                .iter()
                .filter(|(_, site)| site.enabled)
                .map(|(name, site)| (name.to_lowercase(), site.clone()))
                .collect(),
        }
    }

    /// Classify a link target.
    #[must_use]
    pub fn classify(&self, target: &str) -> LinkKind {
        let lower = target.to_ascii_lowercase();
        if target.starts_with('#') {
            LinkKind::Anchor
        } else if ["http://", "https://", "ftp://"]
            .iter()
            .any(|scheme| lower.starts_with(scheme))
        {
            LinkKind::External
        } else if lower.starts_with("mailto:") || is_bare_email(target) {
            LinkKind::Email
        } else if self.interwiki_site(target).is_some() {
            LinkKind::InterWiki
        } else {
            LinkKind::Internal
        }
    }

    /// Render a link with `text` (which may contain placeholders) to `target`.
    pub fn render(&self, text: &str, target: &str, ctx: &ParseContext) -> String {
        let target = target.trim();
        let label = escape_preserving_placeholders(text.trim());
        match self.classify(target) {
            LinkKind::Anchor => format!(
                r##"<a class="wiki-link anchor-link" href="#{}">{label}</a>"##,
                utf8_percent_encode(&target[1..], COMPONENT)
            ),
            LinkKind::External => format!(
                r#"<a class="wiki-link external-link" href="{}" target="_blank" rel="noopener noreferrer">{label}</a>"#,
                escape_html(target)
            ),
            LinkKind::Email => {
                let address = target
                    .strip_prefix("mailto:")
                    .or_else(|| target.strip_prefix("MAILTO:"))
                    .unwrap_or(target);
                format!(
                    r#"<a class="wiki-link email-link" href="mailto:{}">{label}</a>"#,
                    escape_html(address)
                )
            }
            LinkKind::InterWiki => self.render_interwiki(target, &label),
            LinkKind::Internal => self.render_internal(target, &label, ctx),
        }
    }

    /// Configured site for `Prefix:Page`, with the page part of `target`.
    fn interwiki_site<'a>(&'a self, target: &'a str) -> Option<(&'a InterWikiSite, &'a str)> {
        let (prefix, page) = target.split_once(':')?;
        if page.is_empty() || page.starts_with("//") {
            return None;
        }
        self.interwiki
            .get(&prefix.to_lowercase())
            .map(|site| (site, page))
    }

    fn render_interwiki(&self, target: &str, label: &str) -> String {
        let Some((site, page)) = self.interwiki_site(target) else {
            return label.to_owned();
        };
        let encoded = utf8_percent_encode(page, COMPONENT).to_string();
        let href = escape_html(&site.url.replace("%s", &encoded));
        if site.open_in_new_window {
            format!(
                r#"<a class="wiki-link interwiki" href="{href}" target="_blank" rel="noopener noreferrer">{label}</a>"#
            )
        } else {
            format!(r#"<a class="wiki-link interwiki" href="{href}">{label}</a>"#)
        }
    }

    fn render_internal(&self, page: &str, label: &str, ctx: &ParseContext) -> String {
        let encoded = utf8_percent_encode(page, COMPONENT);
        let exists = ctx.services().pages().is_none_or(|index| index.exists(page));
        if exists {
            format!(
                r#"<a class="wiki-link wikipage" href="{}{encoded}">{label}</a>"#,
                self.page_base
            )
        } else {
            format!(
                r#"<a class="wiki-link redlink" href="{}{encoded}" title="Create page: {}">{label}</a>"#,
                self.edit_base,
                escape_html(page)
            )
        }
    }
}

fn is_bare_email(target: &str) -> bool {
    let Some((local, domain)) = target.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && domain.contains('.')
        && !target.contains(char::is_whitespace)
        && !target.contains(['/', ':'])
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::context::{PageIndex, RenderContext, Services};

    struct OnlyMain;

    impl PageIndex for OnlyMain {
        fn exists(&self, name: &str) -> bool {
            name == "Main"
        }
    }

    fn ctx(services: Services) -> ParseContext {
        ParseContext::new(&RenderContext::new("Test"), Arc::new(services), 0)
    }

    fn resolver() -> LinkResolver {
        LinkResolver::new(&LinksConfig::default())
    }

    #[test]
    fn test_classify() {
        let r = resolver();
        assert_eq!(r.classify("Main"), LinkKind::Internal);
        assert_eq!(r.classify("https://example.com"), LinkKind::External);
        assert_eq!(r.classify("FTP://files.example.com"), LinkKind::External);
        assert_eq!(r.classify("mailto:ada@example.com"), LinkKind::Email);
        assert_eq!(r.classify("ada@example.com"), LinkKind::Email);
        assert_eq!(r.classify("#section"), LinkKind::Anchor);
        assert_eq!(r.classify("Wikipedia:Rust"), LinkKind::InterWiki);
        assert_eq!(r.classify("Unknown:Thing"), LinkKind::Internal);
        assert_eq!(r.classify("javascript:alert(1)"), LinkKind::Internal);
    }

    #[test]
    fn test_internal_link_without_index() {
        let html = resolver().render("Home page", "Main Page", &ctx(Services::new()));
        assert_eq!(
            html,
            r#"<a class="wiki-link wikipage" href="/wiki/Main%20Page">Home page</a>"#
        );
    }

    #[test]
    fn test_redlink_for_missing_page() {
        let services = Services::new().with_pages(Arc::new(OnlyMain));
        let html = resolver().render("Nope", "Nope", &ctx(services));
        assert_eq!(
            html,
            r#"<a class="wiki-link redlink" href="/edit/Nope" title="Create page: Nope">Nope</a>"#
        );
    }

    #[test]
    fn test_external_link_escapes_href() {
        let html = resolver().render("x", "https://example.com/?a=1&b=\"2\"", &ctx(Services::new()));
        assert!(html.contains(r#"href="https://example.com/?a=1&amp;b=&quot;2&quot;""#));
        assert!(html.contains(r#"rel="noopener noreferrer""#));
    }

    #[test]
    fn test_interwiki_link() {
        let html = resolver().render("Rust", "Wikipedia:Rust (language)", &ctx(Services::new()));
        assert!(html.contains(r#"href="https://en.wikipedia.org/wiki/Rust%20(language)""#));
        assert!(html.contains(r#"target="_blank""#));
    }

    #[test]
    fn test_interwiki_site_borrows_page_from_target() {
        let r = resolver();
        let page = {
            let target = String::from("wikipedia:Borrow checker");
            r.interwiki_site(&target).map(|(site, page)| {
                assert!(site.url.contains("wikipedia.org"));
                page.to_owned()
            })
        };
        assert_eq!(page.as_deref(), Some("Borrow checker"));
        assert!(r.interwiki_site("Wikipedia://host").is_none());
        assert!(r.interwiki_site("Wikipedia:").is_none());
    }

    #[test]
    fn test_javascript_target_becomes_page_name() {
        let html = resolver().render("x", "javascript:alert(1)", &ctx(Services::new()));
        assert!(html.contains(r#"href="/wiki/javascript%3Aalert(1)""#));
    }

    #[test]
    fn test_label_escaped_with_placeholder_kept() {
        let html = resolver().render("<b> <!--WIKI-0a1b2c3d-1-->", "Main", &ctx(Services::new()));
        assert!(html.contains("&lt;b&gt; <!--WIKI-0a1b2c3d-1-->"));
    }
}
