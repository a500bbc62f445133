//! `[{ATTACH file|display|params}]` attachment references.

use std::sync::{Arc, LazyLock};

use percent_encoding::utf8_percent_encode;
use regex::{Captures, Regex};
use wm_config::Config;

use super::{HandlerError, SyntaxHandler};
use crate::context::ParseContext;
use crate::extract::{COMPONENT, PluginParams, error_marker};
use crate::util::escape_html;

pub(crate) const ID: &str = "attachment";

static ATTACH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[\{ATTACH\s+([^|}\]]+)(?:\|([^|}\]]+))?(?:\|([^}\]]+))?\}\]").unwrap()
});

static EXTRA_CLASS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z][\w-]*$").unwrap());

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp", "svg", "bmp"];

/// Permission checked against the policy service before linking a file.
pub const READ_PERMISSION: &str = "attachment:read";

/// Links or embeds files attached to the current page.
///
/// Images are embedded, other files linked. When a [`PolicyChecker`] is
/// configured the user must hold [`READ_PERMISSION`] on the file name.
///
/// [`PolicyChecker`]: crate::PolicyChecker
#[derive(Debug, Clone)]
pub struct AttachmentHandler {
    base: String,
}

impl AttachmentHandler {
    /// Handler serving attachments below `base`, e.g. `/attachments/`.
    #[must_use]
    pub fn new(base: impl Into<String>) -> Self {
        Self { base: base.into() }
    }

    fn url(&self, page: &str, file: &str) -> String {
        format!(
            "{}{}/{}",
            self.base,
            utf8_percent_encode(page, COMPONENT),
            utf8_percent_encode(file, COMPONENT)
        )
    }
}

pub(crate) fn factory(config: &Config) -> Arc<dyn SyntaxHandler> {
    Arc::new(AttachmentHandler::new(config.links.attachment_base.clone()))
}

fn is_image(file: &str) -> bool {
    file.rsplit_once('.')
        .is_some_and(|(_, ext)| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
}

impl SyntaxHandler for AttachmentHandler {
    fn id(&self) -> &str {
        ID
    }

    fn pattern(&self) -> &Regex {
        &ATTACH_RE
    }

    fn priority(&self) -> u32 {
        75
    }

    fn reserved_plugins(&self) -> &[&'static str] {
        &["ATTACH"]
    }

    fn handle(&self, caps: &Captures<'_>, ctx: &ParseContext) -> Result<String, HandlerError> {
        let file = caps[1].trim();
        let display = caps.get(2).map_or(file, |m| m.as_str().trim());
        let params = caps
            .get(3)
            .map(|m| PluginParams::parse(m.as_str()))
            .unwrap_or_default();

        if let Some(policy) = ctx.services().policy()
            && !policy.check_permission(ctx.user_name(), READ_PERMISSION, file)
        {
            tracing::debug!(file, user = ?ctx.user_name(), "Attachment access denied");
            return Ok(error_marker(&format!("Access denied to attachment: {file}")));
        }

        let url = escape_html(&self.url(ctx.page_name(), file));
        let mut classes = vec![if is_image(file) {
            "attachment-image"
        } else {
            "attachment"
        }];
        if let Some(extra) = params.get("class").filter(|c| EXTRA_CLASS_RE.is_match(c)) {
            classes.push(extra);
        }
        let class = classes.join(" ");

        if is_image(file) {
            return Ok(format!(
                r#"<img class="{class}" src="{url}" alt="{}">"#,
                escape_html(display)
            ));
        }

        let target = if params.get("target") == Some("_blank") {
            r#" target="_blank" rel="noopener noreferrer""#
        } else {
            ""
        };
        Ok(format!(
            r#"<a class="{class}" href="{url}" title="{}"{target}>{}</a>"#,
            escape_html(file),
            escape_html(display)
        ))
    }
}
