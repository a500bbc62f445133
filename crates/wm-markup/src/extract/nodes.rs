//! Replacement nodes for extracted elements.

use std::panic::{AssertUnwindSafe, catch_unwind};

use crate::cache::RegionHandle;
use crate::context::{ParseContext, PluginError};
use crate::extract::{Element, ExtractedElement, LinkResolver, PluginParams};
use crate::util::{escape_html, panic_message};

/// Failure building the node for one extracted element.
#[derive(Debug, thiserror::Error)]
pub enum ElementError {
    /// A plugin was invoked but no executor is configured.
    #[error("No plugin executor available for '{0}'")]
    NoPluginExecutor(String),

    #[error(transparent)]
    Plugin(#[from] PluginError),

    /// A collaborator panicked while building the node.
    #[error("{name} panicked: {message}")]
    Panicked { name: String, message: String },
}

/// Inline marker shown in place of a construct that failed to render.
pub(crate) fn error_marker(message: &str) -> String {
    format!(
        r#"<span class="wiki-error">[Error: {}]</span>"#,
        escape_html(message)
    )
}

/// Builds HTML for extracted elements.
pub(crate) struct NodeBuilder<'a> {
    links: &'a LinkResolver,
    variables: &'a RegionHandle,
}

impl<'a> NodeBuilder<'a> {
    pub(crate) fn new(links: &'a LinkResolver, variables: &'a RegionHandle) -> Self {
        Self { links, variables }
    }

    pub(crate) fn build(
        &self,
        element: &ExtractedElement,
        ctx: &ParseContext,
    ) -> Result<String, ElementError> {
        match &element.element {
            Element::Variable { name } => Ok(self
                .resolve_variable(name, ctx)
                .map_or_else(|| escape_html(&element.raw), |value| escape_html(&value))),
            Element::Plugin { name, params } => execute_plugin(name, params, ctx),
            Element::Link { text, target } => Ok(self.links.render(text, target, ctx)),
            Element::Escaped { literal } => Ok(escape_html(literal)),
        }
    }

    /// Resolve a variable through the cache, the resolver, then built-ins.
    pub(crate) fn resolve_variable(&self, name: &str, ctx: &ParseContext) -> Option<String> {
        let key = format!("var:{name}:{}", ctx.context_hash());
        if let Some(value) = self.variables.get_string(&key) {
            return Some(value);
        }

        let resolved = ctx.services().variables().and_then(|resolver| {
            catch_unwind(AssertUnwindSafe(|| resolver.resolve(name, ctx))).unwrap_or_else(
                |payload| {
                    tracing::warn!(
                        variable = name,
                        error = %panic_message(payload.as_ref()),
                        "Variable resolver panicked"
                    );
                    None
                },
            )
        });
        let value = resolved.or_else(|| builtin_variable(name, ctx))?;
        self.variables.set_string(&key, &value);
        Some(value)
    }
}

/// Variables available without a resolver.
fn builtin_variable(name: &str, ctx: &ParseContext) -> Option<String> {
    match name.to_ascii_lowercase().as_str() {
        "pagename" => Some(ctx.page_name().to_owned()),
        "username" => Some(ctx.user_name().unwrap_or("anonymous").to_owned()),
        _ => None,
    }
}

fn execute_plugin(
    name: &str,
    params: &PluginParams,
    ctx: &ParseContext,
) -> Result<String, ElementError> {
    let executor = ctx
        .services()
        .plugins()
        .ok_or_else(|| ElementError::NoPluginExecutor(name.to_owned()))?;
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        executor.execute(name, ctx.page_name(), params, ctx)
    }))
    .map_err(|payload| ElementError::Panicked {
        name: name.to_owned(),
        message: panic_message(payload.as_ref()),
    })?;
    Ok(outcome?)
}
