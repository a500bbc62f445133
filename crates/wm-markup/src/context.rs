//! Render inputs, per-render state and collaborator interfaces.
//!
//! Everything the pipeline needs from the surrounding application is consumed
//! through the narrow traits defined here. All of them are optional: a pipeline
//! without a [`PluginExecutor`] renders plugin invocations as inline error
//! markers, one without a [`PageIndex`] treats every internal link as existing.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use crate::extract::PluginParams;
use crate::metrics::Alert;
use crate::report::RenderReport;
use crate::util::hash_parts;

/// Caller-supplied description of what is being rendered.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenderContext {
    /// Name of the page being rendered.
    pub page_name: String,
    /// Authenticated user, if any.
    pub user_name: Option<String>,
    /// Arbitrary request metadata, part of the cache fingerprint.
    pub metadata: BTreeMap<String, String>,
}

impl RenderContext {
    /// Context for rendering `page_name` anonymously.
    #[must_use]
    pub fn new(page_name: impl Into<String>) -> Self {
        Self {
            page_name: page_name.into(),
            ..Self::default()
        }
    }

    /// Set the rendering user.
    #[must_use]
    pub fn with_user(mut self, user_name: impl Into<String>) -> Self {
        self.user_name = Some(user_name.into());
        self
    }

    /// Add a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Resolves `[{$name}]` variable references.
pub trait VariableResolver: Send + Sync {
    /// Value of variable `name`, or `None` when unknown.
    fn resolve(&self, name: &str, ctx: &ParseContext) -> Option<String>;
}

impl VariableResolver for BTreeMap<String, String> {
    fn resolve(&self, name: &str, _ctx: &ParseContext) -> Option<String> {
        self.get(name).cloned()
    }
}

impl VariableResolver for HashMap<String, String> {
    fn resolve(&self, name: &str, _ctx: &ParseContext) -> Option<String> {
        self.get(name).cloned()
    }
}

/// Error returned by a [`PluginExecutor`].
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    /// No plugin with this name exists.
    #[error("Plugin '{0}' not found")]
    NotFound(String),
    /// The plugin ran and failed.
    #[error("Plugin '{name}' failed: {message}")]
    Failed { name: String, message: String },
}

/// Executes `[{Name key=value}]` plugin invocations.
pub trait PluginExecutor: Send + Sync {
    /// Run plugin `name` for `page` and return its HTML.
    fn execute(
        &self,
        name: &str,
        page: &str,
        params: &PluginParams,
        ctx: &ParseContext,
    ) -> Result<String, PluginError>;
}

/// Capability checks for handlers that guard resources.
pub trait PolicyChecker: Send + Sync {
    /// Whether `user` may perform `action` on `resource`.
    fn check_permission(&self, user: Option<&str>, action: &str, resource: &str) -> bool;
}

/// Page existence lookups used to mark links to missing pages.
pub trait PageIndex: Send + Sync {
    /// Whether page `name` exists.
    fn exists(&self, name: &str) -> bool;

    /// Markup source of page `name`, used by page inclusion. Indexes that only
    /// track existence keep the default and include nothing.
    fn content(&self, _name: &str) -> Option<String> {
        None
    }
}

/// Receives performance alerts as they are raised.
pub trait AlertSink: Send + Sync {
    /// Handle a newly raised alert.
    fn notify(&self, alert: &Alert);
}

/// Collaborating services available to handlers, filters and node builders.
#[derive(Clone, Default)]
pub struct Services {
    variables: Option<Arc<dyn VariableResolver>>,
    plugins: Option<Arc<dyn PluginExecutor>>,
    policy: Option<Arc<dyn PolicyChecker>>,
    pages: Option<Arc<dyn PageIndex>>,
    alerts: Option<Arc<dyn AlertSink>>,
}

impl Services {
    /// Services with no collaborators.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the variable resolver.
    #[must_use]
    pub fn with_variables(mut self, resolver: Arc<dyn VariableResolver>) -> Self {
        self.variables = Some(resolver);
        self
    }

    /// Set the plugin executor.
    #[must_use]
    pub fn with_plugins(mut self, executor: Arc<dyn PluginExecutor>) -> Self {
        self.plugins = Some(executor);
        self
    }

    /// Set the permission checker.
    #[must_use]
    pub fn with_policy(mut self, checker: Arc<dyn PolicyChecker>) -> Self {
        self.policy = Some(checker);
        self
    }

    /// Set the page index.
    #[must_use]
    pub fn with_pages(mut self, index: Arc<dyn PageIndex>) -> Self {
        self.pages = Some(index);
        self
    }

    /// Set the alert sink.
    #[must_use]
    pub fn with_alerts(mut self, sink: Arc<dyn AlertSink>) -> Self {
        self.alerts = Some(sink);
        self
    }

    pub fn variables(&self) -> Option<&dyn VariableResolver> {
        self.variables.as_deref()
    }

    pub fn plugins(&self) -> Option<&dyn PluginExecutor> {
        self.plugins.as_deref()
    }

    pub fn policy(&self) -> Option<&dyn PolicyChecker> {
        self.policy.as_deref()
    }

    pub fn pages(&self) -> Option<&dyn PageIndex> {
        self.pages.as_deref()
    }

    pub fn alerts(&self) -> Option<&dyn AlertSink> {
        self.alerts.as_deref()
    }
}

impl fmt::Debug for Services {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Services")
            .field("variables", &self.variables.is_some())
            .field("plugins", &self.plugins.is_some())
            .field("policy", &self.policy.is_some())
            .field("pages", &self.pages.is_some())
            .field("alerts", &self.alerts.is_some())
            .finish()
    }
}

/// Per-render state.
///
/// Created fresh for every render call and never shared between calls.
/// Handlers and filters receive it by reference; phases update the scratch
/// fields as the render progresses.
#[derive(Debug, Clone)]
pub struct ParseContext {
    page_name: String,
    user_name: Option<String>,
    metadata: BTreeMap<String, String>,
    services: Arc<Services>,
    context_hash: String,
    /// Placeholder token for this render.
    pub(crate) token: String,
    /// Code spans replaced by placeholders during preprocessing.
    pub(crate) protected_code: Vec<String>,
    /// Targets of wiki links extracted so far.
    pub(crate) link_targets: Vec<String>,
    /// Errors absorbed so far.
    pub(crate) report: RenderReport,
}

impl ParseContext {
    /// Build the context for one render.
    ///
    /// `time_bucket` is folded into the context hash so cached output keyed by
    /// it expires coarsely even when the cache provider keeps entries longer.
    pub fn new(render: &RenderContext, services: Arc<Services>, time_bucket: u64) -> Self {
        let metadata: Vec<String> = render
            .metadata
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        let bucket = time_bucket.to_string();
        let context_hash = hash_parts(&[
            &render.page_name,
            render.user_name.as_deref().unwrap_or(""),
            &metadata.join("&"),
            &bucket,
        ]);
        Self {
            page_name: render.page_name.clone(),
            user_name: render.user_name.clone(),
            metadata: render.metadata.clone(),
            services,
            context_hash,
            token: crate::extract::new_token(),
            protected_code: Vec::new(),
            link_targets: Vec::new(),
            report: RenderReport::default(),
        }
    }

    pub fn page_name(&self) -> &str {
        &self.page_name
    }

    pub fn user_name(&self) -> Option<&str> {
        self.user_name.as_deref()
    }

    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    /// Hash of page, user, metadata and time bucket.
    pub fn context_hash(&self) -> &str {
        &self.context_hash
    }

    /// Wiki link targets extracted during this render.
    pub fn link_targets(&self) -> &[String] {
        &self.link_targets
    }

    /// Errors absorbed so far during this render.
    pub fn report(&self) -> &RenderReport {
        &self.report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(render: &RenderContext, bucket: u64) -> ParseContext {
        ParseContext::new(render, Arc::new(Services::new()), bucket)
    }

    #[test]
    fn test_context_hash_depends_on_inputs() {
        let base = RenderContext::new("Main");
        let a = context(&base, 1);
        let b = context(&base, 1);
        assert_eq!(a.context_hash(), b.context_hash());

        let other_bucket = context(&base, 2);
        assert_ne!(a.context_hash(), other_bucket.context_hash());

        let with_user = context(&base.clone().with_user("ada"), 1);
        assert_ne!(a.context_hash(), with_user.context_hash());

        let with_meta = context(&base.with_metadata("lang", "en"), 1);
        assert_ne!(a.context_hash(), with_meta.context_hash());
    }

    #[test]
    fn test_map_variable_resolver() {
        let ctx = context(&RenderContext::new("Main"), 0);
        let mut vars = BTreeMap::new();
        vars.insert("username".to_owned(), "Ada".to_owned());
        assert_eq!(vars.resolve("username", &ctx).as_deref(), Some("Ada"));
        assert_eq!(vars.resolve("missing", &ctx), None);
    }

    #[test]
    fn test_services_debug_hides_collaborators() {
        let services = Services::new().with_variables(Arc::new(HashMap::<String, String>::new()));
        let debug = format!("{services:?}");
        assert!(debug.contains("variables: true"));
        assert!(debug.contains("plugins: false"));
    }
}
