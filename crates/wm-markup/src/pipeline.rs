//! The render pipeline.
//!
//! [`MarkupPipeline`] runs the fixed phase sequence over one page:
//!
//! ```text
//! preprocess → extract → handle → filter → convert → merge → post_process
//! ```
//!
//! Every phase is isolated: a panic inside one is recorded in the render's
//! [`RenderReport`] and the phase's input is passed on unchanged. The only
//! failure that ends a render early is a filter error with `fail_on_error`
//! set, in which case the raw content is returned escaped.

use std::cell::Cell;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use wm_cache::CacheProvider;
use wm_config::{CacheRegionId, Config};

use crate::cache::{CacheFacade, fingerprint, memory_cache_for};
use crate::context::{ParseContext, RenderContext, Services};
use crate::error::{PipelineError, RegistryError};
use crate::extract::{
    Element, ExtractedElement, ExtractionEngine, LinkResolver, NodeBuilder, NodeReplacements,
    error_marker, protect_code, restore_code, shield_line_starts, strip_leftovers, unshield,
};
use crate::filter::{BUILTIN_FILTERS, ContentFilter, FilterChain};
use crate::handler::{BUILTIN_HANDLERS, HandlerRegistry, ResolvedHandler, SyntaxHandler, run_phase};
use crate::markdown::{CommonMarkConverter, MarkdownConverter};
use crate::metrics::{Metrics, RegionMetrics, RenderMonitor, Served};
use crate::report::{Phase, RenderReport};
use crate::util::{escape_html, hash_parts, panic_message};

/// Variables resolved by [`MarkupPipeline::warm_up`].
const WARM_UP_VARIABLES: &[&str] = &[
    "applicationname",
    "pagename",
    "username",
    "totalpages",
    "uptime",
];

/// Builder for [`MarkupPipeline`].
///
/// # Example
///
/// ```
/// use std::collections::BTreeMap;
/// use std::sync::Arc;
///
/// use wm_markup::{MarkupPipeline, RenderContext, Services};
///
/// let mut vars = BTreeMap::new();
/// vars.insert("username".to_owned(), "Ada".to_owned());
///
/// let pipeline = MarkupPipeline::builder()
///     .with_services(Services::new().with_variables(Arc::new(vars)))
///     .build()
///     .unwrap();
///
/// let html = pipeline.render("## Title\nHello [{$username}]", &RenderContext::new("Main"));
/// assert_eq!(html, "<h2>Title</h2>\n<p>Hello Ada</p>");
/// ```
#[must_use]
pub struct MarkupPipelineBuilder {
    config: Config,
    cache: Option<Box<dyn CacheProvider>>,
    services: Services,
    converter: Arc<dyn MarkdownConverter>,
    handlers: Vec<Arc<dyn SyntaxHandler>>,
    filters: Vec<Arc<dyn ContentFilter>>,
}

impl MarkupPipelineBuilder {
    fn new() -> Self {
        Self {
            config: Config::default(),
            cache: None,
            services: Services::new(),
            converter: Arc::new(CommonMarkConverter::new()),
            handlers: Vec::new(),
            filters: Vec::new(),
        }
    }

    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Back the cache regions with `provider`.
    ///
    /// Defaults to a [`MemoryCache`](wm_cache::MemoryCache) sized from the
    /// configuration.
    pub fn with_cache(mut self, provider: impl CacheProvider + 'static) -> Self {
        self.cache = Some(Box::new(provider));
        self
    }

    pub fn with_services(mut self, services: Services) -> Self {
        self.services = services;
        self
    }

    pub fn with_converter(mut self, converter: Arc<dyn MarkdownConverter>) -> Self {
        self.converter = converter;
        self
    }

    /// Register an additional handler at build time.
    pub fn with_handler(mut self, handler: Arc<dyn SyntaxHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Register an additional filter at build time.
    pub fn with_filter(mut self, filter: Arc<dyn ContentFilter>) -> Self {
        self.filters.push(filter);
        self
    }

    /// Register the built-in and added components and open the cache.
    ///
    /// Built-in handlers are skipped when the parser is disabled, built-in
    /// filters when filtering is. `[handlers.<id>]` overrides apply to every
    /// handler, built-in or added.
    ///
    /// # Errors
    ///
    /// Returns the first registration error, such as a duplicate id or an
    /// out-of-range priority override.
    pub fn build(self) -> Result<MarkupPipeline, RegistryError> {
        let config = self.config;

        let handlers = HandlerRegistry::new(config.parser.max_handlers);
        let builtin_handlers: Vec<Arc<dyn SyntaxHandler>> = if config.parser.enabled {
            BUILTIN_HANDLERS
                .iter()
                .map(|(_, factory)| factory(&config))
                .collect()
        } else {
            Vec::new()
        };
        for handler in builtin_handlers.into_iter().chain(self.handlers) {
            let id = handler.id().to_owned();
            let overrides = config.handler_override(&id);
            let priority = overrides
                .and_then(|o| o.priority)
                .unwrap_or_else(|| handler.priority());
            handlers.register_with_priority(handler, priority)?;
            if overrides.and_then(|o| o.enabled) == Some(false) {
                handlers.set_enabled(&id, false)?;
            }
        }

        let filters = FilterChain::new(&config.filter_pipeline);
        if config.filters.enabled {
            for builtin in BUILTIN_FILTERS {
                filters.add_filter((builtin.build)(&config))?;
                if !(builtin.enabled)(&config) {
                    filters.set_enabled(builtin.id, false)?;
                }
            }
        }
        for filter in self.filters {
            filters.add_filter(filter)?;
        }

        let cache = match &self.cache {
            Some(provider) => CacheFacade::new(provider.as_ref(), &config),
            None => CacheFacade::new(&memory_cache_for(&config), &config),
        };

        tracing::info!(
            handlers = handlers.len(),
            filters = filters.len(),
            caching = config.parser.caching,
            "Markup pipeline ready"
        );

        Ok(MarkupPipeline {
            links: LinkResolver::new(&config.links),
            services: Arc::new(self.services),
            converter: self.converter,
            handlers,
            filters,
            cache,
            monitor: Mutex::new(RenderMonitor::default()),
            config,
        })
    }
}

/// Renders wiki markup to sanitized HTML.
///
/// `Send + Sync`; one instance serves concurrent renders. The handler
/// registry and filter chain can be administered while renders are running.
pub struct MarkupPipeline {
    config: Config,
    services: Arc<Services>,
    converter: Arc<dyn MarkdownConverter>,
    links: LinkResolver,
    handlers: HandlerRegistry,
    filters: FilterChain,
    cache: CacheFacade,
    monitor: Mutex<RenderMonitor>,
}

/// Output and bookkeeping of one render attempt.
struct Rendered {
    html: String,
    report: RenderReport,
    served: Served,
}

impl MarkupPipeline {
    pub fn builder() -> MarkupPipelineBuilder {
        MarkupPipelineBuilder::new()
    }

    /// Pipeline with default configuration and no collaborators.
    ///
    /// # Errors
    ///
    /// Never fails for the default configuration; see
    /// [`MarkupPipelineBuilder::build`].
    pub fn new() -> Result<Self, RegistryError> {
        Self::builder().build()
    }

    /// Render `content` for `render`.
    ///
    /// Never fails. Component failures degrade to partially rendered output;
    /// see [`render_with_report`](Self::render_with_report) to inspect them.
    pub fn render(&self, content: &str, render: &RenderContext) -> String {
        self.render_with_report(content, render).0
    }

    /// Render `content` and return the errors absorbed along the way.
    ///
    /// A cache hit returns an empty report.
    pub fn render_with_report(&self, content: &str, render: &RenderContext) -> (String, RenderReport) {
        if content.is_empty() {
            return (String::new(), RenderReport::default());
        }

        let start = Instant::now();
        let current = Cell::new(Phase::Preprocess);
        let rendered = catch_unwind(AssertUnwindSafe(|| self.render_cached(content, render, &current)))
            .unwrap_or_else(|payload| {
                let error = PipelineError::Panicked {
                    phase: current.get(),
                    message: panic_message(payload.as_ref()),
                };
                self.fallback(content, render, &error)
            });
        let elapsed = start.elapsed();

        tracing::debug!(
            page = %render.page_name,
            elapsed_ms = elapsed.as_millis(),
            errors = rendered.report.errors.len(),
            "Rendered page"
        );
        if self.config.performance.monitoring {
            self.monitor
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .record(
                    rendered.served,
                    elapsed,
                    &rendered.report,
                    &self.config.performance.alert_thresholds,
                    self.services.alerts(),
                );
        }

        (rendered.html, rendered.report)
    }

    /// Escaped raw content, for renders that could not complete.
    fn fallback(&self, content: &str, render: &RenderContext, error: &PipelineError) -> Rendered {
        tracing::error!(page = %render.page_name, error = %error, "Render failed, returning raw content");
        let phase = match error {
            PipelineError::Panicked { phase, .. } => *phase,
            PipelineError::Filter(_) => Phase::Filter,
        };
        let mut report = RenderReport::default();
        report.push_error(phase, None, error.to_string());
        Rendered {
            html: escape_html(content),
            report,
            served: self.served_uncached(),
        }
    }

    fn served_uncached(&self) -> Served {
        if self.cache.region(CacheRegionId::ParseResults).is_enabled() {
            Served::Rendered
        } else {
            Served::Uncached
        }
    }

    fn render_cached(&self, content: &str, render: &RenderContext, current: &Cell<Phase>) -> Rendered {
        let mut ctx = ParseContext::new(
            render,
            Arc::clone(&self.services),
            time_bucket(self.config.parser.time_bucket_secs),
        );
        let handlers = self.resolve_handlers(&mut ctx);
        let results = self.cache.region(CacheRegionId::ParseResults);
        let key = fingerprint(content, &self.component_hash(&ctx, &handlers));
        if let Some(html) = results.get_string(&key) {
            tracing::debug!(page = %render.page_name, "Parse result cache hit");
            return Rendered {
                html,
                report: RenderReport::default(),
                served: Served::CacheHit,
            };
        }

        match self.run_phases(content, &handlers, &mut ctx, current) {
            Ok(html) => {
                results.set_string(&key, &html);
                Rendered {
                    html,
                    report: ctx.report,
                    served: self.served_uncached(),
                }
            }
            Err(error) => {
                let mut rendered = self.fallback(content, render, &error);
                ctx.report.absorb(rendered.report);
                rendered.report = ctx.report;
                rendered
            }
        }
    }

    fn run_phases(
        &self,
        content: &str,
        handlers: &[ResolvedHandler],
        ctx: &mut ParseContext,
        current: &Cell<Phase>,
    ) -> Result<String, PipelineError> {
        let handler_results = self.cache.region(CacheRegionId::HandlerResults);
        let engine = ExtractionEngine::new().with_reserved_plugins(
            handlers
                .iter()
                .flat_map(|r| r.handler.reserved_plugins().iter().copied()),
        );

        let text = guarded(ctx, current, Phase::Preprocess, content.to_owned(), |ctx| {
            let (protected, spans) = protect_code(content, &ctx.token);
            ctx.protected_code = spans;
            run_phase(handlers, Phase::Preprocess, protected, ctx, handler_results)
        });

        let (text, elements) = guarded(
            ctx,
            current,
            Phase::Extract,
            (text.clone(), Vec::new()),
            |ctx| {
                let extraction = engine.extract_cached(
                    &text,
                    &ctx.token,
                    self.cache.region(CacheRegionId::Patterns),
                );
                ctx.link_targets = link_targets(&extraction.elements);
                ctx.report.elements = extraction.elements.len();
                (extraction.text, extraction.elements)
            },
        );

        let text = guarded(ctx, current, Phase::Handle, text.clone(), |ctx| {
            run_phase(handlers, Phase::Handle, text, ctx, handler_results)
        });

        let text = guarded(ctx, current, Phase::Filter, Ok(text.clone()), |ctx| {
            self.filters.process(text, ctx, handler_results)
        })?;

        let html = guarded(ctx, current, Phase::Convert, text.clone(), |ctx| {
            let shielded = shield_line_starts(&text);
            let restored = restore_code(&shielded, &ctx.token, &ctx.protected_code);
            let html = unshield(&self.converter.to_html(&restored));
            self.filters.process_html(html, ctx)
        });

        let html = guarded(ctx, current, Phase::Merge, html.clone(), |ctx| {
            self.merge(html, &elements, ctx)
        });

        Ok(guarded(ctx, current, Phase::PostProcess, html.clone(), |ctx| {
            let cleaned = strip_leftovers(&html);
            run_phase(handlers, Phase::PostProcess, cleaned, ctx, handler_results)
        }))
    }

    /// Context hash extended with the active handler and filter ids, so admin
    /// changes never serve output rendered under the previous setup.
    fn component_hash(&self, ctx: &ParseContext, handlers: &[ResolvedHandler]) -> String {
        let handler_ids: Vec<&str> = handlers.iter().map(|r| r.handler.id()).collect();
        let filter_ids = self.filters.active_ids();
        hash_parts(&[
            ctx.context_hash(),
            &handler_ids.join(","),
            &filter_ids.join(","),
        ])
    }

    /// Handler order for this render. Handlers that cannot be ordered are left
    /// out and reported.
    fn resolve_handlers(&self, ctx: &mut ParseContext) -> Vec<ResolvedHandler> {
        let (handlers, errors) = self.handlers.resolve_partial();
        for error in errors {
            ctx.report.push_error(Phase::Handle, None, error.to_string());
        }
        handlers
    }

    /// Build a node for every element and substitute it for its placeholder.
    fn merge(&self, mut html: String, elements: &[ExtractedElement], ctx: &mut ParseContext) -> String {
        if elements.is_empty() {
            return html;
        }
        let builder = NodeBuilder::new(&self.links, self.cache.region(CacheRegionId::Variables));
        let nodes = ExtractionEngine::build_nodes(elements, ctx, &builder);

        let mut replacements = NodeReplacements::new(ctx.token.clone());
        for (id, node) in nodes {
            match node {
                Ok(node) => replacements.add(id, node),
                Err(e) => {
                    let kind = elements.get(id).map(|e| e.element.kind());
                    tracing::warn!(element = id, kind = ?kind, error = %e, "Element failed to render");
                    ctx.report.push_error(Phase::Merge, kind, e.to_string());
                    replacements.add(id, error_marker(&e.to_string()));
                }
            }
        }

        let missing = replacements.apply(&mut html);
        if !missing.is_empty() {
            tracing::debug!(ids = ?missing, "Placeholders lost during conversion");
        }
        html
    }

    /// Enable or disable a handler.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] for an unknown id.
    pub fn set_handler_enabled(&self, id: &str, enabled: bool) -> Result<(), RegistryError> {
        self.handlers.set_enabled(id, enabled)
    }

    /// Enable or disable a filter.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] for an unknown id.
    pub fn set_filter_enabled(&self, id: &str, enabled: bool) -> Result<(), RegistryError> {
        self.filters.set_enabled(id, enabled)
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    pub fn filters(&self) -> &FilterChain {
        &self.filters
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Snapshot of render, cache, handler and filter metrics.
    pub fn metrics(&self) -> Metrics {
        let regions = self
            .cache
            .stats()
            .into_iter()
            .map(|(name, stats)| RegionMetrics::new(name, stats))
            .collect();
        self.monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .snapshot(regions, self.handlers.stats(), self.filters.stats())
    }

    /// Clear all counters, timing windows and alerts.
    pub fn reset_metrics(&self) {
        self.monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .reset();
        self.cache.reset_stats();
        self.handlers.reset_stats();
        self.filters.reset_stats();
    }

    /// Resolve common variables into the variable cache for each of
    /// `contexts`. Returns how many resolved in total.
    ///
    /// Cached variables are keyed by context, so only renders with one of
    /// these contexts in the current time bucket benefit.
    pub fn warm_up(&self, contexts: &[RenderContext]) -> usize {
        let bucket = time_bucket(self.config.parser.time_bucket_secs);
        let builder = NodeBuilder::new(&self.links, self.cache.region(CacheRegionId::Variables));
        let mut resolved = 0;
        for render in contexts {
            let ctx = ParseContext::new(render, Arc::clone(&self.services), bucket);
            resolved += WARM_UP_VARIABLES
                .iter()
                .filter(|name| builder.resolve_variable(name, &ctx).is_some())
                .count();
        }
        tracing::debug!(contexts = contexts.len(), resolved, "Warmed variable cache");
        resolved
    }
}

/// Run one phase, timing it and absorbing panics.
///
/// On a panic the error is reported and `fallback`, the phase's input, is
/// returned instead.
fn guarded<T>(
    ctx: &mut ParseContext,
    current: &Cell<Phase>,
    phase: Phase,
    fallback: T,
    run: impl FnOnce(&mut ParseContext) -> T,
) -> T {
    current.set(phase);
    let start = Instant::now();
    let outcome = catch_unwind(AssertUnwindSafe(|| run(ctx)));
    ctx.report.push_timing(phase, start.elapsed());
    outcome.unwrap_or_else(|payload| {
        let error = PipelineError::Panicked {
            phase,
            message: panic_message(payload.as_ref()),
        };
        tracing::error!(%phase, error = %error, "Phase failed, passing content through");
        ctx.report.push_error(phase, None, error.to_string());
        fallback
    })
}

fn link_targets(elements: &[ExtractedElement]) -> Vec<String> {
    elements
        .iter()
        .filter_map(|e| match &e.element {
            Element::Link { target, .. } => Some(target.clone()),
            _ => None,
        })
        .collect()
}

/// Index of the current time window, folded into cache fingerprints.
fn time_bucket(bucket_secs: u64) -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs());
    now / bucket_secs.max(1)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::Ordering;
    use std::thread;
    use std::time::Duration;

    use pretty_assertions::assert_eq;
    use wm_cache::NullCache;

    use super::*;
    use crate::context::{PageIndex, PluginError, PluginExecutor, VariableResolver};
    use crate::extract::PluginParams;
    use crate::filter::DANGEROUS_CONTENT_MARKER;
    use crate::filter::tests::Append;
    use crate::handler::tests::Replace;
    use crate::metrics::AlertKind;

    fn variables(pairs: &[(&str, &str)]) -> Services {
        let map: BTreeMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        Services::new().with_variables(Arc::new(map))
    }

    fn ctx() -> RenderContext {
        RenderContext::new("Main")
    }

    struct Echo;

    impl PluginExecutor for Echo {
        fn execute(
            &self,
            name: &str,
            page: &str,
            params: &PluginParams,
            _ctx: &ParseContext,
        ) -> Result<String, PluginError> {
            match name {
                "Toc" => Ok("<div class=\"toc\">contents</div>".to_owned()),
                "Boom" => panic!("plugin exploded"),
                "Say" => Ok(format!("said:{}", params.get("say").unwrap_or("-"))),
                _ => Ok(format!("{name}@{page}:{}", params.get("max").unwrap_or("-"))),
            }
        }
    }

    struct Panicking;

    impl MarkdownConverter for Panicking {
        fn to_html(&self, _markdown: &str) -> String {
            panic!("converter exploded")
        }
    }

    #[test]
    fn test_heading_and_variable() {
        let pipeline = MarkupPipeline::builder()
            .with_services(variables(&[("username", "Ada")]))
            .build()
            .unwrap();
        assert_eq!(
            pipeline.render("## Title\nHello [{$username}]", &ctx()),
            "<h2>Title</h2>\n<p>Hello Ada</p>"
        );
    }

    #[test]
    fn test_plain_markdown_passes_through() {
        let pipeline = MarkupPipeline::new().unwrap();
        let text = "Just *plain* markdown.\n\n- one\n- two\n";
        let expected = CommonMarkConverter::new().to_html(text);
        assert_eq!(pipeline.render(text, &ctx()), expected.trim_end());
    }

    #[test]
    fn test_empty_input_renders_empty() {
        let pipeline = MarkupPipeline::new().unwrap();
        assert_eq!(pipeline.render("", &ctx()), "");
        assert_eq!(pipeline.metrics().renders, 0);
    }

    #[test]
    fn test_escaped_variable_stays_literal() {
        let pipeline = MarkupPipeline::builder()
            .with_services(variables(&[("username", "Ada")]))
            .build()
            .unwrap();
        let html = pipeline.render("[[{$username}]", &ctx());
        assert_eq!(html, "<p>[{$username}]</p>");
        assert!(!html.contains("Ada"));
    }

    #[test]
    fn test_element_at_line_start_keeps_markdown() {
        let pipeline = MarkupPipeline::builder()
            .with_services(variables(&[("username", "Ada")]))
            .build()
            .unwrap();
        assert_eq!(
            pipeline.render("[{$username}] is *great*", &ctx()),
            "<p>Ada is <em>great</em></p>"
        );
    }

    #[test]
    fn test_plugin_without_executor_renders_marker() {
        let pipeline = MarkupPipeline::new().unwrap();
        let (html, report) = pipeline.render_with_report("[{TableOfContents}]", &ctx());
        assert!(html.contains(r#"<span class="wiki-error">[Error: No plugin executor"#));
        let merge_errors: Vec<_> = report.errors_in(Phase::Merge).collect();
        assert_eq!(merge_errors.len(), 1);
        assert_eq!(merge_errors[0].component.as_deref(), Some("plugin"));
    }

    #[test]
    fn test_block_plugin_replaces_paragraph() {
        let pipeline = MarkupPipeline::builder()
            .with_services(Services::new().with_plugins(Arc::new(Echo)))
            .build()
            .unwrap();
        assert_eq!(
            pipeline.render("[{Toc}]\n\nText [{Count max=3}]", &ctx()),
            "<div class=\"toc\">contents</div>\n<p>Text Count@Main:3</p>"
        );
    }

    #[test]
    fn test_variable_inside_plugin_params_survives_warm_pattern_cache() {
        let services = variables(&[("user", "Ada")]).with_plugins(Arc::new(Echo));
        let pipeline = MarkupPipeline::builder()
            .with_services(services)
            .build()
            .unwrap();
        let text = "x [{Say say=[{$user}]}] y";

        assert_eq!(
            pipeline.render(text, &RenderContext::new("PageA")),
            "<p>x said:Ada y</p>"
        );
        assert_eq!(
            pipeline.render(text, &RenderContext::new("PageB")),
            "<p>x said:Ada y</p>"
        );
        let patterns = pipeline
            .metrics()
            .cache_regions
            .into_iter()
            .find(|r| r.name == CacheRegionId::Patterns.as_str())
            .unwrap();
        assert_eq!(patterns.hits, 1);
    }

    #[test]
    fn test_panicking_plugin_is_contained() {
        let pipeline = MarkupPipeline::builder()
            .with_services(Services::new().with_plugins(Arc::new(Echo)))
            .build()
            .unwrap();
        let html = pipeline.render("before [{Boom}] after", &ctx());
        assert!(html.starts_with("<p>before <span class=\"wiki-error\">"));
        assert!(html.ends_with(" after</p>"));
    }

    #[test]
    fn test_too_many_links_prefixes_warning() {
        let pipeline = MarkupPipeline::new().unwrap();
        let text = (0..11)
            .map(|i| format!("[link {i}](https://wikipedia.org/{i})"))
            .collect::<Vec<_>>()
            .join("\n");
        let html = pipeline.render(&text, &ctx());
        assert!(html.starts_with("<!-- SPAM WARNING: Too many links: 11/10 -->"));
        assert!(html.contains(r#"<a href="https://wikipedia.org/10">link 10</a>"#));
    }

    #[test]
    fn test_script_removed() {
        let pipeline = MarkupPipeline::new().unwrap();
        let html = pipeline.render("<script>alert(1)</script>", &ctx());
        assert!(!html.contains("<script"));
        assert!(html.contains(DANGEROUS_CONTENT_MARKER));
    }

    #[test]
    fn test_entity_encoded_script_urls_removed() {
        let pipeline = MarkupPipeline::new().unwrap();
        let html = pipeline.render(
            "<a href=\"jav&#x61;script:alert(1)\">click</a> and [x](&#106;avascript:alert(2))",
            &ctx(),
        );
        assert_eq!(html, "<p><a>click</a> and <a>x</a></p>");
    }

    #[test]
    fn test_code_is_never_extracted_or_filtered() {
        let pipeline = MarkupPipeline::builder()
            .with_services(variables(&[("username", "Ada")]))
            .build()
            .unwrap();
        let html = pipeline.render("`[{$username}]`\n\n```\n<script>x</script>\n```", &ctx());
        assert_eq!(
            html,
            "<p><code>[{$username}]</code></p>\n<pre><code>&lt;script&gt;x&lt;/script&gt;\n</code></pre>"
        );
    }

    #[test]
    fn test_dependency_runs_before_dependent() {
        let pipeline = MarkupPipeline::builder()
            .with_handler(Replace::new("b", "x", "y", 50).arc())
            .with_handler(Replace::new("a", "y", "z", 90).depends_on("b").arc())
            .build()
            .unwrap();
        assert_eq!(pipeline.render("x", &ctx()), "<p>z</p>");
    }

    #[test]
    fn test_cycle_skips_handlers_and_reports() {
        let pipeline = MarkupPipeline::builder()
            .with_handler(Replace::new("a", "x", "y", 50).depends_on("b").arc())
            .with_handler(Replace::new("b", "y", "z", 50).depends_on("a").arc())
            .build()
            .unwrap();
        let (html, report) = pipeline.render_with_report("x", &ctx());
        assert_eq!(html, "<p>x</p>");
        assert!(report.errors_in(Phase::Handle).count() >= 1);
    }

    #[test]
    fn test_parallel_same_priority_filters_apply_once() {
        let mut config = Config::default();
        config.filter_pipeline.enable_parallel_execution = true;
        let pipeline = MarkupPipeline::builder()
            .with_config(config)
            .with_filter(Append::new("one", " ONE", 500).arc())
            .with_filter(Append::new("two", " TWO", 500).arc())
            .build()
            .unwrap();
        let html = pipeline.render("Hello there", &ctx());
        let applied = [" ONE", " TWO"]
            .iter()
            .filter(|suffix| html.contains(*suffix))
            .count();
        assert_eq!(applied, 1);
    }

    #[test]
    fn test_repeat_render_served_from_cache() {
        let pipeline = MarkupPipeline::new().unwrap();
        let first = pipeline.render("Hello [Main]", &ctx());
        let second = pipeline.render("Hello [Main]", &ctx());
        assert_eq!(first, second);

        let metrics = pipeline.metrics();
        assert_eq!(metrics.renders, 2);
        assert_eq!(metrics.cache_hits, 1);
        assert_eq!(metrics.cache_misses, 1);
    }

    #[test]
    fn test_disabled_cache_renders_every_time() {
        let pipeline = MarkupPipeline::builder().with_cache(NullCache).build().unwrap();
        pipeline.render("Hello", &ctx());
        pipeline.render("Hello", &ctx());
        assert_eq!(pipeline.metrics().cache_hits, 0);
    }

    #[test]
    fn test_failing_converter_passes_text_through() {
        let pipeline = MarkupPipeline::builder()
            .with_converter(Arc::new(Panicking))
            .build()
            .unwrap();
        let (html, report) = pipeline.render_with_report("plain words here", &ctx());
        assert_eq!(html, "plain words here");
        assert_eq!(report.errors_in(Phase::Convert).count(), 1);
    }

    #[test]
    fn test_fail_on_error_returns_escaped_content() {
        let mut config = Config::default();
        config.filter_pipeline.fail_on_error = true;
        let pipeline = MarkupPipeline::builder()
            .with_config(config)
            .with_filter(Append::new("strict", "!fail", 500).arc())
            .build()
            .unwrap();
        let (html, report) = pipeline.render_with_report("a <b> c", &ctx());
        assert_eq!(html, "a &lt;b&gt; c");
        assert_eq!(report.errors_in(Phase::Filter).count(), 1);
    }

    #[test]
    fn test_filters_can_be_disabled() {
        let mut config = Config::default();
        config.filters.enabled = false;
        let pipeline = MarkupPipeline::builder().with_config(config).build().unwrap();
        assert!(pipeline.filters().is_empty());
        assert!(pipeline.render("<marquee>x</marquee>", &ctx()).contains("<marquee>"));
    }

    #[test]
    fn test_admin_toggles() {
        let pipeline = MarkupPipeline::builder()
            .with_handler(Replace::new("shout", "hi", "HI", 10).arc())
            .build()
            .unwrap();
        assert_eq!(pipeline.render("hi", &ctx()), "<p>HI</p>");

        pipeline.set_handler_enabled("shout", false).unwrap();
        assert_eq!(pipeline.render("hi", &ctx()), "<p>hi</p>");

        assert!(matches!(
            pipeline.set_filter_enabled("nope", false),
            Err(RegistryError::NotFound(_))
        ));
        pipeline.set_filter_enabled("security", false).unwrap();
        assert!(
            !pipeline
                .filters()
                .descriptors()
                .iter()
                .any(|d| d.id == "security" && d.enabled)
        );
    }

    #[test]
    fn test_concurrent_renders_during_admin_changes() {
        let mut config = Config::default();
        config.parser.caching = false;
        let pipeline = MarkupPipeline::builder()
            .with_config(config)
            .with_handler(Replace::new("shout", "hi", "HI", 10).arc())
            .build()
            .unwrap();
        let valid = ["<p>hi x</p>", "<p>HI x</p>", "<p>hi y</p>", "<p>HI y</p>"];

        thread::scope(|scope| {
            let renders: Vec<_> = (0..4)
                .map(|worker| {
                    let pipeline = &pipeline;
                    scope.spawn(move || {
                        (0..50)
                            .map(|n| {
                                let page = format!("Page{}", (worker + n) % 3);
                                pipeline.render("hi x", &RenderContext::new(page))
                            })
                            .collect::<Vec<_>>()
                    })
                })
                .collect();

            scope.spawn(|| {
                for round in 0..50 {
                    pipeline.set_handler_enabled("shout", round % 2 == 1).unwrap();
                    if round % 2 == 0 {
                        pipeline
                            .handlers()
                            .register(Replace::new("extra", "x", "y", 5).arc())
                            .unwrap();
                    } else {
                        pipeline.handlers().unregister("extra").unwrap();
                    }
                    pipeline.set_filter_enabled("security", round % 3 != 0).unwrap();
                }
            });

            for handle in renders {
                for html in handle.join().unwrap() {
                    assert!(valid.contains(&html.as_str()), "unexpected rendering: {html}");
                }
            }
        });

        assert_eq!(pipeline.metrics().errors, 0);
        assert!(pipeline.handlers().descriptors().iter().all(|d| d.id != "extra"));
    }

    #[test]
    fn test_failing_handler_raises_error_rate_alert() {
        let pipeline = MarkupPipeline::builder()
            .with_handler(Replace::new("bad", "x", "!fail", 10).arc())
            .build()
            .unwrap();
        let (html, report) = pipeline.render_with_report("x marks", &ctx());
        assert_eq!(html, "<p>x marks</p>");
        assert_eq!(report.errors_in(Phase::Handle).count(), 1);

        let alerts = pipeline.metrics().alerts;
        let high: Vec<_> = alerts
            .iter()
            .filter(|a| a.kind == AlertKind::HighErrorRate)
            .collect();
        assert_eq!(high.len(), 1);
        assert_eq!(high[0].value, 1.0);
    }

    #[test]
    fn test_handler_override_from_config() {
        let config = Config::from_toml_str(
            r"
[handlers.style]
enabled = false

[handlers.table]
priority = 10
",
        )
        .unwrap();
        let pipeline = MarkupPipeline::builder().with_config(config).build().unwrap();
        let descriptors = pipeline.handlers().descriptors();
        let style = descriptors.iter().find(|d| d.id == "style").unwrap();
        let table = descriptors.iter().find(|d| d.id == "table").unwrap();
        assert!(!style.enabled);
        assert_eq!(table.priority, 10);
    }

    #[test]
    fn test_disabled_parser_skips_builtin_handlers() {
        let mut config = Config::default();
        config.parser.enabled = false;
        let pipeline = MarkupPipeline::builder().with_config(config).build().unwrap();
        assert!(pipeline.handlers().is_empty());
    }

    #[test]
    fn test_wiki_table_rendered() {
        let pipeline = MarkupPipeline::new().unwrap();
        let html = pipeline.render("|| Name || Role\n| Ada | Admin", &ctx());
        assert!(html.starts_with("<table class=\"table\">"));
        assert!(html.contains("<th>Name</th>"));
        assert!(html.contains("<td>Admin</td>"));
    }

    #[test]
    fn test_wiki_tags_resolved_before_markdown() {
        let pipeline = MarkupPipeline::new().unwrap();
        let text = "Intro\n\n<wiki:If test=\"authenticated\">Hello **there**</wiki:If>";
        assert_eq!(pipeline.render(text, &ctx()), "<p>Intro</p>");
        assert_eq!(
            pipeline.render(text, &RenderContext::new("Main").with_user("Ada")),
            "<p>Intro</p>\n<p>Hello <strong>there</strong></p>"
        );
    }

    #[test]
    fn test_included_page_goes_through_wiki_processing() {
        struct Wiki;

        impl PageIndex for Wiki {
            fn exists(&self, _name: &str) -> bool {
                true
            }

            fn content(&self, name: &str) -> Option<String> {
                (name == "Footer").then(|| "See [Main]".to_owned())
            }
        }

        let pipeline = MarkupPipeline::builder()
            .with_services(Services::new().with_pages(Arc::new(Wiki)))
            .build()
            .unwrap();
        assert_eq!(
            pipeline.render("<wiki:Include page=\"Footer\" />", &ctx()),
            r#"<p>See <a class="wiki-link wikipage" href="/wiki/Main">Main</a></p>"#
        );
    }

    #[test]
    fn test_wiki_form_survives_sanitizing() {
        let pipeline = MarkupPipeline::new().unwrap();
        let text = "[{FormOpen action='/save'}]\n\
                    [{FormInput name='title' placeholder=\"Your title\"}]\n\
                    [{FormClose}]\n\n\
                    <form action=\"/steal\"><input name=\"x\"></form>";
        let html = pipeline.render(text, &ctx());
        assert!(html.starts_with(
            "<form id=\"wikiForm_1\" name=\"wikiForm_1\" action=\"/save\" method=\"POST\""
        ));
        assert!(html.contains(r#"placeholder="Your title""#));
        assert!(html.contains("</form>"));
        assert!(!html.contains("/steal"));
    }

    #[test]
    fn test_metrics_track_phases_and_reset() {
        let pipeline = MarkupPipeline::new().unwrap();
        pipeline.render("[{Missing}]", &ctx());

        let metrics = pipeline.metrics();
        assert_eq!(metrics.errors, 1);
        assert_eq!(metrics.phases[&Phase::Merge].errors, 1);
        assert_eq!(metrics.phases[&Phase::Convert].runs, 1);
        assert!(metrics.filters.executions >= 1);

        pipeline.reset_metrics();
        let metrics = pipeline.metrics();
        assert_eq!(metrics.renders, 0);
        assert!(metrics.phases.is_empty());
        assert_eq!(metrics.filters.executions, 0);
    }

    #[test]
    fn test_monitoring_off_records_nothing() {
        let mut config = Config::default();
        config.performance.monitoring = false;
        let pipeline = MarkupPipeline::builder().with_config(config).build().unwrap();
        pipeline.render("Hello", &ctx());
        assert_eq!(pipeline.metrics().renders, 0);
    }

    #[test]
    fn test_warm_up_serves_later_renders_with_same_context() {
        struct Counting(std::sync::atomic::AtomicUsize);

        impl VariableResolver for Counting {
            fn resolve(&self, name: &str, _ctx: &ParseContext) -> Option<String> {
                self.0.fetch_add(1, Ordering::SeqCst);
                (name == "applicationname").then(|| "Wiki".to_owned())
            }
        }

        let resolver = Arc::new(Counting(0.into()));
        let pipeline = MarkupPipeline::builder()
            .with_services(Services::new().with_variables(Arc::clone(&resolver) as Arc<dyn VariableResolver>))
            .build()
            .unwrap();
        let reader = RenderContext::new("Main").with_user("Ada");
        // applicationname from the resolver, pagename and username built in.
        assert_eq!(pipeline.warm_up(&[ctx(), reader.clone()]), 6);
        let variables = pipeline
            .metrics()
            .cache_regions
            .into_iter()
            .find(|r| r.name == "variables")
            .unwrap();
        assert_eq!(variables.writes, 6);

        let calls = resolver.0.load(Ordering::SeqCst);
        assert_eq!(pipeline.render("[{$applicationname}]", &reader), "<p>Wiki</p>");
        assert_eq!(resolver.0.load(Ordering::SeqCst), calls);
    }

    #[test]
    fn test_timing_recorded_for_every_phase() {
        let pipeline = MarkupPipeline::new().unwrap();
        let (_, report) = pipeline.render_with_report("Hello", &ctx());
        let phases: Vec<Phase> = report.timings.iter().map(|t| t.phase).collect();
        assert_eq!(phases, Phase::ALL.to_vec());
        assert!(report.timings.iter().all(|t| t.elapsed < Duration::from_secs(5)));
    }
}
