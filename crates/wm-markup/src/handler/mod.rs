//! Syntax handlers.
//!
//! A handler recognizes one wiki construct by pattern and rewrites it. Most
//! inline constructs are taken care of by the extraction engine; handlers
//! cover what needs to see whole lines or blocks (styles, tables, wiki tags),
//! access checks (attachments) or the final HTML (forms).
//!
//! Handlers run in the phase they declare, in the order resolved by the
//! [`HandlerRegistry`]. A failing handler leaves the content as it was before
//! it ran.

mod attachment;
mod form;
mod registry;
mod style;
mod table;
mod wiki_tag;

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::{Duration, Instant};

use regex::{Captures, Regex};
use wm_config::Config;

pub use attachment::AttachmentHandler;
pub use form::{DEFAULT_ACTION, WikiFormHandler};
pub use registry::{
    DEFAULT_MAX_HANDLERS, HandlerDescriptor, HandlerRegistry, HandlerStatsSnapshot, RegistryStats,
};
pub(crate) use registry::ResolvedHandler;
pub use style::StyleHandler;
pub use table::TableHandler;
pub use wiki_tag::{INCLUDE_PERMISSION, ROLES_METADATA, WikiTagHandler};

use crate::cache::RegionHandle;
use crate::context::ParseContext;
use crate::report::Phase;
use crate::util::{hash_parts, panic_message};

/// Time a handler may take before its result is discarded.
pub const DEFAULT_HANDLER_TIMEOUT: Duration = Duration::from_secs(5);

/// Failure of one handler invocation.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("{0}")]
    Failed(String),

    /// The handler finished but took longer than its timeout.
    #[error("'{handler}' exceeded its {limit:?} timeout")]
    Timeout { handler: String, limit: Duration },

    #[error("'{handler}' panicked: {message}")]
    Panicked { handler: String, message: String },
}

/// Recognizes and transforms one wiki construct.
pub trait SyntaxHandler: Send + Sync {
    /// Unique id.
    fn id(&self) -> &str;

    /// Pattern of the construct. Content without a match skips the handler.
    fn pattern(&self) -> &Regex;

    /// Default priority, higher runs earlier (0 to 1000).
    fn priority(&self) -> u32;

    /// Ids of handlers that must run before this one.
    fn dependencies(&self) -> &[String] {
        &[]
    }

    fn phase(&self) -> Phase {
        Phase::Handle
    }

    fn timeout(&self) -> Duration {
        DEFAULT_HANDLER_TIMEOUT
    }

    /// Plugin names the extraction engine must leave in the text.
    fn reserved_plugins(&self) -> &[&'static str] {
        &[]
    }

    /// Render one match.
    fn handle(&self, caps: &Captures<'_>, ctx: &ParseContext) -> Result<String, HandlerError>;

    /// Transform `content`, by default replacing every match with
    /// [`handle`](Self::handle). The first failing match fails the call.
    fn process(&self, content: &str, ctx: &ParseContext) -> Result<String, HandlerError> {
        let mut out = String::with_capacity(content.len());
        let mut last = 0;
        for caps in self.pattern().captures_iter(content) {
            let Some(m) = caps.get(0) else {
                continue;
            };
            out.push_str(&content[last..m.start()]);
            out.push_str(&self.handle(&caps, ctx)?);
            last = m.end();
        }
        out.push_str(&content[last..]);
        Ok(out)
    }
}

/// Constructor of a built-in handler from configuration.
pub(crate) type HandlerFactory = fn(&Config) -> Arc<dyn SyntaxHandler>;

/// Built-in handlers by id.
pub(crate) const BUILTIN_HANDLERS: &[(&str, HandlerFactory)] = &[
    (style::ID, style::factory),
    (table::ID, table::factory),
    (attachment::ID, attachment::factory),
    (wiki_tag::ID, wiki_tag::factory),
    (form::ID, form::factory),
];

/// Run the handlers resolved for `phase` over `content`.
///
/// Each handler's output is cached in the handler result region by handler,
/// content and context. Failures and timeouts are recorded in the context's
/// report and leave the content unchanged for that handler.
pub(crate) fn run_phase(
    handlers: &[ResolvedHandler],
    phase: Phase,
    content: String,
    ctx: &mut ParseContext,
    cache: &RegionHandle,
) -> String {
    let mut content = content;

    for resolved in handlers.iter().filter(|r| r.handler.phase() == phase) {
        let handler = resolved.handler.as_ref();
        if !handler.pattern().is_match(&content) {
            continue;
        }

        let key = format!(
            "handler:{}:{}:{}",
            handler.id(),
            hash_parts(&[&content.replace(&ctx.token, "")]),
            ctx.context_hash()
        );
        if let Some(cached) = cache.get_string(&key) {
            content = cached.replace("{{token}}", &ctx.token);
            continue;
        }

        let start = Instant::now();
        let outcome = catch_unwind(AssertUnwindSafe(|| handler.process(&content, ctx)))
            .unwrap_or_else(|payload| {
                Err(HandlerError::Panicked {
                    handler: handler.id().to_owned(),
                    message: panic_message(payload.as_ref()),
                })
            })
            .and_then(|output| {
                let limit = handler.timeout();
                if start.elapsed() > limit {
                    Err(HandlerError::Timeout {
                        handler: handler.id().to_owned(),
                        limit,
                    })
                } else {
                    Ok(output)
                }
            });
        let elapsed = start.elapsed();
        resolved.stats.record(elapsed, outcome.is_ok());

        match outcome {
            Ok(output) => {
                tracing::debug!(handler = handler.id(), elapsed_us = elapsed.as_micros(), "Handler applied");
                cache.set_string(&key, &output.replace(&ctx.token, "{{token}}"));
                content = output;
            }
            Err(e) => {
                tracing::warn!(handler = handler.id(), error = %e, "Handler failed");
                ctx.report.push_error(phase, Some(handler.id()), e.to_string());
            }
        }
    }

    content
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use pretty_assertions::assert_eq;
    use wm_cache::MemoryCache;
    use wm_config::CacheRegionId;

    use super::*;
    use crate::cache::CacheFacade;
    use crate::context::{RenderContext, Services};

    /// Replaces every occurrence of a literal with another string.
    pub(crate) struct Replace {
        id: String,
        pattern: Regex,
        to: String,
        priority: u32,
        dependencies: Vec<String>,
        phase: Phase,
        calls: AtomicUsize,
    }

    impl Replace {
        pub(crate) fn new(id: &str, from: &str, to: &str, priority: u32) -> Self {
            Self {
                id: id.to_owned(),
                pattern: Regex::new(&regex::escape(from)).unwrap(),
                to: to.to_owned(),
                priority,
                dependencies: Vec::new(),
                phase: Phase::Handle,
                calls: AtomicUsize::new(0),
            }
        }

        pub(crate) fn depends_on(mut self, id: &str) -> Self {
            self.dependencies.push(id.to_owned());
            self
        }

        pub(crate) fn in_phase(mut self, phase: Phase) -> Self {
            self.phase = phase;
            self
        }

        pub(crate) fn arc(self) -> Arc<dyn SyntaxHandler> {
            Arc::new(self)
        }
    }

    impl SyntaxHandler for Replace {
        fn id(&self) -> &str {
            &self.id
        }

        fn pattern(&self) -> &Regex {
            &self.pattern
        }

        fn priority(&self) -> u32 {
            self.priority
        }

        fn dependencies(&self) -> &[String] {
            &self.dependencies
        }

        fn phase(&self) -> Phase {
            self.phase
        }

        fn handle(&self, _caps: &Captures<'_>, _ctx: &ParseContext) -> Result<String, HandlerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.to == "!fail" {
                return Err(HandlerError::Failed("refused".to_owned()));
            }
            if self.to == "!panic" {
                panic!("handler exploded");
            }
            Ok(self.to.clone())
        }
    }

    fn ctx() -> ParseContext {
        ParseContext::new(&RenderContext::new("Main"), Arc::new(Services::new()), 0)
    }

    fn resolved(registry: &HandlerRegistry) -> Vec<ResolvedHandler> {
        registry.resolve_execution_order().ok().unwrap()
    }

    #[test]
    fn test_default_process_replaces_all_matches() {
        let handler = Replace::new("r", "a", "b", 10);
        assert_eq!(handler.process("a-a-c", &ctx()).unwrap(), "b-b-c");
    }

    #[test]
    fn test_run_phase_applies_in_resolved_order() {
        let registry = HandlerRegistry::default();
        registry
            .register(Replace::new("a", "y", "z", 90).depends_on("b").arc())
            .unwrap();
        registry.register(Replace::new("b", "x", "y", 50).arc()).unwrap();
        let facade = CacheFacade::new(&MemoryCache::new(), &Config::default());
        let mut ctx = ctx();

        let out = run_phase(
            &resolved(&registry),
            Phase::Handle,
            "x".to_owned(),
            &mut ctx,
            facade.region(CacheRegionId::HandlerResults),
        );
        assert_eq!(out, "z");
        assert!(!ctx.report().has_errors());
    }

    #[test]
    fn test_run_phase_skips_other_phases() {
        let registry = HandlerRegistry::default();
        registry
            .register(Replace::new("pre", "x", "y", 10).in_phase(Phase::Preprocess).arc())
            .unwrap();
        let facade = CacheFacade::new(&MemoryCache::new(), &Config::default());
        let out = run_phase(
            &resolved(&registry),
            Phase::Handle,
            "x".to_owned(),
            &mut ctx(),
            facade.region(CacheRegionId::HandlerResults),
        );
        assert_eq!(out, "x");
    }

    #[test]
    fn test_failures_leave_content_and_are_reported() {
        let registry = HandlerRegistry::default();
        registry.register(Replace::new("bad", "x", "!fail", 90).arc()).unwrap();
        registry.register(Replace::new("boom", "x", "!panic", 80).arc()).unwrap();
        registry.register(Replace::new("good", "x", "ok", 70).arc()).unwrap();
        let facade = CacheFacade::new(&MemoryCache::new(), &Config::default());
        let mut ctx = ctx();

        let out = run_phase(
            &resolved(&registry),
            Phase::Handle,
            "x".to_owned(),
            &mut ctx,
            facade.region(CacheRegionId::HandlerResults),
        );
        assert_eq!(out, "ok");
        let failed: Vec<_> = ctx
            .report()
            .errors
            .iter()
            .filter_map(|e| e.component.clone())
            .collect();
        assert_eq!(failed, vec!["bad", "boom"]);
        assert_eq!(registry.stats().errors, 2);
    }

    #[test]
    fn test_handler_output_cached() {
        let registry = HandlerRegistry::default();
        let handler = Arc::new(Replace::new("r", "x", "y", 10));
        registry.register(Arc::clone(&handler) as Arc<dyn SyntaxHandler>).unwrap();
        let facade = CacheFacade::new(&MemoryCache::new(), &Config::default());
        let region = facade.region(CacheRegionId::HandlerResults);
        let order = resolved(&registry);

        for _ in 0..2 {
            let out = run_phase(&order, Phase::Handle, "x".to_owned(), &mut ctx(), region);
            assert_eq!(out, "y");
        }
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_builtin_table_ids_unique() {
        let mut ids: Vec<_> = BUILTIN_HANDLERS.iter().map(|(id, _)| *id).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), BUILTIN_HANDLERS.len());

        let config = Config::default();
        for (id, factory) in BUILTIN_HANDLERS {
            assert_eq!(factory(&config).id(), *id);
        }
    }
}
