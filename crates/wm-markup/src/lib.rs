//! Wiki markup to sanitized HTML rendering pipeline.
//!
//! This crate renders wiki markup, a superset of markdown with variables
//! (`[{$name}]`), plugin invocations (`[{Name key=value}]`), wiki links
//! (`[text|Page]`), escapes (`[[text]`), style blocks (`%%class … /%`) and
//! wiki tables, into HTML that is safe to embed in a page template.
//!
//! # Architecture
//!
//! [`MarkupPipeline`] runs a fixed phase sequence (see [`Phase`]):
//! - Code spans and fenced blocks are protected from wiki processing.
//! - The [`ExtractionEngine`] pulls inline wiki constructs out of the text
//!   into placeholders so the markdown converter never sees them.
//! - [`SyntaxHandler`]s from the [`HandlerRegistry`] rewrite block constructs
//!   in dependency order. Wiki tags (`<wiki:If>` and friends) are resolved
//!   before extraction, wiki forms after the HTML is sanitized.
//! - [`ContentFilter`]s in the [`FilterChain`] strip dangerous content,
//!   detect spam and validate.
//! - The [`MarkdownConverter`] turns the text into HTML, and the extracted
//!   constructs are rendered and merged back in.
//!
//! Failures are contained: a broken plugin becomes an inline error marker, a
//! failing handler or filter leaves the content as it was, and everything
//! absorbed is listed in the [`RenderReport`].
//!
//! # Example
//!
//! ```
//! use wm_markup::{MarkupPipeline, RenderContext};
//!
//! let pipeline = MarkupPipeline::new().unwrap();
//! let html = pipeline.render("See [Main Page]", &RenderContext::new("Start"));
//! assert_eq!(
//!     html,
//!     r#"<p>See <a class="wiki-link wikipage" href="/wiki/Main%20Page">Main Page</a></p>"#
//! );
//! ```

mod cache;
mod context;
mod error;
mod extract;
pub mod filter;
pub mod handler;
mod markdown;
mod metrics;
mod pipeline;
mod report;
mod util;

pub use cache::{RegionStats, memory_cache_for};
pub use context::{
    AlertSink, PageIndex, ParseContext, PluginError, PluginExecutor, PolicyChecker,
    RenderContext, Services, VariableResolver,
};
pub use error::{PipelineError, RegistryError};
pub use extract::{
    Element, ElementError, ExtractedElement, Extraction, ExtractionEngine, LinkKind, LinkResolver,
    PluginParams,
};
pub use filter::{ContentFilter, FilterChain, FilterChainError, FilterError};
pub use handler::{HandlerError, HandlerRegistry, SyntaxHandler};
pub use markdown::{CommonMarkConverter, MarkdownConverter};
pub use metrics::{Alert, AlertKind, MAX_ALERTS, Metrics, PhaseMetrics, RegionMetrics};
pub use pipeline::{MarkupPipeline, MarkupPipelineBuilder};
pub use report::{Phase, PhaseTiming, RenderReport, ReportedError};
pub use util::escape_html;
