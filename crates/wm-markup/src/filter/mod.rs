//! Content filters.
//!
//! Filters run after handlers, over the whole text, and transform or annotate
//! it: security stripping, spam detection, validation. The [`FilterChain`]
//! orders and times them. A second pass over the converted HTML lets a filter
//! clean markup that only exists after conversion.

mod chain;
mod security;
mod spam;
mod validation;

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use wm_config::Config;

pub use chain::{ChainStats, FilterChain, FilterDescriptor, FilterStatsSnapshot};
pub use security::{DANGEROUS_CONTENT_MARKER, SecurityFilter};
pub use spam::{SpamAnalysis, SpamFilter};
pub use validation::{Severity, ValidationFilter, ValidationIssue, ValidationReport};

use crate::context::ParseContext;

/// Failure of one filter invocation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FilterError {
    #[error("{0}")]
    Execution(String),

    /// The filter did not finish in time. Its eventual result is discarded.
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

/// A filter failure that aborted the chain.
#[derive(Debug, thiserror::Error)]
#[error("filter '{filter}' failed")]
pub struct FilterChainError {
    pub filter: String,
    #[source]
    pub source: FilterError,
}

/// Kind of work a filter does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterCategory {
    Security,
    Spam,
    Validation,
    Custom,
}

/// Transforms or annotates content after handler execution.
pub trait ContentFilter: Send + Sync {
    /// Unique id.
    fn id(&self) -> &str;

    /// Higher runs earlier (0 to 1000).
    fn priority(&self) -> u32;

    fn category(&self) -> FilterCategory {
        FilterCategory::Custom
    }

    /// How long output may be cached for identical content and context.
    /// `None` disables caching for this filter.
    fn cache_ttl(&self) -> Option<Duration> {
        None
    }

    fn process(&self, content: &str, ctx: &ParseContext) -> Result<String, FilterError>;

    /// Transform the converted HTML, before extracted elements are merged
    /// back. Placeholder comments must be kept. The default keeps the HTML
    /// as it is.
    fn process_html(&self, html: &str, _ctx: &ParseContext) -> Result<String, FilterError> {
        Ok(html.to_owned())
    }
}

/// A built-in filter and the configuration switch that enables it.
pub(crate) struct BuiltinFilter {
    pub(crate) id: &'static str,
    pub(crate) build: fn(&Config) -> Arc<dyn ContentFilter>,
    pub(crate) enabled: fn(&Config) -> bool,
}

pub(crate) const BUILTIN_FILTERS: &[BuiltinFilter] = &[
    BuiltinFilter {
        id: security::ID,
        build: security::factory,
        enabled: |config| config.filters.security.enabled,
    },
    BuiltinFilter {
        id: spam::ID,
        build: spam::factory,
        enabled: |config| config.filters.spam.enabled,
    },
    BuiltinFilter {
        id: validation::ID,
        build: validation::factory,
        enabled: |config| config.filters.validation.enabled,
    },
];
