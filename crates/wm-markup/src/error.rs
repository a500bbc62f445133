//! Error types for the markup pipeline.

use crate::filter::FilterChainError;
use crate::report::Phase;

/// Error from handler registry or filter chain administration.
///
/// These are configuration mistakes and are returned to the caller instead of
/// being absorbed into a render.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// A component with this id is already registered.
    #[error("'{0}' is already registered")]
    DuplicateId(String),

    /// The configured maximum number of components is reached.
    #[error("cannot register '{id}': limit of {limit} reached")]
    LimitExceeded { id: String, limit: usize },

    /// Priority outside `0..=1000`.
    #[error("priority {priority} of '{id}' is outside 0..=1000")]
    InvalidPriority { id: String, priority: u32 },

    /// No component with this id is registered.
    #[error("'{0}' is not registered")]
    NotFound(String),

    /// Other registered components still depend on this one.
    #[error("'{id}' is required by {}", dependents.join(", "))]
    HasDependents { id: String, dependents: Vec<String> },

    /// The dependency graph contains a cycle through this id.
    #[error("circular dependency detected at '{0}'")]
    CircularDependency(String),

    /// A declared dependency is not registered.
    #[error("'{handler}' depends on missing '{dependency}'")]
    MissingDependency { handler: String, dependency: String },

    /// A declared dependency is disabled.
    #[error("'{handler}' depends on disabled '{dependency}'")]
    DisabledDependency { handler: String, dependency: String },

    /// A dependency runs in a later phase than its dependent.
    #[error("'{handler}' runs before its dependency '{dependency}'")]
    PhaseOrder { handler: String, dependency: String },

    /// Handlers may only run in the preprocess, handle or post-process phase.
    #[error("'{id}' cannot run in the {phase} phase")]
    InvalidPhase { id: String, phase: Phase },
}

/// A fault that escaped a phase.
///
/// Renders never return it; it ends up in the [`RenderReport`] of a render
/// that fell back to the raw content.
///
/// [`RenderReport`]: crate::RenderReport
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Something panicked inside a phase.
    #[error("{phase} phase panicked: {message}")]
    Panicked { phase: Phase, message: String },

    /// A filter failed with `fail_on_error` set.
    #[error(transparent)]
    Filter(#[from] FilterChainError),
}
