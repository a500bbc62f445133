//! Pipeline phases and the per-render error report.

use std::fmt;
use std::time::Duration;

use serde::Serialize;

/// One stage of the fixed render sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Code protection and handlers that must see raw text.
    Preprocess,
    /// Proprietary constructs pulled into placeholders.
    Extract,
    /// Syntax handlers on the remaining text.
    Handle,
    /// Security, spam and validation filters.
    Filter,
    /// External markdown conversion.
    Convert,
    /// Rendered nodes substituted for placeholders.
    Merge,
    /// Final cleanup.
    PostProcess,
}

impl Phase {
    /// All phases in execution order.
    pub const ALL: [Self; 7] = [
        Self::Preprocess,
        Self::Extract,
        Self::Handle,
        Self::Filter,
        Self::Convert,
        Self::Merge,
        Self::PostProcess,
    ];

    /// Stable name used in logs and metrics.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Preprocess => "preprocess",
            Self::Extract => "extract",
            Self::Handle => "handle",
            Self::Filter => "filter",
            Self::Convert => "convert",
            Self::Merge => "merge",
            Self::PostProcess => "post_process",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error caught and absorbed during a render.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportedError {
    /// Phase in which the error occurred.
    pub phase: Phase,
    /// Handler, filter or element that failed (`None` for phase-level faults).
    pub component: Option<String>,
    /// Error message.
    pub message: String,
}

/// Timing of one executed phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PhaseTiming {
    /// The phase.
    pub phase: Phase,
    /// Wall-clock time spent.
    pub elapsed: Duration,
}

/// What happened during one render call.
///
/// Component failures never abort a render; they are collected here so callers
/// that care can inspect them while the page still renders.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RenderReport {
    /// Errors absorbed during the render, in occurrence order.
    pub errors: Vec<ReportedError>,
    /// Per-phase timings, in execution order.
    pub timings: Vec<PhaseTiming>,
    /// Number of extracted elements.
    pub elements: usize,
}

impl RenderReport {
    /// Record an absorbed error.
    pub fn push_error(
        &mut self,
        phase: Phase,
        component: Option<&str>,
        message: impl Into<String>,
    ) {
        self.errors.push(ReportedError {
            phase,
            component: component.map(str::to_owned),
            message: message.into(),
        });
    }

    /// Record a phase timing.
    pub fn push_timing(&mut self, phase: Phase, elapsed: Duration) {
        self.timings.push(PhaseTiming { phase, elapsed });
    }

    /// Whether any error was absorbed.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Errors recorded for `phase`.
    pub fn errors_in(&self, phase: Phase) -> impl Iterator<Item = &ReportedError> {
        self.errors.iter().filter(move |e| e.phase == phase)
    }

    /// Append everything recorded in `other`.
    pub(crate) fn absorb(&mut self, other: RenderReport) {
        self.errors.extend(other.errors);
        self.timings.extend(other.timings);
        self.elements += other.elements;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_order() {
        let mut phases = Phase::ALL.to_vec();
        phases.reverse();
        phases.sort();
        assert_eq!(phases, Phase::ALL.to_vec());
        assert_eq!(Phase::PostProcess.to_string(), "post_process");
    }

    #[test]
    fn test_report_errors_by_phase() {
        let mut report = RenderReport::default();
        assert!(!report.has_errors());

        report.push_error(Phase::Filter, Some("spam"), "boom");
        report.push_error(Phase::Merge, None, "bad");

        assert!(report.has_errors());
        let filter_errors: Vec<_> = report.errors_in(Phase::Filter).collect();
        assert_eq!(filter_errors.len(), 1);
        assert_eq!(filter_errors[0].component.as_deref(), Some("spam"));
    }
}
