//! Render metrics and performance alerts.

use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant, SystemTime};

use serde::Serialize;
use wm_config::AlertThresholds;

use crate::cache::RegionStats;
use crate::context::AlertSink;
use crate::filter::ChainStats;
use crate::handler::RegistryStats;
use crate::report::{Phase, RenderReport};

/// Number of alerts kept before the oldest is dropped.
pub const MAX_ALERTS: usize = 100;

/// Number of recent uncached parse times kept.
const PARSE_TIME_WINDOW: usize = 100;

/// Number of recent parse times averaged for the slow parsing check.
const AVERAGE_WINDOW: usize = 20;

/// What an alert is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    /// Average uncached parse time above the threshold.
    SlowParsing,
    /// Parse result cache hit ratio below the threshold.
    LowCacheHitRatio,
    /// Share of renders with errors above the threshold.
    HighErrorRate,
    /// Average filter chain time above the threshold.
    SlowFilterExecution,
    /// Share of filter chain runs with failures above the threshold.
    HighFilterErrorRate,
}

/// A threshold breach.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub message: String,
    /// Observed value.
    pub value: f64,
    /// Threshold that was breached.
    pub threshold: f64,
    pub raised_at: SystemTime,
}

impl Alert {
    pub(crate) fn new(kind: AlertKind, value: f64, threshold: f64, message: String) -> Self {
        Self {
            kind,
            message,
            value,
            threshold,
            raised_at: SystemTime::now(),
        }
    }
}

/// Bounded history of raised alerts.
#[derive(Debug, Default)]
pub(crate) struct AlertLog {
    alerts: VecDeque<Alert>,
}

impl AlertLog {
    /// Record `alert` and forward it to `sink`.
    pub(crate) fn raise(&mut self, alert: Alert, sink: Option<&dyn AlertSink>) {
        tracing::warn!(kind = ?alert.kind, value = alert.value, threshold = alert.threshold, "{}", alert.message);
        if let Some(sink) = sink {
            sink.notify(&alert);
        }
        if self.alerts.len() == MAX_ALERTS {
            self.alerts.pop_front();
        }
        self.alerts.push_back(alert);
    }

    pub(crate) fn recent(&self) -> Vec<Alert> {
        self.alerts.iter().cloned().collect()
    }
}

/// Timing and error counts of one phase across renders.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PhaseMetrics {
    pub runs: u64,
    pub errors: u64,
    pub total_time: Duration,
}

/// Counters of one cache region.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegionMetrics {
    pub name: &'static str,
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub hit_ratio: f64,
}

impl RegionMetrics {
    pub(crate) fn new(name: &'static str, stats: RegionStats) -> Self {
        Self {
            name,
            hits: stats.hits,
            misses: stats.misses,
            writes: stats.writes,
            hit_ratio: stats.hit_ratio(),
        }
    }
}

/// Aggregate pipeline metrics.
#[derive(Debug, Clone, Serialize)]
pub struct Metrics {
    pub renders: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_hit_ratio: f64,
    /// Renders that absorbed at least one error.
    pub errors: u64,
    pub error_rate: f64,
    /// Average of the most recent uncached parse times.
    pub average_parse_time: Duration,
    pub phases: BTreeMap<Phase, PhaseMetrics>,
    pub cache_regions: Vec<RegionMetrics>,
    pub handlers: RegistryStats,
    pub filters: ChainStats,
    pub alerts: Vec<Alert>,
}

/// How a render was served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Served {
    CacheHit,
    Rendered,
    /// Rendered with the parse result cache disabled.
    Uncached,
}

/// Rolling render counters, checked against alert thresholds.
#[derive(Debug, Default)]
pub(crate) struct RenderMonitor {
    renders: u64,
    cache_hits: u64,
    cache_misses: u64,
    errors: u64,
    parse_times: VecDeque<Duration>,
    phases: BTreeMap<Phase, PhaseMetrics>,
    alerts: AlertLog,
    last_check: Option<Instant>,
}

impl RenderMonitor {
    pub(crate) fn record(
        &mut self,
        served: Served,
        elapsed: Duration,
        report: &RenderReport,
        thresholds: &AlertThresholds,
        sink: Option<&dyn AlertSink>,
    ) {
        self.renders += 1;
        match served {
            Served::CacheHit => self.cache_hits += 1,
            Served::Rendered => self.cache_misses += 1,
            Served::Uncached => {}
        }
        if report.has_errors() {
            self.errors += 1;
        }
        if served != Served::CacheHit {
            if self.parse_times.len() == PARSE_TIME_WINDOW {
                self.parse_times.pop_front();
            }
            self.parse_times.push_back(elapsed);
        }
        for timing in &report.timings {
            let phase = self.phases.entry(timing.phase).or_default();
            phase.runs += 1;
            phase.total_time += timing.elapsed;
        }
        for error in &report.errors {
            self.phases.entry(error.phase).or_default().errors += 1;
        }

        self.check(thresholds, sink);
    }

    fn average_parse_time(&self) -> Duration {
        let recent: Vec<Duration> = self
            .parse_times
            .iter()
            .rev()
            .take(AVERAGE_WINDOW)
            .copied()
            .collect();
        match u32::try_from(recent.len()) {
            Ok(n) if n > 0 => recent.iter().sum::<Duration>() / n,
            _ => Duration::ZERO,
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn hit_ratio(&self) -> f64 {
        let lookups = self.cache_hits + self.cache_misses;
        if lookups == 0 {
            return 0.0;
        }
        self.cache_hits as f64 / lookups as f64
    }

    #[allow(clippy::cast_precision_loss)]
    fn error_rate(&self) -> f64 {
        if self.renders == 0 {
            return 0.0;
        }
        self.errors as f64 / self.renders as f64
    }

    /// Compare the counters with `thresholds`, at most once per
    /// `check_interval_secs`.
    #[allow(clippy::cast_precision_loss)]
    fn check(&mut self, thresholds: &AlertThresholds, sink: Option<&dyn AlertSink>) {
        let now = Instant::now();
        let interval = Duration::from_secs(thresholds.check_interval_secs);
        if self
            .last_check
            .is_some_and(|last| now.duration_since(last) < interval)
        {
            return;
        }
        self.last_check = Some(now);

        let average = self.average_parse_time();
        let limit = Duration::from_millis(thresholds.parse_time_ms);
        if !self.parse_times.is_empty() && average > limit {
            let ms = average.as_secs_f64() * 1000.0;
            self.alerts.raise(
                Alert::new(
                    AlertKind::SlowParsing,
                    ms,
                    thresholds.parse_time_ms as f64,
                    format!(
                        "Average parse time {ms:.1} ms exceeds {} ms",
                        thresholds.parse_time_ms
                    ),
                ),
                sink,
            );
        }

        let lookups = self.cache_hits + self.cache_misses;
        let ratio = self.hit_ratio();
        if lookups >= thresholds.min_cache_samples && ratio < thresholds.cache_hit_ratio {
            self.alerts.raise(
                Alert::new(
                    AlertKind::LowCacheHitRatio,
                    ratio,
                    thresholds.cache_hit_ratio,
                    format!(
                        "Cache hit ratio {ratio:.2} below {:.2}",
                        thresholds.cache_hit_ratio
                    ),
                ),
                sink,
            );
        }

        let rate = self.error_rate();
        if rate > thresholds.error_rate {
            self.alerts.raise(
                Alert::new(
                    AlertKind::HighErrorRate,
                    rate,
                    thresholds.error_rate,
                    format!("Error rate {rate:.2} above {:.2}", thresholds.error_rate),
                ),
                sink,
            );
        }
    }

    pub(crate) fn snapshot(
        &self,
        cache_regions: Vec<RegionMetrics>,
        handlers: RegistryStats,
        filters: ChainStats,
    ) -> Metrics {
        Metrics {
            renders: self.renders,
            cache_hits: self.cache_hits,
            cache_misses: self.cache_misses,
            cache_hit_ratio: self.hit_ratio(),
            errors: self.errors,
            error_rate: self.error_rate(),
            average_parse_time: self.average_parse_time(),
            phases: self.phases.clone(),
            cache_regions,
            handlers,
            filters,
            alerts: self.alerts.recent(),
        }
    }

    pub(crate) fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use pretty_assertions::assert_eq;

    use super::*;

    #[derive(Default)]
    struct Collect(Mutex<Vec<AlertKind>>);

    impl AlertSink for Collect {
        fn notify(&self, alert: &Alert) {
            self.0.lock().unwrap().push(alert.kind);
        }
    }

    fn quiet() -> AlertThresholds {
        AlertThresholds {
            parse_time_ms: 60_000,
            cache_hit_ratio: 0.0,
            error_rate: 1.0,
            min_cache_samples: 0,
            check_interval_secs: 0,
        }
    }

    #[test]
    fn test_alert_log_is_bounded() {
        let mut log = AlertLog::default();
        for i in 0..(MAX_ALERTS + 5) {
            log.raise(
                Alert::new(AlertKind::SlowParsing, i as f64, 0.0, String::new()),
                None,
            );
        }
        let recent = log.recent();
        assert_eq!(recent.len(), MAX_ALERTS);
        assert_eq!(recent[0].value, 5.0);
    }

    #[test]
    fn test_counts_hits_misses_and_errors() {
        let mut monitor = RenderMonitor::default();
        let mut failed = RenderReport::default();
        failed.push_error(Phase::Handle, Some("style"), "boom".to_owned());
        failed.push_timing(Phase::Handle, Duration::from_millis(2));

        monitor.record(Served::Rendered, Duration::from_millis(4), &failed, &quiet(), None);
        monitor.record(
            Served::CacheHit,
            Duration::ZERO,
            &RenderReport::default(),
            &quiet(),
            None,
        );

        let metrics = monitor.snapshot(Vec::new(), RegistryStats::default(), ChainStats::default());
        assert_eq!(metrics.renders, 2);
        assert_eq!(metrics.cache_hits, 1);
        assert_eq!(metrics.cache_misses, 1);
        assert_eq!(metrics.errors, 1);
        assert_eq!(metrics.error_rate, 0.5);
        assert_eq!(metrics.average_parse_time, Duration::from_millis(4));
        assert_eq!(metrics.phases[&Phase::Handle].errors, 1);
        assert_eq!(metrics.phases[&Phase::Handle].runs, 1);
    }

    #[test]
    fn test_slow_parsing_alert_forwarded() {
        let sink = Collect::default();
        let mut monitor = RenderMonitor::default();
        let thresholds = AlertThresholds {
            parse_time_ms: 1,
            ..quiet()
        };
        monitor.record(
            Served::Uncached,
            Duration::from_millis(5),
            &RenderReport::default(),
            &thresholds,
            Some(&sink),
        );
        assert_eq!(*sink.0.lock().unwrap(), vec![AlertKind::SlowParsing]);
    }

    #[test]
    fn test_hit_ratio_alert_waits_for_samples() {
        let mut monitor = RenderMonitor::default();
        let thresholds = AlertThresholds {
            cache_hit_ratio: 0.5,
            min_cache_samples: 3,
            ..quiet()
        };
        let report = RenderReport::default();
        for _ in 0..2 {
            monitor.record(Served::Rendered, Duration::ZERO, &report, &thresholds, None);
        }
        assert!(monitor.alerts.recent().is_empty());

        monitor.record(Served::Rendered, Duration::ZERO, &report, &thresholds, None);
        let kinds: Vec<_> = monitor.alerts.recent().iter().map(|a| a.kind).collect();
        assert_eq!(kinds, vec![AlertKind::LowCacheHitRatio]);
    }

    #[test]
    fn test_breaches_within_interval_raise_one_alert() {
        let sink = Collect::default();
        let mut monitor = RenderMonitor::default();
        let thresholds = AlertThresholds {
            parse_time_ms: 1,
            check_interval_secs: 60,
            ..quiet()
        };
        for _ in 0..2 {
            monitor.record(
                Served::Uncached,
                Duration::from_millis(5),
                &RenderReport::default(),
                &thresholds,
                Some(&sink),
            );
        }
        assert_eq!(*sink.0.lock().unwrap(), vec![AlertKind::SlowParsing]);
        assert_eq!(monitor.alerts.recent().len(), 1);
    }

    #[test]
    fn test_high_error_rate_alert() {
        let mut monitor = RenderMonitor::default();
        let thresholds = AlertThresholds {
            error_rate: 0.25,
            ..quiet()
        };
        let mut failed = RenderReport::default();
        failed.push_error(Phase::Merge, Some("plugin"), "boom".to_owned());
        let clean = RenderReport::default();

        for _ in 0..3 {
            monitor.record(Served::Rendered, Duration::ZERO, &clean, &thresholds, None);
        }
        assert!(monitor.alerts.recent().is_empty());

        monitor.record(Served::Rendered, Duration::ZERO, &failed, &thresholds, None);
        assert!(monitor.alerts.recent().is_empty());
        monitor.record(Served::Rendered, Duration::ZERO, &failed, &thresholds, None);

        let alerts = monitor.alerts.recent();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, AlertKind::HighErrorRate);
        assert_eq!(alerts[0].value, 0.4);
        assert_eq!(alerts[0].threshold, 0.25);
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut monitor = RenderMonitor::default();
        let thresholds = AlertThresholds {
            error_rate: 0.0,
            ..quiet()
        };
        let mut failed = RenderReport::default();
        failed.push_error(Phase::Filter, None, "x".to_owned());
        monitor.record(Served::Rendered, Duration::ZERO, &failed, &thresholds, None);
        assert!(!monitor.alerts.recent().is_empty());

        monitor.reset();
        let metrics = monitor.snapshot(Vec::new(), RegistryStats::default(), ChainStats::default());
        assert_eq!(metrics.renders, 0);
        assert!(metrics.alerts.is_empty());
    }
}
