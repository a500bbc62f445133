//! Ordered, timed execution of content filters.

use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use wm_config::{FilterPipelineConfig, MAX_PRIORITY};

use super::{ContentFilter, FilterCategory, FilterChainError, FilterError};
use crate::cache::RegionHandle;
use crate::context::ParseContext;
use crate::error::RegistryError;
use crate::metrics::{Alert, AlertKind, AlertLog};
use crate::report::Phase;
use crate::util::{hash_parts, panic_message};

/// Chain executions kept for performance checks.
const MONITOR_WINDOW: usize = 100;
/// Samples needed before the monitor raises alerts.
const MONITOR_MIN_SAMPLES: usize = 10;
/// Samples averaged by the monitor.
const MONITOR_RECENT: usize = 20;
/// Minimum time between two threshold checks.
const MONITOR_CHECK_INTERVAL: Duration = Duration::from_secs(60);
const SLOW_CHAIN: Duration = Duration::from_millis(1000);
const MAX_CHAIN_ERROR_RATE: f64 = 0.1;

#[derive(Debug, Default)]
struct FilterStats {
    executions: AtomicU64,
    errors: AtomicU64,
    timeouts: AtomicU64,
    total_nanos: AtomicU64,
}

impl FilterStats {
    fn record(&self, elapsed: Duration, ok: bool) {
        self.executions.fetch_add(1, Ordering::Relaxed);
        self.total_nanos.fetch_add(
            u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX),
            Ordering::Relaxed,
        );
        if !ok {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self, id: &str) -> FilterStatsSnapshot {
        let executions = self.executions.load(Ordering::Relaxed);
        let total_time = Duration::from_nanos(self.total_nanos.load(Ordering::Relaxed));
        let average_time = u32::try_from(executions)
            .ok()
            .filter(|n| *n > 0)
            .map_or(Duration::ZERO, |n| total_time / n);
        FilterStatsSnapshot {
            id: id.to_owned(),
            executions,
            errors: self.errors.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            total_time,
            average_time,
        }
    }

    fn reset(&self) {
        self.executions.store(0, Ordering::Relaxed);
        self.errors.store(0, Ordering::Relaxed);
        self.timeouts.store(0, Ordering::Relaxed);
        self.total_nanos.store(0, Ordering::Relaxed);
    }
}

/// Statistics of one filter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FilterStatsSnapshot {
    pub id: String,
    pub executions: u64,
    pub errors: u64,
    pub timeouts: u64,
    pub total_time: Duration,
    pub average_time: Duration,
}

/// Registration state of one filter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FilterDescriptor {
    pub id: String,
    pub priority: u32,
    pub category: FilterCategory,
    pub enabled: bool,
    pub cache_ttl: Option<Duration>,
    pub stats: FilterStatsSnapshot,
}

/// Aggregate chain statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChainStats {
    pub registered: usize,
    pub enabled: usize,
    /// Chain runs.
    pub executions: u64,
    /// Chain runs in which at least one filter failed.
    pub errors: u64,
    pub filters: Vec<FilterStatsSnapshot>,
    pub alerts: Vec<Alert>,
}

#[derive(Clone)]
struct Entry {
    filter: Arc<dyn ContentFilter>,
    enabled: bool,
    stats: Arc<FilterStats>,
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    elapsed: Duration,
    failed: bool,
}

#[derive(Debug, Default)]
struct Monitor {
    samples: VecDeque<Sample>,
    alerts: AlertLog,
    last_check: Option<Instant>,
}

impl Monitor {
    #[allow(clippy::cast_precision_loss)]
    fn record(&mut self, sample: Sample, ctx: &ParseContext) {
        if self.samples.len() == MONITOR_WINDOW {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
        if self.samples.len() < MONITOR_MIN_SAMPLES {
            return;
        }
        let now = Instant::now();
        if self
            .last_check
            .is_some_and(|last| now.duration_since(last) < MONITOR_CHECK_INTERVAL)
        {
            return;
        }
        self.last_check = Some(now);

        let recent: Vec<Sample> = self
            .samples
            .iter()
            .rev()
            .take(MONITOR_RECENT)
            .copied()
            .collect();
        let count = u32::try_from(recent.len()).unwrap_or(u32::MAX);
        let average = recent.iter().map(|s| s.elapsed).sum::<Duration>() / count;
        let failed = recent.iter().filter(|s| s.failed).count();
        let error_rate = failed as f64 / recent.len() as f64;

        let sink = ctx.services().alerts();
        if average > SLOW_CHAIN {
            let ms = average.as_secs_f64() * 1000.0;
            self.alerts.raise(
                Alert::new(
                    AlertKind::SlowFilterExecution,
                    ms,
                    SLOW_CHAIN.as_secs_f64() * 1000.0,
                    format!("Average filter chain time {ms:.1} ms exceeds {SLOW_CHAIN:?}"),
                ),
                sink,
            );
        }
        if error_rate > MAX_CHAIN_ERROR_RATE {
            self.alerts.raise(
                Alert::new(
                    AlertKind::HighFilterErrorRate,
                    error_rate,
                    MAX_CHAIN_ERROR_RATE,
                    format!("Filter error rate {error_rate:.2} above {MAX_CHAIN_ERROR_RATE}"),
                ),
                sink,
            );
        }
    }
}

/// Registered content filters and how to run them.
///
/// Filters run by descending priority, ties broken by id. In sequential mode
/// each filter sees the previous filter's output. In parallel mode filters
/// sharing a priority start together on the same input and the first to
/// succeed provides the output of that priority group.
///
/// Every filter runs on a worker thread and is raced against the timeout. A
/// timed-out filter keeps running in the background; its result is dropped.
pub struct FilterChain {
    entries: RwLock<Vec<Entry>>,
    max_filters: usize,
    timeout: Duration,
    fail_on_error: bool,
    parallel: bool,
    profiling: bool,
    executions: AtomicU64,
    errors: AtomicU64,
    monitor: Mutex<Monitor>,
}

impl FilterChain {
    #[must_use]
    pub fn new(config: &FilterPipelineConfig) -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            max_filters: config.max_filters,
            timeout: Duration::from_millis(config.timeout_ms),
            fail_on_error: config.fail_on_error,
            parallel: config.enable_parallel_execution,
            profiling: config.enable_profiling,
            executions: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            monitor: Mutex::new(Monitor::default()),
        }
    }

    /// Register an enabled filter.
    pub fn add_filter(&self, filter: Arc<dyn ContentFilter>) -> Result<(), RegistryError> {
        let id = filter.id().to_owned();
        if filter.priority() > MAX_PRIORITY {
            return Err(RegistryError::InvalidPriority {
                id,
                priority: filter.priority(),
            });
        }

        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if entries.iter().any(|e| e.filter.id() == id) {
            return Err(RegistryError::DuplicateId(id));
        }
        if entries.len() >= self.max_filters {
            return Err(RegistryError::LimitExceeded {
                id,
                limit: self.max_filters,
            });
        }

        tracing::debug!(filter = %id, priority = filter.priority(), "Registered filter");
        entries.push(Entry {
            filter,
            enabled: true,
            stats: Arc::new(FilterStats::default()),
        });
        entries.sort_by(|a, b| {
            b.filter
                .priority()
                .cmp(&a.filter.priority())
                .then_with(|| a.filter.id().cmp(b.filter.id()))
        });
        Ok(())
    }

    pub fn remove_filter(&self, id: &str) -> Result<(), RegistryError> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let index = entries
            .iter()
            .position(|e| e.filter.id() == id)
            .ok_or_else(|| RegistryError::NotFound(id.to_owned()))?;
        entries.remove(index);
        Ok(())
    }

    pub fn set_enabled(&self, id: &str, enabled: bool) -> Result<(), RegistryError> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let entry = entries
            .iter_mut()
            .find(|e| e.filter.id() == id)
            .ok_or_else(|| RegistryError::NotFound(id.to_owned()))?;
        entry.enabled = enabled;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids of enabled filters in execution order.
    pub(crate) fn active_ids(&self) -> Vec<String> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| e.enabled)
            .map(|e| e.filter.id().to_owned())
            .collect()
    }

    /// Registered filters in execution order.
    pub fn descriptors(&self) -> Vec<FilterDescriptor> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|e| FilterDescriptor {
                id: e.filter.id().to_owned(),
                priority: e.filter.priority(),
                category: e.filter.category(),
                enabled: e.enabled,
                cache_ttl: e.filter.cache_ttl(),
                stats: e.stats.snapshot(e.filter.id()),
            })
            .collect()
    }

    pub fn stats(&self) -> ChainStats {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        ChainStats {
            registered: entries.len(),
            enabled: entries.iter().filter(|e| e.enabled).count(),
            executions: self.executions.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            filters: entries
                .iter()
                .map(|e| e.stats.snapshot(e.filter.id()))
                .collect(),
            alerts: self
                .monitor
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .alerts
                .recent(),
        }
    }

    pub fn reset_stats(&self) {
        for entry in self.entries.read().unwrap_or_else(PoisonError::into_inner).iter() {
            entry.stats.reset();
        }
        self.executions.store(0, Ordering::Relaxed);
        self.errors.store(0, Ordering::Relaxed);
        *self.monitor.lock().unwrap_or_else(PoisonError::into_inner) = Monitor::default();
    }

    /// Run the enabled filters over `content`.
    ///
    /// Failures are recorded in the context's report and the content from
    /// before the failing filter is kept, unless the chain is configured to
    /// fail on error.
    pub(crate) fn process(
        &self,
        content: String,
        ctx: &mut ParseContext,
        cache: &RegionHandle,
    ) -> Result<String, FilterChainError> {
        let active: Vec<Entry> = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| e.enabled)
            .cloned()
            .collect();
        if active.is_empty() {
            return Ok(content);
        }

        let start = Instant::now();
        let mut failed = false;
        let mut content = content;

        for group in priority_groups(&active, self.parallel) {
            let outcome = if group.len() == 1 {
                let entry = &group[0];
                self.run_cached(entry, &content, ctx, cache)
                    .map_err(|e| vec![(entry.filter.id().to_owned(), e)])
            } else {
                self.run_group(group, &content, ctx)
            };

            match outcome {
                Ok(output) => content = output,
                Err(mut errors) => {
                    failed = true;
                    if self.fail_on_error && !errors.is_empty() {
                        self.finish(start, true, ctx);
                        let (filter, source) = errors.swap_remove(0);
                        return Err(FilterChainError { filter, source });
                    }
                    for (filter, error) in errors {
                        tracing::warn!(filter = %filter, error = %error, "Filter failed");
                        ctx.report
                            .push_error(Phase::Filter, Some(filter.as_str()), error.to_string());
                    }
                }
            }
        }

        self.finish(start, failed, ctx);
        Ok(content)
    }

    /// Run the HTML pass of the enabled filters over `html`, in order.
    ///
    /// A failing filter is reported and skipped. The pass is synchronous and
    /// never cached, since it runs once per render on the final markup.
    pub(crate) fn process_html(&self, html: String, ctx: &mut ParseContext) -> String {
        let active: Vec<Arc<dyn ContentFilter>> = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| e.enabled)
            .map(|e| Arc::clone(&e.filter))
            .collect();

        let mut html = html;
        for filter in active {
            let outcome = catch_unwind(AssertUnwindSafe(|| filter.process_html(&html, ctx)))
                .unwrap_or_else(|payload| {
                    Err(FilterError::Execution(panic_message(payload.as_ref())))
                });
            match outcome {
                Ok(output) => html = output,
                Err(e) => {
                    tracing::warn!(filter = filter.id(), error = %e, "HTML filter failed");
                    ctx.report
                        .push_error(Phase::Filter, Some(filter.id()), e.to_string());
                }
            }
        }
        html
    }

    fn finish(&self, start: Instant, failed: bool, ctx: &ParseContext) {
        self.executions.fetch_add(1, Ordering::Relaxed);
        if failed {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
        if self.profiling {
            self.monitor
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .record(
                    Sample {
                        elapsed: start.elapsed(),
                        failed,
                    },
                    ctx,
                );
        }
    }

    fn run_cached(
        &self,
        entry: &Entry,
        content: &str,
        ctx: &ParseContext,
        cache: &RegionHandle,
    ) -> Result<String, FilterError> {
        let Some(ttl) = entry.filter.cache_ttl() else {
            return self.run_one(entry, content, ctx);
        };

        let key = format!(
            "filter:{}:{}:{}",
            entry.filter.id(),
            hash_parts(&[&content.replace(&ctx.token, "")]),
            ctx.context_hash()
        );
        if let Some(cached) = cache.get_string(&key) {
            return Ok(cached.replace("{{token}}", &ctx.token));
        }
        let output = self.run_one(entry, content, ctx)?;
        cache.set_string_with_ttl(&key, &output.replace(&ctx.token, "{{token}}"), ttl);
        Ok(output)
    }

    fn run_one(
        &self,
        entry: &Entry,
        content: &str,
        ctx: &ParseContext,
    ) -> Result<String, FilterError> {
        let (tx, rx) = mpsc::channel();
        spawn_worker(entry, 0, content, ctx, tx)?;
        match rx.recv_timeout(self.timeout) {
            Ok((_, result)) => result,
            Err(RecvTimeoutError::Timeout) => {
                entry.stats.record_timeout();
                Err(FilterError::Timeout(self.timeout))
            }
            Err(RecvTimeoutError::Disconnected) => Err(FilterError::Execution(
                "filter worker exited without a result".to_owned(),
            )),
        }
    }

    /// Start every filter of a priority group on the same input and take the
    /// first success. All failures are returned when none succeeds.
    fn run_group(
        &self,
        group: &[Entry],
        content: &str,
        ctx: &ParseContext,
    ) -> Result<String, Vec<(String, FilterError)>> {
        let (tx, rx) = mpsc::channel();
        let mut errors = Vec::new();
        let mut pending = vec![false; group.len()];
        for (index, entry) in group.iter().enumerate() {
            match spawn_worker(entry, index, content, ctx, tx.clone()) {
                Ok(()) => pending[index] = true,
                Err(e) => errors.push((entry.filter.id().to_owned(), e)),
            }
        }
        drop(tx);

        let deadline = Instant::now() + self.timeout;
        while pending.iter().any(|p| *p) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match rx.recv_timeout(remaining) {
                Ok((index, Ok(output))) => {
                    tracing::debug!(winner = group[index].filter.id(), "Parallel filter group resolved");
                    return Ok(output);
                }
                Ok((index, Err(e))) => {
                    pending[index] = false;
                    errors.push((group[index].filter.id().to_owned(), e));
                }
                Err(RecvTimeoutError::Timeout) => {
                    for (index, _) in pending.iter().enumerate().filter(|(_, p)| **p) {
                        group[index].stats.record_timeout();
                        errors.push((
                            group[index].filter.id().to_owned(),
                            FilterError::Timeout(self.timeout),
                        ));
                    }
                    break;
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        Err(errors)
    }
}

type WorkerResult = (usize, Result<String, FilterError>);

/// Run one filter on a detached thread, sending its result tagged with `index`.
/// The worker records execution statistics itself.
fn spawn_worker(
    entry: &Entry,
    index: usize,
    content: &str,
    ctx: &ParseContext,
    tx: mpsc::Sender<WorkerResult>,
) -> Result<(), FilterError> {
    let filter = Arc::clone(&entry.filter);
    let stats = Arc::clone(&entry.stats);
    let content = content.to_owned();
    let ctx = ctx.clone();

    thread::Builder::new()
        .name(format!("filter-{}", entry.filter.id()))
        .spawn(move || {
            let start = Instant::now();
            let result = catch_unwind(AssertUnwindSafe(|| filter.process(&content, &ctx)))
                .unwrap_or_else(|payload| {
                    Err(FilterError::Execution(format!(
                        "panicked: {}",
                        panic_message(payload.as_ref())
                    )))
                });
            stats.record(start.elapsed(), result.is_ok());
            // The receiver is gone when the filter timed out.
            let _ = tx.send((index, result));
        })
        .map(|_| ())
        .map_err(|e| FilterError::Execution(format!("cannot start filter worker: {e}")))
}

/// Split ordered entries into execution groups: one per filter, or one per
/// priority when running in parallel.
fn priority_groups(entries: &[Entry], parallel: bool) -> Vec<&[Entry]> {
    if !parallel {
        return entries.chunks(1).collect();
    }
    entries
        .chunk_by(|a, b| a.filter.priority() == b.filter.priority())
        .collect()
}
