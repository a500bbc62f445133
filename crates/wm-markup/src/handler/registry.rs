//! Handler registry with dependency-aware ordering.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use serde::Serialize;
use wm_config::MAX_PRIORITY;

use super::SyntaxHandler;
use crate::error::RegistryError;
use crate::report::Phase;

/// Default upper bound on registered handlers.
pub const DEFAULT_MAX_HANDLERS: usize = 100;

/// Execution counters for one handler.
#[derive(Debug, Default)]
pub(crate) struct HandlerStats {
    executions: AtomicU64,
    errors: AtomicU64,
    total_nanos: AtomicU64,
}

impl HandlerStats {
    pub(crate) fn record(&self, elapsed: Duration, ok: bool) {
        self.executions.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
        let nanos = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        self.total_nanos.fetch_add(nanos, Ordering::Relaxed);
    }

    fn snapshot(&self, id: &str) -> HandlerStatsSnapshot {
        let executions = self.executions.load(Ordering::Relaxed);
        let total = Duration::from_nanos(self.total_nanos.load(Ordering::Relaxed));
        HandlerStatsSnapshot {
            id: id.to_owned(),
            executions,
            errors: self.errors.load(Ordering::Relaxed),
            total_time: total,
            average_time: if executions == 0 {
                Duration::ZERO
            } else {
                total / u32::try_from(executions).unwrap_or(u32::MAX)
            },
        }
    }

    fn reset(&self) {
        self.executions.store(0, Ordering::Relaxed);
        self.errors.store(0, Ordering::Relaxed);
        self.total_nanos.store(0, Ordering::Relaxed);
    }
}

/// Statistics of one handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HandlerStatsSnapshot {
    pub id: String,
    pub executions: u64,
    pub errors: u64,
    pub total_time: Duration,
    pub average_time: Duration,
}

/// Aggregate registry statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub registered: usize,
    pub enabled: usize,
    pub executions: u64,
    pub errors: u64,
    pub handlers: Vec<HandlerStatsSnapshot>,
}

/// Registration state of one handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HandlerDescriptor {
    pub id: String,
    pub pattern: String,
    pub priority: u32,
    pub dependencies: Vec<String>,
    pub enabled: bool,
    pub phase: Phase,
    pub timeout: Duration,
}

/// A handler in resolved execution order, with its counters.
#[derive(Clone)]
pub(crate) struct ResolvedHandler {
    pub(crate) handler: Arc<dyn SyntaxHandler>,
    pub(crate) stats: Arc<HandlerStats>,
}

struct Entry {
    handler: Arc<dyn SyntaxHandler>,
    priority: u32,
    enabled: bool,
    stats: Arc<HandlerStats>,
}

/// Owns syntax handlers and computes their execution order.
///
/// Reads and admin mutations go through one `RwLock`, so a render resolving
/// the order sees either the state before or after a concurrent mutation.
pub struct HandlerRegistry {
    entries: RwLock<BTreeMap<String, Entry>>,
    max_handlers: usize,
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_HANDLERS)
    }
}

impl HandlerRegistry {
    #[must_use]
    pub fn new(max_handlers: usize) -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            max_handlers,
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, Entry>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<String, Entry>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a handler at its own priority.
    pub fn register(&self, handler: Arc<dyn SyntaxHandler>) -> Result<(), RegistryError> {
        let priority = handler.priority();
        self.register_with_priority(handler, priority)
    }

    /// Register a handler at an explicit priority.
    pub fn register_with_priority(
        &self,
        handler: Arc<dyn SyntaxHandler>,
        priority: u32,
    ) -> Result<(), RegistryError> {
        let id = handler.id().to_owned();
        if priority > MAX_PRIORITY {
            return Err(RegistryError::InvalidPriority { id, priority });
        }
        let phase = handler.phase();
        if !matches!(phase, Phase::Preprocess | Phase::Handle | Phase::PostProcess) {
            return Err(RegistryError::InvalidPhase { id, phase });
        }

        let mut entries = self.write();
        if entries.contains_key(&id) {
            return Err(RegistryError::DuplicateId(id));
        }
        if entries.len() >= self.max_handlers {
            return Err(RegistryError::LimitExceeded {
                id,
                limit: self.max_handlers,
            });
        }
        if let Some((other, _)) = entries
            .iter()
            .find(|(_, e)| e.handler.pattern().as_str() == handler.pattern().as_str())
        {
            tracing::warn!(handler = %id, other = %other, "Handler pattern conflicts with an existing handler");
        }

        tracing::debug!(handler = %id, priority, phase = %phase, "Registered handler");
        entries.insert(
            id,
            Entry {
                handler,
                priority,
                enabled: true,
                stats: Arc::new(HandlerStats::default()),
            },
        );
        Ok(())
    }

    /// Remove a handler that no other handler depends on.
    pub fn unregister(&self, id: &str) -> Result<(), RegistryError> {
        let mut entries = self.write();
        if !entries.contains_key(id) {
            return Err(RegistryError::NotFound(id.to_owned()));
        }
        let dependents: Vec<String> = entries
            .iter()
            .filter(|(other, e)| {
                other.as_str() != id && e.handler.dependencies().iter().any(|d| d == id)
            })
            .map(|(other, _)| other.clone())
            .collect();
        if !dependents.is_empty() {
            return Err(RegistryError::HasDependents {
                id: id.to_owned(),
                dependents,
            });
        }
        entries.remove(id);
        tracing::debug!(handler = id, "Unregistered handler");
        Ok(())
    }

    pub fn set_enabled(&self, id: &str, enabled: bool) -> Result<(), RegistryError> {
        let mut entries = self.write();
        let entry = entries
            .get_mut(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_owned()))?;
        entry.enabled = enabled;
        tracing::debug!(handler = id, enabled, "Handler toggled");
        Ok(())
    }

    pub fn set_priority(&self, id: &str, priority: u32) -> Result<(), RegistryError> {
        if priority > MAX_PRIORITY {
            return Err(RegistryError::InvalidPriority {
                id: id.to_owned(),
                priority,
            });
        }
        let mut entries = self.write();
        let entry = entries
            .get_mut(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_owned()))?;
        entry.priority = priority;
        Ok(())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Ids of all registered handlers in the current execution order.
    ///
    /// Disabled handlers and handlers that fail resolution are left out.
    pub fn execution_order(&self) -> Result<Vec<String>, RegistryError> {
        Ok(self
            .resolve_execution_order()?
            .iter()
            .map(|r| r.handler.id().to_owned())
            .collect())
    }

    /// Registration state of every handler, by descending priority.
    #[must_use]
    pub fn descriptors(&self) -> Vec<HandlerDescriptor> {
        let entries = self.read();
        let mut descriptors: Vec<_> = entries
            .values()
            .map(|e| HandlerDescriptor {
                id: e.handler.id().to_owned(),
                pattern: e.handler.pattern().as_str().to_owned(),
                priority: e.priority,
                dependencies: e.handler.dependencies().to_vec(),
                enabled: e.enabled,
                phase: e.handler.phase(),
                timeout: e.handler.timeout(),
            })
            .collect();
        descriptors.sort_by(|a, b| (Reverse(a.priority), &a.id).cmp(&(Reverse(b.priority), &b.id)));
        descriptors
    }

    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        let entries = self.read();
        let handlers: Vec<_> = entries
            .iter()
            .map(|(id, e)| e.stats.snapshot(id))
            .collect();
        RegistryStats {
            registered: entries.len(),
            enabled: entries.values().filter(|e| e.enabled).count(),
            executions: handlers.iter().map(|h| h.executions).sum(),
            errors: handlers.iter().map(|h| h.errors).sum(),
            handlers,
        }
    }

    pub fn reset_stats(&self) {
        for entry in self.read().values() {
            entry.stats.reset();
        }
    }

    /// Resolve the execution order of all enabled handlers.
    ///
    /// Handlers are visited by descending priority, ties broken by id, and each
    /// handler's dependencies are placed before it depth-first. Fails on the
    /// first cycle, missing or disabled dependency, or dependency that runs in
    /// a later phase.
    pub(crate) fn resolve_execution_order(&self) -> Result<Vec<ResolvedHandler>, RegistryError> {
        let (order, mut errors) = self.resolve(true);
        match errors.pop() {
            Some(err) => Err(err),
            None => Ok(order),
        }
    }

    /// Resolve the order, leaving out handlers that fail resolution.
    ///
    /// Used by renders so that one misconfigured handler does not disable the
    /// rest. The errors for the skipped handlers are returned alongside.
    pub(crate) fn resolve_partial(&self) -> (Vec<ResolvedHandler>, Vec<RegistryError>) {
        self.resolve(false)
    }

    fn resolve(&self, fail_fast: bool) -> (Vec<ResolvedHandler>, Vec<RegistryError>) {
        let entries = self.read();
        let mut seeds: Vec<(&String, &Entry)> = entries.iter().filter(|(_, e)| e.enabled).collect();
        seeds.sort_by(|a, b| (Reverse(a.1.priority), a.0).cmp(&(Reverse(b.1.priority), b.0)));

        let mut walk = Walk {
            entries: &entries,
            visiting: HashSet::new(),
            visited: HashSet::new(),
            failed: HashMap::new(),
            order: Vec::new(),
        };
        let mut errors = Vec::new();

        for (id, _) in seeds {
            let mark = walk.order.len();
            if let Err(err) = walk.visit(id) {
                tracing::warn!(handler = %id, error = %err, "Handler excluded from execution order");
                for rolled_back in walk.order.drain(mark..) {
                    walk.visited.remove(rolled_back.as_str());
                }
                walk.visiting.clear();
                walk.failed.insert(id.as_str(), err.clone());
                errors.push(err);
                if fail_fast {
                    return (Vec::new(), errors);
                }
            }
        }

        let order = walk
            .order
            .iter()
            .filter_map(|id| entries.get(id))
            .map(|e| ResolvedHandler {
                handler: Arc::clone(&e.handler),
                stats: Arc::clone(&e.stats),
            })
            .collect();
        (order, errors)
    }
}

/// Depth-first traversal state.
struct Walk<'a> {
    entries: &'a BTreeMap<String, Entry>,
    visiting: HashSet<&'a str>,
    visited: HashSet<&'a str>,
    failed: HashMap<&'a str, RegistryError>,
    order: Vec<String>,
}

impl<'a> Walk<'a> {
    fn visit(&mut self, id: &'a str) -> Result<(), RegistryError> {
        if self.visited.contains(id) {
            return Ok(());
        }
        if let Some(err) = self.failed.get(id) {
            return Err(err.clone());
        }
        if !self.visiting.insert(id) {
            return Err(RegistryError::CircularDependency(id.to_owned()));
        }
        let entries = self.entries;
        let Some(entry) = entries.get(id) else {
            return Err(RegistryError::NotFound(id.to_owned()));
        };

        for dependency in entry.handler.dependencies() {
            let Some((dep_id, dep)) = entries.get_key_value(dependency.as_str()) else {
                return Err(RegistryError::MissingDependency {
                    handler: id.to_owned(),
                    dependency: dependency.clone(),
                });
            };
            if !dep.enabled {
                return Err(RegistryError::DisabledDependency {
                    handler: id.to_owned(),
                    dependency: dependency.clone(),
                });
            }
            if dep.handler.phase() > entry.handler.phase() {
                return Err(RegistryError::PhaseOrder {
                    handler: id.to_owned(),
                    dependency: dependency.clone(),
                });
            }
            self.visit(dep_id.as_str())?;
        }

        self.visiting.remove(id);
        self.visited.insert(id);
        self.order.push(id.to_owned());
        Ok(())
    }
}
