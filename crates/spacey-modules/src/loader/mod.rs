// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Loader engine
//!
//! Fetches module text through a [`ModuleSource`], parses it, and later
//! evaluates it. Concurrent fetches of one key share a single task; each task
//! waits for a slot from the [`PriorityScheduler`], races every attempt
//! against a timeout and retries network-class failures with backoff.

mod scheduler;
mod stats;

pub use scheduler::{Permit, PriorityScheduler};
pub use stats::{KeyTiming, LoadStats};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared, WeakShared};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

use crate::binding::{ExportWriter, Namespace};
use crate::error::{AttemptFailure, FailureKind, ModuleError};
use crate::graph::EdgeKind;
use crate::host::{Clock, ModuleSource, SourceErrorKind};
use crate::key::ModuleKey;
use crate::policy::CircuitBreaker;
use crate::record::{ModuleRecord, ModuleState};
use crate::registry::Registry;
use crate::script::{EvalContext, ModuleEvaluator};

/// Per-load options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadOptions {
    /// Deadline of each attempt
    pub timeout: Duration,
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before retry `i` is `retry_backoff[min(i, len - 1)]`
    pub retry_backoff: Vec<Duration>,
    /// Scheduling priority, higher first
    pub priority: i32,
}

impl LoadOptions {
    /// Same options with another priority
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Delay before the retry with 0-based index `retry`
    pub fn backoff(&self, retry: usize) -> Option<Duration> {
        let last = self.retry_backoff.len().checked_sub(1)?;
        self.retry_backoff.get(retry.min(last)).copied()
    }
}

impl Default for LoadOptions {
    fn default() -> Self {
        crate::config::Config::default().load_options()
    }
}

type LoadResult = Result<Arc<ModuleRecord>, ModuleError>;
type LoadFuture = BoxFuture<'static, LoadResult>;
type InFlight = Arc<Mutex<HashMap<ModuleKey, WeakShared<LoadFuture>>>>;

struct LoaderInner {
    registry: Arc<Registry>,
    source: Arc<dyn ModuleSource>,
    evaluator: Arc<dyn ModuleEvaluator>,
    clock: Arc<dyn Clock>,
    scheduler: PriorityScheduler,
    breaker: Arc<CircuitBreaker>,
    stats: Arc<LoadStats>,
    in_flight: InFlight,
}

/// Fetches, parses and evaluates module records
#[derive(Clone)]
pub struct LoaderEngine {
    inner: Arc<LoaderInner>,
}

impl LoaderEngine {
    /// Create a loader
    pub fn new(
        registry: Arc<Registry>,
        source: Arc<dyn ModuleSource>,
        evaluator: Arc<dyn ModuleEvaluator>,
        clock: Arc<dyn Clock>,
        breaker: Arc<CircuitBreaker>,
        max_concurrent: usize,
    ) -> Self {
        Self {
            inner: Arc::new(LoaderInner {
                registry,
                source,
                evaluator,
                clock,
                scheduler: PriorityScheduler::new(max_concurrent),
                breaker,
                stats: Arc::new(LoadStats::new()),
                in_flight: Arc::new(Mutex::new(HashMap::new())),
            }),
        }
    }

    /// Load statistics
    pub fn stats(&self) -> &Arc<LoadStats> {
        &self.inner.stats
    }

    /// Slot scheduler
    pub fn scheduler(&self) -> &PriorityScheduler {
        &self.inner.scheduler
    }

    /// Circuit breaker guarding new tasks
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.inner.breaker
    }

    /// Number of tasks currently in flight
    pub fn in_flight(&self) -> usize {
        // Upgraded handles are dropped after the lock is released
        let live: Vec<Shared<LoadFuture>> = self
            .inner
            .in_flight
            .lock()
            .values()
            .filter_map(WeakShared::upgrade)
            .collect();
        live.len()
    }

    /// Fetch and parse a module.
    ///
    /// Ready records and records already fetched for evaluation return
    /// immediately. Otherwise the call joins the key's in-flight task or
    /// starts one; only starting a task consults the circuit breaker.
    /// Dropping the returned future stops waiting; the task itself is
    /// cancelled once its last waiter is gone.
    #[instrument(skip(self, key, module_type, options), fields(key = %key))]
    pub async fn fetch(
        &self,
        key: &ModuleKey,
        module_type: Option<String>,
        options: &LoadOptions,
    ) -> LoadResult {
        let task = {
            let mut in_flight = self.inner.in_flight.lock();

            match in_flight.get(key).and_then(WeakShared::upgrade) {
                Some(task) => {
                    debug!("Joining in-flight load of {}", key);
                    self.inner.stats.inc_coalesced();
                    task
                }
                None => {
                    let record = self.inner.registry.get_or_create(key);
                    match record.state() {
                        ModuleState::Ready | ModuleState::Evaluating => {
                            debug!("Cache hit for {}", key);
                            self.inner.stats.inc_cache_hit();
                            return Ok(record);
                        }
                        ModuleState::Loading if record.is_fetched() => return Ok(record),
                        _ => {}
                    }

                    if let Err(retry_after) =
                        self.inner.breaker.try_acquire(key, self.inner.clock.now())
                    {
                        debug!("Circuit open for {}", key);
                        self.inner.stats.inc_circuit_rejection();
                        return Err(ModuleError::CircuitOpen {
                            key: key.clone(),
                            retry_after,
                        });
                    }

                    // Claimed under the map lock: no one sees the record
                    // settled while the task waits for a slot
                    if let Err(err) = record.claim() {
                        self.inner.breaker.release_probe(key, self.inner.clock.now());
                        return Err(err);
                    }

                    let task = run_task(self.inner.clone(), record, module_type, options.clone())
                        .boxed()
                        .shared();
                    if let Some(weak) = task.downgrade() {
                        in_flight.insert(key.clone(), weak);
                    }
                    task
                }
            }
        };

        task.await
    }

    /// Run a fetched module.
    ///
    /// Only a record in `Loading` with a parsed module is evaluated, and only
    /// once per load; anything else is left alone. Static dependencies that
    /// failed fail this record too. Dependencies that are not ready yet are
    /// cycle partners still initializing, and are linked as they are.
    pub fn evaluate(&self, record: &Arc<ModuleRecord>) -> Result<(), ModuleError> {
        let Some(parsed) = record.begin_evaluation() else {
            return match record.state() {
                ModuleState::Failed => Err(record
                    .error()
                    .unwrap_or_else(|| ModuleError::permanent(record.key().clone(), "failed"))),
                _ => Ok(()),
            };
        };

        let key = record.key().clone();
        let mut imports = HashMap::new();

        for dep in record
            .dependencies()
            .into_iter()
            .filter(|dep| dep.kind == EdgeKind::Static)
        {
            let Some(dep_record) = self.inner.registry.get(&dep.key) else {
                let error =
                    ModuleError::permanent(key.clone(), format!("'{}' was never linked", dep.key));
                record.fail(error.clone())?;
                return Err(error);
            };

            match dep_record.state() {
                ModuleState::Ready => {}
                ModuleState::Failed => {
                    let cause = dep_record.error().unwrap_or_else(|| {
                        ModuleError::permanent(dep.key.clone(), "failed")
                    });
                    let error = ModuleError::Dependency {
                        key: key.clone(),
                        dependency: dep.key.clone(),
                        source: Box::new(cause),
                    };
                    record.fail(error.clone())?;
                    return Err(error);
                }
                state => debug!("{} links {} while it is {:?}", key, dep.key, state),
            }

            imports.insert(dep.specifier, Namespace::new(&dep_record));
        }

        let ctx = EvalContext {
            key: key.clone(),
            exports: ExportWriter::new(record),
            imports,
        };

        match self.inner.evaluator.evaluate(&parsed, &ctx) {
            Ok(()) => {
                record.complete(self.inner.registry.next_load_sequence())?;
                debug!("Evaluated {}", key);
                Ok(())
            }
            Err(err) => {
                let error = ModuleError::permanent(key, err.to_string());
                record.fail(error.clone())?;
                Err(error)
            }
        }
    }
}

impl fmt::Debug for LoaderEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoaderEngine")
            .field("scheduler", &self.inner.scheduler)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

/// Settles a task that is dropped before it finishes
struct TaskGuard {
    inner: Arc<LoaderInner>,
    record: Arc<ModuleRecord>,
    armed: bool,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        let key = self.record.key();
        let mut in_flight = self.inner.in_flight.lock();

        if !self.armed {
            in_flight.remove(key);
            return;
        }

        // A newer task may already own the entry and the record
        let newer = in_flight.get(key).and_then(WeakShared::upgrade);
        let replaced = newer.is_some();
        if !replaced {
            in_flight.remove(key);
        }
        drop(in_flight);
        drop(newer);

        debug!("Load of {} cancelled", key);
        if replaced {
            return;
        }
        self.inner.breaker.release_probe(key, self.inner.clock.now());
        if self.record.state().is_active() {
            let _ = self.record.fail(ModuleError::Cancelled { key: key.clone() });
        }
    }
}

async fn run_task(
    inner: Arc<LoaderInner>,
    record: Arc<ModuleRecord>,
    module_type: Option<String>,
    options: LoadOptions,
) -> LoadResult {
    let key = record.key().clone();
    let started = inner.clock.now();
    inner.stats.inc_task();

    let mut guard = TaskGuard {
        inner: inner.clone(),
        record: record.clone(),
        armed: true,
    };

    let result = load(&inner, &record, module_type, &options).await;

    inner
        .stats
        .record(&key, inner.clock.now() - started, result.is_ok());
    match &result {
        Ok(()) => inner.breaker.record_success(&key),
        Err(err) => {
            if err.kind() != FailureKind::Cancelled {
                inner.breaker.record_failure(&key, inner.clock.now());
            }
            let _ = record.fail(err.clone());
        }
    }

    guard.armed = false;
    drop(guard);
    result.map(|()| record)
}

async fn load(
    inner: &LoaderInner,
    record: &ModuleRecord,
    module_type: Option<String>,
    options: &LoadOptions,
) -> Result<(), ModuleError> {
    let key = record.key();

    // Claimed as `Resolving` by `fetch`
    let permit = inner.scheduler.acquire(options.priority).await;
    record.transition(ModuleState::Loading)?;
    // A reload must never expose the previous values mid-cycle
    record.reset_bindings();

    let text = fetch_with_retry(inner, key, options).await?;
    drop(permit);

    let parsed = inner
        .evaluator
        .parse(key, module_type.as_deref(), &text)
        .map_err(|err| ModuleError::permanent(key.clone(), err.to_string()))?;
    record.set_parsed(parsed);
    Ok(())
}

async fn fetch_with_retry(
    inner: &LoaderInner,
    key: &ModuleKey,
    options: &LoadOptions,
) -> Result<String, ModuleError> {
    let total = options.max_retries.saturating_add(1);
    let mut attempts: Vec<AttemptFailure> = Vec::new();

    for attempt in 1..=total {
        inner.stats.inc_attempt();

        let outcome = tokio::select! {
            biased;
            result = inner.source.read(key) => result.map_err(|err| {
                let kind = match err.kind {
                    SourceErrorKind::Transient => FailureKind::Transient,
                    SourceErrorKind::Permanent => FailureKind::Permanent,
                };
                (kind, err.message)
            }),
            _ = inner.clock.sleep(options.timeout) => {
                Err((FailureKind::Timeout, format!("timed out after {:?}", options.timeout)))
            }
        };

        let (kind, message) = match outcome {
            Ok(text) => return Ok(text),
            Err(failure) => failure,
        };

        if kind == FailureKind::Timeout {
            inner.stats.inc_timeout();
        }
        attempts.push(AttemptFailure {
            attempt,
            kind,
            message: message.clone(),
        });

        if !kind.is_retryable() {
            return Err(ModuleError::Permanent {
                key: key.clone(),
                message,
                attempts,
            });
        }

        if attempt < total {
            warn!(
                "Attempt {}/{} for {} failed: {}, retrying",
                attempt, total, key, message
            );
            inner.stats.inc_retry();
            if let Some(delay) = options.backoff(attempt as usize - 1) {
                inner.clock.sleep(delay).await;
            }
        }
    }

    let key = key.clone();
    match attempts.last().map(|a| a.kind) {
        Some(FailureKind::Timeout) => Err(ModuleError::Timeout { key, attempts }),
        _ => Err(ModuleError::Transient { key, attempts }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{MemorySource, TokioClock};
    use crate::policy::BreakerConfig;
    use crate::script::ScriptEvaluator;

    fn engine(source: Arc<MemorySource>) -> (LoaderEngine, Arc<Registry>) {
        let registry = Arc::new(Registry::default());
        let engine = LoaderEngine::new(
            registry.clone(),
            source,
            Arc::new(ScriptEvaluator),
            Arc::new(TokioClock),
            Arc::new(CircuitBreaker::new(BreakerConfig::default())),
            3,
        );
        (engine, registry)
    }

    #[test]
    fn test_backoff_index() {
        let options = LoadOptions {
            retry_backoff: vec![Duration::from_millis(100), Duration::from_millis(200)],
            ..LoadOptions::default()
        };
        assert_eq!(options.backoff(0), Some(Duration::from_millis(100)));
        assert_eq!(options.backoff(1), Some(Duration::from_millis(200)));
        assert_eq!(options.backoff(7), Some(Duration::from_millis(200)));

        let none = LoadOptions {
            retry_backoff: Vec::new(),
            ..LoadOptions::default()
        };
        assert_eq!(none.backoff(0), None);
    }

    #[tokio::test]
    async fn test_fetch_then_evaluate() {
        let source = Arc::new(MemorySource::with_modules([(
            "/a.js",
            "export const x = 1 + 1;",
        )]));
        let (engine, registry) = engine(source.clone());
        let key = ModuleKey::new("/a.js");

        let record = engine
            .fetch(&key, None, &LoadOptions::default())
            .await
            .unwrap();
        assert_eq!(record.state(), ModuleState::Loading);
        assert!(record.is_fetched());

        // Fetched but not evaluated: no second read
        engine.fetch(&key, None, &LoadOptions::default()).await.unwrap();
        assert_eq!(source.read_count(), 1);

        engine.evaluate(&record).unwrap();
        assert_eq!(record.state(), ModuleState::Ready);
        assert_eq!(record.loaded_at(), Some(1));
        assert_eq!(
            Namespace::new(&record).get("x"),
            Some(serde_json::json!(2))
        );

        // Evaluating again is a no-op
        engine.evaluate(&record).unwrap();
        assert_eq!(registry.next_load_sequence(), 2);
        assert_eq!(engine.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_parse_error_is_permanent() {
        let source = Arc::new(MemorySource::with_modules([("/bad.js", "export class X {}")]));
        let (engine, _) = engine(source.clone());

        let err = engine
            .fetch(&ModuleKey::new("/bad.js"), None, &LoadOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), FailureKind::Permanent);
        assert_eq!(source.read_count(), 1);
        assert_eq!(engine.stats().retries.load(std::sync::atomic::Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_missing_module_is_not_retried() {
        let source = Arc::new(MemorySource::new());
        let (engine, registry) = engine(source.clone());
        let key = ModuleKey::new("/missing.js");

        let err = engine
            .fetch(&key, None, &LoadOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), FailureKind::Permanent);
        assert_eq!(err.attempts().len(), 1);
        assert_eq!(source.read_count(), 1);
        assert_eq!(registry.get(&key).unwrap().state(), ModuleState::Failed);
    }
}
