// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Load statistics

use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::key::ModuleKey;

/// Timing of the loads of one module
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeyTiming {
    /// Completed load tasks
    pub count: u32,
    /// Failed load tasks
    pub errors: u32,
    /// Sum of task durations
    pub total: Duration,
    /// Fastest task
    pub min: Duration,
    /// Slowest task
    pub max: Duration,
}

impl KeyTiming {
    /// Average task duration
    pub fn mean(&self) -> Duration {
        if self.count == 0 {
            Duration::ZERO
        } else {
            self.total / self.count
        }
    }
}

/// Statistics for load operations.
#[derive(Debug, Default)]
pub struct LoadStats {
    /// Load tasks started
    pub tasks: AtomicUsize,
    /// Source reads attempted
    pub attempts: AtomicUsize,
    /// Attempts that were retried
    pub retries: AtomicUsize,
    /// Attempts that timed out
    pub timeouts: AtomicUsize,
    /// Requests that joined an in-flight task
    pub coalesced: AtomicUsize,
    /// Requests served from a ready record
    pub cache_hits: AtomicUsize,
    /// Load tasks that failed
    pub failed: AtomicUsize,
    /// Requests rejected by an open circuit
    pub circuit_rejections: AtomicUsize,
    timings: DashMap<ModuleKey, KeyTiming>,
}

impl LoadStats {
    /// Empty statistics
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a started task
    pub fn inc_task(&self) {
        self.tasks.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a source read
    pub fn inc_attempt(&self) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a retry
    pub fn inc_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a timed-out attempt
    pub fn inc_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a coalesced request
    pub fn inc_coalesced(&self) {
        self.coalesced.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a cache hit
    pub fn inc_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a circuit rejection
    pub fn inc_circuit_rejection(&self) {
        self.circuit_rejections.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the outcome of one load task
    pub fn record(&self, key: &ModuleKey, elapsed: Duration, ok: bool) {
        if !ok {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }

        let mut timing = self.timings.entry(key.clone()).or_default();
        timing.min = if timing.count == 0 {
            elapsed
        } else {
            timing.min.min(elapsed)
        };
        timing.max = timing.max.max(elapsed);
        timing.total += elapsed;
        timing.count += 1;
        if !ok {
            timing.errors += 1;
        }
    }

    /// Timing of one module
    pub fn timing(&self, key: &ModuleKey) -> Option<KeyTiming> {
        self.timings.get(key).map(|t| *t)
    }

    /// Timing of every module, sorted by key
    pub fn timings(&self) -> Vec<(ModuleKey, KeyTiming)> {
        let mut timings: Vec<_> = self
            .timings
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        timings.sort_by(|a, b| a.0.cmp(&b.0));
        timings
    }

    /// One-line summary of the counters
    pub fn summary(&self) -> String {
        let tasks = self.tasks.load(Ordering::Relaxed);
        let attempts = self.attempts.load(Ordering::Relaxed);
        let retries = self.retries.load(Ordering::Relaxed);
        let timeouts = self.timeouts.load(Ordering::Relaxed);
        let coalesced = self.coalesced.load(Ordering::Relaxed);
        let cache_hits = self.cache_hits.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);
        let rejected = self.circuit_rejections.load(Ordering::Relaxed);
        format!(
            "Loads: {}, Attempts: {}, Retries: {}, Timeouts: {}, Coalesced: {}, Cache hits: {}, Failed: {}, Circuit rejections: {}",
            tasks, attempts, retries, timeouts, coalesced, cache_hits, failed, rejected
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timing() {
        let stats = LoadStats::new();
        let key = ModuleKey::new("/a.js");
        stats.record(&key, Duration::from_millis(30), true);
        stats.record(&key, Duration::from_millis(10), false);

        let timing = stats.timing(&key).unwrap();
        assert_eq!(timing.count, 2);
        assert_eq!(timing.errors, 1);
        assert_eq!(timing.min, Duration::from_millis(10));
        assert_eq!(timing.max, Duration::from_millis(30));
        assert_eq!(timing.mean(), Duration::from_millis(20));
        assert_eq!(stats.failed.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_summary() {
        let stats = LoadStats::new();
        stats.inc_task();
        stats.inc_coalesced();
        stats.inc_coalesced();
        assert!(stats.summary().starts_with("Loads: 1,"));
        assert!(stats.summary().contains("Coalesced: 2"));
    }
}
