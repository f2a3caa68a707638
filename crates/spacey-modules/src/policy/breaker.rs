// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Per-key circuit breaker

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::BreakerSettings;
use crate::key::ModuleKey;

/// Circuit breaker configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerConfig {
    /// Whether loads are guarded at all
    pub enabled: bool,
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// How long an open circuit rejects calls
    pub reset_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        let settings = BreakerSettings::default();
        Self {
            enabled: settings.enabled,
            failure_threshold: settings.failure_threshold,
            reset_timeout: Duration::from_millis(settings.reset_timeout_ms),
        }
    }
}

/// State of one key's circuit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls go through
    Closed,
    /// Calls fail fast until `until`
    Open {
        /// When the next call may probe
        until: Instant,
    },
    /// One probe call is in flight
    HalfOpen,
}

#[derive(Debug, Clone, Copy)]
struct Circuit {
    state: CircuitState,
    failures: u32,
}

impl Default for Circuit {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: 0,
        }
    }
}

/// Consecutive-failure circuit breaker, one circuit per module key
#[derive(Debug, Default)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    circuits: Mutex<HashMap<ModuleKey, Circuit>>,
}

impl CircuitBreaker {
    /// Create a breaker
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            circuits: Mutex::new(HashMap::new()),
        }
    }

    /// Breaker configuration
    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Current state of a key's circuit
    pub fn state(&self, key: &ModuleKey) -> CircuitState {
        self.circuits
            .lock()
            .get(key)
            .map(|c| c.state)
            .unwrap_or(CircuitState::Closed)
    }

    /// Consecutive failures counted for a key
    pub fn failures(&self, key: &ModuleKey) -> u32 {
        self.circuits.lock().get(key).map(|c| c.failures).unwrap_or(0)
    }

    /// Ask to start a call for `key`.
    ///
    /// Returns how long to wait when the call is rejected. The first call
    /// after an open period becomes the probe.
    pub fn try_acquire(&self, key: &ModuleKey, now: Instant) -> Result<(), Duration> {
        if !self.config.enabled {
            return Ok(());
        }

        let mut circuits = self.circuits.lock();
        let Some(circuit) = circuits.get_mut(key) else {
            return Ok(());
        };

        match circuit.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open { until } if now >= until => {
                debug!("Circuit for {} half-open, probing", key);
                circuit.state = CircuitState::HalfOpen;
                Ok(())
            }
            CircuitState::Open { until } => Err(until - now),
            // Probe already in flight
            CircuitState::HalfOpen => Err(Duration::ZERO),
        }
    }

    /// Record a successful call
    pub fn record_success(&self, key: &ModuleKey) {
        if !self.config.enabled {
            return;
        }

        let mut circuits = self.circuits.lock();
        if let Some(circuit) = circuits.get_mut(key) {
            if circuit.state != CircuitState::Closed {
                debug!("Circuit for {} closed", key);
            }
            circuit.state = CircuitState::Closed;
            circuit.failures = 0;
        }
    }

    /// Record a failed call
    pub fn record_failure(&self, key: &ModuleKey, now: Instant) {
        if !self.config.enabled {
            return;
        }

        let mut circuits = self.circuits.lock();
        let circuit = circuits.entry(key.clone()).or_default();
        circuit.failures = circuit.failures.saturating_add(1);
        let until = now + self.config.reset_timeout;

        match circuit.state {
            CircuitState::HalfOpen => {
                warn!("Probe for {} failed, circuit reopened", key);
                circuit.state = CircuitState::Open { until };
            }
            CircuitState::Closed if circuit.failures >= self.config.failure_threshold => {
                warn!(
                    "Circuit for {} opened after {} consecutive failures",
                    key, circuit.failures
                );
                circuit.state = CircuitState::Open { until };
            }
            _ => {}
        }
    }

    /// Give up a probe that never finished; the next call probes again
    pub fn release_probe(&self, key: &ModuleKey, now: Instant) {
        let mut circuits = self.circuits.lock();
        if let Some(circuit) = circuits.get_mut(key) {
            if circuit.state == CircuitState::HalfOpen {
                circuit.state = CircuitState::Open { until: now };
            }
        }
    }

    /// Forget a key's circuit
    pub fn reset(&self, key: &ModuleKey) {
        self.circuits.lock().remove(key);
    }

    /// Forget every circuit
    pub fn clear(&self) {
        self.circuits.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32) -> CircuitBreaker {
        CircuitBreaker::new(BreakerConfig {
            enabled: true,
            failure_threshold: threshold,
            reset_timeout: Duration::from_secs(60),
        })
    }

    #[test]
    fn test_opens_at_threshold() {
        let breaker = breaker(3);
        let key = ModuleKey::new("/flaky.js");
        let now = Instant::now();

        for _ in 0..2 {
            assert!(breaker.try_acquire(&key, now).is_ok());
            breaker.record_failure(&key, now);
        }
        assert_eq!(breaker.state(&key), CircuitState::Closed);

        breaker.record_failure(&key, now);
        assert!(matches!(breaker.state(&key), CircuitState::Open { .. }));
        assert_eq!(
            breaker.try_acquire(&key, now + Duration::from_secs(10)),
            Err(Duration::from_secs(50))
        );
    }

    #[test]
    fn test_single_probe_after_timeout() {
        let breaker = breaker(1);
        let key = ModuleKey::new("/flaky.js");
        let now = Instant::now();
        breaker.record_failure(&key, now);

        let later = now + Duration::from_secs(60);
        assert!(breaker.try_acquire(&key, later).is_ok());
        assert_eq!(breaker.state(&key), CircuitState::HalfOpen);
        assert!(breaker.try_acquire(&key, later).is_err());

        breaker.record_success(&key);
        assert_eq!(breaker.state(&key), CircuitState::Closed);
        assert_eq!(breaker.failures(&key), 0);
    }

    #[test]
    fn test_failed_probe_reopens_for_full_timeout() {
        let breaker = breaker(1);
        let key = ModuleKey::new("/flaky.js");
        let now = Instant::now();
        breaker.record_failure(&key, now);

        let later = now + Duration::from_secs(61);
        breaker.try_acquire(&key, later).unwrap();
        breaker.record_failure(&key, later);
        assert_eq!(
            breaker.state(&key),
            CircuitState::Open {
                until: later + Duration::from_secs(60)
            }
        );
    }

    #[test]
    fn test_released_probe_can_be_retried() {
        let breaker = breaker(1);
        let key = ModuleKey::new("/flaky.js");
        let now = Instant::now();
        breaker.record_failure(&key, now);

        let later = now + Duration::from_secs(60);
        breaker.try_acquire(&key, later).unwrap();
        breaker.release_probe(&key, later);
        assert!(breaker.try_acquire(&key, later).is_ok());
    }

    #[test]
    fn test_disabled() {
        let breaker = CircuitBreaker::new(BreakerConfig {
            enabled: false,
            ..BreakerConfig::default()
        });
        let key = ModuleKey::new("/a.js");
        let now = Instant::now();
        for _ in 0..10 {
            breaker.record_failure(&key, now);
        }
        assert!(breaker.try_acquire(&key, now).is_ok());
    }
}
