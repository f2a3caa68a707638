// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Typed module state events.
//!
//! Every record transition is published to all subscribers over an unbounded
//! channel. Records emit while holding their own lock, so the events of one
//! key always arrive in transition order.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

use crate::key::ModuleKey;
use crate::record::ModuleState;

/// A record moved from one state to another
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateEvent {
    /// Module key
    pub key: ModuleKey,
    /// State before the transition
    pub from: ModuleState,
    /// State after the transition
    pub to: ModuleState,
    /// Record version at the time of the transition
    pub version: u64,
    /// Bus-wide sequence number
    pub seq: u64,
}

/// Fan-out of state events to subscribers
#[derive(Debug, Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<StateEvent>>>,
    seq: AtomicU64,
}

impl EventBus {
    /// Create a bus with no subscribers
    pub fn new() -> Self {
        Self::default()
    }

    /// Receive every event published after this call
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<StateEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| !tx.is_closed());
        subscribers.len()
    }

    pub(crate) fn emit(&self, key: &ModuleKey, from: ModuleState, to: ModuleState, version: u64) {
        let event = StateEvent {
            key: key.clone(),
            from,
            to,
            version,
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
        };

        // Dropped receivers are pruned on the way
        self.subscribers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Drop every subscriber, closing their channels
    pub(crate) fn close(&self) {
        self.subscribers.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fan_out_and_prune() {
        let bus = EventBus::new();
        let mut first = bus.subscribe();
        let second = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        drop(second);
        bus.emit(
            &ModuleKey::new("/a.js"),
            ModuleState::Unresolved,
            ModuleState::Resolving,
            0,
        );
        assert_eq!(bus.subscriber_count(), 1);

        let event = first.try_recv().unwrap();
        assert_eq!(event.key.as_str(), "/a.js");
        assert_eq!(event.to, ModuleState::Resolving);
        assert_eq!(event.seq, 0);
    }

    #[test]
    fn test_close_ends_streams() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.close();
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }
}
