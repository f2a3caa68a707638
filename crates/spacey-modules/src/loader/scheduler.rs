// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Priority scheduling of load slots
//!
//! At most `max_concurrent` tasks hold a [`Permit`] at once. Waiters are
//! served highest priority first, then in submission order.

use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use tokio::sync::oneshot;

/// A task waiting for a slot
#[derive(Debug)]
struct Waiter {
    priority: i32,
    seq: u64,
    tx: oneshot::Sender<Permit>,
}

impl PartialEq for Waiter {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Waiter {}

impl PartialOrd for Waiter {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Waiter {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher priority first, then earlier submission
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Debug)]
struct SchedulerState {
    max_concurrent: usize,
    running: usize,
    next_seq: u64,
    waiting: BinaryHeap<Waiter>,
}

/// Bounded, priority-ordered slot pool
#[derive(Debug, Clone)]
pub struct PriorityScheduler {
    state: Arc<Mutex<SchedulerState>>,
}

impl PriorityScheduler {
    /// Create a scheduler with `max_concurrent` slots (at least one)
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(SchedulerState {
                max_concurrent: max_concurrent.max(1),
                running: 0,
                next_seq: 0,
                waiting: BinaryHeap::new(),
            })),
        }
    }

    /// Wait for a slot.
    ///
    /// Dropping the returned future before it resolves gives up the place in
    /// the queue; a slot handed to an abandoned waiter moves on to the next.
    pub async fn acquire(&self, priority: i32) -> Permit {
        loop {
            let rx = {
                let mut state = self.state.lock();
                if state.running < state.max_concurrent && state.waiting.is_empty() {
                    state.running += 1;
                    return Permit {
                        state: Some(self.state.clone()),
                    };
                }

                let (tx, rx) = oneshot::channel();
                let seq = state.next_seq;
                state.next_seq += 1;
                state.waiting.push(Waiter { priority, seq, tx });
                rx
            };

            if let Ok(permit) = rx.await {
                return permit;
            }
        }
    }

    /// Slots currently held
    pub fn running(&self) -> usize {
        self.state.lock().running
    }

    /// Tasks waiting for a slot
    pub fn queued(&self) -> usize {
        self.state.lock().waiting.len()
    }

    /// Slot limit
    pub fn max_concurrent(&self) -> usize {
        self.state.lock().max_concurrent
    }
}

/// A held load slot, released on drop
#[derive(Debug)]
pub struct Permit {
    state: Option<Arc<Mutex<SchedulerState>>>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        if let Some(state) = self.state.take() {
            release(state);
        }
    }
}

/// Hand a slot to the next live waiter, or return it to the pool
fn release(state: Arc<Mutex<SchedulerState>>) {
    loop {
        let waiter = {
            let mut guard = state.lock();
            match guard.waiting.pop() {
                Some(waiter) => waiter,
                None => {
                    guard.running = guard.running.saturating_sub(1);
                    return;
                }
            }
        };

        // Sent outside the lock: a refused permit is disarmed, not released
        let permit = Permit {
            state: Some(state.clone()),
        };
        match waiter.tx.send(permit) {
            Ok(()) => return,
            Err(mut refused) => refused.state = None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_bounded_slots() {
        let scheduler = PriorityScheduler::new(2);
        let a = scheduler.acquire(0).await;
        let _b = scheduler.acquire(0).await;
        assert_eq!(scheduler.running(), 2);

        let waiting = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.acquire(0).await })
        };
        tokio::task::yield_now().await;
        assert_eq!(scheduler.queued(), 1);

        drop(a);
        let _c = waiting.await.unwrap();
        assert_eq!(scheduler.running(), 2);
        assert_eq!(scheduler.queued(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_priority_then_fifo() {
        let scheduler = PriorityScheduler::new(1);
        let held = scheduler.acquire(0).await;
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for (name, priority) in [("low", 0), ("high", 10), ("low-2", 0), ("mid", 5)] {
            let scheduler = scheduler.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                let _permit = scheduler.acquire(priority).await;
                order.lock().push(name);
                tokio::time::sleep(Duration::from_millis(10)).await;
            }));
            // Fix submission order
            tokio::task::yield_now().await;
        }

        assert_eq!(scheduler.queued(), 4);
        drop(held);
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(*order.lock(), vec!["high", "mid", "low", "low-2"]);
        assert_eq!(scheduler.running(), 0);
    }

    #[tokio::test]
    async fn test_abandoned_waiter_is_skipped() {
        let scheduler = PriorityScheduler::new(1);
        let held = scheduler.acquire(0).await;

        let abandoned = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.acquire(100).await })
        };
        tokio::task::yield_now().await;
        let patient = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.acquire(0).await })
        };
        tokio::task::yield_now().await;
        assert_eq!(scheduler.queued(), 2);

        abandoned.abort();
        let _ = abandoned.await;
        drop(held);

        let _permit = patient.await.unwrap();
        assert_eq!(scheduler.running(), 1);
        assert_eq!(scheduler.queued(), 0);
    }
}
