//! Backpressure for update consumers
//!
//! Each consumer of cache updates gets a bounded queue. The dispatcher
//! pushes without ever waiting on the consumer; when a queue is full the
//! consumer's drop policy decides between discarding the oldest queued
//! update and disconnecting the consumer.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::cache::CacheUpdate;

/// Drop policy when a consumer's queue overflows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropPolicy {
    /// Disconnect the lagging consumer immediately.
    Disconnect,
    /// Drop oldest updates to make room for newer ones.
    DropOldest,
}

impl DropPolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "disconnect" => Some(DropPolicy::Disconnect),
            "drop_oldest" => Some(DropPolicy::DropOldest),
            _ => None,
        }
    }
}

/// Action to take when backpressure is triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackpressureAction {
    /// Consumer should be disconnected.
    DisconnectConsumer,
}

/// What happened to an enqueued update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    Queued,
    /// Queued after discarding the oldest update.
    DroppedOldest,
}

/// Bounded per-consumer queue.
#[derive(Debug)]
pub struct ConsumerQueue {
    messages: VecDeque<CacheUpdate>,
    capacity: usize,
    drop_policy: DropPolicy,
    messages_dropped: u64,
    is_lagging: bool,
}

impl ConsumerQueue {
    pub fn new(capacity: usize, drop_policy: DropPolicy) -> Self {
        let capacity = capacity.max(1);
        Self {
            messages: VecDeque::with_capacity(capacity),
            capacity,
            drop_policy,
            messages_dropped: 0,
            is_lagging: false,
        }
    }

    /// Enqueue an update. Returns Err if the consumer should be disconnected.
    pub fn enqueue(&mut self, update: CacheUpdate) -> Result<Enqueued, BackpressureAction> {
        let mut outcome = Enqueued::Queued;
        if self.messages.len() >= self.capacity {
            self.is_lagging = true;

            match self.drop_policy {
                DropPolicy::Disconnect => {
                    return Err(BackpressureAction::DisconnectConsumer);
                }
                DropPolicy::DropOldest => {
                    self.messages.pop_front();
                    self.messages_dropped += 1;
                    outcome = Enqueued::DroppedOldest;
                }
            }
        }

        self.messages.push_back(update);

        // Clear lagging flag once the queue is below half capacity
        if self.messages.len() < self.capacity / 2 {
            self.is_lagging = false;
        }

        Ok(outcome)
    }

    pub fn pop(&mut self) -> Option<CacheUpdate> {
        let update = self.messages.pop_front();
        if self.messages.len() < self.capacity / 2 {
            self.is_lagging = false;
        }
        update
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn is_lagging(&self) -> bool {
        self.is_lagging
    }

    pub fn messages_dropped(&self) -> u64 {
        self.messages_dropped
    }
}

/// A [`ConsumerQueue`] shared between the dispatcher and one consumer.
///
/// Single consumer: wake-ups use `Notify::notify_one`, whose stored permit
/// covers a push that lands between the consumer's empty check and its wait.
#[derive(Debug)]
pub struct SharedQueue {
    queue: Mutex<ConsumerQueue>,
    notify: Notify,
    closed: AtomicBool,
    abandoned: AtomicBool,
}

impl SharedQueue {
    pub fn new(capacity: usize, drop_policy: DropPolicy) -> Self {
        Self {
            queue: Mutex::new(ConsumerQueue::new(capacity, drop_policy)),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            abandoned: AtomicBool::new(false),
        }
    }

    /// Push from the dispatcher side. Never waits on the consumer.
    pub fn push(&self, update: CacheUpdate) -> Result<Enqueued, BackpressureAction> {
        let outcome = match self.queue.lock() {
            Ok(mut queue) => queue.enqueue(update),
            // A consumer that panicked mid-pop cannot be served further.
            Err(_) => Err(BackpressureAction::DisconnectConsumer),
        };
        if outcome.is_ok() {
            self.notify.notify_one();
        }
        outcome
    }

    pub fn try_pop(&self) -> Option<CacheUpdate> {
        self.queue.lock().ok().and_then(|mut queue| queue.pop())
    }

    /// Wait for the next update; None once closed and drained.
    pub async fn pop(&self) -> Option<CacheUpdate> {
        loop {
            if let Some(update) = self.try_pop() {
                return Some(update);
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            self.notify.notified().await;
        }
    }

    /// Stop delivery; a waiting consumer wakes and drains what is left.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Mark that the consumer side has gone away.
    pub fn abandon(&self) {
        self.abandoned.store(true, Ordering::Release);
    }

    pub fn is_abandoned(&self) -> bool {
        self.abandoned.load(Ordering::Acquire)
    }

    pub fn messages_dropped(&self) -> u64 {
        self.queue
            .lock()
            .map(|queue| queue.messages_dropped())
            .unwrap_or(0)
    }

    /// Set once the queue hits capacity; cleared when it drains below half.
    pub fn is_lagging(&self) -> bool {
        self.queue
            .lock()
            .map(|queue| queue.is_lagging())
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.queue.lock().map(|queue| queue.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
