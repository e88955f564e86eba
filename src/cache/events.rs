//! Deferred invalidation queue.
//!
//! Resolved plans wait here until the dispatcher consumes them in a batch.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use time::OffsetDateTime;
use tracing::info;
use uuid::Uuid;

use super::lock::mutex_lock;
use super::planner::InvalidationPlan;

const SOURCE: &str = "cache::events";

/// Monotonic sequence number within this process.
pub type Epoch = u64;

/// A queued, already-validated invalidation.
#[derive(Debug, Clone)]
pub struct QueuedInvalidation {
    pub id: Uuid,
    pub epoch: Epoch,
    pub intent: &'static str,
    pub plan: InvalidationPlan,
    pub enqueued_at: OffsetDateTime,
}

/// FIFO of pending invalidations. Contention is low, so a mutex suffices.
pub struct IntentQueue {
    queue: Mutex<VecDeque<QueuedInvalidation>>,
    epoch_counter: AtomicU64,
}

impl IntentQueue {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            epoch_counter: AtomicU64::new(0),
        }
    }

    /// Queue a plan and return its id.
    pub fn publish(&self, intent: &'static str, plan: InvalidationPlan) -> Uuid {
        let queued = QueuedInvalidation {
            id: Uuid::new_v4(),
            epoch: self.epoch_counter.fetch_add(1, Ordering::SeqCst),
            intent,
            plan,
            enqueued_at: OffsetDateTime::now_utc(),
        };
        let id = queued.id;

        info!(
            invalidation_id = %queued.id,
            invalidation_epoch = queued.epoch,
            intent,
            plan = %queued.plan,
            "Invalidation enqueued"
        );

        mutex_lock(&self.queue, SOURCE, "publish").push_back(queued);
        id
    }

    /// Drain up to `limit` entries in FIFO order.
    pub fn drain(&self, limit: usize) -> Vec<QueuedInvalidation> {
        let mut queue = mutex_lock(&self.queue, SOURCE, "drain");
        let count = limit.min(queue.len());
        queue.drain(..count).collect()
    }

    pub fn len(&self) -> usize {
        mutex_lock(&self.queue, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        mutex_lock(&self.queue, SOURCE, "clear").clear();
    }
}

impl Default for IntentQueue {
    fn default() -> Self {
        Self::new()
    }
}
