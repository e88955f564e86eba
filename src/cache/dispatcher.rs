//! Invalidation dispatcher.
//!
//! Turns intents into store purges, either immediately ([`InvalidationDispatcher::invalidate`])
//! or through the deferred queue ([`InvalidationDispatcher::enqueue`] then
//! [`InvalidationDispatcher::consume`]).

use std::sync::Arc;
use std::time::Instant;

use metrics::{gauge, histogram};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::config::CacheConfig;
use super::error::{CacheError, CacheResult};
use super::events::IntentQueue;
use super::intents::InvalidationIntent;
use super::keys::validate_key;
use super::planner::InvalidationPlan;
use super::rules::EntityRules;
use super::store::CacheStore;

const METRIC_CONSUME_MS: &str = "canopy_invalidation_consume_ms";
const METRIC_PENDING: &str = "canopy_invalidation_pending";

pub struct InvalidationDispatcher {
    store: Arc<CacheStore>,
    rules: EntityRules,
    queue: IntentQueue,
    batch_limit: usize,
}

impl InvalidationDispatcher {
    pub fn new(store: Arc<CacheStore>, rules: EntityRules, config: &CacheConfig) -> Self {
        Self {
            store,
            rules,
            queue: IntentQueue::new(),
            batch_limit: config.consume_batch_limit.max(1),
        }
    }

    pub fn rules(&self) -> &EntityRules {
        &self.rules
    }

    /// Resolve an intent without touching the cache.
    ///
    /// Explicit keys must be valid store keys, so a queued plan can never fail
    /// on them later.
    pub fn plan(&self, intent: &InvalidationIntent) -> CacheResult<InvalidationPlan> {
        let plan = InvalidationPlan::resolve(intent, &self.rules, self.store.clock().now())?;
        for key in &plan.keys {
            validate_key(key, self.store.max_key_len())
                .map_err(|err| CacheError::validation(err.to_string()))?;
        }
        Ok(plan)
    }

    /// Purge everything the intent resolves to; returns the number of entries purged.
    #[instrument(skip(self, intent), fields(intent = intent.name()))]
    pub async fn invalidate(&self, intent: InvalidationIntent) -> CacheResult<usize> {
        let plan = self.plan(&intent)?;
        let (purged, failure) = self.execute(&plan).await;
        if let Some(err) = failure {
            return Err(err);
        }
        info!(intent = intent.name(), plan = %plan, purged, "Invalidation applied");
        Ok(purged)
    }

    /// [`invalidate`](Self::invalidate) from the JSON wire form.
    pub async fn invalidate_json(&self, raw: &str) -> CacheResult<usize> {
        self.invalidate(InvalidationIntent::from_json(raw)?).await
    }

    /// Validate and queue an intent for the next [`consume`](Self::consume).
    pub fn enqueue(&self, intent: InvalidationIntent) -> CacheResult<Uuid> {
        let plan = self.plan(&intent)?;
        let id = self.queue.publish(intent.name(), plan);
        gauge!(METRIC_PENDING).set(self.queue.len() as f64);
        Ok(id)
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Drain one batch of queued invalidations, merge and apply them.
    ///
    /// Returns the number of entries purged; 0 when nothing was queued.
    #[instrument(skip(self))]
    pub async fn consume(&self) -> CacheResult<usize> {
        let started_at = Instant::now();
        let batch = self.queue.drain(self.batch_limit);
        gauge!(METRIC_PENDING).set(self.queue.len() as f64);
        if batch.is_empty() {
            return Ok(0);
        }

        let batch_size = batch.len();
        let ids: Vec<Uuid> = batch.iter().map(|queued| queued.id).collect();
        let plan = InvalidationPlan::from_plans(batch.into_iter().map(|queued| queued.plan));

        info!(
            batch_size,
            invalidation_ids = ?ids,
            plan = %plan,
            "Invalidation consumption starting"
        );

        let (purged, failure) = self.execute(&plan).await;
        match failure {
            Some(err) => warn!(
                batch_size,
                purged,
                error = %err,
                "Invalidation consumption completed with failures"
            ),
            None => info!(batch_size, purged, "Invalidation consumption complete"),
        }
        histogram!(METRIC_CONSUME_MS).record(started_at.elapsed().as_secs_f64() * 1000.0);
        Ok(purged)
    }

    /// Apply every action in the plan. A failing action is logged and skipped;
    /// the first failure is returned with the purge count.
    async fn execute(&self, plan: &InvalidationPlan) -> (usize, Option<CacheError>) {
        let mut purged = 0;
        let mut failure = None;

        for tag in &plan.tags {
            match self.store.delete_by_tag(tag).await {
                Ok(count) => purged += count,
                Err(err) => {
                    warn!(tag = %tag, error = %err, "tag invalidation skipped");
                    failure.get_or_insert(CacheError::validation(err.to_string()));
                }
            }
        }
        for pattern in &plan.patterns {
            match self.store.delete_by_pattern(pattern).await {
                Ok(count) => purged += count,
                Err(err) => {
                    warn!(pattern = %pattern, error = %err, "pattern invalidation skipped");
                    failure.get_or_insert(CacheError::validation(err.to_string()));
                }
            }
        }
        for key in &plan.keys {
            match self.store.delete(key).await {
                Ok(true) => purged += 1,
                Ok(false) => {}
                Err(err @ CacheError::InvalidArgument(_)) => {
                    warn!(key = %key, error = %err, "key invalidation skipped");
                    failure.get_or_insert(CacheError::validation(err.to_string()));
                }
                // the key is gone from the index; a tier may still hold it until its TTL runs out
                Err(err) => {
                    purged += 1;
                    warn!(key = %key, error = %err, "key purge incomplete");
                }
            }
        }

        (purged, failure)
    }
}
