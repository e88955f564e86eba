//! Cache warming.
//!
//! [`CacheWarmer`] runs registered [`WarmingStrategy`]s in ascending priority
//! and writes what they produce through the store. At most one full cycle runs
//! at a time; a strategy that fails or panics is recorded and the cycle moves on.

use std::any::Any;
use std::collections::HashSet;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use futures::FutureExt;
use metrics::{counter, histogram};
use serde::Serialize;
use time::OffsetDateTime;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::error::{CacheError, CacheResult};
use super::lock::{mutex_lock, rw_read, rw_write};
use super::store::CacheStore;

const SOURCE: &str = "cache::warmer";

const METRIC_WARM_RUN_MS: &str = "canopy_warm_run_ms";
const METRIC_WARM_KEYS_TOTAL: &str = "canopy_warm_keys_total";

/// One `(key, value, tags)` triple produced by a strategy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WarmItem {
    pub key: String,
    pub value: Bytes,
    pub tags: Vec<String>,
}

impl WarmItem {
    pub fn new<I, S>(key: impl Into<String>, value: impl Into<Bytes>, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            key: key.into(),
            value: value.into(),
            tags: tags.into_iter().map(Into::into).collect(),
        }
    }
}

/// Produces the data a strategy warms.
#[async_trait]
pub trait WarmSource: Send + Sync {
    async fn produce(&self) -> CacheResult<Vec<WarmItem>>;
}

#[async_trait]
impl<F, Fut> WarmSource for F
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = CacheResult<Vec<WarmItem>>> + Send + 'static,
{
    async fn produce(&self) -> CacheResult<Vec<WarmItem>> {
        (self)().await
    }
}

/// A named, prioritized warming procedure. Lower priority runs first.
#[derive(Clone)]
pub struct WarmingStrategy {
    pub name: String,
    pub priority: i32,
    pub ttl_secs: i64,
    pub source: Arc<dyn WarmSource>,
}

impl WarmingStrategy {
    pub fn new(
        name: impl Into<String>,
        priority: i32,
        ttl_secs: i64,
        source: impl WarmSource + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            priority,
            ttl_secs,
            source: Arc::new(source),
        }
    }
}

impl std::fmt::Debug for WarmingStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WarmingStrategy")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("ttl_secs", &self.ttl_secs)
            .finish_non_exhaustive()
    }
}

/// Warmer lifecycle. `Failed` marks a cycle abandoned before it finished and
/// stays visible until the next cycle starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WarmState {
    Idle,
    Running,
    Failed,
}

/// Live progress of the current cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WarmingRun {
    pub run_id: Uuid,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    pub strategies_total: usize,
    pub strategies_completed: usize,
    pub keys_written: usize,
    pub current_strategy: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WarmFailure {
    pub strategy: String,
    pub error: String,
}

/// Aggregate result of a warming cycle.
///
/// A non-empty `failures` list is the partial-failure report; the cycle itself
/// always completes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WarmStats {
    pub run_id: Uuid,
    pub strategies_total: usize,
    pub strategies_completed: usize,
    pub keys_written: usize,
    pub elapsed_ms: u64,
    pub failures: Vec<WarmFailure>,
}

impl WarmStats {
    pub fn is_partial_failure(&self) -> bool {
        !self.failures.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WarmOutcome {
    /// Another run holds the guard; nothing was written by this call.
    AlreadyInProgress,
    Completed(WarmStats),
}

impl WarmOutcome {
    pub fn stats(&self) -> Option<&WarmStats> {
        match self {
            Self::AlreadyInProgress => None,
            Self::Completed(stats) => Some(stats),
        }
    }
}

struct WarmerState {
    state: WarmState,
    run: Option<WarmingRun>,
    last_stats: Option<WarmStats>,
    /// Strategies running out of band via `warm_strategy`.
    active: HashSet<String>,
}

pub struct CacheWarmer {
    store: Arc<CacheStore>,
    strategies: RwLock<Vec<WarmingStrategy>>,
    state: Mutex<WarmerState>,
}

/// Holds the cycle-wide guard; releases it on every exit path.
struct RunGuard<'a> {
    warmer: &'a CacheWarmer,
    run_id: Uuid,
    finished: bool,
}

impl<'a> RunGuard<'a> {
    fn acquire(warmer: &'a CacheWarmer, strategies_total: usize) -> Option<Self> {
        let mut state = mutex_lock(&warmer.state, SOURCE, "acquire");
        match state.state {
            WarmState::Running => return None,
            WarmState::Failed => debug!("Previous warming run was abandoned; starting afresh"),
            WarmState::Idle => {}
        }
        let run_id = Uuid::new_v4();
        state.state = WarmState::Running;
        state.run = Some(WarmingRun {
            run_id,
            started_at: OffsetDateTime::now_utc(),
            strategies_total,
            strategies_completed: 0,
            keys_written: 0,
            current_strategy: None,
        });
        Some(Self {
            warmer,
            run_id,
            finished: false,
        })
    }

    fn finish(mut self, stats: WarmStats) {
        let mut state = mutex_lock(&self.warmer.state, SOURCE, "finish");
        state.state = WarmState::Idle;
        state.run = None;
        state.last_stats = Some(stats);
        self.finished = true;
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let mut state = mutex_lock(&self.warmer.state, SOURCE, "abandon");
        state.state = WarmState::Failed;
        state.run = None;
        warn!(run_id = %self.run_id, "Warming run abandoned before completion");
    }
}

/// Removes an out-of-band strategy from the active set.
struct ActiveStrategy<'a> {
    warmer: &'a CacheWarmer,
    name: String,
}

impl Drop for ActiveStrategy<'_> {
    fn drop(&mut self) {
        mutex_lock(&self.warmer.state, SOURCE, "release_strategy")
            .active
            .remove(&self.name);
    }
}

impl CacheWarmer {
    pub fn new(store: Arc<CacheStore>) -> Self {
        Self {
            store,
            strategies: RwLock::new(Vec::new()),
            state: Mutex::new(WarmerState {
                state: WarmState::Idle,
                run: None,
                last_stats: None,
                active: HashSet::new(),
            }),
        }
    }

    /// Register a strategy, replacing any strategy with the same name.
    pub fn register(&self, strategy: WarmingStrategy) {
        let mut strategies = rw_write(&self.strategies, SOURCE, "register");
        strategies.retain(|existing| existing.name != strategy.name);
        info!(
            strategy = %strategy.name,
            priority = strategy.priority,
            ttl_secs = strategy.ttl_secs,
            "Warming strategy registered"
        );
        strategies.push(strategy);
    }

    pub fn strategy_names(&self) -> Vec<String> {
        self.ordered_strategies()
            .into_iter()
            .map(|strategy| strategy.name)
            .collect()
    }

    fn ordered_strategies(&self) -> Vec<WarmingStrategy> {
        let mut strategies = rw_read(&self.strategies, SOURCE, "ordered").clone();
        strategies.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.name.cmp(&b.name)));
        strategies
    }

    pub fn state(&self) -> WarmState {
        mutex_lock(&self.state, SOURCE, "state").state
    }

    pub fn is_running(&self) -> bool {
        self.state() == WarmState::Running
    }

    pub fn progress(&self) -> Option<WarmingRun> {
        mutex_lock(&self.state, SOURCE, "progress").run.clone()
    }

    pub fn last_stats(&self) -> Option<WarmStats> {
        mutex_lock(&self.state, SOURCE, "last_stats").last_stats.clone()
    }

    /// Run every strategy once, in ascending priority.
    ///
    /// Returns [`WarmOutcome::AlreadyInProgress`] without doing anything when a
    /// cycle is already running.
    #[instrument(skip(self))]
    pub async fn warm_all(&self) -> WarmOutcome {
        let strategies = self.ordered_strategies();
        let Some(guard) = RunGuard::acquire(self, strategies.len()) else {
            info!("Warming skipped: a run is already in progress");
            return WarmOutcome::AlreadyInProgress;
        };

        let started_at = Instant::now();
        let run_id = guard.run_id;
        info!(%run_id, strategies = strategies.len(), "Warming run starting");

        let mut failures = Vec::new();
        let mut keys_written = 0;
        let mut strategies_completed = 0;

        for strategy in &strategies {
            if !self.enter_strategy(&strategy.name) {
                failures.push(WarmFailure {
                    strategy: strategy.name.clone(),
                    error: "skipped: already running out of band".to_string(),
                });
                continue;
            }

            let (written, result) = self.execute(strategy).await;
            keys_written += written;
            match result {
                Ok(()) => {
                    strategies_completed += 1;
                    self.update_run(|run| run.strategies_completed += 1);
                }
                Err(error) => {
                    warn!(strategy = %strategy.name, %error, "Warming strategy failed");
                    failures.push(WarmFailure {
                        strategy: strategy.name.clone(),
                        error,
                    });
                }
            }
        }
        self.update_run(|run| run.current_strategy = None);

        let elapsed = started_at.elapsed();
        histogram!(METRIC_WARM_RUN_MS).record(elapsed.as_secs_f64() * 1000.0);

        let stats = WarmStats {
            run_id,
            strategies_total: strategies.len(),
            strategies_completed,
            keys_written,
            elapsed_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            failures,
        };
        info!(
            %run_id,
            strategies_completed,
            keys_written,
            failed = stats.failures.len(),
            elapsed_ms = stats.elapsed_ms,
            "Warming run complete"
        );

        guard.finish(stats.clone());
        WarmOutcome::Completed(stats)
    }

    /// Run one named strategy outside the full cycle.
    ///
    /// Only blocked while that same strategy is mid-run, whether inside a
    /// cycle or out of band.
    #[instrument(skip(self))]
    pub async fn warm_strategy(&self, name: &str) -> CacheResult<WarmOutcome> {
        let strategy = rw_read(&self.strategies, SOURCE, "warm_strategy")
            .iter()
            .find(|strategy| strategy.name == name)
            .cloned()
            .ok_or_else(|| CacheError::invalid_argument(format!("unknown warming strategy `{name}`")))?;

        {
            let mut state = mutex_lock(&self.state, SOURCE, "warm_strategy");
            let in_cycle = state
                .run
                .as_ref()
                .is_some_and(|run| run.current_strategy.as_deref() == Some(name));
            if in_cycle || !state.active.insert(name.to_string()) {
                return Ok(WarmOutcome::AlreadyInProgress);
            }
        }
        let _active = ActiveStrategy {
            warmer: self,
            name: name.to_string(),
        };

        let started_at = Instant::now();
        let (keys_written, result) = self.execute(&strategy).await;
        let failures = match result {
            Ok(()) => Vec::new(),
            Err(error) => vec![WarmFailure {
                strategy: strategy.name.clone(),
                error,
            }],
        };

        Ok(WarmOutcome::Completed(WarmStats {
            run_id: Uuid::new_v4(),
            strategies_total: 1,
            strategies_completed: usize::from(failures.is_empty()),
            keys_written,
            elapsed_ms: u64::try_from(started_at.elapsed().as_millis()).unwrap_or(u64::MAX),
            failures,
        }))
    }

    /// Mark `name` as the cycle's current strategy unless it is running out of band.
    fn enter_strategy(&self, name: &str) -> bool {
        let mut state = mutex_lock(&self.state, SOURCE, "enter_strategy");
        if state.active.contains(name) {
            return false;
        }
        if let Some(run) = state.run.as_mut() {
            run.current_strategy = Some(name.to_string());
        }
        true
    }

    fn update_run(&self, update: impl FnOnce(&mut WarmingRun)) {
        if let Some(run) = mutex_lock(&self.state, SOURCE, "update_run").run.as_mut() {
            update(run);
        }
    }

    /// Produce and write one strategy's items; a panic counts as a failure.
    async fn execute(&self, strategy: &WarmingStrategy) -> (usize, Result<(), String>) {
        let produced = AssertUnwindSafe(strategy.source.produce())
            .catch_unwind()
            .await;
        let items = match produced {
            Ok(Ok(items)) => items,
            Ok(Err(err)) => return (0, Err(err.to_string())),
            Err(panic) => return (0, Err(format!("panicked: {}", panic_message(&*panic)))),
        };

        let total = items.len();
        let mut written = 0;
        let mut first_error = None;
        for item in items {
            match self
                .store
                .set(&item.key, item.value, strategy.ttl_secs, item.tags)
                .await
            {
                Ok(()) => {
                    written += 1;
                    self.update_run(|run| run.keys_written += 1);
                }
                Err(err) => {
                    first_error.get_or_insert(err);
                }
            }
        }

        counter!(METRIC_WARM_KEYS_TOTAL, "strategy" => strategy.name.clone())
            .increment(written as u64);

        match first_error {
            None => (written, Ok(())),
            Some(err) => (
                written,
                Err(format!("{} of {total} writes failed, first: {err}", total - written)),
            ),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
