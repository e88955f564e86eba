//! Per-key coordination: single-flight loads and striped write locks.

use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::{Mutex, OnceCell, OwnedMutexGuard};

use super::error::CacheResult;
use super::keys::hash_value;

type Flight = Arc<OnceCell<CacheResult<Bytes>>>;

/// Collapses concurrent loads of one key into a single execution.
///
/// Every caller that joins a flight receives a clone of the same outcome,
/// error included.
#[derive(Default)]
pub struct SingleFlight {
    in_flight: DashMap<String, Flight>,
}

/// Drops the finished flight from the map once its caller leaves.
struct FlightCleanup<'a> {
    map: &'a DashMap<String, Flight>,
    key: &'a str,
    flight: &'a Flight,
}

impl Drop for FlightCleanup<'_> {
    fn drop(&mut self) {
        // an unfinished flight stays so a surviving waiter can still drive it
        self.map.remove_if(self.key, |_, current| {
            Arc::ptr_eq(current, self.flight) && current.initialized()
        });
    }
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `load` unless a flight for `key` is already airborne, then share its outcome.
    pub async fn run<F, Fut>(&self, key: &str, load: F) -> CacheResult<Bytes>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CacheResult<Bytes>>,
    {
        let flight = self
            .in_flight
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        let _cleanup = FlightCleanup {
            map: &self.in_flight,
            key,
            flight: &flight,
        };

        flight.get_or_init(load).await.clone()
    }

    /// Number of keys with a load in progress.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }
}

/// Striped async mutexes serializing writers of the same key.
///
/// Distinct keys may share a stripe; that only costs throughput.
pub struct KeyLocks {
    stripes: Vec<Arc<Mutex<()>>>,
}

impl KeyLocks {
    pub fn new(stripes: NonZeroUsize) -> Self {
        Self {
            stripes: (0..stripes.get())
                .map(|_| Arc::new(Mutex::new(())))
                .collect(),
        }
    }

    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let index = (hash_value(key) % self.stripes.len() as u64) as usize;
        Arc::clone(&self.stripes[index]).lock_owned().await
    }
}
