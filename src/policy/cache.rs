//! TTL cache with request coalescing for the policy read shapes.
//!
//! Guarantees, per key:
//! - at most one in-flight store read; concurrent lookups share it
//! - readers see either the old value or the fully populated new one
//! - a failed read is never cached, and falls back to the last good value
//!   when one exists (however old) instead of failing the caller
//! - loads run on a spawned task, so a cancelled caller never aborts a
//!   population other callers are waiting on
//!
//! Timestamps use `tokio::time::Instant`, so tests drive expiry with
//! `tokio::time::pause` / `advance`.

use crate::store::StoreError;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use rustc_hash::FxHashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::time::{Duration, Instant};
use tracing::warn;

type SharedLoad<V> = Shared<BoxFuture<'static, Result<Arc<V>, StoreError>>>;

struct Slot<V> {
    value: Option<(Arc<V>, Instant)>,
    /// Generation-tagged shared load, so a settle after invalidation can
    /// tell whether it still owns the slot.
    inflight: Option<(u64, SharedLoad<V>)>,
}

impl<V> Default for Slot<V> {
    fn default() -> Self {
        Self {
            value: None,
            inflight: None,
        }
    }
}

pub struct CoalescingCache<K, V> {
    name: &'static str,
    ttl: Duration,
    capacity: usize,
    generation: AtomicU64,
    slots: Mutex<FxHashMap<K, Slot<V>>>,
}

impl<K, V> CoalescingCache<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Send + Sync + 'static,
{
    pub fn new(name: &'static str, ttl: Duration, capacity: usize) -> Self {
        Self {
            name,
            ttl,
            capacity,
            generation: AtomicU64::new(0),
            slots: Mutex::new(FxHashMap::default()),
        }
    }

    /// Returns the cached value for `key`, or runs `load` to populate it.
    pub async fn get_with<F>(&self, key: K, load: F) -> Result<Arc<V>, StoreError>
    where
        F: Future<Output = Result<V, StoreError>> + Send + 'static,
    {
        let (generation, shared) = {
            let mut slots = self.slots.lock().unwrap();
            let slot = slots.entry(key.clone()).or_default();

            if let Some((value, fetched_at)) = &slot.value {
                if fetched_at.elapsed() < self.ttl {
                    return Ok(value.clone());
                }
            }

            // A completed-with-error load left behind by cancelled callers
            // must not be handed out again.
            if let Some((_, f)) = &slot.inflight {
                if matches!(f.peek(), Some(Err(_))) {
                    slot.inflight = None;
                }
            }

            match &slot.inflight {
                Some((generation, f)) => (*generation, f.clone()),
                None => {
                    let generation = self.generation.fetch_add(1, Ordering::Relaxed);
                    let handle = tokio::spawn(load);
                    let fut: SharedLoad<V> = async move {
                        match handle.await {
                            Ok(Ok(v)) => Ok(Arc::new(v)),
                            Ok(Err(e)) => Err(e),
                            Err(e) => {
                                Err(StoreError::Unavailable(format!("load task failed: {}", e)))
                            }
                        }
                    }
                    .boxed()
                    .shared();
                    slot.inflight = Some((generation, fut.clone()));
                    (generation, fut)
                }
            }
        };

        let result = shared.await;

        let mut slots = self.slots.lock().unwrap();
        match result {
            Ok(value) => {
                // The slot may have been invalidated mid-load; only settle if
                // this load is still the registered one.
                if let Some(slot) = slots.get_mut(&key) {
                    if slot.inflight.as_ref().is_some_and(|(g, _)| *g == generation) {
                        slot.inflight = None;
                        slot.value = Some((value.clone(), Instant::now()));
                    }
                }
                if slots.len() > self.capacity {
                    self.sweep(&mut slots);
                }
                Ok(value)
            }
            Err(e) => {
                let stale = match slots.get_mut(&key) {
                    Some(slot) => {
                        if slot.inflight.as_ref().is_some_and(|(g, _)| *g == generation) {
                            slot.inflight = None;
                        }
                        slot.value.as_ref().map(|(v, _)| v.clone())
                    }
                    None => None,
                };
                match stale {
                    Some(value) => {
                        warn!(
                            cache = self.name,
                            error = %e,
                            "Store read failed, serving last cached value"
                        );
                        Ok(value)
                    }
                    None => Err(e),
                }
            }
        }
    }

    pub fn invalidate(&self, key: &K) {
        self.slots.lock().unwrap().remove(key);
    }

    pub fn reset_all(&self) {
        self.slots.lock().unwrap().clear();
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.slots.lock().unwrap().len()
    }

    /// Drops empty slots, then the oldest settled entries until the map fits
    /// the capacity again. Entries with a load in flight are kept.
    fn sweep(&self, slots: &mut FxHashMap<K, Slot<V>>) {
        slots.retain(|_, slot| slot.value.is_some() || slot.inflight.is_some());
        if slots.len() <= self.capacity {
            return;
        }

        let mut settled: Vec<(K, Instant)> = slots
            .iter()
            .filter(|(_, slot)| slot.inflight.is_none())
            .filter_map(|(k, slot)| slot.value.as_ref().map(|(_, at)| (k.clone(), *at)))
            .collect();
        settled.sort_by_key(|(_, at)| *at);

        let excess = slots.len().saturating_sub(self.capacity);
        for (key, _) in settled.into_iter().take(excess) {
            slots.remove(&key);
        }
    }
}
