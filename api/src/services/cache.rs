//! In-process cache of enriched pages.
//!
//! Keyed by the user's rounded coordinates plus the page boundary. Each key
//! owns an async mutex, so at most one computation per key is in flight;
//! concurrent callers for the same key wait for it and share its outcome.
//! Entries remember the events they were computed for and are only served
//! for that same list. Entries are replaced whole and never served past
//! their expiry.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;

use crate::helpers::coordinate_key;
use crate::services::enrichment::{EventRecord, UserLocation};
use crate::services::scheduler::FanOutResult;

/// Default time-to-live for a cached page.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    latitude: i64,
    longitude: i64,
    window_start: NaiveDate,
    page: u32,
    page_size: u32,
}

impl CacheKey {
    pub fn new(user: UserLocation, window_start: NaiveDate, page: u32, page_size: u32) -> Self {
        Self {
            latitude: coordinate_key(user.latitude),
            longitude: coordinate_key(user.longitude),
            window_start,
            page,
            page_size,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Miss,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStatus::Hit => "HIT",
            CacheStatus::Miss => "MISS",
        }
    }
}

/// A computed page together with the events it was computed for.
#[derive(Debug)]
struct Computed {
    events: Vec<EventRecord>,
    value: Arc<FanOutResult>,
}

impl Computed {
    fn matches(&self, events: &[EventRecord]) -> bool {
        self.events == events
    }
}

#[derive(Debug)]
struct CacheEntry {
    page: Arc<Computed>,
    expires_at: Instant,
}

impl CacheEntry {
    fn is_fresh(&self) -> bool {
        Instant::now() < self.expires_at
    }
}

#[derive(Debug, Default)]
struct SlotState {
    entry: Option<CacheEntry>,
    /// Outcome of the latest compute, stored or not. Only handed to callers
    /// that queued behind that compute.
    last: Option<Arc<Computed>>,
}

#[derive(Debug, Default)]
struct Slot {
    /// Number of computes that finished on this slot.
    completed: AtomicU64,
    state: Mutex<SlotState>,
}

impl Slot {
    fn holds_fresh_entry(&self) -> Option<bool> {
        self.state
            .try_lock()
            .ok()
            .map(|state| state.entry.as_ref().is_some_and(CacheEntry::is_fresh))
    }
}

#[derive(Debug)]
pub struct ResultCache {
    ttl: Duration,
    slots: RwLock<HashMap<CacheKey, Arc<Slot>>>,
    /// Bumped on every invalidation; computations started under an older
    /// generation don't store their result.
    generation: AtomicU64,
}

impl ResultCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            slots: RwLock::new(HashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    /// Return the cached page for `key`, or run `compute` over `events` and
    /// cache its result.
    ///
    /// An entry is only served when it was computed for exactly `events`;
    /// otherwise the page changed underneath it and is recomputed. Callers
    /// that queued behind a running compute for the same events take its
    /// outcome, even when it had failures and was not stored. Only results
    /// without per-item failures are stored. Errors from `compute` are passed
    /// through and nothing is cached.
    pub async fn get_or_compute<F, Fut, E>(
        &self,
        key: CacheKey,
        events: &[EventRecord],
        compute: F,
    ) -> Result<(Arc<FanOutResult>, CacheStatus), E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<FanOutResult, E>>,
    {
        let slot = self.slot(key).await;
        let ticket = slot.completed.load(Ordering::Acquire);
        let mut state = slot.state.lock().await;

        if let Some(cached) = state
            .entry
            .as_ref()
            .filter(|e| e.is_fresh() && e.page.matches(events))
        {
            tracing::debug!("Result cache hit for {:?}", key);
            return Ok((cached.page.value.clone(), CacheStatus::Hit));
        }

        if slot.completed.load(Ordering::Acquire) != ticket {
            if let Some(shared) = state.last.as_ref().filter(|c| c.matches(events)) {
                tracing::debug!("Sharing in-flight result for {:?}", key);
                return Ok((shared.value.clone(), CacheStatus::Miss));
            }
        }

        tracing::debug!("Result cache miss for {:?}", key);
        let generation = self.generation.load(Ordering::Acquire);
        let computed = Arc::new(Computed {
            events: events.to_vec(),
            value: Arc::new(compute().await?),
        });

        let storable =
            computed.value.failed == 0 && self.generation.load(Ordering::Acquire) == generation;
        state.entry = storable.then(|| CacheEntry {
            page: computed.clone(),
            expires_at: Instant::now() + self.ttl,
        });
        state.last = Some(computed.clone());
        slot.completed.fetch_add(1, Ordering::AcqRel);

        Ok((computed.value.clone(), CacheStatus::Miss))
    }

    /// Drop every entry. Called whenever the event set changes.
    pub async fn invalidate_all(&self) {
        let mut slots = self.slots.write().await;
        self.generation.fetch_add(1, Ordering::AcqRel);
        let dropped = slots.len();
        slots.clear();
        tracing::debug!("Result cache invalidated ({} keys dropped)", dropped);
    }

    /// Number of keys currently holding a fresh entry.
    pub async fn fresh_entries(&self) -> usize {
        let slots = self.slots.read().await;
        slots
            .values()
            .filter(|slot| slot.holds_fresh_entry() == Some(true))
            .count()
    }

    async fn slot(&self, key: CacheKey) -> Arc<Slot> {
        if let Some(slot) = self.slots.read().await.get(&key) {
            return slot.clone();
        }

        let mut slots = self.slots.write().await;
        if !slots.contains_key(&key) {
            // Sweep stale keys while we hold the write lock anyway. Slots
            // that are shared or locked belong to an in-flight caller.
            slots.retain(|_, slot| {
                Arc::strong_count(slot) > 1 || slot.holds_fresh_entry().unwrap_or(true)
            });
        }
        slots.entry(key).or_default().clone()
    }
}

impl Default for ResultCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_TTL)
    }
}
