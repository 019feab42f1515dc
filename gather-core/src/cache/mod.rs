//! The deduplicating request cache.
//!
//! A [`Cache`] maps each distinct request to the shared, write-once cell
//! that will eventually hold its outcome. The cell is registered *before*
//! the request executes, which is what makes deduplication work across
//! concurrently evaluated branches: the first evaluation to ask about a
//! request owns executing it, and every later evaluation finds the cell
//! already registered and simply waits on the same outcome.
//!
//! Caches are cheaply cloneable handles over shared state. Each top-level
//! [`run`](crate::query::Query::run) creates a fresh cache; an explicit
//! instance can be shared across runs with
//! [`run_with`](crate::query::Query::run_with).
//!
//! Cached failures stay cached. An `Err` outcome is as much a hit as an
//! `Ok` one, until the entry is explicitly [`remove`](Cache::remove)d.
//!
//! A registered entry carries an obligation: whoever registered it must
//! eventually fill it. When the registering evaluation is dropped before its
//! request was handed to a data source (timeout, a lost race, an external
//! cancellation), a [`PendingGuard`] unregisters the entry and marks the
//! cell abandoned, so waiters re-issue the request instead of hanging on an
//! outcome that will never arrive.
use std::{
    any::Any,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use dashmap::{mapref::entry::Entry, DashMap};
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::request::{ErasedRequest, Request};

/// A shared, write-once slot for the outcome of a single request.
///
/// The first write wins; all later writes are discarded. Plain reads never
/// block on a pending write, they observe absence; an evaluation that finds
/// another evaluation's request already in flight can [`wait`](Self::wait)
/// for the winning write instead.
#[derive(Clone, Default)]
pub(crate) struct ResultCell {
    slot: Arc<Mutex<Option<Box<dyn Any + Send + Sync>>>>,
    resolved: Arc<Notify>,
    abandoned: Arc<AtomicBool>,
}

impl ResultCell {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Store an outcome if the cell is still empty. Returns whether this
    /// call was the winning write.
    pub(crate) fn fill<T: Any + Send + Sync>(&self, value: T) -> bool {
        let mut slot = self.slot.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(Box::new(value));
        drop(slot);
        self.resolved.notify_waiters();
        true
    }

    /// Wait until the cell is filled and clone the outcome out, or observe
    /// that the owning evaluation abandoned the cell (`None`).
    pub(crate) async fn wait<T: Any + Clone>(&self) -> Option<T> {
        loop {
            // Register before checking so a fill between the check and the
            // await cannot be missed.
            let notified = self.resolved.notified();
            if let Some(value) = self.read::<T>() {
                return Some(value);
            }
            if self.abandoned.load(Ordering::Acquire) {
                return None;
            }
            notified.await;
        }
    }

    /// The stored outcome, cloned out, or `None` while the cell is pending.
    pub(crate) fn read<T: Any + Clone>(&self) -> Option<T> {
        self.slot
            .lock()
            .as_ref()
            .and_then(|value| value.downcast_ref::<T>())
            .cloned()
    }

    /// Mark the cell as one that will never be filled by its registrar and
    /// wake every waiter so they can re-issue the request.
    pub(crate) fn abandon(&self) {
        self.abandoned.store(true, Ordering::Release);
        self.resolved.notify_waiters();
    }

    pub(crate) fn is_filled(&self) -> bool {
        self.slot.lock().is_some()
    }
}

/// The outcome of [`Cache::lookup_or_insert`].
pub(crate) enum Lookup {
    /// The request was not registered. The caller owns executing it and
    /// filling the returned cell.
    Miss(ResultCell),
    /// The request is already registered, in flight or resolved.
    Hit(ResultCell),
}

/// A concurrency-safe map from requests to their result cells.
///
/// Cloning a `Cache` produces another handle to the same underlying state.
#[derive(Clone, Default)]
pub struct Cache {
    entries: Arc<DashMap<ErasedRequest, ResultCell>>,
}

impl Cache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically find the cell registered for a request, registering a
    /// fresh pending cell when absent.
    ///
    /// Under concurrent calls for one request, exactly one caller observes
    /// [`Lookup::Miss`]; everyone else shares the cell it registered.
    pub(crate) fn lookup_or_insert(&self, request: ErasedRequest) -> Lookup {
        match self.entries.entry(request) {
            Entry::Occupied(entry) => Lookup::Hit(entry.get().clone()),
            Entry::Vacant(entry) => {
                let cell = ResultCell::new();
                entry.insert(cell.clone());
                Lookup::Miss(cell)
            }
        }
    }

    /// Prime the cache with a resolved outcome, replacing any existing
    /// entry. Later lookups for the request hit without touching a data
    /// source.
    pub fn insert<R: Request>(&self, request: R, outcome: Result<R::Value, R::Error>) {
        let cell = ResultCell::new();
        cell.fill(outcome);
        self.entries.insert(ErasedRequest::new(request), cell);
    }

    /// Drop the entry for a request, but only while it still maps to the
    /// given pending cell. A resolved cell, or a fresh cell registered by a
    /// later lookup, is left alone.
    pub(crate) fn evict_pending(&self, request: &ErasedRequest, cell: &ResultCell) {
        self.entries.remove_if(request, |_, entry| {
            Arc::ptr_eq(&entry.slot, &cell.slot) && !cell.is_filled()
        });
    }

    /// Drop the entry for a request, forcing the next lookup to execute it
    /// again. Returns whether an entry was present.
    pub fn remove<R: Request>(&self, request: &R) -> bool {
        self.entries
            .remove(&ErasedRequest::new(request.clone()))
            .is_some()
    }

    /// Whether the request is registered, resolved or still in flight.
    pub fn contains<R: Request>(&self, request: &R) -> bool {
        self.entries
            .contains_key(&ErasedRequest::new(request.clone()))
    }

    /// The resolved outcome for a request, or `None` when the request is
    /// unregistered or still in flight.
    pub fn get<R: Request>(&self, request: &R) -> Option<Result<R::Value, R::Error>> {
        self.entries
            .get(&ErasedRequest::new(request.clone()))
            .and_then(|cell| cell.read())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Undoes a cache registration whose owner never got to execute it.
///
/// Created on every cache miss and carried with the pending request. If the
/// guard is dropped while the cell is still empty, the cell was registered
/// but its round never ran to completion: the entry is unregistered and the
/// cell abandoned. Once a data source fills the cell, dropping the guard is
/// a no-op.
pub(crate) struct PendingGuard {
    cache: Cache,
    request: ErasedRequest,
    cell: ResultCell,
}

impl PendingGuard {
    pub(crate) fn new(cache: Cache, request: ErasedRequest, cell: ResultCell) -> Self {
        Self {
            cache,
            request,
            cell,
        }
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if !self.cell.is_filled() {
            self.cache.evict_pending(&self.request, &self.cell);
            self.cell.abandon();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Clone, Debug, PartialEq, Eq, Hash)]
    struct GetName(u32);

    impl Request for GetName {
        type Value = String;
        type Error = String;
    }

    type Outcome = Result<String, String>;

    #[test]
    fn cell_first_write_wins() {
        let cell = ResultCell::new();
        assert!(!cell.is_filled());
        assert!(cell.fill::<Outcome>(Ok("first".to_string())));
        assert!(!cell.fill::<Outcome>(Ok("second".to_string())));
        assert_eq!(cell.read::<Outcome>(), Some(Ok("first".to_string())));
    }

    #[test]
    fn pending_cell_reads_none() {
        let cell = ResultCell::new();
        assert_eq!(cell.read::<Outcome>(), None);
    }

    #[tokio::test]
    async fn wait_observes_a_later_fill() {
        let cell = ResultCell::new();
        let waiter = {
            let cell = cell.clone();
            tokio::spawn(async move { cell.wait::<Outcome>().await })
        };
        tokio::task::yield_now().await;
        cell.fill::<Outcome>(Ok("late".to_string()));
        assert_eq!(waiter.await.unwrap(), Some(Ok("late".to_string())));
    }

    #[tokio::test]
    async fn wait_observes_abandonment() {
        let cell = ResultCell::new();
        let waiter = {
            let cell = cell.clone();
            tokio::spawn(async move { cell.wait::<Outcome>().await })
        };
        tokio::task::yield_now().await;
        cell.abandon();
        assert_eq!(waiter.await.unwrap(), None);
    }

    #[test]
    fn dropped_guard_unregisters_a_pending_entry() {
        let cache = Cache::new();
        let request = ErasedRequest::new(GetName(1));
        let Lookup::Miss(cell) = cache.lookup_or_insert(request.clone()) else {
            panic!("first lookup must miss");
        };

        drop(PendingGuard::new(cache.clone(), request.clone(), cell));
        assert!(!cache.contains(&GetName(1)));
        assert!(matches!(cache.lookup_or_insert(request), Lookup::Miss(_)));
    }

    #[test]
    fn dropped_guard_leaves_a_filled_entry_alone() {
        let cache = Cache::new();
        let request = ErasedRequest::new(GetName(1));
        let Lookup::Miss(cell) = cache.lookup_or_insert(request.clone()) else {
            panic!("first lookup must miss");
        };
        cell.fill::<Outcome>(Ok("alice".to_string()));

        drop(PendingGuard::new(cache.clone(), request, cell));
        assert_eq!(cache.get(&GetName(1)), Some(Ok("alice".to_string())));
    }

    #[test]
    fn evict_pending_ignores_a_replacement_cell() {
        let cache = Cache::new();
        let request = ErasedRequest::new(GetName(1));
        let Lookup::Miss(stale) = cache.lookup_or_insert(request.clone()) else {
            panic!("first lookup must miss");
        };

        // A fresh registration under the same key must survive the stale
        // guard firing.
        cache.remove(&GetName(1));
        let Lookup::Miss(_fresh) = cache.lookup_or_insert(request.clone()) else {
            panic!("second lookup must miss");
        };
        cache.evict_pending(&request, &stale);
        assert!(cache.contains(&GetName(1)));
    }

    #[test]
    fn lookup_or_insert_hits_after_miss() {
        let cache = Cache::new();
        let request = ErasedRequest::new(GetName(1));

        let Lookup::Miss(cell) = cache.lookup_or_insert(request.clone()) else {
            panic!("first lookup must miss");
        };
        cell.fill::<Outcome>(Ok("alice".to_string()));

        match cache.lookup_or_insert(request) {
            Lookup::Hit(cell) => {
                assert_eq!(cell.read::<Outcome>(), Some(Ok("alice".to_string())))
            }
            Lookup::Miss(_) => panic!("second lookup must hit"),
        }
        assert_eq!(cache.get(&GetName(1)), Some(Ok("alice".to_string())));
    }

    #[test]
    fn concurrent_lookups_yield_exactly_one_miss() {
        let cache = Cache::new();
        let misses = AtomicUsize::new(0);

        std::thread::scope(|scope| {
            for _ in 0..32 {
                scope.spawn(|| {
                    let lookup = cache.lookup_or_insert(ErasedRequest::new(GetName(7)));
                    if let Lookup::Miss(_) = lookup {
                        misses.fetch_add(1, Ordering::SeqCst);
                    }
                });
            }
        });

        assert_eq!(misses.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn remove_forces_a_fresh_miss() {
        let cache = Cache::new();
        let Lookup::Miss(cell) = cache.lookup_or_insert(ErasedRequest::new(GetName(1))) else {
            panic!("first lookup must miss");
        };
        cell.fill::<Outcome>(Err("boom".to_string()));

        // A cached failure is still a hit.
        assert!(cache.contains(&GetName(1)));
        assert_eq!(cache.get(&GetName(1)), Some(Err("boom".to_string())));

        assert!(cache.remove(&GetName(1)));
        assert!(!cache.remove(&GetName(1)));
        assert!(matches!(
            cache.lookup_or_insert(ErasedRequest::new(GetName(1))),
            Lookup::Miss(_)
        ));
    }
}
