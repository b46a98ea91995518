// src/asyncmap.rs

//! Deduplicating asynchronous consumer map
//!
//! An `AsyncMap<K, V>` coordinates expensive, side-effecting computations
//! keyed by `K`: the user-supplied compute function runs at most once per
//! key, concurrent requesters of a pending key are coalesced, and all
//! waiting is expressed by installing continuations rather than blocking a
//! worker.
//!
//! Every key lives in one of three cell states:
//!
//! - `Pending(waiters)` — computation scheduled or in flight; requesters
//!   attach a waiter and return.
//! - `Ready(value)` — final; late requesters are served immediately.
//! - `Failed` — final; late requesters get an immediate error.
//!
//! The compute function reports errors through a per-key logger taking
//! `(message, fatal)`. A fatal report moves the cell to `Failed`
//! permanently. A non-fatal report is forwarded to the current waiters as a
//! warning; if the compute function then returns without producing a value,
//! the cell is re-armed so a later requester retries.

use crate::tasks::TaskSystem;
use std::collections::hash_map::Entry as HashEntry;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::error;

/// Continuation channel for `(message, fatal)` error reports.
pub type Logger = Arc<dyn Fn(&str, bool) + Send + Sync + 'static>;

/// Wrap a logger with additional context, the way nested pipeline stages
/// prefix their diagnostics.
pub fn wrap_logger<F>(inner: Logger, context: F) -> Logger
where
    F: Fn(&str) -> String + Send + Sync + 'static,
{
    Arc::new(move |msg, fatal| (*inner)(&context(msg), fatal))
}

enum Cell<V> {
    Pending {
        started: bool,
        waiters: Vec<Waiter<V>>,
    },
    Ready(V),
    Failed,
}

struct Waiter<V> {
    request: Arc<Request<V>>,
    slot: usize,
}

struct Request<V> {
    missing: AtomicUsize,
    failed: AtomicBool,
    slots: Mutex<Vec<Option<V>>>,
    on_ready: Mutex<Option<Box<dyn FnOnce(Vec<V>) + Send + 'static>>>,
    on_error: Logger,
    ts: TaskSystem,
}

impl<V: Send + 'static> Request<V> {
    fn fill(self: &Arc<Self>, slot: usize, value: V) {
        {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            slots[slot] = Some(value);
        }
        if self.missing.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        if self.failed.load(Ordering::Acquire) {
            return;
        }
        let on_ready = self
            .on_ready
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(f) = on_ready {
            let values: Vec<V> = {
                let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
                slots.drain(..).map(|v| v.expect("slot filled")).collect()
            };
            self.ts.spawn(move || f(values));
        }
    }

    fn report_failure(&self, msg: &str, fatal: bool) {
        if fatal {
            self.failed.store(true, Ordering::Release);
        }
        (*self.on_error)(msg, fatal);
    }
}

/// Predecessor-key chain for cycle detection across nested map requests.
pub struct KeyChain<K>(Option<Arc<ChainNode<K>>>);

struct ChainNode<K> {
    key: K,
    parent: KeyChain<K>,
}

impl<K> Clone for KeyChain<K> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<K: PartialEq> Default for KeyChain<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: PartialEq> KeyChain<K> {
    pub fn new() -> Self {
        Self(None)
    }

    /// Extend the chain by one key; the receiver is unchanged.
    pub fn push(&self, key: K) -> Self {
        Self(Some(Arc::new(ChainNode {
            key,
            parent: self.clone(),
        })))
    }

    pub fn contains(&self, key: &K) -> bool {
        let mut node = &self.0;
        while let Some(n) = node {
            if &n.key == key {
                return true;
            }
            node = &n.parent.0;
        }
        false
    }
}

type Compute<K, V> = dyn Fn(&TaskSystem, K, ValueSetter<K, V>, Logger) + Send + Sync + 'static;

struct Inner<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    cells: Mutex<HashMap<K, Cell<V>>>,
    compute: Box<Compute<K, V>>,
}

/// Deduplicating async map; cheap to clone, all clones share one cell table.
pub struct AsyncMap<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    inner: Arc<Inner<K, V>>,
}

impl<K, V> Clone for AsyncMap<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V> AsyncMap<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Create a map around `compute`. The compute function receives the key,
    /// a one-shot value setter, and a logger; it must either set a value,
    /// report a fatal error, or return (leaving the key retryable).
    pub fn new<F>(compute: F) -> Self
    where
        F: Fn(&TaskSystem, K, ValueSetter<K, V>, Logger) + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(Inner {
                cells: Mutex::new(HashMap::new()),
                compute: Box::new(compute),
            }),
        }
    }

    /// Schedule `on_ready` to run once every key is available, in key order.
    /// Errors flow through `on_error` as `(message, fatal)`; a fatal error
    /// means `on_ready` will never run for this request.
    pub fn consume_after_keys_ready<R, E>(
        &self,
        ts: &TaskSystem,
        keys: Vec<K>,
        on_ready: R,
        on_error: E,
    ) where
        R: FnOnce(Vec<V>) + Send + 'static,
        E: Fn(&str, bool) + Send + Sync + 'static,
    {
        self.consume_with_deps(ts, keys, &KeyChain::new(), on_ready, on_error)
    }

    /// Like `consume_after_keys_ready`, but reports a cycle (fatal) when a
    /// requested key is already an ancestor in `deps`.
    pub fn consume_with_deps<R, E>(
        &self,
        ts: &TaskSystem,
        keys: Vec<K>,
        deps: &KeyChain<K>,
        on_ready: R,
        on_error: E,
    ) where
        R: FnOnce(Vec<V>) + Send + 'static,
        E: Fn(&str, bool) + Send + Sync + 'static,
    {
        let on_error: Logger = Arc::new(on_error);

        for key in &keys {
            if deps.contains(key) {
                (*on_error)("cyclic dependency between requested keys", true);
                return;
            }
        }

        let request = Arc::new(Request {
            missing: AtomicUsize::new(keys.len()),
            failed: AtomicBool::new(false),
            slots: Mutex::new(vec![None; keys.len()]),
            on_ready: Mutex::new(Some(Box::new(on_ready))),
            on_error: Arc::clone(&on_error),
            ts: ts.clone(),
        });

        if keys.is_empty() {
            let on_ready = request
                .on_ready
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            if let Some(f) = on_ready {
                ts.spawn(move || f(Vec::new()));
            }
            return;
        }

        for (slot, key) in keys.into_iter().enumerate() {
            enum Action<V> {
                Deliver(V),
                Spawn,
                None,
                AbortFailed,
            }

            let action = {
                let mut cells = self
                    .inner
                    .cells
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                match cells.entry(key.clone()) {
                    HashEntry::Occupied(mut e) => match e.get_mut() {
                        Cell::Ready(v) => Action::Deliver(v.clone()),
                        Cell::Failed => Action::AbortFailed,
                        Cell::Pending { started, waiters } => {
                            waiters.push(Waiter {
                                request: Arc::clone(&request),
                                slot,
                            });
                            if *started {
                                Action::None
                            } else {
                                *started = true;
                                Action::Spawn
                            }
                        }
                    },
                    HashEntry::Vacant(e) => {
                        e.insert(Cell::Pending {
                            started: true,
                            waiters: vec![Waiter {
                                request: Arc::clone(&request),
                                slot,
                            }],
                        });
                        Action::Spawn
                    }
                }
            };

            match action {
                Action::Deliver(v) => request.fill(slot, v),
                Action::Spawn => self.spawn_compute(ts, key),
                Action::None => {}
                Action::AbortFailed => {
                    request.report_failure("requested key previously failed", true);
                    return;
                }
            }
        }
    }

    fn spawn_compute(&self, ts: &TaskSystem, key: K) {
        let map = self.clone();
        let ts2 = ts.clone();
        ts.spawn(move || {
            let setter = ValueSetter {
                map: map.clone(),
                key: key.clone(),
                consumed: false,
            };
            let logger = map.key_logger(key.clone());
            (map.inner.compute)(&ts2, key, setter, logger);
        });
    }

    /// Per-key logger handed to the compute function: fatal reports latch
    /// the cell to `Failed`, non-fatal reports are forwarded as warnings.
    fn key_logger(&self, key: K) -> Logger {
        let map = self.clone();
        Arc::new(move |msg: &str, fatal: bool| {
            if fatal {
                map.fail_key(&key, msg);
            } else {
                map.warn_waiters(&key, msg);
            }
        })
    }

    fn fail_key(&self, key: &K, msg: &str) {
        let waiters = {
            let mut cells = self
                .inner
                .cells
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            match cells.insert(key.clone(), Cell::Failed) {
                Some(Cell::Pending { waiters, .. }) => waiters,
                Some(Cell::Ready(_)) => {
                    error!("internal error: failure reported for ready key");
                    Vec::new()
                }
                _ => Vec::new(),
            }
        };
        for w in waiters {
            w.request.report_failure(msg, true);
        }
    }

    fn warn_waiters(&self, key: &K, msg: &str) {
        let reporters: Vec<Arc<Request<V>>> = {
            let cells = self
                .inner
                .cells
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            match cells.get(key) {
                Some(Cell::Pending { waiters, .. }) => {
                    waiters.iter().map(|w| Arc::clone(&w.request)).collect()
                }
                _ => Vec::new(),
            }
        };
        for r in reporters {
            r.report_failure(msg, false);
        }
    }

    fn set_value(&self, key: &K, value: V) {
        let waiters = {
            let mut cells = self
                .inner
                .cells
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            match cells.insert(key.clone(), Cell::Ready(value.clone())) {
                Some(Cell::Pending { waiters, .. }) => waiters,
                Some(_) => {
                    // Duplicate ready transition; the one-shot setter makes
                    // this unreachable from a single compute run.
                    error!("internal error: duplicate ready transition for key");
                    Vec::new()
                }
                None => Vec::new(),
            }
        };
        for w in waiters {
            w.request.fill(w.slot, value.clone());
        }
    }

    /// Re-arm a pending cell after a compute run ended without a value, so
    /// the next requester retries. Existing waiters stay attached.
    fn rearm(&self, key: &K) {
        let mut cells = self
            .inner
            .cells
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(Cell::Pending { started, .. }) = cells.get_mut(key) {
            *started = false;
        }
    }

    /// Number of keys currently tracked (any state). Test and diagnostics
    /// aid.
    pub fn len(&self) -> usize {
        self.inner
            .cells
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One-shot handle through which a compute function publishes its result.
/// Dropping the setter without calling `set` leaves the key retryable
/// (unless a fatal error latched it to `Failed` first).
pub struct ValueSetter<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    map: AsyncMap<K, V>,
    key: K,
    consumed: bool,
}

impl<K, V> ValueSetter<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Publish the value, waking all waiters. Consumes the setter.
    pub fn set(mut self, value: V) {
        self.consumed = true;
        self.map.set_value(&self.key, value);
    }
}

impl<K, V> Drop for ValueSetter<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        if !self.consumed {
            self.map.rearm(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::TaskScope;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn test_values_delivered_in_key_order() {
        let map: AsyncMap<u32, u32> = AsyncMap::new(|_ts, key, setter, _log| {
            setter.set(key * 10);
        });
        let scope = TaskScope::new(4);
        let ts = scope.handle();

        let result = Arc::new(Mutex::new(Vec::new()));
        let r2 = Arc::clone(&result);
        map.consume_after_keys_ready(
            &ts,
            vec![3, 1, 2],
            move |values| {
                *r2.lock().unwrap() = values;
            },
            |_msg, _fatal| panic!("unexpected error"),
        );
        scope.finish();
        assert_eq!(*result.lock().unwrap(), vec![30, 10, 20]);
    }

    #[test]
    fn test_compute_runs_at_most_once_per_key() {
        let calls = Arc::new(AtomicU32::new(0));
        let c2 = Arc::clone(&calls);
        let map: AsyncMap<String, u32> = AsyncMap::new(move |_ts, _key, setter, _log| {
            c2.fetch_add(1, Ordering::Relaxed);
            // Give concurrent requesters a window to coalesce.
            std::thread::sleep(std::time::Duration::from_millis(10));
            setter.set(7);
        });
        let scope = TaskScope::new(4);
        let ts = scope.handle();

        let hits = Arc::new(AtomicU32::new(0));
        for _ in 0..8 {
            let h = Arc::clone(&hits);
            map.consume_after_keys_ready(
                &ts,
                vec!["same".to_string()],
                move |values| {
                    assert_eq!(values, vec![7]);
                    h.fetch_add(1, Ordering::Relaxed);
                },
                |_m, _f| panic!("unexpected error"),
            );
        }
        scope.finish();
        assert_eq!(calls.load(Ordering::Relaxed), 1);
        assert_eq!(hits.load(Ordering::Relaxed), 8);
    }

    #[test]
    fn test_fatal_failure_reaches_waiters_and_latches() {
        let map: AsyncMap<u32, u32> = AsyncMap::new(|_ts, _key, _setter, log| {
            log("boom", true);
        });
        let scope = TaskScope::new(2);
        let ts = scope.handle();

        let errors: Arc<Mutex<Vec<(String, bool)>>> = Arc::new(Mutex::new(Vec::new()));
        let e2 = Arc::clone(&errors);
        map.consume_after_keys_ready(
            &ts,
            vec![1],
            |_v| panic!("must not become ready"),
            move |msg, fatal| {
                e2.lock().unwrap().push((msg.to_string(), fatal));
            },
        );
        scope.finish();

        {
            let errs = errors.lock().unwrap();
            assert_eq!(errs.len(), 1);
            assert_eq!(errs[0], ("boom".to_string(), true));
        }

        // A later requester observes the latched failure immediately.
        let scope = TaskScope::new(2);
        let ts = scope.handle();
        let late = Arc::new(Mutex::new(Vec::new()));
        let l2 = Arc::clone(&late);
        map.consume_after_keys_ready(
            &ts,
            vec![1],
            |_v| panic!("must not become ready"),
            move |msg, fatal| {
                l2.lock().unwrap().push((msg.to_string(), fatal));
            },
        );
        scope.finish();
        let late = late.lock().unwrap();
        assert_eq!(late.len(), 1);
        assert!(late[0].1);
    }

    #[test]
    fn test_non_fatal_rearms_for_retry() {
        let calls = Arc::new(AtomicU32::new(0));
        let c2 = Arc::clone(&calls);
        let map: AsyncMap<u32, u32> = AsyncMap::new(move |_ts, key, setter, log| {
            let n = c2.fetch_add(1, Ordering::Relaxed);
            if n == 0 {
                // Recoverable miss: report and return without a value.
                log("first source unavailable", false);
            } else {
                setter.set(key + 1);
            }
        });

        let scope = TaskScope::new(2);
        let ts = scope.handle();
        let warnings = Arc::new(AtomicU32::new(0));
        let w2 = Arc::clone(&warnings);
        map.consume_after_keys_ready(
            &ts,
            vec![5],
            |_v| {},
            move |_msg, fatal| {
                assert!(!fatal);
                w2.fetch_add(1, Ordering::Relaxed);
            },
        );
        scope.finish();
        assert_eq!(warnings.load(Ordering::Relaxed), 1);

        // Second request retries the compute and succeeds; the first
        // request's waiter is also satisfied now.
        let scope = TaskScope::new(2);
        let ts = scope.handle();
        let got = Arc::new(Mutex::new(None));
        let g2 = Arc::clone(&got);
        map.consume_after_keys_ready(
            &ts,
            vec![5],
            move |values| {
                *g2.lock().unwrap() = Some(values[0]);
            },
            |_m, _f| panic!("unexpected error"),
        );
        scope.finish();
        assert_eq!(calls.load(Ordering::Relaxed), 2);
        assert_eq!(*got.lock().unwrap(), Some(6));
    }

    #[test]
    fn test_cycle_detection_with_deps() {
        let map: AsyncMap<u32, u32> = AsyncMap::new(|_ts, key, setter, _log| {
            setter.set(key);
        });
        let scope = TaskScope::new(2);
        let ts = scope.handle();

        let chain = KeyChain::new().push(1).push(2);
        let cyclic = Arc::new(AtomicBool::new(false));
        let c2 = Arc::clone(&cyclic);
        map.consume_with_deps(
            &ts,
            vec![1],
            &chain,
            |_v| panic!("cycle must not resolve"),
            move |msg, fatal| {
                assert!(fatal);
                assert!(msg.contains("cyclic"));
                c2.store(true, Ordering::Release);
            },
        );
        scope.finish();
        assert!(cyclic.load(Ordering::Acquire));
    }

    #[test]
    fn test_empty_key_list_fires_immediately() {
        let map: AsyncMap<u32, u32> = AsyncMap::new(|_ts, key, setter, _log| setter.set(key));
        let scope = TaskScope::new(1);
        let ts = scope.handle();
        let fired = Arc::new(AtomicBool::new(false));
        let f2 = Arc::clone(&fired);
        map.consume_after_keys_ready(
            &ts,
            vec![],
            move |values| {
                assert!(values.is_empty());
                f2.store(true, Ordering::Release);
            },
            |_m, _f| panic!("unexpected error"),
        );
        scope.finish();
        assert!(fired.load(Ordering::Acquire));
    }

    #[test]
    fn test_nested_maps_compose() {
        let inner: AsyncMap<u32, u32> = AsyncMap::new(|_ts, key, setter, _log| {
            setter.set(key * 2);
        });
        let inner2 = inner.clone();
        let outer: AsyncMap<u32, u32> = AsyncMap::new(move |ts, key, setter, log| {
            inner2.consume_after_keys_ready(
                ts,
                vec![key],
                move |values| setter.set(values[0] + 1),
                move |msg, fatal| log(&format!("while resolving inner key:\n{}", msg), fatal),
            );
        });

        let scope = TaskScope::new(4);
        let ts = scope.handle();
        let got = Arc::new(Mutex::new(None));
        let g2 = Arc::clone(&got);
        outer.consume_after_keys_ready(
            &ts,
            vec![10],
            move |values| {
                *g2.lock().unwrap() = Some(values[0]);
            },
            |_m, _f| panic!("unexpected error"),
        );
        scope.finish();
        assert_eq!(*got.lock().unwrap(), Some(21));
    }

    #[test]
    fn test_key_chain_contains() {
        let chain = KeyChain::new().push("a").push("b");
        assert!(chain.contains(&"a"));
        assert!(chain.contains(&"b"));
        assert!(!chain.contains(&"c"));
        assert!(!KeyChain::<&str>::new().contains(&"a"));
    }
}
