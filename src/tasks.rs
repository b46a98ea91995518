// src/tasks.rs

//! Fixed-width work-stealing task system
//!
//! All asynchronous work in the fetch pipeline is expressed as opaque tasks
//! submitted to this pool. Tasks never suspend mid-run; an operation that
//! depends on sub-results installs a continuation through an async map and
//! returns, so no worker ever blocks on another task's completion.
//!
//! Scheduling: a global injector queue plus one deque per worker. Workers
//! drain their own deque first, batch-steal from the injector, then steal
//! from siblings. Shutdown is a scoped drain: `finish` closes the gate for
//! external submissions and waits until the in-flight count reaches zero;
//! tasks spawned by running tasks are always accepted.
//!
//! The accepting flag and the in-flight count share one atomic word
//! (`(count << 1) | accepting`) so the gate-close in `finish` cannot race
//! with a concurrent external spawn.

use crossbeam_deque::{Injector, Steal, Stealer, Worker};
use crossbeam_utils::sync::{Parker, Unparker};
use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

type Task = Box<dyn FnOnce() + Send + 'static>;

const ACCEPTING_BIT: usize = 1;
const COUNT_UNIT: usize = 2;

/// Number of empty scheduling rounds before a worker parks.
const SPIN_ROUNDS: u32 = 128;
const PARK_TIMEOUT: Duration = Duration::from_millis(1);

/// Default pool width: the number of hardware threads.
pub fn default_jobs() -> usize {
    thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

struct Shared {
    injector: Injector<Task>,
    stealers: Vec<Stealer<Task>>,
    /// `(in_flight << 1) | accepting`
    state: AtomicUsize,
    done: AtomicBool,
    unparkers: Vec<Unparker>,
    next_unpark: AtomicUsize,
    /// First worker panic; re-thrown on `finish`.
    panic: Mutex<Option<Box<dyn Any + Send + 'static>>>,
}

impl Shared {
    fn unpark_one(&self) {
        let n = self.unparkers.len();
        if n == 0 {
            return;
        }
        let idx = self.next_unpark.fetch_add(1, Ordering::Relaxed) % n;
        self.unparkers[idx].unpark();
    }

    fn unpark_all(&self) {
        for u in &self.unparkers {
            u.unpark();
        }
    }

    fn initiate_done(&self) {
        self.done.store(true, Ordering::Release);
        self.unpark_all();
    }

    fn record_panic(&self, p: Box<dyn Any + Send + 'static>) {
        let mut guard = self.panic.lock().unwrap_or_else(|e| e.into_inner());
        if guard.is_none() {
            *guard = Some(p);
        }
        self.initiate_done();
    }

    /// Try to account for one more task. Rejected only when the gate is
    /// closed and nothing is in flight (the system has already drained).
    fn try_increment(&self) -> bool {
        let mut s = self.state.load(Ordering::Acquire);
        loop {
            if s & ACCEPTING_BIT == 0 && s >> 1 == 0 {
                return false;
            }
            match self.state.compare_exchange_weak(
                s,
                s.wrapping_add(COUNT_UNIT),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => s = actual,
            }
        }
    }
}

/// Cloneable handle for submitting tasks to the pool.
pub struct TaskSystem {
    shared: Arc<Shared>,
}

impl Clone for TaskSystem {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl TaskSystem {
    /// Submit a task. Returns `false` if the system has already drained to
    /// quiescence and no longer accepts work.
    pub fn spawn<F: FnOnce() + Send + 'static>(&self, f: F) -> bool {
        if !self.shared.try_increment() {
            return false;
        }
        self.shared.injector.push(Box::new(f));
        self.shared.unpark_one();
        true
    }
}

/// Owner of the worker threads; dropping without `finish` aborts the drain.
pub struct TaskScope {
    shared: Arc<Shared>,
    threads: Vec<JoinHandle<()>>,
    jobs: usize,
}

impl TaskScope {
    /// Start `jobs` workers (at least one).
    pub fn new(jobs: usize) -> Self {
        let jobs = jobs.max(1);
        let injector = Injector::new();

        let mut locals = Vec::with_capacity(jobs);
        let mut stealers = Vec::with_capacity(jobs);
        for _ in 0..jobs {
            let w = Worker::new_lifo();
            stealers.push(w.stealer());
            locals.push(w);
        }

        let mut parkers = Vec::with_capacity(jobs);
        let mut unparkers = Vec::with_capacity(jobs);
        for _ in 0..jobs {
            let p = Parker::new();
            unparkers.push(p.unparker().clone());
            parkers.push(p);
        }

        let shared = Arc::new(Shared {
            injector,
            stealers,
            state: AtomicUsize::new(ACCEPTING_BIT),
            done: AtomicBool::new(false),
            unparkers,
            next_unpark: AtomicUsize::new(0),
            panic: Mutex::new(None),
        });

        let mut threads = Vec::with_capacity(jobs);
        for worker_id in 0..jobs {
            let shared = Arc::clone(&shared);
            let local = locals.remove(0);
            let parker = parkers.remove(0);
            let th = thread::Builder::new()
                .name(format!("grove-worker-{worker_id}"))
                .spawn(move || worker_loop(worker_id, local, parker, shared))
                .expect("failed to spawn worker thread");
            threads.push(th);
        }

        Self {
            shared,
            threads,
            jobs,
        }
    }

    pub fn jobs(&self) -> usize {
        self.jobs
    }

    /// Handle for submitting work from this and other threads.
    pub fn handle(&self) -> TaskSystem {
        TaskSystem {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Close the gate for external submissions, drain to quiescence, and
    /// join the workers. Re-throws the first worker panic, if any.
    pub fn finish(mut self) {
        let prev = self.shared.state.fetch_and(!ACCEPTING_BIT, Ordering::AcqRel);
        if prev >> 1 == 0 {
            self.shared.initiate_done();
        }

        for th in self.threads.drain(..) {
            if th.join().is_err() {
                // The worker already recorded its panic payload.
            }
        }

        let payload = self
            .shared
            .panic
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(p) = payload {
            std::panic::resume_unwind(p);
        }
    }
}

fn find_task(local: &Worker<Task>, shared: &Shared, start: usize) -> Option<Task> {
    if let Some(t) = local.pop() {
        return Some(t);
    }
    loop {
        match shared.injector.steal_batch_and_pop(local) {
            Steal::Success(t) => return Some(t),
            Steal::Empty => break,
            Steal::Retry => continue,
        }
    }
    let n = shared.stealers.len();
    for i in 0..n {
        let victim = (start + i) % n;
        loop {
            match shared.stealers[victim].steal() {
                Steal::Success(t) => return Some(t),
                Steal::Empty => break,
                Steal::Retry => continue,
            }
        }
    }
    None
}

fn worker_loop(worker_id: usize, local: Worker<Task>, parker: Parker, shared: Arc<Shared>) {
    let mut idle_rounds: u32 = 0;
    loop {
        if shared.done.load(Ordering::Acquire) {
            break;
        }
        match find_task(&local, &shared, worker_id + 1) {
            Some(task) => {
                idle_rounds = 0;
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(task));
                if let Err(p) = result {
                    shared.record_panic(p);
                }
                let prev = shared.state.fetch_sub(COUNT_UNIT, Ordering::AcqRel);
                if prev == COUNT_UNIT {
                    // Count hit zero with the gate closed: quiescent.
                    shared.initiate_done();
                }
            }
            None => {
                let s = shared.state.load(Ordering::Acquire);
                if s == 0 {
                    shared.initiate_done();
                    break;
                }
                idle_rounds = idle_rounds.saturating_add(1);
                if idle_rounds <= SPIN_ROUNDS {
                    std::hint::spin_loop();
                } else if idle_rounds & 0xF == 0 {
                    thread::yield_now();
                } else {
                    parker.park_timeout(PARK_TIMEOUT);
                }
            }
        }
    }
}
