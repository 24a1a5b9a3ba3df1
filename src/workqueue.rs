//! Elastic, typed worker-pool scheduler (spec §3, §4.1, §5).
//!
//! A shutdown-signal-plus-notify_all worker loop, generalized to three
//! thread-budget policies and a single completion channel shared by every
//! queue an engine creates.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use crate::collaborators::{ClusterMembership, EventLoop, ThreadTracer};
use crate::fifo::Fifo;

/// Thread-budget policy for a queue (spec §3, table in §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadPolicy {
    /// Roof of 1: `run` calls serialize strictly in submission order.
    Ordered,
    /// Roof of `2 * cluster_membership.node_count()`.
    Dynamic,
    /// No roof.
    Unlimited,
}

/// The caller-supplied body of a work item. Runs off the submitter's
/// thread, never while holding a queue lock.
pub type RunFn = Box<dyn FnOnce() + Send + 'static>;
/// The caller-supplied completion body. Runs exactly once, on the engine's
/// single completion thread, after `run` (if any) returns.
pub type DoneFn = Box<dyn FnOnce() + Send + 'static>;

/// A unit of work submitted to a queue.
pub struct Work {
    pub run: Option<RunFn>,
    pub done: DoneFn,
}

impl Work {
    pub fn new(run: Option<RunFn>, done: DoneFn) -> Self {
        Work { run, done }
    }

    /// A work item with no `run` step -- `done` fires as soon as it's
    /// dequeued.
    pub fn done_only(done: DoneFn) -> Self {
        Work { run: None, done }
    }
}

struct PendingState {
    pending: Fifo<Work>,
    nr_pending: usize,
    nr_running: usize,
    nr_threads: usize,
    protection_deadline: Instant,
}

/// A named, live queue handle. Submitters hold an `Arc<WorkQueue>`.
pub struct WorkQueue {
    name: String,
    policy: ThreadPolicy,
    protection_window: Duration,
    pending_lock: Mutex<PendingState>,
    pending_cond: Condvar,
    finished_lock: Mutex<Fifo<DoneFn>>,
    startup_lock: Mutex<()>,
    membership: Arc<dyn ClusterMembership>,
    tracer: Arc<dyn ThreadTracer>,
    completion: Arc<CompletionSignal>,
    shutting_down: Arc<AtomicBool>,
}

impl WorkQueue {
    fn roof(&self) -> usize {
        match self.policy {
            ThreadPolicy::Ordered => 1,
            ThreadPolicy::Dynamic => 2 * self.membership.node_count().max(1),
            ThreadPolicy::Unlimited => usize::MAX,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy(&self) -> ThreadPolicy {
        self.policy
    }

    /// Current thread count, pending count, running count -- for tests and
    /// diagnostics (spec §8 thread-count monotonicity property).
    pub fn stats(&self) -> (usize, usize, usize) {
        let state = self.pending_lock.lock().unwrap();
        (state.nr_threads, state.nr_pending, state.nr_running)
    }

    /// Submit a work item (spec §4.1 "Submission"). Never fails: a failed
    /// growth spawn is logged and simply forgoes that growth step.
    pub fn submit(self: &Arc<Self>, work: Work) {
        let mut state = self.pending_lock.lock().unwrap();
        state.nr_pending += 1;
        self.maybe_grow(&mut state);
        state.pending.push_back(work);
        drop(state);
        self.pending_cond.notify_one();
    }

    /// Grow predicate (spec §4.1): `thread_count < pending + running &&
    /// thread_count * 2 <= roof`. Spawns up to `min(thread_count * 2,
    /// roof)` total threads and refreshes the shrink-protection deadline.
    fn maybe_grow(self: &Arc<Self>, state: &mut PendingState) {
        let roof = self.roof();
        if state.nr_threads >= state.nr_pending + state.nr_running {
            return;
        }
        if state.nr_threads.saturating_mul(2) > roof {
            return;
        }
        let target = state.nr_threads.saturating_mul(2).min(roof);
        while state.nr_threads < target {
            match self.spawn_worker_locked(state) {
                Ok(()) => {}
                Err(e) => {
                    log::warn!(
                        "queue {}: failed to spawn growth worker: {}",
                        self.name,
                        e
                    );
                    break;
                }
            }
        }
        state.protection_deadline = Instant::now() + self.protection_window;
    }

    /// Spawns one worker, holding the startup lock across the spawn call so
    /// the child can never observe a partially-initialized queue (spec §5).
    /// Caller must already hold `pending_lock`; on success `nr_threads` and
    /// `nr_running` are both incremented before returning.
    fn spawn_worker_locked(self: &Arc<Self>, state: &mut PendingState) -> std::io::Result<()> {
        let queue = Arc::clone(self);
        let _startup = self.startup_lock.lock().unwrap();
        thread::Builder::new()
            .name(format!("wqe-{}", self.name))
            .spawn(move || queue.worker_loop())?;
        state.nr_threads += 1;
        state.nr_running += 1;
        Ok(())
    }

    /// Shrink predicate (spec §4.1): evaluated by each worker before
    /// dequeuing. If it does not hold, the protection deadline is advanced
    /// regardless -- this is load-bearing, not an approximation: it is what
    /// bounds thread churn under bursty traffic.
    fn should_shrink(&self, state: &mut PendingState) -> bool {
        if self.shutting_down.load(Ordering::Acquire) {
            return true;
        }
        let now = Instant::now();
        let under_half = state.nr_pending + state.nr_running <= state.nr_threads / 2;
        let past_protection = now >= state.protection_deadline;
        if under_half && past_protection {
            true
        } else {
            state.protection_deadline = now + self.protection_window;
            false
        }
    }

    fn worker_loop(self: Arc<Self>) {
        {
            // Entry barrier: block until the creator has released the
            // startup lock, guaranteeing this worker never runs against a
            // half-initialized queue.
            let _barrier = self.startup_lock.lock().unwrap();
        }
        let tid = thread::current().id();
        self.tracer.register_thread(tid);

        let mut state = self.pending_lock.lock().unwrap();
        loop {
            if self.should_shrink(&mut state) {
                state.nr_threads -= 1;
                state.nr_running -= 1;
                drop(state);
                self.tracer.unregister_thread(tid);
                return;
            }

            if state.pending.is_empty() {
                state.nr_running -= 1;
                state = self.pending_cond.wait(state).unwrap();
                state.nr_running += 1;
                continue;
            }

            state.nr_pending -= 1;
            let work = state
                .pending
                .pop_front()
                .expect("pending list was just checked non-empty under the same lock");
            drop(state);

            let Work { run, done } = work;
            if let Some(run) = run {
                run();
            }

            {
                let mut finished = self.finished_lock.lock().unwrap();
                finished.push_back(done);
            }
            self.completion.signal();

            state = self.pending_lock.lock().unwrap();
        }
    }

    /// Called by the completion thread: atomically swap out the finished
    /// list and return it for draining outside the lock.
    fn take_finished(&self) -> std::collections::VecDeque<DoneFn> {
        let mut finished = self.finished_lock.lock().unwrap();
        finished.take_all()
    }

    fn wake_all_for_shutdown(&self) {
        let _state = self.pending_lock.lock().unwrap();
        self.pending_cond.notify_all();
    }
}

/// Process-wide (per-engine) completion readiness channel: a semaphore-mode
/// counter standing in for the source's `eventfd` (spec §4.1, §6). `signal`
/// is the write side; `wait_and_drain` is the non-blocking read-and-discard
/// side, performed once per wakeup by the completion thread.
struct CompletionSignal {
    counter: Mutex<u64>,
    cond: Condvar,
}

impl CompletionSignal {
    fn new() -> Self {
        CompletionSignal {
            counter: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    fn signal(&self) {
        let mut counter = self.counter.lock().unwrap();
        *counter += 1;
        self.cond.notify_one();
    }

    /// Blocks until at least one completion is pending, then reads and
    /// discards the counter in one step.
    fn wait_and_drain(&self) {
        let mut counter = self.counter.lock().unwrap();
        while *counter == 0 {
            counter = self.cond.wait(counter).unwrap();
        }
        *counter = 0;
    }
}

/// Owns the completion readiness channel and the registry of live queues
/// (spec §5 "Resource sharing": the registry has its own lock, independent
/// of any individual queue, so creation can race the completion drain
/// pass).
pub struct WorkQueueEngine {
    queues: Mutex<HashMap<String, Arc<WorkQueue>>>,
    completion: Arc<CompletionSignal>,
    membership: Arc<dyn ClusterMembership>,
    tracer: Arc<dyn ThreadTracer>,
    protection_window: Duration,
    shutting_down: Arc<AtomicBool>,
    completion_thread: Mutex<Option<JoinHandle<()>>>,
}

impl WorkQueueEngine {
    pub fn new(
        protection_window: Duration,
        membership: Arc<dyn ClusterMembership>,
        tracer: Arc<dyn ThreadTracer>,
        event_loop: &dyn EventLoop,
    ) -> Arc<Self> {
        event_loop.register_completion_source();

        let engine = Arc::new(WorkQueueEngine {
            queues: Mutex::new(HashMap::new()),
            completion: Arc::new(CompletionSignal::new()),
            membership,
            tracer,
            protection_window,
            shutting_down: Arc::new(AtomicBool::new(false)),
            completion_thread: Mutex::new(None),
        });

        let handle = {
            let engine = Arc::clone(&engine);
            thread::Builder::new()
                .name("wqe-completion".to_string())
                .spawn(move || engine.completion_loop())
                .expect("failed to spawn completion thread")
        };
        *engine.completion_thread.lock().unwrap() = Some(handle);

        engine
    }

    fn completion_loop(self: Arc<Self>) {
        loop {
            self.completion.wait_and_drain();
            let queues: Vec<Arc<WorkQueue>> =
                self.queues.lock().unwrap().values().cloned().collect();
            for queue in queues {
                for done in queue.take_finished() {
                    done();
                }
            }
            if self.shutting_down.load(Ordering::Acquire) {
                return;
            }
        }
    }

    /// `new_queue(name, policy)` (spec §4.1). Spawns one initial worker;
    /// tears down the partially constructed queue and returns `Err` if that
    /// spawn fails.
    pub fn new_queue(
        self: &Arc<Self>,
        name: impl Into<String>,
        policy: ThreadPolicy,
    ) -> anyhow::Result<Arc<WorkQueue>> {
        let name = name.into();
        let queue = Arc::new(WorkQueue {
            name: name.clone(),
            policy,
            protection_window: self.protection_window,
            pending_lock: Mutex::new(PendingState {
                pending: Fifo::new(),
                nr_pending: 0,
                nr_running: 0,
                nr_threads: 0,
                protection_deadline: Instant::now() + self.protection_window,
            }),
            pending_cond: Condvar::new(),
            finished_lock: Mutex::new(Fifo::new()),
            startup_lock: Mutex::new(()),
            membership: Arc::clone(&self.membership),
            tracer: Arc::clone(&self.tracer),
            completion: Arc::clone(&self.completion),
            shutting_down: Arc::clone(&self.shutting_down),
        });

        {
            let mut state = queue.pending_lock.lock().unwrap();
            if let Err(e) = queue.spawn_worker_locked(&mut state) {
                return Err(anyhow::anyhow!(
                    "failed to create initial worker for queue {}: {}",
                    name,
                    e
                ));
            }
        }

        self.queues.lock().unwrap().insert(name, Arc::clone(&queue));
        Ok(queue)
    }

    /// Sugar for `new_queue(name, ThreadPolicy::Ordered)`.
    pub fn ordered_queue(self: &Arc<Self>, name: impl Into<String>) -> anyhow::Result<Arc<WorkQueue>> {
        self.new_queue(name, ThreadPolicy::Ordered)
    }

    pub fn queue(&self, name: &str) -> Option<Arc<WorkQueue>> {
        self.queues.lock().unwrap().get(name).cloned()
    }
}

impl Drop for WorkQueueEngine {
    fn drop(&mut self) {
        self.shutting_down.store(true, Ordering::Release);

        let queues: Vec<Arc<WorkQueue>> = self.queues.lock().unwrap().values().cloned().collect();
        for queue in &queues {
            queue.wake_all_for_shutdown();
        }

        self.completion.signal();

        if let Some(handle) = self.completion_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}
