//! N:M fiber scheduler
//!
//! A pool of worker threads drains a shared FIFO of tasks (fibers or
//! closures), running each cooperatively until it yields or terminates.
//! When `use_caller` is set the constructing thread joins the pool through
//! a dedicated *dispatch fiber* that `stop()` drives.
//!
//! The reactor extends this loop through [`ReactorHooks`]: `tickle` wakes
//! parked workers, `run_idle` is the body of the per-worker idle fiber
//! (where blocking multiplexer waits live), and `reactor_stopping` adds
//! extra stop conditions. Without hooks the idle fiber just yields until
//! the scheduler stops.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread::JoinHandle;

use parking_lot::Mutex;

use strand_core::{os, FiberState};

use crate::fiber::Fiber;
use crate::tls;

/// Target-thread value accepting any worker
pub const ANY_THREAD: i32 = -1;

/// Boxed closure form a task carries
pub type TaskFn = Box<dyn FnOnce() + Send>;

/// One entry in the scheduler queue: a fiber or a closure, optionally
/// pinned to a worker thread id.
pub struct Task {
    pub(crate) fiber: Option<Arc<Fiber>>,
    pub(crate) cb: Option<TaskFn>,
    pub(crate) thread: i32,
}

impl Task {
    /// Task resuming an existing fiber
    pub fn from_fiber(fiber: Arc<Fiber>) -> Task {
        Task {
            fiber: Some(fiber),
            cb: None,
            thread: ANY_THREAD,
        }
    }

    /// Task running a closure in a (possibly reused) fiber
    pub fn from_fn(cb: impl FnOnce() + Send + 'static) -> Task {
        Task {
            fiber: None,
            cb: Some(Box::new(cb)),
            thread: ANY_THREAD,
        }
    }

    /// Task from an already boxed closure
    pub fn from_boxed(cb: TaskFn) -> Task {
        Task {
            fiber: None,
            cb: Some(cb),
            thread: ANY_THREAD,
        }
    }

    /// Pin this task to the worker with the given kernel thread id
    pub fn at_thread(mut self, thread: i32) -> Task {
        self.thread = thread;
        self
    }
}

/// Override points by which the reactor extends the dispatch loop
pub trait ReactorHooks: Send + Sync {
    /// Runs once per worker before its first dispatch iteration
    fn on_thread_start(self: Arc<Self>);

    /// Wake workers parked in their idle fiber
    fn tickle(&self);

    /// Body of the idle fiber; returns only when the loop should exit
    fn run_idle(self: Arc<Self>);

    /// Extra conditions ANDed into [`Scheduler::stopping`]
    fn reactor_stopping(&self) -> bool;
}

/// Cooperative N:M scheduler over a worker-thread pool
pub struct Scheduler {
    name: String,
    /// Workers this scheduler spawns (excludes the caller thread)
    thread_count: usize,
    /// Kernel tid of the caller thread in use_caller mode, -1 otherwise
    root_thread: i32,
    queue: Mutex<VecDeque<Task>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    thread_ids: Mutex<Vec<i32>>,
    /// The dispatch fiber living on the caller thread (use_caller mode)
    caller_fiber: Mutex<Option<Arc<Fiber>>>,
    active_threads: AtomicUsize,
    idle_threads: AtomicUsize,
    /// Starts true; cleared by start(), set again by stop()
    stop_flag: AtomicBool,
    auto_stop: AtomicBool,
    reactor: OnceLock<Weak<dyn ReactorHooks>>,
}

impl Scheduler {
    /// Create a scheduler.
    ///
    /// `threads` is the total worker count; with `use_caller` the calling
    /// thread takes one of those slots and one fewer OS thread is spawned.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Arc<Scheduler> {
        assert!(threads > 0, "scheduler needs at least one thread");

        let name = name.to_owned();
        let sched = Arc::new_cyclic(|weak: &Weak<Scheduler>| {
            let mut thread_count = threads;
            let mut root_thread = -1;
            let mut caller_fiber = None;

            if use_caller {
                // Bootstrap this thread's root fiber before anything swaps
                let _ = Fiber::current();
                thread_count -= 1;

                assert!(
                    tls::current_scheduler().is_none(),
                    "thread already hosts a scheduler"
                );

                // The dispatch fiber runs the worker loop when stop()
                // drives it; it exits back to the thread root, so it does
                // not participate in scheduling itself.
                let w = weak.clone();
                caller_fiber = Some(Fiber::new(
                    move || {
                        if let Some(s) = w.upgrade() {
                            s.run();
                        }
                    },
                    0,
                    false,
                ));
                root_thread = os::thread_id();
            }

            Scheduler {
                name,
                thread_count,
                root_thread,
                queue: Mutex::new(VecDeque::new()),
                threads: Mutex::new(Vec::new()),
                thread_ids: Mutex::new(Vec::new()),
                caller_fiber: Mutex::new(caller_fiber),
                active_threads: AtomicUsize::new(0),
                idle_threads: AtomicUsize::new(0),
                stop_flag: AtomicBool::new(true),
                auto_stop: AtomicBool::new(false),
                reactor: OnceLock::new(),
            }
        });

        if use_caller {
            tls::set_current_scheduler(Some(sched.clone()));
            let guard = sched.caller_fiber.lock();
            let cf = guard.as_ref().expect("use_caller without dispatch fiber");
            tls::set_dispatch_fiber(Arc::as_ptr(cf));
            drop(guard);
            sched.thread_ids.lock().push(sched.root_thread);
        }

        sched
    }

    /// Install the reactor override points. Called once, before `start`.
    pub fn set_reactor(&self, hooks: Weak<dyn ReactorHooks>) {
        if self.reactor.set(hooks).is_err() {
            panic!("reactor hooks already installed");
        }
    }

    fn reactor(&self) -> Option<Arc<dyn ReactorHooks>> {
        self.reactor.get().and_then(Weak::upgrade)
    }

    /// Scheduler installed on the calling thread, if any
    pub fn current() -> Option<Arc<Scheduler>> {
        tls::current_scheduler()
    }

    /// The calling thread's dispatch fiber, if it runs a dispatch loop
    pub fn main_fiber() -> Option<Arc<Fiber>> {
        let p = tls::dispatch_fiber_ptr();
        if p.is_null() {
            None
        } else {
            unsafe {
                Arc::increment_strong_count(p);
                Some(Arc::from_raw(p))
            }
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Kernel thread ids of all participating threads
    pub fn thread_ids(&self) -> Vec<i32> {
        self.thread_ids.lock().clone()
    }

    /// True between `start()` and `stop()`
    #[inline]
    pub fn is_running(&self) -> bool {
        !self.stop_flag.load(Ordering::Acquire)
    }

    #[inline]
    pub fn has_idle_threads(&self) -> bool {
        self.idle_threads.load(Ordering::Acquire) > 0
    }

    #[inline]
    pub fn active_count(&self) -> usize {
        self.active_threads.load(Ordering::Acquire)
    }

    /// Spawn the worker pool. Idempotent: a no-op unless stopped.
    pub fn start(self: &Arc<Self>) {
        let mut threads = self.threads.lock();
        if !self.stop_flag.load(Ordering::Acquire) {
            return;
        }
        self.stop_flag.store(false, Ordering::Release);
        assert!(threads.is_empty());

        for i in 0..self.thread_count {
            let sched = Arc::clone(self);
            let handle = std::thread::Builder::new()
                .name(format!("{}-{}", self.name, i))
                .spawn(move || sched.run())
                .expect("failed to spawn worker thread");
            threads.push(handle);
        }
    }

    /// Append a task; wakes a worker if the queue was empty.
    pub fn schedule(&self, task: Task) {
        debug_assert!(task.fiber.is_some() || task.cb.is_some());
        let need_tickle = {
            let mut q = self.queue.lock();
            let was_empty = q.is_empty();
            q.push_back(task);
            was_empty
        };
        if need_tickle {
            self.tickle();
        }
    }

    /// Append a batch of tasks under a single queue lock
    pub fn schedule_batch(&self, tasks: impl IntoIterator<Item = Task>) {
        let need_tickle = {
            let mut q = self.queue.lock();
            let was_empty = q.is_empty();
            q.extend(tasks);
            was_empty && !q.is_empty()
        };
        if need_tickle {
            self.tickle();
        }
    }

    /// Convenience: schedule a closure on any worker
    pub fn spawn(&self, f: impl FnOnce() + Send + 'static) {
        self.schedule(Task::from_fn(f));
    }

    /// Wake workers parked in their idle hook.
    ///
    /// Base implementation only logs; the reactor overrides this with a
    /// self-pipe write.
    pub fn tickle(&self) {
        match self.reactor() {
            Some(r) => r.tickle(),
            None => tracing::trace!(name = %self.name, "tickle"),
        }
    }

    /// True once stop was requested, the queue is drained, no worker is
    /// executing a task, and the reactor (if any) agrees.
    pub fn stopping(&self) -> bool {
        let base = {
            let q = self.queue.lock();
            self.auto_stop.load(Ordering::Acquire)
                && self.stop_flag.load(Ordering::Acquire)
                && q.is_empty()
                && self.active_threads.load(Ordering::Acquire) == 0
        };
        if !base {
            return false;
        }
        match self.reactor() {
            Some(r) => r.reactor_stopping(),
            None => true,
        }
    }

    /// Stop the scheduler: drain remaining work, then join every worker.
    ///
    /// In use_caller mode this drives the dispatch fiber on the calling
    /// thread, so the caller participates in draining its own queue.
    pub fn stop(&self) {
        self.auto_stop.store(true, Ordering::Release);

        {
            let guard = self.caller_fiber.lock();
            if let Some(cf) = guard.as_ref() {
                // Caller-only scheduler that never ran (or already ran to
                // completion): nothing to drive, nothing to join.
                if self.thread_count == 0
                    && matches!(cf.state(), FiberState::Term | FiberState::Init)
                {
                    tracing::info!(name = %self.name, "stopped");
                    self.stop_flag.store(true, Ordering::Release);
                    if self.stopping() {
                        return;
                    }
                }
            }
        }

        if self.root_thread != -1 {
            // use_caller schedulers must be stopped from their own thread
            assert!(
                Scheduler::current().map_or(false, |s| std::ptr::eq(Arc::as_ptr(&s), self)),
                "use_caller scheduler stopped from a foreign thread"
            );
        } else {
            assert!(
                Scheduler::current().map_or(true, |s| !std::ptr::eq(Arc::as_ptr(&s), self)),
                "scheduler cannot stop itself from one of its own workers"
            );
        }

        self.stop_flag.store(true, Ordering::Release);
        for _ in 0..self.thread_count {
            self.tickle();
        }

        let caller = self.caller_fiber.lock().clone();
        if caller.is_some() {
            self.tickle();
        }
        if let Some(cf) = caller {
            if !self.stopping() {
                cf.resume();
            }
        }

        let handles: Vec<_> = std::mem::take(&mut *self.threads.lock());
        for h in handles {
            let _ = h.join();
        }

        if self.root_thread == os::thread_id() {
            // Release the caller thread for a future scheduler
            tls::set_current_scheduler(None);
        }
    }

    /// The per-thread dispatch loop.
    ///
    /// Executed by every spawned worker, and by the dispatch fiber on the
    /// caller thread in use_caller mode.
    pub(crate) fn run(self: Arc<Self>) {
        tracing::debug!(name = %self.name, thread = os::thread_id(), "dispatch loop start");
        tls::set_current_scheduler(Some(self.clone()));
        strand_core::set_thread_hook_enable(true);

        let reactor = self.reactor();

        if os::thread_id() != self.root_thread {
            // Promote this worker's root fiber to its dispatch fiber
            let root = Fiber::current();
            tls::set_dispatch_fiber(Arc::as_ptr(&root));
            self.thread_ids.lock().push(os::thread_id());
        }
        if let Some(r) = &reactor {
            Arc::clone(r).on_thread_start();
        }

        let idle_fiber = match &reactor {
            Some(r) => {
                let r = Arc::clone(r);
                Fiber::new(move || r.run_idle(), 0, true)
            }
            None => {
                let s = self.clone();
                Fiber::new(move || s.base_idle(), 0, true)
            }
        };
        let mut cb_fiber: Option<Arc<Fiber>> = None;

        loop {
            let mut tickle_me = false;
            let mut is_active = false;
            let mut task: Option<Task> = None;

            {
                let mut q = self.queue.lock();
                let mut idx = 0;
                while idx < q.len() {
                    let t = &q[idx];
                    if t.thread != ANY_THREAD && t.thread != os::thread_id() {
                        // Pinned to some other worker; make sure it wakes
                        idx += 1;
                        tickle_me = true;
                        continue;
                    }
                    debug_assert!(t.fiber.is_some() || t.cb.is_some());
                    if let Some(f) = &t.fiber {
                        // A fiber that yielded READY can show up here before
                        // its previous worker finished unwinding; resuming
                        // it now would double-run it.
                        if f.state() == FiberState::Exec {
                            idx += 1;
                            continue;
                        }
                    }
                    task = q.remove(idx);
                    self.active_threads.fetch_add(1, Ordering::AcqRel);
                    is_active = true;
                    break;
                }
                tickle_me |= task.is_some() && idx < q.len();
            }

            if tickle_me {
                self.tickle();
            }

            match task {
                Some(Task {
                    fiber: Some(fiber), ..
                }) if !fiber.state().is_terminal() => {
                    fiber.resume();
                    self.active_threads.fetch_sub(1, Ordering::AcqRel);

                    match fiber.state() {
                        FiberState::Ready => self.schedule(Task::from_fiber(fiber)),
                        s if !s.is_terminal() => fiber.set_state(FiberState::Hold),
                        _ => {}
                    }
                }
                Some(Task { cb: Some(cb), .. }) => {
                    // Reuse the cached closure fiber only once it has fully
                    // finished; a HOLD-parked one is still owned by whatever
                    // parked it.
                    let fiber = match cb_fiber.take() {
                        Some(f) if f.state().is_resettable() => {
                            f.reset(cb);
                            f
                        }
                        _ => Fiber::new(cb, 0, true),
                    };
                    fiber.resume();
                    self.active_threads.fetch_sub(1, Ordering::AcqRel);

                    match fiber.state() {
                        FiberState::Ready => self.schedule(Task::from_fiber(fiber)),
                        s if s.is_terminal() => cb_fiber = Some(fiber),
                        _ => fiber.set_state(FiberState::Hold),
                    }
                }
                _ => {
                    if is_active {
                        // Claimed slot turned out to hold a dead fiber
                        self.active_threads.fetch_sub(1, Ordering::AcqRel);
                        continue;
                    }
                    if idle_fiber.state() == FiberState::Term {
                        tracing::info!(name = %self.name, "idle fiber terminated");
                        break;
                    }
                    self.idle_threads.fetch_add(1, Ordering::AcqRel);
                    idle_fiber.resume();
                    self.idle_threads.fetch_sub(1, Ordering::AcqRel);
                    if !idle_fiber.state().is_terminal() {
                        idle_fiber.set_state(FiberState::Hold);
                    }
                }
            }
        }

        tracing::debug!(name = %self.name, thread = os::thread_id(), "dispatch loop exit");
    }

    /// Idle hook of the plain scheduler: spin-yield until stopping.
    /// The reactor replaces this with a blocking multiplexer wait.
    fn base_idle(&self) {
        tracing::debug!(name = %self.name, "idle");
        while !self.stopping() {
            Fiber::yield_to_hold();
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        debug_assert!(
            self.stop_flag.load(Ordering::Acquire),
            "scheduler dropped while running"
        );
    }
}
