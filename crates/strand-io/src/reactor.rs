//! The I/O reactor
//!
//! [`IoManager`] extends the scheduler with an edge-triggered epoll
//! multiplexer and the timer set. Worker threads with nothing to dispatch
//! park inside the reactor's idle fiber, which blocks in `epoll_wait` (the
//! one place cooperative code may block), translates readiness into
//! scheduled tasks, drains expired timers, and yields back.
//!
//! Per-fd state lives in an `Arc<FdContext>` slot; the slot's address is
//! stored as the kernel-side token, so dispatch recovers the context
//! without any map lookup. Slots are allocated once and never move — the
//! table grows by pushing new Arcs, existing ones stay put.
//!
//! Waking a blocked `epoll_wait` (the *tickle*) is a one-byte write to a
//! self-pipe whose read end is registered edge-triggered.

use std::cell::RefCell;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

use strand_core::{os, FiberState, Result, RuntimeError};
use strand_runtime::{Fiber, ReactorHooks, Scheduler, Task};

use crate::timer::{ExpiredFn, Timer, TimerManager};

/// Kernel token reserved for the self-pipe read end. FdContext tokens are
/// heap addresses, never 0.
const WAKE_TOKEN: u64 = 0;

/// Readiness events on one descriptor direction
///
/// Values mirror `EPOLLIN`/`EPOLLOUT` so a mask converts to the kernel
/// event set without a table.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Event(u32);

impl Event {
    pub const NONE: Event = Event(0);
    pub const READ: Event = Event(0x1);
    pub const WRITE: Event = Event(0x4);

    #[inline]
    pub fn contains(self, other: Event) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    #[inline]
    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    #[inline]
    fn without(self, other: Event) -> Event {
        Event(self.0 & !other.0)
    }

    /// Corresponding EPOLLIN/EPOLLOUT bits
    fn epoll_bits(self) -> u32 {
        let mut bits = 0u32;
        if self.contains(Event::READ) {
            bits |= libc::EPOLLIN as u32;
        }
        if self.contains(Event::WRITE) {
            bits |= libc::EPOLLOUT as u32;
        }
        bits
    }
}

impl std::ops::BitOr for Event {
    type Output = Event;
    fn bitor(self, rhs: Event) -> Event {
        Event(self.0 | rhs.0)
    }
}

impl std::ops::BitAnd for Event {
    type Output = Event;
    fn bitand(self, rhs: Event) -> Event {
        Event(self.0 & rhs.0)
    }
}

impl Default for Event {
    fn default() -> Event {
        Event::NONE
    }
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.contains(Event::READ), self.contains(Event::WRITE)) {
            (true, true) => f.write_str("READ|WRITE"),
            (true, false) => f.write_str("READ"),
            (false, true) => f.write_str("WRITE"),
            (false, false) => f.write_str("NONE"),
        }
    }
}

type EventFn = Box<dyn FnOnce() + Send>;

/// Per-direction waiter: the scheduler to wake into, and exactly one of
/// {fiber, callback} while armed.
#[derive(Default)]
struct EventContext {
    scheduler: Option<Arc<Scheduler>>,
    fiber: Option<Arc<Fiber>>,
    cb: Option<EventFn>,
}

impl EventContext {
    fn is_empty(&self) -> bool {
        self.scheduler.is_none() && self.fiber.is_none() && self.cb.is_none()
    }

    fn reset(&mut self) {
        self.scheduler = None;
        self.fiber = None;
        self.cb = None;
    }
}

#[derive(Default)]
struct FdContextInner {
    /// Currently armed directions
    events: Event,
    read: EventContext,
    write: EventContext,
}

impl FdContextInner {
    fn event_ctx(&mut self, event: Event) -> &mut EventContext {
        match event {
            Event::READ => &mut self.read,
            Event::WRITE => &mut self.write,
            _ => panic!("not a single direction: {:?}", event),
        }
    }

    /// Fire one direction: disarm it and enqueue its waiter.
    ///
    /// The waiter is queued exactly once; the direction must be re-armed
    /// before it can fire again.
    fn trigger(&mut self, event: Event) {
        assert!(self.events.contains(event), "trigger on unarmed {:?}", event);
        self.events = self.events.without(event);

        let ctx = self.event_ctx(event);
        let scheduler = ctx
            .scheduler
            .take()
            .expect("armed direction without scheduler");
        if let Some(cb) = ctx.cb.take() {
            scheduler.schedule(Task::from_boxed(cb));
        } else {
            let fiber = ctx.fiber.take().expect("armed direction without waiter");
            scheduler.schedule(Task::from_fiber(fiber));
        }
    }
}

/// Reactor-side record for one file descriptor
pub(crate) struct FdContext {
    fd: i32,
    inner: Mutex<FdContextInner>,
}

thread_local! {
    static CURRENT_IOM: RefCell<Option<Arc<IoManager>>> = const { RefCell::new(None) };
}

/// Scheduler + timer manager + epoll reactor
pub struct IoManager {
    scheduler: Arc<Scheduler>,
    timers: TimerManager,
    epfd: i32,
    /// Self-pipe: [read end armed in epoll, write end for tickles]
    tickle_fds: [i32; 2],
    fd_contexts: RwLock<Vec<Arc<FdContext>>>,
    /// Number of armed directions across all fds
    pending_events: AtomicUsize,
}

impl IoManager {
    /// Create the reactor and start its worker pool.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Result<Arc<IoManager>> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(RuntimeError::ReactorSetup(io::Error::last_os_error()));
        }

        let mut pipe_fds = [0i32; 2];
        if unsafe { libc::pipe(pipe_fds.as_mut_ptr()) } != 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(epfd) };
            return Err(RuntimeError::ReactorSetup(err));
        }

        // Non-blocking read end: a spurious wake must not stall a worker
        unsafe {
            let flags = libc::fcntl(pipe_fds[0], libc::F_GETFL, 0);
            libc::fcntl(pipe_fds[0], libc::F_SETFL, flags | libc::O_NONBLOCK);
        }

        let mut ev = libc::epoll_event {
            events: (libc::EPOLLIN | libc::EPOLLET) as u32,
            u64: WAKE_TOKEN,
        };
        if unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, pipe_fds[0], &mut ev) } != 0 {
            let err = io::Error::last_os_error();
            unsafe {
                libc::close(epfd);
                libc::close(pipe_fds[0]);
                libc::close(pipe_fds[1]);
            }
            return Err(RuntimeError::ReactorSetup(err));
        }

        let iom = Arc::new(IoManager {
            scheduler: Scheduler::new(threads, use_caller, name),
            timers: TimerManager::new(),
            epfd,
            tickle_fds: pipe_fds,
            fd_contexts: RwLock::new(Vec::new()),
            pending_events: AtomicUsize::new(0),
        });

        iom.resize_contexts(32);

        let hooks: Weak<dyn ReactorHooks> = Arc::downgrade(&(iom.clone() as Arc<dyn ReactorHooks>));
        iom.scheduler.set_reactor(hooks);

        let wake_target = Arc::downgrade(&iom);
        iom.timers.set_wake(Box::new(move || {
            if let Some(iom) = wake_target.upgrade() {
                iom.tickle_reactor();
            }
        }));

        if use_caller {
            CURRENT_IOM.with(|c| *c.borrow_mut() = Some(iom.clone()));
        }

        iom.scheduler.start();
        Ok(iom)
    }

    /// Reactor installed on the calling thread, if any
    pub fn current() -> Option<Arc<IoManager>> {
        CURRENT_IOM.with(|c| c.borrow().clone())
    }

    #[inline]
    pub fn name(&self) -> &str {
        self.scheduler.name()
    }

    /// The underlying scheduler
    #[inline]
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Armed directions across all fds
    #[inline]
    pub fn pending_event_count(&self) -> usize {
        self.pending_events.load(Ordering::Acquire)
    }

    pub fn schedule(&self, task: Task) {
        self.scheduler.schedule(task);
    }

    pub fn spawn(&self, f: impl FnOnce() + Send + 'static) {
        self.scheduler.spawn(f);
    }

    pub fn stop(&self) {
        self.scheduler.stop();
    }

    pub fn stopping(&self) -> bool {
        self.scheduler.stopping()
    }

    // ── Timers ──────────────────────────────────────────────────────

    pub fn add_timer(
        &self,
        ms: u64,
        cb: impl Fn() + Send + Sync + 'static,
        recurring: bool,
    ) -> Arc<Timer> {
        self.timers.add_timer(ms, cb, recurring)
    }

    pub fn add_condition_timer<T: Send + Sync + 'static>(
        &self,
        ms: u64,
        cb: impl Fn() + Send + Sync + 'static,
        cond: Weak<T>,
        recurring: bool,
    ) -> Arc<Timer> {
        self.timers.add_condition_timer(ms, cb, cond, recurring)
    }

    pub fn next_timer_ms(&self) -> u64 {
        self.timers.next_timer_ms()
    }

    pub fn has_timer(&self) -> bool {
        self.timers.has_timer()
    }

    // ── Event registration ──────────────────────────────────────────

    /// Arm one direction on `fd`.
    ///
    /// With a callback the fire schedules the callback; without one it
    /// schedules the *currently running fiber*, which is how a hooked call
    /// parks itself until readiness. Double-arming a direction is a caller
    /// bug and asserts.
    pub fn add_event(&self, fd: i32, event: Event, cb: Option<EventFn>) -> Result<()> {
        debug_assert!(event == Event::READ || event == Event::WRITE);

        let ctx = self.context_for(fd);
        let mut inner = ctx.inner.lock();
        assert!(
            !inner.events.contains(event),
            "fd {} direction {:?} armed twice",
            fd,
            event
        );

        let op = if inner.events.is_none() {
            libc::EPOLL_CTL_ADD
        } else {
            libc::EPOLL_CTL_MOD
        };
        let bits = libc::EPOLLET as u32 | (inner.events | event).epoll_bits();
        self.epoll_update(op, fd, bits, Arc::as_ptr(&ctx) as u64)?;

        self.pending_events.fetch_add(1, Ordering::AcqRel);
        inner.events = inner.events | event;

        let ectx = inner.event_ctx(event);
        debug_assert!(ectx.is_empty());
        ectx.scheduler = Some(Scheduler::current().expect("add_event outside a scheduler thread"));
        match cb {
            Some(cb) => ectx.cb = Some(cb),
            None => {
                let fiber = Fiber::current();
                assert_eq!(
                    fiber.state(),
                    FiberState::Exec,
                    "default waiter must be the running fiber"
                );
                ectx.fiber = Some(fiber);
            }
        }
        Ok(())
    }

    /// Disarm one direction without firing it
    pub fn del_event(&self, fd: i32, event: Event) -> bool {
        let Some(ctx) = self.try_context(fd) else {
            return false;
        };
        let mut inner = ctx.inner.lock();
        if !inner.events.contains(event) {
            return false;
        }

        let left = inner.events.without(event);
        let op = if left.is_none() {
            libc::EPOLL_CTL_DEL
        } else {
            libc::EPOLL_CTL_MOD
        };
        let bits = libc::EPOLLET as u32 | left.epoll_bits();
        if self
            .epoll_update(op, fd, bits, Arc::as_ptr(&ctx) as u64)
            .is_err()
        {
            return false;
        }

        self.pending_events.fetch_sub(1, Ordering::AcqRel);
        inner.events = left;
        inner.event_ctx(event).reset();
        true
    }

    /// Disarm one direction and fire it, waking the parked waiter.
    ///
    /// This is the cancellation channel for I/O waits: the waiter resumes
    /// as if the event had happened and sorts out the cause itself.
    pub fn cancel_event(&self, fd: i32, event: Event) -> bool {
        let Some(ctx) = self.try_context(fd) else {
            return false;
        };
        let mut inner = ctx.inner.lock();
        if !inner.events.contains(event) {
            return false;
        }

        let left = inner.events.without(event);
        let op = if left.is_none() {
            libc::EPOLL_CTL_DEL
        } else {
            libc::EPOLL_CTL_MOD
        };
        let bits = libc::EPOLLET as u32 | left.epoll_bits();
        if self
            .epoll_update(op, fd, bits, Arc::as_ptr(&ctx) as u64)
            .is_err()
        {
            return false;
        }

        inner.trigger(event);
        self.pending_events.fetch_sub(1, Ordering::AcqRel);
        true
    }

    /// Disarm and fire every direction on `fd`
    pub fn cancel_all(&self, fd: i32) -> bool {
        let Some(ctx) = self.try_context(fd) else {
            return false;
        };
        let mut inner = ctx.inner.lock();
        if inner.events.is_none() {
            return false;
        }

        if self
            .epoll_update(libc::EPOLL_CTL_DEL, fd, 0, Arc::as_ptr(&ctx) as u64)
            .is_err()
        {
            return false;
        }

        if inner.events.contains(Event::READ) {
            inner.trigger(Event::READ);
            self.pending_events.fetch_sub(1, Ordering::AcqRel);
        }
        if inner.events.contains(Event::WRITE) {
            inner.trigger(Event::WRITE);
            self.pending_events.fetch_sub(1, Ordering::AcqRel);
        }
        debug_assert!(inner.events.is_none());
        true
    }

    // ── Internals ───────────────────────────────────────────────────

    /// Slot for `fd`, growing the table to fd * 1.5 on demand
    fn context_for(&self, fd: i32) -> Arc<FdContext> {
        debug_assert!(fd >= 0);
        {
            let table = self.fd_contexts.read();
            if (fd as usize) < table.len() {
                return table[fd as usize].clone();
            }
        }
        self.resize_contexts(fd as usize * 3 / 2 + 1);
        self.fd_contexts.read()[fd as usize].clone()
    }

    fn try_context(&self, fd: i32) -> Option<Arc<FdContext>> {
        if fd < 0 {
            return None;
        }
        let table = self.fd_contexts.read();
        table.get(fd as usize).cloned()
    }

    /// Grow the slot table. Existing slots never move; the kernel token
    /// of an armed fd stays valid across growth.
    fn resize_contexts(&self, size: usize) {
        let mut table = self.fd_contexts.write();
        for fd in table.len()..size.max(table.len()) {
            table.push(Arc::new(FdContext {
                fd: fd as i32,
                inner: Mutex::new(FdContextInner::default()),
            }));
        }
    }

    fn epoll_update(&self, op: i32, fd: i32, events: u32, token: u64) -> Result<()> {
        let mut ev = libc::epoll_event { events, u64: token };
        let rt = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) };
        if rt != 0 {
            let source = io::Error::last_os_error();
            let op = match op {
                libc::EPOLL_CTL_ADD => "ADD",
                libc::EPOLL_CTL_MOD => "MOD",
                _ => "DEL",
            };
            tracing::error!(epfd = self.epfd, op, fd, events, error = %source, "epoll_ctl failed");
            return Err(RuntimeError::EpollCtl {
                op,
                fd,
                events,
                source,
            });
        }
        Ok(())
    }

    fn tickle_reactor(&self) {
        if !self.scheduler.has_idle_threads() {
            return;
        }
        let rt = unsafe { libc::write(self.tickle_fds[1], b"T".as_ptr() as *const libc::c_void, 1) };
        // A full pipe already guarantees a pending wakeup
        debug_assert!(rt == 1 || os::errno() == libc::EAGAIN);
    }

    /// Body of the idle fiber: the blocking heart of the reactor.
    fn idle_loop(&self) {
        const MAX_EVENTS: usize = 256;
        const MAX_TIMEOUT_MS: u64 = 5000;

        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];

        loop {
            if self.stopping() {
                // The self-pipe edge woke only this worker; pass the
                // shutdown wakeup along to the next one still parked.
                self.tickle_reactor();
                tracing::info!(name = self.name(), "idle stopping exit");
                break;
            }

            let timeout = self.timers.next_timer_ms().min(MAX_TIMEOUT_MS) as i32;
            let ready = loop {
                let rt = unsafe {
                    libc::epoll_wait(self.epfd, events.as_mut_ptr(), MAX_EVENTS as i32, timeout)
                };
                if rt < 0 {
                    if os::errno() == libc::EINTR {
                        continue;
                    }
                    tracing::error!(error = %io::Error::last_os_error(), "epoll_wait failed");
                    break 0;
                }
                break rt as usize;
            };

            for ev in events.iter().take(ready) {
                let ev = *ev;
                if ev.u64 == WAKE_TOKEN {
                    // Drain the self-pipe completely (edge-triggered)
                    let mut buf = [0u8; 256];
                    while unsafe {
                        libc::read(
                            self.tickle_fds[0],
                            buf.as_mut_ptr() as *mut libc::c_void,
                            buf.len(),
                        )
                    } > 0
                    {}
                    continue;
                }

                // Token is the stable address of the armed slot
                let ctx = unsafe { &*(ev.u64 as *const FdContext) };
                let mut inner = ctx.inner.lock();

                let mut revents = ev.events;
                if revents & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0 {
                    // Deliver errors through whatever direction is armed
                    revents |= (libc::EPOLLIN | libc::EPOLLOUT) as u32 & inner.events.epoll_bits();
                }

                let mut real = Event::NONE;
                if revents & libc::EPOLLIN as u32 != 0 {
                    real = real | Event::READ;
                }
                if revents & libc::EPOLLOUT as u32 != 0 {
                    real = real | Event::WRITE;
                }

                let fired = inner.events & real;
                if fired.is_none() {
                    continue;
                }

                // One-shot semantics: re-register only what is still awaited
                let left = inner.events.without(fired);
                let op = if left.is_none() {
                    libc::EPOLL_CTL_DEL
                } else {
                    libc::EPOLL_CTL_MOD
                };
                let bits = libc::EPOLLET as u32 | left.epoll_bits();
                if self.epoll_update(op, ctx.fd, bits, ev.u64).is_err() {
                    continue;
                }

                if fired.contains(Event::READ) {
                    inner.trigger(Event::READ);
                    self.pending_events.fetch_sub(1, Ordering::AcqRel);
                }
                if fired.contains(Event::WRITE) {
                    inner.trigger(Event::WRITE);
                    self.pending_events.fetch_sub(1, Ordering::AcqRel);
                }
            }

            // Expired timers become ordinary scheduled tasks
            let mut cbs: Vec<ExpiredFn> = Vec::new();
            self.timers.list_expired(&mut cbs);
            if !cbs.is_empty() {
                self.scheduler
                    .schedule_batch(cbs.into_iter().map(Task::from_boxed));
            }

            // Let the dispatch loop pick up what was just scheduled
            Fiber::yield_to_hold();
        }
    }
}

impl ReactorHooks for IoManager {
    fn on_thread_start(self: Arc<Self>) {
        CURRENT_IOM.with(|c| *c.borrow_mut() = Some(self));
    }

    fn tickle(&self) {
        self.tickle_reactor();
    }

    fn run_idle(self: Arc<Self>) {
        self.idle_loop();
    }

    fn reactor_stopping(&self) -> bool {
        self.pending_events.load(Ordering::Acquire) == 0 && !self.timers.has_timer()
    }
}

impl Drop for IoManager {
    fn drop(&mut self) {
        if self.scheduler.is_running() {
            self.scheduler.stop();
        }
        unsafe {
            libc::close(self.epfd);
            libc::close(self.tickle_fds[0]);
            libc::close(self.tickle_fds[1]);
        }
    }
}
