//! Deadline-ordered timers
//!
//! Timers live in a set ordered by `(absolute deadline ms, timer id)`; the
//! id tiebreak keeps distinct timers with equal deadlines apart and makes
//! equal-deadline firing order insertion-deterministic. Deadlines are
//! wall-clock: a clock yanked backwards by more than an hour is treated as
//! a rollover and fires everything rather than stranding timers.
//!
//! The reactor installs a wake closure so an insert that becomes the new
//! earliest deadline can shorten an in-flight multiplexer wait.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::{Mutex, RwLock};

use strand_core::os::current_ms;

/// Backwards wall-clock jump treated as a rollover (one hour)
const ROLLOVER_WINDOW_MS: u64 = 60 * 60 * 1000;

static NEXT_TIMER_ID: AtomicU64 = AtomicU64::new(1);

type TimerFn = Arc<dyn Fn() + Send + Sync>;

/// Expired-callback handed to the scheduler
pub type ExpiredFn = Box<dyn FnOnce() + Send>;

struct TimerState {
    /// Period in ms
    ms: u64,
    /// Absolute deadline in wall-clock ms
    next: u64,
    recurring: bool,
    /// Cleared on cancel and on one-shot expiry; doubles as the
    /// "still pending" flag
    cb: Option<TimerFn>,
}

/// A timer handle.
///
/// Owned jointly by the [`TimerManager`] (until expiry or cancel) and by
/// whoever kept the handle returned from `add_timer`.
pub struct Timer {
    id: u64,
    manager: Weak<TimerShared>,
    state: Mutex<TimerState>,
}

impl Timer {
    /// Cancel the timer.
    ///
    /// Clearing the callback both prevents the fire and breaks any
    /// reference cycle running through the closure. Cancelling an
    /// already-expired (or already-cancelled) timer is a no-op returning
    /// false.
    pub fn cancel(&self) -> bool {
        let Some(shared) = self.manager.upgrade() else {
            return false;
        };
        let mut set = shared.inner.write();
        let mut st = self.state.lock();
        if st.cb.is_none() {
            return false;
        }
        st.cb = None;
        set.timers.remove(&(st.next, self.id));
        true
    }

    /// Push the deadline out by one full period from now
    pub fn refresh(&self) -> bool {
        let Some(shared) = self.manager.upgrade() else {
            return false;
        };
        let mut set = shared.inner.write();
        let mut st = self.state.lock();
        if st.cb.is_none() {
            return false;
        }
        // Reposition: the key embeds the deadline
        let Some(this) = set.timers.remove(&(st.next, self.id)) else {
            return false;
        };
        st.next = current_ms() + st.ms;
        set.timers.insert((st.next, self.id), this);
        true
    }

    /// Change the period and recompute the deadline.
    ///
    /// With `from_now` false the new deadline is measured from the timer's
    /// original start, so an unchanged period is a no-op.
    pub fn reset(&self, ms: u64, from_now: bool) -> bool {
        let Some(shared) = self.manager.upgrade() else {
            return false;
        };
        let mut set = shared.inner.write();
        let mut st = self.state.lock();
        if ms == st.ms && !from_now {
            return true;
        }
        if st.cb.is_none() {
            return false;
        }
        let Some(this) = set.timers.remove(&(st.next, self.id)) else {
            return false;
        };

        let start = if from_now {
            current_ms()
        } else {
            st.next - st.ms
        };
        st.ms = ms;
        st.next = start + ms;
        let at_front = TimerShared::insert_locked(&mut set, (st.next, self.id), this);
        drop(st);
        drop(set);
        if at_front {
            shared.notify();
        }
        true
    }

    /// Stable unique identity; the ordering tiebreak
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }
}

struct TimerSet {
    timers: BTreeMap<(u64, u64), Arc<Timer>>,
    /// Last wall clock observed by an expiry sweep; rollover baseline
    previous_time: u64,
}

struct TimerShared {
    inner: RwLock<TimerSet>,
    /// Invoked when an insert becomes the new earliest deadline
    wake: OnceLock<Box<dyn Fn() + Send + Sync>>,
}

impl TimerShared {
    fn notify(&self) {
        if let Some(wake) = self.wake.get() {
            wake();
        }
    }

    /// Insert under the write lock; true when the entry landed at the front
    fn insert_locked(set: &mut TimerSet, key: (u64, u64), timer: Arc<Timer>) -> bool {
        set.timers.insert(key, timer);
        set.timers.keys().next() == Some(&key)
    }
}

/// Deadline-ordered timer set
pub struct TimerManager {
    shared: Arc<TimerShared>,
}

impl TimerManager {
    pub fn new() -> TimerManager {
        TimerManager {
            shared: Arc::new(TimerShared {
                inner: RwLock::new(TimerSet {
                    timers: BTreeMap::new(),
                    previous_time: current_ms(),
                }),
                wake: OnceLock::new(),
            }),
        }
    }

    /// Install the front-insert wake callback. Called once by the reactor.
    pub(crate) fn set_wake(&self, wake: Box<dyn Fn() + Send + Sync>) {
        if self.shared.wake.set(wake).is_err() {
            panic!("timer wake callback already installed");
        }
    }

    /// Add a timer firing `ms` milliseconds from now
    pub fn add_timer(
        &self,
        ms: u64,
        cb: impl Fn() + Send + Sync + 'static,
        recurring: bool,
    ) -> Arc<Timer> {
        let id = NEXT_TIMER_ID.fetch_add(1, Ordering::Relaxed);
        let next = current_ms() + ms;
        let timer = Arc::new(Timer {
            id,
            manager: Arc::downgrade(&self.shared),
            state: Mutex::new(TimerState {
                ms,
                next,
                recurring,
                cb: Some(Arc::new(cb)),
            }),
        });

        let at_front = {
            let mut set = self.shared.inner.write();
            TimerShared::insert_locked(&mut set, (next, id), timer.clone())
        };
        if at_front {
            self.shared.notify();
        }
        timer
    }

    /// Add a timer whose callback only runs while `cond` is still alive
    pub fn add_condition_timer<T: Send + Sync + 'static>(
        &self,
        ms: u64,
        cb: impl Fn() + Send + Sync + 'static,
        cond: Weak<T>,
        recurring: bool,
    ) -> Arc<Timer> {
        self.add_timer(
            ms,
            move || {
                if cond.upgrade().is_some() {
                    cb();
                }
            },
            recurring,
        )
    }

    /// Milliseconds until the earliest deadline: 0 when already due,
    /// `u64::MAX` when the set is empty.
    pub fn next_timer_ms(&self) -> u64 {
        let set = self.shared.inner.read();
        let Some((&(next, _), _)) = set.timers.iter().next() else {
            return u64::MAX;
        };
        let now = current_ms();
        if now >= next {
            0
        } else {
            next - now
        }
    }

    pub fn has_timer(&self) -> bool {
        !self.shared.inner.read().timers.is_empty()
    }

    /// Extract every expired callback.
    ///
    /// Recurring timers are advanced to `now + period` and reinserted;
    /// one-shot callbacks are cleared so the handle cannot fire again.
    pub fn list_expired(&self, cbs: &mut Vec<ExpiredFn>) {
        let now = current_ms();
        {
            let set = self.shared.inner.read();
            if set.timers.is_empty() {
                return;
            }
        }

        let mut set = self.shared.inner.write();
        if set.timers.is_empty() {
            return;
        }

        let rollover = now < set.previous_time && now + ROLLOVER_WINDOW_MS < set.previous_time;
        set.previous_time = now;
        if rollover {
            tracing::warn!("wall clock jumped backwards; expiring all timers");
        } else if set.timers.keys().next().map_or(true, |&(next, _)| next > now) {
            return;
        }

        // Everything with deadline <= now; on rollover, everything
        let expired = if rollover {
            std::mem::take(&mut set.timers)
        } else {
            let rest = set.timers.split_off(&(now + 1, 0));
            std::mem::replace(&mut set.timers, rest)
        };

        cbs.reserve(expired.len());
        for (_, timer) in expired {
            let mut st = timer.state.lock();
            let Some(cb) = st.cb.clone() else {
                continue;
            };
            if st.recurring {
                st.next = now + st.ms;
                let key = (st.next, timer.id);
                drop(st);
                set.timers.insert(key, timer.clone());
            } else {
                st.cb = None;
            }
            cbs.push(Box::new(move || cb()));
        }
    }

    #[cfg(test)]
    fn force_previous_time(&self, t: u64) {
        self.shared.inner.write().previous_time = t;
    }

    #[cfg(test)]
    fn deadlines(&self) -> Vec<u64> {
        self.shared
            .inner
            .read()
            .timers
            .keys()
            .map(|&(next, _)| next)
            .collect()
    }
}

impl Default for TimerManager {
    fn default() -> Self {
        TimerManager::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_ordering_by_deadline() {
        let mgr = TimerManager::new();
        mgr.add_timer(300, || {}, false);
        mgr.add_timer(100, || {}, false);
        mgr.add_timer(200, || {}, false);

        let deadlines = mgr.deadlines();
        let mut sorted = deadlines.clone();
        sorted.sort_unstable();
        assert_eq!(deadlines, sorted);
    }

    #[test]
    fn test_equal_deadlines_coexist() {
        let mgr = TimerManager::new();
        // Same period added back to back: deadlines may collide, ids never do
        let a = mgr.add_timer(5000, || {}, false);
        let b = mgr.add_timer(5000, || {}, false);
        assert_ne!(a.id(), b.id());
        assert_eq!(mgr.deadlines().len(), 2);
    }

    #[test]
    fn test_next_timer_ms() {
        let mgr = TimerManager::new();
        assert_eq!(mgr.next_timer_ms(), u64::MAX);

        mgr.add_timer(10_000, || {}, false);
        let next = mgr.next_timer_ms();
        assert!(next > 8_000 && next <= 10_000);

        mgr.add_timer(0, || {}, false);
        assert_eq!(mgr.next_timer_ms(), 0);
    }

    #[test]
    fn test_expiry_and_oneshot_clear() {
        let mgr = TimerManager::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let timer = mgr.add_timer(0, move || { f.fetch_add(1, Ordering::SeqCst); }, false);

        std::thread::sleep(std::time::Duration::from_millis(2));
        let mut cbs = Vec::new();
        mgr.list_expired(&mut cbs);
        assert_eq!(cbs.len(), 1);
        for cb in cbs {
            cb();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!mgr.has_timer());

        // One-shot already fired: cancel is a no-op
        assert!(!timer.cancel());
    }

    #[test]
    fn test_cancel_prevents_fire() {
        let mgr = TimerManager::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let timer = mgr.add_timer(0, move || { f.fetch_add(1, Ordering::SeqCst); }, false);

        assert!(timer.cancel());
        assert!(!timer.cancel());

        std::thread::sleep(std::time::Duration::from_millis(2));
        let mut cbs = Vec::new();
        mgr.list_expired(&mut cbs);
        assert!(cbs.is_empty());
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_recurring_reinserts() {
        let mgr = TimerManager::new();
        let timer = mgr.add_timer(0, || {}, true);

        std::thread::sleep(std::time::Duration::from_millis(2));
        let mut cbs = Vec::new();
        mgr.list_expired(&mut cbs);
        assert_eq!(cbs.len(), 1);
        assert!(mgr.has_timer(), "recurring timer must reinsert itself");

        assert!(timer.cancel());
        assert!(!mgr.has_timer());
    }

    #[test]
    fn test_reset_same_period_is_noop() {
        let mgr = TimerManager::new();
        let timer = mgr.add_timer(5000, || {}, false);
        let before = mgr.deadlines();
        assert!(timer.reset(5000, false));
        assert_eq!(mgr.deadlines(), before);
    }

    #[test]
    fn test_reset_from_now_moves_deadline() {
        let mgr = TimerManager::new();
        let timer = mgr.add_timer(10_000, || {}, false);
        assert!(timer.reset(20_000, true));
        let next = mgr.next_timer_ms();
        assert!(next > 15_000 && next <= 20_000);
    }

    #[test]
    fn test_refresh_extends() {
        let mgr = TimerManager::new();
        let timer = mgr.add_timer(1000, || {}, false);
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(timer.refresh());
        let next = mgr.next_timer_ms();
        assert!(next > 990);
    }

    #[test]
    fn test_condition_timer_gated_by_guard() {
        let mgr = TimerManager::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let guard = Arc::new(0u32);
        let f = fired.clone();
        mgr.add_condition_timer(
            0,
            move || { f.fetch_add(1, Ordering::SeqCst); },
            Arc::downgrade(&guard),
            false,
        );
        drop(guard); // guard dies before the fire

        std::thread::sleep(std::time::Duration::from_millis(2));
        let mut cbs = Vec::new();
        mgr.list_expired(&mut cbs);
        for cb in cbs {
            cb();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_clock_rollover_fires_everything() {
        let mgr = TimerManager::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        mgr.add_timer(10_000, move || { f.fetch_add(1, Ordering::SeqCst); }, false);

        // Pretend the last sweep saw a clock two hours ahead of now
        mgr.force_previous_time(current_ms() + 2 * 60 * 60 * 1000);

        let mut cbs = Vec::new();
        mgr.list_expired(&mut cbs);
        assert_eq!(cbs.len(), 1, "rollover must expire outstanding timers");
        for cb in cbs {
            cb();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
