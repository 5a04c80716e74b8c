use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError, Weak};
use std::time::Duration;

/// One-shot, zero-delay timer bound to a compositor run loop.
///
/// Starting an already started timer does nothing: the callback still fires once.
pub trait OneShotTimer: Send + Sync {
    /// Arm the timer to fire on the next run-loop iteration.
    fn start_one_shot(&self);
    /// Disarm the timer. A stopped timer does not fire.
    fn stop(&self);
    /// Whether the timer is armed.
    fn is_active(&self) -> bool;
}

/// The compositor's scheduling primitive.
pub trait RunLoop: Send + Sync {
    /// Create a timer whose callback runs on the run loop's thread.
    fn create_timer(&self, callback: Box<dyn Fn() + Send + Sync>) -> Box<dyn OneShotTimer>;
}

struct TimerEntry {
    active: AtomicBool,
    callback: Box<dyn Fn() + Send + Sync>,
}

#[derive(Default)]
struct LoopShared {
    timers: Mutex<Vec<Weak<TimerEntry>>>,
    wake: Mutex<u64>,
    wake_cv: Condvar,
}

impl LoopShared {
    fn armed(&self) -> Vec<Arc<TimerEntry>> {
        let mut timers = self.timers.lock().unwrap_or_else(PoisonError::into_inner);
        timers.retain(|t| t.strong_count() > 0);
        timers
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|t| t.active.load(Ordering::Acquire))
            .collect()
    }

    fn wake(&self) {
        let mut gen_ = self.wake.lock().unwrap_or_else(PoisonError::into_inner);
        *gen_ = gen_.wrapping_add(1);
        self.wake_cv.notify_all();
    }
}

/// Deterministic run loop driven explicitly by its owner.
///
/// Nothing fires until [`ManualRunLoop::run_pending`] is called, which makes it a single-step
/// scheduler for tests. A compositor thread can also block in [`ManualRunLoop::wait_for_work`]
/// instead of polling.
#[derive(Clone, Default)]
pub struct ManualRunLoop {
    shared: Arc<LoopShared>,
}

impl ManualRunLoop {
    /// Create a run loop with no timers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire every armed timer once, in creation order. Returns how many fired.
    ///
    /// Timers re-armed by a callback fire on the next call.
    pub fn run_pending(&self) -> usize {
        let mut fired = 0;
        for timer in self.shared.armed() {
            if timer.active.swap(false, Ordering::AcqRel) {
                (timer.callback)();
                fired += 1;
            }
        }
        fired
    }

    /// Number of armed timers.
    pub fn pending(&self) -> usize {
        self.shared.armed().len()
    }

    /// Block until a timer is armed or `timeout` elapses. Returns `true` if work is pending.
    pub fn wait_for_work(&self, timeout: Duration) -> bool {
        let guard = self
            .shared
            .wake
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let (_guard, _res) = self
            .shared
            .wake_cv
            .wait_timeout_while(guard, timeout, |_| self.shared.armed().is_empty())
            .unwrap_or_else(PoisonError::into_inner);
        !self.shared.armed().is_empty()
    }
}

impl fmt::Debug for ManualRunLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualRunLoop")
            .field("pending", &self.pending())
            .finish_non_exhaustive()
    }
}

struct ManualTimer {
    entry: Arc<TimerEntry>,
    shared: Weak<LoopShared>,
}

impl OneShotTimer for ManualTimer {
    fn start_one_shot(&self) {
        self.entry.active.store(true, Ordering::Release);
        if let Some(shared) = self.shared.upgrade() {
            shared.wake();
        }
    }

    fn stop(&self) {
        self.entry.active.store(false, Ordering::Release);
    }

    fn is_active(&self) -> bool {
        self.entry.active.load(Ordering::Acquire)
    }
}

impl RunLoop for ManualRunLoop {
    fn create_timer(&self, callback: Box<dyn Fn() + Send + Sync>) -> Box<dyn OneShotTimer> {
        let entry = Arc::new(TimerEntry {
            active: AtomicBool::new(false),
            callback,
        });
        self.shared
            .timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::downgrade(&entry));
        Box::new(ManualTimer {
            entry,
            shared: Arc::downgrade(&self.shared),
        })
    }
}
