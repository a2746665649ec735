//! Recurring callbacks driven by a single polling thread.
//!
//! A [`TimerLoop`] owns every active timer and one thread that wakes once per
//! tick (1 ms by default), fires each timer whose interval has elapsed since
//! its last fire, and drops timers whose repeat budget is spent. Callbacks run
//! on the loop thread itself, so a slow callback delays every other timer on
//! the same loop. Callbacks that need real work should push a
//! [`Task`](crate::task::Task) instead of doing it inline.
//!
//! Repeat counts follow a signed convention: negative repeats forever, zero is
//! inert (rejected by [`Timer::start`]), and `n > 0` fires exactly `n` times.
//!
//! ```rust
//! use mill_server::timer::{Timer, TimerLoop};
//! use std::{sync::atomic::{AtomicUsize, Ordering}, sync::Arc, time::Duration};
//!
//! let timer_loop = TimerLoop::new();
//! timer_loop.start()?;
//!
//! let fired = Arc::new(AtomicUsize::new(0));
//! let counter = fired.clone();
//! let handle = Timer::with_loop(&timer_loop, Duration::from_millis(5), 3)
//!     .start(move || { counter.fetch_add(1, Ordering::SeqCst); })?;
//!
//! while handle.is_active() {
//!     std::thread::sleep(Duration::from_millis(5));
//! }
//! assert_eq!(fired.load(Ordering::SeqCst), 3);
//! # Ok::<(), mill_server::error::TimerError>(())
//! ```

use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, OnceLock, Weak,
    },
    thread::{self, Builder, JoinHandle},
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, trace};

use crate::error::TimerError;

const DEFAULT_TICK: Duration = Duration::from_millis(1);
const EMPTY_WAIT: Duration = Duration::from_millis(100);

static NEXT_TIMER_ID: AtomicU64 = AtomicU64::new(1);
static GLOBAL_LOOP: OnceLock<TimerLoop> = OnceLock::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(pub u64);

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

type Callback = Box<dyn FnMut() + Send>;

struct TimerEntry {
    id: TimerId,
    interval: Duration,
    /// Set on removal; a snapshot may still hold the entry.
    cancelled: AtomicBool,
    state: Mutex<TimerState>,
}

struct TimerState {
    repeats: i64,
    last_fire: Instant,
    callback: Callback,
}

#[derive(Debug, PartialEq, Eq)]
enum Fire {
    Pending,
    Exhausted,
}

impl TimerEntry {
    fn fire_if_due(&self, now: Instant) -> Fire {
        let mut state = self.state.lock();
        if state.repeats == 0 || self.cancelled.load(Ordering::Acquire) {
            return Fire::Exhausted;
        }
        if now.saturating_duration_since(state.last_fire) < self.interval {
            return Fire::Pending;
        }

        (state.callback)();
        state.last_fire = now;

        if state.repeats > 0 {
            state.repeats -= 1;
            if state.repeats == 0 {
                return Fire::Exhausted;
            }
        }
        Fire::Pending
    }
}

struct LoopShared {
    running: AtomicBool,
    timers: Mutex<HashMap<TimerId, Arc<TimerEntry>>>,
    cond: Condvar,
    tick: Duration,
}

impl LoopShared {
    fn insert(&self, entry: Arc<TimerEntry>) {
        let mut timers = self.timers.lock();
        timers.insert(entry.id, entry);
        self.cond.notify_one();
    }

    fn remove(&self, id: TimerId) -> bool {
        match self.timers.lock().remove(&id) {
            Some(entry) => {
                entry.cancelled.store(true, Ordering::Release);
                true
            }
            None => false,
        }
    }

    /// Copies the active set, blocking while it is empty.
    fn snapshot(&self) -> Vec<Arc<TimerEntry>> {
        let mut timers = self.timers.lock();
        while self.running.load(Ordering::Acquire) && timers.is_empty() {
            self.cond.wait_for(&mut timers, EMPTY_WAIT);
        }
        timers.values().cloned().collect()
    }

    fn main_loop(&self) {
        trace!("timer loop running");
        while self.running.load(Ordering::Acquire) {
            let timers = self.snapshot();
            let now = Instant::now();
            for entry in timers {
                if !self.running.load(Ordering::Acquire) {
                    break;
                }
                if entry.fire_if_due(now) == Fire::Exhausted {
                    self.remove(entry.id);
                    trace!(timer = %entry.id, "timer exhausted");
                }
            }
            thread::sleep(self.tick);
        }
        trace!("timer loop exited");
    }
}

/// Owner of a set of timers and the thread that fires them.
pub struct TimerLoop {
    shared: Arc<LoopShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Default for TimerLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerLoop {
    pub fn new() -> Self {
        Self::with_tick(DEFAULT_TICK)
    }

    pub fn with_tick(tick: Duration) -> Self {
        Self {
            shared: Arc::new(LoopShared {
                running: AtomicBool::new(false),
                timers: Mutex::new(HashMap::new()),
                cond: Condvar::new(),
                tick,
            }),
            thread: Mutex::new(None),
        }
    }

    /// The process-wide loop, created and started on first use.
    pub fn global() -> &'static TimerLoop {
        GLOBAL_LOOP.get_or_init(|| {
            let timer_loop = TimerLoop::new();
            if let Err(e) = timer_loop.start() {
                error!(error = %e, "failed to start the global timer loop");
            }
            timer_loop
        })
    }

    /// Spawns the loop thread. Starting a running loop is a no-op.
    pub fn start(&self) -> Result<(), TimerError> {
        let mut thread = self.thread.lock();
        if thread.is_some() {
            return Ok(());
        }

        self.shared.running.store(true, Ordering::Release);
        let shared = Arc::clone(&self.shared);
        let handle = Builder::new()
            .name("timer-loop".to_string())
            .spawn(move || shared.main_loop())
            .map_err(|e| {
                self.shared.running.store(false, Ordering::Release);
                TimerError::Spawn(e)
            })?;
        *thread = Some(handle);
        debug!(tick = ?self.shared.tick, "timer loop started");
        Ok(())
    }

    /// Stops the loop thread, joins it and drops every registered timer.
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::Release);
        {
            let _timers = self.shared.timers.lock();
            self.shared.cond.notify_all();
        }

        if let Some(handle) = self.thread.lock().take() {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                error!("timer loop thread panicked");
            }
        }

        let dropped = {
            let mut timers = self.shared.timers.lock();
            let n = timers.len();
            timers.clear();
            n
        };
        if dropped > 0 {
            debug!(dropped, "timer loop stopped with active timers");
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Number of registered timers.
    pub fn len(&self) -> usize {
        self.shared.timers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registers `timer` on this loop, regardless of the loop it was built for.
    pub fn start_timer<F>(&self, timer: Timer, callback: F) -> Result<TimerHandle, TimerError>
    where
        F: FnMut() + Send + 'static,
    {
        Timer {
            target: Arc::downgrade(&self.shared),
            ..timer
        }
        .start(callback)
    }

    /// Removes a timer. Returns whether it was still registered.
    pub fn close_timer(&self, id: TimerId) -> bool {
        self.shared.remove(id)
    }
}

impl Drop for TimerLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

/// A not-yet-started timer: interval, repeat budget and target loop.
#[derive(Clone)]
pub struct Timer {
    interval: Duration,
    repeats: i64,
    target: Weak<LoopShared>,
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timer")
            .field("interval", &self.interval)
            .field("repeats", &self.repeats)
            .finish()
    }
}

impl Timer {
    /// A timer on the [global](TimerLoop::global) loop.
    pub fn new(interval: Duration, repeats: i64) -> Self {
        Self::with_loop(TimerLoop::global(), interval, repeats)
    }

    pub fn with_loop(timer_loop: &TimerLoop, interval: Duration, repeats: i64) -> Self {
        Self {
            interval,
            repeats,
            target: Arc::downgrade(&timer_loop.shared),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn repeats(&self) -> i64 {
        self.repeats
    }

    /// Registers the timer with its loop. The first fire happens one interval
    /// from now.
    pub fn start<F>(self, callback: F) -> Result<TimerHandle, TimerError>
    where
        F: FnMut() + Send + 'static,
    {
        if self.repeats == 0 {
            return Err(TimerError::Inert);
        }
        let target = self.target.upgrade().ok_or(TimerError::LoopGone)?;

        let id = TimerId(NEXT_TIMER_ID.fetch_add(1, Ordering::Relaxed));
        target.insert(Arc::new(TimerEntry {
            id,
            interval: self.interval,
            cancelled: AtomicBool::new(false),
            state: Mutex::new(TimerState {
                repeats: self.repeats,
                last_fire: Instant::now(),
                callback: Box::new(callback),
            }),
        }));
        trace!(timer = %id, interval = ?self.interval, repeats = self.repeats, "timer started");

        Ok(TimerHandle {
            id,
            target: self.target,
        })
    }
}

/// Handle to a registered timer. Dropping it does not cancel the timer.
#[derive(Clone)]
pub struct TimerHandle {
    id: TimerId,
    target: Weak<LoopShared>,
}

impl fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerHandle")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}

impl TimerHandle {
    pub fn id(&self) -> TimerId {
        self.id
    }

    /// Removes the timer from its loop. Returns whether it was still active.
    ///
    /// A fire the loop has already picked up may still complete; later ticks
    /// skip the timer.
    pub fn cancel(&self) -> bool {
        self.target
            .upgrade()
            .is_some_and(|target| target.remove(self.id))
    }

    pub fn is_active(&self) -> bool {
        self.target
            .upgrade()
            .is_some_and(|target| target.timers.lock().contains_key(&self.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> (Arc<AtomicUsize>, impl FnMut() + Send + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let inner = count.clone();
        (count, move || {
            inner.fetch_add(1, Ordering::SeqCst);
        })
    }

    fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        condition()
    }

    #[test]
    fn test_finite_timer_fires_exactly_n_times() {
        let timer_loop = TimerLoop::new();
        timer_loop.start().unwrap();

        let (count, callback) = counter();
        let handle = Timer::with_loop(&timer_loop, Duration::from_millis(5), 3)
            .start(callback)
            .unwrap();

        assert!(wait_until(Duration::from_secs(2), || !handle.is_active()));
        thread::sleep(Duration::from_millis(50));
        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert!(timer_loop.is_empty());
    }

    #[test]
    fn test_infinite_timer_fires_until_loop_stops() {
        let timer_loop = TimerLoop::new();
        timer_loop.start().unwrap();

        let (count, callback) = counter();
        let handle = Timer::with_loop(&timer_loop, Duration::from_millis(2), -1)
            .start(callback)
            .unwrap();

        assert!(wait_until(Duration::from_secs(2), || count.load(Ordering::SeqCst) >= 10));
        assert!(handle.is_active());

        timer_loop.stop();
        let frozen = count.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(30));
        assert_eq!(count.load(Ordering::SeqCst), frozen);
        assert!(!handle.is_active());
        assert!(!timer_loop.is_running());
    }

    #[test]
    fn test_zero_repeats_is_inert() {
        let timer_loop = TimerLoop::new();
        let result = Timer::with_loop(&timer_loop, Duration::from_millis(1), 0).start(|| {});
        assert!(matches!(result, Err(TimerError::Inert)));
        assert!(timer_loop.is_empty());
    }

    #[test]
    fn test_interval_is_respected() {
        let timer_loop = TimerLoop::new();
        timer_loop.start().unwrap();

        let (count, callback) = counter();
        Timer::with_loop(&timer_loop, Duration::from_millis(200), 1)
            .start(callback)
            .unwrap();

        thread::sleep(Duration::from_millis(50));
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(wait_until(Duration::from_secs(2), || count.load(Ordering::SeqCst) == 1));
    }

    #[test]
    fn test_cancel_stops_firing() {
        let timer_loop = TimerLoop::new();
        timer_loop.start().unwrap();

        let (count, callback) = counter();
        let handle = Timer::with_loop(&timer_loop, Duration::from_millis(2), -1)
            .start(callback)
            .unwrap();
        assert!(wait_until(Duration::from_secs(2), || count.load(Ordering::SeqCst) > 0));

        assert!(handle.cancel());
        assert!(!handle.cancel());
        let frozen = count.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(30));
        // at most one fire that was already in flight
        assert!(count.load(Ordering::SeqCst) <= frozen + 1);
    }

    #[test]
    fn test_cancelled_timer_in_a_taken_snapshot_does_not_fire() {
        let timer_loop = TimerLoop::new();
        let (count, callback) = counter();
        let handle = Timer::with_loop(&timer_loop, Duration::from_millis(1), -1)
            .start(callback)
            .unwrap();

        let snapshot = timer_loop.shared.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert!(handle.cancel());

        let later = Instant::now() + Duration::from_secs(1);
        assert_eq!(snapshot[0].fire_if_due(later), Fire::Exhausted);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_timer_on_dropped_loop() {
        let timer_loop = TimerLoop::new();
        let timer = Timer::with_loop(&timer_loop, Duration::from_millis(1), 1);
        drop(timer_loop);
        assert!(matches!(timer.start(|| {}), Err(TimerError::LoopGone)));
    }

    #[test]
    fn test_timers_registered_before_start_fire_after_start() {
        let timer_loop = TimerLoop::new();
        let (count, callback) = counter();
        let timer = Timer::new(Duration::from_millis(1), 2);
        timer_loop.start_timer(timer, callback).unwrap();
        assert_eq!(timer_loop.len(), 1);

        thread::sleep(Duration::from_millis(20));
        assert_eq!(count.load(Ordering::SeqCst), 0);

        timer_loop.start().unwrap();
        assert!(wait_until(Duration::from_secs(2), || count.load(Ordering::SeqCst) == 2));
    }

    #[test]
    fn test_global_loop_is_shared_and_running() {
        let first = TimerLoop::global() as *const TimerLoop;
        let second = TimerLoop::global() as *const TimerLoop;
        assert_eq!(first, second);
        assert!(TimerLoop::global().is_running());

        let (count, callback) = counter();
        Timer::new(Duration::from_millis(1), 1).start(callback).unwrap();
        assert!(wait_until(Duration::from_secs(2), || count.load(Ordering::SeqCst) == 1));
    }
}
