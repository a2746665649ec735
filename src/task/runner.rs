use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    thread::{self, Builder, JoinHandle},
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, trace, warn};

use super::{
    policy::{Hysteresis, PoolSample, ScaleAction},
    BoxedTask, ScalingPolicy, Task, TaskQueue,
};
use crate::error::TaskError;

/// Elastic pool of threads executing [`Task`]s off the I/O loops.
///
/// The pool starts `min_workers` threads. An optional monitor thread samples
/// the pool once per [`ScalingPolicy::monitor_interval`]: when every worker is
/// busy it adds one (bounded by [`ScalingPolicy::max_workers`]); after the pool
/// has been quiet for [`ScalingPolicy::idle_threshold`] it stops idle workers
/// until only `min_workers` remain.
///
/// ## Example
///
/// ```rust
/// use mill_server::task::TaskRunner;
/// use std::sync::mpsc;
///
/// let runner = TaskRunner::new(8);
/// runner.start(2, true)?;
///
/// let (tx, rx) = mpsc::channel();
/// runner.push(move || tx.send(21 * 2).unwrap())?;
/// assert_eq!(rx.recv().unwrap(), 42);
///
/// runner.stop(true);
/// # Ok::<(), mill_server::error::TaskError>(())
/// ```
pub struct TaskRunner {
    inner: Arc<RunnerInner>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

struct RunnerInner {
    policy: ScalingPolicy,
    min_workers: AtomicUsize,
    stopped: AtomicBool,
    draining: AtomicBool,
    queue: TaskQueue,
    workers: Mutex<Vec<PoolWorker>>,
    next_worker_id: AtomicUsize,
    monitor_stop: Mutex<bool>,
    monitor_cond: Condvar,
}

struct PoolWorker {
    id: usize,
    state: Arc<WorkerState>,
    thread: Option<JoinHandle<()>>,
}

/// Busy/stopping flags of one pool thread, read by the monitor.
#[derive(Default)]
struct WorkerState {
    busy: AtomicBool,
    busy_since: Mutex<Option<Instant>>,
    stopping: AtomicBool,
}

impl WorkerState {
    fn set_busy(&self) {
        *self.busy_since.lock() = Some(Instant::now());
        self.busy.store(true, Ordering::Release);
    }

    fn set_idle(&self) {
        self.busy.store(false, Ordering::Release);
        *self.busy_since.lock() = None;
    }

    fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Contiguous time spent on the current task.
    fn busy_time(&self) -> Duration {
        self.busy_since
            .lock()
            .map_or(Duration::ZERO, |since| since.elapsed())
    }

    fn stop(&self) {
        self.stopping.store(true, Ordering::Release);
    }

    fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }
}

impl PoolWorker {
    fn join(mut self) {
        if let Some(thread) = self.thread.take() {
            join_unless_current(thread, &format!("pool worker {}", self.id));
        }
    }
}

impl Default for TaskRunner {
    fn default() -> Self {
        Self::with_policy(ScalingPolicy::default())
    }
}

impl TaskRunner {
    /// Creates a stopped runner allowed to grow to `max_workers` threads.
    pub fn new(max_workers: usize) -> Self {
        Self::with_policy(ScalingPolicy::default().with_max_workers(max_workers))
    }

    pub fn with_policy(policy: ScalingPolicy) -> Self {
        let max_workers = policy.max_workers.max(1);
        let queue = TaskQueue::new();
        queue.close();
        Self {
            inner: Arc::new(RunnerInner {
                policy: ScalingPolicy {
                    max_workers,
                    ..policy
                },
                min_workers: AtomicUsize::new(0),
                stopped: AtomicBool::new(true),
                draining: AtomicBool::new(false),
                queue,
                workers: Mutex::new(Vec::with_capacity(max_workers)),
                next_worker_id: AtomicUsize::new(0),
                monitor_stop: Mutex::new(false),
                monitor_cond: Condvar::new(),
            }),
            monitor: Mutex::new(None),
        }
    }

    /// Starts `min_workers` pool threads and, with `monitor`, the thread that
    /// grows and shrinks the pool.
    pub fn start(&self, min_workers: usize, monitor: bool) -> Result<(), TaskError> {
        if self
            .inner
            .stopped
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(TaskError::AlreadyRunning);
        }

        let min_workers = min_workers.min(self.inner.policy.max_workers);
        self.inner.draining.store(false, Ordering::Release);
        self.inner.min_workers.store(min_workers, Ordering::Release);
        self.inner.queue.reopen();
        *self.inner.monitor_stop.lock() = false;

        for _ in 0..min_workers {
            if let Err(e) = self.inner.spawn_worker() {
                self.stop(false);
                return Err(e);
            }
        }

        if monitor {
            let inner = Arc::clone(&self.inner);
            let thread = Builder::new()
                .name(format!("{}-monitor", self.inner.policy.thread_name_prefix))
                .spawn(move || inner.monitor_loop())
                .map_err(|e| {
                    self.stop(false);
                    TaskError::Spawn(e)
                })?;
            *self.monitor.lock() = Some(thread);
        }

        info!(
            min_workers,
            max_workers = self.inner.policy.max_workers,
            monitor,
            "task runner started"
        );
        Ok(())
    }

    /// Queues a task. Returns the queue depth after the push.
    ///
    /// Rejected with [`TaskError::Stopped`] once `stop` has been called and with
    /// [`TaskError::QueueFull`] when the policy bounds the queue.
    pub fn push<T: Task>(&self, task: T) -> Result<usize, TaskError> {
        self.push_boxed(Box::new(task))
    }

    /// A push that returns `Ok` is either run or, after a hard stop, counted
    /// among the discarded tasks.
    pub fn push_boxed(&self, task: BoxedTask) -> Result<usize, TaskError> {
        if self.inner.stopped.load(Ordering::Acquire) {
            return Err(TaskError::Stopped);
        }
        self.inner
            .queue
            .push_and_signal(task, self.inner.policy.queue_capacity)
    }

    /// Stops the pool and joins its threads.
    ///
    /// With `graceful`, tasks already running finish and every task still
    /// queued runs to completion before this returns. Without it, running
    /// tasks finish and the queued ones are discarded.
    pub fn stop(&self, graceful: bool) {
        if graceful {
            self.inner.draining.store(true, Ordering::Release);
        }
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.queue.close();

        {
            *self.inner.monitor_stop.lock() = true;
            self.inner.monitor_cond.notify_all();
        }
        if let Some(monitor) = self.monitor.lock().take() {
            join_unless_current(monitor, "task runner monitor");
        }

        let workers: Vec<PoolWorker> = std::mem::take(&mut *self.inner.workers.lock());
        for worker in &workers {
            worker.state.stop();
        }
        self.inner.queue.signal(true);
        for worker in workers {
            worker.join();
        }

        if self.inner.draining.load(Ordering::Acquire) {
            let leftover = self.inner.queue.drain(None);
            debug!(count = leftover.len(), "running leftover tasks on stop");
            for task in leftover {
                run_task(task, usize::MAX);
            }
        } else {
            let discarded = self.inner.queue.clear();
            if discarded > 0 {
                debug!(discarded, "discarded queued tasks on stop");
            }
        }
        info!(graceful, "task runner stopped");
    }

    pub fn is_running(&self) -> bool {
        !self.inner.stopped.load(Ordering::Acquire)
    }

    pub fn worker_count(&self) -> usize {
        self.inner.workers.lock().len()
    }

    pub fn busy_workers(&self) -> usize {
        self.inner
            .workers
            .lock()
            .iter()
            .filter(|w| w.state.is_busy())
            .count()
    }

    /// Longest contiguous busy time among the pool threads.
    pub fn longest_busy_time(&self) -> Duration {
        self.inner
            .workers
            .lock()
            .iter()
            .map(|w| w.state.busy_time())
            .max()
            .unwrap_or(Duration::ZERO)
    }

    pub fn queued(&self) -> usize {
        self.inner.queue.len()
    }

    pub fn min_workers(&self) -> usize {
        self.inner.min_workers.load(Ordering::Acquire)
    }

    pub fn policy(&self) -> &ScalingPolicy {
        &self.inner.policy
    }
}

impl Drop for TaskRunner {
    fn drop(&mut self) {
        self.stop(false);
    }
}

impl RunnerInner {
    /// Adds one pool thread unless the pool is already at its maximum.
    fn spawn_worker(self: &Arc<Self>) -> Result<bool, TaskError> {
        let mut workers = self.workers.lock();
        if workers.len() >= self.policy.max_workers {
            return Ok(false);
        }

        let id = self.next_worker_id.fetch_add(1, Ordering::Relaxed);
        let state = Arc::new(WorkerState::default());
        let inner = Arc::clone(self);
        let thread_state = Arc::clone(&state);
        let thread = Builder::new()
            .name(format!("{}-{id}", self.policy.thread_name_prefix))
            .spawn(move || inner.worker_loop(id, thread_state))
            .map_err(TaskError::Spawn)?;

        workers.push(PoolWorker {
            id,
            state,
            thread: Some(thread),
        });
        trace!(worker = id, total = workers.len(), "pool worker spawned");
        Ok(true)
    }

    fn worker_loop(&self, id: usize, state: Arc<WorkerState>) {
        while !self.stopped.load(Ordering::Acquire) && !state.is_stopping() {
            let Some(task) = self.queue.pop_timeout(self.policy.pop_timeout) else {
                continue;
            };
            if self.stopped.load(Ordering::Acquire) && !self.draining.load(Ordering::Acquire) {
                // popped after a hard stop; the task is discarded with the rest
                break;
            }
            state.set_busy();
            run_task(task, id);
            state.set_idle();
        }

        if self.draining.load(Ordering::Acquire) {
            for task in self.queue.drain(None) {
                run_task(task, id);
            }
        }
        trace!(worker = id, "pool worker exiting");
    }

    fn monitor_loop(self: Arc<Self>) {
        let mut hysteresis = Hysteresis::default();
        while !self.park_monitor() {
            let sample = self.sample();
            match hysteresis.observe(&self.policy, sample, Instant::now()) {
                ScaleAction::Grow => match self.spawn_worker() {
                    Ok(true) => debug!(total = sample.total + 1, "pool saturated, worker added"),
                    Ok(false) => {}
                    Err(e) => warn!(error = %e, "failed to grow task runner"),
                },
                ScaleAction::Shrink(excess) => self.retire_idle(excess),
                ScaleAction::Hold => {}
            }
        }
    }

    /// Sleeps one monitor tick. Returns `true` once the runner is stopping.
    fn park_monitor(&self) -> bool {
        let mut stop = self.monitor_stop.lock();
        if !*stop {
            self.monitor_cond
                .wait_for(&mut stop, self.policy.monitor_interval);
        }
        *stop
    }

    fn sample(&self) -> PoolSample {
        let workers = self.workers.lock();
        PoolSample {
            total: workers.len(),
            busy: workers.iter().filter(|w| w.state.is_busy()).count(),
            min: self.min_workers.load(Ordering::Acquire),
            queued: self.queue.len(),
        }
    }

    /// Stops and joins up to `excess` idle workers, in order, never going
    /// below the floor.
    fn retire_idle(&self, excess: usize) {
        let retired: Vec<PoolWorker> = {
            let mut workers = self.workers.lock();
            let excess = excess.min(
                workers
                    .len()
                    .saturating_sub(self.min_workers.load(Ordering::Acquire)),
            );
            let mut retired = Vec::with_capacity(excess);
            let mut i = 0;
            while i < workers.len() && retired.len() < excess {
                if workers[i].state.is_busy() {
                    i += 1;
                } else {
                    let worker = workers.remove(i);
                    worker.state.stop();
                    retired.push(worker);
                }
            }
            retired
        };
        if retired.is_empty() {
            return;
        }

        self.queue.signal(true);
        let count = retired.len();
        for worker in retired {
            worker.join();
        }
        debug!(retired = count, "pool idle, workers retired");
    }
}

fn run_task(task: BoxedTask, worker: usize) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(move || task.run())) {
        error!(worker, panic = panic_message(&*payload), "task panicked");
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

fn join_unless_current(handle: JoinHandle<()>, what: &str) {
    if handle.thread().id() == thread::current().id() {
        // stopping from inside the pool; the thread exits on its own
        return;
    }
    if handle.join().is_err() {
        error!("{what} panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{atomic::AtomicUsize, mpsc, Barrier};

    fn fast_policy() -> ScalingPolicy {
        ScalingPolicy::default()
            .with_monitor_interval(Duration::from_millis(20))
            .with_idle_threshold(Duration::from_millis(200))
            .with_pop_timeout(Duration::from_millis(20))
    }

    fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    #[test]
    fn test_runner_executes_tasks() {
        let runner = TaskRunner::with_policy(fast_policy());
        runner.start(2, false).unwrap();
        assert_eq!(runner.worker_count(), 2);

        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let counter = counter.clone();
            runner
                .push(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }

        assert!(wait_until(Duration::from_secs(2), || counter.load(Ordering::SeqCst) == 10));
        runner.stop(false);
    }

    #[test]
    fn test_push_rejected_when_not_running() {
        let runner = TaskRunner::new(4);
        assert!(matches!(runner.push(|| {}), Err(TaskError::Stopped)));

        runner.start(1, false).unwrap();
        assert!(runner.push(|| {}).is_ok());
        runner.stop(false);
        assert!(matches!(runner.push(|| {}), Err(TaskError::Stopped)));
    }

    #[test]
    fn test_double_start_is_rejected() {
        let runner = TaskRunner::new(4);
        runner.start(1, false).unwrap();
        assert!(matches!(runner.start(1, false), Err(TaskError::AlreadyRunning)));
        runner.stop(false);
    }

    #[test]
    fn test_graceful_stop_runs_every_queued_task() {
        let runner = TaskRunner::with_policy(fast_policy());
        runner.start(1, false).unwrap();

        let gate = Arc::new(Barrier::new(2));
        {
            let gate = gate.clone();
            runner.push(move || {
                gate.wait();
                thread::sleep(Duration::from_millis(50));
            })
            .unwrap();
        }
        gate.wait();

        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..20 {
            let counter = counter.clone();
            runner
                .push(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }

        runner.stop(true);
        assert_eq!(counter.load(Ordering::SeqCst), 20);
        assert_eq!(runner.queued(), 0);
    }

    #[test]
    fn test_push_racing_graceful_stop_never_loses_accepted_tasks() {
        for _ in 0..100 {
            let runner = Arc::new(TaskRunner::with_policy(fast_policy()));
            runner.start(2, false).unwrap();

            let accepted = Arc::new(AtomicUsize::new(0));
            let executed = Arc::new(AtomicUsize::new(0));
            let pushers: Vec<_> = (0..4)
                .map(|_| {
                    let runner = runner.clone();
                    let accepted = accepted.clone();
                    let executed = executed.clone();
                    thread::spawn(move || loop {
                        let executed = executed.clone();
                        let pushed = runner.push(move || {
                            executed.fetch_add(1, Ordering::SeqCst);
                        });
                        match pushed {
                            Ok(_) => accepted.fetch_add(1, Ordering::SeqCst),
                            Err(TaskError::Stopped) => break,
                            Err(e) => panic!("unexpected push error: {e}"),
                        };
                    })
                })
                .collect();

            thread::sleep(Duration::from_micros(300));
            runner.stop(true);
            for pusher in pushers {
                pusher.join().unwrap();
            }

            assert_eq!(
                accepted.load(Ordering::SeqCst),
                executed.load(Ordering::SeqCst)
            );
            assert_eq!(runner.queued(), 0);
        }
    }

    #[test]
    fn test_hard_stop_leaves_nothing_for_next_start() {
        let runner = TaskRunner::with_policy(fast_policy());
        runner.start(0, false).unwrap();

        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let counter = counter.clone();
            runner
                .push(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }
        runner.stop(false);
        assert!(matches!(runner.push(|| {}), Err(TaskError::Stopped)));

        runner.start(1, false).unwrap();
        thread::sleep(Duration::from_millis(100));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        runner.stop(true);
    }

    #[test]
    fn test_hard_stop_discards_queue() {
        let runner = TaskRunner::with_policy(fast_policy());
        runner.start(1, false).unwrap();

        let gate = Arc::new(Barrier::new(2));
        {
            let gate = gate.clone();
            runner.push(move || {
                gate.wait();
                thread::sleep(Duration::from_millis(50));
            })
            .unwrap();
        }
        gate.wait();

        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..20 {
            let counter = counter.clone();
            runner
                .push(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }

        runner.stop(false);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert_eq!(runner.queued(), 0);
        assert_eq!(runner.worker_count(), 0);
    }

    #[test]
    fn test_bounded_queue_rejects() {
        let runner = TaskRunner::with_policy(fast_policy().with_queue_capacity(Some(1)));
        runner.start(0, false).unwrap();

        assert_eq!(runner.push(|| {}).unwrap(), 1);
        assert!(matches!(
            runner.push(|| {}),
            Err(TaskError::QueueFull { capacity: 1 })
        ));
        runner.stop(false);
    }

    #[test]
    fn test_monitor_grows_to_max_and_no_further() {
        let runner = TaskRunner::with_policy(fast_policy().with_max_workers(4));
        runner.start(1, true).unwrap();

        let (release_tx, release_rx) = mpsc::channel::<()>();
        let release_rx = Arc::new(parking_lot::Mutex::new(release_rx));
        for _ in 0..8 {
            let release_rx = release_rx.clone();
            runner
                .push(move || {
                    let _ = release_rx.lock().recv_timeout(Duration::from_secs(5));
                })
                .unwrap();
        }

        assert!(wait_until(Duration::from_secs(3), || runner.worker_count() == 4));
        thread::sleep(Duration::from_millis(100));
        assert_eq!(runner.worker_count(), 4);
        assert!(runner.longest_busy_time() > Duration::ZERO);

        drop(release_tx);
        runner.stop(false);
    }

    #[test]
    fn test_monitor_shrinks_back_to_floor() {
        let runner = TaskRunner::with_policy(fast_policy().with_max_workers(5));
        runner.start(2, true).unwrap();

        let gate = Arc::new(Barrier::new(6));
        for _ in 0..5 {
            let gate = gate.clone();
            runner.push(move || {
                gate.wait();
            })
            .unwrap();
        }

        // all five tasks block on the barrier until the pool reached five threads
        assert!(wait_until(Duration::from_secs(3), || runner.worker_count() == 5));
        gate.wait();

        assert!(wait_until(Duration::from_secs(3), || runner.worker_count() == 2));
        thread::sleep(Duration::from_millis(300));
        assert_eq!(runner.worker_count(), 2);
        runner.stop(false);
    }

    #[test]
    fn test_panicking_task_does_not_kill_worker() {
        let runner = TaskRunner::with_policy(fast_policy());
        runner.start(1, false).unwrap();

        runner.push(|| panic!("boom")).unwrap();
        let (tx, rx) = mpsc::channel();
        runner.push(move || tx.send(()).unwrap()).unwrap();

        assert!(rx.recv_timeout(Duration::from_secs(2)).is_ok());
        assert_eq!(runner.worker_count(), 1);
        runner.stop(false);
    }

    #[test]
    fn test_stop_from_inside_a_task() {
        let runner = Arc::new(TaskRunner::with_policy(fast_policy()));
        runner.start(1, false).unwrap();

        let (tx, rx) = mpsc::channel();
        let inside = runner.clone();
        runner
            .push(move || {
                inside.stop(false);
                tx.send(()).unwrap();
            })
            .unwrap();

        assert!(rx.recv_timeout(Duration::from_secs(2)).is_ok());
        assert!(!runner.is_running());
    }
}
