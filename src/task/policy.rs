use std::time::{Duration, Instant};

pub const DEFAULT_MAX_WORKERS: usize = 32;

/// Tuning knobs for [`TaskRunner`](super::TaskRunner).
///
/// The monitor samples the pool every `monitor_interval`. Growth is immediate:
/// one worker is added on every sample where all workers are busy, up to
/// `max_workers`. Shrinking needs the pool to stay quiet for `idle_threshold`,
/// after which idle workers above the floor are stopped.
#[derive(Debug, Clone)]
pub struct ScalingPolicy {
    pub max_workers: usize,
    pub monitor_interval: Duration,
    pub idle_threshold: Duration,
    /// How long an idle pool thread waits on the queue before rechecking its
    /// stop flags.
    pub pop_timeout: Duration,
    /// Pushes beyond this many pending tasks are rejected; `None` is unbounded.
    pub queue_capacity: Option<usize>,
    pub thread_name_prefix: String,
}

impl Default for ScalingPolicy {
    fn default() -> Self {
        Self {
            max_workers: DEFAULT_MAX_WORKERS,
            monitor_interval: Duration::from_secs(1),
            idle_threshold: Duration::from_secs(5),
            pop_timeout: Duration::from_secs(1),
            queue_capacity: None,
            thread_name_prefix: "task-runner".to_string(),
        }
    }
}

impl ScalingPolicy {
    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers.max(1);
        self
    }

    pub fn with_monitor_interval(mut self, interval: Duration) -> Self {
        self.monitor_interval = interval;
        self
    }

    pub fn with_idle_threshold(mut self, threshold: Duration) -> Self {
        self.idle_threshold = threshold;
        self
    }

    pub fn with_pop_timeout(mut self, timeout: Duration) -> Self {
        self.pop_timeout = timeout;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: Option<usize>) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }
}

/// One observation of the pool taken by the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PoolSample {
    pub total: usize,
    pub busy: usize,
    pub min: usize,
    pub queued: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ScaleAction {
    Hold,
    Grow,
    /// Stop up to this many idle workers.
    Shrink(usize),
}

/// Idle/busy state carried by the monitor between samples.
#[derive(Debug, Default)]
pub(crate) struct Hysteresis {
    idle_since: Option<Instant>,
}

impl Hysteresis {
    pub fn observe(&mut self, policy: &ScalingPolicy, sample: PoolSample, now: Instant) -> ScaleAction {
        let saturated = if sample.total == 0 {
            sample.queued > 0
        } else {
            sample.busy == sample.total
        };

        if saturated {
            self.idle_since = None;
            return if sample.total < policy.max_workers {
                ScaleAction::Grow
            } else {
                ScaleAction::Hold
            };
        }

        // a floor of zero still counts an entirely idle pool as quiet
        let quiet = sample.busy < sample.min.max(1);
        if !quiet {
            self.idle_since = None;
            return ScaleAction::Hold;
        }

        let since = *self.idle_since.get_or_insert(now);
        if now.duration_since(since) >= policy.idle_threshold && sample.total > sample.min {
            ScaleAction::Shrink(sample.total - sample.min)
        } else {
            ScaleAction::Hold
        }
    }
}
