use std::{net::SocketAddr, time::Duration};

use crate::utils::default_worker_count;

/// Configuration for [`TcpServer`](super::TcpServer).
///
/// Controls the bind address, how many worker loops share the listener, socket
/// options applied to accepted connections, and the sizing of each worker's
/// poll loop. Use [`TcpServerConfig::builder()`] for ergonomic construction.
///
/// ## Socket Options
///
/// - no_delay: When enabled (default), disables Nagle's algorithm for lower latency
/// - keep_alive: Configures SO_KEEPALIVE to detect dead connections
///
/// ## Worker Loops
///
/// - workers: Number of independent event loops, each on its own thread
/// - events_capacity: Events fetched per poll call
/// - poll_timeout: Upper bound on how long a stop request can go unnoticed
/// - read_buffer_size / max_read_buffer_size: Initial and maximum size of the
///   per-worker read scratch buffer
#[derive(Debug, Clone)]
pub struct TcpServerConfig {
    /// Address to bind to
    pub address: SocketAddr,
    /// Number of worker loops
    pub workers: usize,
    /// Listen backlog
    pub backlog: i32,
    /// Enable TCP_NODELAY
    pub no_delay: bool,
    /// SO_KEEPALIVE idle time, `None` leaves keepalive off
    pub keep_alive: Option<Duration>,
    /// Initial size of the read scratch buffer
    pub read_buffer_size: usize,
    /// Largest size the read scratch buffer may grow to
    pub max_read_buffer_size: usize,
    /// Events fetched per poll call
    pub events_capacity: usize,
    /// Poll timeout of the worker loops
    pub poll_timeout: Duration,
    /// How long `start` waits for every worker to receive the listener
    pub handoff_timeout: Duration,
    /// Close connections without read/write activity for this long
    pub idle_timeout: Option<Duration>,
    /// How often the idle sweep runs
    pub sweep_interval: Duration,
}

impl TcpServerConfig {
    /// Create a new builder for TcpServerConfig
    pub fn builder() -> TcpServerConfigBuilder {
        TcpServerConfigBuilder::new()
    }
}

impl Default for TcpServerConfig {
    fn default() -> Self {
        Self {
            address: SocketAddr::from(([127, 0, 0, 1], 8080)),
            workers: default_worker_count(),
            backlog: 1024,
            no_delay: true,
            keep_alive: Some(Duration::from_secs(60)),
            read_buffer_size: 64 * 1024,
            max_read_buffer_size: 1024 * 1024,
            events_capacity: 1024,
            poll_timeout: Duration::from_millis(100),
            handoff_timeout: Duration::from_secs(5),
            idle_timeout: None,
            sweep_interval: Duration::from_secs(1),
        }
    }
}

/// Builder for TcpServerConfig using the builder pattern.
///
/// All fields are optional and will use defaults from TcpServerConfig::default()
/// if not explicitly set.
#[derive(Debug, Default)]
pub struct TcpServerConfigBuilder {
    address: Option<SocketAddr>,
    workers: Option<usize>,
    backlog: Option<i32>,
    no_delay: Option<bool>,
    keep_alive: Option<Option<Duration>>,
    read_buffer_size: Option<usize>,
    max_read_buffer_size: Option<usize>,
    events_capacity: Option<usize>,
    poll_timeout: Option<Duration>,
    handoff_timeout: Option<Duration>,
    idle_timeout: Option<Option<Duration>>,
    sweep_interval: Option<Duration>,
}

impl TcpServerConfigBuilder {
    /// Create a new builder with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the address to bind to
    pub fn address(mut self, address: SocketAddr) -> Self {
        self.address = Some(address);
        self
    }

    /// Set the number of worker loops, clamped to at least one
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers.max(1));
        self
    }

    pub fn backlog(mut self, backlog: i32) -> Self {
        self.backlog = Some(backlog);
        self
    }

    /// Enable or disable TCP_NODELAY
    pub fn no_delay(mut self, enabled: bool) -> Self {
        self.no_delay = Some(enabled);
        self
    }

    /// Set SO_KEEPALIVE duration
    pub fn keep_alive(mut self, duration: Option<Duration>) -> Self {
        self.keep_alive = Some(duration);
        self
    }

    /// Set the initial read scratch size
    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = Some(size.max(1));
        self
    }

    pub fn max_read_buffer_size(mut self, size: usize) -> Self {
        self.max_read_buffer_size = Some(size);
        self
    }

    pub fn events_capacity(mut self, capacity: usize) -> Self {
        self.events_capacity = Some(capacity.max(1));
        self
    }

    pub fn poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = Some(timeout);
        self
    }

    pub fn handoff_timeout(mut self, timeout: Duration) -> Self {
        self.handoff_timeout = Some(timeout);
        self
    }

    /// Close connections idle for longer than `timeout`
    pub fn idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = Some(interval);
        self
    }

    /// Build the TcpServerConfig
    pub fn build(self) -> TcpServerConfig {
        let default = TcpServerConfig::default();
        let read_buffer_size = self.read_buffer_size.unwrap_or(default.read_buffer_size);
        TcpServerConfig {
            address: self.address.unwrap_or(default.address),
            workers: self.workers.unwrap_or(default.workers),
            backlog: self.backlog.unwrap_or(default.backlog),
            no_delay: self.no_delay.unwrap_or(default.no_delay),
            keep_alive: self.keep_alive.unwrap_or(default.keep_alive),
            read_buffer_size,
            max_read_buffer_size: self
                .max_read_buffer_size
                .unwrap_or(default.max_read_buffer_size)
                .max(read_buffer_size),
            events_capacity: self.events_capacity.unwrap_or(default.events_capacity),
            poll_timeout: self.poll_timeout.unwrap_or(default.poll_timeout),
            handoff_timeout: self.handoff_timeout.unwrap_or(default.handoff_timeout),
            idle_timeout: self.idle_timeout.unwrap_or(default.idle_timeout),
            sweep_interval: self.sweep_interval.unwrap_or(default.sweep_interval),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_falls_back_to_defaults() {
        let config = TcpServerConfig::builder().workers(3).build();
        let default = TcpServerConfig::default();

        assert_eq!(config.workers, 3);
        assert_eq!(config.address, default.address);
        assert!(config.no_delay);
        assert_eq!(config.keep_alive, Some(Duration::from_secs(60)));
        assert_eq!(config.idle_timeout, None);
    }

    #[test]
    fn test_builder_clamps_sizes() {
        let config = TcpServerConfig::builder()
            .workers(0)
            .read_buffer_size(4096)
            .max_read_buffer_size(1024)
            .build();

        assert_eq!(config.workers, 1);
        assert_eq!(config.read_buffer_size, 4096);
        assert_eq!(config.max_read_buffer_size, 4096);
    }
}
