//! Multi-loop TCP server.
//!
//! One listening socket is shared by N worker loops. The server binds it,
//! parks it on a short-lived acceptor thread, and every worker fetches its own
//! duplicate over the handoff channel. From then on each worker accepts, reads
//! and writes independently on its own thread; the kernel spreads inbound
//! connections across the workers without any shared accept-time lock.
//!
//! ```text
//!                      ┌──────────────┐
//!   bind(addr) ──────▶ │ tcp-acceptor │ ── dup(listener) ──┬──▶ tcp-worker-0
//!                      └──────────────┘                    ├──▶ tcp-worker-1
//!                                                          └──▶ tcp-worker-N
//!
//!   tcp-worker-i:  mio::Poll ── listener (Token 0)
//!                            ├─ waker    (Token usize::MAX)
//!                            └─ conn 1..  ──▶ EventHandler callbacks
//! ```
//!
//! ## Connection Lifecycle
//!
//! ```text
//! 1. Accept:
//!    listener readable ──> accept() until WouldBlock
//!        - TCP_NODELAY / SO_KEEPALIVE
//!        - register READABLE, insert into the worker registry
//!        - handler.on_create()
//!
//! 2. Read:
//!    readable ──> read() until WouldBlock into the worker's scratch buffer
//!        - handler.on_read() for every chunk
//!        - EOF: on_close, remove; error: on_error, on_close, remove
//!
//! 3. Write (any thread):
//!    conn.write(buf) ──> queue + wake ──> worker flushes in order
//!        - handler.on_write() once per buffer
//!        - WouldBlock arms WRITABLE until the queue drains
//!
//! 4. Close (any thread):
//!    conn.close() ──> sentinel ──> flush, shutdown(Write), on_close, remove
//! ```
//!
//! ## Configuration
//!
//! ```rust
//! use mill_server::net::tcp::config::TcpServerConfig;
//! use std::time::Duration;
//!
//! let config = TcpServerConfig::builder()
//!     .address("0.0.0.0:8080".parse().unwrap())
//!     .workers(4)
//!     .no_delay(true)
//!     .idle_timeout(Some(Duration::from_secs(30)))
//!     .build();
//! assert_eq!(config.workers, 4);
//! ```
//!
//! ## Handler Implementation
//!
//! ```rust,no_run
//! use mill_server::net::tcp::{
//!     config::TcpServerConfig,
//!     traits::{EventHandler, HandlerResult},
//!     Connection, TcpServer,
//! };
//! use std::sync::Arc;
//!
//! struct Echo;
//!
//! impl EventHandler for Echo {
//!     fn on_read(&self, conn: &Arc<Connection>, data: &[u8]) -> HandlerResult {
//!         conn.write(data.to_vec())?;
//!         Ok(())
//!     }
//! }
//!
//! let server = TcpServer::new(TcpServerConfig::default(), Echo);
//! let addr = server.start()?;
//! println!("listening on {addr}");
//! server.stop()?;
//! # Ok::<(), mill_server::error::Error>(())
//! ```

pub mod config;
pub mod traits;

mod connection;
mod handoff;
mod worker;

pub use connection::Connection;

use std::{
    io,
    net::{IpAddr, SocketAddr, TcpListener},
    sync::{Arc, Weak},
    thread::JoinHandle,
    time::Duration,
};

use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, error, info, warn};

use crate::{
    error::{Error, Result},
    timer::{Timer, TimerHandle},
};
use config::TcpServerConfig;
use handoff::{spawn_acceptor, Readiness};
use traits::{ConnectionId, EventHandler, WorkerId};
use worker::{Worker, WorkerShared};

/// Event-driven TCP server running one poll loop per worker thread.
pub struct TcpServer<H: EventHandler> {
    config: TcpServerConfig,
    handler: Arc<H>,
    state: Mutex<Option<Running>>,
}

struct Running {
    local_addr: SocketAddr,
    workers: Vec<Worker>,
    readiness: Arc<Readiness>,
    acceptor: Option<JoinHandle<()>>,
    sweep: Option<TimerHandle>,
}

impl<H: EventHandler> TcpServer<H> {
    pub fn new(config: TcpServerConfig, handler: H) -> Self {
        Self {
            config,
            handler: Arc::new(handler),
            state: Mutex::new(None),
        }
    }

    /// Binds the configured address and starts the configured number of
    /// workers. Returns the bound address once every worker has received the
    /// listener or the handoff timeout has passed.
    pub fn start(&self) -> Result<SocketAddr> {
        self.launch(self.config.address, self.config.workers)
    }

    /// Like [`start`](TcpServer::start), with an explicit address and worker count.
    pub fn start_on(&self, ip: &str, port: u16, workers: usize) -> Result<SocketAddr> {
        let ip: IpAddr = ip
            .parse()
            .map_err(|_| Error::InvalidAddress(ip.to_string()))?;
        self.launch(SocketAddr::new(ip, port), workers.max(1))
    }

    fn launch(&self, addr: SocketAddr, workers: usize) -> Result<SocketAddr> {
        let mut state = self.state.lock();
        if state.is_some() {
            return Err(Error::AlreadyRunning);
        }

        let listener = bind_listener(addr, self.config.backlog)?;
        let local_addr = listener.local_addr()?;
        let (handoff, acceptor) = spawn_acceptor(listener, workers)?;
        let readiness = Arc::new(Readiness::default());

        let mut running = Running {
            local_addr,
            workers: Vec::with_capacity(workers),
            readiness: Arc::clone(&readiness),
            acceptor: Some(acceptor),
            sweep: None,
        };

        for i in 0..workers {
            match Worker::spawn(
                WorkerId(i),
                self.config.clone(),
                Arc::clone(&self.handler),
                handoff.clone(),
                Arc::clone(&readiness),
            ) {
                Ok(worker) => running.workers.push(worker),
                Err(e) => {
                    error!(worker = i, error = %e, "failed to start worker");
                    drop(handoff);
                    running.shutdown();
                    return Err(e);
                }
            }
        }
        drop(handoff);

        let ready = readiness.wait(workers, self.config.handoff_timeout);
        if ready == 0 {
            running.shutdown();
            return Err(Error::Io(io::Error::other("no worker received the listener")));
        }
        if ready < workers {
            warn!(ready, workers, failed = ?readiness.failed(), "server running with degraded capacity");
        }

        if let Some(timeout) = self.config.idle_timeout {
            running.sweep = self.start_idle_sweep(&running.workers, timeout);
        }

        info!(addr = %local_addr, workers = ready, "tcp server started");
        *state = Some(running);
        Ok(local_addr)
    }

    fn start_idle_sweep(&self, workers: &[Worker], timeout: Duration) -> Option<TimerHandle> {
        let targets: Vec<Weak<WorkerShared>> =
            workers.iter().map(|w| Arc::downgrade(w.shared())).collect();

        let sweep = move || {
            for shared in targets.iter().filter_map(Weak::upgrade) {
                for conn in shared.connections() {
                    if !conn.is_closing() && conn.idle_for() >= timeout {
                        debug!(worker = %conn.worker_id(), conn = %conn.id(), "closing idle connection");
                        conn.close();
                    }
                }
            }
        };

        match Timer::new(self.config.sweep_interval, -1).start(sweep) {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!(error = %e, "idle sweep disabled");
                None
            }
        }
    }

    /// Stops every worker and joins their threads. Connections still open get
    /// `on_close` before their worker exits.
    pub fn stop(&self) -> Result<()> {
        let mut running = self.state.lock().take().ok_or(Error::NotRunning)?;
        running.shutdown();
        info!(addr = %running.local_addr, "tcp server stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.state.lock().as_ref().map(|r| r.local_addr)
    }

    /// Workers that completed the listener handoff.
    pub fn ready_workers(&self) -> usize {
        self.state.lock().as_ref().map_or(0, |r| r.readiness.ready())
    }

    pub fn worker_count(&self) -> usize {
        self.state.lock().as_ref().map_or(0, |r| r.workers.len())
    }

    /// Open connections across all workers.
    pub fn connection_count(&self) -> usize {
        self.state.lock().as_ref().map_or(0, |r| {
            r.workers.iter().map(|w| w.shared().connection_count()).sum()
        })
    }

    pub fn connection(&self, worker: WorkerId, id: ConnectionId) -> Option<Arc<Connection>> {
        let state = self.state.lock();
        state.as_ref()?.workers.get(worker.0)?.shared().connection(id)
    }

    pub fn handler(&self) -> &Arc<H> {
        &self.handler
    }

    pub fn config(&self) -> &TcpServerConfig {
        &self.config
    }
}

impl<H: EventHandler> Drop for TcpServer<H> {
    fn drop(&mut self) {
        if let Some(mut running) = self.state.get_mut().take() {
            running.shutdown();
        }
    }
}

impl Running {
    fn shutdown(&mut self) {
        if let Some(sweep) = self.sweep.take() {
            sweep.cancel();
        }
        for worker in &self.workers {
            worker.stop();
        }
        for worker in &mut self.workers {
            worker.join();
        }
        if let Some(acceptor) = self.acceptor.take() {
            if acceptor.join().is_err() {
                error!("acceptor thread panicked");
            }
        }
    }
}

fn bind_listener(addr: SocketAddr, backlog: i32) -> Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    #[cfg(unix)]
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        io::{Read, Write},
        net::TcpStream,
        thread,
        time::Instant,
    };
    use traits::HandlerResult;

    struct Echo;

    impl EventHandler for Echo {
        fn on_read(&self, conn: &Arc<Connection>, data: &[u8]) -> HandlerResult {
            conn.write(data.to_vec())?;
            Ok(())
        }
    }

    fn config(workers: usize) -> TcpServerConfig {
        TcpServerConfig::builder()
            .address("127.0.0.1:0".parse().unwrap())
            .workers(workers)
            .poll_timeout(Duration::from_millis(20))
            .build()
    }

    #[test]
    fn test_start_and_stop() {
        let server = TcpServer::new(config(3), Echo);
        let addr = server.start().unwrap();

        assert!(server.is_running());
        assert_ne!(addr.port(), 0);
        assert_eq!(server.local_addr(), Some(addr));
        assert_eq!(server.worker_count(), 3);
        assert_eq!(server.ready_workers(), 3);

        server.stop().unwrap();
        assert!(!server.is_running());
        assert_eq!(server.worker_count(), 0);
        assert!(TcpStream::connect(addr).is_err());
    }

    #[test]
    fn test_lifecycle_errors() {
        let server = TcpServer::new(config(1), Echo);
        assert!(matches!(server.stop(), Err(Error::NotRunning)));

        server.start().unwrap();
        assert!(matches!(server.start(), Err(Error::AlreadyRunning)));
        server.stop().unwrap();
        assert!(matches!(server.stop(), Err(Error::NotRunning)));
    }

    #[test]
    fn test_start_on_rejects_bad_ip() {
        let server = TcpServer::new(config(1), Echo);
        assert!(matches!(
            server.start_on("not-an-ip", 0, 1),
            Err(Error::InvalidAddress(ip)) if ip == "not-an-ip"
        ));
        assert!(!server.is_running());
    }

    #[test]
    fn test_bind_conflict_is_reported() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();

        let server = TcpServer::new(config(1), Echo);
        assert!(matches!(
            server.start_on("127.0.0.1", port, 1),
            Err(Error::Io(_))
        ));
    }

    #[test]
    fn test_restart_after_stop() {
        let server = TcpServer::new(config(2), Echo);
        let first = server.start_on("127.0.0.1", 0, 2).unwrap();
        server.stop().unwrap();
        let second = server.start_on("127.0.0.1", 0, 1).unwrap();
        assert_ne!(first, second);
        assert_eq!(server.worker_count(), 1);
    }

    #[test]
    fn test_connection_lookup() {
        let server = TcpServer::new(config(1), Echo);
        let addr = server.start().unwrap();

        let mut client = TcpStream::connect(addr).unwrap();
        client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        client.write_all(b"ping").unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");

        let conn = server.connection(WorkerId(0), ConnectionId(1)).unwrap();
        assert_eq!(conn.ip(), "127.0.0.1");
        assert_eq!(server.connection_count(), 1);
        assert!(server.connection(WorkerId(5), ConnectionId(1)).is_none());

        conn.close();
        let deadline = Instant::now() + Duration::from_secs(5);
        while server.connection_count() > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(server.connection_count(), 0);
        assert_eq!(client.read(&mut buf).unwrap(), 0);
    }
}
