//! A worker is one poll loop on its own thread.
//!
//! Each worker polls its copy of the shared listener together with every
//! connection it accepted. Sockets never leave the loop thread; other threads
//! talk to a worker only through [`WorkerShared`]: they append to a
//! connection's queue, record a write job and wake the poller.
//!
//! ```text
//!   Token(0)         listener     ──▶ accept() until WouldBlock
//!   Token(usize::MAX) waker       ──▶ run write jobs
//!   Token(id)        connection   ──▶ read until WouldBlock / flush queue
//! ```

use std::{
    collections::{HashMap, VecDeque},
    io::{self, Read, Write},
    net::{self, Shutdown, SocketAddr},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread::{self, Builder, JoinHandle},
};

use mio::{
    net::{TcpListener, TcpStream},
    Events, Interest, Token, Waker,
};
use parking_lot::Mutex;
use socket2::{SockRef, TcpKeepalive};
use tracing::{debug, error, trace, warn};

use super::{
    config::TcpServerConfig,
    connection::{Connection, Outbound},
    handoff::{HandoffClient, Readiness},
    traits::{ConnectionId, EventHandler, WorkerId},
};
use crate::{
    error::{Error, Result},
    net::errors::NetworkEvent,
    poll::{PollHandle, LISTENER, WAKER},
    utils::grow_towards,
};

/// The part of a worker that other threads may touch.
pub(crate) struct WorkerShared {
    id: WorkerId,
    running: AtomicBool,
    waker: Arc<Waker>,
    /// Connections with queued output, and how many writes were scheduled.
    jobs: Mutex<HashMap<ConnectionId, usize>>,
    registry: Mutex<HashMap<ConnectionId, Arc<Connection>>>,
    next_connection_id: AtomicU64,
}

impl WorkerShared {
    pub fn new(id: WorkerId, waker: Arc<Waker>) -> Self {
        Self {
            id,
            running: AtomicBool::new(false),
            waker,
            jobs: Mutex::new(HashMap::new()),
            registry: Mutex::new(HashMap::new()),
            next_connection_id: AtomicU64::new(1),
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Release);
    }

    /// Records that `id` has queued output and wakes the loop. Safe from any
    /// thread, including the loop thread itself.
    pub fn schedule_write(&self, id: ConnectionId) {
        *self.jobs.lock().entry(id).or_insert(0) += 1;
        self.wake();
    }

    pub fn wake(&self) {
        if let Err(e) = self.waker.wake() {
            error!(worker = %self.id, error = %e, "failed to wake worker");
        }
    }

    /// Removes and returns every pending write job, ordered by connection id.
    pub fn take_jobs(&self) -> Vec<(ConnectionId, usize)> {
        let mut jobs: Vec<_> = self.jobs.lock().drain().collect();
        jobs.sort_unstable_by_key(|(id, _)| *id);
        jobs
    }

    pub fn connection(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.registry.lock().get(&id).cloned()
    }

    /// Requests a graceful close of `id`. Returns whether the connection exists.
    pub fn close_connection(&self, id: ConnectionId) -> bool {
        match self.connection(id) {
            Some(conn) => {
                conn.close();
                true
            }
            None => false,
        }
    }

    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.registry.lock().values().cloned().collect()
    }

    pub fn connection_count(&self) -> usize {
        self.registry.lock().len()
    }

    fn next_id(&self) -> ConnectionId {
        ConnectionId(self.next_connection_id.fetch_add(1, Ordering::Relaxed))
    }
}

/// Owning handle to a worker thread.
pub(crate) struct Worker {
    shared: Arc<WorkerShared>,
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    /// Creates the worker's poller and starts its thread. The thread first
    /// obtains the listener through `handoff` and reports the outcome to
    /// `readiness`, then runs the loop until [`stop`](Worker::stop).
    pub fn spawn<H: EventHandler>(
        id: WorkerId,
        config: TcpServerConfig,
        handler: Arc<H>,
        handoff: HandoffClient,
        readiness: Arc<Readiness>,
    ) -> Result<Self> {
        let poller = PollHandle::new()?;
        let shared = Arc::new(WorkerShared::new(id, poller.waker()));
        shared.set_running(true);

        let name = format!("tcp-worker-{id}");
        let thread_shared = Arc::clone(&shared);
        let thread = Builder::new()
            .name(name.clone())
            .spawn(move || {
                let received = handoff.request(id, config.handoff_timeout);
                drop(handoff);
                let listener = match received.and_then(|listener| adopt_listener(&poller, listener)) {
                    Ok(listener) => listener,
                    Err(e) => {
                        warn!(worker = %id, error = %e, "listener handoff failed");
                        thread_shared.set_running(false);
                        readiness.report(id, false);
                        return;
                    }
                };
                readiness.report(id, true);

                WorkerLoop {
                    shared: thread_shared,
                    scratch: vec![0; config.read_buffer_size.max(1)],
                    poller,
                    listener,
                    sockets: HashMap::new(),
                    handler,
                    config,
                }
                .run();
            })
            .map_err(|source| {
                shared.set_running(false);
                Error::Spawn { name, source }
            })?;

        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    pub fn shared(&self) -> &Arc<WorkerShared> {
        &self.shared
    }

    /// Asks the loop to exit. Returns immediately; see [`join`](Worker::join).
    pub fn stop(&self) {
        self.shared.set_running(false);
        self.shared.wake();
    }

    pub fn join(&mut self) {
        let Some(handle) = self.thread.take() else {
            return;
        };
        if handle.thread().id() == thread::current().id() {
            return;
        }
        if handle.join().is_err() {
            error!(worker = %self.shared.id(), "worker thread panicked");
        }
    }
}

fn adopt_listener(poller: &PollHandle, listener: net::TcpListener) -> io::Result<TcpListener> {
    listener.set_nonblocking(true)?;
    let mut listener = TcpListener::from_std(listener);
    poller.register(&mut listener, LISTENER, Interest::READABLE)?;
    Ok(listener)
}

/// Loop-side state of an accepted socket.
struct Socket {
    stream: TcpStream,
    conn: Arc<Connection>,
    /// Output taken off the connection queue but not yet fully written.
    sending: VecDeque<Outbound>,
    /// Bytes of the front buffer already written.
    offset: usize,
    writable_armed: bool,
}

struct WorkerLoop<H> {
    shared: Arc<WorkerShared>,
    poller: PollHandle,
    listener: TcpListener,
    sockets: HashMap<ConnectionId, Socket>,
    handler: Arc<H>,
    scratch: Vec<u8>,
    config: TcpServerConfig,
}

impl<H: EventHandler> WorkerLoop<H> {
    fn run(mut self) {
        let id = self.shared.id();
        let mut events = Events::with_capacity(self.config.events_capacity.max(1));
        debug!(worker = %id, "worker loop running");

        while self.shared.is_running() {
            if let Err(e) = self.poller.poll(&mut events, Some(self.config.poll_timeout)) {
                error!(worker = %id, error = %e, "poll failed, stopping worker");
                break;
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER => self.accept(),
                    WAKER => {}
                    Token(token) => {
                        let conn_id = ConnectionId(token as u64);
                        if event.is_readable() || event.is_read_closed() || event.is_error() {
                            self.read(conn_id);
                        }
                        if event.is_writable() {
                            self.flush(conn_id);
                        }
                    }
                }
            }

            self.run_jobs();
        }

        self.shutdown();
        debug!(worker = %id, "worker loop exited");
    }

    fn accept(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => self.create_connection(stream, peer),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::Interrupted | io::ErrorKind::ConnectionAborted
                    ) =>
                {
                    continue
                }
                Err(e) => {
                    warn!(worker = %self.shared.id(), error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    fn create_connection(&mut self, mut stream: TcpStream, peer: SocketAddr) {
        let worker = self.shared.id();
        self.configure(&stream, peer);

        let id = self.shared.next_id();
        let token = Token(id.as_u64() as usize);
        if let Err(e) = self.poller.register(&mut stream, token, Interest::READABLE) {
            warn!(%worker, %peer, error = %e, "failed to register connection");
            return;
        }

        let conn = Arc::new(Connection::new(id, worker, Arc::downgrade(&self.shared), peer));
        conn.touch();
        self.shared.registry.lock().insert(id, Arc::clone(&conn));
        self.sockets.insert(
            id,
            Socket {
                stream,
                conn: Arc::clone(&conn),
                sending: VecDeque::new(),
                offset: 0,
                writable_armed: false,
            },
        );
        debug!(%worker, conn = %id, %peer, "{}", NetworkEvent::ConnectionEstablished(worker, id));

        if let Err(e) = self.handler.on_create(&conn) {
            warn!(%worker, conn = %id, error = %e, "on_create failed, closing");
            conn.close();
        }
    }

    fn configure(&self, stream: &TcpStream, peer: SocketAddr) {
        if let Err(e) = stream.set_nodelay(self.config.no_delay) {
            warn!(%peer, error = %e, "failed to set TCP_NODELAY");
        }
        if let Some(time) = self.config.keep_alive {
            let keepalive = TcpKeepalive::new().with_time(time);
            if let Err(e) = SockRef::from(stream).set_tcp_keepalive(&keepalive) {
                warn!(%peer, error = %e, "failed to enable keepalive");
            }
        }
    }

    fn read(&mut self, id: ConnectionId) {
        loop {
            let Some(socket) = self.sockets.get_mut(&id) else {
                return;
            };
            if socket.conn.is_closing() {
                return;
            }

            match socket.stream.read(&mut self.scratch) {
                Ok(0) => {
                    trace!(worker = %self.shared.id(), conn = %id, "peer closed");
                    self.teardown(id, false);
                    return;
                }
                Ok(n) => {
                    let conn = Arc::clone(&socket.conn);
                    conn.touch();
                    if let Err(e) = self.handler.on_read(&conn, &self.scratch[..n]) {
                        warn!(worker = %self.shared.id(), conn = %id, error = %e, "on_read failed, closing");
                        conn.close();
                    }
                    if n == self.scratch.len() {
                        let len = self.scratch.len();
                        let grown = grow_towards(len, len, self.config.max_read_buffer_size);
                        if grown > len {
                            self.scratch.resize(grown, 0);
                            trace!(worker = %self.shared.id(), size = grown, "read buffer grown");
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.fail(id, e);
                    return;
                }
            }
        }
    }

    fn run_jobs(&mut self) {
        for (id, _) in self.shared.take_jobs() {
            self.flush(id);
        }
    }

    /// Writes as much queued output as the socket accepts.
    fn flush(&mut self, id: ConnectionId) {
        let Some(socket) = self.sockets.get_mut(&id) else {
            return;
        };
        socket.conn.take_pending(&mut socket.sending);

        while let Some(out) = socket.sending.pop_front() {
            let data = match out {
                Outbound::Data(data) => data,
                Outbound::Close => {
                    socket.sending.clear();
                    self.teardown(id, true);
                    return;
                }
            };

            match write_from(&mut socket.stream, &data, &mut socket.offset) {
                Ok(true) => {
                    socket.offset = 0;
                    socket.conn.touch();
                    if let Err(e) = self.handler.on_write(&socket.conn, &data, Ok(())) {
                        warn!(worker = %self.shared.id(), conn = %id, error = %e, "on_write failed");
                    }
                }
                Ok(false) => {
                    socket.sending.push_front(Outbound::Data(data));
                    if !socket.writable_armed {
                        let token = Token(id.as_u64() as usize);
                        match self.poller.reregister(
                            &mut socket.stream,
                            token,
                            Interest::READABLE | Interest::WRITABLE,
                        ) {
                            Ok(()) => socket.writable_armed = true,
                            Err(e) => {
                                self.fail(id, e);
                                return;
                            }
                        }
                    }
                    return;
                }
                Err(e) => {
                    let status = Err(io::Error::new(e.kind(), e.to_string()));
                    if let Err(cb) = self.handler.on_write(&socket.conn, &data, status) {
                        warn!(worker = %self.shared.id(), conn = %id, error = %cb, "on_write failed");
                    }
                    self.fail(id, e);
                    return;
                }
            }
        }

        if socket.writable_armed {
            let token = Token(id.as_u64() as usize);
            if let Err(e) = self.poller.reregister(&mut socket.stream, token, Interest::READABLE) {
                self.fail(id, e);
                return;
            }
            socket.writable_armed = false;
        }
    }

    /// Per-connection error path: `on_error`, then `on_close` and removal.
    fn fail(&mut self, id: ConnectionId, err: io::Error) {
        debug!(worker = %self.shared.id(), conn = %id, error = %err, "connection error");
        self.handler.on_error(id, &err.to_string());
        self.teardown(id, false);
    }

    fn teardown(&mut self, id: ConnectionId, shutdown_write: bool) {
        let Some(mut socket) = self.sockets.remove(&id) else {
            return;
        };
        let worker = self.shared.id();

        if shutdown_write {
            if let Err(e) = socket.stream.shutdown(Shutdown::Write) {
                trace!(%worker, conn = %id, error = %e, "shutdown failed");
            }
        }
        if let Err(e) = self.handler.on_close(&socket.conn) {
            warn!(%worker, conn = %id, error = %e, "on_close failed");
        }

        self.shared.registry.lock().remove(&id);
        if let Err(e) = self.poller.deregister(&mut socket.stream) {
            trace!(%worker, conn = %id, error = %e, "deregister failed");
        }
        socket.conn.release();
        debug!(%worker, conn = %id, "{}", NetworkEvent::ConnectionClosed(worker, id));
    }

    fn shutdown(&mut self) {
        self.shared.set_running(false);

        let ids: Vec<_> = self.sockets.keys().copied().collect();
        for id in ids {
            self.teardown(id, false);
        }
        self.shared.registry.lock().clear();
        self.shared.jobs.lock().clear();

        if let Err(e) = self.poller.deregister(&mut self.listener) {
            trace!(worker = %self.shared.id(), error = %e, "listener deregister failed");
        }
    }
}

/// Writes `data[*offset..]`, advancing `offset`. Returns `Ok(false)` when the
/// socket stopped accepting bytes before the buffer was done.
fn write_from(stream: &mut TcpStream, data: &[u8], offset: &mut usize) -> io::Result<bool> {
    while *offset < data.len() {
        match stream.write(&data[*offset..]) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => *offset += n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}
