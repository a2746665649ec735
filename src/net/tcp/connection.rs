use std::{
    any::Any,
    collections::VecDeque,
    fmt,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Weak,
    },
    time::{Duration, Instant},
};

use parking_lot::Mutex;

use super::{
    traits::{ConnectionId, WorkerId},
    worker::WorkerShared,
};
use crate::{net::errors::ConnectionError, utils::millis};

type UserContext = Arc<dyn Any + Send + Sync>;

/// One entry of a connection's write queue.
pub(crate) enum Outbound {
    Data(Vec<u8>),
    /// Everything queued before this is flushed, then the socket is shut down.
    Close,
}

/// Thread-safe view of an accepted socket.
///
/// The socket itself lives inside the owning worker loop; a `Connection` only
/// carries identity, the pending-write queue and the protocol layer's context.
/// It can be cloned (as `Arc<Connection>`) into tasks and written to from any
/// thread: [`write`](Connection::write) and [`close`](Connection::close) append
/// to the queue and wake the worker, which performs the actual I/O.
///
/// ```text
///   any thread                    worker loop
///   ──────────                    ───────────
///   conn.write(buf) ─┐
///   conn.write(buf) ─┼─▶ queue ──▶ flush in FIFO order ──▶ socket
///   conn.close()   ──┘   (Close)   shutdown(Write), on_close, remove
/// ```
pub struct Connection {
    id: ConnectionId,
    worker_id: WorkerId,
    worker: Weak<WorkerShared>,
    peer: SocketAddr,
    ip: String,
    queue: Mutex<VecDeque<Outbound>>,
    closing: AtomicBool,
    context: Mutex<Option<UserContext>>,
    created: Instant,
    /// Milliseconds after `created` of the last read or write.
    last_activity: AtomicU64,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("worker", &self.worker_id)
            .field("peer", &self.peer)
            .field("closing", &self.is_closing())
            .finish()
    }
}

impl Connection {
    pub(crate) fn new(
        id: ConnectionId,
        worker_id: WorkerId,
        worker: Weak<WorkerShared>,
        peer: SocketAddr,
    ) -> Self {
        Self {
            id,
            worker_id,
            worker,
            ip: peer.ip().to_string(),
            peer,
            queue: Mutex::new(VecDeque::new()),
            closing: AtomicBool::new(false),
            context: Mutex::new(None),
            created: Instant::now(),
            last_activity: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    /// Textual form of the peer IP, captured at accept time.
    pub fn ip(&self) -> &str {
        &self.ip
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Queues `data` for sending and wakes the owning worker.
    ///
    /// Buffers are written in the order they were queued. Fails once
    /// [`close`](Connection::close) has been called or the worker has shut down.
    pub fn write(&self, data: impl Into<Vec<u8>>) -> Result<(), ConnectionError> {
        let worker = self.live_worker()?;
        {
            let mut queue = self.queue.lock();
            if self.closing.load(Ordering::Acquire) {
                return Err(ConnectionError::Closing(self.id));
            }
            queue.push_back(Outbound::Data(data.into()));
        }
        worker.schedule_write(self.id);
        Ok(())
    }

    /// Requests a graceful close: pending writes are flushed first, then the
    /// socket is shut down and `on_close` fires on the worker thread.
    ///
    /// Only the first call has an effect.
    pub fn close(&self) {
        {
            let mut queue = self.queue.lock();
            if self.closing.swap(true, Ordering::AcqRel) {
                return;
            }
            queue.push_back(Outbound::Close);
        }
        if let Some(worker) = self.worker.upgrade() {
            worker.schedule_write(self.id);
        }
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Attaches protocol state to the connection, replacing any previous value.
    ///
    /// The context is dropped when the connection is torn down.
    pub fn set_user_context<T>(&self, ctx: T)
    where
        T: Any + Send + Sync,
    {
        *self.context.lock() = Some(Arc::new(ctx));
    }

    /// Returns the attached context if it is a `T`.
    pub fn user_context<T>(&self) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        let ctx = self.context.lock().clone()?;
        ctx.downcast::<T>().ok()
    }

    /// Detaches and returns the context if it is a `T`. A context of another
    /// type is left in place.
    pub fn take_user_context<T>(&self) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        let mut slot = self.context.lock();
        match slot.take()?.downcast::<T>() {
            Ok(ctx) => Some(ctx),
            Err(other) => {
                *slot = Some(other);
                None
            }
        }
    }

    /// Time since the last read or write on this connection.
    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_activity.load(Ordering::Relaxed));
        self.created.elapsed().saturating_sub(last)
    }

    pub(crate) fn touch(&self) {
        self.last_activity
            .store(millis(self.created.elapsed()), Ordering::Relaxed);
    }

    /// Moves everything queued so far to the back of `sending`.
    pub(crate) fn take_pending(&self, sending: &mut VecDeque<Outbound>) {
        sending.append(&mut self.queue.lock());
    }

    /// Marks the connection dead once the worker has torn it down: later
    /// writes fail, queued output is dropped and the context is released.
    pub(crate) fn release(&self) {
        {
            let mut queue = self.queue.lock();
            self.closing.store(true, Ordering::Release);
            queue.clear();
        }
        self.context.lock().take();
    }

    fn live_worker(&self) -> Result<Arc<WorkerShared>, ConnectionError> {
        match self.worker.upgrade() {
            Some(worker) if worker.is_running() => Ok(worker),
            _ => Err(ConnectionError::WorkerGone(self.id)),
        }
    }
}
