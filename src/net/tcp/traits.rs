use std::{error::Error, fmt, io, sync::Arc};

use super::Connection;

/// Result returned by [`EventHandler`] callbacks.
pub type HandlerResult = Result<(), Box<dyn Error + Send + Sync>>;

/// Identifier of a connection, unique within its owning worker.
///
/// Ids are handed out from a per-worker counter starting at 1, so the same id
/// can be live on two different workers at once. Pair it with the [`WorkerId`]
/// when a server-wide key is needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    pub fn new(id: u64) -> Self {
        ConnectionId(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Index of a worker inside its server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(pub usize);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Callbacks through which the transport reports connection lifecycle events
/// to the protocol layer.
///
/// Every method runs synchronously on the loop thread of the worker that owns
/// the connection. Implementations must return quickly; anything expensive
/// belongs on a [`TaskRunner`](crate::task::TaskRunner), from where the result
/// is sent back with [`Connection::write`].
///
/// Only [`on_read`](EventHandler::on_read) is required.
///
/// ## Error Handling
///
/// An error returned from `on_read` makes the worker close the connection after
/// flushing whatever is already queued. Errors from the other callbacks are
/// logged and otherwise ignored.
pub trait EventHandler: Send + Sync + 'static {
    /// Called once per accepted connection, before any read is delivered.
    fn on_create(&self, conn: &Arc<Connection>) -> HandlerResult {
        let _ = conn;
        Ok(())
    }

    /// Called for every chunk read from the socket.
    ///
    /// `data` borrows the worker's scratch buffer and is overwritten by the next
    /// read; copy out whatever must outlive the call.
    fn on_read(&self, conn: &Arc<Connection>, data: &[u8]) -> HandlerResult;

    /// Called after a queued buffer has been fully written, or when writing it
    /// failed.
    fn on_write(&self, conn: &Arc<Connection>, data: &[u8], status: io::Result<()>) -> HandlerResult {
        let _ = (conn, data, status);
        Ok(())
    }

    /// Called exactly once when the connection is torn down, whatever the cause.
    fn on_close(&self, conn: &Arc<Connection>) -> HandlerResult {
        let _ = conn;
        Ok(())
    }

    /// Called when a read or write fails for a reason other than end of stream.
    /// [`on_close`](EventHandler::on_close) follows.
    fn on_error(&self, conn_id: ConnectionId, message: &str) {
        let _ = (conn_id, message);
    }
}

impl<H: EventHandler> EventHandler for Arc<H> {
    fn on_create(&self, conn: &Arc<Connection>) -> HandlerResult {
        (**self).on_create(conn)
    }

    fn on_read(&self, conn: &Arc<Connection>, data: &[u8]) -> HandlerResult {
        (**self).on_read(conn, data)
    }

    fn on_write(&self, conn: &Arc<Connection>, data: &[u8], status: io::Result<()>) -> HandlerResult {
        (**self).on_write(conn, data, status)
    }

    fn on_close(&self, conn: &Arc<Connection>) -> HandlerResult {
        (**self).on_close(conn)
    }

    fn on_error(&self, conn_id: ConnectionId, message: &str) {
        (**self).on_error(conn_id, message)
    }
}
