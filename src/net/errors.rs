use std::fmt;

use thiserror::Error;

use crate::net::tcp::traits::{ConnectionId, WorkerId};

/// Errors returned by the thread-safe [`Connection`](crate::net::tcp::Connection) API.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionError {
    /// `close()` was already requested; nothing queued after it is ever sent.
    #[error("connection {0} is closing")]
    Closing(ConnectionId),

    /// The owning worker has shut down.
    #[error("worker owning connection {0} is gone")]
    WorkerGone(ConnectionId),
}

/// Lifecycle notifications logged by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkEvent {
    HandoffComplete(WorkerId),
    HandoffFailed(WorkerId),
    ConnectionEstablished(WorkerId, ConnectionId),
    ConnectionClosed(WorkerId, ConnectionId),
}

impl fmt::Display for NetworkEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkEvent::HandoffComplete(worker) => {
                write!(f, "worker {worker} received the listener")
            }
            NetworkEvent::HandoffFailed(worker) => {
                write!(f, "worker {worker} failed to receive the listener")
            }
            NetworkEvent::ConnectionEstablished(worker, conn) => {
                write!(f, "connection {conn} established on worker {worker}")
            }
            NetworkEvent::ConnectionClosed(worker, conn) => {
                write!(f, "connection {conn} closed on worker {worker}")
            }
        }
    }
}
