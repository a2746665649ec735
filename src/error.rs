//! Error types shared across the crate.
//!
//! Transport failures that belong to a single connection never surface here;
//! they are reported through [`EventHandler::on_error`](crate::EventHandler::on_error)
//! and [`EventHandler::on_close`](crate::EventHandler::on_close). What remains are
//! the synchronous failures of `start`/`stop`/`push` style calls.

use std::{io, result::Result as StdResult};

use thiserror::Error;

pub use crate::net::errors::ConnectionError;

/// Crate-level result alias.
pub type Result<T> = StdResult<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid listen address `{0}`")]
    InvalidAddress(String),

    #[error("server is already running")]
    AlreadyRunning,

    #[error("server is not running")]
    NotRunning,

    #[error("failed to spawn thread `{name}`: {source}")]
    Spawn {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Task(#[from] TaskError),

    #[error(transparent)]
    Timer(#[from] TimerError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

/// Rejections reported by [`TaskRunner`](crate::task::TaskRunner).
#[derive(Debug, Error)]
pub enum TaskError {
    /// The runner is stopped or stopping; the task was not accepted.
    #[error("task runner is stopped")]
    Stopped,

    /// The runner is already started.
    #[error("task runner is already running")]
    AlreadyRunning,

    /// The queue is at its configured capacity.
    #[error("task queue is full ({capacity} pending)")]
    QueueFull { capacity: usize },

    #[error("failed to spawn pool thread: {0}")]
    Spawn(#[source] io::Error),
}

/// Failures reported by [`Timer`](crate::timer::Timer) and
/// [`TimerLoop`](crate::timer::TimerLoop).
#[derive(Debug, Error)]
pub enum TimerError {
    /// A timer with a repeat budget of zero never fires.
    #[error("timer has a repeat count of zero")]
    Inert,

    /// The loop the timer was attached to has been dropped.
    #[error("timer loop is gone")]
    LoopGone,

    #[error("failed to spawn timer thread: {0}")]
    Spawn(#[source] io::Error),
}
