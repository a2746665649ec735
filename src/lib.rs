//! # Mill-Server
//! An embeddable, event-driven TCP server for Rust built on [`mio`], without an async runtime.
//! One listening socket is shared by several single-threaded poll loops, request processing is
//! pushed to an elastic thread pool, and periodic housekeeping runs on a single timer thread.
//! ## Core Philosophy
//! Mill-Server was designed for applications that require:
//! - **Predictable threading**: a fixed set of I/O loops, one pool, one timer thread
//! - **Runtime-agnostic architecture** that doesn't force async/await patterns
//! - **Lock-free I/O paths**: sockets are only ever touched by the loop that owns them
//! - **A narrow seam** between transport and protocol: five callbacks and a `Connection`
//! ## Features
//! - **Multi-loop accept**: every worker polls its own duplicate of the listener
//! - **Thread-safe writes**: `Connection::write` from any thread, flushed in order by the owner
//! - **Graceful close**: a close marker flushes everything queued before it, then shuts down
//! - **Elastic pool**: [`TaskRunner`] grows under saturation and shrinks after sustained idleness
//! - **Timers**: recurring callbacks on a shared [`TimerLoop`], e.g. for idle-connection sweeps
//! ## Architecture Overview
//! ```text
//! ┌─────────────┐    ┌──────────────┐    ┌──────────────────┐
//! │ TcpServer   │───▶│ tcp-acceptor │───▶│ tcp-worker-0..N  │──▶ EventHandler
//! └─────────────┘    └──────────────┘    └──────────────────┘        │
//!        │                                        ▲                  │ push
//!        │ idle sweep                             │ conn.write       ▼
//!        ▼                                        │           ┌─────────────┐
//! ┌─────────────┐                                 └───────────│ TaskRunner  │
//! │ TimerLoop   │                                             └─────────────┘
//! └─────────────┘
//! ```
//! ## Quick Start
//!
//! ```rust,no_run
//! use mill_server::{prelude::*, Result};
//! use std::sync::Arc;
//!
//! struct Echo {
//!     runner: TaskRunner,
//! }
//!
//! impl EventHandler for Echo {
//!     fn on_read(&self, conn: &Arc<Connection>, data: &[u8]) -> HandlerResult {
//!         let conn = Arc::clone(conn);
//!         let data = data.to_vec();
//!         self.runner.push(move || {
//!             let _ = conn.write(data);
//!         })?;
//!         Ok(())
//!     }
//! }
//!
//! fn main() -> Result<()> {
//!     let runner = TaskRunner::new(16);
//!     runner.start(2, true)?;
//!
//!     let config = TcpServerConfig::builder()
//!         .address("127.0.0.1:7000".parse().unwrap())
//!         .workers(4)
//!         .build();
//!     let server = TcpServer::new(config, Echo { runner });
//!     let addr = server.start()?;
//!     println!("listening on {addr}");
//!
//!     std::thread::park();
//!     server.stop()
//! }
//! ```
//!
//! - [`net::tcp`]: the server, its workers and the [`Connection`] handle
//! - [`task`]: [`Task`], the task queue and the elastic [`TaskRunner`]
//! - [`timer`]: [`Timer`] and [`TimerLoop`]
//! - [`poll`]: the per-worker wrapper over [`mio::Poll`]
//! - [`error`]: error types and result handling

#![cfg_attr(feature = "unstable-mpmc", feature(mpmc_channel))]

pub mod error;
pub mod net;
pub mod poll;
pub mod task;
pub mod timer;
mod utils;

pub use error::{Error, Result};
pub use net::tcp::{
    config::TcpServerConfig,
    traits::{ConnectionId, EventHandler, HandlerResult, WorkerId},
    Connection, TcpServer,
};
pub use task::{ScalingPolicy, Task, TaskRunner};
pub use timer::{Timer, TimerHandle, TimerLoop};
pub use utils::default_worker_count;

/// A convenient prelude module that re-exports commonly used types and traits.
///
/// ```rust
/// use mill_server::prelude::*;
/// ```
///
/// This brings into scope:
/// - [`EventHandler`], [`HandlerResult`], [`Connection`] and [`ConnectionId`] - the handler seam
/// - [`TcpServer`] and [`TcpServerConfig`] - the server and its configuration
/// - [`TaskRunner`], [`ScalingPolicy`] and [`Task`] - the elastic pool
/// - [`Timer`] and [`TimerLoop`] - recurring callbacks
pub mod prelude {
    pub use crate::net::tcp::{
        config::TcpServerConfig,
        traits::{ConnectionId, EventHandler, HandlerResult, WorkerId},
        Connection, TcpServer,
    };
    pub use crate::task::{ScalingPolicy, Task, TaskRunner};
    pub use crate::timer::{Timer, TimerHandle, TimerLoop};
}
