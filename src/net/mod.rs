//! Networking layer: the multi-loop TCP transport and its error types.
//!
//! The transport owns sockets and threads; protocol code owns meaning. The two
//! meet at [`tcp::traits::EventHandler`] (transport to protocol) and
//! [`tcp::Connection`] (protocol back to transport).
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Protocol layer (yours)                  │
//! │  ┌──────────────┐   push(task)   ┌──────────────┐           │
//! │  │ EventHandler │──────────────▶│  TaskRunner  │           │
//! │  └──────────────┘                └──────┬───────┘           │
//! └─────────▲───────────────────────────────┼───────────────────┘
//!           │ on_create/on_read/...         │ conn.write(buf)
//!           │                               ▼
//! ┌─────────┴───────────────────────────────────────────────────┐
//! │  TcpServer                                                  │
//! │  ┌──────────────┐  ┌──────────────┐      ┌──────────────┐   │
//! │  │ tcp-worker-0 │  │ tcp-worker-1 │ ...  │ tcp-worker-N │   │
//! │  │  mio::Poll   │  │  mio::Poll   │      │  mio::Poll   │   │
//! │  └──────────────┘  └──────────────┘      └──────────────┘   │
//! └────────────┬────────────────────────────────────────────────┘
//!              │ OS Events
//!              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │              Operating System (epoll/kqueue/IOCP)           │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Handler callbacks run on the worker thread that owns the connection. Work
//! that takes longer than a read should be pushed to a
//! [`TaskRunner`](crate::task::TaskRunner); the task answers through
//! [`Connection::write`](tcp::Connection::write), which is safe from any thread.

pub mod errors;
pub mod tcp;
