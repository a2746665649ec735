//! Deferred work and the elastic pool that runs it.
//!
//! ```text
//!   push() ──▶ TaskQueue (Mutex<VecDeque> + Condvar) ──▶ pool thread 0..N
//!                                                   ▲
//!                    monitor (1 tick/s) ────────────┘ grows on saturation,
//!                                                     shrinks after 5s idle
//! ```
//!
//! I/O threads never run request processing themselves: the protocol layer
//! pushes a [`Task`] from its read callback and the task writes the response
//! back through [`Connection::write`](crate::net::tcp::Connection::write).

mod policy;
mod queue;
mod runner;

pub use policy::ScalingPolicy;
pub use queue::TaskQueue;
pub use runner::TaskRunner;

/// A single unit of deferred work.
///
/// Any `FnOnce() + Send + 'static` closure is a task. Tasks are expected to
/// finish in bounded time; pool sizing assumes they do.
pub trait Task: Send + 'static {
    fn run(self: Box<Self>);
}

impl<F> Task for F
where
    F: FnOnce() + Send + 'static,
{
    fn run(self: Box<Self>) {
        (*self)()
    }
}

pub type BoxedTask = Box<dyn Task>;
