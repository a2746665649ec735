//! Distribution of the listening socket to the worker loops.
//!
//! The server binds one listener and parks it on an acceptor thread. Each
//! worker asks for its own copy over a channel; the acceptor answers with a
//! duplicated descriptor of the same socket, so every worker ends up polling
//! the one accept queue. Once every worker has been served the acceptor drops
//! its copy and exits.
//!
//! ```text
//!   worker 0 ──HandoffRequest──┐
//!   worker 1 ──HandoffRequest──┼──▶ acceptor ── try_clone() ──▶ reply
//!   worker N ──HandoffRequest──┘        │
//!                                       └─ exits after N replies
//! ```

#[cfg(feature = "unstable-mpmc")]
use std::sync::mpmc as channel;
#[cfg(not(feature = "unstable-mpmc"))]
use std::sync::mpsc as channel;
use std::{
    io,
    net::TcpListener,
    thread::{Builder, JoinHandle},
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use super::traits::WorkerId;
use crate::{
    error::{Error, Result},
    net::errors::NetworkEvent,
};

pub(crate) struct HandoffRequest {
    worker: WorkerId,
    reply: channel::Sender<io::Result<TcpListener>>,
}

/// Worker-side endpoint of the handoff channel.
#[derive(Clone)]
pub(crate) struct HandoffClient {
    requests: channel::Sender<HandoffRequest>,
}

impl HandoffClient {
    /// Asks the acceptor for a listener copy, waiting at most `timeout`.
    pub fn request(&self, worker: WorkerId, timeout: Duration) -> io::Result<TcpListener> {
        let (reply, response) = channel::channel();
        self.requests
            .send(HandoffRequest { worker, reply })
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "acceptor is gone"))?;

        response.recv_timeout(timeout).map_err(|e| match e {
            channel::RecvTimeoutError::Timeout => {
                io::Error::new(io::ErrorKind::TimedOut, "listener handoff timed out")
            }
            channel::RecvTimeoutError::Disconnected => {
                io::Error::new(io::ErrorKind::BrokenPipe, "acceptor dropped the request")
            }
        })?
    }
}

/// Parks `listener` on a new acceptor thread that serves `expected` handoffs.
pub(crate) fn spawn_acceptor(
    listener: TcpListener,
    expected: usize,
) -> Result<(HandoffClient, JoinHandle<()>)> {
    let (requests, incoming) = channel::channel::<HandoffRequest>();
    let name = "tcp-acceptor".to_string();

    let thread = Builder::new()
        .name(name.clone())
        .spawn(move || serve(listener, incoming, expected))
        .map_err(|source| Error::Spawn { name, source })?;

    Ok((HandoffClient { requests }, thread))
}

fn serve(listener: TcpListener, incoming: channel::Receiver<HandoffRequest>, expected: usize) {
    let mut served = 0;
    while served < expected {
        let Ok(HandoffRequest { worker, reply }) = incoming.recv() else {
            debug!(served, expected, "handoff channel closed early");
            break;
        };

        let copy = listener.try_clone();
        if let Err(e) = &copy {
            warn!(%worker, error = %e, "failed to duplicate listener");
        }
        if reply.send(copy).is_err() {
            debug!(%worker, "worker went away before its handoff");
        }
        served += 1;
    }
    debug!(served, "acceptor finished handing off the listener");
}

#[derive(Debug, Default)]
struct ReadinessState {
    ready: Vec<WorkerId>,
    failed: Vec<WorkerId>,
}

/// Tracks which workers received the listener.
#[derive(Debug, Default)]
pub(crate) struct Readiness {
    state: Mutex<ReadinessState>,
    cond: Condvar,
}

impl Readiness {
    pub fn report(&self, worker: WorkerId, ok: bool) {
        let event = if ok {
            NetworkEvent::HandoffComplete(worker)
        } else {
            NetworkEvent::HandoffFailed(worker)
        };

        let mut state = self.state.lock();
        if ok {
            info!(%worker, "{event}");
            state.ready.push(worker);
        } else {
            warn!(%worker, "{event}");
            state.failed.push(worker);
        }
        self.cond.notify_all();
    }

    /// Blocks until `expected` workers have reported or `timeout` elapses.
    /// Returns the number of ready workers.
    pub fn wait(&self, expected: usize, timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.ready.len() + state.failed.len() < expected {
            if self.cond.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        state.ready.len()
    }

    pub fn ready(&self) -> usize {
        self.state.lock().ready.len()
    }

    pub fn failed(&self) -> Vec<WorkerId> {
        self.state.lock().failed.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{net::TcpStream, sync::Arc, thread};

    #[test]
    fn test_every_worker_gets_a_copy_of_the_same_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, acceptor) = spawn_acceptor(listener, 3).unwrap();

        let copies: Vec<_> = (0..3)
            .map(|i| {
                let client = client.clone();
                thread::spawn(move || client.request(WorkerId(i), Duration::from_secs(5)))
            })
            .map(|h| h.join().unwrap().unwrap())
            .collect();

        acceptor.join().unwrap();
        for copy in &copies {
            assert_eq!(copy.local_addr().unwrap(), addr);
        }

        let _client = TcpStream::connect(addr).unwrap();
        let (_, peer) = copies[1].accept().unwrap();
        assert!(peer.ip().is_loopback());
    }

    #[test]
    fn test_request_after_acceptor_exit_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let (client, acceptor) = spawn_acceptor(listener, 1).unwrap();

        client.request(WorkerId(0), Duration::from_secs(5)).unwrap();
        acceptor.join().unwrap();

        let err = client
            .request(WorkerId(1), Duration::from_millis(100))
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[test]
    fn test_readiness_wait() {
        let readiness = Arc::new(Readiness::default());
        let reporter = readiness.clone();
        let handle = thread::spawn(move || {
            reporter.report(WorkerId(0), true);
            reporter.report(WorkerId(1), false);
            reporter.report(WorkerId(2), true);
        });

        assert_eq!(readiness.wait(3, Duration::from_secs(5)), 2);
        handle.join().unwrap();
        assert_eq!(readiness.ready(), 2);
        assert_eq!(readiness.failed(), vec![WorkerId(1)]);
    }

    #[test]
    fn test_readiness_wait_times_out() {
        let readiness = Readiness::default();
        readiness.report(WorkerId(0), true);
        let started = Instant::now();
        assert_eq!(readiness.wait(2, Duration::from_millis(50)), 1);
        assert!(started.elapsed() >= Duration::from_millis(45));
    }
}
