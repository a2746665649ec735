//! Thin wrapper over [`mio::Poll`] owned by a single worker loop.
//!
//! A worker creates its `PollHandle` on the thread that spawns it, hands the
//! waker to the shared side of the worker, and moves the handle into the loop
//! thread. From then on only the loop thread polls or (de)registers sources;
//! other threads reach the loop exclusively through [`mio::Waker::wake`].

use std::{io, sync::Arc, time::Duration};

use mio::{event::Source, Events, Interest, Poll, Token, Waker};

/// Token of the shared listener on every worker.
pub const LISTENER: Token = Token(0);
/// Token of the wake primitive on every worker.
pub const WAKER: Token = Token(usize::MAX);

pub struct PollHandle {
    poller: Poll,
    waker: Arc<Waker>,
}

impl PollHandle {
    pub fn new() -> io::Result<Self> {
        let poller = Poll::new()?;
        let waker = Waker::new(poller.registry(), WAKER)?;
        Ok(PollHandle {
            poller,
            waker: Arc::new(waker),
        })
    }

    pub fn register<S>(&self, src: &mut S, token: Token, interest: Interest) -> io::Result<()>
    where
        S: Source + ?Sized,
    {
        src.register(self.poller.registry(), token, interest)
    }

    pub fn reregister<S>(&self, src: &mut S, token: Token, interest: Interest) -> io::Result<()>
    where
        S: Source + ?Sized,
    {
        src.reregister(self.poller.registry(), token, interest)
    }

    pub fn deregister<S>(&self, src: &mut S) -> io::Result<()>
    where
        S: Source + ?Sized,
    {
        src.deregister(self.poller.registry())
    }

    /// Waits for readiness events. An interrupted wait reports zero events.
    pub fn poll(&mut self, events: &mut Events, timeout: Option<Duration>) -> io::Result<usize> {
        match self.poller.poll(events, timeout) {
            Ok(()) => Ok(events.iter().count()),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                events.clear();
                Ok(0)
            }
            Err(e) => Err(e),
        }
    }

    pub fn waker(&self) -> Arc<Waker> {
        Arc::clone(&self.waker)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{thread, time::Instant};

    #[test]
    fn test_poll_times_out_without_events() {
        let mut poller = PollHandle::new().unwrap();
        let mut events = Events::with_capacity(16);
        let n = poller
            .poll(&mut events, Some(Duration::from_millis(20)))
            .unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn test_waker_interrupts_poll() {
        let mut poller = PollHandle::new().unwrap();
        let waker = poller.waker();
        let mut events = Events::with_capacity(16);

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            waker.wake().unwrap();
        });

        let started = Instant::now();
        poller
            .poll(&mut events, Some(Duration::from_secs(5)))
            .unwrap();
        handle.join().unwrap();

        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(events.iter().any(|event| event.token() == WAKER));
    }
}
