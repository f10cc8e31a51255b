//! Readiness multiplexer.
//!
//! Thin bookkeeping layer over `mio::Poll` (epoll on Linux, kqueue on macOS).
//! mio itself distinguishes `register` from `reregister` and errors on a
//! double registration; this wrapper keeps a table of what is registered so
//! callers get an upsert and an idempotent unregister instead.

use mio::event::Source;
use mio::{Events, Poll, Token, Waker};
use std::collections::HashMap;
use std::io;
use std::ops::{BitOr, BitOrAssign};
use std::sync::Arc;
use std::time::Duration;

/// Token reserved for the cross-thread waker.
pub const WAKER_TOKEN: Token = Token(usize::MAX - 1);

/// Bitwise-composable READ/WRITE interest mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Interest(u8);

impl Interest {
    pub const NONE: Interest = Interest(0);
    pub const READ: Interest = Interest(0b01);
    pub const WRITE: Interest = Interest(0b10);

    pub fn contains(self, other: Interest) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_readable(self) -> bool {
        self.contains(Interest::READ)
    }

    pub fn is_writable(self) -> bool {
        self.contains(Interest::WRITE)
    }

    fn to_mio(self) -> Option<mio::Interest> {
        match (self.is_readable(), self.is_writable()) {
            (true, true) => Some(mio::Interest::READABLE | mio::Interest::WRITABLE),
            (true, false) => Some(mio::Interest::READABLE),
            (false, true) => Some(mio::Interest::WRITABLE),
            (false, false) => None,
        }
    }
}

impl BitOr for Interest {
    type Output = Interest;

    fn bitor(self, rhs: Interest) -> Interest {
        Interest(self.0 | rhs.0)
    }
}

impl BitOrAssign for Interest {
    fn bitor_assign(&mut self, rhs: Interest) {
        self.0 |= rhs.0;
    }
}

/// One ready descriptor from a single `poll` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessEvent {
    pub token: Token,
    pub ready: Interest,
}

impl ReadinessEvent {
    fn from_mio(event: &mio::event::Event) -> Self {
        let mut ready = Interest::NONE;
        // Hang-ups and socket errors surface through the read path.
        if event.is_readable() || event.is_read_closed() || event.is_error() {
            ready |= Interest::READ;
        }
        if event.is_writable() {
            ready |= Interest::WRITE;
        }
        ReadinessEvent {
            token: event.token(),
            ready,
        }
    }
}

/// Registration table plus the underlying `mio::Poll`.
pub struct Poller {
    poll: Poll,
    events: Events,
    registered: HashMap<Token, Interest>,
    waker: Arc<Waker>,
}

impl Poller {
    /// Create a poller that reports at most `capacity` events per call.
    pub fn new(capacity: usize) -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        Ok(Self {
            poll,
            events: Events::with_capacity(capacity),
            registered: HashMap::new(),
            waker,
        })
    }

    /// Register `source` under `token`, or update its interest if already present.
    ///
    /// An empty mask is rejected: a descriptor with no interest is never woken.
    pub fn register<S>(&mut self, source: &mut S, token: Token, interest: Interest) -> io::Result<()>
    where
        S: Source + ?Sized,
    {
        let mio_interest = interest.to_mio().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "empty interest mask")
        })?;

        if self.registered.contains_key(&token) {
            self.poll
                .registry()
                .reregister(source, token, mio_interest)?;
        } else {
            self.poll.registry().register(source, token, mio_interest)?;
        }
        self.registered.insert(token, interest);
        Ok(())
    }

    /// Remove `source` from the poll set. Does nothing if `token` is unknown.
    pub fn unregister<S>(&mut self, source: &mut S, token: Token) -> io::Result<()>
    where
        S: Source + ?Sized,
    {
        if self.registered.remove(&token).is_some() {
            self.poll.registry().deregister(source)?;
        }
        Ok(())
    }

    /// Block until something is ready or `timeout` elapses.
    ///
    /// Returns an empty batch on timeout or when interrupted by a signal.
    pub fn poll(&mut self, timeout: Option<Duration>) -> io::Result<Vec<ReadinessEvent>> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(Vec::new()),
            Err(e) => return Err(e),
        }
        Ok(self.events.iter().map(ReadinessEvent::from_mio).collect())
    }

    /// Interest currently registered for `token`.
    pub fn interest(&self, token: Token) -> Option<Interest> {
        self.registered.get(&token).copied()
    }

    /// Number of registered descriptors, not counting the waker.
    pub fn len(&self) -> usize {
        self.registered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registered.is_empty()
    }

    /// Handle that interrupts a blocked `poll` from another thread.
    pub fn waker(&self) -> Arc<Waker> {
        Arc::clone(&self.waker)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::net::{TcpListener, TcpStream};
    use std::io::Write;

    const LISTENER: Token = Token(0);
    const CLIENT: Token = Token(1);

    fn listener() -> TcpListener {
        TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap()
    }

    /// Poll until `token` reports something or give up.
    fn wait_for(poller: &mut Poller, token: Token) -> Option<ReadinessEvent> {
        for _ in 0..50 {
            let events = poller.poll(Some(Duration::from_millis(20))).unwrap();
            if let Some(event) = events.into_iter().find(|e| e.token == token) {
                return Some(event);
            }
        }
        None
    }

    #[test]
    fn test_interest_mask() {
        let both = Interest::READ | Interest::WRITE;
        assert!(both.is_readable());
        assert!(both.is_writable());
        assert!(!Interest::READ.contains(Interest::WRITE));
        assert!(Interest::NONE.to_mio().is_none());
    }

    #[test]
    fn test_register_is_upsert() {
        let mut poller = Poller::new(16).unwrap();
        let mut listener = listener();

        poller
            .register(&mut listener, LISTENER, Interest::READ)
            .unwrap();
        // A second plain register would fail inside mio; here it updates.
        poller
            .register(&mut listener, LISTENER, Interest::READ | Interest::WRITE)
            .unwrap();

        assert_eq!(poller.len(), 1);
        assert_eq!(
            poller.interest(LISTENER),
            Some(Interest::READ | Interest::WRITE)
        );
    }

    #[test]
    fn test_unregister_is_idempotent() {
        let mut poller = Poller::new(16).unwrap();
        let mut listener = listener();

        poller
            .register(&mut listener, LISTENER, Interest::READ)
            .unwrap();
        poller.unregister(&mut listener, LISTENER).unwrap();
        poller.unregister(&mut listener, LISTENER).unwrap();

        assert!(poller.is_empty());
        assert_eq!(poller.interest(LISTENER), None);
    }

    #[test]
    fn test_empty_interest_rejected() {
        let mut poller = Poller::new(16).unwrap();
        let mut listener = listener();

        let err = poller
            .register(&mut listener, LISTENER, Interest::NONE)
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert!(poller.is_empty());
    }

    #[test]
    fn test_poll_times_out_empty() {
        let mut poller = Poller::new(16).unwrap();
        let events = poller.poll(Some(Duration::from_millis(10))).unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn test_read_and_write_reported_together() {
        let mut poller = Poller::new(16).unwrap();
        let listener = listener();
        let addr = listener.local_addr().unwrap();

        let mut client = TcpStream::connect(addr).unwrap();
        poller
            .register(&mut client, CLIENT, Interest::READ | Interest::WRITE)
            .unwrap();

        let (mut accepted, _) = loop {
            match listener.accept() {
                Ok(pair) => break pair,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(5))
                }
                Err(e) => panic!("accept failed: {e}"),
            }
        };
        accepted.write_all(b"x").unwrap();

        let mut seen = Interest::NONE;
        for _ in 0..50 {
            if let Some(event) = wait_for(&mut poller, CLIENT) {
                seen |= event.ready;
            }
            if seen == (Interest::READ | Interest::WRITE) {
                break;
            }
            // Re-arm so the next edge reports the current state.
            poller
                .register(&mut client, CLIENT, Interest::READ | Interest::WRITE)
                .unwrap();
        }
        assert!(seen.is_readable());
        assert!(seen.is_writable());
    }

    #[test]
    fn test_waker_interrupts_poll() {
        let mut poller = Poller::new(16).unwrap();
        let waker = poller.waker();

        let handle = std::thread::spawn(move || waker.wake().unwrap());
        let event = wait_for(&mut poller, WAKER_TOKEN);
        handle.join().unwrap();

        assert!(event.is_some());
    }
}
