//! Connection state and the registry of live connections.
//!
//! Pure bookkeeping: nothing in this module touches a socket. The event loop
//! performs the I/O and reports the results here.

use crate::runtime::poller::Interest;
use bytes::{Buf, Bytes};
use mio::net::TcpStream;
use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

/// Lifecycle of a client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Accepted and registered, nothing read yet.
    Accepted,
    /// Steady state: reading and echoing.
    Open,
    /// Peer closed its write side; flushing what is still queued.
    Closing,
}

/// A single client connection.
#[derive(Debug)]
pub struct Connection {
    pub stream: TcpStream,
    pub peer: SocketAddr,
    pub state: ConnState,
    /// Interest mask currently registered with the poller.
    pub interest: Interest,
    /// Received chunks awaiting echo, oldest first.
    outbound: VecDeque<Bytes>,
    queued: usize,
    last_activity: Instant,
}

impl Connection {
    /// Wrap a freshly accepted stream. Interest starts at READ.
    pub fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            stream,
            peer,
            state: ConnState::Accepted,
            interest: Interest::READ,
            outbound: VecDeque::new(),
            queued: 0,
            last_activity: Instant::now(),
        }
    }

    /// Record bytes just received; they are echoed verbatim.
    pub fn received(&mut self, data: &[u8]) {
        self.enqueue(Bytes::copy_from_slice(data));
        if self.state == ConnState::Accepted {
            self.state = ConnState::Open;
        }
        self.touch();
    }

    /// Append a chunk to the outbound queue.
    pub fn enqueue(&mut self, chunk: Bytes) {
        if chunk.is_empty() {
            return;
        }
        self.queued += chunk.len();
        self.outbound.push_back(chunk);
    }

    /// Oldest unsent chunk, if any. Cloning a `Bytes` only bumps a refcount.
    pub fn front(&self) -> Option<Bytes> {
        self.outbound.front().cloned()
    }

    /// Drop exactly `n` sent bytes from the front of the queue.
    ///
    /// A partially written chunk keeps its unsent tail at the front.
    pub fn advance(&mut self, mut n: usize) {
        debug_assert!(n <= self.queued, "advanced past queued bytes");
        self.queued -= n.min(self.queued);
        while n > 0 {
            let Some(front) = self.outbound.front_mut() else {
                break;
            };
            if n < front.len() {
                front.advance(n);
                break;
            }
            n -= front.len();
            self.outbound.pop_front();
        }
        self.touch();
    }

    pub fn queued_bytes(&self) -> usize {
        self.queued
    }

    pub fn has_pending_output(&self) -> bool {
        !self.outbound.is_empty()
    }

    /// READ always, WRITE exactly when output is pending.
    pub fn desired_interest(&self) -> Interest {
        if self.has_pending_output() {
            Interest::READ | Interest::WRITE
        } else {
            Interest::READ
        }
    }

    /// Peer half-closed; finish flushing then go away.
    pub fn start_closing(&mut self) {
        self.state = ConnState::Closing;
    }

    pub fn is_closing(&self) -> bool {
        self.state == ConnState::Closing
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }
}

/// Attempted to add a handle that is already present.
#[derive(Debug, PartialEq, Eq)]
pub struct DuplicateHandle(pub RawFd);

/// Live connections keyed by file descriptor.
///
/// The kernel only reuses a descriptor after it is closed, and a connection is
/// removed before its stream is dropped, so keys never alias.
#[derive(Debug)]
pub struct ConnectionRegistry {
    connections: HashMap<RawFd, Connection>,
    max_connections: usize,
}

impl ConnectionRegistry {
    /// Create a new registry with specified maximum capacity.
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: HashMap::new(),
            max_connections,
        }
    }

    /// Insert a new connection.
    pub fn add(&mut self, fd: RawFd, conn: Connection) -> Result<(), DuplicateHandle> {
        match self.connections.entry(fd) {
            Entry::Occupied(_) => Err(DuplicateHandle(fd)),
            Entry::Vacant(slot) => {
                slot.insert(conn);
                Ok(())
            }
        }
    }

    pub fn get(&self, fd: RawFd) -> Option<&Connection> {
        self.connections.get(&fd)
    }

    pub fn get_mut(&mut self, fd: RawFd) -> Option<&mut Connection> {
        self.connections.get_mut(&fd)
    }

    pub fn remove(&mut self, fd: RawFd) -> Option<Connection> {
        self.connections.remove(&fd)
    }

    pub fn contains(&self, fd: RawFd) -> bool {
        self.connections.contains_key(&fd)
    }

    /// Number of active connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// No room for another connection.
    pub fn is_full(&self) -> bool {
        self.connections.len() >= self.max_connections
    }

    /// Maximum number of connections allowed.
    pub fn capacity(&self) -> usize {
        self.max_connections
    }

    /// Snapshot of the current handles, safe to iterate while removing.
    pub fn handles(&self) -> Vec<RawFd> {
        self.connections.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (RawFd, &Connection)> {
        self.connections.iter().map(|(fd, conn)| (*fd, conn))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::AsRawFd;

    /// A connected (server side, client side) pair on loopback.
    fn stream_pair() -> (TcpStream, std::net::TcpStream) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        (TcpStream::from_std(server), client)
    }

    fn connection() -> (Connection, std::net::TcpStream) {
        let (stream, client) = stream_pair();
        let peer = client.local_addr().unwrap();
        (Connection::new(stream, peer), client)
    }

    #[test]
    fn test_connection_state_transitions() {
        let (mut conn, _client) = connection();
        assert_eq!(conn.state, ConnState::Accepted);
        assert_eq!(conn.interest, Interest::READ);

        conn.received(b"abc");
        assert_eq!(conn.state, ConnState::Open);
        assert_eq!(conn.queued_bytes(), 3);

        conn.start_closing();
        assert!(conn.is_closing());
    }

    #[test]
    fn test_queue_preserves_order_across_partial_advance() {
        let (mut conn, _client) = connection();
        conn.enqueue(Bytes::from_static(b"hello"));
        conn.enqueue(Bytes::from_static(b"world"));
        assert_eq!(conn.queued_bytes(), 10);

        conn.advance(3);
        assert_eq!(conn.front().as_deref(), Some(&b"lo"[..]));
        assert_eq!(conn.queued_bytes(), 7);

        conn.advance(4);
        assert_eq!(conn.front().as_deref(), Some(&b"rld"[..]));

        conn.advance(3);
        assert!(conn.front().is_none());
        assert_eq!(conn.queued_bytes(), 0);
    }

    #[test]
    fn test_desired_interest_tracks_queue() {
        let (mut conn, _client) = connection();
        assert_eq!(conn.desired_interest(), Interest::READ);

        conn.enqueue(Bytes::from_static(b"x"));
        assert_eq!(conn.desired_interest(), Interest::READ | Interest::WRITE);

        conn.advance(1);
        assert_eq!(conn.desired_interest(), Interest::READ);

        // Empty chunks never make the queue non-empty.
        conn.enqueue(Bytes::new());
        assert!(!conn.has_pending_output());
    }

    #[test]
    fn test_idle_for() {
        let (conn, _client) = connection();
        let later = Instant::now() + Duration::from_secs(5);
        assert!(conn.idle_for(later) >= Duration::from_secs(5));
        assert_eq!(conn.idle_for(Instant::now() - Duration::from_secs(1)), Duration::ZERO);
    }

    #[test]
    fn test_connection_registry() {
        let mut registry = ConnectionRegistry::new(2);

        let (c1, _k1) = connection();
        let (c2, _k2) = connection();
        let fd1 = c1.stream.as_raw_fd();
        let fd2 = c2.stream.as_raw_fd();

        registry.add(fd1, c1).unwrap();
        registry.add(fd2, c2).unwrap();
        assert!(registry.is_full());
        assert_eq!(registry.len(), 2);

        let (c3, _k3) = connection();
        assert_eq!(registry.add(fd1, c3).unwrap_err(), DuplicateHandle(fd1));

        let mut handles = registry.handles();
        handles.sort();
        let mut expected = vec![fd1, fd2];
        expected.sort();
        assert_eq!(handles, expected);

        assert!(registry.remove(fd1).is_some());
        assert!(registry.remove(fd1).is_none());
        assert!(!registry.contains(fd1));
        assert!(registry.get(fd2).is_some());
        assert_eq!(registry.len(), 1);
        assert!(!registry.is_full());
    }
}
