//! mio event loop implementation.
//!
//! Readiness-based model: poll tells us when sockets are ready,
//! then we perform non-blocking read/write syscalls.
//! Uses epoll on Linux, kqueue on macOS.
//!
//! ## Edge Triggering
//!
//! mio reports a readiness *transition* once. Every handler therefore keeps
//! going until the kernel says `WouldBlock`: the listener is drained of all
//! pending connections, reads continue until the socket is empty, and writes
//! continue until the outbound queue is empty or the send buffer is full.
//! Stopping early would leave work behind that no later event announces.
//!
//! ## Interest Tracking
//!
//! A connection is registered for WRITE only while it has bytes queued. Once
//! the queue drains the registration goes back to READ only, so an idle
//! connection is never woken for writability.

use crate::config::Config;
use crate::runtime::connection::{Connection, ConnectionRegistry, DuplicateHandle};
use crate::runtime::poller::{Interest, Poller, WAKER_TOKEN};
use crate::runtime::shutdown::ShutdownHandle;
use crate::runtime::socket::{self, BindError, Io, TransportError};
use crate::runtime::stats::Stats;
use crate::runtime::ServerError;
use mio::net::{TcpListener, TcpStream};
use mio::Token;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);

/// Listener lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Listening,
    Stopped,
}

/// Why a connection left the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseReason {
    /// Orderly shutdown by the peer with nothing left to send.
    PeerClosed,
    /// Peer half-closed earlier and the backlog is now flushed.
    Flushed,
    IdleTimeout,
    Error,
    Shutdown,
}

/// What to do with a connection after servicing an event.
enum Disposition {
    Keep,
    Close(CloseReason),
}

/// Failure scoped to a single connection.
#[derive(Debug)]
enum ConnError {
    Transport(TransportError),
    Poller(io::Error),
}

impl From<TransportError> for ConnError {
    fn from(e: TransportError) -> Self {
        ConnError::Transport(e)
    }
}

impl From<io::Error> for ConnError {
    fn from(e: io::Error) -> Self {
        ConnError::Poller(e)
    }
}

impl fmt::Display for ConnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnError::Transport(e) => write!(f, "{e}"),
            ConnError::Poller(e) => write!(f, "interest update failed: {e}"),
        }
    }
}

impl ConnError {
    /// Resets and broken pipes are routine for an echo server.
    fn is_routine(&self) -> bool {
        match self {
            ConnError::Transport(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionAborted
            ),
            ConnError::Poller(_) => false,
        }
    }
}

fn token_for(fd: RawFd) -> Token {
    Token(fd as usize)
}

/// Single-threaded echo server: one listener, one poller, many connections.
///
/// The loop owns the registry and the poller outright; nothing outside it can
/// mutate either.
pub struct EventLoop {
    poller: Poller,
    /// `None` once the listener is stopped.
    listener: Option<TcpListener>,
    local_addr: SocketAddr,
    connections: ConnectionRegistry,
    /// Scratch space every recv lands in before being queued for echo.
    read_buf: Vec<u8>,
    /// Backlog may still hold clients that no readiness event will announce.
    accept_pending: bool,
    poll_timeout: Duration,
    idle_timeout: Option<Duration>,
    shutdown: ShutdownHandle,
    stats: Stats,
}

impl EventLoop {
    /// Bind the listener and set up the poller.
    pub fn new(config: &Config) -> Result<Self, ServerError> {
        let addr = config.listen_addr()?;
        let mut poller = Poller::new(config.events_capacity).map_err(ServerError::Poll)?;

        let mut listener = socket::create_listener(addr, config.backlog)?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| BindError { addr, source })?;
        poller
            .register(&mut listener, LISTENER_TOKEN, Interest::READ)
            .map_err(ServerError::Poll)?;

        let shutdown = ShutdownHandle::new(poller.waker());

        info!(
            addr = %local_addr,
            backlog = config.backlog,
            max_connections = config.max_connections,
            poll_timeout_ms = config.poll_timeout.as_millis() as u64,
            idle_timeout_secs = config.idle_timeout.map(|t| t.as_secs()),
            "Listening"
        );

        Ok(Self {
            poller,
            listener: Some(listener),
            local_addr,
            connections: ConnectionRegistry::new(config.max_connections),
            read_buf: vec![0u8; config.read_buffer_size],
            accept_pending: false,
            poll_timeout: config.poll_timeout,
            idle_timeout: config.idle_timeout,
            shutdown,
            stats: Stats::default(),
        })
    }

    /// Address the listener is bound to (resolves port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Handle for stopping `run` from another thread.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    pub fn listener_state(&self) -> ListenerState {
        if self.listener.is_some() {
            ListenerState::Listening
        } else {
            ListenerState::Stopped
        }
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn stats(&self) -> Stats {
        self.stats
    }

    /// Run until shutdown is requested, then release every socket.
    pub fn run(&mut self) -> Result<(), ServerError> {
        info!(addr = %self.local_addr(), state = ?self.listener_state(), "Event loop started");

        let result = loop {
            if self.shutdown.is_shutdown() {
                break Ok(());
            }
            if let Err(e) = self.turn() {
                error!(error = %e, "Event loop failed");
                break Err(e);
            }
        };

        self.stop();
        result
    }

    /// One iteration: poll, dispatch every event, sweep idle connections.
    ///
    /// Returns the number of events handled. Only a poller failure is an
    /// error here; anything a single connection does is contained.
    pub fn turn(&mut self) -> Result<usize, ServerError> {
        let events = self
            .poller
            .poll(Some(self.poll_timeout))
            .map_err(ServerError::Poll)?;
        trace!(events = events.len(), registered = self.poller.len(), "Polled");

        let mut accepted = false;
        for event in &events {
            match event.token {
                LISTENER_TOKEN => {
                    self.accept_connections();
                    accepted = true;
                }
                WAKER_TOKEN => trace!("Woken"),
                Token(fd) => self.handle_connection_event(fd as RawFd, event.ready),
            }
        }

        // An earlier drain stopped on an error; the listener will not fire
        // again for clients already queued.
        if self.accept_pending && !accepted {
            debug!("Retrying pending accepts");
            self.accept_connections();
        }

        if let Some(timeout) = self.idle_timeout {
            self.sweep_idle(timeout, Instant::now());
        }

        Ok(events.len())
    }

    /// Stop the listener and close every connection.
    fn stop(&mut self) {
        info!(connections = self.connection_count(), "Stopping event loop");

        if let Some(mut listener) = self.listener.take() {
            if let Err(e) = self.poller.unregister(&mut listener, LISTENER_TOKEN) {
                debug!(error = %e, "Failed to deregister listener");
            }
            info!(addr = %self.local_addr, "Listener stopped");
        }

        for fd in self.connections.handles() {
            self.close_connection(fd, CloseReason::Shutdown);
        }
        debug_assert!(self.connections.is_empty());
        debug_assert!(self.poller.is_empty());

        info!(
            accepted = self.stats.accepted,
            rejected = self.stats.rejected,
            closed = self.stats.closed,
            timed_out = self.stats.timed_out,
            errors = self.stats.errors,
            bytes_received = self.stats.bytes_received,
            bytes_sent = self.stats.bytes_sent,
            spurious_writable = self.stats.spurious_writable,
            "Event loop stopped"
        );
    }

    /// Accept until the listener reports `WouldBlock`.
    ///
    /// Readiness fires once however many clients are queued, so stopping
    /// early would strand the rest of the backlog. A drain cut short by an
    /// error (EMFILE, ENOBUFS, ...) leaves `accept_pending` set and is
    /// retried every turn until the backlog is empty.
    fn accept_connections(&mut self) {
        loop {
            let accepted = match self.listener.as_ref() {
                Some(listener) => socket::accept(listener),
                None => return,
            };

            match accepted {
                Ok(Io::Ready((stream, peer))) => self.admit(stream, peer),
                Ok(Io::WouldBlock) | Ok(Io::Closed) => {
                    self.accept_pending = false;
                    break;
                }
                // The client gave up while queued; keep draining.
                Err(e) if e.kind() == io::ErrorKind::ConnectionAborted => {
                    debug!(error = %e, "Accept aborted by peer");
                }
                Err(e) => {
                    error!(error = %e, "Accept error, will retry next turn");
                    self.accept_pending = true;
                    break;
                }
            }
        }
    }

    fn admit(&mut self, stream: TcpStream, peer: SocketAddr) {
        if self.connections.is_full() {
            self.stats.rejected += 1;
            warn!(
                peer = %peer,
                max_connections = self.connections.capacity(),
                "Connection limit reached, rejecting"
            );
            return;
        }

        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
        }

        let fd = stream.as_raw_fd();
        debug_assert!(!self.connections.contains(fd), "descriptor reused while live");
        let conn = Connection::new(stream, peer);
        if let Err(DuplicateHandle(fd)) = self.connections.add(fd, conn) {
            error!(fd, peer = %peer, "Descriptor already registered");
            return;
        }

        let Some(conn) = self.connections.get_mut(fd) else {
            return;
        };
        if let Err(e) = self
            .poller
            .register(&mut conn.stream, token_for(fd), Interest::READ)
        {
            warn!(fd, peer = %peer, error = %e, "Failed to register connection");
            self.connections.remove(fd);
            return;
        }

        self.stats.accepted += 1;
        debug!(fd, peer = %peer, "Accepted connection");
    }

    /// Service one readiness event. Never propagates: a failing connection is
    /// closed and the loop moves on.
    fn handle_connection_event(&mut self, fd: RawFd, ready: Interest) {
        let Some(conn) = self.connections.get(fd) else {
            // Closed earlier in this batch.
            trace!(fd, "Event for unknown connection");
            return;
        };
        let peer = conn.peer;

        match self.service(fd, ready) {
            Ok(Disposition::Keep) => {}
            Ok(Disposition::Close(reason)) => self.close_connection(fd, reason),
            Err(e) => {
                self.stats.errors += 1;
                if e.is_routine() {
                    debug!(fd, peer = %peer, error = %e, "Connection error");
                } else {
                    warn!(fd, peer = %peer, error = %e, "Connection error");
                }
                self.close_connection(fd, CloseReason::Error);
            }
        }
    }

    fn service(&mut self, fd: RawFd, ready: Interest) -> Result<Disposition, ConnError> {
        if ready.is_readable() {
            if let Disposition::Close(reason) = self.handle_readable(fd)? {
                return Ok(Disposition::Close(reason));
            }
        }

        if ready.is_writable() {
            if let Disposition::Close(reason) = self.handle_writable(fd)? {
                return Ok(Disposition::Close(reason));
            }
        }

        self.sync_interest(fd)?;
        Ok(Disposition::Keep)
    }

    /// Read until `WouldBlock`, queueing every byte for echo.
    fn handle_readable(&mut self, fd: RawFd) -> Result<Disposition, ConnError> {
        let Some(conn) = self.connections.get_mut(fd) else {
            return Ok(Disposition::Keep);
        };
        // Read side already finished.
        if conn.is_closing() {
            return Ok(Disposition::Keep);
        }

        loop {
            match socket::recv(&mut conn.stream, &mut self.read_buf)? {
                Io::Ready(n) => {
                    self.stats.bytes_received += n as u64;
                    conn.received(&self.read_buf[..n]);
                    trace!(fd, bytes = n, queued = conn.queued_bytes(), "Read");
                }
                Io::WouldBlock => return Ok(Disposition::Keep),
                Io::Closed if conn.has_pending_output() => {
                    debug!(
                        fd,
                        peer = %conn.peer,
                        queued = conn.queued_bytes(),
                        "Peer closed, flushing queued bytes"
                    );
                    conn.start_closing();
                    return Ok(Disposition::Keep);
                }
                Io::Closed => return Ok(Disposition::Close(CloseReason::PeerClosed)),
            }
        }
    }

    /// Send queued chunks until the queue is empty or the socket is full.
    fn handle_writable(&mut self, fd: RawFd) -> Result<Disposition, ConnError> {
        let Some(conn) = self.connections.get_mut(fd) else {
            return Ok(Disposition::Keep);
        };

        if !conn.has_pending_output() {
            self.stats.spurious_writable += 1;
            trace!(fd, "Writable with nothing queued");
            return Ok(Disposition::Keep);
        }

        while let Some(chunk) = conn.front() {
            match socket::send(&mut conn.stream, &chunk)? {
                Io::Ready(n) => {
                    self.stats.bytes_sent += n as u64;
                    conn.advance(n);
                    trace!(fd, bytes = n, queued = conn.queued_bytes(), "Wrote");
                }
                Io::WouldBlock => return Ok(Disposition::Keep),
                Io::Closed => return Ok(Disposition::Close(CloseReason::PeerClosed)),
            }
        }

        if conn.is_closing() {
            return Ok(Disposition::Close(CloseReason::Flushed));
        }
        Ok(Disposition::Keep)
    }

    /// Re-register when the wanted interest differs from the registered one.
    fn sync_interest(&mut self, fd: RawFd) -> Result<(), ConnError> {
        let Some(conn) = self.connections.get_mut(fd) else {
            return Ok(());
        };

        let token = token_for(fd);
        debug_assert_eq!(self.poller.interest(token), Some(conn.interest));

        let desired = conn.desired_interest();
        if desired != conn.interest {
            self.poller.register(&mut conn.stream, token, desired)?;
            trace!(fd, from = ?conn.interest, to = ?desired, "Interest updated");
            conn.interest = desired;
        }
        Ok(())
    }

    /// Close connections with no traffic for longer than `timeout`.
    fn sweep_idle(&mut self, timeout: Duration, now: Instant) {
        let stale: Vec<RawFd> = self
            .connections
            .iter()
            .filter(|(_, conn)| conn.idle_for(now) >= timeout)
            .map(|(fd, _)| fd)
            .collect();

        for fd in stale {
            self.close_connection(fd, CloseReason::IdleTimeout);
        }
    }

    /// Deregister, remove and drop. Dropping the stream closes the socket.
    fn close_connection(&mut self, fd: RawFd, reason: CloseReason) {
        let Some(mut conn) = self.connections.remove(fd) else {
            return;
        };

        if let Err(e) = self.poller.unregister(&mut conn.stream, token_for(fd)) {
            debug!(fd, error = %e, "Failed to deregister connection");
        }

        self.stats.closed += 1;
        if reason == CloseReason::IdleTimeout {
            self.stats.timed_out += 1;
        }

        debug!(
            fd,
            peer = %conn.peer,
            reason = ?reason,
            unsent = conn.queued_bytes(),
            open = self.stats.open(),
            "Connection closed"
        );
    }
}
