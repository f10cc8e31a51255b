//! Non-blocking socket primitives.
//!
//! Every call returns immediately. "Not ready yet" comes back as
//! [`Io::WouldBlock`] and an orderly peer shutdown as [`Io::Closed`], so the
//! event loop never has to inspect `io::ErrorKind` itself. Anything else is a
//! [`TransportError`], which only ever costs the one connection it came from.

use mio::net::{TcpListener, TcpStream};
use std::fmt;
use std::io::{self, Read, Write};
use std::net::SocketAddr;

/// Outcome of a non-blocking socket call.
#[derive(Debug, PartialEq, Eq)]
pub enum Io<T> {
    /// The call made progress.
    Ready(T),
    /// Nothing can be done until the next readiness event.
    WouldBlock,
    /// Peer performed an orderly shutdown (zero-length read).
    Closed,
}

/// Which primitive failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Accept,
    Recv,
    Send,
}

/// Connection-scoped socket failure (reset, broken pipe, ...).
#[derive(Debug)]
pub struct TransportError {
    pub op: Op,
    pub source: io::Error,
}

impl TransportError {
    fn new(op: Op, source: io::Error) -> Self {
        Self { op, source }
    }

    pub fn kind(&self) -> io::ErrorKind {
        self.source.kind()
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} failed: {}", self.op, self.source)
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

/// Listener setup failure. Fatal at startup.
#[derive(Debug)]
pub struct BindError {
    pub addr: SocketAddr,
    pub source: io::Error,
}

impl BindError {
    pub fn is_addr_in_use(&self) -> bool {
        self.source.kind() == io::ErrorKind::AddrInUse
    }
}

impl fmt::Display for BindError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to listen on {}: {}", self.addr, self.source)
    }
}

impl std::error::Error for BindError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

/// Create a bound, listening, non-blocking TCP socket.
pub fn create_listener(addr: SocketAddr, backlog: u32) -> Result<TcpListener, BindError> {
    let bind_err = |source| BindError { addr, source };

    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )
    .map_err(bind_err)?;

    socket.set_reuse_address(true).map_err(bind_err)?;
    socket.set_nonblocking(true).map_err(bind_err)?;
    socket.bind(&addr.into()).map_err(bind_err)?;
    let backlog = i32::try_from(backlog).unwrap_or(i32::MAX);
    socket.listen(backlog).map_err(bind_err)?;

    let listener: std::net::TcpListener = socket.into();
    Ok(TcpListener::from_std(listener))
}

/// Accept one pending connection.
pub fn accept(listener: &TcpListener) -> Result<Io<(TcpStream, SocketAddr)>, TransportError> {
    loop {
        match listener.accept() {
            Ok(pair) => return Ok(Io::Ready(pair)),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Io::WouldBlock),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(TransportError::new(Op::Accept, e)),
        }
    }
}

/// Read whatever is available into `buf`.
pub fn recv(stream: &mut TcpStream, buf: &mut [u8]) -> Result<Io<usize>, TransportError> {
    loop {
        match stream.read(buf) {
            Ok(0) => return Ok(Io::Closed),
            Ok(n) => return Ok(Io::Ready(n)),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Io::WouldBlock),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(TransportError::new(Op::Recv, e)),
        }
    }
}

/// Write as much of `buf` as the kernel takes right now.
///
/// Partial writes are reported as-is; the caller owns the remainder.
pub fn send(stream: &mut TcpStream, buf: &[u8]) -> Result<Io<usize>, TransportError> {
    loop {
        match stream.write(buf) {
            Ok(0) if !buf.is_empty() => {
                return Err(TransportError::new(
                    Op::Send,
                    io::Error::new(io::ErrorKind::WriteZero, "write returned 0"),
                ));
            }
            Ok(n) => return Ok(Io::Ready(n)),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Io::WouldBlock),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(TransportError::new(Op::Send, e)),
        }
    }
}
