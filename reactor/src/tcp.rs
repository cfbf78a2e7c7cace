//! TCP connections and their transports.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::mem;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::rc::Rc;

use crate::interfaces::{Protocol, ProtocolFactory, Transport, TransportHandle};

/// Upper bound on a single read.
pub(crate) const READ_BUFFER_BYTES: usize = 64 * 1024;

/// Outbound queue shared between a connection and its transport.
#[derive(Debug, Default)]
pub(crate) struct Outbound {
    chunks: VecDeque<Vec<u8>>,
    /// Bytes of the head chunk already written.
    offset: usize,
    disconnecting: bool,
    closed: bool,
}

impl Outbound {
    fn wants_write(&self) -> bool {
        !self.chunks.is_empty() || self.disconnecting
    }
}

/// The transport a reactor-managed connection hands to its protocol.
pub(crate) struct TcpTransport {
    outbound: Rc<RefCell<Outbound>>,
    peer: SocketAddr,
}

impl Transport for TcpTransport {
    fn write(&self, data: &[u8]) {
        let mut outbound = self.outbound.borrow_mut();
        if outbound.closed || outbound.disconnecting {
            tracing::debug!(peer = %self.peer, bytes = data.len(), "dropping write after disconnect");
            return;
        }
        if !data.is_empty() {
            outbound.chunks.push_back(data.to_vec());
        }
    }

    fn lose_connection(&self) {
        self.outbound.borrow_mut().disconnecting = true;
    }

    fn peer(&self) -> Option<SocketAddr> {
        Some(self.peer)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    /// Outbound connect issued; protocol not yet attached.
    Connecting,
    Connected,
}

/// Result of draining the outbound queue.
pub(crate) enum Flush {
    /// The socket stopped accepting bytes; more remain queued.
    Pending,
    Drained,
    /// Queue empty and a disconnect was requested.
    Close,
    Failed(io::Error),
}

/// Result of one read.
pub(crate) enum Received {
    /// Bytes were delivered to the protocol.
    Delivered,
    /// Nothing to read right now.
    Idle,
    Eof,
    Failed(io::Error),
}

pub(crate) struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    phase: Cell<Phase>,
    protocol: RefCell<Box<dyn Protocol>>,
    outbound: Rc<RefCell<Outbound>>,
    read_buffer: RefCell<Box<[u8]>>,
    /// A connect that failed before the socket was ever polled.
    connect_error: RefCell<Option<io::Error>>,
}

impl Connection {
    pub(crate) fn new(
        stream: TcpStream,
        peer: SocketAddr,
        protocol: Box<dyn Protocol>,
        phase: Phase,
    ) -> Self {
        Self {
            stream,
            peer,
            phase: Cell::new(phase),
            protocol: RefCell::new(protocol),
            outbound: Rc::new(RefCell::new(Outbound::default())),
            read_buffer: RefCell::new(vec![0; READ_BUFFER_BYTES].into_boxed_slice()),
            connect_error: RefCell::new(None),
        }
    }

    /// A connection whose connect already failed; the error is reported by
    /// the first [`take_error`](Self::take_error).
    pub(crate) fn failed(
        stream: TcpStream,
        peer: SocketAddr,
        protocol: Box<dyn Protocol>,
        error: io::Error,
    ) -> Self {
        let conn = Self::new(stream, peer, protocol, Phase::Connecting);
        *conn.connect_error.borrow_mut() = Some(error);
        conn
    }

    pub(crate) fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub(crate) fn phase(&self) -> Phase {
        self.phase.get()
    }

    pub(crate) fn raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    pub(crate) fn wants_write(&self) -> bool {
        self.phase.get() == Phase::Connecting || self.outbound.borrow().wants_write()
    }

    /// Connected and not yet asked to disconnect.
    ///
    /// Once a disconnect is pending only the outbound queue matters, so the
    /// protocol stops seeing inbound bytes.
    pub(crate) fn is_reading(&self) -> bool {
        if self.phase.get() != Phase::Connected {
            return false;
        }
        let outbound = self.outbound.borrow();
        !outbound.disconnecting && !outbound.closed
    }

    /// Attach a transport to the protocol and announce the connection.
    pub(crate) fn start(&self) {
        self.phase.set(Phase::Connected);
        let transport: TransportHandle = Rc::new(TcpTransport {
            outbound: Rc::clone(&self.outbound),
            peer: self.peer,
        });
        self.protocol.borrow_mut().make_connection(transport);
    }

    /// Error left by the connect, if any.
    pub(crate) fn take_error(&self) -> io::Result<Option<io::Error>> {
        if let Some(err) = self.connect_error.borrow_mut().take() {
            return Ok(Some(err));
        }
        self.stream.take_error()
    }

    /// Write queued chunks, oldest first, until the socket pushes back.
    pub(crate) fn flush(&self) -> Flush {
        let mut outbound = self.outbound.borrow_mut();
        loop {
            let offset = outbound.offset;
            let Some(chunk) = outbound.chunks.front() else {
                break;
            };
            let remaining = chunk.len() - offset;
            match (&self.stream).write(&chunk[offset..]) {
                Ok(0) => {
                    return Flush::Failed(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "socket accepted no bytes",
                    ));
                }
                Ok(written) if written == remaining => {
                    outbound.chunks.pop_front();
                    outbound.offset = 0;
                }
                Ok(written) => {
                    outbound.offset += written;
                    return Flush::Pending;
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Flush::Pending,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Flush::Failed(err),
            }
        }
        if outbound.disconnecting {
            Flush::Close
        } else {
            Flush::Drained
        }
    }

    /// Read once into the connection's buffer and hand the bytes to the
    /// protocol.
    pub(crate) fn read(&self) -> Received {
        let mut buffer = self.read_buffer.borrow_mut();
        let count = match (&self.stream).read(&mut buffer) {
            Ok(0) => return Received::Eof,
            Ok(count) => count,
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                return Received::Idle;
            }
            Err(err) => return Received::Failed(err),
        };

        let delivered = self.protocol.borrow_mut().data_received(&buffer[..count]);
        if let Err(err) = delivered {
            tracing::warn!(peer = %self.peer, "protocol failed on received data: {err:#}");
            self.outbound.borrow_mut().disconnecting = true;
        }
        Received::Delivered
    }

    /// Shut the socket down and tell the protocol. Idempotent.
    pub(crate) fn close(&self, reason: Option<io::Error>) {
        {
            let mut outbound = self.outbound.borrow_mut();
            if outbound.closed {
                return;
            }
            outbound.closed = true;
            outbound.chunks.clear();
        }
        let _ = self.stream.shutdown(Shutdown::Both);
        match &reason {
            Some(err) => tracing::debug!(peer = %self.peer, "connection lost: {err}"),
            None => tracing::debug!(peer = %self.peer, "connection closed"),
        }
        self.protocol.borrow_mut().connection_lost(reason.as_ref());
    }
}

/// Open a non-blocking socket and start connecting it to `addr`.
///
/// A connect that fails straight away (refused on loopback, unreachable) is
/// returned alongside the socket rather than as `Err`, so it can still reach
/// the protocol as a lost connection. `Err` means no socket could be set up.
pub(crate) fn start_connect(addr: SocketAddr) -> io::Result<(TcpStream, Option<io::Error>)> {
    let domain = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };
    // SAFETY: plain syscall with integer arguments; the result is checked.
    let fd = unsafe { libc::socket(domain, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: `fd` was just returned by socket(2) and has no other owner.
    let owned = unsafe { OwnedFd::from_raw_fd(fd) };
    // SAFETY: `fd` stays open for the call; `owned` keeps it alive.
    if unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }
    let stream = TcpStream::from(owned);
    stream.set_nonblocking(true)?;

    let (storage, len) = socket_address(addr);
    // SAFETY: `storage` holds a sockaddr of `addr`'s family, `len` is that
    // family's size, and both outlive the call.
    let rc = unsafe {
        libc::connect(
            stream.as_raw_fd(),
            (&raw const storage).cast::<libc::sockaddr>(),
            len,
        )
    };
    if rc == 0 {
        return Ok((stream, None));
    }
    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::EINPROGRESS | libc::EINTR) => Ok((stream, None)),
        _ => Ok((stream, Some(err))),
    }
}

fn socket_address(addr: SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    // SAFETY: all-zero bytes are a valid `sockaddr_storage`.
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(v4) => {
            // SAFETY: `sockaddr_storage` is sized and aligned for every
            // socket address family, including `sockaddr_in`.
            let sin = unsafe { &mut *(&raw mut storage).cast::<libc::sockaddr_in>() };
            sin.sin_family = libc::AF_INET as libc::sa_family_t;
            sin.sin_port = v4.port().to_be();
            sin.sin_addr = libc::in_addr {
                s_addr: u32::from_ne_bytes(v4.ip().octets()),
            };
            size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(v6) => {
            // SAFETY: as above, for `sockaddr_in6`.
            let sin6 = unsafe { &mut *(&raw mut storage).cast::<libc::sockaddr_in6>() };
            sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sin6.sin6_port = v6.port().to_be();
            sin6.sin6_flowinfo = v6.flowinfo();
            sin6.sin6_addr = libc::in6_addr {
                s6_addr: v6.ip().octets(),
            };
            sin6.sin6_scope_id = v6.scope_id();
            size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as libc::socklen_t)
}

pub(crate) struct Listener {
    socket: TcpListener,
    local_addr: SocketAddr,
    factory: RefCell<Box<dyn ProtocolFactory>>,
}

impl Listener {
    pub(crate) fn new(socket: TcpListener, factory: Box<dyn ProtocolFactory>) -> io::Result<Self> {
        socket.set_nonblocking(true)?;
        let local_addr = socket.local_addr()?;
        Ok(Self {
            socket,
            local_addr,
            factory: RefCell::new(factory),
        })
    }

    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub(crate) fn raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    /// Accept one pending connection and build its protocol.
    ///
    /// `Ok(None)` once the backlog is empty.
    pub(crate) fn accept(&self) -> io::Result<Option<Connection>> {
        loop {
            match self.socket.accept() {
                Ok((stream, peer)) => {
                    stream.set_nonblocking(true)?;
                    let _ = stream.set_nodelay(true);
                    let protocol = self.factory.borrow_mut().build_protocol(peer);
                    return Ok(Some(Connection::new(stream, peer, protocol, Phase::Connected)));
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err),
            }
        }
    }
}
