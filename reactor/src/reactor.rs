//! The event loop.
//!
//! # Iteration
//!
//! ```text
//! run due timers -> compute poll timeout -> poll(2) -> per ready fd:
//!     write -> read -> accept -> connect
//! ```
//!
//! No `RefCell` borrow of reactor state is held while protocol code or a
//! timer action runs, so both may freely schedule calls, write, or stop the
//! reactor.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::io;
use std::net::{SocketAddr, TcpListener, ToSocketAddrs};
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use libc::{c_int, c_short, nfds_t, pollfd};

use crate::clock::{DelayedCall, TimerQueue};
use crate::interfaces::{Protocol, ProtocolFactory};
use crate::tcp::{self, Connection, Flush, Listener, Phase, Received};

type Token = u64;

enum Source {
    Listener(Rc<Listener>),
    Connection(Rc<Connection>),
}

impl Source {
    fn poll_entry(&self) -> pollfd {
        let (fd, events) = match self {
            Source::Listener(listener) => (listener.raw_fd(), libc::POLLIN),
            Source::Connection(conn) => {
                let mut events = 0;
                if conn.is_reading() {
                    events |= libc::POLLIN;
                }
                if conn.wants_write() {
                    events |= libc::POLLOUT;
                }
                (conn.raw_fd(), events)
            }
        };
        pollfd {
            fd,
            events,
            revents: 0,
        }
    }
}

#[derive(Default)]
struct State {
    running: bool,
    timers: TimerQueue,
    sources: BTreeMap<Token, Source>,
    next_token: Token,
}

impl State {
    fn register(&mut self, source: Source) -> Token {
        let token = self.next_token;
        self.next_token += 1;
        self.sources.insert(token, source);
        token
    }
}

/// A single-threaded readiness reactor.
///
/// `Reactor` is a handle; clones drive the same loop. Construct one in
/// `main` and pass it to whatever needs timers or sockets.
#[derive(Clone, Default)]
pub struct Reactor {
    state: Rc<RefCell<State>>,
}

impl Reactor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Listen on every interface at `port`.
    pub fn listen(
        &self,
        port: u16,
        factory: impl ProtocolFactory + 'static,
    ) -> io::Result<ListeningPort> {
        self.listen_on(SocketAddr::from(([0, 0, 0, 0], port)), factory)
    }

    /// Listen on an explicit address. Port `0` picks an ephemeral port.
    pub fn listen_on(
        &self,
        addr: impl ToSocketAddrs,
        factory: impl ProtocolFactory + 'static,
    ) -> io::Result<ListeningPort> {
        let listener = Listener::new(TcpListener::bind(addr)?, Box::new(factory))?;
        let local_addr = listener.local_addr();
        let token = self
            .state
            .borrow_mut()
            .register(Source::Listener(Rc::new(listener)));
        tracing::info!(addr = %local_addr, "listening");
        Ok(ListeningPort {
            token,
            local_addr,
            state: Rc::downgrade(&self.state),
        })
    }

    /// Start connecting to `addr` and bind `protocol` to the connection.
    ///
    /// Returns as soon as the connect is issued. Once the handshake finishes
    /// the protocol sees `make_connection`; if it fails the protocol sees only
    /// `connection_lost` with the reason. `Err` is reserved for failures that
    /// leave no connection to report on, such as an unresolvable address.
    pub fn connect_tcp(
        &self,
        addr: impl ToSocketAddrs,
        protocol: Box<dyn Protocol>,
    ) -> io::Result<SocketAddr> {
        let peer = addr.to_socket_addrs()?.next().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "no address to connect to")
        })?;
        let (stream, refused) = tcp::start_connect(peer)?;
        let _ = stream.set_nodelay(true);

        let Some(err) = refused else {
            let conn = Connection::new(stream, peer, protocol, Phase::Connecting);
            self.state
                .borrow_mut()
                .register(Source::Connection(Rc::new(conn)));
            tracing::debug!(%peer, "connecting");
            return Ok(peer);
        };

        let conn = Connection::failed(stream, peer, protocol, err);
        let token = self
            .state
            .borrow_mut()
            .register(Source::Connection(Rc::new(conn)));
        let reactor = self.clone();
        self.call_later(Duration::ZERO, move || reactor.abort_connect(token));
        Ok(peer)
    }

    /// Run `action` once, no earlier than `delay` from now.
    pub fn call_later(&self, delay: Duration, action: impl FnOnce() + 'static) -> DelayedCall {
        let deadline = Instant::now() + delay;
        self.state.borrow_mut().timers.schedule(deadline, action)
    }

    /// Loop until [`stop`](Self::stop) is called.
    ///
    /// Errors from individual connections never end the loop; only a failing
    /// `poll(2)` does.
    pub fn run(&self) -> io::Result<()> {
        self.state.borrow_mut().running = true;
        tracing::debug!("reactor running");
        while self.is_running() {
            self.iterate()?;
        }
        tracing::debug!("reactor stopped");
        Ok(())
    }

    /// Leave [`run`](Self::run) after the current iteration.
    pub fn stop(&self) {
        self.state.borrow_mut().running = false;
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state.borrow().running
    }

    /// One pass: due timers, one readiness wait, readiness handling.
    pub fn iterate(&self) -> io::Result<()> {
        self.run_due_calls();
        if !self.is_running() {
            return Ok(());
        }

        let timeout = self.poll_timeout();
        let (tokens, mut fds): (Vec<Token>, Vec<pollfd>) = self
            .state
            .borrow()
            .sources
            .iter()
            .map(|(token, source)| (*token, source.poll_entry()))
            .unzip();

        if poll(&mut fds, timeout)? == 0 {
            return Ok(());
        }

        for (token, fd) in tokens.into_iter().zip(fds) {
            if fd.revents != 0 {
                self.dispatch(token, fd.revents);
            }
        }
        Ok(())
    }

    fn run_due_calls(&self) {
        let due = self.state.borrow_mut().timers.take_due(Instant::now());
        for call in due {
            call.run();
        }
    }

    /// Milliseconds until the next timer, rounded up; `-1` blocks.
    fn poll_timeout(&self) -> c_int {
        let Some(deadline) = self.state.borrow_mut().timers.next_deadline() else {
            return -1;
        };
        let wait = deadline.saturating_duration_since(Instant::now());
        let millis = wait.as_micros().div_ceil(1000);
        c_int::try_from(millis).unwrap_or(c_int::MAX)
    }

    fn dispatch(&self, token: Token, revents: c_short) {
        let source = match self.state.borrow().sources.get(&token) {
            Some(Source::Listener(listener)) => Source::Listener(Rc::clone(listener)),
            Some(Source::Connection(conn)) => Source::Connection(Rc::clone(conn)),
            None => return,
        };

        match source {
            Source::Connection(conn) => self.handle_connection(token, &conn, revents),
            Source::Listener(listener) => self.handle_accept(&listener),
        }
    }

    fn handle_connection(&self, token: Token, conn: &Rc<Connection>, revents: c_short) {
        if revents & libc::POLLNVAL != 0 {
            self.drop_connection(
                token,
                conn,
                Some(io::Error::other("descriptor is no longer valid")),
            );
            return;
        }

        if conn.phase() == Phase::Connected {
            if revents & libc::POLLOUT != 0 {
                match conn.flush() {
                    Flush::Pending | Flush::Drained => {}
                    Flush::Close => {
                        self.drop_connection(token, conn, None);
                        return;
                    }
                    Flush::Failed(err) => {
                        self.drop_connection(token, conn, Some(err));
                        return;
                    }
                }
            }

            let hangup = revents & (libc::POLLHUP | libc::POLLERR) != 0;
            if conn.is_reading() {
                if hangup || revents & libc::POLLIN != 0 {
                    match conn.read() {
                        Received::Delivered | Received::Idle => {}
                        Received::Eof => self.drop_connection(token, conn, None),
                        Received::Failed(err) => self.drop_connection(token, conn, Some(err)),
                    }
                }
            } else if hangup && revents & libc::POLLOUT == 0 {
                // Disconnecting and the peer is gone; nothing left to flush to.
                self.drop_connection(token, conn, None);
            }
            return;
        }

        self.finish_connect(token, conn, revents);
    }

    fn finish_connect(&self, token: Token, conn: &Rc<Connection>, revents: c_short) {
        let failure = match conn.take_error() {
            Ok(Some(err)) | Err(err) => Some(err),
            Ok(None) if revents & (libc::POLLERR | libc::POLLHUP) != 0 => Some(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "connection failed",
            )),
            Ok(None) => None,
        };
        match failure {
            Some(err) => {
                tracing::warn!(peer = %conn.peer(), "connect failed: {err}");
                self.drop_connection(token, conn, Some(err));
            }
            None => {
                tracing::debug!(peer = %conn.peer(), "connected");
                conn.start();
            }
        }
    }

    /// Report a connect that failed before the socket was ever polled.
    fn abort_connect(&self, token: Token) {
        let conn = match self.state.borrow().sources.get(&token) {
            Some(Source::Connection(conn)) => Rc::clone(conn),
            _ => return,
        };
        self.finish_connect(token, &conn, 0);
    }

    fn handle_accept(&self, listener: &Rc<Listener>) {
        loop {
            match listener.accept() {
                Ok(Some(conn)) => {
                    let conn = Rc::new(conn);
                    tracing::debug!(peer = %conn.peer(), "accepted connection");
                    self.state
                        .borrow_mut()
                        .register(Source::Connection(Rc::clone(&conn)));
                    conn.start();
                }
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!(addr = %listener.local_addr(), "accept failed: {err}");
                    break;
                }
            }
        }
    }

    fn drop_connection(&self, token: Token, conn: &Rc<Connection>, reason: Option<io::Error>) {
        self.state.borrow_mut().sources.remove(&token);
        conn.close(reason);
    }
}

/// Wait for readiness. An interrupted wait reports no events.
fn poll(fds: &mut [pollfd], timeout_ms: c_int) -> io::Result<usize> {
    // SAFETY: `fds` is a live, exclusively borrowed slice of `pollfd` for the
    // whole call, and its length is passed alongside the pointer.
    let ready = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as nfds_t, timeout_ms) };
    if ready >= 0 {
        return Ok(ready as usize);
    }
    let err = io::Error::last_os_error();
    if err.kind() == io::ErrorKind::Interrupted {
        Ok(0)
    } else {
        Err(err)
    }
}

/// A listening socket registered with a reactor.
#[derive(Debug)]
pub struct ListeningPort {
    token: Token,
    local_addr: SocketAddr,
    state: Weak<RefCell<State>>,
}

impl ListeningPort {
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    #[must_use]
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Stop accepting. Established connections are unaffected.
    ///
    /// Returns `false` if already stopped or the reactor is gone.
    pub fn stop_listening(&self) -> bool {
        let Some(state) = self.state.upgrade() else {
            return false;
        };
        let removed = state.borrow_mut().sources.remove(&self.token).is_some();
        if removed {
            tracing::info!(addr = %self.local_addr, "stopped listening");
        }
        removed
    }
}
