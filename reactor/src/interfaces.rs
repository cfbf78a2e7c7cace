//! The capability pair between the reactor and application code.
//!
//! A [`Transport`] is what a protocol uses to talk back to its peer. A
//! [`Protocol`] is what the reactor drives when bytes arrive. Neither side
//! knows about sockets, so every protocol layer can be exercised against an
//! in-memory transport (see [`crate::testing::RecordingTransport`]).

use std::io;
use std::net::SocketAddr;
use std::rc::Rc;

/// Write/disconnect capability handed to a protocol.
pub trait Transport {
    /// Queue bytes for the peer. Writes are delivered in call order.
    fn write(&self, data: &[u8]);

    /// Close once every queued write has been flushed.
    fn lose_connection(&self);

    fn peer(&self) -> Option<SocketAddr> {
        None
    }
}

pub type TransportHandle = Rc<dyn Transport>;

/// Application logic bound to one connection for its whole lifetime.
pub trait Protocol {
    /// Attach the transport. Implementations store it and then call
    /// [`connection_made`](Self::connection_made).
    fn make_connection(&mut self, transport: TransportHandle);

    fn connection_made(&mut self) {}

    /// Bytes exactly as read from the peer.
    ///
    /// An `Err` is logged by the reactor and the connection is dropped with
    /// [`Transport::lose_connection`].
    fn data_received(&mut self, data: &[u8]) -> anyhow::Result<()>;

    /// The connection is gone. `reason` is `None` for a clean close.
    fn connection_lost(&mut self, reason: Option<&io::Error>) {
        let _ = reason;
    }
}

/// Builds one protocol per accepted connection.
pub trait ProtocolFactory {
    fn build_protocol(&mut self, peer: SocketAddr) -> Box<dyn Protocol>;
}

impl<F> ProtocolFactory for F
where
    F: FnMut(SocketAddr) -> Box<dyn Protocol>,
{
    fn build_protocol(&mut self, peer: SocketAddr) -> Box<dyn Protocol> {
        self(peer)
    }
}
