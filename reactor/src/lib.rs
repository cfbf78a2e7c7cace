//! Single-threaded event loop for weft.
//!
//! The [`Reactor`] multiplexes listening sockets, connections and timers over
//! `poll(2)`. Application code plugs in through the [`Protocol`] and
//! [`ProtocolFactory`] traits and talks back to its peer through a
//! [`Transport`]. Everything runs on the thread that calls [`Reactor::run`].

mod clock;
mod interfaces;
mod reactor;
mod tcp;
pub mod testing;

pub use clock::{DelayedCall, DueCall, TimerQueue};
pub use interfaces::{Protocol, ProtocolFactory, Transport, TransportHandle};
pub use reactor::{ListeningPort, Reactor};
