//! The AMP box protocol.
//!
//! Layers, bottom up:
//!
//! - [`Framer`]: `u16` length-prefixed frames to hunks;
//! - [`BoxParser`]: hunks to [`WireBox`]es, ended by an empty frame;
//! - [`Amp`]: boxes to correlated calls (`_ask`/`_answer`/`_error`) and
//!   dispatched commands (`_command`) from a [`CommandRegistry`].
//!
//! [`Schema`] and [`Record`] move typed values in and out of boxes.
//! [`BoxReader`] and [`BoxWriter`] are blocking equivalents for code that
//! does not run inside a reactor.

mod codec;
mod command;
mod framer;
pub mod latin1;
mod parser;
mod rpc;
mod schema;
mod wirebox;

pub use codec::{BoxReader, BoxWriter};
pub use command::{
    Answer, Command, CommandRegistry, FromValue, Handler, IntoAnswer, Quit, RegistrationError,
};
pub use framer::{Framer, FrameError, HunkReceiver, MAX_FRAME_LEN, frame};
pub use parser::{BoxParser, BoxReceiver, ParsedBoxes, parse_boxes};
pub use rpc::{
    ANSWER, ASK, Amp, AmpProtocol, COMMAND, CallError, ERROR, ERROR_CODE, ERROR_DESCRIPTION,
    RemoteError, UNHANDLED_ERROR_CODE, UNKNOWN_ERROR_CODE, factory,
};
pub use schema::{DecodeError, FieldKind, Record, Schema, Value};
pub use wirebox::{BoxError, MAX_KEY_LEN, WireBox};
