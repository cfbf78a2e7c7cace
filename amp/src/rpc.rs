//! Call correlation and command dispatch.
//!
//! An [`Amp`] sits at the end of the framer and box parser for one
//! connection. Outbound calls are tagged with a per-connection counter and
//! parked until a box carrying `_answer` or `_error` with that tag arrives.
//! Inbound `_command` boxes are dispatched through a shared
//! [`CommandRegistry`]; when the box carries `_ask`, the handler's result is
//! sent back as an `_answer` box, or as an `_error` box if it fails.
//!
//! Tags are opaque bytes: whatever the peer put under `_ask` comes back
//! unchanged under `_answer` or `_error`.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::mem;
use std::net::SocketAddr;
use std::rc::{Rc, Weak};

use thiserror::Error;
use weft_defer::{Deferred, Failure, Outcome};
use weft_reactor::{Protocol, TransportHandle};

use crate::command::{Answer, CommandRegistry};
use crate::framer::Framer;
use crate::latin1;
use crate::parser::{BoxParser, BoxReceiver};
use crate::schema::{Record, Schema};
use crate::wirebox::{BoxError, WireBox};

pub const COMMAND: &str = "_command";
pub const ASK: &str = "_ask";
pub const ANSWER: &str = "_answer";
pub const ERROR: &str = "_error";
pub const ERROR_CODE: &str = "_error_code";
pub const ERROR_DESCRIPTION: &str = "_error_description";

/// Error code for a failed command.
pub const UNKNOWN_ERROR_CODE: &str = "UNKNOWN";
/// Error code for a command the peer does not know.
pub const UNHANDLED_ERROR_CODE: &str = "UNHANDLED";

/// The full stack for one connection.
pub type AmpProtocol = Framer<BoxParser<Amp>>;

/// Failure reported by the peer in an `_error` box.
///
/// A handler can also fail with one to choose the code sent back. Marked
/// [`fatal`](Self::fatal), the connection is closed once the `_error` box
/// has been written.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("remote error {code}: {description}")]
pub struct RemoteError {
    pub code: String,
    pub description: String,
    /// Close the connection after reporting. Never set on received errors.
    pub fatal: bool,
}

impl RemoteError {
    pub fn new(code: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            description: description.into(),
            fatal: false,
        }
    }

    #[must_use]
    pub fn fatal(mut self) -> Self {
        self.fatal = true;
        self
    }

    fn from_box(wire: &WireBox) -> Self {
        Self {
            code: wire
                .get_latin1(ERROR_CODE)
                .unwrap_or_else(|| UNKNOWN_ERROR_CODE.to_owned()),
            description: wire
                .get(ERROR_DESCRIPTION)
                .map(|raw| String::from_utf8_lossy(raw).into_owned())
                .unwrap_or_default(),
            fatal: false,
        }
    }
}

fn is_fatal(failure: &Failure) -> bool {
    failure
        .downcast_ref::<RemoteError>()
        .is_some_and(|error| error.fatal)
}

/// Local reasons an outbound call fails.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    #[error("not connected")]
    NotConnected,
    #[error("connection lost before the call was answered")]
    ConnectionLost,
    #[error("command name {0:?} is not Latin-1 text")]
    BadName(String),
    #[error(transparent)]
    Encode(#[from] BoxError),
}

/// Message kind of an inbound box.
#[derive(Debug, PartialEq, Eq)]
enum Incoming {
    Answer { tag: Vec<u8> },
    Error { tag: Vec<u8> },
    Command { name: String, ask: Option<Vec<u8>> },
    Unknown,
}

impl Incoming {
    fn classify(wire: &WireBox) -> Self {
        if let Some(tag) = wire.get(ANSWER) {
            Incoming::Answer { tag: tag.to_vec() }
        } else if let Some(tag) = wire.get(ERROR) {
            Incoming::Error { tag: tag.to_vec() }
        } else if let Some(name) = wire.get_latin1(COMMAND) {
            Incoming::Command {
                name,
                ask: wire.get(ASK).map(<[u8]>::to_vec),
            }
        } else {
            Incoming::Unknown
        }
    }
}

struct PendingCall {
    response: Schema,
    deferred: Deferred<Record>,
}

#[derive(Default)]
struct State {
    transport: Option<TransportHandle>,
    lost: bool,
    last_tag: u64,
    pending: HashMap<Vec<u8>, PendingCall>,
    waiting: Vec<Deferred<()>>,
}

struct Shared {
    registry: Rc<CommandRegistry>,
    state: RefCell<State>,
}

/// The RPC endpoint of one connection.
///
/// `Amp` is a handle: keep a clone to issue calls while another clone sits
/// inside the connection's protocol stack (see [`Amp::protocol`]).
#[derive(Clone)]
pub struct Amp {
    shared: Rc<Shared>,
}

impl Amp {
    pub fn new(registry: Rc<CommandRegistry>) -> Self {
        Self {
            shared: Rc::new(Shared {
                registry,
                state: RefCell::new(State::default()),
            }),
        }
    }

    /// A protocol stack feeding this endpoint, ready for a reactor.
    pub fn protocol(&self) -> AmpProtocol {
        Framer::new(BoxParser::new(self.clone()))
    }

    /// Call `name` on the peer.
    ///
    /// `args` are written under their field names. The returned Deferred
    /// fires with the answer decoded through `response`, or fails with a
    /// [`RemoteError`] or a [`CallError`].
    pub fn call_remote(&self, name: &str, args: &Record, response: Schema) -> Deferred<Record> {
        let Some(transport) = self.transport() else {
            return Deferred::fail(CallError::NotConnected);
        };
        let tag = self.next_tag();
        let bytes = match encode_call(name, Some(tag.as_bytes()), args) {
            Ok(bytes) => bytes,
            Err(err) => return Deferred::fail(err),
        };

        let deferred = Deferred::new();
        self.shared.state.borrow_mut().pending.insert(
            tag.clone().into_bytes(),
            PendingCall {
                response,
                deferred: deferred.clone(),
            },
        );
        tracing::debug!(command = name, %tag, "calling remote command");
        transport.write(&bytes);
        deferred
    }

    /// Send `name` as a free-standing command; no answer comes back.
    pub fn call_remote_no_answer(&self, name: &str, args: &Record) -> Result<(), CallError> {
        let bytes = encode_call(name, None, args)?;
        let transport = self.transport().ok_or(CallError::NotConnected)?;
        tracing::debug!(command = name, "sending free-standing command");
        transport.write(&bytes);
        Ok(())
    }

    /// Encode and write an arbitrary box.
    pub fn send_box(&self, wire: &WireBox) -> Result<(), CallError> {
        let bytes = wire.encode()?;
        let transport = self.transport().ok_or(CallError::NotConnected)?;
        transport.write(&bytes);
        Ok(())
    }

    /// Fires once a transport is attached; fails if the connection is lost
    /// first.
    pub fn when_connected(&self) -> Deferred<()> {
        let mut state = self.shared.state.borrow_mut();
        if state.transport.is_some() {
            return Deferred::succeed(());
        }
        if state.lost {
            return Deferred::fail(CallError::ConnectionLost);
        }
        let waiter = Deferred::new();
        state.waiting.push(waiter.clone());
        waiter
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.shared.state.borrow().transport.is_some()
    }

    /// Calls still waiting for an answer.
    #[must_use]
    pub fn pending_calls(&self) -> usize {
        self.shared.state.borrow().pending.len()
    }

    /// Close the connection once queued writes are flushed.
    pub fn lose_connection(&self) {
        if let Some(transport) = self.transport() {
            transport.lose_connection();
        }
    }

    #[must_use]
    pub fn peer(&self) -> Option<SocketAddr> {
        self.transport()?.peer()
    }

    pub fn registry(&self) -> &CommandRegistry {
        &self.shared.registry
    }

    fn transport(&self) -> Option<TransportHandle> {
        self.shared.state.borrow().transport.clone()
    }

    fn next_tag(&self) -> String {
        let mut state = self.shared.state.borrow_mut();
        state.last_tag += 1;
        format!("{:x}", state.last_tag)
    }

    fn answer_received(&self, tag: &[u8], wire: &WireBox) {
        let Some(call) = self.take_pending(tag) else {
            tracing::warn!(tag = %latin1::decode(tag), "answer for unknown call");
            return;
        };
        let outcome = call.response.read(wire).map_err(Failure::from);
        settle(&call.deferred, outcome);
    }

    fn error_received(&self, tag: &[u8], wire: &WireBox) {
        let Some(call) = self.take_pending(tag) else {
            tracing::warn!(tag = %latin1::decode(tag), "error for unknown call");
            return;
        };
        let error = RemoteError::from_box(wire);
        tracing::debug!(tag = %latin1::decode(tag), code = %error.code, "remote call failed");
        settle(&call.deferred, Err(error.into()));
    }

    fn take_pending(&self, tag: &[u8]) -> Option<PendingCall> {
        self.shared.state.borrow_mut().pending.remove(tag)
    }

    fn command_received(&self, name: &str, ask: Option<Vec<u8>>, wire: &WireBox) {
        let registry = Rc::clone(&self.shared.registry);
        let Some(command) = registry.get(name) else {
            tracing::warn!(command = name, "unhandled command");
            if let Some(tag) = ask {
                self.reply_error(
                    &tag,
                    &RemoteError::new(UNHANDLED_ERROR_CODE, format!("unhandled command: {name}")),
                );
            }
            return;
        };

        tracing::debug!(
            command = name,
            ask = ?ask.as_deref().map(latin1::decode),
            "dispatching command"
        );
        let result = command.invoke(wire);
        let Some(tag) = ask else {
            match result {
                Ok(Answer::Later(deferred)) => {
                    let name = name.to_owned();
                    let endpoint = Rc::downgrade(&self.shared);
                    deferred.then(move |outcome| {
                        if let Err(failure) = outcome {
                            tracing::warn!(command = %name, "command failed: {failure:#}");
                            if is_fatal(&failure) {
                                lose_later(&endpoint);
                            }
                        }
                        Ok(())
                    });
                }
                Ok(Answer::Quit(_)) => self.lose_connection(),
                Ok(Answer::Empty | Answer::Fields(_)) => {}
                Err(failure) => {
                    tracing::warn!(command = name, "command failed: {failure:#}");
                    if is_fatal(&failure) {
                        self.lose_connection();
                    }
                }
            }
            return;
        };

        match result {
            Ok(Answer::Empty) => self.reply(&tag, command.response(), Ok(Record::new())),
            Ok(Answer::Fields(record)) => self.reply(&tag, command.response(), Ok(record)),
            Ok(Answer::Quit(record)) => {
                self.reply(&tag, command.response(), Ok(record));
                tracing::debug!(command = name, "closing after answer");
                self.lose_connection();
            }
            Ok(Answer::Later(deferred)) => {
                let endpoint = Rc::downgrade(&self.shared);
                let response = command.response().clone();
                deferred.then(move |outcome| {
                    reply_later(&endpoint, &tag, &response, outcome);
                    Ok(())
                });
            }
            Err(failure) => {
                tracing::warn!(command = name, "command failed: {failure:#}");
                self.reply(&tag, command.response(), Err(failure));
            }
        }
    }

    fn reply(&self, tag: &[u8], response: &Schema, outcome: Outcome<Record>) {
        let record = match outcome {
            Ok(record) => record,
            Err(failure) => {
                let error = match failure.downcast::<RemoteError>() {
                    Ok(remote) => remote,
                    Err(failure) => RemoteError::new(UNKNOWN_ERROR_CODE, format!("{failure:#}")),
                };
                self.reply_error(tag, &error);
                if error.fatal {
                    tracing::warn!(code = %error.code, "fatal command error, closing connection");
                    self.lose_connection();
                }
                return;
            }
        };

        let mut wire = WireBox::new();
        wire.put(ANSWER, tag);
        response.extract(&record, &mut wire);
        match self.send_box(&wire) {
            Ok(()) => {}
            Err(CallError::Encode(err)) => {
                tracing::warn!(tag = %latin1::decode(tag), "answer could not be encoded: {err}");
                self.reply_error(
                    tag,
                    &RemoteError::new(UNKNOWN_ERROR_CODE, format!("answer could not be encoded: {err}")),
                );
            }
            Err(err) => tracing::debug!(tag = %latin1::decode(tag), "answer dropped: {err}"),
        }
    }

    fn reply_error(&self, tag: &[u8], error: &RemoteError) {
        let mut wire = WireBox::new();
        wire.put(ERROR, tag)
            .put(ERROR_CODE, &error.code)
            .put(ERROR_DESCRIPTION, &error.description);
        if let Err(err) = self.send_box(&wire) {
            tracing::debug!(tag = %latin1::decode(tag), "error reply dropped: {err}");
        }
    }
}

fn encode_call(name: &str, tag: Option<&[u8]>, args: &Record) -> Result<Vec<u8>, CallError> {
    let name_bytes = latin1::encode(name).ok_or_else(|| CallError::BadName(name.to_owned()))?;
    let mut wire = WireBox::new();
    wire.put(COMMAND, name_bytes);
    if let Some(tag) = tag {
        wire.put(ASK, tag);
    }
    args.write_to(&mut wire);
    Ok(wire.encode()?)
}

fn reply_later(endpoint: &Weak<Shared>, tag: &[u8], response: &Schema, outcome: Outcome<Record>) {
    match endpoint.upgrade() {
        Some(shared) => Amp { shared }.reply(tag, response, outcome),
        None => tracing::debug!(
            tag = %latin1::decode(tag),
            "endpoint gone before the answer was ready"
        ),
    }
}

fn lose_later(endpoint: &Weak<Shared>) {
    if let Some(shared) = endpoint.upgrade() {
        Amp { shared }.lose_connection();
    }
}

/// Fire `deferred`, logging if something else already did.
fn settle<T: 'static>(deferred: &Deferred<T>, outcome: Outcome<T>) {
    if let Err(err) = deferred.fire(outcome) {
        tracing::warn!("{err}");
    }
}

impl BoxReceiver for Amp {
    fn box_received(&mut self, wire: WireBox) -> anyhow::Result<()> {
        match Incoming::classify(&wire) {
            Incoming::Answer { tag } => self.answer_received(&tag, &wire),
            Incoming::Error { tag } => self.error_received(&tag, &wire),
            Incoming::Command { name, ask } => self.command_received(&name, ask, &wire),
            Incoming::Unknown => {
                anyhow::bail!("box has no {ANSWER}, {ERROR} or {COMMAND} key: {wire}");
            }
        }
        Ok(())
    }

    fn transport_attached(&mut self, transport: TransportHandle) {
        let waiting = {
            let mut state = self.shared.state.borrow_mut();
            state.transport = Some(transport);
            state.lost = false;
            mem::take(&mut state.waiting)
        };
        for waiter in waiting {
            settle(&waiter, Ok(()));
        }
    }

    fn transport_lost(&mut self, reason: Option<&io::Error>) {
        let (pending, waiting) = {
            let mut state = self.shared.state.borrow_mut();
            state.transport = None;
            state.lost = true;
            (mem::take(&mut state.pending), mem::take(&mut state.waiting))
        };
        match reason {
            Some(err) => tracing::debug!(pending = pending.len(), "connection lost: {err}"),
            None => tracing::debug!(pending = pending.len(), "connection closed"),
        }
        for (_, call) in pending {
            settle(&call.deferred, Err(CallError::ConnectionLost.into()));
        }
        for waiter in waiting {
            settle(&waiter, Err(CallError::ConnectionLost.into()));
        }
    }
}

/// A factory giving each accepted connection its own [`Amp`] over `registry`.
pub fn factory(registry: Rc<CommandRegistry>) -> impl FnMut(SocketAddr) -> Box<dyn Protocol> {
    move |peer: SocketAddr| -> Box<dyn Protocol> {
        tracing::debug!(%peer, "new AMP connection");
        Box::new(Amp::new(Rc::clone(&registry)).protocol())
    }
}
