//! In-memory transport for driving protocols without sockets.

use std::cell::{Cell, RefCell};
use std::mem;
use std::rc::Rc;

use crate::interfaces::Transport;

/// Records every write; remembers whether a disconnect was requested.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    written: RefCell<Vec<u8>>,
    disconnecting: Cell<bool>,
}

impl RecordingTransport {
    #[must_use]
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    /// Everything written so far.
    #[must_use]
    pub fn value(&self) -> Vec<u8> {
        self.written.borrow().clone()
    }

    /// Everything written so far, clearing the record.
    pub fn take(&self) -> Vec<u8> {
        mem::take(&mut *self.written.borrow_mut())
    }

    #[must_use]
    pub fn is_disconnecting(&self) -> bool {
        self.disconnecting.get()
    }
}

impl Transport for RecordingTransport {
    fn write(&self, data: &[u8]) {
        if self.disconnecting.get() {
            return;
        }
        self.written.borrow_mut().extend_from_slice(data);
    }

    fn lose_connection(&self) {
        self.disconnecting.set(true);
    }
}
