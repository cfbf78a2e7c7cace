//! 16-bit length-prefixed framing.
//!
//! Every frame is a big-endian `u16` length followed by that many payload
//! bytes. The payload of one frame is a *hunk*.

use std::io;

use thiserror::Error;
use weft_reactor::{Protocol, TransportHandle};

/// Largest payload a single frame can carry.
pub const MAX_FRAME_LEN: usize = u16::MAX as usize;

const PREFIX_LEN: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame payload of {len} bytes exceeds the {MAX_FRAME_LEN} byte limit")]
    TooLong { len: usize },
}

/// Encode one frame.
pub fn frame(payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    let mut out = Vec::with_capacity(PREFIX_LEN + payload.len());
    write_frame(&mut out, payload)?;
    Ok(out)
}

/// Append one frame to `out`.
pub(crate) fn write_frame(out: &mut Vec<u8>, payload: &[u8]) -> Result<(), FrameError> {
    let len = u16::try_from(payload.len()).map_err(|_| FrameError::TooLong {
        len: payload.len(),
    })?;
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(payload);
    Ok(())
}

/// Split the first complete frame off `bytes`.
///
/// Returns the hunk and the number of bytes the frame occupied, or `None` if
/// `bytes` does not yet hold a whole frame.
pub(crate) fn split_frame(bytes: &[u8]) -> Option<(&[u8], usize)> {
    let prefix: [u8; PREFIX_LEN] = bytes.get(..PREFIX_LEN)?.try_into().ok()?;
    let end = PREFIX_LEN + usize::from(u16::from_be_bytes(prefix));
    let hunk = bytes.get(PREFIX_LEN..end)?;
    Some((hunk, end))
}

/// The stage after the framer.
pub trait HunkReceiver {
    /// One complete frame payload. Errors are logged per hunk.
    fn hunk_received(&mut self, hunk: &[u8]) -> anyhow::Result<()>;

    fn transport_attached(&mut self, transport: TransportHandle) {
        let _ = transport;
    }

    fn transport_lost(&mut self, reason: Option<&io::Error>) {
        let _ = reason;
    }
}

/// Protocol that reassembles a fragmented stream into hunks.
#[derive(Debug)]
pub struct Framer<H> {
    buffer: Vec<u8>,
    receiver: H,
}

impl<H: HunkReceiver> Framer<H> {
    pub fn new(receiver: H) -> Self {
        Self {
            buffer: Vec::new(),
            receiver,
        }
    }

    /// Append stream bytes and deliver every hunk they complete.
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);

        let mut consumed = 0;
        while let Some((hunk, used)) = split_frame(&self.buffer[consumed..]) {
            tracing::trace!(len = hunk.len(), "hunk");
            if let Err(err) = self.receiver.hunk_received(hunk) {
                tracing::warn!("failed to process hunk: {err:#}");
            }
            consumed += used;
        }
        self.buffer.drain(..consumed);
    }

    /// Bytes received but not yet part of a complete frame.
    #[must_use]
    pub fn buffered(&self) -> &[u8] {
        &self.buffer
    }

    pub fn receiver(&self) -> &H {
        &self.receiver
    }

    pub fn receiver_mut(&mut self) -> &mut H {
        &mut self.receiver
    }
}

impl<H: HunkReceiver> Protocol for Framer<H> {
    fn make_connection(&mut self, transport: TransportHandle) {
        self.receiver.transport_attached(transport);
        self.connection_made();
    }

    fn data_received(&mut self, data: &[u8]) -> anyhow::Result<()> {
        self.feed(data);
        Ok(())
    }

    fn connection_lost(&mut self, reason: Option<&io::Error>) {
        if !self.buffer.is_empty() {
            tracing::debug!(bytes = self.buffer.len(), "discarding partial frame");
            self.buffer.clear();
        }
        self.receiver.transport_lost(reason);
    }
}
