//! Hunks to boxes.

use std::io;
use std::mem;

use weft_reactor::TransportHandle;

use crate::framer::{HunkReceiver, split_frame};
use crate::wirebox::WireBox;

/// The stage after the box parser.
pub trait BoxReceiver {
    fn box_received(&mut self, wire: WireBox) -> anyhow::Result<()>;

    fn transport_attached(&mut self, transport: TransportHandle) {
        let _ = transport;
    }

    fn transport_lost(&mut self, reason: Option<&io::Error>) {
        let _ = reason;
    }
}

#[derive(Debug, Default)]
enum State {
    #[default]
    Init,
    Key,
    Value(Vec<u8>),
}

/// Key/value/terminator state machine over a hunk sequence.
#[derive(Debug, Default)]
pub(crate) struct Assembler {
    state: State,
    current: WireBox,
}

impl Assembler {
    /// Consume one hunk; returns the box it completes, if any.
    pub(crate) fn push(&mut self, hunk: &[u8]) -> Option<WireBox> {
        match mem::take(&mut self.state) {
            State::Init => {
                self.current = WireBox::new();
                self.key(hunk)
            }
            State::Key => self.key(hunk),
            State::Value(key) => {
                self.current.put(key, hunk);
                self.state = State::Key;
                None
            }
        }
    }

    fn key(&mut self, hunk: &[u8]) -> Option<WireBox> {
        if hunk.is_empty() {
            let complete = mem::take(&mut self.current);
            if complete.is_empty() {
                tracing::warn!("received an empty box");
            }
            self.state = State::Init;
            return Some(complete);
        }
        self.state = State::Value(hunk.to_vec());
        None
    }

    /// No box is partially assembled.
    pub(crate) fn is_idle(&self) -> bool {
        matches!(self.state, State::Init)
    }
}

/// Turns hunks into boxes and hands each complete box on.
#[derive(Debug)]
pub struct BoxParser<R> {
    assembler: Assembler,
    receiver: R,
}

impl<R: BoxReceiver> BoxParser<R> {
    pub fn new(receiver: R) -> Self {
        Self {
            assembler: Assembler::default(),
            receiver,
        }
    }

    pub fn receiver(&self) -> &R {
        &self.receiver
    }

    pub fn receiver_mut(&mut self) -> &mut R {
        &mut self.receiver
    }
}

impl<R: BoxReceiver> HunkReceiver for BoxParser<R> {
    fn hunk_received(&mut self, hunk: &[u8]) -> anyhow::Result<()> {
        match self.assembler.push(hunk) {
            Some(wire) => self.receiver.box_received(wire),
            None => Ok(()),
        }
    }

    fn transport_attached(&mut self, transport: TransportHandle) {
        self.receiver.transport_attached(transport);
    }

    fn transport_lost(&mut self, reason: Option<&io::Error>) {
        if !self.assembler.is_idle() {
            tracing::debug!("connection lost mid-box");
            self.assembler = Assembler::default();
        }
        self.receiver.transport_lost(reason);
    }
}

/// Result of [`parse_boxes`].
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ParsedBoxes {
    pub boxes: Vec<WireBox>,
    /// Bytes after the last complete box: a partial frame or an
    /// unterminated box.
    pub trailing: Vec<u8>,
}

/// Parse a complete byte blob into boxes.
pub fn parse_boxes(bytes: &[u8]) -> ParsedBoxes {
    let mut assembler = Assembler::default();
    let mut boxes = Vec::new();
    let mut offset = 0;
    let mut box_end = 0;

    while let Some((hunk, used)) = split_frame(&bytes[offset..]) {
        offset += used;
        if let Some(wire) = assembler.push(hunk) {
            boxes.push(wire);
            box_end = offset;
        }
    }

    let trailing = bytes[box_end..].to_vec();
    if !trailing.is_empty() {
        tracing::warn!(bytes = trailing.len(), "trailing bytes after the last complete box");
    }
    ParsedBoxes { boxes, trailing }
}

#[cfg(test)]
mod tests {
    use anyhow::bail;

    use super::*;
    use crate::framer::Framer;

    #[derive(Default)]
    struct Boxes(Vec<WireBox>);

    impl BoxReceiver for Boxes {
        fn box_received(&mut self, wire: WireBox) -> anyhow::Result<()> {
            self.0.push(wire);
            Ok(())
        }
    }

    #[test]
    fn hello_world_box() {
        let bytes = [
            0, 5, b'h', b'e', b'l', b'l', b'o', 0, 5, b'w', b'o', b'r', b'l', b'd', 0, 0,
        ];
        let parsed = parse_boxes(&bytes);
        assert_eq!(parsed.boxes.len(), 1);
        assert_eq!(parsed.boxes[0].get("hello"), Some(&b"world"[..]));
        assert!(parsed.trailing.is_empty());

        let mut wire = WireBox::new();
        wire.put("hello", "world");
        assert_eq!(wire.encode().unwrap(), bytes);
    }

    #[test]
    fn several_boxes_in_one_blob() {
        let mut first = WireBox::new();
        first.put("a", "1");
        let mut second = WireBox::new();
        second.put("b", "2").put("c", "3");
        let mut bytes = first.encode().unwrap();
        bytes.extend(second.encode().unwrap());

        let parsed = parse_boxes(&bytes);
        assert_eq!(parsed.boxes, [first, second]);
    }

    #[test]
    fn trailing_bytes_are_reported() {
        let mut wire = WireBox::new();
        wire.put("k", "v");
        let mut bytes = wire.encode().unwrap();
        // A complete pair without its terminator, then half a frame.
        bytes.extend_from_slice(b"\x00\x01x\x00\x01y\x00\x04ab");

        let parsed = parse_boxes(&bytes);
        assert_eq!(parsed.boxes, [wire]);
        assert_eq!(parsed.trailing, b"\x00\x01x\x00\x01y\x00\x04ab");
    }

    #[test]
    fn empty_box_is_still_delivered() {
        let parsed = parse_boxes(&[0, 0]);
        assert_eq!(parsed.boxes.len(), 1);
        assert!(parsed.boxes[0].is_empty());
    }

    #[test]
    fn parser_behind_framer_handles_fragments() {
        let mut wire = WireBox::new();
        wire.put("_command", "sum").put("a", "13").put("b", "81");
        let mut bytes = wire.encode().unwrap();
        bytes.extend(wire.encode().unwrap());

        let mut framer = Framer::new(BoxParser::new(Boxes::default()));
        for chunk in bytes.chunks(3) {
            framer.feed(chunk);
        }
        assert_eq!(framer.receiver().receiver().0, [wire.clone(), wire]);
    }

    #[test]
    fn receiver_error_does_not_poison_the_parser() {
        struct FailFirst {
            seen: usize,
            kept: Vec<WireBox>,
        }

        impl BoxReceiver for FailFirst {
            fn box_received(&mut self, wire: WireBox) -> anyhow::Result<()> {
                self.seen += 1;
                if self.seen == 1 {
                    bail!("first box rejected");
                }
                self.kept.push(wire);
                Ok(())
            }
        }

        let mut wire = WireBox::new();
        wire.put("n", "1");
        let mut bytes = wire.encode().unwrap();
        bytes.extend(wire.encode().unwrap());

        let mut framer = Framer::new(BoxParser::new(FailFirst {
            seen: 0,
            kept: Vec::new(),
        }));
        framer.feed(&bytes);
        assert_eq!(framer.receiver().receiver().seen, 2);
        assert_eq!(framer.receiver().receiver().kept, [wire]);
    }
}
