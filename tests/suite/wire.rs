//! Captured byte streams: framing, box boundaries, blocking codec.

use std::fs::{self, File};
use std::io::BufWriter;

use weft_amp::{
    BoxError, BoxReader, BoxWriter, MAX_FRAME_LEN, MAX_KEY_LEN, WireBox, frame, parse_boxes,
};

fn boxed(pairs: &[(&str, &str)]) -> WireBox {
    pairs.iter().copied().collect()
}

/// Hand-assembled frames for `{hello=world}` followed by the terminator.
const HELLO_WORLD: &[u8] = b"\x00\x05hello\x00\x05world\x00\x00";

#[test]
fn frames_assemble_into_a_box_by_hand() {
    let mut bytes = frame(b"hello").unwrap();
    bytes.extend(frame(b"world").unwrap());
    bytes.extend(frame(b"").unwrap());
    assert_eq!(bytes, HELLO_WORLD);
    assert_eq!(boxed(&[("hello", "world")]).encode().unwrap(), HELLO_WORLD);
}

#[test]
fn frame_limit_is_sixteen_bits() {
    assert!(frame(&vec![0; MAX_FRAME_LEN]).is_ok());
    assert!(frame(&vec![0; MAX_FRAME_LEN + 1]).is_err());
}

#[test]
fn long_keys_are_refused_on_send_but_read_on_receive() {
    let key = vec![b'k'; MAX_KEY_LEN + 45];
    let mut wire = WireBox::new();
    wire.put(&key, "v");
    assert_eq!(
        wire.encode(),
        Err(BoxError::KeyTooLong {
            len: MAX_KEY_LEN + 45
        })
    );

    // A peer that ignores the limit is still understood.
    let mut bytes = frame(&key).unwrap();
    bytes.extend(frame(b"v").unwrap());
    bytes.extend(frame(b"").unwrap());
    let parsed = parse_boxes(&bytes);
    assert_eq!(parsed.boxes, [wire]);
    assert!(parsed.trailing.is_empty());
}

#[test]
fn parse_boxes_splits_a_session_and_keeps_the_tail() {
    let call = boxed(&[("_command", "sum"), ("_ask", "1"), ("a", "13"), ("b", "81")]);
    let answer = boxed(&[("_answer", "1"), ("total", "94")]);

    let mut capture = call.encode().unwrap();
    capture.extend(answer.encode().unwrap());
    // The capture stopped in the middle of a third box.
    capture.extend_from_slice(b"\x00\x08_command\x00\x04pi");

    let parsed = parse_boxes(&capture);
    assert_eq!(parsed.boxes, vec![call, answer]);
    assert_eq!(parsed.trailing, b"\x00\x08_command\x00\x04pi");
}

#[test]
fn parse_boxes_on_empty_input() {
    let parsed = parse_boxes(b"");
    assert!(parsed.boxes.is_empty());
    assert!(parsed.trailing.is_empty());
}

#[test]
fn values_keep_arbitrary_bytes() {
    let mut wire = WireBox::new();
    wire.put("blob", [0_u8, 0, 0xff, b'\n', 0]);
    let parsed = parse_boxes(&wire.encode().unwrap());
    assert_eq!(parsed.boxes[0].get("blob"), Some(&[0_u8, 0, 0xff, b'\n', 0][..]));
}

#[test]
fn capture_file_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("session.amp");
    let sent = [
        boxed(&[("_command", "echo"), ("_ask", "1"), ("value", "first")]),
        boxed(&[("_command", "echo"), ("_ask", "2"), ("value", "second")]),
    ];

    let mut writer = BoxWriter::new(BufWriter::new(File::create(&path).unwrap()));
    for wire in &sent {
        writer.write_box(wire).unwrap();
    }
    drop(writer);

    let parsed = parse_boxes(&fs::read(&path).unwrap());
    assert_eq!(parsed.boxes, sent);
    assert!(parsed.trailing.is_empty());

    let mut reader = BoxReader::new(File::open(&path).unwrap());
    assert_eq!(reader.read_box().unwrap().as_ref(), Some(&sent[0]));
    assert_eq!(reader.read_box().unwrap().as_ref(), Some(&sent[1]));
    assert!(reader.read_box().unwrap().is_none());
}
