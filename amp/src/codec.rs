//! Blocking box I/O.
//!
//! [`BoxReader`] and [`BoxWriter`] speak the same wire format as the reactor
//! stack over plain [`Read`]/[`Write`] streams. They suit short-lived clients,
//! tools that inspect captured traffic, and tests that drive a server from
//! another thread.

use std::io::{self, Read, Write};

use anyhow::{Context, Result, bail};

use crate::parser::Assembler;
use crate::wirebox::WireBox;

/// Reads boxes from a byte stream.
pub struct BoxReader<R> {
    reader: R,
    assembler: Assembler,
}

impl<R: Read> BoxReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            assembler: Assembler::default(),
        }
    }

    /// Read the next complete box.
    ///
    /// Returns `Ok(None)` on EOF between boxes (clean shutdown).
    /// Returns `Err` on EOF inside a frame or a box.
    pub fn read_box(&mut self) -> Result<Option<WireBox>> {
        loop {
            let mut prefix = [0_u8; 2];
            let filled = read_full(&mut self.reader, &mut prefix).context("reading frame length")?;
            if filled == 0 && self.assembler.is_idle() {
                return Ok(None);
            }
            if filled < prefix.len() {
                bail!("unexpected EOF inside a box");
            }

            let mut hunk = vec![0_u8; usize::from(u16::from_be_bytes(prefix))];
            self.reader
                .read_exact(&mut hunk)
                .context("reading frame payload")?;
            if let Some(wire) = self.assembler.push(&hunk) {
                return Ok(Some(wire));
            }
        }
    }
}

/// Fill `buf`, stopping early only at EOF. Returns the bytes read.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(count) => filled += count,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
    Ok(filled)
}

/// Writes boxes to a byte stream.
pub struct BoxWriter<W> {
    writer: W,
}

impl<W: Write> BoxWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Encode, write and flush one box.
    pub fn write_box(&mut self, wire: &WireBox) -> Result<()> {
        let bytes = wire.encode().context("encoding box")?;
        self.writer.write_all(&bytes).context("writing box")?;
        self.writer.flush().context("flushing box")?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}
