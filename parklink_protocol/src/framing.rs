// Length-prefixed packet framing.
//
// Wire layout of one frame:
//
//   [u32 LE length][u32 LE command id][payload ...]
//
// `length` counts the command id and the payload, not itself. A
// `MAX_PACKET_SIZE` limit protects against unbounded allocation from a
// malformed or malicious prefix; snapshot chunks are the largest expected
// packets and sit well below it.
//
// Two readers are provided. `FrameAssembler` accumulates bytes from a
// non-blocking socket and yields packets as they complete; it is what live
// connections use. `read_packet`/`write_packet` operate on blocking
// `Read`/`Write` streams and are convenient for tools and tests that speak
// the protocol directly.

use std::io::{self, Read, Write};

use crate::error::ProtocolError;
use crate::packet::{CommandId, Packet};

/// Upper bound on `length` (command id + payload), in bytes.
pub const MAX_PACKET_SIZE: u32 = 1024 * 1024;

const PREFIX_SIZE: usize = 4;
const ID_SIZE: usize = 4;

/// Serialize a packet into a complete frame.
pub fn encode_frame(packet: &Packet) -> Result<Vec<u8>, ProtocolError> {
    let body_len = ID_SIZE + packet.len();
    if body_len > MAX_PACKET_SIZE as usize {
        return Err(ProtocolError::FrameTooLarge {
            len: u32::try_from(body_len).unwrap_or(u32::MAX),
            max: MAX_PACKET_SIZE,
        });
    }
    let mut frame = Vec::with_capacity(PREFIX_SIZE + body_len);
    frame.extend_from_slice(&(body_len as u32).to_le_bytes());
    frame.extend_from_slice(&(packet.id() as u32).to_le_bytes());
    frame.extend_from_slice(packet.payload());
    Ok(frame)
}

/// Write one framed packet to a blocking stream.
pub fn write_packet<W: Write>(writer: &mut W, packet: &Packet) -> io::Result<()> {
    let frame =
        encode_frame(packet).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    writer.write_all(&frame)?;
    writer.flush()
}

/// Read one framed packet from a blocking stream.
///
/// Returns `UnexpectedEof` if the stream closes before or during a frame and
/// `InvalidData` for an oversized, undersized or unknown-id frame.
pub fn read_packet<R: Read>(reader: &mut R) -> io::Result<Packet> {
    let mut len_buf = [0u8; PREFIX_SIZE];
    reader.read_exact(&mut len_buf)?;
    let len = u32::from_le_bytes(len_buf);
    check_length(len).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body)?;
    split_body(body).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

fn check_length(len: u32) -> Result<(), ProtocolError> {
    if len > MAX_PACKET_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            len,
            max: MAX_PACKET_SIZE,
        });
    }
    if (len as usize) < ID_SIZE {
        return Err(ProtocolError::FrameTooShort { len });
    }
    Ok(())
}

fn split_body(mut body: Vec<u8>) -> Result<Packet, ProtocolError> {
    let mut id_bytes = [0u8; ID_SIZE];
    id_bytes.copy_from_slice(&body[..ID_SIZE]);
    let id = CommandId::try_from(u32::from_le_bytes(id_bytes))?;
    body.drain(..ID_SIZE);
    Ok(Packet::from_payload(id, body))
}

/// Incremental frame decoder for non-blocking reads.
#[derive(Debug, Default)]
pub struct FrameAssembler {
    buf: Vec<u8>,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append freshly received bytes.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Number of buffered bytes that do not yet form a complete frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Pop the next complete packet, if any.
    ///
    /// A frame with an unknown command id or a too-short length is consumed
    /// and reported as an error; the caller may keep reading. An oversized
    /// length is reported without consuming anything, since the stream
    /// cannot be resynchronized past it.
    pub fn next_packet(&mut self) -> Result<Option<Packet>, ProtocolError> {
        if self.buf.len() < PREFIX_SIZE {
            return Ok(None);
        }
        let mut len_buf = [0u8; PREFIX_SIZE];
        len_buf.copy_from_slice(&self.buf[..PREFIX_SIZE]);
        let len = u32::from_le_bytes(len_buf);

        if let Err(e) = check_length(len) {
            if let ProtocolError::FrameTooShort { .. } = e {
                let skip = (PREFIX_SIZE + len as usize).min(self.buf.len());
                self.buf.drain(..skip);
            }
            return Err(e);
        }

        let frame_len = PREFIX_SIZE + len as usize;
        if self.buf.len() < frame_len {
            return Ok(None);
        }
        let body: Vec<u8> = self.buf[PREFIX_SIZE..frame_len].to_vec();
        self.buf.drain(..frame_len);
        split_body(body).map(Some)
    }
}
