// Packets: a command id plus a byte payload with a read cursor.
//
// Writers append little-endian integers, NUL-terminated strings and raw
// bytes. Readers are deliberately forgiving: reading past the end yields
// zero or an empty value instead of failing, so a short packet from an
// older peer decodes with defaulted trailing fields. Higher layers
// (`message.rs`) decide which defaulted fields are acceptable.

use crate::error::ProtocolError;

/// Wire command identifiers. The numeric values are part of the protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum CommandId {
    Token = 0,
    Auth = 1,
    Map = 2,
    Chat = 3,
    GameCommand = 4,
    Tick = 5,
    PlayerList = 6,
    Ping = 7,
    PingList = 8,
    SetDisconnectMsg = 9,
    GameInfo = 10,
    ShowError = 11,
    GroupList = 12,
    Event = 13,
}

impl CommandId {
    pub const ALL: [CommandId; 14] = [
        CommandId::Token,
        CommandId::Auth,
        CommandId::Map,
        CommandId::Chat,
        CommandId::GameCommand,
        CommandId::Tick,
        CommandId::PlayerList,
        CommandId::Ping,
        CommandId::PingList,
        CommandId::SetDisconnectMsg,
        CommandId::GameInfo,
        CommandId::ShowError,
        CommandId::GroupList,
        CommandId::Event,
    ];

    /// Commands a server accepts from a connection that has not finished
    /// authenticating.
    pub fn allowed_before_auth(self) -> bool {
        matches!(
            self,
            CommandId::Token | CommandId::Auth | CommandId::Ping | CommandId::GameInfo
        )
    }
}

impl TryFrom<u32> for CommandId {
    type Error = ProtocolError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        CommandId::ALL
            .get(value as usize)
            .copied()
            .ok_or(ProtocolError::UnknownCommand(value))
    }
}

/// A single packet with an append-only payload and a read cursor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    id: CommandId,
    data: Vec<u8>,
    read_pos: usize,
}

impl Packet {
    pub fn new(id: CommandId) -> Self {
        Self {
            id,
            data: Vec::new(),
            read_pos: 0,
        }
    }

    /// Wrap a received payload. The cursor starts at the beginning.
    pub fn from_payload(id: CommandId, data: Vec<u8>) -> Self {
        Self {
            id,
            data,
            read_pos: 0,
        }
    }

    pub fn id(&self) -> CommandId {
        self.id
    }

    pub fn payload(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Bytes not yet consumed by the read cursor.
    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.read_pos)
    }

    // --- writing ---

    pub fn write_u8(&mut self, value: u8) -> &mut Self {
        self.data.push(value);
        self
    }

    pub fn write_u16(&mut self, value: u16) -> &mut Self {
        self.data.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn write_u32(&mut self, value: u32) -> &mut Self {
        self.data.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn write_i64(&mut self, value: i64) -> &mut Self {
        self.data.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.data.extend_from_slice(bytes);
        self
    }

    /// Writes the string followed by a NUL terminator. Interior NULs would
    /// truncate the string on the receiving side, so they are stripped.
    pub fn write_string(&mut self, value: &str) -> &mut Self {
        self.data.extend(value.bytes().filter(|b| *b != 0));
        self.data.push(0);
        self
    }

    /// A `u32` byte count followed by the bytes.
    pub fn write_blob(&mut self, bytes: &[u8]) -> &mut Self {
        self.write_u32(bytes.len() as u32);
        self.write_bytes(bytes)
    }

    // --- reading ---

    fn read_array<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        if self.remaining() >= N {
            out.copy_from_slice(&self.data[self.read_pos..self.read_pos + N]);
            self.read_pos += N;
        } else {
            self.read_pos = self.data.len();
        }
        out
    }

    pub fn read_u8(&mut self) -> u8 {
        self.read_array::<1>()[0]
    }

    pub fn read_u16(&mut self) -> u16 {
        u16::from_le_bytes(self.read_array())
    }

    pub fn read_u32(&mut self) -> u32 {
        u32::from_le_bytes(self.read_array())
    }

    pub fn read_i64(&mut self) -> i64 {
        i64::from_le_bytes(self.read_array())
    }

    /// Reads exactly `count` bytes, or returns an empty vector (and exhausts
    /// the cursor) if fewer remain.
    pub fn read_bytes(&mut self, count: usize) -> Vec<u8> {
        if self.remaining() < count {
            self.read_pos = self.data.len();
            return Vec::new();
        }
        let out = self.data[self.read_pos..self.read_pos + count].to_vec();
        self.read_pos += count;
        out
    }

    /// Reads everything left in the payload.
    pub fn read_remaining(&mut self) -> Vec<u8> {
        let out = self.data[self.read_pos.min(self.data.len())..].to_vec();
        self.read_pos = self.data.len();
        out
    }

    /// Reads up to the next NUL (or the end of the payload). Invalid UTF-8 is
    /// replaced rather than rejected.
    pub fn read_string(&mut self) -> String {
        let rest = &self.data[self.read_pos.min(self.data.len())..];
        let (text, consumed) = match rest.iter().position(|b| *b == 0) {
            Some(nul) => (&rest[..nul], nul + 1),
            None => (rest, rest.len()),
        };
        let out = String::from_utf8_lossy(text).into_owned();
        self.read_pos += consumed;
        out
    }

    /// Reads a `u32`-prefixed blob. A length that overruns the payload
    /// yields an empty blob.
    pub fn read_blob(&mut self) -> Vec<u8> {
        let len = self.read_u32() as usize;
        self.read_bytes(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_ids_are_stable() {
        for (i, id) in CommandId::ALL.iter().enumerate() {
            assert_eq!(*id as u32, i as u32);
            assert_eq!(CommandId::try_from(i as u32), Ok(*id));
        }
        assert_eq!(
            CommandId::try_from(14),
            Err(ProtocolError::UnknownCommand(14))
        );
    }

    #[test]
    fn integers_are_little_endian() {
        let mut p = Packet::new(CommandId::Tick);
        p.write_u16(0x0102).write_u32(0x0304_0506);
        assert_eq!(p.payload(), &[0x02, 0x01, 0x06, 0x05, 0x04, 0x03]);
    }

    #[test]
    fn reads_past_end_yield_defaults() {
        let mut p = Packet::from_payload(CommandId::Chat, vec![7]);
        assert_eq!(p.read_u32(), 0);
        assert_eq!(p.remaining(), 0);
        assert_eq!(p.read_u8(), 0);
        assert_eq!(p.read_string(), "");
        assert!(p.read_bytes(4).is_empty());
        assert!(p.read_blob().is_empty());
    }

    #[test]
    fn string_without_terminator_reads_to_end() {
        let mut p = Packet::from_payload(CommandId::Chat, b"abc".to_vec());
        assert_eq!(p.read_string(), "abc");
        assert_eq!(p.remaining(), 0);
    }

    #[test]
    fn strings_are_nul_separated() {
        let mut p = Packet::new(CommandId::Auth);
        p.write_string("one").write_string("").write_string("three");
        let mut r = Packet::from_payload(CommandId::Auth, p.payload().to_vec());
        assert_eq!(r.read_string(), "one");
        assert_eq!(r.read_string(), "");
        assert_eq!(r.read_string(), "three");
    }

    #[test]
    fn interior_nul_is_stripped() {
        let mut p = Packet::new(CommandId::Chat);
        p.write_string("a\0b");
        assert_eq!(p.payload(), b"ab\0");
    }

    #[test]
    fn invalid_utf8_is_replaced() {
        let mut p = Packet::from_payload(CommandId::Chat, vec![0x66, 0xFF, 0x6F, 0]);
        assert_eq!(p.read_string(), "f\u{FFFD}o");
    }

    #[test]
    fn blob_with_overlong_length_is_empty() {
        let mut p = Packet::new(CommandId::Token);
        p.write_u32(100).write_bytes(&[1, 2, 3]);
        let mut r = Packet::from_payload(CommandId::Token, p.payload().to_vec());
        assert!(r.read_blob().is_empty());
        assert_eq!(r.remaining(), 0);
    }
}
