// Errors raised while decoding packets off the wire.
//
// Only `FrameTooLarge` is fatal for a connection: once a length prefix is
// out of bounds the stream can no longer be resynchronized. Every other
// variant drops the offending packet and leaves the connection usable.

use thiserror::Error;

use crate::packet::CommandId;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("unknown command id {0}")]
    UnknownCommand(u32),

    #[error("packet {0:?} is not valid in this direction")]
    UnexpectedCommand(CommandId),

    #[error("invalid {field} value {value}")]
    InvalidValue { field: &'static str, value: u32 },

    #[error("frame of {len} bytes exceeds limit of {max}")]
    FrameTooLarge { len: u32, max: u32 },

    #[error("frame of {len} bytes is too short to hold a command id")]
    FrameTooShort { len: u32 },
}

impl ProtocolError {
    /// Whether the connection that produced this error must be closed.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ProtocolError::FrameTooLarge { .. })
    }
}
