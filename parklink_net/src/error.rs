// Error type for the session layer.
//
// Most failures inside `Session::update` are handled locally (a bad packet
// is dropped, a dead connection is removed) and only surface as log lines or
// `SessionEvent`s. `NetError` is what the fallible entry points return:
// starting a server or client, key file handling, persistence, and snapshot
// decoding.

use std::io;
use std::path::PathBuf;

use parklink_protocol::ProtocolError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NetError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("key error: {0}")]
    Key(String),

    #[error("snapshot error: {0}")]
    Snapshot(String),

    #[error("failed to persist {path}: {reason}")]
    Persist { path: PathBuf, reason: String },

    #[error("not connected")]
    NotConnected,

    #[error("a session is already active")]
    AlreadyActive,
}

pub type NetResult<T> = Result<T, NetError>;
