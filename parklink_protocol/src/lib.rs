// parklink_protocol: wire protocol for the lockstep multiplayer core.
//
// This crate defines the packets, framing and typed messages exchanged
// between a server and its clients over TCP. It is shared by both sides and
// has no dependency on sockets, the simulation, or the session logic in
// `parklink_net`.
//
// Module overview:
// - `packet.rs`:     `CommandId` and `Packet`, a payload buffer with
//                    little-endian writers and forgiving readers.
// - `framing.rs`:    4-byte little-endian length prefix + command id.
//                    `FrameAssembler` for non-blocking reads, plus blocking
//                    `read_packet`/`write_packet` helpers.
// - `message.rs`:    `ClientMessage`/`ServerMessage` and their packet codecs.
// - `types.rs`:      Ids, `AuthStatus`, `ErrorText`, `GameCommand` and its
//                    flag and kind constants.
// - `permission.rs`: `Permission` actions and the `PermissionSet` bitset.
// - `error.rs`:      `ProtocolError`.
//
// Design decisions:
// - **Binary little-endian encoding.** Commands are seven fixed words and
//   arrive every tick, so a compact hand-laid format beats a self-describing
//   one. Structured blobs that are rarely sent (server info) travel as JSON
//   strings inside a packet.
// - **Forgiving reads.** A short packet decodes with defaulted trailing
//   fields instead of erroring, which keeps minor protocol additions
//   backwards compatible.
// - **No async runtime.** Framing works on byte slices and on
//   `std::io::Read`/`Write`.

pub mod error;
pub mod framing;
pub mod message;
pub mod packet;
pub mod permission;
pub mod types;

pub use error::ProtocolError;
pub use framing::{FrameAssembler, MAX_PACKET_SIZE, encode_frame, read_packet, write_packet};
pub use message::{ClientMessage, GroupInfo, NetEvent, PlayerInfo, ServerMessage};
pub use packet::{CommandId, Packet};
pub use permission::{Permission, PermissionSet};
pub use types::{AuthStatus, ErrorText, GameCommand, GroupId, Money, PlayerId, Tick};

/// Protocol version string exchanged during authentication. Peers with
/// different strings cannot play together.
pub const PROTOCOL_VERSION: &str = "parklink-1";
