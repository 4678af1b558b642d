// Typed protocol messages and their packet encodings.
//
// Two enums define the full protocol vocabulary:
// - `ClientMessage`: sent by a client to the server.
// - `ServerMessage`: sent by the server to a client.
//
// Each variant maps to exactly one `CommandId`. Both enums convert to a
// `Packet` with `to_packet` and back with `from_packet`; decoding uses the
// packet's forgiving readers, so trailing fields missing from a short packet
// come back as zero/empty. Only enumerated fields (auth status, error text,
// event kind) are validated, since a bad value there has no sensible
// default.

use crate::error::ProtocolError;
use crate::packet::{CommandId, Packet};
use crate::permission::PermissionSet;
use crate::types::{
    AuthStatus, COMMAND_ARGS, ErrorText, GameCommand, GroupId, Money, PlayerId, Tick,
};

/// Bit in the TICK flags word: a state checksum string follows.
pub const TICK_FLAG_CHECKSUMS: u32 = 1 << 0;

/// Messages sent by a client to the server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClientMessage {
    /// Ask the server for an authentication challenge.
    Token,
    /// Answer the challenge.
    Auth {
        version: String,
        name: String,
        password: String,
        /// Hex-encoded public key.
        public_key: String,
        signature: Vec<u8>,
    },
    Chat {
        text: String,
    },
    /// A command for the server to validate, execute and rebroadcast. The
    /// server ignores `command.player_id` and stamps the sender's id.
    GameCommand(GameCommand),
    /// Reply to a server ping.
    Ping,
    /// Request the server's public description.
    GameInfo,
}

/// Messages sent by the server to a client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ServerMessage {
    /// Authentication challenge bytes to sign.
    Token { challenge: Vec<u8> },
    /// Authentication verdict. `version` is only sent with `BadVersion`.
    Auth {
        status: AuthStatus,
        player_id: PlayerId,
        version: Option<String>,
    },
    /// One chunk of a serialized world snapshot.
    Map {
        total_size: u32,
        offset: u32,
        chunk: Vec<u8>,
    },
    Chat { text: String },
    /// A validated command to execute at `command.tick`.
    GameCommand(GameCommand),
    /// Authoritative tick announcement plus desync fingerprint.
    Tick {
        tick: Tick,
        prng_seed: u32,
        checksum: Option<String>,
    },
    PlayerList(Vec<PlayerInfo>),
    Ping,
    PingList(Vec<(PlayerId, u16)>),
    /// Reason to display when the server closes this connection.
    SetDisconnectMsg { reason: String },
    /// JSON description of the server.
    GameInfo { json: String },
    ShowError { title: ErrorText, body: ErrorText },
    GroupList {
        default_group: GroupId,
        groups: Vec<GroupInfo>,
    },
    Event(NetEvent),
}

/// Public state of a connected player.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlayerInfo {
    pub id: PlayerId,
    pub name: String,
    pub group: GroupId,
    pub flags: u32,
    pub ping: u16,
    pub money_spent: Money,
    pub commands_ran: u32,
}

/// A permission group as sent in the group list.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupInfo {
    pub id: GroupId,
    pub name: String,
    pub permissions: PermissionSet,
}

/// Roster notifications.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NetEvent {
    PlayerJoined { name: String },
    PlayerDisconnected { name: String, reason: String },
}

const EVENT_PLAYER_JOINED: u16 = 0;
const EVENT_PLAYER_DISCONNECTED: u16 = 1;

fn write_command_words(p: &mut Packet, cmd: &GameCommand) {
    p.write_u32(cmd.tick);
    for arg in cmd.args {
        p.write_u32(arg);
    }
}

fn read_command_words(p: &mut Packet) -> (Tick, [u32; COMMAND_ARGS]) {
    let tick = p.read_u32();
    let mut args = [0u32; COMMAND_ARGS];
    for arg in &mut args {
        *arg = p.read_u32();
    }
    (tick, args)
}

impl ClientMessage {
    pub fn command_id(&self) -> CommandId {
        match self {
            ClientMessage::Token => CommandId::Token,
            ClientMessage::Auth { .. } => CommandId::Auth,
            ClientMessage::Chat { .. } => CommandId::Chat,
            ClientMessage::GameCommand(_) => CommandId::GameCommand,
            ClientMessage::Ping => CommandId::Ping,
            ClientMessage::GameInfo => CommandId::GameInfo,
        }
    }

    pub fn to_packet(&self) -> Packet {
        let mut p = Packet::new(self.command_id());
        match self {
            ClientMessage::Token | ClientMessage::Ping | ClientMessage::GameInfo => {}
            ClientMessage::Auth {
                version,
                name,
                password,
                public_key,
                signature,
            } => {
                p.write_string(version)
                    .write_string(name)
                    .write_string(password)
                    .write_string(public_key)
                    .write_blob(signature);
            }
            ClientMessage::Chat { text } => {
                p.write_string(text);
            }
            ClientMessage::GameCommand(cmd) => {
                write_command_words(&mut p, cmd);
                p.write_u8(cmd.callback);
            }
        }
        p
    }

    pub fn from_packet(mut p: Packet) -> Result<Self, ProtocolError> {
        Ok(match p.id() {
            CommandId::Token => ClientMessage::Token,
            CommandId::Ping => ClientMessage::Ping,
            CommandId::GameInfo => ClientMessage::GameInfo,
            CommandId::Auth => ClientMessage::Auth {
                version: p.read_string(),
                name: p.read_string(),
                password: p.read_string(),
                public_key: p.read_string(),
                signature: p.read_blob(),
            },
            CommandId::Chat => ClientMessage::Chat {
                text: p.read_string(),
            },
            CommandId::GameCommand => {
                let (tick, args) = read_command_words(&mut p);
                ClientMessage::GameCommand(GameCommand {
                    tick,
                    args,
                    player_id: PlayerId(0),
                    callback: p.read_u8(),
                })
            }
            other => return Err(ProtocolError::UnexpectedCommand(other)),
        })
    }
}

impl ServerMessage {
    pub fn command_id(&self) -> CommandId {
        match self {
            ServerMessage::Token { .. } => CommandId::Token,
            ServerMessage::Auth { .. } => CommandId::Auth,
            ServerMessage::Map { .. } => CommandId::Map,
            ServerMessage::Chat { .. } => CommandId::Chat,
            ServerMessage::GameCommand(_) => CommandId::GameCommand,
            ServerMessage::Tick { .. } => CommandId::Tick,
            ServerMessage::PlayerList(_) => CommandId::PlayerList,
            ServerMessage::Ping => CommandId::Ping,
            ServerMessage::PingList(_) => CommandId::PingList,
            ServerMessage::SetDisconnectMsg { .. } => CommandId::SetDisconnectMsg,
            ServerMessage::GameInfo { .. } => CommandId::GameInfo,
            ServerMessage::ShowError { .. } => CommandId::ShowError,
            ServerMessage::GroupList { .. } => CommandId::GroupList,
            ServerMessage::Event(_) => CommandId::Event,
        }
    }

    pub fn to_packet(&self) -> Packet {
        let mut p = Packet::new(self.command_id());
        match self {
            ServerMessage::Ping => {}
            ServerMessage::Token { challenge } => {
                p.write_blob(challenge);
            }
            ServerMessage::Auth {
                status,
                player_id,
                version,
            } => {
                p.write_u32(*status as u32).write_u8(player_id.0);
                if let Some(version) = version {
                    p.write_string(version);
                }
            }
            ServerMessage::Map {
                total_size,
                offset,
                chunk,
            } => {
                p.write_u32(*total_size).write_u32(*offset).write_bytes(chunk);
            }
            ServerMessage::Chat { text } => {
                p.write_string(text);
            }
            ServerMessage::GameCommand(cmd) => {
                write_command_words(&mut p, cmd);
                p.write_u8(cmd.player_id.0).write_u8(cmd.callback);
            }
            ServerMessage::Tick {
                tick,
                prng_seed,
                checksum,
            } => {
                let flags = if checksum.is_some() {
                    TICK_FLAG_CHECKSUMS
                } else {
                    0
                };
                p.write_u32(*tick).write_u32(*prng_seed).write_u32(flags);
                if let Some(checksum) = checksum {
                    p.write_string(checksum);
                }
            }
            ServerMessage::PlayerList(players) => {
                let count = players.len().min(u8::MAX as usize);
                p.write_u8(count as u8);
                for info in &players[..count] {
                    p.write_u8(info.id.0)
                        .write_string(&info.name)
                        .write_u8(info.group.0)
                        .write_u32(info.flags)
                        .write_u16(info.ping)
                        .write_i64(info.money_spent)
                        .write_u32(info.commands_ran);
                }
            }
            ServerMessage::PingList(pings) => {
                let count = pings.len().min(u8::MAX as usize);
                p.write_u8(count as u8);
                for (id, ping) in &pings[..count] {
                    p.write_u8(id.0).write_u16(*ping);
                }
            }
            ServerMessage::SetDisconnectMsg { reason } => {
                p.write_string(reason);
            }
            ServerMessage::GameInfo { json } => {
                p.write_string(json);
            }
            ServerMessage::ShowError { title, body } => {
                p.write_u32(*title as u32).write_u32(*body as u32);
            }
            ServerMessage::GroupList {
                default_group,
                groups,
            } => {
                let count = groups.len().min(u8::MAX as usize);
                p.write_u8(count as u8).write_u8(default_group.0);
                for group in &groups[..count] {
                    let bits = group.permissions.as_bytes();
                    p.write_u8(group.id.0)
                        .write_string(&group.name)
                        .write_u8(bits.len() as u8)
                        .write_bytes(bits);
                }
            }
            ServerMessage::Event(event) => match event {
                NetEvent::PlayerJoined { name } => {
                    p.write_u16(EVENT_PLAYER_JOINED).write_string(name);
                }
                NetEvent::PlayerDisconnected { name, reason } => {
                    p.write_u16(EVENT_PLAYER_DISCONNECTED)
                        .write_string(name)
                        .write_string(reason);
                }
            },
        }
        p
    }

    pub fn from_packet(mut p: Packet) -> Result<Self, ProtocolError> {
        Ok(match p.id() {
            CommandId::Ping => ServerMessage::Ping,
            CommandId::Token => ServerMessage::Token {
                challenge: p.read_blob(),
            },
            CommandId::Auth => {
                let status = AuthStatus::try_from(p.read_u32())?;
                let player_id = PlayerId(p.read_u8());
                let version = (status == AuthStatus::BadVersion).then(|| p.read_string());
                ServerMessage::Auth {
                    status,
                    player_id,
                    version,
                }
            }
            CommandId::Map => ServerMessage::Map {
                total_size: p.read_u32(),
                offset: p.read_u32(),
                chunk: p.read_remaining(),
            },
            CommandId::Chat => ServerMessage::Chat {
                text: p.read_string(),
            },
            CommandId::GameCommand => {
                let (tick, args) = read_command_words(&mut p);
                ServerMessage::GameCommand(GameCommand {
                    tick,
                    args,
                    player_id: PlayerId(p.read_u8()),
                    callback: p.read_u8(),
                })
            }
            CommandId::Tick => {
                let tick = p.read_u32();
                let prng_seed = p.read_u32();
                let flags = p.read_u32();
                let checksum = (flags & TICK_FLAG_CHECKSUMS != 0).then(|| p.read_string());
                ServerMessage::Tick {
                    tick,
                    prng_seed,
                    checksum,
                }
            }
            CommandId::PlayerList => {
                let count = p.read_u8();
                let mut players = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    players.push(PlayerInfo {
                        id: PlayerId(p.read_u8()),
                        name: p.read_string(),
                        group: GroupId(p.read_u8()),
                        flags: p.read_u32(),
                        ping: p.read_u16(),
                        money_spent: p.read_i64(),
                        commands_ran: p.read_u32(),
                    });
                }
                ServerMessage::PlayerList(players)
            }
            CommandId::PingList => {
                let count = p.read_u8();
                let pings = (0..count)
                    .map(|_| (PlayerId(p.read_u8()), p.read_u16()))
                    .collect();
                ServerMessage::PingList(pings)
            }
            CommandId::SetDisconnectMsg => ServerMessage::SetDisconnectMsg {
                reason: p.read_string(),
            },
            CommandId::GameInfo => ServerMessage::GameInfo {
                json: p.read_string(),
            },
            CommandId::ShowError => ServerMessage::ShowError {
                title: ErrorText::try_from(p.read_u32())?,
                body: ErrorText::try_from(p.read_u32())?,
            },
            CommandId::GroupList => {
                let count = p.read_u8();
                let default_group = GroupId(p.read_u8());
                let mut groups = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let id = GroupId(p.read_u8());
                    let name = p.read_string();
                    let len = p.read_u8() as usize;
                    let permissions = PermissionSet::from_bytes(&p.read_bytes(len));
                    groups.push(GroupInfo {
                        id,
                        name,
                        permissions,
                    });
                }
                ServerMessage::GroupList {
                    default_group,
                    groups,
                }
            }
            CommandId::Event => {
                let kind = p.read_u16();
                let event = match kind {
                    EVENT_PLAYER_JOINED => NetEvent::PlayerJoined {
                        name: p.read_string(),
                    },
                    EVENT_PLAYER_DISCONNECTED => NetEvent::PlayerDisconnected {
                        name: p.read_string(),
                        reason: p.read_string(),
                    },
                    other => {
                        return Err(ProtocolError::InvalidValue {
                            field: "event kind",
                            value: u32::from(other),
                        });
                    }
                };
                ServerMessage::Event(event)
            }
        })
    }
}
