// Core value types shared by both ends of a connection.
//
// Player and group ids are compact `u8` newtypes because that is how they
// travel on the wire. `GameCommand` is the opaque seven-word command record
// exchanged between peers; only two of its words have a meaning at this
// layer (the kind and the flags), the rest belong to the simulation.

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Session-scoped player id. Unique among currently connected players.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PlayerId(pub u8);

/// Permission group id. Group 0 is the administrator group.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupId(pub u8);

impl GroupId {
    pub const ADMIN: GroupId = GroupId(0);
}

/// Simulation money units. Costs are always non-negative.
pub type Money = i64;

/// Simulation tick counter.
pub type Tick = u32;

/// Player flag bits, as carried in the player list.
pub mod player_flags {
    /// The player is the host running the server.
    pub const IS_SERVER: u32 = 1 << 0;
}

/// Authentication state of a connection, and the verdict codes sent in the
/// AUTH reply. Values are part of the wire protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum AuthStatus {
    None = 0,
    Requested = 1,
    Ok = 2,
    BadVersion = 3,
    BadName = 4,
    BadPassword = 5,
    VerificationFailure = 6,
    Full = 7,
    RequirePassword = 8,
    Verified = 9,
    UnknownKeyDisallowed = 10,
}

impl AuthStatus {
    const ALL: [AuthStatus; 11] = [
        AuthStatus::None,
        AuthStatus::Requested,
        AuthStatus::Ok,
        AuthStatus::BadVersion,
        AuthStatus::BadName,
        AuthStatus::BadPassword,
        AuthStatus::VerificationFailure,
        AuthStatus::Full,
        AuthStatus::RequirePassword,
        AuthStatus::Verified,
        AuthStatus::UnknownKeyDisallowed,
    ];

    /// Human-readable reason shown when a connection ends with this status.
    pub fn describe(self) -> &'static str {
        match self {
            AuthStatus::None | AuthStatus::Requested => "authentication pending",
            AuthStatus::Ok | AuthStatus::Verified => "authenticated",
            AuthStatus::BadVersion => "incompatible version",
            AuthStatus::BadName => "bad player name",
            AuthStatus::BadPassword => "incorrect password",
            AuthStatus::VerificationFailure => "key verification failure",
            AuthStatus::Full => "server is full",
            AuthStatus::RequirePassword => "password required",
            AuthStatus::UnknownKeyDisallowed => "unknown public key",
        }
    }
}

impl TryFrom<u32> for AuthStatus {
    type Error = ProtocolError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        AuthStatus::ALL
            .get(value as usize)
            .copied()
            .ok_or(ProtocolError::InvalidValue {
                field: "auth status",
                value,
            })
    }
}

/// Message codes carried by SHOWERROR and by local command rejections. The
/// receiving UI maps them to localized text.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorText {
    None = 0,
    CantDoThis = 1,
    PermissionDenied = 2,
    InsufficientFunds = 3,
    CantChangeGroupThatTheHostBelongsTo = 4,
    CantSetToThisGroup = 5,
    ThisGroupCannotBeModified = 6,
    CantRemoveGroupThatPlayersBelongTo = 7,
    CantModifyPermissionThatYouDoNotHaveYourself = 8,
    InvalidGroupName = 9,
    CantKickTheHost = 10,
    UnknownPlayer = 11,
    UnknownGroup = 12,
    TooManyGroups = 13,
}

impl ErrorText {
    const ALL: [ErrorText; 14] = [
        ErrorText::None,
        ErrorText::CantDoThis,
        ErrorText::PermissionDenied,
        ErrorText::InsufficientFunds,
        ErrorText::CantChangeGroupThatTheHostBelongsTo,
        ErrorText::CantSetToThisGroup,
        ErrorText::ThisGroupCannotBeModified,
        ErrorText::CantRemoveGroupThatPlayersBelongTo,
        ErrorText::CantModifyPermissionThatYouDoNotHaveYourself,
        ErrorText::InvalidGroupName,
        ErrorText::CantKickTheHost,
        ErrorText::UnknownPlayer,
        ErrorText::UnknownGroup,
        ErrorText::TooManyGroups,
    ];
}

impl TryFrom<u32> for ErrorText {
    type Error = ProtocolError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        ErrorText::ALL
            .get(value as usize)
            .copied()
            .ok_or(ProtocolError::InvalidValue {
                field: "error text",
                value,
            })
    }
}

/// Number of argument words in a game command.
pub const COMMAND_ARGS: usize = 7;

/// Argument word holding the command flags.
pub const FLAGS_ARG: usize = 1;

/// Argument word holding the command kind.
pub const KIND_ARG: usize = 4;

/// Bits of the flags word.
pub mod command_flags {
    /// Perform the command. Without it, the command is only priced.
    pub const APPLY: u32 = 1 << 0;
    /// Never charge the cost and never transmit the command.
    pub const NO_SPEND: u32 = 1 << 5;
    /// Local preview object; never transmitted.
    pub const GHOST: u32 = 1 << 6;
    /// The command arrived over the network and must not be re-sent.
    pub const NETWORKED: u32 = 1 << 31;
}

/// Command kind identifiers. Kinds not listed here are free for the
/// simulation to interpret; the network layer only needs to recognise the
/// ones it gates, filters or owns.
pub mod command_kind {
    pub const SET_RIDE_APPEARANCE: u32 = 0;
    pub const SET_LAND_HEIGHT: u32 = 1;
    pub const TOGGLE_PAUSE: u32 = 2;
    pub const PLACE_TRACK: u32 = 3;
    pub const REMOVE_TRACK: u32 = 4;
    pub const LOAD_OR_QUIT: u32 = 5;
    pub const CREATE_RIDE: u32 = 6;
    pub const DEMOLISH_RIDE: u32 = 7;
    pub const SET_RIDE_STATUS: u32 = 8;
    pub const SET_RIDE_VEHICLES: u32 = 9;
    pub const SET_RIDE_NAME: u32 = 10;
    pub const SET_RIDE_SETTING: u32 = 11;
    pub const PLACE_RIDE_ENTRANCE_OR_EXIT: u32 = 12;
    pub const REMOVE_RIDE_ENTRANCE_OR_EXIT: u32 = 13;
    pub const REMOVE_SCENERY: u32 = 14;
    pub const PLACE_SCENERY: u32 = 15;
    pub const SET_WATER_HEIGHT: u32 = 16;
    pub const PLACE_PATH: u32 = 17;
    pub const PLACE_PATH_FROM_TRACK: u32 = 18;
    pub const REMOVE_PATH: u32 = 19;
    pub const CHANGE_SURFACE_STYLE: u32 = 20;
    pub const SET_RIDE_PRICE: u32 = 21;
    pub const SET_GUEST_NAME: u32 = 22;
    pub const SET_STAFF_NAME: u32 = 23;
    pub const RAISE_LAND: u32 = 24;
    pub const LOWER_LAND: u32 = 25;
    pub const SMOOTH_LAND: u32 = 26;
    pub const RAISE_WATER: u32 = 27;
    pub const LOWER_WATER: u32 = 28;
    pub const SET_BRAKES_SPEED: u32 = 29;
    pub const HIRE_STAFF: u32 = 30;
    pub const SET_STAFF_PATROL: u32 = 31;
    pub const FIRE_STAFF: u32 = 32;
    pub const SET_STAFF_ORDER: u32 = 33;
    pub const SET_PARK_NAME: u32 = 34;
    pub const SET_PARK_OPEN: u32 = 35;
    pub const BUY_LAND_RIGHTS: u32 = 36;
    pub const PLACE_PARK_ENTRANCE: u32 = 37;
    pub const REMOVE_PARK_ENTRANCE: u32 = 38;
    pub const SET_MAZE_TRACK: u32 = 39;
    pub const SET_PARK_ENTRANCE_FEE: u32 = 40;
    pub const SET_STAFF_COLOUR: u32 = 41;
    pub const PLACE_FENCE: u32 = 42;
    pub const REMOVE_FENCE: u32 = 43;
    pub const PLACE_LARGE_SCENERY: u32 = 44;
    pub const REMOVE_LARGE_SCENERY: u32 = 45;
    pub const SET_CURRENT_LOAN: u32 = 46;
    pub const SET_RESEARCH_FUNDING: u32 = 47;
    pub const PLACE_TRACK_DESIGN: u32 = 48;
    pub const START_MARKETING_CAMPAIGN: u32 = 49;
    pub const PLACE_MAZE_DESIGN: u32 = 50;
    pub const PLACE_BANNER: u32 = 51;
    pub const REMOVE_BANNER: u32 = 52;
    pub const SET_SCENERY_COLOUR: u32 = 53;
    pub const SET_FENCE_COLOUR: u32 = 54;
    pub const SET_LARGE_SCENERY_COLOUR: u32 = 55;
    pub const SET_BANNER_COLOUR: u32 = 56;
    pub const SET_LAND_OWNERSHIP: u32 = 57;
    pub const CLEAR_SCENERY: u32 = 58;
    pub const SET_BANNER_NAME: u32 = 59;
    pub const SET_SIGN_NAME: u32 = 60;
    pub const SET_BANNER_STYLE: u32 = 61;
    pub const SET_SIGN_STYLE: u32 = 62;
    pub const SET_PLAYER_GROUP: u32 = 63;
    pub const MODIFY_GROUPS: u32 = 64;
    pub const KICK_PLAYER: u32 = 65;
    pub const CHEAT: u32 = 66;
    pub const PICKUP_GUEST: u32 = 67;
    pub const PICKUP_STAFF: u32 = 68;
    pub const BALLOON_PRESS: u32 = 69;
}

/// A game command as exchanged between peers.
///
/// `tick` is the tick at which the command executes on every peer. It is
/// assigned by the server; the value a client sends is advisory only.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GameCommand {
    pub tick: Tick,
    pub args: [u32; COMMAND_ARGS],
    pub player_id: PlayerId,
    /// Opaque token handed back to the issuer when the command completes.
    /// Zero means no callback.
    pub callback: u8,
}

impl GameCommand {
    /// Build a command of `kind` with the given flags and no other
    /// arguments.
    pub fn new(kind: u32, flags: u32) -> Self {
        let mut args = [0u32; COMMAND_ARGS];
        args[KIND_ARG] = kind;
        args[FLAGS_ARG] = flags;
        Self {
            tick: 0,
            args,
            player_id: PlayerId(0),
            callback: 0,
        }
    }

    pub fn kind(&self) -> u32 {
        self.args[KIND_ARG]
    }

    pub fn flags(&self) -> u32 {
        self.args[FLAGS_ARG]
    }

    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags() & flag != 0
    }

    /// Copy of this command with extra flag bits set.
    pub fn with_flags(mut self, flags: u32) -> Self {
        self.args[FLAGS_ARG] |= flags;
        self
    }

    /// Copy of this command with flag bits cleared.
    pub fn without_flags(mut self, flags: u32) -> Self {
        self.args[FLAGS_ARG] &= !flags;
        self
    }
}
