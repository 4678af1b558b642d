// parklink_net: lockstep multiplayer session core.
//
// Several game processes share one authoritative simulation. The server
// validates and applies every command, then broadcasts it tagged with the
// tick it ran on; clients replay those commands at exactly that tick and
// compare periodic fingerprints to catch divergence. No world state is
// replicated per tick, only commands, plus a full snapshot when a client
// joins.
//
// Module overview:
// - `session.rs`:          `Session`, the single owned controller. The
//                          host calls `update` once per frame and
//                          `advance` once per simulation tick.
// - `server.rs` / `client.rs`: the two network roles, as `impl Session`
//                          blocks.
// - `connection.rs`:       one non-blocking TCP peer: framed reads,
//                          queued writes, liveness.
// - `auth.rs`, `keys.rs`:  Ed25519 challenge/response and key files.
// - `executor.rs`:         two-phase (quote/apply) command execution with
//                          nesting; emits network effects for the session.
// - `session_commands.rs`: group changes and kicks, which act on the roster
//                          rather than the simulation.
// - `command_queue.rs`:    client replay queue ordered by (tick, arrival).
// - `desync.rs`:           fingerprint comparison.
// - `snapshot.rs`:         compressed, chunked world transfer.
// - `roster.rs`, `player.rs`, `permissions.rs`, `users.rs`: who is
//                          connected, what groups exist, and which keys are
//                          known. Groups and users persist as JSON.
// - `sim.rs`:              the `Simulation` trait the game implements.
// - `config.rs`, `error.rs`.
//
// Everything runs on the caller's thread. The only background work is the
// client's initial connect (key loading plus `TcpStream::connect`), which
// reports back over an `mpsc` channel.
//
// The wire format lives in `parklink_protocol`.

pub mod auth;
pub mod client;
pub mod command_queue;
pub mod config;
pub mod connection;
pub mod desync;
pub mod error;
pub mod executor;
pub mod keys;
pub mod permissions;
pub mod player;
pub mod roster;
pub mod server;
pub mod session;
pub mod session_commands;
pub mod sim;
pub mod snapshot;
pub mod users;

pub use config::{NetworkConfig, ServerInfo};
pub use error::{NetError, NetResult};
pub use executor::{CommandExecutor, ExecOutcome, Role};
pub use session::{Session, SessionEvent, SessionMode};
pub use session_commands::GroupAction;
pub use sim::{Quote, RejectReason, Simulation};
