// The simulation as seen by the session layer.
//
// The session never looks inside the game world. It needs to read the tick
// counter and a cheap fingerprint, to price and apply commands, to move
// money, and to save and load an opaque snapshot. Everything else about the
// simulation is the implementor's business.
//
// Commands are executed in two explicit phases. `quote` prices or rejects a
// command without touching state; `apply` performs it and reports what it
// actually cost. A command that itself issues further commands does so
// through the `CommandExecutor` it is handed, which keeps the nesting depth
// and makes sure only the outermost command is transmitted and attributed.

use parklink_protocol::{ErrorText, GameCommand, Money, PlayerId, Tick};

use crate::executor::CommandExecutor;
use crate::player::PickupTarget;

/// Why a command was refused. Shown to the issuer as a title/body pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RejectReason {
    pub title: ErrorText,
    pub body: ErrorText,
}

impl RejectReason {
    pub fn new(body: ErrorText) -> Self {
        Self {
            title: ErrorText::CantDoThis,
            body,
        }
    }
}

/// Result of the dry-run phase.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Quote {
    Rejected(RejectReason),
    Priced(Money),
}

pub trait Simulation {
    fn current_tick(&self) -> Tick;

    /// Step the world by one tick.
    fn advance_tick(&mut self);

    /// Current state of the simulation's random number generator.
    fn prng_seed(&self) -> u32;

    /// Short digest of the full world state. Only requested on ticks where
    /// the server publishes one, so it may be expensive.
    fn state_checksum(&self) -> String;

    /// Price a command, or reject it, without mutating anything.
    fn quote(&self, command: &GameCommand) -> Quote;

    /// Perform a command that `quote` accepted. Returns the actual cost,
    /// which may be lower than the quoted one.
    fn apply(&mut self, command: &GameCommand, executor: &mut CommandExecutor<'_>) -> Money;

    fn can_afford(&self, cost: Money) -> bool;

    /// Debit `cost` from the park's funds.
    fn charge(&mut self, cost: Money);

    fn save_snapshot(&self) -> Vec<u8>;

    /// Replace the world with a snapshot taken by `save_snapshot`.
    fn load_snapshot(&mut self, data: &[u8]) -> Result<(), String>;

    /// Put down whatever `player` was holding when they left.
    fn release_pickup(&mut self, _player: PlayerId, _target: PickupTarget) {}
}
