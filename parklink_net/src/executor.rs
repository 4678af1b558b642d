// Two-phase command execution with nesting.
//
// Every command, whether issued locally, received from a client, or replayed
// from the queue, goes through `CommandExecutor::execute`:
//
//   1. quote: price or reject without mutating anything
//   2. top level only: affordability check
//   3. stop here unless the APPLY flag is set
//   4. top level only: transmit
//        client: hand to the server and stop; the echo applies it later
//        server: broadcast with the current tick, then carry on
//   5. apply; the cost it reports is capped at the quote
//   6. top level only: callback, charge, attribute to the issuing player
//
// "Top level" means the nesting depth is 1. A simulation that issues a
// command from inside `apply` calls back into the same executor, so nested
// commands are priced and applied but never transmitted, charged or
// attributed on their own.
//
// Side effects that need the network (sends, kicks, error popups) are not
// performed here. They are pushed as `Effect`s for the session to act on
// once the executor is done, which keeps this module free of connections.

use parklink_protocol::types::{command_flags as flags, command_kind};
use parklink_protocol::{ErrorText, GameCommand, Money, PlayerId};

use crate::roster::Roster;
use crate::session_commands;
use crate::sim::{Quote, RejectReason, Simulation};

/// Which side of the network this process is on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Offline,
    Server,
    Client,
}

/// Work for the session to carry out after a command ran.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Effect {
    /// Client: forward a locally issued command to the server.
    SendToServer(GameCommand),
    /// Server: send an approved command to every client.
    Broadcast(GameCommand),
    /// The issuer's completion token for a command it started.
    Callback {
        token: u8,
        command: GameCommand,
        cost: Money,
    },
    /// Server: disconnect a player.
    Kick(PlayerId),
    /// A locally issued command was refused.
    ShowError(RejectReason),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecOutcome {
    Rejected(RejectReason),
    /// Priced only; APPLY was not set.
    Quoted(Money),
    /// Sent to the server; it runs when echoed back.
    Deferred(Money),
    Applied(Money),
}

impl ExecOutcome {
    pub fn is_rejected(&self) -> bool {
        matches!(self, ExecOutcome::Rejected(_))
    }
}

pub struct CommandExecutor<'a> {
    role: Role,
    nest_level: u32,
    roster: &'a mut Roster,
    effects: &'a mut Vec<Effect>,
}

impl<'a> CommandExecutor<'a> {
    pub fn new(role: Role, roster: &'a mut Roster, effects: &'a mut Vec<Effect>) -> Self {
        Self {
            role,
            nest_level: 0,
            roster,
            effects,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Depth of the command currently running; 0 between commands.
    pub fn nest_level(&self) -> u32 {
        self.nest_level
    }

    pub fn roster(&self) -> &Roster {
        self.roster
    }

    pub fn execute(&mut self, sim: &mut dyn Simulation, command: &GameCommand) -> ExecOutcome {
        self.nest_level += 1;
        let outcome = self.run(sim, command);
        self.nest_level -= 1;

        if let ExecOutcome::Rejected(reason) = outcome {
            tracing::debug!(
                kind = command.kind(),
                player = command.player_id.0,
                ?reason,
                "command rejected"
            );
            if self.nest_level == 0
                && command.has_flag(flags::APPLY)
                && !command.has_flag(flags::NETWORKED)
            {
                self.effects.push(Effect::ShowError(reason));
            }
        }
        outcome
    }

    fn run(&mut self, sim: &mut dyn Simulation, command: &GameCommand) -> ExecOutcome {
        let top_level = self.nest_level == 1;
        let session_owned = session_commands::is_session_command(command.kind());

        let quote = if session_owned {
            session_commands::quote(self.roster, command)
        } else {
            sim.quote(command)
        };
        let cost = match quote {
            Quote::Rejected(reason) => return ExecOutcome::Rejected(reason),
            Quote::Priced(cost) => cost,
        };

        if top_level && cost != 0 && !command.has_flag(flags::NO_SPEND) && !sim.can_afford(cost) {
            return ExecOutcome::Rejected(RejectReason::new(ErrorText::InsufficientFunds));
        }
        if !command.has_flag(flags::APPLY) {
            return ExecOutcome::Quoted(cost);
        }

        if top_level && self.transmits(command) {
            match self.role {
                Role::Client => {
                    self.effects.push(Effect::SendToServer(*command));
                    return ExecOutcome::Deferred(cost);
                }
                Role::Server => {
                    let mut echoed = command.with_flags(flags::NETWORKED);
                    echoed.tick = sim.current_tick();
                    self.effects.push(Effect::Broadcast(echoed));
                }
                Role::Offline => {}
            }
        }

        let reported = if session_owned {
            session_commands::apply(self.roster, self.role, command, self.effects)
        } else {
            sim.apply(command, self)
        };
        // Never more than the quote the affordability check approved.
        let actual = reported.min(cost);

        if top_level {
            if !command.has_flag(flags::GHOST)
                && command.callback != 0
                && self.is_local(command.player_id)
            {
                self.effects.push(Effect::Callback {
                    token: command.callback,
                    command: *command,
                    cost: actual,
                });
            }
            if !command.has_flag(flags::NO_SPEND) {
                sim.charge(actual);
            }
            if self.role == Role::Server && !command.has_flag(flags::GHOST) {
                self.roster.attribute(command.player_id, command.kind(), actual);
            }
        }
        ExecOutcome::Applied(actual)
    }

    /// Whether a top-level command leaves this process. A client forwards
    /// only what it originated; a server rebroadcasts everything it applies,
    /// including commands that arrived from clients.
    fn transmits(&self, command: &GameCommand) -> bool {
        if command.has_flag(flags::GHOST)
            || command.has_flag(flags::NO_SPEND)
            || command.kind() == command_kind::LOAD_OR_QUIT
        {
            return false;
        }
        match self.role {
            Role::Offline => false,
            Role::Client => !command.has_flag(flags::NETWORKED),
            Role::Server => true,
        }
    }

    fn is_local(&self, player: PlayerId) -> bool {
        match self.role {
            Role::Offline => true,
            Role::Server | Role::Client => self.roster.local_player == Some(player),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parklink_protocol::GroupId;

    const REJECTED_KIND: u32 = 100;
    const OUTER_KIND: u32 = 101;
    const INNER_KIND: u32 = 102;
    /// Reports three times its quoted cost from `apply`.
    const OVERCHARGE_KIND: u32 = 103;

    /// Minimal world: a bank balance and a log of applied commands. The cost
    /// of a command is its first argument word.
    struct Ledger {
        tick: u32,
        money: Money,
        applied: Vec<u32>,
    }

    impl Ledger {
        fn new(money: Money) -> Self {
            Self {
                tick: 7,
                money,
                applied: Vec::new(),
            }
        }
    }

    impl Simulation for Ledger {
        fn current_tick(&self) -> u32 {
            self.tick
        }
        fn advance_tick(&mut self) {
            self.tick += 1;
        }
        fn prng_seed(&self) -> u32 {
            0
        }
        fn state_checksum(&self) -> String {
            String::new()
        }
        fn quote(&self, command: &GameCommand) -> Quote {
            if command.kind() == REJECTED_KIND {
                Quote::Rejected(RejectReason::new(ErrorText::CantDoThis))
            } else {
                Quote::Priced(Money::from(command.args[0]))
            }
        }
        fn apply(&mut self, command: &GameCommand, executor: &mut CommandExecutor<'_>) -> Money {
            self.applied.push(command.kind());
            if command.kind() == OUTER_KIND {
                let mut inner = GameCommand::new(INNER_KIND, flags::APPLY);
                inner.args[0] = 5;
                inner.player_id = command.player_id;
                let outcome = executor.execute(self, &inner);
                assert_eq!(outcome, ExecOutcome::Applied(5));
                assert_eq!(executor.nest_level(), 1);
            }
            if command.kind() == OVERCHARGE_KIND {
                return Money::from(command.args[0]) * 3;
            }
            Money::from(command.args[0])
        }
        fn can_afford(&self, cost: Money) -> bool {
            self.money >= cost
        }
        fn charge(&mut self, cost: Money) {
            self.money -= cost;
        }
        fn save_snapshot(&self) -> Vec<u8> {
            Vec::new()
        }
        fn load_snapshot(&mut self, _data: &[u8]) -> Result<(), String> {
            Ok(())
        }
    }

    fn command(kind: u32, cost: u32, command_flags: u32) -> GameCommand {
        let mut cmd = GameCommand::new(kind, command_flags);
        cmd.args[0] = cost;
        cmd.callback = 9;
        cmd
    }

    fn roster_with_host() -> Roster {
        let mut roster = Roster::new();
        let host = roster
            .players
            .add("Host".into(), String::new(), GroupId::ADMIN)
            .unwrap();
        roster.local_player = Some(host);
        roster
    }

    #[test]
    fn dry_run_does_not_mutate() {
        let mut sim = Ledger::new(1000);
        let mut roster = Roster::new();
        let mut effects = Vec::new();
        let mut exec = CommandExecutor::new(Role::Offline, &mut roster, &mut effects);

        let outcome = exec.execute(&mut sim, &command(1, 300, 0));
        assert_eq!(outcome, ExecOutcome::Quoted(300));
        assert_eq!(sim.money, 1000);
        assert!(sim.applied.is_empty());
        assert!(effects.is_empty());
    }

    #[test]
    fn offline_apply_charges_and_calls_back() {
        let mut sim = Ledger::new(1000);
        let mut roster = Roster::new();
        let mut effects = Vec::new();
        let mut exec = CommandExecutor::new(Role::Offline, &mut roster, &mut effects);

        let cmd = command(1, 300, flags::APPLY);
        assert_eq!(exec.execute(&mut sim, &cmd), ExecOutcome::Applied(300));
        assert_eq!(sim.money, 700);
        assert_eq!(sim.applied, vec![1]);
        assert_eq!(
            effects,
            vec![Effect::Callback {
                token: 9,
                command: cmd,
                cost: 300
            }]
        );
    }

    #[test]
    fn nested_commands_are_charged_and_broadcast_once() {
        let mut sim = Ledger::new(1000);
        let mut roster = roster_with_host();
        let mut effects = Vec::new();
        let mut exec = CommandExecutor::new(Role::Server, &mut roster, &mut effects);

        let cmd = command(OUTER_KIND, 100, flags::APPLY);
        assert_eq!(exec.execute(&mut sim, &cmd), ExecOutcome::Applied(100));
        assert_eq!(exec.nest_level(), 0);
        assert_eq!(sim.applied, vec![OUTER_KIND, INNER_KIND]);
        // Only the outer cost is debited; the outer command accounts for
        // whatever it spends through nested commands.
        assert_eq!(sim.money, 900);

        let broadcasts: Vec<_> = effects
            .iter()
            .filter_map(|e| match e {
                Effect::Broadcast(c) => Some(*c),
                _ => None,
            })
            .collect();
        assert_eq!(broadcasts.len(), 1);
        assert_eq!(broadcasts[0].kind(), OUTER_KIND);
        assert_eq!(broadcasts[0].tick, 7);
        assert!(broadcasts[0].has_flag(flags::NETWORKED));

        let host = roster.players.get(PlayerId(0)).unwrap();
        assert_eq!(host.commands_executed, 1);
        assert_eq!(host.money_spent, 100);
        assert_eq!(host.last_action, Some(OUTER_KIND));
    }

    #[test]
    fn charge_is_capped_at_the_quote() {
        let mut sim = Ledger::new(1000);
        let mut roster = roster_with_host();
        let mut effects = Vec::new();
        let mut exec = CommandExecutor::new(Role::Server, &mut roster, &mut effects);

        let cmd = command(OVERCHARGE_KIND, 100, flags::APPLY);
        assert_eq!(exec.execute(&mut sim, &cmd), ExecOutcome::Applied(100));
        assert_eq!(sim.money, 900);
        assert!(effects.contains(&Effect::Callback {
            token: 9,
            command: cmd,
            cost: 100
        }));
        assert_eq!(roster.players.get(PlayerId(0)).unwrap().money_spent, 100);
    }

    #[test]
    fn client_defers_local_commands_to_server() {
        let mut sim = Ledger::new(1000);
        let mut roster = roster_with_host();
        let mut effects = Vec::new();
        let mut exec = CommandExecutor::new(Role::Client, &mut roster, &mut effects);

        let cmd = command(1, 50, flags::APPLY);
        assert_eq!(exec.execute(&mut sim, &cmd), ExecOutcome::Deferred(50));
        assert!(sim.applied.is_empty());
        assert_eq!(sim.money, 1000);
        assert_eq!(effects, vec![Effect::SendToServer(cmd)]);
    }

    #[test]
    fn client_applies_echoed_commands_without_attribution() {
        let mut sim = Ledger::new(1000);
        let mut roster = roster_with_host();
        let mut effects = Vec::new();
        let mut exec = CommandExecutor::new(Role::Client, &mut roster, &mut effects);

        let cmd = command(1, 50, flags::APPLY | flags::NETWORKED);
        assert_eq!(exec.execute(&mut sim, &cmd), ExecOutcome::Applied(50));
        assert_eq!(sim.applied, vec![1]);
        assert_eq!(sim.money, 950);
        // The echo carries the local player's id, so the callback fires now.
        assert!(matches!(effects[..], [Effect::Callback { token: 9, .. }]));
        assert_eq!(roster.players.get(PlayerId(0)).unwrap().commands_executed, 0);
    }

    #[test]
    fn ghost_commands_stay_local() {
        let mut sim = Ledger::new(1000);
        let mut roster = roster_with_host();
        let mut effects = Vec::new();
        let mut exec = CommandExecutor::new(Role::Client, &mut roster, &mut effects);

        let cmd = command(1, 0, flags::APPLY | flags::GHOST);
        assert_eq!(exec.execute(&mut sim, &cmd), ExecOutcome::Applied(0));
        assert_eq!(sim.applied, vec![1]);
        assert!(effects.is_empty());
    }

    #[test]
    fn unaffordable_command_is_rejected_before_apply() {
        let mut sim = Ledger::new(10);
        let mut roster = Roster::new();
        let mut effects = Vec::new();
        let mut exec = CommandExecutor::new(Role::Offline, &mut roster, &mut effects);

        let outcome = exec.execute(&mut sim, &command(1, 500, flags::APPLY));
        let reason = RejectReason::new(ErrorText::InsufficientFunds);
        assert_eq!(outcome, ExecOutcome::Rejected(reason));
        assert!(sim.applied.is_empty());
        assert_eq!(sim.money, 10);
        assert_eq!(effects, vec![Effect::ShowError(reason)]);
    }

    #[test]
    fn no_spend_commands_skip_affordability_and_charge() {
        let mut sim = Ledger::new(10);
        let mut roster = Roster::new();
        let mut effects = Vec::new();
        let mut exec = CommandExecutor::new(Role::Offline, &mut roster, &mut effects);

        let outcome = exec.execute(&mut sim, &command(1, 500, flags::APPLY | flags::NO_SPEND));
        assert_eq!(outcome, ExecOutcome::Applied(500));
        assert_eq!(sim.money, 10);
    }

    #[test]
    fn rejected_remote_command_raises_no_local_error() {
        let mut sim = Ledger::new(1000);
        let mut roster = roster_with_host();
        let mut effects = Vec::new();
        let mut exec = CommandExecutor::new(Role::Server, &mut roster, &mut effects);

        let outcome = exec.execute(
            &mut sim,
            &command(REJECTED_KIND, 0, flags::APPLY | flags::NETWORKED),
        );
        assert!(outcome.is_rejected());
        assert!(effects.is_empty());
    }
}
