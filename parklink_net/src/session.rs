// The session controller: one owned aggregate per process.
//
// `Session` holds everything the multiplayer core keeps between frames:
// the roster (players, groups, known users), the replay queue, the desync
// detector, the snapshot receiver and the open connections. It runs in one
// of three modes. `None` is single-player; commands apply directly. `Server`
// owns a listener and one `Connection` per client. `Client` owns a single
// connection to the server.
//
// The host drives it from its main loop, on one thread:
//
//   session.update(&mut sim);                  // once per frame
//   for _ in 0..session.ticks_this_frame(sim.current_tick(), 1) {
//       if !session.may_advance(sim.current_tick()) { break; }
//       session.advance(&mut sim);             // step one tick
//   }
//
// `update` never blocks. It accepts and reads connections, runs the handlers
// for every complete packet, sends timed broadcasts and flushes. `advance`
// steps the simulation and does the work that belongs at the very start of
// a tick: the server captures the fingerprint it will announce, and the
// client compares fingerprints and then replays the commands due at the new
// tick.
//
// Server-side handlers live in `server.rs` and client-side ones in
// `client.rs`; both are further `impl Session` blocks. What the host should
// react to (chat lines, errors, joins, disconnects) is collected as
// `SessionEvent`s and handed out by `drain_events`.

use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::mpsc::Receiver;
use std::time::Instant;

use parklink_protocol::{AuthStatus, GameCommand, Money, PlayerId, Tick};

use crate::command_queue::{self, CommandQueue};
use crate::config::{NetworkConfig, ServerInfo};
use crate::connection::Connection;
use crate::desync::{DesyncDetector, Fingerprint};
use crate::error::{NetError, NetResult};
use crate::executor::{CommandExecutor, Effect, ExecOutcome, Role};
use crate::permissions::GroupTable;
use crate::player::{PickupTarget, PlayerTable};
use crate::roster::Roster;
use crate::sim::{RejectReason, Simulation};
use crate::snapshot::SnapshotReceiver;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionMode {
    None,
    Server,
    Client,
}

/// Something the host application should show or react to.
#[derive(Clone, Debug, PartialEq)]
pub enum SessionEvent {
    /// A formatted chat line.
    Chat(String),
    PlayerJoined { name: String },
    PlayerDisconnected { name: String, reason: String },
    ShowError(RejectReason),
    /// The client finished the handshake and was assigned this id.
    Authenticated(PlayerId),
    /// The server wants a password; answer with `send_password`.
    PasswordRequired,
    SnapshotLoaded,
    SnapshotLoadFailed(String),
    ServerInfo(ServerInfo),
    Greeting(String),
    Desynchronized,
    /// A command this process issued finished, with its actual cost.
    CommandCallback {
        token: u8,
        command: GameCommand,
        cost: Money,
    },
    /// The client lost its connection to the server.
    Disconnected { reason: String },
}

/// State only a server has.
pub(crate) struct ServerState {
    pub(crate) listener: TcpListener,
    pub(crate) clients: Vec<Connection>,
    pub(crate) next_connection_id: u64,
    pub(crate) last_tick_sent: Option<Instant>,
    pub(crate) last_ping_sent: Instant,
    pub(crate) tick_broadcasts: u32,
    /// Taken at the start of the current tick by `advance`.
    pub(crate) fingerprint: Option<Fingerprint>,
    pub(crate) dedicated: bool,
}

/// State only a client has.
pub(crate) struct ClientState {
    /// Pending result of the background connect.
    pub(crate) connecting: Option<Receiver<NetResult<TcpStream>>>,
    pub(crate) server: Option<Connection>,
    pub(crate) server_tick: Tick,
    /// Last challenge received, kept so a password can be sent later.
    pub(crate) challenge: Vec<u8>,
    pub(crate) password: String,
    pub(crate) server_info: Option<ServerInfo>,
}

pub(crate) enum Mode {
    None,
    Server(Box<ServerState>),
    Client(Box<ClientState>),
}

pub struct Session {
    pub(crate) config: NetworkConfig,
    pub(crate) mode: Mode,
    pub(crate) roster: Roster,
    pub(crate) queue: CommandQueue,
    pub(crate) desync: DesyncDetector,
    pub(crate) snapshot: SnapshotReceiver,
    pub(crate) auth_status: AuthStatus,
    pub(crate) events: Vec<SessionEvent>,
}

impl Session {
    pub fn new(config: NetworkConfig) -> Self {
        let queue = CommandQueue::new(config.max_queued_commands);
        Self {
            config,
            mode: Mode::None,
            roster: Roster::new(),
            queue,
            desync: DesyncDetector::new(),
            snapshot: SnapshotReceiver::new(),
            auth_status: AuthStatus::None,
            events: Vec::new(),
        }
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn mode(&self) -> SessionMode {
        match self.mode {
            Mode::None => SessionMode::None,
            Mode::Server(_) => SessionMode::Server,
            Mode::Client(_) => SessionMode::Client,
        }
    }

    pub(crate) fn role(&self) -> Role {
        match self.mode {
            Mode::None => Role::Offline,
            Mode::Server(_) => Role::Server,
            Mode::Client(_) => Role::Client,
        }
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    pub fn players(&self) -> &PlayerTable {
        &self.roster.players
    }

    pub fn groups(&self) -> &GroupTable {
        &self.roster.groups
    }

    pub fn local_player_id(&self) -> Option<PlayerId> {
        self.roster.local_player
    }

    pub fn auth_status(&self) -> AuthStatus {
        self.auth_status
    }

    pub fn is_desynchronized(&self) -> bool {
        self.desync.is_desynchronized()
    }

    /// Highest tick the server has announced. Only meaningful on a client.
    pub fn server_tick(&self) -> Option<Tick> {
        match &self.mode {
            Mode::Client(client) => Some(client.server_tick),
            _ => None,
        }
    }

    pub fn server_info(&self) -> Option<&ServerInfo> {
        match &self.mode {
            Mode::Client(client) => client.server_info.as_ref(),
            _ => None,
        }
    }

    /// Commands received but not yet replayed.
    pub fn queued_commands(&self) -> usize {
        self.queue.len()
    }

    pub fn drain_events(&mut self) -> Vec<SessionEvent> {
        std::mem::take(&mut self.events)
    }

    /// Whether the simulation may step past `local_tick`. Always true except
    /// on a client that has caught up with the server.
    pub fn may_advance(&self, local_tick: Tick) -> bool {
        match &self.mode {
            Mode::Client(client) => command_queue::may_advance(local_tick, client.server_tick),
            _ => true,
        }
    }

    /// How many ticks to run this frame given a normal rate of `base`.
    pub fn ticks_this_frame(&self, local_tick: Tick, base: u32) -> u32 {
        match &self.mode {
            Mode::Client(client) => command_queue::ticks_this_frame(
                local_tick,
                client.server_tick,
                base,
                self.config.max_lag_ticks,
            ),
            _ => base,
        }
    }

    /// Record what `player` is holding, so it can be put back if they leave.
    pub fn set_pickup_target(&mut self, player: PlayerId, target: Option<PickupTarget>) {
        if let Some(p) = self.roster.players.get_mut(player) {
            p.pickup = target;
        }
    }

    /// Remember the coordinate of a player's last action.
    pub fn set_last_action_coord(&mut self, player: PlayerId, coord: (i32, i32, i32)) {
        if let Some(p) = self.roster.players.get_mut(player) {
            p.last_action_coord = Some(coord);
        }
    }

    /// Drive networking for one frame. Never blocks.
    pub fn update(&mut self, sim: &mut dyn Simulation) {
        match self.mode {
            Mode::None => {}
            Mode::Server(_) => self.update_server(sim),
            Mode::Client(_) => self.update_client(sim),
        }
    }

    /// Step the simulation by one tick.
    pub fn advance(&mut self, sim: &mut dyn Simulation) {
        sim.advance_tick();
        match self.mode {
            Mode::None => {}
            Mode::Server(_) => self.capture_fingerprint(sim),
            Mode::Client(_) => {
                self.check_desync(sim);
                self.run_due_commands(sim);
            }
        }
    }

    /// Issue a command from this process. Offline and on the server it runs
    /// now; on a client it is sent to the server and runs when echoed back.
    pub fn execute_local(&mut self, sim: &mut dyn Simulation, command: GameCommand) -> ExecOutcome {
        let mut command = command;
        command.player_id = self.roster.local_player.unwrap_or(PlayerId(0));
        self.execute(sim, &command)
    }

    /// Run a command through the executor and act on its effects.
    pub(crate) fn execute(&mut self, sim: &mut dyn Simulation, command: &GameCommand) -> ExecOutcome {
        let role = self.role();
        let mut effects = Vec::new();
        let outcome = CommandExecutor::new(role, &mut self.roster, &mut effects).execute(sim, command);
        self.apply_effects(effects);
        if role == Role::Server && matches!(outcome, ExecOutcome::Applied(_)) {
            self.after_server_command(command.kind());
        }
        outcome
    }

    fn apply_effects(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::SendToServer(command) => self.send_command_to_server(command),
                Effect::Broadcast(command) => {
                    self.broadcast(&parklink_protocol::ServerMessage::GameCommand(command));
                }
                Effect::Callback {
                    token,
                    command,
                    cost,
                } => self.events.push(SessionEvent::CommandCallback {
                    token,
                    command,
                    cost,
                }),
                Effect::Kick(player) => self.kick(player),
                Effect::ShowError(reason) => self.events.push(SessionEvent::ShowError(reason)),
            }
        }
    }

    /// Replay every queued command due at the simulation's current tick.
    pub(crate) fn run_due_commands(&mut self, sim: &mut dyn Simulation) {
        for command in self.queue.drain_due(sim.current_tick()) {
            self.execute(sim, &command);
        }
    }

    /// Start hosting. Binds `listen_address:default_port` (port 0 picks a
    /// free one) and adds the host as player 0 in the admin group.
    pub fn begin_server(&mut self) -> NetResult<SocketAddr> {
        if !matches!(self.mode, Mode::None) {
            return Err(NetError::AlreadyActive);
        }
        let listener = TcpListener::bind((self.config.listen_address.as_str(), self.config.default_port))?;
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;

        self.roster = Roster::load(self.config.groups_path(), self.config.users_path())?;
        let host_name: String = self
            .config
            .player_name
            .chars()
            .take(crate::player::MAX_PLAYER_NAME_LEN)
            .collect();
        let host = self
            .roster
            .players
            .add(host_name, String::new(), parklink_protocol::GroupId::ADMIN)
            .ok_or(NetError::AlreadyActive)?;
        if let Some(player) = self.roster.players.get_mut(host) {
            player.flags |= parklink_protocol::types::player_flags::IS_SERVER;
        }
        self.roster.local_player = Some(host);
        self.queue.clear();
        self.desync.reset();
        self.auth_status = AuthStatus::Ok;

        self.mode = Mode::Server(Box::new(ServerState {
            listener,
            clients: Vec::new(),
            next_connection_id: 1,
            last_tick_sent: None,
            last_ping_sent: Instant::now(),
            tick_broadcasts: 0,
            fingerprint: None,
            dedicated: false,
        }));
        tracing::info!(%addr, max_players = self.config.max_players, "server listening");
        Ok(addr)
    }

    /// Mark a running server as headless; reported in GAMEINFO.
    pub fn set_dedicated(&mut self, dedicated: bool) {
        if let Mode::Server(server) = &mut self.mode {
            server.dedicated = dedicated;
        }
    }

    /// Leave the current mode. A server drops every client; a client drops
    /// its connection. Players and queued commands are cleared.
    pub fn close(&mut self) {
        match std::mem::replace(&mut self.mode, Mode::None) {
            Mode::None => return,
            Mode::Server(mut server) => {
                for conn in &mut server.clients {
                    conn.set_disconnect_reason("server shut down");
                    conn.close();
                }
                tracing::info!("server stopped");
            }
            Mode::Client(mut client) => {
                if let Some(conn) = &mut client.server {
                    conn.close();
                }
                tracing::info!("left server");
            }
        }
        self.roster.clear_players();
        self.queue.clear();
        self.snapshot.reset();
        self.desync.reset();
        self.auth_status = AuthStatus::None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parklink_protocol::types::{command_flags, command_kind};

    use crate::sim::Quote;

    struct Counter {
        tick: Tick,
        total: Money,
    }

    impl Simulation for Counter {
        fn current_tick(&self) -> Tick {
            self.tick
        }
        fn advance_tick(&mut self) {
            self.tick += 1;
        }
        fn prng_seed(&self) -> u32 {
            self.tick
        }
        fn state_checksum(&self) -> String {
            self.total.to_string()
        }
        fn quote(&self, command: &GameCommand) -> Quote {
            Quote::Priced(Money::from(command.args[0]))
        }
        fn apply(&mut self, command: &GameCommand, _executor: &mut CommandExecutor<'_>) -> Money {
            self.total += Money::from(command.args[0]);
            0
        }
        fn can_afford(&self, _cost: Money) -> bool {
            true
        }
        fn charge(&mut self, _cost: Money) {}
        fn save_snapshot(&self) -> Vec<u8> {
            Vec::new()
        }
        fn load_snapshot(&mut self, _data: &[u8]) -> Result<(), String> {
            Ok(())
        }
    }

    #[test]
    fn offline_commands_apply_immediately() {
        let mut session = Session::new(NetworkConfig::default());
        let mut sim = Counter { tick: 0, total: 0 };
        let mut cmd = GameCommand::new(command_kind::PLACE_SCENERY, command_flags::APPLY);
        cmd.args[0] = 5;
        cmd.callback = 3;
        assert_eq!(session.execute_local(&mut sim, cmd), ExecOutcome::Applied(0));
        assert_eq!(sim.total, 5);
        assert!(matches!(
            session.drain_events().as_slice(),
            [SessionEvent::CommandCallback { token: 3, .. }]
        ));
    }

    #[test]
    fn offline_never_limits_ticks() {
        let session = Session::new(NetworkConfig::default());
        assert_eq!(session.mode(), SessionMode::None);
        assert!(session.may_advance(1_000));
        assert_eq!(session.ticks_this_frame(0, 1), 1);
        assert_eq!(session.server_tick(), None);
    }

    #[test]
    fn begin_server_adds_host_and_refuses_twice() {
        let data_dir = std::env::temp_dir().join(format!(
            "parklink-session-{}-{}",
            std::process::id(),
            rand::random::<u32>()
        ));
        let config = NetworkConfig {
            listen_address: "127.0.0.1".into(),
            default_port: 0,
            player_name: "Host".into(),
            data_dir: data_dir.clone(),
            ..NetworkConfig::default()
        };
        let mut session = Session::new(config);
        let addr = session.begin_server().unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(session.mode(), SessionMode::Server);

        let host = session.local_player_id().unwrap();
        let player = session.players().get(host).unwrap();
        assert!(player.is_host());
        assert_eq!(player.group, parklink_protocol::GroupId::ADMIN);

        assert!(matches!(session.begin_server(), Err(NetError::AlreadyActive)));
        session.close();
        assert_eq!(session.mode(), SessionMode::None);
        assert!(session.players().is_empty());
        let _ = std::fs::remove_dir_all(&data_dir);
    }
}
