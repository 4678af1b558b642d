// Test-only game and peers for multiplayer integration tests.
//
// `ToyPark` is a small deterministic world implementing `Simulation`: a
// grid of scenery cells, land heights, a bank balance and a PRNG word that
// moves every tick. It understands four command kinds, one of which
// (clearing scenery) issues nested commands through the executor. Every
// applied command is appended to a log together with the tick it ran on,
// so tests can check *when* a peer applied something, not just that it did.
//
// `TestPeer` pairs a real `Session` with a `ToyPark` and drives them the
// way a game loop would. The only test-specific code is the synchronous
// polling wrappers; networking goes through the same paths as a real
// process.
//
// See also: `tests/full_pipeline.rs` for the scenarios.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use parklink_net::player::PickupTarget;
use parklink_net::sim::Quote;
use parklink_net::{
    CommandExecutor, ExecOutcome, NetworkConfig, RejectReason, Session, SessionEvent, Simulation,
};
use parklink_protocol::types::{command_flags, command_kind};
use parklink_protocol::{ErrorText, GameCommand, Money, PlayerId, Tick};
use serde::{Deserialize, Serialize};

/// Default timeout for blocking poll operations.
pub const POLL_TIMEOUT: Duration = Duration::from_secs(10);

/// Sleep between poll attempts.
const POLL_INTERVAL: Duration = Duration::from_millis(2);

pub const GRID_CELLS: usize = 64;
pub const SCENERY_COST: Money = 10;
pub const LAND_COST: Money = 5;
pub const STARTING_MONEY: Money = 10_000;

/// One applied command, as recorded by `ToyPark`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AppliedCommand {
    pub tick: Tick,
    pub kind: u32,
    pub cell: u32,
    pub value: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ToyPark {
    pub tick: Tick,
    pub seed: u32,
    pub money: Money,
    pub scenery: Vec<u32>,
    pub heights: Vec<u32>,
    pub log: Vec<AppliedCommand>,
    /// Test hook: when set, this copy's PRNG steps differently, so it
    /// drifts away from its peers.
    #[serde(skip)]
    pub drift: bool,
    /// Held entities handed back by `release_pickup`, in order.
    #[serde(skip)]
    pub released: Vec<(PlayerId, PickupTarget)>,
}

impl Default for ToyPark {
    fn default() -> Self {
        Self {
            tick: 0,
            seed: 0x2545_f491,
            money: STARTING_MONEY,
            scenery: vec![0; GRID_CELLS],
            heights: vec![0; GRID_CELLS],
            log: Vec::new(),
            drift: false,
            released: Vec::new(),
        }
    }
}

impl ToyPark {
    /// The tick at which a matching command was applied, if it was.
    pub fn applied_at(&self, kind: u32, cell: u32) -> Option<Tick> {
        self.log
            .iter()
            .find(|c| c.kind == kind && c.cell == cell)
            .map(|c| c.tick)
    }

    fn cell(command: &GameCommand) -> Option<usize> {
        let cell = command.args[0] as usize;
        (cell < GRID_CELLS).then_some(cell)
    }
}

pub fn place_scenery(cell: u32, item: u32) -> GameCommand {
    let mut cmd = GameCommand::new(command_kind::PLACE_SCENERY, command_flags::APPLY);
    cmd.args[0] = cell;
    cmd.args[2] = item;
    cmd
}

pub fn set_land_height(cell: u32, height: u32) -> GameCommand {
    let mut cmd = GameCommand::new(command_kind::SET_LAND_HEIGHT, command_flags::APPLY);
    cmd.args[0] = cell;
    cmd.args[2] = height;
    cmd
}

/// Remove every piece of scenery, one nested REMOVE_SCENERY per cell.
pub fn clear_scenery() -> GameCommand {
    GameCommand::new(command_kind::CLEAR_SCENERY, command_flags::APPLY)
}

fn remove_scenery(cell: u32) -> GameCommand {
    let mut cmd = GameCommand::new(command_kind::REMOVE_SCENERY, command_flags::APPLY);
    cmd.args[0] = cell;
    cmd
}

impl Simulation for ToyPark {
    fn current_tick(&self) -> Tick {
        self.tick
    }

    fn advance_tick(&mut self) {
        self.tick += 1;
        let mut x = self.seed;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        if self.drift {
            x = x.rotate_left(1);
        }
        self.seed = x;
        if self.tick % 10 == 0 {
            self.money += 1;
        }
    }

    fn prng_seed(&self) -> u32 {
        self.seed
    }

    fn state_checksum(&self) -> String {
        let mut hasher = DefaultHasher::new();
        self.tick.hash(&mut hasher);
        self.money.hash(&mut hasher);
        self.scenery.hash(&mut hasher);
        self.heights.hash(&mut hasher);
        format!("{:016x}", hasher.finish())
    }

    fn quote(&self, command: &GameCommand) -> Quote {
        let Some(cell) = Self::cell(command) else {
            return Quote::Rejected(RejectReason::new(ErrorText::CantDoThis));
        };
        match command.kind() {
            command_kind::PLACE_SCENERY if self.scenery[cell] != 0 => {
                Quote::Rejected(RejectReason::new(ErrorText::CantDoThis))
            }
            command_kind::PLACE_SCENERY => Quote::Priced(SCENERY_COST),
            command_kind::SET_LAND_HEIGHT => Quote::Priced(LAND_COST),
            command_kind::REMOVE_SCENERY => Quote::Priced(1),
            command_kind::CLEAR_SCENERY => {
                let occupied = self.scenery.iter().filter(|s| **s != 0).count();
                Quote::Priced(occupied as Money)
            }
            _ => Quote::Rejected(RejectReason::new(ErrorText::CantDoThis)),
        }
    }

    fn apply(&mut self, command: &GameCommand, executor: &mut CommandExecutor<'_>) -> Money {
        let cell = Self::cell(command).unwrap_or(0);
        let value = command.args[2];
        self.log.push(AppliedCommand {
            tick: self.tick,
            kind: command.kind(),
            cell: cell as u32,
            value,
        });
        match command.kind() {
            command_kind::PLACE_SCENERY => {
                self.scenery[cell] = value;
                SCENERY_COST
            }
            command_kind::SET_LAND_HEIGHT => {
                self.heights[cell] = value;
                LAND_COST
            }
            command_kind::REMOVE_SCENERY => {
                self.scenery[cell] = 0;
                1
            }
            command_kind::CLEAR_SCENERY => {
                let occupied: Vec<u32> = (0..GRID_CELLS as u32)
                    .filter(|c| self.scenery[*c as usize] != 0)
                    .collect();
                let mut total = 0;
                for c in occupied {
                    if let ExecOutcome::Applied(cost) = executor.execute(self, &remove_scenery(c)) {
                        total += cost;
                    }
                }
                total
            }
            _ => 0,
        }
    }

    fn can_afford(&self, cost: Money) -> bool {
        self.money >= cost
    }

    fn charge(&mut self, cost: Money) {
        self.money -= cost;
    }

    fn save_snapshot(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    fn load_snapshot(&mut self, data: &[u8]) -> Result<(), String> {
        let drift = self.drift;
        *self = serde_json::from_slice(data).map_err(|e| e.to_string())?;
        self.drift = drift;
        Ok(())
    }

    fn release_pickup(&mut self, player: PlayerId, target: PickupTarget) {
        self.released.push((player, target));
    }
}

/// Fresh empty data directory for a test server.
pub fn temp_data_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "parklink-mp-{tag}-{}-{}",
        std::process::id(),
        rand::random::<u32>()
    ));
    let _ = std::fs::remove_dir_all(&dir);
    dir
}

/// Config tuned for tests: loopback, OS-assigned port, frequent TICKs and
/// a checksum in every one.
pub fn test_config(name: &str, data_dir: PathBuf) -> NetworkConfig {
    NetworkConfig {
        player_name: name.into(),
        listen_address: "127.0.0.1".into(),
        default_port: 0,
        data_dir,
        tick_broadcast_interval_ms: 1,
        checksum_every_n_ticks: 1,
        ..NetworkConfig::default()
    }
}

/// A session plus the world it drives.
pub struct TestPeer {
    pub session: Session,
    pub park: ToyPark,
    /// Every event drained so far.
    pub events: Vec<SessionEvent>,
    data_dir: PathBuf,
}

impl TestPeer {
    pub fn host(config: NetworkConfig) -> (Self, std::net::SocketAddr) {
        let data_dir = config.data_dir.clone();
        let mut session = Session::new(config);
        let addr = session.begin_server().expect("begin_server failed");
        let peer = Self {
            session,
            park: ToyPark::default(),
            events: Vec::new(),
            data_dir,
        };
        (peer, addr)
    }

    /// Start connecting; call `wait_until_joined` to finish.
    pub fn connect(config: NetworkConfig, addr: std::net::SocketAddr) -> Self {
        let data_dir = config.data_dir.clone();
        let mut session = Session::new(config);
        session
            .begin_client(&addr.ip().to_string(), addr.port())
            .expect("begin_client failed");
        Self {
            session,
            park: ToyPark::default(),
            events: Vec::new(),
            data_dir,
        }
    }

    /// One frame: network update, then as many ticks as the session allows.
    pub fn frame(&mut self) {
        self.session.update(&mut self.park);
        let ticks = self.session.ticks_this_frame(self.park.tick, 1);
        for _ in 0..ticks {
            if !self.session.may_advance(self.park.tick) {
                break;
            }
            self.session.advance(&mut self.park);
        }
        self.collect_events();
    }

    /// Network update only; the world does not move.
    pub fn update_only(&mut self) {
        self.session.update(&mut self.park);
        self.collect_events();
    }

    /// Advance exactly one tick if allowed. Returns whether it did.
    pub fn step(&mut self) -> bool {
        if !self.session.may_advance(self.park.tick) {
            return false;
        }
        self.session.advance(&mut self.park);
        self.collect_events();
        true
    }

    fn collect_events(&mut self) {
        self.events.extend(self.session.drain_events());
    }

    pub fn execute(&mut self, command: GameCommand) -> ExecOutcome {
        let outcome = self.session.execute_local(&mut self.park, command);
        self.collect_events();
        outcome
    }

    pub fn count_events(&self, pred: impl Fn(&SessionEvent) -> bool) -> usize {
        self.events.iter().filter(|&e| pred(e)).count()
    }

    pub fn has_event(&self, pred: impl Fn(&SessionEvent) -> bool) -> bool {
        self.events.iter().any(pred)
    }
}

impl Drop for TestPeer {
    fn drop(&mut self) {
        self.session.close();
        let _ = std::fs::remove_dir_all(&self.data_dir);
    }
}

/// Run frames on every peer until `done` holds or the timeout expires.
pub fn pump_until(peers: &mut [&mut TestPeer], what: &str, mut done: impl FnMut(&[&mut TestPeer]) -> bool) {
    let start = Instant::now();
    loop {
        for peer in peers.iter_mut() {
            peer.frame();
        }
        if done(&*peers) {
            return;
        }
        assert!(start.elapsed() < POLL_TIMEOUT, "timed out waiting for {what}");
        thread::sleep(POLL_INTERVAL);
    }
}

/// Run frames on every peer for a fixed wall-clock duration.
pub fn pump_for(peers: &mut [&mut TestPeer], duration: Duration) {
    let start = Instant::now();
    while start.elapsed() < duration {
        for peer in peers.iter_mut() {
            peer.frame();
        }
        thread::sleep(POLL_INTERVAL);
    }
}

/// Connect a new client and pump until it holds the server's world.
pub fn join(server: &mut TestPeer, addr: std::net::SocketAddr, name: &str) -> TestPeer {
    let mut client = TestPeer::connect(test_config(name, temp_data_dir(name)), addr);
    pump_until(&mut [server, &mut client], "snapshot", |peers| {
        peers[1].has_event(|e| *e == SessionEvent::SnapshotLoaded)
    });
    client
}

/// Stop the server's world and let clients catch up to it. Afterwards
/// every peer sits at the same tick.
pub fn settle(server: &mut TestPeer, clients: &mut [&mut TestPeer]) {
    let start = Instant::now();
    let mut synced_rounds = 0;
    loop {
        server.update_only();
        for client in clients.iter_mut() {
            client.frame();
        }
        let target = server.park.tick;
        let synced = clients.iter().all(|c| c.park.tick == target && c.session.queued_commands() == 0);
        synced_rounds = if synced { synced_rounds + 1 } else { 0 };
        if synced_rounds >= 5 {
            return;
        }
        assert!(start.elapsed() < POLL_TIMEOUT, "timed out settling clients");
        thread::sleep(POLL_INTERVAL);
    }
}
