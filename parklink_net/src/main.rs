// Headless dedicated server for parklink.
//
// Hosts a session without a game attached. The world here is a stand-in:
// a tick counter, a PRNG word and a running digest of every command that
// was applied, enough for clients to join, exchange commands and chat, and
// for the desync fingerprint to mean something. Commands are free and never
// rejected, apart from the group and kick commands the session itself
// validates.
//
// Usage:
//   parklink-server [OPTIONS]
//     --config <FILE>        JSON config file (see `NetworkConfig`)
//     --port <PORT>          Listen port (default: 11753)
//     --name <NAME>          Server name
//     --password <PASS>      Require a password to join
//     --max-players <N>      Player limit, host included (default: 16)
//     --json                 Log as JSON lines
//
// `RUST_LOG` sets the log filter (default `info`).

use std::path::PathBuf;
use std::time::Duration;

use parklink_net::sim::Quote;
use parklink_net::{CommandExecutor, NetworkConfig, Session, SessionEvent, Simulation};
use parklink_protocol::{GameCommand, Money, Tick};
use serde::{Deserialize, Serialize};

const FRAME: Duration = Duration::from_millis(25);

struct Args {
    config_path: Option<PathBuf>,
    port: Option<u16>,
    name: Option<String>,
    password: Option<String>,
    max_players: Option<u32>,
    json_logs: bool,
}

fn main() {
    let args = parse_args();
    init_tracing(args.json_logs);

    let mut config = match &args.config_path {
        Some(path) => NetworkConfig::load(path).unwrap_or_else(|e| {
            tracing::error!(path = %path.display(), error = %e, "failed to load config");
            std::process::exit(1);
        }),
        None => NetworkConfig::default(),
    };
    if let Some(port) = args.port {
        config.default_port = port;
    }
    if let Some(name) = args.name {
        config.server_name = name;
    }
    if let Some(password) = args.password {
        config.password = password;
    }
    if let Some(max) = args.max_players {
        config.max_players = max;
    }

    let mut session = Session::new(config);
    let addr = match session.begin_server() {
        Ok(addr) => addr,
        Err(e) => {
            tracing::error!(error = %e, "failed to start server");
            std::process::exit(1);
        }
    };
    session.set_dedicated(true);
    tracing::info!(%addr, "dedicated server running");

    let mut world = HeadlessWorld::default();
    loop {
        session.update(&mut world);
        for _ in 0..session.ticks_this_frame(world.current_tick(), 1) {
            session.advance(&mut world);
        }
        for event in session.drain_events() {
            log_event(&event);
        }
        std::thread::sleep(FRAME);
    }
}

fn log_event(event: &SessionEvent) {
    match event {
        SessionEvent::Chat(line) => tracing::info!(%line, "chat"),
        SessionEvent::PlayerJoined { name } => tracing::info!(%name, "joined"),
        SessionEvent::PlayerDisconnected { name, reason } => {
            tracing::info!(%name, %reason, "left");
        }
        other => tracing::debug!(?other, "session event"),
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .compact()
            .init();
    }

    std::panic::set_hook(Box::new(|info| {
        let backtrace = std::backtrace::Backtrace::capture();
        tracing::error!(%info, ?backtrace, "panic");
    }));
}

/// The stand-in world a dedicated server runs.
#[derive(Debug, Default, Serialize, Deserialize)]
struct HeadlessWorld {
    tick: Tick,
    seed: u32,
    digest: u64,
}

impl HeadlessWorld {
    fn step_seed(&mut self) {
        // xorshift32; zero is a fixed point, so start from one.
        let mut x = if self.seed == 0 { 1 } else { self.seed };
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.seed = x;
    }
}

impl Simulation for HeadlessWorld {
    fn current_tick(&self) -> Tick {
        self.tick
    }

    fn advance_tick(&mut self) {
        self.tick += 1;
        self.step_seed();
    }

    fn prng_seed(&self) -> u32 {
        self.seed
    }

    fn state_checksum(&self) -> String {
        format!("{:016x}", self.digest)
    }

    fn quote(&self, _command: &GameCommand) -> Quote {
        Quote::Priced(0)
    }

    fn apply(&mut self, command: &GameCommand, _executor: &mut CommandExecutor<'_>) -> Money {
        for word in command.args {
            self.digest = self.digest.rotate_left(7) ^ u64::from(word);
        }
        0
    }

    fn can_afford(&self, _cost: Money) -> bool {
        true
    }

    fn charge(&mut self, _cost: Money) {}

    fn save_snapshot(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    fn load_snapshot(&mut self, data: &[u8]) -> Result<(), String> {
        *self = serde_json::from_slice(data).map_err(|e| e.to_string())?;
        Ok(())
    }
}

fn parse_args() -> Args {
    let mut parsed = Args {
        config_path: None,
        port: None,
        name: None,
        password: None,
        max_players: None,
        json_logs: false,
    };
    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;

    while i < args.len() {
        match args[i].as_str() {
            "--config" => {
                i += 1;
                parsed.config_path = Some(args.get(i).map(PathBuf::from).unwrap_or_else(|| {
                    eprintln!("--config requires a file path");
                    std::process::exit(1);
                }));
            }
            "--port" => {
                i += 1;
                parsed.port = Some(args.get(i).and_then(|s| s.parse().ok()).unwrap_or_else(|| {
                    eprintln!("--port requires a valid port number");
                    std::process::exit(1);
                }));
            }
            "--name" => {
                i += 1;
                parsed.name = Some(args.get(i).cloned().unwrap_or_else(|| {
                    eprintln!("--name requires a value");
                    std::process::exit(1);
                }));
            }
            "--password" => {
                i += 1;
                parsed.password = Some(args.get(i).cloned().unwrap_or_else(|| {
                    eprintln!("--password requires a value");
                    std::process::exit(1);
                }));
            }
            "--max-players" => {
                i += 1;
                parsed.max_players = Some(args.get(i).and_then(|s| s.parse().ok()).unwrap_or_else(|| {
                    eprintln!("--max-players requires a valid number");
                    std::process::exit(1);
                }));
            }
            "--json" => parsed.json_logs = true,
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            other => {
                eprintln!("Unknown argument: {other}");
                print_usage();
                std::process::exit(1);
            }
        }
        i += 1;
    }

    parsed
}

fn print_usage() {
    println!("Usage: parklink-server [OPTIONS]");
    println!();
    println!("Options:");
    println!("  --config <FILE>        JSON config file");
    println!("  --port <PORT>          Listen port (default: 11753)");
    println!("  --name <NAME>          Server name");
    println!("  --password <PASS>      Require a password to join");
    println!("  --max-players <N>      Player limit, host included (default: 16)");
    println!("  --json                 Log as JSON lines");
    println!("  --help, -h             Show this help");
}
