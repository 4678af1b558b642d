// Client half of `Session`.
//
// `begin_client` returns at once. Loading (or generating) the player's key
// pair and the TCP connect run on a background thread, which reports the
// connected stream over an `mpsc` channel; `update_client` polls it without
// blocking. Once connected, the handshake is:
//
//   client                         server
//   TOKEN            ------>
//                    <------       TOKEN (challenge)
//   AUTH (signature) ------>
//                    <------       AUTH verdict, MAP chunks, GROUPLIST, ...
//
// A `RequirePassword` verdict leaves the connection open; the host asks the
// user and calls `send_password`, which signs the stored challenge again
// and resends AUTH. Every other refusal closes the connection with the
// verdict's description as the reason.
//
// Commands the server echoes back go into the tick-ordered queue and run
// when the local simulation reaches their tick, either from `advance` or
// from `update` if the simulation is already there. The local simulation is
// never allowed to step past the last tick the server announced.

use std::net::TcpStream;
use std::sync::mpsc::{self, TryRecvError};
use std::thread;

use parklink_protocol::{AuthStatus, ClientMessage, GameCommand, NetEvent, Packet, ServerMessage, PROTOCOL_VERSION};

use crate::config::ServerInfo;
use crate::connection::{Connection, ConnectionId, ReadStatus};
use crate::desync::Fingerprint;
use crate::error::{NetError, NetResult};
use crate::keys;
use crate::permissions::GroupTable;
use crate::roster::Roster;
use crate::session::{ClientState, Mode, Session, SessionEvent};
use crate::sim::{RejectReason, Simulation};
use crate::snapshot;

impl Session {
    fn client_state(&mut self) -> Option<&mut ClientState> {
        match &mut self.mode {
            Mode::Client(client) => Some(&mut **client),
            _ => None,
        }
    }

    fn server_connection(&mut self) -> Option<&mut Connection> {
        self.client_state().and_then(|c| c.server.as_mut())
    }

    /// Connect to a server. The connect itself happens in the background;
    /// progress is reported through `drain_events`.
    pub fn begin_client(&mut self, host: &str, port: u16) -> NetResult<()> {
        if !matches!(self.mode, Mode::None) {
            return Err(NetError::AlreadyActive);
        }
        let (tx, rx) = mpsc::channel();
        let keys_dir = self.config.keys_dir();
        let name = self.config.player_name.clone();
        tracing::info!(%host, port, "connecting");
        let host = host.to_string();
        thread::spawn(move || {
            let result = keys::ensure_key_pair(&keys_dir, &name)
                .and_then(|_| TcpStream::connect((host.as_str(), port)).map_err(NetError::from));
            let _ = tx.send(result);
        });

        self.roster = Roster::new();
        self.queue.clear();
        self.desync.reset();
        self.snapshot.reset();
        self.auth_status = AuthStatus::None;
        self.mode = Mode::Client(Box::new(ClientState {
            connecting: Some(rx),
            server: None,
            server_tick: 0,
            challenge: Vec::new(),
            password: String::new(),
            server_info: None,
        }));
        Ok(())
    }

    /// Answer a `PasswordRequired` prompt.
    pub fn send_password(&mut self, password: &str) {
        let Some(client) = self.client_state() else {
            return;
        };
        client.password = password.to_string();
        let challenge = client.challenge.clone();
        if challenge.is_empty() {
            return;
        }
        self.send_auth(&challenge);
    }

    pub(crate) fn send_to_server(&mut self, message: &ClientMessage) {
        let packet = message.to_packet();
        if let Some(conn) = self.server_connection() {
            conn.send(&packet);
        }
    }

    pub(crate) fn send_command_to_server(&mut self, command: GameCommand) {
        self.send_to_server(&ClientMessage::GameCommand(command));
    }

    pub(crate) fn update_client(&mut self, sim: &mut dyn Simulation) {
        self.poll_connect();

        let liveness = self.config.liveness_timeout();
        let mut packets: Vec<Packet> = Vec::new();
        if let Some(conn) = self.server_connection() {
            loop {
                if conn.is_closed() {
                    break;
                }
                match conn.read_incoming() {
                    ReadStatus::PacketReady(packet) => packets.push(packet),
                    ReadStatus::NeedMoreData => {}
                    ReadStatus::NoData | ReadStatus::Disconnected => break,
                    ReadStatus::Malformed(e) => {
                        if e.is_fatal() {
                            tracing::warn!(error = %e, "closing connection to server");
                            conn.set_disconnect_reason("malformed packet");
                            conn.close();
                            break;
                        }
                        tracing::debug!(error = %e, "dropping packet from server");
                    }
                }
            }
        }

        for packet in packets {
            self.handle_server_packet(packet, sim);
        }

        let Some(conn) = self.server_connection() else {
            return;
        };
        if let Err(e) = conn.flush_outbound() {
            tracing::debug!(error = %e, "write to server failed");
        }
        if !conn.is_closed() && !conn.received_recently(liveness) {
            tracing::warn!("server timed out");
            conn.set_disconnect_reason("no data");
            conn.close();
        }
        if conn.is_closed() {
            let reason = conn.disconnect_reason().to_string();
            self.lose_server(reason);
            return;
        }

        if self.auth_status == AuthStatus::Ok {
            self.run_due_commands(sim);
        }
    }

    fn poll_connect(&mut self) {
        let Some(client) = self.client_state() else {
            return;
        };
        let Some(rx) = &client.connecting else {
            return;
        };
        let result = match rx.try_recv() {
            Ok(result) => result,
            Err(TryRecvError::Empty) => return,
            Err(TryRecvError::Disconnected) => Err(NetError::NotConnected),
        };
        client.connecting = None;

        let conn = result.and_then(|stream| Connection::new(ConnectionId(0), stream).map_err(NetError::from));
        match conn {
            Ok(mut conn) => {
                tracing::info!(peer = ?conn.peer(), "connected, requesting token");
                conn.send(&ClientMessage::Token.to_packet());
                client.server = Some(conn);
                self.auth_status = AuthStatus::Requested;
            }
            Err(e) => {
                tracing::warn!(error = %e, "connection failed");
                self.lose_server(e.to_string());
            }
        }
    }

    /// Tear down the client after the server went away.
    fn lose_server(&mut self, reason: String) {
        tracing::info!(%reason, "disconnected from server");
        self.close();
        self.events.push(SessionEvent::Disconnected { reason });
    }

    fn close_server_connection(&mut self, reason: &str) {
        if let Some(conn) = self.server_connection() {
            conn.set_disconnect_reason(reason);
            conn.close();
        }
    }

    fn send_auth(&mut self, challenge: &[u8]) {
        let keys_dir = self.config.keys_dir();
        let name = self.config.player_name.clone();
        match keys::sign_challenge(&keys_dir, &name, challenge) {
            Ok((public_key, signature)) => {
                let password = self
                    .client_state()
                    .map(|c| c.password.clone())
                    .unwrap_or_default();
                self.send_to_server(&ClientMessage::Auth {
                    version: PROTOCOL_VERSION.into(),
                    name,
                    password,
                    public_key,
                    signature,
                });
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to sign challenge");
                self.close_server_connection(AuthStatus::VerificationFailure.describe());
            }
        }
    }

    fn handle_server_packet(&mut self, packet: Packet, sim: &mut dyn Simulation) {
        let message = match ServerMessage::from_packet(packet) {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!(error = %e, "dropping undecodable packet from server");
                return;
            }
        };

        match message {
            ServerMessage::Token { challenge } => {
                if let Some(client) = self.client_state() {
                    client.challenge = challenge.clone();
                }
                self.send_auth(&challenge);
            }
            ServerMessage::Auth {
                status,
                player_id,
                version,
            } => {
                self.auth_status = status;
                if let Some(conn) = self.server_connection() {
                    conn.auth_status = status;
                }
                match status {
                    AuthStatus::Ok => {
                        tracing::info!(player = player_id.0, "authenticated");
                        self.roster.local_player = Some(player_id);
                        self.send_to_server(&ClientMessage::GameInfo);
                        self.events.push(SessionEvent::Authenticated(player_id));
                    }
                    AuthStatus::RequirePassword => {
                        tracing::info!("server requires a password");
                        self.events.push(SessionEvent::PasswordRequired);
                    }
                    other => {
                        let reason = match version {
                            Some(v) if other == AuthStatus::BadVersion => {
                                format!("{} (server runs {v})", other.describe())
                            }
                            _ => other.describe().to_string(),
                        };
                        tracing::warn!(status = ?other, "authentication refused");
                        self.close_server_connection(&reason);
                    }
                }
            }
            ServerMessage::Map {
                total_size,
                offset,
                chunk,
            } => self.receive_snapshot_chunk(total_size, offset, &chunk, sim),
            ServerMessage::Chat { text } => self.events.push(SessionEvent::Chat(text)),
            ServerMessage::GameCommand(command) => {
                if let Err(e) = self.queue.insert(command) {
                    tracing::error!(error = %e, tick = command.tick, "dropping command from server");
                }
            }
            ServerMessage::Tick {
                tick,
                prng_seed,
                checksum,
            } => {
                if let Some(client) = self.client_state() {
                    client.server_tick = client.server_tick.max(tick);
                }
                self.desync.record(
                    Fingerprint {
                        tick,
                        prng_seed,
                        checksum,
                    },
                    sim.current_tick(),
                );
            }
            ServerMessage::PlayerList(infos) => self.roster.players.sync_from_infos(&infos),
            ServerMessage::Ping => self.send_to_server(&ClientMessage::Ping),
            ServerMessage::PingList(pings) => {
                for (id, ping) in pings {
                    if let Some(player) = self.roster.players.get_mut(id) {
                        player.ping = ping;
                    }
                }
            }
            ServerMessage::SetDisconnectMsg { reason } => {
                if let Some(conn) = self.server_connection() {
                    conn.set_disconnect_reason(reason);
                }
            }
            ServerMessage::GameInfo { json } => match serde_json::from_str::<ServerInfo>(&json) {
                Ok(info) => {
                    if !info.greeting.is_empty() {
                        self.events.push(SessionEvent::Greeting(info.greeting.clone()));
                    }
                    self.events.push(SessionEvent::ServerInfo(info.clone()));
                    if let Some(client) = self.client_state() {
                        client.server_info = Some(info);
                    }
                }
                Err(e) => tracing::warn!(error = %e, "unreadable server info"),
            },
            ServerMessage::ShowError { title, body } => {
                self.events.push(SessionEvent::ShowError(RejectReason { title, body }));
            }
            ServerMessage::GroupList {
                default_group,
                groups,
            } => {
                self.roster.groups = GroupTable::from_infos(default_group, &groups);
            }
            ServerMessage::Event(NetEvent::PlayerJoined { name }) => {
                self.events.push(SessionEvent::PlayerJoined { name });
            }
            ServerMessage::Event(NetEvent::PlayerDisconnected { name, reason }) => {
                self.events.push(SessionEvent::PlayerDisconnected { name, reason });
            }
        }
    }

    fn receive_snapshot_chunk(&mut self, total_size: u32, offset: u32, chunk: &[u8], sim: &mut dyn Simulation) {
        let loaded = match self.snapshot.accept(total_size, offset, chunk) {
            Ok(None) => return,
            Ok(Some(encoded)) => snapshot::decode_snapshot(&encoded)
                .and_then(|raw| sim.load_snapshot(&raw).map_err(NetError::Snapshot)),
            Err(e) => Err(e),
        };
        match loaded {
            Ok(()) => {
                let tick = sim.current_tick();
                self.queue.clear();
                self.desync.reset();
                if let Some(client) = self.client_state() {
                    client.server_tick = tick;
                }
                tracing::info!(tick, bytes = total_size, "snapshot loaded");
                self.events.push(SessionEvent::SnapshotLoaded);
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to load snapshot");
                self.snapshot.reset();
                self.events.push(SessionEvent::SnapshotLoadFailed(e.to_string()));
                self.close_server_connection("failed to load snapshot");
            }
        }
    }

    /// Compare against the server's fingerprint for the tick just started.
    pub(crate) fn check_desync(&mut self, sim: &dyn Simulation) {
        let diverged = self
            .desync
            .check(sim.current_tick(), sim.prng_seed(), || sim.state_checksum());
        if !diverged {
            return;
        }
        self.events.push(SessionEvent::Desynchronized);
        if !self.config.stay_connected {
            self.close_server_connection("desynchronized");
        }
    }
}
