// Server half of `Session`.
//
// One `update_server` pass, in order:
//
//   1. accept every pending connection on the non-blocking listener
//   2. broadcast TICK if the broadcast interval has elapsed
//   3. for each client: read and handle every complete packet, flush, and
//      close it if nothing has arrived within the liveness timeout
//   4. PING everyone and publish the ping list if the ping interval elapsed
//   5. flush, then drop closed connections (announcing departed players)
//
// Until a connection has passed authentication only TOKEN, AUTH, PING and
// GAMEINFO are acted on; anything else is ignored. After a successful AUTH
// the joining client receives, in order: the AUTH verdict with its player
// id, the world snapshot as MAP chunks, and the group list. Every
// authenticated client then hears the join event and the new player list.
//
// Commands from clients are re-checked here. The issuing player's group
// must allow the command kind, pause and load/quit requests from clients
// are dropped, and the local-only flags (GHOST, NO_SPEND) are stripped
// before the command runs through the executor as if it had originated on
// the server. A refusal is reported back to that client only.

use std::time::{Duration, Instant};

use parklink_protocol::types::{command_flags as flags, command_kind};
use parklink_protocol::{
    AuthStatus, ClientMessage, ErrorText, GameCommand, NetEvent, Packet, Permission, PlayerId,
    ServerMessage,
};

use crate::auth::{self, AdmissionPolicy, AuthAttempt};
use crate::config::ServerInfo;
use crate::connection::{Connection, ConnectionId, ReadStatus};
use crate::desync::Fingerprint;
use crate::executor::ExecOutcome;
use crate::session::{Mode, ServerState, Session, SessionEvent};
use crate::sim::Simulation;
use crate::snapshot;

/// Minimum gap between a player's last action and a scenery placement,
/// unless their group may place scenery in clusters.
const SCENERY_CLUSTER_INTERVAL: Duration = Duration::from_millis(20);

impl Session {
    fn server_state(&mut self) -> Option<&mut ServerState> {
        match &mut self.mode {
            Mode::Server(server) => Some(&mut **server),
            _ => None,
        }
    }

    fn client_connection(&mut self, index: usize) -> Option<&mut Connection> {
        self.server_state()
            .and_then(|server| server.clients.get_mut(index))
    }

    pub(crate) fn update_server(&mut self, sim: &mut dyn Simulation) {
        self.accept_connections();
        self.broadcast_tick_if_due(sim);

        let count = self.server_state().map_or(0, |s| s.clients.len());
        for index in 0..count {
            self.process_client(index, sim);
        }

        self.ping_if_due();
        if let Some(server) = self.server_state() {
            for conn in &mut server.clients {
                if let Err(e) = conn.flush_outbound() {
                    tracing::debug!(connection = %conn.id(), error = %e, "write failed");
                }
            }
        }
        self.remove_closed_clients(sim);
    }

    fn accept_connections(&mut self) {
        let Some(server) = self.server_state() else {
            return;
        };
        loop {
            match server.listener.accept() {
                Ok((stream, addr)) => {
                    let id = ConnectionId(server.next_connection_id);
                    server.next_connection_id += 1;
                    match Connection::new(id, stream) {
                        Ok(conn) => {
                            tracing::info!(connection = %id, %addr, "client connected");
                            server.clients.push(conn);
                        }
                        Err(e) => tracing::warn!(%addr, error = %e, "failed to set up connection"),
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    /// Take the fingerprint for the tick that just started. Called by
    /// `advance` before any of this tick's commands run.
    pub(crate) fn capture_fingerprint(&mut self, sim: &dyn Simulation) {
        let every = self.config.checksum_every_n_ticks;
        let Some(server) = self.server_state() else {
            return;
        };
        let with_checksum = every > 0 && server.tick_broadcasts % every == 0;
        server.fingerprint = Some(Fingerprint {
            tick: sim.current_tick(),
            prng_seed: sim.prng_seed(),
            checksum: with_checksum.then(|| sim.state_checksum()),
        });
    }

    fn broadcast_tick_if_due(&mut self, sim: &dyn Simulation) {
        let interval = self.config.tick_broadcast_interval();
        let Some(server) = self.server_state() else {
            return;
        };
        if server.last_tick_sent.is_some_and(|t| t.elapsed() < interval) {
            return;
        }
        let current = server
            .fingerprint
            .as_ref()
            .is_some_and(|fp| fp.tick == sim.current_tick());
        if !current {
            self.capture_fingerprint(sim);
        }
        let Some(server) = self.server_state() else {
            return;
        };
        let Some(fp) = server.fingerprint.clone() else {
            return;
        };
        server.last_tick_sent = Some(Instant::now());
        server.tick_broadcasts = server.tick_broadcasts.wrapping_add(1);
        self.broadcast(&ServerMessage::Tick {
            tick: fp.tick,
            prng_seed: fp.prng_seed,
            checksum: fp.checksum,
        });
    }

    fn ping_if_due(&mut self) {
        let interval = self.config.ping_interval();
        let Some(server) = self.server_state() else {
            return;
        };
        if server.last_ping_sent.elapsed() < interval {
            return;
        }
        let now = Instant::now();
        server.last_ping_sent = now;
        let ping = ServerMessage::Ping.to_packet();
        for conn in server.clients.iter_mut().filter(|c| c.is_authenticated()) {
            conn.ping_sent_at = Some(now);
            conn.send_front(&ping);
        }
        let pings = self.roster.players.iter().map(|p| (p.id, p.ping)).collect();
        self.broadcast(&ServerMessage::PingList(pings));
    }

    /// Send to every authenticated client.
    pub(crate) fn broadcast(&mut self, message: &ServerMessage) {
        let packet = message.to_packet();
        if let Some(server) = self.server_state() {
            for conn in server.clients.iter_mut().filter(|c| c.is_authenticated()) {
                conn.send(&packet);
            }
        }
    }

    fn send_to(&mut self, index: usize, message: &ServerMessage) {
        let packet = message.to_packet();
        if let Some(conn) = self.client_connection(index) {
            conn.send(&packet);
        }
    }

    fn process_client(&mut self, index: usize, sim: &mut dyn Simulation) {
        let liveness = self.config.liveness_timeout();
        let mut packets: Vec<Packet> = Vec::new();
        {
            let Some(conn) = self.client_connection(index) else {
                return;
            };
            loop {
                if conn.is_closed() || conn.is_closing() {
                    break;
                }
                match conn.read_incoming() {
                    ReadStatus::PacketReady(packet) => packets.push(packet),
                    ReadStatus::NeedMoreData => {}
                    ReadStatus::NoData | ReadStatus::Disconnected => break,
                    ReadStatus::Malformed(e) => {
                        if e.is_fatal() {
                            tracing::warn!(connection = %conn.id(), error = %e, "closing connection");
                            conn.set_disconnect_reason("malformed packet");
                            conn.close();
                            break;
                        }
                        tracing::debug!(connection = %conn.id(), error = %e, "dropping packet");
                    }
                }
            }
        }

        for packet in packets {
            self.handle_client_packet(index, packet, sim);
        }

        let Some(conn) = self.client_connection(index) else {
            return;
        };
        if let Err(e) = conn.flush_outbound() {
            tracing::debug!(connection = %conn.id(), error = %e, "write failed");
        }
        if !conn.is_closed() && !conn.received_recently(liveness) {
            tracing::info!(connection = %conn.id(), "connection timed out");
            conn.set_disconnect_reason("no data");
            conn.close();
        }
    }

    fn handle_client_packet(&mut self, index: usize, packet: Packet, sim: &mut dyn Simulation) {
        let Some(conn) = self.client_connection(index) else {
            return;
        };
        if conn.is_closed() || conn.is_closing() {
            return;
        }
        if !conn.is_authenticated() && !packet.id().allowed_before_auth() {
            tracing::debug!(connection = %conn.id(), id = ?packet.id(), "ignoring packet before auth");
            return;
        }
        let conn_id = conn.id();
        let message = match ClientMessage::from_packet(packet) {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!(connection = %conn_id, error = %e, "dropping undecodable packet");
                return;
            }
        };

        match message {
            ClientMessage::Token => self.handle_token(index),
            ClientMessage::Auth {
                version,
                name,
                password,
                public_key,
                signature,
            } => {
                let attempt = AuthAttempt {
                    version: &version,
                    name: &name,
                    password: &password,
                    public_key: &public_key,
                    signature: &signature,
                };
                self.handle_auth(index, &attempt, sim);
            }
            ClientMessage::Chat { text } => self.handle_chat(index, &text),
            ClientMessage::GameCommand(command) => self.handle_game_command(index, command, sim),
            ClientMessage::Ping => self.handle_ping(index),
            ClientMessage::GameInfo => {
                let players = self.roster.players.len() as u32;
                let dedicated = self.server_state().is_some_and(|s| s.dedicated);
                let info = ServerInfo::from_config(&self.config, players, dedicated);
                match serde_json::to_string(&info) {
                    Ok(json) => self.send_to(index, &ServerMessage::GameInfo { json }),
                    Err(e) => tracing::error!(error = %e, "failed to serialize server info"),
                }
            }
        }
    }

    fn handle_token(&mut self, index: usize) {
        let challenge = auth::generate_challenge();
        let Some(conn) = self.client_connection(index) else {
            return;
        };
        if conn.is_authenticated() {
            return;
        }
        conn.challenge = challenge.clone();
        conn.auth_status = AuthStatus::Requested;
        conn.send(&ServerMessage::Token { challenge }.to_packet());
    }

    fn handle_auth(&mut self, index: usize, attempt: &AuthAttempt<'_>, sim: &mut dyn Simulation) {
        let Some(conn) = self.client_connection(index) else {
            return;
        };
        if conn.is_authenticated() {
            return;
        }
        let challenge = std::mem::take(&mut conn.challenge);
        let conn_id = conn.id();
        let policy = AdmissionPolicy {
            password: &self.config.password,
            max_players: self.config.max_players,
            players: self.roster.players.len() as u32,
            known_keys_only: self.config.known_keys_only,
        };
        let verdict = auth::resolve_verdict(attempt, &challenge, &policy, &self.roster);

        let key_hash = match (verdict.status, verdict.key_hash) {
            (AuthStatus::Ok, Some(hash)) => hash,
            (status, _) => {
                tracing::info!(connection = %conn_id, name = attempt.name, ?status, "authentication refused");
                let version = (status == AuthStatus::BadVersion)
                    .then(|| parklink_protocol::PROTOCOL_VERSION.to_string());
                let Some(conn) = self.client_connection(index) else {
                    return;
                };
                conn.auth_status = status;
                if status == AuthStatus::RequirePassword {
                    // Kept so the resent AUTH can be verified against it.
                    conn.challenge = challenge;
                }
                conn.send(
                    &ServerMessage::Auth {
                        status,
                        player_id: PlayerId(0),
                        version,
                    }
                    .to_packet(),
                );
                if status != AuthStatus::RequirePassword {
                    conn.close_after_flush(status.describe());
                }
                return;
            }
        };

        let registered = self.roster.users.get(&key_hash);
        if let Some(g) = registered.and_then(|u| u.group) {
            if !self.roster.groups.contains(g) {
                tracing::warn!(group = g.0, hash = %key_hash, "registered group no longer exists, using default");
            }
        }
        let name = match registered.filter(|u| !u.name.is_empty()) {
            Some(user) => user.name.clone(),
            None => self.roster.players.unique_name(attempt.name, &self.roster.users),
        };
        let group = self.roster.group_for_key(&key_hash);
        let Some(player_id) = self.roster.players.add(name.clone(), key_hash, group) else {
            tracing::warn!(connection = %conn_id, "no free player ids");
            if let Some(conn) = self.client_connection(index) {
                conn.send(
                    &ServerMessage::Auth {
                        status: AuthStatus::Full,
                        player_id: PlayerId(0),
                        version: None,
                    }
                    .to_packet(),
                );
                conn.close_after_flush(AuthStatus::Full.describe());
            }
            return;
        };

        let snapshot = match snapshot::encode_snapshot(&sim.save_snapshot(), self.config.compress_snapshots) {
            Ok(encoded) => snapshot::chunk_snapshot(&encoded),
            Err(e) => {
                tracing::error!(error = %e, "failed to encode snapshot");
                Vec::new()
            }
        };
        let group_list = self.group_list();
        let Some(conn) = self.client_connection(index) else {
            return;
        };
        conn.auth_status = AuthStatus::Ok;
        conn.player = Some(player_id);
        conn.send(
            &ServerMessage::Auth {
                status: AuthStatus::Ok,
                player_id,
                version: None,
            }
            .to_packet(),
        );
        for chunk in &snapshot {
            conn.send(&chunk.to_packet());
        }
        tracing::info!(connection = %conn_id, player = player_id.0, %name, group = group.0, "player joined");

        self.broadcast(&ServerMessage::Event(NetEvent::PlayerJoined { name: name.clone() }));
        self.send_to(index, &group_list);
        self.broadcast_player_list();
        self.events.push(SessionEvent::PlayerJoined { name });
    }

    pub(crate) fn group_list(&self) -> ServerMessage {
        ServerMessage::GroupList {
            default_group: self.roster.groups.default_group(),
            groups: self.roster.groups.to_infos(),
        }
    }

    fn broadcast_player_list(&mut self) {
        let infos = self.roster.players.infos();
        self.broadcast(&ServerMessage::PlayerList(infos));
    }

    fn player_of(&mut self, index: usize) -> Option<PlayerId> {
        self.client_connection(index).and_then(|c| c.player)
    }

    fn show_error(&mut self, index: usize, body: ErrorText) {
        self.send_to(
            index,
            &ServerMessage::ShowError {
                title: ErrorText::CantDoThis,
                body,
            },
        );
    }

    fn handle_chat(&mut self, index: usize, text: &str) {
        let Some(player) = self.player_of(index) else {
            return;
        };
        let allowed = self
            .roster
            .group_of(player)
            .is_some_and(|g| g.can_perform(Permission::Chat));
        if !allowed {
            self.show_error(index, ErrorText::PermissionDenied);
            return;
        }
        let name = self
            .roster
            .players
            .get(player)
            .map(|p| p.name.clone())
            .unwrap_or_default();
        let line = format!("{name}: {text}");
        self.broadcast(&ServerMessage::Chat { text: line.clone() });
        self.events.push(SessionEvent::Chat(line));
    }

    /// Chat from the local player. On a client it goes to the server, which
    /// formats and rebroadcasts it.
    pub fn send_chat(&mut self, text: &str) {
        match self.mode {
            Mode::None => {}
            Mode::Client(_) => self.send_to_server(&ClientMessage::Chat { text: text.into() }),
            Mode::Server(_) => {
                let name = self
                    .roster
                    .local_player
                    .and_then(|id| self.roster.players.get(id))
                    .map(|p| p.name.clone())
                    .unwrap_or_default();
                let line = format!("{name}: {text}");
                self.broadcast(&ServerMessage::Chat { text: line.clone() });
                self.events.push(SessionEvent::Chat(line));
            }
        }
    }

    fn handle_game_command(&mut self, index: usize, command: GameCommand, sim: &mut dyn Simulation) {
        let Some(player_id) = self.player_of(index) else {
            return;
        };
        let kind = command.kind();
        let Some(group) = self.roster.group_of(player_id) else {
            return;
        };
        let permitted = group.can_perform_command(kind);
        let may_cluster = group.can_perform(Permission::ToggleSceneryCluster);
        if !permitted {
            tracing::debug!(player = player_id.0, kind, "command denied by group");
            self.show_error(index, ErrorText::PermissionDenied);
            return;
        }
        if kind == command_kind::PLACE_SCENERY && !may_cluster {
            let too_soon = self.roster.players.get(player_id).is_some_and(|p| {
                p.last_action_time
                    .is_some_and(|t| t.elapsed() < SCENERY_CLUSTER_INTERVAL)
            });
            if too_soon {
                self.show_error(index, ErrorText::CantDoThis);
                return;
            }
        }
        if kind == command_kind::TOGGLE_PAUSE || kind == command_kind::LOAD_OR_QUIT {
            tracing::debug!(player = player_id.0, kind, "ignoring client-only command");
            return;
        }

        let mut command = command.without_flags(flags::GHOST | flags::NO_SPEND);
        command = command.with_flags(flags::NETWORKED);
        command.player_id = player_id;
        if let ExecOutcome::Rejected(reason) = self.execute(sim, &command) {
            self.send_to(
                index,
                &ServerMessage::ShowError {
                    title: reason.title,
                    body: reason.body,
                },
            );
        }
    }

    /// Follow-up broadcasts after the server applied a session command.
    pub(crate) fn after_server_command(&mut self, kind: u32) {
        match kind {
            command_kind::MODIFY_GROUPS => {
                let list = self.group_list();
                self.broadcast(&list);
            }
            command_kind::SET_PLAYER_GROUP => self.broadcast_player_list(),
            _ => {}
        }
    }

    fn handle_ping(&mut self, index: usize) {
        let Some(conn) = self.client_connection(index) else {
            return;
        };
        let Some(sent) = conn.ping_sent_at.take() else {
            return;
        };
        let Some(player_id) = conn.player else {
            return;
        };
        let rtt = sent.elapsed().as_millis().min(u128::from(u16::MAX)) as u16;
        if let Some(player) = self.roster.players.get_mut(player_id) {
            player.ping = rtt;
        }
    }

    /// Disconnect a player after telling them why.
    pub(crate) fn kick(&mut self, player: PlayerId) {
        let Some(server) = self.server_state() else {
            return;
        };
        let Some(conn) = server.clients.iter_mut().find(|c| c.player == Some(player)) else {
            tracing::debug!(player = player.0, "kick target has no connection");
            return;
        };
        conn.send(
            &ServerMessage::SetDisconnectMsg {
                reason: "kicked".into(),
            }
            .to_packet(),
        );
        conn.close_after_flush("kicked");
        tracing::info!(player = player.0, "player kicked");
    }

    fn remove_closed_clients(&mut self, sim: &mut dyn Simulation) {
        let Some(server) = self.server_state() else {
            return;
        };
        let (closed, open): (Vec<Connection>, Vec<Connection>) =
            std::mem::take(&mut server.clients)
                .into_iter()
                .partition(Connection::is_closed);
        server.clients = open;

        for conn in closed {
            let reason = conn.disconnect_reason().to_string();
            let Some(player_id) = conn.player else {
                tracing::debug!(connection = %conn.id(), %reason, "unauthenticated connection closed");
                continue;
            };
            let Some(player) = self.roster.players.remove(player_id) else {
                continue;
            };
            self.roster.clear_name_draft(player_id);
            if let Some(target) = player.pickup {
                sim.release_pickup(player_id, target);
            }
            tracing::info!(player = player_id.0, name = %player.name, %reason, "player left");
            self.broadcast(&ServerMessage::Event(NetEvent::PlayerDisconnected {
                name: player.name.clone(),
                reason: reason.clone(),
            }));
            self.broadcast_player_list();
            self.events.push(SessionEvent::PlayerDisconnected {
                name: player.name,
                reason,
            });
        }
    }
}
