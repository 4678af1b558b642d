// Session configuration and the public server description.
//
// `NetworkConfig` carries every tunable the session reads: identity, listen
// address, admission rules, timing cadences and where persistent files live.
// It deserializes from JSON with every field optional (missing fields take
// the `Default` value), so a config file only needs to list what it changes.
//
// `ServerInfo` is the JSON blob answered to GAMEINFO requests.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{NetError, NetResult};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub player_name: String,
    pub listen_address: String,
    pub default_port: u16,
    pub max_players: u32,
    /// Empty means no password.
    pub password: String,
    /// Refuse clients whose public key hash is not in the user registry.
    pub known_keys_only: bool,
    /// Keep a client connected after a desync is detected.
    pub stay_connected: bool,
    pub server_name: String,
    pub server_description: String,
    pub server_greeting: String,
    pub provider_name: String,
    pub provider_email: String,
    pub provider_website: String,
    /// Directory holding `keys/`, `groups.json` and `users.json`.
    pub data_dir: PathBuf,
    pub tick_broadcast_interval_ms: u64,
    pub ping_interval_ms: u64,
    pub liveness_timeout_ms: u64,
    /// Ticks a client may fall behind before it runs catch-up updates.
    pub max_lag_ticks: u32,
    /// Attach a state checksum to every n-th tick broadcast. 0 disables.
    pub checksum_every_n_ticks: u32,
    /// Upper bound on commands waiting in a client's replay queue.
    pub max_queued_commands: usize,
    /// Compress world snapshots before sending.
    pub compress_snapshots: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            player_name: "Player".into(),
            listen_address: "0.0.0.0".into(),
            default_port: 11753,
            max_players: 16,
            password: String::new(),
            known_keys_only: false,
            stay_connected: true,
            server_name: "parklink server".into(),
            server_description: String::new(),
            server_greeting: String::new(),
            provider_name: String::new(),
            provider_email: String::new(),
            provider_website: String::new(),
            data_dir: PathBuf::from("."),
            tick_broadcast_interval_ms: 25,
            ping_interval_ms: 3000,
            liveness_timeout_ms: 7000,
            max_lag_ticks: 10,
            checksum_every_n_ticks: 100,
            max_queued_commands: 4096,
            compress_snapshots: true,
        }
    }
}

impl NetworkConfig {
    /// Load from a JSON file. Fields absent from the file keep their
    /// defaults.
    pub fn load(path: &Path) -> NetResult<Self> {
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text).map_err(|e| NetError::Persist {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    pub fn keys_dir(&self) -> PathBuf {
        self.data_dir.join("keys")
    }

    pub fn groups_path(&self) -> PathBuf {
        self.data_dir.join("groups.json")
    }

    pub fn users_path(&self) -> PathBuf {
        self.data_dir.join("users.json")
    }

    pub fn tick_broadcast_interval(&self) -> Duration {
        Duration::from_millis(self.tick_broadcast_interval_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.liveness_timeout_ms)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderInfo {
    pub name: String,
    pub email: String,
    pub website: String,
}

/// Public description of a running server.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerInfo {
    pub name: String,
    pub requires_password: bool,
    pub version: String,
    pub players: u32,
    pub max_players: u32,
    pub description: String,
    pub greeting: String,
    pub dedicated: bool,
    pub provider: ProviderInfo,
}

impl ServerInfo {
    pub fn from_config(config: &NetworkConfig, players: u32, dedicated: bool) -> Self {
        Self {
            name: config.server_name.clone(),
            requires_password: !config.password.is_empty(),
            version: parklink_protocol::PROTOCOL_VERSION.into(),
            players,
            max_players: config.max_players,
            description: config.server_description.clone(),
            greeting: config.server_greeting.clone(),
            dedicated,
            provider: ProviderInfo {
                name: config.provider_name.clone(),
                email: config.provider_email.clone(),
                website: config.provider_website.clone(),
            },
        }
    }
}
