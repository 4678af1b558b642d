// Players and the table of currently connected players.
//
// Player ids are the lowest id not in use, in [0, 255), so ids are reused
// after a player leaves. The table is a `BTreeMap` keyed by id so that
// iteration (and therefore the broadcast player list) is in id order on
// every peer.

use std::collections::BTreeMap;
use std::time::Instant;

use parklink_protocol::types::player_flags;
use parklink_protocol::{GroupId, Money, PlayerId, PlayerInfo};

use crate::users::UserRegistry;

/// Longest display name, in characters.
pub const MAX_PLAYER_NAME_LEN: usize = 31;

/// An entity a player is holding with the pickup tool. Released back to
/// the simulation when the player leaves.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PickupTarget {
    pub entity: u32,
    pub previous_x: i32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Player {
    pub id: PlayerId,
    pub name: String,
    /// Empty for players known only through the broadcast player list.
    pub key_hash: String,
    pub group: GroupId,
    pub flags: u32,
    pub ping: u16,
    pub money_spent: Money,
    pub commands_executed: u32,
    pub last_action: Option<u32>,
    pub last_action_time: Option<Instant>,
    pub last_action_coord: Option<(i32, i32, i32)>,
    pub pickup: Option<PickupTarget>,
}

impl Player {
    pub fn new(id: PlayerId, name: String, key_hash: String, group: GroupId) -> Self {
        Self {
            id,
            name,
            key_hash,
            group,
            flags: 0,
            ping: 0,
            money_spent: 0,
            commands_executed: 0,
            last_action: None,
            last_action_time: None,
            last_action_coord: None,
            pickup: None,
        }
    }

    pub fn is_host(&self) -> bool {
        self.flags & player_flags::IS_SERVER != 0
    }

    /// Attribute an executed top-level command to this player.
    pub fn record_action(&mut self, command_kind: u32, cost: Money, now: Instant) {
        self.last_action = Some(command_kind);
        self.last_action_time = Some(now);
        self.money_spent += cost;
        self.commands_executed += 1;
    }

    pub fn to_info(&self) -> PlayerInfo {
        PlayerInfo {
            id: self.id,
            name: self.name.clone(),
            group: self.group,
            flags: self.flags,
            ping: self.ping,
            money_spent: self.money_spent,
            commands_ran: self.commands_executed,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct PlayerTable {
    players: BTreeMap<PlayerId, Player>,
}

impl PlayerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a player under the lowest free id. Returns `None` when all 255
    /// ids are taken.
    pub fn add(&mut self, name: String, key_hash: String, group: GroupId) -> Option<PlayerId> {
        let id = (0..u8::MAX)
            .map(PlayerId)
            .find(|id| !self.players.contains_key(id))?;
        self.players.insert(id, Player::new(id, name, key_hash, group));
        Some(id)
    }

    pub fn remove(&mut self, id: PlayerId) -> Option<Player> {
        self.players.remove(&id)
    }

    pub fn get(&self, id: PlayerId) -> Option<&Player> {
        self.players.get(&id)
    }

    pub fn get_mut(&mut self, id: PlayerId) -> Option<&mut Player> {
        self.players.get_mut(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Player> {
        self.players.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Player> {
        self.players.values_mut()
    }

    pub fn len(&self) -> usize {
        self.players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }

    pub fn clear(&mut self) {
        self.players.clear();
    }

    pub fn uses_group(&self, group: GroupId) -> bool {
        self.players.values().any(|p| p.group == group)
    }

    pub fn infos(&self) -> Vec<PlayerInfo> {
        self.players.values().map(Player::to_info).collect()
    }

    /// Replace the table with a received player list, keeping locally
    /// tracked attribution for players that are still present.
    pub fn sync_from_infos(&mut self, infos: &[PlayerInfo]) {
        let mut next = BTreeMap::new();
        for info in infos {
            let mut player = self
                .players
                .remove(&info.id)
                .unwrap_or_else(|| Player::new(info.id, String::new(), String::new(), info.group));
            player.name = info.name.clone();
            player.group = info.group;
            player.flags = info.flags;
            player.ping = info.ping;
            player.money_spent = info.money_spent;
            player.commands_executed = info.commands_ran;
            next.insert(info.id, player);
        }
        self.players = next;
    }

    /// Derive a display name no connected player or registered user already
    /// has (compared case-insensitively). Collisions get a ` #2`, ` #3`, ...
    /// suffix.
    pub fn unique_name(&self, requested: &str, users: &UserRegistry) -> String {
        let base: String = requested.trim().chars().take(MAX_PLAYER_NAME_LEN).collect();
        let taken = |candidate: &str| {
            let lower = candidate.to_lowercase();
            self.players.values().any(|p| p.name.to_lowercase() == lower)
                || users.get_by_name(candidate).is_some()
        };
        let mut candidate = base.clone();
        let mut counter = 1u32;
        while taken(&candidate) {
            counter += 1;
            candidate = format!("{base} #{counter}");
        }
        candidate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_lowest_free_and_reused() {
        let mut table = PlayerTable::new();
        let a = table.add("a".into(), String::new(), GroupId(1)).unwrap();
        let b = table.add("b".into(), String::new(), GroupId(1)).unwrap();
        let c = table.add("c".into(), String::new(), GroupId(1)).unwrap();
        assert_eq!((a, b, c), (PlayerId(0), PlayerId(1), PlayerId(2)));

        table.remove(b);
        assert_eq!(table.add("d".into(), String::new(), GroupId(1)), Some(PlayerId(1)));
    }

    #[test]
    fn table_is_bounded_at_255_players() {
        let mut table = PlayerTable::new();
        for i in 0..255 {
            assert!(table.add(format!("p{i}"), String::new(), GroupId(1)).is_some());
        }
        assert_eq!(table.add("extra".into(), String::new(), GroupId(1)), None);
    }

    #[test]
    fn unique_name_appends_counter_case_insensitively() {
        let mut table = PlayerTable::new();
        table.add("Guest".into(), String::new(), GroupId(1));
        table.add("guest #2".into(), String::new(), GroupId(1));
        let users = UserRegistry::new();
        assert_eq!(table.unique_name("GUEST", &users), "GUEST #3");
        assert_eq!(table.unique_name("Visitor", &users), "Visitor");
    }

    #[test]
    fn unique_name_avoids_registered_users() {
        let table = PlayerTable::new();
        let mut users = UserRegistry::new();
        users.get_or_insert("hash").name = "Alice".into();
        assert_eq!(table.unique_name("alice", &users), "alice #2");
    }

    #[test]
    fn unique_name_truncates_long_names() {
        let table = PlayerTable::new();
        let long = "x".repeat(50);
        assert_eq!(
            table.unique_name(&long, &UserRegistry::new()).chars().count(),
            MAX_PLAYER_NAME_LEN
        );
    }

    #[test]
    fn record_action_accumulates() {
        let mut player = Player::new(PlayerId(3), "p".into(), String::new(), GroupId(2));
        let now = Instant::now();
        player.record_action(15, 200, now);
        player.record_action(17, 50, now);
        assert_eq!(player.money_spent, 250);
        assert_eq!(player.commands_executed, 2);
        assert_eq!(player.last_action, Some(17));
    }

    #[test]
    fn sync_from_infos_replaces_roster() {
        let mut table = PlayerTable::new();
        table.add("stale".into(), String::new(), GroupId(1));
        let host = PlayerInfo {
            id: PlayerId(0),
            name: "Host".into(),
            group: GroupId(0),
            flags: player_flags::IS_SERVER,
            ping: 0,
            money_spent: 10,
            commands_ran: 1,
        };
        let guest = PlayerInfo {
            id: PlayerId(4),
            name: "Guest".into(),
            group: GroupId(1),
            flags: 0,
            ping: 30,
            money_spent: 0,
            commands_ran: 0,
        };
        table.sync_from_infos(&[host, guest]);
        assert_eq!(table.len(), 2);
        assert!(table.get(PlayerId(0)).unwrap().is_host());
        assert_eq!(table.get(PlayerId(0)).unwrap().name, "Host");
        assert_eq!(table.get(PlayerId(4)).unwrap().ping, 30);
    }
}
