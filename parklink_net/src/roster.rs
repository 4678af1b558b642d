// Who is in the session and what they may do.
//
// `Roster` bundles the player table, the group table and (on a server) the
// user registry, together with where the latter two are persisted. It is
// the state that session-owned commands (group changes, kicks) operate on,
// and the executor borrows it for the duration of one command.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Instant;

use parklink_protocol::{GroupId, Money, PlayerId};

use crate::error::NetResult;
use crate::permissions::{Group, GroupTable};
use crate::player::PlayerTable;
use crate::users::UserRegistry;

/// Bytes of a group name carried across the rename command's chunks.
pub const GROUP_NAME_DRAFT_LEN: usize = 36;

#[derive(Clone, Debug)]
struct Storage {
    groups_path: PathBuf,
    users_path: PathBuf,
}

#[derive(Clone, Debug, Default)]
pub struct Roster {
    pub players: PlayerTable,
    pub groups: GroupTable,
    pub users: UserRegistry,
    /// The player this process plays as, once known.
    pub local_player: Option<PlayerId>,
    storage: Option<Storage>,
    name_drafts: BTreeMap<PlayerId, [u8; GROUP_NAME_DRAFT_LEN]>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load groups and users from disk and remember where to save them.
    /// Missing files start from defaults.
    pub fn load(groups_path: PathBuf, users_path: PathBuf) -> NetResult<Self> {
        let groups = GroupTable::load(&groups_path)?;
        let users = UserRegistry::load(&users_path)?;
        Ok(Self {
            groups,
            users,
            storage: Some(Storage {
                groups_path,
                users_path,
            }),
            ..Self::default()
        })
    }

    pub fn persist_groups(&self) {
        let Some(storage) = &self.storage else {
            return;
        };
        if let Err(e) = self.groups.save(&storage.groups_path) {
            tracing::warn!(error = %e, "failed to save groups");
        }
    }

    pub fn persist_users(&self) {
        let Some(storage) = &self.storage else {
            return;
        };
        if let Err(e) = self.users.save(&storage.users_path) {
            tracing::warn!(error = %e, "failed to save users");
        }
    }

    pub fn group_of(&self, player: PlayerId) -> Option<&Group> {
        self.players
            .get(player)
            .and_then(|p| self.groups.get(p.group))
    }

    /// Group a key hash maps to: its registered group if that still exists,
    /// otherwise the default group.
    pub fn group_for_key(&self, hash: &str) -> GroupId {
        self.users
            .get(hash)
            .and_then(|u| u.group)
            .filter(|g| self.groups.contains(*g))
            .unwrap_or_else(|| self.groups.default_group())
    }

    /// Whether a connected player is in `group`. Registered users do not
    /// hold a group alive; removing it unassigns them.
    pub fn group_in_use(&self, group: GroupId) -> bool {
        self.players.uses_group(group)
    }

    pub fn attribute(&mut self, player: PlayerId, command_kind: u32, cost: Money) {
        if let Some(p) = self.players.get_mut(player) {
            p.record_action(command_kind, cost, Instant::now());
        }
    }

    pub(crate) fn name_draft(&self, player: PlayerId) -> [u8; GROUP_NAME_DRAFT_LEN] {
        self.name_drafts
            .get(&player)
            .copied()
            .unwrap_or([0; GROUP_NAME_DRAFT_LEN])
    }

    pub(crate) fn store_name_draft(&mut self, player: PlayerId, draft: [u8; GROUP_NAME_DRAFT_LEN]) {
        self.name_drafts.insert(player, draft);
    }

    pub(crate) fn clear_name_draft(&mut self, player: PlayerId) {
        self.name_drafts.remove(&player);
    }

    /// Forget all connected players (the registry and groups stay).
    pub fn clear_players(&mut self) {
        self.players.clear();
        self.name_drafts.clear();
        self.local_player = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_for_key_prefers_registry() {
        let mut roster = Roster::new();
        roster.users.get_or_insert("known").group = Some(GroupId(2));
        assert_eq!(roster.group_for_key("known"), GroupId(2));
        assert_eq!(roster.group_for_key("stranger"), GroupId(1));
    }

    #[test]
    fn group_for_key_falls_back_when_group_was_deleted() {
        let mut roster = Roster::new();
        roster.users.get_or_insert("known").group = Some(GroupId(42));
        assert_eq!(roster.group_for_key("known"), roster.groups.default_group());
    }

    #[test]
    fn group_in_use_counts_connected_players_only() {
        let mut roster = Roster::new();
        roster.users.get_or_insert("u").group = Some(GroupId(2));
        assert!(!roster.group_in_use(GroupId(2)));
        roster.players.add("p".into(), "u".into(), GroupId(2));
        assert!(roster.group_in_use(GroupId(2)));
    }
}
