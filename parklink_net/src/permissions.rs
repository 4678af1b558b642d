// Permission groups and the table that owns them.
//
// Every player belongs to exactly one group; a group holds a
// `PermissionSet`. Two invariants are enforced by every mutator here and
// re-established after loading from disk or from the wire:
//
// - Group 0 ("Admin") exists, holds every permission, and cannot be removed,
//   renamed into emptiness, or have its permissions changed.
// - The default group (assigned to unknown keys) references an existing
//   group other than Admin.
//
// Game command kinds map to a permission through `permission_for_command`.
// Kinds with no mapping are denied to everyone except Admin.
//
// On a server the table is persisted as `groups.json`:
//
//   { "default_group": 1,
//     "groups": [ { "id": 0, "name": "Admin", "permissions": ["PERMISSION_CHAT", ...] } ] }

use std::path::Path;

use parklink_protocol::types::command_kind as kind;
use parklink_protocol::{ErrorText, GroupId, GroupInfo, Permission, PermissionSet};
use serde::{Deserialize, Serialize};

use crate::error::{NetError, NetResult};

/// Longest group name, in characters.
pub const MAX_GROUP_NAME_LEN: usize = 36;

/// The permission that gates a game command kind, if any.
pub fn permission_for_command(command_kind: u32) -> Option<Permission> {
    use Permission as P;
    let permission = match command_kind {
        kind::SET_LAND_HEIGHT
        | kind::RAISE_LAND
        | kind::LOWER_LAND
        | kind::SMOOTH_LAND
        | kind::CHANGE_SURFACE_STYLE => P::Terraform,
        kind::SET_WATER_HEIGHT | kind::RAISE_WATER | kind::LOWER_WATER => P::SetWaterLevel,
        kind::TOGGLE_PAUSE => P::TogglePause,
        kind::CREATE_RIDE => P::CreateRide,
        kind::DEMOLISH_RIDE => P::RemoveRide,
        kind::PLACE_TRACK
        | kind::REMOVE_TRACK
        | kind::SET_MAZE_TRACK
        | kind::PLACE_TRACK_DESIGN
        | kind::PLACE_MAZE_DESIGN
        | kind::PLACE_RIDE_ENTRANCE_OR_EXIT
        | kind::REMOVE_RIDE_ENTRANCE_OR_EXIT => P::BuildRide,
        kind::SET_RIDE_APPEARANCE
        | kind::SET_RIDE_STATUS
        | kind::SET_RIDE_VEHICLES
        | kind::SET_RIDE_NAME
        | kind::SET_RIDE_SETTING
        | kind::SET_RIDE_PRICE
        | kind::SET_BRAKES_SPEED => P::RideProperties,
        kind::REMOVE_SCENERY
        | kind::PLACE_SCENERY
        | kind::PLACE_FENCE
        | kind::REMOVE_FENCE
        | kind::PLACE_LARGE_SCENERY
        | kind::REMOVE_LARGE_SCENERY
        | kind::PLACE_BANNER
        | kind::REMOVE_BANNER
        | kind::SET_SCENERY_COLOUR
        | kind::SET_FENCE_COLOUR
        | kind::SET_LARGE_SCENERY_COLOUR
        | kind::SET_BANNER_COLOUR
        | kind::SET_BANNER_NAME
        | kind::SET_SIGN_NAME
        | kind::SET_BANNER_STYLE
        | kind::SET_SIGN_STYLE => P::Scenery,
        kind::PLACE_PATH | kind::PLACE_PATH_FROM_TRACK | kind::REMOVE_PATH => P::Path,
        kind::CLEAR_SCENERY => P::ClearLandscape,
        kind::SET_GUEST_NAME | kind::PICKUP_GUEST | kind::BALLOON_PRESS => P::Guest,
        kind::HIRE_STAFF
        | kind::SET_STAFF_PATROL
        | kind::FIRE_STAFF
        | kind::SET_STAFF_ORDER
        | kind::SET_STAFF_NAME
        | kind::SET_STAFF_COLOUR
        | kind::PICKUP_STAFF => P::Staff,
        kind::SET_PARK_NAME
        | kind::SET_PARK_OPEN
        | kind::SET_PARK_ENTRANCE_FEE
        | kind::SET_LAND_OWNERSHIP
        | kind::BUY_LAND_RIGHTS
        | kind::PLACE_PARK_ENTRANCE
        | kind::REMOVE_PARK_ENTRANCE => P::ParkProperties,
        kind::SET_CURRENT_LOAN | kind::SET_RESEARCH_FUNDING | kind::START_MARKETING_CAMPAIGN => {
            P::ParkFunding
        }
        kind::KICK_PLAYER => P::KickPlayer,
        kind::MODIFY_GROUPS => P::ModifyGroups,
        kind::SET_PLAYER_GROUP => P::SetPlayerGroup,
        kind::CHEAT => P::Cheat,
        _ => return None,
    };
    Some(permission)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Group {
    pub id: GroupId,
    pub name: String,
    pub permissions: PermissionSet,
}

impl Group {
    pub fn can_perform(&self, permission: Permission) -> bool {
        self.permissions.contains(permission)
    }

    pub fn can_perform_command(&self, command_kind: u32) -> bool {
        if self.id == GroupId::ADMIN {
            return true;
        }
        permission_for_command(command_kind).is_some_and(|p| self.can_perform(p))
    }

    pub fn to_info(&self) -> GroupInfo {
        GroupInfo {
            id: self.id,
            name: self.name.clone(),
            permissions: self.permissions,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct GroupRecord {
    id: u8,
    name: String,
    #[serde(default)]
    permissions: Vec<String>,
}

#[derive(Serialize, Deserialize)]
struct GroupsFile {
    default_group: u8,
    groups: Vec<GroupRecord>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupTable {
    /// Sorted by id.
    groups: Vec<Group>,
    default_group: GroupId,
}

impl Default for GroupTable {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl GroupTable {
    /// Admin (0) with everything, Spectator (1) with chat only, User (2)
    /// with everything except player and group administration and cheats.
    /// Spectator is the default group.
    pub fn with_defaults() -> Self {
        let mut user = PermissionSet::all();
        for p in [
            Permission::KickPlayer,
            Permission::ModifyGroups,
            Permission::SetPlayerGroup,
            Permission::Cheat,
        ] {
            user.remove(p);
        }
        Self {
            groups: vec![
                Group {
                    id: GroupId::ADMIN,
                    name: "Admin".into(),
                    permissions: PermissionSet::all(),
                },
                Group {
                    id: GroupId(1),
                    name: "Spectator".into(),
                    permissions: [Permission::Chat].into_iter().collect(),
                },
                Group {
                    id: GroupId(2),
                    name: "User".into(),
                    permissions: user,
                },
            ],
            default_group: GroupId(1),
        }
    }

    /// Rebuild from a received group list.
    pub fn from_infos(default_group: GroupId, infos: &[GroupInfo]) -> Self {
        let mut table = Self {
            groups: infos
                .iter()
                .map(|info| Group {
                    id: info.id,
                    name: info.name.clone(),
                    permissions: info.permissions,
                })
                .collect(),
            default_group,
        };
        table.repair();
        table
    }

    pub fn to_infos(&self) -> Vec<GroupInfo> {
        self.groups.iter().map(Group::to_info).collect()
    }

    /// Restore both invariants after bulk replacement.
    fn repair(&mut self) {
        self.groups.sort_by_key(|g| g.id);
        self.groups.dedup_by_key(|g| g.id);
        if self.groups.first().is_some_and(|g| g.id == GroupId::ADMIN) {
            self.groups[0].permissions = PermissionSet::all();
        } else {
            self.groups.insert(
                0,
                Group {
                    id: GroupId::ADMIN,
                    name: "Admin".into(),
                    permissions: PermissionSet::all(),
                },
            );
        }
        if self.default_group == GroupId::ADMIN || self.get(self.default_group).is_none() {
            let fallback = self
                .groups
                .iter()
                .map(|g| g.id)
                .find(|id| *id != GroupId::ADMIN)
                .unwrap_or(GroupId::ADMIN);
            tracing::warn!(
                default_group = self.default_group.0,
                fallback = fallback.0,
                "default group is invalid, repairing"
            );
            self.default_group = fallback;
        }
    }

    pub fn get(&self, id: GroupId) -> Option<&Group> {
        self.groups
            .binary_search_by_key(&id, |g| g.id)
            .ok()
            .map(|i| &self.groups[i])
    }

    fn get_mut(&mut self, id: GroupId) -> Option<&mut Group> {
        self.groups
            .binary_search_by_key(&id, |g| g.id)
            .ok()
            .map(move |i| &mut self.groups[i])
    }

    pub fn contains(&self, id: GroupId) -> bool {
        self.get(id).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Group> {
        self.groups.iter()
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn default_group(&self) -> GroupId {
        self.default_group
    }

    pub fn set_default(&mut self, id: GroupId) -> Result<(), ErrorText> {
        if id == GroupId::ADMIN {
            return Err(ErrorText::CantSetToThisGroup);
        }
        if !self.contains(id) {
            return Err(ErrorText::UnknownGroup);
        }
        self.default_group = id;
        Ok(())
    }

    /// Add a group with no permissions under the lowest unused id.
    pub fn add(&mut self, name: &str) -> Result<GroupId, ErrorText> {
        let id = (1..=u8::MAX)
            .map(GroupId)
            .find(|id| !self.contains(*id))
            .ok_or(ErrorText::TooManyGroups)?;
        self.groups.push(Group {
            id,
            name: truncate_name(name),
            permissions: PermissionSet::empty(),
        });
        self.groups.sort_by_key(|g| g.id);
        Ok(id)
    }

    /// Remove a group. `has_members` reports whether any player or
    /// registered user is still assigned to it.
    pub fn remove(&mut self, id: GroupId, has_members: bool) -> Result<(), ErrorText> {
        if id == GroupId::ADMIN {
            return Err(ErrorText::ThisGroupCannotBeModified);
        }
        if has_members {
            return Err(ErrorText::CantRemoveGroupThatPlayersBelongTo);
        }
        if !self.contains(id) {
            return Err(ErrorText::UnknownGroup);
        }
        self.groups.retain(|g| g.id != id);
        if self.default_group == id {
            self.repair();
        }
        Ok(())
    }

    pub fn rename(&mut self, id: GroupId, name: &str) -> Result<(), ErrorText> {
        let name = truncate_name(name.trim());
        if name.is_empty() {
            return Err(ErrorText::InvalidGroupName);
        }
        let group = self.get_mut(id).ok_or(ErrorText::UnknownGroup)?;
        group.name = name;
        Ok(())
    }

    pub fn toggle_permission(&mut self, id: GroupId, permission: Permission) -> Result<(), ErrorText> {
        if id == GroupId::ADMIN {
            return Err(ErrorText::ThisGroupCannotBeModified);
        }
        let group = self.get_mut(id).ok_or(ErrorText::UnknownGroup)?;
        group.permissions.toggle(permission);
        Ok(())
    }

    pub fn set_permissions(&mut self, id: GroupId, permissions: PermissionSet) -> Result<(), ErrorText> {
        if id == GroupId::ADMIN {
            return Err(ErrorText::ThisGroupCannotBeModified);
        }
        let group = self.get_mut(id).ok_or(ErrorText::UnknownGroup)?;
        group.permissions = permissions;
        Ok(())
    }

    /// Load from `path`. A missing file yields the default groups; a file
    /// that fails to parse is an error.
    pub fn load(path: &Path) -> NetResult<Self> {
        if !path.exists() {
            return Ok(Self::with_defaults());
        }
        let text = std::fs::read_to_string(path)?;
        let file: GroupsFile = serde_json::from_str(&text).map_err(|e| NetError::Persist {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let groups = file
            .groups
            .into_iter()
            .map(|record| Group {
                id: GroupId(record.id),
                name: record.name,
                permissions: record
                    .permissions
                    .iter()
                    .filter_map(|name| {
                        let p = Permission::from_name(name);
                        if p.is_none() {
                            tracing::warn!(%name, "ignoring unknown permission in groups file");
                        }
                        p
                    })
                    .collect(),
            })
            .collect();
        let mut table = Self {
            groups,
            default_group: GroupId(file.default_group),
        };
        table.repair();
        Ok(table)
    }

    pub fn save(&self, path: &Path) -> NetResult<()> {
        let file = GroupsFile {
            default_group: self.default_group.0,
            groups: self
                .groups
                .iter()
                .map(|g| GroupRecord {
                    id: g.id.0,
                    name: g.name.clone(),
                    permissions: g.permissions.iter().map(|p| p.name().to_string()).collect(),
                })
                .collect(),
        };
        let json = serde_json::to_string_pretty(&file).map_err(|e| NetError::Persist {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, json)?;
        Ok(())
    }
}

fn truncate_name(name: &str) -> String {
    name.chars().take(MAX_GROUP_NAME_LEN).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_groups() {
        let table = GroupTable::with_defaults();
        assert_eq!(table.len(), 3);
        assert_eq!(table.default_group(), GroupId(1));

        let admin = table.get(GroupId::ADMIN).unwrap();
        assert!(Permission::ALL.iter().all(|p| admin.can_perform(*p)));

        let spectator = table.get(GroupId(1)).unwrap();
        assert!(spectator.can_perform(Permission::Chat));
        assert!(!spectator.can_perform(Permission::Scenery));

        let user = table.get(GroupId(2)).unwrap();
        assert!(user.can_perform(Permission::Scenery));
        assert!(!user.can_perform(Permission::KickPlayer));
        assert!(!user.can_perform(Permission::Cheat));
    }

    #[test]
    fn command_gating_follows_permissions() {
        let table = GroupTable::with_defaults();
        let spectator = table.get(GroupId(1)).unwrap();
        let user = table.get(GroupId(2)).unwrap();
        let admin = table.get(GroupId::ADMIN).unwrap();

        assert!(!spectator.can_perform_command(kind::PLACE_SCENERY));
        assert!(user.can_perform_command(kind::PLACE_SCENERY));
        assert!(!user.can_perform_command(kind::KICK_PLAYER));
        assert!(admin.can_perform_command(kind::KICK_PLAYER));
        // Unmapped kinds are admin-only.
        assert!(!user.can_perform_command(kind::LOAD_OR_QUIT));
        assert!(admin.can_perform_command(kind::LOAD_OR_QUIT));
    }

    #[test]
    fn toggling_a_bit_grants_then_revokes() {
        let mut table = GroupTable::with_defaults();
        let spectator = GroupId(1);
        assert!(!table.get(spectator).unwrap().can_perform_command(kind::PLACE_SCENERY));

        table.toggle_permission(spectator, Permission::Scenery).unwrap();
        assert!(table.get(spectator).unwrap().can_perform_command(kind::PLACE_SCENERY));

        table.toggle_permission(spectator, Permission::Scenery).unwrap();
        assert!(!table.get(spectator).unwrap().can_perform_command(kind::PLACE_SCENERY));
    }

    #[test]
    fn admin_group_is_protected() {
        let mut table = GroupTable::with_defaults();
        assert_eq!(
            table.remove(GroupId::ADMIN, false),
            Err(ErrorText::ThisGroupCannotBeModified)
        );
        assert_eq!(
            table.toggle_permission(GroupId::ADMIN, Permission::Chat),
            Err(ErrorText::ThisGroupCannotBeModified)
        );
        assert_eq!(
            table.set_default(GroupId::ADMIN),
            Err(ErrorText::CantSetToThisGroup)
        );
        assert!(table.get(GroupId::ADMIN).unwrap().can_perform(Permission::Chat));
    }

    #[test]
    fn group_with_members_cannot_be_removed() {
        let mut table = GroupTable::with_defaults();
        assert_eq!(
            table.remove(GroupId(2), true),
            Err(ErrorText::CantRemoveGroupThatPlayersBelongTo)
        );
        assert!(table.remove(GroupId(2), false).is_ok());
        assert!(!table.contains(GroupId(2)));
    }

    #[test]
    fn removing_default_group_picks_another() {
        let mut table = GroupTable::with_defaults();
        table.remove(GroupId(1), false).unwrap();
        assert_eq!(table.default_group(), GroupId(2));
    }

    #[test]
    fn add_reuses_lowest_free_id() {
        let mut table = GroupTable::with_defaults();
        table.remove(GroupId(1), false).unwrap();
        assert_eq!(table.add("Builders"), Ok(GroupId(1)));
        assert_eq!(table.add("Guests"), Ok(GroupId(3)));
        assert_eq!(table.get(GroupId(3)).unwrap().permissions, PermissionSet::empty());
    }

    #[test]
    fn rename_rejects_empty_names() {
        let mut table = GroupTable::with_defaults();
        assert_eq!(table.rename(GroupId(2), "   "), Err(ErrorText::InvalidGroupName));
        table.rename(GroupId(2), "Builders").unwrap();
        assert_eq!(table.get(GroupId(2)).unwrap().name, "Builders");
    }

    #[test]
    fn wire_infos_repair_admin_and_default() {
        let infos = vec![GroupInfo {
            id: GroupId(4),
            name: "Odd".into(),
            permissions: PermissionSet::empty(),
        }];
        let table = GroupTable::from_infos(GroupId(9), &infos);
        assert!(table.contains(GroupId::ADMIN));
        assert_eq!(table.default_group(), GroupId(4));
    }

    #[test]
    fn persistence_roundtrip() {
        let path = std::env::temp_dir().join(format!(
            "parklink-groups-{}-{}.json",
            std::process::id(),
            rand::random::<u32>()
        ));
        let mut table = GroupTable::with_defaults();
        let id = table.add("Builders").unwrap();
        table.toggle_permission(id, Permission::BuildRide).unwrap();
        table.set_default(id).unwrap();
        table.save(&path).unwrap();

        let loaded = GroupTable::load(&path).unwrap();
        assert_eq!(loaded, table);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn missing_file_loads_defaults() {
        let path = std::env::temp_dir().join("parklink-groups-does-not-exist.json");
        assert_eq!(GroupTable::load(&path).unwrap(), GroupTable::with_defaults());
    }
}
