// Game commands the session itself owns: group administration, assigning
// players to groups, and kicking.
//
// They travel through the same queue and executor as simulation commands so
// that every peer applies them at the same tick, but their state lives in
// the `Roster`, not in the simulation.
//
// Argument layout (word 4 is always the kind, word 1 the flags):
//
//   SET_PLAYER_GROUP  [2] player id, [3] group id
//   KICK_PLAYER       [2] player id
//   MODIFY_GROUPS     [0] action | group << 8 | name chunk << 16
//                     [2] permission index, [3] permission mode
//                     rename: [3], [5], [6] carry 12 bytes of the name
//
// A group name is up to 36 bytes, so a rename is sent as three commands.
// Chunks 1 and 2 are stashed per issuing player; chunk 0 carries the last
// twelve bytes and performs the rename.

use parklink_protocol::types::{command_flags, command_kind};
use parklink_protocol::{ErrorText, GameCommand, GroupId, Money, Permission, PlayerId};

use crate::executor::{Effect, Role};
use crate::roster::{GROUP_NAME_DRAFT_LEN, Roster};
use crate::sim::{Quote, RejectReason};

const ACTION_ADD: u32 = 0;
const ACTION_REMOVE: u32 = 1;
const ACTION_SET_PERMISSIONS: u32 = 2;
const ACTION_RENAME: u32 = 3;
const ACTION_SET_DEFAULT: u32 = 4;

const PERMISSIONS_TOGGLE: u32 = 0;
const PERMISSIONS_ALL: u32 = 1;
const PERMISSIONS_NONE: u32 = 2;

const CHUNK_LEN: usize = 12;
const NAME_WORDS: [usize; 3] = [3, 5, 6];

/// A change to the group table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GroupAction {
    Add,
    Remove(GroupId),
    TogglePermission(GroupId, Permission),
    /// Grant the issuer's own permissions (`true`) or clear all (`false`).
    SetAllPermissions(GroupId, bool),
    Rename(GroupId, String),
    SetDefault(GroupId),
}

pub fn is_session_command(kind: u32) -> bool {
    matches!(
        kind,
        command_kind::SET_PLAYER_GROUP | command_kind::MODIFY_GROUPS | command_kind::KICK_PLAYER
    )
}

pub fn set_player_group(player: PlayerId, group: GroupId) -> GameCommand {
    let mut cmd = GameCommand::new(command_kind::SET_PLAYER_GROUP, command_flags::APPLY);
    cmd.args[2] = u32::from(player.0);
    cmd.args[3] = u32::from(group.0);
    cmd
}

pub fn kick_player(player: PlayerId) -> GameCommand {
    let mut cmd = GameCommand::new(command_kind::KICK_PLAYER, command_flags::APPLY);
    cmd.args[2] = u32::from(player.0);
    cmd
}

/// The command(s) that perform `action`. Everything but a rename is a
/// single command.
pub fn modify_groups(action: &GroupAction) -> Vec<GameCommand> {
    let base = |action_code: u32, group: GroupId, chunk: u32| {
        let mut cmd = GameCommand::new(command_kind::MODIFY_GROUPS, command_flags::APPLY);
        cmd.args[0] = action_code | (u32::from(group.0) << 8) | (chunk << 16);
        cmd
    };
    match action {
        GroupAction::Add => vec![base(ACTION_ADD, GroupId(0), 0)],
        GroupAction::Remove(group) => vec![base(ACTION_REMOVE, *group, 0)],
        GroupAction::TogglePermission(group, permission) => {
            let mut cmd = base(ACTION_SET_PERMISSIONS, *group, 0);
            cmd.args[2] = permission.index() as u32;
            cmd.args[3] = PERMISSIONS_TOGGLE;
            vec![cmd]
        }
        GroupAction::SetAllPermissions(group, on) => {
            let mut cmd = base(ACTION_SET_PERMISSIONS, *group, 0);
            cmd.args[3] = if *on { PERMISSIONS_ALL } else { PERMISSIONS_NONE };
            vec![cmd]
        }
        GroupAction::Rename(group, name) => {
            let mut bytes = [0u8; GROUP_NAME_DRAFT_LEN];
            let name = name.as_bytes();
            let len = name.len().min(GROUP_NAME_DRAFT_LEN);
            bytes[..len].copy_from_slice(&name[..len]);
            // Chunks 1 and 2 first, then chunk 0 which triggers the rename.
            [1u32, 2, 0]
                .into_iter()
                .map(|chunk| {
                    let mut cmd = base(ACTION_RENAME, *group, chunk);
                    let offset = chunk_offset(chunk);
                    for (i, word) in NAME_WORDS.iter().enumerate() {
                        let start = offset + i * 4;
                        let mut raw = [0u8; 4];
                        raw.copy_from_slice(&bytes[start..start + 4]);
                        cmd.args[*word] = u32::from_le_bytes(raw);
                    }
                    cmd
                })
                .collect()
        }
        GroupAction::SetDefault(group) => vec![base(ACTION_SET_DEFAULT, *group, 0)],
    }
}

fn chunk_offset(chunk: u32) -> usize {
    match chunk {
        1 => 0,
        2 => CHUNK_LEN,
        _ => 2 * CHUNK_LEN,
    }
}

fn chunk_bytes(cmd: &GameCommand) -> [u8; CHUNK_LEN] {
    let mut out = [0u8; CHUNK_LEN];
    for (i, word) in NAME_WORDS.iter().enumerate() {
        out[i * 4..i * 4 + 4].copy_from_slice(&cmd.args[*word].to_le_bytes());
    }
    out
}

/// The name a rename would produce if `cmd` is its final chunk.
fn assembled_name(roster: &Roster, cmd: &GameCommand) -> String {
    let mut draft = roster.name_draft(cmd.player_id);
    draft[2 * CHUNK_LEN..].copy_from_slice(&chunk_bytes(cmd));
    let end = draft.iter().position(|b| *b == 0).unwrap_or(draft.len());
    String::from_utf8_lossy(&draft[..end]).trim().to_string()
}

struct GroupsArgs {
    action: u32,
    group: GroupId,
    chunk: u32,
}

fn groups_args(cmd: &GameCommand) -> GroupsArgs {
    GroupsArgs {
        action: cmd.args[0] & 0xFF,
        group: GroupId(((cmd.args[0] >> 8) & 0xFF) as u8),
        chunk: (cmd.args[0] >> 16) & 0xFF,
    }
}

fn target_player(cmd: &GameCommand) -> Option<PlayerId> {
    u8::try_from(cmd.args[2]).ok().map(PlayerId)
}

fn reject(body: ErrorText) -> Quote {
    Quote::Rejected(RejectReason::new(body))
}

/// Dry run of a session command. Costs are always zero.
pub fn quote(roster: &Roster, cmd: &GameCommand) -> Quote {
    match cmd.kind() {
        command_kind::SET_PLAYER_GROUP => quote_set_player_group(roster, cmd),
        command_kind::MODIFY_GROUPS => quote_modify_groups(roster, cmd),
        command_kind::KICK_PLAYER => quote_kick(roster, cmd),
        _ => reject(ErrorText::CantDoThis),
    }
}

fn quote_set_player_group(roster: &Roster, cmd: &GameCommand) -> Quote {
    let Some(target) = target_player(cmd).and_then(|id| roster.players.get(id)) else {
        return reject(ErrorText::UnknownPlayer);
    };
    let Ok(group) = u8::try_from(cmd.args[3]).map(GroupId) else {
        return reject(ErrorText::UnknownGroup);
    };
    if !roster.groups.contains(group) {
        return reject(ErrorText::UnknownGroup);
    }
    if target.is_host() {
        return reject(ErrorText::CantChangeGroupThatTheHostBelongsTo);
    }
    let issuer_is_admin = roster
        .players
        .get(cmd.player_id)
        .is_some_and(|p| p.group == GroupId::ADMIN);
    if group == GroupId::ADMIN && !issuer_is_admin {
        return reject(ErrorText::CantSetToThisGroup);
    }
    Quote::Priced(0)
}

fn quote_modify_groups(roster: &Roster, cmd: &GameCommand) -> Quote {
    let args = groups_args(cmd);
    match args.action {
        ACTION_ADD => {
            if roster.groups.len() > usize::from(u8::MAX) {
                return reject(ErrorText::TooManyGroups);
            }
        }
        ACTION_REMOVE => {
            if args.group == GroupId::ADMIN {
                return reject(ErrorText::ThisGroupCannotBeModified);
            }
            if !roster.groups.contains(args.group) {
                return reject(ErrorText::UnknownGroup);
            }
            if roster.group_in_use(args.group) {
                return reject(ErrorText::CantRemoveGroupThatPlayersBelongTo);
            }
        }
        ACTION_SET_PERMISSIONS => {
            if args.group == GroupId::ADMIN {
                return reject(ErrorText::ThisGroupCannotBeModified);
            }
            if !roster.groups.contains(args.group) {
                return reject(ErrorText::UnknownGroup);
            }
            if cmd.args[3] == PERMISSIONS_TOGGLE {
                let Some(permission) = Permission::from_index(cmd.args[2] as usize) else {
                    return reject(ErrorText::CantDoThis);
                };
                let issuer_holds = roster
                    .group_of(cmd.player_id)
                    .is_some_and(|g| g.can_perform(permission));
                if !issuer_holds {
                    return reject(ErrorText::CantModifyPermissionThatYouDoNotHaveYourself);
                }
            }
        }
        ACTION_RENAME => {
            if !roster.groups.contains(args.group) {
                return reject(ErrorText::UnknownGroup);
            }
            if args.chunk == 0 && assembled_name(roster, cmd).is_empty() {
                return reject(ErrorText::InvalidGroupName);
            }
        }
        ACTION_SET_DEFAULT => {
            if args.group == GroupId::ADMIN {
                return reject(ErrorText::CantSetToThisGroup);
            }
            if !roster.groups.contains(args.group) {
                return reject(ErrorText::UnknownGroup);
            }
        }
        _ => return reject(ErrorText::CantDoThis),
    }
    Quote::Priced(0)
}

fn quote_kick(roster: &Roster, cmd: &GameCommand) -> Quote {
    let Some(target) = target_player(cmd).and_then(|id| roster.players.get(id)) else {
        return reject(ErrorText::UnknownPlayer);
    };
    if target.is_host() {
        return reject(ErrorText::CantKickTheHost);
    }
    Quote::Priced(0)
}

/// Apply a session command that `quote` accepted.
pub fn apply(roster: &mut Roster, role: Role, cmd: &GameCommand, effects: &mut Vec<Effect>) -> Money {
    match cmd.kind() {
        command_kind::SET_PLAYER_GROUP => apply_set_player_group(roster, role, cmd),
        command_kind::MODIFY_GROUPS => apply_modify_groups(roster, role, cmd),
        command_kind::KICK_PLAYER => apply_kick(roster, role, cmd, effects),
        _ => {}
    }
    0
}

fn apply_set_player_group(roster: &mut Roster, role: Role, cmd: &GameCommand) {
    let (Some(id), Ok(group)) = (target_player(cmd), u8::try_from(cmd.args[3]).map(GroupId)) else {
        return;
    };
    let Some(player) = roster.players.get_mut(id) else {
        return;
    };
    player.group = group;
    let (hash, name) = (player.key_hash.clone(), player.name.clone());
    tracing::info!(player = %name, group = group.0, "player group changed");

    if role == Role::Server && !hash.is_empty() {
        let user = roster.users.get_or_insert(&hash);
        user.group = Some(group);
        user.name = name;
        roster.persist_users();
    }
}

fn apply_modify_groups(roster: &mut Roster, role: Role, cmd: &GameCommand) {
    let args = groups_args(cmd);
    let result = match args.action {
        ACTION_ADD => roster.groups.add("Group").and_then(|id| {
            tracing::info!(group = id.0, "group added");
            roster.groups.rename(id, &format!("Group #{}", id.0))
        }),
        ACTION_REMOVE => roster.groups.remove(args.group, false).map(|()| {
            let unassigned = roster.users.unassign_group(args.group);
            if unassigned > 0 && role == Role::Server {
                roster.persist_users();
            }
        }),
        ACTION_SET_PERMISSIONS => match cmd.args[3] {
            PERMISSIONS_TOGGLE => match Permission::from_index(cmd.args[2] as usize) {
                Some(p) => roster.groups.toggle_permission(args.group, p),
                None => Err(ErrorText::CantDoThis),
            },
            PERMISSIONS_ALL => {
                let issuer = roster
                    .group_of(cmd.player_id)
                    .map(|g| g.permissions)
                    .unwrap_or_default();
                roster.groups.set_permissions(args.group, issuer)
            }
            _ => roster.groups.set_permissions(args.group, Default::default()),
        },
        ACTION_RENAME => {
            if args.chunk == 0 {
                let name = assembled_name(roster, cmd);
                roster.clear_name_draft(cmd.player_id);
                roster.groups.rename(args.group, &name)
            } else {
                let mut draft = roster.name_draft(cmd.player_id);
                let offset = chunk_offset(args.chunk);
                draft[offset..offset + CHUNK_LEN].copy_from_slice(&chunk_bytes(cmd));
                roster.store_name_draft(cmd.player_id, draft);
                return;
            }
        }
        ACTION_SET_DEFAULT => roster.groups.set_default(args.group),
        _ => Err(ErrorText::CantDoThis),
    };
    if let Err(e) = result {
        tracing::warn!(action = args.action, group = args.group.0, error = ?e, "group change failed");
        return;
    }
    if role == Role::Server {
        roster.persist_groups();
    }
}

fn apply_kick(roster: &mut Roster, role: Role, cmd: &GameCommand, effects: &mut Vec<Effect>) {
    let Some(id) = target_player(cmd) else {
        return;
    };
    if role != Role::Server {
        return;
    }
    let Some(player) = roster.players.get(id) else {
        return;
    };
    let hash = player.key_hash.clone();
    tracing::info!(player = %player.name, "kicking player");
    if !hash.is_empty() && roster.users.remove(&hash).is_some() {
        roster.persist_users();
    }
    effects.push(Effect::Kick(id));
}

#[cfg(test)]
mod tests {
    use super::*;
    use parklink_protocol::types::player_flags;

    /// Host (admin, player 0) plus a guest (spectator, player 1).
    fn roster() -> Roster {
        let mut roster = Roster::new();
        let host = roster
            .players
            .add("Host".into(), "hosthash".into(), GroupId::ADMIN)
            .unwrap();
        roster.players.get_mut(host).unwrap().flags = player_flags::IS_SERVER;
        roster
            .players
            .add("Guest".into(), "guesthash".into(), GroupId(1))
            .unwrap();
        roster.local_player = Some(host);
        roster
    }

    fn issued_by(mut cmd: GameCommand, player: u8) -> GameCommand {
        cmd.player_id = PlayerId(player);
        cmd
    }

    fn run(roster: &mut Roster, cmd: &GameCommand) -> Result<Vec<Effect>, RejectReason> {
        match quote(roster, cmd) {
            Quote::Rejected(reason) => Err(reason),
            Quote::Priced(_) => {
                let mut effects = Vec::new();
                apply(roster, Role::Server, cmd, &mut effects);
                Ok(effects)
            }
        }
    }

    #[test]
    fn set_player_group_moves_player_and_registers_user() {
        let mut r = roster();
        run(&mut r, &issued_by(set_player_group(PlayerId(1), GroupId(2)), 0)).unwrap();
        assert_eq!(r.players.get(PlayerId(1)).unwrap().group, GroupId(2));
        assert_eq!(r.users.get("guesthash").unwrap().group, Some(GroupId(2)));
    }

    #[test]
    fn host_group_cannot_change() {
        let mut r = roster();
        let err = run(&mut r, &issued_by(set_player_group(PlayerId(0), GroupId(2)), 0)).unwrap_err();
        assert_eq!(err.body, ErrorText::CantChangeGroupThatTheHostBelongsTo);
    }

    #[test]
    fn non_admin_cannot_promote_to_admin() {
        let mut r = roster();
        r.players.add("Mod".into(), "modhash".into(), GroupId(2));
        let err = run(&mut r, &issued_by(set_player_group(PlayerId(1), GroupId::ADMIN), 2)).unwrap_err();
        assert_eq!(err.body, ErrorText::CantSetToThisGroup);
    }

    #[test]
    fn unknown_group_is_rejected() {
        let mut r = roster();
        let err = run(&mut r, &issued_by(set_player_group(PlayerId(1), GroupId(77)), 0)).unwrap_err();
        assert_eq!(err.body, ErrorText::UnknownGroup);
    }

    #[test]
    fn kick_emits_effect_and_forgets_user() {
        let mut r = roster();
        r.users.get_or_insert("guesthash").name = "Guest".into();
        let effects = run(&mut r, &issued_by(kick_player(PlayerId(1)), 0)).unwrap();
        assert_eq!(effects, vec![Effect::Kick(PlayerId(1))]);
        assert!(r.users.get("guesthash").is_none());
    }

    #[test]
    fn host_cannot_be_kicked() {
        let mut r = roster();
        let err = run(&mut r, &issued_by(kick_player(PlayerId(0)), 0)).unwrap_err();
        assert_eq!(err.body, ErrorText::CantKickTheHost);
    }

    #[test]
    fn rename_spans_three_chunks() {
        let mut r = roster();
        let name = "A rather long group name for builders";
        let cmds = modify_groups(&GroupAction::Rename(GroupId(2), name.into()));
        assert_eq!(cmds.len(), 3);
        for cmd in cmds {
            run(&mut r, &issued_by(cmd, 0)).unwrap();
        }
        let expected: String = name.chars().take(GROUP_NAME_DRAFT_LEN).collect();
        assert_eq!(r.groups.get(GroupId(2)).unwrap().name, expected);
    }

    #[test]
    fn rename_to_blank_is_rejected() {
        let mut r = roster();
        let cmds = modify_groups(&GroupAction::Rename(GroupId(2), "  ".into()));
        let mut results = cmds.iter().map(|c| run(&mut r, &issued_by(*c, 0)));
        assert!(results.next().unwrap().is_ok());
        assert!(results.next().unwrap().is_ok());
        assert_eq!(
            results.next().unwrap().unwrap_err().body,
            ErrorText::InvalidGroupName
        );
    }

    #[test]
    fn toggle_requires_issuer_to_hold_permission() {
        let mut r = roster();
        r.players.add("Mod".into(), "modhash".into(), GroupId(2));
        // User group lacks Cheat, so a user cannot grant it.
        let cmd = modify_groups(&GroupAction::TogglePermission(GroupId(1), Permission::Cheat))[0];
        let err = run(&mut r, &issued_by(cmd, 2)).unwrap_err();
        assert_eq!(err.body, ErrorText::CantModifyPermissionThatYouDoNotHaveYourself);

        run(&mut r, &issued_by(cmd, 0)).unwrap();
        assert!(r.groups.get(GroupId(1)).unwrap().can_perform(Permission::Cheat));
    }

    #[test]
    fn remove_rejects_admin_and_groups_in_use() {
        let mut r = roster();
        let admin = modify_groups(&GroupAction::Remove(GroupId::ADMIN))[0];
        assert_eq!(
            run(&mut r, &issued_by(admin, 0)).unwrap_err().body,
            ErrorText::ThisGroupCannotBeModified
        );
        let spectators = modify_groups(&GroupAction::Remove(GroupId(1)))[0];
        assert_eq!(
            run(&mut r, &issued_by(spectators, 0)).unwrap_err().body,
            ErrorText::CantRemoveGroupThatPlayersBelongTo
        );
        r.users.get_or_insert("offline").group = Some(GroupId(2));
        let users = modify_groups(&GroupAction::Remove(GroupId(2)))[0];
        run(&mut r, &issued_by(users, 0)).unwrap();
        assert!(!r.groups.contains(GroupId(2)));
        assert_eq!(r.users.get("offline").unwrap().group, None);
    }

    #[test]
    fn add_and_set_default() {
        let mut r = roster();
        run(&mut r, &issued_by(modify_groups(&GroupAction::Add)[0], 0)).unwrap();
        assert_eq!(r.groups.get(GroupId(3)).unwrap().name, "Group #3");
        run(&mut r, &issued_by(modify_groups(&GroupAction::SetDefault(GroupId(3)))[0], 0)).unwrap();
        assert_eq!(r.groups.default_group(), GroupId(3));

        let admin_default = modify_groups(&GroupAction::SetDefault(GroupId::ADMIN))[0];
        assert_eq!(
            run(&mut r, &issued_by(admin_default, 0)).unwrap_err().body,
            ErrorText::CantSetToThisGroup
        );
    }

    #[test]
    fn set_all_copies_issuer_permissions() {
        let mut r = roster();
        r.players.add("Mod".into(), "modhash".into(), GroupId(2));
        let grant = modify_groups(&GroupAction::SetAllPermissions(GroupId(1), true))[0];
        run(&mut r, &issued_by(grant, 2)).unwrap();
        let user_perms = r.groups.get(GroupId(2)).unwrap().permissions;
        assert_eq!(r.groups.get(GroupId(1)).unwrap().permissions, user_perms);

        let clear = modify_groups(&GroupAction::SetAllPermissions(GroupId(1), false))[0];
        run(&mut r, &issued_by(clear, 0)).unwrap();
        assert!(r.groups.get(GroupId(1)).unwrap().permissions.iter().next().is_none());
    }
}
