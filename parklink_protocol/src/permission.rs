// Permission actions and the bitset that records which ones a group holds.
//
// The action order is part of the wire protocol: bit `n` of a group's
// permission bytes refers to `Permission::ALL[n]`. Out-of-range bit indexes
// read as "not permitted" instead of panicking, so a peer that knows fewer
// actions can still decode a newer peer's group list.

/// An action a group can be granted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Permission {
    Chat,
    Terraform,
    SetWaterLevel,
    TogglePause,
    CreateRide,
    RemoveRide,
    BuildRide,
    RideProperties,
    Scenery,
    Path,
    ClearLandscape,
    Guest,
    Staff,
    ParkProperties,
    ParkFunding,
    KickPlayer,
    ModifyGroups,
    SetPlayerGroup,
    Cheat,
    ToggleSceneryCluster,
    PasswordlessLogin,
}

impl Permission {
    pub const ALL: [Permission; 21] = [
        Permission::Chat,
        Permission::Terraform,
        Permission::SetWaterLevel,
        Permission::TogglePause,
        Permission::CreateRide,
        Permission::RemoveRide,
        Permission::BuildRide,
        Permission::RideProperties,
        Permission::Scenery,
        Permission::Path,
        Permission::ClearLandscape,
        Permission::Guest,
        Permission::Staff,
        Permission::ParkProperties,
        Permission::ParkFunding,
        Permission::KickPlayer,
        Permission::ModifyGroups,
        Permission::SetPlayerGroup,
        Permission::Cheat,
        Permission::ToggleSceneryCluster,
        Permission::PasswordlessLogin,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<Permission> {
        Permission::ALL.get(index).copied()
    }

    /// Stable identifier used in persisted group files.
    pub fn name(self) -> &'static str {
        match self {
            Permission::Chat => "PERMISSION_CHAT",
            Permission::Terraform => "PERMISSION_TERRAFORM",
            Permission::SetWaterLevel => "PERMISSION_SET_WATER_LEVEL",
            Permission::TogglePause => "PERMISSION_TOGGLE_PAUSE",
            Permission::CreateRide => "PERMISSION_CREATE_RIDE",
            Permission::RemoveRide => "PERMISSION_REMOVE_RIDE",
            Permission::BuildRide => "PERMISSION_BUILD_RIDE",
            Permission::RideProperties => "PERMISSION_RIDE_PROPERTIES",
            Permission::Scenery => "PERMISSION_SCENERY",
            Permission::Path => "PERMISSION_PATH",
            Permission::ClearLandscape => "PERMISSION_CLEAR_LANDSCAPE",
            Permission::Guest => "PERMISSION_GUEST",
            Permission::Staff => "PERMISSION_STAFF",
            Permission::ParkProperties => "PERMISSION_PARK_PROPERTIES",
            Permission::ParkFunding => "PERMISSION_PARK_FUNDING",
            Permission::KickPlayer => "PERMISSION_KICK_PLAYER",
            Permission::ModifyGroups => "PERMISSION_MODIFY_GROUPS",
            Permission::SetPlayerGroup => "PERMISSION_SET_PLAYER_GROUP",
            Permission::Cheat => "PERMISSION_CHEAT",
            Permission::ToggleSceneryCluster => "PERMISSION_TOGGLE_SCENERY_CLUSTER",
            Permission::PasswordlessLogin => "PERMISSION_PASSWORDLESS_LOGIN",
        }
    }

    pub fn from_name(name: &str) -> Option<Permission> {
        Permission::ALL.iter().copied().find(|p| p.name() == name)
    }
}

/// Bytes needed to hold one bit per permission.
pub const PERMISSION_BYTES: usize = Permission::ALL.len().div_ceil(8);

/// Fixed-width permission bitset.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct PermissionSet {
    bits: [u8; PERMISSION_BYTES],
}

impl PermissionSet {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn all() -> Self {
        let mut set = Self::empty();
        for p in Permission::ALL {
            set.insert(p);
        }
        set
    }

    /// Build from wire bytes. Extra bytes are ignored and bits beyond the
    /// known actions are dropped.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut set = Self::empty();
        for p in Permission::ALL {
            let i = p.index();
            if bytes.get(i / 8).is_some_and(|b| b & (1 << (i % 8)) != 0) {
                set.insert(p);
            }
        }
        set
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    pub fn contains(&self, permission: Permission) -> bool {
        self.contains_index(permission.index())
    }

    /// Bounds-checked bit lookup; indexes past the set are never held.
    pub fn contains_index(&self, index: usize) -> bool {
        index < Permission::ALL.len()
            && self
                .bits
                .get(index / 8)
                .is_some_and(|b| b & (1 << (index % 8)) != 0)
    }

    pub fn insert(&mut self, permission: Permission) {
        let i = permission.index();
        self.bits[i / 8] |= 1 << (i % 8);
    }

    pub fn remove(&mut self, permission: Permission) {
        let i = permission.index();
        self.bits[i / 8] &= !(1 << (i % 8));
    }

    pub fn toggle(&mut self, permission: Permission) {
        let i = permission.index();
        self.bits[i / 8] ^= 1 << (i % 8);
    }

    pub fn iter(&self) -> impl Iterator<Item = Permission> + '_ {
        Permission::ALL.into_iter().filter(|p| self.contains(*p))
    }
}

impl FromIterator<Permission> for PermissionSet {
    fn from_iter<I: IntoIterator<Item = Permission>>(iter: I) -> Self {
        let mut set = PermissionSet::empty();
        for p in iter {
            set.insert(p);
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_roundtrip() {
        for p in Permission::ALL {
            assert_eq!(Permission::from_name(p.name()), Some(p));
            assert_eq!(Permission::from_index(p.index()), Some(p));
        }
        assert_eq!(Permission::from_name("PERMISSION_FLY"), None);
    }

    #[test]
    fn toggle_flips_membership() {
        let mut set = PermissionSet::empty();
        assert!(!set.contains(Permission::Cheat));
        set.toggle(Permission::Cheat);
        assert!(set.contains(Permission::Cheat));
        set.toggle(Permission::Cheat);
        assert!(!set.contains(Permission::Cheat));
    }

    #[test]
    fn out_of_range_index_is_not_held() {
        let set = PermissionSet::all();
        assert!(set.contains_index(Permission::ALL.len() - 1));
        assert!(!set.contains_index(Permission::ALL.len()));
        assert!(!set.contains_index(usize::MAX));
    }

    #[test]
    fn from_bytes_tolerates_short_and_long_input() {
        let short = PermissionSet::from_bytes(&[0b0000_0001]);
        assert!(short.contains(Permission::Chat));
        assert!(!short.contains(Permission::PasswordlessLogin));

        let long = PermissionSet::from_bytes(&[0xFF; 8]);
        assert_eq!(long, PermissionSet::all());
    }

    #[test]
    fn iter_lists_held_permissions_in_order() {
        let set: PermissionSet = [Permission::Staff, Permission::Chat].into_iter().collect();
        let held: Vec<_> = set.iter().collect();
        assert_eq!(held, vec![Permission::Chat, Permission::Staff]);
    }
}
