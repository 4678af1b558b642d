// Server-side registry of known player keys.
//
// Maps a public key hash to the display name and group last assigned to
// that key, so a returning player keeps their name and permissions across
// sessions. Persisted as a JSON array in `users.json`.

use std::collections::BTreeMap;
use std::path::Path;

use parklink_protocol::GroupId;
use serde::{Deserialize, Serialize};

use crate::error::{NetError, NetResult};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub hash: String,
    pub name: String,
    #[serde(rename = "groupId", default)]
    pub group: Option<GroupId>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UserRegistry {
    users: BTreeMap<String, User>,
}

impl UserRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, hash: &str) -> Option<&User> {
        self.users.get(hash)
    }

    /// Case-insensitive lookup by display name.
    pub fn get_by_name(&self, name: &str) -> Option<&User> {
        let lower = name.to_lowercase();
        self.users.values().find(|u| u.name.to_lowercase() == lower)
    }

    /// The user for `hash`, created with an empty name and no group if it
    /// was not registered yet.
    pub fn get_or_insert(&mut self, hash: &str) -> &mut User {
        self.users.entry(hash.to_string()).or_insert_with(|| User {
            hash: hash.to_string(),
            name: String::new(),
            group: None,
        })
    }

    pub fn remove(&mut self, hash: &str) -> Option<User> {
        self.users.remove(hash)
    }

    /// Clear the assignment of every user in `group`. Returns how many
    /// users were affected.
    pub fn unassign_group(&mut self, group: GroupId) -> usize {
        let mut count = 0;
        for user in self.users.values_mut().filter(|u| u.group == Some(group)) {
            user.group = None;
            count += 1;
        }
        count
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    /// Load from `path`. A missing file yields an empty registry.
    pub fn load(path: &Path) -> NetResult<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let text = std::fs::read_to_string(path)?;
        let list: Vec<User> = serde_json::from_str(&text).map_err(|e| NetError::Persist {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            users: list.into_iter().map(|u| (u.hash.clone(), u)).collect(),
        })
    }

    pub fn save(&self, path: &Path) -> NetResult<()> {
        let list: Vec<&User> = self.users.values().collect();
        let json = serde_json::to_string_pretty(&list).map_err(|e| NetError::Persist {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_lookup_ignores_case() {
        let mut registry = UserRegistry::new();
        registry.get_or_insert("abc").name = "Alice".into();
        assert_eq!(registry.get_by_name("ALICE").unwrap().hash, "abc");
        assert!(registry.get_by_name("Bob").is_none());
    }

    #[test]
    fn unassign_clears_only_that_group() {
        let mut registry = UserRegistry::new();
        registry.get_or_insert("abc").group = Some(GroupId(2));
        registry.get_or_insert("def").group = Some(GroupId(2));
        registry.get_or_insert("ghi").group = Some(GroupId(3));
        registry.remove("abc");
        assert_eq!(registry.unassign_group(GroupId(2)), 1);
        assert_eq!(registry.get("def").unwrap().group, None);
        assert_eq!(registry.get("ghi").unwrap().group, Some(GroupId(3)));
    }

    #[test]
    fn persistence_roundtrip() {
        let path = std::env::temp_dir().join(format!(
            "parklink-users-{}-{}.json",
            std::process::id(),
            rand::random::<u32>()
        ));
        let mut registry = UserRegistry::new();
        let user = registry.get_or_insert("deadbeef");
        user.name = "Host".into();
        user.group = Some(GroupId(0));
        registry.get_or_insert("cafe").name = "Guest".into();
        registry.save(&path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("\"groupId\""));
        assert_eq!(UserRegistry::load(&path).unwrap(), registry);
        let _ = std::fs::remove_file(&path);
    }
}
