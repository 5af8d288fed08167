//! The persisted group/member model.

use crate::error::{GroupError, GroupResult};
use opensync_plugin::PluginConfig;
use opensync_types::{MemberId, ObjType};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

const GROUP_FILE: &str = "group.json";
const MEMBER_FILE: &str = "member.json";

/// How the engine resolves conflicting mappings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", content = "member")]
pub enum ConflictPolicy {
    /// Always pick the entry reported by this member.
    PickMember(MemberId),
    /// Pick the entry with the newest revision timestamp.
    PickNewest,
    /// Keep both sides under fresh uids.
    Duplicate,
    /// Suspend the mapping and ask the registered conflict handler.
    Interactive,
}

/// One configured plugin instance within a group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    /// Stable integer id, assigned by the group.
    pub id: MemberId,
    /// Name the plugin registry resolves.
    pub plugin_name: String,
    /// Opaque plugin configuration blob.
    pub config: String,
    /// Object types this member is configured to sync. Empty means
    /// "whatever the plugin discovers".
    pub objtypes: Vec<ObjType>,
}

impl Member {
    /// This member's private directory under the group configdir.
    #[must_use]
    pub fn configdir(&self, group_dir: &Path) -> PathBuf {
        group_dir.join(format!("member-{}", self.id))
    }

    /// Builds the config handed to the plugin at initialize.
    #[must_use]
    pub fn plugin_config(&self, group_dir: &Path) -> PluginConfig {
        PluginConfig {
            data: self.config.clone(),
            configdir: self.configdir(group_dir),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct GroupFile {
    name: String,
    conflict_policy: ConflictPolicy,
    last_sync: Option<u64>,
}

/// An ordered set of members sharing one synchronization configuration.
#[derive(Debug)]
pub struct Group {
    name: String,
    configdir: PathBuf,
    members: Vec<Member>,
    conflict_policy: ConflictPolicy,
    last_sync: Option<u64>,
}

impl Group {
    /// Creates a new group under the given config directory and persists
    /// it immediately.
    pub fn create(configdir: impl Into<PathBuf>, name: impl Into<String>) -> GroupResult<Self> {
        let group = Self {
            name: name.into(),
            configdir: configdir.into(),
            members: Vec::new(),
            conflict_policy: ConflictPolicy::Interactive,
            last_sync: None,
        };
        fs::create_dir_all(&group.configdir)?;
        group.save()?;
        Ok(group)
    }

    /// Loads a group and all its members from a config directory.
    pub fn load(configdir: impl Into<PathBuf>) -> GroupResult<Self> {
        let configdir = configdir.into();
        let raw = fs::read_to_string(configdir.join(GROUP_FILE))?;
        let file: GroupFile = serde_json::from_str(&raw)?;

        let mut members = Vec::new();
        for entry in fs::read_dir(&configdir)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let member_file = path.join(MEMBER_FILE);
            if member_file.is_file() {
                let raw = fs::read_to_string(member_file)?;
                members.push(serde_json::from_str::<Member>(&raw)?);
            }
        }
        members.sort_by_key(|m| m.id);

        debug!(group = %file.name, members = members.len(), "loaded group");
        Ok(Self {
            name: file.name,
            configdir,
            members,
            conflict_policy: file.conflict_policy,
            last_sync: file.last_sync,
        })
    }

    /// Persists the group file and every member file.
    pub fn save(&self) -> GroupResult<()> {
        fs::create_dir_all(&self.configdir)?;
        let file = GroupFile {
            name: self.name.clone(),
            conflict_policy: self.conflict_policy,
            last_sync: self.last_sync,
        };
        fs::write(
            self.configdir.join(GROUP_FILE),
            serde_json::to_string_pretty(&file)?,
        )?;
        for member in &self.members {
            let dir = member.configdir(&self.configdir);
            fs::create_dir_all(&dir)?;
            fs::write(dir.join(MEMBER_FILE), serde_json::to_string_pretty(member)?)?;
        }
        Ok(())
    }

    /// Deletes the group's config directory and consumes the group.
    pub fn delete(self) -> GroupResult<()> {
        fs::remove_dir_all(&self.configdir)?;
        Ok(())
    }

    /// Adds a member and returns its assigned id. The group is persisted
    /// by the caller via [`save`](Self::save).
    pub fn add_member(
        &mut self,
        plugin_name: impl Into<String>,
        config: impl Into<String>,
        objtypes: Vec<ObjType>,
    ) -> MemberId {
        let next = self
            .members
            .iter()
            .map(|m| m.id.as_u64())
            .max()
            .map_or(1, |max| max + 1);
        let id = MemberId::new(next);
        self.members.push(Member {
            id,
            plugin_name: plugin_name.into(),
            config: config.into(),
            objtypes,
        });
        id
    }

    /// Removes a member and its on-disk state.
    pub fn remove_member(&mut self, id: MemberId) -> GroupResult<()> {
        let pos = self
            .members
            .iter()
            .position(|m| m.id == id)
            .ok_or(GroupError::MemberNotFound(id))?;
        let member = self.members.remove(pos);
        let dir = member.configdir(&self.configdir);
        if dir.exists() {
            fs::remove_dir_all(dir)?;
        }
        Ok(())
    }

    /// The group's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The group's config directory.
    #[must_use]
    pub fn configdir(&self) -> &Path {
        &self.configdir
    }

    /// All members, ordered by id.
    #[must_use]
    pub fn members(&self) -> &[Member] {
        &self.members
    }

    /// Looks up a member by id.
    pub fn member(&self, id: MemberId) -> GroupResult<&Member> {
        self.members
            .iter()
            .find(|m| m.id == id)
            .ok_or(GroupError::MemberNotFound(id))
    }

    /// Number of configured members.
    #[must_use]
    pub fn num_members(&self) -> usize {
        self.members.len()
    }

    /// The configured conflict policy.
    #[must_use]
    pub fn conflict_policy(&self) -> ConflictPolicy {
        self.conflict_policy
    }

    /// Replaces the conflict policy.
    pub fn set_conflict_policy(&mut self, policy: ConflictPolicy) {
        self.conflict_policy = policy;
    }

    /// Millis-since-epoch timestamp of the last successful sync.
    #[must_use]
    pub fn last_sync(&self) -> Option<u64> {
        self.last_sync
    }

    /// Stamps the last successful sync.
    pub fn set_last_sync(&mut self, millis: u64) {
        self.last_sync = Some(millis);
    }
}
