//! Tablet identity types.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The role a tablet is currently serving.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TabletType {
    Primary,
    Replica,
    Rdonly,
    Backup,
    Restore,
    Drained,
}

impl TabletType {
    pub fn is_primary(&self) -> bool {
        matches!(self, TabletType::Primary)
    }
}

impl fmt::Display for TabletType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TabletType::Primary => "PRIMARY",
            TabletType::Replica => "REPLICA",
            TabletType::Rdonly => "RDONLY",
            TabletType::Backup => "BACKUP",
            TabletType::Restore => "RESTORE",
            TabletType::Drained => "DRAINED",
        };
        f.write_str(s)
    }
}

/// Globally unique tablet identifier: the cell it lives in plus a uid.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TabletAlias {
    pub cell: String,
    pub uid: u32,
}

impl TabletAlias {
    pub fn new(cell: impl Into<String>, uid: u32) -> Self {
        Self {
            cell: cell.into(),
            uid,
        }
    }
}

impl fmt::Display for TabletAlias {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{:010}", self.cell, self.uid)
    }
}

/// The serving target of a tablet: which shard it serves, in which role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub keyspace: String,
    pub shard: String,
    pub tablet_type: TabletType,
}

impl Target {
    pub fn new(keyspace: impl Into<String>, shard: impl Into<String>, tablet_type: TabletType) -> Self {
        Self {
            keyspace: keyspace.into(),
            shard: shard.into(),
            tablet_type,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} ({})", self.keyspace, self.shard, self.tablet_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alias_display() {
        let alias = TabletAlias::new("zone1", 101);
        assert_eq!(alias.to_string(), "zone1-0000000101");
    }

    #[test]
    fn test_target_display() {
        let target = Target::new("commerce", "-80", TabletType::Primary);
        assert_eq!(target.to_string(), "commerce/-80 (PRIMARY)");
        assert!(target.tablet_type.is_primary());
    }

    #[test]
    fn test_tablet_type_serde() {
        let json = serde_json::to_string(&TabletType::Replica).unwrap();
        assert_eq!(json, "\"REPLICA\"");
    }
}
