//! Backup engine capability trait and registry
//!
//! The builtin file-copy engine coexists with alternative engines (an
//! xtrabackup-style hot copy, reduced "lite" variants). Callers pick one by
//! name through the registry.

use crate::config::BackupConfig;
use crate::manifest::BackupManifest;
use crate::mysqlctl::{Mycnf, MysqlDaemon};
use crate::storage::{BackupHandle, BackupStorage};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tabletd_core::{Position, Result, TabletAlias, TabletError};
use tokio_util::sync::CancellationToken;

/// Sentinel for `incremental_from_pos` meaning "start from the end position
/// of the latest successful backup".
pub const AUTO_INCREMENTAL_FROM_POS: &str = "auto";

/// Everything an engine needs to take one backup.
pub struct BackupParams {
    pub cnf: Mycnf,
    pub mysqld: Arc<dyn MysqlDaemon>,
    pub storage: Arc<dyn BackupStorage>,
    pub config: BackupConfig,
    pub tablet_alias: TabletAlias,
    pub keyspace: String,
    pub shard: String,
    pub backup_time: DateTime<Utc>,
    /// Empty for a full backup; a position or [`AUTO_INCREMENTAL_FROM_POS`]
    /// for an incremental one.
    pub incremental_from_pos: String,
}

impl BackupParams {
    /// The `<keyspace>/<shard>` directory backups for this tablet live in.
    pub fn backup_dir(&self) -> String {
        format!("{}/{}", self.keyspace, self.shard)
    }

    /// Conventional backup name: timestamp plus tablet alias.
    pub fn backup_name(&self) -> String {
        format!(
            "{}.{}",
            self.backup_time.format("%Y-%m-%d.%H%M%S"),
            self.tablet_alias
        )
    }

    pub fn is_incremental(&self) -> bool {
        !self.incremental_from_pos.is_empty()
    }
}

/// Everything an engine needs to restore one backup.
pub struct RestoreParams {
    pub cnf: Mycnf,
    pub mysqld: Arc<dyn MysqlDaemon>,
    pub config: BackupConfig,
    /// For incremental restores: apply transactions up to this position and
    /// discard the rest.
    pub restore_to_pos: Position,
}

/// A backup method.
#[async_trait]
pub trait BackupEngine: Send + Sync {
    /// Engine name as recorded in manifests.
    fn name(&self) -> &'static str;

    /// Run a backup into the handle. Returns whether the backup is usable.
    async fn execute_backup(
        &self,
        ctx: &CancellationToken,
        params: &BackupParams,
        handle: Arc<dyn BackupHandle>,
    ) -> Result<bool>;

    /// Restore from the handle, returning its manifest on success.
    async fn execute_restore(
        &self,
        ctx: &CancellationToken,
        params: &RestoreParams,
        handle: Arc<dyn BackupHandle>,
    ) -> Result<BackupManifest>;

    /// Whether the tablet must stop serving queries while this engine backs
    /// it up.
    fn should_drain_for_backup(&self) -> bool;
}

/// Engines available to this process, keyed by name.
pub struct BackupEngineRegistry {
    engines: HashMap<&'static str, Arc<dyn BackupEngine>>,
}

impl BackupEngineRegistry {
    pub fn new() -> Self {
        Self {
            engines: HashMap::new(),
        }
    }

    pub fn register(&mut self, engine: Arc<dyn BackupEngine>) {
        self.engines.insert(engine.name(), engine);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn BackupEngine>> {
        self.engines
            .get(name)
            .cloned()
            .ok_or_else(|| TabletError::not_found(format!("unknown backup engine {name:?}")))
    }
}

impl Default for BackupEngineRegistry {
    fn default() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(crate::builtin::BuiltinBackupEngine::default()));
        registry
    }
}
