//! Control-plane seam over the managed MySQL process
//!
//! The backup engine never talks to MySQL directly; everything it needs from
//! the server goes through [`MysqlDaemon`]. The embedding tablet server
//! provides the real implementation; [`FakeMysqlDaemon`] backs the engine
//! tests with an on-disk data directory and scripted replication state.

use crate::manifest::FileBase;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tabletd_core::{Gtid, Position, Result, TabletError};
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

/// The slice of my.cnf the backup engine cares about: where the server keeps
/// its files.
#[derive(Debug, Clone)]
pub struct Mycnf {
    pub data_dir: PathBuf,
    pub innodb_data_home_dir: PathBuf,
    pub innodb_log_group_home_dir: PathBuf,
    pub binlog_dir: PathBuf,
}

impl Mycnf {
    /// The filesystem root for a manifest base.
    pub fn root(&self, base: FileBase) -> &Path {
        match base {
            FileBase::Data => &self.data_dir,
            FileBase::InnodbDataHomeDir => &self.innodb_data_home_dir,
            FileBase::InnodbLogGroupHomeDir => &self.innodb_log_group_home_dir,
            FileBase::BinlogDir => &self.binlog_dir,
        }
    }

    /// Full path of a file entry, honoring its parent-path override. With a
    /// parent path, the (absolute) base root is re-rooted underneath it,
    /// which is how incremental restores land in a scratch directory.
    pub fn full_path(&self, base: FileBase, parent_path: &str, name: &str) -> PathBuf {
        let root = self.root(base);
        if parent_path.is_empty() {
            root.join(name)
        } else {
            let rel = root.strip_prefix("/").unwrap_or(root);
            Path::new(parent_path).join(rel).join(name)
        }
    }
}

/// Replication thread status of a replica.
#[derive(Debug, Clone)]
pub struct ReplicationStatus {
    pub position: Position,
    pub io_running: bool,
    pub sql_running: bool,
}

impl ReplicationStatus {
    pub fn healthy(&self) -> bool {
        self.io_running && self.sql_running
    }
}

/// Operations the backup engine needs from the MySQL process.
///
/// `shutdown` takes the caller's cancellation token; `start` deliberately
/// does not, so a caller timeout can never leave the server down.
#[async_trait]
pub trait MysqlDaemon: Send + Sync {
    /// Shut the server down, waiting up to `timeout` for it to exit.
    async fn shutdown(&self, ctx: &CancellationToken, timeout: Duration) -> Result<()>;

    /// Start the server and wait for it to accept connections.
    async fn start(&self) -> Result<()>;

    /// Replication status, or `None` when replication is not configured
    /// (this server is a primary).
    async fn replication_status(&self) -> Result<Option<ReplicationStatus>>;

    async fn primary_position(&self) -> Result<Position>;

    async fn stop_replication(&self) -> Result<()>;

    async fn start_replication(&self) -> Result<()>;

    async fn is_super_read_only(&self) -> Result<bool>;

    /// Returns the previous value.
    async fn set_super_read_only(&self, on: bool) -> Result<bool>;

    /// (source_enabled, replica_enabled)
    async fn semi_sync_enabled(&self) -> Result<(bool, bool)>;

    async fn set_semi_sync(&self, source: bool, replica: bool) -> Result<()>;

    /// `@@gtid_purged`.
    async fn gtid_purged(&self) -> Result<Position>;

    /// `@@server_uuid`.
    async fn server_uuid(&self) -> Result<String>;

    /// Close the current binary log and open a new one.
    async fn flush_binary_logs(&self) -> Result<()>;

    /// Binary log file names, oldest first.
    async fn binary_logs(&self) -> Result<Vec<String>>;

    /// The GTID set completed before the named binlog's first transaction.
    async fn binlog_previous_gtids(&self, binlog: &str) -> Result<Position>;

    /// Apply a binlog file, discarding everything strictly after `stop_pos`.
    async fn apply_binlog_file(&self, path: &Path, stop_pos: &Position) -> Result<()>;
}

#[derive(Debug, Clone)]
struct FakeBinlog {
    name: String,
    previous_gtids: Position,
}

#[derive(Debug, Default)]
struct FakeState {
    running: bool,
    hang_on_shutdown: bool,
    super_read_only: bool,
    semi_sync_source: bool,
    semi_sync_replica: bool,
    replica_status: Option<ReplicationStatus>,
    primary_position: Position,
    purged: Position,
    server_uuid: String,
    binlogs: Vec<FakeBinlog>,
    applied_binlogs: Vec<(Vec<u8>, Position)>,
}

/// Scripted [`MysqlDaemon`] for tests, backed by a real directory layout.
pub struct FakeMysqlDaemon {
    cnf: Mycnf,
    state: Mutex<FakeState>,
}

impl FakeMysqlDaemon {
    /// Create the standard directory layout under `base` and a running fake.
    pub fn new(base: &Path) -> Result<Self> {
        let cnf = Mycnf {
            data_dir: base.join("data"),
            innodb_data_home_dir: base.join("innodb").join("data"),
            innodb_log_group_home_dir: base.join("innodb").join("logs"),
            binlog_dir: base.join("binlogs"),
        };
        for dir in [
            &cnf.data_dir,
            &cnf.innodb_data_home_dir,
            &cnf.innodb_log_group_home_dir,
            &cnf.binlog_dir,
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(Self {
            cnf,
            state: Mutex::new(FakeState {
                running: true,
                server_uuid: Uuid::new_v4().to_string(),
                ..FakeState::default()
            }),
        })
    }

    pub fn cnf(&self) -> &Mycnf {
        &self.cnf
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    pub fn set_primary_position(&self, pos: Position) {
        self.state.lock().primary_position = pos;
    }

    pub fn primary_position_sync(&self) -> Position {
        self.state.lock().primary_position.clone()
    }

    pub fn set_purged(&self, pos: Position) {
        self.state.lock().purged = pos;
    }

    pub fn set_server_uuid(&self, uuid: impl Into<String>) {
        self.state.lock().server_uuid = uuid.into();
    }

    pub fn server_uuid_sync(&self) -> String {
        self.state.lock().server_uuid.clone()
    }

    pub fn set_replica_status(&self, status: Option<ReplicationStatus>) {
        self.state.lock().replica_status = status;
    }

    pub fn set_super_read_only_sync(&self, on: bool) {
        self.state.lock().super_read_only = on;
    }

    pub fn set_semi_sync_sync(&self, source: bool, replica: bool) {
        let mut state = self.state.lock();
        state.semi_sync_source = source;
        state.semi_sync_replica = replica;
    }

    pub fn semi_sync_sync(&self) -> (bool, bool) {
        let state = self.state.lock();
        (state.semi_sync_source, state.semi_sync_replica)
    }

    pub fn super_read_only_sync(&self) -> bool {
        self.state.lock().super_read_only
    }

    /// Make `shutdown` block until its timeout fires.
    pub fn hang_on_shutdown(&self, hang: bool) {
        self.state.lock().hang_on_shutdown = hang;
    }

    /// Register a binlog file: its previous-GTIDs and on-disk content.
    pub fn add_binlog(
        &self,
        name: &str,
        previous_gtids: Position,
        content: &[u8],
    ) -> Result<()> {
        std::fs::write(self.cnf.binlog_dir.join(name), content)?;
        self.state.lock().binlogs.push(FakeBinlog {
            name: name.to_string(),
            previous_gtids,
        });
        Ok(())
    }

    /// Binlog files applied through `apply_binlog_file`, with their stop
    /// positions, in order.
    pub fn applied_binlogs(&self) -> Vec<(Vec<u8>, Position)> {
        self.state.lock().applied_binlogs.clone()
    }

    /// Simulate committing one more transaction on this server.
    pub fn advance(&self, server: Uuid, sequence: u64) {
        let mut state = self.state.lock();
        let gtid = Gtid { server, sequence };
        if let Position::Mysql56(set) = &mut state.primary_position {
            set.add(gtid);
        }
        if let Some(status) = &mut state.replica_status {
            if let Position::Mysql56(set) = &mut status.position {
                set.add(gtid);
            }
        }
    }
}

#[async_trait]
impl MysqlDaemon for FakeMysqlDaemon {
    async fn shutdown(&self, ctx: &CancellationToken, timeout: Duration) -> Result<()> {
        if self.state.lock().hang_on_shutdown {
            tokio::select! {
                _ = ctx.cancelled() => return Err(TabletError::cancelled("shutdown interrupted")),
                _ = tokio::time::sleep(timeout) => {
                    return Err(TabletError::unavailable("mysqld did not shut down in time"));
                }
            }
        }
        self.state.lock().running = false;
        info!("fake mysqld shut down");
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        self.state.lock().running = true;
        info!("fake mysqld started");
        Ok(())
    }

    async fn replication_status(&self) -> Result<Option<ReplicationStatus>> {
        Ok(self.state.lock().replica_status.clone())
    }

    async fn primary_position(&self) -> Result<Position> {
        Ok(self.state.lock().primary_position.clone())
    }

    async fn stop_replication(&self) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(status) = &mut state.replica_status {
            status.io_running = false;
            status.sql_running = false;
        }
        Ok(())
    }

    async fn start_replication(&self) -> Result<()> {
        let mut state = self.state.lock();
        let uuid = Uuid::parse_str(&state.server_uuid)
            .map_err(|e| TabletError::internal(format!("bad fake server uuid: {e}")))?;
        if let Some(status) = &mut state.replica_status {
            status.io_running = true;
            status.sql_running = true;
            // Pretend replication caught up by one transaction so liveness
            // checks observe movement.
            if let Position::Mysql56(set) = &mut status.position {
                let next = 1 + (1..=u64::MAX)
                    .take_while(|seq| {
                        set.contains(&Gtid {
                            server: uuid,
                            sequence: *seq,
                        })
                    })
                    .count() as u64;
                set.add(Gtid {
                    server: uuid,
                    sequence: next,
                });
            }
        }
        Ok(())
    }

    async fn is_super_read_only(&self) -> Result<bool> {
        Ok(self.state.lock().super_read_only)
    }

    async fn set_super_read_only(&self, on: bool) -> Result<bool> {
        let mut state = self.state.lock();
        let previous = state.super_read_only;
        state.super_read_only = on;
        Ok(previous)
    }

    async fn semi_sync_enabled(&self) -> Result<(bool, bool)> {
        let state = self.state.lock();
        Ok((state.semi_sync_source, state.semi_sync_replica))
    }

    async fn set_semi_sync(&self, source: bool, replica: bool) -> Result<()> {
        let mut state = self.state.lock();
        state.semi_sync_source = source;
        state.semi_sync_replica = replica;
        Ok(())
    }

    async fn gtid_purged(&self) -> Result<Position> {
        Ok(self.state.lock().purged.clone())
    }

    async fn server_uuid(&self) -> Result<String> {
        Ok(self.state.lock().server_uuid.clone())
    }

    async fn flush_binary_logs(&self) -> Result<()> {
        // Rotation bookkeeping is the test's job via add_binlog.
        Ok(())
    }

    async fn binary_logs(&self) -> Result<Vec<String>> {
        Ok(self.state.lock().binlogs.iter().map(|b| b.name.clone()).collect())
    }

    async fn binlog_previous_gtids(&self, binlog: &str) -> Result<Position> {
        self.state
            .lock()
            .binlogs
            .iter()
            .find(|b| b.name == binlog)
            .map(|b| b.previous_gtids.clone())
            .ok_or_else(|| TabletError::not_found(format!("unknown binlog {binlog}")))
    }

    async fn apply_binlog_file(&self, path: &Path, stop_pos: &Position) -> Result<()> {
        let content = std::fs::read(path)?;
        self.state
            .lock()
            .applied_binlogs
            .push((content, stop_pos.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fake_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let mysqld = FakeMysqlDaemon::new(dir.path()).unwrap();
        assert!(mysqld.is_running());

        let ctx = CancellationToken::new();
        mysqld.shutdown(&ctx, Duration::from_secs(1)).await.unwrap();
        assert!(!mysqld.is_running());
        mysqld.start().await.unwrap();
        assert!(mysqld.is_running());
    }

    #[tokio::test]
    async fn test_shutdown_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let mysqld = FakeMysqlDaemon::new(dir.path()).unwrap();
        mysqld.hang_on_shutdown(true);
        let ctx = CancellationToken::new();
        let err = mysqld
            .shutdown(&ctx, Duration::from_millis(10))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), tabletd_core::ErrorKind::Unavailable);
        assert!(mysqld.is_running());
    }

    #[tokio::test]
    async fn test_super_read_only_returns_previous() {
        let dir = tempfile::tempdir().unwrap();
        let mysqld = FakeMysqlDaemon::new(dir.path()).unwrap();
        assert!(!mysqld.set_super_read_only(true).await.unwrap());
        assert!(mysqld.set_super_read_only(false).await.unwrap());
    }

    #[tokio::test]
    async fn test_start_replication_moves_position() {
        let dir = tempfile::tempdir().unwrap();
        let mysqld = FakeMysqlDaemon::new(dir.path()).unwrap();
        let uuid = mysqld.server_uuid().await.unwrap();
        let pos = Position::decode(&format!("MySQL56/{uuid}:1-10")).unwrap();
        mysqld.set_replica_status(Some(ReplicationStatus {
            position: pos.clone(),
            io_running: true,
            sql_running: true,
        }));
        mysqld.start_replication().await.unwrap();
        let status = mysqld.replication_status().await.unwrap().unwrap();
        assert_ne!(status.position, pos);
        assert!(pos.subset_of(&status.position).unwrap());
    }
}
