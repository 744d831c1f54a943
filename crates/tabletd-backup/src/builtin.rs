//! The builtin file-copy backup engine
//!
//! Full backups quiesce and shut down the managed MySQL server, copy its
//! data files through the compression pipeline into backup storage, restart
//! the server, and commit the backup by writing the manifest last.
//! Incremental backups ship whole binlog files covering a GTID range and
//! never stop the server. Restores run the pipeline in reverse and verify
//! every content hash against the manifest.
//!
//! File copies fan out over a semaphore-bounded set of blocking tasks. The
//! backup handle doubles as the error recorder for the fan-out: the first
//! recorded error wins, and tasks that observe a recorded error exit without
//! starting their work.

use crate::binlogs::{choose_binlogs_for_incremental_backup, BinlogFile, ChosenBinlogs};
use crate::compress::{compress_copy, decompress_copy, CompressionEngine, EXTERNAL_COMPRESSOR};
use crate::config::{BackupConfig, CompressionConfig};
use crate::engine::{
    BackupEngine, BackupParams, RestoreParams, AUTO_INCREMENTAL_FROM_POS,
};
use crate::manifest::{
    find_latest_successful, BackupManifest, FileBase, FileEntry, MANIFEST_FILE_NAME,
};
use crate::mysqlctl::Mycnf;
use crate::pipe::{HashingReader, HashingWriter, ProgressReporter};
use crate::storage::{consolidate, BackupHandle, ErrorRecorder, SinkWriter};
use async_trait::async_trait;
use chrono::Utc;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;
use tabletd_core::{Position, Result, TabletError};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

const BUILTIN_ENGINE_NAME: &str = "builtin";

/// The builtin engine. Stateless; everything it needs arrives in the params.
#[derive(Default)]
pub struct BuiltinBackupEngine;

#[async_trait]
impl BackupEngine for BuiltinBackupEngine {
    fn name(&self) -> &'static str {
        BUILTIN_ENGINE_NAME
    }

    async fn execute_backup(
        &self,
        ctx: &CancellationToken,
        params: &BackupParams,
        handle: Arc<dyn BackupHandle>,
    ) -> Result<bool> {
        info!(
            keyspace = %params.keyspace,
            shard = %params.shard,
            tablet = %params.tablet_alias,
            concurrency = params.config.concurrency,
            incremental_from_pos = %params.incremental_from_pos,
            "executing backup"
        );
        if params.is_incremental() {
            self.execute_incremental_backup(ctx, params, handle).await
        } else {
            self.execute_full_backup(ctx, params, handle).await
        }
    }

    async fn execute_restore(
        &self,
        ctx: &CancellationToken,
        params: &RestoreParams,
        handle: Arc<dyn BackupHandle>,
    ) -> Result<BackupManifest> {
        let manifest = crate::manifest::read_manifest(handle.as_ref()).await?;
        if manifest.incremental {
            self.restore_incremental_backup(ctx, params, handle, &manifest)
                .await?;
        } else {
            self.restore_full_backup(ctx, params, handle, &manifest)
                .await?;
        }
        info!(position = %manifest.position, "restore complete");
        Ok(manifest)
    }

    /// Full backups stop the server, so the tablet must stop serving first.
    fn should_drain_for_backup(&self) -> bool {
        true
    }
}

impl BuiltinBackupEngine {
    async fn execute_full_backup(
        &self,
        ctx: &CancellationToken,
        params: &BackupParams,
        handle: Arc<dyn BackupHandle>,
    ) -> Result<bool> {
        let mysqld = &params.mysqld;

        // Save state we must put back after the copy.
        let (semi_sync_source, semi_sync_replica) = mysqld.semi_sync_enabled().await?;
        let saved_super_read_only = mysqld.is_super_read_only().await?;

        let mut replica_start_required = false;
        let mut source_is_primary = false;
        match mysqld.replication_status().await? {
            Some(status) => replica_start_required = status.healthy(),
            None => source_is_primary = true,
        }

        // Capture the position the backup will represent.
        let replication_position = if source_is_primary {
            if !saved_super_read_only {
                info!("enabling super_read_only on primary prior to backup");
                mysqld.set_super_read_only(true).await?;
            }
            mysqld
                .primary_position()
                .await
                .map_err(|e| e.wrap("can't get position on primary"))?
        } else {
            mysqld
                .stop_replication()
                .await
                .map_err(|e| e.wrap("can't stop replica"))?;
            mysqld
                .replication_status()
                .await?
                .ok_or_else(|| {
                    TabletError::failed_precondition("replication status vanished after stop")
                })?
                .position
        };
        info!(position = %replication_position, "using replication position");

        let purged_position = mysqld
            .gtid_purged()
            .await
            .map_err(|e| e.wrap("can't get gtid_purged"))?;
        let server_uuid = mysqld
            .server_uuid()
            .await
            .map_err(|e| e.wrap("can't get server uuid"))?;

        // A clean shutdown is the barrier that makes file-level copy safe.
        mysqld
            .shutdown(ctx, params.config.mysqld_shutdown_timeout)
            .await
            .map_err(|e| e.wrap("can't shutdown mysqld"))?;

        let mut file_entries = find_files_to_backup(&params.cnf)?;
        info!(files = file_entries.len(), "found files to backup");

        let copy_result = copy_files_to_backup(
            ctx,
            &params.config,
            params.cnf.clone(),
            handle.clone(),
            &mut file_entries,
        )
        .await;

        // Restart steps run even when the copy failed; the first failure is
        // what the caller sees, but MySQL is never left down. The restart
        // deliberately ignores the caller's token.
        let restart_result = self
            .restart_after_backup(
                params,
                saved_super_read_only,
                semi_sync_source,
                semi_sync_replica,
                replica_start_required,
                &replication_position,
                ctx,
            )
            .await;

        let mut result = copy_result;
        match restart_result {
            Ok(()) => {}
            Err(e) if result.is_ok() => result = Err(e),
            Err(e) => warn!(error = %e, "restart after failed backup also failed"),
        }

        // The manifest commits the backup; it is written last, and only if
        // every file copy made it.
        if result.is_ok() {
            let manifest = BackupManifest {
                backup_method: BUILTIN_ENGINE_NAME.to_string(),
                position: replication_position,
                purged_position,
                from_position: Position::empty(),
                incremental: false,
                server_uuid,
                tablet_alias: params.tablet_alias.to_string(),
                keyspace: params.keyspace.clone(),
                shard: params.shard.clone(),
                backup_time: params.backup_time.to_rfc3339(),
                finished_time: Utc::now().to_rfc3339(),
                file_entries,
                skip_compress: !params.config.compression.enabled,
                compression_engine: params.config.compression.engine.name().to_string(),
                external_decompressor: params
                    .config
                    .compression
                    .manifest_external_decompressor
                    .clone()
                    .unwrap_or_default(),
            };
            result = write_manifest(handle.as_ref(), &manifest).await;
        }

        result.map(|_| true)
    }

    #[allow(clippy::too_many_arguments)]
    async fn restart_after_backup(
        &self,
        params: &BackupParams,
        saved_super_read_only: bool,
        semi_sync_source: bool,
        semi_sync_replica: bool,
        replica_start_required: bool,
        snapshot_position: &Position,
        ctx: &CancellationToken,
    ) -> Result<()> {
        let mysqld = &params.mysqld;

        mysqld
            .start()
            .await
            .map_err(|e| e.wrap("can't restart mysqld"))?;

        info!(super_read_only = saved_super_read_only, "resetting super_read_only");
        mysqld.set_super_read_only(saved_super_read_only).await?;

        if semi_sync_source || semi_sync_replica {
            // Only touch the variables when one was on; both off can mean
            // the plugin isn't even loaded.
            info!(
                source = semi_sync_source,
                replica = semi_sync_replica,
                "restoring semi-sync settings from before backup"
            );
            mysqld
                .set_semi_sync(semi_sync_source, semi_sync_replica)
                .await?;
        }

        if replica_start_required {
            info!("restarting mysql replication");
            mysqld
                .start_replication()
                .await
                .map_err(|e| e.wrap("cannot restart replica"))?;

            // Wait for the position to move off the pre-backup snapshot so
            // we know replication is alive again.
            let deadline = tokio::time::Instant::now() + params.config.remote_operation_timeout;
            loop {
                if ctx.is_cancelled() {
                    return Err(TabletError::cancelled("waiting for replication restart"));
                }
                if let Some(status) = mysqld.replication_status().await? {
                    if status.position != *snapshot_position {
                        break;
                    }
                }
                if tokio::time::Instant::now() >= deadline {
                    return Err(TabletError::unavailable(
                        "replica is not replicating after backup",
                    ));
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
        Ok(())
    }

    async fn execute_incremental_backup(
        &self,
        ctx: &CancellationToken,
        params: &BackupParams,
        handle: Arc<dyn BackupHandle>,
    ) -> Result<bool> {
        let mysqld = &params.mysqld;

        let server_uuid = mysqld
            .server_uuid()
            .await
            .map_err(|e| e.wrap("can't get server uuid"))?;
        let purged_position = mysqld
            .gtid_purged()
            .await
            .map_err(|e| e.wrap("can't get gtid_purged"))?;

        let from_pos_str = if params.incremental_from_pos == AUTO_INCREMENTAL_FROM_POS {
            info!("auto evaluating incremental_from_pos");
            let (_, latest) =
                find_latest_successful(params.storage.as_ref(), &params.backup_dir()).await?;
            let encoded = latest.position.encode();
            info!(from_pos = %encoded, "auto evaluated incremental_from_pos");
            encoded
        } else {
            params.incremental_from_pos.clone()
        };

        let from_position = Position::decode(&from_pos_str)
            .map_err(|e| e.wrap("cannot decode position in incremental backup"))?;
        // Only UUID-GTID servers support incremental backups; gtid_set()
        // rejects every other flavor.
        let from_gtids = from_position
            .gtid_set()
            .map_err(|e| e.wrap("incremental backup only supports MySQL GTID positions"))?
            .clone();
        let purged_gtids = purged_position.gtid_set()?.clone();

        mysqld
            .flush_binary_logs()
            .await
            .map_err(|e| e.wrap("cannot flush binary logs in incremental backup"))?;

        let names = mysqld.binary_logs().await?;
        let mut binlogs = Vec::with_capacity(names.len());
        for name in names {
            let previous = mysqld.binlog_previous_gtids(&name).await?;
            binlogs.push(BinlogFile {
                previous_gtids: previous.gtid_set()?.clone(),
                name,
            });
        }

        let ChosenBinlogs { files, from_gtids: covered_from } =
            choose_binlogs_for_incremental_backup(&binlogs, &purged_gtids, &from_gtids)?;
        info!(files = files.len(), "chose binlog files for incremental backup");

        let end_position = mysqld.primary_position().await?;
        let manifest_from = Position::Mysql56(covered_from);
        if !manifest_from.subset_of(&end_position)? {
            return Err(TabletError::failed_precondition(format!(
                "incremental backup from-position {manifest_from} exceeds server position {end_position}"
            )));
        }

        let mut file_entries: Vec<FileEntry> = files
            .iter()
            .map(|name| FileEntry::new(FileBase::BinlogDir, name.clone()))
            .collect();

        copy_files_to_backup(
            ctx,
            &params.config,
            params.cnf.clone(),
            handle.clone(),
            &mut file_entries,
        )
        .await?;

        let manifest = BackupManifest {
            backup_method: BUILTIN_ENGINE_NAME.to_string(),
            position: end_position,
            purged_position,
            from_position: manifest_from,
            incremental: true,
            server_uuid,
            tablet_alias: params.tablet_alias.to_string(),
            keyspace: params.keyspace.clone(),
            shard: params.shard.clone(),
            backup_time: params.backup_time.to_rfc3339(),
            finished_time: Utc::now().to_rfc3339(),
            file_entries,
            skip_compress: !params.config.compression.enabled,
            compression_engine: params.config.compression.engine.name().to_string(),
            external_decompressor: params
                .config
                .compression
                .manifest_external_decompressor
                .clone()
                .unwrap_or_default(),
        };
        write_manifest(handle.as_ref(), &manifest).await?;
        Ok(true)
    }

    async fn restore_full_backup(
        &self,
        ctx: &CancellationToken,
        params: &RestoreParams,
        handle: Arc<dyn BackupHandle>,
        manifest: &BackupManifest,
    ) -> Result<()> {
        params
            .mysqld
            .shutdown(ctx, params.config.mysqld_shutdown_timeout)
            .await
            .map_err(|e| e.wrap("can't shutdown mysqld before restore"))?;

        info!(files = manifest.file_entries.len(), "restore: copying files");
        restore_files(ctx, params, handle, manifest, None).await?;

        params
            .mysqld
            .start()
            .await
            .map_err(|e| e.wrap("can't start mysqld after restore"))
    }

    async fn restore_incremental_backup(
        &self,
        ctx: &CancellationToken,
        params: &RestoreParams,
        handle: Arc<dyn BackupHandle>,
        manifest: &BackupManifest,
    ) -> Result<()> {
        info!(position = %manifest.position, "restoring incremental backup");
        let scratch = std::env::temp_dir().join(format!("restore-incremental-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&scratch)?;

        let result = self
            .apply_incremental_files(ctx, params, handle, manifest, &scratch)
            .await;

        // The scratch directory goes away no matter what happened.
        if let Err(e) = std::fs::remove_dir_all(&scratch) {
            warn!(dir = %scratch.display(), error = %e, "can't remove restore scratch directory");
        }
        result
    }

    async fn apply_incremental_files(
        &self,
        ctx: &CancellationToken,
        params: &RestoreParams,
        handle: Arc<dyn BackupHandle>,
        manifest: &BackupManifest,
        scratch: &Path,
    ) -> Result<()> {
        restore_files(ctx, params, handle, manifest, Some(scratch)).await?;

        for fe in &manifest.file_entries {
            let path = params.cnf.full_path(
                fe.base,
                scratch.to_str().unwrap_or_default(),
                &fe.name,
            );
            params
                .mysqld
                .apply_binlog_file(&path, &params.restore_to_pos)
                .await
                .map_err(|e| e.wrap(format!("failed to apply binlog file {}", fe.name)))?;
            if let Err(e) = std::fs::remove_file(&path) {
                warn!(file = %path.display(), error = %e, "can't remove applied binlog file");
            }
            info!(file = %fe.name, "applied binlog file");
        }
        Ok(())
    }
}

/// Walk the configured MySQL directories and list every file to back up.
/// Order is not significant.
pub fn find_files_to_backup(cnf: &Mycnf) -> Result<Vec<FileEntry>> {
    let mut entries = Vec::new();
    for base in [
        FileBase::Data,
        FileBase::InnodbDataHomeDir,
        FileBase::InnodbLogGroupHomeDir,
    ] {
        let root = cnf.root(base);
        if root.is_dir() {
            walk_dir(root, root, base, &mut entries)?;
        }
    }
    Ok(entries)
}

fn walk_dir(root: &Path, dir: &Path, base: FileBase, out: &mut Vec<FileEntry>) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            walk_dir(root, &path, base, out)?;
        } else {
            let rel = path
                .strip_prefix(root)
                .map_err(|e| TabletError::internal(format!("path outside root: {e}")))?;
            out.push(FileEntry::new(base, rel.to_string_lossy().into_owned()));
        }
    }
    Ok(())
}

/// Copy every file entry into the handle, bounded by the configured
/// concurrency. Hashes land back in the entries.
async fn copy_files_to_backup(
    ctx: &CancellationToken,
    config: &BackupConfig,
    cnf: Mycnf,
    handle: Arc<dyn BackupHandle>,
    file_entries: &mut [FileEntry],
) -> Result<()> {
    let sem = Arc::new(Semaphore::new(config.concurrency.max(1)));
    let mut tasks: JoinSet<(usize, Result<Option<String>>)> = JoinSet::new();

    for (i, fe) in file_entries.iter().enumerate() {
        let ctx = ctx.clone();
        let sem = sem.clone();
        let handle = handle.clone();
        let cnf = cnf.clone();
        let config = config.clone();
        let fe = fe.clone();
        tasks.spawn(async move {
            let result = backup_one_file(ctx, sem, handle, cnf, config, fe, i).await;
            (i, result)
        });
    }

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((i, Ok(Some(hash)))) => file_entries[i].hash = hash,
            Ok((_, Ok(None))) => {} // skipped after an earlier error
            Ok((i, Err(e))) => {
                handle.record_error(e.wrap(format!("can't backup file {}", file_entries[i].name)));
            }
            Err(join_err) => {
                handle.record_error(TabletError::internal(format!(
                    "backup task panicked: {join_err}"
                )));
            }
        }
    }

    consolidate(handle.as_ref())
}

async fn backup_one_file(
    ctx: CancellationToken,
    sem: Arc<Semaphore>,
    handle: Arc<dyn BackupHandle>,
    cnf: Mycnf,
    config: BackupConfig,
    fe: FileEntry,
    index: usize,
) -> Result<Option<String>> {
    let _permit = tokio::select! {
        _ = ctx.cancelled() => {
            return Err(TabletError::cancelled("context cancelled"));
        }
        permit = sem.acquire_owned() => {
            permit.map_err(|_| TabletError::internal("backup semaphore closed"))?
        }
    };
    // Acquisition can succeed on an already-cancelled token; check again
    // before doing any work.
    if ctx.is_cancelled() {
        return Err(TabletError::cancelled("context cancelled"));
    }
    if handle.has_errors() {
        info!(file = %fe.name, "skipping file copy after earlier error");
        return Ok(None);
    }

    let source_path = cnf.full_path(fe.base, &fe.parent_path, &fe.name);
    let size = tokio::fs::metadata(&source_path).await?.len();

    info!(file = %fe.name, size, "backing up file");
    let sink = handle.add_file(&index.to_string(), Some(size)).await?;

    let copied = Arc::new(AtomicU64::new(0));
    let _progress = ProgressReporter::spawn(
        fe.name.clone(),
        copied.clone(),
        size,
        config.progress_interval,
    );

    let compression = config.compression.clone();
    let read_buffer = config.file_read_buffer_size;
    let write_buffer = config.file_write_buffer_size;
    let hash = tokio::task::spawn_blocking(move || -> Result<String> {
        copy_source_to_sink(
            &source_path,
            sink,
            &compression,
            read_buffer,
            write_buffer,
            copied,
        )
    })
    .await
    .map_err(|e| TabletError::internal(format!("file copy task panicked: {e}")))??;

    Ok(Some(hash))
}

/// The synchronous half of one backup copy: source file through the optional
/// compressor into the storage sink, hashing what the sink receives.
fn copy_source_to_sink(
    source_path: &Path,
    mut sink: Box<dyn SinkWriter>,
    compression: &CompressionConfig,
    read_buffer: usize,
    write_buffer: usize,
    copied: Arc<AtomicU64>,
) -> Result<String> {
    let file = std::fs::File::open(source_path)?;
    let metered = HashingReader::new(file, copied);
    let mut reader: Box<dyn Read + Send> = if read_buffer > 0 {
        Box::new(BufReader::with_capacity(read_buffer, metered))
    } else {
        Box::new(metered)
    };

    let mut hashing = HashingWriter::new(
        BufWriter::with_capacity(write_buffer.max(1), &mut sink),
        Arc::new(AtomicU64::new(0)),
    );

    if compression.enabled {
        compress_copy(
            compression.engine,
            compression.external_compressor_cmd.as_deref(),
            reader.as_mut(),
            &mut hashing,
        )?;
    } else {
        std::io::copy(&mut reader, &mut hashing)?;
    }
    hashing.flush()?;
    let hash = hashing.hash_hex();
    drop(hashing);
    sink.finish()?;
    Ok(hash)
}

/// Write and commit the manifest, then finalize the handle.
async fn write_manifest(handle: &dyn BackupHandle, manifest: &BackupManifest) -> Result<()> {
    let data = manifest.encode()?;
    let mut sink = handle
        .add_file(MANIFEST_FILE_NAME, None)
        .await
        .map_err(|e| e.wrap(format!("cannot add {MANIFEST_FILE_NAME} to backup")))?;
    tokio::task::spawn_blocking(move || -> Result<()> {
        sink.write_all(&data)?;
        sink.finish()
    })
    .await
    .map_err(|e| TabletError::internal(format!("manifest write task panicked: {e}")))??;
    handle.finish().await
}

/// Restore every file entry from the handle, bounded by the configured
/// concurrency, verifying content hashes. `scratch` overrides the parent
/// path for incremental restores.
async fn restore_files(
    ctx: &CancellationToken,
    params: &RestoreParams,
    handle: Arc<dyn BackupHandle>,
    manifest: &BackupManifest,
    scratch: Option<&Path>,
) -> Result<()> {
    // Resolve the decompression setup once: the downgrade notice logs once
    // per backup, and a missing external decompressor fails fatally before
    // any file moves.
    let mut downgrade_logged = false;
    let (engine, external_cmd) = if manifest.skip_compress {
        (None, None)
    } else {
        let engine =
            CompressionEngine::resolve_manifest(&manifest.compression_engine, &mut downgrade_logged)?;
        let cmd = if engine == CompressionEngine::External {
            let cmd = params
                .config
                .compression
                .external_decompressor_cmd
                .clone()
                .filter(|c| !c.is_empty())
                .or_else(|| {
                    if manifest.external_decompressor.is_empty() {
                        None
                    } else {
                        Some(manifest.external_decompressor.clone())
                    }
                });
            match cmd {
                Some(cmd) => Some(cmd),
                None => {
                    return Err(TabletError::failed_precondition(format!(
                        "backup was compressed with engine {EXTERNAL_COMPRESSOR:?} but no external decompressor command is configured or embedded in the manifest"
                    )))
                }
            }
        } else {
            None
        };
        (Some(engine), cmd)
    };

    let sem = Arc::new(Semaphore::new(params.config.concurrency.max(1)));
    let recorder = Arc::new(ErrorRecorder::new());
    let mut tasks: JoinSet<Result<()>> = JoinSet::new();

    for (i, fe) in manifest.file_entries.iter().enumerate() {
        let ctx = ctx.clone();
        let sem = sem.clone();
        let handle = handle.clone();
        let recorder = recorder.clone();
        let cnf = params.cnf.clone();
        let write_buffer = params.config.file_write_buffer_size;
        let mut fe = fe.clone();
        if let Some(scratch) = scratch {
            fe.parent_path = scratch.to_string_lossy().into_owned();
        }
        let engine = engine;
        let external_cmd = external_cmd.clone();
        tasks.spawn(async move {
            let _permit = tokio::select! {
                _ = ctx.cancelled() => {
                    recorder.record(TabletError::cancelled("context cancelled"));
                    return Ok(());
                }
                permit = sem.acquire_owned() => {
                    permit.map_err(|_| TabletError::internal("restore semaphore closed"))?
                }
            };
            if ctx.is_cancelled() {
                recorder.record(TabletError::cancelled("context cancelled"));
                return Ok(());
            }
            if recorder.has_errors() {
                info!(file = %fe.name, "skipping file restore after earlier error");
                return Ok(());
            }

            info!(file = %fe.name, "restoring file");
            let source = match handle.read_file(&i.to_string()).await {
                Ok(source) => source,
                Err(e) => {
                    recorder.record(e.wrap(format!("can't open backup file {i} for {}", fe.name)));
                    return Ok(());
                }
            };
            let dest_path = cnf.full_path(fe.base, &fe.parent_path, &fe.name);
            let expected_hash = fe.hash.clone();
            let name = fe.name.clone();
            let result = tokio::task::spawn_blocking(move || -> Result<()> {
                copy_sink_to_dest(
                    source,
                    &dest_path,
                    engine,
                    external_cmd.as_deref(),
                    write_buffer,
                    &expected_hash,
                )
            })
            .await
            .map_err(|e| TabletError::internal(format!("file restore task panicked: {e}")))
            .and_then(|r| r);
            if let Err(e) = result {
                recorder.record(e.wrap(format!("can't restore file {name}")));
            }
            Ok(())
        });
    }

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => recorder.record(e),
            Err(join_err) => recorder.record(TabletError::internal(format!(
                "restore task panicked: {join_err}"
            ))),
        }
    }

    match recorder.take_first() {
        // Partial files stay on disk: their presence marks the restore
        // as incomplete.
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// The synchronous half of one restore copy: storage source through the
/// decompressor into the destination file, hashing the stored bytes and
/// verifying them against the manifest.
fn copy_sink_to_dest(
    source: Box<dyn crate::storage::SourceReader>,
    dest_path: &PathBuf,
    engine: Option<CompressionEngine>,
    external_cmd: Option<&str>,
    write_buffer: usize,
    expected_hash: &str,
) -> Result<()> {
    if let Some(parent) = dest_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let dest = std::fs::File::create(dest_path)?;
    let mut writer = BufWriter::with_capacity(write_buffer.max(1), dest);

    let mut hashing = HashingReader::new(source, Arc::new(AtomicU64::new(0)));
    match engine {
        Some(engine) => decompress_copy(engine, external_cmd, &mut hashing, &mut writer)?,
        None => {
            std::io::copy(&mut hashing, &mut writer)?;
        }
    }
    writer.flush()?;

    let actual = hashing.hash_hex();
    if actual != expected_hash {
        return Err(TabletError::internal(format!(
            "hash mismatch for {}: got {actual} expected {expected_hash}",
            dest_path.display()
        )));
    }
    Ok(())
}
