//! Backup manifest
//!
//! The manifest is the commit marker of a backup: it is written last, and a
//! backup without a parseable manifest does not exist as far as restores are
//! concerned. It is stored as indented JSON under a fixed file name, with
//! stable key names shared by every reader.

use crate::storage::{BackupHandle, BackupStorage};
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::sync::Arc;
use tabletd_core::{Position, Result, TabletError};
use tracing::warn;

/// Fixed manifest file name inside every backup.
pub const MANIFEST_FILE_NAME: &str = "MANIFEST";

/// Where a backed-up file came from, relative to the MySQL instance layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileBase {
    /// The main data directory.
    Data,
    /// InnoDB data home.
    InnodbDataHomeDir,
    /// InnoDB redo log group home.
    InnodbLogGroupHomeDir,
    /// The binary log directory (incremental backups only).
    BinlogDir,
}

/// One file in a backup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    /// Which root the file belongs under.
    #[serde(rename = "Base")]
    pub base: FileBase,

    /// File name relative to the base root.
    #[serde(rename = "Name")]
    pub name: String,

    /// Lowercase hex CRC32 of the stored bytes (after compression, when
    /// compression was applied).
    #[serde(rename = "Hash", default)]
    pub hash: String,

    /// Optional prefix for the base root, used when restoring into a
    /// scratch directory.
    #[serde(rename = "ParentPath", default, skip_serializing_if = "String::is_empty")]
    pub parent_path: String,
}

impl FileEntry {
    pub fn new(base: FileBase, name: impl Into<String>) -> Self {
        Self {
            base,
            name: name.into(),
            hash: String::new(),
            parent_path: String::new(),
        }
    }
}

/// The versioned record describing one backup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupManifest {
    /// Name of the engine that produced this backup.
    #[serde(rename = "BackupMethod")]
    pub backup_method: String,

    /// Replication position at the end of the backup.
    #[serde(rename = "Position")]
    pub position: Position,

    /// `gtid_purged` at the source when the backup was taken.
    #[serde(rename = "PurgedPosition", default)]
    pub purged_position: Position,

    /// Lower bound covered by an incremental backup; the zero position for
    /// full backups.
    #[serde(rename = "FromPosition", default)]
    pub from_position: Position,

    /// Derived from `FromPosition`: true iff it is non-empty.
    #[serde(rename = "Incremental", default)]
    pub incremental: bool,

    /// `@@server_uuid` of the backed-up instance.
    #[serde(rename = "ServerUUID", default)]
    pub server_uuid: String,

    /// Identity of the tablet that took the backup.
    #[serde(rename = "TabletAlias", default)]
    pub tablet_alias: String,

    #[serde(rename = "Keyspace", default)]
    pub keyspace: String,

    #[serde(rename = "Shard", default)]
    pub shard: String,

    /// RFC3339 UTC start time.
    #[serde(rename = "BackupTime", default)]
    pub backup_time: String,

    /// RFC3339 UTC completion time.
    #[serde(rename = "FinishedTime", default)]
    pub finished_time: String,

    /// All files in the backup, in storage order.
    #[serde(rename = "FileEntries", default)]
    pub file_entries: Vec<FileEntry>,

    /// True if files were NOT compressed. Expressed as a negative because
    /// manifests that predate the field were all compressed; decoders treat
    /// missing as false. Encoders always emit it.
    #[serde(rename = "SkipCompress", default)]
    pub skip_compress: bool,

    /// Compression engine used. Empty on old manifests, meaning legacy
    /// pgzip.
    #[serde(rename = "CompressionEngine", default)]
    pub compression_engine: String,

    /// Decompressor command embedded at backup time for externally
    /// compressed backups. Consulted at restore when the runtime flag is
    /// empty.
    #[serde(rename = "ExternalDecompressor", default)]
    pub external_decompressor: String,
}

impl BackupManifest {
    /// Serialize to the canonical indented JSON document.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Parse a manifest and validate its invariants.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let manifest: BackupManifest = serde_json::from_slice(data)?;
        if manifest.backup_method.is_empty() {
            return Err(TabletError::failed_precondition(
                "manifest is missing BackupMethod",
            ));
        }
        if manifest.incremental != !manifest.from_position.is_zero() {
            return Err(TabletError::failed_precondition(
                "manifest Incremental flag disagrees with FromPosition",
            ));
        }
        if manifest.incremental && !manifest.from_position.subset_of(&manifest.position)? {
            return Err(TabletError::failed_precondition(
                "incremental manifest FromPosition exceeds Position",
            ));
        }
        Ok(manifest)
    }
}

/// Read and parse the manifest of one backup.
pub async fn read_manifest(handle: &dyn BackupHandle) -> Result<BackupManifest> {
    let mut reader = handle.read_file(MANIFEST_FILE_NAME).await?;
    let mut data = Vec::new();
    reader
        .read_to_end(&mut data)
        .map_err(|e| TabletError::from(e).wrap("can't read MANIFEST"))?;
    BackupManifest::decode(&data)
}

/// The newest backup in `dir` with a parseable manifest, or `NotFound`.
///
/// Walks the listing newest-first; backups whose manifest is missing or
/// unparseable are skipped with a warning, matching the behavior restores
/// rely on when a backup was interrupted mid-write.
pub async fn find_latest_successful(
    storage: &dyn BackupStorage,
    dir: &str,
) -> Result<(Arc<dyn BackupHandle>, BackupManifest)> {
    let handles = storage.list_backups(dir).await?;
    for handle in handles.into_iter().rev() {
        match read_manifest(handle.as_ref()).await {
            Ok(manifest) => return Ok((handle, manifest)),
            Err(e) => {
                warn!(backup = handle.name(), error = %e, "skipping unusable backup");
            }
        }
    }
    Err(TabletError::not_found(format!(
        "no successful backup found in {dir}"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryBackupStorage, SinkWriter as _};
    use std::io::Write;

    const SID: &str = "3e11fa47-71ca-11e1-9e33-c80aa9429562";

    fn sample_manifest() -> BackupManifest {
        BackupManifest {
            backup_method: "builtin".to_string(),
            position: Position::decode(&format!("MySQL56/{SID}:1-100")).unwrap(),
            purged_position: Position::empty(),
            from_position: Position::empty(),
            incremental: false,
            server_uuid: SID.to_string(),
            tablet_alias: "zone1-0000000101".to_string(),
            keyspace: "commerce".to_string(),
            shard: "-80".to_string(),
            backup_time: "2024-06-01T10:00:00Z".to_string(),
            finished_time: "2024-06-01T10:05:00Z".to_string(),
            file_entries: vec![FileEntry {
                base: FileBase::Data,
                name: "t1.ibd".to_string(),
                hash: "cbf43926".to_string(),
                parent_path: String::new(),
            }],
            skip_compress: false,
            compression_engine: "pgzip".to_string(),
            external_decompressor: String::new(),
        }
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let manifest = sample_manifest();
        let data = manifest.encode().unwrap();
        let back = BackupManifest::decode(&data).unwrap();
        assert_eq!(back.backup_method, manifest.backup_method);
        assert_eq!(back.position, manifest.position);
        assert_eq!(back.file_entries.len(), 1);
        assert_eq!(back.file_entries[0].hash, "cbf43926");
        assert!(!back.incremental);
    }

    #[test]
    fn test_stable_key_names() {
        let data = sample_manifest().encode().unwrap();
        let text = String::from_utf8(data).unwrap();
        for key in [
            "\"BackupMethod\"",
            "\"Position\"",
            "\"PurgedPosition\"",
            "\"FromPosition\"",
            "\"Incremental\"",
            "\"ServerUUID\"",
            "\"TabletAlias\"",
            "\"Keyspace\"",
            "\"Shard\"",
            "\"BackupTime\"",
            "\"FinishedTime\"",
            "\"FileEntries\"",
            "\"SkipCompress\"",
            "\"CompressionEngine\"",
            "\"ExternalDecompressor\"",
        ] {
            assert!(text.contains(key), "missing key {key} in {text}");
        }
    }

    #[test]
    fn test_missing_skip_compress_reads_false() {
        let json = format!(
            r#"{{"BackupMethod":"builtin","Position":"MySQL56/{SID}:1-10"}}"#
        );
        let manifest = BackupManifest::decode(json.as_bytes()).unwrap();
        assert!(!manifest.skip_compress);
        assert!(manifest.compression_engine.is_empty());
    }

    #[test]
    fn test_incremental_invariant() {
        let mut manifest = sample_manifest();
        manifest.from_position =
            Position::decode(&format!("MySQL56/{SID}:1-50")).unwrap();
        manifest.incremental = true;
        let data = manifest.encode().unwrap();
        assert!(BackupManifest::decode(&data).is_ok());

        // from > end is rejected
        manifest.from_position =
            Position::decode(&format!("MySQL56/{SID}:1-200")).unwrap();
        let data = manifest.encode().unwrap();
        assert!(BackupManifest::decode(&data).is_err());

        // flag disagreement is rejected
        manifest.from_position = Position::empty();
        let data = manifest.encode().unwrap();
        assert!(BackupManifest::decode(&data).is_err());
    }

    #[tokio::test]
    async fn test_find_latest_successful_skips_bad_manifests() {
        let storage = MemoryBackupStorage::new();

        // Oldest: good manifest.
        let h1 = storage.start_backup("ks/-80", "b1").await.unwrap();
        let mut sink = h1.add_file(MANIFEST_FILE_NAME, None).await.unwrap();
        sink.write_all(&sample_manifest().encode().unwrap()).unwrap();
        sink.finish().unwrap();
        h1.finish().await.unwrap();

        // Newest: corrupt manifest.
        let h2 = storage.start_backup("ks/-80", "b2").await.unwrap();
        let mut sink = h2.add_file(MANIFEST_FILE_NAME, None).await.unwrap();
        sink.write_all(b"{not json").unwrap();
        sink.finish().unwrap();
        h2.finish().await.unwrap();

        let (handle, manifest) = find_latest_successful(&storage, "ks/-80").await.unwrap();
        assert_eq!(handle.name(), "b1");
        assert_eq!(manifest.backup_method, "builtin");
    }

    #[tokio::test]
    async fn test_find_latest_successful_none() {
        let storage = MemoryBackupStorage::new();
        let err = find_latest_successful(&storage, "ks/-80").await.unwrap_err();
        assert_eq!(err.kind(), tabletd_core::ErrorKind::NotFound);
    }
}
