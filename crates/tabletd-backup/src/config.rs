//! Backup engine configuration
//!
//! All settings travel in explicit records threaded through the engine
//! constructors. A process may hold one instance at its top level for CLI
//! binding; library code only ever borrows it.

use crate::compress::CompressionEngine;
use std::time::Duration;

/// Configuration for the builtin backup engine.
#[derive(Debug, Clone)]
pub struct BackupConfig {
    /// Number of files copied concurrently during backup and restore.
    pub concurrency: usize,
    /// How long to wait for mysqld to shut down at the start of a full backup.
    pub mysqld_shutdown_timeout: Duration,
    /// How often to log progress while copying large files.
    pub progress_interval: Duration,
    /// IO buffer size for reading source files. 0 uses unbuffered reads.
    pub file_read_buffer_size: usize,
    /// IO buffer size for writing restored files and storage sinks.
    pub file_write_buffer_size: usize,
    /// How long to wait for a remote primary position when restarting
    /// replication after a backup.
    pub remote_operation_timeout: Duration,
    /// Compression settings.
    pub compression: CompressionConfig,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            mysqld_shutdown_timeout: Duration::from_secs(10 * 60),
            progress_interval: Duration::from_secs(5),
            file_read_buffer_size: 2 * 1024 * 1024,
            file_write_buffer_size: 2 * 1024 * 1024,
            remote_operation_timeout: Duration::from_secs(30),
            compression: CompressionConfig::default(),
        }
    }
}

/// Compression settings for backup files.
#[derive(Debug, Clone)]
pub struct CompressionConfig {
    /// Whether backup files are compressed at all.
    pub enabled: bool,
    /// The built-in engine, or [`CompressionEngine::External`].
    pub engine: CompressionEngine,
    /// Shell command whose stdin receives plaintext and whose stdout yields
    /// compressed bytes. Required when `engine` is external.
    pub external_compressor_cmd: Option<String>,
    /// File extension recorded in the manifest for external compression.
    /// Informational only.
    pub external_compressor_ext: Option<String>,
    /// Restore-time override for the decompressor command.
    pub external_decompressor_cmd: Option<String>,
    /// Decompressor command embedded into the manifest at backup time, used
    /// as a fallback when the restore-time flag is empty.
    pub manifest_external_decompressor: Option<String>,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            engine: CompressionEngine::Pgzip,
            external_compressor_cmd: None,
            external_compressor_ext: None,
            external_decompressor_cmd: None,
            manifest_external_decompressor: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BackupConfig::default();
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.mysqld_shutdown_timeout, Duration::from_secs(600));
        assert_eq!(config.progress_interval, Duration::from_secs(5));
        assert_eq!(config.file_write_buffer_size, 2 * 1024 * 1024);
        assert!(config.compression.enabled);
        assert_eq!(config.compression.engine, CompressionEngine::Pgzip);
    }
}
