//! Compression engines for backup files
//!
//! Built-in engines stream through `flate2` (the `pgzip` engine), `zstd` and
//! `lz4`. The `external` engine runs an operator-provided shell command as a
//! filter process over pipes. All copies are synchronous `Read`/`Write`
//! composition; the backup engine runs them on blocking tasks.
//!
//! Manifests written by older releases may name the retired `pargzip` engine;
//! it reads back as `pgzip`, with a downgrade notice logged once per restore.

use std::io::{self, Read, Write};
use std::process::{Command, Stdio};
use tabletd_core::{Result, TabletError};
use tracing::warn;

/// Engine name recorded in manifests for externally compressed backups.
pub const EXTERNAL_COMPRESSOR: &str = "external";

/// Historical alias for `pgzip`; accepted on read only.
pub const PARGZIP_COMPRESSOR: &str = "pargzip";

/// A named compression engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionEngine {
    /// Gzip (historically produced by the parallel pgzip implementation).
    Pgzip,
    /// Zstandard.
    Zstd,
    /// LZ4 frame format.
    Lz4,
    /// Operator-provided filter command.
    External,
}

impl CompressionEngine {
    pub fn name(&self) -> &'static str {
        match self {
            CompressionEngine::Pgzip => "pgzip",
            CompressionEngine::Zstd => "zstd",
            CompressionEngine::Lz4 => "lz4",
            CompressionEngine::External => EXTERNAL_COMPRESSOR,
        }
    }

    /// File extension for stored files. Informational; the manifest is
    /// authoritative at restore time.
    pub fn extension(&self) -> &'static str {
        match self {
            CompressionEngine::Pgzip => ".gz",
            CompressionEngine::Zstd => ".zst",
            CompressionEngine::Lz4 => ".lz4",
            CompressionEngine::External => "",
        }
    }

    /// Parse a configured engine name. `pargzip` is not accepted here: it is
    /// a read-time alias only.
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "pgzip" => Ok(CompressionEngine::Pgzip),
            "zstd" => Ok(CompressionEngine::Zstd),
            "lz4" => Ok(CompressionEngine::Lz4),
            EXTERNAL_COMPRESSOR => Ok(CompressionEngine::External),
            other => Err(TabletError::unsupported(format!(
                "unknown compression engine {other:?}"
            ))),
        }
    }

    /// Resolve an engine name found in a manifest. An empty name means the
    /// backup predates the field and was compressed with pgzip; `pargzip`
    /// silently reads as pgzip.
    pub fn resolve_manifest(name: &str, downgrade_logged: &mut bool) -> Result<Self> {
        match name {
            "" => Ok(CompressionEngine::Pgzip),
            PARGZIP_COMPRESSOR => {
                if !*downgrade_logged {
                    warn!("engine \"pargzip\" doesn't support decompression, using \"pgzip\" instead");
                    *downgrade_logged = true;
                }
                Ok(CompressionEngine::Pgzip)
            }
            other => Self::parse(other),
        }
    }
}

impl std::fmt::Display for CompressionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Stream `src` through the compressor into `dst`.
///
/// For [`CompressionEngine::External`], `external_cmd` must carry the filter
/// command; built-in engines ignore it.
pub fn compress_copy(
    engine: CompressionEngine,
    external_cmd: Option<&str>,
    src: &mut (dyn Read + Send),
    dst: &mut dyn Write,
) -> Result<()> {
    match engine {
        CompressionEngine::Pgzip => {
            let mut encoder =
                flate2::write::GzEncoder::new(&mut *dst, flate2::Compression::default());
            io::copy(src, &mut encoder)?;
            encoder.finish()?;
            Ok(())
        }
        CompressionEngine::Zstd => {
            zstd::stream::copy_encode(src, &mut *dst, 0)?;
            Ok(())
        }
        CompressionEngine::Lz4 => {
            let mut encoder = lz4::EncoderBuilder::new()
                .build(&mut *dst)
                .map_err(|e| TabletError::unknown(format!("can't create lz4 encoder: {e}")))?;
            io::copy(src, &mut encoder)?;
            let (_, result) = encoder.finish();
            result?;
            Ok(())
        }
        CompressionEngine::External => {
            let cmd = external_cmd.ok_or_else(|| {
                TabletError::failed_precondition(
                    "compression engine is external but no compressor command is set",
                )
            })?;
            run_filter(cmd, src, dst)
        }
    }
}

/// Stream compressed `src` through the decompressor into `dst`.
pub fn decompress_copy(
    engine: CompressionEngine,
    external_cmd: Option<&str>,
    src: &mut (dyn Read + Send),
    dst: &mut dyn Write,
) -> Result<()> {
    match engine {
        CompressionEngine::Pgzip => {
            let mut decoder = flate2::read::MultiGzDecoder::new(&mut *src);
            io::copy(&mut decoder, dst)?;
            Ok(())
        }
        CompressionEngine::Zstd => {
            zstd::stream::copy_decode(src, &mut *dst)?;
            Ok(())
        }
        CompressionEngine::Lz4 => {
            let mut decoder = lz4::Decoder::new(&mut *src)
                .map_err(|e| TabletError::unknown(format!("can't create lz4 decoder: {e}")))?;
            io::copy(&mut decoder, dst)?;
            Ok(())
        }
        CompressionEngine::External => {
            let cmd = external_cmd.ok_or_else(|| {
                TabletError::failed_precondition(
                    "backup was compressed externally but no decompressor command is available",
                )
            })?;
            run_filter(cmd, src, dst)
        }
    }
}

/// Run a shell command as a filter: `src` is piped to its stdin, its stdout
/// streams into `dst`.
fn run_filter(cmd: &str, src: &mut (dyn Read + Send), dst: &mut dyn Write) -> Result<()> {
    let mut child = Command::new("sh")
        .arg("-c")
        .arg(cmd)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .spawn()
        .map_err(|e| TabletError::unknown(format!("can't spawn filter {cmd:?}: {e}")))?;

    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| TabletError::internal("filter child has no stdin"))?;
    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| TabletError::internal("filter child has no stdout"))?;

    let result = std::thread::scope(|scope| -> Result<()> {
        let feeder = scope.spawn(move || -> io::Result<()> {
            io::copy(src, &mut stdin)?;
            // Dropping stdin signals EOF to the child.
            Ok(())
        });
        io::copy(&mut stdout, dst)?;
        feeder
            .join()
            .map_err(|_| TabletError::internal("filter feeder thread panicked"))??;
        Ok(())
    });

    let status = child
        .wait()
        .map_err(|e| TabletError::unknown(format!("can't wait for filter {cmd:?}: {e}")))?;
    result?;
    if !status.success() {
        return Err(TabletError::unknown(format!(
            "filter {cmd:?} exited with {status}"
        )));
    }
    Ok(())
}
