//! Hashing and metering stream adapters
//!
//! The copy pipeline composes explicit readers and writers. The hashing
//! adapters compute a CRC32-IEEE checksum of exactly the bytes that cross
//! them, which on the backup side must be the bytes written to storage
//! (compressed, if compression applied) and on the restore side the bytes
//! read back from storage. Byte counters feed the periodic progress logs.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Writer adapter computing a CRC32 of everything written through it.
pub struct HashingWriter<W: Write> {
    inner: W,
    hasher: crc32fast::Hasher,
    written: Arc<AtomicU64>,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(inner: W, written: Arc<AtomicU64>) -> Self {
        Self {
            inner,
            hasher: crc32fast::Hasher::new(),
            written,
        }
    }

    /// Lowercase hex CRC32 of the bytes written so far.
    pub fn hash_hex(&self) -> String {
        format!("{:08x}", self.hasher.clone().finalize())
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(data)?;
        self.hasher.update(&data[..n]);
        self.written.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// Reader adapter computing a CRC32 of everything read through it.
pub struct HashingReader<R: Read> {
    inner: R,
    hasher: crc32fast::Hasher,
    read: Arc<AtomicU64>,
}

impl<R: Read> HashingReader<R> {
    pub fn new(inner: R, read: Arc<AtomicU64>) -> Self {
        Self {
            inner,
            hasher: crc32fast::Hasher::new(),
            read,
        }
    }

    /// Lowercase hex CRC32 of the bytes read so far.
    pub fn hash_hex(&self) -> String {
        format!("{:08x}", self.hasher.clone().finalize())
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        self.read.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }
}

/// Periodic progress logger for one file copy. Stops when dropped.
pub struct ProgressReporter {
    done: Arc<AtomicBool>,
}

impl ProgressReporter {
    /// Spawn a task logging the counter every `period` until the reporter is
    /// dropped. `total` of 0 means the size is unknown.
    pub fn spawn(
        filename: String,
        counter: Arc<AtomicU64>,
        total: u64,
        period: Duration,
    ) -> Self {
        let done = Arc::new(AtomicBool::new(false));
        let done_flag = done.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick fires immediately; skip it.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if done_flag.load(Ordering::Relaxed) {
                    return;
                }
                let copied = counter.load(Ordering::Relaxed);
                if total == 0 {
                    info!(file = %filename, copied_kb = copied / 1024, "copy progress");
                } else {
                    info!(
                        file = %filename,
                        copied_kb = copied / 1024,
                        total_kb = total / 1024,
                        percent = 100 * copied / total.max(1),
                        "copy progress"
                    );
                }
            }
        });
        Self { done }
    }
}

impl Drop for ProgressReporter {
    fn drop(&mut self) {
        self.done.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hashing_writer_matches_reader() {
        let payload = b"some bytes worth hashing";
        let counter = Arc::new(AtomicU64::new(0));
        let mut sink = Vec::new();
        let mut writer = HashingWriter::new(&mut sink, counter.clone());
        writer.write_all(payload).unwrap();
        let write_hash = writer.hash_hex();
        assert_eq!(counter.load(Ordering::Relaxed), payload.len() as u64);

        let read_counter = Arc::new(AtomicU64::new(0));
        let mut reader = HashingReader::new(&payload[..], read_counter.clone());
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, payload);
        assert_eq!(reader.hash_hex(), write_hash);
        assert_eq!(read_counter.load(Ordering::Relaxed), payload.len() as u64);
    }

    #[test]
    fn test_known_crc32_value() {
        // CRC32-IEEE of "123456789" is the classic check value 0xcbf43926.
        let counter = Arc::new(AtomicU64::new(0));
        let mut sink = Vec::new();
        let mut writer = HashingWriter::new(&mut sink, counter);
        writer.write_all(b"123456789").unwrap();
        assert_eq!(writer.hash_hex(), "cbf43926");
    }

    #[test]
    fn test_empty_hash() {
        let counter = Arc::new(AtomicU64::new(0));
        let sink: Vec<u8> = Vec::new();
        let writer = HashingWriter::new(sink, counter);
        assert_eq!(writer.hash_hex(), "00000000");
    }
}
