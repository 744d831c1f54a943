//! Binlog selection for incremental backups
//!
//! An incremental backup ships whole binlog files. The requested
//! from-position usually falls somewhere inside a file, so the backup starts
//! at the latest file whose previous-GTIDs are still covered by the request;
//! everything from that file to the newest file forms the backup. The
//! manifest then records that file's previous-GTIDs as the true lower bound,
//! which may be earlier than what the caller asked for.
//!
//! Binlog headers may legitimately omit GTIDs the server has purged (a
//! restored server starts its binlogs past `gtid_purged`), so the purged set
//! is subtracted before the coverage test.

use tabletd_core::{GtidSet, Result, TabletError};

/// A binlog file name with its previous-GTIDs.
#[derive(Debug, Clone)]
pub struct BinlogFile {
    pub name: String,
    pub previous_gtids: GtidSet,
}

/// Outcome of binlog selection.
#[derive(Debug, Clone)]
pub struct ChosenBinlogs {
    /// The contiguous suffix of files to back up, oldest first.
    pub files: Vec<String>,
    /// Previous-GTIDs of the first chosen file: the from-position the
    /// manifest records.
    pub from_gtids: GtidSet,
}

/// Choose the binlog files covering everything after `from`.
///
/// `binlogs` must be in server order, oldest first.
pub fn choose_binlogs_for_incremental_backup(
    binlogs: &[BinlogFile],
    purged: &GtidSet,
    from: &GtidSet,
) -> Result<ChosenBinlogs> {
    if binlogs.is_empty() {
        return Err(TabletError::failed_precondition(
            "no binary logs to backup (is binary logging enabled?)",
        ));
    }
    // Walk newest to oldest: the first file still covered by `from` is the
    // tightest safe starting point. Older files are also covered (previous
    // GTID sets only grow), but add nothing.
    for (i, binlog) in binlogs.iter().enumerate().rev() {
        let unpurged = binlog.previous_gtids.difference(purged);
        if unpurged.subset_of(from) {
            return Ok(ChosenBinlogs {
                files: binlogs[i..].iter().map(|b| b.name.clone()).collect(),
                from_gtids: binlog.previous_gtids.clone(),
            });
        }
    }
    Err(TabletError::failed_precondition(format!(
        "no binary log covers requested GTID set {from}; a full backup is required"
    )))
}
