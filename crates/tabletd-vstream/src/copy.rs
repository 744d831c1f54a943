//! VStreamCopy: snapshot-then-tail
//!
//! When a consumer starts from the empty position with a table set, the
//! session hydrates it first: each table is read in primary-key order in
//! batches, with LASTPK checkpoints after every batch and a completion
//! marker per table, then COPY_COMPLETED, then pure binlog tailing.
//!
//! Between copy batches the session catches the binlog up to the batch's
//! snapshot position. Catch-up events are filtered against copy progress:
//! fully copied tables stream normally, the in-progress table only within
//! the already-copied key range, not-yet-copied tables are held back (their
//! rows arrive with the later snapshot).

use crate::engine::{BinlogEventSource, CopyProgress, Next, VStreamer};
use crate::vevent::{Field, Row, VEvent};
use async_trait::async_trait;
use std::collections::HashMap;
use tabletd_core::{Position, Result, TabletError};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// One table to copy, with an optional resume point.
#[derive(Debug, Clone)]
pub struct TableCopySpec {
    pub name: String,
    /// Resume after this primary key; `None` copies from the beginning.
    pub lastpk: Option<Row>,
    /// Ordinal of the primary key column within the fetched rows.
    pub pk_column: usize,
}

impl TableCopySpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            lastpk: None,
            pk_column: 0,
        }
    }

    pub fn resume_after(mut self, lastpk: Row) -> Self {
        self.lastpk = Some(lastpk);
        self
    }
}

/// One snapshot batch of rows.
#[derive(Debug, Clone)]
pub struct FetchBatch {
    pub fields: Vec<Field>,
    pub rows: Vec<Row>,
    /// Primary key of the last row, for the LASTPK checkpoint.
    pub lastpk: Option<Row>,
    /// The server position the snapshot read is consistent with.
    pub position: Position,
    /// No rows remain after these.
    pub completed: bool,
}

/// Snapshot seam: reads table rows in primary-key order.
#[async_trait]
pub trait RowFetcher: Send + Sync {
    async fn current_position(&self) -> Result<Position>;

    /// Up to `limit` rows of `table` with primary key after `lastpk`.
    async fn fetch(&self, table: &str, lastpk: Option<&Row>, limit: usize)
        -> Result<FetchBatch>;
}

/// Run a copy phase over `tables`, then tail the binlog. Consumes the
/// streamer's session the same way [`VStreamer::stream`] does.
pub async fn copy_then_stream<S, F, R>(
    streamer: &mut VStreamer,
    ctx: &CancellationToken,
    fetcher: &R,
    tables: Vec<TableCopySpec>,
    source: &mut S,
    callback: &mut F,
) -> Result<()>
where
    S: BinlogEventSource,
    F: FnMut(Vec<VEvent>) -> Result<Next> + Send,
    R: RowFetcher,
{
    if tables.is_empty() {
        if let Next::Done = callback(vec![VEvent::CopyCompleted])? {
            return Ok(());
        }
        let pos = fetcher.current_position().await?;
        return streamer.stream(ctx, source, pos, callback).await;
    }

    let copy_batch_size = streamer.copy_batch_size();
    streamer.copy_state = Some(
        tables
            .iter()
            .map(|t| (t.name.clone(), CopyProgress::NotStarted))
            .collect::<HashMap<_, _>>(),
    );

    let mut started = false;
    for spec in &tables {
        info!(table = %spec.name, "starting table copy");
        let mut lastpk = spec.lastpk.clone();
        let mut first_batch = true;
        loop {
            if ctx.is_cancelled() {
                return Err(TabletError::cancelled("vstream copy cancelled"));
            }
            let batch = fetcher
                .fetch(&spec.name, lastpk.as_ref(), copy_batch_size)
                .await?;

            if !started {
                // The copy's first snapshot position anchors the binlog
                // session.
                streamer.set_position(batch.position.clone());
                started = true;
            }

            if !batch.rows.is_empty() {
                let mut events = Vec::with_capacity(batch.rows.len() + 4);
                events.push(VEvent::Begin);
                if first_batch {
                    events.push(VEvent::Field {
                        table_name: spec.name.clone(),
                        fields: batch.fields.clone(),
                    });
                    first_batch = false;
                }
                events.push(VEvent::Row {
                    table_name: spec.name.clone(),
                    row_changes: batch
                        .rows
                        .iter()
                        .map(|row| crate::vevent::RowChange {
                            before: None,
                            after: Some(row.clone()),
                            data_columns: None,
                        })
                        .collect(),
                });
                events.push(VEvent::LastPk {
                    table_name: spec.name.clone(),
                    lastpk: batch.lastpk.clone(),
                    completed: false,
                });
                events.push(VEvent::Commit);
                if let Next::Done = callback(events)? {
                    return Ok(());
                }
            }

            lastpk = batch.lastpk.clone().or(lastpk);
            if let (Some(state), Some(pk)) = (&mut streamer.copy_state, &lastpk) {
                state.insert(
                    spec.name.clone(),
                    CopyProgress::InProgress {
                        lastpk: pk.clone(),
                        pk_column: spec.pk_column,
                    },
                );
            }

            if batch.completed {
                let events = vec![
                    VEvent::Begin,
                    VEvent::LastPk {
                        table_name: spec.name.clone(),
                        lastpk: None,
                        completed: true,
                    },
                    VEvent::Commit,
                ];
                if let Next::Done = callback(events)? {
                    return Ok(());
                }
                if let Some(state) = &mut streamer.copy_state {
                    state.insert(spec.name.clone(), CopyProgress::Completed);
                }
                info!(table = %spec.name, "table copy complete");
                break;
            }

            // Catch the binlog up to this batch's snapshot position before
            // reading more rows.
            if let Next::Done = catch_up(streamer, ctx, source, &batch.position, callback).await? {
                return Ok(());
            }
        }
    }

    streamer.copy_state = None;
    if let Next::Done = callback(vec![VEvent::CopyCompleted])? {
        return Ok(());
    }

    let resume_pos = streamer.position().clone();
    streamer.stream(ctx, source, resume_pos, callback).await
}

/// Drain binlog events until the session position covers `target`.
async fn catch_up<S, F>(
    streamer: &mut VStreamer,
    ctx: &CancellationToken,
    source: &mut S,
    target: &Position,
    callback: &mut F,
) -> Result<Next>
where
    S: BinlogEventSource,
    F: FnMut(Vec<VEvent>) -> Result<Next> + Send,
{
    loop {
        if target.subset_of(streamer.position())? {
            return Ok(Next::Continue);
        }
        let event = tokio::select! {
            _ = ctx.cancelled() => return Err(TabletError::cancelled("vstream copy cancelled")),
            event = source.next_event() => event?,
        };
        let Some(event) = event else {
            return Err(TabletError::unavailable(
                "binlog stream closed during copy catch-up",
            ));
        };
        let mut batches = Vec::new();
        streamer.process_event(event, &mut batches)?;
        for batch in batches {
            if let Next::Done = callback(batch)? {
                return Ok(Next::Done);
            }
        }
    }
}
