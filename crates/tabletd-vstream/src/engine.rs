//! The VStream session engine
//!
//! One [`VStreamer`] drives one consumer session: it pulls decoded binlog
//! events from a [`BinlogEventSource`] (the replica connection seam),
//! resolves row schemas through the historian, evaluates the session's
//! filter rules, and delivers batches through the packetizer to the
//! consumer callback. Everything in a session runs on one logical task;
//! events reach the callback in source-commit order.

#[cfg(test)]
use crate::binlog::decoder::DecodedRow;
use crate::binlog::decoder::{BinlogEvent, QueryKind, RowsEvent, TableMapEvent};
use crate::binlog::event::{is_bit_set, ColumnType};
use crate::filter::{build_plan, Filter, TablePlan};
use crate::packetizer::Packetizer;
use crate::vevent::{Bitmap, Field, MigrationType, Row, RowChange, VEvent};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
#[cfg(test)]
use tabletd_core::ErrorKind;
use tabletd_core::{Position, Result, TabletError};
use tabletd_tracker::SchemaHistorian;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Session configuration.
#[derive(Debug, Clone)]
pub struct VStreamConfig {
    /// Target batch payload size.
    pub packet_size: usize,
    /// Sidecar database name; its journal and schema-version tables get
    /// special treatment.
    pub sidecar_db: String,
    /// When the historian has no schema for a row's position, fall back to
    /// generic `@1, @2, ...` fields instead of failing.
    pub best_effort_schema: bool,
    /// Vindex used by single-argument `in_keyrange`.
    pub default_vindex: String,
    /// Rows per VStreamCopy batch.
    pub copy_batch_size: usize,
    /// How long the binlog may stay silent before the session sends a
    /// HEARTBEAT batch to the consumer.
    pub heartbeat_interval: Duration,
}

impl Default for VStreamConfig {
    fn default() -> Self {
        Self {
            packet_size: 250 * 1024,
            sidecar_db: "_tabletd".to_string(),
            best_effort_schema: false,
            default_vindex: "hash".to_string(),
            copy_batch_size: 1000,
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

/// What the consumer callback wants next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Next {
    Continue,
    /// Close the session cleanly.
    Done,
}

/// A consumer-supplied start position.
#[derive(Debug, Clone, PartialEq)]
pub enum StartPosition {
    /// Stream from a concrete position.
    At(Position),
    /// Stream from the server's current position.
    Current,
    /// No position: hydrate with a VStreamCopy first.
    Copy,
}

impl StartPosition {
    pub fn parse(spec: &str) -> Result<Self> {
        match spec.trim() {
            "" => Ok(StartPosition::Copy),
            "current" => Ok(StartPosition::Current),
            other => Ok(StartPosition::At(Position::decode(other)?)),
        }
    }
}

/// Source of decoded binlog events: the replica connection.
#[async_trait]
pub trait BinlogEventSource: Send {
    /// The next event, or `None` when the upstream closed.
    async fn next_event(&mut self) -> Result<Option<BinlogEvent>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TableKind {
    /// Streamed through a plan.
    Streamed,
    /// Matched no filter rule.
    Unmatched,
    /// Online-DDL scratch table: rows suppressed.
    Internal,
    /// Sidecar resharding journal.
    Journal,
    /// Sidecar schema-version table.
    Version,
}

struct SessionTable {
    name: String,
    kind: TableKind,
    column_types: Vec<ColumnType>,
    fields: Vec<Field>,
    plan: Option<Arc<TablePlan>>,
    field_sent: bool,
    dropped: bool,
}

/// Per-table progress of a VStreamCopy, consulted while catching up.
pub(crate) enum CopyProgress {
    NotStarted,
    InProgress { lastpk: Row, pk_column: usize },
    Completed,
}

pub(crate) type CopyState = HashMap<String, CopyProgress>;

/// A VStream session.
pub struct VStreamer {
    config: VStreamConfig,
    filter: Filter,
    historian: Arc<SchemaHistorian>,
    pos: Position,
    tables: HashMap<u64, SessionTable>,
    packetizer: Packetizer,
    pending_gtid: Option<VEvent>,
    pub(crate) copy_state: Option<CopyState>,
}

impl VStreamer {
    pub fn new(config: VStreamConfig, filter: Filter, historian: Arc<SchemaHistorian>) -> Self {
        let packet_size = config.packet_size;
        Self {
            config,
            filter,
            historian,
            pos: Position::empty(),
            tables: HashMap::new(),
            packetizer: Packetizer::new(packet_size),
            pending_gtid: None,
            copy_state: None,
        }
    }

    /// The position the session has reached.
    pub fn position(&self) -> &Position {
        &self.pos
    }

    pub(crate) fn set_position(&mut self, pos: Position) {
        self.pos = pos;
    }

    pub(crate) fn copy_batch_size(&self) -> usize {
        self.config.copy_batch_size.max(1)
    }

    /// Stream binlog events into the callback from `start_pos` until the
    /// upstream closes, the callback finishes the session, or the token
    /// fires. The callback's error is the session's exit value.
    pub async fn stream<S, F>(
        &mut self,
        ctx: &CancellationToken,
        source: &mut S,
        start_pos: Position,
        callback: &mut F,
    ) -> Result<()>
    where
        S: BinlogEventSource,
        F: FnMut(Vec<VEvent>) -> Result<Next> + Send,
    {
        self.pos = start_pos;
        loop {
            let event = tokio::select! {
                _ = ctx.cancelled() => return Err(TabletError::cancelled("vstream cancelled")),
                event = tokio::time::timeout(self.config.heartbeat_interval, source.next_event()) => {
                    match event {
                        Ok(event) => event?,
                        Err(_) => {
                            // Binlog idle: let the consumer know the session
                            // is alive.
                            let mut batches = Vec::new();
                            self.packetizer.add_group(vec![VEvent::Heartbeat], &mut batches);
                            for batch in batches {
                                if let Next::Done = callback(batch)? {
                                    return Ok(());
                                }
                            }
                            continue;
                        }
                    }
                }
            };
            let Some(event) = event else {
                // Upstream closed; hand over whatever is buffered.
                let mut batches = Vec::new();
                self.packetizer.flush(&mut batches);
                for batch in batches {
                    if let Next::Done = callback(batch)? {
                        return Ok(());
                    }
                }
                return Ok(());
            };
            let mut batches = Vec::new();
            self.process_event(event, &mut batches)?;
            for batch in batches {
                if let Next::Done = callback(batch)? {
                    return Ok(());
                }
            }
        }
    }

    /// Process one binlog event into zero or more consumer batches.
    pub(crate) fn process_event(
        &mut self,
        event: BinlogEvent,
        out: &mut Vec<Vec<VEvent>>,
    ) -> Result<()> {
        match event {
            BinlogEvent::FormatDescription { server_version } => {
                debug!(server_version, "binlog format description");
            }
            BinlogEvent::Rotate { next_file, .. } => {
                debug!(file = %next_file, "binlog rotate");
            }
            BinlogEvent::PreviousGtids(set) => {
                if self.pos.is_zero() {
                    self.pos = Position::Mysql56(set);
                }
            }
            BinlogEvent::Gtid(gtid) => {
                self.pos.add_gtid(gtid)?;
                self.pending_gtid = Some(VEvent::Gtid(self.pos.clone()));
            }
            BinlogEvent::TableMap(map) => self.track_table(map)?,
            BinlogEvent::WriteRows(rows) => self.process_rows(rows, RowEventKind::Insert, out)?,
            BinlogEvent::UpdateRows(rows) => self.process_rows(rows, RowEventKind::Update, out)?,
            BinlogEvent::DeleteRows(rows) => self.process_rows(rows, RowEventKind::Delete, out)?,
            BinlogEvent::Xid => {
                self.emit(vec![VEvent::Commit], out);
                self.packetizer.flush(out);
            }
            BinlogEvent::Query { sql, .. } => self.process_query(sql, out)?,
            BinlogEvent::Heartbeat => self.packetizer.add_group(vec![VEvent::Heartbeat], out),
            BinlogEvent::Stop | BinlogEvent::Unknown(_) => {}
        }
        Ok(())
    }

    /// Queue a group, prepending any pending GTID event so the GTID always
    /// precedes the transaction content (and its COMMIT) in the stream.
    fn emit(&mut self, events: Vec<VEvent>, out: &mut Vec<Vec<VEvent>>) {
        let mut group = Vec::with_capacity(events.len() + 1);
        if let Some(gtid) = self.pending_gtid.take() {
            group.push(gtid);
        }
        group.extend(events);
        self.packetizer.add_group(group, out);
    }

    fn process_query(&mut self, sql: String, out: &mut Vec<Vec<VEvent>>) -> Result<()> {
        match QueryKind::of(&sql) {
            QueryKind::Begin => self.emit(vec![VEvent::Begin], out),
            QueryKind::Commit => {
                self.emit(vec![VEvent::Commit], out);
                self.packetizer.flush(out);
            }
            QueryKind::Ddl => {
                // DDL drops the affected table out of the session map; the
                // next TABLE_MAP re-enters it with fresh columns. DDL on
                // internal tables is surfaced like any other.
                if let Some(table) = ddl_table_name(&sql) {
                    for session_table in self.tables.values_mut() {
                        if session_table.name == table {
                            session_table.dropped = true;
                            session_table.field_sent = false;
                        }
                    }
                }
                self.emit(vec![VEvent::Ddl(sql)], out);
            }
            // Statement-format DML is passed through untyped rows.
            QueryKind::Insert => self.emit(vec![VEvent::InsertStatement(sql)], out),
            QueryKind::Update => self.emit(vec![VEvent::UpdateStatement(sql)], out),
            QueryKind::Delete => self.emit(vec![VEvent::DeleteStatement(sql)], out),
            QueryKind::Other => self.emit(vec![VEvent::Other(sql)], out),
        }
        Ok(())
    }

    fn track_table(&mut self, map: TableMapEvent) -> Result<()> {
        // An unchanged remap keeps the session state (and FIELD suppression).
        if let Some(existing) = self.tables.get(&map.table_id) {
            if !existing.dropped
                && existing.name == map.table_name
                && existing.column_types == map.column_types
            {
                return Ok(());
            }
        }

        let name = map.table_name.clone();
        let kind = if is_internal_table(&name) {
            TableKind::Internal
        } else if map.schema_name == self.config.sidecar_db {
            match name.as_str() {
                "resharding_journal" => TableKind::Journal,
                "schema_version" => TableKind::Version,
                _ => TableKind::Internal,
            }
        } else if self.filter.rule_for(&name).is_some() {
            TableKind::Streamed
        } else {
            TableKind::Unmatched
        };

        let (fields, plan) = if kind == TableKind::Streamed {
            let fields = self.resolve_fields(&map)?;
            let rule = self
                .filter
                .rule_for(&name)
                .cloned()
                .ok_or_else(|| TabletError::internal("rule vanished during table tracking"))?;
            let plan = build_plan(&rule, &name, &fields, &self.config.default_vindex)?;
            (fields, Some(Arc::new(plan)))
        } else {
            (Vec::new(), None)
        };

        self.tables.insert(
            map.table_id,
            SessionTable {
                name,
                kind,
                column_types: map.column_types,
                fields,
                plan,
                field_sent: false,
                dropped: false,
            },
        );
        Ok(())
    }

    /// The table's fields at the current position, from the historian; in
    /// best-effort mode a missing schema degrades to `@1, @2, ...` with
    /// types taken from the table map alone.
    fn resolve_fields(&self, map: &TableMapEvent) -> Result<Vec<Field>> {
        match self.historian.table_at(&map.table_name, &self.pos) {
            Ok(schema) if schema.fields.len() == map.column_count() => Ok(schema
                .fields
                .iter()
                .map(|f| Field::new(f.name.clone(), ColumnType::from_u8(f.column_type)))
                .collect()),
            Ok(_) | Err(_) if self.config.best_effort_schema => Ok(map
                .column_types
                .iter()
                .enumerate()
                .map(|(i, t)| Field::new(format!("@{}", i + 1), *t))
                .collect()),
            Ok(stale) => Err(TabletError::not_found(format!(
                "schema for table {} at position {} has {} columns, binlog has {}",
                map.table_name,
                self.pos,
                stale.fields.len(),
                map.column_count()
            ))),
            Err(e) => Err(e),
        }
    }

    fn process_rows(
        &mut self,
        rows: RowsEvent,
        kind: RowEventKind,
        out: &mut Vec<Vec<VEvent>>,
    ) -> Result<()> {
        let (table_kind, table_name, column_types) = {
            let table = self.tables.get(&rows.table_id).ok_or_else(|| {
                TabletError::internal(format!(
                    "row event for untracked table id {}",
                    rows.table_id
                ))
            })?;
            if table.dropped {
                warn!(table = %table.name, "row event for dropped table, skipping");
                return Ok(());
            }
            (table.kind, table.name.clone(), table.column_types.clone())
        };
        match table_kind {
            TableKind::Internal | TableKind::Unmatched => return Ok(()),
            TableKind::Journal => return self.process_journal_rows(&rows, out),
            TableKind::Version => return self.process_version_rows(out),
            TableKind::Streamed => {}
        }

        reject_minimal_row_image(&rows, &column_types)?;

        // Catch-up filtering during a VStreamCopy.
        if let Some(state) = &self.copy_state {
            match state.get(&table_name) {
                None | Some(CopyProgress::Completed) => {}
                Some(CopyProgress::NotStarted) => return Ok(()),
                Some(CopyProgress::InProgress { lastpk, pk_column }) => {
                    return self.process_rows_in_copy_range(
                        rows,
                        kind,
                        lastpk.clone(),
                        *pk_column,
                        out,
                    );
                }
            }
        }
        self.emit_row_changes(rows, kind, None, out)
    }

    fn process_rows_in_copy_range(
        &mut self,
        rows: RowsEvent,
        kind: RowEventKind,
        lastpk: Row,
        pk_column: usize,
        out: &mut Vec<Vec<VEvent>>,
    ) -> Result<()> {
        self.emit_row_changes(rows, kind, Some((lastpk, pk_column)), out)
    }

    fn emit_row_changes(
        &mut self,
        rows: RowsEvent,
        kind: RowEventKind,
        copy_bound: Option<(Row, usize)>,
        out: &mut Vec<Vec<VEvent>>,
    ) -> Result<()> {
        let table = self
            .tables
            .get_mut(&rows.table_id)
            .ok_or_else(|| TabletError::internal("table vanished during row processing"))?;
        let plan = table
            .plan
            .clone()
            .ok_or_else(|| TabletError::internal("streamed table without a plan"))?;

        let partial = rows.is_partial();
        let mut row_changes = Vec::new();
        for row in &rows.rows {
            let before = row.before.as_ref().map(|cols| Row::from_columns(cols));
            let after = row.after.as_ref().map(|cols| Row::from_columns(cols));

            // During copy catch-up, only rows at or below the copied
            // primary-key bound apply.
            if let Some((lastpk, pk_column)) = &copy_bound {
                let key_row = after.as_ref().or(before.as_ref());
                let in_range = key_row
                    .map(|r| pk_within(r, lastpk, *pk_column))
                    .unwrap_or(false);
                if !in_range {
                    continue;
                }
            }

            let before_in = before.as_ref().map(|r| plan.filter_row(r)).unwrap_or(false);
            let after_in = after.as_ref().map(|r| plan.filter_row(r)).unwrap_or(false);

            // An UPDATE that moves a row across the filter boundary
            // becomes the corresponding INSERT or DELETE image.
            let (emit_before, emit_after) = match kind {
                RowEventKind::Insert => (None, after.filter(|_| after_in)),
                RowEventKind::Delete => (before.filter(|_| before_in), None),
                RowEventKind::Update => match (before_in, after_in) {
                    (true, true) => (before, after),
                    (true, false) => (before, None),
                    (false, true) => (None, after),
                    (false, false) => (None, None),
                },
            };
            if emit_before.is_none() && emit_after.is_none() {
                continue;
            }

            let data_columns = if partial {
                let image = rows.present_after.as_deref().unwrap_or(&rows.present_before);
                let mut bitmap = Bitmap::new(rows.column_count);
                for i in 0..rows.column_count {
                    if is_bit_set(image, i) {
                        bitmap.set(i);
                    }
                }
                Some(bitmap)
            } else {
                None
            };

            row_changes.push(RowChange {
                before: emit_before.map(|r| plan.project(&r)),
                after: emit_after.map(|r| plan.project(&r)),
                data_columns,
            });
        }

        if row_changes.is_empty() {
            return Ok(());
        }

        let mut group = Vec::new();
        if !table.field_sent {
            group.push(VEvent::Field {
                table_name: table.name.clone(),
                fields: plan.project_fields(&table.fields),
            });
            table.field_sent = true;
        }
        let table_name = table.name.clone();
        group.push(VEvent::Row {
            table_name,
            row_changes,
        });
        self.emit(group, out);
        Ok(())
    }

    fn process_journal_rows(&mut self, rows: &RowsEvent, out: &mut Vec<Vec<VEvent>>) -> Result<()> {
        let mut events = Vec::new();
        for row in &rows.rows {
            let Some(after) = &row.after else { continue };
            let id = after
                .first()
                .and_then(|c| c.as_ref())
                .and_then(|bytes| std::str::from_utf8(bytes).ok())
                .and_then(|s| s.parse::<i64>().ok())
                .unwrap_or(0);
            let migration_type = after
                .get(2)
                .and_then(|c| c.as_ref())
                .map(|v| String::from_utf8_lossy(v).to_lowercase())
                .filter(|v| v.contains("shards"))
                .map(|_| MigrationType::Shards)
                .unwrap_or(MigrationType::Tables);
            events.push(VEvent::Journal { id, migration_type });
        }
        if !events.is_empty() {
            self.emit(events, out);
        }
        Ok(())
    }

    fn process_version_rows(&mut self, out: &mut Vec<Vec<VEvent>>) -> Result<()> {
        self.emit(vec![VEvent::Version], out);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum RowEventKind {
    Insert,
    Update,
    Delete,
}

/// A partial row image is fine when the missing columns are all BLOB/TEXT
/// (binlog_row_image=noblob); anything else means minimal row images, which
/// cannot be streamed.
fn reject_minimal_row_image(rows: &RowsEvent, column_types: &[ColumnType]) -> Result<()> {
    let check = |bitmap: &[u8]| -> Result<()> {
        for (i, column_type) in column_types.iter().enumerate() {
            if !is_bit_set(bitmap, i) && !column_type.is_blob() {
                return Err(TabletError::unsupported(
                    "binlog_row_image=minimal is not supported; use full or noblob",
                ));
            }
        }
        Ok(())
    };
    check(&rows.present_before)?;
    if let Some(after) = &rows.present_after {
        check(after)?;
    }
    Ok(())
}

/// Whether a row's primary key is at or below the copied bound.
pub(crate) fn pk_within(row: &Row, lastpk: &Row, pk_column: usize) -> bool {
    let (Some(a), Some(b)) = (row.column(pk_column), lastpk.column(pk_column)) else {
        return false;
    };
    match (
        std::str::from_utf8(a).ok().and_then(|s| s.parse::<i64>().ok()),
        std::str::from_utf8(b).ok().and_then(|s| s.parse::<i64>().ok()),
    ) {
        (Some(a), Some(b)) => a <= b,
        _ => a <= b,
    }
}

/// The table a DDL statement targets: the identifier after the TABLE (or
/// VIEW) keyword, stripped of backticks and a database qualifier.
fn ddl_table_name(sql: &str) -> Option<String> {
    let mut words = sql.split_whitespace();
    while let Some(word) = words.next() {
        if word.eq_ignore_ascii_case("table") || word.eq_ignore_ascii_case("view") {
            let raw = words.next()?;
            let raw = raw.trim_end_matches(|c| c == '(' || c == ';' || c == ',');
            let unqualified = raw.rsplit('.').next().unwrap_or(raw);
            return Some(unqualified.trim_matches('`').to_string());
        }
    }
    None
}

static INTERNAL_TABLE_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        // Our own scratch tables.
        Regex::new(r"^_vt_.*$").unwrap(),
        // gh-ost.
        Regex::new(r"^_.*_gho$").unwrap(),
        Regex::new(r"^_.*_ghc$").unwrap(),
        Regex::new(r"^_.*_del$").unwrap(),
        // pt-online-schema-change.
        Regex::new(r"^_.*_old$").unwrap(),
    ]
});

/// Tables used by online schema-change tooling: row events are suppressed,
/// DDL is not.
pub fn is_internal_table(name: &str) -> bool {
    INTERNAL_TABLE_PATTERNS.iter().any(|re| re.is_match(name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binlog::event::EventType;
    use crate::filter::Rule;
    use std::collections::VecDeque;
    use tabletd_core::Gtid;
    use tabletd_tracker::{MemorySchemaVersionStore, MinimalSchema, TableField, TableSchema};
    use uuid::Uuid;

    const SID: &str = "3e11fa47-71ca-11e1-9e33-c80aa9429562";

    fn pos(spec: &str) -> Position {
        Position::decode(&format!("MySQL56/{SID}:{spec}")).unwrap()
    }

    fn gtid(sequence: u64) -> BinlogEvent {
        BinlogEvent::Gtid(Gtid {
            server: Uuid::parse_str(SID).unwrap(),
            sequence,
        })
    }

    pub(crate) struct ScriptedSource {
        pub events: VecDeque<BinlogEvent>,
    }

    #[async_trait]
    impl BinlogEventSource for ScriptedSource {
        async fn next_event(&mut self) -> Result<Option<BinlogEvent>> {
            Ok(self.events.pop_front())
        }
    }

    async fn historian_with(tables: Vec<TableSchema>) -> Arc<SchemaHistorian> {
        let historian = Arc::new(SchemaHistorian::new(Arc::new(
            MemorySchemaVersionStore::new(),
        )));
        historian
            .open(pos("1-5"), MinimalSchema { tables })
            .await
            .unwrap();
        historian
    }

    fn t1_schema() -> TableSchema {
        TableSchema::new(
            "t1",
            vec![
                TableField::new("id", ColumnType::Long as u8),
                TableField::new("v", ColumnType::VarString as u8),
            ],
        )
        .with_pk(vec![0])
    }

    fn table_map(table_id: u64, schema: &str, name: &str, types: Vec<ColumnType>) -> BinlogEvent {
        BinlogEvent::TableMap(TableMapEvent {
            table_id,
            schema_name: schema.to_string(),
            table_name: name.to_string(),
            column_types: types,
            column_metadata: Vec::new(),
        })
    }

    fn t1_map() -> BinlogEvent {
        table_map(8, "test", "t1", vec![ColumnType::Long, ColumnType::VarString])
    }

    fn write_rows(table_id: u64, values: Vec<Vec<Option<&str>>>) -> BinlogEvent {
        let column_count = values.first().map(|r| r.len()).unwrap_or(0);
        BinlogEvent::WriteRows(RowsEvent {
            table_id,
            column_count,
            present_before: vec![0xFF; column_count.div_ceil(8)],
            present_after: None,
            rows: values
                .into_iter()
                .map(|row| DecodedRow {
                    before: None,
                    after: Some(
                        row.into_iter()
                            .map(|v| v.map(|s| s.as_bytes().to_vec()))
                            .collect(),
                    ),
                })
                .collect(),
        })
    }

    fn update_rows(
        table_id: u64,
        before: Vec<Option<&str>>,
        after: Vec<Option<&str>>,
    ) -> BinlogEvent {
        let column_count = before.len();
        BinlogEvent::UpdateRows(RowsEvent {
            table_id,
            column_count,
            present_before: vec![0xFF; column_count.div_ceil(8)],
            present_after: Some(vec![0xFF; column_count.div_ceil(8)]),
            rows: vec![DecodedRow {
                before: Some(
                    before
                        .into_iter()
                        .map(|v| v.map(|s| s.as_bytes().to_vec()))
                        .collect(),
                ),
                after: Some(
                    after
                        .into_iter()
                        .map(|v| v.map(|s| s.as_bytes().to_vec()))
                        .collect(),
                ),
            }],
        })
    }

    async fn run_session(
        filter: Filter,
        historian: Arc<SchemaHistorian>,
        events: Vec<BinlogEvent>,
    ) -> Result<Vec<Vec<VEvent>>> {
        let mut streamer = VStreamer::new(
            VStreamConfig {
                best_effort_schema: false,
                default_vindex: "numeric".to_string(),
                ..VStreamConfig::default()
            },
            filter,
            historian,
        );
        let mut source = ScriptedSource {
            events: events.into(),
        };
        let mut batches = Vec::new();
        let ctx = CancellationToken::new();
        streamer
            .stream(&ctx, &mut source, pos("1-5"), &mut |batch| {
                batches.push(batch);
                Ok(Next::Continue)
            })
            .await?;
        Ok(batches)
    }

    fn flatten(batches: Vec<Vec<VEvent>>) -> Vec<VEvent> {
        batches.into_iter().flatten().collect()
    }

    /// S3: insert then update produce exactly two ROW events with the
    /// expected images, after an initial FIELD event.
    #[tokio::test]
    async fn test_insert_then_update_images() {
        let historian = historian_with(vec![t1_schema()]).await;
        let events = vec![
            t1_map(),
            gtid(6),
            BinlogEvent::Query {
                schema: "test".into(),
                sql: "BEGIN".into(),
            },
            write_rows(8, vec![vec![Some("1"), Some("aaa")]]),
            BinlogEvent::Xid,
            gtid(7),
            BinlogEvent::Query {
                schema: "test".into(),
                sql: "BEGIN".into(),
            },
            update_rows(8, vec![Some("1"), Some("aaa")], vec![Some("1"), Some("bbb")]),
            BinlogEvent::Xid,
        ];
        let all = flatten(
            run_session(Filter::pass_all().unwrap(), historian, events)
                .await
                .unwrap(),
        );

        let fields: Vec<&VEvent> = all
            .iter()
            .filter(|e| matches!(e, VEvent::Field { .. }))
            .collect();
        assert_eq!(fields.len(), 1);
        match fields[0] {
            VEvent::Field { table_name, fields } => {
                assert_eq!(table_name, "t1");
                assert_eq!(fields[0].name, "id");
                assert_eq!(fields[1].name, "v");
            }
            _ => unreachable!(),
        }

        let rows: Vec<&VEvent> = all
            .iter()
            .filter(|e| matches!(e, VEvent::Row { .. }))
            .collect();
        assert_eq!(rows.len(), 2);
        match rows[0] {
            VEvent::Row { row_changes, .. } => {
                assert!(row_changes[0].before.is_none());
                let after = row_changes[0].after.as_ref().unwrap();
                assert_eq!(after.lengths, vec![1, 3]);
                assert_eq!(after.values, b"1aaa");
            }
            _ => unreachable!(),
        }
        match rows[1] {
            VEvent::Row { row_changes, .. } => {
                let before = row_changes[0].before.as_ref().unwrap();
                assert_eq!(before.values, b"1aaa");
                let after = row_changes[0].after.as_ref().unwrap();
                assert_eq!(after.values, b"1bbb");
            }
            _ => unreachable!(),
        }

        // The FIELD precedes the first ROW, and every GTID precedes its
        // COMMIT.
        let field_idx = all
            .iter()
            .position(|e| matches!(e, VEvent::Field { .. }))
            .unwrap();
        let first_row_idx = all
            .iter()
            .position(|e| matches!(e, VEvent::Row { .. }))
            .unwrap();
        assert!(field_idx < first_row_idx);
    }

    /// S4: a noblob update carries -1 lengths for the untouched blob and a
    /// data-columns bitmap over columns 0 and 2.
    #[tokio::test]
    async fn test_noblob_update_bitmap() {
        let historian = historian_with(vec![TableSchema::new(
            "t1",
            vec![
                TableField::new("id", ColumnType::Long as u8),
                TableField::new("blb", ColumnType::Blob as u8),
                TableField::new("v", ColumnType::VarString as u8),
            ],
        )])
        .await;

        let map = table_map(
            9,
            "test",
            "t1",
            vec![ColumnType::Long, ColumnType::Blob, ColumnType::VarString],
        );
        // Present bitmap 0b101: blob column omitted from both images.
        let update = BinlogEvent::UpdateRows(RowsEvent {
            table_id: 9,
            column_count: 3,
            present_before: vec![0x05],
            present_after: Some(vec![0x05]),
            rows: vec![DecodedRow {
                before: Some(vec![Some(b"1".to_vec()), None, Some(b"aaa".to_vec())]),
                after: Some(vec![Some(b"1".to_vec()), None, Some(b"bbb".to_vec())]),
            }],
        });
        let events = vec![
            map,
            gtid(6),
            BinlogEvent::Query {
                schema: "test".into(),
                sql: "BEGIN".into(),
            },
            update,
            BinlogEvent::Xid,
        ];
        let all = flatten(
            run_session(Filter::pass_all().unwrap(), historian, events)
                .await
                .unwrap(),
        );
        let row = all
            .iter()
            .find_map(|e| match e {
                VEvent::Row { row_changes, .. } => Some(&row_changes[0]),
                _ => None,
            })
            .unwrap();
        assert_eq!(row.before.as_ref().unwrap().lengths, vec![1, -1, 3]);
        assert_eq!(row.before.as_ref().unwrap().values, b"1aaa");
        assert_eq!(row.after.as_ref().unwrap().lengths, vec![1, -1, 3]);
        assert_eq!(row.after.as_ref().unwrap().values, b"1bbb");
        let bitmap = row.data_columns.as_ref().unwrap();
        assert_eq!(bitmap.bits, vec![0x05]);
        assert!(bitmap.bit(0) && !bitmap.bit(1) && bitmap.bit(2));
    }

    /// A partial image missing a non-blob column is minimal row image:
    /// fatal.
    #[tokio::test]
    async fn test_minimal_row_image_rejected() {
        let historian = historian_with(vec![t1_schema()]).await;
        let partial = BinlogEvent::WriteRows(RowsEvent {
            table_id: 8,
            column_count: 2,
            present_before: vec![0x01], // varchar column missing
            present_after: None,
            rows: vec![DecodedRow {
                before: None,
                after: Some(vec![Some(b"1".to_vec()), None]),
            }],
        });
        let err = run_session(
            Filter::pass_all().unwrap(),
            historian,
            vec![t1_map(), gtid(6), partial],
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unsupported);
    }

    /// S5: with an in_keyrange filter, an update moving the row out of the
    /// range emits a DELETE image only.
    #[tokio::test]
    async fn test_keyrange_move_emits_delete() {
        let historian = historian_with(vec![t1_schema()]).await;
        let filter = Filter::new(vec![keyrange_rule()]);

        // id=1 is in -80 under the numeric vindex; id=2^63 is in 80-.
        let events = vec![
            t1_map(),
            gtid(6),
            BinlogEvent::Query {
                schema: "test".into(),
                sql: "BEGIN".into(),
            },
            write_rows(8, vec![vec![Some("1"), Some("aaa")]]),
            BinlogEvent::Xid,
            gtid(7),
            BinlogEvent::Query {
                schema: "test".into(),
                sql: "BEGIN".into(),
            },
            update_rows(
                8,
                vec![Some("1"), Some("aaa")],
                vec![Some("9223372036854775808"), Some("aaa")],
            ),
            BinlogEvent::Xid,
        ];
        let all = flatten(run_session(filter, historian, events).await.unwrap());
        let rows: Vec<&VEvent> = all
            .iter()
            .filter(|e| matches!(e, VEvent::Row { .. }))
            .collect();
        assert_eq!(rows.len(), 2);
        match rows[1] {
            VEvent::Row { row_changes, .. } => {
                assert!(row_changes[0].before.is_some());
                assert!(row_changes[0].after.is_none());
            }
            _ => unreachable!(),
        }
    }

    fn keyrange_rule() -> Rule {
        Rule::new("t1", Some("select * from t1 where in_keyrange('-80')")).unwrap()
    }

    /// Internal online-DDL tables are suppressed for rows but their DDL is
    /// surfaced.
    #[tokio::test]
    async fn test_internal_table_suppression() {
        assert!(is_internal_table("_vt_HOLD_6ace8bcef73211ea87e9f875a4d24e90"));
        assert!(is_internal_table("_t1_gho"));
        assert!(is_internal_table("_t1_old"));
        assert!(!is_internal_table("t1"));
        assert!(!is_internal_table("vt_user"));

        let historian = historian_with(vec![t1_schema()]).await;
        let events = vec![
            table_map(11, "test", "_t1_gho", vec![ColumnType::Long, ColumnType::VarString]),
            gtid(6),
            write_rows(11, vec![vec![Some("1"), Some("aaa")]]),
            BinlogEvent::Query {
                schema: "test".into(),
                sql: "alter table _t1_gho add column x int".into(),
            },
            BinlogEvent::Xid,
        ];
        let all = flatten(
            run_session(Filter::pass_all().unwrap(), historian, events)
                .await
                .unwrap(),
        );
        assert!(!all.iter().any(|e| matches!(e, VEvent::Row { .. })));
        assert!(all.iter().any(|e| matches!(e, VEvent::Ddl(_))));
    }

    /// Statement-format DML passes through as typed statement events.
    #[tokio::test]
    async fn test_statement_mode_passthrough() {
        let historian = historian_with(vec![t1_schema()]).await;
        let events = vec![
            gtid(6),
            BinlogEvent::Query {
                schema: "test".into(),
                sql: "insert into t1 values(1, 'aaa')".into(),
            },
            BinlogEvent::Xid,
        ];
        let all = flatten(
            run_session(Filter::pass_all().unwrap(), historian, events)
                .await
                .unwrap(),
        );
        assert!(all
            .iter()
            .any(|e| matches!(e, VEvent::InsertStatement(sql) if sql.contains("values"))));
    }

    /// Journal table writes surface as JOURNAL events.
    #[tokio::test]
    async fn test_journal_events() {
        let historian = historian_with(vec![]).await;
        let events = vec![
            table_map(
                12,
                "_tabletd",
                "resharding_journal",
                vec![ColumnType::LongLong, ColumnType::VarString, ColumnType::Blob],
            ),
            gtid(6),
            write_rows(12, vec![vec![Some("77"), Some("ks"), Some("MigrationType: shards")]]),
            BinlogEvent::Xid,
        ];
        let all = flatten(
            run_session(Filter::pass_all().unwrap(), historian, events)
                .await
                .unwrap(),
        );
        assert!(all.iter().any(|e| matches!(
            e,
            VEvent::Journal {
                id: 77,
                migration_type: MigrationType::Shards
            }
        )));
    }

    /// schema_version writes surface as VERSION events.
    #[tokio::test]
    async fn test_version_events() {
        let historian = historian_with(vec![]).await;
        let events = vec![
            table_map(
                13,
                "_tabletd",
                "schema_version",
                vec![ColumnType::LongLong, ColumnType::VarString],
            ),
            gtid(6),
            write_rows(13, vec![vec![Some("1"), Some("pos")]]),
            BinlogEvent::Xid,
        ];
        let all = flatten(
            run_session(Filter::pass_all().unwrap(), historian, events)
                .await
                .unwrap(),
        );
        assert!(all.iter().any(|e| matches!(e, VEvent::Version)));
    }

    /// Missing schema is fatal in strict mode and degrades to generic field
    /// names in best-effort mode.
    #[tokio::test]
    async fn test_schema_resolution_modes() {
        let historian = historian_with(vec![]).await; // knows no tables
        let events = vec![t1_map(), gtid(6), write_rows(8, vec![vec![Some("1"), Some("a")]])];

        let err = run_session(Filter::pass_all().unwrap(), historian.clone(), events.clone())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let mut streamer = VStreamer::new(
            VStreamConfig {
                best_effort_schema: true,
                default_vindex: "numeric".to_string(),
                ..VStreamConfig::default()
            },
            Filter::pass_all().unwrap(),
            historian,
        );
        let mut source = ScriptedSource {
            events: events.into(),
        };
        let mut batches = Vec::new();
        streamer
            .stream(
                &CancellationToken::new(),
                &mut source,
                pos("1-5"),
                &mut |batch| {
                    batches.push(batch);
                    Ok(Next::Continue)
                },
            )
            .await
            .unwrap();
        let all = flatten(batches);
        match all.iter().find(|e| matches!(e, VEvent::Field { .. })) {
            Some(VEvent::Field { fields, .. }) => {
                assert_eq!(fields[0].name, "@1");
                assert_eq!(fields[1].name, "@2");
            }
            other => panic!("expected best-effort field event, got {other:?}"),
        }
    }

    /// GTIDs observed by the callback never regress within a session.
    #[tokio::test]
    async fn test_gtid_monotonic() {
        let historian = historian_with(vec![t1_schema()]).await;
        let mut events = vec![t1_map()];
        for seq in 6..=10 {
            events.push(gtid(seq));
            events.push(BinlogEvent::Query {
                schema: "test".into(),
                sql: "BEGIN".into(),
            });
            events.push(write_rows(8, vec![vec![Some("1"), Some("x")]]));
            events.push(BinlogEvent::Xid);
        }
        let all = flatten(
            run_session(Filter::pass_all().unwrap(), historian, events)
                .await
                .unwrap(),
        );
        let mut last: Option<Position> = None;
        for event in all {
            if let VEvent::Gtid(p) = event {
                if let Some(prev) = &last {
                    assert!(prev.subset_of(&p).unwrap());
                }
                last = Some(p);
            }
        }
        assert!(last.is_some());
    }

    /// The consumer can end the session cleanly.
    #[tokio::test]
    async fn test_callback_done_closes_session() {
        let historian = historian_with(vec![t1_schema()]).await;
        let mut streamer = VStreamer::new(VStreamConfig::default(), Filter::pass_all().unwrap(), historian);
        let mut source = ScriptedSource {
            events: vec![
                gtid(6),
                BinlogEvent::Heartbeat,
                BinlogEvent::Heartbeat,
                BinlogEvent::Heartbeat,
            ]
            .into(),
        };
        let mut seen = 0;
        streamer
            .stream(
                &CancellationToken::new(),
                &mut source,
                pos("1-5"),
                &mut |_batch| {
                    seen += 1;
                    Ok(if seen == 1 { Next::Done } else { Next::Continue })
                },
            )
            .await
            .unwrap();
        assert_eq!(seen, 1);
    }

    /// An idle binlog produces heartbeat batches at the configured
    /// interval.
    #[tokio::test]
    async fn test_idle_heartbeats() {
        let historian = historian_with(vec![]).await;
        let mut streamer = VStreamer::new(
            VStreamConfig {
                heartbeat_interval: Duration::from_millis(5),
                ..VStreamConfig::default()
            },
            Filter::pass_all().unwrap(),
            historian,
        );

        struct SilentSource;
        #[async_trait]
        impl BinlogEventSource for SilentSource {
            async fn next_event(&mut self) -> Result<Option<BinlogEvent>> {
                std::future::pending().await
            }
        }

        let mut heartbeats = 0;
        streamer
            .stream(
                &CancellationToken::new(),
                &mut SilentSource,
                pos("1-5"),
                &mut |batch| {
                    assert_eq!(batch, vec![VEvent::Heartbeat]);
                    heartbeats += 1;
                    Ok(if heartbeats == 3 { Next::Done } else { Next::Continue })
                },
            )
            .await
            .unwrap();
        assert_eq!(heartbeats, 3);
    }

    /// Cancellation surfaces as a cancelled error.
    #[tokio::test]
    async fn test_cancellation() {
        let historian = historian_with(vec![]).await;
        let mut streamer = VStreamer::new(VStreamConfig::default(), Filter::pass_all().unwrap(), historian);

        struct PendingSource;
        #[async_trait]
        impl BinlogEventSource for PendingSource {
            async fn next_event(&mut self) -> Result<Option<BinlogEvent>> {
                std::future::pending().await
            }
        }

        let ctx = CancellationToken::new();
        ctx.cancel();
        let err = streamer
            .stream(&ctx, &mut PendingSource, pos("1-5"), &mut |_| {
                Ok(Next::Continue)
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
    }

    #[test]
    fn test_start_position_parse() {
        assert_eq!(StartPosition::parse("").unwrap(), StartPosition::Copy);
        assert_eq!(StartPosition::parse("current").unwrap(), StartPosition::Current);
        let spec = format!("MySQL56/{SID}:1-5");
        assert_eq!(
            StartPosition::parse(&spec).unwrap(),
            StartPosition::At(pos("1-5"))
        );
        assert!(StartPosition::parse("Oracle/x").is_err());
    }

    #[test]
    fn test_ddl_table_name() {
        assert_eq!(ddl_table_name("alter table t1 add column v int"), Some("t1".into()));
        assert_eq!(ddl_table_name("CREATE TABLE `db`.`t2` (id int)"), Some("t2".into()));
        assert_eq!(ddl_table_name("DROP TABLE t3;"), Some("t3".into()));
        assert_eq!(ddl_table_name("create view v1 as select 1"), Some("v1".into()));
        assert_eq!(ddl_table_name("flush logs"), None);
    }

    #[test]
    fn test_unknown_event_type_passthrough() {
        let historian_store = MemorySchemaVersionStore::new();
        let historian = Arc::new(SchemaHistorian::new(Arc::new(historian_store)));
        let mut streamer = VStreamer::new(VStreamConfig::default(), Filter::pass_all().unwrap(), historian);
        let mut out = Vec::new();
        streamer
            .process_event(BinlogEvent::Unknown(EventType::StopEvent), &mut out)
            .unwrap();
        assert!(out.is_empty());
    }
}
