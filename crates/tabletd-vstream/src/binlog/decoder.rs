//! Binlog payload decoding
//!
//! Turns raw binlog event bytes into typed events. The decoder keeps the
//! per-session table-map cache: every row event refers to the most recent
//! TABLE_MAP for its table id. Column values decode to their canonical byte
//! representation (numbers as ASCII decimal, strings and blobs as raw
//! bytes), which is the form rows travel in downstream.

use super::event::{
    count_set_bits, ensure_remaining, is_bit_set, read_bytes, read_packed_int, read_table_id,
    ColumnType, EventHeader, EventType,
};
use bytes::Buf;
use std::collections::HashMap;
use std::io::Cursor;
use tabletd_core::position::Interval;
use tabletd_core::{Gtid, GtidSet, Result, TabletError};
use tracing::trace;
use uuid::Uuid;

/// A TABLE_MAP event: the column layout row events decode against.
#[derive(Debug, Clone)]
pub struct TableMapEvent {
    pub table_id: u64,
    pub schema_name: String,
    pub table_name: String,
    pub column_types: Vec<ColumnType>,
    pub column_metadata: Vec<u16>,
}

impl TableMapEvent {
    pub fn column_count(&self) -> usize {
        self.column_types.len()
    }
}

/// One decoded row: images hold one entry per table column, `None` for
/// columns that are NULL or absent from the image.
#[derive(Debug, Clone, Default)]
pub struct DecodedRow {
    pub before: Option<Vec<Option<Vec<u8>>>>,
    pub after: Option<Vec<Option<Vec<u8>>>>,
}

/// A WRITE/UPDATE/DELETE_ROWS event.
#[derive(Debug, Clone)]
pub struct RowsEvent {
    pub table_id: u64,
    pub column_count: usize,
    /// Columns present in the before image (or the only image).
    pub present_before: Vec<u8>,
    /// Columns present in the after image of an UPDATE.
    pub present_after: Option<Vec<u8>>,
    pub rows: Vec<DecodedRow>,
}

impl RowsEvent {
    /// True when some column is missing from an image, i.e. the binlog row
    /// image is partial.
    pub fn is_partial(&self) -> bool {
        count_set_bits(&self.present_before) < self.column_count
            || self
                .present_after
                .as_ref()
                .map(|b| count_set_bits(b) < self.column_count)
                .unwrap_or(false)
    }
}

/// Classification of a QUERY event's SQL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    Begin,
    Commit,
    Ddl,
    Insert,
    Update,
    Delete,
    Other,
}

impl QueryKind {
    pub fn of(sql: &str) -> Self {
        let trimmed = sql.trim_start();
        let upper: String = trimmed
            .chars()
            .take(16)
            .collect::<String>()
            .to_uppercase();
        if upper.starts_with("BEGIN") {
            QueryKind::Begin
        } else if upper.starts_with("COMMIT") {
            QueryKind::Commit
        } else if upper.starts_with("CREATE")
            || upper.starts_with("ALTER")
            || upper.starts_with("DROP")
            || upper.starts_with("TRUNCATE")
            || upper.starts_with("RENAME")
        {
            QueryKind::Ddl
        } else if upper.starts_with("INSERT") || upper.starts_with("REPLACE") {
            QueryKind::Insert
        } else if upper.starts_with("UPDATE") {
            QueryKind::Update
        } else if upper.starts_with("DELETE") {
            QueryKind::Delete
        } else {
            QueryKind::Other
        }
    }
}

/// A decoded binlog event.
#[derive(Debug, Clone)]
pub enum BinlogEvent {
    FormatDescription { server_version: String },
    Rotate { position: u64, next_file: String },
    Gtid(Gtid),
    PreviousGtids(GtidSet),
    TableMap(TableMapEvent),
    WriteRows(RowsEvent),
    UpdateRows(RowsEvent),
    DeleteRows(RowsEvent),
    /// Transaction commit.
    Xid,
    Query { schema: String, sql: String },
    Heartbeat,
    Stop,
    Unknown(EventType),
}

/// Streaming binlog decoder with the per-session table-map cache.
pub struct BinlogDecoder {
    table_map: HashMap<u64, TableMapEvent>,
    /// Whether events carry a trailing CRC32, learned from the
    /// FORMAT_DESCRIPTION event.
    checksummed: bool,
}

impl Default for BinlogDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl BinlogDecoder {
    pub fn new() -> Self {
        Self {
            table_map: HashMap::new(),
            checksummed: false,
        }
    }

    pub fn table(&self, table_id: u64) -> Option<&TableMapEvent> {
        self.table_map.get(&table_id)
    }

    /// Decode one framed event (header plus payload).
    pub fn decode(&mut self, data: &[u8]) -> Result<BinlogEvent> {
        let header = EventHeader::parse(data)?;
        let mut payload = &data[EventHeader::SIZE..];

        if header.event_type == EventType::FormatDescriptionEvent {
            // The algorithm byte sits before the (optional) trailing CRC32.
            self.checksummed = payload.len() >= 5 && payload[payload.len() - 5] == 1;
        }
        if self.checksummed && payload.len() >= 4 {
            payload = &payload[..payload.len() - 4];
        }

        trace!(event_type = ?header.event_type, payload_len = payload.len(), "decoding binlog event");

        match header.event_type {
            EventType::FormatDescriptionEvent => self.decode_format_description(payload),
            EventType::RotateEvent => self.decode_rotate(payload),
            EventType::GtidLogEvent => self.decode_gtid(payload),
            EventType::AnonymousGtidLogEvent => Ok(BinlogEvent::Unknown(header.event_type)),
            EventType::PreviousGtidsLogEvent => self.decode_previous_gtids(payload),
            EventType::TableMapEvent => {
                let event = self.decode_table_map(payload)?;
                self.table_map.insert(event.table_id, event.clone());
                Ok(BinlogEvent::TableMap(event))
            }
            t if t.is_row_event() => {
                let event = self.decode_rows(payload, t)?;
                if t.is_update() {
                    Ok(BinlogEvent::UpdateRows(event))
                } else if t.is_delete() {
                    Ok(BinlogEvent::DeleteRows(event))
                } else {
                    Ok(BinlogEvent::WriteRows(event))
                }
            }
            EventType::XidEvent => Ok(BinlogEvent::Xid),
            EventType::QueryEvent => self.decode_query(payload),
            EventType::HeartbeatLogEvent => Ok(BinlogEvent::Heartbeat),
            EventType::StopEvent => Ok(BinlogEvent::Stop),
            other => Ok(BinlogEvent::Unknown(other)),
        }
    }

    fn decode_format_description(&self, data: &[u8]) -> Result<BinlogEvent> {
        let mut cursor = Cursor::new(data);
        ensure_remaining(&cursor, 2 + 50)?;
        let _binlog_version = cursor.get_u16_le();
        let version_bytes = read_bytes(&mut cursor, 50)?;
        let server_version = String::from_utf8_lossy(&version_bytes)
            .trim_end_matches('\0')
            .to_string();
        Ok(BinlogEvent::FormatDescription { server_version })
    }

    fn decode_rotate(&self, data: &[u8]) -> Result<BinlogEvent> {
        let mut cursor = Cursor::new(data);
        ensure_remaining(&cursor, 8)?;
        let position = cursor.get_u64_le();
        let remaining = cursor.remaining();
        let name_bytes = read_bytes(&mut cursor, remaining)?;
        Ok(BinlogEvent::Rotate {
            position,
            next_file: String::from_utf8_lossy(&name_bytes)
                .trim_end_matches('\0')
                .to_string(),
        })
    }

    fn decode_gtid(&self, data: &[u8]) -> Result<BinlogEvent> {
        let mut cursor = Cursor::new(data);
        ensure_remaining(&cursor, 1 + 16 + 8)?;
        let _flags = cursor.get_u8();
        let uuid_bytes = read_bytes(&mut cursor, 16)?;
        let server = Uuid::from_slice(&uuid_bytes)
            .map_err(|e| TabletError::internal(format!("bad GTID server uuid: {e}")))?;
        let sequence = cursor.get_u64_le();
        Ok(BinlogEvent::Gtid(Gtid { server, sequence }))
    }

    fn decode_previous_gtids(&self, data: &[u8]) -> Result<BinlogEvent> {
        let mut cursor = Cursor::new(data);
        ensure_remaining(&cursor, 8)?;
        let n_sids = cursor.get_u64_le();
        let mut set = GtidSet::new();
        for _ in 0..n_sids {
            let uuid_bytes = read_bytes(&mut cursor, 16)?;
            let server = Uuid::from_slice(&uuid_bytes)
                .map_err(|e| TabletError::internal(format!("bad previous-GTIDs uuid: {e}")))?;
            ensure_remaining(&cursor, 8)?;
            let n_intervals = cursor.get_u64_le();
            for _ in 0..n_intervals {
                ensure_remaining(&cursor, 16)?;
                let start = cursor.get_u64_le();
                let stop = cursor.get_u64_le(); // exclusive on the wire
                if stop > start {
                    set.add_interval(server, Interval::new(start, stop - 1));
                }
            }
        }
        Ok(BinlogEvent::PreviousGtids(set))
    }

    fn decode_table_map(&self, data: &[u8]) -> Result<TableMapEvent> {
        let mut cursor = Cursor::new(data);
        let table_id = read_table_id(&mut cursor)?;
        ensure_remaining(&cursor, 2)?;
        let _flags = cursor.get_u16_le();

        ensure_remaining(&cursor, 1)?;
        let schema_len = cursor.get_u8() as usize;
        let schema_bytes = read_bytes(&mut cursor, schema_len)?;
        ensure_remaining(&cursor, 1)?;
        cursor.get_u8(); // null terminator

        ensure_remaining(&cursor, 1)?;
        let table_len = cursor.get_u8() as usize;
        let table_bytes = read_bytes(&mut cursor, table_len)?;
        ensure_remaining(&cursor, 1)?;
        cursor.get_u8(); // null terminator

        let column_count = read_packed_int(&mut cursor)? as usize;
        let mut column_types = Vec::with_capacity(column_count);
        for _ in 0..column_count {
            ensure_remaining(&cursor, 1)?;
            column_types.push(ColumnType::from_u8(cursor.get_u8()));
        }

        let _metadata_len = read_packed_int(&mut cursor)?;
        let column_metadata = decode_column_metadata(&column_types, &mut cursor)?;

        // Nullability bitmap; rows carry their own null bitmaps.
        let _ = read_bytes(&mut cursor, column_count.div_ceil(8))?;

        Ok(TableMapEvent {
            table_id,
            schema_name: String::from_utf8_lossy(&schema_bytes).into_owned(),
            table_name: String::from_utf8_lossy(&table_bytes).into_owned(),
            column_types,
            column_metadata,
        })
    }

    fn decode_rows(&self, data: &[u8], event_type: EventType) -> Result<RowsEvent> {
        let mut cursor = Cursor::new(data);
        let table_id = read_table_id(&mut cursor)?;
        ensure_remaining(&cursor, 2)?;
        let _flags = cursor.get_u16_le();

        if event_type.is_v2() {
            ensure_remaining(&cursor, 2)?;
            let extra_len = cursor.get_u16_le() as usize;
            if extra_len > 2 {
                let _ = read_bytes(&mut cursor, extra_len - 2)?;
            }
        }

        let column_count = read_packed_int(&mut cursor)? as usize;
        let bitmap_len = column_count.div_ceil(8);
        let present_before = read_bytes(&mut cursor, bitmap_len)?;
        let present_after = if event_type.is_update() {
            Some(read_bytes(&mut cursor, bitmap_len)?)
        } else {
            None
        };

        let table_map = self.table_map.get(&table_id).ok_or_else(|| {
            TabletError::internal(format!("rows event for unmapped table id {table_id}"))
        })?;

        let mut rows = Vec::new();
        while cursor.has_remaining() {
            let mut row = DecodedRow::default();
            if event_type.is_update() || event_type.is_delete() {
                row.before = Some(decode_row_values(
                    &mut cursor,
                    table_map,
                    column_count,
                    &present_before,
                )?);
                if event_type.is_update() {
                    let bitmap = present_after.as_deref().unwrap_or(&present_before);
                    row.after =
                        Some(decode_row_values(&mut cursor, table_map, column_count, bitmap)?);
                }
            } else {
                row.after = Some(decode_row_values(
                    &mut cursor,
                    table_map,
                    column_count,
                    &present_before,
                )?);
            }
            rows.push(row);
        }

        Ok(RowsEvent {
            table_id,
            column_count,
            present_before,
            present_after,
            rows,
        })
    }

    fn decode_query(&self, data: &[u8]) -> Result<BinlogEvent> {
        let mut cursor = Cursor::new(data);
        ensure_remaining(&cursor, 4 + 4 + 1 + 2 + 2)?;
        let _thread_id = cursor.get_u32_le();
        let _exec_time = cursor.get_u32_le();
        let schema_len = cursor.get_u8() as usize;
        let _error_code = cursor.get_u16_le();
        let status_vars_len = cursor.get_u16_le() as usize;
        let _ = read_bytes(&mut cursor, status_vars_len)?;
        let schema_bytes = read_bytes(&mut cursor, schema_len)?;
        ensure_remaining(&cursor, 1)?;
        cursor.get_u8(); // null terminator
        let remaining = cursor.remaining();
        let sql_bytes = read_bytes(&mut cursor, remaining)?;
        Ok(BinlogEvent::Query {
            schema: String::from_utf8_lossy(&schema_bytes).into_owned(),
            sql: String::from_utf8_lossy(&sql_bytes).into_owned(),
        })
    }
}

fn decode_column_metadata(
    column_types: &[ColumnType],
    cursor: &mut Cursor<&[u8]>,
) -> Result<Vec<u16>> {
    let mut metadata = Vec::with_capacity(column_types.len());
    for column_type in column_types {
        let meta = match column_type {
            ColumnType::Float
            | ColumnType::Double
            | ColumnType::Blob
            | ColumnType::TinyBlob
            | ColumnType::MediumBlob
            | ColumnType::LongBlob
            | ColumnType::Json
            | ColumnType::Geometry
            | ColumnType::Time2
            | ColumnType::DateTime2
            | ColumnType::Timestamp2 => {
                ensure_remaining(cursor, 1)?;
                cursor.get_u8() as u16
            }
            ColumnType::Bit
            | ColumnType::Varchar
            | ColumnType::VarString
            | ColumnType::String
            | ColumnType::Enum
            | ColumnType::Set => {
                ensure_remaining(cursor, 2)?;
                cursor.get_u16_le()
            }
            ColumnType::NewDecimal => {
                ensure_remaining(cursor, 2)?;
                let precision = cursor.get_u8();
                let scale = cursor.get_u8();
                ((precision as u16) << 8) | (scale as u16)
            }
            _ => 0,
        };
        metadata.push(meta);
    }
    Ok(metadata)
}

fn decode_row_values(
    cursor: &mut Cursor<&[u8]>,
    table_map: &TableMapEvent,
    column_count: usize,
    present: &[u8],
) -> Result<Vec<Option<Vec<u8>>>> {
    let present_count = count_set_bits(present);
    let null_bitmap = read_bytes(cursor, present_count.div_ceil(8))?;

    let mut values: Vec<Option<Vec<u8>>> = Vec::with_capacity(column_count);
    let mut image_idx = 0usize;
    for col_idx in 0..column_count {
        if !is_bit_set(present, col_idx) {
            values.push(None);
            continue;
        }
        if is_bit_set(&null_bitmap, image_idx) {
            values.push(None);
            image_idx += 1;
            continue;
        }
        let column_type = table_map
            .column_types
            .get(col_idx)
            .copied()
            .unwrap_or(ColumnType::VarString);
        let metadata = table_map
            .column_metadata
            .get(col_idx)
            .copied()
            .unwrap_or(0);
        values.push(Some(decode_column_value(cursor, column_type, metadata)?));
        image_idx += 1;
    }
    Ok(values)
}

/// Decode one column value into its canonical byte representation.
fn decode_column_value(
    cursor: &mut Cursor<&[u8]>,
    column_type: ColumnType,
    metadata: u16,
) -> Result<Vec<u8>> {
    let value = match column_type {
        ColumnType::Tiny => {
            ensure_remaining(cursor, 1)?;
            (cursor.get_i8() as i64).to_string().into_bytes()
        }
        ColumnType::Short => {
            ensure_remaining(cursor, 2)?;
            (cursor.get_i16_le() as i64).to_string().into_bytes()
        }
        ColumnType::Int24 => {
            ensure_remaining(cursor, 3)?;
            let mut v = 0u32;
            for i in 0..3 {
                v |= (cursor.get_u8() as u32) << (8 * i);
            }
            let signed = if v & 0x80_0000 != 0 {
                (v | 0xFF00_0000) as i32
            } else {
                v as i32
            };
            (signed as i64).to_string().into_bytes()
        }
        ColumnType::Long => {
            ensure_remaining(cursor, 4)?;
            (cursor.get_i32_le() as i64).to_string().into_bytes()
        }
        ColumnType::LongLong => {
            ensure_remaining(cursor, 8)?;
            cursor.get_i64_le().to_string().into_bytes()
        }
        ColumnType::Float => {
            ensure_remaining(cursor, 4)?;
            format!("{}", cursor.get_f32_le()).into_bytes()
        }
        ColumnType::Double => {
            ensure_remaining(cursor, 8)?;
            format!("{}", cursor.get_f64_le()).into_bytes()
        }
        ColumnType::Year => {
            ensure_remaining(cursor, 1)?;
            (cursor.get_u8() as u16 + 1900).to_string().into_bytes()
        }
        ColumnType::Timestamp => {
            ensure_remaining(cursor, 4)?;
            cursor.get_u32_le().to_string().into_bytes()
        }
        ColumnType::Date => {
            ensure_remaining(cursor, 3)?;
            let mut packed = 0u32;
            for i in 0..3 {
                packed |= (cursor.get_u8() as u32) << (8 * i);
            }
            let day = packed & 0x1F;
            let month = (packed >> 5) & 0x0F;
            let year = (packed >> 9) & 0x7FFF;
            format!("{year:04}-{month:02}-{day:02}").into_bytes()
        }
        ColumnType::DateTime => {
            ensure_remaining(cursor, 8)?;
            let packed = cursor.get_u64_le();
            let second = packed % 100;
            let minute = (packed / 100) % 100;
            let hour = (packed / 10_000) % 100;
            let day = (packed / 1_000_000) % 100;
            let month = (packed / 100_000_000) % 100;
            let year = packed / 10_000_000_000;
            format!("{year:04}-{month:02}-{day:02} {hour:02}:{minute:02}:{second:02}")
                .into_bytes()
        }
        ColumnType::DateTime2 => {
            let mut packed = 0u64;
            ensure_remaining(cursor, 5)?;
            for _ in 0..5 {
                packed = (packed << 8) | cursor.get_u8() as u64;
            }
            let _ = read_fractional(cursor, metadata as u8)?;
            let year_month = (packed >> 22) & 0x1FFFF;
            let year = year_month / 13;
            let month = year_month % 13;
            let day = (packed >> 17) & 0x1F;
            let hour = (packed >> 12) & 0x1F;
            let minute = (packed >> 6) & 0x3F;
            let second = packed & 0x3F;
            format!("{year:04}-{month:02}-{day:02} {hour:02}:{minute:02}:{second:02}")
                .into_bytes()
        }
        ColumnType::Timestamp2 => {
            ensure_remaining(cursor, 4)?;
            let seconds = cursor.get_u32();
            let _ = read_fractional(cursor, metadata as u8)?;
            seconds.to_string().into_bytes()
        }
        ColumnType::Time2 => {
            ensure_remaining(cursor, 3)?;
            let mut packed = 0u32;
            for _ in 0..3 {
                packed = (packed << 8) | cursor.get_u8() as u32;
            }
            let _ = read_fractional(cursor, metadata as u8)?;
            let negative = packed & 0x80_0000 == 0;
            let magnitude = if negative {
                0x80_0000 - (packed & 0x7F_FFFF)
            } else {
                packed & 0x7F_FFFF
            };
            let hours = (magnitude >> 12) & 0x3FF;
            let minutes = (magnitude >> 6) & 0x3F;
            let seconds = magnitude & 0x3F;
            let sign = if negative { "-" } else { "" };
            format!("{sign}{hours:02}:{minutes:02}:{seconds:02}").into_bytes()
        }
        ColumnType::Varchar | ColumnType::VarString => {
            let len = if metadata < 256 {
                ensure_remaining(cursor, 1)?;
                cursor.get_u8() as usize
            } else {
                ensure_remaining(cursor, 2)?;
                cursor.get_u16_le() as usize
            };
            read_bytes(cursor, len)?
        }
        ColumnType::String => {
            // Metadata smuggles the real type for ENUM/SET stored as STRING.
            let real_type = (metadata >> 8) as u8;
            let max_len = metadata & 0xFF;
            if real_type == ColumnType::Enum as u8 {
                let v = if max_len == 1 {
                    ensure_remaining(cursor, 1)?;
                    cursor.get_u8() as u16
                } else {
                    ensure_remaining(cursor, 2)?;
                    cursor.get_u16_le()
                };
                v.to_string().into_bytes()
            } else if real_type == ColumnType::Set as u8 {
                let bytes = (max_len as usize).div_ceil(8);
                let mut v = 0u64;
                for i in 0..bytes {
                    ensure_remaining(cursor, 1)?;
                    v |= (cursor.get_u8() as u64) << (8 * i);
                }
                v.to_string().into_bytes()
            } else {
                let len = if max_len < 256 {
                    ensure_remaining(cursor, 1)?;
                    cursor.get_u8() as usize
                } else {
                    ensure_remaining(cursor, 2)?;
                    cursor.get_u16_le() as usize
                };
                read_bytes(cursor, len)?
            }
        }
        ColumnType::Blob
        | ColumnType::TinyBlob
        | ColumnType::MediumBlob
        | ColumnType::LongBlob
        | ColumnType::Json
        | ColumnType::Geometry => {
            let len_bytes = (metadata as usize).clamp(1, 4);
            let mut len = 0usize;
            for i in 0..len_bytes {
                ensure_remaining(cursor, 1)?;
                len |= (cursor.get_u8() as usize) << (8 * i);
            }
            read_bytes(cursor, len)?
        }
        ColumnType::NewDecimal => {
            let precision = (metadata >> 8) as usize;
            let scale = (metadata & 0xFF) as usize;
            decode_decimal(cursor, precision, scale)?
        }
        ColumnType::Enum => {
            let v = if metadata == 1 {
                ensure_remaining(cursor, 1)?;
                cursor.get_u8() as u16
            } else {
                ensure_remaining(cursor, 2)?;
                cursor.get_u16_le()
            };
            v.to_string().into_bytes()
        }
        ColumnType::Set => {
            let bytes = metadata as usize;
            let mut v = 0u64;
            for i in 0..bytes {
                ensure_remaining(cursor, 1)?;
                v |= (cursor.get_u8() as u64) << (8 * i);
            }
            v.to_string().into_bytes()
        }
        ColumnType::Bit => {
            let nbits = ((metadata >> 8) * 8 + (metadata & 0xFF)) as usize;
            read_bytes(cursor, nbits.div_ceil(8))?
        }
        ColumnType::Time => {
            ensure_remaining(cursor, 3)?;
            let mut packed = 0u32;
            for i in 0..3 {
                packed |= (cursor.get_u8() as u32) << (8 * i);
            }
            let seconds = packed % 100;
            let minutes = (packed / 100) % 100;
            let hours = packed / 10_000;
            format!("{hours:02}:{minutes:02}:{seconds:02}").into_bytes()
        }
        _ => {
            return Err(TabletError::unsupported(format!(
                "cannot decode column type {column_type:?}"
            )))
        }
    };
    Ok(value)
}

fn read_fractional(cursor: &mut Cursor<&[u8]>, fsp: u8) -> Result<u32> {
    let bytes = (fsp as usize).div_ceil(2);
    let mut v = 0u32;
    for _ in 0..bytes {
        ensure_remaining(cursor, 1)?;
        v = (v << 8) | cursor.get_u8() as u32;
    }
    Ok(v)
}

/// MySQL packed DECIMAL to its ASCII form.
fn decode_decimal(cursor: &mut Cursor<&[u8]>, precision: usize, scale: usize) -> Result<Vec<u8>> {
    const DIGITS_PER_WORD: usize = 9;
    fn leftover_bytes(digits: usize) -> usize {
        match digits {
            0 => 0,
            1..=2 => 1,
            3..=4 => 2,
            5..=6 => 3,
            _ => 4,
        }
    }

    let int_digits = precision.saturating_sub(scale);
    let int_words = int_digits / DIGITS_PER_WORD;
    let int_leftover = int_digits % DIGITS_PER_WORD;
    let frac_words = scale / DIGITS_PER_WORD;
    let frac_leftover = scale % DIGITS_PER_WORD;

    let total = leftover_bytes(int_leftover) + int_words * 4 + frac_words * 4
        + leftover_bytes(frac_leftover);
    let mut bytes = read_bytes(cursor, total)?;

    let negative = bytes[0] & 0x80 == 0;
    bytes[0] ^= 0x80;
    if negative {
        for b in bytes.iter_mut() {
            *b = !*b;
        }
    }

    let mut inner = Cursor::new(&bytes[..]);
    let read_be = |cursor: &mut Cursor<&[u8]>, n: usize| -> Result<u32> {
        let mut v = 0u32;
        for _ in 0..n {
            ensure_remaining(cursor, 1)?;
            v = (v << 8) | cursor.get_u8() as u32;
        }
        Ok(v)
    };

    let mut int_part = String::new();
    if leftover_bytes(int_leftover) > 0 {
        let v = read_be(&mut inner, leftover_bytes(int_leftover))?;
        if v > 0 {
            int_part.push_str(&v.to_string());
        }
    }
    for _ in 0..int_words {
        let v = read_be(&mut inner, 4)?;
        if int_part.is_empty() {
            if v > 0 {
                int_part.push_str(&v.to_string());
            }
        } else {
            int_part.push_str(&format!("{v:09}"));
        }
    }
    if int_part.is_empty() {
        int_part.push('0');
    }

    let mut out = String::new();
    if negative {
        out.push('-');
    }
    out.push_str(&int_part);
    if scale > 0 {
        out.push('.');
        for _ in 0..frac_words {
            let v = read_be(&mut inner, 4)?;
            out.push_str(&format!("{v:09}"));
        }
        if leftover_bytes(frac_leftover) > 0 {
            let v = read_be(&mut inner, leftover_bytes(frac_leftover))?;
            out.push_str(&format!("{v:0width$}", width = frac_leftover));
        }
    }
    Ok(out.into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(event_type: EventType, payload: &[u8]) -> Vec<u8> {
        let mut data = vec![0u8; EventHeader::SIZE];
        data[4] = event_type as u8;
        let len = (EventHeader::SIZE + payload.len()) as u32;
        data[9..13].copy_from_slice(&len.to_le_bytes());
        data.extend_from_slice(payload);
        data
    }

    fn table_map_payload() -> Vec<u8> {
        // test.t1 (id int, v varchar(128))
        let mut p = Vec::new();
        p.extend_from_slice(&[8, 0, 0, 0, 0, 0]); // table id 8
        p.extend_from_slice(&[1, 0]); // flags
        p.push(4);
        p.extend_from_slice(b"test");
        p.push(0);
        p.push(2);
        p.extend_from_slice(b"t1");
        p.push(0);
        p.push(2); // column count
        p.push(ColumnType::Long as u8);
        p.push(ColumnType::Varchar as u8);
        p.push(2); // metadata length
        p.extend_from_slice(&128u16.to_le_bytes()); // varchar max length
        p.push(0x02); // null bitmap: v nullable
        p
    }

    fn decoder_with_table() -> BinlogDecoder {
        let mut decoder = BinlogDecoder::new();
        let event = decoder
            .decode(&frame(EventType::TableMapEvent, &table_map_payload()))
            .unwrap();
        match event {
            BinlogEvent::TableMap(map) => {
                assert_eq!(map.table_id, 8);
                assert_eq!(map.schema_name, "test");
                assert_eq!(map.table_name, "t1");
                assert_eq!(map.column_types, vec![ColumnType::Long, ColumnType::Varchar]);
            }
            other => panic!("expected table map, got {other:?}"),
        }
        decoder
    }

    #[test]
    fn test_decode_table_map() {
        let decoder = decoder_with_table();
        assert!(decoder.table(8).is_some());
        assert!(decoder.table(9).is_none());
    }

    #[test]
    fn test_decode_write_rows() {
        let mut decoder = decoder_with_table();
        let mut p = Vec::new();
        p.extend_from_slice(&[8, 0, 0, 0, 0, 0]); // table id
        p.extend_from_slice(&[0, 0]); // flags
        p.extend_from_slice(&2u16.to_le_bytes()); // v2 extra length (none)
        p.push(2); // column count
        p.push(0x03); // both columns present
        p.push(0x00); // null bitmap: none null
        p.extend_from_slice(&1i32.to_le_bytes()); // id = 1
        p.push(3); // varchar length
        p.extend_from_slice(b"aaa");

        let event = decoder
            .decode(&frame(EventType::WriteRowsEventV2, &p))
            .unwrap();
        match event {
            BinlogEvent::WriteRows(rows) => {
                assert_eq!(rows.table_id, 8);
                assert_eq!(rows.rows.len(), 1);
                assert!(!rows.is_partial());
                let after = rows.rows[0].after.as_ref().unwrap();
                assert_eq!(after[0], Some(b"1".to_vec()));
                assert_eq!(after[1], Some(b"aaa".to_vec()));
                assert!(rows.rows[0].before.is_none());
            }
            other => panic!("expected write rows, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_update_rows_with_null() {
        let mut decoder = decoder_with_table();
        let mut p = Vec::new();
        p.extend_from_slice(&[8, 0, 0, 0, 0, 0]);
        p.extend_from_slice(&[0, 0]);
        p.extend_from_slice(&2u16.to_le_bytes());
        p.push(2);
        p.push(0x03); // before present
        p.push(0x03); // after present
        // before: (1, "aaa")
        p.push(0x00);
        p.extend_from_slice(&1i32.to_le_bytes());
        p.push(3);
        p.extend_from_slice(b"aaa");
        // after: (1, NULL)
        p.push(0x02); // second image column null
        p.extend_from_slice(&1i32.to_le_bytes());

        let event = decoder
            .decode(&frame(EventType::UpdateRowsEventV2, &p))
            .unwrap();
        match event {
            BinlogEvent::UpdateRows(rows) => {
                let row = &rows.rows[0];
                assert_eq!(row.before.as_ref().unwrap()[1], Some(b"aaa".to_vec()));
                assert_eq!(row.after.as_ref().unwrap()[0], Some(b"1".to_vec()));
                assert_eq!(row.after.as_ref().unwrap()[1], None);
            }
            other => panic!("expected update rows, got {other:?}"),
        }
    }

    #[test]
    fn test_rows_event_without_table_map_fails() {
        let mut decoder = BinlogDecoder::new();
        let mut p = Vec::new();
        p.extend_from_slice(&[9, 0, 0, 0, 0, 0]);
        p.extend_from_slice(&[0, 0]);
        p.extend_from_slice(&2u16.to_le_bytes());
        p.push(1);
        p.push(0x01);
        let err = decoder
            .decode(&frame(EventType::WriteRowsEventV2, &p))
            .unwrap_err();
        assert!(err.to_string().contains("unmapped table id"));
    }

    #[test]
    fn test_decode_gtid() {
        let mut decoder = BinlogDecoder::new();
        let uuid = Uuid::parse_str("3e11fa47-71ca-11e1-9e33-c80aa9429562").unwrap();
        let mut p = vec![1u8];
        p.extend_from_slice(uuid.as_bytes());
        p.extend_from_slice(&42u64.to_le_bytes());
        match decoder.decode(&frame(EventType::GtidLogEvent, &p)).unwrap() {
            BinlogEvent::Gtid(gtid) => {
                assert_eq!(gtid.server, uuid);
                assert_eq!(gtid.sequence, 42);
            }
            other => panic!("expected gtid, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_previous_gtids() {
        let mut decoder = BinlogDecoder::new();
        let uuid = Uuid::parse_str("3e11fa47-71ca-11e1-9e33-c80aa9429562").unwrap();
        let mut p = Vec::new();
        p.extend_from_slice(&1u64.to_le_bytes()); // one sid
        p.extend_from_slice(uuid.as_bytes());
        p.extend_from_slice(&1u64.to_le_bytes()); // one interval
        p.extend_from_slice(&1u64.to_le_bytes()); // start 1
        p.extend_from_slice(&31u64.to_le_bytes()); // stop 31 (exclusive)
        match decoder
            .decode(&frame(EventType::PreviousGtidsLogEvent, &p))
            .unwrap()
        {
            BinlogEvent::PreviousGtids(set) => {
                assert_eq!(set.to_string(), format!("{uuid}:1-30"));
            }
            other => panic!("expected previous gtids, got {other:?}"),
        }
    }

    #[test]
    fn test_query_kind() {
        assert_eq!(QueryKind::of("BEGIN"), QueryKind::Begin);
        assert_eq!(QueryKind::of("begin"), QueryKind::Begin);
        assert_eq!(QueryKind::of("COMMIT /* trailing */"), QueryKind::Commit);
        assert_eq!(QueryKind::of("create table t(id int)"), QueryKind::Ddl);
        assert_eq!(QueryKind::of("ALTER TABLE t ADD COLUMN v int"), QueryKind::Ddl);
        assert_eq!(QueryKind::of("  DROP TABLE t"), QueryKind::Ddl);
        assert_eq!(QueryKind::of("insert into t values(1)"), QueryKind::Insert);
        assert_eq!(QueryKind::of("UPDATE t SET v=1"), QueryKind::Update);
        assert_eq!(QueryKind::of("delete from t"), QueryKind::Delete);
        assert_eq!(QueryKind::of("FLUSH LOGS"), QueryKind::Other);
    }

    #[test]
    fn test_decode_query_event() {
        let mut decoder = BinlogDecoder::new();
        let mut p = Vec::new();
        p.extend_from_slice(&1u32.to_le_bytes()); // thread id
        p.extend_from_slice(&0u32.to_le_bytes()); // exec time
        p.push(4); // schema length
        p.extend_from_slice(&0u16.to_le_bytes()); // error code
        p.extend_from_slice(&0u16.to_le_bytes()); // status vars length
        p.extend_from_slice(b"test");
        p.push(0);
        p.extend_from_slice(b"create table t1(id int)");
        match decoder.decode(&frame(EventType::QueryEvent, &p)).unwrap() {
            BinlogEvent::Query { schema, sql } => {
                assert_eq!(schema, "test");
                assert_eq!(sql, "create table t1(id int)");
            }
            other => panic!("expected query, got {other:?}"),
        }
    }

    #[test]
    fn test_decimal_decode() {
        // DECIMAL(5,2) value 123.45: int part 123 in 2 bytes, frac 45 in 1
        // byte, sign bit set on the first byte.
        let mut bytes = vec![0x80 | 0x00, 0x7B, 0x2D];
        let mut cursor = Cursor::new(&bytes[..]);
        let v = decode_decimal(&mut cursor, 5, 2).unwrap();
        assert_eq!(String::from_utf8(v).unwrap(), "123.45");

        // Negative: all bytes complemented.
        for b in bytes.iter_mut() {
            *b = !*b;
        }
        let mut cursor = Cursor::new(&bytes[..]);
        let v = decode_decimal(&mut cursor, 5, 2).unwrap();
        assert_eq!(String::from_utf8(v).unwrap(), "-123.45");
    }
}
