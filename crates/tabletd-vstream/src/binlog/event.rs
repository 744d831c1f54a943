//! Binlog event framing
//!
//! Event type and column type tables, the common 19-byte event header, and
//! the little primitive readers (packed integers, 6-byte table ids) shared by
//! the payload decoders.

use bytes::Buf;
use std::io::{Cursor, Read};
use tabletd_core::{Result, TabletError};

/// Binlog event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EventType {
    Unknown = 0,
    QueryEvent = 2,
    StopEvent = 3,
    RotateEvent = 4,
    FormatDescriptionEvent = 15,
    XidEvent = 16,
    TableMapEvent = 19,
    WriteRowsEventV1 = 23,
    UpdateRowsEventV1 = 24,
    DeleteRowsEventV1 = 25,
    HeartbeatLogEvent = 27,
    WriteRowsEventV2 = 30,
    UpdateRowsEventV2 = 31,
    DeleteRowsEventV2 = 32,
    GtidLogEvent = 33,
    AnonymousGtidLogEvent = 34,
    PreviousGtidsLogEvent = 35,
}

impl EventType {
    pub fn from_u8(value: u8) -> Self {
        match value {
            2 => EventType::QueryEvent,
            3 => EventType::StopEvent,
            4 => EventType::RotateEvent,
            15 => EventType::FormatDescriptionEvent,
            16 => EventType::XidEvent,
            19 => EventType::TableMapEvent,
            23 => EventType::WriteRowsEventV1,
            24 => EventType::UpdateRowsEventV1,
            25 => EventType::DeleteRowsEventV1,
            27 => EventType::HeartbeatLogEvent,
            30 => EventType::WriteRowsEventV2,
            31 => EventType::UpdateRowsEventV2,
            32 => EventType::DeleteRowsEventV2,
            33 => EventType::GtidLogEvent,
            34 => EventType::AnonymousGtidLogEvent,
            35 => EventType::PreviousGtidsLogEvent,
            _ => EventType::Unknown,
        }
    }

    pub fn is_row_event(&self) -> bool {
        matches!(
            self,
            EventType::WriteRowsEventV1
                | EventType::WriteRowsEventV2
                | EventType::UpdateRowsEventV1
                | EventType::UpdateRowsEventV2
                | EventType::DeleteRowsEventV1
                | EventType::DeleteRowsEventV2
        )
    }

    pub fn is_update(&self) -> bool {
        matches!(
            self,
            EventType::UpdateRowsEventV1 | EventType::UpdateRowsEventV2
        )
    }

    pub fn is_delete(&self) -> bool {
        matches!(
            self,
            EventType::DeleteRowsEventV1 | EventType::DeleteRowsEventV2
        )
    }

    pub fn is_v2(&self) -> bool {
        matches!(
            self,
            EventType::WriteRowsEventV2
                | EventType::UpdateRowsEventV2
                | EventType::DeleteRowsEventV2
        )
    }
}

/// MySQL column types as they appear in TABLE_MAP events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ColumnType {
    Decimal = 0,
    Tiny = 1,
    Short = 2,
    Long = 3,
    Float = 4,
    Double = 5,
    Null = 6,
    Timestamp = 7,
    LongLong = 8,
    Int24 = 9,
    Date = 10,
    Time = 11,
    DateTime = 12,
    Year = 13,
    Varchar = 15,
    Bit = 16,
    Timestamp2 = 17,
    DateTime2 = 18,
    Time2 = 19,
    Json = 245,
    NewDecimal = 246,
    Enum = 247,
    Set = 248,
    TinyBlob = 249,
    MediumBlob = 250,
    LongBlob = 251,
    Blob = 252,
    VarString = 253,
    String = 254,
    Geometry = 255,
}

impl ColumnType {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => ColumnType::Decimal,
            1 => ColumnType::Tiny,
            2 => ColumnType::Short,
            3 => ColumnType::Long,
            4 => ColumnType::Float,
            5 => ColumnType::Double,
            6 => ColumnType::Null,
            7 => ColumnType::Timestamp,
            8 => ColumnType::LongLong,
            9 => ColumnType::Int24,
            10 => ColumnType::Date,
            11 => ColumnType::Time,
            12 => ColumnType::DateTime,
            13 => ColumnType::Year,
            15 => ColumnType::Varchar,
            16 => ColumnType::Bit,
            17 => ColumnType::Timestamp2,
            18 => ColumnType::DateTime2,
            19 => ColumnType::Time2,
            245 => ColumnType::Json,
            246 => ColumnType::NewDecimal,
            247 => ColumnType::Enum,
            248 => ColumnType::Set,
            249 => ColumnType::TinyBlob,
            250 => ColumnType::MediumBlob,
            251 => ColumnType::LongBlob,
            252 => ColumnType::Blob,
            253 => ColumnType::VarString,
            254 => ColumnType::String,
            255 => ColumnType::Geometry,
            _ => ColumnType::VarString,
        }
    }

    /// BLOB/TEXT family: columns the noblob row image may omit.
    pub fn is_blob(&self) -> bool {
        matches!(
            self,
            ColumnType::TinyBlob
                | ColumnType::MediumBlob
                | ColumnType::LongBlob
                | ColumnType::Blob
                | ColumnType::Json
                | ColumnType::Geometry
        )
    }
}

/// The common 19-byte binlog event header.
#[derive(Debug, Clone)]
pub struct EventHeader {
    pub timestamp: u32,
    pub event_type: EventType,
    pub server_id: u32,
    pub event_length: u32,
    pub next_position: u32,
    pub flags: u16,
}

impl EventHeader {
    pub const SIZE: usize = 19;

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(TabletError::internal(format!(
                "binlog event header too short: {} bytes",
                data.len()
            )));
        }
        let mut cursor = Cursor::new(data);
        Ok(Self {
            timestamp: cursor.get_u32_le(),
            event_type: EventType::from_u8(cursor.get_u8()),
            server_id: cursor.get_u32_le(),
            event_length: cursor.get_u32_le(),
            next_position: cursor.get_u32_le(),
            flags: cursor.get_u16_le(),
        })
    }
}

/// 6-byte little-endian table id.
pub fn read_table_id(cursor: &mut Cursor<&[u8]>) -> Result<u64> {
    ensure_remaining(cursor, 6)?;
    let mut id = 0u64;
    for i in 0..6 {
        id |= (cursor.get_u8() as u64) << (8 * i);
    }
    Ok(id)
}

/// MySQL length-encoded integer.
pub fn read_packed_int(cursor: &mut Cursor<&[u8]>) -> Result<u64> {
    ensure_remaining(cursor, 1)?;
    let first = cursor.get_u8();
    match first {
        0..=250 => Ok(first as u64),
        252 => {
            ensure_remaining(cursor, 2)?;
            Ok(cursor.get_u16_le() as u64)
        }
        253 => {
            ensure_remaining(cursor, 3)?;
            let mut v = 0u64;
            for i in 0..3 {
                v |= (cursor.get_u8() as u64) << (8 * i);
            }
            Ok(v)
        }
        254 => {
            ensure_remaining(cursor, 8)?;
            Ok(cursor.get_u64_le())
        }
        other => Err(TabletError::internal(format!(
            "invalid length-encoded integer prefix {other}"
        ))),
    }
}

pub fn read_bytes(cursor: &mut Cursor<&[u8]>, len: usize) -> Result<Vec<u8>> {
    ensure_remaining(cursor, len)?;
    let mut buf = vec![0u8; len];
    cursor
        .read_exact(&mut buf)
        .map_err(|e| TabletError::internal(format!("short binlog read: {e}")))?;
    Ok(buf)
}

pub fn ensure_remaining(cursor: &Cursor<&[u8]>, needed: usize) -> Result<()> {
    if cursor.remaining() < needed {
        return Err(TabletError::internal(format!(
            "truncated binlog event: need {needed} bytes, have {}",
            cursor.remaining()
        )));
    }
    Ok(())
}

pub fn count_set_bits(bitmap: &[u8]) -> usize {
    bitmap.iter().map(|b| b.count_ones() as usize).sum()
}

pub fn is_bit_set(bitmap: &[u8], idx: usize) -> bool {
    let byte = idx / 8;
    byte < bitmap.len() && (bitmap[byte] & (1 << (idx % 8))) != 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_round_trip() {
        assert_eq!(EventType::from_u8(19), EventType::TableMapEvent);
        assert_eq!(EventType::from_u8(30), EventType::WriteRowsEventV2);
        assert_eq!(EventType::from_u8(33), EventType::GtidLogEvent);
        assert_eq!(EventType::from_u8(35), EventType::PreviousGtidsLogEvent);
        assert_eq!(EventType::from_u8(200), EventType::Unknown);
    }

    #[test]
    fn test_row_event_predicates() {
        assert!(EventType::WriteRowsEventV2.is_row_event());
        assert!(EventType::UpdateRowsEventV2.is_update());
        assert!(EventType::DeleteRowsEventV1.is_delete());
        assert!(EventType::WriteRowsEventV2.is_v2());
        assert!(!EventType::WriteRowsEventV1.is_v2());
        assert!(!EventType::QueryEvent.is_row_event());
    }

    #[test]
    fn test_header_parse() {
        let mut data = vec![0u8; 19];
        data[0..4].copy_from_slice(&100u32.to_le_bytes());
        data[4] = 16; // XidEvent
        data[5..9].copy_from_slice(&7u32.to_le_bytes());
        data[9..13].copy_from_slice(&27u32.to_le_bytes());
        data[13..17].copy_from_slice(&1234u32.to_le_bytes());
        let header = EventHeader::parse(&data).unwrap();
        assert_eq!(header.timestamp, 100);
        assert_eq!(header.event_type, EventType::XidEvent);
        assert_eq!(header.server_id, 7);
        assert_eq!(header.event_length, 27);
        assert_eq!(header.next_position, 1234);

        assert!(EventHeader::parse(&data[..10]).is_err());
    }

    #[test]
    fn test_packed_int() {
        let data = [5u8];
        assert_eq!(read_packed_int(&mut Cursor::new(&data[..])).unwrap(), 5);
        let data = [252u8, 0x10, 0x27];
        assert_eq!(
            read_packed_int(&mut Cursor::new(&data[..])).unwrap(),
            10000
        );
        let data = [251u8];
        assert!(read_packed_int(&mut Cursor::new(&data[..])).is_err());
    }

    #[test]
    fn test_table_id() {
        let data = [1u8, 0, 0, 0, 0, 0];
        assert_eq!(read_table_id(&mut Cursor::new(&data[..])).unwrap(), 1);
        let data = [0u8, 1, 0, 0, 0, 0];
        assert_eq!(read_table_id(&mut Cursor::new(&data[..])).unwrap(), 256);
    }

    #[test]
    fn test_blob_family() {
        assert!(ColumnType::Blob.is_blob());
        assert!(ColumnType::Json.is_blob());
        assert!(!ColumnType::Varchar.is_blob());
        assert!(!ColumnType::LongLong.is_blob());
    }

    #[test]
    fn test_bit_helpers() {
        let bitmap = [0b0000_0101u8, 0b0000_0001];
        assert!(is_bit_set(&bitmap, 0));
        assert!(!is_bit_set(&bitmap, 1));
        assert!(is_bit_set(&bitmap, 2));
        assert!(is_bit_set(&bitmap, 8));
        assert_eq!(count_set_bits(&bitmap), 3);
    }
}
