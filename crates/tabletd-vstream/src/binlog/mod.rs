//! MySQL binary log decoding.

pub mod decoder;
pub mod event;

pub use decoder::{BinlogDecoder, BinlogEvent, QueryKind, RowsEvent, TableMapEvent};
pub use event::{ColumnType, EventHeader, EventType};
