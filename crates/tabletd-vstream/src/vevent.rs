//! The VStream event model
//!
//! Events delivered to VStream consumers. Rows travel as length-prefixed
//! column bytes: `lengths[i]` is the byte length of column `i` within
//! `values`, or -1 for a column that is NULL or absent from the image. When
//! the binlog row image is partial, the `data_columns` bitmap on the row
//! change says which columns are present.

use crate::binlog::event::ColumnType;
use std::fmt;
use tabletd_core::Position;

/// A bitmap over column ordinals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitmap {
    pub count: usize,
    pub bits: Vec<u8>,
}

impl Bitmap {
    pub fn new(count: usize) -> Self {
        Self {
            count,
            bits: vec![0; count.div_ceil(8)],
        }
    }

    /// A bitmap with every bit set.
    pub fn full(count: usize) -> Self {
        let mut bitmap = Self::new(count);
        for i in 0..count {
            bitmap.set(i);
        }
        bitmap
    }

    pub fn set(&mut self, i: usize) {
        if i < self.count {
            self.bits[i / 8] |= 1 << (i % 8);
        }
    }

    pub fn bit(&self, i: usize) -> bool {
        i < self.count && (self.bits[i / 8] & (1 << (i % 8))) != 0
    }

    pub fn count_set(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }

    pub fn is_full(&self) -> bool {
        self.count_set() == self.count
    }
}

/// A row as length-prefixed column bytes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Row {
    pub lengths: Vec<i64>,
    pub values: Vec<u8>,
}

impl Row {
    /// Build a row from per-column optional values.
    pub fn from_columns(columns: &[Option<Vec<u8>>]) -> Self {
        let mut row = Row::default();
        for column in columns {
            match column {
                Some(bytes) => {
                    row.lengths.push(bytes.len() as i64);
                    row.values.extend_from_slice(bytes);
                }
                None => row.lengths.push(-1),
            }
        }
        row
    }

    /// The bytes of column `i`, or `None` when NULL/absent.
    pub fn column(&self, i: usize) -> Option<&[u8]> {
        let mut offset = 0usize;
        for (idx, len) in self.lengths.iter().enumerate() {
            if *len < 0 {
                if idx == i {
                    return None;
                }
                continue;
            }
            let len = *len as usize;
            if idx == i {
                return Some(&self.values[offset..offset + len]);
            }
            offset += len;
        }
        None
    }

    pub fn num_columns(&self) -> usize {
        self.lengths.len()
    }

    /// Approximate wire size, used for packetization accounting.
    pub fn byte_size(&self) -> usize {
        self.values.len() + self.lengths.len() * 4
    }
}

impl fmt::Display for Row {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "lengths:{:?} values:{:?}",
            self.lengths,
            String::from_utf8_lossy(&self.values)
        )
    }
}

/// One changed row: optional before and after images.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RowChange {
    pub before: Option<Row>,
    pub after: Option<Row>,
    /// Which columns the images carry, when the binlog row image is partial.
    pub data_columns: Option<Bitmap>,
}

impl RowChange {
    pub fn byte_size(&self) -> usize {
        self.before.as_ref().map(Row::byte_size).unwrap_or(0)
            + self.after.as_ref().map(Row::byte_size).unwrap_or(0)
    }
}

/// A column definition as seen by consumers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub name: String,
    pub column_type: ColumnType,
}

impl Field {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
        }
    }
}

/// Type of journal entry surfaced from the resharding journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationType {
    Tables,
    Shards,
}

/// An event in the VStream.
#[derive(Debug, Clone, PartialEq)]
pub enum VEvent {
    Begin,
    Commit,
    /// Position reached after the transaction this event precedes.
    Gtid(Position),
    Ddl(String),
    /// Column definitions for a table; always precedes the table's first ROW
    /// event in a session.
    Field {
        table_name: String,
        fields: Vec<Field>,
    },
    Row {
        table_name: String,
        row_changes: Vec<RowChange>,
    },
    Heartbeat,
    /// Statement-format DML passed through without row decoding.
    InsertStatement(String),
    UpdateStatement(String),
    DeleteStatement(String),
    Other(String),
    /// A write to the resharding journal.
    Journal {
        id: i64,
        migration_type: MigrationType,
    },
    /// A schema version was recorded.
    Version,
    /// Copy progress marker: the last primary key reached in `table_name`,
    /// or completion of the table when `completed` is set.
    LastPk {
        table_name: String,
        lastpk: Option<Row>,
        completed: bool,
    },
    /// All tables of a VStreamCopy have been copied.
    CopyCompleted,
}

impl VEvent {
    /// Approximate wire size, used for packetization accounting.
    pub fn byte_size(&self) -> usize {
        match self {
            VEvent::Gtid(pos) => 8 + pos.encode().len(),
            VEvent::Ddl(q)
            | VEvent::Other(q)
            | VEvent::InsertStatement(q)
            | VEvent::UpdateStatement(q)
            | VEvent::DeleteStatement(q) => 8 + q.len(),
            VEvent::Field { table_name, fields } => {
                8 + table_name.len() + fields.iter().map(|f| f.name.len() + 8).sum::<usize>()
            }
            VEvent::Row {
                table_name,
                row_changes,
            } => {
                8 + table_name.len()
                    + row_changes.iter().map(RowChange::byte_size).sum::<usize>()
            }
            VEvent::LastPk { table_name, lastpk, .. } => {
                8 + table_name.len() + lastpk.as_ref().map(Row::byte_size).unwrap_or(0)
            }
            _ => 8,
        }
    }

    pub fn is_heartbeat(&self) -> bool {
        matches!(self, VEvent::Heartbeat)
    }

    pub fn is_ddl(&self) -> bool {
        matches!(self, VEvent::Ddl(_))
    }
}

impl fmt::Display for VEvent {
    /// Canonical textual rendering, used by tests.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VEvent::Begin => write!(f, "begin"),
            VEvent::Commit => write!(f, "commit"),
            VEvent::Gtid(pos) => write!(f, "gtid:{pos}"),
            VEvent::Ddl(q) => write!(f, "ddl:{q}"),
            VEvent::Field { table_name, fields } => {
                write!(f, "field:{table_name}[")?;
                for (i, field) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{}", field.name)?;
                }
                write!(f, "]")
            }
            VEvent::Row {
                table_name,
                row_changes,
            } => {
                write!(f, "row:{table_name}")?;
                for change in row_changes {
                    write!(f, "{{")?;
                    if let Some(before) = &change.before {
                        write!(f, "before:{{{before}}} ")?;
                    }
                    if let Some(after) = &change.after {
                        write!(f, "after:{{{after}}} ")?;
                    }
                    if let Some(bitmap) = &change.data_columns {
                        write!(f, "data_columns:{:?}", bitmap.bits)?;
                    }
                    write!(f, "}}")?;
                }
                Ok(())
            }
            VEvent::Heartbeat => write!(f, "heartbeat"),
            VEvent::InsertStatement(q) => write!(f, "insert:{q}"),
            VEvent::UpdateStatement(q) => write!(f, "update:{q}"),
            VEvent::DeleteStatement(q) => write!(f, "delete:{q}"),
            VEvent::Other(q) => write!(f, "other:{q}"),
            VEvent::Journal { id, migration_type } => {
                write!(f, "journal:{id}:{migration_type:?}")
            }
            VEvent::Version => write!(f, "version"),
            VEvent::LastPk {
                table_name,
                lastpk,
                completed,
            } => {
                write!(f, "lastpk:{table_name}")?;
                if let Some(row) = lastpk {
                    write!(f, ":{{{row}}}")?;
                }
                if *completed {
                    write!(f, ":completed")?;
                }
                Ok(())
            }
            VEvent::CopyCompleted => write!(f, "copy_completed"),
        }
    }
}
