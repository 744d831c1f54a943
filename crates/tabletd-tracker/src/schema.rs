//! Minimal table model
//!
//! Just enough of a table definition to decode binlog row images: column
//! names and binlog type codes, plus primary key ordinals. Serialized into
//! the historian's schema blobs.

use serde::{Deserialize, Serialize};

/// One column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableField {
    pub name: String,
    /// Binlog column type code (MYSQL_TYPE_*).
    pub column_type: u8,
}

impl TableField {
    pub fn new(name: impl Into<String>, column_type: u8) -> Self {
        Self {
            name: name.into(),
            column_type,
        }
    }
}

/// One table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub fields: Vec<TableField>,
    /// Ordinals of the primary key columns, in key order.
    #[serde(default)]
    pub pk_columns: Vec<usize>,
}

impl TableSchema {
    pub fn new(name: impl Into<String>, fields: Vec<TableField>) -> Self {
        Self {
            name: name.into(),
            fields,
            pk_columns: Vec::new(),
        }
    }

    pub fn with_pk(mut self, pk_columns: Vec<usize>) -> Self {
        self.pk_columns = pk_columns;
        self
    }
}

/// A snapshot of every tracked table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MinimalSchema {
    pub tables: Vec<TableSchema>,
}

impl MinimalSchema {
    pub fn table(&self, name: &str) -> Option<&TableSchema> {
        self.tables.iter().find(|t| t.name == name)
    }
}
