//! Schema historian
//!
//! Keeps the history of schema versions keyed by GTID position and answers
//! "what did this table look like at position P". The binlog stream needs
//! this to decode row images produced under schemas that have since changed.
//!
//! Versions persist through a [`SchemaVersionStore`] (the sidecar
//! `schema_version` table in production); lookups run against an in-memory
//! list ordered by recording time. Since one tablet records positions in
//! commit order, the list is monotone in position and lookup is a binary
//! search.

use crate::schema::{MinimalSchema, TableSchema};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tabletd_core::{Position, Result, TabletError};
use tracing::info;

/// One row of schema history.
#[derive(Debug, Clone)]
pub struct SchemaVersion {
    pub id: i64,
    pub pos: Position,
    /// Wall clock of the recording, seconds since epoch.
    pub time_updated: i64,
    pub ddl: String,
    pub schema: MinimalSchema,
}

/// Persistence for schema versions.
#[async_trait]
pub trait SchemaVersionStore: Send + Sync {
    /// All rows, in recording order.
    async fn load_all(&self) -> Result<Vec<SchemaVersion>>;

    async fn insert(&self, version: &SchemaVersion) -> Result<()>;
}

/// In-memory store, used by tests and by tablets that do not persist
/// history.
#[derive(Default)]
pub struct MemorySchemaVersionStore {
    rows: Mutex<Vec<SchemaVersion>>,
}

impl MemorySchemaVersionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SchemaVersionStore for MemorySchemaVersionStore {
    async fn load_all(&self) -> Result<Vec<SchemaVersion>> {
        Ok(self.rows.lock().clone())
    }

    async fn insert(&self, version: &SchemaVersion) -> Result<()> {
        self.rows.lock().push(version.clone());
        Ok(())
    }
}

/// The historian itself.
pub struct SchemaHistorian {
    store: Arc<dyn SchemaVersionStore>,
    versions: RwLock<Vec<SchemaVersion>>,
}

impl SchemaHistorian {
    pub fn new(store: Arc<dyn SchemaVersionStore>) -> Self {
        Self {
            store,
            versions: RwLock::new(Vec::new()),
        }
    }

    /// Load history, seeding an initial row when none exists. The seed
    /// captures the current position and table definitions so lookups
    /// resolve for every position at or after first initialization.
    pub async fn open(&self, current_pos: Position, current_schema: MinimalSchema) -> Result<()> {
        let mut rows = self.store.load_all().await?;
        if rows.is_empty() {
            info!(pos = %current_pos, "seeding schema history with initial schema");
            let seed = SchemaVersion {
                id: 1,
                pos: current_pos,
                time_updated: chrono::Utc::now().timestamp(),
                ddl: String::new(),
                schema: current_schema,
            };
            self.store.insert(&seed).await?;
            rows.push(seed);
        }
        *self.versions.write() = rows;
        Ok(())
    }

    /// Re-read the store, picking up rows recorded by other components.
    pub async fn reload(&self) -> Result<()> {
        let rows = self.store.load_all().await?;
        *self.versions.write() = rows;
        Ok(())
    }

    /// Record a schema version. Idempotent: the first write at a given
    /// position wins.
    pub async fn record(&self, pos: Position, ddl: &str, schema: MinimalSchema) -> Result<()> {
        {
            let versions = self.versions.read();
            if versions.iter().any(|v| v.pos == pos) {
                return Ok(());
            }
        }
        let version = SchemaVersion {
            id: self.versions.read().last().map(|v| v.id + 1).unwrap_or(1),
            pos,
            time_updated: chrono::Utc::now().timestamp(),
            ddl: ddl.to_string(),
            schema,
        };
        self.store.insert(&version).await?;
        self.versions.write().push(version);
        Ok(())
    }

    /// The definition of `table` as of `pos`: the schema committed by the
    /// most recent version whose position is contained in `pos`.
    pub fn table_at(&self, table: &str, pos: &Position) -> Result<TableSchema> {
        let versions = self.versions.read();
        // Positions grow monotonically along the history, so the versions
        // covered by `pos` form a prefix.
        let covered = versions
            .partition_point(|v| v.pos.subset_of(pos).unwrap_or(false));
        if covered == 0 {
            return Err(TabletError::not_found(format!(
                "no schema version at or before position {pos} for table {table}"
            )));
        }
        versions[covered - 1]
            .schema
            .table(table)
            .cloned()
            .ok_or_else(|| {
                TabletError::not_found(format!(
                    "table {table} not present in schema at position {pos}"
                ))
            })
    }

    pub fn version_count(&self) -> usize {
        self.versions.read().len()
    }
}
