//! Schema tracking and health streaming for a tablet.
//!
//! - [`historian`]: versioned table definitions keyed by GTID position, so
//!   binlog row images can be decoded against the schema that produced them
//! - [`health`]: realtime health fan-out to subscribers with bounded,
//!   non-blocking delivery
//! - [`tracker`]: primary-only polling of information_schema for table and
//!   view definition changes
//! - [`schema`]: the minimal table model shared by all three

pub mod health;
pub mod historian;
pub mod schema;
pub mod tracker;

pub use health::{HealthState, HealthStreamer, RealtimeStats, DEFAULT_STREAM_HEALTH_BUFFER_SIZE};
pub use historian::{MemorySchemaVersionStore, SchemaHistorian, SchemaVersion, SchemaVersionStore};
pub use schema::{MinimalSchema, TableField, TableSchema};
pub use tracker::{QueryExecutor, SchemaChangeTracker, TrackerConfig};
