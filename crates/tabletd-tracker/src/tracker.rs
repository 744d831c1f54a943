//! Schema change detection
//!
//! On the primary, a periodic task compares information_schema against the
//! sidecar schema-copy tables, refreshes the copies for whatever changed,
//! and pushes the changed names to the health streamer so downstream gates
//! reload. On a non-primary tablet the detector is inert. Detection
//! failures log and wait for the next tick; a tick that fires while the
//! previous one is still running is dropped.

use crate::health::{HealthStreamer, DEFAULT_STREAM_HEALTH_BUFFER_SIZE};
use crate::historian::SchemaHistorian;
use crate::schema::{MinimalSchema, TableField, TableSchema};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tabletd_core::{Position, Result, TabletAlias, TabletError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Detector configuration.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// How often to look for schema changes.
    pub reload_interval: Duration,
    /// Upper bound on one detection pass.
    pub reload_timeout: Duration,
    /// Per-subscriber channel capacity of the health streamer this tracker
    /// notifies.
    pub buffer_size: usize,
    /// Track view definition changes too.
    pub enable_views: bool,
    /// Record schema versions into the historian on change.
    pub track_schema_versions: bool,
    /// Sidecar database holding the copy tables.
    pub sidecar_db: String,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            reload_interval: Duration::from_secs(5),
            reload_timeout: Duration::from_secs(30),
            buffer_size: DEFAULT_STREAM_HEALTH_BUFFER_SIZE,
            enable_views: false,
            track_schema_versions: false,
            sidecar_db: "_tabletd".to_string(),
        }
    }
}

impl TrackerConfig {
    /// Build the health streamer this tracker feeds, sized by this config.
    pub fn health_streamer(
        &self,
        alias: TabletAlias,
        keyspace: &str,
        shard: &str,
    ) -> HealthStreamer {
        HealthStreamer::new(alias, keyspace, shard, self.buffer_size)
    }
}

/// Query seam to the local MySQL. Rows come back as string columns.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn exec(&self, query: &str) -> Result<Vec<Vec<String>>>;
}

/// The detector.
pub struct SchemaChangeTracker {
    config: TrackerConfig,
    executor: Arc<dyn QueryExecutor>,
    health: Arc<HealthStreamer>,
    historian: Option<Arc<SchemaHistorian>>,
    reloading: AtomicBool,
}

impl SchemaChangeTracker {
    pub fn new(
        config: TrackerConfig,
        executor: Arc<dyn QueryExecutor>,
        health: Arc<HealthStreamer>,
        historian: Option<Arc<SchemaHistorian>>,
    ) -> Self {
        Self {
            config,
            executor,
            health,
            historian,
            reloading: AtomicBool::new(false),
        }
    }

    /// Start the periodic detection task. It runs until the token fires.
    pub fn start(self: Arc<Self>, ctx: CancellationToken) {
        let interval = self.config.reload_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ctx.cancelled() => return,
                    _ = ticker.tick() => {
                        if let Err(e) = self.reload().await {
                            error!(error = %e, "periodic schema reload failed");
                        }
                    }
                }
            }
        });
    }

    /// One detection pass. Drops re-entrant invocations; inert off-primary.
    pub async fn reload(&self) -> Result<()> {
        if !self.health.is_primary() {
            return Ok(());
        }
        if self.reloading.swap(true, Ordering::AcqRel) {
            debug!("schema reload already in progress, dropping tick");
            return Ok(());
        }
        let result = tokio::time::timeout(self.config.reload_timeout, self.reload_inner())
            .await
            .map_err(|_| TabletError::unavailable("schema change detection timed out"))
            .and_then(|r| r);
        self.reloading.store(false, Ordering::Release);
        result
    }

    async fn reload_inner(&self) -> Result<()> {
        let changed_tables = self.changed_names(DETECT_CHANGED_TABLES).await?;
        let changed_views = if self.config.enable_views {
            // A view detection failure with table changes in hand still
            // surfaces the tables.
            match self.changed_names(DETECT_CHANGED_VIEWS).await {
                Ok(views) => views,
                Err(e) if !changed_tables.is_empty() => {
                    error!(error = %e, "view change detection failed");
                    Vec::new()
                }
                Err(e) => return Err(e),
            }
        } else {
            Vec::new()
        };

        if changed_tables.is_empty() && changed_views.is_empty() {
            return Ok(());
        }
        info!(
            tables = changed_tables.len(),
            views = changed_views.len(),
            "schema changes detected"
        );

        // Refresh the copies in one transaction, scoped to the changed
        // names.
        self.executor.exec("BEGIN").await?;
        let refresh = async {
            if !changed_tables.is_empty() {
                let names = quoted_list(&changed_tables);
                self.executor
                    .exec(&self.sidecar_query(DELETE_CHANGED_TABLE_COPIES, &names))
                    .await?;
                self.executor
                    .exec(&self.sidecar_query(INSERT_CHANGED_TABLE_COPIES, &names))
                    .await?;
            }
            if !changed_views.is_empty() {
                let names = quoted_list(&changed_views);
                self.executor
                    .exec(&self.sidecar_query(DELETE_CHANGED_VIEW_COPIES, &names))
                    .await?;
                self.executor
                    .exec(&self.sidecar_query(INSERT_CHANGED_VIEW_COPIES, &names))
                    .await?;
            }
            Ok::<(), TabletError>(())
        }
        .await;
        match refresh {
            Ok(()) => {
                self.executor.exec("COMMIT").await?;
            }
            Err(e) => {
                let _ = self.executor.exec("ROLLBACK").await;
                return Err(e);
            }
        }

        if self.config.track_schema_versions {
            if let Some(historian) = &self.historian {
                let pos = self.current_position().await?;
                let schema = self.current_schema(&changed_tables).await?;
                historian
                    .record(pos, &format!("tables changed: {}", changed_tables.join(", ")), schema)
                    .await?;
            }
        }

        self.health.on_schema_change(changed_tables, changed_views);
        Ok(())
    }

    async fn changed_names(&self, query: &str) -> Result<Vec<String>> {
        let rows = self
            .executor
            .exec(&query.replace("{sidecar}", &self.config.sidecar_db))
            .await?;
        Ok(rows.into_iter().filter_map(|r| r.into_iter().next()).collect())
    }

    fn sidecar_query(&self, template: &str, names: &str) -> String {
        template
            .replace("{sidecar}", &self.config.sidecar_db)
            .replace("{names}", names)
    }

    async fn current_position(&self) -> Result<Position> {
        let rows = self.executor.exec(SELECT_GTID_EXECUTED).await?;
        let value = rows
            .first()
            .and_then(|r| r.first())
            .ok_or_else(|| TabletError::unknown("no gtid_executed row"))?;
        Position::parse(tabletd_core::Flavor::Mysql56, value)
    }

    /// Minimal schema for the changed tables: (table, column, type code,
    /// key) rows from information_schema, in ordinal order. Columns keyed
    /// `PRI` become the table's primary key ordinals.
    async fn current_schema(&self, tables: &[String]) -> Result<MinimalSchema> {
        let rows = self
            .executor
            .exec(&SELECT_COLUMNS.replace("{names}", &quoted_list(tables)))
            .await?;
        let mut schema = MinimalSchema::default();
        for row in rows {
            if row.len() < 3 {
                continue;
            }
            let (table, column, type_code) = (&row[0], &row[1], &row[2]);
            let type_code: u8 = type_code.parse().unwrap_or(15);
            let is_pk = row.get(3).map(|key| key == "PRI").unwrap_or(false);
            let idx = match schema.tables.iter().position(|t| t.name == *table) {
                Some(idx) => idx,
                None => {
                    schema.tables.push(TableSchema::new(table.clone(), Vec::new()));
                    schema.tables.len() - 1
                }
            };
            let entry = &mut schema.tables[idx];
            if is_pk {
                entry.pk_columns.push(entry.fields.len());
            }
            entry.fields.push(TableField::new(column.clone(), type_code));
        }
        Ok(schema)
    }
}

fn quoted_list(names: &[String]) -> String {
    names
        .iter()
        .map(|n| format!("'{}'", n.replace('\'', "''")))
        .collect::<Vec<_>>()
        .join(", ")
}

// Detection compares a per-table column signature against the sidecar
// copies; a row in the result is a name whose definition is missing or
// stale.
const DETECT_CHANGED_TABLES: &str = "\
SELECT i.table_name FROM \
(SELECT table_name, bit_xor(crc32(concat(column_name, ':', column_type, ':', ordinal_position))) AS signature \
FROM information_schema.columns WHERE table_schema = database() GROUP BY table_name) i \
LEFT JOIN {sidecar}.schema_copy c ON i.table_name = c.table_name \
WHERE c.table_name IS NULL OR c.signature <> i.signature";

const DETECT_CHANGED_VIEWS: &str = "\
SELECT v.table_name FROM information_schema.views v \
LEFT JOIN {sidecar}.views_copy c ON v.table_name = c.table_name \
WHERE v.table_schema = database() \
AND (c.table_name IS NULL OR c.view_definition <> v.view_definition)";

const DELETE_CHANGED_TABLE_COPIES: &str =
    "DELETE FROM {sidecar}.schema_copy WHERE table_name IN ({names})";

const INSERT_CHANGED_TABLE_COPIES: &str = "\
INSERT INTO {sidecar}.schema_copy (table_name, signature, create_statement) \
SELECT table_name, \
bit_xor(crc32(concat(column_name, ':', column_type, ':', ordinal_position))), \
'' FROM information_schema.columns \
WHERE table_schema = database() AND table_name IN ({names}) GROUP BY table_name";

const DELETE_CHANGED_VIEW_COPIES: &str =
    "DELETE FROM {sidecar}.views_copy WHERE table_name IN ({names})";

const INSERT_CHANGED_VIEW_COPIES: &str = "\
INSERT INTO {sidecar}.views_copy (table_name, view_definition, create_statement) \
SELECT table_name, view_definition, \
concat('CREATE VIEW ', table_name, ' AS ', view_definition) \
FROM information_schema.views WHERE table_schema = database() AND table_name IN ({names})";

const SELECT_GTID_EXECUTED: &str = "SELECT @@global.gtid_executed";

const SELECT_COLUMNS: &str = "\
SELECT table_name, column_name, binlog_type_code, column_key \
FROM information_schema.columns \
WHERE table_schema = database() AND table_name IN ({names}) \
ORDER BY table_name, ordinal_position";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::historian::MemorySchemaVersionStore;
    use parking_lot::Mutex;
    use tabletd_core::{TabletAlias, TabletType};

    const SID: &str = "3e11fa47-71ca-11e1-9e33-c80aa9429562";

    /// Scripted executor: maps a query substring to canned rows and records
    /// everything executed.
    #[derive(Default)]
    struct FakeExecutor {
        responses: Mutex<Vec<(&'static str, Vec<Vec<String>>)>>,
        log: Mutex<Vec<String>>,
        fail_on: Mutex<Option<&'static str>>,
    }

    impl FakeExecutor {
        fn respond(&self, needle: &'static str, rows: Vec<Vec<String>>) {
            self.responses.lock().push((needle, rows));
        }

        fn executed(&self) -> Vec<String> {
            self.log.lock().clone()
        }
    }

    #[async_trait]
    impl QueryExecutor for FakeExecutor {
        async fn exec(&self, query: &str) -> Result<Vec<Vec<String>>> {
            self.log.lock().push(query.to_string());
            if let Some(needle) = *self.fail_on.lock() {
                if query.contains(needle) {
                    return Err(TabletError::unknown(format!("injected failure on {needle}")));
                }
            }
            for (needle, rows) in self.responses.lock().iter() {
                if query.contains(needle) {
                    return Ok(rows.clone());
                }
            }
            Ok(Vec::new())
        }
    }

    fn health(primary: bool) -> Arc<HealthStreamer> {
        let config = TrackerConfig {
            buffer_size: 8,
            ..TrackerConfig::default()
        };
        let h = Arc::new(config.health_streamer(TabletAlias::new("zone1", 101), "commerce", "-80"));
        h.open();
        let tablet_type = if primary {
            TabletType::Primary
        } else {
            TabletType::Replica
        };
        h.change_state(tablet_type, 1, Duration::ZERO, None, true);
        h
    }

    fn tracker(
        executor: Arc<FakeExecutor>,
        health: Arc<HealthStreamer>,
        historian: Option<Arc<SchemaHistorian>>,
        track_versions: bool,
    ) -> SchemaChangeTracker {
        SchemaChangeTracker::new(
            TrackerConfig {
                enable_views: true,
                track_schema_versions: track_versions,
                ..TrackerConfig::default()
            },
            executor,
            health,
            historian,
        )
    }

    #[tokio::test]
    async fn test_inert_on_replica() {
        let executor = Arc::new(FakeExecutor::default());
        let t = tracker(executor.clone(), health(false), None, false);
        t.reload().await.unwrap();
        assert!(executor.executed().is_empty());
    }

    #[tokio::test]
    async fn test_no_changes_no_broadcast() {
        let executor = Arc::new(FakeExecutor::default());
        let h = health(true);
        let (_, mut rx) = h.subscribe().unwrap();
        let _ = rx.recv().await.unwrap();
        let t = tracker(executor, h, None, false);
        t.reload().await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_changes_refresh_copies_and_notify() {
        let executor = Arc::new(FakeExecutor::default());
        executor.respond(
            "LEFT JOIN _tabletd.schema_copy",
            vec![vec!["t1".to_string()], vec!["t2".to_string()]],
        );
        executor.respond("LEFT JOIN _tabletd.views_copy", vec![vec!["v1".to_string()]]);

        let h = health(true);
        let (_, mut rx) = h.subscribe().unwrap();
        let _ = rx.recv().await.unwrap(); // initial state

        let t = tracker(executor.clone(), h, None, false);
        t.reload().await.unwrap();

        let notified = rx.recv().await.unwrap();
        assert_eq!(notified.realtime_stats.table_schema_changed, vec!["t1", "t2"]);
        assert_eq!(notified.realtime_stats.view_schema_changed, vec!["v1"]);

        let executed = executor.executed();
        let as_text = executed.join("\n");
        assert!(as_text.contains("BEGIN"));
        assert!(as_text.contains("DELETE FROM _tabletd.schema_copy WHERE table_name IN ('t1', 't2')"));
        assert!(as_text.contains("INSERT INTO _tabletd.schema_copy"));
        assert!(as_text.contains("DELETE FROM _tabletd.views_copy WHERE table_name IN ('v1')"));
        // The stored view CREATE statement is a complete, usable statement.
        assert!(as_text.contains("concat('CREATE VIEW ', table_name, ' AS ', view_definition)"));
        assert!(as_text.contains("COMMIT"));
    }

    #[tokio::test]
    async fn test_refresh_failure_rolls_back() {
        let executor = Arc::new(FakeExecutor::default());
        executor.respond("LEFT JOIN _tabletd.schema_copy", vec![vec!["t1".to_string()]]);
        *executor.fail_on.lock() = Some("INSERT INTO _tabletd.schema_copy");

        let t = tracker(executor.clone(), health(true), None, false);
        assert!(t.reload().await.is_err());
        let as_text = executor.executed().join("\n");
        assert!(as_text.contains("ROLLBACK"));
        assert!(!as_text.contains("\nCOMMIT"));
    }

    #[tokio::test]
    async fn test_records_version_when_tracking() {
        let executor = Arc::new(FakeExecutor::default());
        executor.respond("LEFT JOIN _tabletd.schema_copy", vec![vec!["t1".to_string()]]);
        executor.respond(
            "gtid_executed",
            vec![vec![format!("{SID}:1-42")]],
        );
        executor.respond(
            "information_schema.columns",
            vec![
                vec![
                    "t1".to_string(),
                    "id".to_string(),
                    "3".to_string(),
                    "PRI".to_string(),
                ],
                vec![
                    "t1".to_string(),
                    "v".to_string(),
                    "15".to_string(),
                    String::new(),
                ],
            ],
        );

        let historian = Arc::new(SchemaHistorian::new(Arc::new(
            MemorySchemaVersionStore::new(),
        )));
        historian
            .open(
                Position::decode(&format!("MySQL56/{SID}:1-10")).unwrap(),
                MinimalSchema::default(),
            )
            .await
            .unwrap();

        let t = tracker(executor, health(true), Some(historian.clone()), true);
        t.reload().await.unwrap();

        assert_eq!(historian.version_count(), 2);
        let table = historian
            .table_at("t1", &Position::decode(&format!("MySQL56/{SID}:1-42")).unwrap())
            .unwrap();
        assert_eq!(table.fields.len(), 2);
        assert_eq!(table.fields[0].name, "id");
        assert_eq!(table.pk_columns, vec![0]);
    }
}
