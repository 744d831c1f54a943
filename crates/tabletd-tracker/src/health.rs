//! Health streamer
//!
//! Broadcasts tablet health to subscribers. Producers never block: each
//! subscriber gets a bounded channel, delivery is try-send, and a subscriber
//! that cannot keep up has its channel closed and is removed. The consumer
//! observes the close and must reconnect to resynchronize. A fresh
//! subscriber always receives the current state first, so the sequence each
//! subscriber observes is a prefix of the producer's sequence.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tabletd_core::{Result, TabletAlias, TabletError, TabletType, Target};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Default per-subscriber channel capacity.
pub const DEFAULT_STREAM_HEALTH_BUFFER_SIZE: usize = 20;

/// Realtime serving statistics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RealtimeStats {
    pub replication_lag_seconds: u32,
    pub qps: f64,
    pub health_error: String,
    /// Tables whose definitions changed; set for exactly one broadcast.
    pub table_schema_changed: Vec<String>,
    /// Views whose definitions changed; set for exactly one broadcast.
    pub view_schema_changed: Vec<String>,
}

/// The broadcast health record.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthState {
    pub tablet_alias: TabletAlias,
    pub target: Target,
    pub serving: bool,
    pub tablet_externally_reparented_timestamp: i64,
    pub realtime_stats: RealtimeStats,
}

struct Inner {
    state: HealthState,
    subscribers: HashMap<u64, mpsc::Sender<HealthState>>,
    next_subscriber_id: u64,
    open: bool,
}

/// Fan-out of health state to streaming subscribers.
pub struct HealthStreamer {
    buffer_size: usize,
    inner: Mutex<Inner>,
}

impl HealthStreamer {
    pub fn new(alias: TabletAlias, keyspace: &str, shard: &str, buffer_size: usize) -> Self {
        Self {
            buffer_size: buffer_size.max(1),
            inner: Mutex::new(Inner {
                state: HealthState {
                    tablet_alias: alias,
                    target: Target::new(keyspace, shard, TabletType::Replica),
                    serving: false,
                    tablet_externally_reparented_timestamp: 0,
                    realtime_stats: RealtimeStats {
                        health_error: "tabletserver uninitialized".to_string(),
                        ..RealtimeStats::default()
                    },
                },
                subscribers: HashMap::new(),
                next_subscriber_id: 0,
                open: false,
            }),
        }
    }

    pub fn open(&self) {
        self.inner.lock().open = true;
    }

    /// Close the streamer; every subscriber observes its channel closing.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.open = false;
        inner.subscribers.clear();
    }

    pub fn is_primary(&self) -> bool {
        self.inner.lock().state.target.tablet_type.is_primary()
    }

    /// Register a subscriber. The current state is delivered first.
    pub fn subscribe(&self) -> Result<(u64, mpsc::Receiver<HealthState>)> {
        let mut inner = self.inner.lock();
        if !inner.open {
            return Err(TabletError::unavailable("health streamer is closed"));
        }
        let (tx, rx) = mpsc::channel(self.buffer_size);
        // Capacity is at least one and the channel is fresh, so the initial
        // state always fits.
        let _ = tx.try_send(inner.state.clone());
        let id = inner.next_subscriber_id;
        inner.next_subscriber_id += 1;
        inner.subscribers.insert(id, tx);
        Ok((id, rx))
    }

    pub fn unsubscribe(&self, id: u64) {
        self.inner.lock().subscribers.remove(&id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }

    /// Update the health state and broadcast it.
    pub fn change_state(
        &self,
        tablet_type: TabletType,
        ter_timestamp: i64,
        lag: Duration,
        health_error: Option<&str>,
        serving: bool,
    ) {
        let mut inner = self.inner.lock();
        inner.state.target.tablet_type = tablet_type;
        inner.state.tablet_externally_reparented_timestamp = if tablet_type.is_primary() {
            ter_timestamp
        } else {
            0
        };
        inner.state.realtime_stats.health_error =
            health_error.map(str::to_string).unwrap_or_default();
        inner.state.realtime_stats.replication_lag_seconds = lag.as_secs() as u32;
        inner.state.serving = serving;
        let state = inner.state.clone();
        broadcast_locked(&mut inner, state);
    }

    /// Broadcast a one-shot schema change notification: the changed names
    /// ride along on exactly one state clone, then clear.
    pub fn on_schema_change(&self, tables: Vec<String>, views: Vec<String>) {
        if tables.is_empty() && views.is_empty() {
            return;
        }
        let mut inner = self.inner.lock();
        inner.state.realtime_stats.table_schema_changed = tables;
        inner.state.realtime_stats.view_schema_changed = views;
        let state = inner.state.clone();
        broadcast_locked(&mut inner, state);
        inner.state.realtime_stats.table_schema_changed = Vec::new();
        inner.state.realtime_stats.view_schema_changed = Vec::new();
    }

    /// Stream states into `callback` until the token fires, the callback
    /// declines, or this subscriber falls behind.
    pub async fn stream<F>(
        self: &Arc<Self>,
        ctx: &CancellationToken,
        mut callback: F,
    ) -> Result<()>
    where
        F: FnMut(HealthState) -> Result<()> + Send,
    {
        let (id, mut rx) = self.subscribe()?;
        let result = loop {
            tokio::select! {
                _ = ctx.cancelled() => break Ok(()),
                state = rx.recv() => match state {
                    Some(state) => {
                        if let Err(e) = callback(state) {
                            break Err(e);
                        }
                    }
                    None => {
                        break if self.inner.lock().open {
                            Err(TabletError::resource_exhausted(
                                "stream health buffer overflowed; reconnect for up-to-date status",
                            ))
                        } else {
                            Err(TabletError::unavailable("health streamer is closed"))
                        };
                    }
                }
            }
        };
        self.unsubscribe(id);
        result
    }
}

/// Non-blocking fan-out: a full subscriber is closed and dropped rather
/// than ever blocking a state change.
fn broadcast_locked(inner: &mut Inner, state: HealthState) {
    inner.subscribers.retain(|id, tx| {
        match tx.try_send(state.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(subscriber = id, "health subscriber buffer full, closing its stream");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    });
}
