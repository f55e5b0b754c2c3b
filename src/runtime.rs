//! DataTable runtime manager
//!
//! Per-table load state, separate from the stored definition. Every load
//! is fenced by a per-table generation counter: starting a load (or
//! writing data directly) bumps the generation, and a completion whose
//! generation is no longer current is discarded without touching state.
//! Refreshes keep the previous rows visible while loading.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, instrument};

use crate::broadcast::{Broadcast, ChangeEvent, ChangeKind};
use crate::error::EngineError;
use crate::types::EntityId;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadStatus {
    #[default]
    Idle,
    Loading,
    Success,
    Error,
}

/// Observable load state of one table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TableState {
    pub status: LoadStatus,
    /// Last successfully loaded rows. Kept through a refresh, so consumers
    /// see stale rows rather than a flash of empty state.
    pub data: Vec<Value>,
    pub error: Option<String>,
    pub last_loaded: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct TableEntry {
    state: TableState,
    generation: u64,
    consumers: HashSet<String>,
}

/// Runtime state for all tables, plus their auto-refresh timer handles.
pub struct DataTableRuntime {
    entries: DashMap<EntityId, TableEntry>,
    timers: DashMap<EntityId, JoinHandle<()>>,
    broadcast: Arc<dyn Broadcast>,
}

impl DataTableRuntime {
    pub fn new(broadcast: Arc<dyn Broadcast>) -> Self {
        Self {
            entries: DashMap::new(),
            timers: DashMap::new(),
            broadcast,
        }
    }

    /// Current state snapshot. Tables never loaded report Idle.
    pub fn state(&self, table_id: &str) -> TableState {
        self.entries
            .get(table_id)
            .map(|e| e.state.clone())
            .unwrap_or_default()
    }

    pub fn consumer_count(&self, table_id: &str) -> usize {
        self.entries
            .get(table_id)
            .map(|e| e.consumers.len())
            .unwrap_or(0)
    }

    /// Register a consuming component; idempotent per component id.
    /// Returns the consumer count after the add; the transition to one is
    /// the caller's cue to trigger an initial load.
    pub fn register_consumer(&self, table_id: &str, component_id: &str) -> usize {
        let mut entry = self.entries.entry(table_id.to_string()).or_default();
        entry.consumers.insert(component_id.to_string());
        entry.consumers.len()
    }

    /// Unregister a consuming component; idempotent. State and data are
    /// kept so a returning consumer sees the cached rows immediately.
    pub fn unregister_consumer(&self, table_id: &str, component_id: &str) -> usize {
        let mut entry = self.entries.entry(table_id.to_string()).or_default();
        entry.consumers.remove(component_id);
        entry.consumers.len()
    }

    /// Run one fenced load. The fetch future executes without any lock
    /// held; if another load or direct write lands first, this completion
    /// is discarded and the newer state wins.
    #[instrument(skip(self, fetch))]
    pub async fn load_with<F>(&self, table_id: &str, fetch: F) -> TableState
    where
        F: Future<Output = Result<Vec<Value>, EngineError>>,
    {
        let my_generation = {
            let mut entry = self.entries.entry(table_id.to_string()).or_default();
            entry.generation += 1;
            entry.state.status = LoadStatus::Loading;
            entry.state.error = None;
            entry.generation
        };
        self.publish(table_id);

        let outcome = fetch.await;

        let (snapshot, committed) = {
            let mut entry = self.entries.entry(table_id.to_string()).or_default();
            if entry.generation != my_generation {
                debug!(table_id, "discarding stale load completion");
                (entry.state.clone(), false)
            } else {
                match outcome {
                    Ok(rows) => {
                        entry.state.status = LoadStatus::Success;
                        entry.state.data = rows;
                        entry.state.error = None;
                        entry.state.last_loaded = Some(Utc::now());
                    }
                    Err(e) => {
                        entry.state.status = LoadStatus::Error;
                        entry.state.error = Some(e.to_string());
                    }
                }
                (entry.state.clone(), true)
            }
        };
        if committed {
            self.publish(table_id);
        }
        snapshot
    }

    /// Write rows directly (transformer output, routed endpoint results).
    /// Bumps the generation so any in-flight load is invalidated.
    pub fn set_data(&self, table_id: &str, rows: Vec<Value>) {
        {
            let mut entry = self.entries.entry(table_id.to_string()).or_default();
            entry.generation += 1;
            entry.state.status = LoadStatus::Success;
            entry.state.data = rows;
            entry.state.error = None;
            entry.state.last_loaded = Some(Utc::now());
        }
        self.publish(table_id);
    }

    /// Replace the table's auto-refresh timer task. Any previous timer is
    /// cancelled first.
    pub fn set_timer(&self, table_id: &str, handle: JoinHandle<()>) {
        if let Some((_, old)) = self.timers.remove(table_id) {
            old.abort();
        }
        self.timers.insert(table_id.to_string(), handle);
    }

    pub fn clear_timer(&self, table_id: &str) {
        if let Some((_, handle)) = self.timers.remove(table_id) {
            handle.abort();
        }
    }

    /// Discard all runtime state for a deleted table.
    pub fn drop_table(&self, table_id: &str) {
        self.clear_timer(table_id);
        self.entries.remove(table_id);
    }

    /// Cancel every timer and clear all state.
    pub fn dispose(&self) {
        for entry in self.timers.iter() {
            entry.value().abort();
        }
        self.timers.clear();
        self.entries.clear();
    }

    fn publish(&self, table_id: &str) {
        let state = self.state(table_id);
        let value = serde_json::to_value(&state).unwrap_or(Value::Null);
        self.broadcast.publish(ChangeEvent {
            kind: ChangeKind::DataTable,
            id: table_id.to_string(),
            value,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::{NullBroadcast, RecordingBroadcast};
    use serde_json::json;
    use std::time::Duration;

    fn runtime() -> DataTableRuntime {
        DataTableRuntime::new(Arc::new(NullBroadcast))
    }

    #[tokio::test]
    async fn unknown_table_is_idle() {
        let rt = runtime();
        let state = rt.state("dt-1");
        assert_eq!(state.status, LoadStatus::Idle);
        assert!(state.data.is_empty());
    }

    #[tokio::test]
    async fn successful_load_commits_rows() {
        let rt = runtime();
        let state = rt
            .load_with("dt-1", async { Ok(vec![json!({"id": 1})]) })
            .await;
        assert_eq!(state.status, LoadStatus::Success);
        assert_eq!(state.data, vec![json!({"id": 1})]);
        assert!(state.last_loaded.is_some());
    }

    #[tokio::test]
    async fn failed_load_sets_error_status() {
        let rt = runtime();
        let state = rt
            .load_with("dt-1", async {
                Err(EngineError::Network("HTTP 500".to_string()))
            })
            .await;
        assert_eq!(state.status, LoadStatus::Error);
        assert!(state.error.unwrap().contains("HTTP 500"));
    }

    #[tokio::test]
    async fn refresh_keeps_stale_rows_while_loading() {
        let rt = DataTableRuntime::new(Arc::new(RecordingBroadcast::new()));
        rt.load_with("dt-1", async { Ok(vec![json!(1)]) }).await;

        // probe the state mid-refresh from inside the fetch future
        let mid = rt.state("dt-1");
        assert_eq!(mid.data, vec![json!(1)]);

        let state = rt
            .load_with("dt-1", async { Ok(vec![json!(2)]) })
            .await;
        assert_eq!(state.data, vec![json!(2)]);
    }

    #[tokio::test]
    async fn error_refresh_keeps_last_good_rows() {
        let rt = runtime();
        rt.load_with("dt-1", async { Ok(vec![json!(1)]) }).await;
        let state = rt
            .load_with("dt-1", async {
                Err(EngineError::Network("down".to_string()))
            })
            .await;
        assert_eq!(state.status, LoadStatus::Error);
        assert_eq!(state.data, vec![json!(1)]);
    }

    #[tokio::test]
    async fn stale_completion_is_discarded() {
        let rt = Arc::new(runtime());

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let slow_rt = Arc::clone(&rt);
        let slow = tokio::spawn(async move {
            slow_rt
                .load_with("dt-1", async {
                    let _ = rx.await;
                    Ok(vec![json!("old")])
                })
                .await
        });

        // let the slow load reach its Loading phase
        tokio::task::yield_now().await;
        rt.load_with("dt-1", async { Ok(vec![json!("new")]) }).await;

        tx.send(()).unwrap();
        let slow_state = slow.await.unwrap();

        // the slow completion observed the newer state instead of clobbering it
        assert_eq!(slow_state.data, vec![json!("new")]);
        assert_eq!(rt.state("dt-1").data, vec![json!("new")]);
    }

    #[tokio::test]
    async fn set_data_invalidates_inflight_load() {
        let rt = Arc::new(runtime());

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let slow_rt = Arc::clone(&rt);
        let slow = tokio::spawn(async move {
            slow_rt
                .load_with("dt-1", async {
                    let _ = rx.await;
                    Ok(vec![json!("fetched")])
                })
                .await
        });

        tokio::task::yield_now().await;
        rt.set_data("dt-1", vec![json!("written")]);
        tx.send(()).unwrap();
        slow.await.unwrap();

        assert_eq!(rt.state("dt-1").data, vec![json!("written")]);
    }

    #[tokio::test]
    async fn consumer_registration_is_idempotent() {
        let rt = runtime();
        assert_eq!(rt.register_consumer("dt-1", "c1"), 1);
        assert_eq!(rt.register_consumer("dt-1", "c1"), 1);
        assert_eq!(rt.register_consumer("dt-1", "c2"), 2);
        assert_eq!(rt.unregister_consumer("dt-1", "c1"), 1);
        assert_eq!(rt.unregister_consumer("dt-1", "c1"), 1);
        assert_eq!(rt.unregister_consumer("dt-1", "c2"), 0);
        assert_eq!(rt.unregister_consumer("dt-1", "never"), 0);
    }

    #[tokio::test]
    async fn unregister_keeps_cached_state() {
        let rt = runtime();
        rt.register_consumer("dt-1", "c1");
        rt.load_with("dt-1", async { Ok(vec![json!(1)]) }).await;
        rt.unregister_consumer("dt-1", "c1");

        assert_eq!(rt.state("dt-1").status, LoadStatus::Success);
        assert_eq!(rt.state("dt-1").data, vec![json!(1)]);
    }

    #[tokio::test]
    async fn drop_table_clears_state_and_timer() {
        let rt = runtime();
        rt.load_with("dt-1", async { Ok(vec![json!(1)]) }).await;
        rt.set_timer(
            "dt-1",
            tokio::spawn(async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }),
        );

        rt.drop_table("dt-1");
        assert_eq!(rt.state("dt-1").status, LoadStatus::Idle);
    }

    #[tokio::test]
    async fn loads_publish_loading_then_terminal() {
        let sink = RecordingBroadcast::new();
        let rt = DataTableRuntime::new(Arc::new(sink.clone()));
        rt.load_with("dt-1", async { Ok(vec![json!(1)]) }).await;

        let events = sink.filter_id("dt-1");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].value["status"], "loading");
        assert_eq!(events[1].value["status"], "success");
    }
}
