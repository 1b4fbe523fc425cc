//! Shared state: keyed values partitioned by scope with per-write isolation.
//!
//! Scopes: `execution` (private to one execution, the default), `stream`
//! (shared by a stream's executions), `global` (one map per runtime).
//! Isolation policies govern writes:
//!
//! - `ISOLATED` forces the write into execution scope; the owning executor
//!   task is the only writer, so no locking beyond the map lock is needed.
//! - `SHARED` writes through the map lock only. Values are never torn, but
//!   concurrent writers are not serialized: last writer wins.
//! - `SYNCHRONIZED` additionally holds a per-`(scope, id, key)` async lock
//!   for the duration of a read-modify-write, serializing SYNCHRONIZED
//!   writers on the same key without blocking ISOLATED writes.
//!
//! Execution-scoped data is strictly private: no isolation level makes one
//! execution's keys visible to another.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Which partition a key lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateScope {
    Execution,
    Stream,
    Global,
}

/// Write isolation policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    #[default]
    Isolated,
    Shared,
    Synchronized,
}

/// Concurrent keyed store for a runtime.
#[derive(Debug, Default)]
pub struct SharedState {
    global: RwLock<HashMap<String, Value>>,
    streams: RwLock<HashMap<String, HashMap<String, Value>>>,
    executions: RwLock<HashMap<String, HashMap<String, Value>>>,
    /// Per-key locks for SYNCHRONIZED read-modify-writes.
    key_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl SharedState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Effective scope after applying the isolation policy.
    fn effective_scope(scope: StateScope, isolation: IsolationLevel) -> StateScope {
        match isolation {
            IsolationLevel::Isolated => StateScope::Execution,
            _ => scope,
        }
    }

    fn lock_key(scope: StateScope, id: &str, key: &str) -> String {
        // \u{1} never appears in ids or keys coming from graph specs.
        format!("{scope:?}\u{1}{id}\u{1}{key}")
    }

    fn key_lock(&self, scope: StateScope, id: &str, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.key_locks.lock();
        locks
            .entry(Self::lock_key(scope, id, key))
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn release_key_lock(&self, scope: StateScope, id: &str, key: &str) {
        let mut locks = self.key_locks.lock();
        let name = Self::lock_key(scope, id, key);
        // The map holds one reference; drop the entry once no writer does.
        if locks.get(&name).map(Arc::strong_count) == Some(1) {
            locks.remove(&name);
        }
    }

    fn read_raw(&self, scope: StateScope, id: &str, key: &str) -> Option<Value> {
        match scope {
            StateScope::Global => self.global.read().get(key).cloned(),
            StateScope::Stream => self
                .streams
                .read()
                .get(id)
                .and_then(|m| m.get(key).cloned()),
            StateScope::Execution => self
                .executions
                .read()
                .get(id)
                .and_then(|m| m.get(key).cloned()),
        }
    }

    fn write_raw(&self, scope: StateScope, id: &str, key: &str, value: Value) {
        match scope {
            StateScope::Global => {
                self.global.write().insert(key.to_string(), value);
            }
            StateScope::Stream => {
                self.streams
                    .write()
                    .entry(id.to_string())
                    .or_default()
                    .insert(key.to_string(), value);
            }
            StateScope::Execution => {
                self.executions
                    .write()
                    .entry(id.to_string())
                    .or_default()
                    .insert(key.to_string(), value);
            }
        }
    }

    fn delete_raw(&self, scope: StateScope, id: &str, key: &str) {
        match scope {
            StateScope::Global => {
                self.global.write().remove(key);
            }
            StateScope::Stream => {
                if let Some(m) = self.streams.write().get_mut(id) {
                    m.remove(key);
                }
            }
            StateScope::Execution => {
                if let Some(m) = self.executions.write().get_mut(id) {
                    m.remove(key);
                }
            }
        }
    }

    /// Read a key. `id` is the execution or stream id; ignored for global.
    pub fn get(&self, scope: StateScope, id: &str, key: &str) -> Option<Value> {
        self.read_raw(scope, id, key)
    }

    /// Write a key under the given isolation policy.
    pub async fn put(
        &self,
        scope: StateScope,
        id: &str,
        key: &str,
        value: Value,
        isolation: IsolationLevel,
    ) {
        let scope = Self::effective_scope(scope, isolation);
        match isolation {
            IsolationLevel::Synchronized => {
                let lock = self.key_lock(scope, id, key);
                let _guard = lock.lock().await;
                self.write_raw(scope, id, key, value);
                drop(_guard);
                drop(lock);
                self.release_key_lock(scope, id, key);
            }
            _ => self.write_raw(scope, id, key, value),
        }
    }

    /// Delete a key under the given isolation policy.
    pub async fn delete(&self, scope: StateScope, id: &str, key: &str, isolation: IsolationLevel) {
        let scope = Self::effective_scope(scope, isolation);
        match isolation {
            IsolationLevel::Synchronized => {
                let lock = self.key_lock(scope, id, key);
                let _guard = lock.lock().await;
                self.delete_raw(scope, id, key);
                drop(_guard);
                drop(lock);
                self.release_key_lock(scope, id, key);
            }
            _ => self.delete_raw(scope, id, key),
        }
    }

    /// Read-modify-write. Under SYNCHRONIZED the closure runs while the
    /// per-key lock is held, serializing competing writers on that key.
    pub async fn update<F>(
        &self,
        scope: StateScope,
        id: &str,
        key: &str,
        isolation: IsolationLevel,
        f: F,
    ) -> Value
    where
        F: FnOnce(Option<Value>) -> Value,
    {
        let scope = Self::effective_scope(scope, isolation);
        match isolation {
            IsolationLevel::Synchronized => {
                let lock = self.key_lock(scope, id, key);
                let guard = lock.lock().await;
                let current = self.read_raw(scope, id, key);
                let next = f(current);
                self.write_raw(scope, id, key, next.clone());
                drop(guard);
                drop(lock);
                self.release_key_lock(scope, id, key);
                next
            }
            _ => {
                let current = self.read_raw(scope, id, key);
                let next = f(current);
                self.write_raw(scope, id, key, next.clone());
                next
            }
        }
    }

    /// Bulk-merge entries into an execution's scope.
    pub fn merge_execution(&self, execution_id: &str, entries: &Map<String, Value>) {
        let mut executions = self.executions.write();
        let map = executions.entry(execution_id.to_string()).or_default();
        for (k, v) in entries {
            map.insert(k.clone(), v.clone());
        }
    }

    /// The execution's full namespace as a JSON object map.
    pub fn execution_namespace(&self, execution_id: &str) -> Map<String, Value> {
        self.executions
            .read()
            .get(execution_id)
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default()
    }

    /// Canonical snapshot of an execution's scope, for checkpointing.
    pub fn snapshot(&self, execution_id: &str) -> BTreeMap<String, Value> {
        self.executions
            .read()
            .get(execution_id)
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default()
    }

    /// Replace an execution's scope from a checkpoint snapshot.
    pub fn restore(&self, execution_id: &str, snapshot: &BTreeMap<String, Value>) {
        let mut executions = self.executions.write();
        executions.insert(
            execution_id.to_string(),
            snapshot
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        );
    }

    /// Drop every key of a finished execution.
    pub fn drop_execution(&self, execution_id: &str) {
        self.executions.write().remove(execution_id);
    }
}
