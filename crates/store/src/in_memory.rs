//! In-memory store with scripted results, for tests and offline runs.

use std::collections::HashMap;
use std::sync::Arc;

use askdb_core::{QueryExecutor, RowSet, SchemaProvider, StaticTables, StoreError};
use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::postgres::strip_terminator;

#[derive(Default)]
struct State {
    reachable: bool,
    schema: Option<Result<Option<String>, StoreError>>,
    static_tables: StaticTables,
    results: HashMap<String, Result<RowSet, StoreError>>,
    executed: Vec<String>,
}

/// A store answering from fixed data.
///
/// Queries are matched on their text with surrounding whitespace and
/// trailing semicolons removed. Unknown queries return zero rows.
#[derive(Clone)]
pub struct InMemoryStore {
    state: Arc<RwLock<State>>,
}

impl InMemoryStore {
    /// A reachable store with no schema and no data.
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(State {
                reachable: true,
                ..State::default()
            })),
        }
    }

    /// A store whose connection check fails.
    pub fn unreachable() -> Self {
        let store = Self::new();
        if let Ok(mut state) = store.state.try_write() {
            state.reachable = false;
        }
        store
    }

    pub fn with_schema(self, schema: impl Into<String>) -> Self {
        self.edit(|s| s.schema = Some(Ok(Some(schema.into()))))
    }

    pub fn with_schema_error(self, message: impl Into<String>) -> Self {
        self.edit(|s| s.schema = Some(Err(StoreError::Schema(message.into()))))
    }

    pub fn with_static_table(self, name: impl Into<String>, rows: RowSet) -> Self {
        self.edit(|s| s.static_tables.push(name, rows))
    }

    pub fn with_result(self, query: &str, rows: RowSet) -> Self {
        let key = strip_terminator(query).to_string();
        self.edit(|s| {
            s.results.insert(key, Ok(rows));
        })
    }

    pub fn with_failure(self, query: &str, message: impl Into<String>) -> Self {
        let key = strip_terminator(query).to_string();
        self.edit(|s| {
            s.results.insert(key, Err(StoreError::QueryFailed(message.into())));
        })
    }

    /// Queries executed so far, in order.
    pub async fn executed(&self) -> Vec<String> {
        self.state.read().await.executed.clone()
    }

    // Builders run before the store is shared, so the lock is uncontended.
    fn edit(self, f: impl FnOnce(&mut State)) -> Self {
        if let Ok(mut state) = self.state.try_write() {
            f(&mut state);
        }
        self
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SchemaProvider for InMemoryStore {
    async fn test_connection(&self) -> bool {
        self.state.read().await.reachable
    }

    async fn schema_description(&self) -> Result<Option<String>, StoreError> {
        let state = self.state.read().await;
        if !state.reachable {
            return Err(StoreError::Connection("store unreachable".into()));
        }
        state.schema.clone().unwrap_or(Ok(None))
    }

    async fn static_tables(&self) -> StaticTables {
        let state = self.state.read().await;
        if state.reachable {
            state.static_tables.clone()
        } else {
            StaticTables::new()
        }
    }
}

#[async_trait]
impl QueryExecutor for InMemoryStore {
    async fn execute(&self, query: &str) -> Result<RowSet, StoreError> {
        let key = strip_terminator(query).to_string();
        let mut state = self.state.write().await;
        state.executed.push(key.clone());
        if !state.reachable {
            return Err(StoreError::Connection("store unreachable".into()));
        }
        state.results.get(&key).cloned().unwrap_or_else(|| Ok(RowSet::empty()))
    }
}
