//! ReDB state store
//!
//! Local embedded database for hosts that tick steps from a single
//! process. All scopes share one table; keys are `"{scope}/{key}"`.

use crate::error::{Result, StepError};
use crate::store::{StateScope, StateStore};
use async_trait::async_trait;
use redb::{Database, ReadableDatabase, TableDefinition};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;

const STATE_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("step_state");

/// ReDB storage backend
pub struct RedbStateStore {
    db: Arc<Database>,
}

impl RedbStateStore {
    /// Open or create a ReDB database at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = Database::create(path)
            .map_err(|e| StepError::Store(format!("failed to open database: {}", e)))?;

        let write_txn = db
            .begin_write()
            .map_err(|e| StepError::Store(format!("failed to begin transaction: {}", e)))?;
        write_txn
            .open_table(STATE_TABLE)
            .map_err(|e| StepError::Store(format!("failed to create state table: {}", e)))?;
        write_txn
            .commit()
            .map_err(|e| StepError::Store(format!("failed to commit: {}", e)))?;

        Ok(Self { db: Arc::new(db) })
    }

    fn entry_key(key: &str, scope: &StateScope) -> String {
        format!("{}/{}", scope.namespace(), key)
    }
}

impl std::fmt::Debug for RedbStateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbStateStore").finish_non_exhaustive()
    }
}

#[async_trait]
impl StateStore for RedbStateStore {
    async fn get(&self, key: &str, scope: &StateScope) -> Result<Option<Value>> {
        let entry_key = Self::entry_key(key, scope);

        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| StepError::Store(format!("failed to begin read: {}", e)))?;
        let table = read_txn
            .open_table(STATE_TABLE)
            .map_err(|e| StepError::Store(format!("failed to open table: {}", e)))?;

        match table.get(entry_key.as_str()) {
            Ok(Some(bytes)) => Ok(Some(serde_json::from_slice(bytes.value())?)),
            Ok(None) => Ok(None),
            Err(e) => Err(StepError::Store(format!("get failed: {}", e))),
        }
    }

    async fn set(&self, key: &str, scope: &StateScope, value: Value) -> Result<()> {
        let entry_key = Self::entry_key(key, scope);
        let bytes = serde_json::to_vec(&value)?;

        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| StepError::Store(format!("failed to begin write: {}", e)))?;
        {
            let mut table = write_txn
                .open_table(STATE_TABLE)
                .map_err(|e| StepError::Store(format!("failed to open table: {}", e)))?;
            table
                .insert(entry_key.as_str(), bytes.as_slice())
                .map_err(|e| StepError::Store(format!("insert failed: {}", e)))?;
        }
        write_txn
            .commit()
            .map_err(|e| StepError::Store(format!("failed to commit: {}", e)))?;

        Ok(())
    }
}
