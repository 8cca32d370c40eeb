//! In-memory repository for tests and embedded use.

use std::collections::HashMap;
use std::time::SystemTime;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{Repository, StorageError, TransactionFn, TransactionalRepository};
use crate::{BoxError, Operation, Resource};

#[derive(Default, Clone)]
struct State {
    // (type, id) -> resource
    resources: HashMap<(String, String), Box<dyn Resource>>,
    operations: HashMap<String, Operation>,
    next_paging_sequence: u64,
}

/// Map-backed [`Repository`] with snapshot/rollback transactions.
///
/// Transactions are serialized against each other; a failed transaction
/// restores the pre-transaction snapshot. Concurrent non-transactional
/// writers are not isolated from a running transaction, which matches what
/// the scheduler needs and keeps the implementation small.
#[derive(Default)]
pub struct InMemoryRepository {
    state: Mutex<State>,
    tx_gate: Mutex<()>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored operation records, across all resources.
    pub async fn operation_count(&self) -> usize {
        self.state.lock().await.operations.len()
    }
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn get(&self, resource_type: &str, id: &str) -> Result<Box<dyn Resource>, StorageError> {
        let state = self.state.lock().await;
        state
            .resources
            .get(&(resource_type.to_string(), id.to_string()))
            .cloned()
            .ok_or(StorageError::NotFound)
    }

    async fn create(&self, resource: Box<dyn Resource>) -> Result<Box<dyn Resource>, StorageError> {
        let key = (resource.type_name().to_string(), resource.id().to_string());
        let mut state = self.state.lock().await;
        if state.resources.contains_key(&key) {
            return Err(StorageError::conflict(format!(
                "{} with id {} already exists",
                key.0, key.1
            )));
        }
        state.resources.insert(key, resource.clone());
        Ok(resource)
    }

    async fn update(&self, resource: Box<dyn Resource>) -> Result<Box<dyn Resource>, StorageError> {
        let key = (resource.type_name().to_string(), resource.id().to_string());
        let mut state = self.state.lock().await;
        if !state.resources.contains_key(&key) {
            return Err(StorageError::NotFound);
        }
        state.resources.insert(key, resource.clone());
        Ok(resource)
    }

    async fn delete(&self, resource_type: &str, id: &str) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        state
            .resources
            .remove(&(resource_type.to_string(), id.to_string()))
            .map(|_| ())
            .ok_or(StorageError::NotFound)
    }

    async fn operation(&self, id: &str) -> Result<Operation, StorageError> {
        let state = self.state.lock().await;
        state.operations.get(id).cloned().ok_or(StorageError::NotFound)
    }

    async fn last_operation(&self, resource_id: &str) -> Result<Option<Operation>, StorageError> {
        let state = self.state.lock().await;
        Ok(state
            .operations
            .values()
            .filter(|op| op.resource_id == resource_id)
            .max_by_key(|op| op.paging_sequence)
            .cloned())
    }

    async fn create_operation(&self, operation: &Operation) -> Result<Operation, StorageError> {
        let mut state = self.state.lock().await;
        if state.operations.contains_key(&operation.id) {
            return Err(StorageError::conflict(format!(
                "operation with id {} already exists",
                operation.id
            )));
        }
        state.next_paging_sequence += 1;
        let mut stored = operation.clone();
        stored.paging_sequence = state.next_paging_sequence;
        state.operations.insert(stored.id.clone(), stored.clone());
        Ok(stored)
    }

    async fn update_operation(&self, operation: &Operation) -> Result<Operation, StorageError> {
        let mut state = self.state.lock().await;
        let existing = state
            .operations
            .get(&operation.id)
            .ok_or(StorageError::NotFound)?;
        let mut stored = operation.clone();
        // the sequence is store-owned; the heartbeat bump is the contract
        stored.paging_sequence = existing.paging_sequence;
        stored.updated_at = SystemTime::now();
        state.operations.insert(stored.id.clone(), stored.clone());
        Ok(stored)
    }
}

#[async_trait]
impl TransactionalRepository for InMemoryRepository {
    async fn in_transaction<'a>(&'a self, f: TransactionFn<'a>) -> Result<(), BoxError> {
        let _gate = self.tx_gate.lock().await;
        let snapshot = self.state.lock().await.clone();
        match f(self).await {
            Ok(()) => Ok(()),
            Err(err) => {
                *self.state.lock().await = snapshot;
                Err(err)
            }
        }
    }
}
