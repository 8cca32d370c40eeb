//! Repository contract consumed by the scheduler.
//!
//! The scheduler owns no domain state of its own; resources and operation
//! records live behind [`Repository`], and the post-action reconciler uses
//! [`TransactionalRepository::in_transaction`] to move the
//! `(resource.ready, operation.state)` pair atomically.
//!
//! # Implementation notes
//!
//! - `last_operation` must return the operation with the **greatest**
//!   `paging_sequence` for the resource; a miss is `Ok(None)`, not an error.
//! - `create_operation` assigns `paging_sequence`. Sequences must be
//!   monotonic per store so operation history orders correctly.
//! - `update_operation` must bump `updated_at` on every write. The bumped
//!   timestamp is the liveness beacon the concurrency gate reads to decide
//!   whether an in-progress operation has been abandoned by its process.
//! - `in_transaction` hands the closure a transactional view; all writes
//!   made through it commit together or roll back together.

use std::future::Future;
use std::pin::Pin;

use async_trait::async_trait;

use crate::{BoxError, Operation, Resource};

pub mod error;
pub mod in_memory;

pub use error::StorageError;
pub use in_memory::InMemoryRepository;

/// Future returned by a transaction closure.
pub type TxFuture<'a> = Pin<Box<dyn Future<Output = Result<(), BoxError>> + Send + 'a>>;

/// Closure executed against a transactional repository view.
pub type TransactionFn<'a> = Box<dyn FnOnce(&'a dyn Repository) -> TxFuture<'a> + Send + 'a>;

/// Storage operations for resources and operation records.
#[async_trait]
pub trait Repository: Send + Sync {
    /// Fetch a resource by type and id.
    async fn get(&self, resource_type: &str, id: &str) -> Result<Box<dyn Resource>, StorageError>;

    /// Store a new resource; returns the stored copy.
    async fn create(&self, resource: Box<dyn Resource>) -> Result<Box<dyn Resource>, StorageError>;

    /// Replace an existing resource; returns the stored copy.
    async fn update(&self, resource: Box<dyn Resource>) -> Result<Box<dyn Resource>, StorageError>;

    /// Remove a resource by type and id.
    async fn delete(&self, resource_type: &str, id: &str) -> Result<(), StorageError>;

    /// Fetch an operation record by id.
    async fn operation(&self, id: &str) -> Result<Operation, StorageError>;

    /// The operation with the greatest `paging_sequence` for the resource,
    /// or `None` when the resource has no history.
    async fn last_operation(&self, resource_id: &str) -> Result<Option<Operation>, StorageError>;

    /// Store a new operation record, assigning its `paging_sequence`.
    async fn create_operation(&self, operation: &Operation) -> Result<Operation, StorageError>;

    /// Replace an existing operation record, bumping `updated_at`.
    async fn update_operation(&self, operation: &Operation) -> Result<Operation, StorageError>;
}

/// A repository that can compose writes atomically.
#[async_trait]
pub trait TransactionalRepository: Repository {
    /// Run `f` against a transactional view. All writes commit together;
    /// an `Err` from the closure rolls every one of them back.
    async fn in_transaction<'a>(&'a self, f: TransactionFn<'a>) -> Result<(), BoxError>;
}
