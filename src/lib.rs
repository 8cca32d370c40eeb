//! # Opsched: operation scheduling for control-plane services
//!
//! Opsched mediates CREATE / UPDATE / DELETE actions against stored resources
//! (service instances, bindings, brokers). Every requested action is persisted
//! as an [`Operation`] record before it runs, admission is gated by the
//! resource's operation history, execution happens synchronously or under a
//! bounded async worker pool, and a post-action reconciler transitions the
//! record to a terminal state, scheduling a delayed *orphan mitigation*
//! delete when a failed operation had a deletion pending.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use opsched::storage::InMemoryRepository;
//! use opsched::{FnAction, Operation, OperationType, Scheduler, Settings};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//! use tokio_util::task::TaskTracker;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // 1. A repository holds resources and operation records. The in-memory
//! //    implementation is suitable for tests and embedded use.
//! let repository = Arc::new(InMemoryRepository::new());
//!
//! // 2. Construct the scheduler with a lifecycle token (cancel it on
//! //    shutdown) and a task tracker (wait on it to drain workers).
//! let lifecycle = CancellationToken::new();
//! let tracker = TaskTracker::new();
//! let scheduler = Scheduler::new(
//!     lifecycle.clone(),
//!     repository.clone(),
//!     &Settings::default(),
//!     10,
//!     tracker.clone(),
//! );
//!
//! // 3. Schedule an operation with the action that performs it.
//! let operation = Operation::new("op-1", OperationType::Create, "binding", "binding-1");
//! scheduler
//!     .schedule_async(
//!         operation,
//!         FnAction(|ctx: opsched::RunContext, repository: Arc<dyn opsched::TransactionalRepository>| async move {
//!             // ... create the binding through `repository` ...
//!             # let _ = (ctx, repository);
//!             Ok(None)
//!         }),
//!     )
//!     .await?;
//!
//! // 4. On shutdown: stop accepting work, cancel in-flight deadlines, drain.
//! lifecycle.cancel();
//! tracker.close();
//! tracker.wait().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Key Concepts
//!
//! - **Operations**: persisted intent records, one per requested action. The
//!   most recent operation for a resource (by `paging_sequence`) decides
//!   whether a new one may be admitted.
//! - **Actions**: caller-supplied handlers that perform the repository
//!   mutation for an operation. The scheduler owns everything around them:
//!   admission, deadlines, reconciliation, mitigation.
//! - **Reschedule**: a cooperative flag; while set, a successful action
//!   return keeps the operation `InProgress` for an external driver to
//!   re-enter.
//! - **Orphan mitigation**: a failed operation with `deletion_scheduled` set
//!   is re-driven after a delay with a synthesized delete action, keeping its
//!   original id so the gate recognizes the re-drive.
//! - **Heartbeat**: every operation write bumps `updated_at`. An in-progress
//!   operation whose `updated_at` is older than the configured action timeout
//!   is treated as abandoned and stops blocking new work, which is how a
//!   crashed peer's operations are recovered across processes.

use std::any::Any;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

pub mod scheduler;
pub mod storage;

pub use scheduler::{Scheduler, Settings};
pub use storage::{Repository, StorageError, TransactionalRepository};

/// A boxed error that can cross task boundaries. Actions and transaction
/// closures use this at their seams, as is conventional in async Rust.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// The kind of mutation an operation performs on its resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Create,
    Update,
    Delete,
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationType::Create => write!(f, "create"),
            OperationType::Update => write!(f, "update"),
            OperationType::Delete => write!(f, "delete"),
        }
    }
}

/// Lifecycle state of an operation. `Succeeded` and `Failed` are terminal:
/// a terminal operation is never re-dispatched, though a new operation with
/// a fresh id may target the same resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    InProgress,
    Succeeded,
    Failed,
}

impl fmt::Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationState::InProgress => write!(f, "in progress"),
            OperationState::Succeeded => write!(f, "succeeded"),
            OperationState::Failed => write!(f, "failed"),
        }
    }
}

/// A resource whose `ready` flag moves in lock-step with the primary
/// resource of an operation. Only peers recorded with
/// [`OperationType::Create`] are flipped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelatedResource {
    pub id: String,
    pub resource_type: String,
    pub op_type: OperationType,
}

/// A persisted intent record for a single CREATE/UPDATE/DELETE on one
/// resource.
///
/// `updated_at` doubles as a liveness beacon: every write through the
/// repository bumps it, and the concurrency gate treats an in-progress
/// operation whose beacon is older than the action timeout as abandoned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub id: String,
    pub created_at: SystemTime,
    pub updated_at: SystemTime,
    #[serde(rename = "type")]
    pub op_type: OperationType,
    pub state: OperationState,
    pub resource_id: String,
    pub resource_type: String,
    /// Cooperative flag: the action wants to be driven to completion across
    /// multiple invocations. While set, a successful return keeps the
    /// operation `InProgress`.
    pub reschedule: bool,
    /// When set, any outcome must be mitigated by deleting the resource,
    /// up to the configured reconciliation window from this timestamp.
    pub deletion_scheduled: Option<SystemTime>,
    /// Structured error payload, written at most once per operation. The
    /// first observed error wins; later failures are logged but not stored.
    pub errors: Option<serde_json::Value>,
    /// Resources whose `ready` flag is coupled to the primary's lifecycle.
    pub transitive_resources: Vec<RelatedResource>,
    /// Opaque id carried into every log event for this operation.
    pub correlation_id: String,
    /// Monotonic sequence assigned by the store on create; the greatest
    /// value per resource identifies the "last operation" for gating.
    pub paging_sequence: u64,
}

impl Operation {
    /// A fresh `InProgress` operation with both timestamps set to now.
    pub fn new(
        id: impl Into<String>,
        op_type: OperationType,
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
    ) -> Self {
        let now = SystemTime::now();
        Self {
            id: id.into(),
            created_at: now,
            updated_at: now,
            op_type,
            state: OperationState::InProgress,
            resource_id: resource_id.into(),
            resource_type: resource_type.into(),
            reschedule: false,
            deletion_scheduled: None,
            errors: None,
            transitive_resources: Vec::new(),
            correlation_id: String::new(),
            paging_sequence: 0,
        }
    }

    /// Domain validation run before an operation is admitted.
    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.id.is_empty() {
            return Err(SchedulerError::invalid("operation id is missing"));
        }
        if self.resource_id.is_empty() {
            return Err(SchedulerError::invalid("operation resource id is missing"));
        }
        if self.resource_type.is_empty() {
            return Err(SchedulerError::invalid(
                "operation resource type is missing",
            ));
        }
        if let Some(scheduled_at) = self.deletion_scheduled {
            if scheduled_at < self.created_at {
                return Err(SchedulerError::invalid(
                    "operation deletion cannot be scheduled before the operation was created",
                ));
            }
        }
        Ok(())
    }
}

/// A domain entity the scheduler can flip between ready and not-ready.
///
/// Implementations are stored as trait objects in the repository; actions
/// return them, and callers downcast through [`Resource::as_any`] when they
/// need the concrete type back.
pub trait Resource: Send + Sync + fmt::Debug {
    fn id(&self) -> &str;
    fn type_name(&self) -> &str;
    fn ready(&self) -> bool;
    fn set_ready(&mut self, ready: bool);
    /// Clone into a fresh box; gives `Box<dyn Resource>` a `Clone` impl.
    fn clone_resource(&self) -> Box<dyn Resource>;
    fn as_any(&self) -> &dyn Any;
}

impl Clone for Box<dyn Resource> {
    fn clone(&self) -> Self {
        self.clone_resource()
    }
}

/// Execution context handed to an [`Action`].
///
/// Carries the stored operation the action runs under and a cancellation
/// token: for async runs the token trips when the action deadline elapses or
/// the process lifecycle ends; for sync runs it is the caller's own token.
/// Cooperative actions should observe it at their own suspension points.
#[derive(Clone)]
pub struct RunContext {
    operation: Operation,
    cancellation: CancellationToken,
    added_transitive: Arc<Mutex<Vec<RelatedResource>>>,
}

impl RunContext {
    pub(crate) fn new(operation: Operation, cancellation: CancellationToken) -> Self {
        Self {
            operation,
            cancellation,
            added_transitive: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// The operation this action is running under, as stored at admission.
    pub fn operation(&self) -> &Operation {
        &self.operation
    }

    /// Correlation id of the current operation.
    pub fn correlation_id(&self) -> &str {
        &self.operation.correlation_id
    }

    /// Record a resource whose `ready` flag must follow the primary's.
    /// The reconciler merges these onto the operation after the action
    /// returns.
    pub fn add_transitive_resource(&self, resource: RelatedResource) {
        self.added_transitive
            .lock()
            .expect("transitive resource list lock poisoned")
            .push(resource);
    }

    pub(crate) fn take_transitive_resources(&self) -> Vec<RelatedResource> {
        std::mem::take(
            &mut *self
                .added_transitive
                .lock()
                .expect("transitive resource list lock poisoned"),
        )
    }

    /// Check if cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Future that completes when cancellation is requested, for use with
    /// `tokio::select!`.
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await
    }

    /// Clone of the token, for tasks the action spawns itself.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }
}

/// Caller-supplied handler that performs the repository mutation for an
/// operation. Returns the affected object, if the mutation produces one.
#[async_trait]
pub trait Action: Send + Sync + 'static {
    async fn run(
        &self,
        ctx: RunContext,
        repository: Arc<dyn TransactionalRepository>,
    ) -> Result<Option<Box<dyn Resource>>, SchedulerError>;
}

/// Function wrapper that implements [`Action`].
pub struct FnAction<F, Fut>(pub F)
where
    F: Fn(RunContext, Arc<dyn TransactionalRepository>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<Option<Box<dyn Resource>>, SchedulerError>>
        + Send
        + 'static;

#[async_trait]
impl<F, Fut> Action for FnAction<F, Fut>
where
    F: Fn(RunContext, Arc<dyn TransactionalRepository>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<Option<Box<dyn Resource>>, SchedulerError>>
        + Send
        + 'static,
{
    async fn run(
        &self,
        ctx: RunContext,
        repository: Arc<dyn TransactionalRepository>,
    ) -> Result<Option<Box<dyn Resource>>, SchedulerError> {
        (self.0)(ctx, repository).await
    }
}

/// Scheduler error taxonomy.
///
/// Callers can distinguish retryable admission failures (gate conflicts,
/// pool saturation) from client-fatal validation errors and from failures
/// the scheduler recorded on the operation itself.
#[derive(Debug)]
pub enum SchedulerError {
    /// The concurrency gate rejected the operation; retry later.
    ConcurrentOperationInProgress { description: String },

    /// All workers are busy; retry later.
    ServiceUnavailable,

    /// The operation failed domain validation, was submitted in a terminal
    /// state, or re-used an already-executed id.
    InvalidOperation { message: String },

    /// A repository call failed; `entity` names what was being touched.
    Storage { entity: String, source: StorageError },

    /// An async action outlived its configured deadline.
    Timeout { after: Duration },

    /// The process lifecycle ended while the action or a pending mitigation
    /// delay was in flight.
    Shutdown,

    /// Internal scheduler failure, including the synthetic "job interrupted"
    /// recorded when a worker panics.
    Internal { message: String },

    /// Orphan mitigation could not be re-admitted after an action failure;
    /// composes both messages.
    Broker {
        action_error: String,
        mitigation_error: String,
    },

    /// Opaque error returned by a caller-supplied action.
    Action(BoxError),
}

impl SchedulerError {
    pub fn invalid(message: impl Into<String>) -> Self {
        SchedulerError::InvalidOperation {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        SchedulerError::Internal {
            message: message.into(),
        }
    }

    pub fn storage(entity: impl Into<String>, source: StorageError) -> Self {
        SchedulerError::Storage {
            entity: entity.into(),
            source,
        }
    }

    pub(crate) fn concurrent(description: &str) -> Self {
        SchedulerError::ConcurrentOperationInProgress {
            description: description.to_string(),
        }
    }

    pub(crate) fn job_interrupted() -> Self {
        SchedulerError::internal("job interrupted")
    }

    /// Stable error class name, also used as the `error` field of the
    /// payload stored on failed operations.
    pub fn error_type(&self) -> &'static str {
        match self {
            SchedulerError::ConcurrentOperationInProgress { .. } => "ConcurrentOperationInProgress",
            SchedulerError::ServiceUnavailable => "ServiceUnavailable",
            SchedulerError::InvalidOperation { .. } => "BadRequest",
            SchedulerError::Storage { .. } => "StorageError",
            SchedulerError::Timeout { .. } => "Timeout",
            SchedulerError::Shutdown => "Shutdown",
            SchedulerError::Internal { .. } => "InternalServerError",
            SchedulerError::Broker { .. } => "BrokerError",
            SchedulerError::Action(_) => "ActionError",
        }
    }

    /// Whether the caller may retry the same submission.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SchedulerError::ConcurrentOperationInProgress { .. }
                | SchedulerError::ServiceUnavailable
        )
    }

    /// The `{"error", "description"}` payload persisted into
    /// [`Operation::errors`].
    pub fn as_payload(&self) -> serde_json::Value {
        serde_json::json!({
            "error": self.error_type(),
            "description": self.to_string(),
        })
    }
}

impl fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedulerError::ConcurrentOperationInProgress { description } => {
                write!(f, "{description}")
            }
            SchedulerError::ServiceUnavailable => write!(
                f,
                "Failed to schedule job. Server is busy - try again in a few minutes."
            ),
            SchedulerError::InvalidOperation { message } => write!(f, "{message}"),
            SchedulerError::Storage { entity, source } => {
                write!(f, "storage error for {entity}: {source}")
            }
            SchedulerError::Timeout { after } => {
                write!(f, "action did not complete within {after:?}")
            }
            SchedulerError::Shutdown => write!(f, "scheduler is shutting down"),
            SchedulerError::Internal { message } => write!(f, "{message}"),
            SchedulerError::Broker {
                action_error,
                mitigation_error,
            } => write!(
                f,
                "job failed with {action_error} and orphan mitigation failed with {mitigation_error}"
            ),
            SchedulerError::Action(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for SchedulerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SchedulerError::Storage { source, .. } => Some(source),
            SchedulerError::Action(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}
