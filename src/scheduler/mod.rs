//! Operation scheduler: admission, preconditions and bounded execution.
//!
//! The scheduler persists each operation before its action runs, lets the
//! gate decide whether the resource's history admits it, and then executes
//! the action either on the caller's task (`schedule_sync`) or on a worker
//! drawn from a bounded pool (`schedule_async`). Whatever the action does,
//! the reconciler runs afterwards and settles the operation record.

use std::any::Any;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use crate::{
    Action, Operation, OperationState, Resource, RunContext, SchedulerError,
    TransactionalRepository,
};

pub(crate) mod gate;
mod reconcile;

/// Scheduler tuning knobs.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Maximum run time of an async action. Doubles as the abandon
    /// threshold: an in-progress operation whose heartbeat is older than
    /// this no longer blocks new work.
    pub action_timeout: Duration,
    /// Window after `deletion_scheduled` during which orphan mitigation
    /// keeps rescheduling the delete.
    pub reconciliation_operation_timeout: Duration,
    /// Delay between a failed action and the mitigation re-admission.
    pub rescheduling_interval: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            action_timeout: Duration::from_secs(12 * 60 * 60),
            reconciliation_operation_timeout: Duration::from_secs(7 * 24 * 60 * 60),
            rescheduling_interval: Duration::from_secs(10),
        }
    }
}

impl Settings {
    /// Reject configurations that would disable scheduling entirely.
    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.action_timeout.is_zero() {
            return Err(SchedulerError::internal(
                "validate settings: action timeout must be positive",
            ));
        }
        if self.reconciliation_operation_timeout.is_zero() {
            return Err(SchedulerError::internal(
                "validate settings: reconciliation operation timeout must be positive",
            ));
        }
        if self.rescheduling_interval.is_zero() {
            return Err(SchedulerError::internal(
                "validate settings: rescheduling interval must be positive",
            ));
        }
        Ok(())
    }
}

/// Stores operations and runs their actions, synchronously or on a bounded
/// worker pool. Cheap to clone; clones share the pool, the lifecycle token
/// and the tracker.
#[derive(Clone)]
pub struct Scheduler {
    lifecycle: CancellationToken,
    repository: Arc<dyn TransactionalRepository>,
    workers: Arc<Semaphore>,
    action_timeout: Duration,
    reconciliation_operation_timeout: Duration,
    rescheduling_delay: Duration,
    tracker: TaskTracker,
}

impl Scheduler {
    /// Construct a scheduler.
    ///
    /// `lifecycle` is the process lifecycle token: cancelling it cuts every
    /// in-flight action deadline short and aborts pending mitigation
    /// delays. `tracker` counts spawned workers so shutdown can drain them
    /// with `tracker.close()` + `tracker.wait()`.
    ///
    /// # Panics
    ///
    /// Panics when `settings` fail [`Settings::validate`]: a zero
    /// `action_timeout` would blind the concurrency gate's in-progress
    /// detection, and a zero mitigation window or delay would disable
    /// orphan mitigation.
    pub fn new(
        lifecycle: CancellationToken,
        repository: Arc<dyn TransactionalRepository>,
        settings: &Settings,
        pool_size: usize,
        tracker: TaskTracker,
    ) -> Self {
        if let Err(err) = settings.validate() {
            panic!("invalid scheduler settings: {err}");
        }

        // Install a default subscriber if none set (ok to call many times)
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info".into()),
            )
            .try_init();

        Self {
            lifecycle,
            repository,
            workers: Arc::new(Semaphore::new(pool_size)),
            action_timeout: settings.action_timeout,
            reconciliation_operation_timeout: settings.reconciliation_operation_timeout,
            rescheduling_delay: settings.rescheduling_interval,
            tracker,
        }
    }

    /// Store the operation and run `action` on the caller's task.
    ///
    /// `ctx` is the caller's cancellation token; it reaches the action
    /// through its [`RunContext`] but is deliberately not consulted during
    /// post-action reconciliation: the record must reach a terminal state
    /// even if the client hung up. The caller owns the action deadline; no
    /// timeout is applied here.
    pub async fn schedule_sync(
        &self,
        ctx: CancellationToken,
        operation: Operation,
        action: impl Action,
    ) -> Result<Option<Box<dyn Resource>>, SchedulerError> {
        self.log_admission(&operation, false);

        let mut operation = operation;
        self.execute_preconditions(&mut operation).await?;

        let run_ctx = RunContext::new(operation.clone(), ctx);
        let result = action
            .run(run_ctx.clone(), Arc::clone(&self.repository))
            .await;
        operation
            .transitive_resources
            .extend(run_ctx.take_transitive_resources());

        let (object, action_error) = match result {
            Ok(object) => (object, None),
            Err(err) => {
                error!(
                    target: "opsched::scheduler",
                    operation_id = %operation.id,
                    op_type = %operation.op_type,
                    resource_type = %operation.resource_type,
                    resource_id = %operation.resource_id,
                    correlation_id = %operation.correlation_id,
                    error = %err,
                    "failed to execute action"
                );
                (None, Some(err))
            }
        };

        self.handle_action_response(object, action_error, &operation)
            .await
    }

    /// Admit the operation into the worker pool and return immediately.
    ///
    /// Admission is non-blocking: when all workers are busy this returns
    /// [`SchedulerError::ServiceUnavailable`] without touching storage.
    /// Every later outcome (success, failure, timeout, panic) lands on
    /// the operation record.
    pub async fn schedule_async(
        &self,
        operation: Operation,
        action: impl Action,
    ) -> Result<(), SchedulerError> {
        self.schedule_async_dyn(operation, Arc::new(action)).await
    }

    // Boxed so the mitigation path in the reconciler can re-enter it.
    pub(crate) fn schedule_async_dyn(
        &self,
        operation: Operation,
        action: Arc<dyn Action>,
    ) -> Pin<Box<dyn Future<Output = Result<(), SchedulerError>> + Send + '_>> {
        Box::pin(async move {
            let permit = match Arc::clone(&self.workers).try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    info!(
                        target: "opsched::scheduler",
                        operation_id = %operation.id,
                        op_type = %operation.op_type,
                        correlation_id = %operation.correlation_id,
                        "failed to schedule operation - all workers are busy"
                    );
                    return Err(SchedulerError::ServiceUnavailable);
                }
            };

            self.log_admission(&operation, true);

            let mut operation = operation;
            if let Err(err) = self.execute_preconditions(&mut operation).await {
                drop(permit);
                return Err(err);
            }

            let scheduler = self.clone();
            self.tracker.spawn(async move {
                let _permit = permit;
                scheduler.run_worker(operation, action).await;
            });

            Ok(())
        })
    }

    /// Worker body: deadline-bounded action execution, panic capture, then
    /// reconciliation.
    async fn run_worker(self, operation: Operation, action: Arc<dyn Action>) {
        let deadline = self.lifecycle.child_token();
        let ctx = RunContext::new(operation.clone(), deadline.clone());

        // The action runs in its own task so a panicking action cannot take
        // the worker down with it; the join error carries the payload.
        let mut run = {
            let ctx = ctx.clone();
            let action = Arc::clone(&action);
            let repository = Arc::clone(&self.repository);
            tokio::spawn(async move { action.run(ctx, repository).await })
        };

        enum RunOutcome {
            Joined(Result<Result<Option<Box<dyn Resource>>, SchedulerError>, tokio::task::JoinError>),
            Shutdown,
            TimedOut,
        }

        let outcome = tokio::select! {
            joined = &mut run => RunOutcome::Joined(joined),
            () = deadline.cancelled() => RunOutcome::Shutdown,
            () = tokio::time::sleep(self.action_timeout) => RunOutcome::TimedOut,
        };

        let joined = match outcome {
            RunOutcome::Joined(joined) => joined,
            RunOutcome::Shutdown => {
                run.abort();
                Ok(Err(SchedulerError::Shutdown))
            }
            RunOutcome::TimedOut => {
                deadline.cancel();
                run.abort();
                Ok(Err(SchedulerError::Timeout {
                    after: self.action_timeout,
                }))
            }
        };

        let result = match joined {
            Ok(result) => result,
            Err(join_err) => {
                let message = if join_err.is_panic() {
                    panic_message(join_err.into_panic())
                } else {
                    "worker task cancelled".to_string()
                };
                self.fail_interrupted(&operation, &message).await;
                return;
            }
        };

        let mut operation = operation;
        operation
            .transitive_resources
            .extend(ctx.take_transitive_resources());

        let (object, action_error) = match result {
            Ok(object) => (object, None),
            Err(err) => {
                error!(
                    target: "opsched::scheduler",
                    operation_id = %operation.id,
                    op_type = %operation.op_type,
                    resource_type = %operation.resource_type,
                    resource_id = %operation.resource_id,
                    correlation_id = %operation.correlation_id,
                    error = %err,
                    "failed to execute action"
                );
                (None, Some(err))
            }
        };

        if let Err(err) = self
            .handle_action_response(object, action_error, &operation)
            .await
        {
            error!(
                target: "opsched::scheduler",
                operation_id = %operation.id,
                correlation_id = %operation.correlation_id,
                error = %err,
                "post-action reconciliation failed"
            );
        }
    }

    /// A panicking action leaves the operation failed with a synthetic
    /// internal error rather than stuck in progress.
    async fn fail_interrupted(&self, operation: &Operation, message: &str) {
        error!(
            target: "opsched::scheduler",
            operation_id = %operation.id,
            correlation_id = %operation.correlation_id,
            panic = %message,
            "action panicked while executing"
        );

        let mut op = match self.repository.operation(&operation.id).await {
            Ok(op) => op,
            Err(err) => {
                error!(
                    target: "opsched::scheduler",
                    operation_id = %operation.id,
                    error = %err,
                    "failed to re-fetch operation after panic"
                );
                operation.clone()
            }
        };

        if let Err(err) = reconcile::update_operation_state(
            &*self.repository,
            &mut op,
            OperationState::Failed,
            Some(SchedulerError::job_interrupted().as_payload()),
        )
        .await
        {
            error!(
                target: "opsched::scheduler",
                operation_id = %operation.id,
                error = %err,
                "failed to mark interrupted operation as failed"
            );
        }
    }

    /// Reject terminal input, validate, gate against the resource's last
    /// operation, then persist the admitted operation. `operation` is
    /// replaced with the stored copy.
    async fn execute_preconditions(
        &self,
        operation: &mut Operation,
    ) -> Result<(), SchedulerError> {
        if operation.state == OperationState::Succeeded {
            return Err(SchedulerError::invalid(
                "scheduling of operations in state succeeded is not allowed",
            ));
        }
        operation.validate()?;

        let last = self
            .repository
            .last_operation(&operation.resource_id)
            .await
            .map_err(|err| SchedulerError::storage("operation", err))?;

        if let Some(last) = &last {
            if let Err(err) = gate::check_concurrent_operations(
                last,
                operation,
                SystemTime::now(),
                self.action_timeout,
            ) {
                warn!(
                    target: "opsched::scheduler",
                    operation_id = %operation.id,
                    resource_id = %operation.resource_id,
                    correlation_id = %operation.correlation_id,
                    last_operation_id = %last.id,
                    last_op_type = %last.op_type,
                    last_state = %last.state,
                    error = %err,
                    "concurrent operation has been rejected"
                );
                return Err(err);
            }
        }

        self.store_or_update_operation(operation, last.as_ref())
            .await
    }

    async fn store_or_update_operation(
        &self,
        operation: &mut Operation,
        last: Option<&Operation>,
    ) -> Result<(), SchedulerError> {
        // a new operation is stored; a re-drive of an existing one is
        // updated in place so other maintainers can see it is being worked
        let is_new = last.map_or(true, |last| last.id != operation.id);
        if is_new {
            info!(
                target: "opsched::scheduler",
                operation_id = %operation.id,
                op_type = %operation.op_type,
                correlation_id = %operation.correlation_id,
                "storing operation"
            );
            *operation = self
                .repository
                .create_operation(operation)
                .await
                .map_err(|err| SchedulerError::storage("operation", err))?;
        } else if operation.reschedule || operation.deletion_scheduled.is_some() {
            info!(
                target: "opsched::scheduler",
                operation_id = %operation.id,
                op_type = %operation.op_type,
                correlation_id = %operation.correlation_id,
                "updating rescheduled operation"
            );
            *operation = self
                .repository
                .update_operation(operation)
                .await
                .map_err(|err| SchedulerError::storage("operation", err))?;
        } else {
            return Err(SchedulerError::invalid(
                "operation with this id was already executed",
            ));
        }

        Ok(())
    }

    fn log_admission(&self, operation: &Operation, asynchronous: bool) {
        let kind = if operation.reschedule {
            "rescheduling"
        } else if operation.deletion_scheduled.is_some() {
            "scheduling orphan mitigation for"
        } else {
            "scheduling new"
        };
        let mode = if asynchronous { "async" } else { "sync" };
        info!(
            target: "opsched::scheduler",
            operation_id = %operation.id,
            op_type = %operation.op_type,
            resource_type = %operation.resource_type,
            resource_id = %operation.resource_id,
            correlation_id = %operation.correlation_id,
            "{kind} {mode} operation"
        );
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "action panicked".to_string()
    }
}
