//! Post-action reconciliation.
//!
//! Whatever an action did (returned, failed, timed out), the reconciler
//! runs afterwards and settles the operation record: terminal transitions
//! happen in one repository transaction together with any `ready` flips,
//! and a failed operation with a pending deletion is re-driven through the
//! public async entry point after the configured delay.

use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use tracing::{debug, info};

use crate::storage::Repository;
use crate::{
    Action, BoxError, FnAction, Operation, OperationState, OperationType, RelatedResource,
    Resource, RunContext, SchedulerError, TransactionalRepository,
};

use super::Scheduler;

impl Scheduler {
    /// Re-read the operation, merge what the action learned, and transition
    /// it. Returns the action's object on success, the settled error
    /// otherwise.
    pub(crate) async fn handle_action_response(
        &self,
        action_object: Option<Box<dyn Resource>>,
        action_error: Option<SchedulerError>,
        op_before: &Operation,
    ) -> Result<Option<Box<dyn Resource>>, SchedulerError> {
        let mut op_after = self.refetch_operation(op_before).await?;
        // the action may have grown the in-memory view; carry it onto the
        // re-fetched copy
        op_after.transitive_resources = op_before.transitive_resources.clone();

        if let Some(err) = action_error {
            Err(self.handle_failure(err, op_after).await)
        } else if op_after.reschedule {
            info!(
                target: "opsched::scheduler",
                operation_id = %op_after.id,
                op_type = %op_after.op_type,
                resource_type = %op_after.resource_type,
                resource_id = %op_after.resource_id,
                correlation_id = %op_after.correlation_id,
                "operation requires a reschedule and will be kept in progress"
            );
            Ok(action_object)
        } else {
            self.handle_success(action_object, op_after).await
        }
    }

    /// Fetch the current state of an in-flight operation. A failed re-fetch
    /// force-marks the stale copy failed so the record does not stay in
    /// progress forever.
    async fn refetch_operation(&self, operation: &Operation) -> Result<Operation, SchedulerError> {
        match self.repository.operation(&operation.id).await {
            Ok(op) => Ok(op),
            Err(err) => {
                let fetch_err = SchedulerError::internal(format!(
                    "failed to re-fetch currently executing operation with id {} from storage: {}",
                    operation.id, err
                ));
                let mut stale = operation.clone();
                if let Err(update_err) = update_operation_state(
                    &*self.repository,
                    &mut stale,
                    OperationState::Failed,
                    Some(fetch_err.as_payload()),
                )
                .await
                {
                    return Err(SchedulerError::internal(format!(
                        "setting new operation state due to error {fetch_err} failed: {update_err}"
                    )));
                }
                Err(fetch_err)
            }
        }
    }

    /// Failure path: mark the operation failed (flipping `ready` off for
    /// creates) in one transaction, then evaluate orphan mitigation.
    /// Returns the original action error unless the transition itself or
    /// the mitigation re-admission fails.
    async fn handle_failure(
        &self,
        action_error: SchedulerError,
        mut op_after: Operation,
    ) -> SchedulerError {
        let payload = action_error.as_payload();

        let tx_op = op_after.clone();
        let tx_payload = payload.clone();
        let committed = self
            .repository
            .in_transaction(Box::new(move |storage| {
                Box::pin(async move {
                    let mut tx_op = tx_op;
                    if tx_op.op_type == OperationType::Create {
                        fetch_and_update_resource(
                            storage,
                            &tx_op.resource_type,
                            &tx_op.resource_id,
                            false,
                        )
                        .await?;
                        update_transitive_resources(storage, &tx_op.transitive_resources, false)
                            .await?;
                    }
                    update_operation_state(storage, &mut tx_op, OperationState::Failed, Some(tx_payload))
                        .await?;
                    Ok(())
                })
            }))
            .await;
        if let Err(err) = committed {
            return tx_error(err);
        }

        // mirror the committed transition on the local copy
        op_after.state = OperationState::Failed;
        if op_after.errors.is_none() {
            op_after.errors = Some(payload);
        }

        // mitigation is wanted while the deletion window is still open and
        // the operation did not somehow succeed in the meantime
        let mitigation_required = op_after.deletion_scheduled.map_or(false, |scheduled_at| {
            SystemTime::now() < scheduled_at + self.reconciliation_operation_timeout
        }) && op_after.state != OperationState::Succeeded;

        if mitigation_required {
            info!(
                target: "opsched::scheduler",
                operation_id = %op_after.id,
                resource_type = %op_after.resource_type,
                resource_id = %op_after.resource_id,
                correlation_id = %op_after.correlation_id,
                delay = ?self.rescheduling_delay,
                "scheduling required delete operation after failed action"
            );
            // the delay keeps re-drives from hammering the backing service
            tokio::select! {
                () = self.lifecycle.cancelled() => return SchedulerError::Shutdown,
                () = tokio::time::sleep(self.rescheduling_delay) => {
                    let delete = deletion_action(&op_after);
                    if let Err(mitigation_err) =
                        self.schedule_async_dyn(op_after.clone(), delete).await
                    {
                        return SchedulerError::Broker {
                            action_error: action_error.to_string(),
                            mitigation_error: mitigation_err.to_string(),
                        };
                    }
                }
            }
        }

        action_error
    }

    /// Success path: settle the final state in one transaction, flipping
    /// `ready` on for a completed create. A "successful" action on an
    /// operation that was being mitigated is still a failure overall: the
    /// cleanup ran, but the user-visible intent never completed.
    async fn handle_success(
        &self,
        action_object: Option<Box<dyn Resource>>,
        mut op_after: Operation,
    ) -> Result<Option<Box<dyn Resource>>, SchedulerError> {
        let final_state = if op_after.op_type != OperationType::Delete
            && op_after.deletion_scheduled.is_some()
        {
            OperationState::Failed
        } else {
            op_after.errors = None;
            OperationState::Succeeded
        };
        // whichever way it settled, no further mitigation
        op_after.deletion_scheduled = None;

        let flip_ready =
            op_after.op_type == OperationType::Create && final_state == OperationState::Succeeded;
        let object_slot: Arc<Mutex<Option<Box<dyn Resource>>>> =
            Arc::new(Mutex::new(action_object));

        let tx_op = op_after.clone();
        let slot = Arc::clone(&object_slot);
        self.repository
            .in_transaction(Box::new(move |storage| {
                Box::pin(async move {
                    let mut tx_op = tx_op;
                    if flip_ready {
                        let seed = slot
                            .lock()
                            .expect("action object slot lock poisoned")
                            .take();
                        match seed {
                            Some(resource) => {
                                let updated = update_resource(storage, resource, true).await?;
                                *slot.lock().expect("action object slot lock poisoned") =
                                    Some(updated);
                            }
                            None => {
                                fetch_and_update_resource(
                                    storage,
                                    &tx_op.resource_type,
                                    &tx_op.resource_id,
                                    true,
                                )
                                .await?;
                            }
                        }
                        update_transitive_resources(storage, &tx_op.transitive_resources, true)
                            .await?;
                    }
                    update_operation_state(storage, &mut tx_op, final_state, None).await?;
                    Ok(())
                })
            }))
            .await
            .map_err(|err| {
                SchedulerError::internal(format!(
                    "failed to update resource ready or operation state after a successfully executed operation with id {}: {}",
                    op_after.id, err
                ))
            })?;

        info!(
            target: "opsched::scheduler",
            operation_id = %op_after.id,
            op_type = %op_after.op_type,
            resource_type = %op_after.resource_type,
            resource_id = %op_after.resource_id,
            correlation_id = %op_after.correlation_id,
            state = %final_state,
            "successfully executed operation"
        );

        let result = object_slot
            .lock()
            .expect("action object slot lock poisoned")
            .take();
        Ok(result)
    }
}

/// Transition an operation and persist it. Errors are append-once: the
/// first recorded payload is the root cause and later ones are dropped.
/// The write also bumps `updated_at`, reporting that someone is working on
/// the operation.
pub(crate) async fn update_operation_state(
    storage: &dyn Repository,
    operation: &mut Operation,
    state: OperationState,
    error_payload: Option<serde_json::Value>,
) -> Result<(), SchedulerError> {
    operation.state = state;

    if let Some(payload) = error_payload {
        if operation.errors.is_none() {
            debug!(
                target: "opsched::scheduler",
                operation_id = %operation.id,
                "recording root cause error on operation"
            );
            operation.errors = Some(payload);
        } else {
            debug!(
                target: "opsched::scheduler",
                operation_id = %operation.id,
                "operation already has a root cause error; new error will not be written"
            );
        }
    }

    match storage.update_operation(operation).await {
        Ok(stored) => {
            *operation = stored;
            info!(
                target: "opsched::scheduler",
                operation_id = %operation.id,
                state = %state,
                "updated operation state"
            );
            Ok(())
        }
        Err(err) => Err(SchedulerError::internal(format!(
            "failed to update state of operation with id {} to {}: {}",
            operation.id, state, err
        ))),
    }
}

async fn update_resource(
    storage: &dyn Repository,
    mut resource: Box<dyn Resource>,
    ready: bool,
) -> Result<Box<dyn Resource>, SchedulerError> {
    let resource_type = resource.type_name().to_string();
    let resource_id = resource.id().to_string();
    resource.set_ready(ready);
    match storage.update(resource).await {
        Ok(updated) => {
            debug!(
                target: "opsched::scheduler",
                resource_type = %resource_type,
                resource_id = %resource_id,
                ready,
                "updated resource"
            );
            Ok(updated)
        }
        Err(err) => Err(SchedulerError::internal(format!(
            "failed to update object with type {resource_type} and id {resource_id}: {err}"
        ))),
    }
}

/// Read-modify-write of a resource's `ready` flag. A missing resource is
/// an acceptable outcome here, not an error.
async fn fetch_and_update_resource(
    storage: &dyn Repository,
    resource_type: &str,
    resource_id: &str,
    ready: bool,
) -> Result<(), SchedulerError> {
    let resource = match storage.get(resource_type, resource_id).await {
        Ok(resource) => resource,
        Err(err) if err.is_not_found() => return Ok(()),
        Err(err) => {
            return Err(SchedulerError::internal(format!(
                "failed to retrieve object of type {resource_type} with id {resource_id}: {err}"
            )))
        }
    };
    update_resource(storage, resource, ready).await?;
    Ok(())
}

/// Flip `ready` on every transitive resource that was recorded for a
/// create; other peers are left alone.
async fn update_transitive_resources(
    storage: &dyn Repository,
    resources: &[RelatedResource],
    ready: bool,
) -> Result<(), SchedulerError> {
    for related in resources {
        if related.op_type == OperationType::Create {
            fetch_and_update_resource(storage, &related.resource_type, &related.id, ready).await?;
        }
    }
    Ok(())
}

/// The synthesized orphan-mitigation action: delete the operation's
/// resource, swallowing not-found.
fn deletion_action(operation: &Operation) -> Arc<dyn Action> {
    let resource_type = operation.resource_type.clone();
    let resource_id = operation.resource_id.clone();
    Arc::new(FnAction(
        move |_ctx: RunContext, repository: Arc<dyn TransactionalRepository>| {
            let resource_type = resource_type.clone();
            let resource_id = resource_id.clone();
            async move {
                match repository.delete(&resource_type, &resource_id).await {
                    Ok(()) => Ok(None),
                    Err(err) if err.is_not_found() => Ok(None),
                    Err(err) => Err(SchedulerError::storage(resource_type, err)),
                }
            }
        },
    ))
}

fn tx_error(err: BoxError) -> SchedulerError {
    match err.downcast::<SchedulerError>() {
        Ok(err) => *err,
        Err(err) => SchedulerError::internal(err.to_string()),
    }
}
