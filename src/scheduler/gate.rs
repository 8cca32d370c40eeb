//! Admission gate: decides whether a new operation may run given the last
//! operation recorded for the same resource.
//!
//! The verdict is a pure function of the two operations, the current time
//! and the configured action timeout, which keeps the policy table-driven
//! testable and free of any storage coupling.

use std::time::{Duration, SystemTime};

use crate::{Operation, OperationState, OperationType, SchedulerError};

const CONCURRENT_IN_PROGRESS: &str = "Another concurrent operation in progress for this resource";
const DELETION_IN_PROGRESS: &str = "Deletion is currently in progress for this resource";

/// Decide whether `new` may be admitted while `last` is the most recent
/// operation on the resource. `Ok(())` admits; the error is the typed
/// conflict returned to the caller.
pub(crate) fn check_concurrent_operations(
    last: &Operation,
    new: &Operation,
    now: SystemTime,
    action_timeout: Duration,
) -> Result<(), SchedulerError> {
    let is_deletion_scheduled = last.deletion_scheduled.is_some();

    // For the outside world the job timeout has expired if the last heartbeat
    // happened more than the action timeout ago: an old updated_at means
    // nobody has been processing this operation, so it no longer blocks.
    let is_last_in_progress = last.state == OperationState::InProgress
        && now < last.updated_at + action_timeout;

    // both sides cooperating on the same logical long-running action
    let is_reschedule = last.reschedule && new.reschedule;

    let rejected = match (last.op_type, new.op_type) {
        // overlapping creates are rejected unless the new submission is a
        // cooperative reschedule or a scheduled mitigation; it is up to the
        // client to keep such re-drives from overlapping each other
        (OperationType::Create, OperationType::Create) => {
            is_last_in_progress && !is_deletion_scheduled && !is_reschedule
        }
        // updating something that is not yet created makes no sense
        (OperationType::Create, OperationType::Update) => is_last_in_progress,
        // deletes may always preempt an in-flight create
        (OperationType::Create, OperationType::Delete) => false,

        // creating something that is being updated makes no sense either
        (OperationType::Update, OperationType::Create) => is_last_in_progress,
        (OperationType::Update, OperationType::Update) => {
            is_last_in_progress && !is_deletion_scheduled && !is_reschedule
        }
        (OperationType::Update, OperationType::Delete) => false,

        // while a delete runs or is scheduled, only its own re-drives pass
        (OperationType::Delete, OperationType::Create)
        | (OperationType::Delete, OperationType::Update) => {
            is_last_in_progress || is_deletion_scheduled
        }
        (OperationType::Delete, OperationType::Delete) => {
            is_last_in_progress && !is_deletion_scheduled && !is_reschedule
        }
    };

    if rejected {
        let description = match last.op_type {
            OperationType::Delete => DELETION_IN_PROGRESS,
            _ => CONCURRENT_IN_PROGRESS,
        };
        return Err(SchedulerError::concurrent(description));
    }

    Ok(())
}
