mod common;

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use common::{fixture, fixture_with, operation, test_settings, wait_for_state, TestBinding};
use opsched::{
    FnAction, OperationState, OperationType, Repository, SchedulerError,
};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(2);

/// Action that creates the operation's binding and returns it.
fn create_binding_action() -> impl opsched::Action {
    FnAction(|ctx: opsched::RunContext, repository: Arc<dyn opsched::TransactionalRepository>| {
        async move {
            let id = ctx.operation().resource_id.clone();
            let binding = repository
                .create(Box::new(TestBinding::new(&id)))
                .await
                .map_err(|err| SchedulerError::storage("binding", err))?;
            Ok(Some(binding))
        }
    })
}

/// Action that deletes the operation's resource, swallowing not-found.
fn delete_binding_action() -> impl opsched::Action {
    FnAction(|ctx: opsched::RunContext, repository: Arc<dyn opsched::TransactionalRepository>| {
        async move {
            let op = ctx.operation().clone();
            match repository.delete(&op.resource_type, &op.resource_id).await {
                Ok(()) => Ok(None),
                Err(err) if err.is_not_found() => Ok(None),
                Err(err) => Err(SchedulerError::storage(op.resource_type.clone(), err)),
            }
        }
    })
}

fn failing_action(message: &'static str) -> impl opsched::Action {
    FnAction(
        move |_ctx: opsched::RunContext, _repository: Arc<dyn opsched::TransactionalRepository>| async move {
            Err(SchedulerError::Action(message.into()))
        },
    )
}

/// Action that blocks until the notify is signalled.
fn blocking_action(gate: Arc<Notify>) -> impl opsched::Action {
    FnAction(
        move |_ctx: opsched::RunContext, _repository: Arc<dyn opsched::TransactionalRepository>| {
            let gate = gate.clone();
            async move {
                gate.notified().await;
                Ok(None)
            }
        },
    )
}

// --- Happy create ----------------------------------------------------------

#[tokio::test]
async fn sync_create_succeeds_and_marks_binding_ready() {
    let f = fixture(4);
    let object = f
        .scheduler
        .schedule_sync(
            CancellationToken::new(),
            operation("o1", OperationType::Create, "r1"),
            create_binding_action(),
        )
        .await
        .unwrap()
        .expect("create returns the binding");

    let binding = object
        .as_any()
        .downcast_ref::<TestBinding>()
        .expect("a TestBinding comes back");
    assert!(binding.ready);

    let op = f.repository.operation("o1").await.unwrap();
    assert_eq!(op.state, OperationState::Succeeded);
    assert!(op.errors.is_none());
    assert!(op.deletion_scheduled.is_none());

    let stored = f.repository.get("binding", "r1").await.unwrap();
    assert!(stored.ready());
}

#[tokio::test]
async fn async_create_succeeds_and_marks_binding_ready() {
    let f = fixture(4);
    f.scheduler
        .schedule_async(
            operation("o1", OperationType::Create, "r1"),
            create_binding_action(),
        )
        .await
        .unwrap();

    let op = wait_for_state(&f.repository, "o1", OperationState::Succeeded, WAIT)
        .await
        .expect("operation reaches succeeded");
    assert!(op.errors.is_none());
    assert!(op.deletion_scheduled.is_none());
    assert!(f.repository.get("binding", "r1").await.unwrap().ready());
}

// --- Concurrent create rejection -------------------------------------------

#[tokio::test]
async fn overlapping_create_is_rejected_without_storing() {
    let f = fixture(4);
    let mut last = operation("o1", OperationType::Create, "r1");
    last.updated_at = SystemTime::now() - Duration::from_secs(1);
    f.repository.create_operation(&last).await.unwrap();

    let err = f
        .scheduler
        .schedule_sync(
            CancellationToken::new(),
            operation("o2", OperationType::Create, "r1"),
            create_binding_action(),
        )
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        SchedulerError::ConcurrentOperationInProgress { .. }
    ));
    assert!(f.repository.operation("o2").await.is_err());
    assert_eq!(f.repository.operation_count().await, 1);
}

// --- Delete preempts create ------------------------------------------------

#[tokio::test]
async fn delete_preempts_in_flight_create() {
    let f = fixture(4);
    f.repository
        .create(Box::new(TestBinding::new("r1")))
        .await
        .unwrap();
    let mut last = operation("o1", OperationType::Create, "r1");
    last.updated_at = SystemTime::now() - Duration::from_secs(1);
    f.repository.create_operation(&last).await.unwrap();

    f.scheduler
        .schedule_sync(
            CancellationToken::new(),
            operation("o2", OperationType::Delete, "r1"),
            delete_binding_action(),
        )
        .await
        .unwrap();

    let op = f.repository.operation("o2").await.unwrap();
    assert_eq!(op.state, OperationState::Succeeded);
    assert!(f.repository.get("binding", "r1").await.is_err());
}

// --- Abandoned operation recovery ------------------------------------------

#[tokio::test]
async fn abandoned_operation_is_recovered_by_new_submission() {
    let f = fixture(4);
    let mut last = operation("o1", OperationType::Create, "r1");
    last.updated_at = SystemTime::now() - Duration::from_secs(120);
    f.repository.create_operation(&last).await.unwrap();

    f.scheduler
        .schedule_sync(
            CancellationToken::new(),
            operation("o2", OperationType::Create, "r1"),
            create_binding_action(),
        )
        .await
        .unwrap();

    let op = f.repository.operation("o2").await.unwrap();
    assert_eq!(op.state, OperationState::Succeeded);
}

// --- Failure triggers orphan mitigation --------------------------------------

#[tokio::test]
async fn failed_create_with_pending_deletion_is_mitigated() {
    let f = fixture(4);
    f.repository
        .create(Box::new(TestBinding::new("r2")))
        .await
        .unwrap();

    let mut op = operation("o1", OperationType::Create, "r2");
    op.deletion_scheduled = Some(SystemTime::now());
    f.scheduler
        .schedule_async(op, failing_action("provisioning exploded"))
        .await
        .unwrap();

    // the mitigation delete re-drives the same operation; once it has run,
    // the record settles as failed with the mitigation window cleared
    let op = common::wait_for_operation(
        &f.repository,
        "o1",
        |op| op.state == OperationState::Failed && op.deletion_scheduled.is_none(),
        WAIT,
    )
    .await
    .expect("operation settles after mitigation");

    let errors = op.errors.expect("root cause error is recorded");
    assert_eq!(errors["error"], "ActionError");
    assert!(errors["description"]
        .as_str()
        .unwrap()
        .contains("provisioning exploded"));

    // the orphaned binding is gone
    assert!(f.repository.get("binding", "r2").await.is_err());
}

#[tokio::test]
async fn failed_create_flips_ready_off() {
    let f = fixture(4);
    let mut binding = TestBinding::new("r1");
    binding.ready = true;
    f.repository.create(Box::new(binding)).await.unwrap();

    let err = f
        .scheduler
        .schedule_sync(
            CancellationToken::new(),
            operation("o1", OperationType::Create, "r1"),
            failing_action("boom"),
        )
        .await
        .unwrap_err();
    assert!(err.to_string().contains("boom"));

    let op = f.repository.operation("o1").await.unwrap();
    assert_eq!(op.state, OperationState::Failed);
    assert!(!f.repository.get("binding", "r1").await.unwrap().ready());
}

// --- Pool saturation ---------------------------------------------------------

#[tokio::test]
async fn saturated_pool_rejects_without_persisting() {
    let f = fixture(1);
    let gate = Arc::new(Notify::new());

    f.scheduler
        .schedule_async(
            operation("o-a", OperationType::Create, "r-a"),
            blocking_action(gate.clone()),
        )
        .await
        .unwrap();

    let err = f
        .scheduler
        .schedule_async(
            operation("o-b", OperationType::Create, "r-b"),
            create_binding_action(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::ServiceUnavailable));
    assert!(err.is_retryable());
    assert_eq!(f.repository.operation_count().await, 1);

    gate.notify_one();
    wait_for_state(&f.repository, "o-a", OperationState::Succeeded, WAIT)
        .await
        .expect("blocked operation completes after release");
}

// --- Preconditions ---------------------------------------------------------

#[tokio::test]
async fn succeeded_input_is_rejected() {
    let f = fixture(4);
    let mut op = operation("o1", OperationType::Create, "r1");
    op.state = OperationState::Succeeded;

    let err = f
        .scheduler
        .schedule_sync(CancellationToken::new(), op, create_binding_action())
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::InvalidOperation { .. }));
    assert_eq!(f.repository.operation_count().await, 0);
}

#[tokio::test]
async fn invalid_operation_is_rejected() {
    let f = fixture(4);
    let err = f
        .scheduler
        .schedule_sync(
            CancellationToken::new(),
            operation("", OperationType::Create, "r1"),
            create_binding_action(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::InvalidOperation { .. }));
    assert_eq!(f.repository.operation_count().await, 0);
}

#[tokio::test]
async fn deletion_scheduled_before_creation_is_rejected() {
    let f = fixture(4);
    let mut op = operation("o1", OperationType::Create, "r1");
    op.deletion_scheduled = Some(op.created_at - Duration::from_secs(60));

    let err = f
        .scheduler
        .schedule_sync(CancellationToken::new(), op, create_binding_action())
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::InvalidOperation { .. }));
    assert_eq!(f.repository.operation_count().await, 0);
}

#[tokio::test]
async fn terminal_operation_id_cannot_be_executed_again() {
    let f = fixture(4);
    f.scheduler
        .schedule_sync(
            CancellationToken::new(),
            operation("o1", OperationType::Create, "r1"),
            create_binding_action(),
        )
        .await
        .unwrap();

    let err = f
        .scheduler
        .schedule_sync(
            CancellationToken::new(),
            operation("o1", OperationType::Create, "r1"),
            create_binding_action(),
        )
        .await
        .unwrap_err();
    match err {
        SchedulerError::InvalidOperation { message } => {
            assert!(message.contains("already executed"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

// --- Reschedule ------------------------------------------------------------

#[tokio::test]
async fn reschedulable_operation_stays_in_progress_on_success() {
    let f = fixture(4);
    let mut op = operation("o1", OperationType::Create, "r1");
    op.reschedule = true;

    f.scheduler
        .schedule_async(
            op,
            FnAction(
                |_ctx: opsched::RunContext, _repository: Arc<dyn opsched::TransactionalRepository>| async move {
                    Ok(None)
                },
            ),
        )
        .await
        .unwrap();

    f.tracker.close();
    f.tracker.wait().await;

    let op = f.repository.operation("o1").await.unwrap();
    assert_eq!(op.state, OperationState::InProgress);
}

#[tokio::test]
async fn reschedule_completes_once_the_driver_clears_the_flag() {
    let f = fixture(4);
    let mut op = operation("o1", OperationType::Create, "r1");
    op.reschedule = true;
    f.repository.create_operation(&op).await.unwrap();

    // the driver re-enters the same operation; the action finishes the work
    // and clears the cooperative flag on the stored record
    let final_action = FnAction(
        |ctx: opsched::RunContext, repository: Arc<dyn opsched::TransactionalRepository>| async move {
            let mut stored = repository
                .operation(&ctx.operation().id)
                .await
                .map_err(|err| SchedulerError::storage("operation", err))?;
            stored.reschedule = false;
            repository
                .update_operation(&stored)
                .await
                .map_err(|err| SchedulerError::storage("operation", err))?;

            let binding = repository
                .create(Box::new(TestBinding::new(&ctx.operation().resource_id)))
                .await
                .map_err(|err| SchedulerError::storage("binding", err))?;
            Ok(Some(binding))
        },
    );

    let object = f
        .scheduler
        .schedule_sync(CancellationToken::new(), op, final_action)
        .await
        .unwrap()
        .expect("binding comes back");
    assert!(object.ready());

    let op = f.repository.operation("o1").await.unwrap();
    assert_eq!(op.state, OperationState::Succeeded);
    assert!(f.repository.get("binding", "r1").await.unwrap().ready());
}

// --- Transitive resources --------------------------------------------------

#[tokio::test]
async fn transitive_create_resources_follow_the_primary() {
    let f = fixture(4);
    let action = FnAction(
        |ctx: opsched::RunContext, repository: Arc<dyn opsched::TransactionalRepository>| async move {
            let main = repository
                .create(Box::new(TestBinding::new(&ctx.operation().resource_id)))
                .await
                .map_err(|err| SchedulerError::storage("binding", err))?;
            repository
                .create(Box::new(TestBinding::new("r-extra")))
                .await
                .map_err(|err| SchedulerError::storage("binding", err))?;
            ctx.add_transitive_resource(opsched::RelatedResource {
                id: "r-extra".to_string(),
                resource_type: "binding".to_string(),
                op_type: OperationType::Create,
            });
            Ok(Some(main))
        },
    );

    f.scheduler
        .schedule_sync(
            CancellationToken::new(),
            operation("o1", OperationType::Create, "r-main"),
            action,
        )
        .await
        .unwrap();

    assert!(f.repository.get("binding", "r-main").await.unwrap().ready());
    assert!(f.repository.get("binding", "r-extra").await.unwrap().ready());
}

// --- Error bookkeeping -----------------------------------------------------

#[tokio::test]
async fn first_recorded_error_wins() {
    let f = fixture(4);
    let mut op = operation("o1", OperationType::Create, "r1");
    op.errors = Some(serde_json::json!({
        "error": "OriginalFailure",
        "description": "the first failure"
    }));

    f.scheduler
        .schedule_sync(CancellationToken::new(), op, failing_action("second failure"))
        .await
        .unwrap_err();

    let op = f.repository.operation("o1").await.unwrap();
    assert_eq!(op.state, OperationState::Failed);
    let errors = op.errors.unwrap();
    assert_eq!(errors["error"], "OriginalFailure");
    assert_eq!(errors["description"], "the first failure");
}

// --- Caller disconnect -----------------------------------------------------

#[tokio::test]
async fn sync_reconciliation_survives_caller_cancellation() {
    let f = fixture(4);
    let caller = CancellationToken::new();

    let token_for_action = caller.clone();
    let action = FnAction(
        move |ctx: opsched::RunContext, repository: Arc<dyn opsched::TransactionalRepository>| {
            let caller = token_for_action.clone();
            async move {
                let binding = repository
                    .create(Box::new(TestBinding::new(&ctx.operation().resource_id)))
                    .await
                    .map_err(|err| SchedulerError::storage("binding", err))?;
                // the client hangs up just as the action finishes
                caller.cancel();
                Ok(Some(binding))
            }
        },
    );

    f.scheduler
        .schedule_sync(
            caller.clone(),
            operation("o1", OperationType::Create, "r1"),
            action,
        )
        .await
        .unwrap();

    let op = f.repository.operation("o1").await.unwrap();
    assert_eq!(op.state, OperationState::Succeeded);
    assert!(f.repository.get("binding", "r1").await.unwrap().ready());
}

// --- Panic safety -----------------------------------------------------------

#[tokio::test]
async fn panicking_action_fails_the_operation_and_frees_the_pool() {
    let f = fixture(1);
    f.scheduler
        .schedule_async(
            operation("o1", OperationType::Create, "r1"),
            FnAction(
                |_ctx: opsched::RunContext, _repository: Arc<dyn opsched::TransactionalRepository>| async move {
                    if true {
                        panic!("kaboom");
                    }
                    Ok(None)
                },
            ),
        )
        .await
        .unwrap();

    let op = wait_for_state(&f.repository, "o1", OperationState::Failed, WAIT)
        .await
        .expect("panicked operation is marked failed");
    let errors = op.errors.expect("synthetic error is recorded");
    assert_eq!(errors["error"], "InternalServerError");
    assert_eq!(errors["description"], "job interrupted");

    // the worker slot was released and the tracker is drainable
    f.scheduler
        .schedule_async(
            operation("o2", OperationType::Create, "r2"),
            create_binding_action(),
        )
        .await
        .expect("pool slot is free again");
    wait_for_state(&f.repository, "o2", OperationState::Succeeded, WAIT)
        .await
        .expect("next operation completes");

    f.tracker.close();
    f.tracker.wait().await;
}

// --- Deadlines and shutdown -------------------------------------------------

#[tokio::test]
async fn async_action_is_bounded_by_the_action_timeout() {
    let mut settings = test_settings();
    settings.action_timeout = Duration::from_millis(50);
    let f = fixture_with(2, settings);

    f.scheduler
        .schedule_async(
            operation("o1", OperationType::Create, "r1"),
            FnAction(
                |_ctx: opsched::RunContext, _repository: Arc<dyn opsched::TransactionalRepository>| async move {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(None)
                },
            ),
        )
        .await
        .unwrap();

    let op = wait_for_state(&f.repository, "o1", OperationState::Failed, WAIT)
        .await
        .expect("timed out operation is marked failed");
    assert_eq!(op.errors.unwrap()["error"], "Timeout");
}

#[tokio::test]
async fn lifecycle_shutdown_aborts_a_pending_mitigation_delay() {
    let mut settings = test_settings();
    settings.rescheduling_interval = Duration::from_secs(30);
    let f = fixture_with(4, settings);

    let mut op = operation("o1", OperationType::Create, "r1");
    op.deletion_scheduled = Some(SystemTime::now());
    f.scheduler
        .schedule_async(op, failing_action("boom"))
        .await
        .unwrap();

    wait_for_state(&f.repository, "o1", OperationState::Failed, WAIT)
        .await
        .expect("failure is committed before the mitigation delay");

    f.lifecycle.cancel();
    f.tracker.close();
    f.tracker.wait().await;

    // mitigation never ran: the deletion window is still marked
    let op = f.repository.operation("o1").await.unwrap();
    assert!(op.deletion_scheduled.is_some());
}

#[tokio::test]
async fn failed_mitigation_admission_surfaces_a_broker_error() {
    let f = fixture(1);
    let gate = Arc::new(Notify::new());

    // occupy the only worker so the mitigation cannot be admitted
    f.scheduler
        .schedule_async(
            operation("o-blocker", OperationType::Create, "r-blocker"),
            blocking_action(gate.clone()),
        )
        .await
        .unwrap();

    let mut op = operation("o1", OperationType::Create, "r1");
    op.deletion_scheduled = Some(SystemTime::now());
    let err = f
        .scheduler
        .schedule_sync(CancellationToken::new(), op, failing_action("boom"))
        .await
        .unwrap_err();

    match err {
        SchedulerError::Broker {
            action_error,
            mitigation_error,
        } => {
            assert!(action_error.contains("boom"));
            assert!(mitigation_error.contains("busy"));
        }
        other => panic!("unexpected error: {other:?}"),
    }

    let op = f.repository.operation("o1").await.unwrap();
    assert_eq!(op.state, OperationState::Failed);
    assert!(op.deletion_scheduled.is_some());

    gate.notify_one();
    f.tracker.close();
    f.tracker.wait().await;
}
