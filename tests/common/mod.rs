use std::any::Any;
use std::sync::Arc;
use std::time::{Duration, Instant};

use opsched::storage::InMemoryRepository;
use opsched::{Operation, OperationState, OperationType, Resource, Scheduler, Settings};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// A minimal resource for exercising the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestBinding {
    pub id: String,
    pub ready: bool,
}

impl TestBinding {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            ready: false,
        }
    }
}

impl Resource for TestBinding {
    fn id(&self) -> &str {
        &self.id
    }
    fn type_name(&self) -> &str {
        "binding"
    }
    fn ready(&self) -> bool {
        self.ready
    }
    fn set_ready(&mut self, ready: bool) {
        self.ready = ready;
    }
    fn clone_resource(&self) -> Box<dyn Resource> {
        Box::new(self.clone())
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub struct Fixture {
    pub repository: Arc<InMemoryRepository>,
    pub scheduler: Scheduler,
    pub lifecycle: CancellationToken,
    pub tracker: TaskTracker,
}

/// Short durations so timing-sensitive scenarios run fast; individual tests
/// override what they probe.
pub fn test_settings() -> Settings {
    Settings {
        action_timeout: Duration::from_secs(60),
        reconciliation_operation_timeout: Duration::from_secs(600),
        rescheduling_interval: Duration::from_millis(20),
    }
}

pub fn fixture(pool_size: usize) -> Fixture {
    fixture_with(pool_size, test_settings())
}

pub fn fixture_with(pool_size: usize, settings: Settings) -> Fixture {
    let repository = Arc::new(InMemoryRepository::new());
    let lifecycle = CancellationToken::new();
    let tracker = TaskTracker::new();
    let scheduler = Scheduler::new(
        lifecycle.clone(),
        repository.clone(),
        &settings,
        pool_size,
        tracker.clone(),
    );
    Fixture {
        repository,
        scheduler,
        lifecycle,
        tracker,
    }
}

pub fn operation(id: &str, op_type: OperationType, resource_id: &str) -> Operation {
    Operation::new(id, op_type, "binding", resource_id)
}

/// Poll the repository until the operation satisfies `predicate` or the
/// timeout elapses.
pub async fn wait_for_operation<F>(
    repository: &InMemoryRepository,
    id: &str,
    predicate: F,
    timeout: Duration,
) -> Option<Operation>
where
    F: Fn(&Operation) -> bool,
{
    use opsched::Repository;

    let deadline = Instant::now() + timeout;
    loop {
        if let Ok(op) = repository.operation(id).await {
            if predicate(&op) {
                return Some(op);
            }
        }
        if Instant::now() > deadline {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[allow(dead_code)]
pub async fn wait_for_state(
    repository: &InMemoryRepository,
    id: &str,
    state: OperationState,
    timeout: Duration,
) -> Option<Operation> {
    wait_for_operation(repository, id, |op| op.state == state, timeout).await
}
