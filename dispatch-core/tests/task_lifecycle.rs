//! Integration tests for the task lifecycle.
//!
//! Tasks run on the tokio runtime against recording client sessions.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dispatch_core::task::RunState;
use dispatch_core::testing::{helper, RecordingClient};
use dispatch_core::{
    ClientSession, CommandType, DispatchError, ExclusiveRegistry, RequestPackage, ResultCode,
    Task, TaskBody, TaskFailure, TaskFuture, TaskHandle, TaskHelper, VmEvent,
};

/// Body ending with a fixed outcome, counting finalizations.
struct Outcome {
    kind: OutcomeKind,
    finalized: Arc<AtomicUsize>,
}

#[derive(Clone, Copy)]
enum OutcomeKind {
    Succeed,
    Fail(ResultCode),
    FailPrepare(ResultCode),
    Panic,
}

#[async_trait]
impl TaskBody for Outcome {
    async fn prepare_task(&self, task: &Arc<TaskHelper>) -> ResultCode {
        match self.kind {
            OutcomeKind::FailPrepare(code) => TaskFailure::new(task).code(code),
            _ => ResultCode::Success,
        }
    }

    async fn run_body(&self, task: &Arc<TaskHelper>) -> ResultCode {
        match self.kind {
            OutcomeKind::Succeed | OutcomeKind::FailPrepare(_) => ResultCode::Success,
            OutcomeKind::Fail(code) => TaskFailure::new(task).with_message(code, "hdd0"),
            OutcomeKind::Panic => panic!("synthetic failure"),
        }
    }

    async fn finalize_task(&self, task: &Arc<TaskHelper>) {
        self.finalized.fetch_add(1, Ordering::SeqCst);
        task.send_default_response();
    }
}

/// Body returning one code while recording another.
struct Mismatched {
    returned: ResultCode,
    recorded: ResultCode,
}

#[async_trait]
impl TaskBody for Mismatched {
    async fn run_body(&self, task: &Arc<TaskHelper>) -> ResultCode {
        task.set_last_error_code(self.recorded);
        self.returned
    }
}

/// Body polling for cancellation.
struct Waiter;

#[async_trait]
impl TaskBody for Waiter {
    async fn run_body(&self, task: &Arc<TaskHelper>) -> ResultCode {
        while !task.operation_is_cancelled() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        TaskFailure::new(task).code(ResultCode::OperationWasCanceled)
    }
}

/// Body delegating to one nested task.
struct Parent {
    child: Mutex<Option<Arc<dyn TaskHandle>>>,
}

impl Parent {
    fn new(child: Arc<dyn TaskHandle>) -> Self {
        Self {
            child: Mutex::new(Some(child)),
        }
    }
}

#[async_trait]
impl TaskBody for Parent {
    async fn run_body(&self, task: &Arc<TaskHelper>) -> ResultCode {
        let Some(child) = self.child.lock().unwrap().take() else {
            return TaskFailure::new(task).code(ResultCode::Uninitialized);
        };
        let code = task
            .run_external_task(child)
            .await
            .unwrap_or_else(|e| e.code());
        if code.is_failed() {
            return TaskFailure::new(task).code(code);
        }
        code
    }
}

async fn until(mut condition: impl FnMut() -> bool) {
    while !condition() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

/// Cancelling twice keeps the task cancelled and answers each request once.
#[tokio::test]
async fn test_idempotent_cancel() {
    let (helper, _) = helper("waiter");
    let task = Task::new(helper, Waiter);
    let first = Arc::new(RecordingClient::new("first"));
    let second = Arc::new(RecordingClient::new("second"));
    let request = RequestPackage::new(CommandType::JOB_CANCEL, "");

    task.helper().cancel_operation(Some(first.clone()), Some(&request));
    task.helper().cancel_operation(Some(first.clone()), Some(&request));
    assert!(task.helper().operation_is_cancelled());
    task.helper().cancel_operation(Some(second.clone()), Some(&request));

    assert!(task.helper().operation_is_cancelled());
    assert_eq!(first.codes(), vec![ResultCode::Success, ResultCode::Success]);
    assert_eq!(second.codes(), vec![ResultCode::Success]);
    let canceller = task.helper().cancel_support().canceller().unwrap();
    assert_eq!(canceller.client_handle(), "second");
}

/// A cancelled task never reaches the running state.
#[tokio::test]
async fn test_start_after_cancel_is_noop() {
    let (helper, client) = helper("waiter");
    let task = Task::new(helper, Waiter);
    task.helper().cancel_operation(None, None);

    assert!(!task.clone().start());
    tokio::task::yield_now().await;

    assert_eq!(task.run_state(), RunState::Created);
    assert!(!task.is_running());
    assert!(!task.is_finished());
    assert!(client.codes().is_empty());
}

/// Success, recorded failure, prepare failure and panic all finalize exactly once.
#[tokio::test]
async fn test_finalize_always_runs_once() {
    let cases = [
        (OutcomeKind::Succeed, ResultCode::Success),
        (OutcomeKind::Fail(ResultCode::BackupNotAttached), ResultCode::BackupNotAttached),
        (OutcomeKind::FailPrepare(ResultCode::InvalidArgument), ResultCode::InvalidArgument),
        (OutcomeKind::Panic, ResultCode::Unexpected),
    ];

    for (kind, expected) in cases {
        let (helper, client) = helper("outcome");
        let finalized = Arc::new(AtomicUsize::new(0));
        let task = Task::new(
            helper,
            Outcome {
                kind,
                finalized: finalized.clone(),
            },
        );

        assert!(task.clone().start());
        task.wait().await;

        assert_eq!(finalized.load(Ordering::SeqCst), 1);
        assert_eq!(client.codes(), vec![expected]);
        assert!(task.helper().cancel_support().is_task_completed());
    }
}

/// A failed task hands its parameters to the client.
#[tokio::test]
async fn test_failure_parameters_reach_client() {
    let (helper, client) = helper("outcome");
    let task = Task::new(
        helper,
        Outcome {
            kind: OutcomeKind::Fail(ResultCode::BackupAttachFailed),
            finalized: Arc::new(AtomicUsize::new(0)),
        },
    );

    assert!(task.clone().start());
    task.wait().await;

    let errors = client.errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(
        errors[0].parameter(dispatch_core::ParamSlot::MessageParam0),
        Some("hdd0")
    );
}

/// Returning a code other than the recorded one violates the task contract.
#[tokio::test]
async fn test_returned_and_recorded_codes_must_match() {
    let pairs = [
        (ResultCode::BackupNotAttached, ResultCode::Success),
        (ResultCode::Success, ResultCode::BackupAttachFailed),
        (ResultCode::InvalidArgument, ResultCode::TaskNotFound),
        (ResultCode::AttachBackupAlreadyAttached, ResultCode::AttachBackupUrlChangeProhibited),
    ];

    for (returned, recorded) in pairs {
        let (helper, client) = helper("mismatched");
        let task = Task::new(helper, Mismatched { returned, recorded });

        assert!(task.clone().start());
        task.wait().await;

        let expected = if cfg!(debug_assertions) {
            ResultCode::Unexpected
        } else {
            returned
        };
        assert_eq!(task.helper().last_error_code(), expected);
        assert_eq!(client.codes(), vec![expected]);
    }
}

/// Reassignment keeps the command type of the original request.
#[test]
fn test_reassignment_preserves_command_type() {
    let (helper, original) = helper("reassign");
    let before = helper.request_package().header.command;

    let package = RequestPackage::new(CommandType::VM_EDIT_COMMIT, "{}");
    helper.reassign_task(Arc::new(RecordingClient::new("new")), &package);

    assert_ne!(package.header.command, before);
    assert_eq!(helper.request_package().header.command, before);
    assert_eq!(helper.actual_client().client_handle(), original.client_handle());
}

/// Two helpers sharing one exclusive key never hold it together.
#[test]
fn test_exclusive_lock_mutual_exclusion() {
    let registry = Arc::new(ExclusiveRegistry::new());
    let (first, _) = helper("singleton");
    let first = first.with_exclusive(registry.clone(), "singleton");
    let (second, _) = helper("singleton");
    let second = second.with_exclusive(registry.clone(), "singleton");

    assert!(first.lock_to_execute());
    assert!(!second.lock_to_execute());
    assert!(!first.lock_to_execute());

    second.unlock_to_execute();
    assert!(registry.is_claimed("singleton"));

    first.unlock_to_execute();
    assert!(second.lock_to_execute());
    drop(second);
    assert!(!registry.is_claimed("singleton"));
}

/// A default future answers every operation without a task.
#[tokio::test]
async fn test_default_task_future() {
    let future: TaskFuture<Waiter> = TaskFuture::default();
    let user = Arc::new(RecordingClient::new("user"));
    let request = RequestPackage::new(CommandType::JOB_CANCEL, "");

    future.stop().await;
    future.abort(Some(user.clone()), Some(&request));
    future.wait(true).await;

    let mut event = VmEvent::new();
    future.get_result(Some(&mut event));
    assert_eq!(event.event_code(), ResultCode::OperationWasCanceled);
    assert!(user.codes().is_empty());
}

/// Cancelling a parent reaches the nested task it waits for.
#[tokio::test]
async fn test_cancel_propagates_to_nested_task() {
    let (child, child_client) = helper("child");
    let child: Arc<dyn TaskHandle> = Task::new(child, Waiter);
    let (parent, parent_client) = helper("parent");
    let parent = Task::new(parent, Parent::new(child.clone()));

    assert!(parent.clone().start());
    until(|| child.is_running()).await;
    assert!(parent.helper().external_task().is_some());

    let user = Arc::new(RecordingClient::new("canceller"));
    let request = RequestPackage::new(CommandType::JOB_CANCEL, "");
    parent.helper().cancel_operation(Some(user.clone()), Some(&request));
    parent.wait().await;

    assert!(child.helper().operation_is_cancelled());
    assert_eq!(
        child.helper().cancel_support().canceller().unwrap().client_handle(),
        "canceller"
    );
    assert!(parent.helper().external_task().is_none());
    assert_eq!(user.codes(), vec![ResultCode::Success]);
    assert_eq!(parent_client.codes(), vec![ResultCode::OperationWasCanceled]);
    assert_eq!(child_client.codes(), vec![ResultCode::OperationWasCanceled]);
}

/// A parent cancelled before delegation cancels the nested task before it starts.
#[tokio::test]
async fn test_cancelled_parent_never_starts_nested_task() {
    let (child, child_client) = helper("child");
    let child: Arc<dyn TaskHandle> = Task::new(child, Waiter);
    let (parent, _) = helper("parent");
    let parent = Arc::new(parent);
    parent.cancel_operation(None, None);

    let code = parent.run_external_task(child.clone()).await.unwrap();

    assert_eq!(code, ResultCode::OperationWasCanceled);
    assert!(child.helper().operation_is_cancelled());
    assert!(!child.is_running() && !child.is_finished());
    assert!(child_client.codes().is_empty());
}

/// Only one nested task can be tracked at a time.
#[tokio::test]
async fn test_second_nested_task_is_rejected() {
    let (parent, _) = helper("parent");
    let parent = Arc::new(parent);
    let (first, _) = helper("first");
    let first: Arc<dyn TaskHandle> = Task::new(first, Waiter);
    let (second, _) = helper("second");
    let second: Arc<dyn TaskHandle> = Task::new(second, Waiter);

    let running = {
        let parent = parent.clone();
        let first = first.clone();
        tokio::spawn(async move { parent.run_external_task(first).await })
    };
    until(|| first.is_running()).await;

    let err = parent.run_external_task(second.clone()).await.unwrap_err();
    assert!(matches!(err, DispatchError::NestedTaskActive(_)));
    assert_eq!(err.code(), ResultCode::NestedTaskActive);
    assert!(!second.is_running());

    parent.cancel_operation(None, None);
    let code = running.await.unwrap().unwrap();
    assert_eq!(code, ResultCode::OperationWasCanceled);
}
