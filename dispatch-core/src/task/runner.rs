//! Task execution: the body trait, the object-safe handle and the runner
//! driving prepare, run and finalize on a tokio task.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::code::ResultCode;
use crate::task::helper::TaskHelper;

/// Work performed by a task.
///
/// Every method receives the shared [`TaskHelper`]. A code returned from
/// `prepare_task` or `run_body` must equal the last error recorded in the
/// helper; use [`TaskFailure`](crate::task::TaskFailure) to keep both in step.
#[async_trait]
pub trait TaskBody: Send + Sync + 'static {
    async fn prepare_task(&self, _task: &Arc<TaskHelper>) -> ResultCode {
        ResultCode::Success
    }

    async fn run_body(&self, task: &Arc<TaskHelper>) -> ResultCode;

    /// Send the terminal answer to the client. Runs exactly once per started task.
    async fn finalize_task(&self, task: &Arc<TaskHelper>) {
        task.send_default_response();
    }

    /// VE the task works on, used for addition-state bookkeeping.
    fn vm_uuid(&self) -> Option<String> {
        None
    }

    /// Code reported for a task that was cancelled before it finished.
    fn cancel_result(&self) -> ResultCode {
        ResultCode::OperationWasCanceled
    }
}

/// Coarse execution state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Created,
    Running,
    Finished,
}

/// Type-erased view of a task, as held by the manager and by parent tasks.
#[async_trait]
pub trait TaskHandle: Send + Sync {
    fn helper(&self) -> &Arc<TaskHelper>;

    fn kind(&self) -> &'static str {
        self.helper().kind()
    }

    /// Spawn the task. Returns `false` when the task was cancelled or
    /// started before.
    fn start(self: Arc<Self>) -> bool;

    /// Wait until the task leaves the running state.
    async fn wait(&self);

    /// Stop the task forcefully. `finalize_task` does not run.
    fn terminate(&self);

    fn is_running(&self) -> bool;

    fn is_finished(&self) -> bool;

    fn cancel_result(&self) -> ResultCode;

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// A task body bound to its helper.
pub struct Task<B: TaskBody> {
    helper: Arc<TaskHelper>,
    body: B,
    state: watch::Sender<RunState>,
    join: Mutex<Option<JoinHandle<()>>>,
}

struct FinishGuard<B: TaskBody>(Arc<Task<B>>);

impl<B: TaskBody> Drop for FinishGuard<B> {
    fn drop(&mut self) {
        self.0.helper.cancel_support().set_task_completed();
        self.0.state.send_replace(RunState::Finished);
    }
}

impl<B: TaskBody> Task<B> {
    pub fn new(helper: TaskHelper, body: B) -> Arc<Self> {
        let (state, _) = watch::channel(RunState::Created);
        Arc::new(Self {
            helper: Arc::new(helper),
            body,
            state,
            join: Mutex::new(None),
        })
    }

    pub fn body(&self) -> &B {
        &self.body
    }

    pub fn run_state(&self) -> RunState {
        *self.state.borrow()
    }

    async fn execute(&self) {
        let helper = &self.helper;
        info!(
            task = helper.kind(),
            job_id = %helper.job_uuid(),
            flags = helper.request_flags(),
            "Task started"
        );

        let outcome = AssertUnwindSafe(self.prepare_and_run()).catch_unwind().await;
        if let Err(panic) = outcome {
            error!(
                task = helper.kind(),
                job_id = %helper.job_uuid(),
                panic = %panic_message(panic.as_ref()),
                "Task body panicked"
            );
            helper.set_last_error_code(ResultCode::Unexpected);
        }

        let finalized = AssertUnwindSafe(self.body.finalize_task(helper))
            .catch_unwind()
            .await;
        if let Err(panic) = finalized {
            error!(
                task = helper.kind(),
                job_id = %helper.job_uuid(),
                panic = %panic_message(panic.as_ref()),
                "Task finalization panicked"
            );
            let (client, request) = helper.binding();
            client.send_simple_response(&request, ResultCode::Unexpected);
        }

        helper.cancel_support().set_task_completed();
        helper.check_vm_addition_state(self.body.vm_uuid().as_deref(), false);

        info!(
            task = helper.kind(),
            job_id = %helper.job_uuid(),
            code = %helper.last_error_code(),
            cancelled = helper.operation_is_cancelled(),
            "Task finished"
        );
    }

    async fn prepare_and_run(&self) {
        let helper = &self.helper;

        let code = self.body.prepare_task(helper).await;
        check_consistency(helper, code, "prepare_task");
        debug!(job_id = %helper.job_uuid(), code = %code, "prepare_task complete");
        if code.is_failed() {
            return;
        }

        helper.check_vm_addition_state(self.body.vm_uuid().as_deref(), true);

        let code = self.body.run_body(helper).await;
        check_consistency(helper, code, "run_body");
        debug!(job_id = %helper.job_uuid(), code = %code, "run_body complete");
    }
}

fn check_consistency(helper: &TaskHelper, returned: ResultCode, stage: &'static str) {
    let recorded = helper.last_error_code();
    if recorded == returned {
        return;
    }
    error!(
        job_id = %helper.job_uuid(),
        stage,
        returned = %returned,
        recorded = %recorded,
        "Returned code diverges from the recorded last error"
    );
    debug_assert_eq!(recorded, returned, "{stage} returned a code different from its last error");
    helper.set_last_error_code(returned);
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[async_trait]
impl<B: TaskBody> TaskHandle for Task<B> {
    fn helper(&self) -> &Arc<TaskHelper> {
        &self.helper
    }

    fn start(self: Arc<Self>) -> bool {
        if self.helper.operation_is_cancelled() {
            warn!(
                task = self.helper.kind(),
                job_id = %self.helper.job_uuid(),
                "Task was cancelled before start"
            );
            return false;
        }

        let started = self.state.send_if_modified(|state| {
            if *state == RunState::Created {
                *state = RunState::Running;
                true
            } else {
                false
            }
        });
        if !started {
            warn!(job_id = %self.helper.job_uuid(), "Task was already started");
            return false;
        }

        let guard = FinishGuard(Arc::clone(&self));
        let handle = tokio::spawn(async move {
            guard.0.execute().await;
            drop(guard);
        });
        *self.join.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        true
    }

    async fn wait(&self) {
        let mut state = self.state.subscribe();
        let _ = state.wait_for(|state| *state != RunState::Running).await;
    }

    fn terminate(&self) {
        if let Some(handle) = self.join.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
            warn!(job_id = %self.helper.job_uuid(), "Terminating task");
            handle.abort();
        }
    }

    fn is_running(&self) -> bool {
        self.run_state() == RunState::Running
    }

    fn is_finished(&self) -> bool {
        self.run_state() == RunState::Finished
    }

    fn cancel_result(&self) -> ResultCode {
        self.body.cancel_result()
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
