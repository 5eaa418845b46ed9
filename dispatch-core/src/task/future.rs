//! Typed, possibly empty reference to a task.

use std::sync::Arc;

use crate::code::ResultCode;
use crate::session::{ClientRef, RequestPackage};
use crate::task::runner::{Task, TaskBody, TaskHandle};
use crate::vm_event::VmEvent;

/// Shared reference to a [`Task`] that may never have been assigned.
///
/// Every operation is safe on an empty future.
pub struct TaskFuture<B: TaskBody> {
    task: Option<Arc<Task<B>>>,
}

impl<B: TaskBody> Default for TaskFuture<B> {
    fn default() -> Self {
        Self { task: None }
    }
}

impl<B: TaskBody> Clone for TaskFuture<B> {
    fn clone(&self) -> Self {
        Self {
            task: self.task.clone(),
        }
    }
}

impl<B: TaskBody> TaskFuture<B> {
    pub fn new(task: Arc<Task<B>>) -> Self {
        Self { task: Some(task) }
    }

    pub fn get_task(&self) -> Option<&Task<B>> {
        self.task.as_deref()
    }

    /// Terminate the task and wait for it to go away.
    pub async fn stop(&self) {
        if let Some(task) = &self.task {
            task.terminate();
            task.wait().await;
        }
    }

    /// Request cooperative cancellation without waiting.
    pub fn abort(&self, user: Option<ClientRef>, request: Option<&RequestPackage>) {
        let Some(task) = &self.task else {
            return;
        };
        let helper = task.helper();
        if helper.operation_is_cancelled() || task.is_finished() {
            return;
        }
        helper.cancel_operation(user, request);
    }

    pub async fn wait(&self, condition: bool) {
        if !condition {
            return;
        }
        if let Some(task) = &self.task {
            if task.is_running() {
                task.wait().await;
            }
        }
    }

    /// Write the outcome of the task into `out`.
    ///
    /// An empty future reports a cancelled operation. A task that was
    /// cancelled but is still running reports its cancel result. A running
    /// task that was not cancelled leaves `out` untouched.
    pub fn get_result(&self, out: Option<&mut VmEvent>) {
        let Some(out) = out else {
            return;
        };
        let Some(task) = &self.task else {
            out.set_event_code(ResultCode::OperationWasCanceled);
            return;
        };
        if task.is_finished() {
            *out = task.helper().last_error().snapshot();
        } else if task.helper().operation_is_cancelled() {
            out.set_event_code(task.cancel_result());
        }
    }
}
