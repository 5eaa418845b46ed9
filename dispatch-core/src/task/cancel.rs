//! Cancellation and completion flags of one task.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use tracing::debug;

use crate::code::ResultCode;
use crate::session::{ClientRef, RequestPackage};

/// Tracks whether a task was cancelled, who cancelled it and whether it completed.
///
/// Cancellation is cooperative: setting the flag never interrupts a running
/// body, the body polls [`operation_is_cancelled`](Self::operation_is_cancelled).
#[derive(Default)]
pub struct CancelOperationSupport {
    cancelled: AtomicBool,
    completed: AtomicBool,
    canceller: Mutex<Option<ClientRef>>,
}

impl CancelOperationSupport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the operation cancelled on behalf of `user`.
    ///
    /// When both `user` and `request` are given, the user receives exactly one
    /// answer: `TaskNotFound` if the task already completed, `Success` otherwise.
    /// The answer acknowledges the request, not the task having stopped.
    pub fn cancel_operation(&self, user: Option<ClientRef>, request: Option<&RequestPackage>) {
        self.cancelled.store(true, Ordering::SeqCst);

        let mut canceller = self.canceller.lock().unwrap_or_else(|e| e.into_inner());
        *canceller = user.clone();
        drop(canceller);

        if let (Some(user), Some(request)) = (user, request) {
            let code = if self.is_task_completed() {
                ResultCode::TaskNotFound
            } else {
                ResultCode::Success
            };
            debug!(client = %user.client_handle(), code = %code, "Answering cancel request");
            user.send_simple_response(request, code);
        }
    }

    pub fn operation_is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Forget a previous cancellation. Used only when a lost task is reattached.
    pub fn undo_cancelled(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
        *self.canceller.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// Session that requested the cancellation, if any.
    pub fn canceller(&self) -> Option<ClientRef> {
        self.canceller.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set_task_completed(&self) {
        self.completed.store(true, Ordering::SeqCst);
    }

    pub fn is_task_completed(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }
}
