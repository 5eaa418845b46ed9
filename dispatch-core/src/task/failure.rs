//! Uniform failure reporting for task bodies.

use crate::code::ResultCode;
use crate::task::TaskHelper;
use crate::vm_event::{ParamKind, ParamSlot, VmEvent};

/// Records a failure into the last error of a task and hands back its code.
///
/// ```rust,ignore
/// return TaskFailure::new(task).with_message(ResultCode::BackupNotAttached, &backup_id);
/// ```
pub struct TaskFailure<'a> {
    task: &'a TaskHelper,
    code: ResultCode,
    token: Option<String>,
}

impl<'a> TaskFailure<'a> {
    pub fn new(task: &'a TaskHelper) -> Self {
        Self {
            task,
            code: ResultCode::Success,
            token: None,
        }
    }

    /// Stage the code reported by the next call.
    pub fn set_code(&mut self, code: ResultCode) -> &mut Self {
        self.code = code;
        self
    }

    /// Stage a return token attached to the error by the next call.
    pub fn set_token(&mut self, token: impl Into<String>) -> &mut Self {
        self.token = Some(token.into());
        self
    }

    /// Report the staged code and token. Both are consumed: the code falls
    /// back to success afterwards.
    pub fn call(&mut self) -> ResultCode {
        let output = std::mem::take(&mut self.code);
        let topic = self.task.last_error();
        if let Some(token) = self.token.take() {
            topic
                .lock()
                .add_event_parameter(ParamKind::String, token, ParamSlot::ReturnParamToken);
        }
        topic.set_event_code(output);
        output
    }

    /// Report the staged code with one message parameter.
    pub fn call1(&mut self, first: impl Into<String>) -> ResultCode {
        self.task.last_error().lock().add_event_parameter(
            ParamKind::String,
            first,
            ParamSlot::MessageParam0,
        );
        self.call()
    }

    /// Report the staged code with two message parameters.
    pub fn call2(&mut self, first: impl Into<String>, second: impl Into<String>) -> ResultCode {
        {
            let topic = self.task.last_error();
            let mut error = topic.lock();
            error.add_event_parameter(ParamKind::String, first, ParamSlot::MessageParam0);
            error.add_event_parameter(ParamKind::String, second, ParamSlot::MessageParam1);
        }
        self.call()
    }

    pub fn code(&mut self, code: ResultCode) -> ResultCode {
        self.set_code(code).call()
    }

    pub fn with_message(&mut self, code: ResultCode, first: impl Into<String>) -> ResultCode {
        self.set_code(code).call1(first)
    }

    pub fn with_messages(
        &mut self,
        code: ResultCode,
        first: impl Into<String>,
        second: impl Into<String>,
    ) -> ResultCode {
        self.set_code(code).call2(first, second)
    }

    /// Copy a complete error event and report its code.
    pub fn from_event(&mut self, src: &VmEvent) -> ResultCode {
        self.task.last_error().assign(src);
        self.code(src.event_code())
    }
}
