//! State shared by every task: client binding, error state, cancellation,
//! exclusive execution and nested-task delegation.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::code::ResultCode;
use crate::error::{DispatchError, Result};
use crate::session::{flags, ClientRef, RequestPackage};
use crate::task::cancel::CancelOperationSupport;
use crate::task::exclusive::{ExclusiveClaim, ExclusiveRegistry};
use crate::task::runner::TaskHandle;
use crate::vm_event::{Topic, VmEvent};

/// Receives VM addition-state refresh requests around task execution.
pub trait AdditionStateSink: Send + Sync {
    /// Recalculate and publish the addition state of `vm_uuid`, ignoring the
    /// task `exclude` when it is given.
    fn refresh_addition_state(&self, vm_uuid: &str, vm_dir_uuid: &str, exclude: Option<Uuid>);
}

/// Who the task answers to.
#[derive(Clone)]
pub enum Ownership {
    /// Still bound to the session that created it.
    Owned(ClientRef),
    /// Reattached to `current` after `lost` went away.
    Reassigned { current: ClientRef, lost: ClientRef },
}

impl Ownership {
    /// Session that receives responses.
    pub fn current(&self) -> &ClientRef {
        match self {
            Ownership::Owned(client) => client,
            Ownership::Reassigned { current, .. } => current,
        }
    }

    /// Session whose credentials the task runs with.
    pub fn actual(&self) -> &ClientRef {
        match self {
            Ownership::Owned(client) => client,
            Ownership::Reassigned { lost, .. } => lost,
        }
    }

    fn reassign(self, new_client: ClientRef) -> Self {
        match self {
            Ownership::Owned(lost) | Ownership::Reassigned { lost, .. } => Ownership::Reassigned {
                current: new_client,
                lost,
            },
        }
    }
}

struct Binding {
    ownership: Ownership,
    request: RequestPackage,
    flags: u32,
    force_questions: bool,
}

impl Binding {
    fn parse_flags(&mut self) {
        self.flags = self.request.header.flags;
        if self.flags & flags::NON_INTERACTIVE_MODE != 0 {
            self.force_questions = true;
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Common part of every task.
///
/// Four independent locks guard the client binding, the task parameters, the
/// exclusive registry and the external task slot. None is held while waiting.
pub struct TaskHelper {
    kind: &'static str,
    job_uuid: Uuid,
    binding: Mutex<Binding>,
    last_error: Topic,
    params: Mutex<VmEvent>,
    cancel: CancelOperationSupport,
    exclusive: Option<ExclusiveClaim>,
    external: Mutex<Option<Arc<dyn TaskHandle>>>,
    addition_state: Option<Arc<dyn AdditionStateSink>>,
}

impl TaskHelper {
    /// Bind a new task of `kind` to a client and the request it answers.
    pub fn new(kind: &'static str, client: ClientRef, request: RequestPackage) -> Self {
        let mut binding = Binding {
            ownership: Ownership::Owned(client),
            request,
            flags: 0,
            force_questions: false,
        };
        binding.parse_flags();

        let helper = Self {
            kind,
            job_uuid: Uuid::new_v4(),
            binding: Mutex::new(binding),
            last_error: Topic::new(),
            params: Mutex::new(VmEvent::new()),
            cancel: CancelOperationSupport::new(),
            exclusive: None,
            external: Mutex::new(None),
            addition_state: None,
        };
        debug!(task = kind, job_id = %helper.job_uuid, "Task instantiated");
        helper
    }

    /// Send questions to the client during the task regardless of request flags.
    pub fn with_force_questions(self, force: bool) -> Self {
        lock(&self.binding).force_questions |= force;
        self
    }

    /// Allow only one task holding `key` in `registry` to execute at a time.
    pub fn with_exclusive(mut self, registry: Arc<ExclusiveRegistry>, key: impl Into<String>) -> Self {
        self.exclusive = Some(ExclusiveClaim::new(registry, key));
        self
    }

    pub fn with_addition_state_sink(mut self, sink: Arc<dyn AdditionStateSink>) -> Self {
        self.addition_state = Some(sink);
        self
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    pub fn job_uuid(&self) -> Uuid {
        self.job_uuid
    }

    // =========================================================================
    // Client binding
    // =========================================================================

    pub fn client(&self) -> ClientRef {
        lock(&self.binding).ownership.current().clone()
    }

    pub fn request_package(&self) -> RequestPackage {
        lock(&self.binding).request.clone()
    }

    pub fn request_flags(&self) -> u32 {
        lock(&self.binding).flags
    }

    /// Client and request read under one lock.
    pub fn binding(&self) -> (ClientRef, RequestPackage) {
        let binding = lock(&self.binding);
        (binding.ownership.current().clone(), binding.request.clone())
    }

    pub fn ownership(&self) -> Ownership {
        lock(&self.binding).ownership.clone()
    }

    /// Session whose identity the task acts under; stays the original
    /// session after a reassignment.
    pub fn actual_client(&self) -> ClientRef {
        lock(&self.binding).ownership.actual().clone()
    }

    pub fn force_questions_sign(&self) -> bool {
        lock(&self.binding).force_questions
    }

    pub fn should_be_canceled_on_client_disconnect(&self) -> bool {
        self.request_flags() & flags::CANCEL_TASK_ON_END_SESSION != 0
    }

    /// Hand the task over to `new_client`.
    ///
    /// The request is replaced by a copy of `new_request` that keeps the
    /// original command type. The first owner is remembered as the lost one.
    pub fn reassign_task(&self, new_client: ClientRef, new_request: &RequestPackage) {
        let mut binding = lock(&self.binding);

        let old_command = binding.request.header.command;
        info!(
            job_id = %self.job_uuid,
            from_session = %binding.ownership.current().client_handle(),
            to_session = %new_client.client_handle(),
            from_command = %old_command,
            to_command = %new_request.header.command,
            "Task would be reassigned"
        );

        let ownership = binding.ownership.clone();
        binding.ownership = ownership.reassign(new_client);
        binding.request = new_request.clone();
        binding.request.header.command = old_command;
        binding.parse_flags();
    }

    // =========================================================================
    // Error state
    // =========================================================================

    pub fn last_error(&self) -> &Topic {
        &self.last_error
    }

    pub fn last_error_code(&self) -> ResultCode {
        self.last_error.event_code()
    }

    pub fn set_last_error_code(&self, code: ResultCode) {
        self.last_error.set_event_code(code);
    }

    /// Scratch parameters of the task, locked for the lifetime of the guard.
    pub fn task_parameters(&self) -> MutexGuard<'_, VmEvent> {
        lock(&self.params)
    }

    /// Answer the client according to the last error.
    pub fn send_default_response(&self) {
        let (client, request) = self.binding();
        let code = self.last_error_code();
        if code.is_failed() {
            if self.operation_is_cancelled() {
                client.send_simple_response(&request, ResultCode::OperationWasCanceled);
            } else {
                client.send_response_error(&self.last_error.snapshot(), &request);
            }
        } else {
            client.send_simple_response(&request, code);
        }
    }

    // =========================================================================
    // Cancellation
    // =========================================================================

    pub fn cancel_support(&self) -> &CancelOperationSupport {
        &self.cancel
    }

    pub fn operation_is_cancelled(&self) -> bool {
        self.cancel.operation_is_cancelled()
    }

    /// Cancel this task and the nested task it currently waits for.
    pub fn cancel_operation(&self, user: Option<ClientRef>, request: Option<&RequestPackage>) {
        self.cancel.cancel_operation(user.clone(), request);

        let external = lock(&self.external);
        if let Some(task) = external.as_ref() {
            info!(
                job_id = %self.job_uuid,
                nested_job_id = %task.helper().job_uuid(),
                "Propagating cancel to nested task"
            );
            task.helper().cancel_support().cancel_operation(user, None);
        }
    }

    pub fn undo_cancelled(&self) {
        self.cancel.undo_cancelled();
    }

    // =========================================================================
    // Nested task
    // =========================================================================

    /// Nested task currently waited for.
    pub fn external_task(&self) -> Option<Arc<dyn TaskHandle>> {
        lock(&self.external).clone()
    }

    /// Run `task` to completion on behalf of this task and return its code.
    ///
    /// Only one nested level is tracked; a second concurrent call fails with
    /// [`DispatchError::NestedTaskActive`].
    pub async fn run_external_task(&self, task: Arc<dyn TaskHandle>) -> Result<ResultCode> {
        {
            let mut slot = lock(&self.external);
            if slot.is_some() {
                warn!(job_id = %self.job_uuid, "Nested task is already active");
                return Err(DispatchError::NestedTaskActive(self.job_uuid.to_string()));
            }
            *slot = Some(Arc::clone(&task));
        }

        if self.operation_is_cancelled() {
            task.helper()
                .cancel_support()
                .cancel_operation(self.cancel.canceller(), None);
        }

        let started = Arc::clone(&task).start();
        if started {
            task.wait().await;
        }
        *lock(&self.external) = None;

        if !started {
            return Ok(task.cancel_result());
        }
        Ok(task.helper().last_error_code())
    }

    // =========================================================================
    // Exclusive execution
    // =========================================================================

    /// Claim the exclusive key of this task kind.
    pub fn lock_to_execute(&self) -> bool {
        match &self.exclusive {
            Some(claim) => claim.lock(),
            None => false,
        }
    }

    /// Release the exclusive key if this task claimed it.
    pub fn unlock_to_execute(&self) {
        if let Some(claim) = &self.exclusive {
            claim.unlock();
        }
    }

    // =========================================================================
    // Misc
    // =========================================================================

    /// Whether `file_path` lies within the directory that holds `vm_home`.
    pub fn is_file_inside_vm_home(&self, file_path: &str, vm_home: &str) -> bool {
        if file_path.is_empty() || vm_home.is_empty() {
            return false;
        }
        match Path::new(vm_home).parent() {
            Some(dir) => Path::new(file_path).starts_with(dir),
            None => false,
        }
    }

    pub(crate) fn check_vm_addition_state(&self, vm_uuid: Option<&str>, exclude_self: bool) {
        let (Some(sink), Some(vm_uuid)) = (&self.addition_state, vm_uuid) else {
            return;
        };
        if vm_uuid.is_empty() {
            return;
        }
        let vm_dir_uuid = self.client().vm_directory_uuid();
        let exclude = exclude_self.then_some(self.job_uuid);
        sink.refresh_addition_state(vm_uuid, &vm_dir_uuid, exclude);
    }
}

impl Drop for TaskHelper {
    fn drop(&mut self) {
        self.unlock_to_execute();
        debug!(task = self.kind, job_id = %self.job_uuid, "Task destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{ClientSession, CommandType};
    use crate::testing::{helper, RecordingClient};

    #[test]
    fn test_reassign_preserves_command_type() {
        let (task, original) = helper("reassign");
        let old_command = task.request_package().header.command;

        let replacement = Arc::new(RecordingClient::new("replacement"));
        let package = RequestPackage::new(CommandType::VM_STOP, "{}")
            .with_flags(flags::NON_INTERACTIVE_MODE);
        task.reassign_task(replacement.clone(), &package);

        let request = task.request_package();
        assert_eq!(request.header.command, old_command);
        assert_eq!(request.header.uuid, package.header.uuid);
        assert_eq!(task.client().client_handle(), "replacement");
        assert_eq!(task.actual_client().client_handle(), original.client_handle());
        assert!(task.force_questions_sign());
    }

    #[test]
    fn test_second_reassign_keeps_first_lost_client() {
        let (task, original) = helper("reassign");
        let package = RequestPackage::new(CommandType::VM_STOP, "");

        task.reassign_task(Arc::new(RecordingClient::new("second")), &package);
        task.reassign_task(Arc::new(RecordingClient::new("third")), &package);

        assert_eq!(task.client().client_handle(), "third");
        assert_eq!(task.actual_client().client_handle(), original.client_handle());
    }

    #[test]
    fn test_exclusive_lock_is_mutually_exclusive() {
        let registry = Arc::new(ExclusiveRegistry::new());
        let (first, _) = helper("exclusive");
        let first = first.with_exclusive(registry.clone(), "exclusive");
        let (second, _) = helper("exclusive");
        let second = second.with_exclusive(registry.clone(), "exclusive");

        assert!(first.lock_to_execute());
        assert!(!second.lock_to_execute());

        second.unlock_to_execute();
        assert!(registry.is_claimed("exclusive"));

        first.unlock_to_execute();
        assert!(!registry.is_claimed("exclusive"));
        assert!(second.lock_to_execute());
    }

    #[test]
    fn test_lock_without_registry_fails() {
        let (task, _) = helper("plain");
        assert!(!task.lock_to_execute());
        task.unlock_to_execute();
    }

    #[test]
    fn test_file_inside_vm_home() {
        let (task, _) = helper("home");
        let home = "/vz/vmprivate/vm1/config.pvs";
        assert!(task.is_file_inside_vm_home("/vz/vmprivate/vm1/harddisk.hdd", home));
        assert!(!task.is_file_inside_vm_home("/vz/vmprivate/vm2/harddisk.hdd", home));
        assert!(!task.is_file_inside_vm_home("", home));
    }

    #[test]
    fn test_default_response_reports_cancel() {
        let (task, client) = helper("cancelled");
        task.set_last_error_code(ResultCode::BackupNotAttached);
        task.cancel_operation(None, None);

        task.send_default_response();

        assert_eq!(client.codes(), vec![ResultCode::OperationWasCanceled]);
    }

    #[test]
    fn test_default_response_sends_error_event() {
        let (task, client) = helper("failed");
        task.set_last_error_code(ResultCode::BackupNotAttached);

        task.send_default_response();

        assert_eq!(client.errors().len(), 1);
        assert_eq!(client.codes(), vec![ResultCode::BackupNotAttached]);
    }
}
