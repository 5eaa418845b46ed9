//! Submits backup-device events as tasks, either standalone or nested in a
//! parent task.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::backup::backend::{AttachedDisk, BackupBackend};
use crate::backup::disk::{read, HardDisk};
use crate::backup::event::{Enable, Setup};
use crate::code::ResultCode;
use crate::error::DispatchError;
use crate::session::{ClientRef, CommandType, RequestPackage};
use crate::task::{Task, TaskBody, TaskFailure, TaskHandle, TaskHelper, TaskManager};

/// Body of a `VM_BACKUP_ATTACH` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachRequest {
    pub vm_uuid: String,
    pub vm_home: String,
    pub disk: HardDisk,
}

/// Body of a `VM_BACKUP_CONNECT_SOURCE` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectSourceRequest {
    pub vm_uuid: String,
    pub disk: HardDisk,
}

fn parse_body<T: for<'de> Deserialize<'de>>(task: &TaskHelper) -> Result<T, ResultCode> {
    serde_json::from_str(&task.request_package().body).map_err(|e| {
        let error = DispatchError::from(e);
        TaskFailure::new(task).with_message(error.code(), error.to_string())
    })
}

// =============================================================================
// Attach
// =============================================================================

/// Exposes a backup entry as a device for a VE.
///
/// The outcome is read by whoever submitted the task, so finalization does
/// not answer the client.
pub struct AttachBackupTask {
    backend: Arc<dyn BackupBackend>,
    request: Mutex<Option<AttachRequest>>,
    result: Mutex<Option<AttachedDisk>>,
}

impl AttachBackupTask {
    pub fn new(backend: Arc<dyn BackupBackend>) -> Self {
        Self {
            backend,
            request: Mutex::new(None),
            result: Mutex::new(None),
        }
    }

    /// The attachment created by a successful run.
    pub fn result(&self) -> Option<AttachedDisk> {
        self.result.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl TaskBody for AttachBackupTask {
    async fn prepare_task(&self, task: &Arc<TaskHelper>) -> ResultCode {
        match parse_body::<AttachRequest>(task) {
            Ok(request) => {
                *self.request.lock().unwrap_or_else(|e| e.into_inner()) = Some(request);
                ResultCode::Success
            }
            Err(code) => code,
        }
    }

    async fn run_body(&self, task: &Arc<TaskHelper>) -> ResultCode {
        if task.operation_is_cancelled() {
            return TaskFailure::new(task).code(ResultCode::OperationWasCanceled);
        }
        let request = self.request.lock().unwrap_or_else(|e| e.into_inner()).clone();
        let Some(request) = request else {
            return TaskFailure::new(task).code(ResultCode::Uninitialized);
        };

        match self
            .backend
            .attach(&request.vm_uuid, &request.vm_home, &request.disk)
            .await
        {
            Ok(attached) => {
                debug!(vm_uuid = %request.vm_uuid, device = %attached.device_path, "Backup attached");
                *self.result.lock().unwrap_or_else(|e| e.into_inner()) = Some(attached);
                ResultCode::Success
            }
            Err(e) => {
                warn!(vm_uuid = %request.vm_uuid, error = %e, "Failed to attach backup");
                TaskFailure::new(task).with_messages(e.code(), request.disk.storage_url, e.to_string())
            }
        }
    }

    async fn finalize_task(&self, task: &Arc<TaskHelper>) {
        debug!(job_id = %task.job_uuid(), code = %task.last_error_code(), "Attach finished");
    }

    fn vm_uuid(&self) -> Option<String> {
        self.request
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|r| r.vm_uuid.clone())
    }
}

// =============================================================================
// Connect source
// =============================================================================

/// Connects an attached backup entry to the VE.
pub struct ConnectBackupSourceTask {
    backend: Arc<dyn BackupBackend>,
    request: Mutex<Option<ConnectSourceRequest>>,
}

impl ConnectBackupSourceTask {
    pub fn new(backend: Arc<dyn BackupBackend>) -> Self {
        Self {
            backend,
            request: Mutex::new(None),
        }
    }
}

#[async_trait]
impl TaskBody for ConnectBackupSourceTask {
    async fn prepare_task(&self, task: &Arc<TaskHelper>) -> ResultCode {
        match parse_body::<ConnectSourceRequest>(task) {
            Ok(request) => {
                *self.request.lock().unwrap_or_else(|e| e.into_inner()) = Some(request);
                ResultCode::Success
            }
            Err(code) => code,
        }
    }

    async fn run_body(&self, task: &Arc<TaskHelper>) -> ResultCode {
        if task.operation_is_cancelled() {
            return TaskFailure::new(task).code(ResultCode::OperationWasCanceled);
        }
        let request = self.request.lock().unwrap_or_else(|e| e.into_inner()).clone();
        let Some(request) = request else {
            return TaskFailure::new(task).code(ResultCode::Uninitialized);
        };

        match self.backend.connect_source(&request.vm_uuid, &request.disk).await {
            Ok(()) => ResultCode::Success,
            Err(e) => {
                warn!(vm_uuid = %request.vm_uuid, error = %e, "Failed to connect backup source");
                TaskFailure::new(task).with_message(e.code(), request.disk.storage_url)
            }
        }
    }

    async fn finalize_task(&self, task: &Arc<TaskHelper>) {
        debug!(job_id = %task.job_uuid(), code = %task.last_error_code(), "Connect source finished");
    }

    fn vm_uuid(&self) -> Option<String> {
        self.request
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|r| r.vm_uuid.clone())
    }
}

// =============================================================================
// Unit
// =============================================================================

/// How submitted tasks are run.
#[derive(Clone)]
pub enum Mode {
    /// Started and awaited directly
    Alone,
    /// Run as the nested task of a parent
    Nested(Arc<TaskHelper>),
}

/// Task submission sink for backup-device events.
#[derive(Clone)]
pub struct Unit {
    mode: Mode,
    user: ClientRef,
    manager: Arc<TaskManager>,
    backend: Arc<dyn BackupBackend>,
    result: Option<Arc<dyn TaskHandle>>,
}

impl Unit {
    /// Run tasks standalone on behalf of `user`.
    pub fn alone(user: ClientRef, manager: Arc<TaskManager>, backend: Arc<dyn BackupBackend>) -> Self {
        Self {
            mode: Mode::Alone,
            user,
            manager,
            backend,
            result: None,
        }
    }

    /// Run tasks nested in `parent`, on behalf of its client.
    pub fn nested(parent: &Arc<TaskHelper>, manager: Arc<TaskManager>, backend: Arc<dyn BackupBackend>) -> Self {
        Self {
            mode: Mode::Nested(Arc::clone(parent)),
            user: parent.client(),
            manager,
            backend,
            result: None,
        }
    }

    pub fn backend(&self) -> &Arc<dyn BackupBackend> {
        &self.backend
    }

    /// Last submitted task, if its registration succeeded.
    pub fn result(&self) -> Option<Arc<dyn TaskHandle>> {
        self.result.clone()
    }

    /// Attachment produced by the last submitted attach task.
    pub fn attached(&self) -> Option<AttachedDisk> {
        let task = self.result.clone()?;
        let task = task.as_any().downcast::<Task<AttachBackupTask>>().ok()?;
        task.body().result()
    }

    /// Request envelope for a submitted task.
    ///
    /// Nested requests copy the parent's header, so they share its
    /// correlation id and flags.
    pub fn request(&self, command: CommandType, body: impl Into<String>) -> RequestPackage {
        match &self.mode {
            Mode::Alone => RequestPackage::new(command, body),
            Mode::Nested(parent) => {
                let mut request = parent.request_package().duplicate_with_body(body);
                request.header.command = command;
                request
            }
        }
    }

    pub async fn setup(&mut self, event: &Setup) -> ResultCode {
        let body = AttachRequest {
            vm_uuid: event.vm_uuid.clone(),
            vm_home: event.vm_home.clone(),
            disk: read(&event.disk).clone(),
        };
        let task = AttachBackupTask::new(Arc::clone(&self.backend));
        self.submit("attach_backup", CommandType::VM_BACKUP_ATTACH, &body, task)
            .await
    }

    pub async fn enable(&mut self, event: &Enable) -> ResultCode {
        let body = ConnectSourceRequest {
            vm_uuid: event.vm_uuid.clone(),
            disk: read(&event.disk).clone(),
        };
        let task = ConnectBackupSourceTask::new(Arc::clone(&self.backend));
        self.submit(
            "connect_backup_source",
            CommandType::VM_BACKUP_CONNECT_SOURCE,
            &body,
            task,
        )
        .await
    }

    async fn submit<T: Serialize + Sync, B: TaskBody>(
        &mut self,
        kind: &'static str,
        command: CommandType,
        body: &T,
        task: B,
    ) -> ResultCode {
        self.result = None;

        let body = match serde_json::to_string(body) {
            Ok(body) => body,
            Err(e) => return DispatchError::from(e).code(),
        };
        let helper = TaskHelper::new(kind, Arc::clone(&self.user), self.request(command, body));
        let task: Arc<dyn TaskHandle> = Task::new(helper, task);

        let task = match self.manager.register_task(task) {
            Ok(task) => task,
            Err(e) => {
                warn!(task = kind, error = %e, "Failed to register task");
                return ResultCode::OperationWasCanceled;
            }
        };
        self.result = Some(Arc::clone(&task));

        let code = match &self.mode {
            Mode::Alone => {
                if Arc::clone(&task).start() {
                    task.wait().await;
                    task.helper().last_error_code()
                } else {
                    task.cancel_result()
                }
            }
            Mode::Nested(parent) => parent
                .run_external_task(Arc::clone(&task))
                .await
                .unwrap_or_else(|e| e.code()),
        };

        self.manager.unregister_task(&task.helper().job_uuid());
        code
    }
}
