//! Registry of live tasks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::error::{DispatchError, Result};
use crate::session::{ClientRef, RequestPackage};
use crate::task::exclusive::ExclusiveRegistry;
use crate::task::runner::TaskHandle;

/// Time given to running tasks to react to cancellation on shutdown.
pub const DEFAULT_TERMINATE_TIMEOUT: Duration = Duration::from_secs(7);

const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Tracks every registered task by job id and owns the exclusive registry.
pub struct TaskManager {
    tasks: RwLock<HashMap<Uuid, Arc<dyn TaskHandle>>>,
    exclusive: Arc<ExclusiveRegistry>,
    deinited: AtomicBool,
}

impl Default for TaskManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskManager {
    pub fn new() -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
            exclusive: Arc::new(ExclusiveRegistry::new()),
            deinited: AtomicBool::new(false),
        }
    }

    pub fn exclusive_registry(&self) -> Arc<ExclusiveRegistry> {
        Arc::clone(&self.exclusive)
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<Uuid, Arc<dyn TaskHandle>>> {
        self.tasks.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<Uuid, Arc<dyn TaskHandle>>> {
        self.tasks.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a task before it is started.
    ///
    /// After shutdown the task is cancelled instead, so that its `start`
    /// refuses to run.
    pub fn register_task(&self, task: Arc<dyn TaskHandle>) -> Result<Arc<dyn TaskHandle>> {
        let job_id = task.helper().job_uuid();

        if self.deinited.load(Ordering::SeqCst) {
            warn!(task = task.kind(), job_id = %job_id, "Task manager is shut down, cancelling task");
            task.helper().cancel_operation(None, None);
            return Ok(task);
        }

        let mut tasks = self.write();
        if tasks.contains_key(&job_id) {
            return Err(DispatchError::TaskAlreadyRegistered(job_id.to_string()));
        }
        tasks.insert(job_id, Arc::clone(&task));
        info!(task = task.kind(), job_id = %job_id, total = tasks.len(), "Task registered");
        Ok(task)
    }

    pub fn find_task(&self, job_id: &Uuid) -> Option<Arc<dyn TaskHandle>> {
        self.read().get(job_id).cloned()
    }

    pub fn unregister_task(&self, job_id: &Uuid) -> Option<Arc<dyn TaskHandle>> {
        self.write().remove(job_id)
    }

    /// Cancel a task on behalf of `user`, answering `request`.
    #[instrument(skip(self, user, request))]
    pub fn cancel_task(&self, user: ClientRef, job_id: &Uuid, request: &RequestPackage) -> Result<()> {
        let task = self
            .find_task(job_id)
            .ok_or_else(|| DispatchError::TaskNotFound(job_id.to_string()))?;
        info!(task = task.kind(), session = %user.client_handle(), "Cancelling task");
        task.helper().cancel_operation(Some(user), Some(request));
        Ok(())
    }

    /// Tasks currently bound to the session `client_handle`.
    pub fn tasks_by_session(&self, client_handle: &str) -> Vec<Arc<dyn TaskHandle>> {
        self.read()
            .values()
            .filter(|task| task.helper().client().client_handle() == client_handle)
            .cloned()
            .collect()
    }

    /// Tasks answering the request with correlation id `request_uuid`.
    pub fn tasks_by_request(&self, request_uuid: &Uuid) -> Vec<Arc<dyn TaskHandle>> {
        self.read()
            .values()
            .filter(|task| task.helper().request_package().header.uuid == *request_uuid)
            .cloned()
            .collect()
    }

    /// Drop finished tasks from the registry and return how many were removed.
    pub fn clean_finished_tasks(&self) -> usize {
        let mut tasks = self.write();
        let before = tasks.len();
        tasks.retain(|_, task| !task.is_finished());
        before - tasks.len()
    }

    pub fn has_any_tasks(&self) -> bool {
        self.read().values().any(|task| !task.is_finished())
    }

    /// Hand a task over to a new session and revive it if it was cancelled
    /// because its previous session went away.
    pub fn reattach_task(&self, job_id: &Uuid, client: ClientRef, request: &RequestPackage) -> Result<()> {
        let task = self
            .find_task(job_id)
            .ok_or_else(|| DispatchError::TaskNotFound(job_id.to_string()))?;
        task.helper().undo_cancelled();
        task.helper().reassign_task(client, request);
        Ok(())
    }

    /// Cancel the tasks of a closed session that asked to be cancelled with it.
    pub fn on_client_disconnected(&self, client_handle: &str) -> usize {
        let mut cancelled = 0;
        for task in self.tasks_by_session(client_handle) {
            let helper = task.helper();
            if task.is_finished() || !helper.should_be_canceled_on_client_disconnect() {
                continue;
            }
            info!(job_id = %helper.job_uuid(), session = client_handle, "Cancelling task of closed session");
            helper.cancel_operation(None, None);
            cancelled += 1;
        }
        cancelled
    }

    /// Cancel all tasks, give them `timeout` to finish and terminate the rest.
    ///
    /// Tasks registered afterwards are cancelled on registration.
    pub async fn shutdown(&self, timeout: Duration) {
        self.deinited.store(true, Ordering::SeqCst);

        let running: Vec<_> = self
            .read()
            .values()
            .filter(|task| !task.is_finished())
            .cloned()
            .collect();
        info!(count = running.len(), "Shutting down task manager");

        for task in &running {
            task.helper().cancel_operation(None, None);
        }

        let deadline = Instant::now() + timeout;
        while running.iter().any(|task| task.is_running()) && Instant::now() < deadline {
            tokio::time::sleep(SHUTDOWN_POLL_INTERVAL).await;
        }

        for task in running.iter().filter(|task| task.is_running()) {
            warn!(task = task.kind(), job_id = %task.helper().job_uuid(), "Task did not stop in time");
            task.terminate();
            task.wait().await;
        }

        self.write().clear();
    }
}
