//! Visitors that apply backup-device events.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use crate::backup::agent::Unit;
use crate::backup::backend::{AttachedDisk, BackupBackend, VeState};
use crate::backup::disk::{read, BackupResource};
use crate::backup::event::{Cleanup, Disconnect, Enable, Setup, Visitor};
use crate::code::ResultCode;
use crate::vm_event::Topic;

/// Detaches the backup disk of a disable or teardown event.
pub struct Disconnector {
    topic: Option<Topic>,
    hdd: Option<AttachedDisk>,
}

impl Disconnector {
    pub fn new(topic: Option<Topic>) -> Self {
        Self { topic, hdd: None }
    }

    /// Attachment opened by the last call.
    pub fn hdd(&self) -> Option<&AttachedDisk> {
        self.hdd.as_ref()
    }

    /// Disable the device and drop its image. The attachment itself is kept.
    pub async fn disconnect(&mut self, backend: &dyn BackupBackend, event: &Disconnect) -> ResultCode {
        self.hdd = None;
        let disk = read(&event.disk).clone();

        let hdd = match backend.open(&event.vm_uuid, &event.vm_home, &disk).await {
            Ok(hdd) => hdd,
            Err(e) => {
                warn!(vm_uuid = %event.vm_uuid, url = %disk.storage_url, error = %e, "Cannot open backup disk");
                let code = e.code();
                if let Some(topic) = &self.topic {
                    topic.set_event_code(code);
                }
                return code;
            }
        };

        if let Err(e) = backend.disable(&hdd).await {
            warn!(device = %hdd.device_path, error = %e, "Failed to disable backup device");
        }
        if backend.image_exists(&hdd.vm_uuid, &hdd.resource).await {
            if let Err(e) = backend.remove_image(&hdd.vm_uuid, &hdd.resource).await {
                warn!(image = %hdd.image_path, error = %e, "Failed to remove backup image");
            }
        }

        self.hdd = Some(hdd);
        ResultCode::Success
    }
}

/// Applies events against the backend, delegating attach and connect to an agent.
pub struct Handler {
    agent: Option<Unit>,
    backend: Arc<dyn BackupBackend>,
    topic: Option<Topic>,
}

impl Handler {
    pub fn new(backend: Arc<dyn BackupBackend>) -> Self {
        Self {
            agent: None,
            backend,
            topic: None,
        }
    }

    pub fn with_agent(backend: Arc<dyn BackupBackend>, agent: Unit) -> Self {
        Self {
            agent: Some(agent),
            backend,
            topic: None,
        }
    }

    pub fn set_agent(&mut self, agent: Unit) {
        self.agent = Some(agent);
    }

    pub fn backend(&self) -> &Arc<dyn BackupBackend> {
        &self.backend
    }

    fn record(&self, code: ResultCode) -> ResultCode {
        if let Some(topic) = &self.topic {
            topic.set_event_code(code);
        }
        code
    }

    /// Record a failed agent call: the error of the failed task when it
    /// carries one, the bare code otherwise.
    fn delegated(&self, code: ResultCode) -> ResultCode {
        if code.is_succeeded() {
            return ResultCode::Success;
        }
        let Some(topic) = &self.topic else {
            return code;
        };
        let failed = self
            .agent
            .as_ref()
            .and_then(Unit::result)
            .map(|task| task.helper().last_error().snapshot())
            .filter(|error| error.event_code() == code);
        match failed {
            Some(error) => topic.assign(&error),
            None => topic.set_event_code(code),
        }
        code
    }

    async fn rollback(&self, hdd: &AttachedDisk) {
        if let Err(e) = self.backend.disable(hdd).await {
            warn!(device = %hdd.device_path, error = %e, "Rollback: disable failed");
        }
        if let Err(e) = self.backend.remove_image(&hdd.vm_uuid, &hdd.resource).await {
            warn!(image = %hdd.image_path, error = %e, "Rollback: image removal failed");
        }
        if let Err(e) = self.backend.destroy(hdd).await {
            warn!(device = %hdd.device_path, error = %e, "Rollback: destroy failed");
        }
    }
}

#[async_trait]
impl Visitor for Handler {
    #[instrument(skip(self, event), fields(vm_uuid = %event.vm_uuid))]
    async fn visit_setup(&mut self, event: &Setup) -> ResultCode {
        let Some(agent) = self.agent.as_mut() else {
            return self.record(ResultCode::Uninitialized);
        };
        let code = agent.setup(event).await;
        if code.is_failed() {
            return self.delegated(code);
        }

        let Some(attached) = agent.attached() else {
            return self.record(ResultCode::BackupNotAttached);
        };
        if let Err(e) = event.set_model(&attached) {
            warn!(error = %e, "Attached backup has no device, rolling back");
            self.rollback(&attached).await;
            return self.record(e.code());
        }

        info!(device = %attached.device_path, "Backup disk set up");
        ResultCode::Success
    }

    #[instrument(skip(self, event), fields(vm_uuid = %event.vm_uuid))]
    async fn visit_enable(&mut self, event: &Enable) -> ResultCode {
        let Some(agent) = self.agent.as_mut() else {
            return self.record(ResultCode::Uninitialized);
        };
        let code = agent.enable(event).await;
        self.delegated(code)
    }

    async fn visit_disable(&mut self, event: &Disconnect) -> ResultCode {
        Disconnector::new(self.topic.clone())
            .disconnect(self.backend.as_ref(), event)
            .await
    }

    async fn visit_teardown(&mut self, event: &Disconnect) -> ResultCode {
        let mut disconnector = Disconnector::new(self.topic.clone());
        let code = disconnector.disconnect(self.backend.as_ref(), event).await;
        if code.is_failed() {
            return code;
        }

        if let Some(hdd) = disconnector.hdd() {
            if let Err(e) = self.backend.destroy(hdd).await {
                warn!(device = %hdd.device_path, error = %e, "Failed to destroy backup device");
            }
        }
        ResultCode::Success
    }

    async fn visit_cleanup(&mut self, event: &Cleanup) -> ResultCode {
        let url = read(&event.disk).storage_url.clone();
        let resource = match BackupResource::parse(&url) {
            Ok(resource) => resource,
            Err(e) => {
                warn!(vm_uuid = %event.vm_uuid, error = %e, "Cannot clean up disk");
                return self.record(e.code());
            }
        };

        if self.backend.image_exists(&event.vm_uuid, &resource).await {
            if let Err(e) = self.backend.remove_image(&event.vm_uuid, &resource).await {
                warn!(resource = %resource, error = %e, "Failed to remove backup image");
            }
        }
        debug!(vm_uuid = %event.vm_uuid, resource = %resource, "Backup disk cleaned up");
        ResultCode::Success
    }

    fn set_topic(&mut self, topic: Option<Topic>) {
        self.topic = topic;
    }
}

/// Visitor for a configuration edit: enables and disables only apply to a
/// running VE, a stopped one picks them up on its next start.
///
/// Teardown always applies. The removed disk is no longer in the
/// configuration, so nothing would release its attachment later.
pub struct EditVm {
    handler: Handler,
}

impl EditVm {
    pub fn new(handler: Handler) -> Self {
        Self { handler }
    }

    async fn is_running(&self, vm_uuid: &str) -> bool {
        self.handler.backend.ve_state(vm_uuid).await == VeState::Running
    }
}

#[async_trait]
impl Visitor for EditVm {
    async fn visit_setup(&mut self, event: &Setup) -> ResultCode {
        self.handler.visit_setup(event).await
    }

    async fn visit_enable(&mut self, event: &Enable) -> ResultCode {
        if !self.is_running(&event.vm_uuid).await {
            debug!(vm_uuid = %event.vm_uuid, "VE is not running, enable deferred");
            return ResultCode::Success;
        }
        self.handler.visit_enable(event).await
    }

    async fn visit_disable(&mut self, event: &Disconnect) -> ResultCode {
        if !self.is_running(&event.vm_uuid).await {
            debug!(vm_uuid = %event.vm_uuid, "VE is not running, disable deferred");
            return ResultCode::Success;
        }
        self.handler.visit_disable(event).await
    }

    async fn visit_teardown(&mut self, event: &Disconnect) -> ResultCode {
        self.handler.visit_teardown(event).await
    }

    async fn visit_cleanup(&mut self, event: &Cleanup) -> ResultCode {
        self.handler.visit_cleanup(event).await
    }

    fn set_topic(&mut self, topic: Option<Topic>) {
        self.handler.set_topic(topic);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::disk::{share, HardDisk};
    use crate::backup::event::Event;
    use crate::backup::mock::{BackendOp, MockBackupBackend};
    use crate::error::DispatchError;
    use crate::task::TaskManager;
    use crate::testing::RecordingClient;

    fn handler(backend: &Arc<MockBackupBackend>) -> Handler {
        let agent = Unit::alone(
            Arc::new(RecordingClient::new("user")),
            Arc::new(TaskManager::new()),
            backend.clone(),
        );
        Handler::with_agent(backend.clone(), agent)
    }

    #[tokio::test]
    async fn test_setup_writes_device_into_disk() {
        let backend = Arc::new(MockBackupBackend::new());
        let mut handler = handler(&backend);
        let disk = share(HardDisk::backed_by(0, "backup://b1/d1"));

        let code = Event::setup("vm1", "/vz/vm1", &disk).accept(&mut handler).await;

        assert_eq!(code, ResultCode::Success);
        assert!(read(&disk).system_name.starts_with("/dev/buse"));
        assert_eq!(backend.attached_count(), 1);
    }

    #[tokio::test]
    async fn test_setup_failure_copies_task_error_into_topic() {
        let backend = Arc::new(MockBackupBackend::new());
        backend.fail_on(BackendOp::Attach, DispatchError::AttachFailed("busy".into()));
        let mut handler = handler(&backend);
        let topic = Topic::new();
        handler.set_topic(Some(topic.clone()));
        let disk = share(HardDisk::backed_by(0, "backup://b1/d1"));

        let code = Event::setup("vm1", "/vz/vm1", &disk).accept(&mut handler).await;

        assert_eq!(code, ResultCode::BackupAttachFailed);
        let error = topic.snapshot();
        assert_eq!(error.event_code(), ResultCode::BackupAttachFailed);
        assert_eq!(
            error.parameter(crate::vm_event::ParamSlot::MessageParam0),
            Some("backup://b1/d1")
        );
        assert!(read(&disk).system_name.is_empty());
    }

    #[tokio::test]
    async fn test_handler_without_agent_is_uninitialized() {
        let backend = Arc::new(MockBackupBackend::new());
        let mut handler = Handler::new(backend);
        let topic = Topic::new();
        handler.set_topic(Some(topic.clone()));
        let disk = share(HardDisk::backed_by(0, "backup://b1/d1"));

        let code = Event::enable("vm1", &disk).accept(&mut handler).await;

        assert_eq!(code, ResultCode::Uninitialized);
        assert_eq!(topic.event_code(), ResultCode::Uninitialized);
    }

    #[tokio::test]
    async fn test_disable_keeps_attachment_teardown_destroys() {
        let backend = Arc::new(MockBackupBackend::new());
        let mut handler = handler(&backend);
        let attached = backend.seed_attachment("vm1", "/vz/vm1", "backup://b1/d1").unwrap();
        let disk = share(HardDisk::backed_by(0, "backup://b1/d1"));

        let code = Event::disable("vm1", "/vz/vm1", &disk).accept(&mut handler).await;
        assert_eq!(code, ResultCode::Success);
        assert_eq!(backend.attachment("vm1", &attached.resource).map(|a| a.1), Some(false));
        assert_eq!(backend.image_count(), 0);

        let code = Event::teardown("vm1", "/vz/vm1", &disk).accept(&mut handler).await;
        assert_eq!(code, ResultCode::Success);
        assert_eq!(backend.attached_count(), 0);
    }

    #[tokio::test]
    async fn test_disable_of_unmounted_disk_is_reported() {
        let backend = Arc::new(MockBackupBackend::new());
        let mut handler = handler(&backend);
        let topic = Topic::new();
        handler.set_topic(Some(topic.clone()));
        let disk = share(HardDisk::backed_by(0, "backup://b1/d1"));

        let code = Event::teardown("vm1", "/vz/vm1", &disk).accept(&mut handler).await;

        assert_eq!(code, ResultCode::BackupNotAttached);
        assert_eq!(topic.event_code(), ResultCode::BackupNotAttached);
    }

    #[tokio::test]
    async fn test_cleanup_removes_image_only() {
        let backend = Arc::new(MockBackupBackend::new());
        let mut handler = handler(&backend);
        backend.seed_attachment("vm1", "/vz/vm1", "backup://b1/d1").unwrap();
        let disk = share(HardDisk::backed_by(0, "backup://b1/d1"));

        let code = Event::cleanup("vm1", &disk).accept(&mut handler).await;

        assert_eq!(code, ResultCode::Success);
        assert_eq!(backend.image_count(), 0);
        assert_eq!(backend.attached_count(), 1);

        let bogus = share(HardDisk::backed_by(1, "file:///vz/disk.hdd"));
        let code = Event::cleanup("vm1", &bogus).accept(&mut handler).await;
        assert_eq!(code, ResultCode::InvalidArgument);
    }

    #[tokio::test]
    async fn test_edit_vm_defers_live_changes_when_stopped() {
        let backend = Arc::new(MockBackupBackend::new());
        backend.seed_attachment("vm1", "/vz/vm1", "backup://b1/d1").unwrap();
        let mut edit = EditVm::new(handler(&backend));
        let disk = share(HardDisk::backed_by(0, "backup://b1/d1"));
        let resource = BackupResource::parse("backup://b1/d1").unwrap();

        let code = Event::disable("vm1", "/vz/vm1", &disk).accept(&mut edit).await;
        assert_eq!(code, ResultCode::Success);
        assert_eq!(backend.attachment("vm1", &resource).map(|a| a.1), Some(true));
        assert!(backend.journal().is_empty());

        backend.set_ve_state("vm1", VeState::Running);
        let code = Event::disable("vm1", "/vz/vm1", &disk).accept(&mut edit).await;
        assert_eq!(code, ResultCode::Success);
        assert_eq!(backend.attachment("vm1", &resource).map(|a| a.1), Some(false));
    }

    #[tokio::test]
    async fn test_edit_vm_tears_down_even_when_stopped() {
        let backend = Arc::new(MockBackupBackend::new());
        backend.seed_attachment("vm1", "/vz/vm1", "backup://b1/d1").unwrap();
        let mut edit = EditVm::new(handler(&backend));
        let disk = share(HardDisk::backed_by(0, "backup://b1/d1"));

        let code = Event::teardown("vm1", "/vz/vm1", &disk).accept(&mut edit).await;

        assert_eq!(code, ResultCode::Success);
        assert_eq!(backend.attached_count(), 0);
    }
}
