//! Entry points used by VE operations to manage backup disks.

use std::sync::{Arc, RwLock};

use tracing::{info, instrument, warn};

use crate::backup::agent::Unit;
use crate::backup::backend::BackupBackend;
use crate::backup::difference::{Difference, Transition};
use crate::backup::disk::{read, Finding, SharedDisk, VeConfig, VeType};
use crate::backup::event::{Cleanup, Disconnect, Enable, Event, Visitor};
use crate::backup::factory::Factory;
use crate::backup::handler::Handler;
use crate::code::ResultCode;
use crate::task::{TaskHelper, TaskManager};
use crate::vm_event::Topic;

/// A VE configuration shared with its owner.
pub type SharedConfig = Arc<RwLock<VeConfig>>;

/// Backup disks of one VE configuration.
#[derive(Clone)]
pub struct Dao {
    config: SharedConfig,
}

impl Dao {
    pub fn new(config: SharedConfig) -> Self {
        Self { config }
    }

    fn select(&self, enabled: bool) -> Vec<SharedDisk> {
        let config = self.config.read().unwrap_or_else(|e| e.into_inner());
        config
            .hard_disks
            .iter()
            .filter(|d| {
                let disk = read(d);
                let finding = Finding::new(&disk);
                finding.is_kind_of() && finding.is_enabled() == enabled
            })
            .cloned()
            .collect()
    }

    /// Enabled backup disks followed by disabled ones.
    pub fn get_all(&self) -> Vec<SharedDisk> {
        let mut all = self.get_enabled();
        all.extend(self.get_disabled());
        all
    }

    pub fn get_enabled(&self) -> Vec<SharedDisk> {
        self.select(true)
    }

    pub fn get_disabled(&self) -> Vec<SharedDisk> {
        self.select(false)
    }

    /// Every disk of the configuration, backup or not.
    pub fn get_hardware(&self) -> Vec<SharedDisk> {
        let config = self.config.read().unwrap_or_else(|e| e.into_inner());
        config.hard_disks.clone()
    }

    /// Difference from the backup disks of this configuration to those of `new`.
    ///
    /// Validation sees the complete hardware lists.
    pub fn difference(&self, new: &Dao, factory: Factory) -> Difference {
        Difference::new(self.get_all(), new.get_all(), factory)
            .with_hardware(&self.get_hardware(), &new.get_hardware())
    }

    /// Drop every backup disk from the configuration. Returns whether any existed.
    pub fn delete_all(&self) -> bool {
        let all = self.get_all();
        let mut config = self.config.write().unwrap_or_else(|e| e.into_inner());
        config
            .hard_disks
            .retain(|d| !all.iter().any(|gone| Arc::ptr_eq(gone, d)));
        !all.is_empty()
    }
}

/// VE identity plus the visitor events are applied with.
pub struct Framework {
    vm_uuid: String,
    vm_home: String,
    ve_type: VeType,
    backend: Arc<dyn BackupBackend>,
    topic: Option<Topic>,
    visitor: Box<dyn Visitor>,
}

impl Framework {
    /// Framework for a VE whose files live in `vm_home`, applying events
    /// with a [`Handler`] that has no agent yet.
    pub fn new(vm_uuid: impl Into<String>, vm_home: impl Into<String>, ve_type: VeType, backend: Arc<dyn BackupBackend>) -> Self {
        Self {
            vm_uuid: vm_uuid.into(),
            vm_home: vm_home.into(),
            ve_type,
            visitor: Box::new(Handler::new(Arc::clone(&backend))),
            backend,
            topic: None,
        }
    }

    pub fn vm_uuid(&self) -> &str {
        &self.vm_uuid
    }

    pub fn vm_home(&self) -> &str {
        &self.vm_home
    }

    pub fn set_vm_home(&mut self, value: impl Into<String>) {
        self.vm_home = value.into();
    }

    /// Apply events through `agent`, recording failures into `topic`.
    pub fn set_context_agent(&mut self, agent: Unit, topic: Option<Topic>) {
        self.visitor = Box::new(Handler::with_agent(Arc::clone(&self.backend), agent));
        self.topic = topic;
    }

    /// Apply events as nested tasks of `parent`, recording failures into its last error.
    pub fn set_context_task(&mut self, parent: &Arc<TaskHelper>, manager: Arc<TaskManager>) {
        let agent = Unit::nested(parent, manager, Arc::clone(&self.backend));
        self.visitor = Box::new(Handler::with_agent(Arc::clone(&self.backend), agent));
        self.topic = Some(parent.last_error().clone());
    }

    pub fn set_visitor(&mut self, visitor: Box<dyn Visitor>) {
        self.visitor = visitor;
    }

    pub fn set_topic(&mut self, topic: Option<Topic>) {
        self.topic = topic;
    }

    fn factory(&self) -> Factory {
        Factory::new(self.vm_uuid.clone(), self.vm_home.clone(), self.ve_type)
    }

    async fn visit(&mut self, event: Event) -> ResultCode {
        self.visitor.set_topic(self.topic.clone());
        let code = event.accept(self.visitor.as_mut()).await;
        self.visitor.set_topic(None);
        code
    }
}

/// Backup disks of one VE, managed as a whole.
pub struct Service {
    framework: Framework,
    dao: Dao,
}

impl Service {
    /// Service over `config`. The events of a VM refer to the directory of
    /// its configuration file.
    pub fn new(config: SharedConfig, backend: Arc<dyn BackupBackend>) -> Self {
        let (uuid, home, ve_type) = {
            let c = config.read().unwrap_or_else(|e| e.into_inner());
            (c.uuid.clone(), c.home_dir(), c.ve_type)
        };
        Self {
            framework: Framework::new(uuid, home, ve_type, backend),
            dao: Dao::new(config),
        }
    }

    pub fn dao(&self) -> &Dao {
        &self.dao
    }

    pub fn framework(&self) -> &Framework {
        &self.framework
    }

    pub fn set_vm_home(&mut self, value: impl Into<String>) -> &mut Self {
        self.framework.set_vm_home(value);
        self
    }

    pub fn set_context_agent(&mut self, agent: Unit, topic: Option<Topic>) -> &mut Self {
        self.framework.set_context_agent(agent, topic);
        self
    }

    pub fn set_context_task(&mut self, parent: &Arc<TaskHelper>, manager: Arc<TaskManager>) -> &mut Self {
        self.framework.set_context_task(parent, manager);
        self
    }

    pub fn set_visitor(&mut self, visitor: Box<dyn Visitor>) -> &mut Self {
        self.framework.set_visitor(visitor);
        self
    }

    pub fn set_topic(&mut self, topic: Option<Topic>) -> &mut Self {
        self.framework.set_topic(topic);
        self
    }

    /// Connect every enabled backup disk. Failures are logged and skipped.
    #[instrument(skip(self), fields(vm_uuid = %self.framework.vm_uuid))]
    pub async fn enable(&mut self) {
        for disk in self.dao.get_enabled() {
            let event = Event::enable(&self.framework.vm_uuid, &disk);
            self.apply_logged(event).await;
        }
    }

    /// Disconnect every enabled backup disk, keeping the attachments.
    #[instrument(skip(self), fields(vm_uuid = %self.framework.vm_uuid))]
    pub async fn disable(&mut self) {
        for disk in self.dao.get_enabled() {
            let event = Event::disable(&self.framework.vm_uuid, &self.framework.vm_home, &disk);
            self.apply_logged(event).await;
        }
    }

    /// Disconnect and destroy every backup disk.
    #[instrument(skip(self), fields(vm_uuid = %self.framework.vm_uuid))]
    pub async fn teardown(&mut self) {
        for disk in self.dao.get_all() {
            let event = Event::teardown(&self.framework.vm_uuid, &self.framework.vm_home, &disk);
            self.apply_logged(event).await;
        }
    }

    async fn apply_logged(&mut self, event: Event) {
        let name = event.to_string();
        let code = self.framework.visit(event).await;
        if code.is_failed() {
            warn!(event = %name, code = %code, "Backup device operation failed");
        }
    }

    /// Transition from the current backup disks to those of `new`.
    pub fn get_transition(&mut self, new: &SharedConfig) -> Transition<'_> {
        let diff = self.dao.difference(&Dao::new(Arc::clone(new)), self.framework.factory());
        Transition::new(diff, self.framework.visitor.as_mut(), self.framework.topic.clone())
    }

    /// Reconcile the backup disks with those of `new`.
    #[instrument(skip(self, new), fields(vm_uuid = %self.framework.vm_uuid))]
    pub async fn set_difference(&mut self, new: &SharedConfig) -> ResultCode {
        let code = self.get_transition(new).replace().await;
        info!(code = %code, "Backup devices reconciled");
        code
    }

    /// Whether `backup_id` is attached to any VE.
    pub async fn is_attached(&self, backup_id: &str) -> bool {
        match self.framework.backend.is_attached(backup_id).await {
            Ok(attached) => attached,
            Err(e) => {
                warn!(backup_id, error = %e, "Cannot query backup attachment");
                false
            }
        }
    }
}

/// Single-disk operations outside of a full reconciliation.
pub struct Oneshot {
    framework: Framework,
}

impl Oneshot {
    pub fn new(vm_uuid: impl Into<String>, vm_home: impl Into<String>, ve_type: VeType, backend: Arc<dyn BackupBackend>) -> Self {
        Self {
            framework: Framework::new(vm_uuid, vm_home, ve_type, backend),
        }
    }

    pub fn framework_mut(&mut self) -> &mut Framework {
        &mut self.framework
    }

    pub fn set_visitor(&mut self, visitor: Box<dyn Visitor>) -> &mut Self {
        self.framework.set_visitor(visitor);
        self
    }

    pub async fn enable(&mut self, disk: &SharedDisk) -> ResultCode {
        let event = Event::Enable(Enable {
            vm_uuid: self.framework.vm_uuid.clone(),
            disk: SharedDisk::clone(disk),
        });
        self.framework.visit(event).await
    }

    pub async fn disable(&mut self, disk: &SharedDisk) -> ResultCode {
        let event = Event::Disable(Disconnect {
            vm_uuid: self.framework.vm_uuid.clone(),
            vm_home: self.framework.vm_home.clone(),
            disk: SharedDisk::clone(disk),
        });
        self.framework.visit(event).await
    }

    /// Drop the image of a disk that no longer belongs to the VE.
    pub async fn cleanup(&mut self, disk: &SharedDisk) -> ResultCode {
        let event = Event::Cleanup(Cleanup {
            vm_uuid: self.framework.vm_uuid.clone(),
            disk: SharedDisk::clone(disk),
        });
        self.framework.visit(event).await
    }
}
