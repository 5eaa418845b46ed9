//! Backup-device events and the visitor that applies them.

use std::fmt;

use async_trait::async_trait;

use crate::backup::backend::AttachedDisk;
use crate::backup::disk::{read, write, HardDisk, SharedDisk};
use crate::code::ResultCode;
use crate::error::{DispatchError, Result};
use crate::vm_event::Topic;

/// Materialize a new backup disk and record the device in the disk model.
#[derive(Debug, Clone)]
pub struct Setup {
    pub vm_uuid: String,
    pub vm_home: String,
    pub disk: SharedDisk,
}

impl Setup {
    /// Store the device of `attached` into the live disk model.
    pub fn set_model(&self, attached: &AttachedDisk) -> Result<()> {
        if attached.device_path.is_empty() {
            return Err(DispatchError::NotMounted(attached.resource.to_string()));
        }
        write(&self.disk).system_name = attached.device_path.clone();
        Ok(())
    }
}

/// Connect a materialized backup disk to the VE.
#[derive(Debug, Clone)]
pub struct Enable {
    pub vm_uuid: String,
    pub disk: SharedDisk,
}

/// Payload shared by [`Event::Disable`] and [`Event::Teardown`].
#[derive(Debug, Clone)]
pub struct Disconnect {
    pub vm_uuid: String,
    pub vm_home: String,
    pub disk: SharedDisk,
}

/// Drop the bookkeeping of a disk without touching a live attachment.
#[derive(Debug, Clone)]
pub struct Cleanup {
    pub vm_uuid: String,
    pub disk: SharedDisk,
}

/// One step of a backup-device reconciliation.
#[derive(Debug, Clone)]
pub enum Event {
    Setup(Setup),
    Enable(Enable),
    /// Detach, keeping the attachment for a later enable
    Disable(Disconnect),
    /// Detach and destroy the attachment
    Teardown(Disconnect),
    Cleanup(Cleanup),
}

impl Event {
    pub fn setup(vm_uuid: &str, vm_home: &str, disk: &SharedDisk) -> Self {
        Event::Setup(Setup {
            vm_uuid: vm_uuid.to_string(),
            vm_home: vm_home.to_string(),
            disk: SharedDisk::clone(disk),
        })
    }

    pub fn enable(vm_uuid: &str, disk: &SharedDisk) -> Self {
        Event::Enable(Enable {
            vm_uuid: vm_uuid.to_string(),
            disk: SharedDisk::clone(disk),
        })
    }

    pub fn disable(vm_uuid: &str, vm_home: &str, disk: &SharedDisk) -> Self {
        Event::Disable(Disconnect {
            vm_uuid: vm_uuid.to_string(),
            vm_home: vm_home.to_string(),
            disk: SharedDisk::clone(disk),
        })
    }

    pub fn teardown(vm_uuid: &str, vm_home: &str, disk: &SharedDisk) -> Self {
        Event::Teardown(Disconnect {
            vm_uuid: vm_uuid.to_string(),
            vm_home: vm_home.to_string(),
            disk: SharedDisk::clone(disk),
        })
    }

    pub fn cleanup(vm_uuid: &str, disk: &SharedDisk) -> Self {
        Event::Cleanup(Cleanup {
            vm_uuid: vm_uuid.to_string(),
            disk: SharedDisk::clone(disk),
        })
    }

    /// Apply the event with `visitor`.
    pub async fn accept(&self, visitor: &mut dyn Visitor) -> ResultCode {
        match self {
            Event::Setup(event) => visitor.visit_setup(event).await,
            Event::Enable(event) => visitor.visit_enable(event).await,
            Event::Disable(event) => visitor.visit_disable(event).await,
            Event::Teardown(event) => visitor.visit_teardown(event).await,
            Event::Cleanup(event) => visitor.visit_cleanup(event).await,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Event::Setup(_) => "setup",
            Event::Enable(_) => "enable",
            Event::Disable(_) => "disable",
            Event::Teardown(_) => "teardown",
            Event::Cleanup(_) => "cleanup",
        }
    }

    pub fn vm_uuid(&self) -> &str {
        match self {
            Event::Setup(e) => &e.vm_uuid,
            Event::Enable(e) => &e.vm_uuid,
            Event::Disable(e) | Event::Teardown(e) => &e.vm_uuid,
            Event::Cleanup(e) => &e.vm_uuid,
        }
    }

    pub fn disk(&self) -> &SharedDisk {
        match self {
            Event::Setup(e) => &e.disk,
            Event::Enable(e) => &e.disk,
            Event::Disable(e) | Event::Teardown(e) => &e.disk,
            Event::Cleanup(e) => &e.disk,
        }
    }

    /// Current state of the disk the event refers to.
    pub fn model(&self) -> HardDisk {
        read(self.disk()).clone()
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let disk = read(self.disk());
        write!(
            f,
            "{} {} hdd{} {}",
            self.name(),
            self.vm_uuid(),
            disk.index,
            disk.storage_url
        )
    }
}

/// Applies events. Failures are recorded into the topic, when one is set.
#[async_trait]
pub trait Visitor: Send + Sync {
    async fn visit_setup(&mut self, event: &Setup) -> ResultCode;

    async fn visit_enable(&mut self, event: &Enable) -> ResultCode;

    async fn visit_disable(&mut self, event: &Disconnect) -> ResultCode;

    async fn visit_teardown(&mut self, event: &Disconnect) -> ResultCode;

    async fn visit_cleanup(&mut self, event: &Cleanup) -> ResultCode;

    fn set_topic(&mut self, topic: Option<Topic>);
}
