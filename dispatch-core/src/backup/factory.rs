//! Builds the events that reconcile one disk.

use crate::backup::disk::{read, Finding, SharedDisk, VeType};
use crate::backup::event::Event;

/// Events for an updated disk: the enable of the new state, the disable of the old one.
pub type Updated = (Option<Event>, Option<Event>);

/// Event factory bound to one VE.
#[derive(Debug, Clone)]
pub struct Factory {
    vm_uuid: String,
    vm_home: String,
    ve_type: VeType,
}

impl Factory {
    pub fn new(vm_uuid: impl Into<String>, vm_home: impl Into<String>, ve_type: VeType) -> Self {
        Self {
            vm_uuid: vm_uuid.into(),
            vm_home: vm_home.into(),
            ve_type,
        }
    }

    pub fn vm_uuid(&self) -> &str {
        &self.vm_uuid
    }

    /// A disk that appears in the new configuration.
    pub fn novel(&self, disk: &SharedDisk) -> Vec<Event> {
        let mut output = vec![Event::setup(&self.vm_uuid, &self.vm_home, disk)];
        if Finding::new(&read(disk)).is_enabled() {
            output.push(Event::enable(&self.vm_uuid, disk));
        }
        output
    }

    /// A disk that disappears from the configuration.
    pub fn removed(&self, disk: &SharedDisk) -> Vec<Event> {
        match self.ve_type {
            VeType::Vm => vec![
                Event::teardown(&self.vm_uuid, &self.vm_home, disk),
                Event::cleanup(&self.vm_uuid, disk),
            ],
            VeType::Ct => vec![Event::cleanup(&self.vm_uuid, disk)],
        }
    }

    /// A disk present in both configurations.
    ///
    /// Nothing is produced unless the effective URL changed. Then the new
    /// state is enabled if it is live and the old state disabled if it was.
    pub fn updated(&self, from: &SharedDisk, to: &SharedDisk) -> Updated {
        let old = Finding::new(&read(from)).effective_url();
        let new = Finding::new(&read(to)).effective_url();
        if old == new {
            return (None, None);
        }

        let enable = (!new.is_empty()).then(|| Event::enable(&self.vm_uuid, to));
        let disable = (!old.is_empty()).then(|| Event::disable(&self.vm_uuid, &self.vm_home, from));
        (enable, disable)
    }

    /// Disable for a disk that is configured but not live.
    pub fn disabled(&self, disk: &SharedDisk) -> Vec<Event> {
        if Finding::new(&read(disk)).is_enabled() {
            Vec::new()
        } else {
            vec![Event::disable(&self.vm_uuid, &self.vm_home, disk)]
        }
    }
}
