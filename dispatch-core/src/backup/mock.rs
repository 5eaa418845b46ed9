//! In-memory backup backend for testing and development.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use tracing::{debug, info, instrument};

use crate::backup::backend::{AttachedDisk, BackupBackend, VeState};
use crate::backup::disk::{BackupResource, HardDisk};
use crate::error::{DispatchError, Result};

/// Backend operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendOp {
    Attach,
    ConnectSource,
    Open,
    Disable,
    Destroy,
    RemoveImage,
    IsAttached,
}

#[derive(Default)]
struct MockState {
    /// Attachments keyed by VE and backup entry
    attached: HashMap<(String, BackupResource), MockAttachment>,
    images: HashSet<(String, BackupResource)>,
    ve_states: HashMap<String, VeState>,
    failures: HashMap<BackendOp, DispatchError>,
    journal: Vec<String>,
    next_device: u32,
}

struct MockAttachment {
    disk: AttachedDisk,
    enabled: bool,
}

/// Mock backup backend.
///
/// Simulates device attachment and image bookkeeping in memory. Every call is
/// appended to a journal, and any operation can be made to fail with
/// [`fail_on`](Self::fail_on).
pub struct MockBackupBackend {
    state: RwLock<MockState>,
}

impl MockBackupBackend {
    pub fn new() -> Self {
        info!("Creating mock backup backend");
        Self {
            state: RwLock::new(MockState::default()),
        }
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, MockState>> {
        self.state
            .write()
            .map_err(|_| DispatchError::Internal("Lock poisoned".to_string()))
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, MockState>> {
        self.state
            .read()
            .map_err(|_| DispatchError::Internal("Lock poisoned".to_string()))
    }

    /// Make every later call of `op` fail with `error`.
    pub fn fail_on(&self, op: BackendOp, error: DispatchError) {
        if let Ok(mut state) = self.write() {
            state.failures.insert(op, error);
        }
    }

    pub fn clear_failures(&self) {
        if let Ok(mut state) = self.write() {
            state.failures.clear();
        }
    }

    pub fn set_ve_state(&self, vm_uuid: &str, ve_state: VeState) {
        if let Ok(mut state) = self.write() {
            state.ve_states.insert(vm_uuid.to_string(), ve_state);
        }
    }

    /// Calls received so far, e.g. `attach vm1 backup://b1/d1`.
    pub fn journal(&self) -> Vec<String> {
        self.read().map(|s| s.journal.clone()).unwrap_or_default()
    }

    /// Number of attachments still present.
    pub fn attached_count(&self) -> usize {
        self.read().map(|s| s.attached.len()).unwrap_or_default()
    }

    pub fn image_count(&self) -> usize {
        self.read().map(|s| s.images.len()).unwrap_or_default()
    }

    /// Attachment of `resource` to `vm_uuid`, and whether it is enabled.
    pub fn attachment(&self, vm_uuid: &str, resource: &BackupResource) -> Option<(AttachedDisk, bool)> {
        let state = self.read().ok()?;
        state
            .attached
            .get(&(vm_uuid.to_string(), resource.clone()))
            .map(|a| (a.disk.clone(), a.enabled))
    }

    /// Register an existing attachment, as if a previous run created it.
    pub fn seed_attachment(&self, vm_uuid: &str, vm_home: &str, storage_url: &str) -> Result<AttachedDisk> {
        let resource = BackupResource::parse(storage_url)?;
        let mut state = self.write()?;
        let disk = Self::materialize(&mut state, vm_uuid, vm_home, resource);
        Ok(disk)
    }

    fn materialize(state: &mut MockState, vm_uuid: &str, vm_home: &str, resource: BackupResource) -> AttachedDisk {
        let key = (vm_uuid.to_string(), resource.clone());
        if let Some(existing) = state.attached.get_mut(&key) {
            existing.enabled = true;
            return existing.disk.clone();
        }

        state.next_device += 1;
        let disk = AttachedDisk {
            vm_uuid: vm_uuid.to_string(),
            device_path: format!("/dev/buse{}", state.next_device),
            image_path: format!("{}/{}.{}.hds", vm_home, resource.backup_id, resource.disk_id),
            resource,
        };
        state.images.insert(key.clone());
        state.attached.insert(
            key,
            MockAttachment {
                disk: disk.clone(),
                enabled: true,
            },
        );
        disk
    }

    fn begin(&self, op: BackendOp, entry: String) -> Result<std::sync::RwLockWriteGuard<'_, MockState>> {
        let mut state = self.write()?;
        debug!(call = %entry, "Mock backup backend call");
        state.journal.push(entry);
        if let Some(error) = state.failures.get(&op) {
            return Err(error.clone());
        }
        Ok(state)
    }
}

impl Default for MockBackupBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BackupBackend for MockBackupBackend {
    #[instrument(skip(self, disk), fields(url = %disk.storage_url))]
    async fn attach(&self, vm_uuid: &str, vm_home: &str, disk: &HardDisk) -> Result<AttachedDisk> {
        let mut state = self.begin(BackendOp::Attach, format!("attach {} {}", vm_uuid, disk.storage_url))?;
        let resource = BackupResource::parse(&disk.storage_url)?;
        let attached = Self::materialize(&mut state, vm_uuid, vm_home, resource);
        info!(device = %attached.device_path, "Mock backup attached");
        Ok(attached)
    }

    #[instrument(skip(self, disk), fields(url = %disk.storage_url))]
    async fn connect_source(&self, vm_uuid: &str, disk: &HardDisk) -> Result<()> {
        let mut state = self.begin(
            BackendOp::ConnectSource,
            format!("connect_source {} {}", vm_uuid, disk.storage_url),
        )?;
        let resource = BackupResource::parse(&disk.storage_url)?;
        let attachment = state
            .attached
            .get_mut(&(vm_uuid.to_string(), resource))
            .ok_or_else(|| DispatchError::NotMounted(disk.storage_url.clone()))?;
        attachment.enabled = true;
        Ok(())
    }

    async fn open(&self, vm_uuid: &str, _vm_home: &str, disk: &HardDisk) -> Result<AttachedDisk> {
        let state = self.begin(BackendOp::Open, format!("open {} {}", vm_uuid, disk.storage_url))?;
        let resource = BackupResource::parse(&disk.storage_url)?;
        state
            .attached
            .get(&(vm_uuid.to_string(), resource))
            .map(|a| a.disk.clone())
            .ok_or_else(|| DispatchError::NotMounted(disk.storage_url.clone()))
    }

    async fn disable(&self, disk: &AttachedDisk) -> Result<()> {
        let mut state = self.begin(
            BackendOp::Disable,
            format!("disable {} {}", disk.vm_uuid, disk.resource),
        )?;
        if let Some(attachment) = state
            .attached
            .get_mut(&(disk.vm_uuid.clone(), disk.resource.clone()))
        {
            attachment.enabled = false;
        }
        Ok(())
    }

    async fn destroy(&self, disk: &AttachedDisk) -> Result<()> {
        let mut state = self.begin(
            BackendOp::Destroy,
            format!("destroy {} {}", disk.vm_uuid, disk.resource),
        )?;
        state
            .attached
            .remove(&(disk.vm_uuid.clone(), disk.resource.clone()))
            .map(|_| ())
            .ok_or_else(|| DispatchError::NotMounted(disk.resource.to_string()))
    }

    async fn is_attached(&self, backup_id: &str) -> Result<bool> {
        let state = self.begin(BackendOp::IsAttached, format!("is_attached {backup_id}"))?;
        Ok(state
            .attached
            .keys()
            .any(|(_, resource)| resource.backup_id == backup_id))
    }

    async fn image_exists(&self, vm_uuid: &str, resource: &BackupResource) -> bool {
        self.read()
            .map(|s| s.images.contains(&(vm_uuid.to_string(), resource.clone())))
            .unwrap_or(false)
    }

    async fn remove_image(&self, vm_uuid: &str, resource: &BackupResource) -> Result<()> {
        let mut state = self.begin(
            BackendOp::RemoveImage,
            format!("remove_image {vm_uuid} {resource}"),
        )?;
        if !state.images.remove(&(vm_uuid.to_string(), resource.clone())) {
            return Err(DispatchError::ImageNotFound(resource.to_string()));
        }
        Ok(())
    }

    async fn ve_state(&self, vm_uuid: &str) -> VeState {
        self.read()
            .ok()
            .and_then(|s| s.ve_states.get(vm_uuid).copied())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_attach_lifecycle() {
        let backend = MockBackupBackend::new();
        let disk = HardDisk::backed_by(0, "backup://b1/d1");

        let attached = backend.attach("vm1", "/vz/vm1", &disk).await.unwrap();
        assert!(attached.device_path.starts_with("/dev/buse"));
        assert!(backend.is_attached("b1").await.unwrap());
        assert!(backend.image_exists("vm1", &attached.resource).await);

        let opened = backend.open("vm1", "/vz/vm1", &disk).await.unwrap();
        assert_eq!(opened, attached);

        backend.disable(&opened).await.unwrap();
        assert_eq!(backend.attachment("vm1", &attached.resource).map(|a| a.1), Some(false));

        backend.remove_image("vm1", &attached.resource).await.unwrap();
        backend.destroy(&opened).await.unwrap();
        assert!(!backend.is_attached("b1").await.unwrap());
        assert_eq!(backend.attached_count(), 0);
        assert_eq!(backend.journal().len(), 7);
    }

    #[tokio::test]
    async fn test_open_unknown_is_not_mounted() {
        let backend = MockBackupBackend::new();
        let disk = HardDisk::backed_by(0, "backup://b1/d1");

        let err = backend.open("vm1", "/vz/vm1", &disk).await.unwrap_err();
        assert!(matches!(err, DispatchError::NotMounted(_)));
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let backend = MockBackupBackend::new();
        backend.fail_on(BackendOp::Attach, DispatchError::AttachFailed("no space".into()));

        let disk = HardDisk::backed_by(0, "backup://b1/d1");
        let err = backend.attach("vm1", "/vz/vm1", &disk).await.unwrap_err();
        assert!(matches!(err, DispatchError::AttachFailed(_)));
        assert_eq!(backend.attached_count(), 0);

        backend.clear_failures();
        assert!(backend.attach("vm1", "/vz/vm1", &disk).await.is_ok());
    }

    #[tokio::test]
    async fn test_ve_state_defaults_to_stopped() {
        let backend = MockBackupBackend::new();
        assert_eq!(backend.ve_state("vm1").await, VeState::Stopped);

        backend.set_ve_state("vm1", VeState::Running);
        assert_eq!(backend.ve_state("vm1").await, VeState::Running);
    }
}
