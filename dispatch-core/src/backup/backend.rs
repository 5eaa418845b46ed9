//! Interface to the platform layer that materializes backup disks.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::backup::disk::{BackupResource, HardDisk};
use crate::error::Result;

/// Run state of a VE as seen by the backup subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VeState {
    #[default]
    Stopped,
    Running,
    Paused,
}

/// A backup entry exposed as a block device for one VE.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachedDisk {
    pub vm_uuid: String,
    pub resource: BackupResource,
    /// Block device the guest disk is attached through
    pub device_path: String,
    /// Image file holding the disk data inside the VE home
    pub image_path: String,
}

/// Platform operations needed by the backup-device handlers.
///
/// Errors are reported as [`DispatchError`](crate::error::DispatchError) and
/// translated into result codes before they reach a client.
#[async_trait]
pub trait BackupBackend: Send + Sync {
    // =========================================================================
    // Attachment
    // =========================================================================

    /// Expose the backup entry of `disk` as a block device and create its image.
    async fn attach(&self, vm_uuid: &str, vm_home: &str, disk: &HardDisk) -> Result<AttachedDisk>;

    /// Connect an attached backup entry to the running VE.
    async fn connect_source(&self, vm_uuid: &str, disk: &HardDisk) -> Result<()>;

    /// Look up the attachment of `disk`.
    async fn open(&self, vm_uuid: &str, vm_home: &str, disk: &HardDisk) -> Result<AttachedDisk>;

    /// Stop serving the device but keep the attachment for a later enable.
    async fn disable(&self, disk: &AttachedDisk) -> Result<()>;

    /// Release the device entirely.
    async fn destroy(&self, disk: &AttachedDisk) -> Result<()>;

    /// Whether `backup_id` is currently attached anywhere.
    async fn is_attached(&self, backup_id: &str) -> Result<bool>;

    // =========================================================================
    // Images
    // =========================================================================

    async fn image_exists(&self, vm_uuid: &str, resource: &BackupResource) -> bool;

    async fn remove_image(&self, vm_uuid: &str, resource: &BackupResource) -> Result<()>;

    // =========================================================================
    // VE state
    // =========================================================================

    async fn ve_state(&self, vm_uuid: &str) -> VeState;
}
