//! Disk and VE configuration model used by the backup-device subsystem.

use std::fmt;
use std::path::Path;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{DispatchError, Result};

/// URL scheme of disks served from a backup.
pub const BACKUP_SCHEME: &str = "backup";

/// How the disk is presented to the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EmulatedType {
    #[default]
    Image,
    RealDevice,
}

/// One hard disk of a VE configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HardDisk {
    /// Position of the disk in the VE hardware list
    pub index: u32,
    /// Where the content comes from; `backup://<backup id>/<disk id>` for backup disks
    pub storage_url: String,
    /// Device the disk is attached through
    pub system_name: String,
    pub enabled: bool,
    pub connected: bool,
    pub emulated_type: EmulatedType,
}

impl Default for HardDisk {
    fn default() -> Self {
        Self {
            index: 0,
            storage_url: String::new(),
            system_name: String::new(),
            enabled: true,
            connected: true,
            emulated_type: EmulatedType::Image,
        }
    }
}

impl HardDisk {
    /// Enabled, connected disk at `index` backed by `storage_url`.
    pub fn backed_by(index: u32, storage_url: impl Into<String>) -> Self {
        Self {
            index,
            storage_url: storage_url.into(),
            ..Self::default()
        }
    }
}

/// A disk shared between a configuration and the events built from it.
pub type SharedDisk = Arc<RwLock<HardDisk>>;

pub fn share(disk: HardDisk) -> SharedDisk {
    Arc::new(RwLock::new(disk))
}

pub fn read(disk: &SharedDisk) -> RwLockReadGuard<'_, HardDisk> {
    disk.read().unwrap_or_else(|e| e.into_inner())
}

pub fn write(disk: &SharedDisk) -> RwLockWriteGuard<'_, HardDisk> {
    disk.write().unwrap_or_else(|e| e.into_inner())
}

/// Kind of virtual environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VeType {
    #[default]
    Vm,
    Ct,
}

impl fmt::Display for VeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VeType::Vm => write!(f, "vm"),
            VeType::Ct => write!(f, "ct"),
        }
    }
}

/// Configuration of one VM or container.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct VeConfig {
    pub uuid: String,
    /// Configuration file of a VM, private area of a container
    pub home: String,
    #[serde(rename = "type")]
    pub ve_type: VeType,
    pub hard_disks: Vec<SharedDisk>,
}

impl VeConfig {
    /// Directory holding the VE files.
    pub fn home_dir(&self) -> String {
        match self.ve_type {
            VeType::Vm => Path::new(&self.home)
                .parent()
                .map(|dir| dir.to_string_lossy().into_owned())
                .unwrap_or_default(),
            VeType::Ct => self.home.clone(),
        }
    }

    /// Deep copy: the disks of the copy are not shared with `self`.
    pub fn detached(&self) -> Self {
        Self {
            uuid: self.uuid.clone(),
            home: self.home.clone(),
            ve_type: self.ve_type,
            hard_disks: self.hard_disks.iter().map(|d| share(read(d).clone())).collect(),
        }
    }
}

/// Read-only classification helpers for one disk.
pub struct Finding<'a>(&'a HardDisk);

impl<'a> Finding<'a> {
    pub fn new(disk: &'a HardDisk) -> Self {
        Self(disk)
    }

    pub fn index(&self) -> u32 {
        self.0.index
    }

    fn storage_url(&self) -> Option<Url> {
        if self.0.storage_url.is_empty() {
            return None;
        }
        Url::parse(&self.0.storage_url).ok()
    }

    /// Whether the disk is served from a backup.
    pub fn is_kind_of(&self) -> bool {
        self.storage_url()
            .is_some_and(|url| url.scheme() == BACKUP_SCHEME)
    }

    pub fn is_enabled(&self) -> bool {
        self.0.enabled && self.0.connected
    }

    /// Normalized storage URL, empty when absent or invalid.
    pub fn url_path(&self) -> String {
        self.storage_url()
            .map(|url| url.to_string())
            .unwrap_or_default()
    }

    /// Key a storage location is compared by: the normalized URL, or the raw
    /// value for a plain path that is not a URL.
    pub fn url_key(&self) -> String {
        match self.storage_url() {
            Some(url) => url.to_string(),
            None => self.0.storage_url.trim().to_string(),
        }
    }

    /// Storage URL that is live in the VE: empty unless the disk is enabled.
    pub fn effective_url(&self) -> String {
        if self.is_enabled() {
            self.url_path()
        } else {
            String::new()
        }
    }
}

/// Backup entry a disk is served from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BackupResource {
    pub backup_id: String,
    pub disk_id: String,
}

impl BackupResource {
    /// Parse `backup://<backup id>/<disk id>`.
    pub fn parse(storage_url: &str) -> Result<Self> {
        let url = Url::parse(storage_url)
            .map_err(|e| DispatchError::InvalidUrl(format!("{storage_url}: {e}")))?;
        if url.scheme() != BACKUP_SCHEME {
            return Err(DispatchError::InvalidUrl(format!(
                "{storage_url}: unsupported scheme '{}'",
                url.scheme()
            )));
        }

        let backup_id = url.host_str().unwrap_or_default().to_string();
        let disk_id = url.path().trim_matches('/').to_string();
        if backup_id.is_empty() || disk_id.is_empty() {
            return Err(DispatchError::InvalidUrl(format!(
                "{storage_url}: expected backup://<backup id>/<disk id>"
            )));
        }
        Ok(Self { backup_id, disk_id })
    }
}

impl fmt::Display for BackupResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{BACKUP_SCHEME}://{}/{}", self.backup_id, self.disk_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finding_classification() {
        let backup = HardDisk::backed_by(0, "backup://b1/d1");
        assert!(Finding::new(&backup).is_kind_of());
        assert!(Finding::new(&backup).is_enabled());
        assert_eq!(Finding::new(&backup).url_path(), "backup://b1/d1");

        let plain = HardDisk::backed_by(1, "file:///vz/disk.hdd");
        assert!(!Finding::new(&plain).is_kind_of());

        let relative = HardDisk::backed_by(2, "not a url");
        assert!(!Finding::new(&relative).is_kind_of());
        assert_eq!(Finding::new(&relative).url_path(), "");
        assert_eq!(Finding::new(&relative).url_key(), "not a url");
        assert_eq!(Finding::new(&backup).url_key(), "backup://b1/d1");

        let disconnected = HardDisk {
            connected: false,
            ..HardDisk::backed_by(3, "backup://b1/d3")
        };
        assert!(!Finding::new(&disconnected).is_enabled());
        assert_eq!(Finding::new(&disconnected).effective_url(), "");
    }

    #[test]
    fn test_parse_backup_resource() {
        let resource = BackupResource::parse("backup://b1/d1").unwrap();
        assert_eq!(resource.backup_id, "b1");
        assert_eq!(resource.disk_id, "d1");
        assert_eq!(resource.to_string(), "backup://b1/d1");

        assert!(BackupResource::parse("file:///b1/d1").is_err());
        assert!(BackupResource::parse("backup://b1").is_err());
        assert!(BackupResource::parse("").is_err());
    }

    #[test]
    fn test_home_dir() {
        let vm = VeConfig {
            uuid: "vm1".into(),
            home: "/vz/vmprivate/vm1/config.pvs".into(),
            ve_type: VeType::Vm,
            hard_disks: vec![],
        };
        assert_eq!(vm.home_dir(), "/vz/vmprivate/vm1");

        let ct = VeConfig {
            ve_type: VeType::Ct,
            home: "/vz/private/101".into(),
            ..vm
        };
        assert_eq!(ct.home_dir(), "/vz/private/101");
    }

    #[test]
    fn test_config_from_json() {
        let config: VeConfig = serde_json::from_str(
            r#"{"uuid":"vm1","home":"/vz/vm1/config.pvs","type":"vm",
                "hard_disks":[{"index":0,"storage_url":"backup://b1/d1"}]}"#,
        )
        .unwrap();
        assert_eq!(config.hard_disks.len(), 1);
        let disk = read(&config.hard_disks[0]);
        assert!(disk.enabled);
        assert_eq!(disk.storage_url, "backup://b1/d1");
    }
}
