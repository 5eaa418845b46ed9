//! Backup-device subsystem.
//!
//! Disks served from a backup (`backup://<backup id>/<disk id>`) are kept in
//! step with the VE configuration by diffing the old and the new disk lists
//! into [`Event`]s and applying them with a [`Visitor`]:
//!
//! ```text
//! Service ──► Difference ──► Batch(es) of Event ──► Visitor
//!                                                    ├─ Handler ──► agent::Unit ──► nested tasks
//!                                                    └─ EditVm  (defers live changes of stopped VEs)
//! ```

pub mod agent;
pub mod backend;
pub mod difference;
pub mod disk;
pub mod event;
pub mod factory;
pub mod handler;
pub mod mock;
pub mod service;

pub use agent::{AttachBackupTask, ConnectBackupSourceTask, Unit};
pub use backend::{AttachedDisk, BackupBackend, VeState};
pub use difference::{Batch, Difference, Transition, Validator};
pub use disk::{share, BackupResource, EmulatedType, Finding, HardDisk, SharedDisk, VeConfig, VeType};
pub use event::{Event, Visitor};
pub use factory::Factory;
pub use handler::{Disconnector, EditVm, Handler};
pub use mock::{BackendOp, MockBackupBackend};
pub use service::{Dao, Framework, Oneshot, Service, SharedConfig};
