//! # vedispatch core
//!
//! Task lifecycle framework of the VE dispatcher and the backup-device
//! reconciliation built on top of it.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │              TaskManager                │
//! │  (register, cancel, reattach, shutdown) │
//! └─────────────────────┬───────────────────┘
//!                       │ Arc<dyn TaskHandle>
//!                       ▼
//! ┌─────────────────────────────────────────┐
//! │        Task<B: TaskBody>                │
//! │  prepare_task → run_body → finalize     │
//! │  TaskHelper: client, last error, cancel │
//! └─────────────────────┬───────────────────┘
//!                       │ run_external_task
//!                       ▼
//! ┌─────────────────────────────────────────┐
//! │   backup::Service / Difference / Batch  │
//! │   ──► Visitor ──► BackupBackend         │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use dispatch_core::task::{Task, TaskHandle, TaskHelper};
//!
//! let helper = TaskHelper::new("reconcile", client, request);
//! let task = Task::new(helper, ReconcileBody::new(...));
//! manager.register_task(task.clone())?;
//! if task.clone().start() {
//!     task.wait().await;
//! }
//! ```

pub mod backup;
pub mod code;
pub mod error;
pub mod session;
pub mod task;
pub mod testing;
pub mod vm_event;

pub use code::ResultCode;
pub use error::{DispatchError, Result};
pub use session::{flags, ClientRef, ClientSession, CommandType, PackageHeader, RequestPackage};
pub use task::{
    CancelOperationSupport, ExclusiveRegistry, Ownership, Task, TaskBody, TaskFailure, TaskFuture,
    TaskHandle, TaskHelper, TaskManager,
};
pub use vm_event::{ParamKind, ParamSlot, Topic, VmEvent};
