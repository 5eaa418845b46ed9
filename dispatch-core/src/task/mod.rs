//! Task lifecycle framework.
//!
//! A task is a [`TaskBody`] bound to a [`TaskHelper`] and driven by a
//! [`Task`] runner on its own tokio task. Parents delegate to nested tasks
//! through [`TaskHelper::run_external_task`]; the [`TaskManager`] keeps
//! track of everything that is registered.

pub mod cancel;
pub mod exclusive;
pub mod failure;
pub mod future;
pub mod helper;
pub mod manager;
pub mod runner;

pub use cancel::CancelOperationSupport;
pub use exclusive::ExclusiveRegistry;
pub use failure::TaskFailure;
pub use future::TaskFuture;
pub use helper::{AdditionStateSink, Ownership, TaskHelper};
pub use manager::{TaskManager, DEFAULT_TERMINATE_TIMEOUT};
pub use runner::{RunState, Task, TaskBody, TaskHandle};
