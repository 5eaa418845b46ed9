//! Error types for the dispatcher core.

use thiserror::Error;

use crate::code::ResultCode;

/// Errors that can occur inside the task framework or a backup backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// A nested task is already tracked by the parent.
    #[error("Task {0} already waits for a nested task")]
    NestedTaskActive(String),

    /// A task with the same job id is already registered.
    #[error("Task already registered: {0}")]
    TaskAlreadyRegistered(String),

    /// Task was not found in the manager.
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    /// Storage URL could not be interpreted as a backup resource.
    #[error("Invalid backup URL: {0}")]
    InvalidUrl(String),

    /// Backup image is not mounted / attached.
    #[error("Backup is not mounted: {0}")]
    NotMounted(String),

    /// Backup is attached already.
    #[error("Backup is already attached: {0}")]
    AlreadyAttached(String),

    /// Backup image was not found.
    #[error("Backup image not found: {0}")]
    ImageNotFound(String),

    /// Attach operation failed in the backend.
    #[error("Failed to attach backup: {0}")]
    AttachFailed(String),

    /// VE is unknown to the backend.
    #[error("VE not found: {0}")]
    VeNotFound(String),

    /// Request body could not be encoded or decoded.
    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl DispatchError {
    /// Translate into the fixed result vocabulary reported to clients.
    pub fn code(&self) -> ResultCode {
        match self {
            DispatchError::NestedTaskActive(_) => ResultCode::NestedTaskActive,
            DispatchError::TaskAlreadyRegistered(_) => ResultCode::OperationWasCanceled,
            DispatchError::TaskNotFound(_) => ResultCode::TaskNotFound,
            DispatchError::InvalidUrl(_) => ResultCode::InvalidArgument,
            DispatchError::NotMounted(_) | DispatchError::ImageNotFound(_) => {
                ResultCode::BackupNotAttached
            }
            DispatchError::AlreadyAttached(_) => ResultCode::AttachBackupAlreadyAttached,
            DispatchError::AttachFailed(_) => ResultCode::BackupAttachFailed,
            DispatchError::VeNotFound(_) => ResultCode::VeNotFound,
            DispatchError::MalformedRequest(_) => ResultCode::InvalidArgument,
            DispatchError::Internal(_) => ResultCode::Unexpected,
        }
    }
}

impl From<serde_json::Error> for DispatchError {
    fn from(e: serde_json::Error) -> Self {
        DispatchError::MalformedRequest(e.to_string())
    }
}

/// Result type alias for dispatcher operations.
pub type Result<T> = std::result::Result<T, DispatchError>;
