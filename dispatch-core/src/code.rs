//! Result codes reported by tasks to their clients.
//!
//! Every task finishes with exactly one of these codes. Codes carry a fixed
//! numeric value so that they survive serialization of the error-state object.
//!
//! | Range       | Category             |
//! |-------------|----------------------|
//! | 0x0000      | Success              |
//! | 0x1000-1fff | Generic task errors  |
//! | 0x2000-2fff | Backup device errors |

use serde::{Deserialize, Serialize};
use std::fmt;

/// Fixed result vocabulary of the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u32)]
pub enum ResultCode {
    Success = 0x0000,

    Unexpected = 0x1001,
    OperationWasCanceled = 0x1002,
    TaskNotFound = 0x1003,
    Uninitialized = 0x1004,
    InvalidArgument = 0x1005,
    ExclusiveTaskRunning = 0x1006,
    NestedTaskActive = 0x1007,
    VeNotFound = 0x1008,

    AttachBackupUrlChangeProhibited = 0x2001,
    AttachBackupAlreadyAttached = 0x2002,
    BackupNotAttached = 0x2003,
    BackupAttachFailed = 0x2004,
}

impl ResultCode {
    /// Numeric value of the code.
    pub fn value(self) -> u32 {
        self as u32
    }

    pub fn is_succeeded(self) -> bool {
        self == ResultCode::Success
    }

    pub fn is_failed(self) -> bool {
        !self.is_succeeded()
    }

    /// Symbolic name, as shown in logs.
    pub fn as_str(self) -> &'static str {
        match self {
            ResultCode::Success => "SUCCESS",
            ResultCode::Unexpected => "UNEXPECTED",
            ResultCode::OperationWasCanceled => "OPERATION_WAS_CANCELED",
            ResultCode::TaskNotFound => "TASK_NOT_FOUND",
            ResultCode::Uninitialized => "UNINITIALIZED",
            ResultCode::InvalidArgument => "INVALID_ARGUMENT",
            ResultCode::ExclusiveTaskRunning => "EXCLUSIVE_TASK_RUNNING",
            ResultCode::NestedTaskActive => "NESTED_TASK_ACTIVE",
            ResultCode::VeNotFound => "VE_NOT_FOUND",
            ResultCode::AttachBackupUrlChangeProhibited => "ATTACH_BACKUP_URL_CHANGE_PROHIBITED",
            ResultCode::AttachBackupAlreadyAttached => "ATTACH_BACKUP_ALREADY_ATTACHED",
            ResultCode::BackupNotAttached => "BACKUP_NOT_ATTACHED",
            ResultCode::BackupAttachFailed => "BACKUP_ATTACH_FAILED",
        }
    }
}

impl Default for ResultCode {
    fn default() -> Self {
        ResultCode::Success
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:#x})", self.as_str(), self.value())
    }
}
