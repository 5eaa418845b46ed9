//! Client sessions and request packages consumed by tasks.
//!
//! The connection layer owns the concrete session type; tasks only need to
//! answer requests through it.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

use crate::code::ResultCode;
use crate::vm_event::VmEvent;

/// Shared reference to a client session.
pub type ClientRef = Arc<dyn ClientSession>;

/// Connection-side view of one client.
pub trait ClientSession: Send + Sync {
    /// Unique handle of the session.
    fn client_handle(&self) -> String;

    /// VM directory the session works with.
    fn vm_directory_uuid(&self) -> String;

    /// Answer `request` with a bare result code.
    fn send_simple_response(&self, request: &RequestPackage, code: ResultCode);

    /// Answer `request` with a full error event.
    fn send_response_error(&self, error: &VmEvent, request: &RequestPackage);
}

/// Command type tag of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommandType(pub u32);

impl CommandType {
    pub const VM_START: CommandType = CommandType(0x0101);
    pub const VM_STOP: CommandType = CommandType(0x0102);
    pub const VM_EDIT_COMMIT: CommandType = CommandType(0x0110);
    pub const VM_BACKUP_ATTACH: CommandType = CommandType(0x0301);
    pub const VM_BACKUP_CONNECT_SOURCE: CommandType = CommandType(0x0302);
    pub const VM_BACKUP_RECONCILE: CommandType = CommandType(0x0303);
    pub const JOB_CANCEL: CommandType = CommandType(0x0401);
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Common command flags carried in the request header.
pub mod flags {
    /// Cancel the task when the requesting session ends.
    pub const CANCEL_TASK_ON_END_SESSION: u32 = 0x0001;
    /// Never ask the client questions while the task runs.
    pub const NON_INTERACTIVE_MODE: u32 = 0x0002;
}

/// Request header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageHeader {
    /// Command type tag
    pub command: CommandType,
    /// Correlation id
    pub uuid: Uuid,
    /// Command flags
    pub flags: u32,
}

/// A request as it arrived from (or is forwarded on behalf of) a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestPackage {
    pub header: PackageHeader,
    pub body: String,
}

impl RequestPackage {
    /// Create a new request with a fresh correlation id.
    pub fn new(command: CommandType, body: impl Into<String>) -> Self {
        Self {
            header: PackageHeader {
                command,
                uuid: Uuid::new_v4(),
                flags: 0,
            },
            body: body.into(),
        }
    }

    /// Set command flags.
    pub fn with_flags(mut self, flags: u32) -> Self {
        self.header.flags = flags;
        self
    }

    /// Copy of this request with another body, keeping the header.
    pub fn duplicate_with_body(&self, body: impl Into<String>) -> Self {
        Self {
            header: self.header.clone(),
            body: body.into(),
        }
    }
}
