//! Client session of the node itself.

use std::sync::Mutex;

use dispatch_core::{ClientSession, RequestPackage, ResultCode, VmEvent};
use tracing::{info, warn};

/// Session that answers requests into the log.
///
/// Used for tasks the node starts on its own behalf.
pub struct LoggingSession {
    handle: String,
    vm_directory: String,
    last_code: Mutex<Option<ResultCode>>,
}

impl LoggingSession {
    pub fn new(handle: impl Into<String>, vm_directory: impl Into<String>) -> Self {
        Self {
            handle: handle.into(),
            vm_directory: vm_directory.into(),
            last_code: Mutex::new(None),
        }
    }

    /// Code of the last answer received, if any.
    pub fn last_code(&self) -> Option<ResultCode> {
        *self.last_code.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn remember(&self, code: ResultCode) {
        *self.last_code.lock().unwrap_or_else(|e| e.into_inner()) = Some(code);
    }
}

impl ClientSession for LoggingSession {
    fn client_handle(&self) -> String {
        self.handle.clone()
    }

    fn vm_directory_uuid(&self) -> String {
        self.vm_directory.clone()
    }

    fn send_simple_response(&self, request: &RequestPackage, code: ResultCode) {
        info!(
            session = %self.handle,
            command = %request.header.command,
            request_id = %request.header.uuid,
            code = %code,
            "Response"
        );
        self.remember(code);
    }

    fn send_response_error(&self, error: &VmEvent, request: &RequestPackage) {
        warn!(
            session = %self.handle,
            command = %request.header.command,
            request_id = %request.header.uuid,
            code = %error.event_code(),
            parameters = ?error.parameters(),
            "Error response"
        );
        self.remember(error.event_code());
    }
}
