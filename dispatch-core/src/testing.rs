//! Test doubles for client sessions.
//!
//! Used by unit and integration tests and by the node binary's dry runs.

use std::sync::{Arc, Mutex};

use crate::code::ResultCode;
use crate::session::{ClientSession, CommandType, RequestPackage};
use crate::task::TaskHelper;
use crate::vm_event::VmEvent;

/// One answer sent to a [`RecordingClient`].
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Simple { request: RequestPackage, code: ResultCode },
    Error { request: RequestPackage, event: VmEvent },
}

impl Response {
    pub fn code(&self) -> ResultCode {
        match self {
            Response::Simple { code, .. } => *code,
            Response::Error { event, .. } => event.event_code(),
        }
    }
}

/// Client session that records every response it receives.
pub struct RecordingClient {
    handle: String,
    vm_directory: String,
    responses: Mutex<Vec<Response>>,
}

impl RecordingClient {
    pub fn new(handle: impl Into<String>) -> Self {
        Self {
            handle: handle.into(),
            vm_directory: "vmdir-test".to_string(),
            responses: Mutex::new(Vec::new()),
        }
    }

    pub fn responses(&self) -> Vec<Response> {
        self.responses.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Codes of all responses in arrival order.
    pub fn codes(&self) -> Vec<ResultCode> {
        self.responses().iter().map(Response::code).collect()
    }

    /// Full error events received.
    pub fn errors(&self) -> Vec<VmEvent> {
        self.responses()
            .into_iter()
            .filter_map(|response| match response {
                Response::Error { event, .. } => Some(event),
                Response::Simple { .. } => None,
            })
            .collect()
    }

    fn record(&self, response: Response) {
        self.responses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(response);
    }
}

impl ClientSession for RecordingClient {
    fn client_handle(&self) -> String {
        self.handle.clone()
    }

    fn vm_directory_uuid(&self) -> String {
        self.vm_directory.clone()
    }

    fn send_simple_response(&self, request: &RequestPackage, code: ResultCode) {
        self.record(Response::Simple {
            request: request.clone(),
            code,
        });
    }

    fn send_response_error(&self, error: &VmEvent, request: &RequestPackage) {
        self.record(Response::Error {
            request: request.clone(),
            event: error.clone(),
        });
    }
}

/// Helper of kind `kind` bound to a fresh recording client.
pub fn helper(kind: &'static str) -> (TaskHelper, Arc<RecordingClient>) {
    let client = Arc::new(RecordingClient::new(format!("session-{kind}")));
    let request = RequestPackage::new(CommandType::VM_BACKUP_RECONCILE, "");
    (TaskHelper::new(kind, client.clone(), request), client)
}
