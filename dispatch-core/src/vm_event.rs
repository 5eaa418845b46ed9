//! Error-state object carried by every task.
//!
//! A `VmEvent` holds a result code plus positional string parameters which the
//! client substitutes into the localized message for that code.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::code::ResultCode;
use crate::error::Result;

/// Value type of an event parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamKind {
    String,
    Integer,
}

/// Well-known parameter slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamSlot {
    /// First message substitution (`%1`)
    MessageParam0,
    /// Second message substitution (`%2`)
    MessageParam1,
    /// Token returned to the caller along with the code
    ReturnParamToken,
}

/// A single event parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventParameter {
    pub kind: ParamKind,
    pub slot: ParamSlot,
    pub value: String,
}

/// Mutable error-state object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmEvent {
    code: ResultCode,
    parameters: Vec<EventParameter>,
    timestamp: DateTime<Utc>,
}

impl VmEvent {
    pub fn new() -> Self {
        Self::with_code(ResultCode::Success)
    }

    pub fn with_code(code: ResultCode) -> Self {
        Self {
            code,
            parameters: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn event_code(&self) -> ResultCode {
        self.code
    }

    pub fn set_event_code(&mut self, code: ResultCode) {
        self.code = code;
        self.timestamp = Utc::now();
    }

    pub fn add_event_parameter(&mut self, kind: ParamKind, value: impl Into<String>, slot: ParamSlot) {
        self.parameters.push(EventParameter {
            kind,
            slot,
            value: value.into(),
        });
    }

    /// Latest value stored in `slot`.
    pub fn parameter(&self, slot: ParamSlot) -> Option<&str> {
        self.parameters
            .iter()
            .rev()
            .find(|p| p.slot == slot)
            .map(|p| p.value.as_str())
    }

    pub fn parameters(&self) -> &[EventParameter] {
        &self.parameters
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Serialize the whole event.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Replace this event with one previously produced by `to_json`.
    pub fn from_json(&mut self, data: &str) -> Result<()> {
        *self = serde_json::from_str(data)?;
        Ok(())
    }
}

impl Default for VmEvent {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared handle to the error-state object of a task.
///
/// Visitors and transitions record failures into the topic of the task
/// on whose behalf they run.
#[derive(Debug, Clone, Default)]
pub struct Topic(Arc<Mutex<VmEvent>>);

impl Topic {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) -> MutexGuard<'_, VmEvent> {
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn event_code(&self) -> ResultCode {
        self.lock().event_code()
    }

    pub fn set_event_code(&self, code: ResultCode) {
        self.lock().set_event_code(code);
    }

    /// Copy of the current event.
    pub fn snapshot(&self) -> VmEvent {
        self.lock().clone()
    }

    /// Overwrite the current event with `src`.
    pub fn assign(&self, src: &VmEvent) {
        *self.lock() = src.clone();
    }

    pub fn same_as(&self, other: &Topic) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_round_trip_keeps_parameters() {
        let mut event = VmEvent::with_code(ResultCode::BackupNotAttached);
        event.add_event_parameter(ParamKind::String, "backup-1", ParamSlot::MessageParam0);

        let mut copy = VmEvent::new();
        copy.from_json(&event.to_json()).unwrap();

        assert_eq!(copy.event_code(), ResultCode::BackupNotAttached);
        assert_eq!(copy.parameter(ParamSlot::MessageParam0), Some("backup-1"));
    }

    #[test]
    fn test_from_json_rejects_garbage() {
        let mut event = VmEvent::new();
        assert!(event.from_json("not json").is_err());
        assert_eq!(event.event_code(), ResultCode::Success);
    }
}
