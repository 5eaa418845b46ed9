//! Diff of two disk lists and the transitions that apply it.

use std::collections::HashSet;
use std::sync::OnceLock;

use tracing::{debug, info, warn};

use crate::backup::disk::{read, Finding, HardDisk, SharedDisk};
use crate::backup::event::{Event, Visitor};
use crate::backup::factory::Factory;
use crate::code::ResultCode;
use crate::vm_event::Topic;

// =============================================================================
// Validator
// =============================================================================

/// Rejects a new disk list that cannot be reached from the old one.
pub struct Validator {
    old: Vec<HardDisk>,
    new: Vec<HardDisk>,
}

impl Validator {
    pub fn new(old: &[SharedDisk], new: &[SharedDisk]) -> Self {
        Self {
            old: old.iter().map(|d| read(d).clone()).collect(),
            new: new.iter().map(|d| read(d).clone()).collect(),
        }
    }

    /// Whether a disk kept at the same index switches between a backup and
    /// a non-backup storage URL.
    ///
    /// Moving to another backup or dropping the URL altogether is allowed.
    pub fn check_modified(&self) -> bool {
        self.old.iter().any(|old| {
            let before = Finding::new(old);
            self.new
                .iter()
                .filter(|new| new.index == old.index)
                .any(|new| {
                    let after = Finding::new(new);
                    let (a, b) = (before.url_key(), after.url_key());
                    !a.is_empty() && !b.is_empty() && a != b && before.is_kind_of() != after.is_kind_of()
                })
        })
    }

    /// Whether two different disks of the new list share a non-empty URL.
    pub fn check_duplicated(&self) -> bool {
        let mut seen = HashSet::new();
        self.new.iter().any(|disk| {
            let path = Finding::new(disk).url_path();
            !path.is_empty() && !seen.insert(path)
        })
    }

    pub fn validate(&self) -> ResultCode {
        if self.check_modified() {
            return ResultCode::AttachBackupUrlChangeProhibited;
        }
        if self.check_duplicated() {
            return ResultCode::AttachBackupAlreadyAttached;
        }
        ResultCode::Success
    }
}

// =============================================================================
// Batch
// =============================================================================

/// Ordered events applied by one visitor. Dropping the batch releases them.
#[derive(Default)]
pub struct Batch {
    events: Vec<Event>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_event(&mut self, event: Event) {
        self.events.push(event);
    }

    pub fn add_events(&mut self, events: impl IntoIterator<Item = Event>) {
        self.events.extend(events);
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Apply the events in order, stopping at the first failure.
    ///
    /// Events applied before the failure are not undone.
    pub async fn dispatch(&self, visitor: &mut dyn Visitor) -> ResultCode {
        for event in &self.events {
            let code = event.accept(visitor).await;
            if code.is_failed() {
                warn!(event = %event, code = %code, "Backup device event failed");
                return code;
            }
            debug!(event = %event, "Backup device event applied");
        }
        ResultCode::Success
    }
}

// =============================================================================
// Difference
// =============================================================================

/// Difference between an old and a new disk list, matched by disk index.
pub struct Difference {
    from: Vec<SharedDisk>,
    to: Vec<SharedDisk>,
    factory: Factory,
    validator: Validator,
    validation: OnceLock<ResultCode>,
}

impl Difference {
    /// Difference of two lists of backup disks, validated against the same lists.
    pub fn new(from: Vec<SharedDisk>, to: Vec<SharedDisk>, factory: Factory) -> Self {
        let validator = Validator::new(&from, &to);
        Self {
            from,
            to,
            factory,
            validator,
            validation: OnceLock::new(),
        }
    }

    /// Validate against the complete hardware lists the backup disks were
    /// selected from, so that a disk leaving or joining the backup kind is seen.
    pub fn with_hardware(mut self, old: &[SharedDisk], new: &[SharedDisk]) -> Self {
        self.validator = Validator::new(old, new);
        self.validation = OnceLock::new();
        self
    }

    /// Validation result, computed on first use.
    pub fn validate(&self) -> ResultCode {
        *self.validation.get_or_init(|| self.validator.validate())
    }

    fn indices(disks: &[SharedDisk]) -> HashSet<u32> {
        disks.iter().map(|d| read(d).index).collect()
    }

    /// Events for disks that only the new list has.
    pub fn get_novel(&self, batch: &mut Batch) -> ResultCode {
        let output = self.validate();
        if output.is_failed() {
            return output;
        }
        let known = Self::indices(&self.from);
        for disk in self.to.iter().filter(|d| !known.contains(&read(d).index)) {
            batch.add_events(self.factory.novel(disk));
        }
        output
    }

    /// Events for disks that only the old list has.
    pub fn get_removed(&self, batch: &mut Batch) -> ResultCode {
        let output = self.validate();
        if output.is_failed() {
            return output;
        }
        let kept = Self::indices(&self.to);
        for disk in self.from.iter().filter(|d| !kept.contains(&read(d).index)) {
            batch.add_events(self.factory.removed(disk));
        }
        output
    }

    /// Events for disks present in both lists whose live URL changed.
    ///
    /// Enables go to `enabled`, disables to `disabled`; a missing batch
    /// discards its half.
    pub fn get_updated(&self, mut enabled: Option<&mut Batch>, mut disabled: Option<&mut Batch>) -> ResultCode {
        let output = self.validate();
        if output.is_failed() {
            return output;
        }
        for from in &self.from {
            let index = read(from).index;
            let Some(to) = self.to.iter().find(|d| read(d).index == index) else {
                continue;
            };
            let (enable, disable) = self.factory.updated(from, to);
            if let (Some(event), Some(batch)) = (enable, enabled.as_deref_mut()) {
                batch.add_event(event);
            }
            if let (Some(event), Some(batch)) = (disable, disabled.as_deref_mut()) {
                batch.add_event(event);
            }
        }
        output
    }
}

// =============================================================================
// Transition
// =============================================================================

/// Applies a [`Difference`] through one visitor.
///
/// While a batch is dispatched the visitor records failures into the topic.
pub struct Transition<'a> {
    diff: Difference,
    visitor: &'a mut dyn Visitor,
    topic: Option<Topic>,
}

impl<'a> Transition<'a> {
    pub fn new(diff: Difference, visitor: &'a mut dyn Visitor, topic: Option<Topic>) -> Self {
        Self { diff, visitor, topic }
    }

    pub fn difference(&self) -> &Difference {
        &self.diff
    }

    /// Bring up disks that are new.
    pub async fn plant(&mut self) -> ResultCode {
        let mut batch = Batch::new();
        let output = self.diff.get_novel(&mut batch);
        if output.is_failed() {
            return self.rejected(output);
        }
        self.do_(&batch).await
    }

    /// Take down disks that are gone.
    pub async fn remove(&mut self) -> ResultCode {
        let mut batch = Batch::new();
        let output = self.diff.get_removed(&mut batch);
        if output.is_failed() {
            return self.rejected(output);
        }
        self.do_(&batch).await
    }

    /// Full reconciliation. Disables of updated disks and removed disks go
    /// first, then new disks and enables of updated disks, so that a backup
    /// moving to another index is attached again after its old slot is gone.
    pub async fn replace(&mut self) -> ResultCode {
        let mut novel = Batch::new();
        let mut enabled = Batch::new();
        let mut disabled = Batch::new();
        let mut removed = Batch::new();

        for output in [
            self.diff.get_novel(&mut novel),
            self.diff.get_updated(Some(&mut enabled), Some(&mut disabled)),
            self.diff.get_removed(&mut removed),
        ] {
            if output.is_failed() {
                return self.rejected(output);
            }
        }
        info!(
            vm_uuid = self.diff.factory.vm_uuid(),
            novel = novel.len(),
            enabled = enabled.len(),
            disabled = disabled.len(),
            removed = removed.len(),
            "Replacing backup devices"
        );

        for batch in [&disabled, &removed, &novel, &enabled] {
            let output = self.do_(batch).await;
            if output.is_failed() {
                return output;
            }
        }
        ResultCode::Success
    }

    /// Record a validation failure; nothing was dispatched.
    fn rejected(&self, output: ResultCode) -> ResultCode {
        if let Some(topic) = &self.topic {
            topic.set_event_code(output);
        }
        output
    }

    async fn do_(&mut self, batch: &Batch) -> ResultCode {
        self.visitor.set_topic(self.topic.clone());
        let output = batch.dispatch(&mut *self.visitor).await;
        self.visitor.set_topic(None);
        output
    }
}
