//! Load correlation between `OleLoad` and `OleGetAutoConvert`.
//!
//! ole32 loads an embedded object and asks for its class id through two
//! unrelated code paths, and nothing visible to the hooks ties the calls
//! together. The correlator relies on call order instead: the storage handle
//! from the most recent load is assumed to belong to the next class id
//! lookup. Interleaved or reentrant loads defeat this; they are reported as
//! anomalies, never silently repaired.

use indexmap::IndexMap;
use log::debug;

use crate::result::{StorageHandle, TrackedObject};

/// Correlator state. At most one handle is pending at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorrelationState {
    Idle,
    AwaitingClassification(StorageHandle),
}

/// Out-of-order call sequences. Diagnostic only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Anomaly {
    /// A load arrived while an earlier one was still waiting for its class id.
    OverwrittenLoad {
        previous: StorageHandle,
        current: StorageHandle,
    },
    /// A class id lookup arrived with no load pending.
    UnmatchedClassification,
}

/// Owns the pending slot and every object recovered in the session.
#[derive(Debug, Default)]
pub struct LoadCorrelator {
    pending: Option<StorageHandle>,
    objects: IndexMap<StorageHandle, TrackedObject>,
    anomalies: usize,
}

impl LoadCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> CorrelationState {
        match self.pending {
            Some(h) => CorrelationState::AwaitingClassification(h),
            None => CorrelationState::Idle,
        }
    }

    pub fn pending(&self) -> Option<StorageHandle> {
        self.pending
    }

    /// An object load was observed for `handle`.
    pub fn on_object_load(&mut self, handle: StorageHandle) -> Option<Anomaly> {
        let anomaly = match self.pending.replace(handle) {
            Some(previous) => {
                let a = Anomaly::OverwrittenLoad { previous, current: handle };
                self.note(a);
                Some(a)
            }
            None => None,
        };
        debug!("OleLoad on storage {:#010x}, awaiting class id", handle);
        anomaly
    }

    /// A class id lookup was observed. Consumes the pending handle, returning
    /// to idle. With nothing pending the call is unrelated to an object load.
    pub fn on_guid_conversion(&mut self) -> Result<StorageHandle, Anomaly> {
        match self.pending.take() {
            Some(handle) => Ok(handle),
            None => {
                let a = Anomaly::UnmatchedClassification;
                self.note(a);
                Err(a)
            }
        }
    }

    /// Record an extracted object. A later extraction into the same storage
    /// replaces the earlier record.
    pub fn track(&mut self, object: TrackedObject) {
        self.objects.insert(object.handle, object);
    }

    pub fn object(&self, handle: StorageHandle) -> Option<&TrackedObject> {
        self.objects.get(&handle)
    }

    pub fn object_mut(&mut self, handle: StorageHandle) -> Option<&mut TrackedObject> {
        self.objects.get_mut(&handle)
    }

    pub fn objects(&self) -> impl Iterator<Item = &TrackedObject> {
        self.objects.values()
    }

    /// Loads that replaced a still-unclassified load.
    pub fn anomalies(&self) -> usize {
        self.anomalies
    }

    /// Recovered objects in extraction order.
    pub fn into_objects(self) -> Vec<TrackedObject> {
        self.objects.into_values().collect()
    }

    fn note(&mut self, anomaly: Anomaly) {
        match anomaly {
            Anomaly::OverwrittenLoad { previous, current } => {
                self.anomalies += 1;
                debug!(
                    "OleLoad on {:#010x} replaces unclassified storage {:#010x}",
                    current, previous
                )
            }
            Anomaly::UnmatchedClassification => {
                debug!("OleGetAutoConvert called with no pending OleLoad, ignoring")
            }
        }
    }
}
