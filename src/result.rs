//! Session result types: recovered objects and the overall verdict.

use std::path::PathBuf;

#[cfg(feature = "serde")]
use serde::Serialize;
use uguid::Guid;

/// Storage handle passed around by ole32 inside the target. Only ever used
/// as a correlation key, never dereferenced.
pub type StorageHandle = u64;

/// High-level verdict after a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub enum Verdict {
    /// No embedded object was loaded.
    Benign,
    /// Objects were loaded but none has a listed class id.
    Suspicious,
    /// At least one loaded object has a listed class id.
    Malicious,
}

/// Why the event loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum StopReason {
    /// The target exited (or crashed) on its own.
    TargetExited,
    /// The analysis deadline passed; results are partial.
    DeadlineExpired,
}

/// An OLE object recovered from the target.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct TrackedObject {
    /// Destination storage of the conversion call.
    pub handle: StorageHandle,
    /// Length in bytes of the native data.
    pub size: u32,
    /// Lowercase hex SHA-256 of the native data.
    pub sha256: String,
    /// Class id reported when the object was loaded.
    pub class_id: Option<Guid>,
    /// Table description, or the unknown marker once classified.
    pub description: Option<String>,
    /// Where the bytes were saved, if saving is enabled.
    pub path: Option<PathBuf>,
}

impl TrackedObject {
    pub fn new(handle: StorageHandle, size: u32, sha256: String) -> Self {
        Self {
            handle,
            size,
            sha256,
            class_id: None,
            description: None,
            path: None,
        }
    }

    /// Class id as Windows prints it (uppercase, no braces).
    pub fn class_id_string(&self) -> Option<String> {
        self.class_id.map(crate::classifier::clsid_string)
    }

    /// Classified and found on the list.
    pub fn is_known(&self) -> bool {
        matches!(self.description.as_deref(), Some(d) if d != crate::classifier::UNKNOWN_DESCRIPTION)
    }
}

/// Everything a finished session produced.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct SessionReport {
    /// Document that was opened.
    pub document: PathBuf,
    pub verdict: Verdict,
    pub stop_reason: StopReason,
    /// Recovered objects in the order they were extracted.
    pub objects: Vec<TrackedObject>,
    /// Hooked functions that could not be resolved (`module!function`).
    pub unresolved_hooks: Vec<String>,
    /// Loads that replaced a still-unclassified load; class ids may be misattributed.
    pub anomalies: usize,
    /// Extractions abandoned after a failed read.
    pub failed_extractions: usize,
}

impl SessionReport {
    /// Objects whose class id is on the list.
    pub fn known_objects(&self) -> impl Iterator<Item = &TrackedObject> {
        self.objects.iter().filter(|o| o.is_known())
    }

    pub fn timed_out(&self) -> bool {
        self.stop_reason == StopReason::DeadlineExpired
    }
}

/// Verdict for a set of objects.
pub(crate) fn verdict_for(objects: &[TrackedObject]) -> Verdict {
    if objects.is_empty() {
        Verdict::Benign
    } else if objects.iter().any(TrackedObject::is_known) {
        Verdict::Malicious
    } else {
        Verdict::Suspicious
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::UNKNOWN_DESCRIPTION;

    fn object(description: Option<&str>) -> TrackedObject {
        TrackedObject {
            description: description.map(str::to_string),
            ..TrackedObject::new(0x1000, 3, "00".repeat(32))
        }
    }

    #[test]
    fn no_objects_is_benign() {
        assert_eq!(verdict_for(&[]), Verdict::Benign);
    }

    #[test]
    fn unclassified_or_unknown_is_suspicious() {
        assert_eq!(verdict_for(&[object(None)]), Verdict::Suspicious);
        assert_eq!(verdict_for(&[object(Some(UNKNOWN_DESCRIPTION))]), Verdict::Suspicious);
    }

    #[test]
    fn listed_object_is_malicious() {
        let objs = [object(Some(UNKNOWN_DESCRIPTION)), object(Some("OLE Package Object"))];
        assert_eq!(verdict_for(&objs), Verdict::Malicious);
    }
}
