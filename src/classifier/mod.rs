//! Class id classification.
//!
//! A recovered class id is looked up in a [`ClsidTable`]. Listed ids are
//! reported at warning level with the object's size and digest; anything
//! else is reported at info level with a generic marker.

mod known;

use std::collections::HashMap;

use log::{log, Level};
use uguid::Guid;

use crate::result::TrackedObject;

pub use known::KNOWN_CLSIDS;

/// Description recorded for class ids that are not in the table.
pub const UNKNOWN_DESCRIPTION: &str = "Unknown (not on list)";

/// Class id as Windows prints it: uppercase, no braces.
pub fn clsid_string(id: Guid) -> String {
    id.to_string().to_ascii_uppercase()
}

/// Convert 16 bytes of in-memory `CLSID` into a [`Guid`].
pub fn clsid_from_bytes(bytes: &[u8]) -> Option<Guid> {
    let raw: [u8; 16] = bytes.try_into().ok()?;
    Some(Guid::from_bytes(raw))
}

/// Parse `XXXXXXXX-XXXX-XXXX-XXXX-XXXXXXXXXXXX`, with or without braces, any case.
pub fn parse_clsid(s: &str) -> Option<Guid> {
    let s = s.trim().trim_start_matches('{').trim_end_matches('}');
    Guid::try_parse(&s.to_ascii_lowercase()).ok()
}

/// Outcome of a lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    Known(String),
    Unknown,
}

impl Classification {
    pub fn description(&self) -> &str {
        match self {
            Classification::Known(d) => d,
            Classification::Unknown => UNKNOWN_DESCRIPTION,
        }
    }

    /// Log level used when reporting this outcome.
    pub fn level(&self) -> Level {
        match self {
            Classification::Known(_) => Level::Warn,
            Classification::Unknown => Level::Info,
        }
    }

    pub fn is_known(&self) -> bool {
        matches!(self, Classification::Known(_))
    }
}

/// Class id to description mapping. Read-only once a session starts.
#[derive(Debug, Clone, Default)]
pub struct ClsidTable {
    entries: HashMap<Guid, String>,
}

impl ClsidTable {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Table preloaded with [`KNOWN_CLSIDS`].
    pub fn builtin() -> Self {
        let mut table = Self::empty();
        for (id, desc) in KNOWN_CLSIDS {
            table.insert(*id, *desc);
        }
        table
    }

    pub fn insert(&mut self, id: Guid, description: impl Into<String>) {
        self.entries.insert(id, description.into());
    }

    pub fn get(&self, id: &Guid) -> Option<&str> {
        self.entries.get(id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Add entries from a JSON object mapping class id strings to
    /// descriptions. Existing entries with the same id are replaced.
    #[cfg(feature = "serde")]
    pub fn extend_from_json(&mut self, json: &str) -> crate::Result<usize> {
        use crate::error::Error;

        let map: HashMap<String, String> =
            serde_json::from_str(json).map_err(|e| Error::ClsidDatabase(e.to_string()))?;
        let mut parsed = Vec::with_capacity(map.len());
        for (key, desc) in map {
            let id = parse_clsid(&key)
                .ok_or_else(|| Error::ClsidDatabase(format!("bad class id {:?}", key)))?;
            parsed.push((id, desc));
        }
        let count = parsed.len();
        for (id, desc) in parsed {
            self.insert(id, desc);
        }
        Ok(count)
    }
}

/// Looks up class ids and annotates tracked objects.
#[derive(Debug, Clone)]
pub struct Classifier {
    table: ClsidTable,
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new(ClsidTable::builtin())
    }
}

impl Classifier {
    pub fn new(table: ClsidTable) -> Self {
        Self { table }
    }

    pub fn table(&self) -> &ClsidTable {
        &self.table
    }

    /// Pure lookup.
    pub fn classify(&self, id: &Guid) -> Classification {
        match self.table.get(id) {
            Some(desc) => Classification::Known(desc.to_string()),
            None => Classification::Unknown,
        }
    }

    /// Classify `id`, log the result and record it on `object` when the
    /// load could be tied to an extracted object.
    pub fn apply(&self, id: Guid, object: Option<&mut TrackedObject>) -> Classification {
        let class = self.classify(&id);
        let clsid = clsid_string(id);
        let level = class.level();

        match (&class, object.as_deref()) {
            (Classification::Known(desc), Some(obj)) => {
                log!(level, "Suspicious OLE object loaded, class id {} ({})", clsid, desc);
                log!(level, "Object size is {}, SHA256 is {}", obj.size, obj.sha256);
            }
            (Classification::Known(desc), None) => {
                log!(level, "Suspicious OLE object loaded, class id {} ({}), no native data recovered", clsid, desc);
            }
            (Classification::Unknown, _) => {
                log!(level, "Object found but not on list {}", clsid);
            }
        }

        if let Some(obj) = object {
            obj.class_id = Some(id);
            obj.description = Some(class.description().to_string());
        }
        class
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uguid::guid;

    const PACKAGE: Guid = guid!("0003000c-0000-0000-c000-000000000046");

    #[test]
    fn clsid_bytes_use_windows_layout() {
        // {0003000C-0000-0000-C000-000000000046} as stored in memory.
        let raw = [
            0x0C, 0x00, 0x03, 0x00, 0x00, 0x00, 0x00, 0x00, 0xC0, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x00, 0x46,
        ];
        let id = clsid_from_bytes(&raw).unwrap();
        assert_eq!(id, PACKAGE);
        assert_eq!(clsid_string(id), "0003000C-0000-0000-C000-000000000046");
    }

    #[test]
    fn clsid_from_short_slice_is_none() {
        assert!(clsid_from_bytes(&[0u8; 15]).is_none());
    }

    #[test]
    fn parse_tolerates_braces_and_case() {
        assert_eq!(parse_clsid("{0003000C-0000-0000-C000-000000000046}"), Some(PACKAGE));
        assert_eq!(parse_clsid(" 0003000c-0000-0000-c000-000000000046 "), Some(PACKAGE));
        assert_eq!(parse_clsid("not-a-guid"), None);
    }

    #[test]
    fn builtin_lists_packager() {
        let c = Classifier::default();
        assert!(c.classify(&PACKAGE).is_known());
        assert_eq!(c.classify(&Guid::ZERO), Classification::Unknown);
    }

    #[test]
    fn builtin_has_no_duplicates() {
        let table = ClsidTable::builtin();
        assert_eq!(table.len(), KNOWN_CLSIDS.len());
    }

    #[test]
    fn levels() {
        assert_eq!(Classification::Known("x".into()).level(), Level::Warn);
        assert_eq!(Classification::Unknown.level(), Level::Info);
        assert!(Classification::Known("x".into()).level() < Classification::Unknown.level());
    }
}
