//! Native data extraction from `OleConvertOLESTREAMToIStorage` calls.
//!
//! The stream argument points at ole32's in-memory OLESTREAM wrapper. On
//! 32-bit Office the field at +8 points to a slot holding the data buffer
//! address and the field at +12 is the buffer length:
//!
//! ```text
//! stream + 8  -> [slot] -> data
//! stream + 12 =  length (u32)
//! ```
//!
//! The length comes from the document and is never trusted: it is checked
//! against a limit before anything is allocated, and the buffer is read in
//! one exact-length read so a bad address fails cleanly.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use log::debug;
use sha2::{Digest, Sha256};

use crate::debugger::{read_pointer, read_u32, DebugAdapter, Pid, PointerWidth};
use crate::error::{Error, Result};
use crate::result::{StorageHandle, TrackedObject};

/// Default upper bound on a single object.
pub const DEFAULT_MAX_OBJECT_SIZE: u32 = 64 * 1024 * 1024;

const DATA_SLOT_OFFSET: u64 = 8;
const LENGTH_OFFSET: u64 = 12;

/// Lowercase hex SHA-256 of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Native data read out of the target.
#[derive(Debug, Clone)]
pub struct Extracted {
    pub data_addr: u64,
    pub data: Vec<u8>,
    pub sha256: String,
}

/// Directory of recovered objects, one file per digest.
#[derive(Debug, Clone)]
pub struct ObjectStore {
    dir: PathBuf,
}

impl ObjectStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write `data` as `<dir>/<sha256>`.
    ///
    /// The bytes go to a temporary file that is renamed into place, so a
    /// failed write never leaves a truncated object under its digest. Saving
    /// the same content twice rewrites identical bytes.
    pub fn persist(&self, sha256: &str, data: &[u8]) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(sha256);
        let tmp = self.dir.join(format!("{}.part", sha256));
        let written = fs::File::create(&tmp).and_then(|mut f| {
            f.write_all(data)?;
            f.sync_all()
        });
        if let Err(e) = written {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        fs::rename(&tmp, &path)?;
        Ok(path)
    }
}

/// Reads OLE native data out of the target and records it.
#[derive(Debug, Clone)]
pub struct StreamExtractor {
    store: Option<ObjectStore>,
    max_object_size: u32,
}

impl Default for StreamExtractor {
    fn default() -> Self {
        Self::new(None, DEFAULT_MAX_OBJECT_SIZE)
    }
}

impl StreamExtractor {
    /// `store` of `None` tracks objects without saving them.
    pub fn new(store: Option<ObjectStore>, max_object_size: u32) -> Self {
        Self { store, max_object_size }
    }

    pub fn store(&self) -> Option<&ObjectStore> {
        self.store.as_ref()
    }

    /// Follow the stream structure at `stream` and read the native data.
    pub fn read_stream<A: DebugAdapter + ?Sized>(
        &self,
        adapter: &mut A,
        pid: Pid,
        stream: u64,
    ) -> Result<Extracted> {
        let width = adapter.pointer_width(pid);
        if width != PointerWidth::Bits32 {
            return Err(Error::UnsupportedPointerWidth(width));
        }

        let slot = read_pointer(adapter, pid, stream.wrapping_add(DATA_SLOT_OFFSET), width)?;
        let data_addr = read_pointer(adapter, pid, slot, width)?;
        let length = read_u32(adapter, pid, stream.wrapping_add(LENGTH_OFFSET))?;
        if length > self.max_object_size {
            return Err(Error::ObjectTooLarge {
                length: u64::from(length),
                limit: u64::from(self.max_object_size),
            });
        }

        let data = if length == 0 {
            Vec::new()
        } else {
            adapter.read_memory(pid, data_addr, length as usize)?
        };
        if data.len() != length as usize {
            return Err(Error::Read { address: data_addr, length: length as usize });
        }

        let sha256 = sha256_hex(&data);
        Ok(Extracted { data_addr, data, sha256 })
    }

    /// Handle one conversion call: read the object, save it and build the
    /// record keyed by the destination storage. Any failure abandons the
    /// object; nothing partial is saved or returned.
    pub fn extract<A: DebugAdapter + ?Sized>(
        &self,
        adapter: &mut A,
        pid: Pid,
        stream: u64,
        storage: StorageHandle,
    ) -> Result<TrackedObject> {
        let extracted = self.read_stream(adapter, pid, stream)?;
        let size = extracted.data.len() as u32;
        let mut object = TrackedObject::new(storage, size, extracted.sha256);

        if let Some(store) = &self.store {
            object.path = Some(store.persist(&object.sha256, &extracted.data)?);
        }

        debug!(
            "Dumping data from {:#010x}, destination {:#010x}, length {}, hash {}",
            extracted.data_addr, storage, size, object.sha256
        );
        Ok(object)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_of_empty_input() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn sha256_of_abc() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn persist_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = ObjectStore::new(dir.path().join("objects"));
        let digest = sha256_hex(b"payload");
        let first = store.persist(&digest, b"payload").unwrap();
        let second = store.persist(&digest, b"payload").unwrap();
        assert_eq!(first, second);
        assert_eq!(fs::read(&first).unwrap(), b"payload");
        let names: Vec<_> = fs::read_dir(store.dir()).unwrap().collect();
        assert_eq!(names.len(), 1, "no temporary file left behind");
    }
}
