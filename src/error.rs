//! Error taxonomy for an analysis session.
//!
//! Errors fall into two groups. Local errors ([`Error::Resolution`],
//! [`Error::Read`], [`Error::ObjectTooLarge`], [`Error::Io`]) only cost the
//! hook or object they occurred on and the session carries on. Everything
//! else ends the session and the target is terminated.

use std::path::PathBuf;

use thiserror::Error;

use crate::debugger::PointerWidth;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// A declared hook's function is not exported by the loaded module.
    #[error("could not find function {function} to hook in {module}")]
    Resolution {
        module: String,
        function: &'static str,
    },

    /// The target application could not be started.
    #[error("could not run {}: {reason}", path.display())]
    Launch { path: PathBuf, reason: String },

    /// A read of the target's memory failed or came back short.
    #[error("failed to read {length} bytes at {address:#010x} in the target")]
    Read { address: u64, length: usize },

    /// The length field of an OLE stream exceeds the configured limit.
    #[error("object length {length} exceeds the {limit} byte limit")]
    ObjectTooLarge { length: u64, limit: u64 },

    /// The target does not use the pointer width the stream layout assumes.
    #[error("targets with {0} pointers are not supported, use a 32-bit Office build")]
    UnsupportedPointerWidth(PointerWidth),

    /// The debugger backend failed in a way that leaves the target state unknown.
    #[error("debugger failure: {0}")]
    Adapter(String),

    /// The external CLSID database could not be parsed.
    #[error("invalid CLSID database: {0}")]
    ClsidDatabase(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the error ends the session.
    ///
    /// Adapter failures break the halted-world guarantee the extractor
    /// relies on, so they always stop the run.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Launch { .. } | Error::UnsupportedPointerWidth(_) | Error::Adapter(_)
        )
    }
}
