//! # rtfraptor
//!
//! Recover the OLE objects an Office document really loads, by running the
//! document in the Office application under a debugger instead of parsing it.
//!
//! Malicious RTF files hide their payload behind obfuscation that static
//! parsers trip over. The application itself has to de-obfuscate the data
//! before handing it to `ole32.dll`, so hooking a handful of OLE functions
//! yields each embedded object in its final form, along with the class id
//! the application resolved for it.
//!
//! ## What is hooked
//!
//! - `OleConvertOLESTREAMToIStorage`: native object data is copied out of
//!   the target, hashed with SHA-256 and optionally saved under its digest.
//! - `OleLoad`: remembers which storage is being loaded.
//! - `OleGetAutoConvert`: reads the class id of that storage and classifies
//!   it against a table of class ids abused by exploits
//!   ([CVE-2017-11882](https://www.cve.org/CVERecord?id=CVE-2017-11882),
//!   [CVE-2017-0199](https://www.cve.org/CVERecord?id=CVE-2017-0199), packager
//!   objects, ...).
//!
//! ## Example
//!
//! ```no_run
//! use rtfraptor::{debugger, Session, SessionConfig, Verdict};
//!
//! let adapter = debugger::native()?;
//! let config = SessionConfig::new(
//!     r"C:\Program Files (x86)\Microsoft Office\root\Office16\WINWORD.EXE",
//!     "sample.rtf",
//! );
//! let report = Session::new(adapter, config).run()?;
//! if report.verdict == Verdict::Malicious {
//!     for obj in report.known_objects() {
//!         println!("{} {:?}", obj.sha256, obj.description);
//!     }
//! }
//! # Ok::<(), rtfraptor::Error>(())
//! ```
//!
//! ## Platform
//!
//! The live backend needs a 32-bit Windows build (`i686-pc-windows-msvc`)
//! and a 32-bit Office install. Everything else, including
//! [`debugger::SimulatedTarget`], builds anywhere.

pub mod classifier;
pub mod correlator;
pub mod debugger;
mod error;
pub mod extractor;
pub mod hooks;
mod result;
pub mod session;

pub use classifier::{Classification, Classifier, ClsidTable};
pub use correlator::{Anomaly, LoadCorrelator};
pub use debugger::{DebugAdapter, DebugEvent, PointerWidth};
pub use error::{Error, Result};
pub use extractor::{sha256_hex, ObjectStore, StreamExtractor};
pub use hooks::{HookKind, HookRegistry};
pub use result::{SessionReport, StopReason, StorageHandle, TrackedObject, Verdict};
pub use session::{Session, SessionConfig, SessionState};

/// Run one session with the built-in hooks and a custom classifier.
pub fn analyze<A: DebugAdapter>(
    adapter: A,
    config: SessionConfig,
    classifier: Classifier,
) -> Result<SessionReport> {
    Session::new(adapter, config).with_classifier(classifier).run()
}
