//! Hook registry: which functions in which modules get a breakpoint.
//!
//! The table is static. Each entry carries the [`HookKind`] that the
//! breakpoint is tagged with, so a hit is routed to its handler without any
//! name lookup at call time.

use log::{debug, error};

use crate::debugger::{DebugAdapter, ModuleInfo, Pid};
use crate::error::{Error, Result};

/// The intercepted calls, one per handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum HookKind {
    /// `OleLoad(pStg, riid, pClientSite, ppvObj)`
    ObjectLoad,
    /// `OleConvertOLESTREAMToIStorage(lpolestream, pstg, ptd)`
    DataConversion,
    /// `OleGetAutoConvert(clsidOld, pClsidNew)`
    GuidConversion,
}

/// One declared intercept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookSpec {
    pub module: &'static str,
    pub function: &'static str,
    /// Word-sized arguments captured on entry.
    pub args: usize,
    pub kind: HookKind,
}

/// Functions hooked in ole32.dll.
pub static HOOKS: &[HookSpec] = &[
    HookSpec {
        module: "ole32.dll",
        function: "OleLoad",
        args: 4,
        kind: HookKind::ObjectLoad,
    },
    HookSpec {
        module: "ole32.dll",
        function: "OleConvertOLESTREAMToIStorage",
        args: 3,
        kind: HookKind::DataConversion,
    },
    HookSpec {
        module: "ole32.dll",
        function: "OleGetAutoConvert",
        args: 2,
        kind: HookKind::GuidConversion,
    },
];

/// What happened when hooks were applied to one module.
#[derive(Debug, Default)]
pub struct Installation {
    pub installed: Vec<HookKind>,
    /// One [`Error::Resolution`] per function the module does not export.
    pub unresolved: Vec<Error>,
}

impl Installation {
    pub fn is_complete(&self) -> bool {
        self.unresolved.is_empty()
    }
}

/// Applies a hook table to modules as the target loads them.
#[derive(Debug, Clone, Copy)]
pub struct HookRegistry {
    hooks: &'static [HookSpec],
}

impl Default for HookRegistry {
    fn default() -> Self {
        Self::new(HOOKS)
    }
}

impl HookRegistry {
    pub fn new(hooks: &'static [HookSpec]) -> Self {
        Self { hooks }
    }

    pub fn hooks(&self) -> &'static [HookSpec] {
        self.hooks
    }

    /// Whether any hook targets `module`.
    pub fn wants(&self, module: &ModuleInfo) -> bool {
        self.hooks.iter().any(|h| module.matches(h.module))
    }

    /// Install every hook declared for `module`.
    ///
    /// A function that does not resolve, or whose lookup hits unreadable
    /// memory, is recorded and skipped; the rest are still installed. Only a
    /// failure of the adapter itself is returned as `Err`.
    pub fn install<A: DebugAdapter + ?Sized>(
        &self,
        adapter: &mut A,
        pid: Pid,
        module: &ModuleInfo,
    ) -> Result<Installation> {
        let mut out = Installation::default();
        if !self.wants(module) {
            return Ok(out);
        }
        debug!("Process loaded {}, hooks exist for this module", module.name);

        for hook in self.hooks.iter().filter(|h| module.matches(h.module)) {
            let resolved = match adapter.resolve_export(pid, module, hook.function) {
                Ok(resolved) => resolved,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    // Unreadable export table: same outcome as a missing export.
                    error!("Export table of {} is unreadable: {}", module.name, e);
                    None
                }
            };
            match resolved {
                Some(address) => {
                    debug!("Address of {} is {:#010x}", hook.function, address);
                    adapter.install_breakpoint(pid, address, hook.args, hook.kind)?;
                    out.installed.push(hook.kind);
                }
                None => {
                    let err = Error::Resolution {
                        module: module.file_name().to_string(),
                        function: hook.function,
                    };
                    error!("{}", err);
                    out.unresolved.push(err);
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_covers_each_kind_once() {
        for kind in [HookKind::ObjectLoad, HookKind::DataConversion, HookKind::GuidConversion] {
            assert_eq!(HOOKS.iter().filter(|h| h.kind == kind).count(), 1);
        }
    }

    #[test]
    fn arity_matches_prototypes() {
        let args = |kind| HOOKS.iter().find(|h| h.kind == kind).map(|h| h.args);
        assert_eq!(args(HookKind::ObjectLoad), Some(4));
        assert_eq!(args(HookKind::DataConversion), Some(3));
        assert_eq!(args(HookKind::GuidConversion), Some(2));
    }

    #[test]
    fn wants_only_ole32() {
        let registry = HookRegistry::default();
        let ole32 = ModuleInfo { name: "C:\\Windows\\SysWOW64\\ole32.dll".into(), base: 0x7000_0000 };
        let kernel = ModuleInfo { name: "kernel32.dll".into(), base: 0x7600_0000 };
        assert!(registry.wants(&ole32));
        assert!(!registry.wants(&kernel));
    }
}
