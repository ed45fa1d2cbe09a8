//! Debugger backend interface.
//!
//! The analysis engine never touches the target directly. Everything it
//! needs (launching, breakpoints, remote reads, the event loop) goes through
//! [`DebugAdapter`]. Two backends ship with the crate: [`SimulatedTarget`],
//! a scripted in-memory target used by the tests, and, on 32-bit Windows,
//! `WindowsDebugger` built on the Win32 debugging API.

pub mod pe;
mod simulated;
#[cfg(all(windows, target_arch = "x86"))]
mod windows;

use std::fmt;
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::hooks::HookKind;

pub use simulated::{SimulatedTarget, Step};
#[cfg(all(windows, target_arch = "x86"))]
pub use windows::WindowsDebugger;

/// Process identifier in the host OS.
pub type Pid = u32;

/// Pointer width of the target process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerWidth {
    Bits32,
    Bits64,
}

impl PointerWidth {
    /// Size of a pointer in bytes.
    pub fn bytes(self) -> usize {
        match self {
            PointerWidth::Bits32 => 4,
            PointerWidth::Bits64 => 8,
        }
    }
}

impl fmt::Display for PointerWidth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PointerWidth::Bits32 => f.write_str("32-bit"),
            PointerWidth::Bits64 => f.write_str("64-bit"),
        }
    }
}

/// A module (DLL) mapped into the target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleInfo {
    /// File name as reported by the loader, possibly a full path.
    pub name: String,
    /// Load address.
    pub base: u64,
}

impl ModuleInfo {
    /// File name without directories, e.g. `ole32.dll`.
    pub fn file_name(&self) -> &str {
        self.name
            .rsplit(['\\', '/'])
            .next()
            .unwrap_or(&self.name)
    }

    /// Case-insensitive comparison against a bare DLL name.
    pub fn matches(&self, dll: &str) -> bool {
        self.file_name().eq_ignore_ascii_case(dll)
    }
}

/// One debug event. The target stays halted until [`DebugAdapter::resume`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DebugEvent {
    ModuleLoaded {
        pid: Pid,
        module: ModuleInfo,
    },
    /// A hooked function was entered. `args` holds exactly the number of
    /// machine words requested when the breakpoint was installed.
    Breakpoint {
        pid: Pid,
        address: u64,
        kind: HookKind,
        args: Vec<u64>,
    },
    ProcessExited {
        pid: Pid,
        exit_code: u32,
    },
    /// Anything the engine has no interest in (thread events, exceptions, ...).
    Other {
        pid: Pid,
    },
}

impl DebugEvent {
    pub fn pid(&self) -> Pid {
        match self {
            DebugEvent::ModuleLoaded { pid, .. }
            | DebugEvent::Breakpoint { pid, .. }
            | DebugEvent::ProcessExited { pid, .. }
            | DebugEvent::Other { pid } => *pid,
        }
    }
}

/// Outcome of a bounded wait. Fatal failures come back as `Err`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Waited {
    Event(DebugEvent),
    Timeout,
}

/// Capabilities the engine needs from a process debugger.
pub trait DebugAdapter {
    /// Start `executable` with `args` under debugger control. The target must
    /// not outlive the analysing process.
    fn launch(&mut self, executable: &Path, args: &[&Path]) -> Result<Pid>;

    fn pointer_width(&self, pid: Pid) -> PointerWidth;

    /// Address of an exported function, `None` if the module has no such export.
    fn resolve_export(&mut self, pid: Pid, module: &ModuleInfo, name: &str) -> Result<Option<u64>>;

    /// Break on entry to `address`, capturing the first `arg_count` word-sized
    /// arguments. Hits are reported as [`DebugEvent::Breakpoint`] carrying `kind`.
    fn install_breakpoint(
        &mut self,
        pid: Pid,
        address: u64,
        arg_count: usize,
        kind: HookKind,
    ) -> Result<()>;

    /// Read exactly `length` bytes. A short read is an error.
    fn read_memory(&mut self, pid: Pid, address: u64, length: usize) -> Result<Vec<u8>>;

    /// Wait at most `timeout` for the next event.
    fn wait(&mut self, timeout: Duration) -> Result<Waited>;

    /// Let the target continue after the last delivered event.
    fn resume(&mut self, pid: Pid) -> Result<()>;

    fn terminate(&mut self, pid: Pid) -> Result<()>;

    fn is_running(&self, pid: Pid) -> bool;
}

/// Little-endian `u32` at `address`.
pub fn read_u32<A: DebugAdapter + ?Sized>(adapter: &mut A, pid: Pid, address: u64) -> Result<u32> {
    let bytes = adapter.read_memory(pid, address, 4)?;
    let raw: [u8; 4] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| Error::Read { address, length: 4 })?;
    Ok(u32::from_le_bytes(raw))
}

/// Pointer-sized value at `address`, widened to `u64`.
pub fn read_pointer<A: DebugAdapter + ?Sized>(
    adapter: &mut A,
    pid: Pid,
    address: u64,
    width: PointerWidth,
) -> Result<u64> {
    let len = width.bytes();
    let bytes = adapter.read_memory(pid, address, len)?;
    if bytes.len() != len {
        return Err(Error::Read { address, length: len });
    }
    let mut raw = [0u8; 8];
    raw[..len].copy_from_slice(&bytes);
    Ok(u64::from_le_bytes(raw))
}

impl<T: DebugAdapter + ?Sized> DebugAdapter for Box<T> {
    fn launch(&mut self, executable: &Path, args: &[&Path]) -> Result<Pid> {
        (**self).launch(executable, args)
    }

    fn pointer_width(&self, pid: Pid) -> PointerWidth {
        (**self).pointer_width(pid)
    }

    fn resolve_export(&mut self, pid: Pid, module: &ModuleInfo, name: &str) -> Result<Option<u64>> {
        (**self).resolve_export(pid, module, name)
    }

    fn install_breakpoint(
        &mut self,
        pid: Pid,
        address: u64,
        arg_count: usize,
        kind: HookKind,
    ) -> Result<()> {
        (**self).install_breakpoint(pid, address, arg_count, kind)
    }

    fn read_memory(&mut self, pid: Pid, address: u64, length: usize) -> Result<Vec<u8>> {
        (**self).read_memory(pid, address, length)
    }

    fn wait(&mut self, timeout: Duration) -> Result<Waited> {
        (**self).wait(timeout)
    }

    fn resume(&mut self, pid: Pid) -> Result<()> {
        (**self).resume(pid)
    }

    fn terminate(&mut self, pid: Pid) -> Result<()> {
        (**self).terminate(pid)
    }

    fn is_running(&self, pid: Pid) -> bool {
        (**self).is_running(pid)
    }
}

/// The platform's native debugger backend.
pub fn native() -> Result<Box<dyn DebugAdapter>> {
    #[cfg(all(windows, target_arch = "x86"))]
    {
        Ok(Box::new(WindowsDebugger::new()))
    }
    #[cfg(not(all(windows, target_arch = "x86")))]
    {
        Err(Error::Adapter(
            "no debugger backend for this platform, build for i686-pc-windows-msvc".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn module_name_match_ignores_path_and_case() {
        let m = ModuleInfo {
            name: "C:\\Windows\\SysWOW64\\OLE32.DLL".to_string(),
            base: 0x7500_0000,
        };
        assert_eq!(m.file_name(), "OLE32.DLL");
        assert!(m.matches("ole32.dll"));
        assert!(!m.matches("oleaut32.dll"));
    }

    #[test]
    fn pointer_width_sizes() {
        assert_eq!(PointerWidth::Bits32.bytes(), 4);
        assert_eq!(PointerWidth::Bits64.bytes(), 8);
        assert_eq!(PointerWidth::Bits64.to_string(), "64-bit");
    }
}
