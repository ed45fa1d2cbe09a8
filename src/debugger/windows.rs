//! Win32 debugging API backend for 32-bit targets.
//!
//! Breakpoints are classic `int3` patches. On a hit the original byte is
//! restored, `eip` rewound and the trap flag set; the single-step exception
//! that follows re-arms the patch and is never surfaced to the engine.
//! Arguments are read from the stack as `stdcall` words.

use std::collections::HashMap;
use std::ffi::c_void;
use std::os::windows::ffi::OsStrExt;
use std::path::Path;
use std::time::{Duration, Instant};

use log::{debug, trace};
use windows::core::{PCWSTR, PWSTR};
use windows::Win32::Foundation::{
    CloseHandle, BOOL, DBG_CONTINUE, DBG_EXCEPTION_NOT_HANDLED, ERROR_SEM_TIMEOUT,
    EXCEPTION_BREAKPOINT, EXCEPTION_SINGLE_STEP, HANDLE, NTSTATUS,
};
use windows::Win32::Storage::FileSystem::{GetFinalPathNameByHandleW, FILE_NAME_NORMALIZED};
use windows::Win32::System::Diagnostics::Debug::{
    ContinueDebugEvent, DebugSetProcessKillOnExit, FlushInstructionCache, GetThreadContext,
    ReadProcessMemory, SetThreadContext, WaitForDebugEvent, WriteProcessMemory, CONTEXT,
    CONTEXT_CONTROL_X86, CREATE_PROCESS_DEBUG_EVENT, CREATE_THREAD_DEBUG_EVENT, DEBUG_EVENT,
    EXCEPTION_DEBUG_EVENT, EXIT_PROCESS_DEBUG_EVENT, EXIT_THREAD_DEBUG_EVENT,
    LOAD_DLL_DEBUG_EVENT,
};
use windows::Win32::System::Threading::{
    CreateProcessW, GetCurrentProcess, IsWow64Process, TerminateProcess, DEBUG_ONLY_THIS_PROCESS,
    PROCESS_INFORMATION, STARTUPINFOW,
};

use crate::debugger::{pe, DebugAdapter, DebugEvent, ModuleInfo, Pid, PointerWidth, Waited};
use crate::error::{Error, Result};
use crate::hooks::HookKind;

const INT3: u8 = 0xCC;
const TRAP_FLAG: u32 = 0x100;

fn adapter_error(what: &str, e: windows::core::Error) -> Error {
    Error::Adapter(format!("{}: {}", what, e))
}

fn wide(s: &str) -> Vec<u16> {
    std::ffi::OsStr::new(s).encode_wide().chain(Some(0)).collect()
}

fn quote(path: &Path) -> String {
    format!("\"{}\"", path.display())
}

#[derive(Debug, Clone, Copy)]
struct Breakpoint {
    original: u8,
    arg_count: usize,
    kind: HookKind,
}

/// Event the target is currently halted on.
#[derive(Debug, Clone, Copy)]
struct Halt {
    pid: u32,
    tid: u32,
    status: NTSTATUS,
}

/// Debugger for one 32-bit process tree root, built on `WaitForDebugEvent`.
pub struct WindowsDebugger {
    process: Option<HANDLE>,
    pid: Pid,
    threads: HashMap<u32, HANDLE>,
    breakpoints: HashMap<u64, Breakpoint>,
    /// Thread id to the breakpoint it stepped over.
    rearm: HashMap<u32, u64>,
    halted: Option<Halt>,
    running: bool,
    width: PointerWidth,
}

impl Default for WindowsDebugger {
    fn default() -> Self {
        Self::new()
    }
}

impl WindowsDebugger {
    pub fn new() -> Self {
        Self {
            process: None,
            pid: 0,
            threads: HashMap::new(),
            breakpoints: HashMap::new(),
            rearm: HashMap::new(),
            halted: None,
            running: false,
            width: PointerWidth::Bits32,
        }
    }

    fn process(&self) -> Result<HANDLE> {
        self.process
            .ok_or_else(|| Error::Adapter("no target launched".to_string()))
    }

    fn write_byte(&mut self, address: u64, byte: u8) -> Result<()> {
        let process = self.process()?;
        let mut written = 0usize;
        unsafe {
            WriteProcessMemory(
                process,
                address as *const c_void,
                &byte as *const u8 as *const c_void,
                1,
                Some(&mut written),
            )
            .map_err(|e| adapter_error("WriteProcessMemory", e))?;
            FlushInstructionCache(process, Some(address as *const c_void), 1)
                .map_err(|e| adapter_error("FlushInstructionCache", e))?;
        }
        if written != 1 {
            return Err(Error::Adapter(format!("could not patch {:#010x}", address)));
        }
        Ok(())
    }

    fn context(&self, tid: u32) -> Result<(HANDLE, CONTEXT)> {
        let thread = *self
            .threads
            .get(&tid)
            .ok_or_else(|| Error::Adapter(format!("unknown thread {}", tid)))?;
        let mut ctx: CONTEXT = unsafe { std::mem::zeroed() };
        ctx.ContextFlags = CONTEXT_CONTROL_X86;
        unsafe { GetThreadContext(thread, &mut ctx) }
            .map_err(|e| adapter_error("GetThreadContext", e))?;
        Ok((thread, ctx))
    }

    /// Rewind past the `int3`, step over the original instruction and
    /// collect the stack arguments.
    fn on_hit(&mut self, tid: u32, address: u64, bp: Breakpoint) -> Result<Vec<u64>> {
        let (thread, mut ctx) = self.context(tid)?;
        ctx.Eip = address as u32;
        ctx.EFlags |= TRAP_FLAG;
        unsafe { SetThreadContext(thread, &ctx) }
            .map_err(|e| adapter_error("SetThreadContext", e))?;
        self.write_byte(address, bp.original)?;
        self.rearm.insert(tid, address);

        let stack = self.read_memory(self.pid, u64::from(ctx.Esp) + 4, bp.arg_count * 4)?;
        Ok(stack
            .chunks_exact(4)
            .map(|w| u64::from(u32::from_le_bytes([w[0], w[1], w[2], w[3]])))
            .collect())
    }

    fn module_name(file: HANDLE) -> String {
        let mut buf = vec![0u16; 1024];
        let len = unsafe { GetFinalPathNameByHandleW(file, &mut buf, FILE_NAME_NORMALIZED) };
        let len = len as usize;
        if len == 0 || len > buf.len() {
            return String::new();
        }
        String::from_utf16_lossy(&buf[..len])
    }

    /// Translate one raw event. `None` means it was handled internally and
    /// already continued.
    fn translate(&mut self, ev: &DEBUG_EVENT) -> Result<Option<DebugEvent>> {
        let pid = ev.dwProcessId;
        let tid = ev.dwThreadId;
        let mut status = DBG_CONTINUE;
        let event = match ev.dwDebugEventCode {
            CREATE_PROCESS_DEBUG_EVENT => {
                let info = unsafe { ev.u.CreateProcessInfo };
                self.threads.insert(tid, info.hThread);
                if !info.hFile.is_invalid() {
                    let _ = unsafe { CloseHandle(info.hFile) };
                }
                DebugEvent::Other { pid }
            }
            CREATE_THREAD_DEBUG_EVENT => {
                let info = unsafe { ev.u.CreateThread };
                self.threads.insert(tid, info.hThread);
                DebugEvent::Other { pid }
            }
            EXIT_THREAD_DEBUG_EVENT => {
                self.threads.remove(&tid);
                self.rearm.remove(&tid);
                DebugEvent::Other { pid }
            }
            LOAD_DLL_DEBUG_EVENT => {
                let info = unsafe { ev.u.LoadDll };
                let name = Self::module_name(info.hFile);
                if !info.hFile.is_invalid() {
                    let _ = unsafe { CloseHandle(info.hFile) };
                }
                trace!("Loaded {} at {:p}", name, info.lpBaseOfDll);
                DebugEvent::ModuleLoaded {
                    pid,
                    module: ModuleInfo {
                        name,
                        base: info.lpBaseOfDll as u64,
                    },
                }
            }
            EXIT_PROCESS_DEBUG_EVENT => {
                let info = unsafe { ev.u.ExitProcess };
                if pid == self.pid {
                    self.running = false;
                }
                DebugEvent::ProcessExited {
                    pid,
                    exit_code: info.dwExitCode,
                }
            }
            EXCEPTION_DEBUG_EVENT => {
                let record = unsafe { ev.u.Exception.ExceptionRecord };
                let address = record.ExceptionAddress as u64;
                if record.ExceptionCode == EXCEPTION_SINGLE_STEP {
                    if let Some(bp_address) = self.rearm.remove(&tid) {
                        self.write_byte(bp_address, INT3)?;
                        self.continue_event(Halt { pid, tid, status })?;
                        return Ok(None);
                    }
                    status = DBG_EXCEPTION_NOT_HANDLED;
                    DebugEvent::Other { pid }
                } else if record.ExceptionCode == EXCEPTION_BREAKPOINT {
                    match self.breakpoints.get(&address).copied() {
                        Some(bp) => {
                            let args = self.on_hit(tid, address, bp)?;
                            DebugEvent::Breakpoint {
                                pid,
                                address,
                                kind: bp.kind,
                                args,
                            }
                        }
                        // Loader breakpoint.
                        None => DebugEvent::Other { pid },
                    }
                } else {
                    status = DBG_EXCEPTION_NOT_HANDLED;
                    DebugEvent::Other { pid }
                }
            }
            _ => DebugEvent::Other { pid },
        };
        self.halted = Some(Halt { pid, tid, status });
        Ok(Some(event))
    }

    /// Arms kill-on-exit and reports the pointer width of `process`.
    fn process_width(process: HANDLE) -> Result<PointerWidth> {
        unsafe { DebugSetProcessKillOnExit(BOOL::from(true)) }
            .map_err(|e| adapter_error("DebugSetProcessKillOnExit", e))?;
        let mut ours = BOOL(0);
        let mut theirs = BOOL(0);
        unsafe {
            IsWow64Process(GetCurrentProcess(), &mut ours)
                .and_then(|_| IsWow64Process(process, &mut theirs))
        }
        .map_err(|e| adapter_error("IsWow64Process", e))?;
        Ok(if ours.as_bool() && !theirs.as_bool() {
            PointerWidth::Bits64
        } else {
            PointerWidth::Bits32
        })
    }

    fn continue_event(&mut self, halt: Halt) -> Result<()> {
        unsafe { ContinueDebugEvent(halt.pid, halt.tid, halt.status) }
            .map_err(|e| adapter_error("ContinueDebugEvent", e))
    }
}

impl DebugAdapter for WindowsDebugger {
    fn launch(&mut self, executable: &Path, args: &[&Path]) -> Result<Pid> {
        let launch_error = |reason: String| Error::Launch {
            path: executable.to_path_buf(),
            reason,
        };
        let mut command_line = quote(executable);
        for arg in args {
            command_line.push(' ');
            command_line.push_str(&quote(arg));
        }
        let mut command_line = wide(&command_line);

        let startup = STARTUPINFOW {
            cb: std::mem::size_of::<STARTUPINFOW>() as u32,
            ..Default::default()
        };
        let mut info = PROCESS_INFORMATION::default();
        unsafe {
            CreateProcessW(
                PCWSTR::null(),
                PWSTR(command_line.as_mut_ptr()),
                None,
                None,
                BOOL::from(false),
                DEBUG_ONLY_THIS_PROCESS,
                None,
                PCWSTR::null(),
                &startup,
                &mut info,
            )
        }
        .map_err(|e| launch_error(e.to_string()))?;
        let _ = unsafe { CloseHandle(info.hThread) };
        self.process = Some(info.hProcess);
        self.pid = info.dwProcessId;
        self.running = true;

        match Self::process_width(info.hProcess) {
            Ok(width) => self.width = width,
            Err(e) => {
                let _ = self.terminate(info.dwProcessId);
                return Err(e);
            }
        }
        debug!("Created process {} ({})", self.pid, self.width);
        Ok(self.pid)
    }

    fn pointer_width(&self, _pid: Pid) -> PointerWidth {
        self.width
    }

    fn resolve_export(&mut self, pid: Pid, module: &ModuleInfo, name: &str) -> Result<Option<u64>> {
        pe::find_export(self, pid, module.base, name)
    }

    fn install_breakpoint(
        &mut self,
        pid: Pid,
        address: u64,
        arg_count: usize,
        kind: HookKind,
    ) -> Result<()> {
        if self.breakpoints.contains_key(&address) {
            return Ok(());
        }
        let original = self
            .read_memory(pid, address, 1)?
            .first()
            .copied()
            .ok_or(Error::Read { address, length: 1 })?;
        self.write_byte(address, INT3)?;
        self.breakpoints.insert(
            address,
            Breakpoint {
                original,
                arg_count,
                kind,
            },
        );
        Ok(())
    }

    fn read_memory(&mut self, _pid: Pid, address: u64, length: usize) -> Result<Vec<u8>> {
        let process = self.process()?;
        let mut buf = vec![0u8; length];
        let mut read = 0usize;
        let ok = unsafe {
            ReadProcessMemory(
                process,
                address as *const c_void,
                buf.as_mut_ptr() as *mut c_void,
                length,
                Some(&mut read),
            )
        };
        if ok.is_err() || read != length {
            return Err(Error::Read { address, length });
        }
        Ok(buf)
    }

    fn wait(&mut self, timeout: Duration) -> Result<Waited> {
        if self.halted.is_some() {
            return Err(Error::Adapter(
                "wait called before the last event was resumed".to_string(),
            ));
        }
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let mut ev = DEBUG_EVENT::default();
            match unsafe { WaitForDebugEvent(&mut ev, remaining.as_millis() as u32) } {
                Ok(()) => {}
                Err(e) if e.code() == ERROR_SEM_TIMEOUT.to_hresult() => return Ok(Waited::Timeout),
                Err(e) => return Err(adapter_error("WaitForDebugEvent", e)),
            }
            if let Some(event) = self.translate(&ev)? {
                return Ok(Waited::Event(event));
            }
            if remaining.is_zero() {
                return Ok(Waited::Timeout);
            }
        }
    }

    fn resume(&mut self, _pid: Pid) -> Result<()> {
        let halt = self
            .halted
            .take()
            .ok_or_else(|| Error::Adapter("resume without a pending event".to_string()))?;
        self.continue_event(halt)
    }

    fn terminate(&mut self, _pid: Pid) -> Result<()> {
        let process = match self.process.take() {
            Some(p) => p,
            None => return Ok(()),
        };
        let result = if self.running {
            unsafe { TerminateProcess(process, 1) }.map_err(|e| adapter_error("TerminateProcess", e))
        } else {
            Ok(())
        };
        if let Some(halt) = self.halted.take() {
            let _ = self.continue_event(halt);
        }
        let _ = unsafe { CloseHandle(process) };
        self.running = false;
        self.threads.clear();
        self.rearm.clear();
        self.breakpoints.clear();
        result
    }

    fn is_running(&self, _pid: Pid) -> bool {
        self.running
    }
}

impl Drop for WindowsDebugger {
    fn drop(&mut self) {
        let pid = self.pid;
        let _ = self.terminate(pid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_executable_leaves_no_process() {
        let mut dbg = WindowsDebugger::new();
        let err = dbg
            .launch(Path::new(r"C:\does\not\exist\winword.exe"), &[])
            .unwrap_err();
        assert!(matches!(err, Error::Launch { .. }));
        assert!(dbg.process.is_none());
        assert!(!dbg.is_running(0));
    }

    #[test]
    fn launched_process_is_tracked_until_terminated() {
        let mut dbg = WindowsDebugger::new();
        let pid = dbg.launch(Path::new(r"C:\Windows\System32\cmd.exe"), &[]).unwrap();
        assert!(dbg.process.is_some());
        assert!(dbg.is_running(pid));
        dbg.terminate(pid).unwrap();
        assert!(dbg.process.is_none());
        assert!(!dbg.is_running(pid));
    }
}
