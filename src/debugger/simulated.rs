//! Scripted in-memory target.
//!
//! Plays back a list of [`Step`]s as debug events against a sparse memory
//! map, with the same halted-world rules a real debugger imposes: no event
//! is delivered until the previous one was resumed. Calls to functions
//! without an installed breakpoint run silently, as they would in a real
//! process.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::debugger::{pe, DebugAdapter, DebugEvent, ModuleInfo, Pid, PointerWidth, Waited};
use crate::error::{Error, Result};
use crate::hooks::HookKind;

const SIMULATED_PID: Pid = 4242;

/// One scripted action of the target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// The loader maps a module registered with [`SimulatedTarget::with_module`].
    LoadModule(String),
    /// The target calls `module!function` with word-sized `args`.
    Call {
        module: String,
        function: String,
        args: Vec<u64>,
    },
    /// Nothing happens during one wait.
    Idle,
    /// The target exits.
    Exit(u32),
    /// The debugger backend breaks down.
    Fail(String),
}

#[derive(Debug, Clone)]
struct SimModule {
    info: ModuleInfo,
    /// Explicit export table; `None` means parse the PE image in memory.
    exports: Option<HashMap<String, u64>>,
}

#[derive(Debug, Clone, Copy)]
struct Breakpoint {
    arg_count: usize,
    kind: HookKind,
}

/// A fake debuggee driven by a script.
#[derive(Debug, Clone)]
pub struct SimulatedTarget {
    width: PointerWidth,
    launch_error: Option<String>,
    modules: Vec<SimModule>,
    memory: BTreeMap<u64, Vec<u8>>,
    script: VecDeque<Step>,
    breakpoints: HashMap<u64, Breakpoint>,
    launched_with: Option<(PathBuf, Vec<PathBuf>)>,
    running: bool,
    terminated: bool,
    halted: bool,
    resumes: usize,
    events: usize,
}

impl Default for SimulatedTarget {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedTarget {
    pub fn new() -> Self {
        Self {
            width: PointerWidth::Bits32,
            launch_error: None,
            modules: Vec::new(),
            memory: BTreeMap::new(),
            script: VecDeque::new(),
            breakpoints: HashMap::new(),
            launched_with: None,
            running: false,
            terminated: false,
            halted: false,
            resumes: 0,
            events: 0,
        }
    }

    pub fn with_pointer_width(mut self, width: PointerWidth) -> Self {
        self.width = width;
        self
    }

    /// Make [`DebugAdapter::launch`] fail with `reason`.
    pub fn with_launch_error(mut self, reason: impl Into<String>) -> Self {
        self.launch_error = Some(reason.into());
        self
    }

    /// Register a module with an explicit export table.
    pub fn with_module(mut self, name: &str, base: u64, exports: &[(&str, u64)]) -> Self {
        self.modules.push(SimModule {
            info: ModuleInfo { name: name.to_string(), base },
            exports: Some(exports.iter().map(|(n, a)| (n.to_string(), *a)).collect()),
        });
        self
    }

    /// Register a module whose exports are parsed from a PE image placed
    /// in memory at `base`.
    pub fn with_image(mut self, name: &str, base: u64, image: Vec<u8>) -> Self {
        self.modules.push(SimModule {
            info: ModuleInfo { name: name.to_string(), base },
            exports: None,
        });
        self.with_memory(base, image)
    }

    /// Map `bytes` at `address`. Regions must not overlap.
    pub fn with_memory(mut self, address: u64, bytes: impl Into<Vec<u8>>) -> Self {
        self.memory.insert(address, bytes.into());
        self
    }

    pub fn step(mut self, step: Step) -> Self {
        self.script.push_back(step);
        self
    }

    pub fn load(self, module: &str) -> Self {
        self.step(Step::LoadModule(module.to_string()))
    }

    pub fn call(self, module: &str, function: &str, args: &[u64]) -> Self {
        self.step(Step::Call {
            module: module.to_string(),
            function: function.to_string(),
            args: args.to_vec(),
        })
    }

    pub fn idle(mut self, waits: usize) -> Self {
        for _ in 0..waits {
            self.script.push_back(Step::Idle);
        }
        self
    }

    pub fn exit(self, code: u32) -> Self {
        self.step(Step::Exit(code))
    }

    pub fn fail(self, reason: &str) -> Self {
        self.step(Step::Fail(reason.to_string()))
    }

    /// Executable and arguments passed to `launch`.
    pub fn launched_with(&self) -> Option<(&Path, &[PathBuf])> {
        self.launched_with
            .as_ref()
            .map(|(exe, args)| (exe.as_path(), args.as_slice()))
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    pub fn resume_count(&self) -> usize {
        self.resumes
    }

    pub fn events_delivered(&self) -> usize {
        self.events
    }

    /// Hook kinds with an installed breakpoint, in no particular order.
    pub fn installed_hooks(&self) -> Vec<HookKind> {
        self.breakpoints.values().map(|b| b.kind).collect()
    }

    fn module(&self, name: &str) -> Option<&SimModule> {
        self.modules.iter().find(|m| m.info.matches(name))
    }

    fn export_address(&mut self, module: &str, function: &str) -> Result<Option<u64>> {
        let m = match self.module(module) {
            Some(m) => m.clone(),
            None => return Ok(None),
        };
        match &m.exports {
            Some(table) => Ok(table.get(function).copied()),
            None => pe::find_export(self, SIMULATED_PID, m.info.base, function),
        }
    }

    fn deliver(&mut self, event: DebugEvent) -> Result<Waited> {
        self.halted = true;
        self.events += 1;
        Ok(Waited::Event(event))
    }
}

impl DebugAdapter for SimulatedTarget {
    fn launch(&mut self, executable: &Path, args: &[&Path]) -> Result<Pid> {
        if let Some(reason) = &self.launch_error {
            return Err(Error::Launch {
                path: executable.to_path_buf(),
                reason: reason.clone(),
            });
        }
        self.launched_with = Some((
            executable.to_path_buf(),
            args.iter().map(|a| a.to_path_buf()).collect(),
        ));
        self.running = true;
        Ok(SIMULATED_PID)
    }

    fn pointer_width(&self, _pid: Pid) -> PointerWidth {
        self.width
    }

    fn resolve_export(&mut self, _pid: Pid, module: &ModuleInfo, name: &str) -> Result<Option<u64>> {
        self.export_address(module.file_name(), name)
    }

    fn install_breakpoint(
        &mut self,
        _pid: Pid,
        address: u64,
        arg_count: usize,
        kind: HookKind,
    ) -> Result<()> {
        if self.terminated {
            return Err(Error::Adapter("target is gone".to_string()));
        }
        self.breakpoints.insert(address, Breakpoint { arg_count, kind });
        Ok(())
    }

    fn read_memory(&mut self, _pid: Pid, address: u64, length: usize) -> Result<Vec<u8>> {
        let fail = Error::Read { address, length };
        if self.terminated {
            return Err(fail);
        }
        let (start, region) = match self.memory.range(..=address).next_back() {
            Some(r) => r,
            None => return Err(fail),
        };
        let offset = (address - start) as usize;
        match offset.checked_add(length) {
            Some(end) if end <= region.len() => Ok(region[offset..end].to_vec()),
            _ => Err(fail),
        }
    }

    fn wait(&mut self, timeout: Duration) -> Result<Waited> {
        if self.launched_with.is_none() || self.terminated {
            return Err(Error::Adapter("no target to wait on".to_string()));
        }
        if self.halted {
            return Err(Error::Adapter("wait called before the last event was resumed".to_string()));
        }
        while let Some(step) = self.script.pop_front() {
            match step {
                Step::LoadModule(name) => {
                    let module = self
                        .module(&name)
                        .map(|m| m.info.clone())
                        .ok_or_else(|| Error::Adapter(format!("script loads unknown module {}", name)))?;
                    return self.deliver(DebugEvent::ModuleLoaded { pid: SIMULATED_PID, module });
                }
                Step::Call { module, function, args } => {
                    let address = match self.export_address(&module, &function)? {
                        Some(a) => a,
                        None => continue,
                    };
                    let bp = match self.breakpoints.get(&address) {
                        Some(bp) => *bp,
                        None => continue,
                    };
                    let mut captured = args;
                    captured.resize(bp.arg_count, 0);
                    return self.deliver(DebugEvent::Breakpoint {
                        pid: SIMULATED_PID,
                        address,
                        kind: bp.kind,
                        args: captured,
                    });
                }
                Step::Idle => return Ok(Waited::Timeout),
                Step::Exit(exit_code) => {
                    self.running = false;
                    return self.deliver(DebugEvent::ProcessExited { pid: SIMULATED_PID, exit_code });
                }
                Step::Fail(reason) => return Err(Error::Adapter(reason)),
            }
        }
        // Script exhausted: the target idles until someone stops it.
        std::thread::sleep(timeout.min(Duration::from_millis(1)));
        Ok(Waited::Timeout)
    }

    fn resume(&mut self, _pid: Pid) -> Result<()> {
        if !self.halted {
            return Err(Error::Adapter("resume without a pending event".to_string()));
        }
        self.halted = false;
        self.resumes += 1;
        Ok(())
    }

    fn terminate(&mut self, _pid: Pid) -> Result<()> {
        self.terminated = true;
        self.running = false;
        self.halted = false;
        Ok(())
    }

    fn is_running(&self, _pid: Pid) -> bool {
        self.running && !self.terminated
    }
}
