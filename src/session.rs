//! Session orchestration: launch, event loop, guaranteed teardown.
//!
//! ```text
//! Starting -> Running -> Stopping -> Stopped
//!                \-> TimedOut -/
//! ```
//!
//! The loop is single-threaded and strictly alternates with the target:
//! each event is handled while the target is halted and the target is
//! resumed before the next wait, whatever the handler did. The only way out
//! of a wait is the bounded poll interval, which is where the deadline is
//! checked. Every exit path, including a fatal adapter error, terminates the
//! target.

use std::ops::{Deref, DerefMut};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use crate::classifier::{clsid_from_bytes, Classifier};
use crate::correlator::LoadCorrelator;
use crate::debugger::{DebugAdapter, DebugEvent, Pid, PointerWidth, Waited};
use crate::error::{Error, Result};
use crate::extractor::{ObjectStore, StreamExtractor, DEFAULT_MAX_OBJECT_SIZE};
use crate::hooks::{HookKind, HookRegistry};
use crate::result::{verdict_for, SessionReport, StopReason};

/// Settings for one analysis run.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Office application to launch.
    pub executable: PathBuf,
    /// Document passed to the application.
    pub document: PathBuf,
    /// Wall-clock budget for the whole run.
    pub timeout: Duration,
    /// Longest single wait for a debug event.
    pub poll_interval: Duration,
    /// Where recovered objects are saved; `None` disables saving.
    pub output_dir: Option<PathBuf>,
    /// Objects declaring a larger size are abandoned.
    pub max_object_size: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            executable: PathBuf::new(),
            document: PathBuf::new(),
            timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(1000),
            output_dir: Some(PathBuf::from(".")),
            max_object_size: DEFAULT_MAX_OBJECT_SIZE,
        }
    }
}

impl SessionConfig {
    pub fn new(executable: impl Into<PathBuf>, document: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            document: document.into(),
            ..Self::default()
        }
    }
}

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Starting,
    Running,
    TimedOut,
    Stopping,
    Stopped,
}

/// Target halted on an event. Dropping it resumes the target, so an early
/// return from a handler cannot leave the target suspended.
struct Halted<'a, A: DebugAdapter + ?Sized> {
    adapter: &'a mut A,
    pid: Pid,
    resumed: bool,
}

impl<'a, A: DebugAdapter + ?Sized> Halted<'a, A> {
    fn new(adapter: &'a mut A, pid: Pid) -> Self {
        Self { adapter, pid, resumed: false }
    }

    fn resume(mut self) -> Result<()> {
        self.resumed = true;
        self.adapter.resume(self.pid)
    }
}

impl<A: DebugAdapter + ?Sized> Deref for Halted<'_, A> {
    type Target = A;

    fn deref(&self) -> &A {
        self.adapter
    }
}

impl<A: DebugAdapter + ?Sized> DerefMut for Halted<'_, A> {
    fn deref_mut(&mut self) -> &mut A {
        self.adapter
    }
}

impl<A: DebugAdapter + ?Sized> Drop for Halted<'_, A> {
    fn drop(&mut self) {
        if !self.resumed {
            if let Err(e) = self.adapter.resume(self.pid) {
                error!("Failed to resume target {}: {}", self.pid, e);
            }
        }
    }
}

/// Handlers and per-session state, kept apart from the adapter so both can
/// be borrowed while an event is dispatched.
#[derive(Debug, Default)]
struct Engine {
    registry: HookRegistry,
    extractor: StreamExtractor,
    classifier: Classifier,
    correlator: LoadCorrelator,
    unresolved: Vec<String>,
    failed_extractions: usize,
}

fn arg(args: &[u64], index: usize, kind: HookKind) -> Result<u64> {
    args.get(index).copied().ok_or_else(|| {
        Error::Adapter(format!("{:?} hook delivered {} arguments", kind, args.len()))
    })
}

impl Engine {
    fn dispatch<A: DebugAdapter + ?Sized>(&mut self, adapter: &mut A, event: DebugEvent) -> Result<()> {
        match event {
            DebugEvent::ModuleLoaded { pid, module } => {
                let installation = self.registry.install(adapter, pid, &module)?;
                for err in installation.unresolved {
                    if let Error::Resolution { module, function } = err {
                        self.unresolved.push(format!("{}!{}", module, function));
                    }
                }
            }
            DebugEvent::Breakpoint { pid, kind, args, .. } => match kind {
                HookKind::ObjectLoad => {
                    self.correlator.on_object_load(arg(&args, 0, kind)?);
                }
                HookKind::DataConversion => {
                    let stream = arg(&args, 0, kind)?;
                    let storage = arg(&args, 1, kind)?;
                    self.on_data_conversion(adapter, pid, stream, storage)?;
                }
                HookKind::GuidConversion => {
                    let clsid = arg(&args, 0, kind)?;
                    self.on_guid_conversion(adapter, pid, clsid)?;
                }
            },
            DebugEvent::ProcessExited { pid, exit_code } => {
                info!("Target {} exited with code {}", pid, exit_code);
            }
            DebugEvent::Other { .. } => {}
        }
        Ok(())
    }

    fn on_data_conversion<A: DebugAdapter + ?Sized>(
        &mut self,
        adapter: &mut A,
        pid: Pid,
        stream: u64,
        storage: u64,
    ) -> Result<()> {
        match self.extractor.extract(adapter, pid, stream, storage) {
            Ok(object) => self.correlator.track(object),
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                self.failed_extractions += 1;
                warn!("Abandoned object for storage {:#010x}: {}", storage, e);
            }
        }
        Ok(())
    }

    fn on_guid_conversion<A: DebugAdapter + ?Sized>(
        &mut self,
        adapter: &mut A,
        pid: Pid,
        clsid_ptr: u64,
    ) -> Result<()> {
        // Also called from unrelated code paths; only a pending load matters.
        let handle = match self.correlator.on_guid_conversion() {
            Ok(h) => h,
            Err(_) => return Ok(()),
        };
        let id = match adapter.read_memory(pid, clsid_ptr, 16) {
            Ok(bytes) => clsid_from_bytes(&bytes),
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!("Could not read class id for storage {:#010x}: {}", handle, e);
                return Ok(());
            }
        };
        let id = match id {
            Some(id) => id,
            None => {
                warn!("Short class id read for storage {:#010x}", handle);
                return Ok(());
            }
        };
        let object = self.correlator.object_mut(handle);
        if object.is_none() {
            debug!("No native data was extracted for storage {:#010x}", handle);
        }
        self.classifier.apply(id, object);
        Ok(())
    }
}

/// One analysis run against one document.
pub struct Session<A: DebugAdapter> {
    adapter: A,
    config: SessionConfig,
    engine: Engine,
    state: SessionState,
    history: Vec<SessionState>,
    pid: Option<Pid>,
}

impl<A: DebugAdapter> Session<A> {
    pub fn new(adapter: A, config: SessionConfig) -> Self {
        let store = config.output_dir.clone().map(ObjectStore::new);
        let engine = Engine {
            extractor: StreamExtractor::new(store, config.max_object_size),
            ..Engine::default()
        };
        Self {
            adapter,
            config,
            engine,
            state: SessionState::Starting,
            history: vec![SessionState::Starting],
            pid: None,
        }
    }

    pub fn with_classifier(mut self, classifier: Classifier) -> Self {
        self.engine.classifier = classifier;
        self
    }

    pub fn with_registry(mut self, registry: HookRegistry) -> Self {
        self.engine.registry = registry;
        self
    }

    pub fn adapter(&self) -> &A {
        &self.adapter
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Every state visited so far, in order.
    pub fn history(&self) -> &[SessionState] {
        &self.history
    }

    pub fn correlator(&self) -> &LoadCorrelator {
        &self.engine.correlator
    }

    /// Run the session to completion. Can be called once.
    ///
    /// Returns the report when the target exited or the deadline passed.
    /// Launch failures, unsupported targets and adapter failures are
    /// returned as errors, after the target has been terminated.
    pub fn run(&mut self) -> Result<SessionReport> {
        if self.state != SessionState::Starting {
            return Err(Error::Adapter("session already ran".to_string()));
        }
        let deadline = Instant::now() + self.config.timeout;

        let document = self.config.document.as_path();
        let pid = match self.adapter.launch(&self.config.executable, &[document]) {
            Ok(pid) => pid,
            Err(e) => {
                error!("Could not run Office application, check it is 32-bit: {}", e);
                self.enter(SessionState::Stopped);
                return Err(e);
            }
        };
        self.pid = Some(pid);
        info!(
            "Started {} (pid {}) on {}",
            self.config.executable.display(),
            pid,
            self.config.document.display()
        );

        let width = self.adapter.pointer_width(pid);
        if width != PointerWidth::Bits32 {
            let e = Error::UnsupportedPointerWidth(width);
            error!("{}", e);
            self.stop(pid);
            return Err(e);
        }

        self.enter(SessionState::Running);
        let outcome = self.event_loop(pid, deadline);
        if let Err(e) = &outcome {
            error!("Analysis aborted: {}", e);
        }
        self.stop(pid);
        let stop_reason = outcome?;
        Ok(self.report(stop_reason))
    }

    fn event_loop(&mut self, pid: Pid, deadline: Instant) -> Result<StopReason> {
        loop {
            let now = Instant::now();
            if now >= deadline {
                info!(
                    "Deadline of {}s reached, stopping with partial results",
                    self.config.timeout.as_secs_f32()
                );
                self.enter(SessionState::TimedOut);
                return Ok(StopReason::DeadlineExpired);
            }
            if !self.adapter.is_running(pid) {
                return Ok(StopReason::TargetExited);
            }

            let wait = self.config.poll_interval.min(deadline - now);
            let event = match self.adapter.wait(wait)? {
                Waited::Event(event) => event,
                Waited::Timeout => continue,
            };
            let exited = matches!(event, DebugEvent::ProcessExited { pid: p, .. } if p == pid);

            let mut target = Halted::new(&mut self.adapter, event.pid());
            self.engine.dispatch(&mut *target, event)?;
            target.resume()?;

            if exited {
                return Ok(StopReason::TargetExited);
            }
        }
    }

    fn stop(&mut self, pid: Pid) {
        self.enter(SessionState::Stopping);
        if let Err(e) = self.adapter.terminate(pid) {
            error!("Failed to terminate target {}: {}", pid, e);
        }
        self.pid = None;
        self.enter(SessionState::Stopped);
    }

    fn enter(&mut self, state: SessionState) {
        debug!("Session {:?} -> {:?}", self.state, state);
        self.state = state;
        self.history.push(state);
    }

    fn report(&mut self, stop_reason: StopReason) -> SessionReport {
        let correlator = std::mem::take(&mut self.engine.correlator);
        let anomalies = correlator.anomalies();
        let objects = correlator.into_objects();
        SessionReport {
            document: self.config.document.clone(),
            verdict: verdict_for(&objects),
            stop_reason,
            objects,
            unresolved_hooks: std::mem::take(&mut self.engine.unresolved),
            anomalies,
            failed_extractions: self.engine.failed_extractions,
        }
    }
}

impl<A: DebugAdapter> Drop for Session<A> {
    fn drop(&mut self) {
        if let Some(pid) = self.pid.take() {
            let _ = self.adapter.terminate(pid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debugger::SimulatedTarget;

    const OLE32: u64 = 0x7500_0000;

    fn ole32(sim: SimulatedTarget) -> SimulatedTarget {
        sim.with_module(
            "ole32.dll",
            OLE32,
            &[
                ("OleLoad", OLE32 + 0x100),
                ("OleConvertOLESTREAMToIStorage", OLE32 + 0x200),
                ("OleGetAutoConvert", OLE32 + 0x300),
            ],
        )
    }

    fn config() -> SessionConfig {
        SessionConfig {
            timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(5),
            output_dir: None,
            ..SessionConfig::new("winword.exe", "sample.rtf")
        }
    }

    #[test]
    fn every_event_is_resumed() {
        let sim = ole32(SimulatedTarget::new())
            .load("ole32.dll")
            .idle(3)
            .call("ole32.dll", "OleLoad", &[0x1000, 0, 0, 0])
            .call("ole32.dll", "OleGetAutoConvert", &[0xdead, 0])
            .exit(0);
        let mut session = Session::new(sim, config());
        let report = session.run().unwrap();
        assert_eq!(report.stop_reason, StopReason::TargetExited);
        let sim = session.adapter();
        assert_eq!(sim.events_delivered(), 4);
        assert_eq!(sim.resume_count(), 4);
        assert!(sim.is_terminated());
    }

    #[test]
    fn unreadable_clsid_is_local() {
        let sim = ole32(SimulatedTarget::new())
            .load("ole32.dll")
            .call("ole32.dll", "OleLoad", &[0x1000, 0, 0, 0])
            .call("ole32.dll", "OleGetAutoConvert", &[0xdead, 0])
            .exit(0);
        let mut session = Session::new(sim, config());
        let report = session.run().unwrap();
        assert!(report.objects.is_empty());
        assert!(session.correlator().pending().is_none());
    }

    #[test]
    fn running_twice_is_rejected() {
        let sim = ole32(SimulatedTarget::new()).exit(0);
        let mut session = Session::new(sim, config());
        session.run().unwrap();
        assert!(session.run().is_err());
    }

    #[test]
    fn halted_guard_resumes_on_drop() {
        let sim = ole32(SimulatedTarget::new()).load("ole32.dll");
        let mut sim = sim;
        let pid = sim.launch(std::path::Path::new("winword.exe"), &[]).unwrap();
        sim.wait(Duration::from_millis(1)).unwrap();
        {
            let _halted = Halted::new(&mut sim, pid);
        }
        assert_eq!(sim.resume_count(), 1);
    }
}
