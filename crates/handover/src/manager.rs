//! Top-level control loop: reload and shutdown protocols.

use std::fmt;
use std::path::PathBuf;

use nix::sys::signal::Signal;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::config::ConfigSource;
use crate::error::{ProcessError, SupervisorError, SupervisorResult};
use crate::launcher::Launcher;
use crate::listen::Listeners;
use crate::process::{ProcessEvent, ProcessHandle, ProcessState};
use crate::readiness::{AckKind, ReadinessAck};
use crate::set::ProcessSet;
use crate::signals::{Action, SignalPlan};
use crate::status::Status;
use crate::trampoline::Trampoline;

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ManagerState {
    /// Waiting for the first generation to become operational.
    Starting,
    Running,
    Stopping,
}

impl fmt::Display for ManagerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ManagerState::Starting => f.write_str("starting"),
            ManagerState::Running => f.write_str("running"),
            ManagerState::Stopping => f.write_str("stopping"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ManagerOptions {
    pub signals: SignalPlan,
    pub status_file: Option<PathBuf>,
}

/// Owns the listeners, the process set and the generation pointers.
pub struct Manager {
    source: ConfigSource,
    listeners: Listeners,
    launcher: Launcher,
    set: ProcessSet,
    events: mpsc::Receiver<ProcessEvent>,
    options: ManagerOptions,
    state: watch::Sender<ManagerState>,
    generation: u64,
    /// The generation serving traffic.
    current: Option<ProcessHandle>,
    /// The generation being started. At most one at a time.
    pending: Option<ProcessHandle>,
    last_error: Option<SupervisorError>,
}

impl Manager {
    pub fn new(
        source: ConfigSource,
        listeners: Listeners,
        trampoline: Trampoline,
        options: ManagerOptions,
    ) -> Self {
        let set = ProcessSet::new();
        let (events_tx, events) = mpsc::channel(EVENT_CAPACITY);
        Self {
            source,
            listeners,
            launcher: Launcher::new(trampoline, events_tx, set.clone()),
            set,
            events,
            options,
            state: watch::Sender::new(ManagerState::Starting),
            generation: 0,
            current: None,
            pending: None,
            last_error: None,
        }
    }

    pub fn state(&self) -> watch::Receiver<ManagerState> {
        self.state.subscribe()
    }

    pub fn processes(&self) -> ProcessSet {
        self.set.clone()
    }

    /// Launch the first generation and dispatch until shut down.
    ///
    /// Returns the last fatal error recorded while running, if any.
    pub async fn run(
        mut self,
        mut signals: mpsc::Receiver<Signal>,
        mut acks: mpsc::Receiver<ReadinessAck>,
    ) -> SupervisorResult<()> {
        if let Err(e) = self.start_generation() {
            self.state.send_replace(ManagerState::Stopping);
            std::mem::take(&mut self.listeners).release();
            return Err(e);
        }
        self.write_status();

        let set = self.set.clone();
        loop {
            // Signals first: a terminal signal that also reached the process
            // group must be seen before the deaths it caused.
            tokio::select! {
                biased;
                Some(signal) = signals.recv() => self.on_signal(signal),
                Some(ack) = acks.recv() => self.on_ack(ack),
                Some(event) = self.events.recv() => self.on_event(event),
                () = set.wait_empty(), if self.stopping() => break,
                else => break,
            }
            self.write_status();
        }
        self.write_status();

        std::mem::take(&mut self.listeners).release();
        info!(generation = self.generation, "supervisor stopped");
        match self.last_error.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn stopping(&self) -> bool {
        *self.state.borrow() == ManagerState::Stopping
    }

    fn start_generation(&mut self) -> SupervisorResult<()> {
        let config = self.source.load()?;
        let generation = self.generation + 1;
        let handle = self.launcher.launch(config, &self.listeners, generation)?;
        self.generation = generation;
        self.pending = Some(handle);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Inputs
    // -----------------------------------------------------------------------

    fn on_signal(&mut self, signal: Signal) {
        match self.options.signals.classify(signal) {
            Action::Reload => self.reload(),
            Action::Shutdown => {
                info!(%signal, "received terminal signal");
                self.begin_shutdown();
            }
            Action::Ready => self.on_ack(ReadinessAck {
                pid: None,
                kind: AckKind::Ready,
            }),
            Action::Forward => {
                let count = self.set.each(|_| true, |p| p.signal(signal));
                debug!(%signal, processes = count, "forwarded signal");
            }
        }
    }

    fn reload(&mut self) {
        let state = *self.state.borrow();
        if state != ManagerState::Running {
            warn!(%state, "reload ignored: supervisor is not running");
            return;
        }
        if let Some(pending) = &self.pending {
            warn!(
                pid = %pending.pid(),
                generation = pending.generation(),
                "reload ignored: a generation is already starting"
            );
            return;
        }

        match self.start_generation() {
            Ok(()) => info!(generation = self.generation, "reload started"),
            Err(e) => {
                error!(error = %e, generation = self.generation, "reload failed, keeping current generation");
                self.last_error = Some(e);
            }
        }
    }

    fn on_ack(&mut self, ack: ReadinessAck) {
        let by_pid = ack.pid.and_then(|pid| self.set.get(pid));
        let target = match ack.kind {
            AckKind::Ready => by_pid.or_else(|| self.pending.clone()),
            AckKind::Stopping => by_pid,
        };
        match (target, ack.kind) {
            (Some(process), AckKind::Ready) => process.ready(),
            (Some(process), AckKind::Stopping) => process.yielded(),
            (None, kind) => debug!(pid = ack.pid.map(|p| p.as_raw()), ?kind, "acknowledgement matched no process"),
        }
    }

    fn on_event(&mut self, event: ProcessEvent) {
        match event.error.as_ref().filter(|e| e.is_fatal()) {
            Some(ProcessError::UnexpectedExit(status)) if self.stopping() => {
                debug!(pid = %event.pid, %status, "process exited during shutdown");
            }
            Some(e) => {
                self.last_error = Some(SupervisorError::Process {
                    pid: event.pid.as_raw(),
                    generation: event.generation,
                    source: e.clone(),
                });
            }
            None => {}
        }

        let is_pending = self.pending.as_ref().is_some_and(|p| p.pid() == event.pid);
        let is_current = self.current.as_ref().is_some_and(|p| p.pid() == event.pid);

        match event.to {
            ProcessState::Operational if is_pending => self.promote(),
            ProcessState::Yielding | ProcessState::Yielded | ProcessState::Stopping | ProcessState::Gone
                if is_pending =>
            {
                self.pending = None;
                match &self.current {
                    Some(current) => warn!(
                        generation = event.generation,
                        current = current.generation(),
                        "generation failed to start, keeping current generation"
                    ),
                    None => {
                        error!(generation = event.generation, "first generation failed to start");
                        self.begin_shutdown();
                    }
                }
            }
            ProcessState::Gone if is_current => {
                self.current = None;
                if !self.stopping() {
                    error!(
                        pid = %event.pid,
                        generation = event.generation,
                        "current process exited, shutting down"
                    );
                    self.begin_shutdown();
                }
            }
            _ => {}
        }
    }

    // -----------------------------------------------------------------------
    // Protocols
    // -----------------------------------------------------------------------

    /// The pending generation is operational: make it current and retire
    /// every older generation.
    ///
    /// `current` is the one authoritative operational process. A retired
    /// process may still report `Operational` until its actor handles the
    /// queued `Retire`, but it is never routed to as current again.
    fn promote(&mut self) {
        let Some(process) = self.pending.take() else {
            return;
        };
        let generation = process.generation();
        self.current = Some(process);

        if self.stopping() {
            return;
        }
        if *self.state.borrow() == ManagerState::Starting {
            self.state.send_replace(ManagerState::Running);
            info!(generation, "supervisor running");
        }
        let retired = self
            .set
            .each(|p| p.generation() < generation, ProcessHandle::retire);
        info!(generation, retired, "generation is now current");
    }

    fn begin_shutdown(&mut self) {
        if self.stopping() {
            return;
        }
        self.state.send_replace(ManagerState::Stopping);
        let count = self.set.each(|_| true, ProcessHandle::shutdown);
        info!(processes = count, "shutting down");
    }

    fn write_status(&self) {
        let Some(path) = &self.options.status_file else {
            return;
        };
        let status = Status::new(
            *self.state.borrow(),
            self.generation,
            self.current.as_ref().map(|p| p.pid().as_raw()),
            self.set.snapshot(),
        );
        if let Err(e) = status.write(path) {
            warn!(path = %path.display(), error = %e, "could not write status file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use crate::config::ProcessConfig;

    fn manager(program: &str, status_file: Option<PathBuf>) -> Manager {
        let base = ProcessConfig {
            program: program.into(),
            ..ProcessConfig::default()
        };
        Manager::new(
            ConfigSource::new(base, None),
            Listeners::default(),
            Trampoline::Shell,
            ManagerOptions {
                signals: SignalPlan::default(),
                status_file,
            },
        )
    }

    #[tokio::test]
    async fn launch_failure_is_returned_immediately() {
        let manager = manager("no-such-program-for-handover", None);
        let state = manager.state();
        let (_sig_tx, sig_rx) = mpsc::channel(1);
        let (_ack_tx, ack_rx) = mpsc::channel(1);

        let err = tokio::time::timeout(Duration::from_secs(5), manager.run(sig_rx, ack_rx))
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, SupervisorError::Launch(_)));
        assert_eq!(*state.borrow(), ManagerState::Stopping);
    }

    #[tokio::test]
    async fn exit_of_first_generation_ends_supervisor_with_error() {
        let dir = tempfile::tempdir().unwrap();
        let status_file = dir.path().join("status.json");
        let manager = manager("true", Some(status_file.clone()));
        let (_sig_tx, sig_rx) = mpsc::channel(1);
        let (_ack_tx, ack_rx) = mpsc::channel(1);

        let err = tokio::time::timeout(Duration::from_secs(5), manager.run(sig_rx, ack_rx))
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, SupervisorError::Process { generation: 1, .. }));

        let status: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&status_file).unwrap()).unwrap();
        assert_eq!(status["state"], "stopping");
        assert_eq!(status["processes"].as_array().unwrap().len(), 0);
    }

    #[test]
    fn manager_state_is_ordered() {
        assert!(ManagerState::Starting < ManagerState::Running);
        assert!(ManagerState::Running < ManagerState::Stopping);
        assert_eq!(ManagerState::Running.to_string(), "running");
    }
}
