//! Per-process lifecycle state machine.
//!
//! Every launched process is driven by its own actor task. The actor is the
//! only writer of the process state: commands from the manager, the exit
//! notification from the death watch and the start/stop deadlines are all
//! serialized through one `select!` loop.

use std::fmt;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use serde::Serialize;
use tokio::process::Child;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::ProcessConfig;
use crate::error::ProcessError;
use crate::set::ProcessSet;

/// How long to wait for the death watch after SIGKILL before giving up.
pub const KILL_CONFIRM_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound on flushing the output pipes once the process exited.
pub const LOG_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

const COMMAND_CAPACITY: usize = 32;

// ---------------------------------------------------------------------------
// States
// ---------------------------------------------------------------------------

/// Lifecycle states in their only permitted order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    Starting,
    Operational,
    Yielding,
    Yielded,
    Stopping,
    Gone,
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProcessState::Starting => "starting",
            ProcessState::Operational => "operational",
            ProcessState::Yielding => "yielding",
            ProcessState::Yielded => "yielded",
            ProcessState::Stopping => "stopping",
            ProcessState::Gone => "gone",
        };
        f.write_str(s)
    }
}

/// Monotonic state holder. Moves may only go rightward or stay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lifecycle {
    state: ProcessState,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            state: ProcessState::Starting,
        }
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    /// Move to `to`, returning the previous state, or the current state as
    /// the error when the move would go backwards.
    pub fn advance(&mut self, to: ProcessState) -> Result<ProcessState, ProcessState> {
        if to < self.state {
            return Err(self.state);
        }
        let from = self.state;
        self.state = to;
        Ok(from)
    }
}

// ---------------------------------------------------------------------------
// Events and commands
// ---------------------------------------------------------------------------

/// A state transition, reported to the manager.
#[derive(Debug, Clone)]
pub struct ProcessEvent {
    pub pid: Pid,
    pub generation: u64,
    pub from: ProcessState,
    pub to: ProcessState,
    pub error: Option<ProcessError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessCommand {
    /// Readiness acknowledged.
    Ready,
    /// The process reported it finished draining.
    Yielded,
    /// Superseded by a newer generation.
    Retire,
    /// Terminate.
    Shutdown,
    /// Forward an unclaimed signal.
    Signal(Signal),
}

/// Manager-side handle to a process actor.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pid: Pid,
    generation: u64,
    commands: mpsc::Sender<ProcessCommand>,
    state: watch::Receiver<ProcessState>,
}

impl ProcessHandle {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn state(&self) -> ProcessState {
        *self.state.borrow()
    }

    pub fn ready(&self) {
        self.send(ProcessCommand::Ready);
    }

    pub fn yielded(&self) {
        self.send(ProcessCommand::Yielded);
    }

    pub fn retire(&self) {
        self.send(ProcessCommand::Retire);
    }

    pub fn shutdown(&self) {
        self.send(ProcessCommand::Shutdown);
    }

    pub fn signal(&self, signal: Signal) {
        self.send(ProcessCommand::Signal(signal));
    }

    /// Resolve once the state reaches at least `target`.
    pub async fn reached(&self, target: ProcessState) -> ProcessState {
        let mut rx = self.state.clone();
        let reached = rx.wait_for(|s| *s >= target).await.map(|s| *s);
        reached.unwrap_or_else(|_| *rx.borrow())
    }

    fn send(&self, command: ProcessCommand) {
        match self.commands.try_send(command) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(command)) => {
                warn!(pid = %self.pid, ?command, "process command queue full, dropping command");
            }
            Err(mpsc::error::TrySendError::Closed(command)) => {
                debug!(pid = %self.pid, ?command, "process already gone");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

/// Outcome reported by the death watch.
pub type ExitResult = Result<ExitStatus, String>;

/// Wait for `child` to exit in the background.
pub fn watch_exit(mut child: Child) -> oneshot::Receiver<ExitResult> {
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        let result = child.wait().await.map_err(|e| e.to_string());
        let _ = tx.send(result);
    });
    rx
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Deadline {
    Start,
    Yield,
    Stop,
    Kill,
}

/// Everything an actor needs besides the channels it creates itself.
pub(crate) struct Spawned {
    pub pid: Pid,
    pub generation: u64,
    pub config: Arc<ProcessConfig>,
    pub died: oneshot::Receiver<ExitResult>,
    pub logs: Vec<JoinHandle<()>>,
}

/// Register a launched process in `set` and start its actor.
pub(crate) fn start(
    spawned: Spawned,
    events: mpsc::Sender<ProcessEvent>,
    set: ProcessSet,
) -> ProcessHandle {
    let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
    let (state_tx, state_rx) = watch::channel(ProcessState::Starting);
    let handle = ProcessHandle {
        pid: spawned.pid,
        generation: spawned.generation,
        commands: command_tx,
        state: state_rx,
    };
    set.add(handle.clone());

    let actor = Actor {
        pid: spawned.pid,
        generation: spawned.generation,
        config: spawned.config,
        lifecycle: Lifecycle::new(),
        state: state_tx,
        commands: command_rx,
        died: spawned.died,
        logs: spawned.logs,
        events,
        set,
        deadline: None,
    };
    tokio::spawn(actor.run());
    handle
}

struct Actor {
    pid: Pid,
    generation: u64,
    config: Arc<ProcessConfig>,
    lifecycle: Lifecycle,
    state: watch::Sender<ProcessState>,
    commands: mpsc::Receiver<ProcessCommand>,
    died: oneshot::Receiver<ExitResult>,
    logs: Vec<JoinHandle<()>>,
    events: mpsc::Sender<ProcessEvent>,
    set: ProcessSet,
    deadline: Option<(Instant, Deadline)>,
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

impl Actor {
    async fn run(mut self) {
        self.on_start().await;

        loop {
            let timer = sleep_until(self.deadline.map(|(at, _)| at));
            tokio::select! {
                exit = &mut self.died => {
                    let exit = exit.unwrap_or_else(|_| Err("death watch dropped".into()));
                    self.on_exit(exit).await;
                    return;
                }
                Some(command) = self.commands.recv() => self.on_command(command).await,
                () = timer => {
                    if let Some((_, deadline)) = self.deadline.take() {
                        self.on_deadline(deadline).await;
                    }
                }
            }
            if self.lifecycle.state() == ProcessState::Gone {
                return;
            }
        }
    }

    async fn on_start(&mut self) {
        match (self.config.start_timeout, self.config.awaits_readiness()) {
            (None, false) => self.transition(ProcessState::Operational, None).await,
            (None, true) => debug!(pid = %self.pid, "waiting for readiness"),
            (Some(timeout), _) => self.arm(timeout, Deadline::Start),
        }
    }

    async fn on_command(&mut self, command: ProcessCommand) {
        let state = self.lifecycle.state();
        match command {
            ProcessCommand::Ready if state == ProcessState::Starting => {
                self.deadline = None;
                self.transition(ProcessState::Operational, None).await;
            }
            ProcessCommand::Ready => debug!(pid = %self.pid, %state, "ignoring readiness"),
            ProcessCommand::Yielded if state == ProcessState::Yielding => {
                self.transition(ProcessState::Yielded, None).await;
                self.stop(None).await;
            }
            ProcessCommand::Yielded => debug!(pid = %self.pid, %state, "ignoring yielded"),
            ProcessCommand::Retire => self.retire().await,
            ProcessCommand::Shutdown => self.stop(None).await,
            ProcessCommand::Signal(signal) => self.send_signal(signal),
        }
    }

    async fn on_deadline(&mut self, deadline: Deadline) {
        let state = self.lifecycle.state();
        match deadline {
            Deadline::Start if state == ProcessState::Starting => {
                if self.config.awaits_readiness() {
                    let timeout = self.config.start_timeout.unwrap_or_default();
                    self.stop(Some(ProcessError::StartTimeout(timeout))).await;
                } else {
                    self.transition(ProcessState::Operational, None).await;
                }
            }
            Deadline::Yield if state == ProcessState::Yielding => {
                info!(pid = %self.pid, "yield period over, stopping");
                self.stop(None).await;
            }
            Deadline::Stop if state == ProcessState::Stopping => {
                let timeout = self.config.stop_timeout.unwrap_or_default();
                self.send_signal(Signal::SIGKILL);
                self.transition(ProcessState::Stopping, Some(ProcessError::StopTimeout(timeout)))
                    .await;
                self.arm(KILL_CONFIRM_TIMEOUT, Deadline::Kill);
            }
            Deadline::Kill => {
                self.finish(Some(ProcessError::KillTimeout(KILL_CONFIRM_TIMEOUT)))
                    .await;
            }
            _ => {}
        }
    }

    async fn on_exit(&mut self, exit: ExitResult) {
        let error = match exit {
            Ok(status) if self.lifecycle.state() < ProcessState::Yielding => {
                Some(ProcessError::UnexpectedExit(status))
            }
            Ok(status) => {
                info!(pid = %self.pid, generation = self.generation, %status, "process exited");
                None
            }
            Err(e) => Some(ProcessError::Wait(e)),
        };
        self.finish(error).await;
    }

    async fn retire(&mut self) {
        match (self.lifecycle.state(), self.config.yield_signal) {
            (ProcessState::Operational, Some(signal)) => {
                self.send_signal(signal);
                self.transition(ProcessState::Yielding, None).await;
                if let Some(timeout) = self.config.stop_timeout {
                    self.arm(timeout, Deadline::Yield);
                }
            }
            (ProcessState::Yielding | ProcessState::Yielded, _) => {}
            _ => self.stop(None).await,
        }
    }

    async fn stop(&mut self, error: Option<ProcessError>) {
        if self.lifecycle.state() >= ProcessState::Stopping {
            return;
        }
        self.send_signal(Signal::SIGTERM);
        self.transition(ProcessState::Stopping, error).await;
        self.deadline = None;
        if let Some(timeout) = self.config.stop_timeout {
            self.arm(timeout, Deadline::Stop);
        }
    }

    /// Drain the output pipes, report `Gone` and leave the set.
    ///
    /// The `Gone` event is queued before the pid leaves the set, so once the
    /// set is empty the manager has every terminal event in its queue.
    async fn finish(&mut self, error: Option<ProcessError>) {
        let mut logs = std::mem::take(&mut self.logs);
        let drained = tokio::time::timeout(LOG_DRAIN_TIMEOUT, async {
            for handle in logs.iter_mut() {
                let _ = handle.await;
            }
        })
        .await;
        if drained.is_err() {
            warn!(pid = %self.pid, "output still open after exit, detaching");
            logs.iter().for_each(JoinHandle::abort);
        }

        self.deadline = None;
        self.transition(ProcessState::Gone, error).await;
        self.set.remove(self.pid);
    }

    fn arm(&mut self, after: Duration, deadline: Deadline) {
        self.deadline = Some((Instant::now() + after, deadline));
    }

    fn send_signal(&self, signal: Signal) {
        if self.lifecycle.state() == ProcessState::Gone {
            return;
        }
        if let Err(errno) = kill(self.pid, signal) {
            let error = ProcessError::Signal { signal, errno };
            warn!(pid = %self.pid, generation = self.generation, %error, "signal delivery failed");
        }
    }

    async fn transition(&mut self, to: ProcessState, error: Option<ProcessError>) {
        let from = match self.lifecycle.advance(to) {
            Ok(from) => from,
            Err(current) => {
                debug!(pid = %self.pid, %current, %to, "rejected backwards transition");
                return;
            }
        };
        self.state.send_replace(to);

        match &error {
            Some(e) => warn!(
                pid = %self.pid,
                generation = self.generation,
                %from,
                %to,
                error = %e,
                "process state changed"
            ),
            None => info!(
                pid = %self.pid,
                generation = self.generation,
                %from,
                %to,
                "process state changed"
            ),
        }

        let event = ProcessEvent {
            pid: self.pid,
            generation: self.generation,
            from,
            to,
            error,
        };
        if self.events.send(event).await.is_err() {
            debug!(pid = %self.pid, "manager no longer listening for events");
        }
    }
}

/// A handle with no actor behind it, for exercising the set.
#[cfg(test)]
pub(crate) fn detached(
    pid: i32,
    generation: u64,
    state: ProcessState,
) -> (ProcessHandle, mpsc::Receiver<ProcessCommand>) {
    let (commands, rx) = mpsc::channel(COMMAND_CAPACITY);
    let (_, state) = watch::channel(state);
    let handle = ProcessHandle {
        pid: Pid::from_raw(pid),
        generation,
        commands,
        state,
    };
    (handle, rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::process::Stdio;

    use tokio::process::Command;

    #[test]
    fn states_are_ordered() {
        use ProcessState::*;
        let order = [Starting, Operational, Yielding, Yielded, Stopping, Gone];
        assert!(order.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn lifecycle_rejects_backwards_moves() {
        let mut lifecycle = Lifecycle::new();
        assert_eq!(
            lifecycle.advance(ProcessState::Operational),
            Ok(ProcessState::Starting)
        );
        assert_eq!(
            lifecycle.advance(ProcessState::Stopping),
            Ok(ProcessState::Operational)
        );
        assert_eq!(
            lifecycle.advance(ProcessState::Operational),
            Err(ProcessState::Stopping)
        );
        assert_eq!(lifecycle.state(), ProcessState::Stopping);
    }

    #[test]
    fn lifecycle_allows_self_transition() {
        let mut lifecycle = Lifecycle::new();
        lifecycle.advance(ProcessState::Stopping).unwrap();
        assert_eq!(
            lifecycle.advance(ProcessState::Stopping),
            Ok(ProcessState::Stopping)
        );
    }

    #[test]
    fn lifecycle_never_decreases() {
        use ProcessState::*;
        let all = [Starting, Operational, Yielding, Yielded, Stopping, Gone];
        for first in all {
            for second in all {
                let mut lifecycle = Lifecycle::new();
                let _ = lifecycle.advance(first);
                let before = lifecycle.state();
                let _ = lifecycle.advance(second);
                assert!(lifecycle.state() >= before);
            }
        }
    }

    #[test]
    fn state_display_is_lowercase() {
        assert_eq!(ProcessState::Operational.to_string(), "operational");
        assert_eq!(ProcessState::Gone.to_string(), "gone");
    }

    struct Harness {
        handle: ProcessHandle,
        events: mpsc::Receiver<ProcessEvent>,
        set: ProcessSet,
    }

    impl Harness {
        async fn next(&mut self) -> ProcessEvent {
            tokio::time::timeout(Duration::from_secs(10), self.events.recv())
                .await
                .unwrap()
                .unwrap()
        }

        async fn until(&mut self, to: ProcessState) -> Vec<ProcessEvent> {
            let mut seen = Vec::new();
            loop {
                let event = self.next().await;
                let done = event.to == to;
                seen.push(event);
                if done {
                    return seen;
                }
            }
        }

        async fn empty(&self) {
            tokio::time::timeout(Duration::from_secs(5), self.set.wait_empty())
                .await
                .unwrap();
        }
    }

    fn sh(script: &str, config: ProcessConfig) -> Harness {
        let child = Command::new("/bin/sh")
            .arg("-c")
            .arg(script)
            .stdin(Stdio::null())
            .spawn()
            .unwrap();
        let pid = Pid::from_raw(child.id().unwrap() as i32);
        let (events_tx, events) = mpsc::channel(64);
        let set = ProcessSet::new();
        let handle = start(
            Spawned {
                pid,
                generation: 1,
                config: Arc::new(config),
                died: watch_exit(child),
                logs: Vec::new(),
            },
            events_tx,
            set.clone(),
        );
        Harness {
            handle,
            events,
            set,
        }
    }

    const LOOP: &str = "trap 'exit 0' TERM; while :; do sleep 0.05; done";

    #[tokio::test]
    async fn promoted_immediately_without_readiness_or_timeout() {
        let mut h = sh(LOOP, ProcessConfig::default());
        let event = h.next().await;
        assert_eq!(event.from, ProcessState::Starting);
        assert_eq!(event.to, ProcessState::Operational);
        assert!(event.error.is_none());
        assert_eq!(h.set.len(), 1);

        h.handle.shutdown();
        h.until(ProcessState::Gone).await;
    }

    #[tokio::test]
    async fn ready_ack_promotes_and_repeats_are_ignored() {
        let config = ProcessConfig {
            ready_signal: Some(Signal::SIGUSR1),
            ..ProcessConfig::default()
        };
        let mut h = sh(LOOP, config);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.handle.state(), ProcessState::Starting);

        h.handle.ready();
        h.handle.ready();
        assert_eq!(h.next().await.to, ProcessState::Operational);

        h.handle.shutdown();
        let event = h.next().await;
        assert_eq!(event.from, ProcessState::Operational);
        assert_eq!(event.to, ProcessState::Stopping);
        h.until(ProcessState::Gone).await;
    }

    #[tokio::test]
    async fn start_timeout_with_readiness_channel_stops_process() {
        let config = ProcessConfig {
            ready_signal: Some(Signal::SIGUSR1),
            start_timeout: Some(Duration::from_millis(300)),
            ..ProcessConfig::default()
        };
        let started = std::time::Instant::now();
        let mut h = sh(LOOP, config);

        let event = h.next().await;
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert_eq!(event.to, ProcessState::Stopping);
        assert!(matches!(event.error, Some(ProcessError::StartTimeout(_))));

        let events = h.until(ProcessState::Gone).await;
        assert!(events.last().unwrap().error.is_none());
        h.empty().await;
    }

    #[tokio::test]
    async fn start_timeout_without_readiness_channel_promotes() {
        let config = ProcessConfig {
            start_timeout: Some(Duration::from_millis(200)),
            ..ProcessConfig::default()
        };
        let mut h = sh(LOOP, config);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.handle.state(), ProcessState::Starting);

        let event = h.next().await;
        assert_eq!(event.to, ProcessState::Operational);
        assert!(event.error.is_none());

        h.handle.shutdown();
        h.until(ProcessState::Gone).await;
    }

    #[tokio::test]
    async fn stop_timeout_escalates_to_kill() {
        let config = ProcessConfig {
            stop_timeout: Some(Duration::from_millis(200)),
            ..ProcessConfig::default()
        };
        let mut h = sh("trap '' TERM; exec sleep 30", config);
        assert_eq!(h.next().await.to, ProcessState::Operational);
        tokio::time::sleep(Duration::from_millis(100)).await;

        h.handle.shutdown();
        let events = h.until(ProcessState::Gone).await;
        let timed_out = events
            .iter()
            .find(|e| matches!(e.error, Some(ProcessError::StopTimeout(_))))
            .unwrap();
        assert_eq!(timed_out.from, ProcessState::Stopping);
        assert_eq!(timed_out.to, ProcessState::Stopping);
        h.empty().await;
    }

    #[tokio::test]
    async fn exit_while_operational_is_unexpected() {
        let mut h = sh("sleep 0.2; exit 3", ProcessConfig::default());
        assert_eq!(h.next().await.to, ProcessState::Operational);

        let event = h.next().await;
        assert_eq!(event.to, ProcessState::Gone);
        match event.error {
            Some(ProcessError::UnexpectedExit(status)) => assert_eq!(status.code(), Some(3)),
            other => panic!("unexpected error {other:?}"),
        }
        h.empty().await;
    }

    #[tokio::test]
    async fn retire_with_yield_signal_drains() {
        let config = ProcessConfig {
            yield_signal: Some(Signal::SIGUSR2),
            stop_timeout: Some(Duration::from_secs(5)),
            ..ProcessConfig::default()
        };
        let mut h = sh(
            "trap '' USR2; trap 'exit 0' TERM; while :; do sleep 0.05; done",
            config,
        );
        assert_eq!(h.next().await.to, ProcessState::Operational);
        tokio::time::sleep(Duration::from_millis(100)).await;

        h.handle.retire();
        assert_eq!(h.next().await.to, ProcessState::Yielding);
        h.handle.retire();
        h.handle.yielded();
        assert_eq!(h.next().await.to, ProcessState::Yielded);
        assert_eq!(h.next().await.to, ProcessState::Stopping);
        let gone = h.next().await;
        assert_eq!(gone.to, ProcessState::Gone);
        assert!(gone.error.is_none());
    }

    #[tokio::test]
    async fn yielded_process_stops_without_stop_timeout() {
        let config = ProcessConfig {
            yield_signal: Some(Signal::SIGUSR2),
            ..ProcessConfig::default()
        };
        let mut h = sh(
            "trap '' USR2; trap 'exit 0' TERM; while :; do sleep 0.05; done",
            config,
        );
        assert_eq!(h.next().await.to, ProcessState::Operational);
        tokio::time::sleep(Duration::from_millis(100)).await;

        h.handle.retire();
        assert_eq!(h.next().await.to, ProcessState::Yielding);
        h.handle.yielded();
        let events = h.until(ProcessState::Gone).await;
        let states: Vec<ProcessState> = events.iter().map(|e| e.to).collect();
        assert_eq!(
            states,
            [ProcessState::Yielded, ProcessState::Stopping, ProcessState::Gone]
        );
        assert!(events.iter().all(|e| e.error.is_none()));
        h.empty().await;
    }

    #[tokio::test]
    async fn retire_without_yield_signal_stops() {
        let mut h = sh(LOOP, ProcessConfig::default());
        assert_eq!(h.next().await.to, ProcessState::Operational);
        tokio::time::sleep(Duration::from_millis(100)).await;

        h.handle.retire();
        assert_eq!(h.next().await.to, ProcessState::Stopping);
        let gone = h.next().await;
        assert_eq!(gone.to, ProcessState::Gone);
        assert!(gone.error.is_none());
        assert_eq!(h.handle.reached(ProcessState::Gone).await, ProcessState::Gone);
    }
}
