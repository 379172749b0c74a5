//! Registry of live processes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use nix::unistd::Pid;
use serde::Serialize;
use tokio::sync::watch;

use crate::process::{ProcessHandle, ProcessState};

/// Point-in-time view of one registered process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessInfo {
    pub pid: i32,
    pub generation: u64,
    pub state: ProcessState,
}

/// Concurrency-safe set of live processes keyed by pid.
///
/// All access goes through one mutex. [`ProcessSet::each`] runs its action
/// after the lock is released, so an action may freely call back into the set.
#[derive(Debug, Clone)]
pub struct ProcessSet {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    processes: Mutex<HashMap<Pid, ProcessHandle>>,
    len: watch::Sender<usize>,
}

impl Default for ProcessSet {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessSet {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                processes: Mutex::new(HashMap::new()),
                len: watch::Sender::new(0),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Pid, ProcessHandle>> {
        self.inner
            .processes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a process. Returns false if the pid is already present.
    pub fn add(&self, handle: ProcessHandle) -> bool {
        let mut processes = self.lock();
        if processes.contains_key(&handle.pid()) {
            return false;
        }
        processes.insert(handle.pid(), handle);
        self.inner.len.send_replace(processes.len());
        true
    }

    pub fn remove(&self, pid: Pid) -> Option<ProcessHandle> {
        let mut processes = self.lock();
        let removed = processes.remove(&pid);
        self.inner.len.send_replace(processes.len());
        removed
    }

    pub fn get(&self, pid: Pid) -> Option<ProcessHandle> {
        self.lock().get(&pid).cloned()
    }

    /// Run `action` on every process matching `predicate`; returns how many
    /// matched.
    pub fn each<P, A>(&self, predicate: P, mut action: A) -> usize
    where
        P: Fn(&ProcessHandle) -> bool,
        A: FnMut(&ProcessHandle),
    {
        let matched: Vec<ProcessHandle> = self
            .lock()
            .values()
            .filter(|p| predicate(p))
            .cloned()
            .collect();
        matched.iter().for_each(&mut action);
        matched.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Registered processes ordered by generation.
    pub fn snapshot(&self) -> Vec<ProcessInfo> {
        let mut infos: Vec<ProcessInfo> = self
            .lock()
            .values()
            .map(|p| ProcessInfo {
                pid: p.pid().as_raw(),
                generation: p.generation(),
                state: p.state(),
            })
            .collect();
        infos.sort_by_key(|i| (i.generation, i.pid));
        infos
    }

    /// Resolve once no process is registered.
    pub async fn wait_empty(&self) {
        let mut rx = self.inner.len.subscribe();
        // The sender lives as long as `self`, so the channel stays open.
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}
