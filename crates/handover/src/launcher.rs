//! Spawning a generation.

use std::os::fd::RawFd;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use nix::unistd::{Gid, Group, Pid, Uid, User};
use socket_activation::LISTEN_FDS_START;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::ProcessConfig;
use crate::environment;
use crate::error::LaunchError;
use crate::listen::Listeners;
use crate::process::{self, ProcessEvent, ProcessHandle, Spawned};
use crate::set::ProcessSet;
use crate::trampoline::Trampoline;

/// Starts processes and registers them in the set.
#[derive(Debug, Clone)]
pub struct Launcher {
    trampoline: Trampoline,
    events: mpsc::Sender<ProcessEvent>,
    set: ProcessSet,
}

impl Launcher {
    pub fn new(trampoline: Trampoline, events: mpsc::Sender<ProcessEvent>, set: ProcessSet) -> Self {
        Self {
            trampoline,
            events,
            set,
        }
    }

    /// Launch `config` as `generation` with `listeners` mapped to 3, 4, ...
    ///
    /// The returned process is in state `Starting` and already registered.
    /// On error nothing is registered.
    pub fn launch(
        &self,
        config: Arc<ProcessConfig>,
        listeners: &Listeners,
        generation: u64,
    ) -> Result<ProcessHandle, LaunchError> {
        let program = resolve_program(&config)?;
        let credentials = Credentials::resolve(config.user.as_deref(), config.group.as_deref())?;
        let env = environment::build(
            std::env::vars_os(),
            listeners.len(),
            config.notify_socket.as_deref(),
            &config.environment,
        );

        let mut cmd = if listeners.is_empty() {
            let mut cmd = Command::new(&program);
            cmd.args(&config.args);
            cmd
        } else {
            self.trampoline.command(&program, &config.args)
        };
        cmd.env_clear()
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false);
        if let Some(dir) = &config.dir {
            cmd.current_dir(dir);
        }
        if let Some(uid) = credentials.uid {
            cmd.uid(uid.as_raw());
        }
        if let Some(gid) = credentials.gid {
            cmd.gid(gid.as_raw());
        }

        let sources = listeners.raw_fds();
        if !sources.is_empty() {
            let mut scratch: Vec<RawFd> = vec![-1; sources.len()];
            // SAFETY: the hook only calls async-signal-safe fcntl/dup2 and
            // writes into a buffer allocated before fork.
            unsafe {
                cmd.pre_exec(move || map_descriptors(&sources, &mut scratch));
            }
        }

        let mut child = cmd.spawn().map_err(|source| LaunchError::Spawn {
            program: program.display().to_string(),
            source,
        })?;
        let raw_pid = child.id().ok_or(LaunchError::NoPid)?;
        let pid = Pid::from_raw(i32::try_from(raw_pid).map_err(|_| LaunchError::NoPid)?);

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            let _ = child.start_kill();
            return Err(LaunchError::Pipes);
        };
        let logs = vec![
            forward_lines(stdout, pid, "stdout"),
            forward_lines(stderr, pid, "stderr"),
        ];

        info!(
            pid = %pid,
            generation,
            command = %config.command_line(),
            listeners = listeners.len(),
            "launched process"
        );

        let spawned = Spawned {
            pid,
            generation,
            config,
            died: process::watch_exit(child),
            logs,
        };
        Ok(process::start(spawned, self.events.clone(), self.set.clone()))
    }
}

fn resolve_program(config: &ProcessConfig) -> Result<PathBuf, LaunchError> {
    let cwd = config.dir.clone().unwrap_or_else(|| PathBuf::from("."));
    let found = which::which_in(&config.program, std::env::var_os("PATH"), cwd).map_err(
        |source| LaunchError::ExecutableNotFound {
            program: config.program.clone(),
            source,
        },
    )?;
    // Relative results would be re-resolved against the child's working directory.
    Ok(std::path::absolute(&found).unwrap_or(found))
}

/// Move `sources` onto descriptors `3..3+n` in the forked child.
///
/// Everything is first duplicated above the target range so a source that
/// already sits inside the range cannot be overwritten before it is copied.
/// The duplicates are close-on-exec; the final descriptors are not.
fn map_descriptors(sources: &[RawFd], scratch: &mut [RawFd]) -> std::io::Result<()> {
    let above = LISTEN_FDS_START.saturating_add(RawFd::try_from(sources.len()).unwrap_or(RawFd::MAX));
    for (slot, &source) in scratch.iter_mut().zip(sources) {
        // SAFETY: source is an open descriptor inherited across fork.
        let dup = unsafe { libc::fcntl(source, libc::F_DUPFD_CLOEXEC, above) };
        if dup < 0 {
            return Err(std::io::Error::last_os_error());
        }
        *slot = dup;
    }
    for (target, &dup) in (LISTEN_FDS_START..).zip(scratch.iter()) {
        // SAFETY: dup is open; dup2 atomically replaces whatever sits at target.
        if unsafe { libc::dup2(dup, target) } < 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Target identity for the launched process.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Credentials {
    pub uid: Option<Uid>,
    pub gid: Option<Gid>,
}

impl Credentials {
    /// Resolve user and group names or numeric ids. A user without an
    /// explicit group runs with its primary group.
    pub fn resolve(user: Option<&str>, group: Option<&str>) -> Result<Self, LaunchError> {
        let mut credentials = Credentials::default();
        if let Some(user) = user {
            let found = match user.parse::<u32>() {
                Ok(uid) => User::from_uid(Uid::from_raw(uid)),
                Err(_) => User::from_name(user),
            }
            .map_err(|e| LaunchError::Credentials(format!("look up user '{user}': {e}")))?
            .ok_or_else(|| LaunchError::Credentials(format!("unknown user '{user}'")))?;
            credentials.uid = Some(found.uid);
            credentials.gid = Some(found.gid);
        }
        if let Some(group) = group {
            let found = match group.parse::<u32>() {
                Ok(gid) => Group::from_gid(Gid::from_raw(gid)),
                Err(_) => Group::from_name(group),
            }
            .map_err(|e| LaunchError::Credentials(format!("look up group '{group}': {e}")))?
            .ok_or_else(|| LaunchError::Credentials(format!("unknown group '{group}'")))?;
            credentials.gid = Some(found.gid);
        }
        Ok(credentials)
    }
}

/// Forward each line of `reader` to the log, tagged with the process pid.
fn forward_lines<R>(reader: R, pid: Pid, stream: &'static str) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    info!(pid = pid.as_raw(), stream, "{}", line.trim_end_matches(['\n', '\r']));
                }
                Err(e) => {
                    warn!(pid = pid.as_raw(), stream, error = %e, "reading process output failed");
                    break;
                }
            }
        }
    })
}
