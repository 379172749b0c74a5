use std::process::ExitStatus;
use std::time::Duration;

pub type SupervisorResult<T> = Result<T, SupervisorError>;

/// Errors that end a supervisor run or a reload attempt.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("config: {0}")]
    Config(String),

    #[error("listen on {addr}: {source}")]
    Listen {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Activation(#[from] socket_activation::ActivationError),

    #[error("install signal handlers: {0}")]
    Signals(#[source] std::io::Error),

    #[error("notify socket {path}: {source}")]
    Notify {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error("process {pid} (generation {generation}): {source}")]
    Process {
        pid: i32,
        generation: u64,
        #[source]
        source: ProcessError,
    },

    #[error("internal: {0}")]
    Internal(String),
}

/// Failures while starting a new generation. Nothing is registered when one
/// of these is returned.
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("could not find executable '{program}': {source}")]
    ExecutableNotFound {
        program: String,
        #[source]
        source: which::Error,
    },

    #[error("credentials: {0}")]
    Credentials(String),

    #[error("spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("spawned process has no pid")]
    NoPid,

    #[error("output pipes were not captured")]
    Pipes,
}

/// Per-process failures, carried on lifecycle events.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProcessError {
    #[error("did not become ready within {0:?}")]
    StartTimeout(Duration),

    #[error("did not stop within {0:?}, killed")]
    StopTimeout(Duration),

    #[error("exit not confirmed within {0:?} after kill")]
    KillTimeout(Duration),

    #[error("exited unexpectedly: {0}")]
    UnexpectedExit(ExitStatus),

    #[error("wait: {0}")]
    Wait(String),

    #[error("signal {signal}: {errno}")]
    Signal {
        signal: nix::sys::signal::Signal,
        errno: nix::errno::Errno,
    },
}

impl ProcessError {
    /// Whether this error should become the supervisor's exit status.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ProcessError::Signal { .. })
    }
}
