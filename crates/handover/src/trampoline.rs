//! Launch indirection that publishes `LISTEN_PID`.
//!
//! The pid of a child is only known after it is created, but socket
//! activation requires `LISTEN_PID` to equal the pid of the process reading
//! the descriptors. The launched command is therefore started through a
//! trampoline that exports its own pid and then replaces itself with the
//! real program, keeping the pid.

use std::ffi::OsStr;
use std::os::unix::process::CommandExt as _;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use tokio::process::Command;

/// `argv[0]` under which the supervisor binary acts as the trampoline.
pub const TRAMPOLINE_ARGV0: &str = "handover-listen-pid";

const SHELL: &str = "/bin/sh";
const SHELL_SCRIPT: &str = r#"LISTEN_PID=$$; export LISTEN_PID; exec "$0" "$@""#;

/// Exit status when the target program could not be executed.
const EXEC_FAILED: u8 = 127;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trampoline {
    /// Re-execute this binary under [`TRAMPOLINE_ARGV0`].
    SelfExec(PathBuf),
    /// Go through `/bin/sh`.
    Shell,
}

impl Trampoline {
    /// Trampoline through the currently running executable.
    pub fn current_exe() -> std::io::Result<Self> {
        std::env::current_exe().map(Trampoline::SelfExec)
    }

    /// Command running `program` with `args` behind the trampoline.
    pub fn command<I, S>(&self, program: &Path, args: I) -> Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = match self {
            Trampoline::SelfExec(exe) => {
                let mut cmd = Command::new(exe);
                cmd.arg0(TRAMPOLINE_ARGV0);
                cmd
            }
            Trampoline::Shell => {
                let mut cmd = Command::new(SHELL);
                cmd.arg("-c").arg(SHELL_SCRIPT);
                cmd
            }
        };
        cmd.arg(program).args(args);
        cmd
    }
}

/// Act as the trampoline when started under [`TRAMPOLINE_ARGV0`].
///
/// Must run before any thread is started. Returns `None` for a normal
/// invocation; otherwise only returns if the target could not be executed.
pub fn dispatch() -> Option<ExitCode> {
    let mut args = std::env::args_os();
    let argv0 = args.next()?;
    if Path::new(&argv0).file_name() != Some(OsStr::new(TRAMPOLINE_ARGV0)) {
        return None;
    }

    let Some(target) = args.next() else {
        eprintln!("{TRAMPOLINE_ARGV0}: missing program");
        return Some(ExitCode::from(EXEC_FAILED));
    };
    let err = std::process::Command::new(&target)
        .args(args)
        .env("LISTEN_PID", std::process::id().to_string())
        .exec();
    eprintln!(
        "{TRAMPOLINE_ARGV0}: exec {}: {err}",
        Path::new(&target).display()
    );
    Some(ExitCode::from(EXEC_FAILED))
}
