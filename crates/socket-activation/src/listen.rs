use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};

/// First descriptor number used for passed sockets.
pub const LISTEN_FDS_START: RawFd = 3;

/// Name systemd reports for descriptors without an explicit name.
const UNKNOWN_NAME: &str = "unknown";

/// Set once the inherited range has been turned into owned descriptors.
static TAKEN: AtomicBool = AtomicBool::new(false);

#[derive(Debug, thiserror::Error)]
pub enum ActivationError {
    #[error("inherited descriptors were already taken by this process")]
    AlreadyTaken,

    #[error("inherited descriptor {fd} is not open")]
    NotOpen { fd: RawFd },

    #[error("fcntl on inherited descriptor {fd}: {source}")]
    Fcntl {
        fd: RawFd,
        #[source]
        source: std::io::Error,
    },
}

/// Number of descriptors passed to the process `own_pid`.
///
/// Returns 0 when `LISTEN_PID` names another process, or when either value is
/// missing or malformed.
pub fn activation_count(listen_pid: Option<&str>, listen_fds: Option<&str>, own_pid: u32) -> usize {
    let Some(pid) = listen_pid.and_then(|p| p.trim().parse::<u32>().ok()) else {
        return 0;
    };
    if pid != own_pid {
        return 0;
    }
    listen_fds
        .and_then(|n| n.trim().parse::<usize>().ok())
        .unwrap_or(0)
}

/// Take ownership of the descriptors passed through socket activation.
///
/// Descriptors are marked close-on-exec. The range can only be taken once per
/// process; a second call returns [`ActivationError::AlreadyTaken`] instead of
/// producing a second owner for the same descriptor.
pub fn listen_fds() -> Result<Vec<OwnedFd>, ActivationError> {
    let count = activation_count(
        std::env::var("LISTEN_PID").ok().as_deref(),
        std::env::var("LISTEN_FDS").ok().as_deref(),
        std::process::id(),
    );
    if count == 0 {
        return Ok(Vec::new());
    }
    if TAKEN.swap(true, Ordering::SeqCst) {
        return Err(ActivationError::AlreadyTaken);
    }

    (LISTEN_FDS_START..).take(count).map(adopt).collect()
}

/// Names from `LISTEN_FDNAMES`, one per passed descriptor.
pub fn listen_fd_names() -> Vec<String> {
    let count = activation_count(
        std::env::var("LISTEN_PID").ok().as_deref(),
        std::env::var("LISTEN_FDS").ok().as_deref(),
        std::process::id(),
    );
    parse_fd_names(std::env::var("LISTEN_FDNAMES").ok().as_deref(), count)
}

/// Split a colon-separated `LISTEN_FDNAMES` value into exactly `count` names,
/// padding with `unknown` like systemd does.
pub fn parse_fd_names(value: Option<&str>, count: usize) -> Vec<String> {
    let mut names: Vec<String> = value
        .map(|v| v.split(':').map(String::from).collect())
        .unwrap_or_default();
    names.resize(count, UNKNOWN_NAME.to_string());
    names
}

fn adopt(fd: RawFd) -> Result<OwnedFd, ActivationError> {
    // SAFETY: F_GETFD only reads the descriptor flags.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(ActivationError::NotOpen { fd });
    }
    // SAFETY: fd is open; only the close-on-exec flag is changed.
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) } < 0 {
        return Err(ActivationError::Fcntl {
            fd,
            source: std::io::Error::last_os_error(),
        });
    }
    // SAFETY: fd is open and TAKEN guarantees no other owner exists in this process.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}
