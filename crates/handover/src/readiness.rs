//! Readiness notifications from launched processes.
//!
//! Processes report over a unix datagram socket published as
//! `NOTIFY_SOCKET`, using `sd_notify` style `KEY=VALUE` lines. A bare line
//! with no assignment is also taken as a readiness acknowledgement.

use std::io::{self, IoSliceMut};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

use nix::sys::socket::{
    ControlMessageOwned, MsgFlags, UnixCredentials, recvmsg, setsockopt, sockopt,
};
use nix::unistd::Pid;
use tokio::io::Interest;
use tokio::net::UnixDatagram;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{SupervisorError, SupervisorResult};

const MAX_DATAGRAM: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckKind {
    /// The process accepts connections.
    Ready,
    /// The process finished draining.
    Stopping,
}

/// An acknowledgement routed to the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessAck {
    /// Sender, when known. Signal-based acks carry none.
    pub pid: Option<Pid>,
    pub kind: AckKind,
}

/// A parsed notification datagram.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Message<'a> {
    pub kind: Option<AckKind>,
    pub main_pid: Option<i32>,
    pub status: Option<&'a str>,
}

impl<'a> Message<'a> {
    pub fn parse(text: &'a str) -> Self {
        let mut message = Message::default();
        let mut assignments = false;
        for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            assignments = true;
            match key {
                "READY" if value == "1" => message.kind = Some(AckKind::Ready),
                "STOPPING" if value == "1" => message.kind = Some(AckKind::Stopping),
                "MAINPID" => message.main_pid = value.parse().ok(),
                "STATUS" => message.status = Some(value),
                _ => {}
            }
        }
        if !assignments && !text.trim().is_empty() {
            message.kind = Some(AckKind::Ready);
        }
        message
    }
}

/// The datagram socket processes report to.
///
/// The socket file is removed when the value is dropped.
#[derive(Debug)]
pub struct NotifySocket {
    socket: UnixDatagram,
    path: PathBuf,
}

impl NotifySocket {
    pub fn bind(path: &Path) -> SupervisorResult<Self> {
        let notify_err = |source| SupervisorError::Notify {
            path: path.display().to_string(),
            source,
        };
        match std::fs::remove_file(path) {
            Ok(()) => debug!(path = %path.display(), "removed stale notify socket"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(notify_err(e)),
        }
        let socket = UnixDatagram::bind(path).map_err(notify_err)?;
        setsockopt(&socket, sockopt::PassCred, &true).map_err(|e| notify_err(e.into()))?;
        Ok(Self {
            socket,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Forward acknowledgements until cancelled or the receiver goes away.
    pub async fn run(self, acks: mpsc::Sender<ReadinessAck>, cancel: CancellationToken) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => return,
                received = self.recv(&mut buf) => received,
            };
            let (len, sender) = match received {
                Ok(r) => r,
                Err(e) => {
                    warn!(path = %self.path.display(), error = %e, "notify socket receive failed");
                    continue;
                }
            };

            let text = String::from_utf8_lossy(buf.get(..len).unwrap_or_default());
            let message = Message::parse(&text);
            let pid = message.main_pid.map(Pid::from_raw).or(sender);
            if let Some(status) = message.status {
                info!(pid = pid.map(Pid::as_raw), status, "process status");
            }
            let Some(kind) = message.kind else {
                continue;
            };
            debug!(pid = pid.map(Pid::as_raw), ?kind, "readiness notification");
            if acks.send(ReadinessAck { pid, kind }).await.is_err() {
                return;
            }
        }
    }

    /// Receive one datagram and the sender pid from its credentials.
    async fn recv(&self, buf: &mut [u8]) -> io::Result<(usize, Option<Pid>)> {
        let fd = self.socket.as_raw_fd();
        self.socket
            .async_io(Interest::READABLE, || {
                let mut cmsg = nix::cmsg_space!(UnixCredentials);
                let mut iov = [IoSliceMut::new(&mut *buf)];
                let msg = recvmsg::<()>(fd, &mut iov, Some(&mut cmsg), MsgFlags::MSG_DONTWAIT)?;
                let mut sender = None;
                for cmsg in msg.cmsgs()? {
                    if let ControlMessageOwned::ScmCredentials(creds) = cmsg {
                        sender = Some(Pid::from_raw(creds.pid()));
                    }
                }
                Ok((msg.bytes, sender))
            })
            .await
    }
}

impl Drop for NotifySocket {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}
