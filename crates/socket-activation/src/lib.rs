//! Socket-activation plumbing shared by the supervisor and the processes it
//! runs.
//!
//! - [`listen_fds`] adopts descriptors handed down through `LISTEN_PID` /
//!   `LISTEN_FDS`, starting at [`LISTEN_FDS_START`].
//! - [`notify`] sends an `sd_notify`-style datagram to `$NOTIFY_SOCKET`.
//! - [`TrackingListener`] counts live connections so a yielding process can
//!   stop accepting and wait for in-flight work to finish.

mod listen;
mod notify;
mod tracking;

pub use listen::{
    ActivationError, LISTEN_FDS_START, activation_count, listen_fd_names, listen_fds,
    parse_fd_names,
};
pub use notify::{NOTIFY_SOCKET, notify, notify_ready, notify_stopping, send_to};
pub use tracking::{Accept, Drain, Tracked, TrackingListener};
