//! Zero-downtime process supervisor.
//!
//! The supervisor owns the listening sockets, launches one generation of the
//! application on them and, on reload, starts the next generation before
//! retiring the previous one.

pub mod cli;
pub mod config;
pub mod environment;
pub mod error;
pub mod launcher;
pub mod listen;
pub mod manager;
pub mod process;
pub mod readiness;
pub mod set;
pub mod signals;
pub mod status;
pub mod trampoline;

pub use config::{ConfigSource, ProcessConfig};
pub use error::{LaunchError, ProcessError, SupervisorError, SupervisorResult};
pub use launcher::Launcher;
pub use listen::{ListenAddr, Listeners};
pub use manager::{Manager, ManagerState};
pub use process::{ProcessEvent, ProcessHandle, ProcessState};
pub use set::ProcessSet;
pub use trampoline::Trampoline;
