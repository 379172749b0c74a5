use std::path::PathBuf;

use clap::Parser;
use nix::sys::signal::Signal;

use crate::config::{ConfigSource, ProcessConfig, millis, parse_env_pair, parse_signal};
use crate::error::{SupervisorError, SupervisorResult};
use crate::listen::ListenAddr;
use crate::manager::ManagerOptions;
use crate::signals::{SignalPlan, TERMINAL};

#[derive(Debug, Parser)]
#[command(
    name = "handover",
    version,
    about = "Run a server and replace it without dropping connections"
)]
pub struct Cli {
    /// Address to listen on: tcp://host:port, tcp4://, tcp6://, unix:///path, fd://N or host:port
    #[arg(short, long = "listen", value_name = "ADDR", env = "HANDOVER_LISTEN", value_delimiter = ',')]
    pub listen: Vec<ListenAddr>,

    /// Working directory of the launched process
    #[arg(long, value_name = "DIR", env = "HANDOVER_DIR")]
    pub dir: Option<PathBuf>,

    /// Readiness socket path published to the process as NOTIFY_SOCKET
    #[arg(long, value_name = "PATH", env = "HANDOVER_NOTIFY")]
    pub notify: Option<PathBuf>,

    /// Start timeout in milliseconds (0 disables)
    #[arg(long = "start", value_name = "MS", default_value_t = 0, env = "HANDOVER_START")]
    pub start_ms: u64,

    /// Stop timeout in milliseconds (0 disables)
    #[arg(long = "stop", value_name = "MS", default_value_t = 0, env = "HANDOVER_STOP")]
    pub stop_ms: u64,

    /// Run the process as this user (name or uid)
    #[arg(short, long, env = "HANDOVER_USER")]
    pub user: Option<String>,

    /// Run the process with this group (name or gid)
    #[arg(short, long, env = "HANDOVER_GROUP")]
    pub group: Option<String>,

    /// Extra environment variable for the process (KEY=VALUE, repeatable)
    #[arg(short, long = "env", value_name = "KEY=VALUE", value_parser = parse_env_pair)]
    pub env: Vec<(String, String)>,

    /// YAML file with `command` and `environment`, re-read on every reload
    #[arg(short, long, value_name = "PATH", env = "HANDOVER_CONFIG")]
    pub config_file: Option<PathBuf>,

    /// Signal the process sends to the supervisor once it is ready
    #[arg(long, value_name = "SIG", value_parser = parse_signal)]
    pub child_ready_signal: Option<Signal>,

    /// Signal that starts a new generation
    #[arg(long, value_name = "SIG", value_parser = parse_signal, default_value = "SIGHUP")]
    pub reload_signal: Signal,

    /// Signal asking a superseded process to stop accepting and drain
    #[arg(long, value_name = "SIG", value_parser = parse_signal)]
    pub yield_signal: Option<Signal>,

    /// Write a JSON status snapshot to this file after every change
    #[arg(long, value_name = "PATH", env = "HANDOVER_STATUS_FILE")]
    pub status_file: Option<PathBuf>,

    /// Also log to daily rotated files in this directory
    #[arg(long, value_name = "DIR", env = "HANDOVER_LOG_DIR")]
    pub log_dir: Option<PathBuf>,

    /// Command to run, followed by its arguments
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, value_name = "COMMAND")]
    pub command: Vec<String>,
}

impl Cli {
    /// Reject signal combinations the supervisor cannot tell apart.
    pub fn validate(&self) -> SupervisorResult<()> {
        let claimed = [
            ("reload", Some(self.reload_signal)),
            ("child ready", self.child_ready_signal),
            ("yield", self.yield_signal),
        ];
        for (name, signal) in claimed {
            if let Some(signal) = signal.filter(|s| TERMINAL.contains(s)) {
                return Err(SupervisorError::Config(format!(
                    "{signal} is reserved for shutdown and cannot be the {name} signal"
                )));
            }
        }
        if self.child_ready_signal == Some(self.reload_signal) {
            return Err(SupervisorError::Config(format!(
                "reload and child ready signal are both {}",
                self.reload_signal
            )));
        }
        Ok(())
    }

    /// Values fixed for the lifetime of the supervisor.
    pub fn process_config(&self) -> ProcessConfig {
        let mut argv = self.command.iter().cloned();
        ProcessConfig {
            program: argv.next().unwrap_or_default(),
            args: argv.collect(),
            dir: self.dir.clone(),
            environment: self.env.iter().cloned().collect(),
            user: self.user.clone(),
            group: self.group.clone(),
            notify_socket: self.notify.clone(),
            ready_signal: self.child_ready_signal,
            yield_signal: self.yield_signal,
            start_timeout: millis(self.start_ms),
            stop_timeout: millis(self.stop_ms),
        }
    }

    pub fn config_source(&self) -> ConfigSource {
        ConfigSource::new(self.process_config(), self.config_file.clone())
    }

    pub fn manager_options(&self) -> ManagerOptions {
        ManagerOptions {
            signals: SignalPlan {
                reload: self.reload_signal,
                ready: self.child_ready_signal,
            },
            status_file: self.status_file.clone(),
        }
    }

    /// Configured signals that must be caught in addition to the defaults.
    pub fn extra_signals(&self) -> Vec<Signal> {
        [Some(self.reload_signal), self.child_ready_signal, self.yield_signal]
            .into_iter()
            .flatten()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("handover").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn trailing_command_keeps_its_flags() {
        let cli = parse(&["-l", ":8080", "--", "server", "--port", "8080"]);
        assert_eq!(cli.command, vec!["server", "--port", "8080"]);
        let config = cli.process_config();
        assert_eq!(config.program, "server");
        assert_eq!(config.args, vec!["--port", "8080"]);
    }

    #[test]
    fn listen_is_repeatable() {
        let cli = parse(&["--listen", ":80", "--listen", "unix:///tmp/a.sock", "server"]);
        assert_eq!(cli.listen.len(), 2);
        assert_eq!(cli.listen[1], ListenAddr::Unix(PathBuf::from("/tmp/a.sock")));
    }

    #[test]
    fn timeouts_and_signals_map_into_process_config() {
        let cli = parse(&[
            "--start",
            "500",
            "--stop",
            "0",
            "--child-ready-signal",
            "USR1",
            "--yield-signal",
            "SIGUSR2",
            "-e",
            "MODE=prod",
            "server",
        ]);
        let config = cli.process_config();
        assert_eq!(config.start_timeout, Some(Duration::from_millis(500)));
        assert_eq!(config.stop_timeout, None);
        assert_eq!(config.ready_signal, Some(Signal::SIGUSR1));
        assert_eq!(config.yield_signal, Some(Signal::SIGUSR2));
        assert_eq!(config.environment.get("MODE").map(String::as_str), Some("prod"));
        assert_eq!(cli.reload_signal, Signal::SIGHUP);
        assert_eq!(
            cli.extra_signals(),
            vec![Signal::SIGHUP, Signal::SIGUSR1, Signal::SIGUSR2]
        );
    }

    #[test]
    fn invalid_values_are_rejected_by_the_parser() {
        let base = ["handover"];
        assert!(Cli::try_parse_from(base.iter().chain(&["--listen", "udp://:53"])).is_err());
        assert!(Cli::try_parse_from(base.iter().chain(&["--env", "NOEQUALS"])).is_err());
        assert!(Cli::try_parse_from(base.iter().chain(&["--reload-signal", "SIGNOPE"])).is_err());
    }

    #[test]
    fn validate_rejects_terminal_and_clashing_signals() {
        assert!(parse(&["--reload-signal", "TERM", "server"]).validate().is_err());
        assert!(parse(&["--yield-signal", "INT", "server"]).validate().is_err());
        assert!(
            parse(&["--reload-signal", "USR1", "--child-ready-signal", "USR1", "server"])
                .validate()
                .is_err()
        );
        assert!(parse(&["--child-ready-signal", "USR1", "server"]).validate().is_ok());
    }

    #[test]
    fn options_carry_signal_plan_and_status_file() {
        let cli = parse(&["--reload-signal", "USR2", "--status-file", "/run/h.json", "server"]);
        let options = cli.manager_options();
        assert_eq!(options.signals.reload, Signal::SIGUSR2);
        assert_eq!(options.status_file, Some(PathBuf::from("/run/h.json")));
    }
}
