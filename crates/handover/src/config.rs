use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::Signal;
use serde::Deserialize;

use crate::error::{SupervisorError, SupervisorResult};

/// Everything needed to launch one generation.
///
/// A fresh value is produced by [`ConfigSource::load`] for every launch and is
/// never mutated afterwards, so concurrent generations never observe each
/// other's inputs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessConfig {
    pub program: String,
    pub args: Vec<String>,
    /// Working directory of the launched process.
    pub dir: Option<PathBuf>,
    /// Merged over the inherited environment; wins on conflicts.
    pub environment: BTreeMap<String, String>,
    /// Target user (name or numeric uid).
    pub user: Option<String>,
    /// Target group (name or numeric gid); defaults to the user's primary group.
    pub group: Option<String>,
    /// Readiness datagram socket published as `NOTIFY_SOCKET`.
    pub notify_socket: Option<PathBuf>,
    /// Signal the application sends to the supervisor when it is ready.
    pub ready_signal: Option<Signal>,
    /// Signal asking a superseded process to stop accepting and drain.
    pub yield_signal: Option<Signal>,
    pub start_timeout: Option<Duration>,
    pub stop_timeout: Option<Duration>,
}

impl ProcessConfig {
    /// Whether the launched process is expected to acknowledge readiness.
    pub fn awaits_readiness(&self) -> bool {
        self.notify_socket.is_some() || self.ready_signal.is_some()
    }

    /// Human readable command line for logs.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// The values that can also come from the config file.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    #[serde(default)]
    pub command: Option<CommandLine>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

/// `command` in the config file: a string split on whitespace, or a list.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum CommandLine {
    Line(String),
    Argv(Vec<String>),
}

impl CommandLine {
    fn into_argv(self) -> Vec<String> {
        match self {
            CommandLine::Line(line) => line.split_whitespace().map(String::from).collect(),
            CommandLine::Argv(argv) => argv,
        }
    }
}

impl FileConfig {
    pub fn parse(content: &str) -> SupervisorResult<Self> {
        serde_yaml_ng::from_str(content)
            .map_err(|e| SupervisorError::Config(format!("parse config file: {e}")))
    }

    pub fn load(path: &Path) -> SupervisorResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            SupervisorError::Config(format!("read config file {}: {e}", path.display()))
        })?;
        Self::parse(&content)
    }
}

/// Produces the per-generation [`ProcessConfig`].
///
/// The command line values are fixed at startup; the optional config file is
/// re-read on every load so a reload can pick up a new command or environment.
#[derive(Debug, Clone)]
pub struct ConfigSource {
    base: ProcessConfig,
    file: Option<PathBuf>,
}

impl ConfigSource {
    pub fn new(base: ProcessConfig, file: Option<PathBuf>) -> Self {
        Self { base, file }
    }

    pub fn load(&self) -> SupervisorResult<Arc<ProcessConfig>> {
        let mut config = self.base.clone();
        if let Some(path) = &self.file {
            let file = FileConfig::load(path)?;
            merge(&mut config, file).map_err(|e| {
                SupervisorError::Config(format!(
                    "between the command line and the config file '{}', {e}",
                    path.display()
                ))
            })?;
        }
        validate(&config)?;
        Ok(Arc::new(config))
    }
}

/// Merge file values into `config`. Each value may come from one place only.
fn merge(config: &mut ProcessConfig, file: FileConfig) -> Result<(), String> {
    if let Some(command) = file.command {
        if !config.program.is_empty() {
            return Err("command can only be set once".into());
        }
        let mut argv = command.into_argv().into_iter();
        config.program = argv.next().unwrap_or_default();
        config.args = argv.collect();
    }

    if !file.environment.is_empty() {
        if !config.environment.is_empty() {
            return Err("environment can only be set once".into());
        }
        config.environment = file.environment;
    }

    Ok(())
}

fn validate(config: &ProcessConfig) -> SupervisorResult<()> {
    if config.program.is_empty() {
        return Err(SupervisorError::Config("missing command".into()));
    }
    if let Some(name) = config.environment.keys().find(|k| k.is_empty() || k.contains('=')) {
        return Err(SupervisorError::Config(format!(
            "invalid environment variable name '{name}'"
        )));
    }
    Ok(())
}

/// Parse `SIGUSR1`, `USR1` or `10` into a signal.
pub fn parse_signal(s: &str) -> Result<Signal, String> {
    let s = s.trim();
    if let Ok(n) = s.parse::<i32>() {
        return Signal::try_from(n).map_err(|_| format!("unknown signal number {n}"));
    }
    let upper = s.to_ascii_uppercase();
    let name = if upper.starts_with("SIG") {
        upper
    } else {
        format!("SIG{upper}")
    };
    Signal::from_str(&name).map_err(|_| format!("unknown signal '{s}'"))
}

/// Parse a `KEY=VALUE` pair.
pub fn parse_env_pair(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{s}'")),
    }
}

/// Milliseconds on the command line, 0 meaning disabled.
pub fn millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> ProcessConfig {
        ProcessConfig {
            program: "server".into(),
            ..ProcessConfig::default()
        }
    }

    #[test]
    fn file_config_accepts_string_command() {
        let file = FileConfig::parse("command: ./server --port 80\n").unwrap();
        assert_eq!(
            file.command.unwrap().into_argv(),
            vec!["./server", "--port", "80"]
        );
    }

    #[test]
    fn file_config_accepts_list_command_and_environment() {
        let yaml = "command: [\"/bin/sh\", \"-c\", \"exec server\"]\nenvironment:\n  MODE: prod\n";
        let file = FileConfig::parse(yaml).unwrap();
        assert_eq!(
            file.command.unwrap().into_argv(),
            vec!["/bin/sh", "-c", "exec server"]
        );
        assert_eq!(file.environment.get("MODE").map(String::as_str), Some("prod"));
    }

    #[test]
    fn file_config_rejects_unknown_keys() {
        assert!(FileConfig::parse("listen: :8080\n").is_err());
    }

    #[test]
    fn merge_fills_missing_command() {
        let mut config = ProcessConfig::default();
        let file = FileConfig::parse("command: server -v\n").unwrap();
        merge(&mut config, file).unwrap();
        assert_eq!(config.program, "server");
        assert_eq!(config.args, vec!["-v"]);
    }

    #[test]
    fn merge_rejects_command_set_twice() {
        let mut config = base();
        let file = FileConfig::parse("command: other\n").unwrap();
        let err = merge(&mut config, file).unwrap_err();
        assert_eq!(err, "command can only be set once");
    }

    #[test]
    fn merge_rejects_environment_set_twice() {
        let mut config = base();
        config.environment.insert("A".into(), "1".into());
        let file = FileConfig::parse("environment:\n  B: '2'\n").unwrap();
        let err = merge(&mut config, file).unwrap_err();
        assert_eq!(err, "environment can only be set once");
    }

    #[test]
    fn load_rereads_file_each_time() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("handover.yaml");
        std::fs::write(&path, "command: server-v1\n").unwrap();

        let source = ConfigSource::new(ProcessConfig::default(), Some(path.clone()));
        let first = source.load().unwrap();
        assert_eq!(first.program, "server-v1");

        std::fs::write(&path, "command: server-v2\n").unwrap();
        let second = source.load().unwrap();
        assert_eq!(second.program, "server-v2");
        assert_eq!(first.program, "server-v1");
    }

    #[test]
    fn load_without_command_fails() {
        let source = ConfigSource::new(ProcessConfig::default(), None);
        let err = source.load().unwrap_err();
        assert!(err.to_string().contains("missing command"));
    }

    #[test]
    fn load_reports_missing_file() {
        let source = ConfigSource::new(base(), Some(PathBuf::from("/nonexistent/handover.yaml")));
        assert!(source.load().is_err());
    }

    #[test]
    fn awaits_readiness_with_notify_or_signal() {
        let mut config = base();
        assert!(!config.awaits_readiness());
        config.ready_signal = Some(Signal::SIGUSR1);
        assert!(config.awaits_readiness());
        config.ready_signal = None;
        config.notify_socket = Some(PathBuf::from("/run/handover.sock"));
        assert!(config.awaits_readiness());
    }

    #[test]
    fn parse_signal_forms() {
        assert_eq!(parse_signal("SIGUSR1").unwrap(), Signal::SIGUSR1);
        assert_eq!(parse_signal("usr2").unwrap(), Signal::SIGUSR2);
        assert_eq!(parse_signal("1").unwrap(), Signal::SIGHUP);
        assert!(parse_signal("SIGNOPE").is_err());
        assert!(parse_signal("999").is_err());
    }

    #[test]
    fn parse_env_pair_forms() {
        assert_eq!(
            parse_env_pair("A=b=c").unwrap(),
            ("A".to_string(), "b=c".to_string())
        );
        assert_eq!(parse_env_pair("EMPTY=").unwrap().1, "");
        assert!(parse_env_pair("=x").is_err());
        assert!(parse_env_pair("novalue").is_err());
    }

    #[test]
    fn zero_millis_disables_timeout() {
        assert_eq!(millis(0), None);
        assert_eq!(millis(250), Some(Duration::from_millis(250)));
    }

    #[test]
    fn command_line_joins_args() {
        let mut config = base();
        config.args = vec!["--port".into(), "80".into()];
        assert_eq!(config.command_line(), "server --port 80");
    }
}
