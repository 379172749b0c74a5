use std::fmt;
use std::path::Path;
use std::process::ExitCode;
use std::time::Instant;

use clap::Parser;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::fmt::writer::MakeWriterExt;

use handover::cli::Cli;
use handover::readiness::NotifySocket;
use handover::{
    Listeners, Manager, ManagerState, SupervisorError, SupervisorResult, Trampoline, signals,
    trampoline,
};

struct Elapsed(Instant);

impl FormatTime for Elapsed {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> fmt::Result {
        let d = self.0.elapsed();
        let total_secs = d.as_secs();
        write!(
            w,
            "[{:02}:{:02}:{:03}]",
            total_secs / 60,
            total_secs % 60,
            d.subsec_millis()
        )
    }
}

/// Log to stderr and to daily rotated files under `log_dir`.
///
/// The returned guard flushes the file writer when dropped.
fn init_tracing_with_file(
    log_dir: &Path,
) -> Result<tracing_appender::non_blocking::WorkerGuard, Box<dyn std::error::Error>> {
    std::fs::create_dir_all(log_dir)
        .map_err(|e| format!("create {}: {e}", log_dir.display()))?;

    let file_appender = tracing_appender::rolling::RollingFileAppender::builder()
        .rotation(tracing_appender::rolling::Rotation::DAILY)
        .filename_prefix("handover")
        .filename_suffix("log")
        .max_log_files(7)
        .build(log_dir)?;

    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::fmt()
        .with_timer(Elapsed(Instant::now()))
        .with_writer(std::io::stderr.and(non_blocking))
        .with_ansi(false)
        .init();

    Ok(guard)
}

fn init_tracing_stderr() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_timer(Elapsed(Instant::now()))
        .init();
}

/// Tell our own service manager when we are up and when we are leaving.
async fn report_to_service_manager(
    mut state: watch::Receiver<ManagerState>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            changed = state.changed() => {
                if changed.is_err() {
                    return;
                }
                let current = *state.borrow_and_update();
                let sent = match current {
                    ManagerState::Starting => continue,
                    ManagerState::Running => socket_activation::notify_ready(),
                    ManagerState::Stopping => socket_activation::notify_stopping(),
                };
                match sent {
                    Ok(true) => tracing::debug!(state = %current, "notified service manager"),
                    Ok(false) => {}
                    Err(e) => tracing::warn!(error = %e, "could not notify service manager"),
                }
            }
        }
    }
}

#[tokio::main]
async fn run(cli: Cli) -> SupervisorResult<()> {
    cli.validate()?;
    let listeners = Listeners::open(&cli.listen)?;
    for label in listeners.labels() {
        tracing::info!(listener = label, "listening");
    }
    let trampoline = Trampoline::current_exe()
        .map_err(|e| SupervisorError::Internal(format!("locate own executable: {e}")))?;
    let signals = signals::install(&cli.extra_signals()).map_err(SupervisorError::Signals)?;

    let cancel = CancellationToken::new();
    let (ack_tx, ack_rx) = mpsc::channel(32);
    let notify_task = match &cli.notify {
        Some(path) => {
            let socket = NotifySocket::bind(path)?;
            Some(tokio::spawn(socket.run(ack_tx, cancel.clone())))
        }
        None => None,
    };

    let manager = Manager::new(
        cli.config_source(),
        listeners,
        trampoline,
        cli.manager_options(),
    );
    let reporter = tokio::spawn(report_to_service_manager(manager.state(), cancel.clone()));

    let result = manager.run(signals, ack_rx).await;

    cancel.cancel();
    let _ = reporter.await;
    if let Some(task) = notify_task {
        let _ = task.await;
    }
    result
}

fn main() -> ExitCode {
    if let Some(code) = trampoline::dispatch() {
        return code;
    }

    let cli = Cli::parse();
    let _guard = match &cli.log_dir {
        Some(dir) => match init_tracing_with_file(dir) {
            Ok(guard) => Some(guard),
            Err(e) => {
                init_tracing_stderr();
                tracing::warn!("file logging unavailable, using stderr only: {e}");
                None
            }
        },
        None => {
            init_tracing_stderr();
            None
        }
    };

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
