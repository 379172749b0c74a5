//! OS signal intake and classification.

use nix::sys::signal::Signal;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;

const CAPACITY: usize = 32;

/// Signals the supervisor always listens for.
pub const HANDLED: [Signal; 9] = [
    Signal::SIGHUP,
    Signal::SIGINT,
    Signal::SIGTERM,
    Signal::SIGQUIT,
    Signal::SIGUSR1,
    Signal::SIGUSR2,
    Signal::SIGWINCH,
    Signal::SIGTTIN,
    Signal::SIGTTOU,
];

/// Signals that end the supervisor.
pub const TERMINAL: [Signal; 3] = [Signal::SIGINT, Signal::SIGTERM, Signal::SIGQUIT];

/// What the manager does with a received signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Reload,
    Shutdown,
    /// The launched application acknowledged readiness.
    Ready,
    Forward,
}

/// Maps signals to manager actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalPlan {
    pub reload: Signal,
    pub ready: Option<Signal>,
}

impl Default for SignalPlan {
    fn default() -> Self {
        Self {
            reload: Signal::SIGHUP,
            ready: None,
        }
    }
}

impl SignalPlan {
    pub fn classify(&self, signal: Signal) -> Action {
        if TERMINAL.contains(&signal) {
            Action::Shutdown
        } else if signal == self.reload {
            Action::Reload
        } else if Some(signal) == self.ready {
            Action::Ready
        } else {
            Action::Forward
        }
    }
}

/// Start listening for [`HANDLED`] plus `extra`; received signals arrive on
/// the returned channel in delivery order per kind.
pub fn install(extra: &[Signal]) -> std::io::Result<mpsc::Receiver<Signal>> {
    let mut kinds: Vec<Signal> = HANDLED.iter().chain(extra).copied().collect();
    kinds.sort_by_key(|s| *s as i32);
    kinds.dedup();

    let (tx, rx) = mpsc::channel(CAPACITY);
    for sig in kinds {
        let mut stream = signal(SignalKind::from_raw(sig as i32))?;
        let tx = tx.clone();
        tokio::spawn(async move {
            while stream.recv().await.is_some() {
                if tx.send(sig).await.is_err() {
                    break;
                }
            }
        });
    }
    Ok(rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    #[test]
    fn terminal_signals_always_shut_down() {
        let plan = SignalPlan {
            reload: Signal::SIGHUP,
            ready: Some(Signal::SIGUSR1),
        };
        for sig in TERMINAL {
            assert_eq!(plan.classify(sig), Action::Shutdown);
        }
    }

    #[test]
    fn control_signals_are_claimed_and_the_rest_forwarded() {
        let plan = SignalPlan {
            reload: Signal::SIGUSR2,
            ready: Some(Signal::SIGUSR1),
        };
        assert_eq!(plan.classify(Signal::SIGUSR2), Action::Reload);
        assert_eq!(plan.classify(Signal::SIGUSR1), Action::Ready);
        assert_eq!(plan.classify(Signal::SIGHUP), Action::Forward);
        assert_eq!(plan.classify(Signal::SIGWINCH), Action::Forward);
    }

    #[tokio::test]
    async fn installed_handlers_deliver_signals() {
        let mut rx = install(&[Signal::SIGALRM]).unwrap();
        nix::sys::signal::raise(Signal::SIGALRM).unwrap();
        let received = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, Signal::SIGALRM);
    }
}
