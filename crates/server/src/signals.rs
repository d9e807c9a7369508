//! OS signal handling.
//!
//! Signals are translated into [`SignalType`] values on a channel so the
//! control plane loop handles them in one place.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// What the control plane should do in response to a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalType {
    /// SIGHUP: reload the mesh block of the configuration file
    Reload,
    /// SIGUSR1: resend everything to every proxy and dump state
    Resync,
    /// SIGINT or SIGTERM
    Shutdown,
}

/// Receives translated signals.
pub struct SignalManager {
    tx: mpsc::UnboundedSender<SignalType>,
    rx: mpsc::UnboundedReceiver<SignalType>,
}

impl SignalManager {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx }
    }

    /// Sender for injecting signals without the OS.
    pub fn sender(&self) -> mpsc::UnboundedSender<SignalType> {
        self.tx.clone()
    }

    /// Wait for the next signal.
    pub async fn recv(&mut self) -> Option<SignalType> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<SignalType> {
        self.rx.try_recv().ok()
    }

    /// Start translating OS signals. Must be called inside a runtime.
    #[cfg(unix)]
    pub fn listen(&self) -> std::io::Result<JoinHandle<()>> {
        use tokio::signal::unix::{signal, SignalKind};

        let mut interrupt = signal(SignalKind::interrupt())?;
        let mut terminate = signal(SignalKind::terminate())?;
        let mut hangup = signal(SignalKind::hangup())?;
        let mut user1 = signal(SignalKind::user_defined1())?;
        let tx = self.tx.clone();

        debug!("Installed handlers for SIGINT, SIGTERM, SIGHUP and SIGUSR1");
        Ok(tokio::spawn(async move {
            loop {
                let signal = tokio::select! {
                    Some(()) = interrupt.recv() => {
                        info!("Received SIGINT, initiating graceful shutdown");
                        SignalType::Shutdown
                    }
                    Some(()) = terminate.recv() => {
                        info!("Received SIGTERM, initiating graceful shutdown");
                        SignalType::Shutdown
                    }
                    Some(()) = hangup.recv() => {
                        info!("Received SIGHUP, reloading mesh configuration");
                        SignalType::Reload
                    }
                    Some(()) = user1.recv() => {
                        info!("Received SIGUSR1, forcing resync");
                        SignalType::Resync
                    }
                    else => break,
                };
                if tx.send(signal).is_err() {
                    break;
                }
            }
        }))
    }

    /// Start translating Ctrl-C. Must be called inside a runtime.
    #[cfg(not(unix))]
    pub fn listen(&self) -> std::io::Result<JoinHandle<()>> {
        let tx = self.tx.clone();
        Ok(tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                info!("Received Ctrl-C, initiating graceful shutdown");
                if tx.send(SignalType::Shutdown).is_err() {
                    break;
                }
            }
        }))
    }
}

impl Default for SignalManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_injected_signals_arrive_in_order() {
        let mut signals = SignalManager::new();
        let tx = signals.sender();

        tx.send(SignalType::Reload).unwrap();
        tx.send(SignalType::Resync).unwrap();
        tx.send(SignalType::Shutdown).unwrap();

        assert_eq!(signals.recv().await, Some(SignalType::Reload));
        assert_eq!(signals.recv().await, Some(SignalType::Resync));
        assert_eq!(signals.try_recv(), Some(SignalType::Shutdown));
        assert_eq!(signals.try_recv(), None);
    }

    #[tokio::test]
    async fn test_listen_installs_handlers() {
        let signals = SignalManager::new();
        let handle = signals.listen().unwrap();
        assert!(!handle.is_finished());
        handle.abort();
    }
}
