//! The Beacon control plane process.
//!
//! [`ControlPlane`] wires configuration, the in-memory mesh registry and
//! the discovery server together, then serves ADS until told to stop.

pub mod signals;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use beacon_common::{Version, VersionClock};
use beacon_config::Config;
use beacon_xds::{AdsServer, ChangeEvent, DiscoveryServer, MemRegistry};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use signals::{SignalManager, SignalType};

/// A configured, not yet running, control plane.
pub struct ControlPlane {
    config: Config,
    config_path: Option<PathBuf>,
    registry: Arc<MemRegistry>,
    discovery: DiscoveryServer,
    changes: Option<mpsc::UnboundedReceiver<ChangeEvent>>,
}

impl ControlPlane {
    /// Load and validate the configuration file, or use defaults when no
    /// path is given.
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let config = match config_path {
            Some(path) => {
                info!(path = %path.display(), "Loading configuration");
                Config::from_file(path)?
            }
            None => {
                info!("No configuration file given, using defaults");
                Config::default()
            }
        };
        Self::from_config(config, config_path.map(Path::to_path_buf))
    }

    /// Build from an already loaded configuration. `config_path` is where
    /// reloads read from.
    pub fn from_config(config: Config, config_path: Option<PathBuf>) -> Result<Self> {
        config.validate()?;

        let (changes_tx, changes_rx) = mpsc::unbounded_channel();
        let clock = Arc::new(VersionClock::new());
        let registry = Arc::new(MemRegistry::seeded(clock, changes_tx, &config.mesh));
        let discovery = DiscoveryServer::new(config.discovery.clone(), registry.clone())?;

        info!(
            version = %registry.version(),
            services = config.mesh.services.len(),
            endpoints = config.mesh.endpoints.len(),
            routes = config.mesh.routes.len(),
            listeners = config.mesh.listeners.len(),
            "Control plane configured"
        );

        Ok(Self {
            config,
            config_path,
            registry,
            discovery,
            changes: Some(changes_rx),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<MemRegistry> {
        &self.registry
    }

    pub fn discovery(&self) -> &DiscoveryServer {
        &self.discovery
    }

    /// Re-read the configuration file and replace the mesh with its
    /// `mesh` block.
    ///
    /// Returns `None` when there is no file to read. An invalid file
    /// leaves the current mesh untouched.
    pub fn reload_mesh(&self) -> Result<Option<Version>> {
        let Some(path) = &self.config_path else {
            warn!("No configuration file to reload from");
            return Ok(None);
        };

        let config = Config::from_file(path)?;
        config.validate()?;
        if config.server != self.config.server || config.discovery != self.config.discovery {
            warn!("Only the mesh block is reloaded, server and discovery changes need a restart");
        }

        let version = self.registry.replace(&config.mesh);
        info!(
            path = %path.display(),
            version = %version,
            services = config.mesh.services.len(),
            endpoints = config.mesh.endpoints.len(),
            "Reloaded mesh configuration"
        );
        Ok(Some(version))
    }

    /// JSON rendering of the registry version and every connection.
    pub async fn dump_state(&self) -> Result<String> {
        let connections = self.discovery.connections().summaries().await;
        let state = serde_json::json!({
            "version": self.registry.version(),
            "connections": connections,
        });
        Ok(serde_json::to_string_pretty(&state)?)
    }

    /// Resend everything to every proxy and log the current state.
    pub async fn resync(&self) -> Result<()> {
        self.discovery.resync()?;
        let state = self.dump_state().await?;
        let metrics = self.discovery.metrics().gather_text()?;
        info!("Forced resync, current state:\n{}", state);
        info!("Metrics:\n{}", metrics);
        Ok(())
    }

    async fn handle_signal(&self, signal: SignalType) {
        debug!(signal = ?signal, "Handling signal");
        match signal {
            SignalType::Reload => {
                if let Err(e) = self.reload_mesh() {
                    error!("Mesh reload failed, keeping current mesh: {:#}", e);
                }
            }
            SignalType::Resync => {
                if let Err(e) = self.resync().await {
                    error!("Resync failed: {:#}", e);
                }
            }
            SignalType::Shutdown => {}
        }
    }

    /// Serve ADS, reacting to OS signals until SIGINT or SIGTERM.
    pub async fn run(self) -> Result<()> {
        let signals = SignalManager::new();
        let listener = signals.listen().context("failed to install signal handlers")?;
        let result = self.run_with_signals(signals).await;
        listener.abort();
        result
    }

    /// Serve ADS, reacting to signals from `signals` until a shutdown.
    pub async fn run_with_signals(mut self, mut signals: SignalManager) -> Result<()> {
        let addr: SocketAddr = self
            .config
            .server
            .listen
            .parse()
            .with_context(|| format!("invalid listen address '{}'", self.config.server.listen))?;
        let changes = self
            .changes
            .take()
            .context("control plane is already running")?;
        let tasks = self.discovery.start(changes)?;

        let shutdown = CancellationToken::new();
        let server = AdsServer::new(self.discovery.clone());
        let mut serving = tokio::spawn(server.run(addr, shutdown.clone().cancelled_owned()));
        info!(listen = %addr, "Beacon control plane running");

        let exited = loop {
            tokio::select! {
                served = &mut serving => break Some(served),
                signal = signals.recv() => match signal {
                    Some(SignalType::Shutdown) | None => break None,
                    Some(signal) => self.handle_signal(signal).await,
                },
            }
        };

        let served = match exited {
            Some(served) => {
                warn!("ADS server stopped before shutdown was requested");
                served
            }
            None => {
                info!("Shutting down");
                shutdown.cancel();
                self.discovery.close_all();
                let timeout = Duration::from_secs(self.config.server.graceful_shutdown_timeout_secs);
                match tokio::time::timeout(timeout, &mut serving).await {
                    Ok(served) => served,
                    Err(_) => {
                        warn!(
                            timeout_secs = timeout.as_secs(),
                            "Graceful shutdown timed out, dropping remaining streams"
                        );
                        serving.abort();
                        Ok(Ok(()))
                    }
                }
            }
        };

        tasks.abort();
        served.context("ADS server task failed")??;
        info!("Shutdown complete");
        Ok(())
    }
}
