//! Beacon - main entry point
//!
//! An xDS control plane serving Envoy proxies over ADS.

use std::path::Path;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use beacon_common::{init_tracing, LogFormat};
use beacon_config::Config;
use beacon_server::ControlPlane;

/// Beacon - an xDS control plane for Envoy
#[derive(Parser, Debug)]
#[command(name = "beacon")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short = 'c', long = "config", env = "BEACON_CONFIG")]
    config: Option<String>,

    /// Test configuration and exit
    #[arg(short = 't', long = "test")]
    test: bool,

    /// Enable verbose logging (debug level)
    #[arg(long = "verbose")]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long = "log-json")]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate configuration file and exit
    Test {
        /// Configuration file to test
        #[arg(short = 'c', long = "config")]
        config: Option<String>,
    },
    /// Run the control plane (default)
    Run {
        /// Configuration file path
        #[arg(short = 'c', long = "config")]
        config: Option<String>,
    },
}

impl Cli {
    fn log_level(&self) -> &'static str {
        if self.verbose {
            "debug"
        } else {
            "info"
        }
    }

    fn log_format(&self) -> LogFormat {
        if self.log_json {
            LogFormat::Json
        } else {
            LogFormat::Text
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level(), cli.log_format())?;

    if cli.test {
        return test_config(cli.config.as_deref());
    }

    match cli.command {
        Some(Commands::Test { config }) => test_config(config.as_deref().or(cli.config.as_deref())),
        Some(Commands::Run { config }) => run_server(config.or(cli.config)),
        None => run_server(cli.config),
    }
}

/// Test configuration file and exit
fn test_config(config_path: Option<&str>) -> Result<()> {
    let config = match config_path {
        Some(path) => {
            info!("Testing configuration file: {}", path);
            Config::from_file(path).context("Failed to load configuration file")?
        }
        None => {
            info!("Testing default configuration");
            Config::default()
        }
    };

    let result = config.validate().context("Configuration validation failed")?;

    info!("Configuration test successful:");
    info!("  - listen address {}", config.server.listen);
    info!("  - {} service(s)", config.mesh.services.len());
    info!("  - {} endpoint(s)", config.mesh.endpoints.len());
    info!("  - {} route(s)", config.mesh.routes.len());
    info!("  - {} listener(s)", config.mesh.listeners.len());
    if !result.warnings.is_empty() {
        info!("  - {} warning(s)", result.warnings.len());
    }

    println!(
        "beacon: configuration file {} test is successful",
        config_path.unwrap_or("(default)")
    );

    Ok(())
}

/// Run the control plane until SIGINT or SIGTERM
fn run_server(config_path: Option<String>) -> Result<()> {
    info!("Starting Beacon control plane");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("beacon")
        .build()
        .context("Failed to build tokio runtime")?;

    runtime.block_on(async move {
        let plane = ControlPlane::load(config_path.as_deref().map(Path::new))
            .context("Failed to load configuration")?;
        plane.run().await
    })
}
