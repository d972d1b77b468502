//! bgd — the blue/green daemon.
//!
//! # Usage
//!
//! ```text
//! bgd serve --config environments.toml --data-dir /var/lib/bluegreen --port 8080
//! bgd status --data-dir /var/lib/bluegreen --env beta
//! bgd settle --config environments.toml --data-dir /var/lib/bluegreen --env beta
//! bgd validate --config environments.toml
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use bgd::Standalone;
use bgd::standalone::STATE_FILE;
use bluegreen_core::BlueGreenConfig;
use bluegreen_state::{DeploymentStatus, StateStore};

#[derive(Parser)]
#[command(name = "bgd", about = "Blue/green deployment daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the orchestrator, scaler and REST API on a simulated cloud.
    Serve {
        /// Environment configuration (TOML).
        #[arg(long, default_value = "environments.toml")]
        config: PathBuf,

        /// Data directory for persistent state.
        #[arg(long, default_value = "/var/lib/bluegreen")]
        data_dir: PathBuf,

        /// Port to listen on.
        #[arg(long, default_value = "8080")]
        port: u16,

        /// Steady-state scaler interval in seconds.
        #[arg(long, default_value = "30")]
        scale_interval: u64,

        /// Emit logs as JSON lines.
        #[arg(long)]
        log_json: bool,
    },

    /// Print the committed deployment state as JSON.
    Status {
        #[arg(long, default_value = "/var/lib/bluegreen")]
        data_dir: PathBuf,

        /// Only this environment.
        #[arg(long)]
        env: Option<String>,
    },

    /// Clear deployment locks abandoned by a stopped daemon.
    ///
    /// Run while the daemon is stopped; `serve` does the same at startup.
    Settle {
        #[arg(long, default_value = "environments.toml")]
        config: PathBuf,

        #[arg(long, default_value = "/var/lib/bluegreen")]
        data_dir: PathBuf,

        /// Only this environment.
        #[arg(long)]
        env: Option<String>,
    },

    /// Parse and validate a configuration file.
    Validate {
        #[arg(long)]
        config: PathBuf,
    },
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,bgd=debug,bluegreen=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            config,
            data_dir,
            port,
            scale_interval,
            log_json,
        } => {
            init_tracing(log_json);
            serve(&config, &data_dir, port, scale_interval).await
        }
        Command::Status { data_dir, env } => {
            init_tracing(false);
            status(&data_dir, env.as_deref())
        }
        Command::Settle {
            config,
            data_dir,
            env,
        } => {
            init_tracing(false);
            settle(&config, &data_dir, env.as_deref()).await
        }
        Command::Validate { config } => {
            init_tracing(false);
            validate(&config)
        }
    }
}

async fn serve(
    config: &Path,
    data_dir: &Path,
    port: u16,
    scale_interval: u64,
) -> anyhow::Result<()> {
    info!(config = ?config, "blue/green daemon starting in standalone mode");
    let config = BlueGreenConfig::from_file(config)
        .with_context(|| format!("loading {}", config.display()))?;
    let daemon = Standalone::open(&config, data_dir)?;
    daemon.run(port, Duration::from_secs(scale_interval)).await
}

async fn settle(config: &Path, data_dir: &Path, env: Option<&str>) -> anyhow::Result<()> {
    let config = BlueGreenConfig::from_file(config)
        .with_context(|| format!("loading {}", config.display()))?;
    let daemon = Standalone::open(&config, data_dir)?;
    let reports = match env {
        Some(name) => vec![daemon.supervisor.orchestrator().settle(name).await?],
        None => daemon.recover().await,
    };
    println!("{}", serde_json::to_string_pretty(&reports)?);
    Ok(())
}

fn status(data_dir: &Path, env: Option<&str>) -> anyhow::Result<()> {
    let store = StateStore::open(&data_dir.join(STATE_FILE))?;
    let output = match env {
        Some(name) => serde_json::to_string_pretty(&DeploymentStatus::from(&store.read(name)?))?,
        None => {
            let statuses: Vec<DeploymentStatus> =
                store.list()?.iter().map(DeploymentStatus::from).collect();
            serde_json::to_string_pretty(&statuses)?
        }
    };
    println!("{output}");
    Ok(())
}

fn validate(path: &Path) -> anyhow::Result<()> {
    let config =
        BlueGreenConfig::from_file(path).with_context(|| format!("validating {}", path.display()))?;
    for env in &config.environments {
        println!(
            "{}: {} fleets {}/{}, capacity {} (min {}, max {}), active {}",
            env.name,
            env.label(),
            env.fleets.blue,
            env.fleets.green,
            env.working_capacity,
            env.min_size,
            env.max_size,
            env.initial_color,
        );
    }
    println!("ok: {} environment(s)", config.environments.len());
    Ok(())
}
