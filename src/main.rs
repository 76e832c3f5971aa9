//! CLI entry point for the SCPI emulator
//!
//! # Usage
//!
//! Serve every instrument in a table:
//! ```bash
//! scpi-emulator serve --table instruments.csv
//! ```
//!
//! Serve and keep a console open:
//! ```bash
//! scpi-emulator serve --table instruments.csv --interactive
//! ```
//!
//! Write an example table:
//! ```bash
//! scpi-emulator example-table instruments.csv
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use scpi_emulator::config::{write_example_table, EmulatorConfig};
use scpi_emulator::logging;
use scpi_emulator::monitor::CommandLog;
use scpi_emulator::network::ServerManager;
use scpi_emulator::shell::Shell;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "scpi-emulator", version)]
#[command(about = "Emulates SCPI instruments over TCP from a command table", long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true, default_value = "emulator.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start listeners for every configured instrument
    Serve {
        /// CSV command table (overrides `table` in the config)
        #[arg(long)]
        table: Option<PathBuf>,

        /// Listen address
        #[arg(long)]
        host: Option<String>,

        /// First port for instruments without one
        #[arg(long)]
        port_start: Option<u16>,

        /// Open the console while serving
        #[arg(long, short)]
        interactive: bool,
    },

    /// Open the console without starting listeners
    Shell {
        /// CSV command table to load first
        #[arg(long)]
        table: Option<PathBuf>,
    },

    /// Write an example CSV command table
    ExampleTable {
        #[arg(default_value = "scpi_instruments_example.csv")]
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::ExampleTable { path } = &cli.command {
        write_example_table(path)
            .with_context(|| format!("failed to write {}", path.display()))?;
        println!("Created example table: {}", path.display());
        return Ok(());
    }

    let mut config = EmulatorConfig::load_from(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;

    match cli.command {
        Commands::Serve {
            table,
            host,
            port_start,
            interactive,
        } => {
            config.table = table.or(config.table);
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port_start) = port_start {
                config.server.port_start = port_start;
            }
            serve(config, interactive).await
        }
        Commands::Shell { table } => {
            config.table = table.or(config.table);
            console(config).await
        }
        Commands::ExampleTable { .. } => Ok(()),
    }
}

async fn prepare(config: &EmulatorConfig) -> Result<(Arc<ServerManager>, CommandLog)> {
    config.validate()?;
    logging::init_from_config(config)?;
    info!(name = %config.application.name, "Starting");

    let manager = Arc::new(ServerManager::from_config(config));
    let log = CommandLog::default();
    log.attach(manager.events());

    let definitions = config
        .instrument_definitions()
        .context("failed to load instrument definitions")?;
    if !definitions.is_empty() {
        manager.load(definitions).await?;
    }
    Ok((manager, log))
}

async fn serve(config: EmulatorConfig, interactive: bool) -> Result<()> {
    let (manager, log) = prepare(&config).await?;
    if manager.list().await.is_empty() {
        bail!("no instruments configured; pass --table or add [[instruments]] to the config");
    }

    for addr in manager.start_all().await? {
        println!("Listening on {addr}");
    }

    if interactive {
        let shell = Shell::new(manager.clone(), log);
        tokio::select! {
            result = shell.run() => result?,
            _ = tokio::signal::ctrl_c() => info!("Interrupted"),
        }
    } else {
        println!("Press Ctrl-C to stop");
        tokio::signal::ctrl_c()
            .await
            .context("failed to listen for Ctrl-C")?;
        info!("Interrupted");
    }

    shutdown(&manager).await;
    Ok(())
}

async fn console(config: EmulatorConfig) -> Result<()> {
    let (manager, log) = prepare(&config).await?;
    let shell = Shell::new(manager.clone(), log);
    tokio::select! {
        result = shell.run() => result?,
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
    }
    shutdown(&manager).await;
    Ok(())
}

async fn shutdown(manager: &ServerManager) {
    if let Err(e) = manager.stop_all().await {
        warn!(error = %e, "Shutdown finished with errors");
    }
    info!("Stopped");
}
