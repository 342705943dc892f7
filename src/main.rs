pub mod config;
pub mod controller;
pub mod daemon;
pub mod ipc;
pub mod library;
pub mod mapping;
pub mod persistence;

use crate::config::{AppConfig, ConfigPaths};
use crate::controller::device::{select_gamepad, GilrsBackend};
use crate::daemon::Daemon;
use crate::ipc::{IpcClient, Message, Request};
use crate::library::{merge, Catalog, LibraryScanner};
use crate::persistence::RecentList;
use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Directory holding config.toml, bindings.toml and recent.toml
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone)]
enum Commands {
    /// Run the controller daemon (default)
    Daemon,
    /// Scan the game library once and print it
    Library {
        /// Print the catalog as JSON
        #[arg(long)]
        json: bool,
    },
    /// Ask the running daemon to re-read bindings.toml
    Reload,
    /// List connected gamepads and mark the one the selector picks
    Controllers,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup()?;

    let paths = ConfigPaths::resolve(args.config_dir)?;
    let config = AppConfig::load(&paths.config_file()).await;

    match args.cmd.unwrap_or(Commands::Daemon) {
        Commands::Daemon => run_daemon(config, paths).await,
        Commands::Library { json } => print_library(config, paths, json).await,
        Commands::Reload => reload_daemon(config).await,
        Commands::Controllers => list_controllers(config),
    }
}

async fn run_daemon(config: AppConfig, paths: ConfigPaths) -> Result<()> {
    let handle = Daemon::new(config, paths).start().await?;
    handle.run_until_signal().await
}

async fn reload_daemon(config: AppConfig) -> Result<()> {
    let socket = config.ipc.socket_path();
    let mut client = IpcClient::connect(&socket)
        .await
        .map_err(|e| eyre!("No daemon on {}: {}", socket.display(), e))?;
    match client.request(&Request::ReloadBindings).await? {
        Message::Ok => {
            info!("Daemon reloaded its bindings");
            Ok(())
        }
        Message::Error { message } => Err(eyre!("Daemon refused: {}", message)),
        other => Err(eyre!("Unexpected reply: {:?}", other)),
    }
}

fn list_controllers(config: AppConfig) -> Result<()> {
    let (device, _) = config.controller.split();
    let pads = GilrsBackend::new(device.joystick_deadzone).gamepads()?;
    if pads.is_empty() {
        println!("No controllers connected");
        return Ok(());
    }

    let chosen = select_gamepad(&pads, device.selector.as_deref());
    for (index, pad) in pads.iter().enumerate() {
        let marker = if chosen == Some(index) { "*" } else { " " };
        println!("{} {:>3}  {}", marker, pad.id, pad.name);
    }
    match (chosen, device.selector.as_deref()) {
        (None, Some(selector)) => warn!("No connected gamepad matches \"{}\"", selector),
        (Some(_), _) | (None, None) => {}
    }
    Ok(())
}

async fn print_library(config: AppConfig, paths: ConfigPaths, json: bool) -> Result<()> {
    let scanner = LibraryScanner::from_settings(&config.library);
    let cancel = CancellationToken::new();

    let watcher = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, abandoning scan");
            watcher.cancel();
        }
    });

    let report = scanner.scan_cycle(&cancel).await;
    if cancel.is_cancelled() {
        return Err(eyre!("Library scan interrupted"));
    }
    for outcome in &report.outcomes {
        if let Err(e) = &outcome.result {
            info!("{}: {}", outcome.source, e);
        }
    }

    let recent = RecentList::load(&paths.recent_file(), config.library.recent_cap).await;
    let catalog = Catalog {
        games: merge(report.records),
        recent: recent.entries().to_vec(),
    };

    if json {
        let out = serde_json::to_string_pretty(&catalog)
            .map_err(|e| eyre!("Failed to serialize catalog: {}", e))?;
        println!("{}", out);
        return Ok(());
    }

    if catalog.recent_games().next().is_some() {
        println!("Recently played:");
        for game in catalog.recent_games() {
            println!("  {}", game.name);
        }
        println!();
    }
    println!("{} games:", catalog.games.len());
    for game in &catalog.games {
        println!("  {:<40} {:<8} {}", game.name, game.source.to_string(), game.id);
    }
    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    // stdout belongs to `library` output
    FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();
}
