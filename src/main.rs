//! emubot - Run scripted bots against many Android emulator instances
//!
//! Each bot is bound to one emulator instance and drives it through the
//! emulator's console and device-bridge tools from a sandboxed Lua script.

#![allow(dead_code)] // Service methods form the engine API beyond what the CLI uses

mod bridges;
mod cli;
mod core;
mod emulator;
mod persistence;
mod platform;
mod scripting;

use anyhow::{Context, Result};
use clap::Parser;
use single_instance::SingleInstance;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::cli::{Args, Command};
use crate::core::{AppState, BotProfile, Settings};
use crate::persistence::Database;

/// Application name constant
pub const APP_NAME: &str = "emubot";

/// Application version
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let data_dir = args
        .data_dir
        .clone()
        .unwrap_or_else(|| Settings::default().get_data_directory());
    let db = Database::open(&data_dir)?;
    db.initialize()?;

    let mut settings = db.load_settings()?.unwrap_or_default();
    if args.data_dir.is_some() {
        settings.data_directory = Some(data_dir);
    }
    init_logging(args.debug || settings.debug_logging);
    info!("{} v{} starting...", APP_NAME, APP_VERSION);

    // One engine per host
    let instance = SingleInstance::new(APP_NAME)
        .map_err(|e| anyhow::anyhow!("Failed to create single instance lock: {}", e))?;
    if !instance.is_single() {
        error!("Another instance of {} is already running!", APP_NAME);
        return Ok(());
    }

    let state = AppState::with_settings(db, settings, tokio::runtime::Handle::current())?;
    let result = execute(&state, args.command).await;

    info!("{} shutting down", APP_NAME);
    result
}

async fn execute(state: &AppState, command: Command) -> Result<()> {
    let cancel = CancellationToken::new();
    match command {
        Command::Instances { refresh } => {
            let instances = state.emulator.get_instances(refresh, &cancel).await;
            if instances.is_empty() {
                println!("No emulator instances found.");
            }
            for instance in instances {
                println!(
                    "{:<24} {:<12} {:<22} {}",
                    instance.name,
                    if instance.is_running { "running" } else { "stopped" },
                    instance.device_address.as_deref().unwrap_or("-"),
                    instance.install.display_name
                );
            }
        }
        Command::Launch { instance } => {
            if !state.emulator.launch(&instance, &cancel).await {
                anyhow::bail!("Failed to launch '{}'", instance);
            }
            println!("Launched '{}'.", instance);
        }
        Command::Quit { instance } => {
            if !state.emulator.stop(&instance, &cancel).await {
                anyhow::bail!("Failed to quit '{}'", instance);
            }
            println!("Stopped '{}'.", instance);
        }
        Command::Bots => {
            for bot in state.bots()? {
                let instance = if bot.has_instance() { bot.instance.as_str() } else { "-" };
                println!(
                    "{}  {:<20} {:<16} {:<16} {} script(s)",
                    bot.id,
                    bot.name,
                    bot.game,
                    instance,
                    bot.enabled_scripts().count()
                );
            }
        }
        Command::ImportBot { file } => {
            let json = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {:?}", file))?;
            let bot = BotProfile::from_json(&json)
                .with_context(|| format!("Invalid bot profile in {:?}", file))?;
            state.save_bot(&bot)?;
            println!("Imported '{}' as {}.", bot.name, bot.id);
        }
        Command::RemoveBot { id } => {
            if !state.remove_bot(&id)? {
                anyhow::bail!("No bot with id {}", id);
            }
            println!("Removed {}.", id);
        }
        Command::Run { bots } => run_bots(state, &bots).await?,
    }
    Ok(())
}

async fn run_bots(state: &AppState, keys: &[String]) -> Result<()> {
    let selected = if keys.is_empty() {
        state.bots()?
    } else {
        let mut selected = Vec::new();
        for key in keys {
            match state.find_bot(key)? {
                Some(bot) => selected.push(bot),
                None => warn!("No stored bot matches '{}'", key),
            }
        }
        selected
    };

    state.rebuild_registry()?;
    let started = selected.iter().filter(|bot| state.start_bot(bot)).count();
    if started == 0 {
        anyhow::bail!("No bots were started");
    }
    info!("Started {} bot(s)", started);

    tokio::select! {
        _ = state.runner.wait_until_idle() => info!("All bots finished"),
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for Ctrl-C")?;
            warn!("Interrupted, stopping bots");
            state.shutdown();
        }
    }
    Ok(())
}

/// Initialize the logging system
fn init_logging(debug: bool) {
    let default = if debug { "emubot=debug" } else { "emubot=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
