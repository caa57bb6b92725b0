use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(about = "Run scripted bots against Android emulator instances", version)]
pub struct Args {
    /// Directory holding the database, scripts and game assets
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Enable debug logging regardless of the stored settings
    #[arg(long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List detected emulator instances
    Instances {
        /// Ignore the cached topology
        #[arg(long)]
        refresh: bool,
    },
    /// Start an emulator instance
    Launch { instance: String },
    /// Shut down an emulator instance
    Quit { instance: String },
    /// List stored bots
    Bots,
    /// Store a bot profile from a JSON file
    ImportBot { file: PathBuf },
    /// Delete a stored bot
    RemoveBot { id: String },
    /// Run bots until they finish or Ctrl-C is pressed
    Run {
        /// Bot ids or names; every stored bot when empty
        bots: Vec<String>,
    },
}
