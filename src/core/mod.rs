//! Core module - Application state, bot definitions, instance ownership and
//! bot execution

mod app_state;
mod bot;
mod log;
mod registry;
mod runner;
pub mod settings;
mod value;

pub use app_state::AppState;
pub use bot::{AccountProfile, BotProfile, BotSettings, BotStatus, ScriptSetting};
pub use log::{BotLogger, EventLog, LogEntry, LogLevel};
pub use registry::InstanceRegistry;
pub use runner::{BotRunnerService, RunnerConfig};
pub use settings::Settings;
pub use value::{Args, Value};
