//! Application state - Composition root for the bot engine

use std::sync::{Arc, RwLock};

use anyhow::{Context, Result};
use tokio::runtime::Handle;
use tracing::{info, warn};

use super::bot::BotProfile;
use super::log::EventLog;
use super::registry::InstanceRegistry;
use super::runner::{BotRunnerService, RunnerConfig};
use super::settings::Settings;
use crate::bridges::{TemplateCache, TesseractCli};
use crate::emulator::{EmulatorService, ProcessRunner, SystemDetector};
use crate::persistence::{Database, ScriptStore};

/// Central application state
pub struct AppState {
    /// Engine settings
    pub settings: Arc<RwLock<Settings>>,
    /// Database connection
    pub database: Arc<Database>,
    /// Operator-facing log
    pub log: Arc<EventLog>,
    /// Advisory instance ownership
    pub registry: Arc<InstanceRegistry>,
    /// Emulator topology and device input
    pub emulator: Arc<EmulatorService>,
    /// Decoded templates shared by every bot
    pub templates: Arc<TemplateCache>,
    /// Bot execution
    pub runner: BotRunnerService,
}

impl AppState {
    /// Build every service from the stored settings. Must be called inside a
    /// tokio runtime.
    pub fn new(database: Database) -> Result<Self> {
        let settings = database.load_settings()?.unwrap_or_default();
        Self::with_settings(database, settings, Handle::current())
    }

    pub fn with_settings(database: Database, settings: Settings, runtime: Handle) -> Result<Self> {
        let data_dir = settings.get_data_directory();
        std::fs::create_dir_all(settings.get_scripts_directory())
            .with_context(|| format!("Failed to create data directories under {:?}", data_dir))?;
        std::fs::create_dir_all(settings.get_games_directory())?;

        let log = Arc::new(EventLog::new(settings.log_capacity));

        let emulator = Arc::new(EmulatorService::new(
            Arc::new(SystemDetector::new(settings.emulator_paths.clone())),
            Arc::new(ProcessRunner),
            Arc::clone(&log),
            settings.refresh_interval(),
        ));

        let templates = Arc::new(TemplateCache::new(settings.template_cache_capacity));

        let runner = BotRunnerService::new(
            Arc::clone(&emulator),
            Arc::clone(&log),
            Arc::clone(&templates),
            RunnerConfig {
                scripts: ScriptStore::new(settings.get_scripts_directory()),
                games_directory: settings.get_games_directory(),
                script_timeout: settings.script_timeout(),
                ocr_engine: TesseractCli::factory(
                    settings.tesseract_path.clone(),
                    settings.ocr_language.clone(),
                ),
            },
            runtime,
        );

        info!("Engine state initialized (data directory {:?})", data_dir);
        Ok(Self {
            settings: Arc::new(RwLock::new(settings)),
            database: Arc::new(database),
            log,
            registry: Arc::new(InstanceRegistry::new()),
            emulator,
            templates,
            runner,
        })
    }

    /// Snapshot of the current settings
    pub fn settings(&self) -> Result<Settings> {
        self.settings
            .read()
            .map(|s| s.clone())
            .map_err(|e| anyhow::anyhow!("Settings lock poisoned: {}", e))
    }

    /// Validate, store and persist new settings. Services built at startup
    /// keep their previous configuration.
    pub fn update_settings(&self, mut settings: Settings) -> Result<()> {
        settings.validate();
        self.database.save_settings(&settings)?;
        *self
            .settings
            .write()
            .map_err(|e| anyhow::anyhow!("Settings lock poisoned: {}", e))? = settings;
        Ok(())
    }

    // === Bots ===

    pub fn bots(&self) -> Result<Vec<BotProfile>> {
        self.database.load_all_bots()
    }

    /// Find a stored bot by id, or by case-insensitive name
    pub fn find_bot(&self, key: &str) -> Result<Option<BotProfile>> {
        let bots = self.bots()?;
        if let Some(bot) = bots.iter().find(|b| b.id == key) {
            return Ok(Some(bot.clone()));
        }
        Ok(bots.into_iter().find(|b| b.name.eq_ignore_ascii_case(key)))
    }

    pub fn save_bot(&self, bot: &BotProfile) -> Result<()> {
        self.database.save_bot(bot)?;
        info!("Saved bot '{}'", bot.name);
        Ok(())
    }

    /// Stop, release and forget a bot
    pub fn remove_bot(&self, bot_id: &str) -> Result<bool> {
        self.runner.stop(bot_id);
        self.registry.release_by_bot(bot_id);
        let removed = self.database.delete_bot(bot_id)?;
        if !removed {
            warn!("No stored bot with id {}", bot_id);
        }
        Ok(removed)
    }

    /// Reload instance ownership from the stored bot list
    pub fn rebuild_registry(&self) -> Result<()> {
        let bots = self.bots()?;
        self.registry
            .rebuild_from_bots(bots.iter().map(|b| (b.instance.as_str(), b.id.as_str())));
        Ok(())
    }

    /// Reserve the bot's instance and start it. Returns false when another
    /// bot owns the instance or the runner refuses the start.
    pub fn start_bot(&self, bot: &BotProfile) -> bool {
        if !self.registry.try_reserve(&bot.instance, &bot.id) {
            let owner = self.registry.owner(&bot.instance).unwrap_or_default();
            self.log.warn(format!(
                "Instance '{}' is already assigned to bot {}; '{}' not started.",
                bot.instance, owner, bot.name
            ));
            return false;
        }
        self.runner.start(bot)
    }

    /// Cancel every running bot
    pub fn shutdown(&self) {
        self.runner.stop_all();
        info!("All bots stopped");
    }
}
