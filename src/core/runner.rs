//! Bot runner - One execution task per running bot
//!
//! Every accepted `start` gets its own cancellation token and run id. The
//! running table is the only owner of the token; whichever of `stop`,
//! `stop_all` or the task's own cleanup removes the entry first disposes of
//! it, and cleanup only touches an entry whose run id is still its own.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::bot::{BotProfile, BotStatus};
use super::log::{BotLogger, EventLog};
use super::settings::sanitize_file_name;
use crate::bridges::{self, BridgeContext, EngineFactory, TemplateCache};
use crate::emulator::EmulatorService;
use crate::persistence::ScriptStore;
use crate::scripting::{compose, LuaSandbox, Sandbox, ScriptError};

/// Run when none of a bot's scripts could be loaded
const SMOKE_TEST_SCRIPT: &str = "print('runner online')\nsleep(1000)\nprint('Done.')\n";

/// Where the runner finds scripts, templates and the OCR engine
pub struct RunnerConfig {
    pub scripts: ScriptStore,
    /// Root of the per-game asset folders
    pub games_directory: PathBuf,
    pub script_timeout: Duration,
    pub ocr_engine: EngineFactory,
}

struct RunningBot {
    handle: JoinHandle<()>,
    cancel: CancellationToken,
    run_id: u64,
}

#[derive(Default)]
struct RunnerState {
    running: HashMap<String, RunningBot>,
    status: HashMap<String, BotStatus>,
}

struct Inner {
    emulator: Arc<EmulatorService>,
    log: Arc<EventLog>,
    templates: Arc<TemplateCache>,
    config: RunnerConfig,
    runtime: Handle,
    state: Mutex<RunnerState>,
    status_tx: broadcast::Sender<(String, BotStatus)>,
    next_run: AtomicU64,
}

/// Starts, tracks and stops bots
#[derive(Clone)]
pub struct BotRunnerService {
    inner: Arc<Inner>,
}

impl BotRunnerService {
    /// Execution tasks are spawned on `runtime`
    pub fn new(
        emulator: Arc<EmulatorService>,
        log: Arc<EventLog>,
        templates: Arc<TemplateCache>,
        config: RunnerConfig,
        runtime: Handle,
    ) -> Self {
        let (status_tx, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(Inner {
                emulator,
                log,
                templates,
                config,
                runtime,
                state: Mutex::new(RunnerState::default()),
                status_tx,
                next_run: AtomicU64::new(1),
            }),
        }
    }

    /// Spawn the bot's execution task and return immediately. Returns false
    /// when the bot has no instance or is already running.
    pub fn start(&self, bot: &BotProfile) -> bool {
        if !bot.has_instance() {
            self.inner
                .log
                .warn(format!("Bot '{}' has no instance assigned; not starting.", bot.name));
            return false;
        }

        let mut state = self.inner.state();
        if state.running.contains_key(&bot.id) {
            self.inner
                .log
                .warn(format!("Bot '{}' is already running.", bot.name));
            return false;
        }

        let run_id = self.inner.next_run.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        self.inner.set_status(&mut state, &bot.id, BotStatus::Starting);

        // The task cannot observe the table before this guard drops
        let handle = self.inner.runtime.spawn(Inner::execute(
            Arc::clone(&self.inner),
            bot.clone(),
            cancel.clone(),
            run_id,
        ));
        state.running.insert(
            bot.id.clone(),
            RunningBot {
                handle,
                cancel,
                run_id,
            },
        );
        true
    }

    /// Request cancellation without waiting for the task
    pub fn stop(&self, bot_id: &str) -> bool {
        let mut state = self.inner.state();
        let Some(entry) = state.running.remove(bot_id) else {
            return false;
        };
        entry.cancel.cancel();
        self.inner.set_status(&mut state, bot_id, BotStatus::Stopping);
        self.inner
            .log
            .scoped(bot_id)
            .info("Stop requested.");
        true
    }

    /// Cancel every bot and forget all state immediately
    pub fn stop_all(&self) {
        let mut state = self.inner.state();
        let stopped: Vec<String> = state
            .running
            .drain()
            .map(|(bot_id, entry)| {
                entry.cancel.cancel();
                debug!("Detached task for bot {} (finished: {})", bot_id, entry.handle.is_finished());
                bot_id
            })
            .collect();
        state.status.clear();
        drop(state);

        for bot_id in &stopped {
            self.inner.broadcast_status(bot_id, BotStatus::Idle);
        }
        if !stopped.is_empty() {
            self.inner
                .log
                .info(format!("Stopped {} bot(s).", stopped.len()));
        }
    }

    pub fn status_snapshot(&self) -> HashMap<String, BotStatus> {
        self.inner.state().status.clone()
    }

    /// Unknown bots read as idle
    pub fn status(&self, bot_id: &str) -> BotStatus {
        self.inner
            .state()
            .status
            .get(bot_id)
            .copied()
            .unwrap_or_default()
    }

    pub fn is_running(&self, bot_id: &str) -> bool {
        self.inner.state().running.contains_key(bot_id)
    }

    pub fn running_count(&self) -> usize {
        self.inner.state().running.len()
    }

    /// Every status transition from now on
    pub fn subscribe_status(&self) -> broadcast::Receiver<(String, BotStatus)> {
        self.inner.status_tx.subscribe()
    }

    /// Resolve once no bot is running
    pub async fn wait_until_idle(&self) {
        let mut rx = self.subscribe_status();
        while self.running_count() > 0 {
            match rx.recv().await {
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, RunnerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_status(&self, state: &mut RunnerState, bot_id: &str, status: BotStatus) {
        state.status.insert(bot_id.to_string(), status);
        self.broadcast_status(bot_id, status);
    }

    fn broadcast_status(&self, bot_id: &str, status: BotStatus) {
        // No receivers is fine
        let _ = self.status_tx.send((bot_id.to_string(), status));
    }

    fn is_current(state: &RunnerState, bot_id: &str, run_id: u64) -> bool {
        state
            .running
            .get(bot_id)
            .is_some_and(|entry| entry.run_id == run_id)
    }

    async fn execute(self: Arc<Self>, bot: BotProfile, cancel: CancellationToken, run_id: u64) {
        let logger = self.log.scoped(&bot.id);
        logger.info(format!("Starting bot '{}' on '{}'.", bot.name, bot.instance));

        let outcome = {
            let inner = Arc::clone(&self);
            let bot = bot.clone();
            let logger = logger.clone();
            let cancel = cancel.clone();
            tokio::task::spawn_blocking(move || inner.run_script(&bot, &logger, &cancel, run_id)).await
        };

        match outcome {
            Ok(Ok(())) => logger.info("Bot finished."),
            Ok(Err(ScriptError::Cancelled)) => logger.info("Bot stopped."),
            Ok(Err(e)) => logger.error(format!("Bot failed: {}", e)),
            Err(e) => logger.error(format!("Bot task aborted: {}", e)),
        }

        self.finish(&bot.id, run_id);
    }

    /// Everything that touches the interpreter runs here, on one blocking
    /// thread
    fn run_script(
        &self,
        bot: &BotProfile,
        logger: &BotLogger,
        cancel: &CancellationToken,
        run_id: u64,
    ) -> Result<(), ScriptError> {
        let context = Arc::new(BridgeContext {
            instance: bot.instance.clone(),
            logger: logger.clone(),
            emulator: Arc::clone(&self.emulator),
            runtime: self.runtime.clone(),
            cancel: cancel.clone(),
        });
        let images = self
            .config
            .games_directory
            .join(sanitize_file_name(&bot.game, "Game"))
            .join("images");

        let sandbox = LuaSandbox::new(logger.clone(), self.runtime.clone(), self.config.script_timeout)?;
        for bridge in bridges::bridge_set(
            context,
            Arc::clone(&self.templates),
            images,
            Arc::clone(&self.config.ocr_engine),
        ) {
            sandbox.register_bridge(bridge)?;
        }

        let source = self.resolve_source(bot, logger);
        self.mark_running(&bot.id, run_id);
        sandbox.run(&source, cancel)
    }

    /// Enabled scripts transpiled and concatenated in order
    fn resolve_source(&self, bot: &BotProfile, logger: &BotLogger) -> String {
        let mut parts = Vec::new();
        for setting in bot.enabled_scripts() {
            match self.config.scripts.load(&bot.game, &setting.name) {
                Ok(model) => parts.push(compose(&model, &setting.variables)),
                Err(e) => logger.warn(format!("Script '{}' skipped: {}", setting.name, e)),
            }
        }

        if parts.is_empty() {
            logger.info("No scripts resolved; running the built-in check.");
            return SMOKE_TEST_SCRIPT.to_string();
        }
        parts.join("\n")
    }

    fn mark_running(&self, bot_id: &str, run_id: u64) {
        let mut state = self.state();
        if Self::is_current(&state, bot_id, run_id) {
            self.set_status(&mut state, bot_id, BotStatus::Running);
        }
    }

    fn finish(&self, bot_id: &str, run_id: u64) {
        let mut state = self.state();
        if Self::is_current(&state, bot_id, run_id) {
            state.running.remove(bot_id);
        }
        // A newer run owns the status now
        if !state.running.contains_key(bot_id) {
            self.set_status(&mut state, bot_id, BotStatus::Idle);
        }
    }
}
