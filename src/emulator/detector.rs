//! Emulator detection - Locating installed emulator products on the host

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};
use tracing::{debug, warn};

use crate::platform;

/// Process names whose executable lives in an install root
const EMULATOR_PROCESSES: &[&str] = &["dnplayer", "dnconsole", "ldconsole"];

/// Finds candidate emulator install roots
#[async_trait]
pub trait EmulatorDetector: Send + Sync {
    /// Best-effort; a probe that fails is simply left out
    async fn detect_install_paths(&self) -> HashSet<PathBuf>;
}

/// Probes the registry, well-known folders, configured folders and the
/// executables of running emulator processes
#[derive(Debug, Clone, Default)]
pub struct SystemDetector {
    extra_paths: Vec<PathBuf>,
}

impl SystemDetector {
    pub fn new(extra_paths: Vec<PathBuf>) -> Self {
        Self { extra_paths }
    }
}

#[async_trait]
impl EmulatorDetector for SystemDetector {
    async fn detect_install_paths(&self) -> HashSet<PathBuf> {
        let extra = self.extra_paths.clone();
        let probe = tokio::task::spawn_blocking(move || {
            let mut candidates = platform::registry_install_dirs();
            candidates.extend(platform::well_known_install_dirs());
            candidates.extend(extra);
            candidates.extend(running_emulator_dirs());
            candidates
        });

        let candidates = match probe.await {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!("Emulator detection failed: {}", e);
                return HashSet::new();
            }
        };

        let found: HashSet<PathBuf> = candidates.into_iter().filter(|p| p.is_dir()).collect();
        debug!("Detected {} emulator install root(s)", found.len());
        found
    }
}

/// Install roots of emulator processes that are currently running
fn running_emulator_dirs() -> Vec<PathBuf> {
    let mut system = System::new();
    system.refresh_processes_specifics(
        ProcessesToUpdate::All,
        true,
        ProcessRefreshKind::new().with_exe(UpdateKind::OnlyIfNotSet),
    );

    system
        .processes()
        .values()
        .filter(|process| is_emulator_process(&process.name().to_string_lossy()))
        .filter_map(|process| process.exe().and_then(Path::parent).map(Path::to_path_buf))
        .collect()
}

fn is_emulator_process(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    let stem = name.strip_suffix(".exe").unwrap_or(&name);
    EMULATOR_PROCESSES.contains(&stem)
}
