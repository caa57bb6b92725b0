//! Emulator service - Install/instance topology and device operations
//!
//! All interaction with emulators goes through two external binaries per
//! install: the console (instance lifecycle, listing) and the device bridge
//! (input injection, screenshots). Every call is best-effort: failures come
//! back as `false`/empty plus a log entry.

mod detector;
mod listing;
mod process;
#[cfg(test)]
pub(crate) mod testing;

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub use detector::{EmulatorDetector, SystemDetector};
pub use listing::{encode_input_text, parse_instance_listing};
pub use process::{CommandOutput, CommandRequest, CommandRunner, ProcessRunner};

use crate::core::EventLog;
use crate::platform::executable_name;

const CONSOLE_NAMES: &[&str] = &["dnconsole", "ldconsole"];
const BRIDGE_DIRS: &[&[&str]] = &[&[], &["adb"], &["tools"], &["tool"]];

/// Wake then home, used to bring an instance to the foreground
const FOCUS_KEY_EVENTS: &[u32] = &[224, 3];

/// A detected emulator installation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmulatorInstall {
    pub display_name: String,
    pub root_path: PathBuf,
    pub console_path: PathBuf,
    pub bridge_path: PathBuf,
}

/// An emulated device managed by an install
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmulatorInstance {
    pub name: String,
    pub index: u32,
    pub device_address: Option<String>,
    pub is_running: bool,
    pub install: Arc<EmulatorInstall>,
}

impl fmt::Display for EmulatorInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.install.display_name)
    }
}

#[derive(Default)]
struct Topology {
    installs: Vec<Arc<EmulatorInstall>>,
    instances: Vec<EmulatorInstance>,
    last_refresh: Option<Instant>,
    /// `path|resource` pairs already reported as missing
    reported_missing: HashSet<String>,
}

/// Cached emulator topology plus the operations that drive it
pub struct EmulatorService {
    detector: Arc<dyn EmulatorDetector>,
    runner: Arc<dyn CommandRunner>,
    log: Arc<EventLog>,
    freshness: Duration,
    topology: Mutex<Topology>,
}

impl EmulatorService {
    pub fn new(
        detector: Arc<dyn EmulatorDetector>,
        runner: Arc<dyn CommandRunner>,
        log: Arc<EventLog>,
        freshness: Duration,
    ) -> Self {
        Self {
            detector,
            runner,
            log,
            freshness,
            topology: Mutex::new(Topology::default()),
        }
    }

    /// Re-detect installs and re-list instances unless the cache is still
    /// fresh. Concurrent callers queue on the same lock, so only the first
    /// one does the work.
    pub async fn refresh(&self, force: bool, cancel: &CancellationToken) {
        let mut topology = self.topology.lock().await;
        let fresh = topology
            .last_refresh
            .is_some_and(|at| at.elapsed() < self.freshness);
        if !force && fresh && !topology.instances.is_empty() {
            return;
        }

        let mut paths: Vec<PathBuf> = self.detector.detect_install_paths().await.into_iter().collect();
        paths.sort();

        // Built aside so a cancelled refresh leaves the previous topology intact
        let mut installs = Vec::new();
        let mut instances = Vec::new();
        for path in paths {
            if cancel.is_cancelled() {
                break;
            }
            let Some(install) = self.create_install(&path, &mut topology.reported_missing) else {
                continue;
            };
            let install = Arc::new(install);
            instances.extend(self.query_instances(&install, cancel).await);
            installs.push(install);
        }
        if cancel.is_cancelled() {
            debug!("Refresh cancelled; keeping the previous topology");
            return;
        }

        topology.installs = installs;
        topology.instances = instances;
        topology.last_refresh = Some(Instant::now());
        debug!(
            "Topology refreshed: {} install(s), {} instance(s)",
            topology.installs.len(),
            topology.instances.len()
        );
    }

    /// Snapshot of all known instances
    pub async fn get_instances(
        &self,
        force_refresh: bool,
        cancel: &CancellationToken,
    ) -> Vec<EmulatorInstance> {
        self.refresh(force_refresh, cancel).await;
        self.topology.lock().await.instances.clone()
    }

    /// Snapshot of the detected installs
    pub async fn get_installs(&self, cancel: &CancellationToken) -> Vec<Arc<EmulatorInstall>> {
        self.refresh(false, cancel).await;
        self.topology.lock().await.installs.clone()
    }

    /// Instance names, deduplicated ignoring case and sorted
    pub async fn get_instance_names(
        &self,
        force_refresh: bool,
        cancel: &CancellationToken,
    ) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut names: Vec<String> = self
            .get_instances(force_refresh, cancel)
            .await
            .into_iter()
            .filter(|i| seen.insert(name_key(&i.name)))
            .map(|i| i.name)
            .collect();
        names.sort();
        names
    }

    pub async fn launch(&self, instance_name: &str, cancel: &CancellationToken) -> bool {
        self.with_instance(instance_name, cancel, |inst| async move {
            self.run_console(&inst.install, ["launch", "--name", inst.name.as_str()], cancel)
                .await
        })
        .await
    }

    pub async fn stop(&self, instance_name: &str, cancel: &CancellationToken) -> bool {
        self.with_instance(instance_name, cancel, |inst| async move {
            self.run_console(&inst.install, ["quit", "--name", inst.name.as_str()], cancel)
                .await
        })
        .await
    }

    /// Wake the device and return it to the home screen
    pub async fn focus(&self, instance_name: &str, cancel: &CancellationToken) -> bool {
        self.with_instance(instance_name, cancel, |inst| async move {
            if inst.device_address.is_none() {
                return false;
            }
            for code in FOCUS_KEY_EVENTS {
                self.run_bridge(&inst, ["shell".to_string(), format!("input keyevent {}", code)], cancel)
                    .await;
            }
            true
        })
        .await
    }

    pub async fn tap(&self, instance_name: &str, x: i64, y: i64, cancel: &CancellationToken) -> bool {
        self.shell(instance_name, &format!("input tap {} {}", x, y), cancel)
            .await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn swipe(
        &self,
        instance_name: &str,
        x1: i64,
        y1: i64,
        x2: i64,
        y2: i64,
        duration_ms: i64,
        cancel: &CancellationToken,
    ) -> bool {
        let command = format!("input swipe {} {} {} {} {}", x1, y1, x2, y2, duration_ms);
        self.shell(instance_name, &command, cancel).await
    }

    pub async fn input_text(&self, instance_name: &str, text: &str, cancel: &CancellationToken) -> bool {
        let command = format!("input text {}", encode_input_text(text));
        self.shell(instance_name, &command, cancel).await
    }

    pub async fn key_event(&self, instance_name: &str, key_code: i64, cancel: &CancellationToken) -> bool {
        self.shell(instance_name, &format!("input keyevent {}", key_code), cancel)
            .await
    }

    /// Run `command` through the device bridge shell
    pub async fn shell(&self, instance_name: &str, command: &str, cancel: &CancellationToken) -> bool {
        self.with_instance(instance_name, cancel, |inst| async move {
            self.run_bridge(&inst, ["shell", command], cancel)
                .await
                .success
        })
        .await
    }

    /// Raw PNG bytes of the current screen; decoding is up to the caller
    pub async fn capture_raw_screenshot(
        &self,
        instance_name: &str,
        cancel: &CancellationToken,
    ) -> (bool, Vec<u8>) {
        let Some(inst) = self.find_instance(instance_name, cancel).await else {
            self.log
                .warn(format!("Instance '{}' not found.", instance_name));
            return (false, Vec::new());
        };
        let output = self
            .run_bridge(&inst, ["exec-out", "screencap", "-p"], cancel)
            .await;
        (output.success, output.stdout)
    }

    async fn find_instance(
        &self,
        instance_name: &str,
        cancel: &CancellationToken,
    ) -> Option<EmulatorInstance> {
        if instance_name.trim().is_empty() {
            return None;
        }
        let wanted = name_key(instance_name.trim());
        self.get_instances(false, cancel)
            .await
            .into_iter()
            .find(|i| name_key(&i.name) == wanted)
    }

    async fn with_instance<F, Fut>(
        &self,
        instance_name: &str,
        cancel: &CancellationToken,
        action: F,
    ) -> bool
    where
        F: FnOnce(EmulatorInstance) -> Fut,
        Fut: Future<Output = bool>,
    {
        match self.find_instance(instance_name, cancel).await {
            Some(instance) => action(instance).await,
            None => {
                self.log
                    .warn(format!("Instance '{}' not found.", instance_name));
                false
            }
        }
    }

    fn create_install(
        &self,
        root: &Path,
        reported_missing: &mut HashSet<String>,
    ) -> Option<EmulatorInstall> {
        let mut report = |resource: &str| {
            if reported_missing.insert(format!("{}|{}", root.display(), resource)) {
                self.log.warn(format!(
                    "Emulator installation at '{}' skipped: missing {}.",
                    root.display(),
                    resource
                ));
            }
        };

        let Some(console_path) = CONSOLE_NAMES
            .iter()
            .map(|stem| root.join(executable_name(stem)))
            .find(|p| p.is_file())
        else {
            report("console executable");
            return None;
        };

        let Some(bridge_path) = BRIDGE_DIRS
            .iter()
            .map(|dirs| {
                let mut path = root.to_path_buf();
                path.extend(dirs.iter());
                path.join(executable_name("adb"))
            })
            .find(|p| p.is_file())
        else {
            report("device bridge executable");
            return None;
        };

        Some(EmulatorInstall {
            display_name: install_display_name(root),
            root_path: root.to_path_buf(),
            console_path,
            bridge_path,
        })
    }

    async fn query_instances(
        &self,
        install: &Arc<EmulatorInstall>,
        cancel: &CancellationToken,
    ) -> Vec<EmulatorInstance> {
        let request = CommandRequest::new(&install.console_path, &install.root_path)
            .arg("list2")
            .captured();
        let output = self.runner.run(request, cancel).await;
        if cancel.is_cancelled() {
            return Vec::new();
        }
        if let Some(reason) = &output.failure {
            self.log.error(format!(
                "Failed to enumerate instances for '{}': {}",
                install.root_path.display(),
                reason
            ));
            return Vec::new();
        }
        if !output.success {
            self.log.warn(format!(
                "[{}] console command 'list2' returned non-zero exit code.",
                install.display_name
            ));
        }

        parse_instance_listing(&output.stdout_text())
            .into_iter()
            .map(|listed| EmulatorInstance {
                name: listed.name,
                index: listed.index,
                device_address: listed.address,
                is_running: listed.is_running,
                install: Arc::clone(install),
            })
            .collect()
    }

    async fn run_console<I, S>(&self, install: &EmulatorInstall, args: I, cancel: &CancellationToken) -> bool
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let request = CommandRequest::new(&install.console_path, &install.root_path).args(args);
        let command_line = request.display();
        let output = self.runner.run(request, cancel).await;
        if cancel.is_cancelled() {
            debug!("[{}] '{}' cancelled", install.display_name, command_line);
            return false;
        }
        if let Some(reason) = &output.failure {
            self.log
                .error(format!("[{}] '{}' failed: {}", install.display_name, command_line, reason));
        } else if !output.success {
            self.log.warn(format!(
                "[{}] console command '{}' returned non-zero exit code.",
                install.display_name, command_line
            ));
        }
        output.success
    }

    async fn run_bridge<I, S>(
        &self,
        instance: &EmulatorInstance,
        args: I,
        cancel: &CancellationToken,
    ) -> CommandOutput
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let Some(address) = instance.device_address.as_deref() else {
            self.log
                .warn(format!("Device address unavailable for instance '{}'.", instance.name));
            return CommandOutput::failed("no device address");
        };

        let request = CommandRequest::new(&instance.install.bridge_path, &instance.install.root_path)
            .args(["-s", address])
            .args(args)
            .captured();
        let display = request.args.join(" ");
        let output = self.runner.run(request, cancel).await;

        if cancel.is_cancelled() {
            return output;
        }
        if let Some(reason) = &output.failure {
            self.log
                .error(format!("[{}] operation failed: {}", instance.name, reason));
        } else if !output.success {
            self.log
                .warn(format!("Device bridge command '{}' failed for '{}'.", display, instance.name));
        }
        if !output.stderr.is_empty() {
            self.log
                .warn(format!("Device bridge stderr for '{}': {}", instance.name, output.stderr));
        }
        output
    }
}

/// Case folding shared by name lookup and deduplication
fn name_key(name: &str) -> String {
    name.to_lowercase()
}

/// Product name inferred from the install folder
fn install_display_name(root: &Path) -> String {
    let path = root.to_string_lossy().to_ascii_lowercase();
    if path.contains("ldplayer9") {
        "LDPlayer 9".to_string()
    } else if path.contains("ldplayer4") || path.contains("4.0") {
        "LDPlayer 4".to_string()
    } else {
        "LDPlayer".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{FakeInstall, FakeRunner, StaticDetector};
    use super::*;

    fn service(install: &FakeInstall, runner: Arc<FakeRunner>) -> EmulatorService {
        EmulatorService::new(
            Arc::new(StaticDetector::new([install.root()])),
            runner,
            Arc::new(EventLog::new(100)),
            Duration::from_secs(15),
        )
    }

    #[test]
    fn display_name_follows_folder() {
        assert_eq!(install_display_name(Path::new(r"C:\LDPlayer\LDPlayer9")), "LDPlayer 9");
        assert_eq!(install_display_name(Path::new(r"C:\LDPlayer4.0\LDPlayer")), "LDPlayer 4");
        assert_eq!(install_display_name(Path::new("/opt/emu")), "LDPlayer");
    }

    #[tokio::test]
    async fn refresh_builds_topology_from_listing() {
        let install = FakeInstall::new();
        let runner = Arc::new(FakeRunner::with_listing("name=LDPlayer-0\nindex=0\nstatus=1\n\nname=ldplayer-0\nindex=1\n\nname=Alpha\nindex=2\n"));
        let service = service(&install, runner);
        let cancel = CancellationToken::new();

        let instances = service.get_instances(false, &cancel).await;
        assert_eq!(instances.len(), 3);
        assert!(instances[0].is_running);
        assert_eq!(instances[2].device_address.as_deref(), Some("127.0.0.1:5557"));

        let names = service.get_instance_names(false, &cancel).await;
        assert_eq!(names, ["Alpha", "LDPlayer-0"]);
    }

    #[tokio::test]
    async fn fresh_cache_skips_second_listing() {
        let install = FakeInstall::new();
        let runner = Arc::new(FakeRunner::with_listing("name=LDPlayer-0\nindex=0\n"));
        let service = Arc::new(service(&install, Arc::clone(&runner)));
        let cancel = CancellationToken::new();

        let (a, b) = tokio::join!(
            service.get_instances(false, &cancel),
            service.get_instances(false, &cancel)
        );
        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 1);
        assert_eq!(runner.count_matching(|args| args == ["list2"]), 1);

        service.refresh(true, &cancel).await;
        assert_eq!(runner.count_matching(|args| args == ["list2"]), 2);
    }

    #[tokio::test]
    async fn install_without_bridge_is_skipped() {
        let install = FakeInstall::without_bridge();
        let runner = Arc::new(FakeRunner::with_listing("name=LDPlayer-0\n"));
        let log = Arc::new(EventLog::new(100));
        let service = EmulatorService::new(
            Arc::new(StaticDetector::new([install.root()])),
            runner,
            Arc::clone(&log),
            Duration::from_secs(15),
        );

        assert!(service.get_instances(false, &CancellationToken::new()).await.is_empty());
        service.refresh(true, &CancellationToken::new()).await;

        let warnings = log
            .recent_entries()
            .into_iter()
            .filter(|e| e.message.contains("missing device bridge"))
            .count();
        assert_eq!(warnings, 1);
    }

    #[tokio::test]
    async fn device_operations_issue_bridge_shell_commands() {
        let install = FakeInstall::new();
        let runner = Arc::new(FakeRunner::with_listing("name=LDPlayer-0\nindex=2\n"));
        let service = service(&install, Arc::clone(&runner));
        let cancel = CancellationToken::new();

        assert!(service.tap("ldplayer-0", 10, 20, &cancel).await);
        assert!(service.input_text("LDPlayer-0", "ab 1!", &cancel).await);

        let calls = runner.bridge_calls();
        assert_eq!(calls[0], ["-s", "127.0.0.1:5557", "shell", "input tap 10 20"]);
        assert_eq!(calls[1], ["-s", "127.0.0.1:5557", "shell", "input text ab%s1\\u0021"]);
    }

    #[tokio::test]
    async fn focus_sends_wake_then_home() {
        let install = FakeInstall::new();
        let runner = Arc::new(FakeRunner::with_listing("name=LDPlayer-0\nindex=0\n"));
        let service = service(&install, Arc::clone(&runner));
        let cancel = CancellationToken::new();

        assert!(service.focus("LDPlayer-0", &cancel).await);
        assert!(!service.focus("Missing", &cancel).await);

        assert_eq!(
            runner.bridge_calls(),
            [
                ["-s", "127.0.0.1:5555", "shell", "input keyevent 224"],
                ["-s", "127.0.0.1:5555", "shell", "input keyevent 3"],
            ]
        );
    }

    #[tokio::test]
    async fn lookup_and_dedup_fold_case_alike() {
        let install = FakeInstall::new();
        let runner = Arc::new(FakeRunner::with_listing("name=ÉMU-1\nindex=0\n\nname=ému-1\nindex=1\n"));
        let service = service(&install, Arc::clone(&runner));
        let cancel = CancellationToken::new();

        assert_eq!(service.get_instance_names(false, &cancel).await, ["ÉMU-1"]);
        assert!(service.tap("ému-1", 1, 2, &cancel).await);
        assert_eq!(runner.bridge_calls()[0][1], "127.0.0.1:5555");
    }

    #[tokio::test]
    async fn cancelled_refresh_keeps_previous_topology_quietly() {
        let install = FakeInstall::new();
        let runner = Arc::new(
            FakeRunner::with_listing("name=LDPlayer-0\nindex=0\n").with_delay(Duration::from_millis(200)),
        );
        let log = Arc::new(EventLog::new(100));
        let service = EmulatorService::new(
            Arc::new(StaticDetector::new([install.root()])),
            Arc::clone(&runner) as Arc<dyn CommandRunner>,
            Arc::clone(&log),
            Duration::from_secs(15),
        );
        assert_eq!(service.get_instances(false, &CancellationToken::new()).await.len(), 1);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });
        service.refresh(true, &cancel).await;
        assert!(cancel.is_cancelled());

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });
        assert!(!service.launch("LDPlayer-0", &cancel).await);

        let instances = service.get_instances(false, &CancellationToken::new()).await;
        assert_eq!(instances.len(), 1);
        assert_eq!(runner.count_matching(|args| args == ["list2"]), 2);
        assert!(log
            .recent_entries()
            .iter()
            .all(|e| e.level != crate::core::LogLevel::Error));
    }

    #[tokio::test]
    async fn unknown_instance_fails_without_subprocess() {
        let install = FakeInstall::new();
        let runner = Arc::new(FakeRunner::with_listing("name=LDPlayer-0\n"));
        let service = service(&install, Arc::clone(&runner));

        assert!(!service.launch("Missing", &CancellationToken::new()).await);
        assert!(runner.bridge_calls().is_empty());
        assert_eq!(runner.count_matching(|args| args.first().map(String::as_str) == Some("launch")), 0);
    }

    #[tokio::test]
    async fn launch_and_quit_use_console_by_name() {
        let install = FakeInstall::new();
        let runner = Arc::new(FakeRunner::with_listing("name=LDPlayer-0\n"));
        let service = service(&install, Arc::clone(&runner));
        let cancel = CancellationToken::new();

        assert!(service.launch("LDPlayer-0", &cancel).await);
        assert!(service.stop("LDPlayer-0", &cancel).await);
        assert_eq!(runner.count_matching(|args| args == ["launch", "--name", "LDPlayer-0"]), 1);
        assert_eq!(runner.count_matching(|args| args == ["quit", "--name", "LDPlayer-0"]), 1);
    }

    #[tokio::test]
    async fn screenshot_returns_raw_bytes() {
        let install = FakeInstall::new();
        let runner = Arc::new(
            FakeRunner::with_listing("name=LDPlayer-0\n").with_screenshot(vec![1, 2, 3]),
        );
        let service = service(&install, runner);

        let (ok, bytes) = service
            .capture_raw_screenshot("LDPlayer-0", &CancellationToken::new())
            .await;
        assert!(ok);
        assert_eq!(bytes, [1, 2, 3]);
    }

    #[tokio::test]
    async fn non_zero_exit_is_reported_as_failure() {
        let install = FakeInstall::new();
        let runner = Arc::new(FakeRunner::with_listing("name=LDPlayer-0\n").failing_shell());
        let service = service(&install, runner);

        assert!(!service.key_event("LDPlayer-0", 4, &CancellationToken::new()).await);
    }
}
