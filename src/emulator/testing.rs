//! In-memory stand-ins for the detector and the process runner

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use super::{CommandOutput, CommandRequest, CommandRunner, EmulatorDetector};
use crate::platform::executable_name;

/// A temporary install root holding empty console and bridge executables
pub struct FakeInstall {
    dir: TempDir,
}

impl FakeInstall {
    pub fn new() -> Self {
        let install = Self::without_bridge();
        std::fs::write(install.dir.path().join(executable_name("adb")), b"").unwrap();
        install
    }

    pub fn without_bridge() -> Self {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(executable_name("dnconsole")), b"").unwrap();
        Self { dir }
    }

    pub fn root(&self) -> PathBuf {
        self.dir.path().to_path_buf()
    }
}

pub struct StaticDetector {
    paths: HashSet<PathBuf>,
}

impl StaticDetector {
    pub fn new(paths: impl IntoIterator<Item = PathBuf>) -> Self {
        Self {
            paths: paths.into_iter().collect(),
        }
    }
}

#[async_trait]
impl EmulatorDetector for StaticDetector {
    async fn detect_install_paths(&self) -> HashSet<PathBuf> {
        self.paths.clone()
    }
}

/// Records every request and answers `list2` and `screencap` from canned data
#[derive(Default)]
pub struct FakeRunner {
    listing: String,
    screenshot: Vec<u8>,
    shell_fails: bool,
    delay: Option<Duration>,
    requests: Mutex<Vec<CommandRequest>>,
}

impl FakeRunner {
    pub fn with_listing(listing: &str) -> Self {
        Self {
            listing: listing.to_string(),
            ..Default::default()
        }
    }

    pub fn with_screenshot(mut self, png: Vec<u8>) -> Self {
        self.screenshot = png;
        self
    }

    pub fn failing_shell(mut self) -> Self {
        self.shell_fails = true;
        self
    }

    /// Every call waits this long before answering
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn requests(&self) -> Vec<CommandRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn count_matching(&self, predicate: impl Fn(&[String]) -> bool) -> usize {
        self.requests()
            .iter()
            .filter(|r| predicate(&r.args))
            .count()
    }

    /// Argument lists of every device-bridge invocation, in order
    pub fn bridge_calls(&self) -> Vec<Vec<String>> {
        self.requests()
            .into_iter()
            .filter(|r| is_bridge(&r.program))
            .map(|r| r.args)
            .collect()
    }
}

fn is_bridge(program: &std::path::Path) -> bool {
    program.file_stem().is_some_and(|stem| stem == "adb")
}

#[async_trait]
impl CommandRunner for FakeRunner {
    async fn run(&self, request: CommandRequest, cancel: &CancellationToken) -> CommandOutput {
        self.requests.lock().unwrap().push(request.clone());

        if let Some(delay) = self.delay {
            tokio::select! {
                _ = cancel.cancelled() => return CommandOutput::failed("cancelled"),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        let args: Vec<&str> = request.args.iter().map(String::as_str).collect();
        match args.as_slice() {
            ["list2"] => CommandOutput::ok(self.listing.clone()),
            [.., "exec-out", "screencap", "-p"] => CommandOutput::ok(self.screenshot.clone()),
            [.., "shell", _] if self.shell_fails => CommandOutput::default(),
            _ => CommandOutput::ok(Vec::new()),
        }
    }
}
