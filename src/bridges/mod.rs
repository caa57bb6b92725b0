//! Script bridges - Device, vision and OCR capabilities for bot scripts
//!
//! Bridge functions run on the sandbox thread and block it until the
//! underlying emulator operation finishes. Cancelling the bot aborts the
//! wait and the script with it.

mod device;
mod matching;
mod ocr;
mod vision;

use std::future::Future;
use std::sync::Arc;

use image::GrayImage;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

pub use ocr::{EngineFactory, OcrEngine, TesseractCli};
pub use vision::TemplateCache;

use device::DeviceBridge;
use ocr::OcrBridge;
use vision::VisionBridge;

use crate::core::BotLogger;
use crate::emulator::EmulatorService;
use crate::scripting::ScriptError;

/// What every bridge of one bot run shares
pub struct BridgeContext {
    pub instance: String,
    pub logger: BotLogger,
    pub emulator: Arc<EmulatorService>,
    pub runtime: Handle,
    pub cancel: CancellationToken,
}

impl BridgeContext {
    /// Wait for `future` on the host runtime, giving up once the bot is
    /// cancelled. Must not be called from an async context.
    pub fn block_on<F: Future>(&self, future: F) -> Result<F::Output, ScriptError> {
        self.runtime.block_on(async {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Err(ScriptError::Cancelled),
                output = future => Ok(output),
            }
        })
    }

    /// Current screen as grayscale. `Ok(None)` means no usable frame; the
    /// reason has already been logged.
    pub fn capture_gray(&self, purpose: &str) -> Result<Option<GrayImage>, ScriptError> {
        let (ok, bytes) = self.block_on(
            self.emulator
                .capture_raw_screenshot(&self.instance, &self.cancel),
        )?;
        if !ok || bytes.is_empty() {
            self.logger
                .warn(format!("{}: screenshot capture failed.", purpose));
            return Ok(None);
        }
        match image::load_from_memory(&bytes) {
            Ok(frame) => Ok(Some(frame.to_luma8())),
            Err(e) => {
                self.logger
                    .warn(format!("{}: screenshot could not be decoded: {}", purpose, e));
                Ok(None)
            }
        }
    }
}

/// Every bridge a bot run gets
pub fn bridge_set(
    context: Arc<BridgeContext>,
    templates: Arc<TemplateCache>,
    images_dir: std::path::PathBuf,
    ocr_engine: EngineFactory,
) -> Vec<Arc<dyn crate::scripting::ScriptBridge>> {
    vec![
        Arc::new(DeviceBridge::new(Arc::clone(&context))),
        Arc::new(VisionBridge::new(Arc::clone(&context), templates, images_dir)),
        Arc::new(OcrBridge::new(context, ocr_engine)),
    ]
}

#[cfg(test)]
pub(crate) mod testing {
    use std::io::Cursor;
    use std::time::Duration;

    use image::{DynamicImage, ImageFormat};

    use super::*;
    use crate::core::EventLog;
    use crate::emulator::testing::{FakeInstall, FakeRunner, StaticDetector};

    pub const INSTANCE: &str = "LDPlayer-0";

    pub fn png_bytes(frame: &GrayImage) -> Vec<u8> {
        let mut bytes = Vec::new();
        DynamicImage::ImageLuma8(frame.clone())
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        bytes
    }

    /// A context whose emulator answers screenshots with `frame`
    pub struct Harness {
        pub context: Arc<BridgeContext>,
        pub log: Arc<EventLog>,
        pub runner: Arc<FakeRunner>,
        _install: FakeInstall,
    }

    impl Harness {
        pub fn new(frame: Option<&GrayImage>) -> Self {
            let install = FakeInstall::new();
            let runner = FakeRunner::with_listing(&format!("name={}\nindex=0\n", INSTANCE));
            let runner = Arc::new(match frame {
                Some(frame) => runner.with_screenshot(png_bytes(frame)),
                None => runner,
            });
            let log = Arc::new(EventLog::new(100));
            let emulator = Arc::new(EmulatorService::new(
                Arc::new(StaticDetector::new([install.root()])),
                runner.clone(),
                Arc::clone(&log),
                Duration::from_secs(15),
            ));
            let context = Arc::new(BridgeContext {
                instance: INSTANCE.to_string(),
                logger: log.scoped("bot"),
                emulator,
                runtime: Handle::current(),
                cancel: CancellationToken::new(),
            });
            Self {
                context,
                log,
                runner,
                _install: install,
            }
        }

        pub fn warnings(&self) -> Vec<String> {
            self.log
                .recent_entries()
                .into_iter()
                .filter(|e| e.level == crate::core::LogLevel::Warning)
                .map(|e| e.message)
                .collect()
        }
    }
}
