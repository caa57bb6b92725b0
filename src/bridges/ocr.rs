//! `ocr` bridge - Reading text from a screen region

use std::io::Cursor;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, OnceLock};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use image::{DynamicImage, GrayImage, ImageFormat};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::Mutex;

use super::BridgeContext;
use crate::core::{Args, Value};
use crate::platform;
use crate::scripting::{HostFn, ScriptBridge, ScriptError};

/// Turns a PNG image into text
#[async_trait]
pub trait OcrEngine: Send {
    async fn recognize(&mut self, png: Vec<u8>) -> Result<String>;
}

/// Builds the engine on first use
pub type EngineFactory = Arc<dyn Fn() -> Result<Box<dyn OcrEngine>> + Send + Sync>;

/// Runs the `tesseract` command line tool, one process per request
pub struct TesseractCli {
    program: PathBuf,
    language: String,
}

impl TesseractCli {
    /// Use `configured` if given, otherwise look for `tesseract` on `PATH`
    pub fn locate(configured: Option<PathBuf>, language: &str) -> Result<Self> {
        let program = match configured {
            Some(path) if path.is_file() => path,
            Some(path) => bail!("Tesseract not found at {}", path.display()),
            None => find_on_path(&platform::executable_name("tesseract"))
                .context("Tesseract is not installed or not on PATH")?,
        };
        Ok(Self {
            program,
            language: language.to_string(),
        })
    }

    /// Factory for the runner to hand to each OCR bridge
    pub fn factory(configured: Option<PathBuf>, language: String) -> EngineFactory {
        Arc::new(move || -> Result<Box<dyn OcrEngine>> {
            let engine = Self::locate(configured.clone(), &language)?;
            Ok(Box::new(engine) as Box<dyn OcrEngine>)
        })
    }
}

#[async_trait]
impl OcrEngine for TesseractCli {
    async fn recognize(&mut self, png: Vec<u8>) -> Result<String> {
        let mut cmd = Command::new(&self.program);
        cmd.args(["stdin", "stdout", "-l", self.language.as_str()])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        platform::hide_console_window(&mut cmd);

        let mut child = cmd.spawn().context("Failed to start tesseract")?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&png)
                .await
                .context("Failed to send image to tesseract")?;
        }

        let output = child
            .wait_with_output()
            .await
            .context("Failed to wait for tesseract")?;
        if !output.status.success() {
            bail!(
                "tesseract exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

fn find_on_path(file_name: &str) -> Option<PathBuf> {
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(file_name))
        .find(|candidate| candidate.is_file())
}

pub struct OcrBridge {
    ctx: Arc<BridgeContext>,
    factory: EngineFactory,
    /// `None` once construction has failed
    engine: OnceLock<Option<Mutex<Box<dyn OcrEngine>>>>,
}

impl OcrBridge {
    pub fn new(ctx: Arc<BridgeContext>, factory: EngineFactory) -> Self {
        Self {
            ctx,
            factory,
            engine: OnceLock::new(),
        }
    }

    /// Text inside the given screen rectangle; empty on any failure
    pub fn read_text(&self, x: i64, y: i64, width: i64, height: i64) -> Result<String, ScriptError> {
        let Some(frame) = self.ctx.capture_gray("ocr.readText")? else {
            return Ok(String::new());
        };
        let Some((x, y, w, h)) = clip_rect(frame.width(), frame.height(), x, y, width, height)
        else {
            return Ok(String::new());
        };

        let mut region = image::imageops::crop_imm(&frame, x, y, w, h).to_image();
        binarize(&mut region);

        let png = match encode_png(region) {
            Ok(png) => png,
            Err(e) => {
                self.ctx.logger.warn(format!("ocr.readText: {:#}", e));
                return Ok(String::new());
            }
        };

        let Some(engine) = self.engine() else {
            return Ok(String::new());
        };

        let result = self
            .ctx
            .block_on(async { engine.lock().await.recognize(png).await })?;
        match result {
            Ok(text) => Ok(text),
            Err(e) => {
                self.ctx.logger.warn(format!("ocr.readText: {:#}", e));
                Ok(String::new())
            }
        }
    }

    fn engine(&self) -> Option<&Mutex<Box<dyn OcrEngine>>> {
        self.engine
            .get_or_init(|| match (self.factory)() {
                Ok(engine) => Some(Mutex::new(engine)),
                Err(e) => {
                    self.ctx
                        .logger
                        .error(format!("OCR engine unavailable: {:#}", e));
                    None
                }
            })
            .as_ref()
    }
}

impl ScriptBridge for OcrBridge {
    fn name(&self) -> &str {
        "ocr"
    }

    fn exports(self: Arc<Self>) -> Vec<(&'static str, HostFn)> {
        let read_text: HostFn = Arc::new(move |args: &[Value]| {
            self.read_text(
                args.arg(0).as_i64_or(0),
                args.arg(1).as_i64_or(0),
                args.arg(2).as_i64_or(0),
                args.arg(3).as_i64_or(0),
            )
            .map(Value::String)
        });
        vec![("readText", read_text)]
    }
}

/// Intersection of the rectangle with a `frame_w`x`frame_h` frame
fn clip_rect(
    frame_w: u32,
    frame_h: u32,
    x: i64,
    y: i64,
    width: i64,
    height: i64,
) -> Option<(u32, u32, u32, u32)> {
    let left = x.max(0);
    let top = y.max(0);
    let right = x.saturating_add(width).min(i64::from(frame_w));
    let bottom = y.saturating_add(height).min(i64::from(frame_h));
    if right <= left || bottom <= top {
        return None;
    }
    Some((left as u32, top as u32, (right - left) as u32, (bottom - top) as u32))
}

/// Otsu's threshold: the gray level that maximizes between-class variance
pub fn otsu_threshold(image: &GrayImage) -> u8 {
    let mut histogram = [0u64; 256];
    for pixel in image.as_raw() {
        histogram[usize::from(*pixel)] += 1;
    }

    let total: u64 = histogram.iter().sum();
    if total == 0 {
        return 0;
    }
    let weighted_total: f64 = histogram
        .iter()
        .enumerate()
        .map(|(level, &count)| level as f64 * count as f64)
        .sum();

    let mut background = 0u64;
    let mut background_sum = 0.0;
    let mut best = (0u8, -1.0);

    for (level, &count) in histogram.iter().enumerate() {
        background += count;
        if background == 0 {
            continue;
        }
        let foreground = total - background;
        if foreground == 0 {
            break;
        }
        background_sum += level as f64 * count as f64;

        let mean_back = background_sum / background as f64;
        let mean_fore = (weighted_total - background_sum) / foreground as f64;
        let between = background as f64 * foreground as f64 * (mean_back - mean_fore).powi(2);
        if between > best.1 {
            best = (level as u8, between);
        }
    }
    best.0
}

fn binarize(image: &mut GrayImage) {
    let threshold = otsu_threshold(image);
    for pixel in image.pixels_mut() {
        pixel.0[0] = if pixel.0[0] > threshold { 255 } else { 0 };
    }
}

fn encode_png(region: GrayImage) -> Result<Vec<u8>> {
    let mut png = Vec::new();
    DynamicImage::ImageLuma8(region)
        .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
        .context("Failed to encode region")?;
    Ok(png)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::super::testing::Harness;
    use super::*;

    /// Answers with a fixed string and keeps the last image it saw
    struct FakeEngine {
        seen: Arc<std::sync::Mutex<Vec<u8>>>,
    }

    #[async_trait]
    impl OcrEngine for FakeEngine {
        async fn recognize(&mut self, png: Vec<u8>) -> Result<String> {
            *self.seen.lock().unwrap() = png;
            Ok("hello".to_string())
        }
    }

    fn screen() -> GrayImage {
        GrayImage::from_fn(40, 30, |x, _| image::Luma([if x < 20 { 30 } else { 220 }]))
    }

    #[test]
    fn clipping_handles_partial_and_disjoint_rectangles() {
        assert_eq!(clip_rect(100, 50, -10, -5, 30, 20), Some((0, 0, 20, 15)));
        assert_eq!(clip_rect(100, 50, 90, 40, 30, 30), Some((90, 40, 10, 10)));
        assert_eq!(clip_rect(100, 50, 200, 10, 5, 5), None);
        assert_eq!(clip_rect(100, 50, 10, 10, 0, 5), None);
    }

    #[test]
    fn otsu_separates_two_populations() {
        let threshold = otsu_threshold(&screen());
        assert!((30..220).contains(&threshold));
        assert_eq!(otsu_threshold(&GrayImage::new(0, 0)), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn reads_binarized_region_through_engine() {
        let harness = Harness::new(Some(&screen()));
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let built = Arc::new(AtomicUsize::new(0));
        let factory: EngineFactory = {
            let seen = Arc::clone(&seen);
            let built = Arc::clone(&built);
            Arc::new(move || -> Result<Box<dyn OcrEngine>> {
                built.fetch_add(1, Ordering::SeqCst);
                Ok(Box::new(FakeEngine { seen: Arc::clone(&seen) }) as Box<dyn OcrEngine>)
            })
        };
        let bridge = OcrBridge::new(Arc::clone(&harness.context), factory);

        let (first, second) = tokio::task::spawn_blocking(move || {
            (bridge.read_text(10, 5, 20, 10), bridge.read_text(0, 0, 5, 5))
        })
        .await
        .unwrap();

        assert_eq!(first, Ok("hello".to_string()));
        assert_eq!(second, Ok("hello".to_string()));
        assert_eq!(built.load(Ordering::SeqCst), 1);

        let region = image::load_from_memory(&seen.lock().unwrap()).unwrap().to_luma8();
        assert_eq!(region.dimensions(), (5, 5));
        assert!(region.pixels().all(|p| p.0[0] == 0 || p.0[0] == 255));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn disjoint_rectangle_reads_empty_text() {
        let harness = Harness::new(Some(&screen()));
        let factory: EngineFactory = Arc::new(|| -> Result<Box<dyn OcrEngine>> {
            Ok(Box::new(FakeEngine {
                seen: Arc::default(),
            }) as Box<dyn OcrEngine>)
        });
        let bridge = OcrBridge::new(Arc::clone(&harness.context), factory);

        let text = tokio::task::spawn_blocking(move || bridge.read_text(500, 500, 10, 10))
            .await
            .unwrap();

        assert_eq!(text, Ok(String::new()));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_engine_construction_is_remembered() {
        let harness = Harness::new(Some(&screen()));
        let attempts = Arc::new(AtomicUsize::new(0));
        let factory: EngineFactory = {
            let attempts = Arc::clone(&attempts);
            Arc::new(move || -> Result<Box<dyn OcrEngine>> {
                attempts.fetch_add(1, Ordering::SeqCst);
                bail!("no engine")
            })
        };
        let bridge = OcrBridge::new(Arc::clone(&harness.context), factory);

        let results = tokio::task::spawn_blocking(move || {
            (bridge.read_text(0, 0, 10, 10), bridge.read_text(0, 0, 10, 10))
        })
        .await
        .unwrap();

        assert_eq!(results, (Ok(String::new()), Ok(String::new())));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn locate_rejects_missing_configured_binary() {
        let dir = tempfile::tempdir().unwrap();
        assert!(TesseractCli::locate(Some(dir.path().join("tesseract")), "eng").is_err());
    }
}
