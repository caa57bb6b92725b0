//! `cv` bridge - Locating reference images on the instance's screen

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use image::GrayImage;
use tracing::debug;

use super::matching::best_match;
use super::BridgeContext;
use crate::core::{Args, Value};
use crate::scripting::{HostFn, ScriptBridge, ScriptError};

const DEFAULT_CONFIDENCE: f64 = 0.9;

/// Decoded reference images keyed by resolved path. Once full, the oldest
/// entry is evicted first.
pub struct TemplateCache {
    capacity: usize,
    entries: Mutex<CacheEntries>,
}

#[derive(Default)]
struct CacheEntries {
    images: HashMap<PathBuf, Arc<GrayImage>>,
    order: VecDeque<PathBuf>,
}

impl TemplateCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(CacheEntries::default()),
        }
    }

    /// Cached template, decoding it from disk on first use
    pub fn get_or_load(&self, path: &Path) -> Result<Arc<GrayImage>> {
        if let Some(image) = self.lookup(path) {
            return Ok(image);
        }

        // Decode outside the lock; a concurrent load of the same file just
        // replaces an identical entry
        let image = image::open(path)
            .with_context(|| format!("Failed to decode template {}", path.display()))?
            .to_luma8();
        let image = Arc::new(image);

        let mut entries = self
            .entries
            .lock()
            .map_err(|e| anyhow::anyhow!("Template cache lock poisoned: {}", e))?;
        if !entries.images.contains_key(path) {
            while entries.order.len() >= self.capacity {
                if let Some(oldest) = entries.order.pop_front() {
                    entries.images.remove(&oldest);
                }
            }
            entries.order.push_back(path.to_path_buf());
        }
        entries.images.insert(path.to_path_buf(), Arc::clone(&image));
        Ok(image)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.images.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lookup(&self, path: &Path) -> Option<Arc<GrayImage>> {
        self.entries
            .lock()
            .ok()
            .and_then(|e| e.images.get(path).cloned())
    }
}

pub struct VisionBridge {
    ctx: Arc<BridgeContext>,
    templates: Arc<TemplateCache>,
    images_dir: PathBuf,
}

impl VisionBridge {
    /// Relative template paths resolve against `images_dir`
    pub fn new(ctx: Arc<BridgeContext>, templates: Arc<TemplateCache>, images_dir: PathBuf) -> Self {
        Self {
            ctx,
            templates,
            images_dir,
        }
    }

    /// Whether `image_path` appears on screen with at least `confidence`
    pub fn find(&self, image_path: &str, confidence: f64) -> Result<bool, ScriptError> {
        let image_path = image_path.trim();
        if image_path.is_empty() {
            self.ctx.logger.warn("cv.find: no image path given.");
            return Ok(false);
        }

        let path = self.resolve(image_path);
        if !path.is_file() {
            self.ctx
                .logger
                .warn(format!("cv.find: template '{}' not found.", path.display()));
            return Ok(false);
        }

        let template = match self.templates.get_or_load(&path) {
            Ok(template) => template,
            Err(e) => {
                self.ctx.logger.warn(format!("cv.find: {:#}", e));
                return Ok(false);
            }
        };

        let Some(frame) = self.ctx.capture_gray("cv.find")? else {
            return Ok(false);
        };

        match best_match(&frame, &template) {
            Some(found) => {
                debug!(
                    "cv.find {} best score {:.3} at ({}, {})",
                    image_path, found.score, found.x, found.y
                );
                Ok(found.score >= confidence)
            }
            None => {
                self.ctx.logger.warn(format!(
                    "cv.find: template '{}' ({}x{}) is larger than the screen ({}x{}).",
                    image_path,
                    template.width(),
                    template.height(),
                    frame.width(),
                    frame.height()
                ));
                Ok(false)
            }
        }
    }

    fn resolve(&self, image_path: &str) -> PathBuf {
        let path = Path::new(image_path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.images_dir.join(path)
        }
    }
}

impl ScriptBridge for VisionBridge {
    fn name(&self) -> &str {
        "cv"
    }

    fn exports(self: Arc<Self>) -> Vec<(&'static str, HostFn)> {
        let find: HostFn = Arc::new(move |args: &[Value]| {
            self.find(
                &args.arg(0).to_text(),
                args.arg(1).as_f64_or(DEFAULT_CONFIDENCE),
            )
            .map(Value::Bool)
        });
        vec![("find", find)]
    }
}
