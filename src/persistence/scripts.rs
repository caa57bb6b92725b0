//! Script library - JSON script models stored per game

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

use crate::core::settings::sanitize_file_name;
use crate::scripting::ScriptModel;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("script file {0:?} does not exist")]
    NotFound(PathBuf),

    #[error("failed to access {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid script file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Scripts live at `<root>/<game>/<name>.json`
#[derive(Debug, Clone)]
pub struct ScriptStore {
    root: PathBuf,
}

impl ScriptStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn game_directory(&self, game: &str) -> PathBuf {
        self.root.join(sanitize_file_name(game, "Game"))
    }

    pub fn path_for(&self, game: &str, name: &str) -> PathBuf {
        self.game_directory(game)
            .join(format!("{}.json", sanitize_file_name(name, "script")))
    }

    pub fn load(&self, game: &str, name: &str) -> Result<ScriptModel, StoreError> {
        Self::load_path(&self.path_for(game, name))
    }

    pub fn load_path(path: &Path) -> Result<ScriptModel, StoreError> {
        if !path.is_file() {
            return Err(StoreError::NotFound(path.to_path_buf()));
        }
        let json = std::fs::read_to_string(path).map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let model = serde_json::from_str(&json).map_err(|source| StoreError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        debug!("Loaded script {:?}", path);
        Ok(model)
    }

    /// Write `model` under its own game and name
    pub fn save(&self, model: &ScriptModel) -> Result<PathBuf, StoreError> {
        let path = self.path_for(&model.game, &model.name);
        let io_error = |source| StoreError::Io {
            path: path.clone(),
            source,
        };
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(io_error)?;
        }
        let json = serde_json::to_string_pretty(model).map_err(|source| StoreError::Parse {
            path: path.clone(),
            source,
        })?;
        std::fs::write(&path, json).map_err(io_error)?;
        Ok(path)
    }

    /// Script names available for `game`, sorted
    pub fn list(&self, game: &str) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(self.game_directory(game)) else {
            return Vec::new();
        };
        let mut names: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
            .filter_map(|path| path.file_stem().map(|s| s.to_string_lossy().into_owned()))
            .collect();
        names.sort();
        names
    }
}
