//! Engine settings

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Engine settings, persisted as JSON in the settings table
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    // Emulators
    /// Extra install roots to probe in addition to the detected ones
    pub emulator_paths: Vec<PathBuf>,
    /// How long a detected instance topology stays fresh, in seconds
    pub refresh_interval_secs: u64,

    // Scripting
    /// Wall-clock limit for a single script run, in seconds
    pub script_timeout_secs: u64,
    /// Maximum number of decoded template images kept in memory
    pub template_cache_capacity: usize,

    // Text recognition
    /// Tesseract language code
    pub ocr_language: String,
    /// Explicit path to the tesseract executable (searched on PATH otherwise)
    pub tesseract_path: Option<PathBuf>,

    // Advanced
    /// Custom data directory
    pub data_directory: Option<PathBuf>,
    /// Number of log entries kept for the operator
    pub log_capacity: usize,
    /// Enable debug logging
    pub debug_logging: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            emulator_paths: Vec::new(),
            refresh_interval_secs: 15,

            script_timeout_secs: 30,
            template_cache_capacity: 64,

            ocr_language: "eng".to_string(),
            tesseract_path: None,

            data_directory: None,
            log_capacity: 500,
            debug_logging: false,
        }
    }
}

impl Settings {
    /// Get the data directory, using default if not set
    pub fn get_data_directory(&self) -> PathBuf {
        self.data_directory.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("emubot")
        })
    }

    /// Root of the per-game script folders
    pub fn get_scripts_directory(&self) -> PathBuf {
        self.get_data_directory().join("scripts")
    }

    /// Root of the per-game asset folders
    pub fn get_games_directory(&self) -> PathBuf {
        self.get_data_directory().join("games")
    }

    /// Where template images for `game` live
    pub fn get_images_directory(&self, game: &str) -> PathBuf {
        self.get_games_directory()
            .join(sanitize_file_name(game, "Game"))
            .join("images")
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn script_timeout(&self) -> Duration {
        Duration::from_secs(self.script_timeout_secs)
    }

    /// Validate settings and fix any invalid values
    pub fn validate(&mut self) {
        self.refresh_interval_secs = self.refresh_interval_secs.clamp(1, 3600);
        self.script_timeout_secs = self.script_timeout_secs.clamp(1, 24 * 3600);
        self.template_cache_capacity = self.template_cache_capacity.clamp(1, 4096);
        self.log_capacity = self.log_capacity.clamp(10, 100_000);
        if self.ocr_language.trim().is_empty() {
            self.ocr_language = "eng".to_string();
        }
    }
}

/// Make `value` safe to use as a single path component
pub fn sanitize_file_name(value: &str, fallback: &str) -> String {
    const INVALID: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];
    let cleaned: String = value
        .chars()
        .map(|c| {
            if INVALID.contains(&c) || c.is_control() {
                '_'
            } else {
                c
            }
        })
        .collect();
    let cleaned = cleaned.trim().trim_matches('.');
    if cleaned.is_empty() {
        fallback.to_string()
    } else {
        cleaned.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_clamps_out_of_range_values() {
        let mut settings = Settings {
            refresh_interval_secs: 0,
            template_cache_capacity: 0,
            ocr_language: " ".into(),
            ..Default::default()
        };
        settings.validate();
        assert_eq!(settings.refresh_interval_secs, 1);
        assert_eq!(settings.template_cache_capacity, 1);
        assert_eq!(settings.ocr_language, "eng");
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let settings: Settings = serde_json::from_str(r#"{"debug_logging": true}"#).unwrap();
        assert!(settings.debug_logging);
        assert_eq!(settings.script_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn sanitize_replaces_separators() {
        assert_eq!(sanitize_file_name("West/Game:2", "Game"), "West_Game_2");
        assert_eq!(sanitize_file_name("  ", "Game"), "Game");
    }

    #[test]
    fn images_directory_is_per_game() {
        let settings = Settings {
            data_directory: Some(PathBuf::from("/data")),
            ..Default::default()
        };
        assert_eq!(
            settings.get_images_directory("West Game"),
            PathBuf::from("/data/games/West Game/images")
        );
    }
}
