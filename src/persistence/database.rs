//! SQLite database implementation for persistent storage

use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, error, info};

use crate::core::{BotProfile, Settings};

/// File name of the database inside the data directory
pub const DATABASE_FILE: &str = "emubot.db";

/// Database wrapper for SQLite operations
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) the database inside `data_dir`
    pub fn open(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("Failed to create data directory {:?}", data_dir))?;
        let db_path = data_dir.join(DATABASE_FILE);

        let conn = Connection::open(&db_path)
            .context(format!("Failed to open database at {:?}", db_path))?;

        // WAL journal
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        info!("Database opened at {:?}", db_path);
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Private in-memory database
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Initialize database schema
    pub fn initialize(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            r#"
            -- Settings table
            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            -- Bot profiles
            CREATE TABLE IF NOT EXISTS bots (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                data TEXT NOT NULL
            );
            "#,
        )?;

        info!("Database schema initialized");
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Database lock poisoned: {}", e))
    }

    // === Settings ===

    /// Load settings from database
    pub fn load_settings(&self) -> Result<Option<Settings>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT value FROM settings WHERE key = 'engine_settings'")?;
        let result: Option<String> = stmt.query_row([], |row| row.get(0)).optional()?;

        match result {
            Some(json) => {
                let mut settings: Settings =
                    serde_json::from_str(&json).context("Failed to deserialize settings")?;
                settings.validate();
                Ok(Some(settings))
            }
            None => Ok(None),
        }
    }

    /// Save settings to database
    pub fn save_settings(&self, settings: &Settings) -> Result<()> {
        let conn = self.lock()?;
        let json = serde_json::to_string(settings)?;
        conn.execute(
            "INSERT OR REPLACE INTO settings (key, value) VALUES ('engine_settings', ?1)",
            params![json],
        )?;
        debug!("Settings saved");
        Ok(())
    }

    // === Bots ===

    /// Save a bot profile, replacing any previous version
    pub fn save_bot(&self, bot: &BotProfile) -> Result<()> {
        let conn = self.lock()?;
        let json = bot.to_json()?;
        conn.execute(
            "INSERT OR REPLACE INTO bots (id, name, data) VALUES (?1, ?2, ?3)",
            params![bot.id, bot.name, json],
        )?;
        debug!("Bot {} saved", bot.id);
        Ok(())
    }

    /// Load every bot profile, ordered by name. Rows that fail to parse are
    /// logged and skipped.
    pub fn load_all_bots(&self) -> Result<Vec<BotProfile>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT id, data FROM bots ORDER BY name COLLATE NOCASE, id")?;
        let rows = stmt.query_map([], |row| {
            let id: String = row.get(0)?;
            let json: String = row.get(1)?;
            Ok((id, json))
        })?;

        let mut result = Vec::new();
        for row in rows {
            let (id, json) = row?;
            match BotProfile::from_json(&json) {
                Ok(bot) => result.push(bot),
                Err(e) => error!("Failed to deserialize bot {}: {}", id, e),
            }
        }

        Ok(result)
    }

    /// Delete a bot profile; returns whether a row was removed
    pub fn delete_bot(&self, id: &str) -> Result<bool> {
        let conn = self.lock()?;
        let removed = conn.execute("DELETE FROM bots WHERE id = ?1", params![id])?;
        debug!("Bot {} deleted ({} row(s))", id, removed);
        Ok(removed > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ScriptSetting;

    fn database() -> Database {
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();
        db
    }

    #[test]
    fn settings_round_trip_through_validation() {
        let db = database();
        assert!(db.load_settings().unwrap().is_none());

        let settings = Settings {
            script_timeout_secs: 0,
            ocr_language: "deu".into(),
            ..Default::default()
        };
        db.save_settings(&settings).unwrap();

        let loaded = db.load_settings().unwrap().unwrap();
        assert_eq!(loaded.script_timeout_secs, 1);
        assert_eq!(loaded.ocr_language, "deu");
    }

    #[test]
    fn bots_are_saved_listed_and_deleted() {
        let db = database();
        let beta = BotProfile::new("beta", "Duck Game").with_instance("LDPlayer-1");
        let alpha = BotProfile::new("Alpha", "Duck Game")
            .with_script(ScriptSetting::new("daily").with_variable("user", "duck"));
        db.save_bot(&beta).unwrap();
        db.save_bot(&alpha).unwrap();

        let bots = db.load_all_bots().unwrap();
        assert_eq!(bots.len(), 2);
        assert_eq!(bots[0].name, "Alpha");
        assert_eq!(bots[0].scripts[0].variables["user"].to_text(), "duck");
        assert_eq!(bots[1].instance, "LDPlayer-1");

        assert!(db.delete_bot(&beta.id).unwrap());
        assert!(!db.delete_bot(&beta.id).unwrap());
        assert_eq!(db.load_all_bots().unwrap().len(), 1);
    }

    #[test]
    fn saving_again_replaces_the_row() {
        let db = database();
        let mut bot = BotProfile::new("bot", "Game");
        db.save_bot(&bot).unwrap();
        bot.instance = "LDPlayer-3".into();
        db.save_bot(&bot).unwrap();

        let bots = db.load_all_bots().unwrap();
        assert_eq!(bots.len(), 1);
        assert_eq!(bots[0].instance, "LDPlayer-3");
    }

    #[test]
    fn file_database_persists_between_opens() {
        let dir = tempfile::tempdir().unwrap();
        {
            let db = Database::open(dir.path()).unwrap();
            db.initialize().unwrap();
            db.save_bot(&BotProfile::new("kept", "Game")).unwrap();
        }
        let db = Database::open(dir.path()).unwrap();
        db.initialize().unwrap();
        assert_eq!(db.load_all_bots().unwrap()[0].name, "kept");
    }
}
