//! Bot definitions - Automation profiles bound to one emulator instance

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::value::Value;

/// Run status of a bot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum BotStatus {
    /// Bot is not running
    #[default]
    Idle,
    /// Execution task has been spawned
    Starting,
    /// Script is executing in the sandbox
    Running,
    /// Cancellation requested, cleanup pending
    Stopping,
}

impl BotStatus {
    pub fn is_active(&self) -> bool {
        !matches!(self, Self::Idle)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Starting => "Starting",
            Self::Running => "Running",
            Self::Stopping => "Stopping",
        }
    }
}

impl std::fmt::Display for BotStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Reference from a bot to a stored script, with the bot's variable values
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptSetting {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub variables: BTreeMap<String, Value>,
}

impl ScriptSetting {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            variables: BTreeMap::new(),
        }
    }

    pub fn with_variable(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.variables.insert(key.into(), value.into());
        self
    }
}

/// Game account a bot cycles through. Credentials live in an external store;
/// only the identifying fields travel with the profile.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct AccountProfile {
    pub username: String,
    pub email: String,
    pub active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct BotSettings {
    pub ignore_cooldowns: bool,
    pub stop_instance_after_loop: bool,
}

fn default_true() -> bool {
    true
}

fn new_bot_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// A user-defined automation profile
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BotProfile {
    #[serde(default = "new_bot_id")]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub game: String,
    /// Reserved emulator instance name; blank means unassigned
    #[serde(default)]
    pub instance: String,
    #[serde(default)]
    pub scripts: Vec<ScriptSetting>,
    #[serde(default)]
    pub accounts: Vec<AccountProfile>,
    #[serde(default)]
    pub settings: BotSettings,
}

impl BotProfile {
    pub fn new(name: impl Into<String>, game: impl Into<String>) -> Self {
        Self {
            id: new_bot_id(),
            name: name.into(),
            game: game.into(),
            instance: String::new(),
            scripts: Vec::new(),
            accounts: Vec::new(),
            settings: BotSettings::default(),
        }
    }

    pub fn with_instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = instance.into();
        self
    }

    pub fn with_script(mut self, script: ScriptSetting) -> Self {
        self.scripts.push(script);
        self
    }

    pub fn has_instance(&self) -> bool {
        !self.instance.trim().is_empty()
    }

    pub fn enabled_scripts(&self) -> impl Iterator<Item = &ScriptSetting> {
        self.scripts.iter().filter(|s| s.enabled)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_json_fills_defaults() {
        let bot = BotProfile::from_json(
            r#"{"name": "Farmer", "scripts": [{"name": "daily", "variables": {"loops": 3}}]}"#,
        )
        .unwrap();

        assert_eq!(bot.id.len(), 32);
        assert!(!bot.has_instance());
        assert!(bot.scripts[0].enabled);
        assert_eq!(bot.scripts[0].variables["loops"].as_i64_or(0), 3);
    }

    #[test]
    fn enabled_scripts_skip_disabled_entries() {
        let mut off = ScriptSetting::new("b");
        off.enabled = false;
        let bot = BotProfile::new("x", "game")
            .with_script(ScriptSetting::new("a"))
            .with_script(off);

        let names: Vec<_> = bot.enabled_scripts().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["a"]);
    }
}
