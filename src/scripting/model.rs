//! Visual script model as stored in the script library

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::core::Value;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ScriptModel {
    pub name: String,
    pub game: String,
    pub author: String,
    pub steps: Vec<ScriptStep>,
    pub variables: Vec<ScriptVariable>,
}

/// One step; `kind` is `TAP`, `WAIT`, `INPUT`, `IF_IMAGE`, `LOG`, `LOOP`,
/// `ENDLOOP` or `CUSTOM`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ScriptStep {
    #[serde(rename = "type")]
    pub kind: String,
    pub params: BTreeMap<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action_if_found: Option<Vec<ScriptStep>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action_if_not_found: Option<Vec<ScriptStep>>,
}

impl ScriptStep {
    pub fn new(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            ..Default::default()
        }
    }

    pub fn with_param(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.params.insert(key.to_string(), value.into());
        self
    }

    /// Parameter `key`, or `Null` when absent
    pub fn param(&self, key: &str) -> &Value {
        static NULL: Value = Value::Null;
        self.params.get(key).unwrap_or(&NULL)
    }
}

/// A variable the script expects the bot to supply
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ScriptVariable {
    pub key: String,
    pub default: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    pub required: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_nested_steps_from_json() {
        let json = r#"{
            "name": "Daily",
            "game": "Duck Game",
            "steps": [
                { "type": "IF_IMAGE", "params": { "imagePath": "ok.png" },
                  "actionIfFound": [ { "type": "TAP", "params": { "x": 1, "y": 2 } } ] }
            ],
            "variables": [ { "key": "user", "default": "duck" } ]
        }"#;

        let model: ScriptModel = serde_json::from_str(json).unwrap();

        assert_eq!(model.author, "");
        assert_eq!(model.steps[0].kind, "IF_IMAGE");
        assert_eq!(model.steps[0].param("imagePath").as_str(), Some("ok.png"));
        let found = model.steps[0].action_if_found.as_ref().unwrap();
        assert_eq!(found[0].param("x").as_i64_or(0), 1);
        assert!(model.steps[0].action_if_not_found.is_none());
        assert_eq!(model.variables[0].default, "duck");
        assert!(!model.variables[0].required);
    }
}
