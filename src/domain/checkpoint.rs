//! The durable record of what a deployment has already done.
//!
//! On disk a checkpoint is a single JSON object: step result keys at the
//! top level and idempotent-action descriptions under `"config"`.
//!
//! ```json
//! {
//!   "Token": "0x1111111111111111111111111111111111111111",
//!   "config": { "Grant FUNDER_ROLE to 0xabc on 0x1111...": true }
//! }
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Key under which idempotent-action flags are nested
pub const CONFIG_KEY: &str = "config";

/// A value produced by a step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StepResult {
    /// Boolean "done" marker
    Flag(bool),

    /// Address or identifier
    Text(String),

    /// Anything else found in a hand-edited or newer document
    Other(serde_json::Value),
}

impl StepResult {
    /// Text form used when substituting into step arguments
    pub fn render(&self) -> String {
        match self {
            Self::Flag(flag) => flag.to_string(),
            Self::Text(text) => text.clone(),
            Self::Other(value) => value.to_string(),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }
}

impl From<String> for StepResult {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&str> for StepResult {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<bool> for StepResult {
    fn from(value: bool) -> Self {
        Self::Flag(value)
    }
}

/// Where a step records its completion
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RecordKey {
    /// Top-level result key of a creation step
    Result(String),

    /// Description of an idempotent action under `"config"`
    Action(String),
}

impl RecordKey {
    pub fn name(&self) -> &str {
        match self {
            Self::Result(key) | Self::Action(key) => key,
        }
    }
}

impl std::fmt::Display for RecordKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Mapping of committed step results and action flags
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    #[serde(flatten)]
    results: BTreeMap<String, StepResult>,

    #[serde(
        rename = "config",
        default,
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    config: BTreeMap<String, bool>,
}

impl Checkpoint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty() && self.config.is_empty()
    }

    /// Number of recorded results plus completed actions
    pub fn len(&self) -> usize {
        self.results.len() + self.config.values().filter(|done| **done).count()
    }

    pub fn get(&self, key: &str) -> Option<&StepResult> {
        self.results.get(key)
    }

    pub fn contains_result(&self, key: &str) -> bool {
        self.results.contains_key(key)
    }

    /// Whether an idempotent action has been marked complete
    pub fn is_action_done(&self, description: &str) -> bool {
        self.config.get(description).copied().unwrap_or(false)
    }

    pub fn contains(&self, record: &RecordKey) -> bool {
        match record {
            RecordKey::Result(key) => self.contains_result(key),
            RecordKey::Action(description) => self.is_action_done(description),
        }
    }

    /// Record a step result. Returns the previous value, if any.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<StepResult>) -> Option<StepResult> {
        self.results.insert(key.into(), value.into())
    }

    pub fn mark_action_done(&mut self, description: impl Into<String>) {
        self.config.insert(description.into(), true);
    }

    /// Record the outcome of a step against its record key
    pub fn record(&mut self, record: &RecordKey, value: StepResult) {
        match record {
            RecordKey::Result(key) => {
                self.results.insert(key.clone(), value);
            }
            RecordKey::Action(description) => self.mark_action_done(description.clone()),
        }
    }

    pub fn results(&self) -> impl Iterator<Item = (&str, &StepResult)> {
        self.results.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn actions(&self) -> impl Iterator<Item = (&str, bool)> {
        self.config.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn to_json_pretty(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_shape() {
        let mut checkpoint = Checkpoint::new();
        checkpoint.insert("Token", "0x111");
        checkpoint.mark_action_done("Grant FUNDER_ROLE to 0xabc on 0x111");

        let value = serde_json::to_value(&checkpoint).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "Token": "0x111",
                "config": { "Grant FUNDER_ROLE to 0xabc on 0x111": true }
            })
        );
    }

    #[test]
    fn test_tolerates_unknown_and_missing_keys() {
        let json = r#"{"Token":"0x111","Started":true,"gasUsed":12345}"#;
        let checkpoint: Checkpoint = serde_json::from_str(json).unwrap();

        assert_eq!(checkpoint.get("Token"), Some(&StepResult::from("0x111")));
        assert_eq!(checkpoint.get("Started"), Some(&StepResult::Flag(true)));
        assert_eq!(
            checkpoint.get("gasUsed"),
            Some(&StepResult::Other(serde_json::json!(12345)))
        );
        assert_eq!(checkpoint.actions().count(), 0);
    }

    #[test]
    fn test_false_action_flag_is_not_done() {
        let json = r#"{"config":{"Unpause 0x1":false}}"#;
        let checkpoint: Checkpoint = serde_json::from_str(json).unwrap();
        assert!(!checkpoint.is_action_done("Unpause 0x1"));
        assert!(!checkpoint.contains(&RecordKey::Action("Unpause 0x1".into())));
    }

    #[test]
    fn test_empty_config_is_omitted() {
        let mut checkpoint = Checkpoint::new();
        checkpoint.insert("Multisig", "0x222");
        assert_eq!(
            serde_json::to_string(&checkpoint).unwrap(),
            r#"{"Multisig":"0x222"}"#
        );
    }
}
