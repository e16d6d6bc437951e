//! Pipeline stage definitions

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Timeout applied to a stage that does not declare one
pub const DEFAULT_STAGE_TIMEOUT_SECS: u64 = 3600;

/// Kind of work a stage performs
///
/// The kind selects the default execution image and the artifact list
/// recorded for a successful stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageKind {
    Build,
    Test,
    SecurityScan,
    CodeAnalysis,
    Deploy,
    Notification,
    Approval,
    Rollback,
}

impl StageKind {
    pub const ALL: [StageKind; 8] = [
        StageKind::Build,
        StageKind::Test,
        StageKind::SecurityScan,
        StageKind::CodeAnalysis,
        StageKind::Deploy,
        StageKind::Notification,
        StageKind::Approval,
        StageKind::Rollback,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::Build => "BUILD",
            StageKind::Test => "TEST",
            StageKind::SecurityScan => "SECURITY_SCAN",
            StageKind::CodeAnalysis => "CODE_ANALYSIS",
            StageKind::Deploy => "DEPLOY",
            StageKind::Notification => "NOTIFICATION",
            StageKind::Approval => "APPROVAL",
            StageKind::Rollback => "ROLLBACK",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StageKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown stage kind '{}'", s))
    }
}

/// One stage of a pipeline configuration
///
/// Immutable once the pipeline is triggered. Field names follow the camelCase
/// shape used by the trigger routes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageDefinition {
    /// Unique within the run
    pub name: String,

    #[serde(rename = "type")]
    pub kind: StageKind,

    #[serde(default)]
    pub commands: Vec<String>,

    /// Optional script executed after `commands`
    #[serde(default)]
    pub script: Option<String>,

    #[serde(default)]
    pub environment: HashMap<String, String>,

    /// Explicit image; the stage kind's default is used when absent
    #[serde(default)]
    pub image: Option<String>,

    #[serde(default)]
    pub working_directory: Option<String>,

    /// Zero disables the timeout
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    #[serde(default)]
    pub continue_on_error: bool,

    /// Declared for forward compatibility; stages always run sequentially.
    #[serde(default)]
    pub parallel: bool,
}

fn default_timeout() -> u64 {
    DEFAULT_STAGE_TIMEOUT_SECS
}

impl StageDefinition {
    /// Creates a stage with the given commands and default settings
    pub fn new(name: impl Into<String>, kind: StageKind, commands: Vec<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            commands,
            script: None,
            environment: HashMap::new(),
            image: None,
            working_directory: None,
            timeout: DEFAULT_STAGE_TIMEOUT_SECS,
            continue_on_error: false,
            parallel: false,
        }
    }

    pub fn continue_on_error(mut self, value: bool) -> Self {
        self.continue_on_error = value;
        self
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout = seconds;
        self
    }

    /// Command list followed by the script, if any
    pub fn command_list(&self) -> Vec<String> {
        let mut commands = self.commands.clone();
        if let Some(script) = self.script.as_ref().filter(|s| !s.trim().is_empty()) {
            commands.push(script.clone());
        }
        commands
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_definition_defaults() {
        let stage: StageDefinition = serde_json::from_value(serde_json::json!({
            "name": "build",
            "type": "BUILD",
            "commands": ["npm ci", "npm run build"]
        }))
        .unwrap();

        assert_eq!(stage.kind, StageKind::Build);
        assert_eq!(stage.timeout, DEFAULT_STAGE_TIMEOUT_SECS);
        assert!(!stage.continue_on_error);
        assert!(!stage.parallel);
        assert!(stage.environment.is_empty());
    }

    #[test]
    fn test_stage_definition_camel_case_fields() {
        let stage: StageDefinition = serde_json::from_value(serde_json::json!({
            "name": "scan",
            "type": "SECURITY_SCAN",
            "continueOnError": true,
            "workingDirectory": "app",
            "timeout": 30
        }))
        .unwrap();

        assert_eq!(stage.kind, StageKind::SecurityScan);
        assert!(stage.continue_on_error);
        assert_eq!(stage.working_directory.as_deref(), Some("app"));
        assert_eq!(stage.timeout, 30);
    }

    #[test]
    fn test_command_list_appends_script() {
        let mut stage = StageDefinition::new("test", StageKind::Test, vec!["npm ci".to_string()]);
        stage.script = Some("npm test".to_string());

        assert_eq!(stage.command_list(), vec!["npm ci", "npm test"]);

        stage.script = Some("   ".to_string());
        assert_eq!(stage.command_list(), vec!["npm ci"]);
    }

    #[test]
    fn test_stage_kind_parse() {
        for kind in StageKind::ALL {
            assert_eq!(kind.as_str().parse::<StageKind>().unwrap(), kind);
        }
        assert!("DEPLOYMENT".parse::<StageKind>().is_err());
    }
}
