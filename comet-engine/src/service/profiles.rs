//! Stage kind profiles
//!
//! Default execution image and artifact list per stage kind. The table is
//! data: new kinds or images only need a new entry, optionally loaded from a
//! JSON file.

use anyhow::Context;
use comet_core::domain::pipeline::{StageDefinition, StageKind};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Image used for kinds missing from the table
pub const FALLBACK_IMAGE: &str = "alpine:latest";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageProfile {
    pub image: String,
    #[serde(default)]
    pub artifacts: Vec<String>,
}

impl StageProfile {
    fn new(image: &str, artifacts: &[&str]) -> Self {
        Self {
            image: image.to_string(),
            artifacts: artifacts.iter().map(|a| a.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageProfiles {
    profiles: HashMap<StageKind, StageProfile>,
    #[serde(default = "default_fallback")]
    fallback_image: String,
}

fn default_fallback() -> String {
    FALLBACK_IMAGE.to_string()
}

impl Default for StageProfiles {
    fn default() -> Self {
        let profiles = HashMap::from([
            (
                StageKind::Build,
                StageProfile::new("node:18-alpine", &["dist/", "build/"]),
            ),
            (
                StageKind::Test,
                StageProfile::new("node:18-alpine", &["coverage/", "test-results.xml"]),
            ),
            (
                StageKind::SecurityScan,
                StageProfile::new("aquasec/trivy:latest", &["security-report.json"]),
            ),
            (
                StageKind::CodeAnalysis,
                StageProfile::new("sonarsource/sonar-scanner-cli:latest", &["analysis-report.json"]),
            ),
            (StageKind::Deploy, StageProfile::new("alpine/k8s:1.28.3", &[])),
            (StageKind::Notification, StageProfile::new("curlimages/curl:latest", &[])),
            (StageKind::Approval, StageProfile::new(FALLBACK_IMAGE, &[])),
            (StageKind::Rollback, StageProfile::new("alpine/k8s:1.28.3", &[])),
        ]);

        Self {
            profiles,
            fallback_image: default_fallback(),
        }
    }
}

impl StageProfiles {
    /// Loads the defaults and overlays the entries of a JSON file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read stage profiles from {}", path.display()))?;
        let overrides: HashMap<StageKind, StageProfile> = serde_json::from_str(&content)
            .with_context(|| format!("Invalid stage profiles in {}", path.display()))?;

        Ok(overrides
            .into_iter()
            .fold(Self::default(), |profiles, (kind, profile)| profiles.with_profile(kind, profile)))
    }

    /// Replaces the profile of one stage kind
    pub fn with_profile(mut self, kind: StageKind, profile: StageProfile) -> Self {
        self.profiles.insert(kind, profile);
        self
    }

    /// Explicit stage image, else the kind's default
    pub fn image_for(&self, stage: &StageDefinition) -> String {
        match stage.image.as_deref().filter(|image| !image.trim().is_empty()) {
            Some(image) => image.to_string(),
            None => self
                .profiles
                .get(&stage.kind)
                .map(|profile| profile.image.clone())
                .unwrap_or_else(|| self.fallback_image.clone()),
        }
    }

    /// Artifact paths recorded for a successful stage of this kind
    pub fn artifacts_for(&self, kind: StageKind) -> Vec<String> {
        self.profiles
            .get(&kind)
            .map(|profile| profile.artifacts.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_explicit_image_wins() {
        let profiles = StageProfiles::default();
        let stage = StageDefinition::new("build", StageKind::Build, vec![]).with_image("rust:1.85");

        assert_eq!(profiles.image_for(&stage), "rust:1.85");
    }

    #[test]
    fn test_kind_default_image() {
        let profiles = StageProfiles::default();
        let stage = StageDefinition::new("scan", StageKind::SecurityScan, vec![]);

        assert_eq!(profiles.image_for(&stage), "aquasec/trivy:latest");
        assert_eq!(profiles.artifacts_for(StageKind::SecurityScan), vec!["security-report.json"]);
        assert!(profiles.artifacts_for(StageKind::Deploy).is_empty());
    }

    #[test]
    fn test_every_kind_has_a_profile() {
        let profiles = StageProfiles::default();
        for kind in StageKind::ALL {
            assert!(profiles.profiles.contains_key(&kind), "missing {}", kind);
        }
    }

    #[test]
    fn test_with_profile_replaces_kind_default() {
        let profiles = StageProfiles::default().with_profile(
            StageKind::Deploy,
            StageProfile {
                image: "bitnami/kubectl:1.29".to_string(),
                artifacts: vec!["rollout.log".to_string()],
            },
        );
        let deploy = StageDefinition::new("deploy", StageKind::Deploy, vec![]);

        assert_eq!(profiles.image_for(&deploy), "bitnami/kubectl:1.29");
        assert_eq!(profiles.artifacts_for(StageKind::Deploy), vec!["rollout.log"]);
        assert_eq!(profiles.artifacts_for(StageKind::Build), vec!["dist/", "build/"]);
    }

    #[test]
    fn test_file_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "BUILD": {{ "image": "rust:1.85", "artifacts": ["target/release/"] }} }}"#
        )
        .unwrap();

        let profiles = StageProfiles::from_file(file.path()).unwrap();
        let build = StageDefinition::new("build", StageKind::Build, vec![]);
        let test = StageDefinition::new("test", StageKind::Test, vec![]);

        assert_eq!(profiles.image_for(&build), "rust:1.85");
        assert_eq!(profiles.artifacts_for(StageKind::Build), vec!["target/release/"]);
        assert_eq!(profiles.image_for(&test), "node:18-alpine");
    }
}
