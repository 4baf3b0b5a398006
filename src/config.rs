//! Engine configuration loaded from a TOML file.

use crate::error::{Error, Result};
use crate::policy::{MatchRule, PolicySet, Tier};
use crate::types::MergeMethod;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default cap on merge attempts before escalation (1 retry)
const DEFAULT_MAX_ATTEMPTS: u32 = 2;

/// Default timeout for one queue entry's rebase/check/merge section
const DEFAULT_MERGE_TIMEOUT_SECS: u64 = 3600;

/// Default consecutive admissions from one tier before rotating
const DEFAULT_MAX_ADMISSIONS_PER_TIER: u32 = 3;

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_merge_timeout_secs() -> u64 {
    DEFAULT_MERGE_TIMEOUT_SECS
}

fn default_max_admissions_per_tier() -> u32 {
    DEFAULT_MAX_ADMISSIONS_PER_TIER
}

fn default_integration_branch() -> String {
    "main".to_string()
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".autoland")
}

/// Full configuration surface of the engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Ordered tier list (priority must be a total order)
    pub tiers: Vec<Tier>,
    /// Labels that halt any tier's auto-merge path
    #[serde(default)]
    pub global_blocking_labels: BTreeSet<String>,
    /// Merge attempts before escalating to blocked (default 2 = 1 retry)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Timeout for one entry's critical section, in seconds
    #[serde(default = "default_merge_timeout_secs")]
    pub merge_timeout_secs: u64,
    /// Consecutive admissions from one tier before rotating to the next
    #[serde(default = "default_max_admissions_per_tier")]
    pub max_admissions_per_tier: u32,
    /// Protected integration branch the engine governs
    #[serde(default = "default_integration_branch")]
    pub integration_branch: String,
    /// Directory for the queue/timer tables and the audit log
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
}

impl Default for EngineConfig {
    /// A runnable default: a zero-soak docs tier, a soaked tier for
    /// AI-authored changes, and the standard global blocking set. PRs no
    /// tier claims fall through to the synthetic manual-review tier.
    fn default() -> Self {
        Self {
            tiers: vec![
                Tier {
                    id: "docs".to_string(),
                    priority: 0,
                    match_rules: vec![MatchRule::HasLabel {
                        label: "docs-only".to_string(),
                    }],
                    required_approvals: 0,
                    soak_secs: 0,
                    blocking_labels: BTreeSet::new(),
                    max_diff_lines: Some(2000),
                    merge_method: MergeMethod::Squash,
                    required_checks: vec![],
                    allow_skipped_checks: true,
                    full_recheck: false,
                },
                Tier {
                    id: "ai-generated".to_string(),
                    priority: 1,
                    match_rules: vec![MatchRule::HasLabel {
                        label: "claude-auto".to_string(),
                    }],
                    required_approvals: 1,
                    soak_secs: 300,
                    blocking_labels: BTreeSet::new(),
                    max_diff_lines: Some(500),
                    merge_method: MergeMethod::Squash,
                    required_checks: vec!["ci".to_string()],
                    allow_skipped_checks: false,
                    full_recheck: true,
                },
            ],
            global_blocking_labels: ["do-not-merge", "wip", "breaking-change", "security"]
                .iter()
                .map(ToString::to_string)
                .collect(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            merge_timeout_secs: DEFAULT_MERGE_TIMEOUT_SECS,
            max_admissions_per_tier: DEFAULT_MAX_ADMISSIONS_PER_TIER,
            integration_branch: default_integration_branch(),
            state_dir: default_state_dir(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse {}: {e}", path.display())))?;
        // Surface tier-ordering bugs at load time, not on the first event
        config.policy_set()?;
        Ok(config)
    }

    /// Write configuration to a TOML file (used by `check-config --init`)
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("failed to serialize config: {e}")))?;
        let with_header = format!("# autoland configuration\n\n{content}");
        fs::write(path, with_header)
            .map_err(|e| Error::Config(format!("failed to write {}: {e}", path.display())))?;
        Ok(())
    }

    /// Build the validated policy set from this configuration
    pub fn policy_set(&self) -> Result<PolicySet> {
        PolicySet::new(self.tiers.clone(), self.global_blocking_labels.clone())
    }

    /// Merge timeout as a `Duration`
    #[must_use]
    pub const fn merge_timeout(&self) -> Duration {
        Duration::from_secs(self.merge_timeout_secs)
    }

    /// Path of the append-only audit log
    #[must_use]
    pub fn audit_path(&self) -> PathBuf {
        self.state_dir.join("audit.log")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn default_config_is_valid() {
        let config = EngineConfig::default();
        let policy = config.policy_set().unwrap();
        assert_eq!(policy.tiers().len(), 2);
        assert!(policy.global_blocking().contains("security"));
    }

    #[test]
    fn roundtrip_through_toml() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("autoland.toml");

        let config = EngineConfig::default();
        config.save(&path).unwrap();

        let loaded = EngineConfig::load(&path).unwrap();
        assert_eq!(loaded.tiers.len(), config.tiers.len());
        assert_eq!(loaded.max_attempts, config.max_attempts);
        assert_eq!(loaded.integration_branch, "main");

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("# autoland configuration"));
    }

    #[test]
    fn load_rejects_duplicate_priorities() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("autoland.toml");

        let mut config = EngineConfig::default();
        config.tiers[1].priority = config.tiers[0].priority;
        config.save(&path).unwrap();

        let err = EngineConfig::load(&path).unwrap_err();
        assert!(matches!(err, Error::Classification(_)));
    }

    #[test]
    fn missing_file_is_a_config_error() {
        let err = EngineConfig::load(Path::new("/nonexistent/autoland.toml")).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn defaults_fill_omitted_fields() {
        let toml_src = r#"
            [[tiers]]
            id = "docs"
            priority = 0
            required_approvals = 0
            soak_secs = 0
            merge_method = "squash"
            match_rules = [{ rule = "has_label", label = "docs-only" }]
        "#;
        let config: EngineConfig = toml::from_str(toml_src).unwrap();
        assert_eq!(config.max_attempts, DEFAULT_MAX_ATTEMPTS);
        assert_eq!(config.merge_timeout_secs, DEFAULT_MERGE_TIMEOUT_SECS);
        assert_eq!(config.integration_branch, "main");
        assert!(config.tiers[0].blocking_labels.is_empty());
        assert!(!config.tiers[0].full_recheck);
    }
}
