use crate::db::schema::DEFAULT_DEPENDENTS;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// File name looked up next to the store.
pub const CONFIG_FILE_NAME: &str = "vmerge.toml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub matching: MatchConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub survivorship: SurvivorshipConfig,
    #[serde(default)]
    pub repoint: RepointConfig,
    #[serde(default)]
    pub resolver: ResolverConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub authorization: AuthorizationConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchConfig {
    /// Scores above this floor become candidates.
    #[serde(default = "default_candidate_floor")]
    pub candidate_floor: f64,
    /// Scores at or above this are flagged `auto_eligible`. Never auto-merged.
    #[serde(default = "default_auto_merge_threshold")]
    pub auto_merge_threshold: f64,
    /// Weight of token Jaccard versus edit distance in the name score.
    #[serde(default = "default_token_weight")]
    pub token_weight: f64,
    /// Added when both vendors share an owner organization.
    #[serde(default = "default_org_bonus")]
    pub org_bonus: f64,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            candidate_floor: default_candidate_floor(),
            auto_merge_threshold: default_auto_merge_threshold(),
            token_weight: default_token_weight(),
            org_bonus: default_org_bonus(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_sla_days")]
    pub sla_days: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            sla_days: default_sla_days(),
        }
    }
}

impl QueueConfig {
    #[must_use]
    pub fn sla(&self) -> Duration {
        Duration::from_secs(u64::from(self.sla_days) * 24 * 60 * 60)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SurvivorshipConfig {
    /// Source systems from most to least trusted.
    #[serde(default)]
    pub source_priority: Vec<String>,
    /// Let a present value beat an absent one before consulting priority.
    #[serde(default = "default_true")]
    pub prefer_non_empty: bool,
}

impl Default for SurvivorshipConfig {
    fn default() -> Self {
        Self {
            source_priority: Vec::new(),
            prefer_non_empty: default_true(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependentRef {
    pub table: String,
    #[serde(default = "default_vendor_column")]
    pub column: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepointConfig {
    /// Rows updated per statement while repointing one dependent.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Every application table that references a vendor.
    #[serde(default = "default_dependents")]
    pub dependents: Vec<DependentRef>,
}

impl Default for RepointConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            dependents: default_dependents(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolverConfig {
    #[serde(default = "default_max_chain_depth")]
    pub max_chain_depth: usize,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            max_chain_depth: default_max_chain_depth(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Attempts per phase transaction when SQLite reports busy.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_base_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_ms(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationConfig {
    /// Actors permitted to execute merges.
    #[serde(default)]
    pub merge_actors: Vec<String>,
}

/// Load config from an explicit path.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed.
pub fn load_config(path: &Path) -> Result<EngineConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    toml::from_str::<EngineConfig>(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))
}

/// Find the config that applies to a store directory.
///
/// Looks for `vmerge.toml` next to the store, then the user config dir, and
/// falls back to defaults.
///
/// # Errors
///
/// Returns an error if a config file exists but cannot be parsed.
pub fn discover_config(store_dir: &Path) -> Result<EngineConfig> {
    for candidate in config_candidates(store_dir) {
        if candidate.exists() {
            tracing::debug!(path = %candidate.display(), "loading engine config");
            return load_config(&candidate);
        }
    }
    Ok(EngineConfig::default())
}

fn config_candidates(store_dir: &Path) -> Vec<PathBuf> {
    let mut paths = vec![store_dir.join(CONFIG_FILE_NAME)];
    if let Some(config_dir) = dirs::config_dir() {
        paths.push(config_dir.join("vmerge/config.toml"));
    }
    paths
}

/// Serialize a config for `vmerge init`.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn render_config(config: &EngineConfig) -> Result<String> {
    toml::to_string_pretty(config).context("serialize engine config")
}

const fn default_true() -> bool {
    true
}

const fn default_candidate_floor() -> f64 {
    0.55
}

const fn default_auto_merge_threshold() -> f64 {
    0.92
}

const fn default_token_weight() -> f64 {
    0.6
}

const fn default_org_bonus() -> f64 {
    0.05
}

const fn default_sla_days() -> u32 {
    30
}

fn default_vendor_column() -> String {
    "vendor_id".to_string()
}

fn default_dependents() -> Vec<DependentRef> {
    DEFAULT_DEPENDENTS
        .iter()
        .map(|(table, column)| DependentRef {
            table: (*table).to_string(),
            column: (*column).to_string(),
        })
        .collect()
}

const fn default_chunk_size() -> usize {
    500
}

const fn default_max_chain_depth() -> usize {
    64
}

const fn default_max_attempts() -> u32 {
    4
}

const fn default_backoff_ms() -> u64 {
    25
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_sections_use_defaults() {
        let cfg: EngineConfig = toml::from_str("").expect("empty config parses");
        assert!((cfg.matching.candidate_floor - 0.55).abs() < f64::EPSILON);
        assert!((cfg.matching.auto_merge_threshold - 0.92).abs() < f64::EPSILON);
        assert_eq!(cfg.queue.sla_days, 30);
        assert_eq!(cfg.resolver.max_chain_depth, 64);
        assert_eq!(cfg.repoint.dependents.len(), DEFAULT_DEPENDENTS.len());
        assert!(cfg.survivorship.prefer_non_empty);
        assert!(cfg.authorization.merge_actors.is_empty());
    }

    #[test]
    fn explicit_sections_override_defaults() {
        let cfg: EngineConfig = toml::from_str(
            r#"
[matching]
candidate_floor = 0.7

[survivorship]
source_priority = ["peoplesoft", "zycus"]

[[repoint.dependents]]
table = "vendor_contract"

[[repoint.dependents]]
table = "legacy_invoice"
column = "supplier_vendor_id"

[authorization]
merge_actors = ["steward@corp"]
"#,
        )
        .expect("config parses");

        assert!((cfg.matching.candidate_floor - 0.7).abs() < f64::EPSILON);
        assert!((cfg.matching.auto_merge_threshold - 0.92).abs() < f64::EPSILON);
        assert_eq!(cfg.survivorship.source_priority, vec!["peoplesoft", "zycus"]);
        assert_eq!(cfg.repoint.dependents.len(), 2);
        assert_eq!(cfg.repoint.dependents[0].column, "vendor_id");
        assert_eq!(cfg.repoint.dependents[1].column, "supplier_vendor_id");
        assert_eq!(cfg.authorization.merge_actors, vec!["steward@corp"]);
    }

    #[test]
    fn discover_prefers_file_next_to_store() {
        let dir = tempfile::tempdir().expect("temp dir");
        std::fs::write(
            dir.path().join(CONFIG_FILE_NAME),
            "[queue]\nsla_days = 7\n",
        )
        .expect("write config");

        let cfg = discover_config(dir.path()).expect("discover");
        assert_eq!(cfg.queue.sla_days, 7);
    }

    #[test]
    fn rendered_config_round_trips() {
        let rendered = render_config(&EngineConfig::default()).expect("render");
        let parsed: EngineConfig = toml::from_str(&rendered).expect("parse rendered");
        assert_eq!(parsed, EngineConfig::default());
    }

    #[test]
    fn sla_is_expressed_in_days() {
        let queue = QueueConfig { sla_days: 2 };
        assert_eq!(queue.sla(), Duration::from_secs(2 * 86_400));
    }
}
