//! Pipeline configuration loaded from `.shipwright/pipeline.toml`.
//!
//! Every section is optional and falls back to serde defaults. Values are
//! layered file → environment → CLI:
//!
//! ```toml
//! [sandbox]
//! root = "."
//! app_subtree = "codebase/src"
//! qa_dir = "codebase/tests/e2e"
//!
//! [retry]
//! bound = 2
//! backoff_ms = 500
//!
//! [retry.classes]
//! install = 3
//!
//! [architecture]
//! max_remediation_passes = 2
//! max_inline_type_lines = 5
//!
//! [remote]
//! owner = "acme"
//! branch = "main"
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::architecture::RuleSet;
use crate::init;

/// Sandbox layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxSection {
    /// Sandbox root, relative to the project directory unless absolute.
    #[serde(default = "default_root")]
    pub root: PathBuf,
    /// Application-code subtree; the only writable area in fix mode.
    #[serde(default = "default_app_subtree")]
    pub app_subtree: PathBuf,
    /// QA-test artifact set, never mutated in fix mode.
    #[serde(default = "default_qa_dir")]
    pub qa_dir: PathBuf,
    /// Directory names skipped when listing and searching.
    #[serde(default = "default_ignore")]
    pub ignore: Vec<String>,
    /// Depth of artifact snapshots.
    #[serde(default = "default_list_depth")]
    pub list_depth: usize,
}

fn default_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_app_subtree() -> PathBuf {
    PathBuf::from("codebase/src")
}

fn default_qa_dir() -> PathBuf {
    PathBuf::from("codebase/tests/e2e")
}

fn default_ignore() -> Vec<String> {
    ["node_modules", ".git", "dist", ".shipwright"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_list_depth() -> usize {
    12
}

impl Default for SandboxSection {
    fn default() -> Self {
        Self {
            root: default_root(),
            app_subtree: default_app_subtree(),
            qa_dir: default_qa_dir(),
            ignore: default_ignore(),
            list_depth: default_list_depth(),
        }
    }
}

/// Retry/backoff settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySection {
    /// Additional attempts after the first one.
    #[serde(default = "default_bound")]
    pub bound: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Per operation-class override of `bound`.
    #[serde(default)]
    pub classes: BTreeMap<String, u32>,
}

fn default_bound() -> u32 {
    2
}

fn default_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    8000
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            bound: default_bound(),
            backoff_ms: default_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            classes: BTreeMap::new(),
        }
    }
}

/// Architecture conformance settings used to build the standard rule set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchitectureSection {
    #[serde(default = "default_remediation_passes")]
    pub max_remediation_passes: u32,
    #[serde(default = "default_max_inline_type_lines")]
    pub max_inline_type_lines: usize,
    #[serde(default = "default_composition_roots")]
    pub composition_roots: Vec<String>,
    #[serde(default = "default_ui_dirs")]
    pub ui_dirs: Vec<String>,
    #[serde(default = "default_page_dirs")]
    pub page_dirs: Vec<String>,
    #[serde(default = "default_external_call_pattern")]
    pub external_call_pattern: String,
}

fn default_remediation_passes() -> u32 {
    2
}

fn default_max_inline_type_lines() -> usize {
    5
}

fn default_composition_roots() -> Vec<String> {
    [
        "**/src/App.tsx",
        "**/src/App.jsx",
        "**/src/main.tsx",
        "**/src/main.jsx",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_ui_dirs() -> Vec<String> {
    vec!["**/src/components/**".to_string()]
}

fn default_page_dirs() -> Vec<String> {
    vec!["**/src/pages/**".to_string()]
}

fn default_external_call_pattern() -> String {
    r"\bfetch\s*\(|\baxios\b|XMLHttpRequest|new\s+WebSocket\s*\(".to_string()
}

impl Default for ArchitectureSection {
    fn default() -> Self {
        Self {
            max_remediation_passes: default_remediation_passes(),
            max_inline_type_lines: default_max_inline_type_lines(),
            composition_roots: default_composition_roots(),
            ui_dirs: default_ui_dirs(),
            page_dirs: default_page_dirs(),
            external_call_pattern: default_external_call_pattern(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSection {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_output_limit")]
    pub output_limit_bytes: usize,
}

fn default_timeout_secs() -> u64 {
    600
}

fn default_output_limit() -> usize {
    200_000
}

impl Default for ExecutionSection {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            output_limit_bytes: default_output_limit(),
        }
    }
}

/// Remote repository settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteSection {
    /// Account that owns created repositories.
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default = "default_branch")]
    pub branch: String,
    /// Environment variable holding the API token.
    #[serde(default = "default_token_env")]
    pub token_env: String,
    #[serde(default = "default_api_base")]
    pub api_base: String,
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_token_env() -> String {
    "GITHUB_TOKEN".to_string()
}

fn default_api_base() -> String {
    "https://api.github.com".to_string()
}

impl Default for RemoteSection {
    fn default() -> Self {
        Self {
            owner: None,
            branch: default_branch(),
            token_env: default_token_env(),
            api_base: default_api_base(),
        }
    }
}

/// Root structure of `pipeline.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineToml {
    #[serde(default)]
    pub sandbox: SandboxSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub architecture: ArchitectureSection,
    #[serde(default)]
    pub execution: ExecutionSection,
    #[serde(default)]
    pub remote: RemoteSection,
}

impl PipelineToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse pipeline.toml")
    }

    /// Load from `<dir>/pipeline.toml`, or defaults when it does not exist.
    pub fn load_or_default(shipwright_dir: &Path) -> Result<Self> {
        let path = shipwright_dir.join(init::CONFIG_FILE);
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).context("Failed to serialize pipeline.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply `SHIPWRIGHT_*` environment overrides.
    pub fn apply_env(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(bound) = env("SHIPWRIGHT_RETRY_BOUND").and_then(|v| v.parse().ok()) {
            self.retry.bound = bound;
        }
        if let Some(ms) = env("SHIPWRIGHT_BACKOFF_MS").and_then(|v| v.parse().ok()) {
            self.retry.backoff_ms = ms;
        }
        if let Some(passes) = env("SHIPWRIGHT_REMEDIATION_PASSES").and_then(|v| v.parse().ok()) {
            self.architecture.max_remediation_passes = passes;
        }
        if let Some(secs) = env("SHIPWRIGHT_EXEC_TIMEOUT").and_then(|v| v.parse().ok()) {
            self.execution.timeout_secs = secs;
        }
        if let Some(owner) = env("SHIPWRIGHT_REMOTE_OWNER").filter(|v| !v.trim().is_empty()) {
            self.remote.owner = Some(owner);
        }
    }

    /// Validate the configuration and return any problems found.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();

        if self.sandbox.app_subtree.is_absolute() {
            problems.push(format!(
                "sandbox.app_subtree must be relative to the sandbox root, got {}",
                self.sandbox.app_subtree.display()
            ));
        }
        if self.sandbox.qa_dir.is_absolute() {
            problems.push(format!(
                "sandbox.qa_dir must be relative to the sandbox root, got {}",
                self.sandbox.qa_dir.display()
            ));
        }
        if self.sandbox.list_depth == 0 {
            problems.push("sandbox.list_depth must be at least 1".to_string());
        }
        if self.retry.max_backoff_ms < self.retry.backoff_ms {
            problems.push(format!(
                "retry.max_backoff_ms ({}) is below retry.backoff_ms ({})",
                self.retry.max_backoff_ms, self.retry.backoff_ms
            ));
        }
        if self.execution.timeout_secs == 0 {
            problems.push("execution.timeout_secs must be greater than zero".to_string());
        }
        if let Err(e) = RuleSet::standard(&self.architecture) {
            problems.push(format!("architecture rules do not compile: {:#}", e));
        }

        problems
    }
}

/// Resolved configuration for a project directory.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub project_dir: PathBuf,
    pub shipwright_dir: PathBuf,
    pub toml: PipelineToml,
    pub verbose: bool,
}

impl PipelineConfig {
    /// Load `pipeline.toml` and environment overrides for `project_dir`.
    ///
    /// A `.env` file in the project directory is loaded first so tokens and
    /// overrides can live there.
    pub fn load(project_dir: &Path, verbose: bool) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let _ = dotenvy::from_path(project_dir.join(".env"));

        let shipwright_dir = init::shipwright_dir(&project_dir);
        let mut toml = PipelineToml::load_or_default(&shipwright_dir)?;
        toml.apply_env(|key| std::env::var(key).ok());

        Ok(Self {
            project_dir,
            shipwright_dir,
            toml,
            verbose,
        })
    }

    /// CLI override of the retry bound.
    pub fn with_retry_bound(mut self, bound: Option<u32>) -> Self {
        if let Some(bound) = bound {
            self.toml.retry.bound = bound;
        }
        self
    }

    /// Absolute sandbox root.
    pub fn sandbox_root(&self) -> PathBuf {
        let root = &self.toml.sandbox.root;
        if root.is_absolute() {
            root.clone()
        } else {
            self.project_dir.join(root)
        }
    }

    pub fn state_file(&self) -> PathBuf {
        self.shipwright_dir.join("state.json")
    }

    pub fn reports_file(&self) -> PathBuf {
        self.shipwright_dir.join("reports.jsonl")
    }

    pub fn blocked_file(&self) -> PathBuf {
        self.shipwright_dir.join("blocked.json")
    }

    pub fn lock_file(&self) -> PathBuf {
        self.shipwright_dir.join("run.lock")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.shipwright_dir.join("logs")
    }

    /// API token for the remote repository tool, if configured.
    pub fn remote_token(&self) -> Option<String> {
        std::env::var(&self.toml.remote.token_env)
            .ok()
            .filter(|t| !t.trim().is_empty())
    }

    pub fn validate(&self) -> Vec<String> {
        self.toml.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    #[test]
    fn test_empty_file_uses_defaults() {
        let toml = PipelineToml::parse("").unwrap();
        assert_eq!(toml.retry.bound, 2);
        assert_eq!(toml.architecture.max_remediation_passes, 2);
        assert_eq!(toml.sandbox.app_subtree, PathBuf::from("codebase/src"));
        assert_eq!(toml.remote.branch, "main");
        assert!(toml.validate().is_empty());
    }

    #[test]
    fn test_partial_sections_keep_other_defaults() {
        let toml = PipelineToml::parse(
            r#"
[retry]
bound = 4

[retry.classes]
install = 3

[remote]
owner = "acme"
"#,
        )
        .unwrap();
        assert_eq!(toml.retry.bound, 4);
        assert_eq!(toml.retry.backoff_ms, 500);
        assert_eq!(toml.retry.classes.get("install"), Some(&3));
        assert_eq!(toml.remote.owner.as_deref(), Some("acme"));
        assert_eq!(toml.remote.token_env, "GITHUB_TOKEN");
    }

    #[test]
    fn test_env_overrides_file() {
        let mut toml = PipelineToml::default();
        let env: HashMap<&str, &str> = [
            ("SHIPWRIGHT_RETRY_BOUND", "5"),
            ("SHIPWRIGHT_REMEDIATION_PASSES", "1"),
            ("SHIPWRIGHT_REMOTE_OWNER", "octo"),
            ("SHIPWRIGHT_EXEC_TIMEOUT", "not-a-number"),
        ]
        .into_iter()
        .collect();
        toml.apply_env(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(toml.retry.bound, 5);
        assert_eq!(toml.architecture.max_remediation_passes, 1);
        assert_eq!(toml.remote.owner.as_deref(), Some("octo"));
        assert_eq!(toml.execution.timeout_secs, 600);
    }

    #[test]
    fn test_validate_reports_bad_pattern() {
        let mut toml = PipelineToml::default();
        toml.architecture.external_call_pattern = "fetch(".to_string();
        toml.retry.max_backoff_ms = 10;
        let problems = toml.validate();
        assert_eq!(problems.len(), 2);
        assert!(problems.iter().any(|p| p.contains("architecture rules")));
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pipeline.toml");
        let mut toml = PipelineToml::default();
        toml.retry.bound = 7;
        toml.save(&path).unwrap();
        let loaded = PipelineToml::load(&path).unwrap();
        assert_eq!(loaded.retry.bound, 7);
    }

    #[test]
    fn test_pipeline_config_paths() {
        let dir = tempdir().unwrap();
        let config = PipelineConfig::load(dir.path(), false)
            .unwrap()
            .with_retry_bound(Some(1));
        assert_eq!(config.toml.retry.bound, 1);
        assert!(config.state_file().ends_with(".shipwright/state.json"));
        assert_eq!(
            config.sandbox_root(),
            dir.path().canonicalize().unwrap().join(".")
        );
    }
}
