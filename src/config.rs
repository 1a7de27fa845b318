use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub const CONFIG_FILE: &str = "autodev.json";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProjectConfig {
    pub project_name: String,
    #[serde(default = "default_base_branch")]
    pub base_branch: String,
    #[serde(default = "default_features_path")]
    pub features_path: String,
    #[serde(default = "default_progress_path")]
    pub progress_path: String,
    #[serde(default = "default_instructions_path")]
    pub instructions_path: String,
    #[serde(default)]
    pub app_url: String,
    #[serde(default)]
    pub tracks: Vec<TrackDef>,
    /// False until the operator has answered the setup handshake.
    #[serde(default)]
    pub tracks_configured: bool,
    #[serde(default)]
    pub workspace: WorkspacePolicy,
    #[serde(default)]
    pub critical_patterns: Vec<CriticalPattern>,
    #[serde(default)]
    pub prompts: PromptOverrides,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub verification: VerificationConfig,
}

/// A logical lane: features are routed to it by category and processed
/// serially within it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrackDef {
    pub name: String,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default)]
    pub is_default: bool,
}

/// Per-worktree filesystem policy applied after `git worktree add`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkspacePolicy {
    #[serde(default = "default_worktrees_dir")]
    pub worktrees_dir: String,
    /// Directories symlinked (relative) from the worktree back into the
    /// project root, so dependency trees are not copied per track.
    #[serde(default)]
    pub symlink_dirs: Vec<String>,
    /// Files copied into each fresh worktree.
    #[serde(default)]
    pub copy_files: Vec<String>,
    /// Files whose bytes must survive every git operation.
    #[serde(default = "default_preserve_files")]
    pub preserve_files: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub setup_script: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker: Option<DockerConfig>,
}

impl Default for WorkspacePolicy {
    fn default() -> Self {
        Self {
            worktrees_dir: default_worktrees_dir(),
            symlink_dirs: Vec::new(),
            copy_files: Vec::new(),
            preserve_files: default_preserve_files(),
            setup_script: None,
            docker: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DockerConfig {
    pub image: String,
    #[serde(default)]
    pub compose_file: String,
}

/// A configured regex that marks agent output as an environment failure and
/// feeds the per-track circuit breaker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CriticalPattern {
    pub pattern: String,
    pub label: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct PromptOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub implementation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fix: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentConfig {
    #[serde(default = "default_preferred_agent")]
    pub preferred: String,
    #[serde(default = "default_fallback_agents")]
    pub fallback: Vec<String>,
    /// Per-agent command/argument overrides, keyed by agent name.
    #[serde(default)]
    pub commands: BTreeMap<String, AgentCommandOverride>,
    #[serde(default = "default_implementation_max_turns")]
    pub implementation_max_turns: u32,
    #[serde(default = "default_verification_max_turns")]
    pub verification_max_turns: u32,
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    #[serde(default = "default_verification_tools")]
    pub verification_allowed_tools: Vec<String>,
    #[serde(default = "default_rate_limit_wait_ms")]
    pub rate_limit_wait_ms: u64,
    /// Directories whose bin-like subdirectories are appended to PATH for
    /// spawned agents (e.g. node_modules).
    #[serde(default)]
    pub dependency_dirs: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            preferred: default_preferred_agent(),
            fallback: default_fallback_agents(),
            commands: BTreeMap::new(),
            implementation_max_turns: default_implementation_max_turns(),
            verification_max_turns: default_verification_max_turns(),
            allowed_tools: Vec::new(),
            verification_allowed_tools: default_verification_tools(),
            rate_limit_wait_ms: default_rate_limit_wait_ms(),
            dependency_dirs: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct AgentCommandOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Argument vector; a `{{PROMPT}}` element is substituted, otherwise the
    /// prompt is appended.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,
    /// Variant used for verification runs (stricter tool allowlist).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification_args: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VerificationConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Pause after merge+push so a downstream dev server can hot-reload.
    #[serde(default = "default_propagation_delay_ms")]
    pub delay_ms: u64,
    #[serde(default)]
    pub disabled: bool,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            delay_ms: default_propagation_delay_ms(),
            disabled: false,
        }
    }
}

fn default_base_branch() -> String {
    "main".into()
}
fn default_features_path() -> String {
    "features.json".into()
}
fn default_progress_path() -> String {
    "progress.md".into()
}
fn default_instructions_path() -> String {
    "AGENTS.md".into()
}
fn default_worktrees_dir() -> String {
    ".autodev/worktrees".into()
}
fn default_preserve_files() -> Vec<String> {
    vec![default_features_path(), default_progress_path()]
}
fn default_preferred_agent() -> String {
    "claude".into()
}
fn default_fallback_agents() -> Vec<String> {
    vec!["codex".into(), "gemini".into()]
}
fn default_implementation_max_turns() -> u32 {
    80
}
fn default_verification_max_turns() -> u32 {
    30
}
fn default_verification_tools() -> Vec<String> {
    vec!["Bash".into(), "Read".into(), "Grep".into(), "Glob".into()]
}
fn default_rate_limit_wait_ms() -> u64 {
    300_000
}
fn default_max_attempts() -> u32 {
    3
}
fn default_propagation_delay_ms() -> u64 {
    3_000
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {CONFIG_FILE}: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse {CONFIG_FILE}: {0}")]
    Parse(#[from] serde_json::Error),
}

impl ProjectConfig {
    pub fn load(project_dir: &Path) -> Result<Self, ConfigError> {
        let path = project_dir.join(CONFIG_FILE);
        let content = std::fs::read_to_string(&path)?;
        let config: ProjectConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self, project_dir: &Path) -> Result<(), ConfigError> {
        let path = project_dir.join(CONFIG_FILE);
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, content + "\n")?;
        Ok(())
    }

    /// Minimal config for a new project.
    pub fn scaffold(name: &str) -> Self {
        Self {
            project_name: name.into(),
            base_branch: default_base_branch(),
            features_path: default_features_path(),
            progress_path: default_progress_path(),
            instructions_path: default_instructions_path(),
            app_url: String::new(),
            tracks: Vec::new(),
            tracks_configured: false,
            workspace: WorkspacePolicy::default(),
            critical_patterns: Vec::new(),
            prompts: PromptOverrides::default(),
            agent: AgentConfig::default(),
            verification: VerificationConfig::default(),
        }
    }

    pub fn features_file(&self, project_dir: &Path) -> PathBuf {
        project_dir.join(&self.features_path)
    }

    pub fn progress_file(&self, project_dir: &Path) -> PathBuf {
        project_dir.join(&self.progress_path)
    }

    /// The default track, if tracks are configured correctly.
    pub fn default_track(&self) -> Option<&TrackDef> {
        self.tracks.iter().find(|t| t.is_default)
    }
}

/// Validate an operator-supplied track configuration: 1 to 5 tracks, unique
/// non-empty names, exactly one default.
pub fn validate_tracks(tracks: &[TrackDef]) -> Result<(), String> {
    if tracks.is_empty() || tracks.len() > 5 {
        return Err(format!("expected 1-5 tracks, got {}", tracks.len()));
    }
    let mut names = std::collections::BTreeSet::new();
    for track in tracks {
        if track.name.trim().is_empty() {
            return Err("track names must be non-empty".into());
        }
        if !names.insert(track.name.as_str()) {
            return Err(format!("duplicate track name: {}", track.name));
        }
    }
    let defaults = tracks.iter().filter(|t| t.is_default).count();
    if defaults != 1 {
        return Err(format!("expected exactly one default track, got {defaults}"));
    }
    Ok(())
}
