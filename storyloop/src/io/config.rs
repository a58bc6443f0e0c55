//! Run configuration: per-run values from the command line plus optional
//! runner settings stored in `.storyloop.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// File name looked up in the project directory when `--config` is absent.
pub const CONFIG_FILE_NAME: &str = ".storyloop.toml";

/// Immutable per-run configuration. Constructed once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunConfig {
    pub run_id: String,
    pub project_dir: PathBuf,
    pub prd_path: PathBuf,
    /// Upper bound on iterations (always >= 1).
    pub max_iterations: u32,
    /// Replacement for the default agent instruction preamble.
    pub system_prompt: Option<String>,
}

impl RunConfig {
    pub fn validate(&self) -> Result<()> {
        if self.run_id.trim().is_empty() {
            return Err(anyhow!("run id must not be empty"));
        }
        if self.max_iterations == 0 {
            return Err(anyhow!("max iterations must be > 0"));
        }
        if !self.project_dir.is_dir() {
            return Err(anyhow!(
                "project directory {} does not exist",
                self.project_dir.display()
            ));
        }
        if !self.prd_path.is_file() {
            return Err(anyhow!(
                "requirements document {} does not exist",
                self.prd_path.display()
            ));
        }
        Ok(())
    }
}

/// Runner settings (TOML).
///
/// Missing fields default to values suitable for the `claude` CLI.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RunnerConfig {
    /// Wall-clock budget for one agent invocation, in seconds.
    pub iteration_timeout_secs: u64,

    pub agent: AgentConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    /// Executable of the agent CLI.
    pub command: String,
    /// Model override passed to the agent.
    pub model: Option<String>,
    /// Tools the agent may use without confirmation.
    pub allowed_tools: Vec<String>,
    /// Environment variables that can carry the agent credential; any one suffices.
    pub credential_env: Vec<String>,
    /// Extra arguments appended to the agent command line.
    pub extra_args: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: "claude".to_string(),
            model: None,
            allowed_tools: [
                "Read",
                "Write",
                "Edit",
                "MultiEdit",
                "Bash",
                "Glob",
                "Grep",
                "Task",
                "WebFetch",
                "WebSearch",
                "TodoWrite",
            ]
            .into_iter()
            .map(str::to_string)
            .collect(),
            credential_env: vec![
                "ANTHROPIC_API_KEY".to_string(),
                "CLAUDE_CODE_OAUTH_TOKEN".to_string(),
            ],
            extra_args: Vec::new(),
        }
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            iteration_timeout_secs: 60 * 60,
            agent: AgentConfig::default(),
        }
    }
}

impl RunnerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.iteration_timeout_secs == 0 {
            return Err(anyhow!("iteration_timeout_secs must be > 0"));
        }
        if self.agent.command.trim().is_empty() {
            return Err(anyhow!("agent.command must not be empty"));
        }
        if self.agent.allowed_tools.is_empty() {
            return Err(anyhow!("agent.allowed_tools must be a non-empty array"));
        }
        if self.agent.credential_env.is_empty() {
            return Err(anyhow!("agent.credential_env must be a non-empty array"));
        }
        Ok(())
    }

    pub fn iteration_timeout(&self) -> Duration {
        Duration::from_secs(self.iteration_timeout_secs)
    }

    /// Name of the first credential variable `lookup` resolves to a non-empty value.
    pub fn find_credential<F>(&self, lookup: F) -> Result<&str>
    where
        F: Fn(&str) -> Option<String>,
    {
        self.agent
            .credential_env
            .iter()
            .find(|name| lookup(name).is_some_and(|value| !value.trim().is_empty()))
            .map(String::as_str)
            .ok_or_else(|| {
                anyhow!(
                    "missing agent credential (set one of: {})",
                    self.agent.credential_env.join(", ")
                )
            })
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `RunnerConfig::default()`.
pub fn load_config(path: &Path) -> Result<RunnerConfig> {
    if !path.exists() {
        debug!(path = %path.display(), "no config file, using defaults");
        let cfg = RunnerConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: RunnerConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Read the instruction preamble override, if one was given.
pub fn read_system_prompt(path: Option<&Path>) -> Result<Option<String>> {
    let Some(path) = path else {
        return Ok(None);
    };
    let contents = fs::read_to_string(path)
        .with_context(|| format!("read system prompt {}", path.display()))?;
    Ok(Some(contents))
}
