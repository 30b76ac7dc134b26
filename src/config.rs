//! Configuration loading for Agentry.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

use crate::error::{Error, Result};

/// Get the Agentry home directory (~/.agentry).
pub fn get_home_dir() -> Result<PathBuf> {
    let home = directories::UserDirs::new()
        .ok_or_else(|| Error::Config("Could not determine home directory".to_string()))?;

    Ok(home.home_dir().join(".agentry"))
}

/// Get the settings file path.
pub fn get_settings_path() -> Result<PathBuf> {
    Ok(get_home_dir()?.join("settings.json"))
}

/// Get the queue root directory.
pub fn get_queue_dir() -> Result<PathBuf> {
    Ok(get_home_dir()?.join("queue"))
}

/// Load settings from a specific path.
pub fn load_settings_from(path: &std::path::Path) -> Result<Settings> {
    if !path.exists() {
        return Err(Error::Config(format!(
            "Settings file not found at {}",
            path.display()
        )));
    }

    let content = std::fs::read_to_string(path)?;
    let settings: Settings = serde_json::from_str(&content)?;
    validate_settings(&settings)?;

    tracing::debug!("Loaded settings from {}", path.display());
    Ok(settings)
}

/// Load settings from ~/.agentry/settings.json
pub fn load_settings() -> Result<Settings> {
    load_settings_from(&get_settings_path()?)
}

fn validate_settings(settings: &Settings) -> Result<()> {
    for (team_id, team) in &settings.teams {
        for agent_id in &team.agents {
            if !settings.agents.contains_key(agent_id) {
                return Err(Error::Config(format!(
                    "teams.{}.agents references unknown agent '{}'",
                    team_id, agent_id
                )));
            }
        }
        if let Some(leader) = team.leader_agent.as_deref() {
            if !team.agents.contains(&leader.to_string()) {
                return Err(Error::Config(format!(
                    "teams.{}.leader_agent '{}' is not a team member",
                    team_id, leader
                )));
            }
        }
    }
    Ok(())
}

/// Source of the current settings snapshot.
///
/// The orchestrator re-reads settings for every message it routes, so roster
/// and personality edits take effect without a restart. Tests supply a fixed
/// snapshot instead of a file.
pub trait SettingsSource: Send + Sync {
    fn current(&self) -> Result<Settings>;
}

/// File-backed settings, re-read on every call.
pub struct FileSettings {
    path: PathBuf,
}

impl FileSettings {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl SettingsSource for FileSettings {
    fn current(&self) -> Result<Settings> {
        load_settings_from(&self.path)
    }
}

impl SettingsSource for Settings {
    fn current(&self) -> Result<Settings> {
        Ok(self.clone())
    }
}

/// Workspace configuration.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct Workspace {
    pub path: Option<PathBuf>,
}

/// Agent configuration.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct AgentConfig {
    pub name: Option<String>,
    /// Command invoked for this agent (e.g. "claude", "codex").
    pub command: Option<String>,
    pub model: Option<String>,
    pub working_directory: Option<PathBuf>,
    pub personality: Option<String>,
}

impl AgentConfig {
    /// Display name, falling back to the agent id.
    pub fn display_name<'a>(&'a self, agent_id: &'a str) -> &'a str {
        self.name.as_deref().unwrap_or(agent_id)
    }
}

/// Team configuration.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct TeamConfig {
    pub name: String,
    pub agents: Vec<String>,
    pub leader_agent: Option<String>,
}

/// Queue policy.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct QueueSettings {
    /// Seconds a processing entry may sit before it is assumed abandoned.
    #[serde(default = "default_orphan_threshold_secs")]
    pub orphan_threshold_secs: u64,
}

fn default_orphan_threshold_secs() -> u64 {
    300
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            orphan_threshold_secs: default_orphan_threshold_secs(),
        }
    }
}

/// Conversation policy.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ConversationSettings {
    /// Turn ceiling per conversation (loop circuit breaker).
    #[serde(default = "default_max_messages")]
    pub max_messages: u32,
}

fn default_max_messages() -> u32 {
    50
}

impl Default for ConversationSettings {
    fn default() -> Self {
        Self {
            max_messages: default_max_messages(),
        }
    }
}

/// Agentry settings.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct Settings {
    #[serde(default)]
    pub workspace: Workspace,

    #[serde(default)]
    pub agents: HashMap<String, AgentConfig>,

    #[serde(default)]
    pub teams: HashMap<String, TeamConfig>,

    #[serde(default)]
    pub queue: QueueSettings,

    #[serde(default)]
    pub conversations: ConversationSettings,
}

impl Settings {
    /// Effective workspace root for agent working directories.
    pub fn workspace_path(&self) -> Result<PathBuf> {
        match &self.workspace.path {
            Some(p) => Ok(p.clone()),
            None => Ok(get_home_dir()?.join("workspace")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings: Settings = serde_json::from_str("{}").unwrap();
        assert_eq!(settings.queue.orphan_threshold_secs, 300);
        assert_eq!(settings.conversations.max_messages, 50);
        assert!(settings.agents.is_empty());
    }

    #[test]
    fn test_validate_rejects_unknown_team_member() {
        let json = r#"{
            "agents": {"coder": {"name": "Coder"}},
            "teams": {"dev": {"name": "Dev", "agents": ["coder", "ghost"], "leader_agent": "coder"}}
        }"#;
        let settings: Settings = serde_json::from_str(json).unwrap();
        assert!(validate_settings(&settings).is_err());
    }

    #[test]
    fn test_validate_leader_must_be_member() {
        let json = r#"{
            "agents": {"coder": {}, "reviewer": {}},
            "teams": {"dev": {"name": "Dev", "agents": ["coder"], "leader_agent": "reviewer"}}
        }"#;
        let settings: Settings = serde_json::from_str(json).unwrap();
        assert!(validate_settings(&settings).is_err());
    }

    #[test]
    fn test_display_name_fallback() {
        let cfg = AgentConfig::default();
        assert_eq!(cfg.display_name("coder"), "coder");

        let cfg = AgentConfig {
            name: Some("Coder".to_string()),
            ..Default::default()
        };
        assert_eq!(cfg.display_name("coder"), "Coder");
    }
}
