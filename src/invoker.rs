//! Agent invocation seam.
//!
//! The orchestrator only consumes this contract: agent config plus message in,
//! one response string out. Prompt construction against a model provider, the
//! tool-calling loop, and retries all live behind the implementation.

use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use thiserror::Error;
use tokio::process::Command;

use crate::config::AgentConfig;
use crate::core::types::TeamContext;

#[derive(Error, Debug)]
pub enum InvokeError {
    #[error("Agent not invocable: {0}")]
    NotInvocable(String),

    #[error("Agent command failed: {0}")]
    CommandFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, InvokeError>;

/// Invokes an agent and returns its raw response text.
///
/// Any error is a failed turn: the orchestrator logs it and moves on, it
/// never retries automatically. Implementations should tolerate being
/// invoked twice for what is logically the same turn (crash recovery makes
/// delivery at-least-once).
#[async_trait]
pub trait AgentInvoker: Send + Sync {
    async fn invoke(
        &self,
        agent_id: &str,
        agent: &AgentConfig,
        message: &str,
        team_context: Option<&TeamContext>,
        workspace_path: &Path,
        reset: bool,
    ) -> Result<String>;
}

/// Invoker that shells out to each agent's configured command with the prompt
/// as the final argument, running inside the agent's workspace directory.
pub struct CommandInvoker;

impl CommandInvoker {
    pub fn new() -> Self {
        Self
    }

    /// Briefing prepended to the prompt when the agent runs inside a team,
    /// so it knows who it may delegate to and how.
    fn team_briefing(agent_id: &str, team: &TeamContext) -> String {
        let mut lines = vec![format!(
            "You are @{} on team \"{}\" (leader: @{}).",
            agent_id, team.name, team.leader_agent
        )];

        let teammates: Vec<String> = team
            .agents
            .iter()
            .filter(|m| m.agent_id != agent_id)
            .map(|m| match &m.personality {
                Some(p) => format!("@{} ({}): {}", m.agent_id, m.name, p),
                None => format!("@{} ({})", m.agent_id, m.name),
            })
            .collect();

        if !teammates.is_empty() {
            lines.push("Teammates you can delegate to with [@agent_id: message]:".to_string());
            lines.extend(teammates);
        }

        lines.join("\n")
    }
}

impl Default for CommandInvoker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AgentInvoker for CommandInvoker {
    async fn invoke(
        &self,
        agent_id: &str,
        agent: &AgentConfig,
        message: &str,
        team_context: Option<&TeamContext>,
        workspace_path: &Path,
        reset: bool,
    ) -> Result<String> {
        let program = agent.command.as_deref().ok_or_else(|| {
            InvokeError::NotInvocable(format!("agent '{}' has no command configured", agent_id))
        })?;

        let working_dir = agent
            .working_directory
            .clone()
            .unwrap_or_else(|| workspace_path.join(agent_id));
        std::fs::create_dir_all(&working_dir)?;

        let prompt = match team_context {
            Some(team) => format!("{}\n\n{}", Self::team_briefing(agent_id, team), message),
            None => message.to_string(),
        };

        let mut cmd = Command::new(program);
        if !reset {
            // Continue the agent's existing session history.
            cmd.arg("-c");
        }
        cmd.arg("-p").arg(&prompt);

        if let Some(model) = agent.model.as_deref() {
            cmd.arg("--model").arg(model);
        }

        cmd.current_dir(&working_dir);
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let output = cmd.output().await?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(InvokeError::CommandFailed(stderr.trim().to_string()))
        }
    }
}
