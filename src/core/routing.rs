//! Message routing: pure text parsing, no I/O, no state.
//!
//! Handles:
//! - Agent/team routing prefix (`@agent_id message`)
//! - Delegation mention extraction (`[@agent: message]`)
//! - Mention validation against a team roster
//!
//! Mentions do not nest: a `[@agent: ...]` span containing brackets is not
//! supported.

use regex::Regex;
use std::collections::HashMap;

use crate::config::{AgentConfig, TeamConfig};
use crate::core::types::TeamContext;

/// Parse an `@agent_id` routing prefix from a message.
///
/// Returns the lowercased target id and the remaining message, or
/// `(None, message)` unchanged when there is no prefix.
pub fn parse_agent_routing(message: &str) -> (Option<String>, String) {
    let Ok(re) = Regex::new(r"(?s)^@([A-Za-z0-9_-]+)\s+(.*)$") else {
        return (None, message.to_string());
    };

    match re.captures(message) {
        Some(caps) => {
            let agent_id = caps[1].to_lowercase();
            let remaining = caps[2].trim().to_string();
            (Some(agent_id), remaining)
        }
        None => (None, message.to_string()),
    }
}

/// Extract `[@agent_id: directed message]` mentions from a response.
///
/// Returns (agent_id, directed_message) pairs in order of appearance, ids
/// lowercased and messages trimmed.
pub fn extract_mentions(response: &str) -> Vec<(String, String)> {
    let Ok(re) = Regex::new(r"\[@([A-Za-z0-9_-]+):\s*([^\]]+)\]") else {
        return Vec::new();
    };

    re.captures_iter(response)
        .map(|caps| (caps[1].to_lowercase(), caps[2].trim().to_string()))
        .collect()
}

/// Text outside all mention spans: the context shared by every delegated
/// agent.
pub fn shared_context(response: &str) -> String {
    let Ok(re) = Regex::new(r"\[@[A-Za-z0-9_-]+:\s*[^\]]+\]") else {
        return response.to_string();
    };

    re.replace_all(response, "").trim().to_string()
}

/// Combine shared context with an agent's directed message.
pub fn merge_message(shared_context: &str, directed_message: &str) -> String {
    if !shared_context.is_empty() && !directed_message.is_empty() {
        format!("{}\n\n{}", shared_context, directed_message)
    } else if !shared_context.is_empty() {
        shared_context.to_string()
    } else {
        directed_message.to_string()
    }
}

/// Validate delegation mentions.
///
/// A mention is invalid when the agent id is unknown, or a team context is
/// present and the agent is not a roster member. Invalid entries are dropped
/// by the caller, never retried.
pub fn validate_mentions(
    mentions: &[(String, String)],
    team_context: Option<&TeamContext>,
    agents: &HashMap<String, AgentConfig>,
) -> Vec<(String, String, bool)> {
    mentions
        .iter()
        .map(|(agent_id, message)| {
            let valid = agents.contains_key(agent_id)
                && team_context.map_or(true, |team| team.has_member(agent_id));
            (agent_id.clone(), message.clone(), valid)
        })
        .collect()
}

/// Find the first team whose roster contains an agent.
pub fn find_team_for_agent(
    agent_id: &str,
    teams: &HashMap<String, TeamConfig>,
) -> Option<(String, TeamConfig)> {
    teams
        .iter()
        .find(|(_, team)| team.agents.iter().any(|a| a == agent_id))
        .map(|(team_id, team)| (team_id.clone(), team.clone()))
}

/// Notice appended to a prompt when sibling replies are still outstanding.
///
/// This is what prevents re-ask spirals: the agent is told how many teammate
/// responses are in flight and not to mention those teammates again.
pub fn pending_notice(pending_count: usize) -> String {
    match pending_count {
        0 => String::new(),
        1 => "\n\n[1 other teammate response is still being processed and will be \
              delivered when ready. Do not re-mention teammates who haven't responded yet.]"
            .to_string(),
        n => format!(
            "\n\n[{} other teammate responses are still being processed and will be \
             delivered when ready. Do not re-mention teammates who haven't responded yet.]",
            n
        ),
    }
}
