//! Core data types flowing through the queue and conversation tracker.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

/// Current unix timestamp in seconds.
pub fn now_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// A message in the system. This is the wire format stored one-per-file in
/// the queue partitions, so operators can inspect entries directly.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct MessageData {
    /// Source channel (telegram, cli, ...)
    pub channel: String,

    /// Sender display name
    pub sender: String,

    /// Channel-specific sender ID
    pub sender_id: String,

    /// Message content
    pub message: String,

    /// Unix timestamp (seconds)
    pub timestamp: f64,

    /// Unique message ID
    pub message_id: String,

    /// Target agent ID routing hint
    #[serde(default)]
    pub agent: Option<String>,

    /// Target team ID routing hint
    #[serde(default)]
    pub team: Option<String>,

    /// Conversation this message belongs to
    #[serde(default)]
    pub conversation_id: Option<String>,

    /// Attached files
    #[serde(default)]
    pub files: Vec<PathBuf>,

    /// Channel-specific metadata
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl MessageData {
    /// Create a new message with a fresh id and current timestamp.
    pub fn new(channel: &str, sender: &str, sender_id: &str, message: &str) -> Self {
        Self {
            channel: channel.to_string(),
            sender: sender.to_string(),
            sender_id: sender_id.to_string(),
            message: message.to_string(),
            timestamp: now_timestamp(),
            message_id: uuid::Uuid::new_v4().to_string(),
            agent: None,
            team: None,
            conversation_id: None,
            files: Vec::new(),
            metadata: HashMap::new(),
        }
    }
}

/// A dequeued message together with its backing file.
///
/// Ownership is transient: the value exists between dequeue and
/// complete/delete, after which the backing file is gone.
#[derive(Clone, Debug)]
pub struct QueuedMessage {
    pub path: PathBuf,
    pub data: MessageData,
    pub created_at: f64,
}

/// One agent's completed turn inside a conversation.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ChainStep {
    pub agent_id: String,
    pub agent_name: String,
    pub response: String,
    pub timestamp: f64,
    /// (target_agent_id, directed_message) mentions this turn produced
    #[serde(default)]
    pub mentions: Vec<(String, String)>,
    #[serde(default)]
    pub files: Vec<PathBuf>,
}

/// A member of a team roster.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct TeamMember {
    pub agent_id: String,
    pub name: String,
    #[serde(default)]
    pub personality: Option<String>,
}

/// Roster and leadership metadata attached to a team conversation.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct TeamContext {
    pub team_id: String,
    pub name: String,
    pub leader_agent: String,
    pub agents: Vec<TeamMember>,
}

impl TeamContext {
    /// Check whether an agent is on the roster.
    pub fn has_member(&self, agent_id: &str) -> bool {
        self.agents.iter().any(|m| m.agent_id == agent_id)
    }
}

fn default_max_messages() -> u32 {
    50
}

/// Tracks a multi-agent conversation.
///
/// Completion is a pending counter, not a state machine: the conversation is
/// Active while `pending > 0`, Complete at `pending == 0`, and force-closed
/// once `total_messages` reaches `max_messages`.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Conversation {
    pub id: String,
    pub channel: String,
    pub sender: String,
    pub sender_id: String,
    pub original_message: String,
    pub original_message_id: String,

    /// Outstanding turns owed before the exchange can close
    pub pending: u32,

    /// Collected responses, in arrival order
    #[serde(default)]
    pub responses: Vec<ChainStep>,

    /// Monotonic turn counter used for loop protection
    #[serde(default)]
    pub total_messages: u32,

    /// Accumulated files across all turns
    #[serde(default)]
    pub files: BTreeSet<PathBuf>,

    #[serde(default)]
    pub team_context: Option<TeamContext>,

    /// Per-target mention tallies
    #[serde(default)]
    pub outgoing_mentions: HashMap<String, u32>,

    pub created_at: f64,

    /// Loop protection ceiling
    #[serde(default = "default_max_messages")]
    pub max_messages: u32,
}

impl Conversation {
    /// Create a conversation for an inbound message, with one turn pending.
    pub fn new(message: &MessageData, team_context: Option<TeamContext>, max_messages: u32) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            channel: message.channel.clone(),
            sender: message.sender.clone(),
            sender_id: message.sender_id.clone(),
            original_message: message.message.clone(),
            original_message_id: message.message_id.clone(),
            pending: 1,
            responses: Vec::new(),
            total_messages: 0,
            files: BTreeSet::new(),
            team_context,
            outgoing_mentions: HashMap::new(),
            created_at: now_timestamp(),
            max_messages,
        }
    }

    /// Aggregate all responses into one outgoing text.
    ///
    /// A single turn is returned verbatim; multiple turns get a
    /// `**name (@id):**` header each, in arrival order, separated by
    /// horizontal rules.
    pub fn aggregated_response(&self) -> String {
        if self.responses.len() == 1 {
            return self.responses[0].response.clone();
        }

        self.responses
            .iter()
            .map(|step| {
                format!(
                    "**{} (@{}):**\n{}",
                    step.agent_name, step.agent_id, step.response
                )
            })
            .collect::<Vec<_>>()
            .join("\n\n---\n\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_data() {
        let msg = MessageData::new("cli", "Alice", "12345", "Hello world");

        assert_eq!(msg.channel, "cli");
        assert_eq!(msg.sender, "Alice");
        assert!(!msg.message_id.is_empty());
        assert!(msg.timestamp > 0.0);
        assert!(msg.conversation_id.is_none());
    }

    #[test]
    fn test_message_wire_format_round_trip() {
        let mut msg = MessageData::new("telegram", "Bob", "42", "@coder fix it");
        msg.agent = Some("coder".to_string());
        msg.metadata
            .insert("from_agent".to_string(), serde_json::json!("assistant"));

        let json = serde_json::to_string(&msg).unwrap();
        let back: MessageData = serde_json::from_str(&json).unwrap();

        assert_eq!(back.agent.as_deref(), Some("coder"));
        assert_eq!(back.metadata["from_agent"], serde_json::json!("assistant"));
    }

    #[test]
    fn test_message_tolerates_minimal_wire_entry() {
        // Entries written by external producers may omit every optional field.
        let json = r#"{
            "channel": "cli",
            "sender": "me",
            "sender_id": "1",
            "message": "hi",
            "timestamp": 1.0,
            "message_id": "m1"
        }"#;
        let msg: MessageData = serde_json::from_str(json).unwrap();
        assert!(msg.files.is_empty());
        assert!(msg.metadata.is_empty());
    }

    #[test]
    fn test_conversation_initial_state() {
        let msg = MessageData::new("cli", "Alice", "1", "@dev plan");
        let conv = Conversation::new(&msg, None, 50);

        assert_eq!(conv.pending, 1);
        assert_eq!(conv.total_messages, 0);
        assert!(conv.responses.is_empty());
        assert_eq!(conv.original_message_id, msg.message_id);
    }

    #[test]
    fn test_team_context_membership() {
        let ctx = TeamContext {
            team_id: "dev".to_string(),
            name: "Dev Team".to_string(),
            leader_agent: "lead".to_string(),
            agents: vec![TeamMember {
                agent_id: "lead".to_string(),
                name: "Lead".to_string(),
                personality: None,
            }],
        };

        assert!(ctx.has_member("lead"));
        assert!(!ctx.has_member("ghost"));
    }
}
