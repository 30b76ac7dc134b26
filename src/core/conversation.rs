//! Conversation tracking for multi-agent exchanges.
//!
//! Completion is a pending counter, not a state machine:
//!
//! ```text
//! pending: 1  <- initial message to agent
//! pending: 3  <- agent mentions 2 teammates
//! pending: 2  <- 1st teammate responds
//! pending: 1  <- 2nd teammate responds
//! pending: 0  <- complete, aggregate and send
//! ```
//!
//! Every active conversation is persisted as one JSON record so mid-flight
//! exchanges survive a restart.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use crate::core::types::{now_timestamp, ChainStep, Conversation, MessageData, TeamContext};
use crate::error::{Error, Result};

/// Tracks and persists in-flight multi-agent conversations.
///
/// All mutation goes through the internal mutex, so two agents finishing
/// into the same conversation concurrently cannot corrupt the pending
/// counter.
pub struct ConversationTracker {
    state_path: PathBuf,
    archive_path: PathBuf,
    max_messages: u32,
    conversations: Mutex<HashMap<String, Conversation>>,
}

impl ConversationTracker {
    /// Open a tracker rooted at `state_path`, reloading every persisted
    /// conversation record. Malformed records are logged and skipped.
    pub fn new(state_path: impl Into<PathBuf>, max_messages: u32) -> Result<Self> {
        let state_path = state_path.into();
        fs::create_dir_all(&state_path)?;

        let archive_path = state_path
            .parent()
            .map(|p| p.join("chats"))
            .unwrap_or_else(|| state_path.join("chats"));

        let tracker = Self {
            state_path,
            archive_path,
            max_messages,
            conversations: Mutex::new(HashMap::new()),
        };
        tracker.load_conversations()?;
        Ok(tracker)
    }

    fn load_conversations(&self) -> Result<()> {
        let mut conversations = self.conversations.lock().unwrap();

        for entry in fs::read_dir(&self.state_path)? {
            let path = entry?.path();
            if !path.extension().map_or(false, |ext| ext == "json") {
                continue;
            }

            match fs::read_to_string(&path)
                .map_err(Error::from)
                .and_then(|content| serde_json::from_str::<Conversation>(&content).map_err(Error::from))
            {
                Ok(conv) => {
                    conversations.insert(conv.id.clone(), conv);
                }
                Err(e) => {
                    tracing::error!("Could not load conversation from {}: {}", path.display(), e);
                }
            }
        }

        tracing::info!("Loaded {} active conversations", conversations.len());
        Ok(())
    }

    fn state_file(&self, conv_id: &str) -> PathBuf {
        self.state_path.join(format!("{}.json", conv_id))
    }

    fn save_conversation(&self, conv: &Conversation) -> Result<()> {
        let content = serde_json::to_string_pretty(conv)?;
        fs::write(self.state_file(&conv.id), content)?;
        Ok(())
    }

    /// Create a new conversation for an inbound message, with one pending
    /// turn (the agent about to run). Persisted immediately.
    pub fn create(
        &self,
        message: &MessageData,
        team_context: Option<TeamContext>,
    ) -> Result<Conversation> {
        let conv = Conversation::new(message, team_context, self.max_messages);

        self.save_conversation(&conv)?;
        self.conversations
            .lock()
            .unwrap()
            .insert(conv.id.clone(), conv.clone());

        tracing::info!("Created conversation {}", conv.id);
        Ok(conv)
    }

    /// Snapshot of a conversation by id.
    pub fn get(&self, conv_id: &str) -> Option<Conversation> {
        self.conversations.lock().unwrap().get(conv_id).cloned()
    }

    /// Number of conversations in the active set.
    pub fn active_count(&self) -> usize {
        self.conversations.lock().unwrap().len()
    }

    /// Ids of all conversations in the active set.
    pub fn active_ids(&self) -> Vec<String> {
        self.conversations.lock().unwrap().keys().cloned().collect()
    }

    /// Record one agent's completed turn.
    ///
    /// Appends a chain step, bumps the turn counter, and retires one pending
    /// unit for the finished agent while adding one per fresh delegation:
    /// `pending += mentions.len() - 1`.
    pub fn add_response(
        &self,
        conv_id: &str,
        agent_id: &str,
        agent_name: &str,
        response: &str,
        mentions: &[(String, String)],
        files: &[PathBuf],
    ) -> Result<Conversation> {
        let mut conversations = self.conversations.lock().unwrap();
        let conv = conversations
            .get_mut(conv_id)
            .ok_or_else(|| Error::NotFound(format!("conversation {}", conv_id)))?;

        conv.responses.push(ChainStep {
            agent_id: agent_id.to_string(),
            agent_name: agent_name.to_string(),
            response: response.to_string(),
            timestamp: now_timestamp(),
            mentions: mentions.to_vec(),
            files: files.to_vec(),
        });
        conv.total_messages += 1;
        conv.pending = conv.pending.saturating_sub(1) + mentions.len() as u32;

        for (mentioned_agent_id, _) in mentions {
            *conv
                .outgoing_mentions
                .entry(mentioned_agent_id.clone())
                .or_insert(0) += 1;
        }
        conv.files.extend(files.iter().cloned());

        let snapshot = conv.clone();
        self.save_conversation(&snapshot)?;

        tracing::info!(
            "Added response to conversation {}: agent={}, mentions={}, pending={}",
            conv_id,
            agent_id,
            mentions.len(),
            snapshot.pending
        );

        Ok(snapshot)
    }

    /// All pending responses received? An unknown id is treated as complete.
    pub fn is_complete(&self, conv_id: &str) -> bool {
        self.conversations
            .lock()
            .unwrap()
            .get(conv_id)
            .map_or(true, |conv| conv.pending == 0)
    }

    /// Has the conversation hit its turn ceiling?
    pub fn is_loop_detected(&self, conv_id: &str) -> bool {
        self.conversations
            .lock()
            .unwrap()
            .get(conv_id)
            .map_or(false, |conv| conv.total_messages >= conv.max_messages)
    }

    /// Close a conversation: claim the record by removing it under the
    /// mutex, archive it when team-scoped, and delete the persisted file.
    ///
    /// The removal doubles as an atomic claim: when two turns race to close
    /// the same conversation, exactly one caller gets the record back and the
    /// other gets `None`. An unknown id is also `None`.
    pub fn complete(&self, conv_id: &str) -> Result<Option<Conversation>> {
        let Some(conv) = self.conversations.lock().unwrap().remove(conv_id) else {
            return Ok(None);
        };

        if conv.team_context.is_some() {
            if let Err(e) = self.archive_team_conversation(&conv) {
                tracing::error!("Could not archive conversation {}: {}", conv_id, e);
            }
        }

        let state_file = self.state_file(conv_id);
        match fs::remove_file(&state_file) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        tracing::info!("Completed conversation {}", conv_id);
        Ok(Some(conv))
    }

    /// Write the full transcript of a team conversation as one markdown file
    /// under `chats/<team_id>/`.
    fn archive_team_conversation(&self, conv: &Conversation) -> Result<()> {
        let Some(team) = &conv.team_context else {
            return Ok(());
        };

        let archive_dir = self.archive_path.join(&team.team_id);
        fs::create_dir_all(&archive_dir)?;

        let timestamp = chrono::DateTime::<chrono::Utc>::from_timestamp(conv.created_at as i64, 0)
            .unwrap_or_default()
            .format("%Y-%m-%dT%H-%M-%S")
            .to_string();
        let short_id: String = conv.id.chars().take(8).collect();
        let archive_file = archive_dir.join(format!("{}_{}.md", timestamp, short_id));

        let mut lines = vec![
            format!("# Team Conversation: {}", team.name),
            format!("**Date:** {}", timestamp),
            format!("**Channel:** {} | **Sender:** {}", conv.channel, conv.sender),
            format!("**Messages:** {}", conv.total_messages),
            String::new(),
            "## User Message".to_string(),
            conv.original_message.clone(),
            String::new(),
        ];

        for step in &conv.responses {
            lines.push(format!("## {} (@{})", step.agent_name, step.agent_id));
            lines.push(step.response.clone());
            lines.push(String::new());
        }

        fs::write(&archive_file, lines.join("\n"))?;
        tracing::info!("Archived team conversation to {}", archive_file.display());
        Ok(())
    }
}
