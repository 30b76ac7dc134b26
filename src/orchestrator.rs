//! Main coordination loop.
//!
//! Architecture:
//! - File-based queue (incoming -> processing -> outgoing)
//! - Per-agent chains: sequential per agent, parallel across agents
//! - Simple conversation tracking (pending counter)
//!
//! Routing, invocation, fan-out, and completion all happen here; the queue,
//! router, and tracker stay free of each other.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::config::{AgentConfig, Settings, SettingsSource, TeamConfig};
use crate::core::routing;
use crate::core::types::{now_timestamp, MessageData, QueuedMessage, TeamContext, TeamMember};
use crate::core::{ConversationTracker, FileQueue, Partition};
use crate::error::{Error, Result};
use crate::invoker::AgentInvoker;

/// Idle sleep between dequeue polls.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Coordinates agents over the durable mailbox.
pub struct Orchestrator {
    settings: Arc<dyn SettingsSource>,
    queue: Arc<FileQueue>,
    tracker: Arc<ConversationTracker>,
    invoker: Arc<dyn AgentInvoker>,
    /// Most recently scheduled in-flight task per agent id. Each new turn
    /// awaits its predecessor, giving strict per-agent FIFO while distinct
    /// agents run concurrently.
    chains: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl Orchestrator {
    pub fn new(
        settings: Arc<dyn SettingsSource>,
        queue: Arc<FileQueue>,
        tracker: Arc<ConversationTracker>,
        invoker: Arc<dyn AgentInvoker>,
    ) -> Self {
        Self {
            settings,
            queue,
            tracker,
            invoker,
            chains: Mutex::new(HashMap::new()),
        }
    }

    /// Run the processing loop forever.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        tracing::info!("Starting orchestrator");

        let recovered = self.queue.recover_orphaned()?;
        if recovered > 0 {
            tracing::info!("Recovered {} orphaned messages on startup", recovered);
        }

        loop {
            match self.process_next().await {
                Ok(true) => {}
                Ok(false) => tokio::time::sleep(POLL_INTERVAL).await,
                Err(e) => {
                    tracing::error!("Error in orchestrator loop: {}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    /// Dequeue and route one message. Returns false when the queue is empty
    /// (or a racing consumer claimed the head entry first).
    pub async fn process_next(self: &Arc<Self>) -> Result<bool> {
        let Some(queued) = self.queue.dequeue()? else {
            return Ok(false);
        };

        self.route_message(queued).await;
        Ok(true)
    }

    /// Await every in-flight per-agent task. Task failures were already
    /// logged by the tasks themselves.
    pub async fn drain_chains(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut chains = self.chains.lock().unwrap();
            chains.drain().map(|(_, handle)| handle).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Route a dequeued message onto an agent chain. The queue entry is
    /// always completed eventually: by the scheduled turn task, or right here
    /// when the message is dropped.
    async fn route_message(self: &Arc<Self>, queued: QueuedMessage) {
        let scheduled = match self.resolve_and_schedule(&queued) {
            Ok(scheduled) => scheduled,
            Err(e) => {
                tracing::error!("Error routing message {}: {}", queued.data.message_id, e);
                false
            }
        };

        if !scheduled {
            if let Err(e) = self.queue.complete(&queued) {
                tracing::error!("Could not complete queue entry: {}", e);
            }
        }
    }

    /// Resolve the routing target and conversation, then schedule the turn.
    /// Returns Ok(false) when the message was dropped (already logged).
    fn resolve_and_schedule(self: &Arc<Self>, queued: &QueuedMessage) -> Result<bool> {
        // Settings are re-read per message so roster and personality edits
        // take effect immediately.
        let settings = Arc::new(self.settings.current()?);
        let mut message = queued.data.clone();

        // Routing hints win; delegation fan-out is addressed through the
        // agent field since its body carries no @prefix. Otherwise fall back
        // to parsing the text.
        let target = if let Some(agent) = message.agent.as_deref() {
            Some(agent.to_lowercase())
        } else if let Some(team) = message.team.as_deref() {
            Some(team.to_lowercase())
        } else {
            let (target, _) = routing::parse_agent_routing(&message.message);
            target
        };

        let Some(target) = target else {
            tracing::warn!(
                "No routing target in message: {}",
                truncate(&message.message, 50)
            );
            return Ok(false);
        };

        let (agent_id, team_context) = if let Some(team_cfg) = settings.teams.get(&target) {
            let Some(context) = build_team_context(&target, team_cfg, &settings.agents) else {
                tracing::error!("Team '{}' has no leader agent", target);
                return Ok(false);
            };
            (context.leader_agent.clone(), Some(context))
        } else {
            let context = routing::find_team_for_agent(&target, &settings.teams)
                .and_then(|(team_id, team_cfg)| {
                    build_team_context(&team_id, &team_cfg, &settings.agents)
                });
            (target, context)
        };

        if !settings.agents.contains_key(&agent_id) {
            tracing::error!("Unknown agent: {}", agent_id);
            return Ok(false);
        }

        let conversation = match &message.conversation_id {
            Some(conv_id) => match self.tracker.get(conv_id) {
                Some(conv) => conv,
                None => {
                    // Lost state after a crash, or a fan-out bug. Not retried.
                    tracing::error!("Conversation not found: {}", conv_id);
                    return Ok(false);
                }
            },
            None => {
                let conv = self.tracker.create(&message, team_context)?;
                message.conversation_id = Some(conv.id.clone());
                conv
            }
        };

        self.schedule_turn(settings, agent_id, message, conversation.id, queued.clone());
        Ok(true)
    }

    /// Chain the turn onto the agent's in-flight task: the new task first
    /// awaits the previous one (a predecessor's failure is logged, never
    /// propagated), so the dequeue loop is never blocked by a stalled agent.
    fn schedule_turn(
        self: &Arc<Self>,
        settings: Arc<Settings>,
        agent_id: String,
        message: MessageData,
        conv_id: String,
        queued: QueuedMessage,
    ) {
        let this = Arc::clone(self);
        let previous = self.chains.lock().unwrap().remove(&agent_id);
        let chain_agent_id = agent_id.clone();

        let handle = tokio::spawn(async move {
            if let Some(previous) = previous {
                if let Err(e) = previous.await {
                    tracing::error!("Previous task for {} failed: {}", chain_agent_id, e);
                }
            }

            if let Err(e) = this
                .run_turn(&settings, &chain_agent_id, &message, &conv_id)
                .await
            {
                tracing::error!(
                    "Error processing message for {} in conversation {}: {}",
                    chain_agent_id,
                    conv_id,
                    e
                );
            }

            // The entry is completed whether the turn succeeded or not, so a
            // failing turn never wedges the queue. Failure is not retried.
            if let Err(e) = this.queue.complete(&queued) {
                tracing::error!("Could not complete queue entry: {}", e);
            }
        });

        self.chains.lock().unwrap().insert(agent_id, handle);
    }

    /// Execute one agent turn: invoke, record, fan out, maybe finish.
    async fn run_turn(
        &self,
        settings: &Settings,
        agent_id: &str,
        message: &MessageData,
        conv_id: &str,
    ) -> Result<()> {
        let conv = self.tracker.get(conv_id).ok_or_else(|| {
            Error::Conversation(format!("conversation {} vanished before turn", conv_id))
        })?;

        let agent_cfg = settings
            .agents
            .get(agent_id)
            .ok_or_else(|| Error::NotFound(format!("agent {}", agent_id)))?;

        // Tell the agent how many sibling replies are still in flight so it
        // does not re-ask teammates that have not answered yet.
        let prompt = if conv.pending > 1 {
            format!(
                "{}{}",
                message.message,
                routing::pending_notice(conv.pending as usize - 1)
            )
        } else {
            message.message.clone()
        };

        tracing::info!("Processing message for agent {}", agent_id);
        let started = std::time::Instant::now();

        let response = self
            .invoker
            .invoke(
                agent_id,
                agent_cfg,
                &prompt,
                conv.team_context.as_ref(),
                &settings.workspace_path()?,
                false,
            )
            .await
            .map_err(|e| Error::Invoke(format!("agent {}: {}", agent_id, e)))?;

        tracing::info!(
            "Agent {} responded in {:.2}s",
            agent_id,
            started.elapsed().as_secs_f64()
        );

        let mentions = routing::extract_mentions(&response);
        let mentions: Vec<(String, String)> =
            routing::validate_mentions(&mentions, conv.team_context.as_ref(), &settings.agents)
                .into_iter()
                .filter(|(_, _, valid)| *valid)
                .map(|(id, text, _)| (id, text))
                .collect();

        let conv = self.tracker.add_response(
            conv_id,
            agent_id,
            agent_cfg.display_name(agent_id),
            &response,
            &mentions,
            &[],
        )?;

        if !mentions.is_empty() {
            self.enqueue_mentions(&response, &mentions, &conv.channel, agent_id, &conv)?;
        }

        // Decide from the snapshot add_response returned, not a re-read:
        // another turn finishing concurrently could change the counters
        // between the two, and then both tails would see the same state.
        if conv.pending == 0 {
            self.finish_conversation(conv_id)?;
        } else if conv.total_messages >= conv.max_messages {
            // Circuit breaker, not a failure: force-close with the partial
            // aggregate.
            tracing::error!("Loop detected in conversation {}", conv_id);
            self.finish_conversation(conv_id)?;
        }

        Ok(())
    }

    /// Spawn one new incoming message per valid delegation mention: shared
    /// context merged with the directed text, same conversation, addressed
    /// via the agent hint.
    fn enqueue_mentions(
        &self,
        response: &str,
        mentions: &[(String, String)],
        channel: &str,
        from_agent: &str,
        conv: &crate::core::types::Conversation,
    ) -> Result<()> {
        let shared = routing::shared_context(response);

        for (target_id, directed) in mentions {
            let teammate_message = MessageData {
                channel: channel.to_string(),
                sender: conv.sender.clone(),
                sender_id: conv.sender_id.clone(),
                message: routing::merge_message(&shared, directed),
                timestamp: now_timestamp(),
                message_id: format!("{}_mention_{}", conv.original_message_id, target_id),
                agent: Some(target_id.clone()),
                team: None,
                conversation_id: Some(conv.id.clone()),
                files: Vec::new(),
                metadata: HashMap::from([(
                    "from_agent".to_string(),
                    serde_json::Value::String(from_agent.to_string()),
                )]),
            };

            self.queue.enqueue(&teammate_message, Partition::Incoming)?;
            tracing::info!("Enqueued message to teammate {}", target_id);
        }

        Ok(())
    }

    /// Claim the conversation and emit its aggregate to the outgoing
    /// partition. The claim in `ConversationTracker::complete` is atomic, so
    /// two turns racing to close the same conversation produce exactly one
    /// outgoing message; the loser of the claim is a no-op.
    fn finish_conversation(&self, conv_id: &str) -> Result<()> {
        let Some(conv) = self.tracker.complete(conv_id)? else {
            return Ok(());
        };

        let response_text = conv.aggregated_response();
        let agents: Vec<serde_json::Value> = conv
            .responses
            .iter()
            .map(|step| serde_json::Value::String(step.agent_id.clone()))
            .collect();

        let outgoing = MessageData {
            channel: conv.channel.clone(),
            sender: conv.sender.clone(),
            sender_id: conv.sender_id.clone(),
            message: response_text,
            timestamp: now_timestamp(),
            message_id: conv.original_message_id.clone(),
            agent: None,
            team: None,
            conversation_id: None,
            files: Vec::new(),
            metadata: HashMap::from([
                (
                    "conversation_id".to_string(),
                    serde_json::Value::String(conv.id.clone()),
                ),
                (
                    "original_message".to_string(),
                    serde_json::Value::String(conv.original_message.clone()),
                ),
                ("agents".to_string(), serde_json::Value::Array(agents)),
            ]),
        };

        self.queue.enqueue(&outgoing, Partition::Outgoing)?;
        Ok(())
    }
}

/// Build the roster context for a team from current configuration. Returns
/// `None` when the team has no (known) leader.
fn build_team_context(
    team_id: &str,
    team: &TeamConfig,
    agents: &HashMap<String, AgentConfig>,
) -> Option<TeamContext> {
    let leader = team.leader_agent.clone()?;
    if !agents.contains_key(&leader) {
        return None;
    }

    Some(TeamContext {
        team_id: team_id.to_string(),
        name: team.name.clone(),
        leader_agent: leader,
        agents: team
            .agents
            .iter()
            .filter_map(|agent_id| {
                agents.get(agent_id).map(|cfg| TeamMember {
                    agent_id: agent_id.clone(),
                    name: cfg.display_name(agent_id).to_string(),
                    personality: cfg.personality.clone(),
                })
            })
            .collect(),
    })
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}
