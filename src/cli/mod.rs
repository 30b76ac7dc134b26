//! CLI commands for Agentry using clap.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;

use crate::config::{self, FileSettings};
use crate::core::{ConversationTracker, FileQueue, MessageData, Partition};
use crate::invoker::CommandInvoker;
use crate::orchestrator::Orchestrator;

/// Agentry - multi-agent coordination over a durable file mailbox.
#[derive(Parser)]
#[command(name = "agentry")]
#[command(version = "0.1.0")]
#[command(about = "Coordinate AI agents through a crash-safe local mailbox", long_about = None)]
pub struct Commands {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start the orchestrator (runs until interrupted)
    Start,

    /// Enqueue a message on the cli channel
    Send {
        /// Message to send, e.g. "@coder fix the bug"
        message: String,

        /// Sender display name
        #[arg(long, default_value = "operator")]
        sender: String,

        /// Sender ID
        #[arg(long, default_value = "cli")]
        sender_id: String,
    },

    /// Queue operations
    Queue {
        #[command(subcommand)]
        action: QueueCommand,
    },

    /// Print outgoing messages (the cli channel consumer)
    Outgoing {
        /// Delete entries after printing them
        #[arg(long)]
        drain: bool,
    },
}

#[derive(Subcommand)]
pub enum QueueCommand {
    /// Show entry counts per partition and active conversations
    Status,

    /// List entries in a partition (incoming, processing, outgoing)
    List { partition: String },

    /// Move abandoned processing entries back to incoming
    Recover,
}

fn open_queue() -> Result<FileQueue> {
    let settings = config::load_settings().unwrap_or_default();
    let queue = FileQueue::new(config::get_queue_dir()?)?
        .with_orphan_threshold(Duration::from_secs(settings.queue.orphan_threshold_secs));
    Ok(queue)
}

fn parse_partition(name: &str) -> Result<Partition> {
    match name {
        "incoming" => Ok(Partition::Incoming),
        "processing" => Ok(Partition::Processing),
        "outgoing" => Ok(Partition::Outgoing),
        other => anyhow::bail!("Unknown partition: {} (expected incoming, processing or outgoing)", other),
    }
}

impl Commands {
    pub async fn run(self) -> Result<()> {
        match self.command {
            Command::Start => run_start().await,
            Command::Send {
                message,
                sender,
                sender_id,
            } => {
                let queue = open_queue()?;
                let data = MessageData::new("cli", &sender, &sender_id, &message);
                let path = queue.enqueue(&data, Partition::Incoming)?;
                println!("Enqueued {} as {}", data.message_id, path.display());
                Ok(())
            }
            Command::Queue { action } => run_queue(action),
            Command::Outgoing { drain } => {
                let queue = open_queue()?;
                for entry in queue.iter_outgoing()? {
                    println!("[{}] {}: {}", entry.data.channel, entry.data.sender, entry.data.message);
                    if drain {
                        queue.delete_outgoing(&entry.path)?;
                    }
                }
                Ok(())
            }
        }
    }
}

async fn run_start() -> Result<()> {
    let settings = config::load_settings()?;

    let queue = Arc::new(
        FileQueue::new(config::get_queue_dir()?)?
            .with_orphan_threshold(Duration::from_secs(settings.queue.orphan_threshold_secs)),
    );
    let tracker = Arc::new(ConversationTracker::new(
        config::get_queue_dir()?.join("conversations"),
        settings.conversations.max_messages,
    )?);

    let orchestrator = Arc::new(Orchestrator::new(
        Arc::new(FileSettings::new(config::get_settings_path()?)),
        queue,
        tracker,
        Arc::new(CommandInvoker::new()),
    ));

    orchestrator.run().await?;
    Ok(())
}

fn run_queue(action: QueueCommand) -> Result<()> {
    let queue = open_queue()?;

    match action {
        QueueCommand::Status => {
            let incoming = queue.size(Partition::Incoming)?;
            let processing = queue.size(Partition::Processing)?;
            let outgoing = queue.size(Partition::Outgoing)?;

            println!("Queue status:");
            println!("  Incoming:   {}", incoming);
            println!("  Processing: {}", processing);
            println!("  Outgoing:   {}", outgoing);
            println!("  Total:      {}", incoming + processing + outgoing);

            let settings = config::load_settings().unwrap_or_default();
            let tracker = ConversationTracker::new(
                config::get_queue_dir()?.join("conversations"),
                settings.conversations.max_messages,
            )?;
            println!("  Active conversations: {}", tracker.active_count());
            Ok(())
        }
        QueueCommand::List { partition } => {
            let partition = parse_partition(&partition)?;
            match partition {
                Partition::Outgoing => {
                    for entry in queue.iter_outgoing()? {
                        println!(
                            "{}  [{}] {}",
                            entry.data.message_id,
                            entry.data.channel,
                            preview(&entry.data.message)
                        );
                    }
                }
                _ => {
                    // Incoming and processing entries are claimed by the
                    // orchestrator; just show the raw tree.
                    println!("{} entries in {}", queue.size(partition)?, partition);
                }
            }
            Ok(())
        }
        QueueCommand::Recover => {
            let recovered = queue.recover_orphaned()?;
            println!("Recovered {} orphaned messages", recovered);
            Ok(())
        }
    }
}

fn preview(message: &str) -> String {
    let mut preview: String = message.chars().take(60).collect();
    if preview.len() < message.len() {
        preview.push_str("...");
    }
    preview.replace('\n', " ")
}
