//! Agentry library root.

pub mod cli;
pub mod config;
pub mod core;
pub mod error;
pub mod invoker;
pub mod logging;
pub mod orchestrator;

pub use cli::Commands;
pub use config::{load_settings, Settings, SettingsSource};
pub use core::{ConversationTracker, FileQueue, MessageData, Partition, QueuedMessage};
pub use error::{Error, Result};
pub use invoker::{AgentInvoker, CommandInvoker};
pub use orchestrator::Orchestrator;
