//! Core coordination modules: queue, routing, conversations, types.

pub mod conversation;
pub mod queue;
pub mod routing;
pub mod types;

pub use conversation::ConversationTracker;
pub use queue::{FileQueue, Partition};
pub use types::{ChainStep, Conversation, MessageData, QueuedMessage, TeamContext, TeamMember};
