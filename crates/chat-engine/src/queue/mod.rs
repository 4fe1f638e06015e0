//! # Tenant Conversation Queues
//!
//! Ordered backlog of Waiting conversations, one queue per tenant.

pub mod manager;

pub use manager::{ConversationQueue, QueueEntry, QueueStats};
