//! # Monitoring and Outbound Facts
//!
//! State-change facts broadcast to subscribed clients.

pub mod events;

pub use events::{ChatEvent, EventPublisher, PublishedEvent, Topic};
