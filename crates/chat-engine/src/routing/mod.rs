//! # Conversation Routing
//!
//! Assignment of queued conversations to eligible agents, including the
//! resolution of concurrent accept races and automatic backlog draining.

pub mod engine;

pub use engine::{AssignmentOutcome, RoutingEngine};
