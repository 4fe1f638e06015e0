//! # Agent Session Tracking
//!
//! Per (agent, conversation) join/leave bookkeeping feeding analytics.

pub mod tracker;

pub use tracker::{AgentSession, LeaveReason, SessionFact, SessionTracker};
