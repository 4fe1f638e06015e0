//! # Engine Orchestration
//!
//! The top-level coordinator tying presence, queueing, routing, transfer,
//! session tracking, and event publication together behind one façade.
//! [`ChatCenterEngine`](core::ChatCenterEngine) is the only type a real-time
//! server needs to drive the whole system.

pub mod core;
pub mod state;

pub use core::{ChatCenterEngine, RequestOutcome, SweepReport};
pub use state::TenantState;
