//! # Ownership Transfer and Escalation
//!
//! Moves conversation ownership between agents (transfer) or toward another
//! tier (escalation) without ever exposing an ownerless, unqueued ticket.

pub mod coordinator;

pub use coordinator::{TransferCoordinator, TransferOutcome};
