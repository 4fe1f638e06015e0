//! # Agent Presence
//!
//! Tracks each agent's connection set and availability across simultaneous
//! devices, including the heartbeat bookkeeping used to detect silent
//! disconnects.

pub mod registry;

pub use registry::{
    AgentPresence, AvailabilityCriteria, ConnectionRemoved, PresenceRegistry, StatusChange,
};
