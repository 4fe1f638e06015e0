//! # LiveDesk Chat Engine
//!
//! Presence, queueing, and conversation-routing coordinator for a
//! multi-tenant live-support chat platform.
//!
//! This crate provides:
//! - Agent presence across multiple simultaneous connections, with
//!   heartbeat-based failure detection
//! - Per-tenant priority queues of conversations awaiting a human agent
//! - Race-safe assignment: concurrent accepts resolve to exactly one owner
//! - Transfer and escalation between agents and tiers, never leaving a
//!   conversation both unowned and unqueued
//! - Session tracking with analytics facts on every close
//! - A topic-addressed event stream for real-time clients and dashboards
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │                   ChatCenterEngine                     │
//! │                    (orchestrator)                      │
//! ├──────────────┬──────────────┬──────────────────────────┤
//! │ Presence     │ Routing      │ Transfer                 │
//! │ Registry     │ Engine       │ Coordinator              │
//! ├──────────────┴──────┬───────┴──────────────────────────┤
//! │ TenantState (per-tenant lock):                         │
//! │   ConversationTicket table + ConversationQueue         │
//! ├─────────────────────┼──────────────────────────────────┤
//! │ SessionTracker      │ EventPublisher                   │
//! │   → AnalyticsSink   │   → broadcast subscribers        │
//! └─────────────────────┴──────────────────────────────────┘
//!            │
//!            ▼
//!     ConversationStore (durable owner record, recovery)
//! ```
//!
//! All routing-relevant mutation for one tenant happens under that tenant's
//! async lock, which is what makes dequeue-plus-assign atomic and the
//! per-conversation `assignment_version` strictly monotonic. Presence lives
//! in a shared concurrent registry; capacity claims are made inside the
//! tenant critical sections so ownership and capacity never disagree.
//!
//! ## Quick start
//!
//! ```
//! use livedesk_chat_engine::orchestrator::{ChatCenterEngine, RequestOutcome};
//! use livedesk_chat_engine::config::ChatEngineConfig;
//! use livedesk_chat_engine::agent::{Agent, AgentId, ConnectionId};
//! use livedesk_chat_engine::conversation::PriorityClass;
//! use livedesk_chat_engine::{ConversationId, TenantId};
//!
//! # async fn example() -> livedesk_chat_engine::Result<()> {
//! let engine = ChatCenterEngine::new(ChatEngineConfig::default())?;
//!
//! engine.join_presence(
//!     &Agent {
//!         id: AgentId::from("agent-001"),
//!         tenant_id: TenantId::from("acme"),
//!         display_name: "Alice".to_string(),
//!         skills: vec!["english".to_string()],
//!         max_concurrent_conversations: 3,
//!     },
//!     ConnectionId::from("tab-1"),
//! ).await?;
//!
//! let outcome = engine.request_agent(
//!     &TenantId::from("acme"),
//!     ConversationId::from("conv-1"),
//!     PriorityClass::Normal,
//!     vec![],
//! ).await?;
//!
//! match outcome {
//!     RequestOutcome::Assigned(a) => println!("routed to {}", a.agent_id),
//!     RequestOutcome::Queued { position } => println!("waiting at {}", position),
//! }
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod config;
pub mod conversation;
pub mod error;
pub mod integration;
pub mod monitoring;
pub mod orchestrator;
pub mod presence;
pub mod queue;
pub mod routing;
pub mod sessions;
pub mod transfer;

pub use agent::{Agent, AgentId, AgentStatus, ConnectionId, ConversationId, SessionId, TenantId};
pub use config::ChatEngineConfig;
pub use conversation::{ConversationTicket, PriorityClass, TicketState};
pub use error::{ChatEngineError, Result};
pub use orchestrator::{ChatCenterEngine, RequestOutcome, SweepReport};
pub use routing::AssignmentOutcome;
pub use transfer::TransferOutcome;

/// Common imports for driving the engine from a real-time server
pub mod prelude {
    pub use crate::agent::{Agent, AgentId, AgentStatus, ConnectionId, ConversationId, SessionId, TenantId};
    pub use crate::config::ChatEngineConfig;
    pub use crate::conversation::{ConversationTicket, PriorityClass, TicketState};
    pub use crate::error::{ChatEngineError, Result};
    pub use crate::monitoring::{ChatEvent, EventPublisher, PublishedEvent, Topic};
    pub use crate::orchestrator::{ChatCenterEngine, RequestOutcome, SweepReport};
    pub use crate::presence::{AgentPresence, AvailabilityCriteria, PresenceRegistry};
    pub use crate::queue::{ConversationQueue, QueueStats};
    pub use crate::routing::{AssignmentOutcome, RoutingEngine};
    pub use crate::sessions::{LeaveReason, SessionFact, SessionTracker};
    pub use crate::transfer::{TransferCoordinator, TransferOutcome};
}
