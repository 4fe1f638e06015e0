//! # Agent Identity and Profile Types
//!
//! Core types describing support agents: strongly-typed identifiers, the
//! availability status enumeration, and the registration profile handed to
//! the engine when an agent first connects. Live per-agent state (connection
//! set, owned conversations, heartbeat clock) lives in
//! [`presence`](crate::presence), not here.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Agent availability status
///
/// Represents the aggregated availability of an agent across all of their
/// simultaneous connections (tabs, devices). Routing eligibility requires
/// [`Online`](AgentStatus::Online); `Busy` and `Away` are visible to
/// supervisors and customers but receive no new conversations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AgentStatus {
    /// Agent is available for new conversations
    Online,

    /// Agent is handling conversations and opted out of new assignments
    Busy,

    /// Agent is temporarily away (lunch, meeting)
    Away,

    /// Agent has no live connections
    Offline,
}

impl std::str::FromStr for AgentStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "online" | "Online" | "ONLINE" => Ok(AgentStatus::Online),
            "busy" | "Busy" | "BUSY" => Ok(AgentStatus::Busy),
            "away" | "Away" | "AWAY" => Ok(AgentStatus::Away),
            "offline" | "Offline" | "OFFLINE" => Ok(AgentStatus::Offline),
            _ => Err(format!("Unknown agent status: {}", s)),
        }
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentStatus::Online => write!(f, "online"),
            AgentStatus::Busy => write!(f, "busy"),
            AgentStatus::Away => write!(f, "away"),
            AgentStatus::Offline => write!(f, "offline"),
        }
    }
}

/// Agent registration profile
///
/// The information supplied when an agent joins presence for the first time.
/// Skills are free-form capability tags (language, customer segment, product
/// area) matched against a ticket's required skills during routing.
///
/// # Examples
///
/// ```
/// use livedesk_chat_engine::agent::{Agent, AgentId};
/// use livedesk_chat_engine::TenantId;
///
/// let agent = Agent {
///     id: AgentId::from("agent-001"),
///     tenant_id: TenantId::from("acme"),
///     display_name: "Alice Smith".to_string(),
///     skills: vec!["english".to_string(), "billing".to_string()],
///     max_concurrent_conversations: 3,
/// };
/// assert_eq!(agent.id.to_string(), "agent-001");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    /// Unique agent identifier
    pub id: AgentId,

    /// Tenant this agent belongs to
    pub tenant_id: TenantId,

    /// Human-readable agent name
    pub display_name: String,

    /// Capability tags used for routing (language, segment, product area)
    pub skills: Vec<String>,

    /// Maximum number of conversations this agent handles at once
    pub max_concurrent_conversations: usize,
}

macro_rules! string_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl From<String> for $name {
            fn from(s: String) -> Self {
                $name(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                $name(s.to_string())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id! {
    /// Agent identifier for strongly-typed agent references
    AgentId
}

string_id! {
    /// Tenant identifier scoping all presence and queue state
    TenantId
}

string_id! {
    /// Conversation identifier
    ConversationId
}

string_id! {
    /// Identifier of a single real-time connection (one tab / one device)
    ConnectionId
}

string_id! {
    /// Identifier of one bounded agent-handling session on a conversation
    SessionId
}

impl SessionId {
    /// Generate a fresh random session id
    pub fn generate() -> Self {
        SessionId(format!("sess-{}", uuid::Uuid::new_v4()))
    }
}

impl ConnectionId {
    /// Generate a fresh random connection id
    pub fn generate() -> Self {
        ConnectionId(format!("conn-{}", uuid::Uuid::new_v4()))
    }
}
