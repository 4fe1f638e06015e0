//! # Outbound Event System
//!
//! Every successful mutation of presence, queue, or ticket state produces
//! exactly one fact, published once with every topic it belongs to. A
//! status change that interests both the tenant-wide dashboard and the
//! agent's own devices is one event carrying two topics — not two
//! independent publishes — so clients subscribed to overlapping topics
//! never handle the same change twice.
//!
//! Delivery is fire-and-forget: a publish failure is logged and never rolls
//! back the routing decision that produced the fact.
//!
//! ## Examples
//!
//! ```
//! use livedesk_chat_engine::monitoring::{EventPublisher, ChatEvent, Topic};
//! use livedesk_chat_engine::agent::{AgentId, AgentStatus};
//! use livedesk_chat_engine::TenantId;
//!
//! # async fn example() {
//! let publisher = EventPublisher::new(64);
//! let mut rx = publisher.subscribe();
//!
//! publisher.publish(ChatEvent::AgentStatusChanged {
//!     tenant_id: TenantId::from("acme"),
//!     agent_id: AgentId::from("agent-001"),
//!     previous: AgentStatus::Online,
//!     status: AgentStatus::Away,
//! });
//!
//! let published = rx.recv().await.unwrap();
//! assert!(published.topics.contains(&Topic::Tenant(TenantId::from("acme"))));
//! assert!(published.topics.contains(&Topic::Agent(AgentId::from("agent-001"))));
//! # }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::agent::{AgentId, AgentStatus, ConversationId, TenantId};
use crate::conversation::PriorityClass;

/// Subscription topic a fact is addressed to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Topic {
    /// Everyone watching a tenant (dashboards, supervisor views)
    Tenant(TenantId),

    /// One agent's devices
    Agent(AgentId),

    /// Everyone following one conversation
    Conversation(ConversationId),
}

/// State-change facts broadcast to subscribed clients
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ChatEvent {
    /// An agent came online (first connection of a stint)
    AgentJoined {
        tenant_id: TenantId,
        agent_id: AgentId,
    },

    /// An agent went offline (last connection closed or heartbeat lapsed)
    AgentLeft {
        tenant_id: TenantId,
        agent_id: AgentId,
        /// True when the heartbeat sweep forced the departure
        heartbeat_lapsed: bool,
    },

    /// An agent's availability changed
    AgentStatusChanged {
        tenant_id: TenantId,
        agent_id: AgentId,
        previous: AgentStatus,
        status: AgentStatus,
    },

    /// A conversation was bound to an agent
    ConversationAssigned {
        tenant_id: TenantId,
        conversation_id: ConversationId,
        agent_id: AgentId,
        assignment_version: u64,
    },

    /// A waiting conversation left the queue — tenant-wide removal signal
    ConversationTaken {
        tenant_id: TenantId,
        conversation_id: ConversationId,
        agent_id: AgentId,
    },

    /// Ownership moved between agents
    ConversationTransferred {
        tenant_id: TenantId,
        conversation_id: ConversationId,
        from_agent: AgentId,
        /// `None` when the transfer fell back to the queue
        to_agent: Option<AgentId>,
        assignment_version: u64,
        reason: String,
    },

    /// A conversation was escalated to another tier
    ConversationEscalated {
        tenant_id: TenantId,
        conversation_id: ConversationId,
        from_agent: AgentId,
        /// `None` when the escalation requeued instead of landing on a
        /// direct target
        target_agent: Option<AgentId>,
        assignment_version: u64,
        reason: String,
    },

    /// A conversation re-entered the queue (orphaned or failed transfer)
    ConversationRequeued {
        tenant_id: TenantId,
        conversation_id: ConversationId,
        priority: PriorityClass,
        position: usize,
    },

    /// Operator alert: an invariant violation was detected and repaired
    TicketInconsistency {
        tenant_id: TenantId,
        conversation_id: ConversationId,
        detail: String,
    },
}

impl ChatEvent {
    /// Tenant this fact belongs to
    pub fn tenant_id(&self) -> &TenantId {
        match self {
            ChatEvent::AgentJoined { tenant_id, .. }
            | ChatEvent::AgentLeft { tenant_id, .. }
            | ChatEvent::AgentStatusChanged { tenant_id, .. }
            | ChatEvent::ConversationAssigned { tenant_id, .. }
            | ChatEvent::ConversationTaken { tenant_id, .. }
            | ChatEvent::ConversationTransferred { tenant_id, .. }
            | ChatEvent::ConversationEscalated { tenant_id, .. }
            | ChatEvent::ConversationRequeued { tenant_id, .. }
            | ChatEvent::TicketInconsistency { tenant_id, .. } => tenant_id,
        }
    }

    /// Every topic this fact should reach
    ///
    /// Always includes the tenant-wide topic, plus the per-agent and
    /// per-conversation topics where they apply.
    pub fn topics(&self) -> Vec<Topic> {
        let mut topics = vec![Topic::Tenant(self.tenant_id().clone())];
        match self {
            ChatEvent::AgentJoined { agent_id, .. }
            | ChatEvent::AgentLeft { agent_id, .. }
            | ChatEvent::AgentStatusChanged { agent_id, .. } => {
                topics.push(Topic::Agent(agent_id.clone()));
            }
            ChatEvent::ConversationAssigned {
                conversation_id, agent_id, ..
            }
            | ChatEvent::ConversationTaken {
                conversation_id, agent_id, ..
            } => {
                topics.push(Topic::Agent(agent_id.clone()));
                topics.push(Topic::Conversation(conversation_id.clone()));
            }
            ChatEvent::ConversationTransferred {
                conversation_id,
                from_agent,
                to_agent,
                ..
            } => {
                topics.push(Topic::Agent(from_agent.clone()));
                if let Some(to) = to_agent {
                    topics.push(Topic::Agent(to.clone()));
                }
                topics.push(Topic::Conversation(conversation_id.clone()));
            }
            ChatEvent::ConversationEscalated {
                conversation_id,
                from_agent,
                target_agent,
                ..
            } => {
                topics.push(Topic::Agent(from_agent.clone()));
                if let Some(target) = target_agent {
                    topics.push(Topic::Agent(target.clone()));
                }
                topics.push(Topic::Conversation(conversation_id.clone()));
            }
            ChatEvent::ConversationRequeued { conversation_id, .. }
            | ChatEvent::TicketInconsistency { conversation_id, .. } => {
                topics.push(Topic::Conversation(conversation_id.clone()));
            }
        }
        topics
    }
}

/// A fact together with its addressing and publish time
#[derive(Debug, Clone)]
pub struct PublishedEvent {
    /// Topics the fact is addressed to
    pub topics: Vec<Topic>,

    /// The fact itself
    pub event: ChatEvent,

    /// When it was published
    pub published_at: DateTime<Utc>,
}

/// Broadcast fan-out of chat engine facts
///
/// Thin wrapper over a `tokio::sync::broadcast` channel. The real-time
/// transport subscribes once and filters by topic; slow subscribers may
/// observe `Lagged` and are expected to resynchronize from current state.
pub struct EventPublisher {
    tx: broadcast::Sender<PublishedEvent>,
}

impl EventPublisher {
    /// Create a publisher with the given channel capacity
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to every published fact
    pub fn subscribe(&self) -> broadcast::Receiver<PublishedEvent> {
        self.tx.subscribe()
    }

    /// Publish one fact to all of its topics
    ///
    /// Fire-and-forget: an error (no live subscribers) is logged at debug
    /// level and otherwise ignored.
    pub fn publish(&self, event: ChatEvent) {
        let published = PublishedEvent {
            topics: event.topics(),
            event,
            published_at: Utc::now(),
        };
        if let Err(e) = self.tx.send(published) {
            debug!("📡 No subscribers for event: {:?}", e.0.event);
        }
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn one_fact_carries_both_topics() {
        let publisher = EventPublisher::new(16);
        let mut rx = publisher.subscribe();

        publisher.publish(ChatEvent::ConversationAssigned {
            tenant_id: TenantId::from("acme"),
            conversation_id: ConversationId::from("conv-1"),
            agent_id: AgentId::from("a1"),
            assignment_version: 1,
        });

        let published = rx.recv().await.unwrap();
        assert!(published.topics.contains(&Topic::Tenant(TenantId::from("acme"))));
        assert!(published.topics.contains(&Topic::Agent(AgentId::from("a1"))));
        assert!(published
            .topics
            .contains(&Topic::Conversation(ConversationId::from("conv-1"))));
    }

    #[test]
    fn publish_without_subscribers_is_silent() {
        let publisher = EventPublisher::new(16);
        publisher.publish(ChatEvent::AgentJoined {
            tenant_id: TenantId::from("acme"),
            agent_id: AgentId::from("a1"),
        });
        assert_eq!(publisher.subscriber_count(), 0);
    }
}
