//! # Conversation Tickets
//!
//! The routing-relevant record of a conversation awaiting or under human
//! handling. A [`ConversationTicket`] carries the ownership binding (at most
//! one agent at a time), the monotonic `assignment_version` used to reject
//! stale operations, and the state machine that guards every transition:
//!
//! ```text
//! Waiting ──► Assigned ──► Active ──┬─► Transferring ──► Assigned(new owner)
//!    │            │                 └─► Escalated ─────► Assigned(target) | Waiting
//!    │            │
//!    └────────────┴──────────────────────► Ended
//! ```
//!
//! `Ended` is terminal and reachable from any non-Waiting state (conversation
//! closed) or directly from Waiting (abandoned before pickup).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::agent::{AgentId, ConversationId, TenantId};
use crate::error::{ChatEngineError, Result};

/// Priority class of a waiting conversation
///
/// Within a class the queue is strict FIFO by enqueue time; higher classes
/// jump ahead of lower ones. `Escalated` is reserved for conversations
/// requeued by an escalation or returned after an owner disappeared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PriorityClass {
    /// Regular first-contact conversation
    Normal,

    /// Elevated priority (VIP customer, SLA pressure)
    High,

    /// Requeued by escalation or owner loss; always served first
    Escalated,
}

impl PriorityClass {
    /// Numeric rank used for queue ordering (higher serves first)
    pub fn rank(&self) -> u8 {
        match self {
            PriorityClass::Normal => 0,
            PriorityClass::High => 1,
            PriorityClass::Escalated => 2,
        }
    }
}

/// Lifecycle state of a conversation ticket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TicketState {
    /// In the tenant queue, awaiting an agent
    Waiting,

    /// Owned by an agent who has not yet engaged
    Assigned,

    /// Owned and actively being handled
    Active,

    /// Mid-transfer between agents
    Transferring,

    /// Mid-escalation to another tier
    Escalated,

    /// Terminal: closed or abandoned
    Ended,
}

impl TicketState {
    /// Whether this state is terminal
    pub fn is_terminal(&self) -> bool {
        matches!(self, TicketState::Ended)
    }

    /// Whether the ticket is owned by an agent in this state
    pub fn is_owned(&self) -> bool {
        matches!(
            self,
            TicketState::Assigned | TicketState::Active | TicketState::Transferring | TicketState::Escalated
        )
    }

    /// Whether `next` is a legal successor of this state
    pub fn can_transition_to(&self, next: TicketState) -> bool {
        use TicketState::*;
        match (self, next) {
            // Assignment out of the queue
            (Waiting, Assigned) => true,
            // Abandonment before pickup
            (Waiting, Ended) => true,
            // Agent engages
            (Assigned, Active) => true,
            // Transfer / escalation can start before or after engagement
            (Assigned, Transferring) | (Active, Transferring) => true,
            (Assigned, Escalated) | (Active, Escalated) => true,
            // Transfer completes to the new owner, or falls back to the queue
            (Transferring, Assigned) | (Transferring, Waiting) => true,
            // Escalation lands on a direct target or requeues
            (Escalated, Assigned) | (Escalated, Waiting) => true,
            // Close from any non-terminal owned state
            (Assigned, Ended) | (Active, Ended) | (Transferring, Ended) | (Escalated, Ended) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for TicketState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TicketState::Waiting => "waiting",
            TicketState::Assigned => "assigned",
            TicketState::Active => "active",
            TicketState::Transferring => "transferring",
            TicketState::Escalated => "escalated",
            TicketState::Ended => "ended",
        };
        write!(f, "{}", s)
    }
}

/// The routing record of one conversation
///
/// Created when a conversation needs human handling (escalation from the bot
/// or a direct request) and destroyed when the conversation closes or is
/// abandoned. Ownership transitions are produced exclusively by the routing
/// engine and the transfer coordinator, always under the tenant lock, so
/// `assignment_version` is strictly monotonic per conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTicket {
    /// Conversation this ticket routes
    pub conversation_id: ConversationId,

    /// Owning tenant
    pub tenant_id: TenantId,

    /// When the ticket first entered the queue
    pub enqueued_at: DateTime<Utc>,

    /// Queue priority class
    pub priority: PriorityClass,

    /// Current lifecycle state
    pub state: TicketState,

    /// Current owner, if any
    pub assigned_agent: Option<AgentId>,

    /// Monotonic counter, bumped on every ownership change
    pub assignment_version: u64,

    /// Capability tags an agent must carry to take this conversation
    pub required_skills: Vec<String>,
}

impl ConversationTicket {
    /// Create a fresh Waiting ticket
    pub fn new(
        conversation_id: ConversationId,
        tenant_id: TenantId,
        priority: PriorityClass,
        required_skills: Vec<String>,
    ) -> Self {
        Self {
            conversation_id,
            tenant_id,
            enqueued_at: Utc::now(),
            priority,
            state: TicketState::Waiting,
            assigned_agent: None,
            assignment_version: 0,
            required_skills,
        }
    }

    /// Move to `next`, enforcing the state machine
    ///
    /// Does not touch ownership or the version counter; callers pair this
    /// with [`claim`](Self::claim) / [`release_to_queue`](Self::release_to_queue)
    /// in the same critical section.
    pub fn transition(&mut self, next: TicketState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(ChatEngineError::invalid_transition(format!(
                "conversation {} cannot move {} -> {}",
                self.conversation_id, self.state, next
            )));
        }
        self.state = next;
        Ok(())
    }

    /// Verify the caller's view of the assignment is current
    ///
    /// `None` skips the check (trusted internal callers); a mismatch is the
    /// expected lost-race outcome, reported as `RoutingConflict`.
    pub fn check_version(&self, expected: Option<u64>) -> Result<()> {
        if let Some(expected) = expected {
            if expected != self.assignment_version {
                return Err(ChatEngineError::routing_conflict(format!(
                    "conversation {} was taken by another operation",
                    self.conversation_id
                )));
            }
        }
        Ok(())
    }

    /// Bind ownership to `agent` and bump the version
    pub fn claim(&mut self, agent: AgentId) {
        self.assigned_agent = Some(agent);
        self.assignment_version += 1;
    }

    /// Drop ownership, bump the version, and mark the ticket Waiting
    ///
    /// The caller must re-insert the ticket into the tenant queue in the
    /// same critical section — a released ticket outside the queue violates
    /// the no-ownerless-window invariant.
    pub fn release_to_queue(&mut self, priority: PriorityClass) {
        self.assigned_agent = None;
        self.assignment_version += 1;
        self.priority = priority;
        self.state = TicketState::Waiting;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ticket() -> ConversationTicket {
        ConversationTicket::new(
            ConversationId::from("conv-1"),
            TenantId::from("acme"),
            PriorityClass::Normal,
            vec![],
        )
    }

    #[test]
    fn legal_lifecycle_paths() {
        let mut t = ticket();
        t.transition(TicketState::Assigned).unwrap();
        t.transition(TicketState::Active).unwrap();
        t.transition(TicketState::Transferring).unwrap();
        t.transition(TicketState::Assigned).unwrap();
        t.transition(TicketState::Escalated).unwrap();
        t.transition(TicketState::Waiting).unwrap();
        t.transition(TicketState::Ended).unwrap();
        assert!(t.state.is_terminal());
    }

    #[test]
    fn illegal_transitions_are_rejected() {
        let mut t = ticket();
        assert!(t.transition(TicketState::Active).is_err());

        let mut t = ticket();
        t.transition(TicketState::Ended).unwrap();
        assert!(t.transition(TicketState::Assigned).is_err());
    }

    #[test]
    fn version_check_flags_stale_callers() {
        let mut t = ticket();
        t.transition(TicketState::Assigned).unwrap();
        t.claim(AgentId::from("a1"));
        assert_eq!(t.assignment_version, 1);

        assert!(t.check_version(Some(1)).is_ok());
        assert!(matches!(
            t.check_version(Some(0)),
            Err(ChatEngineError::RoutingConflict(_))
        ));
        assert!(t.check_version(None).is_ok());
    }

    #[test]
    fn release_requeues_with_new_priority() {
        let mut t = ticket();
        t.transition(TicketState::Assigned).unwrap();
        t.claim(AgentId::from("a1"));
        t.release_to_queue(PriorityClass::Escalated);
        assert_eq!(t.state, TicketState::Waiting);
        assert_eq!(t.assigned_agent, None);
        assert_eq!(t.assignment_version, 2);
        assert_eq!(t.priority, PriorityClass::Escalated);
    }
}
