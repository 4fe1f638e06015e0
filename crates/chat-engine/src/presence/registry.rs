//! # Presence Registry Implementation
//!
//! The authoritative record of which agents are connected, on how many
//! devices, with what availability, and which conversations they currently
//! own. An agent may hold several simultaneous connections (multiple tabs or
//! devices); the aggregate status only becomes Offline when the last
//! connection goes away.
//!
//! Real-time connections vanish without an explicit leave on network
//! failure, so the registry also keeps a heartbeat clock per agent:
//! [`touch`](PresenceRegistry::touch) records liveness and
//! [`expired_agents`](PresenceRegistry::expired_agents) feeds the engine's
//! sweep, which forces silent agents Offline and returns their conversations
//! to the front of the tenant queue.
//!
//! ## Examples
//!
//! ```
//! use livedesk_chat_engine::presence::{PresenceRegistry, AvailabilityCriteria};
//! use livedesk_chat_engine::agent::{Agent, AgentId, AgentStatus, ConnectionId};
//! use livedesk_chat_engine::TenantId;
//! use std::time::Duration;
//!
//! # fn example() -> livedesk_chat_engine::Result<()> {
//! let registry = PresenceRegistry::new(Duration::from_secs(2));
//!
//! let agent = Agent {
//!     id: AgentId::from("agent-001"),
//!     tenant_id: TenantId::from("acme"),
//!     display_name: "Alice".to_string(),
//!     skills: vec!["english".to_string()],
//!     max_concurrent_conversations: 2,
//! };
//!
//! let joined = registry.register_connection(&agent, ConnectionId::from("tab-1"))?;
//! assert!(joined);
//!
//! // A second tab does not re-announce the agent.
//! let joined = registry.register_connection(&agent, ConnectionId::from("tab-2"))?;
//! assert!(!joined);
//!
//! let available = registry.list_available(&TenantId::from("acme"), &AvailabilityCriteria::default());
//! assert_eq!(available.len(), 1);
//! # Ok(())
//! # }
//! ```

use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::agent::{Agent, AgentId, AgentStatus, ConnectionId, ConversationId, TenantId};
use crate::error::{ChatEngineError, Result};

/// Live presence state of one agent, aggregated across connections
#[derive(Debug, Clone)]
pub struct AgentPresence {
    /// Agent identity
    pub agent_id: AgentId,

    /// Owning tenant
    pub tenant_id: TenantId,

    /// Aggregate availability
    pub status: AgentStatus,

    /// Live connection ids (tabs, devices)
    pub connections: HashSet<ConnectionId>,

    /// Conversations this agent currently owns
    pub owned_conversations: HashSet<ConversationId>,

    /// Concurrency cap for this agent
    pub max_concurrent_conversations: usize,

    /// Capability tags used by routing
    pub skills: Vec<String>,

    /// When the current presence began (first connection of this stint)
    pub joined_at: DateTime<Utc>,

    /// Last heartbeat or operation observed from this agent
    pub last_activity_at: DateTime<Utc>,

    /// When a conversation was last bound to this agent; routing's
    /// longest-idle ranking reads this, not the heartbeat clock
    pub last_assigned_at: DateTime<Utc>,

    /// Last status actually broadcast, with its timestamp (debounce state)
    last_broadcast: Option<(AgentStatus, DateTime<Utc>)>,
}

impl AgentPresence {
    /// Whether this agent can take one more conversation right now
    pub fn has_capacity(&self) -> bool {
        self.owned_conversations.len() < self.max_concurrent_conversations
    }

    /// Whether routing may hand this agent a new conversation
    pub fn is_routable(&self) -> bool {
        self.status == AgentStatus::Online && self.has_capacity()
    }

    /// Whether this agent carries every one of `required` skills
    pub fn matches_skills(&self, required: &[String]) -> bool {
        required.iter().all(|s| self.skills.contains(s))
    }
}

/// Filter used by [`PresenceRegistry::list_available`]
#[derive(Debug, Clone, Default)]
pub struct AvailabilityCriteria {
    /// Skills every returned agent must carry
    pub required_skills: Vec<String>,
}

/// Result of a status change request
#[derive(Debug, Clone)]
pub struct StatusChange {
    /// Status before the call
    pub previous: AgentStatus,

    /// Status after the call
    pub current: AgentStatus,

    /// Whether the change should be broadcast to subscribers
    ///
    /// False for identical repeats inside the debounce window — the
    /// registry has already announced this status.
    pub broadcast: bool,
}

/// Result of removing a connection or forcing an agent offline
#[derive(Debug, Clone)]
pub struct ConnectionRemoved {
    /// Agent the connection belonged to
    pub agent_id: AgentId,

    /// Tenant scope for requeueing
    pub tenant_id: TenantId,

    /// True when this was the last connection and the agent is now Offline
    pub went_offline: bool,

    /// Conversations surrendered by the agent, in need of front-of-queue
    /// re-insertion; empty unless `went_offline`
    pub orphaned_conversations: Vec<ConversationId>,
}

/// Registry of agent presence across all tenants
///
/// Backed by sharded concurrent maps; each agent entry is mutated under its
/// shard lock, which serializes per-agent updates. Cross-agent consistency
/// (ownership vs. ticket state) is the engine's job and happens under the
/// tenant state lock.
pub struct PresenceRegistry {
    /// agent_id -> live presence
    agents: DashMap<AgentId, AgentPresence>,

    /// connection_id -> agent_id reverse index
    connections: DashMap<ConnectionId, AgentId>,

    /// tenant_id -> member agents
    tenants: DashMap<TenantId, HashSet<AgentId>>,

    /// Window inside which identical status repeats are not re-broadcast
    status_debounce: Duration,
}

impl PresenceRegistry {
    /// Create an empty registry with the given status debounce window
    pub fn new(status_debounce: Duration) -> Self {
        Self {
            agents: DashMap::new(),
            connections: DashMap::new(),
            tenants: DashMap::new(),
            status_debounce,
        }
    }

    /// Register a connection for an agent
    ///
    /// Creates the presence on the first connection (status Online) or adds
    /// a device to an existing presence. Returns `true` when the agent just
    /// came online — the caller announces `AgentJoined` only then.
    ///
    /// # Errors
    ///
    /// `Unauthorized` if the profile's tenant differs from the tenant the
    /// agent is already registered under.
    pub fn register_connection(&self, profile: &Agent, conn: ConnectionId) -> Result<bool> {
        let now = Utc::now();
        let mut came_online = false;

        match self.agents.get_mut(&profile.id) {
            Some(mut presence) => {
                if presence.tenant_id != profile.tenant_id {
                    return Err(ChatEngineError::unauthorized(format!(
                        "agent {} is registered under another tenant",
                        profile.id
                    )));
                }
                if presence.status == AgentStatus::Offline {
                    // Returning agent: fresh stint.
                    presence.status = AgentStatus::Online;
                    presence.joined_at = now;
                    presence.last_broadcast = Some((AgentStatus::Online, now));
                    came_online = true;
                }
                presence.connections.insert(conn.clone());
                presence.last_activity_at = now;
                debug!(
                    "🔗 Agent {} added connection {} ({} total)",
                    profile.id,
                    conn,
                    presence.connections.len()
                );
            }
            None => {
                let mut connections = HashSet::new();
                connections.insert(conn.clone());
                self.agents.insert(
                    profile.id.clone(),
                    AgentPresence {
                        agent_id: profile.id.clone(),
                        tenant_id: profile.tenant_id.clone(),
                        status: AgentStatus::Online,
                        connections,
                        owned_conversations: HashSet::new(),
                        max_concurrent_conversations: profile.max_concurrent_conversations,
                        skills: profile.skills.clone(),
                        joined_at: now,
                        last_activity_at: now,
                        last_assigned_at: now,
                        last_broadcast: Some((AgentStatus::Online, now)),
                    },
                );
                self.tenants
                    .entry(profile.tenant_id.clone())
                    .or_default()
                    .insert(profile.id.clone());
                came_online = true;
                info!("👤 Agent {} joined presence for tenant {}", profile.id, profile.tenant_id);
            }
        }

        self.connections.insert(conn, profile.id.clone());
        Ok(came_online)
    }

    /// Remove a connection (explicit leave or transport close)
    ///
    /// When the last connection goes away the agent is marked Offline and
    /// surrenders every owned conversation; the caller requeues them at the
    /// front of the tenant queue in the same operation.
    pub fn remove_connection(&self, conn: &ConnectionId) -> Result<ConnectionRemoved> {
        let (_, agent_id) = self
            .connections
            .remove(conn)
            .ok_or_else(|| ChatEngineError::not_found(format!("unknown connection {}", conn)))?;

        let mut presence = self.agents.get_mut(&agent_id).ok_or_else(|| {
            ChatEngineError::internal(format!("connection {} mapped to unknown agent {}", conn, agent_id))
        })?;

        presence.connections.remove(conn);
        let went_offline = presence.connections.is_empty();
        let orphaned = if went_offline {
            presence.status = AgentStatus::Offline;
            presence.last_broadcast = Some((AgentStatus::Offline, Utc::now()));
            presence.owned_conversations.drain().collect()
        } else {
            Vec::new()
        };

        if went_offline {
            info!("🔌 Agent {} went offline (last connection {} closed)", agent_id, conn);
        } else {
            debug!(
                "🔌 Agent {} closed connection {} ({} remaining)",
                agent_id,
                conn,
                presence.connections.len()
            );
        }

        Ok(ConnectionRemoved {
            agent_id: agent_id.clone(),
            tenant_id: presence.tenant_id.clone(),
            went_offline,
            orphaned_conversations: orphaned,
        })
    }

    /// Force an agent offline (heartbeat expiry)
    ///
    /// Drops every connection the registry still believes exists — the
    /// transport never told us about their death — and surrenders owned
    /// conversations exactly like a last-connection close.
    pub fn force_offline(&self, agent_id: &AgentId) -> Result<ConnectionRemoved> {
        let mut presence = self
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| ChatEngineError::not_found(format!("unknown agent {}", agent_id)))?;
        let (dead_connections, removed) = Self::take_offline(&mut presence);
        drop(presence);

        for conn in &dead_connections {
            self.connections.remove(conn);
        }

        warn!(
            "💔 Agent {} forced offline after heartbeat lapse ({} dead connections, {} orphaned conversations)",
            agent_id,
            dead_connections.len(),
            removed.orphaned_conversations.len()
        );
        Ok(removed)
    }

    /// Force an agent offline only if they are still silent past `timeout`
    ///
    /// The sweep lists expired agents without any lock, so a heartbeat can
    /// land between the listing and the takedown. The expiry is rechecked
    /// here under the agent's entry lock; a revived agent returns `None`
    /// and keeps their presence untouched.
    pub fn force_offline_if_expired(
        &self,
        agent_id: &AgentId,
        timeout: Duration,
    ) -> Result<Option<ConnectionRemoved>> {
        let mut presence = self
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| ChatEngineError::not_found(format!("unknown agent {}", agent_id)))?;

        let cutoff = Utc::now()
            - chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::seconds(0));
        if presence.status == AgentStatus::Offline || presence.last_activity_at >= cutoff {
            return Ok(None);
        }

        let (dead_connections, removed) = Self::take_offline(&mut presence);
        drop(presence);

        for conn in &dead_connections {
            self.connections.remove(conn);
        }

        warn!(
            "💔 Agent {} forced offline after heartbeat lapse ({} dead connections, {} orphaned conversations)",
            agent_id,
            dead_connections.len(),
            removed.orphaned_conversations.len()
        );
        Ok(Some(removed))
    }

    /// Drain connections and owned conversations under the entry lock
    fn take_offline(presence: &mut AgentPresence) -> (Vec<ConnectionId>, ConnectionRemoved) {
        let dead_connections: Vec<ConnectionId> = presence.connections.drain().collect();
        presence.status = AgentStatus::Offline;
        presence.last_broadcast = Some((AgentStatus::Offline, Utc::now()));
        let orphaned: Vec<ConversationId> = presence.owned_conversations.drain().collect();
        (
            dead_connections,
            ConnectionRemoved {
                agent_id: presence.agent_id.clone(),
                tenant_id: presence.tenant_id.clone(),
                went_offline: true,
                orphaned_conversations: orphaned,
            },
        )
    }

    /// Change an agent's availability status
    ///
    /// Identical repeats inside the debounce window return
    /// `broadcast: false` so subscribers see exactly one
    /// `AgentStatusChanged` per effective change.
    pub fn set_status(&self, agent_id: &AgentId, status: AgentStatus) -> Result<StatusChange> {
        let mut presence = self
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| ChatEngineError::not_found(format!("unknown agent {}", agent_id)))?;

        if presence.connections.is_empty() && status != AgentStatus::Offline {
            return Err(ChatEngineError::invalid_transition(format!(
                "agent {} has no live connections",
                agent_id
            )));
        }

        let now = Utc::now();
        let previous = presence.status;
        presence.last_activity_at = now;

        let debounced = status == previous
            && presence
                .last_broadcast
                .map(|(last_status, at)| {
                    last_status == status
                        && now.signed_duration_since(at)
                            < chrono::Duration::from_std(self.status_debounce)
                                .unwrap_or_else(|_| chrono::Duration::seconds(0))
                })
                .unwrap_or(false);

        presence.status = status;
        if !debounced {
            presence.last_broadcast = Some((status, now));
            info!("🔄 Agent {} status: {} -> {}", agent_id, previous, status);
        } else {
            debug!("🔄 Agent {} repeated status {} inside debounce window", agent_id, status);
        }

        Ok(StatusChange {
            previous,
            current: status,
            broadcast: !debounced,
        })
    }

    /// Current status of an agent, if known
    pub fn get_status(&self, agent_id: &AgentId) -> Option<AgentStatus> {
        self.agents.get(agent_id).map(|p| p.status)
    }

    /// Snapshot of an agent's presence
    pub fn get_presence(&self, agent_id: &AgentId) -> Option<AgentPresence> {
        self.agents.get(agent_id).map(|p| p.clone())
    }

    /// Agents of `tenant` that routing may hand a conversation to
    ///
    /// Online, under capacity, and carrying every skill in the criteria.
    /// Never returns another tenant's agents.
    pub fn list_available(
        &self,
        tenant: &TenantId,
        criteria: &AvailabilityCriteria,
    ) -> Vec<AgentPresence> {
        let Some(members) = self.tenants.get(tenant) else {
            return Vec::new();
        };
        members
            .iter()
            .filter_map(|agent_id| self.agents.get(agent_id))
            .filter(|p| p.is_routable() && p.matches_skills(&criteria.required_skills))
            .map(|p| p.clone())
            .collect()
    }

    /// Record heartbeat activity for an agent
    pub fn touch(&self, agent_id: &AgentId) -> Result<()> {
        let mut presence = self
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| ChatEngineError::not_found(format!("unknown agent {}", agent_id)))?;
        presence.last_activity_at = Utc::now();
        Ok(())
    }

    /// Agents silent past `timeout` that are not already Offline
    pub fn expired_agents(&self, timeout: Duration) -> Vec<AgentId> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::seconds(0));
        self.agents
            .iter()
            .filter(|p| p.status != AgentStatus::Offline && p.last_activity_at < cutoff)
            .map(|p| p.agent_id.clone())
            .collect()
    }

    /// Bind a conversation to an agent, enforcing eligibility and capacity
    ///
    /// Called under the tenant lock so the capacity check and the insertion
    /// are atomic with the ticket mutation.
    pub fn try_claim(&self, agent_id: &AgentId, conversation: &ConversationId) -> Result<()> {
        let mut presence = self
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| ChatEngineError::not_found(format!("unknown agent {}", agent_id)))?;

        if presence.status != AgentStatus::Online {
            return Err(ChatEngineError::invalid_transition(format!(
                "agent {} is {} and not accepting new conversations",
                agent_id, presence.status
            )));
        }
        if !presence.has_capacity() {
            return Err(ChatEngineError::capacity(format!(
                "agent {} is at maximum load ({})",
                agent_id, presence.max_concurrent_conversations
            )));
        }

        presence.owned_conversations.insert(conversation.clone());
        let now = Utc::now();
        presence.last_activity_at = now;
        presence.last_assigned_at = now;
        Ok(())
    }

    /// Agent a live connection belongs to, if known
    pub fn agent_for_connection(&self, conn: &ConnectionId) -> Option<AgentId> {
        self.connections.get(conn).map(|a| a.clone())
    }

    /// Release a conversation from an agent's owned set
    pub fn release(&self, agent_id: &AgentId, conversation: &ConversationId) -> bool {
        match self.agents.get_mut(agent_id) {
            Some(mut presence) => presence.owned_conversations.remove(conversation),
            None => false,
        }
    }

    /// Every agent of `tenant` currently claiming `conversation`
    ///
    /// Used by the invariant check: a healthy system returns at most one id.
    pub fn owners_of(&self, tenant: &TenantId, conversation: &ConversationId) -> Vec<AgentId> {
        let Some(members) = self.tenants.get(tenant) else {
            return Vec::new();
        };
        members
            .iter()
            .filter_map(|agent_id| self.agents.get(agent_id))
            .filter(|p| p.owned_conversations.contains(conversation))
            .map(|p| p.agent_id.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(id: &str, tenant: &str, max: usize) -> Agent {
        Agent {
            id: AgentId::from(id),
            tenant_id: TenantId::from(tenant),
            display_name: id.to_string(),
            skills: vec!["english".to_string()],
            max_concurrent_conversations: max,
        }
    }

    #[test]
    fn offline_only_after_last_connection() {
        let registry = PresenceRegistry::new(Duration::from_millis(50));
        let a = agent("a1", "acme", 2);

        assert!(registry.register_connection(&a, ConnectionId::from("c1")).unwrap());
        assert!(!registry.register_connection(&a, ConnectionId::from("c2")).unwrap());

        let removed = registry.remove_connection(&ConnectionId::from("c1")).unwrap();
        assert!(!removed.went_offline);
        assert_eq!(registry.get_status(&a.id), Some(AgentStatus::Online));

        let removed = registry.remove_connection(&ConnectionId::from("c2")).unwrap();
        assert!(removed.went_offline);
        assert_eq!(registry.get_status(&a.id), Some(AgentStatus::Offline));
    }

    #[test]
    fn going_offline_surrenders_owned_conversations() {
        let registry = PresenceRegistry::new(Duration::from_millis(50));
        let a = agent("a1", "acme", 2);
        registry.register_connection(&a, ConnectionId::from("c1")).unwrap();
        registry.try_claim(&a.id, &ConversationId::from("conv-1")).unwrap();

        let removed = registry.remove_connection(&ConnectionId::from("c1")).unwrap();
        assert!(removed.went_offline);
        assert_eq!(removed.orphaned_conversations, vec![ConversationId::from("conv-1")]);
    }

    #[test]
    fn status_debounce_suppresses_identical_repeats() {
        let registry = PresenceRegistry::new(Duration::from_secs(60));
        let a = agent("a1", "acme", 2);
        registry.register_connection(&a, ConnectionId::from("c1")).unwrap();

        // Joining already broadcast Online; an identical repeat is silent.
        let change = registry.set_status(&a.id, AgentStatus::Online).unwrap();
        assert!(!change.broadcast);

        let change = registry.set_status(&a.id, AgentStatus::Away).unwrap();
        assert!(change.broadcast);

        let change = registry.set_status(&a.id, AgentStatus::Away).unwrap();
        assert!(!change.broadcast);
    }

    #[test]
    fn capacity_and_eligibility_enforced_on_claim() {
        let registry = PresenceRegistry::new(Duration::from_millis(50));
        let a = agent("a1", "acme", 1);
        registry.register_connection(&a, ConnectionId::from("c1")).unwrap();

        registry.try_claim(&a.id, &ConversationId::from("conv-1")).unwrap();
        assert!(matches!(
            registry.try_claim(&a.id, &ConversationId::from("conv-2")),
            Err(ChatEngineError::CapacityExceeded(_))
        ));

        registry.release(&a.id, &ConversationId::from("conv-1"));
        registry.set_status(&a.id, AgentStatus::Away).unwrap();
        assert!(matches!(
            registry.try_claim(&a.id, &ConversationId::from("conv-2")),
            Err(ChatEngineError::InvalidTransition(_))
        ));
    }

    #[test]
    fn list_available_is_tenant_scoped() {
        let registry = PresenceRegistry::new(Duration::from_millis(50));
        registry
            .register_connection(&agent("a1", "acme", 2), ConnectionId::from("c1"))
            .unwrap();
        registry
            .register_connection(&agent("b1", "globex", 2), ConnectionId::from("c2"))
            .unwrap();

        let acme = registry.list_available(&TenantId::from("acme"), &AvailabilityCriteria::default());
        assert_eq!(acme.len(), 1);
        assert_eq!(acme[0].agent_id, AgentId::from("a1"));

        let empty = registry.list_available(&TenantId::from("initech"), &AvailabilityCriteria::default());
        assert!(empty.is_empty());
    }

    #[test]
    fn late_heartbeat_cancels_a_pending_takedown() {
        let registry = PresenceRegistry::new(Duration::from_millis(50));
        let a = agent("a1", "acme", 2);
        registry.register_connection(&a, ConnectionId::from("c1")).unwrap();
        registry.try_claim(&a.id, &ConversationId::from("conv-1")).unwrap();

        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(registry.expired_agents(Duration::from_millis(10)), vec![a.id.clone()]);

        // A heartbeat lands after the sweep's listing but before the takedown.
        registry.touch(&a.id).unwrap();
        let removed = registry
            .force_offline_if_expired(&a.id, Duration::from_millis(10))
            .unwrap();
        assert!(removed.is_none());
        assert_eq!(registry.get_status(&a.id), Some(AgentStatus::Online));

        // Silence past the window is still taken down.
        std::thread::sleep(Duration::from_millis(30));
        let removed = registry
            .force_offline_if_expired(&a.id, Duration::from_millis(10))
            .unwrap()
            .expect("agent silent past the window");
        assert!(removed.went_offline);
        assert_eq!(removed.orphaned_conversations, vec![ConversationId::from("conv-1")]);
    }

    #[test]
    fn expired_agents_reports_silent_presences() {
        let registry = PresenceRegistry::new(Duration::from_millis(50));
        let a = agent("a1", "acme", 2);
        registry.register_connection(&a, ConnectionId::from("c1")).unwrap();

        assert!(registry.expired_agents(Duration::from_secs(60)).is_empty());
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(registry.expired_agents(Duration::from_millis(10)), vec![a.id.clone()]);

        registry.force_offline(&a.id).unwrap();
        // Offline agents are not reported again.
        assert!(registry.expired_agents(Duration::from_millis(10)).is_empty());
    }
}
