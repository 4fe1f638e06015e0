//! # Chat Center Engine
//!
//! The façade a real-time server drives. Every public operation is one
//! routing decision executed under the owning tenant's state lock, followed
//! by event publication, session bookkeeping, and a best-effort durable
//! owner write. Lock acquisition is bounded: a caller that cannot get the
//! tenant lock inside the configured window receives a retry-safe
//! [`Timeout`](crate::ChatEngineError::Timeout) instead of queueing forever
//! behind a stuck operation.
//!
//! ## Examples
//!
//! ```
//! use livedesk_chat_engine::orchestrator::ChatCenterEngine;
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
//!         skills: vec![],
//!         max_concurrent_conversations: 3,
//!     },
//!     ConnectionId::from("tab-1"),
//! ).await?;
//!
//! // With an agent online, a new request routes immediately.
//! let outcome = engine.request_agent(
//!     &TenantId::from("acme"),
//!     ConversationId::from("conv-1"),
//!     PriorityClass::Normal,
//!     vec![],
//! ).await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::agent::{Agent, AgentId, AgentStatus, ConnectionId, ConversationId, SessionId, TenantId};
use crate::config::ChatEngineConfig;
use crate::conversation::{ConversationTicket, PriorityClass, TicketState};
use crate::error::{ChatEngineError, Result};
use crate::integration::{AnalyticsSink, ConversationStore, InMemoryConversationStore, TracingAnalyticsSink};
use crate::monitoring::{ChatEvent, EventPublisher, PublishedEvent};
use crate::presence::{PresenceRegistry, StatusChange};
use crate::queue::QueueStats;
use crate::routing::{AssignmentOutcome, RoutingEngine};
use crate::sessions::{LeaveReason, SessionTracker};
use crate::transfer::{TransferCoordinator, TransferOutcome};

use super::state::TenantState;

/// How a request for a human agent concluded
#[derive(Debug, Clone)]
pub enum RequestOutcome {
    /// An agent was available and the conversation is already assigned
    Assigned(AssignmentOutcome),

    /// No agent qualified; the conversation is waiting in the queue
    Queued {
        /// 0-based queue position
        position: usize,
    },
}

/// What one maintenance sweep accomplished
#[derive(Debug, Clone, Default)]
pub struct SweepReport {
    /// Agents forced offline after a heartbeat lapse
    pub agents_forced_offline: usize,

    /// Conversations returned to the front of their queue
    pub conversations_requeued: usize,

    /// Waiting conversations abandoned past the maximum wait
    pub conversations_abandoned: usize,

    /// Terminal tickets discarded from live state
    pub tickets_discarded: usize,
}

/// The live-agent presence, queueing, and routing coordinator
///
/// One instance serves every tenant of the deployment. Per-tenant routing
/// state (tickets and queue) is serialized behind a per-tenant async lock;
/// presence is shared across tenants in the concurrent registry. All
/// cross-structure consistency — ticket ownership vs. agent owned set vs.
/// queue membership — is established inside the tenant critical sections.
pub struct ChatCenterEngine {
    config: ChatEngineConfig,
    presence: Arc<PresenceRegistry>,
    routing: RoutingEngine,
    transfers: TransferCoordinator,
    tenants: DashMap<TenantId, Arc<Mutex<TenantState>>>,
    sessions: Arc<SessionTracker>,
    events: EventPublisher,
    store: Arc<dyn ConversationStore>,
}

impl ChatCenterEngine {
    /// Create an engine with in-memory storage and log-only analytics
    pub fn new(config: ChatEngineConfig) -> Result<Self> {
        Self::with_collaborators(
            config,
            Arc::new(InMemoryConversationStore::new()),
            Arc::new(TracingAnalyticsSink),
        )
    }

    /// Create an engine wired to external storage and analytics
    pub fn with_collaborators(
        config: ChatEngineConfig,
        store: Arc<dyn ConversationStore>,
        analytics: Arc<dyn AnalyticsSink>,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(ChatEngineError::configuration)?;

        info!("🏗️ Chat center engine starting");
        Ok(Self {
            presence: Arc::new(PresenceRegistry::new(config.presence.status_debounce)),
            routing: RoutingEngine::new(&config.routing),
            transfers: TransferCoordinator::new(),
            tenants: DashMap::new(),
            sessions: Arc::new(SessionTracker::new(analytics)),
            events: EventPublisher::new(config.general.event_channel_capacity),
            store,
            config,
        })
    }

    /// Subscribe to the engine's outbound event stream
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<PublishedEvent> {
        self.events.subscribe()
    }

    /// Shared presence registry, for read-only dashboards
    pub fn presence(&self) -> &PresenceRegistry {
        &self.presence
    }

    // ========================================================================
    // Presence operations
    // ========================================================================

    /// Register an agent connection (a tab or device coming online)
    ///
    /// Returns `true` when this connection brought the agent online; an
    /// `AgentJoined` event is published and the tenant backlog is drained
    /// onto the new capacity in that case.
    pub async fn join_presence(&self, profile: &Agent, conn: ConnectionId) -> Result<bool> {
        let mut profile = profile.clone();
        if profile.max_concurrent_conversations == 0 {
            profile.max_concurrent_conversations =
                self.config.agents.default_max_concurrent_conversations;
        }

        let came_online = self.presence.register_connection(&profile, conn)?;
        if came_online {
            self.events.publish(ChatEvent::AgentJoined {
                tenant_id: profile.tenant_id.clone(),
                agent_id: profile.id.clone(),
            });
            self.auto_route(&profile.tenant_id).await?;
        }
        Ok(came_online)
    }

    /// Remove an agent connection (explicit leave or transport close)
    ///
    /// When the last connection goes, the agent's conversations return to
    /// the front of the tenant queue, their sessions close as
    /// `Disconnected`, and the freed backlog is re-routed — all before this
    /// call returns.
    pub async fn leave_presence(&self, conn: &ConnectionId) -> Result<()> {
        let agent_id = self
            .presence
            .agent_for_connection(conn)
            .ok_or_else(|| ChatEngineError::not_found(format!("unknown connection {}", conn)))?;
        let tenant_id = self
            .presence
            .get_presence(&agent_id)
            .map(|p| p.tenant_id)
            .ok_or_else(|| ChatEngineError::not_found(format!("unknown agent {}", agent_id)))?;

        // The tenant lock is taken before the presence mutation so the
        // surrender of owned conversations and their re-insertion are one
        // critical section.
        let mut state = self.lock_tenant(&tenant_id).await?;
        let removed = self.presence.remove_connection(conn)?;
        let mut cleanups = Vec::new();
        let mut routed = Vec::new();
        if removed.went_offline {
            cleanups = self.handle_departure(
                &mut state,
                &removed.agent_id,
                &tenant_id,
                removed.orphaned_conversations,
                false,
            );
            routed = self.route_backlog(&mut state, &tenant_id);
        }
        drop(state);

        self.finish_departure(cleanups).await;
        self.persist_assignments(&routed).await;
        Ok(())
    }

    /// Change an agent's availability
    ///
    /// Debounced: an identical repeat inside the configured window changes
    /// nothing and publishes nothing. Going `Online` drains the tenant
    /// backlog onto the agent.
    pub async fn set_status(&self, agent_id: &AgentId, status: AgentStatus) -> Result<StatusChange> {
        let tenant_id = self
            .presence
            .get_presence(agent_id)
            .map(|p| p.tenant_id)
            .ok_or_else(|| ChatEngineError::not_found(format!("unknown agent {}", agent_id)))?;

        let change = self.presence.set_status(agent_id, status)?;
        if change.broadcast {
            self.events.publish(ChatEvent::AgentStatusChanged {
                tenant_id: tenant_id.clone(),
                agent_id: agent_id.clone(),
                previous: change.previous,
                status: change.current,
            });
        }
        if change.current == AgentStatus::Online {
            self.auto_route(&tenant_id).await?;
        }
        Ok(change)
    }

    /// Record a heartbeat from an agent's connection
    pub fn heartbeat(&self, agent_id: &AgentId) -> Result<()> {
        self.presence.touch(agent_id)
    }

    // ========================================================================
    // Conversation lifecycle
    // ========================================================================

    /// Request a human agent for a conversation
    ///
    /// Creates the routing ticket, places it in the tenant queue, and
    /// immediately attempts to route it. Either an agent takes it on the
    /// spot ([`RequestOutcome::Assigned`]) or the caller learns its queue
    /// position ([`RequestOutcome::Queued`]).
    ///
    /// # Errors
    ///
    /// - `InvalidTransition` — the conversation already has a live ticket
    /// - `QueueFull` — the tenant backlog is at capacity; no ticket is kept
    pub async fn request_agent(
        &self,
        tenant_id: &TenantId,
        conversation_id: ConversationId,
        priority: PriorityClass,
        required_skills: Vec<String>,
    ) -> Result<RequestOutcome> {
        let mut state = self.lock_tenant(tenant_id).await?;

        if let Some(existing) = state.tickets.get(&conversation_id) {
            if !existing.state.is_terminal() {
                return Err(ChatEngineError::invalid_transition(format!(
                    "conversation {} is already being routed ({})",
                    conversation_id, existing.state
                )));
            }
        }

        let ticket = ConversationTicket::new(
            conversation_id.clone(),
            tenant_id.clone(),
            priority,
            required_skills,
        );
        let entry = state.entry_for(&ticket);
        state.tickets.insert(conversation_id.clone(), ticket);
        let position = match state.queue.enqueue(entry) {
            Ok(position) => position,
            Err(e) => {
                // Keep the table consistent with the queue: a refused
                // enqueue leaves no ticket behind.
                state.tickets.remove(&conversation_id);
                return Err(e);
            }
        };
        info!(
            "📞 Conversation {} requested an agent (tenant {}, position {})",
            conversation_id, tenant_id, position
        );

        let outcomes = self.route_backlog(&mut state, tenant_id);
        let position = state
            .queue
            .position_of(&conversation_id)
            .unwrap_or(position);
        drop(state);
        self.persist_assignments(&outcomes).await;

        if let Some(outcome) = outcomes
            .into_iter()
            .find(|o| o.conversation_id == conversation_id)
        {
            return Ok(RequestOutcome::Assigned(outcome));
        }
        Ok(RequestOutcome::Queued { position })
    }

    /// Explicitly accept a waiting conversation
    ///
    /// The agent-pressed-accept path. When several agents race for the same
    /// conversation, exactly one succeeds; the others receive
    /// `RoutingConflict` and should be shown "conversation already taken".
    pub async fn accept_conversation(
        &self,
        tenant_id: &TenantId,
        conversation_id: &ConversationId,
        agent_id: &AgentId,
        expected_version: Option<u64>,
    ) -> Result<AssignmentOutcome> {
        let mut state = self.lock_tenant(tenant_id).await?;
        let outcome = self.routing.assign_to_agent(
            &mut state,
            &self.presence,
            conversation_id,
            agent_id,
            expected_version,
        )?;
        self.finalize_assignment(tenant_id, &outcome, false);
        drop(state);

        self.persist_owner(
            &outcome.conversation_id,
            Some(&outcome.agent_id),
            outcome.assignment_version,
        )
        .await;
        Ok(outcome)
    }

    /// Mark an assigned conversation as actively being handled
    ///
    /// Only the current owner may activate; anyone else gets
    /// `RoutingConflict`.
    pub async fn activate_conversation(
        &self,
        tenant_id: &TenantId,
        conversation_id: &ConversationId,
        agent_id: &AgentId,
    ) -> Result<()> {
        let mut state = self.lock_tenant(tenant_id).await?;
        let ticket = state.ticket_mut(conversation_id)?;
        if ticket.assigned_agent.as_ref() != Some(agent_id) {
            return Err(ChatEngineError::routing_conflict(format!(
                "agent {} is not the current owner of conversation {}",
                agent_id, conversation_id
            )));
        }
        ticket.transition(TicketState::Active)?;
        debug!("💬 Conversation {} is now active with agent {}", conversation_id, agent_id);
        Ok(())
    }

    /// Count one agent message on the conversation's live session
    ///
    /// Tenant-scoped like every other inbound operation: a session whose
    /// agent belongs to another tenant is `Unauthorized`.
    pub fn record_agent_message(
        &self,
        tenant_id: &TenantId,
        conversation_id: &ConversationId,
    ) -> Result<u64> {
        let session_id = self
            .sessions
            .session_for_conversation(conversation_id)
            .ok_or_else(|| {
                ChatEngineError::not_found(format!(
                    "no live session on conversation {}",
                    conversation_id
                ))
            })?;
        let owning_tenant = self
            .sessions
            .get_session(&session_id)
            .and_then(|s| self.presence.get_presence(&s.agent_id))
            .map(|p| p.tenant_id);
        if owning_tenant.as_ref() != Some(tenant_id) {
            return Err(ChatEngineError::unauthorized(format!(
                "conversation {} is not handled under tenant {}",
                conversation_id, tenant_id
            )));
        }
        self.sessions.record_message(&session_id)
    }

    /// Transfer a conversation to another agent
    ///
    /// On success the ticket moves directly to the target and a fresh
    /// session opens for them. If the target becomes unreachable
    /// mid-operation, the conversation returns to the front of the queue
    /// instead of being lost.
    pub async fn transfer_conversation(
        &self,
        tenant_id: &TenantId,
        conversation_id: &ConversationId,
        from_agent: &AgentId,
        to_agent: &AgentId,
        expected_version: Option<u64>,
        reason: &str,
    ) -> Result<TransferOutcome> {
        let mut state = self.lock_tenant(tenant_id).await?;
        let outcome = self.transfers.transfer(
            &mut state,
            &self.presence,
            conversation_id,
            from_agent,
            to_agent,
            expected_version,
            reason,
        )?;

        // Captured before the successor session replaces the index entry.
        let prior_session = self.sessions.session_for_conversation(conversation_id);

        let new_owner = match &outcome {
            TransferOutcome::Completed {
                to_agent: target,
                assignment_version,
            } => {
                self.sessions
                    .start_session(target.clone(), conversation_id.clone(), true);
                self.events.publish(ChatEvent::ConversationTransferred {
                    tenant_id: tenant_id.clone(),
                    conversation_id: conversation_id.clone(),
                    from_agent: from_agent.clone(),
                    to_agent: Some(target.clone()),
                    assignment_version: *assignment_version,
                    reason: reason.to_string(),
                });
                (Some(target.clone()), *assignment_version)
            }
            TransferOutcome::Requeued {
                priority,
                position,
                assignment_version,
            } => {
                self.events.publish(ChatEvent::ConversationTransferred {
                    tenant_id: tenant_id.clone(),
                    conversation_id: conversation_id.clone(),
                    from_agent: from_agent.clone(),
                    to_agent: None,
                    assignment_version: *assignment_version,
                    reason: reason.to_string(),
                });
                self.events.publish(ChatEvent::ConversationRequeued {
                    tenant_id: tenant_id.clone(),
                    conversation_id: conversation_id.clone(),
                    priority: *priority,
                    position: *position,
                });
                (None, *assignment_version)
            }
        };
        drop(state);

        if let Some(session_id) = prior_session {
            self.sessions
                .end_session(&session_id, LeaveReason::Transferred)
                .await;
        }
        self.persist_owner(conversation_id, new_owner.0.as_ref(), new_owner.1)
            .await;
        Ok(outcome)
    }

    /// Escalate a conversation to another tier
    ///
    /// With a reachable direct target the ticket lands on them; otherwise
    /// it requeues at `Escalated` priority, ahead of the whole backlog.
    pub async fn escalate_conversation(
        &self,
        tenant_id: &TenantId,
        conversation_id: &ConversationId,
        from_agent: &AgentId,
        target: Option<&AgentId>,
        expected_version: Option<u64>,
        reason: &str,
    ) -> Result<TransferOutcome> {
        let mut state = self.lock_tenant(tenant_id).await?;
        let outcome = self.transfers.escalate(
            &mut state,
            &self.presence,
            conversation_id,
            from_agent,
            target,
            expected_version,
            reason,
        )?;

        // Captured before the successor session replaces the index entry.
        let prior_session = self.sessions.session_for_conversation(conversation_id);

        let new_owner = match &outcome {
            TransferOutcome::Completed {
                to_agent,
                assignment_version,
            } => {
                self.sessions
                    .start_session(to_agent.clone(), conversation_id.clone(), true);
                self.events.publish(ChatEvent::ConversationEscalated {
                    tenant_id: tenant_id.clone(),
                    conversation_id: conversation_id.clone(),
                    from_agent: from_agent.clone(),
                    target_agent: Some(to_agent.clone()),
                    assignment_version: *assignment_version,
                    reason: reason.to_string(),
                });
                (Some(to_agent.clone()), *assignment_version)
            }
            TransferOutcome::Requeued {
                priority,
                position,
                assignment_version,
            } => {
                self.events.publish(ChatEvent::ConversationEscalated {
                    tenant_id: tenant_id.clone(),
                    conversation_id: conversation_id.clone(),
                    from_agent: from_agent.clone(),
                    target_agent: None,
                    assignment_version: *assignment_version,
                    reason: reason.to_string(),
                });
                self.events.publish(ChatEvent::ConversationRequeued {
                    tenant_id: tenant_id.clone(),
                    conversation_id: conversation_id.clone(),
                    priority: *priority,
                    position: *position,
                });
                (None, *assignment_version)
            }
        };
        drop(state);

        if let Some(session_id) = prior_session {
            self.sessions
                .end_session(&session_id, LeaveReason::Escalated)
                .await;
        }
        self.persist_owner(conversation_id, new_owner.0.as_ref(), new_owner.1)
            .await;
        Ok(outcome)
    }

    /// Cancel a conversation still waiting in the queue
    ///
    /// The customer-gave-up path. If an assignment won the race first, the
    /// caller gets `RoutingConflict` and the assignment stands.
    pub async fn cancel_waiting(
        &self,
        tenant_id: &TenantId,
        conversation_id: &ConversationId,
    ) -> Result<()> {
        let mut state = self.lock_tenant(tenant_id).await?;
        let ticket = state.ticket_mut(conversation_id)?;
        if ticket.state != TicketState::Waiting {
            return Err(ChatEngineError::routing_conflict(format!(
                "conversation {} is no longer waiting ({})",
                conversation_id, ticket.state
            )));
        }
        ticket.transition(TicketState::Ended)?;
        state.queue.remove(conversation_id);
        info!("🚫 Conversation {} cancelled while waiting", conversation_id);
        Ok(())
    }

    /// Close a conversation
    ///
    /// Owned tickets release the agent's capacity and close the live
    /// session as `Closed`; freed capacity immediately drains the backlog.
    /// A Waiting ticket may also be closed (abandoned by the customer).
    pub async fn close_conversation(
        &self,
        tenant_id: &TenantId,
        conversation_id: &ConversationId,
    ) -> Result<()> {
        let mut state = self.lock_tenant(tenant_id).await?;
        let ticket = state.ticket_mut(conversation_id)?;
        if ticket.state.is_terminal() {
            // Closing twice is a no-op, not an error.
            debug!("🚫 Conversation {} already ended", conversation_id);
            return Ok(());
        }

        let owner = ticket.assigned_agent.clone();
        ticket.transition(TicketState::Ended)?;
        let version = ticket.assignment_version;
        state.queue.remove(conversation_id);

        let mut prior_session = None;
        let mut routed = Vec::new();
        if let Some(owner) = &owner {
            self.presence.release(owner, conversation_id);
            prior_session = self.sessions.session_for_conversation(conversation_id);
            info!(
                "✅ Conversation {} closed (was with agent {})",
                conversation_id, owner
            );
            routed = self.route_backlog(&mut state, tenant_id);
        } else {
            info!("✅ Conversation {} closed while waiting", conversation_id);
        }
        drop(state);

        if let Some(session_id) = prior_session {
            self.sessions
                .end_session(&session_id, LeaveReason::Closed)
                .await;
        }
        if owner.is_some() {
            self.persist_owner(conversation_id, None, version).await;
        }
        self.persist_assignments(&routed).await;
        Ok(())
    }

    // ========================================================================
    // Routing and maintenance
    // ========================================================================

    /// Drain a tenant's backlog onto available agents
    pub async fn auto_route(&self, tenant_id: &TenantId) -> Result<Vec<AssignmentOutcome>> {
        let mut state = self.lock_tenant(tenant_id).await?;
        let outcomes = self.route_backlog(&mut state, tenant_id);
        drop(state);
        self.persist_assignments(&outcomes).await;
        Ok(outcomes)
    }

    /// One pass of heartbeat expiry, queue expiry, and ticket cleanup
    ///
    /// Call periodically (or via [`start_sweeper`](Self::start_sweeper)).
    /// Silent agents are forced offline and their conversations return to
    /// the front of the queue; waiting conversations past the maximum wait
    /// are abandoned; terminal tickets are discarded.
    pub async fn run_sweep(&self) -> Result<SweepReport> {
        let mut report = SweepReport::default();

        for agent_id in self.presence.expired_agents(self.config.presence.heartbeat_timeout) {
            let Some(tenant_id) = self.presence.get_presence(&agent_id).map(|p| p.tenant_id) else {
                continue;
            };
            let mut state = self.lock_tenant(&tenant_id).await?;
            // Re-checked under the entry lock: a heartbeat that landed
            // since the expiry listing keeps the agent online.
            let removed = match self
                .presence
                .force_offline_if_expired(&agent_id, self.config.presence.heartbeat_timeout)
            {
                Ok(Some(removed)) => removed,
                Ok(None) => continue,
                Err(e) => {
                    warn!("🧹 Sweep could not force agent {} offline: {}", agent_id, e);
                    continue;
                }
            };
            report.agents_forced_offline += 1;
            report.conversations_requeued += removed.orphaned_conversations.len();
            let cleanups = self.handle_departure(
                &mut state,
                &agent_id,
                &tenant_id,
                removed.orphaned_conversations,
                true,
            );
            let routed = self.route_backlog(&mut state, &tenant_id);
            drop(state);
            self.finish_departure(cleanups).await;
            self.persist_assignments(&routed).await;
        }

        let max_wait = chrono::Duration::from_std(self.config.queues.max_wait_time)
            .unwrap_or_else(|_| chrono::Duration::seconds(0));
        let tenant_ids: Vec<TenantId> = self.tenants.iter().map(|e| e.key().clone()).collect();
        for tenant_id in tenant_ids {
            let mut state = self.lock_tenant(&tenant_id).await?;
            for conversation_id in state.queue.expired(max_wait) {
                if let Ok(ticket) = state.ticket_mut(&conversation_id) {
                    if ticket.transition(TicketState::Ended).is_ok() {
                        state.queue.remove(&conversation_id);
                        report.conversations_abandoned += 1;
                        warn!(
                            "🧹 Conversation {} abandoned after exceeding the maximum wait",
                            conversation_id
                        );
                    }
                }
            }
            report.tickets_discarded += state.discard_ended();
        }

        if report.agents_forced_offline > 0 || report.conversations_abandoned > 0 {
            info!(
                "🧹 Sweep: {} agents offline, {} requeued, {} abandoned, {} discarded",
                report.agents_forced_offline,
                report.conversations_requeued,
                report.conversations_abandoned,
                report.tickets_discarded
            );
        }
        Ok(report)
    }

    /// Spawn the periodic maintenance sweep
    ///
    /// Runs [`run_sweep`](Self::run_sweep) every configured interval until
    /// the returned handle is aborted.
    pub fn start_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let engine = Arc::clone(self);
        let interval = engine.config.presence.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = engine.run_sweep().await {
                    error!("🧹 Maintenance sweep failed: {}", e);
                }
            }
        })
    }

    /// Rebuild live routing state from durable storage after a restart
    ///
    /// Conversations whose recorded owner is still Online are re-bound to
    /// them; the rest return to the front of their tenant queue. Returns
    /// the number of conversations recovered.
    pub async fn recover_from_store(&self) -> Result<usize> {
        let open = self.store.list_open_conversations().await?;
        let mut recovered = 0;

        for stored in open {
            let mut state = self.lock_tenant(&stored.tenant_id).await?;
            if state.tickets.contains_key(&stored.conversation_id) {
                continue;
            }

            let mut ticket = ConversationTicket::new(
                stored.conversation_id.clone(),
                stored.tenant_id.clone(),
                PriorityClass::Normal,
                Vec::new(),
            );
            ticket.assignment_version = stored.owner_version;

            let live_owner = stored.current_owner.as_ref().filter(|owner| {
                self.presence.get_status(owner) == Some(AgentStatus::Online)
            });

            match live_owner {
                Some(owner) if self.presence.try_claim(owner, &stored.conversation_id).is_ok() => {
                    ticket.state = TicketState::Assigned;
                    ticket.assigned_agent = Some(owner.clone());
                    info!(
                        "♻️ Recovered conversation {} still owned by agent {}",
                        stored.conversation_id, owner
                    );
                    state.tickets.insert(stored.conversation_id.clone(), ticket);
                }
                _ => {
                    let entry = state.entry_for(&ticket);
                    state.tickets.insert(stored.conversation_id.clone(), ticket);
                    let position = state.queue.requeue_front(entry);
                    info!(
                        "♻️ Recovered conversation {} into the queue at position {}",
                        stored.conversation_id, position
                    );
                    self.events.publish(ChatEvent::ConversationRequeued {
                        tenant_id: stored.tenant_id.clone(),
                        conversation_id: stored.conversation_id.clone(),
                        priority: PriorityClass::Normal,
                        position,
                    });
                }
            }
            recovered += 1;
        }

        if recovered > 0 {
            info!("♻️ Recovered {} open conversations from storage", recovered);
            let tenant_ids: Vec<TenantId> = self.tenants.iter().map(|e| e.key().clone()).collect();
            for tenant_id in tenant_ids {
                self.auto_route(&tenant_id).await?;
            }
        }
        Ok(recovered)
    }

    /// Verify and, if needed, repair the single-owner invariant
    ///
    /// A healthy ticket has exactly the owner its state says it has.
    /// Anything else (two claimants, a claimant the ticket doesn't know
    /// about) is repaired by releasing every claimant and returning the
    /// conversation to the front of the queue, with an operator alert.
    /// Returns `true` when a repair happened.
    pub async fn reconcile_ticket(
        &self,
        tenant_id: &TenantId,
        conversation_id: &ConversationId,
    ) -> Result<bool> {
        let mut state = self.lock_tenant(tenant_id).await?;
        let ticket = state.ticket(conversation_id)?;
        let claimants = self.presence.owners_of(tenant_id, conversation_id);

        let healthy = match &ticket.assigned_agent {
            Some(owner) if ticket.state.is_owned() => {
                claimants.len() == 1 && &claimants[0] == owner
            }
            None => claimants.is_empty(),
            Some(_) => false,
        };
        if healthy {
            return Ok(false);
        }

        let detail = format!(
            "ticket says owner={:?} state={} but presence claims {:?}",
            ticket.assigned_agent, ticket.state, claimants
        );
        error!("🚨 Invariant violation on conversation {}: {}", conversation_id, detail);

        for claimant in &claimants {
            self.presence.release(claimant, conversation_id);
        }
        let ticket = state.ticket_mut(conversation_id)?;
        let priority = ticket.priority;
        ticket.release_to_queue(priority);
        let version = ticket.assignment_version;
        let entry = state.entry_for(state.ticket(conversation_id)?);
        let position = state.queue.requeue_front(entry);

        self.events.publish(ChatEvent::TicketInconsistency {
            tenant_id: tenant_id.clone(),
            conversation_id: conversation_id.clone(),
            detail,
        });
        self.events.publish(ChatEvent::ConversationRequeued {
            tenant_id: tenant_id.clone(),
            conversation_id: conversation_id.clone(),
            priority,
            position,
        });
        drop(state);
        self.persist_owner(conversation_id, None, version).await;
        Ok(true)
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    /// Snapshot of a tenant's queue health
    pub async fn queue_stats(&self, tenant_id: &TenantId) -> Result<QueueStats> {
        let state = self.lock_tenant(tenant_id).await?;
        Ok(state.queue.stats())
    }

    /// Snapshot of one routing ticket
    pub async fn get_ticket(
        &self,
        tenant_id: &TenantId,
        conversation_id: &ConversationId,
    ) -> Result<ConversationTicket> {
        let state = self.lock_tenant(tenant_id).await?;
        Ok(state.ticket(conversation_id)?.clone())
    }

    /// Number of live handling sessions across all tenants
    pub fn live_sessions(&self) -> usize {
        self.sessions.live_sessions()
    }

    // ========================================================================
    // Internal helpers
    // ========================================================================

    /// Acquire the tenant state lock within the configured bound
    async fn lock_tenant(&self, tenant_id: &TenantId) -> Result<OwnedMutexGuard<TenantState>> {
        let state = self
            .tenants
            .entry(tenant_id.clone())
            .or_insert_with(|| {
                Arc::new(Mutex::new(TenantState::new(
                    tenant_id.clone(),
                    self.config.queues.max_queue_size,
                )))
            })
            .clone();

        timeout(self.config.general.lock_timeout, state.lock_owned())
            .await
            .map_err(|_| {
                ChatEngineError::timeout(format!(
                    "tenant {} is busy, please retry",
                    tenant_id
                ))
            })
    }

    /// Session and event bookkeeping for a completed assignment
    ///
    /// Pure in-memory work so it can run under the held tenant lock; the
    /// durable owner write happens afterwards via
    /// [`persist_assignments`](Self::persist_assignments).
    fn finalize_assignment(
        &self,
        tenant_id: &TenantId,
        outcome: &AssignmentOutcome,
        is_transfer: bool,
    ) {
        self.sessions.start_session(
            outcome.agent_id.clone(),
            outcome.conversation_id.clone(),
            is_transfer,
        );
        self.events.publish(ChatEvent::ConversationAssigned {
            tenant_id: tenant_id.clone(),
            conversation_id: outcome.conversation_id.clone(),
            agent_id: outcome.agent_id.clone(),
            assignment_version: outcome.assignment_version,
        });
        self.events.publish(ChatEvent::ConversationTaken {
            tenant_id: tenant_id.clone(),
            conversation_id: outcome.conversation_id.clone(),
            agent_id: outcome.agent_id.clone(),
        });
    }

    /// Drain the backlog under a held tenant lock and finalize each win
    fn route_backlog(
        &self,
        state: &mut TenantState,
        tenant_id: &TenantId,
    ) -> Vec<AssignmentOutcome> {
        let outcomes = self.routing.auto_route(state, &self.presence, tenant_id);
        for outcome in &outcomes {
            self.finalize_assignment(tenant_id, outcome, false);
        }
        outcomes
    }

    /// Durable owner writes for a batch of assignments
    ///
    /// Called after the tenant lock is released, so a slow store cannot
    /// hold up other operations on the tenant.
    async fn persist_assignments(&self, outcomes: &[AssignmentOutcome]) {
        for outcome in outcomes {
            self.persist_owner(
                &outcome.conversation_id,
                Some(&outcome.agent_id),
                outcome.assignment_version,
            )
            .await;
        }
    }

    /// Requeue orphans and announce a departure
    ///
    /// Runs under the held tenant lock so no observer sees a live ticket
    /// without an owner or a queue position. Session closes and durable
    /// writes are deferred: the returned cleanups are handed to
    /// [`finish_departure`](Self::finish_departure) once the lock is gone.
    fn handle_departure(
        &self,
        state: &mut TenantState,
        agent_id: &AgentId,
        tenant_id: &TenantId,
        orphans: Vec<ConversationId>,
        heartbeat_lapsed: bool,
    ) -> Vec<(ConversationId, u64, Option<SessionId>)> {
        let mut cleanups = Vec::new();
        for conversation_id in orphans {
            let Ok(ticket) = state.ticket_mut(&conversation_id) else {
                // The presence set can briefly outlive a discarded ticket.
                continue;
            };
            let priority = ticket.priority;
            ticket.release_to_queue(priority);
            let version = ticket.assignment_version;
            let entry = state.entry_for(match state.ticket(&conversation_id) {
                Ok(t) => t,
                Err(_) => continue,
            });
            let position = state.queue.requeue_front(entry);

            let session = self.sessions.session_for_conversation(&conversation_id);
            self.events.publish(ChatEvent::ConversationRequeued {
                tenant_id: tenant_id.clone(),
                conversation_id: conversation_id.clone(),
                priority,
                position,
            });
            cleanups.push((conversation_id, version, session));
        }

        self.events.publish(ChatEvent::AgentLeft {
            tenant_id: tenant_id.clone(),
            agent_id: agent_id.clone(),
            heartbeat_lapsed,
        });
        cleanups
    }

    /// Session closes and durable writes deferred by a departure
    async fn finish_departure(&self, cleanups: Vec<(ConversationId, u64, Option<SessionId>)>) {
        for (conversation_id, version, session) in cleanups {
            if let Some(session_id) = session {
                self.sessions
                    .end_session(&session_id, LeaveReason::Disconnected)
                    .await;
            }
            self.persist_owner(&conversation_id, None, version).await;
        }
    }

    /// Best-effort durable owner write; failures are logged, never raised
    async fn persist_owner(
        &self,
        conversation_id: &ConversationId,
        owner: Option<&AgentId>,
        version: u64,
    ) {
        if let Err(e) = self.store.set_owner(conversation_id, owner, version).await {
            warn!(
                "💾 Durable owner write failed for conversation {}: {}",
                conversation_id, e
            );
        }
    }
}
