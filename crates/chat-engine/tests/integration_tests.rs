//! End-to-end tests driving the engine the way a real-time server would:
//! agents join and leave presence, conversations request humans, accepts
//! race, owners vanish mid-conversation, and the process restarts over a
//! seeded store.

use std::sync::Arc;
use std::time::Duration;

use serial_test::serial;

use livedesk_chat_engine::agent::{Agent, AgentId, AgentStatus, ConnectionId};
use livedesk_chat_engine::config::ChatEngineConfig;
use livedesk_chat_engine::conversation::{PriorityClass, TicketState};
use livedesk_chat_engine::integration::{
    ConversationStore, InMemoryAnalyticsSink, InMemoryConversationStore, StoredConversation,
};
use livedesk_chat_engine::monitoring::ChatEvent;
use livedesk_chat_engine::orchestrator::{ChatCenterEngine, RequestOutcome};
use livedesk_chat_engine::sessions::LeaveReason;
use livedesk_chat_engine::transfer::TransferOutcome;
use livedesk_chat_engine::{ChatEngineError, ConversationId, TenantId};

fn profile(id: &str, tenant: &str, skills: &[&str], max: usize) -> Agent {
    Agent {
        id: AgentId::from(id),
        tenant_id: TenantId::from(tenant),
        display_name: id.to_string(),
        skills: skills.iter().map(|s| s.to_string()).collect(),
        max_concurrent_conversations: max,
    }
}

fn engine_with(config: ChatEngineConfig) -> (Arc<ChatCenterEngine>, Arc<InMemoryAnalyticsSink>, Arc<InMemoryConversationStore>) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("livedesk_chat_engine=debug")
        .with_test_writer()
        .try_init();
    let sink = Arc::new(InMemoryAnalyticsSink::new());
    let store = Arc::new(InMemoryConversationStore::new());
    let engine = ChatCenterEngine::with_collaborators(config, store.clone(), sink.clone())
        .expect("engine config should be valid");
    (Arc::new(engine), sink, store)
}

fn engine() -> (Arc<ChatCenterEngine>, Arc<InMemoryAnalyticsSink>, Arc<InMemoryConversationStore>) {
    engine_with(ChatEngineConfig::default())
}

#[tokio::test]
async fn request_routes_immediately_when_capacity_exists() {
    let (engine, _, _) = engine();
    let tenant = TenantId::from("acme");

    engine
        .join_presence(&profile("alice", "acme", &["english"], 3), ConnectionId::from("c1"))
        .await
        .unwrap();

    let outcome = engine
        .request_agent(&tenant, ConversationId::from("conv-1"), PriorityClass::Normal, vec![])
        .await
        .unwrap();

    match outcome {
        RequestOutcome::Assigned(a) => {
            assert_eq!(a.agent_id, AgentId::from("alice"));
            assert_eq!(a.assignment_version, 1);
        }
        RequestOutcome::Queued { .. } => panic!("should have routed immediately"),
    }

    let ticket = engine.get_ticket(&tenant, &ConversationId::from("conv-1")).await.unwrap();
    assert_eq!(ticket.state, TicketState::Assigned);
    assert_eq!(ticket.assigned_agent, Some(AgentId::from("alice")));
}

#[tokio::test]
async fn concurrent_accepts_resolve_to_exactly_one_owner() {
    let (engine, _, _) = engine();
    let tenant = TenantId::from("acme");
    let conv = ConversationId::from("conv-race");

    // Nobody carries the required skill, so the ticket stays queued and the
    // explicit accepts below genuinely race for it.
    for i in 0..4 {
        engine
            .join_presence(
                &profile(&format!("agent-{}", i), "acme", &["english"], 5),
                ConnectionId::from(format!("c{}", i)),
            )
            .await
            .unwrap();
    }
    let outcome = engine
        .request_agent(&tenant, conv.clone(), PriorityClass::Normal, vec!["klingon".to_string()])
        .await
        .unwrap();
    assert!(matches!(outcome, RequestOutcome::Queued { position: 0 }));

    let mut handles = Vec::new();
    for i in 0..4 {
        let engine = engine.clone();
        let tenant = tenant.clone();
        let conv = conv.clone();
        handles.push(tokio::spawn(async move {
            engine
                .accept_conversation(&tenant, &conv, &AgentId::from(format!("agent-{}", i)), None)
                .await
        }));
    }

    let mut wins = 0;
    let mut conflicts = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => wins += 1,
            Err(ChatEngineError::RoutingConflict(_)) => conflicts += 1,
            Err(e) => panic!("unexpected error: {}", e),
        }
    }
    assert_eq!(wins, 1);
    assert_eq!(conflicts, 3);

    let ticket = engine.get_ticket(&tenant, &conv).await.unwrap();
    assert_eq!(ticket.state, TicketState::Assigned);
    assert_eq!(ticket.assignment_version, 1);
    assert!(ticket.assigned_agent.is_some());
}

#[tokio::test]
async fn stale_version_loses_cleanly() {
    let (engine, _, _) = engine();
    let tenant = TenantId::from("acme");
    let conv = ConversationId::from("conv-1");

    engine
        .join_presence(&profile("alice", "acme", &[], 3), ConnectionId::from("c1"))
        .await
        .unwrap();
    engine
        .join_presence(&profile("bob", "acme", &[], 3), ConnectionId::from("c2"))
        .await
        .unwrap();
    engine
        .request_agent(&tenant, conv.clone(), PriorityClass::Normal, vec!["none".to_string()])
        .await
        .unwrap();

    engine
        .accept_conversation(&tenant, &conv, &AgentId::from("alice"), Some(0))
        .await
        .unwrap();

    // Bob still believes version 0 is current.
    let err = engine
        .accept_conversation(&tenant, &conv, &AgentId::from("bob"), Some(0))
        .await
        .unwrap_err();
    assert!(matches!(err, ChatEngineError::RoutingConflict(_)));
}

#[tokio::test]
async fn status_changes_are_debounced_and_broadcast_once() {
    let (engine, _, _) = engine();
    engine
        .join_presence(&profile("alice", "acme", &[], 3), ConnectionId::from("c1"))
        .await
        .unwrap();

    let mut rx = engine.subscribe();

    let change = engine
        .set_status(&AgentId::from("alice"), AgentStatus::Away)
        .await
        .unwrap();
    assert!(change.broadcast);

    let change = engine
        .set_status(&AgentId::from("alice"), AgentStatus::Away)
        .await
        .unwrap();
    assert!(!change.broadcast);

    let published = rx.recv().await.unwrap();
    assert!(matches!(
        published.event,
        ChatEvent::AgentStatusChanged {
            status: AgentStatus::Away,
            ..
        }
    ));
    // The repeat produced no second event.
    assert!(matches!(
        rx.try_recv(),
        Err(tokio::sync::broadcast::error::TryRecvError::Empty)
    ));
}

#[tokio::test]
async fn transfer_round_trip_emits_session_facts() {
    let (engine, sink, _) = engine();
    let tenant = TenantId::from("acme");
    let conv = ConversationId::from("conv-1");
    let alice = AgentId::from("alice");
    let bob = AgentId::from("bob");

    engine
        .join_presence(&profile("alice", "acme", &["billing"], 3), ConnectionId::from("c1"))
        .await
        .unwrap();
    engine
        .request_agent(&tenant, conv.clone(), PriorityClass::Normal, vec!["billing".to_string()])
        .await
        .unwrap();
    engine.join_presence(&profile("bob", "acme", &[], 3), ConnectionId::from("c2")).await.unwrap();

    engine.activate_conversation(&tenant, &conv, &alice).await.unwrap();
    engine.record_agent_message(&tenant, &conv).unwrap();
    engine.record_agent_message(&tenant, &conv).unwrap();

    let outcome = engine
        .transfer_conversation(&tenant, &conv, &alice, &bob, Some(1), "customer asked for bob")
        .await
        .unwrap();
    match outcome {
        TransferOutcome::Completed { to_agent, assignment_version } => {
            assert_eq!(to_agent, bob);
            assert_eq!(assignment_version, 2);
        }
        TransferOutcome::Requeued { .. } => panic!("bob had capacity"),
    }

    // And back again.
    let outcome = engine
        .transfer_conversation(&tenant, &conv, &bob, &alice, Some(2), "handing back")
        .await
        .unwrap();
    assert!(matches!(outcome, TransferOutcome::Completed { assignment_version: 3, .. }));

    engine.close_conversation(&tenant, &conv).await.unwrap();

    let facts = sink.facts();
    assert_eq!(facts.len(), 3);
    assert_eq!(facts[0].reason, LeaveReason::Transferred);
    assert_eq!(facts[0].agent_id, Some(alice.clone()));
    assert_eq!(facts[0].message_count, 2);
    assert_eq!(facts[1].reason, LeaveReason::Transferred);
    assert_eq!(facts[1].agent_id, Some(bob.clone()));
    assert_eq!(facts[2].reason, LeaveReason::Closed);
    assert_eq!(facts[2].agent_id, Some(alice.clone()));

    // Capacity was handed back at every step.
    assert!(engine.presence().get_presence(&alice).unwrap().owned_conversations.is_empty());
    assert!(engine.presence().get_presence(&bob).unwrap().owned_conversations.is_empty());
}

#[tokio::test]
async fn capacity_is_enforced_and_backlog_drains_on_close() {
    let (engine, _, _) = engine();
    let tenant = TenantId::from("acme");
    let alice = AgentId::from("alice");

    engine
        .join_presence(&profile("alice", "acme", &[], 1), ConnectionId::from("c1"))
        .await
        .unwrap();

    let first = engine
        .request_agent(&tenant, ConversationId::from("conv-1"), PriorityClass::Normal, vec![])
        .await
        .unwrap();
    assert!(matches!(first, RequestOutcome::Assigned(_)));

    let second = engine
        .request_agent(&tenant, ConversationId::from("conv-2"), PriorityClass::Normal, vec![])
        .await
        .unwrap();
    assert!(matches!(second, RequestOutcome::Queued { position: 0 }));

    // An explicit accept over capacity is refused and the queue keeps order.
    let err = engine
        .accept_conversation(&tenant, &ConversationId::from("conv-2"), &alice, None)
        .await
        .unwrap_err();
    assert!(matches!(err, ChatEngineError::CapacityExceeded(_)));
    let stats = engine.queue_stats(&tenant).await.unwrap();
    assert_eq!(stats.waiting, 1);

    // Closing the first conversation frees capacity and drains the backlog.
    engine.close_conversation(&tenant, &ConversationId::from("conv-1")).await.unwrap();
    let ticket = engine.get_ticket(&tenant, &ConversationId::from("conv-2")).await.unwrap();
    assert_eq!(ticket.state, TicketState::Assigned);
    assert_eq!(ticket.assigned_agent, Some(alice));
}

#[tokio::test]
async fn priority_classes_jump_the_queue() {
    let (engine, _, _) = engine();
    let tenant = TenantId::from("acme");

    // No agents yet, everything queues.
    let n1 = engine
        .request_agent(&tenant, ConversationId::from("n1"), PriorityClass::Normal, vec![])
        .await
        .unwrap();
    assert!(matches!(n1, RequestOutcome::Queued { position: 0 }));

    let n2 = engine
        .request_agent(&tenant, ConversationId::from("n2"), PriorityClass::Normal, vec![])
        .await
        .unwrap();
    assert!(matches!(n2, RequestOutcome::Queued { position: 1 }));

    let vip = engine
        .request_agent(&tenant, ConversationId::from("vip"), PriorityClass::High, vec![])
        .await
        .unwrap();
    assert!(matches!(vip, RequestOutcome::Queued { position: 0 }));
}

#[tokio::test]
async fn escalation_without_target_requeues_ahead_of_everything() {
    let (engine, _, _) = engine();
    let tenant = TenantId::from("acme");
    let conv = ConversationId::from("conv-1");
    let alice = AgentId::from("alice");

    engine
        .join_presence(&profile("alice", "acme", &[], 1), ConnectionId::from("c1"))
        .await
        .unwrap();
    engine
        .request_agent(&tenant, conv.clone(), PriorityClass::Normal, vec![])
        .await
        .unwrap();
    engine
        .request_agent(&tenant, ConversationId::from("conv-2"), PriorityClass::High, vec![])
        .await
        .unwrap();

    let outcome = engine
        .escalate_conversation(&tenant, &conv, &alice, None, None, "needs tier 2")
        .await
        .unwrap();
    match outcome {
        TransferOutcome::Requeued { priority, position, assignment_version } => {
            assert_eq!(priority, PriorityClass::Escalated);
            assert_eq!(position, 0);
            assert_eq!(assignment_version, 2);
        }
        TransferOutcome::Completed { .. } => panic!("no target was given"),
    }

    // Ahead of the waiting High conversation.
    let ticket = engine.get_ticket(&tenant, &conv).await.unwrap();
    assert_eq!(ticket.state, TicketState::Waiting);
    assert_eq!(ticket.assigned_agent, None);
}

#[tokio::test]
async fn escalated_conversation_survives_source_agent_leaving() {
    let (engine, _, _) = engine();
    let tenant = TenantId::from("acme");
    let conv = ConversationId::from("conv-1");
    let alice = AgentId::from("alice");
    let bob = AgentId::from("bob");

    engine
        .join_presence(&profile("alice", "acme", &["tier1"], 3), ConnectionId::from("c1"))
        .await
        .unwrap();
    engine
        .request_agent(&tenant, conv.clone(), PriorityClass::Normal, vec!["tier1".to_string()])
        .await
        .unwrap();
    engine.join_presence(&profile("bob", "acme", &[], 3), ConnectionId::from("c2")).await.unwrap();

    let outcome = engine
        .escalate_conversation(&tenant, &conv, &alice, Some(&bob), Some(1), "tier 2 please")
        .await
        .unwrap();
    assert!(matches!(outcome, TransferOutcome::Completed { .. }));

    // The original agent disconnecting must not disturb bob's ownership.
    engine.leave_presence(&ConnectionId::from("c1")).await.unwrap();

    let ticket = engine.get_ticket(&tenant, &conv).await.unwrap();
    assert_eq!(ticket.state, TicketState::Assigned);
    assert_eq!(ticket.assigned_agent, Some(bob.clone()));
    assert!(engine
        .presence()
        .get_presence(&bob)
        .unwrap()
        .owned_conversations
        .contains(&conv));
}

#[tokio::test]
async fn explicit_leave_requeues_owned_conversations_at_the_front() {
    let (engine, sink, _) = engine();
    let tenant = TenantId::from("acme");
    let conv = ConversationId::from("conv-1");

    engine
        .join_presence(&profile("alice", "acme", &[], 3), ConnectionId::from("c1"))
        .await
        .unwrap();
    engine
        .request_agent(&tenant, conv.clone(), PriorityClass::Normal, vec![])
        .await
        .unwrap();
    engine
        .request_agent(&tenant, ConversationId::from("conv-2"), PriorityClass::Normal, vec!["x".to_string()])
        .await
        .unwrap();

    engine.leave_presence(&ConnectionId::from("c1")).await.unwrap();

    assert_eq!(
        engine.presence().get_status(&AgentId::from("alice")),
        Some(AgentStatus::Offline)
    );
    let ticket = engine.get_ticket(&tenant, &conv).await.unwrap();
    assert_eq!(ticket.state, TicketState::Waiting);
    assert_eq!(ticket.assignment_version, 2);

    let facts = sink.facts();
    assert_eq!(facts.len(), 1);
    assert_eq!(facts[0].reason, LeaveReason::Disconnected);
}

#[tokio::test]
#[serial]
async fn heartbeat_lapse_forces_offline_and_requeues() {
    let mut config = ChatEngineConfig::default();
    config.presence.heartbeat_timeout = Duration::from_millis(50);
    config.presence.sweep_interval = Duration::from_millis(10);
    let (engine, sink, _) = engine_with(config);
    let tenant = TenantId::from("acme");
    let conv = ConversationId::from("conv-1");

    engine
        .join_presence(&profile("alice", "acme", &[], 3), ConnectionId::from("c1"))
        .await
        .unwrap();
    engine
        .request_agent(&tenant, conv.clone(), PriorityClass::Normal, vec![])
        .await
        .unwrap();

    // A heartbeat keeps the agent alive past the first window.
    tokio::time::sleep(Duration::from_millis(30)).await;
    engine.heartbeat(&AgentId::from("alice")).unwrap();
    let report = engine.run_sweep().await.unwrap();
    assert_eq!(report.agents_forced_offline, 0);

    // Silence past the timeout does not.
    tokio::time::sleep(Duration::from_millis(80)).await;
    let report = engine.run_sweep().await.unwrap();
    assert_eq!(report.agents_forced_offline, 1);
    assert_eq!(report.conversations_requeued, 1);

    assert_eq!(
        engine.presence().get_status(&AgentId::from("alice")),
        Some(AgentStatus::Offline)
    );
    let ticket = engine.get_ticket(&tenant, &conv).await.unwrap();
    assert_eq!(ticket.state, TicketState::Waiting);
    assert_eq!(ticket.assigned_agent, None);

    let facts = sink.facts();
    assert_eq!(facts.len(), 1);
    assert_eq!(facts[0].reason, LeaveReason::Disconnected);
}

#[tokio::test]
async fn cancellation_races_cleanly_with_assignment() {
    let (engine, _, _) = engine();
    let tenant = TenantId::from("acme");
    let conv = ConversationId::from("conv-1");

    engine
        .request_agent(&tenant, conv.clone(), PriorityClass::Normal, vec![])
        .await
        .unwrap();
    engine.cancel_waiting(&tenant, &conv).await.unwrap();

    let ticket = engine.get_ticket(&tenant, &conv).await.unwrap();
    assert_eq!(ticket.state, TicketState::Ended);

    // Cancelling a conversation that was already taken loses the race.
    let conv2 = ConversationId::from("conv-2");
    engine
        .join_presence(&profile("alice", "acme", &[], 3), ConnectionId::from("c1"))
        .await
        .unwrap();
    engine
        .request_agent(&tenant, conv2.clone(), PriorityClass::Normal, vec![])
        .await
        .unwrap();
    let err = engine.cancel_waiting(&tenant, &conv2).await.unwrap_err();
    assert!(matches!(err, ChatEngineError::RoutingConflict(_)));
}

#[tokio::test]
async fn cross_tenant_access_is_refused() {
    let (engine, _, _) = engine();

    engine
        .join_presence(&profile("alice", "acme", &[], 3), ConnectionId::from("c1"))
        .await
        .unwrap();
    engine
        .request_agent(
            &TenantId::from("globex"),
            ConversationId::from("conv-1"),
            PriorityClass::Normal,
            vec![],
        )
        .await
        .unwrap();

    // An acme agent cannot take a globex conversation.
    let err = engine
        .accept_conversation(
            &TenantId::from("globex"),
            &ConversationId::from("conv-1"),
            &AgentId::from("alice"),
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ChatEngineError::Unauthorized(_)));
}

#[tokio::test]
async fn queue_full_refuses_new_requests() {
    let mut config = ChatEngineConfig::default();
    config.queues.max_queue_size = 1;
    let (engine, _, _) = engine_with(config);
    let tenant = TenantId::from("acme");

    engine
        .request_agent(&tenant, ConversationId::from("conv-1"), PriorityClass::Normal, vec![])
        .await
        .unwrap();
    let err = engine
        .request_agent(&tenant, ConversationId::from("conv-2"), PriorityClass::Normal, vec![])
        .await
        .unwrap_err();
    assert!(matches!(err, ChatEngineError::QueueFull(_)));

    // The refused conversation left no ticket behind.
    let err = engine.get_ticket(&tenant, &ConversationId::from("conv-2")).await.unwrap_err();
    assert!(matches!(err, ChatEngineError::NotFound(_)));
}

#[tokio::test]
async fn recovery_rebinds_live_owners_and_requeues_the_rest() {
    let (engine, _, store) = engine();
    let tenant = TenantId::from("acme");

    engine
        .join_presence(&profile("alice", "acme", &[], 1), ConnectionId::from("c1"))
        .await
        .unwrap();

    store.insert(StoredConversation {
        conversation_id: ConversationId::from("conv-live"),
        tenant_id: tenant.clone(),
        customer_ref: Some("customer-7".to_string()),
        current_owner: Some(AgentId::from("alice")),
        owner_version: 4,
        ended: false,
    });
    store.insert(StoredConversation {
        conversation_id: ConversationId::from("conv-orphan"),
        tenant_id: tenant.clone(),
        customer_ref: None,
        current_owner: Some(AgentId::from("ghost")),
        owner_version: 2,
        ended: false,
    });
    store.insert(StoredConversation {
        conversation_id: ConversationId::from("conv-done"),
        tenant_id: tenant.clone(),
        customer_ref: None,
        current_owner: None,
        owner_version: 9,
        ended: true,
    });

    let recovered = engine.recover_from_store().await.unwrap();
    assert_eq!(recovered, 2);

    let live = engine.get_ticket(&tenant, &ConversationId::from("conv-live")).await.unwrap();
    assert_eq!(live.state, TicketState::Assigned);
    assert_eq!(live.assigned_agent, Some(AgentId::from("alice")));
    assert_eq!(live.assignment_version, 4);

    // Alice is at capacity, so the orphan stays queued at the front.
    let orphan = engine.get_ticket(&tenant, &ConversationId::from("conv-orphan")).await.unwrap();
    assert_eq!(orphan.state, TicketState::Waiting);
    let stats = engine.queue_stats(&tenant).await.unwrap();
    assert_eq!(stats.waiting, 1);
}

#[tokio::test]
async fn reconcile_repairs_a_double_claim() {
    let (engine, _, _) = engine();
    let tenant = TenantId::from("acme");
    let conv = ConversationId::from("conv-1");

    engine
        .join_presence(&profile("alice", "acme", &[], 3), ConnectionId::from("c1"))
        .await
        .unwrap();
    engine.join_presence(&profile("bob", "acme", &[], 3), ConnectionId::from("c2")).await.unwrap();
    engine
        .request_agent(&tenant, conv.clone(), PriorityClass::Normal, vec![])
        .await
        .unwrap();

    // A healthy ticket reconciles to a no-op.
    assert!(!engine.reconcile_ticket(&tenant, &conv).await.unwrap());

    // Corrupt the presence side with a second claimant.
    engine.presence().try_claim(&AgentId::from("bob"), &conv).unwrap();

    let mut rx = engine.subscribe();
    assert!(engine.reconcile_ticket(&tenant, &conv).await.unwrap());

    let ticket = engine.get_ticket(&tenant, &conv).await.unwrap();
    assert_eq!(ticket.state, TicketState::Waiting);
    assert_eq!(ticket.assigned_agent, None);
    assert!(engine
        .presence()
        .owners_of(&tenant, &conv)
        .is_empty());

    let published = rx.recv().await.unwrap();
    assert!(matches!(published.event, ChatEvent::TicketInconsistency { .. }));
}

#[tokio::test]
async fn assignment_events_reach_subscribers() {
    let (engine, _, store) = engine();
    let tenant = TenantId::from("acme");
    let conv = ConversationId::from("conv-1");

    let mut rx = engine.subscribe();
    engine
        .join_presence(&profile("alice", "acme", &[], 3), ConnectionId::from("c1"))
        .await
        .unwrap();
    store.insert(StoredConversation {
        conversation_id: conv.clone(),
        tenant_id: tenant.clone(),
        customer_ref: None,
        current_owner: None,
        owner_version: 0,
        ended: false,
    });
    engine
        .request_agent(&tenant, conv.clone(), PriorityClass::Normal, vec![])
        .await
        .unwrap();

    assert!(matches!(rx.recv().await.unwrap().event, ChatEvent::AgentJoined { .. }));
    assert!(matches!(
        rx.recv().await.unwrap().event,
        ChatEvent::ConversationAssigned { assignment_version: 1, .. }
    ));
    assert!(matches!(rx.recv().await.unwrap().event, ChatEvent::ConversationTaken { .. }));

    // The durable owner record follows the decision.
    let stored = store.get_conversation(&conv).await.unwrap().unwrap();
    assert_eq!(stored.current_owner, Some(AgentId::from("alice")));
    assert_eq!(stored.owner_version, 1);
}

#[tokio::test]
async fn message_recording_is_tenant_scoped() {
    let (engine, _, _) = engine();
    let tenant = TenantId::from("acme");
    let conv = ConversationId::from("conv-1");

    engine
        .join_presence(&profile("alice", "acme", &[], 3), ConnectionId::from("c1"))
        .await
        .unwrap();
    engine
        .request_agent(&tenant, conv.clone(), PriorityClass::Normal, vec![])
        .await
        .unwrap();

    // A globex caller cannot count messages on an acme conversation.
    let err = engine
        .record_agent_message(&TenantId::from("globex"), &conv)
        .unwrap_err();
    assert!(matches!(err, ChatEngineError::Unauthorized(_)));

    assert_eq!(engine.record_agent_message(&tenant, &conv).unwrap(), 1);
}

#[tokio::test]
async fn new_capacity_drains_the_backlog_in_queue_order() {
    let (engine, _, _) = engine();
    let tenant = TenantId::from("acme");
    let alice = AgentId::from("alice");

    // No agents yet, three conversations stack up in order.
    for (i, id) in ["t1", "t2", "t3"].iter().enumerate() {
        let outcome = engine
            .request_agent(&tenant, ConversationId::from(*id), PriorityClass::Normal, vec![])
            .await
            .unwrap();
        assert!(matches!(outcome, RequestOutcome::Queued { position } if position == i));
    }

    // A capacity-2 agent coming online drains the first two in one pass.
    engine
        .join_presence(&profile("alice", "acme", &[], 2), ConnectionId::from("c1"))
        .await
        .unwrap();

    for id in ["t1", "t2"] {
        let ticket = engine.get_ticket(&tenant, &ConversationId::from(id)).await.unwrap();
        assert_eq!(ticket.state, TicketState::Assigned);
        assert_eq!(ticket.assigned_agent, Some(alice.clone()));
    }
    let third = engine.get_ticket(&tenant, &ConversationId::from("t3")).await.unwrap();
    assert_eq!(third.state, TicketState::Waiting);
    let stats = engine.queue_stats(&tenant).await.unwrap();
    assert_eq!(stats.waiting, 1);

    // Freed capacity picks up the remainder.
    engine.close_conversation(&tenant, &ConversationId::from("t1")).await.unwrap();
    let third = engine.get_ticket(&tenant, &ConversationId::from("t3")).await.unwrap();
    assert_eq!(third.state, TicketState::Assigned);
    assert_eq!(third.assigned_agent, Some(alice));
}

/// Store whose owner writes take far longer than the tenant lock window
struct SlowStore {
    inner: InMemoryConversationStore,
    delay: Duration,
}

#[async_trait::async_trait]
impl ConversationStore for SlowStore {
    async fn get_conversation(
        &self,
        id: &ConversationId,
    ) -> livedesk_chat_engine::Result<Option<StoredConversation>> {
        self.inner.get_conversation(id).await
    }

    async fn set_owner(
        &self,
        id: &ConversationId,
        owner: Option<&AgentId>,
        version: u64,
    ) -> livedesk_chat_engine::Result<()> {
        tokio::time::sleep(self.delay).await;
        self.inner.set_owner(id, owner, version).await
    }

    async fn list_open_conversations(
        &self,
    ) -> livedesk_chat_engine::Result<Vec<StoredConversation>> {
        self.inner.list_open_conversations().await
    }
}

#[tokio::test]
async fn slow_store_does_not_stall_tenant_operations() {
    let mut config = ChatEngineConfig::default();
    config.general.lock_timeout = Duration::from_millis(200);
    let store = Arc::new(SlowStore {
        inner: InMemoryConversationStore::new(),
        delay: Duration::from_secs(2),
    });
    let sink = Arc::new(InMemoryAnalyticsSink::new());
    let engine = Arc::new(
        ChatCenterEngine::with_collaborators(config, store, sink)
            .expect("engine config should be valid"),
    );
    let tenant = TenantId::from("acme");

    engine
        .join_presence(&profile("alice", "acme", &[], 2), ConnectionId::from("c1"))
        .await
        .unwrap();

    let first = {
        let engine = engine.clone();
        let tenant = tenant.clone();
        tokio::spawn(async move {
            engine
                .request_agent(&tenant, ConversationId::from("conv-1"), PriorityClass::Normal, vec![])
                .await
        })
    };
    // Give the first request time to reach its durable owner write.
    tokio::time::sleep(Duration::from_millis(50)).await;

    // The write must not be holding the tenant lock: a second request
    // completes well inside the lock window instead of timing out.
    let second = engine
        .request_agent(&tenant, ConversationId::from("conv-2"), PriorityClass::Normal, vec![])
        .await
        .unwrap();
    assert!(matches!(second, RequestOutcome::Assigned(_)));

    let first = first.await.unwrap().unwrap();
    assert!(matches!(first, RequestOutcome::Assigned(_)));
}

#[tokio::test]
async fn second_device_keeps_agent_online() {
    let (engine, _, _) = engine();
    let tenant = TenantId::from("acme");
    let alice = profile("alice", "acme", &[], 3);

    assert!(engine.join_presence(&alice, ConnectionId::from("tab-1")).await.unwrap());
    assert!(!engine.join_presence(&alice, ConnectionId::from("tab-2")).await.unwrap());

    engine
        .request_agent(&tenant, ConversationId::from("conv-1"), PriorityClass::Normal, vec![])
        .await
        .unwrap();

    // Closing one tab keeps the agent and their conversation in place.
    engine.leave_presence(&ConnectionId::from("tab-1")).await.unwrap();
    assert_eq!(engine.presence().get_status(&alice.id), Some(AgentStatus::Online));
    let ticket = engine.get_ticket(&tenant, &ConversationId::from("conv-1")).await.unwrap();
    assert_eq!(ticket.assigned_agent, Some(alice.id.clone()));

    engine.leave_presence(&ConnectionId::from("tab-2")).await.unwrap();
    assert_eq!(engine.presence().get_status(&alice.id), Some(AgentStatus::Offline));
}
