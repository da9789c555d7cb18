//! End-to-end conversation scenarios
//!
//! Each test runs real agents in a session with short timeouts and checks the
//! archived record and transcript.

use std::sync::Arc;
use std::time::Duration;

use parley_core::{
    AgentDescriptor, ConversationSpec, ConversationState, Decision, IdempotencyKey, MemoryKeys,
    MemoryScope, MessageKind, OrchestrationFault, TerminationReason, ToolCall, ToolName,
    TurnPolicy,
};
use parley_testing::{
    EchoReasoner, FailingReasoner, MockTool, ScriptedReasoner, SessionHarness, SilentReasoner,
    StaticSelector, ToolUser, agent_id,
};
use serde_json::json;

fn tool(name: &str) -> ToolName {
    ToolName::parse(name).unwrap()
}

#[tokio::test]
async fn test_round_robin_three_agents_six_turns() {
    let harness = SessionHarness::builder().build().unwrap();
    let a = harness.spawn("a", EchoReasoner).await;
    let b = harness.spawn("b", EchoReasoner).await;
    let c = harness.spawn("c", EchoReasoner).await;

    let outcome = harness
        .run(ConversationSpec::new(vec![a, b, c]).with_max_turns(6))
        .await
        .unwrap();

    assert_eq!(outcome.record.state, ConversationState::Archived);
    assert_eq!(outcome.record.reason, Some(TerminationReason::MaxTurns));
    assert_eq!(outcome.record.turns, 6);
    assert_eq!(outcome.record.messages, 6);
    assert_eq!(outcome.senders(), vec!["a", "b", "c", "a", "b", "c"]);
    assert_eq!(outcome.sequences(), vec![1, 2, 3, 4, 5, 6]);
    assert!(outcome.record.faults.is_empty());
}

#[tokio::test]
async fn test_message_limit_stops_mid_round() {
    let harness = SessionHarness::builder().build().unwrap();
    let a = harness.spawn("a", EchoReasoner).await;
    let b = harness.spawn("b", EchoReasoner).await;
    let c = harness.spawn("c", EchoReasoner).await;

    let outcome = harness
        .run(ConversationSpec::new(vec![a, b, c]).with_max_messages(4))
        .await
        .unwrap();

    assert_eq!(outcome.record.reason, Some(TerminationReason::MaxMessages));
    assert_eq!(outcome.senders(), vec!["a", "b", "c", "a"]);
}

#[tokio::test]
async fn test_concurrent_calls_with_same_key_execute_once() {
    let harness = SessionHarness::builder().build().unwrap();
    let slow = Arc::new(
        MockTool::new("compute")
            .with_default_response(json!({"value": 7}))
            .with_delay(Duration::from_millis(100)),
    );
    harness.register_tool(slow.clone());
    let gateway = harness.session().gateway().clone();

    let key = IdempotencyKey::parse("k1").unwrap();
    let call = || ToolCall::new(agent_id("b"), tool("compute"), json!({"x": 1}), key.clone());
    let (first, second) = tokio::join!(gateway.invoke(call()), gateway.invoke(call()));
    let (first, second) = (first.unwrap(), second.unwrap());

    assert_eq!(slow.call_count(), 1);
    assert_eq!(first.outcome(), second.outcome());
    assert_eq!(first.outcome(), Some(Ok(&json!({"value": 7}))));
}

#[tokio::test]
async fn test_same_key_across_concurrent_conversations() {
    let harness = SessionHarness::builder().build().unwrap();
    let slow = Arc::new(
        MockTool::new("compute")
            .with_default_response(json!({"value": 7}))
            .with_delay(Duration::from_millis(100)),
    );
    harness.register_tool(slow.clone());
    let key = IdempotencyKey::parse("k1").unwrap();
    let b1 = harness
        .spawn("b1", ToolUser::new(tool("compute"), json!({"x": 1})).with_key(key.clone()))
        .await;
    let b2 = harness
        .spawn("b2", ToolUser::new(tool("compute"), json!({"x": 1})).with_key(key))
        .await;

    let (one, two) = tokio::join!(
        harness.run(ConversationSpec::new(vec![b1]).with_max_turns(1)),
        harness.run(ConversationSpec::new(vec![b2]).with_max_turns(1)),
    );
    let (one, two) = (one.unwrap(), two.unwrap());

    assert_eq!(slow.call_count(), 1);
    // tool_call, tool_result, response in each conversation
    assert_eq!(one.messages().len(), 3);
    assert_eq!(two.messages().len(), 3);
    assert_eq!(one.messages()[2].payload, two.messages()[2].payload);
}

#[tokio::test]
async fn test_missed_turn_is_recorded_and_conversation_continues() {
    let harness = SessionHarness::builder()
        .turn_timeout(Duration::from_millis(100))
        .build()
        .unwrap();
    let a = harness.spawn("a", SilentReasoner::default()).await;
    let b = harness.spawn("b", EchoReasoner).await;

    let outcome = harness
        .run(ConversationSpec::new(vec![a.clone(), b]).with_max_turns(2))
        .await
        .unwrap();

    assert_eq!(outcome.signals(), vec!["delivery_timeout"]);
    assert_eq!(outcome.senders(), vec!["orchestrator", "b"]);
    assert_eq!(outcome.record.reason, Some(TerminationReason::MaxTurns));
    assert!(matches!(
        outcome.record.faults.as_slice(),
        [OrchestrationFault::DeliveryTimeout { agent, .. }] if *agent == a
    ));
    assert!(outcome.record.removed.is_empty());
}

#[tokio::test]
async fn test_unresponsive_agent_is_removed_from_rotation() {
    let harness = SessionHarness::builder()
        .turn_timeout(Duration::from_millis(50))
        .max_consecutive_timeouts(2)
        .build()
        .unwrap();
    let a = harness.spawn("a", SilentReasoner::default()).await;
    let b = harness.spawn("b", EchoReasoner).await;

    let outcome = harness
        .run(ConversationSpec::new(vec![a.clone(), b]).with_max_turns(5))
        .await
        .unwrap();

    // a misses turns 1 and 3, is removed, and b speaks on the rest
    assert_eq!(
        outcome.signals(),
        vec!["delivery_timeout", "delivery_timeout", "unresponsive"]
    );
    assert_eq!(outcome.speakers(), vec!["b", "b", "b"]);
    assert_eq!(outcome.record.removed, vec![a]);
}

#[tokio::test]
async fn test_deregistering_mid_conversation_never_blocks() {
    let harness = SessionHarness::builder().build().unwrap();
    let slow = Arc::new(MockTool::new("slow").with_delay(Duration::from_millis(150)));
    harness.register_tool(slow);
    let a = harness
        .spawn("a", ToolUser::new(tool("slow"), json!({})))
        .await;
    let b = harness.spawn("b", EchoReasoner).await;
    let c = harness.spawn("c", EchoReasoner).await;

    let session = harness.session();
    let id = session
        .create_conversation(ConversationSpec::new(vec![a, b.clone(), c]).with_max_turns(4))
        .await
        .unwrap();
    // a is still waiting on its tool when b leaves
    tokio::time::sleep(Duration::from_millis(50)).await;
    session.deregister_agent(&b).await.unwrap();

    let record = tokio::time::timeout(Duration::from_secs(5), session.wait(&id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.turns, 4);

    let transcript = session.transcript(&id).await.unwrap();
    let speakers: Vec<String> = transcript
        .messages()
        .iter()
        .filter(|m| m.kind == MessageKind::Response)
        .map(|m| m.sender.to_string())
        .collect();
    assert_eq!(speakers, vec!["a", "c", "a", "c"]);
}

#[tokio::test]
async fn test_priority_policy_orders_each_round() {
    let harness = SessionHarness::builder().build().unwrap();
    let session = harness.session();
    for (id, priority) in [("low", 1), ("high", 9), ("mid", 5)] {
        session
            .spawn_agent(
                AgentDescriptor::new(agent_id(id)).with_priority(priority),
                Arc::new(EchoReasoner),
            )
            .await
            .unwrap();
    }

    let spec = ConversationSpec::new(vec![agent_id("low"), agent_id("high"), agent_id("mid")])
        .with_policy(TurnPolicy::Priority)
        .with_max_messages(4);
    let outcome = harness.run(spec).await.unwrap();
    assert_eq!(outcome.senders(), vec!["high", "mid", "low", "high"]);
}

#[tokio::test]
async fn test_done_signal_ends_conversation() {
    let harness = SessionHarness::builder().build().unwrap();
    let a = harness
        .spawn(
            "a",
            ScriptedReasoner::new(vec![Decision::respond("hello"), Decision::terminate("bye")]),
        )
        .await;
    let b = harness.spawn("b", EchoReasoner).await;

    let outcome = harness
        .run(ConversationSpec::new(vec![a.clone(), b]).with_max_turns(10))
        .await
        .unwrap();

    assert_eq!(outcome.senders(), vec!["a", "b", "a"]);
    assert_eq!(outcome.signals(), vec!["done"]);
    assert_eq!(
        outcome.record.reason,
        Some(TerminationReason::Done {
            agent: a,
            summary: Some("bye".into())
        })
    );
    assert_eq!(outcome.record.turns, 3);
}

#[tokio::test]
async fn test_failing_agent_is_recorded_not_fatal() {
    let harness = SessionHarness::builder().build().unwrap();
    let a = harness.spawn("a", FailingReasoner::default()).await;
    let b = harness.spawn("b", EchoReasoner).await;

    let outcome = harness
        .run(ConversationSpec::new(vec![a.clone(), b]).with_max_turns(2))
        .await
        .unwrap();

    assert_eq!(outcome.signals(), vec!["agent_error"]);
    assert_eq!(outcome.senders(), vec!["a", "b"]);
    assert!(matches!(
        outcome.record.faults.as_slice(),
        [OrchestrationFault::AgentFault { agent, .. }] if *agent == a
    ));
}

#[tokio::test]
async fn test_invalid_selection_falls_back_to_round_robin() {
    let harness = SessionHarness::builder().build().unwrap();
    let lead = harness
        .spawn_coordinator("lead", EchoReasoner, StaticSelector::always(agent_id("outsider")))
        .await;
    let x = harness.spawn("x", EchoReasoner).await;

    let spec = ConversationSpec::new(vec![lead.clone(), x])
        .with_policy(TurnPolicy::Dynamic { coordinator: lead })
        .with_max_turns(2);
    let outcome = harness.run(spec).await.unwrap();
    assert_eq!(outcome.senders(), vec!["lead", "x"]);
    assert!(outcome.record.faults.is_empty());
}

#[tokio::test]
async fn test_external_termination() {
    let harness = SessionHarness::builder()
        .turn_timeout(Duration::from_secs(5))
        .build()
        .unwrap();
    let a = harness.spawn("a", SilentReasoner::default()).await;
    let session = harness.session();
    let id = session
        .create_conversation(ConversationSpec::new(vec![a]))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(30)).await;
    session.terminate(&id).await.unwrap();
    let record = session.wait(&id).await.unwrap();
    assert_eq!(record.reason, Some(TerminationReason::External));
    assert!(session.transcript(&id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_termination_cancels_pending_tool_call() {
    let harness = SessionHarness::builder().build().unwrap();
    let slow = Arc::new(MockTool::new("side_effect").with_delay(Duration::from_millis(300)));
    harness.register_tool(slow.clone());
    let a = harness
        .spawn("a", ToolUser::new(tool("side_effect"), json!({"write": true})))
        .await;
    let session = harness.session();
    let id = session
        .create_conversation(ConversationSpec::new(vec![a.clone()]))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    session.terminate(&id).await.unwrap();
    let record = session.wait(&id).await.unwrap();
    assert_eq!(record.state, ConversationState::Archived);
    assert_eq!(record.reason, Some(TerminationReason::External));

    tokio::time::sleep(Duration::from_millis(350)).await;
    assert_eq!(slow.call_count(), 1);
    assert_eq!(slow.completed_count(), 0);
    let gateway = session.gateway();
    assert!(gateway.ledger(&a).is_empty());
    assert_eq!(gateway.pending(), 0);
    assert_eq!(gateway.stats().cancelled, 1);
}

#[tokio::test]
async fn test_explicit_key_is_reusable_in_a_later_conversation() {
    let harness = SessionHarness::builder().build().unwrap();
    let compute = Arc::new(MockTool::new("compute"));
    harness.register_tool(compute.clone());
    let key = IdempotencyKey::parse("k1").unwrap();
    let first = harness
        .spawn("first", ToolUser::new(tool("compute"), json!({"x": 1})).with_key(key.clone()))
        .await;
    let second = harness
        .spawn("second", ToolUser::new(tool("compute"), json!({"x": 2})).with_key(key))
        .await;

    harness
        .run(ConversationSpec::new(vec![first]).with_max_turns(1))
        .await
        .unwrap();
    let later = harness
        .run(ConversationSpec::new(vec![second]).with_max_turns(1))
        .await
        .unwrap();

    assert_eq!(compute.call_count(), 2);
    assert!(later.record.faults.is_empty());
    assert!(later.signals().is_empty());
}

#[tokio::test]
async fn test_deregistering_the_current_speaker_skips_its_turn() {
    let harness = SessionHarness::builder()
        .turn_timeout(Duration::from_secs(2))
        .build()
        .unwrap();
    let a = harness.spawn("a", SilentReasoner::default()).await;
    let b = harness.spawn("b", EchoReasoner).await;
    let session = harness.session();
    let id = session
        .create_conversation(ConversationSpec::new(vec![a.clone(), b]).with_max_turns(2))
        .await
        .unwrap();

    // a holds turn 1
    tokio::time::sleep(Duration::from_millis(50)).await;
    let left = tokio::time::Instant::now();
    session.deregister_agent(&a).await.unwrap();

    let record = tokio::time::timeout(Duration::from_secs(1), session.wait(&id))
        .await
        .unwrap()
        .unwrap();
    assert!(left.elapsed() < Duration::from_secs(1));
    assert_eq!(record.reason, Some(TerminationReason::MaxTurns));
    assert!(record.faults.is_empty());
    assert!(record.removed.is_empty());

    let transcript = session.transcript(&id).await.unwrap();
    assert!(transcript.messages().iter().all(|m| m.kind != MessageKind::Control));
    let senders: Vec<String> = transcript.messages().iter().map(|m| m.sender.to_string()).collect();
    assert_eq!(senders, vec!["b"]);
}

#[tokio::test]
async fn test_deregistered_agent_loses_private_memory() {
    let harness = SessionHarness::builder().build().unwrap();
    let a = harness.spawn("a", EchoReasoner).await;
    harness
        .run(ConversationSpec::new(vec![a.clone()]).with_max_turns(1))
        .await
        .unwrap();

    let session = harness.session();
    let scope = MemoryScope::Private(a.clone());
    assert!(session.memory().read(&scope, &MemoryKeys::last_outcome()).unwrap().is_some());

    session.deregister_agent(&a).await.unwrap();
    assert!(session.memory().read(&scope, &MemoryKeys::last_outcome()).unwrap().is_none());
}
