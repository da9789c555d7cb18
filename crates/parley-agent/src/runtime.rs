//! Agent runtime: the perceive, reason, act, reflect loop of one agent.
//!
//! A step never fails from the caller's point of view. Whatever goes wrong
//! inside it (a reasoning backend error, a tool that keeps timing out, a
//! memory failure) ends the step with a `control` `AgentError` draft, so the
//! orchestrator always gets a message back for the turn it granted.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parley_core::{
    AgentId, AgentMemory, AgentState, ControlSignal, ConversationId, CorrelationId, Decision,
    IdempotencyKey, MemoryError, MemoryKeys, MemorySnapshot, Message, MessageDraft, MessageKind,
    Payload, Reasoner, ReasoningContext, ReasoningError, ToolCall, ToolCallId, ToolError, ToolName,
};
use parley_tools::ToolGateway;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::error::ParleyResult;

/// Runtime limits applied to every agent of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Tool calls allowed in one step before it is cut short
    pub max_tool_rounds: u32,
    /// Perceived messages kept per conversation and shown to the reasoner
    pub context_window: usize,
    /// Delivery keys remembered by an agent's driver for duplicate suppression
    pub dedup_window: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_tool_rounds: 4,
            context_window: 32,
            dedup_window: 1024,
        }
    }
}

/// The turn an agent was granted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    pub conversation: ConversationId,
    pub number: u64,
    /// Correlation of the grant; every draft of the step carries it
    pub correlation: CorrelationId,
}

/// How a step ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum StepOutcome {
    Responded,
    Terminated,
    Failed { reason: String },
}

/// Everything one step produced
#[derive(Debug, Clone, PartialEq)]
pub struct TurnOutput {
    /// Drafts in emission order: tool_call and tool_result drafts first, the
    /// turn's message last
    pub messages: Vec<MessageDraft>,
    /// Tool calls resolved during the step, retries included
    pub tool_calls: Vec<ToolCall>,
    pub outcome: StepOutcome,
}

impl TurnOutput {
    /// The message the step ended with
    pub fn message(&self) -> Option<&MessageDraft> {
        self.messages.last()
    }
}

/// A tool call the runtime is suspended on, saved to private memory so it can
/// be resumed with the same idempotency key after a restart
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Continuation {
    pub call_id: ToolCallId,
    pub tool: ToolName,
    pub arguments: Value,
    pub idempotency_key: IdempotencyKey,
    /// 1 for the first attempt, 2 for the timeout retry
    pub attempt: u32,
    pub conversation: ConversationId,
    pub turn: u64,
}

impl Continuation {
    fn new(turn: &Turn, call: &ToolCall, attempt: u32) -> Self {
        Self {
            call_id: call.id.clone(),
            tool: call.tool.clone(),
            arguments: call.arguments.clone(),
            idempotency_key: call.idempotency_key.clone(),
            attempt,
            conversation: turn.conversation.clone(),
            turn: turn.number,
        }
    }

    fn into_call(self, requester: AgentId) -> ToolCall {
        let mut call = ToolCall::new(requester, self.tool, self.arguments, self.idempotency_key)
            .in_conversation(self.conversation);
        call.id = self.call_id;
        call
    }
}

/// Why a step was cut short
#[derive(Debug, Error)]
enum StepError {
    #[error("reasoning failed: {0}")]
    Reasoning(#[from] ReasoningError),

    #[error("memory unavailable: {0}")]
    Memory(#[from] MemoryError),

    #[error("tool '{0}' timed out twice")]
    ToolTimedOut(ToolName),

    #[error("no decision after {0} tool rounds")]
    RoundsExhausted(u32),
}

/// Drafts and calls accumulated while a step runs
#[derive(Default)]
struct StepLog {
    messages: Vec<MessageDraft>,
    tool_calls: Vec<ToolCall>,
}

/// The loop driving one agent.
///
/// The runtime is owned by its agent's driver task, so a step has exclusive
/// access to it and runs to completion or is dropped as a whole.
pub struct AgentRuntime {
    id: AgentId,
    reasoner: Arc<dyn Reasoner>,
    memory: AgentMemory,
    gateway: Arc<ToolGateway>,
    config: RuntimeConfig,
    state: AgentState,
    perceived: HashMap<ConversationId, VecDeque<Message>>,
}

impl AgentRuntime {
    pub fn new(
        reasoner: Arc<dyn Reasoner>,
        memory: AgentMemory,
        gateway: Arc<ToolGateway>,
        config: RuntimeConfig,
    ) -> Self {
        Self {
            id: memory.owner().clone(),
            reasoner,
            memory,
            gateway,
            config,
            state: AgentState::Idle,
            perceived: HashMap::new(),
        }
    }

    pub fn id(&self) -> &AgentId {
        &self.id
    }

    pub fn state(&self) -> AgentState {
        self.state
    }

    pub fn memory(&self) -> &AgentMemory {
        &self.memory
    }

    /// Ingest a transcript message into the conversation's bounded history
    pub fn perceive(&mut self, message: Message) {
        let history = self
            .perceived
            .entry(message.conversation_id.clone())
            .or_default();
        if history
            .back()
            .is_some_and(|last| last.sequence >= message.sequence)
        {
            return;
        }
        history.push_back(message);
        while history.len() > self.config.context_window {
            history.pop_front();
        }
    }

    /// Messages perceived in `conversation`, oldest first
    pub fn history(&self, conversation: &ConversationId) -> Vec<Message> {
        self.perceived
            .get(conversation)
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop what was perceived in a finished conversation
    pub fn forget(&mut self, conversation: &ConversationId) {
        self.perceived.remove(conversation);
    }

    /// Reset after a step was dropped mid-flight
    pub(crate) fn abandon(&mut self, conversation: &ConversationId) {
        self.state = AgentState::Idle;
        self.forget(conversation);
    }

    /// Run one turn and return the drafts it produced
    pub async fn step(&mut self, turn: &Turn, incoming: Option<Message>) -> TurnOutput {
        self.enter(AgentState::Perceiving);
        if let Some(message) = incoming {
            self.perceive(message);
        }
        let snapshot = self.memory.snapshot(&turn.conversation);
        self.enter(AgentState::Reasoning);

        let mut log = StepLog::default();
        let (last, outcome) = match self.reason(turn, snapshot, &mut log).await {
            Ok(decided) => decided,
            Err(error) => {
                warn!(agent = %self.id, conversation = %turn.conversation, turn = turn.number, error = %error, "Step failed");
                let reason = error.to_string();
                let draft = self.draft(
                    turn,
                    MessageKind::Control,
                    ControlSignal::AgentError {
                        agent: self.id.clone(),
                        reason: reason.clone(),
                    },
                );
                (draft, StepOutcome::Failed { reason })
            }
        };

        self.enter(AgentState::Acting);
        log.messages.push(last);

        self.enter(AgentState::Reflecting);
        self.reflect(turn, &outcome);
        self.enter(AgentState::Idle);

        debug!(
            agent = %self.id,
            conversation = %turn.conversation,
            turn = turn.number,
            drafts = log.messages.len(),
            outcome = ?outcome,
            "Step finished"
        );
        TurnOutput {
            messages: log.messages,
            tool_calls: log.tool_calls,
            outcome,
        }
    }

    /// Ask the reasoner until it responds or terminates, running the tool
    /// calls it requests in between
    async fn reason(
        &mut self,
        turn: &Turn,
        snapshot: Result<MemorySnapshot, MemoryError>,
        log: &mut StepLog,
    ) -> Result<(MessageDraft, StepOutcome), StepError> {
        let memory = snapshot?;
        let mut tool_results: Vec<ToolCall> = Vec::new();
        let mut round: u32 = 0;

        loop {
            let context = ReasoningContext {
                agent: self.id.clone(),
                conversation: turn.conversation.clone(),
                turn: turn.number,
                round,
                transcript: self.history(&turn.conversation),
                memory: memory.clone(),
                tool_results: tool_results.clone(),
            };
            match self.reasoner.infer(&context).await? {
                Decision::Respond {
                    payload,
                    recipients,
                    kind,
                } => {
                    let draft = self.draft(turn, kind, payload).to(recipients);
                    return Ok((draft, StepOutcome::Responded));
                }
                Decision::Terminate { summary } => {
                    info!(agent = %self.id, conversation = %turn.conversation, "Agent declared the conversation done");
                    let draft = self.draft(
                        turn,
                        MessageKind::Control,
                        ControlSignal::Done {
                            agent: self.id.clone(),
                            summary,
                        },
                    );
                    return Ok((draft, StepOutcome::Terminated));
                }
                Decision::CallTool {
                    tool,
                    arguments,
                    idempotency_key,
                } => {
                    if round >= self.config.max_tool_rounds {
                        return Err(StepError::RoundsExhausted(round));
                    }
                    let key = idempotency_key.unwrap_or_else(|| {
                        IdempotencyKey::derived(&self.id, &turn.conversation, turn.number, round)
                    });
                    let call = ToolCall::new(self.id.clone(), tool, arguments, key)
                        .in_conversation(turn.conversation.clone());

                    self.enter(AgentState::AwaitingTool);
                    let resolved = self.await_tool(turn, call, log).await;
                    self.enter(AgentState::Reasoning);
                    let resolved = resolved?;

                    log.tool_calls.push(resolved.clone());
                    tool_results.push(resolved);
                    round += 1;
                }
            }
        }
    }

    /// Resolve `call`, retrying once with the same key if the wait times out.
    ///
    /// Every attempt logs a `tool_call` draft and, once resolved, a matching
    /// `tool_result` draft.
    async fn await_tool(
        &self,
        turn: &Turn,
        call: ToolCall,
        log: &mut StepLog,
    ) -> Result<ToolCall, StepError> {
        log.messages.push(self.tool_call_draft(turn, &call));
        self.save_continuation(&Continuation::new(turn, &call, 1))?;
        let first = self.invoke(call).await;
        log.messages.push(self.tool_result_draft(turn, &first));
        if !timed_out(&first) {
            self.clear_continuation()?;
            return Ok(first);
        }

        warn!(agent = %self.id, tool = %first.tool, key = %first.idempotency_key, "Tool call timed out, retrying once");
        self.note_tool_failure(turn, &first)?;
        let retry = first.reissue();
        log.tool_calls.push(first);
        log.messages.push(self.tool_call_draft(turn, &retry));
        self.save_continuation(&Continuation::new(turn, &retry, 2))?;
        let second = self.invoke(retry).await;
        self.clear_continuation()?;
        log.messages.push(self.tool_result_draft(turn, &second));

        if timed_out(&second) {
            self.note_tool_failure(turn, &second)?;
            let tool = second.tool.clone();
            log.tool_calls.push(second);
            return Err(StepError::ToolTimedOut(tool));
        }
        Ok(second)
    }

    /// Resume a tool call left pending by a previous run of this agent.
    ///
    /// The call is re-issued with its original id and idempotency key, so an
    /// execution that already finished is answered from the gateway cache.
    pub async fn recover(&mut self) -> ParleyResult<Option<ToolCall>> {
        let Some(record) = self.memory.read_private(&MemoryKeys::continuation())? else {
            return Ok(None);
        };
        let continuation: Continuation = serde_json::from_value(record.value)
            .map_err(|e| MemoryError::Serialization(e.to_string()))?;
        info!(
            agent = %self.id,
            conversation = %continuation.conversation,
            tool = %continuation.tool,
            key = %continuation.idempotency_key,
            "Recovering pending tool call"
        );

        self.enter(AgentState::AwaitingTool);
        let resolved = self.invoke(continuation.into_call(self.id.clone())).await;
        self.enter(AgentState::Idle);
        self.memory.remove_private(&MemoryKeys::continuation())?;
        Ok(Some(resolved))
    }

    async fn invoke(&self, call: ToolCall) -> ToolCall {
        let mut fallback = call.clone();
        match self.gateway.invoke(call).await {
            Ok(resolved) => resolved,
            Err(error) => {
                // `fallback` is a pending copy, so this resolution always applies.
                let _ = fallback.resolve(Err(ToolError::permanent(error.to_string())));
                fallback
            }
        }
    }

    fn save_continuation(&self, continuation: &Continuation) -> Result<(), MemoryError> {
        let value = serde_json::to_value(continuation)
            .map_err(|e| MemoryError::Serialization(e.to_string()))?;
        self.memory
            .write_private(&MemoryKeys::continuation(), value)?;
        Ok(())
    }

    fn clear_continuation(&self) -> Result<(), MemoryError> {
        self.memory.remove_private(&MemoryKeys::continuation())?;
        Ok(())
    }

    fn note_tool_failure(&self, turn: &Turn, call: &ToolCall) -> Result<(), MemoryError> {
        let error = match call.outcome() {
            Some(Err(error)) => error.to_string(),
            _ => return Ok(()),
        };
        self.memory.write_private(
            &MemoryKeys::last_tool_failure(),
            json!({
                "conversation": turn.conversation,
                "turn": turn.number,
                "tool": call.tool,
                "idempotency_key": call.idempotency_key,
                "error": error,
            }),
        )?;
        Ok(())
    }

    fn reflect(&self, turn: &Turn, outcome: &StepOutcome) {
        let value = json!({
            "conversation": turn.conversation,
            "turn": turn.number,
            "result": outcome,
        });
        if let Err(error) = self
            .memory
            .write_private(&MemoryKeys::last_outcome(), value)
        {
            warn!(agent = %self.id, error = %error, "Could not record step outcome");
        }
    }

    fn enter(&mut self, next: AgentState) {
        if !self.state.can_transition_to(next) {
            warn!(agent = %self.id, from = %self.state, to = %next, "Unexpected runtime transition");
        }
        self.state = next;
    }

    fn draft(
        &self,
        turn: &Turn,
        kind: MessageKind,
        payload: impl Into<Payload>,
    ) -> MessageDraft {
        MessageDraft::from_agent(self.id.clone(), kind, turn.correlation.clone(), payload)
    }

    fn tool_call_draft(&self, turn: &Turn, call: &ToolCall) -> MessageDraft {
        self.draft(
            turn,
            MessageKind::ToolCall,
            json!({
                "call_id": call.id,
                "tool": call.tool,
                "arguments": call.arguments,
                "idempotency_key": call.idempotency_key,
            }),
        )
    }

    fn tool_result_draft(&self, turn: &Turn, call: &ToolCall) -> MessageDraft {
        self.draft(
            turn,
            MessageKind::ToolResult,
            json!({
                "call_id": call.id,
                "tool": call.tool,
                "result": call.status(),
            }),
        )
    }
}

fn timed_out(call: &ToolCall) -> bool {
    matches!(call.outcome(), Some(Err(error)) if error.is_timeout())
}

impl std::fmt::Debug for AgentRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRuntime")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parley_core::{MemoryStore, Tool, ToolCallStatus};
    use parley_memory::InMemoryStore;
    use parley_tools::{GatewayConfig, ToolRegistry};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct FnReasoner<F>(F);

    fn reasoner<F>(f: F) -> FnReasoner<F>
    where
        F: Fn(&ReasoningContext) -> Result<Decision, ReasoningError> + Send + Sync,
    {
        FnReasoner(f)
    }

    #[async_trait]
    impl<F> Reasoner for FnReasoner<F>
    where
        F: Fn(&ReasoningContext) -> Result<Decision, ReasoningError> + Send + Sync,
    {
        async fn infer(&self, context: &ReasoningContext) -> Result<Decision, ReasoningError> {
            (self.0)(context)
        }
    }

    struct TestTool {
        delay: Duration,
        outcome: Result<Value, ToolError>,
        runs: AtomicUsize,
    }

    impl TestTool {
        fn new(delay: Duration, outcome: Result<Value, ToolError>) -> Arc<Self> {
            Arc::new(Self {
                delay,
                outcome,
                runs: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Tool for TestTool {
        fn name(&self) -> &str {
            "lookup"
        }

        async fn execute(&self, _arguments: &Value) -> Result<Value, ToolError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.outcome.clone()
        }
    }

    struct Fixture {
        store: Arc<dyn MemoryStore>,
        gateway: Arc<ToolGateway>,
        conversation: ConversationId,
    }

    impl Fixture {
        fn new(tool: Arc<TestTool>, call_timeout: Duration) -> Self {
            let registry = Arc::new(ToolRegistry::new());
            registry.register(tool).unwrap();
            let config = GatewayConfig {
                call_timeout,
                max_retries: 0,
                ..Default::default()
            };
            Self {
                store: Arc::new(InMemoryStore::new()),
                gateway: Arc::new(ToolGateway::new(registry, config)),
                conversation: ConversationId::generate(),
            }
        }

        fn runtime(&self, reasoner: impl Reasoner + 'static, config: RuntimeConfig) -> AgentRuntime {
            let memory = AgentMemory::new(agent(), Arc::clone(&self.store));
            AgentRuntime::new(Arc::new(reasoner), memory, Arc::clone(&self.gateway), config)
        }

        fn turn(&self, number: u64) -> Turn {
            Turn {
                conversation: self.conversation.clone(),
                number,
                correlation: CorrelationId::generate(),
            }
        }
    }

    fn agent() -> AgentId {
        AgentId::parse("b").unwrap()
    }

    fn lookup() -> ToolName {
        ToolName::parse("lookup").unwrap()
    }

    fn quick_tool() -> Arc<TestTool> {
        TestTool::new(Duration::ZERO, Ok(json!({"answer": 42})))
    }

    fn kinds(output: &TurnOutput) -> Vec<MessageKind> {
        output.messages.iter().map(|m| m.kind).collect()
    }

    #[tokio::test]
    async fn test_respond_and_reflect() {
        let fixture = Fixture::new(quick_tool(), Duration::from_secs(1));
        let mut runtime = fixture.runtime(
            reasoner(|_| Ok(Decision::respond("hello"))),
            RuntimeConfig::default(),
        );
        let turn = fixture.turn(1);
        let output = runtime.step(&turn, None).await;

        assert_eq!(output.outcome, StepOutcome::Responded);
        assert_eq!(kinds(&output), vec![MessageKind::Response]);
        let message = output.message().unwrap();
        assert_eq!(message.payload, Payload::Text("hello".into()));
        assert_eq!(message.correlation_id, turn.correlation);
        assert_eq!(runtime.state(), AgentState::Idle);

        let reflected = runtime
            .memory()
            .read_private(&MemoryKeys::last_outcome())
            .unwrap()
            .unwrap();
        assert_eq!(reflected.value["result"]["outcome"], "responded");
    }

    #[tokio::test]
    async fn test_tool_round_trip_uses_derived_key() {
        let tool = quick_tool();
        let fixture = Fixture::new(Arc::clone(&tool), Duration::from_secs(1));
        let reasoner = reasoner(|ctx| match ctx.last_tool_result() {
            None => Ok(Decision::call_tool(lookup(), json!({"q": "rust"}))),
            Some(call) => Ok(Decision::respond(format!("{:?}", call.outcome()))),
        });
        let mut runtime = fixture.runtime(reasoner, RuntimeConfig::default());
        let output = runtime.step(&fixture.turn(3), None).await;

        assert_eq!(
            kinds(&output),
            vec![MessageKind::ToolCall, MessageKind::ToolResult, MessageKind::Response]
        );
        assert_eq!(output.tool_calls.len(), 1);
        let call = &output.tool_calls[0];
        assert_eq!(
            call.idempotency_key,
            IdempotencyKey::derived(&agent(), &fixture.conversation, 3, 0)
        );
        assert_eq!(call.status(), &ToolCallStatus::Success(json!({"answer": 42})));
        assert_eq!(call.conversation.as_ref(), Some(&fixture.conversation));
        assert_eq!(tool.runs.load(Ordering::SeqCst), 1);
        // resolved calls leave no continuation behind
        assert!(
            runtime
                .memory()
                .read_private(&MemoryKeys::continuation())
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_permanent_failure_is_handed_to_reasoner() {
        let tool = TestTool::new(Duration::ZERO, Err(ToolError::permanent("no such record")));
        let fixture = Fixture::new(tool, Duration::from_secs(1));
        let reasoner = reasoner(|ctx| match ctx.last_tool_result() {
            None => Ok(Decision::call_tool(lookup(), json!({}))),
            Some(call) => match call.outcome() {
                Some(Err(ToolError::Permanent { .. })) => Ok(Decision::respond("worked around it")),
                other => Err(ReasoningError::Backend(format!("unexpected {:?}", other))),
            },
        });
        let mut runtime = fixture.runtime(reasoner, RuntimeConfig::default());
        let output = runtime.step(&fixture.turn(1), None).await;

        assert_eq!(output.outcome, StepOutcome::Responded);
        assert_eq!(
            output.message().unwrap().payload,
            Payload::Text("worked around it".into())
        );
    }

    #[tokio::test]
    async fn test_timeout_retry_picks_up_detached_result() {
        let tool = TestTool::new(Duration::from_millis(150), Ok(json!("slow answer")));
        let fixture = Fixture::new(Arc::clone(&tool), Duration::from_millis(100));
        let reasoner = reasoner(|ctx| match ctx.last_tool_result() {
            None => Ok(Decision::call_tool(lookup(), json!({"x": 1}))),
            Some(_) => Ok(Decision::respond("done")),
        });
        let mut runtime = fixture.runtime(reasoner, RuntimeConfig::default());
        let turn = fixture.turn(1);
        let output = runtime.step(&turn, None).await;

        assert_eq!(output.outcome, StepOutcome::Responded);
        assert_eq!(
            kinds(&output),
            vec![
                MessageKind::ToolCall,
                MessageKind::ToolResult,
                MessageKind::ToolCall,
                MessageKind::ToolResult,
                MessageKind::Response
            ]
        );
        // each attempt's result answers its own call
        let call_ids: Vec<&Value> = output.messages[..4]
            .iter()
            .map(|m| match &m.payload {
                Payload::Json(value) => &value["call_id"],
                other => panic!("expected json payload, got {:?}", other),
            })
            .collect();
        assert_eq!(call_ids[0], call_ids[1]);
        assert_eq!(call_ids[2], call_ids[3]);
        assert_ne!(call_ids[0], call_ids[2]);
        assert_eq!(output.tool_calls.len(), 2);
        assert!(timed_out(&output.tool_calls[0]));
        assert_eq!(
            output.tool_calls[1].status(),
            &ToolCallStatus::Success(json!("slow answer"))
        );
        assert_eq!(
            output.tool_calls[0].idempotency_key,
            output.tool_calls[1].idempotency_key
        );
        assert_eq!(tool.runs.load(Ordering::SeqCst), 1);

        let failure = runtime
            .memory()
            .read_private(&MemoryKeys::last_tool_failure())
            .unwrap()
            .unwrap();
        assert_eq!(failure.value["tool"], "lookup");
    }

    #[tokio::test]
    async fn test_second_timeout_ends_step_with_agent_error() {
        let tool = TestTool::new(Duration::from_secs(2), Ok(json!("too late")));
        let fixture = Fixture::new(Arc::clone(&tool), Duration::from_millis(30));
        let reasoner = reasoner(|_| Ok(Decision::call_tool(lookup(), json!({}))));
        let mut runtime = fixture.runtime(reasoner, RuntimeConfig::default());
        let output = runtime.step(&fixture.turn(1), None).await;

        assert!(matches!(output.outcome, StepOutcome::Failed { ref reason } if reason.contains("lookup")));
        assert_eq!(
            kinds(&output),
            vec![
                MessageKind::ToolCall,
                MessageKind::ToolResult,
                MessageKind::ToolCall,
                MessageKind::ToolResult,
                MessageKind::Control
            ]
        );
        let failed_attempts = output
            .messages
            .iter()
            .filter(|m| matches!(&m.payload, Payload::Json(v) if v["result"]["status"] == "failure"))
            .count();
        assert_eq!(failed_attempts, 2);
        match output.message().unwrap().payload.as_control() {
            Some(ControlSignal::AgentError { agent: who, reason }) => {
                assert_eq!(who, &agent());
                assert!(reason.contains("lookup"));
            }
            other => panic!("expected agent error, got {:?}", other),
        }
        assert_eq!(output.tool_calls.len(), 2);
        assert_eq!(runtime.state(), AgentState::Idle);
        assert_eq!(tool.runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_reasoning_error_becomes_agent_error() {
        let fixture = Fixture::new(quick_tool(), Duration::from_secs(1));
        let mut runtime = fixture.runtime(
            reasoner(|_| Err(ReasoningError::Backend("model offline".into()))),
            RuntimeConfig::default(),
        );
        let output = runtime.step(&fixture.turn(1), None).await;
        assert!(matches!(
            output.message().unwrap().payload.as_control(),
            Some(ControlSignal::AgentError { reason, .. }) if reason.contains("model offline")
        ));
    }

    #[tokio::test]
    async fn test_tool_rounds_are_bounded() {
        let tool = quick_tool();
        let fixture = Fixture::new(Arc::clone(&tool), Duration::from_secs(1));
        let reasoner = reasoner(|ctx| {
            Ok(Decision::call_tool(lookup(), json!({"round": ctx.round})))
        });
        let config = RuntimeConfig {
            max_tool_rounds: 2,
            ..Default::default()
        };
        let mut runtime = fixture.runtime(reasoner, config);
        let output = runtime.step(&fixture.turn(1), None).await;

        assert!(matches!(output.outcome, StepOutcome::Failed { .. }));
        assert_eq!(output.tool_calls.len(), 2);
        assert_eq!(tool.runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_terminate_emits_done() {
        let fixture = Fixture::new(quick_tool(), Duration::from_secs(1));
        let mut runtime = fixture.runtime(
            reasoner(|_| Ok(Decision::terminate("agreed"))),
            RuntimeConfig::default(),
        );
        let output = runtime.step(&fixture.turn(1), None).await;
        assert_eq!(output.outcome, StepOutcome::Terminated);
        assert!(output.message().unwrap().is_terminal_signal());
    }

    #[tokio::test]
    async fn test_perceived_history_is_bounded() {
        let fixture = Fixture::new(quick_tool(), Duration::from_secs(1));
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let reasoner = reasoner(move |ctx| {
            counter.store(ctx.transcript.len(), Ordering::SeqCst);
            Ok(Decision::respond("ok"))
        });
        let config = RuntimeConfig {
            context_window: 3,
            ..Default::default()
        };
        let mut runtime = fixture.runtime(reasoner, config);
        let other = AgentId::parse("a").unwrap();
        for seq in 1..=5 {
            let message = MessageDraft::from_agent(
                other.clone(),
                MessageKind::Response,
                CorrelationId::generate(),
                format!("m{}", seq),
            )
            .sequence(fixture.conversation.clone(), seq);
            runtime.perceive(message.clone());
            // redelivery is ignored
            runtime.perceive(message);
        }
        let history = runtime.history(&fixture.conversation);
        assert_eq!(history.iter().map(|m| m.sequence).collect::<Vec<_>>(), vec![3, 4, 5]);

        runtime.step(&fixture.turn(1), None).await;
        assert_eq!(seen.load(Ordering::SeqCst), 3);
        runtime.forget(&fixture.conversation);
        assert!(runtime.history(&fixture.conversation).is_empty());
    }

    #[tokio::test]
    async fn test_recover_reuses_cached_execution() {
        let tool = quick_tool();
        let fixture = Fixture::new(Arc::clone(&tool), Duration::from_secs(1));
        let turn = fixture.turn(4);
        let key = IdempotencyKey::parse("k1").unwrap();
        let call = ToolCall::new(agent(), lookup(), json!({"x": 1}), key.clone());

        // the first run finished the execution but crashed before clearing
        // its continuation
        fixture.gateway.invoke(call.clone()).await.unwrap();
        let crashed = fixture.runtime(
            reasoner(|_| Ok(Decision::respond("unused"))),
            RuntimeConfig::default(),
        );
        crashed
            .save_continuation(&Continuation::new(&turn, &call, 1))
            .unwrap();
        drop(crashed);

        let mut restarted = fixture.runtime(
            reasoner(|_| Ok(Decision::respond("unused"))),
            RuntimeConfig::default(),
        );
        let recovered = restarted.recover().await.unwrap().unwrap();
        assert_eq!(recovered.id, call.id);
        assert_eq!(recovered.idempotency_key, key);
        assert_eq!(recovered.status(), &ToolCallStatus::Success(json!({"answer": 42})));
        assert_eq!(tool.runs.load(Ordering::SeqCst), 1);
        assert_eq!(fixture.gateway.stats().cache_hits, 1);

        assert!(restarted.recover().await.unwrap().is_none());
    }
}
