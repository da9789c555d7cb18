//! # Mock Reasoners
//!
//! Deterministic stand-ins for the language-model side: scripted decision
//! sequences, echoing, failing and never-answering reasoners, and a fixed
//! speaker selector.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parley_core::{
    AgentId, ConversationId, Decision, IdempotencyKey, Message, Reasoner, ReasoningContext,
    ReasoningError, SpeakerSelector, ToolName,
};
use serde_json::Value;

/// Plays back a fixed list of decisions, one per reasoning round
#[derive(Debug)]
pub struct ScriptedReasoner {
    decisions: Vec<Decision>,
    cycle: bool,
    cursor: AtomicUsize,
}

impl ScriptedReasoner {
    /// Play `decisions` once, then terminate
    pub fn new(decisions: Vec<Decision>) -> Self {
        Self {
            decisions,
            cycle: false,
            cursor: AtomicUsize::new(0),
        }
    }

    /// Start over from the first decision once the script runs out
    pub fn cycled(mut self) -> Self {
        self.cycle = true;
        self
    }

    /// Decisions handed out so far
    pub fn played(&self) -> usize {
        self.cursor.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Reasoner for ScriptedReasoner {
    async fn infer(&self, _context: &ReasoningContext) -> Result<Decision, ReasoningError> {
        let index = self.cursor.fetch_add(1, Ordering::SeqCst);
        let next = match (self.decisions.len(), self.cycle) {
            (0, _) => None,
            (len, true) => self.decisions.get(index % len),
            (_, false) => self.decisions.get(index),
        };
        Ok(next
            .cloned()
            .unwrap_or_else(|| Decision::terminate("script finished")))
    }
}

/// Answers every turn with a line naming itself and the turn.
///
/// After a tool round it reports the tool result instead.
#[derive(Debug, Default)]
pub struct EchoReasoner;

#[async_trait]
impl Reasoner for EchoReasoner {
    async fn infer(&self, context: &ReasoningContext) -> Result<Decision, ReasoningError> {
        if let Some(call) = context.last_tool_result() {
            let result = serde_json::to_string(&call.status())
                .map_err(|e| ReasoningError::Backend(e.to_string()))?;
            return Ok(Decision::respond(format!("{} got {}", call.tool, result)));
        }
        Ok(Decision::respond(format!(
            "{} speaking on turn {}",
            context.agent, context.turn
        )))
    }
}

/// Calls one tool on every turn, then reports the result
#[derive(Debug)]
pub struct ToolUser {
    tool: ToolName,
    arguments: Value,
    key: Option<IdempotencyKey>,
}

impl ToolUser {
    pub fn new(tool: ToolName, arguments: Value) -> Self {
        Self {
            tool,
            arguments,
            key: None,
        }
    }

    /// Use `key` for every call instead of a derived key
    pub fn with_key(mut self, key: IdempotencyKey) -> Self {
        self.key = Some(key);
        self
    }
}

#[async_trait]
impl Reasoner for ToolUser {
    async fn infer(&self, context: &ReasoningContext) -> Result<Decision, ReasoningError> {
        if context.tool_results.is_empty() {
            return Ok(Decision::CallTool {
                tool: self.tool.clone(),
                arguments: self.arguments.clone(),
                idempotency_key: self.key.clone(),
            });
        }
        EchoReasoner.infer(context).await
    }
}

/// Fails every reasoning request
#[derive(Debug)]
pub struct FailingReasoner {
    error: ReasoningError,
}

impl FailingReasoner {
    pub fn new(error: ReasoningError) -> Self {
        Self { error }
    }
}

impl Default for FailingReasoner {
    fn default() -> Self {
        Self::new(ReasoningError::Backend("model unavailable".into()))
    }
}

#[async_trait]
impl Reasoner for FailingReasoner {
    async fn infer(&self, _context: &ReasoningContext) -> Result<Decision, ReasoningError> {
        Err(self.error.clone())
    }
}

/// Takes far longer than any turn window before answering
#[derive(Debug)]
pub struct SilentReasoner {
    delay: Duration,
}

impl SilentReasoner {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl Default for SilentReasoner {
    fn default() -> Self {
        Self::new(Duration::from_secs(3600))
    }
}

#[async_trait]
impl Reasoner for SilentReasoner {
    async fn infer(&self, context: &ReasoningContext) -> Result<Decision, ReasoningError> {
        tokio::time::sleep(self.delay).await;
        Ok(Decision::respond(format!("{} finally answers", context.agent)))
    }
}

/// Picks speakers from a fixed list in order, skipping ineligible ones.
///
/// Falls back to the first candidate once the list runs out.
#[derive(Debug)]
pub struct StaticSelector {
    picks: Mutex<Vec<AgentId>>,
}

impl StaticSelector {
    pub fn new(picks: Vec<AgentId>) -> Self {
        let mut picks = picks;
        picks.reverse();
        Self {
            picks: Mutex::new(picks),
        }
    }

    /// Always pick `agent`, even when it is not a candidate
    pub fn always(agent: AgentId) -> AlwaysSelector {
        AlwaysSelector(agent)
    }
}

#[async_trait]
impl SpeakerSelector for StaticSelector {
    async fn select_next(
        &self,
        _conversation: &ConversationId,
        candidates: &[AgentId],
        _transcript: &[Message],
    ) -> Result<AgentId, ReasoningError> {
        let mut picks = self.picks.lock().unwrap();
        while let Some(pick) = picks.pop() {
            if candidates.contains(&pick) {
                return Ok(pick);
            }
        }
        candidates
            .first()
            .cloned()
            .ok_or_else(|| ReasoningError::InvalidDecision("no candidates".into()))
    }
}

/// Selector that insists on one agent, eligible or not
#[derive(Debug)]
pub struct AlwaysSelector(AgentId);

#[async_trait]
impl SpeakerSelector for AlwaysSelector {
    async fn select_next(
        &self,
        _conversation: &ConversationId,
        _candidates: &[AgentId],
        _transcript: &[Message],
    ) -> Result<AgentId, ReasoningError> {
        Ok(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::MemorySnapshot;

    fn context() -> ReasoningContext {
        ReasoningContext {
            agent: AgentId::parse("a").unwrap(),
            conversation: ConversationId::generate(),
            turn: 1,
            round: 0,
            transcript: Vec::new(),
            memory: MemorySnapshot::default(),
            tool_results: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_scripted_reasoner_plays_then_terminates() {
        let reasoner = ScriptedReasoner::new(vec![Decision::respond("one"), Decision::respond("two")]);
        let ctx = context();
        assert_eq!(reasoner.infer(&ctx).await.unwrap(), Decision::respond("one"));
        assert_eq!(reasoner.infer(&ctx).await.unwrap(), Decision::respond("two"));
        assert!(matches!(
            reasoner.infer(&ctx).await.unwrap(),
            Decision::Terminate { .. }
        ));
        assert_eq!(reasoner.played(), 3);
    }

    #[tokio::test]
    async fn test_scripted_reasoner_cycles() {
        let reasoner = ScriptedReasoner::new(vec![Decision::respond("x")]).cycled();
        let ctx = context();
        for _ in 0..3 {
            assert_eq!(reasoner.infer(&ctx).await.unwrap(), Decision::respond("x"));
        }
    }

    #[tokio::test]
    async fn test_static_selector_skips_ineligible() {
        let ids: Vec<AgentId> = ["a", "b", "c"].iter().map(|i| AgentId::parse(i).unwrap()).collect();
        let selector = StaticSelector::new(vec![ids[2].clone(), ids[1].clone()]);
        let conv = ConversationId::generate();

        let only_ab = &ids[..2];
        assert_eq!(selector.select_next(&conv, only_ab, &[]).await.unwrap(), ids[1]);
        assert_eq!(selector.select_next(&conv, &ids, &[]).await.unwrap(), ids[0]);
    }

    #[tokio::test]
    async fn test_failing_reasoner() {
        let err = FailingReasoner::default().infer(&context()).await.unwrap_err();
        assert!(matches!(err, ReasoningError::Backend(_)));
    }
}
