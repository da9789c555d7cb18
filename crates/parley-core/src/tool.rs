//! Tool calls and the tool capability trait.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ToolCallError, ToolError};
use crate::identifiers::{AgentId, ConversationId, IdempotencyKey, ToolCallId, ToolName};

/// Outcome of executing a tool
pub type ToolOutcome = Result<Value, ToolError>;

/// An external capability agents can invoke through the gateway.
///
/// # Example
///
/// ```rust
/// use async_trait::async_trait;
/// use parley_core::{Tool, ToolError};
/// use serde_json::{json, Value};
///
/// struct Adder;
///
/// #[async_trait]
/// impl Tool for Adder {
///     fn name(&self) -> &str {
///         "add"
///     }
///
///     async fn execute(&self, arguments: &Value) -> Result<Value, ToolError> {
///         let a = arguments["a"].as_i64().ok_or_else(|| ToolError::invalid_arguments("a"))?;
///         let b = arguments["b"].as_i64().ok_or_else(|| ToolError::invalid_arguments("b"))?;
///         Ok(json!(a + b))
///     }
/// }
/// ```
#[async_trait]
pub trait Tool: Send + Sync {
    /// Name the tool is registered under
    fn name(&self) -> &str;

    /// Run the tool once
    async fn execute(&self, arguments: &Value) -> Result<Value, ToolError>;
}

/// Result slot of a tool call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "value")]
pub enum ToolCallStatus {
    Pending,
    Success(Value),
    Failure(ToolError),
}

/// A request from one agent to run one tool.
///
/// The result slot starts `Pending` and is filled exactly once by
/// [`ToolCall::resolve`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: ToolCallId,
    pub requester: AgentId,
    pub tool: ToolName,
    pub arguments: Value,
    pub idempotency_key: IdempotencyKey,
    /// Conversation the call was issued in; its executions are cancelled
    /// when that conversation is archived
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation: Option<ConversationId>,
    pub issued_at: DateTime<Utc>,
    status: ToolCallStatus,
}

impl ToolCall {
    pub fn new(
        requester: AgentId,
        tool: ToolName,
        arguments: Value,
        idempotency_key: IdempotencyKey,
    ) -> Self {
        Self {
            id: ToolCallId::generate(),
            requester,
            tool,
            arguments,
            idempotency_key,
            conversation: None,
            issued_at: Utc::now(),
            status: ToolCallStatus::Pending,
        }
    }

    /// Tie the call to the conversation it was issued in
    pub fn in_conversation(mut self, conversation: ConversationId) -> Self {
        self.conversation = Some(conversation);
        self
    }

    pub fn status(&self) -> &ToolCallStatus {
        &self.status
    }

    pub fn is_resolved(&self) -> bool {
        !matches!(self.status, ToolCallStatus::Pending)
    }

    /// Fill the result slot. A call that is already resolved is left untouched.
    pub fn resolve(&mut self, outcome: ToolOutcome) -> Result<(), ToolCallError> {
        if self.is_resolved() {
            return Err(ToolCallError::AlreadyResolved(self.id.clone()));
        }
        self.status = match outcome {
            Ok(value) => ToolCallStatus::Success(value),
            Err(error) => ToolCallStatus::Failure(error),
        };
        Ok(())
    }

    /// Resolve and return the call, for builder-style use
    pub fn resolved(mut self, outcome: ToolOutcome) -> Result<Self, ToolCallError> {
        self.resolve(outcome)?;
        Ok(self)
    }

    /// The outcome, once resolved
    pub fn outcome(&self) -> Option<Result<&Value, &ToolError>> {
        match &self.status {
            ToolCallStatus::Pending => None,
            ToolCallStatus::Success(value) => Some(Ok(value)),
            ToolCallStatus::Failure(error) => Some(Err(error)),
        }
    }

    /// Same call, fresh id and empty result slot, for a retry with the same key
    pub fn reissue(&self) -> Self {
        Self {
            id: ToolCallId::generate(),
            requester: self.requester.clone(),
            tool: self.tool.clone(),
            arguments: self.arguments.clone(),
            idempotency_key: self.idempotency_key.clone(),
            conversation: self.conversation.clone(),
            issued_at: Utc::now(),
            status: ToolCallStatus::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn call() -> ToolCall {
        ToolCall::new(
            AgentId::parse("b").unwrap(),
            ToolName::parse("search").unwrap(),
            json!({"x": 1}),
            IdempotencyKey::parse("k1").unwrap(),
        )
    }

    #[test]
    fn resolves_exactly_once() {
        let mut call = call();
        assert!(!call.is_resolved());
        assert!(call.outcome().is_none());

        call.resolve(Ok(json!("first"))).unwrap();
        let err = call.resolve(Ok(json!("second"))).unwrap_err();
        assert!(matches!(err, ToolCallError::AlreadyResolved(_)));
        assert_eq!(call.outcome(), Some(Ok(&json!("first"))));
    }

    #[test]
    fn failure_is_kept() {
        let call = call().resolved(Err(ToolError::permanent("bad"))).unwrap();
        assert!(matches!(
            call.status(),
            ToolCallStatus::Failure(ToolError::Permanent { .. })
        ));
    }

    #[test]
    fn reissue_keeps_key_and_resets_slot() {
        let first = call().resolved(Err(ToolError::Timeout { waited_ms: 5 })).unwrap();
        let retry = first.reissue();
        assert_ne!(retry.id, first.id);
        assert_eq!(retry.conversation, first.conversation);
        assert_eq!(retry.idempotency_key, first.idempotency_key);
        assert_eq!(retry.arguments, first.arguments);
        assert!(!retry.is_resolved());
    }
}
