//! # Mock Tools for Testing
//!
//! Tool implementations with predictable outcomes, call tracking and
//! optional latency, for exercising the tool gateway from conversations.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use parley_core::{Tool, ToolError};
use serde_json::{Value, json};

/// A mock tool that answers from a table keyed by its arguments
#[derive(Debug, Clone)]
pub struct MockTool {
    name: String,
    responses: HashMap<String, Result<Value, ToolError>>,
    default_response: Option<Result<Value, ToolError>>,
    delay: Duration,
    call_history: Arc<Mutex<Vec<Value>>>,
    completed: Arc<AtomicUsize>,
}

impl MockTool {
    /// Create a new mock tool with the given name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            responses: HashMap::new(),
            default_response: None,
            delay: Duration::ZERO,
            call_history: Arc::new(Mutex::new(Vec::new())),
            completed: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Answer `arguments` with `response`
    pub fn with_response(mut self, arguments: Value, response: Value) -> Self {
        self.responses.insert(arguments.to_string(), Ok(response));
        self
    }

    /// Fail `arguments` with `error`
    pub fn with_failure(mut self, arguments: Value, error: ToolError) -> Self {
        self.responses.insert(arguments.to_string(), Err(error));
        self
    }

    /// Answer any unmatched arguments with `response`
    pub fn with_default_response(mut self, response: Value) -> Self {
        self.default_response = Some(Ok(response));
        self
    }

    /// Fail any unmatched arguments with `error`
    pub fn with_default_failure(mut self, error: ToolError) -> Self {
        self.default_response = Some(Err(error));
        self
    }

    /// Sleep this long before answering
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Number of executions so far
    pub fn call_count(&self) -> usize {
        self.call_history.lock().unwrap().len()
    }

    /// Arguments of every execution, in order
    pub fn call_history(&self) -> Vec<Value> {
        self.call_history.lock().unwrap().clone()
    }

    /// Executions that ran past their delay and answered
    pub fn completed_count(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn was_called_with(&self, arguments: &Value) -> bool {
        self.call_history.lock().unwrap().contains(arguments)
    }

    pub fn reset(&self) {
        self.call_history.lock().unwrap().clear();
        self.completed.store(0, Ordering::SeqCst);
    }
}

#[async_trait]
impl Tool for MockTool {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, arguments: &Value) -> Result<Value, ToolError> {
        self.call_history.lock().unwrap().push(arguments.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.completed.fetch_add(1, Ordering::SeqCst);
        if let Some(response) = self.responses.get(&arguments.to_string()) {
            response.clone()
        } else if let Some(default) = &self.default_response {
            default.clone()
        } else {
            Ok(json!({ "echo": arguments }))
        }
    }
}

/// A tool that fails transiently a fixed number of times, then succeeds
#[derive(Debug)]
pub struct FlakyTool {
    name: String,
    failures: usize,
    attempts: AtomicUsize,
}

impl FlakyTool {
    pub fn new(name: impl Into<String>, failures: usize) -> Self {
        Self {
            name: name.into(),
            failures,
            attempts: AtomicUsize::new(0),
        }
    }

    /// Executions so far, failed ones included
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Tool for FlakyTool {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, arguments: &Value) -> Result<Value, ToolError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt <= self.failures {
            return Err(ToolError::transient(format!("attempt {} failed", attempt)));
        }
        Ok(json!({ "attempt": attempt, "arguments": arguments }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_tool_table_and_history() {
        let tool = MockTool::new("weather")
            .with_response(json!({"city": "Oslo"}), json!("rain"))
            .with_failure(json!({"city": "Nowhere"}), ToolError::permanent("unknown city"));

        assert_eq!(tool.execute(&json!({"city": "Oslo"})).await, Ok(json!("rain")));
        assert!(tool.execute(&json!({"city": "Nowhere"})).await.is_err());
        assert_eq!(
            tool.execute(&json!({"city": "Rome"})).await,
            Ok(json!({"echo": {"city": "Rome"}}))
        );
        assert_eq!(tool.call_count(), 3);
        assert!(tool.was_called_with(&json!({"city": "Oslo"})));

        tool.reset();
        assert_eq!(tool.call_count(), 0);
    }

    #[tokio::test]
    async fn test_flaky_tool_recovers() {
        let tool = FlakyTool::new("flaky", 2);
        assert!(tool.execute(&json!({})).await.unwrap_err().is_retryable());
        assert!(tool.execute(&json!({})).await.is_err());
        assert_eq!(tool.execute(&json!({})).await.unwrap()["attempt"], 3);
        assert_eq!(tool.attempts(), 3);
    }
}
