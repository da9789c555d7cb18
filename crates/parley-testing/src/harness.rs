//! # Session Test Harness
//!
//! Runs whole conversations in a [`Session`] configured with short timeouts,
//! and exposes the outcome in a form that is easy to assert on.

use std::sync::Arc;
use std::time::Duration;

use parley_agent::{OrchestratorConfig, ParleyConfig, ParleyResult, Session};
use parley_core::{
    AgentDescriptor, AgentId, ConversationRecord, ConversationSpec, Message, MessageKind, Reasoner,
    SpeakerSelector, Tool, Transcript,
};
use parley_tools::GatewayConfig;

/// Parse an agent id, panicking on invalid input
pub fn agent_id(id: &str) -> AgentId {
    AgentId::parse(id).unwrap()
}

/// Builder for [`SessionHarness`]
#[derive(Debug, Clone)]
pub struct SessionHarnessBuilder {
    config: ParleyConfig,
}

impl Default for SessionHarnessBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionHarnessBuilder {
    /// Defaults with timeouts short enough for tests
    pub fn new() -> Self {
        let config = ParleyConfig {
            orchestrator: OrchestratorConfig {
                turn_timeout: Duration::from_millis(500),
                selection_timeout: Duration::from_millis(200),
                max_consecutive_timeouts: 2,
            },
            gateway: GatewayConfig {
                call_timeout: Duration::from_millis(300),
                attempt_timeout: Duration::from_millis(300),
                execution_ceiling: Duration::from_secs(2),
                max_retries: 2,
                backoff_base: Duration::from_millis(5),
                backoff_max: Duration::from_millis(20),
                ..GatewayConfig::default()
            },
            ..ParleyConfig::default()
        };
        Self { config }
    }

    pub fn turn_timeout(mut self, timeout: Duration) -> Self {
        self.config.orchestrator.turn_timeout = timeout;
        self
    }

    pub fn max_consecutive_timeouts(mut self, max: u32) -> Self {
        self.config.orchestrator.max_consecutive_timeouts = max;
        self
    }

    pub fn gateway(mut self, gateway: GatewayConfig) -> Self {
        self.config.gateway = gateway;
        self
    }

    pub fn config(mut self, config: ParleyConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> ParleyResult<SessionHarness> {
        Ok(SessionHarness {
            session: Session::new(self.config)?,
        })
    }
}

/// A session plus helpers for spawning agents and running conversations
#[derive(Debug)]
pub struct SessionHarness {
    session: Session,
}

impl SessionHarness {
    pub fn builder() -> SessionHarnessBuilder {
        SessionHarnessBuilder::new()
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Spawn a plain agent
    pub async fn spawn(&self, id: &str, reasoner: impl Reasoner + 'static) -> AgentId {
        let id = agent_id(id);
        self.session
            .spawn_agent(AgentDescriptor::new(id.clone()), Arc::new(reasoner))
            .await
            .unwrap();
        id
    }

    /// Spawn an agent that can coordinate dynamic conversations
    pub async fn spawn_coordinator(
        &self,
        id: &str,
        reasoner: impl Reasoner + 'static,
        selector: impl SpeakerSelector + 'static,
    ) -> AgentId {
        let id = agent_id(id);
        self.session
            .spawn_coordinator(
                AgentDescriptor::new(id.clone()),
                Arc::new(reasoner),
                Arc::new(selector),
            )
            .await
            .unwrap();
        id
    }

    pub fn register_tool(&self, tool: Arc<dyn Tool>) {
        self.session.register_tool(tool).unwrap();
    }

    /// Create a conversation and wait for it to be archived
    pub async fn run(&self, spec: ConversationSpec) -> ParleyResult<ConversationOutcome> {
        let id = self.session.create_conversation(spec).await?;
        let record = self.session.wait(&id).await?;
        let transcript = self.session.transcript(&id).await?;
        Ok(ConversationOutcome { record, transcript })
    }
}

/// Final record and transcript of a finished conversation
#[derive(Debug, Clone)]
pub struct ConversationOutcome {
    pub record: ConversationRecord,
    pub transcript: Transcript,
}

impl ConversationOutcome {
    pub fn messages(&self) -> &[Message] {
        self.transcript.messages()
    }

    /// Sender of every transcript message
    pub fn senders(&self) -> Vec<String> {
        self.messages().iter().map(|m| m.sender.to_string()).collect()
    }

    /// Senders of agent responses only
    pub fn speakers(&self) -> Vec<String> {
        self.messages()
            .iter()
            .filter(|m| m.kind == MessageKind::Response)
            .map(|m| m.sender.to_string())
            .collect()
    }

    /// Names of the control signals in the transcript, in order
    pub fn signals(&self) -> Vec<&'static str> {
        self.messages()
            .iter()
            .filter_map(|m| m.control().map(|signal| signal.name()))
            .collect()
    }

    pub fn sequences(&self) -> Vec<u64> {
        self.messages().iter().map(|m| m.sequence).collect()
    }
}
