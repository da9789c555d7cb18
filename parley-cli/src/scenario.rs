//! Scenario files for `parley run`.
//!
//! A scenario declares tools, scripted agents and one conversation:
//!
//! ```toml
//! [conversation]
//! participants = ["alice", "bob"]
//! policy = "round_robin"
//! max_messages = 6
//!
//! [[tools]]
//! name = "lookup"
//! kind = "static"
//! response = { answer = 42 }
//!
//! [[agents]]
//! id = "alice"
//! cycle = true
//! script = [
//!     { call = { tool = "lookup", arguments = { q = "x" } } },
//!     { say = "found it" },
//! ]
//!
//! [[agents]]
//! id = "bob"
//! script = [{ say = "thanks" }, { done = "all set" }]
//! ```

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parley_agent::Session;
use parley_core::{
    AgentDescriptor, AgentId, ConversationId, ConversationSpec, Decision, IdempotencyKey, Tool,
    ToolName, TurnPolicy,
};
use parley_testing::{FlakyTool, MockTool, ScriptedReasoner, StaticSelector};
use serde::Deserialize;
use serde_json::Value;
use tracing::info;

use crate::error::{CliError, CliResult};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Scenario {
    pub conversation: ConversationSection,
    #[serde(default)]
    pub tools: Vec<ToolSection>,
    #[serde(default)]
    pub agents: Vec<AgentSection>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConversationSection {
    pub id: Option<String>,
    pub participants: Vec<String>,
    #[serde(default)]
    pub policy: PolicyName,
    pub coordinator: Option<String>,
    pub max_turns: Option<u64>,
    pub max_messages: Option<u64>,
    pub deadline: Option<String>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyName {
    #[default]
    RoundRobin,
    Priority,
    Dynamic,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToolSection {
    pub name: String,
    #[serde(default)]
    pub kind: ToolKind,
    pub response: Option<Value>,
    /// Transient failures before a flaky tool succeeds
    #[serde(default)]
    pub failures: usize,
    pub delay: Option<String>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    #[default]
    Echo,
    Static,
    Flaky,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentSection {
    pub id: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub priority: i32,
    /// Speakers this agent picks, in order, when it coordinates
    #[serde(default)]
    pub selects: Vec<String>,
    /// Start the script over when it runs out
    #[serde(default)]
    pub cycle: bool,
    #[serde(default)]
    pub script: Vec<Step>,
}

/// One scripted reasoning decision
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Say(String),
    Call {
        tool: String,
        #[serde(default)]
        arguments: Value,
        key: Option<String>,
    },
    Done(String),
}

impl Step {
    fn decision(&self) -> CliResult<Decision> {
        Ok(match self {
            Step::Say(text) => Decision::respond(text.as_str()),
            Step::Call {
                tool,
                arguments,
                key,
            } => Decision::CallTool {
                tool: ToolName::parse(tool)?,
                arguments: arguments.clone(),
                idempotency_key: key.as_deref().map(IdempotencyKey::parse).transpose()?,
            },
            Step::Done(summary) => Decision::terminate(summary.as_str()),
        })
    }
}

impl Scenario {
    pub fn load(path: &Path) -> CliResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| CliError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> CliResult<Self> {
        toml::from_str(contents).map_err(|e| CliError::Scenario(e.to_string()))
    }

    /// Conversation id requested by the scenario, if any
    pub fn conversation_id(&self) -> CliResult<Option<ConversationId>> {
        Ok(self
            .conversation
            .id
            .as_deref()
            .map(ConversationId::parse)
            .transpose()?)
    }

    pub fn spec(&self) -> CliResult<ConversationSpec> {
        let section = &self.conversation;
        let participants = section
            .participants
            .iter()
            .map(AgentId::parse)
            .collect::<Result<Vec<_>, _>>()?;
        let policy = match section.policy {
            PolicyName::RoundRobin => TurnPolicy::RoundRobin,
            PolicyName::Priority => TurnPolicy::Priority,
            PolicyName::Dynamic => {
                let coordinator = section.coordinator.as_deref().ok_or_else(|| {
                    CliError::Scenario("a dynamic policy needs a coordinator".into())
                })?;
                TurnPolicy::Dynamic {
                    coordinator: AgentId::parse(coordinator)?,
                }
            }
        };

        let mut spec = ConversationSpec::new(participants).with_policy(policy);
        if let Some(max) = section.max_turns {
            spec = spec.with_max_turns(max);
        }
        if let Some(max) = section.max_messages {
            spec = spec.with_max_messages(max);
        }
        if let Some(deadline) = parse_duration("conversation.deadline", &section.deadline)? {
            spec = spec.with_deadline(deadline);
        }
        Ok(spec)
    }

    /// Register the scenario's tools and spawn its agents into `session`
    pub async fn install(&self, session: &Session) -> CliResult<()> {
        for section in &self.tools {
            let name = session.register_tool(section.build()?)?;
            info!(tool = %name, kind = ?section.kind, "Registered scenario tool");
        }

        let coordinator = match (&self.conversation.policy, &self.conversation.coordinator) {
            (PolicyName::Dynamic, Some(id)) => Some(id.as_str()),
            _ => None,
        };
        for section in &self.agents {
            let id = AgentId::parse(&section.id)?;
            let mut descriptor = AgentDescriptor::new(id).with_priority(section.priority);
            for tag in &section.capabilities {
                descriptor = descriptor.with_capability(tag.as_str());
            }
            let script = section
                .script
                .iter()
                .map(Step::decision)
                .collect::<CliResult<Vec<_>>>()?;
            let mut reasoner = ScriptedReasoner::new(script);
            if section.cycle {
                reasoner = reasoner.cycled();
            }

            if coordinator == Some(section.id.as_str()) || !section.selects.is_empty() {
                let picks = section
                    .selects
                    .iter()
                    .map(AgentId::parse)
                    .collect::<Result<Vec<_>, _>>()?;
                session
                    .spawn_coordinator(
                        descriptor,
                        Arc::new(reasoner),
                        Arc::new(StaticSelector::new(picks)),
                    )
                    .await?;
            } else {
                session.spawn_agent(descriptor, Arc::new(reasoner)).await?;
            }
        }
        Ok(())
    }
}

impl ToolSection {
    fn build(&self) -> CliResult<Arc<dyn Tool>> {
        let delay = parse_duration("tools.delay", &self.delay)?.unwrap_or(Duration::ZERO);
        let tool: Arc<dyn Tool> = match self.kind {
            ToolKind::Echo => Arc::new(MockTool::new(&self.name).with_delay(delay)),
            ToolKind::Static => {
                let response = self.response.clone().ok_or_else(|| {
                    CliError::Scenario(format!("static tool '{}' needs a response", self.name))
                })?;
                Arc::new(
                    MockTool::new(&self.name)
                        .with_default_response(response)
                        .with_delay(delay),
                )
            }
            ToolKind::Flaky => Arc::new(FlakyTool::new(&self.name, self.failures)),
        };
        Ok(tool)
    }
}

fn parse_duration(field: &str, value: &Option<String>) -> CliResult<Option<Duration>> {
    value
        .as_deref()
        .map(|v| {
            humantime::parse_duration(v)
                .map_err(|e| CliError::Scenario(format!("{field}: invalid duration '{v}': {e}")))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCENARIO: &str = r#"
        [conversation]
        participants = ["lead", "alice"]
        policy = "dynamic"
        coordinator = "lead"
        max_turns = 4
        deadline = "30s"

        [[tools]]
        name = "lookup"
        kind = "static"
        response = { answer = 42 }

        [[agents]]
        id = "lead"
        selects = ["alice", "alice"]
        script = [{ say = "go ahead" }]

        [[agents]]
        id = "alice"
        cycle = true
        script = [
            { call = { tool = "lookup", arguments = { q = "x" }, key = "k1" } },
            { say = "found it" },
            { done = "finished" },
        ]
    "#;

    #[test]
    fn test_parse_scenario() {
        let scenario = Scenario::parse(SCENARIO).unwrap();
        let spec = scenario.spec().unwrap();
        assert_eq!(spec.participants.len(), 2);
        assert_eq!(spec.termination.max_turns, Some(4));
        assert_eq!(spec.termination.deadline, Some(Duration::from_secs(30)));
        assert!(matches!(spec.policy, TurnPolicy::Dynamic { ref coordinator } if coordinator.as_str() == "lead"));

        let steps = &scenario.agents[1].script;
        assert!(matches!(
            steps[0].decision().unwrap(),
            Decision::CallTool { idempotency_key: Some(_), .. }
        ));
        assert_eq!(steps[1].decision().unwrap(), Decision::respond("found it"));
        assert!(scenario.conversation_id().unwrap().is_none());
    }

    #[test]
    fn test_rejects_invalid_scenarios() {
        let missing_coordinator = r#"
            [conversation]
            participants = ["a"]
            policy = "dynamic"
        "#;
        let scenario = Scenario::parse(missing_coordinator).unwrap();
        assert!(matches!(scenario.spec(), Err(CliError::Scenario(_))));

        assert!(matches!(
            Scenario::parse("[conversation]\nparticipants = [\"a\"]\nbogus = 1"),
            Err(CliError::Scenario(_))
        ));

        let bad_id = Scenario::parse("[conversation]\nparticipants = [\"has space\"]").unwrap();
        assert!(matches!(bad_id.spec(), Err(CliError::InvalidId(_))));
    }

    #[tokio::test]
    async fn test_install_and_run() {
        let scenario = Scenario::parse(SCENARIO).unwrap();
        let session = Session::new(Default::default()).unwrap();
        scenario.install(&session).await.unwrap();
        assert!(
            session
                .registry()
                .get(&AgentId::parse("lead").unwrap())
                .unwrap()
                .descriptor
                .is_coordinator()
        );

        let id = session.create_conversation(scenario.spec().unwrap()).await.unwrap();
        let record = session.wait(&id).await.unwrap();
        // alice calls the tool and answers, then is picked again and ends it
        assert!(matches!(
            record.reason,
            Some(parley_core::TerminationReason::Done { ref agent, .. }) if agent.as_str() == "alice"
        ));
        assert_eq!(record.turns, 2);
        assert_eq!(session.gateway().stats().executions, 1);
    }
}
