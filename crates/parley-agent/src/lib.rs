//! # Parley Agent
//!
//! Agent runtimes, the agent registry and the conversation orchestrator,
//! tied together by [`Session`].
//!
//! - [`AgentRuntime`] runs one agent's perceive, reason, act, reflect cycle
//!   against its memory view and the tool gateway
//! - [`AgentRegistry`] holds the live agents and their capabilities
//! - the orchestrator runs each conversation as a task: it picks speakers
//!   under a [`TurnPolicy`](parley_core::TurnPolicy), grants turns over the
//!   bus, appends submissions to the transcript and evaluates the
//!   [`TerminationPredicate`]
//! - [`Session`] owns the shared services and starts agents and
//!   conversations

pub mod config;
mod driver;
pub mod error;
pub mod orchestrator;
pub mod policy;
pub mod registry;
pub mod runtime;
pub mod session;
pub mod termination;

pub use config::{ConfigError, ParleyConfig, ParleyConfigBuilder};
pub use error::{ParleyError, ParleyResult};
pub use orchestrator::{ConversationHandle, OrchestratorConfig};
pub use policy::TurnScheduler;
pub use registry::{AgentRegistry, RegisteredAgent, Registration};
pub use runtime::{AgentRuntime, Continuation, RuntimeConfig, StepOutcome, Turn, TurnOutput};
pub use session::Session;
pub use termination::TerminationPredicate;
