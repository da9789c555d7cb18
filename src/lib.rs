//! # Parley
//!
//! Multi-agent conversation orchestration. Agents take turns in
//! conversations driven by an orchestrator, exchange messages over a bus,
//! call tools through an idempotent gateway and keep private and shared
//! memory.
//!
//! This crate re-exports the workspace crates under one roof:
//!
//! - [`core`]: identifiers, messages, memory, tools, conversations
//! - [`memory`]: in-memory and file-backed memory and transcript stores
//! - [`tools`]: tool registry and gateway
//! - [`mesh`]: the message bus
//! - [`agent`]: agent runtime, registry, orchestrator and [`Session`]

pub use parley_agent as agent;
pub use parley_core as core;
pub use parley_memory as memory;
pub use parley_mesh as mesh;
pub use parley_tools as tools;

pub use parley_agent::{ParleyConfig, ParleyError, ParleyResult, Session};

/// The types most programs need
pub mod prelude {
    pub use parley_agent::{ParleyConfig, ParleyConfigBuilder, ParleyError, ParleyResult, Session};
    pub use parley_core::{
        AgentDescriptor, AgentId, ConversationId, ConversationSpec, Decision, Message,
        MessageKind, Reasoner, ReasoningContext, ReasoningError, SpeakerSelector, TerminationReason,
        Tool, ToolError, TurnPolicy,
    };
}
