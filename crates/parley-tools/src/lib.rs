//! # Parley Tools
//!
//! Mediates every call from an agent to an external tool.
//!
//! The [`ToolGateway`] guarantees that a tool runs at most once per
//! idempotency key and argument set, bounds how long callers wait, and retries
//! transient failures with exponential backoff. Tools are looked up in a
//! [`ToolRegistry`].

pub mod backoff;
pub mod error;
pub mod gateway;
pub mod registry;

pub use backoff::Backoff;
pub use error::{GatewayError, GatewayResult};
pub use gateway::{GatewayConfig, GatewayStats, GatewayStatsSnapshot, LedgerEntry, ToolGateway};
pub use registry::ToolRegistry;
