//! # Parley Testing
//!
//! Test utilities for Parley sessions:
//!
//! - **Mock Tools**: table-driven, slow and flaky tools with call tracking
//! - **Mock Reasoners**: scripted, echoing, failing and silent reasoners and
//!   fixed speaker selectors
//! - **Session Harness**: sessions with short timeouts that run a
//!   conversation to the end and return its record and transcript
//!
//! ## Usage
//!
//! ```rust
//! use parley_core::ConversationSpec;
//! use parley_testing::{EchoReasoner, SessionHarness};
//!
//! # tokio_test::block_on(async {
//! let harness = SessionHarness::builder().build().unwrap();
//! let a = harness.spawn("a", EchoReasoner).await;
//! let b = harness.spawn("b", EchoReasoner).await;
//!
//! let outcome = harness
//!     .run(ConversationSpec::new(vec![a, b]).with_max_messages(4))
//!     .await
//!     .unwrap();
//! assert_eq!(outcome.senders(), vec!["a", "b", "a", "b"]);
//! # });
//! ```

/// Session harness for end-to-end conversation tests
pub mod harness;
/// Mock tools for predictable testing
pub mod mock_tools;
/// Mock reasoners and speaker selectors
pub mod reasoners;

pub use harness::{ConversationOutcome, SessionHarness, SessionHarnessBuilder, agent_id};
pub use mock_tools::{FlakyTool, MockTool};
pub use reasoners::{
    AlwaysSelector, EchoReasoner, FailingReasoner, ScriptedReasoner, SilentReasoner,
    StaticSelector, ToolUser,
};
