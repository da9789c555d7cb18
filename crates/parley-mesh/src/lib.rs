//! # Parley Mesh
//!
//! Ordered, addressed message delivery between agent runtimes and
//! conversation orchestrators.
//!
//! ## Features
//!
//! - **Total order per conversation**: every message is appended to the
//!   conversation's log before it is delivered, and conversation streams
//!   read from that log, so all subscribers see sequence order
//! - **Bounded inboxes**: a full inbox delays only its own agent, up to the
//!   dispatch timeout, and is then reported back to the publisher
//! - **Reliability**: failed deliveries land in a dead letter queue and can
//!   be redelivered; consumers dedup with [`DedupWindow`]
//! - **Observability**: backpressure signals and bus metrics
//!
//! ## Example
//!
//! ```rust
//! use futures::StreamExt;
//! use parley_core::{AgentId, ConversationId, CorrelationId, MessageDraft, MessageKind};
//! use parley_mesh::{BusConfig, LocalBus, MessageBus};
//!
//! # tokio_test::block_on(async {
//! let bus = LocalBus::new(BusConfig::default()).unwrap();
//! let alice = AgentId::parse("alice").unwrap();
//! let bob = AgentId::parse("bob").unwrap();
//! let mut inbox = bus.subscribe_agent(&bob).await.unwrap();
//!
//! let conversation = ConversationId::generate();
//! let _submissions = bus
//!     .open_conversation(&conversation, vec![alice.clone(), bob.clone()])
//!     .await
//!     .unwrap();
//!
//! let message = MessageDraft::from_agent(alice, MessageKind::Request, CorrelationId::generate(), "hi")
//!     .sequence(conversation.clone(), 1);
//! bus.publish(message).await.unwrap();
//!
//! assert_eq!(inbox.next().await.unwrap().sequence, 1);
//! # });
//! ```

pub mod backpressure;
pub mod bus;
pub mod dedup;
pub mod dlq;
pub mod error;
pub mod log;
pub mod metrics;
pub mod types;

pub use backpressure::{BackpressureConfig, BackpressureMonitor, BackpressureSignal, BackpressureStats};
pub use bus::{AgentInbox, BusConfig, LocalBus, MessageBus, SubmissionInbox};
pub use dedup::DedupWindow;
pub use dlq::{DeadLetterQueue, DlqConfig, DlqEntry, DlqStats};
pub use error::{MeshError, MeshResult};
pub use log::{LogProgress, MessageStream};
pub use metrics::{BusMetrics, BusMetricsCollector, LatencyStats};
pub use types::{DeliveryFailure, DeliveryFailureReason, PublishReport, Submission};
