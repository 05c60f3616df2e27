//! # monrelay - Monitoring Message Relay
//!
//! monrelay shuttles monitoring data between a local durable queue and a
//! publish/subscribe broker, and dispatches broker-delivered frames to
//! pluggable handlers with per-handler fault isolation.
//!
//! ## Core Pieces
//!
//! - **HandlerRegistry**: named handlers with health counters; repeated
//!   failures deactivate a handler instead of taking the relay down
//! - **BrokerSession**: connect, subscribe-all (all-or-nothing), live
//!   receive loop, disconnect, with a keepalive probe for silently dead
//!   connections
//! - **Inbound dispatch**: routes each frame to its handler under a time
//!   budget and dead-letters anything unhandled
//! - **Outbound delivery**: drains the durable queue with bounded retries,
//!   a failure cooldown, and dead-lettering after three strikes
//!
//! The broker wire protocol and the queue's on-disk format stay behind the
//! [`broker::BrokerConnection`] and [`queue::DurableQueue`] traits; the crate
//! ships in-process implementations of both for tests and embedded use.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use monrelay::config::{BrokerTargets, RelayConfig};
//! use monrelay::relay::{run, RelayContext};
//!
//! let mut ctx = RelayContext {
//!     registry,                       // handlers built from configuration
//!     queue: Box::new(queue),         // site durable queue adapter
//!     sink: Box::new(sink),           // durable error sink
//!     connector: Box::new(connector), // site broker client adapter
//!     targets: BrokerTargets::single("stomp://broker:61613"),
//!     config: RelayConfig::default(),
//!     abort,
//! };
//! run(&mut ctx)?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod broker;
pub mod config;
pub mod dispatch;
pub mod envelope;
pub mod error;
pub mod keepalive;
pub mod message;
pub mod outbound;
pub mod queue;
pub mod registry;
pub mod relay;
pub mod session;

// Re-export primary types at crate root for convenience
pub use broker::{BrokerConnection, BrokerConnector, BrokerError, LoopbackBroker};
pub use config::{BrokerTargets, HandlerCatalog, HandlerDecl, RelayConfig};
pub use dispatch::{dispatch, DispatchOutcome, DispatchReport};
pub use envelope::{Component, ErrorEnvelope, ErrorSink, MemorySink};
pub use error::{ConfigError, RelayError, RelayResult, SessionError};
pub use keepalive::{KeepaliveMonitor, Verdict};
pub use message::{Headers, Message};
pub use outbound::{drain_once, DrainStats};
pub use queue::{DurableQueue, FailureMeta, MemoryQueue, QueueEntry};
pub use registry::{
    Handler, HandlerRegistry, HandlerReply, HandlerStatus, ScoringPolicy, Severity,
    SubscribeOptions,
};
pub use relay::{run, RelayContext};
pub use session::BrokerSession;
