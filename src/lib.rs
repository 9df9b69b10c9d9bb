//! # Lab Broker
//!
//! Exclusive, time-boxed access to a small pool of physical hardware labs
//! (microcontroller rigs reachable over a message bus) for remote users.
//!
//! The broker owns the parts of a remote-lab platform that carry real state:
//!
//! - **Exclusivity**: at most one live session per lab, enforced under a
//!   per-lab lane so concurrent requests never both acquire a rig.
//! - **Bid-weighted queues**: higher bids first, FIFO within a bid, dense
//!   1-based positions, and a TTL on every entry.
//! - **Session lifecycle**: hard deadlines, one-shot time warnings, expiry,
//!   and forced termination when a rig's agent goes silent.
//! - **Hardware bridge**: typed JSON envelopes on `labs/{lab}/{channel}`
//!   topics, fire-and-forget, with every event audited.
//! - **Compilation jobs**: dispatch code to the agent, correlate results,
//!   tolerate duplicates, and fail stalled jobs.
//!
//! Rewards, notifications and storage are external collaborators reached
//! through traits.
//!
//! ```rust,ignore
//! use lab_broker::builders::BrokerBuilder;
//! use lab_broker::config::BrokerConfig;
//! use lab_broker::infra::ChannelTransport;
//!
//! let config = BrokerConfig::from_json_str(include_str!("../labs.json"))?;
//! let (transport, agent) = ChannelTransport::bounded(config.transport_capacity);
//! let broker = BrokerBuilder::new(config).transport(transport).build()?;
//!
//! match broker.join_queue("arduino-1", "alice", 0)? {
//!     JoinOutcome::Started(handle) => println!("session {}", handle.session_id),
//!     JoinOutcome::Queued(ticket) => println!("position {}", ticket.position),
//! }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Core reservation, session and hardware orchestration.
pub mod core;
/// Configuration models for labs, timeouts, and policies.
pub mod config;
/// Builders to construct a broker from configuration.
pub mod builders;
/// Infrastructure adapters for storage and agent transport.
pub mod infra;
/// Runtime adapters (tokio spawner, sweeper) and request-facing API.
pub mod runtime;
/// Shared utilities.
pub mod util;
