//! `tcp-sim`: a TCP-like reliable byte stream over a simulated lossy,
//! bounded channel.
//!
//! # Architecture
//!
//! ```text
//!  ┌──────────────┐  send_data / receive_data  ┌──────────────┐
//!  │  Endpoint A  │                            │  Endpoint B  │
//!  │  (Tcb + lock)│                            │  (Tcb + lock)│
//!  └──────┬───────┘                            └──────▲───────┘
//!         │ segments                                  │ process_segment
//!  ┌──────▼─────────────────────────┐          ┌──────┴───────┐
//!  │        SimulatedChannel        │─────────▶│ Demultiplexer│
//!  │  (bounded FIFO, random loss)   │ receive  │ (dispatcher) │
//!  └────────────────────────────────┘          └──────────────┘
//! ```
//!
//! Each module has a single responsibility:
//! - [`segment`]     wire unit and its byte codec
//! - [`channel`]     shared lossy, bounded transmission medium
//! - [`demux`]       endpoint registry and the dispatch loop
//! - [`endpoint`]    application API, locking and wait conditions
//! - [`connection`]  per-connection state machine (the TCB)
//! - [`sender`]      send sequence space and retransmission store
//! - [`receiver`]    reorder buffer, delivery queue, advertised window
//! - [`timer`]       cancellable retransmission timer
//! - [`state`]       finite-state-machine states
//! - [`config`]      construction-time parameters
//! - [`error`]       crate error types

pub mod channel;
pub mod config;
pub mod connection;
pub mod demux;
pub mod endpoint;
pub mod error;
pub mod receiver;
pub mod segment;
pub mod sender;
pub mod state;
pub mod timer;

pub use channel::{ChannelStats, SimulatedChannel};
pub use config::{ChannelConfig, EndpointConfig};
pub use connection::EndpointStats;
pub use demux::Demultiplexer;
pub use endpoint::ConnectionEndpoint;
pub use error::{DecodeError, Error, Result};
pub use segment::Segment;
pub use state::ConnectionState;
