//! HTTP reverse tunneling over a single outbound connection.
//!
//! An [`Agent`] on a private network dials out to a publicly reachable
//! [`Broker`] and keeps that one TCP connection open. Clients speak ordinary
//! HTTP/1.1 to the broker; the broker resolves the `Host` header against its
//! route table, picks the agent the route names, and relays the whole
//! transaction over the agent's connection to a TCP origin next to the agent.
//!
//! Every transaction is carried by a [`tunnel::Tunnel`]: a pair of byte pipes
//! multiplexed over the control connection with the framing in [`proto`].

/// Agent side: the outbound connection and local origin sessions.
pub mod agent;
/// Broker side: agent registry, event loop, and the HTTP listener.
pub mod broker;
/// One-chunk byte pipes bridging socket tasks and the event loops.
pub mod pipe;
/// The framed message protocol spoken on the control connection.
pub mod proto;
/// Host routing table and its JSON loader.
pub mod route;
/// Per-transaction tunnels.
pub mod tunnel;

mod parse;
mod util;

pub use agent::Agent;
pub use broker::{Broker, BrokerConfig};
pub use route::{RouteRecord, RouteTable};

/// How much of an HTTP header section to buffer before giving up.
pub(crate) const HEADER_SECTION_MAX_LENGTH: usize = 8192;
