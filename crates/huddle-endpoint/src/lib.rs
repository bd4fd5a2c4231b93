//! Endpoint-side session signaling: the client connection to the huddle
//! server plus the per-peer negotiation state machines.
//!
//! The actual media/negotiation engine is external. It sits behind the
//! [`Negotiator`] trait and owns payload contents and candidate buffering;
//! this crate routes its opaque payloads and tracks handshake legality.

pub mod client;
pub mod error;
pub mod link;

pub use client::{JoinedSession, SessionEvent, SignalingClient};
pub use error::EndpointError;
pub use link::{LinkState, Negotiator, PeerLinks, SignalSink};
