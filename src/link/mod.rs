//! Local-socket links to the backend control servers.
//!
//! Each backend exposes a control server on a well-known abstract-namespace
//! Unix socket. This module owns the client side of those sockets: the
//! message [`framing`] codec and the per-peer reconnecting [`peer`] state
//! machine.

pub mod framing;
pub mod peer;

pub use peer::{LinkState, PeerLink};
