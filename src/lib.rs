//! Mediahub - control-plane hub for the media pipeline daemons.
//!
//! The hub is the one process a UI has to talk to: it keeps persistent
//! control links to the capture, processing and streaming backends, folds
//! their flat command protocols into one module-addressed envelope scheme,
//! and serves the result over a small HTTP surface.
//!
//! # Architecture
//!
//! - **Controller** - central event loop, owns the peer links
//! - **PeerLink** - reconnecting client to one backend control socket
//! - **Router** - envelope ⇄ wire-command translation and config tracking
//! - **Bridge** - blocking front-end threads ⇄ async core hand-off
//! - **Web** - demo rouille front end
//!
//! # Modules
//!
//! - [`control`] - the Controller loop and its events
//! - [`link`] - socket framing and the per-peer state machine
//! - [`router`] - protocol translation rules
//! - [`bridge`] - front-end/core request channel
//! - [`config`] - runtime configuration

pub mod bridge;
pub mod config;
pub mod constants;
pub mod control;
pub mod link;
pub mod protocol;
pub mod router;
pub mod web;

// Re-export commonly used types
pub use bridge::{BridgeError, FrontEndHandle};
pub use config::Config;
pub use control::Controller;
pub use link::{LinkState, PeerLink};
pub use protocol::{ControlMessage, Role};
