//! Events delivered to the Controller's loop by the link tasks.

use crate::protocol::{ControlMessage, Role};

/// One event on the Controller's channel. The loop is the only consumer;
/// link read/write tasks are the producers.
#[derive(Debug)]
pub enum ControlEvent {
    /// A complete message arrived from a peer.
    PeerMessage {
        /// Originating backend.
        role: Role,
        /// Decoded wire message.
        msg: ControlMessage,
    },
    /// A peer connection ended.
    PeerClosed {
        /// Backend whose connection ended.
        role: Role,
        /// True for an orderly close or backend restart, false for frame
        /// desync and other unexpected I/O errors.
        expected: bool,
    },
}
