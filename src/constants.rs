//! Timing and naming defaults, overridable through [`crate::config`].

use std::time::Duration;

/// Base period of the Controller's scheduler tick. Per-link work throttles
/// itself on top of this, so the tick can stay short without hammering the
/// sockets.
pub const SCHEDULER_TICK_INTERVAL: Duration = Duration::from_millis(100);

/// Minimum interval between state-machine checks on one peer link. Bounds
/// how fast a dead backend is retried.
pub const LINK_CHECK_INTERVAL: Duration = Duration::from_millis(3000);

/// Quiet time on a connected link before a liveness probe would be due.
pub const LINK_LIVENESS_THRESHOLD: Duration = Duration::from_millis(1000);

/// How long a front-end request waits for the core before timing out.
pub const BRIDGE_TIMEOUT: Duration = Duration::from_millis(3000);

/// Abstract-namespace socket name prefix shared by the backend control
/// servers. The per-peer suffix is the lower-cased role name.
pub const SOCKET_NAME_BASE: &str = "com.mediahub.ctrl-server-";

/// Identity announced to each backend in the signature handshake.
pub const CONTROL_IDENTITY: &str = "mediahub-control";

/// Default listen address of the HTTP front end.
pub const HTTP_ADDR: &str = "127.0.0.1:8707";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_check_spans_multiple_scheduler_ticks() {
        // The per-link throttle only works if checks are coarser than the
        // tick driving them.
        assert!(LINK_CHECK_INTERVAL > SCHEDULER_TICK_INTERVAL);
        assert!(LINK_LIVENESS_THRESHOLD < LINK_CHECK_INTERVAL);
    }
}
