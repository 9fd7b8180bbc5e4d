//! Request/response bridge between the web front end and the core loop.
//!
//! The HTTP server runs on its own threads; the Controller runs on the
//! single-threaded core runtime. The bridge hands serialized requests from
//! the former to the latter and waits (bounded) for the reply:
//!
//! ```text
//! HTTP thread                       core loop
//!     │  transact(bytes)               │
//!     ├── request_tx ────────────────▶ next_request()
//!     │                                │  ...route, talk to peers...
//!     ◀─────────────── response_tx ────┤  send_response(bytes)
//!     │  (recv_timeout)                │
//! ```
//!
//! Exactly one request is in flight at a time: [`FrontEndHandle::transact`]
//! holds a mutex for the full exchange. Every exchange carries a sequence
//! id: the core tags each reply with the id of the request it answers, and
//! `transact` discards any reply whose id is not its own. A reply to a
//! timed-out predecessor therefore cannot pair with a later request, no
//! matter when the core produces it. The core side refuses to send at all
//! when no request is waiting, so unsolicited traffic never enters the
//! response channel.

use std::error::Error;
use std::fmt;
use std::sync::{mpsc as std_mpsc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc as tokio_mpsc;

/// Error returned by [`FrontEndHandle::transact`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeError {
    /// The core did not answer within the configured window.
    Timeout,
    /// The core loop has shut down.
    Closed,
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BridgeError::Timeout => f.write_str("control core did not respond in time"),
            BridgeError::Closed => f.write_str("control core is not running"),
        }
    }
}

impl Error for BridgeError {}

struct HandleInner {
    request_tx: tokio_mpsc::UnboundedSender<(u64, Vec<u8>)>,
    response_rx: std_mpsc::Receiver<(u64, Vec<u8>)>,
    next_seq: u64,
}

/// Front-end side of the bridge. Shareable across HTTP worker threads.
pub struct FrontEndHandle {
    inner: Mutex<HandleInner>,
    timeout: Duration,
}

impl fmt::Debug for FrontEndHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrontEndHandle")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl FrontEndHandle {
    /// Send one request to the core and block for its reply.
    ///
    /// # Errors
    ///
    /// [`BridgeError::Timeout`] if no reply arrives within the window,
    /// [`BridgeError::Closed`] if the core loop has exited.
    pub fn transact(&self, request: &[u8]) -> Result<Vec<u8>, BridgeError> {
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            // A poisoned lock only means another HTTP thread panicked
            // mid-transaction; the channels themselves are still sound.
            Err(poisoned) => poisoned.into_inner(),
        };

        let seq = inner.next_seq;
        inner.next_seq = inner.next_seq.wrapping_add(1);

        // Clear out replies already queued for timed-out predecessors.
        while let Ok((id, stale)) = inner.response_rx.try_recv() {
            log::debug!("[Bridge] discarding stale reply #{id} ({} bytes)", stale.len());
        }

        inner
            .request_tx
            .send((seq, request.to_vec()))
            .map_err(|_| BridgeError::Closed)?;

        // A late reply can still land after the drain above; matching on
        // the sequence id keeps it from pairing with this exchange.
        let deadline = Instant::now() + self.timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match inner.response_rx.recv_timeout(remaining) {
                Ok((id, reply)) if id == seq => return Ok(reply),
                Ok((id, stale)) => {
                    log::debug!("[Bridge] discarding late reply #{id} ({} bytes)", stale.len());
                }
                Err(std_mpsc::RecvTimeoutError::Timeout) => return Err(BridgeError::Timeout),
                Err(std_mpsc::RecvTimeoutError::Disconnected) => return Err(BridgeError::Closed),
            }
        }
    }
}

/// Core side of the bridge. Owned by the Controller.
#[derive(Debug)]
pub struct CoreEndpoint {
    pub(crate) request_rx: tokio_mpsc::UnboundedReceiver<(u64, Vec<u8>)>,
    pub(crate) response_tx: std_mpsc::Sender<(u64, Vec<u8>)>,
    /// Id of the received-but-unanswered request, if any.
    pub(crate) pending: Option<u64>,
}

impl CoreEndpoint {
    /// Wait for the next front-end request. `None` once the front end is
    /// gone.
    pub async fn next_request(&mut self) -> Option<Vec<u8>> {
        let (id, bytes) = self.request_rx.recv().await?;
        // An unanswered predecessor was abandoned by its caller; its id
        // dies here, so a reply produced for it from now on is unsendable.
        self.pending = Some(id);
        Some(bytes)
    }

    /// Deliver the reply to the request most recently yielded by
    /// [`CoreEndpoint::next_request`]. At most one reply per request; with
    /// no request waiting the reply is dropped and `false` returned.
    pub fn send_response(&mut self, reply: Vec<u8>) -> bool {
        let Some(id) = self.pending.take() else {
            log::debug!("[Bridge] no request waiting, reply dropped ({} bytes)", reply.len());
            return false;
        };
        self.response_tx.send((id, reply)).is_ok()
    }
}

/// Create a connected bridge pair.
pub fn channel(timeout: Duration) -> (FrontEndHandle, CoreEndpoint) {
    let (request_tx, request_rx) = tokio_mpsc::unbounded_channel();
    let (response_tx, response_rx) = std_mpsc::channel();
    (
        FrontEndHandle {
            inner: Mutex::new(HandleInner {
                request_tx,
                response_rx,
                next_seq: 0,
            }),
            timeout,
        },
        CoreEndpoint {
            request_rx,
            response_tx,
            pending: None,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn core_runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap()
    }

    #[test]
    fn test_round_trip() {
        let (front, mut core) = channel(Duration::from_secs(2));

        let echo = std::thread::spawn(move || {
            core_runtime().block_on(async {
                let req = core.next_request().await.unwrap();
                assert_eq!(req, b"ping");
                assert!(core.send_response(b"pong".to_vec()));
            });
        });

        let reply = front.transact(b"ping").unwrap();
        assert_eq!(reply, b"pong");
        echo.join().unwrap();
    }

    #[test]
    fn test_timeout_when_core_silent() {
        let (front, _core) = channel(Duration::from_millis(50));
        let start = Instant::now();
        assert_eq!(front.transact(b"ping"), Err(BridgeError::Timeout));
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_closed_when_core_dropped() {
        let (front, core) = channel(Duration::from_secs(1));
        drop(core);
        assert_eq!(front.transact(b"ping"), Err(BridgeError::Closed));
    }

    #[test]
    fn test_late_reply_to_timed_out_request_not_mispaired() {
        let (front, mut core) = channel(Duration::from_millis(200));

        // The core is not running yet, so the first exchange times out
        // with its request still queued.
        assert_eq!(front.transact(b"first"), Err(BridgeError::Timeout));

        let echo = std::thread::spawn(move || {
            core_runtime().block_on(async {
                // Answer the abandoned request late, then the live one.
                let req = core.next_request().await.unwrap();
                assert_eq!(req, b"first");
                assert!(core.send_response(b"late-reply-to-first".to_vec()));
                let req = core.next_request().await.unwrap();
                assert_eq!(req, b"second");
                assert!(core.send_response(b"fresh".to_vec()));
            });
        });

        // The late reply must never surface as the second answer, whether
        // it lands before or after the second exchange's drain runs.
        let reply = front.transact(b"second").unwrap();
        assert_eq!(reply, b"fresh");
        echo.join().unwrap();
    }

    #[test]
    fn test_reply_without_pending_request_is_dropped() {
        let (_front, mut core) = channel(Duration::from_millis(50));
        assert!(!core.send_response(b"noise".to_vec()));
    }

    #[test]
    fn test_single_response_per_request() {
        let (front, mut core) = channel(Duration::from_secs(2));

        let echo = std::thread::spawn(move || {
            core_runtime().block_on(async {
                let _ = core.next_request().await.unwrap();
                assert!(core.send_response(b"answer".to_vec()));
                // The request is answered; a second send has no target.
                assert!(!core.send_response(b"extra".to_vec()));
            });
        });

        assert_eq!(front.transact(b"ping").unwrap(), b"answer");
        echo.join().unwrap();
    }
}
