//! Per-peer connection state machine.
//!
//! One [`PeerLink`] exists for each backend role. It owns the local socket
//! connection to that backend's control server and keeps it alive through a
//! reconnect loop driven by the Controller's periodic tick:
//!
//! ```text
//! Undefined ──connect ok──▶ Connected ──I/O error──▶ Faulted
//!     │                         ▲                       │
//!     └──connect failed──▶ Connecting ◀───teardown──────┘
//!                        (retry next tick)
//! ```
//!
//! A connected link runs two tokio tasks on the core thread: a read task
//! that decodes frames and forwards them to the Controller's event channel,
//! and a write task that drains queued outgoing frames. Both report failure
//! as a [`ControlEvent::PeerClosed`]; the Controller marks the link faulted
//! and the next tick tears the connection down and schedules the retry.

use std::io;
use std::os::fd::FromRawFd;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

use crate::constants::LINK_LIVENESS_THRESHOLD;
use crate::control::events::ControlEvent;
use crate::protocol::{ControlMessage, Role};

use super::framing::{encode_frame, FrameDecoder};

/// Read buffer size for the link read task.
const READ_BUF_SIZE: usize = 64 * 1024;

/// Connection state of a peer link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Never attempted to connect.
    Undefined,
    /// Not connected; a connect attempt is due on the next tick.
    Connecting,
    /// Live connection to the backend.
    Connected,
    /// Connection broke; teardown is due on the next tick.
    Faulted,
}

/// Live connection resources. Recreated on every reconnect.
#[derive(Debug)]
struct LinkConn {
    /// Queue of encoded frames for the write task.
    frame_tx: UnboundedSender<Vec<u8>>,
    read_handle: JoinHandle<()>,
    write_handle: JoinHandle<()>,
}

/// Persistent, self-healing control link to one backend.
#[derive(Debug)]
pub struct PeerLink {
    role: Role,
    state: LinkState,
    conn: Option<LinkConn>,
    last_check: Option<Instant>,
    last_send: Option<Instant>,
    /// Abstract socket name base; the peer address is `base + suffix`.
    socket_base: String,
    /// Identity string announced in the signature handshake.
    identity: String,
    /// Minimum interval between state machine checks.
    check_interval: Duration,
    /// Event channel into the Controller's loop; cloned into spawned tasks.
    event_tx: UnboundedSender<ControlEvent>,
}

impl PeerLink {
    /// Create a link in the `Undefined` state. No I/O happens until the
    /// first tick.
    pub fn new(
        role: Role,
        socket_base: &str,
        identity: &str,
        check_interval: Duration,
        event_tx: UnboundedSender<ControlEvent>,
    ) -> Self {
        Self {
            role,
            state: LinkState::Undefined,
            conn: None,
            last_check: None,
            last_send: None,
            socket_base: socket_base.to_string(),
            identity: identity.to_string(),
            check_interval,
            event_tx,
        }
    }

    /// Backend role this link represents.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Current state of the connection state machine.
    pub fn state(&self) -> LinkState {
        self.state
    }

    /// True iff the link is in the `Connected` state.
    pub fn is_connected(&self) -> bool {
        self.state == LinkState::Connected
    }

    /// Drive the state machine. Called by the Controller on every scheduler
    /// tick; self-throttles to the configured check interval.
    pub fn tick(&mut self, now: Instant) {
        if let Some(last) = self.last_check {
            if now.duration_since(last) < self.check_interval {
                return;
            }
        }
        self.last_check = Some(now);

        match self.state {
            LinkState::Connected => {
                let probe_due = self
                    .last_send
                    .is_none_or(|t| now.duration_since(t) > LINK_LIVENESS_THRESHOLD);
                if probe_due {
                    // Keep-alive probe reserved for a future protocol
                    // revision; the servers do not answer pings yet.
                    log::trace!("[Link] {} idle, liveness probe due", self.role);
                }
            }
            LinkState::Undefined | LinkState::Connecting => {
                self.state = LinkState::Connecting;
                match self.connect() {
                    Ok(()) => {
                        log::info!("[Link] connected to the {} control server", self.role);
                        self.state = LinkState::Connected;
                        self.send_signature();
                    }
                    Err(e) => {
                        log::debug!("[Link] {} not reachable: {e:#}", self.role);
                    }
                }
            }
            LinkState::Faulted => {
                self.teardown();
                self.state = LinkState::Connecting;
            }
        }
    }

    /// Mark the link faulted after an I/O failure reported by a task.
    ///
    /// Teardown itself is deferred to the next tick; the check throttle is
    /// reset so that tick runs promptly.
    pub fn mark_faulted(&mut self) {
        if self.state == LinkState::Connected {
            self.state = LinkState::Faulted;
            self.last_check = None;
        }
    }

    /// Queue a message for the peer. Only valid while `Connected`; returns
    /// false (and faults the link) if the write side is gone.
    pub fn send(&mut self, msg: &ControlMessage) -> bool {
        if self.state != LinkState::Connected {
            return false;
        }
        let Some(conn) = &self.conn else {
            return false;
        };

        let payload = serde_json::to_vec(msg).expect("JSON serialization cannot fail");
        if conn.frame_tx.send(encode_frame(&payload)).is_ok() {
            log::info!("[Link] ->> [{}] {}", self.role, msg.cmd);
            self.last_send = Some(Instant::now());
            true
        } else {
            log::warn!("[Link] can't send {} to {}, link down", msg.cmd, self.role);
            self.state = LinkState::Faulted;
            self.last_check = None;
            false
        }
    }

    /// Tear down the connection at process shutdown.
    pub fn shutdown(&mut self) {
        self.teardown();
        self.state = LinkState::Undefined;
    }

    /// Abstract-namespace socket name for this peer.
    fn socket_name(&self) -> String {
        format!("{}{}", self.socket_base, self.role.socket_suffix())
    }

    /// Attempt a connect and, on success, spawn the read/write tasks.
    fn connect(&mut self) -> Result<()> {
        let name = self.socket_name();
        let stream =
            connect_abstract(name.as_bytes()).with_context(|| format!("connect to @{name}"))?;
        let stream = tokio::net::UnixStream::from_std(stream)?;

        let (reader, writer) = stream.into_split();
        let (frame_tx, frame_rx) = mpsc::unbounded_channel::<Vec<u8>>();

        let read_handle = tokio::spawn(read_loop(self.role, reader, self.event_tx.clone()));
        let write_handle =
            tokio::spawn(write_loop(self.role, writer, frame_rx, self.event_tx.clone()));

        self.conn = Some(LinkConn {
            frame_tx,
            read_handle,
            write_handle,
        });
        Ok(())
    }

    /// Announce this process to the freshly connected backend.
    fn send_signature(&mut self) {
        let params = json!({
            "peer_signature": self.identity,
            "pid": std::process::id(),
        });
        let _ = self.send(&ControlMessage::request("signature", params));
    }

    /// Drop the socket, abort both tasks, discard the partial input buffer
    /// (it lives in the read task and dies with it).
    fn teardown(&mut self) {
        if let Some(conn) = self.conn.take() {
            conn.read_handle.abort();
            conn.write_handle.abort();
        }
        self.last_send = None;
    }
}

/// Connect to an abstract-namespace address with the socket non-blocking
/// from creation, mirroring `socket(AF_UNIX, SOCK_STREAM | SOCK_NONBLOCK)`.
/// A backend whose accept backlog is full surfaces as EAGAIN here and is
/// retried on a later tick instead of stalling the core thread the way a
/// blocking connect would. Local connects otherwise complete immediately.
fn connect_abstract(name: &[u8]) -> io::Result<StdUnixStream> {
    let mut addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
    // Leading NUL in sun_path marks the abstract namespace.
    if name.len() + 1 > addr.sun_path.len() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "socket name too long",
        ));
    }
    for (dst, src) in addr.sun_path[1..].iter_mut().zip(name) {
        *dst = *src as libc::c_char;
    }
    let addr_len = (std::mem::size_of::<libc::sa_family_t>() + 1 + name.len()) as libc::socklen_t;

    let fd = unsafe {
        libc::socket(
            libc::AF_UNIX,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // Wrapped before the connect so the fd is closed on every error path.
    let stream = unsafe { StdUnixStream::from_raw_fd(fd) };

    let rc = unsafe { libc::connect(fd, std::ptr::addr_of!(addr).cast(), addr_len) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(stream)
}

/// Classify receive-side errors: a backend restart shows up as one of these
/// and is expected; anything else is an unexpected I/O error. Both fault
/// the link.
fn is_expected_close(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotFound
            | io::ErrorKind::UnexpectedEof
    )
}

/// Read task: decode frames from the peer socket and forward messages to
/// the Controller. Malformed JSON payloads are dropped without touching the
/// link state; EOF, I/O errors and frame desync end the task with a
/// `PeerClosed` event.
async fn read_loop(role: Role, mut reader: OwnedReadHalf, event_tx: UnboundedSender<ControlEvent>) {
    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; READ_BUF_SIZE];

    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                log::warn!("[Link] {role} control server closed");
                let _ = event_tx.send(ControlEvent::PeerClosed { role, expected: true });
                break;
            }
            Ok(n) => match decoder.feed(&buf[..n]) {
                Ok(payloads) => {
                    for payload in payloads {
                        match serde_json::from_slice::<ControlMessage>(&payload) {
                            Ok(msg) => {
                                if event_tx.send(ControlEvent::PeerMessage { role, msg }).is_err() {
                                    return; // Controller gone
                                }
                            }
                            Err(e) => {
                                log::warn!("[Link] {role}: bad control response - {e}");
                            }
                        }
                    }
                }
                Err(e) => {
                    log::error!("[Link] {role}: frame desync - {e}");
                    let _ = event_tx.send(ControlEvent::PeerClosed { role, expected: false });
                    break;
                }
            },
            Err(e) => {
                let expected = is_expected_close(&e);
                if expected {
                    log::warn!("[Link] {role} control server closed ({e})");
                } else {
                    log::error!("[Link] {role}: unexpected receive error - {e}");
                }
                let _ = event_tx.send(ControlEvent::PeerClosed { role, expected });
                break;
            }
        }
    }
}

/// Write task: drain queued frames onto the socket. A broken pipe here is
/// the send-failure path of the state machine.
async fn write_loop(
    role: Role,
    mut writer: OwnedWriteHalf,
    mut frame_rx: UnboundedReceiver<Vec<u8>>,
    event_tx: UnboundedSender<ControlEvent>,
) {
    while let Some(data) = frame_rx.recv().await {
        if let Err(e) = writer.write_all(&data).await {
            let expected = e.kind() == io::ErrorKind::BrokenPipe;
            log::warn!("[Link] {role}: send error - {e}");
            let _ = event_tx.send(ControlEvent::PeerClosed { role, expected });
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;
    use std::os::linux::net::SocketAddrExt;
    use std::os::unix::net::{SocketAddr, UnixListener as StdUnixListener};
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::net::UnixListener;

    fn unique_base(tag: &str) -> String {
        static SEQ: AtomicU32 = AtomicU32::new(0);
        format!(
            "mediahub-test-{}-{}-{}-",
            std::process::id(),
            tag,
            SEQ.fetch_add(1, Ordering::Relaxed)
        )
    }

    fn bind_abstract(name: &str) -> UnixListener {
        let addr = SocketAddr::from_abstract_name(name.as_bytes()).unwrap();
        let listener = StdUnixListener::bind_addr(&addr).unwrap();
        listener.set_nonblocking(true).unwrap();
        UnixListener::from_std(listener).unwrap()
    }

    fn test_link(base: &str) -> (PeerLink, UnboundedReceiver<ControlEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let link = PeerLink::new(
            Role::Capture,
            base,
            "mediahub-test",
            Duration::from_millis(10),
            event_tx,
        );
        (link, event_rx)
    }

    async fn read_message(stream: &mut tokio::net::UnixStream) -> ControlMessage {
        let mut decoder = FrameDecoder::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf))
                .await
                .expect("timed out waiting for peer message")
                .expect("read failed");
            let payloads = decoder.feed(&buf[..n]).unwrap();
            if let Some(payload) = payloads.into_iter().next() {
                return serde_json::from_slice(&payload).unwrap();
            }
        }
    }

    #[test]
    fn test_connect_refused_fails_fast() {
        let name = format!("{}capture", unique_base("refused"));
        let err = connect_abstract(name.as_bytes()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
    }

    #[tokio::test]
    async fn test_connect_socket_nonblocking_from_creation() {
        let base = unique_base("nonblock");
        let name = format!("{base}capture");
        let _listener = bind_abstract(&name);

        let stream = connect_abstract(name.as_bytes()).unwrap();
        let flags = unsafe { libc::fcntl(stream.as_raw_fd(), libc::F_GETFL) };
        assert!(flags >= 0);
        assert_ne!(flags & libc::O_NONBLOCK, 0);
    }

    #[tokio::test]
    async fn test_unreachable_peer_stays_connecting() {
        let base = unique_base("unreachable");
        let (mut link, _event_rx) = test_link(&base);
        assert_eq!(link.state(), LinkState::Undefined);

        link.tick(Instant::now());
        assert_eq!(link.state(), LinkState::Connecting);

        // Throttled: an immediate second tick must not re-attempt.
        link.tick(Instant::now());
        assert_eq!(link.state(), LinkState::Connecting);
    }

    #[tokio::test]
    async fn test_connect_sends_signature() {
        let base = unique_base("signature");
        let listener = bind_abstract(&format!("{base}capture"));
        let (mut link, _event_rx) = test_link(&base);

        link.tick(Instant::now());
        assert_eq!(link.state(), LinkState::Connected);

        let (mut stream, _) = tokio::time::timeout(Duration::from_secs(2), listener.accept())
            .await
            .unwrap()
            .unwrap();

        let msg = read_message(&mut stream).await;
        assert_eq!(msg.cmd, "signature");
        assert_eq!(msg.dir, crate::protocol::Direction::Request);
        let params = msg.params.unwrap();
        assert_eq!(params["peer_signature"], "mediahub-test");
        assert_eq!(params["pid"], std::process::id());
    }

    #[tokio::test]
    async fn test_peer_close_faults_then_reconnects() {
        let base = unique_base("reconnect");
        let listener = bind_abstract(&format!("{base}capture"));
        let (mut link, mut event_rx) = test_link(&base);

        let mut now = Instant::now();
        link.tick(now);
        assert_eq!(link.state(), LinkState::Connected);
        let (stream, _) = tokio::time::timeout(Duration::from_secs(2), listener.accept())
            .await
            .unwrap()
            .unwrap();

        // Backend goes away: read task reports an expected close.
        drop(stream);
        drop(listener);

        loop {
            let ev = tokio::time::timeout(Duration::from_secs(2), event_rx.recv())
                .await
                .expect("timed out waiting for close event")
                .expect("event channel closed");
            if let ControlEvent::PeerClosed { role, expected } = ev {
                assert_eq!(role, Role::Capture);
                assert!(expected);
                break;
            }
        }

        link.mark_faulted();
        assert_eq!(link.state(), LinkState::Faulted);

        // Next tick tears down, the one after retries against the revived
        // backend.
        now += Duration::from_secs(1);
        link.tick(now);
        assert_eq!(link.state(), LinkState::Connecting);

        let listener = bind_abstract(&format!("{base}capture"));
        now += Duration::from_secs(1);
        link.tick(now);
        assert_eq!(link.state(), LinkState::Connected);
        drop(listener);
    }

    #[tokio::test]
    async fn test_send_refused_unless_connected() {
        let base = unique_base("send-off");
        let (mut link, _event_rx) = test_link(&base);
        link.tick(Instant::now());
        assert!(!link.send(&ControlMessage::request("config", json!({}))));
    }

    #[tokio::test]
    async fn test_send_reaches_peer_and_updates_last_send() {
        let base = unique_base("send");
        let listener = bind_abstract(&format!("{base}capture"));
        let (mut link, _event_rx) = test_link(&base);

        link.tick(Instant::now());
        assert_eq!(link.state(), LinkState::Connected);
        let (mut stream, _) = tokio::time::timeout(Duration::from_secs(2), listener.accept())
            .await
            .unwrap()
            .unwrap();

        // First message on the wire is always the handshake.
        let msg = read_message(&mut stream).await;
        assert_eq!(msg.cmd, "signature");

        assert!(link.send(&ControlMessage::request("config", json!({"x": 1}))));
        assert!(link.last_send.is_some());

        let msg = read_message(&mut stream).await;
        assert_eq!(msg.cmd, "config");
        assert_eq!(msg.params.unwrap(), json!({"x": 1}));
    }
}
