//! The control hub loop.
//!
//! The [`Controller`] is the single-threaded heart of the daemon. It owns
//! one [`PeerLink`] per backend role, the config-version table, and the
//! core side of the front-end bridge, and multiplexes all of them in one
//! `select!` loop:
//!
//! ```text
//!                 ┌────────────────────────────┐
//!  HTTP threads ──▶ bridge ──▶                 │──▶ PeerLink[Capture]
//!                 │        Controller loop     │──▶ PeerLink[Process]
//!  link tasks ────▶ events ──▶                 │──▶ PeerLink[VStream]
//!                 └────────────────────────────┘
//! ```
//!
//! Nothing in here blocks: peer I/O lives in the link tasks, the HTTP
//! server on its own threads. The loop only routes, so a wedged backend
//! can never stall the others.

pub mod events;

use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::time::MissedTickBehavior;

use crate::bridge::CoreEndpoint;
use crate::config::Config;
use crate::link::PeerLink;
use crate::protocol::Role;
use crate::router::{
    self, control_status, is_control_query, offline_reply, route_inbound, route_outbound,
    ConfigVersionTable,
};

use events::ControlEvent;

/// Outcome of one `select!` round, resolved before any handler touches the
/// links or the bridge.
enum Step {
    Tick,
    Request(Vec<u8>),
    Event(ControlEvent),
}

/// Central event loop: three peer links, the version table, the bridge.
#[derive(Debug)]
pub struct Controller {
    links: [PeerLink; Role::COUNT],
    config_ids: ConfigVersionTable,
    event_rx: UnboundedReceiver<ControlEvent>,
    bridge: CoreEndpoint,
    tick_interval: Duration,
    /// (role, wire command) of the forwarded request awaiting its peer
    /// reply. Peer traffic that doesn't match is not bridge business.
    pending_reply: Option<(Role, String)>,
}

impl Controller {
    /// Build the controller and its link registry. No connection attempts
    /// happen until [`Controller::run`] starts ticking.
    pub fn new(config: &Config, bridge: CoreEndpoint) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let links = Role::ALL.map(|role| {
            PeerLink::new(
                role,
                &config.socket_base,
                &config.identity,
                config.link_check_interval(),
                event_tx.clone(),
            )
        });
        Self {
            links,
            config_ids: ConfigVersionTable::new(),
            event_rx,
            bridge,
            tick_interval: config.tick_interval(),
            pending_reply: None,
        }
    }

    /// Run until the front end goes away. Consumes the controller; links
    /// are shut down on the way out.
    pub async fn run(mut self) {
        log::info!("[Control] hub loop running");
        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let step = tokio::select! {
                _ = ticker.tick() => Step::Tick,
                req = self.bridge.next_request() => match req {
                    Some(bytes) => Step::Request(bytes),
                    None => break,
                },
                ev = self.event_rx.recv() => match ev {
                    Some(ev) => Step::Event(ev),
                    // Link tasks hold clones of the sender, so this only
                    // happens once every link is torn down.
                    None => break,
                },
            };

            match step {
                Step::Tick => {
                    let now = Instant::now();
                    for link in &mut self.links {
                        link.tick(now);
                    }
                }
                Step::Request(bytes) => self.handle_request(&bytes),
                Step::Event(ev) => self.handle_event(ev),
            }
        }

        log::info!("[Control] hub loop stopping");
        for link in &mut self.links {
            link.shutdown();
        }
    }

    /// Process one front-end request. Synthetic answers (status query,
    /// offline module, malformed input) are replied to immediately; a
    /// forwarded request is answered later when the peer's reply arrives
    /// as a [`ControlEvent::PeerMessage`].
    fn handle_request(&mut self, bytes: &[u8]) {
        // A new request supersedes whatever the previous one was waiting
        // for; the abandoned reply becomes unsolicited traffic.
        self.pending_reply = None;

        let envelope: Value = match serde_json::from_slice(bytes) {
            Ok(v) => v,
            Err(e) => {
                log::warn!("[Control] unparseable front-end request: {e}");
                self.respond_raw(router::MALFORMED_REPLY.as_bytes().to_vec());
                return;
            }
        };

        if is_control_query(&envelope) {
            let connected = core::array::from_fn(|i| self.links[i].is_connected());
            self.respond(&control_status(&connected, &self.config_ids));
            return;
        }

        match route_outbound(&envelope) {
            Ok(out) => {
                let link = &mut self.links[out.role.index()];
                if link.send(&out.msg) {
                    self.pending_reply = Some((out.role, out.msg.cmd));
                    return;
                }
                self.respond(&offline_reply(out.module));
            }
            Err(e) => {
                log::warn!("[Control] rejected front-end request: {e:#}");
                self.respond_raw(router::MALFORMED_REPLY.as_bytes().to_vec());
            }
        }
    }

    /// Process one event from the link tasks.
    fn handle_event(&mut self, ev: ControlEvent) {
        match ev {
            ControlEvent::PeerMessage { role, msg } => {
                log::info!("[Control] <<- [{role}] {}", msg.cmd);
                let is_answer = self
                    .pending_reply
                    .as_ref()
                    .is_some_and(|(r, c)| *r == role && *c == msg.cmd);
                // Routing always runs so config-bearing replies feed the
                // version table even when nobody is waiting.
                let envelope = route_inbound(role, &msg, &mut self.config_ids);
                if is_answer {
                    self.pending_reply = None;
                    if let Some(envelope) = envelope {
                        self.respond(&envelope);
                    }
                } else if envelope.is_some() {
                    log::debug!("[Control] unsolicited {} from {role}, not forwarded", msg.cmd);
                }
            }
            ControlEvent::PeerClosed { role, expected } => {
                if !expected {
                    log::error!("[Control] {role} link failed unexpectedly");
                }
                self.links[role.index()].mark_faulted();
            }
        }
    }

    fn respond(&mut self, envelope: &Value) {
        match serde_json::to_vec(envelope) {
            Ok(bytes) => self.respond_raw(bytes),
            Err(e) => log::error!("[Control] can't serialize reply: {e}"),
        }
    }

    fn respond_raw(&mut self, bytes: Vec<u8>) {
        if !self.bridge.send_response(bytes) {
            log::debug!("[Control] nobody waiting, reply dropped");
        }
    }
}
