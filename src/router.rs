//! Protocol router: external envelope ⇄ flat peer commands.
//!
//! The web front end speaks a hierarchical representation: every message is
//! a single-key object whose key names a functional *module* (`capture`,
//! `mvision`, `player`, `player_dir`, `streaming`, `recording`). The
//! backends speak a flat `{cmd, params}` protocol. This module holds the
//! stateless mapping between the two, plus the config-version table used to
//! detect backend restarts.
//!
//! Modules do not map 1:1 to peers: the Process peer hosts `mvision` and
//! both player modules, and the VStream peer multiplexes `streaming` and
//! `recording` behind command-name prefixes. The inbound direction is a
//! declarative rule table keyed by (role, command matcher) so every rename
//! and wrap lives in one testable place instead of cascading string
//! compares.

use std::collections::HashMap;
use std::fmt;

use anyhow::{bail, Context, Result};
use serde_json::{json, Map, Value};

use crate::protocol::{ControlMessage, Role};

/// Command sent to the Process peer when an `mvision` envelope carries an
/// empty object ("list all controls").
pub const LIST_CONTROLS_CMD: &str = "ctrls";

/// Sentinel stored in the [`ConfigVersionTable`] when a peer's config id
/// went backwards: the backend restarted and a full resync is required.
pub const CONFIG_RESYNC_SENTINEL: i64 = -1;

/// Fixed reply echoed back for requests the router cannot parse at all.
pub const MALFORMED_REPLY: &str = r#"{"error":{"err":400,"err_msg":"malformed request"}}"#;

/// Peer reply commands that carry a `config_id` in their params.
const CONFIG_BEARING_COMMANDS: [&str; 5] = [
    "signature",
    "config",
    "config_streamer",
    "config_recorder",
    "ui_sign",
];

/// Front-end-facing functional module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Module {
    /// Camera capture configuration and control.
    Capture,
    /// Vision/processing controls.
    Mvision,
    /// Clip player (hosted by the Process peer).
    Player,
    /// Clip directory listing (hosted by the Process peer).
    PlayerDir,
    /// Live streaming control (VStream peer, `streaming_` prefix).
    Streaming,
    /// Recording control (VStream peer, `recording_` prefix).
    Recording,
}

impl Module {
    /// Modules reported by the aggregated `control` status, in reply order.
    pub const STATUS: [Module; 4] = [
        Module::Capture,
        Module::Mvision,
        Module::Recording,
        Module::Streaming,
    ];

    /// External envelope key for this module.
    pub fn as_str(self) -> &'static str {
        match self {
            Module::Capture => "capture",
            Module::Mvision => "mvision",
            Module::Player => "player",
            Module::PlayerDir => "player_dir",
            Module::Streaming => "streaming",
            Module::Recording => "recording",
        }
    }

    /// Resolve an envelope key to a module.
    pub fn from_key(key: &str) -> Option<Module> {
        match key {
            "capture" => Some(Module::Capture),
            "mvision" => Some(Module::Mvision),
            "player" => Some(Module::Player),
            "player_dir" => Some(Module::PlayerDir),
            "streaming" => Some(Module::Streaming),
            "recording" => Some(Module::Recording),
            _ => None,
        }
    }

    /// Peer that serves this module.
    pub fn owner(self) -> Role {
        match self {
            Module::Capture => Role::Capture,
            Module::Mvision | Module::Player | Module::PlayerDir => Role::Process,
            Module::Streaming | Module::Recording => Role::VStream,
        }
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A resolved outbound request: which peer, which module asked, and the
/// flat message to put on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundRequest {
    /// Target peer.
    pub role: Role,
    /// Module named by the external envelope (used for synthetic replies).
    pub module: Module,
    /// Peer-native message.
    pub msg: ControlMessage,
}

/// Resolve an external envelope into a peer-bound request.
///
/// # Errors
///
/// Returns an error for any malformed envelope: not an object, not exactly
/// one module key, unknown module, non-object command body, or a missing
/// command where one is required. Nothing is sent in those cases.
pub fn route_outbound(envelope: &Value) -> Result<OutboundRequest> {
    let obj = envelope.as_object().context("envelope is not an object")?;
    if obj.len() != 1 {
        bail!("envelope must contain exactly one module key, got {}", obj.len());
    }
    let (key, nested) = obj.iter().next().expect("len checked above");
    let module = Module::from_key(key).with_context(|| format!("unknown module {key:?}"))?;

    let (cmd, params) = match module {
        Module::Capture => sole_command(module, nested)?,
        Module::Mvision => {
            let body = nested
                .as_object()
                .with_context(|| format!("{module} body is not an object"))?;
            if body.is_empty() {
                (LIST_CONTROLS_CMD.to_string(), json!({}))
            } else {
                sole_command(module, nested)?
            }
        }
        // The module name itself is the command; the whole body is params.
        Module::Player | Module::PlayerDir => {
            if !nested.is_object() {
                bail!("{module} body is not an object");
            }
            (module.as_str().to_string(), nested.clone())
        }
        Module::Streaming => {
            let (cmd, params) = sole_command(module, nested)?;
            (format!("streaming_{cmd}"), params)
        }
        Module::Recording => {
            let (cmd, params) = sole_command(module, nested)?;
            (format!("recording_{cmd}"), params)
        }
    };

    Ok(OutboundRequest {
        role: module.owner(),
        module,
        msg: ControlMessage::request(cmd, params),
    })
}

/// Extract the single `{command: params}` entry of a module body.
fn sole_command(module: Module, nested: &Value) -> Result<(String, Value)> {
    let body = nested
        .as_object()
        .with_context(|| format!("{module} body is not an object"))?;
    if body.len() != 1 {
        bail!("{module} body must contain exactly one command, got {}", body.len());
    }
    let (cmd, params) = body.iter().next().expect("len checked above");
    Ok((cmd.clone(), params.clone()))
}

/// Synthetic reply produced without any I/O when a module's peer is not
/// connected.
pub fn offline_reply(module: Module) -> Value {
    json!({ module.as_str(): { "state": "off" } })
}

/// How a rule matches a peer command name.
#[derive(Debug, Clone, Copy)]
enum CmdMatch {
    Any,
    Exact(&'static str),
    Prefix(&'static str),
}

impl CmdMatch {
    fn matches(self, cmd: &str) -> bool {
        match self {
            CmdMatch::Any => true,
            CmdMatch::Exact(name) => cmd == name,
            CmdMatch::Prefix(prefix) => cmd.starts_with(prefix),
        }
    }
}

/// What to do with a matched inbound command.
#[derive(Debug, Clone, Copy)]
enum Wrap {
    /// Wrap `{cmd: params}` under the module key.
    Module(Module),
    /// Surface the command itself as a top-level module: `{cmd: params}`.
    TopLevel,
    /// Strip the matched prefix, then wrap under the module key.
    StripPrefix(Module),
    /// Internal config traffic: feed the version table under the module
    /// key, then discard.
    Observe(Module),
    /// Not for the front end; discard.
    Drop,
}

/// One inbound mapping rule. First match wins.
#[derive(Debug, Clone, Copy)]
struct InboundRule {
    role: Role,
    cmd: CmdMatch,
    wrap: Wrap,
}

/// The complete inbound mapping, in evaluation order.
const INBOUND_RULES: [InboundRule; 9] = [
    InboundRule {
        role: Role::Capture,
        cmd: CmdMatch::Any,
        wrap: Wrap::Module(Module::Capture),
    },
    InboundRule {
        role: Role::Process,
        cmd: CmdMatch::Exact("player"),
        wrap: Wrap::TopLevel,
    },
    InboundRule {
        role: Role::Process,
        cmd: CmdMatch::Exact("player_dir"),
        wrap: Wrap::TopLevel,
    },
    InboundRule {
        role: Role::Process,
        cmd: CmdMatch::Any,
        wrap: Wrap::Module(Module::Mvision),
    },
    InboundRule {
        role: Role::VStream,
        cmd: CmdMatch::Prefix("streaming_"),
        wrap: Wrap::StripPrefix(Module::Streaming),
    },
    InboundRule {
        role: Role::VStream,
        cmd: CmdMatch::Prefix("recording_"),
        wrap: Wrap::StripPrefix(Module::Recording),
    },
    // The per-function config replies arrive unprefixed; they only exist
    // to carry a config_id.
    InboundRule {
        role: Role::VStream,
        cmd: CmdMatch::Exact("config_streamer"),
        wrap: Wrap::Observe(Module::Streaming),
    },
    InboundRule {
        role: Role::VStream,
        cmd: CmdMatch::Exact("config_recorder"),
        wrap: Wrap::Observe(Module::Recording),
    },
    InboundRule {
        role: Role::VStream,
        cmd: CmdMatch::Any,
        wrap: Wrap::Drop,
    },
];

/// Wrap a peer reply back into the module-named external envelope.
///
/// Error replies bypass module renaming and come back as
/// `{cmd: {err, err_msg}}`. Config-bearing replies feed the version table.
/// Returns `None` for messages the front end never sees (dropped commands,
/// replies without a params object).
pub fn route_inbound(
    role: Role,
    msg: &ControlMessage,
    config_ids: &mut ConfigVersionTable,
) -> Option<Value> {
    // Error replies are re-wrapped verbatim, no renaming applied.
    if let Some(err) = msg.err {
        let err_msg = msg.err_msg.clone().unwrap_or_else(|| "unknown".to_string());
        return Some(json!({ msg.cmd.clone(): { "err": err, "err_msg": err_msg } }));
    }

    let params = match &msg.params {
        Some(p) if p.is_object() => p.clone(),
        _ => {
            log::debug!("[Router] {role} reply {} has no params object, dropped", msg.cmd);
            return None;
        }
    };

    let rule = INBOUND_RULES
        .iter()
        .find(|r| r.role == role && r.cmd.matches(&msg.cmd))?;

    let (module_key, cmd): (Option<&'static str>, String) = match rule.wrap {
        Wrap::Module(m) => (Some(m.as_str()), msg.cmd.clone()),
        Wrap::TopLevel => (None, msg.cmd.clone()),
        Wrap::StripPrefix(m) => {
            let CmdMatch::Prefix(prefix) = rule.cmd else {
                unreachable!("StripPrefix rules always use a Prefix matcher");
            };
            (Some(m.as_str()), msg.cmd[prefix.len()..].to_string())
        }
        Wrap::Observe(m) => {
            if let Some(id) = params.get("config_id").and_then(Value::as_i64) {
                config_ids.observe(m.as_str(), id);
            }
            return None;
        }
        Wrap::Drop => {
            log::debug!("[Router] {role} command {} not for the front end, dropped", msg.cmd);
            return None;
        }
    };

    // Stale-configuration detection: config-bearing replies carry the
    // peer's version counter, keyed by the module name they surface under.
    // Matching runs on the resolved command so a stripped `streaming_config`
    // counts as `config`.
    if CONFIG_BEARING_COMMANDS.contains(&cmd.as_str()) {
        if let Some(id) = params.get("config_id").and_then(Value::as_i64) {
            let module_name = module_key.unwrap_or(&cmd);
            config_ids.observe(module_name, id);
        }
    }

    Some(match module_key {
        Some(module) => json!({ module: { cmd: params } }),
        None => json!({ cmd: params }),
    })
}

/// Aggregated status for a `{"control":{}}` query: one entry per status
/// module, `state` reflecting the owning link, `config_id` when the table
/// has seen one (the `-1` resync sentinel is surfaced deliberately).
pub fn control_status(connected: &[bool; Role::COUNT], config_ids: &ConfigVersionTable) -> Value {
    let mut entries = Map::new();
    for module in Module::STATUS {
        let mut entry = Map::new();
        let ok = connected[module.owner().index()];
        entry.insert("state".to_string(), json!(if ok { "ok" } else { "off" }));
        if let Some(id) = config_ids.get(module.as_str()) {
            entry.insert("config_id".to_string(), json!(id));
        }
        entries.insert(module.as_str().to_string(), Value::Object(entry));
    }
    json!({ "control": Value::Object(entries) })
}

/// True if the envelope is the aggregated-status query.
pub fn is_control_query(envelope: &Value) -> bool {
    envelope
        .as_object()
        .is_some_and(|obj| obj.len() == 1 && obj.contains_key("control"))
}

/// Last observed configuration version per functional module.
///
/// A peer attaches a monotonically increasing `config_id` to its
/// configuration-bearing replies. An id that goes *backwards* means the
/// backend restarted and lost state; the table records the
/// [`CONFIG_RESYNC_SENTINEL`] instead of the smaller value so the front end
/// knows to request a full resync.
#[derive(Debug, Default)]
pub struct ConfigVersionTable {
    ids: HashMap<String, i64>,
}

impl ConfigVersionTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an observed config id, applying the restart-detection rule.
    /// Returns the stored value.
    pub fn observe(&mut self, module: &str, id: i64) -> i64 {
        let stored = match self.ids.get(module) {
            Some(&prev) if id < prev => {
                log::warn!(
                    "[Router] {module} config id went backwards ({prev} -> {id}), peer restarted"
                );
                CONFIG_RESYNC_SENTINEL
            }
            _ => id,
        };
        self.ids.insert(module.to_string(), stored);
        stored
    }

    /// Last stored id for a module, if any reply carried one yet.
    pub fn get(&self, module: &str) -> Option<i64> {
        self.ids.get(module).copied()
    }
}
