//! # Outbound Commands
//!
//! Command identifiers and the JSON envelope they travel in:
//! `{ "command": <id>, "timestamp": <ts>, ...payload }`.

use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

use crate::error::{BmsLinkError, Result};

/// Envelope keys that payload fields may not override
const RESERVED_KEYS: &[&str] = &["command", "timestamp"];

/// Commands understood by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    /// Read identity, counters and lock status
    ReadStatic,
    /// Read cell voltages, temperatures and error counters
    ReadDynamic,
    /// Clear the device's stored error counters
    ClearErrors,
    /// Turn the pack LEDs on
    LedOn,
    /// Turn the pack LEDs off
    LedOff,
    /// Query used/total bytes of device storage
    GetFsInfo,
    /// Heartbeat
    Ping,
    /// Ask whether a battery is attached
    Presence,
    /// Toggle device log verbosity (payload `enabled: bool`)
    SetLogging,
}

impl Command {
    /// Every command, in wire-name order of the CLI help
    pub const ALL: [Command; 9] = [
        Command::ReadStatic,
        Command::ReadDynamic,
        Command::ClearErrors,
        Command::LedOn,
        Command::LedOff,
        Command::GetFsInfo,
        Command::Ping,
        Command::Presence,
        Command::SetLogging,
    ];

    /// Wire identifier
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::ReadStatic => "read_static",
            Command::ReadDynamic => "read_dynamic",
            Command::ClearErrors => "clear_errors",
            Command::LedOn => "led_on",
            Command::LedOff => "led_off",
            Command::GetFsInfo => "get_fs_info",
            Command::Ping => "ping",
            Command::Presence => "presence",
            Command::SetLogging => "set_logging",
        }
    }

    /// Whether sending this command puts a loading indicator in the pending state
    pub fn shows_loading(&self) -> bool {
        matches!(
            self,
            Command::ReadStatic | Command::ReadDynamic | Command::ClearErrors
        )
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Command {
    type Err = BmsLinkError;

    fn from_str(s: &str) -> Result<Self> {
        Command::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| BmsLinkError::UnknownCommand(s.to_string()))
    }
}

/// Extra fields spread into a command envelope
pub type Payload = Map<String, Value>;

/// Serialized form of one outbound command
///
/// Built fresh for every send and never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandEnvelope {
    pub command: Command,
    pub timestamp: String,
    #[serde(flatten)]
    pub payload: Payload,
}

impl CommandEnvelope {
    /// Build an envelope, dropping payload keys that collide with envelope keys
    pub fn new(command: Command, timestamp: String, mut payload: Payload) -> Self {
        for key in RESERVED_KEYS {
            payload.remove(*key);
        }
        Self {
            command,
            timestamp,
            payload,
        }
    }

    /// Text-serialize for the transport
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(BmsLinkError::Export)
    }
}

/// A command together with its payload, before it is stamped
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundCommand {
    pub command: Command,
    pub payload: Payload,
}

impl OutboundCommand {
    /// Command with no extra payload
    pub fn new(command: Command) -> Self {
        Self {
            command,
            payload: Payload::new(),
        }
    }

    /// Command with an explicit payload
    pub fn with_payload(command: Command, payload: Payload) -> Self {
        Self { command, payload }
    }

    /// `set_logging` with its `enabled` flag
    pub fn set_logging(enabled: bool) -> Self {
        let mut payload = Payload::new();
        payload.insert("enabled".to_string(), Value::Bool(enabled));
        Self::with_payload(Command::SetLogging, payload)
    }
}

impl From<Command> for OutboundCommand {
    fn from(command: Command) -> Self {
        Self::new(command)
    }
}
