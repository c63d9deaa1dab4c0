//! Line protocol spoken over control sockets.
//!
//! Requests are a single bare word (`restart`, `stop`, `info`); replies are a single line.
//! The format stays plain text so `printf restart | nc -U .dev/<id>.sock` keeps working.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

pub const MAX_COMMAND_BYTES: usize = 4 * 1024;
pub const REPLY_OK: &str = "ok";
pub const UNKNOWN_COMMAND: &str = "unknown-command";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    Restart,
    Stop,
    Info,
    Unknown(String),
}

impl ControlCommand {
    pub fn parse(raw: &str) -> Self {
        match raw.trim() {
            "restart" => ControlCommand::Restart,
            "stop" => ControlCommand::Stop,
            "info" => ControlCommand::Info,
            other => ControlCommand::Unknown(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            ControlCommand::Restart => "restart",
            ControlCommand::Stop => "stop",
            ControlCommand::Info => "info",
            ControlCommand::Unknown(raw) => raw.as_str(),
        }
    }
}

impl fmt::Display for ControlCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a supervised unit reports about itself in reply to `info`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct InfoSnapshot {
    pub id: String,
    pub name: String,
    pub port: Option<u16>,
    pub url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct InfoWire {
    id: String,
    name: String,
    #[serde(default)]
    port: Value,
    #[serde(default)]
    url: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("empty reply")]
    Empty,
    #[error("malformed info reply: {0}")]
    MalformedInfo(String),
    #[error("peer reported error: {0}")]
    Remote(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Ok(Option<String>),
    Error(String),
    Info(InfoSnapshot),
}

impl Reply {
    pub fn encode(&self) -> String {
        match self {
            Reply::Ok(None) => REPLY_OK.to_string(),
            Reply::Ok(Some(detail)) => format!("{REPLY_OK}:{}", single_line(detail)),
            Reply::Error(message) => format!("error:{}", single_line(message)),
            Reply::Info(snapshot) => encode_info(snapshot),
        }
    }

    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(ProtocolError::Empty);
        }
        if trimmed == REPLY_OK {
            return Ok(Reply::Ok(None));
        }
        if let Some(detail) = trimmed.strip_prefix("ok:") {
            return Ok(Reply::Ok(Some(detail.to_string())));
        }
        if let Some(message) = trimmed.strip_prefix("error:") {
            return Ok(Reply::Error(message.to_string()));
        }
        decode_info(trimmed).map(Reply::Info)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Reply::Error(_))
    }
}

pub fn encode_info(snapshot: &InfoSnapshot) -> String {
    serde_json::to_string(snapshot).unwrap_or_else(|err| format!("error:{err}"))
}

/// Parses an `info` reply. A port that is absent or not a valid port number decodes as `None`.
pub fn decode_info(raw: &str) -> Result<InfoSnapshot, ProtocolError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ProtocolError::Empty);
    }
    if let Some(message) = trimmed.strip_prefix("error:") {
        return Err(ProtocolError::Remote(message.to_string()));
    }
    let wire: InfoWire = serde_json::from_str(trimmed)
        .map_err(|err| ProtocolError::MalformedInfo(err.to_string()))?;
    let port = wire
        .port
        .as_u64()
        .and_then(|value| u16::try_from(value).ok())
        .filter(|value| *value > 0);
    let url = wire.url.as_str().map(str::to_string);
    Ok(InfoSnapshot {
        id: wire.id,
        name: wire.name,
        port,
        url,
    })
}

fn single_line(input: &str) -> String {
    input
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}
