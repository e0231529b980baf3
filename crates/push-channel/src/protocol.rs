//! Bayeux wire protocol types, constants, and JSON encode/decode.

use serde::{Deserialize, Serialize};

use crate::Error;

// ---------------------------------------------------------------------------
// Protocol constants
// ---------------------------------------------------------------------------

pub const BAYEUX_VERSION: &str = "1.0";
pub const LONG_POLLING: &str = "long-polling";

pub mod channel {
    pub const HANDSHAKE: &str = "/meta/handshake";
    pub const CONNECT: &str = "/meta/connect";
    pub const DISCONNECT: &str = "/meta/disconnect";
    pub const META_PREFIX: &str = "/meta/";
}

pub mod reconnect {
    pub const RETRY: &str = "retry";
    pub const HANDSHAKE: &str = "handshake";
    pub const NONE: &str = "none";
}

pub mod error_code {
    pub const UNKNOWN_CLIENT: u16 = 402;
}

// ---------------------------------------------------------------------------
// Wire protocol types (JSON)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub channel: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub successful: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub advice: Option<Advice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ext: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supported_connection_types: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_type: Option<String>,
}

/// Server advice on how to proceed after a meta reply.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct Advice {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconnect: Option<String>,
    /// Milliseconds to wait before the next connect.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval: Option<u64>,
    /// Milliseconds the server holds a connect open.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

impl Message {
    pub fn handshake(id: String, ext: serde_json::Value) -> Self {
        Self {
            channel: channel::HANDSHAKE.to_string(),
            id: Some(id),
            version: Some(BAYEUX_VERSION.to_string()),
            supported_connection_types: Some(vec![LONG_POLLING.to_string()]),
            ext: (!ext.is_null()).then_some(ext),
            ..Default::default()
        }
    }

    /// The first connect after a handshake carries `timeout: 0` so the server
    /// answers at once instead of holding the request.
    pub fn connect(id: String, client_id: &str, first: bool) -> Self {
        Self {
            channel: channel::CONNECT.to_string(),
            id: Some(id),
            client_id: Some(client_id.to_string()),
            connection_type: Some(LONG_POLLING.to_string()),
            advice: first.then(|| Advice {
                timeout: Some(0),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    pub fn disconnect(id: String, client_id: &str) -> Self {
        Self {
            channel: channel::DISCONNECT.to_string(),
            id: Some(id),
            client_id: Some(client_id.to_string()),
            ..Default::default()
        }
    }

    pub fn publish(id: String, client_id: &str, channel: &str, data: serde_json::Value) -> Self {
        Self {
            channel: channel.to_string(),
            id: Some(id),
            client_id: Some(client_id.to_string()),
            data: Some(data),
            ..Default::default()
        }
    }

    pub fn is_meta(&self) -> bool {
        self.channel.starts_with(channel::META_PREFIX)
    }

    pub fn is_successful(&self) -> bool {
        self.successful.unwrap_or(false)
    }

    /// Numeric code of a Bayeux error string such as `402::Unknown client`.
    pub fn error_code(&self) -> Option<u16> {
        let error = self.error.as_deref()?;
        let (code, _) = error.split_once(':')?;
        code.parse().ok()
    }
}

// ---------------------------------------------------------------------------
// Encode / decode helpers
// ---------------------------------------------------------------------------

pub fn encode_batch(messages: &[Message]) -> Result<String, Error> {
    Ok(serde_json::to_string(messages)?)
}

/// Decode a reply body. Servers answer with an array, but some send a bare
/// object for single-message replies.
pub fn decode_batch(body: &str) -> Result<Vec<Message>, Error> {
    let value: serde_json::Value = serde_json::from_str(body)?;
    match value {
        serde_json::Value::Array(_) => Ok(serde_json::from_value(value)?),
        serde_json::Value::Object(_) => Ok(vec![serde_json::from_value(value)?]),
        other => Err(Error::Protocol(format!(
            "expected message array, got {}",
            json_kind(&other)
        ))),
    }
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

/// Match a channel name against a listener pattern.
///
/// `/a/*` matches exactly one trailing segment, `/a/**` any number of them.
pub fn channel_matches(pattern: &str, name: &str) -> bool {
    if let Some(prefix) = pattern.strip_suffix("/**") {
        return name
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.len() > 1 && rest.starts_with('/'));
    }
    if let Some(prefix) = pattern.strip_suffix("/*") {
        return name.strip_prefix(prefix).is_some_and(|rest| {
            rest.len() > 1
                && rest.starts_with('/')
                && !rest.get(1..).unwrap_or_default().contains('/')
        });
    }
    pattern == name
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
