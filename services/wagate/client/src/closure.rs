//! Closure causes and the status codes the network reports with them.
//!
//! Client libraries report closures with loosely shaped diagnostics: sometimes
//! a boom-style `{output: {statusCode}}`, sometimes a flat `{statusCode}` or
//! `{code}`, sometimes just a message string. [`ClosureCause::decode`] turns
//! any of these into one tagged struct at the boundary.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Status codes carried by connection closures
pub mod codes {
    /// Account was logged out from the device
    pub const LOGGED_OUT: u16 = 401;
    /// Account is banned or the session is forbidden
    pub const FORBIDDEN: u16 = 403;
    /// Connection lost or timed out
    pub const CONNECTION_LOST: u16 = 408;
    /// Stored session no longer matches the device (multi-device mismatch)
    pub const SESSION_INVALID: u16 = 411;
    /// Network refused a precondition of the stored session
    pub const PRECONDITION_FAILED: u16 = 412;
    /// Stored session expired
    pub const SESSION_EXPIRED: u16 = 419;
    /// Connection closed by the server
    pub const CONNECTION_CLOSED: u16 = 428;
    /// Another client replaced this connection
    pub const CONNECTION_REPLACED: u16 = 440;
    /// Generic server-side failure
    pub const INTERNAL: u16 = 500;
    /// Server asks the client to restart the connection
    pub const RESTART_REQUIRED: u16 = 515;

    /// Codes after which the stored credentials are permanently unusable
    pub const DEFAULT_TERMINAL: [u16; 5] = [
        LOGGED_OUT,
        FORBIDDEN,
        SESSION_INVALID,
        PRECONDITION_FAILED,
        SESSION_EXPIRED,
    ];
}

const CODE_POINTERS: [&str; 5] = [
    "/output/statusCode",
    "/statusCode",
    "/status",
    "/code",
    "/data/statusCode",
];

const REASON_POINTERS: [&str; 5] = [
    "/message",
    "/reason",
    "/error",
    "/data/reason",
    "/output/payload/message",
];

/// Why a connection closed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosureCause {
    /// Status code, when the client reported one
    pub code: Option<u16>,
    /// Human-readable reason
    pub reason: String,
    /// Original diagnostic payload, kept for troubleshooting
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<Value>,
}

impl ClosureCause {
    /// Closure with a known status code
    pub fn with_code(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            reason: reason.into(),
            raw: None,
        }
    }

    /// Closure without a status code
    pub fn without_code(reason: impl Into<String>) -> Self {
        Self {
            code: None,
            reason: reason.into(),
            raw: None,
        }
    }

    /// Decode a closure from an untyped diagnostic payload.
    ///
    /// Never fails: unknown shapes yield a cause without a code.
    pub fn decode(raw: &Value) -> Self {
        let code = CODE_POINTERS
            .iter()
            .find_map(|ptr| raw.pointer(ptr).and_then(code_from_value));

        let reason = REASON_POINTERS
            .iter()
            .find_map(|ptr| raw.pointer(ptr).and_then(Value::as_str))
            .or_else(|| raw.as_str())
            .filter(|s| !s.trim().is_empty())
            .map(str::to_owned)
            .unwrap_or_else(|| match code {
                Some(code) => format!("connection closed with status {code}"),
                None => "connection closed".to_string(),
            });

        Self {
            code,
            reason,
            raw: Some(raw.clone()),
        }
    }
}

fn code_from_value(value: &Value) -> Option<u16> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|v| u16::try_from(v).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
