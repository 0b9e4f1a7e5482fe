//! Wire messages exchanged between the service and its clients
//!
//! Every message is a flat JSON object with a mandatory `type` discriminator.
//! Only strings, numbers, maps and lists of those ever cross the channel.

use crate::profile::VpnProfile;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Extra key/value data attached to a status message.
pub type StatusData = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VpnStatus {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

impl VpnStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VpnStatus::Connecting => "connecting",
            VpnStatus::Connected => "connected",
            VpnStatus::Disconnecting => "disconnecting",
            VpnStatus::Disconnected => "disconnected",
        }
    }
}

impl fmt::Display for VpnStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which output stream of the external process a line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl fmt::Display for LogStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogStream::Stdout => f.write_str("stdout"),
            LogStream::Stderr => f.write_str("stderr"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<&tracing::Level> for LogLevel {
    fn from(level: &tracing::Level) -> Self {
        match *level {
            tracing::Level::TRACE => LogLevel::Trace,
            tracing::Level::DEBUG => LogLevel::Debug,
            tracing::Level::INFO => LogLevel::Info,
            tracing::Level::WARN => LogLevel::Warn,
            tracing::Level::ERROR => LogLevel::Error,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        };
        f.write_str(name)
    }
}

/// Error codes surfaced to clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// The VPN executable could not be located
    #[serde(rename = "OPENCONNECT_NOT_FOUND")]
    ExecutableNotFound,
    /// Reserved: only reported if the external process signals it
    #[serde(rename = "AUTH_FAILED")]
    AuthenticationFailed,
    NetworkError,
    AlreadyInProgress,
    MalformedMessage,
    UnknownError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ExecutableNotFound => "OPENCONNECT_NOT_FOUND",
            ErrorCode::AuthenticationFailed => "AUTH_FAILED",
            ErrorCode::NetworkError => "NETWORK_ERROR",
            ErrorCode::AlreadyInProgress => "ALREADY_IN_PROGRESS",
            ErrorCode::MalformedMessage => "MALFORMED_MESSAGE",
            ErrorCode::UnknownError => "UNKNOWN_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Commands sent by a client to the service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Connect { profile: VpnProfile, cookie: String },
    Disconnect,
    QueryStatus,
}

impl ClientMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Connect { .. } => "connect",
            ClientMessage::Disconnect => "disconnect",
            ClientMessage::QueryStatus => "query_status",
        }
    }
}

/// Events broadcast by the service to its clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServiceMessage {
    StatusMessage {
        status: VpnStatus,
        message: String,
        #[serde(default)]
        data: StatusData,
    },
    CommandOutput {
        line: String,
        stream: LogStream,
        process_name: String,
    },
    ServiceLog {
        level: LogLevel,
        message: String,
        logger_name: String,
    },
    Error {
        error_message: String,
        error_code: ErrorCode,
        #[serde(default)]
        details: Option<String>,
    },
}

impl ServiceMessage {
    pub fn status(status: VpnStatus, message: impl Into<String>, data: StatusData) -> Self {
        ServiceMessage::StatusMessage {
            status,
            message: message.into(),
            data,
        }
    }

    pub fn error(
        error_message: impl Into<String>,
        error_code: ErrorCode,
        details: Option<String>,
    ) -> Self {
        ServiceMessage::Error {
            error_message: error_message.into(),
            error_code,
            details,
        }
    }
}

/// Build a `StatusData` map from literal pairs.
pub fn status_data<const N: usize>(pairs: [(&str, String); N]) -> StatusData {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_message_discriminators() {
        let v = serde_json::to_value(ClientMessage::Disconnect).unwrap();
        assert_eq!(v, json!({"type": "disconnect"}));

        let v = serde_json::to_value(ClientMessage::QueryStatus).unwrap();
        assert_eq!(v, json!({"type": "query_status"}));
    }

    #[test]
    fn test_connect_wire_shape() {
        let profile = VpnProfile::new("corp", "https://vpn.example.com")
            .with_routes(vec!["10.1.0.0/16".parse().unwrap()]);
        let msg = ClientMessage::Connect {
            profile,
            cookie: "secret".into(),
        };
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["type"], "connect");
        assert_eq!(v["profile"]["url"], "https://vpn.example.com");
        assert_eq!(
            v["profile"]["destination_networks"][0],
            json!({"destination_ip": "10.1.0.0", "netmask": "255.255.0.0"})
        );
        assert_eq!(v["cookie"], "secret");
    }

    #[test]
    fn test_status_message_wire_shape() {
        let msg = ServiceMessage::status(
            VpnStatus::Disconnected,
            "gone",
            status_data([("reason", "user_requested".into()), ("was_error", "false".into())]),
        );
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            v,
            json!({
                "type": "status_message",
                "status": "disconnected",
                "message": "gone",
                "data": {"reason": "user_requested", "was_error": "false"}
            })
        );
    }

    #[test]
    fn test_error_codes_on_wire() {
        let cases = [
            (ErrorCode::ExecutableNotFound, "OPENCONNECT_NOT_FOUND"),
            (ErrorCode::AuthenticationFailed, "AUTH_FAILED"),
            (ErrorCode::NetworkError, "NETWORK_ERROR"),
            (ErrorCode::AlreadyInProgress, "ALREADY_IN_PROGRESS"),
            (ErrorCode::MalformedMessage, "MALFORMED_MESSAGE"),
            (ErrorCode::UnknownError, "UNKNOWN_ERROR"),
        ];
        for (code, expected) in cases {
            assert_eq!(serde_json::to_value(code).unwrap(), json!(expected));
            assert_eq!(code.as_str(), expected);
        }
    }

    #[test]
    fn test_error_details_optional() {
        let msg: ServiceMessage = serde_json::from_value(json!({
            "type": "error",
            "error_message": "boom",
            "error_code": "UNKNOWN_ERROR",
            "details": null
        }))
        .unwrap();
        assert_eq!(msg, ServiceMessage::error("boom", ErrorCode::UnknownError, None));
    }

    #[test]
    fn test_log_level_from_tracing() {
        assert_eq!(LogLevel::from(&tracing::Level::WARN), LogLevel::Warn);
        assert!(LogLevel::Error > LogLevel::Info);
    }
}
