pub mod script;

use serde::{Deserialize, Serialize};
use std::fmt;

pub use script::{
    Capabilities, FileContents, FileTransferReceipt, Isolation, IsolationLevel,
    MAX_TASK_ID_BYTES, MAX_TICKET_ID_BYTES, OutputSource, ProcessOutput, ProcessState, ScriptFile,
    ScriptSpec, ScriptStatus, ScriptTicket, StartScriptCommand,
};

pub const PROTOCOL_VERSION: u32 = 1;

/// Upper bound for a single JSON line on the wire.
pub const MAX_JSON_LINE_BYTES: usize = 16 * 1024 * 1024;

/// Logical service names advertised by an agent.
pub mod services {
    pub const CAPABILITIES: &str = "CapabilitiesService";
    pub const SCRIPT_LEGACY: &str = "ScriptService";
    pub const SCRIPT_V2: &str = "ScriptServiceV2";
    pub const FILE_TRANSFER: &str = "FileTransferService";

    pub const ALL: [&str; 4] = [CAPABILITIES, SCRIPT_LEGACY, SCRIPT_V2, FILE_TRANSFER];
}

/// Sentinel exit codes. Never produced by a script that actually ran to completion.
pub mod exit_codes {
    pub const FATAL: i32 = -41;
    pub const CANCELED: i32 = -43;
    pub const TIMEOUT: i32 = -44;
    pub const RUNNING: i32 = -45;
    /// The agent has never heard of the ticket.
    pub const UNKNOWN_SCRIPT: i32 = -46;
    /// The agent knows the ticket but lost track of the process (e.g. it restarted).
    pub const UNKNOWN_RESULT: i32 = -47;

    pub fn is_unknown(code: i32) -> bool {
        code == UNKNOWN_SCRIPT || code == UNKNOWN_RESULT
    }
}

/// Client-to-agent requests sent as JSON-lines.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Request {
    GetCapabilities,

    // Script service (current)
    StartScript {
        command: StartScriptCommand,
    },
    GetStatus {
        ticket: ScriptTicket,
        #[serde(default)]
        last_log_sequence: u64,
    },
    CancelScript {
        ticket: ScriptTicket,
        #[serde(default)]
        last_log_sequence: u64,
    },
    CompleteScript {
        ticket: ScriptTicket,
    },

    // Script service (legacy): agent assigns the ticket, complete returns the final status
    StartScriptLegacy {
        task_id: String,
        script: ScriptSpec,
    },
    GetStatusLegacy {
        ticket: ScriptTicket,
        #[serde(default)]
        last_log_sequence: u64,
    },
    CancelScriptLegacy {
        ticket: ScriptTicket,
        #[serde(default)]
        last_log_sequence: u64,
    },
    CompleteScriptLegacy {
        ticket: ScriptTicket,
        #[serde(default)]
        last_log_sequence: u64,
    },

    // File transfer
    UploadFile {
        path: String,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    DownloadFile {
        path: String,
    },
}

/// Service and operation a request is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RpcCall {
    pub service: &'static str,
    pub operation: &'static str,
}

impl fmt::Display for RpcCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.service, self.operation)
    }
}

impl Request {
    pub fn rpc_call(&self) -> RpcCall {
        let (service, operation) = match self {
            Request::GetCapabilities => (services::CAPABILITIES, "GetCapabilities"),
            Request::StartScript { .. } => (services::SCRIPT_V2, "StartScript"),
            Request::GetStatus { .. } => (services::SCRIPT_V2, "GetStatus"),
            Request::CancelScript { .. } => (services::SCRIPT_V2, "CancelScript"),
            Request::CompleteScript { .. } => (services::SCRIPT_V2, "CompleteScript"),
            Request::StartScriptLegacy { .. } => (services::SCRIPT_LEGACY, "StartScript"),
            Request::GetStatusLegacy { .. } => (services::SCRIPT_LEGACY, "GetStatus"),
            Request::CancelScriptLegacy { .. } => (services::SCRIPT_LEGACY, "CancelScript"),
            Request::CompleteScriptLegacy { .. } => (services::SCRIPT_LEGACY, "CompleteScript"),
            Request::UploadFile { .. } => (services::FILE_TRANSFER, "UploadFile"),
            Request::DownloadFile { .. } => (services::FILE_TRANSFER, "DownloadFile"),
        };
        RpcCall { service, operation }
    }

    /// Ticket the request refers to, if any.
    pub fn ticket(&self) -> Option<&ScriptTicket> {
        match self {
            Request::StartScript { command } => Some(&command.ticket),
            Request::GetStatus { ticket, .. }
            | Request::CancelScript { ticket, .. }
            | Request::CompleteScript { ticket }
            | Request::GetStatusLegacy { ticket, .. }
            | Request::CancelScriptLegacy { ticket, .. }
            | Request::CompleteScriptLegacy { ticket, .. } => Some(ticket),
            _ => None,
        }
    }
}

/// Agent-to-client responses.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    /// First line on every connection, before any request is read.
    Hello {
        protocol_version: u32,
    },
    Ok {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<serde_json::Value>,
    },
    Error {
        message: String,
        code: ErrorCode,
    },
}

impl Response {
    pub fn hello() -> Self {
        Response::Hello {
            protocol_version: PROTOCOL_VERSION,
        }
    }

    pub fn empty() -> Self {
        Response::Ok { data: None }
    }

    pub fn ok<T: Serialize>(value: &T) -> Self {
        match serde_json::to_value(value) {
            Ok(data) => Response::Ok { data: Some(data) },
            Err(err) => Response::error(ErrorCode::ServerError, format!("encode failed: {err}")),
        }
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Response::Error {
            message: message.into(),
            code,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// The agent does not host the addressed service.
    UnknownService,
    InvalidRequest,
    UnsupportedCommand,
    NotFound,
    ServerError,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCode::UnknownService => "unknown_service",
            ErrorCode::InvalidRequest => "invalid_request",
            ErrorCode::UnsupportedCommand => "unsupported_command",
            ErrorCode::NotFound => "not_found",
            ErrorCode::ServerError => "server_error",
        };
        f.write_str(name)
    }
}

/// Base64 encoding for byte arrays in JSON.
mod base64_bytes {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}
