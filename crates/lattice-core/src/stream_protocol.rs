use crate::LogEntry;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 256 * 1024;

pub const MIN_COLS: u16 = 20;
pub const MAX_COLS: u16 = 300;
pub const MIN_ROWS: u16 = 5;
pub const MAX_ROWS: u16 = 120;

/// Error codes after which a session must not reconnect.
pub const FATAL_ERROR_CODES: &[&str] = &[
    "node_not_found",
    "node_not_paired",
    "vm_not_found",
    "vm_domain_missing",
    "container_not_found",
    "capability_missing",
    "capability_not_ready",
    "session_closed",
    "unauthorized",
];

/// Error codes that reject a single client message and leave the stream usable.
pub const MESSAGE_ERROR_CODES: &[&str] = &["invalid_json", "invalid_payload"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Only the last client message was refused.
    Message,
    Transient,
    Fatal,
}

/// Unknown codes are transient.
pub fn classify_error_code(code: &str) -> ErrorClass {
    let normalized = code.trim().to_ascii_lowercase();
    if FATAL_ERROR_CODES.contains(&normalized.as_str()) {
        ErrorClass::Fatal
    } else if MESSAGE_ERROR_CODES.contains(&normalized.as_str()) {
        ErrorClass::Message
    } else {
        ErrorClass::Transient
    }
}

/// Frames pushed by the master over a terminal or log stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    #[serde(alias = "terminal_ready")]
    Ready {
        #[serde(default)]
        session_id: Option<String>,
    },
    #[serde(alias = "terminal_data")]
    Data { data: String },
    #[serde(alias = "terminal_exit")]
    Exit {
        #[serde(default, alias = "code")]
        exit_code: Option<i32>,
    },
    #[serde(alias = "terminal_error")]
    Error {
        error: String,
        #[serde(default)]
        message: Option<String>,
    },
    Snapshot {
        #[serde(default)]
        items: Vec<LogEntry>,
        #[serde(default)]
        next_since_id: Option<i64>,
    },
    Append {
        #[serde(default)]
        items: Vec<LogEntry>,
        #[serde(default)]
        next_since_id: Option<i64>,
    },
    Pong,
}

impl ServerFrame {
    pub fn tag(&self) -> &'static str {
        match self {
            ServerFrame::Ready { .. } => "ready",
            ServerFrame::Data { .. } => "data",
            ServerFrame::Exit { .. } => "exit",
            ServerFrame::Error { .. } => "error",
            ServerFrame::Snapshot { .. } => "snapshot",
            ServerFrame::Append { .. } => "append",
            ServerFrame::Pong => "pong",
        }
    }
}

/// Frames sent by the console.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Input { data: String },
    Resize { cols: u16, rows: u16 },
    Ping,
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Viewport {
    pub cols: u16,
    pub rows: u16,
}

impl Viewport {
    pub fn new(cols: u16, rows: u16) -> Self {
        Self {
            cols: cols.clamp(MIN_COLS, MAX_COLS),
            rows: rows.clamp(MIN_ROWS, MAX_ROWS),
        }
    }

    pub fn resize_frame(&self) -> ClientFrame {
        ClientFrame::Resize {
            cols: self.cols,
            rows: self.rows,
        }
    }
}

impl Default for Viewport {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
}

pub fn encode_frame<T: Serialize>(value: &T, max_frame_bytes: usize) -> Result<String, FrameError> {
    let encoded =
        serde_json::to_string(value).map_err(|err| FrameError::Encode(err.to_string()))?;
    if encoded.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: encoded.len(),
            max: max_frame_bytes,
        });
    }
    Ok(encoded)
}

pub fn decode_frame<T: DeserializeOwned>(raw: &str, max_frame_bytes: usize) -> Result<T, FrameError> {
    let raw = raw.trim_end_matches(&['\r', '\n'][..]);
    if raw.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: raw.len(),
            max: max_frame_bytes,
        });
    }
    serde_json::from_str(raw).map_err(|err| FrameError::Decode(err.to_string()))
}
