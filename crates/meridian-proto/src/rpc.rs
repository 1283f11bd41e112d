//! RPC framing and status codes
//!
//! Requests and responses use the gRPC length-prefixed message framing:
//! one compression flag byte, a 4-byte big-endian length, then the payload.
//! Payloads are JSON. Call outcome travels in `grpc-status` / `grpc-message`.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

pub const RPC_CONTENT_TYPE: &str = "application/grpc+json";

/// Prefix shared by every RPC content type
pub const RPC_CONTENT_TYPE_PREFIX: &str = "application/grpc";

pub const STATUS_HEADER: &str = "grpc-status";
pub const MESSAGE_HEADER: &str = "grpc-message";

/// Maximum accepted message size (4MB)
pub const MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// Frame header size: compression flag (1) + length (4)
pub const FRAME_HEADER_SIZE: usize = 5;

/// Fully-qualified method paths
pub mod methods {
    pub const ISSUE_HUB_TOKEN: &str = "/meridian.ControlManagement/IssueHubToken";
    pub const GET_MANAGEMENT_TOKEN: &str = "/meridian.ControlManagement/GetManagementToken";
    pub const CREATE_TOKEN: &str = "/meridian.ControlManagement/CreateToken";
    pub const REVOKE_TOKEN: &str = "/meridian.ControlManagement/RevokeToken";

    pub const FETCH_CONFIG: &str = "/meridian.ControlServices/FetchConfig";
    pub const HUB_REGISTER: &str = "/meridian.ControlServices/HubRegister";
    pub const HUB_DISCONNECT: &str = "/meridian.ControlServices/HubDisconnect";
    pub const REQUEST_SERVICE_TOKEN: &str = "/meridian.ControlServices/RequestServiceToken";
    pub const VERIFY_TOKEN: &str = "/meridian.ControlServices/VerifyToken";
    pub const ALL_HUBS: &str = "/meridian.ControlServices/AllHubs";

    pub const CURRENT_FLOW_TOP: &str = "/meridian.FlowTopReporter/CurrentFlowTop";
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("message too large: {0} bytes")]
    TooLarge(usize),

    #[error("compressed messages are not supported")]
    Compressed,

    #[error("trailing data after message: {0} bytes")]
    TrailingData(usize),

    #[error("payload encoding error: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Encode a message into a single RPC frame
pub fn encode_frame<T: Serialize>(msg: &T) -> Result<Bytes, FrameError> {
    let payload = serde_json::to_vec(msg)?;
    if payload.len() > MAX_MESSAGE_SIZE {
        return Err(FrameError::TooLarge(payload.len()));
    }

    let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload.len());
    buf.put_u8(0);
    buf.put_u32(payload.len() as u32);
    buf.put_slice(&payload);
    Ok(buf.freeze())
}

/// Decode a body holding exactly one RPC frame
pub fn decode_frame<T: DeserializeOwned>(body: &[u8]) -> Result<T, FrameError> {
    let mut buf = body;
    if buf.len() < FRAME_HEADER_SIZE {
        return Err(FrameError::Truncated {
            needed: FRAME_HEADER_SIZE,
            available: buf.len(),
        });
    }

    let compressed = buf.get_u8();
    let len = buf.get_u32() as usize;
    if compressed != 0 {
        return Err(FrameError::Compressed);
    }
    if len > MAX_MESSAGE_SIZE {
        return Err(FrameError::TooLarge(len));
    }
    if buf.len() < len {
        return Err(FrameError::Truncated {
            needed: len,
            available: buf.len(),
        });
    }
    if buf.len() > len {
        return Err(FrameError::TrailingData(buf.len() - len));
    }

    Ok(serde_json::from_slice(&buf[..len])?)
}

/// gRPC status codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Code {
    Ok = 0,
    Cancelled = 1,
    Unknown = 2,
    InvalidArgument = 3,
    DeadlineExceeded = 4,
    NotFound = 5,
    AlreadyExists = 6,
    PermissionDenied = 7,
    ResourceExhausted = 8,
    FailedPrecondition = 9,
    Aborted = 10,
    OutOfRange = 11,
    Unimplemented = 12,
    Internal = 13,
    Unavailable = 14,
    DataLoss = 15,
    Unauthenticated = 16,
}

impl Code {
    pub fn from_u8(value: u8) -> Code {
        match value {
            0 => Code::Ok,
            1 => Code::Cancelled,
            3 => Code::InvalidArgument,
            4 => Code::DeadlineExceeded,
            5 => Code::NotFound,
            6 => Code::AlreadyExists,
            7 => Code::PermissionDenied,
            8 => Code::ResourceExhausted,
            9 => Code::FailedPrecondition,
            10 => Code::Aborted,
            11 => Code::OutOfRange,
            12 => Code::Unimplemented,
            13 => Code::Internal,
            14 => Code::Unavailable,
            15 => Code::DataLoss,
            16 => Code::Unauthenticated,
            _ => Code::Unknown,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Codes a client should retry with backoff rather than give up on
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            Code::Unavailable
                | Code::DeadlineExceeded
                | Code::ResourceExhausted
                | Code::Aborted
                | Code::Internal
                | Code::Unknown
        )
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Outcome of an RPC call
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct RpcStatus {
    pub code: Code,
    pub message: String,
}

impl RpcStatus {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn ok() -> Self {
        Self::new(Code::Ok, "")
    }

    pub fn unauthenticated(message: impl Into<String>) -> Self {
        Self::new(Code::Unauthenticated, message)
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(Code::PermissionDenied, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(Code::InvalidArgument, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(Code::NotFound, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(Code::Unavailable, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Code::Internal, message)
    }

    /// Build from raw `grpc-status` / `grpc-message` header values
    pub fn from_headers(status: &str, message: Option<&str>) -> Self {
        let code = status
            .trim()
            .parse::<u8>()
            .map(Code::from_u8)
            .unwrap_or(Code::Unknown);
        Self::new(code, message.map(decode_message).unwrap_or_default())
    }

    /// `grpc-message` value: percent-encoded outside printable ASCII
    pub fn encoded_message(&self) -> String {
        encode_message(&self.message)
    }
}

fn encode_message(message: &str) -> String {
    let mut out = String::with_capacity(message.len());
    for b in message.bytes() {
        if (0x20..=0x7e).contains(&b) && b != b'%' {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{:02X}", b));
        }
    }
    out
}

fn decode_message(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
            if let Some(b) = hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                out.push(b);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
