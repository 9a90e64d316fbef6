//! Error codes and the error record carried by replies.
//!
//! Codes live in a flat numeric space: `0` means no error, `[100000, 200000)`
//! is transient (a retry may succeed) and `[200000, 300000)` is fatal. Each
//! half reserves its upper `+50000` sub-range for application-defined codes.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error as ThisError;

/// Numeric error code.
///
/// Whether a code is fatal is a pure function of its range, so application
/// codes classify correctly without being registered anywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ErrorCode(pub u32);

impl ErrorCode {
    pub const NONE: ErrorCode = ErrorCode(0);

    pub const TRANSIENT_ERROR: ErrorCode = ErrorCode(100_000);
    pub const SEND_QUEUE_FULL: ErrorCode = ErrorCode(100_001);
    pub const NO_ADDRESS_FOR_SERVICE: ErrorCode = ErrorCode(100_002);
    pub const CONNECTION_ERROR: ErrorCode = ErrorCode(100_003);
    pub const SESSION_BUSY: ErrorCode = ErrorCode(100_005);
    pub const SEND_ABORTED: ErrorCode = ErrorCode(100_006);
    pub const HANDSHAKE_FAILED: ErrorCode = ErrorCode(100_007);
    pub const APP_TRANSIENT_ERROR: ErrorCode = ErrorCode(150_000);

    pub const FATAL_ERROR: ErrorCode = ErrorCode(200_000);
    pub const SEND_QUEUE_CLOSED: ErrorCode = ErrorCode(200_001);
    pub const ILLEGAL_ROUTE: ErrorCode = ErrorCode(200_002);
    pub const NO_SERVICES_FOR_ROUTE: ErrorCode = ErrorCode(200_003);
    pub const UNKNOWN_SESSION: ErrorCode = ErrorCode(200_004);
    pub const ENCODE_ERROR: ErrorCode = ErrorCode(200_005);
    pub const NETWORK_ERROR: ErrorCode = ErrorCode(200_006);
    pub const UNKNOWN_PROTOCOL: ErrorCode = ErrorCode(200_007);
    pub const DECODE_ERROR: ErrorCode = ErrorCode(200_008);
    pub const TIMEOUT: ErrorCode = ErrorCode(200_009);
    pub const INCOMPATIBLE_VERSION: ErrorCode = ErrorCode(200_010);
    pub const UNKNOWN_POLICY: ErrorCode = ErrorCode(200_011);
    pub const NETWORK_SHUTDOWN: ErrorCode = ErrorCode(200_012);
    pub const POLICY_ERROR: ErrorCode = ErrorCode(200_013);
    pub const SEQUENCE_ERROR: ErrorCode = ErrorCode(200_014);
    pub const APP_FATAL_ERROR: ErrorCode = ErrorCode(250_000);

    pub const ERROR_LIMIT: ErrorCode = ErrorCode(300_000);

    /// Whether retrying cannot help without outside intervention.
    pub fn is_fatal(self) -> bool {
        self >= Self::FATAL_ERROR
    }

    /// Whether a retry may succeed.
    pub fn is_transient(self) -> bool {
        self >= Self::TRANSIENT_ERROR && self < Self::FATAL_ERROR
    }

    /// Symbolic name of the code.
    ///
    /// Unregistered codes render by range, e.g. `APP_FATAL_ERROR + 12`.
    pub fn name(self) -> String {
        let known = match self {
            Self::NONE => "NONE",
            Self::TRANSIENT_ERROR => "TRANSIENT_ERROR",
            Self::SEND_QUEUE_FULL => "SEND_QUEUE_FULL",
            Self::NO_ADDRESS_FOR_SERVICE => "NO_ADDRESS_FOR_SERVICE",
            Self::CONNECTION_ERROR => "CONNECTION_ERROR",
            Self::SESSION_BUSY => "SESSION_BUSY",
            Self::SEND_ABORTED => "SEND_ABORTED",
            Self::HANDSHAKE_FAILED => "HANDSHAKE_FAILED",
            Self::APP_TRANSIENT_ERROR => "APP_TRANSIENT_ERROR",
            Self::FATAL_ERROR => "FATAL_ERROR",
            Self::SEND_QUEUE_CLOSED => "SEND_QUEUE_CLOSED",
            Self::ILLEGAL_ROUTE => "ILLEGAL_ROUTE",
            Self::NO_SERVICES_FOR_ROUTE => "NO_SERVICES_FOR_ROUTE",
            Self::UNKNOWN_SESSION => "UNKNOWN_SESSION",
            Self::ENCODE_ERROR => "ENCODE_ERROR",
            Self::NETWORK_ERROR => "NETWORK_ERROR",
            Self::UNKNOWN_PROTOCOL => "UNKNOWN_PROTOCOL",
            Self::DECODE_ERROR => "DECODE_ERROR",
            Self::TIMEOUT => "TIMEOUT",
            Self::INCOMPATIBLE_VERSION => "INCOMPATIBLE_VERSION",
            Self::UNKNOWN_POLICY => "UNKNOWN_POLICY",
            Self::NETWORK_SHUTDOWN => "NETWORK_SHUTDOWN",
            Self::POLICY_ERROR => "POLICY_ERROR",
            Self::SEQUENCE_ERROR => "SEQUENCE_ERROR",
            Self::APP_FATAL_ERROR => "APP_FATAL_ERROR",
            _ => return self.range_name(),
        };
        known.to_string()
    }

    fn range_name(self) -> String {
        let bases = [
            Self::APP_FATAL_ERROR,
            Self::FATAL_ERROR,
            Self::APP_TRANSIENT_ERROR,
            Self::TRANSIENT_ERROR,
        ];
        bases
            .iter()
            .find(|base| self > **base && self < Self::ERROR_LIMIT)
            .map(|base| format!("{} + {}", base.name(), self.0 - base.0))
            .unwrap_or_else(|| format!("UNKNOWN({})", self.0))
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

impl From<u32> for ErrorCode {
    fn from(code: u32) -> Self {
        ErrorCode(code)
    }
}

/// An error attached to a reply, or returned when a send is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ThisError)]
#[error("[{code}] {message}")]
pub struct Error {
    /// What went wrong.
    pub code: ErrorCode,
    /// Human-readable detail.
    pub message: String,
    /// Service that produced the error, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
}

impl Error {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            service: None,
        }
    }

    /// Attach the originating service name.
    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = Some(service.into());
        self
    }

    pub fn is_fatal(&self) -> bool {
        self.code.is_fatal()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
