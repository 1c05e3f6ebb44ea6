//! Error types and result definitions for the localtuya crate.
//! Includes Tuya-specific error codes and conversion from standard IO/JSON errors.

use thiserror::Error;

/// Represents all possible errors that can occur when communicating with a Tuya device.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TuyaError {
    /// Standard IO error on an established connection
    #[error("IO error: {0}")]
    Io(String),

    /// JSON serialization error for an outgoing payload
    #[error("JSON error: {0}")]
    Json(String),

    /// Bytes on the wire do not form a valid frame
    #[error("Framing error: {0}")]
    Framing(String),

    /// The frame did not start with the 0x55AA prefix
    #[error("Invalid header")]
    InvalidHeader,

    /// Failed to decrypt a message from the device (wrong key or version)
    #[error("Decryption failed")]
    DecryptionFailed,

    /// Decrypted payload was not the expected JSON document
    #[error("Decode error: {0}")]
    DecodeError(String),

    /// No response with the expected sequence number arrived in time
    #[error("Timeout waiting for device")]
    Timeout,

    /// The connection was closed (or never opened)
    #[error("Transport closed")]
    TransportClosed,

    /// TCP connection could not be established
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Local key is not 16 bytes long
    #[error("Local key must be 16 bytes")]
    InvalidKey,

    /// Protocol version other than 3.1 or 3.3
    #[error("Unsupported protocol version '{0}'")]
    InvalidVersion(String),

    /// A second waiter was registered for a sequence number
    #[error("Listener already registered for sequence number {0}")]
    DuplicateWaiter(u32),
}

/// A specialized Result type for Tuya operations.
pub type Result<T> = std::result::Result<T, TuyaError>;

impl From<std::io::Error> for TuyaError {
    fn from(err: std::io::Error) -> Self {
        TuyaError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for TuyaError {
    fn from(err: serde_json::Error) -> Self {
        TuyaError::Json(err.to_string())
    }
}

impl TuyaError {
    pub fn code(&self) -> u32 {
        match self {
            TuyaError::Io(_) => ERR_CONNECT,
            TuyaError::Json(_) => ERR_JSON,
            TuyaError::Framing(_) => ERR_PAYLOAD,
            TuyaError::InvalidHeader => ERR_PAYLOAD,
            TuyaError::DecryptionFailed => ERR_KEY_OR_VER,
            TuyaError::DecodeError(_) => ERR_PAYLOAD,
            TuyaError::Timeout => ERR_TIMEOUT,
            TuyaError::TransportClosed => ERR_OFFLINE,
            TuyaError::ConnectionFailed(_) => ERR_CONNECT,
            TuyaError::InvalidKey => ERR_KEY_OR_VER,
            TuyaError::InvalidVersion(_) => ERR_PARAMS,
            TuyaError::DuplicateWaiter(_) => ERR_STATE,
        }
    }

    /// True for errors where reconnecting and resending is a sensible reaction.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TuyaError::Io(_)
                | TuyaError::Timeout
                | TuyaError::TransportClosed
                | TuyaError::ConnectionFailed(_)
        )
    }
}

// TinyTuya Error Response Codes
define_error_codes! {
    ERR_SUCCESS = 0 => "Connection Successful",
    ERR_JSON = 900 => "Invalid JSON Response from Device",
    ERR_CONNECT = 901 => "Network Error: Unable to Connect",
    ERR_TIMEOUT = 902 => "Timeout Waiting for Device",
    ERR_PAYLOAD = 904 => "Unexpected Payload from Device",
    ERR_OFFLINE = 905 => "Network Error: Device Unreachable",
    ERR_STATE = 906 => "Device in Unknown State",
    ERR_DEVTYPE = 908 => "Device22 Detected: Retry Command",
    ERR_PARAMS = 912 => "Missing Function Parameters",
    ERR_KEY_OR_VER = 914 => "Check device key or version",
}
