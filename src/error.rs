//! Error types for the boot mode protocol engine.

use thiserror::Error;

/// Errors raised by the transport, the frame codecs and the protocol variants.
#[derive(Debug, Error)]
pub enum Error {
    /// No (or not enough) data arrived within the read window.
    #[error("timeout waiting for response")]
    Timeout,

    /// Received bytes do not form a valid frame.
    #[error("frame error: {0}")]
    Frame(String),

    /// Frame checksum mismatch.
    #[error("checksum mismatch: expected 0x{expected:02X}, got 0x{actual:02X}")]
    Checksum { expected: u8, actual: u8 },

    /// The device answered with a structured error status.
    #[error("device error 0x{code:02X} for command 0x{command:02X}")]
    Device { command: u8, code: u8 },

    /// An operation was issued before the session reached the state it needs.
    #[error("not ready: {0}")]
    NotReady(&'static str),

    /// Malformed S-record input.
    #[error("S-record parse error at line {line}: {reason}")]
    Parse { line: usize, reason: String },

    /// The device answered with a response that does not belong to the request.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// ID code protection is enabled and no matching ID code was supplied.
    #[error("ID code protection is enabled, flash is read-only for this session")]
    IdProtected,

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("unsupported device: {0}")]
    UnsupportedDevice(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("field packing error: {0}")]
    Scroll(#[from] scroll::Error),
}

impl Error {
    /// Only timeouts may be retried by the caller, everything else desyncs or
    /// reflects a device/contract failure.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Timeout)
    }
}

/// Result type of the protocol engine.
pub type Result<T> = std::result::Result<T, Error>;
