//! # Modbus Link Error Handling
//!
//! This module provides the error type shared by every layer of the link
//! stack: channel acquisition, line configuration, framing, transactions and
//! the listener loops.
//!
//! ## Error Categories
//!
//! ### Link Errors
//! - **Link Unavailable**: The host byte channel could not be acquired
//! - **Configuration Rejected**: The host refused the requested line parameters
//! - **Connection Errors**: Operations attempted on a closed link
//! - **I/O Errors**: Low-level read/write failures on the channel
//!
//! ### Protocol I/O Errors
//! - **Protocol I/O**: One exchange failed (framing, echo, unit mismatch); the
//!   link itself is still usable. Tagged `eof` when the peer closed the stream
//! - **Timeout Errors**: A read or write exceeded the connection timeout
//! - **Frame Errors**: Malformed RTU/ASCII/MBAP frames
//! - **CRC Errors**: Checksum validation failures for RTU communication
//!
//! ### Control Errors
//! - **Interrupted**: Cooperative cancellation was observed
//! - **Configuration Errors**: Invalid configuration values
//! - **Internal Errors**: Library internal errors (should not occur in normal operation)
//!
//! ## Error Recovery
//!
//! Listener loops use the classification helpers to decide whether a failed
//! exchange ends the loop:
//!
//! ```rust
//! use modbus_link::ModbusError;
//!
//! let error = ModbusError::protocol_io("LRC mismatch");
//! assert!(error.is_protocol_io());
//! assert!(error.is_recoverable());
//!
//! let eof = ModbusError::end_of_stream("peer closed the connection");
//! assert!(eof.is_eof());
//! assert!(!eof.is_recoverable());
//! ```

use thiserror::Error;

/// Result type alias for Modbus link operations
pub type ModbusResult<T> = Result<T, ModbusError>;

/// Modbus link error types
///
/// Each variant carries enough context to be logged on its own; listener
/// loops never propagate them past their own boundary.
#[derive(Error, Debug, Clone)]
pub enum ModbusError {
    /// I/O related errors on the underlying channel
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Operation attempted on a link that is not open
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// Host byte channel could not be acquired
    ///
    /// Fatal to the current open attempt, never retried automatically.
    ///
    /// # Examples
    /// - USB serial adapter unplugged
    /// - Serial device node missing or busy
    #[error("Link unavailable on {port}: {message}")]
    LinkUnavailable { port: String, message: String },

    /// Line parameters refused by the host
    ///
    /// The connection is rolled back to fully closed when this is returned
    /// from `open()`.
    #[error("Configuration rejected: {message}")]
    ConfigurationRejected { message: String },

    /// Timeout errors
    ///
    /// Occurs when a read or write exceeds the connection timeout.
    #[error("Timeout after {timeout_ms}ms: {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Failure of a single protocol exchange
    ///
    /// Recoverable unless `eof` is set, in which case the peer has closed the
    /// stream and the connection's handling loop must end.
    #[error("Protocol I/O error: {message}")]
    ProtocolIo { message: String, eof: bool },

    /// Cooperative cancellation observed
    #[error("Interrupted: {message}")]
    Interrupted { message: String },

    /// Frame parsing errors
    ///
    /// # Examples
    /// - Missing ASCII start character
    /// - Odd number of hex digits
    /// - MBAP protocol identifier not zero
    #[error("Frame error: {message}")]
    Frame { message: String },

    /// CRC validation failure
    ///
    /// Provides both expected and actual CRC values for debugging.
    #[error("CRC validation failed: expected={expected:04X}, actual={actual:04X}")]
    CrcMismatch { expected: u16, actual: u16 },

    /// Configuration errors
    ///
    /// # Examples
    /// - Zero baud rate
    /// - Data bits outside 5-8
    /// - Malformed configuration file
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Internal errors (should not occur in normal operation)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl ModbusError {
    /// Create a new I/O error
    pub fn io<S: Into<String>>(message: S) -> Self {
        Self::Io { message: message.into() }
    }

    /// Create a new connection error
    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection { message: message.into() }
    }

    /// Create a link unavailable error for `port`
    pub fn link_unavailable<P: Into<String>, S: Into<String>>(port: P, message: S) -> Self {
        Self::LinkUnavailable {
            port: port.into(),
            message: message.into(),
        }
    }

    /// Create a configuration rejected error
    pub fn configuration_rejected<S: Into<String>>(message: S) -> Self {
        Self::ConfigurationRejected { message: message.into() }
    }

    /// Create a new timeout error
    ///
    /// # Arguments
    ///
    /// * `operation` - Description of the operation that timed out
    /// * `timeout_ms` - Timeout duration in milliseconds
    pub fn timeout<S: Into<String>>(operation: S, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms
        }
    }

    /// Create a recoverable protocol I/O error
    pub fn protocol_io<S: Into<String>>(message: S) -> Self {
        Self::ProtocolIo {
            message: message.into(),
            eof: false,
        }
    }

    /// Create a protocol I/O error signalling that the peer closed the stream
    pub fn end_of_stream<S: Into<String>>(message: S) -> Self {
        Self::ProtocolIo {
            message: message.into(),
            eof: true,
        }
    }

    /// Create an interrupted error
    pub fn interrupted<S: Into<String>>(message: S) -> Self {
        Self::Interrupted { message: message.into() }
    }

    /// Create a frame error
    pub fn frame<S: Into<String>>(message: S) -> Self {
        Self::Frame { message: message.into() }
    }

    /// Create a CRC mismatch error
    pub fn crc_mismatch(expected: u16, actual: u16) -> Self {
        Self::CrcMismatch { expected, actual }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Check if the error is recoverable (the next exchange may succeed)
    ///
    /// # Examples
    ///
    /// ```rust
    /// use modbus_link::ModbusError;
    ///
    /// let timeout_error = ModbusError::timeout("read RTU frame", 5000);
    /// assert!(timeout_error.is_recoverable());
    ///
    /// let unavailable = ModbusError::link_unavailable("/dev/ttyUSB0", "no such device");
    /// assert!(!unavailable.is_recoverable());
    /// ```
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Io { .. } => true,
            Self::Timeout { .. } => true,
            Self::ProtocolIo { eof, .. } => !eof,
            Self::Frame { .. } => true,
            Self::CrcMismatch { .. } => true,
            _ => false,
        }
    }

    /// Check if the error belongs to a single protocol exchange
    ///
    /// These are the failures a listener logs and survives: framing,
    /// checksum, timeout and exchange-level I/O errors.
    pub fn is_protocol_io(&self) -> bool {
        matches!(self,
            Self::ProtocolIo { .. } |
            Self::Timeout { .. } |
            Self::Frame { .. } |
            Self::CrcMismatch { .. }
        )
    }

    /// Check if the error signals that the peer closed the stream
    pub fn is_eof(&self) -> bool {
        matches!(self, Self::ProtocolIo { eof: true, .. })
    }

    /// Check if the error reports a timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Check if the error reports cooperative cancellation
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Interrupted { .. })
    }

    /// Check if the error is a link/transport issue
    ///
    /// # Examples
    ///
    /// ```rust
    /// use modbus_link::ModbusError;
    ///
    /// let connection_error = ModbusError::connection("link is not open");
    /// assert!(connection_error.is_transport_error());
    ///
    /// let frame_error = ModbusError::frame("missing start character");
    /// assert!(!frame_error.is_transport_error());
    /// ```
    pub fn is_transport_error(&self) -> bool {
        matches!(self,
            Self::Io { .. } |
            Self::Connection { .. } |
            Self::LinkUnavailable { .. } |
            Self::ConfigurationRejected { .. } |
            Self::Timeout { .. }
        )
    }

    /// Wrap framing and checksum failures as a recoverable protocol I/O error
    ///
    /// Other variants are returned unchanged.
    pub fn into_protocol_io(self) -> Self {
        match self {
            Self::Frame { .. } | Self::CrcMismatch { .. } => Self::protocol_io(self.to_string()),
            other => other,
        }
    }
}

/// Convert from std::io::Error
///
/// `UnexpectedEof` becomes an end-of-stream protocol error so that stream
/// handlers can tell a closed peer from a broken socket.
impl From<std::io::Error> for ModbusError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof => Self::end_of_stream(err.to_string()),
            std::io::ErrorKind::Interrupted => Self::interrupted(err.to_string()),
            _ => Self::io(err.to_string()),
        }
    }
}

/// Convert from tokio timeout errors
///
/// Callers that know the configured duration should build the error with
/// [`ModbusError::timeout`] instead.
impl From<tokio::time::error::Elapsed> for ModbusError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::timeout("Operation timeout", 0)
    }
}

/// Convert from serial port errors
impl From<tokio_serial::Error> for ModbusError {
    fn from(err: tokio_serial::Error) -> Self {
        match err.kind() {
            tokio_serial::ErrorKind::NoDevice => Self::link_unavailable("serial", err.to_string()),
            tokio_serial::ErrorKind::InvalidInput => Self::configuration_rejected(err.to_string()),
            _ => Self::io(err.to_string()),
        }
    }
}

/// Convert from serde JSON errors
impl From<serde_json::Error> for ModbusError {
    fn from(err: serde_json::Error) -> Self {
        Self::configuration(format!("JSON error: {}", err))
    }
}

/// Convert from serde YAML errors
impl From<serde_yaml::Error> for ModbusError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::configuration(format!("YAML error: {}", err))
    }
}
