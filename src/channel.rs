//! Host byte-channel abstraction
//!
//! A [`ChannelProvider`] hands out open [`ByteChannel`]s for a
//! [`ConnectionConfig`]. The link connection never touches hardware
//! directly, so a serial port, a USB bridge or the in-memory channel used by
//! the tests are interchangeable.

use async_trait::async_trait;

use crate::config::{ConnectionConfig, LineSettings};
use crate::error::ModbusResult;

/// An open, bidirectional byte channel
///
/// Implementations are owned by exactly one transport at a time, so every
/// method takes `&mut self`.
#[async_trait]
pub trait ByteChannel: Send {
    /// Descriptive name of the underlying port
    fn port_name(&self) -> String;

    /// Apply line parameters
    ///
    /// Returns [`ModbusError::ConfigurationRejected`](crate::ModbusError::ConfigurationRejected)
    /// when the host refuses them.
    fn apply_line_settings(&mut self, settings: &LineSettings) -> ModbusResult<()>;

    /// Read whatever is available into `buf`, waiting for at least one byte
    ///
    /// Returns 0 when the channel has reached end of data. Callers bound
    /// the wait with their own timeout.
    async fn read(&mut self, buf: &mut [u8]) -> ModbusResult<usize>;

    /// Write `buf`, returning how many bytes the host accepted
    async fn write(&mut self, buf: &[u8]) -> ModbusResult<usize>;

    /// Number of bytes that can be read without waiting
    fn bytes_available(&mut self) -> ModbusResult<usize>;

    /// Discard received bytes that were not read yet
    ///
    /// Returns how many bytes were dropped, where the host can tell.
    fn clear_input(&mut self) -> ModbusResult<usize>;

    /// Release the channel
    async fn close(&mut self);
}

/// Source of byte channels
#[async_trait]
pub trait ChannelProvider: Send + Sync {
    /// Acquire an open channel for `config`
    ///
    /// Fails with [`ModbusError::LinkUnavailable`](crate::ModbusError::LinkUnavailable)
    /// if the port cannot be obtained. Line settings are applied by the
    /// caller afterwards.
    async fn acquire(&self, config: &ConnectionConfig) -> ModbusResult<Box<dyn ByteChannel>>;

    /// Ports this provider can currently reach
    fn available_ports(&self) -> Vec<String> {
        Vec::new()
    }
}
