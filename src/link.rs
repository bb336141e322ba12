//! Serial link connection
//!
//! [`LinkConnection`] owns the lifecycle of one serial link: it acquires a
//! byte channel from its [`ChannelProvider`], applies the line settings and
//! binds exactly one [`SerialTransport`] while open.
//!
//! ```text
//!   Closed --open()--> Open --close()--> Closed
//!     ^                  |
//!     +---- failure -----+   (no partially open state)
//! ```

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::channel::ChannelProvider;
use crate::config::{ConnectionConfig, FrameEncoding, Parity, StopBits};
use crate::error::{ModbusError, ModbusResult};
use crate::transaction::TransactionTemplate;
use crate::transport::{ModbusTransport, SerialTransport, SharedTimeout};

/// A serial link with at most one bound transport
pub struct LinkConnection {
    config: ConnectionConfig,
    provider: Arc<dyn ChannelProvider>,
    transport: Option<SerialTransport>,
    timeout: SharedTimeout,
    packet_logging: bool,
}

impl LinkConnection {
    pub fn new(config: ConnectionConfig, provider: Arc<dyn ChannelProvider>) -> Self {
        let timeout = SharedTimeout::new(config.timeout_ms);
        Self {
            config,
            provider,
            transport: None,
            timeout,
            packet_logging: false,
        }
    }

    /// Link over a host serial port
    pub fn serial(config: ConnectionConfig) -> Self {
        Self::new(config, Arc::new(crate::serial::SerialProvider::new()))
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Open the link
    ///
    /// Acquires the channel, applies the line settings and binds a transport
    /// for the configured encoding. A link that is already open is closed
    /// first. On any failure the link is left closed.
    pub async fn open(&mut self) -> ModbusResult<()> {
        self.config.validate()?;
        if self.transport.is_some() {
            debug!("Link {} reopened, closing previous channel", self.config.port);
            self.close().await;
        }

        let mut channel = self.provider.acquire(&self.config).await?;
        if let Err(e) = channel.apply_line_settings(&self.config.line_settings()) {
            channel.close().await;
            return Err(match e {
                ModbusError::ConfigurationRejected { .. } => e,
                other => ModbusError::configuration_rejected(other.to_string()),
            });
        }

        let mut transport = SerialTransport::new(channel, &self.config, self.timeout.clone());
        transport.set_packet_logging(self.packet_logging);
        info!(
            "Opened {} link on {} ({})",
            self.config.encoding,
            transport.port_name(),
            self.config.line_settings()
        );
        self.transport = Some(transport);
        Ok(())
    }

    /// Close the link; closing a closed link does nothing
    pub async fn close(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.close().await;
            info!("Closed link on {}", self.config.port);
        }
    }

    pub fn is_open(&self) -> bool {
        self.transport.is_some()
    }

    /// The bound transport, if open
    pub fn transport(&self) -> Option<&SerialTransport> {
        self.transport.as_ref()
    }

    pub fn transport_mut(&mut self) -> Option<&mut SerialTransport> {
        self.transport.as_mut()
    }

    fn open_transport(&mut self) -> ModbusResult<&mut SerialTransport> {
        let port = &self.config.port;
        self.transport
            .as_mut()
            .ok_or_else(|| ModbusError::connection(format!("Link {} is not open", port)))
    }

    /// Transaction template from the bound transport
    pub fn create_transaction(&self) -> ModbusResult<TransactionTemplate> {
        self.transport
            .as_ref()
            .map(|t| t.create_transaction())
            .ok_or_else(|| {
                ModbusError::connection(format!("Link {} is not open", self.config.port))
            })
    }

    /// Read up to `n` bytes into `buf`, returning the count read
    ///
    /// Never reads more than `n` (or `buf.len()`) bytes. A short count means
    /// end of data or timeout.
    pub async fn read_bytes(&mut self, buf: &mut [u8], n: usize) -> ModbusResult<usize> {
        let n = n.min(buf.len());
        self.open_transport()?.read_bytes(&mut buf[..n]).await
    }

    /// Write up to `n` bytes of `buf`, returning the count the host accepted
    pub async fn write_bytes(&mut self, buf: &[u8], n: usize) -> ModbusResult<usize> {
        let n = n.min(buf.len());
        self.open_transport()?.write_bytes(&buf[..n]).await
    }

    /// Bytes readable without waiting, 0 when closed or if the probe fails
    pub fn bytes_available(&mut self) -> usize {
        match self.transport.as_mut() {
            Some(transport) => transport.bytes_available().unwrap_or_else(|e| {
                debug!("bytes_available probe failed: {}", e);
                0
            }),
            None => 0,
        }
    }

    /// Read timeout in milliseconds
    pub fn timeout(&self) -> u64 {
        self.timeout.get()
    }

    /// Set the read timeout; applies to the next read without reopening
    pub fn set_timeout(&mut self, timeout_ms: u64) {
        self.timeout.set(timeout_ms);
        self.config.timeout_ms = timeout_ms;
    }

    /// Timeout cell shared with the bound transport
    pub fn timeout_handle(&self) -> SharedTimeout {
        self.timeout.clone()
    }

    pub fn set_packet_logging(&mut self, enabled: bool) {
        self.packet_logging = enabled;
        if let Some(transport) = self.transport.as_mut() {
            transport.set_packet_logging(enabled);
        }
    }

    pub fn baud_rate(&self) -> u32 {
        self.config.baud_rate
    }

    /// Change the baud rate, re-applying line settings if open
    pub fn set_baud_rate(&mut self, baud_rate: u32) -> ModbusResult<()> {
        crate::utils::validation::validate_baud_rate(baud_rate)?;
        let mut settings = self.config.line_settings();
        settings.baud_rate = baud_rate;
        if let Some(transport) = self.transport.as_mut() {
            transport.apply_line_settings(&settings)?;
        }
        self.config.baud_rate = baud_rate;
        Ok(())
    }

    pub fn data_bits(&self) -> u8 {
        self.config.data_bits
    }

    pub fn stop_bits(&self) -> StopBits {
        self.config.stop_bits
    }

    pub fn parity(&self) -> Parity {
        self.config.parity
    }

    pub fn encoding(&self) -> FrameEncoding {
        self.config.encoding
    }

    /// Replace the configuration
    ///
    /// While open, line settings are re-applied to the live channel; the
    /// port, encoding and echo flag only change on a closed link.
    pub fn reconfigure(&mut self, config: ConnectionConfig) -> ModbusResult<()> {
        config.validate()?;
        if let Some(transport) = self.transport.as_mut() {
            if config.port != self.config.port
                || config.encoding != self.config.encoding
                || config.echo != self.config.echo
            {
                return Err(ModbusError::configuration(
                    "Port, encoding and echo can only change while the link is closed",
                ));
            }
            transport.apply_line_settings(&config.line_settings())?;
        }
        self.timeout.set(config.timeout_ms);
        self.config = config;
        Ok(())
    }

    /// Name of the port as reported by the host, or the configured name
    pub fn descriptive_port_name(&self) -> String {
        match self.transport.as_ref() {
            Some(transport) => transport.port_name(),
            None => self.config.port.clone(),
        }
    }

    /// Ports the provider can currently reach
    pub fn available_ports(&self) -> Vec<String> {
        self.provider.available_ports()
    }
}

impl Drop for LinkConnection {
    fn drop(&mut self) {
        if self.transport.is_some() {
            warn!("Link on {} dropped while open", self.config.port);
        }
    }
}
