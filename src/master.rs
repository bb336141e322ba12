/// Serial master facade
///
/// `ModbusSerialMaster` owns a [`LinkConnection`] and binds a transaction
/// template to it on connect. Requests are sent one at a time; every call to
/// [`send`](ModbusSerialMaster::send) runs one fresh [`Transaction`].

use std::sync::Arc;

use tracing::{debug, info};

use crate::channel::ChannelProvider;
use crate::config::ConnectionConfig;
use crate::error::{ModbusError, ModbusResult};
use crate::link::LinkConnection;
use crate::logging::CallbackLogger;
use crate::protocol::ModbusMessage;
use crate::transaction::{Transaction, TransactionTemplate};
use crate::transport::SerialTransport;

/// Facade options applied to each transaction template on connect
#[derive(Debug, Clone, Default)]
pub struct MasterOptions {
    /// Delay before each transmission; `None` keeps the transport default
    pub transmit_delay_ms: Option<u64>,
    /// Retries for recoverable failures; `None` keeps the transport default
    pub retries: Option<u32>,
    pub packet_logging: bool,
}

/// Master side of a serial link
pub struct ModbusSerialMaster {
    connection: LinkConnection,
    transaction: Option<TransactionTemplate>,
    timeout_ms: u64,
    options: MasterOptions,
    logger: Option<CallbackLogger>,
}

impl ModbusSerialMaster {
    pub fn new(config: ConnectionConfig, provider: Arc<dyn ChannelProvider>) -> Self {
        Self::with_options(config, provider, MasterOptions::default())
    }

    /// Master over a host serial port
    pub fn serial(config: ConnectionConfig) -> Self {
        Self::from_connection(LinkConnection::serial(config), MasterOptions::default())
    }

    pub fn with_options(
        config: ConnectionConfig,
        provider: Arc<dyn ChannelProvider>,
        options: MasterOptions,
    ) -> Self {
        Self::from_connection(LinkConnection::new(config, provider), options)
    }

    pub fn from_connection(mut connection: LinkConnection, options: MasterOptions) -> Self {
        connection.set_packet_logging(options.packet_logging);
        Self {
            timeout_ms: connection.timeout(),
            connection,
            transaction: None,
            options,
            logger: None,
        }
    }

    /// Report frames to `logger` once connected
    pub fn with_logger(mut self, logger: CallbackLogger) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Open the link and bind a transaction template
    ///
    /// Does nothing if already connected. On failure the master stays
    /// disconnected and no template is installed.
    pub async fn connect(&mut self) -> ModbusResult<()> {
        if self.connection.is_open() {
            return Ok(());
        }

        self.connection.open().await?;
        let mut template = self.connection.create_transaction()?;
        if let Some(delay) = self.options.transmit_delay_ms {
            template.set_transmit_delay_ms(delay);
        }
        if let Some(retries) = self.options.retries {
            template.set_retries(retries);
        }
        if let (Some(logger), Some(transport)) =
            (self.logger.clone(), self.connection.transport_mut())
        {
            transport.set_logger(logger);
        }

        info!("Master connected on {}", self.connection.descriptive_port_name());
        self.transaction = Some(template);
        Ok(())
    }

    /// Close the link and drop the transaction template; never fails
    pub async fn disconnect(&mut self) {
        if !self.connection.is_open() {
            return;
        }
        self.connection.close().await;
        self.transaction = None;
        debug!("Master disconnected");
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_open()
    }

    pub fn timeout(&self) -> u64 {
        self.timeout_ms
    }

    /// Set the response timeout, kept across reconnects
    pub fn set_timeout(&mut self, timeout_ms: u64) {
        self.timeout_ms = timeout_ms;
        self.connection.set_timeout(timeout_ms);
    }

    /// Set the transmit delay for transactions begun from now on
    pub fn set_transmit_delay_ms(&mut self, delay_ms: u64) {
        self.options.transmit_delay_ms = Some(delay_ms);
        if let Some(template) = self.transaction.as_mut() {
            template.set_transmit_delay_ms(delay_ms);
        }
    }

    pub fn connection(&self) -> &LinkConnection {
        &self.connection
    }

    pub fn connection_mut(&mut self) -> &mut LinkConnection {
        &mut self.connection
    }

    pub fn transport_mut(&mut self) -> Option<&mut SerialTransport> {
        self.connection.transport_mut()
    }

    /// Transaction template bound by the last connect
    pub fn transaction(&self) -> Option<&TransactionTemplate> {
        self.transaction.as_ref()
    }

    /// Begin a transaction for `request` from the bound template
    pub fn new_transaction(&self, request: ModbusMessage) -> ModbusResult<Transaction> {
        self.transaction
            .as_ref()
            .map(|template| template.begin(request))
            .ok_or_else(|| ModbusError::connection("Master is not connected"))
    }

    /// Run `transaction` over the bound transport
    pub async fn execute(&mut self, transaction: &mut Transaction) -> ModbusResult<()> {
        let transport = self
            .connection
            .transport_mut()
            .ok_or_else(|| ModbusError::connection("Master is not connected"))?;
        transaction.execute(transport).await
    }

    /// Send `request` and wait for its response
    ///
    /// Returns `None` for broadcasts.
    pub async fn send(&mut self, request: ModbusMessage) -> ModbusResult<Option<ModbusMessage>> {
        let mut transaction = self.new_transaction(request)?;
        self.execute(&mut transaction).await?;
        Ok(transaction.take_response())
    }
}
