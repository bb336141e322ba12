//! Request-handling contract shared by the serial and stream listeners

use async_trait::async_trait;
use tracing::debug;

use crate::error::ModbusResult;
use crate::listener::ListenerHandle;
use crate::protocol::{ModbusException, ModbusMessage};
use crate::transport::ModbusTransport;

/// Performs one read-request/write-response cycle
///
/// Listeners call this in a loop. Returning a recoverable protocol I/O error
/// keeps the loop alive; an end-of-stream error ends a stream connection;
/// anything else stops the listener.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle_request(
        &self,
        transport: &mut dyn ModbusTransport,
        listener: &ListenerHandle,
    ) -> ModbusResult<()>;
}

/// Answers every addressed request with a fixed exception
///
/// Broadcasts are read and left unanswered.
#[derive(Debug, Clone, Copy)]
pub struct ExceptionResponder {
    exception: ModbusException,
}

impl ExceptionResponder {
    pub fn new(exception: ModbusException) -> Self {
        Self { exception }
    }
}

impl Default for ExceptionResponder {
    fn default() -> Self {
        Self::new(ModbusException::IllegalFunction)
    }
}

#[async_trait]
impl RequestHandler for ExceptionResponder {
    async fn handle_request(
        &self,
        transport: &mut dyn ModbusTransport,
        listener: &ListenerHandle,
    ) -> ModbusResult<()> {
        let request = transport.read_message().await?;
        debug!("{} received {}", listener.name(), request);
        if request.is_broadcast() {
            return Ok(());
        }

        let function = request.function_code().unwrap_or(0);
        let response = ModbusMessage::exception(request.unit_id, function, self.exception)
            .with_transaction_id(request.transaction_id);
        transport.write_message(&response).await
    }
}

/// Sends every request back unchanged
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoResponder;

#[async_trait]
impl RequestHandler for EchoResponder {
    async fn handle_request(
        &self,
        transport: &mut dyn ModbusTransport,
        _listener: &ListenerHandle,
    ) -> ModbusResult<()> {
        let request = transport.read_message().await?;
        if request.is_broadcast() {
            return Ok(());
        }
        transport.write_message(&request).await
    }
}
