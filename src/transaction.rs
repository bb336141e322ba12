//! Request/response transactions
//!
//! A [`TransactionTemplate`] is handed out by a link or transport and carries
//! the exchange settings (transmit delay, retries, unit id check). Each
//! exchange begins a fresh [`Transaction`] from it, which is used once and
//! then dropped.

use std::time::Duration;

use tracing::debug;

use crate::error::{ModbusError, ModbusResult};
use crate::protocol::ModbusMessage;
use crate::transport::ModbusTransport;
use crate::utils::OperationTimer;

/// How a transaction ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionOutcome {
    Success,
    Timeout,
    IoError,
}

/// Exchange settings shared by every transaction begun from it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionTemplate {
    transmit_delay: Duration,
    retries: u32,
    check_unit_id: bool,
}

impl Default for TransactionTemplate {
    fn default() -> Self {
        Self {
            transmit_delay: Duration::from_millis(crate::DEFAULT_TRANSMIT_DELAY_MS),
            retries: crate::DEFAULT_RETRIES,
            check_unit_id: false,
        }
    }
}

impl TransactionTemplate {
    pub fn with_transmit_delay_ms(mut self, delay_ms: u64) -> Self {
        self.transmit_delay = Duration::from_millis(delay_ms);
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Reject responses from a different unit than the request addressed
    pub fn with_unit_id_check(mut self, check: bool) -> Self {
        self.check_unit_id = check;
        self
    }

    pub fn set_transmit_delay_ms(&mut self, delay_ms: u64) {
        self.transmit_delay = Duration::from_millis(delay_ms);
    }

    pub fn set_retries(&mut self, retries: u32) {
        self.retries = retries;
    }

    pub fn transmit_delay(&self) -> Duration {
        self.transmit_delay
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn checks_unit_id(&self) -> bool {
        self.check_unit_id
    }

    /// Start a transaction for `request`
    pub fn begin(&self, request: ModbusMessage) -> Transaction {
        Transaction {
            request,
            response: None,
            transmit_delay: self.transmit_delay,
            retries: self.retries,
            check_unit_id: self.check_unit_id,
            outcome: None,
            attempts: 0,
            elapsed: None,
        }
    }
}

/// One request/response exchange
#[derive(Debug)]
pub struct Transaction {
    request: ModbusMessage,
    response: Option<ModbusMessage>,
    transmit_delay: Duration,
    retries: u32,
    check_unit_id: bool,
    outcome: Option<TransactionOutcome>,
    attempts: u32,
    elapsed: Option<Duration>,
}

impl Transaction {
    pub fn request(&self) -> &ModbusMessage {
        &self.request
    }

    /// Response, absent until one was received
    pub fn response(&self) -> Option<&ModbusMessage> {
        self.response.as_ref()
    }

    pub fn take_response(&mut self) -> Option<ModbusMessage> {
        self.response.take()
    }

    pub fn outcome(&self) -> Option<TransactionOutcome> {
        self.outcome
    }

    pub fn transmit_delay(&self) -> Duration {
        self.transmit_delay
    }

    /// Number of send attempts made
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Wall time of `execute`, including the transmit delay
    pub fn elapsed(&self) -> Option<Duration> {
        self.elapsed
    }

    /// Run the exchange over `transport`
    ///
    /// Waits the transmit delay, sends the request and, unless it is a
    /// broadcast, waits for the response. Recoverable failures other than
    /// timeouts are retried up to the template's retry count. A transaction
    /// can only be executed once.
    pub async fn execute(&mut self, transport: &mut dyn ModbusTransport) -> ModbusResult<()> {
        if self.outcome.is_some() {
            return Err(ModbusError::internal("Transaction already executed"));
        }

        let timer = OperationTimer::start("transaction");
        let result = loop {
            self.attempts += 1;
            match self.attempt(transport).await {
                Ok(response) => break Ok(response),
                Err(e)
                    if self.attempts <= self.retries && e.is_recoverable() && !e.is_timeout() =>
                {
                    debug!("Transaction attempt {} failed, retrying: {}", self.attempts, e);
                }
                Err(e) => break Err(e),
            }
        };

        self.elapsed = Some(timer.stop_and_log(result.is_ok()));
        match result {
            Ok(response) => {
                self.response = response;
                self.outcome = Some(TransactionOutcome::Success);
                Ok(())
            }
            Err(e) => {
                self.outcome = Some(if e.is_timeout() {
                    TransactionOutcome::Timeout
                } else {
                    TransactionOutcome::IoError
                });
                Err(e)
            }
        }
    }

    async fn attempt(
        &self,
        transport: &mut dyn ModbusTransport,
    ) -> ModbusResult<Option<ModbusMessage>> {
        if !self.transmit_delay.is_zero() {
            tokio::time::sleep(self.transmit_delay).await;
        }

        transport.write_message(&self.request).await?;
        if self.request.is_broadcast() {
            return Ok(None);
        }

        let response = transport.read_message().await?;
        if self.check_unit_id && response.unit_id != self.request.unit_id {
            return Err(ModbusError::protocol_io(format!(
                "Response unit id mismatch: expected {}, got {}",
                self.request.unit_id, response.unit_id
            )));
        }
        Ok(Some(response))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;
    use crate::config::ConnectionConfig;
    use crate::memory::memory_pair;
    use crate::transport::{SerialTransport, SharedTimeout};

    fn transport(name: &str, timeout_ms: u64) -> (SerialTransport, crate::memory::MemoryPeer) {
        let (channel, peer) = memory_pair(name);
        let config = ConnectionConfig::new(name, 115200);
        (SerialTransport::new(Box::new(channel), &config, SharedTimeout::new(timeout_ms)), peer)
    }

    fn read_request() -> ModbusMessage {
        ModbusMessage::new(1, vec![0x03, 0x00, 0x00, 0x00, 0x01])
    }

    #[tokio::test]
    async fn test_successful_exchange() {
        let (mut transport, mut peer) = transport("tx-ok", 200);
        let template = transport.create_transaction();
        let mut transaction = template.begin(read_request());

        let responder = tokio::spawn(async move {
            peer.recv().await.unwrap();
            let reply = ModbusMessage::new(1, vec![0x03, 0x02, 0x12, 0x34]);
            peer.send(&codec::encode_rtu(&reply)).unwrap();
            peer
        });

        transaction.execute(&mut transport).await.unwrap();
        assert_eq!(transaction.outcome(), Some(TransactionOutcome::Success));
        assert_eq!(transaction.response().unwrap().pdu.as_ref(), &[0x03, 0x02, 0x12, 0x34]);
        assert_eq!(transaction.attempts(), 1);
        responder.await.unwrap();

        assert!(transaction.execute(&mut transport).await.is_err());
    }

    #[tokio::test]
    async fn test_broadcast_does_not_wait() {
        let (mut transport, mut peer) = transport("tx-broadcast", 5_000);
        let mut transaction = TransactionTemplate::default()
            .begin(ModbusMessage::new(0, vec![0x06, 0x00, 0x01, 0x00, 0x03]));

        let start = std::time::Instant::now();
        transaction.execute(&mut transport).await.unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(transaction.outcome(), Some(TransactionOutcome::Success));
        assert!(transaction.response().is_none());
        assert!(peer.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_unit_id_mismatch() {
        let (mut transport, mut peer) = transport("tx-mismatch", 200);
        let responder = tokio::spawn(async move {
            peer.recv().await.unwrap();
            let reply = ModbusMessage::new(9, vec![0x03, 0x02, 0x00, 0x00]);
            peer.send(&codec::encode_rtu(&reply)).unwrap();
            peer
        });

        let mut transaction = transport.create_transaction().begin(read_request());
        let err = transaction.execute(&mut transport).await.unwrap_err();
        assert!(err.is_protocol_io());
        assert_eq!(transaction.outcome(), Some(TransactionOutcome::IoError));
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_late_reply_is_not_paired_with_next_request() {
        let (mut transport, mut peer) = transport("tx-late", 50);
        let template = transport.create_transaction();

        let mut first = template.begin(read_request());
        assert!(first.execute(&mut transport).await.unwrap_err().is_timeout());

        peer.recv().await.unwrap();
        let late = ModbusMessage::new(1, vec![0x03, 0x02, 0xAA, 0xAA]);
        peer.send(&codec::encode_rtu(&late)).unwrap();

        let responder = tokio::spawn(async move {
            peer.recv().await.unwrap();
            let reply = ModbusMessage::new(1, vec![0x03, 0x02, 0xBB, 0xBB]);
            peer.send(&codec::encode_rtu(&reply)).unwrap();
            peer
        });

        let mut second = template.begin(read_request());
        second.execute(&mut transport).await.unwrap();
        assert_eq!(second.outcome(), Some(TransactionOutcome::Success));
        assert_eq!(second.response().unwrap().pdu.as_ref(), &[0x03, 0x02, 0xBB, 0xBB]);
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_retry_after_bad_frame() {
        let (mut transport, mut peer) = transport("tx-retry", 200);
        let responder = tokio::spawn(async move {
            peer.recv().await.unwrap();
            peer.send(&[0x01, 0x03, 0x02, 0x00, 0x00, 0xFF, 0xFF]).unwrap();
            peer.recv().await.unwrap();
            let reply = ModbusMessage::new(1, vec![0x03, 0x02, 0x00, 0x2A]);
            peer.send(&codec::encode_rtu(&reply)).unwrap();
            peer
        });

        let mut transaction = transport.create_transaction().with_retries(1).begin(read_request());
        transaction.execute(&mut transport).await.unwrap();
        assert_eq!(transaction.attempts(), 2);
        assert_eq!(transaction.response().unwrap().pdu.as_ref(), &[0x03, 0x02, 0x00, 0x2A]);
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_timeout_is_not_retried() {
        let (mut transport, _peer) = transport("tx-timeout", 20);
        let mut transaction = transport
            .create_transaction()
            .with_retries(3)
            .with_transmit_delay_ms(2)
            .begin(read_request());

        let err = transaction.execute(&mut transport).await.unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(transaction.outcome(), Some(TransactionOutcome::Timeout));
        assert_eq!(transaction.attempts(), 1);
        assert!(transaction.elapsed().unwrap() >= Duration::from_millis(22));
    }
}
