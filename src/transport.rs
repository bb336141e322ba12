//! # Modbus Frame Transport
//!
//! A transport turns a byte stream into whole Modbus frames and back. One
//! transport is bound to an open link at a time and owns its byte channel.
//!
//! ## Serial framing
//!
//! ### RTU
//! - Binary frame `unit | pdu | crc`
//! - Frame boundary is a silent interval of 3.5 character times
//!   (1.75 ms fixed above 19200 baud)
//!
//! ### ASCII
//! - Hex text frame `: ... LRC CR LF`
//! - Noise before the `:` start character is discarded
//!
//! ## Timeouts
//!
//! The read timeout is shared with the owning
//! [`LinkConnection`](crate::link::LinkConnection) through a [`SharedTimeout`];
//! a change on either side applies to the next read. A timeout of 0 makes
//! reads non-blocking and leaves writes unbounded.
//!
//! ## Echo suppression
//!
//! Half-duplex lines often echo every transmitted byte. With echo enabled the
//! transport reads back exactly the bytes it wrote and discards them, failing
//! the exchange if they differ.
//!
//! ## Example
//!
//! ```rust
//! use modbus_link::config::ConnectionConfig;
//! use modbus_link::memory::memory_pair;
//! use modbus_link::protocol::ModbusMessage;
//! use modbus_link::transport::{ModbusTransport, SerialTransport, SharedTimeout};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let (channel, mut peer) = memory_pair("mem0");
//! let config = ConnectionConfig::new("mem0", 115200);
//! let mut transport = SerialTransport::new(Box::new(channel), &config, SharedTimeout::new(100));
//!
//! transport.write_message(&ModbusMessage::new(1, vec![0x03, 0x00, 0x00, 0x00, 0x02])).await?;
//! let sent = peer.recv().await.unwrap();
//! assert_eq!(sent.as_ref(), &[0x01, 0x03, 0x00, 0x00, 0x00, 0x02, 0xC4, 0x0B]);
//! # Ok(())
//! # }
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, info};

use crate::channel::ByteChannel;
use crate::codec::{self, ASCII_END, ASCII_START};
use crate::config::{ConnectionConfig, FrameEncoding, LineSettings};
use crate::error::{ModbusError, ModbusResult};
use crate::logging::{CallbackLogger, LogLevel};
use crate::protocol::ModbusMessage;
use crate::transaction::TransactionTemplate;
use crate::utils::{format::bytes_to_hex, timing};
use crate::{MAX_ASCII_FRAME_SIZE, MAX_RTU_FRAME_SIZE};

/// Read timeout in milliseconds shared between a link and its transport
#[derive(Debug, Clone)]
pub struct SharedTimeout(Arc<AtomicU64>);

impl SharedTimeout {
    pub fn new(timeout_ms: u64) -> Self {
        Self(Arc::new(AtomicU64::new(timeout_ms)))
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }

    pub fn set(&self, timeout_ms: u64) {
        self.0.store(timeout_ms, Ordering::SeqCst);
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.get())
    }
}

impl Default for SharedTimeout {
    fn default() -> Self {
        Self::new(crate::DEFAULT_TIMEOUT_MS)
    }
}

/// Transport layer abstraction over whole Modbus frames
///
/// Implemented by the serial RTU/ASCII transport and the MBAP stream
/// transport. Request handlers and transactions only see this trait.
#[async_trait]
pub trait ModbusTransport: Send {
    /// Encode and send one message
    ///
    /// # Errors
    ///
    /// - `ModbusError::Timeout` - the channel did not accept the frame in time
    /// - `ModbusError::ProtocolIo` - short write or echo mismatch
    /// - `ModbusError::Connection` - the transport was closed
    async fn write_message(&mut self, message: &ModbusMessage) -> ModbusResult<()>;

    /// Receive and decode one message
    ///
    /// # Errors
    ///
    /// - `ModbusError::Timeout` - no frame started within the timeout
    /// - `ModbusError::ProtocolIo` - malformed frame, or `eof` when the
    ///   peer closed the stream
    async fn read_message(&mut self) -> ModbusResult<ModbusMessage>;

    /// Current read timeout in milliseconds
    fn timeout(&self) -> u64;

    fn set_timeout(&mut self, timeout_ms: u64);

    /// Get communication statistics
    fn get_stats(&self) -> TransportStats;

    /// Fresh transaction template suited to this transport
    fn create_transaction(&self) -> TransactionTemplate {
        TransactionTemplate::default()
    }

    /// Release the underlying channel; idempotent
    async fn close(&mut self);
}

/// Transport layer statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub errors: u64,
    pub timeouts: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// RTU/ASCII transport over a byte channel
pub struct SerialTransport {
    channel: Box<dyn ByteChannel>,
    encoding: FrameEncoding,
    echo: bool,
    timeout: SharedTimeout,
    /// RTU end-of-frame silence
    frame_gap: Duration,
    stats: TransportStats,
    packet_logging: bool,
    logger: CallbackLogger,
    /// Bytes read from the channel but not yet consumed
    rx_buf: BytesMut,
    closed: bool,
}

impl SerialTransport {
    /// Bind a transport to an open channel
    pub fn new(
        channel: Box<dyn ByteChannel>,
        config: &ConnectionConfig,
        timeout: SharedTimeout,
    ) -> Self {
        Self {
            channel,
            encoding: config.encoding,
            echo: config.echo,
            timeout,
            frame_gap: timing::frame_gap(config.baud_rate),
            stats: TransportStats::default(),
            packet_logging: false,
            logger: CallbackLogger::disabled(),
            rx_buf: BytesMut::with_capacity(MAX_ASCII_FRAME_SIZE),
            closed: false,
        }
    }

    pub fn encoding(&self) -> FrameEncoding {
        self.encoding
    }

    pub fn echo(&self) -> bool {
        self.echo
    }

    pub fn frame_gap(&self) -> Duration {
        self.frame_gap
    }

    pub fn port_name(&self) -> String {
        self.channel.port_name()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Enable or disable packet logging
    pub fn set_packet_logging(&mut self, enabled: bool) {
        self.packet_logging = enabled;
    }

    /// Report frames to a callback logger as well as `tracing`
    pub fn set_logger(&mut self, logger: CallbackLogger) {
        self.logger = logger;
    }

    /// Apply new line parameters to the live channel
    pub fn apply_line_settings(&mut self, settings: &LineSettings) -> ModbusResult<()> {
        self.ensure_open()?;
        self.channel.apply_line_settings(settings)?;
        self.frame_gap = timing::frame_gap(settings.baud_rate);
        Ok(())
    }

    fn ensure_open(&self) -> ModbusResult<()> {
        if self.closed {
            return Err(ModbusError::connection("Transport is closed"));
        }
        Ok(())
    }

    fn log_frame(&self, direction: &str, frame: &[u8]) {
        if self.packet_logging {
            info!("[MODBUS-{}] {} {}", self.encoding, direction, bytes_to_hex(frame));
        }
        self.logger.log_frame(LogLevel::Info, direction, self.encoding.as_str(), frame);
    }

    /// Read one chunk from the channel into the receive buffer
    ///
    /// Returns `None` if `deadline` passed first and `Some(0)` at end of data.
    async fn fill(&mut self, deadline: Instant) -> ModbusResult<Option<usize>> {
        let mut chunk = [0u8; 256];
        match timeout_at(deadline, self.channel.read(&mut chunk)).await {
            Ok(Ok(n)) => {
                self.rx_buf.extend_from_slice(&chunk[..n]);
                Ok(Some(n))
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Ok(None),
        }
    }

    /// Read up to `buf.len()` bytes, waiting at most the current timeout
    ///
    /// A short count means the channel reached end of data or the timeout
    /// elapsed; neither is an error here.
    pub async fn read_bytes(&mut self, buf: &mut [u8]) -> ModbusResult<usize> {
        self.ensure_open()?;
        let deadline = Instant::now() + self.timeout.duration();

        while self.rx_buf.len() < buf.len() {
            match self.fill(deadline).await? {
                Some(0) | None => break,
                Some(_) => {}
            }
        }

        let count = buf.len().min(self.rx_buf.len());
        buf[..count].copy_from_slice(&self.rx_buf[..count]);
        self.rx_buf.advance(count);
        Ok(count)
    }

    /// Write `buf` with a single channel write, returning the accepted count
    pub async fn write_bytes(&mut self, buf: &[u8]) -> ModbusResult<usize> {
        self.ensure_open()?;
        let timeout_ms = self.timeout.get();
        if timeout_ms == 0 {
            return self.channel.write(buf).await;
        }

        match timeout(Duration::from_millis(timeout_ms), self.channel.write(buf)).await {
            Ok(result) => result,
            Err(_) => {
                self.stats.timeouts += 1;
                Err(ModbusError::timeout("write", timeout_ms))
            }
        }
    }

    /// Bytes readable without waiting
    pub fn bytes_available(&mut self) -> ModbusResult<usize> {
        self.ensure_open()?;
        Ok(self.rx_buf.len() + self.channel.bytes_available()?)
    }

    async fn consume_echo(&mut self, frame: &[u8]) -> ModbusResult<()> {
        let mut echo = vec![0u8; frame.len()];
        let n = self.read_bytes(&mut echo).await?;
        if n < frame.len() {
            return Err(ModbusError::protocol_io(format!(
                "Echo incomplete: {} of {} bytes",
                n,
                frame.len()
            )));
        }
        if echo != frame {
            return Err(ModbusError::protocol_io(format!(
                "Echo mismatch: sent {} received {}",
                bytes_to_hex(frame),
                bytes_to_hex(&echo)
            )));
        }
        Ok(())
    }

    async fn read_rtu_frame(&mut self) -> ModbusResult<Bytes> {
        let timeout_ms = self.timeout.get();
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);

        while self.rx_buf.is_empty() {
            match self.fill(deadline).await? {
                Some(0) => {
                    return Err(ModbusError::end_of_stream(
                        "Channel closed while waiting for RTU frame",
                    ))
                }
                Some(_) => {}
                None => return Err(ModbusError::timeout("read RTU frame", timeout_ms)),
            }
        }

        // The frame ends at the first silent interval
        loop {
            if self.rx_buf.len() > MAX_RTU_FRAME_SIZE {
                let len = self.rx_buf.len();
                self.rx_buf.clear();
                return Err(ModbusError::frame(format!("RTU frame too large: {} bytes", len)));
            }
            match self.fill(Instant::now() + self.frame_gap).await? {
                Some(0) | None => break,
                Some(_) => {}
            }
        }

        Ok(self.rx_buf.split().freeze())
    }

    async fn read_ascii_frame(&mut self) -> ModbusResult<Bytes> {
        let timeout_ms = self.timeout.get();
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);

        loop {
            match self.rx_buf.iter().position(|&b| b == ASCII_START) {
                Some(start) => {
                    if start > 0 {
                        debug!("Discarding {} bytes before ASCII start", start);
                        self.rx_buf.advance(start);
                    }
                    if let Some(end) = self.rx_buf.windows(2).position(|w| w == ASCII_END) {
                        return Ok(self.rx_buf.split_to(end + 2).freeze());
                    }
                    if self.rx_buf.len() > MAX_ASCII_FRAME_SIZE {
                        self.rx_buf.clear();
                        return Err(ModbusError::frame("ASCII frame too large"));
                    }
                }
                None => self.rx_buf.clear(),
            }

            match self.fill(deadline).await? {
                Some(0) => {
                    return Err(ModbusError::end_of_stream(
                        "Channel closed while reading ASCII frame",
                    ))
                }
                Some(_) => {}
                None => return Err(ModbusError::timeout("read ASCII frame", timeout_ms)),
            }
        }
    }

    fn record_error(&mut self, error: &ModbusError) {
        self.stats.errors += 1;
        if error.is_timeout() {
            self.stats.timeouts += 1;
        }
    }
}

#[async_trait]
impl ModbusTransport for SerialTransport {
    async fn write_message(&mut self, message: &ModbusMessage) -> ModbusResult<()> {
        let frame = match self.encoding {
            FrameEncoding::Rtu => codec::encode_rtu(message),
            FrameEncoding::Ascii => codec::encode_ascii(message),
        };

        self.ensure_open()?;
        // Unread input belongs to an earlier exchange, such as a late reply
        self.rx_buf.clear();
        let stale = self.channel.clear_input()?;
        if stale > 0 {
            debug!("Discarded {} stale bytes from {}", stale, self.channel.port_name());
        }
        self.log_frame("send", &frame);

        let written = match self.write_bytes(&frame).await {
            Ok(n) => n,
            Err(e) => {
                self.stats.errors += 1;
                return Err(e);
            }
        };
        if written != frame.len() {
            self.stats.errors += 1;
            return Err(ModbusError::protocol_io(format!(
                "Short write: {} of {} bytes",
                written,
                frame.len()
            )));
        }
        self.stats.frames_sent += 1;
        self.stats.bytes_sent += frame.len() as u64;

        if self.echo {
            if let Err(e) = self.consume_echo(&frame).await {
                self.record_error(&e);
                return Err(e);
            }
        }
        Ok(())
    }

    async fn read_message(&mut self) -> ModbusResult<ModbusMessage> {
        self.ensure_open()?;
        let frame = match self.encoding {
            FrameEncoding::Rtu => self.read_rtu_frame().await,
            FrameEncoding::Ascii => self.read_ascii_frame().await,
        };
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                self.record_error(&e);
                return Err(e.into_protocol_io());
            }
        };

        self.log_frame("receive", &frame);
        self.stats.frames_received += 1;
        self.stats.bytes_received += frame.len() as u64;

        let decoded = match self.encoding {
            FrameEncoding::Rtu => codec::decode_rtu(&frame),
            FrameEncoding::Ascii => codec::decode_ascii(&frame),
        };
        decoded.map_err(|e| {
            self.stats.errors += 1;
            e.into_protocol_io()
        })
    }

    fn timeout(&self) -> u64 {
        self.timeout.get()
    }

    fn set_timeout(&mut self, timeout_ms: u64) {
        self.timeout.set(timeout_ms);
    }

    fn get_stats(&self) -> TransportStats {
        self.stats.clone()
    }

    fn create_transaction(&self) -> TransactionTemplate {
        TransactionTemplate::default().with_unit_id_check(true)
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.rx_buf.clear();
            self.channel.close().await;
            debug!("{} transport on {} closed", self.encoding, self.channel.port_name());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{memory_pair, MemoryPeer};

    fn rtu_transport(timeout_ms: u64) -> (SerialTransport, MemoryPeer) {
        let (channel, peer) = memory_pair("mem-rtu");
        let config = ConnectionConfig::new("mem-rtu", 115200);
        (SerialTransport::new(Box::new(channel), &config, SharedTimeout::new(timeout_ms)), peer)
    }

    fn ascii_transport(timeout_ms: u64) -> (SerialTransport, MemoryPeer) {
        let (channel, peer) = memory_pair("mem-ascii");
        let config = ConnectionConfig::ascii("mem-ascii", 19200);
        (SerialTransport::new(Box::new(channel), &config, SharedTimeout::new(timeout_ms)), peer)
    }

    #[tokio::test]
    async fn test_rtu_read_frame() {
        let (mut transport, peer) = rtu_transport(200);
        peer.send(&[0x01, 0x03, 0x04, 0x00, 0x0A]).unwrap();
        peer.send(&[0x00, 0x0B]).unwrap();
        let crc = codec::calculate_crc(&[0x01, 0x03, 0x04, 0x00, 0x0A, 0x00, 0x0B]);
        peer.send(&crc.to_le_bytes()).unwrap();

        let msg = transport.read_message().await.unwrap();
        assert_eq!(msg.unit_id, 1);
        assert_eq!(msg.pdu.as_ref(), &[0x03, 0x04, 0x00, 0x0A, 0x00, 0x0B]);

        let stats = transport.get_stats();
        assert_eq!(stats.frames_received, 1);
        assert_eq!(stats.bytes_received, 9);
    }

    #[tokio::test]
    async fn test_rtu_crc_error_is_recoverable() {
        let (mut transport, peer) = rtu_transport(200);
        peer.send(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x02, 0x00, 0x00]).unwrap();

        let err = transport.read_message().await.unwrap_err();
        assert!(matches!(err, ModbusError::ProtocolIo { eof: false, .. }));
        assert!(err.is_recoverable());
        assert_eq!(transport.get_stats().errors, 1);
    }

    #[tokio::test]
    async fn test_rtu_timeout_on_silent_peer() {
        let (mut transport, _peer) = rtu_transport(30);
        let start = std::time::Instant::now();
        let err = transport.read_message().await.unwrap_err();
        assert!(err.is_timeout());
        assert!(start.elapsed() >= Duration::from_millis(30));
        assert_eq!(transport.get_stats().timeouts, 1);
    }

    #[tokio::test]
    async fn test_eof_when_peer_drops() {
        let (mut transport, peer) = rtu_transport(200);
        drop(peer);
        let err = transport.read_message().await.unwrap_err();
        assert!(err.is_eof());
    }

    #[tokio::test]
    async fn test_ascii_skips_noise_and_keeps_lookahead() {
        let (mut transport, peer) = ascii_transport(200);
        peer.send(b"\x00\xFFjunk:01030000000AF2\r").unwrap();
        peer.send(b"\n:01030000000AF2\r\n").unwrap();

        let first = transport.read_message().await.unwrap();
        assert_eq!(first.pdu.as_ref(), &[0x03, 0x00, 0x00, 0x00, 0x0A]);
        let second = transport.read_message().await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_ascii_write() {
        let (mut transport, mut peer) = ascii_transport(200);
        let msg = ModbusMessage::new(0x01, vec![0x03, 0x00, 0x00, 0x00, 0x0A]);
        transport.write_message(&msg).await.unwrap();
        assert_eq!(peer.recv().await.unwrap().as_ref(), b":01030000000AF2\r\n");
    }

    #[tokio::test]
    async fn test_echo_is_discarded() {
        let (channel, mut peer) = memory_pair("mem-echo");
        let channel = channel.with_echo(true);
        let config = ConnectionConfig::new("mem-echo", 115200).with_echo(true);
        let shared = SharedTimeout::new(200);
        let mut transport = SerialTransport::new(Box::new(channel), &config, shared);

        let request = ModbusMessage::new(0x02, vec![0x06, 0x00, 0x01, 0x00, 0x03]);
        transport.write_message(&request).await.unwrap();
        assert!(peer.recv().await.is_some());

        let response = ModbusMessage::new(0x02, vec![0x06, 0x00, 0x01, 0x00, 0x03]);
        peer.send(&codec::encode_rtu(&response)).unwrap();
        assert_eq!(transport.read_message().await.unwrap(), response);
    }

    #[tokio::test]
    async fn test_echo_mismatch() {
        let (channel, mut peer) = memory_pair("mem-echo-bad");
        let config = ConnectionConfig::new("mem-echo-bad", 115200).with_echo(true);
        let shared = SharedTimeout::new(100);
        let mut transport = SerialTransport::new(Box::new(channel), &config, shared);

        let line = tokio::spawn(async move {
            peer.recv().await.unwrap();
            peer.send(&[0xFF; 8]).unwrap();
            peer
        });
        let err = transport
            .write_message(&ModbusMessage::new(1, vec![0x03, 0x00, 0x00, 0x00, 0x02]))
            .await
            .unwrap_err();
        assert!(matches!(err, ModbusError::ProtocolIo { eof: false, .. }));
        line.await.unwrap();
    }

    #[tokio::test]
    async fn test_write_discards_late_reply() {
        let (mut transport, mut peer) = rtu_transport(50);
        let request = ModbusMessage::new(1, vec![0x03, 0x00, 0x00, 0x00, 0x01]);

        transport.write_message(&request).await.unwrap();
        assert!(transport.read_message().await.unwrap_err().is_timeout());

        // The first reply turns up after its read gave up
        peer.recv().await.unwrap();
        let late = ModbusMessage::new(1, vec![0x03, 0x02, 0xAA, 0xAA]);
        peer.send(&codec::encode_rtu(&late)).unwrap();

        let responder = tokio::spawn(async move {
            peer.recv().await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            let reply = ModbusMessage::new(1, vec![0x03, 0x02, 0xBB, 0xBB]);
            peer.send(&codec::encode_rtu(&reply)).unwrap();
            peer
        });

        transport.write_message(&request).await.unwrap();
        let response = transport.read_message().await.unwrap();
        assert_eq!(response.pdu.as_ref(), &[0x03, 0x02, 0xBB, 0xBB]);
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_read_bytes_is_bounded() {
        let (mut transport, peer) = rtu_transport(50);
        peer.send(&[1, 2, 3, 4, 5]).unwrap();

        let mut buf = [0u8; 3];
        assert_eq!(transport.read_bytes(&mut buf).await.unwrap(), 3);
        assert_eq!(buf, [1, 2, 3]);

        let mut buf = [0u8; 10];
        assert_eq!(transport.read_bytes(&mut buf).await.unwrap(), 2);
        assert_eq!(&buf[..2], &[4, 5]);
    }

    #[tokio::test]
    async fn test_zero_timeout_is_non_blocking() {
        let (mut transport, _peer) = rtu_transport(0);
        let start = std::time::Instant::now();
        let mut buf = [0u8; 4];
        assert_eq!(transport.read_bytes(&mut buf).await.unwrap(), 0);
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_shared_timeout() {
        let shared = SharedTimeout::new(100);
        let (channel, _peer) = memory_pair("mem-shared");
        let config = ConnectionConfig::new("mem-shared", 9600);
        let mut transport = SerialTransport::new(Box::new(channel), &config, shared.clone());

        shared.set(250);
        assert_eq!(transport.timeout(), 250);
        transport.set_timeout(10);
        assert_eq!(shared.get(), 10);
    }

    #[tokio::test]
    async fn test_closed_transport_rejects_io() {
        let (mut transport, _peer) = rtu_transport(50);
        transport.close().await;
        transport.close().await;
        assert!(transport.is_closed());
        assert!(matches!(
            transport.read_message().await,
            Err(ModbusError::Connection { .. })
        ));
        assert!(transport.write_bytes(&[1]).await.is_err());
    }
}
