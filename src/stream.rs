//! Stream (TCP) transport and per-connection handling
//!
//! - [`TcpTransport`]: MBAP framing over any `AsyncRead + AsyncWrite` stream
//! - [`StreamConnectionHandler`]: runs the request handler on one accepted
//!   connection until the peer disconnects or the listener stops
//! - [`ModbusTcpListener`]: accept loop spawning one handler per connection

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;
use tracing::{debug, error, info, info_span, warn, Instrument};

use async_trait::async_trait;

use crate::codec::{self, MBAP_HEADER_LEN};
use crate::error::{ModbusError, ModbusResult};
use crate::handler::RequestHandler;
use crate::listener::ListenerHandle;
use crate::protocol::ModbusMessage;
use crate::transport::{ModbusTransport, SharedTimeout, TransportStats};
use crate::utils::format::bytes_to_hex;
use crate::MAX_TCP_FRAME_SIZE;

/// First pause after a failed accept
const ACCEPT_BACKOFF: Duration = Duration::from_millis(10);

/// Longest pause between accept attempts
const MAX_ACCEPT_BACKOFF: Duration = Duration::from_secs(1);

/// Pause before the next accept, doubling with each consecutive failure
fn accept_backoff(failures: u32) -> Duration {
    let doublings = failures.saturating_sub(1).min(16);
    (ACCEPT_BACKOFF * 2u32.pow(doublings)).min(MAX_ACCEPT_BACKOFF)
}

/// Modbus TCP transport over a byte stream
///
/// Reads wait for the next frame up to the timeout; a timeout of 0 waits
/// indefinitely, which suits server connections with idle clients.
pub struct TcpTransport<S = TcpStream> {
    stream: Option<S>,
    peer: String,
    timeout: SharedTimeout,
    stats: TransportStats,
    packet_logging: bool,
}

impl TcpTransport<TcpStream> {
    /// Connect to a Modbus TCP device
    ///
    /// A timeout of 0 waits for the connection as long as the host allows.
    pub async fn connect(address: SocketAddr, timeout_ms: u64) -> ModbusResult<Self> {
        let connecting = TcpStream::connect(address);
        let connected = if timeout_ms == 0 {
            connecting.await
        } else {
            timeout(Duration::from_millis(timeout_ms), connecting)
                .await
                .map_err(|_| ModbusError::timeout(format!("connect to {}", address), timeout_ms))?
        };
        let stream = connected
            .map_err(|e| ModbusError::link_unavailable(address.to_string(), e.to_string()))?;
        // Modbus frames are small, send them immediately
        let _ = stream.set_nodelay(true);
        Ok(Self::new(stream, address.to_string(), SharedTimeout::new(timeout_ms)))
    }
}

impl<S> TcpTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new<P: Into<String>>(stream: S, peer: P, timeout: SharedTimeout) -> Self {
        Self {
            stream: Some(stream),
            peer: peer.into(),
            timeout,
            stats: TransportStats::default(),
            packet_logging: false,
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.stream.is_none()
    }

    /// Enable or disable packet logging
    pub fn set_packet_logging(&mut self, enabled: bool) {
        self.packet_logging = enabled;
    }

    fn stream_mut(&mut self) -> ModbusResult<&mut S> {
        let peer = &self.peer;
        self.stream
            .as_mut()
            .ok_or_else(|| ModbusError::connection(format!("Connection to {} is closed", peer)))
    }

    /// Read the rest of a frame once its first byte has arrived
    async fn read_body(&mut self, buf: &mut [u8]) -> ModbusResult<()> {
        let timeout_ms = self.timeout.get();
        let stream = self.stream_mut()?;
        if timeout_ms == 0 {
            stream.read_exact(buf).await?;
            return Ok(());
        }
        match timeout(Duration::from_millis(timeout_ms), stream.read_exact(buf)).await {
            Ok(result) => {
                result?;
                Ok(())
            }
            // The stream cannot be resynchronised after a partial frame
            Err(_) => Err(ModbusError::io(format!(
                "Timed out inside MBAP frame after {}ms",
                timeout_ms
            ))),
        }
    }

    async fn read_frame(&mut self) -> ModbusResult<ModbusMessage> {
        let timeout_ms = self.timeout.get();
        let mut raw = [0u8; MBAP_HEADER_LEN];

        let stream = self.stream_mut()?;
        let first = if timeout_ms == 0 {
            stream.read(&mut raw[..1]).await?
        } else {
            timeout(Duration::from_millis(timeout_ms), stream.read(&mut raw[..1]))
                .await
                .map_err(|_| ModbusError::timeout("read MBAP frame", timeout_ms))??
        };
        if first == 0 {
            return Err(ModbusError::end_of_stream(format!("{} closed the connection", self.peer)));
        }
        self.read_body(&mut raw[1..]).await?;

        let header = match codec::decode_mbap_header(&raw) {
            Ok(header) => header,
            Err(e) => {
                // Skip the body if the length field can still be trusted
                let length = u16::from_be_bytes([raw[4], raw[5]]) as usize;
                if length >= 2 && MBAP_HEADER_LEN - 1 + length <= MAX_TCP_FRAME_SIZE {
                    let mut discard = vec![0u8; length - 1];
                    self.read_body(&mut discard).await?;
                    return Err(e.into_protocol_io());
                }
                return Err(ModbusError::io(format!("Cannot resynchronise MBAP stream: {}", e)));
            }
        };

        let mut pdu = vec![0u8; header.pdu_len];
        self.read_body(&mut pdu).await?;

        if self.packet_logging {
            info!("[MODBUS-TCP] receive {} {}", bytes_to_hex(&raw), bytes_to_hex(&pdu));
        }
        self.stats.frames_received += 1;
        self.stats.bytes_received += (MBAP_HEADER_LEN + pdu.len()) as u64;

        Ok(ModbusMessage::new(header.unit_id, pdu).with_transaction_id(header.transaction_id))
    }
}

#[async_trait]
impl<S> ModbusTransport for TcpTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn write_message(&mut self, message: &ModbusMessage) -> ModbusResult<()> {
        let frame = codec::encode_mbap(message);
        if self.packet_logging {
            info!("[MODBUS-TCP] send {}", bytes_to_hex(&frame));
        }

        let timeout_ms = self.timeout.get();
        let stream = self.stream_mut()?;
        let result = if timeout_ms == 0 {
            stream.write_all(&frame).await.map_err(ModbusError::from)
        } else {
            match timeout(Duration::from_millis(timeout_ms), stream.write_all(&frame)).await {
                Ok(result) => result.map_err(ModbusError::from),
                Err(_) => Err(ModbusError::timeout("write MBAP frame", timeout_ms)),
            }
        };

        match result {
            Ok(()) => {
                self.stats.frames_sent += 1;
                self.stats.bytes_sent += frame.len() as u64;
                Ok(())
            }
            Err(e) => {
                self.stats.errors += 1;
                if e.is_timeout() {
                    self.stats.timeouts += 1;
                }
                Err(e)
            }
        }
    }

    async fn read_message(&mut self) -> ModbusResult<ModbusMessage> {
        let result = self.read_frame().await;
        if let Err(e) = &result {
            self.stats.errors += 1;
            if e.is_timeout() {
                self.stats.timeouts += 1;
            }
        }
        result
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

    async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.shutdown().await {
                debug!("Shutdown of connection to {} failed: {}", self.peer, e);
            }
            debug!("Connection to {} closed", self.peer);
        }
    }
}

/// Why a stream connection handler stopped
#[derive(Debug, Clone)]
pub enum HandlerExit {
    /// The peer closed the stream
    EndOfStream,
    /// The listener was stopped or the handler was interrupted
    Interrupted,
    /// A non-recoverable error ended the connection
    Failed(ModbusError),
}

/// Handles requests on one accepted stream connection
pub struct StreamConnectionHandler<S = TcpStream> {
    transport: TcpTransport<S>,
    handler: Arc<dyn RequestHandler>,
    listener: ListenerHandle,
}

impl<S> StreamConnectionHandler<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(
        transport: TcpTransport<S>,
        handler: Arc<dyn RequestHandler>,
        listener: ListenerHandle,
    ) -> Self {
        Self {
            transport,
            handler,
            listener,
        }
    }

    /// Handle requests until end of stream, failure or stop
    ///
    /// The connection is closed exactly once before returning.
    pub async fn run(mut self) -> HandlerExit {
        let exit = loop {
            if self.listener.is_stopped() {
                break HandlerExit::Interrupted;
            }

            let result = tokio::select! {
                biased;
                _ = self.listener.stopped() => break HandlerExit::Interrupted,
                result = self.handler.handle_request(&mut self.transport, &self.listener) => result,
            };

            match result {
                Ok(()) => self.listener.record_result(true),
                Err(e) if e.is_eof() => {
                    debug!("{}: {}", self.transport.peer(), e);
                    break HandlerExit::EndOfStream;
                }
                Err(e) if e.is_interrupted() => break HandlerExit::Interrupted,
                Err(e) if e.is_protocol_io() => {
                    self.listener.record_result(false);
                    debug!("Request from {} failed: {}", self.transport.peer(), e);
                }
                Err(e) => {
                    self.listener.record_result(false);
                    warn!("Connection to {} failed: {}", self.transport.peer(), e);
                    break HandlerExit::Failed(e);
                }
            }
        };

        self.transport.close().await;
        exit
    }
}

/// Modbus TCP slave accepting connections
pub struct ModbusTcpListener {
    listener: TcpListener,
    handler: Arc<dyn RequestHandler>,
    handle: ListenerHandle,
    timeout: SharedTimeout,
    packet_logging: bool,
}

impl ModbusTcpListener {
    /// Bind to `address`
    pub async fn bind<A: ToSocketAddrs>(
        address: A,
        handler: Arc<dyn RequestHandler>,
    ) -> ModbusResult<Self> {
        let listener = TcpListener::bind(address)
            .await
            .map_err(|e| ModbusError::link_unavailable("tcp", e.to_string()))?;
        let local = listener.local_addr()?;
        let handle = ListenerHandle::new(format!("Modbus TCP Listener [addr:{}]", local));
        // Idle clients are normal, wait for requests indefinitely
        let timeout = SharedTimeout::new(0);
        handle.bind_timeout(timeout.clone());

        Ok(Self {
            listener,
            handler,
            handle,
            timeout,
            packet_logging: false,
        })
    }

    /// Per-connection read timeout, 0 waits indefinitely
    pub fn with_timeout_ms(self, timeout_ms: u64) -> Self {
        self.timeout.set(timeout_ms);
        self
    }

    pub fn with_packet_logging(mut self, enabled: bool) -> Self {
        self.packet_logging = enabled;
        self
    }

    pub fn local_addr(&self) -> ModbusResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn handle(&self) -> ListenerHandle {
        self.handle.clone()
    }

    /// Accept connections until stopped
    ///
    /// Returns after every connection handler has closed its connection.
    pub async fn run(self) -> ModbusResult<()> {
        let span = info_span!("listener", name = %self.handle.name());
        self.accept_loop().instrument(span).await
    }

    pub fn spawn(self) -> JoinHandle<ModbusResult<()>> {
        tokio::spawn(self.run())
    }

    async fn accept_loop(self) -> ModbusResult<()> {
        if !self.handle.begin_start() || !self.handle.mark_listening() {
            return Err(ModbusError::connection("Listener already started or stopped"));
        }
        info!("Listening on {}", self.listener.local_addr()?);

        let mut connections = JoinSet::new();
        let mut accept_failures = 0u32;
        loop {
            tokio::select! {
                biased;
                _ = self.handle.stopped() => break,
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        error!("Connection task failed: {}", e);
                    }
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!("Accepted connection from {}", peer);
                        let _ = stream.set_nodelay(true);
                        accept_failures = 0;
                        let mut transport =
                            TcpTransport::new(stream, peer.to_string(), self.timeout.clone());
                        transport.set_packet_logging(self.packet_logging);
                        let handler = StreamConnectionHandler::new(
                            transport,
                            self.handler.clone(),
                            self.handle.clone(),
                        );
                        connections.spawn(async move {
                            let exit = handler.run().await;
                            debug!("Connection from {} ended: {:?}", peer, exit);
                        });
                    }
                    Err(e) => {
                        accept_failures += 1;
                        let pause = accept_backoff(accept_failures);
                        error!("Failed to accept connection: {} (retrying in {:?})", e, pause);
                        tokio::select! {
                            _ = self.handle.stopped() => break,
                            _ = tokio::time::sleep(pause) => {}
                        }
                    }
                },
            }
        }

        self.handle.mark_stopped();
        while connections.join_next().await.is_some() {}
        info!("Listener stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accept_backoff_grows_and_caps() {
        assert_eq!(accept_backoff(1), Duration::from_millis(10));
        assert_eq!(accept_backoff(2), Duration::from_millis(20));
        assert_eq!(accept_backoff(5), Duration::from_millis(160));
        assert_eq!(accept_backoff(8), MAX_ACCEPT_BACKOFF);
        assert_eq!(accept_backoff(u32::MAX), MAX_ACCEPT_BACKOFF);
    }

    #[tokio::test]
    async fn test_mbap_over_duplex() {
        let (client, server) = tokio::io::duplex(512);
        let mut client = TcpTransport::new(client, "client", SharedTimeout::new(200));
        let mut server = TcpTransport::new(server, "server", SharedTimeout::new(200));

        let request =
            ModbusMessage::new(0x11, vec![0x03, 0x00, 0x6B, 0x00, 0x03]).with_transaction_id(42);
        client.write_message(&request).await.unwrap();
        assert_eq!(server.read_message().await.unwrap(), request);
        assert_eq!(server.get_stats().bytes_received, 12);
    }

    #[tokio::test]
    async fn test_eof_and_timeout() {
        let (client, server) = tokio::io::duplex(64);
        let mut server = TcpTransport::new(server, "server", SharedTimeout::new(20));

        assert!(server.read_message().await.unwrap_err().is_timeout());
        drop(client);
        assert!(server.read_message().await.unwrap_err().is_eof());
    }

    #[tokio::test]
    async fn test_bad_protocol_id_is_skipped() {
        let (mut client, server) = tokio::io::duplex(64);
        let mut server = TcpTransport::new(server, "server", SharedTimeout::new(200));

        client.write_all(&[0x00, 0x01, 0x00, 0x07, 0x00, 0x02, 0x01, 0x03]).await.unwrap();
        let good = ModbusMessage::new(1, vec![0x04, 0x00, 0x00, 0x00, 0x01]).with_transaction_id(2);
        client.write_all(&codec::encode_mbap(&good)).await.unwrap();

        let err = server.read_message().await.unwrap_err();
        assert!(matches!(err, ModbusError::ProtocolIo { eof: false, .. }));
        assert_eq!(server.read_message().await.unwrap(), good);
    }

    #[tokio::test]
    async fn test_oversized_bad_header_cannot_resync() {
        let (mut client, server) = tokio::io::duplex(64);
        let mut server = TcpTransport::new(server, "server", SharedTimeout::new(200));

        // Protocol id 1 with a length that would exceed a TCP frame
        client.write_all(&[0x00, 0x01, 0x00, 0x01, 0x00, 0xFF, 0x01]).await.unwrap();
        let err = server.read_message().await.unwrap_err();
        assert!(matches!(err, ModbusError::Io { .. }));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (_client, server) = tokio::io::duplex(64);
        let mut server = TcpTransport::new(server, "server", SharedTimeout::new(20));
        server.close().await;
        server.close().await;
        assert!(server.is_closed());
        assert!(matches!(
            server.read_message().await,
            Err(ModbusError::Connection { .. })
        ));
    }
}
