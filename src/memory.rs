//! In-memory byte channels
//!
//! [`memory_pair`] returns a [`MemoryChannel`] for the link side and a
//! [`MemoryPeer`] that plays the remote device. [`MemoryProvider`] hands out
//! pre-built channels in order, so the whole link stack can run without a
//! serial port.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use tokio::sync::mpsc;
use tracing::debug;

use crate::channel::{ByteChannel, ChannelProvider};
use crate::config::{ConnectionConfig, LineSettings};
use crate::error::{ModbusError, ModbusResult};

/// Lifecycle counters of a memory channel, readable after it was moved
#[derive(Debug, Default)]
pub struct MemoryChannelStats {
    opened: AtomicUsize,
    closed: AtomicUsize,
    settings_applied: AtomicUsize,
    baud_rate: AtomicU32,
}

impl MemoryChannelStats {
    /// Times a provider handed this channel out
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// Times the channel was closed
    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn settings_applied(&self) -> usize {
        self.settings_applied.load(Ordering::SeqCst)
    }

    /// Baud rate of the last applied line settings, 0 if none
    pub fn baud_rate(&self) -> u32 {
        self.baud_rate.load(Ordering::SeqCst)
    }
}

/// Link side of an in-memory channel
pub struct MemoryChannel {
    name: String,
    tx: mpsc::UnboundedSender<Bytes>,
    rx: mpsc::UnboundedReceiver<Bytes>,
    pending: BytesMut,
    echo: bool,
    reject_line_settings: bool,
    closed: bool,
    stats: Arc<MemoryChannelStats>,
}

/// Remote side of an in-memory channel
pub struct MemoryPeer {
    tx: mpsc::UnboundedSender<Bytes>,
    rx: mpsc::UnboundedReceiver<Bytes>,
}

/// Create a connected channel/peer pair named `name`
pub fn memory_pair<S: Into<String>>(name: S) -> (MemoryChannel, MemoryPeer) {
    let (to_peer, from_link) = mpsc::unbounded_channel();
    let (to_link, from_peer) = mpsc::unbounded_channel();

    let channel = MemoryChannel {
        name: name.into(),
        tx: to_peer,
        rx: from_peer,
        pending: BytesMut::new(),
        echo: false,
        reject_line_settings: false,
        closed: false,
        stats: Arc::new(MemoryChannelStats::default()),
    };
    let peer = MemoryPeer {
        tx: to_link,
        rx: from_link,
    };
    (channel, peer)
}

impl MemoryChannel {
    /// Loop every written byte back to the reader, like a half-duplex RS-485 line
    pub fn with_echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    /// Refuse every line-settings change
    pub fn with_rejected_line_settings(mut self) -> Self {
        self.reject_line_settings = true;
        self
    }

    pub fn stats(&self) -> Arc<MemoryChannelStats> {
        self.stats.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn drain_ready(&mut self) {
        while let Ok(chunk) = self.rx.try_recv() {
            self.pending.extend_from_slice(&chunk);
        }
    }

    fn take_pending(&mut self, buf: &mut [u8]) -> usize {
        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.advance(n);
        n
    }
}

#[async_trait]
impl ByteChannel for MemoryChannel {
    fn port_name(&self) -> String {
        self.name.clone()
    }

    fn apply_line_settings(&mut self, settings: &LineSettings) -> ModbusResult<()> {
        if self.reject_line_settings {
            return Err(ModbusError::configuration_rejected(format!(
                "{} refused {}",
                self.name, settings
            )));
        }
        self.stats.settings_applied.fetch_add(1, Ordering::SeqCst);
        self.stats.baud_rate.store(settings.baud_rate, Ordering::SeqCst);
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8]) -> ModbusResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if !self.pending.is_empty() {
            return Ok(self.take_pending(buf));
        }
        if self.closed {
            return Ok(0);
        }

        match self.rx.recv().await {
            Some(chunk) => {
                self.pending.extend_from_slice(&chunk);
                Ok(self.take_pending(buf))
            }
            // Peer dropped
            None => Ok(0),
        }
    }

    async fn write(&mut self, buf: &[u8]) -> ModbusResult<usize> {
        if self.closed {
            return Err(ModbusError::connection(format!("{} is closed", self.name)));
        }
        self.tx
            .send(Bytes::copy_from_slice(buf))
            .map_err(|_| ModbusError::io(format!("{}: peer went away", self.name)))?;
        if self.echo {
            self.pending.extend_from_slice(buf);
        }
        Ok(buf.len())
    }

    fn bytes_available(&mut self) -> ModbusResult<usize> {
        if self.closed {
            return Err(ModbusError::connection(format!("{} is closed", self.name)));
        }
        self.drain_ready();
        Ok(self.pending.len())
    }

    fn clear_input(&mut self) -> ModbusResult<usize> {
        if self.closed {
            return Err(ModbusError::connection(format!("{} is closed", self.name)));
        }
        self.drain_ready();
        let dropped = self.pending.len();
        self.pending.clear();
        Ok(dropped)
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.rx.close();
            self.pending.clear();
            self.stats.closed.fetch_add(1, Ordering::SeqCst);
            debug!("Memory channel {} closed", self.name);
        }
    }
}

impl MemoryPeer {
    /// Send bytes to the link side
    pub fn send(&self, data: &[u8]) -> ModbusResult<()> {
        self.tx
            .send(Bytes::copy_from_slice(data))
            .map_err(|_| ModbusError::io("link side went away"))
    }

    /// Receive the next chunk written by the link side
    ///
    /// Returns `None` once the link side has been dropped.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    /// Receive the next chunk, failing after `timeout`
    pub async fn recv_timeout(&mut self, timeout: Duration) -> ModbusResult<Bytes> {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(chunk)) => Ok(chunk),
            Ok(None) => Err(ModbusError::end_of_stream("link side went away")),
            Err(_) => Err(ModbusError::timeout("peer receive", timeout.as_millis() as u64)),
        }
    }
}

/// Provider that hands out queued memory channels in order
#[derive(Default)]
pub struct MemoryProvider {
    channels: Mutex<VecDeque<MemoryChannel>>,
    ports: Vec<String>,
    acquired: AtomicUsize,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Provider holding a single channel
    pub fn with_channel(channel: MemoryChannel) -> Self {
        let provider = Self::new();
        provider.push(channel);
        provider
    }

    /// Port names reported by `available_ports`
    pub fn with_ports<I, S>(mut self, ports: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ports = ports.into_iter().map(Into::into).collect();
        self
    }

    /// Queue a channel for a later `acquire`
    pub fn push(&self, channel: MemoryChannel) {
        if let Ok(mut channels) = self.channels.lock() {
            channels.push_back(channel);
        }
    }

    /// Number of successful `acquire` calls
    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn remaining(&self) -> usize {
        self.channels.lock().map(|c| c.len()).unwrap_or(0)
    }
}

#[async_trait]
impl ChannelProvider for MemoryProvider {
    async fn acquire(&self, config: &ConnectionConfig) -> ModbusResult<Box<dyn ByteChannel>> {
        let next = self
            .channels
            .lock()
            .map_err(|_| ModbusError::internal("memory provider lock poisoned"))?
            .pop_front();

        match next {
            Some(channel) => {
                channel.stats.opened.fetch_add(1, Ordering::SeqCst);
                self.acquired.fetch_add(1, Ordering::SeqCst);
                Ok(Box::new(channel))
            }
            None => Err(ModbusError::link_unavailable(&config.port, "no channel available")),
        }
    }

    fn available_ports(&self) -> Vec<String> {
        self.ports.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_transfers_bytes() {
        let (mut channel, mut peer) = memory_pair("mem0");

        assert_eq!(channel.write(&[1, 2, 3]).await.unwrap(), 3);
        assert_eq!(peer.recv().await.unwrap().as_ref(), &[1, 2, 3]);

        peer.send(&[4, 5, 6, 7]).unwrap();
        assert_eq!(channel.bytes_available().unwrap(), 4);

        let mut buf = [0u8; 3];
        assert_eq!(channel.read(&mut buf).await.unwrap(), 3);
        assert_eq!(buf, [4, 5, 6]);
        assert_eq!(channel.read(&mut buf).await.unwrap(), 1);
        assert_eq!(buf[0], 7);
    }

    #[tokio::test]
    async fn test_echo_and_eof() {
        let (channel, peer) = memory_pair("mem1");
        let mut channel = channel.with_echo(true);

        channel.write(&[0xAA, 0xBB]).await.unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(channel.read(&mut buf).await.unwrap(), 2);
        assert_eq!(&buf[..2], &[0xAA, 0xBB]);

        drop(peer);
        assert_eq!(channel.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_clear_input_drops_queued_bytes() {
        let (mut channel, peer) = memory_pair("mem-clear");
        peer.send(&[0x01, 0x03]).unwrap();
        peer.send(&[0x02, 0xAA, 0xAA]).unwrap();

        assert_eq!(channel.clear_input().unwrap(), 5);
        assert_eq!(channel.bytes_available().unwrap(), 0);

        peer.send(&[0x07]).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(channel.read(&mut buf).await.unwrap(), 1);
        assert_eq!(buf[0], 0x07);

        channel.close().await;
        assert!(channel.clear_input().is_err());
    }

    #[tokio::test]
    async fn test_close_is_counted_once() {
        let (mut channel, _peer) = memory_pair("mem2");
        let stats = channel.stats();
        channel.close().await;
        channel.close().await;
        assert_eq!(stats.closed(), 1);
        assert!(channel.write(&[1]).await.is_err());
    }

    #[tokio::test]
    async fn test_provider_order_and_exhaustion() {
        let (first, _p1) = memory_pair("first");
        let (second, _p2) = memory_pair("second");
        let provider = MemoryProvider::with_channel(first).with_ports(["first", "second"]);
        provider.push(second);

        let config = ConnectionConfig::new("mem", 9600);
        assert_eq!(provider.acquire(&config).await.unwrap().port_name(), "first");
        assert_eq!(provider.acquire(&config).await.unwrap().port_name(), "second");

        let err = provider.acquire(&config).await.err().unwrap();
        assert!(matches!(err, ModbusError::LinkUnavailable { .. }));
        assert_eq!(provider.acquired(), 2);
        assert_eq!(provider.available_ports(), vec!["first", "second"]);
    }

    #[test]
    fn test_rejected_line_settings() {
        let (channel, _peer) = memory_pair("mem3");
        let mut channel = channel.with_rejected_line_settings();
        let settings = ConnectionConfig::new("mem3", 9600).line_settings();
        assert!(matches!(
            channel.apply_line_settings(&settings),
            Err(ModbusError::ConfigurationRejected { .. })
        ));
    }
}
