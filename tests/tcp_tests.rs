//! Stream transport tests: MBAP over duplex pipes and loopback TCP

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};
use tokio::time::timeout;
use tokio_test::{assert_ok, assert_ready};

use modbus_link::*;

/// Duplex stream that counts shutdown calls
struct CountingStream {
    inner: DuplexStream,
    shutdowns: Arc<AtomicUsize>,
}

impl AsyncRead for CountingStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for CountingStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

fn counting_handler(
    handler: Arc<dyn RequestHandler>,
    listener: ListenerHandle,
) -> (StreamConnectionHandler<CountingStream>, DuplexStream, Arc<AtomicUsize>) {
    let (client, server) = tokio::io::duplex(1024);
    let shutdowns = Arc::new(AtomicUsize::new(0));
    let stream = CountingStream {
        inner: server,
        shutdowns: shutdowns.clone(),
    };
    let transport = TcpTransport::new(stream, "duplex", SharedTimeout::new(0));
    (StreamConnectionHandler::new(transport, handler, listener), client, shutdowns)
}

#[tokio::test]
async fn test_handler_closes_once_on_end_of_stream() {
    let listener = ListenerHandle::new("duplex listener");
    let (handler, client, shutdowns) = counting_handler(Arc::new(EchoResponder), listener);

    let task = tokio::spawn(handler.run());
    drop(client);

    let exit = timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
    assert!(matches!(exit, HandlerExit::EndOfStream));
    assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_handler_echoes_over_duplex() {
    let listener = ListenerHandle::new("duplex listener");
    let (handler, client, _shutdowns) = counting_handler(Arc::new(EchoResponder), listener.clone());
    let task = tokio::spawn(handler.run());

    let mut client = TcpTransport::new(client, "client", SharedTimeout::new(500));
    for transaction_id in 1..=3u16 {
        let request = ModbusMessage::new(1, vec![0x03, 0x00, 0x10, 0x00, 0x01])
            .with_transaction_id(transaction_id);
        client.write_message(&request).await.unwrap();
        assert_eq!(client.read_message().await.unwrap(), request);
    }
    assert_eq!(client.get_stats().frames_received, 3);

    listener.stop();
    let exit = timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
    assert!(matches!(exit, HandlerExit::Interrupted));
    assert_eq!(listener.requests_handled(), 3);
}

#[tokio::test]
async fn test_stop_interrupts_waiting_handler() {
    let listener = ListenerHandle::new("duplex listener");
    let (handler, _client, shutdowns) = counting_handler(Arc::new(EchoResponder), listener.clone());
    let task = tokio::spawn(handler.run());

    tokio::task::yield_now().await;
    listener.stop();
    let exit = timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
    assert!(matches!(exit, HandlerExit::Interrupted));
    assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_tcp_listener_round_trip() {
    let listener = ModbusTcpListener::bind("127.0.0.1:0", Arc::new(ExceptionResponder::default()))
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = listener.handle();
    assert!(handle.name().starts_with("Modbus TCP Listener"));
    let task = listener.spawn();

    let mut client = TcpTransport::connect(addr, 1_000).await.unwrap();
    let request =
        ModbusMessage::new(17, vec![0x01, 0x00, 0x13, 0x00, 0x25]).with_transaction_id(0x1234);
    assert_ok!(client.write_message(&request).await);

    let reply = client.read_message().await.unwrap();
    assert_eq!(reply.transaction_id, 0x1234);
    assert_eq!(reply.unit_id, 17);
    assert_eq!(reply.pdu.as_ref(), &[0x81, 0x01]);
    assert!(handle.is_listening());

    handle.stop();
    let result = timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
    assert_ok!(result);
    assert!(handle.is_stopped());

    // The server side of the connection was closed on stop
    assert!(client.read_message().await.unwrap_err().is_eof());
    client.close().await;
}

#[tokio::test]
async fn test_connect_with_zero_timeout() {
    let server = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = server.local_addr().unwrap();
    let accepted = tokio::spawn(async move { server.accept().await.map(|(stream, _)| stream) });

    let mut client = assert_ok!(TcpTransport::connect(addr, 0).await);
    assert_eq!(client.timeout(), 0);
    assert_eq!(client.peer(), addr.to_string());
    assert_ok!(accepted.await.unwrap());
    client.close().await;
}

#[tokio::test]
async fn test_stopped_signal_is_ready_after_stop() {
    let listener = ListenerHandle::new("signal");
    let mut stopped = tokio_test::task::spawn(listener.stopped());
    assert!(stopped.poll().is_pending());

    listener.stop();
    assert!(stopped.is_woken());
    assert_ready!(stopped.poll());
}

#[tokio::test]
async fn test_raw_garbage_then_valid_request() {
    let listener = ListenerHandle::new("duplex listener");
    let (handler, mut client, _shutdowns) =
        counting_handler(Arc::new(EchoResponder), listener.clone());
    let task = tokio::spawn(handler.run());

    // Protocol id 1, length 2: header and one body byte are skipped
    client.write_all(&[0x00, 0x01, 0x00, 0x01, 0x00, 0x02, 0x01, 0x03]).await.unwrap();
    let request = ModbusMessage::new(2, vec![0x04, 0x00, 0x00, 0x00, 0x01]).with_transaction_id(5);
    client.write_all(&codec::encode_mbap(&request)).await.unwrap();

    let mut transport = TcpTransport::new(client, "client", SharedTimeout::new(500));
    assert_eq!(transport.read_message().await.unwrap(), request);
    assert_eq!(listener.requests_failed(), 1);

    listener.stop();
    assert_ok!(timeout(Duration::from_secs(1), task).await);
}
