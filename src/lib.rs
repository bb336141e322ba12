//! # Modbus Link - Serial and Stream Link Layer for Modbus
//!
//! The transport and connection-management layer of a Modbus stack. It owns
//! the physical link (a serial channel or a stream socket), frames whole
//! Modbus messages on the wire and runs the master request/response cycle and
//! the slave listener loops. PDU semantics and register storage live above
//! this crate and plug in through [`RequestHandler`].
//!
//! ## Features
//!
//! - **Link lifecycle**: open/close/reconfigure a serial link through a
//!   pluggable [`ChannelProvider`] (real ports via `tokio-serial`, or an
//!   in-memory pair for tests)
//! - **Serial framing**: RTU (CRC-16, 3.5 character silent interval) and ASCII
//!   (LRC, `:` ... `CR LF`), with optional echo suppression
//! - **Transactions**: transmit delay, timeout, retries and broadcast handling
//! - **Master facade**: connect/disconnect with a bound transaction template
//! - **Listeners**: a serial slave loop and a TCP accept loop, both stoppable
//!   from any task through a [`ListenerHandle`]
//!
//! ## Quick Start
//!
//! ### Master
//!
//! ```rust,no_run
//! use modbus_link::{ConnectionConfig, ModbusMessage, ModbusResult, ModbusSerialMaster};
//!
//! #[tokio::main]
//! async fn main() -> ModbusResult<()> {
//!     let config = ConnectionConfig::new("/dev/ttyUSB0", 19200).with_timeout_ms(500);
//!     let mut master = ModbusSerialMaster::serial(config);
//!     master.connect().await?;
//!
//!     // Read 2 holding registers from unit 1
//!     let request = ModbusMessage::new(1, vec![0x03, 0x00, 0x00, 0x00, 0x02]);
//!     if let Some(response) = master.send(request).await? {
//!         println!("Response: {}", response);
//!     }
//!
//!     master.disconnect().await;
//!     Ok(())
//! }
//! ```
//!
//! ### Listener
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use modbus_link::{ConnectionConfig, ExceptionResponder, ModbusSerialListener};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = ConnectionConfig::new("/dev/ttyUSB1", 19200);
//!     let responder = Arc::new(ExceptionResponder::default());
//!     let listener = ModbusSerialListener::serial(config, responder);
//!     let handle = listener.handle();
//!
//!     let task = listener.spawn();
//!     // ... later, from any task
//!     handle.stop();
//!     let listener = task.await.unwrap();
//!     assert!(!listener.connection().is_open());
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐    ┌─────────────────┐    ┌─────────────────┐
//! │  Serial Master  │    │ Serial Listener │    │  TCP Listener   │
//! └─────────────────┘    └─────────────────┘    └─────────────────┘
//!          │                      │                      │
//! ┌─────────────────┐    ┌─────────────────┐    ┌─────────────────┐
//! │   Transaction   │    │ RequestHandler  │◄───│ Stream Handler  │
//! └─────────────────┘    └─────────────────┘    └─────────────────┘
//!          │                      │                      │
//! ┌────────────────────────────────────────┐    ┌─────────────────┐
//! │    LinkConnection / SerialTransport    │    │  TcpTransport   │
//! │             (RTU / ASCII)              │    │     (MBAP)      │
//! └────────────────────────────────────────┘    └─────────────────┘
//!                     │                                  │
//! ┌────────────────────────────────────────┐    ┌─────────────────┐
//! │    ChannelProvider / ByteChannel       │    │  AsyncRead +    │
//! │    (tokio-serial, in-memory)           │    │  AsyncWrite     │
//! └────────────────────────────────────────┘    └─────────────────┘
//! ```

/// Core error types and result handling
pub mod error;

/// Connection configuration and line parameters
pub mod config;

/// Modbus message envelope and exception codes
pub mod protocol;

/// RTU, ASCII and MBAP frame codecs
pub mod codec;

/// Host byte-channel abstraction
pub mod channel;

/// In-memory byte channels for tests and simulations
pub mod memory;

/// Serial port byte channels
pub mod serial;

/// Frame transports for serial links
pub mod transport;

/// Request/response transactions
pub mod transaction;

/// Link connection lifecycle
pub mod link;

/// Master facade
pub mod master;

/// Request handler contract
pub mod handler;

/// Serial listener loop
pub mod listener;

/// TCP stream transport and accept loop
pub mod stream;

/// Utility functions and operation timing
pub mod utils;

/// Callback logging for embedders
pub mod logging;

// Re-export main types for convenience
pub use error::{ModbusError, ModbusResult};
pub use config::{ConnectionConfig, FrameEncoding, LineSettings, Parity, StopBits};
pub use protocol::{ModbusException, ModbusMessage, SlaveId, BROADCAST_UNIT_ID};
pub use channel::{ByteChannel, ChannelProvider};
pub use memory::{memory_pair, MemoryChannel, MemoryPeer, MemoryProvider};
pub use serial::{SerialChannel, SerialProvider};
pub use transport::{ModbusTransport, SerialTransport, SharedTimeout, TransportStats};
pub use transaction::{Transaction, TransactionOutcome, TransactionTemplate};
pub use link::LinkConnection;
pub use master::{MasterOptions, ModbusSerialMaster};
pub use handler::{EchoResponder, ExceptionResponder, RequestHandler};
pub use listener::{ListenerHandle, ListenerState, ModbusSerialListener};
pub use stream::{HandlerExit, ModbusTcpListener, StreamConnectionHandler, TcpTransport};
pub use utils::OperationTimer;
pub use logging::{CallbackLogger, LogCallback, LogLevel};

/// Default read timeout (3 seconds)
pub const DEFAULT_TIMEOUT_MS: u64 = 3000;

/// Default delay before each transmission
pub const DEFAULT_TRANSMIT_DELAY_MS: u64 = 0;

/// Default number of retries after a recoverable failure
pub const DEFAULT_RETRIES: u32 = 0;

/// Maximum Modbus RTU frame size
pub const MAX_RTU_FRAME_SIZE: usize = 256;

/// Maximum Modbus ASCII frame size (start, hex body, LRC, CR LF)
pub const MAX_ASCII_FRAME_SIZE: usize = 513;

/// Maximum Modbus TCP frame size (MBAP header + PDU)
pub const MAX_TCP_FRAME_SIZE: usize = 260;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get library information
pub fn info() -> String {
    format!("Modbus Link v{} - Modbus serial/stream link layer", VERSION)
}
