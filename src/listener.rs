//! Slave-side listener loop
//!
//! A [`ModbusSerialListener`] owns a [`LinkConnection`] and repeatedly hands
//! its transport to a [`RequestHandler`] until stopped. Its
//! [`ListenerHandle`] is cloneable and is the only way to observe or stop a
//! listener while its loop runs on another task.
//!
//! ```text
//!   Idle --run()--> Listening --stop()/fatal error--> Stopped
//!    ^      |
//!    +------+ open() failed (error recorded)
//! ```
//!
//! ```rust
//! use std::sync::Arc;
//! use modbus_link::config::ConnectionConfig;
//! use modbus_link::handler::ExceptionResponder;
//! use modbus_link::listener::ModbusSerialListener;
//! use modbus_link::memory::MemoryProvider;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let listener = ModbusSerialListener::new(
//!     ConnectionConfig::new("/dev/ttyUSB0", 9600),
//!     Arc::new(MemoryProvider::new()),
//!     Arc::new(ExceptionResponder::default()),
//! );
//! let handle = listener.handle();
//! let listener = listener.spawn().await.unwrap();
//!
//! // No channel could be acquired
//! assert!(!handle.is_listening());
//! assert!(listener.error().unwrap().starts_with("Cannot start Serial listener"));
//! # }
//! ```

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::channel::ChannelProvider;
use crate::config::ConnectionConfig;
use crate::handler::RequestHandler;
use crate::link::LinkConnection;
use crate::transport::SharedTimeout;

const IDLE: u8 = 0;
const STARTING: u8 = 1;
const LISTENING: u8 = 2;
const STOPPED: u8 = 3;

/// Observable listener lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Idle,
    Listening,
    Stopped,
}

struct Shared {
    name: RwLock<String>,
    state: AtomicU8,
    error: RwLock<Option<String>>,
    stop_tx: watch::Sender<bool>,
    timeout: RwLock<Option<SharedTimeout>>,
    handled: AtomicU64,
    failed: AtomicU64,
}

/// Cloneable view of a listener, also passed to every handler call
#[derive(Clone)]
pub struct ListenerHandle(Arc<Shared>);

impl ListenerHandle {
    pub fn new<S: Into<String>>(name: S) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self(Arc::new(Shared {
            name: RwLock::new(name.into()),
            state: AtomicU8::new(IDLE),
            error: RwLock::new(None),
            stop_tx,
            timeout: RwLock::new(None),
            handled: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }))
    }

    pub fn name(&self) -> String {
        self.0.name.read().map(|name| name.clone()).unwrap_or_default()
    }

    pub(crate) fn set_name(&self, name: String) {
        if let Ok(mut current) = self.0.name.write() {
            *current = name;
        }
    }

    pub fn state(&self) -> ListenerState {
        match self.0.state.load(Ordering::SeqCst) {
            LISTENING => ListenerState::Listening,
            STOPPED => ListenerState::Stopped,
            _ => ListenerState::Idle,
        }
    }

    pub fn is_listening(&self) -> bool {
        self.0.state.load(Ordering::SeqCst) == LISTENING
    }

    pub fn is_stopped(&self) -> bool {
        self.0.state.load(Ordering::SeqCst) == STOPPED
    }

    /// Signal the loop to stop
    ///
    /// Returns immediately. The loop closes its connection and exits, at
    /// the latest when the in-flight handler call is abandoned.
    pub fn stop(&self) {
        let previous = self.0.state.swap(STOPPED, Ordering::SeqCst);
        self.0.stop_tx.send_replace(true);
        if previous != STOPPED {
            debug!("{} stop requested", self.name());
        }
    }

    /// Resolves once `stop()` has been called
    pub async fn stopped(&self) {
        let mut rx = self.0.stop_tx.subscribe();
        // Only fails if the sender is gone, which the handle itself prevents
        let _ = rx.wait_for(|stopped| *stopped).await;
    }

    /// Last fatal startup error, kept after the loop exits
    pub fn error(&self) -> Option<String> {
        self.0.error.read().ok().and_then(|error| error.clone())
    }

    fn set_error(&self, message: Option<String>) {
        if let Ok(mut error) = self.0.error.write() {
            *error = message;
        }
    }

    /// Current read timeout of the listener's link, if bound to one
    pub fn timeout(&self) -> Option<u64> {
        self.0.timeout.read().ok().and_then(|t| t.as_ref().map(SharedTimeout::get))
    }

    /// Change the read timeout of a running listener
    pub fn set_timeout(&self, timeout_ms: u64) {
        if let Ok(timeout) = self.0.timeout.read() {
            if let Some(timeout) = timeout.as_ref() {
                timeout.set(timeout_ms);
            }
        }
    }

    pub(crate) fn bind_timeout(&self, timeout: SharedTimeout) {
        if let Ok(mut current) = self.0.timeout.write() {
            *current = Some(timeout);
        }
    }

    /// Handler calls that completed successfully
    pub fn requests_handled(&self) -> u64 {
        self.0.handled.load(Ordering::SeqCst)
    }

    /// Handler calls that failed
    pub fn requests_failed(&self) -> u64 {
        self.0.failed.load(Ordering::SeqCst)
    }

    pub(crate) fn record_result(&self, ok: bool) {
        let counter = if ok { &self.0.handled } else { &self.0.failed };
        counter.fetch_add(1, Ordering::SeqCst);
    }

    /// Idle -> Starting; false if the listener already ran or was stopped
    pub(crate) fn begin_start(&self) -> bool {
        self.0
            .state
            .compare_exchange(IDLE, STARTING, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Starting -> Listening; false if stopped meanwhile
    pub(crate) fn mark_listening(&self) -> bool {
        self.0
            .state
            .compare_exchange(STARTING, LISTENING, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Starting -> Idle after a failed start
    pub(crate) fn abort_start(&self) {
        let _ = self
            .0
            .state
            .compare_exchange(STARTING, IDLE, Ordering::SeqCst, Ordering::SeqCst);
    }

    pub(crate) fn mark_stopped(&self) {
        self.0.state.store(STOPPED, Ordering::SeqCst);
        self.0.stop_tx.send_replace(true);
    }
}

impl std::fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerHandle")
            .field("name", &self.name())
            .field("state", &self.state())
            .field("error", &self.error())
            .finish()
    }
}

/// Slave listener over a serial link
pub struct ModbusSerialListener {
    connection: LinkConnection,
    handler: Arc<dyn RequestHandler>,
    handle: ListenerHandle,
    name: Option<String>,
}

impl ModbusSerialListener {
    pub fn new(
        config: ConnectionConfig,
        provider: Arc<dyn ChannelProvider>,
        handler: Arc<dyn RequestHandler>,
    ) -> Self {
        Self::from_connection(LinkConnection::new(config, provider), handler)
    }

    /// Listener over a host serial port
    pub fn serial(config: ConnectionConfig, handler: Arc<dyn RequestHandler>) -> Self {
        Self::from_connection(LinkConnection::serial(config), handler)
    }

    pub fn from_connection(connection: LinkConnection, handler: Arc<dyn RequestHandler>) -> Self {
        let handle = ListenerHandle::new(String::new());
        handle.bind_timeout(connection.timeout_handle());
        Self {
            connection,
            handler,
            handle,
            name: None,
        }
    }

    /// Use `name` instead of the name derived from the port
    pub fn with_name<S: Into<String>>(mut self, name: S) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn handle(&self) -> ListenerHandle {
        self.handle.clone()
    }

    pub fn connection(&self) -> &LinkConnection {
        &self.connection
    }

    pub fn error(&self) -> Option<String> {
        self.handle.error()
    }

    pub fn is_listening(&self) -> bool {
        self.handle.is_listening()
    }

    pub fn state(&self) -> ListenerState {
        self.handle.state()
    }

    pub fn timeout(&self) -> u64 {
        self.connection.timeout()
    }

    /// Set the read timeout on the link and its bound transport
    pub fn set_timeout(&mut self, timeout_ms: u64) {
        self.connection.set_timeout(timeout_ms);
    }

    /// Stop the listener and release its link
    pub async fn stop(&mut self) {
        self.handle.stop();
        self.connection.close().await;
    }

    fn loop_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| {
            format!("Modbus Serial Listener [port:{}]", self.connection.descriptive_port_name())
        })
    }

    /// Run the listener until stopped
    ///
    /// A failed open is recorded in [`error`](Self::error) and returns
    /// without listening. On every exit path the link is closed.
    pub async fn run(&mut self) {
        let name = self.loop_name();
        self.handle.set_name(name.clone());
        let span = info_span!("listener", name = %name);
        self.run_loop().instrument(span).await
    }

    /// Run the listener on its own task, returning it once the loop exits
    pub fn spawn(mut self) -> JoinHandle<Self> {
        tokio::spawn(async move {
            self.run().await;
            self
        })
    }

    async fn run_loop(&mut self) {
        if !self.handle.begin_start() {
            warn!("Listener already started or stopped");
            return;
        }

        if let Err(e) = self.connection.open().await {
            let message = format!("Cannot start Serial listener - {}", e);
            error!("{}", message);
            self.handle.set_error(Some(message));
            self.handle.abort_start();
            return;
        }
        self.handle.set_error(None);

        if self.handle.mark_listening() {
            info!("Listening on {}", self.connection.descriptive_port_name());
            self.listen().await;
        }

        self.handle.mark_stopped();
        self.connection.close().await;
        info!("Listener stopped");
    }

    async fn listen(&mut self) {
        while self.handle.is_listening() {
            let transport = match self.connection.transport_mut() {
                Some(transport) => transport,
                None => break,
            };

            let result = tokio::select! {
                biased;
                _ = self.handle.stopped() => break,
                result = self.handler.handle_request(transport, &self.handle) => result,
            };

            match result {
                Ok(()) => self.handle.record_result(true),
                Err(e) if e.is_protocol_io() && e.is_recoverable() => {
                    self.handle.record_result(false);
                    debug!("Request failed: {}", e);
                }
                Err(e) => {
                    self.handle.record_result(false);
                    error!("Listener loop failed: {}", e);
                    break;
                }
            }
        }
    }
}
