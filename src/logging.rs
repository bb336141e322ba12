//! Callback-based frame logging
//!
//! Embedders that do not install a `tracing` subscriber can still observe
//! link traffic by attaching a [`CallbackLogger`] to a transport. Every frame
//! written or read is reported with its direction and wire protocol.

use std::sync::Arc;

use crate::utils::format::bytes_to_hex;

/// Log levels for the callback logging system
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    /// Error messages
    Error,
    /// Warning messages
    Warn,
    /// Informational messages
    Info,
    /// Debug messages
    Debug,
}

impl LogLevel {
    /// Convert log level to string
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
        }
    }
}

/// Type alias for log callback functions
///
/// The callback receives a log level and message string
pub type LogCallback = Box<dyn Fn(LogLevel, &str) + Send + Sync>;

/// Logger that uses callbacks for flexible logging
#[derive(Clone)]
pub struct CallbackLogger {
    callback: Option<Arc<LogCallback>>,
    min_level: LogLevel,
}

impl CallbackLogger {
    /// Create a new callback logger
    pub fn new(callback: Option<LogCallback>, min_level: LogLevel) -> Self {
        Self {
            callback: callback.map(Arc::new),
            min_level,
        }
    }

    /// Create a logger with default console output
    pub fn console() -> Self {
        let callback: LogCallback = Box::new(|level, message| {
            let timestamp = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S%.3f");
            match level {
                LogLevel::Error | LogLevel::Warn => {
                    eprintln!("[{}] {}: {}", timestamp, level.as_str(), message)
                }
                LogLevel::Info | LogLevel::Debug => {
                    println!("[{}] {}: {}", timestamp, level.as_str(), message)
                }
            }
        });
        Self::new(Some(callback), LogLevel::Info)
    }

    /// Create a logger that outputs nothing (disabled)
    pub fn disabled() -> Self {
        Self::new(None, LogLevel::Error)
    }

    pub fn is_enabled(&self, level: LogLevel) -> bool {
        self.callback.is_some() && level <= self.min_level
    }

    /// Log a message at the specified level
    pub fn log(&self, level: LogLevel, message: &str) {
        if self.is_enabled(level) {
            if let Some(ref callback) = self.callback {
                callback(level, message);
            }
        }
    }

    pub fn error(&self, message: &str) {
        self.log(LogLevel::Error, message);
    }

    pub fn warn(&self, message: &str) {
        self.log(LogLevel::Warn, message);
    }

    pub fn info(&self, message: &str) {
        self.log(LogLevel::Info, message);
    }

    pub fn debug(&self, message: &str) {
        self.log(LogLevel::Debug, message);
    }

    /// Log one wire frame
    ///
    /// Produces `[MODBUS-<protocol>] <direction> (<n> bytes): <hex>`.
    pub fn log_frame(&self, level: LogLevel, direction: &str, protocol: &str, data: &[u8]) {
        if !self.is_enabled(level) {
            return;
        }

        let message = format!(
            "[MODBUS-{}] {} ({} bytes): {}",
            protocol,
            direction,
            data.len(),
            bytes_to_hex(data)
        );
        self.log(level, &message);
    }
}

impl Default for CallbackLogger {
    fn default() -> Self {
        Self::disabled()
    }
}

impl std::fmt::Debug for CallbackLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackLogger")
            .field("enabled", &self.callback.is_some())
            .field("min_level", &self.min_level)
            .finish()
    }
}

/// Convenience macro for creating a simple console logger
#[macro_export]
macro_rules! console_logger {
    () => {
        $crate::logging::CallbackLogger::console()
    };
}

/// Convenience macro for creating a custom logger
#[macro_export]
macro_rules! custom_logger {
    ($callback:expr) => {
        $crate::logging::CallbackLogger::new(Some($callback), $crate::logging::LogLevel::Info)
    };
    ($callback:expr, $level:expr) => {
        $crate::logging::CallbackLogger::new(Some($callback), $level)
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_level_filtering() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let callback: LogCallback = Box::new(move |level, msg| {
            sink.lock().unwrap().push(format!("{} {}", level.as_str(), msg));
        });
        let logger = CallbackLogger::new(Some(callback), LogLevel::Warn);

        logger.error("e");
        logger.warn("w");
        logger.info("i");
        logger.debug("d");

        assert_eq!(*seen.lock().unwrap(), vec!["ERROR e".to_string(), "WARN w".to_string()]);
    }

    #[test]
    fn test_frame_format() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let callback: LogCallback = Box::new(move |_, msg| {
            sink.lock().unwrap().push(msg.to_string());
        });
        let logger = custom_logger!(callback, LogLevel::Debug);

        logger.log_frame(LogLevel::Info, "send", "RTU", &[0x01, 0x03, 0xC4, 0x0B]);
        assert_eq!(seen.lock().unwrap()[0], "[MODBUS-RTU] send (4 bytes): 01 03 C4 0B");
    }

    #[test]
    fn test_console_logger_level() {
        let logger = console_logger!();
        assert!(logger.is_enabled(LogLevel::Info));
        assert!(!logger.is_enabled(LogLevel::Debug));
    }

    #[test]
    fn test_disabled_logger() {
        let logger = CallbackLogger::default();
        assert!(!logger.is_enabled(LogLevel::Error));
        logger.log_frame(LogLevel::Error, "send", "RTU", &[0x00]);
    }
}
