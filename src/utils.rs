/// Utility functions and helpers for the link layer
///
/// Line timing, configuration validation, hex formatting and operation
/// timing shared by the transports and loops.

use std::time::{Duration, Instant};
use tracing::{debug, warn};
use crate::error::{ModbusError, ModbusResult};

/// Timer for measuring operation duration
pub struct OperationTimer {
    start: Instant,
    operation_name: String,
}

impl OperationTimer {
    /// Start a new timer
    pub fn start(operation_name: &str) -> Self {
        debug!("Starting operation: {}", operation_name);
        Self {
            start: Instant::now(),
            operation_name: operation_name.to_string(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Stop the timer and return duration
    pub fn stop(self) -> Duration {
        let duration = self.start.elapsed();
        debug!("Operation '{}' completed in {:?}", self.operation_name, duration);
        duration
    }

    /// Stop timer and log result
    pub fn stop_and_log(self, success: bool) -> Duration {
        let duration = self.start.elapsed();
        if success {
            debug!("Operation '{}' succeeded in {:?}", self.operation_name, duration);
        } else {
            warn!("Operation '{}' failed after {:?}", self.operation_name, duration);
        }
        duration
    }
}

/// Serial line timing
pub mod timing {
    use super::*;

    /// Transmission time of one 11-bit character at `baud_rate`
    pub fn character_time(baud_rate: u32) -> Duration {
        let baud = baud_rate.max(1) as u64;
        Duration::from_nanos(11_000_000_000 / baud)
    }

    /// RTU inter-frame silent interval (3.5 character times)
    ///
    /// Fixed at 1.75 ms above 19200 baud.
    pub fn frame_gap(baud_rate: u32) -> Duration {
        if baud_rate > 19200 {
            Duration::from_micros(1750)
        } else {
            character_time(baud_rate) * 7 / 2
        }
    }
}

/// Configuration validation utilities
pub mod validation {
    use super::*;

    /// Validate slave ID (1-247)
    pub fn validate_slave_id(slave_id: u8) -> ModbusResult<()> {
        if slave_id == 0 || slave_id > 247 {
            return Err(ModbusError::configuration(
                format!("Invalid slave ID: {} (must be 1-247)", slave_id)
            ));
        }
        Ok(())
    }

    pub fn validate_baud_rate(baud_rate: u32) -> ModbusResult<()> {
        if baud_rate == 0 {
            return Err(ModbusError::configuration("Baud rate must be greater than 0"));
        }
        Ok(())
    }

    pub fn validate_data_bits(data_bits: u8) -> ModbusResult<()> {
        if !(5..=8).contains(&data_bits) {
            return Err(ModbusError::configuration(
                format!("Invalid data bits: {} (must be 5-8)", data_bits)
            ));
        }
        Ok(())
    }

    pub fn validate_port_name(port: &str) -> ModbusResult<()> {
        if port.trim().is_empty() {
            return Err(ModbusError::configuration("Port name must not be empty"));
        }
        Ok(())
    }
}

/// Formatting and display utilities
pub mod format {
    use super::*;

    /// Format byte array as hex string
    pub fn bytes_to_hex(bytes: &[u8]) -> String {
        bytes.iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Format duration in a human-readable way
    pub fn format_duration(duration: Duration) -> String {
        let millis = duration.as_millis();
        if millis < 1000 {
            format!("{}ms", millis)
        } else if millis < 60_000 {
            format!("{:.2}s", duration.as_secs_f64())
        } else {
            let mins = millis / 60_000;
            let secs = (millis % 60_000) as f64 / 1000.0;
            format!("{}m {:.1}s", mins, secs)
        }
    }
}
