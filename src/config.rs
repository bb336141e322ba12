//! Serial connection configuration
//!
//! A [`ConnectionConfig`] is the immutable description of a serial link. It is
//! handed to a [`LinkConnection`](crate::link::LinkConnection) at construction
//! and applied to the host channel every time the link opens.
//!
//! Configurations can be built in code or loaded from YAML/JSON:
//!
//! ```rust
//! use modbus_link::config::{ConnectionConfig, FrameEncoding, Parity};
//!
//! let yaml = r#"
//! port: /dev/ttyUSB0
//! baud_rate: 19200
//! parity: even
//! encoding: ascii
//! data_bits: 7
//! "#;
//!
//! let config = ConnectionConfig::from_yaml_str(yaml)?;
//! assert_eq!(config.baud_rate, 19200);
//! assert_eq!(config.parity, Parity::Even);
//! assert_eq!(config.encoding, FrameEncoding::Ascii);
//! # Ok::<(), modbus_link::ModbusError>(())
//! ```

use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::{de, Deserialize, Deserializer, Serialize};
use tracing::warn;

use crate::error::{ModbusError, ModbusResult};
use crate::utils::validation;

/// Wire framing discipline for a serial link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameEncoding {
    /// Binary framing delimited by a 3.5 character silent interval, CRC-16
    Rtu,
    /// Hex text framing `:` ... `CR LF`, LRC checksum
    Ascii,
}

impl FrameEncoding {
    /// Resolve an encoding by name
    ///
    /// Unknown names revert to RTU with a warning.
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "rtu" => FrameEncoding::Rtu,
            "ascii" => FrameEncoding::Ascii,
            other => {
                warn!("Unknown transport encoding [{}] - reverting to RTU", other);
                FrameEncoding::Rtu
            }
        }
    }

    /// Short protocol label used in packet logs
    pub fn as_str(self) -> &'static str {
        match self {
            FrameEncoding::Rtu => "RTU",
            FrameEncoding::Ascii => "ASCII",
        }
    }
}

impl Default for FrameEncoding {
    fn default() -> Self {
        FrameEncoding::Rtu
    }
}

impl fmt::Display for FrameEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parity checking mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    None,
    Odd,
    Even,
    Mark,
    Space,
}

impl Default for Parity {
    fn default() -> Self {
        Parity::None
    }
}

impl fmt::Display for Parity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Parity::None => "none",
            Parity::Odd => "odd",
            Parity::Even => "even",
            Parity::Mark => "mark",
            Parity::Space => "space",
        };
        f.write_str(s)
    }
}

/// Number of stop bits
///
/// Deserializes from a number (`2`, `1.5`) or the same value quoted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum StopBits {
    #[serde(rename = "1")]
    One,
    #[serde(rename = "1.5")]
    OnePointFive,
    #[serde(rename = "2")]
    Two,
}

impl Default for StopBits {
    fn default() -> Self {
        StopBits::One
    }
}

impl<'de> Deserialize<'de> for StopBits {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Number(f64),
            Text(String),
        }

        let text = match Repr::deserialize(deserializer)? {
            Repr::Number(n) => n.to_string(),
            Repr::Text(s) => s.trim().to_string(),
        };
        match text.as_str() {
            "1" | "1.0" => Ok(StopBits::One),
            "1.5" => Ok(StopBits::OnePointFive),
            "2" | "2.0" => Ok(StopBits::Two),
            other => Err(de::Error::custom(format!(
                "invalid stop bits {}, expected 1, 1.5 or 2",
                other
            ))),
        }
    }
}

impl fmt::Display for StopBits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StopBits::One => "1",
            StopBits::OnePointFive => "1.5",
            StopBits::Two => "2",
        };
        f.write_str(s)
    }
}

/// Line parameters applied to a host channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineSettings {
    pub baud_rate: u32,
    pub data_bits: u8,
    pub stop_bits: StopBits,
    pub parity: Parity,
}

impl fmt::Display for LineSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} baud {}/{}/{}", self.baud_rate, self.data_bits, self.parity, self.stop_bits)
    }
}

/// Serial connection configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Port identifier (device path, COM name or host handle label)
    pub port: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Data bits (5-8)
    pub data_bits: u8,
    /// Stop bits
    pub stop_bits: StopBits,
    /// Parity
    pub parity: Parity,
    /// Frame encoding
    pub encoding: FrameEncoding,
    /// Whether the line echoes every transmitted byte back to the receiver
    pub echo: bool,
    /// Read timeout in milliseconds, 0 means non-blocking
    pub timeout_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            port: String::new(),
            baud_rate: 9600,
            data_bits: 8,
            stop_bits: StopBits::One,
            parity: Parity::None,
            encoding: FrameEncoding::Rtu,
            echo: false,
            timeout_ms: crate::DEFAULT_TIMEOUT_MS,
        }
    }
}

impl ConnectionConfig {
    /// Create a 8N1 RTU configuration for `port`
    pub fn new<S: Into<String>>(port: S, baud_rate: u32) -> Self {
        Self {
            port: port.into(),
            baud_rate,
            ..Default::default()
        }
    }

    /// Create a 7E1 ASCII configuration for `port`
    pub fn ascii<S: Into<String>>(port: S, baud_rate: u32) -> Self {
        Self {
            port: port.into(),
            baud_rate,
            data_bits: 7,
            parity: Parity::Even,
            encoding: FrameEncoding::Ascii,
            ..Default::default()
        }
    }

    pub fn with_encoding(mut self, encoding: FrameEncoding) -> Self {
        self.encoding = encoding;
        self
    }

    pub fn with_parity(mut self, parity: Parity) -> Self {
        self.parity = parity;
        self
    }

    pub fn with_stop_bits(mut self, stop_bits: StopBits) -> Self {
        self.stop_bits = stop_bits;
        self
    }

    pub fn with_data_bits(mut self, data_bits: u8) -> Self {
        self.data_bits = data_bits;
        self
    }

    pub fn with_echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// Read timeout as a `Duration`
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Line parameters to apply to the host channel
    pub fn line_settings(&self) -> LineSettings {
        LineSettings {
            baud_rate: self.baud_rate,
            data_bits: self.data_bits,
            stop_bits: self.stop_bits,
            parity: self.parity,
        }
    }

    /// Validate the configuration values
    pub fn validate(&self) -> ModbusResult<()> {
        validation::validate_port_name(&self.port)?;
        validation::validate_baud_rate(self.baud_rate)?;
        validation::validate_data_bits(self.data_bits)?;
        Ok(())
    }

    /// Parse a configuration from YAML
    pub fn from_yaml_str(yaml: &str) -> ModbusResult<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a configuration from JSON
    pub fn from_json_str(json: &str) -> ModbusResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file, choosing the format by extension
    ///
    /// `.json` files are parsed as JSON, everything else as YAML.
    pub fn load<P: AsRef<Path>>(path: P) -> ModbusResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            ModbusError::configuration(format!("Failed to read {}: {}", path.display(), e))
        })?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::from_json_str(&contents),
            _ => Self::from_yaml_str(&contents),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ConnectionConfig::new("/dev/ttyUSB0", 9600);
        assert_eq!(config.data_bits, 8);
        assert_eq!(config.stop_bits, StopBits::One);
        assert_eq!(config.parity, Parity::None);
        assert_eq!(config.encoding, FrameEncoding::Rtu);
        assert!(!config.echo);
        assert_eq!(config.timeout_ms, crate::DEFAULT_TIMEOUT_MS);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_failures() {
        assert!(ConnectionConfig::new("", 9600).validate().is_err());
        assert!(ConnectionConfig::new("COM1", 0).validate().is_err());
        assert!(ConnectionConfig::new("COM1", 9600).with_data_bits(9).validate().is_err());
        assert!(ConnectionConfig::new("COM1", 9600).with_data_bits(4).validate().is_err());
        assert!(ConnectionConfig::new("COM1", 9600).with_data_bits(5).validate().is_ok());
    }

    #[test]
    fn test_encoding_from_name() {
        assert_eq!(FrameEncoding::from_name("ascii"), FrameEncoding::Ascii);
        assert_eq!(FrameEncoding::from_name(" RTU "), FrameEncoding::Rtu);
        assert_eq!(FrameEncoding::from_name("binary"), FrameEncoding::Rtu);
    }

    #[test]
    fn test_json_round_trip_of_stop_bits() {
        let json =
            r#"{"port":"COM4","baud_rate":38400,"stop_bits":"1.5","parity":"mark","echo":true}"#;
        let config = ConnectionConfig::from_json_str(json).unwrap();
        assert_eq!(config.stop_bits, StopBits::OnePointFive);
        assert_eq!(config.parity, Parity::Mark);
        assert!(config.echo);
        assert_eq!(config.data_bits, 8);
    }

    #[test]
    fn test_numeric_stop_bits() {
        let config = ConnectionConfig::from_json_str(r#"{"port":"COM4","stop_bits":2}"#).unwrap();
        assert_eq!(config.stop_bits, StopBits::Two);

        let config = ConnectionConfig::from_yaml_str("port: COM4\nstop_bits: 1.5\n").unwrap();
        assert_eq!(config.stop_bits, StopBits::OnePointFive);

        let config = ConnectionConfig::from_yaml_str("port: COM4\nstop_bits: '1'\n").unwrap();
        assert_eq!(config.stop_bits, StopBits::One);

        assert!(ConnectionConfig::from_json_str(r#"{"port":"COM4","stop_bits":3}"#).is_err());
        assert_eq!(serde_json::to_string(&StopBits::Two).unwrap(), r#""2""#);
    }

    #[test]
    fn test_yaml_rejects_invalid_values() {
        let yaml = "port: COM1\nbaud_rate: 0\n";
        assert!(matches!(
            ConnectionConfig::from_yaml_str(yaml),
            Err(ModbusError::Configuration { .. })
        ));
    }

    #[test]
    fn test_line_settings_display() {
        let settings = ConnectionConfig::ascii("COM2", 19200).line_settings();
        assert_eq!(settings.to_string(), "19200 baud 7/even/1");
    }
}
