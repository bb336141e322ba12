//! Serial port channels backed by `tokio-serial`

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::{ClearBuffer, SerialPort, SerialStream};
use tracing::{debug, warn};

use crate::channel::{ByteChannel, ChannelProvider};
use crate::config::{ConnectionConfig, LineSettings, Parity, StopBits};
use crate::error::{ModbusError, ModbusResult};

fn to_data_bits(bits: u8) -> ModbusResult<tokio_serial::DataBits> {
    match bits {
        5 => Ok(tokio_serial::DataBits::Five),
        6 => Ok(tokio_serial::DataBits::Six),
        7 => Ok(tokio_serial::DataBits::Seven),
        8 => Ok(tokio_serial::DataBits::Eight),
        other => Err(ModbusError::configuration_rejected(format!(
            "Unsupported data bits: {}",
            other
        ))),
    }
}

fn to_stop_bits(stop_bits: StopBits) -> ModbusResult<tokio_serial::StopBits> {
    match stop_bits {
        StopBits::One => Ok(tokio_serial::StopBits::One),
        StopBits::Two => Ok(tokio_serial::StopBits::Two),
        StopBits::OnePointFive => Err(ModbusError::configuration_rejected(
            "1.5 stop bits are not supported by the host serial driver",
        )),
    }
}

fn to_parity(parity: Parity) -> ModbusResult<tokio_serial::Parity> {
    match parity {
        Parity::None => Ok(tokio_serial::Parity::None),
        Parity::Odd => Ok(tokio_serial::Parity::Odd),
        Parity::Even => Ok(tokio_serial::Parity::Even),
        Parity::Mark | Parity::Space => Err(ModbusError::configuration_rejected(format!(
            "{} parity is not supported by the host serial driver",
            parity
        ))),
    }
}

/// An open serial port
pub struct SerialChannel {
    name: String,
    port: Option<SerialStream>,
}

impl SerialChannel {
    fn port_mut(&mut self) -> ModbusResult<&mut SerialStream> {
        let name = &self.name;
        self.port
            .as_mut()
            .ok_or_else(|| ModbusError::connection(format!("Serial port {} is closed", name)))
    }
}

#[async_trait]
impl ByteChannel for SerialChannel {
    fn port_name(&self) -> String {
        self.port
            .as_ref()
            .and_then(|port| port.name())
            .unwrap_or_else(|| self.name.clone())
    }

    fn apply_line_settings(&mut self, settings: &LineSettings) -> ModbusResult<()> {
        let data_bits = to_data_bits(settings.data_bits)?;
        let stop_bits = to_stop_bits(settings.stop_bits)?;
        let parity = to_parity(settings.parity)?;

        let port = self.port_mut()?;
        let rejected = |e: tokio_serial::Error| ModbusError::configuration_rejected(e.to_string());
        port.set_baud_rate(settings.baud_rate).map_err(rejected)?;
        port.set_data_bits(data_bits).map_err(rejected)?;
        port.set_stop_bits(stop_bits).map_err(rejected)?;
        port.set_parity(parity).map_err(rejected)?;

        debug!("Serial port {} set to {}", self.name, settings);
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8]) -> ModbusResult<usize> {
        let port = self.port_mut()?;
        Ok(port.read(buf).await?)
    }

    async fn write(&mut self, buf: &[u8]) -> ModbusResult<usize> {
        let port = self.port_mut()?;
        let written = port.write(buf).await?;
        port.flush().await?;
        Ok(written)
    }

    fn bytes_available(&mut self) -> ModbusResult<usize> {
        let port = self.port_mut()?;
        Ok(port.bytes_to_read()? as usize)
    }

    fn clear_input(&mut self) -> ModbusResult<usize> {
        let port = self.port_mut()?;
        let pending = port.bytes_to_read()? as usize;
        port.clear(ClearBuffer::Input)?;
        Ok(pending)
    }

    async fn close(&mut self) {
        if let Some(mut port) = self.port.take() {
            if let Err(e) = port.flush().await {
                warn!("Failed to flush serial port {} on close: {}", self.name, e);
            }
            debug!("Serial port {} closed", self.name);
        }
    }
}

/// Provider opening host serial ports by name
#[derive(Debug, Default, Clone, Copy)]
pub struct SerialProvider;

impl SerialProvider {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ChannelProvider for SerialProvider {
    async fn acquire(&self, config: &ConnectionConfig) -> ModbusResult<Box<dyn ByteChannel>> {
        let builder = tokio_serial::new(&config.port, config.baud_rate);
        let port = SerialStream::open(&builder)
            .map_err(|e| ModbusError::link_unavailable(&config.port, e.to_string()))?;

        Ok(Box::new(SerialChannel {
            name: config.port.clone(),
            port: Some(port),
        }))
    }

    fn available_ports(&self) -> Vec<String> {
        match tokio_serial::available_ports() {
            Ok(ports) => ports.into_iter().map(|p| p.port_name).collect(),
            Err(e) => {
                warn!("Failed to enumerate serial ports: {}", e);
                Vec::new()
            }
        }
    }
}
