/// Modbus frame model shared by the codecs and transports
///
/// The link layer does not interpret PDUs. It only needs the unit id, the
/// function code and whether a PDU is an exception, so a message is a unit id
/// plus an opaque PDU. The transaction id is only meaningful on stream (MBAP)
/// transports and is carried as 0 on serial lines.

use bytes::Bytes;
use std::fmt;

/// Modbus slave/unit identifier (1-247, 0 = broadcast)
pub type SlaveId = u8;

/// Unit id addressed to every slave on a serial line
pub const BROADCAST_UNIT_ID: SlaveId = 0;

/// Modbus exception codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ModbusException {
    IllegalFunction = 0x01,
    IllegalDataAddress = 0x02,
    IllegalDataValue = 0x03,
    ServerDeviceFailure = 0x04,
    Acknowledge = 0x05,
    ServerDeviceBusy = 0x06,
    MemoryParityError = 0x08,
    GatewayPathUnavailable = 0x0A,
    GatewayTargetDeviceFailedToRespond = 0x0B,
}

impl ModbusException {
    /// Convert from u8 to ModbusException
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(ModbusException::IllegalFunction),
            0x02 => Some(ModbusException::IllegalDataAddress),
            0x03 => Some(ModbusException::IllegalDataValue),
            0x04 => Some(ModbusException::ServerDeviceFailure),
            0x05 => Some(ModbusException::Acknowledge),
            0x06 => Some(ModbusException::ServerDeviceBusy),
            0x08 => Some(ModbusException::MemoryParityError),
            0x0A => Some(ModbusException::GatewayPathUnavailable),
            0x0B => Some(ModbusException::GatewayTargetDeviceFailedToRespond),
            _ => None,
        }
    }

    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Get human-readable description
    pub fn description(self) -> &'static str {
        match self {
            ModbusException::IllegalFunction => "Function code not supported by the device",
            ModbusException::IllegalDataAddress => "Data address not available on the device",
            ModbusException::IllegalDataValue => "Value in the query data field not allowed",
            ModbusException::ServerDeviceFailure => {
                "Unrecoverable error while performing the requested action"
            }
            ModbusException::Acknowledge => "Request accepted, processing will take a long time",
            ModbusException::ServerDeviceBusy => "Device busy with a long-duration command",
            ModbusException::MemoryParityError => "Parity error while reading extended memory",
            ModbusException::GatewayPathUnavailable => {
                "Gateway could not allocate a communication path"
            }
            ModbusException::GatewayTargetDeviceFailedToRespond => {
                "No response from the target device behind the gateway"
            }
        }
    }
}

impl fmt::Display for ModbusException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Modbus Exception 0x{:02X}: {}", self.to_u8(), self.description())
    }
}

/// One whole Modbus frame with its link-specific envelope removed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModbusMessage {
    /// MBAP transaction id, 0 on serial links
    pub transaction_id: u16,
    pub unit_id: SlaveId,
    /// Function code followed by data
    pub pdu: Bytes,
}

impl ModbusMessage {
    pub fn new<P: Into<Bytes>>(unit_id: SlaveId, pdu: P) -> Self {
        Self {
            transaction_id: 0,
            unit_id,
            pdu: pdu.into(),
        }
    }

    /// Build an exception response for `function`
    pub fn exception(unit_id: SlaveId, function: u8, exception: ModbusException) -> Self {
        Self::new(unit_id, vec![function | 0x80, exception.to_u8()])
    }

    pub fn with_transaction_id(mut self, transaction_id: u16) -> Self {
        self.transaction_id = transaction_id;
        self
    }

    /// Function code, or `None` for an empty PDU
    pub fn function_code(&self) -> Option<u8> {
        self.pdu.first().copied()
    }

    pub fn is_exception(&self) -> bool {
        self.function_code().map_or(false, |code| code & 0x80 != 0)
    }

    pub fn exception_code(&self) -> Option<ModbusException> {
        if self.is_exception() {
            self.pdu.get(1).and_then(|code| ModbusException::from_u8(*code))
        } else {
            None
        }
    }

    pub fn is_broadcast(&self) -> bool {
        self.unit_id == BROADCAST_UNIT_ID
    }
}

impl fmt::Display for ModbusMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unit={} pdu={}", self.unit_id, hex::encode_upper(&self.pdu))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exception_conversion() {
        assert_eq!(ModbusException::from_u8(0x02).unwrap(), ModbusException::IllegalDataAddress);
        assert_eq!(ModbusException::IllegalDataAddress.to_u8(), 0x02);
        assert!(ModbusException::from_u8(0x07).is_none());
    }

    #[test]
    fn test_exception_message() {
        let msg = ModbusMessage::exception(5, 0x03, ModbusException::IllegalFunction);
        assert_eq!(msg.pdu.as_ref(), &[0x83, 0x01]);
        assert!(msg.is_exception());
        assert_eq!(msg.exception_code(), Some(ModbusException::IllegalFunction));
        assert_eq!(msg.function_code(), Some(0x83));
    }

    #[test]
    fn test_message_accessors() {
        let msg = ModbusMessage::new(0, vec![0x06, 0x00, 0x01, 0x00, 0x03]);
        assert!(msg.is_broadcast());
        assert!(!msg.is_exception());
        assert_eq!(msg.exception_code(), None);
        assert_eq!(msg.to_string(), "unit=0 pdu=0600010003");

        let empty = ModbusMessage::new(1, Vec::new()).with_transaction_id(7);
        assert_eq!(empty.function_code(), None);
        assert_eq!(empty.transaction_id, 7);
    }
}
