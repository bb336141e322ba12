//! Wire codecs for the three Modbus envelopes
//!
//! - **RTU**: `unit | pdu | crc_lo crc_hi` with CRC-16/MODBUS
//! - **ASCII**: `: hex(unit | pdu | lrc) CR LF`
//! - **MBAP**: `tid(2) | protocol 0(2) | length(2) | unit | pdu` for stream links
//!
//! Decoders return [`ModbusError::Frame`] or [`ModbusError::CrcMismatch`] on
//! malformed input; transports wrap those as recoverable protocol I/O errors.

use bytes::{BufMut, Bytes, BytesMut};
use crc::{Crc, CRC_16_MODBUS};

use crate::error::{ModbusError, ModbusResult};
use crate::protocol::ModbusMessage;

/// CRC calculator for RTU
const CRC_MODBUS: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// MBAP header size including the unit id
pub const MBAP_HEADER_LEN: usize = 7;

/// ASCII frame start character
pub const ASCII_START: u8 = b':';

/// ASCII frame terminator
pub const ASCII_END: [u8; 2] = [b'\r', b'\n'];

/// Largest PDU a Modbus frame can carry
pub const MAX_PDU_SIZE: usize = 253;

/// Calculate the RTU CRC of `data`
pub fn calculate_crc(data: &[u8]) -> u16 {
    CRC_MODBUS.checksum(data)
}

/// Calculate the LRC of `data`
///
/// Two's complement of the 8-bit sum of all bytes.
pub fn calculate_lrc(data: &[u8]) -> u8 {
    data.iter()
        .fold(0u8, |sum, &b| sum.wrapping_add(b))
        .wrapping_neg()
}

/// Encode a message as an RTU frame
pub fn encode_rtu(message: &ModbusMessage) -> Bytes {
    let mut frame = BytesMut::with_capacity(message.pdu.len() + 3);
    frame.put_u8(message.unit_id);
    frame.extend_from_slice(&message.pdu);
    let crc = calculate_crc(&frame);
    frame.put_u16_le(crc); // CRC is little-endian in RTU
    frame.freeze()
}

/// Decode an RTU frame
pub fn decode_rtu(frame: &[u8]) -> ModbusResult<ModbusMessage> {
    if frame.len() < 4 {
        return Err(ModbusError::frame(format!("RTU frame too short: {} bytes", frame.len())));
    }

    let data_len = frame.len() - 2;
    let received = u16::from_le_bytes([frame[data_len], frame[data_len + 1]]);
    let calculated = calculate_crc(&frame[..data_len]);
    if received != calculated {
        return Err(ModbusError::crc_mismatch(calculated, received));
    }

    Ok(ModbusMessage::new(frame[0], Bytes::copy_from_slice(&frame[1..data_len])))
}

/// Encode a message as an ASCII frame
pub fn encode_ascii(message: &ModbusMessage) -> Bytes {
    let mut raw = Vec::with_capacity(message.pdu.len() + 2);
    raw.push(message.unit_id);
    raw.extend_from_slice(&message.pdu);
    raw.push(calculate_lrc(&raw));

    let mut frame = BytesMut::with_capacity(raw.len() * 2 + 3);
    frame.put_u8(ASCII_START);
    frame.extend_from_slice(hex::encode_upper(&raw).as_bytes());
    frame.extend_from_slice(&ASCII_END);
    frame.freeze()
}

/// Decode an ASCII frame, including its start and end markers
pub fn decode_ascii(frame: &[u8]) -> ModbusResult<ModbusMessage> {
    // ":" + unit + function + lrc + CR LF
    if frame.len() < 9 {
        return Err(ModbusError::frame("ASCII frame too short"));
    }
    if frame[0] != ASCII_START {
        return Err(ModbusError::frame("Invalid ASCII frame start character"));
    }
    if !frame.ends_with(&ASCII_END) {
        return Err(ModbusError::frame("Invalid ASCII frame end characters"));
    }

    let text = &frame[1..frame.len() - 2];
    if text.len() % 2 != 0 {
        return Err(ModbusError::frame("Odd number of hex digits in ASCII frame"));
    }

    let mut raw = hex::decode(text)
        .map_err(|e| ModbusError::frame(format!("Invalid ASCII hex: {}", e)))?;

    let received = match raw.pop() {
        Some(lrc) => lrc,
        None => return Err(ModbusError::frame("ASCII frame has no LRC")),
    };
    let calculated = calculate_lrc(&raw);
    if received != calculated {
        return Err(ModbusError::frame(format!(
            "LRC mismatch: expected 0x{:02X}, got 0x{:02X}",
            calculated, received
        )));
    }

    let pdu = Bytes::copy_from_slice(&raw[1..]);
    Ok(ModbusMessage::new(raw[0], pdu))
}

/// Encode a message with an MBAP header
pub fn encode_mbap(message: &ModbusMessage) -> Bytes {
    let mut frame = BytesMut::with_capacity(MBAP_HEADER_LEN + message.pdu.len());
    frame.put_u16(message.transaction_id);
    frame.put_u16(0);
    frame.put_u16((message.pdu.len() + 1) as u16);
    frame.put_u8(message.unit_id);
    frame.extend_from_slice(&message.pdu);
    frame.freeze()
}

/// Parsed MBAP header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    pub transaction_id: u16,
    pub unit_id: u8,
    /// Number of PDU bytes following the header
    pub pdu_len: usize,
}

/// Decode and validate an MBAP header
pub fn decode_mbap_header(header: &[u8; MBAP_HEADER_LEN]) -> ModbusResult<MbapHeader> {
    let transaction_id = u16::from_be_bytes([header[0], header[1]]);
    let protocol_id = u16::from_be_bytes([header[2], header[3]]);
    let length = u16::from_be_bytes([header[4], header[5]]) as usize;

    if protocol_id != 0 {
        return Err(ModbusError::frame(format!("Invalid MBAP protocol id: {}", protocol_id)));
    }
    if length < 2 || length - 1 > MAX_PDU_SIZE {
        return Err(ModbusError::frame(format!("Invalid MBAP length: {}", length)));
    }

    Ok(MbapHeader {
        transaction_id,
        unit_id: header[6],
        pdu_len: length - 1,
    })
}
