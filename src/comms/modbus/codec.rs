//! Modbus wire codec: MBAP framing for TCP, CRC framing for serial RTU,
//! and the request/response PDUs for the eight supported function codes.

use bytes::{Buf, BufMut, BytesMut};
use std::io;
use tokio_util::codec::{Decoder, Encoder};

/// Maximum quantity of coils/discrete inputs in one read
pub const MAX_READ_BITS: u16 = 2000;
/// Maximum quantity of registers in one read
pub const MAX_READ_REGISTERS: u16 = 125;
/// Maximum quantity of coils in one multi write
pub const MAX_WRITE_BITS: u16 = 1968;
/// Maximum quantity of registers in one multi write
pub const MAX_WRITE_REGISTERS: u16 = 123;

/// Supported function codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FunctionCode {
    ReadCoils = 0x01,
    ReadDiscreteInputs = 0x02,
    ReadHoldingRegisters = 0x03,
    ReadInputRegisters = 0x04,
    WriteSingleCoil = 0x05,
    WriteSingleRegister = 0x06,
    WriteMultipleCoils = 0x0F,
    WriteMultipleRegisters = 0x10,
}

impl FunctionCode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(FunctionCode::ReadCoils),
            0x02 => Some(FunctionCode::ReadDiscreteInputs),
            0x03 => Some(FunctionCode::ReadHoldingRegisters),
            0x04 => Some(FunctionCode::ReadInputRegisters),
            0x05 => Some(FunctionCode::WriteSingleCoil),
            0x06 => Some(FunctionCode::WriteSingleRegister),
            0x0F => Some(FunctionCode::WriteMultipleCoils),
            0x10 => Some(FunctionCode::WriteMultipleRegisters),
            _ => None,
        }
    }
}

/// Standard exception codes carried in error responses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExceptionCode {
    IllegalFunction = 0x01,
    IllegalDataAddress = 0x02,
    IllegalDataValue = 0x03,
    SlaveDeviceFailure = 0x04,
}

/// Modbus Application Protocol header used for TCP framing. The length
/// field counts every byte after it, including the unit identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    pub transaction_id: u16,
    pub protocol_id: u16,
    pub length: u16,
    pub unit_id: u8,
}

impl MbapHeader {
    pub const SIZE: usize = 7;

    pub fn build(unit_id: u8, transaction_id: u16, pdu_length: u16) -> Self {
        Self {
            transaction_id,
            protocol_id: 0,
            length: pdu_length + 1,
            unit_id,
        }
    }

    pub fn parse(buffer: &[u8]) -> Option<Self> {
        if buffer.len() < Self::SIZE {
            return None;
        }
        Some(Self {
            transaction_id: u16::from_be_bytes([buffer[0], buffer[1]]),
            protocol_id: u16::from_be_bytes([buffer[2], buffer[3]]),
            length: u16::from_be_bytes([buffer[4], buffer[5]]),
            unit_id: buffer[6],
        })
    }

    pub fn serialize(&self, dst: &mut BytesMut) {
        dst.put_u16(self.transaction_id);
        dst.put_u16(self.protocol_id);
        dst.put_u16(self.length);
        dst.put_u8(self.unit_id);
    }
}

/// A request PDU
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    ReadCoils { address: u16, quantity: u16 },
    ReadDiscreteInputs { address: u16, quantity: u16 },
    ReadHoldingRegisters { address: u16, quantity: u16 },
    ReadInputRegisters { address: u16, quantity: u16 },
    WriteSingleCoil { address: u16, value: bool },
    WriteSingleRegister { address: u16, value: u16 },
    WriteMultipleCoils { address: u16, values: Vec<bool> },
    WriteMultipleRegisters { address: u16, values: Vec<u16> },
}

impl Request {
    pub fn function(&self) -> FunctionCode {
        match self {
            Request::ReadCoils { .. } => FunctionCode::ReadCoils,
            Request::ReadDiscreteInputs { .. } => FunctionCode::ReadDiscreteInputs,
            Request::ReadHoldingRegisters { .. } => FunctionCode::ReadHoldingRegisters,
            Request::ReadInputRegisters { .. } => FunctionCode::ReadInputRegisters,
            Request::WriteSingleCoil { .. } => FunctionCode::WriteSingleCoil,
            Request::WriteSingleRegister { .. } => FunctionCode::WriteSingleRegister,
            Request::WriteMultipleCoils { .. } => FunctionCode::WriteMultipleCoils,
            Request::WriteMultipleRegisters { .. } => FunctionCode::WriteMultipleRegisters,
        }
    }

    pub fn encode(&self, dst: &mut Vec<u8>) {
        dst.push(self.function() as u8);
        match self {
            Request::ReadCoils { address, quantity }
            | Request::ReadDiscreteInputs { address, quantity }
            | Request::ReadHoldingRegisters { address, quantity }
            | Request::ReadInputRegisters { address, quantity } => {
                dst.extend_from_slice(&address.to_be_bytes());
                dst.extend_from_slice(&quantity.to_be_bytes());
            }
            Request::WriteSingleCoil { address, value } => {
                dst.extend_from_slice(&address.to_be_bytes());
                let wire: u16 = if *value { 0xFF00 } else { 0x0000 };
                dst.extend_from_slice(&wire.to_be_bytes());
            }
            Request::WriteSingleRegister { address, value } => {
                dst.extend_from_slice(&address.to_be_bytes());
                dst.extend_from_slice(&value.to_be_bytes());
            }
            Request::WriteMultipleCoils { address, values } => {
                dst.extend_from_slice(&address.to_be_bytes());
                dst.extend_from_slice(&(values.len() as u16).to_be_bytes());
                let packed = pack_bits(values);
                dst.push(packed.len() as u8);
                dst.extend_from_slice(&packed);
            }
            Request::WriteMultipleRegisters { address, values } => {
                dst.extend_from_slice(&address.to_be_bytes());
                dst.extend_from_slice(&(values.len() as u16).to_be_bytes());
                dst.push((values.len() * 2) as u8);
                for value in values {
                    dst.extend_from_slice(&value.to_be_bytes());
                }
            }
        }
    }

    /// Decodes a request PDU. `Err` carries the exception a server should
    /// answer with: unknown function codes map to `IllegalFunction`,
    /// truncated bodies to `IllegalDataValue`.
    pub fn decode(pdu: &[u8]) -> Result<Self, (u8, ExceptionCode)> {
        if pdu.is_empty() {
            return Err((0, ExceptionCode::IllegalDataValue));
        }
        let function = pdu[0];
        let code =
            FunctionCode::from_u8(function).ok_or((function, ExceptionCode::IllegalFunction))?;
        let body = &pdu[1..];
        let word = |offset: usize| -> Result<u16, (u8, ExceptionCode)> {
            if body.len() < offset + 2 {
                return Err((function, ExceptionCode::IllegalDataValue));
            }
            Ok(u16::from_be_bytes([body[offset], body[offset + 1]]))
        };
        match code {
            FunctionCode::ReadCoils => Ok(Request::ReadCoils {
                address: word(0)?,
                quantity: word(2)?,
            }),
            FunctionCode::ReadDiscreteInputs => Ok(Request::ReadDiscreteInputs {
                address: word(0)?,
                quantity: word(2)?,
            }),
            FunctionCode::ReadHoldingRegisters => Ok(Request::ReadHoldingRegisters {
                address: word(0)?,
                quantity: word(2)?,
            }),
            FunctionCode::ReadInputRegisters => Ok(Request::ReadInputRegisters {
                address: word(0)?,
                quantity: word(2)?,
            }),
            FunctionCode::WriteSingleCoil => {
                let value = match word(2)? {
                    0xFF00 => true,
                    0x0000 => false,
                    _ => return Err((function, ExceptionCode::IllegalDataValue)),
                };
                Ok(Request::WriteSingleCoil {
                    address: word(0)?,
                    value,
                })
            }
            FunctionCode::WriteSingleRegister => Ok(Request::WriteSingleRegister {
                address: word(0)?,
                value: word(2)?,
            }),
            FunctionCode::WriteMultipleCoils => {
                let address = word(0)?;
                let quantity = word(2)? as usize;
                if body.len() < 5 {
                    return Err((function, ExceptionCode::IllegalDataValue));
                }
                let byte_count = body[4] as usize;
                if body.len() < 5 + byte_count || byte_count < quantity.div_ceil(8) {
                    return Err((function, ExceptionCode::IllegalDataValue));
                }
                let values = unpack_bits(&body[5..5 + byte_count], quantity);
                Ok(Request::WriteMultipleCoils { address, values })
            }
            FunctionCode::WriteMultipleRegisters => {
                let address = word(0)?;
                let quantity = word(2)? as usize;
                if body.len() < 5 {
                    return Err((function, ExceptionCode::IllegalDataValue));
                }
                let byte_count = body[4] as usize;
                if byte_count != quantity * 2 || body.len() < 5 + byte_count {
                    return Err((function, ExceptionCode::IllegalDataValue));
                }
                let values = (0..quantity)
                    .map(|i| u16::from_be_bytes([body[5 + i * 2], body[6 + i * 2]]))
                    .collect();
                Ok(Request::WriteMultipleRegisters { address, values })
            }
        }
    }
}

/// A response PDU
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// Packed bit values answering a coil/discrete read
    Bits(FunctionCode, Vec<bool>),
    /// Register values answering a holding/input read
    Registers(FunctionCode, Vec<u16>),
    /// Echo of a single write
    Echo(FunctionCode, u16, u16),
    /// Acknowledgement of a multi write
    WriteAck(FunctionCode, u16, u16),
    /// Exception reply: original function code plus exception
    Exception(u8, ExceptionCode),
}

impl Response {
    pub fn encode(&self, dst: &mut Vec<u8>) {
        match self {
            Response::Bits(function, values) => {
                dst.push(*function as u8);
                let packed = pack_bits(values);
                dst.push(packed.len() as u8);
                dst.extend_from_slice(&packed);
            }
            Response::Registers(function, values) => {
                dst.push(*function as u8);
                dst.push((values.len() * 2) as u8);
                for value in values {
                    dst.extend_from_slice(&value.to_be_bytes());
                }
            }
            Response::Echo(function, address, value) => {
                dst.push(*function as u8);
                dst.extend_from_slice(&address.to_be_bytes());
                dst.extend_from_slice(&value.to_be_bytes());
            }
            Response::WriteAck(function, address, quantity) => {
                dst.push(*function as u8);
                dst.extend_from_slice(&address.to_be_bytes());
                dst.extend_from_slice(&quantity.to_be_bytes());
            }
            Response::Exception(function, code) => {
                dst.push(function | 0x80);
                dst.push(*code as u8);
            }
        }
    }

    /// Decodes a response PDU on the client side. The expected quantity is
    /// needed to unpack bit responses.
    pub fn decode(pdu: &[u8], expected_bits: usize) -> Result<Self, io::Error> {
        let malformed = || io::Error::new(io::ErrorKind::InvalidData, "malformed response pdu");
        if pdu.is_empty() {
            return Err(malformed());
        }
        let function = pdu[0];
        if function & 0x80 != 0 {
            if pdu.len() < 2 {
                return Err(malformed());
            }
            let code = match pdu[1] {
                0x01 => ExceptionCode::IllegalFunction,
                0x02 => ExceptionCode::IllegalDataAddress,
                0x03 => ExceptionCode::IllegalDataValue,
                _ => ExceptionCode::SlaveDeviceFailure,
            };
            return Ok(Response::Exception(function & 0x7F, code));
        }
        let code = FunctionCode::from_u8(function).ok_or_else(malformed)?;
        let body = &pdu[1..];
        match code {
            FunctionCode::ReadCoils | FunctionCode::ReadDiscreteInputs => {
                if body.is_empty() || body.len() < 1 + body[0] as usize {
                    return Err(malformed());
                }
                let byte_count = body[0] as usize;
                Ok(Response::Bits(
                    code,
                    unpack_bits(&body[1..1 + byte_count], expected_bits),
                ))
            }
            FunctionCode::ReadHoldingRegisters | FunctionCode::ReadInputRegisters => {
                if body.is_empty() || body.len() < 1 + body[0] as usize {
                    return Err(malformed());
                }
                let byte_count = body[0] as usize;
                let values = (0..byte_count / 2)
                    .map(|i| u16::from_be_bytes([body[1 + i * 2], body[2 + i * 2]]))
                    .collect();
                Ok(Response::Registers(code, values))
            }
            FunctionCode::WriteSingleCoil | FunctionCode::WriteSingleRegister => {
                if body.len() < 4 {
                    return Err(malformed());
                }
                Ok(Response::Echo(
                    code,
                    u16::from_be_bytes([body[0], body[1]]),
                    u16::from_be_bytes([body[2], body[3]]),
                ))
            }
            FunctionCode::WriteMultipleCoils | FunctionCode::WriteMultipleRegisters => {
                if body.len() < 4 {
                    return Err(malformed());
                }
                Ok(Response::WriteAck(
                    code,
                    u16::from_be_bytes([body[0], body[1]]),
                    u16::from_be_bytes([body[2], body[3]]),
                ))
            }
        }
    }
}

fn pack_bits(values: &[bool]) -> Vec<u8> {
    let mut packed = vec![0u8; values.len().div_ceil(8)];
    for (index, value) in values.iter().enumerate() {
        if *value {
            packed[index / 8] |= 1 << (index % 8);
        }
    }
    packed
}

fn unpack_bits(packed: &[u8], count: usize) -> Vec<bool> {
    (0..count)
        .map(|index| {
            packed
                .get(index / 8)
                .map(|byte| byte & (1 << (index % 8)) != 0)
                .unwrap_or(false)
        })
        .collect()
}

/// One MBAP framed message: the transaction pairing fields plus the raw PDU.
#[derive(Debug, Clone, PartialEq)]
pub struct TcpFrame {
    pub transaction_id: u16,
    pub unit_id: u8,
    pub pdu: Vec<u8>,
}

/// MBAP framing: reads the fixed header, then exactly `length - 1` PDU
/// bytes.
#[derive(Default)]
pub struct TcpCodec;

impl Decoder for TcpCodec {
    type Item = TcpFrame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < MbapHeader::SIZE {
            return Ok(None);
        }
        let header = match MbapHeader::parse(&src[..MbapHeader::SIZE]) {
            Some(header) => header,
            None => return Ok(None),
        };
        if header.protocol_id != 0 || header.length == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "invalid mbap header",
            ));
        }
        let pdu_length = header.length as usize - 1;
        if src.len() < MbapHeader::SIZE + pdu_length {
            return Ok(None);
        }
        src.advance(MbapHeader::SIZE);
        let pdu = src.split_to(pdu_length).to_vec();
        Ok(Some(TcpFrame {
            transaction_id: header.transaction_id,
            unit_id: header.unit_id,
            pdu,
        }))
    }
}

impl Encoder<TcpFrame> for TcpCodec {
    type Error = io::Error;

    fn encode(&mut self, item: TcpFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let header = MbapHeader::build(item.unit_id, item.transaction_id, item.pdu.len() as u16);
        dst.reserve(MbapHeader::SIZE + item.pdu.len());
        header.serialize(dst);
        dst.put_slice(&item.pdu);
        Ok(())
    }
}

/// One RTU framed message
#[derive(Debug, Clone, PartialEq)]
pub struct RtuFrame {
    pub unit_id: u8,
    pub pdu: Vec<u8>,
}

/// Serial RTU framing for the server side: unit id, request PDU, CRC-16.
/// Request lengths are inferred from the function code.
#[derive(Default)]
pub struct RtuCodec;

fn rtu_request_length(buffer: &[u8]) -> Option<usize> {
    // buffer[0] is the unit id, buffer[1] the function code
    let function = *buffer.get(1)?;
    match function {
        0x01..=0x06 => Some(6),
        0x0F | 0x10 => {
            let byte_count = *buffer.get(6)? as usize;
            Some(7 + byte_count)
        }
        // Unknown function: assume the short form so the server can
        // answer with an exception
        _ => Some(6),
    }
}

impl Decoder for RtuCodec {
    type Item = RtuFrame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let body_length = match rtu_request_length(src) {
            Some(length) => length,
            None => return Ok(None),
        };
        if src.len() < body_length + 2 {
            return Ok(None);
        }
        let frame = src.split_to(body_length + 2);
        let expected = crc16(&frame[..body_length]);
        let received = u16::from_le_bytes([frame[body_length], frame[body_length + 1]]);
        if expected != received {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "rtu crc mismatch"));
        }
        Ok(Some(RtuFrame {
            unit_id: frame[0],
            pdu: frame[1..body_length].to_vec(),
        }))
    }
}

impl Encoder<RtuFrame> for RtuCodec {
    type Error = io::Error;

    fn encode(&mut self, item: RtuFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mut frame = Vec::with_capacity(item.pdu.len() + 3);
        frame.push(item.unit_id);
        frame.extend_from_slice(&item.pdu);
        let crc = crc16(&frame);
        dst.reserve(frame.len() + 2);
        dst.put_slice(&frame);
        dst.put_u16_le(crc);
        Ok(())
    }
}

/// CRC-16/MODBUS
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for byte in data {
        crc ^= *byte as u16;
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_mbap_round_trip() {
        let header = MbapHeader::build(0x11, 0x4242, 5);
        let mut bytes = BytesMut::new();
        header.serialize(&mut bytes);
        assert_eq!(bytes.len(), MbapHeader::SIZE);
        let parsed = MbapHeader::parse(&bytes).unwrap();
        assert_eq!(parsed, header);

        let mut again = BytesMut::new();
        parsed.serialize(&mut again);
        assert_eq!(bytes, again);
    }

    #[test]
    fn test_request_round_trip() {
        let requests = [
            Request::ReadCoils {
                address: 5,
                quantity: 1,
            },
            Request::ReadHoldingRegisters {
                address: 10,
                quantity: 3,
            },
            Request::WriteSingleCoil {
                address: 5,
                value: true,
            },
            Request::WriteSingleRegister {
                address: 10,
                value: 32768,
            },
            Request::WriteMultipleCoils {
                address: 0,
                values: vec![true, false, true, true],
            },
            Request::WriteMultipleRegisters {
                address: 7,
                values: vec![1, 2, 3],
            },
        ];
        for request in requests {
            let mut pdu = Vec::new();
            request.encode(&mut pdu);
            assert_eq!(Request::decode(&pdu).unwrap(), request);
        }
    }

    #[test]
    fn test_unknown_function_rejected() {
        let err = Request::decode(&[0x2B, 0x00, 0x00]).unwrap_err();
        assert_eq!(err, (0x2B, ExceptionCode::IllegalFunction));
    }

    #[test]
    fn test_invalid_coil_value_rejected() {
        // Write single coil only accepts 0xFF00 / 0x0000
        let err = Request::decode(&[0x05, 0x00, 0x05, 0x12, 0x34]).unwrap_err();
        assert_eq!(err, (0x05, ExceptionCode::IllegalDataValue));
    }

    #[test]
    fn test_tcp_codec_waits_for_full_frame() {
        let mut codec = TcpCodec;
        let mut buffer = BytesMut::new();
        codec
            .encode(
                TcpFrame {
                    transaction_id: 1,
                    unit_id: 0,
                    pdu: vec![0x01, 0x00, 0x05, 0x00, 0x01],
                },
                &mut buffer,
            )
            .unwrap();

        let mut partial = BytesMut::from(&buffer[..6]);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        let frame = codec.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(frame.transaction_id, 1);
        assert_eq!(frame.pdu, vec![0x01, 0x00, 0x05, 0x00, 0x01]);
    }

    #[test]
    fn test_rtu_crc_round_trip() {
        let mut codec = RtuCodec;
        let mut buffer = BytesMut::new();
        codec
            .encode(
                RtuFrame {
                    unit_id: 3,
                    pdu: vec![0x03, 0x00, 0x0A, 0x00, 0x01],
                },
                &mut buffer,
            )
            .unwrap();
        let frame = codec.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(frame.unit_id, 3);
        assert_eq!(frame.pdu, vec![0x03, 0x00, 0x0A, 0x00, 0x01]);
    }

    #[test]
    fn test_rtu_crc_mismatch_detected() {
        let mut codec = RtuCodec;
        let mut buffer = BytesMut::new();
        codec
            .encode(
                RtuFrame {
                    unit_id: 3,
                    pdu: vec![0x03, 0x00, 0x0A, 0x00, 0x01],
                },
                &mut buffer,
            )
            .unwrap();
        let last = buffer.len() - 1;
        buffer[last] ^= 0xFF;
        assert!(codec.decode(&mut buffer).is_err());
    }
}
