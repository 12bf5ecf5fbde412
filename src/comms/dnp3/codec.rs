//! DNP3 wire codec, contract level: a link frame carrying one application
//! fragment, with the object groups the adapter exchanges — class reads
//! (g60), binary inputs with flags (g1v2), short float analog inputs
//! (g30v5), CROB commands (g12v1), and float analog outputs (g41v3).

use bitflags::bitflags;
use bytes::{Buf, BufMut, BytesMut};
use std::io;
use tokio_util::codec::{Decoder, Encoder};

const START: u16 = 0x0564;

bitflags! {
    /// Event/static class assignment of a point and the class selector of
    /// an integrity scan.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ClassField: u8 {
        const CLASS_0 = 0x01;
        const CLASS_1 = 0x02;
        const CLASS_2 = 0x04;
        const CLASS_3 = 0x08;
    }
}

impl ClassField {
    pub fn all_classes() -> Self {
        ClassField::CLASS_0 | ClassField::CLASS_1 | ClassField::CLASS_2 | ClassField::CLASS_3
    }
}

/// Control relay output block operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OperationType {
    Nul = 0x00,
    LatchOn = 0x03,
    LatchOff = 0x04,
}

impl OperationType {
    pub fn from_bool(value: bool) -> Self {
        if value {
            OperationType::LatchOn
        } else {
            OperationType::LatchOff
        }
    }

    fn from_u8(value: u8) -> Self {
        match value & 0x0F {
            0x03 => OperationType::LatchOn,
            0x04 => OperationType::LatchOff,
            _ => OperationType::Nul,
        }
    }
}

/// Command point status returned in operate responses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CommandStatus {
    Success = 0,
    Timeout = 1,
    NoSelect = 2,
    FormatError = 3,
    NotSupported = 4,
    AlreadyActive = 5,
    HardwareError = 6,
    OutOfRange = 12,
}

impl CommandStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => CommandStatus::Success,
            1 => CommandStatus::Timeout,
            2 => CommandStatus::NoSelect,
            3 => CommandStatus::FormatError,
            4 => CommandStatus::NotSupported,
            5 => CommandStatus::AlreadyActive,
            6 => CommandStatus::HardwareError,
            _ => CommandStatus::OutOfRange,
        }
    }
}

/// Application layer function codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AppFunction {
    Read = 0x01,
    Select = 0x03,
    Operate = 0x04,
    DirectOperate = 0x05,
    Response = 0x81,
    Unsolicited = 0x82,
}

impl AppFunction {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(AppFunction::Read),
            0x03 => Some(AppFunction::Select),
            0x04 => Some(AppFunction::Operate),
            0x05 => Some(AppFunction::DirectOperate),
            0x81 => Some(AppFunction::Response),
            0x82 => Some(AppFunction::Unsolicited),
            _ => None,
        }
    }
}

/// One object header plus its points
#[derive(Debug, Clone, PartialEq)]
pub enum ObjectBlock {
    /// g60v1..v4, qualifier "all objects"
    ClassRead(ClassField),
    /// g1v2 binary input with flags, prefixed by 16 bit indexes
    BinaryInputs(Vec<(u16, bool)>),
    /// g30v5 short float analog input, prefixed by 16 bit indexes
    AnalogInputs(Vec<(u16, f32)>),
    /// g12v1 control relay output block
    Crob {
        index: u16,
        operation: OperationType,
        status: CommandStatus,
    },
    /// g41v3 analog output, short float
    AnalogOutput {
        index: u16,
        value: f32,
        status: CommandStatus,
    },
}

/// One application fragment
#[derive(Debug, Clone, PartialEq)]
pub struct Fragment {
    pub seq: u8,
    pub function: AppFunction,
    pub objects: Vec<ObjectBlock>,
}

impl Fragment {
    pub fn new(seq: u8, function: AppFunction) -> Self {
        Self {
            seq,
            function,
            objects: Vec::new(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut dst = Vec::new();
        // FIR | FIN | sequence
        dst.push(0xC0 | (self.seq & 0x0F));
        dst.push(self.function as u8);
        if matches!(self.function, AppFunction::Response | AppFunction::Unsolicited) {
            // Internal indications, nothing asserted
            dst.extend_from_slice(&[0x00, 0x00]);
        }
        for block in &self.objects {
            match block {
                ObjectBlock::ClassRead(classes) => {
                    for (class, variation) in [
                        (ClassField::CLASS_1, 2u8),
                        (ClassField::CLASS_2, 3u8),
                        (ClassField::CLASS_3, 4u8),
                        (ClassField::CLASS_0, 1u8),
                    ] {
                        if classes.contains(class) {
                            dst.extend_from_slice(&[60, variation, 0x06]);
                        }
                    }
                }
                ObjectBlock::BinaryInputs(points) => {
                    dst.extend_from_slice(&[1, 2, 0x28]);
                    dst.extend_from_slice(&(points.len() as u16).to_le_bytes());
                    for (index, value) in points {
                        dst.extend_from_slice(&index.to_le_bytes());
                        // online flag plus state in the high bit
                        dst.push(if *value { 0x81 } else { 0x01 });
                    }
                }
                ObjectBlock::AnalogInputs(points) => {
                    dst.extend_from_slice(&[30, 5, 0x28]);
                    dst.extend_from_slice(&(points.len() as u16).to_le_bytes());
                    for (index, value) in points {
                        dst.extend_from_slice(&index.to_le_bytes());
                        dst.push(0x01); // online
                        dst.extend_from_slice(&value.to_le_bytes());
                    }
                }
                ObjectBlock::Crob {
                    index,
                    operation,
                    status,
                } => {
                    dst.extend_from_slice(&[12, 1, 0x28, 0x01, 0x00]);
                    dst.extend_from_slice(&index.to_le_bytes());
                    dst.push(*operation as u8);
                    dst.push(1); // count
                    dst.extend_from_slice(&0u32.to_le_bytes()); // on time
                    dst.extend_from_slice(&0u32.to_le_bytes()); // off time
                    dst.push(*status as u8);
                }
                ObjectBlock::AnalogOutput {
                    index,
                    value,
                    status,
                } => {
                    dst.extend_from_slice(&[41, 3, 0x28, 0x01, 0x00]);
                    dst.extend_from_slice(&index.to_le_bytes());
                    dst.extend_from_slice(&value.to_le_bytes());
                    dst.push(*status as u8);
                }
            }
        }
        dst
    }

    pub fn decode(src: &[u8]) -> Result<Self, io::Error> {
        let malformed = || io::Error::new(io::ErrorKind::InvalidData, "malformed fragment");
        if src.len() < 2 {
            return Err(malformed());
        }
        let seq = src[0] & 0x0F;
        let function = AppFunction::from_u8(src[1]).ok_or_else(malformed)?;
        let mut offset = 2;
        if matches!(function, AppFunction::Response | AppFunction::Unsolicited) {
            if src.len() < 4 {
                return Err(malformed());
            }
            offset = 4;
        }
        let mut objects = Vec::new();
        let mut classes = ClassField::empty();
        while offset < src.len() {
            if src.len() < offset + 3 {
                return Err(malformed());
            }
            let group = src[offset];
            let variation = src[offset + 1];
            let qualifier = src[offset + 2];
            offset += 3;
            match (group, variation, qualifier) {
                (60, 1..=4, 0x06) => {
                    classes |= match variation {
                        1 => ClassField::CLASS_0,
                        2 => ClassField::CLASS_1,
                        3 => ClassField::CLASS_2,
                        _ => ClassField::CLASS_3,
                    };
                }
                (1, 2, 0x28) => {
                    let count = read_count(src, &mut offset).ok_or_else(malformed)?;
                    let mut points = Vec::with_capacity(count);
                    for _ in 0..count {
                        if src.len() < offset + 3 {
                            return Err(malformed());
                        }
                        let index = u16::from_le_bytes([src[offset], src[offset + 1]]);
                        let flags = src[offset + 2];
                        offset += 3;
                        points.push((index, flags & 0x80 != 0));
                    }
                    objects.push(ObjectBlock::BinaryInputs(points));
                }
                (30, 5, 0x28) => {
                    let count = read_count(src, &mut offset).ok_or_else(malformed)?;
                    let mut points = Vec::with_capacity(count);
                    for _ in 0..count {
                        if src.len() < offset + 7 {
                            return Err(malformed());
                        }
                        let index = u16::from_le_bytes([src[offset], src[offset + 1]]);
                        let value = f32::from_le_bytes([
                            src[offset + 3],
                            src[offset + 4],
                            src[offset + 5],
                            src[offset + 6],
                        ]);
                        offset += 7;
                        points.push((index, value));
                    }
                    objects.push(ObjectBlock::AnalogInputs(points));
                }
                (12, 1, 0x28) => {
                    let count = read_count(src, &mut offset).ok_or_else(malformed)?;
                    if count != 1 || src.len() < offset + 13 {
                        return Err(malformed());
                    }
                    let index = u16::from_le_bytes([src[offset], src[offset + 1]]);
                    let operation = OperationType::from_u8(src[offset + 2]);
                    let status = CommandStatus::from_u8(src[offset + 12]);
                    offset += 13;
                    objects.push(ObjectBlock::Crob {
                        index,
                        operation,
                        status,
                    });
                }
                (41, 3, 0x28) => {
                    let count = read_count(src, &mut offset).ok_or_else(malformed)?;
                    if count != 1 || src.len() < offset + 7 {
                        return Err(malformed());
                    }
                    let index = u16::from_le_bytes([src[offset], src[offset + 1]]);
                    let value = f32::from_le_bytes([
                        src[offset + 2],
                        src[offset + 3],
                        src[offset + 4],
                        src[offset + 5],
                    ]);
                    let status = CommandStatus::from_u8(src[offset + 6]);
                    offset += 7;
                    objects.push(ObjectBlock::AnalogOutput {
                        index,
                        value,
                        status,
                    });
                }
                _ => return Err(malformed()),
            }
        }
        if !classes.is_empty() {
            objects.push(ObjectBlock::ClassRead(classes));
        }
        Ok(Self {
            seq,
            function,
            objects,
        })
    }
}

fn read_count(src: &[u8], offset: &mut usize) -> Option<usize> {
    if src.len() < *offset + 2 {
        return None;
    }
    let count = u16::from_le_bytes([src[*offset], src[*offset + 1]]) as usize;
    *offset += 2;
    Some(count)
}

/// One link frame: addressing plus the fragment bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkFrame {
    pub destination: u16,
    pub source: u16,
    pub payload: Vec<u8>,
}

#[derive(Default)]
pub struct Dnp3Codec;

impl Decoder for Dnp3Codec {
    type Item = LinkFrame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 8 {
            return Ok(None);
        }
        if u16::from_be_bytes([src[0], src[1]]) != START {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "bad link frame start",
            ));
        }
        let length = u16::from_be_bytes([src[2], src[3]]) as usize;
        if src.len() < 8 + length {
            return Ok(None);
        }
        let destination = u16::from_le_bytes([src[4], src[5]]);
        let source = u16::from_le_bytes([src[6], src[7]]);
        src.advance(8);
        let payload = src.split_to(length).to_vec();
        Ok(Some(LinkFrame {
            destination,
            source,
            payload,
        }))
    }
}

impl Encoder<LinkFrame> for Dnp3Codec {
    type Error = io::Error;

    fn encode(&mut self, item: LinkFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(8 + item.payload.len());
        dst.put_u16(START);
        dst.put_u16(item.payload.len() as u16);
        dst.put_u16_le(item.destination);
        dst.put_u16_le(item.source);
        dst.put_slice(&item.payload);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn round_trip(fragment: Fragment) -> Fragment {
        Fragment::decode(&fragment.encode()).unwrap()
    }

    #[test]
    fn test_class_read_round_trip() {
        let mut fragment = Fragment::new(3, AppFunction::Read);
        fragment
            .objects
            .push(ObjectBlock::ClassRead(ClassField::all_classes()));
        let decoded = round_trip(fragment.clone());
        assert_eq!(decoded, fragment);
    }

    #[test]
    fn test_response_round_trip() {
        let mut fragment = Fragment::new(9, AppFunction::Response);
        fragment
            .objects
            .push(ObjectBlock::BinaryInputs(vec![(0, true), (3, false)]));
        fragment
            .objects
            .push(ObjectBlock::AnalogInputs(vec![(1, 99.5), (2, -0.25)]));
        assert_eq!(round_trip(fragment.clone()), fragment);
    }

    #[test]
    fn test_commands_round_trip() {
        let mut fragment = Fragment::new(0, AppFunction::DirectOperate);
        fragment.objects.push(ObjectBlock::Crob {
            index: 12,
            operation: OperationType::LatchOn,
            status: CommandStatus::Success,
        });
        assert_eq!(round_trip(fragment.clone()), fragment);

        let mut fragment = Fragment::new(1, AppFunction::Operate);
        fragment.objects.push(ObjectBlock::AnalogOutput {
            index: 4,
            value: 13.25,
            status: CommandStatus::Success,
        });
        assert_eq!(round_trip(fragment.clone()), fragment);
    }

    #[test]
    fn test_link_framing() {
        let mut codec = Dnp3Codec;
        let mut buffer = BytesMut::new();
        let frame = LinkFrame {
            destination: 10,
            source: 1,
            payload: Fragment::new(0, AppFunction::Read).encode(),
        };
        codec.encode(frame.clone(), &mut buffer).unwrap();

        let mut partial = BytesMut::from(&buffer[..5]);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        assert_eq!(codec.decode(&mut buffer).unwrap().unwrap(), frame);
    }
}
