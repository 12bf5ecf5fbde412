//! IEC 60870-5-104 wire codec: APCI framing (I/S/U format) and the ASDU
//! types the adapter exchanges — single/double points, short floats,
//! double commands, short setpoints, and general interrogation.

use bytes::{BufMut, BytesMut};
use std::io;
use tokio_util::codec::{Decoder, Encoder};

/// Upper bound on the information object bytes carried by one ASDU;
/// larger payloads are split across multiple ASDUs.
pub const MAX_ASDU_PAYLOAD: usize = 240;

const START_BYTE: u8 = 0x68;

/// Type identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TypeId {
    /// M_SP_NA_1 single point information
    SinglePoint = 1,
    /// M_DP_NA_1 double point information
    DoublePoint = 3,
    /// M_ME_NC_1 measured value, short float
    MeasuredFloat = 13,
    /// C_DC_NA_1 double command
    DoubleCommand = 46,
    /// C_SE_NC_1 setpoint command, short float
    SetpointFloat = 50,
    /// C_IC_NA_1 general interrogation
    Interrogation = 100,
}

impl TypeId {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(TypeId::SinglePoint),
            3 => Some(TypeId::DoublePoint),
            13 => Some(TypeId::MeasuredFloat),
            46 => Some(TypeId::DoubleCommand),
            50 => Some(TypeId::SetpointFloat),
            100 => Some(TypeId::Interrogation),
            _ => None,
        }
    }
}

/// Cause of transmission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cot {
    Periodic = 1,
    Spontaneous = 3,
    Activation = 6,
    ActivationCon = 7,
    ActivationTerm = 10,
    InterrogatedByStation = 20,
    UnknownCot = 45,
}

impl Cot {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Cot::Periodic,
            3 => Cot::Spontaneous,
            6 => Cot::Activation,
            7 => Cot::ActivationCon,
            10 => Cot::ActivationTerm,
            20 => Cot::InterrogatedByStation,
            _ => Cot::UnknownCot,
        }
    }
}

/// Double point state on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DoublePointValue {
    Intermediate = 0,
    Off = 1,
    On = 2,
    Indeterminate = 3,
}

impl DoublePointValue {
    pub fn from_bool(status: bool) -> Self {
        if status {
            DoublePointValue::On
        } else {
            DoublePointValue::Off
        }
    }

    pub fn from_u8(value: u8) -> Self {
        match value & 0x03 {
            1 => DoublePointValue::Off,
            2 => DoublePointValue::On,
            3 => DoublePointValue::Indeterminate,
            _ => DoublePointValue::Intermediate,
        }
    }
}

/// Information element payload of one object
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Element {
    SinglePoint(bool),
    DoublePoint(DoublePointValue),
    MeasuredFloat(f32),
    DoubleCommand(DoublePointValue),
    SetpointFloat(f32),
    Interrogation(u8),
}

impl Element {
    /// Wire size of the element alone, without the object address
    fn size(&self) -> usize {
        match self {
            Element::SinglePoint(_) | Element::DoublePoint(_) => 1,
            Element::DoubleCommand(_) | Element::Interrogation(_) => 1,
            Element::MeasuredFloat(_) | Element::SetpointFloat(_) => 5,
        }
    }
}

/// One information object: a 3 byte address plus its element.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InformationObject {
    pub address: u16,
    pub element: Element,
}

impl InformationObject {
    pub fn size(&self) -> usize {
        3 + self.element.size()
    }
}

/// Application service data unit
#[derive(Debug, Clone, PartialEq)]
pub struct Asdu {
    pub type_id: TypeId,
    pub cot: Cot,
    /// P/N bit: negative confirmation
    pub negative: bool,
    pub common_address: u16,
    pub objects: Vec<InformationObject>,
}

impl Asdu {
    pub fn new(type_id: TypeId, cot: Cot, common_address: u16) -> Self {
        Self {
            type_id,
            cot,
            negative: false,
            common_address,
            objects: Vec::new(),
        }
    }

    /// Information object bytes currently held
    pub fn payload_size(&self) -> usize {
        self.objects.iter().map(InformationObject::size).sum()
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        dst.put_u8(self.type_id as u8);
        // Variable structure qualifier: object count, SQ = 0
        dst.put_u8(self.objects.len() as u8);
        let mut cot = self.cot as u8;
        if self.negative {
            cot |= 0x40;
        }
        dst.put_u8(cot);
        dst.put_u8(0); // originator address
        dst.put_u16_le(self.common_address);
        for object in &self.objects {
            dst.put_u8((object.address & 0xFF) as u8);
            dst.put_u8((object.address >> 8) as u8);
            dst.put_u8(0);
            match object.element {
                Element::SinglePoint(value) => dst.put_u8(value as u8),
                Element::DoublePoint(value) => dst.put_u8(value as u8),
                Element::DoubleCommand(value) => dst.put_u8(value as u8),
                Element::Interrogation(qoi) => dst.put_u8(qoi),
                Element::MeasuredFloat(value) => {
                    dst.put_f32_le(value);
                    dst.put_u8(0); // quality descriptor, good
                }
                Element::SetpointFloat(value) => {
                    dst.put_f32_le(value);
                    dst.put_u8(0); // qualifier of setpoint
                }
            }
        }
    }

    pub fn decode(src: &[u8]) -> Result<Self, io::Error> {
        let malformed = || io::Error::new(io::ErrorKind::InvalidData, "malformed asdu");
        if src.len() < 6 {
            return Err(malformed());
        }
        let type_id = TypeId::from_u8(src[0]).ok_or_else(malformed)?;
        let count = (src[1] & 0x7F) as usize;
        let cot = Cot::from_u8(src[2] & 0x3F);
        let negative = src[2] & 0x40 != 0;
        let common_address = u16::from_le_bytes([src[4], src[5]]);
        let mut objects = Vec::with_capacity(count);
        let mut offset = 6;
        for _ in 0..count {
            if src.len() < offset + 3 {
                return Err(malformed());
            }
            let address = u16::from_le_bytes([src[offset], src[offset + 1]]);
            offset += 3;
            let element = match type_id {
                TypeId::SinglePoint => {
                    let byte = *src.get(offset).ok_or_else(malformed)?;
                    offset += 1;
                    Element::SinglePoint(byte & 0x01 != 0)
                }
                TypeId::DoublePoint => {
                    let byte = *src.get(offset).ok_or_else(malformed)?;
                    offset += 1;
                    Element::DoublePoint(DoublePointValue::from_u8(byte))
                }
                TypeId::DoubleCommand => {
                    let byte = *src.get(offset).ok_or_else(malformed)?;
                    offset += 1;
                    Element::DoubleCommand(DoublePointValue::from_u8(byte))
                }
                TypeId::Interrogation => {
                    let byte = *src.get(offset).ok_or_else(malformed)?;
                    offset += 1;
                    Element::Interrogation(byte)
                }
                TypeId::MeasuredFloat | TypeId::SetpointFloat => {
                    if src.len() < offset + 5 {
                        return Err(malformed());
                    }
                    let value = f32::from_le_bytes([
                        src[offset],
                        src[offset + 1],
                        src[offset + 2],
                        src[offset + 3],
                    ]);
                    offset += 5;
                    if type_id == TypeId::MeasuredFloat {
                        Element::MeasuredFloat(value)
                    } else {
                        Element::SetpointFloat(value)
                    }
                }
            };
            objects.push(InformationObject { address, element });
        }
        Ok(Self {
            type_id,
            cot,
            negative,
            common_address,
            objects,
        })
    }
}

/// Unnumbered control functions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum UFrame {
    StartDtAct = 0x07,
    StartDtCon = 0x0B,
    StopDtAct = 0x13,
    StopDtCon = 0x23,
    TestFrAct = 0x43,
    TestFrCon = 0x83,
}

impl UFrame {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x07 => Some(UFrame::StartDtAct),
            0x0B => Some(UFrame::StartDtCon),
            0x13 => Some(UFrame::StopDtAct),
            0x23 => Some(UFrame::StopDtCon),
            0x43 => Some(UFrame::TestFrAct),
            0x83 => Some(UFrame::TestFrCon),
            _ => None,
        }
    }
}

/// Application protocol data unit: the three APCI formats
#[derive(Debug, Clone, PartialEq)]
pub enum Apdu {
    /// Numbered information transfer
    I {
        send_seq: u16,
        recv_seq: u16,
        asdu: Asdu,
    },
    /// Numbered supervisory acknowledgement
    S { recv_seq: u16 },
    /// Unnumbered control
    U(UFrame),
}

#[derive(Default)]
pub struct Iec104Codec;

impl Decoder for Iec104Codec {
    type Item = Apdu;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 2 {
            return Ok(None);
        }
        if src[0] != START_BYTE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "missing start byte",
            ));
        }
        let length = src[1] as usize;
        if length < 4 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "short apdu"));
        }
        if src.len() < 2 + length {
            return Ok(None);
        }
        let frame = src.split_to(2 + length);
        let control = &frame[2..6];
        if control[0] & 0x01 == 0 {
            // I format
            let send_seq = ((control[0] as u16) >> 1) | ((control[1] as u16) << 7);
            let recv_seq = ((control[2] as u16) >> 1) | ((control[3] as u16) << 7);
            let asdu = Asdu::decode(&frame[6..])?;
            Ok(Some(Apdu::I {
                send_seq,
                recv_seq,
                asdu,
            }))
        } else if control[0] & 0x03 == 0x01 {
            // S format
            let recv_seq = ((control[2] as u16) >> 1) | ((control[3] as u16) << 7);
            Ok(Some(Apdu::S { recv_seq }))
        } else {
            let function = UFrame::from_u8(control[0])
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "unknown u frame"))?;
            Ok(Some(Apdu::U(function)))
        }
    }
}

impl Encoder<Apdu> for Iec104Codec {
    type Error = io::Error;

    fn encode(&mut self, item: Apdu, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mut body = BytesMut::new();
        match item {
            Apdu::I {
                send_seq,
                recv_seq,
                asdu,
            } => {
                body.put_u8(((send_seq << 1) & 0xFF) as u8);
                body.put_u8((send_seq >> 7) as u8);
                body.put_u8(((recv_seq << 1) & 0xFF) as u8);
                body.put_u8((recv_seq >> 7) as u8);
                asdu.encode(&mut body);
            }
            Apdu::S { recv_seq } => {
                body.put_u8(0x01);
                body.put_u8(0x00);
                body.put_u8(((recv_seq << 1) & 0xFF) as u8);
                body.put_u8((recv_seq >> 7) as u8);
            }
            Apdu::U(function) => {
                body.put_u8(function as u8);
                body.put_u8(0x00);
                body.put_u8(0x00);
                body.put_u8(0x00);
            }
        }
        dst.reserve(2 + body.len());
        dst.put_u8(START_BYTE);
        dst.put_u8(body.len() as u8);
        dst.put_slice(&body);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn round_trip(apdu: Apdu) -> Apdu {
        let mut codec = Iec104Codec;
        let mut buffer = BytesMut::new();
        codec.encode(apdu, &mut buffer).unwrap();
        codec.decode(&mut buffer).unwrap().unwrap()
    }

    #[test]
    fn test_u_frame_round_trip() {
        assert_eq!(
            round_trip(Apdu::U(UFrame::StartDtAct)),
            Apdu::U(UFrame::StartDtAct)
        );
        assert_eq!(
            round_trip(Apdu::U(UFrame::TestFrCon)),
            Apdu::U(UFrame::TestFrCon)
        );
    }

    #[test]
    fn test_s_frame_round_trip() {
        assert_eq!(
            round_trip(Apdu::S { recv_seq: 517 }),
            Apdu::S { recv_seq: 517 }
        );
    }

    #[test]
    fn test_i_frame_round_trip() {
        let mut asdu = Asdu::new(TypeId::MeasuredFloat, Cot::Periodic, 1);
        asdu.objects.push(InformationObject {
            address: 2001,
            element: Element::MeasuredFloat(118.25),
        });
        asdu.objects.push(InformationObject {
            address: 2002,
            element: Element::MeasuredFloat(-3.5),
        });
        let decoded = round_trip(Apdu::I {
            send_seq: 12,
            recv_seq: 7,
            asdu: asdu.clone(),
        });
        assert_eq!(
            decoded,
            Apdu::I {
                send_seq: 12,
                recv_seq: 7,
                asdu
            }
        );
    }

    #[test]
    fn test_double_point_mapping() {
        assert_eq!(DoublePointValue::from_bool(false), DoublePointValue::Off);
        assert_eq!(DoublePointValue::from_bool(true), DoublePointValue::On);
        assert_eq!(DoublePointValue::from_u8(0), DoublePointValue::Intermediate);
        assert_eq!(DoublePointValue::from_u8(3), DoublePointValue::Indeterminate);
    }

    #[test]
    fn test_negative_confirmation_flag() {
        let mut asdu = Asdu::new(TypeId::Interrogation, Cot::ActivationCon, 1);
        asdu.negative = true;
        asdu.objects.push(InformationObject {
            address: 0,
            element: Element::Interrogation(21),
        });
        let decoded = round_trip(Apdu::I {
            send_seq: 0,
            recv_seq: 0,
            asdu: asdu.clone(),
        });
        match decoded {
            Apdu::I { asdu: decoded, .. } => {
                assert!(decoded.negative);
                assert_eq!(decoded.cot, Cot::ActivationCon);
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
