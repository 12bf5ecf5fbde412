//! BACnet/IP codec subset: BVLL + NPDU envelope and the APDUs the adapter
//! uses — WhoIs/IAm binding, ReadProperty / WriteProperty on the present
//! value property, and their acks and errors.

use std::io;

/// BVLL type marker for BACnet/IP
const BVLC_TYPE: u8 = 0x81;
const BVLC_ORIGINAL_UNICAST: u8 = 0x0A;
const BVLC_ORIGINAL_BROADCAST: u8 = 0x0B;

const NPDU_VERSION: u8 = 0x01;

/// Confirmed service choices
const SERVICE_READ_PROPERTY: u8 = 12;
const SERVICE_WRITE_PROPERTY: u8 = 15;
/// Unconfirmed service choices
const SERVICE_I_AM: u8 = 0;
const SERVICE_WHO_IS: u8 = 8;

/// The present value property, the only one the adapter reads or writes
pub const PROP_PRESENT_VALUE: u32 = 85;

/// Writes carry no priority
pub const BACNET_NO_PRIORITY: Option<u8> = None;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ObjectType {
    AnalogInput = 0,
    AnalogOutput = 1,
    BinaryInput = 3,
    BinaryOutput = 4,
    Device = 8,
}

impl ObjectType {
    fn from_u16(value: u16) -> Option<Self> {
        match value {
            0 => Some(ObjectType::AnalogInput),
            1 => Some(ObjectType::AnalogOutput),
            3 => Some(ObjectType::BinaryInput),
            4 => Some(ObjectType::BinaryOutput),
            8 => Some(ObjectType::Device),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectId {
    pub object_type: ObjectType,
    pub instance: u32,
}

impl ObjectId {
    pub fn new(object_type: ObjectType, instance: u32) -> Self {
        Self {
            object_type,
            instance,
        }
    }

    fn to_u32(self) -> u32 {
        ((self.object_type as u32) << 22) | (self.instance & 0x3F_FFFF)
    }

    fn from_u32(value: u32) -> Result<Self, io::Error> {
        let object_type = ObjectType::from_u16((value >> 22) as u16)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "unknown object type"))?;
        Ok(Self {
            object_type,
            instance: value & 0x3F_FFFF,
        })
    }
}

/// Application tagged value carried by property services
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PropertyValue {
    Real(f32),
    Enumerated(u32),
}

impl PropertyValue {
    pub fn as_bool(self) -> bool {
        match self {
            PropertyValue::Enumerated(value) => value != 0,
            PropertyValue::Real(value) => value != 0.0,
        }
    }

    pub fn as_f32(self) -> f32 {
        match self {
            PropertyValue::Real(value) => value,
            PropertyValue::Enumerated(value) => value as f32,
        }
    }
}

/// Decoded BACnet/IP message
#[derive(Debug, Clone, PartialEq)]
pub enum BacnetMessage {
    WhoIs,
    IAm {
        device_id: u32,
        max_apdu: u16,
    },
    ReadProperty {
        invoke_id: u8,
        object: ObjectId,
        property: u32,
    },
    ReadPropertyAck {
        invoke_id: u8,
        object: ObjectId,
        property: u32,
        value: PropertyValue,
    },
    WriteProperty {
        invoke_id: u8,
        object: ObjectId,
        property: u32,
        value: PropertyValue,
        priority: Option<u8>,
    },
    SimpleAck {
        invoke_id: u8,
        service: u8,
    },
    Error {
        invoke_id: u8,
        service: u8,
    },
}

fn put_context_u32(dst: &mut Vec<u8>, tag: u8, value: u32) {
    let bytes = value.to_be_bytes();
    let significant = bytes.iter().position(|byte| *byte != 0).unwrap_or(3);
    let length = 4 - significant;
    dst.push((tag << 4) | 0x08 | length as u8);
    dst.extend_from_slice(&bytes[significant..]);
}

fn put_value(dst: &mut Vec<u8>, value: PropertyValue) {
    match value {
        PropertyValue::Real(real) => {
            dst.push(0x44);
            dst.extend_from_slice(&real.to_be_bytes());
        }
        PropertyValue::Enumerated(enumerated) => {
            dst.push(0x91);
            dst.push(enumerated as u8);
        }
    }
}

struct Reader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn malformed() -> io::Error {
        io::Error::new(io::ErrorKind::InvalidData, "malformed bacnet apdu")
    }

    fn next(&mut self) -> Result<u8, io::Error> {
        let byte = *self.data.get(self.offset).ok_or_else(Self::malformed)?;
        self.offset += 1;
        Ok(byte)
    }

    fn take(&mut self, count: usize) -> Result<&'a [u8], io::Error> {
        if self.data.len() < self.offset + count {
            return Err(Self::malformed());
        }
        let slice = &self.data[self.offset..self.offset + count];
        self.offset += count;
        Ok(slice)
    }

    fn done(&self) -> bool {
        self.offset >= self.data.len()
    }

    /// Context tagged unsigned of up to 4 bytes
    fn context_u32(&mut self, expected_tag: u8) -> Result<u32, io::Error> {
        let header = self.next()?;
        if header >> 4 != expected_tag || header & 0x08 == 0 {
            return Err(Self::malformed());
        }
        let length = (header & 0x07) as usize;
        let mut value: u32 = 0;
        for byte in self.take(length)? {
            value = (value << 8) | *byte as u32;
        }
        Ok(value)
    }

    /// Application tagged value
    fn value(&mut self) -> Result<PropertyValue, io::Error> {
        let header = self.next()?;
        match header {
            0x44 => {
                let bytes = self.take(4)?;
                Ok(PropertyValue::Real(f32::from_be_bytes([
                    bytes[0], bytes[1], bytes[2], bytes[3],
                ])))
            }
            0x91 => Ok(PropertyValue::Enumerated(self.next()? as u32)),
            _ => Err(Self::malformed()),
        }
    }
}

impl BacnetMessage {
    /// Full BACnet/IP datagram: BVLL, NPDU, APDU.
    pub fn encode(&self) -> Vec<u8> {
        let mut apdu = Vec::new();
        let mut broadcast = false;
        match self {
            BacnetMessage::WhoIs => {
                broadcast = true;
                apdu.push(0x10);
                apdu.push(SERVICE_WHO_IS);
            }
            BacnetMessage::IAm { device_id, max_apdu } => {
                broadcast = true;
                apdu.push(0x10);
                apdu.push(SERVICE_I_AM);
                // Device object id
                apdu.push(0xC4);
                apdu.extend_from_slice(
                    &ObjectId::new(ObjectType::Device, *device_id).to_u32().to_be_bytes(),
                );
                // Max APDU length accepted
                apdu.push(0x22);
                apdu.extend_from_slice(&max_apdu.to_be_bytes());
                // Segmentation: none
                apdu.push(0x91);
                apdu.push(3);
                // Vendor id
                apdu.push(0x21);
                apdu.push(0);
            }
            BacnetMessage::ReadProperty {
                invoke_id,
                object,
                property,
            } => {
                apdu.push(0x00);
                apdu.push(0x05); // max apdu 1476
                apdu.push(*invoke_id);
                apdu.push(SERVICE_READ_PROPERTY);
                put_context_u32(&mut apdu, 0, object.to_u32());
                put_context_u32(&mut apdu, 1, *property);
            }
            BacnetMessage::ReadPropertyAck {
                invoke_id,
                object,
                property,
                value,
            } => {
                apdu.push(0x30);
                apdu.push(*invoke_id);
                apdu.push(SERVICE_READ_PROPERTY);
                put_context_u32(&mut apdu, 0, object.to_u32());
                put_context_u32(&mut apdu, 1, *property);
                apdu.push(0x3E); // opening tag 3
                put_value(&mut apdu, *value);
                apdu.push(0x3F); // closing tag 3
            }
            BacnetMessage::WriteProperty {
                invoke_id,
                object,
                property,
                value,
                priority,
            } => {
                apdu.push(0x00);
                apdu.push(0x05);
                apdu.push(*invoke_id);
                apdu.push(SERVICE_WRITE_PROPERTY);
                put_context_u32(&mut apdu, 0, object.to_u32());
                put_context_u32(&mut apdu, 1, *property);
                apdu.push(0x3E);
                put_value(&mut apdu, *value);
                apdu.push(0x3F);
                if let Some(priority) = priority {
                    put_context_u32(&mut apdu, 4, *priority as u32);
                }
            }
            BacnetMessage::SimpleAck { invoke_id, service } => {
                apdu.push(0x20);
                apdu.push(*invoke_id);
                apdu.push(*service);
            }
            BacnetMessage::Error { invoke_id, service } => {
                apdu.push(0x50);
                apdu.push(*invoke_id);
                apdu.push(*service);
                // error class: object, error code: unknown object
                apdu.push(0x91);
                apdu.push(1);
                apdu.push(0x91);
                apdu.push(31);
            }
        }

        let npdu = [NPDU_VERSION, 0x00];
        let length = 4 + npdu.len() + apdu.len();
        let mut datagram = Vec::with_capacity(length);
        datagram.push(BVLC_TYPE);
        datagram.push(if broadcast {
            BVLC_ORIGINAL_BROADCAST
        } else {
            BVLC_ORIGINAL_UNICAST
        });
        datagram.extend_from_slice(&(length as u16).to_be_bytes());
        datagram.extend_from_slice(&npdu);
        datagram.extend_from_slice(&apdu);
        datagram
    }

    pub fn decode(datagram: &[u8]) -> Result<Self, io::Error> {
        let malformed = || io::Error::new(io::ErrorKind::InvalidData, "malformed bacnet datagram");
        if datagram.len() < 6 || datagram[0] != BVLC_TYPE {
            return Err(malformed());
        }
        let length = u16::from_be_bytes([datagram[2], datagram[3]]) as usize;
        if datagram.len() < length || datagram[4] != NPDU_VERSION {
            return Err(malformed());
        }
        // NPDU without routing information is two bytes
        let mut reader = Reader {
            data: &datagram[6..length],
            offset: 0,
        };

        let pdu_type = reader.next()?;
        match pdu_type >> 4 {
            0x1 => {
                let service = reader.next()?;
                match service {
                    SERVICE_WHO_IS => Ok(BacnetMessage::WhoIs),
                    SERVICE_I_AM => {
                        let header = reader.next()?;
                        if header != 0xC4 {
                            return Err(malformed());
                        }
                        let bytes = reader.take(4)?;
                        let object = ObjectId::from_u32(u32::from_be_bytes([
                            bytes[0], bytes[1], bytes[2], bytes[3],
                        ]))?;
                        let header = reader.next()?;
                        let max_apdu = match header {
                            0x21 => reader.next()? as u16,
                            0x22 => {
                                let bytes = reader.take(2)?;
                                u16::from_be_bytes([bytes[0], bytes[1]])
                            }
                            _ => return Err(malformed()),
                        };
                        Ok(BacnetMessage::IAm {
                            device_id: object.instance,
                            max_apdu,
                        })
                    }
                    _ => Err(malformed()),
                }
            }
            0x0 => {
                let _max_apdu = reader.next()?;
                let invoke_id = reader.next()?;
                let service = reader.next()?;
                let object = ObjectId::from_u32(reader.context_u32(0)?)?;
                let property = reader.context_u32(1)?;
                match service {
                    SERVICE_READ_PROPERTY => Ok(BacnetMessage::ReadProperty {
                        invoke_id,
                        object,
                        property,
                    }),
                    SERVICE_WRITE_PROPERTY => {
                        if reader.next()? != 0x3E {
                            return Err(malformed());
                        }
                        let value = reader.value()?;
                        if reader.next()? != 0x3F {
                            return Err(malformed());
                        }
                        let priority = if reader.done() {
                            None
                        } else {
                            Some(reader.context_u32(4)? as u8)
                        };
                        Ok(BacnetMessage::WriteProperty {
                            invoke_id,
                            object,
                            property,
                            value,
                            priority,
                        })
                    }
                    _ => Err(malformed()),
                }
            }
            0x3 => {
                let invoke_id = reader.next()?;
                let service = reader.next()?;
                if service != SERVICE_READ_PROPERTY {
                    return Err(malformed());
                }
                let object = ObjectId::from_u32(reader.context_u32(0)?)?;
                let property = reader.context_u32(1)?;
                if reader.next()? != 0x3E {
                    return Err(malformed());
                }
                let value = reader.value()?;
                Ok(BacnetMessage::ReadPropertyAck {
                    invoke_id,
                    object,
                    property,
                    value,
                })
            }
            0x2 => {
                let invoke_id = reader.next()?;
                let service = reader.next()?;
                Ok(BacnetMessage::SimpleAck { invoke_id, service })
            }
            0x5 => {
                let invoke_id = reader.next()?;
                let service = reader.next()?;
                Ok(BacnetMessage::Error { invoke_id, service })
            }
            _ => Err(malformed()),
        }
    }
}
