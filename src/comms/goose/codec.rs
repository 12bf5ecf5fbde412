//! IEC 61850 GOOSE codec: the layer 2 frame (EtherType 0x88B8, with the
//! 0x8100 VLAN variant) and the BER tag/length/value triplets making up the
//! GOOSE PDU header and dataset values.

use crate::tags::wall_clock_seconds;
use std::io;

/// EtherType of a GOOSE frame
pub const GOOSE_ETHERTYPE: u16 = 0x88B8;
/// EtherType of the VLAN wrapper
pub const VLAN_ETHERTYPE: u16 = 0x8100;
/// Default destination multicast group
pub const GOOSE_MULTICAST: [u8; 6] = [0x01, 0x0C, 0xCD, 0x01, 0x00, 0x00];

const GOOSE_PDU_TAG: u8 = 0x61;
const TAG_GOCB_REF: u8 = 0x80;
const TAG_TIME_ALLOWED_TO_LIVE: u8 = 0x81;
const TAG_DATSET: u8 = 0x82;
const TAG_GO_ID: u8 = 0x83;
const TAG_T: u8 = 0x84;
const TAG_ST_NUM: u8 = 0x85;
const TAG_SQ_NUM: u8 = 0x86;
const TAG_SIMULATION: u8 = 0x87;
const TAG_CONF_REV: u8 = 0x88;
const TAG_NDS_COM: u8 = 0x89;
const TAG_NUM_ENTRIES: u8 = 0x8A;
const TAG_ALL_DATA: u8 = 0xAB;

const DATA_BOOLEAN: u8 = 0x83;
const DATA_FLOAT: u8 = 0x87;

/// One dataset member value
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DataValue {
    Boolean(bool),
    Float(f32),
}

impl DataValue {
    pub fn kind_matches(&self, other: &DataValue) -> bool {
        matches!(
            (self, other),
            (DataValue::Boolean(_), DataValue::Boolean(_))
                | (DataValue::Float(_), DataValue::Float(_))
        )
    }
}

/// Decoded GOOSE message: the header triplets plus the dataset values.
#[derive(Debug, Clone, PartialEq)]
pub struct GooseMessage {
    pub gocb_ref: String,
    pub time_allowed_to_live: u32,
    pub dataset: String,
    pub go_id: String,
    /// Event timestamp, seconds since the epoch
    pub t: f64,
    pub st_num: u32,
    pub sq_num: u32,
    pub simulation: bool,
    pub conf_rev: u32,
    pub nds_com: bool,
    pub values: Vec<DataValue>,
}

impl GooseMessage {
    pub fn new(gocb_ref: &str, dataset: &str, go_id: &str) -> Self {
        Self {
            gocb_ref: gocb_ref.to_string(),
            time_allowed_to_live: 10000,
            dataset: dataset.to_string(),
            go_id: go_id.to_string(),
            t: wall_clock_seconds(),
            st_num: 1,
            sq_num: 0,
            simulation: false,
            conf_rev: 1,
            nds_com: false,
            values: Vec::new(),
        }
    }
}

fn put_length(dst: &mut Vec<u8>, length: usize) {
    if length < 128 {
        dst.push(length as u8);
    } else if length < 256 {
        dst.push(0x81);
        dst.push(length as u8);
    } else {
        dst.push(0x82);
        dst.extend_from_slice(&(length as u16).to_be_bytes());
    }
}

fn put_tlv(dst: &mut Vec<u8>, tag: u8, content: &[u8]) {
    dst.push(tag);
    put_length(dst, content.len());
    dst.extend_from_slice(content);
}

/// Unsigned integers are trimmed to their significant bytes
fn put_u32_tlv(dst: &mut Vec<u8>, tag: u8, value: u32) {
    let bytes = value.to_be_bytes();
    let start = bytes.iter().position(|byte| *byte != 0).unwrap_or(3);
    put_tlv(dst, tag, &bytes[start..]);
}

fn utc_time(t: f64) -> [u8; 8] {
    let seconds = t.trunc() as u32;
    let fraction = ((t.fract() * (1u64 << 24) as f64) as u32).min((1 << 24) - 1);
    let mut bytes = [0u8; 8];
    bytes[..4].copy_from_slice(&seconds.to_be_bytes());
    bytes[4..7].copy_from_slice(&fraction.to_be_bytes()[1..]);
    bytes[7] = 0x00; // time quality
    bytes
}

impl GooseMessage {
    /// Encodes the GOOSE PDU (the 0x61 TLV), without the link layer.
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::new();
        put_tlv(&mut body, TAG_GOCB_REF, self.gocb_ref.as_bytes());
        put_u32_tlv(&mut body, TAG_TIME_ALLOWED_TO_LIVE, self.time_allowed_to_live);
        put_tlv(&mut body, TAG_DATSET, self.dataset.as_bytes());
        put_tlv(&mut body, TAG_GO_ID, self.go_id.as_bytes());
        put_tlv(&mut body, TAG_T, &utc_time(self.t));
        put_u32_tlv(&mut body, TAG_ST_NUM, self.st_num);
        put_u32_tlv(&mut body, TAG_SQ_NUM, self.sq_num);
        put_tlv(&mut body, TAG_SIMULATION, &[self.simulation as u8]);
        put_u32_tlv(&mut body, TAG_CONF_REV, self.conf_rev);
        put_tlv(&mut body, TAG_NDS_COM, &[self.nds_com as u8]);
        put_u32_tlv(&mut body, TAG_NUM_ENTRIES, self.values.len() as u32);

        let mut all_data = Vec::new();
        for value in &self.values {
            match value {
                DataValue::Boolean(value) => {
                    put_tlv(&mut all_data, DATA_BOOLEAN, &[*value as u8]);
                }
                DataValue::Float(value) => {
                    let mut content = Vec::with_capacity(5);
                    content.push(0x08); // exponent width per IEC 61850-8-1
                    content.extend_from_slice(&value.to_be_bytes());
                    put_tlv(&mut all_data, DATA_FLOAT, &content);
                }
            }
        }
        put_tlv(&mut body, TAG_ALL_DATA, &all_data);

        let mut pdu = Vec::with_capacity(body.len() + 4);
        put_tlv(&mut pdu, GOOSE_PDU_TAG, &body);
        pdu
    }

    pub fn decode(pdu: &[u8]) -> Result<Self, io::Error> {
        let malformed = || io::Error::new(io::ErrorKind::InvalidData, "malformed goose pdu");
        let (tag, body, _) = read_tlv(pdu).ok_or_else(malformed)?;
        if tag != GOOSE_PDU_TAG {
            return Err(malformed());
        }

        let mut message = GooseMessage::new("", "", "");
        message.time_allowed_to_live = 0;
        message.st_num = 0;
        message.conf_rev = 0;
        message.t = 0.0;

        let mut rest = body;
        while !rest.is_empty() {
            let (tag, content, remaining) = read_tlv(rest).ok_or_else(malformed)?;
            rest = remaining;
            match tag {
                TAG_GOCB_REF => message.gocb_ref = String::from_utf8_lossy(content).into_owned(),
                TAG_TIME_ALLOWED_TO_LIVE => message.time_allowed_to_live = read_u32(content),
                TAG_DATSET => message.dataset = String::from_utf8_lossy(content).into_owned(),
                TAG_GO_ID => message.go_id = String::from_utf8_lossy(content).into_owned(),
                TAG_T => {
                    if content.len() == 8 {
                        let seconds =
                            u32::from_be_bytes([content[0], content[1], content[2], content[3]]);
                        let fraction =
                            u32::from_be_bytes([0, content[4], content[5], content[6]]);
                        message.t =
                            seconds as f64 + fraction as f64 / (1u64 << 24) as f64;
                    }
                }
                TAG_ST_NUM => message.st_num = read_u32(content),
                TAG_SQ_NUM => message.sq_num = read_u32(content),
                TAG_SIMULATION => message.simulation = content.first().copied().unwrap_or(0) != 0,
                TAG_CONF_REV => message.conf_rev = read_u32(content),
                TAG_NDS_COM => message.nds_com = content.first().copied().unwrap_or(0) != 0,
                TAG_NUM_ENTRIES => {}
                TAG_ALL_DATA => {
                    let mut data = content;
                    while !data.is_empty() {
                        let (tag, value, remaining) = read_tlv(data).ok_or_else(malformed)?;
                        data = remaining;
                        match tag {
                            DATA_BOOLEAN => {
                                message
                                    .values
                                    .push(DataValue::Boolean(
                                        value.first().copied().unwrap_or(0) != 0,
                                    ));
                            }
                            DATA_FLOAT => {
                                if value.len() != 5 {
                                    return Err(malformed());
                                }
                                message.values.push(DataValue::Float(f32::from_be_bytes([
                                    value[1], value[2], value[3], value[4],
                                ])));
                            }
                            _ => return Err(malformed()),
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(message)
    }
}

fn read_u32(content: &[u8]) -> u32 {
    let mut value: u32 = 0;
    for byte in content.iter().take(4) {
        value = (value << 8) | *byte as u32;
    }
    value
}

/// Reads one TLV, returning (tag, content, rest)
fn read_tlv(src: &[u8]) -> Option<(u8, &[u8], &[u8])> {
    let tag = *src.first()?;
    let first = *src.get(1)?;
    let (length, header) = if first < 128 {
        (first as usize, 2)
    } else if first == 0x81 {
        (*src.get(2)? as usize, 3)
    } else if first == 0x82 {
        (u16::from_be_bytes([*src.get(2)?, *src.get(3)?]) as usize, 4)
    } else {
        return None;
    };
    if src.len() < header + length {
        return None;
    }
    Some((tag, &src[header..header + length], &src[header + length..]))
}

/// Builds the full layer 2 frame around an encoded PDU.
pub fn encode_frame(
    destination: &[u8; 6],
    source: &[u8; 6],
    vlan: Option<u16>,
    appid: u16,
    pdu: &[u8],
) -> Vec<u8> {
    let mut frame = Vec::with_capacity(26 + pdu.len());
    frame.extend_from_slice(destination);
    frame.extend_from_slice(source);
    if let Some(tci) = vlan {
        frame.extend_from_slice(&VLAN_ETHERTYPE.to_be_bytes());
        frame.extend_from_slice(&tci.to_be_bytes());
    }
    frame.extend_from_slice(&GOOSE_ETHERTYPE.to_be_bytes());
    frame.extend_from_slice(&appid.to_be_bytes());
    // Length covers appid through the end of the PDU
    frame.extend_from_slice(&((8 + pdu.len()) as u16).to_be_bytes());
    frame.extend_from_slice(&[0, 0, 0, 0]); // reserved
    frame.extend_from_slice(pdu);
    frame
}

/// Strips the layer 2 framing, returning the APPID and PDU bytes of a
/// GOOSE frame, or None for other traffic.
pub fn parse_frame(frame: &[u8]) -> Option<(u16, &[u8])> {
    if frame.len() < 14 {
        return None;
    }
    let mut offset = 12;
    let mut ethertype = u16::from_be_bytes([frame[offset], frame[offset + 1]]);
    offset += 2;
    if ethertype == VLAN_ETHERTYPE {
        if frame.len() < offset + 4 {
            return None;
        }
        ethertype = u16::from_be_bytes([frame[offset + 2], frame[offset + 3]]);
        offset += 4;
    }
    if ethertype != GOOSE_ETHERTYPE {
        return None;
    }
    if frame.len() < offset + 8 {
        return None;
    }
    let appid = u16::from_be_bytes([frame[offset], frame[offset + 1]]);
    let length = u16::from_be_bytes([frame[offset + 2], frame[offset + 3]]) as usize;
    if length < 8 || frame.len() < offset + length {
        return None;
    }
    Some((appid, &frame[offset + 8..offset + length]))
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample() -> GooseMessage {
        let mut message = GooseMessage::new(
            "DeviceLD/LLN0$GO$gcb01",
            "DeviceLD/LLN0$dsMeas",
            "device-go-1",
        );
        message.st_num = 4;
        message.sq_num = 17;
        message.time_allowed_to_live = 20000;
        message.values = vec![
            DataValue::Boolean(true),
            DataValue::Float(59.97),
            DataValue::Boolean(false),
        ];
        message
    }

    #[test]
    fn test_pdu_round_trip() {
        let message = sample();
        let decoded = GooseMessage::decode(&message.encode()).unwrap();
        assert_eq!(decoded.gocb_ref, message.gocb_ref);
        assert_eq!(decoded.dataset, message.dataset);
        assert_eq!(decoded.go_id, message.go_id);
        assert_eq!(decoded.st_num, 4);
        assert_eq!(decoded.sq_num, 17);
        assert_eq!(decoded.time_allowed_to_live, 20000);
        assert_eq!(decoded.values, message.values);
        assert!((decoded.t - message.t).abs() < 1e-6);
    }

    #[test]
    fn test_frame_round_trip() {
        let message = sample();
        let pdu = message.encode();
        let source = [0x02, 0x00, 0x00, 0x00, 0x00, 0x01];
        let frame = encode_frame(&GOOSE_MULTICAST, &source, None, 0x3001, &pdu);
        let (appid, parsed) = parse_frame(&frame).unwrap();
        assert_eq!(appid, 0x3001);
        assert_eq!(parsed, &pdu[..]);
    }

    #[test]
    fn test_vlan_frame_round_trip() {
        let pdu = sample().encode();
        let source = [0x02, 0x00, 0x00, 0x00, 0x00, 0x01];
        let frame = encode_frame(&GOOSE_MULTICAST, &source, Some(0x8001), 0x3001, &pdu);
        let (appid, parsed) = parse_frame(&frame).unwrap();
        assert_eq!(appid, 0x3001);
        assert_eq!(parsed, &pdu[..]);
    }

    #[test]
    fn test_non_goose_traffic_ignored() {
        let mut frame = vec![0u8; 60];
        frame[12] = 0x08; // IPv4
        frame[13] = 0x00;
        assert!(parse_frame(&frame).is_none());
    }
}
