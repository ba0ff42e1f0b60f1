//! MQTT 3.1.1 control packets, limited to the single-byte remaining-length form.
//!
//! Every packet this client sends or accepts has a remaining length of at most 127 bytes, so the
//! fixed header is always exactly two bytes. Packets announcing a longer body (continuation bit
//! set in byte 1) are rejected as [`PacketError::Unsupported`] rather than misparsed.

use super::{ensure_len, ensure_out_buf_len, read_u16, write_u16, PacketError};

pub const FIXED_HEADER_LEN: usize = 2;
pub const MAX_REMAINING_LEN: usize = 127;
pub const PROTOCOL_LEVEL_3_1_1: u8 = 4;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlPacketType {
    Connect = 1,
    ConnAck = 2,
    Publish = 3,
    PubAck = 4,
    PubRec = 5,
    PubRel = 6,
    PubComp = 7,
    Subscribe = 8,
    SubAck = 9,
    Unsubscribe = 10,
    UnsubAck = 11,
    PingReq = 12,
    PingResp = 13,
    Disconnect = 14,
}

impl ControlPacketType {
    pub fn from_nibble(nibble: u8) -> Option<Self> {
        Some(match nibble {
            1 => Self::Connect,
            2 => Self::ConnAck,
            3 => Self::Publish,
            4 => Self::PubAck,
            5 => Self::PubRec,
            6 => Self::PubRel,
            7 => Self::PubComp,
            8 => Self::Subscribe,
            9 => Self::SubAck,
            10 => Self::Unsubscribe,
            11 => Self::UnsubAck,
            12 => Self::PingReq,
            13 => Self::PingResp,
            14 => Self::Disconnect,
            _ => return None,
        })
    }

    /// Fixed-header flag nibble mandated for this packet type (PUBLISH flags are per packet).
    pub fn reserved_flags(self) -> u8 {
        match self {
            Self::PubRel | Self::Subscribe | Self::Unsubscribe => 0x02,
            _ => 0x00,
        }
    }

    pub fn first_byte(self) -> u8 {
        ((self as u8) << 4) | self.reserved_flags()
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum QoS {
    #[default]
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl QoS {
    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0 => Some(Self::AtMostOnce),
            1 => Some(Self::AtLeastOnce),
            2 => Some(Self::ExactlyOnce),
            _ => None,
        }
    }

    pub fn bits(self) -> u8 {
        self as u8
    }
}

fn remaining_len_byte(remaining_len: usize) -> Result<u8, PacketError> {
    if remaining_len > MAX_REMAINING_LEN {
        return Err(PacketError::RemainingLengthTooLarge(remaining_len));
    }
    Ok(remaining_len as u8)
}

fn write_string(out: &mut [u8], offset: usize, s: &[u8]) -> usize {
    write_u16(out, offset, s.len() as u16);
    out[offset + 2..offset + 2 + s.len()].copy_from_slice(s);
    offset + 2 + s.len()
}

/// One control packet at the start of a TCP payload.
#[derive(Clone, Copy, Debug)]
pub struct MqttPacket<'a> {
    data: &'a [u8],
    remaining_len: usize,
}

impl<'a> MqttPacket<'a> {
    pub fn parse(data: &'a [u8]) -> Result<Self, PacketError> {
        ensure_len(data, FIXED_HEADER_LEN)?;
        if data[1] & 0x80 != 0 {
            return Err(PacketError::Unsupported("multi-byte MQTT remaining length"));
        }
        let remaining_len = data[1] as usize;
        ensure_len(data, FIXED_HEADER_LEN + remaining_len)?;
        Ok(Self {
            data,
            remaining_len,
        })
    }

    pub fn first_byte(&self) -> u8 {
        self.data[0]
    }

    pub fn packet_type(&self) -> Option<ControlPacketType> {
        ControlPacketType::from_nibble(self.data[0] >> 4)
    }

    pub fn flags(&self) -> u8 {
        self.data[0] & 0x0f
    }

    pub fn remaining_len(&self) -> usize {
        self.remaining_len
    }

    /// Bytes consumed by this packet; a TCP payload may hold several packets back to back.
    pub fn len(&self) -> usize {
        FIXED_HEADER_LEN + self.remaining_len
    }

    pub fn body(&self) -> &'a [u8] {
        &self.data[FIXED_HEADER_LEN..self.len()]
    }

    /// Packet identifier of PUBACK, PUBREC, PUBREL, PUBCOMP and UNSUBACK.
    pub fn ack_packet_id(&self) -> Result<u16, PacketError> {
        let body = self.body();
        ensure_len(body, 2)?;
        Ok(read_u16(body, 0))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnAck {
    pub session_present: bool,
    pub return_code: u8,
}

impl ConnAck {
    pub fn parse(packet: &MqttPacket<'_>) -> Result<Self, PacketError> {
        let body = packet.body();
        ensure_len(body, 2)?;
        Ok(Self {
            session_present: body[0] & 0x01 != 0,
            return_code: body[1],
        })
    }

    pub fn accepted(&self) -> bool {
        self.return_code == 0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SubAck {
    pub packet_id: u16,
    /// First granted QoS byte; 0x80 means failure.
    pub return_code: u8,
}

impl SubAck {
    pub fn parse(packet: &MqttPacket<'_>) -> Result<Self, PacketError> {
        let body = packet.body();
        ensure_len(body, 3)?;
        Ok(Self {
            packet_id: read_u16(body, 0),
            return_code: body[2],
        })
    }
}

#[derive(Clone, Copy, Debug)]
pub struct Publish<'a> {
    pub dup: bool,
    pub qos: QoS,
    pub retain: bool,
    pub topic: &'a [u8],
    pub packet_id: Option<u16>,
    pub payload: &'a [u8],
}

impl<'a> Publish<'a> {
    pub fn parse(packet: &MqttPacket<'a>) -> Result<Self, PacketError> {
        if packet.packet_type() != Some(ControlPacketType::Publish) {
            return Err(PacketError::Malformed("not a PUBLISH packet"));
        }
        let flags = packet.flags();
        let qos = QoS::from_bits((flags >> 1) & 0x03)
            .ok_or(PacketError::Malformed("PUBLISH QoS 3"))?;
        let body = packet.body();
        ensure_len(body, 2)?;
        let topic_len = read_u16(body, 0) as usize;
        let mut offset = 2 + topic_len;
        ensure_len(body, offset)?;
        let topic = &body[2..offset];
        let packet_id = if qos == QoS::AtMostOnce {
            None
        } else {
            ensure_len(body, offset + 2)?;
            let id = read_u16(body, offset);
            offset += 2;
            Some(id)
        };
        Ok(Self {
            dup: flags & 0x08 != 0,
            qos,
            retain: flags & 0x01 != 0,
            topic,
            packet_id,
            payload: &body[offset..],
        })
    }

    pub fn topic_str(&self) -> Result<&'a str, PacketError> {
        core::str::from_utf8(self.topic).map_err(|_| PacketError::Malformed("topic is not UTF-8"))
    }
}

pub struct ConnectBuilder<'a> {
    pub client_id: &'a str,
    pub keep_alive_secs: u16,
    pub clean_session: bool,
}

impl ConnectBuilder<'_> {
    pub fn len(&self) -> usize {
        // Protocol name (6) + level (1) + flags (1) + keep-alive (2) + client id string.
        FIXED_HEADER_LEN + 10 + 2 + self.client_id.len()
    }

    pub fn write(&self, out: &mut [u8]) -> Result<usize, PacketError> {
        let len = self.len();
        let rl = remaining_len_byte(len - FIXED_HEADER_LEN)?;
        ensure_out_buf_len(out, len)?;
        out[0] = ControlPacketType::Connect.first_byte();
        out[1] = rl;
        let offset = write_string(out, 2, b"MQTT");
        out[offset] = PROTOCOL_LEVEL_3_1_1;
        out[offset + 1] = if self.clean_session { 0x02 } else { 0x00 };
        write_u16(out, offset + 2, self.keep_alive_secs);
        let end = write_string(out, offset + 4, self.client_id.as_bytes());
        debug_assert_eq!(end, len);
        Ok(len)
    }
}

pub struct PublishBuilder<'a> {
    pub topic: &'a str,
    pub payload: &'a [u8],
    pub qos: QoS,
    pub retain: bool,
    pub dup: bool,
    /// Ignored for QoS 0.
    pub packet_id: u16,
}

impl PublishBuilder<'_> {
    pub fn len(&self) -> usize {
        let id_len = if self.qos == QoS::AtMostOnce { 0 } else { 2 };
        FIXED_HEADER_LEN + 2 + self.topic.len() + id_len + self.payload.len()
    }

    pub fn write(&self, out: &mut [u8]) -> Result<usize, PacketError> {
        let len = self.len();
        let rl = remaining_len_byte(len - FIXED_HEADER_LEN)?;
        ensure_out_buf_len(out, len)?;
        let mut first = ControlPacketType::Publish.first_byte() | (self.qos.bits() << 1);
        if self.dup {
            first |= 0x08;
        }
        if self.retain {
            first |= 0x01;
        }
        out[0] = first;
        out[1] = rl;
        let mut offset = write_string(out, 2, self.topic.as_bytes());
        if self.qos != QoS::AtMostOnce {
            write_u16(out, offset, self.packet_id);
            offset += 2;
        }
        out[offset..len].copy_from_slice(self.payload);
        Ok(len)
    }
}

pub struct SubscribeBuilder<'a> {
    pub packet_id: u16,
    pub topic: &'a str,
    pub requested_qos: QoS,
}

impl SubscribeBuilder<'_> {
    pub fn len(&self) -> usize {
        FIXED_HEADER_LEN + 2 + 2 + self.topic.len() + 1
    }

    pub fn write(&self, out: &mut [u8]) -> Result<usize, PacketError> {
        let len = self.len();
        let rl = remaining_len_byte(len - FIXED_HEADER_LEN)?;
        ensure_out_buf_len(out, len)?;
        out[0] = ControlPacketType::Subscribe.first_byte();
        out[1] = rl;
        write_u16(out, 2, self.packet_id);
        let offset = write_string(out, 4, self.topic.as_bytes());
        out[offset] = self.requested_qos.bits();
        Ok(len)
    }
}

pub struct UnsubscribeBuilder<'a> {
    pub packet_id: u16,
    pub topic: &'a str,
}

impl UnsubscribeBuilder<'_> {
    pub fn len(&self) -> usize {
        FIXED_HEADER_LEN + 2 + 2 + self.topic.len()
    }

    pub fn write(&self, out: &mut [u8]) -> Result<usize, PacketError> {
        let len = self.len();
        let rl = remaining_len_byte(len - FIXED_HEADER_LEN)?;
        ensure_out_buf_len(out, len)?;
        out[0] = ControlPacketType::Unsubscribe.first_byte();
        out[1] = rl;
        write_u16(out, 2, self.packet_id);
        write_string(out, 4, self.topic.as_bytes());
        Ok(len)
    }
}

/// Four-byte acknowledgement (PUBACK, PUBREC, PUBREL, PUBCOMP) carrying `packet_id`.
pub fn write_ack(
    out: &mut [u8],
    packet_type: ControlPacketType,
    packet_id: u16,
) -> Result<usize, PacketError> {
    ensure_out_buf_len(out, 4)?;
    out[0] = packet_type.first_byte();
    out[1] = 2;
    write_u16(out, 2, packet_id);
    Ok(4)
}

/// Two-byte packet with no body (PINGREQ, DISCONNECT).
pub fn write_empty(out: &mut [u8], packet_type: ControlPacketType) -> Result<usize, PacketError> {
    ensure_out_buf_len(out, FIXED_HEADER_LEN)?;
    out[0] = packet_type.first_byte();
    out[1] = 0;
    Ok(FIXED_HEADER_LEN)
}
