pub mod arp;
pub mod checksum;
pub mod ethernet;
pub mod icmp;
pub mod ipv4;
pub mod mqtt;
pub mod tcp;
pub mod udp;

use core::fmt;

pub use arp::{ArpPacket, ArpPacketBuilder, ARP_OP_REPLY, ARP_OP_REQUEST};
pub use checksum::ChecksumAccumulator;
pub use ethernet::{EtherType, EthernetFrame, EthernetFrameBuilder};
pub use icmp::{IcmpEchoBuilder, Icmpv4Packet, ICMP_ECHO_REPLY, ICMP_ECHO_REQUEST};
pub use ipv4::{Ipv4Packet, Ipv4PacketBuilder, IPPROTO_ICMP, IPPROTO_TCP, IPPROTO_UDP};
pub use mqtt::{ControlPacketType, MqttPacket, QoS};
pub use tcp::{TcpFlags, TcpSegment, TcpSegmentBuilder};
pub use udp::{UdpPacket, UdpPacketBuilder};

#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub const BROADCAST: Self = Self([0xff; 6]);
    pub const UNSPECIFIED: Self = Self([0; 6]);

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }
}

impl fmt::Debug for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            m[0], m[1], m[2], m[3], m[4], m[5]
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PacketError {
    #[error("packet truncated: need {needed} bytes, have {actual}")]
    Truncated { needed: usize, actual: usize },

    #[error("output buffer too small: need {needed} bytes, have {actual}")]
    BufferTooSmall { needed: usize, actual: usize },

    #[error("malformed packet: {0}")]
    Malformed(&'static str),

    #[error("unsupported packet: {0}")]
    Unsupported(&'static str),

    /// Only the one-byte MQTT remaining-length encoding (0..=127) is implemented.
    #[error("MQTT remaining length {0} does not fit the one-byte encoding")]
    RemainingLengthTooLarge(usize),
}

pub(crate) fn ensure_len(buf: &[u8], needed: usize) -> Result<(), PacketError> {
    if buf.len() < needed {
        return Err(PacketError::Truncated {
            needed,
            actual: buf.len(),
        });
    }
    Ok(())
}

pub(crate) fn ensure_out_buf_len(out: &[u8], needed: usize) -> Result<(), PacketError> {
    if out.len() < needed {
        return Err(PacketError::BufferTooSmall {
            needed,
            actual: out.len(),
        });
    }
    Ok(())
}

pub(crate) fn read_u16(buf: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([buf[offset], buf[offset + 1]])
}

pub(crate) fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ])
}

pub(crate) fn write_u16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
}

pub(crate) fn write_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_addr_formats_lowercase_hex() {
        let mac = MacAddr([0x02, 0x03, 0x04, 0x05, 0x06, 0x8d]);
        assert_eq!(mac.to_string(), "02:03:04:05:06:8d");
        assert_eq!(format!("{mac:?}"), "02:03:04:05:06:8d");
        assert!(MacAddr::BROADCAST.is_broadcast());
    }

    #[test]
    fn ensure_len_reports_needed_and_actual() {
        assert_eq!(
            ensure_len(&[0u8; 3], 14),
            Err(PacketError::Truncated {
                needed: 14,
                actual: 3
            })
        );
        assert!(ensure_len(&[0u8; 14], 14).is_ok());
    }
}
