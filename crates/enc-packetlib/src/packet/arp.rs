use core::net::Ipv4Addr;

use super::{ensure_len, ensure_out_buf_len, read_u16, write_u16, EtherType, MacAddr, PacketError};

pub const ARP_OP_REQUEST: u16 = 1;
pub const ARP_OP_REPLY: u16 = 2;

const HTYPE_ETHERNET: u16 = 1;

/// ARP body for Ethernet/IPv4 (28 bytes, following the Ethernet header).
#[derive(Clone, Copy, Debug)]
pub struct ArpPacket<'a> {
    data: &'a [u8],
}

impl<'a> ArpPacket<'a> {
    pub const LEN: usize = 28;

    pub fn parse(data: &'a [u8]) -> Result<Self, PacketError> {
        ensure_len(data, 8)?;
        let pkt = Self { data };
        if pkt.hardware_type() != HTYPE_ETHERNET
            || pkt.protocol_type() != EtherType::IPV4
            || data[4] != 6
            || data[5] != 4
        {
            return Err(PacketError::Unsupported("ARP for non Ethernet/IPv4"));
        }
        ensure_len(data, Self::LEN)?;
        Ok(pkt)
    }

    pub fn hardware_type(&self) -> u16 {
        read_u16(self.data, 0)
    }

    pub fn protocol_type(&self) -> u16 {
        read_u16(self.data, 2)
    }

    pub fn opcode(&self) -> u16 {
        read_u16(self.data, 6)
    }

    pub fn sender_mac(&self) -> MacAddr {
        let mut mac = [0u8; 6];
        mac.copy_from_slice(&self.data[8..14]);
        MacAddr(mac)
    }

    pub fn sender_ip(&self) -> Ipv4Addr {
        Ipv4Addr::new(self.data[14], self.data[15], self.data[16], self.data[17])
    }

    pub fn target_mac(&self) -> MacAddr {
        let mut mac = [0u8; 6];
        mac.copy_from_slice(&self.data[18..24]);
        MacAddr(mac)
    }

    pub fn target_ip(&self) -> Ipv4Addr {
        Ipv4Addr::new(self.data[24], self.data[25], self.data[26], self.data[27])
    }
}

pub struct ArpPacketBuilder {
    pub opcode: u16,
    pub sender_mac: MacAddr,
    pub sender_ip: Ipv4Addr,
    pub target_mac: MacAddr,
    pub target_ip: Ipv4Addr,
}

impl ArpPacketBuilder {
    pub fn write(&self, out: &mut [u8]) -> Result<usize, PacketError> {
        ensure_out_buf_len(out, ArpPacket::LEN)?;
        write_u16(out, 0, HTYPE_ETHERNET);
        write_u16(out, 2, EtherType::IPV4);
        out[4] = 6;
        out[5] = 4;
        write_u16(out, 6, self.opcode);
        out[8..14].copy_from_slice(&self.sender_mac.0);
        out[14..18].copy_from_slice(&self.sender_ip.octets());
        out[18..24].copy_from_slice(&self.target_mac.0);
        out[24..28].copy_from_slice(&self.target_ip.octets());
        Ok(ArpPacket::LEN)
    }

    #[cfg(feature = "alloc")]
    pub fn build_vec(&self) -> Result<alloc::vec::Vec<u8>, PacketError> {
        let mut buf = alloc::vec![0u8; ArpPacket::LEN];
        self.write(&mut buf)?;
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_and_parse_request() {
        let builder = ArpPacketBuilder {
            opcode: ARP_OP_REQUEST,
            sender_mac: MacAddr([2, 3, 4, 5, 6, 141]),
            sender_ip: Ipv4Addr::new(192, 168, 1, 141),
            target_mac: MacAddr::UNSPECIFIED,
            target_ip: Ipv4Addr::new(192, 168, 1, 1),
        };
        let bytes = builder.build_vec().unwrap();
        assert_eq!(&bytes[0..8], &[0, 1, 8, 0, 6, 4, 0, 1]);

        let arp = ArpPacket::parse(&bytes).unwrap();
        assert_eq!(arp.opcode(), ARP_OP_REQUEST);
        assert_eq!(arp.sender_mac(), MacAddr([2, 3, 4, 5, 6, 141]));
        assert_eq!(arp.sender_ip(), Ipv4Addr::new(192, 168, 1, 141));
        assert_eq!(arp.target_ip(), Ipv4Addr::new(192, 168, 1, 1));
    }

    #[test]
    fn rejects_non_ipv4_arp() {
        let mut bytes = [0u8; 28];
        bytes[0..8].copy_from_slice(&[0, 6, 8, 0, 6, 4, 0, 1]);
        assert!(matches!(
            ArpPacket::parse(&bytes),
            Err(PacketError::Unsupported(_))
        ));
    }

    #[test]
    fn rejects_truncated_body() {
        let bytes = [0, 1, 8, 0, 6, 4, 0, 1, 0, 0];
        assert!(matches!(
            ArpPacket::parse(&bytes),
            Err(PacketError::Truncated { needed: 28, .. })
        ));
    }
}
