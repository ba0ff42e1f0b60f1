use core::net::Ipv4Addr;

use super::{checksum, ensure_len, ensure_out_buf_len, read_u16, write_u16, PacketError};

pub const IPPROTO_ICMP: u8 = 1;
pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;

const FLAG_DONT_FRAGMENT: u16 = 0x4000;

#[derive(Clone, Copy, Debug)]
pub struct Ipv4Packet<'a> {
    data: &'a [u8],
    header_len: usize,
    total_len: usize,
}

impl<'a> Ipv4Packet<'a> {
    pub const MIN_HEADER_LEN: usize = 20;

    /// Validates version, IHL and total length against the buffer. Trailing Ethernet padding
    /// past `total_len` is excluded from [`Ipv4Packet::payload`]. The header checksum is not
    /// checked here; see [`Ipv4Packet::checksum_valid`].
    pub fn parse(data: &'a [u8]) -> Result<Self, PacketError> {
        ensure_len(data, Self::MIN_HEADER_LEN)?;
        let version = data[0] >> 4;
        if version != 4 {
            return Err(PacketError::Malformed("IP version != 4"));
        }
        let ihl = (data[0] & 0x0f) as usize;
        if ihl < 5 {
            return Err(PacketError::Malformed("IPv4 IHL < 5"));
        }
        let header_len = ihl * 4;
        ensure_len(data, header_len)?;
        let total_len = read_u16(data, 2) as usize;
        if total_len < header_len {
            return Err(PacketError::Malformed("IPv4 total length < header length"));
        }
        ensure_len(data, total_len)?;
        Ok(Self {
            data,
            header_len,
            total_len,
        })
    }

    pub fn header_len(&self) -> usize {
        self.header_len
    }

    pub fn total_len(&self) -> usize {
        self.total_len
    }

    pub fn dscp_ecn(&self) -> u8 {
        self.data[1]
    }

    pub fn identification(&self) -> u16 {
        read_u16(self.data, 4)
    }

    pub fn flags_fragment(&self) -> u16 {
        read_u16(self.data, 6)
    }

    pub fn dont_fragment(&self) -> bool {
        self.flags_fragment() & FLAG_DONT_FRAGMENT != 0
    }

    pub fn ttl(&self) -> u8 {
        self.data[8]
    }

    pub fn protocol(&self) -> u8 {
        self.data[9]
    }

    pub fn header_checksum(&self) -> u16 {
        read_u16(self.data, 10)
    }

    pub fn src_ip(&self) -> Ipv4Addr {
        Ipv4Addr::new(self.data[12], self.data[13], self.data[14], self.data[15])
    }

    pub fn dst_ip(&self) -> Ipv4Addr {
        Ipv4Addr::new(self.data[16], self.data[17], self.data[18], self.data[19])
    }

    pub fn header(&self) -> &'a [u8] {
        &self.data[..self.header_len]
    }

    pub fn payload(&self) -> &'a [u8] {
        &self.data[self.header_len..self.total_len]
    }

    pub fn checksum_valid(&self) -> bool {
        checksum::ipv4_header_checksum(self.header()) == 0
    }
}

/// Writes a 20-byte header (no options) in front of `payload_len` bytes already placed at
/// `out[20..]`.
pub struct Ipv4PacketBuilder {
    pub dscp_ecn: u8,
    pub identification: u16,
    pub dont_fragment: bool,
    pub ttl: u8,
    pub protocol: u8,
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
}

impl Ipv4PacketBuilder {
    pub fn write(&self, out: &mut [u8], payload_len: usize) -> Result<usize, PacketError> {
        let len = Ipv4Packet::MIN_HEADER_LEN + payload_len;
        if len > u16::MAX as usize {
            return Err(PacketError::Malformed("IPv4 total length > 65535"));
        }
        ensure_out_buf_len(out, len)?;

        out[0] = (4 << 4) | 5;
        out[1] = self.dscp_ecn;
        write_u16(out, 2, len as u16);
        write_u16(out, 4, self.identification);
        let flags = if self.dont_fragment { FLAG_DONT_FRAGMENT } else { 0 };
        write_u16(out, 6, flags);
        out[8] = self.ttl;
        out[9] = self.protocol;
        write_u16(out, 10, 0);
        out[12..16].copy_from_slice(&self.src_ip.octets());
        out[16..20].copy_from_slice(&self.dst_ip.octets());
        let csum = checksum::ipv4_header_checksum(&out[..Ipv4Packet::MIN_HEADER_LEN]);
        write_u16(out, 10, csum);
        Ok(len)
    }

    #[cfg(feature = "alloc")]
    pub fn build_vec(&self, payload: &[u8]) -> Result<alloc::vec::Vec<u8>, PacketError> {
        let mut buf = alloc::vec![0u8; Ipv4Packet::MIN_HEADER_LEN + payload.len()];
        buf[Ipv4Packet::MIN_HEADER_LEN..].copy_from_slice(payload);
        self.write(&mut buf, payload.len())?;
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder() -> Ipv4PacketBuilder {
        Ipv4PacketBuilder {
            dscp_ecn: 0,
            identification: 0x1234,
            dont_fragment: true,
            ttl: 128,
            protocol: IPPROTO_TCP,
            src_ip: Ipv4Addr::new(192, 168, 1, 141),
            dst_ip: Ipv4Addr::new(192, 168, 1, 10),
        }
    }

    #[test]
    fn build_and_parse() {
        let pkt = builder().build_vec(b"abc").unwrap();
        assert_eq!(&pkt[6..8], &[0x40, 0x00]);
        let ip = Ipv4Packet::parse(&pkt).unwrap();
        assert!(ip.checksum_valid());
        assert!(ip.dont_fragment());
        assert_eq!(ip.ttl(), 128);
        assert_eq!(ip.protocol(), IPPROTO_TCP);
        assert_eq!(ip.identification(), 0x1234);
        assert_eq!(ip.total_len(), 23);
        assert_eq!(ip.payload(), b"abc");
    }

    #[test]
    fn trailing_padding_is_not_payload() {
        let mut pkt = builder().build_vec(b"abc").unwrap();
        pkt.extend_from_slice(&[0u8; 10]);
        let ip = Ipv4Packet::parse(&pkt).unwrap();
        assert_eq!(ip.payload(), b"abc");
    }

    #[test]
    fn corrupted_header_fails_checksum() {
        let mut pkt = builder().build_vec(b"").unwrap();
        pkt[8] = 1;
        assert!(!Ipv4Packet::parse(&pkt).unwrap().checksum_valid());
    }

    #[test]
    fn rejects_bad_version_and_short_total_len() {
        let mut pkt = builder().build_vec(b"").unwrap();
        pkt[0] = 0x65;
        assert!(matches!(
            Ipv4Packet::parse(&pkt),
            Err(PacketError::Malformed(_))
        ));

        let mut pkt = builder().build_vec(b"abcd").unwrap();
        pkt.truncate(22);
        assert!(matches!(
            Ipv4Packet::parse(&pkt),
            Err(PacketError::Truncated { needed: 24, actual: 22 })
        ));
    }
}
