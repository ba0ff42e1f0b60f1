use core::net::Ipv4Addr;

use super::{
    checksum, ensure_len, ensure_out_buf_len, read_u16, write_u16, PacketError, IPPROTO_UDP,
};

#[derive(Clone, Copy, Debug)]
pub struct UdpPacket<'a> {
    data: &'a [u8],
    length: usize,
}

impl<'a> UdpPacket<'a> {
    pub const HEADER_LEN: usize = 8;

    /// The declared UDP length bounds the payload; bytes beyond it are ignored.
    pub fn parse(data: &'a [u8]) -> Result<Self, PacketError> {
        ensure_len(data, Self::HEADER_LEN)?;
        let length = read_u16(data, 4) as usize;
        if length < Self::HEADER_LEN {
            return Err(PacketError::Malformed("UDP length < header length"));
        }
        ensure_len(data, length)?;
        Ok(Self { data, length })
    }

    pub fn src_port(&self) -> u16 {
        read_u16(self.data, 0)
    }

    pub fn dst_port(&self) -> u16 {
        read_u16(self.data, 2)
    }

    pub fn length(&self) -> u16 {
        self.length as u16
    }

    pub fn checksum(&self) -> u16 {
        read_u16(self.data, 6)
    }

    pub fn payload(&self) -> &'a [u8] {
        &self.data[Self::HEADER_LEN..self.length]
    }

    pub fn as_bytes(&self) -> &'a [u8] {
        &self.data[..self.length]
    }

    /// A zero checksum field means the sender did not compute one.
    pub fn checksum_valid_ipv4(&self, src_ip: Ipv4Addr, dst_ip: Ipv4Addr) -> bool {
        if self.checksum() == 0 {
            return true;
        }
        checksum::transport_checksum_ipv4(src_ip, dst_ip, IPPROTO_UDP, self.as_bytes()) == 0
    }
}

/// UDP header written in front of `payload_len` bytes already at `out[8..]`.
pub struct UdpPacketBuilder {
    pub src_port: u16,
    pub dst_port: u16,
}

impl UdpPacketBuilder {
    pub fn write(
        &self,
        src_ip: Ipv4Addr,
        dst_ip: Ipv4Addr,
        out: &mut [u8],
        payload_len: usize,
    ) -> Result<usize, PacketError> {
        let len = UdpPacket::HEADER_LEN + payload_len;
        if len > u16::MAX as usize {
            return Err(PacketError::Malformed("UDP length > 65535"));
        }
        ensure_out_buf_len(out, len)?;
        write_u16(out, 0, self.src_port);
        write_u16(out, 2, self.dst_port);
        write_u16(out, 4, len as u16);
        write_u16(out, 6, 0);
        let mut csum = checksum::transport_checksum_ipv4(src_ip, dst_ip, IPPROTO_UDP, &out[..len]);
        if csum == 0 {
            csum = 0xffff;
        }
        write_u16(out, 6, csum);
        Ok(len)
    }

    #[cfg(feature = "alloc")]
    pub fn build_vec(
        &self,
        src_ip: Ipv4Addr,
        dst_ip: Ipv4Addr,
        payload: &[u8],
    ) -> Result<alloc::vec::Vec<u8>, PacketError> {
        let mut buf = alloc::vec![0u8; UdpPacket::HEADER_LEN + payload.len()];
        buf[UdpPacket::HEADER_LEN..].copy_from_slice(payload);
        self.write(src_ip, dst_ip, &mut buf, payload.len())?;
        Ok(buf)
    }
}
