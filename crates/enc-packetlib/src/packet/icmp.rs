use super::{checksum, ensure_len, ensure_out_buf_len, read_u16, write_u16, PacketError};

pub const ICMP_ECHO_REPLY: u8 = 0;
pub const ICMP_ECHO_REQUEST: u8 = 8;

#[derive(Clone, Copy, Debug)]
pub struct Icmpv4Packet<'a> {
    data: &'a [u8],
}

impl<'a> Icmpv4Packet<'a> {
    pub const HEADER_LEN: usize = 8;

    pub fn parse(data: &'a [u8]) -> Result<Self, PacketError> {
        ensure_len(data, Self::HEADER_LEN)?;
        Ok(Self { data })
    }

    pub fn icmp_type(&self) -> u8 {
        self.data[0]
    }

    pub fn code(&self) -> u8 {
        self.data[1]
    }

    pub fn checksum(&self) -> u16 {
        read_u16(self.data, 2)
    }

    pub fn identifier(&self) -> u16 {
        read_u16(self.data, 4)
    }

    pub fn sequence(&self) -> u16 {
        read_u16(self.data, 6)
    }

    pub fn payload(&self) -> &'a [u8] {
        &self.data[Self::HEADER_LEN..]
    }

    pub fn is_echo_request(&self) -> bool {
        self.icmp_type() == ICMP_ECHO_REQUEST && self.code() == 0
    }

    pub fn checksum_valid(&self) -> bool {
        checksum::internet_checksum(self.data) == 0
    }
}

/// Echo request/reply header written in front of `payload_len` bytes already at `out[8..]`.
pub struct IcmpEchoBuilder {
    pub icmp_type: u8,
    pub identifier: u16,
    pub sequence: u16,
}

impl IcmpEchoBuilder {
    pub fn reply_to(request: &Icmpv4Packet<'_>) -> Self {
        Self {
            icmp_type: ICMP_ECHO_REPLY,
            identifier: request.identifier(),
            sequence: request.sequence(),
        }
    }

    pub fn write(&self, out: &mut [u8], payload_len: usize) -> Result<usize, PacketError> {
        let len = Icmpv4Packet::HEADER_LEN + payload_len;
        ensure_out_buf_len(out, len)?;
        out[0] = self.icmp_type;
        out[1] = 0;
        write_u16(out, 2, 0);
        write_u16(out, 4, self.identifier);
        write_u16(out, 6, self.sequence);
        let csum = checksum::internet_checksum(&out[..len]);
        write_u16(out, 2, csum);
        Ok(len)
    }

    #[cfg(feature = "alloc")]
    pub fn build_vec(&self, payload: &[u8]) -> Result<alloc::vec::Vec<u8>, PacketError> {
        let mut buf = alloc::vec![0u8; Icmpv4Packet::HEADER_LEN + payload.len()];
        buf[Icmpv4Packet::HEADER_LEN..].copy_from_slice(payload);
        self.write(&mut buf, payload.len())?;
        Ok(buf)
    }
}
