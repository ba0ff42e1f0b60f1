use core::net::Ipv4Addr;

use bitflags::bitflags;

use super::{
    checksum, ensure_len, ensure_out_buf_len, read_u16, read_u32, write_u16, write_u32,
    PacketError, IPPROTO_TCP,
};

bitflags! {
    /// Control bits from byte 13 of the TCP header.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct TcpFlags: u8 {
        const FIN = 1 << 0;
        const SYN = 1 << 1;
        const RST = 1 << 2;
        const PSH = 1 << 3;
        const ACK = 1 << 4;
        const URG = 1 << 5;
        const ECE = 1 << 6;
        const CWR = 1 << 7;
    }
}

/// Encoded MSS option (kind 2, length 4) as carried on an outgoing SYN.
pub fn mss_option(mss: u16) -> [u8; 4] {
    let [hi, lo] = mss.to_be_bytes();
    [2, 4, hi, lo]
}

#[derive(Clone, Copy, Debug)]
pub struct TcpSegment<'a> {
    data: &'a [u8],
    header_len: usize,
}

impl<'a> TcpSegment<'a> {
    pub const MIN_HEADER_LEN: usize = 20;

    /// `data` must be exactly the IPv4 payload; everything after the header is segment data.
    pub fn parse(data: &'a [u8]) -> Result<Self, PacketError> {
        ensure_len(data, Self::MIN_HEADER_LEN)?;
        let data_offset = data[12] >> 4;
        if data_offset < 5 {
            return Err(PacketError::Malformed("TCP data offset < 5"));
        }
        let header_len = (data_offset as usize) * 4;
        ensure_len(data, header_len)?;
        Ok(Self { data, header_len })
    }

    pub fn src_port(&self) -> u16 {
        read_u16(self.data, 0)
    }

    pub fn dst_port(&self) -> u16 {
        read_u16(self.data, 2)
    }

    pub fn seq_number(&self) -> u32 {
        read_u32(self.data, 4)
    }

    pub fn ack_number(&self) -> u32 {
        read_u32(self.data, 8)
    }

    pub fn flags(&self) -> TcpFlags {
        TcpFlags::from_bits_retain(self.data[13])
    }

    pub fn window_size(&self) -> u16 {
        read_u16(self.data, 14)
    }

    pub fn checksum(&self) -> u16 {
        read_u16(self.data, 16)
    }

    pub fn options(&self) -> &'a [u8] {
        &self.data[Self::MIN_HEADER_LEN..self.header_len]
    }

    pub fn payload(&self) -> &'a [u8] {
        &self.data[self.header_len..]
    }

    pub fn header_len(&self) -> usize {
        self.header_len
    }

    pub fn as_bytes(&self) -> &'a [u8] {
        self.data
    }

    pub fn checksum_valid_ipv4(&self, src_ip: Ipv4Addr, dst_ip: Ipv4Addr) -> bool {
        checksum::transport_checksum_ipv4(src_ip, dst_ip, IPPROTO_TCP, self.data) == 0
    }
}

/// TCP header written in front of `payload_len` bytes that the caller has already placed right
/// after where the header (including `options`) will end.
pub struct TcpSegmentBuilder<'a> {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq_number: u32,
    pub ack_number: u32,
    pub flags: TcpFlags,
    pub window_size: u16,
    pub options: &'a [u8],
}

impl<'a> TcpSegmentBuilder<'a> {
    pub fn header_len(&self) -> Result<usize, PacketError> {
        if self.options.len() % 4 != 0 {
            return Err(PacketError::Malformed("TCP options length not multiple of 4"));
        }
        let header_len = TcpSegment::MIN_HEADER_LEN + self.options.len();
        if header_len / 4 > 0x0f {
            return Err(PacketError::Malformed("TCP header too large"));
        }
        Ok(header_len)
    }

    pub fn write(
        &self,
        src_ip: Ipv4Addr,
        dst_ip: Ipv4Addr,
        out: &mut [u8],
        payload_len: usize,
    ) -> Result<usize, PacketError> {
        let header_len = self.header_len()?;
        let len = header_len + payload_len;
        ensure_out_buf_len(out, len)?;

        write_u16(out, 0, self.src_port);
        write_u16(out, 2, self.dst_port);
        write_u32(out, 4, self.seq_number);
        write_u32(out, 8, self.ack_number);
        out[12] = ((header_len / 4) as u8) << 4;
        out[13] = self.flags.bits();
        write_u16(out, 14, self.window_size);
        write_u16(out, 16, 0);
        write_u16(out, 18, 0);
        out[20..header_len].copy_from_slice(self.options);

        // 0x0000 is a valid TCP checksum; only UDP reserves it.
        let csum = checksum::transport_checksum_ipv4(src_ip, dst_ip, IPPROTO_TCP, &out[..len]);
        write_u16(out, 16, csum);
        Ok(len)
    }

    #[cfg(feature = "alloc")]
    pub fn build_vec(
        &self,
        src_ip: Ipv4Addr,
        dst_ip: Ipv4Addr,
        payload: &[u8],
    ) -> Result<alloc::vec::Vec<u8>, PacketError> {
        let header_len = self.header_len()?;
        let mut buf = alloc::vec![0u8; header_len + payload.len()];
        buf[header_len..].copy_from_slice(payload);
        let written = self.write(src_ip, dst_ip, &mut buf, payload.len())?;
        debug_assert_eq!(written, buf.len());
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SRC: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 141);
    const DST: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 10);

    #[test]
    fn syn_with_mss_option() {
        let opt = mss_option(1280);
        assert_eq!(opt, [0x02, 0x04, 0x05, 0x00]);
        let builder = TcpSegmentBuilder {
            src_port: 1000,
            dst_port: 1883,
            seq_number: 0,
            ack_number: 0,
            flags: TcpFlags::SYN,
            window_size: 1280,
            options: &opt,
        };
        let buf = builder.build_vec(SRC, DST, &[]).unwrap();
        assert_eq!(buf.len(), 24);
        assert_eq!(buf[12], 0x60);
        assert_eq!(buf[13], 0x02);

        let seg = TcpSegment::parse(&buf).unwrap();
        assert_eq!(seg.header_len(), 24);
        assert_eq!(seg.options(), &opt);
        assert_eq!(seg.flags(), TcpFlags::SYN);
        assert!(seg.payload().is_empty());
        assert!(seg.checksum_valid_ipv4(SRC, DST));
    }

    #[test]
    fn push_ack_carries_payload() {
        let builder = TcpSegmentBuilder {
            src_port: 1000,
            dst_port: 1883,
            seq_number: 1,
            ack_number: 77,
            flags: TcpFlags::PSH | TcpFlags::ACK,
            window_size: 1280,
            options: &[],
        };
        let buf = builder.build_vec(SRC, DST, &[0xc0, 0x00]).unwrap();
        let seg = TcpSegment::parse(&buf).unwrap();
        assert_eq!(seg.flags().bits(), 0x18);
        assert_eq!(seg.seq_number(), 1);
        assert_eq!(seg.ack_number(), 77);
        assert_eq!(seg.payload(), &[0xc0, 0x00]);
        assert!(seg.checksum_valid_ipv4(SRC, DST));
    }

    #[test]
    fn unaligned_options_are_rejected() {
        let builder = TcpSegmentBuilder {
            src_port: 1,
            dst_port: 2,
            seq_number: 0,
            ack_number: 0,
            flags: TcpFlags::ACK,
            window_size: 0,
            options: &[1, 1, 1],
        };
        assert!(matches!(
            builder.header_len(),
            Err(PacketError::Malformed(_))
        ));
    }

    #[test]
    fn short_data_offset_is_malformed() {
        let mut buf = [0u8; 20];
        buf[12] = 0x40;
        assert!(matches!(
            TcpSegment::parse(&buf),
            Err(PacketError::Malformed(_))
        ));
    }
}
