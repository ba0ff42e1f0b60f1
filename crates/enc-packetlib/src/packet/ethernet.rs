use super::{ensure_len, ensure_out_buf_len, read_u16, write_u16, MacAddr, PacketError};

pub struct EtherType;

impl EtherType {
    pub const IPV4: u16 = 0x0800;
    pub const ARP: u16 = 0x0806;
}

#[derive(Clone, Copy, Debug)]
pub struct EthernetFrame<'a> {
    data: &'a [u8],
}

impl<'a> EthernetFrame<'a> {
    pub const HEADER_LEN: usize = 14;
    /// Largest untagged frame the controller is configured to accept (no FCS).
    pub const MAX_FRAME_LEN: usize = 1518;

    pub fn parse(data: &'a [u8]) -> Result<Self, PacketError> {
        ensure_len(data, Self::HEADER_LEN)?;
        Ok(Self { data })
    }

    pub fn dest_mac(&self) -> MacAddr {
        let mut mac = [0u8; 6];
        mac.copy_from_slice(&self.data[0..6]);
        MacAddr(mac)
    }

    pub fn src_mac(&self) -> MacAddr {
        let mut mac = [0u8; 6];
        mac.copy_from_slice(&self.data[6..12]);
        MacAddr(mac)
    }

    pub fn ethertype(&self) -> u16 {
        read_u16(self.data, 12)
    }

    pub fn payload(&self) -> &'a [u8] {
        &self.data[Self::HEADER_LEN..]
    }

    pub fn as_bytes(&self) -> &'a [u8] {
        self.data
    }
}

/// Writes the 14-byte header in front of `payload_len` bytes already placed at
/// `out[HEADER_LEN..]`.
pub struct EthernetFrameBuilder {
    pub dest_mac: MacAddr,
    pub src_mac: MacAddr,
    pub ethertype: u16,
}

impl EthernetFrameBuilder {
    pub fn write(&self, out: &mut [u8], payload_len: usize) -> Result<usize, PacketError> {
        let len = EthernetFrame::HEADER_LEN + payload_len;
        ensure_out_buf_len(out, len)?;
        out[0..6].copy_from_slice(&self.dest_mac.0);
        out[6..12].copy_from_slice(&self.src_mac.0);
        write_u16(out, 12, self.ethertype);
        Ok(len)
    }

    #[cfg(feature = "alloc")]
    pub fn build_vec(&self, payload: &[u8]) -> Result<alloc::vec::Vec<u8>, PacketError> {
        let mut buf = alloc::vec![0u8; EthernetFrame::HEADER_LEN + payload.len()];
        buf[EthernetFrame::HEADER_LEN..].copy_from_slice(payload);
        let written = self.write(&mut buf, payload.len())?;
        debug_assert_eq!(written, buf.len());
        Ok(buf)
    }
}
