//! RFC 1071 Internet checksum.

use core::net::Ipv4Addr;

/// Running one's-complement sum for a single checksum computation.
///
/// `finish` consumes the accumulator, so a sum can neither be read twice nor leak into an
/// unrelated computation. Each call to [`ChecksumAccumulator::add_bytes`] treats its slice as a
/// sequence of big-endian 16-bit words; an odd trailing byte is the high byte of a word whose low
/// byte is zero. Callers summing several pieces must therefore keep every piece but the last
/// even-length (the pseudo-header fields all are).
#[derive(Debug, Default)]
pub struct ChecksumAccumulator {
    sum: u64,
}

impl ChecksumAccumulator {
    pub const fn new() -> Self {
        Self { sum: 0 }
    }

    pub fn add_bytes(&mut self, data: &[u8]) {
        let mut chunks = data.chunks_exact(2);
        for chunk in &mut chunks {
            self.sum += u16::from_be_bytes([chunk[0], chunk[1]]) as u64;
        }
        if let Some(&last) = chunks.remainder().first() {
            self.sum += (last as u64) << 8;
        }
    }

    pub fn add_u16(&mut self, word: u16) {
        self.sum += word as u64;
    }

    /// Folds the carries back into the low 16 bits and returns the one's complement.
    pub fn finish(self) -> u16 {
        let mut sum = self.sum;
        while (sum >> 16) != 0 {
            sum = (sum & 0xffff) + (sum >> 16);
        }
        !(sum as u16)
    }
}

/// Checksum over `data` as a single computation.
///
/// Summing a region whose checksum field already holds the correct value yields `0`.
pub fn internet_checksum(data: &[u8]) -> u16 {
    let mut acc = ChecksumAccumulator::new();
    acc.add_bytes(data);
    acc.finish()
}

/// IPv4 header checksum. The caller zeroes the checksum field before computing it; verifying a
/// received header is the same call and succeeds when it returns `0`.
pub fn ipv4_header_checksum(header: &[u8]) -> u16 {
    internet_checksum(header)
}

/// TCP/UDP checksum over the 12-byte IPv4 pseudo-header followed by the whole segment.
pub fn transport_checksum_ipv4(
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    protocol: u8,
    segment: &[u8],
) -> u16 {
    let mut acc = ChecksumAccumulator::new();
    acc.add_bytes(&src_ip.octets());
    acc.add_bytes(&dst_ip.octets());
    acc.add_u16(protocol as u16);
    acc.add_u16(segment.len() as u16);
    acc.add_bytes(segment);
    acc.finish()
}
