//! Byte-order helpers and the Internet checksum (RFC 1071).

use std::net::Ipv4Addr;

pub fn htons(u: u16) -> u16 {
    u.to_be()
}

pub fn htonl(u: u32) -> u32 {
    u.to_be()
}

pub fn ntohs(u: u16) -> u16 {
    u16::from_be(u)
}

pub fn ntohl(u: u32) -> u32 {
    u32::from_be(u)
}

/// Running ones'-complement sum.
///
/// Chunks are summed as big-endian 16-bit words. Only the final chunk fed to
/// [`Checksum::add_bytes`] may have an odd length; its trailing byte is padded
/// with zero.
#[derive(Debug, Default, Clone, Copy)]
pub struct Checksum {
    sum: u32,
}

impl Checksum {
    pub const fn new() -> Self {
        Self { sum: 0 }
    }

    pub fn add_u16(&mut self, word: u16) {
        self.sum = self.sum.wrapping_add(word as u32);
        self.fold();
    }

    pub fn add_u32(&mut self, word: u32) {
        self.add_u16((word >> 16) as u16);
        self.add_u16(word as u16);
    }

    pub fn add_bytes(&mut self, data: &[u8]) {
        let mut chunks = data.chunks_exact(2);
        for pair in &mut chunks {
            self.add_u16(u16::from_be_bytes([pair[0], pair[1]]));
        }
        if let [last] = chunks.remainder() {
            self.add_u16(u16::from_be_bytes([*last, 0]));
        }
    }

    /// Add the 12-byte IPv4 pseudo-header used by TCP and UDP.
    pub fn add_pseudo_header(&mut self, src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, len: u16) {
        self.add_u32(u32::from(src));
        self.add_u32(u32::from(dst));
        self.add_u16(protocol as u16);
        self.add_u16(len);
    }

    fn fold(&mut self) {
        while self.sum >> 16 != 0 {
            self.sum = (self.sum & 0xFFFF) + (self.sum >> 16);
        }
    }

    /// Final ones'-complement of the folded sum.
    pub fn finish(mut self) -> u16 {
        self.fold();
        !(self.sum as u16)
    }
}

/// Checksum of a contiguous buffer.
pub fn checksum(data: &[u8]) -> u16 {
    let mut sum = Checksum::new();
    sum.add_bytes(data);
    sum.finish()
}

/// A buffer that already carries its checksum sums to zero.
pub fn verify(data: &[u8]) -> bool {
    checksum(data) == 0
}

/// Transport checksum (TCP/UDP) over the pseudo-header and `segment`.
///
/// `segment` must have its checksum field zeroed when computing, or intact
/// when verifying (a valid segment then yields zero).
pub fn pseudo_header_checksum(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, segment: &[u8]) -> u16 {
    let mut sum = Checksum::new();
    sum.add_pseudo_header(src, dst, protocol, segment.len() as u16);
    sum.add_bytes(segment);
    sum.finish()
}
