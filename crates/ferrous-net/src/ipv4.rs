//! IPv4 receive validation/dispatch and the send path (route → ARP → frame).

use std::net::Ipv4Addr;

use log::{debug, trace, warn};
use zerocopy::byteorder::network_endian::U16;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::checksum::{checksum, verify};
use crate::error::{NetError, ParseError};
use crate::ethernet::{ETHERTYPE_IPV4, ETH_MTU};
use crate::stack::NetStack;
use crate::types::{broadcast_of, IfaceId, IpProtocol, MacAddr};

pub const IPV4_HEADER_LEN: usize = 20;
pub const IPV4_MAX_HEADER_LEN: usize = 60;
pub const IPV4_FLAG_DF: u16 = 0x4000;
/// Largest transport payload that fits one unfragmented datagram.
pub const IPV4_MAX_PAYLOAD: usize = ETH_MTU - IPV4_HEADER_LEN;

#[derive(Debug, Clone, Copy, FromZeroes, FromBytes, AsBytes)]
#[repr(C)]
pub struct Ipv4Header {
    pub version_ihl: u8,
    pub tos: u8,
    pub total_length: U16,
    pub identification: U16,
    pub flags_fragment: U16,
    pub ttl: u8,
    pub protocol: u8,
    pub checksum: U16,
    pub src_ip: [u8; 4],
    pub dest_ip: [u8; 4],
}

impl Ipv4Header {
    pub fn new(
        src: Ipv4Addr,
        dest: Ipv4Addr,
        protocol: IpProtocol,
        payload_len: usize,
        identification: u16,
        ttl: u8,
    ) -> Self {
        let mut header = Self {
            version_ihl: 0x45, // Version 4, Header Length 5 (20 bytes)
            tos: 0,
            total_length: U16::new((IPV4_HEADER_LEN + payload_len) as u16),
            identification: U16::new(identification),
            flags_fragment: U16::new(IPV4_FLAG_DF),
            ttl,
            protocol: protocol as u8,
            checksum: U16::ZERO,
            src_ip: src.octets(),
            dest_ip: dest.octets(),
        };
        header.calculate_checksum();
        header
    }

    pub fn calculate_checksum(&mut self) {
        self.checksum = U16::ZERO;
        self.checksum = U16::new(checksum(self.as_bytes()));
    }

    pub fn version(&self) -> u8 {
        self.version_ihl >> 4
    }

    /// Header length in bytes, from the IHL nibble.
    pub fn header_len(&self) -> usize {
        ((self.version_ihl & 0x0f) as usize) * 4
    }

    pub fn src(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.src_ip)
    }

    pub fn dst(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.dest_ip)
    }

    /// Validate a received datagram and split off its payload.
    ///
    /// Options are skipped. Bytes past `total_length` (Ethernet padding) are
    /// not part of the payload.
    pub fn parse(data: &[u8], verify_checksum: bool) -> Result<(Self, &[u8]), ParseError> {
        let header = Self::read_from_prefix(data).ok_or(ParseError::Truncated {
            layer: "ipv4",
            len: data.len(),
        })?;
        if header.version() != 4 {
            return Err(ParseError::BadVersion(header.version()));
        }
        let hlen = header.header_len();
        if !(IPV4_HEADER_LEN..=IPV4_MAX_HEADER_LEN).contains(&hlen) || hlen > data.len() {
            return Err(ParseError::BadHeaderLength {
                layer: "ipv4",
                len: hlen,
            });
        }
        let total = header.total_length.get() as usize;
        if total < hlen || total > data.len() {
            return Err(ParseError::BadLength {
                layer: "ipv4",
                len: total,
            });
        }
        if verify_checksum && !verify(&data[..hlen]) {
            return Err(ParseError::BadChecksum("ipv4"));
        }
        Ok((header, &data[hlen..total]))
    }
}

impl NetStack {
    pub(crate) fn ipv4_handle_packet(&mut self, iface: IfaceId, data: &[u8]) {
        let verify_checksum = self.config.verify_ipv4_checksum;
        let Some(nic) = self.interfaces.get_mut(iface.index()) else {
            return;
        };
        let (header, payload) = match Ipv4Header::parse(data, verify_checksum) {
            Ok(parsed) => parsed,
            Err(e) => {
                nic.stats.rx_errors += 1;
                debug!("{}: dropping datagram: {}", nic.name, e);
                return;
            }
        };

        let dst = header.dst();
        // With no address yet (DHCP in progress) everything is accepted.
        let accepted = !nic.has_ip()
            || dst == nic.ip
            || dst.is_broadcast()
            || (!nic.netmask.is_unspecified() && dst == broadcast_of(nic.ip, nic.netmask));
        if !accepted {
            trace!("{}: datagram for {} is not ours", nic.name, dst);
            nic.stats.rx_dropped += 1;
            return;
        }

        match IpProtocol::from_u8(header.protocol) {
            Some(IpProtocol::Icmp) => self.icmp_handle_packet(iface, &header, payload),
            Some(IpProtocol::Udp) => self.udp_handle_packet(iface, &header, payload),
            Some(IpProtocol::Tcp) => self.tcp_handle_packet(iface, &header, payload),
            None => {
                debug!(
                    "ipv4: unsupported protocol {} from {}",
                    header.protocol,
                    header.src()
                );
                nic.stats.rx_dropped += 1;
            }
        }
    }

    /// Route and transmit one datagram.
    ///
    /// If the next hop's MAC is unknown an ARP request goes out and the
    /// datagram is dropped with [`NetError::ArpPending`]; nothing is queued.
    /// Limited broadcast bypasses routing and leaves the default interface.
    pub fn ipv4_send_packet(
        &mut self,
        dst: Ipv4Addr,
        protocol: IpProtocol,
        payload: &[u8],
    ) -> Result<usize, NetError> {
        if dst.is_broadcast() {
            let iface = self.default_interface().ok_or(NetError::UnknownInterface)?;
            return self.ipv4_output(iface, MacAddr::BROADCAST, dst, protocol, payload);
        }
        let Some((iface, hop)) = self.get_next_hop(dst) else {
            debug!("ipv4: no route to {}", dst);
            return Err(NetError::NoRoute(dst));
        };
        self.ipv4_send_via(iface, hop, dst, protocol, payload)
    }

    /// Transmit on a specific interface. Broadcasts (limited or
    /// subnet-directed) go straight to ff:ff:ff:ff:ff:ff; anything else is
    /// routed as usual.
    pub fn ipv4_send_on(
        &mut self,
        iface: IfaceId,
        dst: Ipv4Addr,
        protocol: IpProtocol,
        payload: &[u8],
    ) -> Result<usize, NetError> {
        let nic = self.iface(iface)?;
        let directed = nic.has_ip()
            && !nic.netmask.is_unspecified()
            && dst == broadcast_of(nic.ip, nic.netmask);
        if dst.is_broadcast() || directed {
            return self.ipv4_output(iface, MacAddr::BROADCAST, dst, protocol, payload);
        }
        let Some((_, hop)) = self.get_next_hop(dst) else {
            debug!("ipv4: no route to {}", dst);
            return Err(NetError::NoRoute(dst));
        };
        self.ipv4_send_via(iface, hop, dst, protocol, payload)
    }

    fn ipv4_send_via(
        &mut self,
        iface: IfaceId,
        hop: Ipv4Addr,
        dst: Ipv4Addr,
        protocol: IpProtocol,
        payload: &[u8],
    ) -> Result<usize, NetError> {
        let nic = self.iface(iface)?;
        if nic.has_ip() && !nic.netmask.is_unspecified() && dst == broadcast_of(nic.ip, nic.netmask)
        {
            return self.ipv4_output(iface, MacAddr::BROADCAST, dst, protocol, payload);
        }
        match self.arp.lookup(hop) {
            Some(mac) => self.ipv4_output(iface, mac, dst, protocol, payload),
            None => {
                debug!("ipv4: {} unresolved, dropping datagram to {}", hop, dst);
                if let Err(e) = self.arp_send_request(iface, hop) {
                    warn!("ipv4: arp request for {} failed: {}", hop, e);
                }
                Err(NetError::ArpPending(hop))
            }
        }
    }

    fn ipv4_output(
        &mut self,
        iface: IfaceId,
        dst_mac: MacAddr,
        dst: Ipv4Addr,
        protocol: IpProtocol,
        payload: &[u8],
    ) -> Result<usize, NetError> {
        if payload.len() > IPV4_MAX_PAYLOAD {
            return Err(NetError::PacketTooLarge(payload.len()));
        }
        let src = self.iface(iface)?.ip;
        let id = self.ip_id;
        self.ip_id = self.ip_id.wrapping_add(1);

        let header = Ipv4Header::new(src, dst, protocol, payload.len(), id, self.config.ttl);
        let mut packet = [0u8; ETH_MTU];
        let len = IPV4_HEADER_LEN + payload.len();
        packet[..IPV4_HEADER_LEN].copy_from_slice(header.as_bytes());
        packet[IPV4_HEADER_LEN..len].copy_from_slice(payload);
        trace!(
            "ipv4: {} -> {} proto {} len {}",
            src,
            dst,
            protocol as u8,
            len
        );
        self.ethernet_send(iface, dst_mac, ETHERTYPE_IPV4, &packet[..len])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn datagram(payload: &[u8]) -> Vec<u8> {
        let header = Ipv4Header::new(
            Ipv4Addr::new(10, 0, 2, 2),
            Ipv4Addr::new(10, 0, 2, 15),
            IpProtocol::Udp,
            payload.len(),
            7,
            64,
        );
        let mut out = header.as_bytes().to_vec();
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn header_fields() {
        let bytes = datagram(&[0u8; 8]);
        assert_eq!(bytes[0], 0x45);
        assert_eq!(&bytes[2..4], &[0, 28]);
        assert_eq!(&bytes[6..8], &[0x40, 0x00]);
        assert_eq!(bytes[8], 64);
        assert_eq!(bytes[9], 17);
        assert!(verify(&bytes[..IPV4_HEADER_LEN]));
    }

    #[test]
    fn parse_strips_padding() {
        let mut bytes = datagram(&[1, 2, 3, 4]);
        bytes.extend_from_slice(&[0u8; 22]);
        let (header, payload) = Ipv4Header::parse(&bytes, true).unwrap();
        assert_eq!(header.src(), Ipv4Addr::new(10, 0, 2, 2));
        assert_eq!(payload, &[1, 2, 3, 4]);
    }

    #[test]
    fn parse_rejects_bad_fields() {
        let good = datagram(&[0u8; 4]);

        let mut v6 = good.clone();
        v6[0] = 0x65;
        assert_eq!(Ipv4Header::parse(&v6, false).unwrap_err(), ParseError::BadVersion(6));

        let mut short_ihl = good.clone();
        short_ihl[0] = 0x44;
        assert!(matches!(
            Ipv4Header::parse(&short_ihl, false),
            Err(ParseError::BadHeaderLength { len: 16, .. })
        ));

        let mut long = good.clone();
        long[3] = 200;
        assert!(matches!(
            Ipv4Header::parse(&long, false),
            Err(ParseError::BadLength { len: 200, .. })
        ));

        let mut corrupt = good.clone();
        corrupt[8] = 1;
        assert_eq!(
            Ipv4Header::parse(&corrupt, true).unwrap_err(),
            ParseError::BadChecksum("ipv4")
        );
        assert!(Ipv4Header::parse(&corrupt, false).is_ok());
    }

    #[test]
    fn options_are_skipped() {
        let mut header = Ipv4Header::new(
            Ipv4Addr::new(1, 1, 1, 1),
            Ipv4Addr::new(2, 2, 2, 2),
            IpProtocol::Icmp,
            4 + 2,
            0,
            64,
        );
        header.version_ihl = 0x46;
        let mut bytes = header.as_bytes().to_vec();
        bytes.extend_from_slice(&[1, 1, 0, 0, 0xaa, 0xbb]);
        // The checksum covers the options too.
        bytes[10..12].fill(0);
        let sum = checksum(&bytes[..24]);
        bytes[10..12].copy_from_slice(&sum.to_be_bytes());
        let (_, payload) = Ipv4Header::parse(&bytes, true).unwrap();
        assert_eq!(payload, &[0xaa, 0xbb]);
    }
}
