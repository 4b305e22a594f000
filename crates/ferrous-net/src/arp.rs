//! Address Resolution Protocol (Ethernet + IPv4 only).
//!
//! Incoming requests for our address are answered, and the sender of every
//! request or reply is learned into a small fixed cache. There is no pending
//! request table: a caller that needs a MAC sends a request and polls the
//! cache until it shows up or its own retry budget runs out.

use std::net::Ipv4Addr;

use log::{debug, info, trace};
use zerocopy::byteorder::network_endian::U16;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::error::{NetError, ParseError};
use crate::ethernet::{ETHERTYPE_ARP, ETHERTYPE_IPV4};
use crate::stack::NetStack;
use crate::timer::RetryStep;
use crate::types::{ArpSlot, IfaceId, MacAddr};

pub const ARP_HTYPE_ETHERNET: u16 = 1;
pub const ARP_OPER_REQUEST: u16 = 1;
pub const ARP_OPER_REPLY: u16 = 2;
pub const ARP_PACKET_LEN: usize = 28;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromZeroes, FromBytes, AsBytes)]
pub struct ArpPacket {
    pub hardware_type: U16,
    pub protocol_type: U16,
    pub hardware_len: u8,
    pub protocol_len: u8,
    pub opcode: U16,
    pub sender_mac: MacAddr,
    pub sender_ip: [u8; 4],
    pub target_mac: MacAddr,
    pub target_ip: [u8; 4],
}

impl ArpPacket {
    fn new(
        opcode: u16,
        sender_mac: MacAddr,
        sender_ip: Ipv4Addr,
        target_mac: MacAddr,
        target_ip: Ipv4Addr,
    ) -> Self {
        Self {
            hardware_type: U16::new(ARP_HTYPE_ETHERNET),
            protocol_type: U16::new(ETHERTYPE_IPV4),
            hardware_len: 6,
            protocol_len: 4,
            opcode: U16::new(opcode),
            sender_mac,
            sender_ip: sender_ip.octets(),
            target_mac,
            target_ip: target_ip.octets(),
        }
    }

    pub fn request(sender_mac: MacAddr, sender_ip: Ipv4Addr, target_ip: Ipv4Addr) -> Self {
        Self::new(ARP_OPER_REQUEST, sender_mac, sender_ip, MacAddr::ZERO, target_ip)
    }

    pub fn reply(
        sender_mac: MacAddr,
        sender_ip: Ipv4Addr,
        target_mac: MacAddr,
        target_ip: Ipv4Addr,
    ) -> Self {
        Self::new(ARP_OPER_REPLY, sender_mac, sender_ip, target_mac, target_ip)
    }

    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        let packet = Self::read_from_prefix(data).ok_or(ParseError::Truncated {
            layer: "arp",
            len: data.len(),
        })?;
        let hw = packet.hardware_type.get();
        let proto = packet.protocol_type.get();
        if hw != ARP_HTYPE_ETHERNET
            || proto != ETHERTYPE_IPV4
            || packet.hardware_len != 6
            || packet.protocol_len != 4
        {
            return Err(ParseError::UnsupportedHardware { hw, proto });
        }
        Ok(packet)
    }

    pub fn sender_ip(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.sender_ip)
    }

    pub fn target_ip(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.target_ip)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArpEntry {
    pub ip: Ipv4Addr,
    pub mac: MacAddr,
    pub valid: bool,
}

impl ArpEntry {
    const EMPTY: Self = Self {
        ip: Ipv4Addr::UNSPECIFIED,
        mac: MacAddr::ZERO,
        valid: false,
    };
}

/// Fixed-size IP → MAC table.
///
/// At most one valid entry per IP. When full, slot 0 is overwritten. Entries
/// never age out.
pub struct ArpCache {
    entries: Vec<ArpEntry>,
}

impl ArpCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: vec![ArpEntry::EMPTY; capacity.max(1)],
        }
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| e.valid).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert or update the mapping for `ip`.
    pub fn add(&mut self, ip: Ipv4Addr, mac: MacAddr) -> ArpSlot {
        if let Some(i) = self.entries.iter().position(|e| e.valid && e.ip == ip) {
            self.entries[i].mac = mac;
            return ArpSlot(i as u8);
        }
        let slot = self.entries.iter().position(|e| !e.valid).unwrap_or(0);
        if self.entries[slot].valid {
            debug!(
                "arp: cache full, evicting {} from slot {}",
                self.entries[slot].ip, slot
            );
        }
        self.entries[slot] = ArpEntry {
            ip,
            mac,
            valid: true,
        };
        ArpSlot(slot as u8)
    }

    pub fn lookup(&self, ip: Ipv4Addr) -> Option<MacAddr> {
        self.entries
            .iter()
            .find(|e| e.valid && e.ip == ip)
            .map(|e| e.mac)
    }

    pub fn get(&self, slot: ArpSlot) -> Option<&ArpEntry> {
        self.entries.get(slot.index()).filter(|e| e.valid)
    }

    pub fn remove(&mut self, ip: Ipv4Addr) -> bool {
        match self.entries.iter_mut().find(|e| e.valid && e.ip == ip) {
            Some(entry) => {
                *entry = ArpEntry::EMPTY;
                true
            }
            None => false,
        }
    }

    pub fn clear(&mut self) {
        self.entries.fill(ArpEntry::EMPTY);
    }

    pub fn entries(&self) -> impl Iterator<Item = &ArpEntry> {
        self.entries.iter().filter(|e| e.valid)
    }
}

impl NetStack {
    pub(crate) fn arp_handle_packet(&mut self, iface: IfaceId, data: &[u8]) {
        let packet = match ArpPacket::parse(data) {
            Ok(packet) => packet,
            Err(e) => {
                debug!("arp: dropping packet: {}", e);
                return;
            }
        };
        let sender_ip = packet.sender_ip();

        // Opportunistic learning from any well-formed request or reply.
        if !sender_ip.is_unspecified() {
            self.arp.add(sender_ip, packet.sender_mac);
        }

        match packet.opcode.get() {
            ARP_OPER_REQUEST => {
                let Some(nic) = self.interfaces.get(iface.index()) else {
                    return;
                };
                if nic.has_ip() && packet.target_ip() == nic.ip {
                    trace!("arp: {} asks for us, replying", sender_ip);
                    if let Err(e) = self.arp_send_reply(iface, packet.sender_mac, sender_ip) {
                        debug!("arp: reply to {} failed: {}", sender_ip, e);
                    }
                }
            }
            ARP_OPER_REPLY => {
                trace!("arp: {} is at {}", sender_ip, packet.sender_mac);
            }
            other => debug!("arp: unknown opcode {}", other),
        }
    }

    /// Broadcast a request for `target` on `iface`.
    pub fn arp_send_request(&mut self, iface: IfaceId, target: Ipv4Addr) -> Result<usize, NetError> {
        let nic = self.iface(iface)?;
        let packet = ArpPacket::request(nic.mac, nic.ip, target);
        debug!("arp: who-has {} tell {}", target, nic.ip);
        self.ethernet_send(iface, MacAddr::BROADCAST, ETHERTYPE_ARP, packet.as_bytes())
    }

    pub fn arp_send_reply(
        &mut self,
        iface: IfaceId,
        target_mac: MacAddr,
        target_ip: Ipv4Addr,
    ) -> Result<usize, NetError> {
        let nic = self.iface(iface)?;
        let packet = ArpPacket::reply(nic.mac, nic.ip, target_mac, target_ip);
        self.ethernet_send(iface, target_mac, ETHERTYPE_ARP, packet.as_bytes())
    }

    /// Gratuitous ARP announcing our current address.
    pub fn arp_announce(&mut self, iface: IfaceId) -> Result<usize, NetError> {
        let ip = self.iface(iface)?.ip;
        if ip.is_unspecified() {
            return Err(NetError::NoAddress);
        }
        self.arp_send_request(iface, ip)
    }

    pub fn arp_cache_add(&mut self, ip: Ipv4Addr, mac: MacAddr) -> ArpSlot {
        self.arp.add(ip, mac)
    }

    pub fn arp_cache_lookup(&self, ip: Ipv4Addr) -> Option<MacAddr> {
        self.arp.lookup(ip)
    }

    pub fn arp_cache(&self) -> &ArpCache {
        &self.arp
    }

    /// Resolve `ip` on `iface`, resending requests per the ARP retry policy.
    pub fn arp_resolve(&mut self, iface: IfaceId, ip: Ipv4Addr) -> Result<MacAddr, NetError> {
        if let Some(mac) = self.arp.lookup(ip) {
            return Ok(mac);
        }
        let mut retry = self.config.arp_retry.start(self.clock.as_ref());
        loop {
            match retry.step(self.clock.now_ms()) {
                RetryStep::Send => {
                    self.arp_send_request(iface, ip)?;
                }
                RetryStep::Wait => {}
                RetryStep::Expired => {
                    info!("arp: no reply from {} after {} requests", ip, retry.attempts());
                    return Err(NetError::TimedOut);
                }
            }
            self.poll();
            if let Some(mac) = self.arp.lookup(ip) {
                return Ok(mac);
            }
            self.clock.idle(retry.poll_interval());
        }
    }
}
