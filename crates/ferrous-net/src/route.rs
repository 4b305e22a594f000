//! Static IPv4 routing table with longest-prefix-match lookup.
//!
//! Populated from interface configuration (static or DHCP-learned): one
//! direct route for the local subnet and one default route via the gateway.

use core::fmt;
use std::net::Ipv4Addr;

use log::debug;

use crate::error::NetError;
use crate::stack::NetStack;
use crate::types::{network_of, prefix_len, IfaceId, RouteId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteEntry {
    pub network: Ipv4Addr,
    pub netmask: Ipv4Addr,
    /// `0.0.0.0` means the destination is on-link.
    pub gateway: Ipv4Addr,
    pub iface: IfaceId,
    pub active: bool,
}

impl RouteEntry {
    pub fn new(network: Ipv4Addr, netmask: Ipv4Addr, gateway: Ipv4Addr, iface: IfaceId) -> Self {
        Self {
            network: network_of(network, netmask),
            netmask,
            gateway,
            iface,
            active: true,
        }
    }

    pub fn matches(&self, dst: Ipv4Addr) -> bool {
        network_of(dst, self.netmask) == self.network
    }

    pub fn prefix_len(&self) -> u32 {
        prefix_len(self.netmask)
    }

    pub fn is_direct(&self) -> bool {
        self.gateway.is_unspecified()
    }

    pub fn next_hop(&self, dst: Ipv4Addr) -> Ipv4Addr {
        if self.is_direct() {
            dst
        } else {
            self.gateway
        }
    }
}

impl fmt::Display for RouteEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_direct() {
            write!(
                f,
                "{}/{} dev {} (direct)",
                self.network,
                self.prefix_len(),
                self.iface
            )
        } else {
            write!(
                f,
                "{}/{} via {} dev {}",
                self.network,
                self.prefix_len(),
                self.gateway,
                self.iface
            )
        }
    }
}

pub struct RouteTable {
    entries: Vec<Option<RouteEntry>>,
}

impl RouteTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: vec![None; capacity.max(1)],
        }
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Add a route. An existing route for the same network/mask/interface
    /// is replaced in place.
    pub fn add(&mut self, entry: RouteEntry) -> Result<RouteId, NetError> {
        let existing = self.entries.iter().position(|slot| {
            slot.is_some_and(|r| {
                r.network == entry.network && r.netmask == entry.netmask && r.iface == entry.iface
            })
        });
        let index = match existing {
            Some(i) => i,
            None => self
                .entries
                .iter()
                .position(|slot| slot.is_none())
                .ok_or(NetError::TableFull)?,
        };
        debug!("route: add {}", entry);
        self.entries[index] = Some(entry);
        Ok(RouteId(index as u8))
    }

    pub fn remove(&mut self, id: RouteId) -> Option<RouteEntry> {
        self.entries.get_mut(id.index()).and_then(Option::take)
    }

    pub fn remove_interface_routes(&mut self, iface: IfaceId) -> usize {
        let mut removed = 0;
        for slot in self.entries.iter_mut() {
            if slot.is_some_and(|r| r.iface == iface) {
                *slot = None;
                removed += 1;
            }
        }
        removed
    }

    pub fn clear(&mut self) {
        self.entries.fill(None);
    }

    pub fn get(&self, id: RouteId) -> Option<&RouteEntry> {
        self.entries.get(id.index()).and_then(Option::as_ref)
    }

    pub fn set_active(&mut self, id: RouteId, active: bool) -> bool {
        match self.entries.get_mut(id.index()).and_then(Option::as_mut) {
            Some(route) => {
                route.active = active;
                true
            }
            None => false,
        }
    }

    /// Longest-prefix match over active routes. Among equal prefixes the
    /// first one in table order wins.
    pub fn lookup(&self, dst: Ipv4Addr) -> Option<&RouteEntry> {
        let mut best: Option<&RouteEntry> = None;
        for route in self.entries.iter().flatten() {
            if !route.active || !route.matches(dst) {
                continue;
            }
            if best.map_or(true, |b| route.prefix_len() > b.prefix_len()) {
                best = Some(route);
            }
        }
        best
    }

    pub fn iter(&self) -> impl Iterator<Item = (RouteId, &RouteEntry)> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|r| (RouteId(i as u8), r)))
    }
}

impl NetStack {
    pub fn route_lookup(&self, dst: Ipv4Addr) -> Option<RouteEntry> {
        self.routes.lookup(dst).copied()
    }

    /// Egress interface and next-hop address for `dst`.
    pub fn get_next_hop(&self, dst: Ipv4Addr) -> Option<(IfaceId, Ipv4Addr)> {
        self.routes.lookup(dst).map(|r| (r.iface, r.next_hop(dst)))
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    pub fn routes_mut(&mut self) -> &mut RouteTable {
        &mut self.routes
    }

    /// Rebuild the routes owned by `iface` from its current configuration.
    pub(crate) fn install_interface_routes(&mut self, iface: IfaceId) -> Result<(), NetError> {
        let nic = self.iface(iface)?;
        let (ip, netmask, gateway) = (nic.ip, nic.netmask, nic.gateway);

        self.routes.remove_interface_routes(iface);
        if ip.is_unspecified() {
            return Ok(());
        }
        self.routes.add(RouteEntry::new(
            ip,
            netmask,
            Ipv4Addr::UNSPECIFIED,
            iface,
        ))?;
        if !gateway.is_unspecified() {
            self.routes.add(RouteEntry::new(
                Ipv4Addr::UNSPECIFIED,
                Ipv4Addr::UNSPECIFIED,
                gateway,
                iface,
            ))?;
        }
        Ok(())
    }
}
