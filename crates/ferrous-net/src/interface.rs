use std::net::Ipv4Addr;

use bitflags::bitflags;
use log::warn;

use crate::device::{DeviceError, NetDevice};
use crate::types::MacAddr;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct InterfaceFlags: u32 {
        const UP = 1 << 0;
        const RUNNING = 1 << 1;
        const PROMISC = 1 << 2;
        /// Configuration was learned from a DHCP lease.
        const DHCP = 1 << 3;
        const DOWN = 1 << 4;
    }
}

/// Packet/byte counters. Only ever increase.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceStats {
    pub tx_packets: u64,
    pub tx_bytes: u64,
    pub tx_errors: u64,
    pub rx_packets: u64,
    pub rx_bytes: u64,
    pub rx_errors: u64,
    pub rx_dropped: u64,
}

/// Identity, configuration and egress capability of one NIC.
///
/// Addresses are `0.0.0.0` while unset.
pub struct NetInterface {
    pub name: String,
    pub mac: MacAddr,
    pub ip: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub dns: Ipv4Addr,
    pub flags: InterfaceFlags,
    pub stats: InterfaceStats,
    device: Box<dyn NetDevice>,
}

impl NetInterface {
    pub fn new(name: impl Into<String>, mac: MacAddr, device: Box<dyn NetDevice>) -> Self {
        Self {
            name: name.into(),
            mac,
            ip: Ipv4Addr::UNSPECIFIED,
            netmask: Ipv4Addr::UNSPECIFIED,
            gateway: Ipv4Addr::UNSPECIFIED,
            dns: Ipv4Addr::UNSPECIFIED,
            flags: InterfaceFlags::UP | InterfaceFlags::RUNNING,
            stats: InterfaceStats::default(),
            device,
        }
    }

    pub fn has_ip(&self) -> bool {
        !self.ip.is_unspecified()
    }

    pub fn is_up(&self) -> bool {
        self.flags.contains(InterfaceFlags::UP) && !self.flags.contains(InterfaceFlags::DOWN)
    }

    pub fn set_up(&mut self, up: bool) {
        if up {
            self.flags.remove(InterfaceFlags::DOWN);
            self.flags.insert(InterfaceFlags::UP | InterfaceFlags::RUNNING);
        } else {
            self.flags.remove(InterfaceFlags::UP | InterfaceFlags::RUNNING);
            self.flags.insert(InterfaceFlags::DOWN);
        }
    }

    /// Drop the IPv4 configuration (lease released or expired).
    pub fn clear_config(&mut self) {
        self.ip = Ipv4Addr::UNSPECIFIED;
        self.netmask = Ipv4Addr::UNSPECIFIED;
        self.gateway = Ipv4Addr::UNSPECIFIED;
        self.dns = Ipv4Addr::UNSPECIFIED;
        self.flags.remove(InterfaceFlags::DHCP);
    }

    pub fn device_name(&self) -> &str {
        self.device.name()
    }

    /// Hand a finished frame to the driver, updating the counters.
    pub fn transmit(&mut self, frame: &[u8]) -> Result<usize, DeviceError> {
        if !self.is_up() {
            self.stats.tx_errors += 1;
            return Err(DeviceError::LinkDown);
        }
        match self.device.transmit(frame) {
            Ok(sent) => {
                self.stats.tx_packets += 1;
                self.stats.tx_bytes += sent as u64;
                Ok(sent)
            }
            Err(e) => {
                warn!("{}: transmit of {} bytes failed: {}", self.name, frame.len(), e);
                self.stats.tx_errors += 1;
                Err(e)
            }
        }
    }

    pub(crate) fn count_rx(&mut self, len: usize) {
        self.stats.rx_packets += 1;
        self.stats.rx_bytes += len as u64;
    }
}

impl core::fmt::Debug for NetInterface {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("NetInterface")
            .field("name", &self.name)
            .field("mac", &self.mac)
            .field("ip", &self.ip)
            .field("netmask", &self.netmask)
            .field("gateway", &self.gateway)
            .field("dns", &self.dns)
            .field("flags", &self.flags)
            .field("device", &self.device.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingDevice;

    impl NetDevice for FailingDevice {
        fn name(&self) -> &str {
            "failing"
        }

        fn transmit(&mut self, _frame: &[u8]) -> Result<usize, DeviceError> {
            Err(DeviceError::Busy)
        }
    }

    struct SinkDevice;

    impl NetDevice for SinkDevice {
        fn name(&self) -> &str {
            "sink"
        }

        fn transmit(&mut self, frame: &[u8]) -> Result<usize, DeviceError> {
            Ok(frame.len())
        }
    }

    #[test]
    fn counters_track_transmit_outcome() {
        let mut ok = NetInterface::new("eth0", MacAddr::ZERO, Box::new(SinkDevice));
        ok.transmit(&[0u8; 60]).unwrap();
        ok.transmit(&[0u8; 70]).unwrap();
        assert_eq!(ok.stats.tx_packets, 2);
        assert_eq!(ok.stats.tx_bytes, 130);

        let mut bad = NetInterface::new("eth1", MacAddr::ZERO, Box::new(FailingDevice));
        assert_eq!(bad.transmit(&[0u8; 60]), Err(DeviceError::Busy));
        assert_eq!(bad.stats.tx_errors, 1);
        assert_eq!(bad.stats.tx_packets, 0);
    }

    #[test]
    fn down_interface_refuses_transmit() {
        let mut iface = NetInterface::new("eth0", MacAddr::ZERO, Box::new(SinkDevice));
        iface.set_up(false);
        assert!(!iface.is_up());
        assert_eq!(iface.transmit(&[0u8; 60]), Err(DeviceError::LinkDown));
        iface.set_up(true);
        assert!(iface.is_up());
    }
}
