use std::net::Ipv4Addr;
use std::sync::Arc;

use log::{debug, info};

use crate::arp::ArpCache;
use crate::config::{NetConfig, MAX_INTERFACES};
use crate::dhcp::DhcpClient;
use crate::dns::DnsResolver;
use crate::error::NetError;
use crate::icmp::PingState;
use crate::ingress::{FrameQueue, FrameSender};
use crate::interface::{InterfaceFlags, NetInterface};
use crate::route::RouteTable;
use crate::sync::WaitQueue;
use crate::tcp::TcpSocketPool;
use crate::timer::Clock;
use crate::types::IfaceId;
use crate::udp::UdpSocketTable;

/// One network stack instance.
///
/// Owns every table (interfaces, ARP cache, routes, socket pools and the
/// DHCP, DNS and ping contexts). All protocol code runs with `&mut self`,
/// either from [`NetStack::receive_frame`] or while draining the ingress
/// queue in [`NetStack::poll`].
pub struct NetStack {
    pub(crate) config: NetConfig,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) interfaces: Vec<NetInterface>,
    pub(crate) default_iface: Option<IfaceId>,
    pub(crate) arp: ArpCache,
    pub(crate) routes: RouteTable,
    pub(crate) ip_id: u16,
    pub(crate) ping: PingState,
    pub(crate) udp: UdpSocketTable,
    pub(crate) udp_waiter: Arc<WaitQueue>,
    pub(crate) dhcp: DhcpClient,
    pub(crate) dns: DnsResolver,
    pub(crate) tcp: TcpSocketPool,
    pub(crate) tcp_iss_step: u32,
    rx_queue: FrameQueue,
}

impl NetStack {
    pub fn new(config: NetConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            arp: ArpCache::new(config.arp_cache_size),
            routes: RouteTable::new(config.route_capacity),
            ip_id: rand::random(),
            ping: PingState::new(rand::random()),
            udp: UdpSocketTable::new(config.udp_sockets, config.udp_queue_depth),
            udp_waiter: Arc::new(WaitQueue::new()),
            dhcp: DhcpClient::default(),
            dns: DnsResolver::new(),
            tcp: TcpSocketPool::new(config.tcp_sockets, config.tcp_rx_buffer),
            tcp_iss_step: rand::random(),
            rx_queue: FrameQueue::new(config.rx_queue_depth),
            interfaces: Vec::new(),
            default_iface: None,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &NetConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Driver-side handle for queueing received frames.
    pub fn frame_sender(&self) -> FrameSender {
        self.rx_queue.sender()
    }

    /// Register a NIC. The first one becomes the default interface.
    pub fn add_interface(&mut self, nic: NetInterface) -> Result<IfaceId, NetError> {
        if self.interfaces.len() >= MAX_INTERFACES {
            return Err(NetError::TableFull);
        }
        let id = IfaceId(self.interfaces.len() as u8);
        info!(
            "net: {} ({}) registered as if{} with mac {}",
            nic.name,
            nic.device_name(),
            id,
            nic.mac
        );
        self.interfaces.push(nic);
        self.default_iface.get_or_insert(id);
        Ok(id)
    }

    pub fn interface(&self, id: IfaceId) -> Option<&NetInterface> {
        self.interfaces.get(id.index())
    }

    pub fn interface_mut(&mut self, id: IfaceId) -> Option<&mut NetInterface> {
        self.interfaces.get_mut(id.index())
    }

    pub fn interfaces(&self) -> impl Iterator<Item = (IfaceId, &NetInterface)> {
        self.interfaces
            .iter()
            .enumerate()
            .map(|(i, nic)| (IfaceId(i as u8), nic))
    }

    pub(crate) fn iface(&self, id: IfaceId) -> Result<&NetInterface, NetError> {
        self.interfaces
            .get(id.index())
            .ok_or(NetError::UnknownInterface)
    }

    pub(crate) fn iface_mut(&mut self, id: IfaceId) -> Result<&mut NetInterface, NetError> {
        self.interfaces
            .get_mut(id.index())
            .ok_or(NetError::UnknownInterface)
    }

    pub fn default_interface(&self) -> Option<IfaceId> {
        self.default_iface
    }

    pub fn set_default_interface(&mut self, id: IfaceId) -> Result<(), NetError> {
        self.iface(id)?;
        self.default_iface = Some(id);
        Ok(())
    }

    /// Static IPv4 configuration. Replaces the interface's routes and
    /// announces the new address.
    pub fn configure_interface(
        &mut self,
        id: IfaceId,
        ip: Ipv4Addr,
        netmask: Ipv4Addr,
        gateway: Ipv4Addr,
    ) -> Result<(), NetError> {
        let nic = self.iface_mut(id)?;
        nic.ip = ip;
        nic.netmask = netmask;
        nic.gateway = gateway;
        nic.flags.remove(InterfaceFlags::DHCP);
        info!(
            "{}: configured {}/{} gw {}",
            nic.name,
            ip,
            crate::types::prefix_len(netmask),
            gateway
        );
        self.install_interface_routes(id)?;
        if !ip.is_unspecified() {
            if let Err(e) = self.arp_announce(id) {
                debug!("net: announcement on if{} failed: {}", id, e);
            }
        }
        Ok(())
    }

    /// Process every queued frame, then run the protocol timers.
    /// Returns the number of frames handled.
    pub fn poll(&mut self) -> usize {
        let mut handled = 0;
        while let Some(frame) = self.rx_queue.try_pop() {
            self.receive_frame(frame.iface, &frame.data);
            handled += 1;
        }
        let now = self.now_ms();
        self.poll_timers(now);
        handled
    }

    /// DHCP lease timers, TIME_WAIT expiry and abandoned closes.
    pub fn poll_timers(&mut self, now: u64) {
        self.dhcp_poll_timers(now);
        self.tcp_poll_timers(now);
    }

    /// Signalled whenever a datagram is queued on any UDP socket.
    pub fn udp_waiter(&self) -> Arc<WaitQueue> {
        Arc::clone(&self.udp_waiter)
    }

    pub(crate) fn notify_udp(&self) {
        self.udp_waiter.notify();
    }
}
