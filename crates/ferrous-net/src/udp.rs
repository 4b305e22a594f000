//! UDP framing, dispatch and a small table of bound sockets.
//!
//! Port 68 belongs to the DHCP client and traffic to or from port 53 to the
//! DNS resolver. Everything else is handed to a bound socket, or silently
//! ignored when nothing is bound.

use std::collections::VecDeque;
use std::net::{Ipv4Addr, SocketAddrV4};

use log::{debug, trace, warn};
use zerocopy::byteorder::network_endian::U16;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::checksum::pseudo_header_checksum;
use crate::dhcp::DHCP_CLIENT_PORT;
use crate::dns::{DNS_CLIENT_PORT, DNS_PORT};
use crate::error::{NetError, ParseError};
use crate::ipv4::{Ipv4Header, IPV4_MAX_PAYLOAD};
use crate::stack::NetStack;
use crate::types::{IfaceId, IpProtocol, UdpHandle};

pub const UDP_HEADER_LEN: usize = 8;
pub const UDP_MAX_PAYLOAD: usize = IPV4_MAX_PAYLOAD - UDP_HEADER_LEN;
pub const EPHEMERAL_PORT_START: u16 = 49152;

#[derive(Debug, Clone, Copy, FromZeroes, FromBytes, AsBytes)]
#[repr(C)]
pub struct UdpHeader {
    pub src_port: U16,
    pub dest_port: U16,
    pub length: U16,
    pub checksum: U16,
}

impl UdpHeader {
    pub fn new(src: u16, dest: u16, payload_len: usize) -> Self {
        Self {
            src_port: U16::new(src),
            dest_port: U16::new(dest),
            length: U16::new((UDP_HEADER_LEN + payload_len) as u16),
            checksum: U16::ZERO, // Optional in IPv4
        }
    }

    /// Validate the header against the datagram and split off the payload.
    pub fn parse(data: &[u8]) -> Result<(Self, &[u8]), ParseError> {
        let header = Self::read_from_prefix(data).ok_or(ParseError::Truncated {
            layer: "udp",
            len: data.len(),
        })?;
        let len = header.length.get() as usize;
        if len < UDP_HEADER_LEN || len > data.len() {
            return Err(ParseError::BadLength { layer: "udp", len });
        }
        Ok((header, &data[UDP_HEADER_LEN..len]))
    }
}

/// A received datagram waiting on a bound socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpDatagram {
    pub src: SocketAddrV4,
    pub payload: Vec<u8>,
}

struct UdpSocket {
    local_port: u16,
    rx_queue: VecDeque<UdpDatagram>,
}

#[derive(Default)]
struct UdpSlot {
    generation: u32,
    socket: Option<UdpSocket>,
}

pub struct UdpSocketTable {
    slots: Vec<UdpSlot>,
    queue_depth: usize,
    next_ephemeral: u16,
}

impl UdpSocketTable {
    pub fn new(capacity: usize, queue_depth: usize) -> Self {
        Self {
            slots: (0..capacity.max(1)).map(|_| UdpSlot::default()).collect(),
            queue_depth: queue_depth.max(1),
            next_ephemeral: EPHEMERAL_PORT_START,
        }
    }

    fn port_in_use(&self, port: u16) -> bool {
        self.slots
            .iter()
            .filter_map(|s| s.socket.as_ref())
            .any(|s| s.local_port == port)
    }

    fn reserved(port: u16) -> bool {
        port == DHCP_CLIENT_PORT || port == DNS_CLIENT_PORT
    }

    fn ephemeral_port(&mut self) -> Option<u16> {
        for _ in EPHEMERAL_PORT_START..=u16::MAX {
            let port = self.next_ephemeral;
            self.next_ephemeral = if port == u16::MAX {
                EPHEMERAL_PORT_START
            } else {
                port + 1
            };
            if !Self::reserved(port) && !self.port_in_use(port) {
                return Some(port);
            }
        }
        None
    }

    /// Bind `port`, or an ephemeral port when `port` is 0.
    pub fn bind(&mut self, port: u16) -> Result<UdpHandle, NetError> {
        let port = if port == 0 {
            self.ephemeral_port().ok_or(NetError::PoolExhausted)?
        } else {
            port
        };
        if Self::reserved(port) || self.port_in_use(port) {
            return Err(NetError::PortInUse(port));
        }
        let index = self
            .slots
            .iter()
            .position(|s| s.socket.is_none())
            .ok_or(NetError::PoolExhausted)?;
        let slot = &mut self.slots[index];
        slot.socket = Some(UdpSocket {
            local_port: port,
            rx_queue: VecDeque::with_capacity(self.queue_depth),
        });
        Ok(UdpHandle {
            index: index as u16,
            generation: slot.generation,
        })
    }

    fn socket_mut(&mut self, handle: UdpHandle) -> Result<&mut UdpSocket, NetError> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|s| s.generation == handle.generation)
            .and_then(|s| s.socket.as_mut())
            .ok_or(NetError::InvalidHandle)
    }

    pub fn local_port(&mut self, handle: UdpHandle) -> Result<u16, NetError> {
        Ok(self.socket_mut(handle)?.local_port)
    }

    pub fn close(&mut self, handle: UdpHandle) -> Result<(), NetError> {
        self.socket_mut(handle)?;
        let slot = &mut self.slots[handle.index as usize];
        slot.socket = None;
        slot.generation = slot.generation.wrapping_add(1);
        Ok(())
    }

    /// Queue a datagram on the socket bound to `port`. Returns false if no
    /// socket is bound or its queue is full.
    pub fn deliver(&mut self, port: u16, datagram: UdpDatagram) -> bool {
        let depth = self.queue_depth;
        let Some(socket) = self
            .slots
            .iter_mut()
            .filter_map(|s| s.socket.as_mut())
            .find(|s| s.local_port == port)
        else {
            return false;
        };
        if socket.rx_queue.len() >= depth {
            warn!("udp: queue full on port {}, dropping datagram", port);
            return false;
        }
        socket.rx_queue.push_back(datagram);
        true
    }

    pub fn recv(&mut self, handle: UdpHandle) -> Result<Option<UdpDatagram>, NetError> {
        Ok(self.socket_mut(handle)?.rx_queue.pop_front())
    }
}

impl NetStack {
    pub(crate) fn udp_handle_packet(&mut self, iface: IfaceId, ip: &Ipv4Header, data: &[u8]) {
        let (header, payload) = match UdpHeader::parse(data) {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!("udp: dropping datagram from {}: {}", ip.src(), e);
                return;
            }
        };
        let segment = &data[..header.length.get() as usize];
        if header.checksum.get() != 0
            && pseudo_header_checksum(ip.src(), ip.dst(), IpProtocol::Udp as u8, segment) != 0
        {
            debug!("udp: {} from {}", ParseError::BadChecksum("udp"), ip.src());
            return;
        }

        let src_port = header.src_port.get();
        let dst_port = header.dest_port.get();
        trace!(
            "udp: {}:{} -> port {} ({} bytes)",
            ip.src(),
            src_port,
            dst_port,
            payload.len()
        );

        if dst_port == DHCP_CLIENT_PORT {
            self.dhcp_handle_packet(iface, payload);
        } else if dst_port == DNS_PORT || src_port == DNS_PORT {
            self.dns_handle_packet(payload);
        } else {
            let datagram = UdpDatagram {
                src: SocketAddrV4::new(ip.src(), src_port),
                payload: payload.to_vec(),
            };
            if self.udp.deliver(dst_port, datagram) {
                self.notify_udp();
            } else {
                trace!("udp: nothing bound to port {}", dst_port);
            }
        }
    }

    /// Frame and send one datagram with a zero checksum.
    pub fn udp_send_packet(
        &mut self,
        src_port: u16,
        dst: Ipv4Addr,
        dst_port: u16,
        payload: &[u8],
    ) -> Result<usize, NetError> {
        let mut datagram = [0u8; IPV4_MAX_PAYLOAD];
        let len = frame_datagram(&mut datagram, src_port, dst_port, payload)?;
        self.ipv4_send_packet(dst, IpProtocol::Udp, &datagram[..len])
    }

    /// Like [`Self::udp_send_packet`] but pinned to one interface, for
    /// traffic that must leave before any route exists.
    pub fn udp_send_on(
        &mut self,
        iface: IfaceId,
        src_port: u16,
        dst: Ipv4Addr,
        dst_port: u16,
        payload: &[u8],
    ) -> Result<usize, NetError> {
        let mut datagram = [0u8; IPV4_MAX_PAYLOAD];
        let len = frame_datagram(&mut datagram, src_port, dst_port, payload)?;
        self.ipv4_send_on(iface, dst, IpProtocol::Udp, &datagram[..len])
    }

    pub fn udp_bind(&mut self, port: u16) -> Result<UdpHandle, NetError> {
        let handle = self.udp.bind(port)?;
        debug!("udp: {} bound to port {}", handle, self.udp.local_port(handle)?);
        Ok(handle)
    }

    pub fn udp_local_port(&mut self, handle: UdpHandle) -> Result<u16, NetError> {
        self.udp.local_port(handle)
    }

    pub fn udp_send_to(
        &mut self,
        handle: UdpHandle,
        dst: SocketAddrV4,
        payload: &[u8],
    ) -> Result<usize, NetError> {
        let port = self.udp.local_port(handle)?;
        self.udp_send_packet(port, *dst.ip(), dst.port(), payload)
    }

    /// Non-blocking receive: [`NetError::WouldBlock`] when nothing is queued.
    pub fn udp_recv_from(&mut self, handle: UdpHandle) -> Result<UdpDatagram, NetError> {
        self.udp.recv(handle)?.ok_or(NetError::WouldBlock)
    }

    pub fn udp_close(&mut self, handle: UdpHandle) -> Result<(), NetError> {
        self.udp.close(handle)
    }
}

fn frame_datagram(
    buf: &mut [u8],
    src_port: u16,
    dst_port: u16,
    payload: &[u8],
) -> Result<usize, NetError> {
    if payload.len() > UDP_MAX_PAYLOAD {
        return Err(NetError::PacketTooLarge(payload.len()));
    }
    let len = UDP_HEADER_LEN + payload.len();
    buf[..UDP_HEADER_LEN].copy_from_slice(UdpHeader::new(src_port, dst_port, payload.len()).as_bytes());
    buf[UDP_HEADER_LEN..len].copy_from_slice(payload);
    Ok(len)
}
