//! DHCP client.
//!
//! One client per stack, bound to the interface given to
//! [`NetStack::dhcp_init`]. The state machine itself ([`DhcpClient`]) only
//! decides what to do next; sending and applying the lease happens in the
//! `NetStack` glue.

use std::net::Ipv4Addr;

use log::{debug, info, warn};
use zerocopy::byteorder::network_endian::{U16, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::error::{NetError, ParseError};
use crate::interface::InterfaceFlags;
use crate::stack::NetStack;
use crate::timer::RetryStep;
use crate::types::{IfaceId, MacAddr};

pub const DHCP_SERVER_PORT: u16 = 67;
pub const DHCP_CLIENT_PORT: u16 = 68;
pub const DHCP_MAGIC_COOKIE: u32 = 0x6382_5363;
/// Fixed BOOTP fields plus the magic cookie.
pub const DHCP_HEADER_LEN: usize = 240;
/// Minimum BOOTP message size; shorter messages are zero-padded.
pub const DHCP_MESSAGE_LEN: usize = 300;
/// Used when the server does not send option 51.
pub const DHCP_DEFAULT_LEASE_SECS: u32 = 86_400;

const BOOTREQUEST: u8 = 1;
const BOOTREPLY: u8 = 2;
const FLAGS_BROADCAST: u16 = 0x8000;

const OPTION_PAD: u8 = 0;
const OPTION_SUBNET_MASK: u8 = 1;
const OPTION_ROUTER: u8 = 3;
const OPTION_DNS: u8 = 6;
const OPTION_REQUESTED_IP: u8 = 50;
const OPTION_LEASE_TIME: u8 = 51;
const OPTION_MSG_TYPE: u8 = 53;
const OPTION_SERVER_ID: u8 = 54;
const OPTION_PARAM_REQ_LIST: u8 = 55;
const OPTION_END: u8 = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DhcpMessageType {
    Discover = 1,
    Offer = 2,
    Request = 3,
    Decline = 4,
    Ack = 5,
    Nak = 6,
    Release = 7,
    Inform = 8,
}

impl DhcpMessageType {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            1 => Self::Discover,
            2 => Self::Offer,
            3 => Self::Request,
            4 => Self::Decline,
            5 => Self::Ack,
            6 => Self::Nak,
            7 => Self::Release,
            8 => Self::Inform,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, FromZeroes, FromBytes, AsBytes)]
#[repr(C)]
pub struct BootpHeader {
    /// 1 for request, 2 for reply
    pub op: u8,
    /// Hardware address type; 1 for Ethernet
    pub htype: u8,
    pub hlen: u8,
    pub hops: u8,
    pub xid: U32,
    pub secs: U16,
    pub flags: U16,
    /// Client IP address; filled by client if it is already bound
    pub ciaddr: [u8; 4],
    /// Your IP address; filled by server in reply
    pub yiaddr: [u8; 4],
    pub siaddr: [u8; 4],
    pub giaddr: [u8; 4],
    pub chaddr: [u8; 16],
    pub sname: [u8; 64],
    pub file: [u8; 128],
    pub magic: U32,
}

/// The options this client understands.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DhcpOptions {
    pub subnet_mask: Option<Ipv4Addr>,
    pub router: Option<Ipv4Addr>,
    pub dns: Option<Ipv4Addr>,
    pub requested_ip: Option<Ipv4Addr>,
    pub lease_time: Option<u32>,
    pub server_id: Option<Ipv4Addr>,
}

/// A decoded (or to-be-encoded) DHCP message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DhcpMessage {
    pub kind: DhcpMessageType,
    pub reply: bool,
    pub xid: u32,
    pub mac: MacAddr,
    pub broadcast: bool,
    pub ciaddr: Ipv4Addr,
    pub yiaddr: Ipv4Addr,
    pub siaddr: Ipv4Addr,
    pub options: DhcpOptions,
}

fn addr_option(data: &[u8]) -> Option<Ipv4Addr> {
    let octets: [u8; 4] = data.get(..4)?.try_into().ok()?;
    Some(Ipv4Addr::from(octets))
}

fn put_option(out: &mut [u8], i: &mut usize, code: u8, data: &[u8]) {
    out[*i] = code;
    out[*i + 1] = data.len() as u8;
    out[*i + 2..*i + 2 + data.len()].copy_from_slice(data);
    *i += 2 + data.len();
}

impl DhcpMessage {
    /// A client message with no address fields set.
    pub fn client(kind: DhcpMessageType, xid: u32, mac: MacAddr) -> Self {
        Self {
            kind,
            reply: false,
            xid,
            mac,
            broadcast: true,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr: Ipv4Addr::UNSPECIFIED,
            siaddr: Ipv4Addr::UNSPECIFIED,
            options: DhcpOptions::default(),
        }
    }

    /// Encode into `out`, returning the message length (always
    /// [`DHCP_MESSAGE_LEN`]).
    pub fn encode(&self, out: &mut [u8; DHCP_MESSAGE_LEN]) -> usize {
        out.fill(0);
        let mut chaddr = [0u8; 16];
        chaddr[..6].copy_from_slice(&self.mac.0);
        let header = BootpHeader {
            op: if self.reply { BOOTREPLY } else { BOOTREQUEST },
            htype: 1,
            hlen: 6,
            hops: 0,
            xid: U32::new(self.xid),
            secs: U16::ZERO,
            flags: U16::new(if self.broadcast { FLAGS_BROADCAST } else { 0 }),
            ciaddr: self.ciaddr.octets(),
            yiaddr: self.yiaddr.octets(),
            siaddr: self.siaddr.octets(),
            giaddr: [0; 4],
            chaddr,
            sname: [0; 64],
            file: [0; 128],
            magic: U32::new(DHCP_MAGIC_COOKIE),
        };
        out[..DHCP_HEADER_LEN].copy_from_slice(header.as_bytes());

        let mut i = DHCP_HEADER_LEN;
        let opts = &self.options;
        put_option(out, &mut i, OPTION_MSG_TYPE, &[self.kind as u8]);
        if let Some(ip) = opts.requested_ip {
            put_option(out, &mut i, OPTION_REQUESTED_IP, &ip.octets());
        }
        if let Some(ip) = opts.server_id {
            put_option(out, &mut i, OPTION_SERVER_ID, &ip.octets());
        }
        if let Some(secs) = opts.lease_time {
            put_option(out, &mut i, OPTION_LEASE_TIME, &secs.to_be_bytes());
        }
        if let Some(ip) = opts.subnet_mask {
            put_option(out, &mut i, OPTION_SUBNET_MASK, &ip.octets());
        }
        if let Some(ip) = opts.router {
            put_option(out, &mut i, OPTION_ROUTER, &ip.octets());
        }
        if let Some(ip) = opts.dns {
            put_option(out, &mut i, OPTION_DNS, &ip.octets());
        }
        if !self.reply {
            put_option(
                out,
                &mut i,
                OPTION_PARAM_REQ_LIST,
                &[OPTION_SUBNET_MASK, OPTION_ROUTER, OPTION_DNS, OPTION_LEASE_TIME],
            );
        }
        out[i] = OPTION_END;
        DHCP_MESSAGE_LEN
    }

    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        let header = BootpHeader::read_from_prefix(data).ok_or(ParseError::Truncated {
            layer: "dhcp",
            len: data.len(),
        })?;
        if header.magic.get() != DHCP_MAGIC_COOKIE {
            return Err(ParseError::BadMagic);
        }

        let mut options = DhcpOptions::default();
        let mut kind = None;
        let raw = &data[DHCP_HEADER_LEN..];
        let mut i = 0usize;
        while i < raw.len() {
            let code = raw[i];
            if code == OPTION_END {
                break;
            }
            if code == OPTION_PAD {
                i += 1;
                continue;
            }
            if i + 1 >= raw.len() {
                break;
            }
            let len = raw[i + 1] as usize;
            if i + 2 + len > raw.len() {
                break;
            }
            let value = &raw[i + 2..i + 2 + len];
            match code {
                OPTION_MSG_TYPE if len >= 1 => kind = DhcpMessageType::from_u8(value[0]),
                OPTION_SUBNET_MASK => options.subnet_mask = addr_option(value),
                OPTION_ROUTER => options.router = addr_option(value),
                OPTION_DNS => options.dns = addr_option(value),
                OPTION_REQUESTED_IP => options.requested_ip = addr_option(value),
                OPTION_SERVER_ID => options.server_id = addr_option(value),
                OPTION_LEASE_TIME if len >= 4 => {
                    options.lease_time =
                        Some(u32::from_be_bytes([value[0], value[1], value[2], value[3]]))
                }
                _ => {}
            }
            i += 2 + len;
        }

        let kind = kind.ok_or(ParseError::Unexpected {
            layer: "dhcp",
            value: 0,
        })?;
        let mut mac = [0u8; 6];
        mac.copy_from_slice(&header.chaddr[..6]);
        Ok(Self {
            kind,
            reply: header.op == BOOTREPLY,
            xid: header.xid.get(),
            mac: MacAddr(mac),
            broadcast: header.flags.get() & FLAGS_BROADCAST != 0,
            ciaddr: Ipv4Addr::from(header.ciaddr),
            yiaddr: Ipv4Addr::from(header.yiaddr),
            siaddr: Ipv4Addr::from(header.siaddr),
            options,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DhcpState {
    Init,
    Selecting,
    Requesting,
    Bound,
    Renewing,
    Rebinding,
}

/// Configuration granted by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DhcpLease {
    pub ip: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub dns: Ipv4Addr,
    pub server: Ipv4Addr,
    pub lease_secs: u32,
}

impl DhcpLease {
    pub fn t1_ms(&self) -> u64 {
        self.lease_secs as u64 * 1000 / 2
    }

    pub fn t2_ms(&self) -> u64 {
        self.lease_secs as u64 * 1000 * 7 / 8
    }

    pub fn expiry_ms(&self) -> u64 {
        self.lease_secs as u64 * 1000
    }
}

/// What the glue must do after a server message was accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DhcpAction {
    Ignore,
    SendRequest,
    Bind(DhcpLease),
    Restart,
}

#[derive(Debug, Clone)]
pub struct DhcpClient {
    pub iface: Option<IfaceId>,
    pub state: DhcpState,
    pub xid: u32,
    pub offered_ip: Ipv4Addr,
    pub server_ip: Ipv4Addr,
    pub lease: Option<DhcpLease>,
    pub discover_count: u32,
    pub request_count: u32,
    bound_at_ms: u64,
    next_retry_ms: u64,
}

impl Default for DhcpClient {
    fn default() -> Self {
        Self {
            iface: None,
            state: DhcpState::Init,
            xid: 0,
            offered_ip: Ipv4Addr::UNSPECIFIED,
            server_ip: Ipv4Addr::UNSPECIFIED,
            lease: None,
            discover_count: 0,
            request_count: 0,
            bound_at_ms: 0,
            next_retry_ms: 0,
        }
    }
}

impl DhcpClient {
    pub fn new(iface: IfaceId) -> Self {
        Self {
            iface: Some(iface),
            ..Self::default()
        }
    }

    fn awaiting_reply(&self) -> bool {
        matches!(
            self.state,
            DhcpState::Selecting | DhcpState::Requesting | DhcpState::Renewing | DhcpState::Rebinding
        )
    }

    /// Advance the state machine on a server message.
    pub fn handle(&mut self, msg: &DhcpMessage) -> DhcpAction {
        if !msg.reply {
            return DhcpAction::Ignore;
        }
        if msg.xid != self.xid {
            debug!(
                "dhcp: {} (got {:#010x}, want {:#010x})",
                ParseError::XidMismatch { layer: "dhcp" },
                msg.xid,
                self.xid
            );
            return DhcpAction::Ignore;
        }

        match (self.state, msg.kind) {
            (DhcpState::Selecting, DhcpMessageType::Offer) => {
                let server = msg.options.server_id.unwrap_or(msg.siaddr);
                if msg.yiaddr.is_unspecified() || server.is_unspecified() {
                    debug!("dhcp: offer without address or server id");
                    return DhcpAction::Ignore;
                }
                self.offered_ip = msg.yiaddr;
                self.server_ip = server;
                self.state = DhcpState::Requesting;
                info!("dhcp: offer of {} from {}", msg.yiaddr, server);
                DhcpAction::SendRequest
            }
            (
                DhcpState::Requesting | DhcpState::Renewing | DhcpState::Rebinding,
                DhcpMessageType::Ack,
            ) => {
                let netmask = msg.options.subnet_mask.unwrap_or_else(|| {
                    debug!("dhcp: no subnet mask in ack, assuming /24");
                    Ipv4Addr::new(255, 255, 255, 0)
                });
                let lease = DhcpLease {
                    ip: msg.yiaddr,
                    netmask,
                    gateway: msg.options.router.unwrap_or(Ipv4Addr::UNSPECIFIED),
                    dns: msg.options.dns.unwrap_or(Ipv4Addr::UNSPECIFIED),
                    server: msg.options.server_id.unwrap_or(self.server_ip),
                    lease_secs: msg.options.lease_time.unwrap_or(DHCP_DEFAULT_LEASE_SECS),
                };
                self.server_ip = lease.server;
                self.lease = Some(lease);
                self.state = DhcpState::Bound;
                DhcpAction::Bind(lease)
            }
            (_, DhcpMessageType::Nak) if self.awaiting_reply() => {
                info!("dhcp: nak from server, restarting");
                self.reset();
                DhcpAction::Restart
            }
            (state, kind) => {
                debug!("dhcp: ignoring {:?} in state {:?}", kind, state);
                DhcpAction::Ignore
            }
        }
    }

    fn reset(&mut self) {
        self.state = DhcpState::Init;
        self.offered_ip = Ipv4Addr::UNSPECIFIED;
        self.server_ip = Ipv4Addr::UNSPECIFIED;
        self.lease = None;
    }
}

impl NetStack {
    /// Bind the DHCP client to `iface` and reset it to INIT.
    pub fn dhcp_init(&mut self, iface: IfaceId) -> Result<(), NetError> {
        self.iface_mut(iface)?.flags.insert(InterfaceFlags::DHCP);
        self.dhcp = DhcpClient::new(iface);
        debug!("dhcp: client bound to if{}", iface);
        Ok(())
    }

    fn dhcp_iface(&self) -> Result<IfaceId, NetError> {
        self.dhcp.iface.ok_or(NetError::UnknownInterface)
    }

    /// Broadcast a DISCOVER with a fresh transaction id. INIT → SELECTING.
    pub fn dhcp_discover(&mut self) -> Result<usize, NetError> {
        let iface = self.dhcp_iface()?;
        let mac = self.iface(iface)?.mac;
        self.dhcp.xid = rand::random();
        self.dhcp.state = DhcpState::Selecting;
        self.dhcp.discover_count += 1;

        let msg = DhcpMessage::client(DhcpMessageType::Discover, self.dhcp.xid, mac);
        debug!("dhcp: discover xid {:#010x}", self.dhcp.xid);
        self.dhcp_transmit(iface, Ipv4Addr::BROADCAST, &msg)
    }

    /// Send (or resend) the REQUEST for the current state: broadcast while
    /// selecting or rebinding, unicast to the server while renewing.
    pub fn dhcp_send_request(&mut self) -> Result<usize, NetError> {
        let iface = self.dhcp_iface()?;
        let nic = self.iface(iface)?;
        let (mac, ip) = (nic.mac, nic.ip);
        let mut msg = DhcpMessage::client(DhcpMessageType::Request, self.dhcp.xid, mac);

        let dst = match self.dhcp.state {
            DhcpState::Requesting => {
                msg.options.requested_ip = Some(self.dhcp.offered_ip);
                msg.options.server_id = Some(self.dhcp.server_ip);
                Ipv4Addr::BROADCAST
            }
            DhcpState::Renewing => {
                msg.ciaddr = ip;
                msg.broadcast = false;
                self.dhcp.server_ip
            }
            DhcpState::Rebinding => {
                msg.ciaddr = ip;
                Ipv4Addr::BROADCAST
            }
            _ => return Err(NetError::NotConnected),
        };
        self.dhcp.request_count += 1;
        debug!("dhcp: request {} via {}", self.dhcp.offered_ip, dst);
        self.dhcp_transmit(iface, dst, &msg)
    }

    fn dhcp_transmit(
        &mut self,
        iface: IfaceId,
        dst: Ipv4Addr,
        msg: &DhcpMessage,
    ) -> Result<usize, NetError> {
        let mut buf = [0u8; DHCP_MESSAGE_LEN];
        let len = msg.encode(&mut buf);
        self.udp_send_on(iface, DHCP_CLIENT_PORT, dst, DHCP_SERVER_PORT, &buf[..len])
    }

    pub(crate) fn dhcp_handle_packet(&mut self, iface: IfaceId, data: &[u8]) {
        if self.dhcp.iface != Some(iface) {
            return;
        }
        let msg = match DhcpMessage::parse(data) {
            Ok(msg) => msg,
            Err(e) => {
                debug!("dhcp: dropping message: {}", e);
                return;
            }
        };
        match self.dhcp.handle(&msg) {
            DhcpAction::Ignore => {}
            DhcpAction::SendRequest => {
                if let Err(e) = self.dhcp_send_request() {
                    debug!("dhcp: request not sent: {}", e);
                }
            }
            DhcpAction::Bind(lease) => {
                if let Err(e) = self.dhcp_apply_lease(iface, lease) {
                    warn!("dhcp: could not apply lease: {}", e);
                }
            }
            DhcpAction::Restart => {
                if let Err(e) = self.dhcp_drop_config(iface) {
                    debug!("dhcp: {}", e);
                }
            }
        }
    }

    fn dhcp_apply_lease(&mut self, iface: IfaceId, lease: DhcpLease) -> Result<(), NetError> {
        let now = self.now_ms();
        self.dhcp.bound_at_ms = now;
        self.dhcp.next_retry_ms = now;

        let nic = self.iface_mut(iface)?;
        let changed = nic.ip != lease.ip;
        nic.ip = lease.ip;
        nic.netmask = lease.netmask;
        nic.gateway = lease.gateway;
        nic.dns = lease.dns;
        nic.flags.insert(InterfaceFlags::DHCP);
        self.install_interface_routes(iface)?;
        if !lease.dns.is_unspecified() {
            self.dns_set_server(lease.dns);
        }
        info!(
            "dhcp: bound to {}/{} gw {} dns {} for {}s",
            lease.ip,
            crate::types::prefix_len(lease.netmask),
            lease.gateway,
            lease.dns,
            lease.lease_secs
        );
        if changed {
            if let Err(e) = self.arp_announce(iface) {
                debug!("dhcp: announce failed: {}", e);
            }
        }
        Ok(())
    }

    fn dhcp_drop_config(&mut self, iface: IfaceId) -> Result<(), NetError> {
        let nic = self.iface_mut(iface)?;
        if !nic.has_ip() {
            return Ok(());
        }
        let dns = nic.dns;
        nic.clear_config();
        nic.flags.insert(InterfaceFlags::DHCP);
        self.routes.remove_interface_routes(iface);
        if !dns.is_unspecified() && self.dns.server() == Some(dns) {
            self.dns.clear_server();
        }
        Ok(())
    }

    /// Give the lease back. The interface loses its address and routes and
    /// the client returns to INIT.
    pub fn dhcp_release(&mut self) -> Result<(), NetError> {
        let iface = self.dhcp_iface()?;
        if let Some(lease) = self.dhcp.lease {
            let mac = self.iface(iface)?.mac;
            let mut msg = DhcpMessage::client(DhcpMessageType::Release, rand::random(), mac);
            msg.ciaddr = lease.ip;
            msg.broadcast = false;
            msg.options.server_id = Some(lease.server);
            if let Err(e) = self.dhcp_transmit(iface, lease.server, &msg) {
                debug!("dhcp: release not sent: {}", e);
            }
            info!("dhcp: released {}", lease.ip);
        }
        self.dhcp.reset();
        self.dhcp_drop_config(iface)
    }

    /// Lease timers: T1 starts renewing, T2 rebinding, expiry drops the
    /// address. REQUESTs are repeated on the DHCP retry interval meanwhile.
    pub(crate) fn dhcp_poll_timers(&mut self, now: u64) {
        let Some(lease) = self.dhcp.lease else {
            return;
        };
        let Some(iface) = self.dhcp.iface else {
            return;
        };
        let elapsed = now.saturating_sub(self.dhcp.bound_at_ms);

        if elapsed >= lease.expiry_ms() {
            info!("dhcp: lease on {} expired", lease.ip);
            self.dhcp.reset();
            if let Err(e) = self.dhcp_drop_config(iface) {
                debug!("dhcp: {}", e);
            }
            return;
        }

        let next = if elapsed >= lease.t2_ms() {
            DhcpState::Rebinding
        } else if elapsed >= lease.t1_ms() {
            DhcpState::Renewing
        } else {
            DhcpState::Bound
        };
        if next == DhcpState::Bound {
            return;
        }
        if next != self.dhcp.state {
            info!("dhcp: {:?} -> {:?}", self.dhcp.state, next);
            self.dhcp.state = next;
            self.dhcp.xid = rand::random();
            self.dhcp.offered_ip = lease.ip;
            self.dhcp.next_retry_ms = now;
        }
        if now >= self.dhcp.next_retry_ms {
            self.dhcp.next_retry_ms = now + self.config.dhcp_retry.retry_interval.as_millis() as u64;
            if let Err(e) = self.dhcp_send_request() {
                debug!("dhcp: renewal request not sent: {}", e);
            }
        }
    }

    /// Run DISCOVER/REQUEST on `iface` until a lease is bound or the DHCP
    /// retry budget runs out.
    pub fn dhcp_acquire(&mut self, iface: IfaceId) -> Result<DhcpLease, NetError> {
        if self.dhcp.iface != Some(iface) {
            self.dhcp_init(iface)?;
        }
        let mut retry = self.config.dhcp_retry.start(self.clock.as_ref());
        loop {
            match retry.step(self.clock.now_ms()) {
                RetryStep::Send => {
                    let sent = match self.dhcp.state {
                        DhcpState::Requesting => self.dhcp_send_request(),
                        _ => self.dhcp_discover(),
                    };
                    if let Err(e) = sent {
                        debug!("dhcp: send failed: {}", e);
                    }
                }
                RetryStep::Wait => {}
                RetryStep::Expired => {
                    info!(
                        "dhcp: no lease after {} discovers, {} requests",
                        self.dhcp.discover_count, self.dhcp.request_count
                    );
                    return Err(NetError::TimedOut);
                }
            }
            self.poll();
            if let (DhcpState::Bound, Some(lease)) = (self.dhcp.state, self.dhcp.lease) {
                return Ok(lease);
            }
            self.clock.idle(retry.poll_interval());
        }
    }

    pub fn dhcp_state(&self) -> DhcpState {
        self.dhcp.state
    }

    pub fn dhcp_client(&self) -> &DhcpClient {
        &self.dhcp
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAC: MacAddr = MacAddr::new([0x52, 0x54, 0, 0x12, 0x34, 0x56]);

    fn server_reply(kind: DhcpMessageType, xid: u32) -> DhcpMessage {
        let mut msg = DhcpMessage::client(kind, xid, MAC);
        msg.reply = true;
        msg.yiaddr = Ipv4Addr::new(10, 0, 2, 15);
        msg.options = DhcpOptions {
            subnet_mask: Some(Ipv4Addr::new(255, 255, 255, 0)),
            router: Some(Ipv4Addr::new(10, 0, 2, 2)),
            dns: Some(Ipv4Addr::new(10, 0, 2, 3)),
            server_id: Some(Ipv4Addr::new(10, 0, 2, 2)),
            lease_time: Some(3600),
            requested_ip: None,
        };
        msg
    }

    #[test]
    fn encode_layout() {
        let mut buf = [0u8; DHCP_MESSAGE_LEN];
        let msg = DhcpMessage::client(DhcpMessageType::Discover, 0xdeadbeef, MAC);
        assert_eq!(msg.encode(&mut buf), DHCP_MESSAGE_LEN);
        assert_eq!(&buf[0..4], &[1, 1, 6, 0]);
        assert_eq!(&buf[4..8], &[0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(&buf[10..12], &[0x80, 0x00]);
        assert_eq!(&buf[28..34], &MAC.0);
        assert_eq!(&buf[236..240], &[0x63, 0x82, 0x53, 0x63]);
        assert_eq!(&buf[240..243], &[53, 1, 1]);
        assert_eq!(&buf[243..249], &[55, 4, 1, 3, 6, 51]);
        assert_eq!(buf[249], 255);
    }

    #[test]
    fn parse_reads_options_and_skips_pad() {
        let mut buf = [0u8; DHCP_MESSAGE_LEN];
        let sent = server_reply(DhcpMessageType::Offer, 7);
        sent.encode(&mut buf);
        let parsed = DhcpMessage::parse(&buf).unwrap();
        assert_eq!(parsed, DhcpMessage { broadcast: true, ..sent });

        // Pad bytes before the first option are skipped.
        let mut padded = [0u8; DHCP_MESSAGE_LEN];
        padded[..DHCP_HEADER_LEN].copy_from_slice(&buf[..DHCP_HEADER_LEN]);
        padded[DHCP_HEADER_LEN..DHCP_HEADER_LEN + 3].fill(OPTION_PAD);
        padded[DHCP_HEADER_LEN + 3..DHCP_HEADER_LEN + 6].copy_from_slice(&[53, 1, 6]);
        padded[DHCP_HEADER_LEN + 6] = OPTION_END;
        assert_eq!(DhcpMessage::parse(&padded).unwrap().kind, DhcpMessageType::Nak);
    }

    #[test]
    fn parse_rejects_bad_cookie_and_truncation() {
        let mut buf = [0u8; DHCP_MESSAGE_LEN];
        server_reply(DhcpMessageType::Ack, 1).encode(&mut buf);
        buf[239] = 0;
        assert_eq!(DhcpMessage::parse(&buf), Err(ParseError::BadMagic));
        assert!(matches!(
            DhcpMessage::parse(&buf[..100]),
            Err(ParseError::Truncated { layer: "dhcp", .. })
        ));
    }

    #[test]
    fn state_progression() {
        let mut client = DhcpClient::new(IfaceId(0));
        client.state = DhcpState::Selecting;
        client.xid = 42;

        assert_eq!(
            client.handle(&server_reply(DhcpMessageType::Offer, 41)),
            DhcpAction::Ignore
        );
        assert_eq!(client.state, DhcpState::Selecting);

        assert_eq!(
            client.handle(&server_reply(DhcpMessageType::Offer, 42)),
            DhcpAction::SendRequest
        );
        assert_eq!(client.state, DhcpState::Requesting);
        assert_eq!(client.offered_ip, Ipv4Addr::new(10, 0, 2, 15));

        let DhcpAction::Bind(lease) = client.handle(&server_reply(DhcpMessageType::Ack, 42)) else {
            panic!("ack did not bind");
        };
        assert_eq!(client.state, DhcpState::Bound);
        assert_eq!(lease.gateway, Ipv4Addr::new(10, 0, 2, 2));
        assert_eq!(lease.lease_secs, 3600);
        assert_eq!(lease.t1_ms(), 1_800_000);
        assert_eq!(lease.t2_ms(), 3_150_000);
    }

    #[test]
    fn nak_restarts_only_while_waiting() {
        let mut client = DhcpClient::new(IfaceId(0));
        client.xid = 9;
        client.state = DhcpState::Requesting;
        assert_eq!(
            client.handle(&server_reply(DhcpMessageType::Nak, 9)),
            DhcpAction::Restart
        );
        assert_eq!(client.state, DhcpState::Init);

        client.state = DhcpState::Bound;
        assert_eq!(
            client.handle(&server_reply(DhcpMessageType::Nak, 9)),
            DhcpAction::Ignore
        );
        assert_eq!(client.state, DhcpState::Bound);
    }
}
