//! Shared scaffolding for the scenario tests: a scripted peer that sits on
//! the other end of the wire, plus frame builders and decoders.

#![allow(dead_code)]

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::{Arc, Mutex};

use ferrous_net::arp::{ArpPacket, ARP_OPER_REQUEST};
use ferrous_net::checksum::{checksum, pseudo_header_checksum};
use ferrous_net::device::MAX_FRAME_LEN;
use ferrous_net::dhcp::{
    DhcpMessage, DhcpMessageType, DHCP_CLIENT_PORT, DHCP_MESSAGE_LEN, DHCP_SERVER_PORT,
};
use ferrous_net::dns::{skip_name, DNS_PORT};
use ferrous_net::ethernet::{build_frame, EthernetHeader, ETHERTYPE_ARP, ETHERTYPE_IPV4};
use ferrous_net::icmp::{ICMP_ECHO_REPLY, ICMP_ECHO_REQUEST};
use ferrous_net::ipv4::Ipv4Header;
use ferrous_net::tcp::{OutSegment, TcpFlags, TcpHeader};
use ferrous_net::types::IpProtocol;
use ferrous_net::udp::UdpHeader;
use ferrous_net::{
    Clock, DeviceError, FrameSender, IfaceId, MacAddr, ManualClock, NetConfig, NetDevice,
    NetInterface, NetStack,
};
use zerocopy::AsBytes;

pub const LOCAL_MAC: MacAddr = MacAddr::new([0x52, 0x54, 0x00, 0x12, 0x34, 0x56]);
pub const LOCAL_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 2, 15);
pub const NETMASK: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 0);
pub const PEER_MAC: MacAddr = MacAddr::new([0x52, 0x55, 0x0a, 0x00, 0x02, 0x02]);
pub const PEER_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 2, 2);
/// TCP port the gateway accepts connections on.
pub const ECHO_PORT: u16 = 7;
pub const GATEWAY_ISS: u32 = 9000;
pub const KNOWN_HOST: &str = "example.com";
pub const KNOWN_HOST_IP: Ipv4Addr = Ipv4Addr::new(93, 184, 216, 34);

pub type Responder = Box<dyn FnMut(&[u8]) -> Vec<Vec<u8>> + Send>;

struct PeerState {
    sent: Vec<Vec<u8>>,
    link: Option<(FrameSender, IfaceId)>,
    responder: Responder,
}

/// The far end of the link. Records every frame the stack transmits and
/// queues whatever the responder answers back into the stack.
#[derive(Clone)]
pub struct Peer {
    state: Arc<Mutex<PeerState>>,
}

impl Peer {
    pub fn new(responder: Responder) -> Self {
        Self {
            state: Arc::new(Mutex::new(PeerState {
                sent: Vec::new(),
                link: None,
                responder,
            })),
        }
    }

    pub fn silent() -> Self {
        Self::new(Box::new(|_| Vec::new()))
    }

    pub fn device(&self) -> Box<dyn NetDevice> {
        Box::new(PeerDevice {
            state: Arc::clone(&self.state),
        })
    }

    pub fn attach(&self, sender: FrameSender, iface: IfaceId) {
        self.state.lock().unwrap().link = Some((sender, iface));
    }

    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.state.lock().unwrap().sent.clone()
    }

    pub fn take_sent(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.state.lock().unwrap().sent)
    }
}

struct PeerDevice {
    state: Arc<Mutex<PeerState>>,
}

impl NetDevice for PeerDevice {
    fn name(&self) -> &str {
        "peer"
    }

    fn transmit(&mut self, frame: &[u8]) -> Result<usize, DeviceError> {
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        state.sent.push(frame.to_vec());
        let replies = (state.responder)(frame);
        if let Some((sender, iface)) = &state.link {
            for reply in replies {
                sender.deliver(*iface, &reply).unwrap();
            }
        }
        Ok(frame.len())
    }
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub struct Harness {
    pub stack: NetStack,
    pub eth0: IfaceId,
    pub clock: Arc<ManualClock>,
    pub peer: Peer,
}

/// A stack with one interface wired to `peer`, running on virtual time.
pub fn harness(peer: Peer) -> Harness {
    harness_with(peer, NetConfig::default())
}

pub fn harness_with(peer: Peer, config: NetConfig) -> Harness {
    init_logging();
    let clock = Arc::new(ManualClock::new());
    let dyn_clock: Arc<dyn Clock> = clock.clone();
    let mut stack = NetStack::new(config, dyn_clock);
    let eth0 = stack
        .add_interface(NetInterface::new("eth0", LOCAL_MAC, peer.device()))
        .unwrap();
    peer.attach(stack.frame_sender(), eth0);
    Harness {
        stack,
        eth0,
        clock,
        peer,
    }
}

/// Harness with `eth0` statically configured on 10.0.2.0/24 behind the
/// gateway, and the configuration announcement discarded.
pub fn configured(peer: Peer) -> Harness {
    let mut h = harness(peer);
    h.stack
        .configure_interface(h.eth0, LOCAL_IP, NETMASK, PEER_IP)
        .unwrap();
    h.peer.take_sent();
    h
}

// Frame builders.

pub fn frame(dst: MacAddr, src: MacAddr, ethertype: u16, payload: &[u8]) -> Vec<u8> {
    let mut buf = [0u8; MAX_FRAME_LEN];
    let len = build_frame(&mut buf, dst, src, ethertype, payload).unwrap();
    buf[..len].to_vec()
}

pub fn arp_reply(sender_mac: MacAddr, sender_ip: Ipv4Addr) -> Vec<u8> {
    let packet = ArpPacket::reply(sender_mac, sender_ip, LOCAL_MAC, LOCAL_IP);
    frame(LOCAL_MAC, sender_mac, ETHERTYPE_ARP, packet.as_bytes())
}

pub fn arp_request(sender_mac: MacAddr, sender_ip: Ipv4Addr, target: Ipv4Addr) -> Vec<u8> {
    let packet = ArpPacket::request(sender_mac, sender_ip, target);
    frame(MacAddr::BROADCAST, sender_mac, ETHERTYPE_ARP, packet.as_bytes())
}

pub fn ipv4_frame(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    dst_mac: MacAddr,
    protocol: IpProtocol,
    payload: &[u8],
) -> Vec<u8> {
    let header = Ipv4Header::new(src, dst, protocol, payload.len(), 0x4242, 64);
    let mut packet = header.as_bytes().to_vec();
    packet.extend_from_slice(payload);
    frame(dst_mac, PEER_MAC, ETHERTYPE_IPV4, &packet)
}

pub fn udp_frame(src: SocketAddrV4, dst: SocketAddrV4, dst_mac: MacAddr, payload: &[u8]) -> Vec<u8> {
    let mut datagram = UdpHeader::new(src.port(), dst.port(), payload.len())
        .as_bytes()
        .to_vec();
    datagram.extend_from_slice(payload);
    ipv4_frame(*src.ip(), *dst.ip(), dst_mac, IpProtocol::Udp, &datagram)
}

/// TCP segment from the gateway to us.
pub fn tcp_frame(
    src_port: u16,
    dst_port: u16,
    seq: u32,
    ack: u32,
    flags: TcpFlags,
    payload: &[u8],
) -> Vec<u8> {
    let seg = OutSegment {
        local_port: src_port,
        remote_ip: LOCAL_IP,
        remote_port: dst_port,
        seq,
        ack,
        flags,
        window: 8192,
    };
    let mut segment = TcpHeader::new(&seg).as_bytes().to_vec();
    segment.extend_from_slice(payload);
    let csum = pseudo_header_checksum(PEER_IP, LOCAL_IP, IpProtocol::Tcp as u8, &segment);
    segment[16..18].copy_from_slice(&csum.to_be_bytes());
    ipv4_frame(PEER_IP, LOCAL_IP, LOCAL_MAC, IpProtocol::Tcp, &segment)
}

// Decoders.

pub fn ethertype(frame: &[u8]) -> u16 {
    EthernetHeader::parse(frame).unwrap().0.ethertype.get()
}

/// Target of an ARP request, `None` for anything else.
pub fn arp_request_target(frame: &[u8]) -> Option<Ipv4Addr> {
    let (eth, payload) = EthernetHeader::parse(frame).ok()?;
    if eth.ethertype.get() != ETHERTYPE_ARP {
        return None;
    }
    let packet = ArpPacket::parse(payload).ok()?;
    (packet.opcode.get() == ARP_OPER_REQUEST).then(|| packet.target_ip())
}

pub fn ipv4_of(frame: &[u8]) -> Option<(Ipv4Header, Vec<u8>)> {
    let (eth, payload) = EthernetHeader::parse(frame).ok()?;
    if eth.ethertype.get() != ETHERTYPE_IPV4 {
        return None;
    }
    let (header, body) = Ipv4Header::parse(payload, true).ok()?;
    Some((header, body.to_vec()))
}

pub struct UdpOut {
    pub ip: Ipv4Header,
    pub src_port: u16,
    pub dst_port: u16,
    pub payload: Vec<u8>,
}

pub fn udp_of(frame: &[u8]) -> Option<UdpOut> {
    let (ip, body) = ipv4_of(frame)?;
    if ip.protocol != IpProtocol::Udp as u8 {
        return None;
    }
    let (header, payload) = UdpHeader::parse(&body).ok()?;
    Some(UdpOut {
        ip,
        src_port: header.src_port.get(),
        dst_port: header.dest_port.get(),
        payload: payload.to_vec(),
    })
}

pub struct TcpOut {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub payload: Vec<u8>,
}

pub fn tcp_of(frame: &[u8]) -> Option<TcpOut> {
    let (ip, body) = ipv4_of(frame)?;
    if ip.protocol != IpProtocol::Tcp as u8 {
        return None;
    }
    assert_eq!(
        pseudo_header_checksum(ip.src(), ip.dst(), IpProtocol::Tcp as u8, &body),
        0,
        "bad tcp checksum"
    );
    let (header, payload) = TcpHeader::parse(&body).ok()?;
    Some(TcpOut {
        src_port: header.src_port.get(),
        dst_port: header.dst_port.get(),
        seq: header.seq.get(),
        ack: header.ack.get(),
        flags: header.flags(),
        payload: payload.to_vec(),
    })
}

pub fn tcp_segments(frames: &[Vec<u8>]) -> Vec<TcpOut> {
    frames.iter().filter_map(|f| tcp_of(f)).collect()
}

// Scripted behaviour.

/// The gateway at 10.0.2.2: answers ARP for itself, echo requests, A
/// queries (only [`KNOWN_HOST`] exists) and opens TCP connections on
/// [`ECHO_PORT`]. Other TCP ports are refused.
pub fn gateway() -> Responder {
    Box::new(|frame| {
        if arp_request_target(frame) == Some(PEER_IP) {
            return vec![arp_reply(PEER_MAC, PEER_IP)];
        }
        let Some((ip, body)) = ipv4_of(frame) else {
            return Vec::new();
        };
        match IpProtocol::from_u8(ip.protocol) {
            Some(IpProtocol::Icmp) if body.first() == Some(&ICMP_ECHO_REQUEST) => {
                let mut reply = body.clone();
                reply[0] = ICMP_ECHO_REPLY;
                reply[2..4].fill(0);
                let sum = checksum(&reply);
                reply[2..4].copy_from_slice(&sum.to_be_bytes());
                vec![ipv4_frame(ip.dst(), ip.src(), LOCAL_MAC, IpProtocol::Icmp, &reply)]
            }
            Some(IpProtocol::Udp) => {
                let Some(udp) = udp_of(frame) else {
                    return Vec::new();
                };
                if udp.dst_port != DNS_PORT {
                    return Vec::new();
                }
                let answer = dns_answer(&udp.payload);
                vec![udp_frame(
                    SocketAddrV4::new(ip.dst(), DNS_PORT),
                    SocketAddrV4::new(ip.src(), udp.src_port),
                    LOCAL_MAC,
                    &answer,
                )]
            }
            Some(IpProtocol::Tcp) => {
                let Some(seg) = tcp_of(frame) else {
                    return Vec::new();
                };
                if seg.flags.contains(TcpFlags::RST) {
                    return Vec::new();
                }
                if seg.flags == TcpFlags::SYN {
                    let (seq, ack, flags) = if seg.dst_port == ECHO_PORT {
                        (GATEWAY_ISS, seg.seq.wrapping_add(1), TcpFlags::SYN | TcpFlags::ACK)
                    } else {
                        (0, seg.seq.wrapping_add(1), TcpFlags::RST | TcpFlags::ACK)
                    };
                    return vec![tcp_frame(seg.dst_port, seg.src_port, seq, ack, flags, &[])];
                }
                Vec::new()
            }
            _ => Vec::new(),
        }
    })
}

/// Answer an A query: [`KNOWN_HOST`] resolves, everything else is NXDOMAIN.
pub fn dns_answer(query: &[u8]) -> Vec<u8> {
    let name_end = skip_name(query, 12).unwrap();
    let question = &query[12..name_end + 4];
    let known = {
        let mut encoded = [0u8; 64];
        let len = ferrous_net::dns::encode_name(KNOWN_HOST, &mut encoded).unwrap();
        query[12..name_end] == encoded[..len]
    };

    let mut out = Vec::new();
    out.extend_from_slice(&query[0..2]);
    out.extend_from_slice(if known { &[0x81, 0x80] } else { &[0x81, 0x83] });
    out.extend_from_slice(&[0, 1, 0, u8::from(known), 0, 0, 0, 0]);
    out.extend_from_slice(question);
    if known {
        out.extend_from_slice(&[0xc0, 0x0c, 0, 1, 0, 1, 0, 0, 0x0e, 0x10, 0, 4]);
        out.extend_from_slice(&KNOWN_HOST_IP.octets());
    }
    out
}

pub const DHCP_SERVER: Ipv4Addr = PEER_IP;
pub const LEASED_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 2, 15);
pub const LEASED_DNS: Ipv4Addr = Ipv4Addr::new(10, 0, 2, 3);
pub const LEASE_SECS: u32 = 600;

/// A DHCP server on the gateway. Answers the first `naks` REQUESTs with a
/// NAK, then ACKs.
pub fn dhcp_server(naks: usize) -> Responder {
    let mut naks_left = naks;
    let mut gateway = gateway();
    Box::new(move |frame| {
        let Some(udp) = udp_of(frame) else {
            return gateway(frame);
        };
        if udp.dst_port != DHCP_SERVER_PORT {
            return gateway(frame);
        }
        let request = DhcpMessage::parse(&udp.payload).unwrap();
        let kind = match request.kind {
            DhcpMessageType::Discover => DhcpMessageType::Offer,
            DhcpMessageType::Request if naks_left > 0 => {
                naks_left -= 1;
                DhcpMessageType::Nak
            }
            DhcpMessageType::Request => DhcpMessageType::Ack,
            _ => return Vec::new(),
        };
        let mut reply = DhcpMessage::client(kind, request.xid, request.mac);
        reply.reply = true;
        reply.options.server_id = Some(DHCP_SERVER);
        if kind != DhcpMessageType::Nak {
            reply.yiaddr = LEASED_IP;
            reply.options.subnet_mask = Some(NETMASK);
            reply.options.router = Some(PEER_IP);
            reply.options.dns = Some(LEASED_DNS);
            reply.options.lease_time = Some(LEASE_SECS);
        }
        let mut buf = [0u8; DHCP_MESSAGE_LEN];
        let len = reply.encode(&mut buf);
        vec![udp_frame(
            SocketAddrV4::new(DHCP_SERVER, DHCP_SERVER_PORT),
            SocketAddrV4::new(Ipv4Addr::BROADCAST, DHCP_CLIENT_PORT),
            MacAddr::BROADCAST,
            &buf[..len],
        )]
    })
}

/// Client message carried by a transmitted frame, if it is DHCP.
pub fn dhcp_of(frame: &[u8]) -> Option<DhcpMessage> {
    let udp = udp_of(frame)?;
    if udp.dst_port != DHCP_SERVER_PORT {
        return None;
    }
    DhcpMessage::parse(&udp.payload).ok()
}
