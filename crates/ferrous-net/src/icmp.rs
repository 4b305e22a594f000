//! ICMP echo: answering pings and a synchronous ping client.

use std::net::Ipv4Addr;
use std::time::Duration;

use log::{debug, info, trace};
use zerocopy::byteorder::network_endian::U16;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::checksum::{checksum, verify};
use crate::error::{NetError, ParseError};
use crate::ipv4::{Ipv4Header, IPV4_MAX_PAYLOAD};
use crate::stack::NetStack;
use crate::timer::RetryStep;
use crate::types::{IfaceId, IpProtocol};

pub const ICMP_ECHO_REPLY: u8 = 0;
pub const ICMP_DEST_UNREACHABLE: u8 = 3;
pub const ICMP_ECHO_REQUEST: u8 = 8;
pub const ICMP_TIME_EXCEEDED: u8 = 11;
pub const ICMP_HEADER_LEN: usize = 8;

/// Payload carried by our echo requests.
const PING_PAYLOAD_LEN: usize = 32;

#[derive(Debug, Clone, Copy, FromZeroes, FromBytes, AsBytes)]
#[repr(C)]
pub struct IcmpHeader {
    pub icmp_type: u8,
    pub code: u8,
    pub checksum: U16,
    pub identifier: U16,
    pub sequence: U16,
}

impl IcmpHeader {
    pub fn echo_request(identifier: u16, sequence: u16) -> Self {
        Self {
            icmp_type: ICMP_ECHO_REQUEST,
            code: 0,
            checksum: U16::ZERO,
            identifier: U16::new(identifier),
            sequence: U16::new(sequence),
        }
    }
}

/// Counters reported by [`NetStack::ping_get_stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PingStats {
    pub sent: u32,
    pub received: u32,
}

/// The one outstanding ping. Concurrent pings are not supported.
#[derive(Debug, Clone)]
pub struct PingState {
    pub dest: Ipv4Addr,
    /// Name the caller asked for, when pinging by hostname.
    pub host: Option<String>,
    pub id: u16,
    pub seq: u16,
    pub sent: u32,
    pub received: u32,
    pub waiting: bool,
    sent_at_ms: u64,
    rtt_ms: Option<u64>,
}

impl PingState {
    pub fn new(id: u16) -> Self {
        Self {
            dest: Ipv4Addr::UNSPECIFIED,
            host: None,
            id,
            seq: 0,
            sent: 0,
            received: 0,
            waiting: false,
            sent_at_ms: 0,
            rtt_ms: None,
        }
    }

    pub fn stats(&self) -> PingStats {
        PingStats {
            sent: self.sent,
            received: self.received,
        }
    }

    /// Counters are kept per destination: switching targets starts over.
    fn retarget(&mut self, dest: Ipv4Addr, host: Option<String>) {
        if self.dest != dest {
            self.dest = dest;
            self.sent = 0;
            self.received = 0;
        }
        self.host = host;
        self.waiting = false;
        self.rtt_ms = None;
    }
}

fn echo_message(id: u16, seq: u16, buf: &mut [u8; ICMP_HEADER_LEN + PING_PAYLOAD_LEN]) {
    buf[..ICMP_HEADER_LEN].copy_from_slice(IcmpHeader::echo_request(id, seq).as_bytes());
    for (i, byte) in buf[ICMP_HEADER_LEN..].iter_mut().enumerate() {
        *byte = b'a' + (i % 23) as u8;
    }
    let sum = checksum(buf);
    buf[2..4].copy_from_slice(&sum.to_be_bytes());
}

impl NetStack {
    pub(crate) fn icmp_handle_packet(&mut self, _iface: IfaceId, ip: &Ipv4Header, data: &[u8]) {
        let Some(header) = IcmpHeader::read_from_prefix(data) else {
            debug!(
                "{}",
                ParseError::Truncated {
                    layer: "icmp",
                    len: data.len()
                }
            );
            return;
        };
        if !verify(data) {
            debug!("icmp: {} from {}", ParseError::BadChecksum("icmp"), ip.src());
            return;
        }

        match header.icmp_type {
            ICMP_ECHO_REQUEST => self.icmp_echo_reply(ip.src(), data),
            ICMP_ECHO_REPLY => self.icmp_handle_echo_reply(ip.src(), &header),
            ICMP_DEST_UNREACHABLE => {
                debug!("icmp: destination unreachable (code {}) from {}", header.code, ip.src())
            }
            ICMP_TIME_EXCEEDED => debug!("icmp: time exceeded from {}", ip.src()),
            other => trace!("icmp: ignoring type {} from {}", other, ip.src()),
        }
    }

    /// Answer an echo request: same message, type flipped, checksum redone.
    fn icmp_echo_reply(&mut self, src: Ipv4Addr, request: &[u8]) {
        if request.len() > IPV4_MAX_PAYLOAD {
            return;
        }
        let mut reply = [0u8; IPV4_MAX_PAYLOAD];
        let reply = &mut reply[..request.len()];
        reply.copy_from_slice(request);
        reply[0] = ICMP_ECHO_REPLY;
        reply[2..4].fill(0);
        let sum = checksum(reply);
        reply[2..4].copy_from_slice(&sum.to_be_bytes());

        trace!("icmp: echo reply to {}", src);
        if let Err(e) = self.ipv4_send_packet(src, IpProtocol::Icmp, reply) {
            debug!("icmp: echo reply to {} not sent: {}", src, e);
        }
    }

    fn icmp_handle_echo_reply(&mut self, src: Ipv4Addr, header: &IcmpHeader) {
        let now = self.now_ms();
        let ping = &mut self.ping;
        if header.identifier.get() != ping.id || !ping.waiting {
            debug!(
                "icmp: echo reply from {} id {} is not our ping",
                src,
                header.identifier.get()
            );
            return;
        }
        ping.waiting = false;
        ping.received += 1;
        ping.rtt_ms = Some(now.saturating_sub(ping.sent_at_ms));
        trace!("icmp: reply from {} seq {}", src, header.sequence.get());
    }

    /// Send one echo request with the current ping identifier.
    pub fn icmp_send_echo(&mut self, dst: Ipv4Addr, seq: u16) -> Result<usize, NetError> {
        let mut message = [0u8; ICMP_HEADER_LEN + PING_PAYLOAD_LEN];
        echo_message(self.ping.id, seq, &mut message);
        self.ipv4_send_packet(dst, IpProtocol::Icmp, &message)
    }

    /// Ping `dst` once and wait for the reply.
    ///
    /// While the next hop is unresolved the echo is dropped by the IPv4
    /// layer; that attempt is not counted and the echo goes out as soon as
    /// the ARP reply lands.
    pub fn ping_ip(&mut self, dst: Ipv4Addr) -> Result<Duration, NetError> {
        self.ping_start(dst, None)
    }

    /// Ping by name or dotted quad. Names are resolved through the DNS
    /// resolver first.
    pub fn ping(&mut self, host: &str) -> Result<Duration, NetError> {
        if let Ok(ip) = host.parse::<Ipv4Addr>() {
            return self.ping_ip(ip);
        }
        let ip = self.dns_resolve(host)?;
        info!("ping: {} is {}", host, ip);
        self.ping_start(ip, Some(host.to_string()))
    }

    pub fn ping_get_stats(&self) -> PingStats {
        self.ping.stats()
    }

    pub fn ping_state(&self) -> &PingState {
        &self.ping
    }

    fn ping_start(&mut self, dst: Ipv4Addr, host: Option<String>) -> Result<Duration, NetError> {
        self.ping.retarget(dst, host);
        let mut retry = self.config.ping_retry.start(self.clock.as_ref());
        let mut unresolved = None;

        loop {
            match retry.step(self.clock.now_ms()) {
                RetryStep::Send => {
                    self.ping.seq = self.ping.seq.wrapping_add(1);
                    match self.icmp_send_echo(dst, self.ping.seq) {
                        Ok(_) => {
                            self.ping.sent += 1;
                            self.ping.waiting = true;
                            self.ping.sent_at_ms = self.clock.now_ms();
                            unresolved = None;
                        }
                        Err(NetError::ArpPending(hop)) => {
                            retry.refund();
                            unresolved = Some(hop);
                        }
                        Err(e) => return Err(e),
                    }
                }
                RetryStep::Wait => {}
                RetryStep::Expired => {
                    self.ping.waiting = false;
                    info!("ping: no reply from {}", dst);
                    return Err(NetError::TimedOut);
                }
            }

            self.poll();

            if let Some(rtt) = self.ping.rtt_ms {
                return Ok(Duration::from_millis(rtt));
            }
            if let Some(hop) = unresolved {
                if self.arp.lookup(hop).is_some() {
                    unresolved = None;
                    retry.send_now();
                    continue;
                }
            }
            self.clock.idle(retry.poll_interval());
        }
    }
}
