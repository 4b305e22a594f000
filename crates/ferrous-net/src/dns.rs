//! DNS stub resolver: A-record lookups over UDP, one query at a time.

use std::net::Ipv4Addr;

use log::{debug, info};
use thiserror::Error;
use zerocopy::byteorder::network_endian::U16;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::error::{NetError, ParseError};
use crate::stack::NetStack;
use crate::timer::RetryStep;

pub const DNS_PORT: u16 = 53;
/// Fixed source port for outgoing queries.
pub const DNS_CLIENT_PORT: u16 = 49_200;
pub const DNS_HEADER_LEN: usize = 12;
/// Largest message over plain UDP.
pub const DNS_MAX_MESSAGE: usize = 512;
const DNS_NAME_MAX: usize = 253;
const DNS_LABEL_MAX: usize = 63;
/// Compression pointers followed before a name is declared a loop.
const MAX_POINTER_FOLLOWS: usize = 16;

pub const DNS_TYPE_A: u16 = 1;
pub const DNS_CLASS_IN: u16 = 1;

const FLAG_QR: u16 = 0x8000;
const FLAG_RD: u16 = 0x0100;

const RCODE_SERVFAIL: u8 = 2;
const RCODE_NXDOMAIN: u8 = 3;
const RCODE_REFUSED: u8 = 5;

/// Why a lookup failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DnsError {
    #[error("no such domain")]
    NxDomain,

    #[error("server failure")]
    ServFail,

    #[error("query refused")]
    Refused,

    #[error("server returned rcode {0}")]
    Other(u8),

    #[error("no A record in answer")]
    NoAddress,

    #[error("malformed response")]
    Malformed,
}

impl DnsError {
    pub fn from_rcode(rcode: u8) -> Self {
        match rcode {
            RCODE_SERVFAIL => Self::ServFail,
            RCODE_NXDOMAIN => Self::NxDomain,
            RCODE_REFUSED => Self::Refused,
            other => Self::Other(other),
        }
    }
}

#[derive(Debug, Clone, Copy, FromZeroes, FromBytes, AsBytes)]
#[repr(C)]
pub struct DnsHeader {
    pub id: U16,
    pub flags: U16,
    pub qdcount: U16,
    pub ancount: U16,
    pub nscount: U16,
    pub arcount: U16,
}

impl DnsHeader {
    pub fn query(id: u16) -> Self {
        Self {
            id: U16::new(id),
            flags: U16::new(FLAG_RD),
            qdcount: U16::new(1),
            ancount: U16::ZERO,
            nscount: U16::ZERO,
            arcount: U16::ZERO,
        }
    }

    pub fn is_response(&self) -> bool {
        self.flags.get() & FLAG_QR != 0
    }

    pub fn rcode(&self) -> u8 {
        (self.flags.get() & 0x000f) as u8
    }
}

/// Encode `name` as length-prefixed labels. `"a.bc"` becomes
/// `01 'a' 02 'b' 'c' 00`. A single trailing dot is allowed.
pub fn encode_name(name: &str, out: &mut [u8]) -> Result<usize, NetError> {
    let invalid = || NetError::InvalidHostname(name.to_string());
    let trimmed = name.strip_suffix('.').unwrap_or(name);
    if trimmed.is_empty() || trimmed.len() > DNS_NAME_MAX {
        return Err(invalid());
    }

    let mut pos = 0usize;
    for label in trimmed.split('.') {
        if label.is_empty() || label.len() > DNS_LABEL_MAX {
            return Err(invalid());
        }
        // Length byte, label and at least the terminating zero.
        if pos + 1 + label.len() >= out.len() {
            return Err(invalid());
        }
        out[pos] = label.len() as u8;
        out[pos + 1..pos + 1 + label.len()].copy_from_slice(label.as_bytes());
        pos += 1 + label.len();
    }
    out[pos] = 0;
    Ok(pos + 1)
}

/// Build an A/IN query for `name`. Returns the message length.
pub fn build_query(id: u16, name: &str, out: &mut [u8]) -> Result<usize, NetError> {
    if out.len() < DNS_HEADER_LEN + 6 {
        return Err(NetError::PacketTooLarge(out.len()));
    }
    out[..DNS_HEADER_LEN].copy_from_slice(DnsHeader::query(id).as_bytes());
    let name_len = encode_name(name, &mut out[DNS_HEADER_LEN..])?;
    let q = DNS_HEADER_LEN + name_len;
    if q + 4 > out.len() {
        return Err(NetError::InvalidHostname(name.to_string()));
    }
    out[q..q + 2].copy_from_slice(&DNS_TYPE_A.to_be_bytes());
    out[q + 2..q + 4].copy_from_slice(&DNS_CLASS_IN.to_be_bytes());
    Ok(q + 4)
}

/// Offset just past the name starting at `offset`. A compression pointer
/// ends the name in place; its target is not visited.
pub fn skip_name(packet: &[u8], offset: usize) -> Result<usize, ParseError> {
    let mut pos = offset;
    loop {
        let len = *packet.get(pos).ok_or(ParseError::BadName(pos))?;
        match len & 0xc0 {
            0xc0 => {
                if pos + 1 >= packet.len() {
                    return Err(ParseError::BadName(pos));
                }
                return Ok(pos + 2);
            }
            0x00 if len == 0 => return Ok(pos + 1),
            0x00 => {
                pos += 1 + len as usize;
                if pos > packet.len() {
                    return Err(ParseError::BadName(offset));
                }
            }
            _ => return Err(ParseError::BadName(pos)),
        }
    }
}

/// Decode the name at `offset` into dotted text, following compression
/// pointers. Returns the name and the number of bytes it occupies at
/// `offset`.
pub fn decode_name(packet: &[u8], offset: usize) -> Result<(String, usize), ParseError> {
    let mut name = String::new();
    let mut pos = offset;
    let mut consumed = None;
    let mut follows = 0usize;

    loop {
        let len = *packet.get(pos).ok_or(ParseError::BadName(pos))?;
        if len == 0 {
            let consumed = consumed.unwrap_or_else(|| pos + 1 - offset);
            return Ok((name, consumed));
        }
        match len & 0xc0 {
            0xc0 => {
                let low = *packet.get(pos + 1).ok_or(ParseError::BadName(pos))?;
                consumed.get_or_insert_with(|| pos + 2 - offset);
                follows += 1;
                if follows > MAX_POINTER_FOLLOWS {
                    return Err(ParseError::BadName(pos));
                }
                pos = ((len as usize & 0x3f) << 8) | low as usize;
            }
            0x00 => {
                let label = packet
                    .get(pos + 1..pos + 1 + len as usize)
                    .ok_or(ParseError::BadName(pos))?;
                let sep = usize::from(!name.is_empty());
                if name.len() + sep + label.len() > DNS_NAME_MAX {
                    return Err(ParseError::BadName(pos));
                }
                if sep == 1 {
                    name.push('.');
                }
                name.extend(label.iter().map(|&b| char::from(b)));
                pos += 1 + len as usize;
            }
            _ => return Err(ParseError::BadName(pos)),
        }
    }
}

/// What a response says about our question.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DnsAnswer {
    pub id: u16,
    pub rcode: u8,
    /// First A record, if any.
    pub addr: Option<Ipv4Addr>,
    pub ttl: u32,
}

/// Walk a response: skip the questions and take the first A record.
pub fn parse_response(packet: &[u8]) -> Result<DnsAnswer, ParseError> {
    let header = DnsHeader::read_from_prefix(packet).ok_or(ParseError::Truncated {
        layer: "dns",
        len: packet.len(),
    })?;
    if !header.is_response() {
        return Err(ParseError::Unexpected {
            layer: "dns",
            value: header.flags.get() as u32,
        });
    }
    let mut answer = DnsAnswer {
        id: header.id.get(),
        rcode: header.rcode(),
        addr: None,
        ttl: 0,
    };
    if answer.rcode != 0 {
        return Ok(answer);
    }

    let mut pos = DNS_HEADER_LEN;
    for _ in 0..header.qdcount.get() {
        pos = skip_name(packet, pos)? + 4;
        if pos > packet.len() {
            return Err(ParseError::Truncated {
                layer: "dns",
                len: packet.len(),
            });
        }
    }

    for _ in 0..header.ancount.get() {
        pos = skip_name(packet, pos)?;
        let Some(rr) = packet.get(pos..pos + 10) else {
            return Err(ParseError::Truncated {
                layer: "dns",
                len: packet.len(),
            });
        };
        let rr_type = u16::from_be_bytes([rr[0], rr[1]]);
        let rr_class = u16::from_be_bytes([rr[2], rr[3]]);
        let ttl = u32::from_be_bytes([rr[4], rr[5], rr[6], rr[7]]);
        let rdlength = u16::from_be_bytes([rr[8], rr[9]]) as usize;
        pos += 10;
        let Some(rdata) = packet.get(pos..pos + rdlength) else {
            return Err(ParseError::BadLength {
                layer: "dns",
                len: rdlength,
            });
        };
        if rr_type == DNS_TYPE_A && rr_class == DNS_CLASS_IN && rdlength == 4 {
            answer.addr = Some(Ipv4Addr::new(rdata[0], rdata[1], rdata[2], rdata[3]));
            answer.ttl = ttl;
            break;
        }
        pos += rdlength;
    }
    Ok(answer)
}

/// Bookkeeping for the single outstanding query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsQuery {
    pub id: u16,
    pub hostname: String,
    pub completed: bool,
    pub result: Option<Result<Ipv4Addr, DnsError>>,
}

#[derive(Debug)]
pub struct DnsResolver {
    server: Option<Ipv4Addr>,
    next_id: u16,
    query: Option<DnsQuery>,
}

impl Default for DnsResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl DnsResolver {
    pub fn new() -> Self {
        Self {
            server: None,
            next_id: rand::random(),
            query: None,
        }
    }

    pub fn server(&self) -> Option<Ipv4Addr> {
        self.server
    }

    pub fn set_server(&mut self, server: Ipv4Addr) {
        self.server = (!server.is_unspecified()).then_some(server);
    }

    pub fn clear_server(&mut self) {
        self.server = None;
    }

    /// Record a new outstanding query, replacing any previous one.
    pub fn start_query(&mut self, hostname: &str) -> u16 {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        self.query = Some(DnsQuery {
            id,
            hostname: hostname.to_string(),
            completed: false,
            result: None,
        });
        id
    }

    pub fn query(&self) -> Option<&DnsQuery> {
        self.query.as_ref()
    }

    pub fn is_pending(&self) -> bool {
        self.query.as_ref().is_some_and(|q| !q.completed)
    }

    pub fn result(&self) -> Option<Result<Ipv4Addr, DnsError>> {
        self.query.as_ref().and_then(|q| q.result)
    }

    /// Match a response against the pending query. Returns true if it
    /// completed the query.
    pub fn handle_response(&mut self, packet: &[u8]) -> bool {
        let Some(header) = DnsHeader::read_from_prefix(packet) else {
            debug!(
                "dns: {}",
                ParseError::Truncated {
                    layer: "dns",
                    len: packet.len()
                }
            );
            return false;
        };
        let Some(query) = self.query.as_mut().filter(|q| !q.completed) else {
            debug!("dns: response {} with no query pending", header.id.get());
            return false;
        };
        if header.id.get() != query.id {
            debug!(
                "dns: {} (got {}, want {})",
                ParseError::XidMismatch { layer: "dns" },
                header.id.get(),
                query.id
            );
            return false;
        }

        let result = match parse_response(packet) {
            Ok(DnsAnswer { rcode, .. }) if rcode != 0 => Err(DnsError::from_rcode(rcode)),
            Ok(DnsAnswer { addr: Some(ip), .. }) => Ok(ip),
            Ok(_) => Err(DnsError::NoAddress),
            Err(ParseError::Unexpected { .. }) => {
                debug!("dns: ignoring query addressed to us");
                return false;
            }
            Err(e) => {
                debug!("dns: bad response for {}: {}", query.hostname, e);
                Err(DnsError::Malformed)
            }
        };
        match result {
            Ok(ip) => info!("dns: {} is {}", query.hostname, ip),
            Err(e) => info!("dns: {} failed: {}", query.hostname, e),
        }
        query.completed = true;
        query.result = Some(result);
        true
    }
}

impl NetStack {
    pub fn dns_set_server(&mut self, server: Ipv4Addr) {
        self.dns.set_server(server);
    }

    pub fn dns_server(&self) -> Option<Ipv4Addr> {
        self.dns.server()
    }

    /// Send an A query for `hostname`, replacing any pending query.
    ///
    /// The query is recorded before it is sent, so a send that fails on an
    /// unresolved next hop can simply be repeated.
    pub fn dns_send_query(&mut self, hostname: &str) -> Result<u16, NetError> {
        let server = self.dns.server().ok_or(NetError::NoDnsServer)?;
        let mut buf = [0u8; DNS_MAX_MESSAGE];
        // Validate the name before it replaces the pending query.
        build_query(0, hostname, &mut buf)?;
        let id = self.dns.start_query(hostname);
        let len = build_query(id, hostname, &mut buf)?;
        debug!("dns: query {} for {} to {}", id, hostname, server);
        self.udp_send_packet(DNS_CLIENT_PORT, server, DNS_PORT, &buf[..len])?;
        Ok(id)
    }

    pub(crate) fn dns_handle_packet(&mut self, data: &[u8]) {
        self.dns.handle_response(data);
    }

    pub fn dns_is_pending(&self) -> bool {
        self.dns.is_pending()
    }

    /// Outcome of the last query, once it has completed.
    pub fn dns_get_result(&self) -> Option<Result<Ipv4Addr, DnsError>> {
        self.dns.result()
    }

    /// Resolve `hostname` to an IPv4 address, resending per the DNS retry
    /// policy. Dotted quads are returned as-is.
    pub fn dns_resolve(&mut self, hostname: &str) -> Result<Ipv4Addr, NetError> {
        if let Ok(ip) = hostname.parse::<Ipv4Addr>() {
            return Ok(ip);
        }
        let mut retry = self.config.dns_retry.start(self.clock.as_ref());
        let mut unresolved = None;

        loop {
            match retry.step(self.clock.now_ms()) {
                RetryStep::Send => match self.dns_send_query(hostname) {
                    Ok(_) => unresolved = None,
                    Err(NetError::ArpPending(hop)) => {
                        retry.refund();
                        unresolved = Some(hop);
                    }
                    Err(e) => return Err(e),
                },
                RetryStep::Wait => {}
                RetryStep::Expired => {
                    info!("dns: no answer for {}", hostname);
                    return Err(NetError::TimedOut);
                }
            }

            self.poll();

            // Every send starts a fresh query, so any result here is ours.
            if let Some(result) = self.dns.result() {
                return result.map_err(NetError::from);
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
