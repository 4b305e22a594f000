//! TCP: header codec, connection states and the socket calls.
//!
//! There is no retransmission queue and no congestion control. Data goes out
//! once, in MSS-sized segments; the connection SYN is the only segment that
//! is resent.

pub mod buffer;
pub mod socket;

use core::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;

use bitflags::bitflags;
use log::{debug, info, trace, warn};
use zerocopy::byteorder::network_endian::{U16, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::checksum::pseudo_header_checksum;
use crate::error::{NetError, ParseError};
use crate::ipv4::{Ipv4Header, IPV4_MAX_PAYLOAD};
use crate::stack::NetStack;
use crate::sync::WaitQueue;
use crate::timer::RetryStep;
use crate::types::{IfaceId, IpProtocol, SocketHandle};

pub use self::buffer::RingBuffer;
pub use self::socket::{InputContext, OutSegment, Segment, TcpSocket, TcpSocketPool};

pub const TCP_HEADER_LEN: usize = 20;
pub const TCP_MAX_HEADER_LEN: usize = 60;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TcpFlags: u8 {
        const FIN = 1 << 0;
        const SYN = 1 << 1;
        const RST = 1 << 2;
        const PSH = 1 << 3;
        const ACK = 1 << 4;
        const URG = 1 << 5;
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromZeroes, FromBytes, AsBytes)]
pub struct TcpHeader {
    pub src_port: U16,
    pub dst_port: U16,
    pub seq: U32,
    pub ack: U32,
    /// Header length in 32-bit words, upper nibble.
    pub data_offset: u8,
    pub flags: u8,
    pub window: U16,
    pub checksum: U16,
    pub urgent: U16,
}

impl TcpHeader {
    /// Option-less header with a zero checksum.
    pub fn new(seg: &OutSegment) -> Self {
        Self {
            src_port: U16::new(seg.local_port),
            dst_port: U16::new(seg.remote_port),
            seq: U32::new(seg.seq),
            ack: U32::new(seg.ack),
            data_offset: ((TCP_HEADER_LEN / 4) as u8) << 4,
            flags: seg.flags.bits(),
            window: U16::new(seg.window),
            checksum: U16::ZERO,
            urgent: U16::ZERO,
        }
    }

    pub fn header_len(&self) -> usize {
        ((self.data_offset >> 4) as usize) * 4
    }

    pub fn flags(&self) -> TcpFlags {
        TcpFlags::from_bits_truncate(self.flags)
    }

    /// Split a segment into header and payload. Options are skipped.
    pub fn parse(data: &[u8]) -> Result<(Self, &[u8]), ParseError> {
        let header = Self::read_from_prefix(data).ok_or(ParseError::Truncated {
            layer: "tcp",
            len: data.len(),
        })?;
        let hlen = header.header_len();
        if !(TCP_HEADER_LEN..=TCP_MAX_HEADER_LEN).contains(&hlen) || hlen > data.len() {
            return Err(ParseError::BadDataOffset(hlen));
        }
        Ok((header, &data[hlen..]))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    Closed,
    Listen,
    SynSent,
    SynRcvd,
    Established,
    FinWait1,
    FinWait2,
    Closing,
    CloseWait,
    LastAck,
    TimeWait,
}

impl TcpState {
    /// SYN_RCVD and later, up to but not including TIME_WAIT: the peer holds
    /// state for this connection and an abort must tell it with an RST.
    pub fn is_synchronized(self) -> bool {
        !matches!(
            self,
            TcpState::Closed | TcpState::Listen | TcpState::SynSent | TcpState::TimeWait
        )
    }
}

impl fmt::Display for TcpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TcpState::Closed => "CLOSED",
            TcpState::Listen => "LISTEN",
            TcpState::SynSent => "SYN_SENT",
            TcpState::SynRcvd => "SYN_RCVD",
            TcpState::Established => "ESTABLISHED",
            TcpState::FinWait1 => "FIN_WAIT_1",
            TcpState::FinWait2 => "FIN_WAIT_2",
            TcpState::Closing => "CLOSING",
            TcpState::CloseWait => "CLOSE_WAIT",
            TcpState::LastAck => "LAST_ACK",
            TcpState::TimeWait => "TIME_WAIT",
        };
        f.write_str(name)
    }
}

/// Write header and payload into `buf` with the checksum filled in.
fn build_segment(
    buf: &mut [u8],
    src: Ipv4Addr,
    seg: &OutSegment,
    payload: &[u8],
) -> Result<usize, NetError> {
    let len = TCP_HEADER_LEN + payload.len();
    if len > buf.len() {
        return Err(NetError::PacketTooLarge(payload.len()));
    }
    TcpHeader::new(seg)
        .write_to_prefix(buf)
        .ok_or(NetError::PacketTooLarge(payload.len()))?;
    buf[TCP_HEADER_LEN..len].copy_from_slice(payload);
    let csum = pseudo_header_checksum(src, seg.remote_ip, IpProtocol::Tcp as u8, &buf[..len]);
    buf[16..18].copy_from_slice(&csum.to_be_bytes());
    Ok(len)
}

impl NetStack {
    pub(crate) fn tcp_handle_packet(&mut self, _iface: IfaceId, ip: &Ipv4Header, data: &[u8]) {
        let (header, payload) = match TcpHeader::parse(data) {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!("tcp: dropping segment from {}: {}", ip.src(), e);
                return;
            }
        };
        if pseudo_header_checksum(ip.src(), ip.dst(), IpProtocol::Tcp as u8, data) != 0 {
            debug!("tcp: {} from {}", ParseError::BadChecksum("tcp"), ip.src());
            return;
        }

        let seg = Segment {
            src: ip.src(),
            src_port: header.src_port.get(),
            dst_port: header.dst_port.get(),
            seq: header.seq.get(),
            ack: header.ack.get(),
            flags: header.flags(),
            window: header.window.get(),
            payload,
        };
        trace!(
            "tcp: {}:{} -> port {} {:?} seq {} ack {} len {}",
            seg.src,
            seg.src_port,
            seg.dst_port,
            seg.flags,
            seg.seq,
            seg.ack,
            payload.len()
        );

        let ctx = InputContext {
            now_ms: self.now_ms(),
            iss: self.tcp_next_iss(),
            lenient_handshake_ack: self.config.tcp_lenient_handshake_ack,
        };
        if let Some(reply) = self.tcp.input(&seg, ctx) {
            self.tcp_send_control(&reply);
        }
    }

    /// Initial sequence number: the millisecond clock scaled to roughly the
    /// RFC 793 4 µs tick, plus a per-connection step.
    fn tcp_next_iss(&mut self) -> u32 {
        self.tcp_iss_step = self.tcp_iss_step.wrapping_add(64_000);
        (self.now_ms() as u32)
            .wrapping_mul(250)
            .wrapping_add(self.tcp_iss_step)
    }

    /// Source address used for the pseudo-header towards `dst`.
    fn tcp_source_addr(&self, dst: Ipv4Addr) -> Result<Ipv4Addr, NetError> {
        let iface = match self.get_next_hop(dst) {
            Some((iface, _)) => iface,
            None => self.default_interface().ok_or(NetError::NoRoute(dst))?,
        };
        let nic = self.iface(iface)?;
        if !nic.has_ip() {
            return Err(NetError::NoAddress);
        }
        Ok(nic.ip)
    }

    fn tcp_transmit(&mut self, seg: &OutSegment, payload: &[u8]) -> Result<usize, NetError> {
        let src = self.tcp_source_addr(seg.remote_ip)?;
        let mut buf = [0u8; IPV4_MAX_PAYLOAD];
        let len = build_segment(&mut buf, src, seg, payload)?;
        self.ipv4_send_packet(seg.remote_ip, IpProtocol::Tcp, &buf[..len])
    }

    /// Control segments are fire-and-forget: a failed send is only logged.
    fn tcp_send_control(&mut self, seg: &OutSegment) {
        if let Err(e) = self.tcp_transmit(seg, &[]) {
            debug!(
                "tcp: {:?} to {}:{} not sent: {}",
                seg.flags, seg.remote_ip, seg.remote_port, e
            );
        }
    }

    pub(crate) fn tcp_poll_timers(&mut self, now: u64) {
        let linger = self.config.tcp_time_wait.as_millis() as u64;
        self.tcp.expire_time_wait(now, linger);
        let orphan = self.config.tcp_orphan_timeout.as_millis() as u64;
        self.tcp.expire_orphans(now, orphan);
    }

    pub fn tcp_listen(&mut self, port: u16) -> Result<SocketHandle, NetError> {
        self.tcp.listen(port)
    }

    /// Non-blocking: [`NetError::WouldBlock`] while no connection is pending.
    pub fn tcp_accept(&mut self, listener: SocketHandle) -> Result<SocketHandle, NetError> {
        let conn = self.tcp.accept(listener)?;
        let socket = self.tcp.get(conn)?;
        debug!(
            "tcp: accepted {}:{} on port {} as {}",
            socket.remote_ip, socket.remote_port, socket.local_port, conn
        );
        Ok(conn)
    }

    /// Active open. Blocks until ESTABLISHED, refused or out of time.
    pub fn tcp_connect(&mut self, remote: SocketAddrV4) -> Result<SocketHandle, NetError> {
        let iss = self.tcp_next_iss();
        let (conn, _) = self.tcp.open(*remote.ip(), remote.port(), iss)?;
        let mut retry = self.config.tcp_connect_retry.start(self.clock.as_ref());
        let mut unresolved = None;

        loop {
            match retry.step(self.clock.now_ms()) {
                RetryStep::Send => {
                    let syn = self.tcp.syn_for(conn)?;
                    match self.tcp_transmit(&syn, &[]) {
                        Ok(_) => unresolved = None,
                        Err(NetError::ArpPending(hop)) => {
                            retry.refund();
                            unresolved = Some(hop);
                        }
                        Err(e) => {
                            self.tcp.release(conn)?;
                            return Err(e);
                        }
                    }
                }
                RetryStep::Wait => {}
                RetryStep::Expired => {
                    info!("tcp: connect to {} timed out", remote);
                    self.tcp.release(conn)?;
                    return Err(NetError::TimedOut);
                }
            }

            self.poll();

            let socket = self.tcp.get(conn)?;
            match socket.state {
                TcpState::Established | TcpState::CloseWait | TcpState::LastAck => return Ok(conn),
                TcpState::Closed if socket.was_reset() => {
                    info!("tcp: connect to {} refused", remote);
                    self.tcp.release(conn)?;
                    return Err(NetError::ConnectionRefused);
                }
                _ => {}
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

    /// Send `data` in MSS-sized segments. Returns the number of bytes that
    /// left; an error is only returned when nothing did.
    pub fn tcp_send(&mut self, conn: SocketHandle, data: &[u8]) -> Result<usize, NetError> {
        let mss = usize::from(self.config.tcp_mss).clamp(1, IPV4_MAX_PAYLOAD - TCP_HEADER_LEN);
        let mut sent = 0;
        for chunk in data.chunks(mss) {
            let socket = self.tcp.get(conn)?;
            if !matches!(socket.state, TcpState::Established | TcpState::CloseWait) {
                if sent == 0 {
                    return Err(if socket.was_reset() {
                        NetError::ConnectionReset
                    } else {
                        NetError::NotConnected
                    });
                }
                break;
            }
            let seg = socket.data_segment();
            match self.tcp_transmit(&seg, chunk) {
                Ok(_) => {
                    let socket = self.tcp.get_mut(conn)?;
                    socket.snd_nxt = socket.snd_nxt.wrapping_add(chunk.len() as u32);
                    sent += chunk.len();
                }
                Err(e) if sent == 0 => return Err(e),
                Err(e) => {
                    warn!("tcp: send on {} stopped after {} bytes: {}", conn, sent, e);
                    break;
                }
            }
        }
        Ok(sent)
    }

    /// Non-blocking read. `Ok(0)` means the peer closed its side.
    pub fn tcp_recv(&mut self, conn: SocketHandle, buf: &mut [u8]) -> Result<usize, NetError> {
        let socket = self.tcp.get_mut(conn)?;
        let n = socket.read(buf);
        if n > 0 || buf.is_empty() {
            return Ok(n);
        }
        if socket.was_reset() {
            return Err(NetError::ConnectionReset);
        }
        if socket.peer_closed() || socket.state == TcpState::Closed {
            return Ok(0);
        }
        if socket.state == TcpState::Listen {
            return Err(NetError::NotConnected);
        }
        Err(NetError::WouldBlock)
    }

    /// Non-blocking close: sends FIN and gives up the handle. A listener is
    /// re-armed instead and its handle stays valid.
    pub fn tcp_close(&mut self, handle: SocketHandle) -> Result<(), NetError> {
        if let Some(fin) = self.tcp.close(handle, self.clock.now_ms())? {
            self.tcp_send_control(&fin);
        }
        Ok(())
    }

    /// Free the control block immediately, resetting the peer if needed.
    pub fn tcp_release(&mut self, handle: SocketHandle) -> Result<(), NetError> {
        for rst in self.tcp.release(handle)? {
            self.tcp_send_control(&rst);
        }
        Ok(())
    }

    pub fn tcp_state(&self, handle: SocketHandle) -> Result<TcpState, NetError> {
        Ok(self.tcp.get(handle)?.state)
    }

    /// Wait queue signalled on every state change and data arrival.
    pub fn tcp_waiter(&self, handle: SocketHandle) -> Result<Arc<WaitQueue>, NetError> {
        Ok(self.tcp.get(handle)?.waiter())
    }

    pub fn tcp_sockets(&self) -> &TcpSocketPool {
        &self.tcp
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout() {
        let seg = OutSegment {
            local_port: 80,
            remote_ip: Ipv4Addr::new(10, 0, 2, 2),
            remote_port: 40000,
            seq: 0x0102_0304,
            ack: 0x0a0b_0c0d,
            flags: TcpFlags::SYN | TcpFlags::ACK,
            window: 8192,
        };
        let header = TcpHeader::new(&seg);
        let bytes = header.as_bytes();
        assert_eq!(bytes.len(), TCP_HEADER_LEN);
        assert_eq!(&bytes[0..4], &[0, 80, 0x9c, 0x40]);
        assert_eq!(&bytes[4..8], &[1, 2, 3, 4]);
        assert_eq!(&bytes[8..12], &[0x0a, 0x0b, 0x0c, 0x0d]);
        assert_eq!(bytes[12], 0x50);
        assert_eq!(bytes[13], 0x12);
        assert_eq!(header.flags(), TcpFlags::SYN | TcpFlags::ACK);
    }

    #[test]
    fn built_segment_checksums() {
        let src = Ipv4Addr::new(10, 0, 2, 15);
        let seg = OutSegment {
            local_port: 80,
            remote_ip: Ipv4Addr::new(10, 0, 2, 2),
            remote_port: 40000,
            seq: 1,
            ack: 2,
            flags: TcpFlags::ACK | TcpFlags::PSH,
            window: 100,
        };
        let mut buf = [0u8; 64];
        let len = build_segment(&mut buf, src, &seg, b"abc").unwrap();
        assert_eq!(len, 23);
        assert_eq!(
            pseudo_header_checksum(src, seg.remote_ip, IpProtocol::Tcp as u8, &buf[..len]),
            0
        );
        let (header, payload) = TcpHeader::parse(&buf[..len]).unwrap();
        assert_eq!(header.seq.get(), 1);
        assert_eq!(payload, b"abc");
    }

    #[test]
    fn parse_rejects_bad_offset() {
        let mut buf = [0u8; 24];
        buf[12] = 0x40;
        assert_eq!(
            TcpHeader::parse(&buf).unwrap_err(),
            ParseError::BadDataOffset(16)
        );
        buf[12] = 0x70;
        assert_eq!(
            TcpHeader::parse(&buf).unwrap_err(),
            ParseError::BadDataOffset(28)
        );
        assert!(TcpHeader::parse(&buf[..10]).is_err());
        buf[12] = 0x60;
        let (_, payload) = TcpHeader::parse(&buf).unwrap();
        assert!(payload.is_empty());
    }

    #[test]
    fn state_names() {
        assert_eq!(TcpState::SynRcvd.to_string(), "SYN_RCVD");
        assert_eq!(TcpState::TimeWait.to_string(), "TIME_WAIT");
        assert!(TcpState::Established.is_synchronized());
        assert!(!TcpState::Listen.is_synchronized());
    }
}
