//! TCP control blocks and the per-segment state machine.
//!
//! The pool never touches the network. [`TcpSocketPool::input`] and the
//! socket calls return the segment to send, if any, and the stack frames and
//! transmits it.

use std::net::Ipv4Addr;
use std::sync::Arc;

use log::{debug, info, trace, warn};

use super::buffer::RingBuffer;
use super::{TcpFlags, TcpState};
use crate::error::NetError;
use crate::sync::WaitQueue;
use crate::types::SocketHandle;

pub const EPHEMERAL_PORT_START: u16 = 49152;

/// `a` is before `b` in sequence space.
pub fn seq_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

pub fn seq_le(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) <= 0
}

pub fn seq_gt(a: u32, b: u32) -> bool {
    seq_lt(b, a)
}

/// A received segment, already checksummed.
#[derive(Debug, Clone, Copy)]
pub struct Segment<'a> {
    pub src: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub window: u16,
    pub payload: &'a [u8],
}

/// A segment the state machine wants sent. Control segments carry no data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutSegment {
    pub local_port: u16,
    pub remote_ip: Ipv4Addr,
    pub remote_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub window: u16,
}

impl OutSegment {
    /// Reset answering a segment that matches no connection.
    pub fn reset_for(seg: &Segment<'_>) -> Self {
        let (seq, ack, flags) = if seg.flags.contains(TcpFlags::ACK) {
            (seg.ack, 0, TcpFlags::RST)
        } else {
            let mut len = seg.payload.len() as u32;
            if seg.flags.contains(TcpFlags::SYN) {
                len += 1;
            }
            if seg.flags.contains(TcpFlags::FIN) {
                len += 1;
            }
            (0, seg.seq.wrapping_add(len), TcpFlags::RST | TcpFlags::ACK)
        };
        Self {
            local_port: seg.dst_port,
            remote_ip: seg.src,
            remote_port: seg.src_port,
            seq,
            ack,
            flags,
            window: 0,
        }
    }
}

/// One connection control block.
pub struct TcpSocket {
    pub state: TcpState,
    pub local_port: u16,
    pub remote_ip: Ipv4Addr,
    pub remote_port: u16,
    pub iss: u32,
    pub snd_una: u32,
    pub snd_nxt: u32,
    /// Peer's advertised window.
    pub snd_wnd: u16,
    /// Next sequence number expected from the peer.
    pub rcv_nxt: u32,
    rx: RingBuffer,
    /// Listener this connection was spawned from.
    parent: Option<SocketHandle>,
    accepted: bool,
    /// The application closed its handle; free the block once the close
    /// completes.
    detached: bool,
    peer_fin: bool,
    reset: bool,
    order: u64,
    time_wait_since: u64,
    /// When the application closed its handle.
    detached_since: u64,
    waiter: Arc<WaitQueue>,
}

impl TcpSocket {
    fn new(rx_capacity: usize) -> Self {
        Self {
            state: TcpState::Closed,
            local_port: 0,
            remote_ip: Ipv4Addr::UNSPECIFIED,
            remote_port: 0,
            iss: 0,
            snd_una: 0,
            snd_nxt: 0,
            snd_wnd: 0,
            rcv_nxt: 0,
            rx: RingBuffer::new(rx_capacity),
            parent: None,
            accepted: false,
            detached: false,
            peer_fin: false,
            reset: false,
            order: 0,
            time_wait_since: 0,
            detached_since: 0,
            waiter: Arc::new(WaitQueue::new()),
        }
    }

    fn clear(&mut self) {
        self.state = TcpState::Closed;
        self.local_port = 0;
        self.clear_peer();
        self.rx.clear();
        self.parent = None;
        self.accepted = false;
        self.detached = false;
        self.detached_since = 0;
        self.reset = false;
    }

    fn clear_peer(&mut self) {
        self.remote_ip = Ipv4Addr::UNSPECIFIED;
        self.remote_port = 0;
        self.iss = 0;
        self.snd_una = 0;
        self.snd_nxt = 0;
        self.snd_wnd = 0;
        self.rcv_nxt = 0;
        self.peer_fin = false;
        self.time_wait_since = 0;
    }

    /// Receive window we advertise.
    pub fn window(&self) -> u16 {
        self.rx.free().min(u16::MAX as usize) as u16
    }

    pub fn buffered(&self) -> usize {
        self.rx.len()
    }

    pub fn peer_closed(&self) -> bool {
        self.peer_fin
    }

    pub fn was_reset(&self) -> bool {
        self.reset
    }

    pub fn waiter(&self) -> Arc<WaitQueue> {
        Arc::clone(&self.waiter)
    }

    fn segment(&self, seq: u32, flags: TcpFlags) -> OutSegment {
        OutSegment {
            local_port: self.local_port,
            remote_ip: self.remote_ip,
            remote_port: self.remote_port,
            seq,
            ack: self.rcv_nxt,
            flags,
            window: self.window(),
        }
    }

    /// Header for the next outgoing data segment.
    pub fn data_segment(&self) -> OutSegment {
        self.segment(self.snd_nxt, TcpFlags::ACK | TcpFlags::PSH)
    }

    fn ack_segment(&self) -> OutSegment {
        self.segment(self.snd_nxt, TcpFlags::ACK)
    }

    fn matches(&self, seg: &Segment<'_>) -> bool {
        !matches!(self.state, TcpState::Closed | TcpState::Listen)
            && self.local_port == seg.dst_port
            && self.remote_ip == seg.src
            && self.remote_port == seg.src_port
    }

    /// Read buffered bytes into `out`.
    pub fn read(&mut self, out: &mut [u8]) -> usize {
        self.rx.read(out)
    }
}

struct TcpSlot {
    generation: u32,
    in_use: bool,
    socket: TcpSocket,
}

/// Input tunables the stack passes with every segment.
#[derive(Debug, Clone, Copy)]
pub struct InputContext {
    pub now_ms: u64,
    /// ISN to use if this segment opens a connection.
    pub iss: u32,
    pub lenient_handshake_ack: bool,
}

pub struct TcpSocketPool {
    slots: Vec<TcpSlot>,
    next_order: u64,
    next_ephemeral: u16,
}

impl TcpSocketPool {
    pub fn new(capacity: usize, rx_buffer: usize) -> Self {
        Self {
            slots: (0..capacity.max(1))
                .map(|_| TcpSlot {
                    generation: 0,
                    in_use: false,
                    socket: TcpSocket::new(rx_buffer),
                })
                .collect(),
            next_order: 0,
            next_ephemeral: EPHEMERAL_PORT_START,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn active_count(&self) -> usize {
        self.slots.iter().filter(|s| s.in_use).count()
    }

    fn handle(&self, index: usize) -> SocketHandle {
        SocketHandle {
            index: index as u16,
            generation: self.slots[index].generation,
        }
    }

    fn index_of(&self, handle: SocketHandle) -> Result<usize, NetError> {
        match self.slots.get(handle.index()) {
            Some(slot) if slot.in_use && slot.generation == handle.generation => {
                Ok(handle.index())
            }
            _ => Err(NetError::InvalidHandle),
        }
    }

    pub fn get(&self, handle: SocketHandle) -> Result<&TcpSocket, NetError> {
        let index = self.index_of(handle)?;
        Ok(&self.slots[index].socket)
    }

    pub fn get_mut(&mut self, handle: SocketHandle) -> Result<&mut TcpSocket, NetError> {
        let index = self.index_of(handle)?;
        Ok(&mut self.slots[index].socket)
    }

    fn alloc(&mut self) -> Option<usize> {
        let index = self.slots.iter().position(|s| !s.in_use)?;
        let order = self.next_order;
        self.next_order += 1;
        let slot = &mut self.slots[index];
        slot.in_use = true;
        slot.socket.clear();
        slot.socket.order = order;
        Some(index)
    }

    fn free(&mut self, index: usize) {
        let slot = &mut self.slots[index];
        trace!("tcp: freeing block {}", index);
        slot.in_use = false;
        slot.generation = slot.generation.wrapping_add(1);
        slot.socket.clear();
        slot.socket.waiter.notify();
    }

    /// Invalidate the application's handle but keep the block running.
    fn detach(&mut self, index: usize, now_ms: u64) {
        let slot = &mut self.slots[index];
        slot.generation = slot.generation.wrapping_add(1);
        if !slot.socket.detached {
            slot.socket.detached = true;
            slot.socket.detached_since = now_ms;
        }
    }

    fn port_in_use(&self, port: u16) -> bool {
        self.slots
            .iter()
            .any(|s| s.in_use && s.socket.local_port == port)
    }

    fn ephemeral_port(&mut self) -> Option<u16> {
        for _ in EPHEMERAL_PORT_START..=u16::MAX {
            let port = self.next_ephemeral;
            self.next_ephemeral = port.checked_add(1).unwrap_or(EPHEMERAL_PORT_START);
            if !self.port_in_use(port) {
                return Some(port);
            }
        }
        None
    }

    pub fn listen(&mut self, port: u16) -> Result<SocketHandle, NetError> {
        let taken = self
            .slots
            .iter()
            .any(|s| s.in_use && s.socket.state == TcpState::Listen && s.socket.local_port == port);
        if taken {
            return Err(NetError::PortInUse(port));
        }
        let index = self.alloc().ok_or(NetError::PoolExhausted)?;
        let socket = &mut self.slots[index].socket;
        socket.state = TcpState::Listen;
        socket.local_port = port;
        debug!("tcp: listening on port {}", port);
        Ok(self.handle(index))
    }

    /// Oldest child of `listener` whose handshake has started and that has
    /// not been handed out yet.
    pub fn accept(&mut self, listener: SocketHandle) -> Result<SocketHandle, NetError> {
        let lindex = self.index_of(listener)?;
        if self.slots[lindex].socket.state != TcpState::Listen {
            return Err(NetError::NotConnected);
        }
        let child = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| {
                s.in_use
                    && !s.socket.accepted
                    && !s.socket.detached
                    && s.socket.parent == Some(listener)
                    && s.socket.state != TcpState::SynSent
            })
            .min_by_key(|(_, s)| s.socket.order)
            .map(|(i, _)| i)
            .ok_or(NetError::WouldBlock)?;
        self.slots[child].socket.accepted = true;
        Ok(self.handle(child))
    }

    /// Start an active open. Returns the SYN to send.
    pub fn open(
        &mut self,
        remote_ip: Ipv4Addr,
        remote_port: u16,
        iss: u32,
    ) -> Result<(SocketHandle, OutSegment), NetError> {
        let local_port = self.ephemeral_port().ok_or(NetError::PoolExhausted)?;
        let index = self.alloc().ok_or(NetError::PoolExhausted)?;
        let socket = &mut self.slots[index].socket;
        socket.state = TcpState::SynSent;
        socket.local_port = local_port;
        socket.remote_ip = remote_ip;
        socket.remote_port = remote_port;
        socket.iss = iss;
        socket.snd_una = iss;
        socket.snd_nxt = iss.wrapping_add(1);
        socket.accepted = true;
        let syn = socket.segment(iss, TcpFlags::SYN);
        Ok((self.handle(index), OutSegment { ack: 0, ..syn }))
    }

    /// The SYN of a pending active open, for retransmission.
    pub fn syn_for(&self, handle: SocketHandle) -> Result<OutSegment, NetError> {
        let socket = self.get(handle)?;
        if socket.state != TcpState::SynSent {
            return Err(NetError::NotConnected);
        }
        Ok(OutSegment {
            ack: 0,
            ..socket.segment(socket.iss, TcpFlags::SYN)
        })
    }

    /// Application close.
    ///
    /// A listener is re-armed as a clean LISTEN and keeps its handle. A
    /// connection sends FIN and is detached; the block is freed once the
    /// close completes or [`Self::expire_orphans`] gives up on the peer.
    pub fn close(
        &mut self,
        handle: SocketHandle,
        now_ms: u64,
    ) -> Result<Option<OutSegment>, NetError> {
        let index = self.index_of(handle)?;
        let socket = &mut self.slots[index].socket;
        let fin = TcpFlags::FIN | TcpFlags::ACK;
        let out = match socket.state {
            TcpState::Listen => {
                socket.clear_peer();
                socket.rx.clear();
                socket.waiter.notify();
                debug!("tcp: listener on port {} re-armed", socket.local_port);
                return Ok(None);
            }
            TcpState::SynRcvd | TcpState::Established => {
                let seg = socket.segment(socket.snd_nxt, fin);
                socket.snd_nxt = socket.snd_nxt.wrapping_add(1);
                socket.state = TcpState::FinWait1;
                Some(seg)
            }
            TcpState::CloseWait => {
                let seg = socket.segment(socket.snd_nxt, fin);
                socket.snd_nxt = socket.snd_nxt.wrapping_add(1);
                socket.state = TcpState::LastAck;
                Some(seg)
            }
            TcpState::Closed | TcpState::SynSent => {
                self.free(index);
                return Ok(None);
            }
            // Our FIN is already out.
            TcpState::FinWait1
            | TcpState::FinWait2
            | TcpState::Closing
            | TcpState::LastAck
            | TcpState::TimeWait => None,
        };
        socket.waiter.notify();
        self.detach(index, now_ms);
        Ok(out)
    }

    /// Free the block now. Synchronized connections get an RST; a listener
    /// takes its un-accepted children with it.
    pub fn release(&mut self, handle: SocketHandle) -> Result<Vec<OutSegment>, NetError> {
        let index = self.index_of(handle)?;
        let mut resets = Vec::new();
        if self.slots[index].socket.state == TcpState::Listen {
            let children: Vec<usize> = self
                .slots
                .iter()
                .enumerate()
                .filter(|(_, s)| s.in_use && !s.socket.accepted && s.socket.parent == Some(handle))
                .map(|(i, _)| i)
                .collect();
            for child in children {
                resets.extend(self.abort(child));
            }
        }
        resets.extend(self.abort(index));
        Ok(resets)
    }

    fn abort(&mut self, index: usize) -> Option<OutSegment> {
        let socket = &self.slots[index].socket;
        let rst = socket
            .state
            .is_synchronized()
            .then(|| socket.segment(socket.snd_nxt, TcpFlags::RST | TcpFlags::ACK));
        self.free(index);
        rst
    }

    /// Free TIME_WAIT blocks older than `linger_ms`. Returns how many.
    pub fn expire_time_wait(&mut self, now_ms: u64, linger_ms: u64) -> usize {
        let expired: Vec<usize> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| {
                s.in_use
                    && s.socket.state == TcpState::TimeWait
                    && now_ms.saturating_sub(s.socket.time_wait_since) >= linger_ms
            })
            .map(|(i, _)| i)
            .collect();
        for &index in &expired {
            debug!("tcp: TIME_WAIT on port {} expired", self.slots[index].socket.local_port);
            self.free(index);
        }
        expired.len()
    }

    /// Free detached blocks still waiting on the peer to finish the close
    /// (FIN_WAIT_1/2, CLOSING, LAST_ACK) `timeout_ms` after the application
    /// let go. Returns how many.
    pub fn expire_orphans(&mut self, now_ms: u64, timeout_ms: u64) -> usize {
        let expired: Vec<usize> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| {
                s.in_use
                    && s.socket.detached
                    && s.socket.state != TcpState::TimeWait
                    && now_ms.saturating_sub(s.socket.detached_since) >= timeout_ms
            })
            .map(|(i, _)| i)
            .collect();
        for &index in &expired {
            let socket = &self.slots[index].socket;
            info!(
                "tcp: {}:{} never finished closing port {} ({}), dropping",
                socket.remote_ip, socket.remote_port, socket.local_port, socket.state
            );
            self.free(index);
        }
        expired.len()
    }

    fn find_connection(&self, seg: &Segment<'_>) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.in_use && s.socket.matches(seg))
    }

    fn find_listener(&self, port: u16) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.in_use && s.socket.state == TcpState::Listen && s.socket.local_port == port)
    }

    /// Run one inbound segment through the state machine.
    pub fn input(&mut self, seg: &Segment<'_>, ctx: InputContext) -> Option<OutSegment> {
        if let Some(index) = self.find_connection(seg) {
            return self.input_connection(index, seg, ctx);
        }
        if let Some(listener) = self.find_listener(seg.dst_port) {
            return self.input_listen(listener, seg, ctx);
        }
        if seg.flags.contains(TcpFlags::RST) {
            return None;
        }
        trace!(
            "tcp: no socket for {}:{} -> port {}, resetting",
            seg.src,
            seg.src_port,
            seg.dst_port
        );
        Some(OutSegment::reset_for(seg))
    }

    fn input_listen(
        &mut self,
        listener: usize,
        seg: &Segment<'_>,
        ctx: InputContext,
    ) -> Option<OutSegment> {
        if seg.flags.contains(TcpFlags::RST) {
            return None;
        }
        if seg.flags.contains(TcpFlags::ACK) {
            return Some(OutSegment::reset_for(seg));
        }
        if !seg.flags.contains(TcpFlags::SYN) {
            return None;
        }

        let parent = self.handle(listener);
        let Some(index) = self.alloc() else {
            warn!(
                "tcp: pool exhausted, refusing {}:{} on port {}",
                seg.src, seg.src_port, seg.dst_port
            );
            return Some(OutSegment::reset_for(seg));
        };
        let child = &mut self.slots[index].socket;
        child.state = TcpState::SynRcvd;
        child.local_port = seg.dst_port;
        child.remote_ip = seg.src;
        child.remote_port = seg.src_port;
        child.iss = ctx.iss;
        child.snd_una = ctx.iss;
        child.snd_nxt = ctx.iss.wrapping_add(1);
        child.snd_wnd = seg.window;
        child.rcv_nxt = seg.seq.wrapping_add(1);
        child.parent = Some(parent);
        debug!(
            "tcp: SYN from {}:{} on port {}, block {}",
            seg.src, seg.src_port, seg.dst_port, index
        );
        let reply = child.segment(ctx.iss, TcpFlags::SYN | TcpFlags::ACK);
        self.slots[listener].socket.waiter.notify();
        Some(reply)
    }

    fn input_connection(
        &mut self,
        index: usize,
        seg: &Segment<'_>,
        ctx: InputContext,
    ) -> Option<OutSegment> {
        if seg.flags.contains(TcpFlags::RST) {
            self.input_reset(index);
            return None;
        }

        let socket = &mut self.slots[index].socket;
        match socket.state {
            TcpState::SynSent => return self.input_syn_sent(index, seg),
            TcpState::SynRcvd => {
                if seg.flags.contains(TcpFlags::SYN) {
                    // Our SYN+ACK was lost; say it again.
                    return Some(socket.segment(socket.iss, TcpFlags::SYN | TcpFlags::ACK));
                }
                if !seg.flags.contains(TcpFlags::ACK) {
                    return None;
                }
                let expected = socket.snd_nxt;
                let off_by = seg.ack.wrapping_sub(expected) as i32;
                let ok = off_by == 0 || (ctx.lenient_handshake_ack && off_by.abs() == 1);
                if !ok {
                    debug!(
                        "tcp: handshake ack {} != {} from {}:{}",
                        seg.ack, expected, seg.src, seg.src_port
                    );
                    return Some(OutSegment::reset_for(seg));
                }
                socket.snd_una = expected;
                socket.snd_wnd = seg.window;
                socket.state = TcpState::Established;
                socket.waiter.notify();
                info!(
                    "tcp: {}:{} connected on port {}",
                    socket.remote_ip, socket.remote_port, socket.local_port
                );
                if let Some(parent) = socket.parent {
                    if let Ok(p) = self.index_of(parent) {
                        self.slots[p].socket.waiter.notify();
                    }
                }
            }
            TcpState::Closed | TcpState::Listen => return None,
            _ => {}
        }

        self.input_synchronized(index, seg, ctx)
    }

    fn input_syn_sent(&mut self, index: usize, seg: &Segment<'_>) -> Option<OutSegment> {
        let socket = &mut self.slots[index].socket;
        let has_ack = seg.flags.contains(TcpFlags::ACK);
        if has_ack && seg.ack != socket.snd_nxt {
            return Some(OutSegment::reset_for(seg));
        }
        if !seg.flags.contains(TcpFlags::SYN) {
            return None;
        }
        socket.rcv_nxt = seg.seq.wrapping_add(1);
        socket.snd_wnd = seg.window;
        if has_ack {
            socket.snd_una = seg.ack;
            socket.state = TcpState::Established;
            info!(
                "tcp: connected to {}:{} from port {}",
                socket.remote_ip, socket.remote_port, socket.local_port
            );
            socket.waiter.notify();
            Some(socket.ack_segment())
        } else {
            // Simultaneous open.
            socket.state = TcpState::SynRcvd;
            socket.waiter.notify();
            Some(socket.segment(socket.iss, TcpFlags::SYN | TcpFlags::ACK))
        }
    }

    fn input_reset(&mut self, index: usize) {
        let socket = &mut self.slots[index].socket;
        debug!(
            "tcp: reset by {}:{} in {}",
            socket.remote_ip, socket.remote_port, socket.state
        );
        let never_accepted = socket.parent.is_some() && !socket.accepted;
        if socket.detached || never_accepted || socket.state == TcpState::TimeWait {
            self.free(index);
            return;
        }
        // Buffered data stays readable.
        socket.clear_peer();
        socket.state = TcpState::Closed;
        socket.reset = true;
        socket.waiter.notify();
    }

    /// ESTABLISHED and the closing states: ACK bookkeeping, data, FIN.
    fn input_synchronized(
        &mut self,
        index: usize,
        seg: &Segment<'_>,
        ctx: InputContext,
    ) -> Option<OutSegment> {
        let socket = &mut self.slots[index].socket;
        let mut need_ack = false;
        let mut changed = false;

        if seg.flags.contains(TcpFlags::ACK)
            && seq_gt(seg.ack, socket.snd_una)
            && seq_le(seg.ack, socket.snd_nxt)
        {
            socket.snd_una = seg.ack;
            socket.snd_wnd = seg.window;
        }
        let fin_acked = socket.snd_una == socket.snd_nxt;

        match socket.state {
            TcpState::FinWait1 if fin_acked => {
                socket.state = TcpState::FinWait2;
                changed = true;
            }
            TcpState::Closing if fin_acked => {
                socket.state = TcpState::TimeWait;
                socket.time_wait_since = ctx.now_ms;
                changed = true;
            }
            TcpState::LastAck if fin_acked => {
                debug!("tcp: connection on port {} closed", socket.local_port);
                if socket.detached {
                    self.free(index);
                    return None;
                }
                socket.state = TcpState::Closed;
                socket.waiter.notify();
                return None;
            }
            _ => {}
        }

        let mut next_seq = seg.seq;
        if !seg.payload.is_empty() {
            need_ack = true;
            let receiving = matches!(
                socket.state,
                TcpState::Established | TcpState::FinWait1 | TcpState::FinWait2
            );
            if receiving && seg.seq == socket.rcv_nxt {
                if socket.rx.free() >= seg.payload.len() {
                    socket.rx.write(seg.payload);
                    socket.rcv_nxt = socket.rcv_nxt.wrapping_add(seg.payload.len() as u32);
                    changed = true;
                } else {
                    warn!(
                        "tcp: receive buffer full on port {}, dropping {} bytes",
                        socket.local_port,
                        seg.payload.len()
                    );
                }
            } else {
                trace!(
                    "tcp: out-of-order seq {} (want {}) on port {}",
                    seg.seq,
                    socket.rcv_nxt,
                    socket.local_port
                );
            }
            next_seq = seg.seq.wrapping_add(seg.payload.len() as u32);
        }

        let mut reply = None;
        if seg.flags.contains(TcpFlags::FIN) {
            need_ack = true;
            if next_seq == socket.rcv_nxt && !socket.peer_fin {
                socket.rcv_nxt = socket.rcv_nxt.wrapping_add(1);
                socket.peer_fin = true;
                changed = true;
                match socket.state {
                    TcpState::Established => {
                        // No half-close: answer the FIN with ours right away.
                        socket.state = TcpState::CloseWait;
                        let fin = socket.segment(socket.snd_nxt, TcpFlags::FIN | TcpFlags::ACK);
                        socket.snd_nxt = socket.snd_nxt.wrapping_add(1);
                        socket.state = TcpState::LastAck;
                        reply = Some(fin);
                    }
                    TcpState::FinWait1 => socket.state = TcpState::Closing,
                    TcpState::FinWait2 => {
                        socket.state = TcpState::TimeWait;
                        socket.time_wait_since = ctx.now_ms;
                    }
                    _ => {}
                }
            } else if socket.state == TcpState::TimeWait {
                // Retransmitted FIN: our ACK was lost.
                socket.time_wait_since = ctx.now_ms;
            }
        }

        if changed {
            socket.waiter.notify();
        }
        if reply.is_some() {
            return reply;
        }
        need_ack.then(|| socket.ack_segment())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PEER: Ipv4Addr = Ipv4Addr::new(10, 0, 2, 2);

    fn ctx(iss: u32) -> InputContext {
        InputContext {
            now_ms: 0,
            iss,
            lenient_handshake_ack: true,
        }
    }

    fn seg(flags: TcpFlags, seq: u32, ack: u32, payload: &[u8]) -> Segment<'_> {
        Segment {
            src: PEER,
            src_port: 40000,
            dst_port: 80,
            seq,
            ack,
            flags,
            window: 4096,
            payload,
        }
    }

    /// Listener on 80 plus one established child (peer ISN 1000, ours 5000).
    fn established(pool: &mut TcpSocketPool) -> (SocketHandle, SocketHandle) {
        let listener = pool.listen(80).unwrap();
        pool.input(&seg(TcpFlags::SYN, 1000, 0, &[]), ctx(5000)).unwrap();
        pool.input(&seg(TcpFlags::ACK, 1001, 5001, &[]), ctx(0));
        let conn = pool.accept(listener).unwrap();
        assert_eq!(pool.get(conn).unwrap().state, TcpState::Established);
        (listener, conn)
    }

    #[test]
    fn handshake_spawns_child_and_keeps_listener() {
        let mut pool = TcpSocketPool::new(4, 1024);
        let listener = pool.listen(80).unwrap();

        let synack = pool.input(&seg(TcpFlags::SYN, 1000, 0, &[]), ctx(5000)).unwrap();
        assert_eq!(synack.flags, TcpFlags::SYN | TcpFlags::ACK);
        assert_eq!(synack.seq, 5000);
        assert_eq!(synack.ack, 1001);
        assert_eq!(pool.active_count(), 2);
        assert_eq!(pool.get(listener).unwrap().state, TcpState::Listen);

        let child = pool.accept(listener).unwrap();
        assert_eq!(pool.get(child).unwrap().state, TcpState::SynRcvd);
        assert_eq!(pool.accept(listener), Err(NetError::WouldBlock));

        assert!(pool.input(&seg(TcpFlags::ACK, 1001, 5001, &[]), ctx(0)).is_none());
        assert_eq!(pool.get(child).unwrap().state, TcpState::Established);
        assert_eq!(pool.get(listener).unwrap().state, TcpState::Listen);
    }

    #[test]
    fn retransmitted_syn_gets_same_synack() {
        let mut pool = TcpSocketPool::new(4, 1024);
        pool.listen(80).unwrap();
        let first = pool.input(&seg(TcpFlags::SYN, 1000, 0, &[]), ctx(5000)).unwrap();
        let again = pool.input(&seg(TcpFlags::SYN, 1000, 0, &[]), ctx(9999)).unwrap();
        assert_eq!(first, again);
        assert_eq!(pool.active_count(), 2);
    }

    #[test]
    fn handshake_ack_leniency() {
        let mut pool = TcpSocketPool::new(4, 1024);
        let listener = pool.listen(80).unwrap();
        pool.input(&seg(TcpFlags::SYN, 1000, 0, &[]), ctx(5000));
        assert!(pool.input(&seg(TcpFlags::ACK, 1001, 5002, &[]), ctx(0)).is_none());
        let child = pool.accept(listener).unwrap();
        assert_eq!(pool.get(child).unwrap().state, TcpState::Established);

        let strict = InputContext {
            lenient_handshake_ack: false,
            ..ctx(7000)
        };
        let mut other = seg(TcpFlags::SYN, 3000, 0, &[]);
        other.src_port = 40001;
        pool.input(&other, strict);
        let mut ack = seg(TcpFlags::ACK, 3001, 7002, &[]);
        ack.src_port = 40001;
        let rst = pool.input(&ack, strict).unwrap();
        assert_eq!(rst.flags, TcpFlags::RST);
        assert_eq!(rst.seq, 7002);
    }

    #[test]
    fn unknown_port_gets_reset() {
        let mut pool = TcpSocketPool::new(2, 1024);
        let rst = pool.input(&seg(TcpFlags::SYN, 77, 0, &[]), ctx(1)).unwrap();
        assert_eq!(rst.flags, TcpFlags::RST | TcpFlags::ACK);
        assert_eq!(rst.seq, 0);
        assert_eq!(rst.ack, 78);
        assert!(pool.input(&seg(TcpFlags::RST, 77, 0, &[]), ctx(1)).is_none());
    }

    #[test]
    fn full_pool_refuses_syn() {
        let mut pool = TcpSocketPool::new(1, 1024);
        pool.listen(80).unwrap();
        let rst = pool.input(&seg(TcpFlags::SYN, 1, 0, &[]), ctx(1)).unwrap();
        assert!(rst.flags.contains(TcpFlags::RST));
        assert_eq!(pool.active_count(), 1);
    }

    #[test]
    fn data_is_buffered_and_acked_in_order_only() {
        let mut pool = TcpSocketPool::new(4, 8);
        let (_, conn) = established(&mut pool);

        let ack = pool.input(&seg(TcpFlags::ACK | TcpFlags::PSH, 1001, 5001, b"hello"), ctx(0)).unwrap();
        assert_eq!(ack.ack, 1006);

        // Out of order: duplicate ACK, nothing buffered.
        let dup = pool.input(&seg(TcpFlags::ACK, 1010, 5001, b"zz"), ctx(0)).unwrap();
        assert_eq!(dup.ack, 1006);

        // Does not fit in the remaining 3 bytes: dropped whole.
        let full = pool.input(&seg(TcpFlags::ACK, 1006, 5001, b"world"), ctx(0)).unwrap();
        assert_eq!(full.ack, 1006);

        let socket = pool.get_mut(conn).unwrap();
        let mut out = [0u8; 16];
        assert_eq!(socket.read(&mut out), 5);
        assert_eq!(&out[..5], b"hello");
    }

    #[test]
    fn passive_close_answers_fin_immediately() {
        let mut pool = TcpSocketPool::new(4, 64);
        let (_, conn) = established(&mut pool);

        let fin = pool.input(&seg(TcpFlags::FIN | TcpFlags::ACK, 1001, 5001, &[]), ctx(0)).unwrap();
        assert_eq!(fin.flags, TcpFlags::FIN | TcpFlags::ACK);
        assert_eq!(fin.seq, 5001);
        assert_eq!(fin.ack, 1002);
        let socket = pool.get(conn).unwrap();
        assert_eq!(socket.state, TcpState::LastAck);
        assert!(socket.peer_closed());

        assert!(pool.input(&seg(TcpFlags::ACK, 1002, 5002, &[]), ctx(0)).is_none());
        assert_eq!(pool.get(conn).unwrap().state, TcpState::Closed);
        assert_eq!(pool.close(conn, 0).unwrap(), None);
        assert_eq!(pool.get(conn).err().unwrap(), NetError::InvalidHandle);
    }

    #[test]
    fn active_close_through_time_wait() {
        let mut pool = TcpSocketPool::new(4, 64);
        let (_, conn) = established(&mut pool);

        let fin = pool.close(conn, 0).unwrap().unwrap();
        assert_eq!(fin.flags, TcpFlags::FIN | TcpFlags::ACK);
        assert_eq!(pool.get(conn).err().unwrap(), NetError::InvalidHandle);
        assert_eq!(pool.active_count(), 2);

        pool.input(&seg(TcpFlags::ACK, 1001, 5002, &[]), ctx(0));
        let ack = pool
            .input(
                &seg(TcpFlags::FIN | TcpFlags::ACK, 1001, 5002, &[]),
                InputContext { now_ms: 100, ..ctx(0) },
            )
            .unwrap();
        assert_eq!(ack.ack, 1002);
        assert_eq!(pool.expire_time_wait(1000, 2000), 0);
        assert_eq!(pool.expire_time_wait(2100, 2000), 1);
        assert_eq!(pool.active_count(), 1);
    }

    #[test]
    fn simultaneous_close_goes_through_closing() {
        let mut pool = TcpSocketPool::new(4, 64);
        let (listener, conn) = established(&mut pool);
        pool.close(conn, 0).unwrap();
        // Peer FIN crosses ours and does not ack it yet.
        pool.input(&seg(TcpFlags::FIN | TcpFlags::ACK, 1001, 5001, &[]), ctx(0)).unwrap();
        pool.input(&seg(TcpFlags::ACK, 1002, 5002, &[]), ctx(0));
        assert_eq!(pool.expire_time_wait(u64::MAX, 0), 1);
        assert_eq!(pool.active_count(), 1);
        assert_eq!(pool.get(listener).unwrap().state, TcpState::Listen);
    }

    #[test]
    fn reset_marks_accepted_connection_and_frees_unaccepted() {
        let mut pool = TcpSocketPool::new(4, 64);
        let (listener, conn) = established(&mut pool);
        pool.input(&seg(TcpFlags::ACK, 1001, 5001, b"abc"), ctx(0));
        assert!(pool.input(&seg(TcpFlags::RST, 1004, 0, &[]), ctx(0)).is_none());
        let socket = pool.get(conn).unwrap();
        assert_eq!(socket.state, TcpState::Closed);
        assert!(socket.was_reset());
        assert_eq!(socket.buffered(), 3);
        assert_eq!(pool.get(listener).unwrap().state, TcpState::Listen);

        let mut other = seg(TcpFlags::SYN, 50, 0, &[]);
        other.src_port = 40002;
        pool.input(&other, ctx(100));
        assert_eq!(pool.active_count(), 3);
        other.flags = TcpFlags::RST;
        other.seq = 51;
        pool.input(&other, ctx(0));
        assert_eq!(pool.active_count(), 2);
    }

    #[test]
    fn listener_close_rearms_and_release_frees_children() {
        let mut pool = TcpSocketPool::new(4, 64);
        let listener = pool.listen(80).unwrap();
        assert_eq!(pool.listen(80), Err(NetError::PortInUse(80)));
        pool.input(&seg(TcpFlags::SYN, 1000, 0, &[]), ctx(5000));

        assert_eq!(pool.close(listener, 0).unwrap(), None);
        assert_eq!(pool.get(listener).unwrap().state, TcpState::Listen);

        let resets = pool.release(listener).unwrap();
        assert_eq!(resets.len(), 1);
        assert_eq!(resets[0].remote_port, 40000);
        assert_eq!(pool.active_count(), 0);
        assert_eq!(pool.get(listener).err().unwrap(), NetError::InvalidHandle);
    }

    #[test]
    fn active_open_completes_on_synack() {
        let mut pool = TcpSocketPool::new(2, 64);
        let (conn, syn) = pool.open(PEER, 80, 300).unwrap();
        assert_eq!(syn.flags, TcpFlags::SYN);
        assert_eq!(syn.seq, 300);
        assert_eq!(syn.local_port, EPHEMERAL_PORT_START);
        assert_eq!(pool.syn_for(conn).unwrap(), syn);

        let synack = Segment {
            src: PEER,
            src_port: 80,
            dst_port: syn.local_port,
            seq: 9000,
            ack: 301,
            flags: TcpFlags::SYN | TcpFlags::ACK,
            window: 1000,
            payload: &[],
        };
        let ack = pool.input(&synack, ctx(0)).unwrap();
        assert_eq!(ack.flags, TcpFlags::ACK);
        assert_eq!(ack.seq, 301);
        assert_eq!(ack.ack, 9001);
        assert_eq!(pool.get(conn).unwrap().state, TcpState::Established);
    }

    #[test]
    fn closed_connections_to_a_silent_peer_are_reclaimed() {
        let mut pool = TcpSocketPool::new(4, 64);
        let listener = pool.listen(80).unwrap();
        for (i, port) in (40000..40003).enumerate() {
            let mut syn = seg(TcpFlags::SYN, 1000, 0, &[]);
            syn.src_port = port;
            pool.input(&syn, ctx(5000));
            let mut ack = seg(TcpFlags::ACK, 1001, 5001, &[]);
            ack.src_port = port;
            pool.input(&ack, ctx(0));
            let conn = pool.accept(listener).unwrap();
            assert!(pool.close(conn, 100 * i as u64).unwrap().is_some());
        }
        assert_eq!(pool.active_count(), 4);

        // Nothing in TIME_WAIT, so lingering alone frees nothing.
        assert_eq!(pool.expire_time_wait(u64::MAX, 2000), 0);
        assert_eq!(pool.expire_orphans(10_100, 10_000), 2);
        assert_eq!(pool.expire_orphans(10_200, 10_000), 1);
        assert_eq!(pool.active_count(), 1);
        assert_eq!(pool.get(listener).unwrap().state, TcpState::Listen);

        let mut syn = seg(TcpFlags::SYN, 1, 0, &[]);
        syn.src_port = 40009;
        let synack = pool.input(&syn, ctx(7000)).unwrap();
        assert_eq!(synack.flags, TcpFlags::SYN | TcpFlags::ACK);
    }

    #[test]
    fn orphan_timeout_spares_open_and_time_wait_blocks() {
        let mut pool = TcpSocketPool::new(4, 64);
        let (_, conn) = established(&mut pool);
        assert_eq!(pool.expire_orphans(u64::MAX, 0), 0);
        assert_eq!(pool.get(conn).unwrap().state, TcpState::Established);

        pool.close(conn, 0).unwrap();
        pool.input(&seg(TcpFlags::ACK, 1001, 5002, &[]), ctx(0));
        pool.input(&seg(TcpFlags::FIN | TcpFlags::ACK, 1001, 5002, &[]), ctx(0));
        assert_eq!(pool.expire_orphans(u64::MAX, 0), 0);
        assert_eq!(pool.expire_time_wait(u64::MAX, 0), 1);
    }

    #[test]
    fn sequence_comparisons_wrap() {
        assert!(seq_lt(u32::MAX, 0));
        assert!(seq_gt(1, u32::MAX));
        assert!(seq_le(5, 5));
    }
}
