//! Ethernet II framing and receive demultiplexing.

use log::{debug, trace};
use zerocopy::byteorder::network_endian::U16;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::device::{MAX_FRAME_LEN, MIN_FRAME_LEN};
use crate::error::{NetError, ParseError};
use crate::stack::NetStack;
use crate::types::{IfaceId, MacAddr};

pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_ARP: u16 = 0x0806;
pub const ETHERTYPE_IPV6: u16 = 0x86DD;
pub const ETH_HEADER_LEN: usize = 14;
pub const ETH_MTU: usize = MAX_FRAME_LEN - ETH_HEADER_LEN;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromZeroes, FromBytes, AsBytes)]
pub struct EthernetHeader {
    pub dst: MacAddr,
    pub src: MacAddr,
    pub ethertype: U16,
}

impl EthernetHeader {
    pub fn new(dst: MacAddr, src: MacAddr, ethertype: u16) -> Self {
        Self {
            dst,
            src,
            ethertype: U16::new(ethertype),
        }
    }

    pub fn parse(frame: &[u8]) -> Result<(Self, &[u8]), ParseError> {
        let header = Self::read_from_prefix(frame).ok_or(ParseError::Truncated {
            layer: "ethernet",
            len: frame.len(),
        })?;
        Ok((header, &frame[ETH_HEADER_LEN..]))
    }
}

/// Write header + payload into `buf`, zero-padding to the 60-byte minimum.
/// Returns the frame length.
pub fn build_frame(
    buf: &mut [u8],
    dst: MacAddr,
    src: MacAddr,
    ethertype: u16,
    payload: &[u8],
) -> Result<usize, NetError> {
    let len = ETH_HEADER_LEN + payload.len();
    if payload.len() > ETH_MTU || len > buf.len() {
        return Err(NetError::PacketTooLarge(payload.len()));
    }
    let frame_len = len.max(MIN_FRAME_LEN);
    if frame_len > buf.len() {
        return Err(NetError::PacketTooLarge(payload.len()));
    }

    EthernetHeader::new(dst, src, ethertype)
        .write_to_prefix(buf)
        .ok_or(NetError::PacketTooLarge(payload.len()))?;
    buf[ETH_HEADER_LEN..len].copy_from_slice(payload);
    buf[len..frame_len].fill(0);
    Ok(frame_len)
}

impl NetStack {
    /// Entry point for received frames.
    ///
    /// Drivers that cannot run protocol code in their receive path should
    /// queue frames through [`crate::FrameSender`] instead.
    pub fn receive_frame(&mut self, iface: IfaceId, frame: &[u8]) {
        let Some(nic) = self.interfaces.get_mut(iface.index()) else {
            debug!("ethernet: frame for unknown interface {}", iface);
            return;
        };
        nic.count_rx(frame.len());

        let (header, payload) = match EthernetHeader::parse(frame) {
            Ok(parsed) => parsed,
            Err(e) => {
                nic.stats.rx_errors += 1;
                debug!("{}: dropping frame: {}", nic.name, e);
                return;
            }
        };

        match header.ethertype.get() {
            ETHERTYPE_ARP => self.arp_handle_packet(iface, payload),
            ETHERTYPE_IPV4 => self.ipv4_handle_packet(iface, payload),
            ETHERTYPE_IPV6 => {
                trace!("{}: no IPv6, dropping {} bytes", nic.name, payload.len());
                nic.stats.rx_dropped += 1;
            }
            other => {
                trace!("{}: ignoring ethertype {:#06x}", nic.name, other);
                nic.stats.rx_dropped += 1;
            }
        }
    }

    pub(crate) fn ethernet_send(
        &mut self,
        iface: IfaceId,
        dst: MacAddr,
        ethertype: u16,
        payload: &[u8],
    ) -> Result<usize, NetError> {
        let nic = self
            .interfaces
            .get_mut(iface.index())
            .ok_or(NetError::UnknownInterface)?;
        let mut frame = [0u8; MAX_FRAME_LEN];
        let len = build_frame(&mut frame, dst, nic.mac, ethertype, payload)?;
        trace!(
            "{}: tx {} bytes to {} type {:#06x}",
            nic.name,
            len,
            dst,
            ethertype
        );
        Ok(nic.transmit(&frame[..len])?)
    }
}
