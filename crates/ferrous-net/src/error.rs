use std::net::Ipv4Addr;

use thiserror::Error;

use crate::device::DeviceError;
use crate::dns::DnsError;

/// Errors returned to callers of the stack.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NetError {
    #[error("no route to host {0}")]
    NoRoute(Ipv4Addr),

    #[error("hardware address of {0} not resolved yet")]
    ArpPending(Ipv4Addr),

    #[error("device error: {0}")]
    Device(#[from] DeviceError),

    #[error("interface {0} is down")]
    InterfaceDown(String),

    #[error("no such interface")]
    UnknownInterface,

    #[error("interface has no IPv4 address")]
    NoAddress,

    #[error("packet too large: {0} bytes")]
    PacketTooLarge(usize),

    #[error("socket pool exhausted")]
    PoolExhausted,

    #[error("table full")]
    TableFull,

    #[error("invalid or stale handle")]
    InvalidHandle,

    #[error("port {0} already in use")]
    PortInUse(u16),

    #[error("socket not connected")]
    NotConnected,

    #[error("operation would block")]
    WouldBlock,

    #[error("connection reset by peer")]
    ConnectionReset,

    #[error("connection refused")]
    ConnectionRefused,

    #[error("operation timed out")]
    TimedOut,

    #[error("invalid hostname: {0}")]
    InvalidHostname(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("dns: {0}")]
    Dns(#[from] DnsError),

    #[error("no DNS server configured")]
    NoDnsServer,

    #[error("receive queue full")]
    QueueFull,
}

/// Reasons an inbound packet is dropped.
///
/// These never reach a caller: packets arrive asynchronously, so the stack
/// logs the error and drops the packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("{layer}: truncated ({len} bytes)")]
    Truncated { layer: &'static str, len: usize },

    #[error("ipv4: bad version {0}")]
    BadVersion(u8),

    #[error("{layer}: bad header length {len}")]
    BadHeaderLength { layer: &'static str, len: usize },

    #[error("{layer}: bad length field {len}")]
    BadLength { layer: &'static str, len: usize },

    #[error("{0}: checksum mismatch")]
    BadChecksum(&'static str),

    #[error("arp: unsupported hardware/protocol {hw:#06x}/{proto:#06x}")]
    UnsupportedHardware { hw: u16, proto: u16 },

    #[error("dhcp: bad magic cookie")]
    BadMagic,

    #[error("{layer}: transaction id mismatch")]
    XidMismatch { layer: &'static str },

    #[error("tcp: bad data offset {0}")]
    BadDataOffset(usize),

    #[error("dns: malformed name at offset {0}")]
    BadName(usize),

    #[error("{layer}: unexpected value {value}")]
    Unexpected { layer: &'static str, value: u32 },
}
