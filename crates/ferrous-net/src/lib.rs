//! TCP/IP stack for Ferrous OS.
//!
//! A [`NetStack`] owns interfaces, the ARP cache, the routing table, the
//! UDP and TCP socket tables and the DHCP, DNS and ping contexts. Drivers
//! implement [`NetDevice`] for transmit and push received frames either
//! straight into [`NetStack::receive_frame`] or through a [`FrameSender`].

pub mod arp;
pub mod checksum;
pub mod config;
pub mod device;
pub mod dhcp;
pub mod dns;
pub mod error;
pub mod ethernet;
pub mod icmp;
pub mod ingress;
pub mod interface;
pub mod ipv4;
pub mod route;
pub mod stack;
pub mod sync;
pub mod tcp;
pub mod timer;
pub mod types;
pub mod udp;

pub use config::NetConfig;
pub use device::{DeviceError, NetDevice};
pub use dhcp::{DhcpLease, DhcpState};
pub use dns::DnsError;
pub use error::{NetError, ParseError};
pub use icmp::PingStats;
pub use ingress::FrameSender;
pub use interface::{InterfaceFlags, InterfaceStats, NetInterface};
pub use route::{RouteEntry, RouteTable};
pub use stack::NetStack;
pub use sync::WaitQueue;
pub use tcp::TcpState;
pub use timer::{Clock, ManualClock, RetryPolicy, SystemClock};
pub use types::{IfaceId, MacAddr, RouteId, SocketHandle, UdpHandle};
pub use udp::UdpDatagram;
