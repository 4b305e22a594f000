use std::time::Duration;

use crate::timer::RetryPolicy;

pub const ARP_CACHE_SIZE: usize = 16;
pub const ROUTE_TABLE_SIZE: usize = 8;
pub const TCP_MAX_SOCKETS: usize = 16;
pub const TCP_RX_BUFFER_SIZE: usize = 8192;
pub const TCP_DEFAULT_MSS: u16 = 1460;
pub const UDP_MAX_SOCKETS: usize = 8;
pub const UDP_QUEUE_DEPTH: usize = 16;
pub const RX_QUEUE_DEPTH: usize = 64;
pub const MAX_INTERFACES: usize = 4;
pub const DEFAULT_TTL: u8 = 64;

/// Ping loop budget: an echo is (re)sent every `PING_ARP_RETRY_EVERY` polls
/// while the next hop is unresolved, and the whole wait gives up after
/// `PING_MAX_POLLS` polls.
pub const PING_ARP_RETRY_EVERY: u32 = 10;
pub const PING_MAX_POLLS: u32 = 60;
pub const PING_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Tunables for one [`crate::NetStack`].
#[derive(Debug, Clone)]
pub struct NetConfig {
    pub arp_cache_size: usize,
    pub route_capacity: usize,
    pub tcp_sockets: usize,
    pub tcp_rx_buffer: usize,
    pub tcp_mss: u16,
    /// How long a connection lingers in TIME_WAIT before its block is freed.
    pub tcp_time_wait: Duration,
    /// How long a closed connection may wait for the peer's FIN or ACK
    /// before its block is reclaimed anyway.
    pub tcp_orphan_timeout: Duration,
    /// Accept a handshake ACK that is off by one from ISN+1.
    pub tcp_lenient_handshake_ack: bool,
    pub udp_sockets: usize,
    pub udp_queue_depth: usize,
    pub rx_queue_depth: usize,
    pub ttl: u8,
    /// Drop inbound IPv4 datagrams whose header checksum does not verify.
    pub verify_ipv4_checksum: bool,
    pub arp_retry: RetryPolicy,
    pub ping_retry: RetryPolicy,
    pub dhcp_retry: RetryPolicy,
    pub dns_retry: RetryPolicy,
    /// SYN retransmission for `tcp_connect`.
    pub tcp_connect_retry: RetryPolicy,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            arp_cache_size: ARP_CACHE_SIZE,
            route_capacity: ROUTE_TABLE_SIZE,
            tcp_sockets: TCP_MAX_SOCKETS,
            tcp_rx_buffer: TCP_RX_BUFFER_SIZE,
            tcp_mss: TCP_DEFAULT_MSS,
            tcp_time_wait: Duration::from_secs(2),
            tcp_orphan_timeout: Duration::from_secs(10),
            tcp_lenient_handshake_ack: true,
            udp_sockets: UDP_MAX_SOCKETS,
            udp_queue_depth: UDP_QUEUE_DEPTH,
            rx_queue_depth: RX_QUEUE_DEPTH,
            ttl: DEFAULT_TTL,
            verify_ipv4_checksum: true,
            arp_retry: RetryPolicy::new(3, Duration::from_millis(500), Duration::from_secs(2)),
            ping_retry: RetryPolicy::new(
                PING_MAX_POLLS / PING_ARP_RETRY_EVERY,
                PING_POLL_INTERVAL * PING_ARP_RETRY_EVERY,
                PING_POLL_INTERVAL * PING_MAX_POLLS,
            )
            .with_poll_interval(PING_POLL_INTERVAL),
            dhcp_retry: RetryPolicy::new(4, Duration::from_secs(2), Duration::from_secs(10))
                .with_poll_interval(Duration::from_millis(20)),
            dns_retry: RetryPolicy::new(3, Duration::from_secs(1), Duration::from_secs(3))
                .with_poll_interval(Duration::from_millis(20)),
            tcp_connect_retry: RetryPolicy::new(3, Duration::from_secs(1), Duration::from_secs(5))
                .with_poll_interval(Duration::from_millis(20)),
        }
    }
}
