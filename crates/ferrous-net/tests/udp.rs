mod common;

use std::net::{Ipv4Addr, SocketAddrV4};

use common::*;
use ferrous_net::types::IpProtocol;
use ferrous_net::{MacAddr, NetError, NetInterface, RouteEntry};

#[test]
fn datagrams_reach_the_bound_socket() {
    let mut h = configured(Peer::silent());
    let sock = h.stack.udp_bind(5000).unwrap();
    let waiter = h.stack.udp_waiter();
    let before = waiter.generation();

    let from = SocketAddrV4::new(PEER_IP, 6000);
    h.stack.receive_frame(
        h.eth0,
        &udp_frame(from, SocketAddrV4::new(LOCAL_IP, 5000), LOCAL_MAC, b"one"),
    );
    h.stack.receive_frame(
        h.eth0,
        &udp_frame(from, SocketAddrV4::new(LOCAL_IP, 5001), LOCAL_MAC, b"lost"),
    );
    assert!(waiter.generation() > before);

    let datagram = h.stack.udp_recv_from(sock).unwrap();
    assert_eq!(datagram.src, from);
    assert_eq!(datagram.payload, b"one");
    assert_eq!(h.stack.udp_recv_from(sock), Err(NetError::WouldBlock));
}

#[test]
fn send_to_goes_out_with_bound_port() {
    let mut h = configured(Peer::silent());
    h.stack.arp_cache_add(PEER_IP, PEER_MAC);
    let sock = h.stack.udp_bind(0).unwrap();
    let port = h.stack.udp_local_port(sock).unwrap();
    assert!(port >= 49152);

    h.stack
        .udp_send_to(sock, SocketAddrV4::new(PEER_IP, 9), b"hi")
        .unwrap();
    let sent = h.peer.take_sent();
    let out = udp_of(&sent[0]).unwrap();
    assert_eq!(out.ip.dst(), PEER_IP);
    assert_eq!(out.src_port, port);
    assert_eq!(out.dst_port, 9);
    assert_eq!(out.payload, b"hi");
}

#[test]
fn bind_conflicts_and_stale_handles() {
    let mut h = configured(Peer::silent());
    let sock = h.stack.udp_bind(5000).unwrap();
    assert_eq!(h.stack.udp_bind(5000), Err(NetError::PortInUse(5000)));

    h.stack.udp_close(sock).unwrap();
    assert_eq!(h.stack.udp_recv_from(sock), Err(NetError::InvalidHandle));
    let again = h.stack.udp_bind(5000).unwrap();
    assert_ne!(again, sock);
}

#[test]
fn unresolved_next_hop_drops_and_asks() {
    let mut h = configured(Peer::silent());
    let dst = Ipv4Addr::new(198, 51, 100, 1);
    assert_eq!(
        h.stack.udp_send_packet(4000, dst, 9, b"x"),
        Err(NetError::ArpPending(PEER_IP))
    );
    let sent = h.peer.take_sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(arp_request_target(&sent[0]), Some(PEER_IP));
}

#[test]
fn longest_prefix_picks_the_egress_interface() {
    let mut h = configured(Peer::silent());
    let lab = Peer::silent();
    let eth1 = h
        .stack
        .add_interface(NetInterface::new(
            "eth1",
            MacAddr::new([0x52, 0x54, 0x00, 0, 0, 1]),
            lab.device(),
        ))
        .unwrap();
    let lab_ip = Ipv4Addr::new(192, 168, 1, 10);
    let lab_router = Ipv4Addr::new(192, 168, 1, 1);
    h.stack
        .configure_interface(eth1, lab_ip, NETMASK, Ipv4Addr::UNSPECIFIED)
        .unwrap();
    let host = Ipv4Addr::new(8, 8, 8, 8);
    h.stack
        .routes_mut()
        .add(RouteEntry::new(host, Ipv4Addr::BROADCAST, lab_router, eth1))
        .unwrap();

    assert_eq!(h.stack.get_next_hop(host), Some((eth1, lab_router)));
    assert_eq!(
        h.stack.get_next_hop(Ipv4Addr::new(8, 8, 4, 4)),
        Some((h.eth0, PEER_IP))
    );
    let neighbour = Ipv4Addr::new(192, 168, 1, 7);
    assert_eq!(h.stack.get_next_hop(neighbour), Some((eth1, neighbour)));

    // Traffic for the host route leaves on eth1 with eth1's address.
    lab.take_sent();
    h.stack
        .arp_cache_add(lab_router, MacAddr::new([2, 0, 0, 0, 0, 1]));
    h.stack.udp_send_packet(4000, host, 53, b"q").unwrap();
    assert!(h.peer.take_sent().is_empty());
    let sent = lab.take_sent();
    let (ip, _) = ipv4_of(&sent[0]).unwrap();
    assert_eq!(ip.src(), lab_ip);
    assert_eq!(ip.dst(), host);
    assert_eq!(ip.protocol, IpProtocol::Udp as u8);
}

#[test]
fn directed_broadcast_skips_arp() {
    let mut h = configured(Peer::silent());
    let bcast = Ipv4Addr::new(10, 0, 2, 255);
    h.stack.udp_send_packet(4000, bcast, 9, b"all").unwrap();
    let sent = h.peer.take_sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(&sent[0][..6], &[0xff; 6]);
}
