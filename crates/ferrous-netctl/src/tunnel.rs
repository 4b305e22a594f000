//! Ethernet over UDP: each datagram on the host socket carries one raw frame.
//!
//! Pairs with anything that speaks the same framing, e.g. a QEMU
//! `-netdev socket,udp=...` backend.

use std::io;
use std::net::UdpSocket;
use std::thread::{self, JoinHandle};

use ferrous_net::device::MAX_FRAME_LEN;
use ferrous_net::{DeviceError, FrameSender, IfaceId, NetDevice};
use log::{debug, warn};

const RX_BUFFER_SIZE: usize = 2048;

pub struct TunnelDevice {
    socket: UdpSocket,
}

impl TunnelDevice {
    /// Bind `bind_addr` and send every frame to `remote_addr`.
    pub fn open(bind_addr: &str, remote_addr: &str) -> io::Result<Self> {
        let socket = UdpSocket::bind(bind_addr)?;
        socket.connect(remote_addr)?;
        debug!("tunnel: {} <-> {}", socket.local_addr()?, remote_addr);
        Ok(Self { socket })
    }

    /// Second handle on the socket for the receive thread.
    pub fn receiver(&self) -> io::Result<TunnelReceiver> {
        Ok(TunnelReceiver {
            socket: self.socket.try_clone()?,
        })
    }
}

pub struct TunnelReceiver {
    socket: UdpSocket,
}

impl TunnelReceiver {
    /// Frames arriving on the socket are queued on `iface` until the stack
    /// polls.
    pub fn spawn(self, sender: FrameSender, iface: IfaceId) -> io::Result<JoinHandle<()>> {
        let socket = self.socket;
        thread::Builder::new()
            .name("tunnel-rx".into())
            .spawn(move || {
                let mut buf = [0u8; RX_BUFFER_SIZE];
                loop {
                    match socket.recv(&mut buf) {
                        Ok(len) => {
                            if let Err(e) = sender.deliver(iface, &buf[..len]) {
                                debug!("tunnel: dropped {} byte frame: {}", len, e);
                            }
                        }
                        // Nobody listening on the far end yet.
                        Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {}
                        Err(e) => {
                            warn!("tunnel: receive failed: {}", e);
                            return;
                        }
                    }
                }
            })
    }
}

impl NetDevice for TunnelDevice {
    fn name(&self) -> &str {
        "udp-tunnel"
    }

    fn transmit(&mut self, frame: &[u8]) -> Result<usize, DeviceError> {
        if frame.len() > MAX_FRAME_LEN {
            return Err(DeviceError::FrameTooLarge(frame.len()));
        }
        self.socket
            .send(frame)
            .map_err(|e| DeviceError::Io(e.to_string()))
    }
}
