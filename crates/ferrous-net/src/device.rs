//! Driver boundary.
//!
//! A NIC driver owns DMA, IRQ acknowledgement and bus setup. The stack only
//! needs a way to hand it a finished Ethernet frame.

use thiserror::Error;

/// Largest frame the stack builds: 1500-byte MTU plus the Ethernet header.
pub const MAX_FRAME_LEN: usize = 1514;
/// Ethernet minimum frame length (without FCS).
pub const MIN_FRAME_LEN: usize = 60;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("transmit queue full")]
    Busy,

    #[error("frame of {0} bytes exceeds device buffer")]
    FrameTooLarge(usize),

    #[error("link down")]
    LinkDown,

    #[error("i/o error: {0}")]
    Io(String),
}

/// Transmit capability of a network adapter.
pub trait NetDevice: Send {
    /// Device name (for debugging)
    fn name(&self) -> &str;

    /// Queue `frame` for transmission. Returns the number of bytes sent.
    fn transmit(&mut self, frame: &[u8]) -> Result<usize, DeviceError>;
}

impl<T: NetDevice + ?Sized> NetDevice for Box<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn transmit(&mut self, frame: &[u8]) -> Result<usize, DeviceError> {
        (**self).transmit(frame)
    }
}
