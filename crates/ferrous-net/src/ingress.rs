//! Receive path hand-off between drivers and the stack.
//!
//! A driver's receive interrupt only copies the frame into a bounded queue
//! and returns. All protocol processing happens when the stack's owner calls
//! [`crate::NetStack::poll`], so no protocol state is ever touched from two
//! contexts at once.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::Arc;

use log::trace;

use crate::device::MAX_FRAME_LEN;
use crate::error::NetError;
use crate::types::IfaceId;

pub struct RxFrame {
    pub iface: IfaceId,
    pub data: Vec<u8>,
}

/// Driver-side handle. Cheap to clone; never blocks.
#[derive(Clone)]
pub struct FrameSender {
    tx: SyncSender<RxFrame>,
    dropped: Arc<AtomicU64>,
}

impl FrameSender {
    /// Queue a received frame. A full queue drops the frame.
    pub fn deliver(&self, iface: IfaceId, frame: &[u8]) -> Result<(), NetError> {
        if frame.len() > MAX_FRAME_LEN + 4 {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return Err(NetError::PacketTooLarge(frame.len()));
        }
        let rx = RxFrame {
            iface,
            data: frame.to_vec(),
        };
        match self.tx.try_send(rx) {
            Ok(()) => {
                trace!("ingress: queued {} bytes on if{}", frame.len(), iface);
                Ok(())
            }
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                Err(NetError::QueueFull)
            }
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Stack-side end of the queue.
pub struct FrameQueue {
    rx: Receiver<RxFrame>,
    sender: FrameSender,
}

impl FrameQueue {
    pub fn new(depth: usize) -> Self {
        let (tx, rx) = sync_channel(depth.max(1));
        Self {
            rx,
            sender: FrameSender {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
        }
    }

    pub fn sender(&self) -> FrameSender {
        self.sender.clone()
    }

    pub fn try_pop(&self) -> Option<RxFrame> {
        self.rx.try_recv().ok()
    }
}
