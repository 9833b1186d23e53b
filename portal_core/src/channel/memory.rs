//! In-memory loopback channel: two connected halves backed by mpsc
//! queues. Used by the tests and by any in-process wiring that wants a
//! real ordered channel without a network.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytes::Bytes;
use tokio::sync::mpsc;

use super::{ChannelPair, DataChannel, FrameSource, RawFrame};
use crate::error::PortalError;

/// Send half of one direction. Dropping it ends the peer's frame stream;
/// [`MemoryLink::close`] additionally fails all further sends on both
/// sides through the shared open flag.
#[derive(Debug)]
pub struct MemoryLink {
    tx: Option<mpsc::UnboundedSender<RawFrame>>,
    open: Arc<AtomicBool>,
    queued: Arc<AtomicU64>,
}

/// Receive half of one direction.
#[derive(Debug)]
pub struct MemoryFrames {
    rx: mpsc::UnboundedReceiver<RawFrame>,
    queued: Arc<AtomicU64>,
}

/// Build a connected channel: frames sent on one pair's link arrive on
/// the other pair's frame source, in order.
pub fn pair() -> (
    ChannelPair<MemoryLink, MemoryFrames>,
    ChannelPair<MemoryLink, MemoryFrames>,
) {
    let open = Arc::new(AtomicBool::new(true));
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();
    let a_to_b = Arc::new(AtomicU64::new(0));
    let b_to_a = Arc::new(AtomicU64::new(0));

    let a = ChannelPair {
        link: MemoryLink {
            tx: Some(a_tx),
            open: open.clone(),
            queued: a_to_b.clone(),
        },
        frames: MemoryFrames {
            rx: a_rx,
            queued: b_to_a.clone(),
        },
    };
    let b = ChannelPair {
        link: MemoryLink {
            tx: Some(b_tx),
            open,
            queued: b_to_a,
        },
        frames: MemoryFrames {
            rx: b_rx,
            queued: a_to_b,
        },
    };
    (a, b)
}

impl MemoryLink {
    /// Close the channel for both sides. Already queued frames still
    /// drain; new sends fail with `ChannelNotReady`.
    pub fn close(&mut self) {
        self.open.store(false, Ordering::SeqCst);
        self.tx = None;
    }

    fn push(&mut self, frame: RawFrame) -> Result<(), PortalError> {
        if !self.is_open() {
            return Err(PortalError::ChannelNotReady);
        }
        let len = frame.len();
        match self.tx.as_ref() {
            Some(tx) if tx.send(frame).is_ok() => {
                self.queued.fetch_add(len, Ordering::SeqCst);
                Ok(())
            }
            _ => Err(PortalError::ChannelNotReady),
        }
    }
}

impl DataChannel for MemoryLink {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
            && self.tx.as_ref().is_some_and(|tx| !tx.is_closed())
    }

    fn send_text(&mut self, text: String) -> Result<(), PortalError> {
        self.push(RawFrame::Text(text))
    }

    fn send_binary(&mut self, bytes: Bytes) -> Result<(), PortalError> {
        self.push(RawFrame::Binary(bytes))
    }

    fn buffered_bytes(&self) -> u64 {
        self.queued.load(Ordering::SeqCst)
    }
}

impl FrameSource for MemoryFrames {
    async fn next(&mut self) -> Option<RawFrame> {
        let frame = self.rx.recv().await?;
        self.queued.fetch_sub(frame.len(), Ordering::SeqCst);
        Some(frame)
    }
}
