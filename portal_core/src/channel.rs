//! Thin abstraction over one ordered, reliable peer-to-peer channel.
//!
//! The channel carries two kinds of frames interleaved on the same
//! stream: textual control messages and raw binary fragments. The
//! transport classifies inbound frames so the layers above never care
//! which is which on the wire.

use std::future::Future;

use bytes::Bytes;

use crate::error::PortalError;
use crate::transfer::protocol::ControlMsg;

pub mod memory;

/// Raw frame off the channel, before classification.
#[derive(Debug, Clone)]
pub enum RawFrame {
    Text(String),
    Binary(Bytes),
}

impl RawFrame {
    fn len(&self) -> u64 {
        match self {
            RawFrame::Text(text) => text.len() as u64,
            RawFrame::Binary(bytes) => bytes.len() as u64,
        }
    }
}

/// A classified inbound frame.
#[derive(Debug)]
pub enum Frame {
    Control(ControlMsg),
    Binary(Bytes),
}

/// Send half of the channel. The underlying transport guarantees FIFO,
/// exactly-once delivery per frame; the transfer protocol depends on it.
pub trait DataChannel: Send + Sync + 'static {
    fn is_open(&self) -> bool;

    fn send_text(&mut self, text: String) -> Result<(), PortalError>;

    fn send_binary(&mut self, bytes: Bytes) -> Result<(), PortalError>;

    /// Bytes accepted for sending but not yet handed to the network.
    /// Drives the sender's flow control.
    fn buffered_bytes(&self) -> u64;
}

/// Ordered inbound frame stream. `None` means the channel closed.
pub trait FrameSource: Send + Sync + 'static {
    fn next(&mut self) -> impl Future<Output = Option<RawFrame>> + Send;
}

/// The two halves of one established data channel.
#[derive(Debug)]
pub struct ChannelPair<L, S> {
    pub link: L,
    pub frames: S,
}

/// Classifying wrapper used by the transfer engine: control frames are
/// parsed JSON, everything else is binary payload.
pub struct ChannelTransport<L: DataChannel, S: FrameSource> {
    link: L,
    frames: S,
}

impl<L: DataChannel, S: FrameSource> ChannelTransport<L, S> {
    pub fn new(pair: ChannelPair<L, S>) -> Self {
        Self {
            link: pair.link,
            frames: pair.frames,
        }
    }

    pub fn is_open(&self) -> bool {
        self.link.is_open()
    }

    pub fn buffered_bytes(&self) -> u64 {
        self.link.buffered_bytes()
    }

    pub fn send_control(&mut self, msg: &ControlMsg) -> Result<(), PortalError> {
        if !self.link.is_open() {
            return Err(PortalError::ChannelNotReady);
        }
        let json = serde_json::to_string(msg)
            .map_err(|e| PortalError::TransferAborted(format!("encode control frame: {e}")))?;
        self.link.send_text(json)
    }

    pub fn send_binary(&mut self, bytes: Bytes) -> Result<(), PortalError> {
        if !self.link.is_open() {
            return Err(PortalError::ChannelNotReady);
        }
        self.link.send_binary(bytes)
    }

    /// Next classified frame, in arrival order. Malformed control frames
    /// are logged and skipped rather than crashing the session.
    pub async fn next_frame(&mut self) -> Option<Frame> {
        loop {
            match self.frames.next().await? {
                RawFrame::Text(text) => match serde_json::from_str::<ControlMsg>(&text) {
                    Ok(msg) => return Some(Frame::Control(msg)),
                    Err(e) => tracing::warn!("ignoring malformed control frame: {e}"),
                },
                RawFrame::Binary(bytes) => return Some(Frame::Binary(bytes)),
            }
        }
    }
}
