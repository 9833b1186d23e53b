//! Signaling client: a persistent websocket to the rendezvous relay over
//! which room management and negotiation envelopes travel as JSON.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use crate::error::PortalError;

/// Alphabet for generated room codes.
const CODE_CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Fixed room code length.
pub const CODE_LEN: usize = 6;

/// 6-character uppercase alphanumeric rendezvous code. Immutable once a
/// session starts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomCode(String);

impl RoomCode {
    pub fn generate() -> Self {
        let mut rng = rand::rng();
        let code = (0..CODE_LEN)
            .map(|_| CODE_CHARS[rng.random_range(0..CODE_CHARS.len())] as char)
            .collect();
        Self(code)
    }

    /// Normalize to uppercase and validate. Rejects any input whose
    /// length is not exactly [`CODE_LEN`] without touching the network.
    pub fn parse(input: &str) -> Result<Self, PortalError> {
        let normalized = input.trim().to_ascii_uppercase();
        if normalized.len() != CODE_LEN || !normalized.bytes().all(|b| b.is_ascii_alphanumeric()) {
            return Err(PortalError::InvalidRoomCode(input.to_string()));
        }
        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One signaling envelope. Stateless and one-shot; SDP blobs and transport
/// candidates travel as opaque JSON payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum SignalMsg {
    CreateRoom {
        room_code: RoomCode,
    },
    JoinRoom {
        room_code: RoomCode,
    },
    RoomCreated {
        room_code: RoomCode,
    },
    RoomJoined {
        room_code: RoomCode,
    },
    PeerJoined {
        room_code: RoomCode,
    },
    Offer {
        room_code: RoomCode,
        payload: serde_json::Value,
    },
    Answer {
        room_code: RoomCode,
        payload: serde_json::Value,
    },
    IceCandidate {
        room_code: RoomCode,
        payload: serde_json::Value,
    },
    PeerDisconnected {
        room_code: RoomCode,
    },
    Error {
        message: String,
    },
}

impl SignalMsg {
    /// Room this envelope belongs to, if any.
    pub fn room_code(&self) -> Option<&RoomCode> {
        match self {
            SignalMsg::CreateRoom { room_code }
            | SignalMsg::JoinRoom { room_code }
            | SignalMsg::RoomCreated { room_code }
            | SignalMsg::RoomJoined { room_code }
            | SignalMsg::PeerJoined { room_code }
            | SignalMsg::Offer { room_code, .. }
            | SignalMsg::Answer { room_code, .. }
            | SignalMsg::IceCandidate { room_code, .. }
            | SignalMsg::PeerDisconnected { room_code } => Some(room_code),
            SignalMsg::Error { .. } => None,
        }
    }
}

/// Delivered on the single dispatch channel, in arrival order.
#[derive(Debug)]
pub enum SignalEvent {
    Message(SignalMsg),
    /// The relay connection ended; the session must be recreated.
    Closed,
}

/// Client side of the relay connection. Dropping the client closes the
/// outbound half; the dispatch channel then reports `Closed`.
pub struct SignalingClient {
    out_tx: mpsc::UnboundedSender<SignalMsg>,
    open: Arc<AtomicBool>,
}

impl SignalingClient {
    /// Dial the relay. Resolves once the websocket is ready to send;
    /// every inbound envelope is delivered exactly once on the returned
    /// receiver, in arrival order.
    pub async fn connect(
        relay_addr: &str,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SignalEvent>), PortalError> {
        let url = url::Url::parse(relay_addr).map_err(|e| {
            PortalError::SignalingUnavailable(format!("bad relay address {relay_addr:?}: {e}"))
        })?;

        let (ws, _) = connect_async(url.as_str())
            .await
            .map_err(|e| PortalError::SignalingUnavailable(e.to_string()))?;
        tracing::info!(relay = relay_addr, "connected to signaling relay");

        let (mut sink, mut stream) = ws.split();
        let open = Arc::new(AtomicBool::new(true));
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<SignalMsg>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<SignalEvent>();

        // Writer: serialize queued envelopes onto the socket.
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let json = match serde_json::to_string(&msg) {
                    Ok(json) => json,
                    Err(e) => {
                        tracing::warn!("unserializable envelope: {e}");
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Text(json.into())).await {
                    tracing::warn!("signaling send failed: {e}");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        // Reader: the single ordered dispatch path.
        let reader_open = open.clone();
        tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        match serde_json::from_str::<SignalMsg>(text.as_str()) {
                            Ok(msg) => {
                                if in_tx.send(SignalEvent::Message(msg)).is_err() {
                                    break;
                                }
                            }
                            Err(e) => tracing::warn!("ignoring malformed envelope: {e}"),
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    // Ping/pong and binary frames are not part of the protocol.
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!("signaling connection error: {e}");
                        break;
                    }
                }
            }
            reader_open.store(false, Ordering::SeqCst);
            let _ = in_tx.send(SignalEvent::Closed);
        });

        Ok((Self { out_tx, open }, in_rx))
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && !self.out_tx.is_closed()
    }

    /// Queue an envelope for the relay. Dropped with a log line when the
    /// connection is not open; delivery is never confirmed.
    pub fn send(&self, msg: SignalMsg) {
        if !self.is_open() {
            tracing::warn!(?msg, "dropping envelope: signaling connection not open");
            return;
        }
        if self.out_tx.send(msg).is_err() {
            tracing::warn!("dropping envelope: signaling writer gone");
        }
    }

    /// Generate a fresh room code and ask the relay to create the room.
    pub fn create_room(&self) -> Result<RoomCode, PortalError> {
        if !self.is_open() {
            return Err(PortalError::SignalingUnavailable(
                "connection closed".to_string(),
            ));
        }
        let code = RoomCode::generate();
        self.send(SignalMsg::CreateRoom {
            room_code: code.clone(),
        });
        Ok(code)
    }

    /// Validate the supplied code locally, then ask the relay to join.
    pub fn join_room(&self, input: &str) -> Result<RoomCode, PortalError> {
        let code = RoomCode::parse(input)?;
        if !self.is_open() {
            return Err(PortalError::SignalingUnavailable(
                "connection closed".to_string(),
            ));
        }
        self.send(SignalMsg::JoinRoom {
            room_code: code.clone(),
        });
        Ok(code)
    }
}
