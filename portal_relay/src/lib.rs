//! Rendezvous relay: pairs exactly two websocket clients per room code
//! and forwards their negotiation envelopes verbatim. The relay never
//! inspects offer/answer payloads and never sees file data.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

use portal_core::signaling::{RoomCode, SignalMsg};

struct Member {
    conn_id: u64,
    tx: mpsc::UnboundedSender<SignalMsg>,
}

/// One rendezvous room: a creator waiting plus at most one joiner.
struct Room {
    creator: Member,
    joiner: Option<Member>,
}

impl Room {
    /// The other member's outbox, from the perspective of `conn_id`.
    fn counterpart(&self, conn_id: u64) -> Option<&mpsc::UnboundedSender<SignalMsg>> {
        if self.creator.conn_id == conn_id {
            self.joiner.as_ref().map(|m| &m.tx)
        } else {
            Some(&self.creator.tx)
        }
    }
}

type Rooms = Arc<Mutex<HashMap<RoomCode, Room>>>;

pub struct Relay {
    listener: TcpListener,
    rooms: Rooms,
    next_conn_id: Arc<AtomicU64>,
}

impl Relay {
    pub async fn bind(addr: &str) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding relay to {addr}"))?;
        Ok(Self {
            listener,
            rooms: Arc::new(Mutex::new(HashMap::new())),
            next_conn_id: Arc::new(AtomicU64::new(1)),
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        self.listener.local_addr().context("relay local address")
    }

    /// Accept clients until the listener fails.
    pub async fn run(self) -> anyhow::Result<()> {
        loop {
            let (stream, peer_addr) = self.listener.accept().await.context("accepting client")?;
            let conn_id = self.next_conn_id.fetch_add(1, Ordering::SeqCst);
            let rooms = self.rooms.clone();
            tokio::spawn(async move {
                tracing::debug!(conn_id, %peer_addr, "client connected");
                if let Err(e) = handle_client(stream, conn_id, rooms).await {
                    tracing::debug!(conn_id, "client ended with error: {e}");
                }
                tracing::debug!(conn_id, "client disconnected");
            });
        }
    }
}

async fn handle_client(stream: TcpStream, conn_id: u64, rooms: Rooms) -> anyhow::Result<()> {
    let ws = accept_async(stream).await.context("websocket handshake")?;
    let (mut sink, mut frames) = ws.split();

    // Per-client outbox so room members can push to each other without
    // holding the rooms lock across a socket write.
    let (tx, mut rx) = mpsc::unbounded_channel::<SignalMsg>();
    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let json = match serde_json::to_string(&msg) {
                Ok(json) => json,
                Err(e) => {
                    tracing::warn!("unserializable envelope: {e}");
                    continue;
                }
            };
            if sink.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    // The one room this connection belongs to, once established.
    let mut membership: Option<RoomCode> = None;

    while let Some(frame) = frames.next().await {
        let msg = match frame {
            Ok(Message::Text(text)) => match serde_json::from_str::<SignalMsg>(text.as_str()) {
                Ok(msg) => msg,
                Err(e) => {
                    tracing::warn!(conn_id, "ignoring malformed envelope: {e}");
                    continue;
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::debug!(conn_id, "read error: {e}");
                break;
            }
        };

        match msg {
            SignalMsg::CreateRoom { room_code } => {
                // One room per connection; a second create would orphan
                // the first room in the registry.
                if membership.is_some() {
                    let _ = tx.send(SignalMsg::Error {
                        message: "already in a room".to_string(),
                    });
                    continue;
                }
                let mut rooms = rooms.lock().await;
                if rooms.contains_key(&room_code) {
                    let _ = tx.send(SignalMsg::Error {
                        message: format!("room {room_code} already exists"),
                    });
                    continue;
                }
                tracing::info!(conn_id, %room_code, "room created");
                rooms.insert(
                    room_code.clone(),
                    Room {
                        creator: Member {
                            conn_id,
                            tx: tx.clone(),
                        },
                        joiner: None,
                    },
                );
                membership = Some(room_code.clone());
                let _ = tx.send(SignalMsg::RoomCreated { room_code });
            }
            SignalMsg::JoinRoom { room_code } => {
                if membership.is_some() {
                    let _ = tx.send(SignalMsg::Error {
                        message: "already in a room".to_string(),
                    });
                    continue;
                }
                let mut rooms = rooms.lock().await;
                match rooms.get_mut(&room_code) {
                    None => {
                        let _ = tx.send(SignalMsg::Error {
                            message: format!("room {room_code} not found"),
                        });
                    }
                    Some(room) if room.joiner.is_some() => {
                        let _ = tx.send(SignalMsg::Error {
                            message: format!("room {room_code} is full"),
                        });
                    }
                    Some(room) => {
                        tracing::info!(conn_id, %room_code, "peer joined");
                        room.joiner = Some(Member {
                            conn_id,
                            tx: tx.clone(),
                        });
                        membership = Some(room_code.clone());
                        let _ = tx.send(SignalMsg::RoomJoined {
                            room_code: room_code.clone(),
                        });
                        let _ = room.creator.tx.send(SignalMsg::PeerJoined { room_code });
                    }
                }
            }
            msg @ (SignalMsg::Offer { .. }
            | SignalMsg::Answer { .. }
            | SignalMsg::IceCandidate { .. }) => {
                let Some(room_code) = msg.room_code().cloned() else {
                    continue;
                };
                let rooms = rooms.lock().await;
                let Some(room) = rooms.get(&room_code) else {
                    let _ = tx.send(SignalMsg::Error {
                        message: format!("room {room_code} not found"),
                    });
                    continue;
                };
                if membership.as_ref() != Some(&room_code) {
                    tracing::warn!(conn_id, %room_code, "envelope for a room this client is not in");
                    continue;
                }
                match room.counterpart(conn_id) {
                    Some(peer_tx) => {
                        let _ = peer_tx.send(msg);
                    }
                    None => tracing::debug!(conn_id, %room_code, "no counterpart yet, dropping"),
                }
            }
            other => {
                tracing::warn!(conn_id, ?other, "client sent a server-only envelope");
            }
        }
    }

    // One side hanging up tears the room down for both.
    if let Some(room_code) = membership {
        let mut rooms = rooms.lock().await;
        if let Some(room) = rooms.remove(&room_code) {
            tracing::info!(conn_id, %room_code, "room closed");
            if let Some(peer_tx) = room.counterpart(conn_id) {
                let _ = peer_tx.send(SignalMsg::PeerDisconnected { room_code });
            }
        }
    }

    drop(tx);
    let _ = writer.await;
    Ok(())
}
