//! Session orchestrator: one task that owns the signaling connection,
//! the negotiation state machine, and (once connected) the transfer
//! engine, wired to the UI through command/event channels.

use std::future::Future;
use std::pin::Pin;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::PortalConfig;
use crate::error::PortalError;
use crate::negotiation::{IceCandidate, PeerConnection, PeerEvent, PeerNegotiator, Role, SessionDesc};
use crate::signaling::{RoomCode, SignalEvent, SignalMsg, SignalingClient};
use crate::transfer::engine::{EngineCommand, TransferEngine};
use crate::transfer::store::FileStore;
use crate::{AppCommand, UiEvent};

/// How this session enters its room.
#[derive(Debug, Clone)]
pub enum SessionRole {
    /// Create a room and wait for a peer. The creator initiates the
    /// offer once someone joins.
    Create,
    /// Join an existing room by code.
    Join(String),
}

type EngineTask = Pin<Box<dyn Future<Output = Result<(), PortalError>> + Send>>;

/// What the select loop observed; handled outside the arms so the
/// handlers can borrow the session state freely.
enum Step<L, S> {
    Signal(Option<SignalEvent>),
    Peer(Option<PeerEvent<L, S>>),
    Cmd(Option<AppCommand>),
    EngineDone(Result<(), PortalError>),
}

/// Run one two-peer session to completion. Returns when either side
/// disconnects, the UI asks to stop, or negotiation fails. Sessions are
/// one-shot: reconnecting means calling this again with fresh parts.
pub async fn run_session<P, F>(
    config: PortalConfig,
    role: SessionRole,
    mut peer: P,
    store: F,
    mut cmd_rx: mpsc::Receiver<AppCommand>,
    event_tx: mpsc::Sender<UiEvent>,
) -> Result<(), PortalError>
where
    P: PeerConnection,
    F: FileStore,
{
    // Reject a bad code before any network traffic.
    if let SessionRole::Join(input) = &role {
        RoomCode::parse(input)?;
    }

    let (signal, mut signal_rx) = SignalingClient::connect(&config.relay_addr).await?;

    let (room_code, is_creator) = match &role {
        SessionRole::Create => {
            let code = signal.create_room()?;
            let _ = event_tx
                .send(UiEvent::Status("creating room...".to_string()))
                .await;
            (code, true)
        }
        SessionRole::Join(input) => {
            let code = signal.join_room(input)?;
            let _ = event_tx
                .send(UiEvent::Status(format!("joining room {code}...")))
                .await;
            (code, false)
        }
    };

    let mut peer_events = peer.take_events();
    let mut neg = PeerNegotiator::new(peer);
    let cancel = CancellationToken::new();
    let mut store_slot = Some(store);
    let mut engine_task: Option<EngineTask> = None;
    let mut engine_cmd_tx: Option<mpsc::UnboundedSender<EngineCommand>> = None;

    loop {
        let step = tokio::select! {
            ev = signal_rx.recv() => Step::Signal(ev),
            ev = peer_events.recv() => Step::Peer(ev),
            cmd = cmd_rx.recv() => Step::Cmd(cmd),
            result = poll_engine(&mut engine_task) => Step::EngineDone(result),
        };

        match step {
            Step::Signal(Some(SignalEvent::Message(msg))) => match msg {
                SignalMsg::RoomCreated { room_code } => {
                    tracing::info!(%room_code, "room ready");
                    let _ = event_tx
                        .send(UiEvent::RoomReady {
                            code: room_code.clone(),
                        })
                        .await;
                    let _ = event_tx
                        .send(UiEvent::Status(format!(
                            "waiting for a peer to join {room_code}"
                        )))
                        .await;
                }
                SignalMsg::RoomJoined { room_code } => {
                    tracing::info!(%room_code, "joined room");
                    let _ = event_tx
                        .send(UiEvent::Status("joined, negotiating...".to_string()))
                        .await;
                    let Some(result) =
                        drive_negotiation(neg.start(Role::Joiner), &mut cmd_rx, &event_tx).await
                    else {
                        cancel.cancel();
                        neg.on_disconnected();
                        let _ = event_tx.send(UiEvent::Disconnected).await;
                        return Ok(());
                    };
                    match result {
                        Ok(outcome) => {
                            if let Some(warning) = outcome.media_warning {
                                let _ = event_tx.send(UiEvent::Status(warning)).await;
                            }
                        }
                        Err(e) => {
                            let _ = event_tx.send(UiEvent::Error(e.to_string())).await;
                            cancel.cancel();
                            neg.on_disconnected();
                            return Err(e);
                        }
                    }
                }
                SignalMsg::PeerJoined { .. } => {
                    if !is_creator {
                        tracing::warn!("ignoring peer-joined on the joining side");
                        continue;
                    }
                    let _ = event_tx.send(UiEvent::PeerJoined).await;
                    let Some(result) =
                        drive_negotiation(neg.start(Role::Initiator), &mut cmd_rx, &event_tx).await
                    else {
                        cancel.cancel();
                        neg.on_disconnected();
                        let _ = event_tx.send(UiEvent::Disconnected).await;
                        return Ok(());
                    };
                    match result {
                        Ok(outcome) => {
                            if let Some(warning) = outcome.media_warning {
                                let _ = event_tx.send(UiEvent::Status(warning)).await;
                            }
                            if let Some(offer) = outcome.offer {
                                signal.send(SignalMsg::Offer {
                                    room_code: room_code.clone(),
                                    payload: offer.0,
                                });
                            }
                        }
                        Err(e) => {
                            let _ = event_tx.send(UiEvent::Error(e.to_string())).await;
                            cancel.cancel();
                            neg.on_disconnected();
                            return Err(e);
                        }
                    }
                }
                SignalMsg::Offer { payload, .. } => {
                    let Some(result) = drive_negotiation(
                        neg.handle_offer(SessionDesc(payload)),
                        &mut cmd_rx,
                        &event_tx,
                    )
                    .await
                    else {
                        cancel.cancel();
                        neg.on_disconnected();
                        let _ = event_tx.send(UiEvent::Disconnected).await;
                        return Ok(());
                    };
                    match result {
                        Ok(answer) => {
                            signal.send(SignalMsg::Answer {
                                room_code: room_code.clone(),
                                payload: answer.0,
                            });
                            neg.mark_answer_sent();
                        }
                        Err(e) => {
                            let _ = event_tx.send(UiEvent::Error(e.to_string())).await;
                            cancel.cancel();
                            neg.on_disconnected();
                            return Err(e);
                        }
                    }
                }
                SignalMsg::Answer { payload, .. } => {
                    let Some(result) = drive_negotiation(
                        neg.handle_answer(SessionDesc(payload)),
                        &mut cmd_rx,
                        &event_tx,
                    )
                    .await
                    else {
                        cancel.cancel();
                        neg.on_disconnected();
                        let _ = event_tx.send(UiEvent::Disconnected).await;
                        return Ok(());
                    };
                    if let Err(e) = result {
                        let _ = event_tx.send(UiEvent::Error(e.to_string())).await;
                        cancel.cancel();
                        neg.on_disconnected();
                        return Err(e);
                    }
                }
                SignalMsg::IceCandidate { payload, .. } => {
                    // Candidate failures degrade connectivity but are
                    // not fatal to the exchange.
                    if let Err(e) = neg.handle_remote_candidate(IceCandidate(payload)).await {
                        tracing::warn!("could not apply remote candidate: {e}");
                    }
                }
                SignalMsg::PeerDisconnected { .. } => {
                    tracing::info!("peer left the room");
                    cancel.cancel();
                    neg.on_disconnected();
                    let _ = event_tx.send(UiEvent::Disconnected).await;
                    return Ok(());
                }
                SignalMsg::Error { message } => {
                    let _ = event_tx.send(UiEvent::Error(message.clone())).await;
                    cancel.cancel();
                    neg.on_disconnected();
                    return Err(PortalError::SignalingUnavailable(message));
                }
                other => {
                    tracing::warn!(?other, "unexpected signaling envelope");
                }
            },
            Step::Signal(Some(SignalEvent::Closed)) | Step::Signal(None) => {
                tracing::info!("signaling connection closed");
                cancel.cancel();
                neg.on_disconnected();
                let _ = event_tx.send(UiEvent::Disconnected).await;
                return Ok(());
            }
            Step::Peer(Some(PeerEvent::LocalCandidate(candidate))) => {
                signal.send(SignalMsg::IceCandidate {
                    room_code: room_code.clone(),
                    payload: candidate.0,
                });
            }
            Step::Peer(Some(PeerEvent::ChannelOpened(pair))) => {
                neg.on_channel_opened(pair);
            }
            Step::Peer(Some(PeerEvent::Connected)) => {
                if let Err(e) = neg.on_connected() {
                    tracing::warn!("spurious connected event: {e}");
                    continue;
                }
                let _ = event_tx.send(UiEvent::Connected).await;
                if engine_task.is_none() {
                    match (neg.take_channel(), store_slot.take()) {
                        (Some(pair), Some(store)) => {
                            let engine = TransferEngine::new(pair, store, event_tx.clone());
                            let (tx, rx) = mpsc::unbounded_channel();
                            engine_cmd_tx = Some(tx);
                            engine_task = Some(Box::pin(engine.run(rx, cancel.child_token())));
                        }
                        _ => tracing::warn!("connected without a usable data channel"),
                    }
                }
            }
            Step::Peer(Some(PeerEvent::Failed(reason))) => {
                let _ = event_tx.send(UiEvent::Error(reason.clone())).await;
                cancel.cancel();
                neg.on_disconnected();
                return Err(PortalError::NegotiationFailed(reason));
            }
            Step::Peer(Some(PeerEvent::Closed)) | Step::Peer(None) => {
                cancel.cancel();
                neg.on_disconnected();
                let _ = event_tx.send(UiEvent::Disconnected).await;
                return Ok(());
            }
            Step::Cmd(Some(AppCommand::SendFile { path })) => match engine_cmd_tx.as_ref() {
                Some(tx) => {
                    let _ = tx.send(EngineCommand::SendFile { path });
                }
                None => {
                    let _ = event_tx
                        .send(UiEvent::Error("not connected to a peer yet".to_string()))
                        .await;
                }
            },
            Step::Cmd(Some(AppCommand::Disconnect)) | Step::Cmd(None) => {
                tracing::info!("session stopping on request");
                cancel.cancel();
                neg.on_disconnected();
                let _ = event_tx.send(UiEvent::Disconnected).await;
                return Ok(());
            }
            Step::EngineDone(result) => {
                cancel.cancel();
                neg.on_disconnected();
                let _ = event_tx.send(UiEvent::Disconnected).await;
                return result;
            }
        }
    }
}

/// Poll the engine when one is running, park otherwise.
async fn poll_engine(task: &mut Option<EngineTask>) -> Result<(), PortalError> {
    match task.as_mut() {
        Some(f) => f.await,
        None => std::future::pending().await,
    }
}

/// Await one negotiation step without deafening the command path: a
/// disconnect request interrupts the step (`None`), and send requests
/// arriving mid-negotiation are answered instead of queued blind.
async fn drive_negotiation<T>(
    step: impl Future<Output = T>,
    cmd_rx: &mut mpsc::Receiver<AppCommand>,
    event_tx: &mpsc::Sender<UiEvent>,
) -> Option<T> {
    tokio::pin!(step);
    loop {
        tokio::select! {
            out = &mut step => return Some(out),
            cmd = cmd_rx.recv() => match cmd {
                Some(AppCommand::Disconnect) | None => return None,
                Some(AppCommand::SendFile { .. }) => {
                    let _ = event_tx
                        .send(UiEvent::Error("not connected to a peer yet".to_string()))
                        .await;
                }
            },
        }
    }
}
