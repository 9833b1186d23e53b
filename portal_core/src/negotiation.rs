//! Peer-connection negotiation: drives the offer/answer/candidate
//! exchange against an injected peer-transport collaborator until an
//! ordered data channel is usable, or the session is dead.
//!
//! The actual NAT traversal lives behind [`PeerConnection`]; this module
//! only sequences the exchange and owns the per-session state machine.

use std::future::Future;

use tokio::sync::mpsc;

use crate::channel::{ChannelPair, DataChannel, FrameSource};
use crate::error::PortalError;

/// Opaque session description (SDP blob) produced by the peer transport.
#[derive(Debug, Clone)]
pub struct SessionDesc(pub serde_json::Value);

/// Opaque transport candidate, trickled through signaling as discovered.
#[derive(Debug, Clone)]
pub struct IceCandidate(pub serde_json::Value);

/// Which side of the rendezvous this peer is. The room creator initiates
/// the offer once the joiner arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Joiner,
}

/// Events pushed up by the peer transport collaborator.
#[derive(Debug)]
pub enum PeerEvent<L, S> {
    /// A locally discovered candidate, to be forwarded to the peer as it
    /// is produced, never batched.
    LocalCandidate(IceCandidate),
    /// The remote side announced the data channel (joiner side).
    ChannelOpened(ChannelPair<L, S>),
    /// The transport reached a usable connected state.
    Connected,
    /// Negotiation or transport failure. Terminal.
    Failed(String),
    /// Orderly close by the peer or the network.
    Closed,
}

/// External ICE/peer-transport collaborator.
pub trait PeerConnection: Send + 'static {
    type Link: DataChannel;
    type Frames: FrameSource;

    /// Camera/microphone warm-up. Failure is surfaced as a warning only;
    /// the channel used for files is independent of media tracks.
    fn acquire_local_media(&mut self) -> impl Future<Output = Result<(), PortalError>> + Send;

    /// Create the data channel eagerly, ahead of answer completion.
    /// Initiator side only; the joiner receives its channel passively
    /// through [`PeerEvent::ChannelOpened`].
    fn open_channel(&mut self) -> Result<ChannelPair<Self::Link, Self::Frames>, PortalError>;

    fn create_offer(&mut self) -> impl Future<Output = Result<SessionDesc, PortalError>> + Send;

    /// Apply the remote offer and produce the local answer.
    fn accept_offer(
        &mut self,
        offer: SessionDesc,
    ) -> impl Future<Output = Result<SessionDesc, PortalError>> + Send;

    fn accept_answer(
        &mut self,
        answer: SessionDesc,
    ) -> impl Future<Output = Result<(), PortalError>> + Send;

    fn add_remote_candidate(
        &mut self,
        candidate: IceCandidate,
    ) -> impl Future<Output = Result<(), PortalError>> + Send;

    /// Take the event stream. Valid exactly once per connection.
    fn take_events(&mut self) -> mpsc::UnboundedReceiver<PeerEvent<Self::Link, Self::Frames>>;

    /// Synchronously release the connection and close the channel.
    fn shutdown(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    AcquiringLocalMedia,
    CreatingOffer,
    OfferSent,
    AwaitingOffer,
    CreatingAnswer,
    AnswerSent,
    Negotiating,
    Connected,
    /// Terminal. A fresh negotiator is required to connect again.
    Disconnected,
}

/// Outcome of [`PeerNegotiator::start`].
#[derive(Debug)]
pub struct StartOutcome {
    /// The offer to forward through signaling (initiator only).
    pub offer: Option<SessionDesc>,
    /// Non-fatal local media failure, for the UI.
    pub media_warning: Option<String>,
}

pub struct PeerNegotiator<P: PeerConnection> {
    peer: P,
    state: NegotiationState,
    role: Option<Role>,
    /// Candidates that arrived before the remote description was set.
    pending_candidates: Vec<IceCandidate>,
    remote_set: bool,
    channel: Option<ChannelPair<P::Link, P::Frames>>,
}

impl<P: PeerConnection> PeerNegotiator<P> {
    pub fn new(peer: P) -> Self {
        Self {
            peer,
            state: NegotiationState::Idle,
            role: None,
            pending_candidates: Vec::new(),
            remote_set: false,
            channel: None,
        }
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn role(&self) -> Option<Role> {
        self.role
    }

    /// Begin negotiating. Only valid from `Idle`.
    pub async fn start(&mut self, role: Role) -> Result<StartOutcome, PortalError> {
        if self.state != NegotiationState::Idle {
            return Err(self.invalid("start", "Idle"));
        }
        self.role = Some(role);
        self.state = NegotiationState::AcquiringLocalMedia;

        let media_warning = match self.peer.acquire_local_media().await {
            Ok(()) => None,
            Err(e) => {
                tracing::warn!("continuing without local media: {e}");
                Some(e.to_string())
            }
        };

        match role {
            Role::Initiator => {
                // The channel rides the offer's descriptor negotiation,
                // so it must exist before the offer is created.
                let pair = match self.peer.open_channel() {
                    Ok(pair) => pair,
                    Err(e) => return Err(self.fail(e)),
                };
                self.channel = Some(pair);
                self.state = NegotiationState::CreatingOffer;
                let offer = match self.peer.create_offer().await {
                    Ok(offer) => offer,
                    Err(e) => return Err(self.fail(e)),
                };
                self.state = NegotiationState::OfferSent;
                Ok(StartOutcome {
                    offer: Some(offer),
                    media_warning,
                })
            }
            Role::Joiner => {
                self.state = NegotiationState::AwaitingOffer;
                Ok(StartOutcome {
                    offer: None,
                    media_warning,
                })
            }
        }
    }

    /// Remote offer arrived (joiner side). Returns the answer to forward.
    pub async fn handle_offer(&mut self, offer: SessionDesc) -> Result<SessionDesc, PortalError> {
        if self.state != NegotiationState::AwaitingOffer {
            return Err(self.invalid("offer", "AwaitingOffer"));
        }
        self.state = NegotiationState::CreatingAnswer;
        let answer = match self.peer.accept_offer(offer).await {
            Ok(answer) => answer,
            Err(e) => return Err(self.fail(e)),
        };
        self.remote_set = true;
        self.flush_pending_candidates().await;
        self.state = NegotiationState::AnswerSent;
        Ok(answer)
    }

    /// The answer produced by `handle_offer` has been forwarded.
    pub fn mark_answer_sent(&mut self) {
        if self.state == NegotiationState::AnswerSent {
            self.state = NegotiationState::Negotiating;
        }
    }

    /// Remote answer arrived (initiator side).
    pub async fn handle_answer(&mut self, answer: SessionDesc) -> Result<(), PortalError> {
        if self.state != NegotiationState::OfferSent {
            return Err(self.invalid("answer", "OfferSent"));
        }
        if let Err(e) = self.peer.accept_answer(answer).await {
            return Err(self.fail(e));
        }
        self.remote_set = true;
        self.flush_pending_candidates().await;
        self.state = NegotiationState::Negotiating;
        Ok(())
    }

    /// Remote candidate arrived. Buffered until the remote description is
    /// applied; candidates never change the negotiation state.
    pub async fn handle_remote_candidate(
        &mut self,
        candidate: IceCandidate,
    ) -> Result<(), PortalError> {
        if self.state == NegotiationState::Disconnected {
            tracing::debug!("dropping candidate for dead negotiation");
            return Ok(());
        }
        if self.remote_set {
            self.peer.add_remote_candidate(candidate).await
        } else {
            self.pending_candidates.push(candidate);
            Ok(())
        }
    }

    /// The joiner's channel arrived from the collaborator.
    pub fn on_channel_opened(&mut self, pair: ChannelPair<P::Link, P::Frames>) {
        if self.channel.is_some() {
            tracing::warn!("duplicate data channel announcement, keeping the first");
            return;
        }
        self.channel = Some(pair);
    }

    /// The transport reported a usable connection.
    pub fn on_connected(&mut self) -> Result<(), PortalError> {
        match self.state {
            NegotiationState::Negotiating | NegotiationState::AnswerSent => {
                self.state = NegotiationState::Connected;
                Ok(())
            }
            NegotiationState::Connected => Ok(()),
            _ => Err(self.invalid("connected", "Negotiating")),
        }
    }

    /// Terminal teardown: releases the peer connection and discards all
    /// negotiation state. The only transition out of `Connected`.
    pub fn on_disconnected(&mut self) {
        self.state = NegotiationState::Disconnected;
        self.remote_set = false;
        self.pending_candidates.clear();
        self.channel = None;
        self.peer.shutdown();
    }

    /// The established channel, once connected. Ownership moves to the
    /// transfer engine.
    pub fn take_channel(&mut self) -> Option<ChannelPair<P::Link, P::Frames>> {
        if self.state == NegotiationState::Connected {
            self.channel.take()
        } else {
            None
        }
    }

    async fn flush_pending_candidates(&mut self) {
        for candidate in std::mem::take(&mut self.pending_candidates) {
            if let Err(e) = self.peer.add_remote_candidate(candidate).await {
                tracing::warn!("could not apply buffered candidate: {e}");
            }
        }
    }

    fn invalid(&self, event: &str, expected: &str) -> PortalError {
        PortalError::NegotiationFailed(format!(
            "unexpected {event} in state {:?} (expected {expected})",
            self.state
        ))
    }

    /// Negotiation failures are terminal; no retry is attempted here.
    fn fail(&mut self, cause: PortalError) -> PortalError {
        self.on_disconnected();
        PortalError::NegotiationFailed(cause.to_string())
    }
}
