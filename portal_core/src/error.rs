use thiserror::Error;

/// Failure taxonomy for a portal session.
///
/// Connection-establishment failures require an explicit retry by the
/// caller; nothing in this crate reconnects automatically.
#[derive(Debug, Error)]
pub enum PortalError {
    #[error("signaling relay unavailable: {0}")]
    SignalingUnavailable(String),

    #[error("invalid room code {0:?}: expected 6 alphanumeric characters")]
    InvalidRoomCode(String),

    #[error("negotiation failed: {0}")]
    NegotiationFailed(String),

    #[error("data channel is not open")]
    ChannelNotReady,

    #[error("transfer aborted: {0}")]
    TransferAborted(String),

    #[error("could not persist received file: {0}")]
    PersistFailed(String),
}
