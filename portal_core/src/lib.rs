use std::path::PathBuf;

pub mod channel;
pub mod config;
pub mod error;
pub mod negotiation;
pub mod session;
pub mod signaling;
pub mod transfer;

pub use error::PortalError;
pub use session::{SessionRole, run_session};
pub use signaling::RoomCode;

/// Metadata for one file moving through a transfer.
#[derive(Debug, Clone)]
pub struct FileMeta {
    pub name: String,
    pub size: u64,
    pub mime_type: String,
}

/// Commands from the UI to a running session.
#[derive(Debug, Clone)]
pub enum AppCommand {
    /// Send a local file to the connected peer. While another outbound
    /// transfer is active the file waits in a FIFO queue.
    SendFile { path: PathBuf },
    /// Tear the session down. Terminal; a fresh session starts clean.
    Disconnect,
}

/// Reports from a session to the UI.
#[derive(Debug, Clone)]
pub enum UiEvent {
    Status(String),

    /// The relay accepted our create-room request; show the code.
    RoomReady { code: RoomCode },
    PeerJoined,
    Connected,
    Disconnected,

    TransferProgress {
        file_name: String,
        percent: f32,
        is_sending: bool,
    },
    TransferCompleted {
        file_name: String,
    },

    /// A complete file was reassembled and persisted.
    FileArrived {
        name: String,
        mime_type: String,
        saved_path: PathBuf,
        size: u64,
    },

    /// An in-flight transfer was discarded; no partial file was persisted.
    TransferAborted {
        file_name: String,
        reason: String,
    },

    Error(String),
}
