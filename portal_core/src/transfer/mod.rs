//! Chunked file transfer over one ordered peer-to-peer channel.
//!
//! This module provides:
//! - the wire protocol (JSON control frames + header-prefixed fragments)
//! - the transfer engine owning the outgoing/incoming state tables
//! - the persistence seam files are handed to once reassembled

pub mod engine;
pub mod protocol;
pub mod store;

// Re-export public API
pub use engine::{EngineCommand, TransferEngine};
pub use protocol::{CHUNK_SIZE, ControlMsg, chunk_count};
pub use store::{DownloadDirStore, FileStore};

/// Guess a mime type from the file extension. Transfers carry the value
/// opaquely; receivers only forward it to the UI.
pub fn guess_mime(name: &str) -> &'static str {
    let ext = name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase());
    match ext.as_deref() {
        Some("txt") => "text/plain",
        Some("html") => "text/html",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("pdf") => "application/pdf",
        Some("json") => "application/json",
        Some("zip") => "application/zip",
        Some("mp4") => "video/mp4",
        _ => "application/octet-stream",
    }
}
