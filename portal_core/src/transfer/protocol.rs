//! Wire protocol for the chunked transfer.
//!
//! Each file travels as a `file-start` control frame, `totalChunks`
//! header/fragment pairs, and a `file-end` control frame, all on the
//! same ordered channel. Every binary fragment is prefixed with its own
//! correlation header (file id + chunk index) so the receiver never has
//! to infer ownership from frame ordering across files.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::PortalError;

/// Fixed fragment payload size (64 KiB).
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Fragment prefix: 16-byte file id + 4-byte big-endian chunk index.
pub const FRAGMENT_HEADER_LEN: usize = 20;

/// Upper bound on a declared transfer size (16 GiB). Announcements
/// beyond it are treated as malformed and ignored.
pub const MAX_FILE_SIZE: u64 = 16 * 1024 * 1024 * 1024;

/// Control frames interleaved with binary fragments on the data channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ControlMsg {
    FileStart {
        file_id: Uuid,
        name: String,
        size: u64,
        mime_type: String,
        total_chunks: u32,
    },
    FileChunk {
        file_id: Uuid,
        chunk_index: u32,
        size: u32,
    },
    FileEnd {
        file_id: Uuid,
    },
}

/// Number of fragments for a file of `size` bytes. A zero-byte file has
/// zero fragments; its transfer is `file-start` directly followed by
/// `file-end`.
pub fn chunk_count(size: u64) -> u32 {
    size.div_ceil(CHUNK_SIZE as u64) as u32
}

/// Prefix a fragment payload with its correlation header.
pub fn encode_fragment(file_id: Uuid, chunk_index: u32, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(FRAGMENT_HEADER_LEN + payload.len());
    buf.put_slice(file_id.as_bytes());
    buf.put_u32(chunk_index);
    buf.put_slice(payload);
    buf.freeze()
}

/// Split a binary frame into its correlation header and payload.
pub fn decode_fragment(mut frame: Bytes) -> Result<(Uuid, u32, Bytes), PortalError> {
    if frame.len() < FRAGMENT_HEADER_LEN {
        return Err(PortalError::TransferAborted(format!(
            "fragment too short: {} bytes",
            frame.len()
        )));
    }
    let header = frame.split_to(FRAGMENT_HEADER_LEN);
    let file_id = Uuid::from_slice(&header[..16])
        .map_err(|e| PortalError::TransferAborted(format!("bad fragment header: {e}")))?;
    let chunk_index =
        u32::from_be_bytes([header[16], header[17], header[18], header[19]]);
    Ok((file_id, chunk_index, frame))
}
