//! The transfer engine: one task owning the data channel and every
//! transfer table. All outbound pacing and inbound reassembly happen
//! here, so no state is ever shared across tasks.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::channel::{ChannelPair, ChannelTransport, DataChannel, Frame, FrameSource};
use crate::error::PortalError;
use crate::transfer::protocol::{self, CHUNK_SIZE, ControlMsg, chunk_count};
use crate::transfer::store::FileStore;
use crate::transfer::guess_mime;
use crate::{FileMeta, UiEvent};

/// Stop pushing fragments while this many bytes sit unsent in the
/// channel's outbound buffer.
const HIGH_WATERMARK: u64 = 1024 * 1024;

/// How long to wait before re-checking a saturated buffer.
const DRAIN_POLL: Duration = Duration::from_millis(10);

/// Commands from the session loop to a running engine.
#[derive(Debug)]
pub enum EngineCommand {
    SendFile { path: PathBuf },
}

struct OutgoingTransfer {
    file_id: Uuid,
    meta: FileMeta,
    file: tokio::fs::File,
    total_chunks: u32,
    next_chunk: u32,
}

struct IncomingTransfer {
    meta: FileMeta,
    total_chunks: u32,
    slots: Vec<Option<bytes::Bytes>>,
    received: u32,
    /// Last `file-chunk` announcement, cross-checked against the next
    /// fragment's header. The header is authoritative.
    announced: Option<(u32, u32)>,
}

/// What the select loop decided to do next. Computed inside the arms so
/// the handlers below can borrow the engine freely.
enum Step {
    Frame(Option<Frame>),
    Cmd(Option<EngineCommand>),
    SendSlot,
    Cancelled,
}

pub struct TransferEngine<L: DataChannel, S: FrameSource, F: FileStore> {
    transport: ChannelTransport<L, S>,
    store: F,
    event_tx: mpsc::Sender<UiEvent>,
    outgoing: Option<OutgoingTransfer>,
    send_queue: VecDeque<PathBuf>,
    incoming: HashMap<Uuid, IncomingTransfer>,
}

impl<L: DataChannel, S: FrameSource, F: FileStore> TransferEngine<L, S, F> {
    pub fn new(pair: ChannelPair<L, S>, store: F, event_tx: mpsc::Sender<UiEvent>) -> Self {
        Self {
            transport: ChannelTransport::new(pair),
            store,
            event_tx,
            outgoing: None,
            send_queue: VecDeque::new(),
            incoming: HashMap::new(),
        }
    }

    /// Drive the engine until the channel closes, the command channel is
    /// dropped, or the session cancels it.
    pub async fn run(
        mut self,
        mut cmd_rx: mpsc::UnboundedReceiver<EngineCommand>,
        cancel: CancellationToken,
    ) -> Result<(), PortalError> {
        loop {
            // Between fragments the sender yields without sleeping; only
            // a saturated outbound buffer inserts a real drain pause.
            let send_delay = if self.transport.buffered_bytes() >= HIGH_WATERMARK {
                DRAIN_POLL
            } else {
                Duration::ZERO
            };

            let step = tokio::select! {
                frame = self.transport.next_frame() => Step::Frame(frame),
                cmd = cmd_rx.recv() => Step::Cmd(cmd),
                _ = tokio::time::sleep(send_delay), if self.outgoing.is_some() => Step::SendSlot,
                _ = cancel.cancelled() => Step::Cancelled,
            };

            match step {
                Step::Frame(Some(Frame::Control(msg))) => self.handle_control(msg).await,
                Step::Frame(Some(Frame::Binary(bytes))) => self.handle_fragment(bytes).await,
                Step::Frame(None) => {
                    self.abort_all("data channel closed").await;
                    return Ok(());
                }
                Step::Cmd(Some(EngineCommand::SendFile { path })) => {
                    self.request_send(path).await;
                }
                Step::Cmd(None) | Step::Cancelled => {
                    self.abort_all("session shut down").await;
                    return Ok(());
                }
                Step::SendSlot => {
                    if let Err(e) = self.pump_outbound().await {
                        self.abort_all("data channel failed").await;
                        return Err(e);
                    }
                }
            }
        }
    }

    /// Queue a file for sending. One outbound transfer runs at a time;
    /// the rest wait in FIFO order.
    async fn request_send(&mut self, path: PathBuf) {
        if self.outgoing.is_some() {
            tracing::debug!(path = %path.display(), "queueing file behind active transfer");
            self.send_queue.push_back(path);
            return;
        }
        self.launch(path).await;
    }

    /// Try to start `path`; on a local open failure fall through to the
    /// next queued file instead of stalling the queue.
    async fn launch(&mut self, path: PathBuf) {
        let mut next = Some(path);
        while let Some(path) = next {
            if self.start_outbound(path).await {
                return;
            }
            next = self.send_queue.pop_front();
        }
    }

    async fn start_next_queued(&mut self) {
        if let Some(next) = self.send_queue.pop_front() {
            self.launch(next).await;
        }
    }

    /// Returns false only when the file could not be opened locally.
    async fn start_outbound(&mut self, path: PathBuf) -> bool {
        let (file, size) = match open_readable(&path).await {
            Ok(pair) => pair,
            Err(e) => {
                self.emit(UiEvent::Error(format!(
                    "could not open {}: {e}",
                    path.display()
                )))
                .await;
                return false;
            }
        };

        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unknown_file.bin")
            .to_string();
        let meta = FileMeta {
            mime_type: guess_mime(&name).to_string(),
            name,
            size,
        };
        let total_chunks = chunk_count(size);
        let file_id = Uuid::new_v4();

        let start = ControlMsg::FileStart {
            file_id,
            name: meta.name.clone(),
            size,
            mime_type: meta.mime_type.clone(),
            total_chunks,
        };
        if let Err(e) = self.transport.send_control(&start) {
            self.emit(UiEvent::Error(format!("could not start transfer: {e}")))
                .await;
            return true;
        }

        tracing::info!(file = %meta.name, size, total_chunks, %file_id, "sending file");
        self.emit(UiEvent::TransferProgress {
            file_name: meta.name.clone(),
            percent: 0.0,
            is_sending: true,
        })
        .await;
        self.outgoing = Some(OutgoingTransfer {
            file_id,
            meta,
            file,
            total_chunks,
            next_chunk: 0,
        });
        true
    }

    /// Send one fragment of the active transfer, or finish it.
    async fn pump_outbound(&mut self) -> Result<(), PortalError> {
        let finished = match self.outgoing.as_ref() {
            Some(out) => out.next_chunk >= out.total_chunks,
            None => return Ok(()),
        };

        if finished {
            if let Some(out) = self.outgoing.take() {
                self.transport
                    .send_control(&ControlMsg::FileEnd { file_id: out.file_id })?;
                if out.total_chunks == 0 {
                    // Empty files never get a per-fragment progress
                    // report, so completion is the one progress event.
                    self.emit(UiEvent::TransferProgress {
                        file_name: out.meta.name.clone(),
                        percent: 100.0,
                        is_sending: true,
                    })
                    .await;
                }
                tracing::info!(file = %out.meta.name, "file sent");
                self.emit(UiEvent::TransferCompleted {
                    file_name: out.meta.name,
                })
                .await;
            }
            self.start_next_queued().await;
            return Ok(());
        }

        let (file_id, index, payload, name, percent) = {
            let Some(out) = self.outgoing.as_mut() else {
                return Ok(());
            };
            let start = out.next_chunk as u64 * CHUNK_SIZE as u64;
            let want = CHUNK_SIZE.min((out.meta.size - start) as usize);
            let mut buf = vec![0u8; want];
            if let Err(e) = out.file.read_exact(&mut buf).await {
                let name = out.meta.name.clone();
                self.outgoing = None;
                self.emit(UiEvent::TransferAborted {
                    file_name: name,
                    reason: format!("read failed: {e}"),
                })
                .await;
                self.start_next_queued().await;
                return Ok(());
            }
            let index = out.next_chunk;
            out.next_chunk += 1;
            let percent = out.next_chunk as f32 / out.total_chunks as f32 * 100.0;
            (out.file_id, index, buf, out.meta.name.clone(), percent)
        };

        self.transport.send_control(&ControlMsg::FileChunk {
            file_id,
            chunk_index: index,
            size: payload.len() as u32,
        })?;
        self.transport
            .send_binary(protocol::encode_fragment(file_id, index, &payload))?;

        self.emit(UiEvent::TransferProgress {
            file_name: name,
            percent,
            is_sending: true,
        })
        .await;
        Ok(())
    }

    async fn handle_control(&mut self, msg: ControlMsg) {
        match msg {
            ControlMsg::FileStart {
                file_id,
                name,
                size,
                mime_type,
                total_chunks,
            } => {
                if self.incoming.contains_key(&file_id) {
                    tracing::warn!(%file_id, "duplicate file-start, ignoring");
                    return;
                }
                // The declared size and chunk count bound the reassembly
                // tables, so they are validated before any allocation.
                if size > protocol::MAX_FILE_SIZE || total_chunks != chunk_count(size) {
                    tracing::warn!(
                        %file_id, size, total_chunks,
                        "ignoring file-start with impossible metadata"
                    );
                    return;
                }
                tracing::info!(file = %name, size, total_chunks, %file_id, "receiving file");
                self.emit(UiEvent::TransferProgress {
                    file_name: name.clone(),
                    percent: 0.0,
                    is_sending: false,
                })
                .await;
                self.incoming.insert(
                    file_id,
                    IncomingTransfer {
                        meta: FileMeta {
                            name,
                            size,
                            mime_type,
                        },
                        total_chunks,
                        slots: vec![None; total_chunks as usize],
                        received: 0,
                        announced: None,
                    },
                );
            }
            ControlMsg::FileChunk {
                file_id,
                chunk_index,
                size,
            } => match self.incoming.get_mut(&file_id) {
                Some(transfer) => transfer.announced = Some((chunk_index, size)),
                None => tracing::warn!(%file_id, "chunk announcement for unknown file"),
            },
            ControlMsg::FileEnd { file_id } => self.finish_incoming(file_id).await,
        }
    }

    /// Store one received fragment. The fragment's own header says which
    /// file and slot it belongs to.
    async fn handle_fragment(&mut self, bytes: bytes::Bytes) {
        let (file_id, index, payload) = match protocol::decode_fragment(bytes) {
            Ok(parts) => parts,
            Err(e) => {
                tracing::warn!("dropping undecodable fragment: {e}");
                return;
            }
        };
        let Some(transfer) = self.incoming.get_mut(&file_id) else {
            tracing::warn!(%file_id, index, "fragment for unknown file");
            return;
        };

        if let Some((announced_index, announced_size)) = transfer.announced.take() {
            if announced_index != index || announced_size as usize != payload.len() {
                tracing::warn!(
                    %file_id, index, announced_index,
                    "fragment disagrees with its announcement"
                );
            }
        }
        let Some(slot) = transfer.slots.get_mut(index as usize) else {
            tracing::warn!(%file_id, index, total = transfer.total_chunks, "fragment index out of range");
            return;
        };
        if slot.is_some() {
            tracing::warn!(%file_id, index, "duplicate fragment, keeping the first");
            return;
        }
        *slot = Some(payload);
        transfer.received += 1;

        let percent = transfer.received as f32 / transfer.total_chunks as f32 * 100.0;
        let file_name = transfer.meta.name.clone();
        self.emit(UiEvent::TransferProgress {
            file_name,
            percent,
            is_sending: false,
        })
        .await;
    }

    /// The sender declared the file complete: reassemble and persist, or
    /// abort if fragments are missing. Partial files are never written.
    async fn finish_incoming(&mut self, file_id: Uuid) {
        let Some(transfer) = self.incoming.remove(&file_id) else {
            tracing::debug!(%file_id, "file-end for unknown file, ignoring");
            return;
        };

        if transfer.received != transfer.total_chunks {
            tracing::warn!(
                %file_id,
                received = transfer.received,
                total = transfer.total_chunks,
                "transfer ended incomplete"
            );
            self.emit(UiEvent::TransferAborted {
                file_name: transfer.meta.name,
                reason: format!(
                    "missing fragments ({} of {})",
                    transfer.received, transfer.total_chunks
                ),
            })
            .await;
            return;
        }

        // Sized from what actually arrived, never from declared metadata.
        let total_len = transfer.slots.iter().flatten().map(|b| b.len()).sum();
        let mut contents = Vec::with_capacity(total_len);
        for payload in transfer.slots.into_iter().flatten() {
            contents.extend_from_slice(&payload);
        }

        let Some(path) = self.store.pick_save_location(&transfer.meta.name).await else {
            self.emit(UiEvent::Status(format!(
                "save of {} declined",
                transfer.meta.name
            )))
            .await;
            return;
        };
        match self.store.write_file(&path, &contents).await {
            Ok(()) => {
                if transfer.total_chunks == 0 {
                    self.emit(UiEvent::TransferProgress {
                        file_name: transfer.meta.name.clone(),
                        percent: 100.0,
                        is_sending: false,
                    })
                    .await;
                }
                tracing::info!(file = %transfer.meta.name, path = %path.display(), "file saved");
                self.emit(UiEvent::FileArrived {
                    name: transfer.meta.name.clone(),
                    mime_type: transfer.meta.mime_type,
                    saved_path: path,
                    size: contents.len() as u64,
                })
                .await;
                self.emit(UiEvent::TransferCompleted {
                    file_name: transfer.meta.name,
                })
                .await;
            }
            Err(e) => {
                self.emit(UiEvent::Error(format!(
                    "could not save {}: {e}",
                    transfer.meta.name
                )))
                .await;
            }
        }
    }

    /// Discard every in-flight transfer, outbound and inbound. Nothing
    /// partial survives.
    async fn abort_all(&mut self, reason: &str) {
        if let Some(out) = self.outgoing.take() {
            self.emit(UiEvent::TransferAborted {
                file_name: out.meta.name,
                reason: reason.to_string(),
            })
            .await;
        }
        self.send_queue.clear();
        for (_, transfer) in self.incoming.drain().collect::<Vec<_>>() {
            self.emit(UiEvent::TransferAborted {
                file_name: transfer.meta.name,
                reason: reason.to_string(),
            })
            .await;
        }
    }

    async fn emit(&self, event: UiEvent) {
        let _ = self.event_tx.send(event).await;
    }
}

async fn open_readable(path: &std::path::Path) -> std::io::Result<(tokio::fs::File, u64)> {
    let file = tokio::fs::File::open(path).await?;
    let size = file.metadata().await?.len();
    Ok((file, size))
}
