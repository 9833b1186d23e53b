//! Failure-path tests: incomplete transfers must never leave a partial
//! file behind, and stray control frames must not wedge the engine.

use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use portal_core::UiEvent;
use portal_core::channel::memory;
use portal_core::channel::{ChannelPair, DataChannel};
use portal_core::transfer::protocol::{self, CHUNK_SIZE, ControlMsg};
use portal_core::transfer::{DownloadDirStore, EngineCommand, TransferEngine};

fn temp_dir(tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!("portal_{tag}_{}", Uuid::new_v4()))
}

/// One receiving engine plus the raw sending side of its channel. The
/// command sender is returned so the engine does not shut down while a
/// test is still feeding it frames.
fn receiver(
    tag: &str,
) -> (
    ChannelPair<memory::MemoryLink, memory::MemoryFrames>,
    mpsc::Receiver<UiEvent>,
    PathBuf,
    mpsc::UnboundedSender<EngineCommand>,
) {
    let (sender_pair, receiver_pair) = memory::pair();
    let downloads = temp_dir(tag);
    let (event_tx, events) = mpsc::channel(100);
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let engine = TransferEngine::new(
        receiver_pair,
        DownloadDirStore::new(downloads.clone()),
        event_tx,
    );
    tokio::spawn(engine.run(cmd_rx, CancellationToken::new()));
    (sender_pair, events, downloads, cmd_tx)
}

fn send_control(link: &mut memory::MemoryLink, msg: &ControlMsg) {
    let json = serde_json::to_string(msg).expect("encode");
    link.send_text(json).expect("send");
}

async fn next_event(events: &mut mpsc::Receiver<UiEvent>) -> UiEvent {
    tokio::time::timeout(Duration::from_secs(10), events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

fn file_start(file_id: Uuid, size: u64, total_chunks: u32) -> ControlMsg {
    ControlMsg::FileStart {
        file_id,
        name: "half.bin".to_string(),
        size,
        mime_type: "application/octet-stream".to_string(),
        total_chunks,
    }
}

#[tokio::test]
async fn channel_loss_mid_transfer_aborts_without_a_partial_file() {
    let (mut sender, mut events, downloads, _cmd_tx) = receiver("channel_loss");
    let file_id = Uuid::new_v4();

    send_control(&mut sender.link, &file_start(file_id, 4 * CHUNK_SIZE as u64, 4));
    for index in 0..2u32 {
        let payload = vec![index as u8; CHUNK_SIZE];
        sender
            .link
            .send_binary(protocol::encode_fragment(file_id, index, &payload))
            .expect("fragment");
    }

    // Sender vanishes: the engine must discard the half-received file.
    drop(sender);

    let aborted = loop {
        match next_event(&mut events).await {
            UiEvent::TransferAborted { file_name, .. } => break file_name,
            UiEvent::TransferProgress { .. } => {}
            other => panic!("unexpected event: {other:?}"),
        }
    };
    assert_eq!(aborted, "half.bin");
    assert!(
        !downloads.join("half.bin").exists(),
        "partial file must not be persisted"
    );
}

#[tokio::test]
async fn file_end_with_missing_fragments_aborts() {
    let (mut sender, mut events, downloads, _cmd_tx) = receiver("incomplete");
    let file_id = Uuid::new_v4();

    send_control(&mut sender.link, &file_start(file_id, 4 * CHUNK_SIZE as u64, 4));
    sender
        .link
        .send_binary(protocol::encode_fragment(file_id, 0, &vec![7u8; CHUNK_SIZE]))
        .expect("fragment");
    send_control(&mut sender.link, &ControlMsg::FileEnd { file_id });

    let reason = loop {
        match next_event(&mut events).await {
            UiEvent::TransferAborted { reason, .. } => break reason,
            UiEvent::TransferProgress { .. } => {}
            other => panic!("unexpected event: {other:?}"),
        }
    };
    assert!(reason.contains("1 of 4"), "reason was {reason:?}");
    assert!(!downloads.join("half.bin").exists());
}

#[tokio::test]
async fn file_end_for_an_unknown_file_is_ignored() {
    let (mut sender, mut events, downloads, _cmd_tx) = receiver("unknown_end");

    // A stray file-end must not produce an abort or kill the engine.
    send_control(
        &mut sender.link,
        &ControlMsg::FileEnd {
            file_id: Uuid::new_v4(),
        },
    );

    // A normal transfer afterwards still works.
    let file_id = Uuid::new_v4();
    let payload = b"still alive".to_vec();
    send_control(&mut sender.link, &file_start(file_id, payload.len() as u64, 1));
    sender
        .link
        .send_binary(protocol::encode_fragment(file_id, 0, &payload))
        .expect("fragment");
    send_control(&mut sender.link, &ControlMsg::FileEnd { file_id });

    loop {
        match next_event(&mut events).await {
            UiEvent::FileArrived { size, .. } => {
                assert_eq!(size, payload.len() as u64);
                break;
            }
            UiEvent::TransferProgress { .. } => {}
            UiEvent::TransferAborted { reason, .. } => {
                panic!("stray file-end caused an abort: {reason}")
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    tokio::fs::remove_dir_all(&downloads).await.ok();
}

#[tokio::test]
async fn duplicate_and_out_of_range_fragments_are_dropped() {
    let (mut sender, mut events, downloads, _cmd_tx) = receiver("dup_frag");
    let file_id = Uuid::new_v4();
    let first = vec![1u8; CHUNK_SIZE];
    let second = vec![2u8; 16];

    send_control(
        &mut sender.link,
        &file_start(file_id, (CHUNK_SIZE + 16) as u64, 2),
    );
    let frag = protocol::encode_fragment(file_id, 0, &first);
    sender.link.send_binary(frag.clone()).expect("fragment");
    // Duplicate of slot 0 and a fragment past the end: both ignored.
    sender.link.send_binary(frag).expect("duplicate");
    sender
        .link
        .send_binary(protocol::encode_fragment(file_id, 9, &second))
        .expect("out of range");
    sender
        .link
        .send_binary(protocol::encode_fragment(file_id, 1, &second))
        .expect("fragment");
    send_control(&mut sender.link, &ControlMsg::FileEnd { file_id });

    let saved_path = loop {
        match next_event(&mut events).await {
            UiEvent::FileArrived { saved_path, .. } => break saved_path,
            UiEvent::TransferProgress { .. } => {}
            UiEvent::TransferAborted { reason, .. } => panic!("aborted: {reason}"),
            other => panic!("unexpected event: {other:?}"),
        }
    };

    let saved = tokio::fs::read(&saved_path).await.expect("saved");
    let mut expected = first;
    expected.extend_from_slice(&second);
    assert_eq!(saved, expected);

    tokio::fs::remove_dir_all(&downloads).await.ok();
}

#[tokio::test]
async fn hostile_file_start_metadata_is_ignored() {
    let (mut sender, mut events, downloads, _cmd_tx) = receiver("hostile_meta");

    // A declared size of u64::MAX must not reserve anything, and the
    // matching file-end must pass through as an unknown-file no-op.
    let bogus = Uuid::new_v4();
    send_control(&mut sender.link, &file_start(bogus, u64::MAX, 0));
    send_control(&mut sender.link, &ControlMsg::FileEnd { file_id: bogus });

    // A chunk count that disagrees with the size is just as dead.
    let bogus = Uuid::new_v4();
    send_control(&mut sender.link, &file_start(bogus, 10, u32::MAX));
    send_control(&mut sender.link, &ControlMsg::FileEnd { file_id: bogus });

    // The engine is still alive and a well-formed transfer completes.
    let file_id = Uuid::new_v4();
    let payload = b"survived".to_vec();
    send_control(&mut sender.link, &file_start(file_id, payload.len() as u64, 1));
    sender
        .link
        .send_binary(protocol::encode_fragment(file_id, 0, &payload))
        .expect("fragment");
    send_control(&mut sender.link, &ControlMsg::FileEnd { file_id });

    loop {
        match next_event(&mut events).await {
            UiEvent::FileArrived { size, .. } => {
                assert_eq!(size, payload.len() as u64);
                break;
            }
            UiEvent::TransferProgress { .. } => {}
            UiEvent::TransferAborted { reason, .. } => {
                panic!("hostile metadata caused an abort: {reason}")
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    tokio::fs::remove_dir_all(&downloads).await.ok();
}
