//! End-to-end tests for host → guest drops.

mod common;

use std::time::Duration;

use common::{connect, test_config, RecordingTransport};
use dnd::protocol::{
    ActionSet, DndAction, FormatList, GuestMessage, HostMessage, MessageKind, ProgressState,
    MIME_TEXT_PLAIN, MIME_URI_LIST,
};
use dnd::transfer::encode_uri_list;
use dnd::{
    DndError, DndManager, GuestOptions, GuestRc, LoopbackGuest, ProgressOutcome, Target,
};

const WAIT: Duration = Duration::from_secs(5);

fn copy_only() -> ActionSet {
    [DndAction::Copy].into_iter().collect()
}

fn formats(list: &[&str]) -> FormatList {
    list.iter().copied().collect()
}

fn loopback(
    options: GuestOptions,
    staging: &std::path::Path,
) -> (std::sync::Arc<DndManager>, std::sync::Arc<LoopbackGuest>) {
    let guest = LoopbackGuest::new(options).unwrap();
    let manager = DndManager::new(test_config(staging), guest.clone());
    guest.attach(&manager).unwrap();
    (manager, guest)
}

async fn drop_files(version: u32) {
    let host_files = tempfile::tempdir().unwrap();
    let root = host_files.path().join("a");
    std::fs::create_dir(&root).unwrap();
    std::fs::write(root.join("b.txt"), b"hello").unwrap();

    let staging = tempfile::tempdir().unwrap();
    let guest_drop = tempfile::tempdir().unwrap();
    let options = GuestOptions::default()
        .with_protocol_version(version)
        .with_drop_dir(guest_drop.path());
    let (manager, guest) = loopback(options, staging.path());
    assert_eq!(manager.state().protocol_version(), version);

    let target = Target::new(&manager);
    let offered = formats(&[MIME_URI_LIST]);
    let action = target
        .enter(0, 5, 5, DndAction::Copy, copy_only(), &offered)
        .await
        .unwrap();
    assert_eq!(action, DndAction::Copy);

    let dropped = target
        .drop(0, 5, 5, DndAction::Copy, copy_only(), &offered)
        .await
        .unwrap();
    assert_eq!(dropped.format, MIME_URI_LIST);
    assert_eq!(dropped.action, DndAction::Copy);

    let uri_list = encode_uri_list([root.to_str().unwrap()]);
    let progress = target
        .send_data(0, &dropped.format, uri_list.into_bytes())
        .unwrap();
    assert_eq!(progress.wait_timeout(WAIT).await, Some(ProgressOutcome::Success));
    assert!(target.is_complete());

    let paths = guest.received_paths();
    assert_eq!(paths.len(), 1);
    assert!(paths[0].starts_with(guest_drop.path()));
    assert!(paths[0].ends_with("a"));
    assert_eq!(std::fs::read(paths[0].join("b.txt")).unwrap(), b"hello");
    assert_eq!(guest.stats().transfers_received, 1);
    assert_eq!(guest.stats().cancels, 0);
    if version >= 3 {
        assert_eq!(guest.received_objects(), (2, 2));
    }
}

#[tokio::test]
async fn test_drop_files_v3() {
    drop_files(3).await;
}

#[tokio::test]
async fn test_drop_files_v2() {
    drop_files(2).await;
}

#[tokio::test]
async fn test_drop_files_v1() {
    drop_files(1).await;
}

#[tokio::test]
async fn test_drop_text_in_small_blocks() {
    let staging = tempfile::tempdir().unwrap();
    let guest = LoopbackGuest::new(GuestOptions::default().with_block_size(8)).unwrap();
    let config = test_config(staging.path()).with_block_size(8);
    let manager = DndManager::new(config, guest.clone());
    guest.attach(&manager).unwrap();

    let target = Target::new(&manager);
    let offered = formats(&[MIME_TEXT_PLAIN]);
    target
        .enter(0, 0, 0, DndAction::Copy, copy_only(), &offered)
        .await
        .unwrap();
    let dropped = target
        .drop(0, 0, 0, DndAction::Copy, copy_only(), &offered)
        .await
        .unwrap();

    let text = b"a sentence longer than one block".to_vec();
    let progress = target.send_data(0, &dropped.format, text.clone()).unwrap();
    assert_eq!(progress.wait_timeout(WAIT).await, Some(ProgressOutcome::Success));
    assert_eq!(guest.received_data(), text);
}

#[tokio::test]
async fn test_guest_rejection_fails_send() {
    let staging = tempfile::tempdir().unwrap();
    // Guest chunks are smaller than the host's, so the first data chunk is refused.
    let options = GuestOptions::default().with_block_size(4);
    let (manager, guest) = loopback(options, staging.path());

    let target = Target::new(&manager);
    let offered = formats(&[MIME_TEXT_PLAIN]);
    let dropped = target
        .drop(0, 0, 0, DndAction::Copy, copy_only(), &offered)
        .await
        .unwrap();

    let progress = target
        .send_data(0, &dropped.format, b"too big for the guest".to_vec())
        .unwrap();
    match progress.wait_timeout(WAIT).await {
        Some(ProgressOutcome::Failed { rc, .. }) => assert_eq!(rc, GuestRc::INVALID_PARAMETER),
        other => panic!("expected failure, got {other:?}"),
    }
    assert!(guest.received_data().is_empty());
}

/// Host cancel while the guest is still pulling data
#[tokio::test]
async fn test_cancel_mid_transfer() {
    let staging = tempfile::tempdir().unwrap();
    let transport = RecordingTransport::new();
    let manager = connect(&transport, test_config(staging.path()), 3);
    let target = Target::new(&manager);

    let progress = target
        .send_data(0, MIME_TEXT_PLAIN, vec![b'z'; 256 * 1024])
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(target.is_pending());
    assert_eq!(transport.count(MessageKind::HgSendDataHeader), 1);

    target.cancel().unwrap();
    target.cancel().unwrap();
    let outcome = progress.wait_timeout(Duration::from_millis(500)).await;
    assert_eq!(outcome, Some(ProgressOutcome::Cancelled));
    assert_eq!(progress.percent(), 100);
    assert_eq!(transport.count(MessageKind::HgCancel), 1);
    assert!(!target.is_complete());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_guest_error_releases_target() {
    let staging = tempfile::tempdir().unwrap();
    let transport = RecordingTransport::new();
    let config = test_config(staging.path()).with_poll_slice(Duration::from_millis(500));
    let manager = connect(&transport, config, 3);
    let target = Target::new(&manager);

    let progress = target
        .send_data(0, MIME_TEXT_PLAIN, vec![b'z'; 256 * 1024])
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(target.is_pending());

    let guest = manager.clone();
    std::thread::spawn(move || {
        guest.notify_dispatcher(&GuestMessage::HgProgress {
            status: ProgressState::Error,
            percent: 3,
            rc: GuestRc::DISK_FULL,
        })
    })
    .join()
    .unwrap()
    .unwrap();

    match progress.wait_timeout(WAIT).await {
        Some(ProgressOutcome::Failed { rc, .. }) => assert_eq!(rc, GuestRc::DISK_FULL),
        other => panic!("expected failure, got {other:?}"),
    }
    assert!(!target.is_pending());
    assert_eq!(manager.pending_transfers(), 0);

    let retry = target.send_data(0, MIME_TEXT_PLAIN, b"again".to_vec()).unwrap();
    target.cancel().unwrap();
    assert_eq!(retry.wait_timeout(WAIT).await, Some(ProgressOutcome::Cancelled));
}

#[tokio::test]
async fn test_guest_must_request_one_format() {
    let staging = tempfile::tempdir().unwrap();
    let transport = RecordingTransport::scripted(|manager, msg| {
        let reply = match msg {
            HostMessage::Enter(_) | HostMessage::Move(_) => GuestMessage::HgAckAction {
                action: DndAction::Copy,
            },
            HostMessage::Drop(ev) => GuestMessage::HgRequestData {
                formats: ev.formats.to_wire(),
            },
            _ => return,
        };
        manager.notify_dispatcher(&reply).unwrap();
    });
    let manager = connect(&transport, test_config(staging.path()), 3);
    let target = Target::new(&manager);

    let two = formats(&[MIME_TEXT_PLAIN, "text/html"]);
    let err = target
        .drop(0, 0, 0, DndAction::Copy, copy_only(), &two)
        .await
        .unwrap_err();
    assert!(matches!(err, DndError::InvalidGuestFormats(2)));

    let one = formats(&["text/html"]);
    let dropped = target
        .drop(0, 0, 0, DndAction::Copy, copy_only(), &one)
        .await
        .unwrap();
    assert_eq!(dropped.format, "text/html");
}

#[tokio::test]
async fn test_enter_without_allowed_action_is_noop() {
    let staging = tempfile::tempdir().unwrap();
    let transport = RecordingTransport::new();
    let manager = connect(&transport, test_config(staging.path()), 3);
    let target = Target::new(&manager);

    let action = target
        .enter(
            0,
            0,
            0,
            DndAction::Copy,
            ActionSet::NONE,
            &formats(&[MIME_TEXT_PLAIN]),
        )
        .await
        .unwrap();
    assert_eq!(action, DndAction::Ignore);
    assert!(transport.sent().is_empty());
}

#[tokio::test]
async fn test_screen_offset_applied() {
    let staging = tempfile::tempdir().unwrap();
    let transport = RecordingTransport::scripted(|manager, msg| {
        if let HostMessage::Enter(_) = msg {
            manager
                .notify_dispatcher(&GuestMessage::HgAckAction {
                    action: DndAction::Copy,
                })
                .unwrap();
        }
    });
    let manager = connect(&transport, test_config(staging.path()), 3);
    let target = Target::new(&manager);
    target.set_screen_offset(1, 1920, 0);

    target
        .enter(1, 10, 20, DndAction::Copy, copy_only(), &formats(&[MIME_TEXT_PLAIN]))
        .await
        .unwrap();
    target.leave().unwrap();

    let sent = transport.sent();
    let HostMessage::Enter(ev) = &sent[0] else {
        panic!("expected enter, got {:?}", sent[0]);
    };
    assert_eq!((ev.x, ev.y), (1930, 20));
    assert_eq!(sent[1], HostMessage::Leave);
}

#[tokio::test]
async fn test_unanswered_enter_times_out() {
    let staging = tempfile::tempdir().unwrap();
    let transport = RecordingTransport::new();
    let config = test_config(staging.path()).with_ack_timeout(Duration::from_millis(50));
    let manager = connect(&transport, config, 3);
    let target = Target::new(&manager);

    let err = target
        .enter(0, 0, 0, DndAction::Copy, copy_only(), &formats(&[MIME_TEXT_PLAIN]))
        .await
        .unwrap_err();
    assert!(matches!(err, DndError::Timeout(_)));
}

#[tokio::test]
async fn test_extra_targets_block_sends() {
    let staging = tempfile::tempdir().unwrap();
    let transport = RecordingTransport::new();
    let manager = connect(&transport, test_config(staging.path()), 3);
    let targets: Vec<Target> = (0..3).map(|_| Target::new(&manager)).collect();
    assert_eq!(manager.target_count(), 3);

    for target in &targets {
        let err = target
            .send_data(0, MIME_TEXT_PLAIN, b"hi".to_vec())
            .unwrap_err();
        assert!(matches!(err, DndError::AlreadyInProgress));
        assert!(!target.is_pending());
    }
    assert!(transport.sent().is_empty());
}

#[tokio::test]
async fn test_oversized_raw_payload_refused() {
    let staging = tempfile::tempdir().unwrap();
    let transport = RecordingTransport::new();
    let mut config = test_config(staging.path());
    config.transfer.max_meta_size = 16;
    let manager = connect(&transport, config, 3);
    let target = Target::new(&manager);

    let err = target
        .send_data(0, MIME_TEXT_PLAIN, vec![0; 17])
        .unwrap_err();
    assert!(matches!(err, DndError::BufferOverflow { requested: 17, limit: 16 }));
    assert!(!target.is_pending());
    assert!(transport.sent().is_empty());
}
