use yaba_sync::{ProgressTracker, SyncError, SyncProgress};

#[test]
fn phases_only_move_forward() {
    let tracker = ProgressTracker::new();
    assert_eq!(tracker.current(), SyncProgress::Initializing);

    tracker.advance(SyncProgress::ExchangingDeleteLogs).unwrap();
    tracker.advance(SyncProgress::ReceivingData).unwrap();
    let err = tracker.advance(SyncProgress::SendingData).unwrap_err();
    assert!(matches!(err, SyncError::Protocol(ref m) if m.contains("receiving data")));
    assert!(tracker.advance(SyncProgress::ReceivingData).is_err());
    assert_eq!(tracker.current(), SyncProgress::ReceivingData);
}

#[test]
fn terminal_phases_are_final() {
    let tracker = ProgressTracker::new();
    tracker.advance(SyncProgress::Completed).unwrap();
    tracker.fail("too late");
    assert_eq!(tracker.current(), SyncProgress::Completed);
    assert!(tracker.advance(SyncProgress::Error("x".into())).is_err());

    let failed = ProgressTracker::new();
    failed.advance(SyncProgress::SendingData).unwrap();
    failed.fail("peer went away");
    assert_eq!(failed.current(), SyncProgress::Error("peer went away".into()));
    assert!(failed.advance(SyncProgress::Completed).is_err());
}

#[test]
fn error_is_reachable_from_any_open_phase() {
    let open = [
        SyncProgress::Initializing,
        SyncProgress::ExchangingDeleteLogs,
        SyncProgress::SendingData,
        SyncProgress::ReceivingData,
        SyncProgress::MergingData,
    ];
    for phase in open {
        assert!(phase.can_advance_to(&SyncProgress::Error("boom".into())), "{phase}");
        assert!(!phase.is_terminal());
    }
}

#[test]
fn display_names_the_phase() {
    assert_eq!(SyncProgress::MergingData.to_string(), "merging data");
    assert_eq!(SyncProgress::Error("timeout".into()).to_string(), "error: timeout");
}

#[tokio::test]
async fn subscribers_see_updates() {
    let tracker = ProgressTracker::new();
    let mut rx = tracker.subscribe();
    tracker.advance(SyncProgress::SendingData).unwrap();
    rx.changed().await.unwrap();
    assert_eq!(*rx.borrow(), SyncProgress::SendingData);
}
