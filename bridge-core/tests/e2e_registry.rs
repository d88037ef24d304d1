//! No-cross-talk and acquire/release bookkeeping properties (spec §8,
//! invariants 1-3).

use bridge_core::registry::{PeerChunk, RequestRegistry};
use std::time::Duration;
use tokio::sync::mpsc;

#[tokio::test]
async fn chunks_route_to_the_right_request_only() {
    let registry = RequestRegistry::new(10);

    let (tx_a, mut rx_a) = mpsc::channel(8);
    let (tx_b, mut rx_b) = mpsc::channel(8);
    registry.add("req-a", "gpt-4o", true, tx_a).await.unwrap();
    registry.add("req-b", "gpt-4o", true, tx_b).await.unwrap();

    assert!(registry.route_chunk("req-a", PeerChunk::Data("for-a-1".into())).await);
    assert!(registry.route_chunk("req-b", PeerChunk::Data("for-b-1".into())).await);
    assert!(registry.route_chunk("req-a", PeerChunk::Data("for-a-2".into())).await);

    let a1 = rx_a.recv().await.unwrap();
    let a2 = rx_a.recv().await.unwrap();
    let b1 = rx_b.recv().await.unwrap();

    assert!(matches!(a1, PeerChunk::Data(s) if s == "for-a-1"));
    assert!(matches!(a2, PeerChunk::Data(s) if s == "for-a-2"));
    assert!(matches!(b1, PeerChunk::Data(s) if s == "for-b-1"));
}

#[tokio::test]
async fn routing_to_unknown_id_reports_failure_without_panicking() {
    let registry = RequestRegistry::new(10);
    let delivered = registry.route_chunk("never-registered", PeerChunk::Done).await;
    assert!(!delivered);
}

#[tokio::test]
async fn complete_removes_the_entry_and_future_chunks_are_rejected() {
    let registry = RequestRegistry::new(10);
    let (tx, mut rx) = mpsc::channel(8);
    registry.add("req-1", "gpt-4o", false, tx).await.unwrap();

    registry.complete("req-1").await;
    assert!(!registry.contains("req-1").await);

    // The terminal Done is still delivered to whoever was listening.
    let chunk = rx.recv().await.unwrap();
    assert!(matches!(chunk, PeerChunk::Done));

    assert!(!registry.route_chunk("req-1", PeerChunk::Data("late".into())).await);
}

#[tokio::test]
async fn registry_rejects_new_requests_once_at_capacity() {
    let registry = RequestRegistry::new(1);
    let (tx1, _rx1) = mpsc::channel(4);
    let (tx2, _rx2) = mpsc::channel(4);

    registry.add("first", "gpt-4o", false, tx1).await.unwrap();
    let second = registry.add("second", "gpt-4o", false, tx2).await;
    assert!(second.is_err());
}

#[tokio::test]
async fn disconnect_then_reconnect_restores_pending_requests() {
    let registry = RequestRegistry::new(10);
    let (tx, mut rx) = mpsc::channel(8);
    registry.add("req-1", "gpt-4o", true, tx).await.unwrap();
    registry.mark_sent("req-1").await;
    registry.route_chunk("req-1", PeerChunk::Data("mid-stream".into())).await;
    rx.recv().await.unwrap();

    // Simulate a disconnect with a very long grace window so the watchdog
    // never fires during the test.
    registry.on_peer_disconnect(3600).await;
    assert!(registry.contains("req-1").await);

    let restored = registry.on_peer_reconnect(&["req-1".to_string()]).await;
    assert_eq!(restored, vec!["req-1".to_string()]);

    assert!(registry.route_chunk("req-1", PeerChunk::Done).await);
    let done = rx.recv().await.unwrap();
    assert!(matches!(done, PeerChunk::Done));
}

#[tokio::test]
async fn disconnect_watchdog_times_out_unclaimed_requests() {
    let registry = RequestRegistry::new(10);
    let (tx, mut rx) = mpsc::channel(8);
    registry.add("req-1", "gpt-4o", true, tx).await.unwrap();
    registry.mark_sent("req-1").await;

    registry.on_peer_disconnect(0).await;

    let chunk = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("watchdog should fire promptly")
        .expect("channel still open");
    assert!(matches!(chunk, PeerChunk::Error(_)));
    assert!(!registry.contains("req-1").await);
}
