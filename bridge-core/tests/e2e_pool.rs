//! Session pool acquire/release bookkeeping and wait-timeout behavior
//! (spec §8, invariants 2-3, end-to-end scenario 4).

use bridge_core::session::{PoolManager, Session};
use std::time::Duration;

#[tokio::test]
async fn in_use_count_tracks_outstanding_acquires() {
    let pools = PoolManager::new();
    pools.add(Session::new("s1".into(), "m1".into(), "gpt-4o".into())).await;
    pools.add(Session::new("s2".into(), "m2".into(), "gpt-4o".into())).await;

    let snap = pools.snapshot("gpt-4o").await.unwrap();
    assert_eq!(snap.available, 2);
    assert_eq!(snap.in_use, 0);

    let a = pools.acquire("gpt-4o", Duration::from_millis(50)).await.unwrap();
    let snap = pools.snapshot("gpt-4o").await.unwrap();
    assert_eq!(snap.available, 1);
    assert_eq!(snap.in_use, 1);

    let b = pools.acquire("gpt-4o", Duration::from_millis(50)).await.unwrap();
    let snap = pools.snapshot("gpt-4o").await.unwrap();
    assert_eq!(snap.available, 0);
    assert_eq!(snap.in_use, 2);

    pools.release("gpt-4o", &a.session_id).await;
    let snap = pools.snapshot("gpt-4o").await.unwrap();
    assert_eq!(snap.available, 1);
    assert_eq!(snap.in_use, 1);

    pools.release("gpt-4o", &b.session_id).await;
    let snap = pools.snapshot("gpt-4o").await.unwrap();
    assert_eq!(snap.available, 2);
    assert_eq!(snap.in_use, 0);
}

#[tokio::test]
async fn mark_unhealthy_removes_a_session_from_circulation() {
    let pools = PoolManager::new();
    pools.add(Session::new("s1".into(), "m1".into(), "claude".into())).await;

    let s = pools.acquire("claude", Duration::from_millis(50)).await.unwrap();
    pools.mark_unhealthy("claude", &s.session_id).await;

    let snap = pools.snapshot("claude").await.unwrap();
    assert_eq!(snap.available, 0);
    assert_eq!(snap.unhealthy, 1);

    let retry = pools.acquire("claude", Duration::from_millis(50)).await;
    assert!(retry.is_none(), "an unhealthy session must never be handed back out");
}

#[tokio::test]
async fn second_acquire_on_a_one_session_pool_times_out_without_acquiring() {
    let pools = PoolManager::new();
    pools.add(Session::new("only".into(), "m1".into(), "gpt-4o".into())).await;

    let held = pools.acquire("gpt-4o", Duration::from_millis(50)).await.unwrap();

    let second = pools.acquire("gpt-4o", Duration::from_millis(100)).await;
    assert!(second.is_none());

    let snap = pools.snapshot("gpt-4o").await.unwrap();
    assert_eq!(snap.in_use, 1, "the timed-out waiter must not count as in-use");

    pools.release("gpt-4o", &held.session_id).await;
    let snap = pools.snapshot("gpt-4o").await.unwrap();
    assert_eq!(snap.available, 1);
}

#[tokio::test]
async fn release_wakes_a_parked_waiter() {
    let pools = std::sync::Arc::new(PoolManager::new());
    pools.add(Session::new("only".into(), "m1".into(), "gpt-4o".into())).await;

    let held = pools.acquire("gpt-4o", Duration::from_millis(50)).await.unwrap();

    let waiter_pools = pools.clone();
    let waiter = tokio::spawn(async move { waiter_pools.acquire("gpt-4o", Duration::from_secs(2)).await });

    tokio::time::sleep(Duration::from_millis(20)).await;
    pools.release("gpt-4o", &held.session_id).await;

    let woken = waiter.await.unwrap();
    assert!(woken.is_some(), "the waiter should be woken by the release, not time out");
}

#[tokio::test]
async fn acquiring_an_unregistered_model_returns_none_rather_than_panicking() {
    let pools = PoolManager::new();
    let result = pools.acquire("never-seen-model", Duration::from_millis(20)).await;
    assert!(result.is_none());
}
