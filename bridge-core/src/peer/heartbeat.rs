//! Heartbeat: ping the peer every 30s, but only count a pong as missed once
//! 60s have passed with no reply, surfacing a disconnect event after three
//! consecutive misses (spec §4.E).

use super::{OutboundPeerMessage, PeerLink};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

pub const PING_INTERVAL: Duration = Duration::from_secs(30);
pub const PONG_TIMEOUT: Duration = Duration::from_secs(60);
pub const MAX_CONSECUTIVE_MISSES: u32 = 3;

#[derive(Debug, Clone)]
pub enum HeartbeatEvent {
    MissedPong { consecutive_misses: u32 },
    PeerUnresponsive,
}

/// Tracks whether a pong has arrived since the last ping cycle started, and
/// when that cycle started — so the loop can tell a 30s ping cadence apart
/// from the independent 60s window a pong is allowed to arrive within. Owned
/// by the caller alongside a [`PeerLink`] and updated from the inbound
/// message loop via [`Tracker::record_pong`].
pub struct Tracker {
    pong_pending: AtomicBool,
    pending_since: Mutex<Option<Instant>>,
}

impl Tracker {
    pub fn new() -> Self {
        Self { pong_pending: AtomicBool::new(false), pending_since: Mutex::new(None) }
    }

    pub fn record_pong(&self) {
        self.pong_pending.store(false, Ordering::SeqCst);
        *self.pending_since.lock().unwrap() = None;
    }

    fn begin_pending(&self) {
        self.pong_pending.store(true, Ordering::SeqCst);
        *self.pending_since.lock().unwrap() = Some(Instant::now());
    }

    fn pending_elapsed(&self) -> Duration {
        self.pending_since.lock().unwrap().map(|t| t.elapsed()).unwrap_or_default()
    }
}

impl Default for Tracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Run the heartbeat loop until the task is aborted (e.g. on server
/// shutdown). Emits [`HeartbeatEvent`]s on `events` so the caller can log,
/// update metrics, and treat the peer as disconnected after three misses.
pub async fn run(link: Arc<PeerLink>, tracker: Arc<Tracker>, events: mpsc::UnboundedSender<HeartbeatEvent>) {
    let mut interval = tokio::time::interval(PING_INTERVAL);
    interval.tick().await; // first tick fires immediately; consume it

    loop {
        interval.tick().await;

        if !link.is_connected().await {
            link.reset_misses();
            tracker.record_pong();
            continue;
        }

        let still_pending = tracker.pong_pending.load(Ordering::SeqCst);
        if still_pending {
            if tracker.pending_elapsed() >= PONG_TIMEOUT {
                let misses = link.record_miss();
                let _ = events.send(HeartbeatEvent::MissedPong { consecutive_misses: misses });
                if misses >= MAX_CONSECUTIVE_MISSES {
                    let _ = events.send(HeartbeatEvent::PeerUnresponsive);
                }
                // Start a fresh 60s window for the next check rather than
                // re-triggering a miss every 30s tick while still unanswered.
                tracker.begin_pending();
            }
        } else {
            link.reset_misses();
            tracker.begin_pending();
        }

        let timestamp = crate::session::now_millis();
        link.send(&OutboundPeerMessage::Ping { timestamp }).await;
    }
}
