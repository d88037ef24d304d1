//! Request registry: tracks in-flight requests by id, owns their response
//! channels, survives peer reconnects, enforces timeouts (spec §3, §4.D).

use crate::error::{BridgeError, BridgeResult};
use crate::session::now_millis;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    Pending,
    Sent,
    Processing,
    Completed,
    TimedOut,
    Errored,
}

/// What arrives on a request's response channel. The wire codec (parsing
/// `a0:`/`a2:`/`ad:` lines) runs on the consuming side; this channel only
/// carries the peer's raw per-request payloads plus the two terminal
/// sentinels the peer link can detect on its own.
#[derive(Debug, Clone)]
pub enum PeerChunk {
    Data(String),
    Error(String),
    Done,
}

struct Entry {
    status: RequestStatus,
    model_name: String,
    is_streaming: bool,
    #[allow(dead_code)]
    created_at: u64,
    #[allow(dead_code)]
    sent_at: Option<u64>,
    last_activity_at: u64,
    sender: mpsc::Sender<PeerChunk>,
    watchdog: Option<JoinHandle<()>>,
}

pub struct RequestRegistry {
    cap: usize,
    entries: Mutex<HashMap<String, Entry>>,
}

impl RequestRegistry {
    pub fn new(cap: usize) -> Arc<Self> {
        Arc::new(Self {
            cap,
            entries: Mutex::new(HashMap::new()),
        })
    }

    pub async fn add(
        &self,
        request_id: &str,
        model_name: &str,
        is_streaming: bool,
        sender: mpsc::Sender<PeerChunk>,
    ) -> BridgeResult<()> {
        let mut entries = self.entries.lock().await;
        if entries.len() >= self.cap {
            return Err(BridgeError::RegistryFull);
        }
        let now = now_millis();
        entries.insert(
            request_id.to_string(),
            Entry {
                status: RequestStatus::Pending,
                model_name: model_name.to_string(),
                is_streaming,
                created_at: now,
                sent_at: None,
                last_activity_at: now,
                sender,
                watchdog: None,
            },
        );
        Ok(())
    }

    pub async fn mark_sent(&self, request_id: &str) {
        let mut entries = self.entries.lock().await;
        if let Some(e) = entries.get_mut(request_id) {
            e.sent_at = Some(now_millis());
            e.status = RequestStatus::Sent;
        }
    }

    fn is_forward_transition(from: RequestStatus, to: RequestStatus) -> bool {
        use RequestStatus::*;
        to == from
            || matches!(
                (from, to),
                (Pending, Sent)
                    | (Pending, Processing)
                    | (Sent, Processing)
                    | (Sent, Completed)
                    | (Processing, Completed)
                    | (Pending, TimedOut)
                    | (Sent, TimedOut)
                    | (Processing, TimedOut)
                    | (Pending, Errored)
                    | (Sent, Errored)
                    | (Processing, Errored)
            )
    }

    pub async fn update_status(&self, request_id: &str, status: RequestStatus) {
        let mut entries = self.entries.lock().await;
        if let Some(e) = entries.get_mut(request_id) {
            if Self::is_forward_transition(e.status, status) {
                e.status = status;
            }
            e.last_activity_at = now_millis();
        }
    }

    /// Route one inbound chunk to the request's response channel. Returns
    /// false if the id is unknown (already evicted, or never existed).
    pub async fn route_chunk(&self, request_id: &str, chunk: PeerChunk) -> bool {
        let sender = {
            let mut entries = self.entries.lock().await;
            match entries.get_mut(request_id) {
                Some(e) => {
                    e.last_activity_at = now_millis();
                    if !matches!(
                        e.status,
                        RequestStatus::Completed | RequestStatus::TimedOut | RequestStatus::Errored
                    ) {
                        e.status = RequestStatus::Processing;
                    }
                    e.sender.clone()
                }
                None => return false,
            }
        };
        let _ = sender.send(chunk).await;
        true
    }

    async fn terminate(&self, request_id: &str, chunk: PeerChunk, status: RequestStatus) {
        let entry = {
            let mut entries = self.entries.lock().await;
            entries.remove(request_id)
        };
        if let Some(mut e) = entry {
            if let Some(handle) = e.watchdog.take() {
                handle.abort();
            }
            tracing::debug!(request_id, ?status, "terminating request");
            let _ = e.sender.send(chunk).await;
        }
    }

    pub async fn complete(&self, request_id: &str) {
        self.terminate(request_id, PeerChunk::Done, RequestStatus::Completed).await;
    }

    pub async fn timeout(&self, request_id: &str, timeout_secs: u64) {
        self.terminate(
            request_id,
            PeerChunk::Error(format!("timeout after {timeout_secs}s")),
            RequestStatus::TimedOut,
        )
        .await;
    }

    pub async fn fail(&self, request_id: &str, message: &str) {
        self.terminate(
            request_id,
            PeerChunk::Error(message.to_string()),
            RequestStatus::Errored,
        )
        .await;
    }

    /// Evict without pushing a terminal chunk — used on client cancellation,
    /// where the consumer has already dropped its end of the channel.
    pub async fn evict(&self, request_id: &str) {
        let mut entries = self.entries.lock().await;
        if let Some(mut e) = entries.remove(request_id) {
            if let Some(handle) = e.watchdog.take() {
                handle.abort();
            }
        }
    }

    /// On peer disconnect, in-flight (`sent`/`processing`) requests are not
    /// killed immediately: a watchdog is armed for each, so a browser reload
    /// (e.g. after a Cloudflare challenge) doesn't abort them outright.
    pub async fn on_peer_disconnect(self: &Arc<Self>, timeout_secs: u64) {
        let mut entries = self.entries.lock().await;
        let ids: Vec<String> = entries
            .iter()
            .filter(|(_, e)| matches!(e.status, RequestStatus::Sent | RequestStatus::Processing))
            .map(|(id, _)| id.clone())
            .collect();
        for id in ids {
            if let Some(e) = entries.get_mut(&id) {
                let registry = Arc::clone(self);
                let req_id = id.clone();
                e.watchdog = Some(tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_secs(timeout_secs)).await;
                    registry.timeout(&req_id, timeout_secs).await;
                }));
            }
        }
    }

    /// On peer reconnect, restore processing status for every id the peer
    /// says it still has pending, cancelling that request's watchdog.
    /// Returns the ids actually present in this registry.
    pub async fn on_peer_reconnect(&self, pending_ids: &[String]) -> Vec<String> {
        let mut entries = self.entries.lock().await;
        let mut restored = Vec::new();
        for id in pending_ids {
            if let Some(e) = entries.get_mut(id) {
                if let Some(handle) = e.watchdog.take() {
                    handle.abort();
                }
                e.status = RequestStatus::Processing;
                e.last_activity_at = now_millis();
                restored.push(id.clone());
            }
        }
        restored
    }

    pub async fn model_name(&self, request_id: &str) -> Option<String> {
        self.entries.lock().await.get(request_id).map(|e| e.model_name.clone())
    }

    pub async fn is_streaming(&self, request_id: &str) -> Option<bool> {
        self.entries.lock().await.get(request_id).map(|e| e.is_streaming)
    }

    pub async fn contains(&self, request_id: &str) -> bool {
        self.entries.lock().await.contains_key(request_id)
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
