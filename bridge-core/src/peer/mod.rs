//! Peer link: the single WebSocket connection to the browser tab (spec §3,
//! §4.E). This module only owns message shapes and the one-connection-at-a-
//! time handle; the actual WebSocket upgrade and socket read/write loop
//! live in the HTTP layer, which drives this type.

pub mod heartbeat;

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::{mpsc, Mutex};

/// Messages the bridge sends to the peer. Tagged on `type` to match the
/// browser user-script's dispatch table.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum OutboundPeerMessage {
    #[serde(rename = "retry_request")]
    RetryRequest {
        #[serde(rename = "requestId")]
        request_id: String,
        payload: serde_json::Value,
        #[serde(rename = "filesToUpload")]
        files_to_upload: Vec<serde_json::Value>,
    },
    #[serde(rename = "warmup_session")]
    WarmupSession {
        #[serde(rename = "requestId")]
        request_id: String,
        #[serde(rename = "modelName")]
        model_name: String,
        payload: serde_json::Value,
        #[serde(rename = "filesToUpload")]
        files_to_upload: Vec<serde_json::Value>,
    },
    #[serde(rename = "refresh_models")]
    RefreshModels,
    #[serde(rename = "refresh")]
    Refresh,
    #[serde(rename = "activate_id_capture")]
    ActivateIdCapture,
    #[serde(rename = "send_page_source")]
    SendPageSource,
    #[serde(rename = "abort_request")]
    AbortRequest {
        #[serde(rename = "requestId")]
        request_id: String,
    },
    #[serde(rename = "ping")]
    Ping { timestamp: u64 },
    #[serde(rename = "restoration_ack")]
    RestorationAck {
        #[serde(rename = "restoredCount")]
        restored_count: usize,
    },
    #[serde(rename = "model_registry_ack")]
    ModelRegistryAck,
}

/// Messages the peer sends to the bridge.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum InboundPeerMessage {
    Tagged(TaggedInbound),
    /// `{requestId, data}` — the common case: a raw per-request chunk.
    RequestChunk {
        #[serde(rename = "requestId")]
        request_id: String,
        data: serde_json::Value,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum TaggedInbound {
    #[serde(rename = "pong")]
    Pong { timestamp: u64 },
    #[serde(rename = "reconnection_handshake")]
    ReconnectionHandshake {
        #[serde(rename = "pendingRequestIds")]
        pending_request_ids: Vec<String>,
    },
    #[serde(rename = "session_created")]
    SessionCreated {
        #[serde(rename = "sessionId")]
        session_id: String,
        #[serde(rename = "messageId")]
        message_id: String,
        #[serde(rename = "modelName")]
        model_name: String,
    },
    #[serde(rename = "model_registry")]
    ModelRegistry { models: serde_json::Value },
}

/// Serialize an outbound message to the wire text form.
pub fn encode(msg: &OutboundPeerMessage) -> String {
    serde_json::to_string(msg).expect("outbound peer messages always serialize")
}

/// Holds the current connection's outbound sender. Exactly one connection
/// is live at a time; attaching a new one replaces (and the caller is told
/// to close) the old one, matching "a second connection while connected
/// closes the older" (spec §3, §4.E).
pub struct PeerLink {
    sender: Mutex<Option<mpsc::UnboundedSender<String>>>,
    heartbeat_misses: AtomicU32,
}

impl PeerLink {
    pub fn new() -> Self {
        Self {
            sender: Mutex::new(None),
            heartbeat_misses: AtomicU32::new(0),
        }
    }

    /// Install a new connection's outbound sender. Returns the previous
    /// sender, if any, so the caller can drop it (closing that socket).
    pub async fn attach(&self, sender: mpsc::UnboundedSender<String>) -> Option<mpsc::UnboundedSender<String>> {
        self.heartbeat_misses.store(0, Ordering::SeqCst);
        self.sender.lock().await.replace(sender)
    }

    /// Clear the current connection. A no-op if `current` no longer matches
    /// (a newer connection already replaced it).
    pub async fn detach(&self, current: &mpsc::UnboundedSender<String>) {
        let mut guard = self.sender.lock().await;
        if let Some(existing) = guard.as_ref() {
            if existing.same_channel(current) {
                *guard = None;
            }
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.sender.lock().await.is_some()
    }

    pub async fn send(&self, msg: &OutboundPeerMessage) -> bool {
        let guard = self.sender.lock().await;
        match guard.as_ref() {
            Some(sender) => sender.send(encode(msg)).is_ok(),
            None => false,
        }
    }

    /// Called on a missed heartbeat pong. Returns the updated miss count.
    pub fn record_miss(&self) -> u32 {
        self.heartbeat_misses.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn reset_misses(&self) {
        self.heartbeat_misses.store(0, Ordering::SeqCst);
    }
}

impl Default for PeerLink {
    fn default() -> Self {
        Self::new()
    }
}
