//! `/ws` — the single peer connection (spec §4.E, §6).
//!
//! One browser tab at a time; a second upgrade while connected replaces
//! the first (its outbound channel is dropped, which ends its write task
//! and closes its socket half).

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use bridge_core::models::{ModelInfo, Modality};
use bridge_core::peer::{InboundPeerMessage, OutboundPeerMessage, TaggedInbound};
use bridge_core::registry::PeerChunk;
use bridge_core::session::Session;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::mpsc;

use crate::state::SharedBridge;

pub async fn ws_handler(State(bridge): State<SharedBridge>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, bridge))
}

async fn handle_socket(socket: WebSocket, bridge: SharedBridge) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();

    if let Some(previous) = bridge.peer.attach(outbound_tx.clone()).await {
        tracing::warn!("a new peer connection arrived while one was active; replacing it");
        drop(previous);
    } else {
        tracing::info!("peer connected");
        let warmup_bridge = bridge.clone();
        tokio::spawn(async move {
            crate::warmup::run(&warmup_bridge).await;
        });
    }

    let write_task = tokio::spawn(async move {
        while let Some(text) = outbound_rx.recv().await {
            if ws_tx.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = ws_rx.next().await {
        let Message::Text(text) = msg else { continue };
        dispatch_inbound(&bridge, &text).await;
    }

    bridge.peer.detach(&outbound_tx).await;
    write_task.abort();
    tracing::warn!("peer disconnected");
    bridge.registry.on_peer_disconnect(bridge.config.request_timeout_seconds).await;
}

async fn dispatch_inbound(bridge: &SharedBridge, text: &str) {
    let parsed: Result<InboundPeerMessage, _> = serde_json::from_str(text);
    match parsed {
        Ok(InboundPeerMessage::Tagged(TaggedInbound::Pong { .. })) => {
            bridge.heartbeat_tracker.record_pong();
        }
        Ok(InboundPeerMessage::Tagged(TaggedInbound::ReconnectionHandshake { pending_request_ids })) => {
            let restored = bridge.registry.on_peer_reconnect(&pending_request_ids).await;
            tracing::info!(restored = restored.len(), "reconnection handshake processed");
            bridge
                .peer
                .send(&OutboundPeerMessage::RestorationAck { restored_count: restored.len() })
                .await;
        }
        Ok(InboundPeerMessage::Tagged(TaggedInbound::SessionCreated { session_id, message_id, model_name })) => {
            bridge.pools.add(Session::new(session_id, message_id, model_name)).await;
        }
        Ok(InboundPeerMessage::Tagged(TaggedInbound::ModelRegistry { models })) => {
            apply_model_registry(bridge, models);
            bridge.peer.send(&OutboundPeerMessage::ModelRegistryAck).await;
        }
        Ok(InboundPeerMessage::RequestChunk { request_id, data }) => {
            route_request_chunk(bridge, &request_id, data).await;
        }
        Err(e) => {
            tracing::debug!(error = %e, raw = %text, "could not parse inbound peer message");
        }
    }
}

fn apply_model_registry(bridge: &SharedBridge, models: Value) {
    let Value::Object(map) = models else {
        tracing::warn!("model_registry payload was not an object; ignoring");
        return;
    };
    let mut registry = HashMap::with_capacity(map.len());
    for (public_name, info) in map {
        let upstream_id = info.get("id").and_then(Value::as_str).unwrap_or(&public_name).to_string();
        let modality = info
            .get("type")
            .and_then(Value::as_str)
            .map(Modality::from_capability)
            .unwrap_or(Modality::Chat);
        registry.insert(public_name.clone(), ModelInfo { public_name, upstream_id, modality });
    }
    let count = registry.len();
    bridge.models.replace(registry);
    tracing::info!(model_count = count, "model registry replaced");
}

async fn route_request_chunk(bridge: &SharedBridge, request_id: &str, data: Value) {
    let chunk = match &data {
        Value::String(s) if s == "[DONE]" => PeerChunk::Done,
        Value::String(s) => PeerChunk::Data(s.clone()),
        Value::Object(o) => {
            let message = o
                .get("error")
                .map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .unwrap_or_else(|| data.to_string());
            PeerChunk::Error(message)
        }
        other => PeerChunk::Data(other.to_string()),
    };
    if !bridge.registry.route_chunk(request_id, chunk).await {
        tracing::debug!(request_id, "chunk for unknown or already-evicted request");
    }
}
