//! Observability and peer-control endpoints that sit alongside chat
//! completions: model listing, a refresh trigger, liveness/metrics, and the
//! one-shot id-capture toggle the `id_updater` peripheral drives (spec §4.G,
//! SPEC_FULL §6).

use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::Json;
use bridge_core::codec::format::render_models_list;
use bridge_core::peer::OutboundPeerMessage;
use serde_json::json;

use crate::state::SharedBridge;

pub async fn list_models(State(bridge): State<SharedBridge>) -> Json<serde_json::Value> {
    let snapshot = bridge.models.snapshot();
    let models = snapshot.values().map(|m| (m.public_name.clone(), m.modality));
    Json(render_models_list(models))
}

pub async fn refresh_models(State(bridge): State<SharedBridge>) -> Response {
    let sent = bridge.peer.send(&OutboundPeerMessage::RefreshModels).await;
    if sent {
        Json(json!({ "status": "requested" })).into_response()
    } else {
        (axum::http::StatusCode::SERVICE_UNAVAILABLE, Json(json!({ "status": "peer not connected" })))
            .into_response()
    }
}

pub async fn activate_id_capture(State(bridge): State<SharedBridge>) -> Response {
    let sent = bridge.peer.send(&OutboundPeerMessage::ActivateIdCapture).await;
    if sent {
        bridge.set_id_capture(true);
        Json(json!({ "status": "activated" })).into_response()
    } else {
        (axum::http::StatusCode::SERVICE_UNAVAILABLE, Json(json!({ "status": "peer not connected" })))
            .into_response()
    }
}

pub async fn healthz(State(bridge): State<SharedBridge>) -> Json<serde_json::Value> {
    let peer_connected = bridge.peer.is_connected().await;
    let pools = bridge.pools.snapshot_all().await;
    let in_flight = bridge.registry.len().await;
    Json(json!({
        "status": if peer_connected { "ok" } else { "degraded" },
        "peer_connected": peer_connected,
        "in_flight_requests": in_flight,
        "model_count": bridge.models.len(),
        "pools": pools.into_iter().map(|(model, s)| {
            json!({ "model": model, "available": s.available, "in_use": s.in_use, "unhealthy": s.unhealthy })
        }).collect::<Vec<_>>(),
    }))
}

/// Prometheus text exposition. Metric names aren't a contract the browser
/// side depends on, so these are illustrative rather than stable.
pub async fn metrics(State(bridge): State<SharedBridge>) -> String {
    let peer_connected = bridge.peer.is_connected().await;
    let in_flight = bridge.registry.len().await;
    let pools = bridge.pools.snapshot_all().await;

    let mut out = String::new();
    out.push_str("# HELP arena_bridge_peer_connected whether the browser peer is attached\n");
    out.push_str("# TYPE arena_bridge_peer_connected gauge\n");
    out.push_str(&format!("arena_bridge_peer_connected {}\n", peer_connected as u8));

    out.push_str("# HELP arena_bridge_in_flight_requests requests currently registered\n");
    out.push_str("# TYPE arena_bridge_in_flight_requests gauge\n");
    out.push_str(&format!("arena_bridge_in_flight_requests {in_flight}\n"));

    out.push_str("# HELP arena_bridge_pool_sessions sessions per model by status\n");
    out.push_str("# TYPE arena_bridge_pool_sessions gauge\n");
    for (model, snap) in pools {
        out.push_str(&format!(
            "arena_bridge_pool_sessions{{model=\"{model}\",status=\"available\"}} {}\n",
            snap.available
        ));
        out.push_str(&format!(
            "arena_bridge_pool_sessions{{model=\"{model}\",status=\"in_use\"}} {}\n",
            snap.in_use
        ));
        out.push_str(&format!(
            "arena_bridge_pool_sessions{{model=\"{model}\",status=\"unhealthy\"}} {}\n",
            snap.unhealthy
        ));
    }
    out
}
