//! Startup warmup: ask the peer to open `count` fresh conversations per
//! configured model so the first real request for that model doesn't have
//! to wait on a cold session (spec §4.C, SPEC_FULL §4.H).
//!
//! Each warmed session arrives back asynchronously as a `session_created`
//! peer message (handled in `ws.rs`), so this only needs to fire the
//! requests; it doesn't wait on their completion.

use bridge_core::models::Modality;
use bridge_core::peer::OutboundPeerMessage;
use bridge_core::translate::{translate_request, OpenAiChatRequest, OpenAiMessage};

use crate::state::SharedBridge;

pub async fn run(bridge: &SharedBridge) {
    if bridge.config.warmup.is_empty() {
        return;
    }

    for spec in &bridge.config.warmup {
        let model_info = bridge.models.get(&spec.model);
        let upstream_id = model_info.as_ref().map(|m| m.upstream_id.clone()).unwrap_or_else(|| spec.model.clone());
        let modality = model_info.map(|m| m.modality).unwrap_or(Modality::Chat);

        for i in 0..spec.count {
            let req = OpenAiChatRequest {
                model: spec.model.clone(),
                messages: vec![OpenAiMessage {
                    role: "user".to_string(),
                    content: Some(serde_json::Value::String(spec.initial_prompt.clone())),
                }],
                stream: false,
            };

            let translated = match translate_request(&req, &bridge.config, &upstream_id, modality) {
                Ok(t) => t,
                Err(e) => {
                    tracing::warn!(model = %spec.model, error = %e, "warmup translation failed");
                    continue;
                }
            };

            let payload = match serde_json::to_value(&translated.payload) {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(model = %spec.model, error = %e, "warmup payload did not serialize");
                    continue;
                }
            };
            let files_to_upload: Vec<serde_json::Value> = translated
                .files_to_upload
                .iter()
                .map(|f| serde_json::to_value(f).unwrap_or(serde_json::Value::Null))
                .collect();

            let request_id = format!("warmup-{}-{}-{}", spec.model, i, uuid::Uuid::new_v4());
            let sent = bridge
                .peer
                .send(&OutboundPeerMessage::WarmupSession {
                    request_id,
                    model_name: spec.model.clone(),
                    payload,
                    files_to_upload,
                })
                .await;
            if !sent {
                tracing::warn!(model = %spec.model, "warmup aborted, peer disconnected mid-run");
                return;
            }
        }

        tracing::info!(model = %spec.model, count = spec.count, "warmup requests sent");
    }
}
