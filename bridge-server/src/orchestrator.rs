//! The HTTP handler for chat completions: acquire session, register
//! request, push to peer, stream codec events back to the caller,
//! cancellation (spec §4.F).

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use bridge_core::codec::format::{FinalizeOutcome, SseAggregator};
use bridge_core::codec::{classify_upstream_error, CodecEvent, ErrorKind, WireCodec};
use bridge_core::config::EndpointConfig;
use bridge_core::error::BridgeError;
use bridge_core::models::Modality;
use bridge_core::peer::OutboundPeerMessage;
use bridge_core::registry::PeerChunk;
use bridge_core::session::Session;
use bridge_core::translate::{translate_retry_request, OpenAiChatRequest};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::error::ApiError;
use crate::state::SharedBridge;

pub async fn chat_completions(
    State(bridge): State<SharedBridge>,
    headers: HeaderMap,
    Json(req): Json<OpenAiChatRequest>,
) -> Result<Response, ApiError> {
    check_auth(&bridge, &headers)?;

    if !bridge.peer.is_connected().await {
        return Err(BridgeError::PeerMissing.into());
    }

    let model_info = bridge.models.get(&req.model).ok_or_else(|| BridgeError::ModelUnknown(req.model.clone()))?;

    seed_pool_if_empty(&bridge, &req.model).await?;

    let acquire_timeout = Duration::from_secs(bridge.config.session_acquire_timeout_seconds);
    let session = bridge
        .pools
        .acquire(&req.model, acquire_timeout)
        .await
        .ok_or(BridgeError::SessionWaitTimeout)?;

    match dispatch(&bridge, &req, &session, model_info.modality).await {
        Ok(response) => Ok(response),
        Err(e) => {
            bridge.pools.mark_unhealthy(&req.model, &session.session_id).await;
            Err(e.into())
        }
    }
}

fn check_auth(bridge: &SharedBridge, headers: &HeaderMap) -> Result<(), BridgeError> {
    let presented = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    if bridge.require_auth(presented) {
        Ok(())
    } else {
        Err(BridgeError::Auth)
    }
}

/// Lazily seed a model's pool from the static `model_endpoint_map` config
/// the first time a request for that model arrives with nothing warmed
/// yet. Dynamically-warmed sessions (via the browser's `session_created`
/// replies) populate the same pool independently.
async fn seed_pool_if_empty(bridge: &SharedBridge, model: &str) -> Result<(), BridgeError> {
    bridge.pools.register(model).await;
    let snapshot = bridge.pools.snapshot(model).await.unwrap_or_default();
    if snapshot.available + snapshot.in_use > 0 {
        return Ok(());
    }

    let entry: Option<&EndpointConfig> = bridge.config.model_endpoint_map.get(model);
    let resolved = entry.and_then(EndpointConfig::choose);
    match resolved {
        Some(e) if !e.is_placeholder() => {
            bridge
                .pools
                .add(Session::new(e.session_id.clone(), e.message_id.clone(), model.to_string()))
                .await;
            Ok(())
        }
        _ => Err(BridgeError::BadRequest(format!(
            "no session available for model '{model}': no warmed session and no usable endpoint map entry"
        ))),
    }
}

async fn dispatch(
    bridge: &SharedBridge,
    req: &OpenAiChatRequest,
    session: &Session,
    modality: Modality,
) -> Result<Response, BridgeError> {
    let (payload, files_to_upload) =
        translate_retry_request(req, &session.message_id, &session.session_id)?;

    let request_id = uuid::Uuid::new_v4().to_string();
    let (tx, rx) = mpsc::channel(bridge.config.backpressure_queue_size);
    bridge.registry.add(&request_id, &req.model, req.stream, tx).await?;

    log_request(
        bridge,
        serde_json::json!({
            "request_id": request_id,
            "model": req.model,
            "session_id": session.session_id,
            "stream": req.stream,
            "event": "start",
        }),
    )
    .await;

    let payload_value =
        serde_json::to_value(&payload).map_err(|e| BridgeError::PayloadTranslate(e.to_string()))?;
    let files_value: Vec<serde_json::Value> = files_to_upload
        .iter()
        .map(|f| serde_json::to_value(f).unwrap_or(serde_json::Value::Null))
        .collect();

    let delivered = bridge
        .peer
        .send(&OutboundPeerMessage::RetryRequest {
            request_id: request_id.clone(),
            payload: payload_value,
            files_to_upload: files_value,
        })
        .await;
    if !delivered {
        bridge.registry.evict(&request_id).await;
        return Err(BridgeError::PeerMissing);
    }
    bridge.registry.mark_sent(&request_id).await;

    drive_response(bridge.clone(), request_id, req.model.clone(), session.clone(), modality, req.stream, rx).await
}

async fn drive_response(
    bridge: SharedBridge,
    request_id: String,
    model: String,
    session: Session,
    modality: Modality,
    is_streaming: bool,
    mut rx: mpsc::Receiver<PeerChunk>,
) -> Result<Response, BridgeError> {
    let timeout = Duration::from_secs(bridge.config.request_timeout_seconds);

    if is_streaming {
        let (out_tx, out_rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(8);
        tokio::spawn(async move {
            stream_loop(&bridge, &request_id, &model, &session, modality, timeout, &mut rx, out_tx).await;
        });
        let body = Body::from_stream(ReceiverStream::new(out_rx));
        let mut response = Response::new(body);
        response
            .headers_mut()
            .insert("content-type", HeaderValue::from_static("text/event-stream"));
        response
            .headers_mut()
            .insert("cache-control", HeaderValue::from_static("no-cache"));
        Ok(response)
    } else {
        let mut codec = WireCodec::new();
        let mut aggregator = SseAggregator::new(&model, modality, false);
        let outcome = collect_until_done(&mut rx, timeout, &mut codec, &mut aggregator).await;

        bridge.pools.release(&model, &session.session_id).await;
        bridge.registry.complete(&request_id).await;

        match outcome {
            Err(e) => {
                log_error(
                    &bridge,
                    serde_json::json!({
                        "request_id": request_id,
                        "model": model,
                        "event": "error",
                        "error": e.to_string(),
                    }),
                )
                .await;
                Err(e)
            }
            Ok(()) => {
                log_request(
                    &bridge,
                    serde_json::json!({
                        "request_id": request_id,
                        "model": model,
                        "event": "success",
                    }),
                )
                .await;
                match aggregator.finalize() {
                    FinalizeOutcome::Aggregate(value) => Ok(Json(value).into_response()),
                    FinalizeOutcome::Frames(_) => unreachable!("non-streaming aggregator never returns frames"),
                }
            }
        }
    }
}

/// Record one line to the request log, best-effort: a logging failure never
/// fails the request it describes.
async fn log_request(bridge: &SharedBridge, event: serde_json::Value) {
    if let Err(e) = bridge.request_log.append(&event).await {
        tracing::warn!(error = %e, "failed to write request log");
    }
}

/// Record one line to the error log, best-effort (see `log_request`).
async fn log_error(bridge: &SharedBridge, event: serde_json::Value) {
    if let Err(e) = bridge.error_log.append(&event).await {
        tracing::warn!(error = %e, "failed to write error log");
    }
}

/// Feed the response channel into the codec/aggregator until `Done`,
/// translating a surfaced `error(attachment-too-large)` into the non-
/// streaming 413 path (spec §4.F step 7).
async fn collect_until_done(
    rx: &mut mpsc::Receiver<PeerChunk>,
    timeout: Duration,
    codec: &mut WireCodec,
    aggregator: &mut SseAggregator,
) -> Result<(), BridgeError> {
    loop {
        let next = tokio::time::timeout(timeout, rx.recv()).await;
        let chunk = match next {
            Ok(Some(c)) => c,
            Ok(None) => return Err(BridgeError::ClientCancelled),
            Err(_) => return Err(BridgeError::RequestTimeout(timeout.as_secs())),
        };
        match chunk {
            PeerChunk::Done => {
                for event in codec.flush() {
                    apply_event(aggregator, event)?;
                }
                return Ok(());
            }
            PeerChunk::Error(message) => {
                let event = classify_upstream_error(&message);
                apply_event(aggregator, event)?;
                return Ok(());
            }
            PeerChunk::Data(text) => {
                for event in codec.feed(&text) {
                    apply_event(aggregator, event)?;
                }
            }
        }
    }
}

fn apply_event(aggregator: &mut SseAggregator, event: CodecEvent) -> Result<(), BridgeError> {
    if let CodecEvent::Error { kind: ErrorKind::AttachmentTooLarge, message } = &event {
        return Err(BridgeError::AttachmentTooLarge(message.clone()));
    }
    aggregator.push(event);
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn stream_loop(
    bridge: &SharedBridge,
    request_id: &str,
    model: &str,
    session: &Session,
    modality: Modality,
    timeout: Duration,
    rx: &mut mpsc::Receiver<PeerChunk>,
    out_tx: mpsc::Sender<Result<Bytes, std::io::Error>>,
) {
    let mut codec = WireCodec::new();
    let mut aggregator = SseAggregator::new(model, modality, true);

    let outcome: Result<(), BridgeError> = 'drive: loop {
        let next = tokio::time::timeout(timeout, rx.recv()).await;
        let chunk = match next {
            Ok(Some(c)) => c,
            Ok(None) => break 'drive Err(BridgeError::ClientCancelled),
            Err(_) => break 'drive Err(BridgeError::RequestTimeout(timeout.as_secs())),
        };

        match chunk {
            PeerChunk::Done => {
                for event in codec.flush() {
                    aggregator.push(event);
                }
                if let FinalizeOutcome::Frames(final_frames) = aggregator.finalize() {
                    for frame in final_frames {
                        if out_tx.send(Ok(Bytes::from(frame))).await.is_err() {
                            break 'drive Err(BridgeError::ClientCancelled);
                        }
                    }
                }
                break 'drive Ok(());
            }
            // An upstream error is terminal: one error frame, then [DONE],
            // so SSE consumers always see a clean end of stream (spec §7).
            PeerChunk::Error(message) => {
                let event = classify_upstream_error(&message);
                let is_cloudflare = matches!(event, CodecEvent::Error { kind: ErrorKind::Cloudflare, .. });
                for frame in aggregator.push(event) {
                    let _ = out_tx.send(Ok(Bytes::from(frame))).await;
                }
                let _ = out_tx.send(Ok(Bytes::from("data: [DONE]\n\n"))).await;
                if is_cloudflare {
                    bridge.peer.send(&OutboundPeerMessage::Refresh).await;
                }
                break 'drive Err(BridgeError::Bridge(message));
            }
            PeerChunk::Data(text) => {
                for frame in aggregator_frames(&mut aggregator, codec.feed(&text)) {
                    if out_tx.send(Ok(Bytes::from(frame))).await.is_err() {
                        break 'drive Err(BridgeError::ClientCancelled);
                    }
                }
            }
        }
    };

    match outcome {
        Ok(()) => {
            bridge.pools.release(model, &session.session_id).await;
            bridge.registry.complete(request_id).await;
            log_request(
                bridge,
                serde_json::json!({
                    "request_id": request_id,
                    "model": model,
                    "event": "success",
                }),
            )
            .await;
        }
        Err(BridgeError::ClientCancelled) => {
            bridge.peer.send(&OutboundPeerMessage::AbortRequest { request_id: request_id.to_string() }).await;
            bridge.pools.release(model, &session.session_id).await;
            bridge.registry.evict(request_id).await;
            log_error(
                bridge,
                serde_json::json!({
                    "request_id": request_id,
                    "model": model,
                    "event": "cancelled",
                }),
            )
            .await;
        }
        Err(BridgeError::RequestTimeout(secs)) => {
            let frame = format!("data: {{\"error\":{{\"message\":\"timeout after {secs}s\",\"type\":\"timeout\"}}}}\n\n");
            let _ = out_tx.send(Ok(Bytes::from(frame))).await;
            let _ = out_tx.send(Ok(Bytes::from("data: [DONE]\n\n"))).await;
            bridge.pools.mark_unhealthy(model, &session.session_id).await;
            bridge.registry.timeout(request_id, secs).await;
            log_error(
                bridge,
                serde_json::json!({
                    "request_id": request_id,
                    "model": model,
                    "event": "timeout",
                    "timeout_seconds": secs,
                }),
            )
            .await;
        }
        Err(e) => {
            bridge.pools.mark_unhealthy(model, &session.session_id).await;
            bridge.registry.fail(request_id, "bridge error while streaming").await;
            log_error(
                bridge,
                serde_json::json!({
                    "request_id": request_id,
                    "model": model,
                    "event": "error",
                    "error": e.to_string(),
                }),
            )
            .await;
        }
    }
}

/// Push codec events through the aggregator and flatten into raw SSE frame
/// strings. `Finish` only records the reason; the stream's sole terminal
/// finalize happens in the `Done` arm, so this never calls `finalize()`
/// itself — doing so here too would double-emit the finish/`[DONE]` frames.
fn aggregator_frames(aggregator: &mut SseAggregator, events: Vec<CodecEvent>) -> Vec<String> {
    let mut frames = Vec::new();
    for event in events {
        frames.extend(aggregator.push(event));
    }
    frames
}

