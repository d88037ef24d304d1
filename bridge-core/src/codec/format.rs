//! Output side of the wire codec: turn a [`super::CodecEvent`] sequence
//! into OpenAI-compatible SSE frames or a single aggregate JSON object,
//! with chunk coalescing for streaming chat (spec §4.A).

use super::{CodecEvent, ErrorKind, MediaKind};
use crate::models::Modality;
use serde_json::{json, Value};
use std::time::{Duration, Instant};

pub const MIN_CHUNK_SIZE: usize = 40;
pub const MAX_BUFFER_TIME: Duration = Duration::from_millis(500);

/// Rough token estimate (4 chars/token), good enough for the `usage` block
/// — the upstream never reports real counts.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() / 4) as u64
}

fn system_fingerprint() -> String {
    format!("fp_{}", uuid::Uuid::new_v4().simple().to_string().chars().take(8).collect::<String>())
}

/// Accumulates codec events for one request into OpenAI response shapes.
/// Mirrors the source's `stream_generator`: a text-delta buffer flushed at
/// ≥40 chars or 500ms, one terminal chunk per request, always followed by
/// `[DONE]` for streaming responses (even after an error frame).
pub struct SseAggregator {
    response_id: String,
    model: String,
    modality: Modality,
    is_streaming: bool,
    accumulated_content: String,
    media_urls: Vec<(String, MediaKind)>,
    finish_reason: Option<String>,
    streaming_buffer: String,
    last_flush: Instant,
    errored: bool,
}

impl SseAggregator {
    pub fn new(model: &str, modality: Modality, is_streaming: bool) -> Self {
        Self {
            response_id: format!("chatcmpl-{}", uuid::Uuid::new_v4()),
            model: model.to_string(),
            modality,
            is_streaming,
            accumulated_content: String::new(),
            media_urls: Vec::new(),
            finish_reason: None,
            streaming_buffer: String::new(),
            last_flush: Instant::now(),
            errored: false,
        }
    }

    /// Feed one codec event; returns any SSE frames it's now time to emit.
    /// For a non-streaming request the caller should ignore the returned
    /// frames and call [`Self::finalize`] once the event stream ends.
    pub fn push(&mut self, event: CodecEvent) -> Vec<String> {
        match event {
            CodecEvent::Content(text) => {
                if self.modality != Modality::Chat {
                    self.accumulated_content.push_str(&text);
                    return Vec::new();
                }
                if !self.is_streaming {
                    self.accumulated_content.push_str(&text);
                    return Vec::new();
                }
                self.streaming_buffer.push_str(&text);
                self.maybe_flush(false)
            }
            CodecEvent::Media { url, kind } => {
                self.media_urls.push((url, kind));
                Vec::new()
            }
            CodecEvent::Finish(reason) => {
                self.finish_reason = Some(reason);
                Vec::new()
            }
            CodecEvent::Error { kind, message } => {
                self.errored = true;
                vec![self.render_error_frame(kind, &message)]
            }
        }
    }

    /// Called periodically (e.g. every 100ms poll) so a buffer that never
    /// reaches the size threshold still flushes within `MAX_BUFFER_TIME`.
    pub fn idle_tick(&mut self) -> Vec<String> {
        if self.streaming_buffer.is_empty() {
            return Vec::new();
        }
        if self.last_flush.elapsed() >= MAX_BUFFER_TIME {
            return self.maybe_flush(true);
        }
        Vec::new()
    }

    fn maybe_flush(&mut self, force: bool) -> Vec<String> {
        let should_flush = force
            || self.streaming_buffer.len() >= MIN_CHUNK_SIZE
            || (!self.streaming_buffer.is_empty() && self.last_flush.elapsed() >= MAX_BUFFER_TIME);
        if !should_flush {
            return Vec::new();
        }
        let chunk = self.render_delta_chunk(&self.streaming_buffer.clone());
        self.accumulated_content.push_str(&self.streaming_buffer);
        self.streaming_buffer.clear();
        self.last_flush = Instant::now();
        vec![chunk]
    }

    fn render_delta_chunk(&self, content: &str) -> String {
        let chunk = json!({
            "id": self.response_id,
            "object": "chat.completion.chunk",
            "created": now_unix(),
            "model": self.model,
            "choices": [{
                "index": 0,
                "delta": { "role": "assistant", "content": content },
                "finish_reason": Value::Null,
            }],
            "system_fingerprint": system_fingerprint(),
        });
        format!("data: {chunk}\n\n")
    }

    fn render_error_frame(&self, kind: ErrorKind, message: &str) -> String {
        let error_type = match kind {
            ErrorKind::Cloudflare => "cloudflare_challenge",
            ErrorKind::AttachmentTooLarge => "attachment_too_large",
            ErrorKind::Upstream => "server_error",
        };
        let body = json!({
            "error": { "message": message, "type": error_type, "code": Value::Null }
        });
        format!("data: {body}\n\n")
    }

    fn final_text(&self) -> String {
        match self.modality {
            Modality::Chat => self.accumulated_content.clone(),
            Modality::Image => self
                .media_urls
                .iter()
                .map(|(url, _)| format!("![Generated Image]({url})"))
                .collect::<Vec<_>>()
                .join("\n"),
            Modality::Video => self
                .media_urls
                .iter()
                .map(|(url, _)| url.clone())
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    fn resolved_finish_reason(&self) -> String {
        let reason = self.finish_reason.clone().unwrap_or_else(|| "stop".to_string());
        reason
    }

    /// Flush any trailing buffer, emit the terminal frame(s), and `[DONE]`
    /// for streaming; or build the single aggregate JSON object.
    pub fn finalize(&mut self) -> FinalizeOutcome {
        let mut frames = Vec::new();

        if self.modality == Modality::Chat && self.is_streaming && !self.streaming_buffer.is_empty() {
            frames.push(self.render_delta_chunk(&self.streaming_buffer.clone()));
            self.accumulated_content.push_str(&self.streaming_buffer);
            self.streaming_buffer.clear();
        }

        let mut text = self.final_text();
        let mut finish_reason = self.resolved_finish_reason();
        if finish_reason == "content-filter" {
            text.push_str("\n\n[Response was truncated by the upstream content filter.]");
        }
        if self.errored {
            // An error frame already went out; still terminate cleanly.
            finish_reason = "stop".to_string();
        }

        if self.is_streaming {
            if self.modality != Modality::Chat {
                frames.push(self.render_delta_chunk(&text));
            }
            let final_chunk = json!({
                "id": self.response_id,
                "object": "chat.completion.chunk",
                "created": now_unix(),
                "model": self.model,
                "choices": [{
                    "index": 0,
                    "delta": {},
                    "finish_reason": finish_reason,
                }],
                "system_fingerprint": system_fingerprint(),
            });
            frames.push(format!("data: {final_chunk}\n\n"));
            frames.push("data: [DONE]\n\n".to_string());
            FinalizeOutcome::Frames(frames)
        } else {
            let completion = json!({
                "id": self.response_id,
                "object": "chat.completion",
                "created": now_unix(),
                "model": self.model,
                "choices": [{
                    "index": 0,
                    "message": { "role": "assistant", "content": text },
                    "finish_reason": finish_reason,
                }],
                "usage": {
                    "prompt_tokens": 0,
                    "completion_tokens": estimate_tokens(&self.accumulated_content),
                    "total_tokens": estimate_tokens(&self.accumulated_content),
                },
                "system_fingerprint": system_fingerprint(),
            });
            FinalizeOutcome::Aggregate(completion)
        }
    }
}

pub enum FinalizeOutcome {
    Frames(Vec<String>),
    Aggregate(Value),
}

fn now_unix() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// List models in the OpenAI `/v1/models` shape.
pub fn render_models_list(models: impl IntoIterator<Item = (String, Modality)>) -> Value {
    let data: Vec<Value> = models
        .into_iter()
        .map(|(id, modality)| {
            json!({
                "id": id,
                "object": "model",
                "owned_by": "arena-bridge",
                "type": match modality {
                    Modality::Chat => "chat",
                    Modality::Image => "image",
                    Modality::Video => "video",
                },
            })
        })
        .collect();
    json!({ "object": "list", "data": data })
}
