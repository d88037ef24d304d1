//! Wire codec: the browser peer's line-tagged stream → a typed event
//! sequence, and the inverse (OpenAI SSE/JSON formatting). Spec §4.A.

pub mod cloudflare;
pub mod format;

use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Video,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Cloudflare,
    AttachmentTooLarge,
    Upstream,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CodecEvent {
    Content(String),
    Media { url: String, kind: MediaKind },
    Finish(String),
    Error { kind: ErrorKind, message: String },
}

/// Streaming buffer-scan parser. Record lines are consumed greedily off the
/// front of the buffer; an incomplete trailing line is kept for the next
/// `feed`. Scans are anchored at every record start so a partial message
/// never blocks later complete ones, except inside an incomplete JSON value,
/// which is left in the buffer until fully received.
#[derive(Debug, Default)]
pub struct WireCodec {
    buffer: String,
}

impl WireCodec {
    pub fn new() -> Self {
        Self { buffer: String::new() }
    }

    /// Feed one chunk of raw peer text and return every event that became
    /// parseable as a result.
    pub fn feed(&mut self, chunk: &str) -> Vec<CodecEvent> {
        self.buffer.push_str(chunk);
        self.drain()
    }

    /// Flush whatever is left in the buffer once the peer signals end of
    /// stream (handles a final record with no trailing newline).
    pub fn flush(&mut self) -> Vec<CodecEvent> {
        let remaining = std::mem::take(&mut self.buffer);
        let trimmed = remaining.trim();
        if trimmed.is_empty() {
            return Vec::new();
        }
        Self::parse_record(trimmed).into_iter().collect()
    }

    fn drain(&mut self) -> Vec<CodecEvent> {
        let mut events = Vec::new();
        loop {
            let Some(newline_pos) = self.buffer.find('\n') else {
                break;
            };
            let line = self.buffer[..newline_pos].to_string();
            self.buffer.drain(..=newline_pos);
            if let Some(event) = Self::parse_record(line.trim()) {
                events.push(event);
            }
        }
        events
    }

    /// Parse one complete record line. Returns `None` for blank lines or
    /// input that doesn't match any known shape (logged and dropped by the
    /// caller, matching the source's "could not parse data" warning path).
    fn parse_record(line: &str) -> Option<CodecEvent> {
        if line.is_empty() {
            return None;
        }

        if let Some(message) = cloudflare::detect(line) {
            return Some(CodecEvent::Error { kind: ErrorKind::Cloudflare, message });
        }

        if let Some((prefix, content)) = line.split_once(':') {
            match prefix {
                "a0" | "b0" => {
                    let text: String = serde_json::from_str(content).ok()?;
                    return Some(CodecEvent::Content(text));
                }
                "a2" | "b2" => {
                    let items: Vec<Value> = serde_json::from_str(content).ok()?;
                    // Only ever one media item per record in practice; if
                    // more arrive, the last event raised is the one that
                    // was seen last by the caller's loop, matching the
                    // source (it simply appends each to `media_urls`).
                    let mut last = None;
                    for item in items {
                        if let Some(url) = item.get("image").and_then(Value::as_str) {
                            last = Some(CodecEvent::Media { url: url.to_string(), kind: MediaKind::Image });
                        } else if let Some(url) = item.get("url").and_then(Value::as_str) {
                            last = Some(CodecEvent::Media { url: url.to_string(), kind: MediaKind::Video });
                        }
                    }
                    return last;
                }
                "ad" => {
                    let obj: Value = serde_json::from_str(content).ok()?;
                    let reason = obj
                        .get("finishReason")
                        .and_then(Value::as_str)
                        .unwrap_or("stop")
                        .to_string();
                    return Some(CodecEvent::Finish(reason));
                }
                _ => {}
            }
        }

        // Free-form JSON object carrying an upstream error.
        if line.starts_with('{') {
            if let Ok(obj) = serde_json::from_str::<Value>(line) {
                if let Some(err) = obj.get("error") {
                    let message = match err {
                        Value::String(s) => s.clone(),
                        Value::Object(o) => o
                            .get("message")
                            .and_then(Value::as_str)
                            .unwrap_or("unknown upstream error")
                            .to_string(),
                        other => other.to_string(),
                    };
                    return Some(classify_upstream_error(&message));
                }
            }
        }

        None
    }
}

/// An upstream error message is classified as attachment-too-large,
/// Cloudflare, or a generic upstream error (spec §4.A).
pub fn classify_upstream_error(message: &str) -> CodecEvent {
    if let Some(cf) = cloudflare::detect(message) {
        return CodecEvent::Error { kind: ErrorKind::Cloudflare, message: cf };
    }
    let lower = message.to_ascii_lowercase();
    if message.contains("413") || lower.contains("too large") {
        return CodecEvent::Error { kind: ErrorKind::AttachmentTooLarge, message: message.to_string() };
    }
    CodecEvent::Error { kind: ErrorKind::Upstream, message: message.to_string() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_text_delta() {
        let mut codec = WireCodec::new();
        let events = codec.feed("a0:\"Hello\"\n");
        assert_eq!(events, vec![CodecEvent::Content("Hello".to_string())]);
    }

    #[test]
    fn parses_finish_reason() {
        let mut codec = WireCodec::new();
        let events = codec.feed("ad:{\"finishReason\":\"stop\"}\n");
        assert_eq!(events, vec![CodecEvent::Finish("stop".to_string())]);
    }

    #[test]
    fn parses_media_image() {
        let mut codec = WireCodec::new();
        let events = codec.feed("a2:[{\"type\":\"image\",\"image\":\"https://x/y.png\"}]\n");
        assert_eq!(
            events,
            vec![CodecEvent::Media { url: "https://x/y.png".to_string(), kind: MediaKind::Image }]
        );
    }

    #[test]
    fn incomplete_record_waits_for_more_bytes() {
        let mut codec = WireCodec::new();
        let events = codec.feed("a0:\"Hel");
        assert!(events.is_empty());
        let events = codec.feed("lo\"\n");
        assert_eq!(events, vec![CodecEvent::Content("Hello".to_string())]);
    }

    #[test]
    fn flush_handles_missing_trailing_newline() {
        let mut codec = WireCodec::new();
        let events = codec.feed("a0:\"partial\"");
        assert!(events.is_empty());
        let flushed = codec.flush();
        assert_eq!(flushed, vec![CodecEvent::Content("partial".to_string())]);
    }

    #[test]
    fn multiple_records_in_one_chunk_parse_independently() {
        let mut codec = WireCodec::new();
        let events = codec.feed("a0:\"one\"\na0:\"two\"\nad:{\"finishReason\":\"stop\"}\n");
        assert_eq!(
            events,
            vec![
                CodecEvent::Content("one".to_string()),
                CodecEvent::Content("two".to_string()),
                CodecEvent::Finish("stop".to_string()),
            ]
        );
    }

    #[test]
    fn detects_attachment_too_large_error() {
        let mut codec = WireCodec::new();
        let events = codec.feed("{\"error\": \"413 Request Entity Too Large\"}\n");
        assert_eq!(
            events,
            vec![CodecEvent::Error {
                kind: ErrorKind::AttachmentTooLarge,
                message: "413 Request Entity Too Large".to_string()
            }]
        );
    }

    #[test]
    fn detects_cloudflare_html_fragment() {
        let mut codec = WireCodec::new();
        let events = codec.feed("<html><title>Just a moment...</title></html>\n");
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], CodecEvent::Error { kind: ErrorKind::Cloudflare, .. }));
    }

    #[test]
    fn unrecognized_line_is_dropped_not_panicked() {
        let mut codec = WireCodec::new();
        let events = codec.feed("garbage that matches nothing\n");
        assert!(events.is_empty());
    }
}
