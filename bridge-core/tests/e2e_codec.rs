//! Wire-codec and SSE-aggregator end-to-end scenarios (spec §8: happy
//! streaming path, Cloudflare mid-stream, attachment-too-large).

use bridge_core::codec::format::{FinalizeOutcome, SseAggregator};
use bridge_core::codec::{classify_upstream_error, CodecEvent, ErrorKind, WireCodec};
use bridge_core::models::Modality;

#[test]
fn happy_streaming_path_coalesces_then_terminates_cleanly() {
    let mut codec = WireCodec::new();
    let mut aggregator = SseAggregator::new("gpt-4o", Modality::Chat, true);
    let mut frames = Vec::new();

    for event in codec.feed("a0:\"Hel\"\na0:\"lo\"\n") {
        frames.extend(aggregator.push(event));
    }
    // Below the 40-char coalescing threshold and no 500ms tick has fired
    // yet, so nothing has been emitted.
    assert!(frames.is_empty());

    for event in codec.feed("ad:{\"finishReason\":\"stop\"}\n") {
        aggregator.push(event);
    }
    // The peer's own "[DONE]" sentinel never reaches the wire codec: the
    // socket layer recognizes it directly and calls finalize().

    let FinalizeOutcome::Frames(final_frames) = aggregator.finalize() else {
        panic!("a streaming aggregator must finalize into frames");
    };

    let joined = final_frames.join("");
    assert!(joined.contains("\"content\":\"Hello\""));
    assert!(joined.contains("\"finish_reason\":\"stop\""));
    assert!(final_frames.last().unwrap().contains("[DONE]"));
}

#[test]
fn cloudflare_mid_stream_emits_one_error_frame_then_done() {
    let html = "<html><head><title>Just a moment...</title></head><body></body></html>";
    let event = classify_upstream_error(html);
    assert!(matches!(event, CodecEvent::Error { kind: ErrorKind::Cloudflare, .. }));

    let mut aggregator = SseAggregator::new("gpt-4o", Modality::Chat, true);
    let error_frames = aggregator.push(event);
    assert_eq!(error_frames.len(), 1);
    assert!(error_frames[0].contains("cloudflare_challenge"));

    let FinalizeOutcome::Frames(final_frames) = aggregator.finalize() else {
        panic!("expected streaming frames");
    };
    assert!(final_frames.last().unwrap().contains("[DONE]"));
    // An error frame already terminated the content; finalize should not
    // claim a content-filter finish reason or resurface the error as fatal.
    assert!(final_frames.iter().any(|f| f.contains("\"finish_reason\":\"stop\"")));
}

#[test]
fn attachment_too_large_streaming_gets_one_error_frame_then_done() {
    let event = classify_upstream_error("413 Request Entity Too Large");
    assert!(matches!(event, CodecEvent::Error { kind: ErrorKind::AttachmentTooLarge, .. }));

    let mut aggregator = SseAggregator::new("gpt-4o", Modality::Chat, true);
    let frames = aggregator.push(event);
    assert_eq!(frames.len(), 1);
    assert!(frames[0].contains("attachment_too_large"));

    let FinalizeOutcome::Frames(final_frames) = aggregator.finalize() else {
        panic!("expected streaming frames");
    };
    assert!(final_frames.last().unwrap().contains("[DONE]"));
}

#[test]
fn non_streaming_matches_the_concatenation_a_streaming_request_would_emit() {
    let mut streaming_codec = WireCodec::new();
    let mut streaming_agg = SseAggregator::new("gpt-4o", Modality::Chat, true);
    for event in streaming_codec.feed("a0:\"foo \"\na0:\"bar \"\na0:\"baz\"\nad:{\"finishReason\":\"stop\"}\n") {
        streaming_agg.push(event);
    }
    let FinalizeOutcome::Frames(streaming_frames) = streaming_agg.finalize() else {
        panic!("expected frames")
    };
    let streaming_text: String = streaming_frames
        .iter()
        .filter_map(|f| {
            let v: serde_json::Value = serde_json::from_str(f.trim_start_matches("data: ").trim()).ok()?;
            v["choices"][0]["delta"]["content"].as_str().map(|s| s.to_string())
        })
        .collect();

    let mut batch_codec = WireCodec::new();
    let mut batch_agg = SseAggregator::new("gpt-4o", Modality::Chat, false);
    for event in batch_codec.feed("a0:\"foo \"\na0:\"bar \"\na0:\"baz\"\nad:{\"finishReason\":\"stop\"}\n") {
        batch_agg.push(event);
    }
    let FinalizeOutcome::Aggregate(value) = batch_agg.finalize() else {
        panic!("expected an aggregate")
    };
    let batch_text = value["choices"][0]["message"]["content"].as_str().unwrap();

    assert_eq!(streaming_text, "foo bar baz");
    assert_eq!(batch_text, "foo bar baz");
}
