//! Translation idempotency and code-span safety across a wider input than
//! the inline unit tests cover (spec §8, invariants 5-6).

use bridge_core::config::Config;
use bridge_core::models::Modality;
use bridge_core::translate::{translate_request, OpenAiChatRequest, OpenAiMessage};
use serde_json::Value;

fn request(pairs: &[(&str, &str)]) -> OpenAiChatRequest {
    OpenAiChatRequest {
        model: "gpt-4o".to_string(),
        stream: false,
        messages: pairs
            .iter()
            .map(|(role, content)| OpenAiMessage {
                role: role.to_string(),
                content: Some(Value::String(content.to_string())),
            })
            .collect(),
    }
}

#[test]
fn translation_is_role_and_text_stable_on_already_normalized_input() {
    let mut config = Config::default();
    config.insert_empty_user_message = false;

    let r = request(&[("system", "be terse"), ("user", "what is 2+2"), ("assistant", "4"), ("user", "and 3+3")]);
    let first = translate_request(&r, &config, "claude-3", Modality::Chat).unwrap();

    // Feed the already-translated text content straight back through a
    // fresh OpenAI-shaped request: same roles in the same order, same text.
    let round_tripped = OpenAiChatRequest {
        model: "gpt-4o".to_string(),
        stream: false,
        messages: first
            .payload
            .messages
            .iter()
            .filter(|m| m.role != "assistant" || !m.content.is_empty())
            .map(|m| OpenAiMessage { role: m.role.clone(), content: Some(Value::String(m.content.clone())) })
            .collect(),
    };
    let second = translate_request(&round_tripped, &config, "claude-3", Modality::Chat).unwrap();

    let first_shape: Vec<(String, String)> =
        first.payload.messages.iter().map(|m| (m.role.clone(), m.content.clone())).collect();
    let second_shape: Vec<(String, String)> =
        second.payload.messages.iter().map(|m| (m.role.clone(), m.content.clone())).collect();
    assert_eq!(first_shape, second_shape);
}

#[test]
fn code_span_safe_extraction_holds_across_mixed_fenced_and_inline_spans() {
    let content = "intro data:image/png;base64,REAL1 middle\n\
                   ```\n\
                   data:image/png;base64,FENCED\n\
                   ```\n\
                   and inline `data:image/png;base64,INLINE` done \
                   data:image/png;base64,REAL2 end";

    let mut config = Config::default();
    config.insert_empty_user_message = false;
    let r = request(&[("user", content)]);
    let result = translate_request(&r, &config, "claude-3", Modality::Chat).unwrap();

    assert_eq!(result.files_to_upload.len(), 2, "only the two spans outside code must be extracted");
    let user_content = &result.payload.messages[0].content;
    assert!(user_content.contains("```\ndata:image/png;base64,FENCED\n```"));
    assert!(user_content.contains("`data:image/png;base64,INLINE`"));
    assert!(!user_content.contains("REAL1"));
    assert!(!user_content.contains("REAL2"));
}

#[test]
fn modality_other_than_chat_skips_empty_user_message_insertion_even_when_enabled() {
    let mut config = Config::default();
    config.insert_empty_user_message = true;
    let r = request(&[("user", "draw a cat")]);
    let result = translate_request(&r, &config, "image-model", Modality::Image).unwrap();
    let roles: Vec<&str> = result.payload.messages.iter().map(|m| m.role.as_str()).collect();
    assert_eq!(roles, vec!["user", "assistant"]);
}
