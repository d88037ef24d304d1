//! Payload translator: OpenAI chat-completion request → upstream
//! conversation-graph payload, with attachment extraction (spec §4.B).

use crate::config::{BattleTarget, Config, ConversationMode};
use crate::error::{BridgeError, BridgeResult};
use crate::models::Modality;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::OnceLock;

const MAX_ATTACHMENTS_BEFORE_SUSPECT: usize = 10;
const SMALL_ATTACHMENT_BASE64_LEN: usize = 5000;
const SMALL_ATTACHMENT_SUSPECT_COUNT: usize = 5;

#[derive(Debug, Clone, Deserialize)]
pub struct OpenAiMessage {
    pub role: String,
    #[serde(default)]
    pub content: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpenAiChatRequest {
    pub model: String,
    pub messages: Vec<OpenAiMessage>,
    #[serde(default)]
    pub stream: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct Attachment {
    #[serde(rename = "fileName")]
    pub file_name: String,
    #[serde(rename = "contentType")]
    pub content_type: String,
    pub data: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ArenaMessage {
    pub id: String,
    pub role: String,
    pub content: String,
    #[serde(rename = "experimentalAttachments")]
    pub experimental_attachments: Vec<Attachment>,
    #[serde(rename = "parentMessageIds")]
    pub parent_message_ids: Vec<String>,
    #[serde(rename = "participantPosition")]
    pub participant_position: String,
    #[serde(rename = "modelId", skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    #[serde(rename = "evaluationSessionId")]
    pub evaluation_session_id: String,
    pub status: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ArenaPayload {
    pub id: String,
    pub mode: &'static str,
    #[serde(rename = "modelAId")]
    pub model_a_id: String,
    #[serde(rename = "userMessageId")]
    pub user_message_id: String,
    #[serde(rename = "modelAMessageId")]
    pub model_a_message_id: String,
    pub messages: Vec<ArenaMessage>,
    pub modality: Modality,
}

/// The reduced payload used to dispatch on an already-warmed session.
#[derive(Debug, Clone, Serialize)]
pub struct RetryPayload {
    pub message: RetryMessage,
    pub stream: bool,
    #[serde(rename = "messageId")]
    pub message_id: String,
    #[serde(rename = "evaluationSessionId")]
    pub evaluation_session_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RetryMessage {
    pub role: &'static str,
    pub content: String,
    pub attachments: Vec<Attachment>,
}

pub struct TranslationResult {
    pub payload: ArenaPayload,
    pub files_to_upload: Vec<Attachment>,
}

fn data_url_in_list_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^data:(image/\w+);base64,(.*)$").unwrap())
}

fn data_url_in_string_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"data:(image/\w+);base64,([a-zA-Z0-9+/=]+)").unwrap())
}

fn code_span_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"```[\s\S]*?```|`[^`\n]+`").unwrap())
}

fn code_span_extents(text: &str) -> Vec<(usize, usize)> {
    code_span_pattern().find_iter(text).map(|m| (m.start(), m.end())).collect()
}

fn in_any_span(pos: usize, spans: &[(usize, usize)]) -> bool {
    spans.iter().any(|(start, end)| pos >= *start && pos < *end)
}

fn new_upload_filename(mime_type: &str) -> String {
    let ext = mime_type.split('/').nth(1).unwrap_or("bin");
    format!("upload-{}.{}", uuid::Uuid::new_v4(), ext)
}

/// Normalize a role per §4.B step 1: `developer` collapses to `system`;
/// unknown roles fall back to `user`.
fn normalize_role(raw: &str) -> &'static str {
    match raw {
        "developer" => "system",
        "system" => "system",
        "assistant" => "assistant",
        "user" => "user",
        "data" => "data",
        _ => "user",
    }
}

struct CleanedMessage {
    role: String,
    content: String,
}

/// Multimodal split + code-block-safe extraction (§4.B steps 2-3). Returns
/// the message list with content reduced to plain text and the attachments
/// pulled out of it.
fn clean_messages(messages: &[OpenAiMessage]) -> (Vec<CleanedMessage>, Vec<Attachment>) {
    let mut files = Vec::new();
    let mut cleaned = Vec::with_capacity(messages.len());

    for msg in messages {
        let role = normalize_role(&msg.role).to_string();
        match &msg.content {
            Some(Value::Array(parts)) => {
                let mut text_parts = Vec::new();
                for part in parts {
                    match part.get("type").and_then(Value::as_str) {
                        Some("text") => {
                            if let Some(t) = part.get("text").and_then(Value::as_str) {
                                text_parts.push(t.to_string());
                            }
                        }
                        Some("image_url") => {
                            let url = part
                                .get("image_url")
                                .and_then(|v| v.get("url"))
                                .and_then(Value::as_str)
                                .unwrap_or("");
                            if let Some(caps) = data_url_in_list_pattern().captures(url) {
                                let mime_type = caps[1].to_string();
                                let data = caps[2].to_string();
                                let file_name = new_upload_filename(&mime_type);
                                files.push(Attachment { file_name, content_type: mime_type, data });
                            }
                        }
                        _ => {}
                    }
                }
                cleaned.push(CleanedMessage { role, content: text_parts.join("\n") });
            }
            Some(Value::String(s)) => {
                let spans = code_span_extents(s);
                let mut extracted: Vec<(String, String)> = Vec::new();
                for caps in data_url_in_string_pattern().captures_iter(s) {
                    let m = caps.get(0).unwrap();
                    if in_any_span(m.start(), &spans) {
                        continue;
                    }
                    extracted.push((caps[1].to_string(), caps[2].to_string()));
                }

                let content = if extracted.is_empty() {
                    s.clone()
                } else {
                    for (mime_type, data) in &extracted {
                        let content_type = format!("image/{mime_type}");
                        let file_name = new_upload_filename(&content_type);
                        files.push(Attachment { file_name, content_type, data: data.clone() });
                    }
                    let redacted = data_url_in_string_pattern().replace_all(s, |caps: &regex::Captures| {
                        let m = caps.get(0).unwrap();
                        if in_any_span(m.start(), &spans) {
                            m.as_str().to_string()
                        } else {
                            String::new()
                        }
                    });
                    redacted.trim().to_string()
                };
                cleaned.push(CleanedMessage { role, content });
            }
            Some(other) => {
                cleaned.push(CleanedMessage { role, content: other.to_string() });
            }
            None => {
                cleaned.push(CleanedMessage { role, content: String::new() });
            }
        }
    }

    // Suspected code-block misdetection: an unusually large file count where
    // most are tiny is treated as false-positive extraction and discarded.
    if files.len() > MAX_ATTACHMENTS_BEFORE_SUSPECT {
        let small = files.iter().filter(|f| f.data.len() < SMALL_ATTACHMENT_BASE64_LEN).count();
        if small > SMALL_ATTACHMENT_SUSPECT_COUNT {
            tracing::warn!(
                file_count = files.len(),
                small_count = small,
                "discarding suspected false-positive attachment extraction"
            );
            files.clear();
        }
    }

    (cleaned, files)
}

/// Insert the empty-user-message slot per §4.B step 4. Gated behind
/// `Config::insert_empty_user_message` (spec §9 open question).
fn maybe_insert_empty_user_message(messages: &mut Vec<CleanedMessage>, modality: Modality, enabled: bool) {
    if !enabled || modality != Modality::Chat {
        return;
    }
    let last_user = messages.iter().rposition(|m| m.role == "user");
    if let Some(idx) = last_user {
        if messages[idx].content.trim().is_empty() {
            messages[idx].content = " ".to_string();
        }
        messages.insert(idx + 1, CleanedMessage { role: "user".to_string(), content: " ".to_string() });
    }
}

/// Merge all system messages into one, in original order, before the first
/// non-system message (§4.B step 5).
fn apply_tavern_mode(messages: Vec<CleanedMessage>) -> Vec<CleanedMessage> {
    let (system, rest): (Vec<_>, Vec<_>) = messages.into_iter().partition(|m| m.role == "system");
    if system.is_empty() {
        return rest;
    }
    let merged = system.into_iter().map(|m| m.content).collect::<Vec<_>>().join("\n\n");
    let mut out = vec![CleanedMessage { role: "system".to_string(), content: merged }];
    out.extend(rest);
    out
}

fn participant_position(role: &str, mode: ConversationMode, battle_target: BattleTarget) -> String {
    match mode {
        ConversationMode::DirectChat => {
            if role == "system" {
                "b".to_string()
            } else {
                "a".to_string()
            }
        }
        ConversationMode::Battle => battle_target.as_participant().to_string(),
    }
}

/// Build the full upstream conversation-graph payload for a fresh session
/// (§4.B steps 1-8).
pub fn translate_request(
    req: &OpenAiChatRequest,
    config: &Config,
    upstream_model_id: &str,
    modality: Modality,
) -> BridgeResult<TranslationResult> {
    if req.messages.is_empty() {
        return Err(BridgeError::PayloadTranslate("request has no messages".to_string()));
    }

    let (mut cleaned, mut files) = clean_messages(&req.messages);
    maybe_insert_empty_user_message(&mut cleaned, modality, config.insert_empty_user_message);

    if config.tavern_mode_enabled {
        cleaned = apply_tavern_mode(cleaned);
    }

    if config.bypass_enabled && modality == Modality::Chat {
        cleaned.push(CleanedMessage { role: "user".to_string(), content: " ".to_string() });
    }

    let evaluation_id = uuid::Uuid::new_v4().to_string();
    let message_ids: Vec<String> = (0..cleaned.len()).map(|_| uuid::Uuid::new_v4().to_string()).collect();

    // Attachments are carried alongside the payload for the peer link to
    // upload separately; the graph's own messages never embed them inline
    // (mirrors the source, which always sets `experimental_attachments: []`
    // on arena messages and returns `files_to_upload` out-of-band).
    let mut arena_messages = Vec::with_capacity(cleaned.len() + 1);
    for (i, msg) in cleaned.iter().enumerate() {
        let parent_message_ids = if i > 0 { vec![message_ids[i - 1].clone()] } else { Vec::new() };
        let position = participant_position(&msg.role, config.default_mode, config.battle_target);
        arena_messages.push(ArenaMessage {
            id: message_ids[i].clone(),
            role: msg.role.clone(),
            content: msg.content.clone(),
            experimental_attachments: Vec::new(),
            parent_message_ids,
            participant_position: position,
            model_id: if msg.role == "assistant" { Some(upstream_model_id.to_string()) } else { None },
            evaluation_session_id: evaluation_id.clone(),
            status: "pending".to_string(),
        });
    }

    let user_message_id = message_ids.last().cloned().unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let model_a_message_id = uuid::Uuid::new_v4().to_string();
    let terminal_position = participant_position("assistant", config.default_mode, config.battle_target);
    arena_messages.push(ArenaMessage {
        id: model_a_message_id.clone(),
        role: "assistant".to_string(),
        content: String::new(),
        experimental_attachments: Vec::new(),
        parent_message_ids: vec![user_message_id.clone()],
        participant_position: terminal_position,
        model_id: Some(upstream_model_id.to_string()),
        evaluation_session_id: evaluation_id.clone(),
        status: "pending".to_string(),
    });

    let files_to_upload = std::mem::take(&mut files);

    let payload = ArenaPayload {
        id: evaluation_id,
        mode: "direct",
        model_a_id: upstream_model_id.to_string(),
        user_message_id,
        model_a_message_id,
        messages: arena_messages,
        modality,
    };

    Ok(TranslationResult { payload, files_to_upload })
}

/// Build the reduced retry/reuse payload for dispatching on a warmed
/// session (§4.B, "retry/reuse variant").
pub fn translate_retry_request(
    req: &OpenAiChatRequest,
    message_id: &str,
    evaluation_session_id: &str,
) -> BridgeResult<(RetryPayload, Vec<Attachment>)> {
    let (cleaned, files) = clean_messages(&req.messages);
    let last_user_text = cleaned
        .iter()
        .rev()
        .find(|m| m.role == "user")
        .map(|m| m.content.clone())
        .ok_or_else(|| BridgeError::PayloadTranslate("no user message to retry".to_string()))?;

    let payload = RetryPayload {
        message: RetryMessage { role: "user", content: last_user_text, attachments: Vec::new() },
        stream: true,
        message_id: message_id.to_string(),
        evaluation_session_id: evaluation_session_id.to_string(),
    };
    Ok((payload, files))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(messages: Vec<(&str, &str)>) -> OpenAiChatRequest {
        OpenAiChatRequest {
            model: "gpt-4o".to_string(),
            stream: true,
            messages: messages
                .into_iter()
                .map(|(role, content)| OpenAiMessage {
                    role: role.to_string(),
                    content: Some(Value::String(content.to_string())),
                })
                .collect(),
        }
    }

    #[test]
    fn developer_role_collapses_to_system() {
        assert_eq!(normalize_role("developer"), "system");
        assert_eq!(normalize_role("bogus"), "user");
    }

    #[test]
    fn extracts_data_url_outside_code_span() {
        let content = "here is a pic data:image/png;base64,AAAA and some text";
        let (cleaned, files) = clean_messages(&[OpenAiMessage {
            role: "user".to_string(),
            content: Some(Value::String(content.to_string())),
        }]);
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].content_type, "image/png");
        assert!(!cleaned[0].content.contains("data:image"));
    }

    #[test]
    fn preserves_data_url_inside_fenced_code_block() {
        let content = "```\ndata:image/png;base64,AAAA\n```";
        let (cleaned, files) = clean_messages(&[OpenAiMessage {
            role: "user".to_string(),
            content: Some(Value::String(content.to_string())),
        }]);
        assert!(files.is_empty());
        assert_eq!(cleaned[0].content, content);
    }

    #[test]
    fn preserves_data_url_inside_inline_code_span() {
        let content = "see `data:image/png;base64,AAAA` above";
        let (cleaned, files) = clean_messages(&[OpenAiMessage {
            role: "user".to_string(),
            content: Some(Value::String(content.to_string())),
        }]);
        assert!(files.is_empty());
        assert_eq!(cleaned[0].content, content);
    }

    #[test]
    fn suspiciously_many_small_attachments_are_discarded() {
        let mut content = String::new();
        for _ in 0..12 {
            content.push_str("data:image/png;base64,AAAA ");
        }
        let (_, files) = clean_messages(&[OpenAiMessage {
            role: "user".to_string(),
            content: Some(Value::String(content)),
        }]);
        assert!(files.is_empty());
    }

    #[test]
    fn empty_user_message_inserted_after_last_user_when_enabled() {
        let mut config = Config::default();
        config.insert_empty_user_message = true;
        let r = req(vec![("user", "hi")]);
        let result = translate_request(&r, &config, "claude-3", Modality::Chat).unwrap();
        let roles: Vec<&str> = result.payload.messages.iter().map(|m| m.role.as_str()).collect();
        assert_eq!(roles, vec!["user", "user", "assistant"]);
        assert_eq!(result.payload.messages[1].content, " ");
    }

    #[test]
    fn empty_user_message_skipped_when_disabled() {
        let mut config = Config::default();
        config.insert_empty_user_message = false;
        let r = req(vec![("user", "hi")]);
        let result = translate_request(&r, &config, "claude-3", Modality::Chat).unwrap();
        let roles: Vec<&str> = result.payload.messages.iter().map(|m| m.role.as_str()).collect();
        assert_eq!(roles, vec!["user", "assistant"]);
    }

    #[test]
    fn tavern_mode_merges_system_messages_in_order() {
        let mut config = Config::default();
        config.insert_empty_user_message = false;
        config.tavern_mode_enabled = true;
        let r = req(vec![("system", "A"), ("user", "U"), ("system", "B")]);
        let result = translate_request(&r, &config, "claude-3", Modality::Chat).unwrap();
        assert_eq!(result.payload.messages[0].role, "system");
        assert_eq!(result.payload.messages[0].content, "A\n\nB");
        assert_eq!(result.payload.messages[1].role, "user");
    }

    #[test]
    fn bypass_mode_appends_placeholder_for_chat_only() {
        let mut config = Config::default();
        config.insert_empty_user_message = false;
        config.bypass_enabled = true;
        let r = req(vec![("user", "hi")]);
        let chat_result = translate_request(&r, &config, "claude-3", Modality::Chat).unwrap();
        let roles: Vec<&str> = chat_result.payload.messages.iter().map(|m| m.role.as_str()).collect();
        assert_eq!(roles, vec!["user", "user", "assistant"]);

        let image_result = translate_request(&r, &config, "claude-3", Modality::Image).unwrap();
        let roles: Vec<&str> = image_result.payload.messages.iter().map(|m| m.role.as_str()).collect();
        assert_eq!(roles, vec!["user", "assistant"]);
    }

    #[test]
    fn direct_chat_positions_system_as_b_and_rest_as_a() {
        let mut config = Config::default();
        config.insert_empty_user_message = false;
        config.default_mode = ConversationMode::DirectChat;
        let r = req(vec![("system", "sys"), ("user", "hi")]);
        let result = translate_request(&r, &config, "claude-3", Modality::Chat).unwrap();
        assert_eq!(result.payload.messages[0].participant_position, "b");
        assert_eq!(result.payload.messages[1].participant_position, "a");
    }

    #[test]
    fn battle_mode_positions_everyone_at_target() {
        let mut config = Config::default();
        config.insert_empty_user_message = false;
        config.default_mode = ConversationMode::Battle;
        config.battle_target = BattleTarget::B;
        let r = req(vec![("system", "sys"), ("user", "hi")]);
        let result = translate_request(&r, &config, "claude-3", Modality::Chat).unwrap();
        assert!(result.payload.messages.iter().all(|m| m.participant_position == "b"));
    }

    #[test]
    fn graph_chains_parents_in_order() {
        let mut config = Config::default();
        config.insert_empty_user_message = false;
        let r = req(vec![("user", "one"), ("assistant", "two"), ("user", "three")]);
        let result = translate_request(&r, &config, "claude-3", Modality::Chat).unwrap();
        let msgs = &result.payload.messages;
        assert!(msgs[0].parent_message_ids.is_empty());
        for i in 1..msgs.len() {
            assert_eq!(msgs[i].parent_message_ids, vec![msgs[i - 1].id.clone()]);
        }
    }

    #[test]
    fn retry_payload_carries_last_user_text_only() {
        let r = req(vec![("user", "first"), ("assistant", "reply"), ("user", "second")]);
        let (payload, _files) = translate_retry_request(&r, "msg-1", "eval-1").unwrap();
        assert_eq!(payload.message.content, "second");
        assert_eq!(payload.message_id, "msg-1");
        assert!(payload.stream);
    }

    #[test]
    fn rejects_empty_message_list() {
        let config = Config::default();
        let r = OpenAiChatRequest { model: "gpt-4o".to_string(), stream: true, messages: vec![] };
        let err = translate_request(&r, &config, "claude-3", Modality::Chat).unwrap_err();
        assert!(matches!(err, BridgeError::PayloadTranslate(_)));
    }
}
