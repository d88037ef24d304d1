use serde::Serialize;
use thiserror::Error;

/// The bridge's error taxonomy (spec §7). Each variant carries its own HTTP
/// status and OpenAI-style error `type` string so handlers never have to
/// re-derive either.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("peer not connected")]
    PeerMissing,

    #[error("unknown model: {0}")]
    ModelUnknown(String),

    #[error("missing or invalid bearer token")]
    Auth,

    #[error("timed out waiting for a free session")]
    SessionWaitTimeout,

    #[error("failed to translate request: {0}")]
    PayloadTranslate(String),

    #[error("attachment too large: {0}")]
    AttachmentTooLarge(String),

    #[error("upstream requires a Cloudflare challenge: {0}")]
    CloudflareChallenge(String),

    #[error("request timed out after {0}s")]
    RequestTimeout(u64),

    #[error("client cancelled the request")]
    ClientCancelled,

    #[error("server is shutting down")]
    Shutdown,

    #[error("bridge error: {0}")]
    Bridge(String),

    #[error("request registry is full")]
    RegistryFull,

    #[error("bad request: {0}")]
    BadRequest(String),
}

impl BridgeError {
    pub fn http_status(&self) -> u16 {
        match self {
            BridgeError::PeerMissing => 503,
            BridgeError::ModelUnknown(_) => 404,
            BridgeError::Auth => 401,
            BridgeError::SessionWaitTimeout => 504,
            BridgeError::PayloadTranslate(_) => 500,
            BridgeError::AttachmentTooLarge(_) => 413,
            BridgeError::CloudflareChallenge(_) => 200, // surfaced as an SSE/body error frame, not an HTTP failure
            BridgeError::RequestTimeout(_) => 200,
            BridgeError::ClientCancelled => 499,
            BridgeError::Shutdown => 500,
            BridgeError::Bridge(_) => 500,
            BridgeError::RegistryFull => 503,
            BridgeError::BadRequest(_) => 400,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            BridgeError::PeerMissing => "peer_missing",
            BridgeError::ModelUnknown(_) => "model_not_found",
            BridgeError::Auth => "invalid_api_key",
            BridgeError::SessionWaitTimeout => "session_wait_timeout",
            BridgeError::PayloadTranslate(_) => "payload_translate_error",
            BridgeError::AttachmentTooLarge(_) => "attachment_too_large",
            BridgeError::CloudflareChallenge(_) => "cloudflare_challenge",
            BridgeError::RequestTimeout(_) => "timeout",
            BridgeError::ClientCancelled => "client_cancelled",
            BridgeError::Shutdown => "shutdown",
            BridgeError::Bridge(_) => "bridge_error",
            BridgeError::RegistryFull => "capacity_exceeded",
            BridgeError::BadRequest(_) => "bad_request",
        }
    }

    /// Render the OpenAI `{error: {message, type, code}}` envelope.
    pub fn to_openai_envelope(&self) -> OpenAiErrorEnvelope {
        OpenAiErrorEnvelope {
            error: OpenAiErrorBody {
                message: self.to_string(),
                r#type: self.code().to_string(),
                code: Some(self.code().to_string()),
            },
        }
    }
}

#[derive(Debug, Serialize)]
pub struct OpenAiErrorEnvelope {
    pub error: OpenAiErrorBody,
}

#[derive(Debug, Serialize)]
pub struct OpenAiErrorBody {
    pub message: String,
    pub r#type: String,
    pub code: Option<String>,
}

pub type BridgeResult<T> = Result<T, BridgeError>;
