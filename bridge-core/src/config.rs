//! Config loading (JSONC snapshot + env overrides) and the whitelisted
//! single-key rewriter used by the `id_updater` peripheral (spec §4.H).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationMode {
    DirectChat,
    Battle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BattleTarget {
    A,
    B,
}

impl BattleTarget {
    pub fn as_participant(&self) -> &'static str {
        match self {
            BattleTarget::A => "a",
            BattleTarget::B => "b",
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EndpointEntry {
    pub session_id: String,
    pub message_id: String,
    #[serde(default)]
    pub mode: Option<ConversationMode>,
    #[serde(default)]
    pub battle_target: Option<BattleTarget>,
}

impl EndpointEntry {
    /// A placeholder entry (unset ids) should never be dispatched to.
    pub fn is_placeholder(&self) -> bool {
        self.session_id.trim().is_empty()
            || self.message_id.trim().is_empty()
            || self.session_id == "PASTE_SESSION_ID_HERE"
            || self.message_id == "PASTE_MESSAGE_ID_HERE"
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum EndpointConfig {
    Single(EndpointEntry),
    Many(Vec<EndpointEntry>),
}

impl EndpointConfig {
    /// Resolve to one entry, randomly selecting among a list (spec §4.F step 2).
    pub fn choose(&self) -> Option<&EndpointEntry> {
        match self {
            EndpointConfig::Single(e) => Some(e),
            EndpointConfig::Many(v) => {
                if v.is_empty() {
                    None
                } else {
                    let idx = rand::random::<usize>() % v.len();
                    v.get(idx)
                }
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WarmupSpec {
    pub model: String,
    pub count: usize,
    pub initial_prompt: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub api_key: Option<String>,
    pub host: String,
    pub port: u16,
    pub tavern_mode_enabled: bool,
    pub bypass_enabled: bool,
    pub default_mode: ConversationMode,
    pub battle_target: BattleTarget,
    pub request_timeout_seconds: u64,
    pub session_acquire_timeout_seconds: u64,
    pub backpressure_queue_size: usize,
    pub max_active_requests: usize,
    pub insert_empty_user_message: bool,
    pub warmup: Vec<WarmupSpec>,
    pub model_endpoint_map: HashMap<String, EndpointConfig>,
    pub log_dir: PathBuf,
    pub max_log_bytes: u64,
    pub max_log_files: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_key: None,
            host: "0.0.0.0".to_string(),
            port: 9080,
            tavern_mode_enabled: false,
            bypass_enabled: false,
            default_mode: ConversationMode::DirectChat,
            battle_target: BattleTarget::A,
            request_timeout_seconds: 180,
            session_acquire_timeout_seconds: 120,
            backpressure_queue_size: 5,
            max_active_requests: 100,
            insert_empty_user_message: true,
            warmup: Vec::new(),
            model_endpoint_map: HashMap::new(),
            log_dir: PathBuf::from("logs"),
            max_log_bytes: 50 * 1024 * 1024,
            max_log_files: 50,
        }
    }
}

/// Load the JSONC config file (comments + trailing commas tolerated via
/// json5), then apply environment overrides for the handful of scalars the
/// source exposed as env vars.
pub fn load_config(path: &Path) -> Result<Config, String> {
    let mut config = if path.exists() {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| format!("failed to read {}: {e}", path.display()))?;
        json5::from_str(&raw).map_err(|e| format!("invalid config at {}: {e}", path.display()))?
    } else {
        Config::default()
    };

    if let Ok(host) = std::env::var("BRIDGE_HOST") {
        config.host = host;
    }
    if let Ok(port) = std::env::var("BRIDGE_PORT") {
        config.port = port
            .parse()
            .map_err(|_| format!("BRIDGE_PORT must be a u16, got {port}"))?;
    }
    if let Ok(key) = std::env::var("BRIDGE_API_KEY") {
        config.api_key = Some(key);
    }

    Ok(config)
}

pub fn default_config_path() -> PathBuf {
    std::env::var("BRIDGE_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("config.jsonc"))
}

/// Keys the `id_updater` collaborator is allowed to rewrite in place inside
/// one `model_endpoint_map.<model>` object. A regex line-edit, not a
/// structural JSON edit — deliberately incapable of adding or removing keys
/// (spec §9 design note).
const WHITELISTED_KEYS: &[&str] = &["session_id", "message_id", "mode"];

/// Rewrite `"<key>": "<old>"` to `"<key>": "<new>"` inside the named
/// model's block of `model_endpoint_map`, preserving everything else in the
/// file byte-for-byte (comments included). Returns an error if `key` isn't
/// whitelisted or the model block can't be found unambiguously.
pub fn set_endpoint_key(raw: &str, model: &str, key: &str, new_value: &str) -> Result<String, String> {
    if !WHITELISTED_KEYS.contains(&key) {
        return Err(format!("key '{key}' is not whitelisted for rewriting"));
    }

    let model_anchor = format!("\"{model}\"");
    let model_pos = raw
        .find(&model_anchor)
        .ok_or_else(|| format!("model '{model}' not found in config"))?;

    // Scope the rewrite to the first matching key after the model anchor,
    // within the same top-level object (bounded by the next top-level '}').
    let tail = &raw[model_pos..];
    let block_end = tail.find("\n}").map(|p| p + model_pos).unwrap_or(raw.len());

    let key_pattern = format!(r#""{key}"\s*:\s*"([^"]*)""#);
    let re = regex::Regex::new(&key_pattern).map_err(|e| e.to_string())?;

    let head = &raw[..model_pos];
    let scoped = &raw[model_pos..block_end];
    let remainder = &raw[block_end..];

    if let Some(m) = re.find(scoped) {
        let replaced = format!(r#""{key}": "{new_value}""#);
        let rewritten = format!("{}{}{}", &scoped[..m.start()], replaced, &scoped[m.end()..]);
        Ok(format!("{head}{rewritten}{remainder}"))
    } else {
        Err(format!("key '{key}' not found near model '{model}'"))
    }
}
