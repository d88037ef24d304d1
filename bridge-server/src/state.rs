//! Process-wide state, injected into every axum handler via `State`.
//!
//! Replaces the source's module-level globals (`browser_ws`,
//! `response_channels`, `MODEL_REGISTRY`) with one value built in `main`
//! and shared behind an `Arc` (spec §9 design note, SPEC_FULL §2).

use bridge_core::config::Config;
use bridge_core::models::ModelRegistry;
use bridge_core::peer::heartbeat::Tracker;
use bridge_core::peer::PeerLink;
use bridge_core::registry::RequestRegistry;
use bridge_core::session::PoolManager;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::logging::RotatingJsonlWriter;

pub struct Bridge {
    pub config: Config,
    pub models: ModelRegistry,
    pub pools: PoolManager,
    pub registry: Arc<RequestRegistry>,
    pub peer: Arc<PeerLink>,
    pub heartbeat_tracker: Arc<Tracker>,
    pub id_capture_active: AtomicBool,
    pub request_log: RotatingJsonlWriter,
    pub error_log: RotatingJsonlWriter,
}

impl Bridge {
    pub fn new(config: Config) -> anyhow::Result<Arc<Self>> {
        let request_log = RotatingJsonlWriter::new(
            config.log_dir.join("requests.jsonl"),
            config.max_log_bytes,
            config.max_log_files,
        )?;
        let error_log = RotatingJsonlWriter::new(
            config.log_dir.join("errors.jsonl"),
            config.max_log_bytes,
            config.max_log_files,
        )?;

        Ok(Arc::new(Self {
            models: ModelRegistry::new(),
            pools: PoolManager::new(),
            registry: RequestRegistry::new(config.max_active_requests),
            peer: Arc::new(PeerLink::new()),
            heartbeat_tracker: Arc::new(Tracker::new()),
            id_capture_active: AtomicBool::new(false),
            request_log,
            error_log,
            config,
        }))
    }

    pub fn require_auth(&self, presented: Option<&str>) -> bool {
        match &self.config.api_key {
            None => true,
            Some(expected) => presented == Some(expected.as_str()),
        }
    }

    pub fn set_id_capture(&self, active: bool) {
        self.id_capture_active.store(active, Ordering::SeqCst);
    }

    pub fn is_id_capture_active(&self) -> bool {
        self.id_capture_active.load(Ordering::SeqCst)
    }
}

pub type SharedBridge = Arc<Bridge>;
