//! Per-model session pool: acquire/release/mark-unhealthy with a FIFO
//! waiter queue, single-target wakeups (spec §3, §4.C).

use super::{Session, SessionStatus};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex, RwLock};
use tokio::time::Instant;

#[derive(Debug, Default, Clone, Copy)]
pub struct PoolSnapshot {
    pub available: usize,
    pub in_use: usize,
    pub unhealthy: usize,
}

/// One model's pool: an ordered session list plus a FIFO queue of parked
/// acquirers. Each field is guarded by its own mutex so a wakeup never has
/// to hold the session list lock.
pub struct SessionPool {
    sessions: Mutex<Vec<Session>>,
    waiters: Mutex<VecDeque<oneshot::Sender<()>>>,
}

impl SessionPool {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(Vec::new()),
            waiters: Mutex::new(VecDeque::new()),
        }
    }

    pub async fn add(&self, session: Session) {
        self.sessions.lock().await.push(session);
        self.wake_one().await;
    }

    /// Block up to `timeout` for an available session, re-scanning the pool
    /// every time a wakeup (or the per-iteration timeout) fires.
    pub async fn acquire(&self, timeout: Duration) -> Option<Session> {
        let deadline = Instant::now() + timeout;
        loop {
            // Enqueue before the re-check: a `release`/`add` landing between
            // this push and `try_take` then wakes us instead of finding an
            // empty queue, so we never park for the full timeout on a
            // session that became available while we were about to wait.
            let (tx, rx) = oneshot::channel();
            self.waiters.lock().await.push_back(tx);

            if let Some(session) = self.try_take().await {
                return Some(session);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }

            // Ignore the result: whether we were woken, timed out, or the
            // sender was dropped, we just re-scan the pool on the next loop.
            let _ = tokio::time::timeout(remaining, rx).await;
        }
    }

    async fn try_take(&self) -> Option<Session> {
        let mut sessions = self.sessions.lock().await;
        for s in sessions.iter_mut() {
            if s.status == SessionStatus::Available {
                s.status = SessionStatus::InUse;
                s.touch();
                return Some(s.clone());
            }
        }
        None
    }

    pub async fn release(&self, session_id: &str) {
        let mut sessions = self.sessions.lock().await;
        if let Some(s) = sessions.iter_mut().find(|s| s.session_id == session_id) {
            s.status = SessionStatus::Available;
            s.touch();
        }
        drop(sessions);
        self.wake_one().await;
    }

    /// Terminal (short of administrative revival, which isn't modeled).
    /// Waiters are deliberately not signalled here.
    pub async fn mark_unhealthy(&self, session_id: &str) {
        let mut sessions = self.sessions.lock().await;
        if let Some(s) = sessions.iter_mut().find(|s| s.session_id == session_id) {
            s.status = SessionStatus::Unhealthy;
        }
    }

    pub async fn snapshot(&self) -> PoolSnapshot {
        let sessions = self.sessions.lock().await;
        let mut snap = PoolSnapshot::default();
        for s in sessions.iter() {
            match s.status {
                SessionStatus::Available => snap.available += 1,
                SessionStatus::InUse => snap.in_use += 1,
                SessionStatus::Unhealthy => snap.unhealthy += 1,
            }
        }
        snap
    }

    /// Wake exactly one parked waiter, skipping any whose receiver already
    /// dropped (it timed out between being queued and now).
    async fn wake_one(&self) {
        let mut waiters = self.waiters.lock().await;
        while let Some(tx) = waiters.pop_front() {
            if tx.send(()).is_ok() {
                break;
            }
        }
    }
}

impl Default for SessionPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Registry of per-model pools. `register` is idempotent; `add` registers
/// implicitly so a `session_created` message can never be dropped for an
/// unregistered model.
pub struct PoolManager {
    pools: RwLock<HashMap<String, Arc<SessionPool>>>,
}

impl PoolManager {
    pub fn new() -> Self {
        Self {
            pools: RwLock::new(HashMap::new()),
        }
    }

    pub async fn register(&self, model: &str) {
        let exists = self.pools.read().await.contains_key(model);
        if !exists {
            self.pools
                .write()
                .await
                .entry(model.to_string())
                .or_insert_with(|| Arc::new(SessionPool::new()));
        }
    }

    async fn pool_for(&self, model: &str) -> Arc<SessionPool> {
        if let Some(pool) = self.pools.read().await.get(model) {
            return pool.clone();
        }
        self.register(model).await;
        self.pools.read().await.get(model).cloned().expect("just registered")
    }

    pub async fn add(&self, session: Session) {
        let pool = self.pool_for(&session.model_name).await;
        pool.add(session).await;
    }

    pub async fn acquire(&self, model: &str, timeout: Duration) -> Option<Session> {
        let pool = self.pool_for(model).await;
        pool.acquire(timeout).await
    }

    pub async fn release(&self, model: &str, session_id: &str) {
        if let Some(pool) = self.pools.read().await.get(model) {
            pool.release(session_id).await;
        }
    }

    pub async fn mark_unhealthy(&self, model: &str, session_id: &str) {
        if let Some(pool) = self.pools.read().await.get(model) {
            pool.mark_unhealthy(session_id).await;
        }
    }

    pub async fn snapshot(&self, model: &str) -> Option<PoolSnapshot> {
        let pools = self.pools.read().await;
        if let Some(pool) = pools.get(model) {
            Some(pool.snapshot().await)
        } else {
            None
        }
    }

    pub async fn snapshot_all(&self) -> HashMap<String, PoolSnapshot> {
        let pools = self.pools.read().await;
        let mut out = HashMap::new();
        for (model, pool) in pools.iter() {
            out.insert(model.clone(), pool.snapshot().await);
        }
        out
    }
}

impl Default for PoolManager {
    fn default() -> Self {
        Self::new()
    }
}
