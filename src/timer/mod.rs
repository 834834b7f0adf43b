//! Per-session named timers.
//!
//! A timer exists in the registry only while armed. Expiry removes the
//! name, so "expired" and "never started" are the same observable fact:
//! the name is absent.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Named one-shot timers for a single session.
///
/// Timers run on detached tasks and never block the caller. Arming a name
/// twice is a logged no-op; stopping an absent name is a silent no-op.
pub struct TimerRegistry {
    session_id: String,
    timers: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
}

impl TimerRegistry {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            timers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Arm `name` to expire after `delay`.
    pub async fn start(&self, delay: Duration, name: &str) {
        let mut timers = self.timers.lock().await;
        if timers.contains_key(name) {
            tracing::error!(
                session_id = %self.session_id,
                timer = name,
                "timer already armed"
            );
            return;
        }
        tracing::info!(session_id = %self.session_id, timer = name, "start timer");
        let registry = Arc::clone(&self.timers);
        let session_id = self.session_id.clone();
        let key = name.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            tracing::info!(session_id = %session_id, timer = %key, "timer expired");
            registry.lock().await.remove(&key);
        });
        timers.insert(name.to_string(), handle);
    }

    /// Cancel `name` if it is still armed.
    pub async fn stop(&self, name: &str) {
        if let Some(handle) = self.timers.lock().await.remove(name) {
            tracing::info!(session_id = %self.session_id, timer = name, "stop timer");
            handle.abort();
        }
    }

    /// True iff `name` is not currently armed.
    pub async fn is_expired(&self, name: &str) -> bool {
        !self.timers.lock().await.contains_key(name)
    }

    /// Cancel every armed timer. Used on session teardown.
    pub async fn stop_all(&self) {
        let mut timers = self.timers.lock().await;
        for (name, handle) in timers.drain() {
            tracing::info!(session_id = %self.session_id, timer = %name, "stop timer");
            handle.abort();
        }
    }
}
