//! Drydock runtime configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Runtime config for the API frontend and the workflow engine.
///
/// Reply windows and poll cadences are `Duration`s so tests can compress
/// time; the defaults match the production pacing.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// API bind address.
    pub host: String,
    /// API port.
    pub port: u16,
    /// Identity the engine acts as toward the compute plane.
    pub workflow_user: String,
    pub workflow_password: String,
    /// Admin project reported in host notifications.
    pub workflow_project: String,
    /// How long projects have to confirm a maintenance state.
    pub project_maintenance_reply: Duration,
    /// How long projects have to complete a scale-in.
    pub project_scale_in_reply: Duration,
    /// Generic reply window where no dedicated one applies.
    pub wait_project_reply: Duration,
    /// Bus topic notifications are published on.
    pub rpc_topic: String,
    /// Compute control plane endpoint.
    pub compute_url: String,
    /// SQLite database location.
    pub database_path: PathBuf,
    /// Poll cadence while waiting for project replies.
    pub reply_poll_interval: Duration,
    /// Poll cadence while waiting for a hypervisor to drain or a
    /// migration to progress.
    pub drain_poll_interval: Duration,
    /// Drain polls before giving up on a host (~4 minutes at defaults).
    pub drain_poll_attempts: u32,
    /// Migration-progress polls before giving up (~3 minutes at defaults).
    pub migrate_poll_attempts: u32,
    /// Bounded retries when the compute plane rejects a migration request.
    pub migrate_retries: u32,
    /// Back-off before the first migration retry; each further retry
    /// waits one additional step.
    pub migrate_retry_backoff: Duration,
    pub migrate_retry_backoff_step: Duration,
    /// Stand-in for host maintenance when a session declares no plugins.
    pub host_maintenance_delay: Duration,
}

impl AppConfig {
    /// Base URL projects are given to reply against.
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5000,
            workflow_user: "admin".to_string(),
            workflow_password: "admin".to_string(),
            workflow_project: "admin".to_string(),
            project_maintenance_reply: Duration::from_secs(20),
            project_scale_in_reply: Duration::from_secs(60),
            wait_project_reply: Duration::from_secs(120),
            rpc_topic: "maintenance".to_string(),
            compute_url: "http://127.0.0.1:8774/v2.1".to_string(),
            database_path: PathBuf::from("drydock.db"),
            reply_poll_interval: Duration::from_secs(1),
            drain_poll_interval: Duration::from_secs(5),
            drain_poll_attempts: 48,
            migrate_poll_attempts: 36,
            migrate_retries: 2,
            migrate_retry_backoff: Duration::from_secs(90),
            migrate_retry_backoff_step: Duration::from_secs(60),
            host_maintenance_delay: Duration::from_secs(5),
        }
    }
}
