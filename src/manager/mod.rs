//! Session manager.
//!
//! Owns the registry of running maintenance sessions: creates them (up to
//! [`MAX_SESSIONS`]), dispatches admin and project calls to the right
//! session, and tears sessions down. The store, compute adapter and
//! notifier are injected so independent managers can coexist.

use crate::actions::{ActionPlugin, ActionPluginSpec, PluginRegistry};
use crate::compute::ComputeAdapter;
use crate::config::AppConfig;
use crate::notify::Notifier;
use crate::session::{Action, ProjectState, SessionData, WorkflowState};
use crate::store::Store;
use crate::timer::TimerRegistry;
use crate::workflow::{self, EngineContext, WorkflowKind};
use crate::{DrydockError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Concurrent session cap.
pub const MAX_SESSIONS: usize = 3;

/// Admin payload creating one maintenance session.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateSessionRequest {
    /// In-scope hosts; discovered from the service list when omitted.
    #[serde(default)]
    pub hosts: Option<Vec<String>>,
    pub maintenance_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: serde_json::Value,
    #[serde(default)]
    pub workflow: Option<String>,
    #[serde(default)]
    pub actions: Option<Vec<ActionPluginSpec>>,
}

/// A project's asynchronous reply to a maintenance notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectReply {
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_actions: Option<HashMap<String, Action>>,
}

struct SessionHandle {
    data: Arc<Mutex<SessionData>>,
    timers: Arc<TimerRegistry>,
    stopped: Arc<AtomicBool>,
    worker: JoinHandle<()>,
}

pub struct SessionManager {
    config: AppConfig,
    store: Arc<Store>,
    compute: Arc<dyn ComputeAdapter>,
    notifier: Arc<dyn Notifier>,
    plugins: Arc<PluginRegistry>,
    sessions: Mutex<HashMap<String, SessionHandle>>,
}

impl SessionManager {
    pub fn new(
        config: AppConfig,
        store: Arc<Store>,
        compute: Arc<dyn ComputeAdapter>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            config,
            store,
            compute,
            notifier,
            plugins: Arc::new(PluginRegistry::new()),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Ids of the running sessions.
    pub async fn admin_get(&self) -> Vec<String> {
        self.sessions.lock().await.keys().cloned().collect()
    }

    /// Create a session and start its workflow worker.
    pub async fn admin_create_session(&self, request: CreateSessionRequest) -> Result<String> {
        let mut sessions = self.sessions.lock().await;
        if sessions.len() >= MAX_SESSIONS {
            tracing::error!(max = MAX_SESSIONS, "too many sessions");
            return Err(DrydockError::TooManySessions);
        }
        let kind = WorkflowKind::parse(request.workflow.as_deref().unwrap_or("default"))?;
        let session_id = uuid::Uuid::new_v4().to_string();
        tracing::info!(
            session_id = %session_id,
            workflow = kind.as_str(),
            maintenance_at = %request.maintenance_at,
            "creating maintenance session"
        );

        self.store.create_session(
            &session_id,
            WorkflowState::Maintenance,
            request.maintenance_at,
            &request.metadata.to_string(),
            kind.as_str(),
        )?;
        let mut data = SessionData::new(
            Arc::clone(&self.store),
            &session_id,
            request.maintenance_at,
            request.metadata.clone(),
        );
        if let Some(hosts) = &request.hosts {
            data.add_hosts(hosts)?;
        }
        if let Some(actions) = request.actions {
            let plugins: Vec<ActionPlugin> = actions.into_iter().map(Into::into).collect();
            self.store.create_action_plugins(&session_id, &plugins)?;
        }

        let data = Arc::new(Mutex::new(data));
        let timers = Arc::new(TimerRegistry::new(&session_id));
        let stopped = Arc::new(AtomicBool::new(false));
        let ctx = EngineContext {
            session_id: session_id.clone(),
            config: self.config.clone(),
            store: Arc::clone(&self.store),
            compute: Arc::clone(&self.compute),
            notifier: Arc::clone(&self.notifier),
            plugins: Arc::clone(&self.plugins),
            timers: Arc::clone(&timers),
            data: Arc::clone(&data),
            stopped: Arc::clone(&stopped),
        };
        let worker = tokio::spawn(workflow::run(ctx, kind));
        sessions.insert(
            session_id.clone(),
            SessionHandle {
                data,
                timers,
                stopped,
                worker,
            },
        );
        Ok(session_id)
    }

    /// Current state of a session, or `None` for an unknown id.
    pub async fn admin_get_session(&self, session_id: &str) -> Option<(String, WorkflowState)> {
        let sessions = self.sessions.lock().await;
        let handle = sessions.get(session_id)?;
        let state = handle.data.lock().await.state;
        Some((session_id.to_string(), state))
    }

    /// Remove persistent state, stop the worker and evict the session.
    pub async fn admin_delete_session(&self, session_id: &str) -> Result<()> {
        let mut sessions = self.sessions.lock().await;
        if !sessions.contains_key(session_id) {
            return Err(DrydockError::InvalidSession(session_id.to_string()));
        }
        tracing::info!(session_id, "deleting maintenance session");
        self.store.remove_session(session_id)?;
        if let Some(handle) = sessions.remove(session_id) {
            handle.timers.stop_all().await;
            handle.stopped.store(true, Ordering::SeqCst);
            handle.worker.abort();
        }
        Ok(())
    }

    /// The admin update body is accepted and ignored.
    pub async fn admin_update_session(&self, session_id: &str) -> Result<String> {
        if !self.sessions.lock().await.contains_key(session_id) {
            return Err(DrydockError::InvalidSession(session_id.to_string()));
        }
        tracing::info!(session_id, "admin session update");
        Ok(session_id.to_string())
    }

    /// Instance ids a project is currently expected to act on.
    pub async fn project_get_session(
        &self,
        session_id: &str,
        project_id: &str,
    ) -> Result<Vec<String>> {
        let sessions = self.sessions.lock().await;
        let handle = sessions
            .get(session_id)
            .ok_or_else(|| DrydockError::InvalidSession(session_id.to_string()))?;
        let data = handle.data.lock().await;
        Ok(data.state_instance_ids(project_id))
    }

    /// Reply gateway: record a project's state answer and chosen actions.
    /// The session's workflow observes the change on its next poll.
    pub async fn project_update_session(
        &self,
        session_id: &str,
        project_id: &str,
        reply: ProjectReply,
    ) -> Result<ProjectReply> {
        let sessions = self.sessions.lock().await;
        let handle = sessions
            .get(session_id)
            .ok_or_else(|| DrydockError::InvalidSession(session_id.to_string()))?;
        let state = ProjectState::parse(&reply.state)
            .map_err(|_| DrydockError::BadRequest(format!("invalid state '{}'", reply.state)))?;
        tracing::info!(
            session_id,
            project_id,
            state = %state,
            "project reply received"
        );
        let mut data = handle.data.lock().await;
        data.set_project_reply(project_id, state)?;
        if let Some(instance_actions) = &reply.instance_actions {
            data.set_instance_actions(project_id, instance_actions.clone())?;
        }
        Ok(reply)
    }
}
