//! Maintenance workflow engine.
//!
//! One session runs one workflow on its own task: a serial loop that
//! dispatches the current [`WorkflowState`] to its handler until a
//! terminal state is reached. Any handler error fails the session, which
//! then idles until the admin deletes it.

pub mod default;

use crate::actions::PluginRegistry;
use crate::compute::ComputeAdapter;
use crate::config::AppConfig;
use crate::notify::{AdminNotification, Notifier, ProjectNotification};
use crate::session::{Action, ProjectState, SessionData, WorkflowState};
use crate::store::Store;
use crate::timer::TimerRegistry;
use crate::{DrydockError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Named workflow implementations. A closed set: unknown names are
/// rejected when the session is created, not when it first runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowKind {
    Default,
}

impl WorkflowKind {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkflowKind::Default => "default",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "default" => Ok(WorkflowKind::Default),
            unknown => Err(DrydockError::Config(format!(
                "unknown workflow '{}'",
                unknown
            ))),
        }
    }
}

/// Everything a workflow needs, injected by the session manager.
pub struct EngineContext {
    pub session_id: String,
    pub config: AppConfig,
    pub store: Arc<Store>,
    pub compute: Arc<dyn ComputeAdapter>,
    pub notifier: Arc<dyn Notifier>,
    pub plugins: Arc<PluginRegistry>,
    pub timers: Arc<TimerRegistry>,
    pub data: Arc<Mutex<SessionData>>,
    pub stopped: Arc<AtomicBool>,
}

impl EngineContext {
    pub fn stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub async fn state(&self) -> WorkflowState {
        self.data.lock().await.state
    }

    pub async fn set_state(&self, state: WorkflowState) -> Result<()> {
        tracing::info!(session_id = %self.session_id, state = %state, "state transition");
        self.data.lock().await.set_state(state)
    }

    /// The instant `wait` from now, as a reply or action deadline.
    pub fn deadline_after(&self, wait: Duration) -> Result<DateTime<Utc>> {
        let wait = chrono::Duration::from_std(wait)
            .map_err(|e| DrydockError::Config(e.to_string()))?;
        Ok(Utc::now() + wait)
    }

    /// Send one `maintenance.scheduled` envelope to a project.
    pub async fn project_notify(
        &self,
        project_id: &str,
        instance_ids: Vec<String>,
        allowed_actions: Vec<Action>,
        actions_at: Option<DateTime<Utc>>,
        reply_at: Option<DateTime<Utc>>,
        state: &str,
        metadata: serde_json::Value,
    ) -> Result<()> {
        let reply_url = format!(
            "{}/v1/maintenance/{}/{}",
            self.config.base_url(),
            self.session_id,
            project_id
        );
        tracing::info!(
            session_id = %self.session_id,
            project_id,
            state,
            "sending maintenance.scheduled"
        );
        self.notifier
            .notify_project(ProjectNotification {
                project_id: project_id.to_string(),
                instance_ids,
                allowed_actions,
                state: state.to_string(),
                actions_at,
                reply_at,
                session_id: self.session_id.clone(),
                metadata,
                reply_url,
            })
            .await
    }

    /// Send one `maintenance.host` envelope to the admin.
    pub async fn admin_notify(&self, host: &str, state: &str) -> Result<()> {
        tracing::info!(session_id = %self.session_id, host, state, "sending maintenance.host");
        self.notifier
            .notify_admin(AdminNotification {
                project_id: self.config.workflow_project.clone(),
                host: host.to_string(),
                state: state.to_string(),
                session_id: self.session_id.clone(),
            })
            .await
    }

    /// True when every session project is subscribed to `event_type`.
    pub async fn projects_listen_alarm(&self, event_type: &str) -> Result<bool> {
        let listeners = self.notifier.subscribed_projects(event_type).await?;
        let mut all_listening = true;
        for project in self.data.lock().await.project_names() {
            if !listeners.contains(&project) {
                tracing::error!(
                    session_id = %self.session_id,
                    project_id = %project,
                    event_type,
                    "project not listening to maintenance alarms"
                );
                all_listening = false;
            }
        }
        Ok(all_listening)
    }

    /// Poll project replies for `state` until all ack, any nack, or the
    /// timer expires.
    pub async fn wait_projects_state(
        &self,
        state: WorkflowState,
        timer_name: &str,
    ) -> Result<()> {
        if self.data.lock().await.get_projects_with_state().is_empty() {
            tracing::warn!(
                session_id = %self.session_id,
                state = %state,
                "no projects to wait for"
            );
            self.timers.stop(timer_name).await;
            return Ok(());
        }
        loop {
            if self.timers.is_expired(timer_name).await {
                let waiting = self.projects_in_state(ProjectState::Asked(state)).await;
                tracing::error!(
                    session_id = %self.session_id,
                    state = %state,
                    timer = timer_name,
                    not_answered = ?waiting,
                    "timer expired waiting for project replies"
                );
                return Err(DrydockError::ProjectTimeout(format!(
                    "{} not answered by {:?}",
                    state, waiting
                )));
            }
            let projects = self.data.lock().await.get_projects_with_state();
            let mut all_acked = true;
            for project in &projects {
                match project.state {
                    Some(ProjectState::Asked(s)) if s == state => {
                        all_acked = false;
                    }
                    Some(ProjectState::Acked(s)) if s == state => {}
                    Some(ProjectState::Nacked(s)) if s == state => {
                        self.timers.stop(timer_name).await;
                        tracing::error!(
                            session_id = %self.session_id,
                            project_id = %project.project_id,
                            state = %state,
                            "project rejected"
                        );
                        return Err(DrydockError::ProjectNack(format!(
                            "NACK_{} from {}",
                            state, project.project_id
                        )));
                    }
                    ref other => {
                        self.timers.stop(timer_name).await;
                        tracing::error!(
                            session_id = %self.session_id,
                            project_id = %project.project_id,
                            reply = ?other,
                            state = %state,
                            "project in invalid state"
                        );
                        return Err(DrydockError::ProjectNack(format!(
                            "project {} in invalid state {:?} while waiting for {}",
                            project.project_id, other, state
                        )));
                    }
                }
            }
            if all_acked {
                self.timers.stop(timer_name).await;
                tracing::info!(
                    session_id = %self.session_id,
                    state = %state,
                    "all projects acked"
                );
                return Ok(());
            }
            tokio::time::sleep(self.config.reply_poll_interval).await;
        }
    }

    async fn projects_in_state(&self, state: ProjectState) -> Vec<String> {
        self.data
            .lock()
            .await
            .get_projects_with_state()
            .into_iter()
            .filter(|p| p.state == Some(state))
            .map(|p| p.project_id)
            .collect()
    }
}

/// A workflow implementation: one handler per non-terminal state.
#[async_trait]
pub trait Workflow: Send {
    fn context(&self) -> &EngineContext;

    /// Run the handler for `state`, returning the next state.
    async fn handle(&mut self, state: WorkflowState) -> Result<WorkflowState>;
}

/// Run the named workflow until its session is stopped.
pub async fn run(ctx: EngineContext, kind: WorkflowKind) {
    match kind {
        WorkflowKind::Default => run_workflow(default::DefaultWorkflow::new(ctx)).await,
    }
}

async fn run_workflow<W: Workflow>(mut workflow: W) {
    let session_id = workflow.context().session_id.clone();
    tracing::info!(session_id = %session_id, "workflow started");
    loop {
        if workflow.context().stopped() {
            break;
        }
        let state = workflow.context().state().await;
        if state.is_terminal() {
            // Idle until the session is deleted.
            tokio::time::sleep(Duration::from_secs(1)).await;
            continue;
        }
        let next = match workflow.handle(state).await {
            Ok(next) => next,
            Err(e) => {
                tracing::error!(
                    session_id = %session_id,
                    state = %state,
                    error = %e,
                    "state handler failed"
                );
                WorkflowState::MaintenanceFailed
            }
        };
        if let Err(e) = workflow.context().set_state(next).await {
            tracing::error!(
                session_id = %session_id,
                error = %e,
                "failed to persist state transition"
            );
            workflow.context().data.lock().await.state = WorkflowState::MaintenanceFailed;
        }
    }
    tracing::info!(session_id = %session_id, "workflow done");
}
