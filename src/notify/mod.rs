//! Notification fan-out to tenant projects and administrators.
//!
//! Two logical channels ride one bus topic: `maintenance.scheduled`
//! envelopes toward projects and `maintenance.host` envelopes toward the
//! admin. Delivery is fire-and-forget; a project's acknowledgement comes
//! back only through the reply gateway.

use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use tokio::sync::broadcast;

/// Event type of envelopes sent to projects.
pub const PROJECT_EVENT: &str = "maintenance.scheduled";
/// Event type of envelopes sent to the admin.
pub const ADMIN_EVENT: &str = "maintenance.host";

/// Envelope sent to one project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectNotification {
    pub project_id: String,
    pub instance_ids: Vec<String>,
    pub allowed_actions: Vec<crate::session::Action>,
    pub state: String,
    pub actions_at: Option<DateTime<Utc>>,
    pub reply_at: Option<DateTime<Utc>>,
    pub session_id: String,
    pub metadata: serde_json::Value,
    pub reply_url: String,
}

/// Envelope sent to the admin about one host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminNotification {
    pub project_id: String,
    pub host: String,
    pub state: String,
    pub session_id: String,
}

/// One message on the bus.
#[derive(Debug, Clone)]
pub enum BusEvent {
    Scheduled(ProjectNotification),
    Host(AdminNotification),
}

impl BusEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            BusEvent::Scheduled(_) => PROJECT_EVENT,
            BusEvent::Host(_) => ADMIN_EVENT,
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify_project(&self, notification: ProjectNotification) -> Result<()>;

    async fn notify_admin(&self, notification: AdminNotification) -> Result<()>;

    /// Projects subscribed to `event_type` alarms. The workflow refuses to
    /// run maintenance for a project that would never hear about it.
    async fn subscribed_projects(&self, event_type: &str) -> Result<Vec<String>>;
}

/// In-process broadcast bus.
///
/// Consumers (a bus bridge, tests) subscribe for [`BusEvent`]s; lagging
/// receivers lose messages rather than exerting back-pressure.
pub struct BusNotifier {
    topic: String,
    sender: broadcast::Sender<BusEvent>,
    subscriptions: Mutex<HashMap<String, HashSet<String>>>,
}

impl BusNotifier {
    pub fn new(topic: impl Into<String>) -> Self {
        let (sender, _) = broadcast::channel(256);
        Self {
            topic: topic.into(),
            sender,
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.sender.subscribe()
    }

    /// Register a project as listening to `event_type` alarms.
    pub fn register_listener(&self, event_type: &str, project_id: &str) {
        if let Ok(mut subscriptions) = self.subscriptions.lock() {
            subscriptions
                .entry(event_type.to_string())
                .or_default()
                .insert(project_id.to_string());
        }
    }

    fn publish(&self, event: BusEvent) {
        tracing::info!(
            topic = %self.topic,
            event_type = event.event_type(),
            "publishing notification"
        );
        // Fire-and-forget: no receivers is not an error.
        let _ = self.sender.send(event);
    }
}

#[async_trait]
impl Notifier for BusNotifier {
    async fn notify_project(&self, notification: ProjectNotification) -> Result<()> {
        self.publish(BusEvent::Scheduled(notification));
        Ok(())
    }

    async fn notify_admin(&self, notification: AdminNotification) -> Result<()> {
        self.publish(BusEvent::Host(notification));
        Ok(())
    }

    async fn subscribed_projects(&self, event_type: &str) -> Result<Vec<String>> {
        Ok(self
            .subscriptions
            .lock()
            .map(|subscriptions| {
                subscriptions
                    .get(event_type)
                    .map(|projects| projects.iter().cloned().collect())
                    .unwrap_or_default()
            })
            .unwrap_or_default())
    }
}
