//! Session data model.
//!
//! One [`SessionData`] is the in-memory view of a maintenance run: the
//! hosts in scope, the tenant projects with instances on them, and the
//! per-instance action choices the projects have made. Mutations write
//! through to the session store so the persisted tables mirror this view.

use crate::store::Store;
use crate::{DrydockError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Workflow state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowState {
    Maintenance,
    ScaleIn,
    PrepareMaintenance,
    StartMaintenance,
    PlannedMaintenance,
    MaintenanceComplete,
    MaintenanceDone,
    MaintenanceFailed,
}

impl WorkflowState {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkflowState::Maintenance => "MAINTENANCE",
            WorkflowState::ScaleIn => "SCALE_IN",
            WorkflowState::PrepareMaintenance => "PREPARE_MAINTENANCE",
            WorkflowState::StartMaintenance => "START_MAINTENANCE",
            WorkflowState::PlannedMaintenance => "PLANNED_MAINTENANCE",
            WorkflowState::MaintenanceComplete => "MAINTENANCE_COMPLETE",
            WorkflowState::MaintenanceDone => "MAINTENANCE_DONE",
            WorkflowState::MaintenanceFailed => "MAINTENANCE_FAILED",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "MAINTENANCE" => Ok(WorkflowState::Maintenance),
            "SCALE_IN" => Ok(WorkflowState::ScaleIn),
            "PREPARE_MAINTENANCE" => Ok(WorkflowState::PrepareMaintenance),
            "START_MAINTENANCE" => Ok(WorkflowState::StartMaintenance),
            "PLANNED_MAINTENANCE" => Ok(WorkflowState::PlannedMaintenance),
            "MAINTENANCE_COMPLETE" => Ok(WorkflowState::MaintenanceComplete),
            "MAINTENANCE_DONE" => Ok(WorkflowState::MaintenanceDone),
            "MAINTENANCE_FAILED" => Ok(WorkflowState::MaintenanceFailed),
            other => Err(DrydockError::Internal(format!(
                "unknown workflow state '{}'",
                other
            ))),
        }
    }

    /// Terminal states idle until the session is deleted.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkflowState::MaintenanceDone | WorkflowState::MaintenanceFailed
        )
    }
}

impl std::fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Role of a host in the cluster, from service discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostType {
    Compute,
    Controller,
    Other,
}

impl HostType {
    pub fn as_str(self) -> &'static str {
        match self {
            HostType::Compute => "compute",
            HostType::Controller => "controller",
            HostType::Other => "other",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "compute" => Ok(HostType::Compute),
            "controller" => Ok(HostType::Controller),
            "other" => Ok(HostType::Other),
            unknown => Err(DrydockError::Internal(format!(
                "unknown host type '{}'",
                unknown
            ))),
        }
    }
}

/// Project-selected behavior for one instance asked to vacate a host.
///
/// `LiveMigrate` is reserved: choosing it fails the session step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    Migrate,
    LiveMigrate,
    OwnAction,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Migrate => "MIGRATE",
            Action::LiveMigrate => "LIVE_MIGRATE",
            Action::OwnAction => "OWN_ACTION",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "MIGRATE" => Ok(Action::Migrate),
            "LIVE_MIGRATE" => Ok(Action::LiveMigrate),
            "OWN_ACTION" => Ok(Action::OwnAction),
            unknown => Err(DrydockError::UnsupportedAction(unknown.to_string())),
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Where a project stands on the state the session last asked about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectState {
    /// The question is outstanding.
    Asked(WorkflowState),
    Acked(WorkflowState),
    Nacked(WorkflowState),
}

impl ProjectState {
    /// The workflow state this answer refers to.
    pub fn subject(self) -> WorkflowState {
        match self {
            ProjectState::Asked(s) | ProjectState::Acked(s) | ProjectState::Nacked(s) => s,
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        if let Some(rest) = value.strip_prefix("ACK_") {
            return Ok(ProjectState::Acked(WorkflowState::parse(rest)?));
        }
        if let Some(rest) = value.strip_prefix("NACK_") {
            return Ok(ProjectState::Nacked(WorkflowState::parse(rest)?));
        }
        Ok(ProjectState::Asked(WorkflowState::parse(value)?))
    }
}

impl std::fmt::Display for ProjectState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProjectState::Asked(s) => write!(f, "{}", s),
            ProjectState::Acked(s) => write!(f, "ACK_{}", s),
            ProjectState::Nacked(s) => write!(f, "NACK_{}", s),
        }
    }
}

/// A compute or controller node participating in the session.
#[derive(Debug, Clone)]
pub struct Host {
    pub hostname: String,
    pub kind: HostType,
    pub maintained: bool,
    pub disabled: bool,
    /// Opaque identifier from the compute plane (service id).
    pub details: Option<String>,
}

impl Host {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            kind: HostType::Other,
            maintained: false,
            disabled: false,
            details: None,
        }
    }
}

/// A tenant with at least one instance on an in-scope host.
#[derive(Debug, Clone)]
pub struct Project {
    pub project_id: String,
    pub state: Option<ProjectState>,
}

/// Marker in `Instance.details` for instances with an external address.
pub const FLOATING_IP: &str = "floating_ip";

/// A tenant VM mirrored from the compute plane.
#[derive(Debug, Clone)]
pub struct Instance {
    pub instance_id: String,
    pub instance_name: String,
    pub project_id: String,
    pub host: String,
    /// Compute-plane vm-state string ("active", "resized", "error", ...).
    pub state: String,
    /// Negotiated state stamped when this instance is in the asked set.
    pub project_state: Option<WorkflowState>,
    pub action: Option<Action>,
    pub action_done: bool,
    pub details: Option<String>,
}

impl Instance {
    /// HA-sensitive instances are avoided when picking victim hosts.
    pub fn is_floating_ip(&self) -> bool {
        self.details.as_deref() == Some(FLOATING_IP)
    }
}

/// In-memory view of one maintenance session, write-through persisted.
pub struct SessionData {
    session_id: String,
    pub state: WorkflowState,
    pub maintenance_at: DateTime<Utc>,
    pub metadata: serde_json::Value,
    hosts: Vec<Host>,
    projects: Vec<Project>,
    instances: Vec<Instance>,
    /// Latest action choice per project, keyed by instance id.
    proj_instance_actions: HashMap<String, HashMap<String, Action>>,
    store: Arc<Store>,
}

impl SessionData {
    pub fn new(
        store: Arc<Store>,
        session_id: impl Into<String>,
        maintenance_at: DateTime<Utc>,
        metadata: serde_json::Value,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            state: WorkflowState::Maintenance,
            maintenance_at,
            metadata,
            hosts: Vec::new(),
            projects: Vec::new(),
            instances: Vec::new(),
            proj_instance_actions: HashMap::new(),
            store,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Record a state transition, mirrored to the session row.
    pub fn set_state(&mut self, state: WorkflowState) -> Result<()> {
        self.state = state;
        self.store.set_session_state(&self.session_id, state)
    }

    // ── hosts ────────────────────────────────────────────────────────

    pub fn hosts(&self) -> &[Host] {
        &self.hosts
    }

    pub fn has_host(&self, hostname: &str) -> bool {
        self.hosts.iter().any(|h| h.hostname == hostname)
    }

    /// Register the admin-supplied host list.
    pub fn add_hosts(&mut self, hostnames: &[String]) -> Result<()> {
        self.store.create_hosts(&self.session_id, hostnames)?;
        for hostname in hostnames {
            self.hosts.push(Host::new(hostname));
        }
        Ok(())
    }

    /// Register a host found through service discovery.
    pub fn add_discovered_host(&mut self, host: Host) -> Result<()> {
        self.store.create_host(&self.session_id, &host)?;
        self.hosts.push(host);
        Ok(())
    }

    /// Stamp discovery results onto a known host.
    pub fn stamp_host(
        &mut self,
        hostname: &str,
        kind: HostType,
        details: Option<String>,
        disabled: bool,
    ) -> Result<()> {
        let session_id = self.session_id.clone();
        let store = Arc::clone(&self.store);
        let host = self.host_mut(hostname)?;
        host.kind = kind;
        host.details = details;
        host.disabled = disabled;
        store.update_host(&session_id, host)
    }

    fn host_mut(&mut self, hostname: &str) -> Result<&mut Host> {
        self.hosts
            .iter_mut()
            .find(|h| h.hostname == hostname)
            .ok_or_else(|| DrydockError::NotFound {
                model: "hosts",
                id: hostname.to_string(),
            })
    }

    pub fn compute_hosts(&self) -> Vec<String> {
        self.hosts_by_type(HostType::Compute)
    }

    pub fn controller_hosts(&self) -> Vec<String> {
        self.hosts_by_type(HostType::Controller)
    }

    fn hosts_by_type(&self, kind: HostType) -> Vec<String> {
        self.hosts
            .iter()
            .filter(|h| h.kind == kind)
            .map(|h| h.hostname.clone())
            .collect()
    }

    /// Compute hosts with no instance on them.
    pub fn empty_computes(&self) -> Vec<String> {
        self.compute_hosts()
            .into_iter()
            .filter(|h| !self.instances.iter().any(|i| &i.host == h))
            .collect()
    }

    pub fn maintained_hosts_by_type(&self, kind: HostType) -> Vec<String> {
        self.hosts
            .iter()
            .filter(|h| h.kind == kind && h.maintained)
            .map(|h| h.hostname.clone())
            .collect()
    }

    pub fn disabled_hosts(&self) -> Vec<String> {
        self.hosts
            .iter()
            .filter(|h| h.disabled)
            .map(|h| h.hostname.clone())
            .collect()
    }

    /// `maintained` is monotonic within a session: set, never cleared.
    pub fn mark_host_maintained(&mut self, hostname: &str) -> Result<()> {
        let session_id = self.session_id.clone();
        let store = Arc::clone(&self.store);
        let host = self.host_mut(hostname)?;
        host.maintained = true;
        store.update_host(&session_id, host)
    }

    pub fn set_host_disabled(&mut self, hostname: &str, disabled: bool) -> Result<()> {
        let session_id = self.session_id.clone();
        let store = Arc::clone(&self.store);
        let host = self.host_mut(hostname)?;
        host.disabled = disabled;
        store.update_host(&session_id, host)
    }

    // ── projects ─────────────────────────────────────────────────────

    pub fn project_names(&self) -> Vec<String> {
        self.projects.iter().map(|p| p.project_id.clone()).collect()
    }

    pub fn project(&self, project_id: &str) -> Option<&Project> {
        self.projects.iter().find(|p| p.project_id == project_id)
    }

    /// Projects the session is currently negotiating with.
    pub fn get_projects_with_state(&self) -> Vec<Project> {
        self.projects
            .iter()
            .filter(|p| p.state.is_some())
            .cloned()
            .collect()
    }

    /// Create rows for any project ids not seen before.
    pub fn ensure_projects(&mut self, project_ids: &[String]) -> Result<()> {
        let fresh: Vec<String> = project_ids
            .iter()
            .filter(|id| self.project(id).is_none())
            .cloned()
            .collect();
        if fresh.is_empty() {
            return Ok(());
        }
        self.store.create_projects(&self.session_id, &fresh)?;
        for project_id in fresh {
            self.projects.push(Project {
                project_id,
                state: None,
            });
        }
        Ok(())
    }

    /// Ask every project about `state`; clears per-instance stamps.
    pub fn set_projects_state(&mut self, state: WorkflowState) -> Result<()> {
        for project in &mut self.projects {
            project.state = Some(ProjectState::Asked(state));
            self.store.set_project_state(
                &self.session_id,
                &project.project_id,
                project.state.as_ref(),
            )?;
        }
        for instance in &mut self.instances {
            if instance.project_state.take().is_some() {
                self.store.update_instance(&self.session_id, instance)?;
            }
        }
        Ok(())
    }

    /// Ask only the projects with instances on `hosts` about `state`,
    /// stamping those instances; everyone else is left out of the round.
    pub fn set_projects_state_and_hosts_instances(
        &mut self,
        state: WorkflowState,
        hosts: &[String],
    ) -> Result<()> {
        let mut some_project_has_instances = false;
        let project_ids = self.project_names();
        for project_id in project_ids {
            let mut stamped = false;
            for instance in &mut self.instances {
                if instance.project_id != project_id {
                    continue;
                }
                let on_host = hosts.contains(&instance.host);
                let new_state = on_host.then_some(state);
                if instance.project_state != new_state {
                    instance.project_state = new_state;
                    self.store.update_instance(&self.session_id, instance)?;
                }
                stamped |= on_host;
            }
            let project_state = stamped.then_some(ProjectState::Asked(state));
            some_project_has_instances |= stamped;
            let project = self
                .projects
                .iter_mut()
                .find(|p| p.project_id == project_id)
                .ok_or_else(|| DrydockError::NotFound {
                    model: "projects",
                    id: project_id.clone(),
                })?;
            project.state = project_state;
            self.store
                .set_project_state(&self.session_id, &project_id, project.state.as_ref())?;
        }
        if !some_project_has_instances {
            tracing::error!(
                session_id = %self.session_id,
                hosts = ?hosts,
                "no project has instances on hosts"
            );
        }
        Ok(())
    }

    /// Record a project's reply (the reply gateway calls this).
    pub fn set_project_reply(&mut self, project_id: &str, reply: ProjectState) -> Result<()> {
        let session_id = self.session_id.clone();
        let store = Arc::clone(&self.store);
        let project = self
            .projects
            .iter_mut()
            .find(|p| p.project_id == project_id)
            .ok_or_else(|| DrydockError::NotFound {
                model: "projects",
                id: project_id.to_string(),
            })?;
        project.state = Some(reply);
        store.set_project_state(&session_id, project_id, project.state.as_ref())
    }

    /// Record the actions a project chose for its instances.
    pub fn set_instance_actions(
        &mut self,
        project_id: &str,
        actions: HashMap<String, Action>,
    ) -> Result<()> {
        for instance in &mut self.instances {
            if let Some(action) = actions.get(&instance.instance_id) {
                instance.action = Some(*action);
                self.store.update_instance(&self.session_id, instance)?;
            }
        }
        self.proj_instance_actions
            .insert(project_id.to_string(), actions);
        Ok(())
    }

    /// Projects that declared at least one instance action this round.
    pub fn projects_with_instance_actions(&self) -> Vec<String> {
        self.proj_instance_actions.keys().cloned().collect()
    }

    /// The action a project chose for one of its instances.
    ///
    /// Falls back to the action carried over from a previous incarnation
    /// of the instance when the reply predates a re-instantiation.
    pub fn instance_action(&self, project_id: &str, instance_id: &str) -> Option<Action> {
        self.proj_instance_actions
            .get(project_id)
            .and_then(|actions| actions.get(instance_id))
            .copied()
            .or_else(|| {
                self.instances
                    .iter()
                    .find(|i| i.instance_id == instance_id)
                    .and_then(|i| i.action)
            })
    }

    pub fn project_has_state_instances(&self, project_id: &str) -> bool {
        self.instances
            .iter()
            .any(|i| i.project_id == project_id && i.project_state.is_some())
    }

    // ── instances ────────────────────────────────────────────────────

    pub fn instances(&self) -> &[Instance] {
        &self.instances
    }

    pub fn instances_by_host_and_project(&self, host: &str, project_id: &str) -> Vec<Instance> {
        self.instances
            .iter()
            .filter(|i| i.host == host && i.project_id == project_id)
            .cloned()
            .collect()
    }

    pub fn instance_ids_by_project(&self, project_id: &str) -> Vec<String> {
        self.instances
            .iter()
            .filter(|i| i.project_id == project_id)
            .map(|i| i.instance_id.clone())
            .collect()
    }

    /// Instance ids the project is currently being asked about; all of the
    /// project's instances when no instance carries the asked state.
    pub fn state_instance_ids(&self, project_id: &str) -> Vec<String> {
        let asked = self
            .project(project_id)
            .and_then(|p| p.state)
            .map(ProjectState::subject);
        let stamped: Vec<String> = self
            .instances
            .iter()
            .filter(|i| i.project_id == project_id && i.project_state.is_some())
            .filter(|i| asked.is_none() || i.project_state == asked)
            .map(|i| i.instance_id.clone())
            .collect();
        if stamped.is_empty() {
            self.instance_ids_by_project(project_id)
        } else {
            stamped
        }
    }

    /// Reconcile one server observed on the compute plane.
    ///
    /// A known instance id is a no-op. A known name under a new id is a
    /// re-instantiation: the old row is replaced, carrying over the
    /// negotiated `action`, `project_state` and `action_done`. Anything
    /// else is inserted fresh.
    pub fn update_instance(&mut self, incoming: Instance) -> Result<()> {
        if self
            .instances
            .iter()
            .any(|i| i.instance_id == incoming.instance_id)
        {
            return Ok(());
        }
        if let Some(pos) = self
            .instances
            .iter()
            .position(|i| i.instance_name == incoming.instance_name)
        {
            let old = self.instances.remove(pos);
            let mut fresh = incoming;
            fresh.action = old.action;
            fresh.project_state = old.project_state;
            fresh.action_done = old.action_done;
            self.store.remove_instance(&self.session_id, &old.instance_id)?;
            self.store.create_instance(&self.session_id, &fresh)?;
            self.instances.push(fresh);
            return Ok(());
        }
        self.store.create_instance(&self.session_id, &incoming)?;
        self.instances.push(incoming);
        Ok(())
    }

    /// Drop instances the compute plane no longer reports (scale-down).
    pub fn remove_non_existing_instances(&mut self, seen_ids: &[String]) -> Result<()> {
        let gone: Vec<String> = self
            .instances
            .iter()
            .filter(|i| !seen_ids.contains(&i.instance_id))
            .map(|i| i.instance_id.clone())
            .collect();
        for instance_id in gone {
            self.store.remove_instance(&self.session_id, &instance_id)?;
            self.instances.retain(|i| i.instance_id != instance_id);
        }
        Ok(())
    }

    /// Mirror the host reported by the compute plane after a migration.
    pub fn set_instance_host(&mut self, instance_id: &str, host: &str) -> Result<()> {
        let session_id = self.session_id.clone();
        let store = Arc::clone(&self.store);
        if let Some(instance) = self
            .instances
            .iter_mut()
            .find(|i| i.instance_id == instance_id)
        {
            instance.host = host.to_string();
            store.update_instance(&session_id, instance)?;
        }
        Ok(())
    }

    pub fn set_instance_action_done(&mut self, instance_id: &str) -> Result<()> {
        let session_id = self.session_id.clone();
        let store = Arc::clone(&self.store);
        if let Some(instance) = self
            .instances
            .iter_mut()
            .find(|i| i.instance_id == instance_id)
        {
            instance.action_done = true;
            store.update_instance(&session_id, instance)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_data() -> SessionData {
        let store = Arc::new(Store::open_in_memory().expect("in-memory store"));
        store
            .create_session(
                "s1",
                WorkflowState::Maintenance,
                Utc::now(),
                "{}",
                "default",
            )
            .expect("session row");
        SessionData::new(store, "s1", Utc::now(), serde_json::json!({}))
    }

    fn instance(id: &str, name: &str, project: &str, host: &str) -> Instance {
        Instance {
            instance_id: id.to_string(),
            instance_name: name.to_string(),
            project_id: project.to_string(),
            host: host.to_string(),
            state: "active".to_string(),
            project_state: None,
            action: None,
            action_done: false,
            details: None,
        }
    }

    #[test]
    fn empty_computes_ignores_controllers() {
        let mut data = test_data();
        data.add_hosts(&["c1".into(), "c2".into(), "ctl1".into()])
            .expect("hosts");
        data.stamp_host("c1", HostType::Compute, None, false).expect("stamp");
        data.stamp_host("c2", HostType::Compute, None, false).expect("stamp");
        data.stamp_host("ctl1", HostType::Controller, None, false)
            .expect("stamp");
        data.ensure_projects(&["p1".into()]).expect("projects");
        data.update_instance(instance("i1", "vm-1", "p1", "c1"))
            .expect("instance");

        assert_eq!(data.empty_computes(), vec!["c2".to_string()]);
        assert_eq!(data.controller_hosts(), vec!["ctl1".to_string()]);
    }

    #[test]
    fn host_state_questions_follow_instances() {
        let mut data = test_data();
        data.add_hosts(&["c1".into(), "c2".into()]).expect("hosts");
        data.stamp_host("c1", HostType::Compute, None, false).expect("stamp");
        data.stamp_host("c2", HostType::Compute, None, false).expect("stamp");
        data.ensure_projects(&["p1".into(), "p2".into()]).expect("projects");
        data.update_instance(instance("i1", "vm-1", "p1", "c1"))
            .expect("instance");
        data.update_instance(instance("i2", "vm-2", "p2", "c2"))
            .expect("instance");

        data.set_projects_state_and_hosts_instances(
            WorkflowState::PrepareMaintenance,
            &["c1".to_string()],
        )
        .expect("stamp round");

        // Only p1 has an instance on c1: p1 is asked, p2 is left out.
        let p1 = data.project("p1").expect("p1");
        assert_eq!(
            p1.state,
            Some(ProjectState::Asked(WorkflowState::PrepareMaintenance))
        );
        assert!(data.project("p2").expect("p2").state.is_none());
        assert!(data.project_has_state_instances("p1"));
        assert!(!data.project_has_state_instances("p2"));

        // Project state and instance stamps agree.
        assert_eq!(
            data.state_instance_ids("p1"),
            vec!["i1".to_string()],
        );
    }

    #[test]
    fn state_instance_ids_falls_back_to_all() {
        let mut data = test_data();
        data.add_hosts(&["c1".into()]).expect("hosts");
        data.stamp_host("c1", HostType::Compute, None, false).expect("stamp");
        data.ensure_projects(&["p1".into()]).expect("projects");
        data.update_instance(instance("i1", "vm-1", "p1", "c1"))
            .expect("instance");
        data.update_instance(instance("i2", "vm-2", "p1", "c1"))
            .expect("instance");

        data.set_projects_state(WorkflowState::Maintenance)
            .expect("broadcast round");
        let mut ids = data.state_instance_ids("p1");
        ids.sort();
        assert_eq!(ids, vec!["i1".to_string(), "i2".to_string()]);
    }

    #[test]
    fn update_instance_is_idempotent() {
        let mut data = test_data();
        data.add_hosts(&["c1".into()]).expect("hosts");
        data.stamp_host("c1", HostType::Compute, None, false).expect("stamp");
        data.ensure_projects(&["p1".into()]).expect("projects");

        data.update_instance(instance("i1", "vm-1", "p1", "c1"))
            .expect("first");
        data.update_instance(instance("i1", "vm-1", "p1", "c1"))
            .expect("second");

        assert_eq!(data.instances().len(), 1);
    }

    #[test]
    fn reinstantiation_preserves_negotiated_fields() {
        let mut data = test_data();
        data.add_hosts(&["c1".into()]).expect("hosts");
        data.stamp_host("c1", HostType::Compute, None, false).expect("stamp");
        data.ensure_projects(&["p1".into()]).expect("projects");
        data.update_instance(instance("i1", "vm-1", "p1", "c1"))
            .expect("instance");
        data.set_projects_state_and_hosts_instances(
            WorkflowState::PlannedMaintenance,
            &["c1".to_string()],
        )
        .expect("stamp round");
        data.set_instance_actions(
            "p1",
            HashMap::from([("i1".to_string(), Action::Migrate)]),
        )
        .expect("actions");

        // Same name, new id: the project re-created its VM.
        data.update_instance(instance("i9", "vm-1", "p1", "c1"))
            .expect("reinstantiation");

        assert_eq!(data.instances().len(), 1);
        let current = &data.instances()[0];
        assert_eq!(current.instance_id, "i9");
        assert_eq!(current.action, Some(Action::Migrate));
        assert_eq!(
            current.project_state,
            Some(WorkflowState::PlannedMaintenance)
        );
        // The reply named the old id; the fallback still finds the action.
        assert_eq!(data.instance_action("p1", "i9"), Some(Action::Migrate));
    }

    #[test]
    fn scale_down_removes_unseen_instances() {
        let mut data = test_data();
        data.add_hosts(&["c1".into()]).expect("hosts");
        data.stamp_host("c1", HostType::Compute, None, false).expect("stamp");
        data.ensure_projects(&["p1".into()]).expect("projects");
        data.update_instance(instance("i1", "vm-1", "p1", "c1"))
            .expect("instance");
        data.update_instance(instance("i2", "vm-2", "p1", "c1"))
            .expect("instance");

        data.remove_non_existing_instances(&["i2".to_string()])
            .expect("scale down");
        assert_eq!(data.instance_ids_by_project("p1"), vec!["i2".to_string()]);
    }

    #[test]
    fn maintained_is_monotonic() {
        let mut data = test_data();
        data.add_hosts(&["c1".into()]).expect("hosts");
        data.stamp_host("c1", HostType::Compute, None, false).expect("stamp");
        data.mark_host_maintained("c1").expect("maintain");
        // Re-stamping discovery data must not clear the flag.
        data.stamp_host("c1", HostType::Compute, Some("svc-1".into()), false)
            .expect("restamp");
        assert_eq!(
            data.maintained_hosts_by_type(HostType::Compute),
            vec!["c1".to_string()]
        );
    }

    #[test]
    fn project_state_round_trip() {
        for value in ["MAINTENANCE", "ACK_SCALE_IN", "NACK_PLANNED_MAINTENANCE"] {
            let parsed = ProjectState::parse(value).expect("parse");
            assert_eq!(parsed.to_string(), value);
        }
        assert!(ProjectState::parse("ACK_NONSENSE").is_err());
    }
}
