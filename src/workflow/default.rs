//! Default maintenance workflow.
//!
//! Drives a session from `MAINTENANCE` to `MAINTENANCE_DONE`: mirror the
//! cluster, get every project's consent, create an empty compute host
//! (scaling tenants in or migrating instances as they choose), fence and
//! maintain each host in turn, then let projects scale back up.

use super::{EngineContext, Workflow};
use crate::actions::{ActionType, ACTION_DONE, ACTION_FAILED};
use crate::compute::{
    disable_service_compat, enable_service_compat, Hypervisor, COMPUTE_BINARY, CONTROLLER_BINARY,
};
use crate::notify::PROJECT_EVENT;
use crate::session::{Action, Host, HostType, Instance, WorkflowState, FLOATING_IP};
use crate::{DrydockError, Result};
use async_trait::async_trait;
use chrono::Utc;

/// State sent to the admin while a host is being worked on.
const IN_MAINTENANCE: &str = "IN_MAINTENANCE";
/// State sent to the admin when a host is back in service.
const HOST_MAINTENANCE_COMPLETE: &str = "MAINTENANCE_COMPLETE";
/// Pseudo-state sent to a project when one of its instances was moved.
const INSTANCE_ACTION_DONE: &str = "INSTANCE_ACTION_DONE";

pub struct DefaultWorkflow {
    ctx: EngineContext,
}

impl DefaultWorkflow {
    pub fn new(ctx: EngineContext) -> Self {
        Self { ctx }
    }

    // ── cluster mirroring ────────────────────────────────────────────

    /// Stamp host roles from service discovery; when the admin supplied
    /// no host list, every service host is in scope.
    async fn init_update_hosts(&self) -> Result<()> {
        let computes = self.ctx.compute.list_services(COMPUTE_BINARY).await?;
        let controllers = self.ctx.compute.list_services(CONTROLLER_BINARY).await?;
        let mut data = self.ctx.data.lock().await;
        if data.hosts().is_empty() {
            for service in computes.iter().chain(controllers.iter()) {
                if !data.has_host(&service.host) {
                    data.add_discovered_host(Host::new(&service.host))?;
                }
            }
        }
        let hostnames: Vec<String> =
            data.hosts().iter().map(|h| h.hostname.clone()).collect();
        for hostname in hostnames {
            if let Some(service) = computes.iter().find(|s| s.host == hostname) {
                if service.is_disabled() {
                    tracing::info!(
                        session_id = %self.ctx.session_id,
                        host = %hostname,
                        "compute already disabled per service status"
                    );
                }
                data.stamp_host(
                    &hostname,
                    HostType::Compute,
                    Some(service.id.clone()),
                    service.is_disabled(),
                )?;
            } else if let Some(service) = controllers.iter().find(|s| s.host == hostname) {
                data.stamp_host(
                    &hostname,
                    HostType::Controller,
                    Some(service.id.clone()),
                    service.is_disabled(),
                )?;
            } else {
                data.stamp_host(&hostname, HostType::Other, None, false)?;
            }
        }
        Ok(())
    }

    /// Reconcile projects and instances against the server list.
    async fn refresh_server_info(&self) -> Result<()> {
        let servers = self.ctx.compute.list_servers().await?;
        let mut data = self.ctx.data.lock().await;
        let mut seen = Vec::with_capacity(servers.len());
        let mut project_ids: Vec<String> = Vec::new();
        for server in servers {
            if !data.has_host(&server.host) {
                tracing::warn!(
                    session_id = %self.ctx.session_id,
                    instance_id = %server.id,
                    host = %server.host,
                    "instance on out-of-scope host, skipping"
                );
                continue;
            }
            seen.push(server.id.clone());
            if !project_ids.contains(&server.tenant_id) {
                project_ids.push(server.tenant_id.clone());
            }
            let details = server.has_floating_ip().then(|| FLOATING_IP.to_string());
            data.update_instance(Instance {
                instance_id: server.id,
                instance_name: server.name,
                project_id: server.tenant_id,
                host: server.host,
                state: server.vm_state,
                project_state: None,
                action: None,
                action_done: false,
                details,
            })?;
        }
        data.ensure_projects(&project_ids)?;
        data.remove_non_existing_instances(&seen)?;
        tracing::info!(
            session_id = %self.ctx.session_id,
            instances = data.instances().len(),
            projects = data.project_names().len(),
            "server info refreshed"
        );
        Ok(())
    }

    // ── project negotiation rounds ───────────────────────────────────

    /// Ask every project to confirm the upcoming maintenance window.
    async fn confirm_maintenance(&self) -> Result<()> {
        let state = WorkflowState::Maintenance;
        let (projects, metadata, actions_at) = {
            let mut data = self.ctx.data.lock().await;
            data.set_projects_state(state)?;
            (
                data.project_names(),
                data.metadata.clone(),
                data.maintenance_at,
            )
        };
        let reply_at = self
            .ctx
            .deadline_after(self.ctx.config.project_maintenance_reply)?;
        if reply_at >= actions_at {
            tracing::error!(
                session_id = %self.ctx.session_id,
                state = %state,
                "No time for project to answer"
            );
            return Err(DrydockError::Config(format!(
                "No time for project to answer in state {}",
                state
            )));
        }
        for project in projects {
            let instance_ids = self.ctx.data.lock().await.state_instance_ids(&project);
            self.ctx
                .project_notify(
                    &project,
                    instance_ids,
                    Vec::new(),
                    Some(actions_at),
                    Some(reply_at),
                    state.as_str(),
                    metadata.clone(),
                )
                .await?;
        }
        self.ctx
            .timers
            .start(
                self.ctx.config.project_maintenance_reply,
                "MAINTENANCE_TIMEOUT",
            )
            .await;
        self.ctx
            .wait_projects_state(state, "MAINTENANCE_TIMEOUT")
            .await
    }

    /// Ask every project to shrink so an empty host becomes possible.
    async fn confirm_scale_in(&self) -> Result<()> {
        let state = WorkflowState::ScaleIn;
        let deadline = self
            .ctx
            .deadline_after(self.ctx.config.project_scale_in_reply)?;
        let (projects, metadata) = {
            let mut data = self.ctx.data.lock().await;
            data.set_projects_state(state)?;
            (data.project_names(), data.metadata.clone())
        };
        for project in projects {
            let instance_ids = self.ctx.data.lock().await.state_instance_ids(&project);
            self.ctx
                .project_notify(
                    &project,
                    instance_ids,
                    Vec::new(),
                    Some(deadline),
                    Some(deadline),
                    state.as_str(),
                    metadata.clone(),
                )
                .await?;
        }
        self.ctx
            .timers
            .start(self.ctx.config.project_scale_in_reply, "SCALE_IN_TIMEOUT")
            .await;
        self.ctx.wait_projects_state(state, "SCALE_IN_TIMEOUT").await
    }

    /// Ask the projects with instances on `host` to vacate it.
    async fn confirm_host_to_be_emptied(&self, host: &str, state: WorkflowState) -> Result<()> {
        let allowed_actions = vec![Action::Migrate, Action::LiveMigrate, Action::OwnAction];
        let deadline = self
            .ctx
            .deadline_after(self.ctx.config.project_maintenance_reply)?;
        let (projects, metadata) = {
            let mut data = self.ctx.data.lock().await;
            data.set_projects_state_and_hosts_instances(state, &[host.to_string()])?;
            (data.project_names(), data.metadata.clone())
        };
        for project in projects {
            let (affected, instance_ids) = {
                let data = self.ctx.data.lock().await;
                (
                    data.project_has_state_instances(&project),
                    data.state_instance_ids(&project),
                )
            };
            if !affected {
                continue;
            }
            tracing::info!(
                session_id = %self.ctx.session_id,
                project_id = %project,
                state = %state,
                "asking project to vacate host"
            );
            self.ctx
                .project_notify(
                    &project,
                    instance_ids,
                    allowed_actions.clone(),
                    Some(deadline),
                    Some(deadline),
                    state.as_str(),
                    metadata.clone(),
                )
                .await?;
        }
        let timer_name = format!("{}_TIMEOUT", state);
        self.ctx
            .timers
            .start(self.ctx.config.project_maintenance_reply, &timer_name)
            .await;
        self.ctx.wait_projects_state(state, &timer_name).await
    }

    /// Tell every project maintenance is over and scale-up is allowed.
    async fn confirm_maintenance_complete(&self) -> Result<()> {
        let state = WorkflowState::MaintenanceComplete;
        let deadline = self
            .ctx
            .deadline_after(self.ctx.config.project_scale_in_reply)?;
        let (projects, metadata) = {
            let mut data = self.ctx.data.lock().await;
            data.set_projects_state(state)?;
            (data.project_names(), data.metadata.clone())
        };
        for project in projects {
            let instance_ids = self.ctx.data.lock().await.state_instance_ids(&project);
            self.ctx
                .project_notify(
                    &project,
                    instance_ids,
                    Vec::new(),
                    Some(deadline),
                    Some(deadline),
                    state.as_str(),
                    metadata.clone(),
                )
                .await?;
        }
        let timer_name = format!("{}_TIMEOUT", state);
        self.ctx
            .timers
            .start(self.ctx.config.project_scale_in_reply, &timer_name)
            .await;
        self.ctx.wait_projects_state(state, &timer_name).await
    }

    async fn notify_action_done(&self, project_id: &str, instance_id: &str) -> Result<()> {
        self.ctx
            .project_notify(
                project_id,
                vec![instance_id.to_string()],
                Vec::new(),
                None,
                None,
                INSTANCE_ACTION_DONE,
                serde_json::json!({}),
            )
            .await
    }

    // ── capacity arithmetic ──────────────────────────────────────────

    /// True when the free vcpu capacity cannot absorb one whole host.
    async fn need_scale_in(&self) -> Result<bool> {
        let hypervisors = self.ctx.compute.list_hypervisors().await?;
        let computes = self.ctx.data.lock().await.compute_hosts();
        tracing::info!(session_id = %self.ctx.session_id, "checking hypervisors for vcpu capacity");
        let mut free_vcpus: i64 = 0;
        let mut prev: Option<(u32, String)> = None;
        for hypervisor in hypervisors
            .iter()
            .filter(|h| computes.contains(&h.hostname))
        {
            if let Some((prev_vcpus, prev_host)) = &prev {
                // The capacity math assumes a homogeneous compute fleet.
                if *prev_vcpus != hypervisor.vcpus {
                    return Err(DrydockError::Compute(format!(
                        "{} vcpus on {} does not match {} on {}",
                        hypervisor.vcpus, hypervisor.hostname, prev_vcpus, prev_host
                    )));
                }
            }
            free_vcpus += i64::from(hypervisor.vcpus) - i64::from(hypervisor.vcpus_used);
            prev = Some((hypervisor.vcpus, hypervisor.hostname.clone()));
        }
        let host_vcpus = prev.map(|(vcpus, _)| i64::from(vcpus)).unwrap_or(0);
        Ok(free_vcpus < host_vcpus)
    }

    fn free_vcpus_by_host(host: &str, hypervisors: &[Hypervisor]) -> Result<i64> {
        hypervisors
            .iter()
            .find(|h| h.hostname == host)
            .map(|h| i64::from(h.vcpus) - i64::from(h.vcpus_used))
            .ok_or_else(|| {
                DrydockError::Compute(format!("no hypervisor record for {}", host))
            })
    }

    /// Pick the victim host: prefer hosts without floating-ip instances,
    /// then most free vcpus, then fewest instances to move.
    async fn find_host_to_be_empty(&self) -> Result<String> {
        let hypervisors = self.ctx.compute.list_hypervisors().await?;
        let data = self.ctx.data.lock().await;
        let mut best: Option<(String, i64, usize)> = None;
        let mut last: Option<String> = None;
        for host in data.compute_hosts() {
            let free_vcpus = Self::free_vcpus_by_host(&host, &hypervisors)?;
            let mut ha_instances = 0usize;
            let mut movable_instances = 0usize;
            for project in data.project_names() {
                for instance in data.instances_by_host_and_project(&host, &project) {
                    if instance.is_floating_ip() {
                        ha_instances += 1;
                    } else {
                        movable_instances += 1;
                    }
                }
            }
            tracing::info!(
                session_id = %self.ctx.session_id,
                host = %host,
                ha_instances,
                movable_instances,
                free_vcpus,
                "victim host candidate"
            );
            last = Some(host.clone());
            if ha_instances > 0 {
                continue;
            }
            best = match best {
                Some((best_host, best_free, best_movable))
                    if free_vcpus < best_free
                        || (free_vcpus == best_free && movable_instances >= best_movable) =>
                {
                    Some((best_host, best_free, best_movable))
                }
                _ => Some((host, free_vcpus, movable_instances)),
            };
        }
        let chosen = best
            .map(|(host, _, _)| host)
            .or(last)
            .ok_or_else(|| DrydockError::Compute("no compute host to empty".to_string()))?;
        tracing::info!(session_id = %self.ctx.session_id, host = %chosen, "host selected to be emptied");
        Ok(chosen)
    }

    // ── instance movement ────────────────────────────────────────────

    /// Execute the action each project chose for its instances on `host`,
    /// then wait for the hypervisor to drain. `Ok(false)` means the host
    /// could not be emptied; unsupported or missing actions are fatal.
    async fn actions_to_have_empty_host(&self, host: &str) -> Result<bool> {
        let projects = self
            .ctx
            .data
            .lock()
            .await
            .projects_with_instance_actions();
        for project in projects {
            let instances = self
                .ctx
                .data
                .lock()
                .await
                .instances_by_host_and_project(host, &project);
            for instance in instances {
                let action = self
                    .ctx
                    .data
                    .lock()
                    .await
                    .instance_action(&project, &instance.instance_id);
                tracing::info!(
                    session_id = %self.ctx.session_id,
                    instance_id = %instance.instance_id,
                    action = ?action,
                    "instance action"
                );
                match action {
                    Some(Action::Migrate) => {
                        if !self.migrate_server(&instance.instance_id).await? {
                            return Ok(false);
                        }
                        self.ctx
                            .data
                            .lock()
                            .await
                            .set_instance_action_done(&instance.instance_id)?;
                        self.notify_action_done(&project, &instance.instance_id)
                            .await?;
                    }
                    Some(Action::OwnAction) => {}
                    Some(Action::LiveMigrate) => {
                        return Err(DrydockError::UnsupportedAction(format!(
                            "instance {} action LIVE_MIGRATE not supported",
                            instance.instance_id
                        )));
                    }
                    None => {
                        return Err(DrydockError::UnsupportedAction(format!(
                            "instance {} has no action chosen",
                            instance.instance_id
                        )));
                    }
                }
            }
        }
        self.wait_host_empty(host).await
    }

    /// Poll the hypervisor until `host` reports zero used vcpus.
    async fn wait_host_empty(&self, host: &str) -> Result<bool> {
        let mut last_used = 0;
        for _ in 0..self.ctx.config.drain_poll_attempts {
            let hypervisors = self.ctx.compute.list_hypervisors().await?;
            let used = hypervisors
                .iter()
                .find(|h| h.hostname == host)
                .map(|h| h.vcpus_used)
                .unwrap_or(0);
            if used == 0 {
                tracing::info!(session_id = %self.ctx.session_id, host, "host empty");
                return Ok(true);
            }
            if used != last_used {
                tracing::info!(
                    session_id = %self.ctx.session_id,
                    host,
                    vcpus_used = used,
                    "host still has vcpus reserved, waiting"
                );
            }
            last_used = used;
            tokio::time::sleep(self.ctx.config.drain_poll_interval).await;
        }
        tracing::info!(session_id = %self.ctx.session_id, host, "host still not empty");
        Ok(false)
    }

    /// Cold-migrate one server: issue the request, poll for `resized`,
    /// confirm, and mirror the new placement. `Ok(false)` is a failed
    /// migration; only scheduler rejections are retried, with back-off.
    async fn migrate_server(&self, server_id: &str) -> Result<bool> {
        let server = match self.ctx.compute.get_server(server_id).await {
            Ok(server) => server,
            Err(e) => {
                tracing::error!(
                    session_id = %self.ctx.session_id,
                    server_id,
                    error = %e,
                    "could not read server before migration"
                );
                return Ok(false);
            }
        };
        let mut last_vm_state = server.vm_state.clone();
        tracing::info!(
            session_id = %self.ctx.session_id,
            server_id,
            vm_state = %last_vm_state,
            "starting migration"
        );
        for attempt in 0..=self.ctx.config.migrate_retries {
            match self.ctx.compute.migrate_server(server_id).await {
                Ok(()) => {
                    for _ in 0..self.ctx.config.migrate_poll_attempts {
                        tokio::time::sleep(self.ctx.config.drain_poll_interval).await;
                        let server = match self.ctx.compute.get_server(server_id).await {
                            Ok(server) => server,
                            Err(e) => {
                                tracing::error!(
                                    session_id = %self.ctx.session_id,
                                    server_id,
                                    error = %e,
                                    "migration poll failed"
                                );
                                return Ok(false);
                            }
                        };
                        if server.vm_state == "resized" {
                            if let Err(e) = self.ctx.compute.confirm_resize(server_id).await {
                                tracing::error!(
                                    session_id = %self.ctx.session_id,
                                    server_id,
                                    error = %e,
                                    "confirm resize failed"
                                );
                                return Ok(false);
                            }
                            self.ctx
                                .data
                                .lock()
                                .await
                                .set_instance_host(server_id, &server.host)?;
                            tracing::info!(
                                session_id = %self.ctx.session_id,
                                server_id,
                                host = %server.host,
                                "migration confirmed"
                            );
                            return Ok(true);
                        }
                        if server.vm_state == "error" {
                            tracing::error!(
                                session_id = %self.ctx.session_id,
                                server_id,
                                "migration failed, server in error"
                            );
                            return Ok(false);
                        }
                        if server.vm_state != last_vm_state {
                            tracing::info!(
                                session_id = %self.ctx.session_id,
                                server_id,
                                vm_state = %server.vm_state,
                                "migration progressing"
                            );
                        }
                        last_vm_state = server.vm_state;
                    }
                    tracing::error!(
                        session_id = %self.ctx.session_id,
                        server_id,
                        vm_state = %last_vm_state,
                        "migration timeout"
                    );
                    return Ok(false);
                }
                Err(DrydockError::BadRequest(e)) => {
                    if attempt == self.ctx.config.migrate_retries {
                        tracing::error!(
                            session_id = %self.ctx.session_id,
                            server_id,
                            "migrate failed after retries"
                        );
                        return Ok(false);
                    }
                    // The scheduler may need time to sync its instance list.
                    let backoff = self.ctx.config.migrate_retry_backoff
                        + self.ctx.config.migrate_retry_backoff_step * attempt;
                    tracing::info!(
                        session_id = %self.ctx.session_id,
                        server_id,
                        error = %e,
                        backoff_secs = backoff.as_secs(),
                        "migrate rejected, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => {
                    tracing::error!(
                        session_id = %self.ctx.session_id,
                        server_id,
                        error = %e,
                        "migration failed"
                    );
                    return Ok(false);
                }
            }
        }
        Ok(false)
    }

    // ── host maintenance ─────────────────────────────────────────────

    /// Fence every in-scope compute so projects cannot schedule onto the
    /// set while it is being maintained.
    async fn disable_computes(&self) -> Result<()> {
        let computes: Vec<Host> = {
            let data = self.ctx.data.lock().await;
            data.hosts()
                .iter()
                .filter(|h| h.kind == HostType::Compute)
                .cloned()
                .collect()
        };
        let reason = format!("maintenance session {}", self.ctx.session_id);
        for host in computes {
            tracing::info!(
                session_id = %self.ctx.session_id,
                host = %host.hostname,
                "disabling compute service"
            );
            disable_service_compat(
                self.ctx.compute.as_ref(),
                host.details.as_deref(),
                &host.hostname,
                COMPUTE_BINARY,
                &reason,
            )
            .await?;
            self.ctx
                .data
                .lock()
                .await
                .set_host_disabled(&host.hostname, true)?;
        }
        Ok(())
    }

    /// Run the declared host action plugins on `host`, one at a time,
    /// recording an execution row for each.
    async fn host_maintenance(&self, host: &str) -> Result<()> {
        tracing::info!(session_id = %self.ctx.session_id, host, "maintaining host");
        let plugins = self.ctx.store.action_plugins_get(&self.ctx.session_id)?;
        let host_plugins: Vec<_> = plugins
            .into_iter()
            .filter(|p| p.kind == ActionType::Host)
            .collect();
        if host_plugins.is_empty() {
            tokio::time::sleep(self.ctx.config.host_maintenance_delay).await;
            return Ok(());
        }
        for plugin in host_plugins {
            let runner = self.ctx.plugins.get(&plugin.plugin).ok_or_else(|| {
                DrydockError::Internal(format!(
                    "action plugin '{}' not registered",
                    plugin.plugin
                ))
            })?;
            self.ctx
                .store
                .create_action_plugin_instance(&self.ctx.session_id, &plugin.plugin, host)?;
            let outcome = runner.run(&self.ctx.session_id, host).await;
            let state = if outcome.is_ok() {
                ACTION_DONE
            } else {
                ACTION_FAILED
            };
            self.ctx.store.set_action_plugin_instance_state(
                &self.ctx.session_id,
                &plugin.plugin,
                host,
                state,
            )?;
            outcome?;
        }
        Ok(())
    }

    /// Take one empty host through maintenance and back into service.
    async fn maintain_host(&self, host: &str) -> Result<()> {
        // The hypervisor view can lag the instance view after moves.
        self.wait_host_empty(host).await?;

        tracing::info!(session_id = %self.ctx.session_id, host, "IN_MAINTENANCE");
        self.ctx.admin_notify(host, IN_MAINTENANCE).await?;
        self.host_maintenance(host).await?;
        self.ctx.admin_notify(host, HOST_MAINTENANCE_COMPLETE).await?;
        tracing::info!(session_id = %self.ctx.session_id, host, "MAINTENANCE_COMPLETE");

        let details = {
            let data = self.ctx.data.lock().await;
            data.hosts()
                .iter()
                .find(|h| h.hostname == host)
                .and_then(|h| h.details.clone())
        };
        enable_service_compat(
            self.ctx.compute.as_ref(),
            details.as_deref(),
            host,
            COMPUTE_BINARY,
        )
        .await?;
        let mut data = self.ctx.data.lock().await;
        data.set_host_disabled(host, false)?;
        data.mark_host_maintained(host)?;
        Ok(())
    }

    // ── state handlers ───────────────────────────────────────────────

    async fn maintenance(&self) -> Result<WorkflowState> {
        self.init_update_hosts().await?;
        self.refresh_server_info().await?;

        if !self.ctx.projects_listen_alarm(PROJECT_EVENT).await? {
            return Err(DrydockError::Notify(
                "not all projects listen to maintenance alarms".to_string(),
            ));
        }
        self.confirm_maintenance().await?;

        let next = self.next_state_after_capacity_check().await?;
        self.wait_maintenance_start().await;
        Ok(next)
    }

    async fn scale_in(&self) -> Result<WorkflowState> {
        self.confirm_scale_in().await?;
        // Capacity reporting lags the deletions; the next check reads the
        // refreshed view.
        self.refresh_server_info().await?;
        self.next_state_after_capacity_check().await
    }

    async fn prepare_maintenance(&self) -> Result<WorkflowState> {
        let host = self.find_host_to_be_empty().await?;
        self.confirm_host_to_be_emptied(&host, WorkflowState::PrepareMaintenance)
            .await?;
        let emptied = self.actions_to_have_empty_host(&host).await?;
        let next = if emptied {
            WorkflowState::StartMaintenance
        } else {
            tracing::info!(
                session_id = %self.ctx.session_id,
                host = %host,
                "failed to empty host, need to scale in more"
            );
            WorkflowState::ScaleIn
        };
        self.refresh_server_info().await?;
        Ok(next)
    }

    async fn start_maintenance(&self) -> Result<WorkflowState> {
        let (empty_hosts, maintained) = {
            let data = self.ctx.data.lock().await;
            (
                data.empty_computes(),
                data.maintained_hosts_by_type(HostType::Compute),
            )
        };
        if empty_hosts.is_empty() {
            return Err(DrydockError::Compute(
                "no empty host to be maintained".to_string(),
            ));
        }
        if maintained.is_empty() {
            self.disable_computes().await?;
            for host in &empty_hosts {
                self.maintain_host(host).await?;
            }
        } else {
            for host in empty_hosts.iter().filter(|h| !maintained.contains(h)) {
                self.maintain_host(host).await?;
            }
        }
        let data = self.ctx.data.lock().await;
        let maintained = data.maintained_hosts_by_type(HostType::Compute);
        if data
            .compute_hosts()
            .iter()
            .any(|host| !maintained.contains(host))
        {
            Ok(WorkflowState::PlannedMaintenance)
        } else {
            Ok(WorkflowState::MaintenanceComplete)
        }
    }

    async fn planned_maintenance(&self) -> Result<WorkflowState> {
        let host = {
            let data = self.ctx.data.lock().await;
            let maintained = data.maintained_hosts_by_type(HostType::Compute);
            let pending: Vec<String> = data
                .compute_hosts()
                .into_iter()
                .filter(|h| !maintained.contains(h))
                .collect();
            tracing::info!(
                session_id = %self.ctx.session_id,
                hosts = ?pending,
                "hosts not yet maintained"
            );
            pending.into_iter().next().ok_or_else(|| {
                DrydockError::Internal("planned maintenance with no pending host".to_string())
            })?
        };
        self.confirm_host_to_be_emptied(&host, WorkflowState::PlannedMaintenance)
            .await?;
        if !self.actions_to_have_empty_host(&host).await? {
            return Err(DrydockError::Compute(format!(
                "failed to empty host {}",
                host
            )));
        }
        self.refresh_server_info().await?;
        Ok(WorkflowState::StartMaintenance)
    }

    async fn maintenance_complete(&self) -> Result<WorkflowState> {
        tracing::info!(
            session_id = %self.ctx.session_id,
            "projects may scale back up to full capacity"
        );
        self.confirm_maintenance_complete().await?;
        self.refresh_server_info().await?;
        Ok(WorkflowState::MaintenanceDone)
    }

    // ── helpers ──────────────────────────────────────────────────────

    async fn next_state_after_capacity_check(&self) -> Result<WorkflowState> {
        let empty_hosts = self.ctx.data.lock().await.empty_computes();
        if !empty_hosts.is_empty() {
            tracing::info!(session_id = %self.ctx.session_id, "empty host found");
            return Ok(WorkflowState::StartMaintenance);
        }
        if self.need_scale_in().await? {
            tracing::info!(
                session_id = %self.ctx.session_id,
                "need to scale in to get capacity for an empty host"
            );
            Ok(WorkflowState::ScaleIn)
        } else {
            tracing::info!(
                session_id = %self.ctx.session_id,
                "free capacity, but need an empty host"
            );
            Ok(WorkflowState::PrepareMaintenance)
        }
    }

    /// Cooperative sleep until the maintenance window opens.
    async fn wait_maintenance_start(&self) {
        let maintenance_at = self.ctx.data.lock().await.maintenance_at;
        let now = Utc::now();
        if maintenance_at <= now {
            tracing::info!(session_id = %self.ctx.session_id, "time to start maintenance");
            return;
        }
        tracing::info!(
            session_id = %self.ctx.session_id,
            maintenance_at = %maintenance_at,
            "waiting for the maintenance window"
        );
        let delay = (maintenance_at - now).to_std().unwrap_or_default();
        self.ctx.timers.start(delay, "MAINTENANCE_START_TIMEOUT").await;
        while !self.ctx.timers.is_expired("MAINTENANCE_START_TIMEOUT").await {
            tokio::time::sleep(self.ctx.config.reply_poll_interval).await;
        }
        tracing::info!(session_id = %self.ctx.session_id, "time to start maintenance");
    }
}

#[async_trait]
impl Workflow for DefaultWorkflow {
    fn context(&self) -> &EngineContext {
        &self.ctx
    }

    async fn handle(&mut self, state: WorkflowState) -> Result<WorkflowState> {
        match state {
            WorkflowState::Maintenance => self.maintenance().await,
            WorkflowState::ScaleIn => self.scale_in().await,
            WorkflowState::PrepareMaintenance => self.prepare_maintenance().await,
            WorkflowState::StartMaintenance => self.start_maintenance().await,
            WorkflowState::PlannedMaintenance => self.planned_maintenance().await,
            WorkflowState::MaintenanceComplete => self.maintenance_complete().await,
            terminal => Ok(terminal),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::PluginRegistry;
    use crate::compute::mock::MockCompute;
    use crate::compute::ComputeAdapter;
    use crate::config::AppConfig;
    use crate::notify::BusNotifier;
    use crate::session::SessionData;
    use crate::store::Store;
    use crate::timer::TimerRegistry;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::Mutex;

    fn fast_config() -> AppConfig {
        AppConfig {
            reply_poll_interval: Duration::from_millis(10),
            drain_poll_interval: Duration::from_millis(10),
            drain_poll_attempts: 5,
            migrate_poll_attempts: 5,
            migrate_retries: 2,
            migrate_retry_backoff: Duration::from_millis(20),
            migrate_retry_backoff_step: Duration::from_millis(10),
            host_maintenance_delay: Duration::from_millis(10),
            ..AppConfig::default()
        }
    }

    fn workflow_with(compute: Arc<MockCompute>) -> DefaultWorkflow {
        let store = Arc::new(Store::open_in_memory().expect("store"));
        store
            .create_session(
                "s1",
                WorkflowState::Maintenance,
                Utc::now(),
                "{}",
                "default",
            )
            .expect("session row");
        let data = SessionData::new(
            Arc::clone(&store),
            "s1",
            Utc::now(),
            serde_json::json!({}),
        );
        let ctx = EngineContext {
            session_id: "s1".to_string(),
            config: fast_config(),
            store,
            compute,
            notifier: Arc::new(BusNotifier::new("maintenance")),
            plugins: Arc::new(PluginRegistry::new()),
            timers: Arc::new(TimerRegistry::new("s1")),
            data: Arc::new(Mutex::new(data)),
            stopped: Arc::new(AtomicBool::new(false)),
        };
        DefaultWorkflow::new(ctx)
    }

    async fn seed_cluster(workflow: &DefaultWorkflow) {
        workflow.init_update_hosts().await.expect("discovery");
        workflow.refresh_server_info().await.expect("servers");
    }

    #[tokio::test]
    async fn victim_prefers_free_capacity_without_floating_ips() {
        let compute = Arc::new(MockCompute::new());
        compute.add_compute_host("c1");
        compute.add_compute_host("c2");
        compute.add_compute_host("c3");
        compute.add_server("i1", "vm-1", "p1", "c1", false);
        compute.add_server("i2", "vm-2", "p1", "c1", false);
        compute.add_server("i3", "vm-3", "p1", "c2", false);
        compute.add_server("i4", "vm-4", "p1", "c3", true);

        let workflow = workflow_with(Arc::clone(&compute));
        seed_cluster(&workflow).await;

        // c3 carries a floating ip, c2 has more free vcpus than c1.
        let host = workflow.find_host_to_be_empty().await.expect("victim");
        assert_eq!(host, "c2");
    }

    #[tokio::test]
    async fn victim_falls_back_to_last_host_when_all_have_floating_ips() {
        let compute = Arc::new(MockCompute::new());
        compute.add_compute_host("c1");
        compute.add_compute_host("c2");
        compute.add_server("i1", "vm-1", "p1", "c1", true);
        compute.add_server("i2", "vm-2", "p1", "c2", true);

        let workflow = workflow_with(Arc::clone(&compute));
        seed_cluster(&workflow).await;

        let host = workflow.find_host_to_be_empty().await.expect("victim");
        assert_eq!(host, "c2");
    }

    #[tokio::test]
    async fn scale_in_needed_only_when_capacity_is_short() {
        let compute = Arc::new(MockCompute::new());
        compute.add_compute_host("c1");
        compute.add_compute_host("c2");
        // One instance: free capacity is 15 of 16 vcpus, one host is 8.
        compute.add_server("i1", "vm-1", "p1", "c1", false);

        let workflow = workflow_with(Arc::clone(&compute));
        seed_cluster(&workflow).await;
        assert!(!workflow.need_scale_in().await.expect("capacity check"));

        // Fill c1 and most of c2: free capacity drops below one host.
        for n in 0..7 {
            compute.add_server(&format!("i1{}", n), &format!("vm-1{}", n), "p1", "c1", false);
        }
        for n in 0..6 {
            compute.add_server(&format!("i2{}", n), &format!("vm-2{}", n), "p1", "c2", false);
        }
        workflow.refresh_server_info().await.expect("refresh");
        assert!(workflow.need_scale_in().await.expect("capacity check"));
    }

    #[tokio::test]
    async fn migrate_server_confirms_and_mirrors_new_host() {
        let compute = Arc::new(MockCompute::new());
        compute.add_compute_host("c1");
        compute.add_compute_host("c2");
        compute.add_server("i1", "vm-1", "p1", "c1", false);
        compute.set_migration_target("i1", "c2");

        let workflow = workflow_with(Arc::clone(&compute));
        seed_cluster(&workflow).await;

        assert!(workflow.migrate_server("i1").await.expect("migrate"));
        let data = workflow.ctx.data.lock().await;
        let moved = data
            .instances()
            .iter()
            .find(|i| i.instance_id == "i1")
            .expect("instance");
        assert_eq!(moved.host, "c2");
        assert_eq!(
            compute.get_server("i1").await.expect("server").vm_state,
            "active"
        );
    }

    #[tokio::test]
    async fn migrate_server_retries_scheduler_rejections() {
        let compute = Arc::new(MockCompute::new());
        compute.add_compute_host("c1");
        compute.add_compute_host("c2");
        compute.add_server("i1", "vm-1", "p1", "c1", false);
        compute.reject_migration("i1", 2);

        let workflow = workflow_with(Arc::clone(&compute));
        seed_cluster(&workflow).await;

        assert!(workflow.migrate_server("i1").await.expect("migrate"));
        assert_eq!(compute.migrate_calls().len(), 3);
    }

    #[tokio::test]
    async fn migrate_server_gives_up_after_bounded_retries() {
        let compute = Arc::new(MockCompute::new());
        compute.add_compute_host("c1");
        compute.add_compute_host("c2");
        compute.add_server("i1", "vm-1", "p1", "c1", false);
        compute.reject_migration("i1", 10);

        let workflow = workflow_with(Arc::clone(&compute));
        seed_cluster(&workflow).await;

        assert!(!workflow.migrate_server("i1").await.expect("migrate"));
        assert_eq!(compute.migrate_calls().len(), 3);
    }

    #[tokio::test]
    async fn migrate_server_fails_on_error_state() {
        let compute = Arc::new(MockCompute::new());
        compute.add_compute_host("c1");
        compute.add_compute_host("c2");
        compute.add_server("i1", "vm-1", "p1", "c1", false);
        compute.fail_migration("i1");

        let workflow = workflow_with(Arc::clone(&compute));
        seed_cluster(&workflow).await;

        assert!(!workflow.migrate_server("i1").await.expect("migrate"));
    }

    #[tokio::test]
    async fn discovery_classifies_hosts() {
        let compute = Arc::new(MockCompute::new());
        compute.add_compute_host("c1");
        compute.add_controller_host("ctl1");

        let workflow = workflow_with(Arc::clone(&compute));
        // No admin-supplied hosts: discovery brings both in scope.
        workflow.init_update_hosts().await.expect("discovery");

        let data = workflow.ctx.data.lock().await;
        assert_eq!(data.compute_hosts(), vec!["c1".to_string()]);
        assert_eq!(data.controller_hosts(), vec!["ctl1".to_string()]);
        let c1 = data
            .hosts()
            .iter()
            .find(|h| h.hostname == "c1")
            .expect("c1");
        assert_eq!(c1.details.as_deref(), Some("svc-1"));
    }

    #[tokio::test]
    async fn unsupported_action_is_fatal() {
        let compute = Arc::new(MockCompute::new());
        compute.add_compute_host("c1");
        compute.add_compute_host("c2");
        compute.add_server("i1", "vm-1", "p1", "c1", false);

        let workflow = workflow_with(Arc::clone(&compute));
        seed_cluster(&workflow).await;
        {
            let mut data = workflow.ctx.data.lock().await;
            data.set_projects_state_and_hosts_instances(
                WorkflowState::PrepareMaintenance,
                &["c1".to_string()],
            )
            .expect("round");
            data.set_instance_actions(
                "p1",
                std::collections::HashMap::from([(
                    "i1".to_string(),
                    Action::LiveMigrate,
                )]),
            )
            .expect("actions");
        }

        let err = workflow
            .actions_to_have_empty_host("c1")
            .await
            .expect_err("live migrate is reserved");
        assert!(matches!(err, DrydockError::UnsupportedAction(_)));
        assert!(err.to_string().contains("not supported"));
    }
}
