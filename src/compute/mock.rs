//! Scriptable in-memory compute plane for tests.
//!
//! Models just enough cluster behavior to drive the workflow end to end:
//! servers occupy one vcpu each, a migration moves the server to its
//! scripted target and leaves it `resized` until confirmed.

use super::{
    ComputeAdapter, ComputeService, Hypervisor, Server, ServerAddress, ServiceRef, COMPUTE_BINARY,
    CONTROLLER_BINARY,
};
use crate::{DrydockError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

const HOST_VCPUS: u32 = 8;

#[derive(Default)]
struct MockState {
    services: Vec<ComputeService>,
    servers: Vec<Server>,
    migration_targets: HashMap<String, String>,
    failing_migrations: Vec<String>,
    rejections_left: HashMap<String, u32>,
    migrate_calls: Vec<String>,
    id_keyed_service_api_broken: bool,
}

/// In-memory [`ComputeAdapter`].
#[derive(Default)]
pub struct MockCompute {
    state: Mutex<MockState>,
}

impl MockCompute {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().expect("mock compute mutex")
    }

    pub fn add_compute_host(&self, hostname: &str) {
        let mut state = self.lock();
        let id = format!("svc-{}", state.services.len() + 1);
        state.services.push(ComputeService {
            id,
            host: hostname.to_string(),
            binary: COMPUTE_BINARY.to_string(),
            status: "enabled".to_string(),
        });
    }

    pub fn add_controller_host(&self, hostname: &str) {
        let mut state = self.lock();
        let id = format!("svc-{}", state.services.len() + 1);
        state.services.push(ComputeService {
            id,
            host: hostname.to_string(),
            binary: CONTROLLER_BINARY.to_string(),
            status: "enabled".to_string(),
        });
    }

    pub fn add_server(&self, id: &str, name: &str, tenant: &str, host: &str, floating: bool) {
        let kind = if floating { "floating" } else { "fixed" };
        self.lock().servers.push(Server {
            id: id.to_string(),
            name: name.to_string(),
            tenant_id: tenant.to_string(),
            host: host.to_string(),
            vm_state: "active".to_string(),
            addresses: HashMap::from([(
                "net0".to_string(),
                vec![ServerAddress {
                    addr: "10.0.0.4".to_string(),
                    kind: Some(kind.to_string()),
                }],
            )]),
        });
    }

    /// Where a migration of `server_id` lands.
    pub fn set_migration_target(&self, server_id: &str, host: &str) {
        self.lock()
            .migration_targets
            .insert(server_id.to_string(), host.to_string());
    }

    /// Make migrating `server_id` drive the server into `error`.
    pub fn fail_migration(&self, server_id: &str) {
        self.lock().failing_migrations.push(server_id.to_string());
    }

    /// Reject the next `times` migration requests with HTTP-400 semantics.
    pub fn reject_migration(&self, server_id: &str, times: u32) {
        self.lock()
            .rejections_left
            .insert(server_id.to_string(), times);
    }

    /// Make the id-keyed service enable/disable generation unavailable.
    pub fn break_id_keyed_service_api(&self) {
        self.lock().id_keyed_service_api_broken = true;
    }

    pub fn migrate_calls(&self) -> Vec<String> {
        self.lock().migrate_calls.clone()
    }

    pub fn disabled_hosts(&self) -> Vec<String> {
        self.lock()
            .services
            .iter()
            .filter(|s| s.is_disabled())
            .map(|s| s.host.clone())
            .collect()
    }

    fn set_service_status(state: &mut MockState, service: &ServiceRef, status: &str) -> Result<()> {
        if state.id_keyed_service_api_broken {
            if let ServiceRef::Id(id) = service {
                return Err(DrydockError::BadRequest(format!(
                    "service id '{}' not understood",
                    id
                )));
            }
        }
        let found = state.services.iter_mut().find(|s| match service {
            ServiceRef::Id(id) => &s.id == id,
            ServiceRef::HostBinary { host, binary } => &s.host == host && &s.binary == binary,
        });
        match found {
            Some(service) => {
                service.status = status.to_string();
                Ok(())
            }
            None => Err(DrydockError::NotFound {
                model: "services",
                id: format!("{:?}", service),
            }),
        }
    }
}

#[async_trait]
impl ComputeAdapter for MockCompute {
    async fn list_services(&self, binary: &str) -> Result<Vec<ComputeService>> {
        Ok(self
            .lock()
            .services
            .iter()
            .filter(|s| s.binary == binary)
            .cloned()
            .collect())
    }

    async fn list_servers(&self) -> Result<Vec<Server>> {
        Ok(self.lock().servers.clone())
    }

    async fn list_hypervisors(&self) -> Result<Vec<Hypervisor>> {
        let state = self.lock();
        Ok(state
            .services
            .iter()
            .filter(|s| s.binary == COMPUTE_BINARY)
            .map(|s| Hypervisor {
                id: s.id.clone(),
                hostname: s.host.clone(),
                vcpus: HOST_VCPUS,
                vcpus_used: state.servers.iter().filter(|v| v.host == s.host).count() as u32,
            })
            .collect())
    }

    async fn disable_service(&self, service: &ServiceRef, _reason: &str) -> Result<()> {
        Self::set_service_status(&mut self.lock(), service, "disabled")
    }

    async fn enable_service(&self, service: &ServiceRef) -> Result<()> {
        Self::set_service_status(&mut self.lock(), service, "enabled")
    }

    async fn migrate_server(&self, server_id: &str) -> Result<()> {
        let mut state = self.lock();
        state.migrate_calls.push(server_id.to_string());
        if let Some(left) = state.rejections_left.get_mut(server_id) {
            if *left > 0 {
                *left -= 1;
                return Err(DrydockError::BadRequest(
                    "instance list out of sync".to_string(),
                ));
            }
        }
        let failing = state.failing_migrations.contains(&server_id.to_string());
        let target = state.migration_targets.get(server_id).cloned().or_else(|| {
            let current = state
                .servers
                .iter()
                .find(|s| s.id == server_id)
                .map(|s| s.host.clone())?;
            state
                .services
                .iter()
                .find(|s| s.binary == COMPUTE_BINARY && s.host != current)
                .map(|s| s.host.clone())
        });
        let server = state
            .servers
            .iter_mut()
            .find(|s| s.id == server_id)
            .ok_or_else(|| DrydockError::NotFound {
                model: "servers",
                id: server_id.to_string(),
            })?;
        if failing {
            server.vm_state = "error".to_string();
            return Ok(());
        }
        server.vm_state = "resized".to_string();
        if let Some(target) = target {
            server.host = target;
        }
        Ok(())
    }

    async fn confirm_resize(&self, server_id: &str) -> Result<()> {
        let mut state = self.lock();
        let server = state
            .servers
            .iter_mut()
            .find(|s| s.id == server_id)
            .ok_or_else(|| DrydockError::NotFound {
                model: "servers",
                id: server_id.to_string(),
            })?;
        server.vm_state = "active".to_string();
        Ok(())
    }

    async fn get_server(&self, server_id: &str) -> Result<Server> {
        self.lock()
            .servers
            .iter()
            .find(|s| s.id == server_id)
            .cloned()
            .ok_or_else(|| DrydockError::NotFound {
                model: "servers",
                id: server_id.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn migration_moves_server_to_target() {
        let compute = MockCompute::new();
        compute.add_compute_host("c1");
        compute.add_compute_host("c2");
        compute.add_server("i1", "vm-1", "p1", "c1", false);
        compute.set_migration_target("i1", "c2");

        compute.migrate_server("i1").await.expect("migrate");
        let server = compute.get_server("i1").await.expect("server");
        assert_eq!(server.vm_state, "resized");
        assert_eq!(server.host, "c2");

        compute.confirm_resize("i1").await.expect("confirm");
        assert_eq!(compute.get_server("i1").await.expect("server").vm_state, "active");

        let hypervisors = compute.list_hypervisors().await.expect("hypervisors");
        let used: HashMap<_, _> = hypervisors
            .iter()
            .map(|h| (h.hostname.as_str(), h.vcpus_used))
            .collect();
        assert_eq!(used["c1"], 0);
        assert_eq!(used["c2"], 1);
    }

    #[tokio::test]
    async fn rejections_run_out() {
        let compute = MockCompute::new();
        compute.add_compute_host("c1");
        compute.add_compute_host("c2");
        compute.add_server("i1", "vm-1", "p1", "c1", false);
        compute.reject_migration("i1", 1);

        assert!(matches!(
            compute.migrate_server("i1").await,
            Err(DrydockError::BadRequest(_))
        ));
        compute.migrate_server("i1").await.expect("second attempt");
        assert_eq!(compute.migrate_calls().len(), 2);
    }
}
