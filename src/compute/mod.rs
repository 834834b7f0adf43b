//! Compute control plane abstraction.
//!
//! The workflow engine never talks to the virtualization API directly; it
//! goes through [`ComputeAdapter`]. The adapter surface covers exactly
//! what maintenance needs: service discovery, the tenant server list,
//! hypervisor capacity, service enable/disable and cold migration.

pub mod http;
#[cfg(test)]
pub mod mock;

pub use http::HttpCompute;

use crate::{DrydockError, Result};
use async_trait::async_trait;
use std::collections::HashMap;

/// Service binary run by compute nodes.
pub const COMPUTE_BINARY: &str = "compute";
/// Service binary run by controller nodes.
pub const CONTROLLER_BINARY: &str = "controller";

/// One service record from the control plane.
#[derive(Debug, Clone)]
pub struct ComputeService {
    pub id: String,
    pub host: String,
    pub binary: String,
    pub status: String,
}

impl ComputeService {
    pub fn is_disabled(&self) -> bool {
        self.status == "disabled"
    }
}

/// One address attached to a server.
#[derive(Debug, Clone)]
pub struct ServerAddress {
    pub addr: String,
    /// "fixed" or "floating" where the plane reports it.
    pub kind: Option<String>,
}

/// A tenant server as the control plane reports it.
#[derive(Debug, Clone)]
pub struct Server {
    pub id: String,
    pub name: String,
    pub tenant_id: String,
    pub host: String,
    pub vm_state: String,
    pub addresses: HashMap<String, Vec<ServerAddress>>,
}

impl Server {
    /// An externally reachable address marks the server HA-sensitive.
    pub fn has_floating_ip(&self) -> bool {
        self.addresses
            .values()
            .flatten()
            .any(|address| address.kind.as_deref() == Some("floating"))
    }
}

/// Hypervisor capacity record.
#[derive(Debug, Clone)]
pub struct Hypervisor {
    pub id: String,
    pub hostname: String,
    pub vcpus: u32,
    pub vcpus_used: u32,
}

/// How to address a service across the two API generations: the new form
/// is keyed by service id, the old one by `(hostname, binary)`.
#[derive(Debug, Clone)]
pub enum ServiceRef {
    Id(String),
    HostBinary { host: String, binary: String },
}

#[async_trait]
pub trait ComputeAdapter: Send + Sync {
    /// Services running `binary`, across all hosts.
    async fn list_services(&self, binary: &str) -> Result<Vec<ComputeService>>;

    /// Detailed server list across all tenants.
    async fn list_servers(&self) -> Result<Vec<Server>>;

    /// Detailed hypervisor list.
    async fn list_hypervisors(&self) -> Result<Vec<Hypervisor>>;

    async fn disable_service(&self, service: &ServiceRef, reason: &str) -> Result<()>;

    async fn enable_service(&self, service: &ServiceRef) -> Result<()>;

    /// Start a cold migration of `server_id`.
    async fn migrate_server(&self, server_id: &str) -> Result<()>;

    /// Confirm a migration once the server reports `resized`.
    async fn confirm_resize(&self, server_id: &str) -> Result<()>;

    async fn get_server(&self, server_id: &str) -> Result<Server>;
}

/// Disable a service, preferring the id-keyed call and falling back to the
/// host+binary form when the plane does not understand it.
pub async fn disable_service_compat(
    adapter: &dyn ComputeAdapter,
    service_id: Option<&str>,
    host: &str,
    binary: &str,
    reason: &str,
) -> Result<()> {
    if let Some(id) = service_id {
        match adapter
            .disable_service(&ServiceRef::Id(id.to_string()), reason)
            .await
        {
            Ok(()) => return Ok(()),
            Err(DrydockError::BadRequest(e)) | Err(DrydockError::NotFound { id: e, .. }) => {
                tracing::warn!(host, error = %e, "id-keyed service disable rejected, using host form");
            }
            Err(other) => return Err(other),
        }
    }
    adapter
        .disable_service(
            &ServiceRef::HostBinary {
                host: host.to_string(),
                binary: binary.to_string(),
            },
            reason,
        )
        .await
}

/// Enable counterpart of [`disable_service_compat`].
pub async fn enable_service_compat(
    adapter: &dyn ComputeAdapter,
    service_id: Option<&str>,
    host: &str,
    binary: &str,
) -> Result<()> {
    if let Some(id) = service_id {
        match adapter
            .enable_service(&ServiceRef::Id(id.to_string()))
            .await
        {
            Ok(()) => return Ok(()),
            Err(DrydockError::BadRequest(e)) | Err(DrydockError::NotFound { id: e, .. }) => {
                tracing::warn!(host, error = %e, "id-keyed service enable rejected, using host form");
            }
            Err(other) => return Err(other),
        }
    }
    adapter
        .enable_service(&ServiceRef::HostBinary {
            host: host.to_string(),
            binary: binary.to_string(),
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server_with(kind: Option<&str>) -> Server {
        Server {
            id: "i1".to_string(),
            name: "vm-1".to_string(),
            tenant_id: "p1".to_string(),
            host: "c1".to_string(),
            vm_state: "active".to_string(),
            addresses: HashMap::from([(
                "net0".to_string(),
                vec![ServerAddress {
                    addr: "10.0.0.4".to_string(),
                    kind: kind.map(str::to_string),
                }],
            )]),
        }
    }

    #[test]
    fn floating_ip_detection() {
        assert!(server_with(Some("floating")).has_floating_ip());
        assert!(!server_with(Some("fixed")).has_floating_ip());
        assert!(!server_with(None).has_floating_ip());
    }

    #[tokio::test]
    async fn compat_falls_back_to_host_form() {
        let adapter = mock::MockCompute::new();
        adapter.add_compute_host("c1");
        adapter.break_id_keyed_service_api();

        disable_service_compat(&adapter, Some("svc-1"), "c1", COMPUTE_BINARY, "maintenance")
            .await
            .expect("fallback");
        assert_eq!(adapter.disabled_hosts(), vec!["c1".to_string()]);

        enable_service_compat(&adapter, Some("svc-1"), "c1", COMPUTE_BINARY)
            .await
            .expect("fallback");
        assert!(adapter.disabled_hosts().is_empty());
    }
}
