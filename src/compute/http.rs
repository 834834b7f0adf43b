//! REST implementation of the compute adapter.
//!
//! Talks to a compute control plane over its JSON API. HTTP 400 maps to
//! [`DrydockError::BadRequest`] so the migration retry policy can tell a
//! transient scheduler rejection from a real failure.

use super::{ComputeAdapter, ComputeService, Hypervisor, Server, ServerAddress, ServiceRef};
use crate::{DrydockError, Result};
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;

/// HTTP client for the compute control plane.
pub struct HttpCompute {
    client: Client,
    base_url: String,
    username: String,
    password: String,
}

impl HttpCompute {
    pub fn new(
        base_url: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            username: username.into(),
            password: password.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self
            .client
            .get(self.url(path))
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await
            .map_err(|e| DrydockError::Compute(e.to_string()))?;
        check(response)
            .await?
            .json()
            .await
            .map_err(|e| DrydockError::Compute(e.to_string()))
    }

    async fn put_json(&self, path: &str, body: &Value) -> Result<()> {
        let response = self
            .client
            .put(self.url(path))
            .basic_auth(&self.username, Some(&self.password))
            .json(body)
            .send()
            .await
            .map_err(|e| DrydockError::Compute(e.to_string()))?;
        check(response).await.map(|_| ())
    }

    async fn post_json(&self, path: &str, body: &Value) -> Result<()> {
        let response = self
            .client
            .post(self.url(path))
            .basic_auth(&self.username, Some(&self.password))
            .json(body)
            .send()
            .await
            .map_err(|e| DrydockError::Compute(e.to_string()))?;
        check(response).await.map(|_| ())
    }
}

async fn check(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    match status {
        StatusCode::BAD_REQUEST => Err(DrydockError::BadRequest(body)),
        StatusCode::NOT_FOUND => Err(DrydockError::NotFound {
            model: "compute",
            id: body,
        }),
        _ => Err(DrydockError::Compute(format!("{}: {}", status, body))),
    }
}

#[async_trait]
impl ComputeAdapter for HttpCompute {
    async fn list_services(&self, binary: &str) -> Result<Vec<ComputeService>> {
        let reply: ServicesReply = self
            .get_json(&format!("/os-services?binary={}", binary))
            .await?;
        Ok(reply.services.into_iter().map(Into::into).collect())
    }

    async fn list_servers(&self) -> Result<Vec<Server>> {
        let reply: ServersReply = self.get_json("/servers/detail?all_tenants=1").await?;
        Ok(reply.servers.into_iter().map(Into::into).collect())
    }

    async fn list_hypervisors(&self) -> Result<Vec<Hypervisor>> {
        let reply: HypervisorsReply = self.get_json("/os-hypervisors/detail").await?;
        Ok(reply.hypervisors.into_iter().map(Into::into).collect())
    }

    async fn disable_service(&self, service: &ServiceRef, reason: &str) -> Result<()> {
        match service {
            ServiceRef::Id(id) => {
                self.put_json(
                    &format!("/os-services/{}", id),
                    &json!({ "status": "disabled", "disabled_reason": reason }),
                )
                .await
            }
            ServiceRef::HostBinary { host, binary } => {
                self.put_json(
                    "/os-services/disable-log-reason",
                    &json!({ "host": host, "binary": binary, "disabled_reason": reason }),
                )
                .await
            }
        }
    }

    async fn enable_service(&self, service: &ServiceRef) -> Result<()> {
        match service {
            ServiceRef::Id(id) => {
                self.put_json(
                    &format!("/os-services/{}", id),
                    &json!({ "status": "enabled" }),
                )
                .await
            }
            ServiceRef::HostBinary { host, binary } => {
                self.put_json(
                    "/os-services/enable",
                    &json!({ "host": host, "binary": binary }),
                )
                .await
            }
        }
    }

    async fn migrate_server(&self, server_id: &str) -> Result<()> {
        self.post_json(
            &format!("/servers/{}/action", server_id),
            &json!({ "migrate": null }),
        )
        .await
    }

    async fn confirm_resize(&self, server_id: &str) -> Result<()> {
        self.post_json(
            &format!("/servers/{}/action", server_id),
            &json!({ "confirmResize": null }),
        )
        .await
    }

    async fn get_server(&self, server_id: &str) -> Result<Server> {
        let reply: ServerReply = self.get_json(&format!("/servers/{}", server_id)).await?;
        Ok(reply.server.into())
    }
}

// Wire shapes. Service and hypervisor ids were integers in the old API
// generation; accept both.

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum IdValue {
    Text(String),
    Number(i64),
}

impl From<IdValue> for String {
    fn from(value: IdValue) -> Self {
        match value {
            IdValue::Text(s) => s,
            IdValue::Number(n) => n.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ServicesReply {
    services: Vec<ServiceDto>,
}

#[derive(Debug, Deserialize)]
struct ServiceDto {
    id: IdValue,
    host: String,
    binary: String,
    status: String,
}

impl From<ServiceDto> for ComputeService {
    fn from(dto: ServiceDto) -> Self {
        Self {
            id: dto.id.into(),
            host: dto.host,
            binary: dto.binary,
            status: dto.status,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ServersReply {
    servers: Vec<ServerDto>,
}

#[derive(Debug, Deserialize)]
struct ServerReply {
    server: ServerDto,
}

#[derive(Debug, Deserialize)]
struct ServerDto {
    id: String,
    name: String,
    tenant_id: String,
    #[serde(rename = "OS-EXT-SRV-ATTR:host")]
    host: String,
    #[serde(rename = "OS-EXT-STS:vm_state")]
    vm_state: String,
    #[serde(default)]
    addresses: HashMap<String, Vec<AddressDto>>,
}

#[derive(Debug, Deserialize)]
struct AddressDto {
    addr: String,
    #[serde(rename = "OS-EXT-IPS:type")]
    kind: Option<String>,
}

impl From<ServerDto> for Server {
    fn from(dto: ServerDto) -> Self {
        Self {
            id: dto.id,
            name: dto.name,
            tenant_id: dto.tenant_id,
            host: dto.host,
            vm_state: dto.vm_state,
            addresses: dto
                .addresses
                .into_iter()
                .map(|(network, addresses)| {
                    (
                        network,
                        addresses
                            .into_iter()
                            .map(|a| ServerAddress {
                                addr: a.addr,
                                kind: a.kind,
                            })
                            .collect(),
                    )
                })
                .collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct HypervisorsReply {
    hypervisors: Vec<HypervisorDto>,
}

#[derive(Debug, Deserialize)]
struct HypervisorDto {
    id: IdValue,
    #[serde(rename = "hypervisor_hostname")]
    hostname: String,
    vcpus: u32,
    vcpus_used: u32,
}

impl From<HypervisorDto> for Hypervisor {
    fn from(dto: HypervisorDto) -> Self {
        Self {
            id: dto.id.into(),
            hostname: dto.hostname,
            vcpus: dto.vcpus,
            vcpus_used: dto.vcpus_used,
        }
    }
}
