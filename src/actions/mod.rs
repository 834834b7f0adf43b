//! Host-level maintenance action plugins.
//!
//! A session declares the plugins to run on each host it maintains. The
//! workflow records one execution row per `(plugin, host)` pair and runs
//! `host`-typed plugins in series while the host is empty.

use crate::{DrydockError, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;

/// Where in the host-maintenance flow a plugin runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionType {
    Pre,
    Post,
    Host,
}

impl ActionType {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionType::Pre => "pre",
            ActionType::Post => "post",
            ActionType::Host => "host",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "pre" => Ok(ActionType::Pre),
            "post" => Ok(ActionType::Post),
            "host" => Ok(ActionType::Host),
            unknown => Err(DrydockError::Internal(format!(
                "unknown action plugin type '{}'",
                unknown
            ))),
        }
    }
}

/// Plugin declaration in the session-creation payload.
#[derive(Debug, Clone, Deserialize)]
pub struct ActionPluginSpec {
    pub plugin: String,
    #[serde(rename = "type")]
    pub kind: ActionType,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// A declared maintenance step, as persisted per session.
#[derive(Debug, Clone)]
pub struct ActionPlugin {
    pub plugin: String,
    pub kind: ActionType,
    pub state: Option<String>,
    pub meta: String,
}

impl From<ActionPluginSpec> for ActionPlugin {
    fn from(spec: ActionPluginSpec) -> Self {
        Self {
            plugin: spec.plugin,
            kind: spec.kind,
            state: None,
            meta: spec.metadata.to_string(),
        }
    }
}

/// One execution record per `(plugin, hostname)`.
#[derive(Debug, Clone)]
pub struct ActionPluginInstance {
    pub plugin: String,
    pub hostname: String,
    pub state: Option<String>,
}

/// Outcome states recorded on an [`ActionPluginInstance`].
pub const ACTION_DONE: &str = "DONE";
pub const ACTION_FAILED: &str = "FAILED";

/// A runnable host maintenance step.
#[async_trait]
pub trait HostActionPlugin: Send + Sync {
    fn name(&self) -> &str;

    /// Run the step on `hostname`. The host is empty and its compute
    /// service disabled while this executes.
    async fn run(&self, session_id: &str, hostname: &str) -> Result<()>;
}

/// Plugins available to sessions, keyed by name.
pub struct PluginRegistry {
    plugins: HashMap<String, Arc<dyn HostActionPlugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        let mut registry = Self {
            plugins: HashMap::new(),
        };
        registry.register(Arc::new(DummyActionPlugin));
        registry
    }

    pub fn register(&mut self, plugin: Arc<dyn HostActionPlugin>) {
        self.plugins.insert(plugin.name().to_string(), plugin);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn HostActionPlugin>> {
        self.plugins.get(name).cloned()
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Reference plugin: runs a shell echo on the engine host.
pub struct DummyActionPlugin;

#[async_trait]
impl HostActionPlugin for DummyActionPlugin {
    fn name(&self) -> &str {
        "dummy"
    }

    async fn run(&self, session_id: &str, hostname: &str) -> Result<()> {
        tracing::info!(session_id, hostname, "dummy action plugin run");
        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(format!("echo Dummy running in {}", hostname))
            .output()
            .await?;
        if !output.status.success() {
            return Err(DrydockError::Internal(format!(
                "dummy action plugin failed on {}",
                hostname
            )));
        }
        tracing::debug!(
            session_id,
            output = %String::from_utf8_lossy(&output.stdout).trim_end(),
            "dummy action plugin output"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_knows_dummy() {
        let registry = PluginRegistry::new();
        assert!(registry.get("dummy").is_some());
        assert!(registry.get("compiler-upgrade").is_none());
    }

    #[tokio::test]
    async fn dummy_plugin_runs() {
        let plugin = DummyActionPlugin;
        plugin.run("s1", "compute-1").await.expect("echo succeeds");
    }

    #[test]
    fn spec_deserializes_with_default_metadata() {
        let spec: ActionPluginSpec =
            serde_json::from_str(r#"{"plugin": "dummy", "type": "host"}"#).expect("spec");
        assert_eq!(spec.kind, ActionType::Host);
        let plugin = ActionPlugin::from(spec);
        assert_eq!(plugin.meta, "null");
        assert!(plugin.state.is_none());
    }
}
