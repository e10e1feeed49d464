// ABOUTME: Provisioning backend contract shared by the local container and cloud VM backends
// ABOUTME: Defines the narrow create/inspect/reboot/delete/list interface and its value types

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

pub mod cloud;
pub mod docker;

pub use cloud::CloudVmBackend;
pub use docker::DockerBackend;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Provisioning failed: {0}")]
    Provisioning(String),

    #[error("Backend unreachable: {0}")]
    Unreachable(String),

    #[error("Image error: {0}")]
    Image(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, BackendError>;

/// Which provisioning path an instance was created on.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Local,
    Remote,
}

impl BackendKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Local => "local",
            Self::Remote => "remote",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "local" => Ok(Self::Local),
            "remote" => Ok(Self::Remote),
            _ => Err(BackendError::Config(format!("unknown backend kind: {}", s))),
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What to provision for one instance.
#[derive(Debug, Clone)]
pub struct ProvisionSpec {
    pub instance_id: String,
    pub name: String,
    pub image: String,
    pub container_ports: Vec<u16>,
    pub env_vars: HashMap<String, String>,
    /// Human-readable memory limit, e.g. "512m" or "2g"
    pub memory_limit: String,
    /// Human-readable CPU limit, e.g. "1.0"
    pub cpu_limit: String,
    /// Explicit host-side mapping; when empty the backend allocates.
    pub host_ports: Vec<PortMapping>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortMapping {
    pub container_port: u16,
    pub host_port: u16,
    pub protocol: String,
}

impl PortMapping {
    pub fn tcp(container_port: u16, host_port: u16) -> Self {
        Self {
            container_port,
            host_port,
            protocol: "tcp".to_string(),
        }
    }
}

/// Opaque reference to the provider-side resource backing an instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProviderHandle {
    pub kind: BackendKind,
    pub resource_id: String,
}

/// Coarse runtime state reported by a backend on inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeState {
    Provisioning,
    Running,
    Halted,
    /// The provider no longer knows the resource.
    Missing,
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct RuntimeInfo {
    pub resource_id: String,
    pub state: RuntimeState,
    pub private_addr: Option<String>,
    pub public_addr: Option<String>,
    pub ports: Vec<PortMapping>,
    /// Provider metadata blob (region, plan, tags). Informational only.
    pub metadata: Option<JsonValue>,
}

/// Filter for reconciliation listings; never used on the request hot path.
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub include_halted: bool,
}

/// Uniform contract over the local container engine and the cloud VM
/// provider. New backends implement the five core operations; `halt` and
/// `readiness_grace` have defaults.
#[async_trait]
pub trait ProvisioningBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Extra settling delay applied after the provider reports a running
    /// state, before the resource is declared ready.
    fn readiness_grace(&self) -> Duration {
        Duration::ZERO
    }

    /// Create the resource. Idempotence under retry is the caller's
    /// concern; the registry's pending record prevents duplicate
    /// submission.
    async fn create(&self, spec: &ProvisionSpec) -> Result<ProviderHandle>;

    async fn inspect(&self, handle: &ProviderHandle) -> Result<RuntimeInfo>;

    async fn reboot(&self, handle: &ProviderHandle) -> Result<()>;

    /// Stop the resource without discarding it, when the backend can.
    /// The default discards, which is correct for providers whose halted
    /// resources keep billing.
    async fn halt(&self, handle: &ProviderHandle) -> Result<()> {
        self.delete(handle).await
    }

    /// Remove the resource. An already-gone resource is a success.
    async fn delete(&self, handle: &ProviderHandle) -> Result<()>;

    async fn list(&self, filter: &ListFilter) -> Result<Vec<RuntimeInfo>>;
}
