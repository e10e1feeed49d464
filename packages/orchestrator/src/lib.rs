// ABOUTME: Lab environment orchestrator for the Rangelab training platform
// ABOUTME: Provisions isolated, time-boxed sandboxes on local Docker or dedicated cloud VMs

pub mod admission;
pub mod backends;
pub mod cache;
pub mod config;
pub mod expiry;
pub mod orchestrator;
pub mod readiness;
pub mod registry;

pub use admission::{AdmissionController, AdmissionDecision, DenyReason};
pub use backends::{
    cloud::CloudBackendConfig, docker::DockerBackendConfig, BackendError, BackendKind,
    CloudVmBackend, DockerBackend, ListFilter, PortMapping, ProviderHandle, ProvisionSpec,
    ProvisioningBackend, RuntimeInfo, RuntimeState,
};
pub use cache::StatusCache;
pub use config::OrchestratorConfig;
pub use expiry::ExpirySweeper;
pub use orchestrator::{Orchestrator, OrchestratorError};
pub use readiness::{ReadinessError, ReadinessWaiter};
pub use registry::{
    AdmissionCaps, Instance, InstanceRegistry, InstanceStatus, QuotaScope, RegistryError,
};
