// ABOUTME: Orchestrator facade composing admission, registry, backends, readiness and expiry
// ABOUTME: Public start/stop/restart/reset/inspect/cleanup surface with ownership checks

use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use rangelab_catalog::{CatalogError, Lab, LabCatalog};

use crate::admission::{AdmissionController, AdmissionDecision, DenyReason};
use crate::backends::{
    BackendError, BackendKind, ListFilter, PortMapping, ProviderHandle, ProvisionSpec,
    ProvisioningBackend, RuntimeInfo, RuntimeState,
};
use crate::cache::StatusCache;
use crate::config::OrchestratorConfig;
use crate::expiry;
use crate::readiness::{ReadinessError, ReadinessWaiter};
use crate::registry::{
    AdmissionCaps, Instance, InstanceRegistry, InstanceStatus, QuotaScope, RegistryError,
    NON_TERMINAL,
};

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("lab is not available: {0}")]
    LabUnavailable(String),

    #[error("instance cap for lab {lab_id} reached (cap {cap})")]
    LabQuotaExceeded { lab_id: String, cap: i64 },

    #[error("user instance cap reached (cap {cap})")]
    UserQuotaExceeded { cap: i64 },

    #[error("system is at capacity (cap {cap})")]
    SystemAtCapacity { cap: i64 },

    #[error("instance not found: {0}")]
    NotFound(String),

    #[error("user is not allowed to operate on instance {0}")]
    Unauthorized(String),

    #[error("cannot {operation} an instance that is {status}")]
    InvalidStateForOperation {
        operation: &'static str,
        status: InstanceStatus,
    },

    #[error("backend provisioning failed: {0}")]
    BackendProvisioningFailure(String),

    #[error("instance never became ready: {0}")]
    BackendTimeout(String),

    #[error("backend unreachable: {0}")]
    BackendUnreachable(String),

    #[error("no backend registered for kind {0}")]
    BackendNotConfigured(BackendKind),

    #[error("registry error: {0}")]
    Registry(RegistryError),

    #[error("catalogue error: {0}")]
    Catalog(#[from] CatalogError),
}

impl From<RegistryError> for OrchestratorError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::NotFound(id) => Self::NotFound(id),
            other => Self::Registry(other),
        }
    }
}

impl From<BackendError> for OrchestratorError {
    fn from(e: BackendError) -> Self {
        match e {
            BackendError::Unreachable(msg) => Self::BackendUnreachable(msg),
            other => Self::BackendProvisioningFailure(other.to_string()),
        }
    }
}

impl From<DenyReason> for OrchestratorError {
    fn from(reason: DenyReason) -> Self {
        match reason {
            DenyReason::LabUnavailable(lab_id) => Self::LabUnavailable(lab_id),
            DenyReason::LabQuotaExceeded { lab_id, cap } => Self::LabQuotaExceeded { lab_id, cap },
            DenyReason::UserQuotaExceeded { cap } => Self::UserQuotaExceeded { cap },
            DenyReason::SystemAtCapacity { cap } => Self::SystemAtCapacity { cap },
        }
    }
}

impl From<ReadinessError> for OrchestratorError {
    fn from(e: ReadinessError) -> Self {
        match e {
            ReadinessError::Backend(inner) => inner.into(),
            other => Self::BackendTimeout(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// The public operation surface of the lab environment orchestrator.
/// Composes the admission controller, instance registry, provisioning
/// backends, readiness waiter, expiry timers and status cache.
pub struct Orchestrator {
    registry: Arc<InstanceRegistry>,
    catalog: Arc<LabCatalog>,
    admission: AdmissionController,
    cache: StatusCache,
    backends: RwLock<HashMap<BackendKind, Arc<dyn ProvisioningBackend>>>,
    config: OrchestratorConfig,
    /// Handed to expiry timers so a spawned timer can call back into the
    /// facade without keeping it alive forever.
    weak_self: Weak<Orchestrator>,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<InstanceRegistry>,
        catalog: Arc<LabCatalog>,
        config: OrchestratorConfig,
    ) -> Arc<Self> {
        let admission = AdmissionController::new(
            Arc::clone(&catalog),
            Arc::clone(&registry),
            config.max_instances_per_user,
            config.max_total_instances,
        );
        Arc::new_cyclic(|weak| Self {
            registry,
            catalog,
            admission,
            cache: StatusCache::new(config.cache_ttl()),
            backends: RwLock::new(HashMap::new()),
            config,
            weak_self: weak.clone(),
        })
    }

    /// Register a provisioning backend implementation
    pub async fn register_backend(&self, backend: Arc<dyn ProvisioningBackend>) {
        let kind = backend.kind();
        self.backends.write().await.insert(kind, backend);
    }

    pub fn registry(&self) -> &Arc<InstanceRegistry> {
        &self.registry
    }

    async fn backend(&self, kind: BackendKind) -> Result<Arc<dyn ProvisioningBackend>> {
        self.backends
            .read()
            .await
            .get(&kind)
            .cloned()
            .ok_or(OrchestratorError::BackendNotConfigured(kind))
    }

    fn backend_kind_for(&self, lab: &Lab) -> Result<BackendKind> {
        if lab.backend.is_empty() {
            return Ok(self.config.default_backend);
        }
        BackendKind::from_str(&lab.backend).map_err(|_| {
            OrchestratorError::Catalog(CatalogError::InvalidConfig(format!(
                "lab {} names unknown backend {}",
                lab.id, lab.backend
            )))
        })
    }

    fn session_duration(&self, lab: &Lab, override_duration: Option<ChronoDuration>) -> ChronoDuration {
        override_duration.unwrap_or_else(|| {
            let minutes = if lab.session_minutes > 0 {
                lab.session_minutes
            } else {
                self.config.default_session_minutes
            };
            ChronoDuration::minutes(minutes)
        })
    }

    fn provision_spec(&self, instance: &Instance, lab: &Lab) -> ProvisionSpec {
        ProvisionSpec {
            instance_id: instance.id.clone(),
            name: format!("rangelab-{}", instance.id),
            image: lab.image.clone(),
            container_ports: lab.ports.clone(),
            env_vars: lab.env_vars.clone(),
            memory_limit: lab.limits.memory.clone(),
            cpu_limit: lab.limits.cpus.clone(),
            host_ports: vec![],
        }
    }

    fn handle_for(&self, instance: &Instance) -> Option<ProviderHandle> {
        instance.resource_id.as_ref().map(|rid| ProviderHandle {
            kind: instance.backend,
            resource_id: rid.clone(),
        })
    }

    async fn load_owned(&self, instance_id: &str, user_id: &str) -> Result<Instance> {
        let instance = self.registry.get(instance_id).await?;
        if instance.user_id != user_id {
            return Err(OrchestratorError::Unauthorized(instance_id.to_string()));
        }
        Ok(instance)
    }

    /// Port mappings and the primary access URL for a ready instance.
    /// Local labs are reached through translated host ports on the
    /// orchestrator host; remote labs expose their ports directly on the
    /// VM's public address.
    fn derive_endpoints(
        &self,
        lab: &Lab,
        kind: BackendKind,
        info: &RuntimeInfo,
    ) -> (Vec<PortMapping>, Option<String>) {
        match kind {
            BackendKind::Local => {
                let ports = info.ports.clone();
                let access_url = lab
                    .ports
                    .first()
                    .and_then(|primary| ports.iter().find(|m| m.container_port == *primary))
                    .map(|m| format!("http://{}:{}", self.config.advertised_host, m.host_port));
                (ports, access_url)
            }
            BackendKind::Remote => {
                let ports = lab.ports.iter().map(|&p| PortMapping::tcp(p, p)).collect();
                let access_url = match (&info.public_addr, lab.ports.first()) {
                    (Some(addr), Some(port)) => Some(format!("http://{}:{}", addr, port)),
                    _ => None,
                };
                (ports, access_url)
            }
        }
    }

    /// Provision an isolated, time-boxed sandbox for (user, lab).
    pub async fn start(
        &self,
        user_id: &str,
        lab_id: &str,
        session_override: Option<ChronoDuration>,
    ) -> Result<Instance> {
        let lab = self
            .catalog
            .get(lab_id)
            .cloned()
            .ok_or_else(|| OrchestratorError::LabUnavailable(lab_id.to_string()))?;
        if !lab.active {
            return Err(OrchestratorError::LabUnavailable(lab_id.to_string()));
        }

        // Advisory gate; the registry insert below re-validates.
        match self.admission.can_admit(user_id, lab_id).await? {
            AdmissionDecision::Allow => {}
            AdmissionDecision::Deny(reason) => return Err(reason.into()),
        }

        let kind = self.backend_kind_for(&lab)?;
        let backend = self.backend(kind).await?;

        let now = Utc::now();
        let instance = Instance {
            id: String::new(),
            lab_id: lab_id.to_string(),
            user_id: user_id.to_string(),
            backend: kind,
            resource_id: None,
            private_addr: None,
            public_addr: None,
            port_mappings: vec![],
            access_url: None,
            status: InstanceStatus::Starting,
            created_at: now,
            started_at: None,
            stopped_at: None,
            expires_at: now + self.session_duration(&lab, session_override),
            restart_count: 0,
            auto_cleanup: self.config.auto_cleanup_on_expiry,
            error_message: None,
            provider_metadata: None,
        };

        let caps = AdmissionCaps {
            lab_cap: lab.per_user_cap,
            user_cap: self.config.max_instances_per_user,
            global_cap: self.config.max_total_instances,
        };

        let instance = match self.registry.create_admitted(instance, caps).await {
            Ok(instance) => instance,
            Err(RegistryError::QuotaExceeded { scope, cap }) => {
                return Err(match scope {
                    QuotaScope::Lab => OrchestratorError::LabQuotaExceeded {
                        lab_id: lab_id.to_string(),
                        cap,
                    },
                    QuotaScope::User => OrchestratorError::UserQuotaExceeded { cap },
                    QuotaScope::System => OrchestratorError::SystemAtCapacity { cap },
                })
            }
            Err(e) => return Err(e.into()),
        };

        info!(
            "Starting instance {} (lab {}, user {}, backend {})",
            instance.id, lab_id, user_id, kind
        );

        self.provision(instance, &lab, backend).await
    }

    /// Create the physical resource for a pending record and drive it to
    /// running. On failure the record moves to error and whatever was
    /// created is deleted as compensation.
    async fn provision(
        &self,
        instance: Instance,
        lab: &Lab,
        backend: Arc<dyn ProvisioningBackend>,
    ) -> Result<Instance> {
        let spec = self.provision_spec(&instance, lab);

        let handle = match backend.create(&spec).await {
            Ok(handle) => handle,
            Err(e) => {
                let msg = e.to_string();
                warn!("Provisioning failed for {}: {}", instance.id, msg);
                let _ = self
                    .registry
                    .transition(&instance.id, &NON_TERMINAL, InstanceStatus::Error, Some(msg))
                    .await;
                return Err(e.into());
            }
        };

        self.registry
            .record_provisioned(&instance.id, &handle.resource_id, None)
            .await?;

        self.finish_readiness(&instance.id, lab, &backend, &handle, true)
            .await
    }

    /// Wait for readiness, record endpoints and flip the record to
    /// running. Shared by start and both restart paths.
    async fn finish_readiness(
        &self,
        instance_id: &str,
        lab: &Lab,
        backend: &Arc<dyn ProvisioningBackend>,
        handle: &ProviderHandle,
        compensate_on_failure: bool,
    ) -> Result<Instance> {
        let waiter = ReadinessWaiter::new(
            self.config.readiness_poll(),
            self.config.readiness_timeout(),
        );

        let info = match waiter.wait_until_running(backend.as_ref(), handle).await {
            Ok(info) => info,
            Err(e) => {
                let msg = e.to_string();
                warn!("Instance {} failed readiness: {}", instance_id, msg);
                let _ = self
                    .registry
                    .transition(
                        instance_id,
                        &[InstanceStatus::Starting],
                        InstanceStatus::Error,
                        Some(msg),
                    )
                    .await;
                if compensate_on_failure {
                    if let Err(del_err) = backend.delete(handle).await {
                        warn!(
                            "Compensating delete of {} failed: {}",
                            handle.resource_id, del_err
                        );
                    }
                }
                return Err(e.into());
            }
        };

        if let Some(metadata) = &info.metadata {
            self.registry
                .record_provisioned(instance_id, &handle.resource_id, Some(metadata))
                .await?;
        }

        let (ports, access_url) = self.derive_endpoints(lab, backend.kind(), &info);
        self.registry
            .record_endpoints(
                instance_id,
                info.private_addr.as_deref(),
                info.public_addr.as_deref(),
                &ports,
                access_url.as_deref(),
            )
            .await?;

        let became_running = self
            .registry
            .transition(
                instance_id,
                &[InstanceStatus::Starting],
                InstanceStatus::Running,
                None,
            )
            .await?;

        if !became_running {
            // A stop raced the in-flight provisioning and won. Tear down
            // whatever we created and surface the settled record.
            info!(
                "Instance {} was stopped while provisioning; releasing resource {}",
                instance_id, handle.resource_id
            );
            if let Err(e) = backend.delete(handle).await {
                warn!("Failed to release resource {}: {}", handle.resource_id, e);
            }
            return self.registry.get(instance_id).await.map_err(Into::into);
        }

        let updated = self.registry.get(instance_id).await?;
        if let Some(orchestrator) = self.weak_self.upgrade() {
            expiry::arm_expiry_timer(orchestrator, updated.id.clone(), updated.expires_at);
        }
        self.cache.put(updated.clone()).await;

        info!(
            "Instance {} is running (expires at {})",
            updated.id, updated.expires_at
        );
        Ok(updated)
    }

    /// Stop a running (or still-starting) instance. Idempotent: stopping
    /// an already-stopped instance succeeds without side effects.
    pub async fn stop(&self, instance_id: &str, user_id: &str) -> Result<Instance> {
        let instance = self.load_owned(instance_id, user_id).await?;

        match instance.status {
            InstanceStatus::Stopped => return Ok(instance),
            InstanceStatus::Error | InstanceStatus::Expired => {
                return Err(OrchestratorError::InvalidStateForOperation {
                    operation: "stop",
                    status: instance.status,
                })
            }
            InstanceStatus::Starting | InstanceStatus::Running | InstanceStatus::Stopping => {}
        }

        let moved = self
            .registry
            .transition(
                instance_id,
                &[InstanceStatus::Starting, InstanceStatus::Running],
                InstanceStatus::Stopping,
                None,
            )
            .await?;

        if !moved {
            // Another operation won the race; surface the settled record.
            let current = self.registry.get(instance_id).await?;
            return match current.status {
                InstanceStatus::Stopped | InstanceStatus::Stopping => Ok(current),
                status => Err(OrchestratorError::InvalidStateForOperation {
                    operation: "stop",
                    status,
                }),
            };
        }

        info!("Stopping instance {}", instance_id);

        // Re-read: an in-flight start may have recorded the resource
        // after our first load.
        let current = self.registry.get(instance_id).await?;
        if let Some(handle) = self.handle_for(&current) {
            let backend = self.backend(current.backend).await?;
            if let Err(e) = backend.halt(&handle).await {
                let msg = e.to_string();
                let _ = self
                    .registry
                    .transition(
                        instance_id,
                        &[InstanceStatus::Stopping],
                        InstanceStatus::Error,
                        Some(msg),
                    )
                    .await;
                return Err(e.into());
            }
        }

        self.registry
            .transition(
                instance_id,
                &[InstanceStatus::Stopping],
                InstanceStatus::Stopped,
                None,
            )
            .await?;
        self.cache.invalidate(instance_id).await;

        self.registry.get(instance_id).await.map_err(Into::into)
    }

    /// Bring a stopped, failed or expired instance back up, extending its
    /// expiry and counting the restart. The instance id never changes.
    pub async fn restart(&self, instance_id: &str, user_id: &str) -> Result<Instance> {
        let instance = self.load_owned(instance_id, user_id).await?;

        if !instance.is_terminal() {
            return Err(OrchestratorError::InvalidStateForOperation {
                operation: "restart",
                status: instance.status,
            });
        }

        let lab = self
            .catalog
            .get(&instance.lab_id)
            .cloned()
            .ok_or_else(|| OrchestratorError::LabUnavailable(instance.lab_id.clone()))?;

        let moved = self
            .registry
            .transition(
                instance_id,
                &[
                    InstanceStatus::Stopped,
                    InstanceStatus::Error,
                    InstanceStatus::Expired,
                ],
                InstanceStatus::Starting,
                None,
            )
            .await?;
        if !moved {
            let current = self.registry.get(instance_id).await?;
            return Err(OrchestratorError::InvalidStateForOperation {
                operation: "restart",
                status: current.status,
            });
        }

        let backend = self.backend(instance.backend).await?;
        let new_expires = Utc::now() + self.session_duration(&lab, None);
        self.registry.bump_restart(instance_id, new_expires).await?;

        info!(
            "Restarting instance {} (restart #{}, new expiry {})",
            instance_id,
            instance.restart_count + 1,
            new_expires
        );

        match (instance.backend, self.handle_for(&instance)) {
            // A halted local container is rebooted in place.
            (BackendKind::Local, Some(handle)) => {
                if let Err(e) = backend.reboot(&handle).await {
                    let msg = e.to_string();
                    let _ = self
                        .registry
                        .transition(
                            instance_id,
                            &[InstanceStatus::Starting],
                            InstanceStatus::Error,
                            Some(msg),
                        )
                        .await;
                    return Err(e.into());
                }
                self.finish_readiness(instance_id, &lab, &backend, &handle, false)
                    .await
            }
            // Remote VMs were discarded on stop; run a fresh boot
            // sequence. Also covers a local instance whose container is
            // gone (failed provisioning cleaned it up).
            (_, old_handle) => {
                if let Some(old) = old_handle {
                    if let Err(e) = backend.delete(&old).await {
                        warn!("Failed to discard old resource {}: {}", old.resource_id, e);
                    }
                }
                let pending = self.registry.get(instance_id).await?;
                self.provision(pending, &lab, backend).await
            }
        }
    }

    /// Discard the physical resource and the record entirely, then start
    /// fresh for the same (user, lab). Returns the new instance.
    pub async fn reset(&self, instance_id: &str, user_id: &str) -> Result<Instance> {
        let instance = self.load_owned(instance_id, user_id).await?;

        if matches!(
            instance.status,
            InstanceStatus::Starting | InstanceStatus::Stopping
        ) {
            return Err(OrchestratorError::InvalidStateForOperation {
                operation: "reset",
                status: instance.status,
            });
        }

        info!("Resetting instance {} (lab {})", instance_id, instance.lab_id);

        if let Some(handle) = self.handle_for(&instance) {
            let backend = self.backend(instance.backend).await?;
            backend.delete(&handle).await?;
        }

        self.registry.delete(instance_id).await?;
        self.cache.invalidate(instance_id).await;

        self.start(user_id, &instance.lab_id, None).await
    }

    /// Current snapshot of an instance, opportunistically refreshed from
    /// the backend. Backend unavailability falls back to the last-known
    /// durable record.
    pub async fn inspect(&self, instance_id: &str, user_id: &str) -> Result<Instance> {
        if let Some(cached) = self.cache.get(instance_id).await {
            if cached.user_id != user_id {
                return Err(OrchestratorError::Unauthorized(instance_id.to_string()));
            }
            return Ok(cached);
        }

        let instance = self.load_owned(instance_id, user_id).await?;
        if instance.is_terminal() {
            return Ok(instance);
        }
        let Some(handle) = self.handle_for(&instance) else {
            return Ok(instance);
        };
        let Ok(backend) = self.backend(instance.backend).await else {
            return Ok(instance);
        };

        match backend.inspect(&handle).await {
            Ok(info) => {
                if instance.status == InstanceStatus::Running {
                    match info.state {
                        RuntimeState::Failed(msg) => {
                            warn!("Instance {} failed at the backend: {}", instance_id, msg);
                            let _ = self
                                .registry
                                .transition(
                                    instance_id,
                                    &[InstanceStatus::Running],
                                    InstanceStatus::Error,
                                    Some(msg),
                                )
                                .await;
                        }
                        RuntimeState::Missing => {
                            warn!("Backend resource for {} is gone", instance_id);
                            let _ = self
                                .registry
                                .transition(
                                    instance_id,
                                    &[InstanceStatus::Running],
                                    InstanceStatus::Error,
                                    Some("backend resource is gone".to_string()),
                                )
                                .await;
                        }
                        _ => {}
                    }
                }
                let refreshed = self.registry.get(instance_id).await?;
                self.cache.put(refreshed.clone()).await;
                Ok(refreshed)
            }
            Err(e) => {
                // Transient backend trouble never overwrites the durable
                // record.
                debug!(
                    "Backend unavailable while inspecting {}: {}; serving last-known record",
                    instance_id, e
                );
                Ok(instance)
            }
        }
    }

    pub async fn list_for_user(&self, user_id: &str) -> Result<Vec<Instance>> {
        self.registry.list_for_user(user_id).await.map_err(Into::into)
    }

    /// Safety-net sweep reclaiming every running instance past its
    /// expiry. One instance's teardown failure never aborts the sweep.
    pub async fn cleanup_expired(&self) -> usize {
        let due = match self.registry.list_expired_running(Utc::now()).await {
            Ok(due) => due,
            Err(e) => {
                error!("Expiry sweep could not list instances: {}", e);
                return 0;
            }
        };

        let mut reclaimed = 0;
        for instance in due {
            match self.expire_instance(&instance.id).await {
                Ok(true) => reclaimed += 1,
                Ok(false) => {}
                Err(e) => warn!("Failed to expire instance {}: {}", instance.id, e),
            }
        }

        if reclaimed > 0 {
            info!("Expiry sweep reclaimed {} instance(s)", reclaimed);
        }
        reclaimed
    }

    /// Remove backend resources with no corresponding registry record
    /// (crash leftovers, manual tampering). Tracked resources are never
    /// touched. Returns (orphans found, orphans removed, errors).
    pub async fn reconcile_orphans(
        &self,
        kind: BackendKind,
        dry_run: bool,
    ) -> Result<(usize, usize, Vec<String>)> {
        let backend = self.backend(kind).await?;
        let resources = backend
            .list(&ListFilter {
                include_halted: true,
            })
            .await?;

        let mut orphaned = 0;
        let mut removed = 0;
        let mut errors = Vec::new();

        for info in resources {
            if self.registry.resource_exists(&info.resource_id).await? {
                continue;
            }
            orphaned += 1;
            warn!("Found orphaned resource: {}", info.resource_id);

            if dry_run {
                continue;
            }
            let handle = ProviderHandle {
                kind,
                resource_id: info.resource_id.clone(),
            };
            match backend.delete(&handle).await {
                Ok(()) => removed += 1,
                Err(e) => {
                    let message =
                        format!("failed to remove orphaned resource {}: {}", info.resource_id, e);
                    warn!("{}", message);
                    errors.push(message);
                }
            }
        }

        info!(
            "Orphan reconciliation on {}: found {}, removed {} (dry run: {})",
            kind, orphaned, removed, dry_run
        );
        Ok((orphaned, removed, errors))
    }

    /// Guarded expiry shared by per-instance timers and the sweep: the
    /// record must still be running with its expiry in the past at the
    /// moment of the CAS, so a timer superseded by restart or stop is a
    /// no-op. Returns whether this call performed the teardown.
    pub(crate) async fn expire_instance(&self, instance_id: &str) -> Result<bool> {
        let instance = match self.registry.get(instance_id).await {
            Ok(instance) => instance,
            Err(RegistryError::NotFound(_)) => return Ok(false),
            Err(e) => return Err(e.into()),
        };

        if instance.status != InstanceStatus::Running || Utc::now() < instance.expires_at {
            return Ok(false);
        }

        let moved = self
            .registry
            .transition(
                instance_id,
                &[InstanceStatus::Running],
                InstanceStatus::Stopping,
                None,
            )
            .await?;
        if !moved {
            // A user action won the race.
            return Ok(false);
        }

        info!("Instance {} expired; tearing down", instance_id);

        if let Some(handle) = self.handle_for(&instance) {
            let backend = self.backend(instance.backend).await?;
            if let Err(e) = backend.delete(&handle).await {
                let msg = e.to_string();
                let _ = self
                    .registry
                    .transition(
                        instance_id,
                        &[InstanceStatus::Stopping],
                        InstanceStatus::Error,
                        Some(msg),
                    )
                    .await;
                return Err(e.into());
            }
        }

        self.registry
            .transition(
                instance_id,
                &[InstanceStatus::Stopping],
                InstanceStatus::Expired,
                None,
            )
            .await?;
        self.cache.invalidate(instance_id).await;

        if instance.auto_cleanup {
            self.registry.delete(instance_id).await?;
        }

        Ok(true)
    }
}
