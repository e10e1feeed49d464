// ABOUTME: Integration tests for the full instance lifecycle against a scriptable mock backend
// ABOUTME: Covers quotas, idempotent stop, restart, reset, expiry and teardown races

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

use rangelab_catalog::{Lab, LabCatalog, ResourceLimits};
use rangelab_orchestrator::{
    AdmissionCaps, BackendError, BackendKind, Instance, InstanceRegistry, InstanceStatus,
    ListFilter, Orchestrator, OrchestratorConfig, OrchestratorError, PortMapping, ProviderHandle,
    ProvisionSpec, ProvisioningBackend, RuntimeInfo, RuntimeState,
};

#[derive(Default)]
struct MockState {
    running: HashSet<String>,
    halted: HashSet<String>,
    deleted: Vec<String>,
    fail_delete: HashSet<String>,
}

/// Scriptable in-memory backend. Resources become running immediately on
/// create; `halt` parks local resources so they can be rebooted, while
/// remote resources are discarded, mirroring the real backends.
struct MockBackend {
    kind: BackendKind,
    state: Mutex<MockState>,
    next_id: AtomicU64,
    gated: AtomicBool,
    gate: Notify,
}

impl MockBackend {
    fn new(kind: BackendKind) -> Self {
        Self {
            kind,
            state: Mutex::new(MockState::default()),
            next_id: AtomicU64::new(1),
            gated: AtomicBool::new(false),
            gate: Notify::new(),
        }
    }

    fn hold_creates(&self) {
        self.gated.store(true, Ordering::SeqCst);
    }

    fn release_create(&self) {
        self.gate.notify_one();
    }

    fn fail_delete_of(&self, resource_id: &str) {
        self.state
            .lock()
            .unwrap()
            .fail_delete
            .insert(resource_id.to_string());
    }

    fn running_count(&self) -> usize {
        self.state.lock().unwrap().running.len()
    }

    fn is_running(&self, resource_id: &str) -> bool {
        self.state.lock().unwrap().running.contains(resource_id)
    }

    fn deleted_ids(&self) -> Vec<String> {
        self.state.lock().unwrap().deleted.clone()
    }
}

#[async_trait]
impl ProvisioningBackend for MockBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn create(&self, _spec: &ProvisionSpec) -> Result<ProviderHandle, BackendError> {
        if self.gated.load(Ordering::SeqCst) {
            self.gate.notified().await;
        }
        let resource_id = format!("m-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.state
            .lock()
            .unwrap()
            .running
            .insert(resource_id.clone());
        Ok(ProviderHandle {
            kind: self.kind,
            resource_id,
        })
    }

    async fn inspect(&self, handle: &ProviderHandle) -> Result<RuntimeInfo, BackendError> {
        let state = self.state.lock().unwrap();
        let runtime_state = if state.running.contains(&handle.resource_id) {
            RuntimeState::Running
        } else if state.halted.contains(&handle.resource_id) {
            RuntimeState::Halted
        } else {
            RuntimeState::Missing
        };
        Ok(RuntimeInfo {
            resource_id: handle.resource_id.clone(),
            state: runtime_state,
            private_addr: Some("172.28.0.2".to_string()),
            public_addr: Some("203.0.113.5".to_string()),
            ports: vec![PortMapping::tcp(80, 20080)],
            metadata: None,
        })
    }

    async fn reboot(&self, handle: &ProviderHandle) -> Result<(), BackendError> {
        let mut state = self.state.lock().unwrap();
        state.halted.remove(&handle.resource_id);
        state.running.insert(handle.resource_id.clone());
        Ok(())
    }

    async fn halt(&self, handle: &ProviderHandle) -> Result<(), BackendError> {
        if self.kind == BackendKind::Local {
            let mut state = self.state.lock().unwrap();
            state.running.remove(&handle.resource_id);
            state.halted.insert(handle.resource_id.clone());
            Ok(())
        } else {
            self.delete(handle).await
        }
    }

    async fn delete(&self, handle: &ProviderHandle) -> Result<(), BackendError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_delete.contains(&handle.resource_id) {
            return Err(BackendError::Provisioning("simulated delete failure".to_string()));
        }
        state.running.remove(&handle.resource_id);
        state.halted.remove(&handle.resource_id);
        state.deleted.push(handle.resource_id.clone());
        Ok(())
    }

    async fn list(&self, filter: &ListFilter) -> Result<Vec<RuntimeInfo>, BackendError> {
        let state = self.state.lock().unwrap();
        let mut ids: Vec<(String, RuntimeState)> = state
            .running
            .iter()
            .map(|id| (id.clone(), RuntimeState::Running))
            .collect();
        if filter.include_halted {
            ids.extend(
                state
                    .halted
                    .iter()
                    .map(|id| (id.clone(), RuntimeState::Halted)),
            );
        }
        Ok(ids
            .into_iter()
            .map(|(resource_id, runtime_state)| RuntimeInfo {
                resource_id,
                state: runtime_state,
                private_addr: None,
                public_addr: None,
                ports: vec![],
                metadata: None,
            })
            .collect())
    }
}

fn lab(id: &str, backend: &str, per_user_cap: i64) -> Lab {
    Lab {
        id: id.to_string(),
        name: id.to_string(),
        difficulty: "beginner".to_string(),
        points: 100,
        image: "rangelab/test:1.0".to_string(),
        ports: vec![80],
        env_vars: HashMap::new(),
        limits: ResourceLimits {
            memory: "256m".to_string(),
            cpus: "0.5".to_string(),
        },
        session_minutes: 60,
        per_user_cap,
        backend: backend.to_string(),
        active: true,
    }
}

fn test_config() -> OrchestratorConfig {
    OrchestratorConfig {
        max_instances_per_user: 3,
        max_total_instances: 50,
        readiness_poll_seconds: 0,
        readiness_timeout_seconds: 5,
        ..Default::default()
    }
}

async fn setup(
    labs: Vec<Lab>,
    backend_kind: BackendKind,
    config: OrchestratorConfig,
) -> (Arc<Orchestrator>, Arc<MockBackend>) {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory database");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("Failed to run migrations");

    let registry = Arc::new(InstanceRegistry::new(pool));
    let catalog = Arc::new(LabCatalog::from_labs(labs));
    let orchestrator = Orchestrator::new(registry, catalog, config);

    let backend = Arc::new(MockBackend::new(backend_kind));
    orchestrator
        .register_backend(backend.clone() as Arc<dyn ProvisioningBackend>)
        .await;

    (orchestrator, backend)
}

async fn setup_local() -> (Arc<Orchestrator>, Arc<MockBackend>) {
    setup(
        vec![lab("web-basics", "local", 1), lab("forensics", "local", 2)],
        BackendKind::Local,
        test_config(),
    )
    .await
}

#[tokio::test]
async fn test_start_reports_running_with_access_url() {
    let (orchestrator, backend) = setup_local().await;

    let instance = orchestrator
        .start("user-1", "web-basics", None)
        .await
        .expect("start failed");

    assert_eq!(instance.status, InstanceStatus::Running);
    assert!(instance.started_at.is_some());
    assert_eq!(instance.port_mappings, vec![PortMapping::tcp(80, 20080)]);
    assert_eq!(
        instance.access_url.as_deref(),
        Some("http://127.0.0.1:20080")
    );
    assert_eq!(backend.running_count(), 1);

    // Round trip: inspecting right after a successful start reports
    // running with a non-empty access address.
    let inspected = orchestrator
        .inspect(&instance.id, "user-1")
        .await
        .expect("inspect failed");
    assert_eq!(inspected.status, InstanceStatus::Running);
    assert!(inspected.access_url.is_some());
}

#[tokio::test]
async fn test_duplicate_start_is_deterministic_quota_error() {
    let (orchestrator, backend) = setup_local().await;

    orchestrator
        .start("user-1", "web-basics", None)
        .await
        .unwrap();

    let err = orchestrator
        .start("user-1", "web-basics", None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::LabQuotaExceeded { cap: 1, .. }
    ));
    assert_eq!(backend.running_count(), 1);
}

#[tokio::test]
async fn test_concurrent_start_burst_admits_exactly_one() {
    let (orchestrator, backend) = setup_local().await;

    let mut handles = vec![];
    for _ in 0..5 {
        let orchestrator = orchestrator.clone();
        handles.push(tokio::spawn(async move {
            orchestrator.start("user-1", "web-basics", None).await
        }));
    }

    let mut ok = 0;
    let mut quota_errors = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => ok += 1,
            Err(OrchestratorError::LabQuotaExceeded { .. }) => quota_errors += 1,
            Err(other) => panic!("unexpected error: {}", other),
        }
    }

    assert_eq!(ok, 1);
    assert_eq!(quota_errors, 4);
    assert_eq!(backend.running_count(), 1);
}

#[tokio::test]
async fn test_user_quota_across_labs() {
    let config = OrchestratorConfig {
        max_instances_per_user: 1,
        ..test_config()
    };
    let (orchestrator, _backend) = setup(
        vec![lab("web-basics", "local", 1), lab("forensics", "local", 2)],
        BackendKind::Local,
        config,
    )
    .await;

    orchestrator
        .start("user-1", "web-basics", None)
        .await
        .unwrap();

    let err = orchestrator
        .start("user-1", "forensics", None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::UserQuotaExceeded { cap: 1 }
    ));
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let (orchestrator, backend) = setup_local().await;

    let instance = orchestrator
        .start("user-1", "web-basics", None)
        .await
        .unwrap();

    let stopped = orchestrator.stop(&instance.id, "user-1").await.unwrap();
    assert_eq!(stopped.status, InstanceStatus::Stopped);
    assert!(stopped.stopped_at.is_some());
    assert_eq!(backend.running_count(), 0);

    // Second stop is a no-op success.
    let stopped_again = orchestrator.stop(&instance.id, "user-1").await.unwrap();
    assert_eq!(stopped_again.status, InstanceStatus::Stopped);
}

#[tokio::test]
async fn test_stop_before_ready_leaves_no_running_resource() {
    let (orchestrator, backend) = setup_local().await;
    backend.hold_creates();

    let starter = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.start("user-1", "web-basics", None).await })
    };

    // Wait for the pending record to appear.
    let instance_id = loop {
        let instances = orchestrator.list_for_user("user-1").await.unwrap();
        if let Some(instance) = instances.first() {
            break instance.id.clone();
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    };

    let stopped = orchestrator.stop(&instance_id, "user-1").await.unwrap();
    assert_eq!(stopped.status, InstanceStatus::Stopped);

    // Let the in-flight creation finish; the start path must tear down
    // whatever it created.
    backend.release_create();
    let result = starter.await.unwrap().unwrap();
    assert_eq!(result.status, InstanceStatus::Stopped);

    assert_eq!(backend.running_count(), 0);
    assert!(!backend.deleted_ids().is_empty());
}

#[tokio::test]
async fn test_restart_extends_expiry_and_keeps_id() {
    let (orchestrator, backend) = setup_local().await;

    let instance = orchestrator
        .start("user-1", "web-basics", Some(ChronoDuration::minutes(5)))
        .await
        .unwrap();
    let original_expiry = instance.expires_at;

    orchestrator.stop(&instance.id, "user-1").await.unwrap();

    let restarted = orchestrator
        .restart(&instance.id, "user-1")
        .await
        .unwrap();

    assert_eq!(restarted.id, instance.id);
    assert_eq!(restarted.status, InstanceStatus::Running);
    assert_eq!(restarted.restart_count, 1);
    assert!(restarted.expires_at > original_expiry);
    assert!(backend.is_running(instance.resource_id.as_deref().unwrap()));
}

#[tokio::test]
async fn test_restart_on_running_instance_is_invalid() {
    let (orchestrator, _backend) = setup_local().await;

    let instance = orchestrator
        .start("user-1", "web-basics", None)
        .await
        .unwrap();

    let err = orchestrator
        .restart(&instance.id, "user-1")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::InvalidStateForOperation {
            operation: "restart",
            status: InstanceStatus::Running
        }
    ));
}

#[tokio::test]
async fn test_reset_yields_new_instance_and_removes_old_record() {
    let (orchestrator, backend) = setup_local().await;

    let original = orchestrator
        .start("user-1", "web-basics", None)
        .await
        .unwrap();
    let old_resource = original.resource_id.clone().unwrap();

    let fresh = orchestrator.reset(&original.id, "user-1").await.unwrap();

    assert_ne!(fresh.id, original.id);
    assert_eq!(fresh.status, InstanceStatus::Running);
    assert_eq!(fresh.restart_count, 0);

    assert!(backend.deleted_ids().contains(&old_resource));
    assert!(matches!(
        orchestrator.inspect(&original.id, "user-1").await.unwrap_err(),
        OrchestratorError::NotFound(_)
    ));
}

#[tokio::test]
async fn test_expiry_timer_reclaims_instance() {
    let (orchestrator, backend) = setup_local().await;

    let instance = orchestrator
        .start("user-1", "web-basics", Some(ChronoDuration::seconds(1)))
        .await
        .unwrap();
    let resource_id = instance.resource_id.clone().unwrap();

    tokio::time::sleep(Duration::from_secs(2)).await;

    let inspected = orchestrator
        .inspect(&instance.id, "user-1")
        .await
        .unwrap();
    assert_eq!(inspected.status, InstanceStatus::Expired);
    assert!(backend.deleted_ids().contains(&resource_id));
    assert_eq!(backend.running_count(), 0);
}

#[tokio::test]
async fn test_expiry_with_auto_cleanup_deletes_record() {
    let config = OrchestratorConfig {
        auto_cleanup_on_expiry: true,
        ..test_config()
    };
    let (orchestrator, backend) = setup(
        vec![lab("web-basics", "local", 1)],
        BackendKind::Local,
        config,
    )
    .await;

    let instance = orchestrator
        .start("user-1", "web-basics", Some(ChronoDuration::seconds(1)))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(2)).await;

    assert!(matches!(
        orchestrator.inspect(&instance.id, "user-1").await.unwrap_err(),
        OrchestratorError::NotFound(_)
    ));
    assert_eq!(backend.running_count(), 0);
}

#[tokio::test]
async fn test_expiry_timer_never_fires_after_user_stop() {
    let (orchestrator, backend) = setup_local().await;

    let instance = orchestrator
        .start("user-1", "web-basics", Some(ChronoDuration::seconds(1)))
        .await
        .unwrap();

    orchestrator.stop(&instance.id, "user-1").await.unwrap();

    tokio::time::sleep(Duration::from_secs(2)).await;

    // The superseded timer must not have torn anything down: the halted
    // container is untouched and the record stays stopped.
    let current = orchestrator
        .inspect(&instance.id, "user-1")
        .await
        .unwrap();
    assert_eq!(current.status, InstanceStatus::Stopped);
    assert!(backend.deleted_ids().is_empty());
}

#[tokio::test]
async fn test_cleanup_sweep_continues_past_failures() {
    let (orchestrator, backend) = setup_local().await;
    let registry = orchestrator.registry();

    // Seed two overdue running records directly so no timers are armed.
    let caps = AdmissionCaps {
        lab_cap: 10,
        user_cap: 10,
        global_cap: 10,
    };
    let mut seeded = vec![];
    for (user, resource) in [("user-1", "res-a"), ("user-2", "res-b")] {
        let now = Utc::now();
        let record = Instance {
            id: String::new(),
            lab_id: "web-basics".to_string(),
            user_id: user.to_string(),
            backend: BackendKind::Local,
            resource_id: None,
            private_addr: None,
            public_addr: None,
            port_mappings: vec![],
            access_url: None,
            status: InstanceStatus::Starting,
            created_at: now,
            started_at: None,
            stopped_at: None,
            expires_at: now - ChronoDuration::seconds(5),
            restart_count: 0,
            auto_cleanup: false,
            error_message: None,
            provider_metadata: None,
        };
        let record = registry.create_admitted(record, caps).await.unwrap();
        registry
            .record_provisioned(&record.id, resource, None)
            .await
            .unwrap();
        registry
            .transition(
                &record.id,
                &[InstanceStatus::Starting],
                InstanceStatus::Running,
                None,
            )
            .await
            .unwrap();
        seeded.push(record.id);
    }

    backend.fail_delete_of("res-a");

    let reclaimed = orchestrator.cleanup_expired().await;
    assert_eq!(reclaimed, 1);

    let failed = registry.get(&seeded[0]).await.unwrap();
    assert_eq!(failed.status, InstanceStatus::Error);
    assert!(failed.error_message.is_some());

    let expired = registry.get(&seeded[1]).await.unwrap();
    assert_eq!(expired.status, InstanceStatus::Expired);
}

#[tokio::test]
async fn test_ownership_is_enforced() {
    let (orchestrator, _backend) = setup_local().await;

    let instance = orchestrator
        .start("user-1", "web-basics", None)
        .await
        .unwrap();

    assert!(matches!(
        orchestrator.stop(&instance.id, "user-2").await.unwrap_err(),
        OrchestratorError::Unauthorized(_)
    ));
    assert!(matches!(
        orchestrator
            .inspect(&instance.id, "user-2")
            .await
            .unwrap_err(),
        OrchestratorError::Unauthorized(_)
    ));
    assert!(matches!(
        orchestrator
            .reset(&instance.id, "user-2")
            .await
            .unwrap_err(),
        OrchestratorError::Unauthorized(_)
    ));
}

#[tokio::test]
async fn test_start_unknown_lab_is_unavailable() {
    let (orchestrator, _backend) = setup_local().await;

    let err = orchestrator
        .start("user-1", "no-such-lab", None)
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::LabUnavailable(_)));
}

#[tokio::test]
async fn test_reconcile_orphans_removes_only_untracked_resources() {
    let (orchestrator, backend) = setup_local().await;

    let tracked = orchestrator
        .start("user-1", "web-basics", None)
        .await
        .unwrap();
    let tracked_resource = tracked.resource_id.clone().unwrap();

    // A resource the registry knows nothing about (e.g. a crash leftover).
    let orphan = backend
        .create(&ProvisionSpec {
            instance_id: "lab_orphan".to_string(),
            name: "rangelab-lab_orphan".to_string(),
            image: "rangelab/test:1.0".to_string(),
            container_ports: vec![80],
            env_vars: HashMap::new(),
            memory_limit: "256m".to_string(),
            cpu_limit: "0.5".to_string(),
            host_ports: vec![],
        })
        .await
        .unwrap();

    let (found, removed, errors) = orchestrator
        .reconcile_orphans(BackendKind::Local, true)
        .await
        .unwrap();
    assert_eq!((found, removed), (1, 0));
    assert!(errors.is_empty());
    assert!(backend.is_running(&orphan.resource_id));

    let (found, removed, errors) = orchestrator
        .reconcile_orphans(BackendKind::Local, false)
        .await
        .unwrap();
    assert_eq!((found, removed), (1, 1));
    assert!(errors.is_empty());
    assert!(!backend.is_running(&orphan.resource_id));
    assert!(backend.is_running(&tracked_resource));
}

#[tokio::test]
async fn test_remote_stop_discards_vm_and_restart_boots_fresh() {
    let (orchestrator, backend) = setup(
        vec![lab("privesc", "remote", 1)],
        BackendKind::Remote,
        test_config(),
    )
    .await;

    let instance = orchestrator.start("user-1", "privesc", None).await.unwrap();
    let first_vm = instance.resource_id.clone().unwrap();
    assert_eq!(
        instance.access_url.as_deref(),
        Some("http://203.0.113.5:80")
    );

    // Remote halt discards the VM entirely.
    orchestrator.stop(&instance.id, "user-1").await.unwrap();
    assert!(backend.deleted_ids().contains(&first_vm));

    // Restart runs a fresh boot sequence on a new VM, same instance id.
    let restarted = orchestrator
        .restart(&instance.id, "user-1")
        .await
        .unwrap();
    assert_eq!(restarted.id, instance.id);
    assert_eq!(restarted.status, InstanceStatus::Running);
    assert_eq!(restarted.restart_count, 1);
    let second_vm = restarted.resource_id.unwrap();
    assert_ne!(second_vm, first_vm);
    assert!(backend.is_running(&second_vm));
}
