// ABOUTME: Admission controller gating instance creation behind lab, user and system quotas
// ABOUTME: Pure read-and-decide checks; the registry insert is the final gate

use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use rangelab_catalog::LabCatalog;

use crate::registry::{InstanceRegistry, RegistryError};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DenyReason {
    #[error("lab is not available: {0}")]
    LabUnavailable(String),

    #[error("instance cap for lab {lab_id} reached (cap {cap})")]
    LabQuotaExceeded { lab_id: String, cap: i64 },

    #[error("user instance cap reached (cap {cap})")]
    UserQuotaExceeded { cap: i64 },

    #[error("system is at capacity (cap {cap})")]
    SystemAtCapacity { cap: i64 },
}

#[derive(Debug, Clone, PartialEq)]
pub enum AdmissionDecision {
    Allow,
    Deny(DenyReason),
}

/// Evaluates the four admission checks in order, short-circuiting on the
/// first failure. No side effects; capacity is a moving target, so the
/// decision is advisory and must be re-taken at creation time.
pub struct AdmissionController {
    catalog: Arc<LabCatalog>,
    registry: Arc<InstanceRegistry>,
    user_cap: i64,
    global_cap: i64,
}

impl AdmissionController {
    pub fn new(
        catalog: Arc<LabCatalog>,
        registry: Arc<InstanceRegistry>,
        user_cap: i64,
        global_cap: i64,
    ) -> Self {
        Self {
            catalog,
            registry,
            user_cap,
            global_cap,
        }
    }

    pub async fn can_admit(
        &self,
        user_id: &str,
        lab_id: &str,
    ) -> Result<AdmissionDecision, RegistryError> {
        let lab = match self.catalog.get(lab_id) {
            Some(lab) if lab.active => lab,
            Some(_) => {
                return Ok(AdmissionDecision::Deny(DenyReason::LabUnavailable(
                    lab_id.to_string(),
                )))
            }
            None => {
                return Ok(AdmissionDecision::Deny(DenyReason::LabUnavailable(
                    lab_id.to_string(),
                )))
            }
        };

        let lab_count = self
            .registry
            .count_active_for_user_lab(user_id, lab_id)
            .await?;
        if lab_count >= lab.per_user_cap {
            debug!(
                "Denying {} on {}: {} active of cap {}",
                user_id, lab_id, lab_count, lab.per_user_cap
            );
            return Ok(AdmissionDecision::Deny(DenyReason::LabQuotaExceeded {
                lab_id: lab_id.to_string(),
                cap: lab.per_user_cap,
            }));
        }

        let user_count = self.registry.count_active_for_user(user_id).await?;
        if user_count >= self.user_cap {
            return Ok(AdmissionDecision::Deny(DenyReason::UserQuotaExceeded {
                cap: self.user_cap,
            }));
        }

        let total = self.registry.count_active().await?;
        if total >= self.global_cap {
            return Ok(AdmissionDecision::Deny(DenyReason::SystemAtCapacity {
                cap: self.global_cap,
            }));
        }

        Ok(AdmissionDecision::Allow)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::BackendKind;
    use crate::registry::{AdmissionCaps, Instance, InstanceStatus};
    use chrono::{Duration, Utc};
    use rangelab_catalog::{Lab, ResourceLimits};
    use sqlx::SqlitePool;
    use std::collections::HashMap;

    fn lab(id: &str, per_user_cap: i64, active: bool) -> Lab {
        Lab {
            id: id.to_string(),
            name: id.to_string(),
            difficulty: "beginner".to_string(),
            points: 100,
            image: "alpine:latest".to_string(),
            ports: vec![80],
            env_vars: HashMap::new(),
            limits: ResourceLimits {
                memory: "256m".to_string(),
                cpus: "0.5".to_string(),
            },
            session_minutes: 60,
            per_user_cap,
            backend: "local".to_string(),
            active,
        }
    }

    fn pending(user_id: &str, lab_id: &str) -> Instance {
        let now = Utc::now();
        Instance {
            id: String::new(),
            lab_id: lab_id.to_string(),
            user_id: user_id.to_string(),
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
            expires_at: now + Duration::minutes(60),
            restart_count: 0,
            auto_cleanup: false,
            error_message: None,
            provider_metadata: None,
        }
    }

    async fn setup(user_cap: i64, global_cap: i64) -> (AdmissionController, Arc<InstanceRegistry>) {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        let registry = Arc::new(InstanceRegistry::new(pool));

        let catalog = Arc::new(LabCatalog::from_labs(vec![
            lab("web-basics", 1, true),
            lab("forensics", 2, true),
            lab("retired-lab", 1, false),
        ]));

        let controller = AdmissionController::new(
            catalog,
            Arc::clone(&registry),
            user_cap,
            global_cap,
        );
        (controller, registry)
    }

    #[tokio::test]
    async fn test_allows_when_capacity_free() {
        let (controller, _registry) = setup(3, 10).await;
        let decision = controller.can_admit("user-1", "web-basics").await.unwrap();
        assert_eq!(decision, AdmissionDecision::Allow);
    }

    #[tokio::test]
    async fn test_denies_unknown_and_inactive_labs() {
        let (controller, _registry) = setup(3, 10).await;

        assert_eq!(
            controller.can_admit("user-1", "no-such-lab").await.unwrap(),
            AdmissionDecision::Deny(DenyReason::LabUnavailable("no-such-lab".to_string()))
        );
        assert_eq!(
            controller.can_admit("user-1", "retired-lab").await.unwrap(),
            AdmissionDecision::Deny(DenyReason::LabUnavailable("retired-lab".to_string()))
        );
    }

    #[tokio::test]
    async fn test_denies_at_lab_cap() {
        let (controller, registry) = setup(3, 10).await;
        registry
            .create_admitted(
                pending("user-1", "web-basics"),
                AdmissionCaps {
                    lab_cap: 1,
                    user_cap: 3,
                    global_cap: 10,
                },
            )
            .await
            .unwrap();

        let decision = controller.can_admit("user-1", "web-basics").await.unwrap();
        assert_eq!(
            decision,
            AdmissionDecision::Deny(DenyReason::LabQuotaExceeded {
                lab_id: "web-basics".to_string(),
                cap: 1
            })
        );

        // Another user is unaffected.
        assert_eq!(
            controller.can_admit("user-2", "web-basics").await.unwrap(),
            AdmissionDecision::Allow
        );
    }

    #[tokio::test]
    async fn test_denies_at_user_and_system_caps() {
        let (controller, registry) = setup(2, 3).await;
        let caps = AdmissionCaps {
            lab_cap: 10,
            user_cap: 10,
            global_cap: 10,
        };

        registry
            .create_admitted(pending("user-1", "web-basics"), caps)
            .await
            .unwrap();
        registry
            .create_admitted(pending("user-1", "forensics"), caps)
            .await
            .unwrap();

        assert_eq!(
            controller.can_admit("user-1", "forensics").await.unwrap(),
            AdmissionDecision::Deny(DenyReason::UserQuotaExceeded { cap: 2 })
        );

        registry
            .create_admitted(pending("user-2", "forensics"), caps)
            .await
            .unwrap();

        assert_eq!(
            controller.can_admit("user-3", "web-basics").await.unwrap(),
            AdmissionDecision::Deny(DenyReason::SystemAtCapacity { cap: 3 })
        );
    }
}
