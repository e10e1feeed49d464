// ABOUTME: Instance registry for lab sandboxes backed by SQLite
// ABOUTME: Single source of truth for lifecycle state with CAS transitions and quota-gated inserts

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tracing::debug;

use crate::backends::{BackendKind, PortMapping};

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Instance not found: {0}")]
    NotFound(String),
    #[error("Invalid status: {0}")]
    InvalidStatus(String),
    #[error("Duplicate external port in mapping: {0}")]
    DuplicatePort(u16),
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{scope} instance quota reached (cap {cap})")]
    QuotaExceeded { scope: QuotaScope, cap: i64 },
}

pub type Result<T> = std::result::Result<T, RegistryError>;

/// Which admission scope rejected an insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaScope {
    Lab,
    User,
    System,
}

impl std::fmt::Display for QuotaScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Lab => write!(f, "per-lab"),
            Self::User => write!(f, "per-user"),
            Self::System => write!(f, "system"),
        }
    }
}

/// Caps re-validated atomically with record creation. Admission checks
/// are advisory; the insert transaction is the final gate.
#[derive(Debug, Clone, Copy)]
pub struct AdmissionCaps {
    pub lab_cap: i64,
    pub user_cap: i64,
    pub global_cap: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
    Expired,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Error => "error",
            Self::Expired => "expired",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "starting" => Ok(Self::Starting),
            "running" => Ok(Self::Running),
            "stopping" => Ok(Self::Stopping),
            "stopped" => Ok(Self::Stopped),
            "error" => Ok(Self::Error),
            "expired" => Ok(Self::Expired),
            _ => Err(RegistryError::InvalidStatus(s.to_string())),
        }
    }

    /// Terminal states persist for audit until restarted or reset.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Error | Self::Expired)
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// States that count against admission quotas.
pub const NON_TERMINAL: [InstanceStatus; 3] = [
    InstanceStatus::Starting,
    InstanceStatus::Running,
    InstanceStatus::Stopping,
];

const NON_TERMINAL_SQL: &str = "('starting', 'running', 'stopping')";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub lab_id: String,
    pub user_id: String,
    pub backend: BackendKind,

    // Provider linkage
    pub resource_id: Option<String>,
    pub private_addr: Option<String>,
    pub public_addr: Option<String>,
    pub port_mappings: Vec<PortMapping>,
    pub access_url: Option<String>,

    // Lifecycle
    pub status: InstanceStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    pub restart_count: i64,
    pub auto_cleanup: bool,
    pub error_message: Option<String>,

    // Informational only, never a control input
    pub provider_metadata: Option<JsonValue>,
}

impl Instance {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

pub struct InstanceRegistry {
    pool: SqlitePool,
}

impl InstanceRegistry {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a new instance record, re-validating the per-lab, per-user
    /// and global counts in the same transaction as the insert.
    pub async fn create_admitted(
        &self,
        mut instance: Instance,
        caps: AdmissionCaps,
    ) -> Result<Instance> {
        if instance.id.is_empty() {
            instance.id = format!("lab_{}", uuid::Uuid::new_v4().to_string().replace('-', ""));
        }

        let mut tx = self.pool.begin().await?;

        let lab_count: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM lab_instances
             WHERE user_id = ?1 AND lab_id = ?2 AND status IN {}",
            NON_TERMINAL_SQL
        ))
        .bind(&instance.user_id)
        .bind(&instance.lab_id)
        .fetch_one(&mut *tx)
        .await?;

        if lab_count >= caps.lab_cap {
            return Err(RegistryError::QuotaExceeded {
                scope: QuotaScope::Lab,
                cap: caps.lab_cap,
            });
        }

        let user_count: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM lab_instances WHERE user_id = ?1 AND status IN {}",
            NON_TERMINAL_SQL
        ))
        .bind(&instance.user_id)
        .fetch_one(&mut *tx)
        .await?;

        if user_count >= caps.user_cap {
            return Err(RegistryError::QuotaExceeded {
                scope: QuotaScope::User,
                cap: caps.user_cap,
            });
        }

        let total_count: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM lab_instances WHERE status IN {}",
            NON_TERMINAL_SQL
        ))
        .fetch_one(&mut *tx)
        .await?;

        if total_count >= caps.global_cap {
            return Err(RegistryError::QuotaExceeded {
                scope: QuotaScope::System,
                cap: caps.global_cap,
            });
        }

        let mappings_json = serde_json::to_string(&instance.port_mappings)?;
        let metadata_json = instance
            .provider_metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        sqlx::query(
            r#"
            INSERT INTO lab_instances (
                id, lab_id, user_id, backend,
                resource_id, private_addr, public_addr, port_mappings, access_url,
                status, created_at, started_at, stopped_at, expires_at,
                restart_count, auto_cleanup, error_message, provider_metadata
            ) VALUES (
                ?1, ?2, ?3, ?4,
                ?5, ?6, ?7, ?8, ?9,
                ?10, ?11, ?12, ?13, ?14,
                ?15, ?16, ?17, ?18
            )
            "#,
        )
        .bind(&instance.id)
        .bind(&instance.lab_id)
        .bind(&instance.user_id)
        .bind(instance.backend.as_str())
        .bind(&instance.resource_id)
        .bind(&instance.private_addr)
        .bind(&instance.public_addr)
        .bind(&mappings_json)
        .bind(&instance.access_url)
        .bind(instance.status.as_str())
        .bind(instance.created_at.to_rfc3339())
        .bind(instance.started_at.map(|d| d.to_rfc3339()))
        .bind(instance.stopped_at.map(|d| d.to_rfc3339()))
        .bind(instance.expires_at.to_rfc3339())
        .bind(instance.restart_count)
        .bind(instance.auto_cleanup)
        .bind(&instance.error_message)
        .bind(metadata_json.as_deref())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        debug!(
            "Registered instance {} for user {} lab {}",
            instance.id, instance.user_id, instance.lab_id
        );

        Ok(instance)
    }

    pub async fn get(&self, id: &str) -> Result<Instance> {
        let row = sqlx::query("SELECT * FROM lab_instances WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => self.row_to_instance(row),
            None => Err(RegistryError::NotFound(id.to_string())),
        }
    }

    pub async fn list_for_user(&self, user_id: &str) -> Result<Vec<Instance>> {
        let rows = sqlx::query(
            "SELECT * FROM lab_instances WHERE user_id = ?1 ORDER BY created_at DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| self.row_to_instance(r)).collect()
    }

    pub async fn list_with_status(&self, status: InstanceStatus) -> Result<Vec<Instance>> {
        let rows = sqlx::query(
            "SELECT * FROM lab_instances WHERE status = ?1 ORDER BY created_at DESC",
        )
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| self.row_to_instance(r)).collect()
    }

    /// Instances still marked running whose expiry is in the past.
    /// Consumed by the periodic reclamation sweep.
    pub async fn list_expired_running(&self, now: DateTime<Utc>) -> Result<Vec<Instance>> {
        let rows = sqlx::query(
            "SELECT * FROM lab_instances
             WHERE status = 'running' AND expires_at <= ?1
             ORDER BY expires_at ASC",
        )
        .bind(now.to_rfc3339())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| self.row_to_instance(r)).collect()
    }

    pub async fn count_active_for_user_lab(&self, user_id: &str, lab_id: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM lab_instances
             WHERE user_id = ?1 AND lab_id = ?2 AND status IN {}",
            NON_TERMINAL_SQL
        ))
        .bind(user_id)
        .bind(lab_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    pub async fn count_active_for_user(&self, user_id: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM lab_instances WHERE user_id = ?1 AND status IN {}",
            NON_TERMINAL_SQL
        ))
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    pub async fn count_active(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM lab_instances WHERE status IN {}",
            NON_TERMINAL_SQL
        ))
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Compare-and-swap status transition. The update only applies while
    /// the current status is one of `from`; returns whether it did. Racing
    /// writers (user stop vs expiry timer) are resolved by whichever CAS
    /// lands first; the loser observes `false` and must re-read.
    pub async fn transition(
        &self,
        id: &str,
        from: &[InstanceStatus],
        to: InstanceStatus,
        error: Option<String>,
    ) -> Result<bool> {
        let now = Utc::now();

        let mut query = String::from("UPDATE lab_instances SET status = ?1");
        let mut bind_index = 2;

        // Entering `starting` clears any previous failure; an explicit
        // error message otherwise replaces it.
        let clears_error = to == InstanceStatus::Starting && error.is_none();
        if clears_error {
            query.push_str(", error_message = NULL");
        } else if error.is_some() {
            query.push_str(&format!(", error_message = ?{}", bind_index));
            bind_index += 1;
        }

        let stamps_started = to == InstanceStatus::Running;
        let stamps_stopped = matches!(
            to,
            InstanceStatus::Stopped | InstanceStatus::Expired | InstanceStatus::Error
        );
        if stamps_started {
            query.push_str(&format!(", started_at = ?{}", bind_index));
            bind_index += 1;
        } else if stamps_stopped {
            query.push_str(&format!(", stopped_at = ?{}", bind_index));
            bind_index += 1;
        }

        let placeholders: Vec<String> = (0..from.len())
            .map(|i| format!("?{}", bind_index + 1 + i))
            .collect();
        query.push_str(&format!(
            " WHERE id = ?{} AND status IN ({})",
            bind_index,
            placeholders.join(", ")
        ));

        let mut q = sqlx::query(&query).bind(to.as_str());
        if let Some(err) = &error {
            if !clears_error {
                q = q.bind(err);
            }
        }
        if stamps_started || stamps_stopped {
            q = q.bind(now.to_rfc3339());
        }
        q = q.bind(id);
        for status in from {
            q = q.bind(status.as_str());
        }

        let result = q.execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }

    /// Record the provider resource after a successful create call.
    pub async fn record_provisioned(
        &self,
        id: &str,
        resource_id: &str,
        metadata: Option<&JsonValue>,
    ) -> Result<()> {
        let metadata_json = metadata.map(serde_json::to_string).transpose()?;
        let result = sqlx::query(
            "UPDATE lab_instances SET resource_id = ?1, provider_metadata = ?2 WHERE id = ?3",
        )
        .bind(resource_id)
        .bind(metadata_json.as_deref())
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RegistryError::NotFound(id.to_string()));
        }
        Ok(())
    }

    /// Record addresses, port mappings and the derived access URL once
    /// readiness has been confirmed.
    pub async fn record_endpoints(
        &self,
        id: &str,
        private_addr: Option<&str>,
        public_addr: Option<&str>,
        port_mappings: &[PortMapping],
        access_url: Option<&str>,
    ) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for mapping in port_mappings {
            if !seen.insert(mapping.host_port) {
                return Err(RegistryError::DuplicatePort(mapping.host_port));
            }
        }

        let mappings_json = serde_json::to_string(port_mappings)?;
        let result = sqlx::query(
            "UPDATE lab_instances
             SET private_addr = ?1, public_addr = ?2, port_mappings = ?3, access_url = ?4
             WHERE id = ?5",
        )
        .bind(private_addr)
        .bind(public_addr)
        .bind(&mappings_json)
        .bind(access_url)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RegistryError::NotFound(id.to_string()));
        }
        Ok(())
    }

    /// Push expiry forward and count the restart. Expiry only ever moves
    /// forward, and only through this call.
    pub async fn bump_restart(&self, id: &str, new_expires_at: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query(
            "UPDATE lab_instances
             SET restart_count = restart_count + 1,
                 expires_at = MAX(expires_at, ?1),
                 stopped_at = NULL
             WHERE id = ?2",
        )
        .bind(new_expires_at.to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RegistryError::NotFound(id.to_string()));
        }
        Ok(())
    }

    /// Whether any record references the given provider resource.
    /// Consumed by the orphan reconciliation sweep.
    pub async fn resource_exists(&self, resource_id: &str) -> Result<bool> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM lab_instances WHERE resource_id = ?1")
                .bind(resource_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count > 0)
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM lab_instances WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(RegistryError::NotFound(id.to_string()));
        }
        Ok(())
    }

    fn row_to_instance(&self, row: sqlx::sqlite::SqliteRow) -> Result<Instance> {
        let backend = BackendKind::from_str(&row.get::<String, _>("backend"))
            .map_err(|e| RegistryError::InvalidStatus(e.to_string()))?;

        let port_mappings: Vec<PortMapping> =
            serde_json::from_str(&row.get::<String, _>("port_mappings"))?;

        Ok(Instance {
            id: row.get("id"),
            lab_id: row.get("lab_id"),
            user_id: row.get("user_id"),
            backend,
            resource_id: row.get("resource_id"),
            private_addr: row.get("private_addr"),
            public_addr: row.get("public_addr"),
            port_mappings,
            access_url: row.get("access_url"),
            status: InstanceStatus::from_str(&row.get::<String, _>("status"))?,
            created_at: parse_timestamp(&row.get::<String, _>("created_at"))?,
            started_at: parse_optional_timestamp(row.get::<Option<String>, _>("started_at")),
            stopped_at: parse_optional_timestamp(row.get::<Option<String>, _>("stopped_at")),
            expires_at: parse_timestamp(&row.get::<String, _>("expires_at"))?,
            restart_count: row.get("restart_count"),
            auto_cleanup: row.get("auto_cleanup"),
            error_message: row.get("error_message"),
            provider_metadata: row
                .get::<Option<String>, _>("provider_metadata")
                .and_then(|s| serde_json::from_str(&s).ok()),
        })
    }
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RegistryError::InvalidStatus(format!("bad timestamp {}: {}", s, e)))
}

fn parse_optional_timestamp(s: Option<String>) -> Option<DateTime<Utc>> {
    s.and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}
