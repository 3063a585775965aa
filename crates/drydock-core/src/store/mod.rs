// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for drydock-core.
//!
//! The orchestrator only ever sees the [`Store`] trait. Status transitions go
//! through [`ServiceRowLock`], a handle that wraps a pessimistic row lock:
//! the status read that gates a transition and the status write happen inside
//! the same lock scope, and the lock is released by committing (or by
//! `release`, which rolls back).

pub mod memory;
pub mod postgres;

pub use self::memory::MemoryStore;
pub use self::postgres::PostgresStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::error::CoreError;
use crate::platform::Platform;
use crate::status::ServiceStatus;

/// Service record from the persistence layer.
///
/// `network_name` is joined in from the private network record so the
/// orchestrator does not need a second lookup.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ServiceRecord {
    /// Unique identifier for the service.
    pub service_id: Uuid,
    /// Tenant that owns the service.
    pub tenant_id: String,
    /// Unique service name; container identity is derived from it.
    pub name: String,
    /// Plan providing the resource envelope.
    pub plan_id: Uuid,
    /// Private network the container joins, if any.
    pub network_id: Option<Uuid>,
    /// Name of the private network, if any.
    #[sqlx(default)]
    pub network_name: Option<String>,
    /// Lifecycle status.
    pub status: ServiceStatus,
    /// Currently selected deploy, if any.
    pub selected_deploy: Option<Uuid>,
    /// When the service was created.
    pub created_at: DateTime<Utc>,
    /// When the service record last changed.
    pub updated_at: DateTime<Utc>,
}

/// Deploy record from the persistence layer.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DeployRecord {
    /// Unique identifier for the deploy.
    pub deploy_id: Uuid,
    /// Service this deploy belongs to.
    pub service_id: Uuid,
    /// Unique deploy name.
    pub name: String,
    /// Artifact version; also the image tag.
    pub version: f64,
    /// Filesystem path of the uploaded zip archive.
    pub archive_path: Option<String>,
    /// Free-form JSON configuration (env vars, port override, volumes).
    pub config: Option<serde_json::Value>,
    /// Whether this deploy's container is the one currently running.
    pub running: bool,
    /// When this deploy last started running.
    pub started_at: Option<DateTime<Utc>>,
    /// When the deploy was created.
    pub created_at: DateTime<Utc>,
    /// When the archive file last changed.
    pub file_updated_at: Option<DateTime<Utc>>,
}

impl DeployRecord {
    /// Image tag for this deploy's version.
    ///
    /// Integral versions keep one decimal place (`1` renders as `"1.0"`) so
    /// tags stay stable across re-uploads of the same record.
    pub fn version_tag(&self) -> String {
        version_tag(self.version)
    }

    /// Parse the free-form configuration, tolerating unknown keys and an
    /// absent or non-object payload.
    pub fn parsed_config(&self) -> DeployConfig {
        match &self.config {
            Some(value) => serde_json::from_value(value.clone()).unwrap_or_default(),
            None => DeployConfig::default(),
        }
    }
}

/// Render a deploy version as an image tag.
pub fn version_tag(version: f64) -> String {
    if version.fract() == 0.0 {
        format!("{:.1}", version)
    } else {
        format!("{}", version)
    }
}

/// Parsed deploy configuration.
///
/// Every field is optional; unknown keys are ignored so older records keep
/// deploying after the schema grows.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeployConfig {
    /// Environment variables injected into the container.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Override for the platform's default target port.
    #[serde(default)]
    pub port: Option<u16>,
    /// Named-volume mounts.
    #[serde(default)]
    pub volumes: Vec<VolumeSpec>,
}

/// One named-volume mount from the deploy configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeSpec {
    /// Volume name.
    pub name: String,
    /// Mount point inside the container.
    pub bind: String,
    /// Mount mode, `rw` or `ro`.
    #[serde(default = "default_volume_mode")]
    pub mode: String,
}

fn default_volume_mode() -> String {
    "rw".to_string()
}

impl VolumeSpec {
    /// Bind string in the runtime's `name:path:mode` form.
    pub fn bind_spec(&self) -> String {
        format!("{}:{}:{}", self.name, self.bind, self.mode)
    }
}

/// Resource envelope the orchestrator reads from a plan.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct PlanLimits {
    /// Application platform.
    pub platform: Platform,
    /// CPU quota as a fraction of one vCPU.
    pub max_cpu: f64,
    /// Memory ceiling in megabytes.
    pub max_ram_mb: i64,
    /// Storage ceiling in gigabytes.
    pub max_storage_gb: i64,
}

/// Pessimistic row lock over one service.
///
/// Dropping the handle without calling a consuming method rolls the
/// transaction back (the lock is released, nothing is written).
#[async_trait]
pub trait ServiceRowLock: Send {
    /// The service row as read under the lock.
    fn service(&self) -> &ServiceRecord;

    /// Write a new status and commit.
    async fn set_status(self: Box<Self>, status: ServiceStatus) -> Result<(), CoreError>;

    /// Mark a deployment successful and commit: status `succeeded`, the
    /// deploy becomes the selected one with `running = true` and a fresh
    /// `started_at`, and sibling deploys lose their `running` flag.
    async fn commit_deploy_success(
        self: Box<Self>,
        deploy_id: Uuid,
        started_at: DateTime<Utc>,
    ) -> Result<(), CoreError>;

    /// Release the lock without writing anything.
    async fn release(self: Box<Self>) -> Result<(), CoreError>;
}

/// Persistence abstraction consumed by the orchestrator and the monitor.
#[async_trait]
pub trait Store: Send + Sync {
    /// Fetch a deploy by ID.
    async fn deploy_by_id(&self, deploy_id: Uuid) -> Result<Option<DeployRecord>, CoreError>;

    /// Fetch the service owning a deploy.
    async fn service_for_deploy(&self, deploy_id: Uuid)
    -> Result<Option<ServiceRecord>, CoreError>;

    /// Fetch a service by ID.
    async fn service_by_id(&self, service_id: Uuid) -> Result<Option<ServiceRecord>, CoreError>;

    /// Resource limits of a plan.
    async fn plan_limits(&self, plan_id: Uuid) -> Result<Option<PlanLimits>, CoreError>;

    /// Acquire the exclusive row lock for a service. `Ok(None)` when the
    /// service does not exist.
    async fn lock_service_row(
        &self,
        service_id: Uuid,
    ) -> Result<Option<Box<dyn ServiceRowLock>>, CoreError>;

    /// Services currently in one of the given statuses.
    async fn services_with_status(
        &self,
        statuses: &[ServiceStatus],
    ) -> Result<Vec<ServiceRecord>, CoreError>;
}

#[cfg(test)]
pub(crate) mod test_fixtures {
    use super::*;

    /// Service row with fresh IDs in the given status.
    pub fn sample_service(status: ServiceStatus) -> ServiceRecord {
        let now = Utc::now();
        ServiceRecord {
            service_id: Uuid::new_v4(),
            tenant_id: "tenant-1".to_string(),
            name: "web".to_string(),
            plan_id: Uuid::new_v4(),
            network_id: None,
            network_name: None,
            status,
            selected_deploy: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Deploy row for a service at the given version.
    pub fn sample_deploy(service_id: Uuid, version: f64) -> DeployRecord {
        DeployRecord {
            deploy_id: Uuid::new_v4(),
            service_id,
            name: format!("web-v{version}"),
            version,
            archive_path: Some("/tmp/archive.zip".to_string()),
            config: None,
            running: false,
            started_at: None,
            created_at: Utc::now(),
            file_updated_at: None,
        }
    }
}
