// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL-backed store for drydock-core.
//!
//! Row locks are plain `SELECT ... FOR UPDATE` held by an open transaction
//! wrapped in [`PostgresServiceLock`]; committing the transaction releases
//! the lock together with the status write.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use super::{DeployRecord, PlanLimits, ServiceRecord, ServiceRowLock, Store};
use crate::error::CoreError;
use crate::status::ServiceStatus;

/// PostgreSQL-backed store implementation.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Create a new Postgres-backed store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying pool, for callers that share it with the task queue.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

const SERVICE_COLUMNS: &str = r#"
    s.service_id, s.tenant_id, s.name, s.plan_id, s.network_id,
    n.name AS network_name, s.status, s.selected_deploy,
    s.created_at, s.updated_at
"#;

// ============================================================================
// Deploy Operations
// ============================================================================

/// Get a deploy by ID.
pub async fn get_deploy(
    pool: &PgPool,
    deploy_id: Uuid,
) -> Result<Option<DeployRecord>, CoreError> {
    let record = sqlx::query_as::<_, DeployRecord>(
        r#"
        SELECT deploy_id, service_id, name, version, archive_path, config,
               running, started_at, created_at, file_updated_at
        FROM deploys
        WHERE deploy_id = $1
        "#,
    )
    .bind(deploy_id)
    .fetch_optional(pool)
    .await?;

    Ok(record)
}

// ============================================================================
// Service Operations
// ============================================================================

/// Get a service by ID, with its network name joined in.
pub async fn get_service(
    pool: &PgPool,
    service_id: Uuid,
) -> Result<Option<ServiceRecord>, CoreError> {
    let record = sqlx::query_as::<_, ServiceRecord>(&format!(
        r#"
        SELECT {SERVICE_COLUMNS}
        FROM services s
        LEFT JOIN private_networks n ON n.network_id = s.network_id
        WHERE s.service_id = $1
        "#
    ))
    .bind(service_id)
    .fetch_optional(pool)
    .await?;

    Ok(record)
}

/// Get the service owning a deploy.
pub async fn get_service_for_deploy(
    pool: &PgPool,
    deploy_id: Uuid,
) -> Result<Option<ServiceRecord>, CoreError> {
    let record = sqlx::query_as::<_, ServiceRecord>(&format!(
        r#"
        SELECT {SERVICE_COLUMNS}
        FROM services s
        JOIN deploys d ON d.service_id = s.service_id
        LEFT JOIN private_networks n ON n.network_id = s.network_id
        WHERE d.deploy_id = $1
        "#
    ))
    .bind(deploy_id)
    .fetch_optional(pool)
    .await?;

    Ok(record)
}

/// List services in any of the given statuses.
pub async fn list_services_with_status(
    pool: &PgPool,
    statuses: &[ServiceStatus],
) -> Result<Vec<ServiceRecord>, CoreError> {
    let names: Vec<String> = statuses.iter().map(|s| s.as_str().to_string()).collect();
    let records = sqlx::query_as::<_, ServiceRecord>(&format!(
        r#"
        SELECT {SERVICE_COLUMNS}
        FROM services s
        LEFT JOIN private_networks n ON n.network_id = s.network_id
        WHERE s.status = ANY($1)
        ORDER BY s.created_at
        "#
    ))
    .bind(&names)
    .fetch_all(pool)
    .await?;

    Ok(records)
}

// ============================================================================
// Plan Operations
// ============================================================================

/// Get the resource limits of a plan.
pub async fn get_plan_limits(
    pool: &PgPool,
    plan_id: Uuid,
) -> Result<Option<PlanLimits>, CoreError> {
    let record = sqlx::query_as::<_, PlanLimits>(
        r#"
        SELECT platform, max_cpu, max_ram_mb, max_storage_gb
        FROM plans
        WHERE plan_id = $1
        "#,
    )
    .bind(plan_id)
    .fetch_optional(pool)
    .await?;

    Ok(record)
}

// ============================================================================
// Row Lock
// ============================================================================

/// Row lock handle holding an open transaction.
pub struct PostgresServiceLock {
    tx: Transaction<'static, Postgres>,
    service: ServiceRecord,
}

impl PostgresServiceLock {
    /// Lock the service row, returning `None` when the row does not exist.
    pub async fn acquire(pool: &PgPool, service_id: Uuid) -> Result<Option<Self>, CoreError> {
        let mut tx = pool.begin().await?;

        // FOR UPDATE cannot be combined with the LEFT JOIN on the nullable
        // network side, so lock first and join afterwards inside the same
        // transaction.
        let locked: Option<(Uuid,)> =
            sqlx::query_as(r#"SELECT service_id FROM services WHERE service_id = $1 FOR UPDATE"#)
                .bind(service_id)
                .fetch_optional(&mut *tx)
                .await?;
        if locked.is_none() {
            tx.rollback().await?;
            return Ok(None);
        }

        let service = sqlx::query_as::<_, ServiceRecord>(&format!(
            r#"
            SELECT {SERVICE_COLUMNS}
            FROM services s
            LEFT JOIN private_networks n ON n.network_id = s.network_id
            WHERE s.service_id = $1
            "#
        ))
        .bind(service_id)
        .fetch_one(&mut *tx)
        .await?;

        Ok(Some(Self { tx, service }))
    }
}

#[async_trait]
impl ServiceRowLock for PostgresServiceLock {
    fn service(&self) -> &ServiceRecord {
        &self.service
    }

    async fn set_status(mut self: Box<Self>, status: ServiceStatus) -> Result<(), CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE services
            SET status = $2, updated_at = NOW()
            WHERE service_id = $1
            "#,
        )
        .bind(self.service.service_id)
        .bind(status)
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound {
                entity: "service",
                id: self.service.service_id.to_string(),
            });
        }

        self.tx.commit().await?;
        Ok(())
    }

    async fn commit_deploy_success(
        mut self: Box<Self>,
        deploy_id: Uuid,
        started_at: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            UPDATE services
            SET status = 'succeeded', selected_deploy = $2, updated_at = NOW()
            WHERE service_id = $1
            "#,
        )
        .bind(self.service.service_id)
        .bind(deploy_id)
        .execute(&mut *self.tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE deploys
            SET running = FALSE
            WHERE service_id = $1 AND deploy_id <> $2 AND running
            "#,
        )
        .bind(self.service.service_id)
        .bind(deploy_id)
        .execute(&mut *self.tx)
        .await?;

        let result = sqlx::query(
            r#"
            UPDATE deploys
            SET running = TRUE, started_at = $2
            WHERE deploy_id = $1
            "#,
        )
        .bind(deploy_id)
        .bind(started_at)
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound {
                entity: "deploy",
                id: deploy_id.to_string(),
            });
        }

        self.tx.commit().await?;
        Ok(())
    }

    async fn release(self: Box<Self>) -> Result<(), CoreError> {
        self.tx.rollback().await?;
        Ok(())
    }
}

// ============================================================================
// Store Trait
// ============================================================================

#[async_trait]
impl Store for PostgresStore {
    async fn deploy_by_id(&self, deploy_id: Uuid) -> Result<Option<DeployRecord>, CoreError> {
        get_deploy(&self.pool, deploy_id).await
    }

    async fn service_for_deploy(
        &self,
        deploy_id: Uuid,
    ) -> Result<Option<ServiceRecord>, CoreError> {
        get_service_for_deploy(&self.pool, deploy_id).await
    }

    async fn service_by_id(&self, service_id: Uuid) -> Result<Option<ServiceRecord>, CoreError> {
        get_service(&self.pool, service_id).await
    }

    async fn plan_limits(&self, plan_id: Uuid) -> Result<Option<PlanLimits>, CoreError> {
        get_plan_limits(&self.pool, plan_id).await
    }

    async fn lock_service_row(
        &self,
        service_id: Uuid,
    ) -> Result<Option<Box<dyn ServiceRowLock>>, CoreError> {
        let lock = PostgresServiceLock::acquire(&self.pool, service_id).await?;
        Ok(lock.map(|l| Box::new(l) as Box<dyn ServiceRowLock>))
    }

    async fn services_with_status(
        &self,
        statuses: &[ServiceStatus],
    ) -> Result<Vec<ServiceRecord>, CoreError> {
        list_services_with_status(&self.pool, statuses).await
    }
}
