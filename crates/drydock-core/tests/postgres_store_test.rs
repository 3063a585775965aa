// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Database operations tests for drydock-core.
//!
//! These tests verify the Postgres store, the row-lock transitions, and the
//! task queue against a real database.

use std::time::Duration;

use drydock_core::queue::{self, TaskKind};
use drydock_core::status::ServiceStatus;
use drydock_core::store::{PostgresStore, Store};
use sqlx::PgPool;
use uuid::Uuid;

/// Skip test if database URL is not set
macro_rules! skip_if_no_db {
    () => {
        if std::env::var("TEST_DRYDOCK_DATABASE_URL").is_err()
            && std::env::var("DRYDOCK_DATABASE_URL").is_err()
        {
            eprintln!("Skipping test: TEST_DRYDOCK_DATABASE_URL or DRYDOCK_DATABASE_URL not set");
            return;
        }
    };
}

async fn get_pool() -> Option<PgPool> {
    let database_url = std::env::var("TEST_DRYDOCK_DATABASE_URL")
        .or_else(|_| std::env::var("DRYDOCK_DATABASE_URL"))
        .ok()?;
    let pool = PgPool::connect(&database_url).await.ok()?;
    drydock_core::migrations::run(&pool).await.ok()?;
    Some(pool)
}

async fn create_test_plan(pool: &PgPool) -> Uuid {
    let plan_id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO plans (plan_id, name, platform, max_cpu, max_ram_mb, max_storage_gb)
        VALUES ($1, $2, 'django', 0.5, 512, 10)
        "#,
    )
    .bind(plan_id)
    .bind(format!("plan-{plan_id}"))
    .execute(pool)
    .await
    .expect("Failed to create test plan");
    plan_id
}

async fn create_test_network(pool: &PgPool, tenant_id: &str) -> (Uuid, String) {
    let network_id = Uuid::new_v4();
    let name = format!("net-{network_id}");
    sqlx::query(
        r#"
        INSERT INTO private_networks (network_id, tenant_id, name)
        VALUES ($1, $2, $3)
        "#,
    )
    .bind(network_id)
    .bind(tenant_id)
    .bind(&name)
    .execute(pool)
    .await
    .expect("Failed to create test network");
    (network_id, name)
}

async fn create_test_service(
    pool: &PgPool,
    plan_id: Uuid,
    network_id: Option<Uuid>,
    status: &str,
) -> Uuid {
    let service_id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO services (service_id, tenant_id, name, plan_id, network_id, status)
        VALUES ($1, 'test-tenant', $2, $3, $4, $5)
        "#,
    )
    .bind(service_id)
    .bind(format!("svc-{service_id}"))
    .bind(plan_id)
    .bind(network_id)
    .bind(status)
    .execute(pool)
    .await
    .expect("Failed to create test service");
    service_id
}

async fn create_test_deploy(pool: &PgPool, service_id: Uuid, version: f64, running: bool) -> Uuid {
    let deploy_id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO deploys (deploy_id, service_id, name, version, archive_path, running)
        VALUES ($1, $2, $3, $4, '/tmp/archive.zip', $5)
        "#,
    )
    .bind(deploy_id)
    .bind(service_id)
    .bind(format!("deploy-{deploy_id}"))
    .bind(version)
    .bind(running)
    .execute(pool)
    .await
    .expect("Failed to create test deploy");
    deploy_id
}

async fn cleanup_service(pool: &PgPool, service_id: Uuid) {
    // Deploys cascade with the service row.
    sqlx::query("DELETE FROM services WHERE service_id = $1")
        .bind(service_id)
        .execute(pool)
        .await
        .ok();
}

async fn cleanup_plan(pool: &PgPool, plan_id: Uuid) {
    sqlx::query("DELETE FROM plans WHERE plan_id = $1")
        .bind(plan_id)
        .execute(pool)
        .await
        .ok();
}

async fn cleanup_network(pool: &PgPool, network_id: Uuid) {
    sqlx::query("DELETE FROM private_networks WHERE network_id = $1")
        .bind(network_id)
        .execute(pool)
        .await
        .ok();
}

// ============================================================================
// Store Tests
// ============================================================================

#[tokio::test]
async fn test_service_lookup_joins_network_name() {
    skip_if_no_db!();
    let pool = get_pool().await.expect("Failed to connect to database");
    let store = PostgresStore::new(pool.clone());

    let plan_id = create_test_plan(&pool).await;
    let (network_id, network_name) = create_test_network(&pool, "test-tenant").await;
    let service_id = create_test_service(&pool, plan_id, Some(network_id), "created").await;

    let service = store
        .service_by_id(service_id)
        .await
        .expect("Failed to fetch service")
        .expect("Service not found");
    assert_eq!(service.service_id, service_id);
    assert_eq!(service.tenant_id, "test-tenant");
    assert_eq!(service.status, ServiceStatus::Created);
    assert_eq!(service.network_id, Some(network_id));
    assert_eq!(service.network_name, Some(network_name));

    cleanup_service(&pool, service_id).await;
    cleanup_network(&pool, network_id).await;
    cleanup_plan(&pool, plan_id).await;
}

#[tokio::test]
async fn test_service_lookup_without_network() {
    skip_if_no_db!();
    let pool = get_pool().await.expect("Failed to connect to database");
    let store = PostgresStore::new(pool.clone());

    let plan_id = create_test_plan(&pool).await;
    let service_id = create_test_service(&pool, plan_id, None, "created").await;

    let service = store
        .service_by_id(service_id)
        .await
        .expect("Failed to fetch service")
        .expect("Service not found");
    assert_eq!(service.network_id, None);
    assert_eq!(service.network_name, None);

    cleanup_service(&pool, service_id).await;
    cleanup_plan(&pool, plan_id).await;
}

#[tokio::test]
async fn test_service_for_deploy() {
    skip_if_no_db!();
    let pool = get_pool().await.expect("Failed to connect to database");
    let store = PostgresStore::new(pool.clone());

    let plan_id = create_test_plan(&pool).await;
    let service_id = create_test_service(&pool, plan_id, None, "queued").await;
    let deploy_id = create_test_deploy(&pool, service_id, 1.0, false).await;

    let service = store
        .service_for_deploy(deploy_id)
        .await
        .expect("Failed to fetch service")
        .expect("Service not found");
    assert_eq!(service.service_id, service_id);

    let deploy = store
        .deploy_by_id(deploy_id)
        .await
        .expect("Failed to fetch deploy")
        .expect("Deploy not found");
    assert_eq!(deploy.service_id, service_id);
    assert_eq!(deploy.version_tag(), "1.0");

    assert!(store
        .service_for_deploy(Uuid::new_v4())
        .await
        .expect("Failed to query missing deploy")
        .is_none());

    cleanup_service(&pool, service_id).await;
    cleanup_plan(&pool, plan_id).await;
}

#[tokio::test]
async fn test_plan_limits() {
    skip_if_no_db!();
    let pool = get_pool().await.expect("Failed to connect to database");
    let store = PostgresStore::new(pool.clone());

    let plan_id = create_test_plan(&pool).await;
    let limits = store
        .plan_limits(plan_id)
        .await
        .expect("Failed to fetch plan")
        .expect("Plan not found");
    assert_eq!(limits.platform, drydock_core::platform::Platform::Django);
    assert_eq!(limits.max_cpu, 0.5);
    assert_eq!(limits.max_ram_mb, 512);

    cleanup_plan(&pool, plan_id).await;
}

#[tokio::test]
async fn test_services_with_status_filter() {
    skip_if_no_db!();
    let pool = get_pool().await.expect("Failed to connect to database");
    let store = PostgresStore::new(pool.clone());

    let plan_id = create_test_plan(&pool).await;
    let succeeded_id = create_test_service(&pool, plan_id, None, "succeeded").await;
    let stopped_id = create_test_service(&pool, plan_id, None, "stopped").await;
    let created_id = create_test_service(&pool, plan_id, None, "created").await;

    let services = store
        .services_with_status(&[ServiceStatus::Succeeded, ServiceStatus::Stopped])
        .await
        .expect("Failed to list services");
    let ids: Vec<Uuid> = services.iter().map(|s| s.service_id).collect();
    assert!(ids.contains(&succeeded_id));
    assert!(ids.contains(&stopped_id));
    assert!(!ids.contains(&created_id));

    cleanup_service(&pool, succeeded_id).await;
    cleanup_service(&pool, stopped_id).await;
    cleanup_service(&pool, created_id).await;
    cleanup_plan(&pool, plan_id).await;
}

// ============================================================================
// Row Lock Tests
// ============================================================================

#[tokio::test]
async fn test_lock_set_status() {
    skip_if_no_db!();
    let pool = get_pool().await.expect("Failed to connect to database");
    let store = PostgresStore::new(pool.clone());

    let plan_id = create_test_plan(&pool).await;
    let service_id = create_test_service(&pool, plan_id, None, "created").await;

    let lock = store
        .lock_service_row(service_id)
        .await
        .expect("Failed to lock service")
        .expect("Service not found");
    assert_eq!(lock.service().status, ServiceStatus::Created);
    lock.set_status(ServiceStatus::Queued)
        .await
        .expect("Failed to set status");

    let service = store
        .service_by_id(service_id)
        .await
        .expect("Failed to fetch service")
        .expect("Service not found");
    assert_eq!(service.status, ServiceStatus::Queued);

    cleanup_service(&pool, service_id).await;
    cleanup_plan(&pool, plan_id).await;
}

#[tokio::test]
async fn test_lock_release_writes_nothing() {
    skip_if_no_db!();
    let pool = get_pool().await.expect("Failed to connect to database");
    let store = PostgresStore::new(pool.clone());

    let plan_id = create_test_plan(&pool).await;
    let service_id = create_test_service(&pool, plan_id, None, "queued").await;

    let lock = store
        .lock_service_row(service_id)
        .await
        .expect("Failed to lock service")
        .expect("Service not found");
    lock.release().await.expect("Failed to release lock");

    let service = store
        .service_by_id(service_id)
        .await
        .expect("Failed to fetch service")
        .expect("Service not found");
    assert_eq!(service.status, ServiceStatus::Queued);

    cleanup_service(&pool, service_id).await;
    cleanup_plan(&pool, plan_id).await;
}

#[tokio::test]
async fn test_lock_missing_service() {
    skip_if_no_db!();
    let pool = get_pool().await.expect("Failed to connect to database");
    let store = PostgresStore::new(pool.clone());

    let lock = store
        .lock_service_row(Uuid::new_v4())
        .await
        .expect("Failed to query lock");
    assert!(lock.is_none());
}

#[tokio::test]
async fn test_commit_deploy_success_selects_deploy() {
    skip_if_no_db!();
    let pool = get_pool().await.expect("Failed to connect to database");
    let store = PostgresStore::new(pool.clone());

    let plan_id = create_test_plan(&pool).await;
    let service_id = create_test_service(&pool, plan_id, None, "deploying").await;
    let old_deploy = create_test_deploy(&pool, service_id, 1.0, true).await;
    let new_deploy = create_test_deploy(&pool, service_id, 2.0, false).await;

    let started_at = chrono::Utc::now();
    let lock = store
        .lock_service_row(service_id)
        .await
        .expect("Failed to lock service")
        .expect("Service not found");
    lock.commit_deploy_success(new_deploy, started_at)
        .await
        .expect("Failed to commit deploy success");

    let service = store
        .service_by_id(service_id)
        .await
        .expect("Failed to fetch service")
        .expect("Service not found");
    assert_eq!(service.status, ServiceStatus::Succeeded);
    assert_eq!(service.selected_deploy, Some(new_deploy));

    let old = store
        .deploy_by_id(old_deploy)
        .await
        .expect("Failed to fetch deploy")
        .expect("Deploy not found");
    assert!(!old.running);

    let new = store
        .deploy_by_id(new_deploy)
        .await
        .expect("Failed to fetch deploy")
        .expect("Deploy not found");
    assert!(new.running);
    assert!(new.started_at.is_some());

    cleanup_service(&pool, service_id).await;
    cleanup_plan(&pool, plan_id).await;
}

// ============================================================================
// Task Queue Tests
// ============================================================================

// Queue tests share the tasks table, so they run one at a time.
static QUEUE_TEST_LOCK: tokio::sync::Mutex<()> = tokio::sync::Mutex::const_new(());

#[tokio::test]
async fn test_queue_claim_and_complete() {
    skip_if_no_db!();
    let _serial = QUEUE_TEST_LOCK.lock().await;
    let pool = get_pool().await.expect("Failed to connect to database");
    sqlx::query("DELETE FROM tasks").execute(&pool).await.ok();

    let deploy_id = Uuid::new_v4();
    let task_id = queue::enqueue_task(&pool, TaskKind::Deploy { deploy_id })
        .await
        .expect("Failed to enqueue");

    let task = queue::claim_task(&pool, Duration::from_secs(900))
        .await
        .expect("Failed to claim")
        .expect("Expected a claimable task");
    assert_eq!(task.task_id, task_id);
    assert_eq!(task.kind, TaskKind::Deploy { deploy_id });
    assert_eq!(task.attempts, 1);

    // Claimed within the visibility window, so nothing else is claimable.
    assert!(queue::claim_task(&pool, Duration::from_secs(900))
        .await
        .expect("Failed to claim")
        .is_none());

    queue::complete_task(&pool, task_id)
        .await
        .expect("Failed to complete");
    let (status,): (String,) = sqlx::query_as("SELECT status FROM tasks WHERE task_id = $1")
        .bind(task_id)
        .fetch_one(&pool)
        .await
        .expect("Failed to fetch task");
    assert_eq!(status, "succeeded");

    sqlx::query("DELETE FROM tasks").execute(&pool).await.ok();
}

#[tokio::test]
async fn test_queue_redelivers_after_visibility_timeout() {
    skip_if_no_db!();
    let _serial = QUEUE_TEST_LOCK.lock().await;
    let pool = get_pool().await.expect("Failed to connect to database");
    sqlx::query("DELETE FROM tasks").execute(&pool).await.ok();

    let service_id = Uuid::new_v4();
    let task_id = queue::enqueue_task(&pool, TaskKind::Stop { service_id })
        .await
        .expect("Failed to enqueue");

    let first = queue::claim_task(&pool, Duration::from_secs(900))
        .await
        .expect("Failed to claim")
        .expect("Expected a claimable task");
    assert_eq!(first.attempts, 1);

    // The claim is now older than a zero visibility window.
    tokio::time::sleep(Duration::from_millis(20)).await;
    let second = queue::claim_task(&pool, Duration::ZERO)
        .await
        .expect("Failed to claim")
        .expect("Expected stale claim to be redelivered");
    assert_eq!(second.task_id, task_id);
    assert_eq!(second.attempts, 2);

    sqlx::query("DELETE FROM tasks").execute(&pool).await.ok();
}

#[tokio::test]
async fn test_queue_failed_task_requeues_then_parks() {
    skip_if_no_db!();
    let _serial = QUEUE_TEST_LOCK.lock().await;
    let pool = get_pool().await.expect("Failed to connect to database");
    sqlx::query("DELETE FROM tasks").execute(&pool).await.ok();

    let deploy_id = Uuid::new_v4();
    let task_id = queue::enqueue_task(&pool, TaskKind::Deploy { deploy_id })
        .await
        .expect("Failed to enqueue");

    // First delivery fails below the ceiling: back to pending.
    let task = queue::claim_task(&pool, Duration::from_secs(900))
        .await
        .expect("Failed to claim")
        .expect("Expected a claimable task");
    queue::fail_task(&pool, task.task_id, "image build failed", 2)
        .await
        .expect("Failed to fail task");
    let (status,): (String,) = sqlx::query_as("SELECT status FROM tasks WHERE task_id = $1")
        .bind(task_id)
        .fetch_one(&pool)
        .await
        .expect("Failed to fetch task");
    assert_eq!(status, "pending");

    // Second delivery reaches the ceiling: parked as failed.
    let task = queue::claim_task(&pool, Duration::from_secs(900))
        .await
        .expect("Failed to claim")
        .expect("Expected a claimable task");
    assert_eq!(task.attempts, 2);
    queue::fail_task(&pool, task.task_id, "image build failed", 2)
        .await
        .expect("Failed to fail task");

    let (status, last_error): (String, Option<String>) =
        sqlx::query_as("SELECT status, last_error FROM tasks WHERE task_id = $1")
            .bind(task_id)
            .fetch_one(&pool)
            .await
            .expect("Failed to fetch task");
    assert_eq!(status, "failed");
    assert_eq!(last_error.as_deref(), Some("image build failed"));
    assert!(queue::claim_task(&pool, Duration::from_secs(900))
        .await
        .expect("Failed to claim")
        .is_none());

    sqlx::query("DELETE FROM tasks").execute(&pool).await.ok();
}
