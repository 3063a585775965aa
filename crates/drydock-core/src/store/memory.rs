// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory store for unit and integration tests.
//!
//! Row locks are emulated with one async mutex per service; the lock handle
//! owns the guard, so the row stays exclusive until the handle is consumed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use super::{DeployRecord, PlanLimits, ServiceRecord, ServiceRowLock, Store};
use crate::error::CoreError;
use crate::status::ServiceStatus;

#[derive(Default)]
struct Inner {
    services: HashMap<Uuid, ServiceRecord>,
    deploys: HashMap<Uuid, DeployRecord>,
    plans: HashMap<Uuid, PlanLimits>,
    row_locks: HashMap<Uuid, Arc<Mutex<()>>>,
}

/// In-memory [`Store`] implementation used by tests.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<StdMutex<Inner>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Insert or replace a service row.
    pub fn put_service(&self, service: ServiceRecord) {
        let mut inner = self.state();
        inner
            .row_locks
            .entry(service.service_id)
            .or_insert_with(|| Arc::new(Mutex::new(())));
        inner.services.insert(service.service_id, service);
    }

    /// Insert or replace a deploy row.
    pub fn put_deploy(&self, deploy: DeployRecord) {
        self.state().deploys.insert(deploy.deploy_id, deploy);
    }

    /// Insert or replace a plan row.
    pub fn put_plan(&self, plan_id: Uuid, limits: PlanLimits) {
        self.state().plans.insert(plan_id, limits);
    }

    /// Current status of a service, if it exists.
    pub fn service_status(&self, service_id: Uuid) -> Option<ServiceStatus> {
        self.state().services.get(&service_id).map(|s| s.status)
    }

    /// Snapshot of a deploy row, if it exists.
    pub fn deploy(&self, deploy_id: Uuid) -> Option<DeployRecord> {
        self.state().deploys.get(&deploy_id).cloned()
    }

    fn row_lock(&self, service_id: Uuid) -> Option<Arc<Mutex<()>>> {
        let inner = self.state();
        if !inner.services.contains_key(&service_id) {
            return None;
        }
        inner.row_locks.get(&service_id).cloned()
    }
}

struct MemoryServiceLock {
    store: MemoryStore,
    service: ServiceRecord,
    _guard: OwnedMutexGuard<()>,
}

#[async_trait]
impl ServiceRowLock for MemoryServiceLock {
    fn service(&self) -> &ServiceRecord {
        &self.service
    }

    async fn set_status(self: Box<Self>, status: ServiceStatus) -> Result<(), CoreError> {
        let mut inner = self.store.state();
        let service = inner
            .services
            .get_mut(&self.service.service_id)
            .ok_or_else(|| CoreError::NotFound {
                entity: "service",
                id: self.service.service_id.to_string(),
            })?;
        service.status = status;
        service.updated_at = Utc::now();
        Ok(())
    }

    async fn commit_deploy_success(
        self: Box<Self>,
        deploy_id: Uuid,
        started_at: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        let mut inner = self.store.state();

        let service = inner
            .services
            .get_mut(&self.service.service_id)
            .ok_or_else(|| CoreError::NotFound {
                entity: "service",
                id: self.service.service_id.to_string(),
            })?;
        service.status = ServiceStatus::Succeeded;
        service.selected_deploy = Some(deploy_id);
        service.updated_at = Utc::now();
        let service_id = service.service_id;

        for deploy in inner.deploys.values_mut() {
            if deploy.service_id == service_id && deploy.deploy_id != deploy_id {
                deploy.running = false;
            }
        }
        let deploy = inner
            .deploys
            .get_mut(&deploy_id)
            .ok_or_else(|| CoreError::NotFound {
                entity: "deploy",
                id: deploy_id.to_string(),
            })?;
        deploy.running = true;
        deploy.started_at = Some(started_at);
        Ok(())
    }

    async fn release(self: Box<Self>) -> Result<(), CoreError> {
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn deploy_by_id(&self, deploy_id: Uuid) -> Result<Option<DeployRecord>, CoreError> {
        Ok(self.state().deploys.get(&deploy_id).cloned())
    }

    async fn service_for_deploy(
        &self,
        deploy_id: Uuid,
    ) -> Result<Option<ServiceRecord>, CoreError> {
        let inner = self.state();
        let service_id = match inner.deploys.get(&deploy_id) {
            Some(deploy) => deploy.service_id,
            None => return Ok(None),
        };
        Ok(inner.services.get(&service_id).cloned())
    }

    async fn service_by_id(&self, service_id: Uuid) -> Result<Option<ServiceRecord>, CoreError> {
        Ok(self.state().services.get(&service_id).cloned())
    }

    async fn plan_limits(&self, plan_id: Uuid) -> Result<Option<PlanLimits>, CoreError> {
        Ok(self.state().plans.get(&plan_id).cloned())
    }

    async fn lock_service_row(
        &self,
        service_id: Uuid,
    ) -> Result<Option<Box<dyn ServiceRowLock>>, CoreError> {
        let lock = match self.row_lock(service_id) {
            Some(lock) => lock,
            None => return Ok(None),
        };
        let guard = lock.lock_owned().await;
        // Re-read under the guard: the row may have changed while we waited.
        let service = match self.state().services.get(&service_id) {
            Some(service) => service.clone(),
            None => return Ok(None),
        };
        Ok(Some(Box::new(MemoryServiceLock {
            store: self.clone(),
            service,
            _guard: guard,
        })))
    }

    async fn services_with_status(
        &self,
        statuses: &[ServiceStatus],
    ) -> Result<Vec<ServiceRecord>, CoreError> {
        let inner = self.state();
        let mut services: Vec<ServiceRecord> = inner
            .services
            .values()
            .filter(|s| statuses.contains(&s.status))
            .cloned()
            .collect();
        services.sort_by_key(|s| s.created_at);
        Ok(services)
    }
}
