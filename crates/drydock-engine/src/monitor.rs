// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background reconciliation between recorded status and runtime truth.
//!
//! Containers die outside the engine (OOM kills, daemon restarts) and get
//! resurrected outside it too (a manual start on the host). The monitor
//! periodically sweeps every service in a settled status and folds the
//! runtime truth back into the record: a running container under a `stopped`
//! service makes it `succeeded`, a dead or missing container under a
//! `succeeded` service makes it `failed`. Services in a gate status are left
//! alone; their task owns them.

use std::sync::Arc;
use std::time::Duration;

use drydock_core::{ServiceRecord, ServiceStatus, Store};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::container::ContainerManager;
use crate::error::Result;
use crate::orchestrator::container_name;
use crate::runtime::ContainerRuntime;

/// Background worker that corrects status drift.
pub struct ReconciliationMonitor {
    store: Arc<dyn Store>,
    containers: ContainerManager,
    container_prefix: String,
    interval: Duration,
    shutdown: Arc<Notify>,
}

impl ReconciliationMonitor {
    /// Create a monitor over the given store and runtime.
    pub fn new(
        store: Arc<dyn Store>,
        runtime: Arc<dyn ContainerRuntime>,
        config: &Config,
    ) -> Self {
        Self {
            store,
            containers: ContainerManager::new(runtime).with_poll_interval(config.poll_interval),
            container_prefix: config.container_prefix.clone(),
            interval: config.reconcile_interval,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the reconciliation loop.
    ///
    /// The loop exits when the shutdown signal is received.
    pub async fn run(&self) {
        info!(
            interval_secs = self.interval.as_secs(),
            "Reconciliation monitor started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Reconciliation monitor received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.interval) => {
                    if let Err(e) = self.sweep().await {
                        warn!(error = %e, "Reconciliation sweep failed");
                    }
                }
            }
        }

        info!("Reconciliation monitor stopped");
    }

    /// One pass over every settled service, returning the number of
    /// corrected rows. Per-service errors are logged and do not abort the
    /// rest of the sweep.
    pub async fn sweep(&self) -> Result<u64> {
        let services = self
            .store
            .services_with_status(&[ServiceStatus::Succeeded, ServiceStatus::Stopped])
            .await?;

        let mut corrected = 0u64;
        let mut errors = 0u64;
        for service in services {
            match self.reconcile(&service).await {
                Ok(true) => corrected += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(service = %service.name, error = %e, "Failed to reconcile service");
                    errors += 1;
                }
            }
        }

        if corrected > 0 || errors > 0 {
            info!(corrected, errors, "Reconciliation sweep completed");
        } else {
            debug!("Reconciliation sweep completed, no drift found");
        }
        Ok(corrected)
    }

    /// Compare one service's recorded status against its container and
    /// correct the record when they disagree. Returns whether a correction
    /// was written.
    async fn reconcile(&self, service: &ServiceRecord) -> Result<bool> {
        let name = container_name(&self.container_prefix, &service.name);
        let running = self.containers.is_running(&name).await?;
        let target = match (service.status, running) {
            (ServiceStatus::Stopped, true) => ServiceStatus::Succeeded,
            (ServiceStatus::Succeeded, false) => ServiceStatus::Failed,
            _ => return Ok(false),
        };

        // The sweep read the row without a lock; re-check before writing so
        // a deploy or stop that slipped in keeps its status.
        let Some(lock) = self.store.lock_service_row(service.service_id).await? else {
            return Ok(false);
        };
        if lock.service().status != service.status {
            debug!(service = %service.name, "Status changed mid-sweep, skipping");
            lock.release().await?;
            return Ok(false);
        }
        lock.set_status(target).await?;
        info!(
            service = %service.name,
            from = %service.status,
            to = %target,
            "Corrected service status"
        );
        Ok(true)
    }
}
