// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Deployment orchestration.
//!
//! The orchestrator has two faces. The request surface (`request_deploy`,
//! `request_stop`, `remove_service`) runs in API context: it validates the
//! status transition under the service row lock, commits the new status, and
//! only then enqueues the task, so a queued task always finds its status
//! already written. The task surface (`run_deploy`, `run_stop`) runs in
//! worker context and owns the long operations: build, container lifecycle,
//! rollback. Task bodies return `Ok` for every terminal outcome, including
//! a failed deploy that was rolled back; an `Err` means infrastructure
//! trouble and asks the queue for a re-delivery.

use std::sync::Arc;

use chrono::Utc;
use drydock_core::{
    CoreError, DeployRecord, ServiceRecord, ServiceStatus, Store, TaskKind, TaskQueue,
};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::archive::BuildContext;
use crate::config::Config;
use crate::container::ContainerManager;
use crate::detect::detect_entrypoint;
use crate::error::{Error, Result};
use crate::image::ImageManager;
use crate::network::NetworkManager;
use crate::proxy::ProxyIntegrator;
use crate::runtime::{ContainerRuntime, ContainerSpec};

/// Runtime-facing name for a service. Used both as the container name and
/// as the image repository, so everything a service owns in the daemon can
/// be found from its prefix and service name alone.
pub fn container_name(prefix: &str, service_name: &str) -> String {
    format!("{prefix}-{service_name}")
}

/// Coordinates persistence, the task queue, and the container runtime.
pub struct Orchestrator {
    store: Arc<dyn Store>,
    queue: Arc<dyn TaskQueue>,
    images: ImageManager,
    containers: ContainerManager,
    networks: NetworkManager,
    proxy: ProxyIntegrator,
    config: Config,
}

impl Orchestrator {
    /// Wire an orchestrator over the given store, queue, and runtime.
    pub fn new(
        store: Arc<dyn Store>,
        queue: Arc<dyn TaskQueue>,
        runtime: Arc<dyn ContainerRuntime>,
        config: Config,
    ) -> Self {
        let images = ImageManager::new(runtime.clone(), config.max_context_bytes);
        let containers =
            ContainerManager::new(runtime.clone()).with_poll_interval(config.poll_interval);
        let networks = NetworkManager::new(runtime.clone());
        let proxy = ProxyIntegrator::new(runtime, &config);
        Self {
            store,
            queue,
            images,
            containers,
            networks,
            proxy,
            config,
        }
    }

    /// Queue a deployment of `deploy_id`.
    ///
    /// Rejected with a status conflict while another deploy or stop is in
    /// flight for the owning service. The status moves to `queued` and
    /// commits before the task is enqueued; a crash between the two leaves
    /// a queued service the operator can re-request, never a task racing a
    /// stale status.
    #[instrument(skip(self), fields(deploy_id = %deploy_id))]
    pub async fn request_deploy(&self, deploy_id: Uuid) -> Result<Uuid> {
        let deploy = self
            .store
            .deploy_by_id(deploy_id)
            .await?
            .ok_or_else(|| CoreError::NotFound {
                entity: "deploy",
                id: deploy_id.to_string(),
            })?;

        let lock = self
            .store
            .lock_service_row(deploy.service_id)
            .await?
            .ok_or_else(|| CoreError::NotFound {
                entity: "service",
                id: deploy.service_id.to_string(),
            })?;

        let service = lock.service().clone();
        if !service.status.can_queue() {
            lock.release().await?;
            return Err(CoreError::StatusConflict {
                service_id: service.service_id.to_string(),
                status: service.status.to_string(),
            }
            .into());
        }

        lock.set_status(ServiceStatus::Queued).await?;
        let task_id = self.queue.enqueue(TaskKind::Deploy { deploy_id }).await?;
        info!(service_id = %service.service_id, %task_id, "Deployment queued");
        Ok(task_id)
    }

    /// Queue a stop of `service_id`.
    ///
    /// Stopping an already stopped service is a no-op and returns `None`.
    /// Rejected with a status conflict while a deploy or stop is in flight.
    #[instrument(skip(self), fields(service_id = %service_id))]
    pub async fn request_stop(&self, service_id: Uuid) -> Result<Option<Uuid>> {
        let lock = self
            .store
            .lock_service_row(service_id)
            .await?
            .ok_or_else(|| CoreError::NotFound {
                entity: "service",
                id: service_id.to_string(),
            })?;

        let status = lock.service().status;
        if status == ServiceStatus::Stopped {
            lock.release().await?;
            debug!("Service already stopped");
            return Ok(None);
        }
        if !status.can_stop() {
            lock.release().await?;
            return Err(CoreError::StatusConflict {
                service_id: service_id.to_string(),
                status: status.to_string(),
            }
            .into());
        }

        lock.set_status(ServiceStatus::Stopping).await?;
        let task_id = self.queue.enqueue(TaskKind::Stop { service_id }).await?;
        info!(%task_id, "Stop queued");
        Ok(Some(task_id))
    }

    /// Tear down the runtime footprint of a service: its container, every
    /// image in its repository, and its published route.
    ///
    /// Rejected while a deploy or stop is in flight. The teardown itself
    /// runs outside the row lock and is best-effort: each step logs its
    /// failure and moves on, so a half-removed service can be removed again.
    #[instrument(skip(self), fields(service_id = %service_id))]
    pub async fn remove_service(&self, service_id: Uuid) -> Result<()> {
        let lock = self
            .store
            .lock_service_row(service_id)
            .await?
            .ok_or_else(|| CoreError::NotFound {
                entity: "service",
                id: service_id.to_string(),
            })?;

        let service = lock.service().clone();
        if service.status.is_gate() {
            lock.release().await?;
            return Err(CoreError::StatusConflict {
                service_id: service_id.to_string(),
                status: service.status.to_string(),
            }
            .into());
        }
        lock.release().await?;

        let name = container_name(&self.config.container_prefix, &service.name);
        if let Err(err) = self.containers.stop(&name, self.config.stop_timeout).await {
            warn!(container = %name, error = %err, "Stop failed during service removal");
        }
        if let Err(err) = self.containers.remove(&name).await {
            warn!(container = %name, error = %err, "Container removal failed during service removal");
        }
        match self.images.remove_all(&name, &[]).await {
            Ok(stats) if stats.failed > 0 => {
                warn!(container = %name, failed = stats.failed, "Some images survived service removal");
            }
            Ok(_) => {}
            Err(err) => warn!(container = %name, error = %err, "Image removal failed during service removal"),
        }
        if let Err(err) = self.proxy.retract_route(&name).await {
            warn!(container = %name, error = %err, "Route retraction failed during service removal");
        }
        info!(service = %service.name, "Service runtime footprint removed");
        Ok(())
    }

    /// Execute a queued deployment.
    ///
    /// A task whose deploy or service vanished, or whose service status
    /// moved on since queueing, completes silently. Build or launch errors
    /// roll back every artifact of the attempt and mark the service
    /// `failed`; the previously running deploy is already gone at that
    /// point, by design an all-or-nothing replacement, not a blue-green
    /// switch.
    #[instrument(skip(self), fields(deploy_id = %deploy_id))]
    pub async fn run_deploy(&self, deploy_id: Uuid) -> Result<()> {
        let Some(deploy) = self.store.deploy_by_id(deploy_id).await? else {
            warn!("Deploy vanished before execution");
            return Ok(());
        };
        let Some(service) = self.store.service_for_deploy(deploy_id).await? else {
            warn!("Service vanished before execution");
            return Ok(());
        };
        let Some(lock) = self.store.lock_service_row(service.service_id).await? else {
            warn!("Service vanished before execution");
            return Ok(());
        };
        if lock.service().status != ServiceStatus::Queued {
            debug!(status = %lock.service().status, "Deploy task superseded, skipping");
            lock.release().await?;
            return Ok(());
        }
        // Long operations run outside the lock; `deploying` is a gate no
        // request surface can move, so the row stays ours.
        lock.set_status(ServiceStatus::Deploying).await?;

        let name = container_name(&self.config.container_prefix, &service.name);
        match self.execute_deploy(&deploy, &service, &name).await {
            Ok(()) => match self.store.lock_service_row(service.service_id).await? {
                Some(lock) => {
                    lock.commit_deploy_success(deploy_id, Utc::now()).await?;
                    info!(
                        service = %service.name,
                        version = %deploy.version_tag(),
                        "Deployment succeeded"
                    );
                }
                None => warn!("Service vanished after successful deploy"),
            },
            Err(err) => {
                error!(service = %service.name, error = %err, "Deployment failed, rolling back");
                self.rollback_deploy(&name).await;
                if let Some(lock) = self.store.lock_service_row(service.service_id).await? {
                    lock.set_status(ServiceStatus::Failed).await?;
                }
            }
        }

        if let Err(err) = self.images.prune_dangling().await {
            warn!(error = %err, "Dangling image prune failed");
        }
        Ok(())
    }

    /// The fallible middle of a deploy: archive to image to running
    /// container. The caller owns rollback and status bookkeeping.
    async fn execute_deploy(
        &self,
        deploy: &DeployRecord,
        service: &ServiceRecord,
        name: &str,
    ) -> Result<()> {
        let plan = self
            .store
            .plan_limits(service.plan_id)
            .await?
            .ok_or_else(|| CoreError::NotFound {
                entity: "plan",
                id: service.plan_id.to_string(),
            })?;
        let deploy_config = deploy.parsed_config();

        let archive_path = deploy
            .archive_path
            .clone()
            .ok_or_else(|| CoreError::ValidationError {
                field: "archive_path".to_string(),
                message: "deploy has no archive to build from".to_string(),
            })?;

        let max_archive = self.config.max_archive_bytes;
        let max_context = self.config.max_context_bytes;
        let context = tokio::task::spawn_blocking(move || {
            BuildContext::from_zip_path(archive_path, max_archive, max_context)
        })
        .await
        .map_err(|err| Error::Other(format!("Archive conversion task failed: {err}")))??;

        let entrypoint = detect_entrypoint(&context, plan.platform)?;
        if plan.platform.requires_detection() && entrypoint.is_none() {
            return Err(CoreError::ValidationError {
                field: "entrypoint".to_string(),
                message: "no application entrypoint could be detected".to_string(),
            }
            .into());
        }

        let port = deploy_config
            .port
            .unwrap_or_else(|| plan.platform.default_port());
        let dockerfile = plan.platform.dockerfile(entrypoint.as_ref(), port)?;

        let image = self
            .images
            .build(name, &deploy.version_tag(), dockerfile.as_deref(), context)
            .await?;

        if let Some(network) = service.network_name.as_deref() {
            self.networks.ensure_exists(network, "bridge").await?;
        }

        // All-or-nothing: the old container goes before the new one starts.
        if self.containers.exists(name).await? {
            info!(container = %name, "Displacing previous container");
            self.containers.stop(name, self.config.stop_timeout).await?;
            self.containers.remove(name).await?;
        }

        let binds = deploy_config
            .volumes
            .iter()
            .map(|volume| volume.bind_spec())
            .collect();
        // The application reads its listen port from the environment.
        let mut env = deploy_config.env;
        env.insert("PORT".to_string(), port.to_string());
        let spec = ContainerSpec {
            name: name.to_string(),
            image,
            env,
            labels: self.proxy.route_labels(name, port),
            binds,
            network: service.network_name.clone(),
            target_port: port,
            max_cpu: plan.max_cpu,
            memory_mb: plan.max_ram_mb,
            read_only_rootfs: self.config.read_only_rootfs,
        };
        self.containers.create(&spec).await?;
        self.containers.start(name).await?;

        if let Err(err) = self.proxy.connect_to_ingress(name).await {
            warn!(container = %name, error = %err, "Ingress attach failed, service stays unrouted");
        }

        self.containers
            .wait_running(name, self.config.liveness_timeout)
            .await?;
        Ok(())
    }

    /// Remove everything a failed deploy may have created: the container,
    /// every image in the service repository, and the published route.
    /// Every step is best-effort; rollback must never mask the failure that
    /// triggered it.
    async fn rollback_deploy(&self, name: &str) {
        if let Err(err) = self.containers.stop(name, self.config.stop_timeout).await {
            warn!(container = %name, error = %err, "Rollback stop failed");
        }
        if let Err(err) = self.containers.remove(name).await {
            warn!(container = %name, error = %err, "Rollback container removal failed");
        }
        match self.images.remove_all(name, &[]).await {
            Ok(stats) if stats.failed > 0 => {
                warn!(container = %name, failed = stats.failed, "Rollback left images behind");
            }
            Ok(_) => {}
            Err(err) => warn!(container = %name, error = %err, "Rollback image removal failed"),
        }
        if let Err(err) = self.proxy.retract_route(name).await {
            warn!(container = %name, error = %err, "Rollback route retraction failed");
        }
    }

    /// Execute a queued stop.
    ///
    /// The container gets a graceful stop first; one that outlives the stop
    /// timeout is removed by force. The status is re-checked under the lock
    /// before `stopped` is written, in case the service was re-queued while
    /// the container was going down.
    #[instrument(skip(self), fields(service_id = %service_id))]
    pub async fn run_stop(&self, service_id: Uuid) -> Result<()> {
        let Some(lock) = self.store.lock_service_row(service_id).await? else {
            warn!("Service vanished before stop");
            return Ok(());
        };
        if lock.service().status != ServiceStatus::Stopping {
            debug!(status = %lock.service().status, "Stop task superseded, skipping");
            lock.release().await?;
            return Ok(());
        }
        let service = lock.service().clone();
        lock.release().await?;

        let name = container_name(&self.config.container_prefix, &service.name);
        match self.containers.stop(&name, self.config.stop_timeout).await {
            Ok(()) => {}
            Err(Error::Timeout { .. }) => {
                warn!(container = %name, "Container ignored its stop, removing by force");
                self.containers.remove(&name).await?;
            }
            Err(err) => return Err(err),
        }

        let Some(lock) = self.store.lock_service_row(service_id).await? else {
            warn!("Service vanished while stopping");
            return Ok(());
        };
        if lock.service().status == ServiceStatus::Stopping {
            lock.set_status(ServiceStatus::Stopped).await?;
            info!(service = %service.name, "Service stopped");
        } else {
            debug!(status = %lock.service().status, "Status moved on while stopping");
            lock.release().await?;
        }
        Ok(())
    }
}
