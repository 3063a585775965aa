// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Engine assembly: wire the collaborators, spawn the loops, own shutdown.

use std::sync::Arc;

use drydock_core::{Store, TaskQueue};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::monitor::ReconciliationMonitor;
use crate::orchestrator::Orchestrator;
use crate::runtime::ContainerRuntime;
use crate::worker::TaskWorker;

/// Builder collecting the engine's collaborators.
#[derive(Default)]
pub struct EngineBuilder {
    store: Option<Arc<dyn Store>>,
    queue: Option<Arc<dyn TaskQueue>>,
    runtime: Option<Arc<dyn ContainerRuntime>>,
    config: Option<Config>,
}

impl EngineBuilder {
    /// Set the persistence store.
    pub fn store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the task queue.
    pub fn queue(mut self, queue: Arc<dyn TaskQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Set the container runtime.
    pub fn runtime(mut self, runtime: Arc<dyn ContainerRuntime>) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Set the engine configuration.
    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Assemble the engine. Fails when a collaborator is missing.
    pub fn build(self) -> Result<Engine> {
        let store = self
            .store
            .ok_or_else(|| Error::Other("engine requires a store".to_string()))?;
        let queue = self
            .queue
            .ok_or_else(|| Error::Other("engine requires a task queue".to_string()))?;
        let runtime = self
            .runtime
            .ok_or_else(|| Error::Other("engine requires a container runtime".to_string()))?;
        let config = self
            .config
            .ok_or_else(|| Error::Other("engine requires a configuration".to_string()))?;
        Ok(Engine {
            store,
            queue,
            runtime,
            config,
        })
    }
}

/// The deployment engine, assembled but not yet running.
pub struct Engine {
    store: Arc<dyn Store>,
    queue: Arc<dyn TaskQueue>,
    runtime: Arc<dyn ContainerRuntime>,
    config: Config,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Start collecting collaborators for an engine.
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    /// Spawn the worker pool and the reconciliation monitor.
    pub fn start(self) -> RunningEngine {
        let orchestrator = Arc::new(Orchestrator::new(
            self.store.clone(),
            self.queue.clone(),
            self.runtime.clone(),
            self.config.clone(),
        ));

        let mut handles = Vec::with_capacity(self.config.workers + 1);
        let mut shutdowns = Vec::with_capacity(self.config.workers + 1);

        for id in 0..self.config.workers {
            let worker =
                TaskWorker::new(id, self.queue.clone(), orchestrator.clone(), &self.config);
            shutdowns.push(worker.shutdown_handle());
            handles.push(tokio::spawn(async move { worker.run().await }));
        }

        let monitor =
            ReconciliationMonitor::new(self.store.clone(), self.runtime.clone(), &self.config);
        shutdowns.push(monitor.shutdown_handle());
        handles.push(tokio::spawn(async move { monitor.run().await }));

        info!(workers = self.config.workers, "Engine started");
        RunningEngine {
            orchestrator,
            handles,
            shutdowns,
        }
    }
}

/// Handle over a started engine.
pub struct RunningEngine {
    orchestrator: Arc<Orchestrator>,
    handles: Vec<JoinHandle<()>>,
    shutdowns: Vec<Arc<Notify>>,
}

impl RunningEngine {
    /// The request surface of the running engine, for callers that queue
    /// deployments and stops.
    pub fn orchestrator(&self) -> Arc<Orchestrator> {
        self.orchestrator.clone()
    }

    /// Signal every loop and wait for them to finish. A task already
    /// claimed by a worker runs to completion first.
    pub async fn shutdown(self) {
        info!("Engine shutting down");
        for shutdown in &self.shutdowns {
            shutdown.notify_one();
        }
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Engine loop panicked");
            }
        }
        info!("Engine stopped");
    }
}
